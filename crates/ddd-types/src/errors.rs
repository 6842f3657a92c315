//! # Error Types
//!
//! Registration and lookup failures shared by the message and error registries.

use thiserror::Error;

/// Errors raised by [`crate::MessageRegistry`] and [`crate::ErrorRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The class key is already claimed by a different type.
    #[error("Duplicate registration: {key} is already registered")]
    DuplicateRegistration { key: String },

    /// No type is registered under the class key.
    #[error("Unregistered class: {key}")]
    UnregisteredClass { key: String },
}
