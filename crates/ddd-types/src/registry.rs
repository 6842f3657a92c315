//! # Registries
//!
//! Explicit maps from wire class keys to concrete types.
//!
//! - [`MessageRegistry`]: `"domain.TypeName"` → [`MessageDescriptor`], used to
//!   decode COMMAND/EVENT bodies from their routing key.
//! - [`ErrorRegistry`]: `"namespace.ErrorName"` and `(namespace, code)` →
//!   [`ErrorClass`], used to decode ERROR bodies from the object key header.
//!
//! Both fail fast on conflicting registrations so copy-paste mistakes surface
//! at startup rather than on live traffic.

use crate::domain_error::{ErrorClass, INCOMING_MESSAGE_ERROR, INTERNAL_SERVICE_ERROR};
use crate::errors::RegistryError;
use crate::message::{DomainMessage, DomainPayload, Message, MessageKind, TypeKey};
use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

type DecodeFn = fn(&[u8]) -> Result<DomainMessage, serde_json::Error>;

fn decode_as<T: DomainPayload>(body: &[u8]) -> Result<DomainMessage, serde_json::Error> {
    Message::<T>::loads(body).map(DomainMessage::from)
}

/// Everything the bus needs to know about a registered message type.
#[derive(Debug, Clone, Copy)]
pub struct MessageDescriptor {
    pub domain: &'static str,
    pub name: &'static str,
    pub kind: MessageKind,
    type_id: TypeId,
    decode: DecodeFn,
}

impl MessageDescriptor {
    pub fn of<T: DomainPayload>() -> Self {
        Self {
            domain: T::DOMAIN,
            name: T::NAME,
            kind: T::KIND,
            type_id: TypeId::of::<T>(),
            decode: decode_as::<T>,
        }
    }

    pub fn class_key(&self) -> String {
        format!("{}.{}", self.domain, self.name)
    }

    pub fn type_key(&self) -> TypeKey {
        TypeKey::new(self.domain, self.name)
    }

    /// Parses a wire body into a message of this type.
    pub fn decode(&self, body: &[u8]) -> Result<DomainMessage, serde_json::Error> {
        (self.decode)(body)
    }
}

// =============================================================================
// MESSAGE REGISTRY
// =============================================================================

/// Registered command and event types, keyed by class key.
#[derive(Debug, Clone, Default)]
pub struct MessageRegistry {
    classes: BTreeMap<String, MessageDescriptor>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T`. Fails if its class key is already taken, even by `T`.
    pub fn register<T: DomainPayload>(&mut self) -> Result<(), RegistryError> {
        let key = T::class_key();
        if self.classes.contains_key(&key) {
            return Err(RegistryError::DuplicateRegistration { key });
        }
        debug!(class_key = %key, kind = %T::KIND, "Registered message class");
        self.classes.insert(key, MessageDescriptor::of::<T>());
        Ok(())
    }

    /// Registers `T` unless it is already registered.
    ///
    /// Still fails when a *different* type claims the same class key.
    pub fn ensure<T: DomainPayload>(&mut self) -> Result<(), RegistryError> {
        match self.classes.get(&T::class_key()) {
            Some(existing) if existing.type_id == TypeId::of::<T>() => Ok(()),
            _ => self.register::<T>(),
        }
    }

    pub fn resolve(&self, domain: &str, name: &str) -> Result<&MessageDescriptor, RegistryError> {
        self.resolve_key(&format!("{domain}.{name}"))
    }

    pub fn resolve_key(&self, class_key: &str) -> Result<&MessageDescriptor, RegistryError> {
        self.classes
            .get(class_key)
            .ok_or_else(|| RegistryError::UnregisteredClass {
                key: class_key.to_string(),
            })
    }

    pub fn contains<T: DomainPayload>(&self) -> bool {
        self.classes
            .get(&T::class_key())
            .is_some_and(|existing| existing.type_id == TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

// =============================================================================
// ERROR REGISTRY
// =============================================================================

/// Registered error classes.
///
/// The bus's own service errors are always present.
#[derive(Debug, Clone)]
pub struct ErrorRegistry {
    by_key: HashMap<String, ErrorClass>,
    by_code: HashMap<(String, String), ErrorClass>,
}

impl Default for ErrorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            by_key: HashMap::new(),
            by_code: HashMap::new(),
        };
        for class in [INTERNAL_SERVICE_ERROR, INCOMING_MESSAGE_ERROR] {
            registry.insert(class);
        }
        registry
    }

    fn insert(&mut self, class: ErrorClass) {
        self.by_key.insert(class.class_key(), class);
        self.by_code
            .insert((class.namespace.to_string(), class.code.to_string()), class);
    }

    /// Registers `class`. Re-registering the identical class is a no-op;
    /// a different class reusing its key or `(namespace, code)` fails.
    pub fn register(&mut self, class: ErrorClass) -> Result<(), RegistryError> {
        let key = class.class_key();
        let code_key = (class.namespace.to_string(), class.code.to_string());

        match (self.by_key.get(&key), self.by_code.get(&code_key)) {
            (Some(existing), _) if *existing == class => return Ok(()),
            (Some(_), _) => return Err(RegistryError::DuplicateRegistration { key }),
            (None, Some(existing)) => {
                return Err(RegistryError::DuplicateRegistration {
                    key: format!("{}:{} ({})", class.namespace, class.code, existing.name),
                })
            }
            (None, None) => {}
        }

        debug!(class_key = %key, code = class.code, "Registered error class");
        self.insert(class);
        Ok(())
    }

    /// Looks up a class by its `"namespace.Name"` key.
    pub fn resolve_key(&self, class_key: &str) -> Result<ErrorClass, RegistryError> {
        self.by_key
            .get(class_key)
            .copied()
            .ok_or_else(|| RegistryError::UnregisteredClass {
                key: class_key.to_string(),
            })
    }

    /// Looks up a class by namespace and code.
    pub fn get_error_class(&self, domain: &str, code: &str) -> Result<ErrorClass, RegistryError> {
        self.by_code
            .get(&(domain.to_string(), code.to_string()))
            .copied()
            .ok_or_else(|| RegistryError::UnregisteredClass {
                key: format!("{domain}:{code}"),
            })
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
