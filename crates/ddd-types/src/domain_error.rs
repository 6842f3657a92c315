//! # Domain Errors
//!
//! Typed failures that travel back to a caller in place of a
//! [`CommandResponse`](crate::CommandResponse).
//!
//! An [`ErrorClass`] is the static description of one failure type: its
//! namespace (the owning domain, or [`SERVICE_NAMESPACE`] for bus-level
//! failures), name, code and message template. Building a class produces a
//! [`DomainError`] value, which is what crosses the wire:
//!
//! ```text
//! {"reference": "<command uuid>", "timestamp": 1718000000.5,
//!  "domain": "billing", "code": "0102",
//!  "message": "Insufficient funds: 10 requested",
//!  "data": {"requested": "10"}}
//! ```

use crate::message::now_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Namespace of errors raised by the bus itself rather than a domain.
/// Errors in this namespace carry no domain.
pub const SERVICE_NAMESPACE: &str = "__ddd_service__";

/// A handler failed with something other than a declared domain error.
pub const INTERNAL_SERVICE_ERROR: ErrorClass = ErrorClass::new(
    SERVICE_NAMESPACE,
    "InternalServiceError",
    "01",
    "Internal service error",
);

/// An inbound message could not be decoded or dispatched.
pub const INCOMING_MESSAGE_ERROR: ErrorClass = ErrorClass::new(
    SERVICE_NAMESPACE,
    "IncomingMessageError",
    "02",
    "Incoming message could not be processed: {reason}",
);

/// Static description of an error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorClass {
    /// Owning domain, or [`SERVICE_NAMESPACE`].
    pub namespace: &'static str,
    pub name: &'static str,
    /// Group + specific id, e.g. `"0102"`.
    pub code: &'static str,
    /// Message template; `{key}` is replaced by `extra[key]`.
    pub template: &'static str,
}

impl ErrorClass {
    pub const fn new(
        namespace: &'static str,
        name: &'static str,
        code: &'static str,
        template: &'static str,
    ) -> Self {
        Self {
            namespace,
            name,
            code,
            template,
        }
    }

    /// `"{namespace}.{name}"`, sent in the object key header.
    pub fn class_key(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    pub fn is_service(&self) -> bool {
        self.namespace == SERVICE_NAMESPACE
    }

    /// Domain recorded on errors of this class.
    pub fn domain(&self) -> Option<&'static str> {
        (!self.is_service()).then_some(self.namespace)
    }

    /// Builds an error with no extra data.
    pub fn raise(&self) -> DomainError {
        self.with_extra(std::iter::empty::<(String, String)>())
    }

    /// Builds an error, rendering the template with `extra`.
    pub fn with_extra<K, V>(&self, extra: impl IntoIterator<Item = (K, V)>) -> DomainError
    where
        K: Into<String>,
        V: Into<String>,
    {
        let extra: BTreeMap<String, String> = extra
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        DomainError {
            reference: Uuid::new_v4(),
            domain: self.domain().map(str::to_string),
            name: self.name.to_string(),
            code: self.code.to_string(),
            message: render_template(self.template, &extra),
            extra,
            timestamp: now_timestamp(),
        }
    }
}

fn render_template(template: &str, extra: &BTreeMap<String, String>) -> String {
    extra.iter().fold(template.to_string(), |message, (key, value)| {
        message.replace(&format!("{{{key}}}"), value)
    })
}

/// A typed failure returned in place of a command response.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainError {
    /// Reference of the command that failed, once stamped by the bus.
    pub reference: Uuid,
    /// Owning domain; `None` for service-level errors.
    pub domain: Option<String>,
    pub name: String,
    pub code: String,
    pub message: String,
    pub extra: BTreeMap<String, String>,
    pub timestamp: f64,
}

#[derive(Serialize, Deserialize)]
struct ErrorBody {
    reference: Uuid,
    timestamp: f64,
    domain: Option<String>,
    code: String,
    message: String,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

impl DomainError {
    /// Same error re-keyed to the command that raised it.
    #[must_use]
    pub fn with_reference(mut self, reference: Uuid) -> Self {
        self.reference = reference;
        self
    }

    /// `"{domain}.{name}"`, or the service namespace for domain-less errors.
    pub fn class_key(&self) -> String {
        format!(
            "{}.{}",
            self.domain.as_deref().unwrap_or(SERVICE_NAMESPACE),
            self.name
        )
    }

    pub fn is_service(&self) -> bool {
        self.domain.is_none()
    }

    /// True when this error is an instance of `class`.
    pub fn is(&self, class: &ErrorClass) -> bool {
        self.domain.as_deref() == class.domain() && self.name == class.name
    }

    /// Serializes to the wire body.
    pub fn dump(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&ErrorBody {
            reference: self.reference,
            timestamp: self.timestamp,
            domain: self.domain.clone(),
            code: self.code.clone(),
            message: self.message.clone(),
            data: self.extra.clone(),
        })
    }

    /// Parses a wire body as an instance of `class`.
    ///
    /// Domain, name and code come from the class; the body supplies the
    /// reference, timestamp, rendered message and extra data.
    pub fn load(class: &ErrorClass, body: &[u8]) -> Result<Self, serde_json::Error> {
        let body: ErrorBody = serde_json::from_slice(body)?;
        Ok(Self {
            reference: body.reference,
            domain: class.domain().map(str::to_string),
            name: class.name.to_string(),
            code: class.code.to_string(),
            message: body.message,
            extra: body.data,
            timestamp: body.timestamp,
        })
    }
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}] {}", self.class_key(), self.code, self.message)
    }
}

impl std::error::Error for DomainError {}
