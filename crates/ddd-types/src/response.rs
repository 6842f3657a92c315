//! # Command Response
//!
//! The successful reply to a command. Its `reference` is the command's
//! reference, so the caller can pair it with the request that produced it.

use crate::message::now_timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reply to a command that was handled successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    /// Reference of the command this answers.
    pub reference: Uuid,
    /// Reply creation time, seconds since the UNIX epoch.
    pub timestamp: f64,
    /// Aggregate the command created or changed, if any.
    pub aggregate_ref: Option<Uuid>,
}

#[derive(Serialize, Deserialize)]
struct ResponseBody {
    #[serde(rename = "__reference__")]
    reference: Uuid,
    #[serde(rename = "__timestamp__")]
    timestamp: f64,
    data: ResponseData,
}

#[derive(Serialize, Deserialize)]
struct ResponseData {
    reference: Option<Uuid>,
}

impl CommandResponse {
    pub fn new(reference: Uuid, aggregate_ref: Option<Uuid>) -> Self {
        Self {
            reference,
            timestamp: now_timestamp(),
            aggregate_ref,
        }
    }

    /// Same response re-keyed to `reference`.
    #[must_use]
    pub fn with_reference(mut self, reference: Uuid) -> Self {
        self.reference = reference;
        self
    }

    pub fn dumps(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&ResponseBody {
            reference: self.reference,
            timestamp: self.timestamp,
            data: ResponseData {
                reference: self.aggregate_ref,
            },
        })
    }

    pub fn loads(body: &[u8]) -> Result<Self, serde_json::Error> {
        let body: ResponseBody = serde_json::from_slice(body)?;
        Ok(Self {
            reference: body.reference,
            timestamp: body.timestamp,
            aggregate_ref: body.data.reference,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_layout() {
        let aggregate = Uuid::new_v4();
        let response = CommandResponse::new(Uuid::new_v4(), Some(aggregate));
        let value: serde_json::Value =
            serde_json::from_slice(&response.dumps().unwrap()).unwrap();

        assert_eq!(value["__reference__"], response.reference.to_string());
        assert_eq!(value["data"]["reference"], aggregate.to_string());
    }

    #[test]
    fn test_loads_without_aggregate() {
        let response = CommandResponse::new(Uuid::new_v4(), None);
        let parsed = CommandResponse::loads(&response.dumps().unwrap()).unwrap();

        assert_eq!(parsed, response);
        assert!(parsed.aggregate_ref.is_none());
    }

    #[test]
    fn test_loads_rejects_garbage() {
        assert!(CommandResponse::loads(b"{\"data\": 1}").is_err());
    }
}
