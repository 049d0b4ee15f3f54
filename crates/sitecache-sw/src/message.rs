//! Page → worker messages.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ServiceWorkerError;

/// A message the worker understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Activate the waiting worker now.
    SkipWaiting,
}

/// Result of parsing an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Known(WorkerMessage),
    /// Well-formed, but with a `type` nobody handles.
    Unknown(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

/// Parse a JSON message. Input that isn't an object with a string `type`
/// is an error; an unrecognized `type` is not.
pub fn parse_message(json: &str) -> Result<InboundMessage, ServiceWorkerError> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| ServiceWorkerError::MessageError(e.to_string()))?;
    let envelope: Envelope = serde_json::from_value(value.clone())
        .map_err(|e| ServiceWorkerError::MessageError(e.to_string()))?;

    match serde_json::from_value::<WorkerMessage>(value) {
        Ok(message) => Ok(InboundMessage::Known(message)),
        Err(_) => {
            debug!(kind = %envelope.kind, "Ignoring unknown message type");
            Ok(InboundMessage::Unknown(envelope.kind))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_waiting() {
        assert_eq!(
            parse_message(r#"{"type":"SKIP_WAITING"}"#).unwrap(),
            InboundMessage::Known(WorkerMessage::SkipWaiting)
        );
        assert_eq!(
            serde_json::to_string(&WorkerMessage::SkipWaiting).unwrap(),
            r#"{"type":"SKIP_WAITING"}"#
        );
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        assert_eq!(
            parse_message(r#"{"type":"CLEAR_CACHE","extra":1}"#).unwrap(),
            InboundMessage::Unknown("CLEAR_CACHE".to_string())
        );
    }

    #[test]
    fn test_malformed() {
        for input in ["not json", "[]", r#"{"kind":"SKIP_WAITING"}"#, r#"{"type":7}"#] {
            assert!(
                matches!(parse_message(input), Err(ServiceWorkerError::MessageError(_))),
                "{input}"
            );
        }
    }
}
