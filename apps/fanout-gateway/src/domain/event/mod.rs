//! Event Wire Model
//!
//! The single unit exchanged with clients in both directions:
//!
//! ```json
//! {"type": "ping", "payload": {}, "from": "<uuid>", "time": "2024-01-01T00:00:00Z"}
//! ```
//!
//! `from` and `time` are server-owned. Whatever a client puts there is
//! overwritten on receipt (see [`Event::stamp`]).

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for a connected client, assigned at upgrade time.
pub type ClientId = Uuid;

/// Generate a fresh client identifier.
#[must_use]
pub fn new_client_id() -> ClientId {
    Uuid::new_v4()
}

// =============================================================================
// Reserved Event Types
// =============================================================================

/// Re-publish the event to every live client.
pub const BROADCAST: &str = "broadcast";
/// Liveness check answered with [`PONG`] to the sender only.
pub const PING: &str = "ping";
/// Reply to [`PING`].
pub const PONG: &str = "pong";
/// Server-to-client handler failure notification.
pub const ERROR: &str = "error";
/// Server-to-client notification for an unrecognized event type.
pub const UNKNOWN_EVENT: &str = "unknown_event";

// =============================================================================
// Event
// =============================================================================

/// A typed event with an opaque, handler-interpreted payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Selects the handler.
    #[serde(rename = "type")]
    pub kind: String,
    /// Handler-defined structured data.
    #[serde(default)]
    pub payload: Value,
    /// Originating client, set by the server on inbound receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ClientId>,
    /// Server-assigned timestamp.
    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,
}

impl Event {
    /// Create a server-originated event.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            from: None,
            time: Utc::now(),
        }
    }

    /// Create a server-originated event from any serializable payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON.
    pub fn with_payload<T: Serialize>(
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    /// Overwrite the server-owned fields of an inbound event.
    #[must_use]
    pub fn stamp(mut self, from: ClientId) -> Self {
        self.from = Some(from);
        self.time = Utc::now();
        self
    }

    /// `error` event carrying a client-safe message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ERROR, serde_json::json!({ "message": message.into() }))
    }

    /// `unknown_event` reply naming the offending type.
    #[must_use]
    pub fn unknown(kind: &str) -> Self {
        Self::new(
            UNKNOWN_EVENT,
            serde_json::json!({
                "message": "Unknown event type received",
                "type": kind,
            }),
        )
    }

    /// `pong` reply stamped with the current server time.
    #[must_use]
    pub fn pong() -> Self {
        let now = Utc::now();
        Self {
            kind: PONG.to_string(),
            payload: serde_json::json!({
                "timestamp": now.to_rfc3339_opts(SecondsFormat::Secs, true),
            }),
            from: None,
            time: now,
        }
    }

    /// Decode the payload into a handler-specific type.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_minimal_inbound_event() {
        let event: Event = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(event.kind, PING);
        assert_eq!(event.payload, Value::Null);
        assert!(event.from.is_none());
    }

    #[test]
    fn stamp_overwrites_client_supplied_fields() {
        let forged = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"broadcast","payload":{{"x":1}},"from":"{forged}","time":"2001-01-01T00:00:00Z"}}"#
        );
        let event: Event = serde_json::from_str(&raw).unwrap();
        let real = new_client_id();

        let stamped = event.stamp(real);

        assert_eq!(stamped.from, Some(real));
        assert!(stamped.time.timestamp() > 978_307_200);
        assert_eq!(stamped.payload["x"], 1);
    }

    #[test]
    fn server_events_omit_from() {
        let json = serde_json::to_value(Event::error("boom")).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["payload"]["message"], "boom");
        assert!(json.get("from").is_none());
        assert!(json.get("time").is_some());
    }

    #[test]
    fn unknown_event_names_offending_type() {
        let event = Event::unknown("teleport");
        assert_eq!(event.kind, UNKNOWN_EVENT);
        assert_eq!(event.payload["type"], "teleport");
        assert_eq!(event.payload["message"], "Unknown event type received");
    }

    #[test]
    fn pong_timestamp_is_rfc3339() {
        let event = Event::pong();
        let ts = event.payload["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn rejects_event_without_type() {
        assert!(serde_json::from_str::<Event>(r#"{"payload":{}}"#).is_err());
    }
}
