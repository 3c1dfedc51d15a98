//! Wire schemas: the normalized consensus-log payload and the fan-out
//! message format.
//!
//! Field names are camelCase on the wire to match the external format other
//! producers already write.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use waybill_records::{ItemKey, Milestone};

/// Context block carried alongside a milestone payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    /// Agent that reported the milestone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Where the milestone occurred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Free-form notes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Link to the supporting document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_url: Option<String>,
    /// Opaque key/value context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Normalized milestone payload appended to the consensus log.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestonePayload {
    /// Token id of the item.
    pub token_id: String,
    /// Serial number of the item.
    pub serial: u64,
    /// The milestone reached.
    pub milestone: Milestone,
    /// When the milestone was reported.
    pub timestamp: DateTime<Utc>,
    /// Document hash; serialized as `null` when absent.
    pub file_hash: Option<String>,
    /// Context block.
    #[serde(default)]
    pub context: EventContext,
}

impl MilestonePayload {
    /// Item key the payload describes.
    pub fn item(&self) -> ItemKey {
        ItemKey::new(self.token_id.clone(), self.serial)
    }
}

/// Invoice status event in the format written by the previous generation of
/// producers. Still appears on long-lived channels and is surfaced to
/// subscribers as-is.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyInvoicePayload {
    /// Invoice the event belongs to.
    pub invoice_id: String,
    /// New invoice status.
    pub status: String,
    /// When the status changed, if the producer recorded it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Kind of a fan-out delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaKind {
    /// A milestone event.
    Milestone,
    /// A legacy invoice status event.
    LegacyInvoice,
    /// A newly issued item was observed.
    ItemIssued,
}

impl DeltaKind {
    /// Message `type` string used on the wire.
    pub const fn message_type(self) -> &'static str {
        match self {
            Self::Milestone => "milestone",
            Self::LegacyInvoice => "invoice",
            Self::ItemIssued => "itemIssued",
        }
    }
}

/// One domain change routed to subscribers.
#[derive(Clone, Debug)]
pub struct Delta {
    /// Routing key; subscribers holding this key (or none at all) receive it.
    pub channel_key: String,
    /// What kind of change this is.
    pub kind: DeltaKind,
    /// The change itself.
    pub data: serde_json::Value,
}

/// Message pushed to a subscriber.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    /// Message type: `connection`, `ping`, `pong`, or a delta kind.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Message body.
    #[serde(skip_serializing_if = "serde_json::Value::is_null", default)]
    pub data: serde_json::Value,
    /// Server time the message was produced.
    pub timestamp: DateTime<Utc>,
    /// Routing key, present on delta messages.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub channel_key: Option<String>,
}

impl ServerMessage {
    /// Build a message with the current timestamp and no routing key.
    pub fn new(message_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            message_type: message_type.into(),
            data,
            timestamp: Utc::now(),
            channel_key: None,
        }
    }

    /// Build a delta message.
    pub fn delta(delta: &Delta) -> Self {
        Self {
            message_type: delta.kind.message_type().to_string(),
            data: delta.data.clone(),
            timestamp: Utc::now(),
            channel_key: Some(delta.channel_key.clone()),
        }
    }
}

/// Control message received from a subscriber.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    /// Requested action.
    #[serde(rename = "type")]
    pub action: ClientAction,
    /// Channel key the action applies to, for subscribe/unsubscribe.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub channel_key: Option<String>,
}

/// Actions a subscriber may request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAction {
    /// Add a channel key to the subscription set.
    Subscribe,
    /// Remove a channel key from the subscription set.
    Unsubscribe,
    /// Liveness check; answered with `pong`.
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_milestone_payload_wire_shape() {
        let payload = MilestonePayload {
            token_id: "0.0.123".to_string(),
            serial: 1,
            milestone: Milestone::Shipped,
            timestamp: Utc::now(),
            file_hash: None,
            context: EventContext::default(),
        };

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["tokenId"], "0.0.123");
        assert_eq!(value["milestone"], "SHIPPED");
        // fileHash is always present, null when absent.
        assert!(value["fileHash"].is_null());
        assert!(value.get("context").is_some());
    }

    #[test]
    fn test_client_message_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","channelKey":"0.0.123-1"}"#).unwrap();
        assert_eq!(msg.action, ClientAction::Subscribe);
        assert_eq!(msg.channel_key.as_deref(), Some("0.0.123-1"));

        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping.action, ClientAction::Ping);
    }
}
