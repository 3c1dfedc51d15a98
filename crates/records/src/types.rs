use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use waybill_ledger::ChannelId;

/// Business milestones a tracked item moves through, in domain order.
///
/// `Paid` is terminal. Wire representation matches the external payload
/// format (`CREATED_ISSUED`, `SHIPPED`, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Milestone {
    /// The item was created and issued on the ledger.
    CreatedIssued,
    /// The underlying goods have shipped.
    Shipped,
    /// The shipment cleared customs.
    CustomsCleared,
    /// The shipment was delivered.
    Delivered,
    /// The item was funded.
    Funded,
    /// The item was paid out. Terminal.
    Paid,
}

impl Milestone {
    /// Every milestone, in domain order.
    pub const ALL: [Self; 6] = [
        Self::CreatedIssued,
        Self::Shipped,
        Self::CustomsCleared,
        Self::Delivered,
        Self::Funded,
        Self::Paid,
    ];

    /// Whether no further milestone can follow this one.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Paid)
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreatedIssued => "CREATED_ISSUED",
            Self::Shipped => "SHIPPED",
            Self::CustomsCleared => "CUSTOMS_CLEARED",
            Self::Delivered => "DELIVERED",
            Self::Funded => "FUNDED",
            Self::Paid => "PAID",
        };
        write!(f, "{name}")
    }
}

/// Composite identifier of one tracked item: token id plus serial number.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemKey {
    /// Token id of the item class, e.g. `0.0.123`.
    pub token_id: String,
    /// Serial number within the token.
    pub serial: u64,
}

impl ItemKey {
    /// Creates a new `ItemKey`.
    pub fn new(token_id: impl Into<String>, serial: u64) -> Self {
        Self {
            token_id: token_id.into(),
            serial,
        }
    }

    /// Serialized form used for channel bindings and fan-out routing,
    /// `"tokenId-serial"`.
    #[must_use]
    pub fn channel_key(&self) -> String {
        format!("{}-{}", self.token_id, self.serial)
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.token_id, self.serial)
    }
}

/// One recorded milestone event for one item.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneRecord {
    /// Record id, generated on create.
    pub id: Uuid,
    /// Item the milestone belongs to.
    pub item: ItemKey,
    /// The milestone reached.
    pub milestone: Milestone,
    /// Channel the event was appended to.
    pub channel_id: ChannelId,
    /// Sequence number assigned by the consensus log.
    pub sequence_number: u64,
    /// Transaction that carried the append.
    pub transaction_id: String,
    /// Consensus timestamp of the append.
    pub consensus_timestamp: DateTime<Utc>,
    /// Hash of the supporting document, if any.
    pub file_hash: Option<String>,
    /// Agent that reported the milestone.
    pub agent_id: Option<String>,
    /// Where the milestone occurred.
    pub location: Option<String>,
    /// Free-form notes.
    pub notes: Option<String>,
    /// Link to the supporting document.
    pub document_url: Option<String>,
    /// Opaque key/value context.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Local creation time of the record.
    pub created_at: DateTime<Utc>,
}

/// Binding of one item to the consensus-log channel carrying its events.
///
/// Created lazily on the first milestone write for an item; never mutated
/// afterwards except for deactivation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelBinding {
    /// Serialized item key, `"tokenId-serial"`.
    pub item_key: String,
    /// Channel bound to the item.
    pub channel_id: ChannelId,
    /// Whether the binding is live.
    pub is_active: bool,
    /// When the binding was created.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_key_format() {
        let item = ItemKey::new("0.0.123", 7);
        assert_eq!(item.channel_key(), "0.0.123-7");
        assert_eq!(item.to_string(), "0.0.123-7");
    }

    #[test]
    fn test_milestone_wire_names() {
        let json = serde_json::to_string(&Milestone::CustomsCleared).unwrap();
        assert_eq!(json, "\"CUSTOMS_CLEARED\"");

        let parsed: Milestone = serde_json::from_str("\"CREATED_ISSUED\"").unwrap();
        assert_eq!(parsed, Milestone::CreatedIssued);
    }

    #[test]
    fn test_only_paid_is_terminal() {
        for milestone in Milestone::ALL {
            assert_eq!(milestone.is_terminal(), milestone == Milestone::Paid);
        }
    }
}
