//! Gossip wire format
//!
//! Messages are JSON objects tagged by `type`. Unknown extra fields are
//! ignored; missing or mistyped required fields make the message malformed.
//!
//! ```json
//! {"type":"announce","peer_id":"A","free_capacity_gb":50.0,
//!  "held_content_ids":["bafy..."],"timestamp":1700000000}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::common::{validate_id, Error, Result};

/// A peer's periodic self-description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub peer_id: String,
    pub free_capacity_gb: f64,
    pub held_content_ids: Vec<String>,
    /// Sender's clock; advisory only, never used for liveness
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GossipMessage {
    #[serde(rename = "announce")]
    Announce(Announcement),
    /// Any other `type`, ignored by this node
    #[serde(other)]
    Unknown,
}

impl GossipMessage {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode and validate an inbound payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let message: GossipMessage = serde_json::from_slice(payload)
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;
        if let GossipMessage::Announce(announcement) = &message {
            announcement.validate()?;
        }
        Ok(message)
    }
}

impl Announcement {
    fn validate(&self) -> Result<()> {
        validate_id("peer_id", &self.peer_id)?;
        if !self.free_capacity_gb.is_finite() || self.free_capacity_gb < 0.0 {
            return Err(Error::MalformedMessage(format!(
                "free_capacity_gb out of range: {}",
                self.free_capacity_gb
            )));
        }
        for content_id in &self.held_content_ids {
            validate_id("content_id", content_id)?;
        }
        Ok(())
    }
}
