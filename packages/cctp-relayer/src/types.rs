//! Message lifecycle types shared across the relay pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::iris_lookup_id;
use crate::message::{CctpMessage, MessageBody, MessageParseError};

/// Lifecycle status of a relayed message
///
/// `Created -> {Filtered | Pending} -> Attested -> {Complete | Failed}`, with
/// `Created -> Attested` when the first attestation poll is already complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Created,
    Pending,
    Attested,
    Complete,
    Failed,
    Filtered,
}

impl MessageStatus {
    /// Get the status as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Created => "created",
            MessageStatus::Pending => "pending",
            MessageStatus::Attested => "attested",
            MessageStatus::Complete => "complete",
            MessageStatus::Failed => "failed",
            MessageStatus::Filtered => "filtered",
        }
    }

    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Complete | MessageStatus::Failed | MessageStatus::Filtered
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Mint,
    Forward,
}

/// One observed bridge message and its relay progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageState {
    pub iris_lookup_id: String,
    pub msg_type: MessageType,
    pub status: MessageStatus,
    /// Hex attestation, set once Circle reports the message complete
    pub attestation: String,
    pub source_domain: u32,
    pub dest_domain: u32,
    pub nonce: u64,
    pub source_tx_hash: String,
    pub dest_tx_hash: String,
    #[serde(with = "hex_bytes")]
    pub msg_sent_bytes: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub msg_body: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub destination_caller: Vec<u8>,
    /// IBC channel for forward messages, empty for mints
    pub channel: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl MessageState {
    /// Build the initial `Created` record from raw MessageSent bytes
    pub fn from_message_bytes(
        source_tx_hash: impl Into<String>,
        bytes: &[u8],
    ) -> Result<Self, MessageParseError> {
        let msg = CctpMessage::parse(bytes)?;
        let (msg_type, channel) = match msg.body_kind()? {
            MessageBody::Burn(_) => (MessageType::Mint, String::new()),
            MessageBody::Forward(fwd) => (MessageType::Forward, fwd.channel_name()),
        };

        let now = Utc::now();
        Ok(Self {
            iris_lookup_id: iris_lookup_id(bytes),
            msg_type,
            status: MessageStatus::Created,
            attestation: String::new(),
            source_domain: msg.source_domain,
            dest_domain: msg.dest_domain,
            nonce: msg.nonce,
            source_tx_hash: source_tx_hash.into(),
            dest_tx_hash: String::new(),
            msg_sent_bytes: bytes.to_vec(),
            destination_caller: msg.destination_caller.to_vec(),
            msg_body: msg.body,
            channel,
            created: now,
            updated: now,
            last_error: None,
        })
    }

    pub fn set_status(&mut self, status: MessageStatus) {
        self.status = status;
        self.updated = Utc::now();
    }

    /// All-zero destination caller means anyone may submit
    pub fn has_open_destination_caller(&self) -> bool {
        self.destination_caller.iter().all(|b| *b == 0)
    }

    /// Decode the hex attestation into raw signature bytes
    pub fn attestation_bytes(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(self.attestation.trim_start_matches("0x"))
    }
}

/// Every message emitted by one source transaction, in emission order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxState {
    pub tx_hash: String,
    pub msgs: Vec<MessageState>,
    /// Number of times the processor has re-enqueued this transaction
    #[serde(default)]
    pub retry_attempt: u32,
}

impl TxState {
    pub fn new(tx_hash: impl Into<String>, msgs: Vec<MessageState>) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            msgs,
            retry_attempt: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.msgs.iter().all(|m| m.status.is_terminal())
    }
}

/// Serde helper rendering byte fields as 0x-prefixed hex
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}
