//! CCTP message codec
//!
//! Layout of a MessageTransmitter message (all integers big-endian):
//!
//! | field              | bytes      |
//! |--------------------|------------|
//! | version            | 0..4       |
//! | source domain      | 4..8       |
//! | destination domain | 8..12      |
//! | nonce              | 12..20     |
//! | sender             | 20..52     |
//! | recipient          | 52..84     |
//! | destination caller | 84..116    |
//! | message body       | 116..      |

use thiserror::Error;

const VERSION_RANGE: std::ops::Range<usize> = 0..4;
const SOURCE_DOMAIN_RANGE: std::ops::Range<usize> = 4..8;
const DEST_DOMAIN_RANGE: std::ops::Range<usize> = 8..12;
const NONCE_RANGE: std::ops::Range<usize> = 12..20;
const SENDER_RANGE: std::ops::Range<usize> = 20..52;
const RECIPIENT_RANGE: std::ops::Range<usize> = 52..84;
const DESTINATION_CALLER_RANGE: std::ops::Range<usize> = 84..116;
const MESSAGE_BODY_INDEX: usize = 116;

/// BurnMessage: version u32 | burn token | mint recipient | amount u256 | sender
pub const BURN_MESSAGE_LEN: usize = 132;

/// Forward metadata: nonce u64 | sender bytes32 | channel u64 | memo
pub const FORWARD_METADATA_MIN_LEN: usize = 48;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageParseError {
    #[error("message too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
    #[error("message body is neither a burn message nor forward metadata ({len} bytes)")]
    UnknownBody { len: usize },
}

/// A parsed MessageTransmitter message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CctpMessage {
    pub version: u32,
    pub source_domain: u32,
    pub dest_domain: u32,
    pub nonce: u64,
    pub sender: [u8; 32],
    pub recipient: [u8; 32],
    pub destination_caller: [u8; 32],
    pub body: Vec<u8>,
}

impl CctpMessage {
    pub fn parse(bytes: &[u8]) -> Result<Self, MessageParseError> {
        if bytes.len() < MESSAGE_BODY_INDEX {
            return Err(MessageParseError::TooShort {
                len: bytes.len(),
                min: MESSAGE_BODY_INDEX,
            });
        }

        Ok(Self {
            version: read_u32(&bytes[VERSION_RANGE]),
            source_domain: read_u32(&bytes[SOURCE_DOMAIN_RANGE]),
            dest_domain: read_u32(&bytes[DEST_DOMAIN_RANGE]),
            nonce: read_u64(&bytes[NONCE_RANGE]),
            sender: read_bytes32(&bytes[SENDER_RANGE]),
            recipient: read_bytes32(&bytes[RECIPIENT_RANGE]),
            destination_caller: read_bytes32(&bytes[DESTINATION_CALLER_RANGE]),
            body: bytes[MESSAGE_BODY_INDEX..].to_vec(),
        })
    }

    /// Serialize back into the wire layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MESSAGE_BODY_INDEX + self.body.len());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.source_domain.to_be_bytes());
        out.extend_from_slice(&self.dest_domain.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.sender);
        out.extend_from_slice(&self.recipient);
        out.extend_from_slice(&self.destination_caller);
        out.extend_from_slice(&self.body);
        out
    }

    /// Classify the body. Burn messages are checked first.
    pub fn body_kind(&self) -> Result<MessageBody, MessageParseError> {
        if let Some(burn) = BurnMessage::parse(&self.body) {
            return Ok(MessageBody::Burn(burn));
        }
        if let Some(forward) = ForwardMetadata::parse(&self.body) {
            return Ok(MessageBody::Forward(forward));
        }
        Err(MessageParseError::UnknownBody {
            len: self.body.len(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Burn(BurnMessage),
    Forward(ForwardMetadata),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurnMessage {
    pub version: u32,
    pub burn_token: [u8; 32],
    pub mint_recipient: [u8; 32],
    /// uint256 amount, kept as raw big-endian word
    pub amount: [u8; 32],
    pub message_sender: [u8; 32],
}

impl BurnMessage {
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() != BURN_MESSAGE_LEN {
            return None;
        }
        Some(Self {
            version: read_u32(&body[0..4]),
            burn_token: read_bytes32(&body[4..36]),
            mint_recipient: read_bytes32(&body[36..68]),
            amount: read_bytes32(&body[68..100]),
            message_sender: read_bytes32(&body[100..132]),
        })
    }
}

/// Noble forwarding metadata, relayed over IBC after minting on Noble
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardMetadata {
    pub nonce: u64,
    pub sender: [u8; 32],
    pub channel: u64,
    pub memo: Vec<u8>,
}

impl ForwardMetadata {
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < FORWARD_METADATA_MIN_LEN {
            return None;
        }
        Some(Self {
            nonce: read_u64(&body[0..8]),
            sender: read_bytes32(&body[8..40]),
            channel: read_u64(&body[40..48]),
            memo: body[48..].to_vec(),
        })
    }

    pub fn channel_name(&self) -> String {
        format!("channel-{}", self.channel)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

fn read_bytes32(bytes: &[u8]) -> [u8; 32] {
    let mut buf = [0u8; 32];
    buf.copy_from_slice(bytes);
    buf
}
