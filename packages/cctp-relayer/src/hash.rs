//! Hash computation for CCTP message identities
//!
//! The lookup id and the used-nonce key must match what Circle's attestation
//! service and the MessageTransmitter contracts compute, byte for byte.

use tiny_keccak::{Hasher, Keccak};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Attestation lookup id: lowercase hex of keccak256(message bytes), no `0x`.
pub fn iris_lookup_id(message: &[u8]) -> String {
    hex::encode(keccak256(message))
}

/// Key of the `usedNonces` mapping on EVM MessageTransmitters:
/// keccak256(abi.encodePacked(uint32 sourceDomain, uint64 nonce))
pub fn used_nonce_key(source_domain: u32, nonce: u64) -> [u8; 32] {
    let mut data = [0u8; 12];
    data[0..4].copy_from_slice(&source_domain.to_be_bytes());
    data[4..12].copy_from_slice(&nonce.to_be_bytes());
    keccak256(&data)
}

/// Convert bytes32 to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Left-pad an address (20 bytes for EVM and Cosmos accounts) into a bytes32 word
pub fn left_pad_32(bytes: &[u8]) -> [u8; 32] {
    let mut word = [0u8; 32];
    let len = bytes.len().min(32);
    word[32 - len..].copy_from_slice(&bytes[bytes.len() - len..]);
    word
}
