//! Binary wire protocol for the BitChat mesh
//!
//! This module implements the core packet format shared by every node:
//! - Fixed big-endian header with v1/v2 length widths
//! - Optional recipient, signature and compression fields
//! - Standard-block padding for traffic analysis resistance
//! - Fragmentation of oversized frames
//! - TLV payloads (announcements, file packets, Noise envelopes)

pub mod binary;
pub mod fragmentation;
pub mod tlv;

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Peer identifier: first 8 bytes of SHA-256 of the static public key.
/// Its 16-char hex form is the short ID shown to users.
pub type PeerId = [u8; 8];

/// Recipient value addressing every node in the mesh
pub const BROADCAST_PEER_ID: PeerId = [0xFF; 8];

/// Protocol version 1: u16 payload length
pub const PROTOCOL_VERSION_1: u8 = 1;
/// Protocol version 2: u32 payload length
pub const PROTOCOL_VERSION_2: u8 = 2;

// Flag bit positions
pub const FLAG_HAS_RECIPIENT: u8 = 0x01; // Bit 0
pub const FLAG_HAS_SIGNATURE: u8 = 0x02; // Bit 1
pub const FLAG_IS_COMPRESSED: u8 = 0x04; // Bit 2
// Bits 3-7 reserved

/// Ed25519 signature width on the wire
pub const SIGNATURE_SIZE: usize = 64;

/// Payloads at or above this size attempt zlib compression
pub const COMPRESSION_THRESHOLD: usize = 100;

/// Hard cap on a decompressed payload (framed ≈ 1 MiB)
pub const MAX_DECOMPRESSED_SIZE: usize = 1024 * 1024;

/// Decompression bomb guard: original/compressed must stay below this
pub const MAX_COMPRESSION_RATIO: usize = 50_000;

/// Frames whose unpadded encoding exceeds this are fragmented
pub const FRAGMENT_THRESHOLD: usize = 512;

/// Maximum slice of the parent encoding carried per fragment
pub const MAX_FRAGMENT_SLICE: usize = 469;

/// Standard block sizes for padding; frames larger than the last entry
/// travel unpadded
pub const PADDING_BLOCK_SIZES: [usize; 4] = [256, 512, 1024, 2048];

/// Announcements older than this are stale and rejected
pub const ANNOUNCE_STALE_WINDOW_MS: u64 = 180_000;

/// Default hop budget for new packets
pub const DEFAULT_TTL: u8 = 7;

/// Message types carried in the packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Peer presence broadcast with identity keys
    Announce = 0x01,
    /// Public chat message (or unicast plaintext)
    Message = 0x02,
    /// Graceful departure
    Leave = 0x03,
    /// Noise XX handshake message
    NoiseHandshake = 0x10,
    /// Noise transport ciphertext
    NoiseEncrypted = 0x11,
    /// Slice of an oversized frame
    Fragment = 0x20,
    /// Gossip anti-entropy request carrying a GCS filter
    RequestSync = 0x21,
    /// File transfer payload
    FileTransfer = 0x22,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(MessageType::Announce),
            0x02 => Ok(MessageType::Message),
            0x03 => Ok(MessageType::Leave),
            0x10 => Ok(MessageType::NoiseHandshake),
            0x11 => Ok(MessageType::NoiseEncrypted),
            0x20 => Ok(MessageType::Fragment),
            0x21 => Ok(MessageType::RequestSync),
            0x22 => Ok(MessageType::FileTransfer),
            other => Err(Error::Malformed(format!("unknown message type 0x{:02x}", other))),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Bit index in the REQUEST_SYNC type bitmap
    pub fn sync_bit(self) -> u8 {
        match self {
            MessageType::Announce => 0,
            MessageType::Message => 1,
            MessageType::Leave => 2,
            MessageType::NoiseHandshake => 3,
            MessageType::NoiseEncrypted => 4,
            MessageType::Fragment => 5,
            MessageType::RequestSync => 6,
            MessageType::FileTransfer => 7,
        }
    }
}

/// A single mesh packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitchatPacket {
    pub version: u8,
    pub packet_type: MessageType,
    pub ttl: u8,
    pub timestamp: u64,
    pub sender_id: PeerId,
    pub recipient_id: Option<PeerId>,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl BitchatPacket {
    /// Create a broadcast packet with the default TTL
    pub fn new(packet_type: MessageType, sender_id: PeerId, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION_1,
            packet_type,
            ttl: DEFAULT_TTL,
            timestamp: now_ms(),
            sender_id,
            recipient_id: None,
            payload,
            signature: None,
        }
    }

    pub fn with_recipient(mut self, recipient_id: PeerId) -> Self {
        self.recipient_id = Some(recipient_id);
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// True when no recipient is set or the recipient is the broadcast ID
    pub fn is_broadcast(&self) -> bool {
        match self.recipient_id {
            None => true,
            Some(id) => id == BROADCAST_PEER_ID,
        }
    }

    /// True when the packet is specifically addressed to `peer_id`
    pub fn is_addressed_to(&self, peer_id: &PeerId) -> bool {
        self.recipient_id.as_ref() == Some(peer_id)
    }

    /// Stable 32-byte identifier, invariant under TTL mutation and padding.
    ///
    /// Hashes (sender, timestamp, type, payload digest) so a relayed copy
    /// maps to the same ID as the original.
    pub fn packet_id(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.sender_id);
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update([self.packet_type.as_u8()]);
        let payload_digest: [u8; 32] = Sha256::digest(&self.payload).into();
        hasher.update(payload_digest);
        hasher.finalize().into()
    }
}

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Short display form of a peer ID (16 hex chars)
pub fn short_id(peer_id: &PeerId) -> String {
    hex::encode(peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trip() {
        for raw in [0x01u8, 0x02, 0x03, 0x10, 0x11, 0x20, 0x21, 0x22] {
            assert_eq!(MessageType::from_u8(raw).unwrap().as_u8(), raw);
        }
        assert!(MessageType::from_u8(0x7F).is_err());
    }

    #[test]
    fn packet_id_stable_under_ttl() {
        let packet = BitchatPacket::new(MessageType::Message, [1u8; 8], b"hello".to_vec());
        let relayed = packet.clone().with_ttl(packet.ttl - 1);
        assert_eq!(packet.packet_id(), relayed.packet_id());
    }

    #[test]
    fn broadcast_detection() {
        let packet = BitchatPacket::new(MessageType::Message, [1u8; 8], vec![]);
        assert!(packet.is_broadcast());
        let packet = packet.with_recipient(BROADCAST_PEER_ID);
        assert!(packet.is_broadcast());
        let packet = packet.with_recipient([2u8; 8]);
        assert!(!packet.is_broadcast());
        assert!(packet.is_addressed_to(&[2u8; 8]));
    }
}
