//! Fragmentation of oversized frames and timed reassembly

use std::collections::HashMap;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use rand::RngCore;

use super::{binary, BitchatPacket, MessageType, FRAGMENT_THRESHOLD, MAX_FRAGMENT_SLICE};
use crate::error::{Error, Result};
use crate::protocol::MAX_DECOMPRESSED_SIZE;

/// Fragment header: group id (8) + index (2) + total (2) + original type (1)
pub const FRAGMENT_HEADER_SIZE: usize = 13;

/// Incomplete groups are purged after this long
pub const FRAGMENT_GROUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Cadence of the reassembly sweep
pub const FRAGMENT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound on fragments per group, derived from the frame cap
const MAX_FRAGMENTS_PER_GROUP: usize = MAX_DECOMPRESSED_SIZE / MAX_FRAGMENT_SLICE + 2;

/// Bound on simultaneously tracked groups
const MAX_ACTIVE_GROUPS: usize = 128;

/// Split a packet whose unpadded encoding exceeds the fragment threshold.
///
/// Returns `None` when the packet fits in a single frame or is itself a
/// fragment. Fragments inherit the parent's version, TTL, sender and
/// recipient so they relay and address exactly like the parent; they carry
/// no application-layer signature.
pub fn fragment_packet(packet: &BitchatPacket) -> Result<Option<Vec<BitchatPacket>>> {
    if packet.packet_type == MessageType::Fragment {
        return Ok(None);
    }
    let encoded = binary::encode_unpadded(packet)?;
    if encoded.len() <= FRAGMENT_THRESHOLD {
        return Ok(None);
    }

    let total = encoded.len().div_ceil(MAX_FRAGMENT_SLICE);
    if total > u16::MAX as usize {
        return Err(Error::SizeExceeded(format!("{} fragments", total)));
    }

    let mut group_id = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut group_id);

    let fragments = encoded
        .chunks(MAX_FRAGMENT_SLICE)
        .enumerate()
        .map(|(index, slice)| {
            let mut payload = Vec::with_capacity(FRAGMENT_HEADER_SIZE + slice.len());
            payload.extend_from_slice(&group_id);
            let mut counters = [0u8; 4];
            BigEndian::write_u16(&mut counters[0..2], index as u16);
            BigEndian::write_u16(&mut counters[2..4], total as u16);
            payload.extend_from_slice(&counters);
            payload.push(packet.packet_type.as_u8());
            payload.extend_from_slice(slice);

            let mut fragment =
                BitchatPacket::new(MessageType::Fragment, packet.sender_id, payload)
                    .with_ttl(packet.ttl);
            fragment.version = packet.version;
            fragment.recipient_id = packet.recipient_id;
            fragment
        })
        .collect();

    Ok(Some(fragments))
}

/// Parsed view of a fragment payload
struct FragmentHeader {
    group_id: [u8; 8],
    index: u16,
    total: u16,
    original_type: u8,
}

fn parse_header(payload: &[u8]) -> Result<(FragmentHeader, &[u8])> {
    if payload.len() <= FRAGMENT_HEADER_SIZE {
        return Err(Error::Malformed("fragment payload too short".into()));
    }
    let mut group_id = [0u8; 8];
    group_id.copy_from_slice(&payload[0..8]);
    let header = FragmentHeader {
        group_id,
        index: BigEndian::read_u16(&payload[8..10]),
        total: BigEndian::read_u16(&payload[10..12]),
        original_type: payload[12],
    };
    Ok((header, &payload[FRAGMENT_HEADER_SIZE..]))
}

struct FragmentGroup {
    total: u16,
    original_type: u8,
    slices: HashMap<u16, Vec<u8>>,
    created: Instant,
}

/// Reassembles fragment groups keyed by their random group id.
///
/// Synchronous by design: the owner serializes access (the router holds it
/// behind a mutex) and drives `sweep` from a timer.
pub struct FragmentAssembler {
    groups: HashMap<[u8; 8], FragmentGroup>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
        }
    }

    /// Ingest one fragment. Returns the reassembled parent packet once
    /// every index of the group has arrived.
    pub fn ingest(&mut self, packet: &BitchatPacket) -> Result<Option<BitchatPacket>> {
        let (header, slice) = parse_header(&packet.payload)?;

        if header.total == 0 || header.index >= header.total {
            return Err(Error::Malformed(format!(
                "fragment index {}/{}",
                header.index, header.total
            )));
        }
        if header.total as usize > MAX_FRAGMENTS_PER_GROUP {
            return Err(Error::SizeExceeded(format!(
                "fragment group of {}",
                header.total
            )));
        }

        if self.groups.len() >= MAX_ACTIVE_GROUPS && !self.groups.contains_key(&header.group_id) {
            self.evict_oldest();
        }

        let group = self
            .groups
            .entry(header.group_id)
            .or_insert_with(|| FragmentGroup {
                total: header.total,
                original_type: header.original_type,
                slices: HashMap::new(),
                created: Instant::now(),
            });

        if group.total != header.total || group.original_type != header.original_type {
            return Err(Error::Malformed("fragment group metadata mismatch".into()));
        }

        group.slices.entry(header.index).or_insert_with(|| slice.to_vec());

        if group.slices.len() < group.total as usize {
            return Ok(None);
        }

        let group = match self.groups.remove(&header.group_id) {
            Some(group) => group,
            None => return Ok(None),
        };
        let mut encoded = Vec::new();
        for index in 0..group.total {
            match group.slices.get(&index) {
                Some(slice) => encoded.extend_from_slice(slice),
                None => return Err(Error::Malformed(format!("missing fragment {}", index))),
            }
        }

        let reassembled = binary::decode(&encoded)?;
        if reassembled.packet_type.as_u8() != group.original_type {
            return Err(Error::Malformed(
                "reassembled type differs from fragment header".into(),
            ));
        }
        Ok(Some(reassembled))
    }

    /// Drop groups older than the group timeout; returns how many were purged
    pub fn sweep(&mut self) -> usize {
        let before = self.groups.len();
        self.groups
            .retain(|_, group| group.created.elapsed() < FRAGMENT_GROUP_TIMEOUT);
        before - self.groups.len()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }

    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .groups
            .iter()
            .min_by_key(|(_, group)| group.created)
            .map(|(id, _)| *id)
        {
            self.groups.remove(&oldest);
        }
    }
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION_1;

    // Pseudorandom payloads so zlib cannot shrink the frame under the
    // fragment threshold and encoded sizes stay exact
    fn incompressible(len: usize) -> Vec<u8> {
        let mut state = 0x2545F4914F6CDD1Du64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    fn big_packet(len: usize) -> BitchatPacket {
        let mut packet = BitchatPacket::new(MessageType::Message, [3u8; 8], incompressible(len));
        packet.version = PROTOCOL_VERSION_1;
        packet
    }

    #[test]
    fn small_packets_pass_through() {
        let packet = BitchatPacket::new(MessageType::Message, [3u8; 8], b"tiny".to_vec());
        assert!(fragment_packet(&packet).unwrap().is_none());
    }

    #[test]
    fn fragments_reassemble_to_parent() {
        let packet = big_packet(4000);
        let fragments = fragment_packet(&packet).unwrap().unwrap();
        assert!(fragments.len() > 1);

        let mut assembler = FragmentAssembler::new();
        let mut result = None;
        for fragment in &fragments {
            if let Some(done) = assembler.ingest(fragment).unwrap() {
                result = Some(done);
            }
        }
        let reassembled = result.expect("group should complete");
        assert_eq!(reassembled.payload, packet.payload);
        assert_eq!(reassembled.packet_type, packet.packet_type);
        assert_eq!(reassembled.sender_id, packet.sender_id);
    }

    #[test]
    fn fragment_sizes_follow_slice_limit() {
        // An encoded size of 2100 bytes must split 469/469/469/469/224
        let encoded_target = 2100usize;
        // Header (14) + sender (8) = 22 bytes of framing for this shape
        let packet = big_packet(encoded_target - 22);
        let encoded = binary::encode_unpadded(&packet).unwrap();
        assert_eq!(encoded.len(), encoded_target);

        let fragments = fragment_packet(&packet).unwrap().unwrap();
        let sizes: Vec<usize> = fragments
            .iter()
            .map(|f| f.payload.len() - FRAGMENT_HEADER_SIZE)
            .collect();
        assert_eq!(sizes, vec![469, 469, 469, 469, 224]);
    }

    #[test]
    fn incomplete_group_never_delivers() {
        let packet = big_packet(4000);
        let fragments = fragment_packet(&packet).unwrap().unwrap();

        let mut assembler = FragmentAssembler::new();
        for (i, fragment) in fragments.iter().enumerate() {
            if i == 2 {
                continue; // withhold one index
            }
            assert!(assembler.ingest(fragment).unwrap().is_none());
        }
        assert_eq!(assembler.pending_groups(), 1);
    }

    #[test]
    fn sweep_purges_stale_groups() {
        let packet = big_packet(4000);
        let fragments = fragment_packet(&packet).unwrap().unwrap();

        let mut assembler = FragmentAssembler::new();
        assembler.ingest(&fragments[0]).unwrap();
        // Not yet stale
        assert_eq!(assembler.sweep(), 0);
        // Backdate the group past the timeout
        for group in assembler.groups.values_mut() {
            group.created = Instant::now() - FRAGMENT_GROUP_TIMEOUT - Duration::from_secs(1);
        }
        assert_eq!(assembler.sweep(), 1);
        assert_eq!(assembler.pending_groups(), 0);
    }

    #[test]
    fn duplicate_fragments_are_idempotent() {
        let packet = big_packet(4000);
        let fragments = fragment_packet(&packet).unwrap().unwrap();

        let mut assembler = FragmentAssembler::new();
        assembler.ingest(&fragments[0]).unwrap();
        assembler.ingest(&fragments[0]).unwrap();
        assert_eq!(assembler.pending_groups(), 1);
    }

    #[test]
    fn compressed_parent_survives_reassembly() {
        // Half-entropy payload: compresses, but the compressed frame still
        // exceeds the fragment threshold
        let payload: Vec<u8> = incompressible(9000).iter().map(|b| b & 0x0F).collect();
        let mut packet = BitchatPacket::new(MessageType::Message, [3u8; 8], payload);
        packet.version = PROTOCOL_VERSION_1;

        let encoded = binary::encode_unpadded(&packet).unwrap();
        assert!(encoded.len() < 9000, "payload should compress");
        assert!(encoded.len() > FRAGMENT_THRESHOLD);

        let fragments = fragment_packet(&packet).unwrap().unwrap();
        let mut assembler = FragmentAssembler::new();
        let mut result = None;
        for fragment in &fragments {
            if let Some(done) = assembler.ingest(fragment).unwrap() {
                result = Some(done);
            }
        }
        assert_eq!(result.unwrap().payload, packet.payload);
    }
}
