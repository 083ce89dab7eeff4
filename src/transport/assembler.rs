//! Notification stream reassembly
//!
//! BLE delivers a frame as a run of MTU-sized characteristic writes. The
//! assembler buffers per-link bytes and cuts complete frames using the
//! declared lengths in the fixed header plus the padding block ladder.

use byteorder::{BigEndian, ByteOrder};

use crate::protocol::{
    FLAG_HAS_RECIPIENT, FLAG_HAS_SIGNATURE, PADDING_BLOCK_SIZES, PROTOCOL_VERSION_1,
    PROTOCOL_VERSION_2, SIGNATURE_SIZE,
};

/// Upper bound on buffered bytes per link before the stream resets
const MAX_BUFFERED: usize = 2 * 1024 * 1024;

/// Expected wire length of the frame starting at `data[0]`, once enough
/// header bytes are present. `None` means "cannot tell yet"; `Some(0)`
/// marks an unparseable stream.
fn expected_frame_len(data: &[u8]) -> Option<usize> {
    if data.is_empty() {
        return None;
    }
    let (size_width, header_len) = match data[0] {
        PROTOCOL_VERSION_1 => (2usize, 14usize),
        PROTOCOL_VERSION_2 => (4usize, 16usize),
        _ => return Some(0),
    };
    if data.len() < header_len {
        return None;
    }

    let flags = data[11];
    let payload_length = match size_width {
        2 => BigEndian::read_u16(&data[12..14]) as usize,
        _ => BigEndian::read_u32(&data[12..16]) as usize,
    };

    let mut raw = header_len + 8 + payload_length;
    if flags & FLAG_HAS_RECIPIENT != 0 {
        raw += 8;
    }
    if flags & FLAG_HAS_SIGNATURE != 0 {
        raw += SIGNATURE_SIZE;
    }

    // The sender padded to the next standard block, if one fits
    let padded = PADDING_BLOCK_SIZES
        .iter()
        .find(|&&block| block >= raw)
        .copied()
        .unwrap_or(raw);
    Some(padded)
}

/// Per-link frame assembler
pub struct StreamAssembler {
    buffer: Vec<u8>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed one characteristic write; returns every frame it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > MAX_BUFFERED {
            self.buffer.clear();
            return Vec::new();
        }

        let mut frames = Vec::new();
        loop {
            match expected_frame_len(&self.buffer) {
                None => break,
                Some(0) => {
                    // Unparseable: drop the stream and resynchronize on the
                    // next connection-level framing
                    self.buffer.clear();
                    break;
                }
                Some(length) if self.buffer.len() >= length => {
                    let frame = self.buffer.drain(..length).collect();
                    frames.push(frame);
                }
                Some(_) => break,
            }
        }
        frames
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for StreamAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{binary, BitchatPacket, MessageType};

    fn frame(payload: &[u8]) -> Vec<u8> {
        let packet = BitchatPacket::new(MessageType::Message, [1u8; 8], payload.to_vec());
        binary::encode(&packet).unwrap()
    }

    #[test]
    fn single_write_single_frame() {
        let bytes = frame(b"hello");
        let mut assembler = StreamAssembler::new();
        let frames = assembler.push(&bytes);
        assert_eq!(frames, vec![bytes]);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn mtu_sized_chunks_reassemble() {
        let bytes = frame(&vec![7u8; 300]);
        let mut assembler = StreamAssembler::new();
        let mut frames = Vec::new();
        for chunk in bytes.chunks(182) {
            frames.extend(assembler.push(chunk));
        }
        assert_eq!(frames, vec![bytes]);
    }

    #[test]
    fn back_to_back_frames_split() {
        let first = frame(b"one");
        let second = frame(b"two");
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let mut assembler = StreamAssembler::new();
        let frames = assembler.push(&stream);
        assert_eq!(frames, vec![first, second]);
    }

    #[test]
    fn garbage_resets_stream() {
        let mut assembler = StreamAssembler::new();
        let frames = assembler.push(&[0xFFu8; 64]);
        assert!(frames.is_empty());
        assert_eq!(assembler.buffered(), 0);
    }
}
