//! Binary codec: packet framing, compression gate, standard-block padding

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Cursor, Read, Write};

use super::{
    BitchatPacket, MessageType, COMPRESSION_THRESHOLD, FLAG_HAS_RECIPIENT, FLAG_HAS_SIGNATURE,
    FLAG_IS_COMPRESSED, MAX_COMPRESSION_RATIO, MAX_DECOMPRESSED_SIZE, PADDING_BLOCK_SIZES,
    PROTOCOL_VERSION_1, PROTOCOL_VERSION_2, SIGNATURE_SIZE,
};
use crate::error::{Error, Result};

/// Decode failure classification: underflow failures are retried after
/// trimming trailing padding zeros, fatal ones are not.
enum DecodeFailure {
    Underflow,
    Fatal(Error),
}

impl From<Error> for DecodeFailure {
    fn from(err: Error) -> Self {
        DecodeFailure::Fatal(err)
    }
}

/// Encode a packet to its padded wire form
pub fn encode(packet: &BitchatPacket) -> Result<Vec<u8>> {
    let frame = encode_inner(packet, true)?;
    Ok(pad_to_block(frame))
}

/// Encode a packet without padding (fragmentation sizing, relay re-encode)
pub fn encode_unpadded(packet: &BitchatPacket) -> Result<Vec<u8>> {
    encode_inner(packet, true)
}

/// Canonical bytes an announcement signature covers: the unpadded,
/// uncompressed encoding with TTL forced to 0 and the signature absent.
/// Stable under relay, which only mutates TTL.
pub fn signing_image(packet: &BitchatPacket) -> Result<Vec<u8>> {
    let mut canonical = packet.clone();
    canonical.ttl = 0;
    canonical.signature = None;
    encode_inner(&canonical, false)
}

/// Decode a frame, tolerating standard-block padding.
///
/// The first parse runs against the bytes as received; only a
/// bounded-underflow failure triggers a retry with trailing zeros
/// trimmed, so stray padding can never alter packet semantics.
pub fn decode(data: &[u8]) -> Result<BitchatPacket> {
    match decode_inner(data) {
        Ok(packet) => Ok(packet),
        Err(DecodeFailure::Fatal(err)) => Err(err),
        Err(DecodeFailure::Underflow) => {
            let trimmed_len = data.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
            let trimmed = &data[..trimmed_len];
            if trimmed.len() == data.len() {
                return Err(Error::Malformed("truncated frame".into()));
            }
            match decode_inner(trimmed) {
                Ok(packet) => Ok(packet),
                Err(DecodeFailure::Underflow) => Err(Error::Malformed("truncated frame".into())),
                Err(DecodeFailure::Fatal(err)) => Err(err),
            }
        }
    }
}

fn encode_inner(packet: &BitchatPacket, allow_compression: bool) -> Result<Vec<u8>> {
    let size_width = match packet.version {
        PROTOCOL_VERSION_1 => 2usize,
        PROTOCOL_VERSION_2 => 4usize,
        other => return Err(Error::UnsupportedVersion(other)),
    };

    // Compression gate: attempt zlib for payloads at the threshold, keep
    // the compressed form only when it actually shrinks.
    let (payload_region, compressed) = if allow_compression
        && packet.payload.len() >= COMPRESSION_THRESHOLD
    {
        let candidate = compress(&packet.payload)?;
        if candidate.len() < packet.payload.len() {
            let mut region = Vec::with_capacity(size_width + candidate.len());
            match packet.version {
                PROTOCOL_VERSION_1 => {
                    region.write_u16::<BigEndian>(original_size_u16(packet.payload.len())?)?
                }
                _ => region.write_u32::<BigEndian>(packet.payload.len() as u32)?,
            }
            region.extend_from_slice(&candidate);
            (region, true)
        } else {
            (packet.payload.clone(), false)
        }
    } else {
        (packet.payload.clone(), false)
    };

    if packet.payload.len() > MAX_DECOMPRESSED_SIZE {
        return Err(Error::SizeExceeded(format!(
            "payload {} exceeds frame cap",
            packet.payload.len()
        )));
    }
    let max_region = match packet.version {
        PROTOCOL_VERSION_1 => u16::MAX as usize,
        _ => MAX_DECOMPRESSED_SIZE + 4,
    };
    if payload_region.len() > max_region {
        return Err(Error::SizeExceeded(format!(
            "payload region {} too large for v{}",
            payload_region.len(),
            packet.version
        )));
    }

    let mut flags = 0u8;
    if packet.recipient_id.is_some() {
        flags |= FLAG_HAS_RECIPIENT;
    }
    if packet.signature.is_some() {
        flags |= FLAG_HAS_SIGNATURE;
    }
    if compressed {
        flags |= FLAG_IS_COMPRESSED;
    }

    let mut buffer = Vec::with_capacity(16 + 16 + payload_region.len() + SIGNATURE_SIZE);
    buffer.write_u8(packet.version)?;
    buffer.write_u8(packet.packet_type.as_u8())?;
    buffer.write_u8(packet.ttl)?;
    buffer.write_u64::<BigEndian>(packet.timestamp)?;
    buffer.write_u8(flags)?;
    match packet.version {
        PROTOCOL_VERSION_1 => buffer.write_u16::<BigEndian>(payload_region.len() as u16)?,
        _ => buffer.write_u32::<BigEndian>(payload_region.len() as u32)?,
    }

    buffer.extend_from_slice(&packet.sender_id);
    if let Some(recipient) = &packet.recipient_id {
        buffer.extend_from_slice(recipient);
    }
    buffer.extend_from_slice(&payload_region);
    if let Some(signature) = &packet.signature {
        buffer.extend_from_slice(signature);
    }

    Ok(buffer)
}

fn decode_inner(data: &[u8]) -> std::result::Result<BitchatPacket, DecodeFailure> {
    let mut cursor = Cursor::new(data);

    let version = cursor.read_u8().map_err(|_| DecodeFailure::Underflow)?;
    let size_width = match version {
        PROTOCOL_VERSION_1 => 2usize,
        PROTOCOL_VERSION_2 => 4usize,
        other => return Err(DecodeFailure::Fatal(Error::UnsupportedVersion(other))),
    };

    let raw_type = cursor.read_u8().map_err(|_| DecodeFailure::Underflow)?;
    let packet_type = MessageType::from_u8(raw_type)?;
    let ttl = cursor.read_u8().map_err(|_| DecodeFailure::Underflow)?;
    let timestamp = cursor
        .read_u64::<BigEndian>()
        .map_err(|_| DecodeFailure::Underflow)?;
    let flags = cursor.read_u8().map_err(|_| DecodeFailure::Underflow)?;
    let payload_length = match version {
        PROTOCOL_VERSION_1 => cursor
            .read_u16::<BigEndian>()
            .map_err(|_| DecodeFailure::Underflow)? as usize,
        _ => cursor
            .read_u32::<BigEndian>()
            .map_err(|_| DecodeFailure::Underflow)? as usize,
    };

    if payload_length > MAX_DECOMPRESSED_SIZE + size_width {
        return Err(DecodeFailure::Fatal(Error::SizeExceeded(format!(
            "declared payload length {}",
            payload_length
        ))));
    }

    let mut sender_id = [0u8; 8];
    cursor
        .read_exact(&mut sender_id)
        .map_err(|_| DecodeFailure::Underflow)?;

    let recipient_id = if flags & FLAG_HAS_RECIPIENT != 0 {
        let mut recipient = [0u8; 8];
        cursor
            .read_exact(&mut recipient)
            .map_err(|_| DecodeFailure::Underflow)?;
        Some(recipient)
    } else {
        None
    };

    let mut payload_region = vec![0u8; payload_length];
    cursor
        .read_exact(&mut payload_region)
        .map_err(|_| DecodeFailure::Underflow)?;

    let signature = if flags & FLAG_HAS_SIGNATURE != 0 {
        let mut signature = [0u8; SIGNATURE_SIZE];
        cursor
            .read_exact(&mut signature)
            .map_err(|_| DecodeFailure::Underflow)?;
        Some(signature)
    } else {
        None
    };

    let payload = if flags & FLAG_IS_COMPRESSED != 0 {
        decompress_region(&payload_region, version, size_width)?
    } else {
        payload_region
    };

    Ok(BitchatPacket {
        version,
        packet_type,
        ttl,
        timestamp,
        sender_id,
        recipient_id,
        payload,
        signature,
    })
}

fn decompress_region(
    region: &[u8],
    version: u8,
    size_width: usize,
) -> std::result::Result<Vec<u8>, DecodeFailure> {
    if region.len() < size_width {
        return Err(DecodeFailure::Fatal(Error::Malformed(
            "compressed region shorter than size prefix".into(),
        )));
    }
    let mut cursor = Cursor::new(region);
    let original_size = match version {
        PROTOCOL_VERSION_1 => cursor
            .read_u16::<BigEndian>()
            .map_err(|_| DecodeFailure::Underflow)? as usize,
        _ => cursor
            .read_u32::<BigEndian>()
            .map_err(|_| DecodeFailure::Underflow)? as usize,
    };
    let compressed = &region[size_width..];

    if original_size > MAX_DECOMPRESSED_SIZE {
        return Err(DecodeFailure::Fatal(Error::SizeExceeded(format!(
            "declared original size {}",
            original_size
        ))));
    }
    if compressed.is_empty() || original_size / compressed.len().max(1) > MAX_COMPRESSION_RATIO {
        return Err(DecodeFailure::Fatal(Error::SizeExceeded(format!(
            "suspicious compression ratio ({} from {} bytes)",
            original_size,
            compressed.len()
        ))));
    }

    // Bounded read: never allocate past the declared size plus one probe byte
    let mut decoder = ZlibDecoder::new(compressed).take(original_size as u64 + 1);
    let mut output = Vec::with_capacity(original_size.min(MAX_DECOMPRESSED_SIZE));
    decoder
        .read_to_end(&mut output)
        .map_err(|e| DecodeFailure::Fatal(Error::CompressionFailure(e.to_string())))?;
    if output.len() != original_size {
        return Err(DecodeFailure::Fatal(Error::CompressionFailure(format!(
            "decoded {} bytes, declared {}",
            output.len(),
            original_size
        ))));
    }
    Ok(output)
}

fn compress(payload: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(payload)
        .map_err(|e| Error::CompressionFailure(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| Error::CompressionFailure(e.to_string()))
}

fn original_size_u16(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::SizeExceeded(format!("payload {} too large for v1", len)))
}

/// Right-pad with zeros to the next standard block size; frames larger
/// than the largest block travel unpadded.
fn pad_to_block(mut frame: Vec<u8>) -> Vec<u8> {
    if let Some(&block) = PADDING_BLOCK_SIZES.iter().find(|&&b| b >= frame.len()) {
        frame.resize(block, 0);
    }
    frame
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn any_packet_round_trips(
            payload in proptest::collection::vec(any::<u8>(), 0..4096),
            ttl in any::<u8>(),
            has_recipient in any::<bool>(),
            version in 1u8..=2,
            timestamp in any::<u64>(),
        ) {
            let packet = BitchatPacket {
                version,
                packet_type: MessageType::Message,
                ttl,
                timestamp,
                sender_id: [5u8; 8],
                recipient_id: has_recipient.then_some([9u8; 8]),
                payload,
                signature: None,
            };
            let padded = decode(&encode(&packet).unwrap()).unwrap();
            prop_assert_eq!(&padded, &packet);
            let unpadded = decode(&encode_unpadded(&packet).unwrap()).unwrap();
            prop_assert_eq!(&unpadded, &packet);
        }
    }
}
