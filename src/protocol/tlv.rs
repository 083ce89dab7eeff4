//! TLV payload codecs: announcements, file packets, Noise envelopes

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

// Announcement tags
const TLV_NICKNAME: u8 = 0x01;
const TLV_NOISE_PUBLIC_KEY: u8 = 0x02;
const TLV_SIGNING_PUBLIC_KEY: u8 = 0x03;

// File packet tags
const TLV_FILE_NAME: u8 = 0x01;
const TLV_FILE_SIZE: u8 = 0x02;
const TLV_MIME_TYPE: u8 = 0x03;
const TLV_FILE_CONTENT: u8 = 0x04;

// Private message tags
const TLV_MESSAGE_ID: u8 = 0x01;
const TLV_MESSAGE_CONTENT: u8 = 0x02;

/// Identity announcement payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub nickname: String,
    pub noise_public_key: [u8; 32],
    pub signing_public_key: [u8; 32],
}

impl Announcement {
    /// Encode as `tag, u8 length, value` triples
    pub fn encode(&self) -> Result<Vec<u8>> {
        let nickname = self.nickname.as_bytes();
        if nickname.len() > u8::MAX as usize {
            return Err(Error::SizeExceeded("nickname too long".into()));
        }
        let mut buffer = Vec::with_capacity(6 + nickname.len() + 64);
        buffer.push(TLV_NICKNAME);
        buffer.push(nickname.len() as u8);
        buffer.extend_from_slice(nickname);
        buffer.push(TLV_NOISE_PUBLIC_KEY);
        buffer.push(32);
        buffer.extend_from_slice(&self.noise_public_key);
        buffer.push(TLV_SIGNING_PUBLIC_KEY);
        buffer.push(32);
        buffer.extend_from_slice(&self.signing_public_key);
        Ok(buffer)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut nickname = None;
        let mut noise_public_key = None;
        let mut signing_public_key = None;

        let mut offset = 0usize;
        while offset + 2 <= data.len() {
            let tag = data[offset];
            let length = data[offset + 1] as usize;
            offset += 2;
            if offset + length > data.len() {
                return Err(Error::Malformed("announce TLV overrun".into()));
            }
            let value = &data[offset..offset + length];
            offset += length;
            match tag {
                TLV_NICKNAME => {
                    let name = std::str::from_utf8(value)
                        .map_err(|_| Error::Malformed("nickname not UTF-8".into()))?;
                    nickname = Some(name.to_string());
                }
                TLV_NOISE_PUBLIC_KEY => noise_public_key = Some(key_from(value)?),
                TLV_SIGNING_PUBLIC_KEY => signing_public_key = Some(key_from(value)?),
                _ => {} // unknown tags are skipped for forward compatibility
            }
        }

        Ok(Self {
            nickname: nickname.ok_or_else(|| Error::Malformed("announce missing nickname".into()))?,
            noise_public_key: noise_public_key
                .ok_or_else(|| Error::Malformed("announce missing noise key".into()))?,
            signing_public_key: signing_public_key
                .ok_or_else(|| Error::Malformed("announce missing signing key".into()))?,
        })
    }
}

fn key_from(value: &[u8]) -> Result<[u8; 32]> {
    value
        .try_into()
        .map_err(|_| Error::Malformed("key field must be 32 bytes".into()))
}

/// File payload carried in MESSAGE and FILE_TRANSFER packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePacket {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub content: Vec<u8>,
}

impl FilePacket {
    /// Encode with the preferred widths: u32 file size, u32 content length
    pub fn encode(&self) -> Result<Vec<u8>> {
        let name = self.file_name.as_bytes();
        let mime = self.mime_type.as_bytes();
        if name.len() > u8::MAX as usize || mime.len() > u8::MAX as usize {
            return Err(Error::SizeExceeded("file name or mime type too long".into()));
        }
        let size = u32::try_from(self.file_size)
            .map_err(|_| Error::SizeExceeded("file size field".into()))?;
        let content_len = u32::try_from(self.content.len())
            .map_err(|_| Error::SizeExceeded("file content".into()))?;

        let mut buffer = Vec::with_capacity(16 + name.len() + mime.len() + self.content.len());
        buffer.push(TLV_FILE_NAME);
        buffer.push(name.len() as u8);
        buffer.extend_from_slice(name);
        buffer.push(TLV_FILE_SIZE);
        buffer.push(4);
        buffer.extend_from_slice(&size.to_be_bytes());
        buffer.push(TLV_MIME_TYPE);
        buffer.push(mime.len() as u8);
        buffer.extend_from_slice(mime);
        buffer.push(TLV_FILE_CONTENT);
        buffer.extend_from_slice(&content_len.to_be_bytes());
        buffer.extend_from_slice(&self.content);
        Ok(buffer)
    }

    /// Decode, tolerating the legacy widths (u64 file size, u16 content
    /// length) older encoders produced
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut file_name = None;
        let mut file_size = None;
        let mut mime_type = None;
        let mut content = None;

        let mut offset = 0usize;
        while offset < data.len() {
            let tag = data[offset];
            offset += 1;
            match tag {
                TLV_FILE_CONTENT => {
                    let (bytes, consumed) = read_content(&data[offset..])?;
                    content = Some(bytes);
                    offset += consumed;
                }
                _ => {
                    if offset >= data.len() {
                        return Err(Error::Malformed("file TLV truncated".into()));
                    }
                    let length = data[offset] as usize;
                    offset += 1;
                    if offset + length > data.len() {
                        return Err(Error::Malformed("file TLV overrun".into()));
                    }
                    let value = &data[offset..offset + length];
                    offset += length;
                    match tag {
                        TLV_FILE_NAME => {
                            file_name = Some(utf8_field(value, "file name")?);
                        }
                        TLV_FILE_SIZE => file_size = Some(read_file_size(value)?),
                        TLV_MIME_TYPE => {
                            mime_type = Some(utf8_field(value, "mime type")?);
                        }
                        _ => {}
                    }
                }
            }
        }

        let content =
            content.ok_or_else(|| Error::Malformed("file packet missing content".into()))?;
        Ok(Self {
            file_name: file_name.unwrap_or_default(),
            file_size: file_size.unwrap_or(content.len() as u64),
            mime_type: mime_type.unwrap_or_else(|| "application/octet-stream".to_string()),
            content,
        })
    }
}

fn utf8_field(value: &[u8], what: &str) -> Result<String> {
    std::str::from_utf8(value)
        .map(str::to_string)
        .map_err(|_| Error::Malformed(format!("{} not UTF-8", what)))
}

fn read_file_size(value: &[u8]) -> Result<u64> {
    match value.len() {
        4 => Ok(BigEndian::read_u32(value) as u64),
        8 => Ok(BigEndian::read_u64(value)), // legacy encoders
        other => Err(Error::Malformed(format!("file size field of {} bytes", other))),
    }
}

/// Content carries an explicit big-endian length: u32 preferred, u16
/// tolerated when the u32 reading would overrun the buffer
fn read_content(data: &[u8]) -> Result<(Vec<u8>, usize)> {
    if data.len() >= 4 {
        let length = BigEndian::read_u32(data) as usize;
        if 4 + length <= data.len() {
            return Ok((data[4..4 + length].to_vec(), 4 + length));
        }
    }
    if data.len() >= 2 {
        let length = BigEndian::read_u16(data) as usize;
        if 2 + length <= data.len() {
            return Ok((data[2..2 + length].to_vec(), 2 + length));
        }
    }
    Err(Error::Malformed("file content length overrun".into()))
}

/// Envelope types carried inside Noise transport ciphertext
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NoisePayloadType {
    PrivateMessage = 0x01,
    Delivered = 0x02,
    ReadReceipt = 0x03,
    FileTransfer = 0x04,
}

impl NoisePayloadType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(NoisePayloadType::PrivateMessage),
            0x02 => Ok(NoisePayloadType::Delivered),
            0x03 => Ok(NoisePayloadType::ReadReceipt),
            0x04 => Ok(NoisePayloadType::FileTransfer),
            other => Err(Error::Malformed(format!("unknown noise payload 0x{:02x}", other))),
        }
    }
}

/// Tagged envelope inside the Noise transport: one type byte then the body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoisePayload {
    pub payload_type: NoisePayloadType,
    pub data: Vec<u8>,
}

impl NoisePayload {
    pub fn new(payload_type: NoisePayloadType, data: Vec<u8>) -> Self {
        Self { payload_type, data }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(1 + self.data.len());
        buffer.push(self.payload_type as u8);
        buffer.extend_from_slice(&self.data);
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (&first, rest) = data
            .split_first()
            .ok_or_else(|| Error::Malformed("empty noise payload".into()))?;
        Ok(Self {
            payload_type: NoisePayloadType::from_u8(first)?,
            data: rest.to_vec(),
        })
    }
}

/// Private message body: TLV {message id, content} with u16 lengths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessage {
    pub message_id: String,
    pub content: String,
}

impl PrivateMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let id = self.message_id.as_bytes();
        let content = self.content.as_bytes();
        if id.len() > u16::MAX as usize || content.len() > u16::MAX as usize {
            return Err(Error::SizeExceeded("private message field".into()));
        }
        let mut buffer = Vec::with_capacity(6 + id.len() + content.len());
        for (tag, value) in [(TLV_MESSAGE_ID, id), (TLV_MESSAGE_CONTENT, content)] {
            buffer.push(tag);
            let mut length = [0u8; 2];
            BigEndian::write_u16(&mut length, value.len() as u16);
            buffer.extend_from_slice(&length);
            buffer.extend_from_slice(value);
        }
        Ok(buffer)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut message_id = None;
        let mut content = None;

        let mut offset = 0usize;
        while offset + 3 <= data.len() {
            let tag = data[offset];
            let length = BigEndian::read_u16(&data[offset + 1..offset + 3]) as usize;
            offset += 3;
            if offset + length > data.len() {
                return Err(Error::Malformed("private message TLV overrun".into()));
            }
            let value = &data[offset..offset + length];
            offset += length;
            match tag {
                TLV_MESSAGE_ID => message_id = Some(utf8_field(value, "message id")?),
                TLV_MESSAGE_CONTENT => content = Some(utf8_field(value, "message content")?),
                _ => {}
            }
        }

        Ok(Self {
            message_id: message_id
                .ok_or_else(|| Error::Malformed("private message missing id".into()))?,
            content: content
                .ok_or_else(|| Error::Malformed("private message missing content".into()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_round_trip() {
        let announce = Announcement {
            nickname: "alice".to_string(),
            noise_public_key: [1u8; 32],
            signing_public_key: [2u8; 32],
        };
        let decoded = Announcement::decode(&announce.encode().unwrap()).unwrap();
        assert_eq!(decoded, announce);
    }

    #[test]
    fn announcement_missing_key_rejected() {
        let mut data = vec![TLV_NICKNAME, 3];
        data.extend_from_slice(b"bob");
        assert!(Announcement::decode(&data).is_err());
    }

    #[test]
    fn announcement_short_key_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&[TLV_NICKNAME, 1, b'x']);
        data.extend_from_slice(&[TLV_NOISE_PUBLIC_KEY, 16]);
        data.extend_from_slice(&[0u8; 16]);
        data.extend_from_slice(&[TLV_SIGNING_PUBLIC_KEY, 32]);
        data.extend_from_slice(&[0u8; 32]);
        assert!(Announcement::decode(&data).is_err());
    }

    #[test]
    fn file_packet_round_trip() {
        let file = FilePacket {
            file_name: "photo.png".to_string(),
            file_size: 5,
            mime_type: "image/png".to_string(),
            content: vec![1, 2, 3, 4, 5],
        };
        let decoded = FilePacket::decode(&file.encode().unwrap()).unwrap();
        assert_eq!(decoded, file);
    }

    #[test]
    fn file_packet_legacy_widths_tolerated() {
        // 8-byte size, 2-byte content length
        let mut data = Vec::new();
        data.extend_from_slice(&[TLV_FILE_NAME, 1, b'f']);
        data.push(TLV_FILE_SIZE);
        data.push(8);
        data.extend_from_slice(&3u64.to_be_bytes());
        data.extend_from_slice(&[TLV_MIME_TYPE, 10]);
        data.extend_from_slice(b"text/plain");
        data.push(TLV_FILE_CONTENT);
        data.extend_from_slice(&3u16.to_be_bytes());
        data.extend_from_slice(b"abc");

        let decoded = FilePacket::decode(&data).unwrap();
        assert_eq!(decoded.file_size, 3);
        assert_eq!(decoded.content, b"abc");
    }

    #[test]
    fn noise_payload_round_trip() {
        let payload = NoisePayload::new(NoisePayloadType::Delivered, b"id".to_vec());
        let decoded = NoisePayload::decode(&payload.encode()).unwrap();
        assert_eq!(decoded, payload);
        assert!(NoisePayload::decode(&[]).is_err());
        assert!(NoisePayload::decode(&[0x99]).is_err());
    }

    #[test]
    fn private_message_round_trip() {
        let message = PrivateMessage {
            message_id: "550e8400-e29b-41d4-a716-446655440000".to_string(),
            content: "hi".to_string(),
        };
        let decoded = PrivateMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }
}
