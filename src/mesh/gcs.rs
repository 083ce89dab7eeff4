//! Golomb-Coded-Set filters for gossip anti-entropy
//!
//! A GCS filter is a compact probabilistic set summary: packet IDs map
//! into `[0, n*m)` and the sorted values travel as Golomb-Rice coded
//! deltas. Membership tests may rarely report a false positive (≈ 1/m),
//! never a false negative.

use crate::error::{Error, Result};

/// Default Rice parameter (remainder bits per value)
pub const DEFAULT_GCS_P: u8 = 7;

/// Default modulus: ≈ 0.78 % false-positive rate
pub const DEFAULT_GCS_M: u32 = 128;

/// Map a packet ID into the filter range
fn map_to_range(id: &[u8; 32], range: u64) -> u64 {
    if range == 0 {
        return 0;
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&id[..8]);
    u64::from_be_bytes(prefix) % range
}

/// A decoded GCS filter: parameters plus the sorted mapped values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcsFilter {
    p: u8,
    m: u32,
    n: u32,
    values: Vec<u64>,
}

impl GcsFilter {
    /// Build a filter over `ids`, capping the encoded size at `max_bytes`.
    /// IDs beyond the cap are dropped from the summary (the next sync
    /// round covers them).
    pub fn build(ids: &[[u8; 32]], p: u8, m: u32, max_bytes: usize) -> Self {
        // Each value costs roughly p+2 bits; leave room for the count
        // prefix
        let budget_bits = max_bytes.saturating_sub(4).saturating_mul(8);
        let max_items = if p as usize + 2 == 0 {
            0
        } else {
            budget_bits / (p as usize + 2)
        };
        let ids = &ids[..ids.len().min(max_items)];

        let n = ids.len() as u32;
        let range = n as u64 * m as u64;
        let mut values: Vec<u64> = ids.iter().map(|id| map_to_range(id, range)).collect();
        values.sort_unstable();

        Self { p, m, n, values }
    }

    pub fn contains(&self, id: &[u8; 32]) -> bool {
        let range = self.n as u64 * self.m as u64;
        if range == 0 {
            return false;
        }
        let target = map_to_range(id, range);
        self.values.binary_search(&target).is_ok()
    }

    pub fn p(&self) -> u8 {
        self.p
    }

    pub fn m(&self) -> u32 {
        self.m
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Serialize: u32 BE count, then Golomb-Rice coded deltas
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = BitWriter::new();
        let mut previous = 0u64;
        for &value in &self.values {
            let delta = value - previous;
            previous = value;
            // Unary quotient, then p remainder bits
            let quotient = delta >> self.p;
            for _ in 0..quotient {
                writer.push_bit(true);
            }
            writer.push_bit(false);
            writer.push_bits(delta & ((1u64 << self.p) - 1), self.p as usize);
        }

        let mut bytes = Vec::with_capacity(4 + writer.bytes.len());
        bytes.extend_from_slice(&self.n.to_be_bytes());
        bytes.extend_from_slice(&writer.bytes);
        bytes
    }

    /// Parse a received filter with the parameters carried beside it
    pub fn from_bytes(p: u8, m: u32, bytes: &[u8]) -> Result<Self> {
        if p == 0 || p > 32 {
            return Err(Error::Malformed(format!("gcs parameter p={}", p)));
        }
        if bytes.len() < 4 {
            return Err(Error::Malformed("gcs filter shorter than count".into()));
        }
        let n = u32::from_be_bytes(bytes[..4].try_into().unwrap_or([0u8; 4]));
        if n as usize > bytes.len().saturating_sub(4).saturating_mul(8) {
            // Even one bit per value would not fit
            return Err(Error::Malformed("gcs count exceeds filter bits".into()));
        }

        let mut reader = BitReader::new(&bytes[4..]);
        let mut values = Vec::with_capacity(n as usize);
        let mut previous = 0u64;
        for _ in 0..n {
            let mut quotient = 0u64;
            loop {
                match reader.read_bit() {
                    Some(true) => quotient += 1,
                    Some(false) => break,
                    None => return Err(Error::Malformed("gcs filter truncated".into())),
                }
                if quotient > 1 << 24 {
                    return Err(Error::Malformed("gcs quotient overflow".into()));
                }
            }
            let remainder = reader
                .read_bits(p as usize)
                .ok_or_else(|| Error::Malformed("gcs filter truncated".into()))?;
            let delta = (quotient << p) | remainder;
            previous += delta;
            values.push(previous);
        }

        Ok(Self { p, m, n, values })
    }
}

struct BitWriter {
    bytes: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            bit_len: 0,
        }
    }

    fn push_bit(&mut self, bit: bool) {
        if self.bit_len % 8 == 0 {
            self.bytes.push(0);
        }
        if bit {
            let byte = self.bit_len / 8;
            self.bytes[byte] |= 0x80 >> (self.bit_len % 8);
        }
        self.bit_len += 1;
    }

    fn push_bits(&mut self, value: u64, count: usize) {
        for shift in (0..count).rev() {
            self.push_bit((value >> shift) & 1 == 1);
        }
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn read_bit(&mut self) -> Option<bool> {
        let byte = self.position / 8;
        if byte >= self.data.len() {
            return None;
        }
        let bit = (self.data[byte] >> (7 - self.position % 8)) & 1 == 1;
        self.position += 1;
        Some(bit)
    }

    fn read_bits(&mut self, count: usize) -> Option<u64> {
        let mut value = 0u64;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()? as u64;
        }
        Some(value)
    }
}
