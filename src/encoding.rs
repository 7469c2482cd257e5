//! Bit-level codecs for compressed chunks (delta-of-delta timestamps, Gorilla XOR floats)
//! and small little-endian helpers shared with the persistence container.

use crate::error::DbError;

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Worst-case encoded size of one sample in the compressed bit stream, in bytes.
///
/// Timestamp: 4 control bits + 64 bits. Value: 2 control bits + 6 + 6 + 64 bits.
pub(crate) const MAX_COMPRESSED_SAMPLE_BYTES: usize = 19;

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn read_u32<R: Read>(r: &mut R) -> Result<u32, DbError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}
pub fn read_u64<R: Read>(r: &mut R) -> Result<u64, DbError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

#[inline]
fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn corrupt(details: &str) -> DbError {
    DbError::Corruption {
        details: details.to_string(),
        series: None,
    }
}

/// Growable, owned bit stream. Bits are packed MSB-first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BitBuf {
    bytes: Vec<u8>,
    /// Bits used in the last byte (0 means the last byte is full or the buffer is empty).
    used: u8,
}

impl BitBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn push_bit(&mut self, bit: bool) {
        if self.used == 0 {
            self.bytes.push(0);
        }
        if bit {
            if let Some(last) = self.bytes.last_mut() {
                *last |= 1u8 << (7 - self.used);
            }
        }
        self.used = (self.used + 1) % 8;
    }

    pub fn push_bits(&mut self, mut v: u64, count: u8) {
        if count == 0 {
            return;
        }
        if count < 64 {
            v &= (1u64 << count) - 1;
        }
        for i in (0..count).rev() {
            self.push_bit(((v >> i) & 1) == 1);
        }
    }
}

/// Reads bits back from a [`BitBuf`] byte slice.
pub struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn read_bit(&mut self) -> Result<bool, DbError> {
        let byte = self
            .bytes
            .get(self.pos / 8)
            .ok_or_else(|| corrupt("Compressed chunk bit stream truncated"))?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1 == 1;
        self.pos += 1;
        Ok(bit)
    }

    pub fn read_bits(&mut self, count: u8) -> Result<u64, DbError> {
        let mut out = 0u64;
        for _ in 0..count {
            out <<= 1;
            out |= if self.read_bit()? { 1 } else { 0 };
        }
        Ok(out)
    }
}

/// Delta-of-delta timestamp encoder state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct TimestampEncoder {
    prev: u64,
    prev_delta: i64,
}

impl TimestampEncoder {
    pub(crate) fn new(first: u64) -> Self {
        Self {
            prev: first,
            prev_delta: 0,
        }
    }

    pub(crate) fn push(&mut self, out: &mut BitBuf, ts: u64) {
        let delta = ts.wrapping_sub(self.prev) as i64;
        let z = zigzag(delta.wrapping_sub(self.prev_delta));
        if z == 0 {
            out.push_bit(false);
        } else if z < (1 << 7) {
            out.push_bits(0b10, 2);
            out.push_bits(z, 7);
        } else if z < (1 << 9) {
            out.push_bits(0b110, 3);
            out.push_bits(z, 9);
        } else if z < (1 << 12) {
            out.push_bits(0b1110, 4);
            out.push_bits(z, 12);
        } else {
            out.push_bits(0b1111, 4);
            out.push_bits(z, 64);
        }
        self.prev = ts;
        self.prev_delta = delta;
    }

    pub(crate) fn read(&mut self, r: &mut BitReader<'_>) -> Result<u64, DbError> {
        let mut ones = 0u8;
        while ones < 4 && r.read_bit()? {
            ones += 1;
        }
        let z = match ones {
            0 => 0,
            1 => r.read_bits(7)?,
            2 => r.read_bits(9)?,
            3 => r.read_bits(12)?,
            _ => r.read_bits(64)?,
        };
        let delta = self.prev_delta.wrapping_add(unzigzag(z));
        let ts = self.prev.wrapping_add(delta as u64);
        self.prev = ts;
        self.prev_delta = delta;
        Ok(ts)
    }
}

/// Gorilla-style XOR float encoder state (leading/trailing-zero window reuse).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct XorEncoder {
    prev: u64,
    leading: u8,
    trailing: u8,
    sigbits: u8,
}

impl XorEncoder {
    pub(crate) fn new(first: f64) -> Self {
        Self {
            prev: first.to_bits(),
            ..Self::default()
        }
    }

    pub(crate) fn push(&mut self, out: &mut BitBuf, value: f64) {
        let cur = value.to_bits();
        let x = self.prev ^ cur;
        if x == 0 {
            out.push_bit(false);
        } else {
            out.push_bit(true);
            let leading = x.leading_zeros() as u8;
            let trailing = x.trailing_zeros() as u8;
            let sigbits = 64 - leading - trailing;

            if self.sigbits != 0 && leading >= self.leading && trailing >= self.trailing {
                out.push_bit(false);
                out.push_bits(x >> self.trailing, self.sigbits);
            } else {
                out.push_bit(true);
                out.push_bits(leading as u64, 6);
                out.push_bits((sigbits - 1) as u64, 6);
                out.push_bits(x >> trailing, sigbits);
                self.leading = leading;
                self.trailing = trailing;
                self.sigbits = sigbits;
            }
        }
        self.prev = cur;
    }

    pub(crate) fn read(&mut self, r: &mut BitReader<'_>) -> Result<f64, DbError> {
        if !r.read_bit()? {
            return Ok(f64::from_bits(self.prev));
        }
        if r.read_bit()? {
            let leading = r.read_bits(6)? as u8;
            let sigbits = r.read_bits(6)? as u8 + 1;
            if leading as u16 + sigbits as u16 > 64 {
                return Err(corrupt("Invalid Gorilla bit widths"));
            }
            self.leading = leading;
            self.sigbits = sigbits;
            self.trailing = 64 - leading - sigbits;
        } else if self.sigbits == 0 {
            return Err(corrupt("Gorilla reuse window before initialization"));
        }
        let significant = r.read_bits(self.sigbits)?;
        self.prev ^= significant << self.trailing;
        Ok(f64::from_bits(self.prev))
    }
}
