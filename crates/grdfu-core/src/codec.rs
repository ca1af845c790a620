//! Cursor-based little-endian codec over a fixed-capacity buffer.
//!
//! Every frame of both DFU protocols is built and taken apart with
//! [`ByteCursor`]. Writes are clamped to the remaining capacity and reads past
//! the end yield zero bytes, so callers must size buffers correctly; nothing
//! here ever fails or panics on a short buffer.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

/// Unsigned sum of every byte, wrapping at 2^32.
pub fn byte_sum(data: &[u8]) -> u32 {
    data.iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

/// Fixed-capacity byte buffer with a read/write cursor.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ByteCursor {
    buf: Vec<u8>,
    pos: usize,
}

impl ByteCursor {
    /// Zero-filled buffer of `capacity` bytes, cursor at 0.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            pos: 0,
        }
    }

    /// Wrap existing bytes, cursor at 0.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            buf: data.into(),
            pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Move the cursor, clamped to the buffer length.
    pub fn set_pos(&mut self, pos: usize) -> &mut Self {
        self.pos = pos.min(self.buf.len());
        self
    }

    /// Move the cursor; a negative value counts back from the end.
    pub fn set_pos_signed(&mut self, pos: isize) -> usize {
        self.pos = resolve_start(pos, self.buf.len());
        self.pos
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Write the low `size` bytes of `value` little-endian.
    ///
    /// Sizes above 8 are truncated to 8; the write is clamped to the remaining
    /// capacity.
    pub fn put(&mut self, size: usize, value: u64) -> &mut Self {
        let n = size.min(8).min(self.remaining());
        if n == 0 {
            return self;
        }
        let masked = if n == 8 {
            value
        } else {
            value & ((1u64 << (n * 8)) - 1)
        };
        LittleEndian::write_uint(&mut self.buf[self.pos..self.pos + n], masked, n);
        self.pos += n;
        self
    }

    pub fn put_byte(&mut self, byte: u8) -> &mut Self {
        if self.pos < self.buf.len() {
            self.buf[self.pos] = byte;
            self.pos += 1;
        }
        self
    }

    /// Copy up to `size` bytes of `src` starting at `from`.
    ///
    /// A negative `from` counts back from the end of `src`. The copy is clamped
    /// both to what `src` holds and to the remaining capacity.
    pub fn put_bytes(&mut self, size: usize, src: &[u8], from: isize) -> &mut Self {
        let start = resolve_start(from, src.len());
        let n = size
            .min(src.len().saturating_sub(start))
            .min(self.remaining());
        if n > 0 {
            self.buf[self.pos..self.pos + n].copy_from_slice(&src[start..start + n]);
            self.pos += n;
        }
        self
    }

    /// Read `size` (at most 8) little-endian bytes.
    ///
    /// Past the end the missing high bytes read as zero.
    pub fn get(&mut self, size: usize) -> u64 {
        let n = size.min(8).min(self.remaining());
        if n == 0 {
            return 0;
        }
        let value = LittleEndian::read_uint(&self.buf[self.pos..self.pos + n], n);
        self.pos += n;
        value
    }

    pub fn get_u8(&mut self) -> u8 {
        self.get(1) as u8
    }

    pub fn get_u16(&mut self) -> u16 {
        self.get(2) as u16
    }

    pub fn get_u32(&mut self) -> u32 {
        self.get(4) as u32
    }

    /// Take `size` bytes, zero-padded when the buffer runs out.
    pub fn get_bytes(&mut self, size: usize) -> Vec<u8> {
        let mut out = vec![0u8; size];
        let n = size.min(self.remaining());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        out
    }

    /// Byte-sum of `[from, from + size)`, clamped to the buffer bounds.
    ///
    /// A negative `from` counts back from the end.
    pub fn checksum(&self, size: usize, from: isize) -> u32 {
        let start = resolve_start(from, self.buf.len());
        let end = start.saturating_add(size).min(self.buf.len());
        if start >= end {
            return 0;
        }
        byte_sum(&self.buf[start..end])
    }

    pub fn to_hex(&self) -> String {
        to_hex(&self.buf)
    }
}

impl fmt::Debug for ByteCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteCursor")
            .field("len", &self.buf.len())
            .field("pos", &self.pos)
            .finish()
    }
}

/// Uppercase hex rendering used in trace logs.
pub fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect()
}

fn resolve_start(from: isize, len: usize) -> usize {
    if from < 0 {
        len.saturating_sub(from.unsigned_abs())
    } else {
        (from as usize).min(len)
    }
}
