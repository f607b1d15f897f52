// =============================================================================
// SATLINK v1.2 - Primitive Codec (VarInt + fixed-width integers)
// =============================================================================
//
// Foundation for all message framing. Everything multi-byte on the wire is
// little-endian, with one deliberate exception: the port field inside peer
// addresses is big-endian. That asymmetry is part of the wire format and
// must be preserved exactly.
//
// VarInt widths (self-describing via prefix byte):
//   value < 0xFD          -> 1 byte
//   prefix 0xFD + u16     -> 3 bytes
//   prefix 0xFE + u32     -> 5 bytes
//   prefix 0xFF + u64     -> 9 bytes
//
// The encoder always emits the canonical (smallest) width. The decoder
// accepts non-canonical forms, since other implementations emit them.
//
// =============================================================================

use crate::error::ProtocolError;
use crate::MAX_SIZE;

// =============================================================================
// VarInt
// =============================================================================

/// Encodes an unsigned integer in canonical variable-width form.
pub fn encode_varint(value: u64) -> Vec<u8> {
    if value < 0xFD {
        vec![value as u8]
    } else if value <= 0xFFFF {
        let mut out = vec![0xFD];
        out.extend_from_slice(&(value as u16).to_le_bytes());
        out
    } else if value <= 0xFFFF_FFFF {
        let mut out = vec![0xFE];
        out.extend_from_slice(&(value as u32).to_le_bytes());
        out
    } else {
        let mut out = vec![0xFF];
        out.extend_from_slice(&value.to_le_bytes());
        out
    }
}

/// Byte width of the canonical encoding of `value`.
pub fn varint_size(value: u64) -> usize {
    if value < 0xFD {
        1
    } else if value <= 0xFFFF {
        3
    } else if value <= 0xFFFF_FFFF {
        5
    } else {
        9
    }
}

/// Decodes a variable-width integer starting at `offset`.
/// Returns the value and the number of bytes consumed.
pub fn decode_varint(bytes: &[u8], offset: usize) -> Result<(u64, usize), ProtocolError> {
    let first = *bytes.get(offset).ok_or(ProtocolError::Truncated {
        needed: offset + 1,
        available: bytes.len(),
    })?;

    let (width, value) = match first {
        0xFD => (3, read_le(bytes, offset + 1, 2)?),
        0xFE => (5, read_le(bytes, offset + 1, 4)?),
        0xFF => (9, read_le(bytes, offset + 1, 8)?),
        b => (1, b as u64),
    };

    Ok((value, width))
}

fn read_le(bytes: &[u8], offset: usize, width: usize) -> Result<u64, ProtocolError> {
    if bytes.len() < offset + width {
        return Err(ProtocolError::Truncated {
            needed: offset + width,
            available: bytes.len(),
        });
    }
    let mut value = 0u64;
    for i in 0..width {
        value |= (bytes[offset + i] as u64) << (8 * i);
    }
    Ok(value)
}

// =============================================================================
// Write helpers (append to a Vec<u8>)
// =============================================================================

pub fn write_u16_le(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn write_u32_le(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn write_u64_le(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Port fields in peer addresses are big-endian on the wire.
pub fn write_u16_be(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn write_varint(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&encode_varint(v));
}

/// VarInt length prefix followed by the raw bytes.
pub fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

pub fn write_var_string(out: &mut Vec<u8>, s: &str) {
    write_var_bytes(out, s.as_bytes());
}

// =============================================================================
// ByteCursor
// =============================================================================

/// Sequential reader over a byte slice. Tracks the offset the structure
/// started at and the current parse cursor, so a finished parse knows its
/// exact byte length. Every read fails with `ProtocolError::Truncated`
/// rather than panicking.
#[derive(Debug)]
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    offset: usize,
    cursor: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8], offset: usize) -> Self {
        ByteCursor { buf, offset, cursor: offset }
    }

    /// Bytes consumed since construction.
    pub fn consumed(&self) -> usize {
        self.cursor - self.offset
    }

    /// Current absolute position in the underlying buffer.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated {
                needed: self.cursor + n,
                available: self.buf.len(),
            });
        }
        let slice = &self.buf[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u16_be(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, ProtocolError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.take(n)?.to_vec())
    }

    pub fn read_hash(&mut self) -> Result<[u8; 32], ProtocolError> {
        let b = self.take(32)?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(b);
        Ok(hash)
    }

    pub fn read_varint(&mut self) -> Result<u64, ProtocolError> {
        let (value, width) = decode_varint(self.buf, self.cursor)?;
        self.cursor += width;
        Ok(value)
    }

    /// VarInt-prefixed byte string. The declared length is bounds-checked
    /// against the message cap before any allocation.
    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.read_varint()? as usize;
        if len > MAX_SIZE {
            return Err(ProtocolError::Oversized { declared: len, max: MAX_SIZE });
        }
        self.read_bytes(len)
    }

    pub fn read_var_string(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| ProtocolError::Malformed("invalid utf-8 in var string".to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_widths() {
        assert_eq!(encode_varint(0), vec![0x00]);
        assert_eq!(encode_varint(0xFC), vec![0xFC]);
        assert_eq!(encode_varint(0xFD), vec![0xFD, 0xFD, 0x00]);
        assert_eq!(encode_varint(0xFFFF), vec![0xFD, 0xFF, 0xFF]);
        assert_eq!(encode_varint(0x10000), vec![0xFE, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(encode_varint(u64::MAX).len(), 9);
    }

    #[test]
    fn test_varint_round_trip() {
        let samples = [
            0u64, 1, 0xFC, 0xFD, 0xFE, 0xFFFF, 0x10000, 0xFFFF_FFFF,
            0x1_0000_0000, u64::MAX,
        ];
        for &v in &samples {
            let enc = encode_varint(v);
            assert_eq!(enc.len(), varint_size(v));
            let (dec, consumed) = decode_varint(&enc, 0).unwrap();
            assert_eq!(dec, v);
            assert_eq!(consumed, enc.len());
        }
    }

    #[test]
    fn test_varint_non_canonical_accepted() {
        // 1 encoded wastefully as a 3-byte varint
        let (v, w) = decode_varint(&[0xFD, 0x01, 0x00], 0).unwrap();
        assert_eq!(v, 1);
        assert_eq!(w, 3);
        // ...but we never emit that form
        assert_eq!(encode_varint(1), vec![0x01]);
    }

    #[test]
    fn test_varint_truncated() {
        assert!(matches!(
            decode_varint(&[0xFF, 0x01], 0),
            Err(ProtocolError::Truncated { .. })
        ));
        assert!(matches!(decode_varint(&[], 0), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn test_cursor_tracks_consumed() {
        let mut buf = Vec::new();
        write_u32_le(&mut buf, 0xDEADBEEF);
        write_u16_be(&mut buf, 8333);
        write_var_string(&mut buf, "/satlink/");

        let mut cur = ByteCursor::new(&buf, 0);
        assert_eq!(cur.read_u32_le().unwrap(), 0xDEADBEEF);
        assert_eq!(cur.read_u16_be().unwrap(), 8333);
        assert_eq!(cur.read_var_string().unwrap(), "/satlink/");
        assert_eq!(cur.consumed(), buf.len());
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn test_cursor_offset() {
        let buf = [0xAA, 0xBB, 0x07, 0x00];
        let mut cur = ByteCursor::new(&buf, 2);
        assert_eq!(cur.read_u16_le().unwrap(), 7);
        assert_eq!(cur.consumed(), 2);
    }

    #[test]
    fn test_cursor_truncated_read() {
        let buf = [0x01, 0x02];
        let mut cur = ByteCursor::new(&buf, 0);
        assert!(matches!(cur.read_u32_le(), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn test_var_bytes_oversized_rejected_before_alloc() {
        // Declared length of 1 GiB with 2 bytes of actual data.
        let mut buf = vec![0xFE];
        buf.extend_from_slice(&(1u32 << 30).to_le_bytes());
        buf.extend_from_slice(&[0x00, 0x00]);
        let mut cur = ByteCursor::new(&buf, 0);
        assert!(matches!(cur.read_var_bytes(), Err(ProtocolError::Oversized { .. })));
    }
}
