//! Little-endian packing primitives shared by every enclave message.
//!
//! All integers are fixed width and little-endian. Length-prefixed buffers
//! carry a `u32` byte count followed by the bytes, with no padding.

use bytes::{BufMut, BytesMut};

use crate::error::WireError;

/// Convert a signed value into a `u32` wire field.
///
/// Fails with [`WireError::InvalidParameterEncoding`] when the value is
/// negative or too large, naming the field, the value and the enclave type.
pub fn to_u32_field(field: &'static str, value: i64, enclave_type: &str) -> Result<u32, WireError> {
    u32::try_from(value).map_err(|_| WireError::InvalidParameterEncoding {
        field,
        value,
        bits: 32,
        enclave_type: enclave_type.to_string(),
    })
}

/// Convert a signed value into a `u16` wire field.
pub fn to_u16_field(field: &'static str, value: i64, enclave_type: &str) -> Result<u16, WireError> {
    u16::try_from(value).map_err(|_| WireError::InvalidParameterEncoding {
        field,
        value,
        bits: 16,
        enclave_type: enclave_type.to_string(),
    })
}

/// Convert a buffer length or size into a `u32` wire field.
pub fn size_field(field: &'static str, size: usize, enclave_type: &str) -> Result<u32, WireError> {
    to_u32_field(field, i64::try_from(size).unwrap_or(i64::MAX), enclave_type)
}

/// Write `len(data)` as a `u32` followed by `data`.
pub fn put_len_prefixed(
    buf: &mut BytesMut,
    field: &'static str,
    data: &[u8],
    enclave_type: &str,
) -> Result<(), WireError> {
    let len = size_field(field, data.len(), enclave_type)?;
    buf.put_u32_le(len);
    buf.put_slice(data);
    Ok(())
}

/// Encode `s` as UTF-16LE without a terminator.
pub fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

/// Concatenate buffers in order into one contiguous buffer.
pub fn concat(parts: &[&[u8]]) -> Vec<u8> {
    let total = parts.iter().map(|p| p.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for part in parts {
        buf.put_slice(part);
    }
    buf.to_vec()
}

/// Bounds-checked cursor over a received buffer.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Take the next `n` bytes, advancing the cursor.
    pub fn take(&mut self, field: &'static str, n: usize) -> Result<&'a [u8], WireError> {
        if n > self.remaining() {
            return Err(WireError::Truncated {
                field,
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(out)
    }

    /// Take a fixed-size array.
    pub fn take_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(field, N)?);
        Ok(out)
    }

    pub fn read_u16(&mut self, field: &'static str) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.take_array(field)?))
    }

    pub fn read_u32(&mut self, field: &'static str) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take_array(field)?))
    }

    pub fn read_i32(&mut self, field: &'static str) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.take_array(field)?))
    }

    pub fn read_u64(&mut self, field: &'static str) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take_array(field)?))
    }

    pub fn read_i64(&mut self, field: &'static str) -> Result<i64, WireError> {
        Ok(i64::from_le_bytes(self.take_array(field)?))
    }

    /// Read a `u32` length followed by that many bytes.
    pub fn read_len_prefixed(&mut self, field: &'static str) -> Result<&'a [u8], WireError> {
        let len = self.read_u32(field)? as usize;
        self.take(field, len)
    }

    /// All bytes not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.offset..];
        self.offset = self.buf.len();
        out
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(&self, what: &'static str) -> Result<(), WireError> {
        if self.remaining() != 0 {
            return Err(WireError::SizeMismatch {
                what,
                declared: self.offset,
                actual: self.buf.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_field_rejects_negative() {
        let err = to_u32_field("protocolInputLength", -1, "VBS").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("protocolInputLength"));
        assert!(msg.contains("-1"));
        assert!(msg.contains("VBS"));
    }

    #[test]
    fn u32_field_rejects_overflow() {
        assert!(to_u32_field("size", u32::MAX as i64 + 1, "SGX").is_err());
        assert_eq!(to_u32_field("size", u32::MAX as i64, "SGX").unwrap(), u32::MAX);
    }

    #[test]
    fn size_field_rejects_lengths_past_u32() {
        assert_eq!(size_field("keySize", 104, "VBS").unwrap(), 104);
        assert_eq!(size_field("keySize", u32::MAX as usize, "VBS").unwrap(), u32::MAX);
        assert!(matches!(
            size_field("keySize", u32::MAX as usize + 1, "VBS"),
            Err(WireError::InvalidParameterEncoding { field: "keySize", bits: 32, .. })
        ));
        assert!(size_field("keySize", usize::MAX, "VBS").is_err());
    }

    #[test]
    fn u16_field_bounds() {
        assert_eq!(to_u16_field("keyLength", 32, "VBS").unwrap(), 32);
        assert!(to_u16_field("keyLength", 70_000, "VBS").is_err());
    }

    #[test]
    fn len_prefixed_layout() {
        let mut buf = BytesMut::new();
        put_len_prefixed(&mut buf, "data", &[0xAA, 0xBB], "VBS").unwrap();
        assert_eq!(&buf[..], &[2, 0, 0, 0, 0xAA, 0xBB]);

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_len_prefixed("data").unwrap(), &[0xAA, 0xBB]);
        r.finish("data").unwrap();
    }

    #[test]
    fn utf16le_encoding() {
        assert_eq!(utf16le("A1"), vec![0x41, 0x00, 0x31, 0x00]);
        assert!(utf16le("").is_empty());
    }

    #[test]
    fn concat_preserves_order_and_length() {
        let out = concat(&[&[1, 2], &[], &[3], &[4, 5, 6]]);
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn reader_reports_truncation() {
        let data = [1u8, 0, 0];
        let mut r = Reader::new(&data);
        match r.read_u32("totalSize") {
            Err(WireError::Truncated {
                field,
                needed,
                available,
            }) => {
                assert_eq!(field, "totalSize");
                assert_eq!(needed, 4);
                assert_eq!(available, 3);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn reader_little_endian_integers() {
        let data = [
            0x01, 0x00, // u16
            0x02, 0x00, 0x00, 0x00, // u32
            0xFF, 0xFF, 0xFF, 0xFF, // i32 -1
            0x07, 0, 0, 0, 0, 0, 0, 0, // i64 7
        ];
        let mut r = Reader::new(&data);
        assert_eq!(r.read_u16("a").unwrap(), 1);
        assert_eq!(r.read_u32("b").unwrap(), 2);
        assert_eq!(r.read_i32("c").unwrap(), -1);
        assert_eq!(r.read_i64("d").unwrap(), 7);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn finish_rejects_trailing_bytes() {
        let data = [0u8; 5];
        let mut r = Reader::new(&data);
        r.read_u32("x").unwrap();
        assert!(r.finish("message").is_err());
    }
}
