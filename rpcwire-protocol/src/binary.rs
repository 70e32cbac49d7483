//! Binary encoding of the fixed envelope and handshake fields.
//!
//! Values use the Avro binary encoding: zig-zag varints for `long`, one byte
//! for `boolean`, length-prefixed `bytes`/`string`, raw `fixed`, and blocked
//! maps terminated by a zero count.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum encoded size of a varint `long`.
const MAX_VARINT_LEN: usize = 10;

/// Writes a zig-zag varint `long`.
pub fn put_long(buf: &mut impl BufMut, value: i64) {
    let mut n = ((value << 1) ^ (value >> 63)) as u64;
    while n & !0x7F != 0 {
        buf.put_u8((n as u8 & 0x7F) | 0x80);
        n >>= 7;
    }
    buf.put_u8(n as u8);
}

/// Reads a zig-zag varint `long`.
pub fn get_long(buf: &mut impl Buf, field: &'static str) -> Result<i64, ProtocolError> {
    let mut n: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(ProtocolError::decode(field, "unexpected end of data"));
        }
        let b = buf.get_u8();
        n |= u64::from(b & 0x7F) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((n >> 1) as i64 ^ -((n & 1) as i64));
        }
    }
    Err(ProtocolError::decode(field, "varint overflows 64 bits"))
}

/// Writes a `boolean`.
pub fn put_bool(buf: &mut impl BufMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Reads a `boolean`.
pub fn get_bool(buf: &mut impl Buf, field: &'static str) -> Result<bool, ProtocolError> {
    if !buf.has_remaining() {
        return Err(ProtocolError::decode(field, "unexpected end of data"));
    }
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(ProtocolError::decode(
            field,
            format!("invalid boolean byte {:#04x}", b),
        )),
    }
}

/// Writes length-prefixed `bytes`.
pub fn put_bytes(buf: &mut impl BufMut, value: &[u8]) {
    put_long(buf, value.len() as i64);
    buf.put_slice(value);
}

/// Reads length-prefixed `bytes`.
pub fn get_bytes(buf: &mut impl Buf, field: &'static str) -> Result<Bytes, ProtocolError> {
    let len = get_long(buf, field)?;
    if len < 0 {
        return Err(ProtocolError::decode(field, format!("negative length {}", len)));
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::decode(
            field,
            format!("length {} exceeds remaining {} bytes", len, buf.remaining()),
        ));
    }
    Ok(buf.copy_to_bytes(len))
}

/// Writes a length-prefixed UTF-8 `string`.
pub fn put_string(buf: &mut impl BufMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

/// Reads a length-prefixed UTF-8 `string`.
pub fn get_string(buf: &mut impl Buf, field: &'static str) -> Result<String, ProtocolError> {
    let bytes = get_bytes(buf, field)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::decode(field, "invalid UTF-8"))
}

/// Reads a `fixed` value of `N` bytes.
pub fn get_fixed<const N: usize>(
    buf: &mut impl Buf,
    field: &'static str,
) -> Result<[u8; N], ProtocolError> {
    if buf.remaining() < N {
        return Err(ProtocolError::decode(
            field,
            format!("need {} bytes, have {}", N, buf.remaining()),
        ));
    }
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Writes the branch index of a union.
pub fn put_union_index(buf: &mut impl BufMut, index: usize) {
    put_long(buf, index as i64);
}

/// Reads the branch index of a union with `branches` alternatives.
pub fn get_union_index(
    buf: &mut impl Buf,
    branches: usize,
    field: &'static str,
) -> Result<usize, ProtocolError> {
    let index = get_long(buf, field)?;
    if index < 0 || index as usize >= branches {
        return Err(ProtocolError::decode(
            field,
            format!("union index {} out of range", index),
        ));
    }
    Ok(index as usize)
}

/// Writes a `map<bytes>` as a single block.
///
/// Non-empty maps are written with a negative count followed by the block
/// size in bytes, so readers can skip the block without decoding it.
pub fn put_bytes_map<'a, I>(buf: &mut impl BufMut, entries: I)
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut block = BytesMut::new();
    let mut count = 0i64;
    for (key, value) in entries {
        put_string(&mut block, key);
        put_bytes(&mut block, value);
        count += 1;
    }

    if count > 0 {
        put_long(buf, -count);
        put_long(buf, block.len() as i64);
        buf.put_slice(&block);
    }
    put_long(buf, 0);
}

/// Reads a `map<bytes>`, calling `insert` for each entry.
pub fn get_bytes_map(
    buf: &mut impl Buf,
    field: &'static str,
    mut insert: impl FnMut(String, Bytes),
) -> Result<(), ProtocolError> {
    loop {
        let count = get_long(buf, field)?;
        if count == 0 {
            return Ok(());
        }

        let count = if count < 0 {
            // Block size is only needed for skipping
            get_long(buf, field)?;
            count
                .checked_neg()
                .ok_or_else(|| ProtocolError::decode(field, "invalid block count"))?
        } else {
            count
        };

        for _ in 0..count {
            let key = get_string(buf, field)?;
            let value = get_bytes(buf, field)?;
            insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_long(value: i64) -> Vec<u8> {
        let mut buf = Vec::new();
        put_long(&mut buf, value);
        buf
    }

    #[test]
    fn test_long_encoding() {
        assert_eq!(encode_long(0), vec![0x00]);
        assert_eq!(encode_long(-1), vec![0x01]);
        assert_eq!(encode_long(1), vec![0x02]);
        assert_eq!(encode_long(-64), vec![0x7F]);
        assert_eq!(encode_long(64), vec![0x80, 0x01]);
        assert_eq!(encode_long(i64::MAX).len(), MAX_VARINT_LEN);
    }

    #[test]
    fn test_long_extremes() {
        for value in [i64::MIN, i64::MAX, -8193, 8192] {
            let encoded = encode_long(value);
            assert_eq!(get_long(&mut &encoded[..], "long").unwrap(), value);
        }
    }

    #[test]
    fn test_long_overflow() {
        let data = [0xFFu8; 11];
        let err = get_long(&mut &data[..], "count").unwrap_err();
        assert!(err.to_string().contains("count"));
    }

    #[test]
    fn test_long_truncated() {
        let err = get_long(&mut &[0x80u8][..], "length").unwrap_err();
        assert!(matches!(err, ProtocolError::Decode { field: "length", .. }));
    }

    #[test]
    fn test_string() {
        let mut buf = Vec::new();
        put_string(&mut buf, "echo");
        assert_eq!(buf, vec![0x08, 0x65, 0x63, 0x68, 0x6F]);
        assert_eq!(get_string(&mut &buf[..], "name").unwrap(), "echo");
    }

    #[test]
    fn test_string_invalid_utf8() {
        let data = [0x04, 0xFF, 0xFE];
        let err = get_string(&mut &data[..], "name").unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn test_bytes_length_exceeds_data() {
        let data = [0x0A, 0x01];
        assert!(get_bytes(&mut &data[..], "value").is_err());

        let negative = [0x01];
        assert!(get_bytes(&mut &negative[..], "value").is_err());
    }

    #[test]
    fn test_bool() {
        assert!(get_bool(&mut &[0x01u8][..], "flag").unwrap());
        assert!(!get_bool(&mut &[0x00u8][..], "flag").unwrap());
        assert!(get_bool(&mut &[0x02u8][..], "flag").is_err());
        assert!(get_bool(&mut &[0u8; 0][..], "flag").is_err());
    }

    #[test]
    fn test_fixed() {
        let data: Vec<u8> = (0..16).collect();
        let fixed: [u8; 16] = get_fixed(&mut &data[..], "hash").unwrap();
        assert_eq!(&fixed[..], &data[..]);
        assert!(get_fixed::<16>(&mut &data[..15], "hash").is_err());
    }

    #[test]
    fn test_union_index_range() {
        assert_eq!(get_union_index(&mut &[0x02u8][..], 2, "meta").unwrap(), 1);
        assert!(get_union_index(&mut &[0x04u8][..], 2, "meta").is_err());
        assert!(get_union_index(&mut &[0x01u8][..], 2, "meta").is_err());
    }

    #[test]
    fn test_bytes_map_block() {
        let mut buf = Vec::new();
        put_bytes_map(&mut buf, [("foo", &b"foo"[..])]);
        assert_eq!(
            buf,
            vec![0x01, 0x10, 0x06, 0x66, 0x6F, 0x6F, 0x06, 0x66, 0x6F, 0x6F, 0x00]
        );

        let mut entries = Vec::new();
        get_bytes_map(&mut &buf[..], "metadata", |k, v| entries.push((k, v))).unwrap();
        assert_eq!(entries, vec![("foo".to_string(), Bytes::from_static(b"foo"))]);
    }

    #[test]
    fn test_empty_map() {
        let mut buf = Vec::new();
        put_bytes_map(&mut buf, std::iter::empty());
        assert_eq!(buf, vec![0x00]);
    }

    #[test]
    fn test_map_with_positive_block_counts() {
        // Two blocks of one entry each, without block sizes
        let data = [
            0x02, 0x02, 0x61, 0x02, 0x01, 0x02, 0x02, 0x62, 0x00, 0x00,
        ];
        let mut entries = Vec::new();
        get_bytes_map(&mut &data[..], "metadata", |k, v| entries.push((k, v))).unwrap();
        assert_eq!(
            entries,
            vec![
                ("a".to_string(), Bytes::from_static(&[0x01])),
                ("b".to_string(), Bytes::new()),
            ]
        );
    }
}
