//! Primitive encoding of the native protocol.
//!
//! Integers are little-endian, lengths and packet codes are LEB128
//! varuints, strings are a varuint byte length followed by raw bytes.

use std::io::{self, Read};

/// Strings longer than this are treated as a corrupt stream.
pub const MAX_STRING_LEN: u64 = 1 << 30;

pub fn write_varuint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varuint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

pub fn write_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub fn write_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn read_varuint(r: &mut impl Read) -> io::Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = read_u8(r)?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(io::Error::new(io::ErrorKind::InvalidData, "varuint overflow"))
}

pub fn read_bytes(r: &mut impl Read) -> io::Result<Vec<u8>> {
    let len = read_varuint(r)?;
    if len > MAX_STRING_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("string length {len} exceeds limit"),
        ));
    }
    read_exact_vec(r, len as usize)
}

/// Read a string. Invalid UTF-8 is replaced rather than rejected.
pub fn read_string(r: &mut impl Read) -> io::Result<String> {
    let bytes = read_bytes(r)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Read exactly `len` bytes. The buffer grows with the data actually
/// received, so a bogus length fails with EOF instead of allocating it.
pub fn read_exact_vec(r: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes, got {}", buf.len()),
        ));
    }
    Ok(buf)
}

pub fn read_array<const N: usize>(r: &mut impl Read) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    Ok(read_array::<1>(r)?[0])
}

pub fn read_i32(r: &mut impl Read) -> io::Result<i32> {
    Ok(i32::from_le_bytes(read_array(r)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varuint_boundaries() {
        for (value, encoded) in [
            (0u64, vec![0x00]),
            (127, vec![0x7f]),
            (128, vec![0x80, 0x01]),
            (300, vec![0xac, 0x02]),
            (54213, vec![0xc5, 0xa7, 0x03]),
        ] {
            let mut buf = Vec::new();
            write_varuint(&mut buf, value);
            assert_eq!(buf, encoded, "encoding {value}");
            assert_eq!(read_varuint(&mut buf.as_slice()).unwrap(), value);
        }
    }

    #[test]
    fn varuint_max() {
        let mut buf = Vec::new();
        write_varuint(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
        assert_eq!(read_varuint(&mut buf.as_slice()).unwrap(), u64::MAX);
    }

    #[test]
    fn varuint_overflow_is_invalid_data() {
        let buf = [0xffu8; 11];
        let err = read_varuint(&mut buf.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn string_layout() {
        let mut buf = Vec::new();
        write_string(&mut buf, "ClickHouse");
        assert_eq!(buf[0], 10);
        assert_eq!(&buf[1..], b"ClickHouse");
        assert_eq!(read_string(&mut buf.as_slice()).unwrap(), "ClickHouse");
    }

    #[test]
    fn truncated_string_is_eof() {
        let buf = [5u8, b'a', b'b'];
        let err = read_string(&mut buf.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_string_rejected() {
        let mut buf = Vec::new();
        write_varuint(&mut buf, MAX_STRING_LEN + 1);
        let err = read_bytes(&mut buf.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn short_read_does_not_allocate_declared_length() {
        let buf = [1u8, 2, 3];
        let err = read_exact_vec(&mut buf.as_slice(), usize::MAX).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn fixed_width_little_endian() {
        let mut buf = Vec::new();
        write_i32(&mut buf, -1);
        write_u8(&mut buf, 7);
        let mut r = buf.as_slice();
        assert_eq!(read_i32(&mut r).unwrap(), -1);
        assert_eq!(read_u8(&mut r).unwrap(), 7);
    }
}
