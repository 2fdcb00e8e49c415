//! Bounds-checked primitive readers shared by the chunk and message codecs.
//!
//! All integers are big-endian. Strings are a u16 length followed by UTF-8.

use bytes::{Buf, BufMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CodecError {
    Truncated,
    InvalidUtf8,
    BadFileName,
}

pub(crate) fn get_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u8())
}

pub(crate) fn get_u16(buf: &mut &[u8]) -> Result<u16, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u16())
}

pub(crate) fn get_u32(buf: &mut &[u8]) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u32())
}

pub(crate) fn get_u64(buf: &mut &[u8]) -> Result<u64, CodecError> {
    if buf.remaining() < 8 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u64())
}

/// Split `n` bytes off the front of `buf`.
pub(crate) fn get_bytes<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    if buf.len() < n {
        return Err(CodecError::Truncated);
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

pub(crate) fn get_str(buf: &mut &[u8]) -> Result<String, CodecError> {
    let len = get_u16(buf)? as usize;
    let raw = get_bytes(buf, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

/// A string that must name a chunk file.
pub(crate) fn get_file_name(buf: &mut &[u8]) -> Result<String, CodecError> {
    let name = get_str(buf)?;
    if !crate::chunk::is_bare_file_name(&name) {
        return Err(CodecError::BadFileName);
    }
    Ok(name)
}

/// Write a u16-length-prefixed string. Callers keep strings under 64 KiB;
/// anything longer is cut at the limit.
pub(crate) fn put_str(buf: &mut impl BufMut, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    buf.put_u16(len as u16);
    buf.put_slice(&bytes[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_reads_are_truncated() {
        let mut buf: &[u8] = &[0x01, 0x02, 0x03];
        assert_eq!(get_u32(&mut buf), Err(CodecError::Truncated));
        assert_eq!(get_u16(&mut buf), Ok(0x0102));
        assert_eq!(get_bytes(&mut buf, 2), Err(CodecError::Truncated));
        assert_eq!(get_u8(&mut buf), Ok(0x03));
        assert_eq!(get_u8(&mut buf), Err(CodecError::Truncated));
    }

    #[test]
    fn string_round_trip_and_bad_utf8() {
        let mut out = Vec::new();
        put_str(&mut out, "report.pdf");
        let mut buf = out.as_slice();
        assert_eq!(get_str(&mut buf).unwrap(), "report.pdf");
        assert!(buf.is_empty());

        let mut bad: &[u8] = &[0x00, 0x02, 0xff, 0xfe];
        assert_eq!(get_str(&mut bad), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn file_names_must_be_bare() {
        for name in ["../etc", "..", "a/b"] {
            let mut out = Vec::new();
            put_str(&mut out, name);
            assert_eq!(get_file_name(&mut out.as_slice()), Err(CodecError::BadFileName));
        }
        let mut out = Vec::new();
        put_str(&mut out, "plain.txt");
        assert_eq!(get_file_name(&mut out.as_slice()).unwrap(), "plain.txt");
    }
}
