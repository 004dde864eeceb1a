//! Bit-exact binary framing for the issuance engine's request/reply protocol.
//!
//! Every message on the wire is a 4-byte big-endian length prefix followed by
//! exactly that many payload bytes, mirroring the framing style of the
//! teacher's `t51core::net::frame` module (header then payload, `byteorder`
//! for the integer fields) but with encryption and sequencing stripped out —
//! this protocol has no handshake and no replay window to defend.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Maximum accepted frame payload size. Guards against a malicious or
/// corrupt length prefix causing an unbounded allocation.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 + 512;

/// Upper bound on `holder_name`: the wire format's length field is a
/// `u16`, so this is its maximum (65535 bytes), not the spec's rounder
/// 64 KiB suggestion.
pub const MAX_HOLDER_NAME_LEN: usize = u16::MAX as usize;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Malformed(&'static str),
}

impl From<io::Error> for Error {
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::Malformed(msg) => write!(f, "malformed frame: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A grant request as read off the wire, before class/amount validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRequest {
    pub class_tag: String,
    pub amount: u32,
    pub holder_name: String,
}

/// Reason codes for a rejected grant, matching spec section 4.1/4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnknownClass = 0x01,
    InvalidAmount = 0x02,
    InsufficientShares = 0x03,
    Malformed = 0x04,
}

impl ErrorCode {
    fn from_byte(b: u8) -> Option<ErrorCode> {
        match b {
            0x01 => Some(ErrorCode::UnknownClass),
            0x02 => Some(ErrorCode::InvalidAmount),
            0x03 => Some(ErrorCode::InsufficientShares),
            0x04 => Some(ErrorCode::Malformed),
            _ => None,
        }
    }
}

/// A grant reply: either the assigned certificate number, or a reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantReply {
    Ok(u64),
    Err(ErrorCode),
}

impl GrantRequest {
    /// Encode the request payload (no length prefix).
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.class_tag.len() > u8::MAX as usize {
            return Err(Error::Malformed("class_tag too long"));
        }
        if self.holder_name.len() > u16::MAX as usize {
            return Err(Error::Malformed("holder_name too long"));
        }

        let mut buf = Vec::with_capacity(1 + self.class_tag.len() + 4 + 2 + self.holder_name.len());
        buf.write_u8(self.class_tag.len() as u8)?;
        buf.write_all(self.class_tag.as_bytes())?;
        buf.write_u32::<BigEndian>(self.amount)?;
        buf.write_u16::<BigEndian>(self.holder_name.len() as u16)?;
        buf.write_all(self.holder_name.as_bytes())?;
        Ok(buf)
    }

    /// Decode a request payload (the bytes following the length prefix).
    pub fn decode(mut payload: &[u8]) -> Result<GrantRequest> {
        let class_len = payload.read_u8()? as usize;
        if payload.len() < class_len {
            return Err(Error::Malformed("truncated class_tag"));
        }
        let mut class_bytes = vec![0u8; class_len];
        payload.read_exact(&mut class_bytes)?;
        let class_tag = String::from_utf8(class_bytes)
            .map_err(|_| Error::Malformed("class_tag not utf-8"))?;

        let amount = payload.read_u32::<BigEndian>()?;

        let name_len = payload.read_u16::<BigEndian>()? as usize;
        if name_len > MAX_HOLDER_NAME_LEN {
            return Err(Error::Malformed("holder_name exceeds limit"));
        }
        if payload.len() < name_len {
            return Err(Error::Malformed("truncated holder_name"));
        }
        let mut name_bytes = vec![0u8; name_len];
        payload.read_exact(&mut name_bytes)?;
        let holder_name = String::from_utf8(name_bytes)
            .map_err(|_| Error::Malformed("holder_name not utf-8"))?;
        if holder_name.contains(['\n', '\r']) {
            return Err(Error::Malformed("holder_name contains newline"));
        }

        Ok(GrantRequest {
            class_tag,
            amount,
            holder_name,
        })
    }

    /// Write the request as one full length-prefixed frame.
    pub fn write_frame<W: Write>(&self, writer: &mut W) -> Result<()> {
        let payload = self.encode()?;
        writer.write_u32::<BigEndian>(payload.len() as u32)?;
        writer.write_all(&payload)?;
        Ok(())
    }

    /// Read one full length-prefixed request frame off `reader`.
    pub fn read_frame<R: Read>(reader: &mut R) -> Result<GrantRequest> {
        let payload = read_length_prefixed(reader)?;
        GrantRequest::decode(&payload)
    }
}

impl GrantReply {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            GrantReply::Ok(certificate_number) => {
                let mut buf = Vec::with_capacity(9);
                buf.write_u8(0x00).unwrap();
                buf.write_u64::<BigEndian>(*certificate_number).unwrap();
                buf
            }
            GrantReply::Err(code) => vec![*code as u8],
        }
    }

    pub fn decode(mut payload: &[u8]) -> Result<GrantReply> {
        let status = payload.read_u8()?;
        if status == 0x00 {
            let certificate_number = payload.read_u64::<BigEndian>()?;
            Ok(GrantReply::Ok(certificate_number))
        } else {
            let code = ErrorCode::from_byte(status)
                .ok_or(Error::Malformed("unknown status byte"))?;
            Ok(GrantReply::Err(code))
        }
    }

    pub fn write_frame<W: Write>(&self, writer: &mut W) -> Result<()> {
        let payload = self.encode();
        writer.write_u32::<BigEndian>(payload.len() as u32)?;
        writer.write_all(&payload)?;
        Ok(())
    }

    pub fn read_frame<R: Read>(reader: &mut R) -> Result<GrantReply> {
        let payload = read_length_prefixed(reader)?;
        GrantReply::decode(&payload)
    }
}

fn read_length_prefixed<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u32::<BigEndian>()?;
    if len > MAX_FRAME_LEN {
        return Err(Error::Malformed("frame exceeds maximum length"));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let req = GrantRequest {
            class_tag: "CS".to_string(),
            amount: 10,
            holder_name: "Alice Smith".to_string(),
        };
        let mut buf = Vec::new();
        req.write_frame(&mut buf).unwrap();

        let mut cursor = &buf[..];
        let decoded = GrantRequest::read_frame(&mut cursor).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn reply_ok_round_trip() {
        let reply = GrantReply::Ok(42);
        let mut buf = Vec::new();
        reply.write_frame(&mut buf).unwrap();

        let mut cursor = &buf[..];
        let decoded = GrantReply::read_frame(&mut cursor).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn reply_error_round_trip() {
        for code in [
            ErrorCode::UnknownClass,
            ErrorCode::InvalidAmount,
            ErrorCode::InsufficientShares,
            ErrorCode::Malformed,
        ] {
            let reply = GrantReply::Err(code);
            let mut buf = Vec::new();
            reply.write_frame(&mut buf).unwrap();

            let mut cursor = &buf[..];
            let decoded = GrantReply::read_frame(&mut cursor).unwrap();
            assert_eq!(decoded, reply);
        }
    }

    /// Interop test vector: a known request and ok-reply encoded by hand,
    /// so an implementation in another language can be checked against it.
    #[test]
    fn interop_vector_request() {
        let req = GrantRequest {
            class_tag: "CS".to_string(),
            amount: 10,
            holder_name: "Bob".to_string(),
        };
        let payload = req.encode().unwrap();
        let mut expected = Vec::new();
        expected.push(2u8); // class_tag length
        expected.extend_from_slice(b"CS");
        expected.extend_from_slice(&10u32.to_be_bytes());
        expected.extend_from_slice(&3u16.to_be_bytes());
        expected.extend_from_slice(b"Bob");
        assert_eq!(payload, expected);
    }

    #[test]
    fn interop_vector_reply_ok() {
        let reply = GrantReply::Ok(7);
        let payload = reply.encode();
        let mut expected = vec![0x00];
        expected.extend_from_slice(&7u64.to_be_bytes());
        assert_eq!(payload, expected);
    }

    #[test]
    fn interop_vector_reply_error() {
        assert_eq!(GrantReply::Err(ErrorCode::InsufficientShares).encode(), vec![0x03]);
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(MAX_FRAME_LEN + 1).unwrap();
        let mut cursor = &buf[..];
        assert!(matches!(
            GrantRequest::read_frame(&mut cursor),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn rejects_holder_name_with_newline() {
        let mut payload = Vec::new();
        payload.write_u8(2).unwrap();
        payload.extend_from_slice(b"CS");
        payload.write_u32::<BigEndian>(1).unwrap();
        payload.write_u16::<BigEndian>(5).unwrap();
        payload.extend_from_slice(b"A\nlic");
        assert!(matches!(
            GrantRequest::decode(&payload),
            Err(Error::Malformed(_))
        ));
    }
}
