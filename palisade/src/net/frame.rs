//! Wire schema for the framed messages exchanged over a connection.
//!
//! Application messages (`Header`, `ErrorFrame`) use a compact tag/varint
//! encoding in which default-valued fields are omitted, so a well-formed
//! payload never contains an embedded zero byte and the null frame
//! terminator stays unambiguous. Handshake messages are never scanned for
//! the terminator (the receiver drains the whole buffer), so they carry
//! their binary key material with plain big-endian length prefixes.

use crate::crypto::IV_SIZE;
use crate::net::shared::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// The frame terminator. Every logical message on the wire is followed by
/// one of these.
pub const DELIMITER: u8 = 0;

const WIRE_VARINT: u64 = 0;
const WIRE_BYTES: u64 = 2;

// An unsigned varint spans at most ten bytes.
const MAX_VARINT_BYTES: usize = 10;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageType {
    Request = 0,
    Ping = 1,
}

impl MessageType {
    #[inline]
    fn from_u64(value: u64) -> NetworkResult<MessageType> {
        match value {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::Ping),
            _ => Err(NetworkError::Fatal(ErrorType::Serialization)),
        }
    }
}

/// The envelope preceding every application message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Header {
    pub timestamp: u64,
    pub kind: MessageType,
    pub path: String,
    pub size: u32,
}

impl Header {
    pub fn new(kind: MessageType, path: &str, size: u32, timestamp: u64) -> Header {
        Header {
            timestamp,
            kind,
            path: path.to_string(),
            size,
        }
    }

    pub fn write<W: Write>(&self, stream: &mut W) -> NetworkResult<()> {
        write_varint_field(stream, 1, self.timestamp)?;
        write_varint_field(stream, 2, self.kind as u64)?;
        write_bytes_field(stream, 3, self.path.as_bytes())?;
        write_varint_field(stream, 4, u64::from(self.size))?;
        Ok(())
    }

    pub fn read(mut stream: &[u8]) -> NetworkResult<Header> {
        let mut header = Header {
            timestamp: 0,
            kind: MessageType::Request,
            path: String::new(),
            size: 0,
        };

        while !stream.is_empty() {
            let (field, wire) = read_tag(&mut stream)?;

            match (field, wire) {
                (1, WIRE_VARINT) => header.timestamp = read_uvarint(&mut stream)?,
                (2, WIRE_VARINT) => header.kind = MessageType::from_u64(read_uvarint(&mut stream)?)?,
                (3, WIRE_BYTES) => {
                    header.path = String::from_utf8(read_bytes(&mut stream)?)
                        .map_err(|_| NetworkError::Fatal(ErrorType::Serialization))?
                }
                (4, WIRE_VARINT) => {
                    let size = read_uvarint(&mut stream)?;
                    if size > u64::from(u32::max_value()) {
                        return Err(NetworkError::Fatal(ErrorType::Serialization));
                    }
                    header.size = size as u32;
                }
                _ => skip_field(&mut stream, wire)?,
            }
        }

        Ok(header)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::new();
        self.write(&mut data).expect("Writing to a Vec cannot fail");
        data
    }
}

/// The structured error envelope reported back to a peer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorFrame {
    pub code: u32,
    pub message: String,
    pub timestamp: u64,
}

impl ErrorFrame {
    pub fn write<W: Write>(&self, stream: &mut W) -> NetworkResult<()> {
        write_varint_field(stream, 1, u64::from(self.code))?;
        write_bytes_field(stream, 2, self.message.as_bytes())?;
        write_varint_field(stream, 3, self.timestamp)?;
        Ok(())
    }

    pub fn read(mut stream: &[u8]) -> NetworkResult<ErrorFrame> {
        let mut frame = ErrorFrame {
            code: 0,
            message: String::new(),
            timestamp: 0,
        };

        while !stream.is_empty() {
            let (field, wire) = read_tag(&mut stream)?;

            match (field, wire) {
                (1, WIRE_VARINT) => {
                    let code = read_uvarint(&mut stream)?;
                    if code > u64::from(u32::max_value()) {
                        return Err(NetworkError::Fatal(ErrorType::Serialization));
                    }
                    frame.code = code as u32;
                }
                (2, WIRE_BYTES) => {
                    frame.message = String::from_utf8(read_bytes(&mut stream)?)
                        .map_err(|_| NetworkError::Fatal(ErrorType::Serialization))?
                }
                (3, WIRE_VARINT) => frame.timestamp = read_uvarint(&mut stream)?,
                _ => skip_field(&mut stream, wire)?,
            }
        }

        Ok(frame)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::new();
        self.write(&mut data).expect("Writing to a Vec cannot fail");
        data
    }
}

/// First handshake message, host to peer: the host's public key and the
/// connection IV.
#[derive(Debug, Eq, PartialEq)]
pub struct HostHandshake {
    pub public_key: Vec<u8>,
    pub iv: [u8; IV_SIZE],
}

impl HostHandshake {
    pub fn write<W: Write>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_u32::<BigEndian>(self.public_key.len() as u32)?;
        stream.write_all(&self.public_key)?;
        stream.write_all(&self.iv)?;
        Ok(())
    }

    pub fn read(mut stream: &[u8]) -> NetworkResult<HostHandshake> {
        let key_len = stream.read_u32::<BigEndian>()? as usize;

        if stream.len() != key_len + IV_SIZE {
            return Err(NetworkError::Fatal(ErrorType::Serialization));
        }

        let mut public_key = vec![0u8; key_len];
        stream.read_exact(&mut public_key)?;

        let mut iv = [0u8; IV_SIZE];
        stream.read_exact(&mut iv)?;

        Ok(HostHandshake { public_key, iv })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::new();
        self.write(&mut data).expect("Writing to a Vec cannot fail");
        data
    }
}

/// Second handshake message, peer to host: the peer's public key.
#[derive(Debug, Eq, PartialEq)]
pub struct PeerHandshake {
    pub public_key: Vec<u8>,
}

impl PeerHandshake {
    pub fn write<W: Write>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_u32::<BigEndian>(self.public_key.len() as u32)?;
        stream.write_all(&self.public_key)?;
        Ok(())
    }

    pub fn read(mut stream: &[u8]) -> NetworkResult<PeerHandshake> {
        let key_len = stream.read_u32::<BigEndian>()? as usize;

        if stream.len() != key_len {
            return Err(NetworkError::Fatal(ErrorType::Serialization));
        }

        let mut public_key = vec![0u8; key_len];
        stream.read_exact(&mut public_key)?;

        Ok(PeerHandshake { public_key })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::new();
        self.write(&mut data).expect("Writing to a Vec cannot fail");
        data
    }
}

#[inline]
fn write_uvarint<W: Write>(stream: &mut W, mut value: u64) -> io::Result<()> {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;

        if value != 0 {
            byte |= 0x80;
        }

        stream.write_all(&[byte])?;

        if value == 0 {
            return Ok(());
        }
    }
}

fn read_uvarint(stream: &mut &[u8]) -> NetworkResult<u64> {
    let mut value = 0u64;

    for i in 0..MAX_VARINT_BYTES {
        let byte = stream.read_u8()?;
        value |= u64::from(byte & 0x7f) << (i * 7);

        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }

    Err(NetworkError::Fatal(ErrorType::Serialization))
}

/// Writes a varint field, omitting it entirely at the default value.
#[inline]
fn write_varint_field<W: Write>(stream: &mut W, field: u64, value: u64) -> NetworkResult<()> {
    if value == 0 {
        return Ok(());
    }

    write_uvarint(stream, field << 3 | WIRE_VARINT)?;
    write_uvarint(stream, value)?;
    Ok(())
}

/// Writes a length-delimited field, omitting it entirely when empty.
#[inline]
fn write_bytes_field<W: Write>(stream: &mut W, field: u64, data: &[u8]) -> NetworkResult<()> {
    if data.is_empty() {
        return Ok(());
    }

    write_uvarint(stream, field << 3 | WIRE_BYTES)?;
    write_uvarint(stream, data.len() as u64)?;
    stream.write_all(data)?;
    Ok(())
}

fn read_tag(stream: &mut &[u8]) -> NetworkResult<(u64, u64)> {
    let tag = read_uvarint(stream)?;
    let field = tag >> 3;
    let wire = tag & 0x7;

    if field == 0 || (wire != WIRE_VARINT && wire != WIRE_BYTES) {
        return Err(NetworkError::Fatal(ErrorType::Serialization));
    }

    Ok((field, wire))
}

fn read_bytes(stream: &mut &[u8]) -> NetworkResult<Vec<u8>> {
    let len = read_uvarint(stream)? as usize;

    if len > stream.len() {
        return Err(NetworkError::Fatal(ErrorType::Serialization));
    }

    let mut data = vec![0u8; len];
    stream.read_exact(&mut data)?;

    Ok(data)
}

fn skip_field(stream: &mut &[u8], wire: u64) -> NetworkResult<()> {
    match wire {
        WIRE_VARINT => {
            read_uvarint(stream)?;
        }
        _ => {
            read_bytes(stream)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::timestamp_micros;

    #[test]
    fn test_header_roundtrip() {
        let header = Header::new(MessageType::Request, "/path/to/something", 13, timestamp_micros());

        let data = header.encode();
        assert!(!data.contains(&DELIMITER));

        assert_eq!(Header::read(&data).unwrap(), header);
    }

    #[test]
    fn test_ping_header_has_no_embedded_delimiter() {
        let header = Header::new(MessageType::Ping, "", 0, timestamp_micros());

        let data = header.encode();
        assert!(!data.contains(&DELIMITER));

        let parsed = Header::read(&data).unwrap();
        assert_eq!(parsed.kind, MessageType::Ping);
        assert_eq!(parsed.size, 0);
        assert_eq!(parsed.path, "");
    }

    #[test]
    fn test_empty_header_decodes_to_defaults() {
        let parsed = Header::read(&[]).unwrap();

        assert_eq!(parsed.kind, MessageType::Request);
        assert_eq!(parsed.timestamp, 0);
        assert_eq!(parsed.size, 0);
    }

    #[test]
    fn test_header_rejects_bad_type() {
        let mut data = Vec::new();
        write_varint_field(&mut data, 2, 9).unwrap();

        assert!(Header::read(&data).is_err());
    }

    #[test]
    fn test_header_rejects_truncated_path() {
        let mut data = Vec::new();
        write_uvarint(&mut data, 3 << 3 | WIRE_BYTES).unwrap();
        write_uvarint(&mut data, 200).unwrap();
        data.extend_from_slice(b"short");

        assert!(Header::read(&data).is_err());
    }

    #[test]
    fn test_header_skips_unknown_fields() {
        let header = Header::new(MessageType::Request, "/echo", 0, 55);

        let mut data = header.encode();
        write_varint_field(&mut data, 9, 1234).unwrap();
        write_bytes_field(&mut data, 10, b"future").unwrap();

        assert_eq!(Header::read(&data).unwrap(), header);
    }

    #[test]
    fn test_error_frame_roundtrip() {
        let frame = ErrorFrame {
            code: 13003,
            message: "Context: failed to read incoming data.".to_string(),
            timestamp: timestamp_micros(),
        };

        let data = frame.encode();
        assert!(!data.contains(&DELIMITER));

        assert_eq!(ErrorFrame::read(&data).unwrap(), frame);
    }

    #[test]
    fn test_host_handshake_roundtrip() {
        let hs = HostHandshake {
            public_key: (0..=255).collect(),
            iv: [7; IV_SIZE],
        };

        assert_eq!(HostHandshake::read(&hs.encode()).unwrap(), hs);
    }

    #[test]
    fn test_host_handshake_rejects_bad_length() {
        let hs = HostHandshake {
            public_key: vec![1, 2, 3],
            iv: [0; IV_SIZE],
        };

        let mut data = hs.encode();
        data.push(0xff);

        assert!(HostHandshake::read(&data).is_err());
    }

    #[test]
    fn test_peer_handshake_roundtrip() {
        let hs = PeerHandshake {
            public_key: vec![9; 256],
        };

        assert_eq!(PeerHandshake::read(&hs.encode()).unwrap(), hs);
    }

    #[test]
    fn test_varint_roundtrip() {
        let values = [0u64, 1, 127, 128, 300, 1 << 21, u64::max_value()];

        for &value in &values {
            let mut data = Vec::new();
            write_uvarint(&mut data, value).unwrap();

            let mut stream = &data[..];
            assert_eq!(read_uvarint(&mut stream).unwrap(), value);
            assert!(stream.is_empty());
        }
    }
}
