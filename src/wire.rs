//! Framed wire codec: header validation and control payload encoding
//!
//! All multi-byte integers are big-endian. Declared payload lengths are
//! validated against the per-type cap before any allocation happens, and
//! decoders require the payload to be exactly consumed.

use std::io::{Read, Write};

use anyhow::{Context, Result};

use crate::errors::{self, ErrorKind};
use crate::protocol::{frame, max_payload, HASH_SIZE, HEADER_SIZE, MAGIC, VERSION};

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u16,
    pub payload: Vec<u8>,
}

/// Decoded OFFER payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub name: String,
    pub size: u64,
    pub session_id: String,
}

/// Write one frame to the stream.
pub fn write_frame<W: Write>(w: &mut W, frame_type: u16, payload: &[u8]) -> Result<()> {
    if payload.len() > max_payload(frame_type) {
        return Err(errors::tag(
            ErrorKind::InvalidProtocol,
            format!("payload too large for frame type {frame_type}: {}", payload.len()),
        ));
    }
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_be_bytes());
    header[6..8].copy_from_slice(&frame_type.to_be_bytes());
    header[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    // header[12..16] reserved, must stay zero
    w.write_all(&header).context("write frame header")?;
    if !payload.is_empty() {
        w.write_all(payload).context("write frame payload")?;
    }
    Ok(())
}

/// Read one frame from the stream.
///
/// Short reads are fatal for the connection and surface as plain I/O
/// errors; header validation failures carry `InvalidProtocol`.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_SIZE];
    r.read_exact(&mut header).context("read frame header")?;
    if &header[0..4] != MAGIC {
        return Err(errors::tag(ErrorKind::InvalidProtocol, "invalid magic"));
    }
    let version = u16::from_be_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(errors::tag(
            ErrorKind::InvalidProtocol,
            format!("unsupported protocol version {version}"),
        ));
    }
    let frame_type = u16::from_be_bytes([header[6], header[7]]);
    let len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let reserved = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
    if reserved != 0 {
        return Err(errors::tag(
            ErrorKind::InvalidProtocol,
            "reserved field must be zero",
        ));
    }
    if len > max_payload(frame_type) {
        return Err(errors::tag(
            ErrorKind::InvalidProtocol,
            format!("payload length {len} too large for frame type {frame_type}"),
        ));
    }
    let mut payload = vec![0u8; len];
    if len > 0 {
        r.read_exact(&mut payload).context("read frame payload")?;
    }
    Ok(Frame {
        frame_type,
        payload,
    })
}

fn protocol_err<T>(msg: &str) -> Result<T> {
    Err(errors::tag(ErrorKind::InvalidProtocol, msg))
}

/// Build an OFFER payload.
pub fn encode_offer(offer: &Offer) -> Result<Vec<u8>> {
    if offer.name.is_empty() || offer.name.len() > 1024 {
        return protocol_err("offer name must be 1..=1024 bytes");
    }
    if offer.session_id.is_empty()
        || offer.session_id.len() > 128
        || !offer.session_id.is_ascii()
    {
        return protocol_err("offer session id must be 1..=128 ASCII bytes");
    }
    let name = offer.name.as_bytes();
    let session = offer.session_id.as_bytes();
    let mut payload = Vec::with_capacity(2 + name.len() + 8 + 2 + session.len());
    payload.extend_from_slice(&(name.len() as u16).to_be_bytes());
    payload.extend_from_slice(name);
    payload.extend_from_slice(&offer.size.to_be_bytes());
    payload.extend_from_slice(&(session.len() as u16).to_be_bytes());
    payload.extend_from_slice(session);
    Ok(payload)
}

/// Parse an OFFER payload.
pub fn decode_offer(payload: &[u8]) -> Result<Offer> {
    if payload.len() < 12 {
        return protocol_err("offer payload too short");
    }
    let name_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let mut off = 2;
    if name_len == 0 || name_len > 1024 || off + name_len + 8 + 2 > payload.len() {
        return protocol_err("offer payload malformed");
    }
    let name = String::from_utf8(payload[off..off + name_len].to_vec())
        .map_err(|_| errors::tag(ErrorKind::InvalidProtocol, "offer name is not valid UTF-8"))?;
    off += name_len;
    let size = u64::from_be_bytes(payload[off..off + 8].try_into().expect("fixed slice"));
    off += 8;
    let session_len = u16::from_be_bytes([payload[off], payload[off + 1]]) as usize;
    off += 2;
    if session_len == 0 || session_len > 128 || off + session_len != payload.len() {
        return protocol_err("offer session malformed");
    }
    let session = &payload[off..];
    if !session.is_ascii() {
        return protocol_err("offer session id must be ASCII");
    }
    let session_id = String::from_utf8(session.to_vec()).expect("ascii checked");
    Ok(Offer {
        name,
        size,
        session_id,
    })
}

/// Build an ACCEPT payload carrying the resume offset and echoed session id.
pub fn encode_accept(offset: u64, session_id: &str) -> Result<Vec<u8>> {
    if session_id.is_empty() || session_id.len() > 128 || !session_id.is_ascii() {
        return protocol_err("accept session id must be 1..=128 ASCII bytes");
    }
    let session = session_id.as_bytes();
    let mut payload = Vec::with_capacity(8 + 2 + session.len());
    payload.extend_from_slice(&offset.to_be_bytes());
    payload.extend_from_slice(&(session.len() as u16).to_be_bytes());
    payload.extend_from_slice(session);
    Ok(payload)
}

/// Parse an ACCEPT payload into (resume offset, echoed session id).
pub fn decode_accept(payload: &[u8]) -> Result<(u64, String)> {
    if payload.len() < 10 {
        return protocol_err("accept payload too short");
    }
    let offset = u64::from_be_bytes(payload[..8].try_into().expect("fixed slice"));
    let session_len = u16::from_be_bytes([payload[8], payload[9]]) as usize;
    if session_len == 0 || payload.len() != 10 + session_len {
        return protocol_err("accept session malformed");
    }
    let session = &payload[10..];
    if !session.is_ascii() {
        return protocol_err("accept session id must be ASCII");
    }
    Ok((offset, String::from_utf8(session.to_vec()).expect("ascii checked")))
}

/// Build a DONE payload carrying the final digest.
pub fn encode_done(digest: &[u8]) -> Result<Vec<u8>> {
    if digest.len() != HASH_SIZE {
        return protocol_err("done digest must be 32 bytes");
    }
    let mut payload = Vec::with_capacity(2 + HASH_SIZE);
    payload.extend_from_slice(&(HASH_SIZE as u16).to_be_bytes());
    payload.extend_from_slice(digest);
    Ok(payload)
}

/// Parse a DONE payload into the expected digest.
pub fn decode_done(payload: &[u8]) -> Result<[u8; HASH_SIZE]> {
    if payload.len() != 2 + HASH_SIZE {
        return protocol_err("done payload length invalid");
    }
    if u16::from_be_bytes([payload[0], payload[1]]) as usize != HASH_SIZE {
        return protocol_err("done hash length field invalid");
    }
    Ok(payload[2..].try_into().expect("fixed slice"))
}

/// Build an ERROR payload.
pub fn encode_error(msg: &str) -> Result<Vec<u8>> {
    if msg.is_empty() || msg.len() > 1024 {
        return protocol_err("error message must be 1..=1024 bytes");
    }
    let bytes = msg.as_bytes();
    let mut payload = Vec::with_capacity(2 + bytes.len());
    payload.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    payload.extend_from_slice(bytes);
    Ok(payload)
}

/// Parse an ERROR payload into its message.
pub fn decode_error(payload: &[u8]) -> Result<String> {
    if payload.len() < 2 {
        return protocol_err("error payload too short");
    }
    let len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if len == 0 || len + 2 != payload.len() {
        return protocol_err("error payload malformed");
    }
    String::from_utf8(payload[2..].to_vec())
        .map_err(|_| errors::tag(ErrorKind::InvalidProtocol, "error message is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::kind_of;
    use crate::protocol::MAX_CHUNK_SIZE;
    use std::io::Cursor;

    fn round_trip(frame_type: u16, payload: &[u8]) -> Frame {
        let mut buf = Vec::new();
        write_frame(&mut buf, frame_type, payload).unwrap();
        read_frame(&mut Cursor::new(buf)).unwrap()
    }

    #[test]
    fn frame_round_trip() {
        let out = round_trip(frame::DATA, b"hello");
        assert_eq!(out.frame_type, frame::DATA);
        assert_eq!(out.payload, b"hello");

        let out = round_trip(frame::HELLO, b"");
        assert_eq!(out.frame_type, frame::HELLO);
        assert!(out.payload.is_empty());
    }

    #[test]
    fn frame_round_trip_at_caps() {
        let data = vec![0xabu8; MAX_CHUNK_SIZE];
        assert_eq!(round_trip(frame::DATA, &data).payload, data);

        let done = encode_done(&[7u8; HASH_SIZE]).unwrap();
        assert_eq!(round_trip(frame::DONE, &done).payload, done);
    }

    #[test]
    fn write_frame_rejects_oversize() {
        let mut buf = Vec::new();
        let too_big = vec![0u8; MAX_CHUNK_SIZE + 1];
        let err = write_frame(&mut buf, frame::DATA, &too_big).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::InvalidProtocol));
        assert!(buf.is_empty(), "nothing may reach the wire");

        let err = write_frame(&mut buf, frame::HELLO, b"x").unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::InvalidProtocol));
    }

    fn raw_header(magic: &[u8; 4], version: u16, frame_type: u16, len: u32, reserved: u32) -> Vec<u8> {
        let mut h = Vec::with_capacity(HEADER_SIZE);
        h.extend_from_slice(magic);
        h.extend_from_slice(&version.to_be_bytes());
        h.extend_from_slice(&frame_type.to_be_bytes());
        h.extend_from_slice(&len.to_be_bytes());
        h.extend_from_slice(&reserved.to_be_bytes());
        h
    }

    #[test]
    fn read_frame_rejects_bad_headers() {
        let cases = [
            raw_header(b"NOPE", VERSION, frame::HELLO, 0, 0),
            raw_header(MAGIC, VERSION + 1, frame::HELLO, 0, 0),
            raw_header(MAGIC, VERSION, frame::HELLO, 0, 1),
            raw_header(MAGIC, VERSION, frame::DATA, (MAX_CHUNK_SIZE + 1) as u32, 0),
            raw_header(MAGIC, VERSION, frame::OFFER, 5000, 0),
            raw_header(MAGIC, VERSION, frame::HELLO, 1, 0),
        ];
        for (i, header) in cases.iter().enumerate() {
            let err = read_frame(&mut Cursor::new(header.clone())).unwrap_err();
            assert_eq!(
                kind_of(&err),
                Some(ErrorKind::InvalidProtocol),
                "case {i}: {err:#}"
            );
        }
    }

    #[test]
    fn read_frame_short_stream_is_not_protocol_error() {
        let err = read_frame(&mut Cursor::new(vec![0u8; 3])).unwrap_err();
        assert_eq!(kind_of(&err), None);

        // Declared length larger than what follows.
        let mut buf = raw_header(MAGIC, VERSION, frame::DATA, 100, 0);
        buf.extend_from_slice(&[0u8; 10]);
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(kind_of(&err), None);
    }

    #[test]
    fn offer_round_trip() {
        let offer = Offer {
            name: "movie.mkv".into(),
            size: 123_456_789,
            session_id: "sess-42".into(),
        };
        let payload = encode_offer(&offer).unwrap();
        assert_eq!(decode_offer(&payload).unwrap(), offer);
    }

    #[test]
    fn offer_field_validation() {
        let base = Offer {
            name: "f".into(),
            size: 1,
            session_id: "s".into(),
        };
        let mut o = base.clone();
        o.name = String::new();
        assert!(encode_offer(&o).is_err());
        o.name = "n".repeat(1025);
        assert!(encode_offer(&o).is_err());

        let mut o = base.clone();
        o.session_id = String::new();
        assert!(encode_offer(&o).is_err());
        o.session_id = "s".repeat(129);
        assert!(encode_offer(&o).is_err());
        o.session_id = "séance".into();
        assert!(encode_offer(&o).is_err());
    }

    #[test]
    fn offer_decode_rejects_trailing_bytes() {
        let mut payload = encode_offer(&Offer {
            name: "a.bin".into(),
            size: 10,
            session_id: "sid".into(),
        })
        .unwrap();
        payload.push(0);
        let err = decode_offer(&payload).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::InvalidProtocol));
    }

    #[test]
    fn accept_round_trip_and_validation() {
        let payload = encode_accept(4096, "sid").unwrap();
        assert_eq!(decode_accept(&payload).unwrap(), (4096, "sid".to_string()));

        assert!(encode_accept(0, "").is_err());
        let mut payload = encode_accept(0, "sid").unwrap();
        payload.push(0);
        assert!(decode_accept(&payload).is_err());
        assert!(decode_accept(&[0u8; 9]).is_err());
    }

    #[test]
    fn done_round_trip_and_validation() {
        let digest = [9u8; HASH_SIZE];
        let payload = encode_done(&digest).unwrap();
        assert_eq!(decode_done(&payload).unwrap(), digest);

        assert!(encode_done(&[0u8; 16]).is_err());
        assert!(decode_done(&payload[..33]).is_err());
        let mut bad = payload.clone();
        bad[0] = 0;
        bad[1] = 16;
        assert!(decode_done(&bad).is_err());
    }

    #[test]
    fn error_round_trip_and_validation() {
        let payload = encode_error("integrity check failed").unwrap();
        assert_eq!(decode_error(&payload).unwrap(), "integrity check failed");

        assert!(encode_error("").is_err());
        assert!(encode_error(&"m".repeat(1025)).is_err());
        let mut bad = encode_error("x").unwrap();
        bad.push(b'y');
        assert!(decode_error(&bad).is_err());
    }
}
