pub mod crc;
pub mod request;
pub mod response;
pub mod types;

pub use request::{MemoryBlock, MemoryWriteBlock, Request};
pub use response::Response;
pub use types::{
    address_byte_size, decode_address, decode_numeric, encode_address,
    heartbeat_challenge_response, Command, DataType, Endianness, Priority, ResponseCode,
};

/// Encodes `request` into the wire frame `{command, subfunction, length, payload, CRC32}`.
/// The link below this is non-framing, so this is the only place a message boundary
/// is defined.
pub fn encode_frame(req: &Request) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + req.payload.len() + 4);
    frame.push(req.command.code());
    frame.push(req.subfn);
    frame.extend_from_slice(&(req.payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&req.payload);
    crc::append_crc32(&mut frame);
    frame
}

/// Minimum bytes needed before a frame's declared length can be read.
pub const FRAME_HEADER_LEN: usize = 4;
/// Bytes appended after the payload (the CRC32 trailer).
pub const FRAME_TRAILER_LEN: usize = 4;

/// Given bytes accumulated so far, returns the full frame length once the
/// header has arrived, so the caller knows how many more bytes to wait for.
pub fn declared_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let payload_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    Some(FRAME_HEADER_LEN + payload_len + FRAME_TRAILER_LEN)
}

/// Parses a complete frame (as sized by `declared_frame_len`) into a typed
/// `Response`. A response frame's `length` field covers the status code byte
/// plus the payload that follows it. Returns `None` on a CRC mismatch or
/// truncated buffer — callers treat that as a malformed response, a transient
/// failure.
pub fn decode_frame(buf: &[u8]) -> Option<Response> {
    let total_len = declared_frame_len(buf)?;
    if buf.len() < total_len {
        return None;
    }
    let subfn = buf[1];
    let checked = crc::split_and_check(&buf[..total_len])?;
    let body = &checked[FRAME_HEADER_LEN..];
    let code = ResponseCode::from_byte(*body.first()?);
    let payload = body[1..].to_vec();
    Some(Response {
        subfn,
        code,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let req = request::discover();
        let bytes = encode_frame(&req);
        let len = declared_frame_len(&bytes).unwrap();
        assert_eq!(len, bytes.len());
    }
}
