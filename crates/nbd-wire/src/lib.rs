//! NBD data-plane wire codec.
//!
//! Pure encode/decode of the two fixed binary frames used once a session has
//! left the handshake: the 28-byte request header and the 16-byte reply
//! header. No I/O here — callers own the socket and the framing discipline
//! (gathered writes, short-read handling); this module only knows how to
//! turn bytes into `Request`/`Reply` values and back.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

/// Magic value that must prefix every request header.
pub const REQUEST_MAGIC: u32 = 0x2560_9513;
/// Magic value that must prefix every reply header.
pub const REPLY_MAGIC: u32 = 0x6744_6698;

/// Size in bytes of an on-wire request header.
pub const REQUEST_HEADER_LEN: usize = 28;
/// Size in bytes of an on-wire reply header.
pub const REPLY_HEADER_LEN: usize = 16;

/// The four commands this data plane understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Read,
    Write,
    Disconnect,
    Flush,
}

impl Command {
    fn from_wire(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            2 => Some(Self::Disconnect),
            3 => Some(Self::Flush),
            _ => None,
        }
    }
}

/// Errors raised while decoding a request header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("bad request magic: {0:#x}")]
    BadMagic(u32),

    #[error("unknown command: {0}")]
    BadCommand(u32),
}

/// A decoded request header. The WRITE payload (if any) is read separately
/// by the caller, using `length` as the byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub cookie: u64,
    pub offset: u64,
    pub length: u32,
}

/// Decode a 28-byte request header.
///
/// # Errors
/// Returns [`WireError::BadMagic`] or [`WireError::BadCommand`] if the
/// buffer does not describe a well-formed header; the caller treats both as
/// framing errors (increment error count, no resync attempted).
pub fn decode_request(buf: &[u8; REQUEST_HEADER_LEN]) -> Result<Request, WireError> {
    let mut cursor = Cursor::new(&buf[..]);
    let magic = cursor.read_u32::<BigEndian>().expect("fixed-size buffer");
    if magic != REQUEST_MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    let command = cursor.read_u32::<BigEndian>().expect("fixed-size buffer");
    let command = Command::from_wire(command).ok_or(WireError::BadCommand(command))?;
    let cookie = cursor.read_u64::<BigEndian>().expect("fixed-size buffer");
    let offset = cursor.read_u64::<BigEndian>().expect("fixed-size buffer");
    let length = cursor.read_u32::<BigEndian>().expect("fixed-size buffer");
    Ok(Request {
        command,
        cookie,
        offset,
        length,
    })
}

/// A reply header, with an optional READ payload carried alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub error: u32,
    pub cookie: u64,
}

impl Reply {
    #[must_use]
    pub fn ok(cookie: u64) -> Self {
        Self { error: 0, cookie }
    }

    #[must_use]
    pub fn err(cookie: u64, errno: u32) -> Self {
        Self {
            error: errno,
            cookie,
        }
    }
}

/// Encode a 16-byte reply header.
#[must_use]
pub fn encode_reply_header(reply: &Reply) -> [u8; REPLY_HEADER_LEN] {
    let mut out = [0u8; REPLY_HEADER_LEN];
    let mut cursor = Cursor::new(&mut out[..]);
    cursor
        .write_u32::<BigEndian>(REPLY_MAGIC)
        .expect("fixed-size buffer");
    cursor
        .write_u32::<BigEndian>(reply.error)
        .expect("fixed-size buffer");
    cursor
        .write_u64::<BigEndian>(reply.cookie)
        .expect("fixed-size buffer");
    out
}

/// Assemble a full READ-success reply frame (header + payload) into one
/// contiguous buffer, for callers whose transport has no gathered-write
/// primitive. The reactor prefers `write_vectored` directly over
/// `[header, data]` so the two pieces still leave the socket in a single
/// system call; this is the fallback that guarantees the same atomicity.
#[must_use]
pub fn assemble_read_reply(reply: &Reply, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(REPLY_HEADER_LEN + data.len());
    out.extend_from_slice(&encode_reply_header(reply));
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_bytes(magic: u32, command: u32, cookie: u64, offset: u64, length: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(REQUEST_HEADER_LEN);
        out.write_u32::<BigEndian>(magic).unwrap();
        out.write_u32::<BigEndian>(command).unwrap();
        out.write_u64::<BigEndian>(cookie).unwrap();
        out.write_u64::<BigEndian>(offset).unwrap();
        out.write_u32::<BigEndian>(length).unwrap();
        out
    }

    #[test]
    fn decodes_a_read_request() {
        let bytes = request_bytes(REQUEST_MAGIC, 0, 0xDEAD_BEEF, 0, 8);
        let buf: [u8; REQUEST_HEADER_LEN] = bytes.try_into().unwrap();
        let req = decode_request(&buf).unwrap();
        assert_eq!(req.command, Command::Read);
        assert_eq!(req.cookie, 0xDEAD_BEEF);
        assert_eq!(req.offset, 0);
        assert_eq!(req.length, 8);
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = request_bytes(0xBAD, 0, 0, 0, 0);
        let buf: [u8; REQUEST_HEADER_LEN] = bytes.try_into().unwrap();
        assert_eq!(decode_request(&buf), Err(WireError::BadMagic(0xBAD)));
    }

    #[test]
    fn rejects_unknown_command() {
        let bytes = request_bytes(REQUEST_MAGIC, 99, 0, 0, 0);
        let buf: [u8; REQUEST_HEADER_LEN] = bytes.try_into().unwrap();
        assert_eq!(decode_request(&buf), Err(WireError::BadCommand(99)));
    }

    #[test]
    fn read_reply_framing_matches_spec_scenario() {
        // Scenario 3 from the spec: cookie 0xDEADBEEF, 8 bytes of data.
        let reply = Reply::ok(0xDEAD_BEEF);
        let data = [0u8, 1, 2, 3, 4, 5, 6, 7];
        let frame = assemble_read_reply(&reply, &data);
        assert_eq!(frame.len(), REPLY_HEADER_LEN + data.len());
        assert_eq!(
            &frame[..4],
            &REPLY_MAGIC.to_be_bytes(),
            "reply magic must lead the frame"
        );
        assert_eq!(&frame[4..8], &0u32.to_be_bytes(), "error must be zero");
        assert_eq!(&frame[8..16], &0xDEAD_BEEFu64.to_be_bytes());
        assert_eq!(&frame[16..], &data);
    }

    #[test]
    fn a_reader_that_consumes_header_then_length_bytes_lines_up_on_next_header() {
        let first = assemble_read_reply(&Reply::ok(1), &[1, 2, 3, 4]);
        let second_header = encode_reply_header(&Reply::err(2, 5));
        let mut stream = first.clone();
        stream.extend_from_slice(&second_header);

        let mut cursor = Cursor::new(&stream);
        let mut header = [0u8; REPLY_HEADER_LEN];
        std::io::Read::read_exact(&mut cursor, &mut header).unwrap();
        let length = 4usize;
        let mut payload = vec![0u8; length];
        std::io::Read::read_exact(&mut cursor, &mut payload).unwrap();
        let mut next_header = [0u8; REPLY_HEADER_LEN];
        std::io::Read::read_exact(&mut cursor, &mut next_header).unwrap();
        assert_eq!(next_header, second_header);
    }
}
