//! Wire-format framing: fixed-layout encode/decode for every frame the
//! daemon exchanges with clients, kept as pure functions over byte
//! buffers so they're testable without a socket. All multi-byte
//! integers are big-endian.

use bitflags::bitflags;

pub const MAGIC: [u8; 4] = *b"OBJM";
pub const PROTOCOL_VERSION: u8 = 2;

pub const MSG_REQUEST: u8 = 0x01;
pub const MSG_RESPONSE: u8 = 0x02;
pub const MSG_CLOSE: u8 = 0x03;
pub const MSG_CLOSE_ACK: u8 = 0x04;

pub const MODE_FD_PASS: u8 = b'1';

pub const META_TYPE_SIZE: u8 = 0x01;
pub const META_TYPE_MTIME: u8 = 0x02;
pub const META_TYPE_TIER: u8 = 0x03;
pub const META_TYPE_ERROR_MESSAGE: u8 = 0xFF;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Capabilities: u16 {
        const OOO_REPLIES = 0x0001;
        const PIPELINING  = 0x0002;
    }
}

bitflags! {
    /// `EPHEMERAL` selects the ephemeral placement policy for an implicit
    /// PUT; kept as its own named bit rather than folded into `ORDERED`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct RequestFlags: u8 {
        const ORDERED   = 0b0000_0001;
        const EPHEMERAL = 0b0000_0010;
    }
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StatusCode {
    Ok = 0x00,
    NotFound = 0x01,
    InvalidRequest = 0x02,
    InvalidMode = 0x03,
    UriTooLong = 0x04,
    UnsupportedOp = 0x05,
    InternalError = 0x10,
    StorageError = 0x11,
    OutOfMemory = 0x12,
    Timeout = 0x13,
    Unavailable = 0x14,
    ProtocolError = 0x20,
    VersionMismatch = 0x21,
    CapabilityError = 0x22,
}

impl StatusCode {
    pub fn is_ok(self) -> bool {
        matches!(self, StatusCode::Ok)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("bad magic in v2 handshake")]
    BadMagic,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unexpected message type {0:#x}")]
    UnexpectedMessageType(u8),
    #[error("uri length {0} exceeds wire maximum")]
    UriTooLong(u16),
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hello {
    pub version: u8,
    pub caps: Capabilities,
    pub max_pipeline: u16,
}

pub fn encode_hello(hello: &Hello) -> [u8; 9] {
    let mut buf = [0u8; 9];
    buf[0..4].copy_from_slice(&MAGIC);
    buf[4] = hello.version;
    buf[5..7].copy_from_slice(&hello.caps.bits().to_be_bytes());
    buf[7..9].copy_from_slice(&hello.max_pipeline.to_be_bytes());
    buf
}

/// Decodes the 9-byte HELLO frame, `buf[0..4]` included (callers that
/// peeked the magic separately can still pass the full frame here).
pub fn decode_hello(buf: &[u8; 9]) -> Result<Hello> {
    if buf[0..4] != MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    let version = buf[4];
    let caps = Capabilities::from_bits_truncate(u16::from_be_bytes([buf[5], buf[6]]));
    let max_pipeline = u16::from_be_bytes([buf[7], buf[8]]);
    Ok(Hello {
        version,
        caps,
        max_pipeline,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HelloAck {
    pub version: u8,
    pub negotiated_caps: Capabilities,
    pub max_pipeline: u16,
    pub backend_parallelism: u8,
}

pub fn encode_hello_ack(ack: &HelloAck) -> [u8; 10] {
    let mut buf = [0u8; 10];
    buf[0..4].copy_from_slice(&MAGIC);
    buf[4] = ack.version;
    buf[5..7].copy_from_slice(&ack.negotiated_caps.bits().to_be_bytes());
    buf[7..9].copy_from_slice(&ack.max_pipeline.to_be_bytes());
    buf[9] = ack.backend_parallelism;
    buf
}

pub fn decode_hello_ack(buf: &[u8; 10]) -> Result<HelloAck> {
    if buf[0..4] != MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    Ok(HelloAck {
        version: buf[4],
        negotiated_caps: Capabilities::from_bits_truncate(u16::from_be_bytes([buf[5], buf[6]])),
        max_pipeline: u16::from_be_bytes([buf[7], buf[8]]),
        backend_parallelism: buf[9],
    })
}

/// v1 request header: `mode(1) | uri_len(2)`. The `uri_len` bytes of URI
/// follow and are read separately by the caller.
pub fn encode_v1_request_header(mode: u8, uri_len: u16) -> [u8; 3] {
    let mut buf = [0u8; 3];
    buf[0] = mode;
    buf[1..3].copy_from_slice(&uri_len.to_be_bytes());
    buf
}

pub fn decode_v1_request_header(buf: &[u8; 3]) -> (u8, u16) {
    (buf[0], u16::from_be_bytes([buf[1], buf[2]]))
}

/// v2 request header: `type(1) | request_id(4) | flags(1) | mode(1) |
/// uri_len(2)`. `type` must equal [`MSG_REQUEST`].
pub fn encode_v2_request_header(request_id: u32, flags: RequestFlags, mode: u8, uri_len: u16) -> [u8; 9] {
    let mut buf = [0u8; 9];
    buf[0] = MSG_REQUEST;
    buf[1..5].copy_from_slice(&request_id.to_be_bytes());
    buf[5] = flags.bits();
    buf[6] = mode;
    buf[7..9].copy_from_slice(&uri_len.to_be_bytes());
    buf
}

pub struct V2RequestHeader {
    pub msg_type: u8,
    pub request_id: u32,
    pub flags: RequestFlags,
    pub mode: u8,
    pub uri_len: u16,
}

pub fn decode_v2_request_header(buf: &[u8; 9]) -> V2RequestHeader {
    V2RequestHeader {
        msg_type: buf[0],
        request_id: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
        flags: RequestFlags::from_bits_truncate(buf[5]),
        mode: buf[6],
        uri_len: u16::from_be_bytes([buf[7], buf[8]]),
    }
}

/// v1 response header: `status(1) | content_len(8) | metadata_len(2)`.
pub fn encode_v1_response_header(status: StatusCode, content_len: u64, metadata_len: u16) -> [u8; 11] {
    let mut buf = [0u8; 11];
    buf[0] = status as u8;
    buf[1..9].copy_from_slice(&content_len.to_be_bytes());
    buf[9..11].copy_from_slice(&metadata_len.to_be_bytes());
    buf
}

pub fn decode_v1_response_header(buf: &[u8; 11]) -> (u8, u64, u16) {
    (
        buf[0],
        u64::from_be_bytes(buf[1..9].try_into().unwrap()),
        u16::from_be_bytes([buf[9], buf[10]]),
    )
}

/// v2 response header: `type(1) | request_id(4) | status(1) |
/// content_len(8) | metadata_len(2)`.
pub fn encode_v2_response_header(
    request_id: u32,
    status: StatusCode,
    content_len: u64,
    metadata_len: u16,
) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0] = MSG_RESPONSE;
    buf[1..5].copy_from_slice(&request_id.to_be_bytes());
    buf[5] = status as u8;
    buf[6..14].copy_from_slice(&content_len.to_be_bytes());
    buf[14..16].copy_from_slice(&metadata_len.to_be_bytes());
    buf
}

pub struct V2ResponseHeader {
    pub msg_type: u8,
    pub request_id: u32,
    pub status: u8,
    pub content_len: u64,
    pub metadata_len: u16,
}

pub fn decode_v2_response_header(buf: &[u8; 16]) -> V2ResponseHeader {
    V2ResponseHeader {
        msg_type: buf[0],
        request_id: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
        status: buf[5],
        content_len: u64::from_be_bytes(buf[6..14].try_into().unwrap()),
        metadata_len: u16::from_be_bytes([buf[14], buf[15]]),
    }
}

pub fn encode_close(reason: u8) -> [u8; 2] {
    [MSG_CLOSE, reason]
}

pub fn encode_close_ack(outstanding: u32) -> [u8; 6] {
    let mut buf = [0u8; 6];
    buf[0] = MSG_CLOSE_ACK;
    buf[1] = 0;
    buf[2..6].copy_from_slice(&outstanding.to_be_bytes());
    buf
}

pub fn decode_close_ack(buf: &[u8; 6]) -> (u8, u32) {
    (buf[0], u32::from_be_bytes(buf[2..6].try_into().unwrap()))
}

/// Appends one TLV entry (`type(1) | length(2) | value`) at a time.
#[derive(Default)]
pub struct MetadataBuilder {
    buf: Vec<u8>,
}

impl MetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, ty: u8, value: &[u8]) -> Self {
        self.buf.push(ty);
        self.buf
            .extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    pub fn push_u64(self, ty: u8, value: u64) -> Self {
        self.push(ty, &value.to_be_bytes())
    }

    pub fn push_i64(self, ty: u8, value: i64) -> Self {
        self.push(ty, &value.to_be_bytes())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub struct MetadataEntry<'a> {
    pub ty: u8,
    pub value: &'a [u8],
}

/// Parses concatenated TLV entries. Malformed trailing bytes (a header
/// that claims more than remains) are silently dropped; unknown entry
/// types are likewise skipped rather than rejected, so old clients stay
/// forward-compatible with new metadata types.
pub fn parse_metadata(buf: &[u8]) -> Vec<MetadataEntry<'_>> {
    let mut entries = Vec::new();
    let mut i = 0;
    while i + 3 <= buf.len() {
        let ty = buf[i];
        let len = u16::from_be_bytes([buf[i + 1], buf[i + 2]]) as usize;
        i += 3;
        if i + len > buf.len() {
            break;
        }
        entries.push(MetadataEntry {
            ty,
            value: &buf[i..i + len],
        });
        i += len;
    }
    entries
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hello_roundtrip_with_ooo_and_pipelining_caps() {
        let hello = Hello {
            version: 2,
            caps: Capabilities::OOO_REPLIES | Capabilities::PIPELINING,
            max_pipeline: 16,
        };
        let bytes = encode_hello(&hello);
        assert_eq!(bytes, [b'O', b'B', b'J', b'M', 0x02, 0x00, 0x03, 0x00, 0x10]);
        assert_eq!(decode_hello(&bytes).unwrap(), hello);

        let ack = HelloAck {
            version: 2,
            negotiated_caps: Capabilities::OOO_REPLIES | Capabilities::PIPELINING,
            max_pipeline: 8,
            backend_parallelism: 2,
        };
        let bytes = encode_hello_ack(&ack);
        assert_eq!(
            bytes,
            [b'O', b'B', b'J', b'M', 0x02, 0x00, 0x03, 0x00, 0x08, 0x02]
        );
        assert_eq!(decode_hello_ack(&bytes).unwrap(), ack);
    }

    #[test]
    fn v1_request_header_layout() {
        let header = encode_v1_request_header(b'1', 10);
        assert_eq!(header, [b'1', 0x00, 0x0A]);
        assert_eq!(decode_v1_request_header(&header), (b'1', 10));
    }

    #[test]
    fn v1_response_header_layout_for_zero_length_fd_pass_reply() {
        let header = encode_v1_response_header(StatusCode::Ok, 0, 0);
        assert_eq!(
            header,
            [0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0x00]
        );
    }

    #[test]
    fn v2_request_roundtrip() {
        let header = encode_v2_request_header(7, RequestFlags::ORDERED, b'1', 19);
        let decoded = decode_v2_request_header(&header);
        assert_eq!(decoded.msg_type, MSG_REQUEST);
        assert_eq!(decoded.request_id, 7);
        assert_eq!(decoded.flags, RequestFlags::ORDERED);
        assert_eq!(decoded.mode, b'1');
        assert_eq!(decoded.uri_len, 19);
    }

    #[test]
    fn v2_response_roundtrip() {
        let header = encode_v2_response_header(42, StatusCode::NotFound, 0, 5);
        let decoded = decode_v2_response_header(&header);
        assert_eq!(decoded.request_id, 42);
        assert_eq!(decoded.status, StatusCode::NotFound as u8);
        assert_eq!(decoded.metadata_len, 5);
    }

    #[test]
    fn metadata_roundtrip() {
        let bytes = MetadataBuilder::new()
            .push_u64(META_TYPE_SIZE, 9)
            .push_i64(META_TYPE_MTIME, 123)
            .finish();
        let entries = parse_metadata(&bytes);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ty, META_TYPE_SIZE);
        assert_eq!(u64::from_be_bytes(entries[0].value.try_into().unwrap()), 9);
        assert_eq!(entries[1].ty, META_TYPE_MTIME);
    }

    #[test]
    fn truncated_metadata_entry_is_dropped_not_panicked() {
        let mut bytes = MetadataBuilder::new().push_u64(META_TYPE_SIZE, 9).finish();
        bytes.truncate(bytes.len() - 1);
        let entries = parse_metadata(&bytes);
        assert!(entries.is_empty());
    }

    #[test]
    fn close_ack_layout() {
        let bytes = encode_close_ack(3);
        assert_eq!(bytes, [MSG_CLOSE_ACK, 0, 0, 0, 0, 3]);
        assert_eq!(decode_close_ack(&bytes), (MSG_CLOSE_ACK, 3));
    }
}
