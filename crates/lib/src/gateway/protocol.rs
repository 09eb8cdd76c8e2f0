//! FastCGI 1.0 wire format: record framing, name/value pairs, and the fixed-size bodies.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;
/// Largest content a single record can carry.
pub const MAX_CONTENT_LEN: usize = 65535;
/// Request id used by management records (GET_VALUES and friends).
pub const NULL_REQUEST_ID: u16 = 0;

/// Record types (FCGI_BEGIN_REQUEST ... FCGI_UNKNOWN_TYPE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::BeginRequest,
            2 => Self::AbortRequest,
            3 => Self::EndRequest,
            4 => Self::Params,
            5 => Self::Stdin,
            6 => Self::Stdout,
            7 => Self::Stderr,
            8 => Self::Data,
            9 => Self::GetValues,
            10 => Self::GetValuesResult,
            11 => Self::UnknownType,
            _ => return None,
        })
    }
}

pub const ROLE_RESPONDER: u16 = 1;
pub const FLAG_KEEP_CONN: u8 = 1;

/// END_REQUEST protocol status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMpxConn = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

#[derive(Debug, thiserror::Error)]
pub enum FcgiError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unsupported fastcgi version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed fastcgi record: {0}")]
    Malformed(String),
}

/// One record as read off the wire; padding already discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Raw type byte; unknown types are kept so they can be answered with UNKNOWN_TYPE.
    pub kind: u8,
    pub request_id: u16,
    pub content: Vec<u8>,
}

impl Record {
    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_u8(self.kind)
    }
}

/// Body of BEGIN_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequest {
    pub fn parse(content: &[u8]) -> Result<Self, FcgiError> {
        if content.len() < 8 {
            return Err(FcgiError::Malformed(format!(
                "begin request body is {} bytes, expected 8",
                content.len()
            )));
        }
        Ok(Self {
            role: u16::from_be_bytes([content[0], content[1]]),
            flags: content[2],
        })
    }

    pub fn encode(&self) -> [u8; 8] {
        let role = self.role.to_be_bytes();
        [role[0], role[1], self.flags, 0, 0, 0, 0, 0]
    }

    pub fn keep_conn(&self) -> bool {
        self.flags & FLAG_KEEP_CONN != 0
    }
}

/// Body of END_REQUEST.
pub fn end_request_body(app_status: u32, status: ProtocolStatus) -> [u8; 8] {
    let a = app_status.to_be_bytes();
    [a[0], a[1], a[2], a[3], status as u8, 0, 0, 0]
}

/// Body of UNKNOWN_TYPE.
pub fn unknown_type_body(kind: u8) -> [u8; 8] {
    [kind, 0, 0, 0, 0, 0, 0, 0]
}

/// Read one record. Returns None when the peer closed the stream between records.
pub async fn read_record<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Record>, FcgiError> {
    let mut header = [0u8; HEADER_LEN];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if header[0] != VERSION_1 {
        return Err(FcgiError::UnsupportedVersion(header[0]));
    }
    let kind = header[1];
    let request_id = u16::from_be_bytes([header[2], header[3]]);
    let content_len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let padding_len = header[6] as usize;

    let mut content = vec![0u8; content_len];
    r.read_exact(&mut content).await?;
    if padding_len > 0 {
        let mut padding = [0u8; 255];
        r.read_exact(&mut padding[..padding_len]).await?;
    }
    Ok(Some(Record {
        kind,
        request_id,
        content,
    }))
}

/// Append one framed record to `out`, padded to a multiple of 8 bytes.
pub fn encode_record(out: &mut Vec<u8>, kind: RecordType, request_id: u16, content: &[u8]) {
    debug_assert!(content.len() <= MAX_CONTENT_LEN);
    let padding_len = (8 - content.len() % 8) % 8;
    let id = request_id.to_be_bytes();
    let len = (content.len() as u16).to_be_bytes();
    out.extend_from_slice(&[
        VERSION_1,
        kind as u8,
        id[0],
        id[1],
        len[0],
        len[1],
        padding_len as u8,
        0,
    ]);
    out.extend_from_slice(content);
    out.extend(std::iter::repeat(0u8).take(padding_len));
}

/// Append a stream (STDOUT, STDIN, PARAMS...): data split into maximal records, then the empty terminator.
pub fn encode_stream(out: &mut Vec<u8>, kind: RecordType, request_id: u16, data: &[u8]) {
    for chunk in data.chunks(MAX_CONTENT_LEN) {
        encode_record(out, kind, request_id, chunk);
    }
    encode_record(out, kind, request_id, &[]);
}

/// Write one record directly.
pub async fn write_record<W: AsyncWrite + Unpin>(
    w: &mut W,
    kind: RecordType,
    request_id: u16,
    content: &[u8],
) -> Result<(), FcgiError> {
    let mut buf = Vec::with_capacity(HEADER_LEN + content.len() + 7);
    encode_record(&mut buf, kind, request_id, content);
    w.write_all(&buf).await?;
    Ok(())
}

fn encode_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        out.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

fn decode_length(buf: &[u8], pos: &mut usize) -> Result<usize, FcgiError> {
    let first = *buf
        .get(*pos)
        .ok_or_else(|| FcgiError::Malformed("truncated name/value length".to_string()))?;
    if first & 0x80 == 0 {
        *pos += 1;
        return Ok(first as usize);
    }
    let bytes = buf
        .get(*pos..*pos + 4)
        .ok_or_else(|| FcgiError::Malformed("truncated name/value length".to_string()))?;
    *pos += 4;
    Ok((u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x7fff_ffff) as usize)
}

/// Encode name/value pairs (PARAMS, GET_VALUES, GET_VALUES_RESULT bodies).
pub fn encode_pairs<'a, I>(pairs: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = Vec::new();
    for (name, value) in pairs {
        encode_length(&mut out, name.len());
        encode_length(&mut out, value.len());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out
}

/// Decode name/value pairs. Non-UTF-8 bytes are replaced rather than rejected.
pub fn decode_pairs(buf: &[u8]) -> Result<Vec<(String, String)>, FcgiError> {
    let mut pairs = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let name_len = decode_length(buf, &mut pos)?;
        let value_len = decode_length(buf, &mut pos)?;
        let end = pos
            .checked_add(name_len)
            .and_then(|n| n.checked_add(value_len))
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| FcgiError::Malformed("name/value pair overruns record".to_string()))?;
        let name = String::from_utf8_lossy(&buf[pos..pos + name_len]).into_owned();
        let value = String::from_utf8_lossy(&buf[pos + name_len..end]).into_owned();
        pairs.push((name, value));
        pos = end;
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_padded_to_eight() {
        let mut out = Vec::new();
        encode_record(&mut out, RecordType::Stdout, 3, b"hello");
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..8], &[1, 6, 0, 3, 0, 5, 3, 0]);
        assert_eq!(&out[8..13], b"hello");
    }

    #[tokio::test]
    async fn reads_back_written_records() {
        let mut out = Vec::new();
        encode_record(&mut out, RecordType::Params, 1, b"abc");
        encode_record(&mut out, RecordType::Params, 1, b"");
        let mut r = out.as_slice();
        let first = read_record(&mut r).await.unwrap().unwrap();
        assert_eq!(first.record_type(), Some(RecordType::Params));
        assert_eq!(first.request_id, 1);
        assert_eq!(first.content, b"abc");
        let second = read_record(&mut r).await.unwrap().unwrap();
        assert!(second.content.is_empty());
        assert!(read_record(&mut r).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_other_versions() {
        let bytes = [2u8, 1, 0, 1, 0, 0, 0, 0];
        let mut r = &bytes[..];
        assert!(matches!(
            read_record(&mut r).await,
            Err(FcgiError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn long_stream_is_chunked() {
        let data = vec![b'x'; MAX_CONTENT_LEN + 10];
        let mut out = Vec::new();
        encode_stream(&mut out, RecordType::Stdout, 1, &data);
        // 65535 bytes + 1 padding, 10 bytes + 6 padding, empty terminator
        assert_eq!(out.len(), (8 + 65536) + (8 + 16) + 8);
    }

    #[test]
    fn pairs_short_and_long_lengths() {
        let long = "v".repeat(300);
        let encoded = encode_pairs([("REQUEST_METHOD", "POST"), ("HTTP_X_LONG", long.as_str())]);
        // short value length is one byte, long one is four with the high bit set
        assert_eq!(encoded[0], 14);
        assert_eq!(encoded[1], 4);
        let decoded = decode_pairs(&encoded).unwrap();
        assert_eq!(decoded[0], ("REQUEST_METHOD".to_string(), "POST".to_string()));
        assert_eq!(decoded[1].1.len(), 300);
    }

    #[test]
    fn truncated_pair_is_malformed() {
        let mut encoded = encode_pairs([("NAME", "VALUE")]);
        encoded.truncate(encoded.len() - 2);
        assert!(matches!(decode_pairs(&encoded), Err(FcgiError::Malformed(_))));
    }

    #[test]
    fn begin_request_flags() {
        let b = BeginRequest {
            role: ROLE_RESPONDER,
            flags: FLAG_KEEP_CONN,
        };
        let parsed = BeginRequest::parse(&b.encode()).unwrap();
        assert_eq!(parsed, b);
        assert!(parsed.keep_conn());
        assert!(BeginRequest::parse(&[0, 1]).is_err());
    }

    #[test]
    fn io_error_text_appears_once_in_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad socket");
        let err = anyhow::Error::from(FcgiError::from(io)).context("fastcgi over stdio");
        let shown = format!("{:#}", err);
        assert_eq!(shown, "fastcgi over stdio: bad socket");
        assert_eq!(shown.matches("bad socket").count(), 1);
    }

    #[test]
    fn end_request_layout() {
        assert_eq!(
            end_request_body(0x01020304, ProtocolStatus::UnknownRole),
            [1, 2, 3, 4, 3, 0, 0, 0]
        );
    }
}
