//! Request/response payload codec.
//!
//! A payload is a sequence of fields separated by [`FIELD_SEPARATOR`]. The
//! first field of a request is the opcode, the first field of a response is
//! the status; both are ASCII decimal. Content is always the last field of a
//! request and runs to the end of the payload, so it may itself contain the
//! separator byte.

use std::fmt;
use std::ops::BitOr;

use thiserror::Error;

/// Byte separating the fields of a payload
pub const FIELD_SEPARATOR: u8 = 0x01;

/// Longest accepted file name, in bytes
pub const MAX_NAME_LEN: usize = 108;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty payload")]
    Empty,

    #[error("invalid opcode: {0:?}")]
    InvalidOpcode(String),

    #[error("invalid status: {0:?}")]
    InvalidStatus(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unexpected trailing field after {0}")]
    TrailingField(&'static str),

    #[error("invalid number in field {0}")]
    InvalidNumber(&'static str),

    #[error("file name is empty or not valid UTF-8")]
    InvalidName,

    #[error("file name too long: {0} bytes")]
    NameTooLong(usize),
}

impl ProtocolError {
    /// Status reported to a client whose request failed to decode
    pub fn status(&self) -> Status {
        match self {
            ProtocolError::NameTooLong(_) => Status::NameTooLong,
            _ => Status::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

// ============================================================================
// Opcodes and statuses
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    CloseConnection = 0,
    Open = 1,
    Close = 2,
    Write = 3,
    Read = 4,
    ReadN = 5,
    Append = 6,
    Lock = 7,
    Unlock = 8,
    Remove = 9,
    WriteNoContent = 10,
}

impl Opcode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Opcode::CloseConnection,
            1 => Opcode::Open,
            2 => Opcode::Close,
            3 => Opcode::Write,
            4 => Opcode::Read,
            5 => Opcode::ReadN,
            6 => Opcode::Append,
            7 => Opcode::Lock,
            8 => Opcode::Unlock,
            9 => Opcode::Remove,
            10 => Opcode::WriteNoContent,
            _ => return None,
        })
    }
}

/// Outcome carried in the first field of every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success = 0,
    AlreadyOpen = 1,
    NotFound = 2,
    Unknown = 3,
    NameTooLong = 4,
    AlreadyExists = 5,
    NotOpened = 6,
    Locked = 7,
    OutOfMemory = 8,
}

impl Status {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Status::Success,
            1 => Status::AlreadyOpen,
            2 => Status::NotFound,
            3 => Status::Unknown,
            4 => Status::NameTooLong,
            5 => Status::AlreadyExists,
            6 => Status::NotOpened,
            7 => Status::Locked,
            8 => Status::OutOfMemory,
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Success => "success",
            Status::AlreadyOpen => "file already opened",
            Status::NotFound => "file not found",
            Status::Unknown => "unknown error",
            Status::NameTooLong => "file name too long",
            Status::AlreadyExists => "file already exists",
            Status::NotOpened => "file not opened",
            Status::Locked => "file locked by another client",
            Status::OutOfMemory => "not enough storage space",
        };
        f.write_str(text)
    }
}

/// Flags accepted by the open request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags(u8);

impl OpenFlags {
    pub const NONE: OpenFlags = OpenFlags(0);
    pub const CREATE: OpenFlags = OpenFlags(1);
    pub const LOCK: OpenFlags = OpenFlags(2);

    /// Unknown bits are dropped
    pub fn from_bits_truncate(bits: u8) -> Self {
        OpenFlags(bits & (Self::CREATE.0 | Self::LOCK.0))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    CloseConnection,
    Open { path: String, flags: OpenFlags },
    Close { path: String },
    Write { path: String, content: Vec<u8> },
    Read { path: String },
    ReadN { count: usize },
    Append { path: String, content: Vec<u8> },
    Lock { path: String },
    Unlock { path: String },
    Remove { path: String },
    WriteNoContent { path: String },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::CloseConnection => Opcode::CloseConnection,
            Request::Open { .. } => Opcode::Open,
            Request::Close { .. } => Opcode::Close,
            Request::Write { .. } => Opcode::Write,
            Request::Read { .. } => Opcode::Read,
            Request::ReadN { .. } => Opcode::ReadN,
            Request::Append { .. } => Opcode::Append,
            Request::Lock { .. } => Opcode::Lock,
            Request::Unlock { .. } => Opcode::Unlock,
            Request::Remove { .. } => Opcode::Remove,
            Request::WriteNoContent { .. } => Opcode::WriteNoContent,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.opcode().code().to_string().into_bytes();
        let mut field = |bytes: &[u8]| {
            out.push(FIELD_SEPARATOR);
            out.extend_from_slice(bytes);
        };
        match self {
            Request::CloseConnection => {}
            Request::Open { path, flags } => {
                field(path.as_bytes());
                field(flags.bits().to_string().as_bytes());
            }
            Request::Write { path, content } | Request::Append { path, content } => {
                field(path.as_bytes());
                field(&content[..]);
            }
            Request::ReadN { count } => field(count.to_string().as_bytes()),
            Request::Close { path }
            | Request::Read { path }
            | Request::Lock { path }
            | Request::Unlock { path }
            | Request::Remove { path }
            | Request::WriteNoContent { path } => field(path.as_bytes()),
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Request> {
        if payload.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let mut fields = payload.splitn(2, |b| *b == FIELD_SEPARATOR);
        let head = fields.next().unwrap_or_default();
        let rest = fields.next();

        let opcode = parse_number::<u8>(head, "opcode")
            .ok()
            .and_then(Opcode::from_code)
            .ok_or_else(|| ProtocolError::InvalidOpcode(String::from_utf8_lossy(head).into()))?;

        let request = match opcode {
            Opcode::CloseConnection => {
                if rest.is_some() {
                    return Err(ProtocolError::TrailingField("opcode"));
                }
                Request::CloseConnection
            }
            Opcode::Open => {
                let mut parts = required(rest, "path")?.splitn(2, |b| *b == FIELD_SEPARATOR);
                let path = parse_name(parts.next().unwrap_or_default())?;
                let flags = parts.next().ok_or(ProtocolError::MissingField("flags"))?;
                if flags.contains(&FIELD_SEPARATOR) {
                    return Err(ProtocolError::TrailingField("flags"));
                }
                let flags = OpenFlags::from_bits_truncate(parse_number(flags, "flags")?);
                Request::Open { path, flags }
            }
            Opcode::Write | Opcode::Append => {
                let mut parts = required(rest, "path")?.splitn(2, |b| *b == FIELD_SEPARATOR);
                let path = parse_name(parts.next().unwrap_or_default())?;
                let content = parts
                    .next()
                    .ok_or(ProtocolError::MissingField("content"))?
                    .to_vec();
                if opcode == Opcode::Write {
                    Request::Write { path, content }
                } else {
                    Request::Append { path, content }
                }
            }
            Opcode::ReadN => {
                let count = required(rest, "count")?;
                if count.contains(&FIELD_SEPARATOR) {
                    return Err(ProtocolError::TrailingField("count"));
                }
                Request::ReadN {
                    count: parse_number(count, "count")?,
                }
            }
            _ => {
                let path = required(rest, "path")?;
                if path.contains(&FIELD_SEPARATOR) {
                    return Err(ProtocolError::TrailingField("path"));
                }
                let path = parse_name(path)?;
                match opcode {
                    Opcode::Close => Request::Close { path },
                    Opcode::Read => Request::Read { path },
                    Opcode::Lock => Request::Lock { path },
                    Opcode::Unlock => Request::Unlock { path },
                    Opcode::Remove => Request::Remove { path },
                    _ => Request::WriteNoContent { path },
                }
            }
        };
        Ok(request)
    }
}

fn required<'a>(field: Option<&'a [u8]>, name: &'static str) -> Result<&'a [u8]> {
    field.ok_or(ProtocolError::MissingField(name))
}

fn parse_name(raw: &[u8]) -> Result<String> {
    if raw.len() > MAX_NAME_LEN {
        return Err(ProtocolError::NameTooLong(raw.len()));
    }
    match std::str::from_utf8(raw) {
        Ok(name) if !name.is_empty() => Ok(name.to_owned()),
        _ => Err(ProtocolError::InvalidName),
    }
}

fn parse_number<T: std::str::FromStr>(raw: &[u8], field: &'static str) -> Result<T> {
    std::str::from_utf8(raw)
        .ok()
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse().ok())
        .ok_or(ProtocolError::InvalidNumber(field))
}

// ============================================================================
// Responses
// ============================================================================

/// A status plus zero or more raw fields.
///
/// Successful reads carry one content field. Successful open, write, append
/// and readN carry `name, content` pairs for ejected or returned files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub fields: Vec<Vec<u8>>,
}

impl Response {
    pub fn ok() -> Self {
        Self::error(Status::Success)
    }

    pub fn error(status: Status) -> Self {
        Self {
            status,
            fields: Vec::new(),
        }
    }

    pub fn with_content(content: Vec<u8>) -> Self {
        Self {
            status: Status::Success,
            fields: vec![content],
        }
    }

    pub fn with_files<I>(files: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        let fields = files
            .into_iter()
            .flat_map(|(name, content)| [name.into_bytes(), content])
            .collect();
        Self {
            status: Status::Success,
            fields,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Content of a read response.
    ///
    /// Fields are re-joined with the separator, so content that contained
    /// the separator byte comes back intact.
    pub fn content(&self) -> Vec<u8> {
        self.fields.join(&FIELD_SEPARATOR)
    }

    /// `(name, content)` pairs of an open/write/append/readN response
    pub fn files(&self) -> Vec<(String, Vec<u8>)> {
        self.fields
            .chunks(2)
            .map(|pair| {
                let name = String::from_utf8_lossy(&pair[0]).into_owned();
                let content = pair.get(1).cloned().unwrap_or_default();
                (name, content)
            })
            .collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.status.code().to_string().into_bytes();
        for field in &self.fields {
            out.push(FIELD_SEPARATOR);
            out.extend_from_slice(field);
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Response> {
        if payload.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let mut fields = payload.split(|b| *b == FIELD_SEPARATOR);
        let head = fields.next().unwrap_or_default();
        let status = parse_number::<u8>(head, "status")
            .ok()
            .and_then(Status::from_code)
            .ok_or_else(|| ProtocolError::InvalidStatus(String::from_utf8_lossy(head).into()))?;
        Ok(Response {
            status,
            fields: fields.map(<[u8]>::to_vec).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(parts: &[&[u8]]) -> Vec<u8> {
        parts.join(&FIELD_SEPARATOR)
    }

    #[test]
    fn test_decode_open() {
        let req = Request::decode(&payload(&[b"1", b"/a", b"3"])).unwrap();
        assert_eq!(
            req,
            Request::Open {
                path: "/a".into(),
                flags: OpenFlags::CREATE | OpenFlags::LOCK,
            }
        );
    }

    #[test]
    fn test_decode_write_keeps_separator_in_content() {
        let req = Request::decode(&payload(&[b"3", b"/a", b"he", b"llo"])).unwrap();
        assert_eq!(
            req,
            Request::Write {
                path: "/a".into(),
                content: b"he\x01llo".to_vec(),
            }
        );
    }

    #[test]
    fn test_decode_write_empty_content() {
        let req = Request::decode(&payload(&[b"6", b"/a", b""])).unwrap();
        assert_eq!(
            req,
            Request::Append {
                path: "/a".into(),
                content: Vec::new(),
            }
        );
    }

    #[test]
    fn test_decode_single_path_opcodes() {
        let cases: [(&[u8], Request); 6] = [
            (b"2", Request::Close { path: "/f".into() }),
            (b"4", Request::Read { path: "/f".into() }),
            (b"7", Request::Lock { path: "/f".into() }),
            (b"8", Request::Unlock { path: "/f".into() }),
            (b"9", Request::Remove { path: "/f".into() }),
            (b"10", Request::WriteNoContent { path: "/f".into() }),
        ];
        for (code, expected) in cases {
            assert_eq!(Request::decode(&payload(&[code, b"/f"])).unwrap(), expected);
        }
    }

    #[test]
    fn test_decode_read_n_and_close_connection() {
        assert_eq!(
            Request::decode(&payload(&[b"5", b"0"])).unwrap(),
            Request::ReadN { count: 0 }
        );
        assert_eq!(Request::decode(b"0").unwrap(), Request::CloseConnection);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(Request::decode(b""), Err(ProtocolError::Empty));
        assert!(matches!(
            Request::decode(b"42"),
            Err(ProtocolError::InvalidOpcode(_))
        ));
        assert!(matches!(
            Request::decode(b"x"),
            Err(ProtocolError::InvalidOpcode(_))
        ));
        assert_eq!(
            Request::decode(b"4"),
            Err(ProtocolError::MissingField("path"))
        );
        assert_eq!(
            Request::decode(&payload(&[b"3", b"/a"])),
            Err(ProtocolError::MissingField("content"))
        );
        assert_eq!(
            Request::decode(&payload(&[b"1", b"/a", b"-1"])),
            Err(ProtocolError::InvalidNumber("flags"))
        );
        assert_eq!(
            Request::decode(&payload(&[b"4", b"/a", b"extra"])),
            Err(ProtocolError::TrailingField("path"))
        );
        assert_eq!(
            Request::decode(&payload(&[b"4", b""])),
            Err(ProtocolError::InvalidName)
        );
    }

    #[test]
    fn test_decode_name_too_long() {
        let long = vec![b'a'; MAX_NAME_LEN + 1];
        let err = Request::decode(&payload(&[b"4", &long[..]])).unwrap_err();
        assert_eq!(err, ProtocolError::NameTooLong(MAX_NAME_LEN + 1));
        assert_eq!(err.status(), Status::NameTooLong);
        assert_eq!(ProtocolError::Empty.status(), Status::Unknown);

        let exact = vec![b'a'; MAX_NAME_LEN];
        assert!(Request::decode(&payload(&[b"4", &exact[..]])).is_ok());
    }

    #[test]
    fn test_encode_matches_decode() {
        let requests = [
            Request::CloseConnection,
            Request::Open {
                path: "/x".into(),
                flags: OpenFlags::LOCK,
            },
            Request::Append {
                path: "/x".into(),
                content: b"\x01\x01".to_vec(),
            },
            Request::ReadN { count: 12 },
            Request::WriteNoContent { path: "/x".into() },
        ];
        for req in requests {
            assert_eq!(Request::decode(&req.encode()).unwrap(), req);
        }
    }

    #[test]
    fn test_response_files_and_content() {
        let resp = Response::with_files(vec![
            ("/a".to_string(), b"one".to_vec()),
            ("/b".to_string(), Vec::new()),
        ]);
        let decoded = Response::decode(&resp.encode()).unwrap();
        assert!(decoded.is_success());
        assert_eq!(
            decoded.files(),
            vec![("/a".to_string(), b"one".to_vec()), ("/b".to_string(), vec![])]
        );

        let read = Response::with_content(b"a\x01b".to_vec());
        assert_eq!(Response::decode(&read.encode()).unwrap().content(), b"a\x01b");

        let bare = Response::decode(b"0").unwrap();
        assert!(bare.fields.is_empty());
        assert!(bare.content().is_empty());
    }

    #[test]
    fn test_response_status_codes() {
        assert_eq!(Response::error(Status::Locked).encode(), b"7");
        assert_eq!(
            Response::decode(b"8").unwrap().status,
            Status::OutOfMemory
        );
        assert!(matches!(
            Response::decode(b"9"),
            Err(ProtocolError::InvalidStatus(_))
        ));
    }

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags::from_bits_truncate(0xff);
        assert!(flags.contains(OpenFlags::CREATE));
        assert!(flags.contains(OpenFlags::LOCK));
        assert_eq!(flags.bits(), 3);
        assert!(!OpenFlags::NONE.contains(OpenFlags::LOCK));
        assert!(OpenFlags::CREATE.contains(OpenFlags::NONE));
    }
}
