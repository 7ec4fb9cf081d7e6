//! Error codes and error types.

use core::fmt;

/// RPC status codes, aligned with gRPC numbering for familiarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    Cancelled = 1,
    DeadlineExceeded = 2,
    InvalidArgument = 3,
    NotFound = 4,
    AlreadyExists = 5,
    PermissionDenied = 6,
    ResourceExhausted = 7,
    FailedPrecondition = 8,
    Aborted = 9,
    OutOfRange = 10,
    Unimplemented = 11,
    Internal = 12,
    Unavailable = 13,
    DataLoss = 14,
}

impl ErrorCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Cancelled),
            2 => Some(Self::DeadlineExceeded),
            3 => Some(Self::InvalidArgument),
            4 => Some(Self::NotFound),
            5 => Some(Self::AlreadyExists),
            6 => Some(Self::PermissionDenied),
            7 => Some(Self::ResourceExhausted),
            8 => Some(Self::FailedPrecondition),
            9 => Some(Self::Aborted),
            10 => Some(Self::OutOfRange),
            11 => Some(Self::Unimplemented),
            12 => Some(Self::Internal),
            13 => Some(Self::Unavailable),
            14 => Some(Self::DataLoss),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::FailedPrecondition => write!(f, "failed precondition"),
            Self::Aborted => write!(f, "aborted"),
            Self::OutOfRange => write!(f, "out of range"),
            Self::Unimplemented => write!(f, "unimplemented"),
            Self::Internal => write!(f, "internal error"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::DataLoss => write!(f, "data loss"),
        }
    }
}

/// Malformed frames received from a byte-stream transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Length prefix smaller than a descriptor.
    TooShort { len: u32 },
    /// Payload length above the transport's hard cap.
    PayloadTooLarge { len: u32, max: u32 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len } => write!(f, "frame too short: {len} bytes"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload {len} bytes exceeds max {max}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    Closed,
    Io(std::io::Error),
    Frame(FrameError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Frame(e) => write!(f, "frame error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Frame(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<FrameError> for TransportError {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

/// High-level RPC errors.
#[derive(Debug)]
pub enum RpcError {
    Transport(TransportError),
    Status { code: ErrorCode, message: String },
    Cancelled,
    DeadlineExceeded,
    Serialize(postcard::Error),
    Deserialize(postcard::Error),
}

impl RpcError {
    /// The status code and message this error carries on the wire.
    pub fn wire_status(&self) -> (ErrorCode, String) {
        match self {
            Self::Status { code, message } => (*code, message.clone()),
            Self::Transport(_) => (ErrorCode::Internal, "transport error".into()),
            Self::Cancelled => (ErrorCode::Cancelled, "cancelled".into()),
            Self::DeadlineExceeded => (ErrorCode::DeadlineExceeded, "deadline exceeded".into()),
            Self::Serialize(e) => (ErrorCode::Internal, format!("serialize error: {e}")),
            Self::Deserialize(e) => (ErrorCode::Internal, format!("deserialize error: {e}")),
        }
    }

    /// The status code of this error, if it maps to one directly.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Status { code, .. } => Some(*code),
            Self::Cancelled => Some(ErrorCode::Cancelled),
            Self::DeadlineExceeded => Some(ErrorCode::DeadlineExceeded),
            _ => None,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Status { code, message } => write!(f, "{code}: {message}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::Serialize(e) => write!(f, "serialize error: {e}"),
            Self::Deserialize(e) => write!(f, "deserialize error: {e}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Serialize(e) => Some(e),
            Self::Deserialize(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Encode an error status for the wire: code, message length, message bytes,
/// all little-endian.
pub fn encode_error_payload(code: ErrorCode, message: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + message.len());
    bytes.extend_from_slice(&(code as u32).to_le_bytes());
    bytes.extend_from_slice(&(message.len() as u32).to_le_bytes());
    bytes.extend_from_slice(message.as_bytes());
    bytes
}

/// Parse an error status from a response payload.
///
/// Malformed payloads decode to `Internal` rather than failing, so a corrupt
/// error frame still surfaces as an error to the caller.
pub fn parse_error_payload(payload: &[u8]) -> RpcError {
    if payload.len() < 8 {
        return RpcError::Status {
            code: ErrorCode::Internal,
            message: "malformed error response".into(),
        };
    }

    let error_code = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let message_len = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;

    if payload.len() < 8 + message_len {
        return RpcError::Status {
            code: ErrorCode::Internal,
            message: "malformed error response".into(),
        };
    }

    let code = ErrorCode::from_u32(error_code).unwrap_or(ErrorCode::Internal);
    let message = String::from_utf8_lossy(&payload[8..8 + message_len]).into_owned();

    match code {
        ErrorCode::Cancelled => RpcError::Cancelled,
        ErrorCode::DeadlineExceeded => RpcError::DeadlineExceeded,
        code => RpcError::Status { code, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip() {
        for raw in 0..=14u32 {
            let code = ErrorCode::from_u32(raw).unwrap();
            assert_eq!(code as u32, raw);
        }
        assert!(ErrorCode::from_u32(15).is_none());
        assert!(ErrorCode::from_u32(u32::MAX).is_none());
    }

    #[test]
    fn error_payload_round_trips() {
        let payload = encode_error_payload(ErrorCode::NotFound, "no record for id");
        match parse_error_payload(&payload) {
            RpcError::Status { code, message } => {
                assert_eq!(code, ErrorCode::NotFound);
                assert_eq!(message, "no record for id");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cancelled_and_deadline_decode_to_their_variants() {
        let payload = encode_error_payload(ErrorCode::DeadlineExceeded, "deadline exceeded");
        assert!(matches!(
            parse_error_payload(&payload),
            RpcError::DeadlineExceeded
        ));

        let payload = encode_error_payload(ErrorCode::Cancelled, "cancelled");
        assert!(matches!(parse_error_payload(&payload), RpcError::Cancelled));
    }

    #[test]
    fn truncated_error_payload_is_internal() {
        let err = parse_error_payload(&[1, 2, 3]);
        match err {
            RpcError::Status { code, .. } => assert_eq!(code, ErrorCode::Internal),
            other => panic!("unexpected error: {other}"),
        }

        // Claimed message length longer than the buffer.
        let mut payload = encode_error_payload(ErrorCode::Internal, "boom");
        payload.truncate(10);
        match parse_error_payload(&payload) {
            RpcError::Status { code, .. } => assert_eq!(code, ErrorCode::Internal),
            other => panic!("unexpected error: {other}"),
        }
    }
}
