//! gRPC wire framing and trailer helpers.
//!
//! Each logical message on the wire is prefixed by one compression octet
//! (always 0 here) followed by a big-endian u32 length. Responses surface
//! their status as the `grpc-status` / `grpc-message` trailer pair.

use serde::Serialize;

use crate::error::Result;

/// Length of the compression-flag + length prefix on every message.
pub const FRAME_PREFIX_LEN: usize = 5;

/// Payload encodings, echoed into the `content-type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Encoding {
    /// Caller-serialized protobuf bytes
    #[default]
    Proto,
    /// JSON bytes (see [`json_payload`])
    Json,
}

impl Encoding {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Proto => "application/grpc+proto",
            Self::Json => "application/grpc+json",
        }
    }
}

/// Frame a payload for the wire: compression flag + big-endian length + octets.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_PREFIX_LEN + payload.len());
    out.push(0); // compress flag: uncompressed
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Strip the five-octet prefix from a response body.
///
/// Bodies shorter than the prefix decode to an empty payload; an empty
/// payload is still a valid delivery, distinct from a receive timeout.
pub fn strip_frame(body: &[u8]) -> Vec<u8> {
    if body.len() < FRAME_PREFIX_LEN {
        return Vec::new();
    }
    body[FRAME_PREFIX_LEN..].to_vec()
}

/// Serialize a value into a JSON payload for [`Encoding::Json`] requests.
pub fn json_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// gRPC status codes (<https://grpc.github.io/grpc/core/md_doc_statuscodes.html>).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GrpcStatus {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl GrpcStatus {
    /// Parse a status code from an integer value.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ok,
            1 => Self::Cancelled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for GrpcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            Self::DeadlineExceeded => write!(f, "DEADLINE_EXCEEDED"),
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::AlreadyExists => write!(f, "ALREADY_EXISTS"),
            Self::PermissionDenied => write!(f, "PERMISSION_DENIED"),
            Self::ResourceExhausted => write!(f, "RESOURCE_EXHAUSTED"),
            Self::FailedPrecondition => write!(f, "FAILED_PRECONDITION"),
            Self::Aborted => write!(f, "ABORTED"),
            Self::OutOfRange => write!(f, "OUT_OF_RANGE"),
            Self::Unimplemented => write!(f, "UNIMPLEMENTED"),
            Self::Internal => write!(f, "INTERNAL"),
            Self::Unavailable => write!(f, "UNAVAILABLE"),
            Self::DataLoss => write!(f, "DATA_LOSS"),
            Self::Unauthenticated => write!(f, "UNAUTHENTICATED"),
        }
    }
}

/// The trailer pair surfaced to callers at end-of-stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailers {
    /// `grpc-status`, `"0"` when absent
    pub status: String,
    /// `grpc-message`, `""` when absent
    pub message: String,
}

impl Trailers {
    /// Extract `grpc-status` / `grpc-message` from response headers,
    /// defaulting to `"0"` / `""`.
    pub fn from_headers(headers: &[(String, String)]) -> Self {
        let find = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        };
        Self {
            status: find("grpc-status").unwrap_or_else(|| "0".to_string()),
            message: find("grpc-message").unwrap_or_default(),
        }
    }

    /// Trailers synthesized when a receive deadline expires.
    pub fn deadline_exceeded() -> Self {
        Self {
            status: (GrpcStatus::DeadlineExceeded as u8).to_string(),
            message: GrpcStatus::DeadlineExceeded.to_string(),
        }
    }

    /// Parsed status code; unparseable values map to `Unknown`.
    pub fn grpc_status(&self) -> GrpcStatus {
        self.status
            .parse::<u8>()
            .map(GrpcStatus::from_u8)
            .unwrap_or(GrpcStatus::Unknown)
    }

    pub fn is_ok(&self) -> bool {
        self.grpc_status() == GrpcStatus::Ok
    }
}
