//! Status codes shared by every layer of the transfer engine.
//!
//! The data path is exception-free: protocol operations, socket calls and
//! state handlers all return an `ErrorCode` (or carry one in their stats)
//! instead of unwinding. `anyhow` is reserved for setup-time failures.

use serde::Serialize;

/// Outcome of a transfer-engine operation. Also travels on the wire as a
/// single byte (transfer status in FILE/DONE frames, remote error in ABORT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0,
    Error,
    Abort,
    ConnError,
    SocketReadError,
    SocketWriteError,
    ByteSourceReadError,
    FileWriteError,
    MemoryAllocationError,
    ProtocolError,
    VersionMismatch,
    InvalidRequest,
    NoProgress,
    VersionIncompatible,
    Timeout,
    InvalidCheckpoint,
    GlobalCheckpointAbort,
}

impl ErrorCode {
    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }

    /// Decode a status byte read off the wire. Unknown bytes map to `Error`
    /// rather than failing the whole frame; callers that need strictness
    /// (e.g. the ABORT handler) compare against specific variants.
    pub fn from_wire(byte: u8) -> ErrorCode {
        match byte {
            0 => ErrorCode::Ok,
            1 => ErrorCode::Error,
            2 => ErrorCode::Abort,
            3 => ErrorCode::ConnError,
            4 => ErrorCode::SocketReadError,
            5 => ErrorCode::SocketWriteError,
            6 => ErrorCode::ByteSourceReadError,
            7 => ErrorCode::FileWriteError,
            8 => ErrorCode::MemoryAllocationError,
            9 => ErrorCode::ProtocolError,
            10 => ErrorCode::VersionMismatch,
            11 => ErrorCode::InvalidRequest,
            12 => ErrorCode::NoProgress,
            13 => ErrorCode::VersionIncompatible,
            14 => ErrorCode::Timeout,
            15 => ErrorCode::InvalidCheckpoint,
            16 => ErrorCode::GlobalCheckpointAbort,
            _ => ErrorCode::Error,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::Ok => "OK",
            ErrorCode::Error => "ERROR",
            ErrorCode::Abort => "ABORT",
            ErrorCode::ConnError => "CONN_ERROR",
            ErrorCode::SocketReadError => "SOCKET_READ_ERROR",
            ErrorCode::SocketWriteError => "SOCKET_WRITE_ERROR",
            ErrorCode::ByteSourceReadError => "BYTE_SOURCE_READ_ERROR",
            ErrorCode::FileWriteError => "FILE_WRITE_ERROR",
            ErrorCode::MemoryAllocationError => "MEMORY_ALLOCATION_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::VersionMismatch => "VERSION_MISMATCH",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::NoProgress => "NO_PROGRESS",
            ErrorCode::VersionIncompatible => "VERSION_INCOMPATIBLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InvalidCheckpoint => "INVALID_CHECKPOINT",
            ErrorCode::GlobalCheckpointAbort => "GLOBAL_CHECKPOINT_ABORT",
        };
        f.write_str(s)
    }
}
