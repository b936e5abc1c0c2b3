//! Byte and block accounting, per thread and aggregated.
//!
//! "Effective" bytes are the ones the peer has acknowledged (or that a
//! checkpoint proved durable); raw counters include bytes that were written
//! but later had to be re-sent. The difference is what makes invariant
//! checking possible: for a successful transfer the effective data bytes of
//! all threads sum to the total size of the source tree.

use serde::Serialize;

use crate::error::ErrorCode;
use crate::transfer_request::EncryptionType;

#[derive(Debug, Clone, Serialize)]
pub struct TransferStats {
    header_bytes: i64,
    data_bytes: i64,
    effective_header_bytes: i64,
    effective_data_bytes: i64,
    num_blocks: i64,
    num_failed_attempts: i64,
    local_err: ErrorCode,
    remote_err: ErrorCode,
    encryption_type: EncryptionType,
}

impl Default for TransferStats {
    fn default() -> Self {
        TransferStats {
            header_bytes: 0,
            data_bytes: 0,
            effective_header_bytes: 0,
            effective_data_bytes: 0,
            num_blocks: 0,
            num_failed_attempts: 0,
            local_err: ErrorCode::Ok,
            remote_err: ErrorCode::Ok,
            encryption_type: EncryptionType::None,
        }
    }
}

impl TransferStats {
    pub fn new() -> TransferStats {
        TransferStats::default()
    }

    pub fn add_header_bytes(&mut self, bytes: i64) {
        self.header_bytes += bytes;
    }

    pub fn add_data_bytes(&mut self, bytes: i64) {
        self.data_bytes += bytes;
    }

    /// Count bytes as acknowledged/durable.
    pub fn add_effective_bytes(&mut self, header: i64, data: i64) {
        self.effective_header_bytes += header;
        self.effective_data_bytes += data;
    }

    /// Un-count bytes whose block is being returned to the queue for retry.
    pub fn subtract_effective_bytes(&mut self, header: i64, data: i64) {
        self.effective_header_bytes -= header;
        self.effective_data_bytes -= data;
    }

    pub fn incr_num_blocks(&mut self) {
        self.num_blocks += 1;
    }

    pub fn decr_num_blocks(&mut self) {
        self.num_blocks -= 1;
    }

    pub fn incr_failed_attempts(&mut self) {
        self.num_failed_attempts += 1;
    }

    pub fn set_local_error_code(&mut self, err: ErrorCode) {
        self.local_err = err;
    }

    pub fn set_remote_error_code(&mut self, err: ErrorCode) {
        self.remote_err = err;
    }

    pub fn set_encryption_type(&mut self, enc: EncryptionType) {
        self.encryption_type = enc;
    }

    pub fn local_error_code(&self) -> ErrorCode {
        self.local_err
    }

    pub fn remote_error_code(&self) -> ErrorCode {
        self.remote_err
    }

    /// First non-OK of local/remote, OK when both are clean.
    pub fn error_code(&self) -> ErrorCode {
        if !self.local_err.is_ok() {
            self.local_err
        } else {
            self.remote_err
        }
    }

    pub fn header_bytes(&self) -> i64 {
        self.header_bytes
    }

    pub fn data_bytes(&self) -> i64 {
        self.data_bytes
    }

    pub fn effective_data_bytes(&self) -> i64 {
        self.effective_data_bytes
    }

    pub fn effective_total_bytes(&self) -> i64 {
        self.effective_header_bytes + self.effective_data_bytes
    }

    pub fn num_blocks(&self) -> i64 {
        self.num_blocks
    }

    pub fn num_failed_attempts(&self) -> i64 {
        self.num_failed_attempts
    }

    pub fn encryption_type(&self) -> EncryptionType {
        self.encryption_type
    }

    /// Merge another thread's (or block's) counters into this one. Error
    /// codes stick to the first failure seen.
    pub fn combine(&mut self, other: &TransferStats) {
        self.header_bytes += other.header_bytes;
        self.data_bytes += other.data_bytes;
        self.effective_header_bytes += other.effective_header_bytes;
        self.effective_data_bytes += other.effective_data_bytes;
        self.num_blocks += other.num_blocks;
        self.num_failed_attempts += other.num_failed_attempts;
        if self.local_err.is_ok() {
            self.local_err = other.local_err;
        }
        if self.remote_err.is_ok() {
            self.remote_err = other.remote_err;
        }
    }
}

impl std::fmt::Display for TransferStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "blocks={} data={} effective={} failed_attempts={} local={} remote={}",
            self.num_blocks,
            self.data_bytes,
            self.effective_data_bytes,
            self.num_failed_attempts,
            self.local_err,
            self.remote_err
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_accumulates_and_keeps_first_error() {
        let mut a = TransferStats::new();
        a.add_data_bytes(100);
        a.add_effective_bytes(10, 100);
        a.incr_num_blocks();
        a.set_local_error_code(ErrorCode::SocketReadError);

        let mut b = TransferStats::new();
        b.add_data_bytes(50);
        b.add_effective_bytes(5, 50);
        b.incr_num_blocks();
        b.set_local_error_code(ErrorCode::NoProgress);

        a.combine(&b);
        assert_eq!(a.data_bytes(), 150);
        assert_eq!(a.effective_data_bytes(), 150);
        assert_eq!(a.num_blocks(), 2);
        assert_eq!(a.local_error_code(), ErrorCode::SocketReadError);
    }

    #[test]
    fn subtract_effective_reverts_acknowledgement() {
        let mut s = TransferStats::new();
        s.add_effective_bytes(10, 100);
        s.subtract_effective_bytes(10, 50);
        assert_eq!(s.effective_data_bytes(), 50);
        assert_eq!(s.effective_total_bytes(), 50);
    }
}
