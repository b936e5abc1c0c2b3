//! Byte sources: sender-side handles to one block of one file.
//!
//! A source covers the byte range `[offset, offset + size)` of a file and
//! yields it chunk by chunk into an internal buffer. Reads tolerate short
//! chunks (the final chunk of a block is usually smaller than the buffer);
//! an early EOF means the file shrank under us and is reported as a
//! byte-source read error so the block can be failed cleanly.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::ErrorCode;
use crate::protocol::FileAllocationStatus;

/// Immutable per-file facts shared by all blocks of the file.
#[derive(Debug, Clone)]
pub struct SourceMetaData {
    pub full_path: PathBuf,
    /// Path relative to the transfer root, as sent on the wire.
    pub rel_path: String,
    pub seq_id: i64,
    /// Size of the whole file.
    pub size: i64,
    pub allocation_status: FileAllocationStatus,
    /// Seq-id from a previous transfer when resuming with a size mismatch.
    pub prev_seq_id: i64,
}

pub trait ByteSource: Send {
    /// Short name for logs.
    fn identifier(&self) -> &str;

    fn metadata(&self) -> &SourceMetaData;

    /// Bytes this block will produce.
    fn size(&self) -> i64;

    /// Offset of the block within the file.
    fn offset(&self) -> i64;

    /// Open (or reopen) for reading from the current offset. `buffer_size`
    /// bounds chunk size.
    fn open(&mut self, buffer_size: usize) -> ErrorCode;

    /// Next chunk. Empty only at end of block or after an error.
    fn read(&mut self) -> &[u8];

    fn finished(&self) -> bool;

    fn has_error(&self) -> bool;

    /// Shrink the block from the front, used when a checkpoint proves the
    /// receiver already holds the first `bytes` of it. Only valid while
    /// closed.
    fn advance_offset(&mut self, bytes: i64);

    fn close(&mut self);
}

pub struct FileByteSource {
    metadata: Arc<SourceMetaData>,
    size: i64,
    offset: i64,
    bytes_read: i64,
    file: Option<File>,
    buffer: Vec<u8>,
    err: ErrorCode,
}

impl FileByteSource {
    pub fn new(metadata: Arc<SourceMetaData>, size: i64, offset: i64) -> FileByteSource {
        FileByteSource {
            metadata,
            size,
            offset,
            bytes_read: 0,
            file: None,
            buffer: Vec::new(),
            err: ErrorCode::Ok,
        }
    }
}

impl ByteSource for FileByteSource {
    fn identifier(&self) -> &str {
        &self.metadata.rel_path
    }

    fn metadata(&self) -> &SourceMetaData {
        &self.metadata
    }

    fn size(&self) -> i64 {
        self.size
    }

    fn offset(&self) -> i64 {
        self.offset
    }

    fn open(&mut self, buffer_size: usize) -> ErrorCode {
        self.close();
        self.bytes_read = 0;
        self.err = ErrorCode::Ok;
        if self.buffer.len() != buffer_size {
            self.buffer = vec![0u8; buffer_size];
        }
        let mut file = match File::open(&self.metadata.full_path) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(path = %self.metadata.full_path.display(), error = %e,
                    "failed to open byte source");
                self.err = ErrorCode::ByteSourceReadError;
                return self.err;
            }
        };
        if let Err(e) = file.seek(SeekFrom::Start(self.offset as u64)) {
            tracing::error!(path = %self.metadata.full_path.display(), error = %e,
                "failed to seek byte source");
            self.err = ErrorCode::ByteSourceReadError;
            return self.err;
        }
        self.file = Some(file);
        ErrorCode::Ok
    }

    fn read(&mut self) -> &[u8] {
        if self.err != ErrorCode::Ok || self.bytes_read >= self.size {
            return &[];
        }
        let file = match self.file.as_mut() {
            Some(f) => f,
            None => {
                self.err = ErrorCode::ByteSourceReadError;
                return &[];
            }
        };
        let want = std::cmp::min(self.buffer.len() as i64, self.size - self.bytes_read) as usize;
        match file.read(&mut self.buffer[..want]) {
            Ok(0) => {
                // File shrank while we were sending it.
                tracing::error!(path = %self.metadata.full_path.display(),
                    expected = self.size, read = self.bytes_read,
                    "unexpected EOF in byte source");
                self.err = ErrorCode::ByteSourceReadError;
                &[]
            }
            Ok(n) => {
                self.bytes_read += n as i64;
                &self.buffer[..n]
            }
            Err(e) => {
                tracing::error!(path = %self.metadata.full_path.display(), error = %e,
                    "byte source read failed");
                self.err = ErrorCode::ByteSourceReadError;
                &[]
            }
        }
    }

    fn finished(&self) -> bool {
        self.err != ErrorCode::Ok || self.bytes_read >= self.size
    }

    fn has_error(&self) -> bool {
        self.err != ErrorCode::Ok
    }

    fn advance_offset(&mut self, bytes: i64) {
        debug_assert!(self.file.is_none());
        self.offset += bytes;
        self.size -= bytes;
    }

    fn close(&mut self) {
        self.file = None;
    }
}
