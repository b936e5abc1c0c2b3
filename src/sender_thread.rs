//! Per-connection sender state machine.
//!
//! Each thread owns one socket to one receiver port and drives it from
//! CONNECT to END. Handlers return the next state; there is no hidden
//! control flow. Threads interact only through the coordinator (abort word,
//! barriers, funnels), the shared directory queue and the transfer-history
//! registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crc::{Crc, CRC_32_ISCSI};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::coordinator::{
    FunnelStatus, NegotiationStatus, ThreadsController, VERSION_MISMATCH_BARRIER,
    VERSION_MISMATCH_FUNNEL,
};
use crate::error::ErrorCode;
use crate::history::{CheckpointResult, ThreadTransferHistory, TransferHistoryController};
use crate::options::WdtOptions;
use crate::protocol::{self, cmd, BlockDetails, FileChunksInfo};
use crate::sender::SenderShared;
use crate::socket::{AbortChecker, ClientSocket, SocketCreator};
use crate::source::ByteSource;
use crate::stats::TransferStats;

/// States of the per-connection machine. `End` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Connect,
    ReadLocalCheckpoint,
    SendSettings,
    SendBlocks,
    SendDoneCmd,
    SendSizeCmd,
    CheckForAbort,
    ReadFileChunks,
    ReadReceiverCmd,
    ProcessDoneCmd,
    ProcessWaitCmd,
    ProcessErrCmd,
    ProcessAbortCmd,
    ProcessVersionMismatch,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FooterType {
    NoFooter,
    Checksum,
    EncTag,
}

/// Abort view of one thread: the transfer-wide abort word plus this
/// thread's global-checkpoint flag.
pub struct ThreadAbortChecker {
    controller: Arc<ThreadsController>,
    history: Arc<ThreadTransferHistory>,
}

impl AbortChecker for ThreadAbortChecker {
    fn should_abort(&self) -> bool {
        !self.controller.abort_code().is_ok() || self.history.is_global_checkpoint_received()
    }
}

pub struct SenderThread {
    shared: Arc<SenderShared>,
    controller: Arc<ThreadsController>,
    history_controller: Arc<TransferHistoryController>,
    history: Arc<ThreadTransferHistory>,
    socket_creator: Arc<dyn SocketCreator>,
    abort_checker: Arc<ThreadAbortChecker>,
    stats: Arc<Mutex<TransferStats>>,
    thread_index: usize,
    port: i32,
    socket: Option<Box<dyn ClientSocket>>,
    buf: Vec<u8>,
    thread_protocol_version: i32,
    negotiated_protocol: i32,
    footer_type: FooterType,
    total_size_sent: bool,
    num_reconnect_without_progress: i32,
}

impl SenderThread {
    pub fn new(
        shared: Arc<SenderShared>,
        controller: Arc<ThreadsController>,
        history_controller: Arc<TransferHistoryController>,
        history: Arc<ThreadTransferHistory>,
        socket_creator: Arc<dyn SocketCreator>,
        stats: Arc<Mutex<TransferStats>>,
        thread_index: usize,
        port: i32,
    ) -> SenderThread {
        let abort_checker = Arc::new(ThreadAbortChecker {
            controller: Arc::clone(&controller),
            history: Arc::clone(&history),
        });
        let thread_protocol_version = shared.protocol_version();
        SenderThread {
            shared,
            controller,
            history_controller,
            history,
            socket_creator,
            abort_checker,
            stats,
            thread_index,
            port,
            socket: None,
            buf: Vec::with_capacity(protocol::MIN_BUF_LENGTH),
            thread_protocol_version,
            negotiated_protocol: 0,
            footer_type: FooterType::NoFooter,
            total_size_sent: false,
            num_reconnect_without_progress: 0,
        }
    }

    fn options(&self) -> &WdtOptions {
        &self.shared.options
    }

    /// Drive the connection to END, then deregister from the coordinator.
    pub fn run(&mut self) {
        let start_time = Instant::now();
        self.set_footer_type();
        let shared = Arc::clone(&self.shared);
        self.controller.execute_at_start(|| shared.start_new_transfer());

        let mut state = SenderState::Connect;
        while state != SenderState::End {
            let abort_code = self.thread_abort_code();
            if !abort_code.is_ok() {
                error!(port = self.port, code = %abort_code, "transfer aborted");
                self.stats.lock().set_local_error_code(ErrorCode::Abort);
                if abort_code == ErrorCode::VersionMismatch {
                    state = SenderState::ProcessVersionMismatch;
                } else {
                    break;
                }
            }
            debug!(port = self.port, ?state, "state transition");
            state = match state {
                SenderState::Connect => self.connect(),
                SenderState::ReadLocalCheckpoint => self.read_local_checkpoint(),
                SenderState::SendSettings => self.send_settings(),
                SenderState::SendBlocks => self.send_blocks(),
                SenderState::SendDoneCmd => self.send_done_cmd(),
                SenderState::SendSizeCmd => self.send_size_cmd(),
                SenderState::CheckForAbort => self.check_for_abort(),
                SenderState::ReadFileChunks => self.read_file_chunks(),
                SenderState::ReadReceiverCmd => self.read_receiver_cmd(),
                SenderState::ProcessDoneCmd => self.process_done_cmd(),
                SenderState::ProcessWaitCmd => self.process_wait_cmd(),
                SenderState::ProcessErrCmd => self.process_err_cmd(),
                SenderState::ProcessAbortCmd => self.process_abort_cmd(),
                SenderState::ProcessVersionMismatch => self.process_version_mismatch(),
                SenderState::End => SenderState::End,
            };
        }

        let encryption_type = self
            .socket
            .as_ref()
            .map(|s| s.encryption_type())
            .unwrap_or(crate::transfer_request::EncryptionType::None);
        {
            let mut stats = self.stats.lock();
            stats.set_encryption_type(encryption_type);
            let secs = start_time.elapsed().as_secs_f64().max(f64::EPSILON);
            let mbytes = stats.effective_total_bytes() as f64 / (1024.0 * 1024.0);
            info!(port = self.port, %stats, throughput_mbytes_per_sec = mbytes / secs,
                "sender thread done");
        }
        self.socket = None;
        let shared = Arc::clone(&self.shared);
        self.controller.de_register_thread(|| shared.end_cur_transfer());
    }

    pub fn negotiated_protocol(&self) -> i32 {
        self.negotiated_protocol
    }

    // -- helpers ------------------------------------------------------------

    fn thread_abort_code(&self) -> ErrorCode {
        let code = self.controller.abort_code();
        if !code.is_ok() {
            return code;
        }
        if self.history.is_global_checkpoint_received() {
            return ErrorCode::GlobalCheckpointAbort;
        }
        ErrorCode::Ok
    }

    fn set_footer_type(&mut self) {
        let version = self.shared.protocol_version();
        let enc_type = self.shared.encryption.enc_type;
        self.footer_type = if version >= protocol::INCREMENTAL_TAG_VERIFICATION_VERSION
            && enc_type.tag_len() > 0
        {
            FooterType::EncTag
        } else if version >= protocol::CHECKSUM_VERSION && self.options().enable_checksum {
            FooterType::Checksum
        } else {
            FooterType::NoFooter
        };
    }

    fn reset(&mut self) {
        self.total_size_sent = false;
        self.stats.lock().set_local_error_code(ErrorCode::Ok);
    }

    /// Back-off sleep sliced into abort-check intervals so an abort cancels
    /// the wait promptly.
    fn interruptible_sleep(&self, millis: u64) {
        let interval = self.options().abort_check_interval_millis.max(1);
        let mut remaining = millis;
        while remaining > 0 {
            if !self.thread_abort_code().is_ok() {
                return;
            }
            let chunk = remaining.min(interval);
            std::thread::sleep(Duration::from_millis(chunk));
            remaining -= chunk;
        }
    }

    /// Write the scratch buffer fully or report a write error.
    fn write_buf(&mut self) -> Result<usize, ErrorCode> {
        let len = self.buf.len();
        let socket = match self.socket.as_mut() {
            Some(s) => s,
            None => return Err(ErrorCode::SocketWriteError),
        };
        match socket.write(&self.buf) {
            Ok(n) if n == len => Ok(n),
            Ok(n) => {
                error!(port = self.port, wrote = n, wanted = len, "socket write mismatch");
                Err(ErrorCode::SocketWriteError)
            }
            Err(e) => {
                error!(port = self.port, error = %e, "socket write failed");
                Err(ErrorCode::SocketWriteError)
            }
        }
    }

    /// Read exactly `len` bytes into the scratch buffer.
    fn read_exact_buf(&mut self, len: usize) -> Result<(), ErrorCode> {
        self.buf.clear();
        self.buf.resize(len, 0);
        let socket = match self.socket.as_mut() {
            Some(s) => s,
            None => return Err(ErrorCode::SocketReadError),
        };
        match socket.read(&mut self.buf[..]) {
            Ok(n) if n == len => Ok(()),
            Ok(n) => {
                error!(port = self.port, read = n, wanted = len, "socket read mismatch");
                Err(ErrorCode::SocketReadError)
            }
            Err(e) => {
                error!(port = self.port, error = %e, "socket read failed");
                Err(ErrorCode::SocketReadError)
            }
        }
    }

    /// Read one unsigned LEB128 value byte-at-a-time off the socket.
    fn read_varint_from_socket(&mut self) -> Result<u64, ErrorCode> {
        let socket = match self.socket.as_mut() {
            Some(s) => s,
            None => return Err(ErrorCode::SocketReadError),
        };
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let mut byte = [0u8; 1];
            match socket.read(&mut byte) {
                Ok(1) => {}
                _ => return Err(ErrorCode::SocketReadError),
            }
            if shift >= 64 {
                return Err(ErrorCode::ProtocolError);
            }
            value |= u64::from(byte[0] & 0x7F) << shift;
            if byte[0] & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    // -- states -------------------------------------------------------------

    fn connect(&mut self) -> SenderState {
        debug!(port = self.port, "entered CONNECT state");
        if let Some(socket) = self.socket.as_mut() {
            let err = socket.non_retryable_err_code();
            if !err.is_ok() {
                error!(port = self.port, %err, "socket has non-retryable error");
                self.stats.lock().set_local_error_code(err);
                return SenderState::End;
            }
            socket.close();
        }
        if self.num_reconnect_without_progress >= self.options().max_transfer_retries {
            error!(
                port = self.port,
                reconnects = self.num_reconnect_without_progress,
                "reconnected repeatedly without progress, giving up"
            );
            self.stats.lock().set_local_error_code(ErrorCode::NoProgress);
            return SenderState::End;
        }
        self.socket = None;
        let code = self.connect_to_receiver();
        if code == ErrorCode::Abort {
            self.stats.lock().set_local_error_code(ErrorCode::Abort);
            if self.thread_abort_code() == ErrorCode::VersionMismatch {
                return SenderState::ProcessVersionMismatch;
            }
            return SenderState::End;
        }
        if !code.is_ok() {
            self.stats.lock().set_local_error_code(code);
            return SenderState::End;
        }
        // A prior error on this thread means the receiver buffered a
        // checkpoint for us; read it before anything else.
        let next = if self.stats.lock().local_error_code().is_ok() {
            SenderState::SendSettings
        } else {
            SenderState::ReadLocalCheckpoint
        };
        self.reset();
        next
    }

    fn connect_to_receiver(&mut self) -> ErrorCode {
        let start = Instant::now();
        let mut socket = self.socket_creator.make_socket(
            &self.shared.dest_host,
            self.port,
            self.options(),
            &self.shared.encryption,
            Arc::clone(&self.abort_checker) as Arc<dyn AbortChecker>,
        );
        let mut max_retries = self.options().max_retries;
        if max_retries < 1 {
            error!(max_retries, "invalid max_retries, using 1 instead");
            max_retries = 1;
        }
        let mut err = ErrorCode::Error;
        let mut attempts = 0;
        for i in 1..=max_retries {
            attempts += 1;
            err = socket.connect();
            if err.is_ok() {
                break;
            }
            if err == ErrorCode::ConnError {
                return ErrorCode::ConnError;
            }
            if !self.thread_abort_code().is_ok() {
                return ErrorCode::Abort;
            }
            if i != max_retries {
                debug!(port = self.port, attempt = i, "sleeping after failed connect");
                self.interruptible_sleep(self.options().sleep_millis);
            }
        }
        let elapsed = start.elapsed();
        if !err.is_ok() {
            error!(
                host = %self.shared.dest_host,
                port = self.port,
                attempts,
                elapsed_secs = elapsed.as_secs_f64(),
                "unable to connect despite retries"
            );
            return ErrorCode::ConnError;
        }
        if attempts > 1 {
            warn!(port = self.port, attempts, elapsed_secs = elapsed.as_secs_f64(),
                "connected after retries");
        } else {
            info!(port = self.port, elapsed_secs = elapsed.as_secs_f64(), "connected");
        }
        self.socket = Some(socket);
        ErrorCode::Ok
    }

    fn read_local_checkpoint(&mut self) -> SenderState {
        info!(port = self.port, "entered READ_LOCAL_CHECKPOINT state");
        let checkpoint_len = protocol::max_local_checkpoint_len(self.thread_protocol_version);
        if self.read_exact_buf(checkpoint_len).is_err() {
            self.stats
                .lock()
                .set_local_error_code(ErrorCode::SocketReadError);
            self.num_reconnect_without_progress += 1;
            return SenderState::Connect;
        }
        let mut off = 0;
        let checkpoints =
            protocol::decode_checkpoints(self.thread_protocol_version, &self.buf, &mut off);
        let checkpoint = match checkpoints.as_deref() {
            Some([cp]) if cp.port == self.port => *cp,
            _ => {
                error!(port = self.port, "illegal local checkpoint");
                self.stats
                    .lock()
                    .set_local_error_code(ErrorCode::ProtocolError);
                return SenderState::End;
            }
        };
        debug!(port = self.port, ?checkpoint, "received local checkpoint");
        if checkpoint.num_blocks == -1 {
            // Receiver failed while acking our DONE; the reply is buffered.
            return SenderState::ReadReceiverCmd;
        }
        match self.history.set_local_checkpoint(checkpoint) {
            CheckpointResult::InvalidCheckpoint => {
                self.stats
                    .lock()
                    .set_local_error_code(ErrorCode::ProtocolError);
                SenderState::End
            }
            CheckpointResult::NoProgress => {
                self.num_reconnect_without_progress += 1;
                SenderState::SendSettings
            }
            CheckpointResult::Ok => {
                self.num_reconnect_without_progress = 0;
                SenderState::SendSettings
            }
        }
    }

    fn send_settings(&mut self) -> SenderState {
        debug!(port = self.port, "entered SEND_SETTINGS state");
        let send_file_chunks = self.shared.is_send_file_chunks();
        let settings = protocol::Settings {
            read_timeout_millis: self.options().read_timeout_millis,
            write_timeout_millis: self.options().write_timeout_millis,
            transfer_id: self.shared.transfer_id.clone(),
            enable_checksum: self.footer_type == FooterType::Checksum,
            send_file_chunks,
            block_mode_disabled: self.options().block_size_mbytes <= 0,
        };
        self.buf.clear();
        self.buf.push(cmd::SETTINGS);
        protocol::encode_settings(self.thread_protocol_version, &mut self.buf, &settings);
        if send_file_chunks {
            protocol::pad_to(&mut self.buf, protocol::MIN_BUF_LENGTH);
        }
        match self.write_buf() {
            Ok(written) => {
                self.stats.lock().add_header_bytes(written as i64);
                if send_file_chunks {
                    SenderState::ReadFileChunks
                } else {
                    SenderState::SendBlocks
                }
            }
            Err(err) => {
                self.stats.lock().set_local_error_code(err);
                SenderState::Connect
            }
        }
    }

    fn send_blocks(&mut self) -> SenderState {
        debug!(port = self.port, "entered SEND_BLOCKS state");
        if self.thread_protocol_version >= protocol::RECEIVER_PROGRESS_REPORT_VERSION
            && !self.total_size_sent
            && self.shared.dir_queue.file_discovery_finished()
        {
            return SenderState::SendSizeCmd;
        }
        let (source, transfer_status) = self
            .shared
            .dir_queue
            .get_next_source(self.options().buffer_size, &*self.abort_checker);
        let mut source = match source {
            Some(s) => s,
            None => return SenderState::SendDoneCmd,
        };
        let block_stats = self.send_one_byte_source(&mut *source, transfer_status);
        source.close();
        let block_err = block_stats.local_error_code();
        let counted = block_err.is_ok();
        let effective_header = block_stats.header_bytes();
        let effective_data = block_stats.data_bytes();
        self.stats.lock().combine(&block_stats);
        let recorded = self.history.add_source(
            source,
            if counted { effective_header } else { 0 },
            if counted { effective_data } else { 0 },
            counted,
        );
        if !recorded {
            error!(port = self.port, "global checkpoint received, stopping dispatch");
            self.stats.lock().set_local_error_code(ErrorCode::ConnError);
            return SenderState::End;
        }
        if !block_err.is_ok() {
            return SenderState::CheckForAbort;
        }
        SenderState::SendBlocks
    }

    fn send_one_byte_source(
        &mut self,
        source: &mut dyn ByteSource,
        transfer_status: ErrorCode,
    ) -> TransferStats {
        let mut stats = TransferStats::new();
        let metadata = source.metadata();
        let details = BlockDetails {
            file_name: metadata.rel_path.clone(),
            seq_id: metadata.seq_id,
            file_size: metadata.size,
            offset: source.offset(),
            data_size: source.size(),
            allocation_status: metadata.allocation_status,
            prev_seq_id: metadata.prev_seq_id,
        };
        self.buf.clear();
        self.buf.push(cmd::FILE);
        self.buf.push(transfer_status.to_wire());
        self.buf.extend_from_slice(&[0u8; 2]);
        let payload_start = self.buf.len();
        protocol::encode_header(self.thread_protocol_version, &mut self.buf, &details);
        let payload_len = (self.buf.len() - payload_start) as u16;
        self.buf[payload_start - 2..payload_start].copy_from_slice(&payload_len.to_le_bytes());
        let header_len = self.buf.len() as i64;
        if self.write_buf().is_err() {
            stats.set_local_error_code(ErrorCode::SocketWriteError);
            stats.incr_failed_attempts();
            return stats;
        }
        stats.add_header_bytes(header_len);

        let expected_size = source.size();
        let mut actual_size: i64 = 0;
        let crc32c = Crc::<u32>::new(&CRC_32_ISCSI);
        let mut digest = crc32c.digest();
        // The first throttler charge includes the header bytes.
        let mut throttler_bytes = header_len;
        while !source.finished() {
            let chunk_result: Result<usize, ErrorCode> = {
                let chunk = source.read();
                if chunk.is_empty() {
                    Err(ErrorCode::ByteSourceReadError)
                } else {
                    if self.footer_type == FooterType::Checksum {
                        digest.update(chunk);
                    }
                    if let Some(throttler) = self.shared.throttler.as_ref() {
                        throttler_bytes += chunk.len() as i64;
                        throttler.limit(throttler_bytes);
                        throttler_bytes = 0;
                    }
                    match self.socket.as_mut() {
                        Some(socket) => match socket.write(chunk) {
                            Ok(n) if n == chunk.len() => Ok(n),
                            _ => Err(ErrorCode::SocketWriteError),
                        },
                        None => Err(ErrorCode::SocketWriteError),
                    }
                }
            };
            if !self.thread_abort_code().is_ok() {
                error!(port = self.port, source = source.identifier(),
                    "transfer aborted during block transfer");
                stats.set_local_error_code(ErrorCode::Abort);
                stats.incr_failed_attempts();
                return stats;
            }
            match chunk_result {
                Ok(written) => {
                    stats.add_data_bytes(written as i64);
                    actual_size += written as i64;
                }
                Err(ErrorCode::ByteSourceReadError) => break,
                Err(err) => {
                    error!(port = self.port, source = source.identifier(), %err,
                        "write error during block transfer");
                    stats.set_local_error_code(err);
                    stats.incr_failed_attempts();
                    return stats;
                }
            }
        }
        if actual_size != expected_size {
            let current_size = std::fs::metadata(&source.metadata().full_path)
                .map(|md| md.len() as i64)
                .unwrap_or(-1);
            error!(
                source = source.identifier(),
                expected = expected_size,
                actual = actual_size,
                current_size,
                "file changed while being sent"
            );
            stats.set_local_error_code(ErrorCode::ByteSourceReadError);
            stats.incr_failed_attempts();
            return stats;
        }
        if self.footer_type != FooterType::NoFooter {
            self.buf.clear();
            self.buf.push(cmd::FOOTER);
            match self.footer_type {
                FooterType::Checksum => {
                    protocol::encode_footer_checksum(&mut self.buf, digest.finalize());
                }
                FooterType::EncTag => {
                    let tag = match self.socket.as_mut() {
                        Some(socket) => socket.compute_cur_encryption_tag(),
                        None => Vec::new(),
                    };
                    protocol::encode_footer_tag(&mut self.buf, &tag);
                }
                FooterType::NoFooter => {}
            }
            let footer_len = self.buf.len() as i64;
            if self.write_buf().is_err() {
                stats.set_local_error_code(ErrorCode::SocketWriteError);
                stats.incr_failed_attempts();
                return stats;
            }
            stats.add_header_bytes(footer_len);
        }
        stats.set_local_error_code(ErrorCode::Ok);
        stats.incr_num_blocks();
        stats.add_effective_bytes(stats.header_bytes(), stats.data_bytes());
        stats
    }

    fn send_size_cmd(&mut self) -> SenderState {
        debug!(port = self.port, "entered SEND_SIZE_CMD state");
        self.buf.clear();
        self.buf.push(cmd::SIZE);
        protocol::encode_size(&mut self.buf, self.shared.dir_queue.get_total_size());
        match self.write_buf() {
            Ok(written) => {
                self.stats.lock().add_header_bytes(written as i64);
                self.total_size_sent = true;
                SenderState::SendBlocks
            }
            Err(err) => {
                self.stats.lock().set_local_error_code(err);
                SenderState::CheckForAbort
            }
        }
    }

    fn send_done_cmd(&mut self) -> SenderState {
        debug!(port = self.port, "entered SEND_DONE_CMD state");
        let (num_blocks, transfer_status) = self.shared.dir_queue.get_num_blocks_and_status();
        self.buf.clear();
        self.buf.push(cmd::DONE);
        self.buf.push(transfer_status.to_wire());
        protocol::encode_done(
            self.thread_protocol_version,
            &mut self.buf,
            num_blocks,
            self.shared.dir_queue.get_total_size(),
        );
        protocol::pad_to(&mut self.buf, protocol::MIN_BUF_LENGTH);
        match self.write_buf() {
            Ok(written) => {
                self.stats.lock().add_header_bytes(written as i64);
                debug!(port = self.port, "wrote done cmd, waiting for reply");
                SenderState::ReadReceiverCmd
            }
            Err(err) => {
                self.stats.lock().set_local_error_code(err);
                SenderState::CheckForAbort
            }
        }
    }

    fn check_for_abort(&mut self) -> SenderState {
        info!(port = self.port, "entered CHECK_FOR_ABORT state");
        let mut byte = [0u8; 1];
        let read = match self.socket.as_mut() {
            Some(socket) => socket.read(&mut byte),
            None => return SenderState::Connect,
        };
        match read {
            Ok(1) if byte[0] == cmd::ABORT => {
                self.stats.lock().add_header_bytes(1);
                SenderState::ProcessAbortCmd
            }
            Ok(1) => {
                debug!(port = self.port, cmd = byte[0], "unexpected byte while probing for abort");
                SenderState::Connect
            }
            _ => {
                debug!(port = self.port, "no abort cmd found");
                SenderState::Connect
            }
        }
    }

    fn read_file_chunks(&mut self) -> SenderState {
        info!(port = self.port, "entered READ_FILE_CHUNKS state");
        let mut byte = [0u8; 1];
        let read = match self.socket.as_mut() {
            Some(socket) => socket.read(&mut byte),
            None => return SenderState::CheckForAbort,
        };
        match read {
            Ok(1) => {}
            _ => {
                self.stats
                    .lock()
                    .set_local_error_code(ErrorCode::SocketReadError);
                return SenderState::CheckForAbort;
            }
        }
        self.stats.lock().add_header_bytes(1);
        match byte[0] {
            cmd::ABORT => SenderState::ProcessAbortCmd,
            cmd::WAIT => SenderState::ReadFileChunks,
            cmd::ACK => {
                if !self.shared.is_file_chunks_received() {
                    error!(
                        port = self.port,
                        "receiver thinks file chunks were already sent, but none arrived"
                    );
                    self.stats
                        .lock()
                        .set_local_error_code(ErrorCode::ProtocolError);
                    return SenderState::End;
                }
                SenderState::SendBlocks
            }
            cmd::LOCAL_CHECKPOINT => match self.read_and_verify_spurious_checkpoint() {
                ErrorCode::SocketReadError => SenderState::Connect,
                ErrorCode::Ok => SenderState::ReadFileChunks,
                _ => SenderState::End,
            },
            cmd::CHUNKS => self.receive_file_chunks(),
            other => {
                error!(port = self.port, cmd = other, "unexpected cmd while reading file chunks");
                self.stats
                    .lock()
                    .set_local_error_code(ErrorCode::ProtocolError);
                SenderState::End
            }
        }
    }

    fn receive_file_chunks(&mut self) -> SenderState {
        let buf_size = match self.read_varint_from_socket() {
            Ok(v) => v as i64,
            Err(err) => {
                self.stats.lock().set_local_error_code(err);
                return SenderState::CheckForAbort;
            }
        };
        let num_files = match self.read_varint_from_socket() {
            Ok(v) => v as i64,
            Err(err) => {
                self.stats.lock().set_local_error_code(err);
                return SenderState::CheckForAbort;
            }
        };
        info!(port = self.port, num_files, buf_size, "receiving file chunks list");
        if buf_size <= 0 || num_files < 0 {
            self.stats
                .lock()
                .set_local_error_code(ErrorCode::ProtocolError);
            return SenderState::End;
        }
        let mut list: Vec<FileChunksInfo> = Vec::new();
        while (list.len() as i64) < num_files {
            if self.read_exact_buf(4).is_err() {
                self.stats
                    .lock()
                    .set_local_error_code(ErrorCode::SocketReadError);
                return SenderState::CheckForAbort;
            }
            let chunk_len =
                u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if chunk_len == 0 || chunk_len as i64 > buf_size {
                error!(port = self.port, chunk_len, buf_size, "chunk buffer overflows cmd bounds");
                self.stats
                    .lock()
                    .set_local_error_code(ErrorCode::ProtocolError);
                return SenderState::End;
            }
            if self.read_exact_buf(chunk_len).is_err() {
                self.stats
                    .lock()
                    .set_local_error_code(ErrorCode::SocketReadError);
                return SenderState::CheckForAbort;
            }
            self.stats.lock().add_header_bytes(4 + chunk_len as i64);
            let mut off = 0;
            if protocol::decode_file_chunks_info_list(&self.buf, &mut off, chunk_len, &mut list)
                .is_none()
            {
                error!(port = self.port, "unable to decode file chunks list");
                self.stats
                    .lock()
                    .set_local_error_code(ErrorCode::ProtocolError);
                return SenderState::End;
            }
            if list.len() as i64 > num_files {
                // More entries than the chunks cmd promised: peer is lying.
                error!(port = self.port, decoded = list.len(), num_files,
                    "file chunk count overflow");
                self.stats
                    .lock()
                    .set_local_error_code(ErrorCode::ProtocolError);
                return SenderState::End;
            }
        }
        self.shared.set_file_chunks_info(list);
        self.buf.clear();
        self.buf.push(cmd::ACK);
        match self.write_buf() {
            Ok(written) => {
                self.stats.lock().add_header_bytes(written as i64);
                SenderState::SendBlocks
            }
            Err(err) => {
                self.stats.lock().set_local_error_code(err);
                SenderState::CheckForAbort
            }
        }
    }

    /// Drain discipline for reading the next receiver command. A plain timed
    /// read is not enough: our own send buffer may still hold unacked bytes
    /// the receiver is busy consuming. Wait for the send buffer to drain,
    /// then give the receiver a symmetric window to reply.
    fn read_next_receiver_cmd(&mut self) -> Result<u8, ErrorCode> {
        let drain_extra = Duration::from_millis(self.options().drain_extra_ms);
        let socket = match self.socket.as_mut() {
            Some(s) => s,
            None => return Err(ErrorCode::SocketReadError),
        };
        let mut num_unacked = socket.unacked_bytes();
        let start = Instant::now();
        let time_to_clear_send_buffer;
        loop {
            let mut byte = [0u8; 1];
            match socket.read(&mut byte) {
                Ok(1) => return Ok(byte[0]),
                Ok(0) => {
                    error!(port = self.port, "unexpected EOF, reconnecting");
                    return Err(ErrorCode::SocketReadError);
                }
                Ok(_) => return Err(ErrorCode::SocketReadError),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    return Err(ErrorCode::Abort);
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    error!(port = self.port, error = %e, "failed to read receiver cmd");
                    return Err(ErrorCode::SocketReadError);
                }
            }
            if !self.controller.abort_code().is_ok() {
                return Err(ErrorCode::Abort);
            }
            let cur_unacked = socket.unacked_bytes();
            if num_unacked < 0 || cur_unacked < 0 {
                error!(port = self.port, "cannot read unacked byte count, reconnecting");
                return Err(ErrorCode::SocketReadError);
            }
            if cur_unacked == 0 {
                time_to_clear_send_buffer = start.elapsed();
                break;
            }
            if cur_unacked == num_unacked {
                error!(port = self.port, cur_unacked, "unacked byte count stuck, reconnecting");
                return Err(ErrorCode::SocketReadError);
            }
            info!(port = self.port, before = num_unacked, now = cur_unacked,
                "send buffer draining, retrying read");
            num_unacked = cur_unacked;
        }
        // Assume symmetric buffer sizes: the receiver needs about as long to
        // clear its receive buffer as we needed to clear our send buffer.
        let read_timeout = time_to_clear_send_buffer + drain_extra;
        info!(
            port = self.port,
            drained_ms = time_to_clear_send_buffer.as_millis() as u64,
            wait_ms = read_timeout.as_millis() as u64,
            "send buffer cleared, waiting for receiver"
        );
        let mut byte = [0u8; 1];
        match socket.read_with_timeout(&mut byte, read_timeout) {
            Ok(1) => Ok(byte[0]),
            _ => {
                error!(port = self.port, "no receiver cmd after drain window");
                Err(ErrorCode::SocketReadError)
            }
        }
    }

    fn read_receiver_cmd(&mut self) -> SenderState {
        debug!(port = self.port, "entered READ_RECEIVER_CMD state");
        let cmd_byte = match self.read_next_receiver_cmd() {
            Ok(b) => b,
            Err(err) => {
                self.stats.lock().set_local_error_code(err);
                return SenderState::Connect;
            }
        };
        match cmd_byte {
            cmd::ERR => SenderState::ProcessErrCmd,
            cmd::WAIT => SenderState::ProcessWaitCmd,
            cmd::DONE => SenderState::ProcessDoneCmd,
            cmd::ABORT => SenderState::ProcessAbortCmd,
            cmd::LOCAL_CHECKPOINT => match self.read_and_verify_spurious_checkpoint() {
                ErrorCode::SocketReadError => SenderState::Connect,
                ErrorCode::Ok => SenderState::ReadReceiverCmd,
                _ => SenderState::End,
            },
            other => {
                error!(port = self.port, cmd = other, "unexpected receiver cmd");
                self.stats
                    .lock()
                    .set_local_error_code(ErrorCode::ProtocolError);
                SenderState::End
            }
        }
    }

    /// A LOCAL_CHECKPOINT mid-stream is valid only as an all-zero keep-alive
    /// for our port; anything else is a protocol error.
    fn read_and_verify_spurious_checkpoint(&mut self) -> ErrorCode {
        let checkpoint_len = protocol::max_local_checkpoint_len(self.thread_protocol_version);
        if self.read_exact_buf(checkpoint_len - 1).is_err() {
            self.stats
                .lock()
                .set_local_error_code(ErrorCode::SocketReadError);
            return ErrorCode::SocketReadError;
        }
        // Reassemble the frame: the count byte doubled as the command.
        let mut frame = Vec::with_capacity(checkpoint_len);
        frame.push(cmd::LOCAL_CHECKPOINT);
        frame.extend_from_slice(&self.buf);
        let mut off = 0;
        if let Some(checkpoints) =
            protocol::decode_checkpoints(self.thread_protocol_version, &frame, &mut off)
        {
            if let [cp] = checkpoints.as_slice() {
                if cp.port == self.port && cp.num_blocks == 0 && cp.last_block_received_bytes == 0
                {
                    warn!(port = self.port, "ignoring spurious local checkpoint");
                    return ErrorCode::Ok;
                }
            }
        }
        error!(port = self.port, "failed to verify spurious local checkpoint");
        self.stats
            .lock()
            .set_local_error_code(ErrorCode::ProtocolError);
        ErrorCode::ProtocolError
    }

    fn process_done_cmd(&mut self) -> SenderState {
        debug!(port = self.port, "entered PROCESS_DONE_CMD state");
        // DONE acknowledges every block sent so far on this connection.
        self.history.mark_all_acknowledged();
        self.buf.clear();
        self.buf.push(cmd::DONE);
        // Echo is best effort; the EOF check below catches a dead peer.
        let _ = self.write_buf();
        let err = match self.socket.as_mut() {
            Some(socket) => {
                socket.shutdown_writes();
                socket.expect_end_of_stream()
            }
            None => ErrorCode::SocketReadError,
        };
        if !err.is_ok() {
            warn!(port = self.port, %err, "logical EOF not found when expected");
            self.stats.lock().set_local_error_code(err);
            return SenderState::Connect;
        }
        debug!(port = self.port, "done with transfer");
        SenderState::End
    }

    fn process_wait_cmd(&mut self) -> SenderState {
        info!(port = self.port, "entered PROCESS_WAIT_CMD state");
        // WAIT verifies all blocks like DONE; the receiver just is not
        // finished globally yet.
        self.history.mark_all_acknowledged();
        SenderState::ReadReceiverCmd
    }

    fn process_err_cmd(&mut self) -> SenderState {
        info!(port = self.port, "entered PROCESS_ERR_CMD state");
        // Bytes up to the checkpoints below are durable.
        self.history.mark_all_acknowledged();
        if self.read_exact_buf(2).is_err() {
            self.stats
                .lock()
                .set_local_error_code(ErrorCode::SocketReadError);
            return SenderState::Connect;
        }
        let checkpoints_len = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.read_exact_buf(checkpoints_len).is_err() {
            self.stats
                .lock()
                .set_local_error_code(ErrorCode::SocketReadError);
            return SenderState::Connect;
        }
        let mut off = 0;
        let checkpoints =
            match protocol::decode_checkpoints(self.thread_protocol_version, &self.buf, &mut off) {
                Some(cps) if off == checkpoints_len => cps,
                _ => {
                    error!(port = self.port, "global checkpoint decode failure");
                    self.stats
                        .lock()
                        .set_local_error_code(ErrorCode::ProtocolError);
                    return SenderState::End;
                }
            };
        for checkpoint in checkpoints {
            info!(port = self.port, ?checkpoint, "received global checkpoint");
            self.history_controller.handle_global_checkpoint(checkpoint);
        }
        SenderState::SendBlocks
    }

    fn process_abort_cmd(&mut self) -> SenderState {
        info!(port = self.port, "entered PROCESS_ABORT_CMD state");
        self.stats.lock().set_local_error_code(ErrorCode::Abort);
        if self.read_exact_buf(protocol::ABORT_FRAME_LEN).is_err() {
            // Still propagate the abort so siblings stop quickly, even
            // though the details are unknown.
            error!(port = self.port, "could not read abort payload");
            self.controller.abort(ErrorCode::Abort);
            return SenderState::End;
        }
        let mut off = 0;
        let (negotiated_protocol, remote_error, checkpoint_seq_id) =
            match protocol::decode_abort(&self.buf, &mut off) {
                Some(decoded) => decoded,
                None => {
                    self.controller.abort(ErrorCode::Abort);
                    return SenderState::End;
                }
            };
        self.stats.lock().set_remote_error_code(remote_error);
        let failed_source = self.history.get_source_id(checkpoint_seq_id);
        warn!(
            port = self.port,
            negotiated_protocol,
            remote_error = %remote_error,
            checkpoint_seq_id,
            failed_source = failed_source.as_deref().unwrap_or("<none>"),
            "received abort from receiver"
        );
        self.controller.abort(remote_error);
        if remote_error == ErrorCode::VersionMismatch {
            if negotiated_protocol > 0
                && protocol::negotiate_protocol(negotiated_protocol, self.thread_protocol_version)
                    == negotiated_protocol
            {
                self.negotiated_protocol = negotiated_protocol;
                self.shared
                    .set_negotiated_protocol(self.thread_index, negotiated_protocol);
                return SenderState::ProcessVersionMismatch;
            }
            error!(port = self.port, negotiated_protocol, "cannot support receiver version");
            self.stats
                .lock()
                .set_remote_error_code(ErrorCode::VersionIncompatible);
        }
        SenderState::End
    }

    fn process_version_mismatch(&mut self) -> SenderState {
        info!(port = self.port, "entered PROCESS_VERSION_MISMATCH state");
        match self.controller.negotiation_status() {
            NegotiationStatus::VMismatchFailed => return SenderState::End,
            NegotiationStatus::VMismatchResolved => {
                warn!(
                    port = self.port,
                    "version already negotiated, but transfer aborted by mismatch again"
                );
                return SenderState::End;
            }
            NegotiationStatus::VMismatchWait => {}
        }
        // Every thread must publish its peer-proposed version before one of
        // them decides the winner.
        let barrier = self.controller.get_barrier(VERSION_MISMATCH_BARRIER);
        barrier.execute();
        debug!(port = self.port, "cleared the protocol version barrier");
        let funnel = self.controller.get_funnel(VERSION_MISMATCH_FUNNEL);
        loop {
            match funnel.get_status() {
                FunnelStatus::FunnelStart => {
                    info!(port = self.port, "won the version mismatch funnel");
                    self.controller
                        .set_negotiation_status(NegotiationStatus::VMismatchFailed);
                    if !self.history_controller.handle_version_mismatch().is_ok() {
                        funnel.notify_success();
                        return SenderState::End;
                    }
                    let mut negotiated = 0;
                    for version in self.shared.negotiated_protocols() {
                        if version > 0 {
                            if negotiated > 0 && negotiated != version {
                                error!(
                                    negotiated,
                                    version, "threads negotiated different protocols"
                                );
                                funnel.notify_success();
                                return SenderState::End;
                            }
                            negotiated = version;
                        }
                    }
                    if negotiated <= 0 {
                        error!(port = self.port, "no negotiated protocol collected");
                        funnel.notify_success();
                        return SenderState::End;
                    }
                    if negotiated != self.thread_protocol_version {
                        info!(
                            from = self.thread_protocol_version,
                            to = negotiated,
                            "changing protocol version"
                        );
                    }
                    self.shared.set_protocol_version(negotiated);
                    self.thread_protocol_version = negotiated;
                    self.set_footer_type();
                    if self.shared.download_resumption_enabled()
                        && !self.shared.is_send_file_chunks()
                        && !self.shared.is_file_chunks_received()
                    {
                        // Downgraded below the resumption version: no thread
                        // will ever deliver a chunks list, unblock discovery.
                        self.shared.set_file_chunks_info(Vec::new());
                    }
                    self.stats.lock().set_remote_error_code(ErrorCode::Ok);
                    self.controller
                        .set_negotiation_status(NegotiationStatus::VMismatchResolved);
                    self.controller.clear_abort();
                    funnel.notify_success();
                    return SenderState::Connect;
                }
                FunnelStatus::FunnelProgress => funnel.wait(),
                FunnelStatus::FunnelEnd => match self.controller.negotiation_status() {
                    NegotiationStatus::VMismatchFailed => return SenderState::End,
                    NegotiationStatus::VMismatchResolved => {
                        self.thread_protocol_version = self.shared.protocol_version();
                        self.set_footer_type();
                        self.stats.lock().set_remote_error_code(ErrorCode::Ok);
                        return SenderState::Connect;
                    }
                    NegotiationStatus::VMismatchWait => return SenderState::End,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir_queue::DirectorySourceQueue;
    use crate::socket::TcpSocketCreator;
    use crate::transfer_request::{EncryptionParams, EncryptionType};
    use std::collections::VecDeque;

    const TEST_PORT: i32 = 22356;

    enum ReadScript {
        Data(Vec<u8>),
        Timeout,
        Eof,
    }

    /// Scripted socket: reads come from a queue of events, unacked-byte
    /// queries from a queue of counts, writes are captured.
    struct MockSocket {
        reads: VecDeque<ReadScript>,
        unacked: VecDeque<i64>,
        writes: Vec<u8>,
    }

    impl MockSocket {
        fn new(reads: Vec<ReadScript>, unacked: Vec<i64>) -> MockSocket {
            MockSocket {
                reads: reads.into(),
                unacked: unacked.into(),
                writes: Vec::new(),
            }
        }
    }

    impl ClientSocket for MockSocket {
        fn connect(&mut self) -> ErrorCode {
            ErrorCode::Ok
        }

        fn port(&self) -> i32 {
            TEST_PORT
        }

        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let mut filled = 0;
            while filled < buf.len() {
                match self.reads.front_mut() {
                    Some(ReadScript::Data(bytes)) => {
                        let take = bytes.len().min(buf.len() - filled);
                        buf[filled..filled + take].copy_from_slice(&bytes[..take]);
                        bytes.drain(..take);
                        filled += take;
                        if bytes.is_empty() {
                            self.reads.pop_front();
                        }
                    }
                    Some(ReadScript::Timeout) => {
                        self.reads.pop_front();
                        if filled > 0 {
                            return Ok(filled);
                        }
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "scripted timeout",
                        ));
                    }
                    Some(ReadScript::Eof) | None => return Ok(filled),
                }
            }
            Ok(filled)
        }

        fn read_with_timeout(
            &mut self,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> std::io::Result<usize> {
            self.read(buf)
        }

        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.writes.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn unacked_bytes(&mut self) -> i64 {
            self.unacked.pop_front().unwrap_or(0)
        }

        fn shutdown_writes(&mut self) -> ErrorCode {
            ErrorCode::Ok
        }

        fn expect_end_of_stream(&mut self) -> ErrorCode {
            ErrorCode::Ok
        }

        fn encryption_type(&self) -> EncryptionType {
            EncryptionType::None
        }

        fn compute_cur_encryption_tag(&mut self) -> Vec<u8> {
            Vec::new()
        }

        fn non_retryable_err_code(&self) -> ErrorCode {
            ErrorCode::Ok
        }

        fn close(&mut self) {}
    }

    fn make_thread(dir: &std::path::Path, socket: MockSocket) -> SenderThread {
        let options = WdtOptions::default();
        let queue = Arc::new(DirectorySourceQueue::new(
            dir.to_path_buf(),
            vec![],
            false,
            0,
            false,
        ));
        let shared = crate::sender::SenderShared::new(
            options,
            "localhost".into(),
            "test-id".into(),
            EncryptionParams::none(),
            Arc::clone(&queue),
            None,
            protocol::PROTOCOL_VERSION,
            1,
            false,
        );
        let controller = ThreadsController::new(1);
        let history_controller = Arc::new(TransferHistoryController::new());
        let stats = Arc::new(Mutex::new(TransferStats::new()));
        let history = Arc::new(ThreadTransferHistory::new(
            TEST_PORT,
            queue,
            Arc::clone(&stats),
        ));
        history_controller.add_history(Arc::clone(&history));
        let mut thread = SenderThread::new(
            shared,
            controller,
            history_controller,
            history,
            Arc::new(TcpSocketCreator),
            stats,
            0,
            TEST_PORT,
        );
        thread.socket = Some(Box::new(socket));
        thread
    }

    fn checkpoint_frame(cp: protocol::Checkpoint) -> Vec<u8> {
        let mut buf = Vec::new();
        protocol::encode_checkpoints(protocol::PROTOCOL_VERSION, &mut buf, &[cp]);
        buf
    }

    #[test]
    fn drain_discipline_waits_for_send_buffer() {
        let dir = tempfile::tempdir().unwrap();
        // Two timeouts while the kernel send buffer drains (100 -> 40 -> 0),
        // then the receiver's command arrives within the drain window.
        let socket = MockSocket::new(
            vec![
                ReadScript::Timeout,
                ReadScript::Timeout,
                ReadScript::Data(vec![cmd::DONE]),
            ],
            vec![100, 40, 0],
        );
        let mut thread = make_thread(dir.path(), socket);
        assert_eq!(thread.read_next_receiver_cmd(), Ok(cmd::DONE));
    }

    #[test]
    fn drain_discipline_gives_up_when_peer_is_stuck() {
        let dir = tempfile::tempdir().unwrap();
        // Unacked byte count never moves: the peer is dead.
        let socket = MockSocket::new(vec![ReadScript::Timeout], vec![100, 100]);
        let mut thread = make_thread(dir.path(), socket);
        assert_eq!(
            thread.read_next_receiver_cmd(),
            Err(ErrorCode::SocketReadError)
        );
    }

    #[test]
    fn drain_discipline_eof_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket = MockSocket::new(vec![ReadScript::Eof], vec![0]);
        let mut thread = make_thread(dir.path(), socket);
        assert_eq!(
            thread.read_next_receiver_cmd(),
            Err(ErrorCode::SocketReadError)
        );
    }

    #[test]
    fn checkpoint_minus_one_routes_to_read_receiver_cmd() {
        let dir = tempfile::tempdir().unwrap();
        let frame = checkpoint_frame(protocol::Checkpoint {
            port: TEST_PORT,
            num_blocks: -1,
            last_block_seq_id: -1,
            last_block_received_bytes: 0,
        });
        let socket = MockSocket::new(vec![ReadScript::Data(frame)], vec![]);
        let mut thread = make_thread(dir.path(), socket);
        assert_eq!(thread.read_local_checkpoint(), SenderState::ReadReceiverCmd);
        assert!(thread.stats.lock().local_error_code().is_ok());
    }

    #[test]
    fn checkpoint_for_wrong_port_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let frame = checkpoint_frame(protocol::Checkpoint::new(TEST_PORT + 1));
        let socket = MockSocket::new(vec![ReadScript::Data(frame)], vec![]);
        let mut thread = make_thread(dir.path(), socket);
        assert_eq!(thread.read_local_checkpoint(), SenderState::End);
        assert_eq!(
            thread.stats.lock().local_error_code(),
            ErrorCode::ProtocolError
        );
    }

    #[test]
    fn spurious_checkpoint_is_ignored_midstream() {
        let dir = tempfile::tempdir().unwrap();
        // The command byte (0x01) was already consumed by the dispatcher.
        let frame = checkpoint_frame(protocol::Checkpoint::new(TEST_PORT));
        let socket = MockSocket::new(vec![ReadScript::Data(frame[1..].to_vec())], vec![]);
        let mut thread = make_thread(dir.path(), socket);
        assert_eq!(thread.read_and_verify_spurious_checkpoint(), ErrorCode::Ok);
        assert!(thread.stats.lock().local_error_code().is_ok());
    }

    #[test]
    fn non_spurious_midstream_checkpoint_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cp = protocol::Checkpoint::new(TEST_PORT);
        cp.num_blocks = 2;
        let frame = checkpoint_frame(cp);
        let socket = MockSocket::new(vec![ReadScript::Data(frame[1..].to_vec())], vec![]);
        let mut thread = make_thread(dir.path(), socket);
        assert_eq!(
            thread.read_and_verify_spurious_checkpoint(),
            ErrorCode::ProtocolError
        );
    }
}
