//! Sender controller: validates the request, owns the directory-discovery
//! thread, one sender thread per destination port and the progress reporter,
//! and aggregates everything into the final transfer report.
//!
//! One `Sender` instance serves exactly one transfer.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::coordinator::ThreadsController;
use crate::dir_queue::DirectorySourceQueue;
use crate::error::ErrorCode;
use crate::history::{ThreadTransferHistory, TransferHistoryController};
use crate::options::WdtOptions;
use crate::protocol::{self, FileChunksInfo};
use crate::report::{ProgressReporter, TransferProgress, TransferReport};
use crate::sender_thread::SenderThread;
use crate::socket::{AbortChecker, SocketCreator, TcpSocketCreator};
use crate::stats::TransferStats;
use crate::throttler::Throttler;
use crate::transfer_request::{EncryptionParams, TransferRequest};

/// Narrow capability handle given to every sender thread instead of a
/// back-pointer to the whole controller.
pub struct SenderShared {
    pub options: WdtOptions,
    pub dest_host: String,
    pub transfer_id: String,
    pub encryption: EncryptionParams,
    pub dir_queue: Arc<DirectorySourceQueue>,
    pub throttler: Option<Arc<Throttler>>,
    protocol_version: AtomicI32,
    negotiated_protocols: Mutex<Vec<i32>>,
    file_chunks_received: AtomicBool,
    download_resumption: bool,
    start_time: Mutex<Option<Instant>>,
}

impl SenderShared {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: WdtOptions,
        dest_host: String,
        transfer_id: String,
        encryption: EncryptionParams,
        dir_queue: Arc<DirectorySourceQueue>,
        throttler: Option<Arc<Throttler>>,
        protocol_version: i32,
        num_threads: usize,
        download_resumption: bool,
    ) -> Arc<SenderShared> {
        Arc::new(SenderShared {
            options,
            dest_host,
            transfer_id,
            encryption,
            dir_queue,
            throttler,
            protocol_version: AtomicI32::new(protocol_version),
            negotiated_protocols: Mutex::new(vec![0; num_threads]),
            file_chunks_received: AtomicBool::new(false),
            download_resumption,
            start_time: Mutex::new(None),
        })
    }

    pub fn protocol_version(&self) -> i32 {
        self.protocol_version.load(Ordering::Acquire)
    }

    pub fn set_protocol_version(&self, version: i32) {
        self.protocol_version.store(version, Ordering::Release);
    }

    pub fn download_resumption_enabled(&self) -> bool {
        self.download_resumption
    }

    /// Whether the SETTINGS frame should request the receiver's chunk list.
    pub fn is_send_file_chunks(&self) -> bool {
        self.download_resumption
            && self.protocol_version() >= protocol::DOWNLOAD_RESUMPTION_VERSION
    }

    pub fn is_file_chunks_received(&self) -> bool {
        self.file_chunks_received.load(Ordering::Acquire)
    }

    /// Deliver the receiver's chunk list to the directory queue. Only the
    /// first delivery counts; later ones (other threads racing) are dropped.
    pub fn set_file_chunks_info(&self, list: Vec<FileChunksInfo>) {
        if self.file_chunks_received.swap(true, Ordering::AcqRel) {
            warn!("file chunks already received, ignoring duplicate list");
            return;
        }
        self.dir_queue.set_previously_received_chunks(list);
    }

    pub fn set_negotiated_protocol(&self, thread_index: usize, version: i32) {
        let mut protocols = self.negotiated_protocols.lock();
        if thread_index < protocols.len() {
            protocols[thread_index] = version;
        }
    }

    pub fn negotiated_protocols(&self) -> Vec<i32> {
        self.negotiated_protocols.lock().clone()
    }

    /// First-thread hook: the transfer officially starts.
    pub fn start_new_transfer(&self) {
        *self.start_time.lock() = Some(Instant::now());
        info!(transfer_id = %self.transfer_id, host = %self.dest_host, "transfer started");
    }

    /// Last-thread hook: the transfer is over.
    pub fn end_cur_transfer(&self) {
        let started = *self.start_time.lock();
        let elapsed_secs = started.map(|start| start.elapsed().as_secs_f64());
        info!(transfer_id = %self.transfer_id, elapsed_secs, "all sender threads finished");
    }
}

/// Aborts directory discovery once every sender thread has reached END (or
/// the whole transfer was aborted fatally).
struct QueueAbortChecker {
    controller: Arc<ThreadsController>,
}

impl AbortChecker for QueueAbortChecker {
    fn should_abort(&self) -> bool {
        self.controller.num_active_threads() == 0
    }
}

pub struct Sender {
    shared: Arc<SenderShared>,
    controller: Arc<ThreadsController>,
    history_controller: Arc<TransferHistoryController>,
    socket_creator: Arc<dyn SocketCreator>,
    progress_reporter: Option<Box<dyn ProgressReporter>>,
    thread_stats: Vec<Arc<Mutex<TransferStats>>>,
    ports: Vec<i32>,
    sender_threads: Vec<JoinHandle<()>>,
    dir_thread: Option<JoinHandle<()>>,
    // Hands the reporter back on join so finish() can deliver the final
    // report through it.
    progress_thread: Option<JoinHandle<Box<dyn ProgressReporter>>>,
    progress_stop: Arc<(Mutex<bool>, Condvar)>,
    start_instant: Instant,
    started: bool,
}

impl Sender {
    /// Validate the request and set everything up; no thread runs yet.
    pub fn new(mut request: TransferRequest, options: WdtOptions) -> Result<Sender> {
        let code = request.validate();
        if !code.is_ok() {
            bail!("invalid transfer request: {code}");
        }
        info!(request = %request.log_safe_string(), "transfer request validated");
        let download_resumption = options.enable_download_resumption
            && request.protocol_version >= protocol::DOWNLOAD_RESUMPTION_VERSION;
        let dir_queue = Arc::new(DirectorySourceQueue::new(
            request.directory.clone(),
            request.file_info.clone(),
            request.disable_directory_traversal,
            options.block_size_bytes(),
            download_resumption,
        ));
        let throttler = Throttler::new(options.avg_mbytes_per_sec).map(Arc::new);
        let num_threads = request.ports.len();
        let thread_stats = (0..num_threads)
            .map(|_| Arc::new(Mutex::new(TransferStats::new())))
            .collect();
        let shared = SenderShared::new(
            options,
            request.host_name.clone(),
            request.transfer_id.clone(),
            request.encryption.clone(),
            dir_queue,
            throttler,
            request.protocol_version,
            num_threads,
            download_resumption,
        );
        Ok(Sender {
            shared,
            controller: ThreadsController::new(num_threads),
            history_controller: Arc::new(TransferHistoryController::new()),
            socket_creator: Arc::new(TcpSocketCreator),
            progress_reporter: None,
            thread_stats,
            ports: request.ports,
            sender_threads: Vec::new(),
            dir_thread: None,
            progress_thread: None,
            progress_stop: Arc::new((Mutex::new(false), Condvar::new())),
            start_instant: Instant::now(),
            started: false,
        })
    }

    /// Substitute the socket implementation (tests, encrypted transports).
    pub fn set_socket_creator(&mut self, creator: Arc<dyn SocketCreator>) {
        self.socket_creator = creator;
    }

    pub fn set_progress_reporter(&mut self, reporter: Box<dyn ProgressReporter>) {
        self.progress_reporter = Some(reporter);
    }

    /// Abort the transfer from outside; threads observe it between socket
    /// operations.
    pub fn abort(&self, code: ErrorCode) {
        self.controller.abort(code);
    }

    /// Spawn the discovery thread, one sender thread per port and the
    /// progress reporter, then return to the caller.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            bail!("sender already started");
        }
        self.started = true;
        self.start_instant = Instant::now();

        let queue = Arc::clone(&self.shared.dir_queue);
        let queue_abort = QueueAbortChecker {
            controller: Arc::clone(&self.controller),
        };
        self.dir_thread = Some(
            std::thread::Builder::new()
                .name("wdt-dir".into())
                .spawn(move || {
                    queue.build_queue(&queue_abort);
                })?,
        );

        for (thread_index, port) in self.ports.iter().copied().enumerate() {
            let stats = Arc::clone(&self.thread_stats[thread_index]);
            let history = Arc::new(ThreadTransferHistory::new(
                port,
                Arc::clone(&self.shared.dir_queue),
                Arc::clone(&stats),
            ));
            self.history_controller.add_history(Arc::clone(&history));
            let mut thread = SenderThread::new(
                Arc::clone(&self.shared),
                Arc::clone(&self.controller),
                Arc::clone(&self.history_controller),
                history,
                Arc::clone(&self.socket_creator),
                stats,
                thread_index,
                port,
            );
            self.sender_threads.push(
                std::thread::Builder::new()
                    .name(format!("wdt-sender-{port}"))
                    .spawn(move || thread.run())?,
            );
        }

        let interval = self.shared.options.progress_report_interval_millis;
        if interval > 0 {
            if let Some(mut reporter) = self.progress_reporter.take() {
                let stats: Vec<Arc<Mutex<TransferStats>>> = self.thread_stats.clone();
                let queue = Arc::clone(&self.shared.dir_queue);
                let stop = Arc::clone(&self.progress_stop);
                self.progress_thread = Some(
                    std::thread::Builder::new()
                        .name("wdt-progress".into())
                        .spawn(move || {
                            let (lock, cond) = &*stop;
                            let mut stopped = lock.lock();
                            while !*stopped {
                                let _ = cond.wait_for(&mut stopped, Duration::from_millis(interval));
                                if *stopped {
                                    break;
                                }
                                let mut effective = 0;
                                let mut blocks = 0;
                                for s in &stats {
                                    let s = s.lock();
                                    effective += s.effective_data_bytes();
                                    blocks += s.num_blocks();
                                }
                                reporter.progress(&TransferProgress {
                                    effective_data_bytes: effective,
                                    total_size: queue.get_total_size(),
                                    discovery_finished: queue.file_discovery_finished(),
                                    num_blocks: blocks,
                                });
                            }
                            reporter
                        })?,
                );
            }
        }
        Ok(())
    }

    /// Join every thread and build the final report. Callable after
    /// `start`; `transfer` wraps both for the blocking use case.
    pub fn finish(mut self) -> TransferReport {
        for handle in self.sender_threads.drain(..) {
            if handle.join().is_err() {
                warn!("sender thread panicked");
            }
        }
        // All sender threads are done; the queue abort checker now fires and
        // unblocks a still-running discovery thread.
        if let Some(handle) = self.dir_thread.take() {
            if handle.join().is_err() {
                warn!("discovery thread panicked");
            }
        }
        {
            let (lock, cond) = &*self.progress_stop;
            *lock.lock() = true;
            cond.notify_all();
        }
        // Recover the reporter from the progress thread (or from the field
        // when no thread ran) so it sees the final report.
        let reporter = self
            .progress_thread
            .take()
            .and_then(|handle| handle.join().ok())
            .or_else(|| self.progress_reporter.take());
        let report = self.build_report();
        if let Some(mut reporter) = reporter {
            reporter.done(&report);
        }
        report
    }

    /// Blocking transfer: start, wait, report.
    pub fn transfer(mut self) -> Result<TransferReport> {
        self.start()?;
        Ok(self.finish())
    }

    fn build_report(&self) -> TransferReport {
        let mut summary = TransferStats::new();
        let thread_stats: Vec<TransferStats> = self
            .thread_stats
            .iter()
            .map(|s| s.lock().clone())
            .collect();
        for stats in &thread_stats {
            summary.combine(stats);
        }
        let queue = &self.shared.dir_queue;
        let (num_blocks_discovered, queue_status) = queue.get_num_blocks_and_status();
        let failed_sources = queue.failed_sources();
        let remaining = queue.num_remaining_sources();
        let inflight = self.history_controller.num_inflight_total();
        let complete = queue.file_discovery_finished()
            && remaining == 0
            && inflight == 0
            && failed_sources.is_empty();
        let error_code = if complete {
            ErrorCode::Ok
        } else if !queue_status.is_ok() {
            queue_status
        } else if !summary.error_code().is_ok() {
            summary.error_code()
        } else {
            ErrorCode::Error
        };
        let total_time_secs = self.start_instant.elapsed().as_secs_f64().max(f64::EPSILON);
        let mbytes = summary.effective_total_bytes() as f64 / (1024.0 * 1024.0);
        TransferReport {
            transfer_id: self.shared.transfer_id.clone(),
            error_code,
            protocol_version: self.shared.protocol_version(),
            summary,
            thread_stats,
            total_file_size: queue.get_total_size(),
            num_blocks_discovered,
            failed_sources,
            total_time_secs,
            throughput_mbytes_per_sec: mbytes / total_time_secs,
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        // A dropped sender must not leave threads blocked on the queue.
        if self.started && !self.sender_threads.is_empty() {
            self.controller.abort(ErrorCode::Abort);
            for handle in self.sender_threads.drain(..) {
                let _ = handle.join();
            }
            if let Some(handle) = self.dir_thread.take() {
                let _ = handle.join();
            }
        }
        let (lock, cond) = &*self.progress_stop;
        *lock.lock() = true;
        cond.notify_all();
        if let Some(handle) = self.progress_thread.take() {
            let _ = handle.join();
        }
    }
}
