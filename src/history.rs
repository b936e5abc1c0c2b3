//! Per-thread transfer history: the ordered log of sources dispatched on a
//! connection and their acknowledgement state.
//!
//! Sources below the checkpoint are durable at the receiver and get
//! discarded; sources above it go back to the directory queue when the
//! connection dies, with the boundary block's offset advanced past the bytes
//! the receiver already holds. The owning thread appends and acknowledges;
//! the global-checkpoint dispatcher may rewind any history under its lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dir_queue::DirectorySourceQueue;
use crate::error::ErrorCode;
use crate::protocol::Checkpoint;
use crate::source::ByteSource;
use crate::stats::TransferStats;

/// Outcome of applying a local checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointResult {
    Ok,
    /// Block count out of the valid window (regressed below acknowledged or
    /// past what was dispatched).
    InvalidCheckpoint,
    /// Byte-identical to the previous checkpoint: the peer is stuck.
    NoProgress,
}

struct HistoryEntry {
    source: Box<dyn ByteSource>,
    /// Effective bytes this block contributed to the thread stats, undone if
    /// the block has to be retried.
    effective_header_bytes: i64,
    effective_data_bytes: i64,
    /// Whether the block was counted as sent (send succeeded end to end).
    counted_block: bool,
}

struct HistoryState {
    inflight: VecDeque<HistoryEntry>,
    /// Cumulative blocks acknowledged on this port.
    num_acked: i64,
    last_checkpoint: Option<Checkpoint>,
    global_checkpoint: bool,
}

pub struct ThreadTransferHistory {
    port: i32,
    queue: Arc<DirectorySourceQueue>,
    stats: Arc<Mutex<TransferStats>>,
    state: Mutex<HistoryState>,
}

impl ThreadTransferHistory {
    pub fn new(
        port: i32,
        queue: Arc<DirectorySourceQueue>,
        stats: Arc<Mutex<TransferStats>>,
    ) -> ThreadTransferHistory {
        ThreadTransferHistory {
            port,
            queue,
            stats,
            state: Mutex::new(HistoryState {
                inflight: VecDeque::new(),
                num_acked: 0,
                last_checkpoint: None,
                global_checkpoint: false,
            }),
        }
    }

    pub fn port(&self) -> i32 {
        self.port
    }

    /// Record a dispatched source. Returns false if a global checkpoint
    /// arrived for this thread — the source is returned to the queue and the
    /// caller must stop dispatching.
    pub fn add_source(
        &self,
        source: Box<dyn ByteSource>,
        effective_header_bytes: i64,
        effective_data_bytes: i64,
        counted_block: bool,
    ) -> bool {
        let mut state = self.state.lock();
        let entry = HistoryEntry {
            source,
            effective_header_bytes,
            effective_data_bytes,
            counted_block,
        };
        if state.global_checkpoint {
            drop(state);
            self.undo_entry_stats(&entry, 0);
            self.queue.return_to_queue(vec![entry.source]);
            return false;
        }
        state.inflight.push_back(entry);
        true
    }

    /// Apply the checkpoint read after a reconnect. Acknowledged sources are
    /// discarded, the rest are re-enqueued for retry.
    pub fn set_local_checkpoint(&self, checkpoint: Checkpoint) -> CheckpointResult {
        let mut state = self.state.lock();
        if checkpoint.num_blocks < state.num_acked
            || checkpoint.num_blocks > state.num_acked + state.inflight.len() as i64
        {
            tracing::error!(
                port = self.port,
                num_blocks = checkpoint.num_blocks,
                acked = state.num_acked,
                inflight = state.inflight.len(),
                "invalid checkpoint"
            );
            return CheckpointResult::InvalidCheckpoint;
        }
        let no_progress = state.last_checkpoint == Some(checkpoint);
        state.last_checkpoint = Some(checkpoint);
        self.rewind_to(&mut state, checkpoint);
        if no_progress {
            CheckpointResult::NoProgress
        } else {
            CheckpointResult::Ok
        }
    }

    /// Peer-signalled rewind delivered by the dispatcher. Sets the
    /// global-checkpoint flag that stops this thread from dispatching more
    /// work. Counts outside the valid window are clamped: acknowledged
    /// blocks cannot be rewound.
    pub fn handle_global_checkpoint(&self, checkpoint: Checkpoint) {
        let mut state = self.state.lock();
        state.global_checkpoint = true;
        let mut clamped = checkpoint;
        clamped.num_blocks = checkpoint
            .num_blocks
            .clamp(state.num_acked, state.num_acked + state.inflight.len() as i64);
        if clamped.num_blocks != checkpoint.num_blocks {
            tracing::warn!(
                port = self.port,
                requested = checkpoint.num_blocks,
                clamped = clamped.num_blocks,
                "clamped global checkpoint"
            );
        }
        state.last_checkpoint = Some(clamped);
        self.rewind_to(&mut state, clamped);
    }

    /// Everything dispatched so far is durable (DONE/WAIT received).
    pub fn mark_all_acknowledged(&self) {
        let mut state = self.state.lock();
        state.num_acked += state.inflight.len() as i64;
        state.inflight.clear();
    }

    pub fn is_global_checkpoint_received(&self) -> bool {
        self.state.lock().global_checkpoint
    }

    /// Relative path of the in-flight source with this seq-id, for logging.
    pub fn get_source_id(&self, seq_id: i64) -> Option<String> {
        let state = self.state.lock();
        state
            .inflight
            .iter()
            .find(|e| e.source.metadata().seq_id == seq_id)
            .map(|e| e.source.identifier().to_string())
    }

    pub fn num_acked(&self) -> i64 {
        self.state.lock().num_acked
    }

    pub fn num_inflight(&self) -> usize {
        self.state.lock().inflight.len()
    }

    /// Return every un-acknowledged source to the queue and reset the
    /// history, used when recovering from a version mismatch.
    pub fn return_unacked_sources_to_queue(&self) {
        let mut state = self.state.lock();
        let entries: Vec<HistoryEntry> = state.inflight.drain(..).collect();
        state.last_checkpoint = None;
        state.global_checkpoint = false;
        drop(state);
        self.requeue_entries(entries, -1, 0);
    }

    /// Discard the first `checkpoint.num_blocks - num_acked` entries as
    /// acknowledged, requeue the rest. Expects a validated/clamped count.
    fn rewind_to(&self, state: &mut HistoryState, checkpoint: Checkpoint) {
        let acked_now = (checkpoint.num_blocks - state.num_acked) as usize;
        for _ in 0..acked_now {
            state.inflight.pop_front();
        }
        state.num_acked = checkpoint.num_blocks;
        let entries: Vec<HistoryEntry> = state.inflight.drain(..).collect();
        self.requeue_entries(
            entries,
            checkpoint.last_block_seq_id,
            checkpoint.last_block_received_bytes,
        );
    }

    fn requeue_entries(
        &self,
        mut entries: Vec<HistoryEntry>,
        partial_seq_id: i64,
        partial_received: i64,
    ) {
        if entries.is_empty() {
            return;
        }
        let mut sources = Vec::with_capacity(entries.len());
        for (i, mut entry) in entries.drain(..).enumerate() {
            let mut keep_bytes = 0;
            if i == 0
                && partial_received > 0
                && entry.source.metadata().seq_id == partial_seq_id
                && partial_received < entry.source.size()
            {
                // The receiver holds the first part of this block; only the
                // tail needs resending.
                entry.source.advance_offset(partial_received);
                keep_bytes = partial_received;
            }
            self.undo_entry_stats(&entry, keep_bytes);
            tracing::info!(
                port = self.port,
                source = entry.source.identifier(),
                offset = entry.source.offset(),
                "returning source to queue for retry"
            );
            sources.push(entry.source);
        }
        self.queue.return_to_queue(sources);
    }

    /// Remove a requeued block's contribution from the thread stats, except
    /// for `keep_data_bytes` the receiver proved it already holds.
    fn undo_entry_stats(&self, entry: &HistoryEntry, keep_data_bytes: i64) {
        let mut stats = self.stats.lock();
        stats.subtract_effective_bytes(
            entry.effective_header_bytes,
            entry.effective_data_bytes - keep_data_bytes,
        );
        if entry.counted_block {
            stats.decr_num_blocks();
        }
        stats.incr_failed_attempts();
    }
}

/// Registry of all thread histories, keyed by port. The ERR-frame handler
/// dispatches global checkpoints through it, and version-mismatch recovery
/// resets every history through it.
pub struct TransferHistoryController {
    histories: Mutex<HashMap<i32, Arc<ThreadTransferHistory>>>,
}

impl TransferHistoryController {
    pub fn new() -> TransferHistoryController {
        TransferHistoryController {
            histories: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_history(&self, history: Arc<ThreadTransferHistory>) {
        self.histories.lock().insert(history.port(), history);
    }

    pub fn get_history(&self, port: i32) -> Option<Arc<ThreadTransferHistory>> {
        self.histories.lock().get(&port).cloned()
    }

    /// Route a receiver-sent global checkpoint to the matching thread.
    /// Spurious (all-zero) checkpoints are ignored.
    pub fn handle_global_checkpoint(&self, checkpoint: Checkpoint) {
        if checkpoint.is_spurious() {
            tracing::warn!(port = checkpoint.port, "ignoring spurious global checkpoint");
            return;
        }
        let history = self.get_history(checkpoint.port);
        match history {
            Some(history) => history.handle_global_checkpoint(checkpoint),
            None => {
                tracing::error!(port = checkpoint.port, "global checkpoint for unknown port");
            }
        }
    }

    /// Sources dispatched but not yet acknowledged, across all threads.
    pub fn num_inflight_total(&self) -> usize {
        self.histories
            .lock()
            .values()
            .map(|h| h.num_inflight())
            .sum()
    }

    /// Reset every history for a protocol downgrade. Fails if any block was
    /// already acknowledged — those cannot be replayed at a new version.
    pub fn handle_version_mismatch(&self) -> ErrorCode {
        let histories: Vec<Arc<ThreadTransferHistory>> =
            self.histories.lock().values().cloned().collect();
        for history in &histories {
            if history.num_acked() > 0 {
                tracing::error!(
                    port = history.port(),
                    acked = history.num_acked(),
                    "blocks already acknowledged, cannot renegotiate version"
                );
                return ErrorCode::Error;
            }
        }
        for history in &histories {
            history.return_unacked_sources_to_queue();
        }
        ErrorCode::Ok
    }
}

impl Default for TransferHistoryController {
    fn default() -> Self {
        TransferHistoryController::new()
    }
}
