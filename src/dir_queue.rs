//! Directory source queue: discovers the tree on its own thread, splits
//! files into blocks and feeds sender threads one opened source at a time.
//!
//! N consumers pull with `get_next_source`, which blocks while discovery is
//! still running and the queue is momentarily empty. Threads whose
//! connection died push their un-acknowledged sources back with
//! `return_to_queue`, so any sibling can retry them.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use walkdir::WalkDir;

use crate::error::ErrorCode;
use crate::protocol::{FileAllocationStatus, FileChunksInfo, Interval};
use crate::socket::AbortChecker;
use crate::source::{ByteSource, FileByteSource, SourceMetaData};
use crate::transfer_request::WdtFileInfo;

pub struct DirectorySourceQueue {
    root: PathBuf,
    file_info: Vec<WdtFileInfo>,
    disable_directory_traversal: bool,
    block_size: i64,
    /// When true, discovery waits for the receiver's chunks list before
    /// enumerating (download resumption).
    wait_for_chunks: bool,
    state: Mutex<QueueState>,
    cond: Condvar,
}

struct QueueState {
    sources: VecDeque<Box<dyn ByteSource>>,
    discovery_finished: bool,
    num_blocks_discovered: i64,
    total_size: i64,
    status: ErrorCode,
    next_seq_id: i64,
    chunks_received: bool,
    previously_received: HashMap<String, FileChunksInfo>,
    failed_sources: Vec<String>,
}

impl DirectorySourceQueue {
    pub fn new(
        root: PathBuf,
        file_info: Vec<WdtFileInfo>,
        disable_directory_traversal: bool,
        block_size: i64,
        wait_for_chunks: bool,
    ) -> DirectorySourceQueue {
        DirectorySourceQueue {
            root,
            file_info,
            disable_directory_traversal,
            block_size,
            wait_for_chunks,
            state: Mutex::new(QueueState {
                sources: VecDeque::new(),
                discovery_finished: false,
                num_blocks_discovered: 0,
                total_size: 0,
                status: ErrorCode::Ok,
                next_seq_id: 0,
                chunks_received: false,
                previously_received: HashMap::new(),
                failed_sources: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Enumerate the tree and fill the queue. Runs on the discovery thread;
    /// returns when every file has been turned into sources (or the abort
    /// checker fired).
    pub fn build_queue(&self, abort: &dyn AbortChecker) -> ErrorCode {
        if self.wait_for_chunks {
            let mut state = self.state.lock();
            while !state.chunks_received {
                if abort.should_abort() {
                    state.discovery_finished = true;
                    self.cond.notify_all();
                    return ErrorCode::Abort;
                }
                let _ = self
                    .cond
                    .wait_for(&mut state, Duration::from_millis(100));
            }
        }
        let files = self.enumerate(abort);
        for (rel_path, full_path, size) in files {
            if abort.should_abort() {
                break;
            }
            self.enqueue_file(rel_path, full_path, size);
        }
        let mut state = self.state.lock();
        state.discovery_finished = true;
        self.cond.notify_all();
        tracing::info!(
            blocks = state.num_blocks_discovered,
            bytes = state.total_size,
            "file discovery finished"
        );
        state.status
    }

    fn enumerate(&self, abort: &dyn AbortChecker) -> Vec<(String, PathBuf, i64)> {
        let mut out = Vec::new();
        if self.disable_directory_traversal || !self.file_info.is_empty() {
            for info in &self.file_info {
                let full_path = self.root.join(&info.file_name);
                let size = if info.file_size >= 0 {
                    info.file_size
                } else {
                    match std::fs::metadata(&full_path) {
                        Ok(md) => md.len() as i64,
                        Err(e) => {
                            tracing::error!(path = %full_path.display(), error = %e,
                                "failed to stat listed file");
                            let mut state = self.state.lock();
                            state.status = ErrorCode::ByteSourceReadError;
                            state.failed_sources.push(info.file_name.clone());
                            continue;
                        }
                    }
                };
                out.push((info.file_name.clone(), full_path, size));
            }
            return out;
        }
        for entry in WalkDir::new(&self.root).follow_links(false) {
            if abort.should_abort() {
                break;
            }
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::error!(error = %e, "directory walk error");
                    self.state.lock().status = ErrorCode::ByteSourceReadError;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let full_path = entry.path().to_path_buf();
            let rel_path = match full_path.strip_prefix(&self.root) {
                Ok(p) => p.to_string_lossy().into_owned(),
                Err(_) => continue,
            };
            match entry.metadata() {
                Ok(md) => out.push((rel_path, full_path, md.len() as i64)),
                Err(e) => {
                    tracing::error!(path = %full_path.display(), error = %e, "stat failed");
                    let mut state = self.state.lock();
                    state.status = ErrorCode::ByteSourceReadError;
                    state.failed_sources.push(rel_path);
                }
            }
        }
        // Deterministic dispatch order regardless of filesystem iteration.
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn enqueue_file(&self, rel_path: String, full_path: PathBuf, size: i64) {
        let mut state = self.state.lock();
        let previous = state.previously_received.get(&rel_path).cloned();
        let (seq_id, prev_seq_id, allocation_status, ranges) = match previous {
            None => {
                let seq_id = state.next_seq_id;
                state.next_seq_id += 1;
                (
                    seq_id,
                    0,
                    FileAllocationStatus::NotExists,
                    vec![Interval { start: 0, end: size }],
                )
            }
            Some(info) if info.file_size == size => {
                // Same size as last time: keep the receiver's seq-id and only
                // send the holes.
                let ranges = remaining_ranges(size, &info.chunks);
                (
                    info.seq_id,
                    0,
                    FileAllocationStatus::ExistsCorrectSize,
                    ranges,
                )
            }
            Some(info) => {
                let seq_id = state.next_seq_id;
                state.next_seq_id += 1;
                let status = if info.file_size > size {
                    FileAllocationStatus::ExistsTooLarge
                } else {
                    FileAllocationStatus::ExistsTooSmall
                };
                (
                    seq_id,
                    info.seq_id,
                    status,
                    vec![Interval { start: 0, end: size }],
                )
            }
        };
        let metadata = Arc::new(SourceMetaData {
            full_path,
            rel_path,
            seq_id,
            size,
            allocation_status,
            prev_seq_id,
        });
        for range in ranges {
            let mut offset = range.start;
            while offset < range.end {
                let block = if self.block_size > 0 {
                    std::cmp::min(self.block_size, range.end - offset)
                } else {
                    range.end - offset
                };
                state.sources.push_back(Box::new(FileByteSource::new(
                    Arc::clone(&metadata),
                    block,
                    offset,
                )));
                state.num_blocks_discovered += 1;
                state.total_size += block;
                offset += block;
            }
        }
        // Zero-byte files still need one block so the receiver creates them.
        if size == 0 {
            state
                .sources
                .push_back(Box::new(FileByteSource::new(metadata, 0, 0)));
            state.num_blocks_discovered += 1;
        }
        self.cond.notify_all();
    }

    /// Pull (and open) the next source. Blocks while the queue is empty and
    /// discovery is still running. The returned status is the queue's
    /// transfer status so far, which travels in FILE and DONE frames.
    pub fn get_next_source(
        &self,
        buffer_size: usize,
        abort: &dyn AbortChecker,
    ) -> (Option<Box<dyn ByteSource>>, ErrorCode) {
        loop {
            let mut state = self.state.lock();
            if let Some(mut source) = state.sources.pop_front() {
                let status = state.status;
                drop(state);
                if source.open(buffer_size) != ErrorCode::Ok {
                    let mut state = self.state.lock();
                    state.status = ErrorCode::ByteSourceReadError;
                    state.failed_sources.push(source.identifier().to_string());
                    continue;
                }
                return (Some(source), status);
            }
            if state.discovery_finished || abort.should_abort() {
                return (None, state.status);
            }
            let _ = self.cond.wait_for(&mut state, Duration::from_millis(100));
        }
    }

    /// Re-enqueue sources whose bytes the receiver has not acknowledged.
    /// They go to the front so a retry happens before new work.
    pub fn return_to_queue(&self, sources: Vec<Box<dyn ByteSource>>) {
        let mut state = self.state.lock();
        for source in sources.into_iter().rev() {
            state.sources.push_front(source);
        }
        self.cond.notify_all();
    }

    pub fn file_discovery_finished(&self) -> bool {
        self.state.lock().discovery_finished
    }

    pub fn get_num_blocks_and_status(&self) -> (i64, ErrorCode) {
        let state = self.state.lock();
        (state.num_blocks_discovered, state.status)
    }

    pub fn get_total_size(&self) -> i64 {
        self.state.lock().total_size
    }

    pub fn num_remaining_sources(&self) -> usize {
        self.state.lock().sources.len()
    }

    pub fn failed_sources(&self) -> Vec<String> {
        self.state.lock().failed_sources.clone()
    }

    /// Deliver the receiver's already-transferred chunks (download
    /// resumption). Unblocks a discovery thread waiting on it.
    pub fn set_previously_received_chunks(&self, list: Vec<FileChunksInfo>) {
        let mut state = self.state.lock();
        for info in list {
            state
                .previously_received
                .insert(info.file_name.clone(), info);
        }
        state.chunks_received = true;
        self.cond.notify_all();
    }
}

/// Complement of `chunks` within `[0, size)`.
fn remaining_ranges(size: i64, chunks: &[Interval]) -> Vec<Interval> {
    let mut sorted: Vec<Interval> = chunks.to_vec();
    sorted.sort_by_key(|c| c.start);
    let mut out = Vec::new();
    let mut cursor = 0;
    for chunk in sorted {
        if chunk.start > cursor {
            out.push(Interval {
                start: cursor,
                end: chunk.start.min(size),
            });
        }
        cursor = cursor.max(chunk.end);
        if cursor >= size {
            break;
        }
    }
    if cursor < size {
        out.push(Interval {
            start: cursor,
            end: size,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct NeverAbort;
    impl AbortChecker for NeverAbort {
        fn should_abort(&self) -> bool {
            false
        }
    }

    fn write_file(dir: &std::path::Path, rel: &str, size: usize) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(&vec![0xAB; size]).unwrap();
    }

    #[test]
    fn discovers_and_drains_tree() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.bin", 100);
        write_file(dir.path(), "sub/b.bin", 200);
        let queue =
            DirectorySourceQueue::new(dir.path().to_path_buf(), vec![], false, 0, false);
        queue.build_queue(&NeverAbort);
        assert!(queue.file_discovery_finished());
        assert_eq!(queue.get_total_size(), 300);
        let (blocks, status) = queue.get_num_blocks_and_status();
        assert_eq!(blocks, 2);
        assert_eq!(status, ErrorCode::Ok);

        let mut names = Vec::new();
        loop {
            let (source, _) = queue.get_next_source(64, &NeverAbort);
            match source {
                Some(s) => names.push(s.identifier().to_string()),
                None => break,
            }
        }
        names.sort();
        assert_eq!(names, vec!["a.bin", "sub/b.bin"]);
    }

    #[test]
    fn splits_large_files_into_blocks() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "big.bin", 1000);
        let queue =
            DirectorySourceQueue::new(dir.path().to_path_buf(), vec![], false, 256, false);
        queue.build_queue(&NeverAbort);
        let (blocks, _) = queue.get_num_blocks_and_status();
        assert_eq!(blocks, 4);
        let mut total = 0;
        let mut seq_ids = std::collections::HashSet::new();
        loop {
            let (source, _) = queue.get_next_source(64, &NeverAbort);
            match source {
                Some(s) => {
                    total += s.size();
                    seq_ids.insert(s.metadata().seq_id);
                }
                None => break,
            }
        }
        assert_eq!(total, 1000);
        // All blocks of one file share its seq id.
        assert_eq!(seq_ids.len(), 1);
    }

    #[test]
    fn consumer_blocks_until_discovery_produces() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "late.bin", 10);
        let queue = Arc::new(DirectorySourceQueue::new(
            dir.path().to_path_buf(),
            vec![],
            false,
            0,
            false,
        ));
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                let (source, _) = queue.get_next_source(64, &NeverAbort);
                source.map(|s| s.identifier().to_string())
            })
        };
        std::thread::sleep(Duration::from_millis(100));
        queue.build_queue(&NeverAbort);
        assert_eq!(consumer.join().unwrap().as_deref(), Some("late.bin"));
    }

    #[test]
    fn returned_sources_are_retried_first() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.bin", 10);
        write_file(dir.path(), "b.bin", 10);
        let queue =
            DirectorySourceQueue::new(dir.path().to_path_buf(), vec![], false, 0, false);
        queue.build_queue(&NeverAbort);
        let (first, _) = queue.get_next_source(64, &NeverAbort);
        let first = first.unwrap();
        assert_eq!(first.identifier(), "a.bin");
        queue.return_to_queue(vec![first]);
        let (again, _) = queue.get_next_source(64, &NeverAbort);
        assert_eq!(again.unwrap().identifier(), "a.bin");
    }

    #[test]
    fn explicit_file_list_skips_traversal() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "keep.bin", 10);
        write_file(dir.path(), "skip.bin", 10);
        let queue = DirectorySourceQueue::new(
            dir.path().to_path_buf(),
            vec![WdtFileInfo {
                file_name: "keep.bin".into(),
                file_size: -1,
            }],
            false,
            0,
            false,
        );
        queue.build_queue(&NeverAbort);
        let (blocks, _) = queue.get_num_blocks_and_status();
        assert_eq!(blocks, 1);
    }

    #[test]
    fn resumption_sends_only_missing_ranges() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "part.bin", 100);
        let queue = Arc::new(DirectorySourceQueue::new(
            dir.path().to_path_buf(),
            vec![],
            false,
            0,
            true,
        ));
        queue.set_previously_received_chunks(vec![FileChunksInfo {
            seq_id: 7,
            file_name: "part.bin".into(),
            file_size: 100,
            chunks: vec![Interval { start: 0, end: 60 }],
        }]);
        queue.build_queue(&NeverAbort);
        let (source, _) = queue.get_next_source(64, &NeverAbort);
        let source = source.unwrap();
        assert_eq!(source.offset(), 60);
        assert_eq!(source.size(), 40);
        // Receiver's seq-id is kept for same-size resumption.
        assert_eq!(source.metadata().seq_id, 7);
    }

    #[test]
    fn remaining_ranges_complement() {
        let chunks = vec![
            Interval { start: 10, end: 20 },
            Interval { start: 40, end: 50 },
        ];
        let ranges = remaining_ranges(60, &chunks);
        assert_eq!(
            ranges,
            vec![
                Interval { start: 0, end: 10 },
                Interval { start: 20, end: 40 },
                Interval { start: 50, end: 60 },
            ]
        );
    }
}
