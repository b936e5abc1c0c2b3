//! Wire protocol codec for the transfer engine.
//!
//! Pure and stateless: frames are encoded by appending to a scratch buffer
//! and decoded from a byte slice with an explicit cursor. Every frame starts
//! with a one-byte command tag; multi-byte integers are little-endian and
//! variable-length integers are unsigned LEB128. Decoders return `None` as
//! soon as a field would run past the end of the input — callers treat that
//! as a protocol error.

use crate::error::ErrorCode;

/// Highest protocol version this sender speaks.
pub const PROTOCOL_VERSION: i32 = 30;
/// Oldest version the sender can fall back to during negotiation.
pub const MIN_PROTOCOL_VERSION: i32 = 21;

// Feature versions. A frame gated on one of these must not be emitted to a
// peer negotiated below it.
/// Receiver-side progress reporting (SIZE cmd) supported from here.
pub const RECEIVER_PROGRESS_REPORT_VERSION: i32 = 23;
/// CRC32C block footers supported from here.
pub const CHECKSUM_VERSION: i32 = 24;
/// Download resumption (file-chunks exchange) supported from here.
pub const DOWNLOAD_RESUMPTION_VERSION: i32 = 25;
/// Checkpoints carry partial-block seq-id / received-bytes from here.
pub const CHECKPOINT_SEQ_ID_VERSION: i32 = 26;
/// Encryption tags verified incrementally (tag footers) from here.
pub const INCREMENTAL_TAG_VERIFICATION_VERSION: i32 = 27;

/// Command tags. One byte on the wire, mnemonic ASCII values.
pub mod cmd {
    pub const DONE: u8 = 0x44; // D)one
    pub const FILE: u8 = 0x4C; // L)oad
    pub const WAIT: u8 = 0x57; // W)ait
    pub const ERR: u8 = 0x45; // E)rr
    pub const SETTINGS: u8 = 0x53; // S)ettings
    pub const ABORT: u8 = 0x41; // A)bort
    pub const CHUNKS: u8 = 0x43; // C)hunks
    pub const ACK: u8 = 0x61; // a)ck
    pub const SIZE: u8 = 0x5A; // si(Z)e
    pub const FOOTER: u8 = 0x46; // F)ooter
    // A checkpoint list starts with its entry count; a local checkpoint list
    // always holds exactly one entry, so 0x01 doubles as the command tag.
    pub const LOCAL_CHECKPOINT: u8 = 0x01;
}

/// Settings flag bits (byte trailing the SETTINGS frame).
pub mod settings_flag {
    pub const ENABLE_CHECKSUM: u8 = 1 << 0;
    pub const SEND_FILE_CHUNKS: u8 = 1 << 1;
    pub const BLOCK_MODE_DISABLED: u8 = 1 << 2;
}

/// Minimum number of bytes written for SETTINGS-with-chunks and DONE frames;
/// padding up to this unblocks receivers doing bulk reads.
pub const MIN_BUF_LENGTH: usize = 256;
/// ABORT payload: negotiated protocol (4) + error code (1) + seq-id (8).
pub const ABORT_FRAME_LEN: usize = 13;
/// Longest accepted transfer id.
pub const MAX_TRANSFER_ID_LENGTH: usize = 50;

/// Receiver-side allocation state of the file a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileAllocationStatus {
    NotExists = 0,
    ExistsCorrectSize = 1,
    ExistsTooLarge = 2,
    ExistsTooSmall = 3,
    ToBeDeleted = 4,
}

impl FileAllocationStatus {
    fn from_wire(b: u8) -> Option<FileAllocationStatus> {
        match b {
            0 => Some(FileAllocationStatus::NotExists),
            1 => Some(FileAllocationStatus::ExistsCorrectSize),
            2 => Some(FileAllocationStatus::ExistsTooLarge),
            3 => Some(FileAllocationStatus::ExistsTooSmall),
            4 => Some(FileAllocationStatus::ToBeDeleted),
            _ => None,
        }
    }
}

/// Per-block header payload of a FILE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDetails {
    /// Relative path of the file.
    pub file_name: String,
    /// Monotonic per-transfer id of the file.
    pub seq_id: i64,
    /// Total size of the file.
    pub file_size: i64,
    /// Offset of this block within the file.
    pub offset: i64,
    /// Number of data bytes following the header.
    pub data_size: i64,
    pub allocation_status: FileAllocationStatus,
    /// Seq-id of a previous transfer of the same path, for renames during
    /// resumption. 0 when unused.
    pub prev_seq_id: i64,
}

/// Position from which resumption is safe on one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub port: i32,
    /// Complete blocks durably accepted by the receiver; -1 signals the
    /// receiver failed after acking DONE.
    pub num_blocks: i64,
    /// Seq-id of the partially received block, -1 if none.
    pub last_block_seq_id: i64,
    /// Bytes received for the partial block.
    pub last_block_received_bytes: i64,
}

impl Checkpoint {
    pub fn new(port: i32) -> Checkpoint {
        Checkpoint {
            port,
            num_blocks: 0,
            last_block_seq_id: -1,
            last_block_received_bytes: 0,
        }
    }

    /// An all-zero checkpoint is a keep-alive marker and must not alter any
    /// sender state.
    pub fn is_spurious(&self) -> bool {
        self.num_blocks == 0 && self.last_block_received_bytes == 0
    }
}

/// SETTINGS frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub read_timeout_millis: u64,
    pub write_timeout_millis: u64,
    pub transfer_id: String,
    pub enable_checksum: bool,
    pub send_file_chunks: bool,
    pub block_mode_disabled: bool,
}

/// Byte range `[start, end)` within a file, already present at the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
}

impl Interval {
    pub fn size(&self) -> i64 {
        self.end - self.start
    }
}

/// Receiver-reported state of one file, used for download resumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunksInfo {
    pub seq_id: i64,
    pub file_name: String,
    pub file_size: i64,
    pub chunks: Vec<Interval>,
}

// ---------------------------------------------------------------------------
// varints and strings

pub fn encode_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub fn decode_varint(buf: &[u8], off: &mut usize) -> Option<u64> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*off)?;
        *off += 1;
        if shift >= 64 {
            return None;
        }
        v |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some(v);
        }
        shift += 7;
    }
}

fn encode_string(buf: &mut Vec<u8>, s: &str) {
    encode_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn decode_string(buf: &[u8], off: &mut usize) -> Option<String> {
    let len = decode_varint(buf, off)? as usize;
    let end = off.checked_add(len)?;
    let bytes = buf.get(*off..end)?;
    *off = end;
    String::from_utf8(bytes.to_vec()).ok()
}

fn decode_u8(buf: &[u8], off: &mut usize) -> Option<u8> {
    let b = *buf.get(*off)?;
    *off += 1;
    Some(b)
}

fn decode_i32_le(buf: &[u8], off: &mut usize) -> Option<i32> {
    let bytes = buf.get(*off..*off + 4)?;
    *off += 4;
    Some(i32::from_le_bytes(bytes.try_into().unwrap()))
}

fn decode_i64_le(buf: &[u8], off: &mut usize) -> Option<i64> {
    let bytes = buf.get(*off..*off + 8)?;
    *off += 8;
    Some(i64::from_le_bytes(bytes.try_into().unwrap()))
}

/// Zero-pad `buf` up to `len`. Frames that unblock bulk receiver reads
/// (SETTINGS when chunks follow, DONE) are written padded.
pub fn pad_to(buf: &mut Vec<u8>, len: usize) {
    if buf.len() < len {
        buf.resize(len, 0);
    }
}

// ---------------------------------------------------------------------------
// negotiation

/// Decide which version to run against a peer requesting
/// `requested_version`. Returns the highest version both sides speak, or 0
/// when the request is below the oldest supported version.
pub fn negotiate_protocol(requested_version: i32, cur_version: i32) -> i32 {
    if requested_version < MIN_PROTOCOL_VERSION {
        return 0;
    }
    requested_version.min(cur_version)
}

// ---------------------------------------------------------------------------
// checkpoints

fn checkpoint_len(protocol_version: i32) -> usize {
    if protocol_version >= CHECKPOINT_SEQ_ID_VERSION {
        4 + 4 + 8 + 8
    } else {
        4 + 4
    }
}

/// Exact length of a local-checkpoint frame (count byte + one entry) at a
/// given version. READ_LOCAL_CHECKPOINT reads precisely this many bytes.
pub fn max_local_checkpoint_len(protocol_version: i32) -> usize {
    1 + checkpoint_len(protocol_version)
}

pub fn encode_checkpoints(protocol_version: i32, buf: &mut Vec<u8>, checkpoints: &[Checkpoint]) {
    encode_varint(buf, checkpoints.len() as u64);
    for cp in checkpoints {
        buf.extend_from_slice(&cp.port.to_le_bytes());
        buf.extend_from_slice(&(cp.num_blocks as i32).to_le_bytes());
        if protocol_version >= CHECKPOINT_SEQ_ID_VERSION {
            buf.extend_from_slice(&cp.last_block_seq_id.to_le_bytes());
            buf.extend_from_slice(&cp.last_block_received_bytes.to_le_bytes());
        }
    }
}

pub fn decode_checkpoints(
    protocol_version: i32,
    buf: &[u8],
    off: &mut usize,
) -> Option<Vec<Checkpoint>> {
    let count = decode_varint(buf, off)?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let port = decode_i32_le(buf, off)?;
        let num_blocks = i64::from(decode_i32_le(buf, off)?);
        let mut cp = Checkpoint {
            port,
            num_blocks,
            last_block_seq_id: -1,
            last_block_received_bytes: 0,
        };
        if protocol_version >= CHECKPOINT_SEQ_ID_VERSION {
            cp.last_block_seq_id = decode_i64_le(buf, off)?;
            cp.last_block_received_bytes = decode_i64_le(buf, off)?;
        }
        out.push(cp);
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// frame payloads

/// FILE header payload (the bytes behind the 2-byte length field).
pub fn encode_header(_protocol_version: i32, buf: &mut Vec<u8>, details: &BlockDetails) {
    encode_string(buf, &details.file_name);
    encode_varint(buf, details.seq_id as u64);
    encode_varint(buf, details.file_size as u64);
    encode_varint(buf, details.offset as u64);
    encode_varint(buf, details.data_size as u64);
    buf.push(details.allocation_status as u8);
    encode_varint(buf, details.prev_seq_id as u64);
}

pub fn decode_header(_protocol_version: i32, buf: &[u8], off: &mut usize) -> Option<BlockDetails> {
    let file_name = decode_string(buf, off)?;
    let seq_id = decode_varint(buf, off)? as i64;
    let file_size = decode_varint(buf, off)? as i64;
    let offset = decode_varint(buf, off)? as i64;
    let data_size = decode_varint(buf, off)? as i64;
    let allocation_status = FileAllocationStatus::from_wire(decode_u8(buf, off)?)?;
    let prev_seq_id = decode_varint(buf, off)? as i64;
    Some(BlockDetails {
        file_name,
        seq_id,
        file_size,
        offset,
        data_size,
        allocation_status,
        prev_seq_id,
    })
}

pub fn encode_settings(_protocol_version: i32, buf: &mut Vec<u8>, settings: &Settings) {
    encode_varint(buf, settings.read_timeout_millis);
    encode_varint(buf, settings.write_timeout_millis);
    encode_string(buf, &settings.transfer_id);
    let mut flags = 0u8;
    if settings.enable_checksum {
        flags |= settings_flag::ENABLE_CHECKSUM;
    }
    if settings.send_file_chunks {
        flags |= settings_flag::SEND_FILE_CHUNKS;
    }
    if settings.block_mode_disabled {
        flags |= settings_flag::BLOCK_MODE_DISABLED;
    }
    buf.push(flags);
}

pub fn decode_settings(_protocol_version: i32, buf: &[u8], off: &mut usize) -> Option<Settings> {
    let read_timeout_millis = decode_varint(buf, off)?;
    let write_timeout_millis = decode_varint(buf, off)?;
    let transfer_id = decode_string(buf, off)?;
    let flags = decode_u8(buf, off)?;
    Some(Settings {
        read_timeout_millis,
        write_timeout_millis,
        transfer_id,
        enable_checksum: flags & settings_flag::ENABLE_CHECKSUM != 0,
        send_file_chunks: flags & settings_flag::SEND_FILE_CHUNKS != 0,
        block_mode_disabled: flags & settings_flag::BLOCK_MODE_DISABLED != 0,
    })
}

/// DONE payload after the command and status bytes.
pub fn encode_done(_protocol_version: i32, buf: &mut Vec<u8>, num_blocks: i64, total_bytes: i64) {
    encode_varint(buf, num_blocks as u64);
    encode_varint(buf, total_bytes as u64);
}

pub fn decode_done(_protocol_version: i32, buf: &[u8], off: &mut usize) -> Option<(i64, i64)> {
    let num_blocks = decode_varint(buf, off)? as i64;
    let total_bytes = decode_varint(buf, off)? as i64;
    Some((num_blocks, total_bytes))
}

pub fn encode_size(buf: &mut Vec<u8>, total_bytes: i64) {
    encode_varint(buf, total_bytes as u64);
}

pub fn decode_size(buf: &[u8], off: &mut usize) -> Option<i64> {
    Some(decode_varint(buf, off)? as i64)
}

/// Footer carrying the rolling CRC32C of the preceding block.
pub fn encode_footer_checksum(buf: &mut Vec<u8>, checksum: u32) {
    buf.extend_from_slice(&checksum.to_le_bytes());
}

pub fn decode_footer_checksum(buf: &[u8], off: &mut usize) -> Option<u32> {
    let bytes = buf.get(*off..*off + 4)?;
    *off += 4;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Footer carrying the connection's current encryption authentication tag.
pub fn encode_footer_tag(buf: &mut Vec<u8>, tag: &[u8]) {
    encode_varint(buf, tag.len() as u64);
    buf.extend_from_slice(tag);
}

pub fn decode_footer_tag(buf: &[u8], off: &mut usize) -> Option<Vec<u8>> {
    let len = decode_varint(buf, off)? as usize;
    let end = off.checked_add(len)?;
    let bytes = buf.get(*off..end)?;
    *off = end;
    Some(bytes.to_vec())
}

pub fn encode_abort(buf: &mut Vec<u8>, protocol_version: i32, err: ErrorCode, seq_id: i64) {
    buf.extend_from_slice(&protocol_version.to_le_bytes());
    buf.push(err.to_wire());
    buf.extend_from_slice(&seq_id.to_le_bytes());
}

pub fn decode_abort(buf: &[u8], off: &mut usize) -> Option<(i32, ErrorCode, i64)> {
    let version = decode_i32_le(buf, off)?;
    let err = ErrorCode::from_wire(decode_u8(buf, off)?);
    let seq_id = decode_i64_le(buf, off)?;
    Some((version, err, seq_id))
}

pub fn encode_chunks_cmd(buf: &mut Vec<u8>, buf_size: i64, num_files: i64) {
    encode_varint(buf, buf_size as u64);
    encode_varint(buf, num_files as u64);
}

pub fn decode_chunks_cmd(buf: &[u8], off: &mut usize) -> Option<(i64, i64)> {
    let buf_size = decode_varint(buf, off)? as i64;
    let num_files = decode_varint(buf, off)? as i64;
    Some((buf_size, num_files))
}

fn encode_file_chunks_info(buf: &mut Vec<u8>, info: &FileChunksInfo) {
    encode_varint(buf, info.seq_id as u64);
    encode_string(buf, &info.file_name);
    encode_varint(buf, info.file_size as u64);
    encode_varint(buf, info.chunks.len() as u64);
    for chunk in &info.chunks {
        encode_varint(buf, chunk.start as u64);
        encode_varint(buf, chunk.end as u64);
    }
}

fn decode_file_chunks_info(buf: &[u8], off: &mut usize) -> Option<FileChunksInfo> {
    let seq_id = decode_varint(buf, off)? as i64;
    let file_name = decode_string(buf, off)?;
    let file_size = decode_varint(buf, off)? as i64;
    let num_chunks = decode_varint(buf, off)?;
    let mut chunks = Vec::with_capacity(num_chunks as usize);
    for _ in 0..num_chunks {
        let start = decode_varint(buf, off)? as i64;
        let end = decode_varint(buf, off)? as i64;
        if end < start {
            return None;
        }
        chunks.push(Interval { start, end });
    }
    Some(FileChunksInfo {
        seq_id,
        file_name,
        file_size,
        chunks,
    })
}

/// Encode as many entries from `list[start_index..]` as fit in `buf_size`
/// bytes. Returns the number of entries written. At least one entry is
/// always written so an oversized single entry cannot stall the stream.
pub fn encode_file_chunks_info_list(
    buf: &mut Vec<u8>,
    buf_size: usize,
    start_index: usize,
    list: &[FileChunksInfo],
) -> usize {
    let mut written = 0;
    for info in &list[start_index..] {
        let before = buf.len();
        encode_file_chunks_info(buf, info);
        if written > 0 && buf.len() > buf_size {
            buf.truncate(before);
            break;
        }
        written += 1;
    }
    written
}

/// Decode entries until `len` bytes of `buf` (from `off`) are consumed,
/// appending to `out`. Returns `None` on any malformed entry.
pub fn decode_file_chunks_info_list(
    buf: &[u8],
    off: &mut usize,
    len: usize,
    out: &mut Vec<FileChunksInfo>,
) -> Option<()> {
    let end = off.checked_add(len)?;
    if end > buf.len() {
        return None;
    }
    while *off < end {
        out.push(decode_file_chunks_info(&buf[..end], off)?);
    }
    Some(())
}
