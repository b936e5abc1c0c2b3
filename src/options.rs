//! Tunables for the sender engine. Plain struct, no global state; the CLI
//! fills one in from flags and everything downstream receives a copy.

#[derive(Debug, Clone)]
pub struct WdtOptions {
    /// Connection attempts per CONNECT state before giving up.
    pub max_retries: i32,
    /// Back-off between connection attempts (not applied after the last).
    pub sleep_millis: u64,
    /// Reconnects tolerated without the peer's checkpoint advancing.
    pub max_transfer_retries: i32,
    /// Socket read timeout advertised to the receiver and used locally.
    pub read_timeout_millis: u64,
    /// Socket write timeout advertised to the receiver and used locally.
    pub write_timeout_millis: u64,
    /// How often blocking socket ops poll the abort checker.
    pub abort_check_interval_millis: u64,
    /// Extra wait granted to the receiver after our send buffer drains.
    pub drain_extra_ms: u64,
    /// TCP connect timeout.
    pub connect_timeout_millis: u64,
    /// Whether to append a CRC32C footer after each block (protocol
    /// permitting).
    pub enable_checksum: bool,
    /// Block size for splitting large files; <= 0 disables block mode.
    pub block_size_mbytes: i64,
    /// Read-chunk buffer size per byte source.
    pub buffer_size: usize,
    /// Average throttle rate; <= 0 disables throttling.
    pub avg_mbytes_per_sec: f64,
    /// Ask the receiver for previously transferred chunks and skip them.
    pub enable_download_resumption: bool,
    /// Interval between progress reports; 0 disables the reporter thread.
    pub progress_report_interval_millis: u64,
    /// Socket send/receive buffer size hint, 0 leaves the OS default.
    pub socket_buffer_size: i32,
}

impl Default for WdtOptions {
    fn default() -> Self {
        WdtOptions {
            max_retries: 20,
            sleep_millis: 50,
            max_transfer_retries: 3,
            read_timeout_millis: 5_000,
            write_timeout_millis: 5_000,
            abort_check_interval_millis: 200,
            drain_extra_ms: 500,
            connect_timeout_millis: 2_000,
            enable_checksum: true,
            block_size_mbytes: 16,
            buffer_size: 256 * 1024,
            avg_mbytes_per_sec: -1.0,
            enable_download_resumption: false,
            progress_report_interval_millis: 1_000,
            socket_buffer_size: 0,
        }
    }
}

impl WdtOptions {
    /// Block size in bytes, or 0 when block mode is disabled.
    pub fn block_size_bytes(&self) -> i64 {
        if self.block_size_mbytes <= 0 {
            0
        } else {
            self.block_size_mbytes * 1024 * 1024
        }
    }
}
