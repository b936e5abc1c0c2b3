//! Transfer report and progress reporting seam.

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::error::ErrorCode;
use crate::stats::TransferStats;

/// Final outcome of a transfer, aggregated over all threads.
#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub transfer_id: String,
    /// OK iff every discovered block was acknowledged on some connection.
    pub error_code: ErrorCode,
    /// Protocol version in force at the end (may differ from the requested
    /// one after negotiation).
    pub protocol_version: i32,
    pub summary: TransferStats,
    pub thread_stats: Vec<TransferStats>,
    pub total_file_size: i64,
    pub num_blocks_discovered: i64,
    pub failed_sources: Vec<String>,
    pub total_time_secs: f64,
    pub throughput_mbytes_per_sec: f64,
}

impl std::fmt::Display for TransferReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} bytes in {:.3}s ({:.2} Mbytes/sec), {} blocks, id {}",
            self.error_code,
            self.summary.effective_data_bytes(),
            self.total_time_secs,
            self.throughput_mbytes_per_sec,
            self.summary.num_blocks(),
            self.transfer_id,
        )?;
        if !self.failed_sources.is_empty() {
            write!(f, ", failed sources: {:?}", self.failed_sources)?;
        }
        Ok(())
    }
}

/// Periodic snapshot handed to the progress reporter.
#[derive(Debug, Clone, Copy)]
pub struct TransferProgress {
    pub effective_data_bytes: i64,
    pub total_size: i64,
    pub discovery_finished: bool,
    pub num_blocks: i64,
}

/// Seam for progress display; the default renders an indicatif byte bar.
pub trait ProgressReporter: Send {
    fn progress(&mut self, progress: &TransferProgress);
    fn done(&mut self, report: &TransferReport);
}

pub struct BarProgressReporter {
    bar: ProgressBar,
}

impl BarProgressReporter {
    pub fn new() -> BarProgressReporter {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{bytes}/{total_bytes} [{bar:40.green/dim}] {bytes_per_sec} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        BarProgressReporter { bar }
    }
}

impl Default for BarProgressReporter {
    fn default() -> Self {
        BarProgressReporter::new()
    }
}

impl ProgressReporter for BarProgressReporter {
    fn progress(&mut self, progress: &TransferProgress) {
        self.bar.set_length(progress.total_size.max(0) as u64);
        self.bar
            .set_position(progress.effective_data_bytes.clamp(0, i64::MAX) as u64);
        if !progress.discovery_finished {
            self.bar.set_message("(discovering)");
        } else {
            self.bar.set_message("");
        }
    }

    fn done(&mut self, report: &TransferReport) {
        self.bar.finish_and_clear();
        if report.error_code.is_ok() {
            tracing::info!(%report, "transfer complete");
        } else {
            tracing::error!(%report, "transfer failed");
        }
    }
}
