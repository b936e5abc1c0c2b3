//! wdt — send a directory tree to a running receiver over N parallel TCP
//! connections.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use wdt::report::BarProgressReporter;
use wdt::transfer_request::{EncryptionParams, EncryptionType};
use wdt::{Sender, TransferRequest, WdtOptions};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Warp data transfer: parallel-connection directory sender"
)]
struct Args {
    /// Destination host to send to
    host: String,

    /// Source directory
    #[arg(short, long, default_value = ".")]
    directory: PathBuf,

    /// First destination port
    #[arg(long, default_value_t = 22356)]
    start_port: i32,

    /// Number of ports / parallel connections
    #[arg(long, default_value_t = 8)]
    num_ports: i32,

    /// Transfer id, must match the receiver (random if omitted)
    #[arg(long)]
    transfer_id: Option<String>,

    /// Protocol version to start negotiating from
    #[arg(long)]
    protocol_version: Option<i32>,

    /// Block size in Mbytes; 0 disables splitting files into blocks
    #[arg(long, default_value_t = 16)]
    block_size_mbytes: i64,

    /// Throttle the average send rate (Mbytes/sec); off when <= 0
    #[arg(long, default_value_t = -1.0)]
    avg_mbytes_per_sec: f64,

    /// Disable the CRC32C footer after each block
    #[arg(long)]
    no_checksum: bool,

    /// Resume: ask the receiver which chunks it already has and skip them
    #[arg(long)]
    resume: bool,

    /// Encryption secret (enables AES-GCM framing on capable sockets)
    #[arg(long, env = "WDT_ENCRYPTION_SECRET", hide_env_values = true)]
    encryption_secret: Option<String>,

    /// Only send these files (relative paths), skipping directory discovery
    #[arg(long = "file")]
    files: Vec<String>,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Suppress the progress bar
    #[arg(short, long)]
    quiet: bool,
}

fn run(args: Args) -> Result<wdt::TransferReport> {
    let ports = TransferRequest::gen_ports_vector(args.start_port, args.num_ports);
    let mut request = TransferRequest::new(&args.host, args.directory, ports);
    if let Some(id) = args.transfer_id {
        request.transfer_id = id;
    }
    if let Some(version) = args.protocol_version {
        request.protocol_version = version;
    }
    if let Some(secret) = args.encryption_secret {
        request.encryption = EncryptionParams::new(EncryptionType::AesGcm, secret);
    }
    request.file_info = args
        .files
        .iter()
        .map(|name| wdt::transfer_request::WdtFileInfo {
            file_name: name.clone(),
            file_size: -1,
        })
        .collect();

    let options = WdtOptions {
        block_size_mbytes: args.block_size_mbytes,
        avg_mbytes_per_sec: args.avg_mbytes_per_sec,
        enable_checksum: !args.no_checksum,
        enable_download_resumption: args.resume,
        ..WdtOptions::default()
    };

    let mut sender = Sender::new(request, options).context("failed to set up transfer")?;
    if !args.quiet && !args.json {
        sender.set_progress_reporter(Box::new(BarProgressReporter::new()));
    }
    sender.transfer()
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();
    let json = args.json;
    match run(args) {
        Ok(report) => {
            if json {
                match serde_json::to_string_pretty(&report) {
                    Ok(out) => println!("{out}"),
                    Err(e) => eprintln!("failed to serialize report: {e}"),
                }
            } else {
                println!("{report}");
            }
            if report.error_code.is_ok() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("wdt: {e:#}");
            ExitCode::FAILURE
        }
    }
}
