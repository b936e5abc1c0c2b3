//! Transfer request: everything the caller must pin down before a transfer
//! starts. Immutable once validated.

use std::fmt;
use std::path::PathBuf;

use rand::Rng;

use crate::error::ErrorCode;
use crate::protocol::{self, MAX_TRANSFER_ID_LENGTH};

/// Encryption scheme used by the socket layer. The engine itself only cares
/// whether the scheme produces an authentication tag (tag footers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum EncryptionType {
    None,
    AesGcm,
}

impl EncryptionType {
    /// Length of the authentication tag, 0 when the scheme has none.
    pub fn tag_len(self) -> usize {
        match self {
            EncryptionType::None => 0,
            EncryptionType::AesGcm => 16,
        }
    }
}

/// Encryption type plus secret. The secret must never appear in logs; the
/// `Debug` impl redacts it.
#[derive(Clone)]
pub struct EncryptionParams {
    pub enc_type: EncryptionType,
    secret: String,
}

impl EncryptionParams {
    pub fn none() -> EncryptionParams {
        EncryptionParams {
            enc_type: EncryptionType::None,
            secret: String::new(),
        }
    }

    pub fn new(enc_type: EncryptionType, secret: String) -> EncryptionParams {
        EncryptionParams { enc_type, secret }
    }

    pub fn is_set(&self) -> bool {
        self.enc_type != EncryptionType::None && !self.secret.is_empty()
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for EncryptionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionParams")
            .field("enc_type", &self.enc_type)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A file named explicitly by the caller, bypassing directory discovery.
#[derive(Debug, Clone)]
pub struct WdtFileInfo {
    /// Relative path of the file under the source directory.
    pub file_name: String,
    /// Expected size; -1 means stat it at discovery time.
    pub file_size: i64,
}

/// Input for one transfer. Validated by the sender before any thread starts.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Must match the receiver's id; empty ids get a random one assigned
    /// during validation.
    pub transfer_id: String,
    pub protocol_version: i32,
    /// Receiver ports; one sender thread per port.
    pub ports: Vec<i32>,
    pub host_name: String,
    /// Directory to read from.
    pub directory: PathBuf,
    /// Optional explicit file list.
    pub file_info: Vec<WdtFileInfo>,
    /// Use `file_info` even when it is empty (no directory traversal).
    pub disable_directory_traversal: bool,
    pub encryption: EncryptionParams,
}

impl TransferRequest {
    pub fn new(host_name: &str, directory: impl Into<PathBuf>, ports: Vec<i32>) -> TransferRequest {
        TransferRequest {
            transfer_id: String::new(),
            protocol_version: protocol::PROTOCOL_VERSION,
            ports,
            host_name: host_name.to_string(),
            directory: directory.into(),
            file_info: Vec::new(),
            disable_directory_traversal: false,
            encryption: EncryptionParams::none(),
        }
    }

    /// Build the `[start_port, start_port + num_ports)` port list.
    pub fn gen_ports_vector(start_port: i32, num_ports: i32) -> Vec<i32> {
        (0..num_ports).map(|i| start_port + i).collect()
    }

    /// Check the request and fill in defaults (random transfer id). Returns
    /// the first problem found.
    pub fn validate(&mut self) -> ErrorCode {
        if self.ports.is_empty() {
            return ErrorCode::InvalidRequest;
        }
        if self.host_name.is_empty() {
            return ErrorCode::InvalidRequest;
        }
        if protocol::negotiate_protocol(self.protocol_version, protocol::PROTOCOL_VERSION) == 0 {
            return ErrorCode::VersionIncompatible;
        }
        if self.transfer_id.is_empty() {
            self.transfer_id = gen_transfer_id();
        }
        if self.transfer_id.len() > MAX_TRANSFER_ID_LENGTH {
            return ErrorCode::InvalidRequest;
        }
        if self.encryption.enc_type != EncryptionType::None && self.encryption.secret().is_empty() {
            return ErrorCode::InvalidRequest;
        }
        if !self.disable_directory_traversal && self.file_info.is_empty() {
            if !self.directory.is_dir() {
                return ErrorCode::InvalidRequest;
            }
        }
        ErrorCode::Ok
    }

    /// Description safe to log: no secret material.
    pub fn log_safe_string(&self) -> String {
        format!(
            "transfer_id={} host={} ports={:?} dir={} protocol={} encryption={:?}",
            self.transfer_id,
            self.host_name,
            self.ports,
            self.directory.display(),
            self.protocol_version,
            self.encryption.enc_type,
        )
    }
}

fn gen_transfer_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}", rng.gen::<u64>())
}
