//! Error types for the kernelbox crate.

use crate::schema::ErrorContent;
use crate::utils::clean_ansi_codes;

/// Errors produced by sandbox managers and boxes.
#[derive(Debug, thiserror::Error)]
pub enum BoxError {
    /// The requested kernel id is not registered with this manager.
    #[error("kernel not found: {kernel_id}")]
    KernelNotFound { kernel_id: String },

    /// The kernel reported a failure while executing the submitted code.
    ///
    /// Display renders the ANSI-cleaned traceback the kernel produced, so
    /// the message reads like the interpreter's own output.
    #[error("{}", render_traceback(.ename, .evalue, .traceback))]
    Execution {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },

    /// No reply arrived before the deadline.
    #[error("kernel execution timed out after {limit_ms}ms")]
    ExecutionTimeout { limit_ms: u64 },

    /// The kernel did not finish its readiness handshake in time.
    #[error("kernel startup timed out after {limit_ms}ms")]
    StartupTimeout { limit_ms: u64 },

    /// A locally managed kernel process exited underneath us.
    #[error("kernel {kernel_id} exited unexpectedly ({status})")]
    KernelExited { kernel_id: String, status: String },

    /// The gateway answered with a non-success HTTP status.
    #[error("gateway request failed with status {status}: {body}")]
    Gateway { status: u16, body: String },

    #[error("gateway transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("kernel channel error: {0}")]
    Channel(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("wire format error: {0}")]
    Wire(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for sandbox operations.
pub type BoxResult<T> = std::result::Result<T, BoxError>;

impl BoxError {
    /// Build an [`BoxError::Execution`] from kernel-reported error content.
    pub fn from_error_content(content: ErrorContent) -> Self {
        BoxError::Execution {
            ename: content.ename,
            evalue: content.evalue,
            traceback: content.traceback,
        }
    }
}

fn render_traceback(ename: &str, evalue: &str, traceback: &[String]) -> String {
    if traceback.is_empty() {
        return format!("{ename}: {evalue}");
    }
    traceback
        .iter()
        .map(|line| clean_ansi_codes(line))
        .collect::<Vec<_>>()
        .join("\n")
}
