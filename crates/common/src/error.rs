//! Error types for vpncd

use thiserror::Error;

/// Result type alias using the vpncd `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// vpncd error taxonomy
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bad/missing/out-of-range tenant or service YAML. Never fatal except
    /// for the DEFAULT file at startup.
    #[error("schema error in {file}: {message}")]
    Schema { file: String, message: String },

    /// netlink EBUSY/ENOENT-class races. Caller retries a bounded number of
    /// times; if still failing, log and move on.
    #[error("transient kernel error during {op}: {source}")]
    TransientKernel {
        op: String,
        #[source]
        source: std::io::Error,
    },

    /// Operator input is structurally invalid (oversized NPTv6 route,
    /// duplicate connection id, filename/id mismatch, ...). Drop the
    /// offending element, continue with the rest.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Rejected netlink/CLI argument. Aborts reconciliation for the
    /// affected network instance only.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("VICI error: {0}")]
    Vici(String),

    #[error("swanctl error: {0}")]
    Swanctl(String),

    #[error("FRR error: {0}")]
    Frr(String),

    #[error("Jool error: {0}")]
    Jool(String),

    #[error("external service unavailable: {0}")]
    ExternalServiceUnavailable(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("external command `{cmd}` failed: {detail}")]
    Command { cmd: String, detail: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn schema(file: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Schema {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn transient(op: impl Into<String>, source: std::io::Error) -> Self {
        Error::TransientKernel {
            op: op.into(),
            source,
        }
    }

    /// `true` for errors the caller may retry a handful of times before
    /// giving up and self-healing on the next reconciliation pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientKernel { .. })
    }
}
