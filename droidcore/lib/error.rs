use std::{
    error::Error,
    fmt::{self, Display},
};

use droidutils::DroidutilsError;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a droidcore-related operation.
pub type DroidcoreResult<T> = Result<T, DroidcoreError>;

/// An error that occurred while orchestrating sandboxes.
#[derive(pretty_error_debug::Debug, Error)]
pub enum DroidcoreError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// A command or file operation on the device host failed.
    #[error("command error: {0}")]
    Command(#[from] DroidutilsError),

    /// A JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// A required identifier or option was missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A configuration value could not be parsed.
    #[error("invalid configuration for {0}: {1}")]
    InvalidConfig(String, String),

    /// The sandbox is not registered.
    #[error("sandbox {0} not found")]
    SandboxNotFound(String),

    /// The sandbox is not in the state the operation requires.
    #[error("sandbox {0} is not running")]
    SandboxNotRunning(String),

    /// Every instance number in the configured pool is taken.
    #[error("no available instance numbers (max: {max})")]
    PoolExhausted {
        /// The size of the pool
        max: u32,
    },

    /// The snapshot path does not follow `<name>` or `<org-uuid>/<name>`.
    #[error("invalid snapshot path: {0}")]
    InvalidSnapshotPath(String),

    /// The snapshot does not exist on the device host.
    #[error("snapshot {path} not found\n{help}")]
    SnapshotNotFound {
        /// The snapshot path that was requested
        path: String,

        /// Remediation instructions
        help: String,
    },

    /// Base snapshots are immutable.
    #[error("cannot delete base snapshot {0}")]
    BaseSnapshotImmutable(String),

    /// The toolchain produced output that could not be interpreted.
    #[error("unexpected toolchain output: {0}")]
    UnexpectedOutput(String),

    /// A bounded wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// The object store is not configured.
    #[error("{0} is not configured")]
    NotConfigured(String),

    /// An object store request failed.
    #[error("object store error: {0}")]
    ObjectStore(String),

    /// One or more files of a batch transfer failed.
    #[error("transfer failed for {} file(s): {}", .0.len(), .0.join("; "))]
    TransferFailed(Vec<String>),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DroidcoreError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> DroidcoreError {
        DroidcoreError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Returns the output captured from a failed command, if any.
    pub fn command_output(&self) -> Option<&str> {
        match self {
            DroidcoreError::Command(e) => e.output(),
            _ => None,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `DroidcoreResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> DroidcoreResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
