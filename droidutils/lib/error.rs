//! `droidutils::error` is a module containing error utilities for the droidcore project.

use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a droidutils-related operation.
pub type DroidutilsResult<T> = Result<T, DroidutilsError>;

/// An error that occurred while executing a command or a file operation through a gateway.
#[derive(pretty_error_debug::Debug, Error)]
pub enum DroidutilsError {
    /// A command ran but exited unsuccessfully. The combined output is kept for diagnosis.
    #[error("command `{command}` failed (exit code {code:?}): {output}")]
    CommandFailed {
        /// The rendered command line
        command: String,

        /// The exit code, if the process exited normally
        code: Option<i32>,

        /// Combined stdout and stderr
        output: String,
    },

    /// The ssh private key configured for remote mode does not exist.
    #[error("ssh key file not found: {0}")]
    SshKeyNotFound(PathBuf),

    /// A child process could not be spawned.
    #[error("failed to spawn `{0}`: {1}")]
    Spawn(String, #[source] std::io::Error),

    /// An error that occurred when performing an IO operation
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Custom error.
    #[error("Custom error: {0}")]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DroidutilsError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> DroidutilsError {
        DroidutilsError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Returns the captured command output if this is a command failure.
    pub fn output(&self) -> Option<&str> {
        match self {
            DroidutilsError::CommandFailed { output, .. } => Some(output),
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

/// Creates an `Ok` `DroidutilsResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> DroidutilsResult<T> {
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
