use std::time::Duration;
use thiserror::Error;

/// A specialized `Result` type for ADB operations.
pub type AdbResult<T> = Result<T, AdbError>;

/// Numeric failure codes reported by the server launcher.
///
/// The discriminants are part of the launcher contract; callers that bridge
/// into other runtimes report them as plain integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SetupFailure {
    AdbNotFound = 1,
    CreatePipeFailed = 2,
    CreateProcessFailed = 4,
    StartServerFailed = 5,
    ServerRejected = 6,
}

impl SetupFailure {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// The error type for all ADB-related operations.
#[derive(Debug, Error)]
pub enum AdbError {
    #[error("failed to connect to adb server: {message}")]
    Connection { message: String },

    #[error("protocol fault: {message}")]
    Protocol { message: String },

    #[error("adb server error: {0}")]
    Server(String),

    #[error("sync error (code {code}): {message}")]
    Sync { code: i32, message: String },

    #[error("command timeout after {duration:?}")]
    CommandTimeout { duration: Duration },

    #[error("failed to start adb server ({failure:?})")]
    Setup { failure: SetupFailure },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl AdbError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        AdbError::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn sync(code: i32, message: impl Into<String>) -> Self {
        AdbError::Sync {
            code,
            message: message.into(),
        }
    }
}

/// Errno-like sync codes the daemon reports through `FAIL` status words.
pub mod sync_code {
    pub const FILE_NOT_EXISTS: i32 = 2;
    pub const NO_PERMISSION: i32 = 13;
}
