// ADB smart-socket client: transport framing, host services, the shell and
// file-sync sub-protocols, and a blocking facade over the async operations.

pub mod blocking;
mod error;
pub mod host;
pub mod launcher;
mod shell;
pub mod sync;
mod transport;
mod types;

#[cfg(test)]
mod tests;

pub use error::{sync_code, AdbError, AdbResult, SetupFailure};
pub use sync::SyncSession;
pub use types::{
    feature, DeviceInfo, FileStat, ListItem, ShellOutput, TransportOptions, TransportType,
};
