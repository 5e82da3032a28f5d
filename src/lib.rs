pub mod adb;
pub mod args;
pub mod watch;

pub use adb::{AdbError, AdbResult, TransportOptions};
pub use watch::{DeviceInterface, DeviceType, WatchSettings, WatchWaiter};
