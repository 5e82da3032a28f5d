// Device watcher: OS notification sources, the reconciliation engine that
// merges them with the ADB server's view, and the waiter facade.

pub mod engine;
pub mod kernel;
pub mod source;
pub mod sysfs;
mod types;
pub mod uevent;
pub mod waiter;
pub mod watcher;
pub mod worker;


pub use engine::{AdbServerLister, DeviceLister, EngineTuning, EventCallback, WatchEngine};
pub use source::{ChannelSource, NotificationSource, SourceFeed, StopHandle, WatchError, WatchResult};
pub use types::{interface_identity, matches_target, DeviceInterface, DeviceType, WatchSettings};
pub use waiter::WatchWaiter;
pub use watcher::DeviceWatcher;
