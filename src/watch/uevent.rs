// Kernel uevent text handling: NUL-partitioned `key=value` blocks as read
// from the uevent socket, the pending-tty expectation used to detect
// adapters missing their serial driver, and the scoped usb-serial rebinder.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::adb::launcher;

use super::source::{WatchError, WatchResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UeventAction {
    Add,
    Remove,
    Bind,
    Unbind,
    Change,
    Other(String),
}

impl UeventAction {
    fn parse(text: &str) -> Self {
        match text {
            "add" => Self::Add,
            "remove" => Self::Remove,
            "bind" => Self::Bind,
            "unbind" => Self::Unbind,
            "change" => Self::Change,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One parsed kernel event.
#[derive(Debug, Clone)]
pub struct UeventMessage {
    pub action: UeventAction,
    pub devpath: String,
    pub subsystem: String,
    pub properties: HashMap<String, String>,
}

impl UeventMessage {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Parses one uevent block: an `action@devpath` header line followed by
/// `KEY=value` lines, all separated by NUL bytes. Returns `None` for blocks
/// without a well-formed header.
pub fn parse_uevent_block(block: &[u8]) -> Option<UeventMessage> {
    let mut segments = block
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned());

    let header = segments.next()?;
    let (action, devpath) = header.split_once('@')?;

    let mut message = UeventMessage {
        action: UeventAction::parse(action),
        devpath: devpath.to_string(),
        subsystem: String::new(),
        properties: HashMap::new(),
    };

    for segment in segments {
        let Some((key, value)) = segment.split_once('=') else {
            continue;
        };
        if key == "SUBSYSTEM" {
            message.subsystem = value.to_string();
        }
        message.properties.insert(key.to_string(), value.to_string());
    }

    Some(message)
}

/// Tracks the window in which a configured usb-serial adapter should have
/// produced a tty child. When it expires without one, the generic driver
/// gets rebound.
#[derive(Debug, Default)]
pub struct TtyExpectation {
    pending: Option<PendingTty>,
}

#[derive(Debug)]
struct PendingTty {
    vid: u16,
    pid: u16,
    devpath: String,
    deadline: Instant,
}

impl TtyExpectation {
    /// Arms the expectation for one adapter.
    pub fn arm(&mut self, vid: u16, pid: u16, devpath: &str, timeout: Duration) {
        self.pending = Some(PendingTty {
            vid,
            pid,
            devpath: devpath.to_string(),
            deadline: Instant::now() + timeout,
        });
    }

    /// A tty appeared somewhere below the pending device; the expectation
    /// is satisfied and cleared.
    pub fn satisfy(&mut self, tty_devpath: &str) -> bool {
        let satisfied = self
            .pending
            .as_ref()
            .is_some_and(|p| p.devpath.is_empty() || tty_devpath.starts_with(&p.devpath));
        if satisfied {
            self.pending = None;
        }
        satisfied
    }

    /// Returns the `(vid, pid)` pair whose window elapsed, clearing it.
    pub fn expired(&mut self, now: Instant) -> Option<(u16, u16)> {
        match &self.pending {
            Some(p) if now >= p.deadline => {
                let pair = (p.vid, p.pid);
                self.pending = None;
                Some(pair)
            }
            _ => None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }
}

/// True when this process can manage kernel drivers.
#[cfg(unix)]
pub fn is_elevated() -> bool {
    rustix::process::geteuid().is_root()
}

#[cfg(not(unix))]
pub fn is_elevated() -> bool {
    false
}

/// Scoped manager for the generic usb-serial driver.
///
/// Binding shells `rmmod`/`modprobe` with explicit vendor/product ids; the
/// manual load is reversed when the binder drops. Construction fails
/// without elevated privileges.
pub struct UsbSerialBinder {
    pairs: Vec<(u16, u16)>,
    manually_loaded: bool,
}

impl UsbSerialBinder {
    pub fn new(pairs: Vec<(u16, u16)>) -> WatchResult<Self> {
        if !pairs.is_empty() && !is_elevated() {
            return Err(WatchError::NotElevated);
        }
        Ok(Self {
            pairs,
            manually_loaded: false,
        })
    }

    pub fn watches(&self, vid: u16, pid: u16) -> bool {
        self.pairs.iter().any(|&(v, p)| v == vid && p == pid)
    }

    /// Rebinds the generic driver for one adapter.
    pub fn bind(&mut self, vid: u16, pid: u16) {
        let vargs = vec![
            "usbserial".to_string(),
            format!("0x{vid:04x}"),
            format!("0x{pid:04x}"),
        ];
        let result = launcher::run_script(
            "rmmod {0} && modprobe {0} vendor={1} product={2} &",
            &vargs,
            &HashMap::new(),
        );

        match result {
            Ok(_) => {
                self.manually_loaded = true;
                log::info!("rebound usbserial for {vid:04x}:{pid:04x}");
            }
            Err(e) => log::warn!("usbserial rebind failed: {e}"),
        }
    }
}

impl Drop for UsbSerialBinder {
    fn drop(&mut self) {
        if self.manually_loaded {
            let _ = launcher::run_script("rmmod usbserial &", &[], &HashMap::new());
        }
    }
}
