// Record and settings types for the device watcher.
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Bitmask describing what a device interface is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceType(u32);

impl DeviceType {
    pub const NONE: DeviceType = DeviceType(0);
    pub const USB: DeviceType = DeviceType(1 << 0);
    pub const NET: DeviceType = DeviceType(1 << 1);
    pub const SERIAL: DeviceType = DeviceType(1 << 2);
    pub const ADB: DeviceType = DeviceType(1 << 3);
    pub const FASTBOOT: DeviceType = DeviceType(1 << 4);
    pub const HDC: DeviceType = DeviceType(1 << 5);
    pub const DIAG: DeviceType = DeviceType(1 << 6);
    pub const QDL: DeviceType = DeviceType(1 << 7);

    /// An ADB endpoint reached over a physical USB interface.
    pub const USB_CONNECTED_ADB: DeviceType = DeviceType(Self::USB.0 | Self::ADB.0);
    /// An ADB endpoint reached over TCP.
    pub const REMOTE_ADB: DeviceType = DeviceType(Self::NET.0 | Self::ADB.0);

    const TOKENS: [(DeviceType, &'static str); 8] = [
        (Self::USB, "usb"),
        (Self::NET, "net"),
        (Self::SERIAL, "serial"),
        (Self::ADB, "adb"),
        (Self::FASTBOOT, "fastboot"),
        (Self::HDC, "hdc"),
        (Self::DIAG, "diag"),
        (Self::QDL, "qdl"),
    ];

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    pub fn contains(self, other: DeviceType) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: DeviceType) -> bool {
        self.0 & other.0 != 0
    }

    /// Comma-joined lowercase token list, e.g. `"usb,adb"`.
    pub fn tokens(self) -> String {
        let mut out = String::new();
        for (bit, name) in Self::TOKENS {
            if self.contains(bit) {
                if !out.is_empty() {
                    out.push(',');
                }
                out.push_str(name);
            }
        }
        out
    }

    /// Parses a comma-joined token list; unknown tokens are ignored.
    pub fn parse(text: &str) -> DeviceType {
        let mut out = DeviceType::NONE;
        for token in text.split(',') {
            let token = token.trim();
            for (bit, name) in Self::TOKENS {
                if token == name {
                    out |= bit;
                }
            }
        }
        out
    }
}

impl BitOr for DeviceType {
    type Output = DeviceType;
    fn bitor(self, rhs: DeviceType) -> DeviceType {
        DeviceType(self.0 | rhs.0)
    }
}

impl BitOrAssign for DeviceType {
    fn bitor_assign(&mut self, rhs: DeviceType) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for DeviceType {
    type Output = DeviceType;
    fn bitand(self, rhs: DeviceType) -> DeviceType {
        DeviceType(self.0 & rhs.0)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens())
    }
}

impl Serialize for DeviceType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.tokens())
    }
}

/// Stable identity for a source-level interface id: the first 8 bytes of
/// its SHA-256 digest as 16 lowercase hex characters.
pub fn interface_identity(interface_id: &str) -> String {
    let digest = Sha256::digest(interface_id.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// One merged device-interface record, as emitted to watch consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInterface {
    /// Stable per-attachment identity; never empty on an emitted record.
    pub identity: String,

    pub devpath: String,
    pub hub: String,
    pub serial: String,
    pub manufacturer: String,
    pub product: String,
    pub model: String,
    pub device: String,
    pub driver: String,
    pub description: String,

    pub ip: String,
    pub port: u16,

    pub vid: u16,
    pub pid: u16,

    pub usb_class: u8,
    pub usb_sub_class: u8,
    pub usb_proto: u8,
    /// Composite interface number; negative when not a USB interface.
    pub usb_if: i32,

    pub kind: DeviceType,
    /// True when this record announces a departure.
    pub off: bool,
}

impl Default for DeviceInterface {
    fn default() -> Self {
        Self {
            identity: String::new(),
            devpath: String::new(),
            hub: String::new(),
            serial: String::new(),
            manufacturer: String::new(),
            product: String::new(),
            model: String::new(),
            device: String::new(),
            driver: String::new(),
            description: String::new(),
            ip: String::new(),
            port: 0,
            vid: 0,
            pid: 0,
            usb_class: 0,
            usb_sub_class: 0,
            usb_proto: 0,
            usb_if: -1,
            kind: DeviceType::NONE,
            off: false,
        }
    }
}

impl Serialize for DeviceInterface {
    // One JSON object per event: empty strings and zero numerics are
    // omitted, the USB class triple only appears for real USB interfaces.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;

        map.serialize_entry("id", &self.identity)?;
        if self.off {
            map.serialize_entry("off", &self.off)?;
        }

        let strings = [
            ("devpath", &self.devpath),
            ("hub", &self.hub),
            ("serial", &self.serial),
            ("manufacturer", &self.manufacturer),
            ("product", &self.product),
            ("model", &self.model),
            ("device", &self.device),
            ("driver", &self.driver),
            ("ip", &self.ip),
        ];
        for (key, value) in strings {
            if !value.is_empty() {
                map.serialize_entry(key, value)?;
            }
        }

        if self.port != 0 {
            map.serialize_entry("port", &self.port)?;
        }
        if self.vid != 0 {
            map.serialize_entry("vid", &self.vid)?;
        }
        if self.pid != 0 {
            map.serialize_entry("pid", &self.pid)?;
        }

        map.serialize_entry("type", &self.kind)?;

        if !self.description.is_empty() {
            map.serialize_entry("description", &self.description)?;
        }

        if self.usb_if >= 0 {
            map.serialize_entry("usbClass", &self.usb_class)?;
            map.serialize_entry("usbSubClass", &self.usb_sub_class)?;
            map.serialize_entry("usbProto", &self.usb_proto)?;
            map.serialize_entry("usbIf", &self.usb_if)?;
        }

        map.end()
    }
}

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    /// Poll the ADB server and merge its view into USB-ADB records.
    pub enable_adb_client: bool,
    /// A record passes when any filter mask is a subset of its type.
    pub type_filters: Vec<DeviceType>,
    pub include_vids: Vec<u16>,
    pub exclude_vids: Vec<u16>,
    pub include_pids: Vec<u16>,
    pub exclude_pids: Vec<u16>,
    /// Driver allow-list, matched by string equality.
    pub drivers: Vec<String>,
    /// `(vid, pid)` pairs to rebind onto the generic usb-serial driver.
    pub usb_serial_vid_pids: Vec<(u16, u16)>,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            enable_adb_client: true,
            type_filters: Vec::new(),
            include_vids: Vec::new(),
            exclude_vids: Vec::new(),
            include_pids: Vec::new(),
            exclude_pids: Vec::new(),
            drivers: Vec::new(),
            usb_serial_vid_pids: Vec::new(),
        }
    }
}

impl WatchSettings {
    /// Applies the arrival filter: type masks, vid/pid include/exclude
    /// lists, then the driver allow-list.
    pub(crate) fn accepts(&self, dev: &DeviceInterface) -> bool {
        if !self.type_filters.is_empty()
            && !self.type_filters.iter().any(|f| dev.kind.contains(*f))
        {
            return false;
        }

        if !self.exclude_vids.is_empty() && dev.vid != 0 && self.exclude_vids.contains(&dev.vid)
        {
            return false;
        }
        if !self.include_vids.is_empty()
            && (dev.vid == 0 || !self.include_vids.contains(&dev.vid))
        {
            return false;
        }

        if !self.exclude_pids.is_empty() && dev.pid != 0 && self.exclude_pids.contains(&dev.pid)
        {
            return false;
        }
        if !self.include_pids.is_empty()
            && (dev.pid == 0 || !self.include_pids.contains(&dev.pid))
        {
            return false;
        }

        if !self.drivers.is_empty() && !self.drivers.contains(&dev.driver) {
            return false;
        }

        true
    }
}

/// Predicate match for waiter targets: sentinel fields (empty string, zero,
/// negative `usb_if`, empty type) mean "don't care". A non-empty target
/// identity also matches the candidate's devpath, hub, serial, ip or driver.
pub fn matches_target(target: &DeviceInterface, candidate: &DeviceInterface) -> bool {
    if target.off != candidate.off {
        return false;
    }

    if !target.kind.is_empty() && !candidate.kind.contains(target.kind) {
        return false;
    }

    let string_fields = [
        (&target.devpath, &candidate.devpath),
        (&target.hub, &candidate.hub),
        (&target.serial, &candidate.serial),
        (&target.manufacturer, &candidate.manufacturer),
        (&target.product, &candidate.product),
        (&target.model, &candidate.model),
        (&target.device, &candidate.device),
        (&target.driver, &candidate.driver),
        (&target.ip, &candidate.ip),
        (&target.description, &candidate.description),
    ];
    for (want, have) in string_fields {
        if !want.is_empty() && want != have {
            return false;
        }
    }

    if target.port != 0 && target.port != candidate.port {
        return false;
    }
    if target.vid != 0 && target.vid != candidate.vid {
        return false;
    }
    if target.pid != 0 && target.pid != candidate.pid {
        return false;
    }

    if target.usb_class != 0 && target.usb_class != candidate.usb_class {
        return false;
    }
    if target.usb_sub_class != 0 && target.usb_sub_class != candidate.usb_sub_class {
        return false;
    }
    if target.usb_proto != 0 && target.usb_proto != candidate.usb_proto {
        return false;
    }
    if target.usb_if >= 0 && target.usb_if != candidate.usb_if {
        return false;
    }

    if !target.identity.is_empty() {
        let keys = [
            &candidate.identity,
            &candidate.devpath,
            &candidate.hub,
            &candidate.serial,
            &candidate.ip,
            &candidate.driver,
        ];
        if !keys.iter().any(|k| *k == &target.identity) {
            return false;
        }
    }

    true
}
