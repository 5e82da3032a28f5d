// Sysfs-backed USB interface enumeration. The tree root is configurable so
// the walker runs against fixtures as well as a live `/sys`.
use std::fs;
use std::path::{Path, PathBuf};

use super::types::{DeviceInterface, DeviceType};

pub const DEFAULT_SYSFS_ROOT: &str = "/sys";
const USB_DEVICES_DIR: &str = "bus/usb/devices";

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    let text = fs::read_to_string(dir.join(name)).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn read_attr_hex_u16(dir: &Path, name: &str) -> Option<u16> {
    u16::from_str_radix(&read_attr(dir, name)?, 16).ok()
}

fn read_attr_hex_u8(dir: &Path, name: &str) -> Option<u8> {
    u8::from_str_radix(&read_attr(dir, name)?, 16).ok()
}

fn driver_name(interface_dir: &Path) -> String {
    fs::read_link(interface_dir.join("driver"))
        .ok()
        .and_then(|target| {
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_default()
}

/// Looks for a `tty*` child below an interface directory, the sign that a
/// serial driver claimed it.
pub(crate) fn find_tty_child(interface_dir: &Path) -> Option<String> {
    for entry in fs::read_dir(interface_dir).ok()? {
        let entry = entry.ok()?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("tty") {
            return Some(name);
        }
    }
    None
}

/// The interface number out of a sysfs interface name like `1-3:1.0`.
fn interface_number(name: &str) -> i32 {
    name.rsplit('.')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(-1)
}

/// Builds one record from a sysfs interface directory plus its parent
/// device directory. Returns `None` when the class attributes are missing
/// (e.g. the directory is not an interface).
pub(crate) fn usb_interface_record(
    device_dir: &Path,
    interface_dir: &Path,
) -> Option<DeviceInterface> {
    let usb_class = read_attr_hex_u8(interface_dir, "bInterfaceClass")?;
    let usb_sub_class = read_attr_hex_u8(interface_dir, "bInterfaceSubClass")?;
    let usb_proto = read_attr_hex_u8(interface_dir, "bInterfaceProtocol")?;

    let interface_name = interface_dir.file_name()?.to_string_lossy().into_owned();
    let device_name = device_dir.file_name()?.to_string_lossy().into_owned();

    let mut dev = DeviceInterface {
        hub: device_name,
        devpath: interface_dir.to_string_lossy().into_owned(),
        usb_class,
        usb_sub_class,
        usb_proto,
        usb_if: interface_number(&interface_name),
        kind: DeviceType::USB,
        ..Default::default()
    };

    dev.vid = read_attr_hex_u16(device_dir, "idVendor").unwrap_or(0);
    dev.pid = read_attr_hex_u16(device_dir, "idProduct").unwrap_or(0);
    dev.serial = read_attr(device_dir, "serial").unwrap_or_default();
    dev.manufacturer = read_attr(device_dir, "manufacturer").unwrap_or_default();
    dev.product = read_attr(device_dir, "product").unwrap_or_default();
    dev.description = dev.product.clone();
    dev.driver = driver_name(interface_dir);

    if let Some(tty) = find_tty_child(interface_dir) {
        dev.kind |= DeviceType::SERIAL;
        dev.devpath = format!("/dev/{tty}");
    }

    Some(dev)
}

/// A sysfs walker rooted at a configurable tree.
pub struct SysfsEnumerator {
    root: PathBuf,
}

impl SysfsEnumerator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn system() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }

    fn devices_dir(&self) -> PathBuf {
        self.root.join(USB_DEVICES_DIR)
    }

    pub(crate) fn device_dir(&self, device_name: &str) -> PathBuf {
        self.devices_dir().join(device_name)
    }

    /// Reports every interface of every attached device through `sink` as
    /// `(interface_id, record)`. Interface ids are the sysfs interface
    /// names (`1-3:1.0`), unique for the duration of an attachment.
    pub fn enumerate<F>(&self, sink: &mut F) -> std::io::Result<()>
    where
        F: FnMut(&str, DeviceInterface) + ?Sized,
    {
        let devices = self.devices_dir();
        for entry in fs::read_dir(&devices)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // Interface directories contain ':'; walk them via the parent
            // device entries below.
            if name.contains(':') || !entry.path().is_dir() {
                continue;
            }

            self.enumerate_device(&entry.path(), sink);
        }
        Ok(())
    }

    /// Reports each interface of a single device directory.
    pub(crate) fn enumerate_device<F>(&self, device_dir: &Path, sink: &mut F)
    where
        F: FnMut(&str, DeviceInterface) + ?Sized,
    {
        let Ok(entries) = fs::read_dir(device_dir) else {
            return;
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.contains(':') {
                continue;
            }

            if let Some(record) = usb_interface_record(device_dir, &entry.path()) {
                sink(&name, record);
            }
        }
    }
}
