// Kernel-event notification source: drives the sysfs walker from a stream
// of uevent blocks. The raw socket is injected as any `Read`; a periodic
// read timeout doubles as the tick for stop checks and tty expectations.
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::source::{
    ArrivalSink, NotificationSource, RemovalSink, StopHandle, WatchResult,
};
use super::sysfs::SysfsEnumerator;
use super::types::DeviceType;
use super::uevent::{self, TtyExpectation, UeventAction, UsbSerialBinder};

/// How long a configured usb-serial adapter may stay tty-less before the
/// generic driver is rebound.
const TTY_GRACE: Duration = Duration::from_secs(1);

const EVENT_BUFFER_SIZE: usize = 8192;

/// A [`NotificationSource`] consuming kernel uevent blocks.
///
/// `reader` should return `WouldBlock`/`TimedOut` periodically (a receive
/// timeout on the socket) so stop requests and tty expectations are acted
/// on promptly even while the bus is quiet.
pub struct UeventSource<R> {
    reader: R,
    sysfs: SysfsEnumerator,
    binder: Option<UsbSerialBinder>,
    expectation: TtyExpectation,
    pairs: Vec<(u16, u16)>,
    stop: Arc<AtomicBool>,
}

impl<R: Read + Send> UeventSource<R> {
    /// Fails with `NotElevated` when usb-serial pairs are configured but
    /// the process lacks the privileges to manage drivers.
    pub fn new(
        reader: R,
        sysfs_root: impl Into<PathBuf>,
        usb_serial_vid_pids: Vec<(u16, u16)>,
    ) -> WatchResult<Self> {
        let binder = if usb_serial_vid_pids.is_empty() {
            None
        } else {
            Some(UsbSerialBinder::new(usb_serial_vid_pids.clone())?)
        };

        Ok(Self {
            reader,
            sysfs: SysfsEnumerator::new(sysfs_root),
            binder,
            expectation: TtyExpectation::default(),
            pairs: usb_serial_vid_pids,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    fn watches_pair(&self, vid: u16, pid: u16) -> bool {
        self.pairs.iter().any(|&(v, p)| v == vid && p == pid)
    }

    fn service_expectation(&mut self) {
        if let Some((vid, pid)) = self.expectation.expired(Instant::now()) {
            if let Some(binder) = self.binder.as_mut() {
                binder.bind(vid, pid);
            }
        }
    }

    fn handle_event(
        &mut self,
        block: &[u8],
        sink: &mut ArrivalSink<'_>,
        tear_down: &mut RemovalSink<'_>,
    ) {
        let Some(event) = uevent::parse_uevent_block(block) else {
            return;
        };

        match event.subsystem.as_str() {
            "usb" => {
                // Only interface-level events carry a class triple; the
                // device-level ones are implied by their interfaces.
                if event.property("DEVTYPE") != Some("usb_interface") {
                    return;
                }

                let Some(interface_name) = event.devpath.rsplit('/').next() else {
                    return;
                };
                let Some((device_name, _)) = interface_name.split_once(':') else {
                    return;
                };

                match event.action {
                    UeventAction::Add => {
                        let device_dir = self.sysfs.device_dir(device_name);
                        let interface_dir = device_dir.join(interface_name);

                        match super::sysfs::usb_interface_record(&device_dir, &interface_dir)
                        {
                            Some(record) => {
                                let vid = record.vid;
                                let pid = record.pid;
                                let has_tty = record.kind.contains(DeviceType::SERIAL);
                                sink(interface_name, record);

                                if !has_tty && self.watches_pair(vid, pid) {
                                    self.expectation.arm(
                                        vid,
                                        pid,
                                        &event.devpath,
                                        TTY_GRACE,
                                    );
                                }
                            }
                            None => {
                                log::debug!(
                                    "interface {interface_name} vanished before its \
                                     attributes could be read"
                                );
                            }
                        }
                    }
                    UeventAction::Remove => tear_down(interface_name),
                    _ => {}
                }
            }
            "tty" => {
                if event.action == UeventAction::Add
                    && self.expectation.satisfy(&event.devpath)
                {
                    log::debug!("tty arrived for pending usb-serial adapter");
                }
            }
            _ => {}
        }
    }
}

impl<R: Read + Send> NotificationSource for UeventSource<R> {
    fn enumerate_initial(&mut self, sink: &mut ArrivalSink<'_>) -> WatchResult<()> {
        let mut seen_pair_tty: Vec<(u16, u16, bool)> = Vec::new();

        self.sysfs.enumerate(&mut |interface_id: &str, record| {
            let has_tty = record.kind.contains(DeviceType::SERIAL);
            if let Some(entry) = seen_pair_tty
                .iter_mut()
                .find(|(v, p, _)| *v == record.vid && *p == record.pid)
            {
                entry.2 |= has_tty;
            } else {
                seen_pair_tty.push((record.vid, record.pid, has_tty));
            }

            sink(interface_id, record);
        })?;

        // Configured adapters that came up without any tty get the rebind
        // window armed right away.
        for (vid, pid, has_tty) in seen_pair_tty {
            if !has_tty && self.watches_pair(vid, pid) {
                self.expectation.arm(vid, pid, "", TTY_GRACE);
            }
        }

        Ok(())
    }

    fn run(
        &mut self,
        sink: &mut ArrivalSink<'_>,
        tear_down: &mut RemovalSink<'_>,
    ) -> WatchResult<()> {
        let mut buffer = vec![0u8; EVENT_BUFFER_SIZE];

        while !self.stop.load(Ordering::Acquire) {
            match self.reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    self.handle_event(&buffer[..n], sink, tear_down);
                    self.service_expectation();
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    self.service_expectation();
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn stop_handle(&self) -> StopHandle {
        let stop = self.stop.clone();
        StopHandle::new(move || stop.store(true, Ordering::Release))
    }
}

/// The kernel uevent socket, readable as a byte stream of event blocks.
///
/// Reads time out every half second so [`UeventSource`] can service stop
/// requests and expirations.
#[cfg(target_os = "linux")]
pub struct KernelEventSocket {
    fd: std::os::fd::OwnedFd,
}

#[cfg(target_os = "linux")]
impl KernelEventSocket {
    pub fn open() -> std::io::Result<Self> {
        use rustix::net::netlink::{self, SocketAddrNetlink};
        use rustix::net::{socket_with, AddressFamily, SocketFlags, SocketType};

        let fd = socket_with(
            AddressFamily::NETLINK,
            SocketType::DGRAM,
            SocketFlags::CLOEXEC,
            Some(netlink::KOBJECT_UEVENT),
        )?;

        // Group 1 carries the kernel's own events.
        rustix::net::bind(&fd, &SocketAddrNetlink::new(0, 1))?;

        rustix::net::sockopt::set_socket_timeout(
            &fd,
            rustix::net::sockopt::Timeout::Recv,
            Some(std::time::Duration::from_millis(500)),
        )?;

        Ok(Self { fd })
    }
}

#[cfg(target_os = "linux")]
impl Read for KernelEventSocket {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        rustix::net::recv(&self.fd, buf, rustix::net::RecvFlags::empty())
            .map(|(len, _)| len)
            .map_err(std::io::Error::from)
    }
}
