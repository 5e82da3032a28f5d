// The abstract OS notification-source contract, plus a channel-backed
// implementation for embedders and tests. Platform sources (kernel uevent,
// window messages) plug in behind the same trait.
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use super::types::DeviceInterface;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("elevated privileges required")]
    NotElevated,

    #[error("device source failed: {0}")]
    Source(String),

    #[error(transparent)]
    Adb(#[from] crate::adb::AdbError),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

pub type WatchResult<T> = Result<T, WatchError>;

/// Sink invoked for every present or arriving interface. The first argument
/// is the opaque platform interface id, stable for one attachment.
pub type ArrivalSink<'a> = dyn FnMut(&str, DeviceInterface) + 'a;

/// Sink invoked with the interface id of a departed interface.
pub type RemovalSink<'a> = dyn FnMut(&str) + 'a;

/// Signals a running source to exit promptly. Obtained before the source
/// moves onto its consumer thread.
#[derive(Clone)]
pub struct StopHandle(Arc<dyn Fn() + Send + Sync>);

impl StopHandle {
    pub fn new(stop: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(stop))
    }

    pub fn stop(&self) {
        (self.0)()
    }
}

/// An OS device-notification source.
///
/// `enumerate_initial` synchronously reports everything currently present;
/// `run` then blocks consuming OS events until the stop handle fires.
/// Records carry the OS-populated fields (hub, vid/pid, serial strings,
/// USB class triple, driver, a base type of `Usb`); classification and
/// ADB-side merging belong to the reconciliation engine.
pub trait NotificationSource: Send {
    fn enumerate_initial(&mut self, sink: &mut ArrivalSink<'_>) -> WatchResult<()>;

    fn run(
        &mut self,
        sink: &mut ArrivalSink<'_>,
        tear_down: &mut RemovalSink<'_>,
    ) -> WatchResult<()>;

    fn stop_handle(&self) -> StopHandle;
}

/// One event fed into a [`ChannelSource`].
#[derive(Debug)]
pub enum SourceEvent {
    Arrival {
        interface_id: String,
        record: DeviceInterface,
    },
    Removal {
        interface_id: String,
    },
    Shutdown,
}

/// Feeds events into the matching [`ChannelSource`].
#[derive(Clone)]
pub struct SourceFeed {
    tx: mpsc::Sender<SourceEvent>,
}

impl SourceFeed {
    pub fn arrived(&self, interface_id: impl Into<String>, record: DeviceInterface) {
        let _ = self.tx.send(SourceEvent::Arrival {
            interface_id: interface_id.into(),
            record,
        });
    }

    pub fn removed(&self, interface_id: impl Into<String>) {
        let _ = self.tx.send(SourceEvent::Removal {
            interface_id: interface_id.into(),
        });
    }
}

/// A notification source driven through an in-process channel.
///
/// The initial snapshot is handed over at construction; later arrivals and
/// removals flow through the [`SourceFeed`].
pub struct ChannelSource {
    initial: Vec<(String, DeviceInterface)>,
    rx: mpsc::Receiver<SourceEvent>,
    tx: mpsc::Sender<SourceEvent>,
}

impl ChannelSource {
    pub fn new(initial: Vec<(String, DeviceInterface)>) -> (Self, SourceFeed) {
        let (tx, rx) = mpsc::channel();
        let feed = SourceFeed { tx: tx.clone() };
        (Self { initial, rx, tx }, feed)
    }
}

impl NotificationSource for ChannelSource {
    fn enumerate_initial(&mut self, sink: &mut ArrivalSink<'_>) -> WatchResult<()> {
        for (interface_id, record) in self.initial.drain(..) {
            sink(&interface_id, record);
        }
        Ok(())
    }

    fn run(
        &mut self,
        sink: &mut ArrivalSink<'_>,
        tear_down: &mut RemovalSink<'_>,
    ) -> WatchResult<()> {
        while let Ok(event) = self.rx.recv() {
            match event {
                SourceEvent::Arrival {
                    interface_id,
                    record,
                } => sink(&interface_id, record),
                SourceEvent::Removal { interface_id } => tear_down(&interface_id),
                SourceEvent::Shutdown => break,
            }
        }
        Ok(())
    }

    fn stop_handle(&self) -> StopHandle {
        let tx = Mutex::new(self.tx.clone());
        StopHandle::new(move || {
            if let Ok(tx) = tx.lock() {
                let _ = tx.send(SourceEvent::Shutdown);
            }
        })
    }
}
