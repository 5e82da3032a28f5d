// Ties a notification source to the engine on a dedicated thread and
// reports whether startup (the initial enumeration) succeeded.
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use super::engine::{DeviceLister, EngineTuning, EventCallback, WatchEngine};
use super::source::{NotificationSource, StopHandle, WatchError, WatchResult};
use super::types::{DeviceInterface, WatchSettings};

/// A running watch: one OS-notification thread feeding the engine, plus
/// the engine's own ADB worker.
///
/// Dropping stops the source, joins the thread and shuts the engine down.
pub struct DeviceWatcher {
    engine: Arc<WatchEngine>,
    source_stop: StopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl DeviceWatcher {
    /// Starts watching with the production ADB lister.
    pub fn spawn<S>(
        settings: WatchSettings,
        source: S,
        callback: EventCallback,
    ) -> WatchResult<Self>
    where
        S: NotificationSource + 'static,
    {
        let engine = Arc::new(WatchEngine::new(settings, callback));
        Self::run_source(engine, source)
    }

    pub(crate) fn spawn_with_lister<S>(
        settings: WatchSettings,
        source: S,
        callback: EventCallback,
        lister: Box<dyn DeviceLister>,
        tuning: EngineTuning,
    ) -> WatchResult<Self>
    where
        S: NotificationSource + 'static,
    {
        let engine = Arc::new(WatchEngine::with_lister(settings, callback, lister, tuning));
        Self::run_source(engine, source)
    }

    fn run_source<S>(engine: Arc<WatchEngine>, mut source: S) -> WatchResult<Self>
    where
        S: NotificationSource + 'static,
    {
        let source_stop = source.stop_handle();
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread_engine = engine.clone();
        let thread = thread::spawn(move || {
            let mut sink = |interface_id: &str, record: DeviceInterface| {
                thread_engine.on_interface_enumerated(interface_id, record);
            };
            let mut tear_down = |interface_id: &str| {
                thread_engine.on_interface_off(interface_id);
            };

            let initial = source.enumerate_initial(&mut sink);
            let ok = initial.is_ok();
            let _ = ready_tx.send(initial);
            if !ok {
                return;
            }

            if let Err(e) = source.run(&mut sink, &mut tear_down) {
                log::error!("device notification source exited: {e}");
            }
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                engine,
                source_stop,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(WatchError::Source(
                    "source thread died during initial enumeration".to_string(),
                ))
            }
        }
    }

    pub fn engine(&self) -> &WatchEngine {
        &self.engine
    }

    /// Snapshot of the currently cached interfaces, optionally filtered by
    /// a predicate record.
    pub fn get_all(&self, filter: Option<&DeviceInterface>) -> Vec<DeviceInterface> {
        self.engine.snapshot(filter)
    }

    /// Stops the source and the engine, joining both threads.
    pub fn stop(&mut self) {
        self.source_stop.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.engine.stop();
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
