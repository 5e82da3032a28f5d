// Predicate-based blocking wait over the watch stream.
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::engine::EventCallback;
use super::source::{NotificationSource, WatchResult};
use super::types::{matches_target, DeviceInterface, WatchSettings};
use super::watcher::DeviceWatcher;

struct WaiterState {
    /// Pending predicate; cleared on match or timeout.
    target: Option<DeviceInterface>,
    matched: Option<DeviceInterface>,
}

struct WaiterShared {
    state: Mutex<WaiterState>,
    condvar: Condvar,
}

impl WaiterShared {
    fn on_event(&self, dev: &DeviceInterface) {
        let mut state = self.state.lock().unwrap();
        let hit = state
            .target
            .as_ref()
            .is_some_and(|target| matches_target(target, dev));
        if hit {
            state.target = None;
            state.matched = Some(dev.clone());
            drop(state);
            self.condvar.notify_all();
        }
    }
}

/// Blocks callers until an interface matching a predicate record shows up.
///
/// Sentinel fields in the target mean "don't care"; see
/// [`matches_target`](super::types::matches_target) for the exact rules.
pub struct WatchWaiter {
    shared: Arc<WaiterShared>,
    watcher: Option<DeviceWatcher>,
    /// Extra consumer callback, forwarded after waiter bookkeeping.
    forward: Option<EventCallback>,
}

impl WatchWaiter {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(WaiterShared {
                state: Mutex::new(WaiterState {
                    target: None,
                    matched: None,
                }),
                condvar: Condvar::new(),
            }),
            watcher: None,
            forward: None,
        }
    }

    /// Forwards every emission to `callback` in addition to the waiter's
    /// own matching. Must be set before [`WatchWaiter::start`].
    pub fn set_callback(&mut self, callback: EventCallback) {
        self.forward = Some(callback);
    }

    /// Starts the underlying watch.
    pub fn start<S>(&mut self, settings: WatchSettings, source: S) -> WatchResult<()>
    where
        S: NotificationSource + 'static,
    {
        let callback = self.make_callback();
        self.watcher = Some(DeviceWatcher::spawn(settings, source, callback)?);
        Ok(())
    }

    fn make_callback(&mut self) -> EventCallback {
        let shared = self.shared.clone();
        let forward = self.forward.take();
        Box::new(move |dev| {
            shared.on_event(dev);
            if let Some(forward) = &forward {
                forward(dev);
            }
        })
    }

    fn watcher(&self) -> Option<&DeviceWatcher> {
        self.watcher.as_ref()
    }

    /// Blocks until a cached or newly emitted interface matches `target`.
    ///
    /// `timeout_ms` in milliseconds; negative waits indefinitely, zero only
    /// polls the cache. Returns `None` on timeout, with the registration
    /// cleared.
    pub fn wait_for(
        &self,
        target: &DeviceInterface,
        timeout_ms: i64,
    ) -> Option<DeviceInterface> {
        let watcher = self.watcher()?;

        if timeout_ms == 0 {
            // Pure poll of the cache.
            return watcher.get_all(Some(target)).into_iter().next();
        }

        // Register before checking the cache so an emission in between is
        // not lost.
        {
            let mut state = self.shared.state.lock().unwrap();
            state.target = Some(target.clone());
            state.matched = None;
        }

        if let Some(existing) = watcher.get_all(Some(target)).into_iter().next() {
            let mut state = self.shared.state.lock().unwrap();
            state.target = None;
            state.matched = None;
            return Some(existing);
        }

        let mut state = self.shared.state.lock().unwrap();

        if timeout_ms < 0 {
            while state.matched.is_none() && state.target.is_some() {
                state = self.shared.condvar.wait(state).unwrap();
            }
        } else {
            let deadline = Duration::from_millis(timeout_ms as u64);
            let (next, _timed_out) = self
                .shared
                .condvar
                .wait_timeout_while(state, deadline, |s| {
                    s.matched.is_none() && s.target.is_some()
                })
                .unwrap();
            state = next;
        }

        // Clear any leftover registration so a timed-out waiter does not
        // linger as a match sink.
        state.target = None;
        state.matched.take()
    }

    /// Convenience wrapper: wait forever.
    pub fn wait(&self, target: &DeviceInterface) -> Option<DeviceInterface> {
        self.wait_for(target, -1)
    }

    /// Snapshot of cached interfaces passing `filter`.
    pub fn get_all(&self, filter: Option<&DeviceInterface>) -> Vec<DeviceInterface> {
        self.watcher()
            .map(|w| w.get_all(filter))
            .unwrap_or_default()
    }

    /// Stops the underlying watch.
    pub fn stop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
    }
}

impl Default for WatchWaiter {
    fn default() -> Self {
        Self::new()
    }
}
