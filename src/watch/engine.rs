// Reconciliation engine: merges OS interface events with the ADB server's
// device list into one filtered, identity-stable stream.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::adb::{blocking, AdbResult, DeviceInfo, TransportOptions};

use super::types::{interface_identity, DeviceInterface, DeviceType, WatchSettings};
use super::worker::{TaskWorker, WorkerHandle};

const QUALCOMM_VID: u16 = 0x05C6;
const QDL_PID: u16 = 0x9008;

static REMOTE_SERIAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})$")
        .expect("remote serial regex")
});

/// Splits an `ip:port` serial into its parts, or `None` for USB serials.
fn parse_remote_serial(serial: &str) -> Option<(String, u16)> {
    let captures = REMOTE_SERIAL.captures(serial)?;
    let ip = captures.get(1)?.as_str().to_string();
    let port = captures.get(2)?.as_str().parse().ok()?;
    Some((ip, port))
}

/// Where the engine gets the ADB server's device list. The indirection
/// keeps the reconciliation logic testable without a live server.
pub trait DeviceLister: Send {
    fn list_devices(&mut self) -> AdbResult<Vec<DeviceInfo>>;
}

/// The production lister: `host:devices-l`, states filtered to `device`.
pub struct AdbServerLister {
    options: TransportOptions,
}

impl AdbServerLister {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

impl DeviceLister for AdbServerLister {
    fn list_devices(&mut self) -> AdbResult<Vec<DeviceInfo>> {
        blocking::list_devices(&self.options, true, None)
    }
}

/// Engine timing knobs. The defaults are the production values; tests
/// shrink them.
#[derive(Debug, Clone)]
pub struct EngineTuning {
    pub poll_period: Duration,
    pub retry_cap: u32,
    pub retry_delay: Duration,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_secs(3),
            retry_cap: 60,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Envelope carrying a pending USB-ADB record through the worker.
struct Trigger {
    node: DeviceInterface,
    round: u32,
}

pub type EventCallback = Box<dyn Fn(&DeviceInterface) + Send + Sync>;

struct EngineState {
    cached: HashMap<String, DeviceInterface>,
    /// `(serial, identity)` pairs already attributed to a cached record.
    adb_serials: Vec<(String, String)>,
}

struct EngineShared {
    settings: WatchSettings,
    state: Mutex<EngineState>,
    /// Serializes callback invocations; never taken while `state` is held.
    emit_lock: Mutex<()>,
    callback: EventCallback,
}

impl EngineShared {
    fn emit(&self, record: &DeviceInterface) {
        let _guard = self.emit_lock.lock().unwrap();
        (self.callback)(record);
    }
}

/// The reconciliation engine. OS sources feed [`WatchEngine::on_interface_enumerated`]
/// and [`WatchEngine::on_interface_off`]; a periodic worker folds the ADB
/// server's view into pending USB-ADB records.
pub struct WatchEngine {
    shared: Arc<EngineShared>,
    adb_worker: Mutex<TaskWorker<Trigger>>,
    worker_handle: Option<WorkerHandle<Trigger>>,
}

impl WatchEngine {
    pub fn new(settings: WatchSettings, callback: EventCallback) -> Self {
        let options = TransportOptions::default();
        Self::with_lister(
            settings,
            callback,
            Box::new(AdbServerLister::new(options)),
            EngineTuning::default(),
        )
    }

    pub(crate) fn with_lister(
        settings: WatchSettings,
        callback: EventCallback,
        lister: Box<dyn DeviceLister>,
        tuning: EngineTuning,
    ) -> Self {
        let adb_enabled = settings.enable_adb_client;
        let shared = Arc::new(EngineShared {
            settings,
            state: Mutex::new(EngineState {
                cached: HashMap::new(),
                adb_serials: Vec::new(),
            }),
            emit_lock: Mutex::new(()),
            callback,
        });

        let mut worker = TaskWorker::new();
        worker.set_consume_all_requests(true);
        let mut worker_handle = None;

        if adb_enabled {
            let handle = worker.handle();
            worker_handle = Some(handle.clone());

            let step_shared = shared.clone();
            let step_handle = handle;
            let step_tuning = tuning.clone();
            let mut lister = lister;
            worker.start_periodic(tuning.poll_period, move |req| {
                adb_step(
                    &step_shared,
                    &step_handle,
                    lister.as_mut(),
                    &step_tuning,
                    req,
                );
            });
        }

        Self {
            shared,
            adb_worker: Mutex::new(worker),
            worker_handle,
        }
    }

    fn adb_enabled(&self) -> bool {
        self.shared.settings.enable_adb_client && self.worker_handle.is_some()
    }

    /// Arrival of one OS-level interface record.
    pub fn on_interface_enumerated(&self, interface_id: &str, mut record: DeviceInterface) {
        classify(&mut record);

        if !self.shared.settings.accepts(&record) {
            return;
        }

        record.identity = interface_identity(interface_id);

        if record.kind.contains(DeviceType::USB_CONNECTED_ADB) && self.adb_enabled() {
            // Withheld until the poller merges the ADB-side attributes.
            {
                let mut state = self.shared.state.lock().unwrap();
                state.cached.insert(record.identity.clone(), record.clone());
            }
            if let Some(handle) = &self.worker_handle {
                handle.push_request(Trigger { node: record, round: 0 });
            }
            return;
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            state.cached.insert(record.identity.clone(), record.clone());
        }
        self.shared.emit(&record);
    }

    /// Departure of one OS-level interface.
    pub fn on_interface_off(&self, interface_id: &str) {
        self.retire_identity(&interface_identity(interface_id));
    }

    fn retire_identity(&self, identity: &str) {
        retire_identity_shared(&self.shared, self.worker_handle.as_ref(), identity);
    }

    /// Snapshot of cached records matching `filter` (`None` = everything).
    pub fn snapshot(&self, filter: Option<&DeviceInterface>) -> Vec<DeviceInterface> {
        let state = self.shared.state.lock().unwrap();
        state
            .cached
            .values()
            .filter(|dev| filter.map_or(true, |f| super::types::matches_target(f, dev)))
            .cloned()
            .collect()
    }

    /// Stops the ADB worker and joins its thread.
    pub fn stop(&self) {
        if let Ok(mut worker) = self.adb_worker.lock() {
            worker.stop();
        }
    }
}

impl Drop for WatchEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Maps vendor-specific class triples and known vid/pid pairs onto type
/// bits before filtering.
fn classify(record: &mut DeviceInterface) {
    if record.usb_class == 0xff {
        match (record.usb_sub_class, record.usb_proto) {
            (0x42, 0x01) => record.kind |= DeviceType::ADB,
            (0x42, 0x03) => record.kind |= DeviceType::FASTBOOT,
            (0x50, 0x01) => record.kind |= DeviceType::HDC,
            _ => {}
        }
    }

    if record.vid == QUALCOMM_VID && record.pid == QDL_PID {
        record.kind |= DeviceType::QDL;
    }
}

fn merge_adb_info(node: &mut DeviceInterface, dev: &DeviceInfo) {
    node.product = dev.product.clone();
    node.model = dev.model.clone();
    node.device = dev.device.clone();
}

/// One wake of the periodic ADB worker: reconcile the server's device list
/// against tracked serials, correlate any pending Trigger, and requeue it
/// when the snapshot had nothing for it yet.
fn adb_step(
    shared: &Arc<EngineShared>,
    handle: &WorkerHandle<Trigger>,
    lister: &mut dyn DeviceLister,
    tuning: &EngineTuning,
    req: Option<Trigger>,
) {
    let mut pending = match req {
        Some(trigger) if trigger.node.off => {
            // A departure only needs its serial untracked.
            let mut state = shared.state.lock().unwrap();
            state
                .adb_serials
                .retain(|(_, identity)| identity != &trigger.node.identity);
            None
        }
        other => other,
    };

    let devs = match lister.list_devices() {
        Ok(devs) => devs,
        Err(e) => {
            // The server went away; this worker is done for good.
            log::error!("adb device polling failed, stopping reconciliation: {e}");
            handle.request_stop();
            return;
        }
    };

    // Removal sweep: tracked serials that vanished from the server. Only
    // remote endpoints are torn down here; USB departures come from the OS.
    let mut removed_remote_identities = Vec::new();
    {
        let mut state = shared.state.lock().unwrap();
        state.adb_serials.retain(|(serial, identity)| {
            if devs.iter().any(|d| &d.serial == serial) {
                true
            } else {
                if parse_remote_serial(serial).is_some() {
                    removed_remote_identities.push(identity.clone());
                }
                false
            }
        });
    }
    for identity in removed_remote_identities {
        retire_identity_shared(shared, Some(handle), &identity);
    }

    // Addition sweep.
    let tracked: Vec<String> = {
        let state = shared.state.lock().unwrap();
        state.adb_serials.iter().map(|(s, _)| s.clone()).collect()
    };

    let mut newly_added: Vec<DeviceInfo> = Vec::new();
    for dev in devs {
        if tracked.iter().any(|s| s == &dev.serial) {
            continue;
        }

        if let Some((ip, port)) = parse_remote_serial(&dev.serial) {
            let identity = interface_identity(&dev.serial);
            {
                let mut state = shared.state.lock().unwrap();
                state.adb_serials.push((dev.serial.clone(), identity));
            }

            let mut remote = DeviceInterface {
                serial: dev.serial.clone(),
                ip,
                port,
                kind: DeviceType::REMOTE_ADB,
                ..Default::default()
            };
            merge_adb_info(&mut remote, &dev);

            arrive_remote(shared, &dev.serial, remote);
        } else if let Some(trigger) = &pending {
            if trigger.node.serial.is_empty() {
                newly_added.push(dev);
            } else if trigger.node.serial == dev.serial {
                // An exact serial match outranks every other candidate.
                let mut dev = dev;
                dev.transport_id = -1;
                newly_added.push(dev);
            }
        }
    }

    // Correlation: the best candidate merges into the pending record.
    if !newly_added.is_empty() {
        if let Some(trigger) = pending.take() {
            newly_added.sort_by_key(|d| d.transport_id);
            let best = &newly_added[0];

            let mut node = trigger.node;
            node.serial = best.serial.clone();
            merge_adb_info(&mut node, best);

            {
                let mut state = shared.state.lock().unwrap();
                state
                    .adb_serials
                    .push((best.serial.clone(), node.identity.clone()));
                state.cached.insert(node.identity.clone(), node.clone());
            }

            shared.emit(&node);
        }
    }

    // Retry: requeue the still-uncorrelated Trigger until the cap.
    if let Some(trigger) = pending {
        if trigger.round < tuning.retry_cap {
            let identity = trigger.node.identity.clone();
            let requeued = handle.push_request_conditional(
                Trigger {
                    node: trigger.node,
                    round: trigger.round + 1,
                },
                |queued| queued.node.identity == identity,
            );
            if requeued {
                std::thread::sleep(tuning.retry_delay);
            }
        } else {
            // The record stays cached, but the consumer never hears of it.
            log::warn!(
                "adb correlation gave up on {} after {} rounds",
                trigger.node.identity,
                trigger.round
            );
        }
    }
}

/// Remote arrival: filter, cache, emit. Remote records never re-enter the
/// worker, their type carries no USB bit.
fn arrive_remote(shared: &Arc<EngineShared>, serial: &str, mut record: DeviceInterface) {
    classify(&mut record);
    if !shared.settings.accepts(&record) {
        return;
    }

    record.identity = interface_identity(serial);
    {
        let mut state = shared.state.lock().unwrap();
        state.cached.insert(record.identity.clone(), record.clone());
    }
    shared.emit(&record);
}

/// Departure by identity, shared between the engine front and the worker's
/// remote teardown sweep.
fn retire_identity_shared(
    shared: &Arc<EngineShared>,
    handle: Option<&WorkerHandle<Trigger>>,
    identity: &str,
) {
    let node = {
        let mut state = shared.state.lock().unwrap();
        state.cached.remove(identity)
    };
    let Some(mut node) = node else {
        return;
    };
    node.off = true;

    if node.kind.contains(DeviceType::USB_CONNECTED_ADB) {
        if let Some(handle) = handle {
            handle.push_request(Trigger {
                node: node.clone(),
                round: 0,
            });

            // Never correlated: the consumer saw no arrival, so it gets no
            // departure either.
            if node.model.is_empty() && node.device.is_empty() {
                return;
            }
        }
    }

    shared.emit(&node);
}
