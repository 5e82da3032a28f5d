use std::io::BufRead;
use std::process::ExitCode;

use adb_dev_watch::adb::{blocking, TransportOptions};
use adb_dev_watch::args::Args;
use adb_dev_watch::watch::{uevent, DeviceInterface, DeviceWatcher, NotificationSource};

fn emit_json(dev: &DeviceInterface, pretty: bool) {
    let rendered = if pretty {
        serde_json::to_string_pretty(dev)
    } else {
        serde_json::to_string(dev)
    };

    match rendered {
        Ok(line) => println!("{line}"),
        Err(e) => log::error!("failed to serialize device record: {e}"),
    }
}

#[cfg(target_os = "linux")]
fn open_source(
    args: &Args,
) -> Result<impl NotificationSource + 'static, adb_dev_watch::watch::WatchError> {
    use adb_dev_watch::watch::kernel::{KernelEventSocket, UeventSource};
    use adb_dev_watch::watch::sysfs::DEFAULT_SYSFS_ROOT;

    let socket = KernelEventSocket::open()?;
    UeventSource::new(
        socket,
        DEFAULT_SYSFS_ROOT,
        args.settings.usb_serial_vid_pids.clone(),
    )
}

#[cfg(not(target_os = "linux"))]
fn open_source(
    _args: &Args,
) -> Result<impl NotificationSource + 'static, adb_dev_watch::watch::WatchError> {
    Err::<adb_dev_watch::watch::ChannelSource, _>(adb_dev_watch::watch::WatchError::Source(
        "no device notification source for this platform".to_string(),
    ))
}

fn main() -> ExitCode {
    env_logger::init();

    let Some(args) = Args::parse() else {
        return ExitCode::SUCCESS;
    };

    if !args.settings.usb_serial_vid_pids.is_empty() && !uevent::is_elevated() {
        eprintln!("--usbserial-vidpid requires elevated privileges");
        return ExitCode::FAILURE;
    }

    // Ask the server to dial any requested remote endpoints before the
    // first poll; failures only mean the endpoint is not there yet.
    for endpoint in &args.ip_list {
        let options = TransportOptions::default();
        if let Err(e) = blocking::command_query(&format!("connect:{endpoint}"), &options) {
            log::debug!("connect {endpoint} failed: {e}");
        }
    }

    let source = match open_source(&args) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("create watcher failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let pretty = args.pretty;
    let watcher = DeviceWatcher::spawn(
        args.settings.clone(),
        source,
        Box::new(move |dev| emit_json(dev, pretty)),
    );

    let mut watcher = match watcher {
        Ok(watcher) => watcher,
        Err(e) => {
            eprintln!("create watcher failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    if args.watch {
        // Watch until the user closes stdin or sends a line.
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
    }

    watcher.stop();
    ExitCode::SUCCESS
}
