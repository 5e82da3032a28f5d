// Host-service client: queries and commands against the ADB server, plus
// the device-level operations that ride on a switched transport.
use std::time::Duration;

use tokio::io::AsyncReadExt;

use super::error::{AdbError, AdbResult};
use super::shell;
use super::transport::{self, connect, read_service_string, read_status};
use super::types::{feature, DeviceInfo, ShellOutput, TransportOptions, TransportType};

/// Timeout for the device to come back after an adbd root/unroot restart.
const ROOT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(6);

/// Prefixes `command` with the host selector matching `options`, using the
/// same precedence as transport switching.
pub(crate) fn format_host_command(command: &str, options: &TransportOptions) -> String {
    if let Some(id) = options.transport_id {
        return format!("host-transport-id:{id}:{command}");
    }

    if !options.serial.is_empty() {
        return format!("host-serial:{}:{command}", options.serial);
    }

    match options.transport_type {
        TransportType::Usb => format!("host-usb:{command}"),
        TransportType::Local => format!("host-local:{command}"),
        TransportType::Any => format!("host:{command}"),
    }
}

/// Host options matching `options`' server endpoint but with no transport
/// selection: host-prefixed services embed the target themselves.
fn host_endpoint(options: &TransportOptions) -> TransportOptions {
    TransportOptions {
        host: options.host.clone(),
        port: options.port,
        launch_server_if_needed: options.launch_server_if_needed,
        ..Default::default()
    }
}

/// A connection error means no server is listening; callers probing server
/// state read that as an empty answer when they chose not to auto-launch.
fn swallow_probe_failure(err: AdbError, options: &TransportOptions) -> AdbResult<String> {
    match err {
        AdbError::Connection { .. } if !options.launch_server_if_needed => Ok(String::new()),
        other => Err(other),
    }
}

/// Sends `service` verbatim and reads one length-prefixed response.
pub async fn query(service: &str, options: &TransportOptions) -> AdbResult<String> {
    let attempt = async {
        let (mut stream, _) = connect(service, options).await?;
        read_service_string(&mut stream).await
    };

    match attempt.await {
        Ok(response) => Ok(response),
        Err(err) => swallow_probe_failure(err, options),
    }
}

/// Runs a host-prefixed command that answers with a second status word.
///
/// With a timeout armed, a late status abandons the connection and reports
/// `CommandTimeout`; dropping the socket kills the in-flight read.
pub async fn command(
    command: &str,
    options: &TransportOptions,
    timeout: Option<Duration>,
) -> AdbResult<()> {
    let service = format_host_command(command, options);
    let (mut stream, _) = connect(&service, &host_endpoint(options)).await?;

    match timeout {
        Some(duration) => tokio::time::timeout(duration, read_status(&mut stream))
            .await
            .map_err(|_| AdbError::CommandTimeout { duration })?,
        None => read_status(&mut stream).await,
    }
}

/// Runs a host-prefixed command and reads one length-prefixed response.
pub async fn command_query(command: &str, options: &TransportOptions) -> AdbResult<String> {
    let service = format_host_command(command, options);
    let attempt = async {
        let (mut stream, _) = connect(&service, &host_endpoint(options)).await?;
        read_service_string(&mut stream).await
    };

    match attempt.await {
        Ok(response) => Ok(response),
        Err(err) => swallow_probe_failure(err, options),
    }
}

/// Opens `command` on a switched transport and drains the raw response
/// until the server closes the connection.
pub async fn command_connect(command: &str, options: &TransportOptions) -> AdbResult<Vec<u8>> {
    let (mut stream, _) = connect(command, options).await?;

    let mut output = Vec::new();
    stream.read_to_end(&mut output).await?;
    Ok(output)
}

/// Best-effort `host:kill`; never raises.
pub async fn kill(options: &TransportOptions) {
    let attempt = async {
        let addr = transport::resolve_endpoint(options).await?;
        let mut stream = tokio::net::TcpStream::connect(addr)
            .await
            .map_err(|e| AdbError::Connection {
                message: e.to_string(),
            })?;

        transport::send_service_string(&mut stream, "host:kill").await?;

        // The server may acknowledge before exiting; consume up to 4 bytes.
        let mut ack = [0u8; 4];
        let _ = stream.read(&mut ack).await;
        Ok::<(), AdbError>(())
    };

    if let Err(e) = attempt.await {
        log::debug!("host:kill ignored failure: {e}");
    }
}

/// Parses one `host:devices-l` line: serial, state, then `key:value` fields.
pub(crate) fn parse_device_line(line: &str) -> Option<DeviceInfo> {
    let mut items = line.split_whitespace();
    let serial = items.next()?;
    let state = items.next()?;

    let mut dev = DeviceInfo {
        serial: serial.to_string(),
        state: state.to_string(),
        ..Default::default()
    };

    for item in items {
        if let Some(value) = item.strip_prefix("product:") {
            dev.product = value.to_string();
        } else if let Some(value) = item.strip_prefix("model:") {
            dev.model = value.to_string();
        } else if let Some(value) = item.strip_prefix("device:") {
            dev.device = value.to_string();
        } else if let Some(value) = item.strip_prefix("transport_id:") {
            dev.transport_id = value.parse().unwrap_or(0);
        }
    }

    Some(dev)
}

/// Lists attached devices via `host:devices-l`.
///
/// `device_only` keeps entries whose state is exactly `device`;
/// `target_serial` narrows the answer to one serial.
pub async fn list_devices(
    options: &TransportOptions,
    device_only: bool,
    target_serial: Option<&str>,
) -> AdbResult<Vec<DeviceInfo>> {
    let listing = query("host:devices-l", options).await?;

    let mut out = Vec::new();
    for line in listing.lines() {
        let Some(dev) = parse_device_line(line) else {
            continue;
        };

        if device_only && dev.state != "device" {
            continue;
        }
        if let Some(serial) = target_serial {
            if serial != dev.serial {
                continue;
            }
        }

        out.push(dev);
    }

    Ok(out)
}

/// Fetches the daemon's advertised feature set.
pub async fn get_features(options: &TransportOptions) -> AdbResult<Vec<String>> {
    let features = command_query("features", options).await?;
    Ok(features
        .split(',')
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect())
}

pub(crate) fn has_feature(features: &[String], name: &str) -> bool {
    features.iter().any(|f| f == name)
}

/// Blocks until the selected transport reaches `state`.
pub async fn wait_device(
    state: &str,
    options: &TransportOptions,
    timeout: Option<Duration>,
) -> AdbResult<()> {
    let target_type = match options.transport_type {
        TransportType::Usb => "usb",
        TransportType::Local => "local",
        TransportType::Any => "any",
    };

    command(&format!("wait-for-{target_type}-{state}"), options, timeout).await
}

/// Executes a shell command, choosing v2 framing when the daemon advertises
/// `shell_v2` (an explicit override wins).
pub async fn execute_shell(
    cmd: &str,
    options: &TransportOptions,
    use_shell_protocol: Option<bool>,
) -> AdbResult<ShellOutput> {
    let shell_protocol = match use_shell_protocol {
        Some(explicit) => explicit,
        None => {
            let features = get_features(options).await?;
            has_feature(&features, feature::SHELL_V2)
        }
    };

    let service = shell::shell_service(cmd, shell_protocol);
    let (mut stream, _) = connect(&service, options).await?;

    if shell_protocol {
        shell::read_shell_output(&mut stream).await
    } else {
        shell::read_raw_output(&mut stream).await
    }
}

/// Restarts adbd as root (or drops back with `unroot`), then waits for the
/// transport to cycle.
pub async fn root(enable: bool, options: &TransportOptions) -> AdbResult<()> {
    let service = if enable { "root:" } else { "unroot:" };
    let (mut stream, transport_id) = connect(service, options).await?;

    // Figure out whether adbd actually restarted.
    let mut buffer = [0u8; 256];
    let n = stream.read(&mut buffer).await?;
    let answer = String::from_utf8_lossy(&buffer[..n]);
    if answer.contains("already running as root") {
        return Ok(());
    }
    drop(stream);

    wait_device(
        "disconnect",
        &TransportOptions {
            host: options.host.clone(),
            port: options.port,
            transport_id: Some(transport_id),
            launch_server_if_needed: options.launch_server_if_needed,
            ..Default::default()
        },
        None,
    )
    .await?;

    // Wait for the device to come back. A caller who pinned the transport
    // by id has nothing left to wait on; that id died with the restart.
    if options.transport_id.is_none() {
        wait_device("device", options, Some(ROOT_RECONNECT_TIMEOUT)).await?;
    }

    Ok(())
}

/// Remounts partitions read-write.
///
/// Daemons advertising `remount_shell` take the shell form (v2 framing when
/// available); everything else falls back to the legacy `remount:` service.
pub async fn remount(
    options: &TransportOptions,
    use_remount_shell: Option<bool>,
    args: &str,
) -> AdbResult<()> {
    let (remount_shell, shell_protocol) = match use_remount_shell {
        Some(explicit) => (explicit, false),
        None => {
            let features = get_features(options).await?;
            if has_feature(&features, feature::REMOUNT_SHELL) {
                (true, has_feature(&features, feature::SHELL_V2))
            } else {
                (false, false)
            }
        }
    };

    if remount_shell {
        let service = shell::shell_service(&format!("remount {args}"), shell_protocol);
        let (mut stream, _) = connect(&service, options).await?;

        if shell_protocol {
            shell::read_shell_output(&mut stream).await?;
        } else {
            shell::read_raw_output(&mut stream).await?;
        }
        Ok(())
    } else {
        command_connect(&format!("remount:{args}"), options).await?;
        Ok(())
    }
}
