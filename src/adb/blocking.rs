// Synchronous entry points. Each call drives the async operation to
// completion on its own current-thread runtime, so concurrent callers never
// share an event loop.
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::{AdbError, AdbResult};
use super::types::{DeviceInfo, FileStat, ListItem, ShellOutput, TransportOptions};
use super::{host, sync};

fn block_on<F: std::future::Future>(future: F) -> AdbResult<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| AdbError::Io { source: e })?;
    Ok(runtime.block_on(future))
}

/// Best-effort server shutdown; swallows every error.
pub fn kill(options: &TransportOptions) {
    if let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        runtime.block_on(host::kill(options));
    }
}

pub fn query(service: &str, options: &TransportOptions) -> AdbResult<String> {
    block_on(host::query(service, options))?
}

pub fn command(
    cmd: &str,
    options: &TransportOptions,
    timeout: Option<Duration>,
) -> AdbResult<()> {
    block_on(host::command(cmd, options, timeout))?
}

pub fn command_query(cmd: &str, options: &TransportOptions) -> AdbResult<String> {
    block_on(host::command_query(cmd, options))?
}

pub fn command_connect(cmd: &str, options: &TransportOptions) -> AdbResult<Vec<u8>> {
    block_on(host::command_connect(cmd, options))?
}

pub fn list_devices(
    options: &TransportOptions,
    device_only: bool,
    target_serial: Option<&str>,
) -> AdbResult<Vec<DeviceInfo>> {
    block_on(host::list_devices(options, device_only, target_serial))?
}

pub fn get_features(options: &TransportOptions) -> AdbResult<Vec<String>> {
    block_on(host::get_features(options))?
}

pub fn wait_device(
    state: &str,
    options: &TransportOptions,
    timeout: Option<Duration>,
) -> AdbResult<()> {
    block_on(host::wait_device(state, options, timeout))?
}

pub fn execute_shell(
    cmd: &str,
    options: &TransportOptions,
    use_shell_protocol: Option<bool>,
) -> AdbResult<ShellOutput> {
    block_on(host::execute_shell(cmd, options, use_shell_protocol))?
}

pub fn root(enable: bool, options: &TransportOptions) -> AdbResult<()> {
    block_on(host::root(enable, options))?
}

pub fn remount(
    options: &TransportOptions,
    use_remount_shell: Option<bool>,
    args: &str,
) -> AdbResult<()> {
    block_on(host::remount(options, use_remount_shell, args))?
}

pub fn sync_stat(path: &str, options: &TransportOptions) -> AdbResult<FileStat> {
    block_on(sync::sync_stat(path, options))?
}

pub fn sync_list(path: &str, options: &TransportOptions) -> AdbResult<Vec<ListItem>> {
    block_on(sync::sync_list(path, options))?
}

pub fn sync_pull(srcs: &[String], dst: &Path, options: &TransportOptions) -> AdbResult<()> {
    block_on(sync::sync_pull(srcs, dst, options))?
}

pub fn sync_pull_buffer(src: &str, options: &TransportOptions) -> AdbResult<Vec<u8>> {
    block_on(sync::sync_pull_buffer(src, options))?
}

pub fn sync_push(srcs: &[PathBuf], dst: &str, options: &TransportOptions) -> AdbResult<()> {
    block_on(sync::sync_push(srcs, dst, options))?
}

pub fn sync_push_buffer(
    payload: &[u8],
    dst: &str,
    options: &TransportOptions,
) -> AdbResult<()> {
    block_on(sync::sync_push_buffer(payload, dst, options))?
}
