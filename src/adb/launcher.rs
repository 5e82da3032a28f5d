// Subprocess plumbing: starting the ADB server daemon and running small
// helper command lines with `{}`-style substitution.
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use super::error::SetupFailure;

/// How long we wait for the server's `OK\n` acknowledgement.
const SERVER_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Walks `PATH` for an executable named `name`.
pub fn search_executable(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Spawns the ADB server detached and waits for its `OK\n` handshake.
///
/// The child inherits the write end of a pipe and reports readiness through
/// it (`adb fork-server server --reply-fd <fd>`). Any other outcome maps to
/// a [`SetupFailure`] code.
#[cfg(unix)]
pub fn start_server() -> Result<(), SetupFailure> {
    use std::io::Read;
    use std::os::fd::AsRawFd;
    use std::process::{Command, Stdio};

    let adb_path = search_executable("adb").ok_or(SetupFailure::AdbNotFound)?;

    let (ack_read, ack_write) =
        rustix::pipe::pipe().map_err(|_| SetupFailure::CreatePipeFailed)?;
    // Only the write end may leak into the child.
    rustix::io::fcntl_setfd(&ack_read, rustix::io::FdFlags::CLOEXEC)
        .map_err(|_| SetupFailure::CreatePipeFailed)?;

    let reply_fd = ack_write.as_raw_fd();
    let spawned = Command::new(&adb_path)
        .arg("fork-server")
        .arg("server")
        .arg("--reply-fd")
        .arg(reply_fd.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    drop(ack_write);

    let _child = spawned.map_err(|_| SetupFailure::CreateProcessFailed)?;

    let mut ack_file = std::fs::File::from(ack_read);
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut ack = [0u8; 3];
        let result = ack_file.read_exact(&mut ack).map(|_| ack);
        let _ = tx.send(result);
    });

    match rx.recv_timeout(SERVER_ACK_TIMEOUT) {
        Ok(Ok(ack)) if &ack == b"OK\n" => Ok(()),
        Ok(Ok(_)) => Err(SetupFailure::ServerRejected),
        Ok(Err(_)) | Err(_) => Err(SetupFailure::StartServerFailed),
    }
}

#[cfg(not(unix))]
pub fn start_server() -> Result<(), SetupFailure> {
    Err(SetupFailure::CreateProcessFailed)
}

/// Expands and tokenizes a helper command line.
///
/// Substitutions: `{}` and `{N}` from `vargs` (`{}` consumes positionally),
/// `{key}` from `kwargs`, `{key?t:f}` picks `t` when the value parses as
/// true, and `{arg0}` is the absolute path of the current executable.
/// Double quotes group spaces into one token; `\"` embeds a literal quote.
/// Unresolved braces pass through unchanged.
pub fn split_command_tokens(
    script: &str,
    vargs: &[String],
    kwargs: &HashMap<String, String>,
) -> Vec<String> {
    let chars: Vec<char> = script.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut next_positional = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                i += 1;
            }
            '\\' if i + 1 < chars.len() && chars[i + 1] == '"' => {
                current.push('"');
                i += 2;
            }
            '"' => {
                in_quotes = !in_quotes;
                i += 1;
            }
            '{' => {
                let close = chars[i + 1..].iter().position(|&c| c == '}');
                let Some(offset) = close else {
                    current.push('{');
                    i += 1;
                    continue;
                };
                let content: String = chars[i + 1..i + 1 + offset].iter().collect();
                match substitute(&content, vargs, kwargs, &mut next_positional) {
                    Some(value) => {
                        current.push_str(&value);
                        i += offset + 2;
                    }
                    None => {
                        // Keep the brace literal and rescan its interior.
                        current.push('{');
                        i += 1;
                    }
                }
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

fn substitute(
    content: &str,
    vargs: &[String],
    kwargs: &HashMap<String, String>,
    next_positional: &mut usize,
) -> Option<String> {
    if content.is_empty() {
        let index = *next_positional;
        *next_positional += 1;
        return vargs.get(index).cloned();
    }

    if content.len() < 5 && content.chars().all(|c| c.is_ascii_digit()) {
        let index: usize = content.parse().ok()?;
        return vargs.get(index).cloned();
    }

    if content == "arg0" {
        return env::current_exe()
            .ok()
            .map(|p| p.to_string_lossy().into_owned());
    }

    if let Some(question) = content.find('?') {
        let key = &content[..question];
        let value = kwargs.get(key)?;
        let is_true = value == "1" || value == "true";
        let arms = &content[question + 1..];
        return Some(match arms.rfind(':') {
            Some(colon) => {
                if is_true {
                    arms[..colon].to_string()
                } else {
                    arms[colon + 1..].to_string()
                }
            }
            None => {
                if is_true {
                    arms.to_string()
                } else {
                    String::new()
                }
            }
        });
    }

    kwargs.get(content).cloned()
}

/// Outcome of [`run_script`]: exit status per sequential command, or zero
/// when everything was dispatched detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptStatus(pub i32);

impl ScriptStatus {
    pub fn success(self) -> bool {
        self.0 == 0
    }
}

/// Runs an expanded command line without a shell.
///
/// `&&` splits the token list into commands run sequentially, stopping at
/// the first failure. A trailing lone `&` detaches the whole invocation:
/// commands are spawned without waiting and the status is reported as zero.
pub fn run_script(
    script: &str,
    vargs: &[String],
    kwargs: &HashMap<String, String>,
) -> std::io::Result<ScriptStatus> {
    let mut tokens = split_command_tokens(script, vargs, kwargs);

    let mut detach = false;
    if tokens.last().is_some_and(|t| t.as_str() == "&") {
        tokens.pop();
        detach = true;
    }

    let mut status = 0;
    for command in tokens.split(|t| t.as_str() == "&&") {
        let Some((program, args)) = command.split_first() else {
            continue;
        };

        let mut cmd = std::process::Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        if detach {
            // Fire and forget; the handle drop leaves the child running.
            let _ = cmd.spawn()?;
            continue;
        }

        let exit = cmd.status()?;
        status = exit.code().unwrap_or(-1);
        if status != 0 {
            break;
        }
    }

    Ok(ScriptStatus(status))
}
