// Shell sub-protocol readers: v1 streams raw stdout until EOF, v2 frames
// stdout/stderr/exit as `id:u8 + len:u32le` packets.
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::AdbResult;
use super::types::ShellOutput;

mod packet_id {
    pub const STDOUT: u8 = 1;
    pub const STDERR: u8 = 2;
    pub const EXIT: u8 = 3;
}

const HEADER_SIZE: usize = 5;
const BUFFER_SIZE: usize = 40960;

/// Formats the service string for one shell invocation.
pub(crate) fn shell_service(command: &str, shell_protocol: bool) -> String {
    if shell_protocol {
        format!("shell,v2,raw:{command}")
    } else {
        format!("shell:{command}")
    }
}

/// v1 mode: everything until EOF is stdout, the exit code reads as zero.
pub(crate) async fn read_raw_output<S>(stream: &mut S) -> AdbResult<ShellOutput>
where
    S: AsyncRead + Unpin,
{
    let mut stdout = Vec::new();
    stream.read_to_end(&mut stdout).await?;

    Ok(ShellOutput {
        exit_code: 0,
        stdout,
        stderr: Vec::new(),
    })
}

/// v2 mode: demultiplexes framed packets into stdout/stderr and stops at the
/// exit packet, whose first payload byte is the exit code.
///
/// A packet payload may exceed the local buffer; the unread remainder is
/// carried in `bytes_left` and consumed across subsequent reads.
pub(crate) async fn read_shell_output<S>(stream: &mut S) -> AdbResult<ShellOutput>
where
    S: AsyncRead + Unpin,
{
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = 0u8;

    let mut packet_id = 0u8;
    let mut bytes_left = 0usize;
    let mut buffer = [0u8; BUFFER_SIZE];

    loop {
        // Only read a new header once the previous packet is drained.
        if bytes_left == 0 {
            let mut header = [0u8; HEADER_SIZE];
            stream.read_exact(&mut header).await?;

            packet_id = header[0];
            bytes_left =
                u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        }

        let chunk = bytes_left.min(buffer.len());
        if chunk > 0 {
            stream.read_exact(&mut buffer[..chunk]).await?;
            bytes_left -= chunk;
        }

        match packet_id {
            packet_id::STDOUT => stdout.extend_from_slice(&buffer[..chunk]),
            packet_id::STDERR => stderr.extend_from_slice(&buffer[..chunk]),
            packet_id::EXIT => {
                if chunk > 0 {
                    exit_code = buffer[0];
                }
                break;
            }
            _ => {}
        }
    }

    Ok(ShellOutput {
        exit_code,
        stdout,
        stderr,
    })
}
