// Smart-socket transport: endpoint resolution, service framing, status
// words and transport switching.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::error::{AdbError, AdbResult};
use super::launcher;
use super::types::{TransportOptions, TransportType};

pub(crate) const DEFAULT_SERVER_HOST: &str = "localhost";
pub(crate) const DEFAULT_SERVER_PORT: u16 = 5037;

/// Upper bound for one framed service string, matching the server limit.
pub(crate) const MAX_PAYLOAD: usize = 1024 * 1024;

/// Process-wide one-shot guard: only the first failing connect may spawn the
/// server. Later failures error out instead of respawning.
static SERVER_LAUNCH_TRIED: AtomicBool = AtomicBool::new(false);

/// Writes a service string as `"%04x"` hex length plus payload.
pub(crate) async fn send_service_string<S>(stream: &mut S, service: &str) -> AdbResult<()>
where
    S: AsyncWrite + Unpin,
{
    if service.len() > MAX_PAYLOAD - 4 {
        return Err(AdbError::protocol("message too big"));
    }

    let framed = format!("{:04x}{}", service.len(), service);
    stream.write_all(framed.as_bytes()).await?;
    Ok(())
}

/// Reads one length-prefixed string: 4 ASCII hex digits, then that many bytes.
pub(crate) async fn read_service_string<S>(stream: &mut S) -> AdbResult<String>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await?;

    let text = std::str::from_utf8(&prefix)
        .map_err(|_| AdbError::protocol("length prefix is not ASCII"))?;
    let length = usize::from_str_radix(text, 16)
        .map_err(|_| AdbError::protocol(format!("bad length prefix {text:?}")))?;

    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            AdbError::protocol("response body truncated")
        } else {
            AdbError::Io { source: e }
        }
    })?;

    String::from_utf8(payload).map_err(|_| AdbError::protocol("response is not UTF-8"))
}

/// Reads the 4-byte status word. `OKAY` succeeds, `FAIL` carries a
/// length-prefixed message, anything else is a protocol fault.
pub(crate) async fn read_status<S>(stream: &mut S) -> AdbResult<()>
where
    S: AsyncRead + Unpin,
{
    let mut status = [0u8; 4];
    stream.read_exact(&mut status).await?;

    if &status == b"OKAY" {
        return Ok(());
    }

    if &status != b"FAIL" {
        return Err(AdbError::protocol(format!(
            "status {:02x} {:02x} {:02x} {:02x}?!",
            status[0], status[1], status[2], status[3]
        )));
    }

    let message = read_service_string(stream).await?;
    Err(AdbError::Server(message))
}

/// Sends the transport selector for `options` and returns the transport id
/// the server assigned.
pub(crate) async fn switch_transport<S>(
    stream: &mut S,
    options: &TransportOptions,
) -> AdbResult<i64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let selector = if let Some(id) = options.transport_id {
        format!("host:transport-id:{id}")
    } else if !options.serial.is_empty() {
        format!("host:tport:serial:{}", options.serial)
    } else {
        match options.transport_type {
            TransportType::Usb => "host:tport:usb".to_string(),
            TransportType::Local => "host:tport:local".to_string(),
            TransportType::Any => "host:tport:any".to_string(),
        }
    };

    send_service_string(stream, &selector).await?;
    read_status(stream).await?;

    // The `tport:` form is answered with the assigned id; `transport-id:`
    // already names it.
    if let Some(id) = options.transport_id {
        return Ok(id);
    }

    let mut raw = [0u8; 8];
    stream.read_exact(&mut raw).await?;
    Ok(i64::from_le_bytes(raw))
}

/// Resolves the configured server endpoint to the first IPv4 address.
pub(crate) async fn resolve_endpoint(options: &TransportOptions) -> AdbResult<SocketAddr> {
    let host = if options.host.is_empty() {
        DEFAULT_SERVER_HOST
    } else {
        &options.host
    };
    let port = if options.port == 0 {
        DEFAULT_SERVER_PORT
    } else {
        options.port
    };

    let candidates = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AdbError::Connection {
            message: format!("resolve {host}:{port}: {e}"),
        })?;

    candidates
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| AdbError::Connection {
            message: format!("no IPv4 address for {host}:{port}"),
        })
}

/// Connects to the server, auto-launching it once per process when allowed.
pub(crate) async fn connect_stream(
    addr: SocketAddr,
    options: &TransportOptions,
) -> AdbResult<TcpStream> {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if !options.launch_server_if_needed
                    || SERVER_LAUNCH_TRIED.swap(true, Ordering::SeqCst)
                {
                    return Err(AdbError::Connection {
                        message: e.to_string(),
                    });
                }
            }
        }

        log::debug!("adb server not reachable at {addr}, launching it");
        let launched = tokio::task::spawn_blocking(launcher::start_server)
            .await
            .map_err(|e| AdbError::Connection {
                message: format!("launcher task failed: {e}"),
            })?;
        if let Err(failure) = launched {
            log::warn!("adb server launch failed with code {}", failure.code());
            return Err(AdbError::Connection {
                message: "start adb server failed".to_string(),
            });
        }

        // Loop and try the connect again; the guard stops a second spawn.
    }
}

/// Opens a connection ready for `service`: connected, transport-switched for
/// non-`host` services, service sent, first status consumed.
///
/// Returns the stream and the transport id assigned by the switch (zero for
/// `host` services, which never switch).
pub(crate) async fn connect(
    service: &str,
    options: &TransportOptions,
) -> AdbResult<(TcpStream, i64)> {
    let addr = resolve_endpoint(options).await?;
    let mut stream = connect_stream(addr, options).await?;

    let mut transport_id = 0;
    if !service.starts_with("host") {
        transport_id = switch_transport(&mut stream, options).await?;
    }

    send_service_string(&mut stream, service).await?;
    read_status(&mut stream).await?;

    Ok((stream, transport_id))
}
