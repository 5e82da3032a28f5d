// Tests for the smart-socket client: framing, status words, transport
// selection, the shell and sync sub-protocols, and end-to-end flows
// against a scripted loopback server.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};

use super::error::AdbError;
use super::host;
use super::launcher;
use super::shell;
use super::sync::{self, SyncSession};
use super::transport;
use super::types::{TransportOptions, TransportType};

// ============================================================
// SERVER-SIDE HELPERS
// ============================================================

async fn server_read_framed<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await.unwrap();
    let len = usize::from_str_radix(std::str::from_utf8(&prefix).unwrap(), 16).unwrap();
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    String::from_utf8(payload).unwrap()
}

async fn server_write_framed<S: tokio::io::AsyncWrite + Unpin>(stream: &mut S, body: &str) {
    let framed = format!("{:04x}{}", body.len(), body);
    stream.write_all(framed.as_bytes()).await.unwrap();
}

async fn server_accept_transport<S>(stream: &mut S, expected_selector: &str) -> i64
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let selector = server_read_framed(stream).await;
    assert_eq!(selector, expected_selector, "unexpected transport selector");
    stream.write_all(b"OKAY").await.unwrap();

    let transport_id = 7i64;
    if !expected_selector.starts_with("host:transport-id:") {
        stream.write_all(&transport_id.to_le_bytes()).await.unwrap();
    }
    transport_id
}

fn loopback_options(addr: SocketAddr) -> TransportOptions {
    TransportOptions {
        host: "127.0.0.1".to_string(),
        port: addr.port(),
        launch_server_if_needed: false,
        ..Default::default()
    }
}

async fn spawn_server<F, Fut>(handler: F) -> (SocketAddr, tokio::task::JoinHandle<()>)
where
    F: FnOnce(TcpListener) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move { handler(listener).await });
    (addr, handle)
}

async fn accept(listener: &TcpListener) -> TcpStream {
    listener.accept().await.unwrap().0
}

// ============================================================
// SERVICE-STRING FRAMING
// ============================================================

#[tokio::test]
async fn test_framing_round_trip() {
    let (mut client, mut server) = tokio::io::duplex(4096);

    transport::send_service_string(&mut client, "host:devices-l")
        .await
        .unwrap();

    let echoed = server_read_framed(&mut server).await;
    assert_eq!(echoed, "host:devices-l");

    server_write_framed(&mut server, "host:devices-l").await;
    let read_back = transport::read_service_string(&mut client).await.unwrap();
    assert_eq!(read_back, "host:devices-l", "decode(encode(s)) must be s");
}

#[tokio::test]
async fn test_framing_empty_string() {
    let (mut client, mut server) = tokio::io::duplex(64);

    server_write_framed(&mut server, "").await;
    let read_back = transport::read_service_string(&mut client).await.unwrap();
    assert_eq!(read_back, "");
}

#[tokio::test]
async fn test_framing_oversize_rejected() {
    let (mut client, _server) = tokio::io::duplex(64);

    let oversize = "x".repeat(1024 * 1024 - 3);
    let result = transport::send_service_string(&mut client, &oversize).await;
    assert!(
        matches!(result, Err(AdbError::Protocol { .. })),
        "payloads beyond MAX_PAYLOAD - 4 must fail"
    );
}

#[tokio::test]
async fn test_framing_bad_hex_prefix() {
    let (mut client, mut server) = tokio::io::duplex(64);

    server.write_all(b"zzzzrest").await.unwrap();
    let result = transport::read_service_string(&mut client).await;
    assert!(matches!(result, Err(AdbError::Protocol { .. })));
}

#[tokio::test]
async fn test_framing_truncated_body() {
    let (mut client, mut server) = tokio::io::duplex(64);

    server.write_all(b"0010shor").await.unwrap();
    drop(server);
    let result = transport::read_service_string(&mut client).await;
    assert!(
        matches!(result, Err(AdbError::Protocol { .. })),
        "a truncated body is a protocol error"
    );
}

// ============================================================
// STATUS WORDS
// ============================================================

#[tokio::test]
async fn test_status_okay() {
    let (mut client, mut server) = tokio::io::duplex(64);

    server.write_all(b"OKAY").await.unwrap();
    transport::read_status(&mut client).await.unwrap();
}

#[tokio::test]
async fn test_status_fail_carries_message() {
    let (mut client, mut server) = tokio::io::duplex(64);

    server.write_all(b"FAIL").await.unwrap();
    server_write_framed(&mut server, "device offline").await;

    match transport::read_status(&mut client).await {
        Err(AdbError::Server(message)) => assert_eq!(message, "device offline"),
        other => panic!("expected server error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_status_garbage_is_protocol_fault() {
    let (mut client, mut server) = tokio::io::duplex(64);

    server.write_all(b"WHAT").await.unwrap();
    let result = transport::read_status(&mut client).await;
    assert!(
        matches!(result, Err(AdbError::Protocol { .. })),
        "anything but OKAY/FAIL is a protocol fault"
    );
}

// ============================================================
// TRANSPORT SELECTION PRECEDENCE
// ============================================================

async fn assert_selector(options: TransportOptions, expected: &'static str) {
    let (mut client, mut server) = tokio::io::duplex(256);

    let server_task = tokio::spawn(async move {
        server_accept_transport(&mut server, expected).await;
    });

    let id = transport::switch_transport(&mut client, &options).await.unwrap();
    assert_eq!(id, 7, "assigned transport id must be surfaced");
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_transport_selector_precedence() {
    // All 8 subsets of {transport_id, serial, transport_type}.
    let cases: Vec<(Option<i64>, &str, TransportType, &'static str)> = vec![
        (None, "", TransportType::Any, "host:tport:any"),
        (None, "", TransportType::Usb, "host:tport:usb"),
        (None, "ABC", TransportType::Any, "host:tport:serial:ABC"),
        (None, "ABC", TransportType::Usb, "host:tport:serial:ABC"),
        (Some(7), "", TransportType::Any, "host:transport-id:7"),
        (Some(7), "", TransportType::Usb, "host:transport-id:7"),
        (Some(7), "ABC", TransportType::Any, "host:transport-id:7"),
        (Some(7), "ABC", TransportType::Usb, "host:transport-id:7"),
    ];

    for (transport_id, serial, transport_type, expected) in cases {
        let options = TransportOptions {
            serial: serial.to_string(),
            transport_type,
            transport_id,
            ..Default::default()
        };
        assert_selector(options, expected).await;
    }
}

#[tokio::test]
async fn test_transport_selector_local() {
    let options = TransportOptions {
        transport_type: TransportType::Local,
        ..Default::default()
    };
    assert_selector(options, "host:tport:local").await;
}

#[test]
fn test_host_command_prefix_precedence() {
    let mut options = TransportOptions::default();
    assert_eq!(host::format_host_command("features", &options), "host:features");

    options.transport_type = TransportType::Usb;
    assert_eq!(
        host::format_host_command("features", &options),
        "host-usb:features"
    );

    options.transport_type = TransportType::Local;
    assert_eq!(
        host::format_host_command("features", &options),
        "host-local:features"
    );

    options.serial = "XYZ".to_string();
    assert_eq!(
        host::format_host_command("features", &options),
        "host-serial:XYZ:features",
        "serial must outrank transport type"
    );

    options.transport_id = Some(42);
    assert_eq!(
        host::format_host_command("features", &options),
        "host-transport-id:42:features",
        "transport id must outrank serial"
    );
}

// ============================================================
// DEVICE LIST PARSING
// ============================================================

#[test]
fn test_parse_device_line_full() {
    let dev = host::parse_device_line(
        "ABC123 device product:x model:y device:z transport_id:7",
    )
    .unwrap();

    assert_eq!(dev.serial, "ABC123");
    assert_eq!(dev.state, "device");
    assert_eq!(dev.product, "x");
    assert_eq!(dev.model, "y");
    assert_eq!(dev.device, "z");
    assert_eq!(dev.transport_id, 7);
}

#[test]
fn test_parse_device_line_short() {
    assert!(host::parse_device_line("").is_none());
    assert!(host::parse_device_line("serial-only").is_none());

    let dev = host::parse_device_line("ABC unauthorized").unwrap();
    assert_eq!(dev.state, "unauthorized");
    assert_eq!(dev.transport_id, 0);
}

#[tokio::test]
async fn test_list_devices_empty() {
    let (addr, server) = spawn_server(|listener| async move {
        let mut stream = accept(&listener).await;
        let service = server_read_framed(&mut stream).await;
        assert_eq!(service, "host:devices-l");
        stream.write_all(b"OKAY").await.unwrap();
        server_write_framed(&mut stream, "").await;
    })
    .await;

    let devices = host::list_devices(&loopback_options(addr), true, None)
        .await
        .unwrap();
    assert!(devices.is_empty(), "an empty listing parses to no devices");
    server.await.unwrap();
}

#[tokio::test]
async fn test_list_devices_one_entry() {
    let (addr, server) = spawn_server(|listener| async move {
        let mut stream = accept(&listener).await;
        let _ = server_read_framed(&mut stream).await;
        stream.write_all(b"OKAY").await.unwrap();
        server_write_framed(
            &mut stream,
            "ABC123 device product:x model:y device:z transport_id:7\n",
        )
        .await;
    })
    .await;

    let devices = host::list_devices(&loopback_options(addr), true, None)
        .await
        .unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].serial, "ABC123");
    assert_eq!(devices[0].model, "y");
    assert_eq!(devices[0].transport_id, 7);
    server.await.unwrap();
}

#[tokio::test]
async fn test_list_devices_filters_offline() {
    let (addr, server) = spawn_server(|listener| async move {
        let mut stream = accept(&listener).await;
        let _ = server_read_framed(&mut stream).await;
        stream.write_all(b"OKAY").await.unwrap();
        server_write_framed(&mut stream, "AAA offline\nBBB device\n").await;
    })
    .await;

    let devices = host::list_devices(&loopback_options(addr), true, None)
        .await
        .unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].serial, "BBB");
    server.await.unwrap();
}

#[tokio::test]
async fn test_get_features_splits_on_commas() {
    let (addr, server) = spawn_server(|listener| async move {
        let mut stream = accept(&listener).await;
        let service = server_read_framed(&mut stream).await;
        assert_eq!(service, "host:features");
        stream.write_all(b"OKAY").await.unwrap();
        server_write_framed(&mut stream, "shell_v2,stat_v2,ls_v2").await;
    })
    .await;

    let features = host::get_features(&loopback_options(addr)).await.unwrap();
    assert_eq!(features, vec!["shell_v2", "stat_v2", "ls_v2"]);
    assert!(host::has_feature(&features, "stat_v2"));
    assert!(!host::has_feature(&features, "fixed_push_mkdir"));
    server.await.unwrap();
}

#[tokio::test]
async fn test_query_swallows_connect_refused_when_launch_disabled() {
    // Grab a port with no listener behind it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let options = loopback_options(addr);
    let answer = host::query("host:version", &options).await.unwrap();
    assert_eq!(answer, "", "a probing query reads no-server as empty");
}

// ============================================================
// SHELL SUB-PROTOCOL
// ============================================================

fn shell_packet(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![id];
    packet.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    packet.extend_from_slice(payload);
    packet
}

#[test]
fn test_shell_service_strings() {
    assert_eq!(shell::shell_service("ls /", false), "shell:ls /");
    assert_eq!(shell::shell_service("ls /", true), "shell,v2,raw:ls /");
}

#[tokio::test]
async fn test_shell_v2_basic_demux() {
    let (mut client, mut server) = tokio::io::duplex(4096);

    let server_task = tokio::spawn(async move {
        server.write_all(&shell_packet(1, b"hello")).await.unwrap();
        server.write_all(&shell_packet(2, b"oops!\n")).await.unwrap();
        server.write_all(&shell_packet(3, &[2])).await.unwrap();
    });

    let output = shell::read_shell_output(&mut client).await.unwrap();
    assert_eq!(output.exit_code, 2);
    assert_eq!(output.stdout, b"hello");
    assert_eq!(output.stderr, b"oops!\n");
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_shell_v2_payload_larger_than_buffer() {
    // 100000 bytes exceeds the 40960-byte reader buffer, so one packet
    // spans multiple reads.
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

    let (mut client, mut server) = tokio::io::duplex(8192);
    let expected = payload.clone();

    let server_task = tokio::spawn(async move {
        server.write_all(&shell_packet(1, &payload)).await.unwrap();
        server.write_all(&shell_packet(3, &[0])).await.unwrap();
    });

    let output = shell::read_shell_output(&mut client).await.unwrap();
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout.len(), expected.len());
    assert_eq!(output.stdout, expected, "stdout must reassemble unchanged");
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_shell_v1_reads_until_eof() {
    let (mut client, mut server) = tokio::io::duplex(256);

    let server_task = tokio::spawn(async move {
        server.write_all(b"some raw output").await.unwrap();
        drop(server);
    });

    let output = shell::read_raw_output(&mut client).await.unwrap();
    assert_eq!(output.exit_code, 0, "v1 always reports exit code zero");
    assert_eq!(output.stdout, b"some raw output");
    assert!(output.stderr.is_empty());
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_execute_shell_v2_end_to_end() {
    let (addr, server) = spawn_server(|listener| async move {
        let mut stream = accept(&listener).await;
        server_accept_transport(&mut stream, "host:tport:any").await;

        let service = server_read_framed(&mut stream).await;
        assert_eq!(service, "shell,v2,raw:false");
        stream.write_all(b"OKAY").await.unwrap();

        stream.write_all(&shell_packet(1, b"hello")).await.unwrap();
        stream.write_all(&shell_packet(2, b"oops!\n")).await.unwrap();
        stream.write_all(&shell_packet(3, &[2])).await.unwrap();
    })
    .await;

    let output = host::execute_shell("false", &loopback_options(addr), Some(true))
        .await
        .unwrap();
    assert_eq!(output.exit_code, 2);
    assert_eq!(output.stdout, b"hello");
    assert_eq!(output.stderr, b"oops!\n");
    server.await.unwrap();
}

// ============================================================
// COMMAND TIMEOUT
// ============================================================

#[tokio::test]
async fn test_command_timeout_fires() {
    let (addr, server) = spawn_server(|listener| async move {
        let mut stream = accept(&listener).await;
        let _ = server_read_framed(&mut stream).await;
        stream.write_all(b"OKAY").await.unwrap();
        // Never send the second status; hold the socket open instead.
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    })
    .await;

    let result = host::command(
        "wait-for-any-device",
        &loopback_options(addr),
        Some(std::time::Duration::from_millis(100)),
    )
    .await;
    assert!(
        matches!(result, Err(AdbError::CommandTimeout { .. })),
        "a silent server must trip the watchdog"
    );
    server.abort();
}

// ============================================================
// SYNC SUB-PROTOCOL HELPERS
// ============================================================

const ID_STAT_V1: u32 = u32::from_le_bytes(*b"STAT");
const ID_DONE: u32 = u32::from_le_bytes(*b"DONE");
const ID_DATA: u32 = u32::from_le_bytes(*b"DATA");
const ID_OKAY: u32 = u32::from_le_bytes(*b"OKAY");
const ID_RECV: u32 = u32::from_le_bytes(*b"RECV");
const ID_SEND: u32 = u32::from_le_bytes(*b"SEND");

async fn sync_read_request(stream: &mut DuplexStream) -> (u32, String) {
    let mut raw = [0u8; 4];
    stream.read_exact(&mut raw).await.unwrap();
    let id = u32::from_le_bytes(raw);
    stream.read_exact(&mut raw).await.unwrap();
    let len = u32::from_le_bytes(raw) as usize;
    let mut path = vec![0u8; len];
    stream.read_exact(&mut path).await.unwrap();
    (id, String::from_utf8(path).unwrap())
}

async fn sync_write_stat_v1(stream: &mut DuplexStream, mode: u32, size: u32, mtime: u32) {
    let mut frame = Vec::new();
    frame.extend_from_slice(&ID_STAT_V1.to_le_bytes());
    frame.extend_from_slice(&mode.to_le_bytes());
    frame.extend_from_slice(&size.to_le_bytes());
    frame.extend_from_slice(&mtime.to_le_bytes());
    stream.write_all(&frame).await.unwrap();
}

async fn sync_write_chunk(stream: &mut DuplexStream, payload: &[u8]) {
    let mut frame = Vec::new();
    frame.extend_from_slice(&ID_DATA.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    stream.write_all(&frame).await.unwrap();
    stream.write_all(payload).await.unwrap();
}

async fn sync_write_done(stream: &mut DuplexStream) {
    let mut frame = Vec::new();
    frame.extend_from_slice(&ID_DONE.to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes());
    stream.write_all(&frame).await.unwrap();
}

async fn sync_write_okay(stream: &mut DuplexStream) {
    let mut frame = Vec::new();
    frame.extend_from_slice(&ID_OKAY.to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes());
    stream.write_all(&frame).await.unwrap();
}

const S_IFLNK: u32 = 0o120000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

// ============================================================
// SYNC STAT
// ============================================================

#[tokio::test]
async fn test_stat_v1_symlink_resolves_to_directory() {
    let (client, mut server) = tokio::io::duplex(4096);
    let mut session = SyncSession::over(client, false, false);

    let server_task = tokio::spawn(async move {
        let (_, path) = sync_read_request(&mut server).await;
        assert_eq!(path, "/link");
        sync_write_stat_v1(&mut server, S_IFLNK | 0o777, 11, 5).await;

        // The follow-up lstat with a trailing slash succeeds: directory.
        let (_, path) = sync_read_request(&mut server).await;
        assert_eq!(path, "/link/");
        sync_write_stat_v1(&mut server, S_IFDIR | 0o755, 0, 5).await;
    });

    let st = session.stat("/link").await.unwrap();
    assert!(st.is_dir(), "resolved symlink must carry the directory bit");
    assert_eq!(st.mode & S_IFLNK, S_IFDIR, "symlink bit must be stripped");
    assert_eq!(st.size, 0, "size is zeroed during symlink resolution");
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_stat_v1_symlink_falls_back_to_regular_file() {
    let (client, mut server) = tokio::io::duplex(4096);
    let mut session = SyncSession::over(client, false, false);

    let server_task = tokio::spawn(async move {
        let (_, _) = sync_read_request(&mut server).await;
        sync_write_stat_v1(&mut server, S_IFLNK | 0o777, 11, 5).await;

        // Answer the trailing-slash lstat with a wrong message id.
        let (_, _) = sync_read_request(&mut server).await;
        let mut frame = Vec::new();
        frame.extend_from_slice(&ID_DONE.to_le_bytes());
        frame.extend_from_slice(&[0u8; 12]);
        server.write_all(&frame).await.unwrap();
    });

    let st = session.stat("/link").await.unwrap();
    assert!(st.is_regular(), "a failed lstat resolves to a regular file");
    assert_eq!(st.size, 0);
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_stat_v1_plain_file() {
    let (client, mut server) = tokio::io::duplex(4096);
    let mut session = SyncSession::over(client, false, false);

    let server_task = tokio::spawn(async move {
        let (_, _) = sync_read_request(&mut server).await;
        sync_write_stat_v1(&mut server, S_IFREG | 0o755, 1234, 99).await;
    });

    let st = session.stat("/bin/sh").await.unwrap();
    assert!(st.is_regular());
    assert!(st.is_executable());
    assert_eq!(st.size, 1234);
    assert_eq!(st.mtime, 99);
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_stat_path_too_long_rejected() {
    let (client, _server) = tokio::io::duplex(64);
    let mut session = SyncSession::over(client, false, false);

    let long_path = "/".repeat(1025);
    let result = session.stat(&long_path).await;
    assert!(matches!(result, Err(AdbError::Sync { .. })));
}

// ============================================================
// SYNC RECV
// ============================================================

#[tokio::test]
async fn test_recv_to_buffer_two_chunks() {
    let (client, mut server) = tokio::io::duplex(256 * 1024);
    let mut session = SyncSession::over(client, false, false);

    let chunk_a = vec![0xAAu8; 65536];
    let chunk_b = vec![0xBBu8; 5120];
    let expected: Vec<u8> = chunk_a.iter().chain(chunk_b.iter()).copied().collect();

    let server_task = tokio::spawn(async move {
        let (id, path) = sync_read_request(&mut server).await;
        assert_eq!(id, ID_RECV);
        assert_eq!(path, "/data/blob");
        sync_write_chunk(&mut server, &chunk_a).await;
        sync_write_chunk(&mut server, &chunk_b).await;
        sync_write_done(&mut server).await;
    });

    let buffer = session.recv_to_buffer("/data/blob").await.unwrap();
    assert_eq!(buffer.len(), 70656);
    assert_eq!(buffer, expected, "chunks must concatenate in order");
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_recv_rejects_oversize_chunk() {
    let (client, mut server) = tokio::io::duplex(4096);
    let mut session = SyncSession::over(client, false, false);

    let server_task = tokio::spawn(async move {
        let _ = sync_read_request(&mut server).await;
        let mut frame = Vec::new();
        frame.extend_from_slice(&ID_DATA.to_le_bytes());
        frame.extend_from_slice(&(65537u32).to_le_bytes());
        server.write_all(&frame).await.unwrap();
    });

    let result = session.recv_to_buffer("/data/blob").await;
    assert!(
        matches!(result, Err(AdbError::Sync { .. })),
        "chunks above SYNC_DATA_MAX must fail"
    );
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_recv_to_file_writes_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();

    // Happy path: 70 KiB across two chunks lands byte-identical.
    {
        let (client, mut server) = tokio::io::duplex(256 * 1024);
        let mut session = SyncSession::over(client, false, false);
        let dst = dir.path().join("pulled.bin");

        let chunk_a = vec![0x11u8; 65536];
        let chunk_b = vec![0x22u8; 5120];
        let mut expected = chunk_a.clone();
        expected.extend_from_slice(&chunk_b);

        let server_task = tokio::spawn(async move {
            let _ = sync_read_request(&mut server).await;
            sync_write_chunk(&mut server, &chunk_a).await;
            sync_write_chunk(&mut server, &chunk_b).await;
            sync_write_done(&mut server).await;
        });

        session.recv_to_file("/data/blob", &dst).await.unwrap();
        let written = std::fs::read(&dst).unwrap();
        assert_eq!(written, expected);
        server_task.await.unwrap();
    }

    // Failure path: the partial file must be deleted.
    {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut session = SyncSession::over(client, false, false);
        let dst = dir.path().join("partial.bin");

        let server_task = tokio::spawn(async move {
            let _ = sync_read_request(&mut server).await;
            sync_write_chunk(&mut server, b"partial data").await;
            // Bogus frame id instead of DATA/DONE.
            let mut frame = Vec::new();
            frame.extend_from_slice(&u32::from_le_bytes(*b"WHAT").to_le_bytes());
            frame.extend_from_slice(&0u32.to_le_bytes());
            server.write_all(&frame).await.unwrap();
        });

        let result = session.recv_to_file("/data/blob", &dst).await;
        assert!(result.is_err());
        assert!(!dst.exists(), "a failed receive must remove the partial file");
        server_task.await.unwrap();
    }
}

// ============================================================
// SYNC SEND
// ============================================================

#[tokio::test]
async fn test_send_small_buffer_single_packed_frame() {
    let (client, mut server) = tokio::io::duplex(256 * 1024);
    let mut session = SyncSession::over(client, false, false);

    let payload = vec![0x5Au8; 200];
    let expected_payload = payload.clone();

    let server_task = tokio::spawn(async move {
        // The whole SEND+DATA+DONE sequence arrives as one frame.
        let (id, path_and_mode) = sync_read_request(&mut server).await;
        assert_eq!(id, ID_SEND);
        assert_eq!(path_and_mode, "dst/f,511");

        let mut raw = [0u8; 4];
        server.read_exact(&mut raw).await.unwrap();
        assert_eq!(u32::from_le_bytes(raw), ID_DATA);
        server.read_exact(&mut raw).await.unwrap();
        assert_eq!(u32::from_le_bytes(raw), 200);

        let mut body = vec![0u8; 200];
        server.read_exact(&mut body).await.unwrap();
        assert_eq!(body, expected_payload);

        server.read_exact(&mut raw).await.unwrap();
        assert_eq!(u32::from_le_bytes(raw), ID_DONE);
        server.read_exact(&mut raw).await.unwrap();
        assert_eq!(u32::from_le_bytes(raw), 123, "mtime rides the DONE frame");

        sync_write_okay(&mut server).await;
    });

    session.send_buffer("dst/f", &payload, 0o777, 123).await.unwrap();
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_send_large_buffer_streams_chunks() {
    let (client, mut server) = tokio::io::duplex(512 * 1024);
    let mut session = SyncSession::over(client, false, false);

    let payload = vec![0x33u8; 65536 + 100];

    let server_task = tokio::spawn(async move {
        let (id, _) = sync_read_request(&mut server).await;
        assert_eq!(id, ID_SEND);

        let mut raw = [0u8; 4];
        let mut total = 0usize;
        loop {
            server.read_exact(&mut raw).await.unwrap();
            let id = u32::from_le_bytes(raw);
            server.read_exact(&mut raw).await.unwrap();
            let len = u32::from_le_bytes(raw) as usize;

            if id == ID_DONE {
                break;
            }
            assert_eq!(id, ID_DATA);
            assert!(len <= 65536, "chunks must respect SYNC_DATA_MAX");

            let mut body = vec![0u8; len];
            server.read_exact(&mut body).await.unwrap();
            total += len;
        }

        assert_eq!(total, 65536 + 100);
        sync_write_okay(&mut server).await;
    });

    session.send_buffer("dst/big", &payload, 0o644, 0).await.unwrap();
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_send_fail_surfaces_daemon_message() {
    let (client, mut server) = tokio::io::duplex(4096);
    let mut session = SyncSession::over(client, false, false);

    let server_task = tokio::spawn(async move {
        let _ = sync_read_request(&mut server).await;
        // Consume until DONE, then fail.
        let mut raw = [0u8; 4];
        loop {
            server.read_exact(&mut raw).await.unwrap();
            let id = u32::from_le_bytes(raw);
            server.read_exact(&mut raw).await.unwrap();
            let len = u32::from_le_bytes(raw) as usize;
            if id == ID_DONE {
                break;
            }
            let mut body = vec![0u8; len];
            server.read_exact(&mut body).await.unwrap();
        }

        let message = b"couldn't create file: Permission denied";
        let mut frame = Vec::new();
        frame.extend_from_slice(&u32::from_le_bytes(*b"FAIL").to_le_bytes());
        frame.extend_from_slice(&(message.len() as u32).to_le_bytes());
        frame.extend_from_slice(message);
        server.write_all(&frame).await.unwrap();
    });

    let result = session.send_buffer("/readonly/f", b"data", 0o644, 0).await;
    match result {
        Err(AdbError::Sync { message, .. }) => {
            assert!(message.contains("Permission denied"))
        }
        other => panic!("expected sync failure, got {other:?}"),
    }
    server_task.await.unwrap();
}

// ============================================================
// PATH HELPERS AND ESCAPING
// ============================================================

#[test]
fn test_posix_path_helpers() {
    assert_eq!(sync::posix_basename("/a/b/c.txt"), "c.txt");
    assert_eq!(sync::posix_basename("c.txt"), "c.txt");
    assert_eq!(sync::posix_dirname("/a/b/c.txt"), "/a/b/");
    assert_eq!(sync::posix_dirname("//foo"), "//");
    assert_eq!(sync::posix_dirname("/"), "/");
    assert_eq!(sync::posix_join("/a", "b"), "/a/b");
    assert_eq!(sync::posix_join("/a/", "b"), "/a/b");
}

#[test]
fn test_escape_arg() {
    assert_eq!(sync::escape_arg("simple"), "'simple'");
    assert_eq!(sync::escape_arg("with space"), "'with space'");
    assert_eq!(sync::escape_arg("don't"), r"'don'\''t'");
    assert_eq!(sync::escape_arg(""), "''");
}

// ============================================================
// END-TO-END PULL AND PUSH
// ============================================================

async fn tcp_sync_handshake(stream: &mut TcpStream) {
    // features probe, then a fresh connection switches into sync mode.
    let selector = server_read_framed(stream).await;
    assert_eq!(selector, "host:tport:any");
    stream.write_all(b"OKAY").await.unwrap();
    stream.write_all(&7i64.to_le_bytes()).await.unwrap();

    let service = server_read_framed(stream).await;
    assert_eq!(service, "sync:");
    stream.write_all(b"OKAY").await.unwrap();
}

async fn tcp_sync_read_request(stream: &mut TcpStream) -> (u32, String) {
    let mut raw = [0u8; 4];
    stream.read_exact(&mut raw).await.unwrap();
    let id = u32::from_le_bytes(raw);
    stream.read_exact(&mut raw).await.unwrap();
    let len = u32::from_le_bytes(raw) as usize;
    let mut path = vec![0u8; len];
    stream.read_exact(&mut path).await.unwrap();
    (id, String::from_utf8(path).unwrap())
}

async fn tcp_write_stat_v1(stream: &mut TcpStream, mode: u32, size: u32, mtime: u32) {
    let mut frame = Vec::new();
    frame.extend_from_slice(&ID_STAT_V1.to_le_bytes());
    frame.extend_from_slice(&mode.to_le_bytes());
    frame.extend_from_slice(&size.to_le_bytes());
    frame.extend_from_slice(&mtime.to_le_bytes());
    stream.write_all(&frame).await.unwrap();
}

async fn serve_features(listener: &TcpListener, features: &str) {
    let mut stream = accept(listener).await;
    let service = server_read_framed(&mut stream).await;
    assert_eq!(service, "host:features");
    stream.write_all(b"OKAY").await.unwrap();
    server_write_framed(&mut stream, features).await;
}

#[tokio::test]
async fn test_sync_pull_file_into_directory() {
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().to_path_buf();

    let chunk_a = vec![0xA5u8; 65536];
    let chunk_b = vec![0x5Au8; 5120];
    let mut expected = chunk_a.clone();
    expected.extend_from_slice(&chunk_b);

    let (addr, server) = spawn_server(move |listener| async move {
        serve_features(&listener, "").await;

        let mut stream = accept(&listener).await;
        tcp_sync_handshake(&mut stream).await;

        // STAT of the source: a regular file.
        let (_, path) = tcp_sync_read_request(&mut stream).await;
        assert_eq!(path, "/data/blob.bin");
        tcp_write_stat_v1(&mut stream, S_IFREG | 0o644, 70656, 0).await;

        // RECV streams the two chunks.
        let (id, path) = tcp_sync_read_request(&mut stream).await;
        assert_eq!(id, ID_RECV);
        assert_eq!(path, "/data/blob.bin");

        for chunk in [&chunk_a[..], &chunk_b[..]] {
            let mut frame = Vec::new();
            frame.extend_from_slice(&ID_DATA.to_le_bytes());
            frame.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
            stream.write_all(&frame).await.unwrap();
            stream.write_all(chunk).await.unwrap();
        }
        let mut frame = Vec::new();
        frame.extend_from_slice(&ID_DONE.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        stream.write_all(&frame).await.unwrap();

        // QUIT ends the session.
        let (id, _) = tcp_sync_read_request(&mut stream).await;
        assert_eq!(id, u32::from_le_bytes(*b"QUIT"));
    })
    .await;

    sync::sync_pull(
        &["/data/blob.bin".to_string()],
        &dst,
        &loopback_options(addr),
    )
    .await
    .unwrap();

    let pulled = std::fs::read(dst.join("blob.bin")).unwrap();
    assert_eq!(pulled, expected, "pulled bytes must match the stream");
    server.await.unwrap();
}

#[tokio::test]
async fn test_sync_pull_multiple_sources_need_directory() {
    let dir = tempfile::tempdir().unwrap();
    let file_dst = dir.path().join("not-a-dir");
    std::fs::write(&file_dst, b"occupied").unwrap();

    let (addr, server) = spawn_server(move |listener| async move {
        serve_features(&listener, "").await;
        let mut stream = accept(&listener).await;
        tcp_sync_handshake(&mut stream).await;
        // The client must fail before issuing any request.
    })
    .await;

    let result = sync::sync_pull(
        &["/a".to_string(), "/b".to_string()],
        &file_dst,
        &loopback_options(addr),
    )
    .await;
    assert!(matches!(result, Err(AdbError::Sync { .. })));
    server.abort();
}

#[tokio::test]
async fn test_sync_push_file_into_existing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("f1.txt");
    std::fs::write(&src, vec![0x42u8; 200]).unwrap();

    let (addr, server) = spawn_server(move |listener| async move {
        serve_features(&listener, "fixed_push_mkdir,shell_v2").await;

        let mut stream = accept(&listener).await;
        tcp_sync_handshake(&mut stream).await;

        // STAT of the destination: an existing directory.
        let (_, path) = tcp_sync_read_request(&mut stream).await;
        assert_eq!(path, "/sdcard/dst");
        tcp_write_stat_v1(&mut stream, S_IFDIR | 0o755, 0, 0).await;

        // The SEND path is dst/basename(src).
        let (id, path_and_mode) = tcp_sync_read_request(&mut stream).await;
        assert_eq!(id, ID_SEND);
        let (path, _mode) = path_and_mode.rsplit_once(',').unwrap();
        assert_eq!(path, "/sdcard/dst/f1.txt");

        // Packed frame: DATA + payload + DONE follow in the same stream.
        let mut raw = [0u8; 4];
        stream.read_exact(&mut raw).await.unwrap();
        assert_eq!(u32::from_le_bytes(raw), ID_DATA);
        stream.read_exact(&mut raw).await.unwrap();
        let len = u32::from_le_bytes(raw) as usize;
        assert_eq!(len, 200);
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        stream.read_exact(&mut raw).await.unwrap();
        assert_eq!(u32::from_le_bytes(raw), ID_DONE);
        stream.read_exact(&mut raw).await.unwrap();

        let mut frame = Vec::new();
        frame.extend_from_slice(&ID_OKAY.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        stream.write_all(&frame).await.unwrap();

        let (id, _) = tcp_sync_read_request(&mut stream).await;
        assert_eq!(id, u32::from_le_bytes(*b"QUIT"));
    })
    .await;

    sync::sync_push(&[src], "/sdcard/dst", &loopback_options(addr))
        .await
        .unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_sync_push_multiple_sources_to_missing_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    let src1 = dir.path().join("f1");
    let src2 = dir.path().join("f2");
    std::fs::write(&src1, b"one").unwrap();
    std::fs::write(&src2, b"two").unwrap();

    let (addr, server) = spawn_server(move |listener| async move {
        serve_features(&listener, "").await;

        let mut stream = accept(&listener).await;
        tcp_sync_handshake(&mut stream).await;

        // STAT of the destination answers with a wrong id: not there.
        let (_, _) = tcp_sync_read_request(&mut stream).await;
        let mut frame = Vec::new();
        frame.extend_from_slice(&ID_DONE.to_le_bytes());
        frame.extend_from_slice(&[0u8; 12]);
        stream.write_all(&frame).await.unwrap();

        // No SEND may follow.
        let mut raw = [0u8; 4];
        match stream.read_exact(&mut raw).await {
            Ok(_) => panic!("client sent data after destination check failed"),
            Err(_) => {}
        }
    })
    .await;

    let result = sync::sync_push(&[src1, src2], "/missing", &loopback_options(addr)).await;
    assert!(matches!(result, Err(AdbError::Sync { .. })));
    server.await.unwrap();
}

#[tokio::test]
async fn test_sync_push_single_source_to_fresh_path() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("payload.bin");
    std::fs::write(&src, b"fresh-path-payload").unwrap();

    let (addr, server) = spawn_server(move |listener| async move {
        serve_features(&listener, "").await;

        let mut stream = accept(&listener).await;
        tcp_sync_handshake(&mut stream).await;

        // Destination does not exist.
        let (_, _) = tcp_sync_read_request(&mut stream).await;
        let mut frame = Vec::new();
        frame.extend_from_slice(&ID_DONE.to_le_bytes());
        frame.extend_from_slice(&[0u8; 12]);
        stream.write_all(&frame).await.unwrap();

        // SEND must target exactly the requested path.
        let (id, path_and_mode) = tcp_sync_read_request(&mut stream).await;
        assert_eq!(id, ID_SEND);
        let (path, _) = path_and_mode.rsplit_once(',').unwrap();
        assert_eq!(path, "/data/local/tmp/fresh.bin");

        let mut raw = [0u8; 4];
        loop {
            stream.read_exact(&mut raw).await.unwrap();
            let id = u32::from_le_bytes(raw);
            stream.read_exact(&mut raw).await.unwrap();
            let len = u32::from_le_bytes(raw) as usize;
            if id == ID_DONE {
                break;
            }
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await.unwrap();
        }

        let mut frame = Vec::new();
        frame.extend_from_slice(&ID_OKAY.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        stream.write_all(&frame).await.unwrap();

        let (id, _) = tcp_sync_read_request(&mut stream).await;
        assert_eq!(id, u32::from_le_bytes(*b"QUIT"));
    })
    .await;

    sync::sync_push(&[src], "/data/local/tmp/fresh.bin", &loopback_options(addr))
        .await
        .unwrap();
    server.await.unwrap();
}

// ============================================================
// LAUNCHER SCRIPT SUBSTITUTION
// ============================================================

#[test]
fn test_split_tokens_positional_by_index() {
    let vargs: Vec<String> = vec!["a".into(), "bb".into(), "cc".into()];
    let tokens =
        launcher::split_command_tokens("{arg0} puts {{0},{1},{2}}", &vargs, &Default::default());

    assert_eq!(tokens.len(), 3);
    assert_eq!(tokens[1], "puts");
    assert_eq!(tokens[2], "{a,bb,cc}", "inner indices expand, outer braces stay");
}

#[test]
fn test_split_tokens_sequential_positional() {
    let vargs: Vec<String> = vec!["a".into(), "bb".into(), "cc".into()];
    let tokens =
        launcher::split_command_tokens("test puts {} {} {} {}", &vargs, &Default::default());

    assert_eq!(tokens.len(), 6);
    assert_eq!(tokens[2], "a");
    assert_eq!(tokens[3], "bb");
    assert_eq!(tokens[4], "cc");
    assert_eq!(tokens[5], "{}", "exhausted positionals stay literal");
}

#[test]
fn test_split_tokens_keyword_and_ternary() {
    let mut kwargs = std::collections::HashMap::new();
    kwargs.insert("name".to_string(), "usbserial".to_string());
    kwargs.insert("load".to_string(), "true".to_string());
    kwargs.insert("drop".to_string(), "0".to_string());

    let tokens = launcher::split_command_tokens(
        "modprobe {name} {load?-v:-q} {drop?yes:no}",
        &[],
        &kwargs,
    );

    assert_eq!(tokens, vec!["modprobe", "usbserial", "-v", "no"]);
}

#[test]
fn test_split_tokens_quotes_round_trip() {
    let vargs: Vec<String> = vec!["has space".into()];
    let tokens =
        launcher::split_command_tokens(r#"run "a b" {0} \"quoted\""#, &vargs, &Default::default());

    assert_eq!(tokens, vec!["run", "a b", "has space", "\"quoted\""]);
}

#[test]
fn test_search_executable_misses_gracefully() {
    assert!(
        launcher::search_executable("definitely-not-a-real-binary-name").is_none(),
        "a missing executable is None, not an error"
    );
}
