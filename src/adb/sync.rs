// File-sync sub-protocol: binary framed STAT/LIST/RECV/SEND over a
// transport-switched `sync:` connection, plus recursive push/pull built on
// top of it. All wire integers are little-endian.
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::error::{AdbError, AdbResult};
use super::host;
use super::transport::connect;
use super::types::{
    feature, mode_is_dir, mode_is_regular, mode_is_symlink, FileStat, ListItem,
    TransportOptions, S_IFDIR, S_IFMT, S_IFREG,
};

/// Largest data chunk either side may put on the wire.
pub(crate) const SYNC_DATA_MAX: usize = 64 * 1024;

/// Longest path accepted by the daemon.
const MAX_SYNC_PATH: usize = 1024;

/// Message ids are four ASCII characters read as a little-endian word.
const fn mkid(tag: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*tag)
}

const ID_LSTAT_V1: u32 = mkid(b"STAT");
const ID_STAT_V2: u32 = mkid(b"STA2");
const ID_LSTAT_V2: u32 = mkid(b"LST2");
const ID_LIST_V1: u32 = mkid(b"LIST");
const ID_LIST_V2: u32 = mkid(b"LIS2");
const ID_DENT_V1: u32 = mkid(b"DENT");
const ID_DENT_V2: u32 = mkid(b"DNT2");
const ID_SEND: u32 = mkid(b"SEND");
const ID_RECV: u32 = mkid(b"RECV");
const ID_DONE: u32 = mkid(b"DONE");
const ID_DATA: u32 = mkid(b"DATA");
const ID_OKAY: u32 = mkid(b"OKAY");
const ID_FAIL: u32 = mkid(b"FAIL");
const ID_QUIT: u32 = mkid(b"QUIT");

async fn read_u32<S: AsyncRead + Unpin>(stream: &mut S) -> AdbResult<u32> {
    let mut raw = [0u8; 4];
    stream.read_exact(&mut raw).await?;
    Ok(u32::from_le_bytes(raw))
}

async fn read_u64<S: AsyncRead + Unpin>(stream: &mut S) -> AdbResult<u64> {
    let mut raw = [0u8; 8];
    stream.read_exact(&mut raw).await?;
    Ok(u64::from_le_bytes(raw))
}

async fn read_i64<S: AsyncRead + Unpin>(stream: &mut S) -> AdbResult<i64> {
    let mut raw = [0u8; 8];
    stream.read_exact(&mut raw).await?;
    Ok(i64::from_le_bytes(raw))
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// An open sync session. Dropping without [`SyncSession::quit`] leaves the
/// connection to die with the socket; the daemon tolerates both.
pub struct SyncSession<S> {
    stream: S,
    stat_v2: bool,
    ls_v2: bool,
}

impl SyncSession<TcpStream> {
    /// Switches a fresh connection into sync mode, with protocol versions
    /// picked from the daemon's feature set.
    pub async fn open(options: &TransportOptions) -> AdbResult<Self> {
        let features = host::get_features(options).await?;
        Self::open_with_features(&features, options).await
    }

    /// Like [`SyncSession::open`] for callers that already probed the
    /// feature set.
    pub async fn open_with_features(
        features: &[String],
        options: &TransportOptions,
    ) -> AdbResult<Self> {
        let (stream, _) = connect("sync:", options).await?;

        Ok(Self {
            stream,
            stat_v2: host::has_feature(features, feature::STAT_V2),
            ls_v2: host::has_feature(features, feature::LS_V2),
        })
    }
}

impl<S> SyncSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[cfg(test)]
    pub(crate) fn over(stream: S, stat_v2: bool, ls_v2: bool) -> Self {
        Self {
            stream,
            stat_v2,
            ls_v2,
        }
    }

    async fn send_request(&mut self, id: u32, path: &str) -> AdbResult<()> {
        if path.len() > MAX_SYNC_PATH {
            return Err(AdbError::sync(-1, "sync path length too long"));
        }

        let mut buf = Vec::with_capacity(8 + path.len());
        push_u32(&mut buf, id);
        push_u32(&mut buf, path.len() as u32);
        buf.extend_from_slice(path.as_bytes());
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    async fn finish_stat(&mut self, expected_v2_id: u32) -> AdbResult<FileStat> {
        if self.stat_v2 {
            let id = read_u32(&mut self.stream).await?;
            let error = read_u32(&mut self.stream).await?;

            let st = FileStat {
                dev: read_u64(&mut self.stream).await?,
                ino: read_u64(&mut self.stream).await?,
                mode: read_u32(&mut self.stream).await?,
                nlink: read_u32(&mut self.stream).await?,
                uid: read_u32(&mut self.stream).await?,
                gid: read_u32(&mut self.stream).await?,
                size: read_u64(&mut self.stream).await?,
                atime: read_i64(&mut self.stream).await?,
                mtime: read_i64(&mut self.stream).await?,
                ctime: read_i64(&mut self.stream).await?,
            };

            if id != expected_v2_id {
                return Err(AdbError::sync(
                    -1,
                    format!("stat response has wrong message id {id:#010x}"),
                ));
            }
            if error != 0 {
                return Err(AdbError::sync(error as i32, "stat failed"));
            }

            Ok(st)
        } else {
            let id = read_u32(&mut self.stream).await?;
            let mode = read_u32(&mut self.stream).await?;
            let size = read_u32(&mut self.stream).await?;
            let mtime = read_u32(&mut self.stream).await?;

            if id != ID_LSTAT_V1 {
                return Err(AdbError::sync(
                    -1,
                    format!("stat response has wrong message id {id:#010x}"),
                ));
            }

            Ok(FileStat {
                mode,
                size: size as u64,
                mtime: mtime as i64,
                ctime: mtime as i64,
                ..Default::default()
            })
        }
    }

    /// Stats `path` without following a final symlink.
    pub async fn lstat(&mut self, path: &str) -> AdbResult<FileStat> {
        let id = if self.stat_v2 { ID_LSTAT_V2 } else { ID_LSTAT_V1 };
        self.send_request(id, path).await?;
        self.finish_stat(ID_LSTAT_V2).await
    }

    /// Stats `path`, following symlinks.
    ///
    /// v1 daemons only lstat; a symlink answer is resolved by re-statting
    /// with a trailing slash: success means directory, failure means file.
    /// The size is zeroed either way, nobody cares about link lengths.
    pub async fn stat(&mut self, path: &str) -> AdbResult<FileStat> {
        let id = if self.stat_v2 { ID_STAT_V2 } else { ID_LSTAT_V1 };
        self.send_request(id, path).await?;
        let mut st = self.finish_stat(ID_STAT_V2).await?;

        if !self.stat_v2 && mode_is_symlink(st.mode) {
            st.size = 0;
            st.mode &= !S_IFMT;
            match self.lstat(&format!("{path}/")).await {
                Ok(_) => st.mode |= S_IFDIR,
                Err(_) => st.mode |= S_IFREG,
            }
        }

        Ok(st)
    }

    /// Lists a remote directory. `.` and `..` are elided.
    pub async fn list(&mut self, path: &str) -> AdbResult<Vec<ListItem>> {
        let id = if self.ls_v2 { ID_LIST_V2 } else { ID_LIST_V1 };
        self.send_request(id, path).await?;

        let expected_id = if self.ls_v2 { ID_DENT_V2 } else { ID_DENT_V1 };
        let mut out = Vec::new();

        loop {
            let (id, item) = if self.ls_v2 {
                let id = read_u32(&mut self.stream).await?;
                let _error = read_u32(&mut self.stream).await?;
                let _dev = read_u64(&mut self.stream).await?;
                let _ino = read_u64(&mut self.stream).await?;
                let mode = read_u32(&mut self.stream).await?;
                let _nlink = read_u32(&mut self.stream).await?;
                let _uid = read_u32(&mut self.stream).await?;
                let _gid = read_u32(&mut self.stream).await?;
                let size = read_u64(&mut self.stream).await?;
                let _atime = read_i64(&mut self.stream).await?;
                let mtime = read_i64(&mut self.stream).await?;
                let _ctime = read_i64(&mut self.stream).await?;

                (
                    id,
                    ListItem {
                        name: String::new(),
                        mode,
                        size: size as u32,
                        mtime: mtime as u32,
                    },
                )
            } else {
                let id = read_u32(&mut self.stream).await?;
                let mode = read_u32(&mut self.stream).await?;
                let size = read_u32(&mut self.stream).await?;
                let mtime = read_u32(&mut self.stream).await?;

                (
                    id,
                    ListItem {
                        name: String::new(),
                        mode,
                        size,
                        mtime,
                    },
                )
            };

            let namelen = read_u32(&mut self.stream).await? as usize;

            if id == ID_DONE {
                break;
            }
            if id != expected_id {
                return Err(AdbError::sync(-1, format!("unexpected dent id {id:#010x}")));
            }
            if namelen > 255 {
                return Err(AdbError::sync(-1, "dent name too long"));
            }

            let mut name = vec![0u8; namelen];
            self.stream.read_exact(&mut name).await?;
            let name = String::from_utf8_lossy(&name).into_owned();

            if name == "." || name == ".." {
                continue;
            }

            let mut item = item;
            item.name = name;
            out.push(item);
        }

        Ok(out)
    }

    async fn recv_chunks<F>(&mut self, rpath: &str, mut consume: F) -> AdbResult<()>
    where
        F: FnMut(&[u8]) -> AdbResult<()>,
    {
        self.send_request(ID_RECV, rpath).await?;

        loop {
            let id = read_u32(&mut self.stream).await?;
            let length = read_u32(&mut self.stream).await? as usize;

            if id == ID_DONE {
                break;
            }
            if id != ID_DATA {
                return Err(AdbError::sync(-1, format!("bad sync recv id {id:#010x}")));
            }
            if length > SYNC_DATA_MAX {
                return Err(AdbError::sync(-1, "sync recv chunk too large"));
            }

            let mut chunk = vec![0u8; length];
            self.stream.read_exact(&mut chunk).await?;
            consume(&chunk)?;
        }

        Ok(())
    }

    /// Receives a remote file into `lpath`. A failed transfer removes the
    /// partial file before surfacing the error.
    pub async fn recv_to_file(&mut self, rpath: &str, lpath: &Path) -> AdbResult<()> {
        let mut file = tokio::fs::File::create(lpath).await?;

        let result = async {
            self.send_request(ID_RECV, rpath).await?;

            loop {
                let id = read_u32(&mut self.stream).await?;
                let length = read_u32(&mut self.stream).await? as usize;

                if id == ID_DONE {
                    break;
                }
                if id != ID_DATA {
                    return Err(AdbError::sync(-1, format!("bad sync recv id {id:#010x}")));
                }
                if length > SYNC_DATA_MAX {
                    return Err(AdbError::sync(-1, "sync recv chunk too large"));
                }

                let mut chunk = vec![0u8; length];
                self.stream.read_exact(&mut chunk).await?;
                file.write_all(&chunk).await?;
            }

            file.flush().await?;
            Ok(())
        }
        .await;

        if result.is_err() {
            drop(file);
            let _ = tokio::fs::remove_file(lpath).await;
        }

        result
    }

    /// Receives a remote file into memory.
    pub async fn recv_to_buffer(&mut self, rpath: &str) -> AdbResult<Vec<u8>> {
        let mut out = Vec::new();
        self.recv_chunks(rpath, |chunk| {
            out.extend_from_slice(chunk);
            Ok(())
        })
        .await?;
        Ok(out)
    }

    async fn finish_send(&mut self) -> AdbResult<()> {
        let id = read_u32(&mut self.stream).await?;
        let length = read_u32(&mut self.stream).await? as usize;

        if id == ID_OKAY {
            if length != 0 {
                return Err(AdbError::sync(
                    -1,
                    format!("received OKAY with msg_len {length} != 0"),
                ));
            }
            return Ok(());
        }

        if id != ID_FAIL {
            return Err(AdbError::sync(
                -1,
                format!("unexpected response from daemon: id {id:#010x}"),
            ));
        }
        if length > SYNC_DATA_MAX {
            return Err(AdbError::sync(
                -1,
                format!("too-long message length from daemon: {length}"),
            ));
        }

        let mut message = vec![0u8; length];
        self.stream.read_exact(&mut message).await?;
        Err(AdbError::sync(
            -1,
            String::from_utf8_lossy(&message).into_owned(),
        ))
    }

    fn packed_send_frame(path_and_mode: &str, payload: &[u8], mtime: u32) -> Vec<u8> {
        let mut frame =
            Vec::with_capacity(8 + path_and_mode.len() + 8 + payload.len() + 8);
        push_u32(&mut frame, ID_SEND);
        push_u32(&mut frame, path_and_mode.len() as u32);
        frame.extend_from_slice(path_and_mode.as_bytes());
        push_u32(&mut frame, ID_DATA);
        push_u32(&mut frame, payload.len() as u32);
        frame.extend_from_slice(payload);
        push_u32(&mut frame, ID_DONE);
        push_u32(&mut frame, mtime);
        frame
    }

    /// Sends an in-memory payload to `rpath`.
    ///
    /// Payloads that fit one chunk go out as a single packed
    /// SEND+DATA+DONE write; larger ones stream chunk by chunk.
    pub async fn send_buffer(
        &mut self,
        rpath: &str,
        payload: &[u8],
        mode: u32,
        mtime: u32,
    ) -> AdbResult<()> {
        let path_and_mode = format!("{rpath},{mode}");
        if path_and_mode.len() > MAX_SYNC_PATH {
            return Err(AdbError::sync(-1, "send failed: path too long"));
        }

        if payload.len() < SYNC_DATA_MAX {
            let frame = Self::packed_send_frame(&path_and_mode, payload, mtime);
            self.stream.write_all(&frame).await?;
        } else {
            self.send_request(ID_SEND, &path_and_mode).await?;

            for chunk in payload.chunks(SYNC_DATA_MAX) {
                let mut header = Vec::with_capacity(8);
                push_u32(&mut header, ID_DATA);
                push_u32(&mut header, chunk.len() as u32);
                self.stream.write_all(&header).await?;
                self.stream.write_all(chunk).await?;
            }

            let mut done = Vec::with_capacity(8);
            push_u32(&mut done, ID_DONE);
            push_u32(&mut done, mtime);
            self.stream.write_all(&done).await?;
        }

        self.finish_send().await
    }

    /// Sends a local file to `rpath` with the given mode and mtime.
    pub async fn send_file(
        &mut self,
        rpath: &str,
        lpath: &Path,
        mode: u32,
        mtime: u32,
    ) -> AdbResult<()> {
        let path_and_mode = format!("{rpath},{mode}");
        if path_and_mode.len() > MAX_SYNC_PATH {
            return Err(AdbError::sync(-1, "send failed: path too long"));
        }

        let mut file = tokio::fs::File::open(lpath).await?;
        let mut buffer = vec![0u8; SYNC_DATA_MAX];

        let n = read_full(&mut file, &mut buffer).await?;
        if n < SYNC_DATA_MAX {
            // The whole file fits one chunk.
            let frame = Self::packed_send_frame(&path_and_mode, &buffer[..n], mtime);
            self.stream.write_all(&frame).await?;
        } else {
            self.send_request(ID_SEND, &path_and_mode).await?;

            let mut n = n;
            loop {
                let mut header = Vec::with_capacity(8);
                push_u32(&mut header, ID_DATA);
                push_u32(&mut header, n as u32);
                self.stream.write_all(&header).await?;
                self.stream.write_all(&buffer[..n]).await?;

                n = read_full(&mut file, &mut buffer).await?;
                if n == 0 {
                    break;
                }
            }

            let mut done = Vec::with_capacity(8);
            push_u32(&mut done, ID_DONE);
            push_u32(&mut done, mtime);
            self.stream.write_all(&done).await?;
        }

        self.finish_send().await
    }

    /// Ends the session with a QUIT frame.
    pub async fn quit(mut self) -> AdbResult<()> {
        self.send_request(ID_QUIT, "").await
    }
}

/// Fills `buf` from `reader`, looping over short reads; returns the bytes
/// read, which is under `buf.len()` only at EOF.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> AdbResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// POSIX path helpers. Remote paths are always `/`-separated regardless of
// the local platform.

fn is_root_dir(path: &str) -> bool {
    !path.is_empty() && path.chars().all(|c| c == '/')
}

pub(crate) fn posix_dirname(path: &str) -> String {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    match trimmed.rfind('/') {
        Some(pos) => trimmed[..=pos].to_string(),
        None if trimmed.is_empty() => "/".to_string(),
        None => trimmed.to_string(),
    }
}

pub(crate) fn posix_basename(path: &str) -> String {
    match path.rfind('/') {
        Some(pos) => path[pos + 1..].to_string(),
        None => path.to_string(),
    }
}

pub(crate) fn posix_join(path: &str, name: &str) -> String {
    let mut joined = path.to_string();
    if !joined.ends_with('/') {
        joined.push('/');
    }
    joined.push_str(name);
    joined
}

/// Single-quotes `s` for a device shell, closing and reopening the quote
/// around every embedded `'`.
pub(crate) fn escape_arg(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// One file or directory scheduled for transfer.
#[derive(Debug, Clone)]
struct CopyEntry {
    lpath: PathBuf,
    rpath: String,
    mtime: i64,
    mode: u32,
}

impl CopyEntry {
    fn new(local_dir: &Path, remote_dir: &str, name: &str, mode: u32) -> Self {
        let mut rpath = posix_join(remote_dir, name);
        if mode_is_dir(mode) && !rpath.ends_with('/') {
            rpath.push('/');
        }

        Self {
            lpath: local_dir.join(name),
            rpath,
            mtime: 0,
            mode,
        }
    }
}

/// Depth-first remote traversal for pull: directories are pushed ahead of
/// their contents so local creation stays ordered.
async fn remote_build_list<S>(
    session: &mut SyncSession<S>,
    rpath: &str,
    lpath: &Path,
) -> AdbResult<Vec<CopyEntry>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut file_list = Vec::new();
    let mut dir_list = Vec::new();

    // Sentinel for the directory itself, so it exists before its contents.
    file_list.push(CopyEntry::new(
        lpath.parent().unwrap_or(Path::new("")),
        &posix_dirname(rpath),
        &posix_basename(rpath),
        S_IFDIR,
    ));

    for item in session.list(rpath).await? {
        let mut entry = CopyEntry::new(lpath, rpath, &item.name, item.mode);
        if mode_is_dir(item.mode) {
            dir_list.push(entry);
        } else if mode_is_symlink(item.mode) {
            // Resolve each symlink into file or directory.
            match session.stat(&entry.rpath).await {
                Ok(st) if st.is_dir() => dir_list.push(entry),
                Ok(_) => file_list.push(entry),
                Err(_) => {}
            }
        } else if mode_is_regular(item.mode) {
            entry.mtime = item.mtime as i64;
            file_list.push(entry);
        }
    }

    while let Some(dir) = dir_list.pop() {
        let rpath = dir.rpath.clone();
        let lpath = dir.lpath.clone();
        let sublist = Box::pin(remote_build_list(session, &rpath, &lpath)).await?;
        file_list.extend(sublist);
    }

    Ok(file_list)
}

async fn copy_remote_dir_local<S>(
    session: &mut SyncSession<S>,
    rpath: &str,
    lpath: &Path,
) -> AdbResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut rpath = rpath.to_string();
    if !rpath.ends_with('/') {
        rpath.push('/');
    }

    let file_list = remote_build_list(session, &rpath, lpath).await?;

    for entry in file_list {
        if mode_is_dir(entry.mode) {
            if !entry.lpath.exists() {
                std::fs::create_dir_all(&entry.lpath).map_err(|_| {
                    AdbError::sync(
                        -1,
                        format!("failed to create directory '{}'", entry.lpath.display()),
                    )
                })?;
            }
            continue;
        }

        session.recv_to_file(&entry.rpath, &entry.lpath).await?;
    }

    Ok(())
}

/// Stats a remote path (following symlinks) in a one-shot session.
pub async fn sync_stat(path: &str, options: &TransportOptions) -> AdbResult<FileStat> {
    let mut session = SyncSession::open(options).await?;
    let st = session.stat(path).await?;
    session.quit().await?;
    Ok(st)
}

/// Lists a remote directory in a one-shot session.
pub async fn sync_list(path: &str, options: &TransportOptions) -> AdbResult<Vec<ListItem>> {
    let mut session = SyncSession::open(options).await?;
    let items = session.list(path).await?;
    session.quit().await?;
    Ok(items)
}

/// Pulls remote paths into a local destination.
///
/// Multiple sources need an existing destination directory; a single source
/// may target a fresh path whose parent exists.
pub async fn sync_pull(
    srcs: &[String],
    dst: &Path,
    options: &TransportOptions,
) -> AdbResult<()> {
    let mut session = SyncSession::open(options).await?;

    let dst_exists = dst.exists();
    let dst_isdir = dst.is_dir();

    if !dst_exists {
        if srcs.len() == 1 {
            let parent_ok = dst
                .parent()
                .map(|p| p.as_os_str().is_empty() || p.exists())
                .unwrap_or(false);
            if !parent_ok {
                return Err(AdbError::sync(
                    -1,
                    format!("cannot create file/directory '{}'", dst.display()),
                ));
            }
        } else {
            return Err(AdbError::sync(
                -1,
                format!("failed to access '{}'", dst.display()),
            ));
        }
    }

    if !dst_isdir && srcs.len() > 1 {
        return Err(AdbError::sync(
            -1,
            format!("target '{}' is not a directory", dst.display()),
        ));
    }

    for src in srcs {
        let src_stat = session.stat(src).await?;

        if src_stat.is_dir() {
            let mut dst_dir = dst.to_path_buf();

            // An existing destination receives the source directory as a
            // child; a fresh one becomes it.
            if dst_exists {
                if !dst_isdir {
                    return Err(AdbError::sync(
                        -1,
                        format!("target '{}' is not a directory", dst.display()),
                    ));
                }
                dst_dir = dst_dir.join(posix_basename(src));
            }

            copy_remote_dir_local(&mut session, src, &dst_dir).await?;
        } else if src_stat.is_regular() {
            let dst_path = if dst_isdir {
                dst.join(posix_basename(src))
            } else {
                dst.to_path_buf()
            };
            session.recv_to_file(src, &dst_path).await?;
        }
    }

    session.quit().await
}

/// Pulls one remote file into memory.
pub async fn sync_pull_buffer(src: &str, options: &TransportOptions) -> AdbResult<Vec<u8>> {
    let mut session = SyncSession::open(options).await?;

    let st = session.stat(src).await?;
    if st.is_dir() {
        return Err(AdbError::sync(-1, format!("target '{src}' is a directory")));
    }

    let buffer = session.recv_to_buffer(src).await?;
    session.quit().await?;
    Ok(buffer)
}

#[cfg(unix)]
fn local_mode_and_mtime(meta: &std::fs::Metadata) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (meta.mode(), meta.mtime().max(0) as u32)
}

#[cfg(not(unix))]
fn local_mode_and_mtime(meta: &std::fs::Metadata) -> (u32, u32) {
    use std::time::UNIX_EPOCH;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    let mode = if meta.is_dir() { S_IFDIR } else { S_IFREG | 0o644 };
    (mode, mtime)
}

/// Walks a local tree collecting regular files and the remote directories
/// that must exist before they land.
fn local_build_list(
    file_list: &mut Vec<CopyEntry>,
    directory_list: &mut Vec<String>,
    lpath: &Path,
    rpath: &str,
) -> AdbResult<()> {
    let mut dirs = Vec::new();

    for dir_entry in std::fs::read_dir(lpath)? {
        let dir_entry = dir_entry?;
        let Ok(meta) = std::fs::symlink_metadata(dir_entry.path()) else {
            continue;
        };
        let name = dir_entry.file_name().to_string_lossy().into_owned();
        let (mode, mtime) = local_mode_and_mtime(&meta);

        if meta.is_dir() {
            dirs.push(CopyEntry::new(lpath, rpath, &name, mode | S_IFDIR));
        } else if meta.file_type().is_file() {
            let mut entry = CopyEntry::new(lpath, rpath, &name, mode);
            entry.mtime = mtime as i64;
            file_list.push(entry);
        }
    }

    for dir in dirs {
        directory_list.push(dir.rpath.clone());
        local_build_list(file_list, directory_list, &dir.lpath, &dir.rpath)?;
    }

    Ok(())
}

/// Older daemons fail to create directories as a push side-effect; batch
/// explicit `mkdir` calls through the shell instead. Failures are tolerated
/// since the directories may already exist.
async fn shell_mkdir_batches(
    directory_list: &[String],
    options: &TransportOptions,
) -> AdbResult<()> {
    const BATCH_LIMIT: usize = 32768;

    let mut cmd = String::from("mkdir");
    for dir in directory_list {
        let escaped = escape_arg(dir);
        if escaped.len() > 16384 {
            return Err(AdbError::sync(-1, format!("path too long: {escaped}")));
        }

        if cmd.len() + escaped.len() > BATCH_LIMIT {
            let _ = host::execute_shell(&cmd, options, Some(true)).await;
            cmd = String::from("mkdir");
        }
        cmd.push(' ');
        cmd.push_str(&escaped);
    }

    if cmd != "mkdir" {
        let _ = host::execute_shell(&cmd, options, Some(true)).await;
    }

    Ok(())
}

async fn copy_local_dir_remote<S>(
    session: &mut SyncSession<S>,
    lpath: &Path,
    rpath: &str,
    have_fixed_push_mkdir: bool,
    have_shell_v2: bool,
    options: &TransportOptions,
) -> AdbResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut rpath = rpath.to_string();
    if !rpath.ends_with('/') {
        rpath.push('/');
    }

    let mut file_list = Vec::new();
    let mut directory_list = Vec::new();

    // Every ancestor of the destination (root excluded) may need creating.
    let mut path = rpath.clone();
    while !is_root_dir(&path) {
        directory_list.push(path.clone());
        let parent = posix_dirname(&path);
        if parent == path {
            break;
        }
        path = parent;
    }
    directory_list.reverse();

    local_build_list(&mut file_list, &mut directory_list, lpath, &rpath)?;

    // Daemons without fixed_push_mkdir need the explicit mkdir workaround,
    // but only shell_v2 daemons survive the long command lines it produces.
    if !have_fixed_push_mkdir && have_shell_v2 {
        shell_mkdir_batches(&directory_list, options).await?;
    }

    for entry in file_list {
        session
            .send_file(&entry.rpath, &entry.lpath, entry.mode, entry.mtime as u32)
            .await?;
    }

    Ok(())
}

/// Pushes local paths to a remote destination. Destination semantics mirror
/// [`sync_pull`].
pub async fn sync_push(
    srcs: &[PathBuf],
    dst: &str,
    options: &TransportOptions,
) -> AdbResult<()> {
    let features = host::get_features(options).await?;
    let have_fixed_push_mkdir = host::has_feature(&features, feature::FIXED_PUSH_MKDIR);
    let have_shell_v2 = host::has_feature(&features, feature::SHELL_V2);

    let mut session = SyncSession::open_with_features(&features, options).await?;

    let mut dst_exists = false;
    let mut dst_isdir = false;
    if let Ok(st) = session.stat(dst).await {
        dst_exists = true;
        dst_isdir = st.is_dir();
    }

    if !dst_isdir {
        if srcs.len() > 1 {
            return Err(AdbError::sync(-1, format!("target '{dst}' is not a directory")));
        }
        // A trailing slash promises a directory; an existing non-directory
        // there is an error.
        if dst.ends_with('/') && dst_exists {
            return Err(AdbError::sync(
                -1,
                format!("failed to access '{dst}': Not a directory"),
            ));
        }
    }

    for src in srcs {
        let Ok(meta) = std::fs::symlink_metadata(src) else {
            continue;
        };

        if meta.is_dir() {
            let mut dst_dir = dst.to_string();
            if dst_exists {
                if !dst_isdir {
                    return Err(AdbError::sync(
                        -1,
                        format!("target '{dst}' is not a directory"),
                    ));
                }
                let name = src
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                dst_dir = posix_join(&dst_dir, &name);
            }

            copy_local_dir_remote(
                &mut session,
                src,
                &dst_dir,
                have_fixed_push_mkdir,
                have_shell_v2,
                options,
            )
            .await?;
        } else if meta.file_type().is_file() {
            let dst_path = if dst_isdir {
                let name = src
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                posix_join(dst, &name)
            } else {
                dst.to_string()
            };

            let (mode, mtime) = local_mode_and_mtime(&meta);
            session.send_file(&dst_path, src, mode, mtime).await?;
        }
    }

    session.quit().await
}

/// Pushes an in-memory payload to one remote file.
pub async fn sync_push_buffer(
    payload: &[u8],
    dst: &str,
    options: &TransportOptions,
) -> AdbResult<()> {
    let mut session = SyncSession::open(options).await?;

    let dst_isdir = session.stat(dst).await.map(|st| st.is_dir()).unwrap_or(false);
    if dst_isdir {
        return Err(AdbError::sync(-1, format!("target '{dst}' is a directory")));
    }

    session.send_buffer(dst, payload, 0o777, 0).await?;
    session.quit().await
}
