//! Connection points
//!
//! A listener binds a Unix socket at a filesystem path. A client connects,
//! writes its key line, and gets back a fixed hello record with the segment
//! descriptor attached. The socket then stays open as the segment's
//! descriptor channel, so its closing doubles as the liveness signal.

use crate::client::{AttachSource, ClientSegment};
use crate::config::TransportConfig;
use crate::descriptor::DescriptorChannel;
use crate::error::{FrameLinkError, Result};
use crate::layout::{Geometry, LAYOUT_COOKIE};
use crate::server::{next_segment_name, Segment, ServerClient};
use rustix::event::{poll, PollFd, PollFlags};
use rustix::io::Errno;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Variable naming the default connection point
pub const CONNPATH_ENV: &str = "FRAMELINK_CONNPATH";
/// Variable holding the optional authentication key
pub const CONNKEY_ENV: &str = "FRAMELINK_CONNKEY";

const HELLO_MAGIC: [u8; 4] = *b"FLK0";
const HELLO_NAME_LEN: usize = 64;
/// magic, status, name length, padding, cookie, name
const HELLO_LEN: usize = 4 + 1 + 1 + 2 + 8 + HELLO_NAME_LEN;
const MAX_KEY_LEN: usize = 256;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum HelloStatus {
    Accepted = 0,
    Rejected = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Hello {
    status: HelloStatus,
    cookie: u64,
    name: String,
}

impl Hello {
    fn encode(&self) -> Result<[u8; HELLO_LEN]> {
        let name = self.name.as_bytes();
        if name.len() > HELLO_NAME_LEN {
            return Err(FrameLinkError::NameTooLong {
                max: HELLO_NAME_LEN,
                got: name.len(),
            });
        }

        let mut out = [0u8; HELLO_LEN];
        out[0..4].copy_from_slice(&HELLO_MAGIC);
        out[4] = self.status as u8;
        out[5] = name.len() as u8;
        out[8..16].copy_from_slice(&self.cookie.to_le_bytes());
        out[16..16 + name.len()].copy_from_slice(name);
        Ok(out)
    }

    fn decode(frame: &[u8; HELLO_LEN]) -> Result<Self> {
        if frame[0..4] != HELLO_MAGIC {
            return Err(FrameLinkError::ProtocolMismatch {
                expected: u32::from_le_bytes(HELLO_MAGIC) as u64,
                got: u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as u64,
            });
        }
        let status = match frame[4] {
            0 => HelloStatus::Accepted,
            _ => HelloStatus::Rejected,
        };
        let name_len = (frame[5] as usize).min(HELLO_NAME_LEN);
        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&frame[8..16]);

        Ok(Self {
            status,
            cookie: u64::from_le_bytes(cookie),
            name: String::from_utf8_lossy(&frame[16..16 + name_len]).into_owned(),
        })
    }
}

/// Resolve a connection point name to a socket path
///
/// Absolute paths are used as given; bare names land in `$XDG_RUNTIME_DIR`,
/// then `$HOME`, then `/tmp`.
pub fn resolve_connpath(name: &str) -> Result<PathBuf> {
    if name.is_empty() {
        return Err(FrameLinkError::NoConnectionPoint("empty name".into()));
    }
    let path = Path::new(name);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    if name.contains('/') {
        return Err(FrameLinkError::NoConnectionPoint(format!(
            "relative path '{}' is not a connection point name",
            name
        )));
    }

    let base = ["XDG_RUNTIME_DIR", "HOME"]
        .iter()
        .filter_map(|var| std::env::var_os(var))
        .find(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    Ok(base.join(name))
}

/// A client that connected but has not finished its key line
struct Handshake {
    stream: UnixStream,
    key: Vec<u8>,
    deadline: Instant,
}

impl Handshake {
    fn new(stream: UnixStream, now: Instant) -> Result<Self> {
        stream.set_nonblocking(true).map_err(FrameLinkError::Socket)?;
        Ok(Self {
            stream,
            key: Vec::new(),
            deadline: now + HANDSHAKE_TIMEOUT,
        })
    }

    /// Read whatever arrived; `Some` once the key line is complete
    fn read_available(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(FrameLinkError::PeerLost("closed during handshake".into())),
                Ok(n) => {
                    if let Some(end) = buf[..n].iter().position(|&b| b == b'\n') {
                        self.key.extend_from_slice(&buf[..end]);
                        return self.finish();
                    }
                    self.key.extend_from_slice(&buf[..n]);
                    if self.key.len() > MAX_KEY_LEN {
                        return Err(FrameLinkError::AuthRejected);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(FrameLinkError::Socket(e)),
            }
        }
    }

    fn finish(&mut self) -> Result<Option<Vec<u8>>> {
        if self.key.len() > MAX_KEY_LEN {
            return Err(FrameLinkError::AuthRejected);
        }
        Ok(Some(std::mem::take(&mut self.key)))
    }
}

/// A bound, listening connection point
pub struct ConnectionPoint {
    listener: UnixListener,
    path: PathBuf,
    key: Option<Vec<u8>>,
    config: TransportConfig,
    geometry: Geometry,
    /// Connected clients still sending their key line
    pending: Vec<Handshake>,
}

impl ConnectionPoint {
    /// Bind a connection point; every accepted client gets a segment of `geometry`
    ///
    /// A stale socket file nobody listens on is replaced.
    pub fn bind(name: &str, key: Option<&str>, config: &TransportConfig, geometry: Geometry) -> Result<Self> {
        geometry.validate(config.max_width, config.max_height)?;
        let path = resolve_connpath(name)?;

        if path.exists() {
            if UnixStream::connect(&path).is_ok() {
                return Err(FrameLinkError::Socket(std::io::Error::new(
                    ErrorKind::AddrInUse,
                    format!("{} is already served", path.display()),
                )));
            }
            std::fs::remove_file(&path).map_err(FrameLinkError::Socket)?;
        }

        let listener = UnixListener::bind(&path).map_err(FrameLinkError::Socket)?;
        info!(path = %path.display(), "connection point bound");
        Ok(Self {
            listener,
            path,
            key: key.filter(|k| !k.is_empty()).map(|k| k.as_bytes().to_vec()),
            config: config.clone(),
            geometry,
            pending: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one client, blocking until it connects
    pub fn accept(&mut self) -> Result<ServerClient> {
        loop {
            if let Some(client) = self.accept_timeout(None)? {
                return Ok(client);
            }
        }
    }

    /// Accept one client, waiting at most `timeout`
    ///
    /// `Ok(None)` on timeout. Key lines are read as they arrive, so a client
    /// that connects and stays silent never holds up the others; it is
    /// dropped once its handshake deadline passes. A client with the wrong
    /// key is answered with a rejecting hello and reported as
    /// `AuthRejected`; the listener stays up.
    pub fn accept_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<ServerClient>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let now = Instant::now();
            self.pending.retain(|handshake| {
                let alive = handshake.deadline > now;
                if !alive {
                    debug!("handshake timed out");
                }
                alive
            });

            let mut wait = deadline.map(|d| d.saturating_duration_since(now));
            if let Some(first) = self.pending.iter().map(|h| h.deadline).min() {
                let until = first.saturating_duration_since(now);
                wait = Some(wait.map_or(until, |w| w.min(until)));
            }
            let timeout_ms = wait.map_or(-1, |t| t.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32);

            let (listener_ready, ready) = {
                let mut fds = Vec::with_capacity(1 + self.pending.len());
                fds.push(PollFd::new(&self.listener, PollFlags::IN));
                for handshake in &self.pending {
                    fds.push(PollFd::new(&handshake.stream, PollFlags::IN));
                }
                match poll(&mut fds, timeout_ms) {
                    Ok(_) => {}
                    Err(Errno::INTR) => return Ok(None),
                    Err(e) => return Err(FrameLinkError::Socket(e.into())),
                }
                let ready: Vec<usize> = fds[1..]
                    .iter()
                    .enumerate()
                    .filter(|(_, fd)| !fd.revents().is_empty())
                    .map(|(index, _)| index)
                    .collect();
                (!fds[0].revents().is_empty(), ready)
            };

            // descending, so swap_remove only moves entries already visited
            for index in ready.into_iter().rev() {
                match self.pending[index].read_available() {
                    Ok(None) => {}
                    Ok(Some(key)) => {
                        let handshake = self.pending.swap_remove(index);
                        return self.complete(handshake.stream, key).map(Some);
                    }
                    Err(e) => {
                        debug!(error = %e, "handshake abandoned");
                        self.pending.swap_remove(index);
                    }
                }
            }

            if listener_ready {
                match self.listener.accept() {
                    Ok((stream, _)) => {
                        self.pending.push(Handshake::new(stream, Instant::now())?);
                        continue;
                    }
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                    Err(e) => return Err(FrameLinkError::Socket(e)),
                }
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
        }
    }

    /// Number of clients still in their handshake
    pub fn pending_handshakes(&self) -> usize {
        self.pending.len()
    }

    fn complete(&self, stream: UnixStream, presented: Vec<u8>) -> Result<ServerClient> {
        stream.set_nonblocking(false).map_err(FrameLinkError::Socket)?;
        if let Some(key) = &self.key {
            if presented != *key {
                warn!(path = %self.path.display(), "client presented wrong key");
                let reject = Hello {
                    status: HelloStatus::Rejected,
                    cookie: LAYOUT_COOKIE,
                    name: String::new(),
                };
                let _ = DescriptorChannel::new(stream).send_message(&reject.encode()?, None);
                return Err(FrameLinkError::AuthRejected);
            }
        }

        let name = next_segment_name();
        let segment = Segment::create_named(&name, &self.config, self.geometry, DescriptorChannel::new(stream))?;
        let hello = Hello {
            status: HelloStatus::Accepted,
            cookie: LAYOUT_COOKIE,
            name,
        };
        segment
            .channel()
            .send_message(&hello.encode()?, Some(segment.region().fd()))?;
        debug!(segment = segment.name(), "client accepted");
        Ok(segment)
    }
}

impl Drop for ConnectionPoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connect to the connection point at `path` and attach the offered segment
pub fn connect(path: &Path, key: Option<&str>, config: &TransportConfig) -> Result<ClientSegment> {
    let mut stream = UnixStream::connect(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
            FrameLinkError::NoConnectionPoint(format!("{}: {}", path.display(), e))
        }
        _ => FrameLinkError::Socket(e),
    })?;

    let mut line = key.unwrap_or_default().as_bytes().to_vec();
    line.push(b'\n');
    stream.write_all(&line).map_err(FrameLinkError::Socket)?;

    let channel = DescriptorChannel::new(stream);
    let mut frame = [0u8; HELLO_LEN];
    let fd = channel.recv_message(&mut frame)?;
    let hello = Hello::decode(&frame)?;

    if hello.status == HelloStatus::Rejected {
        return Err(FrameLinkError::AuthRejected);
    }
    if hello.cookie != LAYOUT_COOKIE {
        return Err(FrameLinkError::ProtocolMismatch {
            expected: LAYOUT_COOKIE,
            got: hello.cookie,
        });
    }
    let fd = fd.ok_or_else(|| FrameLinkError::TransferFailed("hello carried no segment".into()))?;

    ClientSegment::attach(
        AttachSource::Fd {
            fd,
            name: hello.name,
        },
        channel,
        config,
    )
}

/// Connect to the connection point named by the environment
pub fn connect_default(config: &TransportConfig) -> Result<ClientSegment> {
    let name = std::env::var(CONNPATH_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| FrameLinkError::NoConnectionPoint(format!("{} not set", CONNPATH_ENV)))?;
    let key = std::env::var(CONNKEY_ENV).ok();
    connect(&resolve_connpath(&name)?, key.as_deref(), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SegmentKind;
    use crate::state::SegmentState;
    use std::thread;

    fn socket_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("framelink_{}_{}.sock", tag, std::process::id()))
    }

    #[test]
    fn test_hello_encoding() {
        let hello = Hello {
            status: HelloStatus::Accepted,
            cookie: LAYOUT_COOKIE,
            name: "1234_7".into(),
        };
        let frame = hello.encode().unwrap();
        assert_eq!(Hello::decode(&frame).unwrap(), hello);

        let mut bad = frame;
        bad[0] = b'X';
        assert!(matches!(
            Hello::decode(&bad),
            Err(FrameLinkError::ProtocolMismatch { .. })
        ));
    }

    #[test]
    fn test_resolve_absolute_path_verbatim() {
        assert_eq!(
            resolve_connpath("/run/framelink/display").unwrap(),
            PathBuf::from("/run/framelink/display")
        );
        assert!(resolve_connpath("").is_err());
        assert!(resolve_connpath("a/b").is_err());
        assert!(resolve_connpath("display").unwrap().ends_with("display"));
    }

    #[test]
    fn test_connect_and_register() {
        let path = socket_path("accept");
        let config = TransportConfig::default();
        let mut point = ConnectionPoint::bind(path.to_str().unwrap(), Some("sekrit"), &config, Geometry::new(64, 32)).unwrap();

        let client_path = path.clone();
        let handle = thread::spawn(move || {
            let mut client = connect(&client_path, Some("sekrit"), &TransportConfig::default()).unwrap();
            assert_eq!(client.geometry(), Geometry::new(64, 32));
            client.register(SegmentKind::Application, "demo").unwrap();
            client
        });

        let mut server = point.accept_timeout(Some(Duration::from_secs(5))).unwrap().unwrap();
        let client = handle.join().unwrap();
        assert_eq!(client.state(), SegmentState::Preroll);

        let registered = server.wait_event(Some(Duration::from_secs(1))).unwrap();
        assert!(registered.is_some());
        assert_eq!(server.state(), SegmentState::Preroll);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let path = socket_path("auth");
        let config = TransportConfig::default();
        let mut point = ConnectionPoint::bind(path.to_str().unwrap(), Some("right"), &config, Geometry::new(16, 16)).unwrap();

        let client_path = path.clone();
        let handle = thread::spawn(move || connect(&client_path, Some("wrong"), &TransportConfig::default()));

        assert!(matches!(
            point.accept_timeout(Some(Duration::from_secs(5))),
            Err(FrameLinkError::AuthRejected)
        ));
        assert!(matches!(handle.join().unwrap(), Err(FrameLinkError::AuthRejected)));
    }

    #[test]
    fn test_silent_client_does_not_hold_up_others() {
        let path = socket_path("silent");
        let config = TransportConfig::default();
        let mut point = ConnectionPoint::bind(path.to_str().unwrap(), None, &config, Geometry::new(16, 16)).unwrap();

        // Connects and never sends its key line
        let _silent = UnixStream::connect(&path).unwrap();
        assert!(point.accept_timeout(Some(Duration::from_millis(20))).unwrap().is_none());
        assert_eq!(point.pending_handshakes(), 1);

        let client_path = path.clone();
        let handle = thread::spawn(move || connect(&client_path, None, &TransportConfig::default()));

        let started = Instant::now();
        let server = point.accept_timeout(Some(Duration::from_secs(5))).unwrap().unwrap();
        assert!(started.elapsed() < HANDSHAKE_TIMEOUT);
        let client = handle.join().unwrap().unwrap();
        assert_eq!(client.name(), server.name());
        assert_eq!(point.pending_handshakes(), 1);
    }

    #[test]
    fn test_missing_connection_point() {
        let result = connect(&socket_path("absent"), None, &TransportConfig::default());
        assert!(matches!(result, Err(FrameLinkError::NoConnectionPoint(_))));
    }
}
