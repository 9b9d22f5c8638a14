//! Socket channels: named stream endpoints grouped in a private directory.
//!
//! Every plugin instance owns one socket group. Each socket in the group is
//! a strictly typed channel: exactly one `(Request, Response)` pair travels
//! over it, which keeps the receiving dispatcher monomorphic. The native
//! side binds every endpoint before spawning the foreign host; the foreign
//! host connects to all of them within the handshake timeout.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{self, DEFAULT_FRAME_CAP};
use crate::error::{BridgeError, Result};

/// How long the native side waits for the foreign host to pair every
/// channel before giving up on the whole launch.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// Poll interval used while accepting connections and watching liveness.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A typed message that travels native→foreign or foreign→native on its own
/// channel, paired with exactly one response shape.
pub trait Request: Serialize + DeserializeOwned + Send + 'static {
    /// The response the other side must answer with.
    type Response: Serialize + DeserializeOwned + Send + 'static;

    /// Whether a receiver may service this request directly on the socket
    /// thread. Requests that must run on the receiver's main (GUI) thread
    /// return `false` and get thunked onto an idle queue.
    fn main_thread_safe(&self) -> bool {
        true
    }
}

static GROUP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Directory that groups all sockets (and the shared audio file) of one
/// plugin instance. Created with owner-only permissions; unlinked when the
/// creating side drops it.
pub struct SocketGroup {
    dir: PathBuf,
    owned: bool,
}

impl SocketGroup {
    /// Create a fresh group directory under the OS runtime directory,
    /// falling back to the temp directory.
    pub fn create() -> Result<SocketGroup> {
        let base = std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        let name = format!(
            "winebridge-{}-{}",
            std::process::id(),
            GROUP_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let dir = base.join(name);
        fs::DirBuilder::new().mode(0o700).create(&dir)?;
        Ok(SocketGroup { dir, owned: true })
    }

    /// Adopt an existing group directory (foreign host side). The adopter
    /// never unlinks it.
    pub fn adopt<P: Into<PathBuf>>(dir: P) -> SocketGroup {
        SocketGroup { dir: dir.into(), owned: false }
    }

    /// The group directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a named socket inside the group.
    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.sock", name))
    }

    /// Name for the shared audio file of this group.
    pub fn shm_file_name(&self) -> String {
        "audio.shm".to_string()
    }
}

impl Drop for SocketGroup {
    fn drop(&mut self) {
        if self.owned {
            if let Err(err) = fs::remove_dir_all(&self.dir) {
                if err.kind() != ErrorKind::NotFound {
                    warn!("failed to remove socket group {}: {}", self.dir.display(), err);
                }
            }
        }
    }
}

/// Server-side endpoints bound but not yet paired.
pub struct GroupEndpoints {
    listeners: Vec<(String, UnixListener)>,
}

impl GroupEndpoints {
    /// Bind a listener for every named channel in the group.
    pub fn bind(group: &SocketGroup, names: &[&str]) -> Result<GroupEndpoints> {
        let mut listeners = Vec::with_capacity(names.len());
        for name in names {
            let listener = UnixListener::bind(group.socket_path(name))?;
            listener.set_nonblocking(true)?;
            listeners.push((name.to_string(), listener));
        }
        Ok(GroupEndpoints { listeners })
    }

    /// Accept one connection per endpoint, in any order, within `timeout`.
    ///
    /// `liveness` is polled between accept attempts; the startup watchdog
    /// uses it to fail fast when the foreign host dies before connecting.
    pub fn accept_all<F>(
        self,
        timeout: Duration,
        mut liveness: F,
    ) -> Result<HashMap<String, UnixStream>>
    where
        F: FnMut() -> Result<()>,
    {
        let deadline = Instant::now() + timeout;
        let mut pending = self.listeners;
        let mut paired = HashMap::new();
        while !pending.is_empty() {
            liveness()?;
            let mut still_pending = Vec::with_capacity(pending.len());
            for (name, listener) in pending {
                match listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(false)?;
                        debug!("paired channel {}", name);
                        paired.insert(name, stream);
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        still_pending.push((name, listener));
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            pending = still_pending;
            if pending.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(BridgeError::HandshakeTimeout);
            }
            std::thread::sleep(ACCEPT_POLL_INTERVAL);
        }
        Ok(paired)
    }
}

/// Connect to every named endpoint of an existing group (foreign host side).
pub fn connect_group(
    group: &SocketGroup,
    names: &[&str],
    timeout: Duration,
) -> Result<HashMap<String, UnixStream>> {
    let deadline = Instant::now() + timeout;
    let mut paired = HashMap::new();
    for name in names {
        let path = group.socket_path(name);
        loop {
            match UnixStream::connect(&path) {
                Ok(stream) => {
                    paired.insert(name.to_string(), stream);
                    break;
                }
                Err(err) if Instant::now() < deadline => {
                    trace!("retrying connect to {}: {}", path.display(), err);
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(paired)
}

/// Client end of a strictly typed channel.
///
/// One mutex serialises whole request/response pairs, so concurrent callers
/// on the same channel cannot interleave on the wire and the sender observes
/// responses in request order.
pub struct EventChannel<R: Request> {
    stream: Mutex<UnixStream>,
    cap: u64,
    _request: std::marker::PhantomData<fn(R)>,
}

impl<R: Request> EventChannel<R> {
    /// Wrap a paired stream.
    pub fn new(stream: UnixStream) -> EventChannel<R> {
        EventChannel::with_cap(stream, DEFAULT_FRAME_CAP)
    }

    /// Wrap a paired stream with a custom frame cap.
    pub fn with_cap(stream: UnixStream, cap: u64) -> EventChannel<R> {
        EventChannel { stream: Mutex::new(stream), cap, _request: std::marker::PhantomData }
    }

    /// Send a request and block for its response.
    pub fn send_and_receive(&self, request: &R) -> Result<R::Response> {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        codec::write_frame(&mut *stream, request, self.cap)?;
        codec::read_frame(&mut *stream, self.cap)
    }

    /// Run a custom exchange while holding the channel lock.
    ///
    /// The audio path uses this for its framed-request / bare-byte-ack
    /// round-trip.
    pub(crate) fn with_stream<T>(
        &self,
        f: impl FnOnce(&mut UnixStream, u64) -> Result<T>,
    ) -> Result<T> {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stream, self.cap)
    }

    /// Shut down the underlying socket, unblocking any reader.
    pub fn shutdown(&self) {
        if let Ok(stream) = self.stream.lock() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// Version message exchanged on the control channel right after pairing.
/// Carried inside each ABI's control request family.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Crate version of the sending side.
    pub version: String,
}

impl VersionInfo {
    /// This build's version message.
    pub fn current() -> VersionInfo {
        VersionInfo { version: env!("CARGO_PKG_VERSION").to_string() }
    }

    /// Compare against the peer's version. A mismatch is logged, never
    /// fatal: the protocol is versioned by the message layout itself.
    pub fn check(&self, theirs: &VersionInfo) {
        if self != theirs {
            warn!(
                "version mismatch between native stub ({}) and foreign host ({})",
                self.version, theirs.version
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Ping(u32);

    impl Request for Ping {
        type Response = u32;
    }

    #[test]
    fn group_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let group = SocketGroup::create().unwrap();
        let mode = fs::metadata(group.dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn group_dir_unlinked_on_drop() {
        let group = SocketGroup::create().unwrap();
        let dir = group.dir().to_path_buf();
        assert!(dir.exists());
        drop(group);
        assert!(!dir.exists());
    }

    #[test]
    fn channel_pairs_and_round_trips() {
        let group = SocketGroup::create().unwrap();
        let endpoints = GroupEndpoints::bind(&group, &["control"]).unwrap();

        let dir = group.dir().to_path_buf();
        let client = std::thread::spawn(move || {
            let group = SocketGroup::adopt(dir);
            let mut streams =
                connect_group(&group, &["control"], Duration::from_secs(5)).unwrap();
            let mut stream = streams.remove("control").unwrap();
            let request: Ping = codec::read_frame(&mut stream, DEFAULT_FRAME_CAP).unwrap();
            codec::write_frame(&mut stream, &(request.0 * 2), DEFAULT_FRAME_CAP).unwrap();
        });

        let mut streams =
            endpoints.accept_all(Duration::from_secs(5), || Ok(())).unwrap();
        let channel = EventChannel::<Ping>::new(streams.remove("control").unwrap());
        assert_eq!(channel.send_and_receive(&Ping(21)).unwrap(), 42);
        client.join().unwrap();
    }

    #[test]
    fn accept_all_times_out_without_peer() {
        let group = SocketGroup::create().unwrap();
        let endpoints = GroupEndpoints::bind(&group, &["dispatch"]).unwrap();
        let err = endpoints
            .accept_all(Duration::from_millis(50), || Ok(()))
            .unwrap_err();
        assert!(matches!(err, BridgeError::HandshakeTimeout));
    }

    #[test]
    fn accept_all_reports_liveness_failure() {
        let group = SocketGroup::create().unwrap();
        let endpoints = GroupEndpoints::bind(&group, &["dispatch"]).unwrap();
        let err = endpoints
            .accept_all(Duration::from_secs(5), || Err(BridgeError::HostExited(9)))
            .unwrap_err();
        assert!(matches!(err, BridgeError::HostExited(9)));
    }
}
