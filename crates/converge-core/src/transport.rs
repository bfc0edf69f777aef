//! Copy-source transport
//!
//! The engine reads copy sources through [`Transport`], which is served
//! either by the local filesystem or by a remote agent connection. Remote
//! protocols live outside this crate; they plug in through [`Connector`].
//! [`ConnectionCache`] hands out connections for exclusive use and takes
//! them back as idle when the lease is dropped.

use converge_fs::checksum::compute_reader_checksum;
use converge_fs::{FileMetadata, local_stat};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Server name meaning "read the local filesystem".
pub const LOCALHOST: &str = "localhost";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{path} not found on {server}")]
    NotFound { server: String, path: PathBuf },

    #[error("Connection to {server} is not established")]
    NotConnected { server: String },

    #[error("I/O error on {server} at {path}: {source}")]
    Io {
        server: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("None of the servers {servers:?} could be reached")]
    Unreachable { servers: Vec<String> },
}

impl TransportError {
    pub fn from_io(server: &str, path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound {
                server: server.to_string(),
                path: path.to_path_buf(),
            }
        } else {
            Self::Io {
                server: server.to_string(),
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Connection-level failures end in `Interrupted` rather than `Failed`.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::NotConnected { .. } | Self::Unreachable { .. })
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Read-only access to a copy source.
pub trait Transport: Send + Sync {
    fn server(&self) -> &str;

    fn stat(&self, path: &Path, follow: bool) -> TransportResult<FileMetadata>;

    fn read_link(&self, path: &Path) -> TransportResult<PathBuf>;

    /// Entry names, sorted.
    fn read_dir(&self, path: &Path) -> TransportResult<Vec<OsString>>;

    fn open(&self, path: &Path) -> TransportResult<Box<dyn Read + Send>>;

    /// `sha256:<hex>` digest of the file's content.
    fn digest(&self, path: &Path) -> TransportResult<String> {
        let reader = self.open(path)?;
        compute_reader_checksum(reader).map_err(|e| TransportError::from_io(self.server(), path, e))
    }

    fn is_local(&self) -> bool {
        false
    }

    /// Whether the connection is still usable. Walkers stop descending as
    /// soon as this turns false.
    fn is_established(&self) -> bool {
        true
    }

    /// Whether the peer proved its identity. Unauthenticated sources may
    /// not drive a purge.
    fn is_authenticated(&self) -> bool {
        true
    }

    fn close(&self) {}
}

/// The local filesystem as a copy source.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn server(&self) -> &str {
        LOCALHOST
    }

    fn stat(&self, path: &Path, follow: bool) -> TransportResult<FileMetadata> {
        local_stat(path, follow).map_err(|e| match e {
            converge_fs::Error::Io { source, .. } => TransportError::from_io(LOCALHOST, path, source),
            other => TransportError::Io {
                server: LOCALHOST.into(),
                path: path.to_path_buf(),
                source: io::Error::other(other.to_string()),
            },
        })
    }

    fn read_link(&self, path: &Path) -> TransportResult<PathBuf> {
        fs::read_link(path).map_err(|e| TransportError::from_io(LOCALHOST, path, e))
    }

    fn read_dir(&self, path: &Path) -> TransportResult<Vec<OsString>> {
        let mut names = fs::read_dir(path)
            .and_then(|entries| {
                entries
                    .map(|entry| entry.map(|e| e.file_name()))
                    .collect::<io::Result<Vec<_>>>()
            })
            .map_err(|e| TransportError::from_io(LOCALHOST, path, e))?;
        names.sort();
        Ok(names)
    }

    fn open(&self, path: &Path) -> TransportResult<Box<dyn Read + Send>> {
        let file = fs::File::open(path).map_err(|e| TransportError::from_io(LOCALHOST, path, e))?;
        Ok(Box::new(file))
    }

    fn is_local(&self) -> bool {
        true
    }
}

/// Wraps a transport with a stat cache.
///
/// Remote stats are round trips; a walk stats each source entry several
/// times (selection, comparison, size check).
pub struct CachedTransport {
    inner: Arc<dyn Transport>,
    stats: Mutex<HashMap<(PathBuf, bool), FileMetadata>>,
}

impl CachedTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn invalidate(&self) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl fmt::Debug for CachedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedTransport")
            .field("server", &self.inner.server())
            .finish_non_exhaustive()
    }
}

impl Transport for CachedTransport {
    fn server(&self) -> &str {
        self.inner.server()
    }

    fn stat(&self, path: &Path, follow: bool) -> TransportResult<FileMetadata> {
        let key = (path.to_path_buf(), follow);
        if let Some(hit) = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(hit.clone());
        }
        let meta = self.inner.stat(path, follow)?;
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, meta.clone());
        Ok(meta)
    }

    fn read_link(&self, path: &Path) -> TransportResult<PathBuf> {
        self.inner.read_link(path)
    }

    fn read_dir(&self, path: &Path) -> TransportResult<Vec<OsString>> {
        self.inner.read_dir(path)
    }

    fn open(&self, path: &Path) -> TransportResult<Box<dyn Read + Send>> {
        self.inner.open(path)
    }

    fn digest(&self, path: &Path) -> TransportResult<String> {
        self.inner.digest(path)
    }

    fn is_local(&self) -> bool {
        self.inner.is_local()
    }

    fn is_established(&self) -> bool {
        self.inner.is_established()
    }

    fn is_authenticated(&self) -> bool {
        self.inner.is_authenticated()
    }

    fn close(&self) {
        self.inner.close();
    }
}

/// Opens remote connections. Implemented by the network layer.
pub trait Connector: Send + Sync {
    fn connect(&self, server: &str, background: bool) -> TransportResult<Arc<dyn Transport>>;
}

/// Connector for runs without any remote layer: every remote server is
/// unreachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRemote;

impl Connector for NoRemote {
    fn connect(&self, server: &str, _background: bool) -> TransportResult<Arc<dyn Transport>> {
        Err(TransportError::NotConnected {
            server: server.to_string(),
        })
    }
}

struct Slot {
    server: String,
    transport: Arc<dyn Transport>,
    busy: bool,
}

/// Run-scoped pool of remote connections.
#[derive(Default)]
pub struct ConnectionCache {
    slots: Mutex<Vec<Slot>>,
}

impl fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (busy, idle) = self.counts();
        f.debug_struct("ConnectionCache")
            .field("busy", &busy)
            .field("idle", &idle)
            .finish()
    }
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease a transport for the first reachable server in `servers`.
    ///
    /// An empty list or `localhost` yields the local filesystem. Background
    /// connections bypass the cache and are closed when the lease ends.
    pub fn acquire(
        &self,
        connector: &dyn Connector,
        servers: &[String],
        background: bool,
    ) -> TransportResult<Lease<'_>> {
        if servers.is_empty() {
            return Ok(Lease::local());
        }

        for server in servers {
            if server == LOCALHOST {
                return Ok(Lease::local());
            }

            if !background && let Some(transport) = self.take_idle(server) {
                tracing::debug!(server, "Reusing cached connection");
                return Ok(Lease {
                    transport,
                    owner: Some(self),
                    background,
                });
            }

            match connector.connect(server, background) {
                Ok(raw) => {
                    let transport: Arc<dyn Transport> = Arc::new(CachedTransport::new(raw));
                    if !background {
                        self.lock().push(Slot {
                            server: server.clone(),
                            transport: Arc::clone(&transport),
                            busy: true,
                        });
                    }
                    tracing::debug!(server, background, "Opened connection");
                    return Ok(Lease {
                        transport,
                        owner: (!background).then_some(self),
                        background,
                    });
                }
                Err(e) => {
                    tracing::warn!(server, error = %e, "Server unreachable, trying next");
                }
            }
        }

        Err(TransportError::Unreachable {
            servers: servers.to_vec(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_idle(&self, server: &str) -> Option<Arc<dyn Transport>> {
        let mut slots = self.lock();
        slots.retain(|slot| slot.busy || slot.transport.is_established());
        let slot = slots
            .iter_mut()
            .find(|slot| !slot.busy && slot.server == server)?;
        slot.busy = true;
        Some(Arc::clone(&slot.transport))
    }

    fn release(&self, transport: &Arc<dyn Transport>) {
        let mut slots = self.lock();
        if let Some(slot) = slots
            .iter_mut()
            .find(|slot| Arc::ptr_eq(&slot.transport, transport))
        {
            slot.busy = false;
        }
    }

    /// (busy, idle) connection counts.
    pub fn counts(&self) -> (usize, usize) {
        let slots = self.lock();
        let busy = slots.iter().filter(|s| s.busy).count();
        (busy, slots.len() - busy)
    }

    /// Close every cached connection. Called at the end of a run.
    pub fn close_all(&self) {
        for slot in self.lock().drain(..) {
            slot.transport.close();
        }
    }
}

/// Exclusive use of one transport. Dropping the lease returns the
/// connection to the cache as idle, or closes it in background mode.
pub struct Lease<'a> {
    transport: Arc<dyn Transport>,
    owner: Option<&'a ConnectionCache>,
    background: bool,
}

impl Lease<'_> {
    fn local() -> Self {
        Self {
            transport: Arc::new(LocalTransport),
            owner: None,
            background: false,
        }
    }
}

impl Deref for Lease<'_> {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        self.transport.as_ref()
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.background {
            self.transport.close();
        } else if let Some(cache) = self.owner {
            cache.release(&self.transport);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRemote {
        stats: AtomicUsize,
        closed: AtomicUsize,
    }

    impl Transport for CountingRemote {
        fn server(&self) -> &str {
            "remote"
        }
        fn stat(&self, path: &Path, follow: bool) -> TransportResult<FileMetadata> {
            self.stats.fetch_add(1, Ordering::SeqCst);
            LocalTransport.stat(path, follow)
        }
        fn read_link(&self, path: &Path) -> TransportResult<PathBuf> {
            LocalTransport.read_link(path)
        }
        fn read_dir(&self, path: &Path) -> TransportResult<Vec<OsString>> {
            LocalTransport.read_dir(path)
        }
        fn open(&self, path: &Path) -> TransportResult<Box<dyn Read + Send>> {
            LocalTransport.open(path)
        }
        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixed(Arc<CountingRemote>);

    impl Connector for Fixed {
        fn connect(&self, server: &str, _background: bool) -> TransportResult<Arc<dyn Transport>> {
            if server == "remote" {
                Ok(self.0.clone() as Arc<dyn Transport>)
            } else {
                Err(TransportError::NotConnected {
                    server: server.into(),
                })
            }
        }
    }

    #[test]
    fn empty_server_list_is_local() {
        let cache = ConnectionCache::new();
        let lease = cache.acquire(&NoRemote, &[], false).unwrap();
        assert!(lease.is_local());
    }

    #[test]
    fn lease_returns_connection_as_idle() {
        let remote = Arc::new(CountingRemote::default());
        let cache = ConnectionCache::new();
        let servers = vec!["down".to_string(), "remote".to_string()];

        {
            let lease = cache.acquire(&Fixed(remote.clone()), &servers, false).unwrap();
            assert_eq!(lease.server(), "remote");
            assert_eq!(cache.counts(), (1, 0));
        }
        assert_eq!(cache.counts(), (0, 1));
        assert_eq!(remote.closed.load(Ordering::SeqCst), 0);

        let _again = cache.acquire(&Fixed(remote.clone()), &servers, false).unwrap();
        assert_eq!(cache.counts(), (1, 0));
    }

    #[test]
    fn background_lease_closes_connection() {
        let remote = Arc::new(CountingRemote::default());
        let cache = ConnectionCache::new();
        drop(
            cache
                .acquire(&Fixed(remote.clone()), &["remote".to_string()], true)
                .unwrap(),
        );
        assert_eq!(remote.closed.load(Ordering::SeqCst), 1);
        assert_eq!(cache.counts(), (0, 0));
    }

    #[test]
    fn unreachable_when_all_fail() {
        let cache = ConnectionCache::new();
        let err = cache
            .acquire(&NoRemote, &["a".to_string(), "b".to_string()], false)
            .err()
            .unwrap();
        assert!(err.is_disconnect());
    }

    #[test]
    fn cached_transport_memoizes_stats() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, "x").unwrap();

        let remote = Arc::new(CountingRemote::default());
        let cached = CachedTransport::new(remote.clone());
        cached.stat(&file, true).unwrap();
        cached.stat(&file, true).unwrap();
        assert_eq!(remote.stats.load(Ordering::SeqCst), 1);

        cached.invalidate();
        cached.stat(&file, true).unwrap();
        assert_eq!(remote.stats.load(Ordering::SeqCst), 2);
    }
}
