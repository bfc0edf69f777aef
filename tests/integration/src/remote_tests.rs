//! Copy promises served by a remote source.
//!
//! `FakeRemote` serves a local directory under a server name and lets each
//! test decide whether the peer authenticated and when the link drops.

use converge_core::transport::{Connector, Transport, TransportError, TransportResult};
use converge_core::{
    AttributeSpec, CopyPolicy, FilePromise, MemoryReporter, Outcome, RecursionPolicy, RunContext, reconcile,
};
use converge_fs::{FileMetadata, local_stat};
use converge_test_utils::TestTree;
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug)]
struct FakeRemote {
    name: String,
    authenticated: bool,
    /// The connection drops once this many files have been opened.
    drop_after_opens: Option<usize>,
    opens: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl FakeRemote {
    fn io_error(&self, path: &Path, source: std::io::Error) -> TransportError {
        TransportError::from_io(&self.name, path, source)
    }
}

impl Transport for FakeRemote {
    fn server(&self) -> &str {
        &self.name
    }

    fn stat(&self, path: &Path, follow: bool) -> TransportResult<FileMetadata> {
        local_stat(path, follow).map_err(|e| match e {
            converge_fs::Error::Io { source, .. } => self.io_error(path, source),
            other => self.io_error(path, std::io::Error::other(other.to_string())),
        })
    }

    fn read_link(&self, path: &Path) -> TransportResult<PathBuf> {
        std::fs::read_link(path).map_err(|e| self.io_error(path, e))
    }

    fn read_dir(&self, path: &Path) -> TransportResult<Vec<OsString>> {
        let mut names = std::fs::read_dir(path)
            .and_then(|entries| entries.map(|e| e.map(|e| e.file_name())).collect::<std::io::Result<Vec<_>>>())
            .map_err(|e| self.io_error(path, e))?;
        names.sort();
        Ok(names)
    }

    fn open(&self, path: &Path) -> TransportResult<Box<dyn Read + Send>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let file = std::fs::File::open(path).map_err(|e| self.io_error(path, e))?;
        Ok(Box::new(file))
    }

    fn is_established(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self
                .drop_after_opens
                .is_none_or(|limit| self.opens.load(Ordering::SeqCst) < limit)
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeConnector {
    authenticated: bool,
    drop_after_opens: Option<usize>,
    connects: AtomicUsize,
    /// Files opened across every connection handed out.
    opens: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl FakeConnector {
    fn trusted() -> Self {
        Self {
            authenticated: true,
            ..Self::default()
        }
    }
}

impl Connector for FakeConnector {
    fn connect(&self, server: &str, _background: bool) -> TransportResult<Arc<dyn Transport>> {
        if server != "fake" {
            return Err(TransportError::NotConnected {
                server: server.to_string(),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeRemote {
            name: server.to_string(),
            authenticated: self.authenticated,
            drop_after_opens: self.drop_after_opens,
            opens: Arc::clone(&self.opens),
            closed: Arc::clone(&self.closed),
        }))
    }
}

fn remote_copy(source: &Path, servers: &[&str]) -> AttributeSpec {
    AttributeSpec {
        copy: Some(CopyPolicy {
            source: source.to_path_buf(),
            servers: servers.iter().map(|s| s.to_string()).collect(),
            ..CopyPolicy::default()
        }),
        recursion: Some(RecursionPolicy::default()),
        ..AttributeSpec::default()
    }
}

fn source_tree() -> TestTree {
    TestTree::new()
        .file("remote/a", "alpha")
        .file("remote/sub/b", "beta")
}

#[test]
fn remote_tree_is_copied_and_connection_reused() {
    let tree = source_tree();
    let connector = Arc::new(FakeConnector::trusted());
    let ctx = RunContext::new().with_connector(connector.clone());

    let promise = FilePromise::new(tree.path("local"), remote_copy(&tree.path("remote"), &["fake"]));
    assert_eq!(reconcile(&ctx, &promise), Outcome::Changed);
    tree.assert_contents("local/a", "alpha");
    tree.assert_contents("local/sub/b", "beta");
    assert_eq!(ctx.connections.counts(), (0, 1));

    assert_eq!(reconcile(&ctx, &promise), Outcome::NoChange);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

    ctx.finish().unwrap();
    assert_eq!(ctx.connections.counts(), (0, 0));
    assert!(connector.closed.load(Ordering::SeqCst));
}

#[rstest]
#[case(&["down", "fake"], Outcome::Changed)]
#[case(&["down"], Outcome::Interrupted)]
fn servers_are_tried_in_order(#[case] servers: &[&str], #[case] expected: Outcome) {
    let tree = source_tree();
    let ctx = RunContext::new().with_connector(Arc::new(FakeConnector::trusted()));

    let promise = FilePromise::new(tree.path("local"), remote_copy(&tree.path("remote"), servers));
    assert_eq!(reconcile(&ctx, &promise), expected);
}

#[test]
fn unauthenticated_source_may_not_purge() {
    let tree = source_tree().file("local/precious", "keep me");
    let ctx = RunContext::new().with_connector(Arc::new(FakeConnector::default()));

    let mut spec = remote_copy(&tree.path("remote"), &["fake"]);
    if let Some(copy) = spec.copy.as_mut() {
        copy.purge = true;
    }

    assert_eq!(reconcile(&ctx, &FilePromise::new(tree.path("local"), spec)), Outcome::Denied);
    tree.assert_contents("local/precious", "keep me");
    tree.assert_missing("local/a");
}

#[test]
fn background_connection_is_closed_after_use() {
    let tree = source_tree();
    let connector = Arc::new(FakeConnector::trusted());
    let ctx = RunContext::new().with_connector(connector.clone());

    let mut spec = remote_copy(&tree.path("remote"), &["fake"]);
    if let Some(copy) = spec.copy.as_mut() {
        copy.background = true;
    }

    assert_eq!(reconcile(&ctx, &FilePromise::new(tree.path("local"), spec)), Outcome::Changed);
    assert!(connector.closed.load(Ordering::SeqCst));
    assert_eq!(ctx.connections.counts(), (0, 0));
}

#[test]
fn dropped_connection_interrupts_the_walk_and_skips_purge() {
    let tree = source_tree().file("local/stale", "old");
    let connector = Arc::new(FakeConnector {
        authenticated: true,
        drop_after_opens: Some(1),
        ..FakeConnector::default()
    });
    let ctx = RunContext::new().with_connector(connector);

    let mut spec = remote_copy(&tree.path("remote"), &["fake"]);
    if let Some(copy) = spec.copy.as_mut() {
        copy.purge = true;
    }

    assert_eq!(reconcile(&ctx, &FilePromise::new(tree.path("local"), spec)), Outcome::Interrupted);
    tree.assert_contents("local/a", "alpha");
    tree.assert_missing("local/sub");
    tree.assert_contents("local/stale", "old");
}

#[test]
fn failing_sibling_does_not_hide_a_dropped_connection_from_purge() {
    let tree = TestTree::new()
        .file("remote/0bad", "file in the source")
        .file("remote/a", "alpha")
        .file("remote/sub/b", "beta")
        .dir("local/0bad")
        .file("local/sub/b", "beta")
        .file("local/stale", "old");
    let connector = Arc::new(FakeConnector {
        authenticated: true,
        drop_after_opens: Some(1),
        ..FakeConnector::default()
    });
    let reporter = Arc::new(MemoryReporter::new());
    let ctx = RunContext::new()
        .with_connector(connector)
        .with_reporter(reporter.clone());

    let mut spec = remote_copy(&tree.path("remote"), &["fake"]);
    if let Some(copy) = spec.copy.as_mut() {
        copy.purge = true;
    }

    assert_eq!(reconcile(&ctx, &FilePromise::new(tree.path("local"), spec)), Outcome::Failed);
    assert!(
        reporter.entries().iter().any(|e| e.outcome == Outcome::Interrupted),
        "the lost connection should still be reported"
    );
    tree.assert_contents("local/a", "alpha");
    tree.assert_contents("local/sub/b", "beta");
    tree.assert_contents("local/stale", "old");
}

#[test]
fn hard_linked_sources_are_transferred_once() {
    let tree = TestTree::new()
        .file("remote/a", "plain")
        .file("remote/b", "shared")
        .hard_link("remote/b", "remote/c");
    let connector = Arc::new(FakeConnector::trusted());
    let ctx = RunContext::new().with_connector(connector.clone());

    let promise = FilePromise::new(tree.path("local"), remote_copy(&tree.path("remote"), &["fake"]));
    assert_eq!(reconcile(&ctx, &promise), Outcome::Changed);

    assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
    tree.assert_contents("local/c", "shared");
    tree.assert_same_inode("local/b", "local/c");
}
