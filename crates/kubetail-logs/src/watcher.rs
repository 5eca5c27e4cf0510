//! Change notifications for container log files.
//!
//! Log files are symlinks into the runtime's per-pod directories. Writes land
//! on the symlink target, so the watcher subscribes to every matching target
//! and translates target events back to the symlink's identity.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kubetail_types::{LogFileWatchEvent, WatchEventType};

use crate::error::{LogError, Result};
use crate::index::{LogFileIndex, namespace_allowed, parse_file_name};

const EVENT_BUFFER: usize = 1;

/// Closes a [`LogFileWatcher`] from another task
#[derive(Clone, Debug)]
pub struct CloseHandle {
    cancel: CancellationToken,
    closed: Arc<Mutex<bool>>,
}

impl CloseHandle {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// Stop the watcher. Safe to call more than once.
    pub fn close(&self) {
        let mut closed = self.closed.lock();
        if *closed {
            return;
        }
        *closed = true;
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

/// Stream of ADDED/MODIFIED/DELETED events for log files in a set of namespaces
pub struct LogFileWatcher {
    events: mpsc::Receiver<LogFileWatchEvent>,
    handle: CloseHandle,
}

impl LogFileWatcher {
    /// Start watching the index directory.
    ///
    /// Must be called from within a tokio runtime. An empty string in
    /// `namespaces` matches every namespace.
    pub fn new(index: &LogFileIndex, namespaces: &[String]) -> Result<Self> {
        if namespaces.is_empty() {
            return Err(LogError::NamespacesRequired);
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = raw_tx.send(res);
            },
            Config::default(),
        )?;
        watcher.watch(index.dir(), RecursiveMode::NonRecursive)?;

        let mut task = WatchTask {
            watcher,
            table: PathTable::default(),
            index: index.clone(),
            namespaces: namespaces.to_vec(),
        };
        task.register_existing()?;

        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let handle = CloseHandle::new();
        tokio::spawn(task.run(raw_rx, tx, handle.clone()));

        Ok(Self { events, handle })
    }

    /// Next event, or `None` once the watcher is closed or has failed
    pub async fn recv(&mut self) -> Option<LogFileWatchEvent> {
        self.events.recv().await
    }

    pub fn close(&self) {
        self.handle.close();
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.handle.clone()
    }
}

impl Drop for LogFileWatcher {
    fn drop(&mut self) {
        self.handle.close();
    }
}

/// Bidirectional map between symlink names and their resolved targets
#[derive(Default)]
struct PathTable {
    by_target: HashMap<PathBuf, OsString>,
    by_link: HashMap<OsString, PathBuf>,
}

impl PathTable {
    fn insert(&mut self, link: OsString, target: PathBuf) {
        self.by_target.insert(target.clone(), link.clone());
        self.by_link.insert(link, target);
    }

    fn contains_link(&self, link: &OsString) -> bool {
        self.by_link.contains_key(link)
    }

    fn link_for(&self, target: &Path) -> Option<&OsString> {
        self.by_target.get(target)
    }

    fn remove_target(&mut self, target: &Path) -> Option<OsString> {
        let link = self.by_target.remove(target)?;
        self.by_link.remove(&link);
        Some(link)
    }

    fn remove_link(&mut self, link: &OsString) -> Option<PathBuf> {
        let target = self.by_link.remove(link)?;
        self.by_target.remove(&target);
        Some(target)
    }
}

struct WatchTask {
    watcher: RecommendedWatcher,
    table: PathTable,
    index: LogFileIndex,
    namespaces: Vec<String>,
}

impl WatchTask {
    fn register_existing(&mut self) -> Result<()> {
        for entry in fs::read_dir(self.index.dir())? {
            let entry = entry?;
            self.register(&entry.path());
        }
        Ok(())
    }

    /// Watch the target of a matching symlink; returns false if it was skipped
    fn register(&mut self, link_path: &Path) -> bool {
        let Some(name) = link_path.file_name().map(|n| n.to_os_string()) else {
            return false;
        };
        if self.table.contains_link(&name) {
            return false;
        }

        let spec = match parse_file_name(self.index.node_name(), &name.to_string_lossy()) {
            Ok(spec) => spec,
            Err(e) => {
                debug!(path = %link_path.display(), error = %e, "Skipping log file");
                return false;
            }
        };
        if !namespace_allowed(&self.namespaces, &spec.namespace) {
            return false;
        }

        let target = match fs::canonicalize(link_path) {
            Ok(target) => target,
            Err(e) => {
                warn!(path = %link_path.display(), error = %e, "Failed to resolve log file");
                return false;
            }
        };
        if let Err(e) = self.watcher.watch(&target, RecursiveMode::NonRecursive) {
            warn!(path = %target.display(), error = %e, "Failed to watch log file");
            return false;
        }

        self.table.insert(name, target);
        true
    }

    fn unregister_target(&mut self, target: &Path) -> Option<OsString> {
        let link = self.table.remove_target(target)?;
        let _ = self.watcher.unwatch(target);
        Some(link)
    }

    fn unregister_link(&mut self, link_path: &Path) -> Option<OsString> {
        let name = link_path.file_name()?.to_os_string();
        let target = self.table.remove_link(&name)?;
        let _ = self.watcher.unwatch(&target);
        Some(name)
    }

    fn event_for(&self, event_type: WatchEventType, link: &OsString) -> Option<LogFileWatchEvent> {
        let path = self.index.dir().join(link);
        match self.index.metadata_for(&path) {
            Ok(metadata) => Some(LogFileWatchEvent::new(event_type, metadata)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Dropping event");
                None
            }
        }
    }

    fn translate(&mut self, event: Event) -> Vec<LogFileWatchEvent> {
        let mut out = Vec::new();

        for path in &event.paths {
            match event.kind {
                EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                    if self.register(path) {
                        let link = path.file_name().map(|n| n.to_os_string());
                        out.extend(link.and_then(|l| self.event_for(WatchEventType::Added, &l)));
                    }
                }
                EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                    let link = self.table.link_for(path).cloned();
                    out.extend(link.and_then(|l| self.event_for(WatchEventType::Modified, &l)));
                }
                EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                    let link = self
                        .unregister_target(path)
                        .or_else(|| self.unregister_link(path));
                    out.extend(link.and_then(|l| self.event_for(WatchEventType::Deleted, &l)));
                }
                _ => {}
            }
        }

        out
    }

    async fn run(
        mut self,
        mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
        tx: mpsc::Sender<LogFileWatchEvent>,
        handle: CloseHandle,
    ) {
        let cancel = handle.cancel.clone();

        'outer: loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => break,
                res = raw_rx.recv() => match res {
                    Some(res) => res,
                    None => break,
                },
            };

            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Log file watcher failed");
                    break;
                }
            };

            for out in self.translate(event) {
                tokio::select! {
                    _ = cancel.cancelled() => break 'outer,
                    sent = tx.send(out) => {
                        if sent.is_err() {
                            break 'outer;
                        }
                    }
                }
            }
        }

        handle.close();
        debug!(dir = %self.index.dir().display(), "Log file watcher stopped");
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::symlink;
    use std::time::Duration;

    use tokio::time::timeout;

    struct Fixture {
        _root: tempfile::TempDir,
        links: PathBuf,
        targets: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let links = root.path().join("containers");
            let targets = root.path().join("pods");
            fs::create_dir_all(&links).unwrap();
            fs::create_dir_all(&targets).unwrap();
            Self {
                _root: root,
                links,
                targets,
            }
        }

        fn index(&self) -> LogFileIndex {
            LogFileIndex::new(&self.links, "node-1")
        }

        fn add(&self, name: &str) -> PathBuf {
            let target = self.targets.join(name);
            fs::write(&target, b"").unwrap();
            symlink(&target, self.links.join(name)).unwrap();
            target
        }
    }

    fn ns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn next(watcher: &mut LogFileWatcher) -> LogFileWatchEvent {
        timeout(Duration::from_secs(5), watcher.recv())
            .await
            .expect("timed out waiting for event")
            .expect("watcher closed")
    }

    fn append(path: &Path, data: &[u8]) {
        let mut file = fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(data).unwrap();
        file.sync_all().unwrap();
    }

    #[tokio::test]
    async fn test_added_on_new_symlink() {
        let fx = Fixture::new();
        let mut watcher = LogFileWatcher::new(&fx.index(), &ns(&["ns1"])).unwrap();

        fx.add("pn1_ns1_cn-000.log");

        let event = next(&mut watcher).await;
        assert_eq!(event.event_type, WatchEventType::Added);
        assert_eq!(event.object.id, "000");
        assert_eq!(event.object.spec.pod_name, "pn1");
    }

    #[tokio::test]
    async fn test_modified_on_target_write() {
        let fx = Fixture::new();
        let target = fx.add("pn1_ns1_cn-000.log");
        let mut watcher = LogFileWatcher::new(&fx.index(), &ns(&["ns1"])).unwrap();

        append(&target, b"hello\n");

        let event = next(&mut watcher).await;
        assert_eq!(event.event_type, WatchEventType::Modified);
        assert_eq!(event.object.id, "000");
        assert_eq!(event.object.file_info.size, 6);
    }

    #[tokio::test]
    async fn test_namespace_filter() {
        let fx = Fixture::new();
        let mut watcher = LogFileWatcher::new(&fx.index(), &ns(&["ns1"])).unwrap();

        fx.add("pn2_ns2_cn-222.log");
        fx.add("pn1_ns1_cn-111.log");

        let event = next(&mut watcher).await;
        assert_eq!(event.event_type, WatchEventType::Added);
        assert_eq!(event.object.spec.namespace, "ns1");
        assert_eq!(event.object.id, "111");
    }

    #[tokio::test]
    async fn test_deleted_on_symlink_removal() {
        let fx = Fixture::new();
        fx.add("pn1_ns1_cn-000.log");
        let mut watcher = LogFileWatcher::new(&fx.index(), &ns(&[""])).unwrap();

        fs::remove_file(fx.links.join("pn1_ns1_cn-000.log")).unwrap();

        let event = next(&mut watcher).await;
        assert_eq!(event.event_type, WatchEventType::Deleted);
        assert_eq!(event.object.id, "000");
    }

    #[tokio::test]
    async fn test_deleted_then_recreated_is_added() {
        let fx = Fixture::new();
        let target = fx.add("pn1_ns1_cn-000.log");
        let mut watcher = LogFileWatcher::new(&fx.index(), &ns(&[""])).unwrap();

        fs::remove_file(fx.links.join("pn1_ns1_cn-000.log")).unwrap();
        assert_eq!(next(&mut watcher).await.event_type, WatchEventType::Deleted);

        symlink(&target, fx.links.join("pn1_ns1_cn-000.log")).unwrap();
        assert_eq!(next(&mut watcher).await.event_type, WatchEventType::Added);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let fx = Fixture::new();
        let mut watcher = LogFileWatcher::new(&fx.index(), &ns(&[""])).unwrap();
        let handle = watcher.close_handle();

        handle.close();
        watcher.close();
        handle.close();
        assert!(watcher.is_closed());

        let end = timeout(Duration::from_secs(5), watcher.recv()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_namespaces_required() {
        let fx = Fixture::new();
        let err = LogFileWatcher::new(&fx.index(), &[]).err().unwrap();
        assert!(matches!(err, LogError::NamespacesRequired));
    }
}
