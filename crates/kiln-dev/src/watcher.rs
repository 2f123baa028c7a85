//! Polling file watcher with ignore rules and per-path debouncing.
//!
//! Every tick the whole tree is walked into a fresh snapshot of
//! `path -> (mtime, size)` and diffed against the previous one. Ignored
//! directories are pruned from the walk, so nothing below `.git` or
//! `node_modules` is ever stat'ed.
//!
//! Changes are handed to the registered handler from a dedicated dispatcher
//! task, so a slow handler never delays the next scan. Delivery order per path
//! follows the order changes were observed.

use crate::error::{DevError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Interval between two scans.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Minimum gap between two notifications for the same path.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Patterns ignored by every watcher.
///
/// VCS metadata, kiln's own state directory, dependency directories, OS
/// metadata files, editor swap files and `~` backups.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".kiln",
    "node_modules",
    "vendor",
    ".DS_Store",
    "Thumbs.db",
    "*.swp",
    "*.swo",
    "*.swx",
    "*.tmp",
    "*~",
    "4913",
];

/// File change event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    /// File was created
    Created(PathBuf),
    /// File contents or size changed
    Modified(PathBuf),
    /// File was removed
    Removed(PathBuf),
}

impl FileChange {
    /// Get the path affected by this change.
    pub fn path(&self) -> &Path {
        match self {
            FileChange::Modified(p) | FileChange::Created(p) | FileChange::Removed(p) => p,
        }
    }
}

/// Callback invoked once per accepted change.
pub type ChangeHandler = Arc<dyn Fn(FileChange) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    /// Whole path component, e.g. `.git`
    Exact(String),
    /// `*.ext` style
    Suffix(String),
    /// `.#*` style
    Prefix(String),
    /// Multi-segment pattern such as `web/dist`, matched as consecutive components
    Segments(Vec<String>),
}

impl Pattern {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().trim_matches('/');
        if raw.is_empty() || raw == "*" {
            return None;
        }

        if raw.contains('/') {
            let segments: Vec<String> = raw
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            return Some(Pattern::Segments(segments));
        }

        if let Some(suffix) = raw.strip_prefix('*') {
            Some(Pattern::Suffix(suffix.to_string()))
        } else if let Some(prefix) = raw.strip_suffix('*') {
            Some(Pattern::Prefix(prefix.to_string()))
        } else {
            Some(Pattern::Exact(raw.to_string()))
        }
    }

    fn matches_name(&self, name: &str) -> bool {
        match self {
            Pattern::Exact(exact) => name == exact,
            Pattern::Suffix(suffix) => name.ends_with(suffix.as_str()),
            Pattern::Prefix(prefix) => name.starts_with(prefix.as_str()),
            Pattern::Segments(_) => false,
        }
    }
}

/// Set of ignore patterns.
///
/// Supported forms:
/// - exact names (`.git`, `.DS_Store`), matched against every path component
/// - `*.ext` suffixes and `name*` prefixes, also per component
/// - `a/b` segment sequences, matched anywhere in the relative path
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    patterns: Vec<Pattern>,
}

impl IgnoreRules {
    /// Rules built from `patterns`. Blank patterns are skipped.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Self::default();
        for pattern in patterns {
            rules.add(pattern.as_ref());
        }
        rules
    }

    /// Rules holding [`DEFAULT_IGNORE_PATTERNS`].
    pub fn defaults() -> Self {
        Self::new(DEFAULT_IGNORE_PATTERNS)
    }

    /// Add a pattern. Duplicates are ignored.
    pub fn add(&mut self, pattern: &str) {
        if let Some(parsed) = Pattern::parse(pattern) {
            if !self.patterns.contains(&parsed) {
                self.patterns.push(parsed);
            }
        }
    }

    /// Number of distinct patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether no pattern is configured.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `rel_path` (relative to the watched root) is ignored.
    pub fn is_ignored(&self, rel_path: &Path) -> bool {
        let names: Vec<&str> = rel_path
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => name.to_str(),
                _ => None,
            })
            .collect();

        self.patterns.iter().any(|pattern| match pattern {
            Pattern::Segments(segments) => names
                .windows(segments.len())
                .any(|window| window.iter().zip(segments).all(|(a, b)| *a == b)),
            _ => names.iter().any(|name| pattern.matches_name(name)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    size: u64,
}

/// Full view of the tree at one tick.
#[derive(Debug, Default)]
struct Snapshot {
    files: HashMap<PathBuf, FileStamp>,
}

impl Snapshot {
    /// Walk `root`. Returns `None` when the root itself cannot be read.
    fn scan(root: &Path, ignore: &IgnoreRules) -> Option<Self> {
        if let Err(e) = std::fs::metadata(root) {
            tracing::debug!(root = %root.display(), error = %e, "watch root unreadable");
            return None;
        }

        let mut files = HashMap::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || entry
                        .path()
                        .strip_prefix(root)
                        .map(|rel| !ignore.is_ignored(rel))
                        .unwrap_or(false)
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                continue;
            }

            let Ok(metadata) = entry.metadata() else {
                continue;
            };

            files.insert(
                entry.into_path(),
                FileStamp {
                    modified: metadata.modified().ok(),
                    size: metadata.len(),
                },
            );
        }

        Some(Self { files })
    }

    /// Changes going from `self` to `next`. Order is by path.
    fn diff(&self, next: &Snapshot) -> Vec<FileChange> {
        let mut changes = Vec::new();

        for (path, stamp) in &next.files {
            match self.files.get(path) {
                None => changes.push(FileChange::Created(path.clone())),
                Some(previous) if previous != stamp => {
                    changes.push(FileChange::Modified(path.clone()))
                }
                Some(_) => {}
            }
        }

        for path in self.files.keys() {
            if !next.files.contains_key(path) {
                changes.push(FileChange::Removed(path.clone()));
            }
        }

        changes.sort_by(|a, b| a.path().cmp(b.path()));
        changes
    }
}

/// Last accepted notification time per path.
///
/// The timestamp only moves when a notification is delivered, which makes the
/// window a minimum gap between notifications rather than a batching window.
#[derive(Debug, Default)]
struct DebounceRecord {
    accepted: HashMap<PathBuf, Instant>,
}

impl DebounceRecord {
    fn accept(&mut self, path: &Path, now: Instant, window: Duration) -> bool {
        if let Some(last) = self.accepted.get(path) {
            if now < *last + window {
                return false;
            }
        }
        self.accepted.insert(path.to_path_buf(), now);
        true
    }

    fn forget(&mut self, path: &Path) {
        self.accepted.remove(path);
    }

    /// Drop records that can no longer suppress anything.
    fn prune(&mut self, now: Instant, window: Duration) {
        self.accepted.retain(|_, last| now < *last + window);
    }
}

/// Settings that may change while the watcher runs.
struct WatchShared {
    ignore: RwLock<IgnoreRules>,
    debounce: RwLock<Duration>,
}

struct WatchTask {
    token: CancellationToken,
}

/// Polling file watcher.
///
/// `start` and `stop` are idempotent. Must be started from within a Tokio
/// runtime.
pub struct FileWatcher {
    root: PathBuf,
    poll_interval: Duration,
    shared: Arc<WatchShared>,
    handler: ChangeHandler,
    running: Mutex<Option<WatchTask>>,
}

impl FileWatcher {
    /// Create a watcher for `root` with the default ignore rules.
    pub fn new(root: impl Into<PathBuf>, poll_interval: Duration, handler: ChangeHandler) -> Self {
        Self {
            root: root.into(),
            poll_interval,
            shared: Arc::new(WatchShared {
                ignore: RwLock::new(IgnoreRules::defaults()),
                debounce: RwLock::new(DEFAULT_DEBOUNCE),
            }),
            handler,
            running: Mutex::new(None),
        }
    }

    /// Convenience constructor taking a plain closure.
    pub fn with_handler<F>(root: impl Into<PathBuf>, poll_interval: Duration, handler: F) -> Self
    where
        F: Fn(FileChange) + Send + Sync + 'static,
    {
        Self::new(root, poll_interval, Arc::new(handler))
    }

    /// Begin polling. A no-op when already running.
    ///
    /// The baseline snapshot is taken before this returns, so anything written
    /// afterwards is reported.
    ///
    /// # Errors
    ///
    /// Returns [`DevError::FileNotFound`] if the root does not exist.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let baseline = {
            let ignore = self.shared.ignore.read();
            Snapshot::scan(&self.root, &ignore)
        }
        .ok_or_else(|| DevError::FileNotFound(self.root.clone()))?;

        let token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(dispatch_loop(rx, self.handler.clone(), token.clone()));
        tokio::spawn(poll_loop(
            self.root.clone(),
            self.poll_interval,
            self.shared.clone(),
            baseline,
            tx,
            token.clone(),
        ));

        tracing::debug!(
            root = %self.root.display(),
            interval_ms = self.poll_interval.as_millis() as u64,
            "file watcher started"
        );
        *running = Some(WatchTask { token });
        Ok(())
    }

    /// Stop polling. A no-op when not running.
    pub fn stop(&self) {
        if let Some(task) = self.running.lock().take() {
            task.token.cancel();
            tracing::debug!(root = %self.root.display(), "file watcher stopped");
        }
    }

    /// Whether the poll loop is active.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Add an ignore pattern. Applies from the next scan.
    pub fn add_ignore_pattern(&self, pattern: &str) {
        self.shared.ignore.write().add(pattern);
    }

    /// Change the debounce window. Applies to subsequent notifications only.
    pub fn set_debounce(&self, window: Duration) {
        *self.shared.debounce.write() = window;
    }

    /// Current debounce window.
    pub fn debounce(&self) -> Duration {
        *self.shared.debounce.read()
    }

    /// Get the root directory being watched.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(
    root: PathBuf,
    interval: Duration,
    shared: Arc<WatchShared>,
    mut previous: Snapshot,
    tx: mpsc::UnboundedSender<FileChange>,
    token: CancellationToken,
) {
    let mut debounce = DebounceRecord::default();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let ignore = shared.ignore.read().clone();
        let scan_root = root.clone();
        let current = match tokio::task::spawn_blocking(move || Snapshot::scan(&scan_root, &ignore)).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "watch scan task failed");
                continue;
            }
        };

        let changes = previous.diff(&current);
        previous = current;

        let window = *shared.debounce.read();
        let now = Instant::now();
        for change in changes {
            // The path is gone from the snapshot, so a suppressed removal would never resurface.
            if let FileChange::Removed(path) = &change {
                debounce.forget(path);
            } else if !debounce.accept(change.path(), now, window) {
                tracing::trace!(path = %change.path().display(), "debounced");
                continue;
            }
            if tx.send(change).is_err() {
                return;
            }
        }
        debounce.prune(now, window);
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<FileChange>,
    handler: ChangeHandler,
    token: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = token.cancelled() => break,
            change = rx.recv() => match change {
                Some(change) => change,
                None => break,
            },
        };
        tracing::debug!(path = %change.path().display(), "file changed");
        handler(change);
    }
}
