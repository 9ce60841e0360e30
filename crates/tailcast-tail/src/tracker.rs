use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::reader::{self, Growth};

/// Identifies one subscriber's interest in a path
pub type SubscriberId = u64;

#[derive(Debug, thiserror::Error)]
pub enum TailError {
    #[error("log file path is empty")]
    EmptyPath,

    #[error("failed to create file watcher: {0}")]
    Watch(#[from] notify::Error),

    #[error("failed to stat {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Tuning knobs for the tracker
#[derive(Clone, Debug)]
pub struct TailConfig {
    /// Delay between a change notification and the read it triggers.
    /// Notifications arriving inside the window share one read.
    pub debounce: Duration,
    /// Fallback stat poll for missed notifications and missing directories
    pub rescan_interval: Option<Duration>,
    /// Maximum bytes consumed per read
    pub max_read_bytes: usize,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            rescan_interval: Some(Duration::from_secs(5)),
            max_read_bytes: 1024 * 1024,
        }
    }
}

/// Lifecycle state of a watched path
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchPhase {
    /// The file does not exist; its directory is watched for creation
    AwaitingCreation,
    /// The file exists and is followed from the recorded offset
    Tailing,
}

/// A batch of lines appended to a watched file
#[derive(Clone, Debug)]
pub struct TailChunk {
    pub lines: Arc<[String]>,
}

/// Sending side of one subscription
struct Subscriber {
    tx: mpsc::UnboundedSender<TailChunk>,
    /// File offset at which this subscriber's stream begins
    from: u64,
}

/// Receiving side of one `begin_watch` registration.
///
/// Dropping the subscription withdraws its interest in the path.
pub struct TailSubscription {
    id: SubscriberId,
    path: PathBuf,
    receiver: mpsc::UnboundedReceiver<TailChunk>,
    tracker: Weak<Inner>,
}

impl TailSubscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Normalised path this subscription follows
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next chunk. Returns `None` once the watch is torn down.
    pub async fn recv(&mut self) -> Option<TailChunk> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TailChunk> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for TailSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.tracker.upgrade() {
            inner.remove_subscriber(&self.path, self.id);
        }
    }
}

/// Per-path state, one OS watch per entry
struct WatchEntry {
    generation: u64,
    phase: WatchPhase,
    offset: u64,
    watcher: RecommendedWatcher,
    /// Path currently registered with `watcher`
    armed: Option<PathBuf>,
    subscribers: HashMap<SubscriberId, Subscriber>,
    cancel: CancellationToken,
}

impl WatchEntry {
    /// Point the OS watch at the file or its directory, depending on phase
    fn arm(&mut self, path: &Path) {
        self.disarm();
        let target = match self.phase {
            WatchPhase::Tailing => path.to_path_buf(),
            WatchPhase::AwaitingCreation => parent_dir(path).to_path_buf(),
        };
        match self.watcher.watch(&target, RecursiveMode::NonRecursive) {
            Ok(()) => self.armed = Some(target),
            Err(e) => tracing::warn!(
                path = %path.display(),
                target = %target.display(),
                error = %e,
                "Tail: cannot install watch"
            ),
        }
    }

    fn disarm(&mut self) {
        if let Some(target) = self.armed.take() {
            if let Err(e) = self.watcher.unwatch(&target) {
                tracing::debug!(target = %target.display(), error = %e, "Tail: unwatch failed");
            }
        }
    }

    fn enter_tailing(&mut self, path: &Path, offset: u64) {
        self.phase = WatchPhase::Tailing;
        self.offset = offset;
        self.arm(path);
    }

    fn enter_awaiting(&mut self, path: &Path) {
        self.phase = WatchPhase::AwaitingCreation;
        self.offset = 0;
        self.rebase(0);
        self.arm(path);
    }

    /// Restart every subscriber's stream at `offset` or earlier
    fn rebase(&mut self, offset: u64) {
        for sub in self.subscribers.values_mut() {
            sub.from = sub.from.min(offset);
        }
    }

    /// Fan out `bytes` read at `start`, skipping what a subscriber joined after
    fn publish(&self, path: &Path, start: u64, bytes: &[u8]) {
        let end = start + bytes.len() as u64;
        let mut shared: Option<Arc<[String]>> = None;

        for (id, sub) in &self.subscribers {
            if sub.from >= end {
                continue;
            }
            let lines = if sub.from <= start {
                shared
                    .get_or_insert_with(|| Arc::from(reader::split_lines(bytes)))
                    .clone()
            } else {
                let skip = (sub.from - start) as usize;
                Arc::from(reader::split_lines(&bytes[skip..]))
            };
            if lines.is_empty() {
                continue;
            }
            tracing::trace!(path = %path.display(), subscriber = id, count = lines.len(), "Tail: new lines");
            if sub.tx.send(TailChunk { lines }).is_err() {
                tracing::debug!(path = %path.display(), subscriber = id, "Tail: receiver gone");
            }
        }
    }

    fn shutdown(mut self) {
        self.cancel.cancel();
        self.disarm();
        // Dropping `watcher` releases the OS handle.
    }
}

/// What the watch task should do after an event
enum EventOutcome {
    Ignore,
    Schedule,
    Gone,
}

/// What the watch task should do after a growth check
enum CheckOutcome {
    Idle,
    Again,
    Gone,
}

struct Inner {
    config: TailConfig,
    entries: Mutex<HashMap<PathBuf, WatchEntry>>,
    next_subscriber: AtomicU64,
    next_generation: AtomicU64,
}

impl Inner {
    fn remove_subscriber(&self, path: &Path, id: SubscriberId) -> bool {
        let removed = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(path) else {
                return false;
            };
            if entry.subscribers.remove(&id).is_none() {
                return false;
            }
            if entry.subscribers.is_empty() {
                entries.remove(path)
            } else {
                None
            }
        };

        if let Some(entry) = removed {
            entry.shutdown();
            tracing::debug!(path = %path.display(), "Tail: watch closed");
        }
        true
    }

    fn apply_event(&self, path: &Path, generation: u64, event: &Event) -> EventOutcome {
        let mut entries = self.entries.lock();
        let Some(entry) = entries
            .get_mut(path)
            .filter(|e| e.generation == generation)
        else {
            return EventOutcome::Gone;
        };

        match entry.phase {
            WatchPhase::AwaitingCreation => {
                let matches = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == path.file_name());
                if matches && path.exists() {
                    tracing::info!(path = %path.display(), "Tail: file created, tailing");
                    entry.enter_tailing(path, 0);
                    EventOutcome::Schedule
                } else {
                    EventOutcome::Ignore
                }
            }
            // Leftover directory events may name sibling files.
            WatchPhase::Tailing if !concerns(event, path) => EventOutcome::Ignore,
            WatchPhase::Tailing => match event.kind {
                EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                    if path.exists() {
                        tracing::info!(path = %path.display(), "Tail: file replaced, re-reading from start");
                        entry.rebase(0);
                        entry.enter_tailing(path, 0);
                        EventOutcome::Schedule
                    } else {
                        tracing::warn!(path = %path.display(), "Tail: file removed, waiting for it to reappear");
                        entry.enter_awaiting(path);
                        EventOutcome::Ignore
                    }
                }
                EventKind::Create(_)
                | EventKind::Modify(_)
                | EventKind::Access(AccessKind::Close(AccessMode::Write))
                | EventKind::Any => EventOutcome::Schedule,
                _ => EventOutcome::Ignore,
            },
        }
    }

    async fn check_growth(&self, path: &Path, generation: u64) -> CheckOutcome {
        let offset = {
            let entries = self.entries.lock();
            let Some(entry) = entries.get(path).filter(|e| e.generation == generation) else {
                return CheckOutcome::Gone;
            };
            if entry.phase != WatchPhase::Tailing {
                return CheckOutcome::Idle;
            }
            entry.offset
        };

        let max = self.config.max_read_bytes;
        let target = path.to_path_buf();
        let result =
            tokio::task::spawn_blocking(move || reader::check_growth(&target, offset, max)).await;

        let growth = match result {
            Ok(Ok(growth)) => growth,
            // Lost a race with deletion; the rename/remove event handles it.
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => return CheckOutcome::Idle,
            Ok(Err(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "Tail: read error");
                return CheckOutcome::Idle;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Tail: read task failed");
                return CheckOutcome::Idle;
            }
        };

        let mut entries = self.entries.lock();
        let Some(entry) = entries
            .get_mut(path)
            .filter(|e| e.generation == generation)
        else {
            return CheckOutcome::Gone;
        };
        if entry.phase != WatchPhase::Tailing || entry.offset != offset {
            // Reset while the read was in flight; look again from the new offset.
            return CheckOutcome::Again;
        }

        match growth {
            Growth::Truncated { size } => {
                tracing::info!(
                    path = %path.display(),
                    old_offset = offset,
                    new_size = size,
                    "Tail: file truncated, resetting offset to 0"
                );
                entry.offset = 0;
                entry.rebase(0);
                CheckOutcome::Idle
            }
            Growth::Unchanged => CheckOutcome::Idle,
            Growth::Appended {
                bytes,
                next_offset,
                remaining,
            } => {
                entry.offset = next_offset;
                entry.publish(path, offset, &bytes);
                if remaining {
                    CheckOutcome::Again
                } else {
                    CheckOutcome::Idle
                }
            }
        }
    }

    /// Fallback poll. Schedules a growth check when the size moved.
    fn rescan(&self, path: &Path, generation: u64) -> EventOutcome {
        let mut entries = self.entries.lock();
        let Some(entry) = entries
            .get_mut(path)
            .filter(|e| e.generation == generation)
        else {
            return EventOutcome::Gone;
        };

        match entry.phase {
            WatchPhase::AwaitingCreation => {
                if path.exists() {
                    tracing::info!(path = %path.display(), "Tail: file appeared, tailing");
                    entry.enter_tailing(path, 0);
                    EventOutcome::Schedule
                } else {
                    if entry.armed.is_none() && parent_dir(path).is_dir() {
                        entry.arm(path);
                    }
                    EventOutcome::Ignore
                }
            }
            WatchPhase::Tailing => match std::fs::metadata(path) {
                Ok(meta) => {
                    if entry.armed.is_none() {
                        entry.arm(path);
                    }
                    if meta.len() != entry.offset {
                        EventOutcome::Schedule
                    } else {
                        EventOutcome::Ignore
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::warn!(path = %path.display(), "Tail: file removed, waiting for it to reappear");
                    entry.enter_awaiting(path);
                    EventOutcome::Ignore
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Tail: stat error");
                    EventOutcome::Ignore
                }
            },
        }
    }
}

/// Follows growing files and fans new lines out to subscribers.
///
/// Holds exactly one OS watch per distinct path no matter how many
/// subscribers share it. The handle is cheap to clone; all clones share the
/// same registry.
#[derive(Clone)]
pub struct FileTailTracker {
    inner: Arc<Inner>,
}

impl FileTailTracker {
    pub fn new(config: TailConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                entries: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Start following `path`.
    ///
    /// An existing file is followed from its current end, so earlier content
    /// is never replayed. A missing file is waited for by watching its
    /// directory. Joining a path that is already watched shares the existing
    /// watch, but only receives bytes past the file's size at join time.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn begin_watch(&self, path: impl AsRef<Path>) -> Result<TailSubscription, TailError> {
        let path = normalize(path.as_ref())?;
        let (tx, receiver) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(&path) {
            let from = std::fs::metadata(&path)
                .map_or(0, |meta| meta.len())
                .max(entry.offset);
            entry.subscribers.insert(id, Subscriber { tx, from });
            tracing::debug!(
                path = %path.display(),
                subscribers = entry.subscribers.len(),
                "Tail: joined existing watch"
            );
            return Ok(self.subscription(id, path, receiver));
        }

        let initial_size = match std::fs::metadata(&path) {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(source) => return Err(TailError::Io { path, source }),
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = event_tx.send(res);
        })?;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let mut entry = WatchEntry {
            generation,
            phase: WatchPhase::AwaitingCreation,
            offset: 0,
            watcher,
            armed: None,
            subscribers: HashMap::from([(
                id,
                Subscriber {
                    tx,
                    from: initial_size.unwrap_or(0),
                },
            )]),
            cancel: cancel.clone(),
        };

        match initial_size {
            Some(size) => {
                tracing::info!(path = %path.display(), offset = size, "Tail: watching file");
                entry.enter_tailing(&path, size);
            }
            None => {
                let dir = parent_dir(&path);
                if dir.is_dir() {
                    tracing::warn!(path = %path.display(), "Tail: file does not exist yet, waiting for creation");
                    entry.enter_awaiting(&path);
                } else {
                    tracing::warn!(
                        path = %path.display(),
                        dir = %dir.display(),
                        "Tail: directory does not exist, nothing to watch"
                    );
                }
            }
        }

        entries.insert(path.clone(), entry);
        drop(entries);

        tokio::spawn(run_watch_task(
            Arc::downgrade(&self.inner),
            path.clone(),
            generation,
            event_rx,
            cancel,
            self.inner.config.clone(),
        ));

        Ok(self.subscription(id, path, receiver))
    }

    fn subscription(
        &self,
        id: SubscriberId,
        path: PathBuf,
        receiver: mpsc::UnboundedReceiver<TailChunk>,
    ) -> TailSubscription {
        TailSubscription {
            id,
            path,
            receiver,
            tracker: Arc::downgrade(&self.inner),
        }
    }

    /// Withdraw one subscriber's interest in `path`.
    ///
    /// The OS watch and offset are discarded once no subscriber remains.
    /// Returns false if the subscriber was not registered.
    pub fn stop_watch(&self, path: impl AsRef<Path>, subscriber: SubscriberId) -> bool {
        match normalize(path.as_ref()) {
            Ok(path) => self.inner.remove_subscriber(&path, subscriber),
            Err(_) => false,
        }
    }

    /// Close every watch and clear all state
    pub fn stop_all_watches(&self) {
        let drained: Vec<(PathBuf, WatchEntry)> = self.inner.entries.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            entry.shutdown();
        }
        tracing::info!(watches = count, "Tail: all watches stopped");
    }

    pub fn is_watching(&self, path: impl AsRef<Path>) -> bool {
        self.with_entry(path.as_ref(), |_| ()).is_some()
    }

    /// Last read offset of `path`
    pub fn offset(&self, path: impl AsRef<Path>) -> Option<u64> {
        self.with_entry(path.as_ref(), |e| e.offset)
    }

    pub fn phase(&self, path: impl AsRef<Path>) -> Option<WatchPhase> {
        self.with_entry(path.as_ref(), |e| e.phase)
    }

    pub fn subscriber_count(&self, path: impl AsRef<Path>) -> usize {
        self.with_entry(path.as_ref(), |e| e.subscribers.len())
            .unwrap_or(0)
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.inner.entries.lock().keys().cloned().collect()
    }

    fn with_entry<T>(&self, path: &Path, f: impl FnOnce(&WatchEntry) -> T) -> Option<T> {
        let path = normalize(path).ok()?;
        self.inner.entries.lock().get(&path).map(f)
    }
}

impl Default for FileTailTracker {
    fn default() -> Self {
        Self::new(TailConfig::default())
    }
}

/// Event loop for one watched path
async fn run_watch_task(
    inner: Weak<Inner>,
    path: PathBuf,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    cancel: CancellationToken,
    config: TailConfig,
) {
    let mut pending: Option<Instant> = None;
    let mut rescan = config.rescan_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval
    });

    loop {
        let deadline = pending.unwrap_or_else(Instant::now);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,

            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = inner.upgrade() else { break };
                match event {
                    Ok(event) => inner.apply_event(&path, generation, &event),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Tail: watch error");
                        EventOutcome::Ignore
                    }
                }
            }

            _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                pending = None;
                let Some(inner) = inner.upgrade() else { break };
                match inner.check_growth(&path, generation).await {
                    CheckOutcome::Idle => EventOutcome::Ignore,
                    CheckOutcome::Again => {
                        pending = Some(Instant::now());
                        EventOutcome::Ignore
                    }
                    CheckOutcome::Gone => EventOutcome::Gone,
                }
            }

            _ = tick(rescan.as_mut()) => {
                let Some(inner) = inner.upgrade() else { break };
                inner.rescan(&path, generation)
            }
        };

        match outcome {
            EventOutcome::Ignore => {}
            EventOutcome::Schedule => {
                pending.get_or_insert_with(|| Instant::now() + config.debounce);
            }
            EventOutcome::Gone => break,
        }
    }

    tracing::trace!(path = %path.display(), "Tail: watch task finished");
}

async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn normalize(path: &Path) -> Result<PathBuf, TailError> {
    if path.as_os_str().is_empty() {
        return Err(TailError::EmptyPath);
    }
    std::path::absolute(path).map_err(|source| TailError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Whether a notification is about `path` itself
fn concerns(event: &Event, path: &Path) -> bool {
    event.paths.is_empty()
        || event
            .paths
            .iter()
            .any(|p| p.file_name() == path.file_name())
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}
