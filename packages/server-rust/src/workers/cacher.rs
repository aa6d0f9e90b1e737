//! Asynchronous cache-request queue and its drainer.
//!
//! [`CacheQueue`] is a persistent FIFO of restore requests, stored as
//! line-delimited text (`AIPID\tRECACHE\tVERSION?`) so a crash loses no
//! pending work. [`CacherWorker`] drains it through the [`Placement`]
//! capability: dataset entries go to `cache_dataset`, file entries to
//! `cache`, and an error on one item never stops the rest.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use pdrcache_core::{AipId, IdError};

use crate::manager::Placement;

/// Errors raised by the cache queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Id(#[from] IdError),
}

/// One pending cache request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// `dsid` for a whole dataset, `dsid/filepath` for one file.
    pub id: String,
    /// Whether to restore even when already cached.
    pub recache: bool,
    /// Pinned version, when the request named one.
    pub version: Option<String>,
}

impl QueueEntry {
    /// Whether this entry asks for a whole dataset.
    #[must_use]
    pub fn is_dataset(&self) -> bool {
        !self.id.contains('/')
    }

    /// The full AIP id this entry stands for.
    #[must_use]
    pub fn full_id(&self) -> String {
        match &self.version {
            Some(version) => format!("{}#{version}", self.id),
            None => self.id.clone(),
        }
    }

    fn to_line(&self) -> String {
        let recache = u8::from(self.recache);
        match &self.version {
            Some(version) => format!("{}\t{recache}\t{version}", self.id),
            None => format!("{}\t{recache}", self.id),
        }
    }

    fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.split('\t');
        let id = fields.next()?.to_string();
        if id.is_empty() {
            return None;
        }
        let recache = match fields.next()? {
            "0" => false,
            "1" => true,
            _ => return None,
        };
        let version = fields.next().filter(|v| !v.is_empty()).map(str::to_string);
        Some(Self {
            id,
            recache,
            version,
        })
    }
}

/// Persistent FIFO of cache requests.
///
/// Appends are written to the file before `queue` returns; pops rewrite
/// the file atomically (temp + rename). All file access happens under one
/// intra-process lock.
pub struct CacheQueue {
    path: PathBuf,
    entries: Mutex<VecDeque<QueueEntry>>,
}

impl CacheQueue {
    /// Opens the queue at `path`, reloading any pending entries.
    ///
    /// Unparseable lines (e.g. a torn final append) are skipped with a
    /// warning.
    ///
    /// # Errors
    ///
    /// Fails when an existing queue file cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        let mut entries = VecDeque::new();
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                for line in text.lines().filter(|l| !l.is_empty()) {
                    match QueueEntry::parse_line(line) {
                        Some(entry) => entries.push_back(entry),
                        None => warn!(line, "skipping unparseable queue line"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Appends a request; persisted before this returns.
    ///
    /// # Errors
    ///
    /// Fails when the id does not parse or the append cannot be written.
    pub fn queue(&self, aipid: &str, recache: bool) -> Result<(), QueueError> {
        let parsed = AipId::parse(aipid)?;
        let id = match &parsed.filepath {
            Some(filepath) => format!("{}/{filepath}", parsed.dsid),
            None => parsed.dsid.clone(),
        };
        let entry = QueueEntry {
            id,
            recache,
            version: parsed.version,
        };

        let mut entries = self.entries.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", entry.to_line())?;
        entries.push_back(entry);
        Ok(())
    }

    /// Removes and returns the oldest request, rewriting the file.
    ///
    /// # Errors
    ///
    /// Fails when the shrunken queue cannot be persisted; the entry is
    /// not popped in that case.
    pub fn pop(&self) -> Result<Option<QueueEntry>, QueueError> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.pop_front() else {
            return Ok(None);
        };
        if let Err(e) = Self::save(&self.path, &entries) {
            entries.push_front(entry);
            return Err(e.into());
        }
        Ok(Some(entry))
    }

    /// Snapshot of the pending entries, oldest first.
    #[must_use]
    pub fn load(&self) -> Vec<QueueEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Whether any request is pending.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.entries.lock().is_empty()
    }

    /// Whether a request for this AIP id is pending.
    ///
    /// # Errors
    ///
    /// Fails when the id does not parse.
    pub fn is_queued(&self, aipid: &str) -> Result<bool, QueueError> {
        let canonical = AipId::parse(aipid)?.to_string();
        Ok(self
            .entries
            .lock()
            .iter()
            .any(|e| e.full_id() == canonical))
    }

    fn save(path: &Path, entries: &VecDeque<QueueEntry>) -> std::io::Result<()> {
        let mut text = String::new();
        for entry in entries {
            text.push_str(&entry.to_line());
            text.push('\n');
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)
    }
}

/// Drains the [`CacheQueue`] through a [`Placement`].
///
/// At most one drain task runs at a time; `start()` while running is a
/// no-op, and a fresh `start()` after exit spawns a new task. A popped
/// entry that fails is logged and dropped, not retried.
pub struct CacherWorker {
    queue: Arc<CacheQueue>,
    placement: Arc<dyn Placement>,
    interrupt: watch::Sender<bool>,
    running: Arc<AtomicBool>,
}

impl CacherWorker {
    #[must_use]
    pub fn new(queue: Arc<CacheQueue>, placement: Arc<dyn Placement>) -> Self {
        let (interrupt, _) = watch::channel(false);
        Self {
            queue,
            placement,
            interrupt,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a drain task is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests a stop at the next item boundary.
    pub fn interrupt(&self) {
        let _ = self.interrupt.send(true);
    }

    /// Spawns the drain task, unless one is already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        let _ = self.interrupt.send(false);

        let queue = self.queue.clone();
        let placement = self.placement.clone();
        let running = self.running.clone();
        let interrupt = self.interrupt.subscribe();

        Some(tokio::spawn(async move {
            Self::drain(queue, placement, interrupt).await;
            running.store(false, Ordering::SeqCst);
        }))
    }

    async fn drain(
        queue: Arc<CacheQueue>,
        placement: Arc<dyn Placement>,
        interrupt: watch::Receiver<bool>,
    ) {
        let mut processed: u64 = 0;
        loop {
            if *interrupt.borrow() {
                info!(processed, "cacher interrupted");
                return;
            }
            let entry = match queue.pop() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "cacher cannot read its queue; exiting");
                    return;
                }
            };

            let outcome = if entry.is_dataset() {
                placement
                    .cache_dataset(&entry.id, entry.version.as_deref(), entry.recache, 0, None)
                    .await
                    .map(|_| ())
            } else {
                placement
                    .cache(&entry.full_id(), entry.recache, 0)
                    .await
                    .map(|_| ())
            };
            match outcome {
                Ok(()) => processed += 1,
                Err(e) => {
                    error!(id = entry.full_id(), error = %e, "cache request failed; continuing");
                }
            }
        }
        info!(processed, "cacher queue drained");
    }
}
