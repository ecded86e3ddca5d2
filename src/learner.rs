//! Visit counting and domain promotion.
//!
//! Learner state is written to a [`UsageStore`] every few visits. Inside a
//! tokio runtime the writes happen on a background task, so tracking a visit
//! never blocks on the store. Every snapshot carries a sequence number and a
//! snapshot older than the last one written is dropped, so stored counts
//! never go backwards.

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

use crate::entry::normalize_domain;
use crate::error::PersistenceError;

/// Default visits after which a domain is promoted.
pub const DEFAULT_PROMOTION_THRESHOLD: u64 = 5;

/// Default number of increments of a domain between persists.
pub const DEFAULT_PERSIST_EVERY: u64 = 10;

/// Persisted learner state, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub visits: Vec<(String, u64)>,
    pub promoted: Vec<String>,
}

impl UsageSnapshot {
    /// Sum of all visit counts.
    pub fn total_visits(&self) -> u64 {
        self.visits.iter().map(|(_, n)| n).sum()
    }
}

/// Key-value store for learner state.
pub trait UsageStore: Send + Sync {
    /// Stored snapshot, if any.
    fn load(&self) -> Result<Option<UsageSnapshot>, PersistenceError>;

    fn save(&self, snapshot: &UsageSnapshot) -> Result<(), PersistenceError>;

    /// Drop stored state.
    fn clear(&self) -> Result<(), PersistenceError>;
}

/// Stores learner state as a JSON file, replaced atomically on save.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UsageStore for JsonFileStore {
    fn load(&self) -> Result<Option<UsageSnapshot>, PersistenceError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save(&self, snapshot: &UsageSnapshot) -> Result<(), PersistenceError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let content = serde_json::to_vec(snapshot)?;

        // Unique temp file in the same directory, then atomic rename.
        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(&content)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Keeps learner state in memory. Counts saves.
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<UsageSnapshot>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves.
    pub fn saves(&self) -> usize {
        *self.saves.lock()
    }

    pub fn snapshot(&self) -> Option<UsageSnapshot> {
        self.snapshot.lock().clone()
    }
}

impl UsageStore for MemoryStore {
    fn load(&self) -> Result<Option<UsageSnapshot>, PersistenceError> {
        Ok(self.snapshot.lock().clone())
    }

    fn save(&self, snapshot: &UsageSnapshot) -> Result<(), PersistenceError> {
        *self.snapshot.lock() = Some(snapshot.clone());
        *self.saves.lock() += 1;
        Ok(())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        *self.snapshot.lock() = None;
        Ok(())
    }
}

#[derive(Default)]
struct LearnerState {
    counts: AHashMap<String, u64>,
    /// Domains in first-seen order
    order: Vec<String>,
    promoted: AHashSet<String>,
    promoted_order: Vec<String>,
}

impl LearnerState {
    fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            visits: self
                .order
                .iter()
                .map(|d| (d.clone(), self.counts.get(d).copied().unwrap_or(0)))
                .collect(),
            promoted: self.promoted_order.clone(),
        }
    }

    fn restore(snapshot: UsageSnapshot) -> Self {
        let mut state = Self::default();
        for (domain, count) in snapshot.visits {
            if state.counts.insert(domain.clone(), count).is_none() {
                state.order.push(domain);
            }
        }
        for domain in snapshot.promoted {
            if state.promoted.insert(domain.clone()) {
                state.promoted_order.push(domain);
            }
        }
        state
    }
}

/// A snapshot tagged with the order it was taken in.
type Checkpoint = (u64, UsageSnapshot);

/// Serializes store access and drops snapshots older than the last write.
struct Persister {
    store: Arc<dyn UsageStore>,
    /// Sequence number of the last snapshot written or cleared
    last: Mutex<u64>,
}

impl Persister {
    fn save(&self, seq: u64, snapshot: &UsageSnapshot) {
        let mut last = self.last.lock();
        if seq <= *last {
            log::debug!("Skipping stale usage snapshot {} (last {})", seq, *last);
            return;
        }
        match self.store.save(snapshot) {
            Ok(()) => *last = seq,
            Err(e) => log::warn!("Failed to persist usage state: {}", e),
        }
    }

    fn clear(&self, seq: u64) {
        let mut last = self.last.lock();
        if seq < *last {
            return;
        }
        *last = seq;
        if let Err(e) = self.store.clear() {
            log::warn!("Failed to clear usage state: {}", e);
        }
    }
}

/// Background writer: keeps only the newest pending snapshot and saves it
/// on the blocking pool.
async fn write_loop(persister: Arc<Persister>, mut receiver: mpsc::UnboundedReceiver<Checkpoint>) {
    while let Some(mut latest) = receiver.recv().await {
        while let Ok(newer) = receiver.try_recv() {
            if newer.0 > latest.0 {
                latest = newer;
            }
        }

        let persister = Arc::clone(&persister);
        let (seq, snapshot) = latest;
        if let Err(e) = tokio::task::spawn_blocking(move || persister.save(seq, &snapshot)).await {
            log::warn!("Usage writer failed: {}", e);
        }
    }
    log::debug!("Usage writer stopped");
}

/// How snapshots reach the store.
enum Writer {
    /// Saved on the calling thread
    Inline,
    /// Queued to a background task
    Background(mpsc::UnboundedSender<Checkpoint>),
}

/// Counts visits per domain and promotes frequently visited ones.
///
/// Promotion is one-way: a promoted domain stays promoted until [`reset`].
///
/// [`reset`]: UsageLearner::reset
pub struct UsageLearner {
    state: Mutex<LearnerState>,
    threshold: u64,
    persist_every: u64,
    /// Last snapshot sequence number handed out
    seq: AtomicU64,
    persister: Option<Arc<Persister>>,
    writer: Writer,
}

impl Default for UsageLearner {
    fn default() -> Self {
        Self::new(DEFAULT_PROMOTION_THRESHOLD, DEFAULT_PERSIST_EVERY)
    }
}

impl UsageLearner {
    /// Create an in-memory learner.
    pub fn new(threshold: u64, persist_every: u64) -> Self {
        Self {
            state: Mutex::new(LearnerState::default()),
            threshold: threshold.max(1),
            persist_every: persist_every.max(1),
            seq: AtomicU64::new(0),
            persister: None,
            writer: Writer::Inline,
        }
    }

    /// Attach a store, restoring any state it holds.
    ///
    /// A store that cannot be read leaves the learner empty. When called
    /// inside a tokio runtime, periodic saves run on a background task;
    /// otherwise they run on the thread that tracks the visit.
    pub fn with_store(mut self, store: Arc<dyn UsageStore>) -> Self {
        match store.load() {
            Ok(Some(snapshot)) => {
                let state = LearnerState::restore(snapshot);
                log::debug!(
                    "Restored usage for {} domains ({} promoted)",
                    state.order.len(),
                    state.promoted_order.len()
                );
                self.state = Mutex::new(state);
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to restore usage state: {}", e),
        }

        let persister = Arc::new(Persister {
            store,
            last: Mutex::new(0),
        });
        self.writer = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let (sender, receiver) = mpsc::unbounded_channel();
                handle.spawn(write_loop(Arc::clone(&persister), receiver));
                Writer::Background(sender)
            }
            Err(_) => Writer::Inline,
        };
        self.persister = Some(persister);
        self
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Record one visit.
    pub fn track_visit(&self, domain: &str) {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return;
        }

        let checkpoint = {
            let mut state = self.state.lock();
            let count = {
                let count = state.counts.entry(domain.clone()).or_insert(0);
                *count += 1;
                *count
            };
            if count == 1 {
                state.order.push(domain.clone());
            }

            if count >= self.threshold && state.promoted.insert(domain.clone()) {
                log::debug!("Promoted {} after {} visits", domain, count);
                state.promoted_order.push(domain);
            }

            if self.persister.is_some() && count % self.persist_every == 0 {
                Some(self.checkpoint(&state))
            } else {
                None
            }
        };

        if let Some(checkpoint) = checkpoint {
            self.dispatch(checkpoint);
        }
    }

    pub fn is_promoted(&self, domain: &str) -> bool {
        self.state.lock().promoted.contains(&normalize_domain(domain))
    }

    /// Visit count, 0 if unseen.
    pub fn visit_count(&self, domain: &str) -> u64 {
        self.state
            .lock()
            .counts
            .get(&normalize_domain(domain))
            .copied()
            .unwrap_or(0)
    }

    /// Promoted domains in promotion order.
    pub fn promoted(&self) -> Vec<String> {
        self.state.lock().promoted_order.clone()
    }

    /// Most visited domains, ties in first-seen order.
    pub fn top_domains(&self, limit: usize) -> Vec<(String, u64)> {
        let state = self.state.lock();
        let mut ranked: Vec<(String, u64)> = state
            .order
            .iter()
            .map(|d| (d.clone(), state.counts.get(d).copied().unwrap_or(0)))
            .collect();
        // Stable sort keeps first-seen order among equal counts.
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(limit);
        ranked
    }

    /// Write the current state to the store now, on the calling thread.
    pub fn flush(&self) {
        let persister = match &self.persister {
            Some(persister) => persister,
            None => return,
        };
        let (seq, snapshot) = self.checkpoint(&self.state.lock());
        persister.save(seq, &snapshot);
    }

    /// Forget all counts and promotions, including stored state.
    pub fn reset(&self) {
        let seq = {
            let mut state = self.state.lock();
            *state = LearnerState::default();
            self.seq.fetch_add(1, Ordering::SeqCst) + 1
        };
        if let Some(persister) = &self.persister {
            persister.clear(seq);
        }
    }

    /// Snapshot the state. Must be called with the state lock held so
    /// sequence numbers follow snapshot order.
    fn checkpoint(&self, state: &LearnerState) -> Checkpoint {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        (seq, state.snapshot())
    }

    fn dispatch(&self, (seq, snapshot): Checkpoint) {
        match &self.writer {
            Writer::Background(sender) => {
                if let Err(mpsc::error::SendError((seq, snapshot))) = sender.send((seq, snapshot)) {
                    log::debug!("Usage writer gone; saving inline");
                    if let Some(persister) = &self.persister {
                        persister.save(seq, &snapshot);
                    }
                }
            }
            Writer::Inline => {
                if let Some(persister) = &self.persister {
                    persister.save(seq, &snapshot);
                }
            }
        }
    }
}
