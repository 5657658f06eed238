use std::{
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use tantivy::{IndexReader, Searcher};
use tracing::debug;

use crate::error::Result;

/// Called with the new generation when a refresh is about to change the
/// visible content. Runs under the refresh lock, before the new snapshot is
/// published.
pub type RefreshListener = Box<dyn Fn(u64) + Send + Sync>;

/// Immutable point-in-time view of the index.
#[derive(Debug)]
pub struct Snapshot {
    searcher: Searcher,
    generation: u64,
    /// Writer commit sequence this snapshot reflects.
    commit: u64,
    refs: AtomicUsize,
}

impl Snapshot {
    pub fn searcher(&self) -> &Searcher {
        &self.searcher
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Live [`SnapshotRef`]s on this snapshot.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn num_docs(&self) -> u64 {
        self.searcher.num_docs()
    }
}

/// A counted reference to a [`Snapshot`]. Dropping it releases the
/// reference.
#[derive(Debug)]
pub struct SnapshotRef {
    snapshot: Arc<Snapshot>,
    outstanding: Arc<AtomicUsize>,
}

impl Deref for SnapshotRef {
    type Target = Snapshot;

    fn deref(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl Drop for SnapshotRef {
    fn drop(&mut self) {
        let prev = self.snapshot.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "snapshot released more often than acquired");
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Hands out snapshots of the index and swaps in a new one whenever the
/// writer has committed past what the current snapshot shows.
pub struct ReaderManager {
    reader: IndexReader,
    watermark: Arc<AtomicU64>,
    current: RwLock<Arc<Snapshot>>,
    refresh_lock: Mutex<()>,
    outstanding: Arc<AtomicUsize>,
    on_refresh: RefreshListener,
}

impl ReaderManager {
    /// `watermark` is the sequence number of the writer's last commit.
    pub fn new(
        reader: IndexReader,
        watermark: Arc<AtomicU64>,
        on_refresh: RefreshListener,
    ) -> Result<Self> {
        let commit = watermark.load(Ordering::Acquire);
        reader.reload()?;
        let snapshot = Arc::new(Snapshot {
            searcher: reader.searcher(),
            generation: 0,
            commit,
            refs: AtomicUsize::new(0),
        });
        Ok(Self {
            reader,
            watermark,
            current: RwLock::new(snapshot),
            refresh_lock: Mutex::new(()),
            outstanding: Arc::new(AtomicUsize::new(0)),
            on_refresh,
        })
    }

    /// Reference the current snapshot. Never blocks on a refresh in
    /// progress.
    pub fn acquire(&self) -> SnapshotRef {
        let snapshot = self.current.read().clone();
        snapshot.refs.fetch_add(1, Ordering::AcqRel);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        SnapshotRef {
            snapshot,
            outstanding: self.outstanding.clone(),
        }
    }

    pub fn release(&self, snapshot: SnapshotRef) {
        drop(snapshot);
    }

    fn is_stale(&self) -> bool {
        self.watermark.load(Ordering::Acquire) > self.current.read().commit
    }

    /// Make every commit that finished before this call visible, waiting
    /// for a refresh already in progress. Returns whether content changed.
    pub fn refresh_blocking(&self) -> Result<bool> {
        if !self.is_stale() {
            return Ok(false);
        }
        let _guard = self.refresh_lock.lock();
        self.refresh_locked()
    }

    /// Like [`ReaderManager::refresh_blocking`], but gives up at once when
    /// another refresh is running.
    pub fn refresh_nonblocking(&self) -> Result<bool> {
        let Some(_guard) = self.refresh_lock.try_lock() else {
            return Ok(false);
        };
        self.refresh_locked()
    }

    fn refresh_locked(&self) -> Result<bool> {
        let target = self.watermark.load(Ordering::Acquire);
        let generation = {
            let current = self.current.read();
            if target <= current.commit {
                return Ok(false);
            }
            current.generation + 1
        };

        self.reader.reload()?;
        let snapshot = Arc::new(Snapshot {
            searcher: self.reader.searcher(),
            generation,
            commit: target,
            refs: AtomicUsize::new(0),
        });
        (self.on_refresh)(generation);
        *self.current.write() = snapshot;

        debug!(generation, commit = target, "Refreshed shard reader");
        Ok(true)
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    /// Number of live snapshot references across all generations.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ReaderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderManager")
            .field("generation", &self.generation())
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex as StdMutex, OnceLock, Weak};

    use tantivy::{
        Index,
        IndexWriter,
        ReloadPolicy,
        TantivyDocument,
        schema::{STRING, Schema},
    };

    use super::*;

    struct Fixture {
        writer: IndexWriter,
        field: tantivy::schema::Field,
        watermark: Arc<AtomicU64>,
        manager: ReaderManager,
        events: Arc<StdMutex<Vec<u64>>>,
    }

    fn fixture() -> Fixture {
        let mut builder = Schema::builder();
        let field = builder.add_text_field("id", STRING);
        let index = Index::create_in_ram(builder.build());
        let writer = index.writer(15_000_000).unwrap();
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .unwrap();
        let watermark = Arc::new(AtomicU64::new(0));
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        let manager = ReaderManager::new(
            reader,
            watermark.clone(),
            Box::new(move |generation| sink.lock().unwrap().push(generation)),
        )
        .unwrap();
        Fixture {
            writer,
            field,
            watermark,
            manager,
            events,
        }
    }

    fn add_and_commit(f: &mut Fixture, id: &str) {
        let mut doc = TantivyDocument::default();
        doc.add_text(f.field, id);
        f.writer.add_document(doc).unwrap();
        f.writer.commit().unwrap();
        f.watermark.fetch_add(1, Ordering::AcqRel);
    }

    #[test]
    fn refresh_without_commit_changes_nothing() {
        let f = fixture();
        assert!(!f.manager.refresh_blocking().unwrap());
        assert!(!f.manager.refresh_nonblocking().unwrap());
        assert_eq!(f.manager.generation(), 0);
        assert!(f.events.lock().unwrap().is_empty());
    }

    #[test]
    fn refresh_after_commit_swaps_and_notifies() {
        let mut f = fixture();
        add_and_commit(&mut f, "a");

        assert!(f.manager.refresh_blocking().unwrap());
        assert_eq!(f.manager.generation(), 1);
        assert_eq!(*f.events.lock().unwrap(), vec![1]);
        assert_eq!(f.manager.acquire().num_docs(), 1);

        assert!(!f.manager.refresh_blocking().unwrap());
        assert_eq!(*f.events.lock().unwrap(), vec![1]);
    }

    #[test]
    fn held_snapshot_is_isolated() {
        let mut f = fixture();
        let before = f.manager.acquire();
        add_and_commit(&mut f, "a");
        f.manager.refresh_blocking().unwrap();

        let after = f.manager.acquire();
        assert_eq!(before.num_docs(), 0);
        assert_eq!(after.num_docs(), 1);
        assert_eq!(before.generation(), 0);
        assert_eq!(after.generation(), 1);
    }

    #[test]
    fn references_are_counted() {
        let f = fixture();
        let a = f.manager.acquire();
        let b = f.manager.acquire();
        assert_eq!(a.ref_count(), 2);
        assert_eq!(f.manager.outstanding(), 2);

        f.manager.release(a);
        assert_eq!(b.ref_count(), 1);
        drop(b);
        assert_eq!(f.manager.outstanding(), 0);
    }

    #[test]
    fn nonblocking_gives_up_while_refresh_lock_held() {
        let mut f = fixture();
        add_and_commit(&mut f, "a");
        let guard = f.manager.refresh_lock.lock();
        assert!(!f.manager.refresh_nonblocking().unwrap());
        drop(guard);
        assert!(f.manager.refresh_nonblocking().unwrap());
    }

    #[test]
    fn listener_runs_before_snapshot_is_published() {
        let mut f = fixture();
        let mut builder = Schema::builder();
        builder.add_text_field("id", STRING);
        let index = Index::create_in_ram(builder.build());
        let mut writer: IndexWriter = index.writer(15_000_000).unwrap();
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .unwrap();

        let slot: Arc<OnceLock<Weak<ReaderManager>>> =
            Arc::new(OnceLock::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let listener = {
            let slot = slot.clone();
            let seen = seen.clone();
            move |generation| {
                if let Some(manager) = slot.get().and_then(Weak::upgrade) {
                    let visible = manager.generation();
                    seen.lock().unwrap().push((generation, visible));
                }
            }
        };
        let watermark = f.watermark.clone();
        let manager = Arc::new(
            ReaderManager::new(reader, watermark, Box::new(listener)).unwrap(),
        );
        slot.set(Arc::downgrade(&manager)).unwrap();

        writer.add_document(TantivyDocument::default()).unwrap();
        writer.commit().unwrap();
        add_and_commit(&mut f, "a");

        assert!(manager.refresh_blocking().unwrap());
        assert_eq!(*seen.lock().unwrap(), vec![(1, 0)]);
        assert_eq!(manager.generation(), 1);
    }
}
