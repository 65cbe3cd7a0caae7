//! Live record cache with broadcast of every new snapshot.

use std::{collections::BTreeMap, sync::RwLock};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    cache::{self, RecordCache},
    notification::ChangeNotification,
    record::{Record, RecordId},
};

/// Capacity of the snapshot broadcast channel. Slow subscribers skip ahead.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 256;

/// A snapshot tagged with the revision that produced it.
#[derive(Debug, Clone)]
pub struct CacheUpdate {
    pub revision: u64,
    pub snapshot: RecordCache,
}

struct Inner {
    current: RecordCache,
    revision: u64,
    /// Every change applied while a list fetch is outstanding, no-ops
    /// included. `journal[0]` has sequence number `journal_base`.
    journal: Vec<ChangeNotification>,
    journal_base: u64,
    /// Outstanding fetches and the journal sequence each started at.
    fetches: BTreeMap<u64, u64>,
    next_fetch: u64,
}

impl Inner {
    fn journal_end(&self) -> u64 {
        self.journal_base + self.journal.len() as u64
    }

    /// Drop journal entries no outstanding fetch still needs.
    fn trim_journal(&mut self) {
        let keep_from = self.fetches.values().min().copied().unwrap_or_else(|| self.journal_end());
        let drop = usize::try_from(keep_from - self.journal_base).unwrap_or(usize::MAX);
        self.journal.drain(..drop.min(self.journal.len()));
        self.journal_base = keep_from;
    }
}

/// Holder of the one live [`RecordCache`].
///
/// Writers are this client's own mutation results and the realtime patcher;
/// readers take snapshots or subscribe. A write that does not change the
/// snapshot is not broadcast.
pub struct CacheStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<CacheUpdate>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                current: RecordCache::new(),
                revision: 0,
                journal: Vec::new(),
                journal_base: 0,
                fetches: BTreeMap::new(),
                next_fetch: 0,
            }),
            sender,
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> RecordCache {
        self.read(|inner| inner.current.clone())
    }

    /// Revision of the current snapshot. Starts at zero and increases on
    /// every effective write.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.read(|inner| inner.revision)
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> T {
        match self.inner.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        match self.inner.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn publish(&self, guard: &mut Inner, f: impl FnOnce(&RecordCache) -> RecordCache) -> RecordCache {
        let next = f(&guard.current);
        if next == guard.current {
            return next;
        }
        guard.current = next.clone();
        guard.revision += 1;
        let _ = self.sender.send(CacheUpdate {
            revision: guard.revision,
            snapshot: next.clone(),
        });
        next
    }

    /// Apply one change, journaling it for any outstanding fetch.
    fn change(&self, change: ChangeNotification) -> RecordCache {
        self.write(|inner| {
            let next = self.publish(inner, |current| cache::apply(current, &change));
            if !inner.fetches.is_empty() {
                inner.journal.push(change);
            }
            next
        })
    }

    /// Start a list fetch that will replace the whole collection.
    ///
    /// Changes applied until the fetch completes are replayed on top of
    /// the fetched list, so a response that was taken before a change
    /// cannot undo it.
    #[must_use]
    pub fn begin_fetch(&self) -> PendingFetch<'_> {
        let id = self.write(|inner| {
            inner.next_fetch += 1;
            let id = inner.next_fetch;
            let start = inner.journal_end();
            inner.fetches.insert(id, start);
            id
        });
        PendingFetch { store: self, id }
    }

    /// Apply a realtime change notification.
    pub fn apply(&self, notification: &ChangeNotification) -> RecordCache {
        tracing::debug!(
            action = notification.action(),
            id = %notification.record_id(),
            "Applying change notification"
        );
        self.change(notification.clone())
    }

    /// Record the result of this client's own successful create.
    pub fn record_created(&self, record: Record) -> RecordCache {
        self.change(ChangeNotification::Created(record))
    }

    /// Record the result of this client's own successful update.
    pub fn record_updated(&self, record: Record) -> RecordCache {
        self.change(ChangeNotification::Updated(record))
    }

    /// Record the result of this client's own successful delete.
    pub fn record_deleted(&self, id: &RecordId) -> RecordCache {
        self.change(ChangeNotification::Deleted(id.clone()))
    }

    /// Get a receiver for live snapshot updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.sender.subscribe()
    }

    /// Stream that yields the current snapshot first, then every later one.
    ///
    /// Lagging subscribers skip the snapshots they missed; the next item is
    /// always a complete state, so nothing is lost but intermediate frames.
    #[must_use]
    pub fn snapshot_stream(&self) -> futures::stream::BoxStream<'static, CacheUpdate> {
        // Subscribe before reading so no write slips between the two.
        let rx = self.subscribe();
        let first = self.read(|inner| CacheUpdate {
            revision: inner.revision,
            snapshot: inner.current.clone(),
        });
        let floor = first.revision;

        let live = BroadcastStream::new(rx).filter_map(move |res| async move {
            match res {
                Ok(update) if update.revision > floor => Some(update),
                _ => None,
            }
        });

        futures::stream::iter([first]).chain(live).boxed()
    }
}

/// A list fetch in progress. Dropping it without [`PendingFetch::complete`]
/// leaves the cache as it is.
pub struct PendingFetch<'a> {
    store: &'a CacheStore,
    id: u64,
}

impl PendingFetch<'_> {
    /// Install the fetched list, replaying every change applied since the
    /// fetch began.
    pub fn complete(self, records: Vec<Record>) -> RecordCache {
        let store = self.store;
        let id = self.id;
        // Drop runs after this and finds the fetch already removed.
        store.write(|inner| {
            let Some(start) = inner.fetches.remove(&id) else {
                return inner.current.clone();
            };
            let skip = usize::try_from(start - inner.journal_base).unwrap_or(usize::MAX);
            let replay: Vec<ChangeNotification> =
                inner.journal.iter().skip(skip).cloned().collect();
            if !replay.is_empty() {
                tracing::debug!(count = replay.len(), "Replaying changes onto fetched list");
            }
            inner.trim_journal();

            let fresh = replay
                .iter()
                .fold(RecordCache::from_records(records), |acc, change| cache::apply(&acc, change));
            store.publish(inner, |_| fresh)
        })
    }
}

impl Drop for PendingFetch<'_> {
    fn drop(&mut self) {
        self.store.write(|inner| {
            if inner.fetches.remove(&self.id).is_some() {
                inner.trim_journal();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(id: i64) -> Record {
        Record::new(id).with_field("shape", "square")
    }

    #[test]
    fn test_replace_then_patch() {
        let store = CacheStore::new();
        store.begin_fetch().complete(vec![shape(1), shape(2)]);
        store.apply(&ChangeNotification::Deleted(RecordId::Int(1)));
        assert_eq!(store.snapshot().ids(), vec![RecordId::Int(2)]);
        assert_eq!(store.revision(), 2);
    }

    #[test]
    fn test_noop_write_does_not_bump_revision() {
        let store = CacheStore::new();
        store.begin_fetch().complete(vec![shape(1)]);
        let mut rx = store.subscribe();
        store.apply(&ChangeNotification::Deleted(RecordId::Int(7)));
        store.record_created(shape(1));
        assert_eq!(store.revision(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_own_create_then_echo() {
        let store = CacheStore::new();
        store.record_created(shape(5));
        store.apply(&ChangeNotification::Created(shape(5)));
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn test_fetch_replays_changes_made_while_in_flight() {
        let store = CacheStore::new();
        let fetch = store.begin_fetch();
        // No-op on the empty cache, but the list was taken before it.
        store.apply(&ChangeNotification::Deleted(RecordId::Int(5)));
        store.record_created(shape(7));

        let installed = fetch.complete(vec![shape(5), shape(6)]);
        assert_eq!(installed.ids(), vec![RecordId::Int(7), RecordId::Int(6)]);
        assert_eq!(store.snapshot(), installed);
    }

    #[test]
    fn test_abandoned_fetch_stops_journaling() {
        let store = CacheStore::new();
        drop(store.begin_fetch());
        store.apply(&ChangeNotification::Deleted(RecordId::Int(1)));

        let fetch = store.begin_fetch();
        let installed = fetch.complete(vec![shape(1)]);
        assert_eq!(installed.ids(), vec![RecordId::Int(1)]);
    }

    #[test]
    fn test_overlapping_fetches_each_see_their_changes() {
        let store = CacheStore::new();
        let first = store.begin_fetch();
        store.apply(&ChangeNotification::Deleted(RecordId::Int(1)));
        let second = store.begin_fetch();
        store.apply(&ChangeNotification::Deleted(RecordId::Int(2)));

        let installed = second.complete(vec![shape(1), shape(2), shape(3)]);
        assert_eq!(installed.ids(), vec![RecordId::Int(1), RecordId::Int(3)]);

        let installed = first.complete(vec![shape(1), shape(2), shape(3)]);
        assert_eq!(installed.ids(), vec![RecordId::Int(3)]);
    }

    #[tokio::test]
    async fn test_snapshot_stream_current_then_live() {
        let store = CacheStore::new();
        store.begin_fetch().complete(vec![shape(1)]);
        let mut stream = store.snapshot_stream();

        let first = stream.next().await.unwrap();
        assert_eq!(first.revision, 1);
        assert_eq!(first.snapshot.len(), 1);

        store.record_created(shape(2));
        let second = stream.next().await.unwrap();
        assert_eq!(second.revision, 2);
        assert_eq!(second.snapshot.ids(), vec![RecordId::Int(2), RecordId::Int(1)]);

        // A no-op write publishes nothing.
        store.record_deleted(&RecordId::Int(9));
        let mut next = tokio_test::task::spawn(stream.next());
        tokio_test::assert_pending!(next.poll());
    }
}
