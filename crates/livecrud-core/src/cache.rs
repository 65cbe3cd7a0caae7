//! Immutable record snapshots and the patcher that applies change
//! notifications to them.

use std::{collections::HashSet, sync::Arc};

use crate::{
    notification::ChangeNotification,
    record::{Record, RecordId},
};

/// Ordered, immutable collection of records keyed by identifier.
///
/// Cloning is cheap: snapshots share their backing storage. Insertion order
/// is display order, newest first for records created after the initial load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordCache {
    records: Arc<[Record]>,
}

impl RecordCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cache from a fetched list.
    ///
    /// Duplicate identifiers keep their first occurrence.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut seen = HashSet::new();
        let records: Vec<Record> = records
            .into_iter()
            .filter(|r| seen.insert(r.id.clone()))
            .collect();
        Self {
            records: records.into(),
        }
    }

    fn from_vec(records: Vec<Record>) -> Self {
        Self {
            records: records.into(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record by identifier.
    #[must_use]
    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records.iter().find(|r| &r.id == id)
    }

    #[must_use]
    pub fn contains(&self, id: &RecordId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    /// Identifiers in display order.
    #[must_use]
    pub fn ids(&self) -> Vec<RecordId> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }

    fn position(&self, id: &RecordId) -> Option<usize> {
        self.records.iter().position(|r| &r.id == id)
    }

    /// Prepend `record` unless its identifier is already present.
    #[must_use]
    pub fn with_created(&self, record: Record) -> Self {
        if self.contains(&record.id) {
            return self.clone();
        }
        let mut records = Vec::with_capacity(self.records.len() + 1);
        records.push(record);
        records.extend(self.records.iter().cloned());
        Self::from_vec(records)
    }

    /// Replace the entry with the same identifier, or prepend it if absent.
    #[must_use]
    pub fn with_updated(&self, record: Record) -> Self {
        match self.position(&record.id) {
            Some(idx) if self.records[idx] == record => self.clone(),
            Some(idx) => {
                let mut records = self.records.to_vec();
                records[idx] = record;
                Self::from_vec(records)
            }
            None => self.with_created(record),
        }
    }

    /// Remove the entry with `id`; absence is a no-op.
    #[must_use]
    pub fn without(&self, id: &RecordId) -> Self {
        if !self.contains(id) {
            return self.clone();
        }
        Self::from_vec(self.records.iter().filter(|r| &r.id != id).cloned().collect())
    }
}

impl<'a> IntoIterator for &'a RecordCache {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Apply one change notification to a snapshot, producing the next snapshot.
///
/// Never fails: notifications about records this view never fetched are
/// absorbed (updates insert, deletes are no-ops).
#[must_use]
pub fn apply(cache: &RecordCache, notification: &ChangeNotification) -> RecordCache {
    match notification {
        ChangeNotification::Created(record) => cache.with_created(record.clone()),
        ChangeNotification::Updated(record) => cache.with_updated(record.clone()),
        ChangeNotification::Deleted(id) => cache.without(id),
    }
}
