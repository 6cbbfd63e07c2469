//! A deduplicating collection of resource records keyed by identity.

use crate::packet::record::{RecordKey, ResourceRecord};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    inner: HashMap<RecordKey, ResourceRecord>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by identity.
    pub fn add(&mut self, record: ResourceRecord) {
        self.inner.insert(record.record_key(), record);
    }

    pub fn delete(&mut self, record: &ResourceRecord) -> Option<ResourceRecord> {
        self.inner.remove(&record.record_key())
    }

    pub fn has(&self, record: &ResourceRecord) -> bool {
        self.inner.contains_key(&record.record_key())
    }

    /// Whether every record of `other` is present here.
    pub fn has_each(&self, other: &RecordSet) -> bool {
        other.inner.keys().all(|key| self.inner.contains_key(key))
    }

    pub fn get(&self, key: &RecordKey) -> Option<&ResourceRecord> {
        self.inner.get(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.inner.values()
    }

    pub fn to_vec(&self) -> Vec<ResourceRecord> {
        self.inner.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn union(&self, other: &RecordSet) -> RecordSet {
        let mut out = self.clone();
        for record in other.iter() {
            if !out.has(record) {
                out.add(record.clone());
            }
        }
        out
    }

    pub fn intersection(&self, other: &RecordSet) -> RecordSet {
        let inner = self
            .inner
            .iter()
            .filter(|(key, _)| other.inner.contains_key(*key))
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();
        RecordSet { inner }
    }

    /// Records of `self` that are not in `other`.
    pub fn difference(&self, other: &RecordSet) -> RecordSet {
        let inner = self
            .inner
            .iter()
            .filter(|(key, _)| !other.inner.contains_key(*key))
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();
        RecordSet { inner }
    }

    /// All (ours, theirs) pairs claiming the same unique name with
    /// different data.
    pub fn conflicts<'a>(
        &'a self,
        other: &'a RecordSet,
    ) -> Vec<(&'a ResourceRecord, &'a ResourceRecord)> {
        let mut out = Vec::new();
        for ours in self.iter() {
            for theirs in other.iter() {
                if ours.conflicts_with(theirs) {
                    out.push((ours, theirs));
                }
            }
        }
        out
    }

    /// Mutate every record through the rehash discipline: entries are
    /// taken out, changed, and re-inserted under their new identity.
    pub fn update_each<F>(&mut self, mut mutate: F)
    where
        F: FnMut(&mut ResourceRecord),
    {
        let records: Vec<ResourceRecord> = self.inner.drain().map(|(_, record)| record).collect();
        for mut record in records {
            mutate(&mut record);
            self.add(record);
        }
    }
}

impl FromIterator<ResourceRecord> for RecordSet {
    fn from_iter<T: IntoIterator<Item = ResourceRecord>>(iter: T) -> Self {
        let mut set = RecordSet::new();
        for record in iter {
            set.add(record);
        }
        set
    }
}

impl Extend<ResourceRecord> for RecordSet {
    fn extend<T: IntoIterator<Item = ResourceRecord>>(&mut self, iter: T) {
        for record in iter {
            self.add(record);
        }
    }
}
