//! In-memory index of enrolled descriptors.
//!
//! The cache holds an immutable [`Snapshot`] behind an `Arc`. A refresh builds
//! a complete new snapshot first and then swaps the pointer, so a reader holds
//! either the whole old set or the whole new one.

use crate::types::{Descriptor, DescriptorId, RecognitionResult};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Immutable set of enrolled descriptors, ordered by id.
#[derive(Debug, Default)]
pub struct Snapshot {
    entries: Vec<(DescriptorId, Descriptor)>,
}

impl Snapshot {
    /// Build from (id, descriptor) pairs; a repeated id keeps its last descriptor.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (DescriptorId, Descriptor)>) -> Self {
        let map: BTreeMap<DescriptorId, Descriptor> = pairs.into_iter().collect();
        Self { entries: map.into_iter().collect() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: DescriptorId) -> Option<&Descriptor> {
        self.entries
            .binary_search_by_key(&id, |(k, _)| *k)
            .ok()
            .map(|i| &self.entries[i].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (DescriptorId, &Descriptor)> {
        self.entries.iter().map(|(id, d)| (*id, d))
    }

    /// Nearest enrolled descriptor by Euclidean distance.
    ///
    /// Always visits every entry. On equal distances the lowest id wins.
    pub fn nearest(&self, query: &Descriptor) -> Option<(DescriptorId, f32)> {
        let mut best: Option<(DescriptorId, f32)> = None;
        for (id, enrolled) in self.iter() {
            let distance = query.euclidean_distance(enrolled);
            // Strict comparison over ascending ids keeps the lowest id on ties.
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((id, distance));
            }
        }
        best
    }

    /// Match `query` against the snapshot: a hit iff the nearest distance is below `threshold`.
    pub fn match_descriptor(&self, query: &Descriptor, threshold: f32) -> RecognitionResult {
        match self.nearest(query) {
            Some((id, distance)) if distance < threshold => RecognitionResult {
                is_known_face: true,
                matched_id: Some(id),
                distance: Some(distance),
            },
            Some((_, distance)) => RecognitionResult::unknown(Some(distance)),
            None => RecognitionResult::unknown(None),
        }
    }
}

/// Shared handle to the current snapshot.
#[derive(Debug, Default)]
pub struct DescriptorCache {
    current: RwLock<Arc<Snapshot>>,
}

impl DescriptorCache {
    /// Current snapshot. Stays valid and unchanged for as long as the caller holds it.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        // The lock only guards a pointer swap, so a poisoned lock still holds a whole snapshot.
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Install a fully built snapshot, returning the number of entries now served.
    pub(crate) fn replace(&self, snapshot: Snapshot) -> usize {
        let len = snapshot.len();
        let next = Arc::new(snapshot);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = next;
        len
    }
}
