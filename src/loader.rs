//! Turns the active part of the index into a fixed, shuffled playback sequence.

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::info;

use crate::error::StoreError;
use crate::store::{ImageRecord, IndexStore, RecordId, RootId};

/// Session-scoped permutation of record ids. Never reordered once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSequence {
    ids: Arc<[RecordId]>,
}

impl PlaybackSequence {
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn id_at(&self, index: usize) -> Option<RecordId> {
        self.ids.get(index).copied()
    }

    #[must_use]
    pub fn ids(&self) -> &[RecordId] {
        &self.ids
    }
}

pub struct Loader {
    store: IndexStore,
    rng: StdRng,
}

impl Loader {
    /// A loader over `store`. With `seed`, permutations are reproducible.
    #[must_use]
    pub fn new(store: IndexStore, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { store, rng }
    }

    /// Shuffle the active records of `roots` into a new sequence.
    ///
    /// Every permutation is equally likely. An empty active set yields an empty
    /// sequence rather than an error.
    pub fn start_session(&mut self, roots: &[RootId]) -> Result<PlaybackSequence, StoreError> {
        let mut ids = self.store.active_ids(roots)?;
        ids.shuffle(&mut self.rng);
        info!(images = ids.len(), roots = roots.len(), "playback sequence built");
        Ok(PlaybackSequence { ids: ids.into() })
    }

    /// Records for `sequence[start..start + count]`, clipped to the sequence length.
    pub fn block(
        &self,
        sequence: &PlaybackSequence,
        start: usize,
        count: usize,
    ) -> Result<Vec<ImageRecord>, StoreError> {
        let len = sequence.len();
        let start = start.min(len);
        let end = start.saturating_add(count).min(len);
        self.store.records(&sequence.ids[start..end])
    }

    /// The record at `index`, if the index is in bounds and the record still exists.
    pub fn resolve(
        &self,
        sequence: &PlaybackSequence,
        index: usize,
    ) -> Result<Option<ImageRecord>, StoreError> {
        Ok(self.block(sequence, index, 1)?.pop())
    }

    #[must_use]
    pub const fn store(&self) -> &IndexStore {
        &self.store
    }

    pub const fn store_mut(&mut self) -> &mut IndexStore {
        &mut self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn loader_with(n: usize, seed: Option<u64>) -> (Loader, RootId) {
        let mut store = IndexStore::open_in_memory(64).unwrap();
        let root = store.add_root("/lib").unwrap();
        let now = Utc::now();
        for i in 0..n {
            store
                .upsert(root.id, &PathBuf::from(format!("/lib/{i}.jpg")), None, now)
                .unwrap();
        }
        store.flush().unwrap();
        (Loader::new(store, seed), root.id)
    }

    #[test]
    fn sequence_is_a_permutation() {
        for n in [0, 1, 2, 17, 250] {
            let (mut loader, root) = loader_with(n, None);
            let seq = loader.start_session(&[root]).unwrap();
            assert_eq!(seq.len(), n);
            let unique: HashSet<RecordId> = seq.ids().iter().copied().collect();
            assert_eq!(unique.len(), n);
            let expected: HashSet<RecordId> =
                loader.store().active_ids(&[root]).unwrap().into_iter().collect();
            assert_eq!(unique, expected);
        }
    }

    #[test]
    fn seeded_sequences_reproduce() {
        let (mut a, root_a) = loader_with(40, Some(7));
        let (mut b, root_b) = loader_with(40, Some(7));
        assert_eq!(
            a.start_session(&[root_a]).unwrap(),
            b.start_session(&[root_b]).unwrap()
        );
    }

    #[test]
    fn consecutive_sessions_reshuffle() {
        let (mut loader, root) = loader_with(40, Some(3));
        let first = loader.start_session(&[root]).unwrap();
        let second = loader.start_session(&[root]).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn empty_active_set_is_not_an_error() {
        let (mut loader, root) = loader_with(5, None);
        loader.store_mut().set_root_active(root, false).unwrap();
        let seq = loader.start_session(&[root]).unwrap();
        assert!(seq.is_empty());
        assert!(loader.block(&seq, 0, 10).unwrap().is_empty());
    }

    #[test]
    fn block_follows_sequence_order_and_clips() {
        let (mut loader, root) = loader_with(10, Some(11));
        let seq = loader.start_session(&[root]).unwrap();

        let block = loader.block(&seq, 8, 5).unwrap();
        let got: Vec<RecordId> = block.iter().map(|r| r.id).collect();
        assert_eq!(got, seq.ids()[8..10].to_vec());

        assert!(loader.block(&seq, 42, 3).unwrap().is_empty());
        let third = loader.resolve(&seq, 3).unwrap().unwrap();
        assert_eq!(Some(third.id), seq.id_at(3));
    }
}
