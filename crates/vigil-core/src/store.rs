//! Identity generations and the atomically swappable index handle.
//!
//! A [`Generation`] pairs an [`AngularForest`] with the [`EmbeddingStore`]
//! built from the same catalog snapshot. [`IdentityIndex`] only ever hands out
//! whole generations, so a label is always resolved against the tables it
//! was built with.

use crate::catalog::CatalogEntry;
use crate::forest::{AngularForest, ForestConfig, IndexError, Neighbor};
use crate::types::{Embedding, IdentityRecord};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Label-indexed identity records; label `i` is stored at position `i`.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingStore {
    records: Vec<IdentityRecord>,
}

impl EmbeddingStore {
    /// Accept complete entries of dimension `dim`, labelling them `0..N` in
    /// input order. Returns the store and the number of skipped entries.
    pub fn from_entries(entries: impl IntoIterator<Item = CatalogEntry>, dim: usize) -> (Self, usize) {
        let mut records = Vec::new();
        let mut skipped = 0usize;

        for entry in entries {
            let (Some(username), Some(member_id), Some(values)) =
                (entry.username, entry.member_id, entry.embedding)
            else {
                skipped += 1;
                continue;
            };
            if values.len() != dim {
                tracing::warn!(
                    username = %username,
                    got = values.len(),
                    want = dim,
                    "skipping catalog entry with wrong embedding dimension"
                );
                skipped += 1;
                continue;
            }
            records.push(IdentityRecord {
                label: records.len() as u32,
                username,
                member_id,
                embedding: Embedding::new(values),
            });
        }

        (Self { records }, skipped)
    }

    pub(crate) fn from_records(records: Vec<IdentityRecord>) -> Self {
        Self { records }
    }

    pub fn get(&self, label: u32) -> Option<&IdentityRecord> {
        self.records.get(label as usize)
    }

    pub fn records(&self) -> &[IdentityRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One immutable build of the identity index.
#[derive(Debug, Clone)]
pub struct Generation {
    pub(crate) dim: usize,
    pub(crate) forest: Option<AngularForest>,
    pub(crate) store: EmbeddingStore,
}

impl Generation {
    /// Build from catalog entries. An empty catalog yields an empty
    /// generation whose queries fail with [`IndexError::Empty`].
    pub fn build(entries: impl IntoIterator<Item = CatalogEntry>, dim: usize, cfg: &ForestConfig) -> Self {
        let (store, skipped) = EmbeddingStore::from_entries(entries, dim);
        let vectors: Vec<Vec<f32>> = store.records().iter().map(|r| r.embedding.values.clone()).collect();

        let forest = match AngularForest::build(dim, &vectors, cfg) {
            Ok(forest) => Some(forest),
            Err(IndexError::Empty) => {
                tracing::warn!(skipped, "no usable catalog entries; identity index is empty");
                None
            }
            Err(e) => {
                // Dimensions were filtered above, so this is unreachable in practice.
                tracing::error!(error = %e, "identity index build failed");
                None
            }
        };

        if forest.is_some() {
            tracing::info!(records = store.len(), skipped, trees = cfg.n_trees, "identity index built");
        }

        Self { dim, forest, store }
    }

    /// Nearest labels to `embedding` within this generation.
    pub fn query(&self, embedding: &Embedding, k: usize, search_k: Option<usize>) -> Result<Vec<Neighbor>, IndexError> {
        let forest = self.forest.as_ref().ok_or(IndexError::Empty)?;
        forest.query(&embedding.values, k, search_k)
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub fn forest(&self) -> Option<&AngularForest> {
        self.forest.as_ref()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// Shared handle to the current [`Generation`].
///
/// Readers take an `Arc` snapshot and query it without holding the lock;
/// [`install`](Self::install) replaces the whole generation at once.
#[derive(Default)]
pub struct IdentityIndex {
    current: RwLock<Option<Arc<Generation>>>,
    installs: AtomicU64,
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a freshly built generation, returning the one it replaced.
    pub fn install(&self, generation: Generation) -> Option<Arc<Generation>> {
        let generation = Arc::new(generation);
        let records = generation.len();
        let previous = self.current.write().replace(generation);
        let n = self.installs.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(generation = n, records, "identity index installed");
        previous
    }

    /// The latest installed generation, if any.
    pub fn snapshot(&self) -> Option<Arc<Generation>> {
        self.current.read().clone()
    }

    /// Number of generations installed so far.
    pub fn generation(&self) -> u64 {
        self.installs.load(Ordering::SeqCst)
    }

    /// Query the latest generation.
    pub fn query(&self, embedding: &Embedding, k: usize) -> Result<Vec<Neighbor>, IndexError> {
        let generation = self.snapshot().ok_or(IndexError::NotBuilt)?;
        generation.query(embedding, k, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(names: &[(&str, &str, [f32; 2])]) -> Vec<CatalogEntry> {
        names
            .iter()
            .map(|(u, m, v)| CatalogEntry::new(u, m, v.to_vec()))
            .collect()
    }

    #[test]
    fn test_store_skips_incomplete_and_labels_densely() {
        let mut input = entries(&[("a", "1", [1.0, 0.0]), ("b", "2", [0.0, 1.0])]);
        input.insert(1, CatalogEntry { username: None, ..CatalogEntry::new("x", "9", vec![1.0, 1.0]) });
        input.push(CatalogEntry::new("wrong-dim", "3", vec![1.0, 2.0, 3.0]));

        let (store, skipped) = EmbeddingStore::from_entries(input, 2);
        assert_eq!(skipped, 2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(0).unwrap().username, "a");
        assert_eq!(store.get(1).unwrap().username, "b");
        assert_eq!(store.get(1).unwrap().label, 1);
        assert!(store.get(2).is_none());
    }

    #[test]
    fn test_empty_generation_query_is_empty_error() {
        let generation = Generation::build(Vec::new(), 2, &ForestConfig::default());
        assert!(generation.is_empty());
        let err = generation.query(&Embedding::new(vec![1.0, 0.0]), 10, None).unwrap_err();
        assert_eq!(err, IndexError::Empty);
    }

    #[test]
    fn test_unbuilt_index_query_fails() {
        let index = IdentityIndex::new();
        let err = index.query(&Embedding::new(vec![1.0, 0.0]), 10).unwrap_err();
        assert_eq!(err, IndexError::NotBuilt);
        assert_eq!(index.generation(), 0);
    }

    #[test]
    fn test_snapshot_survives_install() {
        let index = IdentityIndex::new();
        index.install(Generation::build(
            entries(&[("old", "1", [1.0, 0.0])]),
            2,
            &ForestConfig::default(),
        ));

        let before = index.snapshot().unwrap();
        let previous = index.install(Generation::build(
            entries(&[("new-a", "2", [1.0, 0.0]), ("new-b", "3", [0.0, 1.0])]),
            2,
            &ForestConfig::default(),
        ));

        // The old snapshot still answers with its own tables.
        let hits = before.query(&Embedding::new(vec![1.0, 0.0]), 10, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(before.store().get(hits[0].label).unwrap().username, "old");
        assert!(Arc::ptr_eq(&before, &previous.unwrap()));

        let after = index.snapshot().unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(index.generation(), 2);
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_generation() {
        let index = Arc::new(IdentityIndex::new());
        index.install(Generation::build(
            entries(&[("g0", "0", [1.0, 0.0])]),
            2,
            &ForestConfig::default(),
        ));

        let reader = {
            let index = index.clone();
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    let generation = index.snapshot().unwrap();
                    let hits = generation.query(&Embedding::new(vec![1.0, 0.1]), 10, None).unwrap();
                    // Generation g has exactly g+1 records all named "g<g>".
                    let expected = format!("g{}", generation.len() - 1);
                    for hit in hits {
                        let record = generation.store().get(hit.label).expect("label in range");
                        assert_eq!(record.username, expected);
                    }
                }
            })
        };

        for g in 1..20usize {
            let name = format!("g{g}");
            let input: Vec<CatalogEntry> = (0..=g)
                .map(|i| CatalogEntry::new(&name, &i.to_string(), vec![1.0, i as f32]))
                .collect();
            index.install(Generation::build(input, 2, &ForestConfig { n_trees: 2, ..Default::default() }));
        }

        reader.join().unwrap();
    }
}
