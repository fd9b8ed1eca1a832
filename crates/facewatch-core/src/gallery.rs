//! In-memory gallery of known identities with copy-on-write snapshots.
//!
//! Matching always runs against an `Arc<GallerySnapshot>` taken before the
//! pass starts. `refresh()` builds a whole new snapshot off to the side and
//! swaps the pointer, so a match in progress never sees a torn gallery.

use crate::store::{GalleryLoadError, GalleryStore, StoredIdentity};
use crate::types::{l2_normalize, EmbeddingVector, GalleryEntry};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Immutable view of the gallery, ordered by `person_id`.
#[derive(Debug, Clone, Default)]
pub struct GallerySnapshot {
    entries: Vec<GalleryEntry>,
    generation: u64,
}

impl GallerySnapshot {
    /// Build a snapshot from already-validated entries. Duplicate ids keep the last one.
    pub fn from_entries(entries: Vec<GalleryEntry>) -> Self {
        let mut by_id = BTreeMap::new();
        for entry in entries {
            by_id.insert(entry.person_id.clone(), entry);
        }
        Self {
            entries: by_id.into_values().collect(),
            generation: 0,
        }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Monotonic refresh counter; 0 for the initial empty snapshot.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, person_id: &str) -> Option<&GalleryEntry> {
        self.entries
            .binary_search_by(|e| e.person_id.as_str().cmp(person_id))
            .ok()
            .map(|i| &self.entries[i])
    }
}

/// Validate stored records into gallery entries of the expected dimension.
///
/// Later duplicates replace earlier ones (logged). Records with no usable
/// vector are skipped (logged).
pub fn build_entries(records: Vec<StoredIdentity>, dimension: usize) -> Vec<GalleryEntry> {
    let mut by_id: BTreeMap<String, GalleryEntry> = BTreeMap::new();

    for record in records {
        let StoredIdentity {
            person_id,
            display_name,
            embedding,
            raw_features,
            model_version,
        } = record;

        let values = match (embedding, &raw_features) {
            (Some(values), _) if values.len() == dimension => values,
            (Some(values), _) => {
                tracing::warn!(
                    %person_id,
                    expected = dimension,
                    actual = values.len(),
                    "gallery entry has wrong embedding dimension; skipping"
                );
                continue;
            }
            (None, Some(raw)) if raw.len() == dimension => {
                tracing::debug!(%person_id, "using legacy raw features as embedding");
                let mut values = raw.clone();
                l2_normalize(&mut values);
                values
            }
            (None, _) => {
                tracing::warn!(%person_id, "gallery entry has no usable feature vector; skipping");
                continue;
            }
        };

        let entry = GalleryEntry {
            person_id: person_id.clone(),
            display_name,
            embedding: EmbeddingVector {
                values,
                model_version,
            },
            raw_features,
        };

        if by_id.insert(person_id.clone(), entry).is_some() {
            tracing::warn!(%person_id, "duplicate person_id in gallery store; later record wins");
        }
    }

    by_id.into_values().collect()
}

/// Owned gallery: a store plus the currently active snapshot.
pub struct Gallery {
    store: Arc<dyn GalleryStore>,
    dimension: usize,
    active: RwLock<Arc<GallerySnapshot>>,
    generation: AtomicU64,
}

impl Gallery {
    /// Create a gallery with an empty snapshot. Call [`refresh`](Self::refresh) to load.
    pub fn new(store: Arc<dyn GalleryStore>, dimension: usize) -> Self {
        Self {
            store,
            dimension,
            active: RwLock::new(Arc::new(GallerySnapshot::default())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// The snapshot to use for one matching pass.
    pub fn snapshot(&self) -> Arc<GallerySnapshot> {
        let guard = self.active.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Reload from the store and swap the active snapshot.
    ///
    /// On failure the previous snapshot stays active and the error is returned.
    pub async fn refresh(&self) -> Result<Arc<GallerySnapshot>, GalleryLoadError> {
        let records = match self.store.load_all().await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, "gallery refresh failed; keeping previous snapshot");
                return Err(err);
            }
        };
        let loaded = records.len();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(GallerySnapshot {
            entries: build_entries(records, self.dimension),
            generation,
        });

        {
            let mut guard = self.active.write().unwrap_or_else(|e| e.into_inner());
            *guard = Arc::clone(&snapshot);
        }

        tracing::info!(
            loaded,
            active = snapshot.len(),
            generation,
            "gallery refreshed"
        );
        Ok(snapshot)
    }
}
