//! Semantic memory: learned `(text, embedding, category)` associations.
//!
//! Append-only and never deduplicated; lookups take the single best cosine
//! match. A fresh (or reset) memory is seeded by embedding each default
//! category name so similarity search always has candidates.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::embedding::Embedder;
use crate::error::retry_oracle;
use crate::similarity::cosine_similarity;
use crate::storage::{JsonDocument, LoadOutcome, PersistenceSlot};

const STORE_NAME: &str = "memory";

/// One learned association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Text the embedding was computed from.
    #[serde(alias = "description")]
    pub text: String,
    /// Embedding of `text`.
    pub embedding: Vec<f32>,
    /// Category associated with `text`.
    pub category: String,
}

/// Result of a similarity search.
#[derive(Debug, Clone, PartialEq)]
pub struct BestMatch {
    /// Category of the best entry, `None` when memory had no comparable entry.
    pub category: Option<String>,
    /// Cosine similarity of the best entry, `-1.0` when there was none.
    pub score: f32,
}

impl BestMatch {
    /// The "no candidates" result.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            category: None,
            score: -1.0,
        }
    }

    /// The category, if the score clears `threshold`.
    #[must_use]
    pub fn accepted(&self, threshold: f32) -> Option<&str> {
        self.category
            .as_deref()
            .filter(|_| self.score >= threshold)
    }
}

#[derive(Debug)]
struct MemoryState {
    entries: Vec<MemoryEntry>,
    slot: PersistenceSlot,
}

impl MemoryState {
    fn persist(&mut self) {
        let Self { entries, slot } = self;
        slot.persist(STORE_NAME, &*entries);
    }
}

/// Similarity cache over learned categorizations.
pub struct SemanticMemory {
    state: RwLock<MemoryState>,
    embedder: Arc<dyn Embedder>,
    retries: u32,
}

impl fmt::Debug for SemanticMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemanticMemory")
            .field("entries", &self.len())
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

impl SemanticMemory {
    /// Opens the memory stored at `path`.
    ///
    /// Missing, empty, or malformed documents are (re)seeded from
    /// `seed_categories`; a malformed one is backed up first. An unreadable
    /// document, or a malformed one that could not be backed up, switches to
    /// in-memory operation and is left untouched on disk.
    pub fn open(
        path: impl Into<PathBuf>,
        embedder: Arc<dyn Embedder>,
        seed_categories: &[String],
        retries: u32,
    ) -> Self {
        let document = JsonDocument::new(path);
        let outcome = document.load::<Vec<MemoryEntry>>();
        Self::from_outcome(document, outcome, embedder, seed_categories, retries)
    }

    fn from_outcome(
        document: JsonDocument,
        outcome: LoadOutcome<Vec<MemoryEntry>>,
        embedder: Arc<dyn Embedder>,
        seed_categories: &[String],
        retries: u32,
    ) -> Self {
        let memory = Self::new(PersistenceSlot::durable(document.clone()), embedder, retries);

        let entries = match outcome {
            LoadOutcome::Missing => None,
            LoadOutcome::Loaded(entries) => Some(entries),
            LoadOutcome::Corrupt {
                backup: Ok(backup),
                reason,
            } => {
                tracing::warn!(
                    path = %document.path().display(),
                    backup = %backup.display(),
                    reason = %reason,
                    "memory corrupt; reseeding"
                );
                None
            }
            LoadOutcome::Corrupt {
                backup: Err(e),
                reason,
            } => {
                tracing::warn!(
                    path = %document.path().display(),
                    reason = %reason,
                    "memory corrupt and not backed up; reseeding in memory only"
                );
                memory.write().slot.degrade(STORE_NAME, &e);
                None
            }
            LoadOutcome::Unreadable(e) => {
                memory.write().slot.degrade(STORE_NAME, &e);
                None
            }
        };

        match entries {
            Some(entries) if !entries.is_empty() => {
                let total = entries.len();
                let entries: Vec<MemoryEntry> = entries
                    .into_iter()
                    .filter(|e| !e.embedding.is_empty() && !e.category.trim().is_empty())
                    .collect();
                if entries.len() != total {
                    tracing::warn!(
                        skipped = total - entries.len(),
                        "ignoring memory entries without embedding or category"
                    );
                }
                tracing::info!(
                    path = %document.path().display(),
                    entries = entries.len(),
                    "memory loaded"
                );
                memory.write().entries = entries;
            }
            _ => memory.seed(seed_categories),
        }

        memory
    }

    /// Memory that never touches disk, seeded from `seed_categories`.
    pub fn in_memory(embedder: Arc<dyn Embedder>, seed_categories: &[String], retries: u32) -> Self {
        let memory = Self::new(PersistenceSlot::in_memory(), embedder, retries);
        memory.seed(seed_categories);
        memory
    }

    fn new(slot: PersistenceSlot, embedder: Arc<dyn Embedder>, retries: u32) -> Self {
        Self {
            state: RwLock::new(MemoryState {
                entries: Vec::new(),
                slot,
            }),
            embedder,
            retries,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn seed(&self, categories: &[String]) {
        let seeded: Vec<MemoryEntry> = categories
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .filter_map(|category| {
                self.embed(category).map(|embedding| MemoryEntry {
                    text: category.to_string(),
                    embedding,
                    category: category.to_string(),
                })
            })
            .collect();

        tracing::info!(entries = seeded.len(), "memory seeded with default categories");
        let mut state = self.write();
        state.entries = seeded;
        state.persist();
    }

    /// Embeds `text`. Failures are logged and yield `None`.
    #[must_use]
    pub fn embed(&self, text: &str) -> Option<Vec<f32>> {
        match retry_oracle(self.retries, || self.embedder.embed(text)) {
            Ok(embedding) if !embedding.is_empty() => Some(embedding),
            Ok(_) => {
                tracing::warn!(text = %text, "embedder returned an empty vector");
                None
            }
            Err(e) => {
                tracing::warn!(text = %text, error = %e, "embedding failed");
                None
            }
        }
    }

    /// Highest cosine match over all entries; first-seen entry wins ties.
    /// Entries of a different dimension are skipped.
    #[must_use]
    pub fn best_match(&self, query: &[f32]) -> BestMatch {
        let state = self.read();
        let mut best = BestMatch::none();
        let mut best_entry: Option<&MemoryEntry> = None;
        for entry in &state.entries {
            let Some(score) = cosine_similarity(query, &entry.embedding) else {
                continue;
            };
            if score > best.score {
                best.score = score;
                best_entry = Some(entry);
            }
        }
        best.category = best_entry.map(|e| e.category.clone());
        best
    }

    /// Embeds `text` and searches memory. `None` means no semantic signal.
    #[must_use]
    pub fn lookup(&self, text: &str) -> Option<BestMatch> {
        self.embed(text).map(|embedding| self.best_match(&embedding))
    }

    /// Embeds `text` and remembers it under `category`.
    ///
    /// Returns false if embedding failed or the input was blank.
    pub fn learn(&self, text: &str, category: &str) -> bool {
        if text.trim().is_empty() || category.trim().is_empty() {
            return false;
        }
        match self.embed(text) {
            Some(embedding) => self.learn_embedded(text, embedding, category),
            None => false,
        }
    }

    /// Remembers an already-embedded `text` under `category`.
    pub fn learn_embedded(&self, text: &str, embedding: Vec<f32>, category: &str) -> bool {
        let category = category.trim();
        if text.trim().is_empty() || category.is_empty() || embedding.is_empty() {
            return false;
        }
        let mut state = self.write();
        state.entries.push(MemoryEntry {
            text: text.to_string(),
            embedding,
            category: category.to_string(),
        });
        state.persist();
        drop(state);

        tracing::info!(text = %text, category = %category, "learned new association");
        true
    }

    /// Distinct categories present in memory.
    #[must_use]
    pub fn known_categories(&self) -> BTreeSet<String> {
        self.read()
            .entries
            .iter()
            .map(|e| e.category.clone())
            .collect()
    }

    /// Snapshot of all entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> Vec<MemoryEntry> {
        self.read().entries.clone()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    /// Returns true if memory has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Returns true while writes still reach disk.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.read().slot.is_durable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::LexicalEmbedder;
    use crate::error::OracleError;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn seeds() -> Vec<String> {
        vec!["Expenses:Groceries".to_string(), "Expenses:Transport".to_string()]
    }

    fn lexical() -> Arc<dyn Embedder> {
        Arc::new(LexicalEmbedder::default())
    }

    struct FailingEmbedder {
        calls: AtomicUsize,
    }

    impl Embedder for FailingEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(OracleError::Unavailable("offline".to_string()))
        }
    }

    #[test]
    fn seeds_on_first_use() {
        let memory = SemanticMemory::in_memory(lexical(), &seeds(), 0);
        assert_eq!(memory.len(), 2);
        assert!(memory.known_categories().contains("Expenses:Groceries"));
    }

    #[test]
    fn empty_memory_has_no_match() {
        let memory = SemanticMemory::in_memory(lexical(), &[], 0);
        assert_eq!(memory.best_match(&[1.0, 0.0]), BestMatch::none());
    }

    #[test]
    fn learned_text_matches_itself() {
        let memory = SemanticMemory::in_memory(lexical(), &seeds(), 0);
        assert!(memory.learn("new cool cafe", "Expenses:Dining"));

        let best = memory.lookup("new cool cafe").unwrap();
        assert_eq!(best.category.as_deref(), Some("Expenses:Dining"));
        assert!(best.score > 0.99);
        assert_eq!(best.accepted(0.85), Some("Expenses:Dining"));
    }

    #[test]
    fn ties_keep_first_seen_entry() {
        let memory = SemanticMemory::in_memory(lexical(), &[], 0);
        memory.learn_embedded("a", vec![1.0, 0.0], "First");
        memory.learn_embedded("b", vec![1.0, 0.0], "Second");
        memory.learn_embedded("c", vec![1.0, 0.0, 0.0], "WrongDim");

        let best = memory.best_match(&[1.0, 0.0]);
        assert_eq!(best.category.as_deref(), Some("First"));
    }

    #[test]
    fn below_threshold_is_rejected() {
        let best = BestMatch {
            category: Some("X".to_string()),
            score: 0.5,
        };
        assert_eq!(best.accepted(0.85), None);
    }

    #[test]
    fn embedding_failure_is_no_signal() {
        let embedder = Arc::new(FailingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let memory = SemanticMemory::in_memory(embedder.clone(), &[], 1);
        assert!(memory.lookup("anything").is_none());
        assert!(!memory.learn("anything", "X"));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn learned_entries_survive_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("category_memory.json");
        {
            let memory = SemanticMemory::open(&path, lexical(), &seeds(), 0);
            memory.learn("picnic order", "Expenses:Groceries");
            assert_eq!(memory.len(), 3);
        }
        let memory = SemanticMemory::open(&path, lexical(), &seeds(), 0);
        assert_eq!(memory.len(), 3);
        assert!(memory.is_durable());
    }

    #[test]
    fn legacy_description_field_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("category_memory.json");
        fs::write(
            &path,
            r#"[{"category": "Expenses:Transport", "description": "Shell", "embedding": [0.1, 0.9]}]"#,
        )
        .unwrap();

        let memory = SemanticMemory::open(&path, lexical(), &seeds(), 0);
        let entries = memory.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "Shell");
    }

    #[test]
    fn corrupt_memory_is_backed_up_and_reseeded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("category_memory.json");
        fs::write(&path, "{corrupt_json").unwrap();

        let memory = SemanticMemory::open(&path, lexical(), &seeds(), 0);
        assert_eq!(memory.len(), 2);

        let backups = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
            .count();
        assert_eq!(backups, 1);

        let reparsed: Vec<MemoryEntry> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reparsed.len(), 2);
    }

    #[test]
    fn corrupt_memory_without_backup_is_left_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("category_memory.json");
        fs::write(&path, "{corrupt_json").unwrap();

        let failed_copy = crate::error::StoreError::io(
            dir.path().join("category_memory.json.corrupt.bak"),
            std::io::Error::other("disk full"),
        );
        let memory = SemanticMemory::from_outcome(
            JsonDocument::new(&path),
            LoadOutcome::Corrupt {
                backup: Err(failed_copy),
                reason: "expected value".to_string(),
            },
            lexical(),
            &seeds(),
            0,
        );
        assert_eq!(memory.len(), 2);
        assert!(!memory.is_durable());

        assert!(memory.learn("picnic order", "Expenses:Groceries"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{corrupt_json");
    }
}
