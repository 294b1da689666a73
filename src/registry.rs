//! The entity registry ("phonebook").
//!
//! Owns the canonical entities and the derived alias index. The entities map
//! is the source of truth; the alias index is rebuilt from it on load. Every
//! mutation is persisted before the call returns.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::entity::{ContextRule, Entity, EntityId};
use crate::error::{EngineError, EngineResult, ValidationError};
use crate::normalize::alias_key;
use crate::storage::{JsonDocument, LoadOutcome, PersistenceSlot};

const STORE_NAME: &str = "registry";

/// Normalized alias → entity id.
#[derive(Debug, Default, Clone)]
pub struct AliasIndex {
    by_key: HashMap<String, EntityId>,
}

impl AliasIndex {
    /// Owner of a normalized alias key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&EntityId> {
        self.by_key.get(key)
    }

    /// Iterates over `(alias key, owner)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &EntityId)> {
        self.by_key.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of indexed aliases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Returns true if nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    fn insert(&mut self, key: String, id: EntityId) -> Option<EntityId> {
        self.by_key.insert(key, id)
    }
}

#[derive(Debug)]
struct RegistryState {
    entities: BTreeMap<EntityId, Entity>,
    index: AliasIndex,
    slot: PersistenceSlot,
}

impl RegistryState {
    fn empty(slot: PersistenceSlot) -> Self {
        Self {
            entities: BTreeMap::new(),
            index: AliasIndex::default(),
            slot,
        }
    }

    /// Points `alias` at `owner`. If another entity owned it, the alias moves
    /// to `owner` and is dropped from the previous owner's alias list.
    fn claim_alias(&mut self, alias: &str, owner: &EntityId) {
        let key = alias_key(alias);
        if key.is_empty() {
            return;
        }
        let Some(previous) = self.index.insert(key.clone(), owner.clone()) else {
            return;
        };
        if &previous == owner {
            return;
        }

        tracing::warn!(
            alias = %key,
            from = %previous,
            to = %owner,
            "alias reassigned to newer entity"
        );
        if let Some(prev_entity) = self.entities.get_mut(&previous) {
            // A canonical name stays listed; the newer owner still wins on reload.
            let canonical = alias_key(&prev_entity.canonical_name);
            let stale: Vec<String> = prev_entity
                .aliases
                .iter()
                .filter(|a| canonical != key && alias_key(a) == key)
                .cloned()
                .collect();
            for alias in stale {
                prev_entity.remove_alias(&alias);
            }
        }
    }

    fn rebuild_index(&mut self) {
        // Oldest first so the most recently written owner keeps a contested alias.
        let mut order: Vec<&Entity> = self.entities.values().collect();
        order.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));

        let mut index = AliasIndex::default();
        for entity in order {
            for alias in &entity.aliases {
                let key = alias_key(alias);
                if key.is_empty() {
                    continue;
                }
                if let Some(previous) = index.insert(key.clone(), entity.id.clone()) {
                    if previous != entity.id {
                        tracing::warn!(
                            alias = %key,
                            from = %previous,
                            to = %entity.id,
                            "duplicate alias in stored registry; newest entity wins"
                        );
                    }
                }
            }
        }
        self.index = index;
    }

    fn persist(&mut self) {
        let Self { entities, slot, .. } = self;
        slot.persist(STORE_NAME, &*entities);
    }
}

/// Durable store of canonical entities and their aliases.
///
/// Thread-safe: reads share a lock, mutations are serialized and persisted
/// while the write lock is held.
#[derive(Debug)]
pub struct EntityRegistry {
    state: RwLock<RegistryState>,
    generation: AtomicU64,
}

impl EntityRegistry {
    /// Opens the registry stored at `path`.
    ///
    /// Never fails: a missing file starts an empty registry, a malformed file
    /// is backed up and replaced by an empty registry, and an unreadable file
    /// (or a malformed one that could not be backed up) switches the registry
    /// to in-memory operation.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let document = JsonDocument::new(path);
        let outcome = document.load::<BTreeMap<String, Entity>>();
        Self::from_outcome(document, outcome)
    }

    fn from_outcome(document: JsonDocument, outcome: LoadOutcome<BTreeMap<String, Entity>>) -> Self {
        let mut state = RegistryState::empty(PersistenceSlot::durable(document.clone()));

        match outcome {
            LoadOutcome::Missing => {
                tracing::info!(path = %document.path().display(), "no registry found; starting fresh");
            }
            LoadOutcome::Loaded(stored) => {
                state.entities = sanitize(stored);
                state.rebuild_index();
                tracing::info!(
                    path = %document.path().display(),
                    entities = state.entities.len(),
                    aliases = state.index.len(),
                    "registry loaded"
                );
            }
            LoadOutcome::Corrupt {
                backup: Ok(backup),
                reason,
            } => {
                tracing::warn!(
                    path = %document.path().display(),
                    backup = %backup.display(),
                    reason = %reason,
                    "registry corrupt; reinitializing empty"
                );
                state.persist();
            }
            LoadOutcome::Corrupt {
                backup: Err(e),
                reason,
            } => {
                tracing::warn!(
                    path = %document.path().display(),
                    reason = %reason,
                    "registry corrupt and not backed up; leaving it in place"
                );
                state.slot.degrade(STORE_NAME, &e);
            }
            LoadOutcome::Unreadable(e) => {
                state.slot.degrade(STORE_NAME, &e);
            }
        }

        Self::from_state(state)
    }

    /// Creates a registry that never touches disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_state(RegistryState::empty(PersistenceSlot::in_memory()))
    }

    fn from_state(state: RegistryState) -> Self {
        Self {
            state: RwLock::new(state),
            generation: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Case-insensitive exact lookup by alias (the canonical name is an alias).
    #[must_use]
    pub fn find_by_alias(&self, name: &str) -> Option<Entity> {
        let key = alias_key(name);
        if key.is_empty() {
            return None;
        }
        let state = self.read();
        let id = state.index.get(&key)?;
        state.entities.get(id).cloned()
    }

    /// Entity by id.
    #[must_use]
    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        self.read().entities.get(id).cloned()
    }

    /// Creates or updates an entity.
    ///
    /// If an entity with the same slug exists, `category` replaces its default
    /// category only when `Some`, and new aliases are appended. Otherwise a new
    /// entity is created with `category` (or `Uncategorized`). Aliases owned by
    /// another entity are reassigned to this one.
    pub fn register<S: AsRef<str>>(
        &self,
        name: &str,
        category: Option<&str>,
        aliases: &[S],
    ) -> Result<Entity, ValidationError> {
        let name = name.trim();
        let id = EntityId::from_name(name);
        if id.is_empty() {
            return Err(ValidationError::EmptyEntityName);
        }
        let category = category.map(str::trim).filter(|c| !c.is_empty());

        let mut state = self.write();
        let created = !state.entities.contains_key(&id);
        if created {
            state.entities.insert(id.clone(), Entity::new(name, category));
        }

        let mut new_aliases = Vec::new();
        if let Some(entity) = state.entities.get_mut(&id) {
            if !created {
                if let Some(category) = category {
                    entity.default_category = category.to_string();
                }
            }
            for alias in aliases {
                let alias = alias.as_ref().trim();
                if alias.is_empty() {
                    continue;
                }
                entity.add_alias(alias);
                new_aliases.push(alias.to_string());
            }
            entity.touch();
        }

        state.claim_alias(name, &id);
        for alias in &new_aliases {
            state.claim_alias(alias, &id);
        }
        state.persist();

        let entity = state
            .entities
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Entity::new(name, category));
        drop(state);
        self.bump();

        tracing::info!(
            entity = %entity.id,
            category = %entity.default_category,
            created,
            "entity registered"
        );
        Ok(entity)
    }

    /// Appends a context rule to the entity named `entity_name`.
    ///
    /// The entity is looked up by slug first, then by alias.
    pub fn add_context_rule(
        &self,
        entity_name: &str,
        keyword: &str,
        category: &str,
    ) -> EngineResult<Entity> {
        let keyword = keyword.trim();
        let category = category.trim();
        if keyword.is_empty() {
            return Err(ValidationError::EmptyKeyword.into());
        }
        if category.is_empty() {
            return Err(ValidationError::EmptyCategory.into());
        }

        let mut state = self.write();
        let slug = EntityId::from_name(entity_name);
        let id = if state.entities.contains_key(&slug) {
            Some(slug)
        } else {
            state.index.get(&alias_key(entity_name)).cloned()
        };
        let entity = match id {
            Some(id) => state.entities.get_mut(&id),
            None => None,
        };
        let Some(entity) = entity else {
            return Err(EngineError::EntityNotFound {
                name: entity_name.to_string(),
            });
        };

        entity.add_context_rule(ContextRule::new(keyword, category));
        let updated = entity.clone();
        state.persist();
        drop(state);
        self.bump();
        Ok(updated)
    }

    /// Distinct non-empty default categories.
    #[must_use]
    pub fn all_categories(&self) -> BTreeSet<String> {
        self.read()
            .entities
            .values()
            .map(|e| e.default_category.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Runs `f` against the alias index under the read lock.
    pub fn with_aliases<R>(&self, f: impl FnOnce(&AliasIndex) -> R) -> R {
        f(&self.read().index)
    }

    /// Snapshot of all entities, ordered by id.
    #[must_use]
    pub fn entities(&self) -> Vec<Entity> {
        self.read().entities.values().cloned().collect()
    }

    /// Number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().entities.len()
    }

    /// Returns true if the registry has no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().entities.is_empty()
    }

    /// Counter incremented by every successful mutation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Returns true while mutations are still written to disk.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.read().slot.is_durable()
    }

    /// Backing file path, if the registry was opened from disk.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.read().slot.document().map(|d| d.path().to_path_buf())
    }
}

/// Re-keys stored entities by their own id and repairs hand-edited records.
fn sanitize(stored: BTreeMap<String, Entity>) -> BTreeMap<EntityId, Entity> {
    let mut entities = BTreeMap::new();
    for (key, mut entity) in stored {
        entity.canonical_name = entity.canonical_name.trim().to_string();
        if entity.canonical_name.is_empty() {
            tracing::warn!(key = %key, "skipping stored entity without a canonical name");
            continue;
        }
        if entity.id.is_empty() {
            entity.id = EntityId::from_name(&entity.canonical_name);
        }
        entity.ensure_canonical_alias();
        entities.insert(entity.id.clone(), entity);
    }
    entities
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::in_memory()
    }
}
