//! Categorization orchestrator.
//!
//! Wires the normalizer, rule table, registry, resolver, semantic memory, and
//! generative fallback into a funnel, and exposes the batch, parallel,
//! discovery, and feedback operations over rows.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;

use crossbeam_channel::{bounded, unbounded};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::EngineConfig;
use crate::embedding::{Embedder, LexicalEmbedder};
use crate::entity::Entity;
use crate::error::EngineResult;
use crate::fallback::{Classifier, GenerativeFallback, NoClassifier};
use crate::funnel::{
    DecisionCache, Funnel, GenerativeStage, MemoryStage, RegistryStage, Resolution,
    ResolutionStage, RuleStage, StageInput,
};
use crate::interactive::InteractiveSession;
use crate::memory::SemanticMemory;
use crate::normalize::{NoiseSet, TextNormalizer};
use crate::registry::EntityRegistry;
use crate::resolver::{EntityResolver, Suggestion};
use crate::rules::RuleTable;

/// A tabular record: column name → value.
pub type Row = Map<String, Value>;

/// Output column names written by [`CategorizationOrchestrator::run`].
pub mod columns {
    /// Normalized description.
    pub const CLEANED: &str = "cleaned_description";
    /// Canonical name of the matched entity, or null.
    pub const ENTITY: &str = "entity";
    /// Id of the matched entity, or null.
    pub const ENTITY_ID: &str = "entity_id";
    /// Assigned category.
    pub const CATEGORY: &str = "category";
    /// Match confidence.
    pub const CONFIDENCE: &str = "confidence";
    /// Funnel method that produced the result.
    pub const METHOD: &str = "method";
}

/// An unresolved normalized description surfaced for review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnknownEntity {
    /// Normalized description shared by the grouped rows.
    pub raw: String,
    /// Canonical name of the best suggestion, if any.
    pub suggested_name: Option<String>,
    /// Score of the best suggestion, `0.0` without one.
    pub confidence: f32,
    /// Distinct original descriptions, first seen first.
    pub original_examples: Vec<String>,
}

/// Builder for [`CategorizationOrchestrator`].
pub struct OrchestratorBuilder {
    config: EngineConfig,
    embedder: Option<Arc<dyn Embedder>>,
    classifier: Option<Arc<dyn Classifier>>,
}

impl OrchestratorBuilder {
    /// Uses `embedder` for semantic memory. Defaults to [`LexicalEmbedder`].
    #[must_use]
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Uses `classifier` as the generative oracle. Defaults to [`NoClassifier`].
    #[must_use]
    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Validates the configuration, opens the stores, and builds the funnel.
    pub fn build(self) -> EngineResult<CategorizationOrchestrator> {
        let config = self.config.validate()?;
        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(LexicalEmbedder::default()));
        let classifier = self.classifier.unwrap_or_else(|| Arc::new(NoClassifier));

        let registry = Arc::new(match config.registry_path() {
            Some(path) => EntityRegistry::open(path),
            None => EntityRegistry::in_memory(),
        });
        let memory = Arc::new(match config.memory_path() {
            Some(path) => SemanticMemory::open(
                path,
                embedder,
                &config.seed_categories,
                config.oracle_retries,
            ),
            None => SemanticMemory::in_memory(embedder, &config.seed_categories, config.oracle_retries),
        });

        let normalizer = TextNormalizer::new(NoiseSet::from_words(&config.noise_words));
        let rules = RuleTable::new(config.rules.iter().cloned());
        let resolver = EntityResolver::new(registry.clone(), config.fuzzy_threshold);

        let lookup_stages = || {
            let mut stages: Vec<Box<dyn ResolutionStage>> = Vec::with_capacity(4);
            stages.push(Box::new(RuleStage::new(rules.clone())));
            stages.push(Box::new(RegistryStage::new(resolver.clone())));
            stages.push(Box::new(MemoryStage::new(
                memory.clone(),
                config.similarity_threshold,
            )));
            stages
        };

        let preview = Funnel::new(lookup_stages());
        let mut stages = lookup_stages();
        stages.push(Box::new(GenerativeStage::new(
            GenerativeFallback::new(classifier, config.oracle_retries),
            memory.clone(),
            registry.clone(),
            config.similarity_threshold,
            config.generative_confidence,
        )));
        let funnel = Funnel::new(stages);

        tracing::info!(
            stages = ?funnel.stage_names(),
            entities = registry.len(),
            memory_entries = memory.len(),
            persistent = config.data_dir.is_some(),
            "orchestrator ready"
        );

        Ok(CategorizationOrchestrator {
            config,
            normalizer: RwLock::new(normalizer),
            registry,
            memory,
            resolver,
            funnel,
            preview,
        })
    }
}

/// Composes the resolution funnel and the feedback loop.
pub struct CategorizationOrchestrator {
    config: EngineConfig,
    normalizer: RwLock<TextNormalizer>,
    registry: Arc<EntityRegistry>,
    memory: Arc<SemanticMemory>,
    resolver: EntityResolver,
    funnel: Funnel,
    preview: Funnel,
}

impl fmt::Debug for CategorizationOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CategorizationOrchestrator")
            .field("funnel", &self.funnel)
            .field("registry", &self.registry.len())
            .field("memory", &self.memory.len())
            .finish_non_exhaustive()
    }
}

impl CategorizationOrchestrator {
    /// Starts building an orchestrator from `config`.
    #[must_use]
    pub fn builder(config: EngineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            embedder: None,
            classifier: None,
        }
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The entity registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// The semantic memory.
    #[must_use]
    pub fn memory(&self) -> &Arc<SemanticMemory> {
        &self.memory
    }

    /// The entity resolver.
    #[must_use]
    pub fn resolver(&self) -> &EntityResolver {
        &self.resolver
    }

    /// The full funnel, generative stage included.
    #[must_use]
    pub fn funnel(&self) -> &Funnel {
        &self.funnel
    }

    /// Normalizes `raw` with the current noise set.
    #[must_use]
    pub fn normalize(&self, raw: &str) -> String {
        self.normalizer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .normalize(raw)
    }

    /// Adds a whole-word noise token for subsequent normalization.
    pub fn add_noise_word(&self, word: &str) -> bool {
        self.normalizer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_noise_word(word)
    }

    /// Resolves one description through the full funnel.
    ///
    /// Blank input, or input that normalizes to nothing, is unresolved
    /// without consulting any stage.
    #[must_use]
    pub fn resolve(&self, raw: &str) -> Resolution {
        self.resolve_with(&self.funnel, raw, None).1
    }

    fn resolve_with(
        &self,
        funnel: &Funnel,
        raw: &str,
        decisions: Option<&DecisionCache>,
    ) -> (String, Resolution) {
        let normalized = self.normalize(raw);
        if normalized.is_empty() {
            return (normalized, Resolution::unresolved());
        }
        let mut input = StageInput::new(raw, normalized);
        if let Some(decisions) = decisions {
            input = input.with_decisions(decisions);
        }
        let resolution = funnel.resolve(&input);
        (input.normalized().to_string(), resolution)
    }

    /// Ranked suggestions for `candidate` using the configured limits.
    #[must_use]
    pub fn find_similar(&self, candidate: &str) -> Vec<Suggestion> {
        let normalized = self.normalize(candidate);
        self.resolver.find_similar(
            &normalized,
            self.config.suggestion_top_n,
            self.config.suggestion_min_score,
        )
    }

    /// Category for `entity` given the full description.
    #[must_use]
    pub fn determine_category(&self, entity: &Entity, full_description: &str) -> String {
        self.resolver.determine_category(entity, full_description)
    }

    pub(crate) fn annotate(&self, row: &mut Row, description_col: &str, decisions: &DecisionCache) {
        let raw = row
            .get(description_col)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let (cleaned, resolution) = self.resolve_with(&self.funnel, &raw, Some(decisions));
        write_resolution(row, cleaned, &resolution);
    }

    /// Resolves every row, adding the output columns.
    ///
    /// Rows whose description column is missing or not a string are
    /// unresolved. Each distinct normalized description reaches the
    /// generative oracle at most once per call.
    #[must_use]
    pub fn run(&self, rows: Vec<Row>, description_col: &str) -> Vec<Row> {
        let decisions = DecisionCache::new();
        rows.into_iter()
            .map(|mut row| {
                self.annotate(&mut row, description_col, &decisions);
                row
            })
            .collect()
    }

    /// Like [`run`](Self::run), spread over `workers` threads. Output order
    /// matches input order.
    #[must_use]
    pub fn run_parallel(&self, rows: Vec<Row>, description_col: &str, workers: usize) -> Vec<Row> {
        let total = rows.len();
        if workers <= 1 || total < 2 {
            return self.run(rows, description_col);
        }

        let (job_tx, job_rx) = bounded::<(usize, Row)>(workers * 2);
        let (done_tx, done_rx) = unbounded::<(usize, Row)>();
        let decisions = DecisionCache::new();

        thread::scope(|scope| {
            for _ in 0..workers.min(total) {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                let decisions = &decisions;
                scope.spawn(move || {
                    for (idx, mut row) in job_rx {
                        self.annotate(&mut row, description_col, decisions);
                        if done_tx.send((idx, row)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(done_tx);

            for job in rows.into_iter().enumerate() {
                if job_tx.send(job).is_err() {
                    break;
                }
            }
            drop(job_tx);
        });

        let mut slots: Vec<Option<Row>> = vec![None; total];
        for (idx, row) in done_rx {
            slots[idx] = Some(row);
        }
        slots.into_iter().flatten().collect()
    }

    /// Groups rows that still need review by normalized text.
    ///
    /// Never mutates the registry or memory. Rows already annotated by
    /// [`run`](Self::run) are judged by their annotation unless the registry
    /// now resolves them; other rows are evaluated without the generative
    /// stage.
    #[must_use]
    pub fn discover_entities(&self, rows: &[Row], description_col: &str) -> Vec<UnknownEntity> {
        let mut unknowns: Vec<UnknownEntity> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for row in rows {
            let raw = row
                .get(description_col)
                .and_then(Value::as_str)
                .unwrap_or_default();
            let Some(cleaned) = self.unresolved_text(row, raw) else {
                continue;
            };

            let slot = match positions.get(&cleaned) {
                Some(&slot) => slot,
                None => {
                    let best = self.resolver.find_similar(&cleaned, 1, self.config.suggestion_min_score);
                    let (suggested_name, confidence) = best
                        .into_iter()
                        .next()
                        .map_or((None, 0.0), |s| (Some(s.canonical_name), s.score));
                    unknowns.push(UnknownEntity {
                        raw: cleaned.clone(),
                        suggested_name,
                        confidence,
                        original_examples: Vec::new(),
                    });
                    positions.insert(cleaned, unknowns.len() - 1);
                    unknowns.len() - 1
                }
            };

            let examples = &mut unknowns[slot].original_examples;
            if examples.len() < self.config.max_examples && !examples.iter().any(|e| e == raw) {
                examples.push(raw.to_string());
            }
        }
        unknowns
    }

    /// Normalized text of `row` if it needs review.
    fn unresolved_text(&self, row: &Row, raw: &str) -> Option<String> {
        let annotated = row.get(columns::METHOD).is_some();
        let cleaned = match row.get(columns::CLEANED).and_then(Value::as_str) {
            Some(cleaned) if annotated => cleaned.to_string(),
            _ => self.normalize(raw),
        };
        if cleaned.is_empty() {
            return None;
        }

        if annotated {
            if self.resolver.resolve_match(&cleaned).is_some() {
                return None;
            }
            let has_entity = row
                .get(columns::ENTITY_ID)
                .is_some_and(|v| !v.is_null());
            let confidence = row
                .get(columns::CONFIDENCE)
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let needs_review = !has_entity && confidence < f64::from(self.config.review_threshold);
            return needs_review.then_some(cleaned);
        }

        let (_, resolution) = self.resolve_with(&self.preview, raw, None);
        resolution
            .needs_review(self.config.review_threshold)
            .then_some(cleaned)
    }

    /// Records confirmed knowledge: creates or updates entity `name`.
    ///
    /// A `None` category keeps an existing entity's category. The new entity
    /// applies to every later resolution.
    pub fn register_entity(
        &self,
        name: &str,
        category: Option<&str>,
        alias: Option<&str>,
    ) -> EngineResult<Entity> {
        let aliases: Vec<&str> = alias.into_iter().collect();
        Ok(self.registry.register(name, category, &aliases)?)
    }

    /// Adds a context rule to an existing entity.
    pub fn add_context_rule(&self, entity_name: &str, keyword: &str, category: &str) -> EngineResult<Entity> {
        self.registry.add_context_rule(entity_name, keyword, category)
    }

    /// Starts an interactive review session over `rows`.
    #[must_use]
    pub fn run_interactive(
        &self,
        rows: Vec<Row>,
        description_col: &str,
        batch_size: usize,
    ) -> InteractiveSession<'_> {
        InteractiveSession::new(self, rows, description_col, batch_size)
    }
}

fn write_resolution(row: &mut Row, cleaned: String, resolution: &Resolution) {
    let optional = |value: Option<String>| value.map_or(Value::Null, Value::String);
    let confidence = (f64::from(resolution.confidence) * 10_000.0).round() / 10_000.0;

    row.insert(columns::CLEANED.to_string(), Value::String(cleaned));
    row.insert(
        columns::ENTITY.to_string(),
        optional(resolution.entity_name.clone()),
    );
    row.insert(
        columns::ENTITY_ID.to_string(),
        optional(resolution.entity_id.as_ref().map(ToString::to_string)),
    );
    row.insert(
        columns::CATEGORY.to_string(),
        Value::String(resolution.category.clone()),
    );
    row.insert(columns::CONFIDENCE.to_string(), Value::from(confidence));
    row.insert(
        columns::METHOD.to_string(),
        Value::String(resolution.method.to_string()),
    );
}
