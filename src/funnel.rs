//! The resolution funnel.
//!
//! An ordered chain of [`ResolutionStage`]s. Each stage either resolves the
//! input or passes; the first `Some` wins. The default chain is
//! rules → registry → memory → generative, and the generative stage always
//! answers, so the funnel terminates with a category.

use std::cell::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, UNCATEGORIZED};
use crate::fallback::GenerativeFallback;
use crate::memory::SemanticMemory;
use crate::registry::EntityRegistry;
use crate::resolver::{EntityResolver, MatchKind};
use crate::rules::RuleTable;

/// How a description was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Keyword rule hit.
    Rule,
    /// Exact alias match.
    Exact,
    /// Whole-word alias substring.
    Substring,
    /// Fuzzy alias match.
    Fuzzy,
    /// Semantic memory match.
    Vector,
    /// Generative fallback decision.
    Generative,
    /// Not resolved.
    None,
}

impl Method {
    /// Lowercase name, as written to output rows.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Exact => "exact",
            Self::Substring => "substring",
            Self::Fuzzy => "fuzzy",
            Self::Vector => "vector",
            Self::Generative => "generative",
            Self::None => "none",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MatchKind> for Method {
    fn from(kind: MatchKind) -> Self {
        match kind {
            MatchKind::Exact => Self::Exact,
            MatchKind::Substring => Self::Substring,
            MatchKind::Fuzzy => Self::Fuzzy,
        }
    }
}

/// Outcome of resolving one description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Matched entity, if a registry stage resolved it.
    pub entity_id: Option<EntityId>,
    /// Display name of the matched entity.
    pub entity_name: Option<String>,
    /// Assigned category; [`UNCATEGORIZED`] when nothing fit.
    pub category: String,
    /// Match strength in `[0, 1]`.
    pub confidence: f32,
    /// Stage that produced the outcome.
    pub method: Method,
}

impl Resolution {
    /// The terminal "nothing matched" outcome.
    #[must_use]
    pub fn unresolved() -> Self {
        Self {
            entity_id: None,
            entity_name: None,
            category: UNCATEGORIZED.to_string(),
            confidence: 0.0,
            method: Method::None,
        }
    }

    /// Outcome without an entity.
    #[must_use]
    pub fn categorized(category: impl Into<String>, confidence: f32, method: Method) -> Self {
        Self {
            entity_id: None,
            entity_name: None,
            category: category.into(),
            confidence,
            method,
        }
    }

    /// True if no entity matched and confidence is below `threshold`.
    #[must_use]
    pub fn needs_review(&self, threshold: f32) -> bool {
        self.entity_id.is_none() && self.confidence < threshold
    }

    /// True if the category is the sentinel.
    #[must_use]
    pub fn is_uncategorized(&self) -> bool {
        self.category == UNCATEGORIZED
    }
}

/// Generative decisions made during one run, keyed by normalized text.
///
/// Sentinel answers are kept as well, so while a cache lives each distinct
/// text reaches the oracle at most once. Workers asking for a text that is
/// being decided wait for that decision; other texts proceed in parallel.
#[derive(Debug, Default)]
pub struct DecisionCache {
    slots: Mutex<HashMap<String, Arc<OnceLock<Resolution>>>>,
}

impl DecisionCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<OnceLock<Resolution>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.to_string()).or_default().clone()
    }

    /// Decision recorded for `normalized`, if any.
    #[must_use]
    pub fn get(&self, normalized: &str) -> Option<Resolution> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(normalized).and_then(|slot| slot.get().cloned())
    }

    /// Number of recorded decisions.
    #[must_use]
    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|slot| slot.get().is_some()).count()
    }

    /// True if nothing has been decided yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One description on its way through the funnel.
///
/// The embedding is computed at most once and shared by later stages.
#[derive(Debug)]
pub struct StageInput<'a> {
    raw: &'a str,
    normalized: String,
    embedding: OnceCell<Option<Vec<f32>>>,
    decisions: Option<&'a DecisionCache>,
}

impl<'a> StageInput<'a> {
    /// Wraps a raw description and its normalized form.
    #[must_use]
    pub fn new(raw: &'a str, normalized: String) -> Self {
        Self {
            raw,
            normalized,
            embedding: OnceCell::new(),
            decisions: None,
        }
    }

    /// Shares generative decisions through `decisions`.
    #[must_use]
    pub fn with_decisions(mut self, decisions: &'a DecisionCache) -> Self {
        self.decisions = Some(decisions);
        self
    }

    /// Run-scoped decision cache, if any.
    #[must_use]
    pub fn decisions(&self) -> Option<&'a DecisionCache> {
        self.decisions
    }

    /// Original description.
    #[must_use]
    pub fn raw(&self) -> &str {
        self.raw
    }

    /// Normalized description.
    #[must_use]
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Embedding of the normalized text, computed on first use.
    pub fn embedding(&self, memory: &SemanticMemory) -> Option<&[f32]> {
        self.embedding
            .get_or_init(|| memory.embed(&self.normalized))
            .as_deref()
    }
}

/// A step in the funnel.
pub trait ResolutionStage: Send + Sync {
    /// Stage name for logs.
    fn name(&self) -> &'static str;

    /// Resolves `input`, or passes with `None`.
    fn try_resolve(&self, input: &StageInput<'_>) -> Option<Resolution>;
}

/// Deterministic keyword rules.
#[derive(Debug, Clone)]
pub struct RuleStage {
    rules: RuleTable,
}

impl RuleStage {
    /// Stage over `rules`.
    #[must_use]
    pub fn new(rules: RuleTable) -> Self {
        Self { rules }
    }
}

impl ResolutionStage for RuleStage {
    fn name(&self) -> &'static str {
        "rules"
    }

    fn try_resolve(&self, input: &StageInput<'_>) -> Option<Resolution> {
        let rule = self.rules.matching_rule(input.normalized())?;
        tracing::debug!(keyword = %rule.keyword, category = %rule.category, "rule hit");
        Some(Resolution::categorized(rule.category.clone(), 1.0, Method::Rule))
    }
}

/// Exact, substring, and fuzzy registry lookup.
#[derive(Debug, Clone)]
pub struct RegistryStage {
    resolver: EntityResolver,
}

impl RegistryStage {
    /// Stage over `resolver`.
    #[must_use]
    pub fn new(resolver: EntityResolver) -> Self {
        Self { resolver }
    }
}

impl ResolutionStage for RegistryStage {
    fn name(&self) -> &'static str {
        "registry"
    }

    fn try_resolve(&self, input: &StageInput<'_>) -> Option<Resolution> {
        let m = self.resolver.resolve_match(input.normalized())?;
        let category = self.resolver.determine_category(&m.entity, input.raw());
        Some(Resolution {
            entity_id: Some(m.entity.id),
            entity_name: Some(m.entity.canonical_name),
            category,
            confidence: m.score,
            method: m.kind.into(),
        })
    }
}

/// Semantic memory lookup.
#[derive(Debug, Clone)]
pub struct MemoryStage {
    memory: Arc<SemanticMemory>,
    threshold: f32,
}

impl MemoryStage {
    /// Accepts memory matches scoring at least `threshold`.
    #[must_use]
    pub fn new(memory: Arc<SemanticMemory>, threshold: f32) -> Self {
        Self { memory, threshold }
    }
}

impl ResolutionStage for MemoryStage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn try_resolve(&self, input: &StageInput<'_>) -> Option<Resolution> {
        let embedding = input.embedding(&self.memory)?;
        let best = self.memory.best_match(embedding);
        match best.accepted(self.threshold) {
            Some(category) => {
                tracing::debug!(category = %category, score = best.score, "memory hit");
                Some(Resolution::categorized(category, best.score, Method::Vector))
            }
            None => {
                tracing::debug!(best = ?best.category, score = best.score, "memory miss");
                None
            }
        }
    }
}

/// Generative fallback with self-healing.
///
/// The oracle is called without holding any lock. Learning is serialized:
/// the worker holding the gate re-checks memory before writing, so
/// concurrent workers never learn the same text twice.
pub struct GenerativeStage {
    fallback: GenerativeFallback,
    memory: Arc<SemanticMemory>,
    registry: Arc<EntityRegistry>,
    threshold: f32,
    confidence: f32,
    gate: Mutex<()>,
}

impl fmt::Debug for GenerativeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerativeStage")
            .field("fallback", &self.fallback)
            .field("threshold", &self.threshold)
            .field("confidence", &self.confidence)
            .finish_non_exhaustive()
    }
}

impl GenerativeStage {
    /// Creates the stage. `threshold` is the memory acceptance threshold used
    /// for the re-check; `confidence` is reported for oracle decisions.
    #[must_use]
    pub fn new(
        fallback: GenerativeFallback,
        memory: Arc<SemanticMemory>,
        registry: Arc<EntityRegistry>,
        threshold: f32,
        confidence: f32,
    ) -> Self {
        Self {
            fallback,
            memory,
            registry,
            threshold,
            confidence,
            gate: Mutex::new(()),
        }
    }

    /// Registry and memory categories, sorted.
    #[must_use]
    pub fn known_categories(&self) -> Vec<String> {
        let mut known = self.registry.all_categories();
        known.extend(self.memory.known_categories());
        known.into_iter().collect()
    }
}

impl ResolutionStage for GenerativeStage {
    fn name(&self) -> &'static str {
        "generative"
    }

    fn try_resolve(&self, input: &StageInput<'_>) -> Option<Resolution> {
        let Some(decisions) = input.decisions() else {
            return Some(self.decide(input));
        };
        let slot = decisions.slot(input.normalized());
        Some(slot.get_or_init(|| self.decide(input)).clone())
    }
}

impl GenerativeStage {
    fn decide(&self, input: &StageInput<'_>) -> Resolution {
        let embedding = input.embedding(&self.memory);
        if let Some(hit) = self.recall(embedding) {
            return hit;
        }

        let known = self.known_categories();
        let category = self.fallback.classify(input.normalized(), &known);
        if category == UNCATEGORIZED {
            return Resolution::categorized(category, 0.0, Method::Generative);
        }

        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        // Another worker may have learned this text while the oracle answered.
        if let Some(hit) = self.recall(embedding) {
            return hit;
        }

        let learned = match embedding {
            Some(embedding) => {
                self.memory
                    .learn_embedded(input.normalized(), embedding.to_vec(), &category)
            }
            None => self.memory.learn(input.normalized(), &category),
        };
        if !learned {
            tracing::warn!(text = %input.normalized(), category = %category, "decision not remembered");
        }

        Resolution::categorized(category, self.confidence, Method::Generative)
    }

    fn recall(&self, embedding: Option<&[f32]>) -> Option<Resolution> {
        let best = self.memory.best_match(embedding?);
        best.accepted(self.threshold)
            .map(|category| Resolution::categorized(category, best.score, Method::Vector))
    }
}

/// Ordered chain of stages.
pub struct Funnel {
    stages: Vec<Box<dyn ResolutionStage>>,
}

impl fmt::Debug for Funnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Funnel")
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl Funnel {
    /// Funnel running `stages` in order.
    #[must_use]
    pub fn new(stages: Vec<Box<dyn ResolutionStage>>) -> Self {
        Self { stages }
    }

    /// Stage names in evaluation order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs the stages until one resolves `input`.
    #[must_use]
    pub fn resolve(&self, input: &StageInput<'_>) -> Resolution {
        for stage in &self.stages {
            if let Some(resolution) = stage.try_resolve(input) {
                tracing::debug!(
                    stage = stage.name(),
                    method = %resolution.method,
                    category = %resolution.category,
                    "resolved"
                );
                return resolution;
            }
        }
        Resolution::unresolved()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::LexicalEmbedder;
    use crate::error::OracleError;
    use crate::fallback::Classifier;
    use crate::rules::KeywordRule;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        answer: &'static str,
        calls: AtomicUsize,
    }

    impl Classifier for Fixed {
        fn classify(&self, _d: &str, _known: &[String]) -> Result<String, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.to_string())
        }
    }

    struct Never;

    impl ResolutionStage for Never {
        fn name(&self) -> &'static str {
            "never"
        }

        fn try_resolve(&self, _input: &StageInput<'_>) -> Option<Resolution> {
            None
        }
    }

    fn boxed(stage: impl ResolutionStage + 'static) -> Box<dyn ResolutionStage> {
        Box::new(stage)
    }

    fn memory() -> Arc<SemanticMemory> {
        Arc::new(SemanticMemory::in_memory(
            Arc::new(LexicalEmbedder::default()),
            &["Expenses:Groceries".to_string()],
            0,
        ))
    }

    #[test]
    fn empty_chain_is_unresolved() {
        let funnel = Funnel::new(vec![boxed(Never)]);
        let r = funnel.resolve(&StageInput::new("x", "x".to_string()));
        assert_eq!(r, Resolution::unresolved());
        assert!(r.needs_review(0.85));
    }

    #[test]
    fn first_stage_wins() {
        let rules = RuleTable::new([KeywordRule::new("netflix", "Expenses:Subscriptions")]);
        let funnel = Funnel::new(vec![
            boxed(Never),
            boxed(RuleStage::new(rules)),
            boxed(RuleStage::new(RuleTable::new([KeywordRule::new("netflix", "Other")]))),
        ]);
        let r = funnel.resolve(&StageInput::new("NETFLIX.COM", "netflixcom netflix".to_string()));
        assert_eq!(r.category, "Expenses:Subscriptions");
        assert_eq!(r.method, Method::Rule);
        assert_eq!(funnel.stage_names(), vec!["never", "rules", "rules"]);
    }

    #[test]
    fn generative_learns_then_memory_answers() {
        let memory = memory();
        let oracle = Arc::new(Fixed {
            answer: "Expenses:Business:Services",
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(EntityRegistry::in_memory());
        let funnel = Funnel::new(vec![
            boxed(MemoryStage::new(memory.clone(), 0.85)),
            boxed(GenerativeStage::new(
                GenerativeFallback::new(oracle.clone(), 0),
                memory.clone(),
                registry,
                0.85,
                0.5,
            )),
        ]);

        let first = funnel.resolve(&StageInput::new("Konijnenburg BV", "konijnenburg bv".to_string()));
        assert_eq!(first.method, Method::Generative);
        assert_eq!(first.confidence, 0.5);

        let second = funnel.resolve(&StageInput::new("Konijnenburg BV", "konijnenburg bv".to_string()));
        assert_eq!(second.method, Method::Vector);
        assert_eq!(second.category, "Expenses:Business:Services");
        assert!(second.confidence > 0.99);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sentinel_decision_is_not_learned() {
        let memory = memory();
        let before = memory.len();
        let stage = GenerativeStage::new(
            GenerativeFallback::new(
                Arc::new(Fixed {
                    answer: UNCATEGORIZED,
                    calls: AtomicUsize::new(0),
                }),
                0,
            ),
            memory.clone(),
            Arc::new(EntityRegistry::in_memory()),
            0.85,
            0.5,
        );
        let r = stage
            .try_resolve(&StageInput::new("???", "mystery".to_string()))
            .unwrap();
        assert!(r.is_uncategorized());
        assert_eq!(r.confidence, 0.0);
        assert_eq!(memory.len(), before);
    }

    #[test]
    fn decision_cache_asks_oracle_once_per_text() {
        let memory = memory();
        let oracle = Arc::new(Fixed {
            answer: UNCATEGORIZED,
            calls: AtomicUsize::new(0),
        });
        let stage = GenerativeStage::new(
            GenerativeFallback::new(oracle.clone(), 1),
            memory,
            Arc::new(EntityRegistry::in_memory()),
            0.85,
            0.5,
        );

        let decisions = DecisionCache::new();
        for _ in 0..4 {
            let input = StageInput::new("Mystery Vendor", "mystery vendor".to_string())
                .with_decisions(&decisions);
            assert!(stage.try_resolve(&input).unwrap().is_uncategorized());
        }
        let other = StageInput::new("Other Vendor", "other vendor".to_string()).with_decisions(&decisions);
        let _ = stage.try_resolve(&other);

        assert_eq!(oracle.calls.load(Ordering::SeqCst), 2);
        assert_eq!(decisions.len(), 2);
        assert!(decisions.get("mystery vendor").unwrap().is_uncategorized());

        // Without a cache every call reaches the oracle.
        let _ = stage.try_resolve(&StageInput::new("Mystery Vendor", "mystery vendor".to_string()));
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn oracle_calls_overlap_across_threads() {
        use std::time::Duration;

        #[derive(Default)]
        struct Slow {
            in_flight: AtomicUsize,
            peak: AtomicUsize,
        }

        impl Classifier for Slow {
            fn classify(&self, _d: &str, _known: &[String]) -> Result<String, OracleError> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok("Expenses:Misc".to_string())
            }
        }

        let memory = memory();
        let oracle = Arc::new(Slow::default());
        let stage = GenerativeStage::new(
            GenerativeFallback::new(oracle.clone(), 0),
            memory.clone(),
            Arc::new(EntityRegistry::in_memory()),
            0.85,
            0.5,
        );
        let decisions = DecisionCache::new();
        let before = memory.len();

        std::thread::scope(|scope| {
            for (raw, normalized) in [("Alpha Fietsen", "alpha fietsen"), ("Zeta Bakkerij", "zeta bakkerij")] {
                let stage = &stage;
                let decisions = &decisions;
                scope.spawn(move || {
                    let input = StageInput::new(raw, normalized.to_string()).with_decisions(decisions);
                    stage.try_resolve(&input)
                });
            }
        });

        assert_eq!(oracle.peak.load(Ordering::SeqCst), 2);
        assert_eq!(decisions.len(), 2);
        assert_eq!(memory.len(), before + 2);
    }

    #[test]
    fn known_categories_merge_registry_and_memory() {
        let registry = Arc::new(EntityRegistry::in_memory());
        registry.register("Shell", Some("Expenses:Transport"), &[] as &[&str]).unwrap();
        let stage = GenerativeStage::new(
            GenerativeFallback::new(Arc::new(crate::fallback::NoClassifier), 0),
            memory(),
            registry,
            0.85,
            0.5,
        );
        assert_eq!(
            stage.known_categories(),
            vec!["Expenses:Groceries".to_string(), "Expenses:Transport".to_string()]
        );
    }

    #[test]
    fn method_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Method::Substring).unwrap(), "\"substring\"");
        assert_eq!(Method::Vector.to_string(), "vector");
    }
}
