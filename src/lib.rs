//! # merchant-resolve - Merchant Entity Resolution & Self-Healing Categorization
//!
//! Resolves free-text bank transaction descriptions to canonical merchants
//! ("entities") and spending categories, and learns from corrections.
//!
//! ## Core Concepts
//!
//! - **Entity**: A canonical merchant with aliases, a default category, and context rules
//! - **Funnel**: Ordered resolution stages: rules, registry (exact/substring/fuzzy), semantic memory, generative fallback
//! - **Self-healing**: Generative decisions are cached in semantic memory so identical input skips the oracle next time
//! - **Review**: Unresolved items are grouped with suggestions; confirmed entities apply to every later resolution
//!
//! ## Usage
//!
//! ```rust
//! use merchant_resolve::{CategorizationOrchestrator, EngineConfig, Method};
//!
//! let engine = CategorizationOrchestrator::builder(EngineConfig::in_memory()).build()?;
//! engine.register_entity("NS Groep", Some("Expenses:Transport:Train"), Some("ns groep"))?;
//!
//! let resolution = engine.resolve("Train ticket NS Groep Amsterdam 12-05-2024");
//! assert_eq!(resolution.entity_name.as_deref(), Some("NS Groep"));
//! assert_eq!(resolution.method, Method::Substring);
//! # Ok::<(), merchant_resolve::EngineError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod entity;
pub mod error;

// Text processing and scoring
pub mod embedding;
pub mod normalize;
pub mod rules;
pub mod similarity;

// Knowledge stores
pub mod memory;
pub mod registry;
pub mod storage;

// Resolution
pub mod fallback;
pub mod funnel;
pub mod interactive;
pub mod orchestrator;
pub mod resolver;

pub use config::EngineConfig;
pub use embedding::{Embedder, LexicalEmbedder};
pub use entity::{ContextRule, Entity, EntityId, UNCATEGORIZED};
pub use error::{EngineError, EngineResult, OracleError, StoreError, ValidationError};
pub use fallback::{
    parse_decision, system_prompt, CategorizationDecision, Classifier, GenerativeFallback,
    NoClassifier,
};
pub use funnel::{DecisionCache, Funnel, Method, Resolution, ResolutionStage, StageInput};
pub use interactive::{InteractiveSession, ReviewBatch};
pub use memory::{BestMatch, MemoryEntry, SemanticMemory};
pub use normalize::{normalize, NoiseSet, TextNormalizer};
pub use orchestrator::{CategorizationOrchestrator, OrchestratorBuilder, Row, UnknownEntity};
pub use registry::EntityRegistry;
pub use resolver::{EntityMatch, EntityResolver, MatchKind, Suggestion};
pub use rules::{KeywordRule, RuleTable};
