//! Engine configuration.
//!
//! [`EngineConfig`] is passed explicitly to the orchestrator, which owns the
//! registry and memory built from it. Loading it from a file is up to the host;
//! every field has a default so partial documents deserialize.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::normalize::BANKING_NOISE;
use crate::rules::{default_rules, KeywordRule};

/// Categories the semantic memory is seeded with on first use.
pub const DEFAULT_SEED_CATEGORIES: &[&str] = &[
    "Expenses:Groceries",
    "Expenses:Dining",
    "Expenses:Transport",
    "Expenses:Travel",
    "Expenses:Utilities",
    "Expenses:Housing:Rent",
    "Expenses:Housing:Mortgage",
    "Expenses:Insurance",
    "Expenses:Insurance:Health",
    "Expenses:Subscriptions",
    "Expenses:Shopping",
    "Expenses:Entertainment",
    "Expenses:Healthcare",
    "Expenses:Education",
    "Expenses:Taxes",
    "Expenses:Fees",
    "Expenses:Personal",
    "Income:Salary",
    "Income:Refunds",
    "Income:Interest",
    "Transfers",
];

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the registry and memory documents. `None` keeps
    /// everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Registry file name inside `data_dir`.
    pub registry_file: String,
    /// Semantic memory file name inside `data_dir`.
    pub memory_file: String,
    /// Minimum token-sort ratio for a fuzzy registry match.
    pub fuzzy_threshold: f32,
    /// Minimum cosine similarity for a memory match.
    pub similarity_threshold: f32,
    /// Minimum score for a human-facing suggestion.
    pub suggestion_min_score: f32,
    /// Maximum number of suggestions returned by `find_similar`.
    pub suggestion_top_n: usize,
    /// Rows without an entity and below this confidence need review.
    pub review_threshold: f32,
    /// Confidence reported for generative decisions.
    pub generative_confidence: f32,
    /// Retries after a failed oracle call.
    pub oracle_retries: u32,
    /// Original descriptions kept per discovered unknown.
    pub max_examples: usize,
    /// Whole-word noise tokens stripped by the normalizer.
    pub noise_words: Vec<String>,
    /// Categories the semantic memory is seeded with.
    pub seed_categories: Vec<String>,
    /// Keyword rules, in evaluation order.
    pub rules: Vec<KeywordRule>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            registry_file: "merchants.json".to_string(),
            memory_file: "category_memory.json".to_string(),
            fuzzy_threshold: 0.85,
            similarity_threshold: 0.85,
            suggestion_min_score: 0.6,
            suggestion_top_n: 3,
            review_threshold: 0.85,
            generative_confidence: 0.5,
            oracle_retries: 1,
            max_examples: 3,
            noise_words: BANKING_NOISE.iter().map(|w| (*w).to_string()).collect(),
            seed_categories: DEFAULT_SEED_CATEGORIES
                .iter()
                .map(|c| (*c).to_string())
                .collect(),
            rules: default_rules(),
        }
    }
}

impl EngineConfig {
    /// Most retries allowed after a failed oracle call.
    pub const MAX_ORACLE_RETRIES: u32 = 3;

    /// In-memory configuration with defaults.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Default configuration persisting under `data_dir`.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Self::default()
        }
    }

    /// Validates ranges and file names.
    pub fn validate(self) -> Result<Self, ValidationError> {
        for (field, value) in [
            ("fuzzy_threshold", self.fuzzy_threshold),
            ("similarity_threshold", self.similarity_threshold),
            ("suggestion_min_score", self.suggestion_min_score),
            ("review_threshold", self.review_threshold),
            ("generative_confidence", self.generative_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ValidationError::ThresholdOutOfRange { field, value });
            }
        }

        if self.oracle_retries > Self::MAX_ORACLE_RETRIES {
            return Err(ValidationError::InvalidConfig {
                field: "oracle_retries",
                reason: format!(
                    "must be at most {} (got {})",
                    Self::MAX_ORACLE_RETRIES,
                    self.oracle_retries
                ),
            });
        }

        if self.suggestion_top_n == 0 {
            return Err(ValidationError::InvalidConfig {
                field: "suggestion_top_n",
                reason: "must be at least 1".to_string(),
            });
        }

        for (field, name) in [
            ("registry_file", &self.registry_file),
            ("memory_file", &self.memory_file),
        ] {
            if name.trim().is_empty() {
                return Err(ValidationError::InvalidConfig {
                    field,
                    reason: "file name cannot be empty".to_string(),
                });
            }
        }

        if self.data_dir.is_some() && self.registry_file.trim() == self.memory_file.trim() {
            return Err(ValidationError::InvalidConfig {
                field: "memory_file",
                reason: "must differ from registry_file".to_string(),
            });
        }

        Ok(self)
    }

    /// Registry document path, if persistent.
    #[must_use]
    pub fn registry_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(&self.registry_file))
    }

    /// Memory document path, if persistent.
    #[must_use]
    pub fn memory_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(&self.memory_file))
    }
}
