//! Generative fallback: last-resort classification through an external oracle.
//!
//! The oracle is a [`Classifier`] supplied by the host. It receives the
//! description and the categories already in use, and answers with exactly one
//! category. Failures never escape: after the retry budget is spent the
//! fallback answers [`UNCATEGORIZED`].
//!
//! Hosts wiring an LLM can use [`system_prompt`] and [`parse_decision`] to
//! build the request and read a structured [`CategorizationDecision`] reply.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entity::UNCATEGORIZED;
use crate::error::{retry_oracle, OracleError};

/// External classification oracle.
///
/// Implementations own their transport timeout.
pub trait Classifier: Send + Sync {
    /// Returns one category for `description`, preferring one of `known_categories`.
    fn classify(&self, description: &str, known_categories: &[String]) -> Result<String, OracleError>;
}

/// Structured reply expected from an LLM-backed classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorizationDecision {
    /// Short explanation of the choice.
    #[serde(default)]
    pub reasoning: String,
    /// Selected or newly created category.
    pub category: String,
}

/// Renders the categorizer system prompt for the given known categories.
#[must_use]
pub fn system_prompt(known_categories: &[String]) -> String {
    let existing = if known_categories.is_empty() {
        "(none yet)".to_string()
    } else {
        known_categories.join(", ")
    };
    format!(
        "You are a financial transaction categorizer.\n\
         Classify the bank transaction description given by the user into exactly one category.\n\
         Existing categories: {existing}\n\
         Rules:\n\
         - Reuse an existing category whenever one fits.\n\
         - Otherwise create a new hierarchical category such as \"Expenses:Travel:Flights\".\n\
         - If the description cannot be classified, answer \"{UNCATEGORIZED}\".\n\
         Reply with a JSON object: {{\"reasoning\": \"<one sentence>\", \"category\": \"<category>\"}}"
    )
}

/// Parses an LLM reply into a decision.
///
/// Accepts a bare JSON object, a fenced code block, or an object embedded in
/// surrounding prose.
pub fn parse_decision(raw: &str) -> Result<CategorizationDecision, OracleError> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => {
            return Err(OracleError::InvalidResponse(
                "reply contains no JSON object".to_string(),
            ))
        }
    };

    let mut decision: CategorizationDecision = serde_json::from_str(json)
        .map_err(|e| OracleError::InvalidResponse(e.to_string()))?;
    decision.category = decision.category.trim().to_string();
    if decision.category.is_empty() {
        return Err(OracleError::InvalidResponse("empty category".to_string()));
    }
    Ok(decision)
}

/// Bounded-retry adapter over a [`Classifier`].
#[derive(Clone)]
pub struct GenerativeFallback {
    classifier: Arc<dyn Classifier>,
    retries: u32,
}

impl fmt::Debug for GenerativeFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerativeFallback")
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

impl GenerativeFallback {
    /// Wraps `classifier`, allowing `retries` extra attempts after a failure.
    #[must_use]
    pub fn new(classifier: Arc<dyn Classifier>, retries: u32) -> Self {
        Self {
            classifier,
            retries,
        }
    }

    /// Classifies `description`. Always returns a category; failures and
    /// blank answers yield [`UNCATEGORIZED`].
    #[must_use]
    pub fn classify(&self, description: &str, known_categories: &[String]) -> String {
        if description.trim().is_empty() {
            return UNCATEGORIZED.to_string();
        }

        tracing::debug!(description = %description, known = known_categories.len(), "asking classifier");
        match retry_oracle(self.retries, || {
            self.classifier.classify(description, known_categories)
        }) {
            Ok(category) => {
                let category = category.trim();
                if category.is_empty() {
                    UNCATEGORIZED.to_string()
                } else {
                    category.to_string()
                }
            }
            Err(e) => {
                tracing::warn!(
                    description = %description,
                    attempts = self.retries + 1,
                    error = %e,
                    "classifier failed; using sentinel category"
                );
                UNCATEGORIZED.to_string()
            }
        }
    }
}

/// Classifier that never answers; every description becomes [`UNCATEGORIZED`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoClassifier;

impl Classifier for NoClassifier {
    fn classify(&self, _description: &str, _known: &[String]) -> Result<String, OracleError> {
        Ok(UNCATEGORIZED.to_string())
    }
}
