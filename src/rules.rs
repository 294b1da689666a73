//! Deterministic keyword rules.
//!
//! A rule hit is authoritative and short-circuits the funnel. Rules are
//! evaluated in declaration order and the first keyword contained in the
//! normalized text wins, so the outcome is stable across runs.

use serde::{Deserialize, Serialize};

use crate::normalize::alias_key;

/// A keyword → category mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    /// Substring searched for in the normalized description.
    pub keyword: String,
    /// Category assigned on a hit.
    pub category: String,
}

impl KeywordRule {
    /// Creates a new rule.
    #[must_use]
    pub fn new(keyword: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            category: category.into(),
        }
    }
}

/// Built-in rules, in evaluation order.
///
/// Rules run before the registry, so a keyword here shadows any registered
/// entity whose alias contains it, context rules included: with the default
/// table "albert heijn" is always `Expenses:Groceries` with no entity. Hosts
/// that register such merchants drop the keyword from `EngineConfig::rules`.
pub const DEFAULT_RULES: &[(&str, &str)] = &[
    ("hypotheek", "Expenses:Housing:Mortgage"),
    ("albert heijn", "Expenses:Groceries"),
    ("netflix", "Expenses:Subscriptions"),
    ("spotify", "Expenses:Subscriptions"),
    ("belastingdienst", "Expenses:Taxes"),
    ("zorgverzekering", "Expenses:Insurance:Health"),
    ("salaris", "Income:Salary"),
];

/// Returns the built-in rules as owned values.
#[must_use]
pub fn default_rules() -> Vec<KeywordRule> {
    DEFAULT_RULES
        .iter()
        .map(|(keyword, category)| KeywordRule::new(*keyword, *category))
        .collect()
}

/// Ordered substring → category table.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<KeywordRule>,
}

impl RuleTable {
    /// Builds a table. Keywords are normalized the same way descriptions are;
    /// rules whose keyword or category is blank are skipped.
    #[must_use]
    pub fn new(rules: impl IntoIterator<Item = KeywordRule>) -> Self {
        let rules = rules
            .into_iter()
            .filter_map(|rule| {
                let keyword = alias_key(&rule.keyword);
                let category = rule.category.trim().to_string();
                (!keyword.is_empty() && !category.is_empty())
                    .then(|| KeywordRule::new(keyword, category))
            })
            .collect();
        Self { rules }
    }

    /// Table with the built-in rules.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new(default_rules())
    }

    /// Returns the category of the first rule whose keyword occurs in `normalized_text`.
    #[must_use]
    pub fn lookup(&self, normalized_text: &str) -> Option<&str> {
        self.matching_rule(normalized_text)
            .map(|rule| rule.category.as_str())
    }

    /// Returns the first rule whose keyword occurs in `normalized_text`.
    #[must_use]
    pub fn matching_rule(&self, normalized_text: &str) -> Option<&KeywordRule> {
        if normalized_text.is_empty() {
            return None;
        }
        self.rules
            .iter()
            .find(|rule| normalized_text.contains(rule.keyword.as_str()))
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if the table has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
