//! Entity types and identity management.
//!
//! An entity is a canonical real-world merchant. Every raw description that
//! resolves to a merchant resolves to exactly one entity, and the entity decides
//! the category through its context rules and default category.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category assigned when nothing better is known.
///
/// Doubles as the terminal "unknown" result of the resolution funnel.
pub const UNCATEGORIZED: &str = "Uncategorized";

/// Stable entity identifier derived from the canonical name.
///
/// The id is a slug: lowercased, trimmed, whitespace runs replaced by `_`.
/// Once created, an `EntityId` never changes.
///
/// # Examples
///
/// ```
/// use merchant_resolve::EntityId;
///
/// let id = EntityId::from_name("Albert Heijn");
/// assert_eq!(id.as_str(), "albert_heijn");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Derives the slug id for a canonical name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        let slug = name
            .trim()
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_");
        Self(slug)
    }

    /// Returns the slug as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the slug is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A keyword override attached to an entity.
///
/// If the full, unnormalized description contains `keyword`
/// (case-insensitive), `category` wins over the entity default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRule {
    /// Keyword searched for in the raw description.
    #[serde(alias = "contains_keyword")]
    pub keyword: String,

    /// Category assigned when the keyword is present.
    #[serde(alias = "assign_category")]
    pub category: String,
}

impl ContextRule {
    /// Creates a new context rule.
    #[must_use]
    pub fn new(keyword: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            category: category.into(),
        }
    }

    /// Returns true if this rule applies to the given raw description.
    #[must_use]
    pub fn matches(&self, description: &str) -> bool {
        let keyword = self.keyword.trim().to_lowercase();
        !keyword.is_empty() && description.to_lowercase().contains(&keyword)
    }
}

/// A canonical merchant.
///
/// # Examples
///
/// ```
/// use merchant_resolve::Entity;
///
/// let entity = Entity::new("Albert Heijn", Some("Groceries"));
/// assert_eq!(entity.id.as_str(), "albert_heijn");
/// assert!(entity.has_alias("ALBERT HEIJN"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Slug identifier.
    pub id: EntityId,

    /// Display name.
    pub canonical_name: String,

    /// Raw strings known to refer to this entity. Always contains the canonical name.
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Category used when no context rule matches.
    #[serde(default = "default_category")]
    pub default_category: String,

    /// Ordered keyword overrides; first match wins.
    #[serde(default, alias = "rules")]
    pub context_rules: Vec<ContextRule>,

    /// When the entity was first registered.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    /// When the entity was last modified.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_category() -> String {
    UNCATEGORIZED.to_string()
}

impl Entity {
    /// Creates a new entity. A `None` category defaults to [`UNCATEGORIZED`].
    #[must_use]
    pub fn new(name: impl Into<String>, category: Option<&str>) -> Self {
        let canonical_name = name.into().trim().to_string();
        let now = Utc::now();
        Self {
            id: EntityId::from_name(&canonical_name),
            aliases: vec![canonical_name.clone()],
            canonical_name,
            default_category: category.map_or_else(default_category, str::to_string),
            context_rules: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if `alias` is already known (case-insensitive).
    #[must_use]
    pub fn has_alias(&self, alias: &str) -> bool {
        let alias = alias.trim().to_lowercase();
        self.aliases.iter().any(|a| a.trim().to_lowercase() == alias)
    }

    /// Adds an alias if not already present. Returns true if it was added.
    pub fn add_alias(&mut self, alias: impl Into<String>) -> bool {
        let alias = alias.into();
        let alias = alias.trim();
        if alias.is_empty() || self.has_alias(alias) {
            return false;
        }
        self.aliases.push(alias.to_string());
        self.touch();
        true
    }

    /// Removes an alias (case-insensitive). The canonical name is never removed.
    pub fn remove_alias(&mut self, alias: &str) -> bool {
        let alias = alias.trim().to_lowercase();
        if self.canonical_name.to_lowercase() == alias {
            return false;
        }
        let before = self.aliases.len();
        self.aliases.retain(|a| a.trim().to_lowercase() != alias);
        let removed = self.aliases.len() != before;
        if removed {
            self.touch();
        }
        removed
    }

    /// Appends a context rule, preserving registration order.
    pub fn add_context_rule(&mut self, rule: ContextRule) {
        self.context_rules.push(rule);
        self.touch();
    }

    /// Returns the category for a raw description: first matching context
    /// rule, otherwise the default category.
    #[must_use]
    pub fn category_for(&self, description: &str) -> &str {
        self.context_rules
            .iter()
            .find(|rule| rule.matches(description))
            .map_or(self.default_category.as_str(), |rule| rule.category.as_str())
    }

    /// Ensures the canonical name is listed among the aliases.
    pub(crate) fn ensure_canonical_alias(&mut self) {
        if !self.has_alias(&self.canonical_name) {
            let name = self.canonical_name.clone();
            self.aliases.insert(0, name);
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entity {}

impl std::hash::Hash for Entity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
