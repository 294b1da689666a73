//! Tiered entity resolution against the registry.
//!
//! Precedence is exact alias, then whole-word substring (longest alias wins),
//! then fuzzy token-sort ratio gated by a threshold. Review suggestions rank
//! by the more lenient token-set ratio. Candidates and aliases are compared in
//! their normalized form.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::entity::{Entity, EntityId};
use crate::normalize::alias_key;
use crate::registry::EntityRegistry;
use crate::similarity::{token_set_ratio, token_sort_ratio};

/// Confidence reported for a whole-word substring match.
pub const SUBSTRING_CONFIDENCE: f32 = 0.95;

/// Which resolver tier produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchKind {
    /// Candidate equals a known alias.
    Exact,
    /// A known alias occurs as whole words inside the candidate.
    Substring,
    /// A known alias is similar enough to the candidate.
    Fuzzy,
}

/// A resolved entity with the tier and confidence of the match.
#[derive(Debug, Clone)]
pub struct EntityMatch {
    /// The matched entity.
    pub entity: Entity,
    /// Alias key that matched.
    pub alias: String,
    /// Which tier matched.
    pub kind: MatchKind,
    /// Confidence in `[0, 1]`.
    pub score: f32,
}

/// A ranked suggestion for human review.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Suggestion {
    /// Alias key that scored.
    pub alias: String,
    /// Owner of the alias.
    pub entity_id: EntityId,
    /// Display name of the owner.
    pub canonical_name: String,
    /// Fuzzy score in `[0, 1]`.
    pub score: f32,
}

/// Resolves candidate strings to registry entities.
#[derive(Debug, Clone)]
pub struct EntityResolver {
    registry: Arc<EntityRegistry>,
    fuzzy_threshold: f32,
}

impl EntityResolver {
    /// Creates a resolver over `registry`.
    #[must_use]
    pub fn new(registry: Arc<EntityRegistry>, fuzzy_threshold: f32) -> Self {
        Self {
            registry,
            fuzzy_threshold,
        }
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// Fuzzy acceptance threshold.
    #[must_use]
    pub const fn fuzzy_threshold(&self) -> f32 {
        self.fuzzy_threshold
    }

    /// Resolves `candidate` to an entity, or `None`.
    #[must_use]
    pub fn resolve(&self, candidate: &str) -> Option<Entity> {
        self.resolve_match(candidate).map(|m| m.entity)
    }

    /// Resolves `candidate`, reporting which tier matched.
    #[must_use]
    pub fn resolve_match(&self, candidate: &str) -> Option<EntityMatch> {
        let key = alias_key(candidate);
        if key.is_empty() {
            return None;
        }

        if let Some(entity) = self.registry.find_by_alias(&key) {
            return Some(EntityMatch {
                entity,
                alias: key,
                kind: MatchKind::Exact,
                score: 1.0,
            });
        }

        if let Some((alias, id)) = self.longest_substring(&key) {
            if let Some(entity) = self.registry.get(&id) {
                tracing::debug!(candidate = %key, alias = %alias, "substring match");
                return Some(EntityMatch {
                    entity,
                    alias,
                    kind: MatchKind::Substring,
                    score: SUBSTRING_CONFIDENCE,
                });
            }
        }

        let (alias, id, score) = self.best_fuzzy(&key)?;
        if score < self.fuzzy_threshold {
            tracing::debug!(candidate = %key, alias = %alias, score, "fuzzy miss");
            return None;
        }
        tracing::debug!(candidate = %key, alias = %alias, score, "fuzzy match");
        self.registry.get(&id).map(|entity| EntityMatch {
            entity,
            alias,
            kind: MatchKind::Fuzzy,
            score,
        })
    }

    fn longest_substring(&self, key: &str) -> Option<(String, EntityId)> {
        let padded = format!(" {key} ");
        self.registry.with_aliases(|index| {
            let mut best: Option<(&str, &EntityId)> = None;
            for (alias, id) in index.iter() {
                if !padded.contains(&format!(" {alias} ")) {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((current, _)) => match alias.chars().count().cmp(&current.chars().count()) {
                        Ordering::Greater => true,
                        Ordering::Equal => alias < current,
                        Ordering::Less => false,
                    },
                };
                if better {
                    best = Some((alias, id));
                }
            }
            best.map(|(alias, id)| (alias.to_string(), id.clone()))
        })
    }

    fn best_fuzzy(&self, key: &str) -> Option<(String, EntityId, f32)> {
        self.registry.with_aliases(|index| {
            let mut best: Option<(&str, &EntityId, f32)> = None;
            for (alias, id) in index.iter() {
                let score = token_sort_ratio(key, alias);
                let better = match best {
                    None => true,
                    Some((current, _, best_score)) => {
                        score > best_score || (score == best_score && alias < current)
                    }
                };
                if better {
                    best = Some((alias, id, score));
                }
            }
            best.map(|(alias, id, score)| (alias.to_string(), id.clone(), score))
        })
    }

    /// Ranked fuzzy suggestions for `candidate`, not gated by the resolution
    /// threshold. At most `top_n` entries, each scoring at least `min_score`,
    /// sorted by descending score (ties by alias).
    #[must_use]
    pub fn find_similar(&self, candidate: &str, top_n: usize, min_score: f32) -> Vec<Suggestion> {
        let key = alias_key(candidate);
        if key.is_empty() || top_n == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(String, EntityId, f32)> = self.registry.with_aliases(|index| {
            index
                .iter()
                .map(|(alias, id)| (alias, id, token_set_ratio(&key, alias)))
                .filter(|(_, _, score)| *score >= min_score)
                .map(|(alias, id, score)| (alias.to_string(), id.clone(), score))
                .collect()
        });
        scored.sort_by(|a, b| b.2.total_cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(top_n);

        scored
            .into_iter()
            .filter_map(|(alias, entity_id, score)| {
                let entity = self.registry.get(&entity_id)?;
                Some(Suggestion {
                    alias,
                    entity_id,
                    canonical_name: entity.canonical_name,
                    score,
                })
            })
            .collect()
    }

    /// Category for `entity` given the full, unnormalized description.
    #[must_use]
    pub fn determine_category(&self, entity: &Entity, full_description: &str) -> String {
        entity.category_for(full_description).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ContextRule;

    const NO_ALIASES: &[&str] = &[];

    fn resolver() -> EntityResolver {
        let registry = Arc::new(EntityRegistry::in_memory());
        registry.register("NS", Some("Transport:Train"), &["ns"]).unwrap();
        registry.register("NS Groep", Some("Transport:Train:Tickets"), &["ns groep"]).unwrap();
        registry.register("Albert Heijn", Some("Groceries"), &["albert heijn"]).unwrap();
        registry.register("Shell", Some("Gas"), NO_ALIASES).unwrap();
        registry.register("Bank of America", Some("Finance"), NO_ALIASES).unwrap();
        EntityResolver::new(registry, 0.85)
    }

    #[test]
    fn exact_match() {
        let m = resolver().resolve_match("Albert Heijn").unwrap();
        assert_eq!(m.kind, MatchKind::Exact);
        assert_eq!(m.score, 1.0);
    }

    #[test]
    fn longest_substring_wins() {
        let m = resolver().resolve_match("train ticket ns groep amsterdam").unwrap();
        assert_eq!(m.kind, MatchKind::Substring);
        assert_eq!(m.entity.canonical_name, "NS Groep");
    }

    #[test]
    fn substring_requires_whole_words() {
        let r = resolver();
        let m = r.resolve_match("insurance payment");
        assert!(m.map_or(true, |m| m.entity.canonical_name != "NS"));
    }

    #[test]
    fn typo_is_fuzzy_matched_and_suggested() {
        let r = resolver();
        let suggestions = r.find_similar("Albert Hijn", 3, 0.6);
        assert_eq!(suggestions[0].canonical_name, "Albert Heijn");
        assert!(suggestions[0].score > 0.8);

        let m = r.resolve_match("Albert Hijn").unwrap();
        assert_eq!(m.kind, MatchKind::Fuzzy);
        assert!(m.score >= 0.85);
    }

    #[test]
    fn strict_threshold_rejects_typo() {
        let r = resolver();
        let strict = EntityResolver::new(r.registry().clone(), 0.99);
        assert!(strict.resolve("Albert Hijn").is_none());
        assert!(!strict.find_similar("Albert Hijn", 3, 0.6).is_empty());
    }

    #[test]
    fn unrelated_names_do_not_resolve() {
        let r = resolver();
        assert!(r.resolve("Michelle's Flower Shop").is_none());
        assert!(r.resolve("The Royal Bank of England").is_none());
    }

    #[test]
    fn single_words_of_a_longer_name_do_not_resolve() {
        let r = resolver();
        for word in ["Bank", "Of", "America"] {
            assert!(r.resolve(word).is_none(), "{word} resolved");
        }
        let suggestions = r.find_similar("Bank", 3, 0.6);
        assert_eq!(suggestions[0].canonical_name, "Bank of America");
    }

    #[test]
    fn find_similar_respects_limits() {
        let r = resolver();
        let all = r.find_similar("ns groep", 10, 0.0);
        assert!(all.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(r.find_similar("ns groep", 1, 0.0).len(), 1);
        assert!(r.find_similar("zzz", 3, 0.6).is_empty());
        assert!(r.find_similar("", 3, 0.0).is_empty());
    }

    #[test]
    fn context_rules_override_default_category() {
        let mut entity = Entity::new("Amazon", Some("Shopping"));
        entity.add_context_rule(ContextRule::new("AWS", "Tech:Cloud"));
        let r = resolver();
        assert_eq!(r.determine_category(&entity, "AMAZON aws emea sarl"), "Tech:Cloud");
        assert_eq!(r.determine_category(&entity, "Amazon.de order"), "Shopping");
    }

    #[test]
    fn resolution_is_deterministic() {
        let r = resolver();
        let first = r.resolve_match("ns groep ns").map(|m| (m.entity.id, m.alias));
        for _ in 0..5 {
            let again = r.resolve_match("ns groep ns").map(|m| (m.entity.id, m.alias));
            assert_eq!(again, first);
        }
    }
}
