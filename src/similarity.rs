//! Similarity measures.
//!
//! Cosine similarity for embeddings, a token-sort ratio for gating fuzzy
//! alias resolution, and a token-set ratio for ranking review suggestions.
//! All return scores on a 0–1 scale (cosine may be negative).

use std::collections::BTreeSet;

/// Cosine similarity between two vectors.
///
/// Returns `None` when the dimensions differ or either vector is empty, and
/// `0.0` when either vector has zero norm.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let xf = f64::from(x);
        let yf = f64::from(y);
        dot += xf * yf;
        norm_a += xf * xf;
        norm_b += yf * yf;
    }

    if norm_a <= 0.0 || norm_b <= 0.0 {
        return Some(0.0);
    }

    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    if sim.is_finite() {
        #[allow(clippy::cast_possible_truncation)]
        Some(sim as f32)
    } else {
        Some(0.0)
    }
}

fn ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    strsim::normalized_levenshtein(a, b)
}

fn join(head: &str, tail: &str) -> String {
    match (head.is_empty(), tail.is_empty()) {
        (true, _) => tail.to_string(),
        (_, true) => head.to_string(),
        _ => format!("{head} {tail}"),
    }
}

/// Token-set ratio between two strings.
///
/// Both strings are split into lowercase word sets. The shared words are
/// compared against each side's full sorted word list, so word order and
/// repeated words do not matter and a string whose words are a subset of the
/// other's scores 1.0.
///
/// # Examples
///
/// ```
/// use merchant_resolve::similarity::token_set_ratio;
///
/// assert!(token_set_ratio("albert hijn", "albert heijn") > 0.85);
/// assert_eq!(token_set_ratio("heijn albert", "albert heijn"), 1.0);
/// assert!(token_set_ratio("shell", "bank of america") < 0.5);
/// ```
#[must_use]
pub fn token_set_ratio(a: &str, b: &str) -> f32 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let tokens_a: BTreeSet<&str> = a.split_whitespace().collect();
    let tokens_b: BTreeSet<&str> = b.split_whitespace().collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let shared = tokens_a
        .intersection(&tokens_b)
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    let only_a = tokens_a
        .difference(&tokens_b)
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    let only_b = tokens_b
        .difference(&tokens_a)
        .copied()
        .collect::<Vec<_>>()
        .join(" ");

    let full_a = join(&shared, &only_a);
    let full_b = join(&shared, &only_b);

    let best = ratio(&shared, &full_a)
        .max(ratio(&shared, &full_b))
        .max(ratio(&full_a, &full_b));

    #[allow(clippy::cast_possible_truncation)]
    let score = best.clamp(0.0, 1.0) as f32;
    score
}

/// Token-sort ratio between two strings.
///
/// Both strings are lowercased, split into words, sorted, and rejoined before
/// a normalized Levenshtein comparison. Word order does not matter, but every
/// word on both sides counts, so a one-word subset of a longer name scores low.
///
/// # Examples
///
/// ```
/// use merchant_resolve::similarity::token_sort_ratio;
///
/// assert!(token_sort_ratio("albert hijn", "albert heijn") > 0.85);
/// assert_eq!(token_sort_ratio("heijn albert", "albert heijn"), 1.0);
/// assert!(token_sort_ratio("bank", "bank of america") < 0.5);
/// ```
#[must_use]
pub fn token_sort_ratio(a: &str, b: &str) -> f32 {
    let sorted = |s: &str| {
        let lowered = s.to_lowercase();
        let mut tokens: Vec<&str> = lowered.split_whitespace().collect();
        tokens.sort_unstable();
        tokens.join(" ")
    };

    #[allow(clippy::cast_possible_truncation)]
    let score = ratio(&sorted(a), &sorted(b)).clamp(0.0, 1.0) as f32;
    score
}
