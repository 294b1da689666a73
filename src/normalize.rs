//! Description normalization.
//!
//! Strips structured banking noise (dates, times, transaction ids, long
//! numbers, punctuation, noise tags) so the remaining text is mostly the
//! merchant name. Normalization is pure: the only inputs are the raw text and
//! the caller-supplied noise set.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\d{1,2}[./-]\d{1,2}[./-]\d{2}(?:\d{2})?|\d{4}[./-]\d{1,2}[./-]\d{1,2})\b")
        .expect("valid date pattern")
});

static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,2}:\d{2}(?::\d{2})?\b").expect("valid time pattern"));

static SEPARATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[/,*]").expect("valid separator pattern"));

static PUNCTUATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}\s]").expect("valid punctuation pattern"));

static LONG_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[\p{L}\p{N}]{16,}\b").expect("valid id pattern"));

static LONG_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{5,}\b").expect("valid number pattern"));

/// Structured banking tags that never carry merchant information.
pub const BANKING_NOISE: &[&str] = &[
    "trtp", "trct", "iban", "bic", "csid", "eref", "remi", "name", "marf", "nr", "bea", "sepa",
    "pas", "val", "kref", "omschrijving", "mededelingen", "kenmerk", "betalingskenmerk",
    "incasso", "algemeen", "doorlopend", "euro", "munt", "code", "betaling", "acceptgiro",
    "spoed", "credit", "debit", "boekdatum",
];

/// Case-insensitive set of whole words removed during normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoiseSet {
    words: HashSet<String>,
}

impl NoiseSet {
    /// Creates an empty noise set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a noise set from the given words.
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for word in words {
            set.insert(word.as_ref());
        }
        set
    }

    /// Adds a word. Blank words are ignored.
    pub fn insert(&mut self, word: &str) -> bool {
        let word = word.trim().to_lowercase();
        if word.is_empty() {
            return false;
        }
        self.words.insert(word)
    }

    /// Returns true if the (already lowercased) token is noise.
    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.words.contains(token)
    }

    /// Number of words in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Normalizes a raw description.
///
/// Lowercases, strips dates, times, alphanumeric runs of 16+ characters and
/// numeric runs of 5+ digits, turns `/ , *` into spaces, drops any other
/// punctuation, removes noise words and collapses whitespace. Never fails;
/// blank input yields an empty string.
///
/// # Examples
///
/// ```
/// use merchant_resolve::normalize::{normalize, NoiseSet};
///
/// let noise = NoiseSet::from_words(["bea", "pas"]);
/// let cleaned = normalize("BEA, Betaalpas Albert Heijn 1657,PAS 12.05.24 13:45", &noise);
/// assert_eq!(cleaned, "betaalpas albert heijn 1657");
/// ```
#[must_use]
pub fn normalize(raw: &str, noise: &NoiseSet) -> String {
    if raw.trim().is_empty() {
        return String::new();
    }

    let text = raw.to_lowercase();
    let text = DATE_RE.replace_all(&text, " ");
    let text = TIME_RE.replace_all(&text, " ");
    let text = SEPARATOR_RE.replace_all(&text, " ");
    let text = PUNCTUATION_RE.replace_all(&text, "");
    let text = LONG_ID_RE.replace_all(&text, " ");
    let text = LONG_NUMBER_RE.replace_all(&text, " ");

    text.split_whitespace()
        .filter(|token| !noise.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Key under which an alias is indexed: the normalized form without noise removal.
#[must_use]
pub fn alias_key(alias: &str) -> String {
    static EMPTY: LazyLock<NoiseSet> = LazyLock::new(NoiseSet::new);
    normalize(alias, &EMPTY)
}

/// Normalizer bound to a noise set.
#[derive(Debug, Clone, Default)]
pub struct TextNormalizer {
    noise: NoiseSet,
}

impl TextNormalizer {
    /// Creates a normalizer with the given noise set.
    #[must_use]
    pub fn new(noise: NoiseSet) -> Self {
        Self { noise }
    }

    /// Creates a normalizer that strips the built-in banking tags.
    #[must_use]
    pub fn with_banking_noise() -> Self {
        Self::new(NoiseSet::from_words(BANKING_NOISE))
    }

    /// Normalizes a description with this normalizer's noise set.
    #[must_use]
    pub fn normalize(&self, raw: &str) -> String {
        normalize(raw, &self.noise)
    }

    /// Adds a learned noise word.
    pub fn add_noise_word(&mut self, word: &str) -> bool {
        self.noise.insert(word)
    }

    /// The current noise set.
    #[must_use]
    pub fn noise(&self) -> &NoiseSet {
        &self.noise
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_input_is_empty() {
        assert_eq!(normalize("", &NoiseSet::new()), "");
        assert_eq!(normalize("   \t ", &NoiseSet::new()), "");
    }

    #[test]
    fn strips_sepa_structure() {
        let noise = NoiseSet::from_words(BANKING_NOISE);
        let raw = "/TRTP/SEPA Incasso algemeen doorlopend/CSID/NL12ZZZ/NAME/Key4Music/MARF/12398";
        assert_eq!(normalize(raw, &noise), "nl12zzz key4music");
    }

    #[test]
    fn strips_dates_times_and_ids() {
        let noise = NoiseSet::new();
        let raw = "Netflix 01-02-2024 12:30 NL27INGB0001234567 ref 9876543";
        assert_eq!(normalize(raw, &noise), "netflix ref");
    }

    #[test]
    fn keeps_short_numbers() {
        assert_eq!(normalize("Shop 1657", &NoiseSet::new()), "shop 1657");
    }

    #[test]
    fn drops_punctuation_and_collapses_whitespace() {
        assert_eq!(
            normalize("Michelle's   Flower-Shop!!", &NoiseSet::new()),
            "michelles flowershop"
        );
    }

    #[test]
    fn noise_words_are_whole_words_only() {
        let noise = NoiseSet::from_words(["pas"]);
        assert_eq!(normalize("Pas Pasta Bar", &noise), "pasta bar");
    }

    #[test]
    fn alias_key_matches_candidate_normalization() {
        assert_eq!(alias_key("Bol.com"), normalize("BOL.COM", &NoiseSet::new()));
        assert_eq!(alias_key("  NS  Groep "), "ns groep");
    }

    #[test]
    fn normalizer_learns_noise_words() {
        let mut normalizer = TextNormalizer::default();
        assert_eq!(normalizer.normalize("Betaalpas Picnic"), "betaalpas picnic");
        assert!(normalizer.add_noise_word("BETAALPAS"));
        assert_eq!(normalizer.normalize("Betaalpas Picnic"), "picnic");
    }
}
