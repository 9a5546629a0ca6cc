//! Best-effort quality heuristics over stored translations.
//!
//! Nothing here rejects a line: findings are logged, recorded as run events
//! and listed in the run summary for a person to look at.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

use crate::codec::FRAGMENT_SEPARATOR;
use crate::config::QualityOptions;
use crate::document::TagKey;
use crate::glossary::extract::extract_terms;
use crate::glossary::Glossary;
use crate::store::Phase;

static WORD_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[a-z]+\b").expect("valid word regex"));
static SENTENCE_BREAK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]+\s+").expect("valid sentence break regex"));
static ENGLISH_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\b(the|a|an)\s+\w+",
        r"\b(is|are|was|were|am)\s+",
        r"\b(have|has|had)\s+",
        r"\b(will|would|could|should|might|may)\s+",
        r"\b(i|you|he|she|it|we|they)\s+",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid english pattern"))
    .collect()
});

const COMMON_ENGLISH_WORDS: &[&str] = &[
    "the", "be", "to", "of", "and", "a", "in", "that", "have", "i", "it", "for", "not", "on", "with",
    "he", "as", "you", "do", "at", "this", "but", "his", "by", "from", "they", "we", "say", "her",
    "she", "or", "an", "will", "my", "one", "all", "would", "there", "their", "what", "so", "up",
    "out", "if", "about", "who", "get", "which", "go", "me", "when", "make", "can", "like", "time",
    "no", "just", "him", "know", "take", "people", "into", "year", "your", "good", "some", "could",
    "them", "see", "other", "than", "then", "now", "look", "only", "come", "its", "over", "think",
    "also", "back", "after", "use", "two", "how", "our", "work", "first", "well", "way", "even",
    "new", "want", "because", "any", "these", "give", "day", "most", "us", "is", "was", "are",
    "been", "has", "had", "were", "said", "did", "having", "may", "should", "must",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QualityIssueKind {
    /// The line still reads as source-language text.
    Untranslated,
    /// A glossary term was translated differently from its established form.
    Terminology,
}

impl QualityIssueKind {
    pub fn label(&self) -> &'static str {
        match self {
            QualityIssueKind::Untranslated => "untranslated",
            QualityIssueKind::Terminology => "terminology",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityWarning {
    pub kind: QualityIssueKind,
    pub phase: Phase,
    pub key: TagKey,
    pub confidence: f64,
    pub message: String,
}

impl fmt::Display for QualityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({:.0}%): {}",
            self.kind.label(),
            self.key,
            self.confidence * 100.0,
            self.message
        )
    }
}

fn is_english(language: &str) -> bool {
    matches!(language.trim().to_lowercase().as_str(), "en" | "english")
}

/// Share of common English words, English grammar patterns and a length bonus.
pub fn english_confidence(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let words: Vec<&str> = WORD_REGEX.find_iter(&lower).map(|m| m.as_str()).collect();
    if words.is_empty() {
        return 0.0;
    }

    let common = words
        .iter()
        .filter(|word| COMMON_ENGLISH_WORDS.contains(*word))
        .count();
    let word_ratio = common as f64 / words.len() as f64;
    let matched = ENGLISH_PATTERNS
        .iter()
        .filter(|pattern| pattern.is_match(&lower))
        .count();
    let pattern_score = matched as f64 / ENGLISH_PATTERNS.len() as f64;
    let length_bonus = (words.len() as f64 / 10.0).min(0.2);

    (word_ratio * 0.6 + pattern_score * 0.3 + length_bonus).min(1.0)
}

/// Lowercase, punctuation stripped, whitespace collapsed.
fn normalize(text: &str) -> String {
    let stripped: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Characters equal at the same position, over the longer length.
pub fn positional_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longer = a.len().max(b.len());
    if longer == 0 || a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let same = a.iter().zip(b.iter()).filter(|(x, y)| x == y).count();
    same as f64 / longer as f64
}

/// Flags lines left in the source language.
#[derive(Debug, Clone)]
pub struct UntranslatedDetector {
    /// Sentence heuristics only apply from English into another language.
    english_leakage: bool,
    min_confidence: f64,
    similarity_threshold: f64,
    min_words: usize,
}

impl UntranslatedDetector {
    pub fn new(options: &QualityOptions, target_language: &str) -> Self {
        Self {
            english_leakage: is_english(&options.source_language) && !is_english(target_language),
            min_confidence: options.untranslated_min_confidence,
            similarity_threshold: options.similarity_threshold,
            min_words: options.min_words,
        }
    }

    /// The most English-looking sentence of `translated`, when it reaches the threshold.
    pub fn detect(&self, translated: &str) -> Option<(f64, String)> {
        if !self.english_leakage {
            return None;
        }
        SENTENCE_BREAK_REGEX
            .split(translated)
            .map(str::trim)
            .filter(|sentence| !sentence.is_empty())
            .map(|sentence| (english_confidence(sentence), sentence))
            .filter(|(confidence, _)| *confidence >= self.min_confidence)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(confidence, sentence)| (confidence, sentence.to_string()))
    }

    /// Compares a translation with its source; short lines such as names are skipped.
    pub fn check_pair(&self, original: &str, translated: &str) -> Option<(f64, String)> {
        let original = normalize(original);
        if original.split(' ').count() < self.min_words.max(1) || original.is_empty() {
            return None;
        }
        let translated = normalize(translated);
        if original == translated {
            return Some((1.0, "translation is identical to the source".to_string()));
        }
        let similarity = positional_similarity(&original, &translated);
        (similarity >= self.similarity_threshold).then(|| {
            (
                similarity,
                format!("translation is {:.0}% identical to the source", similarity * 100.0),
            )
        })
    }
}

/// Glossary terms of `original` whose established translation is missing
/// from `translated`, with that translation and its confidence.
pub fn missing_terms(
    glossary: &Glossary,
    original: &str,
    translated: &str,
    min_confidence: f64,
) -> Vec<(String, String, f64)> {
    let translated = translated.to_lowercase();
    extract_terms(original)
        .into_iter()
        .filter_map(|term| {
            let expected = glossary.translation(&term, min_confidence)?;
            if expected == term || translated.contains(&expected.to_lowercase()) {
                return None;
            }
            let confidence = if glossary.is_validated(&term) {
                1.0
            } else {
                glossary.confidence(&term)
            };
            Some((term.clone(), expected.to_string(), confidence))
        })
        .collect()
}

/// Runs every heuristic over one stored line.
pub struct QualityReviewer<'g> {
    detector: UntranslatedDetector,
    glossary: &'g Glossary,
    min_term_confidence: f64,
}

impl<'g> QualityReviewer<'g> {
    pub fn new(
        options: &QualityOptions,
        target_language: &str,
        glossary: &'g Glossary,
        min_term_confidence: f64,
    ) -> Self {
        Self {
            detector: UntranslatedDetector::new(options, target_language),
            glossary,
            min_term_confidence,
        }
    }

    pub fn review(&self, phase: Phase, key: &TagKey, original: &str, translated: &str) -> Vec<QualityWarning> {
        let original = original.replace(FRAGMENT_SEPARATOR, " ");
        let translated = translated.replace(FRAGMENT_SEPARATOR, " ");
        let warning = |kind, confidence, message| QualityWarning {
            kind,
            phase,
            key: key.clone(),
            confidence,
            message,
        };

        let mut warnings = Vec::new();
        if let Some((confidence, message)) = self.detector.check_pair(&original, &translated) {
            warnings.push(warning(QualityIssueKind::Untranslated, confidence, message));
        } else if let Some((confidence, sentence)) = self.detector.detect(&translated) {
            warnings.push(warning(
                QualityIssueKind::Untranslated,
                confidence,
                format!("sentence still reads as English: \"{sentence}\""),
            ));
        }

        for (term, expected, confidence) in
            missing_terms(self.glossary, &original, &translated, self.min_term_confidence)
        {
            warnings.push(warning(
                QualityIssueKind::Terminology,
                confidence,
                format!("\"{term}\" is usually translated as \"{expected}\""),
            ));
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> UntranslatedDetector {
        UntranslatedDetector::new(&QualityOptions::default(), "French")
    }

    fn key() -> TagKey {
        TagKey::new("ch1.xhtml", "body/p", 0)
    }

    #[test]
    fn english_sentences_score_above_french_ones() {
        let english = english_confidence("The captain was looking at the sea and he said nothing.");
        let french = english_confidence("Le capitaine regardait la mer et il ne disait rien.");
        assert!(english >= 0.6, "english scored {english}");
        assert!(french < 0.6, "french scored {french}");
        assert_eq!(english_confidence("1984, 2001"), 0.0);
    }

    #[test]
    fn detects_english_left_in_a_translation() {
        let (confidence, sentence) = detector()
            .detect("Il se leva. The captain was looking at the sea and he said nothing.")
            .unwrap();
        assert!(confidence >= 0.6);
        assert!(sentence.starts_with("The captain"));
        assert!(detector().detect("Il se leva et regarda la mer.").is_none());
    }

    #[test]
    fn english_targets_skip_sentence_heuristics() {
        let detector = UntranslatedDetector::new(&QualityOptions::default(), "English");
        assert!(detector
            .detect("The captain was looking at the sea and he said nothing.")
            .is_none());
    }

    #[test]
    fn copied_source_is_flagged_but_short_names_are_not() {
        let (confidence, message) = detector()
            .check_pair("Twenty Thousand Leagues Under the Sea", "Twenty thousand leagues under the sea!")
            .unwrap();
        assert_eq!(confidence, 1.0);
        assert!(message.contains("identical"));

        assert!(detector().check_pair("Captain Nemo", "Captain Nemo").is_none());
        assert!(detector()
            .check_pair("The sea was calm that night.", "La mer était calme cette nuit-là.")
            .is_none());
    }

    #[test]
    fn positional_similarity_counts_aligned_characters() {
        assert_eq!(positional_similarity("abcd", "abcd"), 1.0);
        assert_eq!(positional_similarity("abcd", "abxd"), 0.75);
        assert_eq!(positional_similarity("ab", "abcd"), 0.5);
        assert_eq!(positional_similarity("", "abcd"), 0.0);
    }

    #[test]
    fn terminology_uses_established_glossary_translations() {
        let mut glossary = Glossary::new();
        glossary.validate("Nautilus", "Nautile");
        for _ in 0..3 {
            glossary.observe("Nemo", "Némo");
        }

        let missing = missing_terms(
            &glossary,
            "Captain Nemo boarded the Nautilus.",
            "Le capitaine Némo monta à bord du Nautilus.",
            0.7,
        );
        assert_eq!(missing, vec![("Nautilus".to_string(), "Nautile".to_string(), 1.0)]);

        assert!(missing_terms(
            &glossary,
            "Captain Nemo boarded the Nautilus.",
            "Le capitaine Némo monta à bord du nautile.",
            0.7,
        )
        .is_empty());
    }

    #[test]
    fn reviewer_reports_each_kind_once_per_line() {
        let mut glossary = Glossary::new();
        glossary.validate("Nautilus", "Nautile");
        let reviewer = QualityReviewer::new(&QualityOptions::default(), "French", &glossary, 0.7);

        let warnings = reviewer.review(
            Phase::Initial,
            &key(),
            "The Nautilus dived</>under the ice.",
            "The Nautilus dived</>under the ice.",
        );
        let kinds: Vec<QualityIssueKind> = warnings.iter().map(|warning| warning.kind).collect();
        assert_eq!(kinds, vec![QualityIssueKind::Untranslated, QualityIssueKind::Terminology]);
        assert!(warnings[1].to_string().starts_with("terminology ch1.xhtml#0(body/p) (100%)"));

        assert!(reviewer
            .review(Phase::Refined, &key(), "The Nautilus dived.", "Le Nautile plongea.")
            .is_empty());
    }
}
