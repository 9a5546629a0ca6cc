//! Heuristic term extraction and alignment for glossary learning.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

static NON_WORD_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w]").expect("valid non-word regex"));
static ACRONYM_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z]{2,}\b").expect("valid acronym regex"));
static CAMEL_CASE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][a-z]+[A-Z][a-zA-Z]*\b").expect("valid camel case regex"));

const HONORIFICS: &[&str] = &["Dr", "Mr", "Mrs", "Ms", "Prof", "Sir", "Lady"];

const MATCH_THRESHOLD: f64 = 1.0;
const MAX_LENGTH_RATIO: f64 = 5.0;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "i", "you", "he", "she", "it", "we", "they", "me", "him", "her", "us", "them",
    "my", "your", "his", "its", "our", "their", "mine", "yours", "hers", "ours", "theirs", "this",
    "that", "these", "those", "in", "on", "at", "by", "with", "from", "to", "of", "for", "about",
    "after", "before", "behind", "beside", "between", "among", "through", "during", "above",
    "below", "under", "over", "into", "onto", "upon", "across", "along", "around", "near",
    "against", "toward", "towards", "within", "without", "and", "or", "but", "so", "yet", "nor",
    "as", "if", "although", "though", "because", "since", "unless", "until", "while", "when",
    "where", "whether", "am", "is", "are", "was", "were", "be", "been", "being", "have", "has",
    "had", "having", "do", "does", "did", "doing", "can", "could", "will", "would", "shall",
    "should", "may", "might", "must", "all", "any", "some", "many", "much", "few", "little",
    "more", "most", "each", "every", "both", "either", "neither", "other", "another", "such",
    "very", "too", "quite", "rather", "really", "just", "only", "also", "even", "still",
    "already", "again", "once", "twice", "always", "never", "often", "sometimes", "usually",
    "here", "there", "now", "then", "soon", "later", "ago", "today", "tomorrow", "yesterday",
    "come", "go", "get", "make", "take", "bring", "put", "give", "keep", "let", "seem", "become",
    "turn", "well", "oh", "yes", "no", "okay", "ok", "anyway", "however", "therefore", "moreover",
    "furthermore", "meanwhile", "otherwise", "who", "whom", "whose", "what", "which", "why", "how",
    "ah", "uh", "um", "hmm", "huh", "hey", "wow",
];

pub fn is_stopword(word: &str) -> bool {
    let lower = word.to_lowercase();
    STOPWORDS.contains(&lower.as_str())
}

/// Grammatical words, single letters and two-letter lowercase words never enter the glossary.
pub fn should_exclude(word: &str) -> bool {
    let mut chars = word.chars();
    let Some(first) = chars.next() else {
        return true;
    };
    let len = word.chars().count();
    is_stopword(word) || len == 1 || (len == 2 && first.is_lowercase())
}

/// A grammatical source aligned to a capitalized word, or wildly different
/// lengths, is almost always a misalignment.
pub fn is_likely_extraction_error(source_term: &str, translated_term: &str) -> bool {
    let starts_upper = translated_term
        .chars()
        .next()
        .map(char::is_uppercase)
        .unwrap_or(false);
    if is_stopword(source_term) && starts_upper {
        return true;
    }

    let source_len = source_term.chars().count();
    let translated_len = translated_term.chars().count();
    if source_len == 0 || translated_len == 0 {
        return false;
    }
    let ratio = source_len.max(translated_len) as f64 / source_len.min(translated_len) as f64;
    ratio > MAX_LENGTH_RATIO
}

fn starts_uppercase(word: &str) -> bool {
    word.chars().next().map(char::is_uppercase).unwrap_or(false)
}

fn ends_sentence(word: &str) -> bool {
    let clean = NON_WORD_REGEX.replace_all(word, "");
    !HONORIFICS.contains(&clean.as_ref()) && word.ends_with(&['.', '!', '?'][..])
}

/// Proper nouns, acronyms and CamelCase terms, sorted and deduplicated.
///
/// A capitalized word opening a sentence is kept only when the next word is
/// capitalized too, so ordinary sentence starts are skipped.
pub fn extract_terms(text: &str) -> Vec<String> {
    let mut terms = BTreeSet::new();
    let words: Vec<&str> = text.split_whitespace().collect();

    for (position, word) in words.iter().enumerate() {
        let clean = NON_WORD_REGEX.replace_all(word, "").to_string();
        if clean.chars().count() < 2 || HONORIFICS.contains(&clean.as_str()) {
            continue;
        }
        if !starts_uppercase(&clean) {
            continue;
        }

        let sentence_start = position == 0 || ends_sentence(words[position - 1]);
        if sentence_start {
            let next_capitalized = words
                .get(position + 1)
                .map(|next| starts_uppercase(next))
                .unwrap_or(false);
            if !next_capitalized {
                continue;
            }
        }
        terms.insert(clean);
    }

    terms.extend(ACRONYM_REGEX.find_iter(text).map(|m| m.as_str().to_string()));
    terms.extend(CAMEL_CASE_REGEX.find_iter(text).map(|m| m.as_str().to_string()));
    terms.into_iter().collect()
}

fn relative_position(text: &str, term: &str) -> Option<f64> {
    let position = text.find(term)?;
    Some(position as f64 / text.len().max(1) as f64)
}

/// Picks the candidate that best aligns with `term`.
///
/// Scores similar relative position (weight 2), similar length (weight 1)
/// and a shared initial (+0.5); the best score must reach 1.0.
pub fn find_best_match<'a>(
    term: &str,
    candidates: &'a [String],
    original_text: &str,
    translated_text: &str,
) -> Option<&'a str> {
    let original_position = relative_position(original_text, term)?;
    let term_len = term.chars().count();
    let term_initial = term.chars().next()?.to_lowercase().next();

    candidates
        .iter()
        .map(|candidate| {
            let mut score = 0.0;
            if let Some(position) = relative_position(translated_text, candidate) {
                score += (1.0 - (original_position - position).abs()) * 2.0;
            }
            let candidate_len = candidate.chars().count();
            if term_len > 0 && candidate_len > 0 {
                score += term_len.min(candidate_len) as f64 / term_len.max(candidate_len) as f64;
            }
            if candidate.chars().next().and_then(|c| c.to_lowercase().next()) == term_initial {
                score += 0.5;
            }
            (candidate.as_str(), score)
        })
        .fold(None, |best: Option<(&str, f64)>, (candidate, score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((candidate, score)),
        })
        .filter(|(_, score)| *score >= MATCH_THRESHOLD)
        .map(|(candidate, _)| candidate)
}
