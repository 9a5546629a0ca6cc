//! Source term -> translation observations shared across chunks and runs.

pub mod extract;
pub mod resolve;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::backup::{quarantine, swap_in, BackupError};
use extract::{extract_terms, find_best_match, is_likely_extraction_error, should_exclude};

pub use resolve::{resolve_conflicts, AutoResolver, ConflictResolver, PromptResolver, Resolution};

/// Share a translation must exceed to be the dominant one.
pub const DOMINANCE_THRESHOLD: f64 = 0.7;

#[derive(Debug, Error)]
pub enum GlossaryError {
    #[error("glossary I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("glossary serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Backup(#[from] BackupError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GlossaryFile {
    #[serde(default)]
    learned: BTreeMap<String, BTreeMap<String, u64>>,
    #[serde(default)]
    validated: BTreeMap<String, String>,
}

/// A term whose observed translations do not agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub term: String,
    /// Observed translations, most frequent first.
    pub translations: Vec<(String, u64)>,
}

impl Conflict {
    pub fn total(&self) -> u64 {
        self.translations.iter().map(|(_, count)| count).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlossaryStatistics {
    pub total_terms: usize,
    pub validated_terms: usize,
    pub conflicting_terms: usize,
    pub unique_translations: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Glossary {
    path: Option<PathBuf>,
    learned: BTreeMap<String, BTreeMap<String, u64>>,
    validated: BTreeMap<String, String>,
}

impl Glossary {
    /// In-memory glossary that is never persisted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `path` when it exists. An unreadable file is moved aside and
    /// the glossary starts empty.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, GlossaryError> {
        let path = path.as_ref().to_path_buf();
        let file = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<GlossaryFile>(&raw) {
                Ok(file) => file,
                Err(err) => {
                    let backup = quarantine(&path)?;
                    log::warn!(
                        "corrupt glossary {} ({err}); moved to {}, starting empty",
                        path.display(),
                        backup.display()
                    );
                    GlossaryFile::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => GlossaryFile::default(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path: Some(path),
            learned: file.learned,
            validated: file.validated,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes `{learned, validated}` atomically. No-op for in-memory glossaries.
    pub fn save(&self) -> Result<(), GlossaryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = GlossaryFile {
            learned: self.learned.clone(),
            validated: self.validated.clone(),
        };
        swap_in(path, &serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }

    pub fn observe(&mut self, term: &str, translation: &str) {
        *self
            .learned
            .entry(term.to_string())
            .or_default()
            .entry(translation.to_string())
            .or_insert(0) += 1;
    }

    /// Extracts terms from a validated line pair and records their alignments.
    ///
    /// Returns how many observations were recorded.
    pub fn learn_pair(&mut self, original: &str, translated: &str) -> usize {
        let candidates: Vec<String> = extract_terms(translated)
            .into_iter()
            .filter(|term| !should_exclude(term))
            .collect();

        let mut observed = 0;
        for term in extract_terms(original) {
            if should_exclude(&term) {
                continue;
            }
            let translation = if translated.contains(term.as_str()) {
                term.clone()
            } else {
                match find_best_match(&term, &candidates, original, translated) {
                    Some(candidate) if !is_likely_extraction_error(&term, candidate) => {
                        candidate.to_string()
                    }
                    _ => continue,
                }
            };
            self.observe(&term, &translation);
            observed += 1;
        }
        observed
    }

    /// Manual choice; always wins over observations.
    pub fn validate(&mut self, term: &str, translation: &str) {
        self.validated
            .insert(term.to_string(), translation.to_string());
    }

    pub fn is_validated(&self, term: &str) -> bool {
        self.validated.contains_key(term)
    }

    pub fn observations(&self, term: &str) -> Option<&BTreeMap<String, u64>> {
        self.learned.get(term)
    }

    /// Most observed translation; ties go to the lexicographically smaller one.
    pub fn majority(&self, term: &str) -> Option<&str> {
        self.learned
            .get(term)?
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(translation, _)| translation.as_str())
    }

    /// Share of the majority translation among all observations of `term`.
    pub fn confidence(&self, term: &str) -> f64 {
        let Some(translations) = self.learned.get(term) else {
            return 0.0;
        };
        let total: u64 = translations.values().sum();
        let best = translations.values().copied().max().unwrap_or(0);
        if total == 0 {
            0.0
        } else {
            best as f64 / total as f64
        }
    }

    /// The translation whose share exceeds [`DOMINANCE_THRESHOLD`], if any.
    pub fn dominant(&self, term: &str) -> Option<&str> {
        if self.confidence(term) > DOMINANCE_THRESHOLD {
            self.majority(term)
        } else {
            None
        }
    }

    pub fn is_dominant(&self, term: &str) -> bool {
        self.dominant(term).is_some()
    }

    /// Validated translation first, otherwise the majority when its share
    /// reaches `min_confidence`.
    pub fn translation(&self, term: &str, min_confidence: f64) -> Option<&str> {
        if let Some(validated) = self.validated.get(term) {
            return Some(validated);
        }
        if self.confidence(term) >= min_confidence {
            self.majority(term)
        } else {
            None
        }
    }

    /// Unvalidated terms with two or more translations and no dominant one,
    /// most observed first.
    pub fn conflicts(&self) -> Vec<Conflict> {
        let mut conflicts: Vec<Conflict> = self
            .learned
            .iter()
            .filter(|(term, translations)| {
                !self.validated.contains_key(*term)
                    && translations.len() >= 2
                    && !self.is_dominant(term)
            })
            .map(|(term, translations)| {
                let mut sorted: Vec<(String, u64)> = translations
                    .iter()
                    .map(|(translation, count)| (translation.clone(), *count))
                    .collect();
                sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                Conflict {
                    term: term.clone(),
                    translations: sorted,
                }
            })
            .collect();
        conflicts.sort_by(|a, b| b.total().cmp(&a.total()).then_with(|| a.term.cmp(&b.term)));
        conflicts
    }

    /// `term → translation` pairs joined by `, `, most observed terms first.
    pub fn export_for_prompt(&self, max_terms: usize, min_confidence: f64) -> String {
        let mut terms: Vec<(&String, u64)> = self
            .learned
            .iter()
            .map(|(term, translations)| (term, translations.values().sum()))
            .collect();
        terms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let mut exported: Vec<String> = Vec::new();
        for (term, _) in terms {
            if exported.len() >= max_terms {
                break;
            }
            if let Some(translation) = self.translation(term, min_confidence) {
                exported.push(format!("{term} → {translation}"));
            }
        }
        for (term, translation) in &self.validated {
            if exported.len() >= max_terms {
                break;
            }
            if !self.learned.contains_key(term) {
                exported.push(format!("{term} → {translation}"));
            }
        }
        exported.join(", ")
    }

    pub fn high_confidence_terms(&self, min_confidence: f64) -> BTreeMap<String, String> {
        self.learned
            .keys()
            .filter_map(|term| {
                self.translation(term, min_confidence)
                    .map(|translation| (term.clone(), translation.to_string()))
            })
            .collect()
    }

    pub fn statistics(&self) -> GlossaryStatistics {
        GlossaryStatistics {
            total_terms: self.learned.len(),
            validated_terms: self.validated.len(),
            conflicting_terms: self.conflicts().len(),
            unique_translations: self.learned.values().map(BTreeMap::len).sum(),
        }
    }

    pub fn clear(&mut self) {
        self.learned.clear();
        self.validated.clear();
    }
}
