/// Configuration for a translation run
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ai::client::ServiceConfig;
use crate::ai::retry::BackoffPolicy;
use crate::checks::RejectionPolicy;
use crate::document::BilingualFormat;
use crate::segment::DEFAULT_OVERLAP_RATIO;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Token budget of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseConfig {
    pub max_tokens: usize,
    pub overlap_ratio: f64,
}

impl PhaseConfig {
    pub const fn new(max_tokens: usize, overlap_ratio: f64) -> Self {
        Self {
            max_tokens,
            overlap_ratio,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyOptions {
    pub max_concurrent_requests: usize,
    pub validation_workers: usize,
    pub correction_workers: usize,
}

impl Default for ConcurrencyOptions {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 4,
            validation_workers: 2,
            correction_workers: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOptions {
    /// Correction attempts per failed check, across the strategy list.
    pub retry_limit: usize,
    pub rejection_policy: RejectionPolicy,
    /// Extra attempts for a chunk request that failed on the service side.
    /// Zero only reports the failure.
    pub chunk_task_retries: usize,
    /// Attempts per error-queue item before it is marked failed.
    pub queue_item_retries: usize,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            retry_limit: 2,
            rejection_policy: RejectionPolicy::default(),
            chunk_task_retries: 0,
            queue_item_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffOptions {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            max_attempts: 3,
        }
    }
}

impl BackoffOptions {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_attempts,
        )
    }
}

/// How long a phase transition waits for the error queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainOptions {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            poll_interval_ms: 500,
        }
    }
}

impl DrainOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlossaryOptions {
    /// Glossary file; `None` keeps the glossary in memory for the run.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Ask on the terminal for every conflict instead of taking the majority.
    pub interactive: bool,
    pub min_confidence: f64,
    pub max_prompt_terms: usize,
}

impl Default for GlossaryOptions {
    fn default() -> Self {
        Self {
            path: None,
            interactive: false,
            min_confidence: 0.7,
            max_prompt_terms: 50,
        }
    }
}

/// Thresholds for the non-blocking quality review.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QualityOptions {
    pub enabled: bool,
    /// Sentence-level leakage detection only knows English sources.
    pub source_language: String,
    pub untranslated_min_confidence: f64,
    pub similarity_threshold: f64,
    /// Lines shorter than this (in words) skip the copied-source check.
    pub min_words: usize,
}

impl Default for QualityOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            source_language: "English".into(),
            untranslated_min_confidence: 0.6,
            similarity_threshold: 0.9,
            min_words: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslatorConfig {
    pub target_language: String,
    #[serde(default)]
    pub user_prompt: Option<String>,
    pub initial_phase: PhaseConfig,
    pub refine_phase: PhaseConfig,
    /// Run the glossary-guided second pass.
    pub refine: bool,
    #[serde(default)]
    pub concurrency: ConcurrencyOptions,
    #[serde(default)]
    pub validation: ValidationOptions,
    #[serde(default)]
    pub backoff: BackoffOptions,
    #[serde(default)]
    pub drain: DrainOptions,
    #[serde(default)]
    pub glossary: GlossaryOptions,
    #[serde(default)]
    pub quality: QualityOptions,
    #[serde(default)]
    pub bilingual_format: BilingualFormat,
    pub cache_dir: PathBuf,
    #[serde(default)]
    pub service: ServiceConfig,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            target_language: "French".into(),
            user_prompt: None,
            initial_phase: PhaseConfig::new(1500, DEFAULT_OVERLAP_RATIO),
            refine_phase: PhaseConfig::new(300, DEFAULT_OVERLAP_RATIO),
            refine: true,
            concurrency: ConcurrencyOptions::default(),
            validation: ValidationOptions::default(),
            backoff: BackoffOptions::default(),
            drain: DrainOptions::default(),
            glossary: GlossaryOptions::default(),
            quality: QualityOptions::default(),
            bilingual_format: BilingualFormat::default(),
            cache_dir: default_cache_dir(),
            service: ServiceConfig::default(),
        }
    }
}

/// `<local data dir>/ebook-translator/cache`, or `./cache` when unknown.
pub fn default_cache_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("ebook-translator").join("cache"))
        .unwrap_or_else(|| PathBuf::from("cache"))
}

impl TranslatorConfig {
    /// Loads a JSON or YAML file, chosen by extension (`.yaml`/`.yml`, JSON otherwise).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);

        let config = if is_yaml {
            Self::from_yaml(&content)?
        } else {
            Self::from_json(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_language.trim().is_empty() {
            return Err(ConfigError::Invalid("targetLanguage is empty".into()));
        }
        for (name, phase) in [("initialPhase", &self.initial_phase), ("refinePhase", &self.refine_phase)] {
            if phase.max_tokens == 0 {
                return Err(ConfigError::Invalid(format!("{name}.maxTokens must be positive")));
            }
            if phase.overlap_ratio.is_nan() || phase.overlap_ratio < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}.overlapRatio must not be negative"
                )));
            }
        }
        let concurrency = &self.concurrency;
        for (name, value) in [
            ("maxConcurrentRequests", concurrency.max_concurrent_requests),
            ("validationWorkers", concurrency.validation_workers),
            ("correctionWorkers", concurrency.correction_workers),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("concurrency.{name} must be positive")));
            }
        }
        if self.backoff.max_attempts == 0 {
            return Err(ConfigError::Invalid("backoff.maxAttempts must be positive".into()));
        }
        for (name, value) in [
            ("untranslatedMinConfidence", self.quality.untranslated_min_confidence),
            ("similarityThreshold", self.quality.similarity_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("quality.{name} must be between 0 and 1")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = TranslatorConfig::default();
        assert_eq!(config.initial_phase.max_tokens, 1500);
        assert_eq!(config.refine_phase.max_tokens, 300);
        assert_eq!(config.concurrency.max_concurrent_requests, 4);
        assert_eq!(config.validation.retry_limit, 2);
        assert_eq!(config.validation.rejection_policy, RejectionPolicy::Exclude);
        assert_eq!(config.drain.timeout(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_serialization() {
        let config = TranslatorConfig::default();
        let json = config.to_json().unwrap();
        assert!(json.contains("\"maxConcurrentRequests\": 4"));
        let deserialized = TranslatorConfig::from_json(&json).unwrap();
        assert_eq!(deserialized.target_language, config.target_language);
        assert_eq!(deserialized.initial_phase, config.initial_phase);
    }

    #[test]
    fn test_yaml_file_with_partial_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.yml");
        fs::write(
            &path,
            r#"
targetLanguage: German
initialPhase: { maxTokens: 800, overlapRatio: 0.2 }
refinePhase: { maxTokens: 200, overlapRatio: 0.1 }
refine: false
cacheDir: /tmp/cache
validation:
  retryLimit: 3
  rejectionPolicy: requeue
  chunkTaskRetries: 1
  queueItemRetries: 2
"#,
        )
        .unwrap();

        let config = TranslatorConfig::from_file(&path).unwrap();
        assert_eq!(config.target_language, "German");
        assert_eq!(config.initial_phase.max_tokens, 800);
        assert!(!config.refine);
        assert_eq!(config.validation.rejection_policy, RejectionPolicy::Requeue);
        assert_eq!(config.concurrency.validation_workers, 2);
        assert_eq!(config.bilingual_format, BilingualFormat::SeparateTag);
    }

    #[test]
    fn test_validate_rejects_zero_budgets_and_workers() {
        let mut config = TranslatorConfig::default();
        config.initial_phase.max_tokens = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = TranslatorConfig::default();
        config.refine_phase.overlap_ratio = -0.5;
        assert!(config.validate().is_err());

        let mut config = TranslatorConfig::default();
        config.concurrency.validation_workers = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("validationWorkers"));
    }

    #[test]
    fn test_quality_thresholds_must_be_ratios() {
        let mut value = serde_json::to_value(TranslatorConfig::default()).unwrap();
        value["quality"] = serde_json::json!({ "enabled": false });
        let config: TranslatorConfig = serde_json::from_value(value).unwrap();
        assert!(!config.quality.enabled);
        assert_eq!(config.quality.min_words, 3);

        let mut config = TranslatorConfig::default();
        config.quality.similarity_threshold = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("similarityThreshold"));
    }
}
