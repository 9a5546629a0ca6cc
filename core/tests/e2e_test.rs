//! End-to-end runs against a scripted completion service.
//!
//! Covers the whole flow: segmentation, translation, validation and
//! correction, persistence, glossary learning, refinement and reconstruction.

use async_trait::async_trait;
use ebook_translator_core::config::{BackoffOptions, DrainOptions, PhaseConfig};
use ebook_translator_core::{
    BilingualFormat, Completion, CompletionError, CompletionService, DocumentContainer, GenerationMode,
    InMemoryContainer, QualityIssueKind, Replacement, RunContext, Store, TagKey, TextNode, Translator, TranslatorConfig,
    WhitespaceTokenCounter, END_MARKER,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

static NUMBERED_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^<(\d+)/>(.*)$").unwrap());

/// Translates by prefixing every numbered line of the content with `fr:`.
struct EchoService {
    calls: AtomicUsize,
    /// Lines kept from the first answer; `None` answers in full.
    truncate_first: Option<usize>,
    fail: bool,
    /// Answers with the source text unchanged.
    copy_through: bool,
}

impl EchoService {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            truncate_first: None,
            fail: false,
            copy_through: false,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionService for EchoService {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(
        &self,
        _prompt: &str,
        content: &str,
        _mode: GenerationMode,
    ) -> Result<Completion, CompletionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CompletionError::permanent("invalid api key"));
        }

        let mut lines: Vec<String> = content
            .lines()
            .filter_map(|line| NUMBERED_LINE.captures(line))
            .map(|caps| {
                let prefix = if self.copy_through { "" } else { "fr:" };
                format!("<{}/>{prefix}{}", &caps[1], &caps[2])
            })
            .collect();
        if call == 0 {
            if let Some(keep) = self.truncate_first {
                lines.truncate(keep);
            }
        }
        Ok(Completion::text(format!("{}\n{END_MARKER}", lines.join("\n"))))
    }
}

fn config(cache_dir: &Path) -> TranslatorConfig {
    let mut config = TranslatorConfig::default();
    config.cache_dir = cache_dir.to_path_buf();
    config.initial_phase = PhaseConfig::new(40, 0.1);
    config.refine_phase = PhaseConfig::new(15, 0.1);
    config.bilingual_format = BilingualFormat::Disable;
    config.backoff = BackoffOptions {
        base_delay_ms: 1,
        max_delay_ms: 5,
        max_attempts: 2,
    };
    config.drain = DrainOptions {
        timeout_secs: 10,
        poll_interval_ms: 5,
    };
    config
}

fn translator(config: TranslatorConfig, service: Arc<EchoService>) -> Translator {
    Translator::new(config, service, Arc::new(RunContext::detached()))
        .with_token_counter(Arc::new(WhitespaceTokenCounter))
}

fn book() -> InMemoryContainer {
    let mut container = InMemoryContainer::new();
    for chapter in 1..=2 {
        let document_id = format!("ch{chapter}.xhtml");
        let nodes = (0..6)
            .map(|index| {
                let key = TagKey::new(&document_id, "body/p", index);
                if index == 3 {
                    TextNode::new(key, vec!["Captain Nemo said".into(), "nothing at all.".into()])
                } else {
                    TextNode::new(
                        key,
                        vec![format!("Captain Nemo steered the Nautilus past reef {index}.")],
                    )
                }
            })
            .collect();
        container.add_document(document_id, nodes);
    }
    container
}

#[tokio::test]
async fn translates_refines_and_reconstructs_a_book() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir.path().join("cache"));
    config.glossary.path = Some(dir.path().join("glossary.json"));
    let service = Arc::new(EchoService::new());

    let mut container = book();
    let summary = translator(config.clone(), service.clone())
        .run(&mut container)
        .await
        .unwrap();

    summary.ensure_success().unwrap();
    assert_eq!(summary.replaced, 12);
    assert!(summary.untranslated.is_empty());
    assert!(summary.chunks_translated > 2);
    assert_eq!(summary.refinement_fallbacks, 0);
    assert!(summary.glossary.total_terms >= 2);
    assert!(dir.path().join("glossary.json").exists());

    let split = container
        .replacement(&TagKey::new("ch2.xhtml", "body/p", 3))
        .unwrap();
    assert_eq!(
        split,
        &Replacement::Fragments {
            fragments: vec!["fr:Captain Nemo said".into(), "nothing at all.".into()],
        }
    );
    assert_eq!(container.replacements().len(), 12);

    // Everything is cached now: a second run makes no requests.
    let calls = service.calls();
    let mut again = book();
    let summary = translator(config, service.clone()).run(&mut again).await.unwrap();
    assert_eq!(service.calls(), calls);
    assert_eq!(summary.chunks_translated, 0);
    assert!(summary.chunks_skipped > 0);
    assert_eq!(again.replacements().len(), 12);
}

#[tokio::test]
async fn missing_lines_are_requested_again_and_merged() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.refine = false;
    config.initial_phase = PhaseConfig::new(1000, 0.1);
    let service = Arc::new(EchoService {
        truncate_first: Some(17),
        ..EchoService::new()
    });

    let mut container = InMemoryContainer::new();
    let nodes = (0..47)
        .map(|index| {
            TextNode::new(
                TagKey::new("long.xhtml", "body/p", index),
                vec![format!("Line number {index} is here.")],
            )
        })
        .collect();
    container.add_document("long.xhtml", nodes);

    let summary = translator(config, service.clone()).run(&mut container).await.unwrap();

    assert_eq!(service.calls(), 2);
    assert_eq!(summary.chunks_translated, 1);
    assert_eq!(summary.chunks_corrected, 1);
    assert_eq!(summary.replaced, 47);
    assert_eq!(summary.metrics.correction_successes, 1);
    assert_eq!(summary.metrics.failures_by_check.get("line_count"), Some(&1));
}

#[tokio::test]
async fn broken_cached_fragments_are_repaired_before_reconstruction() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.refine = false;

    Store::open(dir.path().join("initial"))
        .unwrap()
        .save([(&TagKey::new("ch1.xhtml", "body/p", 0), "Bonjour monde")])
        .unwrap();

    let mut container = InMemoryContainer::new();
    container.add_document(
        "ch1.xhtml",
        vec![TextNode::new(
            TagKey::new("ch1.xhtml", "body/p", 0),
            vec!["Hello".into(), "world".into()],
        )],
    );

    let service = Arc::new(EchoService::new());
    let summary = translator(config, service.clone()).run(&mut container).await.unwrap();

    assert_eq!(summary.chunks_skipped, 1);
    assert_eq!(summary.error_queues["reconstruction"].corrected, 1);
    assert!(summary.reconstruction_failures.is_empty());
    assert_eq!(summary.replaced, 1);
    assert_eq!(
        container.replacement(&TagKey::new("ch1.xhtml", "body/p", 0)),
        Some(&Replacement::Fragments {
            fragments: vec!["fr:Hello".into(), "world".into()],
        })
    );
}

#[tokio::test]
async fn failed_requests_are_collected_without_aborting_the_run() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(EchoService {
        fail: true,
        ..EchoService::new()
    });

    let mut container = book();
    let summary = translator(config(dir.path()), service)
        .run(&mut container)
        .await
        .unwrap();

    assert!(!summary.failed_tasks.is_empty());
    assert_eq!(summary.untranslated.len(), 12);
    assert!(summary.refinement_fallbacks > 0);
    assert_eq!(container.document_ids().len(), 2);

    let err = summary.ensure_success().unwrap_err().to_string();
    assert!(err.contains("invalid api key"));
    assert_eq!(summary.metrics.task_failures as usize, summary.failed_tasks.len());
}

#[tokio::test]
async fn a_run_can_be_spawned_onto_the_runtime() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.refine = false;
    let service = Arc::new(EchoService::new());
    let translator = translator(config, service.clone());

    let summary = tokio::spawn(async move {
        let mut container = book();
        translator.run(&mut container).await
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(summary.replaced, 12);
    assert!(service.calls() > 0);
}

#[tokio::test]
async fn lines_left_in_the_source_language_are_reported_but_kept() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.refine = false;
    let service = Arc::new(EchoService {
        copy_through: true,
        ..EchoService::new()
    });

    let mut container = book();
    let summary = translator(config, service).run(&mut container).await.unwrap();

    summary.ensure_success().unwrap();
    assert_eq!(summary.replaced, 12);
    assert_eq!(summary.quality_warnings.len(), 12);
    assert!(summary
        .quality_warnings
        .iter()
        .all(|warning| warning.kind == QualityIssueKind::Untranslated));
    assert_eq!(summary.metrics.quality_warnings, 12);
}

#[tokio::test]
async fn quality_review_can_be_switched_off() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.refine = false;
    config.quality.enabled = false;
    let service = Arc::new(EchoService {
        copy_through: true,
        ..EchoService::new()
    });

    let mut container = book();
    let summary = translator(config, service).run(&mut container).await.unwrap();

    assert_eq!(summary.replaced, 12);
    assert!(summary.quality_warnings.is_empty());
}
