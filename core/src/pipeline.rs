//! Two-phase translation run.
//!
//! Initial pass, error-queue drain, glossary resolution, refinement pass,
//! quality review, then reconstruction through the document container. Each pass runs the
//! worker pools from [`crate::workers`] and hands the stores and glossary
//! back when its single save worker finishes.

use anyhow::{anyhow, bail, Context};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ai::{CompletionService, OpenAiCompatibleClient};
use crate::checks::{ChunkRejected, FilteredLine, ValidationPipeline};
use crate::codec::TranslationMap;
use crate::config::{PhaseConfig, TranslatorConfig};
use crate::correction::{
    spawn_correction_workers, ErrorItem, ErrorQueue, ErrorQueueStats, FailedCorrection, RetryEngine,
};
use crate::document::{
    BilingualFormat, DocumentCache, DocumentContainer, FragmentMismatch, Page, ReconstructionError, TagKey,
    TextNode,
};
use crate::engine::TranslationEngine;
use crate::glossary::{resolve_conflicts, AutoResolver, ConflictResolver, Glossary, GlossaryStatistics, PromptResolver};
use crate::prompt::DefaultPromptRenderer;
use crate::quality::{QualityReviewer, QualityWarning};
use crate::run_context::{RunContext, RunEvent, RunMetrics};
use crate::segment::{Chunk, Segmentator};
use crate::store::{Phase, PhaseStores, Store, StoreError};
use crate::token::{ApproxTokenCounter, TokenCounter};
use crate::workers::{
    run_requests, spawn_validation_workers, ChunkRequest, RequestKind, RequestSettings, SaveReport, SaveWorker,
    TaskFailure, ValidationReport,
};

/// A chunk that failed validation under [`crate::checks::RejectionPolicy::Fail`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedChunk {
    pub phase: Phase,
    pub chunk: usize,
    pub check: String,
    pub lines: Vec<usize>,
    pub reason: String,
    pub attempts: Vec<String>,
}

impl RejectedChunk {
    fn new(phase: Phase, rejected: ChunkRejected) -> Self {
        Self {
            phase,
            chunk: rejected.chunk,
            check: rejected.diagnostic.check.clone(),
            lines: rejected.diagnostic.lines.clone(),
            reason: rejected.diagnostic.detailed(),
            attempts: rejected
                .attempts
                .iter()
                .map(|attempt| format!("{}: {}", attempt.strategy, attempt.reason))
                .collect(),
        }
    }
}

/// An error-queue item that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedUnit {
    pub kind: String,
    pub label: String,
    /// Source and attempted text, as far as the item carries them.
    pub detail: String,
    pub reason: String,
}

impl From<FailedCorrection> for FailedUnit {
    fn from(failed: FailedCorrection) -> Self {
        let detail = match &failed.item {
            ErrorItem::MissingLines { diagnostic, .. } => diagnostic.detailed(),
            ErrorItem::FragmentMismatch { mismatch, .. } => mismatch.to_string(),
        };
        Self {
            kind: failed.item.kind().label().to_string(),
            label: failed.item.label(),
            detail,
            reason: failed.reason,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub chunks_translated: usize,
    pub chunks_skipped: usize,
    pub chunks_validated: usize,
    pub chunks_corrected: usize,
    /// Refinements that kept the initial translation.
    pub refinement_fallbacks: usize,
    pub rejected_chunks: Vec<RejectedChunk>,
    pub filtered_lines: Vec<FilteredLine>,
    pub failed_tasks: Vec<TaskFailure>,
    pub failed_corrections: Vec<FailedUnit>,
    /// Error-queue statistics per drain (`initial`, `refined`, `reconstruction`).
    pub error_queues: BTreeMap<String, ErrorQueueStats>,
    pub replaced: usize,
    pub untranslated: Vec<TagKey>,
    pub reconstruction_failures: Vec<FragmentMismatch>,
    /// `false` when conflict resolution was aborted.
    pub glossary_resolved: bool,
    pub glossary: GlossaryStatistics,
    pub save_errors: Vec<String>,
    /// Heuristic findings; never counted as failed units.
    pub quality_warnings: Vec<QualityWarning>,
    pub metrics: RunMetrics,
}

impl RunSummary {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            chunks_translated: 0,
            chunks_skipped: 0,
            chunks_validated: 0,
            chunks_corrected: 0,
            refinement_fallbacks: 0,
            rejected_chunks: Vec::new(),
            filtered_lines: Vec::new(),
            failed_tasks: Vec::new(),
            failed_corrections: Vec::new(),
            error_queues: BTreeMap::new(),
            replaced: 0,
            untranslated: Vec::new(),
            reconstruction_failures: Vec::new(),
            glossary_resolved: true,
            glossary: GlossaryStatistics::default(),
            save_errors: Vec::new(),
            quality_warnings: Vec::new(),
            metrics: RunMetrics::default(),
        }
    }

    /// Every unit that needs manual attention, one line each.
    pub fn failed_units(&self) -> Vec<String> {
        let mut units: Vec<String> = self.failed_tasks.iter().map(ToString::to_string).collect();
        units.extend(self.rejected_chunks.iter().map(|rejected| {
            format!(
                "{} chunk {:03} rejected by {}: {}",
                rejected.phase.label(),
                rejected.chunk,
                rejected.check,
                rejected.reason
            )
        }));
        units.extend(
            self.failed_corrections
                .iter()
                .map(|failed| format!("{} {}: {}", failed.kind, failed.label, failed.reason)),
        );
        units.extend(self.reconstruction_failures.iter().map(ToString::to_string));
        units
    }

    /// Fails with every failed unit listed when the run left any behind.
    pub fn ensure_success(&self) -> anyhow::Result<()> {
        let units = self.failed_units();
        if units.is_empty() {
            return Ok(());
        }
        bail!("{} unit(s) failed:\n  {}", units.len(), units.join("\n  "))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    fn absorb_save_report(&mut self, report: SaveReport) {
        self.save_errors.extend(report.errors);
    }
}

/// Drives a complete run against one document container.
pub struct Translator {
    config: TranslatorConfig,
    engine: Arc<TranslationEngine>,
    counter: Arc<dyn TokenCounter>,
}

impl Translator {
    pub fn new(config: TranslatorConfig, service: Arc<dyn CompletionService>, context: Arc<RunContext>) -> Self {
        let engine = TranslationEngine::new(
            service,
            Arc::new(DefaultPromptRenderer),
            config.target_language.clone(),
            context,
        )
        .with_backoff(config.backoff.policy())
        .with_user_prompt(config.user_prompt.clone());
        Self {
            config,
            engine: Arc::new(engine),
            counter: Arc::new(ApproxTokenCounter::default()),
        }
    }

    /// HTTP client from `config.service` and run logs in the default log directory.
    pub fn from_config(config: TranslatorConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let client = OpenAiCompatibleClient::from_env(config.service.clone())?;
        let log_dir = RunContext::default_log_dir();
        let context = RunContext::with_log_dir(&log_dir)
            .with_context(|| format!("failed to open run logs in {}", log_dir.display()))?;
        Ok(Self::new(config, Arc::new(client), Arc::new(context)))
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<RunContext> {
        self.engine.context()
    }

    /// Runs with the conflict resolver chosen by `glossary.interactive`.
    ///
    /// Interactive resolution reads stdin on a blocking thread.
    pub async fn run(&self, container: &mut (dyn DocumentContainer + Send)) -> anyhow::Result<RunSummary> {
        let mut auto = AutoResolver;
        let conflicts = if self.config.glossary.interactive {
            ConflictSource::Terminal
        } else {
            ConflictSource::With(&mut auto)
        };
        self.run_resolving(container, conflicts).await
    }

    pub async fn run_with_resolver(
        &self,
        container: &mut (dyn DocumentContainer + Send),
        resolver: &mut (dyn ConflictResolver + Send),
    ) -> anyhow::Result<RunSummary> {
        self.run_resolving(container, ConflictSource::With(resolver)).await
    }

    async fn run_resolving(
        &self,
        container: &mut (dyn DocumentContainer + Send),
        conflicts: ConflictSource<'_>,
    ) -> anyhow::Result<RunSummary> {
        let context = self.context().clone();
        let mut summary = RunSummary::new(context.run_id());

        let mut cache = DocumentCache::new();
        let document_ids = container.document_ids();
        let mut nodes: Vec<TextNode> = Vec::new();
        for document_id in &document_ids {
            let page = cache
                .get_or_load(&*container, document_id)
                .with_context(|| format!("failed to read {document_id}"))?;
            nodes.extend(page.nodes().iter().cloned());
        }
        log::info!(
            "run {}: {} text node(s) in {} document(s)",
            context.run_id(),
            nodes.len(),
            document_ids.len()
        );

        let cache_dir = &self.config.cache_dir;
        let stores = PhaseStores::open(cache_dir)
            .with_context(|| format!("failed to open cache in {}", cache_dir.display()))?;
        let glossary = match &self.config.glossary.path {
            Some(path) => Glossary::load(path)
                .with_context(|| format!("failed to load glossary {}", path.display()))?,
            None => Glossary::new(),
        };

        let (mut stores, mut glossary) = self
            .run_phase(Phase::Initial, &nodes, stores, glossary, &mut summary)
            .await?;

        let (resolved, resolved_glossary) = conflicts.resolve(glossary).await?;
        summary.glossary_resolved = resolved;
        glossary = resolved_glossary;
        if let Err(err) = glossary.save() {
            log::error!("failed to save glossary: {err}");
            summary.save_errors.push(format!("glossary: {err}"));
        }

        if self.config.refine {
            (stores, glossary) = self
                .run_phase(Phase::Refined, &nodes, stores, glossary, &mut summary)
                .await?;
        }
        summary.glossary = glossary.statistics();
        if self.config.quality.enabled {
            self.review_quality(&nodes, &mut stores, &glossary, &mut summary)?;
        }

        self.reconstruct(container, &mut cache, &document_ids, stores, &mut summary)
            .await?;

        summary.metrics = context.metrics();
        log::info!(
            "run {} finished: {} chunk(s) translated, {} replaced, {} failed unit(s)",
            context.run_id(),
            summary.chunks_translated,
            summary.replaced,
            summary.failed_units().len()
        );
        Ok(summary)
    }

    fn review_quality(
        &self,
        nodes: &[TextNode],
        stores: &mut PhaseStores,
        glossary: &Glossary,
        summary: &mut RunSummary,
    ) -> Result<(), StoreError> {
        let reviewer = QualityReviewer::new(
            &self.config.quality,
            &self.config.target_language,
            glossary,
            self.config.glossary.min_confidence,
        );
        let context = self.context();
        for node in nodes {
            let Some((phase, text)) = stores.best_text(&node.key)? else {
                continue;
            };
            for warning in reviewer.review(phase, &node.key, &node.text(), &text) {
                log::warn!("{warning}");
                context.record(RunEvent::QualityWarning {
                    key: node.key.to_string(),
                    kind: warning.kind.label().to_string(),
                    message: warning.message.clone(),
                });
                summary.quality_warnings.push(warning);
            }
        }
        if !summary.quality_warnings.is_empty() {
            log::info!("quality review flagged {} line(s)", summary.quality_warnings.len());
        }
        Ok(())
    }

    fn budget(&self, phase: Phase) -> PhaseConfig {
        match phase {
            Phase::Initial => self.config.initial_phase,
            Phase::Refined => self.config.refine_phase,
        }
    }

    fn correction_engines(&self) -> (Arc<RetryEngine>, Arc<ValidationPipeline>) {
        let retry = Arc::new(
            RetryEngine::standard(self.engine.clone()).with_max_attempts(self.config.validation.retry_limit),
        );
        let pipeline = Arc::new(ValidationPipeline::standard(
            retry.clone(),
            self.config.validation.rejection_policy,
            self.context().clone(),
        ));
        (retry, pipeline)
    }

    /// Builds the request list, skipping chunks whose lines are all stored.
    fn plan_requests(
        &self,
        phase: Phase,
        nodes: &[TextNode],
        stores: &mut PhaseStores,
        summary: &mut RunSummary,
    ) -> Result<Vec<ChunkRequest>, StoreError> {
        let budget = self.budget(phase);
        let segmentator = Segmentator::new(self.counter.clone(), budget.max_tokens, budget.overlap_ratio);
        let context = self.context();

        let mut requests = Vec::new();
        let mut planned = 0;
        for chunk in segmentator.segment(nodes.iter().cloned()) {
            planned += 1;
            if all_stored(stores.store(phase), &chunk)? {
                context.record(RunEvent::ChunkSkipped { chunk: chunk.index });
                summary.chunks_skipped += 1;
                continue;
            }
            let kind = match phase {
                Phase::Initial => RequestKind::Translate,
                Phase::Refined => {
                    let initial = stored_lines(stores.store(Phase::Initial), &chunk)?;
                    if initial.is_empty() {
                        log::warn!(
                            "chunk {:03} has no initial translation to refine",
                            chunk.index
                        );
                        summary.refinement_fallbacks += 1;
                        continue;
                    }
                    RequestKind::Refine { initial }
                }
            };
            requests.push(ChunkRequest {
                chunk: Arc::new(chunk),
                kind,
            });
        }

        context.record(RunEvent::PhaseStarted {
            phase: phase.label().to_string(),
            chunks: planned,
        });
        log::info!(
            "{} phase: {} chunk(s), {} to request",
            phase.label(),
            planned,
            requests.len()
        );
        Ok(requests)
    }

    async fn run_phase(
        &self,
        phase: Phase,
        nodes: &[TextNode],
        mut stores: PhaseStores,
        glossary: Glossary,
        summary: &mut RunSummary,
    ) -> anyhow::Result<(PhaseStores, Glossary)> {
        let context = self.context().clone();
        let requests = self.plan_requests(phase, nodes, &mut stores, summary)?;

        let options = &self.config;
        let hints = Some(
            glossary.export_for_prompt(options.glossary.max_prompt_terms, options.glossary.min_confidence),
        )
        .filter(|hints| !hints.is_empty());
        let (retry, pipeline) = self.correction_engines();
        let queue = Arc::new(ErrorQueue::new());

        let learn_from = (phase == Phase::Initial).then_some(Phase::Initial);
        let (save_tx, save_rx) = mpsc::unbounded_channel();
        let saver = SaveWorker::new(stores, glossary, context.clone())
            .learning_from(learn_from)
            .spawn(save_rx);

        let (job_tx, job_rx) = mpsc::channel(options.concurrency.validation_workers.max(1) * 2);
        let validators = spawn_validation_workers(
            options.concurrency.validation_workers,
            job_rx,
            pipeline.clone(),
            save_tx.clone(),
            queue.clone(),
            options.validation.queue_item_retries,
        );
        let correctors = spawn_correction_workers(
            options.concurrency.correction_workers,
            queue.clone(),
            retry,
            pipeline,
            save_tx,
        );

        let settings = RequestSettings {
            phase,
            max_concurrent: options.concurrency.max_concurrent_requests,
            task_retries: options.validation.chunk_task_retries,
            glossary_hints: hints,
        };
        let requested = run_requests(self.engine.clone(), requests, settings, job_tx).await;
        summary.chunks_translated += requested.translated;
        summary.refinement_fallbacks += requested.fallbacks;
        summary.failed_tasks.extend(requested.failures);

        let mut validation = ValidationReport::default();
        for validator in validators {
            match validator.await {
                Ok(report) => validation.merge(report),
                Err(err) => summary.failed_tasks.push(TaskFailure {
                    phase,
                    chunk: None,
                    error: format!("validation worker died: {err}"),
                }),
            }
        }
        summary.chunks_validated += validation.validated;
        summary.chunks_corrected += validation.corrected;
        summary.filtered_lines.extend(validation.filtered);
        summary
            .rejected_chunks
            .extend(validation.rejected.into_iter().map(|rejected| RejectedChunk::new(phase, rejected)));

        let stats = self.drain(&queue, phase.label()).await?;
        for corrector in correctors {
            if let Err(err) = corrector.await {
                summary.failed_tasks.push(TaskFailure {
                    phase,
                    chunk: None,
                    error: format!("correction worker died: {err}"),
                });
            }
        }
        summary.error_queues.insert(phase.label().to_string(), stats);
        summary
            .failed_corrections
            .extend(queue.take_failures().into_iter().map(FailedUnit::from));

        let output = saver
            .await
            .map_err(|err| anyhow!("{} save worker died: {err}", phase.label()))?;
        summary.absorb_save_report(output.report);

        context.record(RunEvent::PhaseFinished {
            phase: phase.label().to_string(),
        });
        Ok((output.stores, output.glossary))
    }

    /// Waits for the error queue to empty, then closes it. A timeout is fatal.
    async fn drain(&self, queue: &ErrorQueue, stage: &str) -> anyhow::Result<ErrorQueueStats> {
        let drain = &self.config.drain;
        let drained = queue.drain(drain.timeout(), drain.poll_interval()).await;
        queue.close();
        let stats = drained.with_context(|| format!("{stage} stage left unresolved errors"))?;
        if stats.total > 0 {
            log::info!(
                "{stage} error queue drained: {} corrected, {} failed",
                stats.corrected,
                stats.failed
            );
        }
        Ok(stats)
    }

    async fn reconstruct(
        &self,
        container: &mut (dyn DocumentContainer + Send),
        cache: &mut DocumentCache,
        document_ids: &[String],
        mut stores: PhaseStores,
        summary: &mut RunSummary,
    ) -> anyhow::Result<()> {
        let context = self.context().clone();
        let format = self.config.bilingual_format;

        let mut mismatches = Vec::new();
        for document_id in document_ids {
            let page = cache.get_or_load(&*container, document_id)?;
            let keys = page.pending_keys();
            let applied = apply_keys(container, page, &mut stores, &keys, format, &context)?;
            summary.replaced += applied.replaced;
            summary.untranslated.extend(applied.untranslated);
            mismatches.extend(applied.mismatches);
        }
        if mismatches.is_empty() {
            return Ok(());
        }

        log::warn!("{} line(s) need fragment repair", mismatches.len());
        let queue = Arc::new(ErrorQueue::new());
        let mut affected: BTreeMap<String, BTreeSet<TagKey>> = BTreeMap::new();
        for (phase, mismatch) in mismatches {
            affected
                .entry(mismatch.key.document_id.clone())
                .or_default()
                .insert(mismatch.key.clone());
            queue.push(
                ErrorItem::FragmentMismatch { phase, mismatch },
                self.config.validation.queue_item_retries,
            );
        }

        let (retry, pipeline) = self.correction_engines();
        let (save_tx, save_rx) = mpsc::unbounded_channel();
        let saver = SaveWorker::new(stores, Glossary::new(), context.clone()).spawn(save_rx);
        let correctors = spawn_correction_workers(
            self.config.concurrency.correction_workers,
            queue.clone(),
            retry,
            pipeline,
            save_tx,
        );

        let stats = self.drain(&queue, "reconstruction").await?;
        for corrector in correctors {
            if let Err(err) = corrector.await {
                log::error!("correction worker died: {err}");
            }
        }
        summary.error_queues.insert("reconstruction".to_string(), stats);
        summary
            .failed_corrections
            .extend(queue.take_failures().into_iter().map(FailedUnit::from));
        let output = saver
            .await
            .map_err(|err| anyhow!("reconstruction save worker died: {err}"))?;
        summary.absorb_save_report(output.report);
        let mut stores = output.stores;

        for (document_id, keys) in affected {
            let page = cache.get_or_load(&*container, &document_id)?;
            let keys: Vec<TagKey> = keys.into_iter().collect();
            let applied = apply_keys(container, page, &mut stores, &keys, format, &context)?;
            summary.replaced += applied.replaced;
            summary
                .reconstruction_failures
                .extend(applied.mismatches.into_iter().map(|(_, mismatch)| *mismatch));
        }
        Ok(())
    }
}

/// Where glossary conflicts get decided between the two phases.
enum ConflictSource<'r> {
    /// A person at the terminal, over stdin and stdout.
    Terminal,
    With(&'r mut (dyn ConflictResolver + Send)),
}

impl ConflictSource<'_> {
    async fn resolve(self, mut glossary: Glossary) -> anyhow::Result<(bool, Glossary)> {
        match self {
            ConflictSource::Terminal => tokio::task::spawn_blocking(move || {
                let stdin = io::stdin();
                let mut resolver = PromptResolver::new(stdin.lock(), io::stdout());
                let resolved = resolve_conflicts(&mut glossary, &mut resolver);
                (resolved, glossary)
            })
            .await
            .map_err(|err| anyhow!("glossary resolution task died: {err}")),
            ConflictSource::With(resolver) => {
                let resolved = resolve_conflicts(&mut glossary, resolver);
                Ok((resolved, glossary))
            }
        }
    }
}

#[derive(Default)]
struct Applied {
    replaced: usize,
    untranslated: Vec<TagKey>,
    mismatches: Vec<(Phase, Box<FragmentMismatch>)>,
}

/// Replaces each key with its best stored translation and hands it to the container.
fn apply_keys(
    container: &mut (dyn DocumentContainer + Send),
    page: &mut Page,
    stores: &mut PhaseStores,
    keys: &[TagKey],
    format: BilingualFormat,
    context: &RunContext,
) -> anyhow::Result<Applied> {
    let mut applied = Applied::default();
    for key in keys {
        let Some((phase, text)) = stores.best_text(key)? else {
            applied.untranslated.push(key.clone());
            continue;
        };
        match page.replace_text(key, &text, format) {
            Ok(replacement) => {
                container
                    .apply(key, replacement)
                    .with_context(|| format!("failed to apply translation of {key}"))?;
                applied.replaced += 1;
            }
            Err(ReconstructionError::FragmentMismatch(mismatch)) => {
                log::warn!("{mismatch}");
                context.record(RunEvent::ReconstructionMismatch {
                    key: key.to_string(),
                    expected: mismatch.expected,
                    actual: mismatch.actual,
                });
                applied.mismatches.push((phase, mismatch));
            }
            Err(err @ ReconstructionError::UnknownKey(_)) => log::warn!("{err}"),
        }
    }
    Ok(applied)
}

fn all_stored(store: &mut Store, chunk: &Chunk) -> Result<bool, StoreError> {
    for node in &chunk.body {
        if !store.contains(&node.key)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn stored_lines(store: &mut Store, chunk: &Chunk) -> Result<TranslationMap, StoreError> {
    let mut lines = TranslationMap::new();
    for (index, node) in chunk.body.iter().enumerate() {
        if let Some(text) = store.get_text(&node.key)? {
            lines.insert(index, text);
        }
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::tests::chunk_of;
    use tempfile::tempdir;

    #[test]
    fn stored_chunks_are_detected_for_resume() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        let chunk = chunk_of(&["one", "two"]);
        assert!(!all_stored(&mut store, &chunk).unwrap());

        store.save([(&chunk.body[0].key, "un")]).unwrap();
        assert!(!all_stored(&mut store, &chunk).unwrap());
        assert_eq!(stored_lines(&mut store, &chunk).unwrap().len(), 1);

        store.save([(&chunk.body[1].key, "deux")]).unwrap();
        assert!(all_stored(&mut store, &chunk).unwrap());
    }

    #[test]
    fn summary_lists_every_failed_unit() {
        let mut summary = RunSummary::new(Uuid::new_v4());
        assert!(summary.ensure_success().is_ok());

        summary.failed_tasks.push(TaskFailure {
            phase: Phase::Initial,
            chunk: Some(4),
            error: "permanent error (401): bad key".into(),
        });
        summary.failed_corrections.push(FailedUnit {
            kind: "fragment_mismatch".into(),
            label: "ch1.xhtml#3(p)".into(),
            detail: String::new(),
            reason: "reasoning: expected 3 fragments, got 2".into(),
        });

        let err = summary.ensure_success().unwrap_err().to_string();
        assert!(err.starts_with("2 unit(s) failed"));
        assert!(err.contains("initial chunk 004"));
        assert!(err.contains("fragment_mismatch ch1.xhtml#3(p)"));
        assert!(summary.to_json().unwrap().contains("\"failedTasks\""));
    }
}
