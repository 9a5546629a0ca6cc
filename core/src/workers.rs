//! Worker tasks of one translation phase.
//!
//! Requesters (bounded by a semaphore) feed parsed responses to a pool of
//! validation workers, which hand accepted lines to exactly one save worker.
//! The save worker owns the phase stores and the glossary for the duration
//! of the phase and returns them when its channel closes.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::ai::GenerationMode;
use crate::checks::{ChunkRejected, FilteredLine, ValidationPipeline};
use crate::codec::{TranslationMap, FRAGMENT_SEPARATOR};
use crate::correction::error_queue::{ErrorItem, ErrorQueue};
use crate::document::TagKey;
use crate::engine::{EngineError, TranslationEngine};
use crate::glossary::Glossary;
use crate::run_context::{RunContext, RunEvent};
use crate::segment::Chunk;
use crate::store::{Phase, PhaseStores, Store, StoreError};

/// Work for the save worker.
#[derive(Debug, Clone)]
pub enum SaveRequest {
    /// Accepted body lines of a chunk, keyed by body index.
    Chunk {
        phase: Phase,
        chunk: Arc<Chunk>,
        translations: TranslationMap,
    },
    /// A single corrected line, already in fragment form.
    Entry {
        phase: Phase,
        key: TagKey,
        translation: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReport {
    pub requests: usize,
    pub entries: usize,
    pub changed_documents: usize,
    pub glossary_observations: usize,
    pub errors: Vec<String>,
}

pub struct SaveWorkerOutput {
    pub stores: PhaseStores,
    pub glossary: Glossary,
    pub report: SaveReport,
}

struct PendingLine {
    key: TagKey,
    original: String,
    translated: String,
}

/// The only writer to the stores and the glossary.
pub struct SaveWorker {
    stores: PhaseStores,
    glossary: Glossary,
    learn_from: Option<Phase>,
    context: Arc<RunContext>,
    report: SaveReport,
}

impl SaveWorker {
    pub fn new(stores: PhaseStores, glossary: Glossary, context: Arc<RunContext>) -> Self {
        Self {
            stores,
            glossary,
            learn_from: None,
            context,
            report: SaveReport::default(),
        }
    }

    /// Learn glossary terms from lines saved in `phase`.
    pub fn learning_from(mut self, phase: Option<Phase>) -> Self {
        self.learn_from = phase;
        self
    }

    pub fn spawn(self, requests: mpsc::UnboundedReceiver<SaveRequest>) -> JoinHandle<SaveWorkerOutput> {
        tokio::spawn(self.run(requests))
    }

    pub async fn run(mut self, mut requests: mpsc::UnboundedReceiver<SaveRequest>) -> SaveWorkerOutput {
        while let Some(request) = requests.recv().await {
            self.handle(request);
        }

        if self.report.glossary_observations > 0 {
            if let Err(err) = self.glossary.save() {
                log::error!("failed to save glossary: {err}");
                self.report.errors.push(format!("glossary: {err}"));
            }
        }
        log::debug!(
            "save worker finished: {} request(s), {} entr(ies)",
            self.report.requests,
            self.report.entries
        );

        SaveWorkerOutput {
            stores: self.stores,
            glossary: self.glossary,
            report: self.report,
        }
    }

    pub fn handle(&mut self, request: SaveRequest) {
        self.report.requests += 1;
        match request {
            SaveRequest::Chunk {
                phase,
                chunk,
                translations,
            } => {
                let mut by_document: BTreeMap<String, Vec<PendingLine>> = BTreeMap::new();
                for (index, translated) in translations {
                    let Some(node) = chunk.body.get(index) else {
                        log::warn!("chunk {:03}: no body line {index}, not saved", chunk.index);
                        continue;
                    };
                    by_document
                        .entry(node.key.document_id.clone())
                        .or_default()
                        .push(PendingLine {
                            key: node.key.clone(),
                            original: node.text(),
                            translated,
                        });
                }
                for (document_id, lines) in by_document {
                    self.save_document(phase, &document_id, lines);
                }
            }
            SaveRequest::Entry {
                phase,
                key,
                translation,
            } => {
                let document_id = key.document_id.clone();
                let line = PendingLine {
                    key,
                    original: String::new(),
                    translated: translation,
                };
                self.save_document(phase, &document_id, vec![line]);
            }
        }
    }

    fn save_document(&mut self, phase: Phase, document_id: &str, lines: Vec<PendingLine>) {
        let (changed, changed_lines) = match write_lines(self.stores.store(phase), &lines) {
            Ok(written) => written,
            Err(err) => {
                self.fail(document_id, err.to_string());
                return;
            }
        };

        self.report.entries += lines.len();
        if changed {
            self.report.changed_documents += 1;
        }
        self.context.record(RunEvent::Saved {
            document: document_id.to_string(),
            entries: lines.len(),
            changed,
        });

        if self.learn_from == Some(phase) {
            for line in changed_lines {
                if line.original.is_empty() {
                    continue;
                }
                self.report.glossary_observations += self.glossary.learn_pair(
                    &line.original.replace(FRAGMENT_SEPARATOR, " "),
                    &line.translated.replace(FRAGMENT_SEPARATOR, " "),
                );
            }
        }
    }

    fn fail(&mut self, document_id: &str, error: String) {
        log::error!("failed to save {document_id}: {error}");
        self.context.record(RunEvent::SaveFailed {
            document: document_id.to_string(),
            error: error.clone(),
        });
        self.report.errors.push(format!("{document_id}: {error}"));
    }
}

/// Saves `lines` and returns whether the file changed plus the lines whose
/// stored text differs from before.
fn write_lines<'a>(
    store: &mut Store,
    lines: &'a [PendingLine],
) -> Result<(bool, Vec<&'a PendingLine>), StoreError> {
    let mut changed_lines = Vec::new();
    for line in lines {
        if store.get_text(&line.key)?.as_deref() != Some(line.translated.as_str()) {
            changed_lines.push(line);
        }
    }

    let changed = store.save(lines.iter().map(|line| (&line.key, line.translated.as_str())))?;
    Ok((changed, changed_lines))
}

/// A parsed response waiting for validation.
#[derive(Debug, Clone)]
pub struct ValidationJob {
    pub phase: Phase,
    pub chunk: Arc<Chunk>,
    pub translations: TranslationMap,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub validated: usize,
    pub corrected: usize,
    pub deferred: usize,
    pub filtered: Vec<FilteredLine>,
    pub rejected: Vec<ChunkRejected>,
}

impl ValidationReport {
    pub fn merge(&mut self, other: ValidationReport) {
        self.validated += other.validated;
        self.corrected += other.corrected;
        self.deferred += other.deferred;
        self.filtered.extend(other.filtered);
        self.rejected.extend(other.rejected);
    }
}

/// Spawns `count` validation workers sharing one job queue.
///
/// Workers exit once every job sender is dropped and the queue is empty.
pub fn spawn_validation_workers(
    count: usize,
    jobs: mpsc::Receiver<ValidationJob>,
    pipeline: Arc<ValidationPipeline>,
    saves: mpsc::UnboundedSender<SaveRequest>,
    errors: Arc<ErrorQueue>,
    queue_item_retries: usize,
) -> Vec<JoinHandle<ValidationReport>> {
    let jobs = Arc::new(Mutex::new(jobs));
    (0..count.max(1))
        .map(|worker| {
            let jobs = jobs.clone();
            let pipeline = pipeline.clone();
            let saves = saves.clone();
            let errors = errors.clone();
            tokio::spawn(async move {
                let mut report = ValidationReport::default();
                loop {
                    let job = jobs.lock().await.recv().await;
                    let Some(job) = job else {
                        break;
                    };
                    validate_job(job, &pipeline, &saves, &errors, queue_item_retries, &mut report).await;
                }
                log::debug!("validation worker {worker} finished");
                report
            })
        })
        .collect()
}

async fn validate_job(
    job: ValidationJob,
    pipeline: &ValidationPipeline,
    saves: &mpsc::UnboundedSender<SaveRequest>,
    errors: &ErrorQueue,
    queue_item_retries: usize,
    report: &mut ValidationReport,
) {
    let ValidationJob {
        phase,
        chunk,
        translations,
    } = job;

    let validated = match pipeline.validate(&chunk, translations).await {
        Ok(validated) => validated,
        Err(rejected) => {
            log::error!("{rejected}");
            report.rejected.push(rejected);
            return;
        }
    };

    if validated.corrected {
        report.corrected += 1;
    }
    report.validated += 1;

    if !validated.translations.is_empty() {
        let request = SaveRequest::Chunk {
            phase,
            chunk: chunk.clone(),
            translations: validated.translations.clone(),
        };
        if saves.send(request).is_err() {
            log::error!("chunk {:03}: save worker is gone, lines not saved", chunk.index);
        }
    }

    for diagnostic in validated.deferred {
        report.deferred += 1;
        errors.push(
            ErrorItem::MissingLines {
                phase,
                chunk: chunk.clone(),
                translations: validated.translations.clone(),
                diagnostic,
            },
            queue_item_retries,
        );
    }
    report.filtered.extend(validated.filtered);
}

/// What a requester asks the engine for.
#[derive(Debug, Clone)]
pub enum RequestKind {
    Translate,
    /// Second pass over an existing translation.
    Refine { initial: TranslationMap },
}

#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub chunk: Arc<Chunk>,
    pub kind: RequestKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub phase: Phase,
    /// `None` when the task died before reporting its chunk.
    pub chunk: Option<usize>,
    pub error: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.chunk {
            Some(chunk) => write!(f, "{} chunk {chunk:03}: {}", self.phase.label(), self.error),
            None => write!(f, "{} task: {}", self.phase.label(), self.error),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestReport {
    pub translated: usize,
    /// Refinements that failed and keep the initial translation.
    pub fallbacks: usize,
    pub failures: Vec<TaskFailure>,
}

#[derive(Debug, Clone)]
pub struct RequestSettings {
    pub phase: Phase,
    pub max_concurrent: usize,
    /// Extra attempts after a service failure.
    pub task_retries: usize,
    pub glossary_hints: Option<String>,
}

enum RequestOutcome {
    Translated,
    FellBack,
}

/// Sends every request to the engine with at most `max_concurrent` in flight,
/// then awaits all of them. Parsed responses go to `jobs`.
pub async fn run_requests(
    engine: Arc<TranslationEngine>,
    requests: Vec<ChunkRequest>,
    settings: RequestSettings,
    jobs: mpsc::Sender<ValidationJob>,
) -> RequestReport {
    let semaphore = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
    let settings = Arc::new(settings);
    let mut tasks = JoinSet::new();
    let mut report = RequestReport::default();

    for request in requests {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(err) => {
                report.failures.push(TaskFailure {
                    phase: settings.phase,
                    chunk: Some(request.chunk.index),
                    error: err.to_string(),
                });
                continue;
            }
        };
        let engine = engine.clone();
        let settings = settings.clone();
        let jobs = jobs.clone();
        tasks.spawn(async move {
            let _permit = permit;
            request_chunk(&engine, request, &settings, &jobs).await
        });
    }
    drop(jobs);

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(RequestOutcome::Translated)) => report.translated += 1,
            Ok(Ok(RequestOutcome::FellBack)) => report.fallbacks += 1,
            Ok(Err(failure)) => report.failures.push(failure),
            Err(err) => {
                log::error!("{} request task died: {err}", settings.phase.label());
                report.failures.push(TaskFailure {
                    phase: settings.phase,
                    chunk: None,
                    error: err.to_string(),
                });
            }
        }
    }
    report
}

async fn request_chunk(
    engine: &TranslationEngine,
    request: ChunkRequest,
    settings: &RequestSettings,
    jobs: &mpsc::Sender<ValidationJob>,
) -> Result<RequestOutcome, TaskFailure> {
    let chunk = request.chunk;
    let context = engine.context();
    let mut attempt = 0;

    let translations = loop {
        let hints = settings.glossary_hints.clone();
        let result = match &request.kind {
            RequestKind::Translate => engine.translate_chunk(&chunk, hints, GenerationMode::Normal).await,
            RequestKind::Refine { initial } => {
                engine
                    .refine_chunk(&chunk, initial, hints, GenerationMode::Normal)
                    .await
            }
        };

        match result {
            Ok(translations) => break translations,
            Err(EngineError::Decode(err)) => {
                log::warn!(
                    "chunk {:03}: unusable response ({err}), every line goes to correction",
                    chunk.index
                );
                break TranslationMap::new();
            }
            Err(EngineError::Service(err)) if attempt < settings.task_retries => {
                attempt += 1;
                log::warn!(
                    "chunk {:03}: {err}; resubmitting ({attempt}/{})",
                    chunk.index,
                    settings.task_retries
                );
            }
            Err(EngineError::Service(err)) => {
                if matches!(request.kind, RequestKind::Refine { .. }) {
                    log::warn!(
                        "chunk {:03}: refinement failed ({err}), keeping the initial translation",
                        chunk.index
                    );
                    return Ok(RequestOutcome::FellBack);
                }
                context.record(RunEvent::TaskFailed {
                    chunk: chunk.index,
                    error: err.to_string(),
                });
                return Err(TaskFailure {
                    phase: settings.phase,
                    chunk: Some(chunk.index),
                    error: err.to_string(),
                });
            }
        }
    };

    context.record(RunEvent::ChunkTranslated {
        chunk: chunk.index,
        lines: translations.len(),
    });
    let job = ValidationJob {
        phase: settings.phase,
        chunk: chunk.clone(),
        translations,
    };
    jobs.send(job).await.map_err(|_| TaskFailure {
        phase: settings.phase,
        chunk: Some(chunk.index),
        error: "validation workers stopped before the response was checked".into(),
    })?;
    Ok(RequestOutcome::Translated)
}
