//! Escalating correction of rejected lines and broken fragment sequences.

pub mod error_queue;
pub mod retry_engine;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::checks::ValidationPipeline;
use crate::codec::TranslationMap;
use crate::workers::SaveRequest;

pub use error_queue::{
    DrainTimeout, ErrorItem, ErrorKind, ErrorQueue, ErrorQueueStats, FailedCorrection, QueuedError,
};
pub use retry_engine::{
    validate_retry_indices, AttemptFailure, EngineStrategy, FragmentCorrection, FragmentRepairStyle,
    LineCorrection, LineRequest, RetryEngine, RetryIndexMismatch, RetryStrategy,
};

/// Spawns `count` workers that take items off `queue` until it is closed and empty.
///
/// Corrected lines go to the save worker; failures are re-queued by the
/// queue until the item's own retry limit.
pub fn spawn_correction_workers(
    count: usize,
    queue: Arc<ErrorQueue>,
    retry: Arc<RetryEngine>,
    pipeline: Arc<ValidationPipeline>,
    saves: mpsc::UnboundedSender<SaveRequest>,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker| {
            let queue = queue.clone();
            let retry = retry.clone();
            let pipeline = pipeline.clone();
            let saves = saves.clone();
            tokio::spawn(async move {
                while let Some(queued) = queue.next().await {
                    match correct(&queued.item, &retry, &pipeline, &saves).await {
                        Ok(()) => queue.complete(queued),
                        Err(reason) => {
                            queue.retry_or_fail(queued, reason);
                        }
                    }
                }
                log::debug!("correction worker {worker} finished");
            })
        })
        .collect()
}

async fn correct(
    item: &ErrorItem,
    retry: &RetryEngine,
    pipeline: &ValidationPipeline,
    saves: &mpsc::UnboundedSender<SaveRequest>,
) -> Result<(), String> {
    let request = match item {
        ErrorItem::MissingLines {
            phase,
            chunk,
            translations,
            diagnostic,
        } => {
            let requested = diagnostic.lines.clone();
            let line_request = LineRequest {
                chunk,
                indices: requested.clone(),
                error_message: diagnostic.detailed(),
            };
            let accept = |merged: &TranslationMap| pipeline.check_lines(chunk, merged, &requested);
            match retry.correct_lines(line_request, translations, accept).await {
                LineCorrection::Accepted { translations, .. } => SaveRequest::Chunk {
                    phase: *phase,
                    chunk: chunk.clone(),
                    translations: translations
                        .into_iter()
                        .filter(|(index, _)| requested.contains(index))
                        .collect(),
                },
                LineCorrection::Rejected { failures } => return Err(last_reason(&failures)),
            }
        }
        ErrorItem::FragmentMismatch { phase, mismatch } => match retry.repair_fragments(mismatch).await {
            FragmentCorrection::Accepted { translation, .. } => SaveRequest::Entry {
                phase: *phase,
                key: mismatch.key.clone(),
                translation,
            },
            FragmentCorrection::Rejected { failures } => return Err(last_reason(&failures)),
        },
    };

    saves
        .send(request)
        .map_err(|_| "save worker stopped before the correction was stored".to_string())
}

fn last_reason(failures: &[AttemptFailure]) -> String {
    failures
        .last()
        .map(|failure| format!("{}: {}", failure.strategy, failure.reason))
        .unwrap_or_else(|| "no correction strategy available".to_string())
}
