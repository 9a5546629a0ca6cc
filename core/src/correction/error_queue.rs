use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;

use crate::checks::Diagnostic;
use crate::codec::TranslationMap;
use crate::document::FragmentMismatch;
use crate::segment::Chunk;
use crate::store::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingLines,
    FragmentMismatch,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::MissingLines => "missing_lines",
            ErrorKind::FragmentMismatch => "fragment_mismatch",
        }
    }
}

/// Work left over for the correction pool.
#[derive(Debug, Clone)]
pub enum ErrorItem {
    /// Lines of a chunk that still failed a check after inline retries.
    MissingLines {
        phase: Phase,
        chunk: Arc<Chunk>,
        /// Lines of the chunk that are already accepted.
        translations: TranslationMap,
        diagnostic: Diagnostic,
    },
    /// A stored translation that does not split into the original fragments.
    FragmentMismatch {
        phase: Phase,
        mismatch: Box<FragmentMismatch>,
    },
}

impl ErrorItem {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorItem::MissingLines { .. } => ErrorKind::MissingLines,
            ErrorItem::FragmentMismatch { .. } => ErrorKind::FragmentMismatch,
        }
    }

    pub fn label(&self) -> String {
        match self {
            ErrorItem::MissingLines { chunk, diagnostic, .. } => {
                format!("chunk {:03} ({} line(s))", chunk.index, diagnostic.lines.len())
            }
            ErrorItem::FragmentMismatch { mismatch, .. } => mismatch.key.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedError {
    pub id: u64,
    pub item: ErrorItem,
    pub attempts: usize,
    pub max_retries: usize,
}

/// An item that exhausted its retries.
#[derive(Debug, Clone)]
pub struct FailedCorrection {
    pub item: ErrorItem,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorQueueStats {
    pub total: usize,
    pub corrected: usize,
    pub failed: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub by_kind: BTreeMap<ErrorKind, usize>,
}

#[derive(Debug, Error)]
#[error("error queue not drained after {waited:?}: {pending} pending, {in_flight} in progress")]
pub struct DrainTimeout {
    pub waited: Duration,
    pub pending: usize,
    pub in_flight: usize,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedError>,
    in_flight: usize,
    next_id: u64,
    closed: bool,
    stats: ErrorQueueStats,
    failures: Vec<FailedCorrection>,
}

/// Shared queue of correction work. Items are taken by correction workers
/// and either completed, re-queued or marked failed.
#[derive(Default)]
pub struct ErrorQueue {
    state: Mutex<QueueState>,
    /// Signalled when an item becomes available or the queue closes.
    available: Notify,
}

impl ErrorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, item: ErrorItem, max_retries: usize) -> u64 {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.stats.total += 1;
        *state.stats.by_kind.entry(item.kind()).or_insert(0) += 1;
        log::info!("queued {} for correction: {}", item.kind().label(), item.label());
        state.pending.push_back(QueuedError {
            id,
            item,
            attempts: 0,
            max_retries,
        });
        drop(state);
        self.available.notify_one();
        id
    }

    /// Takes the next item; it counts as in flight until completed, failed or re-queued.
    pub fn pop(&self) -> Option<QueuedError> {
        let mut state = self.lock();
        let next = state.pending.pop_front()?;
        state.in_flight += 1;
        Some(next)
    }

    pub fn complete(&self, _queued: QueuedError) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.stats.corrected += 1;
    }

    /// Puts an item back after a failed attempt, or records it as failed
    /// once its retries are used up. Returns `true` when re-queued.
    pub fn retry_or_fail(&self, mut queued: QueuedError, reason: String) -> bool {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        queued.attempts += 1;
        if queued.attempts < queued.max_retries.max(1) {
            state.pending.push_back(queued);
            drop(state);
            self.available.notify_one();
            true
        } else {
            log::error!("correction of {} failed: {reason}", queued.item.label());
            state.stats.failed += 1;
            state.failures.push(FailedCorrection {
                item: queued.item,
                reason,
            });
            false
        }
    }

    pub fn is_drained(&self) -> bool {
        let state = self.lock();
        state.pending.is_empty() && state.in_flight == 0
    }

    pub fn stats(&self) -> ErrorQueueStats {
        let state = self.lock();
        ErrorQueueStats {
            pending: state.pending.len(),
            in_flight: state.in_flight,
            ..state.stats.clone()
        }
    }

    pub fn take_failures(&self) -> Vec<FailedCorrection> {
        std::mem::take(&mut self.lock().failures)
    }

    /// Makes idle workers stop once the queue is empty.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Waits, polling every `poll`, until nothing is pending or in flight.
    pub async fn drain(&self, timeout: Duration, poll: Duration) -> Result<ErrorQueueStats, DrainTimeout> {
        let started = Instant::now();
        loop {
            if self.is_drained() {
                return Ok(self.stats());
            }
            let waited = started.elapsed();
            if waited >= timeout {
                let stats = self.stats();
                return Err(DrainTimeout {
                    waited,
                    pending: stats.pending,
                    in_flight: stats.in_flight,
                });
            }
            tokio::time::sleep(poll.min(timeout - waited)).await;
        }
    }

    /// Next item for a worker; `None` once the queue is closed and empty.
    pub async fn next(&self) -> Option<QueuedError> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(queued) = self.pop() {
                return Some(queued);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }
}
