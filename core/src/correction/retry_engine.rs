use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::ai::GenerationMode;
use crate::codec::{fragment_count, preview_list, TranslationMap};
use crate::document::FragmentMismatch;
use crate::engine::{EngineError, TranslationEngine};
use crate::run_context::{RunContext, RunEvent};
use crate::segment::Chunk;

/// Corrective request for a subset of a chunk's body lines.
#[derive(Debug, Clone)]
pub struct LineRequest<'a> {
    pub chunk: &'a Chunk,
    pub indices: Vec<usize>,
    pub error_message: String,
}

/// One escalation level. Every level answers the same two kinds of request
/// and is validated by the same contract.
#[async_trait]
pub trait RetryStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn retranslate_lines(&self, request: &LineRequest<'_>) -> Result<TranslationMap, EngineError>;

    async fn repair_fragments(&self, mismatch: &FragmentMismatch) -> Result<String, EngineError>;
}

/// How an [`EngineStrategy`] asks for a broken fragment sequence again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentRepairStyle {
    /// Whole line again, with the wrong segmentation shown to the model.
    Reinforced,
    /// One numbered line per source fragment.
    Strict,
}

pub struct EngineStrategy {
    engine: Arc<TranslationEngine>,
    mode: GenerationMode,
    repair_style: FragmentRepairStyle,
}

impl EngineStrategy {
    pub fn new(engine: Arc<TranslationEngine>, mode: GenerationMode, repair_style: FragmentRepairStyle) -> Self {
        Self {
            engine,
            mode,
            repair_style,
        }
    }

    pub fn normal(engine: Arc<TranslationEngine>) -> Self {
        Self::new(engine, GenerationMode::Normal, FragmentRepairStyle::Reinforced)
    }

    pub fn reasoning(engine: Arc<TranslationEngine>) -> Self {
        Self::new(engine, GenerationMode::Reasoning, FragmentRepairStyle::Strict)
    }
}

#[async_trait]
impl RetryStrategy for EngineStrategy {
    fn name(&self) -> &str {
        self.mode.label()
    }

    async fn retranslate_lines(&self, request: &LineRequest<'_>) -> Result<TranslationMap, EngineError> {
        self.engine
            .retranslate_lines(request.chunk, &request.indices, &request.error_message, self.mode)
            .await
    }

    async fn repair_fragments(&self, mismatch: &FragmentMismatch) -> Result<String, EngineError> {
        match self.repair_style {
            FragmentRepairStyle::Reinforced => {
                self.engine.repair_fragments_reinforced(mismatch, self.mode).await
            }
            FragmentRepairStyle::Strict => self.engine.repair_fragments_strict(mismatch, self.mode).await,
        }
    }
}

/// Returned index set differs from the requested one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("retry returned the wrong lines (missing: [{}], unexpected: [{}])", preview_list(.missing, 10), preview_list(.extra, 10))]
pub struct RetryIndexMismatch {
    pub missing: Vec<usize>,
    pub extra: Vec<usize>,
}

/// A targeted retry is usable only when it returns exactly the requested lines.
pub fn validate_retry_indices(
    result: &TranslationMap,
    requested: &[usize],
) -> Result<(), RetryIndexMismatch> {
    let missing: Vec<usize> = requested
        .iter()
        .copied()
        .filter(|index| !result.contains_key(index))
        .collect();
    let extra: Vec<usize> = result
        .keys()
        .copied()
        .filter(|index| !requested.contains(index))
        .collect();

    if missing.is_empty() && extra.is_empty() {
        Ok(())
    } else {
        Err(RetryIndexMismatch { missing, extra })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub strategy: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineCorrection {
    Accepted {
        translations: TranslationMap,
        strategy: String,
        attempts: usize,
    },
    Rejected {
        failures: Vec<AttemptFailure>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FragmentCorrection {
    Accepted {
        translation: String,
        strategy: String,
    },
    Rejected {
        failures: Vec<AttemptFailure>,
    },
}

/// Escalating correction: attempt `k` runs `strategies[min(k, len - 1)]`.
pub struct RetryEngine {
    strategies: Vec<Arc<dyn RetryStrategy>>,
    max_attempts: usize,
    context: Arc<RunContext>,
}

impl RetryEngine {
    pub fn new(strategies: Vec<Arc<dyn RetryStrategy>>, context: Arc<RunContext>) -> Self {
        let max_attempts = strategies.len();
        Self {
            strategies,
            max_attempts,
            context,
        }
    }

    /// `[normal, reasoning]` over the given engine.
    pub fn standard(engine: Arc<TranslationEngine>) -> Self {
        let context = engine.context().clone();
        Self::new(
            vec![
                Arc::new(EngineStrategy::normal(engine.clone())),
                Arc::new(EngineStrategy::reasoning(engine)),
            ],
            context,
        )
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn strategy_for(&self, attempt: usize) -> Option<&Arc<dyn RetryStrategy>> {
        let last = self.strategies.len().checked_sub(1)?;
        self.strategies.get(attempt.min(last))
    }

    fn record_attempt(&self, label: &str, strategy: &str, accepted: bool) {
        self.context.record(RunEvent::CorrectionAttempt {
            label: label.to_string(),
            strategy: strategy.to_string(),
            accepted,
        });
    }

    /// Re-requests `request.indices` until `accept` approves the merged map.
    ///
    /// A result whose index set is not exactly the requested one is never
    /// merged. `accept` sees `current` with the retried lines overlaid, and
    /// its rejection reason becomes the error message of the next attempt.
    pub async fn correct_lines<F>(
        &self,
        request: LineRequest<'_>,
        current: &TranslationMap,
        accept: F,
    ) -> LineCorrection
    where
        F: Fn(&TranslationMap) -> Result<(), String> + Send + Sync,
    {
        let label = format!("chunk {:03}", request.chunk.index);
        let mut error_message = request.error_message.clone();
        let mut failures = Vec::new();

        for attempt in 0..self.max_attempts {
            let Some(strategy) = self.strategy_for(attempt) else {
                break;
            };
            let attempt_request = LineRequest {
                chunk: request.chunk,
                indices: request.indices.clone(),
                error_message: error_message.clone(),
            };
            log::info!(
                "{label}: {} retry for {} line(s) (attempt {}/{})",
                strategy.name(),
                request.indices.len(),
                attempt + 1,
                self.max_attempts
            );

            let reason = match strategy.retranslate_lines(&attempt_request).await {
                Err(err) => err.to_string(),
                Ok(result) => match validate_retry_indices(&result, &request.indices) {
                    Err(mismatch) => mismatch.to_string(),
                    Ok(()) => {
                        let mut merged = current.clone();
                        merged.extend(result);
                        match accept(&merged) {
                            Ok(()) => {
                                self.record_attempt(&label, strategy.name(), true);
                                return LineCorrection::Accepted {
                                    translations: merged,
                                    strategy: strategy.name().to_string(),
                                    attempts: attempt + 1,
                                };
                            }
                            Err(reason) => {
                                error_message = reason.clone();
                                reason
                            }
                        }
                    }
                },
            };

            log::warn!("{label}: {} retry rejected: {reason}", strategy.name());
            self.record_attempt(&label, strategy.name(), false);
            failures.push(AttemptFailure {
                strategy: strategy.name().to_string(),
                reason,
            });
        }

        LineCorrection::Rejected { failures }
    }

    /// Asks for `mismatch.key` again until the separator count matches.
    pub async fn repair_fragments(&self, mismatch: &FragmentMismatch) -> FragmentCorrection {
        let label = mismatch.key.to_string();
        let mut failures = Vec::new();

        for attempt in 0..self.max_attempts {
            let Some(strategy) = self.strategy_for(attempt) else {
                break;
            };
            let reason = match strategy.repair_fragments(mismatch).await {
                Err(err) => err.to_string(),
                Ok(translation) => {
                    let actual = fragment_count(&translation);
                    if actual == mismatch.expected {
                        self.record_attempt(&label, strategy.name(), true);
                        return FragmentCorrection::Accepted {
                            translation,
                            strategy: strategy.name().to_string(),
                        };
                    }
                    format!("expected {} fragments, got {actual}", mismatch.expected)
                }
            };

            log::warn!("{label}: {} fragment repair rejected: {reason}", strategy.name());
            self.record_attempt(&label, strategy.name(), false);
            failures.push(AttemptFailure {
                strategy: strategy.name().to_string(),
                reason,
            });
        }

        FragmentCorrection::Rejected { failures }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::CompletionError;
    use crate::document::{TagKey, TextNode};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned answers and records which indices were requested.
    struct CannedStrategy {
        name: &'static str,
        lines: Mutex<VecDeque<Result<TranslationMap, EngineError>>>,
        repairs: Mutex<VecDeque<String>>,
        requested: Mutex<Vec<Vec<usize>>>,
    }

    impl CannedStrategy {
        fn new(name: &'static str, lines: Vec<Result<TranslationMap, EngineError>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                lines: Mutex::new(lines.into()),
                repairs: Mutex::new(VecDeque::new()),
                requested: Mutex::new(Vec::new()),
            })
        }

        fn repairing(name: &'static str, repairs: &[&str]) -> Arc<Self> {
            let strategy = Self::new(name, Vec::new());
            *strategy.repairs.lock().unwrap() = repairs.iter().map(|r| r.to_string()).collect();
            strategy
        }
    }

    #[async_trait]
    impl RetryStrategy for CannedStrategy {
        fn name(&self) -> &str {
            self.name
        }

        async fn retranslate_lines(&self, request: &LineRequest<'_>) -> Result<TranslationMap, EngineError> {
            self.requested.lock().unwrap().push(request.indices.clone());
            self.lines
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CompletionError::permanent("no more answers").into()))
        }

        async fn repair_fragments(&self, _mismatch: &FragmentMismatch) -> Result<String, EngineError> {
            self.repairs
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| CompletionError::permanent("no more answers").into())
        }
    }

    fn lines(indices: impl IntoIterator<Item = usize>) -> TranslationMap {
        indices.into_iter().map(|index| (index, format!("ligne {index}"))).collect()
    }

    fn chunk(len: usize) -> Chunk {
        Chunk {
            index: 7,
            head: Vec::new(),
            body: (0..len)
                .map(|index| TextNode::new(TagKey::new("ch1.xhtml", "p", index), vec![format!("line {index}")]))
                .collect(),
            tail: Vec::new(),
            file_range: ("ch1.xhtml".into(), "ch1.xhtml".into()),
        }
    }

    fn complete(len: usize) -> impl Fn(&TranslationMap) -> Result<(), String> + Send + Sync {
        move |merged: &TranslationMap| {
            if merged.len() == len {
                Ok(())
            } else {
                Err(format!("expected {len} lines, got {}", merged.len()))
            }
        }
    }

    fn engine_of(strategies: Vec<Arc<dyn RetryStrategy>>) -> RetryEngine {
        RetryEngine::new(strategies, Arc::new(RunContext::detached()))
    }

    #[test]
    fn retry_indices_must_match_exactly() {
        let result: TranslationMap = [(5, "a".to_string()), (10, "b".to_string())].into();
        assert_eq!(
            validate_retry_indices(&result, &[5, 10, 15]),
            Err(RetryIndexMismatch {
                missing: vec![15],
                extra: vec![]
            })
        );
        assert_eq!(validate_retry_indices(&result, &[5, 10]), Ok(()));
        assert_eq!(
            validate_retry_indices(&result, &[5]).unwrap_err().extra,
            vec![10]
        );
    }

    #[tokio::test]
    async fn missing_lines_are_requested_and_merged() {
        let chunk = chunk(47);
        let current = lines(0..17);
        let normal = CannedStrategy::new("normal", vec![Ok(lines(17..47))]);
        let engine = engine_of(vec![normal.clone()]);

        let request = LineRequest {
            chunk: &chunk,
            indices: (17..47).collect(),
            error_message: "missing 30 lines".into(),
        };
        let outcome = engine.correct_lines(request, &current, complete(47)).await;

        let LineCorrection::Accepted { translations, attempts, .. } = outcome else {
            panic!("expected acceptance");
        };
        assert_eq!(translations.len(), 47);
        assert_eq!(attempts, 1);
        assert_eq!(normal.requested.lock().unwrap()[0].len(), 30);
    }

    #[tokio::test]
    async fn partial_retry_is_not_merged_and_escalates() {
        let chunk = chunk(20);
        let current = lines(0..17);
        let normal = CannedStrategy::new("normal", vec![Ok(lines(17..19))]);
        let reasoning = CannedStrategy::new("reasoning", vec![Ok(lines(17..20))]);
        let engine = engine_of(vec![normal.clone(), reasoning.clone()]);

        let request = LineRequest {
            chunk: &chunk,
            indices: vec![17, 18, 19],
            error_message: "missing".into(),
        };
        let outcome = engine.correct_lines(request, &current, complete(20)).await;

        match outcome {
            LineCorrection::Accepted { strategy, attempts, .. } => {
                assert_eq!(strategy, "reasoning");
                assert_eq!(attempts, 2);
            }
            other => panic!("expected acceptance, got {other:?}"),
        }
        assert_eq!(engine.context.metrics().correction_attempts, 2);
        assert_eq!(engine.context.metrics().correction_successes, 1);
    }

    #[tokio::test]
    async fn rejects_after_every_level_fails() {
        let chunk = chunk(3);
        let current = lines(0..1);
        let normal = CannedStrategy::new("normal", vec![Ok(lines(1..2))]);
        let reasoning = CannedStrategy::new(
            "reasoning",
            vec![Err(CompletionError::permanent("invalid key").into())],
        );
        let engine = engine_of(vec![normal, reasoning]);

        let request = LineRequest {
            chunk: &chunk,
            indices: vec![1, 2],
            error_message: "missing".into(),
        };
        let LineCorrection::Rejected { failures } =
            engine.correct_lines(request, &current, complete(3)).await
        else {
            panic!("expected rejection");
        };
        assert_eq!(failures.len(), 2);
        assert!(failures[0].reason.contains("missing: [2]"));
        assert!(failures[1].reason.contains("invalid key"));
    }

    #[tokio::test]
    async fn last_strategy_repeats_past_the_list() {
        let chunk = chunk(2);
        let reasoning = CannedStrategy::new("reasoning", vec![Ok(lines(5..6)), Ok(lines(1..2))]);
        let engine = engine_of(vec![reasoning.clone()]).with_max_attempts(3);

        let request = LineRequest {
            chunk: &chunk,
            indices: vec![1],
            error_message: "missing".into(),
        };
        let outcome = engine.correct_lines(request, &lines(0..1), complete(2)).await;
        assert!(matches!(outcome, LineCorrection::Accepted { attempts: 2, .. }));
        assert_eq!(reasoning.requested.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fragment_repair_requires_matching_separators() {
        let mismatch = FragmentMismatch {
            key: TagKey::new("ch1.xhtml", "p", 0),
            original_fragments: vec!["Hello".into(), "beautiful".into(), "world".into()],
            translated_segments: vec!["Bonjour".into(), "monde magnifique".into()],
            original_text: "Hello</>beautiful</>world".into(),
            expected: 3,
            actual: 2,
        };
        let normal = CannedStrategy::repairing("normal", &["Bonjour</>monde magnifique"]);
        let reasoning = CannedStrategy::repairing("reasoning", &["Bonjour</>magnifique</>monde"]);
        let engine = engine_of(vec![normal, reasoning]);

        let outcome = engine.repair_fragments(&mismatch).await;
        assert_eq!(
            outcome,
            FragmentCorrection::Accepted {
                translation: "Bonjour</>magnifique</>monde".into(),
                strategy: "reasoning".into()
            }
        );
    }
}
