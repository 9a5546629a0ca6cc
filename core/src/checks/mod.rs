//! Structural checks run on a parsed chunk translation before it is saved.

pub mod fragment_count;
pub mod line_count;
pub mod punctuation;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::codec::TranslationMap;
use crate::correction::retry_engine::{AttemptFailure, LineCorrection, LineRequest, RetryEngine};
use crate::run_context::{RunContext, RunEvent};
use crate::segment::Chunk;

pub use fragment_count::FragmentCountCheck;
pub use line_count::LineCountCheck;
pub use punctuation::PunctuationCheck;

/// Why a check failed, with enough context to build a corrective prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub check: String,
    pub message: String,
    /// Body lines that must be translated again.
    pub lines: Vec<usize>,
    /// Indices present in the output that the chunk does not have.
    pub unexpected: Vec<usize>,
    pub expected: usize,
    pub actual: usize,
    pub previews: Vec<String>,
}

impl Diagnostic {
    /// Message plus previews, as shown to the model on a retry.
    pub fn detailed(&self) -> String {
        if self.previews.is_empty() {
            self.to_string()
        } else {
            format!("{self}\n{}", self.previews.join("\n"))
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.check, self.message)
    }
}

pub trait Check: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, chunk: &Chunk, translations: &TranslationMap) -> Result<(), Diagnostic>;
}

/// What happens to lines that are still wrong once every retry level failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectionPolicy {
    /// The whole chunk fails and is reported as a failed task.
    Fail,
    /// The offending lines are dropped and reported; the rest is saved.
    #[default]
    Exclude,
    /// The offending lines are handed to the error queue for a later pass.
    Requeue,
}

/// One body line left out of the output, with what is needed to redo it by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilteredLine {
    pub document_id: String,
    pub chunk_index: usize,
    pub line_index: usize,
    pub check: String,
    pub reason: String,
    pub original_text: String,
    pub translated_text: String,
}

#[derive(Debug, Clone, Error)]
#[error("chunk {chunk} rejected after {} attempt(s): {diagnostic}", .attempts.len())]
pub struct ChunkRejected {
    pub chunk: usize,
    pub diagnostic: Diagnostic,
    pub attempts: Vec<AttemptFailure>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidatedChunk {
    /// Lines that passed every check, possibly after correction.
    pub translations: TranslationMap,
    pub corrected: bool,
    pub filtered: Vec<FilteredLine>,
    /// Failures left for the error queue under [`RejectionPolicy::Requeue`].
    pub deferred: Vec<Diagnostic>,
}

/// Runs the checks in order and routes any failure through the [`RetryEngine`].
pub struct ValidationPipeline {
    checks: Vec<Arc<dyn Check>>,
    retry: Arc<RetryEngine>,
    policy: RejectionPolicy,
    context: Arc<RunContext>,
}

impl ValidationPipeline {
    pub fn new(
        checks: Vec<Arc<dyn Check>>,
        retry: Arc<RetryEngine>,
        policy: RejectionPolicy,
        context: Arc<RunContext>,
    ) -> Self {
        Self {
            checks,
            retry,
            policy,
            context,
        }
    }

    /// Line count, fragment count, then punctuation.
    pub fn standard(retry: Arc<RetryEngine>, policy: RejectionPolicy, context: Arc<RunContext>) -> Self {
        Self::new(
            vec![
                Arc::new(LineCountCheck),
                Arc::new(FragmentCountCheck),
                Arc::new(PunctuationCheck),
            ],
            retry,
            policy,
            context,
        )
    }

    pub fn policy(&self) -> RejectionPolicy {
        self.policy
    }

    /// First failing check, without any correction.
    pub fn check_all(&self, chunk: &Chunk, translations: &TranslationMap) -> Result<(), Diagnostic> {
        self.checks
            .iter()
            .try_for_each(|check| check.check(chunk, translations))
    }

    /// Runs every check on `merged`, failing only on problems that touch `requested`.
    pub fn check_lines(
        &self,
        chunk: &Chunk,
        merged: &TranslationMap,
        requested: &[usize],
    ) -> Result<(), String> {
        check_lines(&self.checks, chunk, merged, requested)
    }

    pub async fn validate(
        &self,
        chunk: &Chunk,
        translations: TranslationMap,
    ) -> Result<ValidatedChunk, ChunkRejected> {
        let mut current = translations;
        let body_len = chunk.body.len();
        let before = current.len();
        current.retain(|index, _| *index < body_len);
        if current.len() != before {
            log::warn!(
                "chunk {:03}: dropped {} line(s) outside the body",
                chunk.index,
                before - current.len()
            );
        }

        let mut validated = ValidatedChunk::default();

        for (position, check) in self.checks.iter().enumerate() {
            let diagnostic = match check.check(chunk, &current) {
                Ok(()) => continue,
                Err(diagnostic) if diagnostic.lines.is_empty() => {
                    log::debug!("chunk {:03}: ignoring {diagnostic}", chunk.index);
                    continue;
                }
                Err(diagnostic) => diagnostic,
            };

            log::warn!("chunk {:03}: {diagnostic}", chunk.index);
            self.context.record(RunEvent::CheckFailed {
                chunk: chunk.index,
                check: diagnostic.check.clone(),
                message: diagnostic.message.clone(),
            });

            let applied = &self.checks[..=position];
            let requested = diagnostic.lines.clone();
            let accept = |merged: &TranslationMap| check_lines(applied, chunk, merged, &requested);

            let request = LineRequest {
                chunk,
                indices: diagnostic.lines.clone(),
                error_message: diagnostic.detailed(),
            };
            match self.retry.correct_lines(request, &current, accept).await {
                LineCorrection::Accepted { translations, .. } => {
                    current = translations;
                    validated.corrected = true;
                }
                LineCorrection::Rejected { failures } => {
                    self.context.record(RunEvent::ChunkRejected {
                        chunk: chunk.index,
                        check: diagnostic.check.clone(),
                        lines: diagnostic.lines.clone(),
                    });
                    match self.policy {
                        RejectionPolicy::Fail => {
                            return Err(ChunkRejected {
                                chunk: chunk.index,
                                diagnostic,
                                attempts: failures,
                            });
                        }
                        RejectionPolicy::Exclude => {
                            let reason = failures
                                .last()
                                .map(|failure| failure.reason.clone())
                                .unwrap_or_else(|| diagnostic.message.clone());
                            for index in &diagnostic.lines {
                                validated.filtered.push(filtered_line(
                                    chunk,
                                    *index,
                                    &diagnostic.check,
                                    &reason,
                                    current.remove(index),
                                ));
                            }
                        }
                        RejectionPolicy::Requeue => {
                            for index in &diagnostic.lines {
                                current.remove(index);
                            }
                            validated.deferred.push(diagnostic);
                        }
                    }
                }
            }
        }

        if validated.filtered.is_empty() && validated.deferred.is_empty() {
            self.context.record(RunEvent::ChunkValidated {
                chunk: chunk.index,
                corrected: validated.corrected,
            });
        }
        validated.translations = current;
        Ok(validated)
    }
}

fn check_lines(
    checks: &[Arc<dyn Check>],
    chunk: &Chunk,
    merged: &TranslationMap,
    requested: &[usize],
) -> Result<(), String> {
    for check in checks {
        if let Err(failure) = check.check(chunk, merged) {
            if failure.lines.iter().any(|index| requested.contains(index)) {
                return Err(failure.detailed());
            }
        }
    }
    Ok(())
}

fn filtered_line(
    chunk: &Chunk,
    index: usize,
    check: &str,
    reason: &str,
    translated: Option<String>,
) -> FilteredLine {
    let node = chunk.body.get(index);
    FilteredLine {
        document_id: node
            .map(|node| node.key.document_id.clone())
            .unwrap_or_default(),
        chunk_index: chunk.index,
        line_index: index,
        check: check.to_string(),
        reason: reason.to_string(),
        original_text: node.map(|node| node.text()).unwrap_or_default(),
        translated_text: translated.unwrap_or_default(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::correction::retry_engine::RetryStrategy;
    use crate::document::{FragmentMismatch, TagKey, TextNode};
    use crate::engine::EngineError;
    use crate::ai::CompletionError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub(crate) fn chunk_of(lines: &[&str]) -> Chunk {
        Chunk {
            index: 0,
            head: Vec::new(),
            body: lines
                .iter()
                .enumerate()
                .map(|(index, line)| {
                    TextNode::new(TagKey::new("ch1.xhtml", "p", index), vec![line.to_string()])
                })
                .collect(),
            tail: Vec::new(),
            file_range: ("ch1.xhtml".into(), "ch1.xhtml".into()),
        }
    }

    pub(crate) fn map_of(lines: &[(usize, &str)]) -> TranslationMap {
        lines
            .iter()
            .map(|(index, text)| (*index, text.to_string()))
            .collect()
    }

    struct Replay(Mutex<VecDeque<TranslationMap>>);

    #[async_trait]
    impl RetryStrategy for Replay {
        fn name(&self) -> &str {
            "replay"
        }

        async fn retranslate_lines(&self, _request: &LineRequest<'_>) -> Result<TranslationMap, EngineError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| CompletionError::permanent("exhausted").into())
        }

        async fn repair_fragments(&self, _mismatch: &FragmentMismatch) -> Result<String, EngineError> {
            Err(CompletionError::permanent("unused").into())
        }
    }

    fn pipeline(answers: Vec<TranslationMap>, policy: RejectionPolicy) -> ValidationPipeline {
        let context = Arc::new(RunContext::detached());
        let retry = RetryEngine::new(vec![Arc::new(Replay(Mutex::new(answers.into())))], context.clone())
            .with_max_attempts(2);
        ValidationPipeline::standard(Arc::new(retry), policy, context)
    }

    #[tokio::test]
    async fn clean_output_passes_untouched() {
        let chunk = chunk_of(&["One", "Two"]);
        let validated = pipeline(Vec::new(), RejectionPolicy::Fail)
            .validate(&chunk, map_of(&[(0, "Un"), (1, "Deux")]))
            .await
            .unwrap();
        assert!(!validated.corrected);
        assert_eq!(validated.translations.len(), 2);
    }

    #[tokio::test]
    async fn missing_lines_are_corrected_and_out_of_range_lines_dropped() {
        let chunk = chunk_of(&["One", "Two", "Three"]);
        let pipeline = pipeline(vec![map_of(&[(1, "Deux"), (2, "Trois")])], RejectionPolicy::Fail);
        let validated = pipeline
            .validate(&chunk, map_of(&[(0, "Un"), (9, "Neuf")]))
            .await
            .unwrap();
        assert!(validated.corrected);
        assert_eq!(
            validated.translations.values().cloned().collect::<Vec<_>>(),
            vec!["Un", "Deux", "Trois"]
        );
        assert_eq!(pipeline.context.metrics().chunks_corrected, 1);
    }

    #[tokio::test]
    async fn exclude_policy_reports_filtered_lines() {
        let chunk = chunk_of(&["“Hi,” she said.", "Bye."]);
        let pipeline = pipeline(
            vec![map_of(&[(0, "« Salut, dit-elle.")]), map_of(&[(0, "« Salut, dit-elle.")])],
            RejectionPolicy::Exclude,
        );
        let validated = pipeline
            .validate(&chunk, map_of(&[(0, "« Salut, dit-elle."), (1, "Au revoir.")]))
            .await
            .unwrap();

        assert_eq!(validated.translations.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(validated.filtered.len(), 1);
        let filtered = &validated.filtered[0];
        assert_eq!(filtered.check, "punctuation");
        assert_eq!(filtered.original_text, "“Hi,” she said.");
        assert_eq!(filtered.translated_text, "« Salut, dit-elle.");
    }

    #[tokio::test]
    async fn fail_policy_rejects_the_chunk() {
        let chunk = chunk_of(&["One", "Two"]);
        let err = pipeline(Vec::new(), RejectionPolicy::Fail)
            .validate(&chunk, map_of(&[(0, "Un")]))
            .await
            .unwrap_err();
        assert_eq!(err.diagnostic.check, "line_count");
        assert_eq!(err.attempts.len(), 2);
    }

    #[test]
    fn check_lines_only_fails_on_requested_lines() {
        let chunk = chunk_of(&["One", "Two", "Three"]);
        let pipeline = pipeline(Vec::new(), RejectionPolicy::Fail);
        let merged = map_of(&[(0, "Un"), (1, "Deux")]);
        assert!(pipeline.check_lines(&chunk, &merged, &[1]).is_ok());
        assert!(pipeline
            .check_lines(&chunk, &merged, &[2])
            .unwrap_err()
            .starts_with("line_count:"));

        let complete = map_of(&[(0, "Un"), (1, "Deux"), (2, "Trois")]);
        let validated = tokio_test::block_on(pipeline.validate(&chunk, complete)).unwrap();
        assert!(!validated.corrected);
    }

    #[tokio::test]
    async fn requeue_policy_defers_the_failure() {
        let chunk = chunk_of(&["One", "Two"]);
        let validated = pipeline(Vec::new(), RejectionPolicy::Requeue)
            .validate(&chunk, map_of(&[(0, "Un")]))
            .await
            .unwrap();
        assert_eq!(validated.deferred.len(), 1);
        assert_eq!(validated.deferred[0].lines, vec![1]);
        assert_eq!(validated.translations.len(), 1);
    }
}
