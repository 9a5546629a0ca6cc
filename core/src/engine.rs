use std::sync::Arc;
use thiserror::Error;

use crate::ai::{complete_with_backoff, BackoffPolicy, CompletionError, CompletionService, GenerationMode};
use crate::codec::{
    decode, encode_content, encode_lines, join_fragments, split_fragments, DecodeError, TranslationMap,
};
use crate::document::FragmentMismatch;
use crate::prompt::{PromptContext, PromptKind, PromptRenderer};
use crate::run_context::RunContext;
use crate::segment::Chunk;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Service(#[from] CompletionError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Sends one request per chunk (or per corrective subset) and parses the answer.
pub struct TranslationEngine {
    service: Arc<dyn CompletionService>,
    renderer: Arc<dyn PromptRenderer>,
    backoff: BackoffPolicy,
    target_language: String,
    user_prompt: Option<String>,
    context: Arc<RunContext>,
}

impl TranslationEngine {
    pub fn new(
        service: Arc<dyn CompletionService>,
        renderer: Arc<dyn PromptRenderer>,
        target_language: impl Into<String>,
        context: Arc<RunContext>,
    ) -> Self {
        Self {
            service,
            renderer,
            backoff: BackoffPolicy::default(),
            target_language: target_language.into(),
            user_prompt: None,
            context,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_user_prompt(mut self, user_prompt: Option<String>) -> Self {
        self.user_prompt = user_prompt;
        self
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.context
    }

    pub fn target_language(&self) -> &str {
        &self.target_language
    }

    fn prompt(&self, kind: PromptKind, glossary_hints: Option<String>) -> PromptContext {
        PromptContext::new(self.target_language.clone(), kind)
            .with_glossary(glossary_hints)
            .with_user_prompt(self.user_prompt.clone())
    }

    async fn request(
        &self,
        prompt: PromptContext,
        content: &str,
        mode: GenerationMode,
        label: &str,
    ) -> Result<TranslationMap, EngineError> {
        let rendered = self.renderer.render(&prompt);
        let completion = complete_with_backoff(
            self.service.as_ref(),
            &rendered,
            content,
            mode,
            self.backoff,
            &self.context,
        )
        .await?;

        if let Some(reasoning) = &completion.reasoning {
            self.context.log_reasoning(label, reasoning, &completion.text);
        }

        decode(&completion.text).map_err(|err| {
            log::warn!("{label}: could not parse {} response: {err}", mode.label());
            EngineError::from(err)
        })
    }

    pub async fn translate_chunk(
        &self,
        chunk: &Chunk,
        glossary_hints: Option<String>,
        mode: GenerationMode,
    ) -> Result<TranslationMap, EngineError> {
        let label = format!("chunk {:03}", chunk.index);
        self.request(
            self.prompt(PromptKind::Translate, glossary_hints),
            &chunk.render(),
            mode,
            &label,
        )
        .await
    }

    /// Second-pass request carrying the initial translation and glossary hints.
    pub async fn refine_chunk(
        &self,
        chunk: &Chunk,
        initial: &TranslationMap,
        glossary_hints: Option<String>,
        mode: GenerationMode,
    ) -> Result<TranslationMap, EngineError> {
        let label = format!("refine chunk {:03}", chunk.index);
        let initial_translation =
            encode_lines(initial.iter().map(|(index, text)| (*index, text.as_str())));
        self.request(
            self.prompt(PromptKind::Refine { initial_translation }, glossary_hints),
            &chunk.render(),
            mode,
            &label,
        )
        .await
    }

    /// Requests only the listed body lines of `chunk`.
    pub async fn retranslate_lines(
        &self,
        chunk: &Chunk,
        indices: &[usize],
        error_message: &str,
        mode: GenerationMode,
    ) -> Result<TranslationMap, EngineError> {
        let label = format!("retry chunk {:03} ({} lines)", chunk.index, indices.len());
        self.request(
            self.prompt(
                PromptKind::TargetedRetry {
                    indices: indices.to_vec(),
                    error_message: error_message.to_string(),
                },
                None,
            ),
            &chunk.render_lines(indices),
            mode,
            &label,
        )
        .await
    }

    /// Asks for the whole line again, showing the broken segmentation.
    pub async fn repair_fragments_reinforced(
        &self,
        mismatch: &FragmentMismatch,
        mode: GenerationMode,
    ) -> Result<String, EngineError> {
        let label = format!("repair {}", mismatch.key);
        let content = encode_content(&[], [(0, mismatch.original_text.as_str())], &[]);
        let mut parsed = self
            .request(
                self.prompt(
                    PromptKind::FragmentRepair {
                        original_fragments: mismatch.original_fragments.clone(),
                        incorrect_segments: mismatch.translated_segments.clone(),
                    },
                    None,
                ),
                &content,
                mode,
                &label,
            )
            .await?;
        parsed
            .remove(&0)
            .ok_or(EngineError::Decode(DecodeError::NoLines))
    }

    /// Translates each fragment as its own numbered line, then rejoins them.
    pub async fn repair_fragments_strict(
        &self,
        mismatch: &FragmentMismatch,
        mode: GenerationMode,
    ) -> Result<String, EngineError> {
        let label = format!("strict repair {}", mismatch.key);
        let content = encode_content(
            &[],
            mismatch
                .original_fragments
                .iter()
                .enumerate()
                .map(|(index, fragment)| (index, fragment.as_str())),
            &[],
        );
        let parsed = self
            .request(
                self.prompt(
                    PromptKind::FragmentStrict {
                        original_fragments: mismatch.original_fragments.clone(),
                    },
                    None,
                ),
                &content,
                mode,
                &label,
            )
            .await?;
        let originals = split_fragments(&mismatch.original_text);
        let segments: Vec<String> = parsed
            .iter()
            .map(|(index, translated)| match originals.get(*index) {
                Some(original) => with_spacing_of(original, translated),
                None => translated.clone(),
            })
            .collect();
        Ok(join_fragments(&segments))
    }
}

/// `translated` wrapped in the leading and trailing whitespace of `original`.
///
/// Decoded lines come back trimmed, which would glue neighbouring fragments
/// together once they are concatenated again.
fn with_spacing_of(original: &str, translated: &str) -> String {
    if original.trim().is_empty() {
        return translated.to_string();
    }
    let leading = &original[..original.len() - original.trim_start().len()];
    let trailing = &original[original.trim_end().len()..];
    format!("{leading}{}{trailing}", translated.trim())
}
