/// Prompt construction for every request the translator sends.
///
/// Rendering is a pure function of [`PromptContext`]; the rest of the crate only
/// relies on the markup contract stated in every prompt.
use crate::codec::{END_MARKER, FRAGMENT_SEPARATOR};

#[derive(Debug, Clone, PartialEq)]
pub enum PromptKind {
    /// Translate every numbered line of a chunk.
    Translate,
    /// Retranslate only the listed lines after a failed check.
    TargetedRetry {
        indices: Vec<usize>,
        error_message: String,
    },
    /// Fix one line whose fragment separators were merged or split.
    FragmentRepair {
        original_fragments: Vec<String>,
        incorrect_segments: Vec<String>,
    },
    /// Translate each fragment of one line as its own numbered line.
    FragmentStrict { original_fragments: Vec<String> },
    /// Improve an existing translation with glossary guidance.
    Refine { initial_translation: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptContext {
    pub target_language: String,
    pub kind: PromptKind,
    pub glossary_hints: Option<String>,
    pub user_prompt: Option<String>,
}

impl PromptContext {
    pub fn new(target_language: impl Into<String>, kind: PromptKind) -> Self {
        Self {
            target_language: target_language.into(),
            kind,
            glossary_hints: None,
            user_prompt: None,
        }
    }

    pub fn with_glossary(mut self, hints: Option<String>) -> Self {
        self.glossary_hints = hints.filter(|hints| !hints.trim().is_empty());
        self
    }

    pub fn with_user_prompt(mut self, user_prompt: Option<String>) -> Self {
        self.user_prompt = user_prompt.filter(|prompt| !prompt.trim().is_empty());
        self
    }
}

pub trait PromptRenderer: Send + Sync {
    fn render(&self, context: &PromptContext) -> String;
}

/// Builds prompts from plain string templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPromptRenderer;

impl PromptRenderer for DefaultPromptRenderer {
    fn render(&self, context: &PromptContext) -> String {
        let mut sections = vec![format!(
            "You are a literary translator. Translate the numbered lines into {}.",
            context.target_language
        )];

        match &context.kind {
            PromptKind::Translate => {
                sections.push(
                    "Unnumbered paragraphs before or after the numbered lines are context only: read them, never translate or repeat them."
                        .to_string(),
                );
            }
            PromptKind::TargetedRetry {
                indices,
                error_message,
            } => {
                let markers = indices
                    .iter()
                    .map(|index| format!("<{index}/>"))
                    .collect::<Vec<_>>()
                    .join(", ");
                sections.push(format!(
                    "A previous answer was rejected:\n{error_message}\nTranslate ONLY the lines {markers} ({} line(s)). Do not output any other line.",
                    indices.len()
                ));
            }
            PromptKind::FragmentRepair {
                original_fragments,
                incorrect_segments,
            } => {
                let expected = original_fragments.len();
                let actual = incorrect_segments.len();
                let analysis = if expected > actual {
                    format!("{} fragment(s) were merged", expected - actual)
                } else if actual > expected {
                    format!("{} extra segment(s) were created", actual - expected)
                } else {
                    "the segment count was right but the structure was wrong".to_string()
                };
                sections.push(format!(
                    "A previous translation of line <0/> broke its structure: {analysis}.\nExpected {expected} fragments: {}\nReceived {actual} segments: {}\nThe answer must contain exactly {} separator(s) {FRAGMENT_SEPARATOR}, one between each pair of fragments.",
                    quote_all(original_fragments),
                    quote_all(incorrect_segments),
                    expected.saturating_sub(1)
                ));
            }
            PromptKind::FragmentStrict { original_fragments } => {
                sections.push(format!(
                    "Each numbered line is one fragment of a single sentence split by markup. Translate the {} fragments one by one, keeping one output line per fragment and never merging or splitting them.",
                    original_fragments.len()
                ));
            }
            PromptKind::Refine { initial_translation } => {
                sections.push(format!(
                    "An initial translation exists. Improve fluency and terminology consistency without dropping content:\n{initial_translation}"
                ));
            }
        }

        if let Some(hints) = &context.glossary_hints {
            sections.push(format!("Use these established term translations: {hints}"));
        }
        if let Some(user_prompt) = &context.user_prompt {
            sections.push(format!("Additional instructions: {user_prompt}"));
        }

        sections.push(format_rules());
        sections.join("\n\n")
    }
}

fn format_rules() -> String {
    [
        "OUTPUT FORMAT (mandatory):".to_string(),
        "- Start every translated line with its marker <N/>, keeping the original number.".to_string(),
        format!(
            "- Keep every fragment separator {FRAGMENT_SEPARATOR} in place: same count, same order."
        ),
        "- Output nothing but the numbered lines.".to_string(),
        format!("- Finish the answer with {END_MARKER} on its own line."),
    ]
    .join("\n")
}

fn quote_all(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("\"{}\"", item.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_prompt_states_the_markup_contract() {
        let kinds = vec![
            PromptKind::Translate,
            PromptKind::TargetedRetry {
                indices: vec![27],
                error_message: "missing <27/>".into(),
            },
            PromptKind::FragmentRepair {
                original_fragments: vec!["Hello".into(), "world".into()],
                incorrect_segments: vec!["Bonjour monde".into()],
            },
            PromptKind::FragmentStrict {
                original_fragments: vec!["Hello".into(), "world".into()],
            },
            PromptKind::Refine {
                initial_translation: "<0/>Bonjour".into(),
            },
        ];
        for kind in kinds {
            let prompt = DefaultPromptRenderer.render(&PromptContext::new("French", kind));
            assert!(prompt.contains("<N/>"));
            assert!(prompt.contains(FRAGMENT_SEPARATOR));
            assert!(prompt.contains(END_MARKER));
            assert!(prompt.contains("French"));
        }
    }

    #[test]
    fn targeted_retry_lists_only_requested_lines() {
        let prompt = DefaultPromptRenderer.render(&PromptContext::new(
            "French",
            PromptKind::TargetedRetry {
                indices: vec![27],
                error_message: "expected 28 lines, got 27".into(),
            },
        ));
        assert!(prompt.contains("ONLY the lines <27/> (1 line(s))"));
        assert!(prompt.contains("expected 28 lines, got 27"));
    }

    #[test]
    fn fragment_repair_explains_merges() {
        let prompt = DefaultPromptRenderer.render(&PromptContext::new(
            "French",
            PromptKind::FragmentRepair {
                original_fragments: vec!["Hello".into(), "beautiful".into(), "world".into()],
                incorrect_segments: vec!["Bonjour".into(), "monde magnifique".into()],
            },
        ));
        assert!(prompt.contains("1 fragment(s) were merged"));
        assert!(prompt.contains("exactly 2 separator(s)"));
    }

    #[test]
    fn glossary_and_user_prompt_are_optional() {
        let context = PromptContext::new("French", PromptKind::Translate)
            .with_glossary(Some("Matrix → Matrice".into()))
            .with_user_prompt(Some("   ".into()));
        let prompt = DefaultPromptRenderer.render(&context);
        assert!(prompt.contains("Matrix → Matrice"));
        assert!(!prompt.contains("Additional instructions"));
    }
}
