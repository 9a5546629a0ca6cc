use super::{Check, Diagnostic};
use crate::codec::{preview, preview_list, TranslationMap};
use crate::segment::Chunk;

const PREVIEW_LINES: usize = 10;

/// Every body line must come back, and nothing else.
///
/// A line translated to whitespace only counts as missing unless its source
/// is blank as well.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineCountCheck;

impl Check for LineCountCheck {
    fn name(&self) -> &'static str {
        "line_count"
    }

    fn check(&self, chunk: &Chunk, translations: &TranslationMap) -> Result<(), Diagnostic> {
        let expected = chunk.expected_indices();
        let missing: Vec<usize> = expected
            .iter()
            .copied()
            .filter(|index| match translations.get(index) {
                Some(text) => text.trim().is_empty() && !source_is_blank(chunk, *index),
                None => true,
            })
            .collect();
        let extra: Vec<usize> = translations
            .keys()
            .copied()
            .filter(|index| *index >= expected.len())
            .collect();

        if missing.is_empty() && extra.is_empty() {
            return Ok(());
        }

        let mut message = format!(
            "expected {} lines, received {}",
            expected.len(),
            translations.len()
        );
        if !missing.is_empty() {
            let markers: Vec<String> = missing.iter().map(|index| format!("<{index}/>")).collect();
            message.push_str(&format!(
                "; missing {}: {}",
                missing.len(),
                preview_list(&markers, PREVIEW_LINES)
            ));
        }
        if !extra.is_empty() {
            let markers: Vec<String> = extra.iter().map(|index| format!("<{index}/>")).collect();
            message.push_str(&format!(
                "; unexpected {}: {}",
                extra.len(),
                preview_list(&markers, PREVIEW_LINES)
            ));
        }

        let previews = missing
            .iter()
            .take(PREVIEW_LINES)
            .filter_map(|index| {
                chunk
                    .line(*index)
                    .map(|source| format!("<{index}/>{}", preview(&source, 60)))
            })
            .collect();

        Err(Diagnostic {
            check: self.name().to_string(),
            message,
            lines: missing,
            unexpected: extra,
            expected: expected.len(),
            actual: translations.len(),
            previews,
        })
    }
}

fn source_is_blank(chunk: &Chunk, index: usize) -> bool {
    chunk
        .line(index)
        .map(|source| source.trim().is_empty())
        .unwrap_or(false)
}
