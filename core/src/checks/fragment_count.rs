use super::{Check, Diagnostic};
use crate::codec::{check_fragment_counts, preview, preview_list, TranslationMap};
use crate::segment::Chunk;

/// Each translated line must keep its source's separator-delimited fragment count.
#[derive(Debug, Clone, Copy, Default)]
pub struct FragmentCountCheck;

impl Check for FragmentCountCheck {
    fn name(&self) -> &'static str {
        "fragment_count"
    }

    fn check(&self, chunk: &Chunk, translations: &TranslationMap) -> Result<(), Diagnostic> {
        let mismatches = check_fragment_counts(chunk, translations);
        if mismatches.is_empty() {
            return Ok(());
        }

        let details: Vec<String> = mismatches
            .iter()
            .map(|mismatch| {
                format!(
                    "<{}/> expected {} got {}",
                    mismatch.index, mismatch.expected, mismatch.actual
                )
            })
            .collect();
        let previews = mismatches
            .iter()
            .take(5)
            .filter_map(|mismatch| {
                let translated = translations.get(&mismatch.index)?;
                Some(format!("<{}/>{}", mismatch.index, preview(translated, 80)))
            })
            .collect();

        Err(Diagnostic {
            check: self.name().to_string(),
            message: format!(
                "fragment separators changed on {} line(s): {}",
                mismatches.len(),
                preview_list(&details, 5)
            ),
            lines: mismatches.iter().map(|mismatch| mismatch.index).collect(),
            unexpected: Vec::new(),
            expected: mismatches.iter().map(|mismatch| mismatch.expected).sum(),
            actual: mismatches.iter().map(|mismatch| mismatch.actual).sum(),
            previews,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::tests::map_of;
    use crate::document::{TagKey, TextNode};

    fn chunk() -> Chunk {
        Chunk {
            index: 0,
            head: Vec::new(),
            body: vec![
                TextNode::new(
                    TagKey::new("ch1.xhtml", "p", 0),
                    vec!["Hello".into(), "beautiful".into(), "world".into()],
                ),
                TextNode::new(TagKey::new("ch1.xhtml", "p", 1), vec!["Alone".into()]),
            ],
            tail: Vec::new(),
            file_range: ("ch1.xhtml".into(), "ch1.xhtml".into()),
        }
    }

    #[test]
    fn merged_fragments_fail_with_counts() {
        let diagnostic = FragmentCountCheck
            .check(&chunk(), &map_of(&[(0, "Bonjour</>monde magnifique"), (1, "Seul")]))
            .unwrap_err();
        assert_eq!(diagnostic.lines, vec![0]);
        assert_eq!((diagnostic.expected, diagnostic.actual), (3, 2));
        assert!(diagnostic.message.contains("<0/> expected 3 got 2"));
    }

    #[test]
    fn missing_lines_are_left_to_line_count() {
        assert!(FragmentCountCheck
            .check(&chunk(), &map_of(&[(1, "Seul")]))
            .is_ok());
    }
}
