use super::{Check, Diagnostic};
use crate::codec::{preview, preview_list, TranslationMap};
use crate::segment::Chunk;

const QUOTE_PAIRS: [(char, char); 2] = [('“', '”'), ('«', '»')];

/// Quotation pairs must balance per line.
///
/// A source line that is itself unbalanced (dialogue spanning paragraphs)
/// only requires the translation to carry the same imbalance.
#[derive(Debug, Clone, Copy, Default)]
pub struct PunctuationCheck;

/// Opening minus closing marks for each entry of `QUOTE_PAIRS`.
pub fn quote_imbalance(text: &str) -> [i64; QUOTE_PAIRS.len()] {
    let mut imbalance = [0i64; QUOTE_PAIRS.len()];
    for c in text.chars() {
        for (slot, (open, close)) in imbalance.iter_mut().zip(QUOTE_PAIRS.iter()) {
            if c == *open {
                *slot += 1;
            } else if c == *close {
                *slot -= 1;
            }
        }
    }
    imbalance
}

/// Whether a translation keeps the quotation structure of its source.
///
/// A balanced source needs every pair balanced. An unbalanced source may
/// switch quote style, so the translation only has to leave the same net
/// number of marks open, with no pair pulling the other way.
pub fn quotes_match(source: &str, translated: &str) -> bool {
    let expected = quote_imbalance(source);
    let actual = quote_imbalance(translated);
    let expected_total: i64 = expected.iter().sum();
    if expected.iter().all(|slot| *slot == 0) {
        return actual.iter().all(|slot| *slot == 0);
    }
    actual.iter().sum::<i64>() == expected_total
        && actual
            .iter()
            .all(|slot| *slot == 0 || slot.signum() == expected_total.signum())
}

impl Check for PunctuationCheck {
    fn name(&self) -> &'static str {
        "punctuation"
    }

    fn check(&self, chunk: &Chunk, translations: &TranslationMap) -> Result<(), Diagnostic> {
        let failing: Vec<(usize, i64, i64)> = translations
            .iter()
            .filter_map(|(index, translated)| {
                let source = chunk.line(*index)?;
                if quotes_match(&source, translated) {
                    return None;
                }
                let expected: i64 = quote_imbalance(&source).iter().sum();
                let actual: i64 = quote_imbalance(translated).iter().sum();
                Some((*index, expected, actual))
            })
            .collect();

        if failing.is_empty() {
            return Ok(());
        }

        let markers: Vec<String> = failing
            .iter()
            .map(|(index, _, actual)| format!("<{index}/> ({actual:+})"))
            .collect();
        let previews = failing
            .iter()
            .take(5)
            .filter_map(|(index, _, _)| {
                translations
                    .get(index)
                    .map(|text| format!("<{index}/>{}", preview(text, 80)))
            })
            .collect();

        Err(Diagnostic {
            check: self.name().to_string(),
            message: format!(
                "unbalanced quotation marks on {} line(s): {}",
                failing.len(),
                preview_list(&markers, 10)
            ),
            lines: failing.iter().map(|(index, _, _)| *index).collect(),
            unexpected: Vec::new(),
            expected: 0,
            actual: failing.len(),
            previews,
        })
    }
}
