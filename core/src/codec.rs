//! Line/fragment markup shared by prompts and model responses.
//!
//! Every body line of a chunk travels as `<N/>text`, fragments of one tag are
//! joined with [`FRAGMENT_SEPARATOR`], and a complete response ends with
//! [`END_MARKER`].

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::segment::Chunk;

pub const FRAGMENT_SEPARATOR: &str = "</>";
pub const END_MARKER: &str = "[=[END]=]";

/// Parsed model output keyed by line index.
pub type TranslationMap = BTreeMap<usize, String>;

static LINE_MARKER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^<(\d+)/>").expect("valid line marker regex"));

const ERROR_PREFIXES: &[&str] = &["[ERROR", "[ERREUR"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("completion returned an error message instead of a translation: {0}")]
    EchoedError(String),
    #[error("response is truncated: end marker [=[END]=] is missing")]
    Truncated,
    #[error("no <N/> numbered line found in response")]
    NoLines,
}

/// Fragment count disagreement for one body line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentCountMismatch {
    pub index: usize,
    pub expected: usize,
    pub actual: usize,
}

pub fn join_fragments<S: AsRef<str>>(fragments: &[S]) -> String {
    fragments
        .iter()
        .map(|fragment| fragment.as_ref())
        .collect::<Vec<_>>()
        .join(FRAGMENT_SEPARATOR)
}

pub fn split_fragments(text: &str) -> Vec<&str> {
    text.split(FRAGMENT_SEPARATOR).collect()
}

pub fn fragment_count(text: &str) -> usize {
    text.matches(FRAGMENT_SEPARATOR).count() + 1
}

pub fn encode_line(index: usize, text: &str) -> String {
    format!("<{index}/>{text}")
}

/// Numbers each line, keeping the given indices.
pub fn encode_lines<'a, I>(lines: I) -> String
where
    I: IntoIterator<Item = (usize, &'a str)>,
{
    lines
        .into_iter()
        .map(|(index, text)| encode_line(index, text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds the flat prompt content: context before, numbered lines, context after, end marker.
pub fn encode_content<'a, I>(head: &[String], lines: I, tail: &[String]) -> String
where
    I: IntoIterator<Item = (usize, &'a str)>,
{
    let mut blocks: Vec<String> = head.iter().cloned().collect();
    let numbered = encode_lines(lines);
    if !numbered.is_empty() {
        blocks.push(numbered);
    }
    blocks.extend(tail.iter().cloned());
    blocks.push(END_MARKER.to_string());
    blocks.join("\n\n")
}

/// Parses a model response into `{index: text}`.
pub fn decode(response: &str) -> Result<TranslationMap, DecodeError> {
    let trimmed = response.trim();
    if ERROR_PREFIXES.iter().any(|prefix| trimmed.starts_with(prefix)) {
        return Err(DecodeError::EchoedError(preview(trimmed, 200)));
    }

    let Some(end) = trimmed.rfind(END_MARKER) else {
        return Err(DecodeError::Truncated);
    };
    let body = &trimmed[..end];

    let markers: Vec<(usize, usize, Option<usize>)> = LINE_MARKER_REGEX
        .captures_iter(body)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let index = caps.get(1).and_then(|m| m.as_str().parse::<usize>().ok());
            Some((whole.start(), whole.end(), index))
        })
        .collect();

    let mut parsed = TranslationMap::new();
    for (position, (_, content_start, index)) in markers.iter().enumerate() {
        let content_end = markers
            .get(position + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(body.len());
        if let Some(index) = index {
            parsed.insert(*index, body[*content_start..content_end].trim().to_string());
        }
    }

    if parsed.is_empty() {
        return Err(DecodeError::NoLines);
    }
    Ok(parsed)
}

/// Compares separator-delimited piece counts against each body line's source fragments.
pub fn check_fragment_counts(
    chunk: &Chunk,
    translations: &TranslationMap,
) -> Vec<FragmentCountMismatch> {
    chunk
        .body
        .iter()
        .enumerate()
        .filter_map(|(index, node)| {
            let translated = translations.get(&index)?;
            let expected = node.fragments.len().max(1);
            let actual = fragment_count(translated);
            (expected != actual).then_some(FragmentCountMismatch {
                index,
                expected,
                actual,
            })
        })
        .collect()
}

pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Formats at most `limit` items, noting how many were left out.
pub(crate) fn preview_list<T: std::fmt::Display>(items: &[T], limit: usize) -> String {
    let shown = items
        .iter()
        .take(limit)
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    if items.len() > limit {
        format!("{shown} (+{} others)", items.len() - limit)
    } else {
        shown
    }
}
