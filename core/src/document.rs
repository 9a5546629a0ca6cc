use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

use crate::codec::{join_fragments, preview_list, split_fragments};

const MISMATCH_PREVIEW_LIMIT: usize = 5;

/// Location of one group of text fragments inside a document.
///
/// `index` is kept as a string so the key stays identical once it has been
/// written to and read back from the JSON cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagKey {
    pub document_id: String,
    pub tag_path: String,
    pub index: String,
}

impl TagKey {
    pub fn new(document_id: impl Into<String>, tag_path: impl Into<String>, index: usize) -> Self {
        Self {
            document_id: document_id.into(),
            tag_path: tag_path.into(),
            index: index.to_string(),
        }
    }

    /// `tag_path#index`, unique within one document.
    pub fn entry_key(&self) -> String {
        format!("{}#{}", self.tag_path, self.index)
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}({})", self.document_id, self.index, self.tag_path)
    }
}

/// Ordered fragments sharing one parent markup node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextNode {
    pub key: TagKey,
    pub fragments: Vec<String>,
}

impl TextNode {
    pub fn new(key: TagKey, fragments: Vec<String>) -> Self {
        Self { key, fragments }
    }

    /// Builds a node from raw markup text, normalizing whitespace and dropping blank fragments.
    pub fn from_raw<S: AsRef<str>>(key: TagKey, raw_fragments: &[S]) -> Option<Self> {
        let fragments: Vec<String> = raw_fragments
            .iter()
            .filter(|fragment| !fragment.as_ref().trim().is_empty())
            .map(|fragment| normalize_fragment(fragment.as_ref()))
            .collect();
        if fragments.is_empty() {
            None
        } else {
            Some(Self { key, fragments })
        }
    }

    /// Flattened text with fragments joined by the fragment separator.
    pub fn text(&self) -> String {
        join_fragments(&self.fragments)
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }
}

/// Collapses whitespace runs, keeping at most one leading and one trailing space.
pub fn normalize_fragment(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let leading = raw.starts_with(char::is_whitespace);
    let trailing = raw.ends_with(char::is_whitespace);
    match (leading, trailing) {
        (true, true) => format!(" {collapsed} "),
        (true, false) => format!(" {collapsed}"),
        (false, true) => format!("{collapsed} "),
        (false, false) => collapsed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BilingualFormat {
    /// Translation replaces the original.
    Disable,
    /// `original | translation` in place of each fragment.
    Inline,
    /// Original kept, full translation inserted after it.
    #[default]
    SeparateTag,
}

/// What the document container must do for one TagKey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Replacement {
    Fragments { fragments: Vec<String> },
    AppendAfter { translation: String },
}

/// Structural error raised when a stored translation does not split into the
/// original number of fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentMismatch {
    pub key: TagKey,
    pub original_fragments: Vec<String>,
    pub translated_segments: Vec<String>,
    pub original_text: String,
    pub expected: usize,
    pub actual: usize,
}

impl fmt::Display for FragmentMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quote = |items: &[String]| -> Vec<String> {
            items.iter().map(|item| format!("\"{}\"", item.trim())).collect()
        };
        write!(
            f,
            "fragment count mismatch for {}: expected {} fragments, got {} segments; original: [{}]; translation: [{}]",
            self.key,
            self.expected,
            self.actual,
            preview_list(&quote(&self.original_fragments), MISMATCH_PREVIEW_LIMIT),
            preview_list(&quote(&self.translated_segments), MISMATCH_PREVIEW_LIMIT),
        )
    }
}

#[derive(Debug, Error)]
pub enum ReconstructionError {
    #[error("{0}")]
    FragmentMismatch(Box<FragmentMismatch>),
    #[error("no pending text fragments for {0}")]
    UnknownKey(TagKey),
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("unknown document: {0}")]
    UnknownDocument(String),
    #[error("unknown tag {0}")]
    UnknownTag(TagKey),
}

/// Supplies text nodes per document and accepts reconstructed replacements.
pub trait DocumentContainer {
    fn document_ids(&self) -> Vec<String>;
    fn text_nodes(&self, document_id: &str) -> Result<Vec<TextNode>, DocumentError>;
    fn apply(&mut self, key: &TagKey, replacement: &Replacement) -> Result<(), DocumentError>;
}

/// Container holding documents in memory, in insertion order.
#[derive(Debug, Default, Clone)]
pub struct InMemoryContainer {
    order: Vec<String>,
    nodes: HashMap<String, Vec<TextNode>>,
    applied: BTreeMap<TagKey, Replacement>,
}

impl InMemoryContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_document(&mut self, document_id: impl Into<String>, nodes: Vec<TextNode>) {
        let document_id = document_id.into();
        if !self.nodes.contains_key(&document_id) {
            self.order.push(document_id.clone());
        }
        self.nodes.insert(document_id, nodes);
    }

    pub fn replacement(&self, key: &TagKey) -> Option<&Replacement> {
        self.applied.get(key)
    }

    pub fn replacements(&self) -> &BTreeMap<TagKey, Replacement> {
        &self.applied
    }
}

impl DocumentContainer for InMemoryContainer {
    fn document_ids(&self) -> Vec<String> {
        self.order.clone()
    }

    fn text_nodes(&self, document_id: &str) -> Result<Vec<TextNode>, DocumentError> {
        self.nodes
            .get(document_id)
            .cloned()
            .ok_or_else(|| DocumentError::UnknownDocument(document_id.to_string()))
    }

    fn apply(&mut self, key: &TagKey, replacement: &Replacement) -> Result<(), DocumentError> {
        let known = self
            .nodes
            .get(&key.document_id)
            .ok_or_else(|| DocumentError::UnknownDocument(key.document_id.clone()))?
            .iter()
            .any(|node| &node.key == key);
        if !known {
            return Err(DocumentError::UnknownTag(key.clone()));
        }
        self.applied.insert(key.clone(), replacement.clone());
        Ok(())
    }
}

/// One parsed document with the fragments still waiting for a translation.
#[derive(Debug, Clone)]
pub struct Page {
    document_id: String,
    nodes: Vec<TextNode>,
    pending: HashMap<TagKey, usize>,
    replaced: BTreeMap<TagKey, Replacement>,
}

impl Page {
    pub fn new(document_id: impl Into<String>, nodes: Vec<TextNode>) -> Self {
        let pending = nodes
            .iter()
            .enumerate()
            .map(|(position, node)| (node.key.clone(), position))
            .collect();
        Self {
            document_id: document_id.into(),
            nodes,
            pending,
            replaced: BTreeMap::new(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn nodes(&self) -> &[TextNode] {
        &self.nodes
    }

    pub fn is_pending(&self, key: &TagKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending_keys(&self) -> Vec<TagKey> {
        let mut keys: Vec<(usize, TagKey)> = self
            .pending
            .iter()
            .map(|(key, position)| (*position, key.clone()))
            .collect();
        keys.sort();
        keys.into_iter().map(|(_, key)| key).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Replaces one TagKey's fragments with a translation split on the fragment separator.
    ///
    /// The split must yield exactly the original fragment count; on mismatch
    /// the key stays pending so a corrected translation can be applied later.
    pub fn replace_text(
        &mut self,
        key: &TagKey,
        translated_text: &str,
        format: BilingualFormat,
    ) -> Result<&Replacement, ReconstructionError> {
        let position = *self
            .pending
            .get(key)
            .ok_or_else(|| ReconstructionError::UnknownKey(key.clone()))?;
        let node = &self.nodes[position];

        let segments = split_fragments(translated_text);
        if segments.len() != node.fragments.len() {
            return Err(ReconstructionError::FragmentMismatch(Box::new(
                FragmentMismatch {
                    key: key.clone(),
                    original_fragments: node
                        .fragments
                        .iter()
                        .map(|fragment| fragment.trim().to_string())
                        .filter(|fragment| !fragment.is_empty())
                        .collect(),
                    translated_segments: segments
                        .iter()
                        .map(|segment| segment.trim().to_string())
                        .collect(),
                    original_text: node.text(),
                    expected: node.fragments.len(),
                    actual: segments.len(),
                },
            )));
        }

        let replacement = match format {
            BilingualFormat::Disable => Replacement::Fragments {
                fragments: segments.iter().map(|segment| segment.to_string()).collect(),
            },
            BilingualFormat::Inline => Replacement::Fragments {
                fragments: node
                    .fragments
                    .iter()
                    .zip(segments.iter())
                    .map(|(original, translated)| {
                        format!("{} | {}", original.trim(), translated.trim())
                    })
                    .collect(),
            },
            BilingualFormat::SeparateTag => Replacement::AppendAfter {
                translation: segments.concat(),
            },
        };

        self.pending.remove(key);
        Ok(self.replaced.entry(key.clone()).or_insert(replacement))
    }

    pub fn replacements(&self) -> &BTreeMap<TagKey, Replacement> {
        &self.replaced
    }
}

/// Caller-owned cache of parsed pages keyed by document id.
#[derive(Debug, Default)]
pub struct DocumentCache {
    pages: HashMap<String, Page>,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load(
        &mut self,
        container: &dyn DocumentContainer,
        document_id: &str,
    ) -> Result<&mut Page, DocumentError> {
        if !self.pages.contains_key(document_id) {
            let nodes = container.text_nodes(document_id)?;
            self.pages
                .insert(document_id.to_string(), Page::new(document_id, nodes));
        }
        self.pages
            .get_mut(document_id)
            .ok_or_else(|| DocumentError::UnknownDocument(document_id.to_string()))
    }

    pub fn get(&self, document_id: &str) -> Option<&Page> {
        self.pages.get(document_id)
    }

    pub fn get_mut(&mut self, document_id: &str) -> Option<&mut Page> {
        self.pages.get_mut(document_id)
    }

    pub fn evict(&mut self, document_id: &str) -> Option<Page> {
        self.pages.remove(document_id)
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(index: usize) -> TagKey {
        TagKey::new("ch1.xhtml", "html/body/p", index)
    }

    fn page_with(fragments: &[&str]) -> Page {
        let node = TextNode::new(key(0), fragments.iter().map(|f| f.to_string()).collect());
        Page::new("ch1.xhtml", vec![node])
    }

    #[test]
    fn normalizes_fragment_whitespace() {
        assert_eq!(normalize_fragment("  Hello \n\t world  "), " Hello world ");
        assert_eq!(normalize_fragment("Hello\n\nworld"), "Hello world");
        assert_eq!(normalize_fragment("tail  "), "tail ");
    }

    #[test]
    fn from_raw_drops_blank_fragments() {
        let node = TextNode::from_raw(key(0), &["Hello ", "\n  ", "world"]).unwrap();
        assert_eq!(node.fragments, vec!["Hello ".to_string(), "world".to_string()]);
        assert!(TextNode::from_raw(key(1), &["  ", "\n"]).is_none());
    }

    #[test]
    fn replace_text_reports_fragment_mismatch() {
        let mut page = page_with(&["Hello", "beautiful", "world"]);
        let err = page
            .replace_text(&key(0), "Bonjour</>monde magnifique", BilingualFormat::Disable)
            .unwrap_err();

        match err {
            ReconstructionError::FragmentMismatch(mismatch) => {
                assert_eq!(mismatch.expected, 3);
                assert_eq!(mismatch.actual, 2);
                assert_eq!(mismatch.original_fragments, vec!["Hello", "beautiful", "world"]);
                assert_eq!(mismatch.translated_segments, vec!["Bonjour", "monde magnifique"]);
                let message = mismatch.to_string();
                assert!(message.contains("expected 3"));
                assert!(message.contains("got 2"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(page.is_pending(&key(0)));
    }

    #[test]
    fn mismatch_previews_are_bounded() {
        let fragments: Vec<String> = (0..8).map(|i| format!("f{i}")).collect();
        let refs: Vec<&str> = fragments.iter().map(String::as_str).collect();
        let mut page = page_with(&refs);
        let err = page
            .replace_text(&key(0), "un</>deux", BilingualFormat::Disable)
            .unwrap_err();
        assert!(err.to_string().contains("(+3 others)"));
    }

    #[test]
    fn replace_text_applies_bilingual_formats() {
        let mut page = page_with(&["Hello ", "world"]);
        let replacement = page
            .replace_text(&key(0), "Bonjour </>monde", BilingualFormat::Inline)
            .unwrap()
            .clone();
        assert_eq!(
            replacement,
            Replacement::Fragments {
                fragments: vec!["Hello | Bonjour".into(), "world | monde".into()]
            }
        );
        assert!(page.is_complete());

        let mut page = page_with(&["Hello ", "world"]);
        let replacement = page
            .replace_text(&key(0), "Bonjour </>monde", BilingualFormat::SeparateTag)
            .unwrap()
            .clone();
        assert_eq!(
            replacement,
            Replacement::AppendAfter {
                translation: "Bonjour monde".into()
            }
        );
    }

    #[test]
    fn replacing_twice_is_an_unknown_key() {
        let mut page = page_with(&["Hello"]);
        page.replace_text(&key(0), "Bonjour", BilingualFormat::Disable)
            .unwrap();
        let err = page
            .replace_text(&key(0), "Salut", BilingualFormat::Disable)
            .unwrap_err();
        assert!(matches!(err, ReconstructionError::UnknownKey(_)));
    }

    #[test]
    fn cache_loads_once_and_evicts() {
        let mut container = InMemoryContainer::new();
        container.add_document(
            "ch1.xhtml",
            vec![TextNode::new(key(0), vec!["Hello".into()])],
        );
        let mut cache = DocumentCache::new();

        cache
            .get_or_load(&container, "ch1.xhtml")
            .unwrap()
            .replace_text(&key(0), "Bonjour", BilingualFormat::Disable)
            .unwrap();
        assert!(cache.get_or_load(&container, "ch1.xhtml").unwrap().is_complete());
        assert_eq!(cache.len(), 1);

        assert!(cache.evict("ch1.xhtml").is_some());
        assert!(!cache.get_or_load(&container, "ch1.xhtml").unwrap().is_complete());

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get_or_load(&container, "missing.xhtml").is_err());
    }
}
