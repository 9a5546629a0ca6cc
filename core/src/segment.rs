//! Token-budgeted segmentation of document text nodes into overlapping chunks.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::codec::{encode_content, TranslationMap};
use crate::document::TextNode;
use crate::token::TokenCounter;

pub const DEFAULT_OVERLAP_RATIO: f64 = 0.15;

/// A unit of translation work.
///
/// `body` is authoritative; `head` and `tail` only give the model context and
/// may repeat nodes that belong to neighbouring chunks' bodies.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    pub head: Vec<TextNode>,
    pub body: Vec<TextNode>,
    pub tail: Vec<TextNode>,
    pub file_range: (String, String),
}

impl Chunk {
    /// Body lines keyed by their position in the chunk.
    pub fn body_lines(&self) -> TranslationMap {
        self.body
            .iter()
            .enumerate()
            .map(|(index, node)| (index, node.text()))
            .collect()
    }

    pub fn expected_indices(&self) -> Vec<usize> {
        (0..self.body.len()).collect()
    }

    pub fn line(&self, index: usize) -> Option<String> {
        self.body.get(index).map(TextNode::text)
    }

    pub fn fragment_counts(&self) -> BTreeMap<usize, usize> {
        self.body
            .iter()
            .enumerate()
            .map(|(index, node)| (index, node.fragment_count()))
            .collect()
    }

    /// Full prompt content: head context, every numbered body line, tail context.
    pub fn render(&self) -> String {
        let lines = self.body_lines();
        encode_content(
            &context_texts(&self.head),
            lines.iter().map(|(index, text)| (*index, text.as_str())),
            &context_texts(&self.tail),
        )
    }

    /// Prompt content restricted to the given body indices, without context.
    pub fn render_lines(&self, indices: &[usize]) -> String {
        let lines: Vec<(usize, String)> = indices
            .iter()
            .filter_map(|index| self.line(*index).map(|text| (*index, text)))
            .collect();
        encode_content(
            &[],
            lines.iter().map(|(index, text)| (*index, text.as_str())),
            &[],
        )
    }

    pub fn body_tokens(&self, counter: &dyn TokenCounter) -> usize {
        self.body.iter().map(|node| counter.count(&node.text())).sum()
    }

    pub fn head_tokens(&self, counter: &dyn TokenCounter) -> usize {
        self.head.iter().map(|node| counter.count(&node.text())).sum()
    }

    pub fn tail_tokens(&self, counter: &dyn TokenCounter) -> usize {
        self.tail.iter().map(|node| counter.count(&node.text())).sum()
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn context_texts(nodes: &[TextNode]) -> Vec<String> {
    nodes.iter().map(TextNode::text).collect()
}

pub struct Segmentator {
    counter: Arc<dyn TokenCounter>,
    max_tokens: usize,
    overlap_ratio: f64,
}

impl Segmentator {
    pub fn new(counter: Arc<dyn TokenCounter>, max_tokens: usize, overlap_ratio: f64) -> Self {
        let overlap_ratio = if overlap_ratio.is_finite() && overlap_ratio > 0.0 {
            overlap_ratio
        } else {
            0.0
        };
        if overlap_ratio >= 1.0 {
            log::warn!(
                "overlap ratio {overlap_ratio:.2} is >= 1.0: context will span several chunks and token cost grows accordingly"
            );
        }
        Self {
            counter,
            max_tokens: max_tokens.max(1),
            overlap_ratio,
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn overlap_ratio(&self) -> f64 {
        self.overlap_ratio
    }

    /// Token budget shared by a chunk's head and its tail.
    pub fn overlap_tokens(&self) -> usize {
        (self.max_tokens as f64 * self.overlap_ratio) as usize
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    /// Lazily splits `nodes` into chunks in document order.
    pub fn segment<I>(&self, nodes: I) -> Segments<I::IntoIter>
    where
        I: IntoIterator<Item = TextNode>,
    {
        Segments {
            nodes: nodes.into_iter(),
            counter: Arc::clone(&self.counter),
            max_tokens: self.max_tokens,
            overlap_tokens: self.overlap_tokens(),
            next_index: 0,
            current: None,
            next_head: Vec::new(),
            queue: VecDeque::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }
}

struct CountedNode {
    node: TextNode,
    tokens: usize,
}

struct OpenChunk {
    index: usize,
    head: Vec<TextNode>,
    body: Vec<CountedNode>,
    body_tokens: usize,
}

/// Closed chunk still collecting tail context.
struct QueuedChunk {
    chunk: OpenChunk,
    tail: Vec<TextNode>,
    tail_budget: usize,
    open: bool,
}

/// Iterator returned by [`Segmentator::segment`].
pub struct Segments<I> {
    nodes: I,
    counter: Arc<dyn TokenCounter>,
    max_tokens: usize,
    overlap_tokens: usize,
    next_index: usize,
    current: Option<OpenChunk>,
    next_head: Vec<TextNode>,
    queue: VecDeque<QueuedChunk>,
    ready: VecDeque<Chunk>,
    finished: bool,
}

impl<I> Segments<I>
where
    I: Iterator<Item = TextNode>,
{
    fn push_node(&mut self, node: TextNode) {
        let tokens = self.counter.count(&node.text());

        let overflows = self.current.as_ref().is_some_and(|current| {
            !current.body.is_empty() && current.body_tokens + tokens > self.max_tokens
        });
        if overflows {
            self.close_current();
        }

        for queued in self.queue.iter_mut().filter(|queued| queued.open) {
            if tokens <= queued.tail_budget {
                queued.tail.push(node.clone());
                queued.tail_budget -= tokens;
                queued.open = queued.tail_budget > 0;
            } else {
                queued.open = false;
            }
        }
        self.release_finished();

        if tokens > self.max_tokens {
            log::warn!(
                "text node {} has {tokens} tokens, more than the {} token budget; it gets a chunk of its own",
                node.key,
                self.max_tokens
            );
        }

        if self.current.is_none() {
            let head = std::mem::take(&mut self.next_head);
            self.current = Some(OpenChunk {
                index: self.next_index,
                head,
                body: Vec::new(),
                body_tokens: 0,
            });
            self.next_index += 1;
        }
        if let Some(current) = self.current.as_mut() {
            current.body_tokens += tokens;
            current.body.push(CountedNode { node, tokens });
        }
    }

    fn close_current(&mut self) {
        let Some(chunk) = self.current.take() else {
            return;
        };
        self.queue.push_back(QueuedChunk {
            chunk,
            tail: Vec::new(),
            tail_budget: self.overlap_tokens,
            open: self.overlap_tokens > 0,
        });
        // The head must be taken before the closed chunk can leave the queue.
        self.next_head = self.assemble_head();
        self.release_finished();
    }

    /// Walks queued predecessors newest first, taking trailing body nodes while they fit.
    fn assemble_head(&self) -> Vec<TextNode> {
        let mut budget = self.overlap_tokens;
        let mut head = Vec::new();
        'walk: for queued in self.queue.iter().rev() {
            for counted in queued.chunk.body.iter().rev() {
                if counted.tokens > budget {
                    break 'walk;
                }
                budget -= counted.tokens;
                head.push(counted.node.clone());
            }
        }
        head.reverse();
        head
    }

    /// Moves chunks whose tail is complete to the ready list, oldest first.
    fn release_finished(&mut self) {
        while self.queue.front().is_some_and(|queued| !queued.open) {
            if let Some(queued) = self.queue.pop_front() {
                self.ready.push_back(finalize(queued));
            }
        }
    }

    fn flush(&mut self) {
        self.close_current();
        while let Some(queued) = self.queue.pop_front() {
            self.ready.push_back(finalize(queued));
        }
        self.finished = true;
    }
}

fn finalize(queued: QueuedChunk) -> Chunk {
    let QueuedChunk { chunk, tail, .. } = queued;
    let body: Vec<TextNode> = chunk.body.into_iter().map(|counted| counted.node).collect();
    let first = body
        .first()
        .map(|node| node.key.document_id.clone())
        .unwrap_or_default();
    let last = body
        .last()
        .map(|node| node.key.document_id.clone())
        .unwrap_or_default();
    Chunk {
        index: chunk.index,
        head: chunk.head,
        body,
        tail,
        file_range: (first, last),
    }
}

impl<I> Iterator for Segments<I>
where
    I: Iterator<Item = TextNode>,
{
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        loop {
            if let Some(chunk) = self.ready.pop_front() {
                return Some(chunk);
            }
            if self.finished {
                return None;
            }
            match self.nodes.next() {
                Some(node) => self.push_node(node),
                None => self.flush(),
            }
        }
    }
}
