pub mod ai;
pub mod backup;
pub mod checks;
pub mod codec;
pub mod config;
pub mod correction;
pub mod document;
pub mod engine;
pub mod glossary;
pub mod pipeline;
pub mod prompt;
pub mod quality;
pub mod run_context;
pub mod segment;
pub mod store;
pub mod token;
pub mod workers;

pub use ai::{
    Completion, CompletionError, CompletionService, GenerationMode, OpenAiCompatibleClient, ServiceConfig,
};
pub use checks::{
    Check, Diagnostic, FilteredLine, RejectionPolicy, ValidatedChunk, ValidationPipeline,
};
pub use codec::{decode, DecodeError, TranslationMap, END_MARKER, FRAGMENT_SEPARATOR};
pub use config::{ConfigError, TranslatorConfig};
pub use correction::{
    validate_retry_indices, ErrorQueue, RetryEngine, RetryIndexMismatch, RetryStrategy,
};
pub use document::{
    BilingualFormat, DocumentCache, DocumentContainer, FragmentMismatch, InMemoryContainer, Page,
    ReconstructionError, Replacement, TagKey, TextNode,
};
pub use engine::{EngineError, TranslationEngine};
pub use glossary::{Conflict, ConflictResolver, Glossary, GlossaryError};
pub use pipeline::{RunSummary, Translator};
pub use prompt::{DefaultPromptRenderer, PromptContext, PromptKind, PromptRenderer};
pub use quality::{QualityIssueKind, QualityReviewer, QualityWarning, UntranslatedDetector};
pub use run_context::{RunContext, RunEvent, RunMetrics};
pub use segment::{Chunk, Segmentator};
pub use store::{Phase, PhaseStores, Store, StoreError};
pub use token::{ApproxTokenCounter, TokenCounter, WhitespaceTokenCounter};
