//! Extraction pipeline: spans, unified extraction, entity resolution, claim
//! derivation and observers, wrapped as one handler per stage.

pub mod context;
pub mod dedup;
pub mod derive;
pub mod extraction;
pub mod handlers;
pub mod observers;
pub mod resolve;
pub mod spans;

pub use self::context::{ContextBudget, ExtractionContext};
pub use self::dedup::{dedup_claims, dedup_mentions, merge_entities, merge_entities_in_store};
pub use self::extraction::{ExtractionOutcome, UnifiedExtractor};
pub use self::handlers::{
    ExtractHandler, ExtractTask, PreprocessHandler, PreprocessTask, ResolveAndDeriveHandler,
    ResolveAndDeriveTask, RunObserversHandler, RunObserversTask, stage_handlers,
};
pub use self::observers::{DormancyObserver, Observer, ObserverReport, SupersessionObserver};
pub use self::spans::SpanDetector;
