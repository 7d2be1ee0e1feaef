mod ollama;
mod overlap;
mod progress;
mod recommend;
mod runner;
mod sources;
mod store;
mod types;

pub use ollama::{OllamaReasoner, DEFAULT_OLLAMA_MODEL, DEFAULT_OLLAMA_URL};
pub use overlap::{AnalysisFailure, AnalyzerOptions, OverlapAnalyzer};
pub use progress::{
    estimate_remaining_seconds, InMemoryProgressStore, InsertOutcome, JobMutation, JobProgress,
    ProgressStore, ProgressTracker, RetentionPolicy, TrackerError, ACTIVITY_LOG_LIMIT,
};
pub use recommend::{AiReasoner, PairContext, RecommendationEngine, RecommendationOutcome};
pub use runner::RedundancyAnalysisService;
pub use sources::{FeatureCatalog, PortfolioStore, ResultStore};
pub use store::PgRedundancyStore;
pub use types::*;
