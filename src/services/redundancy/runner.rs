use super::ollama::OllamaReasoner;
use super::overlap::{AnalysisFailure, AnalyzerOptions, OverlapAnalyzer};
use super::progress::{JobProgress, ProgressTracker, RetentionPolicy, TrackerError};
use super::recommend::{AiReasoner, RecommendationEngine};
use super::store::PgRedundancyStore;
use super::types::{
    AnalysisJob, AnalysisJobError, AnalysisResult, RecommendationStatus, StoredRecommendation,
};
use crate::config::CoreConfig;
use anyhow::Result;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

pub const INTERNAL_ERROR: &str = "internal_error";

/// Accepts analysis requests, runs each as its own task under a concurrency limit and records
/// the outcome with the progress tracker.
pub struct RedundancyAnalysisService {
    analyzer: Arc<OverlapAnalyzer>,
    tracker: Arc<ProgressTracker>,
    semaphore: Arc<Semaphore>,
    purge_interval: Duration,
}

impl RedundancyAnalysisService {
    pub fn new(
        analyzer: OverlapAnalyzer,
        tracker: Arc<ProgressTracker>,
        max_concurrency: usize,
        purge_interval: Duration,
    ) -> Self {
        Self {
            analyzer: Arc::new(analyzer),
            tracker,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            purge_interval,
        }
    }

    pub fn from_config(db: PgPool, config: &CoreConfig, http: reqwest::Client) -> Self {
        let store = Arc::new(PgRedundancyStore::new(db));
        let reasoner: Option<Arc<dyn AiReasoner>> = if config.disable_ollama {
            tracing::info!("AI recommendations disabled; using rule-based strategy only");
            None
        } else {
            Some(Arc::new(OllamaReasoner::new(
                config.ollama_url.clone(),
                config.ollama_model.clone(),
                Duration::from_secs(config.ollama_timeout_seconds),
                http,
            )))
        };
        let analyzer = OverlapAnalyzer::new(
            store.clone(),
            store.clone(),
            store.clone(),
            RecommendationEngine::new(reasoner, store),
            AnalyzerOptions {
                checkpoint_every: config.analysis_checkpoint_every,
            },
        );
        let tracker = Arc::new(ProgressTracker::in_memory(RetentionPolicy {
            completed: Duration::from_secs(config.analysis_retention_completed_seconds),
            failed: Duration::from_secs(config.analysis_retention_failed_seconds),
            cancelled: Duration::from_secs(config.analysis_retention_cancelled_seconds),
        }));
        Self::new(
            analyzer,
            tracker,
            config.analysis_max_concurrent_jobs,
            Duration::from_secs(config.analysis_purge_interval_seconds),
        )
    }

    /// Background housekeeping: purges expired job records until `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        self.tracker
            .clone()
            .start_sweeper(self.purge_interval, cancel);
    }

    /// Registers a job for the portfolio and schedules it. Returns the `queued` snapshot.
    pub async fn start_analysis(
        self: &Arc<Self>,
        portfolio_id: Uuid,
        selected_ids: Option<Vec<Uuid>>,
    ) -> std::result::Result<AnalysisJob, TrackerError> {
        let selected_ids = selected_ids.filter(|ids| !ids.is_empty());
        let total_units = selected_ids.as_ref().map_or(0, Vec::len);
        let handle = self.tracker.start(portfolio_id, total_units).await?;
        let snapshot = match self.tracker.get_progress(portfolio_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                return Err(abandon(
                    &handle,
                    anyhow::anyhow!(
                        "job record for portfolio {portfolio_id} disappeared after start"
                    ),
                )
                .await);
            }
            Err(err) => return Err(abandon(&handle, err).await),
        };

        let span = tracing::info_span!(
            "redundancy_job",
            portfolio_id = %portfolio_id,
            job_id = %handle.job_id(),
            selected = total_units,
        );
        let service = self.clone();
        tokio::spawn(
            async move {
                service.run_one(handle, selected_ids).await;
            }
            .instrument(span),
        );

        Ok(snapshot)
    }

    pub async fn get_progress(&self, portfolio_id: Uuid) -> Result<Option<AnalysisJob>> {
        self.tracker.get_progress(portfolio_id).await
    }

    pub async fn request_cancellation(&self, portfolio_id: Uuid) -> Result<bool> {
        let found = self.tracker.request_cancellation(portfolio_id).await?;
        if found {
            tracing::info!(portfolio_id = %portfolio_id, "analysis cancellation requested");
        }
        Ok(found)
    }

    pub async fn list_recommendations(
        &self,
        portfolio_id: Uuid,
        status: RecommendationStatus,
    ) -> Result<Vec<StoredRecommendation>> {
        self.analyzer
            .results()
            .list_recommendations(portfolio_id, status)
            .await
    }

    pub async fn update_recommendation_status(
        &self,
        recommendation_id: Uuid,
        status: RecommendationStatus,
    ) -> Result<bool> {
        let updated = self
            .analyzer
            .results()
            .update_recommendation_status(recommendation_id, status)
            .await?;
        if updated {
            tracing::info!(
                recommendation_id = %recommendation_id,
                status = status.as_str(),
                "recommendation status updated"
            );
        }
        Ok(updated)
    }

    async fn run_one(self: Arc<Self>, handle: JobProgress, selected_ids: Option<Vec<Uuid>>) {
        let started = Instant::now();
        let token = handle.cancellation_token();

        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => permit,
            _ = token.cancelled() => {
                self.finish(&handle, Err(AnalysisFailure::Cancelled), started).await;
                return;
            }
        };
        let Ok(_permit) = permit else {
            let failure = AnalysisFailure::Failed(AnalysisJobError {
                code: INTERNAL_ERROR.to_string(),
                message: "analysis scheduler is shut down".to_string(),
            });
            self.finish(&handle, Err(failure), started).await;
            return;
        };

        tracing::info!(phase = "runner_start", "redundancy analysis started");

        let analyzer = self.analyzer.clone();
        let job = handle.clone();
        let joined = tokio::spawn(
            async move {
                analyzer
                    .analyze(job.portfolio_id(), selected_ids.as_deref(), &job)
                    .await
            }
            .in_current_span(),
        )
        .await;

        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = if err.is_panic() {
                    "analysis task panicked"
                } else {
                    "analysis task was aborted"
                };
                tracing::error!(error = %err, "{message}");
                Err(AnalysisFailure::Failed(AnalysisJobError {
                    code: INTERNAL_ERROR.to_string(),
                    message: message.to_string(),
                }))
            }
        };
        self.finish(&handle, outcome, started).await;
    }

    async fn finish(
        &self,
        handle: &JobProgress,
        outcome: std::result::Result<AnalysisResult, AnalysisFailure>,
        started: Instant,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        let recorded = match outcome {
            Ok(result) => {
                tracing::info!(
                    phase = "runner_complete",
                    status = "completed",
                    duration_ms,
                    overlaps = result.comparison_matrix.len(),
                    total_redundancy_cost = result.total_redundancy_cost,
                    warnings = result.warnings.len(),
                    "redundancy analysis finished"
                );
                handle.complete(result).await
            }
            Err(AnalysisFailure::Cancelled) => {
                tracing::info!(
                    phase = "runner_complete",
                    status = "cancelled",
                    duration_ms,
                    "redundancy analysis finished"
                );
                handle.cancelled().await
            }
            Err(AnalysisFailure::Failed(error)) => {
                tracing::warn!(
                    phase = "runner_complete",
                    status = "failed",
                    duration_ms,
                    error_code = %error.code,
                    error_message = %error.message,
                    "redundancy analysis finished"
                );
                handle.fail(error).await
            }
        };
        if let Err(err) = recorded {
            tracing::warn!(error = %err, "failed to record analysis outcome");
        }
    }
}

/// Closes a job that was registered but never scheduled so it cannot block later starts.
async fn abandon(handle: &JobProgress, err: anyhow::Error) -> TrackerError {
    tracing::error!(
        portfolio_id = %handle.portfolio_id(),
        job_id = %handle.job_id(),
        error = %err,
        "analysis job could not be scheduled"
    );
    let error = AnalysisJobError {
        code: INTERNAL_ERROR.to_string(),
        message: "analysis could not be scheduled".to_string(),
    };
    if let Err(fail_err) = handle.fail(error).await {
        tracing::warn!(error = %fail_err, "failed to close unscheduled analysis job");
    }
    TrackerError::Store(err)
}
