//! Per-portfolio analysis job state, polled by clients while a job runs.
//!
//! A job moves `queued -> running -> {completed | failed | cancelled}`. Terminal records are
//! frozen and linger for a retention window so a polling client can pick up the outcome.

use super::types::{
    ActivityEntry, ActivityKind, AnalysisCounts, AnalysisJob, AnalysisJobError, AnalysisJobStatus,
    AnalysisResult, ProgressExtra,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const ACTIVITY_LOG_LIMIT: usize = 50;

pub type JobMutation = Box<dyn FnOnce(&mut AnalysisJob) + Send>;

pub enum InsertOutcome {
    Inserted,
    Active(AnalysisJob),
}

/// Storage for job records. Implementations must apply each `modify` atomically with respect to
/// other calls for the same portfolio and must hide records past their `expires_at`.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Stores `job` unless a non-expired, non-terminal job exists for the same portfolio.
    async fn insert_if_idle(&self, job: AnalysisJob) -> Result<InsertOutcome>;

    async fn get(&self, portfolio_id: Uuid) -> Result<Option<AnalysisJob>>;

    /// Applies `mutation` and returns the updated record, or `None` when there is no record.
    async fn modify(&self, portfolio_id: Uuid, mutation: JobMutation)
        -> Result<Option<AnalysisJob>>;

    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Process-local store. Records are lost on restart and invisible to other instances.
#[derive(Default)]
pub struct InMemoryProgressStore {
    jobs: Mutex<HashMap<Uuid, AnalysisJob>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn insert_if_idle(&self, job: AnalysisJob) -> Result<InsertOutcome> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        if let Some(existing) = jobs.get(&job.portfolio_id) {
            if existing.is_active() && !existing.is_expired(now) {
                return Ok(InsertOutcome::Active(existing.clone()));
            }
        }
        jobs.insert(job.portfolio_id, job);
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, portfolio_id: Uuid) -> Result<Option<AnalysisJob>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        if jobs.get(&portfolio_id).is_some_and(|job| job.is_expired(now)) {
            jobs.remove(&portfolio_id);
            return Ok(None);
        }
        Ok(jobs.get(&portfolio_id).cloned())
    }

    async fn modify(
        &self,
        portfolio_id: Uuid,
        mutation: JobMutation,
    ) -> Result<Option<AnalysisJob>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&portfolio_id) {
            Some(job) if !job.is_expired(now) => {
                mutation(job);
                Ok(Some(job.clone()))
            }
            Some(_) => {
                jobs.remove(&portfolio_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, job| !job.is_expired(now));
        Ok(before - jobs.len())
    }
}

/// How long terminal records stay readable.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub completed: Duration,
    pub failed: Duration,
    pub cancelled: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: Duration::from_secs(30 * 60),
            failed: Duration::from_secs(5 * 60),
            cancelled: Duration::from_secs(60),
        }
    }
}

impl RetentionPolicy {
    fn deadline(&self, status: AnalysisJobStatus, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let window = match status {
            AnalysisJobStatus::Completed => self.completed,
            AnalysisJobStatus::Failed => self.failed,
            AnalysisJobStatus::Cancelled => self.cancelled,
            AnalysisJobStatus::Queued | AnalysisJobStatus::Running => return None,
        };
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        Some(now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
}

#[derive(Debug)]
pub enum TrackerError {
    /// A queued or running job already owns the portfolio.
    JobActive(Box<AnalysisJob>),
    Store(anyhow::Error),
}

impl std::fmt::Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerError::JobActive(job) => write!(
                f,
                "analysis job {} for portfolio {} is still {}",
                job.job_id,
                job.portfolio_id,
                job.status.as_str()
            ),
            TrackerError::Store(err) => write!(f, "progress store error: {err:#}"),
        }
    }
}

impl std::error::Error for TrackerError {}

pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    retention: RetentionPolicy,
    tokens: Mutex<HashMap<Uuid, (Uuid, CancellationToken)>>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>, retention: RetentionPolicy) -> Self {
        Self {
            store,
            retention,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory(retention: RetentionPolicy) -> Self {
        Self::new(Arc::new(InMemoryProgressStore::new()), retention)
    }

    /// Creates a `queued` record for the portfolio and returns the handle the job reports
    /// through. Fails with `JobActive` while another job for the portfolio is unfinished.
    pub async fn start(
        self: &Arc<Self>,
        portfolio_id: Uuid,
        total_units: usize,
    ) -> std::result::Result<JobProgress, TrackerError> {
        let now = Utc::now();
        let job = AnalysisJob {
            job_id: Uuid::new_v4(),
            portfolio_id,
            status: AnalysisJobStatus::Queued,
            current_step: "Initializing".to_string(),
            message: "Starting analysis...".to_string(),
            progress: 0.0,
            counts: AnalysisCounts {
                total_software: total_units,
                ..Default::default()
            },
            started_at: now,
            updated_at: now,
            finished_at: None,
            eta_seconds: 0,
            cancellation_requested: false,
            error: None,
            activity_log: vec![ActivityEntry {
                timestamp: now,
                message: "Redundancy analysis queued".to_string(),
                kind: ActivityKind::Info,
            }],
            results: None,
            expires_at: None,
        };
        let job_id = job.job_id;

        match self.store.insert_if_idle(job).await {
            Ok(InsertOutcome::Inserted) => {}
            Ok(InsertOutcome::Active(existing)) => {
                return Err(TrackerError::JobActive(Box::new(existing)));
            }
            Err(err) => return Err(TrackerError::Store(err)),
        }

        let cancel = CancellationToken::new();
        self.tokens
            .lock()
            .await
            .insert(portfolio_id, (job_id, cancel.clone()));

        Ok(JobProgress {
            tracker: self.clone(),
            portfolio_id,
            job_id,
            cancel,
        })
    }

    pub async fn update(
        &self,
        portfolio_id: Uuid,
        step: &str,
        progress: f64,
        message: &str,
        extra: ProgressExtra,
    ) -> Result<Option<AnalysisJob>> {
        self.apply(portfolio_id, None, running_update(step, progress, message, extra))
            .await
    }

    pub async fn add_activity(
        &self,
        portfolio_id: Uuid,
        message: &str,
        kind: ActivityKind,
    ) -> Result<Option<AnalysisJob>> {
        let message = message.to_string();
        self.apply(portfolio_id, None, move |job| {
            push_activity(job, message, kind, Utc::now());
        })
        .await
    }

    pub async fn complete(
        &self,
        portfolio_id: Uuid,
        overlaps_found: usize,
        total_cost: f64,
        results: AnalysisResult,
    ) -> Result<Option<AnalysisJob>> {
        self.finish(
            portfolio_id,
            None,
            completed(self.retention, overlaps_found, total_cost, results),
        )
        .await
    }

    pub async fn fail(
        &self,
        portfolio_id: Uuid,
        error: AnalysisJobError,
    ) -> Result<Option<AnalysisJob>> {
        self.finish(portfolio_id, None, failed(self.retention, error))
            .await
    }

    pub async fn cancel(&self, portfolio_id: Uuid) -> Result<Option<AnalysisJob>> {
        self.finish(portfolio_id, None, cancelled(self.retention))
            .await
    }

    /// Flags the portfolio's job for cancellation. Idempotent; safe from any task. Returns
    /// whether a job record exists.
    pub async fn request_cancellation(&self, portfolio_id: Uuid) -> Result<bool> {
        let updated = self
            .store
            .modify(
                portfolio_id,
                Box::new(|job: &mut AnalysisJob| {
                    if job.status.is_terminal() || job.cancellation_requested {
                        return;
                    }
                    let now = Utc::now();
                    job.cancellation_requested = true;
                    job.message = "Cancellation requested...".to_string();
                    job.updated_at = now;
                    push_activity(
                        job,
                        "Cancellation requested".to_string(),
                        ActivityKind::Warning,
                        now,
                    );
                }),
            )
            .await?;

        let token = self.tokens.lock().await.get(&portfolio_id).cloned();
        if let Some((job_id, token)) = token {
            if updated.as_ref().is_some_and(|job| job.job_id == job_id) {
                token.cancel();
            }
        }
        Ok(updated.is_some())
    }

    pub async fn is_cancellation_requested(&self, portfolio_id: Uuid) -> Result<bool> {
        Ok(self
            .store
            .get(portfolio_id)
            .await?
            .is_some_and(|job| job.cancellation_requested))
    }

    pub async fn get_progress(&self, portfolio_id: Uuid) -> Result<Option<AnalysisJob>> {
        self.store.get(portfolio_id).await
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        self.store.remove_expired(Utc::now()).await
    }

    pub fn start_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match self.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "purged expired analysis jobs"),
                    Err(err) => tracing::warn!(error = %err, "analysis job purge failed"),
                }
            }
        });
    }

    async fn apply(
        &self,
        portfolio_id: Uuid,
        job_id: Option<Uuid>,
        mutation: impl FnOnce(&mut AnalysisJob) + Send + 'static,
    ) -> Result<Option<AnalysisJob>> {
        self.store
            .modify(
                portfolio_id,
                Box::new(move |job: &mut AnalysisJob| {
                    if job_id.is_some_and(|id| id != job.job_id) {
                        tracing::debug!(
                            portfolio_id = %job.portfolio_id,
                            stale_job_id = ?job_id,
                            "ignoring update from superseded analysis job"
                        );
                        return;
                    }
                    if job.status.is_terminal() {
                        tracing::debug!(
                            portfolio_id = %job.portfolio_id,
                            job_id = %job.job_id,
                            status = job.status.as_str(),
                            "ignoring update to finished analysis job"
                        );
                        return;
                    }
                    mutation(job);
                }),
            )
            .await
    }

    async fn finish(
        &self,
        portfolio_id: Uuid,
        job_id: Option<Uuid>,
        mutation: impl FnOnce(&mut AnalysisJob) + Send + 'static,
    ) -> Result<Option<AnalysisJob>> {
        let updated = self.apply(portfolio_id, job_id, mutation).await;
        let mut tokens = self.tokens.lock().await;
        if let Some((registered, _)) = tokens.get(&portfolio_id) {
            if job_id.map_or(true, |id| id == *registered) {
                tokens.remove(&portfolio_id);
            }
        }
        updated
    }
}

/// Handle a running job uses to report progress and observe cancellation.
#[derive(Clone)]
pub struct JobProgress {
    tracker: Arc<ProgressTracker>,
    portfolio_id: Uuid,
    job_id: Uuid,
    cancel: CancellationToken,
}

impl std::fmt::Debug for JobProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProgress")
            .field("portfolio_id", &self.portfolio_id)
            .field("job_id", &self.job_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl JobProgress {
    pub fn portfolio_id(&self) -> Uuid {
        self.portfolio_id
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub async fn update(&self, step: &str, progress: f64, message: &str, extra: ProgressExtra) {
        if let Err(err) = self
            .tracker
            .apply(
                self.portfolio_id,
                Some(self.job_id),
                running_update(step, progress, message, extra),
            )
            .await
        {
            tracing::warn!(
                error = %err,
                portfolio_id = %self.portfolio_id,
                job_id = %self.job_id,
                "failed to write analysis progress"
            );
        }
    }

    pub async fn activity(&self, message: &str, kind: ActivityKind) {
        let message = message.to_string();
        if let Err(err) = self
            .tracker
            .apply(self.portfolio_id, Some(self.job_id), move |job| {
                push_activity(job, message, kind, Utc::now());
            })
            .await
        {
            tracing::warn!(error = %err, job_id = %self.job_id, "failed to append activity");
        }
    }

    /// True once cancellation was requested for this job, in this process or through the store.
    pub async fn is_cancelled(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        match self.tracker.store.get(self.portfolio_id).await {
            Ok(Some(job)) if job.job_id == self.job_id && job.cancellation_requested => {
                self.cancel.cancel();
                true
            }
            Ok(_) => false,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    job_id = %self.job_id,
                    "failed to read cancellation flag"
                );
                false
            }
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn complete(&self, results: AnalysisResult) -> Result<Option<AnalysisJob>> {
        let overlaps_found = results.comparison_matrix.len();
        let total_cost = results.total_redundancy_cost;
        let mutation = completed(self.tracker.retention, overlaps_found, total_cost, results);
        self.tracker
            .finish(self.portfolio_id, Some(self.job_id), mutation)
            .await
    }

    pub async fn fail(&self, error: AnalysisJobError) -> Result<Option<AnalysisJob>> {
        let mutation = failed(self.tracker.retention, error);
        self.tracker
            .finish(self.portfolio_id, Some(self.job_id), mutation)
            .await
    }

    pub async fn cancelled(&self) -> Result<Option<AnalysisJob>> {
        let mutation = cancelled(self.tracker.retention);
        self.tracker
            .finish(self.portfolio_id, Some(self.job_id), mutation)
            .await
    }
}

fn push_activity(job: &mut AnalysisJob, message: String, kind: ActivityKind, now: DateTime<Utc>) {
    job.activity_log.push(ActivityEntry {
        timestamp: now,
        message,
        kind,
    });
    if job.activity_log.len() > ACTIVITY_LOG_LIMIT {
        let excess = job.activity_log.len() - ACTIVITY_LOG_LIMIT;
        job.activity_log.drain(..excess);
    }
}

/// Linear extrapolation of the remaining time from elapsed time and percent done.
pub fn estimate_remaining_seconds(elapsed_seconds: f64, progress: f64) -> u64 {
    if progress <= 0.0 || !elapsed_seconds.is_finite() {
        return 0;
    }
    let total = elapsed_seconds / progress * 100.0;
    (total - elapsed_seconds).max(0.0).round() as u64
}

fn running_update(
    step: &str,
    progress: f64,
    message: &str,
    extra: ProgressExtra,
) -> impl FnOnce(&mut AnalysisJob) + Send + 'static {
    let step = step.to_string();
    let message = message.to_string();
    move |job: &mut AnalysisJob| {
        let now = Utc::now();
        let requested = if progress.is_nan() {
            job.progress
        } else {
            progress.clamp(0.0, 100.0)
        };
        job.status = AnalysisJobStatus::Running;
        job.current_step = step;
        job.progress = job.progress.max(requested);
        let elapsed = (now - job.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        job.eta_seconds = estimate_remaining_seconds(elapsed, job.progress);
        extra.merge_into(&mut job.counts);
        job.message = message.clone();
        job.updated_at = now;
        push_activity(job, message, ActivityKind::Info, now);
    }
}

fn completed(
    retention: RetentionPolicy,
    overlaps_found: usize,
    total_cost: f64,
    results: AnalysisResult,
) -> impl FnOnce(&mut AnalysisJob) + Send + 'static {
    move |job: &mut AnalysisJob| {
        let now = Utc::now();
        let message = format!(
            "Analysis complete! Found {overlaps_found} overlaps with ${total_cost:.0} in redundancy costs."
        );
        job.status = AnalysisJobStatus::Completed;
        job.progress = 100.0;
        job.current_step = "Complete".to_string();
        job.counts.overlaps_found = overlaps_found;
        job.counts.recommendations = results.recommendations.len();
        job.eta_seconds = 0;
        job.message = message.clone();
        job.results = Some(results);
        job.updated_at = now;
        job.finished_at = Some(now);
        job.expires_at = retention.deadline(AnalysisJobStatus::Completed, now);
        push_activity(job, message, ActivityKind::Success, now);
    }
}

fn failed(
    retention: RetentionPolicy,
    error: AnalysisJobError,
) -> impl FnOnce(&mut AnalysisJob) + Send + 'static {
    move |job: &mut AnalysisJob| {
        let now = Utc::now();
        let message = format!("Analysis failed: {}", error.message);
        job.status = AnalysisJobStatus::Failed;
        job.current_step = "Failed".to_string();
        job.eta_seconds = 0;
        job.message = message.clone();
        job.error = Some(error);
        job.updated_at = now;
        job.finished_at = Some(now);
        job.expires_at = retention.deadline(AnalysisJobStatus::Failed, now);
        push_activity(job, message, ActivityKind::Error, now);
    }
}

fn cancelled(retention: RetentionPolicy) -> impl FnOnce(&mut AnalysisJob) + Send + 'static {
    move |job: &mut AnalysisJob| {
        let now = Utc::now();
        job.status = AnalysisJobStatus::Cancelled;
        job.current_step = "Cancelled".to_string();
        job.eta_seconds = 0;
        job.message = "Analysis cancelled by user".to_string();
        job.updated_at = now;
        job.finished_at = Some(now);
        job.expires_at = retention.deadline(AnalysisJobStatus::Cancelled, now);
        push_activity(
            job,
            "Analysis cancelled".to_string(),
            ActivityKind::Warning,
            now,
        );
    }
}
