use crate::config::CoreConfig;
use crate::db;
use crate::services::redundancy::{
    AiReasoner, AnalyzerOptions, CategoryOverlap, ConsolidationRecommendation, Feature,
    FeatureCatalog, FeatureCategory, OverlapAnalyzer, PairContext, PairOverlap, PortfolioStore,
    ProgressTracker, RecommendationEngine, RecommendationStatus, RedundancyAnalysisService,
    ResultStore, RetentionPolicy, SoftwareRecord, StoredRecommendation,
};
use crate::state::AppState;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub fn test_config() -> CoreConfig {
    CoreConfig {
        database_url: "postgresql://postgres@localhost/postgres".to_string(),
        database_max_connections: 2,
        ollama_url: "http://127.0.0.1:11434".to_string(),
        ollama_model: "llama3.1:8b".to_string(),
        ollama_timeout_seconds: 5,
        disable_ollama: true,
        analysis_max_concurrent_jobs: 1,
        analysis_checkpoint_every: 10,
        analysis_retention_completed_seconds: 1800,
        analysis_retention_failed_seconds: 300,
        analysis_retention_cancelled_seconds: 60,
        analysis_purge_interval_seconds: 60,
    }
}

/// State whose redundancy service runs against an in-memory portfolio.
pub fn test_state(fake: &Arc<FakePortfolio>) -> AppState {
    let config = test_config();
    let db = db::connect_lazy(&config.database_url, config.database_max_connections)
        .expect("connect_lazy");
    let redundancy = Arc::new(RedundancyAnalysisService::new(
        fake_analyzer(fake, None),
        Arc::new(ProgressTracker::in_memory(RetentionPolicy::default())),
        config.analysis_max_concurrent_jobs,
        Duration::from_secs(config.analysis_purge_interval_seconds),
    ));
    AppState {
        config,
        db,
        redundancy,
        http: reqwest::Client::new(),
    }
}

pub fn fake_analyzer(
    fake: &Arc<FakePortfolio>,
    reasoner: Option<Arc<dyn AiReasoner>>,
) -> OverlapAnalyzer {
    OverlapAnalyzer::new(
        fake.clone(),
        fake.clone(),
        fake.clone(),
        RecommendationEngine::new(reasoner, fake.clone()),
        AnalyzerOptions {
            checkpoint_every: 3,
        },
    )
}

pub fn features(category: FeatureCategory, names: &[&str]) -> Vec<Feature> {
    names
        .iter()
        .map(|name| Feature::new(category, *name))
        .collect()
}

/// In-memory portfolio, catalog and result sink with failure switches.
pub struct FakePortfolio {
    portfolio_id: Uuid,
    records: Mutex<Vec<SoftwareRecord>>,
    features: Mutex<HashMap<Uuid, Vec<Feature>>>,
    feature_delay: Option<Duration>,
    fail_listing: AtomicBool,
    fail_features: AtomicBool,
    panic_on_features: AtomicBool,
    fail_saves: AtomicBool,
    saved_matrix: Mutex<Option<Vec<PairOverlap>>>,
    saved_overlaps: Mutex<Option<Vec<CategoryOverlap>>>,
    saved_recommendations: Mutex<Vec<ConsolidationRecommendation>>,
    clear_calls: AtomicUsize,
}

impl Default for FakePortfolio {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePortfolio {
    pub fn new() -> Self {
        Self {
            portfolio_id: Uuid::new_v4(),
            records: Mutex::new(Vec::new()),
            features: Mutex::new(HashMap::new()),
            feature_delay: None,
            fail_listing: AtomicBool::new(false),
            fail_features: AtomicBool::new(false),
            panic_on_features: AtomicBool::new(false),
            fail_saves: AtomicBool::new(false),
            saved_matrix: Mutex::new(None),
            saved_overlaps: Mutex::new(None),
            saved_recommendations: Mutex::new(Vec::new()),
            clear_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_feature_delay(mut self, delay: Duration) -> Self {
        self.feature_delay = Some(delay);
        self
    }

    pub fn portfolio_id(&self) -> Uuid {
        self.portfolio_id
    }

    /// Adds an active product in the "Communication" coarse category.
    pub fn add_software(&self, name: &str, annual_cost: f64, tagged: Vec<Feature>) -> SoftwareRecord {
        let record = SoftwareRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            vendor: format!("{name} Vendor"),
            category: "Communication".to_string(),
            annual_cost,
        };
        self.records.lock().unwrap().push(record.clone());
        self.features.lock().unwrap().insert(record.id, tagged);
        record
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn fail_features(&self, fail: bool) {
        self.fail_features.store(fail, Ordering::SeqCst);
    }

    pub fn panic_on_features(&self, panic: bool) {
        self.panic_on_features.store(panic, Ordering::SeqCst);
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn saved_matrix(&self) -> Option<Vec<PairOverlap>> {
        self.saved_matrix.lock().unwrap().clone()
    }

    pub fn saved_category_overlaps(&self) -> Option<Vec<CategoryOverlap>> {
        self.saved_overlaps.lock().unwrap().clone()
    }

    pub fn saved_recommendations(&self) -> Vec<ConsolidationRecommendation> {
        self.saved_recommendations.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) -> usize {
        self.clear_calls.load(Ordering::SeqCst)
    }

    fn check_saves(&self) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            anyhow::bail!("relation does not exist");
        }
        Ok(())
    }
}

#[async_trait]
impl PortfolioStore for FakePortfolio {
    async fn list_active_software(
        &self,
        _portfolio_id: Uuid,
        ids: Option<&[Uuid]>,
    ) -> Result<Vec<SoftwareRecord>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        let records = self.records.lock().unwrap().clone();
        Ok(match ids {
            Some(ids) => records
                .into_iter()
                .filter(|record| ids.contains(&record.id))
                .collect(),
            None => records,
        })
    }
}

#[async_trait]
impl FeatureCatalog for FakePortfolio {
    async fn get_features(&self, software_id: Uuid) -> Result<Vec<Feature>> {
        if let Some(delay) = self.feature_delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_on_features.load(Ordering::SeqCst) {
            panic!("catalog exploded");
        }
        if self.fail_features.load(Ordering::SeqCst) {
            anyhow::bail!("catalog unavailable");
        }
        Ok(self
            .features
            .lock()
            .unwrap()
            .get(&software_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ResultStore for FakePortfolio {
    async fn save_comparison_matrix(
        &self,
        _portfolio_id: Uuid,
        matrix: &[PairOverlap],
    ) -> Result<()> {
        self.check_saves()?;
        *self.saved_matrix.lock().unwrap() = Some(matrix.to_vec());
        Ok(())
    }

    async fn save_category_overlaps(
        &self,
        _portfolio_id: Uuid,
        overlaps: &[CategoryOverlap],
    ) -> Result<()> {
        self.check_saves()?;
        *self.saved_overlaps.lock().unwrap() = Some(overlaps.to_vec());
        Ok(())
    }

    async fn clear_recommendations(&self, _portfolio_id: Uuid) -> Result<()> {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
        self.check_saves()?;
        self.saved_recommendations.lock().unwrap().clear();
        Ok(())
    }

    async fn save_recommendation(
        &self,
        _portfolio_id: Uuid,
        recommendation: &ConsolidationRecommendation,
    ) -> Result<Uuid> {
        self.check_saves()?;
        let id = Uuid::new_v4();
        let mut stored = recommendation.clone();
        stored.id = Some(id);
        self.saved_recommendations.lock().unwrap().push(stored);
        Ok(id)
    }

    async fn list_recommendations(
        &self,
        _portfolio_id: Uuid,
        status: RecommendationStatus,
    ) -> Result<Vec<StoredRecommendation>> {
        let mut stored: Vec<StoredRecommendation> = self
            .saved_recommendations
            .lock()
            .unwrap()
            .iter()
            .filter(|rec| rec.status == status)
            .filter_map(|rec| {
                Some(StoredRecommendation {
                    id: rec.id?,
                    keep: rec.keep.clone(),
                    remove: rec.remove.clone(),
                    annual_savings: rec.annual_savings,
                    features_covered: rec.features_covered.clone(),
                    features_at_risk: rec.features_at_risk.clone(),
                    migration_effort: rec.migration_effort,
                    business_risk: rec.business_risk,
                    confidence_score: rec.confidence_score,
                    rationale: rec.rationale.clone(),
                    status: rec.status,
                    created_at: None,
                })
            })
            .collect();
        stored.sort_by(|a, b| b.annual_savings.total_cmp(&a.annual_savings));
        Ok(stored)
    }

    async fn update_recommendation_status(
        &self,
        recommendation_id: Uuid,
        status: RecommendationStatus,
    ) -> Result<bool> {
        self.check_saves()?;
        let mut saved = self.saved_recommendations.lock().unwrap();
        match saved
            .iter_mut()
            .find(|rec| rec.id == Some(recommendation_id))
        {
            Some(rec) => {
                rec.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Reasoner that replays canned replies in order.
pub struct ScriptedReasoner {
    available: bool,
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: AtomicUsize,
}

impl ScriptedReasoner {
    pub fn new(available: bool, replies: Vec<Result<&str, &str>>) -> Self {
        Self {
            available,
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|reply| reply.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AiReasoner for ScriptedReasoner {
    fn model_label(&self) -> String {
        "scripted".to_string()
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn judge(&self, _context: &PairContext<'_>) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(err)) => Err(anyhow::anyhow!(err)),
            None => anyhow::bail!("no scripted reply left"),
        }
    }
}
