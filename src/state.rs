use crate::config::CoreConfig;
use crate::services::redundancy::RedundancyAnalysisService;
use reqwest::Client;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: CoreConfig,
    pub db: PgPool,
    pub redundancy: Arc<RedundancyAnalysisService>,
    pub http: Client,
}
