use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::routes;
use crate::services::redundancy::{
    ActivityEntry, ActivityKind, AnalysisCounts, AnalysisJob, AnalysisJobError,
    AnalysisJobStatus, AnalysisResult, CancelResponse, CategoryOverlap,
    ConsolidationRecommendation, Feature, FeatureCategory, Level, PairOverlap, ProgressResponse,
    RecommendationListResponse, RecommendationSource, RecommendationStatus, SoftwareSummary,
    StartAnalysisRequest, StartAnalysisResponse, StoredRecommendation,
    UpdateRecommendationStatusRequest, UpdateRecommendationStatusResponse,
};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Portfolio Server API",
        description = "Software portfolio redundancy analysis"
    ),
    paths(
        routes::health::healthz_handler,
        routes::redundancy::start_analysis,
        routes::redundancy::get_progress,
        routes::redundancy::cancel_analysis,
        routes::redundancy::list_recommendations,
        routes::redundancy::update_recommendation_status,
    ),
    components(schemas(
        routes::health::HealthResponse,
        StartAnalysisRequest,
        StartAnalysisResponse,
        ProgressResponse,
        CancelResponse,
        AnalysisJob,
        AnalysisJobStatus,
        AnalysisJobError,
        AnalysisCounts,
        ActivityEntry,
        ActivityKind,
        AnalysisResult,
        PairOverlap,
        CategoryOverlap,
        ConsolidationRecommendation,
        RecommendationSource,
        RecommendationStatus,
        StoredRecommendation,
        RecommendationListResponse,
        UpdateRecommendationStatusRequest,
        UpdateRecommendationStatusResponse,
        SoftwareSummary,
        Feature,
        FeatureCategory,
        Level,
    )),
    tags(
        (name = "health", description = "Liveness"),
        (name = "redundancy", description = "Feature overlap analysis jobs")
    )
)]
pub struct ApiDoc;

pub fn openapi_json() -> serde_json::Value {
    serde_json::to_value(ApiDoc::openapi()).unwrap_or(serde_json::Value::Null)
}

async fn openapi_handler() -> Json<serde_json::Value> {
    Json(openapi_json())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(openapi_handler))
}
