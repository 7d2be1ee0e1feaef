use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use uuid::Uuid;

use crate::error::{internal_error, AppError};
use crate::services::redundancy::{
    CancelResponse, ProgressResponse, RecommendationListResponse, RecommendationStatus,
    StartAnalysisRequest, StartAnalysisResponse, TrackerError, UpdateRecommendationStatusRequest,
    UpdateRecommendationStatusResponse,
};
use crate::state::AppState;

fn parse_portfolio_id(raw: &str) -> Result<Uuid, (StatusCode, String)> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid portfolio id".to_string()))
}

fn parse_status(raw: &str) -> Result<RecommendationStatus, (StatusCode, String)> {
    RecommendationStatus::parse(raw).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            "status must be one of pending, accepted, rejected".to_string(),
        )
    })
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
pub(crate) struct RecommendationListQuery {
    /// pending (default), accepted or rejected.
    status: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/redundancy/analyze",
    tag = "redundancy",
    request_body = StartAnalysisRequest,
    responses(
        (status = 202, description = "Analysis queued", body = StartAnalysisResponse),
        (status = 409, description = "An analysis is already active for this portfolio")
    )
)]
pub(crate) async fn start_analysis(
    State(state): State<AppState>,
    Json(request): Json<StartAnalysisRequest>,
) -> Result<(StatusCode, Json<StartAnalysisResponse>), (StatusCode, String)> {
    match state
        .redundancy
        .start_analysis(request.portfolio_id, request.selected_ids)
        .await
    {
        Ok(job) => Ok((StatusCode::ACCEPTED, Json(StartAnalysisResponse { job }))),
        Err(TrackerError::JobActive(job)) => Err(AppError::conflict(format!(
            "An analysis is already {} for this portfolio (job {})",
            job.status.as_str(),
            job.job_id
        ))
        .into()),
        Err(TrackerError::Store(err)) => Err(internal_error(err)),
    }
}

#[utoipa::path(
    get,
    path = "/api/redundancy/progress/{portfolio_id}",
    tag = "redundancy",
    params(("portfolio_id" = String, Path, description = "Portfolio id")),
    responses(
        (status = 200, description = "Job snapshot", body = ProgressResponse),
        (status = 400, description = "Invalid portfolio id"),
        (status = 404, description = "No analysis job for this portfolio")
    )
)]
pub(crate) async fn get_progress(
    State(state): State<AppState>,
    Path(portfolio_id): Path<String>,
) -> Result<Json<ProgressResponse>, (StatusCode, String)> {
    let portfolio_id = parse_portfolio_id(&portfolio_id)?;
    let job = state
        .redundancy
        .get_progress(portfolio_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| AppError::not_found("No analysis job for this portfolio"))?;
    Ok(Json(ProgressResponse { job }))
}

#[utoipa::path(
    delete,
    path = "/api/redundancy/progress/{portfolio_id}",
    tag = "redundancy",
    params(("portfolio_id" = String, Path, description = "Portfolio id")),
    responses(
        (status = 200, description = "Cancellation acknowledged", body = CancelResponse),
        (status = 400, description = "Invalid portfolio id"),
        (status = 404, description = "No analysis job for this portfolio")
    )
)]
pub(crate) async fn cancel_analysis(
    State(state): State<AppState>,
    Path(portfolio_id): Path<String>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    let portfolio_id = parse_portfolio_id(&portfolio_id)?;
    let found = state
        .redundancy
        .request_cancellation(portfolio_id)
        .await
        .map_err(internal_error)?;
    if !found {
        return Err(AppError::not_found("No analysis job for this portfolio").into());
    }

    let snapshot = state
        .redundancy
        .get_progress(portfolio_id)
        .await
        .map_err(internal_error)?;
    let message = match snapshot {
        Some(job) if job.status.is_terminal() => {
            format!("Analysis already {}", job.status.as_str())
        }
        _ => "Cancellation requested".to_string(),
    };
    Ok(Json(CancelResponse {
        acknowledged: true,
        message,
    }))
}

#[utoipa::path(
    get,
    path = "/api/redundancy/portfolios/{portfolio_id}/recommendations",
    tag = "redundancy",
    params(
        ("portfolio_id" = String, Path, description = "Portfolio id"),
        RecommendationListQuery
    ),
    responses(
        (status = 200, description = "Stored recommendations", body = RecommendationListResponse),
        (status = 400, description = "Invalid portfolio id or status")
    )
)]
pub(crate) async fn list_recommendations(
    State(state): State<AppState>,
    Path(portfolio_id): Path<String>,
    Query(query): Query<RecommendationListQuery>,
) -> Result<Json<RecommendationListResponse>, (StatusCode, String)> {
    let portfolio_id = parse_portfolio_id(&portfolio_id)?;
    let status = match query.status.as_deref() {
        Some(raw) => parse_status(raw)?,
        None => RecommendationStatus::Pending,
    };
    let recommendations = state
        .redundancy
        .list_recommendations(portfolio_id, status)
        .await
        .map_err(internal_error)?;
    Ok(Json(RecommendationListResponse { recommendations }))
}

#[utoipa::path(
    patch,
    path = "/api/redundancy/recommendations/{recommendation_id}",
    tag = "redundancy",
    request_body = UpdateRecommendationStatusRequest,
    params(("recommendation_id" = String, Path, description = "Recommendation id")),
    responses(
        (status = 200, description = "Status updated", body = UpdateRecommendationStatusResponse),
        (status = 400, description = "Invalid recommendation id or status"),
        (status = 404, description = "Recommendation not found")
    )
)]
pub(crate) async fn update_recommendation_status(
    State(state): State<AppState>,
    Path(recommendation_id): Path<String>,
    Json(request): Json<UpdateRecommendationStatusRequest>,
) -> Result<Json<UpdateRecommendationStatusResponse>, (StatusCode, String)> {
    let recommendation_id = Uuid::parse_str(recommendation_id.trim()).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            "Invalid recommendation id".to_string(),
        )
    })?;
    let status = parse_status(&request.status)?;
    let updated = state
        .redundancy
        .update_recommendation_status(recommendation_id, status)
        .await
        .map_err(internal_error)?;
    if !updated {
        return Err(AppError::not_found("Recommendation not found").into());
    }
    Ok(Json(UpdateRecommendationStatusResponse {
        id: recommendation_id,
        status,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/redundancy/analyze", post(start_analysis))
        .route(
            "/redundancy/progress/{portfolio_id}",
            get(get_progress).delete(cancel_analysis),
        )
        .route(
            "/redundancy/portfolios/{portfolio_id}/recommendations",
            get(list_recommendations),
        )
        .route(
            "/redundancy/recommendations/{recommendation_id}",
            patch(update_recommendation_status),
        )
}
