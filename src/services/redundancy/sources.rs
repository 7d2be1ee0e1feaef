use super::types::{
    CategoryOverlap, ConsolidationRecommendation, Feature, PairOverlap, RecommendationStatus,
    SoftwareRecord, StoredRecommendation,
};
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Read access to a company's software portfolio.
#[async_trait]
pub trait PortfolioStore: Send + Sync {
    /// Active records of the portfolio in a stable order. `ids`, when given, restricts the
    /// listing to those records.
    async fn list_active_software(
        &self,
        portfolio_id: Uuid,
        ids: Option<&[Uuid]>,
    ) -> Result<Vec<SoftwareRecord>>;
}

/// Capability tags per software product. An empty list is a valid answer.
#[async_trait]
pub trait FeatureCatalog: Send + Sync {
    async fn get_features(&self, software_id: Uuid) -> Result<Vec<Feature>>;
}

/// Durable sink for analysis output. Callers treat every error here as non-fatal.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save_comparison_matrix(&self, portfolio_id: Uuid, matrix: &[PairOverlap])
        -> Result<()>;

    async fn save_category_overlaps(
        &self,
        portfolio_id: Uuid,
        overlaps: &[CategoryOverlap],
    ) -> Result<()>;

    async fn clear_recommendations(&self, portfolio_id: Uuid) -> Result<()>;

    /// Returns the id assigned to the stored recommendation.
    async fn save_recommendation(
        &self,
        portfolio_id: Uuid,
        recommendation: &ConsolidationRecommendation,
    ) -> Result<Uuid>;

    /// Stored recommendations in `status`, highest savings first.
    async fn list_recommendations(
        &self,
        portfolio_id: Uuid,
        status: RecommendationStatus,
    ) -> Result<Vec<StoredRecommendation>>;

    /// Returns `false` when no recommendation has that id.
    async fn update_recommendation_status(
        &self,
        recommendation_id: Uuid,
        status: RecommendationStatus,
    ) -> Result<bool>;
}
