use super::sources::{FeatureCatalog, PortfolioStore, ResultStore};
use super::types::{
    CategoryOverlap, ConsolidationRecommendation, Feature, FeatureCategory, Level, PairOverlap,
    RecommendationStatus, SoftwareRecord, SoftwareSummary, StoredRecommendation,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

pub const CONTRACT_STATUS_ACTIVE: &str = "active";

#[derive(sqlx::FromRow)]
struct SoftwareRow {
    id: Uuid,
    software_name: String,
    vendor_name: Option<String>,
    category: Option<String>,
    annual_cost: Option<f64>,
}

impl SoftwareRow {
    fn into_record(self) -> SoftwareRecord {
        SoftwareRecord {
            id: self.id,
            name: self.software_name,
            vendor: self.vendor_name.unwrap_or_default(),
            category: self
                .category
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| FeatureCategory::Other.as_str().to_string()),
            annual_cost: self
                .annual_cost
                .filter(|value| value.is_finite())
                .unwrap_or(0.0)
                .max(0.0),
        }
    }
}

#[derive(sqlx::FromRow)]
struct FeatureRow {
    feature_name: String,
    category_name: String,
}

impl FeatureRow {
    fn into_feature(self) -> Feature {
        Feature::new(
            FeatureCategory::from_label(&self.category_name),
            self.feature_name,
        )
    }
}

#[derive(sqlx::FromRow)]
struct RecommendationRow {
    id: Uuid,
    software_to_keep_id: Uuid,
    software_to_remove_ids: Option<Vec<Uuid>>,
    annual_savings: Option<f64>,
    features_covered: Option<SqlJson<Vec<String>>>,
    features_at_risk: Option<SqlJson<Vec<String>>>,
    migration_effort: Option<String>,
    business_risk: Option<String>,
    recommendation_text: Option<String>,
    confidence_score: Option<f64>,
    status: Option<String>,
    created_at: Option<DateTime<Utc>>,
    keep_name: String,
    keep_vendor: Option<String>,
    keep_cost: Option<f64>,
}

impl RecommendationRow {
    /// Removed products that no longer exist in the portfolio are dropped.
    fn into_stored(self, removed: &HashMap<Uuid, SoftwareSummary>) -> StoredRecommendation {
        let level = |value: Option<String>| {
            value
                .as_deref()
                .and_then(Level::parse)
                .unwrap_or(Level::Medium)
        };
        StoredRecommendation {
            id: self.id,
            keep: SoftwareSummary {
                id: self.software_to_keep_id,
                name: self.keep_name,
                vendor: self.keep_vendor.unwrap_or_default(),
                annual_cost: self.keep_cost.unwrap_or(0.0),
            },
            remove: self
                .software_to_remove_ids
                .unwrap_or_default()
                .iter()
                .filter_map(|id| removed.get(id).cloned())
                .collect(),
            annual_savings: self.annual_savings.unwrap_or(0.0),
            features_covered: self.features_covered.map(|json| json.0).unwrap_or_default(),
            features_at_risk: self.features_at_risk.map(|json| json.0).unwrap_or_default(),
            migration_effort: level(self.migration_effort),
            business_risk: level(self.business_risk),
            confidence_score: self.confidence_score.unwrap_or(0.0),
            rationale: self.recommendation_text.unwrap_or_default(),
            status: self
                .status
                .as_deref()
                .and_then(RecommendationStatus::parse)
                .unwrap_or_default(),
            created_at: self.created_at,
        }
    }
}

/// PostgreSQL-backed portfolio, catalog and result storage.
#[derive(Clone)]
pub struct PgRedundancyStore {
    db: PgPool,
}

impl PgRedundancyStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PortfolioStore for PgRedundancyStore {
    async fn list_active_software(
        &self,
        portfolio_id: Uuid,
        ids: Option<&[Uuid]>,
    ) -> Result<Vec<SoftwareRecord>> {
        let ids: Option<Vec<Uuid>> = ids.filter(|ids| !ids.is_empty()).map(|ids| ids.to_vec());
        let rows: Vec<SoftwareRow> = sqlx::query_as(
            r#"
            SELECT
                id,
                software_name,
                vendor_name,
                category,
                total_annual_cost::float8 as annual_cost
            FROM software_assets
            WHERE company_id = $1
              AND contract_status = $2
              AND ($3::uuid[] IS NULL OR id = ANY($3))
            ORDER BY software_name, id
            "#,
        )
        .bind(portfolio_id)
        .bind(CONTRACT_STATUS_ACTIVE)
        .bind(ids)
        .fetch_all(&self.db)
        .await
        .with_context(|| format!("failed to list active software for portfolio {portfolio_id}"))?;

        Ok(rows.into_iter().map(SoftwareRow::into_record).collect())
    }
}

#[async_trait]
impl FeatureCatalog for PgRedundancyStore {
    async fn get_features(&self, software_id: Uuid) -> Result<Vec<Feature>> {
        let tagged: Vec<FeatureRow> = sqlx::query_as(
            r#"
            SELECT sfm.feature_name, fc.category_name
            FROM software_features_mapping sfm
            JOIN feature_categories fc ON sfm.feature_category_id = fc.id
            WHERE sfm.software_id = $1
            ORDER BY fc.category_name, sfm.feature_name
            "#,
        )
        .bind(software_id)
        .fetch_all(&self.db)
        .await
        .with_context(|| format!("failed to load tagged features for software {software_id}"))?;

        if !tagged.is_empty() {
            return Ok(tagged.into_iter().map(FeatureRow::into_feature).collect());
        }

        let cataloged: Vec<FeatureRow> = sqlx::query_as(
            r#"
            SELECT sf.feature_name, fc.category_name
            FROM software_assets sa
            JOIN software_catalog sc ON sc.software_name = sa.software_name
            JOIN software_features sf ON sf.software_catalog_id = sc.id
            JOIN feature_categories fc ON sf.feature_category_id = fc.id
            WHERE sa.id = $1
            ORDER BY fc.category_name, sf.feature_name
            "#,
        )
        .bind(software_id)
        .fetch_all(&self.db)
        .await
        .with_context(|| format!("failed to load catalog features for software {software_id}"))?;

        Ok(cataloged.into_iter().map(FeatureRow::into_feature).collect())
    }
}

#[async_trait]
impl ResultStore for PgRedundancyStore {
    async fn save_comparison_matrix(
        &self,
        portfolio_id: Uuid,
        matrix: &[PairOverlap],
    ) -> Result<()> {
        let mut tx = self.db.begin().await.context("failed to open transaction")?;

        sqlx::query("DELETE FROM feature_comparison_matrix WHERE company_id = $1")
            .bind(portfolio_id)
            .execute(&mut *tx)
            .await
            .context("failed to clear feature_comparison_matrix")?;

        for item in matrix {
            sqlx::query(
                r#"
                INSERT INTO feature_comparison_matrix (
                    company_id,
                    software_id_1,
                    software_id_2,
                    overlap_percentage,
                    shared_features_count,
                    total_features_compared,
                    shared_features,
                    cost_implication
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (company_id, software_id_1, software_id_2) DO UPDATE SET
                    overlap_percentage = EXCLUDED.overlap_percentage,
                    shared_features_count = EXCLUDED.shared_features_count,
                    total_features_compared = EXCLUDED.total_features_compared,
                    shared_features = EXCLUDED.shared_features,
                    cost_implication = EXCLUDED.cost_implication
                "#,
            )
            .bind(portfolio_id)
            .bind(item.software_a.id)
            .bind(item.software_b.id)
            .bind(item.overlap_percentage)
            .bind(item.shared_features.len() as i32)
            .bind(item.features_compared as i32)
            .bind(SqlJson(item.shared_feature_names()))
            .bind(item.cost_implication)
            .execute(&mut *tx)
            .await
            .context("failed to insert feature_comparison_matrix row")?;
        }

        tx.commit().await.context("failed to commit comparison matrix")?;
        Ok(())
    }

    async fn save_category_overlaps(
        &self,
        portfolio_id: Uuid,
        overlaps: &[CategoryOverlap],
    ) -> Result<()> {
        let mut tx = self.db.begin().await.context("failed to open transaction")?;

        sqlx::query("DELETE FROM feature_overlaps WHERE company_id = $1")
            .bind(portfolio_id)
            .execute(&mut *tx)
            .await
            .context("failed to clear feature_overlaps")?;

        for overlap in overlaps {
            let software_ids: Vec<Uuid> = overlap.software.iter().map(|sw| sw.id).collect();
            let inserted = sqlx::query(
                r#"
                INSERT INTO feature_overlaps (
                    company_id,
                    feature_category_id,
                    software_ids,
                    overlap_count,
                    redundancy_cost,
                    priority
                )
                SELECT $1, fc.id, $3, $4, $5, $6
                FROM feature_categories fc
                WHERE fc.category_name = $2
                "#,
            )
            .bind(portfolio_id)
            .bind(overlap.category.as_str())
            .bind(&software_ids)
            .bind(overlap.overlap_count as i32)
            .bind(overlap.redundancy_cost)
            .bind(overlap.priority.as_str())
            .execute(&mut *tx)
            .await
            .context("failed to insert feature_overlaps row")?;

            if inserted.rows_affected() == 0 {
                tracing::debug!(
                    category = overlap.category.as_str(),
                    "feature category not registered; category overlap not stored"
                );
            }
        }

        tx.commit().await.context("failed to commit category overlaps")?;
        Ok(())
    }

    async fn clear_recommendations(&self, portfolio_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM consolidation_recommendations WHERE company_id = $1")
            .bind(portfolio_id)
            .execute(&self.db)
            .await
            .context("failed to clear consolidation_recommendations")?;
        Ok(())
    }

    async fn save_recommendation(
        &self,
        portfolio_id: Uuid,
        recommendation: &ConsolidationRecommendation,
    ) -> Result<Uuid> {
        let remove_ids: Vec<Uuid> = recommendation.remove.iter().map(|sw| sw.id).collect();
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO consolidation_recommendations (
                company_id,
                software_to_keep_id,
                software_to_remove_ids,
                annual_savings,
                features_covered,
                features_at_risk,
                migration_effort,
                business_risk,
                recommendation_text,
                confidence_score,
                status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(portfolio_id)
        .bind(recommendation.keep.id)
        .bind(&remove_ids)
        .bind(recommendation.annual_savings)
        .bind(SqlJson(&recommendation.features_covered))
        .bind(SqlJson(&recommendation.features_at_risk))
        .bind(recommendation.migration_effort.as_str())
        .bind(recommendation.business_risk.as_str())
        .bind(&recommendation.rationale)
        .bind(recommendation.confidence_score)
        .bind(recommendation.status.as_str())
        .fetch_one(&self.db)
        .await
        .context("failed to insert consolidation recommendation")?;
        Ok(id)
    }

    async fn list_recommendations(
        &self,
        portfolio_id: Uuid,
        status: RecommendationStatus,
    ) -> Result<Vec<StoredRecommendation>> {
        let rows: Vec<RecommendationRow> = sqlx::query_as(
            r#"
            SELECT
                cr.id,
                cr.software_to_keep_id,
                cr.software_to_remove_ids,
                cr.annual_savings::float8 as annual_savings,
                cr.features_covered,
                cr.features_at_risk,
                cr.migration_effort,
                cr.business_risk,
                cr.recommendation_text,
                cr.confidence_score::float8 as confidence_score,
                cr.status,
                cr.created_at,
                keep.software_name as keep_name,
                keep.vendor_name as keep_vendor,
                keep.total_annual_cost::float8 as keep_cost
            FROM consolidation_recommendations cr
            JOIN software_assets keep ON keep.id = cr.software_to_keep_id
            WHERE cr.company_id = $1
              AND cr.status = $2
            ORDER BY cr.annual_savings DESC, cr.id
            "#,
        )
        .bind(portfolio_id)
        .bind(status.as_str())
        .fetch_all(&self.db)
        .await
        .with_context(|| format!("failed to list recommendations for portfolio {portfolio_id}"))?;

        let remove_ids: Vec<Uuid> = rows
            .iter()
            .flat_map(|row| row.software_to_remove_ids.iter().flatten().copied())
            .collect();
        let removed: HashMap<Uuid, SoftwareSummary> = if remove_ids.is_empty() {
            HashMap::new()
        } else {
            let software: Vec<SoftwareRow> = sqlx::query_as(
                r#"
                SELECT
                    id,
                    software_name,
                    vendor_name,
                    category,
                    total_annual_cost::float8 as annual_cost
                FROM software_assets
                WHERE id = ANY($1)
                "#,
            )
            .bind(&remove_ids)
            .fetch_all(&self.db)
            .await
            .context("failed to load removed software for recommendations")?;
            software
                .into_iter()
                .map(|row| {
                    let record = row.into_record();
                    (record.id, record.summary())
                })
                .collect()
        };

        Ok(rows
            .into_iter()
            .map(|row| row.into_stored(&removed))
            .collect())
    }

    async fn update_recommendation_status(
        &self,
        recommendation_id: Uuid,
        status: RecommendationStatus,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE consolidation_recommendations SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(recommendation_id)
        .bind(status.as_str())
        .execute(&self.db)
        .await
        .with_context(|| format!("failed to update recommendation {recommendation_id}"))?;
        Ok(updated.rows_affected() > 0)
    }
}
