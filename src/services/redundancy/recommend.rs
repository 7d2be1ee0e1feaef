//! Consolidation recommendations for strongly overlapping pairs.
//!
//! Each qualifying pair is judged by the AI reasoner when one is configured and reachable; any
//! transport or parse problem falls back to the deterministic rule-based choice for that pair.

use super::progress::JobProgress;
use super::sources::ResultStore;
use super::types::{
    ActivityKind, ConsolidationRecommendation, Feature, Level, PairOverlap, ProgressExtra,
    RecommendationSource, RecommendationStatus, SoftwareFeatures,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Pairs above this overlap get a recommendation.
pub const HIGH_OVERLAP_THRESHOLD: f64 = 60.0;
pub const RULE_BASED_CONFIDENCE: f64 = 0.6;
pub const DEFAULT_AI_CONFIDENCE: f64 = 0.75;

const PROGRESS_START: f64 = 85.0;
const PROGRESS_END: f64 = 95.0;

/// What the reasoner is asked to judge. `first` is reply option 1, `second` is option 2.
pub struct PairContext<'a> {
    pub first: &'a SoftwareFeatures,
    pub second: &'a SoftwareFeatures,
    pub overlap_percentage: f64,
    pub shared_features: Vec<String>,
}

#[async_trait]
pub trait AiReasoner: Send + Sync {
    fn model_label(&self) -> String;

    /// Cheap reachability check, run once per analysis.
    async fn is_available(&self) -> bool;

    /// Raw model output for the pair; parsed by the engine.
    async fn judge(&self, context: &PairContext<'_>) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[derive(Debug, Default)]
pub struct RecommendationOutcome {
    pub recommendations: Vec<ConsolidationRecommendation>,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct RecommendationEngine {
    reasoner: Option<Arc<dyn AiReasoner>>,
    results: Arc<dyn ResultStore>,
}

impl RecommendationEngine {
    pub fn new(reasoner: Option<Arc<dyn AiReasoner>>, results: Arc<dyn ResultStore>) -> Self {
        Self { reasoner, results }
    }

    /// Generates one recommendation per pair above [`HIGH_OVERLAP_THRESHOLD`], in input order,
    /// then replaces the portfolio's stored recommendations. Nothing is stored when the job is
    /// cancelled first.
    pub async fn recommend(
        &self,
        portfolio_id: Uuid,
        pairs: &[PairOverlap],
        features: &HashMap<Uuid, SoftwareFeatures>,
        progress: &JobProgress,
    ) -> std::result::Result<RecommendationOutcome, Cancelled> {
        let started = Instant::now();
        let candidates: Vec<&PairOverlap> = pairs
            .iter()
            .filter(|pair| pair.overlap_percentage > HIGH_OVERLAP_THRESHOLD)
            .collect();
        let mut outcome = RecommendationOutcome::default();

        let reasoner = match (&self.reasoner, candidates.is_empty()) {
            (Some(reasoner), false) => {
                if reasoner.is_available().await {
                    Some(reasoner.clone())
                } else {
                    let warning = format!(
                        "AI reasoning service ({}) unavailable; using rule-based recommendations",
                        reasoner.model_label()
                    );
                    tracing::warn!(portfolio_id = %portfolio_id, "{warning}");
                    progress.activity(&warning, ActivityKind::Warning).await;
                    outcome.warnings.push(warning);
                    None
                }
            }
            _ => None,
        };

        tracing::info!(
            portfolio_id = %portfolio_id,
            pairs = candidates.len(),
            mode = if reasoner.is_some() { "ai" } else { "rule_based" },
            "generating consolidation recommendations"
        );

        let total = candidates.len();
        for (idx, pair) in candidates.into_iter().enumerate() {
            if progress.is_cancelled().await {
                return Err(Cancelled);
            }

            let (Some(first), Some(second)) = (
                features.get(&pair.software_a.id),
                features.get(&pair.software_b.id),
            ) else {
                let warning = format!(
                    "skipped recommendation for {} vs {}: feature data missing",
                    pair.software_a.name, pair.software_b.name
                );
                tracing::warn!(portfolio_id = %portfolio_id, "{warning}");
                outcome.warnings.push(warning);
                continue;
            };

            let recommendation = match &reasoner {
                Some(reasoner) => match ai_recommendation(reasoner.as_ref(), pair, first, second)
                    .await
                {
                    Ok(recommendation) => recommendation,
                    Err(err) => {
                        let warning = format!(
                            "AI recommendation for {} vs {} failed ({err:#}); used rule-based fallback",
                            first.record.name, second.record.name
                        );
                        tracing::warn!(portfolio_id = %portfolio_id, error = %err, "AI recommendation failed");
                        outcome.warnings.push(warning);
                        rule_based_recommendation(pair, first, second)
                    }
                },
                None => rule_based_recommendation(pair, first, second),
            };
            outcome.recommendations.push(recommendation);

            let done = idx + 1;
            progress
                .update(
                    "Generating recommendations",
                    PROGRESS_START + (PROGRESS_END - PROGRESS_START) * done as f64 / total as f64,
                    &format!("Generated recommendation {done} of {total}"),
                    ProgressExtra {
                        recommendations: Some(outcome.recommendations.len()),
                        ..Default::default()
                    },
                )
                .await;
        }

        if progress.is_cancelled().await {
            return Err(Cancelled);
        }

        self.persist(portfolio_id, &mut outcome).await;

        tracing::info!(
            portfolio_id = %portfolio_id,
            recommendations = outcome.recommendations.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "consolidation recommendations generated"
        );
        Ok(outcome)
    }

    async fn persist(&self, portfolio_id: Uuid, outcome: &mut RecommendationOutcome) {
        if let Err(err) = self.results.clear_recommendations(portfolio_id).await {
            tracing::warn!(portfolio_id = %portfolio_id, error = %err, "failed to clear stored recommendations");
            outcome
                .warnings
                .push(format!("failed to clear stored recommendations: {err:#}"));
        }

        let mut failures = 0usize;
        let mut last_error = None;
        for recommendation in outcome.recommendations.iter_mut() {
            match self
                .results
                .save_recommendation(portfolio_id, recommendation)
                .await
            {
                Ok(id) => recommendation.id = Some(id),
                Err(err) => {
                    failures += 1;
                    last_error = Some(err);
                }
            }
        }
        if let Some(err) = last_error {
            tracing::warn!(
                portfolio_id = %portfolio_id,
                failures,
                error = %err,
                "failed to store recommendations"
            );
            outcome.warnings.push(format!(
                "failed to store {failures} recommendation(s): {err:#}"
            ));
        }
    }
}

async fn ai_recommendation(
    reasoner: &dyn AiReasoner,
    pair: &PairOverlap,
    first: &SoftwareFeatures,
    second: &SoftwareFeatures,
) -> Result<ConsolidationRecommendation> {
    let context = PairContext {
        first,
        second,
        overlap_percentage: pair.overlap_percentage,
        shared_features: pair.shared_feature_names(),
    };
    let reply = reasoner.judge(&context).await.context("AI request failed")?;
    let judgment = parse_ai_judgment(&reply)?;

    let (keeper, removed) = if judgment.keep_first {
        (first, second)
    } else {
        (second, first)
    };
    let mut recommendation = base_recommendation(pair, keeper, removed);
    if let Some(covered) = judgment.features_covered {
        recommendation.features_covered = covered;
    }
    if let Some(at_risk) = judgment.features_at_risk {
        recommendation.features_at_risk = at_risk;
    }
    recommendation.migration_effort = judgment.migration_effort;
    recommendation.business_risk = judgment.business_risk;
    recommendation.confidence_score = judgment.confidence_score;
    recommendation.rationale = judgment.reasoning;
    recommendation.source = RecommendationSource::Ai;
    recommendation.model = Some(reasoner.model_label());
    Ok(recommendation)
}

/// Features a product was actually tagged with. The coarse-category stand-in counts as none.
fn tagged_count(item: &SoftwareFeatures) -> usize {
    if item.degraded {
        0
    } else {
        item.features.len()
    }
}

/// Deterministic choice: more tagged features wins, then lower annual cost, then the lower id.
pub fn rule_based_recommendation(
    pair: &PairOverlap,
    a: &SoftwareFeatures,
    b: &SoftwareFeatures,
) -> ConsolidationRecommendation {
    let by_features = tagged_count(a).cmp(&tagged_count(b));
    let keep_a = match by_features {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => match a.record.annual_cost.partial_cmp(&b.record.annual_cost) {
            Some(Ordering::Less) => true,
            Some(Ordering::Greater) => false,
            _ => a.record.id < b.record.id,
        },
    };
    let (keeper, removed) = if keep_a { (a, b) } else { (b, a) };

    let rationale = if by_features != Ordering::Equal {
        format!(
            "{} has more comprehensive features ({} vs {}). Consolidating to the more feature-rich solution will reduce complexity.",
            keeper.record.name,
            tagged_count(keeper),
            tagged_count(removed)
        )
    } else if keeper.record.annual_cost < removed.record.annual_cost {
        format!(
            "{} is more cost-effective (${:.0} vs ${:.0}) with similar feature coverage.",
            keeper.record.name, keeper.record.annual_cost, removed.record.annual_cost
        )
    } else {
        format!(
            "{} and {} have equivalent feature coverage and cost; {} is kept as the stable default.",
            keeper.record.name, removed.record.name, keeper.record.name
        )
    };

    let mut recommendation = base_recommendation(pair, keeper, removed);
    recommendation.rationale = rationale;
    recommendation
}

fn base_recommendation(
    pair: &PairOverlap,
    keeper: &SoftwareFeatures,
    removed: &SoftwareFeatures,
) -> ConsolidationRecommendation {
    ConsolidationRecommendation {
        id: None,
        keep: keeper.record.summary(),
        remove: vec![removed.record.summary()],
        annual_savings: removed.record.annual_cost,
        features_covered: pair.shared_feature_names(),
        features_at_risk: features_at_risk(&keeper.features, &removed.features),
        migration_effort: Level::Medium,
        business_risk: Level::Medium,
        confidence_score: RULE_BASED_CONFIDENCE,
        rationale: String::new(),
        source: RecommendationSource::RuleBased,
        model: None,
        overlap_percentage: pair.overlap_percentage,
        status: RecommendationStatus::Pending,
    }
}

/// Names of `removed` features the kept product lacks.
fn features_at_risk(kept: &[Feature], removed: &[Feature]) -> Vec<String> {
    let kept: HashSet<String> = kept.iter().map(Feature::key).collect();
    removed
        .iter()
        .filter(|feature| !kept.contains(&feature.key()))
        .map(|feature| feature.name.clone())
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct AiJudgment {
    pub keep_first: bool,
    pub reasoning: String,
    pub features_covered: Option<Vec<String>>,
    pub features_at_risk: Option<Vec<String>>,
    pub migration_effort: Level,
    pub business_risk: Level,
    pub confidence_score: f64,
}

#[derive(Deserialize)]
struct RawJudgment {
    keep_software: Option<Value>,
    reasoning: Option<String>,
    features_covered: Option<Vec<String>>,
    features_at_risk: Option<Vec<String>>,
    migration_effort: Option<String>,
    business_risk: Option<String>,
    confidence_score: Option<f64>,
}

/// Text from the first `{` through the last `}`.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

pub fn parse_ai_judgment(text: &str) -> Result<AiJudgment> {
    let json = extract_json_object(text).context("no JSON object in AI response")?;
    let raw: RawJudgment =
        serde_json::from_str(json).context("AI response is not a valid judgment object")?;

    let keep_first = match raw.keep_software.as_ref().and_then(keep_choice) {
        Some(1) => true,
        Some(2) => false,
        _ => anyhow::bail!("AI response has no valid keep_software (expected 1 or 2)"),
    };
    let reasoning = raw
        .reasoning
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .context("AI response has no reasoning")?;
    let confidence_score = raw
        .confidence_score
        .filter(|value| value.is_finite())
        .map(|value| value.clamp(0.0, 1.0))
        .unwrap_or(DEFAULT_AI_CONFIDENCE);

    Ok(AiJudgment {
        keep_first,
        reasoning,
        features_covered: raw.features_covered,
        features_at_risk: raw.features_at_risk,
        migration_effort: raw
            .migration_effort
            .as_deref()
            .and_then(Level::parse)
            .unwrap_or(Level::Medium),
        business_risk: raw
            .business_risk
            .as_deref()
            .and_then(Level::parse)
            .unwrap_or(Level::Medium),
        confidence_score,
    })
}

fn keep_choice(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| v.fract() == 0.0).map(|v| v as u64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
