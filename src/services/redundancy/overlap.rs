//! Pairwise and per-category feature overlap across a software portfolio.

use super::progress::JobProgress;
use super::recommend::{Cancelled, RecommendationEngine};
use super::sources::{FeatureCatalog, PortfolioStore, ResultStore};
use super::types::{
    ActivityKind, AnalysisJobError, AnalysisResult, CategoryOverlap,
    Feature, FeatureCategory, Level, PairOverlap, ProgressExtra, SoftwareFeatures,
    SoftwareRecord, SoftwareSummary,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Pairs at or below this overlap are not materialized.
pub const MIN_OVERLAP_PERCENTAGE: f64 = 20.0;
/// Share of a category's summed cost assumed to be redundant.
pub const CATEGORY_REDUNDANCY_RATE: f64 = 0.3;
pub const HIGH_PRIORITY_COST: f64 = 50_000.0;
pub const MEDIUM_PRIORITY_COST: f64 = 20_000.0;

pub const LOAD_FAILURE: &str = "load_failure";

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisFailure {
    Cancelled,
    Failed(AnalysisJobError),
}

#[derive(Debug, Clone, Copy)]
pub struct AnalyzerOptions {
    /// Units of work (records or pairs) between progress writes.
    pub checkpoint_every: usize,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            checkpoint_every: 10,
        }
    }
}

pub struct OverlapAnalyzer {
    portfolio: Arc<dyn PortfolioStore>,
    catalog: Arc<dyn FeatureCatalog>,
    results: Arc<dyn ResultStore>,
    recommender: RecommendationEngine,
    options: AnalyzerOptions,
}

impl OverlapAnalyzer {
    pub fn new(
        portfolio: Arc<dyn PortfolioStore>,
        catalog: Arc<dyn FeatureCatalog>,
        results: Arc<dyn ResultStore>,
        recommender: RecommendationEngine,
        options: AnalyzerOptions,
    ) -> Self {
        Self {
            portfolio,
            catalog,
            results,
            recommender,
            options: AnalyzerOptions {
                checkpoint_every: options.checkpoint_every.max(1),
            },
        }
    }

    pub fn results(&self) -> Arc<dyn ResultStore> {
        self.results.clone()
    }

    /// Runs the full analysis for a portfolio. An empty `selected` list means the whole
    /// portfolio. Comparison matrix, category overlaps and recommendations are only stored once
    /// every cancellation check has passed.
    pub async fn analyze(
        &self,
        portfolio_id: Uuid,
        selected: Option<&[Uuid]>,
        progress: &JobProgress,
    ) -> Result<AnalysisResult, AnalysisFailure> {
        let started = Instant::now();
        let selected = selected.filter(|ids| !ids.is_empty());
        let every = self.options.checkpoint_every;

        check_cancelled(progress).await?;
        let records = self
            .portfolio
            .list_active_software(portfolio_id, selected)
            .await
            .map_err(|err| load_failure(portfolio_id, "failed to load portfolio software", err))?;
        let total = records.len();
        progress
            .update(
                "Loading software",
                5.0,
                &format!("Found {total} active software products"),
                ProgressExtra {
                    total_software: Some(total),
                    ..Default::default()
                },
            )
            .await;

        if total < 2 {
            tracing::info!(
                portfolio_id = %portfolio_id,
                software = total,
                "fewer than two active products; nothing to compare"
            );
            progress
                .activity(
                    "Fewer than two active software products; nothing to compare",
                    ActivityKind::Info,
                )
                .await;
            return Ok(AnalysisResult::empty(portfolio_id, total));
        }

        let mut software = Vec::with_capacity(total);
        let mut degraded = Vec::new();
        for (idx, record) in records.into_iter().enumerate() {
            check_cancelled(progress).await?;
            let raw = self.catalog.get_features(record.id).await.map_err(|err| {
                load_failure(
                    portfolio_id,
                    &format!("failed to load features for {}", record.name),
                    err,
                )
            })?;
            let resolved = resolve_features(record, raw);
            if resolved.degraded {
                degraded.push(resolved.record.id);
                progress
                    .activity(
                        &format!(
                            "{} has no tagged features; using its category \"{}\" instead",
                            resolved.record.name, resolved.record.category
                        ),
                        ActivityKind::Warning,
                    )
                    .await;
            }
            software.push(resolved);

            let done = idx + 1;
            if done % every == 0 || done == total {
                progress
                    .update(
                        "Loading features",
                        5.0 + 30.0 * done as f64 / total as f64,
                        &format!("Loaded features for {done} of {total} products"),
                        ProgressExtra {
                            processed_software: Some(done),
                            degraded_software: Some(degraded.len()),
                            ..Default::default()
                        },
                    )
                    .await;
            }
        }

        let total_pairs = total * (total - 1) / 2;
        let mut matrix = Vec::new();
        let mut compared = 0usize;
        for i in 0..total {
            for j in (i + 1)..total {
                check_cancelled(progress).await?;
                if let Some(overlap) = compare_pair(&software[i], &software[j]) {
                    matrix.push(overlap);
                }
                compared += 1;
                if compared % every == 0 || compared == total_pairs {
                    progress
                        .update(
                            "Comparing software",
                            35.0 + 45.0 * compared as f64 / total_pairs as f64,
                            &format!("Compared {compared} of {total_pairs} pairs"),
                            ProgressExtra {
                                pairs_compared: Some(compared),
                                total_pairs: Some(total_pairs),
                                overlaps_found: Some(matrix.len()),
                                ..Default::default()
                            },
                        )
                        .await;
                }
            }
        }

        check_cancelled(progress).await?;
        let overlaps = build_category_overlaps(&software, &matrix);
        let total_redundancy_cost = total_redundancy_cost(&matrix);
        progress
            .update(
                "Categorizing overlaps",
                85.0,
                &format!(
                    "Found {} overlapping pairs across {} categories",
                    matrix.len(),
                    overlaps.len()
                ),
                ProgressExtra {
                    overlaps_found: Some(matrix.len()),
                    ..Default::default()
                },
            )
            .await;

        let by_id: HashMap<Uuid, SoftwareFeatures> = software
            .into_iter()
            .map(|item| (item.record.id, item))
            .collect();
        let outcome = self
            .recommender
            .recommend(portfolio_id, &matrix, &by_id, progress)
            .await
            .map_err(|Cancelled| AnalysisFailure::Cancelled)?;
        progress
            .update(
                "Generating recommendations",
                95.0,
                &format!(
                    "Generated {} consolidation recommendations",
                    outcome.recommendations.len()
                ),
                ProgressExtra {
                    recommendations: Some(outcome.recommendations.len()),
                    ..Default::default()
                },
            )
            .await;

        let mut warnings = outcome.warnings;
        if let Err(err) = self
            .results
            .save_comparison_matrix(portfolio_id, &matrix)
            .await
        {
            tracing::warn!(portfolio_id = %portfolio_id, error = %err, "failed to store comparison matrix");
            warnings.push(format!("failed to store comparison matrix: {err:#}"));
        }
        if let Err(err) = self
            .results
            .save_category_overlaps(portfolio_id, &overlaps)
            .await
        {
            tracing::warn!(portfolio_id = %portfolio_id, error = %err, "failed to store category overlaps");
            warnings.push(format!("failed to store category overlaps: {err:#}"));
        }
        for warning in warnings.iter().filter(|w| w.starts_with("failed to store")) {
            progress.activity(warning, ActivityKind::Warning).await;
        }
        progress
            .update(
                "Saving results",
                98.0,
                "Analysis results saved",
                ProgressExtra::default(),
            )
            .await;

        tracing::info!(
            portfolio_id = %portfolio_id,
            software = total,
            overlaps = matrix.len(),
            categories = overlaps.len(),
            recommendations = outcome.recommendations.len(),
            degraded = degraded.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "redundancy analysis finished"
        );

        Ok(AnalysisResult {
            portfolio_id,
            overlaps,
            comparison_matrix: matrix,
            recommendations: outcome.recommendations,
            total_redundancy_cost,
            software_analyzed: total,
            degraded_software: degraded,
            warnings,
            analysis_date: Utc::now(),
        })
    }
}

async fn check_cancelled(progress: &JobProgress) -> Result<(), AnalysisFailure> {
    if progress.is_cancelled().await {
        tracing::info!(
            portfolio_id = %progress.portfolio_id(),
            job_id = %progress.job_id(),
            "cancellation observed"
        );
        return Err(AnalysisFailure::Cancelled);
    }
    Ok(())
}

fn load_failure(portfolio_id: Uuid, context: &str, err: anyhow::Error) -> AnalysisFailure {
    tracing::error!(portfolio_id = %portfolio_id, error = %err, "{context}");
    AnalysisFailure::Failed(AnalysisJobError {
        code: LOAD_FAILURE.to_string(),
        message: format!("{context}: {err:#}"),
    })
}

/// De-duplicates tagged features by key. A record without features stands in with a single
/// feature named after its coarse category.
pub fn resolve_features(record: SoftwareRecord, raw: Vec<Feature>) -> SoftwareFeatures {
    let mut seen = HashSet::new();
    let mut features = Vec::with_capacity(raw.len());
    for feature in raw {
        let name = feature.name.trim();
        if name.is_empty() {
            continue;
        }
        let feature = Feature::new(feature.category, name);
        if seen.insert(feature.key()) {
            features.push(feature);
        }
    }

    let degraded = features.is_empty();
    if degraded {
        features.push(Feature::new(
            FeatureCategory::from_label(&record.category),
            record.category.clone(),
        ));
    }
    SoftwareFeatures {
        record,
        features,
        degraded,
    }
}

/// Overlap of two products, whether or not it clears [`MIN_OVERLAP_PERCENTAGE`].
pub fn pair_overlap(a: &SoftwareFeatures, b: &SoftwareFeatures) -> PairOverlap {
    let keys_b: HashSet<String> = b.features.iter().map(Feature::key).collect();
    let shared_features: Vec<Feature> = a
        .features
        .iter()
        .filter(|feature| keys_b.contains(&feature.key()))
        .cloned()
        .collect();
    let features_compared = a.features.len().max(b.features.len());
    let overlap_percentage = if features_compared == 0 {
        0.0
    } else {
        shared_features.len() as f64 / features_compared as f64 * 100.0
    };
    let cost_implication =
        overlap_percentage / 100.0 * a.record.annual_cost.min(b.record.annual_cost);

    PairOverlap {
        software_a: a.record.summary(),
        software_b: b.record.summary(),
        shared_features,
        features_compared,
        overlap_percentage,
        cost_implication,
    }
}

pub fn compare_pair(a: &SoftwareFeatures, b: &SoftwareFeatures) -> Option<PairOverlap> {
    let overlap = pair_overlap(a, b);
    (overlap.overlap_percentage > MIN_OVERLAP_PERCENTAGE).then_some(overlap)
}

pub fn total_redundancy_cost(matrix: &[PairOverlap]) -> f64 {
    matrix.iter().map(|pair| pair.cost_implication).sum()
}

pub fn priority_for(redundancy_cost: f64) -> Level {
    if redundancy_cost > HIGH_PRIORITY_COST {
        Level::High
    } else if redundancy_cost > MEDIUM_PRIORITY_COST {
        Level::Medium
    } else {
        Level::Low
    }
}

/// Features of untagged products whose coarse category maps to `Other` are grouped by that
/// raw label, so unrelated untagged products never share a group.
type GroupKey = (FeatureCategory, Option<String>);

struct CategoryGroup<'a> {
    label: String,
    software: Vec<&'a SoftwareRecord>,
    members: HashSet<Uuid>,
    features: Vec<String>,
    feature_names: HashSet<String>,
}

fn group_key(feature: &Feature, fallback_keys: &HashSet<String>) -> GroupKey {
    if feature.category == FeatureCategory::Other && fallback_keys.contains(&feature.key()) {
        (feature.category, Some(feature.name.trim().to_lowercase()))
    } else {
        (feature.category, None)
    }
}

/// Groups products by feature category, keeping groups with at least two contributors.
/// Sorted by `redundancy_cost` descending, then by label.
pub fn build_category_overlaps(
    software: &[SoftwareFeatures],
    matrix: &[PairOverlap],
) -> Vec<CategoryOverlap> {
    let fallback_keys: HashSet<String> = software
        .iter()
        .filter(|item| item.degraded)
        .flat_map(|item| item.features.iter().map(Feature::key))
        .collect();

    let mut groups: BTreeMap<GroupKey, CategoryGroup<'_>> = BTreeMap::new();
    for item in software {
        for feature in &item.features {
            let key = group_key(feature, &fallback_keys);
            let group = groups.entry(key.clone()).or_insert_with(|| CategoryGroup {
                label: match key.1 {
                    Some(_) => feature.name.trim().to_string(),
                    None => feature.category.as_str().to_string(),
                },
                software: Vec::new(),
                members: HashSet::new(),
                features: Vec::new(),
                feature_names: HashSet::new(),
            });
            if group.members.insert(item.record.id) {
                group.software.push(&item.record);
            }
            if group.feature_names.insert(feature.name.to_lowercase()) {
                group.features.push(feature.name.clone());
            }
        }
    }

    let mut measured: HashMap<GroupKey, f64> = HashMap::new();
    for pair in matrix {
        let shared = pair.shared_features.len();
        if shared == 0 {
            continue;
        }
        let mut counts: BTreeMap<GroupKey, usize> = BTreeMap::new();
        for feature in &pair.shared_features {
            *counts.entry(group_key(feature, &fallback_keys)).or_insert(0) += 1;
        }
        for (key, count) in counts {
            *measured.entry(key).or_insert(0.0) +=
                pair.cost_implication * count as f64 / shared as f64;
        }
    }

    let mut overlaps: Vec<CategoryOverlap> = groups
        .into_iter()
        .filter(|(_, group)| group.software.len() >= 2)
        .map(|(key, group)| {
            let summed: f64 = group.software.iter().map(|sw| sw.annual_cost).sum();
            let redundancy_cost = summed * CATEGORY_REDUNDANCY_RATE;
            CategoryOverlap {
                category: key.0,
                label: group.label,
                overlap_count: group.software.len(),
                software: group
                    .software
                    .iter()
                    .map(|record| record.summary())
                    .collect::<Vec<SoftwareSummary>>(),
                features: group.features,
                redundancy_cost,
                measured_redundancy_cost: measured.get(&key).copied().unwrap_or(0.0),
                priority: priority_for(redundancy_cost),
            }
        })
        .collect();

    overlaps.sort_by(|a, b| {
        b.redundancy_cost
            .total_cmp(&a.redundancy_cost)
            .then_with(|| a.label.cmp(&b.label))
    });
    overlaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::redundancy::progress::{ProgressTracker, RetentionPolicy};
    use crate::services::redundancy::types::{AnalysisJobStatus, RecommendationSource};
    use crate::test_support::{fake_analyzer, features, FakePortfolio, ScriptedReasoner};

    fn record(name: &str, cost: f64, category: &str) -> SoftwareRecord {
        SoftwareRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            vendor: "Vendor".to_string(),
            category: category.to_string(),
            annual_cost: cost,
        }
    }

    fn resolved(name: &str, cost: f64, tagged: Vec<Feature>) -> SoftwareFeatures {
        resolve_features(record(name, cost, "Communication"), tagged)
    }

    async fn job() -> (Arc<ProgressTracker>, JobProgress) {
        let tracker = Arc::new(ProgressTracker::in_memory(RetentionPolicy::default()));
        let handle = tracker.start(Uuid::new_v4(), 0).await.unwrap();
        (tracker, handle)
    }

    #[test]
    fn disjoint_features_do_not_overlap() {
        let a = resolved("A", 100.0, features(FeatureCategory::Communication, &["chat"]));
        let b = resolved("B", 100.0, features(FeatureCategory::Communication, &["video"]));
        assert_eq!(pair_overlap(&a, &b).overlap_percentage, 0.0);
        assert!(compare_pair(&a, &b).is_none());
    }

    #[test]
    fn identical_features_overlap_fully() {
        let a = resolved("A", 300.0, features(FeatureCategory::Communication, &["Chat", "Video"]));
        let b = resolved("B", 120.0, features(FeatureCategory::Communication, &["video", "chat"]));
        let overlap = compare_pair(&a, &b).unwrap();
        assert_eq!(overlap.overlap_percentage, 100.0);
        assert_eq!(overlap.cost_implication, 120.0);
        assert_eq!(overlap.features_compared, 2);
        assert_eq!(overlap.shared_feature_names(), vec!["Chat", "Video"]);
    }

    #[test]
    fn overlap_of_exactly_twenty_percent_is_not_materialized() {
        let a = resolved(
            "A",
            100.0,
            features(FeatureCategory::Communication, &["a", "b", "c", "d", "e"]),
        );
        let b = resolved("B", 100.0, features(FeatureCategory::Communication, &["a", "z"]));
        assert_eq!(pair_overlap(&a, &b).overlap_percentage, 20.0);
        assert!(compare_pair(&a, &b).is_none());
    }

    #[test]
    fn same_name_in_different_categories_is_not_shared() {
        let a = resolved("A", 100.0, features(FeatureCategory::Communication, &["search"]));
        let b = resolved("B", 100.0, features(FeatureCategory::SearchFilter, &["search"]));
        assert_eq!(pair_overlap(&a, &b).overlap_percentage, 0.0);
    }

    #[test]
    fn resolve_deduplicates_and_falls_back_to_category() {
        let mut tagged = features(FeatureCategory::Communication, &["Chat", "chat ", "Video"]);
        tagged.push(Feature::new(FeatureCategory::Communication, "  "));
        let item = resolved("A", 1.0, tagged);
        assert!(!item.degraded);
        assert_eq!(item.features.len(), 2);

        let item = resolve_features(record("B", 1.0, "Mystery Tools"), Vec::new());
        assert!(item.degraded);
        assert_eq!(item.features.len(), 1);
        assert_eq!(item.features[0].name, "Mystery Tools");
        assert_eq!(item.features[0].category, FeatureCategory::Other);

        let item = resolve_features(record("C", 1.0, "communication"), Vec::new());
        assert_eq!(item.features[0].category, FeatureCategory::Communication);
    }

    #[test]
    fn priority_thresholds() {
        assert_eq!(priority_for(50_000.01), Level::High);
        assert_eq!(priority_for(50_000.0), Level::Medium);
        assert_eq!(priority_for(20_000.01), Level::Medium);
        assert_eq!(priority_for(20_000.0), Level::Low);
    }

    #[test]
    fn category_groups_need_two_products_and_sort_by_cost() {
        let mut a_features = features(FeatureCategory::Communication, &["chat"]);
        a_features.extend(features(FeatureCategory::Templates, &["Templates"]));
        let a = resolved("A", 100_000.0, a_features);
        let b = resolved("B", 200_000.0, features(FeatureCategory::Communication, &["Chat", "video"]));
        let mut c_features = features(FeatureCategory::Templates, &["templates"]);
        c_features.extend(features(FeatureCategory::TimeTracking, &["timer"]));
        let c = resolved("C", 10_000.0, c_features);
        let software = vec![a, b, c];

        let overlaps = build_category_overlaps(&software, &[]);
        assert_eq!(overlaps.len(), 2);
        assert_eq!(overlaps[0].category, FeatureCategory::Communication);
        assert_eq!(overlaps[0].overlap_count, 2);
        assert!((overlaps[0].redundancy_cost - 90_000.0).abs() < 1e-6);
        assert_eq!(overlaps[0].priority, Level::High);
        assert_eq!(overlaps[0].features, vec!["chat", "video"]);
        assert_eq!(overlaps[1].category, FeatureCategory::Templates);
        assert!((overlaps[1].redundancy_cost - 33_000.0).abs() < 1e-6);
        assert_eq!(overlaps[1].priority, Level::Medium);
        assert_eq!(overlaps[1].features, vec!["Templates"]);
    }

    #[test]
    fn untagged_products_with_unrelated_categories_stay_apart() {
        let jira = resolve_features(record("Jira", 100_000.0, "Project Management"), Vec::new());
        let tableau = resolve_features(
            record("Tableau", 200_000.0, "Business Intelligence"),
            Vec::new(),
        );
        assert!(jira.degraded && tableau.degraded);
        assert_eq!(jira.features[0].category, FeatureCategory::Other);
        assert_eq!(tableau.features[0].category, FeatureCategory::Other);

        let software = vec![jira, tableau];
        assert!(compare_pair(&software[0], &software[1]).is_none());
        assert!(build_category_overlaps(&software, &[]).is_empty());
    }

    #[test]
    fn untagged_products_sharing_a_category_label_are_grouped() {
        let jira = resolve_features(record("Jira", 100_000.0, "Project Management"), Vec::new());
        let asana = resolve_features(record("Asana", 50_000.0, "project management"), Vec::new());
        let tableau = resolve_features(
            record("Tableau", 200_000.0, "Business Intelligence"),
            Vec::new(),
        );
        let software = vec![jira, asana, tableau];
        let matrix: Vec<PairOverlap> = compare_pair(&software[0], &software[1])
            .into_iter()
            .collect();
        assert_eq!(matrix.len(), 1);

        let overlaps = build_category_overlaps(&software, &matrix);
        assert_eq!(overlaps.len(), 1);
        assert_eq!(overlaps[0].category, FeatureCategory::Other);
        assert_eq!(overlaps[0].label, "Project Management");
        assert_eq!(overlaps[0].overlap_count, 2);
        assert!((overlaps[0].redundancy_cost - 45_000.0).abs() < 1e-6);
        assert!((overlaps[0].measured_redundancy_cost - 50_000.0).abs() < 1e-6);
    }

    #[test]
    fn measured_category_cost_sums_to_total() {
        let mut a_features = features(FeatureCategory::Communication, &["chat", "video"]);
        a_features.extend(features(FeatureCategory::Templates, &["templates"]));
        let a = resolved("A", 90_000.0, a_features.clone());
        let b = resolved("B", 60_000.0, a_features);
        let c = resolved("C", 30_000.0, features(FeatureCategory::Communication, &["chat", "video"]));
        let software = vec![a, b, c];
        let mut matrix = Vec::new();
        for i in 0..software.len() {
            for j in (i + 1)..software.len() {
                matrix.extend(compare_pair(&software[i], &software[j]));
            }
        }

        let overlaps = build_category_overlaps(&software, &matrix);
        let measured: f64 = overlaps.iter().map(|o| o.measured_redundancy_cost).sum();
        let total = total_redundancy_cost(&matrix);
        assert!((measured - total).abs() < 1e-6);
        let templates = overlaps
            .iter()
            .find(|o| o.category == FeatureCategory::Templates)
            .unwrap();
        assert!((templates.measured_redundancy_cost - 20_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn scenario_bundled_suite_replaces_paid_chat_tool() {
        let fake = Arc::new(FakePortfolio::new());
        let slack = fake.add_software(
            "Slack",
            720_000.0,
            features(FeatureCategory::Communication, &["chat", "video"]),
        );
        let teams = fake.add_software(
            "Teams",
            0.0,
            features(FeatureCategory::Communication, &["chat", "video", "files"]),
        );
        let analyzer = fake_analyzer(&fake, None);
        let (_tracker, handle) = job().await;

        let result = analyzer
            .analyze(fake.portfolio_id(), None, &handle)
            .await
            .unwrap();
        assert_eq!(result.software_analyzed, 2);
        assert_eq!(result.comparison_matrix.len(), 1);
        let pair = &result.comparison_matrix[0];
        assert!((pair.overlap_percentage - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(pair.cost_implication, 0.0);
        assert_eq!(result.total_redundancy_cost, 0.0);

        assert_eq!(result.recommendations.len(), 1);
        let rec = &result.recommendations[0];
        assert_eq!(rec.keep.id, teams.id);
        assert_eq!(rec.remove[0].id, slack.id);
        assert_eq!(rec.annual_savings, 720_000.0);
        assert_eq!(rec.source, RecommendationSource::RuleBased);

        assert_eq!(fake.saved_matrix().unwrap().len(), 1);
        assert_eq!(fake.saved_category_overlaps().unwrap().len(), 1);
        assert_eq!(fake.saved_recommendations().len(), 1);
    }

    #[tokio::test]
    async fn scenario_disjoint_portfolio_has_no_redundancy() {
        let fake = Arc::new(FakePortfolio::new());
        fake.add_software("A", 10_000.0, features(FeatureCategory::Communication, &["chat"]));
        fake.add_software("B", 20_000.0, features(FeatureCategory::TimeTracking, &["timer"]));
        fake.add_software("C", 30_000.0, features(FeatureCategory::CrmFeatures, &["leads"]));
        let analyzer = fake_analyzer(&fake, None);
        let (_tracker, handle) = job().await;

        let result = analyzer
            .analyze(fake.portfolio_id(), None, &handle)
            .await
            .unwrap();
        assert!(result.comparison_matrix.is_empty());
        assert!(result.overlaps.is_empty());
        assert!(result.recommendations.is_empty());
        assert_eq!(result.total_redundancy_cost, 0.0);
        assert!(result.degraded_software.is_empty());
    }

    #[tokio::test]
    async fn scenario_untagged_product_uses_its_category() {
        let fake = Arc::new(FakePortfolio::new());
        let untagged = fake.add_software("Legacy Chat", 40_000.0, Vec::new());
        let mut tagged = features(FeatureCategory::Communication, &["Communication"]);
        tagged.extend(features(FeatureCategory::Communication, &["video"]));
        fake.add_software("Suite", 50_000.0, tagged);
        let analyzer = fake_analyzer(&fake, None);
        let (tracker, handle) = job().await;

        let result = analyzer
            .analyze(fake.portfolio_id(), None, &handle)
            .await
            .unwrap();
        assert_eq!(result.degraded_software, vec![untagged.id]);
        assert_eq!(result.comparison_matrix.len(), 1);
        assert_eq!(result.comparison_matrix[0].overlap_percentage, 50.0);
        assert_eq!(result.comparison_matrix[0].cost_implication, 20_000.0);
        assert_eq!(result.overlaps.len(), 1);
        assert_eq!(result.overlaps[0].category, FeatureCategory::Communication);
        assert_eq!(result.overlaps[0].label, "Communication");

        let job = tracker
            .get_progress(handle.portfolio_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.counts.degraded_software, 1);
        assert_eq!(job.counts.processed_software, 2);
    }

    #[tokio::test]
    async fn single_product_is_empty_success() {
        let fake = Arc::new(FakePortfolio::new());
        fake.add_software("Only", 5_000.0, features(FeatureCategory::Communication, &["chat"]));
        let analyzer = fake_analyzer(&fake, None);
        let (_tracker, handle) = job().await;

        let result = analyzer
            .analyze(fake.portfolio_id(), None, &handle)
            .await
            .unwrap();
        assert_eq!(result.software_analyzed, 1);
        assert!(result.comparison_matrix.is_empty());
        assert_eq!(result.total_redundancy_cost, 0.0);
        assert!(fake.saved_matrix().is_none());
    }

    #[tokio::test]
    async fn total_cost_is_sum_of_pair_costs() {
        let fake = Arc::new(FakePortfolio::new());
        fake.add_software("A", 1_000.0, features(FeatureCategory::Communication, &["a", "b", "c"]));
        fake.add_software("B", 2_000.0, features(FeatureCategory::Communication, &["a", "b"]));
        fake.add_software("C", 4_000.0, features(FeatureCategory::Communication, &["a", "c", "d"]));
        let analyzer = fake_analyzer(&fake, None);
        let (_tracker, handle) = job().await;

        let result = analyzer
            .analyze(fake.portfolio_id(), None, &handle)
            .await
            .unwrap();
        assert_eq!(result.comparison_matrix.len(), 3);
        let expected: f64 = result
            .comparison_matrix
            .iter()
            .map(|pair| pair.cost_implication)
            .sum();
        assert_eq!(result.total_redundancy_cost, expected);
    }

    #[tokio::test]
    async fn empty_selection_means_whole_portfolio() {
        let fake = Arc::new(FakePortfolio::new());
        let a = fake.add_software("A", 1.0, features(FeatureCategory::Communication, &["chat"]));
        let b = fake.add_software("B", 1.0, features(FeatureCategory::Communication, &["chat"]));
        fake.add_software("C", 1.0, features(FeatureCategory::Communication, &["chat"]));
        let analyzer = fake_analyzer(&fake, None);

        let (_tracker, handle) = job().await;
        let all = analyzer
            .analyze(fake.portfolio_id(), Some(&[][..]), &handle)
            .await
            .unwrap();
        assert_eq!(all.software_analyzed, 3);

        let (_tracker, handle) = job().await;
        let some = analyzer
            .analyze(fake.portfolio_id(), Some(&[a.id, b.id][..]), &handle)
            .await
            .unwrap();
        assert_eq!(some.software_analyzed, 2);
        assert_eq!(some.comparison_matrix.len(), 1);
    }

    #[tokio::test]
    async fn repeated_runs_are_stable() {
        let fake = Arc::new(FakePortfolio::new());
        fake.add_software("A", 500.0, features(FeatureCategory::Communication, &["a", "b", "c"]));
        fake.add_software("B", 500.0, features(FeatureCategory::Communication, &["a", "b", "c"]));
        fake.add_software("C", 900.0, features(FeatureCategory::Communication, &["a", "b"]));
        let analyzer = fake_analyzer(&fake, None);

        let (_tracker, first_job) = job().await;
        let first = analyzer
            .analyze(fake.portfolio_id(), None, &first_job)
            .await
            .unwrap();
        let (_tracker, second_job) = job().await;
        let second = analyzer
            .analyze(fake.portfolio_id(), None, &second_job)
            .await
            .unwrap();

        assert_eq!(first.comparison_matrix, second.comparison_matrix);
        assert_eq!(first.overlaps, second.overlaps);
        let choices = |result: &AnalysisResult| {
            result
                .recommendations
                .iter()
                .map(|rec| (rec.keep.id, rec.remove[0].id, rec.annual_savings))
                .collect::<Vec<_>>()
        };
        assert_eq!(choices(&first), choices(&second));
    }

    #[tokio::test]
    async fn repeated_ai_runs_make_the_same_choice() {
        let fake = Arc::new(FakePortfolio::new());
        fake.add_software("A", 500.0, features(FeatureCategory::Communication, &["a", "b", "c"]));
        fake.add_software("B", 900.0, features(FeatureCategory::Communication, &["a", "b"]));
        let reply = r#"{"keep_software": 2, "reasoning": "B is the standard.", "confidence_score": 0.9}"#;
        let reasoner = Arc::new(ScriptedReasoner::new(true, vec![Ok(reply), Ok(reply)]));
        let analyzer = fake_analyzer(&fake, Some(reasoner.clone()));

        let (_tracker, first_job) = job().await;
        let first = analyzer
            .analyze(fake.portfolio_id(), None, &first_job)
            .await
            .unwrap();
        let (_tracker, second_job) = job().await;
        let second = analyzer
            .analyze(fake.portfolio_id(), None, &second_job)
            .await
            .unwrap();

        assert_eq!(reasoner.calls(), 2);
        assert_eq!(first.recommendations.len(), 1);
        assert!(first
            .recommendations
            .iter()
            .chain(&second.recommendations)
            .all(|rec| rec.source == RecommendationSource::Ai));
        let choices = |result: &AnalysisResult| {
            result
                .recommendations
                .iter()
                .map(|rec| (rec.keep.id, rec.remove[0].id, rec.annual_savings))
                .collect::<Vec<_>>()
        };
        assert_eq!(choices(&first), choices(&second));
        assert!(first.warnings.is_empty());
    }

    #[tokio::test]
    async fn cancellation_before_start_saves_nothing() {
        let fake = Arc::new(FakePortfolio::new());
        fake.add_software("A", 1.0, features(FeatureCategory::Communication, &["chat"]));
        fake.add_software("B", 1.0, features(FeatureCategory::Communication, &["chat"]));
        let analyzer = fake_analyzer(&fake, None);
        let (tracker, handle) = job().await;
        tracker
            .request_cancellation(handle.portfolio_id())
            .await
            .unwrap();

        let err = analyzer
            .analyze(fake.portfolio_id(), None, &handle)
            .await
            .unwrap_err();
        assert_eq!(err, AnalysisFailure::Cancelled);
        assert!(fake.saved_matrix().is_none());
        assert!(fake.saved_category_overlaps().is_none());
        assert_eq!(fake.clear_calls(), 0);
    }

    #[tokio::test]
    async fn load_errors_fail_the_analysis() {
        let fake = Arc::new(FakePortfolio::new());
        fake.add_software("A", 1.0, features(FeatureCategory::Communication, &["chat"]));
        fake.add_software("B", 1.0, features(FeatureCategory::Communication, &["chat"]));
        let analyzer = fake_analyzer(&fake, None);

        fake.fail_listing(true);
        let (_tracker, handle) = job().await;
        match analyzer.analyze(fake.portfolio_id(), None, &handle).await {
            Err(AnalysisFailure::Failed(err)) => assert_eq!(err.code, LOAD_FAILURE),
            other => panic!("unexpected outcome: {other:?}"),
        }

        fake.fail_listing(false);
        fake.fail_features(true);
        let (_tracker, handle) = job().await;
        match analyzer.analyze(fake.portfolio_id(), None, &handle).await {
            Err(AnalysisFailure::Failed(err)) => {
                assert_eq!(err.code, LOAD_FAILURE);
                assert!(err.message.contains("features"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn storage_failures_are_warnings() {
        let fake = Arc::new(FakePortfolio::new());
        fake.add_software("A", 100.0, features(FeatureCategory::Communication, &["chat"]));
        fake.add_software("B", 200.0, features(FeatureCategory::Communication, &["chat"]));
        fake.fail_saves(true);
        let analyzer = fake_analyzer(&fake, None);
        let (_tracker, handle) = job().await;

        let result = analyzer
            .analyze(fake.portfolio_id(), None, &handle)
            .await
            .unwrap();
        assert_eq!(result.comparison_matrix.len(), 1);
        assert_eq!(result.recommendations.len(), 1);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("comparison matrix")));
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("category overlaps")));
    }

    #[tokio::test]
    async fn progress_reaches_final_checkpoint() {
        let fake = Arc::new(FakePortfolio::new());
        for idx in 0..12 {
            fake.add_software(
                &format!("P{idx}"),
                100.0,
                features(FeatureCategory::Communication, &["chat", "video"]),
            );
        }
        let analyzer = fake_analyzer(&fake, None);
        let (tracker, handle) = job().await;
        analyzer
            .analyze(fake.portfolio_id(), None, &handle)
            .await
            .unwrap();

        let job = tracker
            .get_progress(handle.portfolio_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, AnalysisJobStatus::Running);
        assert_eq!(job.progress, 98.0);
        assert_eq!(job.counts.total_pairs, 66);
        assert_eq!(job.counts.pairs_compared, 66);
        assert_eq!(job.counts.overlaps_found, 66);
        assert_eq!(job.counts.recommendations, 66);
    }
}
