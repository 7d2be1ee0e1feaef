use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, utoipa::ToSchema,
)]
pub enum FeatureCategory {
    #[serde(rename = "Task Management")]
    TaskManagement,
    #[serde(rename = "Project Planning")]
    ProjectPlanning,
    #[serde(rename = "Calendar & Scheduling")]
    CalendarScheduling,
    #[serde(rename = "Workflow Automation")]
    WorkflowAutomation,
    #[serde(rename = "Customization")]
    Customization,
    #[serde(rename = "Document Management")]
    DocumentManagement,
    #[serde(rename = "Collaboration")]
    Collaboration,
    #[serde(rename = "Communication")]
    Communication,
    #[serde(rename = "Integration Hub")]
    IntegrationHub,
    #[serde(rename = "Mobile Access")]
    MobileAccess,
    #[serde(rename = "Reporting & Analytics")]
    ReportingAnalytics,
    #[serde(rename = "Templates")]
    Templates,
    #[serde(rename = "Search & Filter")]
    SearchFilter,
    #[serde(rename = "Notifications")]
    Notifications,
    #[serde(rename = "Time Tracking")]
    TimeTracking,
    #[serde(rename = "Budget & Finance")]
    BudgetFinance,
    #[serde(rename = "Resource Management")]
    ResourceManagement,
    #[serde(rename = "CRM Features")]
    CrmFeatures,
    #[serde(rename = "Video Conferencing")]
    VideoConferencing,
    #[serde(rename = "Security & Permissions")]
    SecurityPermissions,
    #[serde(rename = "Data Import/Export")]
    DataImportExport,
    #[serde(rename = "Other")]
    Other,
}

impl FeatureCategory {
    pub const ALL: [FeatureCategory; 22] = [
        FeatureCategory::TaskManagement,
        FeatureCategory::ProjectPlanning,
        FeatureCategory::CalendarScheduling,
        FeatureCategory::WorkflowAutomation,
        FeatureCategory::Customization,
        FeatureCategory::DocumentManagement,
        FeatureCategory::Collaboration,
        FeatureCategory::Communication,
        FeatureCategory::IntegrationHub,
        FeatureCategory::MobileAccess,
        FeatureCategory::ReportingAnalytics,
        FeatureCategory::Templates,
        FeatureCategory::SearchFilter,
        FeatureCategory::Notifications,
        FeatureCategory::TimeTracking,
        FeatureCategory::BudgetFinance,
        FeatureCategory::ResourceManagement,
        FeatureCategory::CrmFeatures,
        FeatureCategory::VideoConferencing,
        FeatureCategory::SecurityPermissions,
        FeatureCategory::DataImportExport,
        FeatureCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureCategory::TaskManagement => "Task Management",
            FeatureCategory::ProjectPlanning => "Project Planning",
            FeatureCategory::CalendarScheduling => "Calendar & Scheduling",
            FeatureCategory::WorkflowAutomation => "Workflow Automation",
            FeatureCategory::Customization => "Customization",
            FeatureCategory::DocumentManagement => "Document Management",
            FeatureCategory::Collaboration => "Collaboration",
            FeatureCategory::Communication => "Communication",
            FeatureCategory::IntegrationHub => "Integration Hub",
            FeatureCategory::MobileAccess => "Mobile Access",
            FeatureCategory::ReportingAnalytics => "Reporting & Analytics",
            FeatureCategory::Templates => "Templates",
            FeatureCategory::SearchFilter => "Search & Filter",
            FeatureCategory::Notifications => "Notifications",
            FeatureCategory::TimeTracking => "Time Tracking",
            FeatureCategory::BudgetFinance => "Budget & Finance",
            FeatureCategory::ResourceManagement => "Resource Management",
            FeatureCategory::CrmFeatures => "CRM Features",
            FeatureCategory::VideoConferencing => "Video Conferencing",
            FeatureCategory::SecurityPermissions => "Security & Permissions",
            FeatureCategory::DataImportExport => "Data Import/Export",
            FeatureCategory::Other => "Other",
        }
    }

    /// Case-insensitive lookup by display label. Unknown labels land in `Other`.
    pub fn from_label(label: &str) -> Self {
        let needle = label.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|category| category.as_str().eq_ignore_ascii_case(needle))
            .unwrap_or(FeatureCategory::Other)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct SoftwareRecord {
    pub id: Uuid,
    pub name: String,
    pub vendor: String,
    pub category: String,
    pub annual_cost: f64,
}

impl SoftwareRecord {
    pub fn summary(&self) -> SoftwareSummary {
        SoftwareSummary {
            id: self.id,
            name: self.name.clone(),
            vendor: self.vendor.clone(),
            annual_cost: self.annual_cost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct SoftwareSummary {
    pub id: Uuid,
    pub name: String,
    pub vendor: String,
    pub annual_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Feature {
    pub name: String,
    pub category: FeatureCategory,
}

impl Feature {
    pub fn new(category: FeatureCategory, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category,
        }
    }

    /// Matching key: category label plus the lowercased name.
    pub fn key(&self) -> String {
        format!(
            "{}:{}",
            self.category.as_str(),
            self.name.trim().to_lowercase()
        )
    }
}

/// A record with its resolved feature set.
#[derive(Debug, Clone)]
pub struct SoftwareFeatures {
    pub record: SoftwareRecord,
    pub features: Vec<Feature>,
    /// True when no features were tagged and the coarse category stands in.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PairOverlap {
    pub software_a: SoftwareSummary,
    pub software_b: SoftwareSummary,
    pub shared_features: Vec<Feature>,
    /// Size of the larger of the two feature sets.
    pub features_compared: usize,
    pub overlap_percentage: f64,
    pub cost_implication: f64,
}

impl PairOverlap {
    pub fn shared_feature_names(&self) -> Vec<String> {
        self.shared_features
            .iter()
            .map(|feature| feature.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Low,
    Medium,
    High,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Low => "low",
            Level::Medium => "medium",
            Level::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Level::Low),
            "medium" => Some(Level::Medium),
            "high" => Some(Level::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CategoryOverlap {
    pub category: FeatureCategory,
    /// Category label, or the raw coarse category of untagged products it does not map to.
    pub label: String,
    pub software: Vec<SoftwareSummary>,
    pub overlap_count: usize,
    pub features: Vec<String>,
    /// Flat 30% of the contributing products' summed cost.
    pub redundancy_cost: f64,
    /// Share of the pairwise cost implications attributed to this category.
    pub measured_redundancy_cost: f64,
    pub priority: Level,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationSource {
    Ai,
    RuleBased,
}

impl RecommendationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationSource::Ai => "ai",
            RecommendationSource::RuleBased => "rule_based",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ConsolidationRecommendation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub keep: SoftwareSummary,
    pub remove: Vec<SoftwareSummary>,
    pub annual_savings: f64,
    pub features_covered: Vec<String>,
    pub features_at_risk: Vec<String>,
    pub migration_effort: Level,
    pub business_risk: Level,
    pub confidence_score: f64,
    pub rationale: String,
    pub source: RecommendationSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub overlap_percentage: f64,
    #[serde(default)]
    pub status: RecommendationStatus,
}

/// Review state of a stored recommendation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

impl RecommendationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationStatus::Pending => "pending",
            RecommendationStatus::Accepted => "accepted",
            RecommendationStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(RecommendationStatus::Pending),
            "accepted" => Some(RecommendationStatus::Accepted),
            "rejected" => Some(RecommendationStatus::Rejected),
            _ => None,
        }
    }
}

/// A recommendation as read back from storage. Only what the table keeps survives the trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct StoredRecommendation {
    pub id: Uuid,
    pub keep: SoftwareSummary,
    pub remove: Vec<SoftwareSummary>,
    pub annual_savings: f64,
    pub features_covered: Vec<String>,
    pub features_at_risk: Vec<String>,
    pub migration_effort: Level,
    pub business_risk: Level,
    pub confidence_score: f64,
    pub rationale: String,
    pub status: RecommendationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct AnalysisResult {
    pub portfolio_id: Uuid,
    pub overlaps: Vec<CategoryOverlap>,
    pub comparison_matrix: Vec<PairOverlap>,
    pub recommendations: Vec<ConsolidationRecommendation>,
    pub total_redundancy_cost: f64,
    pub software_analyzed: usize,
    pub degraded_software: Vec<Uuid>,
    pub warnings: Vec<String>,
    pub analysis_date: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn empty(portfolio_id: Uuid, software_analyzed: usize) -> Self {
        Self {
            portfolio_id,
            overlaps: Vec::new(),
            comparison_matrix: Vec::new(),
            recommendations: Vec::new(),
            total_redundancy_cost: 0.0,
            software_analyzed,
            degraded_software: Vec::new(),
            warnings: Vec::new(),
            analysis_date: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisJobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl AnalysisJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisJobStatus::Queued => "queued",
            AnalysisJobStatus::Running => "running",
            AnalysisJobStatus::Completed => "completed",
            AnalysisJobStatus::Failed => "failed",
            AnalysisJobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnalysisJobStatus::Completed | AnalysisJobStatus::Failed | AnalysisJobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct AnalysisCounts {
    pub total_software: usize,
    pub processed_software: usize,
    pub degraded_software: usize,
    pub pairs_compared: usize,
    pub total_pairs: usize,
    pub overlaps_found: usize,
    pub recommendations: usize,
}

/// Partial counts merged into a job on each progress update.
#[derive(Debug, Clone, Default)]
pub struct ProgressExtra {
    pub total_software: Option<usize>,
    pub processed_software: Option<usize>,
    pub degraded_software: Option<usize>,
    pub pairs_compared: Option<usize>,
    pub total_pairs: Option<usize>,
    pub overlaps_found: Option<usize>,
    pub recommendations: Option<usize>,
}

impl ProgressExtra {
    pub fn merge_into(&self, counts: &mut AnalysisCounts) {
        if let Some(value) = self.total_software {
            counts.total_software = value;
        }
        if let Some(value) = self.processed_software {
            counts.processed_software = value;
        }
        if let Some(value) = self.degraded_software {
            counts.degraded_software = value;
        }
        if let Some(value) = self.pairs_compared {
            counts.pairs_compared = value;
        }
        if let Some(value) = self.total_pairs {
            counts.total_pairs = value;
        }
        if let Some(value) = self.overlaps_found {
            counts.overlaps_found = value;
        }
        if let Some(value) = self.recommendations {
            counts.recommendations = value;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub kind: ActivityKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct AnalysisJobError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct AnalysisJob {
    pub job_id: Uuid,
    pub portfolio_id: Uuid,
    pub status: AnalysisJobStatus,
    pub current_step: String,
    pub message: String,
    pub progress: f64,
    pub counts: AnalysisCounts,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub eta_seconds: u64,
    pub cancellation_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AnalysisJobError>,
    pub activity_log: Vec<ActivityEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<AnalysisResult>,
    #[serde(skip)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AnalysisJob {
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct StartAnalysisRequest {
    pub portfolio_id: Uuid,
    #[serde(default)]
    pub selected_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct StartAnalysisResponse {
    pub job: AnalysisJob,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ProgressResponse {
    pub job: AnalysisJob,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CancelResponse {
    pub acknowledged: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RecommendationListResponse {
    pub recommendations: Vec<StoredRecommendation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct UpdateRecommendationStatusRequest {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct UpdateRecommendationStatusResponse {
    pub id: Uuid,
    pub status: RecommendationStatus,
}
