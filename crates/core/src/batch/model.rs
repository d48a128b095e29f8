use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    MultiPerspective,
    DatasetPerspective,
    Backfill,
    DependencyChain,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::MultiPerspective,
        JobType::DatasetPerspective,
        JobType::Backfill,
        JobType::DependencyChain,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::MultiPerspective => "MULTI_PERSPECTIVE",
            JobType::DatasetPerspective => "DATASET_PERSPECTIVE",
            JobType::Backfill => "BACKFILL",
            JobType::DependencyChain => "DEPENDENCY_CHAIN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Partial,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Partial,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Partial => "partial",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == value)
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Whether a dependent job may start once this dependency reached `self`.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Partial)
    }

    /// Whether dependents can never start.
    pub fn blocks_dependents(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Running => "running",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            ItemStatus::Pending,
            ItemStatus::Running,
            ItemStatus::Completed,
            ItemStatus::Failed,
            ItemStatus::Cancelled,
        ]
        .into_iter()
        .find(|status| status.as_str() == value)
    }
}

/// Generation parameters forwarded to the inference bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_context: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize_resolution: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub images: Vec<String>,
    pub perspectives: Vec<String>,
    #[serde(default)]
    pub options: GenerationOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i64,
    pub total_images: u32,
    pub processed_images: u32,
    pub failed_images: u32,
    pub progress: u8,
    pub config: JobConfig,
    pub error: Option<String>,
    pub dependencies: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJobItem {
    pub id: i64,
    pub job_id: Uuid,
    pub image_path: String,
    pub perspective: String,
    pub status: ItemStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Milliseconds.
    pub processing_time: Option<i64>,
}

/// A validated create request.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBatchJob {
    pub job_type: JobType,
    pub config: JobConfig,
    pub priority: i64,
    pub dependencies: Vec<Uuid>,
}

impl NewBatchJob {
    pub fn total_items(&self) -> u32 {
        (self.config.images.len() * self.config.perspectives.len()) as u32
    }

    /// `(image, perspective)` pairs, image-major.
    pub fn item_pairs(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.config.images.iter().flat_map(move |image| {
            self.config
                .perspectives
                .iter()
                .map(move |perspective| (image.as_str(), perspective.as_str()))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: u32,
    pub offset: u32,
    pub include_archived: bool,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 20,
            offset: 0,
            include_archived: false,
        }
    }
}

/// How a single item ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Completed { processing_time_ms: i64 },
    Failed { error: String, processing_time_ms: i64 },
    Cancelled,
}

impl ItemOutcome {
    pub fn status(&self) -> ItemStatus {
        match self {
            ItemOutcome::Completed { .. } => ItemStatus::Completed,
            ItemOutcome::Failed { .. } => ItemStatus::Failed,
            ItemOutcome::Cancelled => ItemStatus::Cancelled,
        }
    }
}

/// Share of items that reached completed or failed, as a whole percent.
pub fn progress_percent(processed: u32, failed: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let done = u64::from(processed + failed).min(u64::from(total));
    (done * 100 / u64::from(total)) as u8
}

/// Status of a job whose items all ran without cancellation.
pub fn final_status(processed: u32, failed: u32) -> JobStatus {
    match (processed, failed) {
        (_, 0) => JobStatus::Completed,
        (0, _) => JobStatus::Failed,
        _ => JobStatus::Partial,
    }
}
