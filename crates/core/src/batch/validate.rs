//! Request bodies for the batch API and their validation into domain values.

use serde::Deserialize;
use uuid::Uuid;

use super::error::ValidationErrors;
use super::model::{GenerationOptions, JobConfig, JobFilter, JobStatus, JobType, NewBatchJob};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateBatchJobRequest {
    #[serde(default, rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub perspectives: Vec<String>,
    #[serde(default)]
    pub options: Option<GenerationOptions>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderRequest {
    #[serde(default)]
    pub job_ids: Vec<String>,
}

/// Raw `/list` query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub include_archived: Option<String>,
}

pub const MAX_LIST_LIMIT: u32 = 100;

impl CreateBatchJobRequest {
    pub fn validate(self, default_priority: i64) -> Result<NewBatchJob, ValidationErrors> {
        let mut errors = ValidationErrors::new();

        let job_type = JobType::parse(self.job_type.trim());
        if job_type.is_none() {
            let allowed: Vec<&str> = JobType::ALL.iter().map(|ty| ty.as_str()).collect();
            errors.add(
                "type",
                format!("Invalid enum value. Expected {}", allowed.join(" | ")),
            );
        }

        if self.images.is_empty() {
            errors.add("images", "At least one image is required");
        }
        for (idx, image) in self.images.iter().enumerate() {
            if image.trim().is_empty() {
                errors.add(format!("images.{idx}"), "Image path must not be empty");
            }
        }

        if self.perspectives.is_empty() {
            errors.add("perspectives", "At least one perspective is required");
        }
        for (idx, perspective) in self.perspectives.iter().enumerate() {
            if perspective.trim().is_empty() {
                errors.add(format!("perspectives.{idx}"), "Perspective must not be empty");
            }
        }

        let options = self.options.unwrap_or_default();
        validate_options(&options, &mut errors);

        let dependencies = parse_uuid_list("dependencies", &self.dependencies, &mut errors);
        if job_type == Some(JobType::DependencyChain) && self.dependencies.is_empty() {
            errors.add(
                "dependencies",
                "DEPENDENCY_CHAIN jobs need at least one dependency",
            );
        }

        let Some(job_type) = job_type else {
            return Err(errors);
        };

        errors.into_result(NewBatchJob {
            job_type,
            config: JobConfig {
                images: self.images,
                perspectives: self.perspectives,
                options,
            },
            priority: self.priority.unwrap_or(default_priority),
            dependencies,
        })
    }
}

impl ReorderRequest {
    pub fn validate(&self) -> Result<Vec<Uuid>, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let ids = parse_uuid_list("jobIds", &self.job_ids, &mut errors);
        errors.into_result(ids)
    }
}

impl ListJobsQuery {
    pub fn into_filter(self) -> Result<JobFilter, ValidationErrors> {
        let mut errors = ValidationErrors::new();

        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") | Some("all") => None,
            Some(raw) => {
                let parsed = JobStatus::parse(raw);
                if parsed.is_none() {
                    errors.add("status", format!("Unknown status '{raw}'"));
                }
                parsed
            }
        };

        let limit = self.limit.unwrap_or(20);
        if limit == 0 || limit > MAX_LIST_LIMIT {
            errors.add(
                "limit",
                format!("Limit must be between 1 and {MAX_LIST_LIMIT}"),
            );
        }

        errors.into_result(JobFilter {
            status,
            limit,
            offset: self.offset.unwrap_or(0),
            include_archived: self.include_archived.as_deref() == Some("true"),
        })
    }
}

fn validate_options(options: &GenerationOptions, errors: &mut ValidationErrors) {
    if options.max_tokens == Some(0) {
        errors.add("options.max_tokens", "Must be greater than 0");
    }
    if let Some(temperature) = options.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            errors.add("options.temperature", "Must be between 0 and 2");
        }
    }
    if let Some(top_p) = options.top_p {
        if !(top_p > 0.0 && top_p <= 1.0) {
            errors.add("options.top_p", "Must be greater than 0 and at most 1");
        }
    }
    if let Some(penalty) = options.repetition_penalty {
        if penalty <= 0.0 {
            errors.add("options.repetition_penalty", "Must be greater than 0");
        }
    }
}

fn parse_uuid_list(field: &str, raw: &[String], errors: &mut ValidationErrors) -> Vec<Uuid> {
    let mut ids = Vec::with_capacity(raw.len());
    for (idx, value) in raw.iter().enumerate() {
        match Uuid::parse_str(value.trim()) {
            Ok(id) if !ids.contains(&id) => ids.push(id),
            Ok(_) => errors.add(format!("{field}.{idx}"), "Duplicate id"),
            Err(_) => errors.add(format!("{field}.{idx}"), "Invalid uuid"),
        }
    }
    ids
}
