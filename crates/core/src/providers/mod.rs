//! Inference provider catalogue: the backends a caption request can be
//! routed to, their models and rate limits.

mod seed;
mod store;

pub use seed::{default_providers, seed_defaults};
pub use store::{ProviderError, ProviderStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::batch::ValidationErrors;

pub const ENVIRONMENTS: [&str; 2] = ["cloud", "local"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimits {
    pub requests_per_minute: Option<u32>,
    pub tokens_per_minute: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderModel {
    pub id: i64,
    pub provider_id: i64,
    pub name: String,
    pub is_enabled: bool,
}

/// A stored provider. The API key itself is never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub environment: String,
    pub env_var: Option<String>,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub has_api_key: bool,
    pub is_enabled: bool,
    pub rate_limits: Option<RateLimits>,
    pub models: Vec<ProviderModel>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Provider {
    /// Stored key, or the value of `env_var` in the process environment.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.is_empty())
            .or_else(|| {
                self.env_var
                    .as_deref()
                    .and_then(|name| std::env::var(name).ok())
                    .filter(|key| !key.is_empty())
            })
    }

    /// `preferred` when it names an enabled model, else the first enabled one.
    pub fn pick_model(&self, preferred: Option<&str>) -> Option<&str> {
        let enabled = || self.models.iter().filter(|model| model.is_enabled);
        preferred
            .filter(|name| !name.is_empty())
            .and_then(|name| enabled().find(|model| model.name == name))
            .or_else(|| enabled().next())
            .map(|model| model.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInput {
    pub name: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

/// Body of `POST /api/v1/providers`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInput {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub env_var: Option<String>,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub is_enabled: Option<bool>,
    #[serde(default)]
    pub rate_limits: Option<RateLimits>,
    #[serde(default)]
    pub models: Vec<ModelInput>,
}

/// Body of `PUT /api/v1/providers/{id}`. Absent fields are left unchanged;
/// `models`, when present, replaces the whole list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPatch {
    pub name: Option<String>,
    pub kind: Option<String>,
    pub environment: Option<String>,
    pub env_var: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub is_enabled: Option<bool>,
    pub rate_limits: Option<RateLimits>,
    pub models: Option<Vec<ModelInput>>,
}

fn default_true() -> bool {
    true
}

impl ProviderInput {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        check_name(&self.name, &mut errors);
        check_kind(&self.kind, &mut errors);
        check_environment(&self.environment, &mut errors);
        check_base_url(&self.base_url, &mut errors);
        check_models(&self.models, &mut errors);
        errors.into_result(())
    }
}

impl ProviderPatch {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if let Some(name) = &self.name {
            check_name(name, &mut errors);
        }
        if let Some(kind) = &self.kind {
            check_kind(kind, &mut errors);
        }
        if let Some(environment) = &self.environment {
            check_environment(environment, &mut errors);
        }
        if let Some(base_url) = &self.base_url {
            check_base_url(base_url, &mut errors);
        }
        if let Some(models) = &self.models {
            check_models(models, &mut errors);
        }
        errors.into_result(())
    }
}

fn check_name(name: &str, errors: &mut ValidationErrors) {
    if name.trim().is_empty() {
        errors.add("name", "Name is required");
    }
}

fn check_kind(kind: &str, errors: &mut ValidationErrors) {
    if kind.trim().is_empty() {
        errors.add("kind", "Kind is required");
    }
}

fn check_environment(environment: &str, errors: &mut ValidationErrors) {
    if !ENVIRONMENTS.contains(&environment) {
        errors.add(
            "environment",
            format!("Invalid enum value. Expected {}", ENVIRONMENTS.join(" | ")),
        );
    }
}

fn check_base_url(base_url: &str, errors: &mut ValidationErrors) {
    if Url::parse(base_url.trim()).is_err() {
        errors.add("baseUrl", "Invalid url");
    }
}

fn check_models(models: &[ModelInput], errors: &mut ValidationErrors) {
    for (idx, model) in models.iter().enumerate() {
        if model.name.trim().is_empty() {
            errors.add(format!("models.{idx}.name"), "Model name is required");
        } else if models[..idx].iter().any(|prev| prev.name == model.name) {
            errors.add(format!("models.{idx}.name"), "Duplicate model");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> ProviderInput {
        ProviderInput {
            name: "local-ollama".to_string(),
            kind: "ollama".to_string(),
            environment: "local".to_string(),
            base_url: "http://localhost:11434".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn valid_input_passes() {
        assert!(input().validate().is_ok());
    }

    #[test]
    fn invalid_fields_are_reported_by_path() {
        let errors = ProviderInput {
            name: " ".to_string(),
            environment: "edge".to_string(),
            base_url: "not a url".to_string(),
            models: vec![
                ModelInput {
                    name: "llava".to_string(),
                    is_enabled: true,
                },
                ModelInput {
                    name: "llava".to_string(),
                    is_enabled: false,
                },
            ],
            ..input()
        }
        .validate()
        .expect_err("invalid provider");

        assert_eq!(errors.messages("name"), ["Name is required"]);
        assert_eq!(errors.messages("environment").len(), 1);
        assert_eq!(errors.messages("baseUrl"), ["Invalid url"]);
        assert_eq!(errors.messages("models.1.name"), ["Duplicate model"]);
    }

    #[test]
    fn patch_only_checks_present_fields() {
        assert!(ProviderPatch::default().validate().is_ok());
        let errors = ProviderPatch {
            environment: Some("mars".to_string()),
            ..Default::default()
        }
        .validate()
        .expect_err("bad environment");
        assert_eq!(errors.messages("environment").len(), 1);
    }

    #[test]
    fn model_input_defaults_to_enabled() {
        let model: ModelInput = serde_json::from_str(r#"{"name":"gpt-4o"}"#).expect("parse");
        assert!(model.is_enabled);
    }

    #[test]
    fn pick_model_prefers_enabled_match() {
        let now = Utc::now();
        let model = |id, name: &str, is_enabled| ProviderModel {
            id,
            provider_id: 1,
            name: name.to_string(),
            is_enabled,
        };
        let provider = Provider {
            id: 1,
            name: "openai".to_string(),
            kind: "openai".to_string(),
            environment: "cloud".to_string(),
            env_var: None,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: Some("sk-test".to_string()),
            has_api_key: true,
            is_enabled: true,
            rate_limits: None,
            models: vec![
                model(1, "gpt-4o-mini", false),
                model(2, "gpt-4o", true),
            ],
            created_at: now,
            updated_at: now,
        };

        assert_eq!(provider.pick_model(Some("gpt-4o")), Some("gpt-4o"));
        assert_eq!(provider.pick_model(Some("gpt-4o-mini")), Some("gpt-4o"));
        assert_eq!(provider.pick_model(None), Some("gpt-4o"));
        assert_eq!(provider.resolved_api_key().as_deref(), Some("sk-test"));

        let encoded = serde_json::to_value(&provider).expect("serialize");
        assert!(encoded.get("apiKey").is_none());
        assert_eq!(encoded["hasApiKey"], true);
    }
}
