use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::model::GenerationOptions;
use crate::config::InferenceConfig;
use crate::providers::{Provider, ProviderStore, RateLimits};

const BRIDGE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CAPTION_ENDPOINT: &str = "perspectives/caption-from-path";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TEMPERATURE: f64 = 0.8;
const DEFAULT_TOP_P: f64 = 0.9;
const DEFAULT_REPETITION_PENALTY: f64 = 1.15;

/// One (image, perspective) caption call.
#[derive(Debug, Clone)]
pub struct CaptionRequest {
    pub job_id: Uuid,
    pub perspective: String,
    pub image_path: PathBuf,
    pub options: GenerationOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptionResult {
    pub perspective: String,
    pub provider: String,
    pub model: String,
    pub version: String,
    pub result: Value,
    pub raw_text: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("{error:#}")]
pub struct CaptionError {
    pub retryable: bool,
    pub error: anyhow::Error,
}

impl CaptionError {
    pub fn retryable(error: anyhow::Error) -> Self {
        Self {
            retryable: true,
            error,
        }
    }

    pub fn fatal(error: anyhow::Error) -> Self {
        Self {
            retryable: false,
            error,
        }
    }
}

/// Produces a caption for one image. Called from a blocking thread.
pub trait CaptionBackend: Send + Sync {
    fn caption(&self, request: &CaptionRequest) -> Result<CaptionResult, CaptionError>;
}

/// Talks to the inference bridge over HTTP, resolving providers from the catalogue.
#[derive(Debug, Clone)]
pub struct HttpCaptionBackend {
    providers: ProviderStore,
    inference: InferenceConfig,
}

#[derive(Debug, Serialize)]
struct BridgeProviderConfig<'a> {
    name: &'a str,
    kind: &'a str,
    environment: &'a str,
    base_url: &'a str,
    api_key: Option<String>,
    models: Vec<&'a str>,
    rate_limits: Option<RateLimits>,
}

#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
    perspective: &'a str,
    image_path: String,
    provider: &'a str,
    provider_config: BridgeProviderConfig<'a>,
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    top_p: f64,
    repetition_penalty: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    global_context: Option<&'a str>,
    #[serde(skip_serializing_if = "is_empty_slice")]
    context: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    resize_resolution: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    perspective: Option<String>,
    provider: Option<String>,
    #[serde(default)]
    result: Value,
    raw_text: Option<String>,
    version: Option<String>,
}

impl HttpCaptionBackend {
    pub fn new(providers: ProviderStore, inference: InferenceConfig) -> Self {
        Self {
            providers,
            inference,
        }
    }

    fn resolve_provider(&self, options: &GenerationOptions) -> Result<Provider, CaptionError> {
        let name = options
            .provider
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.inference.default_provider);

        let provider = self
            .providers
            .find_by_name(name)
            .map_err(CaptionError::retryable)?
            .ok_or_else(|| CaptionError::fatal(anyhow!("Unknown provider '{name}'")))?;
        if !provider.is_enabled {
            return Err(CaptionError::fatal(anyhow!(
                "Provider '{name}' is disabled"
            )));
        }
        Ok(provider)
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{CAPTION_ENDPOINT}",
            self.inference.bridge_url.trim_end_matches('/')
        )
    }
}

impl CaptionBackend for HttpCaptionBackend {
    fn caption(&self, request: &CaptionRequest) -> Result<CaptionResult, CaptionError> {
        let options = &request.options;
        let provider = self.resolve_provider(options)?;

        let preferred = options
            .model
            .as_deref()
            .filter(|model| !model.is_empty())
            .or(Some(self.inference.default_model.as_str()).filter(|model| !model.is_empty()));
        let model = provider
            .pick_model(preferred)
            .or(preferred)
            .unwrap_or_default()
            .to_string();

        let body = BridgeRequest {
            perspective: &request.perspective,
            image_path: request.image_path.to_string_lossy().into_owned(),
            provider: &provider.name,
            provider_config: BridgeProviderConfig {
                name: &provider.name,
                kind: &provider.kind,
                environment: &provider.environment,
                base_url: &provider.base_url,
                api_key: provider.resolved_api_key(),
                models: provider
                    .models
                    .iter()
                    .filter(|model| model.is_enabled)
                    .map(|model| model.name.as_str())
                    .collect(),
                rate_limits: provider.rate_limits,
            },
            model: &model,
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            top_p: options.top_p.unwrap_or(DEFAULT_TOP_P),
            repetition_penalty: options
                .repetition_penalty
                .unwrap_or(DEFAULT_REPETITION_PENALTY),
            global_context: options.global_context.as_deref(),
            context: &options.context,
            resize_resolution: options
                .resize
                .unwrap_or(false)
                .then_some(options.resize_resolution.as_deref())
                .flatten(),
        };

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(BRIDGE_CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(self.inference.request_timeout_secs))
            .build()
            .context("failed to build HTTP client for inference bridge")
            .map_err(CaptionError::fatal)?;

        let endpoint = self.endpoint();
        debug!(
            job_id = %request.job_id,
            perspective = %request.perspective,
            provider = %provider.name,
            model = %model,
            "Requesting caption from inference bridge"
        );

        let response = client.post(&endpoint).json(&body).send().map_err(|err| {
            let wrapped = anyhow!("inference bridge request to {endpoint} failed: {err}");
            if is_retryable_reqwest_error(&err) {
                CaptionError::retryable(wrapped)
            } else {
                CaptionError::fatal(wrapped)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            let wrapped = anyhow!(
                "inference bridge returned HTTP {}: {}",
                status.as_u16(),
                detail.chars().take(300).collect::<String>()
            );
            return Err(if is_retryable_status(status) {
                CaptionError::retryable(wrapped)
            } else {
                CaptionError::fatal(wrapped)
            });
        }

        let parsed: BridgeResponse = response
            .json()
            .context("inference bridge returned an unreadable body")
            .map_err(CaptionError::fatal)?;

        Ok(CaptionResult {
            perspective: parsed.perspective.unwrap_or_else(|| request.perspective.clone()),
            provider: parsed.provider.unwrap_or_else(|| provider.name.clone()),
            model,
            version: parsed.version.unwrap_or_else(|| "1".to_string()),
            result: parsed.result,
            raw_text: parsed.raw_text,
        })
    }
}

fn is_empty_slice(values: &&[String]) -> bool {
    values.is_empty()
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error()
}

fn is_retryable_reqwest_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}
