use anyhow::Result;
use tracing::{debug, info};

use super::{ModelInput, ProviderInput, ProviderStore, RateLimits};

struct SeedProvider {
    name: &'static str,
    environment: &'static str,
    env_var: &'static str,
    base_url: &'static str,
    models: &'static [&'static str],
    rate_limits: Option<RateLimits>,
}

const SEED_PROVIDERS: &[SeedProvider] = &[
    SeedProvider {
        name: "openai",
        environment: "cloud",
        env_var: "OPENAI_API_KEY",
        base_url: "https://api.openai.com/v1",
        models: &["gpt-4o-mini", "gpt-4o"],
        rate_limits: None,
    },
    SeedProvider {
        name: "gemini",
        environment: "cloud",
        env_var: "GOOGLE_API_KEY",
        base_url: "https://generativelanguage.googleapis.com/v1beta",
        models: &["gemini-2.0-flash-exp"],
        rate_limits: Some(RateLimits {
            requests_per_minute: Some(10),
            tokens_per_minute: Some(4_000_000),
        }),
    },
    SeedProvider {
        name: "openrouter",
        environment: "cloud",
        env_var: "OPENROUTER_API_KEY",
        base_url: "https://openrouter.ai/api/v1",
        models: &[
            "minimax/minimax-01",
            "qwen/qvq-72b-preview",
            "google/gemini-2.0-flash-exp:free",
            "mistralai/pixtral-large-2411",
            "meta-llama/llama-3.2-90b-vision-instruct:free",
            "qwen/qwen-2-vl-72b-instruct",
        ],
        rate_limits: None,
    },
    // Local servers report their models at runtime.
    SeedProvider {
        name: "ollama",
        environment: "local",
        env_var: "CUSTOM_PROVIDER_1_KEY",
        base_url: "http://localhost:11434",
        models: &[],
        rate_limits: None,
    },
    SeedProvider {
        name: "vllm",
        environment: "local",
        env_var: "CUSTOM_PROVIDER_1_KEY",
        base_url: "http://localhost:12434",
        models: &[],
        rate_limits: None,
    },
];

/// Built-in provider definitions. `kind` matches the name for all of them.
pub fn default_providers() -> Vec<ProviderInput> {
    SEED_PROVIDERS
        .iter()
        .map(|seed| ProviderInput {
            name: seed.name.to_string(),
            kind: seed.name.to_string(),
            environment: seed.environment.to_string(),
            env_var: Some(seed.env_var.to_string()),
            base_url: seed.base_url.to_string(),
            api_key: None,
            is_enabled: Some(true),
            rate_limits: seed.rate_limits,
            models: seed
                .models
                .iter()
                .map(|name| ModelInput {
                    name: name.to_string(),
                    is_enabled: true,
                })
                .collect(),
        })
        .collect()
}

/// Inserts every built-in provider whose name is not taken yet.
/// Returns the number of providers created.
pub fn seed_defaults(store: &ProviderStore) -> Result<usize> {
    let mut created = 0;
    for provider in default_providers() {
        if store.find_by_name(&provider.name)?.is_some() {
            debug!(provider = %provider.name, "Provider already present; skipping seed");
            continue;
        }
        store.create(&provider).map_err(anyhow::Error::from)?;
        created += 1;
    }
    if created > 0 {
        info!(created, "Seeded default providers");
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderPatch;
    use tempfile::tempdir;

    #[test]
    fn seeding_is_idempotent_and_keeps_edits() {
        let dir = tempdir().expect("tempdir");
        let store = ProviderStore::new(dir.path()).expect("store");

        assert_eq!(seed_defaults(&store).expect("seed"), SEED_PROVIDERS.len());

        let gemini = store.find_by_name("gemini").expect("find").expect("seeded");
        store
            .update(
                gemini.id,
                &ProviderPatch {
                    is_enabled: Some(false),
                    ..Default::default()
                },
            )
            .expect("disable");

        assert_eq!(seed_defaults(&store).expect("reseed"), 0);
        let gemini = store.find_by_name("gemini").expect("find").expect("kept");
        assert!(!gemini.is_enabled);
        assert_eq!(
            gemini.rate_limits.and_then(|limits| limits.requests_per_minute),
            Some(10)
        );
    }

    #[test]
    fn seeds_validate() {
        for provider in default_providers() {
            assert!(provider.validate().is_ok(), "{} invalid", provider.name);
        }
    }
}
