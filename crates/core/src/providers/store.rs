use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{ModelInput, Provider, ProviderInput, ProviderModel, ProviderPatch, RateLimits};
use crate::batch::store::{
    format_timestamp, open_connection, parse_timestamp, write_transaction, DB_FILE_NAME,
};
use crate::batch::ValidationErrors;

const PROVIDER_COLUMNS: &str = "id, name, kind, environment, env_var, base_url, api_key, \
     is_enabled, requests_per_minute, tokens_per_minute, created_at, updated_at";

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider not found")]
    NotFound(i64),
    #[error("Provider with name '{0}' already exists")]
    Duplicate(String),
    #[error("Validation error")]
    Invalid(#[from] ValidationErrors),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Provider catalogue persisted next to the queue tables.
#[derive(Debug, Clone)]
pub struct ProviderStore {
    db_path: PathBuf,
}

impl ProviderStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).with_context(|| {
            format!(
                "failed to create data directory for provider db: {}",
                data_dir.display()
            )
        })?;
        let store = Self {
            db_path: data_dir.join(DB_FILE_NAME),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn list(&self) -> Result<Vec<Provider>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROVIDER_COLUMNS} FROM providers ORDER BY name ASC"
            ))?;
            let rows = stmt.query_map([], provider_from_row)?;
            let mut providers = Vec::new();
            for row in rows {
                let mut provider = row.context("failed to decode provider row")?;
                provider.models = load_models(conn, provider.id)?;
                providers.push(provider);
            }
            Ok(providers)
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<Provider>> {
        self.with_connection(|conn| fetch_provider(conn, "id = ?1", params![id]))
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<Provider>> {
        self.with_connection(|conn| fetch_provider(conn, "name = ?1", params![name]))
    }

    pub fn create(&self, input: &ProviderInput) -> Result<Provider, ProviderError> {
        input.validate()?;
        self.with_connection(|conn| {
            let tx = write_transaction(conn).context("failed to begin provider transaction")?;
            let name = input.name.trim();
            if name_taken(&tx, name, None)? {
                return Err(ProviderError::Duplicate(name.to_string()));
            }

            let now = format_timestamp(Utc::now());
            let (requests_per_minute, tokens_per_minute) = split_limits(input.rate_limits);
            tx.execute(
                "INSERT INTO providers (
                    name, kind, environment, env_var, base_url, api_key, is_enabled,
                    requests_per_minute, tokens_per_minute, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    name,
                    input.kind.trim(),
                    input.environment,
                    input.env_var,
                    input.base_url.trim(),
                    input.api_key,
                    input.is_enabled.unwrap_or(true),
                    requests_per_minute,
                    tokens_per_minute,
                    now,
                ],
            )
            .with_context(|| format!("failed to insert provider {name}"))?;
            let id = tx.last_insert_rowid();
            replace_models(&tx, id, &input.models)?;
            tx.commit().context("failed to commit provider")?;

            fetch_provider(conn, "id = ?1", params![id])?.ok_or(ProviderError::NotFound(id))
        })
    }

    pub fn update(&self, id: i64, patch: &ProviderPatch) -> Result<Provider, ProviderError> {
        patch.validate()?;
        self.with_connection(|conn| {
            let tx = write_transaction(conn).context("failed to begin provider transaction")?;
            let current = fetch_provider(&tx, "id = ?1", params![id])?
                .ok_or(ProviderError::NotFound(id))?;

            let name = patch
                .name
                .as_deref()
                .map(str::trim)
                .unwrap_or(&current.name)
                .to_string();
            if name != current.name && name_taken(&tx, &name, Some(id))? {
                return Err(ProviderError::Duplicate(name));
            }

            let (requests_per_minute, tokens_per_minute) =
                split_limits(patch.rate_limits.or(current.rate_limits));
            tx.execute(
                "UPDATE providers SET
                    name = ?2, kind = ?3, environment = ?4, env_var = ?5, base_url = ?6,
                    api_key = ?7, is_enabled = ?8, requests_per_minute = ?9,
                    tokens_per_minute = ?10, updated_at = ?11
                 WHERE id = ?1",
                params![
                    id,
                    name,
                    patch.kind.as_deref().map(str::trim).unwrap_or(&current.kind),
                    patch.environment.as_deref().unwrap_or(&current.environment),
                    patch.env_var.clone().or(current.env_var),
                    patch
                        .base_url
                        .as_deref()
                        .map(str::trim)
                        .unwrap_or(&current.base_url),
                    patch.api_key.clone().or(current.api_key),
                    patch.is_enabled.unwrap_or(current.is_enabled),
                    requests_per_minute,
                    tokens_per_minute,
                    format_timestamp(Utc::now()),
                ],
            )
            .with_context(|| format!("failed to update provider {id}"))?;
            if let Some(models) = &patch.models {
                replace_models(&tx, id, models)?;
            }
            tx.commit().context("failed to commit provider update")?;

            fetch_provider(conn, "id = ?1", params![id])?.ok_or(ProviderError::NotFound(id))
        })
    }

    pub fn delete(&self, id: i64) -> Result<(), ProviderError> {
        self.with_connection(|conn| {
            let removed = conn
                .execute("DELETE FROM providers WHERE id = ?1", params![id])
                .with_context(|| format!("failed to delete provider {id}"))?;
            if removed == 0 {
                return Err(ProviderError::NotFound(id));
            }
            Ok(())
        })
    }

    fn initialize_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS providers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    kind TEXT NOT NULL,
                    environment TEXT NOT NULL,
                    env_var TEXT,
                    base_url TEXT NOT NULL,
                    api_key TEXT,
                    is_enabled INTEGER NOT NULL DEFAULT 1,
                    requests_per_minute INTEGER,
                    tokens_per_minute INTEGER,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS provider_models (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    provider_id INTEGER NOT NULL REFERENCES providers(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    is_enabled INTEGER NOT NULL DEFAULT 1,
                    UNIQUE (provider_id, name)
                 );",
            )
            .with_context(|| {
                format!(
                    "failed to initialize provider schema: {}",
                    self.db_path.display()
                )
            })?;
            Ok(())
        })
    }

    fn with_connection<T, E>(&self, op: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E>
    where
        E: From<anyhow::Error>,
    {
        let conn = open_connection(&self.db_path)?;
        op(&conn)
    }
}

fn fetch_provider(
    conn: &Connection,
    condition: &str,
    params: impl rusqlite::Params,
) -> Result<Option<Provider>> {
    let provider = conn
        .query_row(
            &format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE {condition}"),
            params,
            provider_from_row,
        )
        .optional()
        .context("failed to load provider")?;
    match provider {
        Some(mut provider) => {
            provider.models = load_models(conn, provider.id)?;
            Ok(Some(provider))
        }
        None => Ok(None),
    }
}

fn name_taken(conn: &Connection, name: &str, except: Option<i64>) -> Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM providers WHERE name = ?1 AND (?2 IS NULL OR id != ?2))",
        params![name, except],
        |row| row.get(0),
    )
    .context("failed to check provider name")
}

fn replace_models(conn: &Connection, provider_id: i64, models: &[ModelInput]) -> Result<()> {
    conn.execute(
        "DELETE FROM provider_models WHERE provider_id = ?1",
        params![provider_id],
    )
    .context("failed to clear provider models")?;
    let mut insert = conn
        .prepare(
            "INSERT INTO provider_models (provider_id, name, is_enabled) VALUES (?1, ?2, ?3)",
        )
        .context("failed to prepare model insert")?;
    for model in models {
        insert
            .execute(params![provider_id, model.name.trim(), model.is_enabled])
            .with_context(|| format!("failed to insert model {}", model.name))?;
    }
    Ok(())
}

fn load_models(conn: &Connection, provider_id: i64) -> Result<Vec<ProviderModel>> {
    let mut stmt = conn.prepare(
        "SELECT id, provider_id, name, is_enabled FROM provider_models
         WHERE provider_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![provider_id], |row| {
        Ok(ProviderModel {
            id: row.get(0)?,
            provider_id: row.get(1)?,
            name: row.get(2)?,
            is_enabled: row.get(3)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to load models of provider {provider_id}"))
}

fn split_limits(limits: Option<RateLimits>) -> (Option<u32>, Option<i64>) {
    match limits {
        Some(limits) => (
            limits.requests_per_minute,
            limits.tokens_per_minute.map(|tokens| tokens as i64),
        ),
        None => (None, None),
    }
}

fn provider_from_row(row: &Row<'_>) -> rusqlite::Result<Provider> {
    let api_key: Option<String> = row.get(6)?;
    let requests_per_minute: Option<u32> = row.get(8)?;
    let tokens_per_minute: Option<i64> = row.get(9)?;
    let rate_limits = if requests_per_minute.is_none() && tokens_per_minute.is_none() {
        None
    } else {
        Some(RateLimits {
            requests_per_minute,
            tokens_per_minute: tokens_per_minute.map(|tokens| tokens.max(0) as u64),
        })
    };

    Ok(Provider {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        environment: row.get(3)?,
        env_var: row.get(4)?,
        base_url: row.get(5)?,
        has_api_key: api_key.as_deref().is_some_and(|key| !key.is_empty()),
        api_key,
        is_enabled: row.get(7)?,
        rate_limits,
        models: Vec::new(),
        created_at: timestamp_at(row, 10)?,
        updated_at: timestamp_at(row, 11)?,
    })
}

fn timestamp_at(row: &Row<'_>, index: usize) -> rusqlite::Result<chrono::DateTime<Utc>> {
    let raw: String = row.get(index)?;
    parse_timestamp(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )),
        )
    })
}
