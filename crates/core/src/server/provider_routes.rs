use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use super::{run_blocking, AppError, AppState};
use crate::providers::{Provider, ProviderError, ProviderInput, ProviderPatch};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/providers",
            get(list_providers).post(create_provider),
        )
        .route(
            "/api/v1/providers/{id}",
            get(get_provider)
                .put(update_provider)
                .delete(delete_provider),
        )
}

#[derive(Serialize)]
struct DeleteResponse {
    success: bool,
}

fn parse_provider_id(raw: &str) -> Result<i64, AppError> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid provider id: {raw}")))
}

async fn list_providers(State(state): State<AppState>) -> Result<Json<Vec<Provider>>, AppError> {
    let store = state.provider_store().clone();
    let providers = run_blocking(move || store.list()).await?;
    Ok(Json(providers))
}

async fn get_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Provider>, AppError> {
    let id = parse_provider_id(&id)?;
    let store = state.provider_store().clone();
    let provider = run_blocking(move || -> Result<_, ProviderError> {
        store.get(id)?.ok_or(ProviderError::NotFound(id))
    })
    .await?;
    Ok(Json(provider))
}

async fn create_provider(
    State(state): State<AppState>,
    payload: Result<Json<ProviderInput>, JsonRejection>,
) -> Result<(StatusCode, Json<Provider>), AppError> {
    let Json(input) = payload?;
    let store = state.provider_store().clone();
    let provider = run_blocking(move || store.create(&input)).await?;
    info!(provider_id = provider.id, name = %provider.name, "Provider created");
    Ok((StatusCode::CREATED, Json(provider)))
}

async fn update_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ProviderPatch>, JsonRejection>,
) -> Result<Json<Provider>, AppError> {
    let id = parse_provider_id(&id)?;
    let Json(patch) = payload?;
    let store = state.provider_store().clone();
    let provider = run_blocking(move || store.update(id, &patch)).await?;
    info!(provider_id = id, name = %provider.name, "Provider updated");
    Ok(Json(provider))
}

async fn delete_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let id = parse_provider_id(&id)?;
    let store = state.provider_store().clone();
    run_blocking(move || store.delete(id)).await?;
    info!(provider_id = id, "Provider deleted");
    Ok(Json(DeleteResponse { success: true }))
}
