use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{run_blocking, AppError, AppState};
use crate::batch::schedule::position_of;
use crate::batch::validate::{CreateBatchJobRequest, ListJobsQuery, ReorderRequest};
use crate::batch::{BatchJob, BatchJobItem, JobStatus, QueueError};

const BATCH_PREFIX: &str = "/api/v1/perspectives/batch";

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route(&format!("{BATCH_PREFIX}/create"), post(create_job))
        .route(&format!("{BATCH_PREFIX}/list"), get(list_jobs))
        .route(&format!("{BATCH_PREFIX}/status/{{job_id}}"), get(job_status))
        .route(&format!("{BATCH_PREFIX}/cancel/{{job_id}}"), post(cancel_job))
        .route(&format!("{BATCH_PREFIX}/reorder"), post(reorder_jobs))
        .route(&format!("{BATCH_PREFIX}/archive/{{job_id}}"), post(archive_job))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobResponse {
    job_id: Uuid,
    status: JobStatus,
    created_at: DateTime<Utc>,
    position: Option<usize>,
}

#[derive(Serialize)]
struct ListJobsResponse {
    jobs: Vec<BatchJob>,
    total: u64,
    offset: u32,
    limit: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    include_items: Option<String>,
}

#[derive(Serialize)]
struct JobStatusResponse {
    job: BatchJob,
    #[serde(skip_serializing_if = "Option::is_none")]
    items: Option<Vec<BatchJobItem>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelResponse {
    success: bool,
    job_id: Uuid,
    status: JobStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReorderResponse {
    success: bool,
    updated_jobs: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveResponse {
    success: bool,
    job_id: Uuid,
    archived: bool,
}

fn parse_job_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw.trim()).map_err(|_| AppError::BadRequest(format!("Invalid job id: {raw}")))
}

async fn create_job(
    State(state): State<AppState>,
    payload: Result<Json<CreateBatchJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateJobResponse>), AppError> {
    let Json(payload) = payload?;
    let config = state.config().await;
    if !config.features.batch_queue {
        return Err(AppError::ServiceUnavailable(
            "Batch queue is disabled".to_string(),
        ));
    }

    let new_job = payload.validate(config.queue.default_priority)?;
    let store = state.batch_store().clone();
    let (job, position) = run_blocking(move || -> Result<_, QueueError> {
        let job = store.create_job(&new_job)?;
        let queued = store.queued_jobs()?;
        let position = position_of(&queued, job.job_id);
        Ok((job, position))
    })
    .await?;

    info!(
        job_id = %job.job_id,
        job_type = %job.job_type.as_str(),
        total_items = job.total_images,
        priority = job.priority,
        "Batch job queued"
    );
    state.queue().wake();

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id: job.job_id,
            status: job.status,
            created_at: job.created_at,
            position,
        }),
    ))
}

async fn list_jobs(
    State(state): State<AppState>,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> Result<Json<ListJobsResponse>, AppError> {
    let Query(query) = query?;
    let filter = query.into_filter()?;
    let store = state.batch_store().clone();
    let (offset, limit) = (filter.offset, filter.limit);
    let (jobs, total) = run_blocking(move || store.list_jobs(&filter)).await?;

    Ok(Json(ListJobsResponse {
        jobs,
        total,
        offset,
        limit,
    }))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> Result<Json<JobStatusResponse>, AppError> {
    let job_id = parse_job_id(&job_id)?;
    let Query(query) = query?;
    let include_items = query.include_items.as_deref() == Some("true");

    let store = state.batch_store().clone();
    let (job, items) = run_blocking(move || -> Result<_, QueueError> {
        let job = store.get_job(job_id)?.ok_or(QueueError::NotFound(job_id))?;
        let items = if include_items {
            Some(store.list_items(job_id)?)
        } else {
            None
        };
        Ok((job, items))
    })
    .await?;

    Ok(Json(JobStatusResponse { job, items }))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    let job_id = parse_job_id(&job_id)?;
    let store = state.batch_store().clone();
    let job = run_blocking(move || store.cancel_job(job_id)).await?;

    let interrupted = state.queue().cancel(job_id);
    info!(%job_id, interrupted, "Batch job cancelled");
    state.queue().wake();

    Ok(Json(CancelResponse {
        success: true,
        job_id,
        status: job.status,
    }))
}

async fn reorder_jobs(
    State(state): State<AppState>,
    payload: Result<Json<ReorderRequest>, JsonRejection>,
) -> Result<Json<ReorderResponse>, AppError> {
    let Json(payload) = payload?;
    let job_ids = payload.validate()?;
    let store = state.batch_store().clone();
    let updated_jobs = run_blocking(move || store.reorder(&job_ids)).await?;
    state.queue().wake();

    Ok(Json(ReorderResponse {
        success: true,
        updated_jobs,
    }))
}

async fn archive_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<ArchiveResponse>, AppError> {
    let job_id = parse_job_id(&job_id)?;
    let store = state.batch_store().clone();
    let job = run_blocking(move || store.archive_job(job_id)).await?;

    Ok(Json(ArchiveResponse {
        success: true,
        job_id,
        archived: job.archived,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::StatusCode;
    use serde_json::{json, Value};
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    use super::super::test_support::*;
    use super::*;

    async fn create(router: &mut Router, body: Value) -> (StatusCode, Value) {
        let resp = send_request(
            router,
            json_request("POST", "/api/v1/perspectives/batch/create", body),
        )
        .await;
        let status = resp.status();
        (status, json_body(resp).await)
    }

    async fn wait_for_status(state: &AppState, job_id: Uuid, wanted: JobStatus) -> BatchJob {
        for _ in 0..100 {
            let store = state.batch_store().clone();
            let job = tokio::task::spawn_blocking(move || store.get_job(job_id))
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if job.status == wanted {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {job_id} never reached {wanted}");
    }

    #[tokio::test]
    async fn create_rejects_invalid_bodies_per_field() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let mut router = test_router(&state);

        let (status, body) = create(
            &mut router,
            json!({
                "type": "SOMETHING",
                "images": [],
                "perspectives": ["graph"],
                "dependencies": ["not-a-uuid"]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Validation error");
        let errors = &body["validationErrors"];
        assert!(errors["type"][0]
            .as_str()
            .unwrap()
            .starts_with("Invalid enum value"));
        assert_eq!(errors["images"][0], "At least one image is required");
        assert_eq!(errors["dependencies.0"][0], "Invalid uuid");

        let (status, body) = create(
            &mut router,
            json!({
                "type": "DEPENDENCY_CHAIN",
                "images": ["/a.jpg"],
                "perspectives": ["graph"],
                "dependencies": [Uuid::new_v4().to_string()]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["validationErrors"]["dependencies.0"][0], "Unknown job");

        let resp = send_request(
            &mut router,
            axum::http::Request::builder()
                .method("POST")
                .uri("/api/v1/perspectives/batch/create")
                .header("content-type", "application/json")
                .body(axum::body::Body::from("{not json"))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_list_reorder_and_status() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let mut router = test_router(&state);

        let mut ids = Vec::new();
        for image in ["/a.jpg", "/b.jpg", "/c.jpg"] {
            let (status, body) = create(
                &mut router,
                json!({
                    "type": "MULTI_PERSPECTIVE",
                    "images": [image],
                    "perspectives": ["graph", "art"]
                }),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
            assert_eq!(body["status"], "pending");
            ids.push(body["jobId"].as_str().unwrap().to_string());
        }
        let (a, b, c) = (ids[0].clone(), ids[1].clone(), ids[2].clone());

        let resp = send_request(
            &mut router,
            json_request(
                "POST",
                "/api/v1/perspectives/batch/reorder",
                json!({ "jobIds": [b, a, c] }),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["updatedJobs"], 3);

        let resp = send_request(
            &mut router,
            get_request("/api/v1/perspectives/batch/list?limit=10"),
        )
        .await;
        let body = json_body(resp).await;
        let listed: Vec<&str> = body["jobs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|job| job["jobId"].as_str().unwrap())
            .collect();
        assert_eq!(listed, vec![b.as_str(), a.as_str(), c.as_str()]);
        assert_eq!(body["total"], 3);
        assert_eq!(body["limit"], 10);

        let resp = send_request(
            &mut router,
            get_request(&format!(
                "/api/v1/perspectives/batch/status/{a}?includeItems=true"
            )),
        )
        .await;
        let body = json_body(resp).await;
        assert_eq!(body["job"]["totalImages"], 2);
        assert_eq!(body["items"].as_array().unwrap().len(), 2);

        let resp = send_request(
            &mut router,
            get_request(&format!("/api/v1/perspectives/batch/status/{}", Uuid::new_v4())),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["error"], "Job not found");

        let resp = send_request(
            &mut router,
            get_request("/api/v1/perspectives/batch/list?limit=500"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cancel_and_archive_rules() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let mut router = test_router(&state);

        let (_, body) = create(
            &mut router,
            json!({ "type": "BACKFILL", "images": ["/a.jpg"], "perspectives": ["graph"] }),
        )
        .await;
        let job_id = body["jobId"].as_str().unwrap().to_string();

        let resp = send_request(
            &mut router,
            json_request(
                "POST",
                &format!("/api/v1/perspectives/batch/archive/{job_id}"),
                json!({}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let cancel_uri = format!("/api/v1/perspectives/batch/cancel/{job_id}");
        let resp = send_request(&mut router, json_request("POST", &cancel_uri, json!({}))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "cancelled");

        let resp = send_request(&mut router, json_request("POST", &cancel_uri, json!({}))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(resp).await["error"],
            "Cannot cancel job that is already completed or cancelled"
        );

        let resp = send_request(
            &mut router,
            json_request(
                "POST",
                &format!("/api/v1/perspectives/batch/archive/{job_id}"),
                json!({}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["archived"], true);

        let resp = send_request(
            &mut router,
            get_request("/api/v1/perspectives/batch/list"),
        )
        .await;
        assert_eq!(json_body(resp).await["total"], 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_runs_jobs_in_dependency_order() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let workspace = state.paths().workspace.clone();
        std::fs::create_dir_all(workspace.join("cats")).unwrap();
        std::fs::write(workspace.join("cats/a.jpg"), b"jpg").unwrap();
        std::fs::write(workspace.join("cats/b.jpg"), b"jpg").unwrap();

        let backend = echo_backend();
        let shutdown = CancellationToken::new();
        let worker = state.spawn_queue_worker(backend.clone(), shutdown.clone());
        let mut router = test_router(&state);

        let (_, base) = create(
            &mut router,
            json!({
                "type": "MULTI_PERSPECTIVE",
                "images": ["/cats/a.jpg", "/cats/b.jpg"],
                "perspectives": ["graph"]
            }),
        )
        .await;
        let base_id = Uuid::parse_str(base["jobId"].as_str().unwrap()).unwrap();
        let (status, child) = create(
            &mut router,
            json!({
                "type": "DEPENDENCY_CHAIN",
                "images": ["/cats/a.jpg", "/cats/missing.jpg"],
                "perspectives": ["art"],
                "priority": 0,
                "dependencies": [base_id.to_string()]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let child_id = Uuid::parse_str(child["jobId"].as_str().unwrap()).unwrap();

        let base = wait_for_status(&state, base_id, JobStatus::Completed).await;
        assert_eq!(base.processed_images, 2);
        assert_eq!(base.progress, 100);

        let child = wait_for_status(&state, child_id, JobStatus::Partial).await;
        assert_eq!(child.failed_images, 1);
        assert!(child.started_at.unwrap() >= base.completed_at.unwrap());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

        let resp = send_request(
            &mut router,
            get_request("/api/images/captions?path=/cats/a.jpg"),
        )
        .await;
        let captions = json_body(resp).await;
        assert!(captions["perspectives"]["graph"]["content"]["caption"]
            .as_str()
            .unwrap()
            .ends_with("a.jpg"));
        assert_eq!(captions["perspectives"]["art"]["provider"], "gemini");

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_and_cancel_succeed_while_worker_writes() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let workspace = state.paths().workspace.clone();
        let images: Vec<String> = (0..6).map(|idx| format!("/busy/{idx}.jpg")).collect();
        std::fs::create_dir_all(workspace.join("busy")).unwrap();
        for image in &images {
            std::fs::write(workspace.join(image.trim_start_matches('/')), b"jpg").unwrap();
        }

        let backend = echo_backend();
        let shutdown = CancellationToken::new();
        let worker = state.spawn_queue_worker(backend.clone(), shutdown.clone());
        let mut router = test_router(&state);

        let mut created = Vec::new();
        for round in 0..30 {
            let (status, body) = create(
                &mut router,
                json!({
                    "type": "MULTI_PERSPECTIVE",
                    "images": images,
                    "perspectives": ["graph", "art"]
                }),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED, "round {round}: {body}");
            created.push(Uuid::parse_str(body["jobId"].as_str().unwrap()).unwrap());

            if round % 5 == 4 {
                let resp = send_request(
                    &mut router,
                    json_request(
                        "POST",
                        &format!("/api/v1/perspectives/batch/cancel/{}", created[round]),
                        json!({}),
                    ),
                )
                .await;
                // The worker may already have finished this job.
                assert_ne!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
            }
        }

        let last = *created.last().unwrap();
        for _ in 0..200 {
            let store = state.batch_store().clone();
            let status = tokio::task::spawn_blocking(move || store.job_status(last))
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelling_a_running_job_stops_remaining_items() {
        use crate::batch::{CaptionBackend, CaptionError, CaptionRequest, CaptionResult};

        struct SlowBackend;
        impl CaptionBackend for SlowBackend {
            fn caption(&self, _: &CaptionRequest) -> Result<CaptionResult, CaptionError> {
                std::thread::sleep(Duration::from_millis(300));
                Err(CaptionError::retryable(anyhow::anyhow!("bridge busy")))
            }
        }

        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let workspace = state.paths().workspace.clone();
        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            std::fs::write(workspace.join(name), b"jpg").unwrap();
        }
        let shutdown = CancellationToken::new();
        let worker = state.spawn_queue_worker(Arc::new(SlowBackend), shutdown.clone());
        let mut router = test_router(&state);

        let (_, body) = create(
            &mut router,
            json!({
                "type": "MULTI_PERSPECTIVE",
                "images": ["/a.jpg", "/b.jpg", "/c.jpg"],
                "perspectives": ["graph"]
            }),
        )
        .await;
        let job_id = Uuid::parse_str(body["jobId"].as_str().unwrap()).unwrap();
        wait_for_status(&state, job_id, JobStatus::Running).await;

        let resp = send_request(
            &mut router,
            json_request(
                "POST",
                &format!("/api/v1/perspectives/batch/cancel/{job_id}"),
                json!({}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        for _ in 0..100 {
            if !state.queue().is_running(job_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!state.queue().is_running(job_id));

        let store = state.batch_store().clone();
        let items = tokio::task::spawn_blocking(move || store.list_items(job_id))
            .await
            .unwrap()
            .unwrap();
        assert!(items
            .iter()
            .all(|item| item.status == crate::batch::ItemStatus::Cancelled));
        let job = wait_for_status(&state, job_id, JobStatus::Cancelled).await;
        assert!(job.completed_at.is_some());

        shutdown.cancel();
        worker.await.unwrap();
    }
}
