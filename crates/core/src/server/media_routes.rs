use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{run_blocking, AppError, AppState};
use crate::media::captions::{read_captions, ImageCaptions};
use crate::media::datasets::{
    add_image_to_dataset, create_dataset, delete_dataset, list_datasets, AddedImage,
    CreatedDataset, Dataset,
};
use crate::media::edit::{process_image, ProcessRequest, ProcessedImage};
use crate::media::images::{content_type_for, is_image_file, list_images, ImageEntry};
use crate::media::thumbnails::{ensure_thumbnail, ThumbnailFormat};
use crate::media::uploads::{
    check_upload_size, save_uploads, too_many_files_message, IncomingFile, UploadedImage,
    MAX_UPLOAD_BYTES, MAX_UPLOAD_FILES,
};
use crate::media::webp::{fresh_webp, is_convertible};
use crate::media::{
    check_output_size, relative_to, secure_path, MediaError, SecurePath, SecurePathOptions,
};

const CACHE_CONTROL: &str = "public, max-age=86400, immutable";
const VARY: &str = "Origin, Accept";
const UPLOAD_FIELD: &str = "image";
const DATASET_FIELD: &str = "dataset";
/// Room for every file at full size plus the form framing.
const UPLOAD_BODY_LIMIT: usize = MAX_UPLOAD_BYTES * MAX_UPLOAD_FILES + 1024 * 1024;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/images", get(get_images))
        .route("/api/images/view/{*path}", get(view_image))
        .route(
            "/api/images/upload",
            post(upload_images).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route("/api/images/process", post(process))
        .route("/api/images/captions", get(get_captions))
        .route("/api/images/webp/{*path}", get(view_webp))
        .route("/api/datasets/images", get(get_datasets))
        .route("/api/datasets/create", post(post_dataset))
        .route("/api/datasets/add-image", post(post_dataset_image))
        .route("/api/datasets/{name}", delete(remove_dataset))
}

#[derive(Debug, Default, Deserialize)]
struct ImagesQuery {
    directory: Option<String>,
}

#[derive(Serialize)]
struct ImagesResponse {
    images: Vec<ImageEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct ViewQuery {
    width: Option<String>,
    height: Option<String>,
    format: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CaptionsQuery {
    path: Option<String>,
}

#[derive(Serialize)]
struct DatasetsResponse {
    datasets: Vec<Dataset>,
}

#[derive(Debug, Default, Deserialize)]
struct CreateDatasetRequest {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddImageRequest {
    #[serde(default)]
    image_path: String,
    #[serde(default)]
    dataset_name: String,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

/// `path` and `url` describe the first stored file.
#[derive(Serialize)]
struct UploadResponse {
    success: bool,
    path: String,
    url: String,
    files: Vec<UploadedImage>,
}

async fn get_images(
    State(state): State<AppState>,
    query: Result<Query<ImagesQuery>, QueryRejection>,
) -> Result<Json<ImagesResponse>, AppError> {
    let Query(query) = query?;
    let paths = state.paths().clone();
    let images = run_blocking(move || list_images(&paths, query.directory.as_deref())).await?;
    Ok(Json(ImagesResponse { images }))
}

fn parse_dimension(raw: Option<&str>) -> Result<Option<u32>, AppError> {
    match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
        None => Ok(None),
        Some(raw) => match raw.parse::<u32>() {
            Ok(value) if value > 0 => Ok(Some(value)),
            _ => Err(AppError::BadRequest(
                "Width and height must be positive integers".to_string(),
            )),
        },
    }
}

fn not_found_as(message: &str) -> impl Fn(MediaError) -> AppError + '_ {
    move |err| {
        if err.is_not_found() {
            AppError::NotFound(message.to_string())
        } else {
            err.into()
        }
    }
}

fn cache_headers(etag: &str) -> Result<HeaderMap, AppError> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL));
    headers.insert(
        header::ETAG,
        HeaderValue::from_str(etag)
            .map_err(|_| AppError::BadRequest("Path contains invalid characters".to_string()))?,
    );
    headers.insert(
        "cross-origin-resource-policy",
        HeaderValue::from_static("cross-origin"),
    );
    headers.insert(header::VARY, HeaderValue::from_static(VARY));
    Ok(headers)
}

fn etag_matches(request: &HeaderMap, etag: &str) -> bool {
    request
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.split(',').any(|tag| tag.trim() == etag))
}

async fn send_file(
    file: std::path::PathBuf,
    content_type: String,
    mut headers: HeaderMap,
) -> Result<Response, AppError> {
    let bytes = tokio::fs::read(&file)
        .await
        .map_err(|err| AppError::Internal(format!("failed to read {}: {err}", file.display())))?;
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    Ok((StatusCode::OK, headers, bytes).into_response())
}

async fn view_image(
    State(state): State<AppState>,
    Path(path): Path<String>,
    query: Result<Query<ViewQuery>, QueryRejection>,
    request_headers: HeaderMap,
) -> Result<Response, AppError> {
    let Query(query) = query?;
    let width = parse_dimension(query.width.as_deref())?;
    let height = parse_dimension(query.height.as_deref())?;
    if let (Some(width), Some(height)) = (width, height) {
        check_output_size(width, height)?;
    }
    let format = match query.format.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
        None => ThumbnailFormat::Webp,
        Some(raw) => ThumbnailFormat::parse(raw).ok_or_else(|| {
            AppError::BadRequest(format!("Invalid format '{raw}'. Expected webp | jpeg | png"))
        })?,
    };

    let paths = state.paths().clone();
    let source: SecurePath = secure_path(&path, &paths.workspace, SecurePathOptions::readable())
        .map_err(MediaError::from)
        .map_err(not_found_as("Image not found"))?;
    if !source.absolute.is_file() || !is_image_file(&source.absolute) {
        return Err(AppError::NotFound("Image not found".to_string()));
    }

    let dimension = |value: Option<u32>| value.map_or_else(|| "orig".to_string(), |v| v.to_string());
    let etag = format!(
        "W/\"{}-{}-{}-{}\"",
        source.relative,
        dimension(width),
        dimension(height),
        format.as_str()
    );
    let headers = cache_headers(&etag)?;
    if etag_matches(&request_headers, &etag) {
        return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
    }

    if let (Some(width), Some(height)) = (width, height) {
        let thumbnails = paths.thumbnails.clone();
        let thumb_source = source.clone();
        let thumbnail = run_blocking(move || {
            ensure_thumbnail(&thumbnails, &thumb_source, width, height, format)
        })
        .await?;
        return send_file(thumbnail, format.content_type().to_string(), headers).await;
    }

    let webp_enabled = state.features().await.webp_cache;
    if webp_enabled && format == ThumbnailFormat::Webp && is_convertible(&source.absolute) {
        if let Some(cached) = fresh_webp(&paths.webp_cache, &source.relative, &source.absolute) {
            if let Some(relative) = relative_to(&paths.webp_cache, &cached) {
                debug!(source = %source.relative, "Redirecting to cached WebP");
                let mut headers = headers;
                headers.insert(
                    header::LOCATION,
                    HeaderValue::from_str(&format!("/api/images/webp{relative}")).map_err(
                        |_| AppError::BadRequest("Path contains invalid characters".to_string()),
                    )?,
                );
                return Ok((StatusCode::FOUND, headers).into_response());
            }
        }
    }

    let content_type = content_type_for(&source.absolute);
    send_file(source.absolute, content_type, headers).await
}

async fn view_webp(
    State(state): State<AppState>,
    Path(path): Path<String>,
    request_headers: HeaderMap,
) -> Result<Response, AppError> {
    let cached = secure_path(
        &path,
        &state.paths().webp_cache,
        SecurePathOptions::readable(),
    )
    .map_err(MediaError::from)
    .map_err(not_found_as("WebP image not found"))?;
    if !cached.absolute.is_file() {
        return Err(AppError::NotFound("WebP image not found".to_string()));
    }

    let etag = format!("W/\"{}\"", cached.relative);
    let headers = cache_headers(&etag)?;
    if etag_matches(&request_headers, &etag) {
        return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
    }
    send_file(cached.absolute, "image/webp".to_string(), headers).await
}

async fn upload_images(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, AppError> {
    let mut multipart = multipart?;
    let mut files = Vec::new();
    let mut dataset = None;
    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name == UPLOAD_FIELD {
            if files.len() == MAX_UPLOAD_FILES {
                return Err(AppError::PayloadTooLarge(too_many_files_message()));
            }
            let file_name = field.file_name().unwrap_or_default().to_string();
            let content_type = field.content_type().unwrap_or_default().to_string();
            let mut bytes = Vec::new();
            while let Some(chunk) = field.chunk().await? {
                check_upload_size(bytes.len() + chunk.len())?;
                bytes.extend_from_slice(&chunk);
            }
            files.push(IncomingFile {
                file_name,
                content_type,
                bytes,
            });
        } else if name == DATASET_FIELD {
            dataset = Some(field.text().await?);
        }
    }

    let paths = state.paths().clone();
    let timestamp_ms = chrono::Utc::now().timestamp_millis();
    let saved =
        run_blocking(move || save_uploads(&paths, &files, dataset.as_deref(), timestamp_ms))
            .await?;
    let first = saved
        .first()
        .cloned()
        .ok_or_else(|| AppError::BadRequest("No image file provided".to_string()))?;
    Ok(Json(UploadResponse {
        success: true,
        path: first.path,
        url: first.url,
        files: saved,
    }))
}

async fn process(
    State(state): State<AppState>,
    payload: Result<Json<ProcessRequest>, JsonRejection>,
) -> Result<Json<ProcessedImage>, AppError> {
    let Json(request) = payload?;
    if !state.features().await.image_editing {
        return Err(AppError::ServiceUnavailable(
            "Image editing is disabled".to_string(),
        ));
    }
    let paths = state.paths().clone();
    let processed = run_blocking(move || process_image(&paths, &request)).await?;
    Ok(Json(processed))
}

async fn get_captions(
    State(state): State<AppState>,
    query: Result<Query<CaptionsQuery>, QueryRejection>,
) -> Result<Json<ImageCaptions>, AppError> {
    let Query(query) = query?;
    let relative = query.path.unwrap_or_default();
    if relative.trim().is_empty() {
        return Err(AppError::BadRequest("Image path is required".to_string()));
    }
    let workspace = state.paths().workspace.clone();
    let captions = run_blocking(move || read_captions(&workspace, &relative)).await?;
    Ok(Json(captions))
}

async fn get_datasets(State(state): State<AppState>) -> Result<Json<DatasetsResponse>, AppError> {
    let paths = state.paths().clone();
    let datasets = run_blocking(move || list_datasets(&paths)).await?;
    Ok(Json(DatasetsResponse { datasets }))
}

async fn post_dataset(
    State(state): State<AppState>,
    payload: Result<Json<CreateDatasetRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedDataset>), AppError> {
    let Json(request) = payload?;
    let paths = state.paths().clone();
    let created = run_blocking(move || create_dataset(&paths, &request.name)).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn post_dataset_image(
    State(state): State<AppState>,
    payload: Result<Json<AddImageRequest>, JsonRejection>,
) -> Result<Json<AddedImage>, AppError> {
    let Json(request) = payload?;
    let paths = state.paths().clone();
    let added = run_blocking(move || {
        add_image_to_dataset(&paths, &request.image_path, &request.dataset_name)
    })
    .await?;
    Ok(Json(added))
}

async fn remove_dataset(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    let paths = state.paths().clone();
    run_blocking(move || delete_dataset(&paths, &name)).await?;
    Ok(Json(SuccessResponse { success: true }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use image::{Rgb, RgbImage};
    use serde_json::json;
    use tempfile::tempdir;

    use super::super::test_support::*;
    use crate::media::webp::{generate_webp, webp_cache_path};

    fn write_png(path: &std::path::Path, width: u32, height: u32) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(width, height, Rgb([10, 200, 30]))
            .save(path)
            .unwrap();
    }

    #[tokio::test]
    async fn lists_images_and_rejects_escapes() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let workspace = state.paths().workspace.clone();
        write_png(&workspace.join("datasets/cats/a.png"), 4, 4);
        write_png(&workspace.join(".hidden/b.png"), 4, 4);
        let mut router = test_router(&state);

        let resp = send_request(&mut router, get_request("/api/images")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        let images = body["images"].as_array().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0]["path"], "/datasets/cats/a.png");
        assert_eq!(images[0]["url"], "/api/images/view/datasets/cats/a.png");

        let resp = send_request(
            &mut router,
            get_request("/api/images?directory=../../etc"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn view_serves_thumbnails_with_cache_headers() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        write_png(&state.paths().workspace.join("pics/a.png"), 40, 20);
        let mut router = test_router(&state);

        let resp = send_request(
            &mut router,
            get_request("/api/images/view/pics/a.png?width=10&height=10&format=png"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let etag = resp.headers()["etag"].to_str().unwrap().to_string();
        assert_eq!(etag, "W/\"/pics/a.png-10-10-png\"");
        assert_eq!(resp.headers()["content-type"], "image/png");
        assert_eq!(
            resp.headers()["cache-control"],
            "public, max-age=86400, immutable"
        );
        assert_eq!(resp.headers()["cross-origin-resource-policy"], "cross-origin");
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let thumb = image::load_from_memory(&bytes).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (10, 10));

        let resp = send_request(
            &mut router,
            Request::builder()
                .uri("/api/images/view/pics/a.png?width=10&height=10&format=png")
                .header("if-none-match", etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);

        let resp = send_request(
            &mut router,
            get_request("/api/images/view/pics/a.png?width=0"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send_request(&mut router, get_request("/api/images/view/pics/nope.png")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["error"], "Image not found");
    }

    #[tokio::test]
    async fn view_rejects_oversized_thumbnails() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        write_png(&state.paths().workspace.join("a.png"), 4, 4);
        let mut router = test_router(&state);

        for query in [
            "width=4294967295&height=4294967295",
            "width=16385&height=1",
            "width=16384&height=16384",
        ] {
            let resp = send_request(
                &mut router,
                get_request(&format!("/api/images/view/a.png?{query}&format=png")),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{query}");
            assert!(json_body(resp).await["error"]
                .as_str()
                .unwrap()
                .contains("exceeds the limit"));
        }
        assert!(!state.paths().thumbnails.read_dir().map_or(false, |mut d| d.next().is_some()));

        let resp = send_request(
            &mut router,
            get_request("/api/images/view/a.png?width=4294967295&format=png"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn view_and_webp_refuse_links_leaving_their_directory() {
        let outside = tempdir().unwrap();
        write_png(&outside.path().join("secret.png"), 4, 4);
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        std::os::unix::fs::symlink(
            outside.path().join("secret.png"),
            state.paths().workspace.join("leak.png"),
        )
        .unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.png"),
            state.paths().webp_cache.join("leak.webp"),
        )
        .unwrap();
        let mut router = test_router(&state);

        for uri in ["/api/images/view/leak.png", "/api/images/webp/leak.webp"] {
            let resp = send_request(&mut router, get_request(uri)).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(
                json_body(resp).await["error"],
                "Access denied: Symbolic link points outside of allowed directory"
            );
        }
    }

    #[tokio::test]
    async fn view_redirects_to_fresh_webp() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let source = state.paths().workspace.join("pics/a.png");
        write_png(&source, 8, 8);
        let mut router = test_router(&state);

        let resp = send_request(&mut router, get_request("/api/images/view/pics/a.png")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "image/png");

        let cached = webp_cache_path(&state.paths().webp_cache, "/pics/a.png");
        generate_webp(&source, &cached).unwrap();

        let resp = send_request(&mut router, get_request("/api/images/view/pics/a.png")).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers()["location"], "/api/images/webp/pics/a.webp");

        let resp = send_request(&mut router, get_request("/api/images/webp/pics/a.webp")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "image/webp");
        assert_eq!(resp.headers()["etag"], "W/\"/pics/a.webp\"");

        let resp = send_request(&mut router, get_request("/api/images/webp/pics/b.webp")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["error"], "WebP image not found");
    }

    #[tokio::test]
    async fn process_respects_feature_flag() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        write_png(&state.paths().workspace.join("a.png"), 8, 6);
        let mut router = test_router(&state);

        let resp = send_request(
            &mut router,
            json_request("POST", "/api/images/process", json!({ "imagePath": "" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"], "Image path is required");

        let resp = send_request(
            &mut router,
            json_request(
                "POST",
                "/api/images/process",
                json!({ "imagePath": "/a.png", "operations": { "rotate": 90 } }),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["path"], "/uploads/a_edited.png");
        let edited = image::open(state.paths().uploads.join("a_edited.png")).unwrap();
        assert_eq!((edited.width(), edited.height()), (6, 8));

        let resp = send_request(
            &mut router,
            json_request(
                "PUT",
                "/api/feature-flags",
                json!({ "batch_queue": true, "webp_cache": true, "image_editing": false }),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = send_request(
            &mut router,
            json_request("POST", "/api/images/process", json!({ "imagePath": "/a.png" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn captions_need_a_path() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let mut router = test_router(&state);

        let resp = send_request(&mut router, get_request("/api/images/captions")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send_request(
            &mut router,
            get_request("/api/images/captions?path=/a.png"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["image"]["name"], "a.png");
        assert!(body["perspectives"].as_object().unwrap().is_empty());
    }

    const BOUNDARY: &str = "graphcap-form-boundary";

    enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, &'a str, &'a [u8]),
    }

    fn multipart_request(parts: &[Part<'_>]) -> Request<Body> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}")
                            .as_bytes(),
                    );
                }
                Part::File(filename, content_type, bytes) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"image\"; filename=\"{filename}\"\r\n\
                             Content-Type: {content_type}\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(bytes);
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri("/api/images/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn upload_stores_timestamped_images() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let mut router = test_router(&state);

        let resp = send_request(
            &mut router,
            multipart_request(&[Part::File("my cat.png", "image/png", b"png-bytes")]),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        let path = body["path"].as_str().unwrap().to_string();
        assert!(path.starts_with("/uploads/"), "{path}");
        assert!(path.ends_with("-my_cat.png"), "{path}");
        assert_eq!(body["url"], format!("/api/images/view{path}"));
        let stored = state.paths().workspace.join(path.trim_start_matches('/'));
        assert_eq!(std::fs::read(stored).unwrap(), b"png-bytes");

        // The dataset field may follow the files.
        let resp = send_request(
            &mut router,
            multipart_request(&[
                Part::File("a.png", "image/png", b"a"),
                Part::File("b.jpg", "image/jpeg", b"b"),
                Part::Text("dataset", "faves"),
            ]),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        let files = body["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        assert!(files
            .iter()
            .all(|f| f["path"].as_str().unwrap().starts_with("/datasets/.local/faves/")));

        let resp = send_request(&mut router, get_request("/api/datasets/images")).await;
        let body = json_body(resp).await;
        assert_eq!(body["datasets"][0]["name"], "faves");
        assert_eq!(body["datasets"][0]["images"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn upload_rejects_bad_forms() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let mut router = test_router(&state);

        let resp = send_request(
            &mut router,
            multipart_request(&[Part::File("notes.txt", "text/plain", b"hi")]),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"], "Only image files are allowed");

        let resp = send_request(&mut router, multipart_request(&[Part::Text("dataset", "x")])).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"], "No image file provided");

        let resp = send_request(
            &mut router,
            multipart_request(&[
                Part::Text("dataset", "../up"),
                Part::File("a.png", "image/png", b"a"),
            ]),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(resp).await["error"],
            "Invalid dataset name. Use only letters, numbers, underscores, and hyphens."
        );

        let six: Vec<Part<'_>> = (0..6)
            .map(|_| Part::File("a.png", "image/png", b"a".as_slice()))
            .collect();
        let resp = send_request(&mut router, multipart_request(&six)).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            json_body(resp).await["error"],
            "Too many files. Maximum is 5 files per upload"
        );

        let resp = send_request(
            &mut router,
            json_request("POST", "/api/images/upload", json!({ "image": "a.png" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        assert_eq!(
            std::fs::read_dir(&state.paths().uploads).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn dataset_endpoints() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        write_png(&state.paths().uploads.join("pic.png"), 4, 4);
        let mut router = test_router(&state);

        let resp = send_request(
            &mut router,
            json_request("POST", "/api/datasets/create", json!({ "name": "faves" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = json_body(resp).await;
        assert_eq!(body["name"], "faves");
        assert_eq!(body["images"], json!([]));

        let resp = send_request(
            &mut router,
            json_request("POST", "/api/datasets/create", json!({ "name": "faves" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let add = json!({ "imagePath": "/uploads/pic.png", "datasetName": "faves" });
        let resp = send_request(
            &mut router,
            json_request("POST", "/api/datasets/add-image", add.clone()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["success"], true);

        let resp = send_request(
            &mut router,
            json_request("POST", "/api/datasets/add-image", add),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = send_request(
            &mut router,
            json_request(
                "POST",
                "/api/datasets/add-image",
                json!({ "imagePath": "/uploads/pic.png", "datasetName": "other" }),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send_request(&mut router, get_request("/api/datasets/images")).await;
        let body = json_body(resp).await;
        assert_eq!(body["datasets"][0]["name"], "faves");
        assert_eq!(body["datasets"][0]["images"].as_array().unwrap().len(), 1);

        let delete = Request::builder()
            .method("DELETE")
            .uri("/api/datasets/faves")
            .body(Body::empty())
            .unwrap();
        let resp = send_request(&mut router, delete).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let delete = Request::builder()
            .method("DELETE")
            .uri("/api/datasets/faves")
            .body(Body::empty())
            .unwrap();
        let resp = send_request(&mut router, delete).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
