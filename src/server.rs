//! HTTP front end for the submission pipeline.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, State, multipart::MultipartError},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::{net::TcpListener, task::JoinError};
use tower_http::cors::{Any, CorsLayer};

use crate::{
    error::SubmissionError,
    pipeline::Pipeline,
    prelude::*,
    submission::{DocumentKind, Submission, Upload},
};

/// Route for PDF uploads.
pub const PDF_SCAN_ROUTE: &str = "/api/v1/documents/pdf/ocr-scan";

/// Route for single-image uploads.
pub const IMAGE_SCAN_ROUTE: &str = "/api/v1/documents/img/ocr-scan";

/// Errors returned by our handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("no file was uploaded")]
    MissingFile,
    #[error("cannot read upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("submission task failed: {0}")]
    Task(#[from] JoinError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

/// JSON error body.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            ApiError::MissingFile => (StatusCode::BAD_REQUEST, "No file uploaded"),
            ApiError::Multipart(err) => (err.status(), "Cannot read upload"),
            ApiError::Submission(SubmissionError::Unsupported(_)) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "Unsupported document type")
            }
            ApiError::Submission(SubmissionError::Capacity(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "Document has too many pages")
            }
            ApiError::Submission(SubmissionError::Timeout(_)) => {
                (StatusCode::GATEWAY_TIMEOUT, "Timed out processing request")
            }
            ApiError::Submission(
                SubmissionError::Resource(_) | SubmissionError::Conversion(_),
            )
            | ApiError::Task(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Unable to process request")
            }
        };
        let retryable = matches!(&self, ApiError::Submission(err) if err.is_retryable());
        if status.is_server_error() {
            error!(%status, retryable, "Request failed: {}", self);
        } else {
            warn!(%status, "Request rejected: {}", self);
        }
        let body = ErrorBody {
            error,
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Build our router.
pub fn router(pipeline: Arc<Pipeline>, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::ORIGIN, header::ACCEPT, header::CONTENT_TYPE]);
    Router::new()
        .route(PDF_SCAN_ROUTE, post(scan_pdf))
        .route(IMAGE_SCAN_ROUTE, post(scan_image))
        .route("/health", get(|| async { "ok" }))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .with_state(pipeline)
}

/// Serve until Ctrl-C.
pub async fn serve(
    listen: SocketAddr,
    pipeline: Arc<Pipeline>,
    max_upload_bytes: usize,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("cannot listen on {}", listen))?;
    info!(
        addr = %listener.local_addr().context("cannot get local address")?,
        ocr_jobs = pipeline.ocr_limiter().capacity(),
        workspace_dir = %pipeline.workspace_dir().display(),
        "Listening"
    );
    axum::serve(listener, router(pipeline, max_upload_bytes))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down"),
        Err(err) => {
            error!("Cannot listen for Ctrl-C, running until killed: {}", err);
            std::future::pending::<()>().await;
        }
    }
}

async fn scan_pdf(
    State(pipeline): State<Arc<Pipeline>>,
    multipart: Multipart,
) -> Result<Json<Submission>, ApiError> {
    scan(pipeline, multipart, DocumentKind::Pdf).await
}

async fn scan_image(
    State(pipeline): State<Arc<Pipeline>>,
    multipart: Multipart,
) -> Result<Json<Submission>, ApiError> {
    scan(pipeline, multipart, DocumentKind::Image).await
}

async fn scan(
    pipeline: Arc<Pipeline>,
    mut multipart: Multipart,
    kind: DocumentKind,
) -> Result<Json<Submission>, ApiError> {
    let upload = read_upload(&mut multipart).await?;
    // Run detached, so a client hanging up can't cancel the submission
    // halfway and leave its workspace behind.
    let submission =
        tokio::spawn(async move { pipeline.process(upload, kind).await }).await??;
    Ok(Json(submission))
}

/// The first part with a file name is the upload.
async fn read_upload(multipart: &mut Multipart) -> Result<Upload, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        let Some(file_name) = field.file_name().map(str::to_owned) else {
            continue;
        };
        let data = field.bytes().await?;
        debug!(%file_name, bytes = data.len(), "Received upload");
        return Ok(Upload {
            file_name,
            data: data.to_vec(),
        });
    }
    Err(ApiError::MissingFile)
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use serde_json::Value;
    use tower::ServiceExt as _;

    use super::*;
    use crate::{
        ocr::fakes::FakeOcrEngine,
        pipeline::tests::{PDF_BYTES, PNG_BYTES, pipeline},
        rasterize::tests::FakeRasterizer,
    };

    const BOUNDARY: &str = "docscan-test-boundary";

    fn app(dir: &Path, engine: FakeOcrEngine, fail: bool, max_upload_bytes: usize) -> Router {
        let rasterizer = FakeRasterizer { pages: 3, fail };
        let pipeline = pipeline(dir, rasterizer, Arc::new(engine), 2);
        router(Arc::new(pipeline), max_upload_bytes)
    }

    fn upload_request(uri: &str, file_name: Option<&str>, data: &[u8]) -> Request<Body> {
        let disposition = match file_name {
            Some(file_name) => format!("form-data; name=\"file\"; filename=\"{file_name}\""),
            None => "form-data; name=\"comment\"".to_owned(),
        };
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: {disposition}\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn pdf_upload_returns_pages() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = app(dir.path(), FakeOcrEngine::default(), false, 1 << 20);
        let request = upload_request(PDF_SCAN_ROUTE, Some("scan.pdf"), PDF_BYTES);
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["file_name"], "scan.pdf");
        assert_eq!(body["status"], "ok");
        assert_eq!(body["page_count"], 3);
        assert_eq!(body["pages"][2]["text"], "page 3");
    }

    #[tokio::test]
    async fn partial_failure_is_200() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = FakeOcrEngine {
            fail_pages: [2].into(),
            ..FakeOcrEngine::default()
        };
        let app = app(dir.path(), engine, false, 1 << 20);
        let request = upload_request(PDF_SCAN_ROUTE, Some("scan.pdf"), PDF_BYTES);
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "incomplete");
        assert_eq!(body["pages"][1]["text"], "");
        assert!(body["pages"][1]["error"].is_string());
        assert!(body["pages"][0].get("error").is_none());
    }

    #[tokio::test]
    async fn image_route_takes_images() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = app(dir.path(), FakeOcrEngine::default(), false, 1 << 20);
        let request = upload_request(IMAGE_SCAN_ROUTE, Some("photo.png"), PNG_BYTES);
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "image");
        assert_eq!(body["page_count"], 1);
    }

    #[tokio::test]
    async fn wrong_kind_is_415() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = app(dir.path(), FakeOcrEngine::default(), false, 1 << 20);
        let request = upload_request(IMAGE_SCAN_ROUTE, Some("scan.pdf"), PDF_BYTES);
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(body["error"], "Unsupported document type");
    }

    #[tokio::test]
    async fn missing_file_is_400() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = app(dir.path(), FakeOcrEngine::default(), false, 1 << 20);
        let request = upload_request(PDF_SCAN_ROUTE, None, b"just a comment");
        let (status, _) = send(app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_upload_is_413() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = app(dir.path(), FakeOcrEngine::default(), false, 256);
        let big = [PDF_BYTES, &[b' '; 4096]].concat();
        let request = upload_request(PDF_SCAN_ROUTE, Some("big.pdf"), &big);
        let (status, _) = send(app, request).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn conversion_failure_is_500() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = app(dir.path(), FakeOcrEngine::default(), true, 1 << 20);
        let request = upload_request(PDF_SCAN_ROUTE, Some("scan.pdf"), PDF_BYTES);
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Unable to process request");
        assert!(body["detail"].as_str().unwrap().contains("convert"));
    }

    #[test]
    fn timeouts_are_504() {
        let err = ApiError::from(SubmissionError::Timeout(std::time::Duration::from_secs(1)));
        assert_eq!(err.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
        let err = ApiError::from(SubmissionError::Capacity(anyhow!("too long")));
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn health_and_cors() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = app(dir.path(), FakeOcrEngine::default(), false, 1 << 20);
        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let preflight = Request::builder()
            .method("OPTIONS")
            .uri(PDF_SCAN_ROUTE)
            .header(header::ORIGIN, "http://example.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(preflight).await.unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }
}
