use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task;
use tracing::{error, warn};

use minirag_rag::{DefaultSession, RagError, UsageReport};

const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

pub type SharedSession = Arc<DefaultSession>;

pub fn router(session: SharedSession) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/upload", post(handle_upload))
        .route("/ask", post(handle_ask))
        .route("/usage", get(handle_usage))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(session)
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    message: &'static str,
    fingerprint: String,
    chunks: usize,
    cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_warning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AskRequest {
    #[serde(default)]
    question: String,
}

#[derive(Debug, Serialize)]
struct AskResponse {
    answer: String,
    usage_status: String,
    usage: UsageReport,
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_upload(
    State(session): State<SharedSession>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let data = extract_file(&mut multipart).await?;
    let outcome = task::spawn_blocking(move || session.upload(&data))
        .await
        .map_err(AppError::internal)??;
    Ok(Json(UploadResponse {
        message: if outcome.was_cached {
            "Loaded document from cache"
        } else {
            "File processed successfully"
        },
        fingerprint: outcome.fingerprint.to_hex(),
        chunks: outcome.chunk_count,
        cached: outcome.was_cached,
        cache_warning: outcome.cache_warning,
    }))
}

async fn handle_ask(
    State(session): State<SharedSession>,
    Json(body): Json<AskRequest>,
) -> Result<Json<AskResponse>, AppError> {
    let outcome = task::spawn_blocking(move || session.ask(&body.question))
        .await
        .map_err(AppError::internal)??;
    Ok(Json(AskResponse {
        answer: outcome.answer,
        usage_status: outcome.usage.to_string(),
        usage: outcome.usage,
    }))
}

async fn handle_usage(State(session): State<SharedSession>) -> Json<UsageReport> {
    Json(session.usage())
}

async fn extract_file(multipart: &mut Multipart) -> Result<Vec<u8>, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(AppError::bad_request)?
    {
        if field.name() == Some("file") {
            let data = field.bytes().await.map_err(AppError::bad_request)?;
            return Ok(data.to_vec());
        }
    }
    Err(AppError::bad_request("No file uploaded"))
}

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Rag(#[from] RagError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn bad_request<E: ToString>(msg: E) -> Self {
        Self::BadRequest(msg.to_string())
    }

    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Rag(err) if err.is_input_error() => {
                let message = error_chain(&err);
                warn!(error = %message, "rejected request");
                (StatusCode::BAD_REQUEST, message)
            }
            AppError::Rag(err) => {
                let message = error_chain(&err);
                error!(error = %message, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            AppError::Internal(err) => {
                error!("internal_error" = %err);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(ErrorBody { message })).into_response()
    }
}

/// `outer: cause: root cause`, each layer once.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use minirag_core::TextSplitter;
    use minirag_rag::{
        ChunkEmbedBuilder, DocumentCache, EmbeddingClient, LlmClient, QaSession, QuotaLimits,
        RetrievalAnswerer, SqliteDocumentStore, UsageTracker,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    const BOUNDARY: &str = "minirag-test-boundary";

    fn app(dir: &std::path::Path) -> Router {
        let store =
            SqliteDocumentStore::open(dir.join("minirag.sqlite"), dir.join("faiss_indices"))
                .unwrap();
        let embeddings = EmbeddingClient::hash();
        let session = QaSession::new(
            DocumentCache::new(store),
            ChunkEmbedBuilder::new(TextSplitter::default(), embeddings.clone()),
            RetrievalAnswerer::new(embeddings, LlmClient::local(), 4),
            UsageTracker::new(QuotaLimits::default()),
        );
        router(Arc::new(session))
    }

    fn upload_request(contents: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"report.txt\"\r\nContent-Type: text/plain\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(contents);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn ask_request(question: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/ask")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "question": question }).to_string(),
            ))
            .unwrap()
    }

    async fn json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ask_without_upload_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(ask_request("What was revenue?"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json(response).await;
        assert!(body["message"].as_str().unwrap().contains("no document"));
    }

    #[tokio::test]
    async fn upload_then_ask_reports_usage() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let response = app
            .clone()
            .oneshot(upload_request(b"Revenue was four million dollars."))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let upload = json(response).await;
        assert_eq!(upload["cached"], Value::Bool(false));
        assert_eq!(upload["chunks"], 1);
        assert_eq!(upload["fingerprint"].as_str().unwrap().len(), 64);

        let again = json(
            app.clone()
                .oneshot(upload_request(b"Revenue was four million dollars."))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(again["cached"], Value::Bool(true));

        let response = app.clone().oneshot(ask_request("Revenue?")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let answer = json(response).await;
        assert!(answer["answer"].as_str().unwrap().contains("Revenue"));
        assert!(answer["usage_status"]
            .as_str()
            .unwrap()
            .contains("Requests this minute: 1/30"));

        let usage = json(
            app.oneshot(
                Request::builder()
                    .uri("/usage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap(),
        )
        .await;
        assert_eq!(usage["day"]["used_requests"], 1);
    }

    #[tokio::test]
    async fn unsupported_and_missing_files_are_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let response = app
            .clone()
            .oneshot(upload_request(&[0xff, 0xfe, 0x00, 0x9c]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let empty_form = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(format!("--{BOUNDARY}--\r\n")))
            .unwrap();
        let response = app.oneshot(empty_form).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn error_messages_list_each_cause_once() {
        let err = RagError::Answer(
            anyhow::anyhow!("connection refused").context("groq request failed"),
        );
        assert_eq!(
            error_chain(&err),
            "answering failed: groq request failed: connection refused"
        );

        let response = AppError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn rejected_upload_names_the_cause_once() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(upload_request(&[0xff, 0xfe, 0x00, 0x9c]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let message = json(response).await["message"].as_str().unwrap().to_string();
        assert!(message.starts_with("document processing failed: "));
        assert_eq!(message.matches("document processing failed").count(), 1);
        assert!(message.len() > "document processing failed: ".len());
    }
}
