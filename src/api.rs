use std::sync::Arc;

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::models::{AskResponse, ErrorResponse, HealthResponse, InfoResponse, UploadResponse};
use crate::pipeline::{ChatService, UploadedFile};
use crate::session::session_id_or_new;

pub const ROOT_MESSAGE: &str = "Chatbot is running. Use the /ask endpoint to interact.";
pub const MISSING_FILE_MESSAGE: &str = "Please attach a file in the 'file' field.";

#[derive(Clone)]
struct AppState {
    service: Arc<ChatService>,
    max_upload_bytes: usize,
}

impl AppState {
    fn upload_limit_message(&self) -> String {
        const MIB: usize = 1024 * 1024;
        let limit = if self.max_upload_bytes >= MIB {
            format!("{} MB", self.max_upload_bytes / MIB)
        } else {
            format!("{} KB", (self.max_upload_bytes / 1024).max(1))
        };
        format!("File exceeds the {} upload limit.", limit)
    }
}

/// Rejected request bodies, rendered as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        Self::bad_request(format!("Malformed multipart body: {}", e.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!(status = %self.status, error = %self.message, "request rejected");
        let body = ErrorResponse {
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn create_router(service: Arc<ChatService>, max_upload_bytes: usize) -> Router {
    let state = AppState {
        service,
        max_upload_bytes,
    };
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/upload", post(upload_handler))
        .route("/ask", post(ask_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn root_handler() -> Json<InfoResponse> {
    Json(InfoResponse {
        message: ROOT_MESSAGE.to_string(),
    })
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        sessions: state.service.sessions().len(),
        default_index_chunks: state.service.default_index_len().await,
    })
}

/// Fields of an `/ask` or `/upload` form. Unknown fields are ignored.
#[derive(Debug, Default)]
struct FormFields {
    file: Option<UploadedFile>,
    question: Option<String>,
    session_id: Option<String>,
    /// The body hit the upload limit; fields after that point are lost.
    oversized: bool,
}

async fn read_form(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<FormFields, ApiError> {
    let mut multipart = multipart?;
    let mut fields = FormFields::default();

    loop {
        match read_field(&mut multipart, &mut fields).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                tracing::warn!(error = %e.body_text(), "upload over body limit");
                fields.oversized = true;
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(fields)
}

/// Reads the next field into `fields`. Returns false once the form is done.
async fn read_field(
    multipart: &mut Multipart,
    fields: &mut FormFields,
) -> Result<bool, MultipartError> {
    let Some(field) = multipart.next_field().await? else {
        return Ok(false);
    };
    let name = field.name().unwrap_or("").to_string();
    match name.as_str() {
        "file" => {
            let filename = field.file_name().unwrap_or("upload").to_string();
            let bytes = field.bytes().await?;
            fields.file = Some(UploadedFile::new(filename, bytes.to_vec()));
        }
        "question" => fields.question = Some(field.text().await?),
        "session_id" => fields.session_id = Some(field.text().await?),
        other => {
            tracing::debug!(field = other, "ignoring form field");
        }
    }
    Ok(true)
}

async fn upload_handler(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let form = read_form(multipart).await?;
    if form.oversized {
        return Ok(Json(UploadResponse {
            status: state.upload_limit_message(),
        }));
    }

    let status = match form.file {
        Some(file) => state.service.upload(file).await,
        None => MISSING_FILE_MESSAGE.to_string(),
    };
    Ok(Json(UploadResponse { status }))
}

async fn ask_handler(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<AskResponse>, ApiError> {
    let form = read_form(multipart).await?;
    if form.oversized {
        return Ok(Json(AskResponse {
            answer: state.upload_limit_message(),
            session_id: session_id_or_new(form.session_id.as_deref()),
        }));
    }

    let outcome = state
        .service
        .ask(
            form.session_id.as_deref(),
            form.question.as_deref(),
            form.file,
        )
        .await;

    Ok(Json(AskResponse {
        answer: outcome.answer,
        session_id: outcome.session_id,
    }))
}
