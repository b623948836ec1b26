//! services/api/src/web/study.rs
//!
//! Study session endpoints: document upload, artifact generation, the tutor,
//! Ultra job submission and the processing resource clients poll.

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use studius_core::domain::ProcessingMetadata;
use studius_core::ports::PortError;
use studius_core::{ArtifactKind, AuthContext, StudySession, StudySessionSummary, UltraKind};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiError;
use crate::web::run_detached;
use crate::web::state::AppState;

const DEFAULT_LANGUAGE: &str = "it";

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Serialize, ToSchema)]
pub struct StudySessionResponse {
    pub id: Uuid,
    pub title: String,
    pub language: String,
    pub document_chars: usize,
    pub created_at: DateTime<Utc>,
    /// Every artifact generated so far; absent ones are `null`.
    #[schema(value_type = Object)]
    pub artifacts: serde_json::Value,
}

impl From<StudySession> for StudySessionResponse {
    fn from(session: StudySession) -> Self {
        Self {
            id: session.id,
            document_chars: session.document_chars(),
            title: session.title,
            language: session.language,
            created_at: session.created_at,
            artifacts: serde_json::to_value(&session.artifacts)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct StudySessionListItem {
    pub id: Uuid,
    pub title: String,
    pub language: String,
    pub document_chars: usize,
    pub created_at: DateTime<Utc>,
}

impl From<StudySessionSummary> for StudySessionListItem {
    fn from(summary: StudySessionSummary) -> Self {
        Self {
            id: summary.id,
            title: summary.title,
            language: summary.language,
            document_chars: summary.document_chars,
            created_at: summary.created_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ArtifactResponse {
    pub kind: String,
    #[schema(value_type = Object)]
    pub artifact: serde_json::Value,
    /// Set when the model could not produce the artifact and a stand-in was stored.
    pub placeholder: bool,
    pub balance: i64,
}

#[derive(Deserialize, ToSchema)]
pub struct TutorRequest {
    pub question: String,
}

#[derive(Serialize, ToSchema)]
pub struct TutorResponse {
    pub answer: String,
    pub placeholder: bool,
    pub balance: i64,
}

#[derive(Serialize, ToSchema)]
pub struct UltraJobResponse {
    pub job_id: Uuid,
    pub kind: String,
    pub status: String,
}

/// Progress of one Ultra kind, as polled by clients.
#[derive(Serialize, ToSchema)]
pub struct ProcessingResponse {
    pub kind: String,
    pub status: String,
    pub current_section: u32,
    pub total_sections: u32,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<ProcessingMetadata> for ProcessingResponse {
    fn from(meta: ProcessingMetadata) -> Self {
        Self {
            kind: meta.kind.as_str().to_string(),
            status: meta.status.as_str().to_string(),
            current_section: meta.current_section,
            total_sections: meta.total_sections,
            estimated_completion: meta.estimated_completion,
            // Failure details stay in the logs.
            last_error: meta.last_error.map(|_| "processing failed".to_string()),
            updated_at: meta.updated_at,
        }
    }
}

//=========================================================================================
// Helpers
//=========================================================================================

/// Loads a study session the caller owns. Other accounts' sessions read as missing.
pub(crate) async fn owned_session(
    state: &AppState,
    ctx: &AuthContext,
    session_id: Uuid,
) -> Result<StudySession, ApiError> {
    match state.db.get_study_session(session_id).await {
        Ok(session) if session.account_id == ctx.account_id => Ok(session),
        Ok(_) | Err(PortError::NotFound(_)) => Err(ApiError::NotFound),
        Err(e) => Err(e.into()),
    }
}

fn title_from_file_name(file_name: &str) -> String {
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name)
        .trim();
    if stem.is_empty() {
        "Untitled".to_string()
    } else {
        stem.to_string()
    }
}

//=========================================================================================
// Handlers
//=========================================================================================

/// Create a study session by uploading a document.
///
/// Accepts a multipart/form-data request with a `file` part (UTF-8 text) and
/// optional `language` and `title` parts.
#[utoipa::path(
    post,
    path = "/study-sessions",
    request_body(content_type = "multipart/form-data", description = "The document to study."),
    responses(
        (status = 201, description = "Study session created", body = StudySessionResponse),
        (status = 400, description = "Missing or unreadable file"),
        (status = 401, description = "Authentication required")
    )
)]
pub async fn create_study_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut document: Option<(String, String)> = None;
    let mut language = DEFAULT_LANGUAGE.to_string();
    let mut title: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read multipart data: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let name = field.file_name().unwrap_or("untitled.txt").to_string();
                let data = field.bytes().await.map_err(|e| {
                    ApiError::BadRequest(format!("Failed to read file bytes: {}", e))
                })?;
                let text = String::from_utf8(data.to_vec()).map_err(|_| {
                    ApiError::BadRequest("Uploaded file is not valid UTF-8 text".to_string())
                })?;
                document = Some((name, text));
            }
            "language" => {
                let value = field.text().await.map_err(|e| {
                    ApiError::BadRequest(format!("Failed to read language: {}", e))
                })?;
                if !value.trim().is_empty() {
                    language = value.trim().to_lowercase();
                }
            }
            "title" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read title: {}", e)))?;
                title = Some(value.trim().to_string()).filter(|t| !t.is_empty());
            }
            _ => {}
        }
    }

    let (file_name, text) = document
        .ok_or_else(|| ApiError::BadRequest("Multipart form must include a file".to_string()))?;
    if text.trim().is_empty() {
        return Err(ApiError::BadRequest("The uploaded document is empty".to_string()));
    }
    let title = title.unwrap_or_else(|| title_from_file_name(&file_name));

    let session = state
        .db
        .create_study_session(ctx.account_id, &title, &language, &text)
        .await?;
    info!(
        "Created study session {} ({} chars) for account {}",
        session.id,
        session.document_chars(),
        ctx.account_id
    );
    Ok((StatusCode::CREATED, Json(StudySessionResponse::from(session))))
}

/// List the caller's study sessions, newest first.
#[utoipa::path(
    get,
    path = "/study-sessions",
    responses(
        (status = 200, description = "Study sessions", body = [StudySessionListItem]),
        (status = 401, description = "Authentication required")
    )
)]
pub async fn list_study_sessions_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Vec<StudySessionListItem>>, ApiError> {
    let sessions = state.db.list_study_sessions(ctx.account_id).await?;
    Ok(Json(sessions.into_iter().map(Into::into).collect()))
}

/// Fetch one study session with every artifact generated so far.
#[utoipa::path(
    get,
    path = "/study-sessions/{id}",
    params(("id" = Uuid, Path, description = "Study session id")),
    responses(
        (status = 200, description = "Study session", body = StudySessionResponse),
        (status = 404, description = "No such study session")
    )
)]
pub async fn get_study_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<StudySessionResponse>, ApiError> {
    let session = owned_session(&state, &ctx, id).await?;
    Ok(Json(session.into()))
}

/// Generate one artifact over the session document.
///
/// The artifact's price is debited first. If the model cannot produce a usable
/// artifact a placeholder is stored instead; if nothing can be stored the debit
/// is refunded. The work finishes even if the client disconnects.
#[utoipa::path(
    post,
    path = "/study-sessions/{id}/artifacts/{kind}",
    params(
        ("id" = Uuid, Path, description = "Study session id"),
        ("kind" = String, Path, description = "summary, extended-summary, flashcards, quiz, concept-map or exam-guide")
    ),
    responses(
        (status = 200, description = "Generated artifact", body = ArtifactResponse),
        (status = 402, description = "Insufficient credits"),
        (status = 404, description = "No such study session or artifact kind")
    )
)]
pub async fn generate_artifact_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path((id, kind)): Path<(Uuid, String)>,
) -> Result<Json<ArtifactResponse>, ApiError> {
    let kind = ArtifactKind::from_slug(&kind).ok_or(ApiError::NotFound)?;
    let study = state.study.clone();
    let generated =
        run_detached(async move { study.generate_artifact(&ctx, id, kind).await }).await?;

    Ok(Json(ArtifactResponse {
        kind: generated.kind.slug().to_string(),
        artifact: generated.artifact,
        placeholder: generated.placeholder,
        balance: generated.balance,
    }))
}

/// Ask the tutor a question about the session document.
#[utoipa::path(
    post,
    path = "/study-sessions/{id}/tutor",
    params(("id" = Uuid, Path, description = "Study session id")),
    request_body = TutorRequest,
    responses(
        (status = 200, description = "Tutor answer", body = TutorResponse),
        (status = 400, description = "Empty question"),
        (status = 402, description = "Insufficient credits"),
        (status = 404, description = "No such study session")
    )
)]
pub async fn tutor_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(req): Json<TutorRequest>,
) -> Result<Json<TutorResponse>, ApiError> {
    let study = state.study.clone();
    let reply =
        run_detached(async move { study.ask_tutor(&ctx, id, &req.question).await }).await?;
    Ok(Json(TutorResponse {
        answer: reply.answer,
        placeholder: reply.placeholder,
        balance: reply.balance,
    }))
}

/// Queue a section-by-section Ultra job. Progress is read from `/processing`.
#[utoipa::path(
    post,
    path = "/study-sessions/{id}/ultra/{kind}",
    params(
        ("id" = Uuid, Path, description = "Study session id"),
        ("kind" = String, Path, description = "summary or concept-map")
    ),
    responses(
        (status = 202, description = "Job queued", body = UltraJobResponse),
        (status = 402, description = "Insufficient credits"),
        (status = 409, description = "Already running or completed")
    )
)]
pub async fn submit_ultra_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path((id, kind)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = UltraKind::from_slug(&kind).ok_or(ApiError::NotFound)?;
    let job = state.ultra.submit(&ctx, id, kind).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(UltraJobResponse {
            job_id: job.id,
            kind: kind.slug().to_string(),
            status: job.state.as_str().to_string(),
        }),
    ))
}

/// Poll the progress of the session's Ultra jobs.
#[utoipa::path(
    get,
    path = "/study-sessions/{id}/processing",
    params(("id" = Uuid, Path, description = "Study session id")),
    responses(
        (status = 200, description = "One entry per Ultra kind", body = [ProcessingResponse]),
        (status = 404, description = "No such study session")
    )
)]
pub async fn processing_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ProcessingResponse>>, ApiError> {
    let session = owned_session(&state, &ctx, id).await?;
    let processing = state.db.list_processing(session.id).await?;
    Ok(Json(processing.into_iter().map(Into::into).collect()))
}
