//! services/api/src/web/oral_exam.rs
//!
//! Oral exam endpoints. Every transition goes through `OralExamService`, which
//! owns the state machine and the billing rules.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use studius_core::domain::OralExamTurn;
use studius_core::{AuthContext, OralExamMode, OralExamSession};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiError;
use crate::web::run_detached;
use crate::web::state::AppState;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct OpenOralExamRequest {
    pub study_session_id: Uuid,
    /// `standard` (default) or `ultra`.
    #[schema(value_type = Option<String>, example = "standard")]
    pub mode: Option<OralExamMode>,
}

#[derive(Deserialize, ToSchema)]
pub struct AnswerRequest {
    pub answer: String,
    /// The `revision` the client last saw. A replayed answer whose revision
    /// has moved on is refused with 409.
    pub revision: Option<i64>,
}

#[derive(Deserialize)]
pub struct AudioAnswerParams {
    pub revision: Option<i64>,
}

#[derive(Serialize, ToSchema)]
pub struct TurnResponse {
    pub question: String,
    pub answer: Option<String>,
    pub evaluation: Option<String>,
    /// Grade on the 0-30 scale.
    pub score: Option<u8>,
}

impl From<OralExamTurn> for TurnResponse {
    fn from(turn: OralExamTurn) -> Self {
        Self {
            question: turn.question,
            answer: turn.answer,
            evaluation: turn.evaluation,
            score: turn.score,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct OralExamResponse {
    pub id: Uuid,
    pub study_session_id: Uuid,
    pub mode: String,
    pub status: String,
    pub max_questions: usize,
    pub turns: Vec<TurnResponse>,
    pub free: bool,
    pub final_evaluation: Option<String>,
    pub final_score: Option<u8>,
    pub revision: i64,
    pub updated_at: DateTime<Utc>,
}

impl From<OralExamSession> for OralExamResponse {
    fn from(exam: OralExamSession) -> Self {
        Self {
            id: exam.id,
            study_session_id: exam.study_session_id,
            mode: exam.mode.as_str().to_string(),
            status: exam.status.as_str().to_string(),
            max_questions: exam.mode.max_questions(),
            turns: exam.turns.into_iter().map(Into::into).collect(),
            free: exam.free,
            final_evaluation: exam.final_evaluation,
            final_score: exam.final_score,
            revision: exam.revision,
            updated_at: exam.updated_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct AudioAnswerResponse {
    /// What the recording was understood to say.
    pub transcript: String,
    pub exam: OralExamResponse,
}

//=========================================================================================
// Handlers
//=========================================================================================

/// Open an idle oral exam over one of the caller's study sessions.
#[utoipa::path(
    post,
    path = "/oral-exams",
    request_body = OpenOralExamRequest,
    responses(
        (status = 201, description = "Oral exam opened", body = OralExamResponse),
        (status = 404, description = "No such study session")
    )
)]
pub async fn open_oral_exam_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<OpenOralExamRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mode = req.mode.unwrap_or(OralExamMode::Standard);
    let exam = state
        .oral_exams
        .open(&ctx, req.study_session_id, mode)
        .await?;
    Ok((StatusCode::CREATED, Json(OralExamResponse::from(exam))))
}

#[utoipa::path(
    get,
    path = "/oral-exams/{id}",
    params(("id" = Uuid, Path, description = "Oral exam id")),
    responses(
        (status = 200, description = "Oral exam", body = OralExamResponse),
        (status = 404, description = "No such oral exam")
    )
)]
pub async fn get_oral_exam_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<OralExamResponse>, ApiError> {
    Ok(Json(state.oral_exams.get(&ctx, id).await?.into()))
}

/// Start the exam and receive the first question. The account's first
/// standard exam is free; every other start is charged. A start that was paid
/// for completes even if the client disconnects.
#[utoipa::path(
    post,
    path = "/oral-exams/{id}/start",
    params(("id" = Uuid, Path, description = "Oral exam id")),
    responses(
        (status = 200, description = "Exam started", body = OralExamResponse),
        (status = 402, description = "Insufficient credits"),
        (status = 409, description = "Exam is not idle")
    )
)]
pub async fn start_oral_exam_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<OralExamResponse>, ApiError> {
    let oral_exams = state.oral_exams.clone();
    let exam = run_detached(async move { oral_exams.start(&ctx, id).await }).await?;
    Ok(Json(exam.into()))
}

/// Answer the open question in writing.
#[utoipa::path(
    post,
    path = "/oral-exams/{id}/answer",
    params(("id" = Uuid, Path, description = "Oral exam id")),
    request_body = AnswerRequest,
    responses(
        (status = 200, description = "Answer graded", body = OralExamResponse),
        (status = 400, description = "Empty answer"),
        (status = 409, description = "No question is waiting for an answer, or the exam moved past `revision`")
    )
)]
pub async fn answer_oral_exam_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<OralExamResponse>, ApiError> {
    let exam = state
        .oral_exams
        .answer(&ctx, id, &req.answer, req.revision)
        .await?;
    Ok(Json(exam.into()))
}

/// Answer the open question out loud. The body is raw 16-bit mono PCM.
#[utoipa::path(
    post,
    path = "/oral-exams/{id}/answer-audio",
    params(
        ("id" = Uuid, Path, description = "Oral exam id"),
        ("revision" = Option<i64>, Query, description = "Revision the client last saw")
    ),
    request_body(content_type = "application/octet-stream", description = "Raw PCM16 audio."),
    responses(
        (status = 200, description = "Answer transcribed and graded", body = AudioAnswerResponse),
        (status = 400, description = "Nothing could be understood in the recording")
    )
)]
pub async fn answer_audio_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Query(params): Query<AudioAnswerParams>,
    body: Bytes,
) -> Result<Json<AudioAnswerResponse>, ApiError> {
    // Ownership is checked before anything is transcribed.
    state.oral_exams.get(&ctx, id).await?;

    let transcript = state.stt.transcribe_audio(&body).await?;
    let transcript = transcript.trim().to_string();
    if transcript.is_empty() {
        return Err(ApiError::BadRequest(
            "Nothing could be understood in the recording".to_string(),
        ));
    }
    info!("Transcribed a {}-byte spoken answer for oral exam {}", body.len(), id);

    let exam = state
        .oral_exams
        .answer(&ctx, id, &transcript, params.revision)
        .await?;
    Ok(Json(AudioAnswerResponse {
        transcript,
        exam: exam.into(),
    }))
}

/// Close the exam with an overall evaluation and grade.
#[utoipa::path(
    post,
    path = "/oral-exams/{id}/finish",
    params(("id" = Uuid, Path, description = "Oral exam id")),
    responses(
        (status = 200, description = "Exam completed", body = OralExamResponse),
        (status = 409, description = "Exam is not in progress")
    )
)]
pub async fn finish_oral_exam_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<OralExamResponse>, ApiError> {
    Ok(Json(state.oral_exams.finish(&ctx, id).await?.into()))
}

/// Return the exam to idle. Starting it again is charged.
#[utoipa::path(
    post,
    path = "/oral-exams/{id}/restart",
    params(("id" = Uuid, Path, description = "Oral exam id")),
    responses(
        (status = 200, description = "Exam reset", body = OralExamResponse)
    )
)]
pub async fn restart_oral_exam_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<OralExamResponse>, ApiError> {
    Ok(Json(state.oral_exams.restart(&ctx, id).await?.into()))
}
