//! services/api/src/web/rest.rs
//!
//! The master definition for the OpenAPI specification and the router that
//! wires every REST handler.

use axum::{
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use utoipa::OpenApi;

use crate::web::{auth, credits, middleware::require_auth, oral_exam, state::AppState, study};

/// Uploads and recorded answers are capped at this size.
const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        auth::signup_handler,
        auth::login_handler,
        auth::logout_handler,
        credits::account_handler,
        credits::transactions_handler,
        credits::payment_webhook_handler,
        study::create_study_session_handler,
        study::list_study_sessions_handler,
        study::get_study_session_handler,
        study::generate_artifact_handler,
        study::tutor_handler,
        study::submit_ultra_handler,
        study::processing_handler,
        oral_exam::open_oral_exam_handler,
        oral_exam::get_oral_exam_handler,
        oral_exam::start_oral_exam_handler,
        oral_exam::answer_oral_exam_handler,
        oral_exam::answer_audio_handler,
        oral_exam::finish_oral_exam_handler,
        oral_exam::restart_oral_exam_handler,
    ),
    components(
        schemas(
            auth::SignupRequest,
            auth::LoginRequest,
            auth::AuthResponse,
            credits::AccountResponse,
            credits::TransactionResponse,
            credits::PaymentWebhook,
            credits::PaymentWebhookResponse,
            study::StudySessionResponse,
            study::StudySessionListItem,
            study::ArtifactResponse,
            study::TutorRequest,
            study::TutorResponse,
            study::UltraJobResponse,
            study::ProcessingResponse,
            oral_exam::OpenOralExamRequest,
            oral_exam::AnswerRequest,
            oral_exam::TurnResponse,
            oral_exam::OralExamResponse,
            oral_exam::AudioAnswerResponse,
        )
    ),
    tags(
        (name = "Studius API", description = "Study sessions, generated study material, oral exams and credits.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// Router
//=========================================================================================

/// Builds the API router. CORS and Swagger UI are layered on by the binary.
pub fn router(state: Arc<AppState>) -> Router {
    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/auth/signup", post(auth::signup_handler))
        .route("/auth/login", post(auth::login_handler))
        .route("/auth/logout", post(auth::logout_handler))
        .route("/payments/webhook", post(credits::payment_webhook_handler));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/account", get(credits::account_handler))
        .route("/account/transactions", get(credits::transactions_handler))
        .route(
            "/study-sessions",
            post(study::create_study_session_handler).get(study::list_study_sessions_handler),
        )
        .route("/study-sessions/{id}", get(study::get_study_session_handler))
        .route(
            "/study-sessions/{id}/artifacts/{kind}",
            post(study::generate_artifact_handler),
        )
        .route("/study-sessions/{id}/tutor", post(study::tutor_handler))
        .route(
            "/study-sessions/{id}/ultra/{kind}",
            post(study::submit_ultra_handler),
        )
        .route(
            "/study-sessions/{id}/processing",
            get(study::processing_handler),
        )
        .route("/oral-exams", post(oral_exam::open_oral_exam_handler))
        .route("/oral-exams/{id}", get(oral_exam::get_oral_exam_handler))
        .route(
            "/oral-exams/{id}/start",
            post(oral_exam::start_oral_exam_handler),
        )
        .route(
            "/oral-exams/{id}/answer",
            post(oral_exam::answer_oral_exam_handler),
        )
        .route(
            "/oral-exams/{id}/answer-audio",
            post(oral_exam::answer_audio_handler),
        )
        .route(
            "/oral-exams/{id}/finish",
            post(oral_exam::finish_oral_exam_handler),
        )
        .route(
            "/oral-exams/{id}/restart",
            post(oral_exam::restart_oral_exam_handler),
        )
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_document_lists_every_route() {
        let doc = ApiDoc::openapi();
        for path in [
            "/auth/signup",
            "/payments/webhook",
            "/study-sessions/{id}/artifacts/{kind}",
            "/study-sessions/{id}/processing",
            "/oral-exams/{id}/answer-audio",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {}", path);
        }
    }
}
