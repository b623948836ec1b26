//! End-to-end checks of the HTTP surface over the in-memory store.

use api_lib::config::Config;
use api_lib::web::{router, state::AppState};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use studius_core::ports::{LanguageModelService, PortResult, SpeechToTextService};
use studius_core::InMemoryStore;
use tower::ServiceExt;
use tracing::Level;

const WEBHOOK_SECRET: &str = "whsec_test";
const SUPPORT: &str = "help@studius.test";
const BOUNDARY: &str = "studius-boundary";

struct FixedModel(&'static str);

#[async_trait]
impl LanguageModelService for FixedModel {
    async fn complete(&self, _instructions: &str, _input: &str) -> PortResult<String> {
        Ok(self.0.to_string())
    }
}

/// Answers like `FixedModel`, after a delay.
struct SlowModel(&'static str, Duration);

#[async_trait]
impl LanguageModelService for SlowModel {
    async fn complete(&self, _instructions: &str, _input: &str) -> PortResult<String> {
        tokio::time::sleep(self.1).await;
        Ok(self.0.to_string())
    }
}

struct FixedTranscriber(&'static str);

#[async_trait]
impl SpeechToTextService for FixedTranscriber {
    async fn transcribe_audio(&self, _audio_data: &[u8]) -> PortResult<String> {
        Ok(self.0.to_string())
    }
}

fn config(starting_credits: i64) -> Config {
    Config {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        database_url: "postgres://unused".to_string(),
        log_level: Level::INFO,
        openai_api_key: None,
        study_model: "test-study".to_string(),
        exam_model: "test-exam".to_string(),
        sst_model: "test-sst".to_string(),
        starting_credits,
        ultra_section_delay: Duration::ZERO,
        ultra_section_timeout: Duration::from_secs(5),
        worker_poll_interval: Duration::from_millis(10),
        job_lease: Duration::from_secs(60),
        payment_webhook_secret: WEBHOOK_SECRET.to_string(),
        cors_origin: "http://localhost:3000".to_string(),
        support_email: SUPPORT.to_string(),
    }
}

const SUMMARY_REPLY: &str =
    r#"{"title": "Termodinamica", "content": "Il calore passa dal corpo caldo a quello freddo."}"#;

fn app(starting_credits: i64) -> Router {
    app_with(starting_credits, Arc::new(FixedModel(SUMMARY_REPLY)))
}

fn app_with(starting_credits: i64, study: Arc<dyn LanguageModelService>) -> Router {
    let exam = Arc::new(FixedModel(
        r#"{"question": "Che cosa afferma il primo principio?", "evaluation": "Corretta.", "score": 27, "next_question": "E il secondo?"}"#,
    ));
    let state = AppState::new(
        Arc::new(config(starting_credits)),
        Arc::new(InMemoryStore::new()),
        study,
        exam,
        Arc::new(FixedTranscriber("L'energia si conserva.")),
    );
    router(Arc::new(state))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, token: &str) -> Request<Body> {
    Request::get(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

async fn signup(app: &Router, email: &str) -> (String, String) {
    let (status, body) = send(
        app,
        post_json(
            "/auth/signup",
            None,
            json!({ "email": email, "password": "correct horse" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    (
        body["token"].as_str().unwrap().to_string(),
        body["account_id"].as_str().unwrap().to_string(),
    )
}

async fn upload(app: &Router, token: &str, text: &str) -> String {
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"fisica.txt\"\r\n\
         Content-Type: text/plain\r\n\r\n{text}\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"language\"\r\n\r\nit\r\n\
         --{b}--\r\n",
        b = BOUNDARY,
        text = text
    );
    let request = Request::post("/study-sessions")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap();
    let (status, body) = send(app, request).await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["title"], "fisica");
    assert_eq!(body["language"], "it");
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn protected_routes_require_a_token() {
    let app = app(120);
    let request = Request::get("/account").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["support"], SUPPORT);

    let (status, _) = send(&app, get("/account", "not-a-token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signup_login_and_logout() {
    let app = app(120);
    let (token, account_id) = signup(&app, "anna@example.com").await;

    let (status, body) = send(&app, get("/account", &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["account_id"], account_id.as_str());
    assert_eq!(body["balance"], 120);
    assert_eq!(body["free_oral_exam_available"], true);

    let (status, _) = send(
        &app,
        post_json("/auth/signup", None, json!({ "email": "ANNA@example.com", "password": "another one" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        post_json("/auth/login", None, json!({ "email": "anna@example.com", "password": "wrong password" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &app,
        post_json("/auth/login", None, json!({ "email": "anna@example.com", "password": "correct horse" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let second = body["token"].as_str().unwrap().to_string();

    let (status, _) = send(&app, post_json("/auth/logout", Some(&token), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, get("/account", &token)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app, get("/account", &second)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn artifact_generation_debits_and_is_stored() {
    let app = app(120);
    let (token, _) = signup(&app, "marco@example.com").await;
    let session_id = upload(&app, &token, "Il primo principio della termodinamica.").await;

    let (status, body) = send(
        &app,
        post_json(&format!("/study-sessions/{}/artifacts/summary", session_id), Some(&token), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["placeholder"], false);
    assert_eq!(body["balance"], 110);
    assert_eq!(body["artifact"]["title"], "Termodinamica");

    let (_, session) = send(&app, get(&format!("/study-sessions/{}", session_id), &token)).await;
    assert_eq!(session["artifacts"]["summary"]["title"], "Termodinamica");
    assert!(session["artifacts"]["quiz"].is_null());

    let (status, _) = send(
        &app,
        post_json(&format!("/study-sessions/{}/artifacts/poem", session_id), Some(&token), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, ledger) = send(&app, get("/account/transactions", &token)).await;
    let kinds: Vec<&str> = ledger
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["summary", "welcome"]);
}

#[tokio::test]
async fn insufficient_credits_reports_required_and_available() {
    let app = app(5);
    let (token, _) = signup(&app, "povero@example.com").await;
    let session_id = upload(&app, &token, "Testo breve.").await;

    let (status, body) = send(
        &app,
        post_json(&format!("/study-sessions/{}/artifacts/summary", session_id), Some(&token), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["required"], 10);
    assert_eq!(body["available"], 5);
    assert_eq!(body["support"], SUPPORT);
}

#[tokio::test]
async fn other_accounts_cannot_see_a_study_session() {
    let app = app(120);
    let (owner, _) = signup(&app, "owner@example.com").await;
    let (intruder, _) = signup(&app, "intruder@example.com").await;
    let session_id = upload(&app, &owner, "Appunti privati.").await;

    let (status, _) = send(&app, get(&format!("/study-sessions/{}", session_id), &intruder)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, list) = send(&app, get("/study-sessions", &intruder)).await;
    assert_eq!(list.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn payment_webhook_credits_each_event_once() {
    let app = app(120);
    let (token, account_id) = signup(&app, "cliente@example.com").await;
    let payload = json!({
        "event_id": "evt_1",
        "provider": "stripe",
        "account_id": account_id,
        "plan": "pro",
    });

    let unsigned = post_json("/payments/webhook", None, payload.clone());
    let (status, _) = send(&app, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let signed = || {
        Request::post("/payments/webhook")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-webhook-secret", WEBHOOK_SECRET)
            .body(Body::from(payload.to_string()))
            .unwrap()
    };
    let (status, body) = send(&app, signed()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["credited"], true);
    assert_eq!(body["balance"], 620);

    let (_, body) = send(&app, signed()).await;
    assert_eq!(body["credited"], false);
    let (_, account) = send(&app, get("/account", &token)).await;
    assert_eq!(account["balance"], 620);
}

#[tokio::test]
async fn ultra_submission_is_accepted_and_pollable() {
    let app = app(120);
    let (token, _) = signup(&app, "ultra@example.com").await;
    let session_id = upload(&app, &token, "Capitolo uno. Capitolo due. Capitolo tre.").await;

    let uri = format!("/study-sessions/{}/ultra/concept-map", session_id);
    let (status, body) = send(&app, post_json(&uri, Some(&token), json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED, "{}", body);
    assert_eq!(body["status"], "queued");

    let (status, _) = send(&app, post_json(&uri, Some(&token), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, processing) = send(
        &app,
        get(&format!("/study-sessions/{}/processing", session_id), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(processing.as_array().unwrap().len(), 2);

    // 120 - 30, the rejected duplicate was refunded
    let (_, account) = send(&app, get("/account", &token)).await;
    assert_eq!(account["balance"], 90);
}

#[tokio::test]
async fn first_oral_exam_is_free_and_answers_are_graded() {
    let app = app(120);
    let (token, _) = signup(&app, "esame@example.com").await;
    let session_id = upload(&app, &token, "Il primo principio della termodinamica.").await;

    let (status, exam) = send(
        &app,
        post_json("/oral-exams", Some(&token), json!({ "study_session_id": session_id })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(exam["status"], "idle");
    let exam_id = exam["id"].as_str().unwrap().to_string();

    let (status, exam) = send(
        &app,
        post_json(&format!("/oral-exams/{}/start", exam_id), Some(&token), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", exam);
    assert_eq!(exam["free"], true);
    assert_eq!(exam["turns"][0]["question"], "Che cosa afferma il primo principio?");

    let request = Request::post(format!("/oral-exams/{}/answer-audio", exam_id))
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(vec![0u8; 64]))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["transcript"], "L'energia si conserva.");
    assert_eq!(body["exam"]["turns"][0]["score"], 27);
    assert_eq!(body["exam"]["turns"][1]["question"], "E il secondo?");

    let (status, _) = send(
        &app,
        post_json(&format!("/oral-exams/{}/start", exam_id), Some(&token), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, account) = send(&app, get("/account", &token)).await;
    assert_eq!(account["balance"], 120);
    assert_eq!(account["free_oral_exam_available"], false);
}

#[tokio::test]
async fn a_paid_artifact_is_stored_after_the_client_disconnects() {
    let app = app_with(
        120,
        Arc::new(SlowModel(SUMMARY_REPLY, Duration::from_millis(100))),
    );
    let (token, _) = signup(&app, "impaziente@example.com").await;
    let session_id = upload(&app, &token, "Il primo principio della termodinamica.").await;

    let request = post_json(
        &format!("/study-sessions/{}/artifacts/summary", session_id),
        Some(&token),
        json!({}),
    );
    let abandoned = tokio::time::timeout(Duration::from_millis(20), app.clone().oneshot(request)).await;
    assert!(abandoned.is_err(), "the request should still have been running");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let (_, session) = send(&app, get(&format!("/study-sessions/{}", session_id), &token)).await;
    assert_eq!(session["artifacts"]["summary"]["title"], "Termodinamica");
    let (_, account) = send(&app, get("/account", &token)).await;
    assert_eq!(account["balance"], 110);
}

#[tokio::test]
async fn a_replayed_answer_is_refused() {
    let app = app(120);
    let (token, _) = signup(&app, "ripeti@example.com").await;
    let session_id = upload(&app, &token, "Il primo principio della termodinamica.").await;
    let (_, exam) = send(
        &app,
        post_json("/oral-exams", Some(&token), json!({ "study_session_id": session_id })),
    )
    .await;
    let exam_id = exam["id"].as_str().unwrap().to_string();
    let (_, exam) = send(
        &app,
        post_json(&format!("/oral-exams/{}/start", exam_id), Some(&token), json!({})),
    )
    .await;
    let answer = json!({ "answer": "L'energia si conserva.", "revision": exam["revision"] });

    let (status, answered) = send(
        &app,
        post_json(&format!("/oral-exams/{}/answer", exam_id), Some(&token), answer.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", answered);

    let (status, _) = send(
        &app,
        post_json(&format!("/oral-exams/{}/answer", exam_id), Some(&token), answer),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, stored) = send(&app, get(&format!("/oral-exams/{}", exam_id), &token)).await;
    assert_eq!(stored["revision"], answered["revision"]);
    assert!(stored["turns"][1]["answer"].is_null());
}
