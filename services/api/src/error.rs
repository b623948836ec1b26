//! services/api/src/error.rs
//!
//! Defines the primary error type for the entire API service and how it is
//! rendered to clients. Clients only ever see a short generic message plus a
//! support contact; the detailed error goes to the logs.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::OnceLock;
use studius_core::ports::PortError;
use studius_core::{LedgerError, OralExamError, StudyError, UltraError};
use tracing::{error, warn};

use crate::config::ConfigError;

const DEFAULT_SUPPORT_CONTACT: &str = "support@studius.ai";

static SUPPORT_CONTACT: OnceLock<String> = OnceLock::new();

/// Sets the contact shown in error bodies. Only the first call has an effect.
pub fn set_support_contact(email: &str) {
    let _ = SUPPORT_CONTACT.set(email.to_string());
}

fn support_contact() -> &'static str {
    SUPPORT_CONTACT
        .get()
        .map(String::as_str)
        .unwrap_or(DEFAULT_SUPPORT_CONTACT)
}

/// The primary error type for the `api` service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    /// Represents a standard Input/Output error (e.g., binding to a network socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found")]
    NotFound,

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Not a failure of the service: the caller should buy more credits.
    #[error("Insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: i64, available: i64 },

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::Port(PortError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Port(PortError::Unauthorized) => StatusCode::UNAUTHORIZED,
            ApiError::Port(PortError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Port(PortError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The text a client is allowed to see.
    fn public_message(&self) -> String {
        match self {
            ApiError::Unauthorized | ApiError::Port(PortError::Unauthorized) => {
                "Authentication required".to_string()
            }
            ApiError::BadRequest(reason) => reason.clone(),
            ApiError::NotFound | ApiError::Port(PortError::NotFound(_)) => {
                "Not found".to_string()
            }
            ApiError::Conflict(reason) | ApiError::Port(PortError::Conflict(reason)) => {
                reason.clone()
            }
            ApiError::InsufficientCredits { .. } => "Insufficient credits".to_string(),
            ApiError::Port(PortError::Unavailable(_)) => {
                "The service is temporarily unavailable, please try again shortly".to_string()
            }
            _ => "Something went wrong, please try again later".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else if status != StatusCode::PAYMENT_REQUIRED {
            warn!("Request rejected ({}): {}", status, self);
        }

        let mut body = json!({
            "error": self.public_message(),
            "support": support_contact(),
        });
        if let ApiError::InsufficientCredits {
            required,
            available,
        } = self
        {
            body["required"] = json!(required);
            body["available"] = json!(available);
        }
        (status, Json(body)).into_response()
    }
}

//=========================================================================================
// Conversions from Core Errors
//=========================================================================================

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredits {
                required,
                available,
            } => ApiError::InsufficientCredits {
                required,
                available,
            },
            LedgerError::Port(e) => ApiError::Port(e),
        }
    }
}

impl From<UltraError> for ApiError {
    fn from(err: UltraError) -> Self {
        match err {
            UltraError::SessionNotFound(_) => ApiError::NotFound,
            UltraError::MissingDocument(_) => {
                ApiError::BadRequest("The study session has no document text".to_string())
            }
            UltraError::Ledger(e) => e.into(),
            UltraError::Port(e) => ApiError::Port(e),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StudyError> for ApiError {
    fn from(err: StudyError) -> Self {
        match err {
            StudyError::NotFound(_) => ApiError::NotFound,
            StudyError::MissingDocument => {
                ApiError::BadRequest("The study session has no document text".to_string())
            }
            StudyError::EmptyQuestion => ApiError::BadRequest("The question is empty".to_string()),
            StudyError::InsufficientCredits {
                required,
                available,
            } => ApiError::InsufficientCredits {
                required,
                available,
            },
            StudyError::Port(e) => ApiError::Port(e),
        }
    }
}

impl From<OralExamError> for ApiError {
    fn from(err: OralExamError) -> Self {
        match err {
            OralExamError::NotOwner => ApiError::NotFound,
            OralExamError::InsufficientCredits {
                required,
                available,
            } => ApiError::InsufficientCredits {
                required,
                available,
            },
            e @ OralExamError::EmptyAnswer => ApiError::BadRequest(e.to_string()),
            e @ (OralExamError::InvalidState { .. }
            | OralExamError::NoOpenQuestion
            | OralExamError::Stale { .. }) => {
                ApiError::Conflict(e.to_string())
            }
            OralExamError::Port(e) => ApiError::Port(e),
        }
    }
}
