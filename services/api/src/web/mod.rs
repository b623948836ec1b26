pub mod auth;
pub mod credits;
pub mod middleware;
pub mod oral_exam;
pub mod rest;
pub mod state;
pub mod study;

pub use middleware::require_auth;
pub use rest::{router, ApiDoc};
pub use state::AppState;

use std::future::Future;

use crate::error::ApiError;

/// Runs a paid operation on its own task and waits for it.
///
/// If the client disconnects, axum drops the handler future but not the task,
/// so a debit already taken is still either delivered or refunded.
pub(crate) async fn run_detached<T, E>(
    operation: impl Future<Output = Result<T, E>> + Send + 'static,
) -> Result<T, ApiError>
where
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    tokio::spawn(operation)
        .await
        .map_err(|e| ApiError::Internal(format!("detached operation aborted: {}", e)))?
        .map_err(Into::into)
}
