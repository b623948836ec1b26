//! services/api/src/web/credits.rs
//!
//! Account balance, ledger history and the payment processor callback.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use studius_core::{AuthContext, CreditTransaction, PaymentEvent, PaymentProvider, Plan};
use tracing::warn;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::error::ApiError;
use crate::web::state::AppState;

pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";
const DEFAULT_TRANSACTION_LIMIT: usize = 50;
const MAX_TRANSACTION_LIMIT: usize = 500;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Serialize, ToSchema)]
pub struct AccountResponse {
    pub account_id: Uuid,
    pub email: String,
    pub balance: i64,
    /// Whether the next standard oral exam will be free.
    pub free_oral_exam_available: bool,
}

#[derive(Serialize, ToSchema)]
pub struct TransactionResponse {
    pub id: Uuid,
    /// e.g. `welcome`, `quiz`, `purchase:pro`, `refund:ultra_summary`.
    pub kind: String,
    pub delta: i64,
    pub created_at: DateTime<Utc>,
}

impl From<CreditTransaction> for TransactionResponse {
    fn from(tx: CreditTransaction) -> Self {
        Self {
            id: tx.id,
            kind: tx.kind.encode(),
            delta: tx.delta,
            created_at: tx.created_at,
        }
    }
}

#[derive(Deserialize, IntoParams)]
pub struct TransactionsQuery {
    pub limit: Option<usize>,
}

/// A confirmed payment, as forwarded by the payment integration.
#[derive(Deserialize, ToSchema)]
pub struct PaymentWebhook {
    pub event_id: String,
    #[schema(value_type = String, example = "stripe")]
    pub provider: PaymentProvider,
    pub account_id: Uuid,
    #[schema(value_type = String, example = "pro")]
    pub plan: Plan,
}

#[derive(Serialize, ToSchema)]
pub struct PaymentWebhookResponse {
    /// `false` when this event had already been credited.
    pub credited: bool,
    pub balance: Option<i64>,
}

//=========================================================================================
// Handlers
//=========================================================================================

/// The caller's account and credit balance.
#[utoipa::path(
    get,
    path = "/account",
    responses(
        (status = 200, description = "Account", body = AccountResponse),
        (status = 401, description = "Authentication required")
    )
)]
pub async fn account_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<AccountResponse>, ApiError> {
    let account = state.db.get_account(ctx.account_id).await?;
    Ok(Json(AccountResponse {
        account_id: account.id,
        email: account.email,
        balance: account.balance,
        free_oral_exam_available: !account.free_oral_exam_used,
    }))
}

/// The caller's ledger, newest entry first.
#[utoipa::path(
    get,
    path = "/account/transactions",
    params(TransactionsQuery),
    responses(
        (status = 200, description = "Ledger entries", body = [TransactionResponse]),
        (status = 401, description = "Authentication required")
    )
)]
pub async fn transactions_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<Vec<TransactionResponse>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TRANSACTION_LIMIT)
        .clamp(1, MAX_TRANSACTION_LIMIT);
    let transactions = state.db.list_transactions(ctx.account_id, limit).await?;
    Ok(Json(transactions.into_iter().map(Into::into).collect()))
}

/// Credits a plan purchase. Each `event_id` is credited at most once, so
/// processors may safely deliver the same callback again.
#[utoipa::path(
    post,
    path = "/payments/webhook",
    request_body = PaymentWebhook,
    params(("x-webhook-secret" = String, Header, description = "Shared webhook secret")),
    responses(
        (status = 200, description = "Payment processed", body = PaymentWebhookResponse),
        (status = 401, description = "Bad or missing secret"),
        (status = 404, description = "Unknown account")
    )
)]
pub async fn payment_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<PaymentWebhook>,
) -> Result<Json<PaymentWebhookResponse>, ApiError> {
    let secret = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if secret.is_empty() || secret != state.config.payment_webhook_secret {
        warn!("Rejected payment callback {} with a bad secret", payload.event_id);
        return Err(ApiError::Unauthorized);
    }
    if payload.event_id.trim().is_empty() {
        return Err(ApiError::BadRequest("event_id is required".to_string()));
    }

    let event = PaymentEvent {
        event_id: payload.event_id,
        provider: payload.provider,
        account_id: payload.account_id,
        plan: payload.plan,
    };
    let balance = state.ledger.credit_purchase(&event).await?;
    Ok(Json(PaymentWebhookResponse {
        credited: balance.is_some(),
        balance,
    }))
}
