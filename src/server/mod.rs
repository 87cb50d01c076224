// Public HTTP API: buyer checkout, refunds, organizer Connect onboarding and
// earnings, and the admin payout console. Webhooks are served separately so
// their route sees the raw request body.

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::accounts::{AccountManager, AccountStatus, OnboardingStarted};
use crate::errors::Error;
use crate::ledger::{
    BuyerContact, EarningsSummary, IntentCreated, PaymentLedger, QuoteBreakdown,
};
use crate::payouts::{BatchItem, ExecutionOutcome, PayoutScheduler};
use crate::store::{Payout, PayoutMethod, PayoutStatus, Store, StoreError, Ticket};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<PaymentLedger>,
    pub payouts: Arc<PayoutScheduler>,
    pub accounts: Arc<AccountManager>,
    pub store: Arc<Store>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Store(StoreError::Missing(..)) => StatusCode::NOT_FOUND,
            Error::InvalidState(_) | Error::WrongFlow => StatusCode::BAD_REQUEST,
            Error::InsufficientInventory { .. } => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::FORBIDDEN,
            Error::Provider(_) => StatusCode::BAD_GATEWAY,
            Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Caller identity, injected by the platform's auth middleware upstream.
pub struct Caller(pub String);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            Some(id) => Ok(Caller(id.to_string())),
            None => Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    error: "missing caller identity".to_string(),
                }),
            )
                .into_response()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/payments/calculate", get(calculate_price))
        .route("/api/payments/create-intent", post(create_intent))
        .route("/api/payments/confirm", post(confirm_payment))
        .route("/api/payments/refund/{ticket_id}", post(refund_ticket))
        .route("/api/payments/earnings", get(earnings))
        .route("/api/connect/create", post(connect_create))
        .route("/api/connect/status", get(connect_status))
        .route("/api/connect/refresh-link", post(connect_refresh_link))
        .route("/api/admin/payouts", get(list_payouts))
        .route("/api/admin/payouts/run", post(run_payouts))
        .route(
            "/api/admin/events/{event_id}/payouts/run",
            post(run_event_payouts),
        )
        .route("/api/admin/payouts/{payout_id}/retry", post(retry_payout))
        .route(
            "/api/admin/payouts/{payout_id}/mark-paid",
            post(mark_payout_paid),
        )
        .route(
            "/api/admin/connect/{organizer_id}/migrate",
            post(migrate_organizer),
        )
        .route("/health", get(health_check))
        .with_state(state)
}

pub async fn run_server(port: u16, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting API server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

// ---- checkout ----

#[derive(Debug, Deserialize)]
struct CalculateQuery {
    event_id: String,
    #[serde(default = "default_quantity")]
    quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

async fn calculate_price(
    State(state): State<AppState>,
    Query(query): Query<CalculateQuery>,
) -> Result<Json<QuoteBreakdown>, ApiError> {
    Ok(Json(state.ledger.quote(&query.event_id, query.quantity)?))
}

#[derive(Debug, Deserialize)]
struct CreateIntentRequest {
    event_id: String,
    quantity: u32,
    #[serde(flatten)]
    contact: BuyerContact,
}

async fn create_intent(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<CreateIntentRequest>,
) -> Result<Json<IntentCreated>, ApiError> {
    let created = state
        .ledger
        .create_intent(&caller.0, &req.event_id, req.quantity, req.contact)
        .await?;
    Ok(Json(created))
}

#[derive(Debug, Deserialize)]
struct ConfirmRequest {
    payment_intent_id: String,
}

#[derive(Debug, Serialize)]
struct ConfirmResponse {
    tickets: Vec<Ticket>,
}

async fn confirm_payment(
    State(state): State<AppState>,
    _caller: Caller,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<ConfirmResponse>, ApiError> {
    let tickets = state.ledger.confirm(&req.payment_intent_id).await?;
    Ok(Json(ConfirmResponse { tickets }))
}

#[derive(Debug, Serialize)]
struct RefundResponse {
    refund_ref: String,
}

async fn refund_ticket(
    State(state): State<AppState>,
    caller: Caller,
    Path(ticket_id): Path<String>,
) -> Result<Json<RefundResponse>, ApiError> {
    let refund_ref = state.ledger.refund_ticket(&ticket_id, &caller.0).await?;
    Ok(Json(RefundResponse { refund_ref }))
}

async fn earnings(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<EarningsSummary>, ApiError> {
    Ok(Json(state.ledger.earnings_summary(&caller.0)?))
}

// ---- connect ----

#[derive(Debug, Deserialize)]
struct ConnectCreateRequest {
    email: String,
}

async fn connect_create(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<ConnectCreateRequest>,
) -> Result<Json<OnboardingStarted>, ApiError> {
    Ok(Json(
        state.accounts.create_account(&caller.0, &req.email).await?,
    ))
}

async fn connect_status(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<AccountStatus>, ApiError> {
    Ok(Json(state.accounts.sync_status(&caller.0).await?))
}

#[derive(Debug, Serialize)]
struct OnboardingLinkResponse {
    onboarding_url: String,
}

async fn connect_refresh_link(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<OnboardingLinkResponse>, ApiError> {
    let onboarding_url = state.accounts.onboarding_link(&caller.0).await?;
    Ok(Json(OnboardingLinkResponse { onboarding_url }))
}

// ---- admin payout console ----

#[derive(Debug, Deserialize)]
struct PayoutFilter {
    status: Option<PayoutStatus>,
    method: Option<PayoutMethod>,
}

#[derive(Debug, Default, Serialize)]
struct PayoutTotals {
    pending_count: usize,
    pending_amount: i64,
    paid_count: usize,
    paid_amount: i64,
}

#[derive(Debug, Serialize)]
struct PayoutListResponse {
    payouts: Vec<Payout>,
    totals: PayoutTotals,
}

async fn list_payouts(
    State(state): State<AppState>,
    Query(filter): Query<PayoutFilter>,
) -> Result<Json<PayoutListResponse>, ApiError> {
    let payouts = state
        .store
        .list_payouts(filter.status, filter.method)
        .map_err(Error::from)?;

    let mut totals = PayoutTotals::default();
    for payout in &payouts {
        match payout.status {
            PayoutStatus::Pending => {
                totals.pending_count += 1;
                totals.pending_amount += payout.amount;
            }
            PayoutStatus::Paid => {
                totals.paid_count += 1;
                totals.paid_amount += payout.amount;
            }
            _ => {}
        }
    }
    Ok(Json(PayoutListResponse { payouts, totals }))
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    processed: usize,
    results: Vec<BatchItem>,
}

async fn run_payouts(State(state): State<AppState>) -> Result<Json<BatchResponse>, ApiError> {
    let results = state.payouts.run_due(Utc::now()).await?;
    Ok(Json(BatchResponse {
        processed: results.len(),
        results,
    }))
}

async fn run_event_payouts(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<BatchResponse>, ApiError> {
    let results = state.payouts.run_due_for_event(&event_id, Utc::now()).await?;
    Ok(Json(BatchResponse {
        processed: results.len(),
        results,
    }))
}

async fn retry_payout(
    State(state): State<AppState>,
    Path(payout_id): Path<String>,
) -> Result<Json<ExecutionOutcome>, ApiError> {
    Ok(Json(state.payouts.retry(&payout_id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct MarkPaidRequest {
    note: Option<String>,
}

async fn mark_payout_paid(
    State(state): State<AppState>,
    caller: Caller,
    Path(payout_id): Path<String>,
    Json(req): Json<MarkPaidRequest>,
) -> Result<Json<Payout>, ApiError> {
    let payout = state
        .payouts
        .mark_manual_paid(&payout_id, &caller.0, req.note.as_deref())?;
    Ok(Json(payout))
}

#[derive(Debug, Serialize)]
struct MigrateResponse {
    migrated: usize,
}

async fn migrate_organizer(
    State(state): State<AppState>,
    Path(organizer_id): Path<String>,
) -> Result<Json<MigrateResponse>, ApiError> {
    let migrated = state.payouts.migrate_organizer_to_stripe(&organizer_id)?;
    Ok(Json(MigrateResponse { migrated }))
}
