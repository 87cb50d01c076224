// HTTP webhook server for Stripe webhook events.
//
// Runs apart from the API server so this route can take the raw request body;
// signature verification covers the exact bytes Stripe signed, and any
// intermediate JSON re-serialization would invalidate it.

use crate::stripe::errors::WebhookError;
use crate::stripe::webhook::{self, Reconciler};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};
use std::net::SocketAddr;
use tracing::{error, info};

#[derive(Clone)]
pub struct WebhookState {
    pub reconciler: Reconciler,
    pub webhook_secret: String,
    pub tolerance_seconds: i64,
}

pub async fn run_webhook_server(
    port: u16,
    reconciler: Reconciler,
    webhook_secret: String,
    tolerance_seconds: i64,
) -> anyhow::Result<()> {
    let state = WebhookState {
        reconciler,
        webhook_secret,
        tolerance_seconds,
    };

    let app = Router::new()
        .route("/stripe/webhook", post(handle_stripe_webhook))
        .route("/health", axum::routing::get(health_check))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting webhook HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn handle_stripe_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    match webhook::handle_webhook(
        &body,
        &headers,
        &state.webhook_secret,
        state.tolerance_seconds,
        &state.reconciler,
    )
    .await
    {
        Ok(()) => (StatusCode::OK, "OK".to_string()),
        Err(e) => {
            error!("Webhook rejected: {}", e);
            let status_code = match e {
                WebhookError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
                WebhookError::MissingSignature => StatusCode::UNAUTHORIZED,
                WebhookError::TimestampTolerance(_) => StatusCode::BAD_REQUEST,
                WebhookError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
                WebhookError::MissingSecret => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status_code, e.to_string())
        }
    }
}
