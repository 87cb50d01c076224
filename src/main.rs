mod accounts;
mod errors;
mod fees;
mod ledger;
mod payouts;
mod server;
mod settings;
mod store;
mod stripe;
mod webhook_server;

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::accounts::AccountManager;
use crate::fees::FeeSchedule;
use crate::ledger::PaymentLedger;
use crate::payouts::PayoutScheduler;
use crate::server::AppState;
use crate::store::Store;
use crate::stripe::webhook::Reconciler;
use crate::stripe::StripeProvider;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    // Load configuration from environment
    let cfg = settings::Config::from_env();

    // Validate Stripe configuration
    if cfg.stripe.api_key.is_empty() {
        tracing::error!("STRIPE_API_KEY not set; exiting");
        return Ok(());
    }
    tracing::info!("Starting payment and payout processor");

    let store = Arc::new(Store::open(&cfg.database_path)?);
    let provider = StripeProvider::new(cfg.stripe.clone())?;
    let api = provider.api();

    let ledger = Arc::new(PaymentLedger::new(
        Arc::clone(&store),
        Arc::clone(&api),
        FeeSchedule::new(cfg.platform_fee_cents),
    ));
    let payouts = Arc::new(PayoutScheduler::new(Arc::clone(&store), Arc::clone(&api)));
    let accounts = Arc::new(AccountManager::new(
        Arc::clone(&store),
        Arc::clone(&api),
        cfg.frontend_url.clone(),
    ));
    let reconciler = Reconciler {
        ledger: Arc::clone(&ledger),
        payouts: Arc::clone(&payouts),
        accounts: Arc::clone(&accounts),
        store: Arc::clone(&store),
    };

    // Start webhook HTTP server in background if webhook secret is configured
    if !provider.webhook_secret().is_empty() {
        let webhook_port = cfg.server_port + 1; // Use next port for webhooks
        let webhook_secret = provider.webhook_secret().to_string();
        let tolerance_seconds = provider.webhook_tolerance_seconds();
        let webhook_reconciler = reconciler.clone();

        tokio::spawn(async move {
            if let Err(e) = webhook_server::run_webhook_server(
                webhook_port,
                webhook_reconciler,
                webhook_secret,
                tolerance_seconds,
            )
            .await
            {
                tracing::error!("Webhook server failed: {}", e);
            }
        });

        tracing::info!(
            webhook_port = webhook_port,
            "Webhook HTTP server starting on port {}",
            webhook_port
        );
    } else {
        tracing::warn!("Webhook secret not configured - webhook server will not start");
    }

    // Periodic payout execution; the admin console can also trigger runs.
    if !cfg.payout_poll_interval.is_zero() {
        let poll_payouts = Arc::clone(&payouts);
        let poll_interval = cfg.payout_poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match poll_payouts.run_due(Utc::now()).await {
                    Ok(results) if !results.is_empty() => {
                        tracing::info!(processed = results.len(), "scheduled payout run complete");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("scheduled payout run failed: {}", e),
                }
            }
        });
        tracing::info!(
            interval = %humantime::format_duration(cfg.payout_poll_interval),
            "payout scheduler running"
        );
    }

    let state = AppState {
        ledger,
        payouts,
        accounts,
        store,
    };
    server::run_server(cfg.server_port, state).await?;

    Ok(())
}
