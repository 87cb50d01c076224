// Stripe webhook handling with signature verification and event processing.
//
// The webhook is the source of truth for payment and payout state: every
// handler here is safe to run more than once for the same event, because the
// provider redelivers. Handler-internal failures are logged and the event is
// still acknowledged; signalling failure would only trigger a redelivery
// storm for an event we will never be able to process. The one exception is
// signature verification, which rejects before any handler runs.

use anyhow::Result;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};

use crate::accounts::AccountManager;
use crate::ledger::PaymentLedger;
use crate::payouts::PayoutScheduler;
use crate::store::Store;
use crate::stripe::errors::WebhookError;
use crate::stripe::types::{Account, Charge, PaymentIntent, StripeEvent, Transfer};

/// Everything webhook events can drive.
#[derive(Clone)]
pub struct Reconciler {
    pub ledger: Arc<PaymentLedger>,
    pub payouts: Arc<PayoutScheduler>,
    pub accounts: Arc<AccountManager>,
    pub store: Arc<Store>,
}

/// Main webhook handler - verifies signature and processes event
#[instrument(skip(payload, headers, webhook_secret, reconciler))]
pub async fn handle_webhook(
    payload: &[u8],
    headers: &http::HeaderMap,
    webhook_secret: &str,
    tolerance_seconds: i64,
    reconciler: &Reconciler,
) -> Result<(), WebhookError> {
    // Verify signature
    verify_signature(payload, headers, webhook_secret, tolerance_seconds)?;

    // Parse event
    let evt: StripeEvent = serde_json::from_slice(payload)
        .map_err(|e| WebhookError::MalformedPayload(format!("JSON parse error: {}", e)))?;

    // Process event
    process_event(&evt, reconciler).await;

    Ok(())
}

/// Verify Stripe webhook signature using HMAC SHA-256
pub fn verify_signature(
    payload: &[u8],
    headers: &http::HeaderMap,
    webhook_secret: &str,
    tolerance_seconds: i64,
) -> Result<(), WebhookError> {
    if webhook_secret.is_empty() {
        return Err(WebhookError::MissingSecret);
    }

    // Extract Stripe-Signature header
    let signature_header = headers
        .get("stripe-signature")
        .or_else(|| headers.get("Stripe-Signature"))
        .ok_or(WebhookError::MissingSignature)?
        .to_str()
        .map_err(|e| WebhookError::InvalidSignature(format!("Invalid header encoding: {}", e)))?;

    // Parse signature header: t=timestamp,v1=signature[,v1=signature2,...]
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() != 2 {
            continue;
        }
        match kv[0] {
            "t" => {
                timestamp = kv[1].parse().ok();
            }
            "v1" => {
                signatures.push(kv[1]);
            }
            _ => {} // Ignore unknown fields
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        WebhookError::InvalidSignature("Missing timestamp in signature header".to_string())
    })?;

    if signatures.is_empty() {
        return Err(WebhookError::InvalidSignature(
            "No v1 signature found".to_string(),
        ));
    }

    // Check timestamp tolerance
    let current_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| WebhookError::InvalidSignature(format!("System time error: {}", e)))?
        .as_secs() as i64;

    let time_diff = (current_time - timestamp).abs();
    if time_diff > tolerance_seconds {
        return Err(WebhookError::TimestampTolerance(format!(
            "Timestamp {} differs from current time {} by {} seconds (tolerance: {})",
            timestamp, current_time, time_diff, tolerance_seconds
        )));
    }

    // Construct signed payload: timestamp.payload
    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));

    // Compute expected signature using HMAC-SHA256
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
        .map_err(|e| WebhookError::InvalidSignature(format!("HMAC init error: {}", e)))?;
    mac.update(signed_payload.as_bytes());
    let expected_signature = hex::encode(mac.finalize().into_bytes());

    // Compare with provided signatures (constant-time comparison)
    let signature_valid = signatures.iter().any(|sig| {
        expected_signature.as_bytes().len() == sig.as_bytes().len()
            && expected_signature
                .as_bytes()
                .iter()
                .zip(sig.as_bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    });

    if !signature_valid {
        return Err(WebhookError::InvalidSignature(
            "Signature mismatch".to_string(),
        ));
    }

    debug!(
        timestamp = timestamp,
        time_diff = time_diff,
        "Webhook signature verified successfully"
    );

    Ok(())
}

/// Process webhook event and dispatch to appropriate handlers.
/// Dispatch never fails: a handler error is logged and the event is
/// acknowledged anyway.
#[instrument(skip(evt, reconciler), fields(event_id = %evt.id, event_type = %evt.event_type))]
pub async fn process_event(evt: &StripeEvent, reconciler: &Reconciler) {
    debug!("Processing webhook event");

    let outcome: Result<()> = match evt.event_type.as_str() {
        "payment_intent.succeeded" => handle_payment_intent_succeeded(evt, reconciler),
        "payment_intent.payment_failed" => handle_payment_intent_failed(evt, reconciler),
        "payment_intent.canceled" => handle_payment_intent_canceled(evt, reconciler),
        "account.updated" => handle_account_updated(evt, reconciler),
        "transfer.created" => handle_transfer_created(evt, reconciler),
        "charge.refunded" => handle_charge_refunded(evt, reconciler),
        "charge.succeeded" => {
            // Settled via payment_intent.succeeded.
            debug!("charge.succeeded handled via payment_intent");
            Ok(())
        }
        other => {
            info!(event_type = %other, "Ignoring unknown/unsupported event type");
            Ok(())
        }
    };

    if let Err(e) = outcome {
        warn!(
            event_id = %evt.id,
            event_type = %evt.event_type,
            error = %e,
            "webhook handler failed; acknowledging anyway"
        );
    }
}

fn parse_object<T: serde::de::DeserializeOwned>(evt: &StripeEvent, what: &str) -> Result<T> {
    serde_json::from_value(evt.data.object.clone())
        .map_err(|e| anyhow::anyhow!("failed to parse {what}: {e}"))
}

/// Handle payment_intent.succeeded event
fn handle_payment_intent_succeeded(evt: &StripeEvent, reconciler: &Reconciler) -> Result<()> {
    let intent: PaymentIntent = parse_object(evt, "PaymentIntent")?;

    info!(
        intent_ref = %intent.id,
        amount = intent.amount,
        currency = %intent.currency,
        "Payment intent succeeded"
    );

    let tickets = reconciler
        .ledger
        .reconcile_succeeded(&intent.id, intent.latest_charge.as_deref())?;
    debug!(intent_ref = %intent.id, tickets = tickets.len(), "settlement reconciled");
    Ok(())
}

/// Handle payment_intent.payment_failed event
fn handle_payment_intent_failed(evt: &StripeEvent, reconciler: &Reconciler) -> Result<()> {
    let intent: PaymentIntent = parse_object(evt, "PaymentIntent")?;

    warn!(
        intent_ref = %intent.id,
        status = %intent.status,
        "Payment intent failed"
    );

    let reason = intent
        .last_payment_error
        .as_ref()
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| "Payment failed".to_string());
    reconciler.ledger.reconcile_failed(&intent.id, &reason)?;
    Ok(())
}

/// Handle payment_intent.canceled event. Treated as a failure so the
/// inventory reservation is released.
fn handle_payment_intent_canceled(evt: &StripeEvent, reconciler: &Reconciler) -> Result<()> {
    let intent: PaymentIntent = parse_object(evt, "PaymentIntent")?;

    info!(intent_ref = %intent.id, "Payment intent canceled");

    reconciler
        .ledger
        .reconcile_failed(&intent.id, "Payment canceled")?;
    Ok(())
}

/// Handle account.updated. When an organizer's account becomes fully
/// enabled, their pending manual payouts migrate to the automatic path and
/// settled payments that recorded "no account" are backfilled.
fn handle_account_updated(evt: &StripeEvent, reconciler: &Reconciler) -> Result<()> {
    let account: Account = parse_object(evt, "Account")?;

    info!(
        account_ref = %account.id,
        charges_enabled = account.charges_enabled,
        payouts_enabled = account.payouts_enabled,
        "Account updated"
    );

    let Some(record) = reconciler.accounts.sync_from_event(&account)? else {
        return Ok(());
    };

    if record.fully_enabled() {
        let migrated = reconciler
            .payouts
            .migrate_organizer_to_stripe(&record.organizer_id)?;
        let backfilled = reconciler
            .store
            .backfill_organizer_account(&record.organizer_id, &record.account_ref)?;
        if migrated > 0 || backfilled > 0 {
            info!(
                organizer_id = %record.organizer_id,
                migrated = migrated,
                backfilled = backfilled,
                "organizer fully enabled; payouts migrated and payments backfilled"
            );
        }
    }
    Ok(())
}

/// Handle transfer.created: secondary confirmation that a payout's transfer
/// went out, alongside the executor's own update.
fn handle_transfer_created(evt: &StripeEvent, reconciler: &Reconciler) -> Result<()> {
    let transfer: Transfer = parse_object(evt, "Transfer")?;

    info!(
        transfer_ref = %transfer.id,
        amount = transfer.amount,
        destination = %transfer.destination,
        "Transfer created"
    );

    if let Some(payout_id) = transfer.metadata.get("payout_id") {
        reconciler.store.mark_payout_paid(payout_id, &transfer.id)?;
    }
    Ok(())
}

/// Handle charge.refunded: flip the payment to refunded/partially refunded
/// and cancel a still-pending payout on full refunds.
fn handle_charge_refunded(evt: &StripeEvent, reconciler: &Reconciler) -> Result<()> {
    let charge: Charge = parse_object(evt, "Charge")?;

    let full = charge.amount_refunded >= charge.amount;
    info!(
        charge_ref = %charge.id,
        amount_refunded = charge.amount_refunded,
        full = full,
        "Charge refunded"
    );

    if reconciler
        .store
        .apply_charge_refund(&charge.id, full)?
        .is_none()
    {
        warn!(charge_ref = %charge.id, "refund for unknown charge");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::FeeSchedule;
    use crate::ledger::BuyerContact;
    use crate::store::records::test_support::event_with_inventory;
    use crate::store::{PaymentStatus, PayoutMethod, PayoutStatus};
    use crate::stripe::mock::MockStripe;
    use crate::stripe::StripeApi;
    use serde_json::json;

    #[test]
    fn test_verify_signature_valid() {
        let payload = br#"{"id":"evt_test","type":"payment_intent.succeeded","data":{"object":{}}}"#;
        let secret = "whsec_test_secret";
        let timestamp = 1234567890i64;

        // Compute expected signature
        use hmac::{Hmac, Mac};
        use sha2::Sha256;
        type HmacSha256 = Hmac<Sha256>;

        let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signed_payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let sig_header = format!("t={},v1={}", timestamp, signature);

        let mut headers = http::HeaderMap::new();
        headers.insert("stripe-signature", sig_header.parse().unwrap());

        // With very large tolerance for testing
        let result = verify_signature(payload, &headers, secret, i64::MAX);
        assert!(result.is_ok());
    }

    #[test]
    fn test_verify_signature_invalid() {
        let payload = br#"{"id":"evt_test","type":"payment_intent.succeeded"}"#;
        let secret = "whsec_test_secret";
        let timestamp = 1234567890i64;
        let wrong_signature = "0000000000000000000000000000000000000000000000000000000000000000";

        let sig_header = format!("t={},v1={}", timestamp, wrong_signature);

        let mut headers = http::HeaderMap::new();
        headers.insert("stripe-signature", sig_header.parse().unwrap());

        let result = verify_signature(payload, &headers, secret, i64::MAX);
        assert!(matches!(result, Err(WebhookError::InvalidSignature(_))));
    }

    #[test]
    fn test_verify_signature_missing_header() {
        let payload = b"test";
        let headers = http::HeaderMap::new();

        let result = verify_signature(payload, &headers, "secret", 300);
        assert!(matches!(result, Err(WebhookError::MissingSignature)));
    }

    #[test]
    fn test_verify_signature_timestamp_tolerance() {
        let payload = b"test";
        let secret = "whsec_test_secret";
        let old_timestamp = 1000i64; // Very old timestamp

        use hmac::{Hmac, Mac};
        use sha2::Sha256;
        type HmacSha256 = Hmac<Sha256>;

        let signed_payload = format!("{}.{}", old_timestamp, String::from_utf8_lossy(payload));
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signed_payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let sig_header = format!("t={},v1={}", old_timestamp, signature);

        let mut headers = http::HeaderMap::new();
        headers.insert("stripe-signature", sig_header.parse().unwrap());

        let result = verify_signature(payload, &headers, secret, 300);
        assert!(matches!(result, Err(WebhookError::TimestampTolerance(_))));
    }

    // ---- dispatch ----

    fn stack() -> (Arc<Store>, Arc<MockStripe>, Reconciler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("test.redb")).unwrap());
        let stripe = Arc::new(MockStripe::new());
        let api: Arc<dyn StripeApi> = stripe.clone();
        let ledger = Arc::new(PaymentLedger::new(
            Arc::clone(&store),
            Arc::clone(&api),
            FeeSchedule::new(500),
        ));
        let payouts = Arc::new(PayoutScheduler::new(Arc::clone(&store), Arc::clone(&api)));
        let accounts = Arc::new(AccountManager::new(
            Arc::clone(&store),
            api,
            "https://app.example.com".to_string(),
        ));
        let reconciler = Reconciler {
            ledger,
            payouts,
            accounts,
            store: Arc::clone(&store),
        };
        (store, stripe, reconciler, dir)
    }

    fn contact() -> BuyerContact {
        BuyerContact {
            first_name: "Ada".to_string(),
            last_name: "Obi".to_string(),
            email: "ada@example.com".to_string(),
            phone: None,
        }
    }

    fn event(event_type: &str, object: serde_json::Value) -> StripeEvent {
        serde_json::from_value(json!({
            "id": format!("evt_{event_type}"),
            "type": event_type,
            "data": { "object": object },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn redelivered_success_event_settles_once() {
        let (store, _stripe, reconciler, _dir) = stack();
        store
            .put_event(&event_with_inventory("ev_1", "org_1", Some(10)))
            .unwrap();

        let created = reconciler
            .ledger
            .create_intent("user_1", "ev_1", 2, contact())
            .await
            .unwrap();
        let payment = store.get_payment(&created.payment_id).unwrap().unwrap();

        let evt = event(
            "payment_intent.succeeded",
            json!({
                "id": payment.intent_ref,
                "status": "succeeded",
                "amount": payment.total_amount,
                "currency": "usd",
                "latest_charge": "ch_1",
            }),
        );
        process_event(&evt, &reconciler).await;
        process_event(&evt, &reconciler).await;

        assert_eq!(store.tickets_for_payment(&payment.id).unwrap().len(), 2);
        assert_eq!(store.list_payouts(None, None).unwrap().len(), 1);
        let settled = store.get_payment(&payment.id).unwrap().unwrap();
        assert_eq!(settled.status, PaymentStatus::Succeeded);
        assert_eq!(settled.charge_ref.as_deref(), Some("ch_1"));
    }

    #[tokio::test]
    async fn failure_event_after_success_is_ignored() {
        let (store, _stripe, reconciler, _dir) = stack();
        store
            .put_event(&event_with_inventory("ev_1", "org_1", Some(10)))
            .unwrap();

        let created = reconciler
            .ledger
            .create_intent("user_1", "ev_1", 1, contact())
            .await
            .unwrap();
        let payment = store.get_payment(&created.payment_id).unwrap().unwrap();

        let succeeded = event(
            "payment_intent.succeeded",
            json!({
                "id": payment.intent_ref,
                "status": "succeeded",
                "amount": payment.total_amount,
                "currency": "usd",
                "latest_charge": "ch_1",
            }),
        );
        let failed = event(
            "payment_intent.payment_failed",
            json!({
                "id": payment.intent_ref,
                "status": "requires_payment_method",
                "amount": payment.total_amount,
                "currency": "usd",
                "last_payment_error": { "message": "card declined" },
            }),
        );

        process_event(&succeeded, &reconciler).await;
        process_event(&failed, &reconciler).await;

        let after = store.get_payment(&payment.id).unwrap().unwrap();
        assert_eq!(after.status, PaymentStatus::Succeeded);
        assert_eq!(store.tickets_for_payment(&payment.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn account_updated_migrates_and_backfills() {
        let (store, _stripe, reconciler, _dir) = stack();
        store
            .put_event(&event_with_inventory("ev_1", "org_1", None))
            .unwrap();

        // Organizer starts onboarding but is not yet enabled; a sale happens.
        let started = reconciler
            .accounts
            .create_account("org_1", "org@example.com")
            .await
            .unwrap();
        let created = reconciler
            .ledger
            .create_intent("user_1", "ev_1", 1, contact())
            .await
            .unwrap();
        let payment = store.get_payment(&created.payment_id).unwrap().unwrap();
        assert!(payment.organizer_account_ref.is_none());
        reconciler
            .ledger
            .reconcile_succeeded(&payment.intent_ref, Some("ch_1"))
            .unwrap();

        let payouts = store.list_payouts(None, None).unwrap();
        assert_eq!(payouts[0].method, PayoutMethod::Manual);

        // Onboarding completes.
        let evt = event(
            "account.updated",
            json!({
                "id": started.account_ref,
                "details_submitted": true,
                "charges_enabled": true,
                "payouts_enabled": true,
                "business_type": "individual",
            }),
        );
        process_event(&evt, &reconciler).await;

        let payouts = store.list_payouts(None, None).unwrap();
        assert_eq!(payouts[0].method, PayoutMethod::Stripe);
        assert_eq!(
            payouts[0].account_ref.as_deref(),
            Some(started.account_ref.as_str())
        );

        let backfilled = store.get_payment(&payment.id).unwrap().unwrap();
        assert_eq!(
            backfilled.organizer_account_ref.as_deref(),
            Some(started.account_ref.as_str())
        );

        // Redelivery is harmless.
        process_event(&evt, &reconciler).await;
        assert_eq!(store.list_payouts(None, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transfer_created_confirms_payout() {
        let (store, _stripe, reconciler, _dir) = stack();
        store
            .put_event(&event_with_inventory("ev_1", "org_1", None))
            .unwrap();
        store
            .upsert_account(&crate::store::ConnectedAccount {
                organizer_id: "org_1".to_string(),
                account_ref: "acct_1".to_string(),
                onboarding_complete: true,
                charges_enabled: true,
                payouts_enabled: true,
                business_name: None,
                business_type: None,
                created_at: chrono::Utc::now(),
            })
            .unwrap();

        let created = reconciler
            .ledger
            .create_intent("user_1", "ev_1", 1, contact())
            .await
            .unwrap();
        let payment = store.get_payment(&created.payment_id).unwrap().unwrap();
        reconciler
            .ledger
            .reconcile_succeeded(&payment.intent_ref, Some("ch_1"))
            .unwrap();
        let payout = store.list_payouts(None, None).unwrap().remove(0);

        let evt = event(
            "transfer.created",
            json!({
                "id": "tr_1",
                "amount": payout.amount,
                "currency": "usd",
                "destination": "acct_1",
                "metadata": { "payout_id": payout.id },
            }),
        );
        process_event(&evt, &reconciler).await;

        let paid = store.get_payout(&payout.id).unwrap().unwrap();
        assert_eq!(paid.status, PayoutStatus::Paid);
        assert_eq!(paid.transfer_ref.as_deref(), Some("tr_1"));

        // Redelivery leaves it paid.
        process_event(&evt, &reconciler).await;
        assert_eq!(
            store.get_payout(&payout.id).unwrap().unwrap().status,
            PayoutStatus::Paid
        );
    }

    #[tokio::test]
    async fn charge_refunded_full_and_partial() {
        let (store, _stripe, reconciler, _dir) = stack();
        store
            .put_event(&event_with_inventory("ev_1", "org_1", None))
            .unwrap();

        for (n, full) in [(1u32, true), (2, false)] {
            let created = reconciler
                .ledger
                .create_intent("user_1", "ev_1", 1, contact())
                .await
                .unwrap();
            let payment = store.get_payment(&created.payment_id).unwrap().unwrap();
            let charge_ref = format!("ch_{n}");
            reconciler
                .ledger
                .reconcile_succeeded(&payment.intent_ref, Some(&charge_ref))
                .unwrap();

            let refunded = if full {
                payment.total_amount
            } else {
                payment.total_amount / 2
            };
            let evt = event(
                "charge.refunded",
                json!({
                    "id": charge_ref,
                    "amount": payment.total_amount,
                    "amount_refunded": refunded,
                }),
            );
            process_event(&evt, &reconciler).await;

            let after = store.get_payment(&payment.id).unwrap().unwrap();
            let payout = store
                .list_payouts(None, None)
                .unwrap()
                .into_iter()
                .find(|p| p.payment_id == payment.id)
                .unwrap();
            if full {
                assert_eq!(after.status, PaymentStatus::Refunded);
                assert_eq!(payout.status, PayoutStatus::Cancelled);
            } else {
                assert_eq!(after.status, PaymentStatus::PartiallyRefunded);
                assert_eq!(payout.status, PayoutStatus::Pending);
            }
        }
    }

    #[tokio::test]
    async fn unknown_events_and_handler_failures_are_acknowledged() {
        let (_store, _stripe, reconciler, _dir) = stack();

        let unknown = event("invoice.finalized", json!({ "id": "in_1" }));
        process_event(&unknown, &reconciler).await;

        // Success event for an intent we have no record of: logged, not raised.
        let orphan = event(
            "payment_intent.succeeded",
            json!({
                "id": "pi_unknown",
                "status": "succeeded",
                "amount": 100,
                "currency": "usd",
            }),
        );
        process_event(&orphan, &reconciler).await;
    }
}
