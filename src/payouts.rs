// Payout scheduling and execution. Every settled payment gets exactly one
// payout row; stripe-method payouts are executed by transfer once the event
// has ended, manual payouts wait for an operator. A payout is claimed out of
// pending/failed before the gateway is called, so a batch run and an admin
// retry can never both move the same money.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::Error;
use crate::store::{AuditEntry, Payout, PayoutMethod, PayoutStatus, Store};
use crate::stripe::StripeApi;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ExecutionOutcome {
    Paid { transfer_ref: String },
    Failed { reason: String },
    /// Lost the claim to a concurrent executor, or became ineligible.
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub payout_id: String,
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,
}

pub struct PayoutScheduler {
    store: Arc<Store>,
    stripe: Arc<dyn StripeApi>,
}

impl PayoutScheduler {
    pub fn new(store: Arc<Store>, stripe: Arc<dyn StripeApi>) -> Self {
        Self { store, stripe }
    }

    pub fn due_stripe_payouts(&self, now: DateTime<Utc>) -> Result<Vec<Payout>, Error> {
        Ok(self.store.due_stripe_payouts(now)?)
    }

    /// Executes one payout: claim, transfer, record the outcome. A gateway
    /// error lands in the payout's failed state and is returned as data, so
    /// batch callers can keep going.
    pub async fn execute(&self, payout_id: &str, allow_failed: bool) -> Result<ExecutionOutcome, Error> {
        let claimed = match self.store.claim_payout(payout_id, allow_failed)? {
            Some(p) => p,
            None => {
                return Ok(ExecutionOutcome::Skipped {
                    reason: "payout is not eligible for execution".to_string(),
                })
            }
        };
        let destination = match claimed.account_ref.as_deref() {
            Some(d) => d.to_string(),
            // claim_payout only hands out stripe payouts with an account.
            None => {
                return Err(Error::invalid_state(
                    "stripe payout has no connected account reference",
                ))
            }
        };

        let mut metadata = HashMap::new();
        metadata.insert("payout_id".to_string(), claimed.id.clone());
        metadata.insert("event_id".to_string(), claimed.event_id.clone());
        metadata.insert("payment_id".to_string(), claimed.payment_id.clone());
        let transfer_group = format!("event_{}", claimed.event_id);

        match self
            .stripe
            .create_transfer(
                claimed.amount,
                &claimed.currency,
                &destination,
                &transfer_group,
                &metadata,
                Some(&claimed.id),
            )
            .await
        {
            Ok(transfer) => {
                self.store.mark_payout_paid(&claimed.id, &transfer.id)?;
                info!(
                    payout_id = %claimed.id,
                    transfer_ref = %transfer.id,
                    amount_cents = claimed.amount,
                    destination = %destination,
                    "payout transferred"
                );
                Ok(ExecutionOutcome::Paid {
                    transfer_ref: transfer.id,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                self.store.mark_payout_failed(&claimed.id, &reason)?;
                warn!(
                    payout_id = %claimed.id,
                    reason = %reason,
                    "payout transfer failed"
                );
                Ok(ExecutionOutcome::Failed { reason })
            }
        }
    }

    /// Executes every due stripe payout. Outcomes are independent: one
    /// failure never aborts its siblings.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<Vec<BatchItem>, Error> {
        let due = self.store.due_stripe_payouts(now)?;
        let mut results = Vec::with_capacity(due.len());
        for payout in due {
            let outcome = match self.execute(&payout.id, false).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(payout_id = %payout.id, error = %e, "payout skipped");
                    ExecutionOutcome::Skipped {
                        reason: e.to_string(),
                    }
                }
            };
            results.push(BatchItem {
                payout_id: payout.id,
                outcome,
            });
        }
        info!(processed = results.len(), "payout batch complete");
        Ok(results)
    }

    /// Same as `run_due`, restricted to one event.
    pub async fn run_due_for_event(
        &self,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<BatchItem>, Error> {
        let due = self.store.due_stripe_payouts(now)?;
        let mut results = Vec::new();
        for payout in due.into_iter().filter(|p| p.event_id == event_id) {
            let outcome = match self.execute(&payout.id, false).await {
                Ok(outcome) => outcome,
                Err(e) => ExecutionOutcome::Skipped {
                    reason: e.to_string(),
                },
            };
            results.push(BatchItem {
                payout_id: payout.id,
                outcome,
            });
        }
        Ok(results)
    }

    /// Re-attempts a failed stripe transfer. Manual payouts have no retry;
    /// they are resolved by `mark_manual_paid`.
    pub async fn retry(&self, payout_id: &str) -> Result<ExecutionOutcome, Error> {
        let payout = self
            .store
            .get_payout(payout_id)?
            .ok_or(Error::NotFound("payout"))?;
        if payout.method != PayoutMethod::Stripe {
            return Err(Error::invalid_state("only stripe payouts can be retried"));
        }
        if payout.status != PayoutStatus::Failed {
            return Err(Error::invalid_state("only failed payouts can be retried"));
        }
        self.execute(payout_id, true).await
    }

    /// Operator settles a manual payout off-platform and records it here,
    /// with attribution.
    pub fn mark_manual_paid(
        &self,
        payout_id: &str,
        operator: &str,
        note: Option<&str>,
    ) -> Result<Payout, Error> {
        let payout = self
            .store
            .mark_manual_paid(payout_id)?
            .ok_or_else(|| Error::invalid_state("only pending manual payouts can be marked paid"))?;

        self.store.append_audit(&AuditEntry {
            id: Uuid::new_v4().to_string(),
            actor: operator.to_string(),
            action: "payout.manual_paid".to_string(),
            subject: payout_id.to_string(),
            note: note.map(str::to_string),
            at: Utc::now(),
        })?;

        info!(payout_id = %payout_id, operator = %operator, "manual payout marked paid");
        Ok(payout)
    }

    /// Once an organizer's account is fully enabled, move their pending
    /// manual payouts onto the automatic path. Paid/failed/cancelled payouts
    /// are history and stay as they were.
    pub fn migrate_organizer_to_stripe(&self, organizer_id: &str) -> Result<usize, Error> {
        let account = self
            .store
            .account_by_organizer(organizer_id)?
            .ok_or(Error::NotFound("connected account"))?;
        if !account.fully_enabled() {
            return Err(Error::invalid_state(
                "connected account is not fully enabled",
            ));
        }

        let migrated = self
            .store
            .migrate_manual_payouts(organizer_id, &account.account_ref)?;
        if migrated > 0 {
            info!(
                organizer_id = %organizer_id,
                account_ref = %account.account_ref,
                migrated = migrated,
                "migrated pending manual payouts to stripe"
            );
        }
        Ok(migrated)
    }
}
