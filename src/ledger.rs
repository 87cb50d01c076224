// Payment ledger: quotes, intent creation, reconciliation, ticket issuance
// and refunds. Reconciliation is driven from two racing paths (the buyer's
// synchronous confirm call and the provider webhook); both funnel into the
// store's conditional settlement transition.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::Error;
use crate::fees::{split_even, FeeSchedule};
use crate::store::{
    FailOutcome, Payment, PaymentMetadata, PaymentStatus, Payout, PayoutMethod, PayoutStatus,
    Reservation, SettlementOutcome, Store, Ticket, TicketStatus,
};
use crate::stripe::StripeApi;

#[derive(Debug, Clone, Deserialize)]
pub struct BuyerContact {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuoteBreakdown {
    pub is_free: bool,
    pub unit_price: i64,
    pub quantity: u32,
    pub subtotal: i64,
    pub processing_fee: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentCreated {
    pub client_secret: String,
    pub payment_id: String,
    pub breakdown: QuoteBreakdown,
    pub organizer_has_stripe: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EarningsSummary {
    pub total_earnings: i64,
    pub pending_payouts: i64,
    pub completed_payouts: i64,
    pub payout_history: Vec<Payout>,
}

pub struct PaymentLedger {
    store: Arc<Store>,
    stripe: Arc<dyn StripeApi>,
    fees: FeeSchedule,
}

impl PaymentLedger {
    pub fn new(store: Arc<Store>, stripe: Arc<dyn StripeApi>, fees: FeeSchedule) -> Self {
        Self { store, stripe, fees }
    }

    /// Price breakdown for display before purchase.
    pub fn quote(&self, event_id: &str, quantity: u32) -> Result<QuoteBreakdown, Error> {
        if quantity < 1 {
            return Err(Error::invalid_state("quantity must be at least 1"));
        }
        let event = self
            .store
            .get_event(event_id)?
            .ok_or(Error::NotFound("event"))?;

        if event.is_free {
            return Ok(QuoteBreakdown {
                is_free: true,
                unit_price: 0,
                quantity,
                subtotal: 0,
                processing_fee: 0,
                total: 0,
            });
        }

        let totals = self.fees.buyer_total(event.ticket_price, quantity);
        Ok(QuoteBreakdown {
            is_free: false,
            unit_price: event.ticket_price,
            quantity,
            subtotal: totals.subtotal,
            processing_fee: totals.processing_fee,
            total: totals.total,
        })
    }

    /// Creates the local payment row and the provider intent.
    ///
    /// Inventory is reserved here, atomically, before the provider is
    /// involved; losing buyers find out immediately rather than after paying.
    /// Whether the organizer has a fully-enabled connected account is decided
    /// here once and captured into the payment.
    pub async fn create_intent(
        &self,
        buyer_id: &str,
        event_id: &str,
        quantity: u32,
        contact: BuyerContact,
    ) -> Result<IntentCreated, Error> {
        if quantity < 1 {
            return Err(Error::invalid_state("quantity must be at least 1"));
        }
        let event = self
            .store
            .get_event(event_id)?
            .ok_or(Error::NotFound("event"))?;
        if event.is_free {
            return Err(Error::WrongFlow);
        }

        let organizer_account_ref = self
            .store
            .account_by_organizer(&event.organizer_id)?
            .filter(|a| a.fully_enabled())
            .map(|a| a.account_ref);
        let organizer_has_stripe = organizer_account_ref.is_some();

        let reservation = self.store.reserve_tickets(event_id, quantity)?;
        if let Reservation::Insufficient { available } = reservation {
            return Err(Error::InsufficientInventory { available });
        }

        let buyer_total = self.fees.buyer_total(event.ticket_price, quantity);
        let organizer_payout = self.fees.organizer_payout(event.ticket_price, quantity);

        let payment_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let payment = Payment {
            id: payment_id.clone(),
            intent_ref: format!("pending_{}", Uuid::new_v4()),
            buyer_id: buyer_id.to_string(),
            event_id: event_id.to_string(),
            subtotal: buyer_total.subtotal,
            platform_fee: organizer_payout.platform_fee,
            processing_fee: buyer_total.processing_fee,
            total_amount: buyer_total.total,
            organizer_amount: organizer_payout.payout,
            organizer_account_ref,
            status: PaymentStatus::Pending,
            charge_ref: None,
            failure_reason: None,
            metadata: PaymentMetadata {
                quantity,
                first_name: contact.first_name,
                last_name: contact.last_name,
                email: contact.email,
                phone: contact.phone,
                event_title: event.title.clone(),
                organizer_id: event.organizer_id.clone(),
                organizer_has_stripe,
            },
            created_at: now,
            updated_at: now,
        };
        self.store.insert_payment(&payment)?;

        let mut intent_metadata = HashMap::new();
        intent_metadata.insert("payment_id".to_string(), payment_id.clone());
        intent_metadata.insert("event_id".to_string(), event_id.to_string());
        intent_metadata.insert("user_id".to_string(), buyer_id.to_string());
        intent_metadata.insert("quantity".to_string(), quantity.to_string());
        intent_metadata.insert(
            "organizer_has_stripe".to_string(),
            organizer_has_stripe.to_string(),
        );

        let intent = match self
            .stripe
            .create_payment_intent(
                buyer_total.total,
                "usd",
                &intent_metadata,
                Some(&payment_id),
            )
            .await
        {
            Ok(intent) => intent,
            Err(e) => {
                // Undo the local half: the provider never saw this payment.
                if reservation == Reservation::Reserved {
                    self.store.release_tickets(event_id, quantity)?;
                }
                self.store.remove_payment(&payment_id)?;
                return Err(e.into());
            }
        };

        self.store.set_intent_ref(&payment_id, &intent.id)?;

        info!(
            payment_id = %payment_id,
            intent_ref = %intent.id,
            total_cents = buyer_total.total,
            organizer_has_stripe = organizer_has_stripe,
            "created payment intent"
        );

        Ok(IntentCreated {
            client_secret: intent.client_secret.unwrap_or_default(),
            payment_id,
            breakdown: QuoteBreakdown {
                is_free: false,
                unit_price: event.ticket_price,
                quantity,
                subtotal: buyer_total.subtotal,
                processing_fee: buyer_total.processing_fee,
                total: buyer_total.total,
            },
            organizer_has_stripe,
        })
    }

    /// Synchronous confirm path: ask the provider for the intent's actual
    /// status, then settle. A gateway failure here leaves the payment pending;
    /// the webhook settles it eventually.
    pub async fn confirm(&self, intent_ref: &str) -> Result<Vec<Ticket>, Error> {
        let intent = self.stripe.retrieve_intent(intent_ref).await?;
        if intent.status != "succeeded" {
            return Err(Error::invalid_state("payment has not been completed"));
        }
        self.reconcile_succeeded(&intent.id, intent.latest_charge.as_deref())
    }

    /// Idempotent settlement: issues tickets, records the charge reference
    /// and schedules the payout, exactly once per payment no matter how many
    /// times (or from how many paths) it is called.
    pub fn reconcile_succeeded(
        &self,
        intent_ref: &str,
        charge_ref: Option<&str>,
    ) -> Result<Vec<Ticket>, Error> {
        let payment = self
            .store
            .payment_by_intent(intent_ref)?
            .ok_or(Error::NotFound("payment"))?;

        if payment.status == PaymentStatus::Succeeded {
            return Ok(self.store.tickets_for_payment(&payment.id)?);
        }

        let event = self
            .store
            .get_event(&payment.event_id)?
            .ok_or(Error::NotFound("event"))?;

        let quantity = payment.metadata.quantity;
        let tickets = build_tickets(&payment, quantity);
        let payout = build_payout(&payment, event.end_date.unwrap_or(event.start_date));

        match self
            .store
            .settle_payment(&payment.id, charge_ref, tickets, payout)?
        {
            SettlementOutcome::Applied { tickets } => {
                info!(
                    payment_id = %payment.id,
                    intent_ref = %intent_ref,
                    tickets = tickets.len(),
                    "payment settled; tickets issued"
                );
                Ok(tickets)
            }
            SettlementOutcome::AlreadySucceeded { tickets } => {
                info!(payment_id = %payment.id, "payment already settled");
                Ok(tickets)
            }
            SettlementOutcome::NotPending { status } => Err(Error::InvalidState(format!(
                "payment is {status:?}, cannot settle"
            ))),
            SettlementOutcome::OutOfInventory { available } => {
                warn!(
                    payment_id = %payment.id,
                    available = available,
                    "late settlement refused: inventory resold"
                );
                Err(Error::InsufficientInventory { available })
            }
        }
    }

    /// Marks a payment failed and returns its reservation to the pool.
    /// Never downgrades a settled payment.
    pub fn reconcile_failed(&self, intent_ref: &str, reason: &str) -> Result<(), Error> {
        match self.store.fail_payment(intent_ref, reason)? {
            FailOutcome::Failed => {
                info!(intent_ref = %intent_ref, reason = %reason, "payment failed");
            }
            FailOutcome::AlreadyFailed => {
                info!(intent_ref = %intent_ref, "payment already failed");
            }
            FailOutcome::Skipped(status) => {
                info!(
                    intent_ref = %intent_ref,
                    status = ?status,
                    "ignoring failure signal for settled payment"
                );
            }
            FailOutcome::NotFound => {
                warn!(intent_ref = %intent_ref, "failure signal for unknown payment");
            }
        }
        Ok(())
    }

    /// Buyer-requested refund of a single ticket.
    pub async fn refund_ticket(&self, ticket_id: &str, requester_id: &str) -> Result<String, Error> {
        let ticket = self
            .store
            .get_ticket(ticket_id)?
            .ok_or(Error::NotFound("ticket"))?;

        if ticket.buyer_id != requester_id {
            return Err(Error::Unauthorized);
        }
        match ticket.status {
            TicketStatus::Refunded => {
                return Err(Error::invalid_state("ticket has already been refunded"))
            }
            TicketStatus::Used => return Err(Error::invalid_state("cannot refund a used ticket")),
            TicketStatus::Confirmed => {}
        }

        let event = self
            .store
            .get_event(&ticket.event_id)?
            .ok_or(Error::NotFound("event"))?;
        if event.start_date <= Utc::now() {
            return Err(Error::invalid_state("cannot refund after event has started"));
        }

        let payment = self
            .store
            .get_payment(&ticket.payment_id)?
            .ok_or(Error::NotFound("payment"))?;

        // Full per-ticket amount, processing fee included.
        let refund = self
            .stripe
            .create_refund(&payment.intent_ref, ticket.total_price)
            .await?;

        self.store.apply_ticket_refund(ticket_id)?;

        info!(
            ticket_id = %ticket_id,
            payment_id = %payment.id,
            refund_ref = %refund.id,
            amount_cents = ticket.total_price,
            "ticket refunded"
        );

        Ok(refund.id)
    }

    /// Organizer-facing payout totals and history.
    pub fn earnings_summary(&self, organizer_id: &str) -> Result<EarningsSummary, Error> {
        let payouts = self.store.payouts_for_organizer(organizer_id)?;
        let mut summary = EarningsSummary {
            total_earnings: 0,
            pending_payouts: 0,
            completed_payouts: 0,
            payout_history: Vec::new(),
        };
        for payout in payouts {
            match payout.status {
                PayoutStatus::Paid => summary.completed_payouts += payout.amount,
                PayoutStatus::Pending => summary.pending_payouts += payout.amount,
                _ => {}
            }
            summary.total_earnings += payout.amount;
            summary.payout_history.push(payout);
        }
        Ok(summary)
    }
}

fn build_tickets(payment: &Payment, quantity: u32) -> Vec<Ticket> {
    let unit_shares = split_even(payment.subtotal, quantity);
    let total_shares = split_even(payment.total_amount, quantity);
    let platform_shares = split_even(payment.platform_fee, quantity);
    let processing_shares = split_even(payment.processing_fee, quantity);
    let now = Utc::now();

    (0..quantity as usize)
        .map(|i| Ticket {
            id: Uuid::new_v4().to_string(),
            code: ticket_code(),
            event_id: payment.event_id.clone(),
            buyer_id: payment.buyer_id.clone(),
            first_name: payment.metadata.first_name.clone(),
            last_name: payment.metadata.last_name.clone(),
            email: payment.metadata.email.clone(),
            phone: payment.metadata.phone.clone(),
            unit_price: unit_shares[i],
            total_price: total_shares[i],
            platform_fee: platform_shares[i],
            processing_fee: processing_shares[i],
            status: TicketStatus::Confirmed,
            payment_id: payment.id.clone(),
            purchased_at: now,
            used_at: None,
        })
        .collect()
}

fn build_payout(payment: &Payment, scheduled_for: chrono::DateTime<Utc>) -> Payout {
    let method = if payment.organizer_account_ref.is_some() {
        PayoutMethod::Stripe
    } else {
        PayoutMethod::Manual
    };
    Payout {
        id: Uuid::new_v4().to_string(),
        organizer_id: payment.metadata.organizer_id.clone(),
        payment_id: payment.id.clone(),
        event_id: payment.event_id.clone(),
        amount: payment.organizer_amount,
        currency: "usd".to_string(),
        status: PayoutStatus::Pending,
        method,
        account_ref: payment.organizer_account_ref.clone(),
        scheduled_for,
        processed_at: None,
        transfer_ref: None,
        failure_reason: None,
        created_at: Utc::now(),
    }
}

fn ticket_code() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("TKT-{}", hex[..8].to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::records::test_support::event_with_inventory;
    use crate::store::{ConnectedAccount, EventRecord, PayoutMethod};
    use crate::stripe::mock::MockStripe;
    use chrono::Duration;

    fn setup() -> (Arc<Store>, Arc<MockStripe>, PaymentLedger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("test.redb")).unwrap());
        let stripe = Arc::new(MockStripe::new());
        let api: Arc<dyn StripeApi> = stripe.clone();
        let ledger = PaymentLedger::new(Arc::clone(&store), api, FeeSchedule::new(500));
        (store, stripe, ledger, dir)
    }

    fn contact() -> BuyerContact {
        BuyerContact {
            first_name: "Ada".to_string(),
            last_name: "Obi".to_string(),
            email: "ada@example.com".to_string(),
            phone: Some("+13125550100".to_string()),
        }
    }

    #[tokio::test]
    async fn quote_free_event_is_all_zero() {
        let (store, _stripe, ledger, _dir) = setup();
        let mut event = event_with_inventory("ev_free", "org_1", None);
        event.is_free = true;
        event.ticket_price = 0;
        store.put_event(&event).unwrap();

        let quote = ledger.quote("ev_free", 3).unwrap();
        assert!(quote.is_free);
        assert_eq!(quote.total, 0);
        assert_eq!(quote.processing_fee, 0);

        // Paid purchases of a free event are the wrong flow entirely.
        let err = ledger
            .create_intent("user_1", "ev_free", 1, contact())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WrongFlow));
    }

    #[tokio::test]
    async fn double_reconciliation_issues_tickets_once() {
        let (store, _stripe, ledger, _dir) = setup();
        store
            .put_event(&event_with_inventory("ev_1", "org_1", Some(10)))
            .unwrap();

        let created = ledger
            .create_intent("user_1", "ev_1", 2, contact())
            .await
            .unwrap();
        let payment = store.get_payment(&created.payment_id).unwrap().unwrap();

        // Confirm path and webhook path race; both land here.
        let first = ledger
            .reconcile_succeeded(&payment.intent_ref, Some("ch_1"))
            .unwrap();
        let second = ledger
            .reconcile_succeeded(&payment.intent_ref, Some("ch_1"))
            .unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(store.tickets_for_payment(&payment.id).unwrap().len(), 2);
        assert_eq!(store.list_payouts(None, None).unwrap().len(), 1);

        // Inventory was reserved at intent time and not decremented again.
        let event = store.get_event("ev_1").unwrap().unwrap();
        assert_eq!(event.available_tickets, Some(8));
    }

    #[tokio::test]
    async fn failure_never_downgrades_a_settled_payment() {
        let (store, _stripe, ledger, _dir) = setup();
        store
            .put_event(&event_with_inventory("ev_1", "org_1", Some(10)))
            .unwrap();

        let created = ledger
            .create_intent("user_1", "ev_1", 1, contact())
            .await
            .unwrap();
        let payment = store.get_payment(&created.payment_id).unwrap().unwrap();
        ledger
            .reconcile_succeeded(&payment.intent_ref, Some("ch_1"))
            .unwrap();

        ledger
            .reconcile_failed(&payment.intent_ref, "card_declined")
            .unwrap();

        let after = store.get_payment(&payment.id).unwrap().unwrap();
        assert_eq!(after.status, PaymentStatus::Succeeded);
        assert!(after.failure_reason.is_none());
        assert_eq!(store.tickets_for_payment(&payment.id).unwrap().len(), 1);
        // No inventory released either.
        let event = store.get_event("ev_1").unwrap().unwrap();
        assert_eq!(event.available_tickets, Some(9));
    }

    #[tokio::test]
    async fn ticket_totals_reconstruct_payment_total() {
        let (store, _stripe, ledger, _dir) = setup();
        // $12.34 a ticket, unlimited inventory.
        store
            .put_event(&event_with_inventory("ev_1", "org_1", None))
            .unwrap();

        for quantity in [1u32, 2, 3, 7] {
            let created = ledger
                .create_intent("user_1", "ev_1", quantity, contact())
                .await
                .unwrap();
            let payment = store.get_payment(&created.payment_id).unwrap().unwrap();
            let tickets = ledger
                .reconcile_succeeded(&payment.intent_ref, None)
                .unwrap();

            assert_eq!(tickets.len(), quantity as usize);
            let total: i64 = tickets.iter().map(|t| t.total_price).sum();
            assert_eq!(total, payment.total_amount);
            let subtotal: i64 = tickets.iter().map(|t| t.unit_price).sum();
            assert_eq!(subtotal, payment.subtotal);
        }
    }

    #[tokio::test]
    async fn failed_payment_releases_reservation() {
        let (store, _stripe, ledger, _dir) = setup();
        store
            .put_event(&event_with_inventory("ev_1", "org_1", Some(5)))
            .unwrap();

        let created = ledger
            .create_intent("user_1", "ev_1", 3, contact())
            .await
            .unwrap();
        assert_eq!(
            store.get_event("ev_1").unwrap().unwrap().available_tickets,
            Some(2)
        );

        let payment = store.get_payment(&created.payment_id).unwrap().unwrap();
        ledger
            .reconcile_failed(&payment.intent_ref, "card_declined")
            .unwrap();

        assert_eq!(
            store.get_event("ev_1").unwrap().unwrap().available_tickets,
            Some(5)
        );
        // Repeating the failure changes nothing further.
        ledger
            .reconcile_failed(&payment.intent_ref, "card_declined")
            .unwrap();
        assert_eq!(
            store.get_event("ev_1").unwrap().unwrap().available_tickets,
            Some(5)
        );
    }

    #[tokio::test]
    async fn last_ticket_goes_to_exactly_one_buyer() {
        let (store, _stripe, ledger, _dir) = setup();
        store
            .put_event(&event_with_inventory("ev_1", "org_1", Some(1)))
            .unwrap();

        let winner = ledger.create_intent("user_1", "ev_1", 1, contact()).await;
        assert!(winner.is_ok());

        let loser = ledger
            .create_intent("user_2", "ev_1", 1, contact())
            .await
            .unwrap_err();
        assert!(matches!(loser, Error::InsufficientInventory { available: 0 }));

        // The winner settles normally.
        let payment = store
            .get_payment(&winner.unwrap().payment_id)
            .unwrap()
            .unwrap();
        let tickets = ledger
            .reconcile_succeeded(&payment.intent_ref, Some("ch_1"))
            .unwrap();
        assert_eq!(tickets.len(), 1);
    }

    #[tokio::test]
    async fn gateway_failure_rolls_back_intent_creation() {
        let (store, stripe, ledger, _dir) = setup();
        store
            .put_event(&event_with_inventory("ev_1", "org_1", Some(3)))
            .unwrap();

        stripe.fail_intent_creation(true);
        let err = ledger
            .create_intent("user_1", "ev_1", 2, contact())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));

        // Reservation released and the placeholder payment removed.
        assert_eq!(
            store.get_event("ev_1").unwrap().unwrap().available_tickets,
            Some(3)
        );

        stripe.fail_intent_creation(false);
        assert!(ledger
            .create_intent("user_1", "ev_1", 2, contact())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn refund_rules_and_effects() {
        let (store, stripe, ledger, _dir) = setup();
        store
            .put_event(&event_with_inventory("ev_1", "org_1", Some(10)))
            .unwrap();

        let created = ledger
            .create_intent("user_1", "ev_1", 1, contact())
            .await
            .unwrap();
        let payment = store.get_payment(&created.payment_id).unwrap().unwrap();
        let tickets = ledger
            .reconcile_succeeded(&payment.intent_ref, Some("ch_1"))
            .unwrap();
        let ticket = &tickets[0];

        // Only the owner may refund.
        assert!(matches!(
            ledger.refund_ticket(&ticket.id, "someone_else").await,
            Err(Error::Unauthorized)
        ));

        // Started events are not refundable.
        let mut event = store.get_event("ev_1").unwrap().unwrap();
        event.start_date = Utc::now() - Duration::hours(1);
        store.put_event(&event).unwrap();
        assert!(matches!(
            ledger.refund_ticket(&ticket.id, "user_1").await,
            Err(Error::InvalidState(_))
        ));

        // Move the event back to the future; refund goes through.
        event.start_date = Utc::now() + Duration::days(1);
        store.put_event(&event).unwrap();
        let before = store.get_event("ev_1").unwrap().unwrap().available_tickets;
        let refund_ref = ledger.refund_ticket(&ticket.id, "user_1").await.unwrap();
        assert!(refund_ref.starts_with("re_mock_"));
        assert_eq!(stripe.refunds.lock().unwrap().len(), 1);

        // Seat returned, payout cancelled, ticket kept (status flipped).
        let after = store.get_event("ev_1").unwrap().unwrap().available_tickets;
        assert_eq!(after, before.map(|n| n + 1));
        let payouts = store.list_payouts(None, None).unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].status, PayoutStatus::Cancelled);
        let kept = store.get_ticket(&ticket.id).unwrap().unwrap();
        assert_eq!(kept.status, TicketStatus::Refunded);

        // A second attempt is rejected.
        assert!(matches!(
            ledger.refund_ticket(&ticket.id, "user_1").await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn account_decision_is_captured_at_intent_time() {
        let (store, _stripe, ledger, _dir) = setup();
        store
            .put_event(&event_with_inventory("ev_1", "org_1", None))
            .unwrap();
        store
            .upsert_account(&ConnectedAccount {
                organizer_id: "org_1".to_string(),
                account_ref: "acct_1".to_string(),
                onboarding_complete: true,
                charges_enabled: true,
                payouts_enabled: true,
                business_name: None,
                business_type: Some("individual".to_string()),
                created_at: Utc::now(),
            })
            .unwrap();

        let created = ledger
            .create_intent("user_1", "ev_1", 1, contact())
            .await
            .unwrap();
        assert!(created.organizer_has_stripe);

        let payment = store.get_payment(&created.payment_id).unwrap().unwrap();
        assert_eq!(payment.organizer_account_ref.as_deref(), Some("acct_1"));

        // Settlement routes the payout by the captured decision.
        ledger
            .reconcile_succeeded(&payment.intent_ref, Some("ch_1"))
            .unwrap();
        let payouts = store.list_payouts(None, None).unwrap();
        assert_eq!(payouts[0].method, PayoutMethod::Stripe);
        assert_eq!(payouts[0].account_ref.as_deref(), Some("acct_1"));
    }

    #[tokio::test]
    async fn payout_scheduled_for_event_end_falls_back_to_start() {
        let (store, _stripe, ledger, _dir) = setup();
        let mut event: EventRecord = event_with_inventory("ev_1", "org_1", None);
        event.end_date = None;
        store.put_event(&event).unwrap();

        let created = ledger
            .create_intent("user_1", "ev_1", 1, contact())
            .await
            .unwrap();
        let payment = store.get_payment(&created.payment_id).unwrap().unwrap();
        ledger
            .reconcile_succeeded(&payment.intent_ref, None)
            .unwrap();

        let payouts = store.list_payouts(None, None).unwrap();
        assert_eq!(payouts[0].scheduled_for, event.start_date);
    }
}
