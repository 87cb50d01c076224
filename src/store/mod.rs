//! Persistent store for payments, tickets, payouts, connected accounts and
//! event inventory.
//!
//! Uses redb. Write transactions are exclusive, which is what makes the
//! conditional state transitions here safe under racing callers: settlement,
//! failure-with-release, refund application, payout claiming and migration
//! each read, check and mutate inside a single transaction, so a concurrent
//! duplicate observes either "not yet done" or "fully done".

pub mod records;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub use records::{
    AuditEntry, ConnectedAccount, EventRecord, Payment, PaymentMetadata, PaymentStatus, Payout,
    PayoutMethod, PayoutStatus, Ticket, TicketStatus,
};

const PAYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("payments");
/// Provider payment-intent reference -> payment id. Doubles as the uniqueness
/// constraint on intent references.
const PAYMENTS_BY_INTENT: TableDefinition<&str, &str> = TableDefinition::new("payments_by_intent");
const PAYMENTS_BY_CHARGE: TableDefinition<&str, &str> = TableDefinition::new("payments_by_charge");
const TICKETS: TableDefinition<&str, &[u8]> = TableDefinition::new("tickets");
const PAYOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("payouts");
/// Keyed by organizer id; one connected account per organizer.
const ACCOUNTS: TableDefinition<&str, &[u8]> = TableDefinition::new("accounts");
const ACCOUNTS_BY_REF: TableDefinition<&str, &str> = TableDefinition::new("accounts_by_ref");
const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");
const AUDIT: TableDefinition<&str, &[u8]> = TableDefinition::new("audit");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] redb::DatabaseError),
    #[error(transparent)]
    Transaction(#[from] redb::TransactionError),
    #[error(transparent)]
    Table(#[from] redb::TableError),
    #[error(transparent)]
    Storage(#[from] redb::StorageError),
    #[error(transparent)]
    Commit(#[from] redb::CommitError),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("duplicate {0}: {1}")]
    Duplicate(&'static str, String),
    #[error("missing {0}: {1}")]
    Missing(&'static str, String),
}

/// Outcome of an inventory reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    /// The event does not track a finite inventory.
    Untracked,
    Insufficient {
        available: i64,
    },
}

/// Outcome of the settlement transition (payment -> succeeded + tickets + payout).
#[derive(Debug)]
pub enum SettlementOutcome {
    Applied { tickets: Vec<Ticket> },
    AlreadySucceeded { tickets: Vec<Ticket> },
    /// Payment is refunded/partially refunded; nothing to do.
    NotPending { status: PaymentStatus },
    /// A previously-failed payment succeeded at the provider, but the seats
    /// were resold in between.
    OutOfInventory { available: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Failed,
    AlreadyFailed,
    /// A failure signal never downgrades a settled payment.
    Skipped(PaymentStatus),
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketRefundOutcome {
    Applied,
    AlreadyRefunded,
}

#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

fn put<T: Serialize>(
    table: &mut redb::Table<&str, &[u8]>,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let buf = serde_json::to_vec(value)?;
    table.insert(key, buf.as_slice())?;
    Ok(())
}

fn read<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match table.get(key)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

fn scan<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    for row in table.iter()? {
        let (_, v) = row?;
        out.push(serde_json::from_slice(v.value())?);
    }
    Ok(out)
}

impl Store {
    /// Create a new database instance or open an existing one.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let db = Database::create(path)?;

        // Create tables if they don't exist
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(PAYMENTS)?;
            let _ = write_txn.open_table(PAYMENTS_BY_INTENT)?;
            let _ = write_txn.open_table(PAYMENTS_BY_CHARGE)?;
            let _ = write_txn.open_table(TICKETS)?;
            let _ = write_txn.open_table(PAYOUTS)?;
            let _ = write_txn.open_table(ACCOUNTS)?;
            let _ = write_txn.open_table(ACCOUNTS_BY_REF)?;
            let _ = write_txn.open_table(EVENTS)?;
            let _ = write_txn.open_table(AUDIT)?;
        }
        write_txn.commit()?;

        tracing::info!("store initialized");

        Ok(Self { db: Arc::new(db) })
    }

    // ---- events ----

    pub fn put_event(&self, event: &EventRecord) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut events = txn.open_table(EVENTS)?;
            put(&mut events, &event.id, event)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_event(&self, event_id: &str) -> Result<Option<EventRecord>, StoreError> {
        let txn = self.db.begin_read()?;
        let events = txn.open_table(EVENTS)?;
        read(&events, event_id)
    }

    /// Atomic decrement-with-floor. Reserves `quantity` tickets, or reports
    /// how many are left without changing anything.
    pub fn reserve_tickets(&self, event_id: &str, quantity: u32) -> Result<Reservation, StoreError> {
        let txn = self.db.begin_write()?;
        let outcome;
        {
            let mut events = txn.open_table(EVENTS)?;
            let mut event: EventRecord = read(&events, event_id)?
                .ok_or_else(|| StoreError::Missing("event", event_id.to_string()))?;
            match event.available_tickets {
                None => outcome = Reservation::Untracked,
                Some(available) if available < quantity as i64 => {
                    outcome = Reservation::Insufficient { available };
                }
                Some(available) => {
                    event.available_tickets = Some(available - quantity as i64);
                    put(&mut events, event_id, &event)?;
                    outcome = Reservation::Reserved;
                }
            }
        }
        txn.commit()?;
        Ok(outcome)
    }

    /// Returns previously-reserved tickets to the pool.
    pub fn release_tickets(&self, event_id: &str, quantity: u32) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut events = txn.open_table(EVENTS)?;
            if let Some(mut event) = read::<EventRecord>(&events, event_id)? {
                if let Some(available) = event.available_tickets {
                    event.available_tickets = Some(available + quantity as i64);
                    put(&mut events, event_id, &event)?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    // ---- payments ----

    /// Inserts a new payment, enforcing uniqueness of its intent reference.
    pub fn insert_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut payments = txn.open_table(PAYMENTS)?;
            let mut by_intent = txn.open_table(PAYMENTS_BY_INTENT)?;
            if by_intent.get(payment.intent_ref.as_str())?.is_some() {
                return Err(StoreError::Duplicate("intent reference", payment.intent_ref.clone()));
            }
            put(&mut payments, &payment.id, payment)?;
            by_intent.insert(payment.intent_ref.as_str(), payment.id.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Swaps the local placeholder reference for the provider's real one.
    pub fn set_intent_ref(&self, payment_id: &str, intent_ref: &str) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut payments = txn.open_table(PAYMENTS)?;
            let mut by_intent = txn.open_table(PAYMENTS_BY_INTENT)?;
            let mut payment: Payment = read(&payments, payment_id)?
                .ok_or_else(|| StoreError::Missing("payment", payment_id.to_string()))?;
            if by_intent.get(intent_ref)?.is_some() {
                return Err(StoreError::Duplicate("intent reference", intent_ref.to_string()));
            }
            by_intent.remove(payment.intent_ref.as_str())?;
            by_intent.insert(intent_ref, payment_id)?;
            payment.intent_ref = intent_ref.to_string();
            payment.updated_at = Utc::now();
            put(&mut payments, payment_id, &payment)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Drops a payment that never reached the provider (gateway failure
    /// after the local row was created).
    pub fn remove_payment(&self, payment_id: &str) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut payments = txn.open_table(PAYMENTS)?;
            let mut by_intent = txn.open_table(PAYMENTS_BY_INTENT)?;
            if let Some(payment) = read::<Payment>(&payments, payment_id)? {
                by_intent.remove(payment.intent_ref.as_str())?;
                payments.remove(payment_id)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_payment(&self, payment_id: &str) -> Result<Option<Payment>, StoreError> {
        let txn = self.db.begin_read()?;
        let payments = txn.open_table(PAYMENTS)?;
        read(&payments, payment_id)
    }

    pub fn payment_by_intent(&self, intent_ref: &str) -> Result<Option<Payment>, StoreError> {
        let txn = self.db.begin_read()?;
        let by_intent = txn.open_table(PAYMENTS_BY_INTENT)?;
        let Some(id) = by_intent.get(intent_ref)? else {
            return Ok(None);
        };
        let payments = txn.open_table(PAYMENTS)?;
        read(&payments, id.value())
    }

    /// The settlement transition: payment -> succeeded, tickets written,
    /// payout scheduled, all or nothing. Safe to call from both the
    /// synchronous confirm path and the webhook; the loser of the race gets
    /// `AlreadySucceeded` with the winner's tickets.
    pub fn settle_payment(
        &self,
        payment_id: &str,
        charge_ref: Option<&str>,
        tickets: Vec<Ticket>,
        payout: Payout,
    ) -> Result<SettlementOutcome, StoreError> {
        let txn = self.db.begin_write()?;
        let outcome;
        {
            let mut payments = txn.open_table(PAYMENTS)?;
            let mut by_charge = txn.open_table(PAYMENTS_BY_CHARGE)?;
            let mut tickets_tbl = txn.open_table(TICKETS)?;
            let mut payouts = txn.open_table(PAYOUTS)?;
            let mut events = txn.open_table(EVENTS)?;

            let mut payment: Payment = read(&payments, payment_id)?
                .ok_or_else(|| StoreError::Missing("payment", payment_id.to_string()))?;

            match payment.status {
                PaymentStatus::Succeeded => {
                    let existing = tickets_for_payment_in(&tickets_tbl, payment_id)?;
                    outcome = SettlementOutcome::AlreadySucceeded { tickets: existing };
                }
                PaymentStatus::Refunded | PaymentStatus::PartiallyRefunded => {
                    outcome = SettlementOutcome::NotPending {
                        status: payment.status,
                    };
                }
                PaymentStatus::Pending | PaymentStatus::Failed => {
                    // A failed payment's reservation was already released;
                    // take the seats back before settling.
                    if payment.status == PaymentStatus::Failed {
                        let mut event: EventRecord = read(&events, payment.event_id.as_str())?
                            .ok_or_else(|| {
                                StoreError::Missing("event", payment.event_id.clone())
                            })?;
                        if let Some(available) = event.available_tickets {
                            let needed = tickets.len() as i64;
                            if available < needed {
                                return Ok(SettlementOutcome::OutOfInventory { available });
                            }
                            event.available_tickets = Some(available - needed);
                            put(&mut events, &payment.event_id, &event)?;
                        }
                    }

                    for ticket in &tickets {
                        put(&mut tickets_tbl, &ticket.id, ticket)?;
                    }
                    put(&mut payouts, &payout.id, &payout)?;

                    payment.status = PaymentStatus::Succeeded;
                    payment.charge_ref = charge_ref.map(str::to_string);
                    payment.failure_reason = None;
                    payment.updated_at = Utc::now();
                    put(&mut payments, payment_id, &payment)?;
                    if let Some(charge) = charge_ref {
                        by_charge.insert(charge, payment_id)?;
                    }
                    outcome = SettlementOutcome::Applied { tickets };
                }
            }
        }
        txn.commit()?;
        Ok(outcome)
    }

    /// Conditional pending -> failed. Releases the inventory reservation held
    /// by the intent. Never touches a settled payment.
    pub fn fail_payment(&self, intent_ref: &str, reason: &str) -> Result<FailOutcome, StoreError> {
        let txn = self.db.begin_write()?;
        let outcome;
        {
            let by_intent = txn.open_table(PAYMENTS_BY_INTENT)?;
            let payment_id = match by_intent.get(intent_ref)? {
                Some(id) => id.value().to_string(),
                None => {
                    return Ok(FailOutcome::NotFound);
                }
            };
            drop(by_intent);

            let mut payments = txn.open_table(PAYMENTS)?;
            let mut events = txn.open_table(EVENTS)?;
            let mut payment: Payment = read(&payments, payment_id.as_str())?
                .ok_or_else(|| StoreError::Missing("payment", payment_id.clone()))?;

            match payment.status {
                PaymentStatus::Pending => {
                    payment.status = PaymentStatus::Failed;
                    payment.failure_reason = Some(reason.to_string());
                    payment.updated_at = Utc::now();
                    put(&mut payments, payment_id.as_str(), &payment)?;

                    if let Some(mut event) =
                        read::<EventRecord>(&events, payment.event_id.as_str())?
                    {
                        if let Some(available) = event.available_tickets {
                            event.available_tickets =
                                Some(available + payment.metadata.quantity as i64);
                            put(&mut events, &payment.event_id, &event)?;
                        }
                    }
                    outcome = FailOutcome::Failed;
                }
                PaymentStatus::Failed => outcome = FailOutcome::AlreadyFailed,
                status => outcome = FailOutcome::Skipped(status),
            }
        }
        txn.commit()?;
        Ok(outcome)
    }

    /// Applies a provider-reported refund to the payment located by charge
    /// reference. Full refunds also cancel any still-pending payout.
    pub fn apply_charge_refund(
        &self,
        charge_ref: &str,
        full: bool,
    ) -> Result<Option<Payment>, StoreError> {
        let txn = self.db.begin_write()?;
        let result;
        {
            let by_charge = txn.open_table(PAYMENTS_BY_CHARGE)?;
            let payment_id = match by_charge.get(charge_ref)? {
                Some(id) => id.value().to_string(),
                None => {
                    return Ok(None);
                }
            };
            drop(by_charge);

            let mut payments = txn.open_table(PAYMENTS)?;
            let mut payouts = txn.open_table(PAYOUTS)?;
            let mut payment: Payment = read(&payments, payment_id.as_str())?
                .ok_or_else(|| StoreError::Missing("payment", payment_id.clone()))?;

            payment.status = if full {
                PaymentStatus::Refunded
            } else {
                PaymentStatus::PartiallyRefunded
            };
            payment.updated_at = Utc::now();
            put(&mut payments, payment_id.as_str(), &payment)?;

            if full {
                cancel_pending_payouts_in(&mut payouts, payment_id.as_str())?;
            }
            result = Some(payment);
        }
        txn.commit()?;
        Ok(result)
    }

    /// Revisits settled payments that recorded "no connected account" at
    /// intent time, once the organizer's account becomes fully enabled.
    pub fn backfill_organizer_account(
        &self,
        organizer_id: &str,
        account_ref: &str,
    ) -> Result<usize, StoreError> {
        let txn = self.db.begin_write()?;
        let mut count = 0;
        {
            let mut payments = txn.open_table(PAYMENTS)?;
            let all: Vec<Payment> = scan(&payments)?;
            for mut payment in all {
                if payment.status == PaymentStatus::Succeeded
                    && payment.organizer_account_ref.is_none()
                    && payment.metadata.organizer_id == organizer_id
                {
                    payment.organizer_account_ref = Some(account_ref.to_string());
                    payment.updated_at = Utc::now();
                    put(&mut payments, &payment.id, &payment)?;
                    count += 1;
                }
            }
        }
        txn.commit()?;
        Ok(count)
    }

    // ---- tickets ----

    pub fn get_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>, StoreError> {
        let txn = self.db.begin_read()?;
        let tickets = txn.open_table(TICKETS)?;
        read(&tickets, ticket_id)
    }

    pub fn tickets_for_payment(&self, payment_id: &str) -> Result<Vec<Ticket>, StoreError> {
        let txn = self.db.begin_read()?;
        let tickets = txn.open_table(TICKETS)?;
        tickets_for_payment_in(&tickets, payment_id)
    }

    /// Ticket -> refunded, seat back in the pool, pending payout cancelled.
    pub fn apply_ticket_refund(
        &self,
        ticket_id: &str,
    ) -> Result<TicketRefundOutcome, StoreError> {
        let txn = self.db.begin_write()?;
        let outcome;
        {
            let mut tickets = txn.open_table(TICKETS)?;
            let mut events = txn.open_table(EVENTS)?;
            let mut payouts = txn.open_table(PAYOUTS)?;

            let mut ticket: Ticket = read(&tickets, ticket_id)?
                .ok_or_else(|| StoreError::Missing("ticket", ticket_id.to_string()))?;

            if ticket.status == TicketStatus::Refunded {
                outcome = TicketRefundOutcome::AlreadyRefunded;
            } else {
                ticket.status = TicketStatus::Refunded;
                put(&mut tickets, ticket_id, &ticket)?;

                if let Some(mut event) = read::<EventRecord>(&events, ticket.event_id.as_str())? {
                    if let Some(available) = event.available_tickets {
                        event.available_tickets = Some(available + 1);
                        put(&mut events, &ticket.event_id, &event)?;
                    }
                }

                cancel_pending_payouts_in(&mut payouts, ticket.payment_id.as_str())?;
                outcome = TicketRefundOutcome::Applied;
            }
        }
        txn.commit()?;
        Ok(outcome)
    }

    // ---- payouts ----

    pub fn get_payout(&self, payout_id: &str) -> Result<Option<Payout>, StoreError> {
        let txn = self.db.begin_read()?;
        let payouts = txn.open_table(PAYOUTS)?;
        read(&payouts, payout_id)
    }

    pub fn due_stripe_payouts(&self, now: DateTime<Utc>) -> Result<Vec<Payout>, StoreError> {
        let txn = self.db.begin_read()?;
        let payouts = txn.open_table(PAYOUTS)?;
        let mut due: Vec<Payout> = scan::<Payout>(&payouts)?
            .into_iter()
            .filter(|p| {
                p.status == PayoutStatus::Pending
                    && p.method == PayoutMethod::Stripe
                    && p.account_ref.is_some()
                    && p.scheduled_for <= now
            })
            .collect();
        due.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for));
        Ok(due)
    }

    pub fn list_payouts(
        &self,
        status: Option<PayoutStatus>,
        method: Option<PayoutMethod>,
    ) -> Result<Vec<Payout>, StoreError> {
        let txn = self.db.begin_read()?;
        let payouts = txn.open_table(PAYOUTS)?;
        let mut out: Vec<Payout> = scan::<Payout>(&payouts)?
            .into_iter()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .filter(|p| method.map_or(true, |m| p.method == m))
            .collect();
        out.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for));
        Ok(out)
    }

    pub fn payouts_for_organizer(&self, organizer_id: &str) -> Result<Vec<Payout>, StoreError> {
        let txn = self.db.begin_read()?;
        let payouts = txn.open_table(PAYOUTS)?;
        let mut out: Vec<Payout> = scan::<Payout>(&payouts)?
            .into_iter()
            .filter(|p| p.organizer_id == organizer_id)
            .collect();
        out.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for));
        Ok(out)
    }

    /// Claims a payout for execution by moving it out of `pending` (or
    /// `failed`, for retries) before any gateway call, so a scheduled batch
    /// and an admin retry cannot both execute the same payout.
    pub fn claim_payout(
        &self,
        payout_id: &str,
        allow_failed: bool,
    ) -> Result<Option<Payout>, StoreError> {
        let txn = self.db.begin_write()?;
        let claimed;
        {
            let mut payouts = txn.open_table(PAYOUTS)?;
            let mut payout: Payout = match read(&payouts, payout_id)? {
                Some(p) => p,
                None => {
                    return Err(StoreError::Missing("payout", payout_id.to_string()));
                }
            };

            let eligible = payout.method == PayoutMethod::Stripe
                && payout.account_ref.is_some()
                && (payout.status == PayoutStatus::Pending
                    || (allow_failed && payout.status == PayoutStatus::Failed));
            if !eligible {
                return Ok(None);
            }

            payout.status = PayoutStatus::Processing;
            put(&mut payouts, payout_id, &payout)?;
            claimed = payout;
        }
        txn.commit()?;
        Ok(Some(claimed))
    }

    pub fn mark_payout_paid(
        &self,
        payout_id: &str,
        transfer_ref: &str,
    ) -> Result<Option<Payout>, StoreError> {
        let txn = self.db.begin_write()?;
        let result;
        {
            let mut payouts = txn.open_table(PAYOUTS)?;
            let mut payout: Payout = match read(&payouts, payout_id)? {
                Some(p) => p,
                None => {
                    return Ok(None);
                }
            };
            if payout.status == PayoutStatus::Paid {
                result = Some(payout);
            } else {
                payout.status = PayoutStatus::Paid;
                payout.transfer_ref = Some(transfer_ref.to_string());
                payout.processed_at = Some(Utc::now());
                payout.failure_reason = None;
                put(&mut payouts, payout_id, &payout)?;
                result = Some(payout);
            }
        }
        txn.commit()?;
        Ok(result)
    }

    pub fn mark_payout_failed(
        &self,
        payout_id: &str,
        reason: &str,
    ) -> Result<Option<Payout>, StoreError> {
        let txn = self.db.begin_write()?;
        let result;
        {
            let mut payouts = txn.open_table(PAYOUTS)?;
            let mut payout: Payout = match read(&payouts, payout_id)? {
                Some(p) => p,
                None => {
                    return Ok(None);
                }
            };
            payout.status = PayoutStatus::Failed;
            payout.failure_reason = Some(reason.to_string());
            put(&mut payouts, payout_id, &payout)?;
            result = Some(payout);
        }
        txn.commit()?;
        Ok(result)
    }

    /// Conditional pending+manual -> paid. Stripe-method payouts go through
    /// `claim_payout`/`mark_payout_paid` instead.
    pub fn mark_manual_paid(&self, payout_id: &str) -> Result<Option<Payout>, StoreError> {
        let txn = self.db.begin_write()?;
        let result;
        {
            let mut payouts = txn.open_table(PAYOUTS)?;
            let mut payout: Payout = match read(&payouts, payout_id)? {
                Some(p) => p,
                None => {
                    return Err(StoreError::Missing("payout", payout_id.to_string()));
                }
            };
            if payout.status != PayoutStatus::Pending || payout.method != PayoutMethod::Manual {
                return Ok(None);
            }
            payout.status = PayoutStatus::Paid;
            payout.processed_at = Some(Utc::now());
            put(&mut payouts, payout_id, &payout)?;
            result = Some(payout);
        }
        txn.commit()?;
        Ok(result)
    }

    /// Moves every pending manual payout of an organizer to the stripe
    /// method. Non-pending payouts are left untouched.
    pub fn migrate_manual_payouts(
        &self,
        organizer_id: &str,
        account_ref: &str,
    ) -> Result<usize, StoreError> {
        let txn = self.db.begin_write()?;
        let mut count = 0;
        {
            let mut payouts = txn.open_table(PAYOUTS)?;
            let all: Vec<Payout> = scan(&payouts)?;
            for mut payout in all {
                if payout.organizer_id == organizer_id
                    && payout.status == PayoutStatus::Pending
                    && payout.method == PayoutMethod::Manual
                {
                    payout.method = PayoutMethod::Stripe;
                    payout.account_ref = Some(account_ref.to_string());
                    put(&mut payouts, &payout.id, &payout)?;
                    count += 1;
                }
            }
        }
        txn.commit()?;
        Ok(count)
    }

    // ---- connected accounts ----

    pub fn upsert_account(&self, account: &ConnectedAccount) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut accounts = txn.open_table(ACCOUNTS)?;
            let mut by_ref = txn.open_table(ACCOUNTS_BY_REF)?;
            put(&mut accounts, &account.organizer_id, account)?;
            by_ref.insert(account.account_ref.as_str(), account.organizer_id.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn account_by_organizer(
        &self,
        organizer_id: &str,
    ) -> Result<Option<ConnectedAccount>, StoreError> {
        let txn = self.db.begin_read()?;
        let accounts = txn.open_table(ACCOUNTS)?;
        read(&accounts, organizer_id)
    }

    pub fn account_by_ref(
        &self,
        account_ref: &str,
    ) -> Result<Option<ConnectedAccount>, StoreError> {
        let txn = self.db.begin_read()?;
        let by_ref = txn.open_table(ACCOUNTS_BY_REF)?;
        let Some(organizer) = by_ref.get(account_ref)? else {
            return Ok(None);
        };
        let accounts = txn.open_table(ACCOUNTS)?;
        read(&accounts, organizer.value())
    }

    // ---- audit ----

    pub fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut audit = txn.open_table(AUDIT)?;
            put(&mut audit, &entry.id, entry)?;
        }
        txn.commit()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn list_audit(&self) -> Result<Vec<AuditEntry>, StoreError> {
        let txn = self.db.begin_read()?;
        let audit = txn.open_table(AUDIT)?;
        scan(&audit)
    }
}

fn tickets_for_payment_in(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    payment_id: &str,
) -> Result<Vec<Ticket>, StoreError> {
    let mut out: Vec<Ticket> = scan::<Ticket>(table)?
        .into_iter()
        .filter(|t| t.payment_id == payment_id)
        .collect();
    out.sort_by(|a, b| a.code.cmp(&b.code));
    Ok(out)
}

fn cancel_pending_payouts_in(
    table: &mut redb::Table<&str, &[u8]>,
    payment_id: &str,
) -> Result<usize, StoreError> {
    let all: Vec<Payout> = scan(table)?;
    let mut count = 0;
    for mut payout in all {
        if payout.payment_id == payment_id && payout.status == PayoutStatus::Pending {
            payout.status = PayoutStatus::Cancelled;
            put(table, &payout.id, &payout)?;
            count += 1;
        }
    }
    Ok(count)
}
