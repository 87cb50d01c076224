// Persisted record types. All money fields are integer cents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
    PartiallyRefunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Confirmed,
    Used,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    /// Claimed by an executor; resolves to paid or failed within the call.
    Processing,
    Paid,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutMethod {
    Stripe,
    Manual,
}

/// Buyer contact and purchase details captured when the intent is created.
/// Ticket rows are only written at reconciliation time, so everything needed
/// to build them has to ride along on the payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMetadata {
    pub quantity: u32,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub event_title: String,
    pub organizer_id: String,
    pub organizer_has_stripe: bool,
}

/// One buyer transaction for N tickets to one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    /// Provider payment-intent reference. Starts as a locally-generated
    /// `pending_<uuid>` placeholder and is swapped for the real `pi_...`
    /// once the provider intent exists.
    pub intent_ref: String,
    pub buyer_id: String,
    pub event_id: String,
    pub subtotal: i64,
    pub platform_fee: i64,
    pub processing_fee: i64,
    pub total_amount: i64,
    pub organizer_amount: i64,
    /// Whether the organizer had a fully-enabled connected account at intent
    /// time. Deliberately not re-derived later; `account.updated` backfills.
    pub organizer_account_ref: Option<String>,
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub metadata: PaymentMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One unit of admission. Created in a batch of `quantity` rows per settled
/// payment; never deleted (refunds flip the status).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub code: String,
    pub event_id: String,
    pub buyer_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub unit_price: i64,
    pub total_price: i64,
    pub platform_fee: i64,
    pub processing_fee: i64,
    pub status: TicketStatus,
    pub payment_id: String,
    pub purchased_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
}

/// An obligation to pay an organizer for one payment, independent of the
/// mechanism (transfer vs. off-platform) that fulfills it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: String,
    pub organizer_id: String,
    pub payment_id: String,
    pub event_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: PayoutStatus,
    pub method: PayoutMethod,
    /// Non-null exactly when method is stripe.
    pub account_ref: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An organizer's provider-side payout account. At most one per organizer;
/// never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedAccount {
    pub organizer_id: String,
    pub account_ref: String,
    pub onboarding_complete: bool,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ConnectedAccount {
    /// Only a fully enabled account may receive stripe-method payouts.
    pub fn fully_enabled(&self) -> bool {
        self.onboarding_complete && self.charges_enabled && self.payouts_enabled
    }
}

/// Event fields the payment core reads. Rows are owned and written by the
/// wider platform; inventory is the only field this service mutates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub title: String,
    pub organizer_id: String,
    pub is_free: bool,
    pub ticket_price: i64,
    /// None means the event does not track a finite inventory.
    pub available_tickets: Option<i64>,
    pub start_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub actor: String,
    pub action: String,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use chrono::Duration;

    pub fn event_with_inventory(
        id: &str,
        organizer_id: &str,
        available: Option<i64>,
    ) -> EventRecord {
        EventRecord {
            id: id.to_string(),
            title: "Summer Picnic".to_string(),
            organizer_id: organizer_id.to_string(),
            is_free: false,
            ticket_price: 1234,
            available_tickets: available,
            start_date: Utc::now() + Duration::days(7),
            end_date: Some(Utc::now() + Duration::days(7) + Duration::hours(6)),
        }
    }

    pub fn sample_payment(id: &str, intent_ref: &str, event_id: &str, organizer_id: &str) -> Payment {
        Payment {
            id: id.to_string(),
            intent_ref: intent_ref.to_string(),
            buyer_id: "user_1".to_string(),
            event_id: event_id.to_string(),
            subtotal: 1234,
            platform_fee: 500,
            processing_fee: 66,
            total_amount: 1300,
            organizer_amount: 734,
            organizer_account_ref: None,
            status: PaymentStatus::Pending,
            charge_ref: None,
            failure_reason: None,
            metadata: PaymentMetadata {
                quantity: 1,
                first_name: "Ada".to_string(),
                last_name: "Obi".to_string(),
                email: "ada@example.com".to_string(),
                phone: None,
                event_title: "Summer Picnic".to_string(),
                organizer_id: organizer_id.to_string(),
                organizer_has_stripe: false,
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn sample_payout(
        id: &str,
        payment: &Payment,
        method: PayoutMethod,
        account_ref: Option<&str>,
    ) -> Payout {
        Payout {
            id: id.to_string(),
            organizer_id: payment.metadata.organizer_id.clone(),
            payment_id: payment.id.clone(),
            event_id: payment.event_id.clone(),
            amount: payment.organizer_amount,
            currency: "usd".to_string(),
            status: PayoutStatus::Pending,
            method,
            account_ref: account_ref.map(str::to_string),
            scheduled_for: Utc::now() - Duration::hours(1),
            processed_at: None,
            transfer_ref: None,
            failure_reason: None,
            created_at: Utc::now(),
        }
    }
}
