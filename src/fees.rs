// Fee arithmetic. Pure functions over integer cents; no I/O.

use serde::{Deserialize, Serialize};

/// Approximate Stripe card processing fee: 2.9% + $0.30.
/// The percentage part rounds half-up on fractional cents.
pub fn stripe_processing_fee(subtotal_cents: i64) -> i64 {
    (subtotal_cents * 29 + 500) / 1000 + 30
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BuyerTotal {
    pub subtotal: i64,
    pub processing_fee: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrganizerPayout {
    pub subtotal: i64,
    pub platform_fee: i64,
    pub payout: i64,
}

/// Fee schedule applied to every ticket sale. The platform fee is flat
/// per ticket; the processing fee is computed on the aggregate subtotal,
/// never per unit.
#[derive(Debug, Clone, Copy)]
pub struct FeeSchedule {
    pub platform_fee_per_ticket: i64,
}

impl FeeSchedule {
    pub fn new(platform_fee_per_ticket: i64) -> Self {
        Self {
            platform_fee_per_ticket,
        }
    }

    /// Amount the buyer is charged: ticket subtotal plus processing fee.
    /// Callers must validate quantity >= 1 first.
    pub fn buyer_total(&self, unit_price_cents: i64, quantity: u32) -> BuyerTotal {
        let subtotal = unit_price_cents * quantity as i64;
        let processing_fee = stripe_processing_fee(subtotal);
        BuyerTotal {
            subtotal,
            processing_fee,
            total: subtotal + processing_fee,
        }
    }

    /// Amount owed to the organizer: subtotal minus the flat platform fee.
    /// The processing fee never comes out of the organizer's share.
    pub fn organizer_payout(&self, unit_price_cents: i64, quantity: u32) -> OrganizerPayout {
        let subtotal = unit_price_cents * quantity as i64;
        let platform_fee = self.platform_fee_per_ticket * quantity as i64;
        OrganizerPayout {
            subtotal,
            platform_fee,
            payout: subtotal - platform_fee,
        }
    }
}

/// Split an aggregate amount evenly across `quantity` tickets.
/// The first `amount % quantity` shares carry the extra cent, so the
/// shares always sum back to the aggregate exactly.
pub fn split_even(amount_cents: i64, quantity: u32) -> Vec<i64> {
    let n = quantity as i64;
    let base = amount_cents / n;
    let remainder = amount_cents % n;
    (0..n)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}
