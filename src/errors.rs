// Core error taxonomy shared by the ledger, payout scheduler and account manager.

use thiserror::Error;

use crate::store::StoreError;
use crate::stripe::errors::StripeApiError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("only {available} tickets available")]
    InsufficientInventory { available: i64 },
    #[error("not authorized")]
    Unauthorized,
    #[error("this is a free event; use the registration flow instead")]
    WrongFlow,
    #[error("payment provider error: {0}")]
    Provider(#[from] StripeApiError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }
}
