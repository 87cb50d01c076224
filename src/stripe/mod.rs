// Stripe provider module

pub mod errors;
pub mod rest;
pub mod types;
pub mod webhook;

use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;

use crate::settings::StripeSettings;
use self::errors::StripeApiError;
use self::rest::StripeRestClient;
use self::types::{Account, AccountLink, PaymentIntent, Refund, Transfer};

/// The subset of the Stripe API the core components call. The REST client
/// implements it against api.stripe.com; tests substitute a mock.
#[async_trait]
pub trait StripeApi: Send + Sync {
    async fn create_payment_intent(
        &self,
        amount_cents: i64,
        currency: &str,
        metadata: &HashMap<String, String>,
        idempotency_key: Option<&str>,
    ) -> Result<PaymentIntent, StripeApiError>;

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, StripeApiError>;

    async fn create_refund(
        &self,
        payment_intent_id: &str,
        amount_cents: i64,
    ) -> Result<Refund, StripeApiError>;

    async fn create_transfer(
        &self,
        amount_cents: i64,
        currency: &str,
        destination: &str,
        transfer_group: &str,
        metadata: &HashMap<String, String>,
        idempotency_key: Option<&str>,
    ) -> Result<Transfer, StripeApiError>;

    async fn create_account(
        &self,
        email: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<Account, StripeApiError>;

    async fn retrieve_account(&self, account_id: &str) -> Result<Account, StripeApiError>;

    async fn create_account_link(
        &self,
        account_id: &str,
        refresh_url: &str,
        return_url: &str,
    ) -> Result<AccountLink, StripeApiError>;
}

#[async_trait]
impl StripeApi for StripeRestClient {
    async fn create_payment_intent(
        &self,
        amount_cents: i64,
        currency: &str,
        metadata: &HashMap<String, String>,
        idempotency_key: Option<&str>,
    ) -> Result<PaymentIntent, StripeApiError> {
        StripeRestClient::create_payment_intent(self, amount_cents, currency, metadata, idempotency_key)
            .await
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, StripeApiError> {
        StripeRestClient::retrieve_intent(self, intent_id).await
    }

    async fn create_refund(
        &self,
        payment_intent_id: &str,
        amount_cents: i64,
    ) -> Result<Refund, StripeApiError> {
        StripeRestClient::create_refund(self, payment_intent_id, amount_cents).await
    }

    async fn create_transfer(
        &self,
        amount_cents: i64,
        currency: &str,
        destination: &str,
        transfer_group: &str,
        metadata: &HashMap<String, String>,
        idempotency_key: Option<&str>,
    ) -> Result<Transfer, StripeApiError> {
        StripeRestClient::create_transfer(
            self,
            amount_cents,
            currency,
            destination,
            transfer_group,
            metadata,
            idempotency_key,
        )
        .await
    }

    async fn create_account(
        &self,
        email: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<Account, StripeApiError> {
        StripeRestClient::create_account(self, email, metadata).await
    }

    async fn retrieve_account(&self, account_id: &str) -> Result<Account, StripeApiError> {
        StripeRestClient::retrieve_account(self, account_id).await
    }

    async fn create_account_link(
        &self,
        account_id: &str,
        refresh_url: &str,
        return_url: &str,
    ) -> Result<AccountLink, StripeApiError> {
        StripeRestClient::create_account_link(self, account_id, refresh_url, return_url).await
    }
}

#[derive(Clone)]
pub struct StripeProvider {
    pub(crate) cfg: StripeSettings,
    pub(crate) rest: StripeRestClient,
}

impl StripeProvider {
    // Build reqwest client with rustls and timeout from cfg, store cfg clone.
    pub fn new(cfg: StripeSettings) -> Result<Self, StripeApiError> {
        let timeout = std::time::Duration::from_millis(if cfg.timeout_ms > 0 {
            cfg.timeout_ms
        } else {
            15_000
        });
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| StripeApiError::Http(e.to_string()))?;

        let rest = StripeRestClient::new(http, cfg.api_key.clone()).with_version(
            if cfg.stripe_version.is_empty() {
                None
            } else {
                Some(cfg.stripe_version.clone())
            },
        );

        Ok(Self {
            cfg: cfg.clone(),
            rest,
        })
    }

    pub fn api(&self) -> Arc<dyn StripeApi> {
        Arc::new(self.rest.clone())
    }

    pub fn webhook_secret(&self) -> &str {
        &self.cfg.webhook_secret
    }

    pub fn webhook_tolerance_seconds(&self) -> i64 {
        self.cfg.webhook_tolerance_seconds
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Scriptable in-memory gateway. Records calls; individual operations can
    /// be told to fail for specific references.
    #[derive(Default)]
    pub struct MockStripe {
        pub intents: Mutex<Vec<PaymentIntent>>,
        pub transfers: Mutex<Vec<Transfer>>,
        pub refunds: Mutex<Vec<Refund>>,
        pub failing_destinations: Mutex<Vec<String>>,
        pub intent_creation_fails: Mutex<bool>,
        pub accounts: Mutex<HashMap<String, Account>>,
        counter: Mutex<u64>,
    }

    impl MockStripe {
        pub fn new() -> Self {
            Self::default()
        }

        fn next(&self) -> u64 {
            let mut c = self.counter.lock().unwrap();
            *c += 1;
            *c
        }

        pub fn fail_transfers_to(&self, destination: &str) {
            self.failing_destinations
                .lock()
                .unwrap()
                .push(destination.to_string());
        }

        pub fn fail_intent_creation(&self, fail: bool) {
            *self.intent_creation_fails.lock().unwrap() = fail;
        }

        pub fn put_account(&self, account: Account) {
            self.accounts
                .lock()
                .unwrap()
                .insert(account.id.clone(), account);
        }
    }

    #[async_trait]
    impl StripeApi for MockStripe {
        async fn create_payment_intent(
            &self,
            amount_cents: i64,
            currency: &str,
            _metadata: &HashMap<String, String>,
            _idempotency_key: Option<&str>,
        ) -> Result<PaymentIntent, StripeApiError> {
            if *self.intent_creation_fails.lock().unwrap() {
                return Err(StripeApiError::Http("connection reset".into()));
            }
            let n = self.next();
            let intent = PaymentIntent {
                id: format!("pi_mock_{n}"),
                status: "requires_payment_method".to_string(),
                amount: amount_cents,
                currency: currency.to_string(),
                client_secret: Some(format!("pi_mock_{n}_secret")),
                latest_charge: None,
                last_payment_error: None,
            };
            self.intents.lock().unwrap().push(intent.clone());
            Ok(intent)
        }

        async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, StripeApiError> {
            self.intents
                .lock()
                .unwrap()
                .iter()
                .find(|i| i.id == intent_id)
                .cloned()
                .ok_or_else(|| StripeApiError::Http("no such intent".into()))
        }

        async fn create_refund(
            &self,
            payment_intent_id: &str,
            amount_cents: i64,
        ) -> Result<Refund, StripeApiError> {
            let n = self.next();
            let refund = Refund {
                id: format!("re_mock_{n}"),
                status: "succeeded".to_string(),
                amount: Some(amount_cents),
                payment_intent: Some(payment_intent_id.to_string()),
                charge: None,
            };
            self.refunds.lock().unwrap().push(refund.clone());
            Ok(refund)
        }

        async fn create_transfer(
            &self,
            amount_cents: i64,
            currency: &str,
            destination: &str,
            _transfer_group: &str,
            metadata: &HashMap<String, String>,
            _idempotency_key: Option<&str>,
        ) -> Result<Transfer, StripeApiError> {
            if self
                .failing_destinations
                .lock()
                .unwrap()
                .iter()
                .any(|d| d == destination)
            {
                return Err(StripeApiError::Http("insufficient platform balance".into()));
            }
            let n = self.next();
            let transfer = Transfer {
                id: format!("tr_mock_{n}"),
                amount: amount_cents,
                currency: currency.to_string(),
                destination: destination.to_string(),
                metadata: metadata.clone(),
                reversed: None,
            };
            self.transfers.lock().unwrap().push(transfer.clone());
            Ok(transfer)
        }

        async fn create_account(
            &self,
            _email: &str,
            _metadata: &HashMap<String, String>,
        ) -> Result<Account, StripeApiError> {
            let n = self.next();
            let account = Account {
                id: format!("acct_mock_{n}"),
                details_submitted: false,
                charges_enabled: false,
                payouts_enabled: false,
                business_type: Some("individual".to_string()),
                business_profile: None,
            };
            self.put_account(account.clone());
            Ok(account)
        }

        async fn retrieve_account(&self, account_id: &str) -> Result<Account, StripeApiError> {
            self.accounts
                .lock()
                .unwrap()
                .get(account_id)
                .cloned()
                .ok_or_else(|| StripeApiError::Http("no such account".into()))
        }

        async fn create_account_link(
            &self,
            account_id: &str,
            _refresh_url: &str,
            _return_url: &str,
        ) -> Result<AccountLink, StripeApiError> {
            Ok(AccountLink {
                url: format!("https://connect.stripe.com/setup/{account_id}"),
                expires_at: None,
            })
        }
    }
}
