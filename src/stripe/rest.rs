// Stripe REST client
// Implements minimal endpoints with USD/cents enforcement and idempotency header propagation.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::future::Future;
use tracing::{info, instrument, warn};

use crate::stripe::errors::{is_transient, StripeApiError, StripeErrorEnvelope};
use crate::stripe::types::{
    ensure_usd_cents, Account, AccountLink, PaymentIntent, Refund, Transfer,
};

const STRIPE_API_BASE: &str = "https://api.stripe.com";

#[derive(Clone)]
pub struct StripeRestClient {
    pub(crate) http: Client,
    pub(crate) api_key: String,
    pub(crate) stripe_version: Option<String>,
    // Retry knobs with safe defaults
    pub(crate) max_retries: u32,
    pub(crate) base_delay_ms: u64,
    pub(crate) max_delay_ms: u64,
}

impl StripeRestClient {
    pub fn new(http: Client, api_key: String) -> Self {
        Self {
            http,
            api_key,
            stripe_version: None,
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }

    pub fn with_version(mut self, ver: impl Into<Option<String>>) -> Self {
        self.stripe_version = ver.into();
        self
    }

    #[allow(dead_code)]
    pub fn with_retry(mut self, max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.base_delay_ms = base_delay_ms.max(1);
        self.max_delay_ms = if max_delay_ms == 0 {
            self.base_delay_ms
        } else {
            max_delay_ms
        };
        if self.max_delay_ms < self.base_delay_ms {
            self.max_delay_ms = self.base_delay_ms;
        }
        self
    }

    fn apply_common_headers(
        &self,
        req: reqwest::RequestBuilder,
        idempotency_key: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut req = req.bearer_auth(&self.api_key);
        if let Some(k) = idempotency_key {
            req = req.header("Idempotency-Key", k);
        }
        if let Some(v) = &self.stripe_version {
            if !v.is_empty() {
                req = req.header("Stripe-Version", v);
            }
        }
        req
    }

    fn map_error(status: StatusCode, body: &str) -> StripeApiError {
        if let Ok(env) = serde_json::from_str::<StripeErrorEnvelope>(body) {
            env.to_api_error_with_status(Some(status.as_u16()))
        } else {
            StripeApiError::Http(format!("status={} body={}", status.as_u16(), body))
        }
    }

    async fn with_retries<F, Fut, T>(
        &self,
        desc: &str,
        max_retries: u32,
        mut op: F,
    ) -> Result<T, StripeApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StripeApiError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    // Determine retryability
                    let (http_status, err_type) = match &e {
                        StripeApiError::Stripe { status, type_, .. } => (*status, Some(type_)),
                        StripeApiError::Http(_) => (Some(503), None),
                        StripeApiError::Transient(_) => (Some(503), None),
                        _ => (None, None),
                    };
                    let retryable = is_transient(http_status, err_type);
                    if !retryable || attempt >= max_retries {
                        return Err(e);
                    }

                    // Exponential backoff with full jitter
                    let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(20));
                    let cap = exp.min(self.max_delay_ms.max(self.base_delay_ms));
                    let mut rng = SmallRng::from_entropy();
                    let delay_ms = if cap > self.base_delay_ms {
                        rng.gen_range(self.base_delay_ms..=cap)
                    } else {
                        self.base_delay_ms
                    };

                    warn!(
                        target: "stripe",
                        desc = %desc,
                        attempt = attempt + 1,
                        max_retries = max_retries,
                        http_status = ?http_status,
                        error_type = ?err_type,
                        next_delay_ms = delay_ms,
                        "retrying transient Stripe error"
                    );

                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> Result<T, StripeApiError> {
        let url = format!("{}{}", STRIPE_API_BASE, path);
        let req = self.http.post(url).form(form);
        let req = self.apply_common_headers(req, idempotency_key);
        let resp = req
            .send()
            .await
            .map_err(|e| StripeApiError::Http(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| StripeApiError::Decode(e.to_string()))?;
        if status.is_success() {
            serde_json::from_str::<T>(&text).map_err(|e| StripeApiError::Decode(e.to_string()))
        } else {
            Err(Self::map_error(status, &text))
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, StripeApiError> {
        let url = format!("{}{}", STRIPE_API_BASE, path);
        let req = self.http.get(url);
        let req = self.apply_common_headers(req, None);
        let resp = req
            .send()
            .await
            .map_err(|e| StripeApiError::Http(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| StripeApiError::Decode(e.to_string()))?;
        if status.is_success() {
            serde_json::from_str::<T>(&text).map_err(|e| StripeApiError::Decode(e.to_string()))
        } else {
            Err(Self::map_error(status, &text))
        }
    }

    // POST /v1/payment_intents
    // application/x-www-form-urlencoded; enforce USD & cents.
    // No transfer_data: funds land in the platform account and move to the
    // organizer only after the event ends.
    #[instrument(skip(self, metadata), fields(method = "POST", path = "/v1/payment_intents", idempotency_key = ?idempotency_key))]
    pub async fn create_payment_intent(
        &self,
        amount_cents: i64,
        currency: &str,
        metadata: &HashMap<String, String>,
        idempotency_key: Option<&str>,
    ) -> Result<PaymentIntent, StripeApiError> {
        ensure_usd_cents(amount_cents, currency)
            .map_err(|_| StripeApiError::Precondition("USD currency and non-negative cents required"))?;

        let mut form: Vec<(String, String)> = Vec::new();
        form.push(("amount".into(), amount_cents.to_string()));
        form.push(("currency".into(), currency.to_ascii_lowercase()));
        form.push(("automatic_payment_methods[enabled]".into(), "true".into()));
        for (k, v) in metadata {
            form.push((format!("metadata[{}]", k), v.clone()));
        }

        info!(
            target: "stripe",
            method = "POST",
            path = "/v1/payment_intents",
            amount_cents = amount_cents,
            currency = %currency,
            idempotency_key = idempotency_key.unwrap_or(""),
            "stripe request"
        );

        self.with_retries("create_payment_intent", self.max_retries, || {
            self.post_form("/v1/payment_intents", &form, idempotency_key)
        })
        .await
    }

    // GET /v1/payment_intents/{id}
    #[instrument(skip(self), fields(method = "GET", path = "/v1/payment_intents/{id}", intent_id = %intent_id))]
    pub async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, StripeApiError> {
        info!(
            target: "stripe",
            method = "GET",
            path = "/v1/payment_intents/{id}",
            intent_id = %intent_id,
            "stripe request"
        );
        // Keep retrieve lightweight: single retry only
        let path = format!("/v1/payment_intents/{}", intent_id);
        self.with_retries("retrieve_intent", 1, || self.get_json(&path)).await
    }

    // POST /v1/refunds
    #[instrument(skip(self), fields(method = "POST", path = "/v1/refunds", intent_id = %payment_intent_id))]
    pub async fn create_refund(
        &self,
        payment_intent_id: &str,
        amount_cents: i64,
    ) -> Result<Refund, StripeApiError> {
        if amount_cents <= 0 {
            return Err(StripeApiError::Precondition("refund amount must be positive cents"));
        }

        let form: Vec<(String, String)> = vec![
            ("payment_intent".into(), payment_intent_id.to_string()),
            ("amount".into(), amount_cents.to_string()),
        ];

        info!(
            target: "stripe",
            method = "POST",
            path = "/v1/refunds",
            intent_id = %payment_intent_id,
            amount_cents = amount_cents,
            "stripe request"
        );

        self.with_retries("create_refund", self.max_retries, || {
            self.post_form("/v1/refunds", &form, None)
        })
        .await
    }

    // POST /v1/transfers
    // Create a transfer to a connected Stripe account
    #[instrument(skip(self, metadata), fields(method = "POST", path = "/v1/transfers", idempotency_key = ?idempotency_key))]
    pub async fn create_transfer(
        &self,
        amount_cents: i64,
        currency: &str,
        destination: &str,
        transfer_group: &str,
        metadata: &HashMap<String, String>,
        idempotency_key: Option<&str>,
    ) -> Result<Transfer, StripeApiError> {
        ensure_usd_cents(amount_cents, currency)
            .map_err(|_| StripeApiError::Precondition("USD currency and non-negative cents required"))?;

        let mut form: Vec<(String, String)> = Vec::new();
        form.push(("amount".into(), amount_cents.to_string()));
        form.push(("currency".into(), currency.to_ascii_lowercase()));
        form.push(("destination".into(), destination.to_string()));
        form.push(("transfer_group".into(), transfer_group.to_string()));
        for (k, v) in metadata {
            form.push((format!("metadata[{}]", k), v.clone()));
        }

        info!(
            target: "stripe",
            method = "POST",
            path = "/v1/transfers",
            amount_cents = amount_cents,
            currency = %currency,
            destination = %destination,
            transfer_group = %transfer_group,
            idempotency_key = idempotency_key.unwrap_or(""),
            "stripe request"
        );

        self.with_retries("create_transfer", self.max_retries, || {
            self.post_form("/v1/transfers", &form, idempotency_key)
        })
        .await
    }

    // POST /v1/accounts
    // Express account with card_payments + transfers capabilities.
    #[instrument(skip(self, metadata), fields(method = "POST", path = "/v1/accounts", email = %email))]
    pub async fn create_account(
        &self,
        email: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<Account, StripeApiError> {
        let mut form: Vec<(String, String)> = vec![
            ("type".into(), "express".into()),
            ("country".into(), "US".into()),
            ("email".into(), email.to_string()),
            ("capabilities[card_payments][requested]".into(), "true".into()),
            ("capabilities[transfers][requested]".into(), "true".into()),
            ("business_type".into(), "individual".into()),
        ];
        for (k, v) in metadata {
            form.push((format!("metadata[{}]", k), v.clone()));
        }

        info!(
            target: "stripe",
            method = "POST",
            path = "/v1/accounts",
            email = %email,
            "stripe request"
        );

        self.with_retries("create_account", self.max_retries, || {
            self.post_form("/v1/accounts", &form, None)
        })
        .await
    }

    // GET /v1/accounts/{id}
    #[instrument(skip(self), fields(method = "GET", path = "/v1/accounts/{id}", account_id = %account_id))]
    pub async fn retrieve_account(&self, account_id: &str) -> Result<Account, StripeApiError> {
        info!(
            target: "stripe",
            method = "GET",
            path = "/v1/accounts/{id}",
            account_id = %account_id,
            "stripe request"
        );
        let path = format!("/v1/accounts/{}", account_id);
        self.with_retries("retrieve_account", 1, || self.get_json(&path)).await
    }

    // POST /v1/account_links
    #[instrument(skip(self), fields(method = "POST", path = "/v1/account_links", account_id = %account_id))]
    pub async fn create_account_link(
        &self,
        account_id: &str,
        refresh_url: &str,
        return_url: &str,
    ) -> Result<AccountLink, StripeApiError> {
        let form: Vec<(String, String)> = vec![
            ("account".into(), account_id.to_string()),
            ("refresh_url".into(), refresh_url.to_string()),
            ("return_url".into(), return_url.to_string()),
            ("type".into(), "account_onboarding".into()),
        ];

        info!(
            target: "stripe",
            method = "POST",
            path = "/v1/account_links",
            account_id = %account_id,
            "stripe request"
        );

        self.with_retries("create_account_link", self.max_retries, || {
            self.post_form("/v1/account_links", &form, None)
        })
        .await
    }
}
