// Connect account onboarding and status tracking for organizers.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::Error;
use crate::store::{ConnectedAccount, Store};
use crate::stripe::types::Account;
use crate::stripe::StripeApi;

#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub has_account: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_ref: Option<String>,
    pub onboarding_complete: bool,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OnboardingStarted {
    pub onboarding_url: String,
    pub account_ref: String,
}

pub struct AccountManager {
    store: Arc<Store>,
    stripe: Arc<dyn StripeApi>,
    frontend_url: String,
}

impl AccountManager {
    pub fn new(store: Arc<Store>, stripe: Arc<dyn StripeApi>, frontend_url: String) -> Self {
        Self {
            store,
            stripe,
            frontend_url,
        }
    }

    fn refresh_url(&self) -> String {
        format!("{}/settings/payments?refresh=true", self.frontend_url)
    }

    fn return_url(&self) -> String {
        format!("{}/settings/payments?success=true", self.frontend_url)
    }

    /// Starts (or resumes) Connect onboarding for an organizer. An existing
    /// incomplete account gets a fresh link rather than a duplicate account.
    pub async fn create_account(
        &self,
        organizer_id: &str,
        email: &str,
    ) -> Result<OnboardingStarted, Error> {
        if let Some(existing) = self.store.account_by_organizer(organizer_id)? {
            if existing.onboarding_complete {
                return Err(Error::invalid_state(
                    "organizer already has a connected account",
                ));
            }
            let link = self
                .stripe
                .create_account_link(&existing.account_ref, &self.refresh_url(), &self.return_url())
                .await?;
            return Ok(OnboardingStarted {
                onboarding_url: link.url,
                account_ref: existing.account_ref,
            });
        }

        let mut metadata = HashMap::new();
        metadata.insert("organizer_id".to_string(), organizer_id.to_string());
        let account = self.stripe.create_account(email, &metadata).await?;

        self.store.upsert_account(&ConnectedAccount {
            organizer_id: organizer_id.to_string(),
            account_ref: account.id.clone(),
            onboarding_complete: false,
            charges_enabled: false,
            payouts_enabled: false,
            business_name: None,
            business_type: account.business_type.clone(),
            created_at: Utc::now(),
        })?;

        let link = self
            .stripe
            .create_account_link(&account.id, &self.refresh_url(), &self.return_url())
            .await?;

        info!(organizer_id = %organizer_id, account_ref = %account.id, "connect onboarding started");

        Ok(OnboardingStarted {
            onboarding_url: link.url,
            account_ref: account.id,
        })
    }

    /// Pulls the latest flags from the provider and persists them.
    pub async fn sync_status(&self, organizer_id: &str) -> Result<AccountStatus, Error> {
        let Some(record) = self.store.account_by_organizer(organizer_id)? else {
            return Ok(AccountStatus {
                has_account: false,
                account_ref: None,
                onboarding_complete: false,
                charges_enabled: false,
                payouts_enabled: false,
                business_name: None,
            });
        };

        let account = self.stripe.retrieve_account(&record.account_ref).await?;
        let updated = self.apply_flags(record, &account)?;

        Ok(AccountStatus {
            has_account: true,
            account_ref: Some(updated.account_ref.clone()),
            onboarding_complete: updated.onboarding_complete,
            charges_enabled: updated.charges_enabled,
            payouts_enabled: updated.payouts_enabled,
            business_name: updated.business_name,
        })
    }

    /// Fresh onboarding link for an organizer whose previous link expired.
    pub async fn onboarding_link(&self, organizer_id: &str) -> Result<String, Error> {
        let record = self
            .store
            .account_by_organizer(organizer_id)?
            .ok_or(Error::NotFound("connected account"))?;
        let link = self
            .stripe
            .create_account_link(&record.account_ref, &self.refresh_url(), &self.return_url())
            .await?;
        Ok(link.url)
    }

    /// Applies an `account.updated` webhook payload to the stored record.
    /// Returns the updated record, or None when the account is unknown.
    pub fn sync_from_event(&self, account: &Account) -> Result<Option<ConnectedAccount>, Error> {
        let Some(record) = self.store.account_by_ref(&account.id)? else {
            warn!(account_ref = %account.id, "account.updated for unknown account");
            return Ok(None);
        };
        Ok(Some(self.apply_flags(record, account)?))
    }

    fn apply_flags(
        &self,
        mut record: ConnectedAccount,
        account: &Account,
    ) -> Result<ConnectedAccount, Error> {
        record.onboarding_complete = account.details_submitted;
        record.charges_enabled = account.charges_enabled;
        record.payouts_enabled = account.payouts_enabled;
        record.business_name = account
            .business_profile
            .as_ref()
            .and_then(|p| p.name.clone());
        record.business_type = account.business_type.clone();
        self.store.upsert_account(&record)?;
        Ok(record)
    }
}
