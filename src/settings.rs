use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StripeSettings {
    pub api_key: String,
    #[serde(default)]
    pub stripe_version: String,
    #[serde(default = "default_stripe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default = "default_webhook_tolerance_seconds")]
    pub webhook_tolerance_seconds: i64,
}

impl Default for StripeSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            stripe_version: String::new(),
            timeout_ms: default_stripe_timeout_ms(),
            webhook_secret: String::new(),
            webhook_tolerance_seconds: default_webhook_tolerance_seconds(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub stripe: StripeSettings,
    pub server_port: u16,
    pub database_path: String,
    /// Base URL of the web frontend, used for Connect onboarding return links.
    pub frontend_url: String,
    /// Flat platform fee charged to organizers, per ticket, in cents.
    pub platform_fee_cents: i64,
    #[serde(default = "default_payout_poll_interval", with = "humantime_serde")]
    pub payout_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stripe: StripeSettings::default(),
            server_port: 8080,
            database_path: "data/gatherpay.redb".to_string(),
            frontend_url: "http://localhost:3000".to_string(),
            platform_fee_cents: 500,
            payout_poll_interval: default_payout_poll_interval(),
        }
    }
}

impl Config {
    /// Load from config.toml (if present) and environment variables.
    /// Environment variables override file values.
    /// Supported env keys: STRIPE_API_KEY, STRIPE_VERSION, STRIPE_TIMEOUT_MS,
    /// STRIPE_WEBHOOK_SECRET, STRIPE_WEBHOOK_TOLERANCE_SECONDS, SERVER_PORT,
    /// DATABASE_PATH, FRONTEND_URL, PLATFORM_FEE_CENTS, PAYOUT_POLL_INTERVAL
    pub fn load() -> Self {
        // 1) Start with defaults + config.toml only if it exists
        let base: Config = Default::default();
        let mut fig = Figment::from(Serialized::defaults(base));
        if std::path::Path::new("config.toml").exists() {
            fig = fig.merge(Toml::file("config.toml"));
        }
        let mut cfg: Config = fig.extract().unwrap_or_default();

        // 2) Overlay environment variables explicitly
        if let Ok(v) = std::env::var("STRIPE_API_KEY") {
            cfg.stripe.api_key = v;
        }
        if let Ok(v) = std::env::var("STRIPE_VERSION") {
            cfg.stripe.stripe_version = v;
        }
        if let Ok(v) = std::env::var("STRIPE_TIMEOUT_MS") {
            cfg.stripe.timeout_ms = v.parse().unwrap_or(cfg.stripe.timeout_ms);
        }
        if let Ok(v) = std::env::var("STRIPE_WEBHOOK_SECRET") {
            cfg.stripe.webhook_secret = v;
        }
        if let Ok(v) = std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECONDS") {
            cfg.stripe.webhook_tolerance_seconds =
                v.parse().unwrap_or(cfg.stripe.webhook_tolerance_seconds);
        }
        if let Ok(v) = std::env::var("SERVER_PORT") {
            cfg.server_port = v.parse().unwrap_or(cfg.server_port);
        }
        if let Ok(v) = std::env::var("DATABASE_PATH") {
            cfg.database_path = v;
        }
        if let Ok(v) = std::env::var("FRONTEND_URL") {
            cfg.frontend_url = v;
        }
        if let Ok(v) = std::env::var("PLATFORM_FEE_CENTS") {
            cfg.platform_fee_cents = v.parse().unwrap_or(cfg.platform_fee_cents);
        }
        if let Ok(v) = std::env::var("PAYOUT_POLL_INTERVAL") {
            cfg.payout_poll_interval = parse_duration_env(&v, cfg.payout_poll_interval);
        }

        cfg
    }

    pub fn from_env() -> Self {
        Self::load()
    }
}

fn parse_duration_env(value: &str, current: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(current)
}

fn default_stripe_timeout_ms() -> u64 {
    15_000
}

fn default_webhook_tolerance_seconds() -> i64 {
    300 // 5 minutes
}

fn default_payout_poll_interval() -> Duration {
    Duration::from_secs(3600)
}
