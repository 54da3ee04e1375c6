//! Configuration loading and representation.
//!
//! Every setting comes from a `PODLEDGER_*` environment variable with a
//! development default. Unparseable values are errors, missing ones are not.
//! `DATABASE_URL` selects Postgres persistence; without it state lives in
//! memory.

use thiserror::Error;
use tracing::warn;

pub const DEV_WEBHOOK_SECRET: &str = "dev-webhook-secret";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Days between invoice creation and due date.
    pub invoice_due_days: i64,
    /// Retries after an optimistic concurrency conflict before giving up.
    pub allocation_max_retries: u32,
    pub payos_secret: String,
    pub sepay_secret: String,
    pub payment_link_base_url: String,
    /// Seconds a claimed webhook log may stay `Processing` before replay
    /// claims it again.
    pub webhook_claim_lease_secs: u64,
    pub database_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            invoice_due_days: 15,
            allocation_max_retries: 5,
            payos_secret: DEV_WEBHOOK_SECRET.to_string(),
            sepay_secret: DEV_WEBHOOK_SECRET.to_string(),
            payment_link_base_url: "http://localhost:8080/checkout".to_string(),
            webhook_claim_lease_secs: 300,
            database_url: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            bind_addr: lookup("PODLEDGER_BIND_ADDR").unwrap_or(defaults.bind_addr),
            invoice_due_days: parse(
                &lookup,
                "PODLEDGER_INVOICE_DUE_DAYS",
                defaults.invoice_due_days,
            )?,
            allocation_max_retries: parse(
                &lookup,
                "PODLEDGER_ALLOCATION_MAX_RETRIES",
                defaults.allocation_max_retries,
            )?,
            payos_secret: lookup("PODLEDGER_PAYOS_SECRET").unwrap_or(defaults.payos_secret),
            sepay_secret: lookup("PODLEDGER_SEPAY_SECRET").unwrap_or(defaults.sepay_secret),
            payment_link_base_url: lookup("PODLEDGER_PAYMENT_LINK_BASE_URL")
                .unwrap_or(defaults.payment_link_base_url),
            webhook_claim_lease_secs: parse(
                &lookup,
                "PODLEDGER_WEBHOOK_CLAIM_LEASE_SECS",
                defaults.webhook_claim_lease_secs,
            )?,
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
        };

        if config.webhook_claim_lease_secs == 0
            || config.webhook_claim_lease_secs > MAX_CLAIM_LEASE_SECS
        {
            return Err(ConfigError::Invalid {
                key: "PODLEDGER_WEBHOOK_CLAIM_LEASE_SECS",
                value: config.webhook_claim_lease_secs.to_string(),
                reason: format!("must be between 1 and {MAX_CLAIM_LEASE_SECS}"),
            });
        }

        if config.invoice_due_days < 0 {
            return Err(ConfigError::Invalid {
                key: "PODLEDGER_INVOICE_DUE_DAYS",
                value: config.invoice_due_days.to_string(),
                reason: "must not be negative".to_string(),
            });
        }

        if config.payos_secret == DEV_WEBHOOK_SECRET || config.sepay_secret == DEV_WEBHOOK_SECRET {
            warn!("webhook secrets not set; using insecure dev default");
        }

        Ok(config)
    }

    pub fn webhook_claim_lease(&self) -> chrono::Duration {
        let secs = self.webhook_claim_lease_secs.min(MAX_CLAIM_LEASE_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(0))
    }
}

/// One week.
const MAX_CLAIM_LEASE_SECS: u64 = 7 * 24 * 60 * 60;

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}
