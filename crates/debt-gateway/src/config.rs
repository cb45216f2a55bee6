use std::env;

use rust_decimal::Decimal;

use crate::constants::{
    DEFAULT_AMOUNT_SCALE, DEFAULT_COMMISSION_RATE, DEFAULT_DB_PATH, DEFAULT_PAYMENT_THRESHOLD,
};

/// Gateway configuration. Built from the environment at startup; every
/// field has a default so a bare process comes up in a sane dev state.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// SQLite database path for the debt ledger
    pub db_path: String,
    /// Default per-payer payment threshold for lazily created accounts
    pub payment_threshold: Decimal,
    /// Decimal precision of quoted amounts (settlement asset's smallest unit)
    pub amount_scale: u32,
    /// Platform commission rate applied on top of metered base cost
    pub commission_rate: Decimal,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            payment_threshold: DEFAULT_PAYMENT_THRESHOLD
                .parse()
                .expect("default threshold is a valid decimal"),
            amount_scale: DEFAULT_AMOUNT_SCALE,
            commission_rate: DEFAULT_COMMISSION_RATE
                .parse()
                .expect("default commission rate is a valid decimal"),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = env::var("DEBT_DB_PATH").unwrap_or(defaults.db_path);

        let payment_threshold = match env::var("PAYMENT_THRESHOLD") {
            Ok(raw) => raw
                .parse::<Decimal>()
                .map_err(|_| ConfigError::InvalidDecimal("PAYMENT_THRESHOLD", raw))?,
            Err(_) => defaults.payment_threshold,
        };
        if payment_threshold < Decimal::ZERO {
            return Err(ConfigError::InvalidDecimal(
                "PAYMENT_THRESHOLD",
                payment_threshold.to_string(),
            ));
        }

        let amount_scale = env::var("AMOUNT_SCALE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.amount_scale);

        let commission_rate = match env::var("COMMISSION_RATE") {
            Ok(raw) => raw
                .parse::<Decimal>()
                .map_err(|_| ConfigError::InvalidDecimal("COMMISSION_RATE", raw))?,
            Err(_) => defaults.commission_rate,
        };
        if commission_rate < Decimal::ZERO || commission_rate >= Decimal::ONE {
            return Err(ConfigError::InvalidDecimal(
                "COMMISSION_RATE",
                commission_rate.to_string(),
            ));
        }

        if payment_threshold == Decimal::ZERO {
            tracing::warn!(
                "PAYMENT_THRESHOLD is 0 — every payer with any debt will be \
                 denied access until they settle"
            );
        }

        Ok(Self {
            db_path,
            payment_threshold,
            amount_scale,
            commission_rate,
        })
    }

    /// Commission owed on a metered base cost, at the configured scale.
    pub fn commission_for(&self, base_cost: Decimal) -> Decimal {
        (base_cost * self.commission_rate).round_dp(self.amount_scale)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid decimal for {0}: {1}")]
    InvalidDecimal(&'static str, String),
}
