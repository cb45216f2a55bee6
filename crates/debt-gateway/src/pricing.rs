//! Price derivation for protected routes.

use rust_decimal::Decimal;

use crate::error::GatewayError;
use crate::ledger::DebtLedger;

/// How a protected route is priced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePricing {
    /// Static amount, independent of ledger state.
    Flat(Decimal),
    /// The payer authorizes their outstanding debt. A zero quote means no
    /// payment is required yet; access is extended on credit.
    UsageMetered,
}

/// Read-only price oracle. Never mutates ledger state and may be called any
/// number of times for the same logical request.
#[derive(Clone)]
pub struct PriceOracle {
    ledger: DebtLedger,
    scale: u32,
}

impl PriceOracle {
    pub fn new(ledger: DebtLedger, scale: u32) -> Self {
        Self { ledger, scale }
    }

    /// The amount the payer must authorize for this route, at the
    /// settlement asset's decimal precision.
    pub fn price(&self, route: &RoutePricing, payer: &str) -> Result<Decimal, GatewayError> {
        let amount = match route {
            RoutePricing::Flat(amount) => *amount,
            RoutePricing::UsageMetered => self.ledger.get_debt(payer)?,
        };
        Ok(amount.round_dp(self.scale))
    }

    /// Decimal-string quote for the protocol layer's dynamic price callback.
    pub fn quote(&self, route: &RoutePricing, payer: &str) -> Result<String, GatewayError> {
        let amount = self.price(route, payer)?;
        tracing::debug!(payer = %payer, amount = %amount, "price quoted");
        Ok(amount.to_string())
    }
}
