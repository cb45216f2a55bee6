//! Gateway glue: wires the ledger, price oracle and hook pipeline together.
//!
//! [`DebtGateway::new`] opens the ledger and registers the two built-in
//! handlers:
//!
//! - before-verify: deny payers whose outstanding debt has reached their
//!   payment threshold (ledger failures deny access — fail closed)
//! - after-settle: reconcile the settled amount against unpaid usage;
//!   skipped when the settlement result carries no payer
//!
//! The storage handle is injected at construction; its lifecycle belongs to
//! the host application.

use alloy::primitives::Address;
use rust_decimal::Decimal;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::hooks::{HookDecision, HookPhase, HookPipeline, LifecycleOutcome};
use crate::ledger::{address_key, DebtLedger, UsageRecord};
use crate::payload::{PaymentEnvelope, SettleResult};
use crate::pricing::{PriceOracle, RoutePricing};
use crate::verify;

pub struct DebtGateway {
    ledger: DebtLedger,
    oracle: PriceOracle,
    pipeline: HookPipeline,
    config: GatewayConfig,
}

impl DebtGateway {
    /// Open the ledger at the configured path and install the built-in hooks.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let ledger = DebtLedger::open(&config.db_path, config.payment_threshold)?;
        Ok(Self::with_ledger(ledger, config))
    }

    /// Build a gateway around an already-open ledger handle.
    pub fn with_ledger(ledger: DebtLedger, config: GatewayConfig) -> Self {
        let oracle = PriceOracle::new(ledger.clone(), config.amount_scale);
        let mut gateway = Self {
            ledger,
            oracle,
            pipeline: HookPipeline::new(),
            config,
        };
        gateway.install_hooks();
        gateway
    }

    fn install_hooks(&mut self) {
        // Debt-threshold gate. Runs before any cryptographic work: a payer
        // whose debt has reached their threshold is rejected outright.
        // Ledger read failures propagate, which denies access.
        let ledger = self.ledger.clone();
        self.pipeline
            .register(HookPhase::BeforeVerify, move |ctx| {
                let Some(payer) = ctx.authorization.and_then(verify::extract_payer) else {
                    // Cannot attribute the payload to a payer here; the
                    // verify step will reject it if no claimed address
                    // arrives from the protocol layer either.
                    return Ok(HookDecision::Continue);
                };
                if ledger.is_below_threshold(&address_key(&payer))? {
                    Ok(HookDecision::Continue)
                } else {
                    Ok(HookDecision::Abort(format!(
                        "outstanding debt for {payer} has reached the payment threshold"
                    )))
                }
            });

        // Reconciliation. An unattributable settlement is skipped, not an
        // error: the protocol layer may legitimately be unable to say who
        // paid, and charging the wrong account is worse than charging none.
        let ledger = self.ledger.clone();
        self.pipeline.register(HookPhase::AfterSettle, move |ctx| {
            let Some(result) = ctx.result else {
                return Ok(HookDecision::Continue);
            };
            let Some(payer) = result.payer else {
                tracing::warn!("settlement result has no payer; skipping reconciliation");
                return Ok(HookDecision::Continue);
            };

            let amount = ctx.requirements.amount.parse::<Decimal>().map_err(|e| {
                GatewayError::Internal(format!(
                    "unparseable settled amount '{}': {e}",
                    ctx.requirements.amount
                ))
            })?;
            if amount <= Decimal::ZERO {
                tracing::debug!(payer = %payer, "zero-amount settlement, nothing to reconcile");
                return Ok(HookDecision::Continue);
            }

            ledger.apply_payment(&address_key(&payer), amount, result.transaction.as_deref())?;
            Ok(HookDecision::Continue)
        });
    }

    /// Price quote for the protocol layer's dynamic price callback.
    pub fn quote(&self, route: &RoutePricing, payer: &str) -> Result<String, GatewayError> {
        self.oracle.quote(route, payer)
    }

    /// Record one metered call, deriving commission from the configured rate.
    pub fn meter_usage(
        &self,
        payer: &Address,
        model: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        base_cost: Decimal,
    ) -> Result<UsageRecord, GatewayError> {
        let commission = self.config.commission_for(base_cost);
        self.ledger.record_usage(
            &address_key(payer),
            model,
            prompt_tokens,
            completion_tokens,
            base_cost,
            commission,
            base_cost + commission,
        )
    }

    /// Drive one full verify/settle lifecycle for an inbound envelope.
    ///
    /// `claimed` is the payer address asserted by the protocol layer; when
    /// absent it is extracted from the payload (possible for direct
    /// authorizations only). `settle` performs the external settlement call.
    pub fn process<S>(
        &self,
        envelope: &PaymentEnvelope,
        claimed: Option<Address>,
        settle: S,
    ) -> Result<LifecycleOutcome, GatewayError>
    where
        S: FnOnce(Address) -> Result<SettleResult, GatewayError>,
    {
        let authorization = envelope.authorization()?;
        let requirements = &envelope.accepted;

        self.pipeline.execute(
            requirements,
            &authorization,
            |auth| {
                let payer = claimed.or_else(|| verify::extract_payer(auth)).ok_or_else(|| {
                    GatewayError::Verification("cannot determine claimed payer".into())
                })?;
                if verify::verify(auth, payer, requirements) {
                    Ok(payer)
                } else {
                    Err(GatewayError::Verification(
                        "signature does not recover to claimed payer".into(),
                    ))
                }
            },
            settle,
        )
    }

    /// Register additional host hooks (metrics, audit, recovery policies).
    pub fn pipeline_mut(&mut self) -> &mut HookPipeline {
        &mut self.pipeline
    }

    pub fn pipeline(&self) -> &HookPipeline {
        &self.pipeline
    }

    pub fn ledger(&self) -> &DebtLedger {
        &self.ledger
    }

    pub fn oracle(&self) -> &PriceOracle {
        &self.oracle
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}
