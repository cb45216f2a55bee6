//! The six-slot verify/settle lifecycle.
//!
//! The protocol layer invokes each phase at a defined point around its
//! verify and settle calls. Handlers return an explicit [`HookDecision`]
//! rather than signalling through errors, which keeps the state machine
//! exhaustive:
//!
//! | Phase          | May return                                   |
//! |----------------|----------------------------------------------|
//! | before-verify  | `Continue` or `Abort` (request rejected, verification never runs) |
//! | after-verify   | `Continue` only (side effects)               |
//! | verify-failure | `Continue` only (side effects; error still propagates) |
//! | before-settle  | `Continue` or `Abort` (settlement not attempted) |
//! | after-settle   | `Continue` only (reconciliation happens here) |
//! | settle-failure | `Continue` or `Recover` (substitute a synthetic success) |
//!
//! Handlers run in registration order; later handlers in a phase observe
//! side effects of earlier ones. Each phase runs at most once per request.
//! The pipeline does not assume handlers are idempotent — that is the
//! handler author's concern (payment reconciliation is idempotent by
//! transaction reference).

use alloy::primitives::Address;

use crate::error::GatewayError;
use crate::payload::{AuthorizationPayload, PaymentRequirements, SettleResult};

/// Decision returned by every hook handler.
#[derive(Debug, Clone)]
pub enum HookDecision {
    Continue,
    /// Reject the request with a human-readable reason.
    Abort(String),
    /// Suppress a settlement failure and substitute a success result.
    Recover(SettleResult),
}

/// The six fixed extension points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    BeforeVerify,
    AfterVerify,
    VerifyFailure,
    BeforeSettle,
    AfterSettle,
    SettleFailure,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::BeforeVerify => "before-verify",
            HookPhase::AfterVerify => "after-verify",
            HookPhase::VerifyFailure => "verify-failure",
            HookPhase::BeforeSettle => "before-settle",
            HookPhase::AfterSettle => "after-settle",
            HookPhase::SettleFailure => "settle-failure",
        }
    }
}

/// Per-invocation context handed to handlers. Lives only for the duration
/// of one lifecycle pass; never persisted.
pub struct HookContext<'a> {
    pub requirements: &'a PaymentRequirements,
    /// Raw authorization, present from before-verify onwards.
    pub authorization: Option<&'a AuthorizationPayload>,
    /// Verified payer, present from after-verify onwards.
    pub payer: Option<Address>,
    /// Settlement result, present in after-settle.
    pub result: Option<&'a SettleResult>,
    /// The failure being reported, present in the failure phases.
    pub error: Option<&'a GatewayError>,
}

impl<'a> HookContext<'a> {
    fn new(requirements: &'a PaymentRequirements) -> Self {
        Self {
            requirements,
            authorization: None,
            payer: None,
            result: None,
            error: None,
        }
    }
}

type Hook = Box<dyn Fn(&HookContext<'_>) -> Result<HookDecision, GatewayError> + Send + Sync>;

/// Terminal outcome of one lifecycle pass.
#[derive(Debug, Clone)]
pub enum LifecycleOutcome {
    /// A gate hook aborted; carries the rejection reason.
    Rejected { reason: String },
    /// Settlement completed, possibly via recovery.
    Settled(SettleResult),
}

/// The ordered hook slots. Register handlers at startup, then drive one
/// pass per request with [`HookPipeline::execute`].
#[derive(Default)]
pub struct HookPipeline {
    before_verify: Vec<Hook>,
    after_verify: Vec<Hook>,
    verify_failure: Vec<Hook>,
    before_settle: Vec<Hook>,
    after_settle: Vec<Hook>,
    settle_failure: Vec<Hook>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a phase. Handlers run in registration order.
    pub fn register<F>(&mut self, phase: HookPhase, hook: F)
    where
        F: Fn(&HookContext<'_>) -> Result<HookDecision, GatewayError> + Send + Sync + 'static,
    {
        self.slot_mut(phase).push(Box::new(hook));
    }

    fn slot_mut(&mut self, phase: HookPhase) -> &mut Vec<Hook> {
        match phase {
            HookPhase::BeforeVerify => &mut self.before_verify,
            HookPhase::AfterVerify => &mut self.after_verify,
            HookPhase::VerifyFailure => &mut self.verify_failure,
            HookPhase::BeforeSettle => &mut self.before_settle,
            HookPhase::AfterSettle => &mut self.after_settle,
            HookPhase::SettleFailure => &mut self.settle_failure,
        }
    }

    fn slot(&self, phase: HookPhase) -> &[Hook] {
        match phase {
            HookPhase::BeforeVerify => &self.before_verify,
            HookPhase::AfterVerify => &self.after_verify,
            HookPhase::VerifyFailure => &self.verify_failure,
            HookPhase::BeforeSettle => &self.before_settle,
            HookPhase::AfterSettle => &self.after_settle,
            HookPhase::SettleFailure => &self.settle_failure,
        }
    }

    /// Run a gate phase (before-verify, before-settle). The first `Abort`
    /// short-circuits the remaining handlers in the slot.
    fn run_gate(
        &self,
        phase: HookPhase,
        ctx: &HookContext<'_>,
    ) -> Result<Option<String>, GatewayError> {
        for hook in self.slot(phase) {
            match hook(ctx)? {
                HookDecision::Continue => {}
                HookDecision::Abort(reason) => {
                    tracing::info!(phase = phase.as_str(), reason = %reason, "hook aborted request");
                    return Ok(Some(reason));
                }
                HookDecision::Recover(_) => {
                    tracing::warn!(
                        phase = phase.as_str(),
                        "recover decision ignored outside settle-failure"
                    );
                }
            }
        }
        Ok(None)
    }

    /// Run a side-effect-only phase. Abort/recover decisions are contract
    /// violations in these slots and are ignored with a warning.
    fn run_side_effects(
        &self,
        phase: HookPhase,
        ctx: &HookContext<'_>,
    ) -> Result<(), GatewayError> {
        for hook in self.slot(phase) {
            match hook(ctx)? {
                HookDecision::Continue => {}
                decision => {
                    tracing::warn!(
                        phase = phase.as_str(),
                        decision = ?decision,
                        "non-continue decision ignored in side-effect phase"
                    );
                }
            }
        }
        Ok(())
    }

    /// Run settle-failure handlers. The first `Recover` wins.
    fn run_settle_failure(
        &self,
        ctx: &HookContext<'_>,
    ) -> Result<Option<SettleResult>, GatewayError> {
        for hook in self.slot(HookPhase::SettleFailure) {
            match hook(ctx)? {
                HookDecision::Continue => {}
                HookDecision::Recover(result) => {
                    tracing::info!("settle-failure hook recovered settlement");
                    return Ok(Some(result));
                }
                HookDecision::Abort(reason) => {
                    tracing::warn!(
                        reason = %reason,
                        "abort decision ignored in settle-failure phase"
                    );
                }
            }
        }
        Ok(None)
    }

    /// Drive one full verify/settle lifecycle.
    ///
    /// `verify` performs cryptographic verification and returns the payer;
    /// `settle` performs the external settlement call. Both are supplied by
    /// the embedding host, which keeps this state machine independent of
    /// how verification and settlement are actually implemented.
    pub fn execute<V, S>(
        &self,
        requirements: &PaymentRequirements,
        authorization: &AuthorizationPayload,
        verify: V,
        settle: S,
    ) -> Result<LifecycleOutcome, GatewayError>
    where
        V: FnOnce(&AuthorizationPayload) -> Result<Address, GatewayError>,
        S: FnOnce(Address) -> Result<SettleResult, GatewayError>,
    {
        // VERIFY phase
        let mut ctx = HookContext::new(requirements);
        ctx.authorization = Some(authorization);
        if let Some(reason) = self.run_gate(HookPhase::BeforeVerify, &ctx)? {
            return Ok(LifecycleOutcome::Rejected { reason });
        }

        let payer = match verify(authorization) {
            Ok(payer) => payer,
            Err(e) => {
                let mut ctx = HookContext::new(requirements);
                ctx.authorization = Some(authorization);
                ctx.error = Some(&e);
                self.run_side_effects(HookPhase::VerifyFailure, &ctx)?;
                // Verification failures are always fatal to the request
                return Err(e);
            }
        };

        let mut ctx = HookContext::new(requirements);
        ctx.authorization = Some(authorization);
        ctx.payer = Some(payer);
        self.run_side_effects(HookPhase::AfterVerify, &ctx)?;

        // SETTLE phase
        if let Some(reason) = self.run_gate(HookPhase::BeforeSettle, &ctx)? {
            return Ok(LifecycleOutcome::Rejected { reason });
        }

        let result = match settle(payer) {
            Ok(result) => result,
            Err(e) => {
                let mut ctx = HookContext::new(requirements);
                ctx.authorization = Some(authorization);
                ctx.payer = Some(payer);
                ctx.error = Some(&e);
                match self.run_settle_failure(&ctx)? {
                    Some(recovered) => recovered,
                    None => return Err(e),
                }
            }
        };

        let mut ctx = HookContext::new(requirements);
        ctx.authorization = Some(authorization);
        ctx.payer = Some(payer);
        ctx.result = Some(&result);
        self.run_side_effects(HookPhase::AfterSettle, &ctx)?;

        Ok(LifecycleOutcome::Settled(result))
    }
}
