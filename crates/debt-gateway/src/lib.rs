//! Debt-based payment verification and settlement engine for x402 gateways.
//!
//! Fronts metered API resources (LLM inference) behind the x402 micropayment
//! protocol. Callers present EIP-712 signed payment authorizations; this crate
//! decides whether to grant access, tracks an outstanding balance per payer,
//! and reconciles that balance against on-chain settlement results.
//!
//! # Components
//!
//! - [`SignatureVerifier`](verify) — checks that an authorization was signed by
//!   the payer it claims, for either of two schemes (EIP-3009 style direct
//!   transfer, or Permit2 transfer-with-witness)
//! - [`DebtLedger`] — per-payer debt, lifetime spend and usage/payment records
//!   over SQLite
//! - [`PriceOracle`] — quotes the amount a payer must authorize (outstanding
//!   debt for metered routes, a fixed amount for flat routes)
//! - [`HookPipeline`] — the six-slot verify/settle lifecycle with explicit
//!   abort and recovery semantics
//! - [`DebtGateway`] — glue that wires the built-in debt-threshold and
//!   reconciliation hooks together
//!
//! The crate is a library: the surrounding resource server owns HTTP routing
//! and the actual on-chain settlement call, and invokes the hooks here at the
//! documented lifecycle points.

pub mod config;
pub mod constants;
pub mod error;
pub mod gateway;
pub mod hooks;
pub mod ledger;
pub mod payload;
pub mod pricing;
pub mod reconcile;
pub mod verify;

use alloy::sol;

// EIP-712 structs for the two accepted authorization schemes.
// The sol! macro derives SolStruct which provides eip712_signing_hash().
sol! {
    /// EIP-3009 style direct token-transfer authorization.
    #[derive(Debug)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

sol! {
    /// Permit2 transfer-with-witness authorization.
    /// Struct layout follows the canonical Permit2 contract.
    #[derive(Debug)]
    struct TokenPermissions {
        address token;
        uint256 amount;
    }

    #[derive(Debug)]
    struct Witness {
        address payTo;
        uint256 nonce;
    }

    #[derive(Debug)]
    struct PermitWitnessTransferFrom {
        TokenPermissions permitted;
        address spender;
        uint256 nonce;
        uint256 deadline;
        Witness witness;
    }
}

// Re-exports
pub use config::GatewayConfig;
pub use error::GatewayError;
pub use gateway::DebtGateway;
pub use hooks::{HookContext, HookDecision, HookPhase, HookPipeline, LifecycleOutcome};
pub use ledger::{address_key, DebtLedger, PayerSnapshot, PaymentRecord, PaymentStatus, UsageRecord};
pub use payload::{
    AuthorizationPayload, DirectAuthorization, PaymentEnvelope, PaymentRequirements,
    PermitWitnessAuthorization, SettleResult,
};
pub use pricing::{PriceOracle, RoutePricing};
