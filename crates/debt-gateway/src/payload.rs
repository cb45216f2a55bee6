//! Wire types for the x402 payment envelope and the two authorization shapes.
//!
//! The protocol layer hands this crate an envelope of
//! `{payload: {...}, accepted: {...}}`. The inner payload is one of exactly
//! two JSON shapes — a direct EIP-3009 style transfer authorization, or a
//! Permit2 transfer-with-witness authorization — modeled here as a tagged
//! union constructed by [`AuthorizationPayload::parse`], which rejects
//! payloads matching neither or both shapes.

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Scheme extra data carried in the accepted-payment metadata; supplies the
/// EIP-712 domain name/version for direct-transfer verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemeExtra {
    pub name: String,
    pub version: String,
}

/// A single entry from the `accepts` array of a 402 response: what the
/// route will take as payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    /// CAIP-2 style network identifier, `"<namespace>:<chainId>"`.
    pub network: String,
    /// Settlement asset (token contract) address.
    pub asset: Address,
    /// Required amount as a decimal string.
    pub amount: String,
    pub pay_to: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<SchemeExtra>,
}

impl PaymentRequirements {
    /// Parse the numeric chain id out of the network identifier.
    /// Only the suffix after the last `:` is used.
    pub fn chain_id(&self) -> Result<u64, GatewayError> {
        let suffix = self
            .network
            .rsplit(':')
            .next()
            .unwrap_or(self.network.as_str());
        suffix.parse::<u64>().map_err(|_| {
            GatewayError::InvalidPayload(format!("invalid network identifier: {}", self.network))
        })
    }
}

/// Direct token-transfer authorization (EIP-3009 style).
/// Numeric fields travel as decimal strings and are parsed as
/// arbitrary-precision integers before signing-hash computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectAuthorization {
    pub from: Address,
    pub to: Address,
    pub value: String,
    pub valid_after: String,
    pub valid_before: String,
    pub nonce: B256,
    pub signature: String,
}

/// Token/amount pair from a Permit2 permit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPermissionsWire {
    pub token: Address,
    pub amount: String,
}

/// Witness payload bound into a Permit2 signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WitnessWire {
    pub pay_to: Address,
    pub nonce: String,
}

/// Permit-based transfer-with-witness authorization (Permit2 style).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitWitnessAuthorization {
    pub permitted: TokenPermissionsWire,
    pub spender: Address,
    pub nonce: String,
    pub deadline: String,
    pub witness: WitnessWire,
    pub signature: String,
}

/// The two mutually exclusive authorization shapes.
#[derive(Debug, Clone)]
pub enum AuthorizationPayload {
    Direct(DirectAuthorization),
    PermitWitness(PermitWitnessAuthorization),
}

impl AuthorizationPayload {
    /// Classify and parse a raw payload. Exactly one of the two shapes must
    /// be present: a direct authorization carries `from`, a permit-witness
    /// authorization carries `permitted`. Neither or both is an error.
    pub fn parse(raw: &serde_json::Value) -> Result<Self, GatewayError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| GatewayError::InvalidPayload("payload is not an object".into()))?;

        let has_direct = obj.contains_key("from");
        let has_permit = obj.contains_key("permitted");

        match (has_direct, has_permit) {
            (true, false) => {
                let auth: DirectAuthorization = serde_json::from_value(raw.clone())
                    .map_err(|e| GatewayError::InvalidPayload(format!("bad direct shape: {e}")))?;
                Ok(AuthorizationPayload::Direct(auth))
            }
            (false, true) => {
                let auth: PermitWitnessAuthorization = serde_json::from_value(raw.clone())
                    .map_err(|e| GatewayError::InvalidPayload(format!("bad permit shape: {e}")))?;
                Ok(AuthorizationPayload::PermitWitness(auth))
            }
            (true, true) => Err(GatewayError::InvalidPayload(
                "payload matches both authorization shapes".into(),
            )),
            (false, false) => Err(GatewayError::InvalidPayload(
                "payload matches no known authorization shape".into(),
            )),
        }
    }

    /// Hex signature string of whichever shape is present.
    pub fn signature(&self) -> &str {
        match self {
            AuthorizationPayload::Direct(a) => &a.signature,
            AuthorizationPayload::PermitWitness(a) => &a.signature,
        }
    }
}

/// Protocol-defined envelope carrying the raw authorization payload and the
/// accepted-payment requirements the client chose.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEnvelope {
    pub payload: serde_json::Value,
    pub accepted: PaymentRequirements,
}

impl PaymentEnvelope {
    /// Parse the inner payload into its tagged shape.
    pub fn authorization(&self) -> Result<AuthorizationPayload, GatewayError> {
        AuthorizationPayload::parse(&self.payload)
    }
}

/// Settlement result supplied to the after-settle hook by the protocol layer.
/// A missing `payer` means the settlement cannot be attributed and
/// reconciliation must be skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
}
