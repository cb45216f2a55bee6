//! EIP-712 signature verification for the two authorization schemes.
//!
//! Direct transfers are verified as `TransferWithAuthorization` typed data
//! against a domain sourced from the route's accepted-payment metadata
//! (name/version from scheme extra data, chain id from the network
//! identifier, verifying contract = the asset address). Permit-witness
//! transfers are verified as `PermitWitnessTransferFrom` typed data against
//! the canonical Permit2 contract domain.
//!
//! [`verify`] never errors for malformed input — it returns `false`.
//! Rejects high-s signatures to prevent malleability (EIP-2).

use std::borrow::Cow;

use alloy::primitives::{Address, Signature, B256, U256};
use alloy::sol_types::{Eip712Domain, SolStruct};

use crate::constants::{PERMIT2_ADDRESS, PERMIT2_DOMAIN_NAME};
use crate::error::GatewayError;
use crate::payload::{
    AuthorizationPayload, DirectAuthorization, PaymentRequirements, PermitWitnessAuthorization,
};
use crate::{PermitWitnessTransferFrom, TokenPermissions, TransferWithAuthorization, Witness};

/// secp256k1 curve order N / 2 — signatures with s > this are malleable (EIP-2).
const SECP256K1_N_DIV_2: U256 = U256::from_limbs([
    0xBFD25E8CD0364140,
    0xBAAEDCE6AF48A03B,
    0xFFFFFFFFFFFFFFFE,
    0x7FFFFFFFFFFFFFFF,
]);

/// Build the EIP-712 domain for direct-transfer verification.
/// Name and version come from the route's scheme extra data; the verifying
/// contract is the settlement asset.
pub fn direct_domain(requirements: &PaymentRequirements) -> Result<Eip712Domain, GatewayError> {
    let extra = requirements.extra.as_ref().ok_or_else(|| {
        GatewayError::InvalidPayload("missing scheme extra data for direct authorization".into())
    })?;
    Ok(Eip712Domain {
        name: Some(Cow::Owned(extra.name.clone())),
        version: Some(Cow::Owned(extra.version.clone())),
        chain_id: Some(U256::from(requirements.chain_id()?)),
        verifying_contract: Some(requirements.asset),
        salt: None,
    })
}

/// Build the EIP-712 domain for permit-witness verification. Fixed to the
/// canonical Permit2 contract, which carries no version in its domain.
pub fn permit2_domain(chain_id: u64) -> Eip712Domain {
    Eip712Domain {
        name: Some(Cow::Borrowed(PERMIT2_DOMAIN_NAME)),
        version: None,
        chain_id: Some(U256::from(chain_id)),
        verifying_contract: Some(PERMIT2_ADDRESS),
        salt: None,
    }
}

/// Parse a decimal-string numeric field into a U256. Arbitrary precision:
/// going through floating point here would silently invalidate signatures.
fn parse_uint(value: &str, field: &str) -> Result<U256, GatewayError> {
    value
        .parse::<U256>()
        .map_err(|e| GatewayError::InvalidPayload(format!("invalid {field}: {e}")))
}

/// Compute the signing hash for a direct-transfer authorization.
pub fn direct_signing_hash(
    auth: &DirectAuthorization,
    requirements: &PaymentRequirements,
) -> Result<B256, GatewayError> {
    let typed = TransferWithAuthorization {
        from: auth.from,
        to: auth.to,
        value: parse_uint(&auth.value, "value")?,
        validAfter: parse_uint(&auth.valid_after, "validAfter")?,
        validBefore: parse_uint(&auth.valid_before, "validBefore")?,
        nonce: auth.nonce,
    };
    let domain = direct_domain(requirements)?;
    Ok(typed.eip712_signing_hash(&domain))
}

/// Compute the signing hash for a permit-witness authorization.
pub fn permit_signing_hash(
    auth: &PermitWitnessAuthorization,
    requirements: &PaymentRequirements,
) -> Result<B256, GatewayError> {
    let typed = PermitWitnessTransferFrom {
        permitted: TokenPermissions {
            token: auth.permitted.token,
            amount: parse_uint(&auth.permitted.amount, "permitted.amount")?,
        },
        spender: auth.spender,
        nonce: parse_uint(&auth.nonce, "nonce")?,
        deadline: parse_uint(&auth.deadline, "deadline")?,
        witness: Witness {
            payTo: auth.witness.pay_to,
            nonce: parse_uint(&auth.witness.nonce, "witness.nonce")?,
        },
    };
    let domain = permit2_domain(requirements.chain_id()?);
    Ok(typed.eip712_signing_hash(&domain))
}

/// Recover the signer from a 65-byte hex signature over a prehash.
fn recover_signer(hash: &B256, signature: &str) -> Result<Address, GatewayError> {
    let bytes = alloy::hex::decode(signature.strip_prefix("0x").unwrap_or(signature))
        .map_err(|e| GatewayError::Verification(format!("invalid hex signature: {e}")))?;

    if bytes.len() != 65 {
        return Err(GatewayError::Verification(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }

    let sig = Signature::from_raw(&bytes)
        .map_err(|e| GatewayError::Verification(format!("invalid signature: {e}")))?;

    if sig.s() > SECP256K1_N_DIV_2 {
        return Err(GatewayError::Verification(
            "high-s signature rejected (EIP-2 malleability)".to_string(),
        ));
    }

    sig.recover_address_from_prehash(hash)
        .map_err(|e| GatewayError::Verification(format!("recovery failed: {e}")))
}

/// Locate the payer address claimed by a payload, without verifying anything.
/// Used ahead of full verification, e.g. for debt checks. A permit-witness
/// payload carries no payer field, so extraction returns `None` there — the
/// claimed owner must come from the protocol layer.
pub fn extract_payer(payload: &AuthorizationPayload) -> Option<Address> {
    match payload {
        AuthorizationPayload::Direct(auth) => Some(auth.from),
        AuthorizationPayload::PermitWitness(_) => None,
    }
}

fn recovered_signer(
    payload: &AuthorizationPayload,
    requirements: &PaymentRequirements,
) -> Result<Address, GatewayError> {
    let hash = match payload {
        AuthorizationPayload::Direct(auth) => direct_signing_hash(auth, requirements)?,
        AuthorizationPayload::PermitWitness(auth) => permit_signing_hash(auth, requirements)?,
    };
    recover_signer(&hash, payload.signature())
}

/// Verify that `payload` was signed by `claimed`. Never errors: any
/// malformed input, failed recovery or signer mismatch yields `false`.
pub fn verify(
    payload: &AuthorizationPayload,
    claimed: Address,
    requirements: &PaymentRequirements,
) -> bool {
    match recovered_signer(payload, requirements) {
        Ok(signer) if signer == claimed => true,
        Ok(signer) => {
            tracing::debug!(
                claimed = %claimed,
                recovered = %signer,
                "signature recovered to a different address"
            );
            false
        }
        Err(e) => {
            tracing::debug!(error = %e, "signature verification failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{SchemeExtra, TokenPermissionsWire, WitnessWire};
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;

    fn requirements() -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".into(),
            network: "eip155:8453".into(),
            asset: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"
                .parse()
                .unwrap(),
            amount: "15000".into(),
            pay_to: "0x2222222222222222222222222222222222222222"
                .parse()
                .unwrap(),
            extra: Some(SchemeExtra {
                name: "USD Coin".into(),
                version: "2".into(),
            }),
        }
    }

    fn signed_direct(signer: &PrivateKeySigner, reqs: &PaymentRequirements) -> DirectAuthorization {
        let mut auth = DirectAuthorization {
            from: signer.address(),
            to: reqs.pay_to,
            value: "15000".into(),
            valid_after: "0".into(),
            valid_before: "99999999999".into(),
            nonce: B256::with_last_byte(7),
            signature: String::new(),
        };
        let hash = direct_signing_hash(&auth, reqs).unwrap();
        let sig = signer.sign_hash_sync(&hash).unwrap();
        auth.signature = format!("0x{}", alloy::hex::encode(sig.as_bytes()));
        auth
    }

    fn signed_permit(
        signer: &PrivateKeySigner,
        reqs: &PaymentRequirements,
    ) -> PermitWitnessAuthorization {
        let mut auth = PermitWitnessAuthorization {
            permitted: TokenPermissionsWire {
                token: reqs.asset,
                amount: "15000".into(),
            },
            spender: "0x4444444444444444444444444444444444444444"
                .parse()
                .unwrap(),
            nonce: "7".into(),
            deadline: "99999999999".into(),
            witness: WitnessWire {
                pay_to: reqs.pay_to,
                nonce: "7".into(),
            },
            signature: String::new(),
        };
        let hash = permit_signing_hash(&auth, reqs).unwrap();
        let sig = signer.sign_hash_sync(&hash).unwrap();
        auth.signature = format!("0x{}", alloy::hex::encode(sig.as_bytes()));
        auth
    }

    #[test]
    fn test_direct_roundtrip_verifies() {
        let signer = PrivateKeySigner::random();
        let reqs = requirements();
        let payload = AuthorizationPayload::Direct(signed_direct(&signer, &reqs));
        assert!(verify(&payload, signer.address(), &reqs));
    }

    #[test]
    fn test_direct_rejects_other_claimed_address() {
        let signer = PrivateKeySigner::random();
        let other = PrivateKeySigner::random();
        let reqs = requirements();
        let payload = AuthorizationPayload::Direct(signed_direct(&signer, &reqs));
        assert!(!verify(&payload, other.address(), &reqs));
    }

    #[test]
    fn test_direct_rejects_bit_flip() {
        let signer = PrivateKeySigner::random();
        let reqs = requirements();
        let mut auth = signed_direct(&signer, &reqs);

        // Flip one bit in the r component of the signature.
        let mut bytes =
            alloy::hex::decode(auth.signature.strip_prefix("0x").unwrap()).unwrap();
        bytes[5] ^= 0x01;
        auth.signature = format!("0x{}", alloy::hex::encode(bytes));

        let payload = AuthorizationPayload::Direct(auth);
        assert!(!verify(&payload, signer.address(), &reqs));
    }

    #[test]
    fn test_direct_rejects_tampered_value() {
        let signer = PrivateKeySigner::random();
        let reqs = requirements();
        let mut auth = signed_direct(&signer, &reqs);
        auth.value = "1".into();
        let payload = AuthorizationPayload::Direct(auth);
        assert!(!verify(&payload, signer.address(), &reqs));
    }

    #[test]
    fn test_permit_roundtrip_verifies() {
        let signer = PrivateKeySigner::random();
        let reqs = requirements();
        let payload = AuthorizationPayload::PermitWitness(signed_permit(&signer, &reqs));
        assert!(verify(&payload, signer.address(), &reqs));
    }

    #[test]
    fn test_shape_exclusivity() {
        // A signature produced under one scheme must never validate under
        // the other, even for the same signer and amounts.
        let signer = PrivateKeySigner::random();
        let reqs = requirements();

        let direct = signed_direct(&signer, &reqs);
        let mut permit = signed_permit(&signer, &reqs);
        permit.signature = direct.signature.clone();
        assert!(!verify(
            &AuthorizationPayload::PermitWitness(permit),
            signer.address(),
            &reqs
        ));

        let permit = signed_permit(&signer, &reqs);
        let mut direct = direct;
        direct.signature = permit.signature;
        assert!(!verify(
            &AuthorizationPayload::Direct(direct),
            signer.address(),
            &reqs
        ));
    }

    #[test]
    fn test_malformed_inputs_return_false() {
        let signer = PrivateKeySigner::random();
        let reqs = requirements();

        let mut auth = signed_direct(&signer, &reqs);
        auth.signature = "0x1234".into(); // wrong length
        assert!(!verify(
            &AuthorizationPayload::Direct(auth.clone()),
            signer.address(),
            &reqs
        ));

        auth.signature = "not-hex-at-all".into();
        assert!(!verify(
            &AuthorizationPayload::Direct(auth.clone()),
            signer.address(),
            &reqs
        ));

        auth.value = "1.5".into(); // not an integer string
        assert!(!verify(
            &AuthorizationPayload::Direct(auth),
            signer.address(),
            &reqs
        ));

        // Missing scheme extra data: domain cannot be built.
        let auth = signed_direct(&signer, &reqs);
        let mut no_extra = reqs.clone();
        no_extra.extra = None;
        assert!(!verify(
            &AuthorizationPayload::Direct(auth),
            signer.address(),
            &no_extra
        ));
    }

    #[test]
    fn test_extract_payer() {
        let signer = PrivateKeySigner::random();
        let reqs = requirements();

        let direct = AuthorizationPayload::Direct(signed_direct(&signer, &reqs));
        assert_eq!(extract_payer(&direct), Some(signer.address()));

        let permit = AuthorizationPayload::PermitWitness(signed_permit(&signer, &reqs));
        assert_eq!(extract_payer(&permit), None);
    }
}
