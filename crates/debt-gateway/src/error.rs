use thiserror::Error;

/// Errors returned by debt-gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Signature does not recover to the claimed payer, or the payload
    /// shape is unrecognized. Always fatal to the current request.
    #[error("verification failed: {0}")]
    Verification(String),

    /// A hook deliberately rejected the request (e.g. debt over threshold).
    #[error("request aborted: {0}")]
    Aborted(String),

    /// The external settlement call failed.
    #[error("settlement failed: {0}")]
    Settlement(String),

    /// Storage unavailable or transaction conflict. Callers performing an
    /// access-control decision must treat this as "do not grant access".
    #[error("ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl GatewayError {
    /// Whether this error is the caller's fault (4xx-class rejection with a
    /// reason) as opposed to an internal fault (5xx-class, generic message).
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            GatewayError::Verification(_)
                | GatewayError::Aborted(_)
                | GatewayError::InvalidPayload(_)
                | GatewayError::InvalidAmount(_)
        )
    }

    /// Message safe to surface to callers. Internal faults collapse to a
    /// generic message; details stay in server logs.
    pub fn public_message(&self) -> String {
        if self.is_client_fault() {
            self.to_string()
        } else {
            "an internal error occurred".to_string()
        }
    }
}
