//! Settlement reconciliation: allocating a settled payment against the
//! payer's outstanding usage records.
//!
//! [`DebtLedger::apply_payment`] is the sole writer of payment records. One
//! transaction creates the SETTLED payment, marks every currently-unpaid
//! usage record as paid, and reduces debt by at most the total unpaid cost.
//! A duplicate external transaction reference is a no-op returning the
//! existing record, so retried settlement notifications are never credited
//! twice.

use rusqlite::params;
use rust_decimal::Decimal;

use crate::error::GatewayError;
use crate::ledger::{canonical_address, parse_money, DebtLedger, PaymentRecord, PaymentStatus};

impl DebtLedger {
    /// Apply a successful settlement of `amount` for `addr`.
    ///
    /// Marks all currently-outstanding usage records as paid and linked to
    /// the new payment, regardless of whether `amount` fully covers them; the
    /// residual stays in `current_debt`, which is reduced by
    /// `min(amount, total unpaid)` and never driven negative here.
    pub fn apply_payment(
        &self,
        addr: &str,
        amount: Decimal,
        tx_hash: Option<&str>,
    ) -> Result<PaymentRecord, GatewayError> {
        if amount <= Decimal::ZERO {
            return Err(GatewayError::InvalidAmount(format!(
                "payment amount must be positive, got {amount}"
            )));
        }

        let addr = canonical_address(addr);
        let payer_lock = self.payer_lock(&addr);
        let _guard = payer_lock
            .lock()
            .map_err(|_| GatewayError::Internal("payer lock poisoned".to_string()))?;

        let conn = self.lock_conn()?;
        let now = chrono::Utc::now().timestamp();
        let tx = conn.unchecked_transaction()?;

        // Idempotency: a retried settlement notification with a known
        // transaction reference returns the original record untouched.
        if let Some(hash) = tx_hash {
            if let Some(existing) = Self::payment_by_tx_hash_on(&tx, hash)? {
                tracing::info!(
                    payer = %addr,
                    tx = %hash,
                    payment_id = existing.id,
                    "duplicate settlement notification ignored"
                );
                return Ok(existing);
            }
        }

        Self::ensure_payer(&tx, &addr, self.default_threshold(), now)?;

        let unpaid = Self::unpaid_usage_on(&tx, &addr)?;
        let total_unpaid: Decimal = unpaid.iter().map(|u| u.total_cost).sum();

        tx.execute(
            r#"
            INSERT INTO payments (payer_address, amount, tx_hash, status, settled_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
            params![
                addr,
                amount.to_string(),
                tx_hash,
                PaymentStatus::Settled.as_str(),
                now
            ],
        )?;
        let payment_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE usage_records SET is_paid = 1, payment_id = ?1
             WHERE payer_address = ?2 AND is_paid = 0",
            params![payment_id, addr],
        )?;

        let reduction = amount.min(total_unpaid);
        let debt: String = tx.query_row(
            "SELECT current_debt FROM payers WHERE address = ?1",
            params![addr],
            |row| row.get(0),
        )?;
        let new_debt = (parse_money(&debt)? - reduction).max(Decimal::ZERO);

        tx.execute(
            "UPDATE payers SET current_debt = ?1 WHERE address = ?2",
            params![new_debt.to_string(), addr],
        )?;

        tx.commit()?;

        tracing::info!(
            payer = %addr,
            amount = %amount,
            reduced = %reduction,
            debt = %new_debt,
            records = unpaid.len(),
            tx = tx_hash.unwrap_or("-"),
            "payment applied"
        );

        Ok(PaymentRecord {
            id: payment_id,
            payer_address: addr,
            amount,
            tx_hash: tx_hash.map(String::from),
            status: PaymentStatus::Settled,
            settled_at: Some(now),
            created_at: now,
        })
    }
}
