//! Per-payer debt ledger over SQLite.
//!
//! Owns the payer accounts (current debt, lifetime spend, payment threshold)
//! and the append-only usage and payment records. All mutation for a given
//! payer serializes: a per-payer lock plus single-connection transactions
//! uphold the invariant that `current_debt` equals the sum of `total_cost`
//! over unpaid usage records.
//!
//! The storage handle is constructed explicitly and injected into whatever
//! needs it; lifecycle (open at startup, drop at shutdown) belongs to the
//! host application.

use std::sync::{Arc, Mutex, MutexGuard};

use alloy::primitives::Address;
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use rust_decimal::Decimal;

use crate::error::GatewayError;

/// Canonical ledger key for a chain address: trimmed, lower-cased hex.
pub fn canonical_address(addr: &str) -> String {
    addr.trim().to_ascii_lowercase()
}

/// Canonical ledger key for a typed address.
pub fn address_key(addr: &Address) -> String {
    format!("{addr:#x}")
}

/// Status of a payment record. Records are created already SETTLED when
/// settlement succeeds; PENDING exists for hosts that stage confirmations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Settled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Settled => "SETTLED",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(PaymentStatus::Pending),
            "SETTLED" => Some(PaymentStatus::Settled),
            _ => None,
        }
    }
}

/// One metered call. Immutable once created, except the single
/// unpaid→paid transition performed by payment reconciliation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UsageRecord {
    pub id: i64,
    pub payer_address: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub base_cost: Decimal,
    pub commission: Decimal,
    pub total_cost: Decimal,
    pub is_paid: bool,
    pub payment_id: Option<i64>,
    pub created_at: i64,
}

/// One settlement event.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PaymentRecord {
    pub id: i64,
    pub payer_address: String,
    pub amount: Decimal,
    pub tx_hash: Option<String>,
    pub status: PaymentStatus,
    pub settled_at: Option<i64>,
    pub created_at: i64,
}

/// Read-only view of a payer account.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PayerSnapshot {
    pub address: String,
    pub current_debt: Decimal,
    pub total_spent: Decimal,
    pub payment_threshold: Decimal,
}

/// SQLite-backed debt ledger.
#[derive(Clone)]
pub struct DebtLedger {
    conn: Arc<Mutex<Connection>>,
    /// Per-payer mutex so usage and payment writes for one payer never
    /// interleave, independent of how the connection is shared.
    payer_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    default_threshold: Decimal,
}

impl DebtLedger {
    /// Open (or create) the ledger database at `path`. Use `":memory:"`
    /// for an ephemeral ledger in tests.
    pub fn open(path: &str, default_threshold: Decimal) -> Result<Self, GatewayError> {
        if default_threshold < Decimal::ZERO {
            return Err(GatewayError::InvalidAmount(
                "payment threshold cannot be negative".into(),
            ));
        }
        let conn = Connection::open(path)?;
        let ledger = Self {
            conn: Arc::new(Mutex::new(conn)),
            payer_locks: Arc::new(DashMap::new()),
            default_threshold,
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<(), GatewayError> {
        let conn = self.lock_conn()?;

        // WAL for better concurrent read/write behavior
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS payers (
                address TEXT PRIMARY KEY,
                current_debt TEXT NOT NULL DEFAULT '0',
                total_spent TEXT NOT NULL DEFAULT '0',
                payment_threshold TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS usage_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payer_address TEXT NOT NULL,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                base_cost TEXT NOT NULL,
                commission TEXT NOT NULL,
                total_cost TEXT NOT NULL,
                is_paid INTEGER NOT NULL DEFAULT 0,
                payment_id INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        // Oldest-unpaid-first is the allocation order for reconciliation
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_usage_unpaid
             ON usage_records(payer_address, is_paid, created_at)",
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS payments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payer_address TEXT NOT NULL,
                amount TEXT NOT NULL,
                tx_hash TEXT UNIQUE,
                status TEXT NOT NULL,
                settled_at INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        Ok(())
    }

    pub(crate) fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, GatewayError> {
        self.conn
            .lock()
            .map_err(|_| GatewayError::Internal("database lock poisoned".to_string()))
    }

    /// Get or create the per-payer mutex for single-writer-per-key discipline.
    pub(crate) fn payer_lock(&self, addr: &str) -> Arc<Mutex<()>> {
        self.payer_locks
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn default_threshold(&self) -> Decimal {
        self.default_threshold
    }

    /// Materialize a payer row if it does not exist yet. Payers are created
    /// lazily on first usage or first payment, never deleted.
    pub(crate) fn ensure_payer(
        tx: &Transaction<'_>,
        addr: &str,
        default_threshold: Decimal,
        now: i64,
    ) -> Result<(), GatewayError> {
        tx.execute(
            r#"
            INSERT OR IGNORE INTO payers (address, current_debt, total_spent, payment_threshold, created_at)
            VALUES (?1, '0', '0', ?2, ?3)
            "#,
            params![addr, default_threshold.to_string(), now],
        )?;
        Ok(())
    }

    /// Current debt for a payer. Unknown addresses owe zero; no row is
    /// created by a pure read.
    pub fn get_debt(&self, addr: &str) -> Result<Decimal, GatewayError> {
        let addr = canonical_address(addr);
        let conn = self.lock_conn()?;
        let debt: Option<String> = conn
            .query_row(
                "SELECT current_debt FROM payers WHERE address = ?1",
                params![addr],
                |row| row.get(0),
            )
            .optional()?;
        match debt {
            Some(s) => parse_money(&s),
            None => Ok(Decimal::ZERO),
        }
    }

    /// Whether the payer's debt is below their payment threshold. Unknown
    /// addresses are new payers with no debt, hence below-threshold.
    pub fn is_below_threshold(&self, addr: &str) -> Result<bool, GatewayError> {
        let addr = canonical_address(addr);
        let conn = self.lock_conn()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT current_debt, payment_threshold FROM payers WHERE address = ?1",
                params![addr],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((debt, threshold)) => Ok(parse_money(&debt)? < parse_money(&threshold)?),
            None => Ok(true),
        }
    }

    /// Append a usage record and increment both `current_debt` and
    /// `total_spent` by `total_cost` in one transaction. Nothing is applied
    /// if any step fails.
    #[allow(clippy::too_many_arguments)]
    pub fn record_usage(
        &self,
        addr: &str,
        model: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        base_cost: Decimal,
        commission: Decimal,
        total_cost: Decimal,
    ) -> Result<UsageRecord, GatewayError> {
        if base_cost < Decimal::ZERO || commission < Decimal::ZERO {
            return Err(GatewayError::InvalidAmount(
                "usage costs cannot be negative".into(),
            ));
        }
        if base_cost + commission != total_cost {
            return Err(GatewayError::InvalidAmount(format!(
                "total cost {total_cost} does not equal base {base_cost} + commission {commission}"
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

        Self::ensure_payer(&tx, &addr, self.default_threshold, now)?;

        tx.execute(
            r#"
            INSERT INTO usage_records
                (payer_address, model, prompt_tokens, completion_tokens,
                 base_cost, commission, total_cost, is_paid, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)
            "#,
            params![
                addr,
                model,
                prompt_tokens,
                completion_tokens,
                base_cost.to_string(),
                commission.to_string(),
                total_cost.to_string(),
                now
            ],
        )?;
        let id = tx.last_insert_rowid();

        let (debt, spent): (String, String) = tx.query_row(
            "SELECT current_debt, total_spent FROM payers WHERE address = ?1",
            params![addr],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let new_debt = parse_money(&debt)? + total_cost;
        let new_spent = parse_money(&spent)? + total_cost;

        tx.execute(
            "UPDATE payers SET current_debt = ?1, total_spent = ?2 WHERE address = ?3",
            params![new_debt.to_string(), new_spent.to_string(), addr],
        )?;

        tx.commit()?;

        tracing::info!(
            payer = %addr,
            model = %model,
            cost = %total_cost,
            debt = %new_debt,
            "usage recorded"
        );

        Ok(UsageRecord {
            id,
            payer_address: addr,
            model: model.to_string(),
            prompt_tokens,
            completion_tokens,
            base_cost,
            commission,
            total_cost,
            is_paid: false,
            payment_id: None,
            created_at: now,
        })
    }

    /// Read-only account view. `None` for unknown addresses.
    pub fn payer_snapshot(&self, addr: &str) -> Result<Option<PayerSnapshot>, GatewayError> {
        let addr = canonical_address(addr);
        let conn = self.lock_conn()?;
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT current_debt, total_spent, payment_threshold
                 FROM payers WHERE address = ?1",
                params![addr],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match row {
            Some((debt, spent, threshold)) => Ok(Some(PayerSnapshot {
                address: addr,
                current_debt: parse_money(&debt)?,
                total_spent: parse_money(&spent)?,
                payment_threshold: parse_money(&threshold)?,
            })),
            None => Ok(None),
        }
    }

    /// All unpaid usage records for a payer, oldest first. This ordering
    /// defines the allocation priority for reconciliation.
    pub fn unpaid_usage(&self, addr: &str) -> Result<Vec<UsageRecord>, GatewayError> {
        let addr = canonical_address(addr);
        let conn = self.lock_conn()?;
        Self::unpaid_usage_on(&conn, &addr)
    }

    pub(crate) fn unpaid_usage_on(
        conn: &Connection,
        addr: &str,
    ) -> Result<Vec<UsageRecord>, GatewayError> {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, payer_address, model, prompt_tokens, completion_tokens,
                   base_cost, commission, total_cost, is_paid, payment_id, created_at
            FROM usage_records
            WHERE payer_address = ?1 AND is_paid = 0
            ORDER BY created_at ASC, id ASC
            "#,
        )?;
        let records = stmt
            .query_map(params![addr], usage_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Look up a payment by its external settlement reference.
    pub fn payment_by_tx_hash(&self, tx_hash: &str) -> Result<Option<PaymentRecord>, GatewayError> {
        let conn = self.lock_conn()?;
        Self::payment_by_tx_hash_on(&conn, tx_hash)
    }

    pub(crate) fn payment_by_tx_hash_on(
        conn: &Connection,
        tx_hash: &str,
    ) -> Result<Option<PaymentRecord>, GatewayError> {
        let record = conn
            .query_row(
                r#"
                SELECT id, payer_address, amount, tx_hash, status, settled_at, created_at
                FROM payments
                WHERE tx_hash = ?1
                "#,
                params![tx_hash],
                payment_from_row,
            )
            .optional()?;
        Ok(record)
    }
}

fn usage_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageRecord> {
    Ok(UsageRecord {
        id: row.get(0)?,
        payer_address: row.get(1)?,
        model: row.get(2)?,
        prompt_tokens: row.get(3)?,
        completion_tokens: row.get(4)?,
        base_cost: decimal_column(row, 5)?,
        commission: decimal_column(row, 6)?,
        total_cost: decimal_column(row, 7)?,
        is_paid: row.get::<_, i32>(8)? == 1,
        payment_id: row.get(9)?,
        created_at: row.get(10)?,
    })
}

pub(crate) fn payment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentRecord> {
    let status: String = row.get(4)?;
    Ok(PaymentRecord {
        id: row.get(0)?,
        payer_address: row.get(1)?,
        amount: decimal_column(row, 2)?,
        tx_hash: row.get(3)?,
        status: PaymentStatus::from_str(&status).unwrap_or(PaymentStatus::Settled),
        settled_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn decimal_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Parse a stored monetary TEXT column. A parse failure means the ledger is
/// corrupt, which is an internal fault, never a client one.
pub(crate) fn parse_money(s: &str) -> Result<Decimal, GatewayError> {
    s.parse::<Decimal>()
        .map_err(|e| GatewayError::Internal(format!("corrupt ledger amount '{s}': {e}")))
}
