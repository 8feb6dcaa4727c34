use std::str::FromStr;

use chrono::Utc;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use tracing::warn;

use super::DbPool;
use crate::error::MeterError;

/// One ledger row, ready to store. Decoupled from IMAP; any source can
/// produce this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonationRecord {
    /// Provider transaction id, the uniqueness key
    pub transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub payer_name: Option<String>,
    /// Unix epoch seconds, from the message itself
    pub received_at: i64,
    /// Where the mail came from, for auditing ("folder/uidvalidity/uid")
    pub source_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with this transaction id already existed; nothing was written
    AlreadyPresent,
}

/// Insert unless the transaction id is already in the ledger. A single
/// INSERT OR IGNORE, so uniqueness is decided by the database and two
/// overlapping runs cannot both insert.
pub fn insert_if_new(pool: &DbPool, record: &DonationRecord) -> Result<InsertOutcome, MeterError> {
    if record.amount <= Decimal::ZERO {
        // The parser never emits these; refuse them here too so the
        // ledger invariant doesn't depend on the caller.
        return Err(MeterError::InvalidInput(format!(
            "non-positive amount {} for transaction {}",
            record.amount, record.transaction_id
        )));
    }

    let conn = pool.get()?;
    let now = Utc::now().timestamp_millis();
    let changed = conn.execute(
        "INSERT OR IGNORE INTO donations (
            transaction_id, amount, currency, payer_name,
            received_at, source_ref, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.transaction_id,
            record.amount.to_string(),
            record.currency,
            record.payer_name,
            record.received_at,
            record.source_ref,
            now,
        ],
    )?;

    if changed == 1 {
        return Ok(InsertOutcome::Inserted);
    }

    // Re-seeing a transaction id is routine (re-fetch after a crash, a
    // stale checkpoint). A different amount under the same id is not: that
    // is the observable signature of a provider-side id collision.
    // The lookup reuses the connection the insert holds; checking out a
    // second one would starve a pool of size one.
    if let Some(stored) = lookup(&conn, &record.transaction_id)? {
        if stored.amount != record.amount {
            warn!(
                transaction_id = %record.transaction_id,
                stored_amount = %stored.amount,
                new_amount = %record.amount,
                "duplicate transaction id with a different amount"
            );
        }
    }

    Ok(InsertOutcome::AlreadyPresent)
}

pub fn get(pool: &DbPool, transaction_id: &str) -> Result<Option<DonationRecord>, MeterError> {
    let conn = pool.get()?;
    lookup(&conn, transaction_id)
}

fn lookup(conn: &Connection, transaction_id: &str) -> Result<Option<DonationRecord>, MeterError> {
    let result = conn.query_row(
        "SELECT transaction_id, amount, currency, payer_name, received_at, source_ref
         FROM donations WHERE transaction_id = ?1",
        params![transaction_id],
        row_to_record,
    );

    match result {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(MeterError::Database(e.to_string())),
    }
}

/// Exact sum of all recorded amounts. Summed as decimals in Rust; SQL
/// float aggregation never touches the money.
pub fn total_amount(pool: &DbPool) -> Result<Decimal, MeterError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT amount FROM donations")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut total = Decimal::ZERO;
    for amount in rows {
        let amount = amount?;
        total += Decimal::from_str(&amount)
            .map_err(|e| MeterError::Database(format!("Bad amount in ledger: {}", e)))?;
    }
    total.rescale(2);
    Ok(total)
}

/// Most recent donations, newest first.
pub fn recent(pool: &DbPool, limit: usize) -> Result<Vec<DonationRecord>, MeterError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT transaction_id, amount, currency, payer_name, received_at, source_ref
         FROM donations
         ORDER BY received_at DESC, created_at DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], row_to_record)?;

    let mut records = Vec::new();
    for record in rows {
        records.push(record?);
    }
    Ok(records)
}

pub fn count(pool: &DbPool) -> Result<u64, MeterError> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM donations", [], |row| row.get(0))?;
    Ok(count as u64)
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<DonationRecord> {
    let amount_text: String = row.get(1)?;
    let amount = Decimal::from_str(&amount_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(DonationRecord {
        transaction_id: row.get(0)?,
        amount,
        currency: row.get(2)?,
        payer_name: row.get(3)?,
        received_at: row.get(4)?,
        source_ref: row.get(5)?,
    })
}
