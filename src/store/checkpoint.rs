use chrono::Utc;
use rusqlite::params;

use super::DbPool;
use crate::error::MeterError;

/// Mailbox read position: every UID at or below `last_uid` under this
/// `uid_validity` has been through a fully committed run. All zeroes means
/// the mailbox has never been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checkpoint {
    pub uid_validity: u32,
    pub last_uid: u32,
}

pub fn load(pool: &DbPool) -> Result<Checkpoint, MeterError> {
    let conn = pool.get()?;
    let checkpoint = conn.query_row(
        "SELECT uid_validity, last_uid FROM ingest_checkpoint WHERE id = 0",
        [],
        |row| {
            Ok(Checkpoint {
                uid_validity: row.get(0)?,
                last_uid: row.get(1)?,
            })
        },
    )?;
    Ok(checkpoint)
}

/// Move the mark forward. Under the same UIDVALIDITY the update is
/// monotonic, so a stale concurrent run can re-fetch but never move the
/// mark backwards. A new UIDVALIDITY replaces the mark wholesale; the old
/// UIDs no longer identify anything.
pub fn advance(pool: &DbPool, uid_validity: u32, last_uid: u32) -> Result<(), MeterError> {
    let conn = pool.get()?;
    let now = Utc::now().timestamp_millis();
    conn.execute(
        "UPDATE ingest_checkpoint
            SET uid_validity = ?1, last_uid = ?2, updated_at = ?3
          WHERE id = 0 AND (uid_validity != ?1 OR last_uid < ?2)",
        params![uid_validity as i64, last_uid as i64, now],
    )?;
    Ok(())
}
