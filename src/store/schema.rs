use rusqlite::Connection;

use crate::error::MeterError;

pub fn init_schema(conn: &Connection) -> Result<(), MeterError> {
    conn.execute_batch(
        "
        -- Donation ledger. One row per provider transaction; the primary
        -- key is what makes ingestion exactly-once.
        CREATE TABLE IF NOT EXISTS donations (
            transaction_id  TEXT PRIMARY KEY,
            amount          TEXT NOT NULL,      -- canonical decimal string, e.g. '25.00'
            currency        TEXT NOT NULL,
            payer_name      TEXT,
            received_at     INTEGER NOT NULL,   -- unix epoch seconds, from the message
            source_ref      TEXT NOT NULL,      -- folder/uidvalidity/uid the mail came from
            created_at      INTEGER NOT NULL    -- unix epoch ms, row insert time
        );

        CREATE INDEX IF NOT EXISTS idx_donations_received ON donations(received_at DESC);

        -- Mailbox read position. Single row; all zeroes until the first
        -- fully committed run.
        CREATE TABLE IF NOT EXISTS ingest_checkpoint (
            id            INTEGER PRIMARY KEY CHECK (id = 0),
            uid_validity  INTEGER NOT NULL DEFAULT 0,
            last_uid      INTEGER NOT NULL DEFAULT 0,
            updated_at    INTEGER             -- unix epoch ms of the last advance
        );

        INSERT OR IGNORE INTO ingest_checkpoint (id, uid_validity, last_uid) VALUES (0, 0, 0);
        ",
    )?;
    Ok(())
}
