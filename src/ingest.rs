use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::error::MeterError;
use crate::mailbox::{self, FetchBatch, MailSource};
use crate::parser;
use crate::store::{checkpoint, donations, Checkpoint, DbPool, DonationRecord, InsertOutcome};

/// Delay between fetch attempts grows linearly with this step.
const RETRY_DELAY_MS: u64 = 500;

/// Knobs for one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub batch_limit: usize,
    pub max_fetch_retries: u32,
    pub run_timeout: Duration,
    /// Report what would be recorded without writing anything
    pub dry_run: bool,
}

impl IngestOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            // A zero limit would quietly turn every poll into a no-op.
            batch_limit: config.batch_limit.max(1),
            max_fetch_retries: config.max_fetch_retries,
            run_timeout: Duration::from_secs(config.run_timeout_secs),
            dry_run: false,
        }
    }
}

/// What one run did. `scanned` counts every fetched message; the other
/// counters partition it into recorded, deduplicated, and skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub scanned: usize,
    pub inserted: usize,
    pub already_present: usize,
    pub skipped: usize,
    pub dry_run: bool,
    /// Checkpoint as it stands after the run
    pub checkpoint: Checkpoint,
}

/// One poll cycle: fetch everything past the checkpoint, parse, record,
/// then advance the checkpoint.
///
/// The order is deliberate. Donations are committed before the checkpoint
/// moves, so a crash between the two re-reads messages instead of losing
/// them, and the ledger's uniqueness absorbs the re-reads. Any commit error
/// aborts the run with the checkpoint untouched; rows already inserted stay,
/// the next run re-fetches the remainder.
pub async fn run_once<S: MailSource>(
    source: &mut S,
    pool: &DbPool,
    options: &IngestOptions,
) -> Result<RunSummary, MeterError> {
    let started = Instant::now();
    let checkpoint_before = checkpoint::load(pool)?;

    debug!(
        uid_validity = checkpoint_before.uid_validity,
        last_uid = checkpoint_before.last_uid,
        "Starting ingestion run"
    );

    // The budget bounds the fetch outright: a peer that accepts the
    // connection and then goes silent would otherwise hang the run with
    // no deadline check ever reached.
    let batch = match tokio::time::timeout(
        options.run_timeout,
        fetch_with_retry(source, &checkpoint_before, options),
    )
    .await
    {
        Ok(fetched) => fetched?,
        Err(_) => return Err(MeterError::Timeout(format!("{:?}", options.run_timeout))),
    };

    let mut summary = RunSummary {
        scanned: batch.messages.len(),
        inserted: 0,
        already_present: 0,
        skipped: 0,
        dry_run: options.dry_run,
        checkpoint: checkpoint_before,
    };

    let pending = parse_batch(&batch, &mut summary);

    check_deadline(started, options.run_timeout)?;

    // Populated in dry runs only, where the ledger never learns about
    // earlier records and cannot catch an in-batch duplicate itself.
    let mut previewed: HashSet<&str> = HashSet::new();
    for record in &pending {
        if options.dry_run {
            let repeat = !previewed.insert(&record.transaction_id);
            if repeat || donations::get(pool, &record.transaction_id)?.is_some() {
                summary.already_present += 1;
            } else {
                summary.inserted += 1;
            }
        } else {
            match donations::insert_if_new(pool, record)? {
                InsertOutcome::Inserted => summary.inserted += 1,
                InsertOutcome::AlreadyPresent => summary.already_present += 1,
            }
        }
    }

    check_deadline(started, options.run_timeout)?;

    // The checkpoint covers every fetched message, skips included: a mail
    // that parses to nothing today will parse to nothing tomorrow too.
    // An empty batch moves nothing.
    if !options.dry_run {
        if let Some(highest_uid) = batch.messages.iter().map(|m| m.uid).max() {
            checkpoint::advance(pool, batch.uid_validity, highest_uid)?;
        }
    }
    summary.checkpoint = checkpoint::load(pool)?;

    info!(
        scanned = summary.scanned,
        inserted = summary.inserted,
        already_present = summary.already_present,
        skipped = summary.skipped,
        dry_run = summary.dry_run,
        "Ingestion run finished"
    );

    Ok(summary)
}

/// Fetch with a bounded retry budget: the first attempt plus up to
/// `max_fetch_retries` more. Only transient failures are retried; auth and
/// protocol errors surface immediately.
async fn fetch_with_retry<S: MailSource>(
    source: &mut S,
    checkpoint: &Checkpoint,
    options: &IngestOptions,
) -> Result<FetchBatch, MeterError> {
    let mut attempt: u32 = 1;
    loop {
        match source.fetch_since(checkpoint, options.batch_limit).await {
            Ok(batch) => return Ok(batch),
            Err(e) if e.is_transient() && attempt <= options.max_fetch_retries => {
                let wait = Duration::from_millis(RETRY_DELAY_MS * u64::from(attempt));
                warn!(attempt = attempt, "Fetch failed, retrying in {:?}: {}", wait, e);
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Turn fetched messages into insertable records, counting skips as we go.
/// Parsing is total, so this phase cannot fail the run.
fn parse_batch(batch: &FetchBatch, summary: &mut RunSummary) -> Vec<DonationRecord> {
    let mut pending = Vec::new();

    for message in &batch.messages {
        let text = parser::text::extract(&message.raw);
        match parser::rules::match_message(&text) {
            Ok(donation) => {
                // Prefer the sender's Date header, then the server's
                // arrival stamp, then our own clock.
                let received_at = text
                    .date_epoch
                    .or(message.internal_date)
                    .unwrap_or_else(|| Utc::now().timestamp());

                pending.push(DonationRecord {
                    transaction_id: donation.transaction_id,
                    amount: donation.amount,
                    currency: donation.currency,
                    payer_name: donation.payer_name,
                    received_at,
                    source_ref: mailbox::source_ref(
                        &batch.folder,
                        batch.uid_validity,
                        message.uid,
                    ),
                });
            }
            Err(reason) => {
                debug!(uid = message.uid, reason = ?reason, "Message skipped");
                summary.skipped += 1;
            }
        }
    }

    pending
}

fn check_deadline(started: Instant, budget: Duration) -> Result<(), MeterError> {
    if started.elapsed() > budget {
        return Err(MeterError::Timeout(format!("{:?}", budget)));
    }
    Ok(())
}
