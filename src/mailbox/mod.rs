pub mod imap;

use async_trait::async_trait;

use crate::error::MeterError;
use crate::store::Checkpoint;

/// One message pulled from the mailbox.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    /// Server-side arrival time in epoch seconds, when the server gave one
    pub internal_date: Option<i64>,
    pub raw: Vec<u8>,
}

/// One poll's worth of messages, in mailbox arrival order (UID ascending).
#[derive(Debug, Clone, Default)]
pub struct FetchBatch {
    /// Folder the messages came from, for audit references
    pub folder: String,
    pub uid_validity: u32,
    pub messages: Vec<FetchedMessage>,
}

/// Where messages come from. The ingestion run drives this seam; IMAP is
/// the production implementation, tests script their own.
#[async_trait]
pub trait MailSource {
    /// Fetch up to `limit` messages the checkpoint has not covered yet,
    /// oldest first. A UIDVALIDITY different from the checkpoint's means
    /// the mailbox was recreated; implementations then fetch from the
    /// beginning again and the ledger absorbs the re-reads.
    async fn fetch_since(
        &mut self,
        checkpoint: &Checkpoint,
        limit: usize,
    ) -> Result<FetchBatch, MeterError>;
}

/// Stable audit reference for one message.
pub fn source_ref(folder: &str, uid_validity: u32, uid: u32) -> String {
    format!("{}/{}/{}", folder, uid_validity, uid)
}
