use async_imap::types::Fetch;
use async_imap::Session;
use async_native_tls::TlsStream;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::ImapConfig;
use crate::error::MeterError;
use crate::store::Checkpoint;

use super::{FetchBatch, FetchedMessage, MailSource};

// An IMAP session is generic over its transport; ours is always TLS over
// plain TCP, so give the combination one name.
type ImapSession = Session<TlsStream<TcpStream>>;

/// Production mail source. Connects fresh for every poll: runs are minutes
/// apart, so holding a session open between them buys nothing and invites
/// server-side idle timeouts.
pub struct ImapMailbox {
    config: ImapConfig,
    password: String,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig, password: String) -> Self {
        Self { config, password }
    }

    async fn connect(&self) -> Result<ImapSession, MeterError> {
        info!(host = %self.config.host, port = self.config.port, "Connecting to IMAP server");

        let tcp = TcpStream::connect((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| MeterError::Net(format!("TCP connection failed: {}", e)))?;

        let tls = async_native_tls::TlsConnector::new();
        let tls_stream = tls
            .connect(&self.config.host, tcp)
            .await
            .map_err(|e| MeterError::Net(format!("TLS handshake failed: {}", e)))?;

        let client = async_imap::Client::new(tls_stream);

        let session = client
            .login(&self.config.user, &self.password)
            .await
            .map_err(|(e, _)| MeterError::Auth(format!("Login failed: {}", e)))?;

        Ok(session)
    }
}

#[async_trait]
impl MailSource for ImapMailbox {
    async fn fetch_since(
        &mut self,
        checkpoint: &Checkpoint,
        limit: usize,
    ) -> Result<FetchBatch, MeterError> {
        let mut session = self.connect().await?;
        let result = fetch_new_messages(&mut session, &self.config.folder, checkpoint, limit).await;

        // Best-effort goodbye; the fetch result matters, the LOGOUT does not.
        if let Err(e) = session.logout().await {
            debug!("LOGOUT failed: {}", e);
        }

        result
    }
}

async fn fetch_new_messages(
    session: &mut ImapSession,
    folder: &str,
    checkpoint: &Checkpoint,
    limit: usize,
) -> Result<FetchBatch, MeterError> {
    // EXAMINE keeps the folder read-only: polling must not flag messages
    // or otherwise disturb the mailbox.
    let mailbox = session
        .examine(folder)
        .await
        .map_err(|e| MeterError::Protocol(format!("EXAMINE {} failed: {}", folder, e)))?;

    let uid_validity = mailbox.uid_validity.unwrap_or(0);

    // UIDs from a previous incarnation of the mailbox mean nothing. Scan
    // from the start again and let the ledger absorb the re-reads.
    let since_uid = if uid_validity == checkpoint.uid_validity {
        checkpoint.last_uid
    } else {
        if checkpoint.uid_validity != 0 {
            warn!(
                old = checkpoint.uid_validity,
                new = uid_validity,
                "UIDVALIDITY changed, rescanning mailbox"
            );
        }
        0
    };

    let query = format!("UID {}:*", since_uid.saturating_add(1));
    let uid_set = session
        .uid_search(&query)
        .await
        .map_err(|e| MeterError::Net(format!("UID SEARCH failed: {}", e)))?;

    // Servers echo the highest existing UID for a `n:*` range even when it
    // sits below n, so the range alone is not enough.
    let mut uids: Vec<u32> = uid_set.into_iter().filter(|&uid| uid > since_uid).collect();
    uids.sort_unstable();
    uids.truncate(limit);

    if uids.is_empty() {
        debug!(folder = %folder, "No new messages");
        return Ok(FetchBatch {
            folder: folder.to_string(),
            uid_validity,
            messages: Vec::new(),
        });
    }

    let uid_list = uids
        .iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",");

    // BODY.PEEK[] downloads the full message without setting \Seen.
    let fetch_stream = session
        .uid_fetch(&uid_list, "(UID INTERNALDATE BODY.PEEK[])")
        .await
        .map_err(|e| MeterError::Net(format!("UID FETCH failed: {}", e)))?;
    let fetches = collect_tolerant(fetch_stream, "message download").await;

    let mut messages: Vec<FetchedMessage> = fetches.iter().filter_map(to_message).collect();
    messages.sort_unstable_by_key(|m| m.uid);
    truncate_at_first_gap(&uids, &mut messages);

    info!(folder = %folder, count = messages.len(), "Fetched new messages");
    Ok(FetchBatch {
        folder: folder.to_string(),
        uid_validity,
        messages,
    })
}

/// Drain a FETCH stream, keeping what parses. A single malformed response
/// costs one message, not the batch.
async fn collect_tolerant<E: std::fmt::Display>(
    stream: impl futures::Stream<Item = Result<Fetch, E>>,
    context: &str,
) -> Vec<Fetch> {
    futures::pin_mut!(stream);
    let mut items = Vec::new();
    while let Some(result) = stream.next().await {
        match result {
            Ok(fetch) => items.push(fetch),
            Err(e) => {
                warn!("Skipping unparseable IMAP response ({}): {}", context, e);
            }
        }
    }
    items
}

/// Cut the batch at the first searched UID that came back without a usable
/// message (garbled response, or expunged between SEARCH and FETCH). The
/// checkpoint advances to the batch's highest UID, so a message silently
/// missing below that mark would be lost for good; everything from the gap
/// up stays unfetched and the next run picks it up again.
fn truncate_at_first_gap(requested: &[u32], messages: &mut Vec<FetchedMessage>) {
    let first_missing = requested
        .iter()
        .copied()
        .find(|uid| messages.binary_search_by_key(uid, |m| m.uid).is_err());

    if let Some(uid) = first_missing {
        warn!(uid = uid, "No usable FETCH response for UID, truncating batch at the gap");
        messages.retain(|m| m.uid < uid);
    }
}

/// A FETCH item without a UID or body is unusable for ingestion; drop it
/// rather than abort the whole batch.
fn to_message(fetch: &Fetch) -> Option<FetchedMessage> {
    let uid = match fetch.uid {
        Some(uid) => uid,
        None => {
            warn!("FETCH response without UID, skipping");
            return None;
        }
    };
    let raw = match fetch.body() {
        Some(body) => body.to_vec(),
        None => {
            warn!(uid = uid, "FETCH response without body, skipping");
            return None;
        }
    };
    let internal_date = fetch.internal_date().map(|date| date.timestamp());

    Some(FetchedMessage {
        uid,
        internal_date,
        raw,
    })
}
