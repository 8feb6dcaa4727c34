pub mod amount;
pub mod rules;
pub mod text;

pub use text::MessageText;

use rust_decimal::Decimal;

/// One payment extracted from a notification mail. `received_at` is not
/// part of this: the timestamp comes from the message envelope and is
/// joined in by the ingestion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDonation {
    /// Provider transaction id, verbatim as it appeared in the mail
    pub transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub payer_name: Option<String>,
}

/// Why a message produced no donation. Counted per run, never fatal.
/// Ordered by how far extraction got before giving up; when several rules
/// fail differently, the most advanced reason is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SkipReason {
    EmptyMessage,
    SenderNotAllowed,
    MissingTransactionId,
    MissingAmount,
    UnsupportedCurrency,
    UnparsableAmount,
    NonPositiveAmount,
    /// A payment we sent, not one we received
    OutgoingPayment,
    /// Balance moved to a bank account
    Withdrawal,
    Refund,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Donation(ParsedDonation),
    Skip(SkipReason),
}

/// Parse one raw message. Total over arbitrary bytes: the result is always
/// a donation or a skip reason, never an error.
pub fn parse_message(raw: &[u8]) -> ParseOutcome {
    let text = text::extract(raw);
    match rules::match_message(&text) {
        Ok(donation) => ParseOutcome::Donation(donation),
        Err(reason) => ParseOutcome::Skip(reason),
    }
}
