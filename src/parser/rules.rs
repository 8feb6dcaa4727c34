use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use tracing::debug;

use super::amount;
use super::text::MessageText;
use super::{ParsedDonation, SkipReason};

/// One provider-format rule: which senders it trusts, and the patterns for
/// the mandatory and optional fields. Rules are tried in order; the first
/// one that yields a complete record wins.
struct ExtractionRule {
    name: &'static str,
    sender_fragments: &'static [&'static str],
    transaction: Regex,
    amounts: Vec<Regex>,
    payers: Vec<Regex>,
}

struct RejectPattern {
    reason: SkipReason,
    pattern: Regex,
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("extraction pattern must compile")
}

/// Mails that carry amounts and transaction codes but are not incoming
/// payments. Checked before extraction so a well-formed "you sent money"
/// mail can never book a donation.
static REJECT_PATTERNS: Lazy<Vec<RejectPattern>> = Lazy::new(|| {
    vec![
        RejectPattern {
            reason: SkipReason::OutgoingPayment,
            pattern: re(r"(?i)zahlung\s+gesendet"),
        },
        RejectPattern {
            reason: SkipReason::OutgoingPayment,
            pattern: re(r"(?i)you\s+sent"),
        },
        RejectPattern {
            reason: SkipReason::OutgoingPayment,
            pattern: re(r"(?i)sent\s+a\s+payment"),
        },
        RejectPattern {
            reason: SkipReason::Withdrawal,
            pattern: re(r"(?i)abbuchung"),
        },
        RejectPattern {
            reason: SkipReason::Withdrawal,
            pattern: re(r"(?i)abgebucht"),
        },
        RejectPattern {
            reason: SkipReason::Withdrawal,
            pattern: re(r"(?i)withdraw"),
        },
        RejectPattern {
            reason: SkipReason::Refund,
            pattern: re(r"(?i)rückzahlung"),
        },
        RejectPattern {
            reason: SkipReason::Refund,
            pattern: re(r"(?i)refund"),
        },
    ]
});

// Notes on the pattern shapes:
// - `\W{0,24}?` between label and value absorbs ": ", table separators and
//   line breaks left over from flattened HTML.
// - Transaction ids are 6-32 chars of uppercase alphanumerics and hyphens,
//   captured verbatim.
// - Amount captures keep the sign and currency decoration; normalization
//   happens afterwards in one place.
static RULES: Lazy<Vec<ExtractionRule>> = Lazy::new(|| {
    vec![
        ExtractionRule {
            name: "paypal-de",
            sender_fragments: &["paypal"],
            transaction: re(r"(?i:transaktionscode)\W{0,24}?([A-Z0-9-]{6,32})"),
            amounts: vec![
                re(r"(?i:erhaltener\s+betrag|betrag)\W{0,24}?(-?\s*(?:[€$£]\s*)?\d[\d.,\s]*(?:[€$£]|[A-Z]{3})?)"),
                re(r"(-?\d[\d.,\s]*[€$£])"),
                re(r"([€$£]\s*-?\d[\d.,\s]*)"),
            ],
            payers: vec![
                re(r"\b(?i:von|from)\s*[:|│]\s*([^\n<|│]+)"),
                re(r"([^\n|│]{2,64}?)\s+hat\s+dir\b"),
                re(r"\b(?i:von)\s+([^.,\n<|│]{2,64}?)\s+(?i:erhalten)\b"),
            ],
        },
        ExtractionRule {
            name: "paypal-en",
            sender_fragments: &["paypal"],
            transaction: re(r"(?i:transaction\s*id)\W{0,24}?([A-Z0-9-]{6,32})"),
            amounts: vec![
                re(r"(?i:amount)\W{0,24}?(-?\s*(?:[€$£]\s*)?\d[\d.,\s]*(?:[€$£]|[A-Z]{3})?)"),
                re(r"([€$£]\s*-?\d[\d.,\s]*)"),
                re(r"(-?\d[\d.,\s]*[€$£])"),
            ],
            payers: vec![
                re(r"\b(?i:from)\s*[:|│]\s*([^\n<|│]+)"),
                re(r"\b(?i:from)\s+([^.,\n<|│]{2,64})"),
            ],
        },
    ]
});

impl ExtractionRule {
    /// The allow-list gates on the envelope when one exists. Text fed in
    /// without envelope headers is not filtered.
    fn sender_allowed(&self, text: &MessageText) -> bool {
        if text.sender.is_none() && text.subject.is_none() {
            return true;
        }

        let envelope = format!(
            "{} {}",
            text.sender.as_deref().unwrap_or(""),
            text.subject.as_deref().unwrap_or("")
        )
        .to_lowercase();

        self.sender_fragments
            .iter()
            .any(|fragment| envelope.contains(fragment))
    }

    fn apply(&self, haystack: &str) -> Result<ParsedDonation, SkipReason> {
        let transaction_id = self
            .transaction
            .captures(haystack)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or(SkipReason::MissingTransactionId)?;

        let raw_amount = self
            .amounts
            .iter()
            .find_map(|pattern| {
                pattern
                    .captures(haystack)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str())
            })
            .ok_or(SkipReason::MissingAmount)?;

        if amount::foreign_currency(raw_amount).is_some() {
            return Err(SkipReason::UnsupportedCurrency);
        }

        let value = amount::normalize(raw_amount).ok_or(SkipReason::UnparsableAmount)?;
        if value <= Decimal::ZERO {
            return Err(SkipReason::NonPositiveAmount);
        }

        let payer_name = self.payers.iter().find_map(|pattern| {
            pattern
                .captures(haystack)
                .and_then(|caps| caps.get(1))
                .and_then(|m| clean_payer(m.as_str()))
        });

        Ok(ParsedDonation {
            transaction_id,
            amount: value,
            currency: "EUR".to_string(),
            payer_name,
        })
    }
}

/// Run the rule set over one message. The subject participates in the
/// search (German notifications put the amount there), the envelope sender
/// only gates.
pub fn match_message(text: &MessageText) -> Result<ParsedDonation, SkipReason> {
    let haystack = match &text.subject {
        Some(subject) => format!("{}\n{}", subject, text.body),
        None => text.body.clone(),
    };

    if haystack.trim().is_empty() {
        return Err(SkipReason::EmptyMessage);
    }

    for reject in REJECT_PATTERNS.iter() {
        if reject.pattern.is_match(&haystack) {
            return Err(reject.reason);
        }
    }

    let mut best_reason = SkipReason::EmptyMessage;
    for rule in RULES.iter() {
        if !rule.sender_allowed(text) {
            best_reason = best_reason.max(SkipReason::SenderNotAllowed);
            continue;
        }
        match rule.apply(&haystack) {
            Ok(donation) => {
                debug!(
                    rule = rule.name,
                    transaction_id = %donation.transaction_id,
                    "extraction rule matched"
                );
                return Ok(donation);
            }
            Err(reason) => best_reason = best_reason.max(reason),
        }
    }

    Err(best_reason)
}

fn clean_payer(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let cleaned = collapsed.trim_matches(|c: char| !c.is_alphanumeric());
    if cleaned.chars().count() < 2 {
        return None;
    }
    Some(cleaned.chars().take(120).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn body(text: &str) -> MessageText {
        MessageText::from_body(text)
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_german_labeled_fields() {
        let raw = "
        Betreff: Sie haben eine Zahlung erhalten
        Transaktionscode: 9AB12345C6789012
        Betrag: 12,50 EUR
        Von: Max Mustermann
        ";
        let got = match_message(&body(raw)).unwrap();
        assert_eq!(got.transaction_id, "9AB12345C6789012");
        assert_eq!(got.amount, dec("12.50"));
        assert_eq!(got.currency, "EUR");
        assert_eq!(got.payer_name.as_deref(), Some("Max Mustermann"));
    }

    #[test]
    fn test_german_thousands_separator() {
        let raw = "
        Transaktionscode: 9ZZ00000Z0000000
        Betrag: 1.234,56 EUR
        Von: Erika Musterfrau
        ";
        let got = match_message(&body(raw)).unwrap();
        assert_eq!(got.transaction_id, "9ZZ00000Z0000000");
        assert_eq!(got.amount, dec("1234.56"));
        assert_eq!(got.payer_name.as_deref(), Some("Erika Musterfrau"));
    }

    #[test]
    fn test_english_labeled_fields() {
        let raw = "
        Subject: You received a payment
        Transaction ID: 9AB12345C6789012
        Amount: €1,234.56 EUR
        From: John Smith
        ";
        let got = match_message(&body(raw)).unwrap();
        assert_eq!(got.transaction_id, "9AB12345C6789012");
        assert_eq!(got.amount, dec("1234.56"));
        assert_eq!(got.payer_name.as_deref(), Some("John Smith"));
    }

    #[test]
    fn test_german_sentence_form() {
        let raw = "PayPal\n\nLukas von Hirschhausen hat dir 1,00 € gesendet\n\nTransaktionscode: 4CJ66557EY568921C\n";
        let got = match_message(&body(raw)).unwrap();
        assert_eq!(got.transaction_id, "4CJ66557EY568921C");
        assert_eq!(got.amount, dec("1.00"));
        assert_eq!(got.payer_name.as_deref(), Some("Lukas von Hirschhausen"));
    }

    #[test]
    fn test_sent_payment_is_ignored() {
        // Has Betrag and Transaktionscode, but it is money going out.
        let raw = "
        <html><body>
          <h1>Du hast eine Zahlung gesendet</h1>
          <table>
            <tr><td>Betrag</td><td>3,50 € EUR</td></tr>
            <tr><td>Transaktionscode</td><td>9SENT99999999</td></tr>
          </table>
        </body></html>
        ";
        assert_eq!(
            match_message(&body(raw)),
            Err(SkipReason::OutgoingPayment)
        );
    }

    #[test]
    fn test_withdrawal_mails_are_ignored() {
        let success = "
        <html><body>
          <h1>Ihre Abbuchung war erfolgreich.</h1>
          <p>Sie haben Geld von Ihrem PayPal-Konto auf Ihr Bankkonto abgebucht.</p>
          <table><tr><td>Betrag</td><td>25,00 € EUR</td></tr></table>
        </body></html>
        ";
        let info = "
        <html><body>
          <h1>Informationen zur letzten Abbuchung</h1>
          <p>Ihre Abbuchung konnte nicht verarbeitet werden.</p>
          <table><tr><td>Betrag</td><td>25,00 € EUR</td></tr></table>
        </body></html>
        ";
        assert_eq!(match_message(&body(success)), Err(SkipReason::Withdrawal));
        assert_eq!(match_message(&body(info)), Err(SkipReason::Withdrawal));
    }

    #[test]
    fn test_refund_mail_is_ignored() {
        let raw = "Rückzahlung veranlasst. Transaktionscode: 9REF00011122233 Betrag: 5,00 EUR";
        assert_eq!(match_message(&body(raw)), Err(SkipReason::Refund));
    }

    #[test]
    fn test_sentence_punctuation_after_amount_does_not_inflate_it() {
        // The amount capture runs past "25.00" into the ". " that follows;
        // normalization must not read that as a thousands form.
        let raw = "Transaction ID: 9AB12345C6789012\nAmount: 25.00. Thank you!";
        let got = match_message(&body(raw)).unwrap();
        assert_eq!(got.amount, dec("25.00"));

        let raw_de = "Transaktionscode: 9AB12345C6789012\nBetrag: 12,50. Vielen Dank!";
        let got_de = match_message(&body(raw_de)).unwrap();
        assert_eq!(got_de.amount, dec("12.50"));
    }

    #[test]
    fn test_run_on_separators_are_not_an_amount() {
        let raw = "Transaktionscode: 9AB12345C6789012\nBetrag: 1.23.45 EUR";
        assert_eq!(
            match_message(&body(raw)),
            Err(SkipReason::UnparsableAmount)
        );
    }

    #[test]
    fn test_unrelated_text_has_no_match() {
        let got = match_message(&body("Totally unrelated email."));
        assert_eq!(got, Err(SkipReason::MissingTransactionId));
    }

    #[test]
    fn test_missing_amount() {
        let raw = "Transaktionscode: 9AB12345C6789012\nVielen Dank!";
        assert_eq!(match_message(&body(raw)), Err(SkipReason::MissingAmount));
    }

    #[test]
    fn test_ambiguous_amount_is_not_guessed() {
        let raw = "Transaktionscode: 9AB12345C6789012\nBetrag: 1,234 EUR";
        assert_eq!(
            match_message(&body(raw)),
            Err(SkipReason::UnparsableAmount)
        );
    }

    #[test]
    fn test_zero_amount_rejected() {
        let raw = "Transaktionscode: 9AB12345C6789012\nBetrag: 0,00 EUR";
        assert_eq!(
            match_message(&body(raw)),
            Err(SkipReason::NonPositiveAmount)
        );
    }

    #[test]
    fn test_negative_amount_rejected() {
        let raw = "Transaktionscode: 9AB12345C6789012\nBetrag: -5,00 EUR";
        assert_eq!(
            match_message(&body(raw)),
            Err(SkipReason::NonPositiveAmount)
        );
    }

    #[test]
    fn test_foreign_currency_skipped() {
        let raw = "Transaction ID: 9AB12345C6789012\nAmount: $25.00";
        assert_eq!(
            match_message(&body(raw)),
            Err(SkipReason::UnsupportedCurrency)
        );
    }

    #[test]
    fn test_first_complete_match_wins() {
        let raw = "
        Transaktionscode: 9AAAA1111122222
        Betrag: 5,00 EUR
        Weitere Zahlung folgt.
        Transaktionscode: 9BBBB3333344444
        Betrag: 7,00 EUR
        ";
        let got = match_message(&body(raw)).unwrap();
        assert_eq!(got.transaction_id, "9AAAA1111122222");
        assert_eq!(got.amount, dec("5.00"));
    }

    #[test]
    fn test_payer_is_optional() {
        let raw = "Transaktionscode: 9AB12345C6789012\nBetrag: 2,00 EUR";
        let got = match_message(&body(raw)).unwrap();
        assert_eq!(got.payer_name, None);
        assert_eq!(got.amount, dec("2.00"));
    }

    #[test]
    fn test_transaction_id_with_hyphens_is_verbatim() {
        let raw = "Transaction ID: 9AB-1234-CDEF\nAmount: €3.00";
        let got = match_message(&body(raw)).unwrap();
        assert_eq!(got.transaction_id, "9AB-1234-CDEF");
    }

    #[test]
    fn test_short_token_is_not_a_transaction_id() {
        let raw = "Transaction ID: Z1 amount: --";
        assert_eq!(
            match_message(&body(raw)),
            Err(SkipReason::MissingTransactionId)
        );
    }

    #[test]
    fn test_sender_gate() {
        let mut text = body("Transaction ID: 9AB12345C6789012\nAmount: €5.00");
        text.sender = Some("PayPal <service@paypal.de>".to_string());
        assert!(match_message(&text).is_ok());

        text.sender = Some("somebody@example.com".to_string());
        assert_eq!(match_message(&text), Err(SkipReason::SenderNotAllowed));
    }

    #[test]
    fn test_subject_participates_in_search() {
        let mut text = body("Transaktionscode: 9AB12345C6789012\n");
        text.sender = Some("service@paypal.de".to_string());
        text.subject = Some("Du hast 1,00 € von Lukas Hirschhausen erhalten".to_string());
        let got = match_message(&text).unwrap();
        assert_eq!(got.amount, dec("1.00"));
        assert_eq!(got.payer_name.as_deref(), Some("Lukas Hirschhausen"));
    }
}
