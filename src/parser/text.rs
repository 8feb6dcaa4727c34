use mailparse::{MailHeaderMap, ParsedMail};

/// Searchable view of one raw message: envelope fields the rules gate on,
/// plus the body text the extraction patterns run over.
#[derive(Debug, Clone)]
pub struct MessageText {
    pub sender: Option<String>,
    pub subject: Option<String>,
    /// Unix epoch seconds from the Date header, if one parsed
    pub date_epoch: Option<i64>,
    pub body: String,
}

impl MessageText {
    /// A headerless view over plain body text. Sender and subject gates are
    /// neutral for input built this way.
    pub fn from_body(body: impl Into<String>) -> Self {
        Self {
            sender: None,
            subject: None,
            date_epoch: None,
            body: body.into(),
        }
    }
}

/// Turn raw message bytes into text the rules can search. Never fails:
/// anything mailparse cannot make sense of is carried through lossily so
/// the caller still gets a (non-)match instead of an error.
pub fn extract(raw: &[u8]) -> MessageText {
    let mail = match mailparse::parse_mail(raw) {
        Ok(mail) => mail,
        Err(_) => {
            return MessageText {
                sender: None,
                subject: None,
                date_epoch: None,
                body: String::from_utf8_lossy(raw).into_owned(),
            }
        }
    };

    let sender = mail.headers.get_first_value("From");
    let subject = mail.headers.get_first_value("Subject");
    let date_epoch = mail
        .headers
        .get_first_value("Date")
        .and_then(|value| mailparse::dateparse(&value).ok());

    let mut body = extract_body(&mail);
    if body.trim().is_empty() {
        // Headerless text tends to get misread as a header block with an
        // empty body; fall back to the raw bytes so nothing is lost.
        body = String::from_utf8_lossy(raw).into_owned();
    }

    MessageText {
        sender,
        subject,
        date_epoch,
        body,
    }
}

/// Payment notifications put the useful table in the HTML part; the plain
/// part is often a stub. Prefer HTML (flattened), fall back to plain.
fn extract_body(mail: &ParsedMail) -> String {
    if let Some(html_part) = find_part(mail, "text/html") {
        if let Ok(html) = html_part.get_body() {
            return flatten_html(&html);
        }
    }

    if let Some(plain_part) = find_part(mail, "text/plain") {
        if let Ok(text) = plain_part.get_body() {
            return text;
        }
    }

    mail.get_body().unwrap_or_default()
}

fn find_part<'a, 'b>(mail: &'a ParsedMail<'b>, mimetype: &str) -> Option<&'a ParsedMail<'b>> {
    if mail.ctype.mimetype.eq_ignore_ascii_case(mimetype) {
        return Some(mail);
    }
    for part in &mail.subparts {
        if let Some(found) = find_part(part, mimetype) {
            return Some(found);
        }
    }
    None
}

fn flatten_html(html: &str) -> String {
    html2text::from_read(html.as_bytes(), 120).unwrap_or_else(|_| html.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_message_headers_and_body() {
        let raw = b"From: PayPal <service@paypal.de>\r\n\
                    Subject: Du hast eine Zahlung erhalten\r\n\
                    Date: Mon, 3 Aug 2026 10:15:00 +0200\r\n\
                    Content-Type: text/plain; charset=utf-8\r\n\
                    \r\n\
                    Transaktionscode: 4CJ66557EY568921C\r\n";

        let text = extract(raw);
        assert_eq!(
            text.sender.as_deref(),
            Some("PayPal <service@paypal.de>")
        );
        assert_eq!(
            text.subject.as_deref(),
            Some("Du hast eine Zahlung erhalten")
        );
        assert!(text.date_epoch.is_some());
        assert!(text.body.contains("Transaktionscode: 4CJ66557EY568921C"));
    }

    #[test]
    fn test_html_part_preferred_and_flattened() {
        let raw = b"From: service@paypal.de\r\n\
                    Subject: Zahlung erhalten\r\n\
                    MIME-Version: 1.0\r\n\
                    Content-Type: multipart/alternative; boundary=\"xyz\"\r\n\
                    \r\n\
                    --xyz\r\n\
                    Content-Type: text/plain; charset=utf-8\r\n\
                    \r\n\
                    Bitte HTML-Ansicht verwenden.\r\n\
                    --xyz\r\n\
                    Content-Type: text/html; charset=utf-8\r\n\
                    \r\n\
                    <html><body><h1>Max hat dir 12,50 \xe2\x82\xac gesendet</h1></body></html>\r\n\
                    --xyz--\r\n";

        let text = extract(raw);
        assert!(text.body.contains("hat dir 12,50"), "body: {}", text.body);
        assert!(!text.body.contains("<h1>"));
        assert!(!text.body.contains("HTML-Ansicht"));
    }

    #[test]
    fn test_quoted_printable_body_decodes() {
        let raw = b"From: service@paypal.de\r\n\
                    Subject: Test\r\n\
                    Content-Type: text/plain; charset=utf-8\r\n\
                    Content-Transfer-Encoding: quoted-printable\r\n\
                    \r\n\
                    Sch=C3=B6nen Dank! Betrag: 12,50 EUR\r\n";

        let text = extract(raw);
        assert!(text.body.contains("Schönen Dank!"));
        assert!(text.body.contains("Betrag: 12,50 EUR"));
    }

    #[test]
    fn test_headerless_text_falls_back_to_raw() {
        let raw = "You received \u{20ac}25.00 from Jane Doe. Transaction ID: 9AB123XYZ";
        let text = extract(raw.as_bytes());
        assert!(text.body.contains("Transaction ID: 9AB123XYZ"));
        assert!(text.body.contains("Jane Doe"));
    }

    #[test]
    fn test_binary_garbage_is_total() {
        let raw: Vec<u8> = vec![0x00, 0xff, 0xfe, 0x80, 0x12, 0x00, 0x9c];
        let text = extract(&raw);
        // Nothing useful comes out, but nothing is lost either.
        assert!(!text.body.is_empty());
    }

    #[test]
    fn test_empty_input() {
        let text = extract(b"");
        assert!(text.body.trim().is_empty());
        assert!(text.sender.is_none());
    }
}
