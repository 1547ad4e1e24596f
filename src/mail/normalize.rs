//! Raw RFC 5322 bytes to [`Message`].
//!
//! [`normalize`] is strict and reports malformed input; [`normalize_or_default`]
//! never fails and hands back the placeholder record instead. Which one a
//! mailbox path uses decides whether a bad message is kept or dropped.

use chrono::{DateTime, TimeZone, Utc};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use tracing::warn;

use crate::error::MailError;
use crate::mail::{AttachmentInfo, Message, RawMessage, NO_SUBJECT};

const HTML_TEXT_WIDTH: usize = 80;

pub fn normalize(id: u32, raw: &[u8]) -> Result<Message, MailError> {
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(MailError::Parse(format!("message {id} is empty")));
    }

    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| MailError::Parse(format!("message {id}: {e}")))?;

    let mut msg = Message::placeholder(id);

    msg.message_id = header(&parsed, "Message-ID").filter(|v| !v.is_empty());
    msg.from = header(&parsed, "From").unwrap_or_default();
    msg.to = header(&parsed, "To").unwrap_or_default();
    msg.cc = header(&parsed, "Cc").unwrap_or_default();
    msg.subject = header(&parsed, "Subject")
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| NO_SUBJECT.to_string());
    if let Some(date) = header(&parsed, "Date").and_then(|d| parse_date(&d)) {
        msg.date = date;
    }

    let mut text = None;
    let mut html = None;
    walk_parts(&parsed, &mut text, &mut html, &mut msg.attachments);

    msg.html = html.unwrap_or_default();
    msg.text = match text {
        Some(t) => t,
        None if !msg.html.is_empty() => html_to_text(&msg.html),
        None => String::new(),
    };

    Ok(msg)
}

/// Never fails: malformed input yields the placeholder with the given id.
pub fn normalize_or_default(id: u32, raw: &[u8]) -> Message {
    match normalize(id, raw) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(id, error = %err, "unparseable message, keeping defaults");
            Message::placeholder(id)
        }
    }
}

/// Parse every message on its own blocking task and wait for all of them.
///
/// Output order matches input order; callers sort afterwards.
pub async fn normalize_batch(batch: Vec<RawMessage>) -> Vec<Message> {
    let tasks: Vec<_> = batch
        .into_iter()
        .map(|raw| {
            let id = raw.id;
            let task = tokio::task::spawn_blocking(move || normalize_or_default(raw.id, &raw.bytes));
            (id, task)
        })
        .collect();

    let mut out = Vec::with_capacity(tasks.len());
    for (id, task) in tasks {
        match task.await {
            Ok(msg) => out.push(msg),
            Err(err) => {
                warn!(id, error = %err, "parse task died, keeping defaults");
                out.push(Message::placeholder(id));
            }
        }
    }
    out
}

fn header(parsed: &ParsedMail, name: &str) -> Option<String> {
    parsed
        .headers
        .get_first_value(name)
        .map(|v| v.split_whitespace().collect::<Vec<_>>().join(" "))
}

pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let ts = mailparse::dateparse(value).ok()?;
    Utc.timestamp_opt(ts, 0).single()
}

fn walk_parts(
    part: &ParsedMail,
    text: &mut Option<String>,
    html: &mut Option<String>,
    attachments: &mut Vec<AttachmentInfo>,
) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk_parts(sub, text, html, attachments);
        }
        return;
    }

    let ctype = part.ctype.mimetype.to_lowercase();
    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();

    let is_attachment =
        disposition.disposition == DispositionType::Attachment || !ctype.starts_with("text/");

    if is_attachment {
        let size = part.get_body_raw().map(|b| b.len()).unwrap_or(0);
        attachments.push(AttachmentInfo { filename, content_type: ctype, size });
    } else if ctype == "text/plain" && text.is_none() {
        *text = part.get_body().ok();
    } else if ctype == "text/html" && html.is_none() {
        *html = part.get_body().ok();
    }
}

fn html_to_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), HTML_TEXT_WIDTH)
        .map(|t| t.trim_end().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTIPART: &[u8] = b"Message-ID: <abc@example.com>\r\n\
From: Alice <alice@example.com>\r\n\
To: bob@example.com\r\n\
Cc: carol@example.com, dave@example.com\r\n\
Subject: =?UTF-8?B?SGVsbG8gd29ybGQ=?=\r\n\
Date: Tue, 1 Jul 2003 10:52:37 +0200\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
\r\n\
--outer\r\n\
Content-Type: multipart/alternative; boundary=\"inner\"\r\n\
\r\n\
--inner\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
plain body\r\n\
--inner\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>html body</p>\r\n\
--inner--\r\n\
--outer\r\n\
Content-Type: application/pdf; name=\"report.pdf\"\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
aGVsbG8=\r\n\
--outer--\r\n";

    #[test]
    fn multipart_message_is_flattened() {
        let msg = normalize(4, MULTIPART).unwrap();
        assert_eq!(msg.id, 4);
        assert_eq!(msg.message_id.as_deref(), Some("<abc@example.com>"));
        assert_eq!(msg.from, "Alice <alice@example.com>");
        assert_eq!(msg.to, "bob@example.com");
        assert_eq!(msg.cc, "carol@example.com, dave@example.com");
        assert_eq!(msg.subject, "Hello world");
        assert_eq!(msg.date, Utc.with_ymd_and_hms(2003, 7, 1, 8, 52, 37).unwrap());
        assert_eq!(msg.text.trim(), "plain body");
        assert_eq!(msg.html.trim(), "<p>html body</p>");
        assert_eq!(
            msg.attachments,
            vec![AttachmentInfo {
                filename: Some("report.pdf".into()),
                content_type: "application/pdf".into(),
                size: 5,
            }]
        );
    }

    #[test]
    fn missing_headers_get_defaults() {
        let before = Utc::now();
        let msg = normalize(1, b"X-Whatever: 1\r\n\r\nbody only\r\n").unwrap();
        assert_eq!(msg.subject, NO_SUBJECT);
        assert!(msg.date >= before);
        assert_eq!(msg.message_id, None);
        assert!(msg.attachments.is_empty());
        assert_eq!(msg.text.trim(), "body only");
    }

    #[test]
    fn unparseable_date_defaults_to_now() {
        let before = Utc::now();
        let msg = normalize(1, b"Subject: hi\r\nDate: not a date at all\r\n\r\nx").unwrap();
        assert_eq!(msg.subject, "hi");
        assert!(msg.date >= before);
    }

    #[test]
    fn html_only_message_gets_text_rendering() {
        let raw = b"Subject: promo\r\nContent-Type: text/html\r\n\r\n<p>Big <b>sale</b></p>";
        let msg = normalize(2, raw).unwrap();
        assert!(msg.html.contains("<b>sale</b>"));
        assert!(msg.text.contains("sale"));
        assert!(!msg.text.contains("<b>"));
    }

    #[test]
    fn empty_input_is_a_parse_error() {
        assert!(matches!(normalize(3, b""), Err(MailError::Parse(_))));
        assert!(matches!(normalize(3, b"\r\n\r\n"), Err(MailError::Parse(_))));
    }

    #[test]
    fn lenient_path_never_fails() {
        let before = Utc::now();
        for raw in [&b""[..], b"\xff\xfe\x00garbage", b"::::\r\n\r\n", b"Subject"] {
            let msg = normalize_or_default(9, raw);
            assert_eq!(msg.id, 9);
            assert!(!msg.subject.is_empty());
            assert!(msg.date >= before);
        }
    }

    #[tokio::test]
    async fn batch_keeps_every_message() {
        let batch = vec![
            RawMessage { id: 1, bytes: b"Subject: one\r\n\r\n1".to_vec() },
            RawMessage { id: 2, bytes: Vec::new() },
            RawMessage { id: 3, bytes: b"Subject: three\r\n\r\n3".to_vec() },
        ];
        let out = normalize_batch(batch).await;
        let subjects: Vec<&str> = out.iter().map(|m| m.subject.as_str()).collect();
        assert_eq!(subjects, vec!["one", NO_SUBJECT, "three"]);
    }
}
