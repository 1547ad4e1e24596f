pub mod imap;
pub mod normalize;
pub mod pop3;
pub mod search;
pub mod session;
pub mod smtp;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const NO_SUBJECT: &str = "(no subject)";

/// A message as handed to callers, whichever protocol produced it.
///
/// `id` is a position (IMAP sequence number or POP3 ordinal). It is only
/// meaningful against the mailbox state of the listing that returned it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub cc: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentInfo>,
}

impl Message {
    /// What a message looks like before (or instead of) parsing.
    pub fn placeholder(id: u32) -> Self {
        Self {
            id,
            message_id: None,
            from: String::new(),
            to: String::new(),
            cc: String::new(),
            subject: NO_SUBJECT.to_string(),
            date: Utc::now(),
            text: String::new(),
            html: String::new(),
            attachments: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentInfo {
    pub filename: Option<String>,
    pub content_type: String,
    pub size: usize,
}

/// Undecoded bytes of one message as the server delivered them.
#[derive(Clone, Debug)]
pub struct RawMessage {
    pub id: u32,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self { success: true, message: None }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self { success: true, message: Some(message.into()) }
    }
}

/// Newest first. Equal dates fall back to the higher position first so the
/// order never depends on arrival order.
pub fn sort_newest_first(messages: &mut [Message]) {
    messages.sort_by(|a, b| b.date.cmp(&a.date).then(b.id.cmp(&a.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(id: u32, ts: i64) -> Message {
        Message {
            date: Utc.timestamp_opt(ts, 0).unwrap(),
            ..Message::placeholder(id)
        }
    }

    #[test]
    fn sorts_by_date_then_position() {
        let mut list = vec![at(1, 300), at(2, 100), at(3, 300), at(4, 200)];
        sort_newest_first(&mut list);
        let ids: Vec<u32> = list.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 1, 4, 2]);
    }

    #[test]
    fn serializes_camel_case() {
        let mut m = at(7, 0);
        m.message_id = Some("<a@b>".into());
        m.attachments.push(AttachmentInfo {
            filename: Some("a.pdf".into()),
            content_type: "application/pdf".into(),
            size: 3,
        });
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["messageId"], "<a@b>");
        assert_eq!(json["attachments"][0]["contentType"], "application/pdf");
        assert_eq!(json["subject"], NO_SUBJECT);
    }
}
