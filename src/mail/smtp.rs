//! Message submission over SMTP: send, forward, reply.

use std::sync::Arc;

use lettre::message::{header, Attachment, Mailbox, Mailboxes, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{ServerConfig, SettingsHandle, Timeouts};
use crate::error::MailError;
use crate::mail::session::{with_deadline, AbortHandle};
use crate::mail::Message;

const FORWARD_MARKER: &str = "---------- Forwarded message ---------";
const ORIGINAL_MARKER: &str = "--- Original Message ---";

/// A message to submit. Address fields take comma-separated lists.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutboundMessage {
    /// Defaults to the configured SMTP user.
    pub from: Option<String>,
    pub to: String,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub attachments: Vec<OutboundAttachment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// The Message-ID header that was sent.
    pub id: String,
    /// The server's final reply to the submission.
    pub response: String,
}

fn mailboxes(raw: &str, field: &str) -> Result<Vec<Mailbox>, MailError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: Mailboxes = raw
        .parse()
        .map_err(|e| MailError::Compose(format!("{field} {raw:?}: {e}")))?;
    Ok(parsed.into_iter().collect())
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Build the wire message. Returns it with the Message-ID it carries.
pub fn build_message(msg: &OutboundMessage, default_from: &str) -> Result<(lettre::Message, String), MailError> {
    let from_raw = non_empty(&msg.from).unwrap_or(default_from);
    let from: Mailbox = from_raw
        .trim()
        .parse()
        .map_err(|e| MailError::Compose(format!("from {from_raw:?}: {e}")))?;

    let to = mailboxes(&msg.to, "to")?;
    if to.is_empty() {
        return Err(MailError::Compose("no recipients".into()));
    }

    let id = format!("<{}@{}>", Uuid::new_v4(), from.email.domain());
    let mut builder = lettre::Message::builder()
        .from(from)
        .subject(msg.subject.clone())
        .message_id(Some(id.clone()));

    for mbox in to {
        builder = builder.to(mbox);
    }
    for mbox in mailboxes(msg.cc.as_deref().unwrap_or_default(), "cc")? {
        builder = builder.cc(mbox);
    }
    for mbox in mailboxes(msg.bcc.as_deref().unwrap_or_default(), "bcc")? {
        builder = builder.bcc(mbox);
    }
    if let Some(parent) = non_empty(&msg.in_reply_to) {
        builder = builder.in_reply_to(parent.to_string());
    }
    if let Some(refs) = non_empty(&msg.references) {
        builder = builder.references(refs.to_string());
    }

    let html_part = |html: &str| {
        SinglePart::builder()
            .header(header::ContentType::TEXT_HTML)
            .body(html.to_string())
    };
    let body = match (non_empty(&msg.text), msg.html.as_deref()) {
        (Some(text), Some(html)) => Body::Multi(
            MultiPart::alternative()
                .singlepart(SinglePart::plain(text.to_string()))
                .singlepart(html_part(html)),
        ),
        (None, Some(html)) => Body::Single(html_part(html)),
        (_, None) => Body::Single(SinglePart::plain(msg.text.clone().unwrap_or_default())),
    };

    let built = if msg.attachments.is_empty() {
        match body {
            Body::Single(part) => builder.singlepart(part),
            Body::Multi(part) => builder.multipart(part),
        }
    } else {
        let mut mixed = match body {
            Body::Single(part) => MultiPart::mixed().singlepart(part),
            Body::Multi(part) => MultiPart::mixed().multipart(part),
        };
        for att in &msg.attachments {
            let ctype = header::ContentType::parse(&att.content_type).map_err(|e| {
                MailError::Compose(format!("attachment {}: content type {:?}: {e}", att.filename, att.content_type))
            })?;
            mixed = mixed.singlepart(Attachment::new(att.filename.clone()).body(att.content.clone(), ctype));
        }
        builder.multipart(mixed)
    };

    let email = built.map_err(|e| MailError::Compose(e.to_string()))?;
    Ok((email, id))
}

enum Body {
    Single(SinglePart),
    Multi(MultiPart),
}

/// `from`, plus every comma-separated `cc` entry when replying to all.
pub fn reply_recipients(from: &str, cc: &str, reply_all: bool) -> String {
    let mut out: Vec<&str> = vec![from.trim()];
    if reply_all {
        out.extend(cc.split(',').map(str::trim));
    }
    out.retain(|s| !s.is_empty());
    out.join(",")
}

pub fn reply_subject(subject: &str) -> String {
    let s = subject.trim();
    if s.to_ascii_lowercase().starts_with("re:") {
        s.to_string()
    } else {
        format!("Re: {s}")
    }
}

pub fn quote_lines(text: &str) -> String {
    let lines: Vec<String> = text
        .replace("\r\n", "\n")
        .lines()
        .map(|l| format!("> {l}"))
        .collect();
    if lines.is_empty() {
        return ">".to_string();
    }
    lines.join("\n")
}

pub fn forward_message(original: &Message, to: &str, extra: &str) -> OutboundMessage {
    let content = if original.text.is_empty() { &original.html } else { &original.text };
    let text = format!(
        "{extra}\n\n{FORWARD_MARKER}\nFrom: {}\nDate: {}\nSubject: {}\nTo: {}\n\n{content}",
        original.from,
        original.date.to_rfc2822(),
        original.subject,
        original.to,
    );
    OutboundMessage {
        to: to.to_string(),
        subject: format!("Fwd: {}", original.subject),
        text: Some(text),
        ..Default::default()
    }
}

pub fn reply_message(original: &Message, reply_text: &str, reply_all: bool) -> OutboundMessage {
    let text = format!("{reply_text}\n\n{ORIGINAL_MARKER}\n{}", quote_lines(&original.text));
    OutboundMessage {
        to: reply_recipients(&original.from, &original.cc, reply_all),
        subject: reply_subject(&original.subject),
        text: Some(text),
        in_reply_to: original.message_id.clone(),
        references: original.message_id.clone(),
        ..Default::default()
    }
}

pub type SmtpTransport = AsyncSmtpTransport<Tokio1Executor>;

/// Relaxed TLS like the mailbox side. `secure` means implicit TLS; otherwise
/// STARTTLS is used when the server offers it.
fn build_transport(cfg: &ServerConfig, timeouts: &Timeouts) -> Result<SmtpTransport, MailError> {
    let params = TlsParameters::builder(cfg.host.clone())
        .dangerous_accept_invalid_certs(true)
        .dangerous_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| MailError::Config(format!("smtp tls: {e}")))?;
    let tls = if cfg.secure { Tls::Wrapper(params) } else { Tls::Opportunistic(params) };

    let mut builder = SmtpTransport::builder_dangerous(cfg.host.as_str())
        .port(cfg.port)
        .tls(tls)
        .timeout(Some(timeouts.submit));
    if !cfg.user.is_empty() {
        builder = builder.credentials(Credentials::new(cfg.user.clone(), cfg.password.clone()));
    }
    Ok(builder.build())
}

struct Channel {
    cfg: ServerConfig,
    transport: Arc<SmtpTransport>,
}

pub struct Mailer {
    settings: SettingsHandle,
    timeouts: Timeouts,
    channel: Mutex<Option<Channel>>,
}

impl Mailer {
    pub fn new(settings: SettingsHandle) -> Self {
        Self {
            settings,
            timeouts: Timeouts::default(),
            channel: Mutex::new(None),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    /// The cached transport, rebuilt when the resolved settings changed.
    async fn transport(&self, cfg: &ServerConfig) -> Result<Arc<SmtpTransport>, MailError> {
        let mut slot = self.channel.lock().await;
        if let Some(ch) = slot.as_ref().filter(|ch| &ch.cfg == cfg) {
            return Ok(Arc::clone(&ch.transport));
        }

        debug!(host = %cfg.host, port = cfg.port, secure = cfg.secure, "building smtp transport");
        let transport = Arc::new(build_transport(cfg, &self.timeouts)?);
        *slot = Some(Channel { cfg: cfg.clone(), transport: Arc::clone(&transport) });
        Ok(transport)
    }

    pub async fn send(&self, msg: &OutboundMessage) -> Result<SendReceipt, MailError> {
        let cfg = self.settings.resolve()?;
        let (email, id) = build_message(msg, &cfg.user)?;
        let transport = self.transport(&cfg).await?;

        let submit = async {
            transport.send(email).await.map_err(|e| {
                if e.is_timeout() {
                    MailError::Timeout("submitting message".into())
                } else {
                    MailError::Submission(e.to_string())
                }
            })
        };
        let reply = with_deadline(self.timeouts.submit, &AbortHandle::new(), "submitting message", submit).await?;

        let response = format!("{} {}", reply.code(), reply.message().collect::<Vec<_>>().join(" "));
        info!(%id, %response, "message submitted");
        Ok(SendReceipt { id, response })
    }

    /// Attachments of `original` are not re-sent; only its text survives.
    pub async fn forward(&self, original: &Message, to: &str, extra: &str) -> Result<SendReceipt, MailError> {
        self.send(&forward_message(original, to, extra)).await
    }

    pub async fn reply(&self, original: &Message, reply_text: &str, reply_all: bool) -> Result<SendReceipt, MailError> {
        self.send(&reply_message(original, reply_text, reply_all)).await
    }
}
