//! SMTP submission plus IMAP and POP3 mailbox access behind one async API.
//!
//! Every mailbox operation opens a fresh session, runs one logical command,
//! and tears the session down before returning, on success, error or timeout
//! alike. Raw messages are normalized into [`Message`] records.

pub mod client;
pub mod config;
pub mod error;
pub mod mail;

pub use client::{ConfigUpdate, MailClient};
pub use config::{Config, ServerConfig, ServerSettings, Timeouts};
pub use error::MailError;
pub use mail::imap::MailboxNode;
pub use mail::pop3::MailboxInfo;
pub use mail::search::SearchCriteria;
pub use mail::smtp::{OutboundAttachment, OutboundMessage, SendReceipt};
pub use mail::{Ack, AttachmentInfo, Message};
