//! Stateful mailbox access (IMAP).
//!
//! Every call opens its own session, does one thing and logs out. Sequence
//! numbers in returned messages are only valid against the mailbox state the
//! listing saw; they are not stable handles.

use std::sync::Arc;

use imap::types::NameAttribute;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ServerConfig, SettingsHandle, Timeouts};
use crate::error::MailError;
use crate::mail::normalize::normalize_batch;
use crate::mail::search::SearchCriteria;
use crate::mail::session::{
    acquire, run_blocking, with_deadline, AbortHandle, MailStream, NetDialer, Session, Teardown,
};
use crate::mail::{sort_newest_first, Ack, Message, RawMessage};

pub const INBOX: &str = "INBOX";

/// Listings fetch this many times the requested count, because position in
/// the mailbox says little about the Date header.
pub const OVERFETCH: usize = 5;

const FETCH_QUERY: &str = "BODY.PEEK[]";

/// One flat LIST result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxEntry {
    pub path: String,
    pub delimiter: Option<String>,
    pub attributes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxNode {
    pub name: String,
    pub path: String,
    pub delimiter: Option<String>,
    pub attributes: Vec<String>,
    pub children: Vec<MailboxNode>,
}

/// Fold flat LIST paths into a hierarchy. Parents that were not listed
/// themselves are created with no attributes.
pub fn build_tree(entries: Vec<MailboxEntry>) -> Vec<MailboxNode> {
    let mut roots = Vec::new();
    for entry in &entries {
        let segments: Vec<&str> = match entry.delimiter.as_deref() {
            Some(d) if !d.is_empty() => entry.path.split(d).collect(),
            _ => vec![entry.path.as_str()],
        };
        insert_node(&mut roots, &segments, 0, entry);
    }
    roots
}

fn insert_node(level: &mut Vec<MailboxNode>, segments: &[&str], depth: usize, entry: &MailboxEntry) {
    let name = segments[depth];
    let idx = match level.iter().position(|n| n.name == name) {
        Some(idx) => idx,
        None => {
            let delim = entry.delimiter.clone().unwrap_or_default();
            level.push(MailboxNode {
                name: name.to_string(),
                path: segments[..=depth].join(&delim),
                delimiter: entry.delimiter.clone(),
                attributes: Vec::new(),
                children: Vec::new(),
            });
            level.len() - 1
        }
    };

    let node = &mut level[idx];
    if depth + 1 == segments.len() {
        node.path = entry.path.clone();
        node.attributes = entry.attributes.clone();
    } else {
        insert_node(&mut node.children, segments, depth + 1, entry);
    }
}

/// Sequence range for a listing: the last `min(total, limit * OVERFETCH)` positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: u32,
    pub end: u32,
}

impl FetchWindow {
    pub fn new(total: u32, limit: usize) -> Option<Self> {
        if total == 0 || limit == 0 {
            return None;
        }
        let wanted = limit.saturating_mul(OVERFETCH);
        let count = (total as usize).min(wanted) as u32;
        let start = total.saturating_sub(count).saturating_add(1).max(1);
        Some(Self { start, end: total })
    }

    pub fn sequence_set(&self) -> String {
        format!("{}:{}", self.start, self.end)
    }
}

fn sequence_list(ids: &[u32]) -> String {
    ids.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

/// The protocol steps mailbox operations are built from.
pub trait ImapConnection: Teardown + Send + 'static {
    fn mailbox_entries(&mut self) -> Result<Vec<MailboxEntry>, MailError>;
    /// Read-only open; returns the message count.
    fn examine_mailbox(&mut self, mailbox: &str) -> Result<u32, MailError>;
    /// Read-write open; returns the message count.
    fn select_mailbox(&mut self, mailbox: &str) -> Result<u32, MailError>;
    fn fetch_bodies(&mut self, sequence_set: &str) -> Result<Vec<RawMessage>, MailError>;
    fn search_ids(&mut self, query: &str) -> Result<Vec<u32>, MailError>;
    fn add_flags(&mut self, sequence_set: &str, flags: &str) -> Result<(), MailError>;
    fn expunge_deleted(&mut self) -> Result<(), MailError>;
}

/// Opens authenticated sessions.
pub trait ImapConnector: Send + Sync + 'static {
    type Conn: ImapConnection;

    fn open(&self, cfg: &ServerConfig, timeouts: &Timeouts, abort: &AbortHandle)
        -> Result<Session<Self::Conn>, MailError>;
}

pub type NativeSession = imap::Session<MailStream>;

/// The real thing: TCP/TLS through [`NetDialer`], then greeting and LOGIN.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeImap;

fn login(stream: MailStream, cfg: &ServerConfig) -> Result<NativeSession, MailError> {
    let mut client = imap::Client::new(stream);
    client
        .read_greeting()
        .map_err(|e| MailError::from_imap(e, "reading greeting"))?;

    client
        .login(&cfg.user, &cfg.password)
        .map_err(|(err, _client)| match err {
            imap::Error::No(msg) | imap::Error::Bad(msg) => MailError::Auth(msg.trim().to_string()),
            other => MailError::from_imap(other, "logging in"),
        })
}

impl ImapConnector for NativeImap {
    type Conn = NativeSession;

    fn open(&self, cfg: &ServerConfig, timeouts: &Timeouts, abort: &AbortHandle) -> Result<Session<NativeSession>, MailError> {
        acquire(&NetDialer, cfg, timeouts, abort, login)
    }
}

#[allow(unreachable_patterns)]
fn attribute_name(attr: &NameAttribute<'_>) -> String {
    match attr {
        NameAttribute::NoInferiors => "\\Noinferiors".to_string(),
        NameAttribute::NoSelect => "\\Noselect".to_string(),
        NameAttribute::Marked => "\\Marked".to_string(),
        NameAttribute::Unmarked => "\\Unmarked".to_string(),
        NameAttribute::Custom(s) => s.to_string(),
        other => format!("{other:?}"),
    }
}

impl Teardown for NativeSession {
    fn quit(&mut self) -> Result<(), MailError> {
        self.logout().map_err(|e| MailError::from_imap(e, "LOGOUT"))
    }
}

impl ImapConnection for NativeSession {
    fn mailbox_entries(&mut self) -> Result<Vec<MailboxEntry>, MailError> {
        let names = self
            .list(Some(""), Some("*"))
            .map_err(|e| MailError::from_imap(e, "LIST"))?;
        Ok(names
            .iter()
            .map(|n| MailboxEntry {
                path: n.name().to_string(),
                delimiter: n.delimiter().map(str::to_string),
                attributes: n.attributes().iter().map(attribute_name).collect(),
            })
            .collect())
    }

    fn examine_mailbox(&mut self, mailbox: &str) -> Result<u32, MailError> {
        self.examine(mailbox)
            .map(|m| m.exists)
            .map_err(|e| MailError::from_imap(e, "EXAMINE"))
    }

    fn select_mailbox(&mut self, mailbox: &str) -> Result<u32, MailError> {
        self.select(mailbox)
            .map(|m| m.exists)
            .map_err(|e| MailError::from_imap(e, "SELECT"))
    }

    fn fetch_bodies(&mut self, sequence_set: &str) -> Result<Vec<RawMessage>, MailError> {
        let fetches = self
            .fetch(sequence_set, FETCH_QUERY)
            .map_err(|e| MailError::from_imap(e, "FETCH"))?;
        Ok(fetches
            .iter()
            .map(|f| RawMessage {
                id: f.message,
                bytes: f.body().map(<[u8]>::to_vec).unwrap_or_default(),
            })
            .collect())
    }

    fn search_ids(&mut self, query: &str) -> Result<Vec<u32>, MailError> {
        let mut ids: Vec<u32> = self
            .search(query)
            .map_err(|e| MailError::from_imap(e, "SEARCH"))?
            .into_iter()
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn add_flags(&mut self, sequence_set: &str, flags: &str) -> Result<(), MailError> {
        self.store(sequence_set, format!("+FLAGS.SILENT ({flags})"))
            .map(|_| ())
            .map_err(|e| MailError::from_imap(e, "STORE"))
    }

    fn expunge_deleted(&mut self) -> Result<(), MailError> {
        self.expunge()
            .map(|_| ())
            .map_err(|e| MailError::from_imap(e, "EXPUNGE"))
    }
}

/// Mailbox operations over IMAP.
pub struct ImapMailbox<C: ImapConnector = NativeImap> {
    connector: Arc<C>,
    settings: SettingsHandle,
    timeouts: Timeouts,
}

impl ImapMailbox<NativeImap> {
    pub fn new(settings: SettingsHandle) -> Self {
        Self::with_connector(NativeImap, settings)
    }
}

impl<C: ImapConnector> ImapMailbox<C> {
    pub fn with_connector(connector: C, settings: SettingsHandle) -> Self {
        Self {
            connector: Arc::new(connector),
            settings,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    /// Open a session on a blocking thread, run `work`, release.
    async fn run_session<T, F>(&self, abort: &AbortHandle, work: F) -> Result<T, MailError>
    where
        F: FnOnce(&mut Session<C::Conn>) -> Result<T, MailError> + Send + 'static,
        T: Send + 'static,
    {
        let cfg = self.settings.resolve()?;
        let connector = Arc::clone(&self.connector);
        let timeouts = self.timeouts;
        let abort = abort.clone();

        run_blocking(move || {
            let mut session = connector.open(&cfg, &timeouts, &abort)?;
            let out = work(&mut session);
            session.release();
            out
        })
        .await
    }

    pub async fn list_mailboxes(&self) -> Result<Vec<MailboxNode>, MailError> {
        let abort = AbortHandle::new();
        let entries = with_deadline(
            self.timeouts.command,
            &abort,
            "listing mailboxes",
            self.run_session(&abort, |s| s.run(|c| c.mailbox_entries())),
        )
        .await?;
        Ok(build_tree(entries))
    }

    /// The `limit` most recent messages of `mailbox`, newest first.
    pub async fn list_messages(&self, mailbox: &str, limit: usize) -> Result<Vec<Message>, MailError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mailbox = mailbox.to_string();
        let abort = AbortHandle::new();
        let pipeline = async {
            let raw = self
                .run_session(&abort, move |s| {
                    let total = s.run(|c| c.examine_mailbox(&mailbox))?;
                    let Some(window) = FetchWindow::new(total, limit) else {
                        debug!(%mailbox, "mailbox is empty");
                        return Ok(Vec::new());
                    };
                    debug!(%mailbox, total, start = window.start, end = window.end, "fetching window");
                    s.run(|c| c.fetch_bodies(&window.sequence_set()))
                })
                .await?;

            let fetched = raw.len();
            let mut messages = normalize_batch(raw).await;
            sort_newest_first(&mut messages);
            messages.truncate(limit);
            info!(fetched, returned = messages.len(), "listed messages");
            Ok(messages)
        };

        with_deadline(self.timeouts.fetch, &abort, "listing messages", pipeline).await
    }

    /// Messages in INBOX matching `criteria`, newest first.
    pub async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<Message>, MailError> {
        let query = criteria.to_query();
        let abort = AbortHandle::new();
        let pipeline = async {
            let raw = self
                .run_session(&abort, move |s| {
                    s.run(|c| c.examine_mailbox(INBOX))?;
                    let ids = s.run(|c| c.search_ids(&query))?;
                    debug!(%query, matches = ids.len(), "search finished");
                    if ids.is_empty() {
                        return Ok(Vec::new());
                    }
                    s.run(|c| c.fetch_bodies(&sequence_list(&ids)))
                })
                .await?;

            let mut messages = normalize_batch(raw).await;
            sort_newest_first(&mut messages);
            Ok(messages)
        };

        with_deadline(self.timeouts.fetch, &abort, "searching", pipeline).await
    }

    pub async fn mark_read(&self, id: u32) -> Result<Ack, MailError> {
        let abort = AbortHandle::new();
        let work = self.run_session(&abort, move |s| {
            s.run(|c| c.select_mailbox(INBOX))?;
            s.run(|c| c.add_flags(&id.to_string(), "\\Seen"))
        });
        with_deadline(self.timeouts.command, &abort, "marking message read", work).await?;
        info!(id, "marked read");
        Ok(Ack::ok())
    }

    /// Flag then expunge. A failure after the flag step leaves the outcome
    /// indeterminate; retrying is safe because re-flagging is a no-op.
    pub async fn delete_message(&self, id: u32) -> Result<Ack, MailError> {
        let abort = AbortHandle::new();
        let work = self.run_session(&abort, move |s| {
            s.run(|c| c.select_mailbox(INBOX))?;
            s.run(|c| c.add_flags(&id.to_string(), "\\Deleted"))?;
            s.run(|c| c.expunge_deleted())
        });
        with_deadline(self.timeouts.command, &abort, "deleting message", work).await?;
        info!(id, "deleted");
        Ok(Ack::with_message("message deleted"))
    }
}
