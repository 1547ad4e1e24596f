//! Sequential mailbox access (POP3).
//!
//! The wire client is blocking and speaks just enough of RFC 1939 for the
//! operations below. Every operation opens its own session; a deletion is
//! only committed once the server acknowledges QUIT.

use std::io::{BufRead, BufReader, Read, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, SettingsHandle, Timeouts};
use crate::error::MailError;
use crate::mail::normalize::{normalize, normalize_or_default};
use crate::mail::session::{
    acquire, run_blocking, with_deadline, AbortHandle, MailStream, NetDialer, Session, Teardown,
};
use crate::mail::{Ack, Message};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub number: u32,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxInfo {
    pub count: usize,
    pub messages: Vec<ListEntry>,
}

pub struct Pop3Client<S: Read + Write> {
    stream: BufReader<S>,
}

impl<S: Read + Write> Pop3Client<S> {
    pub fn new(stream: S) -> Self {
        Self { stream: BufReader::new(stream) }
    }

    pub fn read_greeting(&mut self) -> Result<String, MailError> {
        self.status("reading greeting")
    }

    /// USER/PASS. Any `-ERR` here is an authentication failure.
    pub fn login(&mut self, user: &str, password: &str) -> Result<(), MailError> {
        self.command(&format!("USER {user}"), "USER").map_err(rejected_login)?;
        self.command(&format!("PASS {password}"), "PASS").map_err(rejected_login)?;
        Ok(())
    }

    /// Returns `(message count, mailbox size in octets)`.
    pub fn stat(&mut self) -> Result<(u32, u64), MailError> {
        let reply = self.command("STAT", "STAT")?;
        let mut parts = reply.split_whitespace();
        match (
            parts.next().and_then(|c| c.parse().ok()),
            parts.next().and_then(|s| s.parse().ok()),
        ) {
            (Some(count), Some(size)) => Ok((count, size)),
            _ => Err(MailError::Protocol(format!("STAT: malformed reply {reply:?}"))),
        }
    }

    pub fn list(&mut self) -> Result<Vec<ListEntry>, MailError> {
        self.command("LIST", "LIST")?;
        let body = self.read_multiline("LIST")?;
        String::from_utf8_lossy(&body)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                let mut parts = line.split_whitespace();
                match (
                    parts.next().and_then(|n| n.parse().ok()),
                    parts.next().and_then(|s| s.parse().ok()),
                ) {
                    (Some(number), Some(size)) => Ok(ListEntry { number, size }),
                    _ => Err(MailError::Protocol(format!("LIST: malformed line {line:?}"))),
                }
            })
            .collect()
    }

    pub fn retr(&mut self, number: u32) -> Result<Vec<u8>, MailError> {
        self.command(&format!("RETR {number}"), "RETR")?;
        self.read_multiline("RETR")
    }

    pub fn dele(&mut self, number: u32) -> Result<(), MailError> {
        self.command(&format!("DELE {number}"), "DELE").map(|_| ())
    }

    pub fn quit(&mut self) -> Result<(), MailError> {
        self.command("QUIT", "QUIT").map(|_| ())
    }

    fn command(&mut self, line: &str, phase: &str) -> Result<String, MailError> {
        let writer = self.stream.get_mut();
        writer
            .write_all(format!("{line}\r\n").as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| MailError::from_io(e, phase))?;
        self.status(phase)
    }

    fn status(&mut self, phase: &str) -> Result<String, MailError> {
        let raw = self.read_line(phase)?;
        let line = String::from_utf8_lossy(&raw);
        if let Some(rest) = line.strip_prefix("+OK") {
            Ok(rest.trim().to_string())
        } else if let Some(rest) = line.strip_prefix("-ERR") {
            Err(MailError::Protocol(format!("{phase}: {}", rest.trim())))
        } else {
            Err(MailError::Protocol(format!("{phase}: unexpected reply {line:?}")))
        }
    }

    /// Line without its terminator. EOF means the server hung up.
    fn read_line(&mut self, phase: &str) -> Result<Vec<u8>, MailError> {
        let mut buf = Vec::new();
        let n = self
            .stream
            .read_until(b'\n', &mut buf)
            .map_err(|e| MailError::from_io(e, phase))?;
        if n == 0 {
            return Err(MailError::Connect(format!("{phase}: connection closed by server")));
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(buf)
    }

    /// Body of a multi-line reply, dot-unstuffed, lines joined with CRLF.
    fn read_multiline(&mut self, phase: &str) -> Result<Vec<u8>, MailError> {
        let mut out = Vec::new();
        loop {
            let line = self.read_line(phase)?;
            if line == b"." {
                return Ok(out);
            }
            out.extend_from_slice(line.strip_prefix(b".").unwrap_or(&line));
            out.extend_from_slice(b"\r\n");
        }
    }
}

fn rejected_login(err: MailError) -> MailError {
    match err {
        MailError::Protocol(msg) => MailError::Auth(msg),
        other => other,
    }
}

/// The protocol steps maildrop operations are built from.
pub trait MailDrop: Teardown + Send + 'static {
    fn count(&mut self) -> Result<u32, MailError>;
    fn listing(&mut self) -> Result<Vec<ListEntry>, MailError>;
    fn retrieve(&mut self, number: u32) -> Result<Vec<u8>, MailError>;
    fn mark_deleted(&mut self, number: u32) -> Result<(), MailError>;
}

impl<S: Read + Write> Teardown for Pop3Client<S> {
    fn quit(&mut self) -> Result<(), MailError> {
        Pop3Client::quit(self)
    }
}

impl<S: Read + Write + Send + 'static> MailDrop for Pop3Client<S> {
    fn count(&mut self) -> Result<u32, MailError> {
        self.stat().map(|(count, _)| count)
    }

    fn listing(&mut self) -> Result<Vec<ListEntry>, MailError> {
        self.list()
    }

    fn retrieve(&mut self, number: u32) -> Result<Vec<u8>, MailError> {
        self.retr(number)
    }

    fn mark_deleted(&mut self, number: u32) -> Result<(), MailError> {
        self.dele(number)
    }
}

pub trait Pop3Connector: Send + Sync + 'static {
    type Conn: MailDrop;

    fn open(&self, cfg: &ServerConfig, timeouts: &Timeouts, abort: &AbortHandle)
        -> Result<Session<Self::Conn>, MailError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NativePop3;

impl Pop3Connector for NativePop3 {
    type Conn = Pop3Client<MailStream>;

    fn open(&self, cfg: &ServerConfig, timeouts: &Timeouts, abort: &AbortHandle) -> Result<Session<Self::Conn>, MailError> {
        acquire(&NetDialer, cfg, timeouts, abort, |stream, cfg| {
            let mut client = Pop3Client::new(stream);
            client.read_greeting()?;
            client.login(&cfg.user, &cfg.password)?;
            Ok(client)
        })
    }
}

/// Maildrop operations over POP3.
pub struct Pop3Mailbox<C: Pop3Connector = NativePop3> {
    connector: Arc<C>,
    settings: SettingsHandle,
    timeouts: Timeouts,
}

impl Pop3Mailbox<NativePop3> {
    pub fn new(settings: SettingsHandle) -> Self {
        Self::with_connector(NativePop3, settings)
    }
}

impl<C: Pop3Connector> Pop3Mailbox<C> {
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

    /// Open a session on a blocking thread and hand it to `work`. The
    /// session is released when `work` drops it, unless `work` finishes it.
    async fn with_session<T, F>(&self, abort: &AbortHandle, work: F) -> Result<T, MailError>
    where
        F: FnOnce(Session<C::Conn>) -> Result<T, MailError> + Send + 'static,
        T: Send + 'static,
    {
        let cfg = self.settings.resolve()?;
        let connector = Arc::clone(&self.connector);
        let timeouts = self.timeouts;
        let abort = abort.clone();

        run_blocking(move || work(connector.open(&cfg, &timeouts, &abort)?)).await
    }

    /// The newest `limit` messages, highest ordinal first.
    ///
    /// A message the server refuses or that does not parse is skipped, so
    /// fewer than `limit` may come back. Losing the connection fails the
    /// whole call.
    pub async fn list_messages(&self, limit: usize) -> Result<Vec<Message>, MailError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let span = u32::try_from(limit).unwrap_or(u32::MAX);
        let abort = AbortHandle::new();
        let work = self.with_session(&abort, move |mut s| {
            let total = s.run(|c| c.count())?;
            if total == 0 {
                return Ok(Vec::new());
            }
            let lowest = total.saturating_sub(span - 1).max(1);
            debug!(total, lowest, "retrieving");

            let mut out = Vec::new();
            for number in (lowest..=total).rev() {
                match s.run(|c| c.retrieve(number)) {
                    Ok(raw) => match normalize(number, &raw) {
                        Ok(msg) => out.push(msg),
                        Err(err) => warn!(number, error = %err, "skipping unparseable message"),
                    },
                    Err(err) if err.is_transport() => return Err(err),
                    Err(err) => warn!(number, error = %err, "skipping message"),
                }
            }
            Ok(out)
        });

        let messages = with_deadline(self.timeouts.fetch, &abort, "listing messages", work).await?;
        info!(returned = messages.len(), "listed messages");
        Ok(messages)
    }

    /// One message by ordinal. Unparseable content comes back as the placeholder.
    pub async fn retrieve_one(&self, number: u32) -> Result<Message, MailError> {
        let abort = AbortHandle::new();
        let work = self.with_session(&abort, move |mut s| s.run(|c| c.retrieve(number)));
        let raw = with_deadline(self.timeouts.command, &abort, "retrieving message", work).await?;
        Ok(normalize_or_default(number, &raw))
    }

    /// DELE then QUIT. Succeeds only if the server acknowledged the QUIT
    /// that commits the deletion.
    pub async fn delete_message(&self, number: u32) -> Result<Ack, MailError> {
        let abort = AbortHandle::new();
        let work = self.with_session(&abort, move |mut s| {
            s.run(|c| c.mark_deleted(number))?;
            s.finish()
        });
        with_deadline(self.timeouts.command, &abort, "deleting message", work).await?;
        info!(number, "deleted");
        Ok(Ack::with_message("message deleted"))
    }

    pub async fn mailbox_info(&self) -> Result<MailboxInfo, MailError> {
        let abort = AbortHandle::new();
        let work = self.with_session(&abort, |mut s| s.run(|c| c.listing()));
        let messages = with_deadline(self.timeouts.command, &abort, "listing maildrop", work).await?;
        Ok(MailboxInfo { count: messages.len(), messages })
    }
}
