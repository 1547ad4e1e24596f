//! One connection, one operation, always torn down.
//!
//! A [`Session`] owns the protocol connection together with a [`Link`], a
//! second handle onto the same socket that can close it from any thread.
//! Dropping a session releases it. The async callers arm an [`AbortHandle`]
//! with the link so an expired deadline can cut the socket out from under the
//! blocking protocol thread before the timeout error is returned.

use std::future::Future;
use std::io::{self, Read, Write};
use std::net::{self, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use native_tls::{HandshakeError, TlsConnector, TlsStream};
use tracing::{debug, warn};

use crate::config::{ServerConfig, Timeouts};
use crate::error::MailError;

/// Something that can be forcibly closed while another thread is blocked on it.
pub trait Socket: Send + Sync {
    fn close(&self);
}

impl Socket for TcpStream {
    fn close(&self) {
        let _ = self.shutdown(net::Shutdown::Both);
    }
}

#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

struct LinkInner {
    socket: Box<dyn Socket>,
    closed: AtomicBool,
}

impl Link {
    pub fn new(socket: impl Socket + 'static) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                socket: Box::new(socket),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.socket.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// Lets the deadline owner close a session it does not hold.
#[derive(Clone, Default)]
pub struct AbortHandle {
    state: Arc<Mutex<AbortState>>,
}

#[derive(Default)]
struct AbortState {
    link: Option<Link>,
    fired: bool,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the socket to close on abort. Closes it at once if the
    /// deadline already passed.
    pub fn arm(&self, link: &Link) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.fired {
            link.close();
        } else {
            state.link = Some(link.clone());
        }
    }

    pub fn fire(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.fired = true;
        if let Some(link) = state.link.take() {
            link.close();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).fired
    }
}

/// The protocol-level goodbye (IMAP LOGOUT, POP3 QUIT).
pub trait Teardown {
    fn quit(&mut self) -> Result<(), MailError>;
}

pub struct Session<C: Teardown> {
    conn: C,
    link: Link,
    released: bool,
}

impl<C: Teardown> Session<C> {
    pub fn new(conn: C, link: Link) -> Self {
        Self { conn, link, released: false }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Run one protocol step. A transport failure closes the socket right
    /// away so the later release does not try to say goodbye over it.
    pub fn run<T>(&mut self, op: impl FnOnce(&mut C) -> Result<T, MailError>) -> Result<T, MailError> {
        if self.released || self.link.is_closed() {
            return Err(MailError::Connect("session already closed".into()));
        }
        let out = op(&mut self.conn);
        if let Err(err) = &out {
            if err.is_transport() {
                self.link.close();
            }
        }
        out
    }

    /// Idempotent and infallible; also runs on drop.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if !self.link.is_closed() {
            if let Err(err) = self.conn.quit() {
                debug!(error = %err, "goodbye failed during release");
            }
        }
        self.link.close();
    }

    /// Like [`Session::release`] but the goodbye must be acknowledged.
    pub fn finish(mut self) -> Result<(), MailError> {
        self.released = true;
        let out = if self.link.is_closed() {
            Err(MailError::Connect("session closed before goodbye".into()))
        } else {
            self.conn.quit()
        };
        self.link.close();
        out
    }
}

impl<C: Teardown> Drop for Session<C> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Opens the transport for a session.
pub trait Dialer: Send + Sync {
    type Stream: Read + Write + Send + 'static;

    /// On error nothing is left open.
    fn dial(&self, cfg: &ServerConfig, timeouts: &Timeouts) -> Result<(Self::Stream, Link), MailError>;
}

/// Connect, then run `handshake` (greeting + login) over the new stream.
///
/// If this returns an error, the socket has already been closed.
pub fn acquire<D, C, H>(
    dialer: &D,
    cfg: &ServerConfig,
    timeouts: &Timeouts,
    abort: &AbortHandle,
    handshake: H,
) -> Result<Session<C>, MailError>
where
    D: Dialer + ?Sized,
    C: Teardown,
    H: FnOnce(D::Stream, &ServerConfig) -> Result<C, MailError>,
{
    let (stream, link) = dialer.dial(cfg, timeouts)?;
    abort.arm(&link);
    let watchdog = match AuthWatchdog::start(&link, timeouts.auth) {
        Ok(watchdog) => watchdog,
        Err(err) => {
            link.close();
            return Err(err);
        }
    };

    let out = handshake(stream, cfg);
    if !watchdog.disarm() {
        link.close();
        warn!(host = %cfg.host, limit = ?timeouts.auth, "greeting and login overran, session closed");
        return Err(MailError::Timeout("authenticating".into()));
    }

    match out {
        Ok(conn) if !link.is_closed() => {
            debug!(host = %cfg.host, port = cfg.port, user = %cfg.user, "session established");
            Ok(Session::new(conn, link))
        }
        Ok(_) => Err(MailError::Timeout("authenticating".into())),
        Err(err) => {
            link.close();
            debug!(host = %cfg.host, error = %err, "session setup failed");
            Err(err)
        }
    }
}

const WATCHING: u8 = 0;
const DISARMED: u8 = 1;
const EXPIRED: u8 = 2;

/// Bounds greeting plus login as a whole. Socket timeouts only bound each
/// read, so a server trickling bytes would otherwise never trip them.
struct AuthWatchdog {
    state: Arc<AtomicU8>,
    _wake: mpsc::Sender<()>,
}

impl AuthWatchdog {
    fn start(link: &Link, limit: Duration) -> Result<Self, MailError> {
        let state = Arc::new(AtomicU8::new(WATCHING));
        let (wake, sleep) = mpsc::channel::<()>();
        let link = link.clone();
        let watched = state.clone();
        thread::Builder::new()
            .name("auth-watchdog".into())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = sleep.recv_timeout(limit) {
                    if watched
                        .compare_exchange(WATCHING, EXPIRED, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        link.close();
                    }
                }
            })
            .map_err(|e| MailError::Task(format!("starting auth watchdog: {e}")))?;
        Ok(Self { state, _wake: wake })
    }

    /// False when the limit ran out first. Dropping the sender wakes the thread.
    fn disarm(self) -> bool {
        self.state
            .compare_exchange(WATCHING, DISARMED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Try `addrs` in order until one answers. All attempts share `limit`.
fn first_within<T>(
    addrs: &[SocketAddr],
    limit: Duration,
    phase: &str,
    mut attempt: impl FnMut(&SocketAddr, Duration) -> io::Result<T>,
) -> Result<T, MailError> {
    let deadline = Instant::now() + limit;
    let mut last_err = None;
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(MailError::Timeout(phase.to_string()));
        }
        match attempt(addr, remaining) {
            Ok(out) => return Ok(out),
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) => MailError::from_io(e, phase),
        None => MailError::Connect(format!("{phase}: no addresses")),
    })
}

#[derive(Debug)]
pub enum MailStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Read for MailStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            MailStream::Plain(s) => s.read(buf),
            MailStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for MailStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            MailStream::Plain(s) => s.write(buf),
            MailStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            MailStream::Plain(s) => s.flush(),
            MailStream::Tls(s) => s.flush(),
        }
    }
}

/// Certificate and hostname checks are switched off on purpose: the servers
/// this talks to are frequently self-signed or long out of date. This trades
/// away protection against an active man-in-the-middle.
pub fn relaxed_tls_connector() -> Result<TlsConnector, MailError> {
    TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| MailError::Connect(format!("tls setup: {e}")))
}

/// TCP (optionally implicit TLS) with connect and handshake deadlines.
#[derive(Clone, Copy, Debug, Default)]
pub struct NetDialer;

impl NetDialer {
    fn connect_tcp(cfg: &ServerConfig, limit: Duration) -> Result<TcpStream, MailError> {
        let phase = format!("connecting to {}:{}", cfg.host, cfg.port);
        let addrs: Vec<SocketAddr> = (cfg.host.as_str(), cfg.port)
            .to_socket_addrs()
            .map_err(|e| MailError::Connect(format!("resolving {}: {e}", cfg.host)))?
            .collect();
        if addrs.is_empty() {
            return Err(MailError::Connect(format!("{} resolved to no addresses", cfg.host)));
        }
        first_within(&addrs, limit, &phase, TcpStream::connect_timeout)
    }

    fn wrap(cfg: &ServerConfig, tcp: TcpStream, timeouts: &Timeouts) -> Result<MailStream, MailError> {
        // Every read and write during greeting and login is bounded by the auth deadline.
        tcp.set_read_timeout(Some(timeouts.auth))
            .and_then(|_| tcp.set_write_timeout(Some(timeouts.auth)))
            .map_err(|e| MailError::from_io(e, "configuring socket"))?;

        if !cfg.secure {
            return Ok(MailStream::Plain(tcp));
        }

        match relaxed_tls_connector()?.connect(&cfg.host, tcp) {
            Ok(tls) => Ok(MailStream::Tls(Box::new(tls))),
            Err(HandshakeError::Failure(e)) => Err(MailError::Connect(format!("tls handshake: {e}"))),
            Err(HandshakeError::WouldBlock(_)) => Err(MailError::Timeout("tls handshake".into())),
        }
    }
}

impl Dialer for NetDialer {
    type Stream = MailStream;

    fn dial(&self, cfg: &ServerConfig, timeouts: &Timeouts) -> Result<(MailStream, Link), MailError> {
        let tcp = Self::connect_tcp(cfg, timeouts.connect)?;
        let link = Link::new(
            tcp.try_clone()
                .map_err(|e| MailError::from_io(e, "cloning socket"))?,
        );
        match Self::wrap(cfg, tcp, timeouts) {
            Ok(stream) => Ok((stream, link)),
            Err(err) => {
                link.close();
                Err(err)
            }
        }
    }
}

pub async fn run_blocking<T, F>(work: F) -> Result<T, MailError>
where
    F: FnOnce() -> Result<T, MailError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| MailError::Task(e.to_string()))?
}

/// Bound `work` by `limit`. On expiry the armed socket is closed before the
/// timeout error is returned.
pub async fn with_deadline<T, F>(limit: Duration, abort: &AbortHandle, phase: &str, work: F) -> Result<T, MailError>
where
    F: Future<Output = Result<T, MailError>>,
{
    match tokio::time::timeout(limit, work).await {
        Ok(out) => out,
        Err(_) => {
            abort.fire();
            warn!(phase, ?limit, "deadline expired, session closed");
            Err(MailError::Timeout(phase.to_string()))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts how many fake sockets were opened and closed.
    #[derive(Clone, Default)]
    pub struct SocketLedger {
        pub opened: Arc<AtomicUsize>,
        pub closed: Arc<AtomicUsize>,
    }

    impl SocketLedger {
        pub fn link(&self) -> (Link, FakeSocket) {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let socket = FakeSocket {
                ledger: self.clone(),
                dead: Arc::new(AtomicBool::new(false)),
            };
            (Link::new(socket.clone()), socket)
        }

        pub fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        pub fn closed(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[derive(Clone)]
    pub struct FakeSocket {
        ledger: SocketLedger,
        dead: Arc<AtomicBool>,
    }

    impl FakeSocket {
        pub fn is_dead(&self) -> bool {
            self.dead.load(Ordering::SeqCst)
        }

        /// Block like a read that never gets an answer, until closed.
        pub fn hang(&self) -> MailError {
            while !self.is_dead() {
                std::thread::sleep(Duration::from_millis(5));
            }
            MailError::from_io(io::Error::new(io::ErrorKind::NotConnected, "socket closed"), "reading reply")
        }
    }

    impl Socket for FakeSocket {
        fn close(&self) {
            self.dead.store(true, Ordering::SeqCst);
            self.ledger.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;

    struct FakeConn {
        quits: Arc<AtomicUsize>,
        quit_fails: bool,
    }

    impl Teardown for FakeConn {
        fn quit(&mut self) -> Result<(), MailError> {
            self.quits.fetch_add(1, Ordering::SeqCst);
            if self.quit_fails {
                Err(MailError::Protocol("QUIT: -ERR some deletes not removed".into()))
            } else {
                Ok(())
            }
        }
    }

    fn conn(quit_fails: bool) -> (FakeConn, Arc<AtomicUsize>) {
        let quits = Arc::new(AtomicUsize::new(0));
        (FakeConn { quits: quits.clone(), quit_fails }, quits)
    }

    struct FakeDialer {
        ledger: SocketLedger,
        refuse: bool,
    }

    impl Dialer for FakeDialer {
        type Stream = Cursor<Vec<u8>>;

        fn dial(&self, _cfg: &ServerConfig, _t: &Timeouts) -> Result<(Self::Stream, Link), MailError> {
            if self.refuse {
                return Err(MailError::Connect("connection refused".into()));
            }
            let (link, _) = self.ledger.link();
            Ok((Cursor::new(b"+OK ready\r\n".to_vec()), link))
        }
    }

    fn cfg() -> ServerConfig {
        ServerConfig {
            host: "mail.invalid".into(),
            port: 110,
            user: "u".into(),
            password: "p".into(),
            secure: false,
        }
    }

    #[test]
    fn link_closes_once() {
        let ledger = SocketLedger::default();
        let (link, socket) = ledger.link();
        link.close();
        link.clone().close();
        assert!(link.is_closed());
        assert!(socket.is_dead());
        assert_eq!(ledger.closed(), 1);
    }

    #[test]
    fn abort_before_arm_closes_on_arm() {
        let ledger = SocketLedger::default();
        let (link, _) = ledger.link();
        let abort = AbortHandle::new();
        abort.fire();
        abort.arm(&link);
        assert!(link.is_closed());
        assert!(abort.is_fired());
    }

    #[test]
    fn release_is_idempotent() {
        let ledger = SocketLedger::default();
        let (link, _) = ledger.link();
        let (c, quits) = conn(false);
        let mut session = Session::new(c, link);
        session.release();
        session.release();
        drop(session);
        assert_eq!(quits.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.closed(), 1);
    }

    #[test]
    fn drop_releases() {
        let ledger = SocketLedger::default();
        let (link, _) = ledger.link();
        let (c, quits) = conn(false);
        drop(Session::new(c, link));
        assert_eq!(quits.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.closed(), 1);
    }

    #[test]
    fn transport_error_skips_goodbye() {
        let ledger = SocketLedger::default();
        let (link, _) = ledger.link();
        let (c, quits) = conn(false);
        let mut session = Session::new(c, link);
        let res: Result<(), _> = session.run(|_| Err(MailError::Timeout("reading reply".into())));
        assert!(res.is_err());
        assert!(session.link().is_closed());
        drop(session);
        assert_eq!(quits.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.closed(), 1);
    }

    #[test]
    fn protocol_error_keeps_session_usable() {
        let ledger = SocketLedger::default();
        let (link, _) = ledger.link();
        let (c, quits) = conn(false);
        let mut session = Session::new(c, link);
        let res: Result<(), _> = session.run(|_| Err(MailError::Protocol("NO".into())));
        assert!(res.is_err());
        assert!(!session.link().is_closed());
        assert_eq!(session.run(|_| Ok(7)).unwrap(), 7);
        drop(session);
        assert_eq!(quits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finish_reports_goodbye_failure() {
        let ledger = SocketLedger::default();
        let (link, _) = ledger.link();
        let (c, quits) = conn(true);
        let err = Session::new(c, link).finish().unwrap_err();
        assert!(matches!(err, MailError::Protocol(_)));
        assert_eq!(quits.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.closed(), 1);
    }

    #[test]
    fn failed_handshake_closes_before_returning() {
        let ledger = SocketLedger::default();
        let dialer = FakeDialer { ledger: ledger.clone(), refuse: false };
        let res = acquire(&dialer, &cfg(), &Timeouts::default(), &AbortHandle::new(), |_stream, _cfg| {
            Err::<FakeConn, _>(MailError::Auth("-ERR invalid password".into()))
        });
        assert!(matches!(res, Err(MailError::Auth(_))));
        assert_eq!(ledger.opened(), 1);
        assert_eq!(ledger.closed(), 1);
    }

    #[test]
    fn failed_dial_leaves_nothing_open() {
        let ledger = SocketLedger::default();
        let dialer = FakeDialer { ledger: ledger.clone(), refuse: true };
        let res = acquire(&dialer, &cfg(), &Timeouts::default(), &AbortHandle::new(), |_stream, _cfg| {
            Ok(conn(false).0)
        });
        assert!(matches!(res, Err(MailError::Connect(_))));
        assert_eq!(ledger.opened(), 0);
        assert_eq!(ledger.closed(), 0);
    }

    #[test]
    fn successful_acquire_arms_abort() {
        let ledger = SocketLedger::default();
        let dialer = FakeDialer { ledger: ledger.clone(), refuse: false };
        let abort = AbortHandle::new();
        let mut greeting = String::new();
        let session = acquire(&dialer, &cfg(), &Timeouts::default(), &abort, |mut stream, _cfg| {
            stream.read_to_string(&mut greeting).map_err(|e| MailError::from_io(e, "greeting"))?;
            Ok(conn(false).0)
        })
        .unwrap();
        assert_eq!(greeting, "+OK ready\r\n");
        abort.fire();
        assert!(session.link().is_closed());
        assert_eq!(ledger.closed(), 1);
    }

    #[test]
    fn refused_tcp_connect_is_connect_error() {
        let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut cfg = cfg();
        cfg.host = "127.0.0.1".into();
        cfg.port = port;
        let err = NetDialer.dial(&cfg, &Timeouts::default()).unwrap_err();
        assert!(matches!(err, MailError::Connect(_)), "{err}");
    }

    #[test]
    fn connect_attempts_share_one_budget() {
        let addrs: Vec<SocketAddr> = ["127.0.0.1:25", "127.0.0.2:25", "127.0.0.3:25"]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect();
        let limit = Duration::from_millis(200);
        let mut budgets = Vec::new();

        let started = Instant::now();
        let res: Result<(), _> = first_within(&addrs, limit, "connecting", |_addr, budget| {
            let nap = if budgets.is_empty() { budget / 2 } else { budget };
            budgets.push(budget);
            std::thread::sleep(nap);
            Err(io::Error::new(io::ErrorKind::TimedOut, "no answer"))
        });
        let elapsed = started.elapsed();

        assert!(matches!(res, Err(MailError::Timeout(ref p)) if p == "connecting"));
        assert_eq!(budgets.len(), 2);
        assert!(budgets[0] <= limit);
        assert!(budgets[1] <= limit / 2, "{budgets:?}");
        assert!(elapsed < Duration::from_millis(350), "{elapsed:?}");
    }

    #[test]
    fn first_answering_address_wins() {
        let addrs: Vec<SocketAddr> = vec!["127.0.0.1:25".parse().unwrap(), "127.0.0.2:25".parse().unwrap()];
        let res = first_within(&addrs, Duration::from_secs(1), "connecting", |addr, _| {
            if addr.ip().to_string() == "127.0.0.1" {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            } else {
                Ok(addr.port())
            }
        });
        assert_eq!(res.unwrap(), 25);
    }

    #[test]
    fn trickling_greeting_trips_the_auth_limit() {
        let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let greeting = format!("+OK {}\r\n", "x".repeat(200));
            for byte in greeting.as_bytes() {
                if sock.write_all(std::slice::from_ref(byte)).is_err() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        });

        let mut cfg = cfg();
        cfg.host = "127.0.0.1".into();
        cfg.port = port;
        let timeouts = Timeouts { auth: Duration::from_millis(250), ..Timeouts::default() };

        let started = Instant::now();
        let res = acquire(&NetDialer, &cfg, &timeouts, &AbortHandle::new(), |mut stream, _cfg| {
            let mut byte = [0u8; 1];
            loop {
                match stream.read(&mut byte) {
                    Ok(0) => return Err(MailError::Connect("closed during greeting".into())),
                    Ok(_) if byte[0] == b'\n' => return Ok(conn(false).0),
                    Ok(_) => {}
                    Err(e) => return Err(MailError::from_io(e, "reading greeting")),
                }
            }
        });

        assert!(matches!(res, Err(MailError::Timeout(ref p)) if p == "authenticating"), "{:?}", res.err());
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[test]
    fn prompt_handshake_is_not_cut_off() {
        let ledger = SocketLedger::default();
        let dialer = FakeDialer { ledger: ledger.clone(), refuse: false };
        let timeouts = Timeouts { auth: Duration::from_millis(50), ..Timeouts::default() };
        let session = acquire(&dialer, &cfg(), &timeouts, &AbortHandle::new(), |_stream, _cfg| Ok(conn(false).0))
            .unwrap();
        std::thread::sleep(Duration::from_millis(120));
        assert!(!session.link().is_closed());
        assert_eq!(ledger.closed(), 0);
    }

    #[tokio::test]
    async fn deadline_closes_socket_before_erroring() {
        let ledger = SocketLedger::default();
        let (link, socket) = ledger.link();
        let abort = AbortHandle::new();
        abort.arm(&link);

        let res: Result<(), _> = with_deadline(
            Duration::from_millis(20),
            &abort,
            "listing messages",
            std::future::pending(),
        )
        .await;

        assert!(matches!(res, Err(MailError::Timeout(ref p)) if p == "listing messages"));
        assert!(socket.is_dead());
        assert_eq!(ledger.closed(), 1);
    }

    #[tokio::test]
    async fn blocking_panic_becomes_task_error() {
        let res: Result<(), _> = run_blocking(|| panic!("boom")).await;
        assert!(matches!(res, Err(MailError::Task(_))));
    }
}
