//! The socket core: callback pipelines, the TLS handshake driver, clean
//! shutdown, and live-session migration.
//!
//! A [`Socket`] is created by an event loop and driven from two edges: the
//! loop delivers transport events through [`Socket::notify_read`] and
//! [`Socket::notify_write_done`], and the owner calls the public
//! operations. Control flow is a set of state machines — the pending
//! continuation for each direction is an explicit waiter state, never a
//! nested closure:
//!
//! ```text
//! read waiter:   User ──▶ Invoking ──▶ User        (steady state)
//!                Handshake ──▶ (driver)            (handshake flight)
//!                Shutdown ──▶ (close_notify wait)
//!
//! write waiter:  User / HandshakeProceed / HandshakeComplete /
//!                ShutdownContinue / ShutdownDispose / DisposeOnSettle
//! ```
//!
//! Scheduling is single-threaded and cooperative: every callback runs to
//! completion, and a socket suspends only at read-wait, write-wait, or
//! resumption-wait.

use std::sync::Arc;

use bytes::Bytes;

use crate::addr::PeerAddress;
use crate::backend::{Backend, TransportHandle};
use crate::buffer::{BufferPrototype, ByteQueue};
use crate::context::{ContextError, SslContext};
use crate::engine::{
    CipherKind, HandshakeStatus, ReadStatus, ShutdownStatus, VerifyFailure, WriteStatus,
};
use crate::error::{CallbackResult, SocketError};
use crate::governor::{LatencyOptimizer, TcpSnapshot, TransportProbe};
use crate::resumption;
use crate::session::{HandshakeRole, ResumptionCell, ResumptionPhase, SessionIo, SslState};
use crate::tracing_compat::{debug, trace};
use crate::verify::{validate_hostname, HostnameMatch};

/// Bytes reserved in the application input per decode step.
const INPUT_RESERVE: usize = 4096;

/// Largest first input retained for async-resumption replay.
const MAX_REPLAY_INPUT: usize = 1024;

/// A read, write, or handshake completion callback.
pub type SocketCallback = Box<dyn FnMut(&mut Socket, CallbackResult) + Send>;

/// Hook invoked once when the socket is disposed.
pub type CloseHook = Box<dyn FnOnce() + Send>;

/// A transport event delivered by the owning loop.
#[derive(Debug)]
pub enum ReadEvent<'a> {
    /// Bytes arrived from the peer.
    Data(&'a [u8]),
    /// The peer closed its write side.
    Eof,
    /// The transport failed.
    Error(SocketError),
}

enum ReadWaiter {
    /// The user's read callback is armed.
    User(SocketCallback),
    /// The user callback is currently running; it may re-arm or stop.
    Invoking,
    /// Incoming bytes resume the handshake driver.
    Handshake,
    /// Incoming bytes resume the shutdown driver.
    Shutdown,
}

enum WriteWaiter {
    User(SocketCallback),
    /// A handshake flight is in the air; completion re-enters the driver.
    HandshakeProceed,
    /// The final flight is in the air; completion finishes the handshake.
    HandshakeComplete,
    /// A shutdown flight is in the air; completion re-enters shutdown.
    ShutdownContinue,
    /// A shutdown flight is in the air; completion disposes.
    ShutdownDispose,
    /// `close` cancelled the pending write; dispose when it settles.
    DisposeOnSettle,
}

/// Why an export was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportError {
    /// A write is in flight.
    WriteInFlight,
    /// The handshake has not completed.
    HandshakeInFlight,
    /// The backend cannot detach this transport.
    Unsupported,
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::WriteInFlight => "export refused: write in flight",
            Self::HandshakeInFlight => "export refused: handshake in flight",
            Self::Unsupported => "export refused: transport cannot be detached",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ExportError {}

/// A detached socket: transport handle, input buffer, and TLS session.
///
/// Buffers are re-parented to the non-pooling prototype on export so the
/// record can cross threads; import re-parents them to the importing
/// thread's pooling prototype.
pub struct SocketExport {
    pub(crate) handle: TransportHandle,
    pub(crate) input: ByteQueue,
    pub(crate) ssl: Option<Box<SslState>>,
    pub(crate) token: u64,
}

impl SocketExport {
    /// The exported socket's loop-local identity.
    #[must_use]
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Destroy a record that will not be imported, releasing the session
    /// and closing the transport.
    pub fn dispose(self) {
        drop(self);
    }
}

impl std::fmt::Debug for SocketExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketExport")
            .field("token", &self.token)
            .field("buffered", &self.input.len())
            .field("tls", &self.ssl.is_some())
            .finish()
    }
}

/// An asynchronous socket with an optional integrated TLS session.
pub struct Socket {
    backend: Box<dyn Backend>,
    /// Application-level input: cleartext for TLS sockets, raw otherwise.
    input: ByteQueue,
    read_waiter: Option<ReadWaiter>,
    write_waiter: Option<WriteWaiter>,
    on_close: Option<CloseHook>,
    peername: Option<PeerAddress>,
    ssl: Option<Box<SslState>>,
    latency: LatencyOptimizer,
    /// A rejected engine write was observed; the next write completion
    /// reports an I/O error.
    write_error_latched: bool,
    disposed: bool,
}

impl Socket {
    pub(crate) fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            input: ByteQueue::new(&BufferPrototype::thread_local()),
            read_waiter: None,
            write_waiter: None,
            on_close: None,
            peername: None,
            ssl: None,
            latency: LatencyOptimizer::new(),
            write_error_latched: false,
            disposed: false,
        }
    }

    pub(crate) fn from_import(
        backend: Box<dyn Backend>,
        mut input: ByteQueue,
        mut ssl: Option<Box<SslState>>,
    ) -> Self {
        let pooling = BufferPrototype::thread_local();
        input.rebind_prototype(&pooling);
        if let Some(ssl) = ssl.as_deref_mut() {
            ssl.encrypted.rebind_prototype(&pooling);
        }
        let mut socket = Self::new(backend);
        socket.input = input;
        socket.ssl = ssl;
        socket
    }

    /// The socket's file-descriptor identity within its loop.
    #[must_use]
    pub fn fd_token(&self) -> u64 {
        self.backend.fd_token()
    }

    /// True once the socket has been closed or exported.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// True while a write is in flight.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.write_waiter.is_some()
    }

    /// True if a TLS session is attached.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.ssl.is_some()
    }

    /// Install a hook invoked once when the socket is disposed.
    pub fn set_close_hook(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.on_close = Some(Box::new(hook));
    }

    // ------------------------------------------------------------------
    // Input buffer
    // ------------------------------------------------------------------

    /// The application input buffer (cleartext for TLS sockets).
    #[must_use]
    pub fn input(&self) -> &[u8] {
        self.input.bytes()
    }

    /// Consume `n` bytes from the front of the input buffer.
    pub fn consume_input(&mut self, n: usize) {
        self.input.consume(n);
    }

    // ------------------------------------------------------------------
    // Read pipeline
    // ------------------------------------------------------------------

    /// Arm the read callback and start transport reads.
    ///
    /// The callback fires on every delivery; received bytes accumulate in
    /// [`Self::input`]. Re-arming replaces the previous callback.
    pub fn read_start(&mut self, cb: impl FnMut(&mut Socket, CallbackResult) + Send + 'static) {
        self.read_waiter = Some(ReadWaiter::User(Box::new(cb)));
        self.backend.start_read();
    }

    /// Drop the read callback and stop transport reads. Idempotent.
    pub fn read_stop(&mut self) {
        self.read_waiter = None;
        self.backend.stop_read();
    }

    /// Loop-side entry: a transport read event arrived.
    pub fn notify_read(&mut self, event: ReadEvent<'_>) {
        if self.disposed {
            return;
        }
        enum Kind {
            User,
            Handshake,
            Shutdown,
            Idle,
        }
        let kind = match &self.read_waiter {
            Some(ReadWaiter::Handshake) => Kind::Handshake,
            Some(ReadWaiter::Shutdown) => Kind::Shutdown,
            Some(_) => Kind::User,
            None => Kind::Idle,
        };
        match kind {
            Kind::Handshake => match event {
                ReadEvent::Data(data) => match self.append_encrypted(data) {
                    Ok(()) => self.proceed_handshake(None),
                    Err(err) => self.proceed_handshake(Some(err)),
                },
                ReadEvent::Eof => {
                    self.mark_transport_eof();
                    self.proceed_handshake(Some(SocketError::ClosedByPeer));
                }
                ReadEvent::Error(err) => self.proceed_handshake(Some(err)),
            },
            Kind::Shutdown => match event {
                ReadEvent::Data(data) => {
                    let _ = self.append_encrypted(data);
                    self.shutdown_ssl(None);
                }
                ReadEvent::Eof | ReadEvent::Error(_) => self.dispose_socket(),
            },
            Kind::User => {
                let result = self.ingest_for_user(event);
                self.fire_read_callback(result);
            }
            Kind::Idle => {}
        }
    }

    /// Feed one user-facing read event through the appropriate pipeline.
    fn ingest_for_user(&mut self, event: ReadEvent<'_>) -> CallbackResult {
        match event {
            ReadEvent::Data(data) => {
                if self.ssl.is_some() {
                    self.append_encrypted(data)?;
                    match self.decode_ssl_input() {
                        Some(err) => Err(err),
                        None => Ok(()),
                    }
                } else {
                    self.input.append(data)
                }
            }
            ReadEvent::Eof => {
                if self.ssl.is_some() {
                    self.mark_transport_eof();
                    // Drain what already arrived; the close still wins.
                    let _ = self.decode_ssl_input();
                }
                Err(SocketError::ClosedByPeer)
            }
            ReadEvent::Error(err) => Err(err),
        }
    }

    fn fire_read_callback(&mut self, result: CallbackResult) {
        match self.read_waiter.take() {
            Some(ReadWaiter::User(mut cb)) => {
                self.read_waiter = Some(ReadWaiter::Invoking);
                cb(self, result);
                // Restore unless the callback re-armed, stopped, or closed
                // the socket.
                if matches!(self.read_waiter, Some(ReadWaiter::Invoking)) {
                    self.read_waiter = if self.disposed {
                        None
                    } else {
                        Some(ReadWaiter::User(cb))
                    };
                }
            }
            other => self.read_waiter = other,
        }
    }

    /// Drive the engine over buffered ciphertext, appending cleartext to
    /// the application input. Returns the error to surface, if any.
    fn decode_ssl_input(&mut self) -> Option<SocketError> {
        enum Outcome {
            Progress,
            Stalled,
            Failed,
        }

        loop {
            let Some(ssl) = self.ssl.as_deref_mut() else {
                return None;
            };
            debug_assert!(ssl.handshake_cb.is_none());
            let SslState {
                engine,
                encrypted,
                output,
                transport_eof,
                ..
            } = ssl;
            let Some(engine) = engine.as_mut() else {
                return None;
            };
            if encrypted.is_empty() && engine.pending_plaintext() == 0 {
                return None;
            }

            let mut fired = false;
            let mut outcome = Outcome::Stalled;
            let appended = self.input.append_with(INPUT_RESERVE, |buf| {
                let status = {
                    let mut io =
                        SessionIo::new(encrypted, output, *transport_eof, Some(&mut fired));
                    engine.read(&mut io, buf)
                };
                match status {
                    ReadStatus::Bytes(n) if !fired => {
                        outcome = Outcome::Progress;
                        n
                    }
                    ReadStatus::Bytes(_) | ReadStatus::WantRead | ReadStatus::Eof => 0,
                    ReadStatus::Failed(_) => {
                        outcome = Outcome::Failed;
                        0
                    }
                }
            });
            if appended.is_err() {
                return Some(SocketError::OutOfMemory);
            }
            if fired {
                return Some(SocketError::RenegotiationUnsupported);
            }
            match outcome {
                Outcome::Progress => {}
                Outcome::Stalled => return None,
                Outcome::Failed => return Some(SocketError::SslDecode),
            }
        }
    }

    fn append_encrypted(&mut self, data: &[u8]) -> Result<(), SocketError> {
        let ssl = self.ssl.as_deref_mut().expect("no TLS session");
        ssl.encrypted.append(data)
    }

    fn mark_transport_eof(&mut self) {
        if let Some(ssl) = self.ssl.as_deref_mut() {
            ssl.transport_eof = true;
        }
    }

    // ------------------------------------------------------------------
    // Write pipeline
    // ------------------------------------------------------------------

    /// Write `bufs` as one contiguous transport write and invoke `cb` once
    /// it settles. At most one write may be in flight per socket.
    ///
    /// For TLS sockets the payload is fragmented into records sized by the
    /// latency governor and encrypted before leaving the socket.
    ///
    /// # Panics
    ///
    /// Panics if a write is already in flight, or if a TLS write is issued
    /// while the previous one has not settled.
    pub fn write(
        &mut self,
        bufs: &[&[u8]],
        cb: impl FnMut(&mut Socket, CallbackResult) + Send + 'static,
    ) {
        assert!(
            self.write_waiter.is_none(),
            "at most one write in flight per socket"
        );
        let cb: SocketCallback = Box::new(cb);

        if self.ssl.is_none() {
            let bufs = bufs.iter().map(|b| Bytes::copy_from_slice(b)).collect();
            self.write_waiter = Some(WriteWaiter::User(cb));
            self.backend.queue_write(bufs);
            return;
        }

        assert!(
            self.ssl.as_deref().is_some_and(|ssl| ssl.output.is_empty()),
            "previous TLS write has not settled"
        );

        let record_size = self.latency.select_record_size();
        trace!(record_size, "encrypting write");
        for buf in bufs {
            let mut offset = 0;
            while offset != buf.len() {
                let take = record_size.min(buf.len() - offset);
                let chunk = &buf[offset..offset + take];
                let accepted = {
                    let ssl = self.ssl.as_deref_mut().expect("tls write");
                    let SslState {
                        engine,
                        encrypted,
                        output,
                        transport_eof,
                        ..
                    } = ssl;
                    match engine.as_mut() {
                        Some(engine) => {
                            let mut io = SessionIo::new(encrypted, output, *transport_eof, None);
                            matches!(
                                engine.write(&mut io, chunk),
                                WriteStatus::Accepted(n) if n == chunk.len()
                            )
                        }
                        None => false,
                    }
                };
                if !accepted {
                    // A prior read hit a fatal record error and the caller
                    // wrote anyway (protocol layers cannot always tell a
                    // clean close from a fatal one). Deliver the failure
                    // through the normal completion path.
                    if let Some(ssl) = self.ssl.as_deref_mut() {
                        ssl.output.clear();
                    }
                    self.write_error_latched = true;
                    self.flush_pending(WriteWaiter::User(cb));
                    return;
                }
                offset += take;
            }
        }
        self.flush_pending(WriteWaiter::User(cb));
    }

    /// Dispatch the accumulated session output as one transport write.
    fn flush_pending(&mut self, waiter: WriteWaiter) {
        let bufs = self
            .ssl
            .as_deref_mut()
            .map_or_else(Vec::new, |ssl| ssl.output.flush_bufs());
        self.write_waiter = Some(waiter);
        self.backend.queue_write(bufs);
    }

    /// Loop-side entry: the in-flight write settled.
    pub fn notify_write_done(&mut self, err: Option<SocketError>) {
        if self.disposed {
            return;
        }
        if let Some(ssl) = self.ssl.as_deref_mut() {
            ssl.output.clear();
        }
        let mut err = err;
        if self.write_error_latched {
            self.write_error_latched = false;
            err = Some(SocketError::Io);
        }
        let Some(waiter) = self.write_waiter.take() else {
            return;
        };
        match waiter {
            WriteWaiter::User(mut cb) => cb(self, err.map_or(Ok(()), Err)),
            WriteWaiter::HandshakeProceed => self.proceed_handshake(err),
            WriteWaiter::HandshakeComplete => self.complete_handshake(err),
            WriteWaiter::ShutdownContinue => self.shutdown_ssl(err),
            WriteWaiter::ShutdownDispose | WriteWaiter::DisposeOnSettle => self.dispose_socket(),
        }
    }

    // ------------------------------------------------------------------
    // TLS session lifecycle
    // ------------------------------------------------------------------

    /// Attach a TLS session and start the handshake.
    ///
    /// `server_name` selects the role: `None` accepts as a server, `Some`
    /// connects as a client to that name (also used for SNI and
    /// certificate validation). `cb` fires once the handshake settles.
    ///
    /// Any bytes already buffered in the socket input are treated as
    /// ciphertext for the fresh session.
    ///
    /// # Errors
    ///
    /// Fails synchronously when the context refuses to build an engine.
    ///
    /// # Panics
    ///
    /// Panics if a TLS session is already attached.
    pub fn ssl_handshake(
        &mut self,
        ctx: &SslContext,
        server_name: Option<&str>,
        cb: impl FnMut(&mut Socket, CallbackResult) + Send + 'static,
    ) -> Result<(), ContextError> {
        assert!(self.ssl.is_none(), "TLS session already attached");

        let pooling = BufferPrototype::thread_local();
        let mut encrypted = ByteQueue::new(&pooling);
        // Pre-buffered bytes are ciphertext with respect to the session.
        if !self.input.is_empty() {
            self.input.swap_contents(&mut encrypted);
        }

        let is_server = server_name.is_none();
        let phase = if is_server && ctx.has_async_lookup() {
            ResumptionPhase::Record
        } else {
            ResumptionPhase::Complete
        };
        let cell = Arc::new(ResumptionCell::new(phase));
        let engine = ctx.new_engine(server_name, cell.clone())?;

        let role = match server_name {
            None => HandshakeRole::Server,
            Some(name) => HandshakeRole::Client {
                server_name: name.to_string(),
            },
        };
        self.ssl = Some(Box::new(SslState {
            engine: Some(engine),
            context: ctx.clone(),
            handshake_cb: Some(Box::new(cb)),
            role,
            cell,
            encrypted,
            output: Default::default(),
            transport_eof: false,
        }));

        if is_server {
            let buffered = self
                .ssl
                .as_deref()
                .is_some_and(|ssl| !ssl.encrypted.is_empty());
            if buffered {
                self.proceed_handshake(None);
            } else {
                self.read_waiter = Some(ReadWaiter::Handshake);
                self.backend.start_read();
            }
        } else {
            self.proceed_handshake(None);
        }
        Ok(())
    }

    /// Deliver the external session-cache answer and resume a suspended
    /// server handshake. An empty `session_data` means "not found"; the
    /// handshake then proceeds as a full one.
    pub fn ssl_resume_server_handshake(&mut self, session_data: &[u8]) {
        {
            let Some(ssl) = self.ssl.as_deref_mut() else {
                return;
            };
            if !session_data.is_empty() {
                ssl.cell
                    .set_session_data(Some(Bytes::copy_from_slice(session_data)));
            }
            ssl.cell.set_phase(ResumptionPhase::Complete);
        }
        self.proceed_handshake(None);
        if let Some(ssl) = self.ssl.as_deref() {
            ssl.cell.clear_session_data();
        }
    }

    /// Drive the handshake until it completes, fails, or suspends on one
    /// of the three wait edges.
    fn proceed_handshake(&mut self, err: Option<SocketError>) {
        self.write_waiter = None;

        if let Some(err) = err {
            self.complete_handshake(Some(err));
            return;
        }

        // While recording, retain a replay copy of the first input. Too
        // much buffered ciphertext forfeits the async-lookup opportunity.
        let mut first_input: Option<Bytes> = None;
        {
            let Some(ssl) = self.ssl.as_deref_mut() else {
                return;
            };
            if matches!(ssl.role, HandshakeRole::Server)
                && ssl.cell.phase() == ResumptionPhase::Record
            {
                if ssl.encrypted.len() <= MAX_REPLAY_INPUT {
                    first_input = Some(Bytes::copy_from_slice(ssl.encrypted.bytes()));
                } else {
                    ssl.cell.set_phase(ResumptionPhase::Complete);
                }
            }
        }

        loop {
            let status = {
                let Some(ssl) = self.ssl.as_deref_mut() else {
                    return;
                };
                let SslState {
                    engine,
                    encrypted,
                    output,
                    transport_eof,
                    ..
                } = ssl;
                let Some(engine) = engine.as_mut() else {
                    return;
                };
                let mut io = SessionIo::new(encrypted, output, *transport_eof, None);
                engine.drive_handshake(&mut io)
            };

            match self.ssl.as_deref().map(|ssl| ssl.cell.phase()) {
                Some(ResumptionPhase::Record) => {
                    // The engine did not ask for a session; pass through.
                    if let Some(ssl) = self.ssl.as_deref() {
                        ssl.cell.set_phase(ResumptionPhase::Complete);
                    }
                }
                Some(ResumptionPhase::RequestSent) => {
                    self.suspend_for_resumption(first_input.take());
                    return;
                }
                _ => {}
            }

            match status {
                HandshakeStatus::Closed | HandshakeStatus::Failed(_) => {
                    let err = self.handshake_failure_error();
                    self.complete_handshake(Some(err));
                    return;
                }
                HandshakeStatus::Complete | HandshakeStatus::WantRead => {}
            }

            let output_pending = self
                .ssl
                .as_deref()
                .is_some_and(|ssl| !ssl.output.is_empty());
            if output_pending {
                self.read_stop();
                let waiter = if matches!(status, HandshakeStatus::Complete) {
                    WriteWaiter::HandshakeComplete
                } else {
                    WriteWaiter::HandshakeProceed
                };
                self.flush_pending(waiter);
                return;
            }

            if matches!(status, HandshakeStatus::Complete) {
                let err = self.client_post_verify();
                self.complete_handshake(err);
                return;
            }

            // The engine wants more bytes; ciphertext that arrived with
            // the last delivery may already unblock it.
            let buffered = self
                .ssl
                .as_deref()
                .is_some_and(|ssl| !ssl.encrypted.is_empty());
            if buffered {
                continue;
            }
            self.read_waiter = Some(ReadWaiter::Handshake);
            self.backend.start_read();
            return;
        }
    }

    /// Tear down the engine and wait for the external session lookup.
    fn suspend_for_resumption(&mut self, first_input: Option<Bytes>) {
        debug!("handshake suspended for async session lookup");
        let mut rebuild_failed = false;
        let lookup;
        {
            let ssl = self.ssl.as_deref_mut().expect("session");
            ssl.engine = None;
            ssl.output.clear();
            let buffered = ssl.encrypted.len();
            ssl.encrypted.consume(buffered);
            if let Some(snapshot) = first_input {
                // Snapshots are capped well below the queue ceiling.
                let restored = ssl.encrypted.append(&snapshot);
                debug_assert!(restored.is_ok());
            }
            match ssl.context.new_engine(None, ssl.cell.clone()) {
                Ok(engine) => ssl.engine = Some(engine),
                Err(_) => rebuild_failed = true,
            }
            lookup = ssl.cell.take_pending_lookup();
        }
        self.read_stop();
        if rebuild_failed {
            self.complete_handshake(Some(SocketError::HandshakeFailure));
            return;
        }
        if let Some(callbacks) = resumption::installed() {
            if let Some(session_id) = lookup {
                (callbacks.get_async.as_ref())(self, &session_id);
            }
        }
    }

    fn handshake_failure_error(&self) -> SocketError {
        let verify = self
            .ssl
            .as_deref()
            .and_then(|ssl| ssl.engine.as_ref())
            .and_then(|engine| engine.verify_error());
        match verify {
            Some(VerifyFailure::NameMismatch) => SocketError::SslCertificateNameMismatch,
            Some(VerifyFailure::Detail(detail)) => SocketError::Verify(detail),
            None => SocketError::HandshakeFailure,
        }
    }

    /// Client-side post-handshake certificate validation.
    fn client_post_verify(&self) -> Option<SocketError> {
        let ssl = self.ssl.as_deref()?;
        let HandshakeRole::Client { server_name } = &ssl.role else {
            return None;
        };
        let engine = ssl.engine.as_ref()?;
        match engine.peer_certificate() {
            None => Some(SocketError::SslNoCertificate),
            Some(der) => match validate_hostname(server_name, &der) {
                HostnameMatch::Found => None,
                HostnameMatch::NotFound => Some(SocketError::SslCertificateNameMismatch),
                HostnameMatch::Invalid => Some(SocketError::SslCertificateInvalid),
            },
        }
    }

    /// Settle the handshake: drain buffered ciphertext so the first
    /// application read sees early bytes, then hand the result over.
    fn complete_handshake(&mut self, err: Option<SocketError>) {
        self.read_stop();
        self.write_waiter = None;
        let cb = self
            .ssl
            .as_deref_mut()
            .and_then(|ssl| ssl.handshake_cb.take());
        let _ = self.decode_ssl_input();
        if let Some(mut cb) = cb {
            cb(self, err.map_or(Ok(()), Err));
        }
    }

    // ------------------------------------------------------------------
    // TLS introspection
    // ------------------------------------------------------------------

    /// The application protocol negotiated during the handshake; ALPN
    /// takes precedence over NPN.
    #[must_use]
    pub fn ssl_get_selected_protocol(&self) -> Option<Vec<u8>> {
        let engine = self.ssl.as_deref()?.engine.as_ref()?;
        engine.selected_alpn().or_else(|| engine.selected_npn())
    }

    /// The negotiated protocol version, e.g. `TLSv1.3`.
    #[must_use]
    pub fn ssl_get_protocol_version(&self) -> Option<&'static str> {
        self.ssl.as_deref()?.engine.as_ref()?.protocol_version()
    }

    /// The negotiated cipher-suite name.
    #[must_use]
    pub fn ssl_get_cipher(&self) -> Option<String> {
        Some(self.ssl.as_deref()?.engine.as_ref()?.cipher()?.name)
    }

    /// The negotiated cipher strength in bits; 0 without a session.
    #[must_use]
    pub fn ssl_get_cipher_bits(&self) -> u16 {
        self.ssl
            .as_deref()
            .and_then(|ssl| ssl.engine.as_ref())
            .and_then(|engine| engine.cipher())
            .map_or(0, |cipher| cipher.bits)
    }

    /// Whether the handshake resumed a cached session; `None` without a
    /// session.
    #[must_use]
    pub fn ssl_get_session_reused(&self) -> Option<bool> {
        Some(self.ssl.as_deref()?.engine.as_ref()?.session_reused())
    }

    // ------------------------------------------------------------------
    // Latency-optimized writes
    // ------------------------------------------------------------------

    /// Advise a write-size ceiling from live congestion state; `None`
    /// means no cap. See [`LatencyOptimizer`].
    pub fn prepare_for_latency_optimized_write(&mut self, minimum_rtt: u32) -> Option<usize> {
        let cipher = match self.ssl.as_deref() {
            None => None,
            Some(ssl) => Some(
                ssl.engine
                    .as_ref()
                    .and_then(|engine| engine.cipher())
                    .map_or(CipherKind::Other, |cipher| cipher.kind),
            ),
        };
        struct BackendProbe<'a>(&'a mut dyn Backend);
        impl TransportProbe for BackendProbe<'_> {
            fn snapshot(&mut self) -> Option<TcpSnapshot> {
                self.0.tcp_snapshot()
            }
            fn enable_partial_write_notify(&mut self) -> bool {
                self.0.enable_partial_write_notify()
            }
        }
        let mut probe = BackendProbe(&mut *self.backend);
        self.latency.prepare(minimum_rtt, cipher, &mut probe)
    }

    // ------------------------------------------------------------------
    // Peer name
    // ------------------------------------------------------------------

    /// Cache the peer address explicitly.
    pub fn set_peername(&mut self, addr: PeerAddress) {
        self.peername = Some(addr);
    }

    /// The peer address, from the cache or the transport.
    pub fn peername(&mut self) -> Option<PeerAddress> {
        if self.peername.is_none() {
            self.peername = self.backend.peername();
        }
        self.peername.clone()
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Close the socket. Plaintext sockets dispose immediately; TLS
    /// sessions run a graceful shutdown first. The pending write callback
    /// (if any) is dropped; the handshake callback likewise.
    pub fn close(&mut self) {
        if self.disposed {
            return;
        }
        if let Some(ssl) = self.ssl.as_deref_mut() {
            ssl.handshake_cb = None;
        }
        if self.ssl.is_none() {
            self.dispose_socket();
        } else {
            self.shutdown_ssl(None);
        }
    }

    /// Graceful TLS shutdown, interleaved with transport writes.
    fn shutdown_ssl(&mut self, err: Option<SocketError>) {
        if self.disposed {
            return;
        }
        if err.is_some() {
            self.dispose_socket();
            return;
        }
        if self.write_waiter.is_some() {
            // Cancel the in-flight write's callback; dispose on settle.
            self.write_waiter = Some(WriteWaiter::DisposeOnSettle);
            return;
        }

        let status = {
            let Some(ssl) = self.ssl.as_deref_mut() else {
                self.dispose_socket();
                return;
            };
            let SslState {
                engine,
                encrypted,
                output,
                transport_eof,
                ..
            } = ssl;
            match engine.as_mut() {
                Some(engine) => {
                    let mut io = SessionIo::new(encrypted, output, *transport_eof, None);
                    engine.shutdown(&mut io)
                }
                // No live engine (suspended resumption); nothing to say.
                None => ShutdownStatus::Failed,
            }
        };

        match status {
            ShutdownStatus::Failed => self.dispose_socket(),
            status => {
                let output_pending = self
                    .ssl
                    .as_deref()
                    .is_some_and(|ssl| !ssl.output.is_empty());
                if output_pending {
                    self.read_stop();
                    let waiter = if matches!(status, ShutdownStatus::Complete) {
                        WriteWaiter::ShutdownDispose
                    } else {
                        WriteWaiter::ShutdownContinue
                    };
                    self.flush_pending(waiter);
                } else if matches!(status, ShutdownStatus::WantRead) {
                    self.read_waiter = Some(ReadWaiter::Shutdown);
                    self.backend.start_read();
                } else {
                    self.dispose_socket();
                }
            }
        }
    }

    fn dispose_socket(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.read_waiter = None;
        self.write_waiter = None;
        self.ssl = None;
        self.input.dispose();
        self.peername = None;
        let hook = self.on_close.take();
        self.backend.dispose();
        if let Some(hook) = hook {
            hook();
        }
    }

    // ------------------------------------------------------------------
    // Export / import
    // ------------------------------------------------------------------

    /// Detach the socket for migration to another loop (possibly another
    /// thread). The socket shell is closed; pending decrypted and
    /// encrypted bytes travel with the record.
    ///
    /// # Errors
    ///
    /// Refused while a write is in flight, while the handshake is
    /// pending, or when the backend cannot detach the transport.
    pub fn export(&mut self) -> Result<SocketExport, ExportError> {
        if self.write_waiter.is_some() {
            return Err(ExportError::WriteInFlight);
        }
        if self
            .ssl
            .as_deref()
            .is_some_and(|ssl| ssl.handshake_cb.is_some())
        {
            return Err(ExportError::HandshakeInFlight);
        }
        let handle = self.backend.export().map_err(|_| ExportError::Unsupported)?;
        let token = self.backend.fd_token();

        let plain = BufferPrototype::plain();
        let mut ssl = self.ssl.take();
        if let Some(ssl) = ssl.as_deref_mut() {
            ssl.encrypted.rebind_prototype(&plain);
        }
        let mut input = std::mem::replace(
            &mut self.input,
            ByteQueue::new(&BufferPrototype::thread_local()),
        );
        input.rebind_prototype(&plain);

        self.dispose_socket();
        Ok(SocketExport {
            handle,
            input,
            ssl,
            token,
        })
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd_token", &self.backend.fd_token())
            .field("tls", &self.ssl.is_some())
            .field("buffered", &self.input.len())
            .field("writing", &self.write_waiter.is_some())
            .field("disposed", &self.disposed)
            .finish()
    }
}
