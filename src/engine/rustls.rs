//! The rustls-backed TLS engine.
//!
//! rustls is sans-io: ciphertext moves through `read_tls`/`write_tls`
//! against `io::Read`/`io::Write` adapters, and `process_new_packets`
//! advances the protocol. This module wraps a client or server connection
//! behind the [`TlsEngine`] trait, with the adapters bound to the
//! session's byte queues through [`EngineIo`].
//!
//! Server accepts are deferred: the engine parses the ClientHello with
//! [`Acceptor`] first, settles the ALPN verdict by running the client's
//! re-encoded wire offer through [`select_protocol`] against the
//! context's registered list, and only then builds the per-connection
//! config. A no-ack verdict omits ALPN from the connection instead of
//! failing the handshake.
//!
//! Status mapping from rustls to the engine contract:
//!
//! | rustls observation | engine status |
//! |---|---|
//! | `read_tls` hits `WouldBlock` | `WantRead` |
//! | `read_tls` returns 0 | `Closed` / `Eof` |
//! | `process_new_packets` errors | `Failed` (verify detail recorded) |
//! | `is_handshaking()` false | `Complete` |
//! | close_notify queued, peer still open | `Sent` |
//! | peer's close_notify observed | `Complete` |

use std::io;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::server::{Accepted, Acceptor, StoresServerSessions};
use rustls::{ClientConfig, ClientConnection, HandshakeKind, ServerConfig, ServerConnection};

use super::{
    CipherInfo, CipherKind, EngineError, EngineIo, HandshakeStatus, Pull, ReadStatus,
    ShutdownStatus, TlsEngine, VerifyFailure, WriteStatus,
};
use crate::alpn::{encode_protocol_list, select_protocol};
use crate::context::ContextError;
use crate::resumption;
use crate::session::ResumptionCell;
use crate::tracing_compat::{debug, trace};

/// Server-side state before the ClientHello has fully arrived.
struct AcceptState {
    acceptor: Acceptor,
    base: Arc<ServerConfig>,
    /// The context's registered protocol list, most preferred first.
    protocols: Vec<Vec<u8>>,
    session_store: Option<Arc<dyn StoresServerSessions>>,
}

impl AcceptState {
    /// Assemble the per-connection config from the parsed ClientHello:
    /// the ALPN verdict for the registered list, plus the session-store
    /// shim.
    fn connection_config(&self, accepted: &Accepted) -> Arc<ServerConfig> {
        if self.protocols.is_empty() && self.session_store.is_none() {
            return Arc::clone(&self.base);
        }
        let mut config = (*self.base).clone();
        if let Some(store) = &self.session_store {
            config.session_storage = Arc::clone(store);
        }
        if !self.protocols.is_empty() {
            let offered: Vec<Vec<u8>> = accepted
                .client_hello()
                .alpn()
                .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
                .unwrap_or_default();
            let wire = encode_protocol_list(&offered);
            config.alpn_protocols = match select_protocol(&self.protocols, &wire) {
                Some(protocol) => vec![protocol.to_vec()],
                // No-ack: the connection continues without ALPN.
                None => Vec::new(),
            };
            debug!(selected = ?config.alpn_protocols.first(), "alpn verdict");
        }
        Arc::new(config)
    }
}

enum Conn {
    /// Server before the ClientHello is complete.
    Accepting(Box<AcceptState>),
    Client(ClientConnection),
    Server(ServerConnection),
}

impl Conn {
    fn is_handshaking(&self) -> bool {
        match self {
            Self::Accepting(_) => true,
            Self::Client(conn) => conn.is_handshaking(),
            Self::Server(conn) => conn.is_handshaking(),
        }
    }

    fn wants_read(&self) -> bool {
        match self {
            Self::Accepting(_) => true,
            Self::Client(conn) => conn.wants_read(),
            Self::Server(conn) => conn.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Self::Accepting(_) => false,
            Self::Client(conn) => conn.wants_write(),
            Self::Server(conn) => conn.wants_write(),
        }
    }

    fn read_tls(&mut self, rd: &mut dyn io::Read) -> io::Result<usize> {
        match self {
            Self::Accepting(state) => state.acceptor.read_tls(rd),
            Self::Client(conn) => conn.read_tls(rd),
            Self::Server(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn io::Write) -> io::Result<usize> {
        match self {
            Self::Accepting(_) => Ok(0),
            Self::Client(conn) => conn.write_tls(wr),
            Self::Server(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<Option<rustls::IoState>, rustls::Error> {
        match self {
            Self::Accepting(_) => Ok(None),
            Self::Client(conn) => conn.process_new_packets().map(Some),
            Self::Server(conn) => conn.process_new_packets().map(Some),
        }
    }

    fn read_plain(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Accepting(_) => Err(io::ErrorKind::WouldBlock.into()),
            Self::Client(conn) => io::Read::read(&mut conn.reader(), buf),
            Self::Server(conn) => io::Read::read(&mut conn.reader(), buf),
        }
    }

    fn write_plain(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Self::Accepting(_) => Err(io::ErrorKind::InvalidInput.into()),
            Self::Client(conn) => io::Write::write(&mut conn.writer(), data),
            Self::Server(conn) => io::Write::write(&mut conn.writer(), data),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Self::Accepting(_) => {}
            Self::Client(conn) => conn.send_close_notify(),
            Self::Server(conn) => conn.send_close_notify(),
        }
    }

    fn negotiated_cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        match self {
            Self::Accepting(_) => None,
            Self::Client(conn) => conn.negotiated_cipher_suite(),
            Self::Server(conn) => conn.negotiated_cipher_suite(),
        }
    }

    fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        match self {
            Self::Accepting(_) => None,
            Self::Client(conn) => conn.protocol_version(),
            Self::Server(conn) => conn.protocol_version(),
        }
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            Self::Accepting(_) => None,
            Self::Client(conn) => conn.alpn_protocol(),
            Self::Server(conn) => conn.alpn_protocol(),
        }
    }

    fn peer_certificates(&self) -> Option<&[rustls::pki_types::CertificateDer<'static>]> {
        match self {
            Self::Accepting(_) => None,
            Self::Client(conn) => conn.peer_certificates(),
            Self::Server(conn) => conn.peer_certificates(),
        }
    }

    fn handshake_kind(&self) -> Option<HandshakeKind> {
        match self {
            Self::Accepting(_) => None,
            Self::Client(conn) => conn.handshake_kind(),
            Self::Server(conn) => conn.handshake_kind(),
        }
    }
}

/// Reads ciphertext for the engine from the session's encrypted queue.
struct QueueReader<'a, 'b> {
    io: &'a mut (dyn EngineIo + 'b),
}

impl io::Read for QueueReader<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.io.pull(buf) {
            Pull::Bytes(n) => Ok(n),
            Pull::Empty => Err(io::ErrorKind::WouldBlock.into()),
            Pull::Eof => Ok(0),
        }
    }
}

/// Appends engine-emitted records to the session's output accumulator.
struct QueueWriter<'a, 'b> {
    io: &'a mut (dyn EngineIo + 'b),
}

impl io::Write for QueueWriter<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.io
            .push(buf)
            .map_err(|_| io::ErrorKind::WouldBlock.into())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The production TLS engine.
pub struct RustlsEngine {
    conn: Conn,
    pending_plaintext: usize,
    peer_closed: bool,
    sent_close: bool,
    fatal: bool,
    verify_failure: Option<VerifyFailure>,
}

impl RustlsEngine {
    /// A server-side engine over `config`, with no registered protocol
    /// list and the config's own session storage.
    #[must_use]
    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self::server_with(config, Vec::new(), None)
    }

    /// A server-side engine: `protocols` is the registered ALPN list the
    /// accept path selects from, `session_store` overrides the config's
    /// session storage per connection.
    pub(crate) fn server_with(
        config: Arc<ServerConfig>,
        protocols: Vec<Vec<u8>>,
        session_store: Option<Arc<dyn StoresServerSessions>>,
    ) -> Self {
        Self::new(Conn::Accepting(Box::new(AcceptState {
            acceptor: Acceptor::default(),
            base: config,
            protocols,
            session_store,
        })))
    }

    /// A client-side engine over `config`, connecting to `server_name`.
    ///
    /// # Errors
    ///
    /// Fails when rustls rejects the configuration.
    pub fn client(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self, ContextError> {
        let conn = ClientConnection::new(config, server_name)
            .map_err(|e| ContextError::Configuration(e.to_string()))?;
        Ok(Self::new(Conn::Client(conn)))
    }

    fn new(conn: Conn) -> Self {
        Self {
            conn,
            pending_plaintext: 0,
            peer_closed: false,
            sent_close: false,
            fatal: false,
            verify_failure: None,
        }
    }

    fn read_tls(&mut self, io: &mut dyn EngineIo) -> io::Result<usize> {
        let mut reader = QueueReader { io };
        self.conn.read_tls(&mut reader)
    }

    fn record_failure(&mut self, err: &rustls::Error) {
        self.fatal = true;
        if let rustls::Error::InvalidCertificate(cert_err) = err {
            self.verify_failure = Some(classify_certificate_error(cert_err, err));
        }
    }

    /// Run `process_new_packets`, caching the io-state counters and
    /// recording verification detail on failure.
    fn process(&mut self) -> Result<(), rustls::Error> {
        match self.conn.process_new_packets() {
            Ok(None) => Ok(()),
            Ok(Some(state)) => {
                self.pending_plaintext = state.plaintext_bytes_to_read();
                if state.peer_has_closed() {
                    self.peer_closed = true;
                }
                Ok(())
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Move everything rustls wants to send into the session output.
    /// Fails only when the read re-entry token blocks the push.
    fn flush_output(&mut self, io: &mut dyn EngineIo) -> Result<(), ()> {
        while self.conn.wants_write() {
            let mut writer = QueueWriter { io };
            match self.conn.write_tls(&mut writer) {
                Ok(_) => {}
                Err(_) => return Err(()),
            }
        }
        Ok(())
    }

    /// Drive the deferred accept: parse the ClientHello and build the
    /// per-connection config once its ALPN offer has been judged. Returns
    /// `None` when a live connection is in place.
    fn drive_accept(&mut self, io: &mut dyn EngineIo) -> Option<HandshakeStatus> {
        loop {
            let outcome = {
                let Conn::Accepting(state) = &mut self.conn else {
                    return None;
                };
                let mut exhausted = false;
                let mut reader = QueueReader { io };
                match state.acceptor.read_tls(&mut reader) {
                    Ok(0) => return Some(HandshakeStatus::Closed),
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => exhausted = true,
                    Err(e) => {
                        return Some(HandshakeStatus::Failed(EngineError::new(e.to_string())))
                    }
                }
                match state.acceptor.accept() {
                    Ok(None) => {
                        if exhausted {
                            return Some(HandshakeStatus::WantRead);
                        }
                        continue;
                    }
                    Ok(Some(accepted)) => {
                        let config = state.connection_config(&accepted);
                        accepted.into_connection(config)
                    }
                    Err((err, alert)) => Err((err, alert)),
                }
            };
            match outcome {
                Ok(conn) => {
                    self.conn = Conn::Server(conn);
                    return None;
                }
                Err((err, mut alert)) => {
                    self.record_failure(&err);
                    let mut writer = QueueWriter { io };
                    let _ = alert.write(&mut writer);
                    return Some(HandshakeStatus::Failed(EngineError::new(err.to_string())));
                }
            }
        }
    }
}

impl TlsEngine for RustlsEngine {
    fn drive_handshake(&mut self, io: &mut dyn EngineIo) -> HandshakeStatus {
        if let Some(status) = self.drive_accept(io) {
            return status;
        }
        loop {
            if let Err(err) = self.process() {
                // Queue the alert for whoever flushes next.
                let _ = self.flush_output(io);
                return HandshakeStatus::Failed(EngineError::new(err.to_string()));
            }
            if self.flush_output(io).is_err() {
                return HandshakeStatus::Failed(EngineError::new("blocked emitting handshake"));
            }
            if !self.conn.is_handshaking() {
                trace!("handshake complete");
                return HandshakeStatus::Complete;
            }
            if !self.conn.wants_read() {
                return HandshakeStatus::WantRead;
            }
            match self.read_tls(io) {
                Ok(0) => return HandshakeStatus::Closed,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return HandshakeStatus::WantRead
                }
                Err(e) => return HandshakeStatus::Failed(EngineError::new(e.to_string())),
            }
        }
    }

    fn read(&mut self, io: &mut dyn EngineIo, buf: &mut [u8]) -> ReadStatus {
        loop {
            match self.conn.read_plain(buf) {
                Ok(0) => return ReadStatus::Eof,
                Ok(n) => {
                    self.pending_plaintext = self.pending_plaintext.saturating_sub(n);
                    return ReadStatus::Bytes(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return ReadStatus::Eof,
                Err(e) => return ReadStatus::Failed(EngineError::new(e.to_string())),
            }

            match self.read_tls(io) {
                Ok(0) => return ReadStatus::Eof,
                Ok(_) => {
                    if let Err(err) = self.process() {
                        let _ = self.flush_output(io);
                        return ReadStatus::Failed(EngineError::new(err.to_string()));
                    }
                    // Protocol responses generated while reading (alerts,
                    // key updates, renegotiation answers) go through the
                    // armed adapter and trip the re-entry token.
                    if self.conn.wants_write() && self.flush_output(io).is_err() {
                        return ReadStatus::Failed(EngineError::new("write during read"));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadStatus::WantRead,
                Err(e) => return ReadStatus::Failed(EngineError::new(e.to_string())),
            }
        }
    }

    fn write(&mut self, io: &mut dyn EngineIo, data: &[u8]) -> WriteStatus {
        if self.fatal {
            return WriteStatus::Rejected;
        }
        let n = match self.conn.write_plain(data) {
            Ok(n) => n,
            Err(_) => return WriteStatus::Rejected,
        };
        if self.flush_output(io).is_err() {
            return WriteStatus::Rejected;
        }
        WriteStatus::Accepted(n)
    }

    fn shutdown(&mut self, io: &mut dyn EngineIo) -> ShutdownStatus {
        if self.fatal || matches!(self.conn, Conn::Accepting(_)) {
            return ShutdownStatus::Failed;
        }
        if !self.sent_close {
            self.sent_close = true;
            self.conn.send_close_notify();
            if self.flush_output(io).is_err() {
                return ShutdownStatus::Failed;
            }
            return if self.peer_closed {
                ShutdownStatus::Complete
            } else {
                ShutdownStatus::Sent
            };
        }
        // Re-entry: consume whatever ciphertext is queued, but do not wait
        // for the peer's close_notify — our half-close is complete once
        // the alert is flushed. `WantRead` is left to engines that must
        // block on the peer's alert.
        loop {
            match self.read_tls(io) {
                Ok(0) => return ShutdownStatus::Complete,
                Ok(_) => {
                    if self.process().is_err() {
                        return ShutdownStatus::Failed;
                    }
                    if self.peer_closed {
                        return ShutdownStatus::Complete;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return ShutdownStatus::Complete
                }
                Err(_) => return ShutdownStatus::Failed,
            }
        }
    }

    fn pending_plaintext(&self) -> usize {
        self.pending_plaintext
    }

    fn cipher(&self) -> Option<CipherInfo> {
        let suite = self.conn.negotiated_cipher_suite()?;
        let name = format!("{:?}", suite.suite());
        let kind = if name.contains("CHACHA20") {
            CipherKind::Chacha20Poly1305
        } else if name.contains("GCM") {
            CipherKind::AesGcm
        } else {
            CipherKind::Other
        };
        let bits = if name.contains("AES_256") || name.contains("CHACHA20") {
            256
        } else if name.contains("AES_128") {
            128
        } else {
            0
        };
        Some(CipherInfo { name, bits, kind })
    }

    fn protocol_version(&self) -> Option<&'static str> {
        use rustls::ProtocolVersion;
        match self.conn.protocol_version()? {
            ProtocolVersion::TLSv1_2 => Some("TLSv1.2"),
            ProtocolVersion::TLSv1_3 => Some("TLSv1.3"),
            _ => Some("TLS"),
        }
    }

    fn selected_alpn(&self) -> Option<Vec<u8>> {
        self.conn.alpn_protocol().map(<[u8]>::to_vec)
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.conn
            .peer_certificates()
            .and_then(<[_]>::first)
            .map(|cert| cert.as_ref().to_vec())
    }

    fn session_reused(&self) -> bool {
        matches!(self.conn.handshake_kind(), Some(HandshakeKind::Resumed))
    }

    fn verify_error(&self) -> Option<VerifyFailure> {
        self.verify_failure.clone()
    }
}

/// Classify a certificate error, keeping the engine's message as detail.
///
/// Name-mismatch detection matches the variant textually: newer rustls
/// point releases report it through a context-carrying variant.
pub(crate) fn classify_certificate_error(
    cert_err: &rustls::CertificateError,
    full: &rustls::Error,
) -> VerifyFailure {
    let variant = format!("{cert_err:?}");
    if variant.starts_with("NotValidForName") {
        VerifyFailure::NameMismatch
    } else {
        VerifyFailure::Detail(full.to_string())
    }
}

/// Session store wired into per-connection server configs when async
/// resumption is registered.
///
/// In the `Record` phase a lookup suspends the handshake; once the
/// external cache answers, the rebuilt engine finds the blob here during
/// ClientHello replay. New and consumed sessions are forwarded to the
/// process-wide callbacks.
#[derive(Debug)]
pub(crate) struct AsyncSessionStore {
    cell: Arc<ResumptionCell>,
}

impl AsyncSessionStore {
    pub(crate) fn new(cell: Arc<ResumptionCell>) -> Self {
        Self { cell }
    }
}

impl StoresServerSessions for AsyncSessionStore {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        if let Some(callbacks) = resumption::installed() {
            (callbacks.new.as_ref())(&key, &value);
            true
        } else {
            false
        }
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(blob) = self.cell.cached_session() {
            return Some(blob.to_vec());
        }
        // In the Record phase this suspends the handshake; the driver
        // tears the engine down and waits for the external answer.
        let _ = self.cell.begin_async_lookup(key);
        None
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        let value = self.get(key)?;
        if let Some(callbacks) = resumption::installed() {
            (callbacks.remove.as_ref())(key);
        }
        Some(value)
    }

    fn can_cache(&self) -> bool {
        true
    }
}
