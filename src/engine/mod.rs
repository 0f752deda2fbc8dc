//! The TLS engine boundary.
//!
//! The socket core never talks to a TLS implementation directly; it drives
//! a [`TlsEngine`] trait object, and the engine reaches the network only
//! through the [`EngineIo`] vtable handed into every call. `EngineIo` is
//! bound to one session's encrypted input queue and output accumulator,
//! so the engine runs synchronously while every suspension point stays in
//! the pipelines above it.
//!
//! The production engine is [`rustls::RustlsEngine`]; tests drive the same
//! trait with scripted engines.

pub(crate) mod rustls;

pub use self::rustls::RustlsEngine;

/// Result of pulling ciphertext from the encrypted input queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    /// `n` bytes were copied out and consumed.
    Bytes(usize),
    /// No ciphertext is buffered; retry after more arrives.
    Empty,
    /// The transport saw EOF and no ciphertext remains.
    Eof,
}

/// The engine attempted to emit bytes while the read re-entry token was
/// armed. This is the sole mechanism by which mid-session renegotiation
/// is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushBlocked;

/// The minimal byte-level vtable a TLS engine sees.
pub trait EngineIo {
    /// Copy up to `out.len()` buffered ciphertext bytes into `out`.
    fn pull(&mut self, out: &mut [u8]) -> Pull;

    /// Append one emitted record to the session output.
    ///
    /// # Errors
    ///
    /// [`PushBlocked`] when the read re-entry token is armed; the engine
    /// must abandon the operation that produced the bytes.
    fn push(&mut self, data: &[u8]) -> Result<usize, PushBlocked>;
}

/// An opaque engine failure, with optional protocol-level detail.
#[derive(Debug, Clone)]
pub struct EngineError {
    message: String,
}

impl EngineError {
    /// Wrap an engine-specific failure message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EngineError {}

/// Outcome of one handshake-driving call (accept or connect per role).
#[derive(Debug)]
pub enum HandshakeStatus {
    /// The handshake finished; the session is established.
    Complete,
    /// More ciphertext is needed before progress can be made.
    WantRead,
    /// The peer shut the connection down cleanly mid-handshake.
    Closed,
    /// The handshake failed.
    Failed(EngineError),
}

/// Outcome of one plaintext read.
#[derive(Debug)]
pub enum ReadStatus {
    /// `n` plaintext bytes were produced.
    Bytes(usize),
    /// No plaintext is available until more ciphertext arrives.
    WantRead,
    /// The peer closed the session cleanly.
    Eof,
    /// Record decoding failed.
    Failed(EngineError),
}

/// Outcome of one plaintext write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// `n` bytes were encrypted into the session output.
    Accepted(usize),
    /// The engine refused the write (a prior read hit a fatal record
    /// error); the session can no longer send.
    Rejected,
}

/// Outcome of one shutdown-driving call.
///
/// The original engine folded these states into `0/1/2/-1` return codes
/// with the blocking condition queried out of band; they are explicit
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
    /// Our close_notify is queued or flushed; the peer's has not arrived.
    Sent,
    /// Both directions are closed.
    Complete,
    /// Progress requires incoming bytes.
    WantRead,
    /// Shutdown failed; tear the session down.
    Failed,
}

/// Why certificate verification failed, as recorded by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyFailure {
    /// The certificate does not cover the requested server name.
    NameMismatch,
    /// Any other verification failure, with engine detail.
    Detail(String),
}

/// Cipher family, as far as record-overhead accounting cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    /// AES-GCM suites.
    AesGcm,
    /// ChaCha20-Poly1305 suites.
    Chacha20Poly1305,
    /// Anything else; latency optimization is disabled for these.
    Other,
}

/// The negotiated cipher suite, as exposed to callers and the governor.
#[derive(Debug, Clone)]
pub struct CipherInfo {
    /// IANA suite name, e.g. `TLS13_AES_128_GCM_SHA256`.
    pub name: String,
    /// Cipher strength in bits.
    pub bits: u16,
    /// Family used for record-overhead accounting.
    pub kind: CipherKind,
}

/// The black-box TLS engine interface.
///
/// Engines are synchronous: every call runs to completion against the
/// provided [`EngineIo`] and reports how it stopped. `Send` is required so
/// a live session can migrate between loops via export/import.
pub trait TlsEngine: Send {
    /// Drive the handshake (accept for servers, connect for clients).
    fn drive_handshake(&mut self, io: &mut dyn EngineIo) -> HandshakeStatus;

    /// Decrypt buffered records into `buf`.
    fn read(&mut self, io: &mut dyn EngineIo, buf: &mut [u8]) -> ReadStatus;

    /// Encrypt `data` as one record into the session output.
    fn write(&mut self, io: &mut dyn EngineIo, data: &[u8]) -> WriteStatus;

    /// Drive connection shutdown (close_notify exchange).
    fn shutdown(&mut self, io: &mut dyn EngineIo) -> ShutdownStatus;

    /// Decrypted bytes already buffered inside the engine.
    fn pending_plaintext(&self) -> usize;

    /// The negotiated cipher suite, once the handshake established one.
    fn cipher(&self) -> Option<CipherInfo>;

    /// The negotiated protocol version, e.g. `TLSv1.3`.
    fn protocol_version(&self) -> Option<&'static str>;

    /// The ALPN protocol selected during the handshake.
    fn selected_alpn(&self) -> Option<Vec<u8>>;

    /// The NPN protocol selected during the handshake, for engines that
    /// still implement it.
    fn selected_npn(&self) -> Option<Vec<u8>> {
        None
    }

    /// The peer's end-entity certificate, DER encoded.
    fn peer_certificate(&self) -> Option<Vec<u8>>;

    /// True if the handshake resumed a cached session.
    fn session_reused(&self) -> bool;

    /// Certificate-verification detail for a failed handshake, if the
    /// engine recorded one.
    fn verify_error(&self) -> Option<VerifyFailure>;
}
