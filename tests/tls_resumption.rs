//! Async session resumption: the suspend/replay state machine with a
//! scripted engine, and an end-to-end rustls resumption through an
//! external session cache.

mod common;

use std::sync::{Arc, Once};

use common::{client_context, handshake_pair, init_test_logging, self_signed, server_context};
use evsock::engine::{
    CipherInfo, CipherKind, EngineIo, HandshakeStatus, Pull, ReadStatus, ShutdownStatus,
    TlsEngine, VerifyFailure, WriteStatus,
};
use evsock::{
    async_resumption_init, async_resumption_setup_ctx, ContextError, EngineFactory, EngineRole,
    ResumptionCell, Socket, SslContext, VirtualLoop,
};
use parking_lot::Mutex;

// ---------------------------------------------------------------------
// Process-wide cache plumbing shared by every test in this binary
// ---------------------------------------------------------------------

static REGISTRY_INIT: Once = Once::new();

/// `(fd_token, session_id)` pairs seen by the get-async callback.
static LOOKUPS: Mutex<Vec<(u64, Vec<u8>)>> = Mutex::new(Vec::new());

/// The external session cache fed by the new/remove callbacks.
static CACHE: Mutex<Vec<(Vec<u8>, Vec<u8>)>> = Mutex::new(Vec::new());

fn ensure_registry() {
    REGISTRY_INIT.call_once(|| {
        async_resumption_init(
            Arc::new(|sock: &mut Socket, id: &[u8]| {
                LOOKUPS.lock().push((sock.fd_token(), id.to_vec()));
            }),
            Arc::new(|id: &[u8], data: &[u8]| {
                CACHE.lock().push((id.to_vec(), data.to_vec()));
            }),
            Arc::new(|id: &[u8]| {
                CACHE.lock().retain(|(key, _)| key != id);
            }),
        );
    });
}

fn cache_lookup(id: &[u8]) -> Option<Vec<u8>> {
    CACHE
        .lock()
        .iter()
        .find(|(key, _)| key == id)
        .map(|(_, data)| data.clone())
}

fn lookup_recorded(id: &[u8]) -> bool {
    LOOKUPS.lock().iter().any(|(_, seen)| seen == id)
}

// ---------------------------------------------------------------------
// Scripted engine
// ---------------------------------------------------------------------

struct ScriptedFactory {
    session_id: &'static [u8],
    log: Arc<Mutex<Vec<String>>>,
}

impl EngineFactory for ScriptedFactory {
    fn make_engine(
        &self,
        role: EngineRole<'_>,
        cell: Arc<ResumptionCell>,
    ) -> Result<Box<dyn TlsEngine>, ContextError> {
        assert!(matches!(role, EngineRole::Server));
        Ok(Box::new(ScriptedServerEngine {
            cell,
            session_id: self.session_id,
            log: Arc::clone(&self.log),
            hello: Vec::new(),
            reused: false,
            established: false,
        }))
    }

    fn has_async_lookup(&self) -> bool {
        true
    }
}

/// A server engine that asks for a session once and accepts on replay.
struct ScriptedServerEngine {
    cell: Arc<ResumptionCell>,
    session_id: &'static [u8],
    log: Arc<Mutex<Vec<String>>>,
    hello: Vec<u8>,
    reused: bool,
    established: bool,
}

impl ScriptedServerEngine {
    fn pull_all(&mut self, io: &mut dyn EngineIo) -> Option<HandshakeStatus> {
        let mut chunk = [0u8; 4096];
        loop {
            match io.pull(&mut chunk) {
                Pull::Bytes(n) => self.hello.extend_from_slice(&chunk[..n]),
                Pull::Empty => return None,
                Pull::Eof => return Some(HandshakeStatus::Closed),
            }
        }
    }
}

impl TlsEngine for ScriptedServerEngine {
    fn drive_handshake(&mut self, io: &mut dyn EngineIo) -> HandshakeStatus {
        if let Some(status) = self.pull_all(io) {
            return status;
        }
        if self.hello.is_empty() {
            return HandshakeStatus::WantRead;
        }
        if self.cell.begin_async_lookup(self.session_id) {
            self.log.lock().push(format!("lookup:{}", self.hello.len()));
            // The session store answer is pending; this accept would block.
            return HandshakeStatus::WantRead;
        }
        self.reused = self.cell.cached_session().is_some();
        self.log
            .lock()
            .push(format!("accept:{}:{}", self.hello.len(), self.reused));
        let _ = io.push(b"FLIGHT");
        self.established = true;
        HandshakeStatus::Complete
    }

    fn read(&mut self, _io: &mut dyn EngineIo, _buf: &mut [u8]) -> ReadStatus {
        ReadStatus::WantRead
    }

    fn write(&mut self, io: &mut dyn EngineIo, data: &[u8]) -> WriteStatus {
        match io.push(data) {
            Ok(n) => WriteStatus::Accepted(n),
            Err(_) => WriteStatus::Rejected,
        }
    }

    fn shutdown(&mut self, _io: &mut dyn EngineIo) -> ShutdownStatus {
        ShutdownStatus::Complete
    }

    fn pending_plaintext(&self) -> usize {
        0
    }

    fn cipher(&self) -> Option<CipherInfo> {
        self.established.then(|| CipherInfo {
            name: "SCRIPTED_AES_128_GCM".into(),
            bits: 128,
            kind: CipherKind::AesGcm,
        })
    }

    fn protocol_version(&self) -> Option<&'static str> {
        self.established.then_some("TLSv1.3")
    }

    fn selected_alpn(&self) -> Option<Vec<u8>> {
        None
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        None
    }

    fn session_reused(&self) -> bool {
        self.reused
    }

    fn verify_error(&self) -> Option<VerifyFailure> {
        None
    }
}

// ---------------------------------------------------------------------
// Scripted state-machine scenarios
// ---------------------------------------------------------------------

#[test]
fn suspended_handshake_replays_first_input_and_resumes() {
    init_test_logging();
    ensure_registry();

    let log = Arc::new(Mutex::new(Vec::new()));
    let ctx = SslContext::scripted(Arc::new(ScriptedFactory {
        session_id: b"scripted-session-a",
        log: Arc::clone(&log),
    }));

    let lp = VirtualLoop::new();
    let (server, peer) = lp.pair();
    let result = common::result_slot();
    server
        .borrow_mut()
        .ssl_handshake(&ctx, None, common::store_result(&result))
        .expect("handshake setup");

    // A 700-byte ClientHello triggers the recorded async lookup.
    let hello = vec![0x16u8; 700];
    peer.send(&hello);
    lp.pump();

    assert!(lookup_recorded(b"scripted-session-a"));
    assert_eq!(result.lock().clone(), None, "handshake must stay suspended");
    assert_eq!(log.lock().as_slice(), &["lookup:700".to_string()]);

    // The external cache answers; the replayed input reaches a fresh
    // engine and the handshake completes as a resumed session.
    server
        .borrow_mut()
        .ssl_resume_server_handshake(b"scripted-blob");
    lp.pump();

    assert_eq!(result.lock().clone(), Some(Ok(())));
    assert_eq!(
        log.lock().as_slice(),
        &["lookup:700".to_string(), "accept:700:true".to_string()]
    );
    assert_eq!(peer.drain(), b"FLIGHT");
    assert_eq!(server.borrow().ssl_get_session_reused(), Some(true));
    assert_eq!(server.borrow().ssl_get_cipher_bits(), 128);
}

#[test]
fn oversized_first_input_suppresses_async_lookup() {
    init_test_logging();
    ensure_registry();

    let log = Arc::new(Mutex::new(Vec::new()));
    let ctx = SslContext::scripted(Arc::new(ScriptedFactory {
        session_id: b"scripted-session-b",
        log: Arc::clone(&log),
    }));

    let lp = VirtualLoop::new();
    let (server, peer) = lp.pair();
    let result = common::result_slot();
    server
        .borrow_mut()
        .ssl_handshake(&ctx, None, common::store_result(&result))
        .expect("handshake setup");

    // More than the 1024-byte replay limit: the async-lookup
    // opportunity is forfeited and the handshake runs straight through.
    peer.send(&vec![0x16u8; 1500]);
    lp.pump();

    assert_eq!(result.lock().clone(), Some(Ok(())));
    assert!(!lookup_recorded(b"scripted-session-b"));
    assert_eq!(log.lock().as_slice(), &["accept:1500:false".to_string()]);
    assert_eq!(server.borrow().ssl_get_session_reused(), Some(false));
}

#[test]
fn empty_cache_answer_falls_back_to_full_handshake() {
    init_test_logging();
    ensure_registry();

    let log = Arc::new(Mutex::new(Vec::new()));
    let ctx = SslContext::scripted(Arc::new(ScriptedFactory {
        session_id: b"scripted-session-c",
        log: Arc::clone(&log),
    }));

    let lp = VirtualLoop::new();
    let (server, peer) = lp.pair();
    let result = common::result_slot();
    server
        .borrow_mut()
        .ssl_handshake(&ctx, None, common::store_result(&result))
        .expect("handshake setup");
    peer.send(&[0x16u8; 400]);
    lp.pump();
    assert!(lookup_recorded(b"scripted-session-c"));

    // "Not found": resume with an empty blob.
    server.borrow_mut().ssl_resume_server_handshake(b"");
    lp.pump();

    assert_eq!(result.lock().clone(), Some(Ok(())));
    assert_eq!(
        log.lock().as_slice(),
        &["lookup:400".to_string(), "accept:400:false".to_string()]
    );
    assert_eq!(server.borrow().ssl_get_session_reused(), Some(false));
}

// ---------------------------------------------------------------------
// End-to-end rustls resumption
// ---------------------------------------------------------------------

#[test]
fn rustls_session_resumes_through_the_external_cache() {
    init_test_logging();
    ensure_registry();

    let identity = self_signed("resume.test");
    let lp = VirtualLoop::new();
    let server_ctx = server_context(&identity, &[]);
    async_resumption_setup_ctx(&server_ctx);
    let client_ctx = client_context(&identity, &[]);

    // Connection 1: full handshake; the server publishes sessions to the
    // external cache through the new-session callback.
    let (s1, c1, sr1, cr1) = handshake_pair(&lp, &server_ctx, &client_ctx, "resume.test");
    assert_eq!(sr1.lock().clone(), Some(Ok(())));
    assert_eq!(cr1.lock().clone(), Some(Ok(())));
    assert_eq!(s1.borrow().ssl_get_session_reused(), Some(false));
    assert!(!CACHE.lock().is_empty(), "server published no sessions");

    // Let the client digest the post-handshake tickets, then part ways.
    c1.borrow_mut().read_start(|_, _| {});
    lp.pump();
    c1.borrow_mut().close();
    s1.borrow_mut().close();
    lp.pump();

    // Connection 2: the same client config offers the cached session; the
    // server suspends for the external lookup.
    let (s2, _c2, sr2, cr2) = handshake_pair(&lp, &server_ctx, &client_ctx, "resume.test");
    assert_eq!(sr2.lock().clone(), None, "server must be suspended");

    let blob = LOOKUPS
        .lock()
        .iter()
        .rev()
        .find_map(|(_, id)| cache_lookup(id))
        .expect("a cached session was looked up");
    s2.borrow_mut().ssl_resume_server_handshake(&blob);
    lp.pump();

    assert_eq!(sr2.lock().clone(), Some(Ok(())));
    assert_eq!(cr2.lock().clone(), Some(Ok(())));
    assert_eq!(s2.borrow().ssl_get_session_reused(), Some(true));
}
