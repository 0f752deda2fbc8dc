#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use std::sync::{Arc, Once};

use parking_lot::Mutex;
use proptest::prelude::ProptestConfig;

use evsock::{Certificate, PrivateKey, SocketRef, SslContext, VirtualLoop};

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging once per process.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Proptest config with a fixed case count.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    ProptestConfig {
        cases,
        max_shrink_iters: 1024,
        ..ProptestConfig::default()
    }
}

/// A self-signed certificate and its PKCS#8 key.
pub struct TestIdentity {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

/// Generate a self-signed identity covering `name`.
#[must_use]
pub fn self_signed(name: &str) -> TestIdentity {
    let certified = rcgen::generate_simple_self_signed(vec![name.to_string()])
        .expect("certificate generation");
    TestIdentity {
        cert_der: certified.cert.der().as_ref().to_vec(),
        key_der: certified.key_pair.serialize_der(),
    }
}

/// Build a server context from `identity`, advertising `alpn`.
#[must_use]
pub fn server_context(identity: &TestIdentity, alpn: &[&str]) -> SslContext {
    SslContext::server_builder(
        vec![Certificate::from_der(identity.cert_der.clone())],
        PrivateKey::from_der(identity.key_der.clone()).expect("key"),
    )
    .alpn_protocols(alpn.iter().map(|p| p.as_bytes().to_vec()).collect())
    .build()
    .expect("server context")
}

/// Build a client context trusting `root`, offering `alpn`.
#[must_use]
pub fn client_context(root: &TestIdentity, alpn: &[&str]) -> SslContext {
    SslContext::client_builder()
        .add_root_certificate(Certificate::from_der(root.cert_der.clone()))
        .expect("trust root")
        .alpn_protocols(alpn.iter().map(|p| p.as_bytes().to_vec()).collect())
        .build()
        .expect("client context")
}

/// A shared slot for a callback result.
pub type ResultSlot = Arc<Mutex<Option<Result<(), evsock::SocketError>>>>;

/// A fresh, empty result slot.
#[must_use]
pub fn result_slot() -> ResultSlot {
    Arc::new(Mutex::new(None))
}

/// A callback that stores its result in `slot`.
pub fn store_result(
    slot: &ResultSlot,
) -> impl FnMut(&mut evsock::Socket, Result<(), evsock::SocketError>) + Send + 'static {
    let slot = Arc::clone(slot);
    move |_, result| {
        *slot.lock() = Some(result);
    }
}

/// Start a client/server handshake over one conduit and pump the loop to
/// quiescence. Returns `(server, client, server_result, client_result)`;
/// a suspended handshake leaves its slot unset.
pub fn handshake_pair(
    lp: &VirtualLoop,
    server_ctx: &SslContext,
    client_ctx: &SslContext,
    server_name: &str,
) -> (SocketRef, SocketRef, ResultSlot, ResultSlot) {
    let (server, client) = lp.socket_pair();
    let server_result = result_slot();
    let client_result = result_slot();
    server
        .borrow_mut()
        .ssl_handshake(server_ctx, None, store_result(&server_result))
        .expect("server handshake setup");
    client
        .borrow_mut()
        .ssl_handshake(client_ctx, Some(server_name), store_result(&client_result))
        .expect("client handshake setup");
    lp.pump();
    (server, client, server_result, client_result)
}
