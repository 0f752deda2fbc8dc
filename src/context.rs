//! TLS contexts: certificate identity, configuration builders, and engine
//! construction.
//!
//! A [`SslContext`] is the long-lived, shareable configuration a socket's
//! TLS session is created from. Server and client contexts wrap rustls
//! configs; scripted contexts build engines from a caller-supplied
//! factory, which is how tests drive the handshake machinery without real
//! cryptography.
//!
//! Cloning a context is cheap (`Arc`-based); sessions keep a clone so the
//! handshake driver can rebuild the engine after an async-resumption
//! suspension.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::StoresServerSessions;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::engine::rustls::{AsyncSessionStore, RustlsEngine};
use crate::engine::TlsEngine;
use crate::session::ResumptionCell;

/// Error raised while building a context or creating an engine from one.
#[derive(Debug)]
pub enum ContextError {
    /// The server name is not a valid DNS name.
    InvalidDnsName(String),
    /// Certificate or key material could not be loaded.
    Certificate(String),
    /// The TLS configuration was rejected.
    Configuration(String),
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDnsName(name) => write!(f, "invalid DNS name: {name}"),
            Self::Certificate(msg) => write!(f, "certificate error: {msg}"),
            Self::Configuration(msg) => write!(f, "TLS configuration error: {msg}"),
        }
    }
}

impl std::error::Error for ContextError {}

/// A DER-encoded X.509 certificate.
#[derive(Clone, Debug)]
pub struct Certificate {
    inner: CertificateDer<'static>,
}

impl Certificate {
    /// Wrap DER-encoded bytes.
    #[must_use]
    pub fn from_der(der: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: CertificateDer::from(der.into()),
        }
    }

    /// Parse every certificate in a PEM document.
    ///
    /// # Errors
    ///
    /// Fails when the document contains no certificate or is malformed.
    pub fn from_pem(pem: &[u8]) -> Result<Vec<Self>, ContextError> {
        let mut reader = std::io::BufReader::new(pem);
        let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ContextError::Certificate(e.to_string()))?;
        if certs.is_empty() {
            return Err(ContextError::Certificate(
                "no certificates found in PEM".into(),
            ));
        }
        Ok(certs.into_iter().map(|inner| Self { inner }).collect())
    }

    /// Load certificates from a PEM file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or parsed.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Vec<Self>, ContextError> {
        let pem = std::fs::read(path.as_ref())
            .map_err(|e| ContextError::Certificate(format!("reading file: {e}")))?;
        Self::from_pem(&pem)
    }

    /// The raw DER bytes.
    #[must_use]
    pub fn as_der(&self) -> &[u8] {
        self.inner.as_ref()
    }

    fn into_inner(self) -> CertificateDer<'static> {
        self.inner
    }
}

/// A private key in PKCS#8, PKCS#1, or SEC1 DER form.
#[derive(Debug)]
pub struct PrivateKey {
    inner: PrivateKeyDer<'static>,
}

impl PrivateKey {
    /// Wrap a PKCS#8 DER key.
    ///
    /// # Errors
    ///
    /// Fails when the bytes are not a recognized key encoding.
    pub fn from_der(der: Vec<u8>) -> Result<Self, ContextError> {
        let inner = PrivateKeyDer::try_from(der.as_slice())
            .map_err(|e| ContextError::Certificate(format!("unrecognized key encoding: {e}")))?
            .clone_key();
        Ok(Self { inner })
    }

    /// Parse the first private key in a PEM document.
    ///
    /// # Errors
    ///
    /// Fails when the document contains no private key.
    pub fn from_pem(pem: &[u8]) -> Result<Self, ContextError> {
        let mut reader = std::io::BufReader::new(pem);
        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| ContextError::Certificate(e.to_string()))?
            .ok_or_else(|| ContextError::Certificate("no private key found in PEM".into()))?;
        Ok(Self { inner: key })
    }

    /// Load a private key from a PEM file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or parsed.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, ContextError> {
        let pem = std::fs::read(path.as_ref())
            .map_err(|e| ContextError::Certificate(format!("reading file: {e}")))?;
        Self::from_pem(&pem)
    }

    fn into_inner(self) -> PrivateKeyDer<'static> {
        self.inner
    }
}

/// Engine role requested from an [`EngineFactory`].
#[derive(Debug, Clone, Copy)]
pub enum EngineRole<'a> {
    /// Server side.
    Server,
    /// Client side, connecting to `server_name`.
    Client {
        /// Peer hostname for SNI.
        server_name: &'a str,
    },
}

/// Builds TLS engines for scripted contexts.
///
/// Production code uses rustls-backed contexts; tests implement this trait
/// to drive the socket core with deterministic engines.
pub trait EngineFactory: Send + Sync {
    /// Build an engine for the given role.
    ///
    /// The `cell` is the session's async-resumption state; server engines
    /// that want to exercise the suspension path call
    /// [`ResumptionCell::begin_async_lookup`] from their accept step.
    ///
    /// # Errors
    ///
    /// Implementations may reject a role or server name.
    fn make_engine(
        &self,
        role: EngineRole<'_>,
        cell: Arc<ResumptionCell>,
    ) -> Result<Box<dyn TlsEngine>, ContextError>;

    /// True if server sessions from this factory may suspend for an
    /// external session lookup.
    fn has_async_lookup(&self) -> bool {
        false
    }
}

enum ContextInner {
    Server {
        config: Arc<ServerConfig>,
        /// Registered ALPN list; the engine's accept path selects from it
        /// per connection.
        protocols: Vec<Vec<u8>>,
        resumption_hooks: AtomicBool,
    },
    Client {
        config: Arc<ClientConfig>,
    },
    Scripted(Arc<dyn EngineFactory>),
}

/// A shareable TLS context.
#[derive(Clone)]
pub struct SslContext {
    inner: Arc<ContextInner>,
}

impl SslContext {
    /// Start building a server context.
    #[must_use]
    pub fn server_builder(chain: Vec<Certificate>, key: PrivateKey) -> ServerContextBuilder {
        ServerContextBuilder::new(chain, key)
    }

    /// Start building a client context.
    #[must_use]
    pub fn client_builder() -> ClientContextBuilder {
        ClientContextBuilder::new()
    }

    /// Wrap a prebuilt rustls server config. ALPN negotiation is whatever
    /// the config itself carries; to register a protocol list with
    /// server-preference selection, use [`Self::server_builder`].
    #[must_use]
    pub fn from_server_config(config: ServerConfig) -> Self {
        Self::server_with_protocols(config, Vec::new())
    }

    fn server_with_protocols(config: ServerConfig, protocols: Vec<Vec<u8>>) -> Self {
        Self {
            inner: Arc::new(ContextInner::Server {
                config: Arc::new(config),
                protocols,
                resumption_hooks: AtomicBool::new(false),
            }),
        }
    }

    /// Wrap a prebuilt rustls client config.
    #[must_use]
    pub fn from_client_config(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ContextInner::Client {
                config: Arc::new(config),
            }),
        }
    }

    /// A context that builds engines from the given factory.
    #[must_use]
    pub fn scripted(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            inner: Arc::new(ContextInner::Scripted(factory)),
        }
    }

    /// True if server handshakes from this context may suspend for an
    /// external session lookup.
    #[must_use]
    pub fn has_async_lookup(&self) -> bool {
        match &*self.inner {
            ContextInner::Server {
                resumption_hooks, ..
            } => resumption_hooks.load(Ordering::Relaxed),
            ContextInner::Client { .. } => false,
            ContextInner::Scripted(factory) => factory.has_async_lookup(),
        }
    }

    pub(crate) fn enable_resumption_hooks(&self) {
        if let ContextInner::Server {
            resumption_hooks, ..
        } = &*self.inner
        {
            resumption_hooks.store(true, Ordering::Relaxed);
        }
    }

    /// Build an engine for one session.
    ///
    /// `server_name` selects the role: `None` is a server, `Some` a client
    /// connecting to that name.
    ///
    /// # Errors
    ///
    /// Fails on role mismatch or an invalid server name.
    pub(crate) fn new_engine(
        &self,
        server_name: Option<&str>,
        cell: Arc<ResumptionCell>,
    ) -> Result<Box<dyn TlsEngine>, ContextError> {
        match (&*self.inner, server_name) {
            (
                ContextInner::Server {
                    config,
                    protocols,
                    resumption_hooks,
                },
                None,
            ) => {
                // The store shim is per-session state; the engine carries
                // it into the per-connection config it builds at accept
                // time, alongside the ALPN verdict.
                let store = resumption_hooks.load(Ordering::Relaxed).then(|| {
                    Arc::new(AsyncSessionStore::new(cell)) as Arc<dyn StoresServerSessions>
                });
                Ok(Box::new(RustlsEngine::server_with(
                    Arc::clone(config),
                    protocols.clone(),
                    store,
                )))
            }
            (ContextInner::Client { config }, Some(name)) => {
                let server_name = ServerName::try_from(name.to_string())
                    .map_err(|_| ContextError::InvalidDnsName(name.to_string()))?;
                Ok(Box::new(RustlsEngine::client(
                    Arc::clone(config),
                    server_name,
                )?))
            }
            (ContextInner::Scripted(factory), name) => {
                let role = match name {
                    None => EngineRole::Server,
                    Some(server_name) => EngineRole::Client { server_name },
                };
                factory.make_engine(role, cell)
            }
            (ContextInner::Server { .. }, Some(_)) => Err(ContextError::Configuration(
                "server context cannot open client sessions".into(),
            )),
            (ContextInner::Client { .. }, None) => Err(ContextError::Configuration(
                "client context cannot accept server sessions".into(),
            )),
        }
    }
}

impl fmt::Debug for SslContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &*self.inner {
            ContextInner::Server { .. } => "server",
            ContextInner::Client { .. } => "client",
            ContextInner::Scripted(_) => "scripted",
        };
        f.debug_struct("SslContext").field("kind", &kind).finish()
    }
}

/// Builder for server contexts.
pub struct ServerContextBuilder {
    chain: Vec<Certificate>,
    key: PrivateKey,
    alpn_protocols: Vec<Vec<u8>>,
}

impl ServerContextBuilder {
    /// A builder holding the server's certificate chain and private key.
    #[must_use]
    pub fn new(chain: Vec<Certificate>, key: PrivateKey) -> Self {
        Self {
            chain,
            key,
            alpn_protocols: Vec::new(),
        }
    }

    /// Register the server's ALPN protocols, most preferred first. The
    /// handshake selects the first of these that appears anywhere in the
    /// client's offer.
    #[must_use]
    pub fn alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    /// Convenience: HTTP/2 preferred over HTTP/1.1.
    #[must_use]
    pub fn alpn_http(self) -> Self {
        self.alpn_protocols(vec![b"h2".to_vec(), b"http/1.1".to_vec()])
    }

    /// Build the context.
    ///
    /// The registered ALPN list stays on the context: the engine judges
    /// each connection's offer against it during the accept, so a client
    /// offering nothing acceptable still completes the handshake without
    /// a protocol.
    ///
    /// # Errors
    ///
    /// Fails when the certificate/key pair is rejected.
    pub fn build(self) -> Result<SslContext, ContextError> {
        use rustls::crypto::ring::default_provider;

        let builder = ServerConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| ContextError::Configuration(e.to_string()))?
            .with_no_client_auth();

        let chain = self.chain.into_iter().map(Certificate::into_inner).collect();
        let config = builder
            .with_single_cert(chain, self.key.into_inner())
            .map_err(|e| ContextError::Configuration(e.to_string()))?;

        Ok(SslContext::server_with_protocols(config, self.alpn_protocols))
    }
}

/// Builder for client contexts.
pub struct ClientContextBuilder {
    roots: RootCertStore,
    alpn_protocols: Vec<Vec<u8>>,
    enable_sni: bool,
}

impl Default for ClientContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientContextBuilder {
    /// An empty builder; add at least one root before building.
    #[must_use]
    pub fn new() -> Self {
        Self {
            roots: RootCertStore::empty(),
            alpn_protocols: Vec::new(),
            enable_sni: true,
        }
    }

    /// Trust `cert` as a root.
    ///
    /// # Errors
    ///
    /// Fails when the certificate cannot be parsed as a trust anchor.
    pub fn add_root_certificate(mut self, cert: Certificate) -> Result<Self, ContextError> {
        self.roots
            .add(cert.into_inner())
            .map_err(|e| ContextError::Certificate(e.to_string()))?;
        Ok(self)
    }

    /// The ordered ALPN offer sent to servers.
    #[must_use]
    pub fn alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    /// Enable or disable SNI (on by default).
    #[must_use]
    pub fn enable_sni(mut self, enable: bool) -> Self {
        self.enable_sni = enable;
        self
    }

    /// Build the context.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is rejected.
    pub fn build(self) -> Result<SslContext, ContextError> {
        use rustls::crypto::ring::default_provider;

        let builder = ClientConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| ContextError::Configuration(e.to_string()))?
            .with_root_certificates(self.roots);

        let mut config = builder.with_no_client_auth();
        if !self.alpn_protocols.is_empty() {
            config.alpn_protocols = self.alpn_protocols;
        }
        config.enable_sni = self.enable_sni;

        Ok(SslContext::from_client_config(config))
    }
}
