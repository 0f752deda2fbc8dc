//! Evsock: a callback-driven, non-blocking socket layer with an
//! integrated TLS session.
//!
//! # Overview
//!
//! Evsock is the transport core under an HTTP/1.1 + HTTP/2 server: a
//! [`socket::Socket`] created by an event loop, carrying at most one
//! pending read and one pending write, with an optional TLS session that
//! handles handshake driving, record framing, latency-optimized record
//! sizing, and session-resumption coordination.
//!
//! The hard part of this crate is the TLS-over-non-blocking-socket
//! bridge: bytes arrive and leave through a loop that never blocks, while
//! the TLS engine reads and writes synchronously. The engine therefore
//! runs against a byte-queue adapter bound to per-session buffers, and
//! every suspension point lives in the pipelines above it:
//!
//! ```text
//! read:   loop ─▶ encrypted queue ─▶ adapter ─▶ engine ─▶ input ─▶ read cb
//! write:  iovecs ─▶ engine (record-sized) ─▶ adapter ─▶ output ─▶ loop ─▶ write cb
//! ```
//!
//! # Core Guarantees
//!
//! - **Never blocks**: the engine is fed from partially-filled buffers and
//!   signalled to retry; suspension happens only between loop callbacks.
//! - **One write, one read**: per socket, at most one of each is in
//!   flight, and a `write` call leaves the loop as a single contiguous
//!   transport write.
//! - **Suspendable handshakes**: a server handshake can park itself for an
//!   out-of-band session-cache lookup and resume with the ClientHello
//!   replayed into a fresh engine.
//! - **Clean teardown**: close interleaves the close_notify exchange with
//!   pending flights and disposes under any partial failure.
//! - **Live migration**: an established session (with buffered bytes in
//!   both stages) can move between loops via export/import.
//!
//! # Module Structure
//!
//! - [`socket`]: the socket core (pipelines, handshake driver, shutdown,
//!   export/import)
//! - [`engine`]: the TLS engine boundary and the rustls-backed engine
//! - [`context`]: TLS contexts, certificate identity, builders
//! - [`session`]: per-socket session state and the byte-queue adapter
//! - [`buffer`]: byte queues, buffer prototypes, the output accumulator
//! - [`governor`]: latency-optimized TLS record sizing
//! - [`backend`]: event-loop backends (virtual and system polling)
//! - [`resumption`]: process-wide async session-resumption callbacks
//! - [`alpn`]: ALPN wire parsing and server-preference selection
//! - [`addr`]: peer-address comparison and formatting helpers
//! - [`verify`]: certificate hostname validation
//! - [`error`]: stable error categories
//! - [`tracing_compat`]: feature-gated structured logging

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod addr;
pub mod alpn;
pub mod backend;
pub mod buffer;
pub mod context;
pub mod engine;
pub mod error;
pub mod governor;
pub mod resumption;
pub mod session;
pub mod socket;
pub mod tracing_compat;
pub mod verify;

// Re-exports for convenient access to the core types
pub use addr::{compare_address, numeric_host, port, PeerAddress};
pub use backend::{Backend, ImportError, SocketRef, TransportHandle, VirtualLoop};
pub use context::{
    Certificate, ClientContextBuilder, ContextError, EngineFactory, EngineRole, PrivateKey,
    ServerContextBuilder, SslContext,
};
pub use engine::{RustlsEngine, TlsEngine};
pub use error::{CallbackResult, SocketError};
pub use governor::{LatencyOptimizer, OptimizationMode, TcpSnapshot};
pub use resumption::{async_resumption_init, async_resumption_setup_ctx};
pub use session::{ResumptionCell, ResumptionPhase};
pub use socket::{ExportError, ReadEvent, Socket, SocketCallback, SocketExport};

#[cfg(unix)]
pub use backend::PollLoop;
