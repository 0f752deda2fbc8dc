//! Process-wide async session-resumption callbacks.
//!
//! External session caches (possibly remote) integrate through three
//! process-wide callbacks installed once, before any context registers
//! them:
//!
//! - `get_async(socket, session_id)` — start an external lookup; the
//!   handshake stays suspended until
//!   [`Socket::ssl_resume_server_handshake`] delivers the result.
//! - `new(session_id, session_data)` — a fresh session was issued.
//! - `remove(session_id)` — a session was invalidated or consumed.
//!
//! Session data crossing this boundary is the engine's canonical
//! serialized session blob; only the session id identifies it externally.
//!
//! [`Socket::ssl_resume_server_handshake`]: crate::socket::Socket::ssl_resume_server_handshake

use std::sync::{Arc, OnceLock};

use crate::context::SslContext;
use crate::socket::Socket;

/// Starts an external session lookup for the given session id.
pub type GetAsyncCallback = Arc<dyn Fn(&mut Socket, &[u8]) + Send + Sync>;

/// Observes a freshly issued session `(id, data)`.
pub type NewCallback = Arc<dyn Fn(&[u8], &[u8]) + Send + Sync>;

/// Observes an invalidated session id.
pub type RemoveCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// The installed callback set.
pub(crate) struct ResumptionCallbacks {
    pub(crate) get_async: GetAsyncCallback,
    pub(crate) new: NewCallback,
    pub(crate) remove: RemoveCallback,
}

static REGISTRY: OnceLock<ResumptionCallbacks> = OnceLock::new();

/// Install the process-wide resumption callbacks.
///
/// # Panics
///
/// Panics on reinitialization; the callbacks are process-global
/// configuration and must be installed exactly once, before any context
/// registers them.
pub fn async_resumption_init(
    get_async: GetAsyncCallback,
    new: NewCallback,
    remove: RemoveCallback,
) {
    let installed = REGISTRY
        .set(ResumptionCallbacks {
            get_async,
            new,
            remove,
        })
        .is_ok();
    assert!(
        installed,
        "async resumption callbacks are already installed"
    );
}

/// Wire the installed callbacks into a TLS context's session-cache hooks.
///
/// Server sockets created from `ctx` afterwards will suspend their
/// handshakes for external lookups.
pub fn async_resumption_setup_ctx(ctx: &SslContext) {
    ctx.enable_resumption_hooks();
}

pub(crate) fn installed() -> Option<&'static ResumptionCallbacks> {
    REGISTRY.get()
}
