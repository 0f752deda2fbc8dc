//! Event-loop backends.
//!
//! A socket never owns its transport; it drives the seven backend
//! operations of the [`Backend`] trait and receives bytes and write
//! completions from the loop that created it. Two loop implementations
//! exist:
//!
//! | Loop | Module | Use |
//! |------|--------|-----|
//! | [`VirtualLoop`] | `virt` | Deterministic in-memory conduits for tests and lab runs |
//! | [`PollLoop`] | `poll` | Readiness polling over non-blocking system sockets |
//!
//! Both loops are single-threaded and cooperative: every callback runs to
//! completion, and a socket suspends only between loop turns.

pub mod virt;

#[cfg(unix)]
pub mod poll;

pub use virt::{PeerHandle, VirtualLoop};

#[cfg(unix)]
pub use poll::PollLoop;

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;

use crate::addr::PeerAddress;
use crate::error::SocketError;
use crate::governor::TcpSnapshot;
use crate::socket::Socket;

/// Shared handle to a socket owned by an event loop.
///
/// Loops are single-threaded; the handle is not `Send`. Inside a socket
/// callback, use the `&mut Socket` argument rather than re-borrowing the
/// handle.
pub type SocketRef = Rc<RefCell<Socket>>;

/// Why an import was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportError {
    /// The export record came from a different kind of loop; the record
    /// is consumed and its transport closed.
    WrongLoop,
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WrongLoop => f.write_str("import refused: record from a different loop kind"),
        }
    }
}

impl std::error::Error for ImportError {}

/// Opaque transport payload carried by an export record between loops.
///
/// Each loop implementation downcasts the payloads it produced; handing a
/// payload to a different loop kind fails the import.
pub type TransportHandle = Box<dyn Any + Send>;

/// The per-socket interface to the owning event loop.
pub trait Backend {
    /// Start delivering read events to the socket.
    fn start_read(&mut self);

    /// Stop delivering read events. Idempotent and immediate.
    fn stop_read(&mut self);

    /// Queue `bufs` as one contiguous transport write. A write completion
    /// is signalled even when `bufs` is empty, on the next loop turn.
    fn queue_write(&mut self, bufs: Vec<Bytes>);

    /// Detach the socket from the loop and release the transport.
    fn dispose(&mut self);

    /// Detach the transport for migration to another loop.
    ///
    /// # Errors
    ///
    /// Fails when the transport cannot leave this loop.
    fn export(&mut self) -> Result<TransportHandle, SocketError>;

    /// The peer's address, fetched from the transport.
    fn peername(&mut self) -> Option<PeerAddress>;

    /// A live congestion snapshot, where the transport can provide one.
    fn tcp_snapshot(&mut self) -> Option<TcpSnapshot>;

    /// Ask the transport to signal write completion only once little
    /// unsent data remains (the `TCP_NOTSENT_LOWAT` analogue). Returns
    /// whether the transport honors it.
    fn enable_partial_write_notify(&mut self) -> bool;

    /// The socket's file-descriptor identity within its loop.
    fn fd_token(&self) -> u64;
}
