//! Deterministic in-memory event loop.
//!
//! [`VirtualLoop`] drives sockets over in-memory byte conduits instead of
//! real transports. Each conduit has two directed queues; the loop pumps
//! deliveries and write completions in token order under an explicit
//! [`VirtualLoop::step`], so multi-socket interleavings are reproducible.
//!
//! Congestion snapshots and the partial-write-notification capability are
//! scripted per socket, which is how the record-size governor is exercised
//! deterministically.
//!
//! A conduit's far end is either another socket ([`VirtualLoop::socket_pair`])
//! or a wire-level [`PeerHandle`] ([`VirtualLoop::pair`]) that scripts and
//! observes raw bytes.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{Backend, ImportError, SocketRef, TransportHandle};
use crate::addr::PeerAddress;
use crate::error::SocketError;
use crate::governor::TcpSnapshot;
use crate::socket::{ReadEvent, Socket, SocketExport};
use crate::tracing_compat::trace;

/// Iteration bound for [`VirtualLoop::pump`]; hitting it means a callback
/// cycle is feeding itself forever.
const PUMP_LIMIT: usize = 10_000;

#[derive(Debug, Default)]
struct Direction {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// One in-memory duplex wire. Shared (and `Send`) so an exported end can
/// cross threads with its socket.
#[derive(Debug, Default)]
struct Conduit {
    a_to_b: Mutex<Direction>,
    b_to_a: Mutex<Direction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    A,
    B,
}

impl Conduit {
    fn incoming(&self, side: Side) -> &Mutex<Direction> {
        match side {
            Side::A => &self.b_to_a,
            Side::B => &self.a_to_b,
        }
    }

    fn outgoing(&self, side: Side) -> &Mutex<Direction> {
        match side {
            Side::A => &self.a_to_b,
            Side::B => &self.b_to_a,
        }
    }
}

/// Export payload produced by this loop: one end of a conduit.
///
/// Dropping an end that was never re-attached closes the wire, the same
/// way disposing an unimported export record closes its descriptor.
struct ConduitEnd {
    conduit: Arc<Conduit>,
    side: Side,
    detached: bool,
}

impl ConduitEnd {
    fn into_parts(mut self) -> (Arc<Conduit>, Side) {
        self.detached = true;
        (Arc::clone(&self.conduit), self.side)
    }
}

impl Drop for ConduitEnd {
    fn drop(&mut self) {
        if !self.detached {
            self.conduit.outgoing(self.side).lock().closed = true;
            self.conduit.incoming(self.side).lock().closed = true;
        }
    }
}

/// The scripted far end of a conduit.
pub struct PeerHandle {
    conduit: Arc<Conduit>,
    side: Side,
}

impl PeerHandle {
    /// Push raw bytes toward the socket.
    pub fn send(&self, data: &[u8]) {
        self.conduit.outgoing(self.side).lock().bytes.extend(data);
    }

    /// Take every byte the socket has written so far.
    pub fn drain(&self) -> Vec<u8> {
        let mut dir = self.conduit.incoming(self.side).lock();
        dir.bytes.drain(..).collect()
    }

    /// Close the wire in both directions: the socket sees EOF on read and
    /// failed completions on write.
    pub fn close(&self) {
        self.conduit.outgoing(self.side).lock().closed = true;
        self.conduit.incoming(self.side).lock().closed = true;
    }

    /// True once the socket side closed its write direction.
    #[must_use]
    pub fn peer_closed(&self) -> bool {
        self.conduit.incoming(self.side).lock().closed
    }
}

struct Slot {
    socket: Weak<RefCell<Socket>>,
    conduit: Arc<Conduit>,
    side: Side,
    reading: bool,
    eof_delivered: bool,
    pending_completions: VecDeque<Option<SocketError>>,
    snapshot: Option<TcpSnapshot>,
    notify_supported: bool,
    peer_addr: Option<PeerAddress>,
}

struct LoopInner {
    slots: HashMap<u64, Slot>,
    next_token: u64,
}

/// A deterministic, single-threaded in-memory loop.
pub struct VirtualLoop {
    inner: Rc<RefCell<LoopInner>>,
}

impl Default for VirtualLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualLoop {
    /// A fresh loop with no sockets.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(LoopInner {
                slots: HashMap::new(),
                next_token: 1,
            })),
        }
    }

    /// A socket wired to a scripted peer.
    #[must_use]
    pub fn pair(&self) -> (SocketRef, PeerHandle) {
        let conduit = Arc::new(Conduit::default());
        let socket = self.attach(Arc::clone(&conduit), Side::A);
        let peer = PeerHandle {
            conduit,
            side: Side::B,
        };
        (socket, peer)
    }

    /// Two sockets wired to each other.
    #[must_use]
    pub fn socket_pair(&self) -> (SocketRef, SocketRef) {
        let conduit = Arc::new(Conduit::default());
        let a = self.attach(Arc::clone(&conduit), Side::A);
        let b = self.attach(conduit, Side::B);
        (a, b)
    }

    fn attach(&self, conduit: Arc<Conduit>, side: Side) -> SocketRef {
        let backend = VirtualBackend {
            inner: Rc::downgrade(&self.inner),
            token: 0,
        };
        self.attach_with(conduit, side, |b| Socket::new(Box::new(b)), backend)
    }

    fn attach_with(
        &self,
        conduit: Arc<Conduit>,
        side: Side,
        build: impl FnOnce(VirtualBackend) -> Socket,
        mut backend: VirtualBackend,
    ) -> SocketRef {
        let token = {
            let mut inner = self.inner.borrow_mut();
            let token = inner.next_token;
            inner.next_token += 1;
            token
        };
        backend.token = token;
        let socket = Rc::new(RefCell::new(build(backend)));
        self.inner.borrow_mut().slots.insert(
            token,
            Slot {
                socket: Rc::downgrade(&socket),
                conduit,
                side,
                reading: false,
                eof_delivered: false,
                pending_completions: VecDeque::new(),
                snapshot: None,
                notify_supported: true,
                peer_addr: None,
            },
        );
        socket
    }

    /// Import a socket exported from another `VirtualLoop`.
    ///
    /// # Errors
    ///
    /// [`ImportError::WrongLoop`] when the record's transport did not come
    /// from a virtual loop.
    pub fn import(&self, export: SocketExport) -> Result<SocketRef, ImportError> {
        let SocketExport {
            handle, input, ssl, ..
        } = export;
        let end = handle
            .downcast::<ConduitEnd>()
            .map_err(|_| ImportError::WrongLoop)?;
        let (conduit, side) = end.into_parts();
        let backend = VirtualBackend {
            inner: Rc::downgrade(&self.inner),
            token: 0,
        };
        Ok(self.attach_with(
            conduit,
            side,
            move |b| Socket::from_import(Box::new(b), input, ssl),
            backend,
        ))
    }

    /// Script the congestion snapshot returned to `sock`'s governor.
    pub fn set_tcp_snapshot(&self, sock: &SocketRef, snapshot: Option<TcpSnapshot>) {
        let token = sock.borrow().fd_token();
        if let Some(slot) = self.inner.borrow_mut().slots.get_mut(&token) {
            slot.snapshot = snapshot;
        }
    }

    /// Script whether `sock`'s transport honors partial-write
    /// notification (default: yes).
    pub fn set_partial_write_notify_supported(&self, sock: &SocketRef, supported: bool) {
        let token = sock.borrow().fd_token();
        if let Some(slot) = self.inner.borrow_mut().slots.get_mut(&token) {
            slot.notify_supported = supported;
        }
    }

    /// Script the peer address reported for `sock`.
    pub fn set_peer_addr(&self, sock: &SocketRef, addr: PeerAddress) {
        let token = sock.borrow().fd_token();
        if let Some(slot) = self.inner.borrow_mut().slots.get_mut(&token) {
            slot.peer_addr = Some(addr);
        }
    }

    /// Run one loop turn: deliver queued write completions, then reads, in
    /// token order. Returns whether anything was delivered.
    pub fn step(&self) -> bool {
        enum WorkItem {
            WriteDone(Option<SocketError>),
            Deliver(Vec<u8>),
            Eof,
        }

        let work: Vec<(SocketRef, WorkItem)> = {
            let mut inner = self.inner.borrow_mut();
            let mut tokens: Vec<u64> = inner.slots.keys().copied().collect();
            tokens.sort_unstable();

            let mut work = Vec::new();
            for token in tokens {
                let Some(slot) = inner.slots.get_mut(&token) else {
                    continue;
                };
                let Some(socket) = slot.socket.upgrade() else {
                    inner.slots.remove(&token);
                    continue;
                };
                while let Some(err) = slot.pending_completions.pop_front() {
                    work.push((Rc::clone(&socket), WorkItem::WriteDone(err)));
                }
                if slot.reading {
                    let (data, at_eof) = {
                        let mut dir = slot.conduit.incoming(slot.side).lock();
                        let data: Vec<u8> = dir.bytes.drain(..).collect();
                        (data, dir.closed)
                    };
                    if !data.is_empty() {
                        work.push((Rc::clone(&socket), WorkItem::Deliver(data)));
                    } else if at_eof && !slot.eof_delivered {
                        slot.eof_delivered = true;
                        work.push((socket, WorkItem::Eof));
                    }
                }
            }
            work
        };

        let progressed = !work.is_empty();
        for (socket, item) in work {
            match item {
                WorkItem::WriteDone(err) => socket.borrow_mut().notify_write_done(err),
                WorkItem::Deliver(data) => {
                    trace!(bytes = data.len(), "virtual delivery");
                    socket.borrow_mut().notify_read(ReadEvent::Data(&data));
                }
                WorkItem::Eof => socket.borrow_mut().notify_read(ReadEvent::Eof),
            }
        }
        progressed
    }

    /// Step until quiescent.
    ///
    /// # Panics
    ///
    /// Panics after [`PUMP_LIMIT`] turns; that means callbacks are feeding
    /// each other without converging.
    pub fn pump(&self) {
        for _ in 0..PUMP_LIMIT {
            if !self.step() {
                return;
            }
        }
        panic!("virtual loop failed to quiesce after {PUMP_LIMIT} turns");
    }
}

struct VirtualBackend {
    inner: Weak<RefCell<LoopInner>>,
    token: u64,
}

impl VirtualBackend {
    fn with_slot<R>(&mut self, f: impl FnOnce(&mut Slot) -> R) -> Option<R> {
        let inner = self.inner.upgrade()?;
        let mut inner = inner.borrow_mut();
        inner.slots.get_mut(&self.token).map(f)
    }
}

impl Backend for VirtualBackend {
    fn start_read(&mut self) {
        self.with_slot(|slot| slot.reading = true);
    }

    fn stop_read(&mut self) {
        self.with_slot(|slot| slot.reading = false);
    }

    fn queue_write(&mut self, bufs: Vec<Bytes>) {
        self.with_slot(|slot| {
            let err = {
                let mut dir = slot.conduit.outgoing(slot.side).lock();
                if dir.closed {
                    Some(SocketError::Io)
                } else {
                    for buf in &bufs {
                        dir.bytes.extend(buf.iter().copied());
                    }
                    None
                }
            };
            slot.pending_completions.push_back(err);
        });
    }

    fn dispose(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.borrow_mut();
            if let Some(slot) = inner.slots.remove(&self.token) {
                slot.conduit.outgoing(slot.side).lock().closed = true;
            }
        }
    }

    fn export(&mut self) -> Result<TransportHandle, SocketError> {
        let inner = self.inner.upgrade().ok_or(SocketError::Io)?;
        let mut inner = inner.borrow_mut();
        let slot = inner.slots.remove(&self.token).ok_or(SocketError::Io)?;
        Ok(Box::new(ConduitEnd {
            conduit: slot.conduit,
            side: slot.side,
            detached: false,
        }))
    }

    fn peername(&mut self) -> Option<PeerAddress> {
        let token = self.token;
        self.with_slot(|slot| {
            slot.peer_addr.clone().unwrap_or_else(|| {
                let port = 40000u16.wrapping_add(token as u16);
                PeerAddress::Inet(SocketAddr::from(([127, 0, 0, 1], port)))
            })
        })
    }

    fn tcp_snapshot(&mut self) -> Option<TcpSnapshot> {
        self.with_slot(|slot| slot.snapshot).flatten()
    }

    fn enable_partial_write_notify(&mut self) -> bool {
        self.with_slot(|slot| slot.notify_supported).unwrap_or(false)
    }

    fn fd_token(&self) -> u64 {
        self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_bytes_reach_a_reading_socket() {
        let lp = VirtualLoop::new();
        let (sock, peer) = lp.pair();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            sock.borrow_mut().read_start(move |sock, result| {
                assert!(result.is_ok());
                seen.lock().extend_from_slice(sock.input());
                let n = sock.input().len();
                sock.consume_input(n);
            });
        }
        peer.send(b"ping");
        lp.pump();
        assert_eq!(seen.lock().as_slice(), b"ping");
    }

    #[test]
    fn writes_reach_the_peer_and_complete() {
        let lp = VirtualLoop::new();
        let (sock, peer) = lp.pair();
        let done = Arc::new(Mutex::new(false));
        {
            let done = Arc::clone(&done);
            sock.borrow_mut()
                .write(&[b"hello ".as_slice(), b"world".as_slice()], move |_, result| {
                assert!(result.is_ok());
                *done.lock() = true;
            });
        }
        lp.pump();
        assert!(*done.lock());
        assert_eq!(peer.drain(), b"hello world");
    }

    #[test]
    fn closed_peer_fails_writes() {
        let lp = VirtualLoop::new();
        let (sock, peer) = lp.pair();
        peer.close();
        let result = Arc::new(Mutex::new(None));
        {
            let result = Arc::clone(&result);
            sock.borrow_mut().write(&[b"x".as_slice()], move |_, r| {
                *result.lock() = Some(r);
            });
        }
        lp.pump();
        assert_eq!(*result.lock(), Some(Err(SocketError::Io)));
    }

    #[test]
    fn eof_is_delivered_once_after_data() {
        let lp = VirtualLoop::new();
        let (sock, peer) = lp.pair();
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = Arc::clone(&events);
            sock.borrow_mut().read_start(move |sock, result| {
                events.lock().push(result.map(|()| sock.input().len()));
            });
        }
        peer.send(b"tail");
        peer.close();
        lp.pump();
        let events = events.lock();
        assert_eq!(events.as_slice(), &[
            Ok(4),
            Err(SocketError::ClosedByPeer),
        ]);
    }
}
