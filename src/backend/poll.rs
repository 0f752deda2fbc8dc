//! Readiness-polled system loop over non-blocking sockets.
//!
//! [`PollLoop`] multiplexes non-blocking TCP streams with the `polling`
//! crate (oneshot mode; interest is re-armed after every event). Readable
//! events are drained into the socket's read pipeline; writable events
//! drain the queued iovecs and then signal the write completion. Zero
//! length writes complete on the next turn without touching the
//! transport.
//!
//! Congestion introspection is not wired on this loop, so the record-size
//! governor disables itself here — the same behavior the transport has on
//! platforms without `TCP_INFO`. The deterministic virtual loop scripts
//! snapshots instead.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;
use polling::{Event, Poller};
use smallvec::SmallVec;
use socket2::{Domain, Protocol, Socket as RawSocket, Type};

use super::{Backend, ImportError, SocketRef, TransportHandle};
use crate::addr::PeerAddress;
use crate::error::SocketError;
use crate::governor::TcpSnapshot;
use crate::socket::{ReadEvent, Socket, SocketCallback, SocketExport};
use crate::tracing_compat::{debug, trace};

#[cfg(target_os = "linux")]
const EINPROGRESS: i32 = 115;
#[cfg(not(target_os = "linux"))]
const EINPROGRESS: i32 = 36;

/// Per-turn read scratch size.
const READ_CHUNK: usize = 16 * 1024;

struct PollSlot {
    stream: TcpStream,
    socket: Weak<RefCell<Socket>>,
    reading: bool,
    connecting: bool,
    on_connect: Option<SocketCallback>,
    write_queue: SmallVec<[Bytes; 4]>,
    write_pos: usize,
    completion_pending: bool,
}

impl PollSlot {
    fn interest(&self, key: usize) -> Event {
        Event {
            key,
            readable: self.reading,
            writable: self.connecting || !self.write_queue.is_empty(),
        }
    }
}

struct PollInner {
    poller: Poller,
    slots: HashMap<usize, PollSlot>,
    /// Write completions owed without transport involvement.
    immediate: VecDeque<(usize, Option<SocketError>)>,
    next_key: usize,
}

impl PollInner {
    fn rearm(&self, key: usize) {
        if let Some(slot) = self.slots.get(&key) {
            let _ = self
                .poller
                .modify(slot.stream.as_raw_fd(), slot.interest(key));
        }
    }
}

/// A single-threaded loop over system sockets.
pub struct PollLoop {
    inner: Rc<RefCell<PollInner>>,
}

impl PollLoop {
    /// A fresh loop.
    ///
    /// # Errors
    ///
    /// Fails when the OS poller cannot be created.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            inner: Rc::new(RefCell::new(PollInner {
                poller: Poller::new()?,
                slots: HashMap::new(),
                immediate: VecDeque::new(),
                next_key: 1,
            })),
        })
    }

    /// Adopt an established stream (e.g. from an accept loop).
    ///
    /// # Errors
    ///
    /// Fails when the stream cannot be made non-blocking or registered.
    pub fn attach(&self, stream: TcpStream) -> io::Result<SocketRef> {
        self.attach_slot(stream, false, None, |backend| {
            Socket::new(Box::new(backend))
        })
    }

    /// Open a non-blocking connection to `addr`. `on_connect` fires once
    /// the connection settles, with `ConnectionFailure` on failure.
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be created or the connect cannot be
    /// initiated.
    pub fn connect(
        &self,
        addr: SocketAddr,
        on_connect: impl FnMut(&mut Socket, crate::error::CallbackResult) + Send + 'static,
    ) -> io::Result<SocketRef> {
        let raw = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        raw.set_nonblocking(true)?;
        match raw.connect(&addr.into()) {
            Ok(()) => {}
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.raw_os_error() == Some(EINPROGRESS) => {}
            Err(e) => return Err(e),
        }
        let stream: TcpStream = raw.into();
        debug!(%addr, "connect in progress");
        self.attach_slot(stream, true, Some(Box::new(on_connect)), |backend| {
            Socket::new(Box::new(backend))
        })
    }

    /// Import a socket exported from another `PollLoop` (possibly on
    /// another thread).
    ///
    /// # Errors
    ///
    /// [`ImportError::WrongLoop`] when the record's transport did not come
    /// from a poll loop.
    pub fn import(&self, export: SocketExport) -> Result<SocketRef, ImportError> {
        let SocketExport {
            handle, input, ssl, ..
        } = export;
        let stream = handle
            .downcast::<TcpStream>()
            .map_err(|_| ImportError::WrongLoop)?;
        self.attach_slot(*stream, false, None, move |backend| {
            Socket::from_import(Box::new(backend), input, ssl)
        })
        .map_err(|_| ImportError::WrongLoop)
    }

    fn attach_slot(
        &self,
        stream: TcpStream,
        connecting: bool,
        on_connect: Option<SocketCallback>,
        build: impl FnOnce(PollBackend) -> Socket,
    ) -> io::Result<SocketRef> {
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        let key = {
            let mut inner = self.inner.borrow_mut();
            let key = inner.next_key;
            inner.next_key += 1;
            inner.poller.add(
                fd,
                Event {
                    key,
                    readable: false,
                    writable: connecting,
                },
            )?;
            key
        };
        let backend = PollBackend {
            inner: Rc::downgrade(&self.inner),
            key,
            fd,
        };
        let socket = Rc::new(RefCell::new(build(backend)));
        self.inner.borrow_mut().slots.insert(
            key,
            PollSlot {
                stream,
                socket: Rc::downgrade(&socket),
                reading: false,
                connecting,
                on_connect,
                write_queue: SmallVec::new(),
                write_pos: 0,
                completion_pending: false,
            },
        );
        Ok(socket)
    }

    /// Run one loop turn: deliver owed completions, wait for readiness up
    /// to `timeout`, and dispatch events. Returns the number of readiness
    /// events handled.
    ///
    /// # Errors
    ///
    /// Fails when the OS poller fails.
    pub fn run_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
        self.deliver_immediate();

        let mut events = Vec::new();
        {
            let inner = self.inner.borrow();
            inner.poller.wait(&mut events, timeout)?;
        }

        let handled = events.len();
        for event in events {
            self.dispatch(event);
        }
        Ok(handled)
    }

    fn deliver_immediate(&self) {
        loop {
            let owed = self.inner.borrow_mut().immediate.pop_front();
            let Some((key, err)) = owed else { return };
            let socket = {
                let mut inner = self.inner.borrow_mut();
                let Some(slot) = inner.slots.get_mut(&key) else {
                    continue;
                };
                slot.completion_pending = false;
                slot.socket.upgrade()
            };
            if let Some(socket) = socket {
                socket.borrow_mut().notify_write_done(err);
            }
        }
    }

    fn dispatch(&self, event: Event) {
        enum Work {
            Read(Vec<u8>, bool),
            ReadError(SocketError),
            Connected(SocketCallback, Option<SocketError>),
            WriteDone(Option<SocketError>),
        }

        let key = event.key;
        let mut work: Vec<Work> = Vec::new();
        let socket = {
            let mut inner = self.inner.borrow_mut();
            let Some(slot) = inner.slots.get_mut(&key) else {
                return;
            };
            let Some(socket) = slot.socket.upgrade() else {
                let fd = slot.stream.as_raw_fd();
                let _ = inner.poller.delete(fd);
                inner.slots.remove(&key);
                return;
            };

            if event.writable && slot.connecting {
                slot.connecting = false;
                let err = match slot.stream.take_error() {
                    Ok(None) => None,
                    Ok(Some(_)) | Err(_) => Some(SocketError::ConnectionFailure),
                };
                if let Some(cb) = slot.on_connect.take() {
                    work.push(Work::Connected(cb, err));
                }
            }

            if event.writable && !slot.write_queue.is_empty() {
                loop {
                    let Some(front) = slot.write_queue.first() else {
                        break;
                    };
                    match slot.stream.write(&front[slot.write_pos..]) {
                        Ok(n) => {
                            slot.write_pos += n;
                            if slot.write_pos == front.len() {
                                slot.write_queue.remove(0);
                                slot.write_pos = 0;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(_) => {
                            slot.write_queue.clear();
                            slot.write_pos = 0;
                            slot.completion_pending = false;
                            work.push(Work::WriteDone(Some(SocketError::Io)));
                            break;
                        }
                    }
                }
                if slot.write_queue.is_empty() && slot.completion_pending {
                    slot.completion_pending = false;
                    work.push(Work::WriteDone(None));
                }
            }

            if event.readable && slot.reading {
                let mut collected = Vec::new();
                let mut at_eof = false;
                let mut scratch = [0u8; READ_CHUNK];
                loop {
                    match slot.stream.read(&mut scratch) {
                        Ok(0) => {
                            at_eof = true;
                            break;
                        }
                        Ok(n) => collected.extend_from_slice(&scratch[..n]),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            work.push(Work::ReadError(SocketError::from(e)));
                            break;
                        }
                    }
                }
                if !collected.is_empty() || at_eof {
                    work.push(Work::Read(collected, at_eof));
                }
            }

            inner.rearm(key);
            socket
        };

        for item in work {
            let mut sock = socket.borrow_mut();
            match item {
                Work::Read(data, at_eof) => {
                    if !data.is_empty() {
                        trace!(bytes = data.len(), "transport delivery");
                        sock.notify_read(ReadEvent::Data(&data));
                    }
                    if at_eof {
                        sock.notify_read(ReadEvent::Eof);
                    }
                }
                Work::ReadError(err) => sock.notify_read(ReadEvent::Error(err)),
                Work::Connected(mut cb, err) => cb(&mut sock, err.map_or(Ok(()), Err)),
                Work::WriteDone(err) => sock.notify_write_done(err),
            }
        }
    }
}

struct PollBackend {
    inner: Weak<RefCell<PollInner>>,
    key: usize,
    fd: RawFd,
}

impl PollBackend {
    fn with_inner<R>(&mut self, f: impl FnOnce(&mut PollInner) -> R) -> Option<R> {
        let inner = self.inner.upgrade()?;
        let mut inner = inner.borrow_mut();
        Some(f(&mut inner))
    }
}

impl Backend for PollBackend {
    fn start_read(&mut self) {
        let key = self.key;
        self.with_inner(|inner| {
            if let Some(slot) = inner.slots.get_mut(&key) {
                slot.reading = true;
            }
            inner.rearm(key);
        });
    }

    fn stop_read(&mut self) {
        let key = self.key;
        self.with_inner(|inner| {
            if let Some(slot) = inner.slots.get_mut(&key) {
                slot.reading = false;
            }
            inner.rearm(key);
        });
    }

    fn queue_write(&mut self, bufs: Vec<Bytes>) {
        let key = self.key;
        self.with_inner(|inner| {
            let total: usize = bufs.iter().map(Bytes::len).sum();
            if total == 0 {
                inner.immediate.push_back((key, None));
                return;
            }
            if let Some(slot) = inner.slots.get_mut(&key) {
                slot.write_queue = bufs.into_iter().filter(|b| !b.is_empty()).collect();
                slot.write_pos = 0;
                slot.completion_pending = true;
            }
            inner.rearm(key);
        });
    }

    fn dispose(&mut self) {
        let key = self.key;
        self.with_inner(|inner| {
            if let Some(slot) = inner.slots.remove(&key) {
                let _ = inner.poller.delete(slot.stream.as_raw_fd());
            }
        });
    }

    fn export(&mut self) -> Result<TransportHandle, SocketError> {
        let key = self.key;
        self.with_inner(|inner| {
            let slot = inner.slots.remove(&key)?;
            let _ = inner.poller.delete(slot.stream.as_raw_fd());
            Some(Box::new(slot.stream) as TransportHandle)
        })
        .flatten()
        .ok_or(SocketError::Io)
    }

    fn peername(&mut self) -> Option<PeerAddress> {
        let key = self.key;
        self.with_inner(|inner| {
            inner
                .slots
                .get(&key)
                .and_then(|slot| slot.stream.peer_addr().ok())
                .map(PeerAddress::Inet)
        })
        .flatten()
    }

    fn tcp_snapshot(&mut self) -> Option<TcpSnapshot> {
        // Not wired on this loop; the governor disables itself, as the
        // transport does on platforms without TCP_INFO.
        None
    }

    fn enable_partial_write_notify(&mut self) -> bool {
        false
    }

    fn fd_token(&self) -> u64 {
        self.fd as u64
    }
}
