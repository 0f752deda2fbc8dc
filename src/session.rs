//! Per-socket TLS session state and the engine-facing byte-queue adapter.
//!
//! A [`SslState`] owns everything the TLS side of a socket needs: the
//! engine instance, the handshake block (completion callback plus
//! role-tagged data), the encrypted input queue, the output accumulator,
//! and the resumption cell shared with the engine's session-store shim.
//!
//! [`SessionIo`] is the byte-queue adapter: it binds the engine's I/O
//! vtable to one session's buffers for the duration of a single engine
//! call. Adapter and session are a bound pair constructed together from
//! disjoint borrows, so neither holds a reference to the socket.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::buffer::{ByteQueue, OutputAccumulator};
use crate::context::SslContext;
use crate::engine::{EngineIo, Pull, PushBlocked, TlsEngine};
use crate::socket::SocketCallback;

/// Async-resumption phase of a server handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumptionPhase {
    /// Pass-through; no async lookup is pending or possible.
    Complete,
    /// The first input is being recorded; an engine session lookup will
    /// suspend the handshake.
    Record,
    /// An external lookup is in flight; there is no live engine.
    RequestSent,
}

#[derive(Debug)]
struct CellState {
    phase: ResumptionPhase,
    /// Session id captured by the store shim, waiting for the handshake
    /// driver to dispatch the external lookup.
    pending_lookup: Option<Vec<u8>>,
    /// Session blob delivered by `resume_server_handshake`, served to the
    /// rebuilt engine during replay.
    session_data: Option<Bytes>,
}

/// Async-resumption state shared between the handshake driver and the
/// engine's session-store shim.
///
/// The shim runs inside an engine call and records the lookup here; the
/// driver reads the cell after the call returns and owns every phase
/// transition except `Record → RequestSent`.
#[derive(Debug)]
pub struct ResumptionCell {
    state: Mutex<CellState>,
}

impl ResumptionCell {
    /// A cell starting in the given phase.
    #[must_use]
    pub fn new(phase: ResumptionPhase) -> Self {
        Self {
            state: Mutex::new(CellState {
                phase,
                pending_lookup: None,
                session_data: None,
            }),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> ResumptionPhase {
        self.state.lock().phase
    }

    pub(crate) fn set_phase(&self, phase: ResumptionPhase) {
        self.state.lock().phase = phase;
    }

    /// Engine-side: request an external lookup for `session_id`.
    ///
    /// Succeeds only in the `Record` phase, moving the cell to
    /// `RequestSent`. Engines must treat a `false` return as "no cached
    /// session" and continue.
    pub fn begin_async_lookup(&self, session_id: &[u8]) -> bool {
        let mut state = self.state.lock();
        if state.phase != ResumptionPhase::Record {
            return false;
        }
        state.phase = ResumptionPhase::RequestSent;
        state.pending_lookup = Some(session_id.to_vec());
        true
    }

    /// Engine-side: the session blob delivered by the external cache, if
    /// the lookup has completed.
    #[must_use]
    pub fn cached_session(&self) -> Option<Bytes> {
        let state = self.state.lock();
        if state.phase == ResumptionPhase::Complete {
            state.session_data.clone()
        } else {
            None
        }
    }

    pub(crate) fn take_pending_lookup(&self) -> Option<Vec<u8>> {
        self.state.lock().pending_lookup.take()
    }

    pub(crate) fn set_session_data(&self, data: Option<Bytes>) {
        self.state.lock().session_data = data;
    }

    pub(crate) fn clear_session_data(&self) {
        self.state.lock().session_data = None;
    }
}

/// Role-tagged handshake data.
pub(crate) enum HandshakeRole {
    /// Server side; resumption phases live in the cell.
    Server,
    /// Client side, with the owned peer hostname.
    Client {
        /// Hostname used for SNI and post-handshake validation.
        server_name: String,
    },
}

/// The TLS session owned by a socket.
pub(crate) struct SslState {
    /// Engine instance; `None` only while an external session lookup is in
    /// flight (`RequestSent`).
    pub(crate) engine: Option<Box<dyn TlsEngine>>,
    /// The context the engine was built from, kept for rebuilds.
    pub(crate) context: SslContext,
    /// Handshake completion callback.
    pub(crate) handshake_cb: Option<SocketCallback>,
    pub(crate) role: HandshakeRole,
    pub(crate) cell: Arc<ResumptionCell>,
    /// Ciphertext received from the transport, pending engine reads.
    pub(crate) encrypted: ByteQueue,
    /// Records emitted by the engine, pending one transport write.
    pub(crate) output: OutputAccumulator,
    /// The transport reported EOF; `pull` turns empty into `Eof`.
    pub(crate) transport_eof: bool,
}

/// The byte-queue adapter bound to one session for one engine call.
pub(crate) struct SessionIo<'a> {
    encrypted: &'a mut ByteQueue,
    output: &'a mut OutputAccumulator,
    transport_eof: bool,
    /// Read re-entry token; armed only for engine `read` calls.
    read_guard: Option<&'a mut bool>,
}

impl<'a> SessionIo<'a> {
    pub(crate) fn new(
        encrypted: &'a mut ByteQueue,
        output: &'a mut OutputAccumulator,
        transport_eof: bool,
        read_guard: Option<&'a mut bool>,
    ) -> Self {
        Self {
            encrypted,
            output,
            transport_eof,
            read_guard,
        }
    }
}

impl EngineIo for SessionIo<'_> {
    fn pull(&mut self, out: &mut [u8]) -> Pull {
        if self.encrypted.is_empty() {
            if self.transport_eof {
                return Pull::Eof;
            }
            return Pull::Empty;
        }
        if out.is_empty() {
            return Pull::Bytes(0);
        }
        Pull::Bytes(self.encrypted.read_into(out))
    }

    fn push(&mut self, data: &[u8]) -> Result<usize, PushBlocked> {
        if let Some(flag) = self.read_guard.as_deref_mut() {
            *flag = true;
            return Err(PushBlocked);
        }
        if data.is_empty() {
            return Ok(0);
        }
        self.output.push(data);
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPrototype;

    #[test]
    fn pull_signals_retry_then_eof() {
        let proto = BufferPrototype::plain();
        let mut encrypted = ByteQueue::new(&proto);
        let mut output = OutputAccumulator::new();
        let mut out = [0u8; 8];

        let mut io = SessionIo::new(&mut encrypted, &mut output, false, None);
        assert_eq!(io.pull(&mut out), Pull::Empty);

        let mut io = SessionIo::new(&mut encrypted, &mut output, true, None);
        assert_eq!(io.pull(&mut out), Pull::Eof);
    }

    #[test]
    fn pull_consumes_from_the_front() {
        let proto = BufferPrototype::plain();
        let mut encrypted = ByteQueue::new(&proto);
        encrypted.append(b"abcdef").unwrap();
        let mut output = OutputAccumulator::new();
        let mut out = [0u8; 4];

        let mut io = SessionIo::new(&mut encrypted, &mut output, false, None);
        assert_eq!(io.pull(&mut out), Pull::Bytes(4));
        assert_eq!(&out, b"abcd");
        assert_eq!(encrypted.bytes(), b"ef");
    }

    #[test]
    fn push_appends_records() {
        let proto = BufferPrototype::plain();
        let mut encrypted = ByteQueue::new(&proto);
        let mut output = OutputAccumulator::new();

        let mut io = SessionIo::new(&mut encrypted, &mut output, false, None);
        assert_eq!(io.push(b"record"), Ok(6));
        assert_eq!(output.descriptors().len(), 1);
        assert_eq!(output.byte_len(), 6);
    }

    #[test]
    fn armed_guard_fails_push_and_sets_flag() {
        let proto = BufferPrototype::plain();
        let mut encrypted = ByteQueue::new(&proto);
        let mut output = OutputAccumulator::new();
        let mut fired = false;

        let mut io = SessionIo::new(&mut encrypted, &mut output, false, Some(&mut fired));
        assert_eq!(io.push(b"handshake"), Err(PushBlocked));
        assert!(fired);
        assert!(output.is_empty());
    }

    #[test]
    fn lookup_only_from_record_phase() {
        let cell = ResumptionCell::new(ResumptionPhase::Complete);
        assert!(!cell.begin_async_lookup(b"id"));

        let cell = ResumptionCell::new(ResumptionPhase::Record);
        assert!(cell.begin_async_lookup(b"id"));
        assert_eq!(cell.phase(), ResumptionPhase::RequestSent);
        // A second trigger without an intervening Complete is refused.
        assert!(!cell.begin_async_lookup(b"id"));
        assert_eq!(cell.take_pending_lookup().as_deref(), Some(b"id".as_slice()));
    }

    #[test]
    fn cached_session_served_only_when_complete() {
        let cell = ResumptionCell::new(ResumptionPhase::RequestSent);
        cell.set_session_data(Some(Bytes::from_static(b"blob")));
        assert_eq!(cell.cached_session(), None);
        cell.set_phase(ResumptionPhase::Complete);
        assert_eq!(cell.cached_session(), Some(Bytes::from_static(b"blob")));
        cell.clear_session_data();
        assert_eq!(cell.cached_session(), None);
    }
}
