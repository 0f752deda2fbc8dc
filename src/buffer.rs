//! Byte queues and the per-session output accumulator.
//!
//! Two buffer shapes cover every byte that crosses this crate:
//!
//! - [`ByteQueue`] — a consume-from-the-front queue used for the
//!   application input buffer and for a TLS session's encrypted input.
//!   Queues are created from a [`BufferPrototype`] which decides whether
//!   disposed chunks are recycled through a freelist (the per-thread
//!   pooling prototype) or dropped (the non-pooling prototype used for
//!   buffers that migrate across threads during export).
//! - [`OutputAccumulator`] — the TLS session's output block: an arena plus
//!   a vector of record descriptors. Every descriptor references memory
//!   inside the arena, and clearing the accumulator clears the arena.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::SocketError;

/// Initial capacity handed to fresh queue chunks.
const INITIAL_CHUNK_CAPACITY: usize = 8192;

/// Chunks kept on a pooling prototype's freelist.
const FREELIST_KEEP: usize = 16;

/// Default growth ceiling for a queue; exceeding it reports `OutOfMemory`.
const DEFAULT_CAPACITY_LIMIT: usize = 64 * 1024 * 1024;

type Freelist = Arc<Mutex<Vec<BytesMut>>>;

/// Allocation policy for [`ByteQueue`]s.
///
/// Cloning a prototype shares its freelist. The pooling prototype recycles
/// chunks of disposed queues; the plain prototype never recycles, which
/// makes its buffers safe to hand to another thread's loop.
#[derive(Clone)]
pub struct BufferPrototype {
    freelist: Option<Freelist>,
}

impl BufferPrototype {
    /// A pooling prototype with a fresh freelist.
    #[must_use]
    pub fn pooling() -> Self {
        Self {
            freelist: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// The non-pooling prototype.
    #[must_use]
    pub fn plain() -> Self {
        Self { freelist: None }
    }

    /// The calling thread's shared pooling prototype.
    #[must_use]
    pub fn thread_local() -> Self {
        thread_local! {
            static PROTO: BufferPrototype = BufferPrototype::pooling();
        }
        PROTO.with(Clone::clone)
    }

    /// True if this prototype recycles chunks.
    #[must_use]
    pub fn is_pooling(&self) -> bool {
        self.freelist.is_some()
    }

    fn acquire(&self) -> BytesMut {
        if let Some(list) = &self.freelist {
            if let Some(chunk) = list.lock().pop() {
                return chunk;
            }
        }
        BytesMut::with_capacity(INITIAL_CHUNK_CAPACITY)
    }

    fn recycle(&self, mut chunk: BytesMut) {
        if let Some(list) = &self.freelist {
            let mut list = list.lock();
            if list.len() < FREELIST_KEEP && chunk.capacity() >= INITIAL_CHUNK_CAPACITY {
                chunk.clear();
                list.push(chunk);
            }
        }
    }
}

impl std::fmt::Debug for BufferPrototype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPrototype")
            .field("pooling", &self.is_pooling())
            .finish()
    }
}

/// A contiguous byte queue consumed from the front.
pub struct ByteQueue {
    data: BytesMut,
    proto: BufferPrototype,
    limit: usize,
}

impl ByteQueue {
    /// Create an empty queue from the given prototype.
    #[must_use]
    pub fn new(proto: &BufferPrototype) -> Self {
        Self {
            data: proto.acquire(),
            proto: proto.clone(),
            limit: DEFAULT_CAPACITY_LIMIT,
        }
    }

    /// Create an empty queue with an explicit growth ceiling.
    #[must_use]
    pub fn with_limit(proto: &BufferPrototype, limit: usize) -> Self {
        let mut queue = Self::new(proto);
        queue.limit = limit;
        queue
    }

    /// Number of buffered bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if no bytes are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The buffered bytes, front first.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Append `data` to the back of the queue.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` when growth would exceed the queue's ceiling.
    pub fn append(&mut self, data: &[u8]) -> Result<(), SocketError> {
        self.ensure(data.len())?;
        self.data.extend_from_slice(data);
        Ok(())
    }

    /// Ensure room for `additional` more bytes without exceeding the
    /// ceiling.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` when growth would exceed the queue's ceiling.
    pub fn ensure(&mut self, additional: usize) -> Result<(), SocketError> {
        if self.data.len().saturating_add(additional) > self.limit {
            return Err(SocketError::OutOfMemory);
        }
        self.data.reserve(additional);
        Ok(())
    }

    /// Reserve `reserve` bytes at the back, let `fill` write into them,
    /// and keep the number of bytes `fill` reports. Returns that count.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` when growth would exceed the queue's ceiling; `fill`
    /// is not invoked in that case.
    pub fn append_with(
        &mut self,
        reserve: usize,
        fill: impl FnOnce(&mut [u8]) -> usize,
    ) -> Result<usize, SocketError> {
        self.ensure(reserve)?;
        let old_len = self.data.len();
        self.data.resize(old_len + reserve, 0);
        let filled = fill(&mut self.data[old_len..]);
        debug_assert!(filled <= reserve);
        self.data.truncate(old_len + filled.min(reserve));
        Ok(filled)
    }

    /// Consume `n` bytes from the front.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the buffered length.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.data.len(), "consuming past end of queue");
        self.data.advance(n);
    }

    /// Copy up to `out.len()` bytes from the front into `out`, consuming
    /// them. Returns the number of bytes copied.
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.data.len());
        out[..n].copy_from_slice(&self.data[..n]);
        self.data.advance(n);
        n
    }

    /// Remove and return all buffered bytes.
    pub fn take_all(&mut self) -> Bytes {
        self.data.split().freeze()
    }

    /// Swap the contents of two queues, leaving prototypes in place.
    pub fn swap_contents(&mut self, other: &mut Self) {
        std::mem::swap(&mut self.data, &mut other.data);
    }

    /// Re-parent this queue to another prototype. Future recycling follows
    /// the new prototype; the buffered bytes are untouched.
    pub fn rebind_prototype(&mut self, proto: &BufferPrototype) {
        self.proto = proto.clone();
    }

    /// Drop the buffered bytes, recycling the chunk per the prototype.
    pub fn dispose(&mut self) {
        let chunk = std::mem::take(&mut self.data);
        self.proto.recycle(chunk);
    }
}

impl std::fmt::Debug for ByteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteQueue")
            .field("len", &self.data.len())
            .field("proto", &self.proto)
            .finish()
    }
}

impl Drop for ByteQueue {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// The TLS session's output block: arena plus record descriptors.
///
/// Descriptors are `(offset, len)` pairs into the arena; they are appended
/// by the engine-facing write adapter, frozen into reference-counted
/// slices for a single backend write, and cleared when that write
/// completes.
#[derive(Default)]
pub struct OutputAccumulator {
    pool: BytesMut,
    frozen: Option<Bytes>,
    slices: Vec<(usize, usize)>,
}

impl OutputAccumulator {
    /// Create an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True if no records are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Total pending bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.slices.iter().map(|&(_, len)| len).sum()
    }

    /// Record descriptors, for diagnostics and invariant checks.
    #[must_use]
    pub fn descriptors(&self) -> &[(usize, usize)] {
        &self.slices
    }

    /// Bytes currently owned by the arena.
    #[must_use]
    pub fn pool_len(&self) -> usize {
        self.frozen.as_ref().map_or(self.pool.len(), Bytes::len)
    }

    /// Copy one record into the arena and append its descriptor.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::flush_bufs`] without an intervening
    /// [`Self::clear`]; records cannot be appended to a frozen arena.
    pub fn push(&mut self, data: &[u8]) {
        assert!(self.frozen.is_none(), "push into frozen output arena");
        let offset = self.pool.len();
        self.pool.extend_from_slice(data);
        self.slices.push((offset, data.len()));
    }

    /// Freeze the arena and return one reference-counted slice per record,
    /// in push order, for a single backend write. Descriptors stay in
    /// place until [`Self::clear`], so the accumulator still reports
    /// non-empty while the write is in flight.
    pub fn flush_bufs(&mut self) -> Vec<Bytes> {
        let frozen = self
            .frozen
            .get_or_insert_with(|| self.pool.split().freeze())
            .clone();
        self.slices
            .iter()
            .map(|&(offset, len)| frozen.slice(offset..offset + len))
            .collect()
    }

    /// Drop all descriptors and reset the arena.
    pub fn clear(&mut self) {
        self.slices.clear();
        self.frozen = None;
        self.pool.clear();
    }
}

impl std::fmt::Debug for OutputAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputAccumulator")
            .field("records", &self.slices.len())
            .field("bytes", &self.byte_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_append_consume_roundtrip() {
        let proto = BufferPrototype::pooling();
        let mut queue = ByteQueue::new(&proto);
        queue.append(b"hello ").unwrap();
        queue.append(b"world").unwrap();
        assert_eq!(queue.bytes(), b"hello world");
        queue.consume(6);
        assert_eq!(queue.bytes(), b"world");
        let mut out = [0u8; 16];
        let n = queue.read_into(&mut out);
        assert_eq!(&out[..n], b"world");
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_capacity_limit_reports_oom() {
        let proto = BufferPrototype::plain();
        let mut queue = ByteQueue::with_limit(&proto, 8);
        queue.append(b"12345678").unwrap();
        assert_eq!(queue.append(b"9"), Err(SocketError::OutOfMemory));
    }

    #[test]
    fn pooling_prototype_recycles_chunks() {
        let proto = BufferPrototype::pooling();
        let mut queue = ByteQueue::new(&proto);
        queue.append(&[0u8; INITIAL_CHUNK_CAPACITY]).unwrap();
        queue.dispose();
        // The recycled chunk comes back for the next queue.
        let queue2 = ByteQueue::new(&proto);
        assert!(queue2.data.capacity() >= INITIAL_CHUNK_CAPACITY);
    }

    #[test]
    fn swap_contents_swaps_only_bytes() {
        let pooling = BufferPrototype::pooling();
        let plain = BufferPrototype::plain();
        let mut a = ByteQueue::new(&pooling);
        let mut b = ByteQueue::new(&plain);
        a.append(b"ciphertext").unwrap();
        a.swap_contents(&mut b);
        assert!(a.is_empty());
        assert_eq!(b.bytes(), b"ciphertext");
        assert!(a.proto.is_pooling());
        assert!(!b.proto.is_pooling());
    }

    #[test]
    fn accumulator_descriptors_stay_until_clear() {
        let mut out = OutputAccumulator::new();
        out.push(b"rec1");
        out.push(b"record2");
        assert_eq!(out.byte_len(), 11);
        let bufs = out.flush_bufs();
        assert_eq!(bufs.len(), 2);
        assert_eq!(&bufs[0][..], b"rec1");
        assert_eq!(&bufs[1][..], b"record2");
        // Still reported busy while the write is in flight.
        assert!(!out.is_empty());
        out.clear();
        assert!(out.is_empty());
        assert_eq!(out.pool_len(), 0);
    }

    #[test]
    fn accumulator_descriptors_non_overlapping() {
        let mut out = OutputAccumulator::new();
        out.push(b"aa");
        out.push(b"bbb");
        out.push(b"c");
        let mut end = 0;
        for &(offset, len) in out.descriptors() {
            assert!(offset >= end);
            end = offset + len;
        }
        assert_eq!(end, out.pool_len());
    }
}
