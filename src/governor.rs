//! Latency-optimized TLS record sizing.
//!
//! When the congestion window is small, aligning record boundaries with
//! packet boundaries lets the receiver decrypt each record as soon as its
//! packet arrives instead of waiting for a record that spans several
//! packets. Once the window is large, oversized records amortize better.
//!
//! The governor is a per-socket mode machine fed by [`TcpSnapshot`]s taken
//! from the owning backend. It never touches the transport itself; the
//! socket wires in the snapshot source and the partial-write-notification
//! switch.

use crate::engine::CipherKind;
use crate::tracing_compat::trace;

/// A point-in-time view of the transport's congestion state.
///
/// `cwnd` and `unacked` are in packets, `mss` in bytes, `rtt` in
/// microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSnapshot {
    /// Congestion window, in packets.
    pub cwnd: u32,
    /// In-flight unacknowledged segments, in packets.
    pub unacked: u32,
    /// Maximum segment size, in bytes.
    pub mss: u32,
    /// Smoothed round-trip time, in microseconds.
    pub rtt: u32,
}

/// Record-size overhead of an AES-GCM record (header + IV + tag).
const AES_GCM_OVERHEAD: usize = 5 + 8 + 12;

/// Record-size overhead of a ChaCha20-Poly1305 record (header + tag).
const CHACHA_OVERHEAD: usize = 5 + 16;

/// Maximum TLS record payload.
const MAX_RECORD: usize = 16384;

/// Record size used while the governor has no congestion information.
const DEFAULT_RECORD: usize = 1400;

/// In-flight ceiling (cwnd · MSS) above which large records win.
const LARGE_RECORD_THRESHOLD: usize = 65536;

/// What the governor needs from the transport: congestion snapshots and
/// the partial-write-notification switch.
pub trait TransportProbe {
    /// A live congestion snapshot, if the transport can provide one.
    fn snapshot(&mut self) -> Option<TcpSnapshot>;

    /// Ask the transport to signal write completion only once little
    /// unsent data remains. Returns whether the transport honors it.
    fn enable_partial_write_notify(&mut self) -> bool;
}

/// Governor mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationMode {
    /// Not yet decided; the first `prepare` call probes the transport.
    Tbd,
    /// Optimization is off for the life of the socket.
    Disabled,
    /// A write happened since the last snapshot; refresh before advising.
    NeedsUpdate,
    /// Packet-aligned records are in effect.
    TinyRecords,
    /// Full-size records are in effect.
    LargeRecords,
}

/// Per-socket latency-optimization state.
#[derive(Debug)]
pub struct LatencyOptimizer {
    mode: OptimizationMode,
    mss: usize,
    tls_overhead: usize,
    suggested_write_size: usize,
}

impl Default for LatencyOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyOptimizer {
    /// A fresh governor in the undecided state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: OptimizationMode::Tbd,
            mss: 0,
            tls_overhead: 0,
            suggested_write_size: 0,
        }
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> OptimizationMode {
        self.mode
    }

    /// Overhead bytes per record for the negotiated cipher.
    #[must_use]
    pub fn tls_overhead(&self) -> usize {
        self.tls_overhead
    }

    /// Advise a write-size ceiling for the next write.
    ///
    /// `cipher` is the negotiated suite family (`None` for plaintext
    /// sockets); `probe` supplies congestion snapshots and the
    /// notify-on-partial-write switch (the `TCP_NOTSENT_LOWAT` analogue).
    /// Returns the suggested ceiling in bytes, or `None` for "no cap".
    pub fn prepare(
        &mut self,
        minimum_rtt: u32,
        cipher: Option<CipherKind>,
        probe: &mut dyn TransportProbe,
    ) -> Option<usize> {
        let snap = match self.mode {
            OptimizationMode::Tbd => {
                let Some(snap) = probe.snapshot() else {
                    return self.disable();
                };
                if snap.rtt < minimum_rtt {
                    return self.disable();
                }
                let tls_overhead = match cipher {
                    None => 0,
                    Some(CipherKind::AesGcm) => AES_GCM_OVERHEAD,
                    Some(CipherKind::Chacha20Poly1305) => CHACHA_OVERHEAD,
                    Some(CipherKind::Other) => return self.disable(),
                };
                if !probe.enable_partial_write_notify() {
                    return self.disable();
                }
                self.tls_overhead = tls_overhead;
                self.mss = snap.mss as usize;
                snap
            }
            OptimizationMode::NeedsUpdate => match probe.snapshot() {
                Some(snap) => snap,
                None => return None,
            },
            OptimizationMode::Disabled | OptimizationMode::LargeRecords => return None,
            OptimizationMode::TinyRecords => return Some(self.suggested_write_size),
        };

        if self.mss * snap.cwnd as usize >= LARGE_RECORD_THRESHOLD {
            self.mode = OptimizationMode::LargeRecords;
            return None;
        }

        self.mode = OptimizationMode::TinyRecords;
        let packets_sendable = snap.cwnd.saturating_sub(snap.unacked) as usize;
        self.suggested_write_size = (packets_sendable + 1) * (self.mss - self.tls_overhead);
        trace!(
            suggested = self.suggested_write_size,
            cwnd = snap.cwnd,
            unacked = snap.unacked,
            "packet-aligned records"
        );
        Some(self.suggested_write_size)
    }

    /// Pick the record size for the next TLS write and demote the mode so
    /// the following write re-probes the transport.
    pub(crate) fn select_record_size(&mut self) -> usize {
        match self.mode {
            OptimizationMode::TinyRecords | OptimizationMode::NeedsUpdate => {
                self.mode = OptimizationMode::NeedsUpdate;
                self.mss
            }
            OptimizationMode::LargeRecords => {
                self.mode = OptimizationMode::NeedsUpdate;
                MAX_RECORD - self.tls_overhead
            }
            OptimizationMode::Tbd | OptimizationMode::Disabled => DEFAULT_RECORD,
        }
    }

    fn disable(&mut self) -> Option<usize> {
        self.mode = OptimizationMode::Disabled;
        None
    }
}
