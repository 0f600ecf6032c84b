//! # Session Statistics
//!
//! Per-role counters and the windowed receive-rate meter. Counters are
//! plain fields bumped by the state machines and serializable for export.

use quanta::Instant;
use serde::Serialize;
use std::time::Duration;

// ─── Sender Stats ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    /// Total PDUs emitted (objects, commands, everything).
    pub pdus_sent: u64,
    /// Total bytes emitted.
    pub bytes_sent: u64,
    /// DATA PDUs carrying parity symbols.
    pub parity_sent: u64,
    /// DATA/INFO PDUs re-sent in response to NACKs.
    pub repairs_sent: u64,
    /// NACK PDUs processed.
    pub nacks_received: u64,
    /// ACK PDUs processed.
    pub acks_received: u64,
    /// SQUELCH commands queued for out-of-window requests.
    pub squelches_sent: u64,
    /// Flush commands emitted.
    pub flushes_sent: u64,
    /// CC probe commands emitted.
    pub probes_sent: u64,
    /// Objects evicted from the tx cache.
    pub objects_purged: u64,
    /// Transmission opportunities dropped for want of buffers.
    pub buffer_drops: u64,
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    /// Total PDUs accepted from this sender.
    pub pdus_received: u64,
    /// Total payload bytes received.
    pub bytes_received: u64,
    /// Duplicate segments.
    pub duplicates: u64,
    /// Segments recovered by FEC decode.
    pub fec_recoveries: u64,
    /// NACKs transmitted.
    pub nacks_sent: u64,
    /// NACK cycles fully suppressed by overheard feedback.
    pub nacks_suppressed: u64,
    /// ACKs transmitted.
    pub acks_sent: u64,
    /// Malformed PDUs dropped.
    pub malformed_pdus: u64,
    /// Out-of-window messages dropped.
    pub out_of_window: u64,
    /// Receiver resynchronisations.
    pub resyncs: u64,
    /// Objects completed.
    pub objects_completed: u64,
    /// Objects abandoned (window advance, activity timeout).
    pub objects_aborted: u64,
    /// Incoming segments dropped for want of buffers.
    pub buffer_drops: u64,
}

// ─── Receive Rate Meter ─────────────────────────────────────────────────────

/// Windowed byte-rate meter for the `recv_rate` reported in CC feedback.
pub struct RateMeter {
    samples: Vec<(Instant, u64)>,
    window: Duration,
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        RateMeter {
            samples: Vec::with_capacity(128),
            window,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push((now, bytes));
        let cutoff = now - self.window;
        self.samples.retain(|(t, _)| *t >= cutoff);
    }

    /// Bytes per second over the window.
    pub fn rate(&self) -> f64 {
        let cutoff = Instant::now() - self.window;
        let sum: u64 = self
            .samples
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .map(|(_, b)| b)
            .sum();
        sum as f64 / self.window.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_meter_accumulates() {
        let mut meter = RateMeter::new(Duration::from_secs(1));
        meter.record(1000);
        meter.record(2000);
        assert!(meter.rate() >= 2999.0);
    }

    #[test]
    fn sender_stats_serialize() {
        let stats = SenderStats {
            pdus_sent: 10,
            parity_sent: 2,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"pdus_sent\":10"));
        assert!(json.contains("\"parity_sent\":2"));
    }

    #[test]
    fn receiver_stats_serialize() {
        let stats = ReceiverStats {
            nacks_sent: 3,
            nacks_suppressed: 1,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"nacks_suppressed\":1"));
    }
}
