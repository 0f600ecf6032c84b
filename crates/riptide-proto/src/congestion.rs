//! # Congestion Control (Sender Side)
//!
//! Equation-based, TFRC-like rate control driven by receiver feedback. A
//! small list of candidate receivers is tracked; its head is the CLR
//! (current limiting receiver) whose `(rtt, loss)` pair drives the rate.
//! Slow start lasts until any receiver reports an actual loss estimate,
//! during which the sender adopts the CLR's reported (doubled receive)
//! rate directly.
//!
//! GRTT estimation rides the same probes: the sender advertises its current
//! estimate in every object PDU and probes with `CMD(CC)`; receiver echoes
//! yield RTT samples. Larger samples fold in immediately, smaller ones only
//! after a few quiet probe periods, so the estimate tracks the slowest
//! receiver without collapsing on transient fast paths.

use crate::seq::NodeId;
use crate::wire::{quantize_rtt, unquantize_rtt, GRTT_MIN};

/// TCP-friendly steady-state rate in bytes/sec for a nominal packet
/// `size` (bytes), path `rtt` (seconds), and loss-event probability `loss`.
pub fn calculate_rate(size: f64, rtt: f64, loss: f64) -> f64 {
    let denom = rtt
        * ((2.0 / 3.0 * loss).sqrt()
            + 12.0 * (3.0 / 8.0 * loss).sqrt() * loss * (1.0 + 32.0 * loss * loss));
    size / denom
}

// ─── CC Node List ───────────────────────────────────────────────────────────

/// Maximum tracked feedback candidates (CLR plus four PLRs).
const MAX_CC_NODES: usize = 5;

/// State for one receiver in the congestion feedback set.
#[derive(Debug, Clone)]
pub struct CcNode {
    pub id: NodeId,
    pub is_clr: bool,
    pub active: bool,
    /// The receiver has a confirmed RTT measurement.
    pub has_rtt: bool,
    pub rtt: f64,
    pub loss: f64,
    pub rate: f64,
    pub cc_sequence: u16,
}

impl CcNode {
    fn new(id: NodeId) -> Self {
        CcNode {
            id,
            is_clr: false,
            active: false,
            has_rtt: false,
            rtt: 0.0,
            loss: 0.0,
            rate: 0.0,
            cc_sequence: 0,
        }
    }

    /// Fold a fresh RTT sample into the node's smoothed estimate.
    fn update_rtt(&mut self, sample: f64) -> f64 {
        if self.has_rtt {
            self.rtt = 0.5 * self.rtt + 0.5 * sample;
        } else {
            self.rtt = sample;
        }
        self.rtt
    }
}

/// One receiver's decoded CC feedback.
#[derive(Debug, Clone, Copy)]
pub struct Feedback {
    pub node_id: NodeId,
    pub flags: u8,
    pub rtt: f64,
    pub loss: f64,
    pub rate: f64,
    pub cc_sequence: u16,
}

// ─── Rate Controller ────────────────────────────────────────────────────────

/// Sender transmit-rate state.
pub struct RateController {
    pub cc_enable: bool,
    slow_start: bool,
    tx_rate: f64,
    pub tx_rate_min: Option<f64>,
    pub tx_rate_max: Option<f64>,
    segment_size: f64,
    nominal_packet_size: f64,
    /// CLR at the head, candidates behind.
    nodes: Vec<CcNode>,
    // Lowest-rate non-CLR feedback seen since the last probe, for the
    // REPAIR_ADV limit advertisement.
    suppress_rate: Option<f64>,
    suppress_rtt: f64,
}

impl RateController {
    pub fn new(cc_enable: bool, initial_rate: f64, segment_size: u16) -> Self {
        RateController {
            cc_enable,
            slow_start: true,
            tx_rate: initial_rate,
            tx_rate_min: None,
            tx_rate_max: None,
            segment_size: segment_size as f64,
            nominal_packet_size: segment_size as f64,
            nodes: Vec::new(),
            suppress_rate: None,
            suppress_rtt: 0.0,
        }
    }

    pub fn tx_rate(&self) -> f64 {
        self.tx_rate
    }

    pub fn set_tx_rate(&mut self, rate: f64) {
        self.tx_rate = rate;
    }

    pub fn in_slow_start(&self) -> bool {
        self.slow_start
    }

    pub fn clr(&self) -> Option<&CcNode> {
        self.nodes.first().filter(|n| n.is_clr)
    }

    pub fn nodes(&self) -> &[CcNode] {
        &self.nodes
    }

    /// Mark all candidates inactive except the CLR (done when a probe
    /// echoes their state back to the group).
    pub fn deactivate_candidates(&mut self) {
        for node in self.nodes.iter_mut() {
            if !node.is_clr {
                node.active = false;
            }
        }
    }

    pub fn suppression_rate(&self) -> Option<f64> {
        self.suppress_rate
    }

    pub fn reset_suppression(&mut self) {
        self.suppress_rate = None;
        self.suppress_rtt = 0.0;
    }

    /// Record the nominal packet size observed on the wire (drives the
    /// rate equation).
    pub fn update_nominal_size(&mut self, size: usize) {
        let size = size as f64;
        if size > self.nominal_packet_size {
            self.nominal_packet_size = size;
        }
    }

    /// Process one receiver's CC feedback. `grtt` is the current measured
    /// group RTT, used when no per-node RTT is available.
    pub fn handle_feedback(&mut self, mut fb: Feedback, grtt: f64) {
        use crate::wire::cc_flags;

        // Track suppressing (non-CLR, lowest-rate) feedback regardless of
        // whether cc is driving the rate.
        if fb.flags & cc_flags::CLR == 0 {
            match self.suppress_rate {
                Some(rate) if fb.rate >= rate => {}
                _ => self.suppress_rate = Some(fb.rate),
            }
            if fb.rtt > self.suppress_rtt {
                self.suppress_rtt = fb.rtt;
            }
        }
        if !self.cc_enable {
            return;
        }

        // Smooth the RTT against existing state for this node.
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == fb.node_id) {
            fb.rtt = node.update_rtt(fb.rtt);
        }

        if fb.flags & cc_flags::START == 0 {
            // Feedback past slow start carries a real loss estimate.
            self.slow_start = false;
            fb.rate = calculate_rate(self.nominal_packet_size, fb.rtt, fb.loss.max(1.0e-9));
        }

        let has_rtt = fb.flags & cc_flags::RTT != 0;
        let head_active = self.nodes.first().is_some_and(|n| n.is_clr && n.active);
        if head_active {
            let head = &self.nodes[0];
            if fb.rate < head.rate || fb.node_id == head.id {
                // This response becomes (or refreshes) the CLR.
                let old = if fb.node_id == head.id {
                    None
                } else {
                    Some(self.nodes[0].clone())
                };
                let head = &mut self.nodes[0];
                head.id = fb.node_id;
                head.is_clr = true;
                head.active = true;
                head.has_rtt = has_rtt;
                head.rtt = fb.rtt;
                head.loss = fb.loss;
                head.rate = fb.rate;
                head.cc_sequence = fb.cc_sequence;
                self.adjust_rate(true, grtt);
                // Demote the displaced CLR into the candidate set.
                if let Some(mut old) = old {
                    old.is_clr = false;
                    self.offer_candidate(old);
                }
                return;
            }
        } else {
            // No active CLR: this responder takes the role.
            let mut node = CcNode::new(fb.node_id);
            node.is_clr = true;
            node.active = true;
            node.has_rtt = has_rtt;
            node.rtt = fb.rtt;
            node.loss = fb.loss;
            node.rate = fb.rate;
            node.cc_sequence = fb.cc_sequence;
            if self.nodes.is_empty() {
                self.nodes.push(node);
            } else {
                self.nodes[0] = node;
            }
            self.adjust_rate(true, grtt);
            return;
        }

        // Not the CLR: maintain the candidate (PLR) set.
        let mut node = CcNode::new(fb.node_id);
        node.active = true;
        node.has_rtt = has_rtt;
        node.rtt = fb.rtt;
        node.loss = fb.loss;
        node.rate = fb.rate;
        node.cc_sequence = fb.cc_sequence;
        self.offer_candidate(node);
    }

    /// Insert or replace a non-CLR candidate, evicting the lowest-
    /// precedence entry when full (inactive first, then unconfirmed RTT,
    /// then highest rate).
    fn offer_candidate(&mut self, node: CcNode) {
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.id == node.id && !n.is_clr) {
            *existing = node;
            return;
        }
        if self.nodes.len() < MAX_CC_NODES {
            self.nodes.push(node);
            return;
        }
        let candidate = self.nodes[1..]
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                // Lower precedence orders first.
                (a.active, a.has_rtt, std::cmp::Reverse(a.rate.to_bits()))
                    .cmp(&(b.active, b.has_rtt, std::cmp::Reverse(b.rate.to_bits())))
            })
            .map(|(i, _)| i + 1);
        if let Some(idx) = candidate {
            let victim = &self.nodes[idx];
            let replace = !victim.active
                || (victim.has_rtt && !node.has_rtt)
                || node.rate < victim.rate;
            if replace {
                self.nodes[idx] = node;
            }
        }
    }

    /// Recompute `tx_rate`. `on_response` is set when invoked by fresh CLR
    /// feedback (rate moves toward the CLR's rate); otherwise only the
    /// bounds are re-applied.
    pub fn adjust_rate(&mut self, on_response: bool, grtt: f64) {
        if on_response {
            if let Some(clr) = self.clr() {
                if self.slow_start {
                    self.tx_rate = clr.rate;
                } else if clr.rate > self.tx_rate {
                    // Limit increases to one segment per feedback.
                    self.tx_rate = clr.rate.min(self.tx_rate + self.segment_size);
                } else {
                    self.tx_rate = clr.rate;
                }
            }
        }
        // Floor: one segment per GRTT, never below one segment per second.
        let min_rate = (self.segment_size / grtt.max(1.0e-6)).max(self.segment_size);
        self.tx_rate = self.tx_rate.max(min_rate);
        if let Some(lo) = self.tx_rate_min {
            self.tx_rate = self.tx_rate.max(lo);
        }
        if let Some(hi) = self.tx_rate_max {
            self.tx_rate = self.tx_rate.min(hi);
        }
    }

    /// Probe interval while cc is active: the smaller of GRTT and the
    /// CLR's RTT.
    pub fn probe_interval(&self, grtt: f64) -> f64 {
        match self.clr() {
            Some(clr) => grtt.min(clr.rtt).max(GRTT_MIN),
            None => grtt,
        }
    }
}

// ─── GRTT Estimation ────────────────────────────────────────────────────────

pub const DEFAULT_GRTT_ESTIMATE: f64 = 0.5;
pub const DEFAULT_GSIZE_ESTIMATE: f64 = 1000.0;
const GRTT_DECREASE_DELAY: i32 = 3;
const GRTT_INTERVAL_MIN: f64 = 1.0;
const GRTT_INTERVAL_MAX: f64 = 30.0;

/// Sender group-RTT estimator with peak tracking and delayed decrease.
pub struct GrttEstimator {
    measured: f64,
    quantized: u8,
    advertised: f64,
    current_peak: f64,
    decrease_delay_count: i32,
    response_received: bool,
    grtt_max: f64,
    probe_interval: f64,
    age: f64,
}

impl GrttEstimator {
    pub fn new() -> Self {
        let quantized = quantize_rtt(DEFAULT_GRTT_ESTIMATE);
        let advertised = unquantize_rtt(quantized);
        GrttEstimator {
            measured: advertised,
            quantized,
            advertised,
            current_peak: 0.0,
            decrease_delay_count: GRTT_DECREASE_DELAY,
            response_received: false,
            grtt_max: 10.0,
            probe_interval: GRTT_INTERVAL_MIN,
            age: 0.0,
        }
    }

    pub fn advertised(&self) -> f64 {
        self.advertised
    }

    pub fn quantized(&self) -> u8 {
        self.quantized
    }

    pub fn measured(&self) -> f64 {
        self.measured
    }

    pub fn set_estimate(&mut self, grtt: f64) {
        self.measured = grtt.clamp(GRTT_MIN, self.grtt_max);
        self.requantize(0.0);
    }

    pub fn set_grtt_max(&mut self, max: f64) {
        self.grtt_max = max;
    }

    fn requantize(&mut self, pkt_interval: f64) {
        self.quantized = quantize_rtt(self.measured.max(pkt_interval));
        // Quantisation rounds upward; advertise what the byte decodes to.
        self.advertised = unquantize_rtt(self.quantized);
    }

    /// Fold in an RTT sample echoed by a receiver. Returns `true` when the
    /// advertised (quantised) estimate changed. Larger samples move the
    /// estimate immediately; smaller ones only raise the tracked peak.
    pub fn update_from_response(
        &mut self,
        sample: f64,
        multicast: bool,
        pkt_interval: f64,
    ) -> bool {
        if sample < 0.0 {
            return false;
        }
        self.response_received = true;
        if sample > self.current_peak {
            self.current_peak = sample;
        }
        if sample > self.measured || !multicast {
            self.decrease_delay_count = GRTT_DECREASE_DELAY;
            self.measured = 0.9 * self.measured + 0.1 * sample;
            self.measured = self.measured.min(self.grtt_max);
            let old = self.quantized;
            self.requantize(pkt_interval);
            return old != self.quantized;
        }
        false
    }

    /// Periodic probe-time aging: after enough quiet probe periods the
    /// estimate decays toward the tracked peak. Returns `true` when the
    /// advertised estimate changed.
    pub fn age_estimate(&mut self, probe_interval: f64, pkt_interval: f64) -> bool {
        self.age += probe_interval;
        let age_max = (3.0 * self.advertised).max(GRTT_INTERVAL_MIN);
        if self.age < age_max || !self.response_received {
            return false;
        }
        self.age = 0.0;
        self.response_received = false;
        if self.current_peak < self.measured {
            self.decrease_delay_count -= 1;
            if self.decrease_delay_count < 0 {
                self.measured = 0.5 * self.measured + 0.5 * self.current_peak;
                self.current_peak = 0.0;
                self.decrease_delay_count = GRTT_DECREASE_DELAY;
            }
        } else {
            // Increases were already incorporated on response.
            self.current_peak = 0.0;
            self.decrease_delay_count = GRTT_DECREASE_DELAY;
        }
        self.measured = self.measured.clamp(GRTT_MIN, self.grtt_max);
        let old = self.quantized;
        self.requantize(pkt_interval);
        old != self.quantized
    }

    /// Next probe interval when cc is disabled: geometric backoff from
    /// 1 s to 30 s.
    pub fn next_probe_interval(&mut self) -> f64 {
        if self.probe_interval < GRTT_INTERVAL_MIN {
            self.probe_interval = GRTT_INTERVAL_MIN;
        } else {
            self.probe_interval *= 1.5;
        }
        if self.probe_interval > GRTT_INTERVAL_MAX {
            self.probe_interval = GRTT_INTERVAL_MAX;
        }
        self.probe_interval
    }
}

impl Default for GrttEstimator {
    fn default() -> Self {
        Self::new()
    }
}
