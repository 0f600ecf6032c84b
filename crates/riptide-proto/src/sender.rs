//! # Sender State Machine
//!
//! Pure logic — no sockets, no timers. The session layer drives the
//! timeout entry points and drains queued PDUs; this module owns the tx
//! object cache, FEC block assembly, flush and watermark collection, NACK
//! aggregation, and the congestion-controlled pacing rate.
//!
//! ## Service order per transmission opportunity
//!
//! 1. A queued `CMD(REPAIR_ADV)` when unicast feedback suppression is due.
//! 2. The first pending object: its INFO first, then DATA — source
//!    symbols in ascending order, parity on demand.
//! 3. With nothing pending: a watermark flush while ACKs are outstanding,
//!    else a plain flush until `robust_factor` flushes have gone out.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::bitmask::SlidingMask;
use crate::congestion::{Feedback, GrttEstimator, RateController, DEFAULT_GSIZE_ESTIMATE};
use crate::fec::RsEncoder;
use crate::object::{Object, ObjectData};
use crate::pool::{BlockPool, SegmentPool, BLOCK_FLAG_IN_REPAIR, BLOCK_FLAG_PARITY_READY};
use crate::seq::{BlockId, NodeId, ObjectId, ObjectSize, SegmentId};
use crate::stats::SenderStats;
use crate::stream::StreamState;
use crate::wire::{
    object_flags, quantize_group_size, quantize_rate, repair_flags, unquantize_loss,
    unquantize_rate, unquantize_rtt, AckPdu, AckType, CcNodeEntry, CcRateExtension, CmdBody,
    CmdPdu, DataPdu, FecPosition, FtiExtension, HeaderExtension, InfoPdu, NackPdu,
    ObjectPduHeader, Pdu, RepairEntry, RepairForm, RepairItem, RepairRequest, ROBUST_FACTOR,
    REPAIR_ADV_FLAG_LIMIT,
};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Sender-side session parameters.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub node_id: NodeId,
    /// Sender instance id carried in every PDU; changes on restart.
    pub session_id: u16,
    pub segment_size: u16,
    pub ndata: u16,
    pub nparity: u16,
    /// Parity symbols sent proactively with every block.
    pub auto_parity: u16,
    /// Extra parity included when answering erasure-count requests.
    pub extra_parity: u16,
    pub backoff_factor: u8,
    pub robust_factor: u32,
    /// Object count the tx cache always admits.
    pub tx_cache_count_min: usize,
    /// Hard object count cap.
    pub tx_cache_count_max: usize,
    /// Aggregate byte budget beyond `tx_cache_count_min` objects.
    pub tx_cache_size_max: u64,
    pub tx_rate: f64,
    pub tx_rate_min: Option<f64>,
    pub tx_rate_max: Option<f64>,
    pub cc_enable: bool,
    /// Advertise the send rate proactively in probes.
    pub probe_proactive: bool,
    /// Emission-control mode: redundant INFO transmission with flushes.
    pub emcon: bool,
    /// The session address is multicast (affects GRTT folding and
    /// unicast-feedback suppression).
    pub multicast: bool,
    pub segment_pool_count: usize,
    pub block_pool_count: usize,
    /// Stream buffer window in blocks.
    pub stream_buffer_blocks: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            node_id: NodeId(0),
            session_id: 0,
            segment_size: 1024,
            ndata: 32,
            nparity: 8,
            auto_parity: 0,
            extra_parity: 0,
            backoff_factor: 4,
            robust_factor: ROBUST_FACTOR,
            tx_cache_count_min: 8,
            tx_cache_count_max: 256,
            tx_cache_size_max: 20 * 1024 * 1024,
            tx_rate: 64_000.0,
            tx_rate_min: None,
            tx_rate_max: None,
            cc_enable: false,
            probe_proactive: false,
            emcon: false,
            multicast: true,
            segment_pool_count: 1024,
            block_pool_count: 64,
            stream_buffer_blocks: 8,
        }
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// Notifications surfaced to the controlling application.
#[derive(Debug, Clone, PartialEq)]
pub enum SenderEvent {
    /// The tx cache can admit more objects.
    QueueVacancy,
    /// Nothing left pending transmission.
    QueueEmpty,
    /// An object was evicted from the cache.
    ObjectPurged(ObjectId),
    /// Flush robustness count reached with no further NACKs.
    FlushCompleted,
    /// Watermark ACK collection finished. `failed` names unresponsive
    /// nodes (empty on full success).
    WatermarkCompleted { failed: Vec<NodeId> },
    /// The advertised GRTT changed.
    GrttUpdated(f64),
    /// Congestion feedback presence changed.
    CcActive,
}

// ─── Watermark ──────────────────────────────────────────────────────────────

struct AckingNode {
    id: NodeId,
    req_count: u32,
    ack_received: bool,
}

struct Watermark {
    position: FecPosition,
    ackers: Vec<AckingNode>,
}

// ─── Repair Aggregation Phase ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepairPhase {
    Inactive,
    /// Collecting NACK state; activation on timer expiry.
    Aggregating,
    /// Recently activated; only requests past the tx position act.
    Holdoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestLevel {
    Segment,
    Block,
    Info,
    Object,
}

// ─── Sender ─────────────────────────────────────────────────────────────────

pub struct Sender {
    config: SenderConfig,
    pub grtt: GrttEstimator,
    pub rate: RateController,
    gsize_quantized: u8,
    objects: HashMap<u16, Object>,
    cache_bytes: u64,
    /// Objects with transmission pending.
    pending_mask: SlidingMask,
    /// Objects with repair state accumulated during NACK aggregation.
    repair_mask: SlidingMask,
    next_object_id: ObjectId,
    segment_pool: SegmentPool,
    block_pool: BlockPool,
    encoder: RsEncoder,
    output: VecDeque<Pdu>,
    events: Vec<SenderEvent>,
    stats: SenderStats,
    // Flush state.
    flush_count: u32,
    next_flush_time: f64,
    last_tx_position: FecPosition,
    emcon_resend: bool,
    // Watermark state.
    watermark: Option<Watermark>,
    acking_nodes: Vec<NodeId>,
    // Repair aggregation.
    repair_phase: RepairPhase,
    advertise_repairs: bool,
    // Congestion probes.
    cc_sequence: u16,
    cc_feedback_seen: bool,
    last_probe_interval: f64,
}

impl Sender {
    pub fn new(config: SenderConfig) -> Self {
        let encoder = RsEncoder::new(config.nparity as usize, config.segment_size as usize);
        let segment_pool =
            SegmentPool::new(config.segment_pool_count, config.segment_size as usize);
        let block_pool = BlockPool::new(config.block_pool_count, config.ndata + config.nparity);
        let mut rate = RateController::new(config.cc_enable, config.tx_rate, config.segment_size);
        rate.tx_rate_min = config.tx_rate_min;
        rate.tx_rate_max = config.tx_rate_max;
        let mask_bits = config.tx_cache_count_max.max(256);
        Sender {
            grtt: GrttEstimator::new(),
            rate,
            gsize_quantized: quantize_group_size(DEFAULT_GSIZE_ESTIMATE),
            objects: HashMap::new(),
            cache_bytes: 0,
            pending_mask: SlidingMask::new(mask_bits, 0xFFFF),
            repair_mask: SlidingMask::new(mask_bits, 0xFFFF),
            next_object_id: ObjectId(0),
            segment_pool,
            block_pool,
            encoder,
            output: VecDeque::new(),
            events: Vec::new(),
            stats: SenderStats::default(),
            flush_count: config.robust_factor + 1,
            next_flush_time: 0.0,
            last_tx_position: FecPosition::default(),
            emcon_resend: false,
            watermark: None,
            acking_nodes: Vec::new(),
            repair_phase: RepairPhase::Inactive,
            advertise_repairs: false,
            cc_sequence: 0,
            cc_feedback_seen: false,
            last_probe_interval: 0.0,
            config,
        }
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = SenderEvent> + '_ {
        self.events.drain(..)
    }

    pub fn object(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(&id.value())
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(&id.value())
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn is_pending(&self) -> bool {
        self.pending_mask.is_set()
    }

    /// Nodes expected to answer watermark requests.
    pub fn set_acking_nodes(&mut self, nodes: Vec<NodeId>) {
        self.acking_nodes = nodes;
    }

    fn oldest_object_id(&self) -> Option<ObjectId> {
        self.objects
            .keys()
            .map(|&k| ObjectId(k))
            .reduce(|a, b| if b < a { b } else { a })
    }

    // ─── Object Admission ───────────────────────────────────────────────

    /// Admit an object into the tx cache and mark it pending. Fails when
    /// the cache is full of objects that still owe transmission or repair.
    pub fn enqueue_object(
        &mut self,
        data: ObjectData,
        size: ObjectSize,
        info: Option<Vec<u8>>,
    ) -> Option<ObjectId> {
        while self.objects.len() >= self.config.tx_cache_count_max
            || (self.objects.len() >= self.config.tx_cache_count_min
                && self.cache_bytes + size.value() > self.config.tx_cache_size_max)
        {
            let oldest = self.oldest_object_id()?;
            let obj = self.objects.get(&oldest.value())?;
            if obj.is_pending() || obj.is_repair_pending() {
                // Everything held still owes transmission; try again later.
                return None;
            }
            self.purge_object(oldest);
            self.events.push(SenderEvent::QueueVacancy);
        }
        let id = self.next_object_id;
        self.next_object_id = id.next();
        let mut obj = Object::open(
            id,
            size,
            data,
            info,
            self.config.segment_size,
            self.config.ndata,
            self.config.nparity,
        );
        obj.tx_reset();
        self.cache_bytes += size.value();
        self.objects.insert(id.value(), obj);
        if !self.pending_mask.set(id.value() as u32) {
            self.pending_mask.clear();
            self.pending_mask.set(id.value() as u32);
        }
        self.flush_count = 0;
        Some(id)
    }

    /// Open a stream object in the cache. `buffer_size` bounds the repair
    /// window.
    pub fn open_stream(
        &mut self,
        buffer_size: ObjectSize,
        info: Option<Vec<u8>>,
    ) -> Option<ObjectId> {
        let blocks = (buffer_size.value()
            / self.config.segment_size as u64
            / self.config.ndata as u64)
            .max(self.config.stream_buffer_blocks as u64) as u32;
        let stream = StreamState::new(self.config.segment_size, self.config.ndata, blocks);
        self.enqueue_object(ObjectData::Stream(stream), buffer_size, info)
    }

    /// Append stream bytes; newly closed segments become pending.
    pub fn write_stream(&mut self, id: ObjectId, buf: &[u8], eom: bool) -> usize {
        let ndata = self.config.ndata;
        let auto_parity = self.config.auto_parity;
        let Some(obj) = self.objects.get_mut(&id.value()) else {
            return 0;
        };
        let Some(stream) = obj.stream_mut() else {
            return 0;
        };
        let written = stream.write(buf, eom);
        let closed = stream.drain_closed();
        let flush = std::mem::take(&mut stream.flush_pending);
        for (block_id, segment_id) in closed {
            if !obj.blocks().contains(block_id) {
                let Some(mut block) = self.block_pool.get() else {
                    self.stats.buffer_drops += 1;
                    continue;
                };
                block.tx_init(block_id, ndata, 0);
                block.clear_pending();
                if let Err(mut block) = obj.blocks_mut().insert(block) {
                    // Window full: the oldest stream block has aged out.
                    if let Some(low) = obj.blocks().low_id() {
                        obj.reclaim_block(low, &mut self.segment_pool, &mut self.block_pool);
                        obj.unset_block_pending(low);
                    }
                    block.tx_init(block_id, ndata, 0);
                    block.clear_pending();
                    if let Err(block) = obj.blocks_mut().insert(block) {
                        self.block_pool.put(block);
                        continue;
                    }
                }
            }
            if let Some(block) = obj.blocks_mut().find_mut(block_id) {
                block.set_pending(segment_id);
                if auto_parity > 0 && segment_id + 1 == ndata {
                    block.set_pending_range(ndata, auto_parity as usize);
                }
            }
            // Long streams outrun the block mask window: abandon the
            // oldest pending blocks to keep moving.
            while !obj.set_block_pending(block_id) {
                match obj.first_pending_block() {
                    Some(b) if b < block_id => {
                        obj.unset_block_pending(b);
                        obj.reclaim_block(b, &mut self.segment_pool, &mut self.block_pool);
                    }
                    _ => break,
                }
            }
            self.pending_mask.set(id.value() as u32);
        }
        if flush || written > 0 {
            self.flush_count = 0;
        }
        written
    }

    fn purge_object(&mut self, id: ObjectId) {
        if let Some(mut obj) = self.objects.remove(&id.value()) {
            obj.close(&mut self.segment_pool, &mut self.block_pool);
            self.cache_bytes = self.cache_bytes.saturating_sub(obj.size().value());
            self.pending_mask.unset(id.value() as u32);
            self.repair_mask.unset(id.value() as u32);
            self.stats.objects_purged += 1;
            self.events.push(SenderEvent::ObjectPurged(id));
        }
    }

    // ─── Transmission Service ───────────────────────────────────────────

    /// Produce the next PDU for the wire, or `None` when idle. The session
    /// layer paces calls at the current tx rate.
    pub fn next_pdu(&mut self, now: f64) -> Option<Pdu> {
        if self.output.is_empty() {
            self.service(now);
        }
        self.output.pop_front()
    }

    /// Seconds until the next transmission opportunity for a PDU of
    /// `len` bytes at the current rate.
    pub fn tx_interval(&self, len: usize) -> f64 {
        len as f64 / self.rate.tx_rate().max(1.0)
    }

    /// When flush work remains, the time it next becomes eligible.
    pub fn next_flush_due(&self) -> Option<f64> {
        let watermark_outstanding = self
            .watermark
            .as_ref()
            .is_some_and(|w| w.ackers.iter().any(|a| !a.ack_received && a.req_count > 0));
        if watermark_outstanding || self.flush_count < self.config.robust_factor {
            Some(self.next_flush_time)
        } else {
            None
        }
    }

    fn service(&mut self, now: f64) {
        if self.advertise_repairs {
            self.advertise_repairs = false;
            self.build_repair_adv();
            return;
        }
        if let Some(oid) = self.pending_mask.first_set() {
            self.build_object_pdu(ObjectId(oid as u16));
            return;
        }
        // Idle: flush / watermark collection, rate-limited to one per
        // 2 * GRTT.
        if now < self.next_flush_time {
            return;
        }
        let watermark_outstanding = self
            .watermark
            .as_ref()
            .is_some_and(|w| w.ackers.iter().any(|a| !a.ack_received && a.req_count > 0));
        if watermark_outstanding {
            self.build_watermark_flush(now);
        } else if self.flush_count < self.config.robust_factor {
            self.build_flush(now);
        }
    }

    fn object_header(&self, object_id: ObjectId, flags: u8) -> ObjectPduHeader {
        ObjectPduHeader {
            sequence: 0, // stamped at emission
            source_id: self.config.node_id,
            session_id: self.config.session_id,
            grtt: self.grtt.quantized(),
            backoff: self.config.backoff_factor,
            gsize: self.gsize_quantized,
            flags,
            object_id,
        }
    }

    fn cmd(&self, body: CmdBody) -> Pdu {
        Pdu::Cmd(CmdPdu {
            sequence: 0,
            source_id: self.config.node_id,
            session_id: self.config.session_id,
            grtt: self.grtt.quantized(),
            backoff: self.config.backoff_factor,
            gsize: self.gsize_quantized,
            body,
        })
    }

    fn fti_extension(&self, size: ObjectSize) -> HeaderExtension {
        HeaderExtension::Fti(FtiExtension {
            object_size: size,
            fec_instance: 0,
            segment_size: self.config.segment_size,
            ndata: self.config.ndata,
            nparity: self.config.nparity,
        })
    }

    fn object_type_flags(obj: &Object) -> u8 {
        let mut flags = 0;
        if obj.is_stream() {
            flags |= object_flags::STREAM;
        }
        if obj.data().is_file() {
            flags |= object_flags::FILE;
        }
        if obj.info().is_some() {
            flags |= object_flags::INFO;
        }
        flags
    }

    /// Emit the next INFO or DATA PDU of the given object.
    fn build_object_pdu(&mut self, oid: ObjectId) {
        let nparity = self.config.nparity;
        let segment_size = self.config.segment_size as usize;
        let auto_parity = self.config.auto_parity;

        let Some(mut obj) = self.objects.remove(&oid.value()) else {
            self.pending_mask.unset(oid.value() as u32);
            return;
        };

        // INFO precedes data.
        if obj.pending_info {
            obj.pending_info = false;
            let mut flags = Self::object_type_flags(&obj);
            if obj.info_sent {
                flags |= object_flags::REPAIR;
            }
            obj.info_sent = true;
            let pdu = Pdu::Info(InfoPdu {
                header: self.object_header(oid, flags),
                extensions: vec![self.fti_extension(obj.size())],
                info: Bytes::from(obj.info().map(|i| i.to_vec()).unwrap_or_default()),
            });
            if flags & object_flags::REPAIR != 0 {
                self.stats.repairs_sent += 1;
            }
            if !self.emcon_resend {
                self.flush_count = 0;
            }
            self.emcon_resend = false;
            self.output.push_back(pdu);
            self.restore_object(oid, obj);
            return;
        }

        let Some(block_id) = obj.first_pending_block() else {
            self.restore_object(oid, obj);
            return;
        };
        let block_len = obj.geometry().block_len(block_id);

        // Ensure block state exists. A block absent here is on its first
        // transmission pass: everything pending.
        if !obj.blocks().contains(block_id) {
            let Some(mut block) = self.block_pool.get() else {
                self.stats.buffer_drops += 1;
                self.objects.insert(oid.value(), obj);
                return; // retry next opportunity
            };
            block.tx_init(block_id, block_len, auto_parity);
            if let Err(block) = obj.blocks_mut().insert(block) {
                warn!(block = block_id.value(), "tx block outside buffer window");
                self.block_pool.put(block);
                obj.unset_block_pending(block_id);
                self.restore_object(oid, obj);
                return;
            }
        }

        // Provision parity slots lazily. Parity symbol ids start at the
        // block's own source count.
        if nparity > 0
            && !obj
                .blocks()
                .find(block_id)
                .is_some_and(|b| b.has_segment(block_len))
        {
            for p in 0..nparity {
                let Some(seg) = self.segment_pool.get() else {
                    self.stats.buffer_drops += 1;
                    self.objects.insert(oid.value(), obj);
                    return;
                };
                obj.blocks_mut()
                    .find_mut(block_id)
                    .expect("block ensured above")
                    .attach_segment(block_len + p, seg);
            }
        }

        let (symbol_id, in_repair) = {
            let block = obj.blocks().find(block_id).expect("block ensured above");
            match block.first_pending() {
                Some(sid) => (sid, block.flag_is_set(BLOCK_FLAG_IN_REPAIR)),
                None => {
                    obj.unset_block_pending(block_id);
                    self.restore_object(oid, obj);
                    return;
                }
            }
        };

        let mut payload = vec![0u8; segment_size];
        let payload_len;
        let mut msg_start = false;
        if symbol_id < block_len {
            // Source symbol from storage.
            let Some(n) = obj.read_segment(block_id, symbol_id, &mut payload) else {
                debug!(
                    object = oid.value(),
                    block = block_id.value(),
                    symbol = symbol_id,
                    "source segment unavailable, dropping from pending"
                );
                if let Some(block) = obj.blocks_mut().find_mut(block_id) {
                    block.unset_pending(symbol_id);
                }
                self.restore_object(oid, obj);
                return;
            };
            payload_len = n;
            msg_start = obj
                .stream()
                .is_some_and(|s| s.segment_is_msg_start(block_id, symbol_id));
            // Fold into the parity shift register while symbols pass in
            // order; out-of-order repairs leave the register alone.
            let block = obj.blocks_mut().find_mut(block_id).expect("block ensured");
            if nparity > 0 && block.parity_offset() == symbol_id {
                let mut parity = block.take_parity(block_len, nparity);
                self.encoder.encode(&payload, &mut parity);
                block.restore_parity(block_len, parity);
                block.set_parity_offset(symbol_id + 1);
                if symbol_id + 1 == block_len {
                    block.set_flag(BLOCK_FLAG_PARITY_READY);
                }
            }
        } else {
            // Parity symbol: make sure the shift register has consumed the
            // whole block (recovered blocks start over from storage).
            if !self.ensure_parity_ready(&mut obj, block_id, block_len) {
                if let Some(block) = obj.blocks_mut().find_mut(block_id) {
                    block.unset_pending(symbol_id);
                }
                self.restore_object(oid, obj);
                return;
            }
            let block = obj.blocks().find(block_id).expect("block ensured");
            let Some(seg) = block.segment(symbol_id) else {
                self.restore_object(oid, obj);
                return;
            };
            payload[..seg.len()].copy_from_slice(seg);
            payload_len = segment_size;
            self.stats.parity_sent += 1;
        }

        // Retire the symbol.
        {
            let block = obj.blocks_mut().find_mut(block_id).expect("block ensured");
            block.unset_pending(symbol_id);
            if !block.is_pending() {
                block.clear_flag(BLOCK_FLAG_IN_REPAIR);
                obj.unset_block_pending(block_id);
            }
        }

        let mut flags = Self::object_type_flags(&obj);
        if in_repair {
            flags |= object_flags::REPAIR;
            self.stats.repairs_sent += 1;
        } else {
            self.flush_count = 0;
        }
        if msg_start {
            flags |= object_flags::MSG_START;
        }
        payload.truncate(payload_len);
        let pdu = Pdu::Data(DataPdu {
            header: self.object_header(oid, flags),
            block_id,
            block_len,
            symbol_id,
            extensions: vec![self.fti_extension(obj.size())],
            payload: Bytes::from(payload),
        });
        self.last_tx_position = FecPosition {
            object_id: oid,
            block_id,
            block_len,
            symbol_id,
        };
        self.stats.bytes_sent += payload_len as u64;
        self.output.push_back(pdu);
        self.restore_object(oid, obj);
    }

    /// Re-insert a serviced object and settle the object-level pending
    /// mask.
    fn restore_object(&mut self, oid: ObjectId, obj: Object) {
        let pending = obj.is_pending();
        self.objects.insert(oid.value(), obj);
        if !pending {
            self.pending_mask.unset(oid.value() as u32);
            if !self.pending_mask.is_set() {
                self.flush_count = 0;
                self.events.push(SenderEvent::QueueEmpty);
            }
        }
    }

    /// Run the parity shift register over any source symbols it has not
    /// yet consumed (the recovery path for evicted blocks).
    fn ensure_parity_ready(&mut self, obj: &mut Object, block_id: BlockId, block_len: u16) -> bool {
        let nparity = self.config.nparity;
        let offset = match obj.blocks().find(block_id) {
            Some(b) => b.parity_offset(),
            None => return false,
        };
        if offset >= block_len {
            return true;
        }
        let mut scratch = vec![0u8; self.config.segment_size as usize];
        for sid in offset..block_len {
            scratch.fill(0);
            if obj.read_segment(block_id, sid, &mut scratch).is_none() {
                warn!(
                    block = block_id.value(),
                    symbol = sid,
                    "parity recovery failed: source unavailable"
                );
                return false;
            }
            let block = obj.blocks_mut().find_mut(block_id).expect("checked above");
            let mut parity = block.take_parity(block_len, nparity);
            self.encoder.encode(&scratch, &mut parity);
            block.restore_parity(block_len, parity);
            block.set_parity_offset(sid + 1);
        }
        if let Some(block) = obj.blocks_mut().find_mut(block_id) {
            block.set_flag(BLOCK_FLAG_PARITY_READY);
        }
        true
    }

    // ─── Flush / Watermark ──────────────────────────────────────────────

    /// Arm a positive-ACK watermark at the given position. All configured
    /// acking nodes owe a matching `ACK(FLUSH)`.
    pub fn set_watermark(&mut self, object_id: ObjectId, block_id: BlockId, symbol_id: SegmentId) {
        let block_len = self
            .objects
            .get(&object_id.value())
            .map(|o| o.geometry().block_len(block_id))
            .unwrap_or(self.config.ndata);
        let robust = self.config.robust_factor;
        self.watermark = Some(Watermark {
            position: FecPosition {
                object_id,
                block_id,
                block_len,
                symbol_id,
            },
            ackers: self
                .acking_nodes
                .iter()
                .map(|&id| AckingNode {
                    id,
                    req_count: robust,
                    ack_received: false,
                })
                .collect(),
        });
        self.flush_count = 0;
    }

    fn build_watermark_flush(&mut self, now: f64) {
        let Some(watermark) = &mut self.watermark else {
            return;
        };
        let mut listed = Vec::new();
        for acker in watermark.ackers.iter_mut() {
            if !acker.ack_received && acker.req_count > 0 {
                acker.req_count -= 1;
                listed.push(acker.id);
            }
        }
        let position = watermark.position;
        let exhausted = watermark
            .ackers
            .iter()
            .all(|a| a.ack_received || a.req_count == 0);
        let pdu = self.cmd(CmdBody::Flush {
            position,
            acking_nodes: listed,
        });
        self.output.push_back(pdu);
        self.stats.flushes_sent += 1;
        self.next_flush_time = now + 2.0 * self.grtt.advertised();
        if exhausted {
            self.finish_watermark();
        }
    }

    fn finish_watermark(&mut self) {
        if let Some(watermark) = self.watermark.take() {
            let failed: Vec<NodeId> = watermark
                .ackers
                .iter()
                .filter(|a| !a.ack_received)
                .map(|a| a.id)
                .collect();
            self.events.push(SenderEvent::WatermarkCompleted { failed });
        }
    }

    fn build_flush(&mut self, now: f64) {
        if self.config.emcon {
            // Emission-controlled senders piggyback a redundant INFO pass
            // on each flush round.
            let oid = self.last_tx_position.object_id;
            if let Some(obj) = self.objects.get_mut(&oid.value()) {
                if obj.info().is_some() && !obj.pending_info {
                    obj.pending_info = true;
                    self.emcon_resend = true;
                    self.pending_mask.set(oid.value() as u32);
                }
            }
        }
        let pdu = self.cmd(CmdBody::Flush {
            position: self.last_tx_position,
            acking_nodes: Vec::new(),
        });
        self.output.push_back(pdu);
        self.stats.flushes_sent += 1;
        self.flush_count += 1;
        self.next_flush_time = now + 2.0 * self.grtt.advertised();
        if self.flush_count >= self.config.robust_factor {
            self.events.push(SenderEvent::FlushCompleted);
        }
    }

    /// Queue an end-of-transmission command.
    pub fn queue_eot(&mut self) {
        let pdu = self.cmd(CmdBody::Eot);
        self.output.push_back(pdu);
    }

    /// Queue an application-defined command.
    pub fn queue_app_cmd(&mut self, content: Vec<u8>) {
        let pdu = self.cmd(CmdBody::Application {
            content: Bytes::from(content),
        });
        self.output.push_back(pdu);
    }

    /// Solicit an application-defined positive acknowledgement from the
    /// configured acking nodes.
    pub fn queue_ack_req(&mut self, ack_type: u8, ack_id: u8) {
        let acking_nodes = self.acking_nodes.clone();
        let pdu = self.cmd(CmdBody::AckReq {
            ack_type,
            ack_id,
            acking_nodes,
        });
        self.output.push_back(pdu);
    }

    fn build_repair_adv(&mut self) {
        let mut request = RepairRequest::new(RepairForm::Items, repair_flags::OBJECT);
        for oid in self.repair_mask.iter() {
            let oid = ObjectId(oid as u16);
            let block_len = self
                .objects
                .get(&oid.value())
                .map(|o| o.geometry().block_len(BlockId(0)))
                .unwrap_or(self.config.ndata);
            request.items.push(RepairItem {
                object_id: oid,
                block_id: BlockId(0),
                block_len,
                symbol_id: 0,
            });
        }
        let flags = if self.rate.suppression_rate().is_some() {
            REPAIR_ADV_FLAG_LIMIT
        } else {
            0
        };
        let extensions = match self.rate.suppression_rate() {
            Some(rate) if self.config.cc_enable => {
                vec![HeaderExtension::CcRate(CcRateExtension {
                    send_rate: quantize_rate(rate),
                })]
            }
            _ => Vec::new(),
        };
        let pdu = self.cmd(CmdBody::RepairAdv {
            flags,
            extensions,
            requests: if request.items.is_empty() {
                Vec::new()
            } else {
                vec![request]
            },
        });
        self.output.push_back(pdu);
    }

    // ─── Feedback Ingest ────────────────────────────────────────────────

    fn process_feedback(
        &mut self,
        now: f64,
        node_id: NodeId,
        response_sec: u32,
        response_usec: u32,
        feedback: Option<crate::wire::CcFeedbackExtension>,
    ) {
        let pkt_interval =
            (44.0 + self.config.segment_size as f64) / self.rate.tx_rate().max(1.0);
        let mut rtt = -1.0;
        if response_sec != 0 || response_usec != 0 {
            let echoed = response_sec as f64 + response_usec as f64 * 1.0e-6;
            rtt = now - echoed;
        }
        if rtt >= 0.0
            && self
                .grtt
                .update_from_response(rtt, self.config.multicast, pkt_interval)
        {
            self.events
                .push(SenderEvent::GrttUpdated(self.grtt.advertised()));
        }
        if let Some(ext) = feedback {
            if !self.cc_feedback_seen {
                self.cc_feedback_seen = true;
                self.events.push(SenderEvent::CcActive);
            }
            self.rate.handle_feedback(
                Feedback {
                    node_id,
                    flags: ext.cc_flags,
                    rtt: if rtt >= 0.0 {
                        rtt
                    } else {
                        unquantize_rtt(ext.cc_rtt)
                    },
                    loss: unquantize_loss(ext.cc_loss),
                    rate: unquantize_rate(ext.cc_rate),
                    cc_sequence: ext.cc_sequence,
                },
                self.grtt.measured(),
            );
        }
    }

    /// Process a received NACK. Returns the aggregation interval when this
    /// NACK started a repair cycle (the session schedules the timer).
    pub fn handle_nack(&mut self, now: f64, nack: &NackPdu, was_unicast: bool) -> Option<f64> {
        self.stats.nacks_received += 1;
        self.process_feedback(
            now,
            nack.source_id,
            nack.grtt_response_sec,
            nack.grtt_response_usec,
            nack.cc_feedback().copied(),
        );
        if was_unicast && self.config.multicast {
            // Unicast feedback: advertise aggregate repair state so other
            // receivers can still suppress.
            self.advertise_repairs = true;
        }

        let holdoff = self.repair_phase == RepairPhase::Holdoff;
        let tx_object = self
            .pending_mask
            .first_set()
            .map(|v| ObjectId(v as u16))
            .unwrap_or(self.next_object_id);
        let mut squelch_queued = false;
        let mut start_timer = false;

        for req in &nack.requests {
            let level = if req.flag_is_set(repair_flags::SEGMENT) {
                RequestLevel::Segment
            } else if req.flag_is_set(repair_flags::BLOCK) {
                RequestLevel::Block
            } else if req.flag_is_set(repair_flags::OBJECT) {
                RequestLevel::Object
            } else {
                RequestLevel::Info
            };
            let erasure_form = req.form == RepairForm::Erasures;
            for entry in req.entries() {
                let (first, last) = match entry {
                    RepairEntry::Item(item) => (item, item),
                    RepairEntry::Range(start, end) => (start, end),
                };
                let mut object_id = first.object_id;
                loop {
                    if !self.objects.contains_key(&object_id.value()) {
                        if !squelch_queued {
                            self.queue_squelch(object_id);
                            squelch_queued = true;
                        }
                    } else {
                        if req.flag_is_set(repair_flags::INFO) {
                            self.mark_info_repair(object_id, holdoff, tx_object);
                        }
                        let acted = match level {
                            RequestLevel::Info => true,
                            RequestLevel::Object => {
                                self.mark_object_repair(object_id, holdoff, tx_object)
                            }
                            RequestLevel::Block => self.mark_block_repair(
                                object_id,
                                first.block_id,
                                if object_id == last.object_id {
                                    last.block_id
                                } else {
                                    first.block_id
                                },
                                holdoff,
                                tx_object,
                            ),
                            RequestLevel::Segment => self.mark_segment_repair(
                                object_id,
                                first,
                                last,
                                erasure_form,
                                holdoff,
                                tx_object,
                            ),
                        };
                        if acted && !holdoff {
                            start_timer = true;
                        }
                    }
                    if object_id == last.object_id
                        || !matches!(level, RequestLevel::Object | RequestLevel::Info)
                    {
                        break;
                    }
                    object_id = object_id.next();
                }
            }
        }

        if start_timer && self.repair_phase == RepairPhase::Inactive {
            self.repair_phase = RepairPhase::Aggregating;
            return Some(self.grtt.advertised() * (self.config.backoff_factor as f64 + 1.0));
        }
        None
    }

    fn mark_info_repair(&mut self, oid: ObjectId, holdoff: bool, tx_object: ObjectId) {
        if let Some(obj) = self.objects.get_mut(&oid.value()) {
            if holdoff {
                if oid > tx_object {
                    obj.handle_info_request(true);
                    if obj.pending_info {
                        self.pending_mask.set(oid.value() as u32);
                    }
                }
            } else {
                obj.handle_info_request(false);
                self.repair_mask.set(oid.value() as u32);
            }
        }
    }

    fn mark_object_repair(&mut self, oid: ObjectId, holdoff: bool, tx_object: ObjectId) -> bool {
        let Some(obj) = self.objects.get_mut(&oid.value()) else {
            return false;
        };
        let total = obj.geometry().total_blocks() as usize;
        let from = match obj.stream() {
            Some(stream) => stream.buffer_low(),
            None => BlockId(0),
        };
        if holdoff {
            if oid > tx_object {
                obj.tx_reset_from(from);
                self.pending_mask.set(oid.value() as u32);
            } else {
                return false;
            }
        } else {
            obj.set_blocks_repair(from, total);
            obj.handle_info_request(false);
            self.repair_mask.set(oid.value() as u32);
        }
        true
    }

    fn mark_block_repair(
        &mut self,
        oid: ObjectId,
        first: BlockId,
        last: BlockId,
        holdoff: bool,
        tx_object: ObjectId,
    ) -> bool {
        let auto = self.config.auto_parity as usize;
        let Some(obj) = self.objects.get_mut(&oid.value()) else {
            return false;
        };
        let count = (last.delta(first).max(0) as usize) + 1;
        if holdoff && oid <= tx_object {
            return false;
        }
        let mut block_id = first;
        for _ in 0..count {
            let block_len = obj.geometry().block_len(block_id);
            if let Some(block) = obj.blocks_mut().find_mut(block_id) {
                block.set_flag(BLOCK_FLAG_IN_REPAIR);
                if holdoff {
                    block.set_pending_range(0, block_len as usize + auto);
                } else {
                    block.set_repair_range(0, block_len as usize + auto);
                }
            }
            // Absent blocks re-enter through the recovery path with full
            // pending state when activated.
            if holdoff {
                obj.set_block_pending(block_id);
                self.pending_mask.set(oid.value() as u32);
            } else {
                obj.set_block_repair(block_id);
                self.repair_mask.set(oid.value() as u32);
            }
            block_id = block_id.next();
        }
        true
    }

    fn mark_segment_repair(
        &mut self,
        oid: ObjectId,
        first: RepairItem,
        last: RepairItem,
        erasure_form: bool,
        holdoff: bool,
        tx_object: ObjectId,
    ) -> bool {
        let nparity = self.config.nparity;
        let extra = self.config.extra_parity;
        if holdoff && oid <= tx_object {
            return false;
        }
        // Resolve (or recover) the block now so segment bits can be set.
        if self
            .objects
            .get(&oid.value())
            .is_some_and(|o| !o.blocks().contains(first.block_id))
            && !self.recover_block(oid, first.block_id)
        {
            return false;
        }
        let Some(obj) = self.objects.get_mut(&oid.value()) else {
            return false;
        };
        let block_len = obj.geometry().block_len(first.block_id);
        let Some(block) = obj.blocks_mut().find_mut(first.block_id) else {
            return false;
        };
        block.set_flag(BLOCK_FLAG_IN_REPAIR);
        if erasure_form {
            // The item's symbol id carries an erasure count: answer with
            // parity symbols.
            let count = (first.symbol_id + extra).min(nparity) as usize;
            if holdoff {
                block.set_pending_range(block_len, count);
            } else {
                block.set_repair_range(block_len, count);
            }
        } else {
            let span = if last.block_id == first.block_id {
                (last.symbol_id.saturating_sub(first.symbol_id)) as usize + 1
            } else {
                1
            };
            if holdoff {
                block.set_pending_range(first.symbol_id, span);
            } else {
                block.set_repair_range(first.symbol_id, span);
            }
        }
        if holdoff {
            obj.set_block_pending(first.block_id);
            self.pending_mask.set(oid.value() as u32);
        } else {
            obj.set_block_repair(first.block_id);
            self.repair_mask.set(oid.value() as u32);
        }
        true
    }

    /// Rebuild block state for a previously-evicted block: source symbols
    /// come back from storage; the parity register restarts.
    fn recover_block(&mut self, oid: ObjectId, block_id: BlockId) -> bool {
        let Some(obj) = self.objects.get_mut(&oid.value()) else {
            return false;
        };
        if let Some(stream) = obj.stream() {
            if block_id < stream.buffer_low() {
                return false; // beyond the stream's repair window
            }
        }
        let block_len = obj.geometry().block_len(block_id);
        let Some(mut block) = self.block_pool.get() else {
            self.stats.buffer_drops += 1;
            return false;
        };
        block.tx_init(block_id, block_len, 0);
        block.clear_pending();
        if let Err(block) = obj.blocks_mut().insert(block) {
            self.block_pool.put(block);
            return false;
        }
        true
    }

    fn queue_squelch(&mut self, invalid: ObjectId) {
        let position = match self.oldest_object_id() {
            Some(oldest) => {
                let obj = &self.objects[&oldest.value()];
                let block_id = match obj.stream() {
                    Some(stream) => stream.buffer_low(),
                    None => BlockId(0),
                };
                FecPosition {
                    object_id: oldest,
                    block_id,
                    block_len: obj.geometry().block_len(block_id),
                    symbol_id: 0,
                }
            }
            None => FecPosition::default(),
        };
        let pdu = self.cmd(CmdBody::Squelch {
            position,
            invalid_objects: vec![invalid],
        });
        self.output.push_back(pdu);
        self.stats.squelches_sent += 1;
        debug!(invalid = invalid.value(), "squelching out-of-window repair request");
    }

    /// Process a received ACK.
    pub fn handle_ack(&mut self, now: f64, ack: &AckPdu, was_unicast: bool) {
        self.stats.acks_received += 1;
        self.process_feedback(
            now,
            ack.source_id,
            ack.grtt_response_sec,
            ack.grtt_response_usec,
            ack.cc_feedback().copied(),
        );
        if was_unicast && self.config.multicast && self.config.probe_proactive {
            self.advertise_repairs = true;
        }
        if ack.ack_type != AckType::Flush {
            return;
        }
        let Some(watermark) = &mut self.watermark else {
            debug!(node = ack.source_id.value(), "unsolicited watermark ACK");
            return;
        };
        let matches = ack.position.is_some_and(|p| {
            p.object_id == watermark.position.object_id
                && p.block_id == watermark.position.block_id
                && p.symbol_id == watermark.position.symbol_id
        });
        if !matches {
            debug!(node = ack.source_id.value(), "watermark ACK position mismatch");
            return;
        }
        if let Some(acker) = watermark
            .ackers
            .iter_mut()
            .find(|a| a.id == ack.source_id && !a.ack_received)
        {
            acker.ack_received = true;
        }
        if watermark.ackers.iter().all(|a| a.ack_received) {
            self.finish_watermark();
        }
    }

    // ─── Repair Timer ───────────────────────────────────────────────────

    /// Advance the two-phase repair timer. Returns the holdoff interval
    /// after the aggregation phase, `None` when the cycle ends.
    pub fn on_repair_timeout(&mut self, _now: f64) -> Option<f64> {
        match self.repair_phase {
            RepairPhase::Aggregating => {
                // Activate everything accumulated during the window.
                let ids: Vec<u32> = self.repair_mask.iter().collect();
                for oid in ids {
                    if let Some(obj) = self.objects.get_mut(&(oid as u16)) {
                        if obj.activate_repairs() {
                            self.pending_mask.set(oid);
                        }
                    }
                }
                self.repair_mask.clear();
                self.repair_phase = RepairPhase::Holdoff;
                Some(self.grtt.advertised())
            }
            RepairPhase::Holdoff => {
                self.repair_phase = RepairPhase::Inactive;
                None
            }
            RepairPhase::Inactive => None,
        }
    }

    // ─── Probes ─────────────────────────────────────────────────────────

    /// Emit a `CMD(CC)` probe and return the next probe interval.
    pub fn on_probe_timeout(&mut self, now: f64) -> f64 {
        let pkt_interval =
            (44.0 + self.config.segment_size as f64) / self.rate.tx_rate().max(1.0);
        if self.grtt.age_estimate(self.last_probe_interval, pkt_interval) {
            self.events
                .push(SenderEvent::GrttUpdated(self.grtt.advertised()));
        }

        let send_time_sec = now as u32;
        let send_time_usec = ((now - send_time_sec as f64) * 1.0e6) as u32;
        let mut nodes = Vec::new();
        if self.config.cc_enable {
            for node in self.rate.nodes() {
                if !node.active {
                    continue;
                }
                let mut flags = crate::wire::cc_flags::RTT;
                if node.is_clr {
                    flags |= crate::wire::cc_flags::CLR;
                }
                if self.rate.in_slow_start() {
                    flags |= crate::wire::cc_flags::START;
                }
                nodes.push(CcNodeEntry {
                    node_id: node.id,
                    flags,
                    rtt: crate::wire::quantize_rtt(node.rtt),
                    rate: quantize_rate(node.rate),
                });
            }
            self.rate.deactivate_candidates();
            self.rate.adjust_rate(false, self.grtt.measured());
        }
        let extensions = if self.config.probe_proactive {
            vec![HeaderExtension::CcRate(CcRateExtension {
                send_rate: quantize_rate(self.rate.tx_rate()),
            })]
        } else {
            Vec::new()
        };
        let pdu = self.cmd(CmdBody::Cc {
            cc_sequence: self.cc_sequence,
            send_time_sec,
            send_time_usec,
            extensions,
            nodes,
        });
        self.cc_sequence = self.cc_sequence.wrapping_add(1);
        self.output.push_back(pdu);
        self.stats.probes_sent += 1;
        self.rate.reset_suppression();

        let interval = if self.config.cc_enable {
            self.rate.probe_interval(self.grtt.advertised())
        } else {
            self.grtt.next_probe_interval()
        };
        self.last_probe_interval = interval;
        interval
    }

    /// Bump the emitted-PDU counter (the session stamps sequences).
    pub fn note_pdu_sent(&mut self) {
        self.stats.pdus_sent += 1;
    }
}
