//! # Receiver State Machine (per remote sender)
//!
//! One [`RemoteSender`] record tracks everything a receiver knows about a
//! sender it hears: sync state, the pending-object window, per-object block
//! buffers, the loss-event estimator, GRTT/CC echoes, and the two-phase
//! NACK timer (randomised backoff, then holdoff).
//!
//! NACK implosion is kept bounded by suppression: while a receiver sits in
//! its backoff, repair state overheard from peer NACKs and from sender
//! `CMD(REPAIR_ADV)` advertisements accumulates in the repair masks; at
//! backoff expiry a NACK goes out only for the residue nobody else asked
//! for.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tracing::{debug, warn};

use crate::bitmask::SlidingMask;
use crate::congestion::calculate_rate;
use crate::fec::RsDecoder;
use crate::loss::LossEstimator;
use crate::object::{MemoryStorage, NackingMode, Object, ObjectData};
use crate::pool::{Block, BlockPool, Segment, SegmentPool};
use crate::seq::{BlockId, NodeId, ObjectId, SegmentId};
use crate::stats::{RateMeter, ReceiverStats};
use crate::stream::{StreamRead, StreamState};
use crate::wire::{
    cc_flags, object_flags, quantize_loss, quantize_rate, quantize_rtt, repair_flags,
    unquantize_group_size, unquantize_rtt, AckPdu, AckType, CcFeedbackExtension, CmdBody, CmdPdu,
    DataPdu, FecPosition, FtiExtension, HeaderExtension, InfoPdu, NackPdu, Pdu, RepairEntry,
    RepairForm, RepairItem, RepairRequest, REPAIR_ADV_FLAG_LIMIT, ROBUST_FACTOR,
};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Where active repair checks are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepairBoundary {
    /// Check on every DATA/INFO receipt (default).
    #[default]
    Block,
    /// Check only at object boundaries.
    Object,
}

/// Receiver-side session parameters.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub node_id: NodeId,
    /// Send NACKs unicast to the sender instead of multicast.
    pub unicast_nacks: bool,
    /// Silent (emission-controlled) receiver: never transmits.
    pub silent: bool,
    pub repair_boundary: RepairBoundary,
    pub default_nacking_mode: NackingMode,
    /// Receiver object window (and sync tolerance).
    pub max_pending_range: u16,
    /// Discard out-of-band info.
    pub ignore_info: bool,
    /// Bound on delivery delay: incomplete objects older than this are
    /// abandoned at activity checks.
    pub max_delay: Option<f64>,
    pub robust_factor: u32,
    pub cc_enable: bool,
    pub segment_pool_count: usize,
    pub block_pool_count: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            node_id: NodeId(0),
            unicast_nacks: false,
            silent: false,
            repair_boundary: RepairBoundary::Block,
            default_nacking_mode: NackingMode::Normal,
            max_pending_range: 256,
            ignore_info: false,
            max_delay: None,
            robust_factor: ROBUST_FACTOR,
            cc_enable: false,
            segment_pool_count: 1024,
            block_pool_count: 64,
        }
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// Receiver-side notifications for the controlling application.
#[derive(Debug, Clone, PartialEq)]
pub enum RxEvent {
    RemoteSenderActive,
    RemoteSenderInactive,
    ObjectNew(ObjectId),
    ObjectInfo(ObjectId),
    ObjectUpdated(ObjectId),
    ObjectCompleted(ObjectId),
    ObjectAborted(ObjectId),
    GrttUpdated(f64),
}

// ─── Randomised Backoff ─────────────────────────────────────────────────────

/// Truncated-exponential backoff over `[0, max]` scaled for `group_size`
/// potential responders.
fn exponential_rand(max: f64, group_size: f64) -> f64 {
    use rand::RngExt;
    if max <= 0.0 {
        return 0.0;
    }
    let lambda = group_size.max(2.0).ln() + 1.0;
    let u: f64 = rand::rng().random();
    let x = u * lambda / max + lambda / (max * (lambda.exp() - 1.0));
    let value = (max / lambda) * (x * (lambda.exp() - 1.0) * (max / lambda)).ln();
    value.clamp(0.0, max)
}

// ─── Rx Resources ───────────────────────────────────────────────────────────

/// FEC parameters learned from the sender's FTI extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecParams {
    pub segment_size: u16,
    pub ndata: u16,
    pub nparity: u16,
}

/// Buffer pools and decode state, created once the FTI is known.
struct RxResources {
    params: FecParams,
    segment_pool: SegmentPool,
    block_pool: BlockPool,
    decoder: RsDecoder,
    /// Scratch source vectors attached at erased positions during decode.
    retrieval: Vec<Segment>,
}

impl RxResources {
    fn new(params: FecParams, config: &ReceiverConfig) -> Self {
        RxResources {
            params,
            segment_pool: SegmentPool::new(
                config.segment_pool_count,
                params.segment_size as usize,
            ),
            block_pool: BlockPool::new(config.block_pool_count, params.ndata + params.nparity),
            decoder: RsDecoder::new(params.nparity as usize, params.segment_size as usize),
            retrieval: (0..params.ndata)
                .map(|_| vec![0u8; params.segment_size as usize])
                .collect(),
        }
    }

    /// Free a block and its segments from the ordinally oldest (silent
    /// receivers) or newest (normal) object holding buffers.
    fn steal(&mut self, objects: &mut HashMap<u16, Object>, silent: bool) -> bool {
        let victim = objects
            .iter()
            .filter(|(_, o)| !o.blocks().is_empty())
            .map(|(&k, _)| ObjectId(k))
            .reduce(|a, b| {
                if (silent && b < a) || (!silent && b > a) {
                    b
                } else {
                    a
                }
            });
        let Some(oid) = victim else {
            return false;
        };
        let obj = objects.get_mut(&oid.value()).expect("victim exists");
        let block_id = if silent {
            obj.blocks().low_id()
        } else {
            obj.blocks().high_id()
        };
        let Some(block_id) = block_id else {
            return false;
        };
        obj.reclaim_block(block_id, &mut self.segment_pool, &mut self.block_pool);
        // The buffered progress is gone; the block must be repaired again.
        obj.set_block_pending(block_id);
        debug!(
            object = oid.value(),
            block = block_id.value(),
            "stole buffered block under memory pressure"
        );
        true
    }

    fn get_block(&mut self, objects: &mut HashMap<u16, Object>, silent: bool) -> Option<Block> {
        if let Some(b) = self.block_pool.get() {
            return Some(b);
        }
        if self.steal(objects, silent) {
            self.block_pool.get()
        } else {
            None
        }
    }

    fn get_segment(&mut self, objects: &mut HashMap<u16, Object>, silent: bool) -> Option<Segment> {
        if let Some(s) = self.segment_pool.get() {
            return Some(s);
        }
        if self.steal(objects, silent) {
            self.segment_pool.get()
        } else {
            None
        }
    }
}

// ─── Repair Timer ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepairTimerPhase {
    Inactive,
    Backoff,
    Holdoff,
}

/// Bound on what a repair check considers needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairCheckLevel {
    ThruInfo,
    ToBlock,
    ThruSegment,
    ThruBlock,
    ThruObject,
}

// ─── RemoteSender ───────────────────────────────────────────────────────────

/// Per-sender receive state: one record for every sender heard.
pub struct RemoteSender {
    config: ReceiverConfig,
    sender_id: NodeId,
    instance_id: Option<u16>,
    // Sync window.
    synced: bool,
    sync_id: ObjectId,
    next_id: ObjectId,
    max_pending_object: ObjectId,
    objects: HashMap<u16, Object>,
    /// Objects still owed to the application (bit set, no instance =
    /// wholly missing).
    pending_mask: SlidingMask,
    /// Objects covered by overheard repair requests this NACK cycle.
    rx_repair_mask: SlidingMask,
    resources: Option<RxResources>,
    // Sender-advertised state.
    grtt_quantized: u8,
    grtt_estimate: f64,
    backoff_factor: f64,
    gsize_estimate: f64,
    /// Last probe send-time echo: (advertised send time, local receipt).
    probe_echo: Option<(f64, f64)>,
    // Congestion feedback state.
    rtt_estimate: f64,
    rtt_confirmed: bool,
    is_clr: bool,
    is_plr: bool,
    cc_sequence_echo: u16,
    remote_rate: f64,
    loss: LossEstimator,
    recv_rate: RateMeter,
    nominal_packet_size: f64,
    cc_response_pending: bool,
    // Repair timer.
    repair_phase: RepairTimerPhase,
    current_object_id: ObjectId,
    // Activity supervision.
    activity_count: u32,
    active: bool,
    output: VecDeque<Pdu>,
    events: Vec<RxEvent>,
    stats: ReceiverStats,
}

impl RemoteSender {
    pub fn new(sender_id: NodeId, config: ReceiverConfig) -> Self {
        let range = config.max_pending_range as usize;
        let mut loss = LossEstimator::new();
        loss.set_event_window(0.5);
        RemoteSender {
            sender_id,
            instance_id: None,
            synced: false,
            sync_id: ObjectId(0),
            next_id: ObjectId(0),
            max_pending_object: ObjectId(0),
            objects: HashMap::new(),
            pending_mask: SlidingMask::new(range, 0xFFFF),
            rx_repair_mask: SlidingMask::new(range, 0xFFFF),
            resources: None,
            grtt_quantized: quantize_rtt(0.5),
            grtt_estimate: unquantize_rtt(quantize_rtt(0.5)),
            backoff_factor: 4.0,
            gsize_estimate: 1000.0,
            probe_echo: None,
            rtt_estimate: 0.5,
            rtt_confirmed: false,
            is_clr: false,
            is_plr: false,
            cc_sequence_echo: 0,
            remote_rate: 0.0,
            loss,
            recv_rate: RateMeter::new(Duration::from_secs(1)),
            nominal_packet_size: 0.0,
            cc_response_pending: false,
            repair_phase: RepairTimerPhase::Inactive,
            current_object_id: ObjectId(0),
            activity_count: config.robust_factor,
            active: false,
            output: VecDeque::new(),
            events: Vec::new(),
            stats: ReceiverStats::default(),
            config,
        }
    }

    pub fn sender_id(&self) -> NodeId {
        self.sender_id
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    pub fn grtt_estimate(&self) -> f64 {
        self.grtt_estimate
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn sync_id(&self) -> ObjectId {
        self.sync_id
    }

    pub fn next_id(&self) -> ObjectId {
        self.next_id
    }

    pub fn fec_params(&self) -> Option<FecParams> {
        self.resources.as_ref().map(|r| r.params)
    }

    pub fn object(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(&id.value())
    }

    pub fn is_object_pending(&self, id: ObjectId) -> bool {
        self.pending_mask.test(id.value() as u32)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = RxEvent> + '_ {
        self.events.drain(..)
    }

    /// Queued NACK/ACK PDUs awaiting transmission.
    pub fn drain_output(&mut self) -> impl Iterator<Item = Pdu> + '_ {
        self.output.drain(..)
    }

    /// Read in-order bytes from a stream object.
    pub fn read_stream(
        &mut self,
        id: ObjectId,
        buf: &mut [u8],
        find_msg_start: bool,
    ) -> Option<StreamRead> {
        let obj = self.objects.get_mut(&id.value())?;
        let result = obj.stream_mut().map(|s| s.read(buf, find_msg_start))?;
        if result.broken {
            self.stats.resyncs += 1;
        }
        Some(result)
    }

    /// Retrieve completed bulk object data (testing and simple embeddings;
    /// real file delivery happens through the storage trait).
    pub fn object_data(&self, id: ObjectId) -> Option<&[u8]> {
        match self.objects.get(&id.value())?.data() {
            ObjectData::Bulk(storage) => Some(storage.data()),
            _ => None,
        }
    }

    // ─── Ingest ─────────────────────────────────────────────────────────

    /// Feed the per-PDU estimators and reset activity supervision.
    fn note_activity(&mut self, now: f64, sequence: u16, bytes: usize) {
        self.stats.pdus_received += 1;
        self.recv_rate.record(bytes as u64);
        if bytes as f64 > self.nominal_packet_size {
            self.nominal_packet_size = bytes as f64;
        }
        self.loss.update(now, sequence, false);
        self.activity_count = self.config.robust_factor;
        if !self.active {
            self.active = true;
            self.events.push(RxEvent::RemoteSenderActive);
        }
    }

    fn update_advertised(&mut self, grtt: u8, backoff: u8, gsize: u8) {
        if grtt != self.grtt_quantized {
            self.grtt_quantized = grtt;
            self.grtt_estimate = unquantize_rtt(grtt);
            self.events.push(RxEvent::GrttUpdated(self.grtt_estimate));
        }
        self.backoff_factor = backoff as f64;
        self.gsize_estimate = unquantize_group_size(gsize);
    }

    fn ensure_resources(&mut self, fti: &FtiExtension) {
        if self.resources.is_none() {
            self.resources = Some(RxResources::new(
                FecParams {
                    segment_size: fti.segment_size,
                    ndata: fti.ndata,
                    nparity: fti.nparity,
                },
                &self.config,
            ));
        }
    }

    fn find_fti(extensions: &[HeaderExtension]) -> Option<&FtiExtension> {
        extensions.iter().find_map(|e| match e {
            HeaderExtension::Fti(fti) => Some(fti),
            _ => None,
        })
    }

    /// Sender restart detection: a changed instance id resets all state.
    fn check_instance(&mut self, session_id: u16) {
        match self.instance_id {
            Some(id) if id != session_id => {
                warn!(
                    sender = self.sender_id.value(),
                    old = id,
                    new = session_id,
                    "sender instance changed, resynchronising"
                );
                self.abort_all_objects();
                self.synced = false;
                self.instance_id = Some(session_id);
                self.resources = None;
                self.pending_mask.clear();
                self.rx_repair_mask.clear();
                self.repair_phase = RepairTimerPhase::Inactive;
                self.stats.resyncs += 1;
            }
            None => self.instance_id = Some(session_id),
            _ => {}
        }
    }

    /// Whether this message may establish initial sync.
    fn sync_policy(&self, is_info: bool, flags: u8, block_id: BlockId, symbol_id: SegmentId) -> bool {
        if flags & object_flags::REPAIR != 0 {
            return false;
        }
        is_info
            || flags & object_flags::STREAM != 0
            || (block_id == BlockId(0) && symbol_id == 0)
    }

    /// Admit `object_id` into the receive window, sliding it forward as
    /// needed. Returns `false` when the id is invalid for this receiver.
    fn update_sync(
        &mut self,
        object_id: ObjectId,
        is_info: bool,
        flags: u8,
        block_id: BlockId,
        symbol_id: SegmentId,
    ) -> bool {
        let range = self.config.max_pending_range;
        if !self.synced {
            if !self.sync_policy(is_info, flags, block_id, symbol_id) {
                self.stats.out_of_window += 1;
                return false;
            }
            self.synced = true;
            self.sync_id = object_id;
            self.next_id = object_id;
            self.max_pending_object = object_id;
        }
        let delta = object_id.delta(self.sync_id);
        if delta < 0 {
            // Precedes the sync point: old transmission, not ours to repair.
            self.stats.out_of_window += 1;
            return false;
        }
        if object_id >= self.next_id {
            // Advance the window, evicting objects that fall off the back.
            while object_id.delta(self.sync_id) >= range as i16 {
                let evict = self.sync_id;
                self.abort_object(evict);
                self.pending_mask.unset(evict.value() as u32);
                self.sync_id = self.sync_id.next();
            }
            let mut id = self.next_id;
            loop {
                self.pending_mask.set(id.value() as u32);
                if id == object_id {
                    break;
                }
                id = id.next();
            }
            self.next_id = object_id.next();
            if object_id > self.max_pending_object {
                self.max_pending_object = object_id;
            }
        } else if !self.pending_mask.test(object_id.value() as u32) {
            // Already completed or abandoned.
            self.stats.duplicates += 1;
            return false;
        }
        true
    }

    fn object_data_for(
        flags: u8,
        size: crate::seq::ObjectSize,
        params: FecParams,
    ) -> ObjectData {
        if flags & object_flags::STREAM != 0 {
            let blocks = (size.value() / params.segment_size as u64 / params.ndata as u64).max(1);
            ObjectData::Stream(StreamState::new(
                params.segment_size,
                params.ndata,
                blocks as u32,
            ))
        } else {
            // FILE objects land in memory here too; a file-backed
            // embedding swaps in its own storage on ObjectNew.
            ObjectData::Bulk(MemoryStorage::with_size(size.value() as usize))
        }
    }

    /// Attach embedding-provided storage to a freshly announced object.
    pub fn set_object_storage(&mut self, id: ObjectId, data: ObjectData) -> bool {
        match self.objects.get_mut(&id.value()) {
            Some(obj) => {
                *obj.data_mut() = data;
                true
            }
            None => false,
        }
    }

    fn get_or_create_object(
        &mut self,
        object_id: ObjectId,
        flags: u8,
        fti: &FtiExtension,
    ) -> bool {
        if self.objects.contains_key(&object_id.value()) {
            return true;
        }
        let params = match self.fec_params() {
            Some(p) => p,
            None => return false,
        };
        let mut obj = Object::open(
            object_id,
            fti.object_size,
            Self::object_data_for(flags, fti.object_size, params),
            None,
            params.segment_size,
            params.ndata,
            params.nparity,
        );
        // Everything is owed until segments arrive.
        obj.set_blocks_pending(BlockId(0), obj.geometry().total_blocks() as usize);
        obj.pending_info = flags & object_flags::INFO != 0 && !self.config.ignore_info;
        obj.nacking_mode = self.config.default_nacking_mode;
        self.objects.insert(object_id.value(), obj);
        self.events.push(RxEvent::ObjectNew(object_id));
        true
    }

    /// Process an INFO PDU from this sender.
    pub fn handle_info(&mut self, now: f64, info: &InfoPdu) -> Option<f64> {
        self.check_instance(info.header.session_id);
        self.note_activity(now, info.header.sequence, info.info.len());
        self.update_advertised(info.header.grtt, info.header.backoff, info.header.gsize);
        let Some(fti) = Self::find_fti(&info.extensions) else {
            self.stats.malformed_pdus += 1;
            return None;
        };
        self.ensure_resources(fti);
        let object_id = info.header.object_id;
        if !self.update_sync(object_id, true, info.header.flags, BlockId(0), 0) {
            return None;
        }
        if !self.get_or_create_object(object_id, info.header.flags, fti) {
            return None;
        }
        let obj = self.objects.get_mut(&object_id.value()).expect("just created");
        if obj.pending_info || obj.info().is_none() {
            if !self.config.ignore_info {
                obj.set_info(info.info.to_vec());
            }
            obj.pending_info = false;
            self.events.push(RxEvent::ObjectInfo(object_id));
            self.check_object_complete(object_id);
        } else {
            self.stats.duplicates += 1;
        }
        match self.config.repair_boundary {
            RepairBoundary::Block => {
                self.repair_check(now, RepairCheckLevel::ThruInfo, object_id, BlockId(0), 0)
            }
            RepairBoundary::Object => self.object_boundary_check(now, object_id),
        }
    }

    /// Process a DATA PDU from this sender. Returns a backoff interval
    /// when a NACK cycle should be scheduled.
    pub fn handle_data(&mut self, now: f64, data: &DataPdu) -> Option<f64> {
        self.check_instance(data.header.session_id);
        self.note_activity(now, data.header.sequence, data.payload.len());
        self.update_advertised(data.header.grtt, data.header.backoff, data.header.gsize);
        self.stats.bytes_received += data.payload.len() as u64;
        let Some(fti) = Self::find_fti(&data.extensions) else {
            self.stats.malformed_pdus += 1;
            return None;
        };
        self.ensure_resources(fti);
        let object_id = data.header.object_id;
        if !self.update_sync(
            object_id,
            false,
            data.header.flags,
            data.block_id,
            data.symbol_id,
        ) {
            return None;
        }
        if !self.get_or_create_object(object_id, data.header.flags, fti) {
            return None;
        }
        self.store_segment(object_id, data);
        self.check_object_complete(object_id);
        match self.config.repair_boundary {
            RepairBoundary::Block => self.repair_check(
                now,
                RepairCheckLevel::ThruSegment,
                object_id,
                data.block_id,
                data.symbol_id,
            ),
            RepairBoundary::Object => self.object_boundary_check(now, object_id),
        }
    }

    /// At object boundaries, NACK everything through the previous object.
    fn object_boundary_check(&mut self, now: f64, object_id: ObjectId) -> Option<f64> {
        if object_id == self.sync_id {
            return None;
        }
        self.repair_check(
            now,
            RepairCheckLevel::ThruObject,
            object_id.prev(),
            BlockId(0),
            0,
        )
    }

    /// Store one received symbol, decoding the block when enough parity
    /// has accumulated.
    fn store_segment(&mut self, object_id: ObjectId, data: &DataPdu) {
        let silent = self.config.silent;
        let Some(mut resources) = self.resources.take() else {
            return;
        };
        let Some(mut obj) = self.objects.remove(&object_id.value()) else {
            self.resources = Some(resources);
            return;
        };
        let params = resources.params;
        let block_id = data.block_id;
        let block_len = obj.geometry().block_len(block_id);
        let symbol_id = data.symbol_id;
        let is_source = (symbol_id as u16) < block_len;

        if symbol_id >= block_len + params.nparity || data.payload.len() > params.segment_size as usize
        {
            self.stats.malformed_pdus += 1;
            self.objects.insert(object_id.value(), obj);
            self.resources = Some(resources);
            return;
        }

        // Streams advance their block window indefinitely; roll the
        // pending mask forward past abandoned blocks.
        if obj.is_stream() && !obj.blocks().contains(block_id) && !obj.is_block_pending(block_id) {
            loop {
                if obj.set_block_pending(block_id) {
                    break;
                }
                match obj.first_pending_block() {
                    Some(b) if b < block_id => {
                        obj.unset_block_pending(b);
                        obj.reclaim_block(b, &mut resources.segment_pool, &mut resources.block_pool);
                    }
                    _ => break,
                }
            }
        }

        // Completed blocks no longer pend: late symbols are duplicates.
        if !obj.is_block_pending(block_id) && !obj.blocks().contains(block_id) {
            self.stats.duplicates += 1;
            self.objects.insert(object_id.value(), obj);
            self.resources = Some(resources);
            return;
        }

        // Resolve the block, allocating (or stealing) on demand.
        if !obj.blocks().contains(block_id) {
            match resources.get_block(&mut self.objects, silent) {
                Some(mut block) => {
                    block.rx_init(block_id, block_len);
                    if let Err(block) = obj.blocks_mut().insert(block) {
                        resources.block_pool.put(block);
                        self.stats.buffer_drops += 1;
                        self.objects.insert(object_id.value(), obj);
                        self.resources = Some(resources);
                        return;
                    }
                }
                None => {
                    self.stats.buffer_drops += 1;
                    self.objects.insert(object_id.value(), obj);
                    self.resources = Some(resources);
                    return;
                }
            }
        }

        let already = obj
            .blocks()
            .find(block_id)
            .is_some_and(|b| b.has_segment(symbol_id));
        if already {
            self.stats.duplicates += 1;
            self.objects.insert(object_id.value(), obj);
            self.resources = Some(resources);
            return;
        }

        let Some(mut segment) = resources.get_segment(&mut self.objects, silent) else {
            self.stats.buffer_drops += 1;
            self.objects.insert(object_id.value(), obj);
            self.resources = Some(resources);
            return;
        };
        segment[..data.payload.len()].copy_from_slice(&data.payload);

        {
            let block = obj.blocks_mut().find_mut(block_id).expect("block resolved");
            block.attach_segment(symbol_id, segment);
            if is_source {
                block.decrement_erasure_count();
                block.unset_pending(symbol_id);
            } else {
                block.increment_parity_count();
            }
        }
        if is_source {
            self.write_source(&mut obj, block_id, symbol_id, &data.payload, data.header.flags);
        }

        // Erasure decode once parity covers the remaining holes.
        let (erasures, parity) = {
            let block = obj.blocks().find(block_id).expect("block resolved");
            (block.erasure_count(), block.parity_count())
        };
        if erasures > 0 && erasures <= parity {
            self.decode_block(&mut obj, &mut resources, block_id, block_len);
        }

        // Block completion: all sources present or recovered.
        let complete = obj
            .blocks()
            .find(block_id)
            .is_some_and(|b| b.erasure_count() == 0);
        if complete {
            obj.unset_block_pending(block_id);
            obj.reclaim_block(block_id, &mut resources.segment_pool, &mut resources.block_pool);
        }
        if block_id > obj.max_pending_block
            || (block_id == obj.max_pending_block && symbol_id > obj.max_pending_segment)
        {
            obj.max_pending_block = block_id;
            obj.max_pending_segment = symbol_id;
        }
        self.events.push(RxEvent::ObjectUpdated(object_id));
        self.objects.insert(object_id.value(), obj);
        self.resources = Some(resources);
    }

    fn write_source(
        &mut self,
        obj: &mut Object,
        block_id: BlockId,
        symbol_id: SegmentId,
        payload: &[u8],
        flags: u8,
    ) {
        match obj.data_mut() {
            ObjectData::Stream(stream) => {
                stream.write_segment_flagged(
                    block_id,
                    symbol_id,
                    payload,
                    flags & object_flags::MSG_START != 0,
                );
            }
            _ => {
                obj.write_segment(block_id, symbol_id, payload);
            }
        }
    }

    fn decode_block(
        &mut self,
        obj: &mut Object,
        resources: &mut RxResources,
        block_id: BlockId,
        block_len: u16,
    ) {
        let params = resources.params;
        let erasure_locs = {
            let block = obj.blocks().find(block_id).expect("block resolved");
            block.erasure_locs(block_len)
        };
        if erasure_locs.is_empty() {
            return;
        }
        // Attach zero scratch vectors at the erased source positions.
        let mut borrowed = Vec::new();
        {
            let block = obj.blocks_mut().find_mut(block_id).expect("block resolved");
            for &loc in &erasure_locs {
                let Some(mut scratch) = resources.retrieval.pop() else {
                    break;
                };
                scratch.fill(0);
                block.attach_segment(loc, scratch);
                borrowed.push(loc);
            }
        }
        if borrowed.len() < erasure_locs.len() {
            // Not enough scratch: back out and wait for more parity.
            let block = obj.blocks_mut().find_mut(block_id).expect("block resolved");
            for &loc in &borrowed {
                if let Some(seg) = block.detach_segment(loc) {
                    resources.retrieval.push(seg);
                }
            }
            warn!(block = block_id.value(), "decode deferred: retrieval pool dry");
            return;
        }

        let mut segments = {
            let block = obj.blocks_mut().find_mut(block_id).expect("block resolved");
            block.take_segments()
        };
        let nvecs = (block_len + params.nparity) as usize;
        resources
            .decoder
            .decode(&mut segments[..nvecs], block_len as usize, &erasure_locs);

        // Recovered sources go to storage; scratch returns to the pool.
        for &loc in &erasure_locs {
            if let Some(seg) = segments[loc as usize].take() {
                let len = obj.geometry().segment_len(block_id, loc) as usize;
                match obj.data_mut() {
                    ObjectData::Stream(stream) => {
                        // The recovered vector carries the stream payload
                        // header; its own length field governs.
                        stream.write_segment(block_id, loc, &seg);
                    }
                    _ => {
                        obj.write_segment(block_id, loc, &seg[..len]);
                    }
                }
                resources.retrieval.push(seg);
                self.stats.fec_recoveries += 1;
            }
        }
        let block = obj.blocks_mut().find_mut(block_id).expect("block resolved");
        block.restore_segments(segments);
        for _ in 0..erasure_locs.len() {
            block.decrement_erasure_count();
        }
        block.clear_pending();
    }

    fn check_object_complete(&mut self, object_id: ObjectId) {
        let complete = self
            .objects
            .get(&object_id.value())
            .is_some_and(|o| !o.is_stream() && !o.is_pending());
        if complete {
            self.pending_mask.unset(object_id.value() as u32);
            self.stats.objects_completed += 1;
            self.events.push(RxEvent::ObjectCompleted(object_id));
        }
    }

    /// Take a completed object out of the receiver (the application owns
    /// it from here).
    pub fn retrieve_object(&mut self, id: ObjectId) -> Option<Object> {
        let done = self
            .objects
            .get(&id.value())
            .is_some_and(|o| !o.is_pending());
        if done {
            self.objects.remove(&id.value())
        } else {
            None
        }
    }

    fn abort_object(&mut self, id: ObjectId) {
        if let Some(mut obj) = self.objects.remove(&id.value()) {
            if let Some(res) = self.resources.as_mut() {
                obj.close(&mut res.segment_pool, &mut res.block_pool);
            }
            self.stats.objects_aborted += 1;
            self.events.push(RxEvent::ObjectAborted(id));
        }
    }

    fn abort_all_objects(&mut self) {
        let ids: Vec<u16> = self.objects.keys().copied().collect();
        for id in ids {
            self.abort_object(ObjectId(id));
        }
    }

    // ─── Commands ───────────────────────────────────────────────────────

    /// Process a CMD PDU from this sender. Returns a timer interval when a
    /// NACK backoff or CC response should be scheduled.
    pub fn handle_cmd(&mut self, now: f64, cmd: &CmdPdu) -> Option<f64> {
        self.check_instance(cmd.session_id);
        self.note_activity(now, cmd.sequence, 16);
        self.update_advertised(cmd.grtt, cmd.backoff, cmd.gsize);
        match &cmd.body {
            CmdBody::Flush {
                position,
                acking_nodes,
            } => {
                let watermark = acking_nodes.contains(&self.config.node_id);
                let interval = self.repair_check(
                    now,
                    RepairCheckLevel::ThruSegment,
                    position.object_id,
                    position.block_id,
                    position.symbol_id,
                );
                if watermark && interval.is_none() && !self.config.silent {
                    // Fully repaired through the watermark: positive ACK.
                    self.queue_flush_ack(now, *position);
                }
                interval
            }
            CmdBody::Eot => {
                debug!(sender = self.sender_id.value(), "end of transmission");
                self.abort_all_objects();
                self.pending_mask.clear();
                None
            }
            CmdBody::Squelch {
                position,
                invalid_objects,
            } => {
                self.handle_squelch(position, invalid_objects);
                None
            }
            CmdBody::Cc {
                cc_sequence,
                send_time_sec,
                send_time_usec,
                extensions,
                nodes,
            } => {
                self.cc_sequence_echo = *cc_sequence;
                self.probe_echo = Some((
                    *send_time_sec as f64 + *send_time_usec as f64 * 1.0e-6,
                    now,
                ));
                for ext in extensions {
                    if let HeaderExtension::CcRate(rate) = ext {
                        self.remote_rate = crate::wire::unquantize_rate(rate.send_rate);
                    }
                }
                let mut listed = false;
                for node in nodes {
                    if node.node_id == self.config.node_id {
                        listed = true;
                        self.is_clr = node.flags & cc_flags::CLR != 0;
                        self.is_plr = node.flags & cc_flags::PLR != 0;
                        if node.flags & cc_flags::RTT != 0 {
                            self.rtt_confirmed = true;
                            self.rtt_estimate = unquantize_rtt(node.rtt);
                        }
                    }
                }
                if !listed {
                    self.is_clr = false;
                    self.is_plr = false;
                }
                if self.config.cc_enable && !self.config.silent {
                    self.cc_response_pending = true;
                    if self.is_clr || self.is_plr {
                        Some(0.0)
                    } else {
                        Some(exponential_rand(
                            self.grtt_estimate * self.backoff_factor.max(1.0),
                            self.gsize_estimate,
                        ))
                    }
                } else {
                    None
                }
            }
            CmdBody::RepairAdv {
                flags,
                extensions,
                requests,
            } => {
                for ext in extensions {
                    if let HeaderExtension::CcRate(rate) = ext {
                        self.remote_rate = crate::wire::unquantize_rate(rate.send_rate);
                    }
                }
                if *flags & REPAIR_ADV_FLAG_LIMIT != 0
                    && self.remote_rate > 0.0
                    && self.nominal_feedback_rate() >= self.remote_rate
                {
                    // The advertised limit already covers our rate.
                    self.cc_response_pending = false;
                }
                self.merge_repair_state(requests);
                None
            }
            CmdBody::AckReq { .. } | CmdBody::Application { .. } => None,
        }
    }

    fn handle_squelch(&mut self, position: &FecPosition, invalid_objects: &[ObjectId]) {
        // Everything before the advertised low water mark is gone for good.
        while self.sync_id < position.object_id {
            let evict = self.sync_id;
            self.abort_object(evict);
            self.pending_mask.unset(evict.value() as u32);
            self.sync_id = self.sync_id.next();
        }
        if self.next_id < self.sync_id {
            self.next_id = self.sync_id;
        }
        for &id in invalid_objects {
            self.abort_object(id);
            self.pending_mask.unset(id.value() as u32);
        }
        self.stats.resyncs += 1;
    }

    // ─── Suppression ────────────────────────────────────────────────────

    /// Merge repair state overheard in a peer NACK for this sender.
    pub fn handle_peer_nack(&mut self, nack: &NackPdu) {
        self.merge_repair_state(&nack.requests);
        if let Some(fb) = nack.cc_feedback() {
            self.suppress_cc_response(fb);
        }
    }

    /// Account a peer's ACK (CC feedback suppression).
    pub fn handle_peer_ack(&mut self, ack: &AckPdu) {
        if let Some(fb) = ack.cc_feedback() {
            self.suppress_cc_response(fb);
        }
    }

    fn suppress_cc_response(&mut self, fb: &CcFeedbackExtension) {
        if fb.flag_is_set(cc_flags::CLR) {
            return;
        }
        let peer_rate = crate::wire::unquantize_rate(fb.cc_rate);
        let my_rate = self.nominal_feedback_rate();
        if self.cc_response_pending && peer_rate <= my_rate {
            self.cc_response_pending = false;
        }
    }

    fn merge_repair_state(&mut self, requests: &[RepairRequest]) {
        if self.repair_phase != RepairTimerPhase::Backoff {
            return;
        }
        for req in requests {
            let object_level = req.flag_is_set(repair_flags::OBJECT)
                || (!req.flag_is_set(repair_flags::BLOCK)
                    && !req.flag_is_set(repair_flags::SEGMENT));
            for entry in req.entries() {
                let (first, last) = match entry {
                    RepairEntry::Item(item) => (item, item),
                    RepairEntry::Range(a, b) => (a, b),
                };
                if object_level {
                    let mut id = first.object_id;
                    loop {
                        self.rx_repair_mask.set(id.value() as u32);
                        if id == last.object_id {
                            break;
                        }
                        id = id.next();
                    }
                } else if let Some(obj) = self.objects.get_mut(&first.object_id.value()) {
                    if req.flag_is_set(repair_flags::SEGMENT) {
                        if let Some(block) = obj.blocks_mut().find_mut(first.block_id) {
                            let span = if last.block_id == first.block_id {
                                last.symbol_id.saturating_sub(first.symbol_id) as usize + 1
                            } else {
                                1
                            };
                            block.set_repair_range(first.symbol_id, span);
                        } else {
                            obj.set_block_repair(first.block_id);
                        }
                    } else {
                        let count = last.block_id.delta(first.block_id).max(0) as usize + 1;
                        obj.set_blocks_repair(first.block_id, count);
                    }
                }
            }
        }
    }

    // ─── Repair Check / NACK Cycle ──────────────────────────────────────

    /// Evaluate whether repair is needed through the given position and
    /// start the NACK backoff if so. Returns the backoff interval for the
    /// session to schedule.
    pub fn repair_check(
        &mut self,
        now: f64,
        level: RepairCheckLevel,
        object_id: ObjectId,
        block_id: BlockId,
        symbol_id: SegmentId,
    ) -> Option<f64> {
        let _ = now;
        if self.config.silent || self.config.default_nacking_mode == NackingMode::None {
            return None;
        }
        match self.repair_phase {
            RepairTimerPhase::Inactive => {
                if !self.repair_needed(level, object_id, block_id, symbol_id) {
                    return None;
                }
                self.current_object_id = object_id;
                self.rx_repair_mask.clear();
                for obj in self.objects.values_mut() {
                    obj.clear_repairs();
                }
                self.repair_phase = RepairTimerPhase::Backoff;
                let backoff = if self.config.unicast_nacks {
                    0.0
                } else {
                    exponential_rand(
                        self.grtt_estimate * self.backoff_factor,
                        self.gsize_estimate,
                    )
                };
                Some(backoff)
            }
            RepairTimerPhase::Backoff => None,
            RepairTimerPhase::Holdoff => {
                if object_id < self.current_object_id {
                    // The sender's position rewound: repair is live again.
                    self.repair_phase = RepairTimerPhase::Inactive;
                    self.repair_check(now, level, object_id, block_id, symbol_id)
                } else {
                    None
                }
            }
        }
    }

    fn repair_needed(
        &self,
        level: RepairCheckLevel,
        object_id: ObjectId,
        block_id: BlockId,
        symbol_id: SegmentId,
    ) -> bool {
        let Some(first) = self.pending_mask.first_set().map(|v| ObjectId(v as u16)) else {
            return false;
        };
        if first > object_id {
            return false;
        }
        if first < object_id {
            return true; // anything older still pending
        }
        // The trigger object itself: apply the level bound.
        let obj = self.objects.get(&object_id.value());
        match level {
            RepairCheckLevel::ThruObject => true,
            RepairCheckLevel::ThruInfo => obj.is_none_or(|o| o.pending_info),
            RepairCheckLevel::ToBlock => obj.is_none_or(|o| {
                o.pending_info || o.first_pending_block().is_some_and(|b| b < block_id)
            }),
            RepairCheckLevel::ThruBlock => obj.is_none_or(|o| {
                o.pending_info || o.first_pending_block().is_some_and(|b| b <= block_id)
            }),
            RepairCheckLevel::ThruSegment => {
                obj.is_none_or(|o| o.repair_needed_through(block_id, symbol_id))
            }
        }
    }

    /// Advance the two-phase repair timer. At backoff expiry a NACK is
    /// built unless fully suppressed; the returned interval is the holdoff
    /// to schedule. `None` ends the cycle.
    pub fn on_repair_timeout(&mut self, now: f64) -> Option<f64> {
        match self.repair_phase {
            RepairTimerPhase::Backoff => {
                if self.nack_residue_exists() {
                    self.build_and_queue_nack(now);
                } else {
                    self.stats.nacks_suppressed += 1;
                }
                self.repair_phase = RepairTimerPhase::Holdoff;
                let holdoff = if self.config.unicast_nacks {
                    self.grtt_estimate
                } else {
                    self.grtt_estimate * (self.backoff_factor + 2.0)
                };
                Some(holdoff)
            }
            RepairTimerPhase::Holdoff => {
                self.repair_phase = RepairTimerPhase::Inactive;
                None
            }
            RepairTimerPhase::Inactive => None,
        }
    }

    /// Anything pending through the trigger position that no peer already
    /// requested?
    fn nack_residue_exists(&self) -> bool {
        let mut next = self.pending_mask.first_set().map(|v| ObjectId(v as u16));
        while let Some(id) = next {
            if id > self.current_object_id {
                break;
            }
            if !self.rx_repair_mask.test(id.value() as u32) {
                match self.objects.get(&id.value()) {
                    None => return true, // wholly missing, unrequested
                    Some(obj) => {
                        if obj.pending_info && !obj.repair_info {
                            return true;
                        }
                        let mut block = obj.first_pending_block();
                        while let Some(b) = block {
                            if !obj.is_block_repair(b) {
                                match obj.blocks().find(b) {
                                    None => return true,
                                    Some(blk) => {
                                        let mut sid = blk.first_pending();
                                        while let Some(s) = sid {
                                            if !blk.is_repair_set(s) {
                                                return true;
                                            }
                                            sid = blk.next_pending(s + 1);
                                        }
                                    }
                                }
                            }
                            block = obj.next_pending_block(b.next());
                        }
                    }
                }
            }
            if id == self.max_pending_object {
                break;
            }
            next = self
                .pending_mask
                .next_set(id.value() as u32 + 1)
                .map(|v| ObjectId(v as u16));
        }
        false
    }

    fn grtt_response(&self, now: f64) -> (u32, u32) {
        match self.probe_echo {
            Some((send_time, recv_time)) => {
                // Echo the probe timestamp advanced by our hold time.
                let t = send_time + (now - recv_time);
                let sec = t as u32;
                let usec = ((t - sec as f64) * 1.0e6) as u32;
                (sec, usec)
            }
            None => (0, 0),
        }
    }

    fn nominal_feedback_rate(&self) -> f64 {
        let loss = if self.loss.no_loss() {
            0.0
        } else {
            self.loss.loss_fraction()
        };
        if loss == 0.0 {
            2.0 * self.recv_rate.rate()
        } else {
            let size = self.nominal_packet_size.max(1.0);
            calculate_rate(size, self.rtt_estimate, loss)
        }
    }

    fn cc_feedback(&self) -> CcFeedbackExtension {
        let loss = if self.loss.no_loss() {
            0.0
        } else {
            self.loss.loss_fraction()
        };
        let mut flags = 0u8;
        if self.is_clr {
            flags |= cc_flags::CLR;
        } else if self.is_plr {
            flags |= cc_flags::PLR;
        }
        if self.rtt_confirmed {
            flags |= cc_flags::RTT;
        }
        if loss == 0.0 {
            flags |= cc_flags::START;
        }
        CcFeedbackExtension {
            cc_sequence: self.cc_sequence_echo,
            cc_flags: flags,
            cc_rtt: quantize_rtt(self.rtt_estimate),
            cc_loss: quantize_loss(loss),
            cc_rate: quantize_rate(self.nominal_feedback_rate().max(1.0)),
        }
    }

    fn queue_flush_ack(&mut self, now: f64, position: FecPosition) {
        let (sec, usec) = self.grtt_response(now);
        let extensions = if self.config.cc_enable {
            vec![HeaderExtension::CcFeedback(self.cc_feedback())]
        } else {
            Vec::new()
        };
        self.output.push_back(Pdu::Ack(AckPdu {
            sequence: 0,
            source_id: self.config.node_id,
            server_id: self.sender_id,
            session_id: self.instance_id.unwrap_or(0),
            ack_type: AckType::Flush,
            ack_id: 0,
            grtt_response_sec: sec,
            grtt_response_usec: usec,
            extensions,
            position: Some(position),
        }));
        self.stats.acks_sent += 1;
        // The ACK carries our feedback; no separate CC response owed.
        self.cc_response_pending = false;
    }

    /// Emit the scheduled `ACK(CC)` probe response, unless suppressed in
    /// the meantime.
    pub fn on_cc_response_timeout(&mut self, now: f64) {
        if !std::mem::take(&mut self.cc_response_pending) {
            return;
        }
        let (sec, usec) = self.grtt_response(now);
        self.output.push_back(Pdu::Ack(AckPdu {
            sequence: 0,
            source_id: self.config.node_id,
            server_id: self.sender_id,
            session_id: self.instance_id.unwrap_or(0),
            ack_type: AckType::Cc,
            ack_id: 0,
            grtt_response_sec: sec,
            grtt_response_usec: usec,
            extensions: vec![HeaderExtension::CcFeedback(self.cc_feedback())],
            position: None,
        }));
        self.stats.acks_sent += 1;
    }

    // ─── NACK Construction ──────────────────────────────────────────────

    fn build_and_queue_nack(&mut self, now: f64) {
        let Some(params) = self.fec_params() else {
            return;
        };
        let budget = params.segment_size as usize;
        let mut requests: Vec<RepairRequest> = Vec::new();
        let mut used = 0usize;

        // Consecutive wholly-missing objects aggregate into OBJECT
        // items/ranges; present objects append their own block/segment
        // requests.
        let mut missing_run: Vec<ObjectId> = Vec::new();
        let object_ids: Vec<ObjectId> = {
            let mut ids = Vec::new();
            let mut next = self.pending_mask.first_set().map(|v| ObjectId(v as u16));
            while let Some(id) = next {
                if id > self.max_pending_object {
                    break;
                }
                ids.push(id);
                if id == self.max_pending_object {
                    break;
                }
                next = self
                    .pending_mask
                    .next_set(id.value() as u32 + 1)
                    .map(|v| ObjectId(v as u16));
            }
            ids
        };

        for (i, &oid) in object_ids.iter().enumerate() {
            if used >= budget {
                break;
            }
            let suppressed = self.rx_repair_mask.test(oid.value() as u32);
            let missing = !self.objects.contains_key(&oid.value());
            let run_continues = missing
                && !suppressed
                && missing_run.last().is_none_or(|&last| last.next() == oid);
            if missing && !suppressed && run_continues {
                missing_run.push(oid);
            } else {
                Self::flush_missing_run(
                    &mut missing_run,
                    &mut requests,
                    &mut used,
                    params.ndata,
                    self.config.default_nacking_mode,
                );
                if missing && !suppressed {
                    missing_run.push(oid);
                }
            }
            if !missing && !suppressed {
                let flush = oid != self.max_pending_object || i + 1 < object_ids.len();
                self.append_object_requests(oid, flush, &mut requests, &mut used, budget);
            }
        }
        Self::flush_missing_run(
            &mut missing_run,
            &mut requests,
            &mut used,
            params.ndata,
            self.config.default_nacking_mode,
        );

        if requests.is_empty() {
            self.stats.nacks_suppressed += 1;
            return;
        }
        let (sec, usec) = self.grtt_response(now);
        let extensions = if self.config.cc_enable {
            // NACK feedback substitutes for a pending CC response.
            self.cc_response_pending = false;
            vec![HeaderExtension::CcFeedback(self.cc_feedback())]
        } else {
            Vec::new()
        };
        self.output.push_back(Pdu::Nack(NackPdu {
            sequence: 0,
            source_id: self.config.node_id,
            server_id: self.sender_id,
            session_id: self.instance_id.unwrap_or(0),
            grtt_response_sec: sec,
            grtt_response_usec: usec,
            extensions,
            requests,
        }));
        self.stats.nacks_sent += 1;
    }

    fn flush_missing_run(
        run: &mut Vec<ObjectId>,
        requests: &mut Vec<RepairRequest>,
        used: &mut usize,
        ndata: u16,
        nacking_mode: NackingMode,
    ) {
        if run.is_empty() {
            return;
        }
        let flag = match nacking_mode {
            NackingMode::InfoOnly => repair_flags::INFO,
            _ => repair_flags::OBJECT | repair_flags::INFO,
        };
        let item = |oid: ObjectId| RepairItem {
            object_id: oid,
            block_id: BlockId(0),
            block_len: ndata,
            symbol_id: 0,
        };
        let req = if run.len() >= 3 {
            let mut req = RepairRequest::new(RepairForm::Ranges, flag);
            req.items.push(item(run[0]));
            req.items.push(item(*run.last().expect("non-empty")));
            req
        } else {
            let mut req = RepairRequest::new(RepairForm::Items, flag);
            for &oid in run.iter() {
                req.items.push(item(oid));
            }
            req
        };
        *used += req.encoded_len();
        requests.push(req);
        run.clear();
    }

    /// Append block/segment-level requests for a partially received
    /// object. `flush` requests through the object's end; otherwise the
    /// request stops at the last position transmission has reached.
    fn append_object_requests(
        &mut self,
        oid: ObjectId,
        flush: bool,
        requests: &mut Vec<RepairRequest>,
        used: &mut usize,
        budget: usize,
    ) {
        let Some(obj) = self.objects.get(&oid.value()) else {
            return;
        };
        let ndata = obj.geometry().ndata;
        if obj.pending_info && !obj.repair_info {
            let mut req = RepairRequest::new(RepairForm::Items, repair_flags::INFO);
            req.items.push(RepairItem {
                object_id: oid,
                block_id: BlockId(0),
                block_len: ndata,
                symbol_id: 0,
            });
            *used += req.encoded_len();
            requests.push(req);
        }
        if obj.nacking_mode != NackingMode::Normal {
            return;
        }
        let bound = if flush {
            None
        } else {
            Some((obj.max_pending_block, obj.max_pending_segment))
        };

        let mut missing_blocks: Vec<BlockId> = Vec::new();
        let mut block = obj.first_pending_block();
        while let Some(b) = block {
            if *used >= budget {
                break;
            }
            if let Some((max_block, _)) = bound {
                if b > max_block {
                    break;
                }
            }
            if obj.is_block_repair(b) {
                block = obj.next_pending_block(b.next());
                continue; // suppressed by overheard request
            }
            match obj.blocks().find(b) {
                None => missing_blocks.push(b),
                Some(blk) => {
                    // Partial block: SEGMENT items/range over the pending
                    // span, bounded at the transmission position.
                    let first = blk.first_pending();
                    let mut last = blk.last_pending();
                    if let Some((max_block, max_seg)) = bound {
                        if b == max_block {
                            last = last.map(|l| l.min(max_seg));
                        }
                    }
                    if let (Some(first), Some(last)) = (first, last) {
                        if first <= last
                            && !(blk.is_repair_set(first) && blk.is_repair_set(last))
                        {
                            let block_len = obj.geometry().block_len(b);
                            let mut req = RepairRequest::new(
                                if last > first {
                                    RepairForm::Ranges
                                } else {
                                    RepairForm::Items
                                },
                                repair_flags::SEGMENT | repair_flags::BLOCK,
                            );
                            req.items.push(RepairItem {
                                object_id: oid,
                                block_id: b,
                                block_len,
                                symbol_id: first,
                            });
                            if last > first {
                                req.items.push(RepairItem {
                                    object_id: oid,
                                    block_id: b,
                                    block_len,
                                    symbol_id: last,
                                });
                            }
                            *used += req.encoded_len();
                            requests.push(req);
                        }
                    }
                }
            }
            block = obj.next_pending_block(b.next());
        }

        // Wholly-missing blocks collapse to BLOCK items/ranges.
        if !missing_blocks.is_empty() && *used < budget {
            let block_len = obj.geometry().block_len(missing_blocks[0]);
            let item = |b: BlockId| RepairItem {
                object_id: oid,
                block_id: b,
                block_len,
                symbol_id: 0,
            };
            // Collapse consecutive runs.
            let mut i = 0;
            while i < missing_blocks.len() {
                let start = missing_blocks[i];
                let mut end = start;
                while i + 1 < missing_blocks.len()
                    && missing_blocks[i + 1] == end.next()
                {
                    end = missing_blocks[i + 1];
                    i += 1;
                }
                let req = if end.delta(start) >= 2 {
                    let mut req = RepairRequest::new(RepairForm::Ranges, repair_flags::BLOCK);
                    req.items.push(item(start));
                    req.items.push(item(end));
                    req
                } else {
                    let mut req = RepairRequest::new(RepairForm::Items, repair_flags::BLOCK);
                    req.items.push(item(start));
                    if end != start {
                        req.items.push(item(end));
                    }
                    req
                };
                *used += req.encoded_len();
                requests.push(req);
                i += 1;
            }
        }
    }

    // ─── Activity Supervision ───────────────────────────────────────────

    /// The per-repeat activity interval: `max(2 * robust * grtt, 1 s)`.
    pub fn activity_interval(&self) -> f64 {
        (2.0 * self.config.robust_factor as f64 * self.grtt_estimate).max(1.0)
    }

    /// One activity-timer repeat elapsed with no traffic. Returns `false`
    /// on final expiry: buffers are freed and the sender marked inactive.
    pub fn on_activity_timeout(&mut self, _now: f64) -> bool {
        // Bounded-delay delivery: give up on stale incomplete objects.
        if self.config.max_delay.is_some() {
            let stale: Vec<u16> = self
                .objects
                .iter()
                .filter(|(_, o)| !o.is_stream() && o.is_pending())
                .map(|(&k, _)| k)
                .collect();
            for id in stale {
                self.abort_object(ObjectId(id));
                self.pending_mask.unset(id as u32);
            }
        }
        if self.activity_count > 0 {
            self.activity_count -= 1;
            return true;
        }
        // Final expiry: free everything; state re-acquires on resync.
        self.abort_all_objects();
        if let Some(res) = self.resources.as_mut() {
            debug!(
                sender = self.sender_id.value(),
                in_use = res.segment_pool.in_use(),
                "sender inactive, buffers freed"
            );
        }
        self.synced = false;
        self.pending_mask.clear();
        self.active = false;
        self.events.push(RxEvent::RemoteSenderInactive);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MemoryStorage;
    use crate::sender::{Sender, SenderConfig};
    use crate::seq::ObjectSize;

    fn rx_config() -> ReceiverConfig {
        ReceiverConfig {
            node_id: NodeId(100),
            cc_enable: false,
            ..Default::default()
        }
    }

    fn tx_config() -> SenderConfig {
        SenderConfig {
            node_id: NodeId(1),
            session_id: 7,
            segment_size: 64,
            ndata: 4,
            nparity: 2,
            ..Default::default()
        }
    }

    /// Build the wire PDUs for one bulk object via a real sender.
    fn sender_pdus(data: &[u8]) -> Vec<Pdu> {
        let mut sender = Sender::new(tx_config());
        sender
            .enqueue_object(
                ObjectData::Bulk(MemoryStorage::from_data(data.to_vec())),
                ObjectSize::from(data.len() as u32),
                None,
            )
            .unwrap();
        let mut out = Vec::new();
        while let Some(pdu) = sender.next_pdu(0.0) {
            if matches!(pdu, Pdu::Info(_) | Pdu::Data(_)) {
                out.push(pdu);
            }
        }
        out
    }

    fn deliver(rx: &mut RemoteSender, now: f64, pdu: &Pdu) -> Option<f64> {
        match pdu {
            Pdu::Info(info) => rx.handle_info(now, info),
            Pdu::Data(data) => rx.handle_data(now, data),
            Pdu::Cmd(cmd) => rx.handle_cmd(now, cmd),
            _ => None,
        }
    }

    // ─── Reassembly ─────────────────────────────────────────────────────

    #[test]
    fn lossless_delivery_completes_object() {
        let data: Vec<u8> = (0..256u32).map(|i| i as u8).collect();
        let pdus = sender_pdus(&data);
        let mut rx = RemoteSender::new(NodeId(1), rx_config());
        for pdu in &pdus {
            deliver(&mut rx, 0.0, pdu);
        }
        let events: Vec<RxEvent> = rx.drain_events().collect();
        assert!(events.contains(&RxEvent::ObjectCompleted(ObjectId(0))));
        assert_eq!(rx.object_data(ObjectId(0)).unwrap(), &data[..]);
        assert!(!rx.is_object_pending(ObjectId(0)));
        assert_eq!(rx.stats().objects_completed, 1);
    }

    #[test]
    fn fec_recovers_dropped_sources() {
        let data: Vec<u8> = (0..256u32).map(|i| i as u8).collect();
        let mut sender = Sender::new(SenderConfig {
            auto_parity: 2,
            ..tx_config()
        });
        sender
            .enqueue_object(
                ObjectData::Bulk(MemoryStorage::from_data(data.clone())),
                ObjectSize::from(256u32),
                None,
            )
            .unwrap();
        let mut rx = RemoteSender::new(NodeId(1), rx_config());
        let mut seq = 0u16;
        while let Some(mut pdu) = sender.next_pdu(0.0) {
            pdu.set_sequence(seq);
            seq = seq.wrapping_add(1);
            if let Pdu::Data(d) = &pdu {
                // Drop source symbols 1 and 2; parity must recover them.
                if d.is_data() && (d.symbol_id == 1 || d.symbol_id == 2) {
                    continue;
                }
                rx.handle_data(0.0, d);
            }
        }
        assert_eq!(rx.stats().fec_recoveries, 2);
        assert_eq!(rx.object_data(ObjectId(0)).unwrap(), &data[..]);
        let events: Vec<RxEvent> = rx.drain_events().collect();
        assert!(events.contains(&RxEvent::ObjectCompleted(ObjectId(0))));
    }

    #[test]
    fn duplicates_counted_not_stored() {
        let pdus = sender_pdus(&[0u8; 128]);
        let mut rx = RemoteSender::new(NodeId(1), rx_config());
        for pdu in &pdus {
            deliver(&mut rx, 0.0, pdu);
        }
        for pdu in &pdus {
            deliver(&mut rx, 0.1, pdu);
        }
        assert!(rx.stats().duplicates >= pdus.len() as u64);
    }

    // ─── Sync ───────────────────────────────────────────────────────────

    #[test]
    fn sync_acquisition_scenario() {
        // INFO for object 1000, then DATA for object 1001 block 0.
        let mut rx = RemoteSender::new(NodeId(1), rx_config());
        let mut sender = Sender::new(tx_config());
        // Skip the sender's object ids forward to 1000.
        for _ in 0..1000 {
            let id = sender
                .enqueue_object(
                    ObjectData::Bulk(MemoryStorage::with_size(16)),
                    ObjectSize::from(16u32),
                    None,
                )
                .unwrap();
            while sender.next_pdu(0.0).is_some() {}
            let _ = id;
        }
        sender
            .enqueue_object(
                ObjectData::Bulk(MemoryStorage::with_size(64)),
                ObjectSize::from(64u32),
                Some(b"i".to_vec()),
            )
            .unwrap();
        let mut pdus = Vec::new();
        while let Some(pdu) = sender.next_pdu(0.0) {
            pdus.push(pdu);
        }
        sender
            .enqueue_object(
                ObjectData::Bulk(MemoryStorage::with_size(64)),
                ObjectSize::from(64u32),
                None,
            )
            .unwrap();
        while let Some(pdu) = sender.next_pdu(0.0) {
            pdus.push(pdu);
        }

        // Deliver the INFO for 1000 first.
        let info = pdus
            .iter()
            .find(|p| matches!(p, Pdu::Info(i) if i.header.object_id == ObjectId(1000)))
            .unwrap();
        deliver(&mut rx, 0.0, info);
        assert_eq!(rx.sync_id(), ObjectId(1000));
        assert_eq!(rx.next_id(), ObjectId(1001));

        // Then DATA for 1001: window rolls forward, both pending.
        let data_1001 = pdus
            .iter()
            .find(|p| matches!(p, Pdu::Data(d) if d.header.object_id == ObjectId(1001)))
            .unwrap();
        deliver(&mut rx, 0.1, data_1001);
        assert_eq!(rx.next_id(), ObjectId(1002));
        assert!(rx.is_object_pending(ObjectId(1000)));
        assert!(rx.is_object_pending(ObjectId(1001)));
    }

    #[test]
    fn repair_flagged_pdu_never_syncs() {
        let pdus = sender_pdus(&[0u8; 64]);
        let mut rx = RemoteSender::new(NodeId(1), rx_config());
        let Pdu::Data(data) = &pdus[0] else {
            panic!("expected data");
        };
        let mut repair = data.clone();
        repair.header.flags |= object_flags::REPAIR;
        rx.handle_data(0.0, &repair);
        assert!(!rx.is_synced());
        assert_eq!(rx.stats().out_of_window, 1);
        rx.handle_data(0.1, data);
        assert!(rx.is_synced());
    }

    #[test]
    fn instance_change_forces_resync() {
        let pdus = sender_pdus(&[0u8; 64]);
        let mut rx = RemoteSender::new(NodeId(1), rx_config());
        for pdu in &pdus {
            deliver(&mut rx, 0.0, pdu);
        }
        assert!(rx.is_synced());
        let Pdu::Data(data) = &pdus[0] else {
            panic!("expected data");
        };
        let mut restarted = data.clone();
        restarted.header.session_id = 8;
        rx.handle_data(1.0, &restarted);
        assert!(rx.stats().resyncs >= 1);
        assert!(rx.is_synced(), "restart resyncs on the sync-eligible pdu");
    }

    // ─── NACK Cycle ─────────────────────────────────────────────────────

    fn lossy_rx(drop_symbol: u16) -> (RemoteSender, Vec<Pdu>) {
        let data: Vec<u8> = (0..256u32).map(|i| i as u8).collect();
        let pdus = sender_pdus(&data);
        let mut rx = RemoteSender::new(NodeId(1), rx_config());
        let mut backoff = None;
        for pdu in &pdus {
            if let Pdu::Data(d) = pdu {
                if d.symbol_id == drop_symbol {
                    continue;
                }
            }
            let b = deliver(&mut rx, 0.0, pdu);
            backoff = backoff.or(b);
        }
        assert!(backoff.is_some(), "loss must arm the NACK backoff");
        (rx, pdus)
    }

    #[test]
    fn gap_arms_backoff_and_nack_names_missing_segment() {
        let (mut rx, _) = lossy_rx(1);
        let holdoff = rx.on_repair_timeout(1.0);
        assert!(holdoff.is_some());
        let out: Vec<Pdu> = rx.drain_output().collect();
        assert_eq!(out.len(), 1);
        match &out[0] {
            Pdu::Nack(nack) => {
                assert_eq!(nack.server_id, NodeId(1));
                let req = &nack.requests[0];
                assert!(req.flag_is_set(repair_flags::SEGMENT));
                assert_eq!(req.items[0].object_id, ObjectId(0));
                assert_eq!(req.items[0].symbol_id, 1);
            }
            other => panic!("expected NACK, got {other:?}"),
        }
        assert_eq!(rx.stats().nacks_sent, 1);
        // Holdoff completes the cycle.
        assert!(rx.on_repair_timeout(2.0).is_none());
    }

    #[test]
    fn overheard_nack_suppresses_ours() {
        let (mut rx, _) = lossy_rx(1);
        // A peer NACK covering the same segment arrives during backoff.
        let mut req = RepairRequest::new(
            RepairForm::Items,
            repair_flags::SEGMENT | repair_flags::BLOCK,
        );
        req.items.push(RepairItem {
            object_id: ObjectId(0),
            block_id: BlockId(0),
            block_len: 4,
            symbol_id: 1,
        });
        let peer = NackPdu {
            sequence: 0,
            source_id: NodeId(200),
            server_id: NodeId(1),
            session_id: 7,
            grtt_response_sec: 0,
            grtt_response_usec: 0,
            extensions: vec![],
            requests: vec![req],
        };
        rx.handle_peer_nack(&peer);
        rx.on_repair_timeout(1.0);
        assert_eq!(rx.drain_output().count(), 0, "fully suppressed");
        assert_eq!(rx.stats().nacks_suppressed, 1);
        assert_eq!(rx.stats().nacks_sent, 0);
    }

    #[test]
    fn partially_suppressed_nack_sends_residue() {
        // Missing segments 1 and 2; the peer only asked for 1.
        let data: Vec<u8> = (0..256u32).map(|i| i as u8).collect();
        let pdus = sender_pdus(&data);
        let mut rx = RemoteSender::new(NodeId(1), rx_config());
        for pdu in &pdus {
            if let Pdu::Data(d) = pdu {
                if d.symbol_id == 1 || d.symbol_id == 2 {
                    continue;
                }
            }
            deliver(&mut rx, 0.0, pdu);
        }
        let mut req = RepairRequest::new(
            RepairForm::Items,
            repair_flags::SEGMENT | repair_flags::BLOCK,
        );
        req.items.push(RepairItem {
            object_id: ObjectId(0),
            block_id: BlockId(0),
            block_len: 4,
            symbol_id: 1,
        });
        rx.handle_peer_nack(&NackPdu {
            sequence: 0,
            source_id: NodeId(200),
            server_id: NodeId(1),
            session_id: 7,
            grtt_response_sec: 0,
            grtt_response_usec: 0,
            extensions: vec![],
            requests: vec![req],
        });
        rx.on_repair_timeout(1.0);
        let out: Vec<Pdu> = rx.drain_output().collect();
        assert_eq!(out.len(), 1, "residue (segment 2) still warrants a NACK");
    }

    #[test]
    fn missing_objects_collapse_to_ranges() {
        // Receive only object 3's data; objects 0-2 wholly missing.
        let mut sender = Sender::new(tx_config());
        let mut pdus = Vec::new();
        for _ in 0..4 {
            sender
                .enqueue_object(
                    ObjectData::Bulk(MemoryStorage::with_size(64)),
                    ObjectSize::from(64u32),
                    None,
                )
                .unwrap();
            while let Some(pdu) = sender.next_pdu(0.0) {
                pdus.push(pdu);
            }
        }
        let mut rx = RemoteSender::new(NodeId(1), rx_config());
        // Sync on object 0's first PDU, then jump to object 3.
        deliver(&mut rx, 0.0, &pdus[0]);
        for pdu in &pdus {
            if let Pdu::Data(d) = pdu {
                if d.header.object_id == ObjectId(3) {
                    deliver(&mut rx, 0.1, pdu);
                }
            }
        }
        rx.on_repair_timeout(1.0);
        let out: Vec<Pdu> = rx.drain_output().collect();
        let Pdu::Nack(nack) = &out[0] else {
            panic!("expected NACK");
        };
        // Objects 1-2 missing (0 was partially received, 3 complete):
        // expect an OBJECT-flagged request naming 1..2 plus segment
        // requests for object 0.
        let object_req = nack
            .requests
            .iter()
            .find(|r| r.flag_is_set(repair_flags::OBJECT))
            .expect("object-level request present");
        assert_eq!(object_req.items[0].object_id, ObjectId(1));
        let seg_req = nack
            .requests
            .iter()
            .find(|r| r.flag_is_set(repair_flags::SEGMENT));
        assert!(seg_req.is_some(), "object 0 needs segment repair");
    }

    #[test]
    fn rewind_during_holdoff_restarts_cycle() {
        let (mut rx, _) = lossy_rx(1);
        rx.on_repair_timeout(1.0); // backoff -> NACK -> holdoff
        rx.drain_output().for_each(drop);
        // A repair check during holdoff at the current position is inert.
        assert!(rx
            .repair_check(2.0, RepairCheckLevel::ThruObject, ObjectId(0), BlockId(0), 0)
            .is_none());
        // A check at a position that rewound *before* the cycle's trigger
        // exits the holdoff; the next check at the trigger re-arms.
        rx.repair_check(
            2.2,
            RepairCheckLevel::ThruObject,
            ObjectId(0).prev(),
            BlockId(0),
            0,
        );
        let rearm = rx.repair_check(2.5, RepairCheckLevel::ThruObject, ObjectId(0), BlockId(0), 0);
        assert!(rearm.is_some(), "cycle re-arms after early holdoff exit");
    }

    // ─── Flush / Watermark ──────────────────────────────────────────────

    #[test]
    fn flush_with_no_loss_yields_watermark_ack() {
        let pdus = sender_pdus(&[7u8; 256]);
        let mut rx = RemoteSender::new(NodeId(1), rx_config());
        for pdu in &pdus {
            deliver(&mut rx, 0.0, pdu);
        }
        let flush = CmdPdu {
            sequence: 99,
            source_id: NodeId(1),
            session_id: 7,
            grtt: quantize_rtt(0.5),
            backoff: 4,
            gsize: 2,
            body: CmdBody::Flush {
                position: FecPosition {
                    object_id: ObjectId(0),
                    block_id: BlockId(0),
                    block_len: 4,
                    symbol_id: 3,
                },
                acking_nodes: vec![NodeId(100)],
            },
        };
        let timer = rx.handle_cmd(1.0, &flush);
        assert!(timer.is_none(), "nothing pending: no NACK cycle");
        let out: Vec<Pdu> = rx.drain_output().collect();
        assert_eq!(out.len(), 1);
        match &out[0] {
            Pdu::Ack(ack) => {
                assert_eq!(ack.ack_type, AckType::Flush);
                let p = ack.position.unwrap();
                assert_eq!(p.object_id, ObjectId(0));
                assert_eq!(p.symbol_id, 3);
            }
            other => panic!("expected ACK, got {other:?}"),
        }
    }

    #[test]
    fn flush_with_loss_starts_nack_cycle_instead() {
        let (mut rx, _) = lossy_rx(2);
        // Drain the armed cycle first.
        rx.on_repair_timeout(0.5);
        rx.on_repair_timeout(1.0);
        rx.drain_output().for_each(drop);
        let flush = CmdPdu {
            sequence: 99,
            source_id: NodeId(1),
            session_id: 7,
            grtt: quantize_rtt(0.5),
            backoff: 4,
            gsize: 2,
            body: CmdBody::Flush {
                position: FecPosition {
                    object_id: ObjectId(0),
                    block_id: BlockId(0),
                    block_len: 4,
                    symbol_id: 3,
                },
                acking_nodes: vec![NodeId(100)],
            },
        };
        let timer = rx.handle_cmd(2.0, &flush);
        assert!(timer.is_some(), "pending repair forces a NACK cycle");
        assert_eq!(rx.drain_output().count(), 0, "no premature watermark ACK");
    }

    // ─── Squelch / EOT ──────────────────────────────────────────────────

    #[test]
    fn squelch_drops_old_window() {
        let mut sender = Sender::new(tx_config());
        let mut pdus = Vec::new();
        for _ in 0..3 {
            sender
                .enqueue_object(
                    ObjectData::Bulk(MemoryStorage::with_size(64)),
                    ObjectSize::from(64u32),
                    None,
                )
                .unwrap();
            while let Some(pdu) = sender.next_pdu(0.0) {
                pdus.push(pdu);
            }
        }
        let mut rx = RemoteSender::new(NodeId(1), rx_config());
        deliver(&mut rx, 0.0, &pdus[0]); // sync at object 0
        let squelch = CmdPdu {
            sequence: 50,
            source_id: NodeId(1),
            session_id: 7,
            grtt: quantize_rtt(0.5),
            backoff: 4,
            gsize: 2,
            body: CmdBody::Squelch {
                position: FecPosition {
                    object_id: ObjectId(2),
                    block_id: BlockId(0),
                    block_len: 4,
                    symbol_id: 0,
                },
                invalid_objects: vec![],
            },
        };
        rx.handle_cmd(1.0, &squelch);
        assert_eq!(rx.sync_id(), ObjectId(2));
        assert!(!rx.is_object_pending(ObjectId(0)));
        assert!(rx.stats().resyncs >= 1);
    }

    #[test]
    fn eot_aborts_pending_objects() {
        let (mut rx, _) = lossy_rx(1);
        let eot = CmdPdu {
            sequence: 60,
            source_id: NodeId(1),
            session_id: 7,
            grtt: quantize_rtt(0.5),
            backoff: 4,
            gsize: 2,
            body: CmdBody::Eot,
        };
        rx.handle_cmd(5.0, &eot);
        let events: Vec<RxEvent> = rx.drain_events().collect();
        assert!(events.contains(&RxEvent::ObjectAborted(ObjectId(0))));
    }

    // ─── CC Probe / Feedback ────────────────────────────────────────────

    fn cc_probe(send_time: f64, nodes: Vec<crate::wire::CcNodeEntry>) -> CmdPdu {
        CmdPdu {
            sequence: 70,
            source_id: NodeId(1),
            session_id: 7,
            grtt: quantize_rtt(0.5),
            backoff: 4,
            gsize: 2,
            body: CmdBody::Cc {
                cc_sequence: 5,
                send_time_sec: send_time as u32,
                send_time_usec: ((send_time.fract()) * 1.0e6) as u32,
                extensions: vec![],
                nodes,
            },
        }
    }

    #[test]
    fn cc_probe_schedules_response_with_feedback() {
        let pdus = sender_pdus(&[1u8; 64]);
        let mut config = rx_config();
        config.cc_enable = true;
        let mut rx = RemoteSender::new(NodeId(1), config);
        for pdu in &pdus {
            deliver(&mut rx, 0.0, pdu);
        }
        let delay = rx.handle_cmd(10.0, &cc_probe(10.0, vec![]));
        assert!(delay.is_some());
        rx.on_cc_response_timeout(10.5);
        let out: Vec<Pdu> = rx.drain_output().collect();
        assert_eq!(out.len(), 1);
        match &out[0] {
            Pdu::Ack(ack) => {
                assert_eq!(ack.ack_type, AckType::Cc);
                let fb = ack.cc_feedback().expect("feedback attached");
                assert!(fb.flag_is_set(cc_flags::START), "no loss yet: slow start");
                assert_eq!(fb.cc_sequence, 5);
                // GRTT echo: send_time advanced by the 0.5 s hold.
                assert_eq!(ack.grtt_response_sec, 10);
                assert!((ack.grtt_response_usec as f64 - 0.5e6).abs() < 1.0e4);
            }
            other => panic!("expected ACK(CC), got {other:?}"),
        }
    }

    #[test]
    fn clr_listing_confirms_rtt_and_responds_immediately() {
        let pdus = sender_pdus(&[1u8; 64]);
        let mut config = rx_config();
        config.cc_enable = true;
        config.node_id = NodeId(100);
        let mut rx = RemoteSender::new(NodeId(1), config);
        for pdu in &pdus {
            deliver(&mut rx, 0.0, pdu);
        }
        let probe = cc_probe(
            1.0,
            vec![crate::wire::CcNodeEntry {
                node_id: NodeId(100),
                flags: cc_flags::CLR | cc_flags::RTT,
                rtt: quantize_rtt(0.1),
                rate: quantize_rate(50_000.0),
            }],
        );
        let delay = rx.handle_cmd(1.0, &probe);
        assert_eq!(delay, Some(0.0), "the CLR responds immediately");
        rx.on_cc_response_timeout(1.0);
        let out: Vec<Pdu> = rx.drain_output().collect();
        let Pdu::Ack(ack) = &out[0] else { panic!() };
        let fb = ack.cc_feedback().unwrap();
        assert!(fb.flag_is_set(cc_flags::CLR));
        assert!(fb.flag_is_set(cc_flags::RTT), "rtt confirmed by the echo");
    }

    #[test]
    fn peer_feedback_suppresses_cc_response() {
        let pdus = sender_pdus(&[1u8; 64]);
        let mut config = rx_config();
        config.cc_enable = true;
        let mut rx = RemoteSender::new(NodeId(1), config);
        for pdu in &pdus {
            deliver(&mut rx, 0.0, pdu);
        }
        rx.handle_cmd(1.0, &cc_probe(1.0, vec![]));
        // A peer with a *lower* rate answers first.
        rx.handle_peer_ack(&AckPdu {
            sequence: 0,
            source_id: NodeId(200),
            server_id: NodeId(1),
            session_id: 7,
            ack_type: AckType::Cc,
            ack_id: 0,
            grtt_response_sec: 0,
            grtt_response_usec: 0,
            extensions: vec![HeaderExtension::CcFeedback(CcFeedbackExtension {
                cc_sequence: 5,
                cc_flags: 0,
                cc_rtt: quantize_rtt(0.2),
                cc_loss: 0,
                cc_rate: quantize_rate(1.0),
            })],
            position: None,
        });
        rx.on_cc_response_timeout(2.0);
        assert_eq!(rx.drain_output().count(), 0, "response suppressed");
    }

    // ─── Activity ───────────────────────────────────────────────────────

    #[test]
    fn activity_timeout_frees_state_after_repeats() {
        let pdus = sender_pdus(&[1u8; 64]);
        let mut config = rx_config();
        config.robust_factor = 2;
        let mut rx = RemoteSender::new(NodeId(1), config);
        for pdu in &pdus {
            deliver(&mut rx, 0.0, pdu);
        }
        assert!(rx.activity_interval() >= 1.0);
        assert!(rx.on_activity_timeout(10.0));
        assert!(rx.on_activity_timeout(20.0));
        assert!(!rx.on_activity_timeout(30.0), "final expiry");
        let events: Vec<RxEvent> = rx.drain_events().collect();
        assert!(events.contains(&RxEvent::RemoteSenderInactive));
        assert!(!rx.is_synced());
    }

    // ─── Buffer Stealing ────────────────────────────────────────────────

    #[test]
    fn pool_exhaustion_steals_from_newest_object() {
        let mut config = rx_config();
        config.block_pool_count = 1;
        let mut sender = Sender::new(tx_config());
        let mut rx = RemoteSender::new(NodeId(1), config);
        // Two objects, each losing a segment so their blocks stay resident.
        for _ in 0..2 {
            sender
                .enqueue_object(
                    ObjectData::Bulk(MemoryStorage::with_size(256)),
                    ObjectSize::from(256u32),
                    None,
                )
                .unwrap();
            while let Some(pdu) = sender.next_pdu(0.0) {
                if let Pdu::Data(d) = &pdu {
                    if d.symbol_id == 1 {
                        continue; // keep each block incomplete
                    }
                    rx.handle_data(0.0, d);
                }
            }
        }
        // The single block got stolen for the second object; both objects
        // remain pending.
        assert!(rx.is_object_pending(ObjectId(0)));
        assert!(rx.is_object_pending(ObjectId(1)));
        assert_eq!(rx.stats().buffer_drops, 0, "steal avoided the drop");
    }

    // ─── Streams ────────────────────────────────────────────────────────

    #[test]
    fn stream_segments_flow_to_read_path() {
        let mut sender = Sender::new(tx_config());
        let sid = sender.open_stream(ObjectSize::from(4096u32), None).unwrap();
        sender.write_stream(sid, &[0xAB; 112], false); // two 56-byte segments
        let mut rx = RemoteSender::new(NodeId(1), rx_config());
        while let Some(pdu) = sender.next_pdu(0.0) {
            if let Pdu::Data(d) = &pdu {
                rx.handle_data(0.0, d);
            }
        }
        let mut buf = [0u8; 256];
        let read = rx.read_stream(sid, &mut buf, false).unwrap();
        assert_eq!(read.bytes, 112);
        assert!(!read.broken);
        assert_eq!(&buf[..112], &[0xAB; 112]);
    }
}
