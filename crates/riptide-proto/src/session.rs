//! # Session Orchestration
//!
//! A [`Session`] multiplexes one optional local sender and any number of
//! remote-sender records behind a single ingest/egress surface. It owns no
//! sockets and no scheduler: the embedding feeds received datagrams to
//! [`Session::handle_datagram`], drives [`Session::advance`] at (or before)
//! the deadline it returns, and ships the PDUs drained from
//! [`Session::drain_output`].
//!
//! Internally `advance` runs the protocol timers: tx pacing, GRTT probes,
//! the sender's NACK-aggregation timer, and each remote sender's NACK
//! backoff/holdoff, CC response, and activity supervision.

use std::collections::HashMap;

use anyhow::{bail, Result};
use bytes::Bytes;
use tracing::debug;

use crate::fec::MAX_BLOCK_LEN;
use crate::object::ObjectData;
use crate::receiver::{ReceiverConfig, RemoteSender, RxEvent};
use crate::seq::{BlockId, NodeId, ObjectId, ObjectSize, SegmentId};
use crate::sender::{Sender, SenderConfig, SenderEvent};
use crate::stream::StreamRead;
use crate::wire::{stream_payload, Pdu, MAX_PDU_SIZE};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Per-session configuration: identity and transport knobs are recorded
/// for the embedding (which owns the sockets); the sender/receiver halves
/// are enabled by their sub-configs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub local_node_id: NodeId,
    /// Session (group) address and port, for the embedding's sockets.
    pub address: Option<std::net::SocketAddr>,
    /// Separate transmit port, when bound apart from the rx socket.
    pub tx_port: Option<u16>,
    pub ttl: u8,
    pub tos: u8,
    pub loopback: bool,
    pub multicast_interface: Option<String>,
    pub rx_port_reuse: bool,
    /// Local sender role, when enabled.
    pub sender: Option<SenderConfig>,
    /// Receiver role, when enabled.
    pub receiver: Option<ReceiverConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            local_node_id: NodeId(0),
            address: None,
            tx_port: None,
            ttl: 255,
            tos: 0,
            loopback: false,
            multicast_interface: None,
            rx_port_reuse: false,
            sender: None,
            receiver: None,
        }
    }
}

// ─── Egress ─────────────────────────────────────────────────────────────────

/// Where an outbound PDU goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// The session (group) address.
    Session,
    /// Unicast to a specific node (unicast NACKs/ACKs).
    Node(NodeId),
}

/// A PDU ready for the wire, with its destination.
#[derive(Debug, Clone)]
pub struct OutboundPdu {
    pub pdu: Pdu,
    pub dest: Destination,
}

impl OutboundPdu {
    /// Serialize for the socket.
    pub fn encode(&self) -> Bytes {
        self.pdu.encode().freeze()
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// Controller callbacks multiplexed across both roles.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Sender(SenderEvent),
    /// A sender was heard for the first time.
    RemoteSenderNew(NodeId),
    Rx { sender: NodeId, event: RxEvent },
}

// ─── Timers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    Tx,
    Probe,
    SenderRepair,
    RxRepair(u32),
    CcResponse(u32),
    Activity(u32),
}

struct TimerEntry {
    due: f64,
    timer: Timer,
}

// ─── Session ────────────────────────────────────────────────────────────────

pub struct Session {
    config: SessionConfig,
    sender: Option<Sender>,
    remote_senders: HashMap<u32, RemoteSender>,
    timers: Vec<TimerEntry>,
    /// One sequence space for every PDU this node emits.
    tx_sequence: u16,
    output: Vec<OutboundPdu>,
    events: Vec<SessionEvent>,
    /// Datagrams dropped before reaching any state machine.
    pub malformed_pdus: u64,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Session> {
        if let Some(sc) = &config.sender {
            if sc.ndata as usize + sc.nparity as usize > MAX_BLOCK_LEN {
                bail!(
                    "ndata + nparity = {} exceeds the {MAX_BLOCK_LEN}-symbol field",
                    sc.ndata + sc.nparity
                );
            }
            if sc.segment_size as usize > MAX_PDU_SIZE - 64 {
                bail!("segment_size {} cannot fit a PDU", sc.segment_size);
            }
            if sc.segment_size as usize <= stream_payload::HEADER_LEN {
                bail!("segment_size {} below stream payload header", sc.segment_size);
            }
            if sc.ndata == 0 {
                bail!("ndata must be non-zero");
            }
        }
        let sender = config.sender.clone().map(Sender::new);
        let mut session = Session {
            sender,
            remote_senders: HashMap::new(),
            timers: Vec::new(),
            tx_sequence: 0,
            output: Vec::new(),
            events: Vec::new(),
            malformed_pdus: 0,
            config,
        };
        if session.sender.is_some() {
            // Probes start with the session.
            session.arm(0.0, Timer::Probe);
        }
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn local_node_id(&self) -> NodeId {
        self.config.local_node_id
    }

    pub fn sender(&self) -> Option<&Sender> {
        self.sender.as_ref()
    }

    pub fn sender_mut(&mut self) -> Option<&mut Sender> {
        self.sender.as_mut()
    }

    pub fn remote_sender(&self, id: NodeId) -> Option<&RemoteSender> {
        self.remote_senders.get(&id.value())
    }

    pub fn remote_sender_mut(&mut self, id: NodeId) -> Option<&mut RemoteSender> {
        self.remote_senders.get_mut(&id.value())
    }

    pub fn drain_output(&mut self) -> Vec<OutboundPdu> {
        std::mem::take(&mut self.output)
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = std::mem::take(&mut self.events);
        if let Some(sender) = self.sender.as_mut() {
            events.extend(sender.drain_events().map(SessionEvent::Sender));
        }
        for (id, rs) in self.remote_senders.iter_mut() {
            events.extend(rs.drain_events().map(|event| SessionEvent::Rx {
                sender: NodeId(*id),
                event,
            }));
        }
        events
    }

    // ─── Timer Plumbing ─────────────────────────────────────────────────

    fn arm(&mut self, due: f64, timer: Timer) {
        if let Some(entry) = self.timers.iter_mut().find(|e| e.timer == timer) {
            entry.due = due;
        } else {
            self.timers.push(TimerEntry { due, timer });
        }
    }

    fn disarm(&mut self, timer: Timer) {
        self.timers.retain(|e| e.timer != timer);
    }

    fn armed(&self, timer: Timer) -> bool {
        self.timers.iter().any(|e| e.timer == timer)
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<f64> {
        self.timers
            .iter()
            .map(|e| e.due)
            .min_by(|a, b| a.partial_cmp(b).expect("deadlines are finite"))
    }

    /// Ensure the tx pacing timer runs (new work arrived).
    fn prompt_tx(&mut self, now: f64) {
        if self.sender.is_some() && !self.armed(Timer::Tx) {
            self.arm(now, Timer::Tx);
        }
    }

    /// Run all timers due at `now` and return the next deadline.
    pub fn advance(&mut self, now: f64) -> Option<f64> {
        loop {
            let due = self
                .timers
                .iter()
                .enumerate()
                .filter(|(_, e)| e.due <= now)
                .min_by(|(_, a), (_, b)| {
                    a.due.partial_cmp(&b.due).expect("deadlines are finite")
                })
                .map(|(i, _)| i);
            let Some(idx) = due else {
                break;
            };
            let entry = self.timers.swap_remove(idx);
            self.fire(now, entry.timer);
        }
        self.next_deadline()
    }

    fn fire(&mut self, now: f64, timer: Timer) {
        match timer {
            Timer::Tx => self.service_tx(now),
            Timer::Probe => {
                if let Some(sender) = self.sender.as_mut() {
                    let interval = sender.on_probe_timeout(now);
                    self.arm(now + interval, Timer::Probe);
                    self.prompt_tx(now);
                }
            }
            Timer::SenderRepair => {
                if let Some(sender) = self.sender.as_mut() {
                    if let Some(holdoff) = sender.on_repair_timeout(now) {
                        self.arm(now + holdoff, Timer::SenderRepair);
                    }
                    self.prompt_tx(now);
                }
            }
            Timer::RxRepair(id) => {
                if let Some(rs) = self.remote_senders.get_mut(&id) {
                    if let Some(holdoff) = rs.on_repair_timeout(now) {
                        self.arm(now + holdoff, Timer::RxRepair(id));
                    }
                    self.flush_receiver_output(id);
                }
            }
            Timer::CcResponse(id) => {
                if let Some(rs) = self.remote_senders.get_mut(&id) {
                    rs.on_cc_response_timeout(now);
                    self.flush_receiver_output(id);
                }
            }
            Timer::Activity(id) => {
                if let Some(rs) = self.remote_senders.get_mut(&id) {
                    if rs.on_activity_timeout(now) {
                        let interval = rs.activity_interval();
                        self.arm(now + interval, Timer::Activity(id));
                    }
                }
            }
        }
    }

    fn service_tx(&mut self, now: f64) {
        let Some(sender) = self.sender.as_mut() else {
            return;
        };
        match sender.next_pdu(now) {
            Some(mut pdu) => {
                pdu.set_sequence(self.tx_sequence);
                self.tx_sequence = self.tx_sequence.wrapping_add(1);
                let len = pdu.encode().len();
                let sender = self.sender.as_mut().expect("sender exists");
                sender.note_pdu_sent();
                let interval = sender.tx_interval(len);
                self.output.push(OutboundPdu {
                    pdu,
                    dest: Destination::Session,
                });
                self.arm(now + interval, Timer::Tx);
            }
            None => {
                // Idle: wake again when flush work comes due.
                let sender = self.sender.as_ref().expect("sender exists");
                match sender.next_flush_due() {
                    Some(due) if due > now => self.arm(due, Timer::Tx),
                    Some(_) => self.arm(now + 0.01, Timer::Tx),
                    None => self.disarm(Timer::Tx),
                }
            }
        }
    }

    fn flush_receiver_output(&mut self, id: u32) {
        let unicast = self
            .config
            .receiver
            .as_ref()
            .is_some_and(|c| c.unicast_nacks);
        let Some(rs) = self.remote_senders.get_mut(&id) else {
            return;
        };
        let dest = if unicast {
            Destination::Node(NodeId(id))
        } else {
            Destination::Session
        };
        let pdus: Vec<Pdu> = rs.drain_output().collect();
        for mut pdu in pdus {
            pdu.set_sequence(self.tx_sequence);
            self.tx_sequence = self.tx_sequence.wrapping_add(1);
            self.output.push(OutboundPdu { pdu, dest });
        }
    }

    // ─── Ingest ─────────────────────────────────────────────────────────

    /// Decode and route one received datagram. `was_unicast` marks
    /// datagrams that arrived on the unicast (non-group) path.
    pub fn handle_datagram(&mut self, now: f64, datagram: Bytes, was_unicast: bool) {
        let Some(pdu) = Pdu::decode(datagram) else {
            self.malformed_pdus += 1;
            return;
        };
        self.handle_pdu(now, pdu, was_unicast);
    }

    /// Route an already-decoded PDU.
    pub fn handle_pdu(&mut self, now: f64, pdu: Pdu, was_unicast: bool) {
        let source = pdu.source_id();
        if source == self.config.local_node_id {
            return; // loopback of our own traffic
        }
        match pdu {
            Pdu::Info(info) => {
                if let Some(id) = self.ensure_remote_sender(now, source) {
                    let rs = self.remote_senders.get_mut(&id).expect("just ensured");
                    if let Some(backoff) = rs.handle_info(now, &info) {
                        self.arm(now + backoff, Timer::RxRepair(id));
                    }
                    self.rearm_activity(now, id);
                }
            }
            Pdu::Data(data) => {
                if let Some(id) = self.ensure_remote_sender(now, source) {
                    let rs = self.remote_senders.get_mut(&id).expect("just ensured");
                    if let Some(backoff) = rs.handle_data(now, &data) {
                        self.arm(now + backoff, Timer::RxRepair(id));
                    }
                    self.rearm_activity(now, id);
                }
            }
            Pdu::Cmd(cmd) => {
                if let Some(id) = self.ensure_remote_sender(now, source) {
                    let is_cc = matches!(cmd.body, crate::wire::CmdBody::Cc { .. });
                    let rs = self.remote_senders.get_mut(&id).expect("just ensured");
                    if let Some(interval) = rs.handle_cmd(now, &cmd) {
                        let timer = if is_cc {
                            Timer::CcResponse(id)
                        } else {
                            Timer::RxRepair(id)
                        };
                        self.arm(now + interval, timer);
                    }
                    self.flush_receiver_output(id);
                    self.rearm_activity(now, id);
                }
            }
            Pdu::Nack(nack) => {
                if nack.server_id == self.config.local_node_id {
                    if let Some(sender) = self.sender.as_mut() {
                        if let Some(aggregate) = sender.handle_nack(now, &nack, was_unicast) {
                            self.arm(now + aggregate, Timer::SenderRepair);
                        }
                        self.prompt_tx(now);
                    }
                } else if let Some(rs) =
                    self.remote_senders.get_mut(&nack.server_id.value())
                {
                    // Overheard: another receiver's request for a sender we
                    // also listen to feeds NACK/CC suppression.
                    rs.handle_peer_nack(&nack);
                }
            }
            Pdu::Ack(ack) => {
                if ack.server_id == self.config.local_node_id {
                    if let Some(sender) = self.sender.as_mut() {
                        sender.handle_ack(now, &ack, was_unicast);
                        self.prompt_tx(now);
                    }
                } else if let Some(rs) = self.remote_senders.get_mut(&ack.server_id.value()) {
                    rs.handle_peer_ack(&ack);
                }
            }
        }
    }

    fn ensure_remote_sender(&mut self, now: f64, source: NodeId) -> Option<u32> {
        self.config.receiver.as_ref()?;
        let id = source.value();
        if !self.remote_senders.contains_key(&id) {
            let config = self.config.receiver.clone().expect("receiver role checked");
            debug!(sender = id, "new remote sender");
            self.remote_senders.insert(id, RemoteSender::new(source, config));
            self.events.push(SessionEvent::RemoteSenderNew(source));
            let interval = self
                .remote_senders
                .get(&id)
                .expect("just inserted")
                .activity_interval();
            self.arm(now + interval, Timer::Activity(id));
        }
        Some(id)
    }

    fn rearm_activity(&mut self, now: f64, id: u32) {
        if let Some(rs) = self.remote_senders.get(&id) {
            let interval = rs.activity_interval();
            self.arm(now + interval, Timer::Activity(id));
        }
    }

    // ─── Application Surface (sender role) ──────────────────────────────

    /// Queue a bulk data object for delivery.
    pub fn enqueue_object(
        &mut self,
        now: f64,
        data: Vec<u8>,
        info: Option<Vec<u8>>,
    ) -> Option<ObjectId> {
        let size = ObjectSize::from(data.len() as u64);
        let sender = self.sender.as_mut()?;
        let id = sender.enqueue_object(
            ObjectData::Bulk(crate::object::MemoryStorage::from_data(data)),
            size,
            info,
        )?;
        self.prompt_tx(now);
        Some(id)
    }

    /// Queue a file-backed object; the embedding supplies the storage.
    pub fn enqueue_file_object(
        &mut self,
        now: f64,
        storage: Box<dyn crate::object::SegmentStorage>,
        info: Option<Vec<u8>>,
    ) -> Option<ObjectId> {
        let size = ObjectSize::from(storage.size());
        let sender = self.sender.as_mut()?;
        let id = sender.enqueue_object(ObjectData::File(storage), size, info)?;
        self.prompt_tx(now);
        Some(id)
    }

    /// Open a byte-stream object.
    pub fn open_stream(
        &mut self,
        now: f64,
        buffer_size: u32,
        info: Option<Vec<u8>>,
    ) -> Option<ObjectId> {
        let sender = self.sender.as_mut()?;
        let id = sender.open_stream(ObjectSize::from(buffer_size), info)?;
        self.prompt_tx(now);
        Some(id)
    }

    /// Append bytes to a stream object.
    pub fn write_stream(&mut self, now: f64, id: ObjectId, buf: &[u8], eom: bool) -> usize {
        let Some(sender) = self.sender.as_mut() else {
            return 0;
        };
        let written = sender.write_stream(id, buf, eom);
        if written > 0 || eom {
            self.prompt_tx(now);
        }
        written
    }

    /// Request positive acknowledgement of everything through the given
    /// position from the configured acking nodes.
    pub fn set_watermark(
        &mut self,
        now: f64,
        object_id: ObjectId,
        block_id: BlockId,
        segment_id: SegmentId,
    ) {
        if let Some(sender) = self.sender.as_mut() {
            sender.set_watermark(object_id, block_id, segment_id);
            self.prompt_tx(now);
        }
    }

    pub fn set_acking_nodes(&mut self, nodes: Vec<NodeId>) {
        if let Some(sender) = self.sender.as_mut() {
            sender.set_acking_nodes(nodes);
        }
    }

    /// Announce end of transmission.
    pub fn close_sender(&mut self, now: f64) {
        if let Some(sender) = self.sender.as_mut() {
            sender.queue_eot();
            self.prompt_tx(now);
        }
    }

    // ─── Application Surface (receiver role) ────────────────────────────

    /// Read in-order bytes from a remote sender's stream object.
    pub fn read_stream(
        &mut self,
        sender: NodeId,
        id: ObjectId,
        buf: &mut [u8],
        find_msg_start: bool,
    ) -> Option<StreamRead> {
        self.remote_senders
            .get_mut(&sender.value())?
            .read_stream(id, buf, find_msg_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::RepairBoundary;
    use crate::object::NackingMode;

    fn sender_session(node: u32) -> Session {
        Session::new(SessionConfig {
            local_node_id: NodeId(node),
            sender: Some(SenderConfig {
                node_id: NodeId(node),
                session_id: 1,
                segment_size: 64,
                ndata: 4,
                nparity: 2,
                auto_parity: 0,
                tx_rate: 1.0e6,
                ..Default::default()
            }),
            receiver: None,
            ..Default::default()
        })
        .expect("valid config")
    }

    fn receiver_session(node: u32) -> Session {
        Session::new(SessionConfig {
            local_node_id: NodeId(node),
            sender: None,
            receiver: Some(ReceiverConfig {
                node_id: NodeId(node),
                repair_boundary: RepairBoundary::Block,
                default_nacking_mode: NackingMode::Normal,
                ..Default::default()
            }),
            ..Default::default()
        })
        .expect("valid config")
    }

    /// Run both sessions forward, exchanging all output each step.
    fn run(
        tx: &mut Session,
        rx: &mut Session,
        mut now: f64,
        duration: f64,
        step: f64,
        mut drop_filter: impl FnMut(&Pdu) -> bool,
    ) -> f64 {
        let end = now + duration;
        while now < end {
            tx.advance(now);
            rx.advance(now);
            for out in tx.drain_output() {
                if !drop_filter(&out.pdu) {
                    rx.handle_pdu(now, out.pdu, false);
                }
            }
            for out in rx.drain_output() {
                tx.handle_pdu(now, out.pdu, false);
            }
            now += step;
        }
        now
    }

    #[test]
    fn config_validation_rejects_oversize_fec() {
        let result = Session::new(SessionConfig {
            sender: Some(SenderConfig {
                ndata: 200,
                nparity: 100,
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn lossless_transfer_end_to_end() {
        let mut tx = sender_session(1);
        let mut rx = receiver_session(100);
        let data: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        let id = tx.enqueue_object(0.0, data.clone(), Some(b"hello".to_vec())).unwrap();
        run(&mut tx, &mut rx, 0.0, 2.0, 0.005, |_| false);

        let events = rx.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::RemoteSenderNew(NodeId(1)))));
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Rx { event: RxEvent::ObjectCompleted(oid), .. } if *oid == id
        )));
        let rs = rx.remote_sender(NodeId(1)).unwrap();
        assert_eq!(rs.object_data(id).unwrap(), &data[..]);
    }

    #[test]
    fn sequence_numbers_increase_by_one_per_pdu() {
        let mut tx = sender_session(1);
        tx.enqueue_object(0.0, vec![0u8; 256], None);
        let mut seqs = Vec::new();
        let mut now = 0.0;
        for _ in 0..50 {
            tx.advance(now);
            for out in tx.drain_output() {
                seqs.push(out.pdu.sequence());
            }
            now += 0.01;
        }
        assert!(seqs.len() >= 5);
        for w in seqs.windows(2) {
            assert_eq!(w[1], w[0].wrapping_add(1), "sequence gap in {seqs:?}");
        }
    }

    #[test]
    fn loss_triggers_nack_and_repair() {
        let mut tx = sender_session(1);
        let mut rx = receiver_session(100);
        let data: Vec<u8> = (0..256u32).map(|i| i as u8).collect();
        let id = tx.enqueue_object(0.0, data.clone(), None).unwrap();

        // Drop the first transmission of symbol 1 only.
        let mut dropped = false;
        run(&mut tx, &mut rx, 0.0, 30.0, 0.01, |pdu| {
            if let Pdu::Data(d) = pdu {
                if d.symbol_id == 1 && !dropped {
                    dropped = true;
                    return true;
                }
            }
            false
        });
        assert!(dropped);
        let rs = rx.remote_sender(NodeId(1)).unwrap();
        assert!(rs.stats().nacks_sent >= 1, "receiver must have NACKed");
        assert_eq!(rs.object_data(id).unwrap(), &data[..]);
        assert!(tx.sender().unwrap().stats().repairs_sent >= 1);
    }

    #[test]
    fn probe_and_feedback_round_trip_updates_grtt() {
        let mut tx = sender_session(1);
        let mut rx = Session::new(SessionConfig {
            local_node_id: NodeId(100),
            receiver: Some(ReceiverConfig {
                node_id: NodeId(100),
                cc_enable: true,
                ..Default::default()
            }),
            ..Default::default()
        })
        .unwrap();
        tx.enqueue_object(0.0, vec![1u8; 128], None);
        run(&mut tx, &mut rx, 0.0, 20.0, 0.01, |_| false);
        let rs = rx.remote_sender(NodeId(1)).unwrap();
        assert!(rs.stats().acks_sent >= 1, "probe responses were sent");
    }

    #[test]
    fn stream_end_to_end() {
        let mut tx = sender_session(1);
        let mut rx = receiver_session(100);
        let sid = tx.open_stream(0.0, 4096, None).unwrap();
        let message = vec![0x5A; 200];
        tx.write_stream(0.0, sid, &message, true);
        run(&mut tx, &mut rx, 0.0, 2.0, 0.005, |_| false);
        let mut buf = [0u8; 512];
        let read = rx
            .read_stream(NodeId(1), sid, &mut buf, false)
            .expect("stream exists");
        assert_eq!(read.bytes, 200);
        assert_eq!(&buf[..200], &message[..]);
    }

    #[test]
    fn watermark_collection_end_to_end() {
        let mut tx = sender_session(1);
        let mut rx = receiver_session(100);
        let data: Vec<u8> = vec![9u8; 256];
        let id = tx.enqueue_object(0.0, data, None).unwrap();
        tx.set_acking_nodes(vec![NodeId(100)]);
        let now = run(&mut tx, &mut rx, 0.0, 2.0, 0.005, |_| false);
        tx.set_watermark(now, id, BlockId(0), 3);
        run(&mut tx, &mut rx, now, 10.0, 0.01, |_| false);
        let events = tx.drain_events();
        let completed = events.iter().find_map(|e| match e {
            SessionEvent::Sender(SenderEvent::WatermarkCompleted { failed }) => Some(failed),
            _ => None,
        });
        assert_eq!(
            completed.expect("watermark completed"),
            &Vec::<NodeId>::new(),
            "the acking receiver answered"
        );
    }

    #[test]
    fn own_traffic_is_ignored() {
        let mut tx = sender_session(1);
        tx.enqueue_object(0.0, vec![0u8; 64], None);
        tx.advance(0.0);
        let out = tx.drain_output();
        assert!(!out.is_empty());
        // Loop our own PDU back: nothing should change.
        tx.handle_pdu(0.0, out[0].pdu.clone(), false);
        assert!(tx.drain_events().iter().all(|e| !matches!(
            e,
            SessionEvent::RemoteSenderNew(_)
        )));
    }

    #[test]
    fn malformed_datagrams_counted() {
        let mut rx = receiver_session(100);
        rx.handle_datagram(0.0, Bytes::from_static(b"\x00\x01garbage"), false);
        assert_eq!(rx.malformed_pdus, 1);
    }

    #[test]
    fn advance_returns_next_deadline() {
        let mut tx = sender_session(1);
        tx.enqueue_object(0.0, vec![0u8; 64], None);
        let deadline = tx.advance(0.0);
        assert!(deadline.is_some());
        assert!(deadline.unwrap() > 0.0);
    }
}
