//! # riptide-proto
//!
//! Riptide NACK-oriented reliable multicast engine.
//!
//! Reliable bulk-data, file, and byte-stream delivery to multicast (or
//! unicast) groups: negative-acknowledgement feedback with randomised
//! suppression, systematic Reed-Solomon FEC, and TCP-friendly rate-based
//! congestion control. Pure protocol logic — the embedding owns sockets,
//! timers, and file storage.
//!
//! ## Crate structure
//!
//! - [`seq`] — wrap-tolerant object/block/segment identifiers, 48-bit sizes
//! - [`bitmask`] — sliding-window bitmask with movable origin
//! - [`galois`] — GF(2^8) field tables
//! - [`fec`] — systematic Reed-Solomon encoder and erasure decoder
//! - [`wire`] — PDU and header-extension codec, quantisation
//! - [`pool`] — segment/block pools and the windowed block buffer
//! - [`object`] — bulk/file/stream object model and FEC block geometry
//! - [`stream`] — stream buffer window, read/write paths
//! - [`loss`] — TFRC discounted loss-event estimator
//! - [`congestion`] — sender rate control, CLR election, GRTT estimation
//! - [`sender`] — sender state machine
//! - [`receiver`] — per-remote-sender receiver state machine
//! - [`session`] — orchestration, timers, event multiplexing
//! - [`stats`] — counters and rate metering

pub mod bitmask;
pub mod congestion;
pub mod fec;
pub mod galois;
pub mod loss;
pub mod object;
pub mod pool;
pub mod receiver;
pub mod sender;
pub mod seq;
pub mod session;
pub mod stats;
pub mod stream;
pub mod wire;
