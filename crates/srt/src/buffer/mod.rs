// src/buffer/mod.rs
//! Per-connection ring buffers: outgoing payloads awaiting acknowledgement
//! and incoming arrivals awaiting ordered (and scheduled) delivery.

pub mod recv;
pub mod send;

pub use recv::{InsertError, RecvBuffer, TsbPdClock};
pub use send::{MsgCtrl, SendBuffer};
