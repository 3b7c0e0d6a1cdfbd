// src/lib.rs
//! # SRT transport engine
//!
//! A connection-oriented transport over UDP delivering low-latency,
//! loss-resilient, optionally encrypted byte streams or datagrams. A
//! connection pairs a sender and receiver through sequence numbering,
//! selective retransmission, periodic and event-driven loss reporting,
//! timestamp-based scheduled delivery, and an AES key-material exchange
//! riding on the handshake.

pub mod buffer;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod loss;
pub mod mux;
pub mod options;
pub mod packet;
pub mod seq;
pub mod socket;
pub mod stats;
pub mod tsbpd;
pub mod window;

pub use buffer::recv::MsgInfo;
pub use buffer::send::MsgCtrl;
pub use connection::SocketState;
pub use crypto::KmState;
pub use error::{AgainCause, ConnCause, RejectReason, Result, SetupCause, SrtError, UsageCause};
pub use options::{Options, SrtOpt, TransType};
pub use packet::SocketId;
pub use seq::{MsgNo, SeqNo};
pub use socket::{ListenCallback, SrtListener, SrtSocket};
pub use stats::StatsSnapshot;

use std::time::Duration;

/// Base unit for ACK and expiration timers.
pub(crate) const SYN_INTERVAL: Duration = Duration::from_millis(10);

/// Minimum pause between handshake request retransmissions.
pub(crate) const HS_RETRY_PERIOD: Duration = Duration::from_millis(250);
