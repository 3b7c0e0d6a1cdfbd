// src/loss/mod.rs
//! Loss bookkeeping on both ends of a connection: the sender's
//! retransmission set and the receiver's gap tracking with belated-report
//! scheduling.

pub mod recv;
pub mod send;

pub use recv::{BelatedQueue, RcvLossList, ReorderTracker};
pub use send::SndLossList;
