// src/stats.rs
//! Traffic counters. All mutation happens under the owning connection's
//! stats lock; readers only ever see a consistent [`StatsSnapshot`], never
//! the live fields.

/// Accumulated counters of one connection.
#[derive(Debug, Default)]
pub struct Stats {
    pub pkt_sent: u64,
    pub byte_sent: u64,
    pub pkt_recv: u64,
    pub byte_recv: u64,
    pub pkt_retransmitted: u64,
    pub byte_retransmitted: u64,
    /// Losses reported by the peer (sender side).
    pub pkt_snd_loss: u64,
    /// Gaps detected locally (receiver side).
    pub pkt_rcv_loss: u64,
    pub pkt_snd_drop: u64,
    pub byte_snd_drop: u64,
    pub pkt_rcv_drop: u64,
    pub byte_rcv_drop: u64,
    pub pkt_rcv_undecrypt: u64,
    pub byte_rcv_undecrypt: u64,
    pub pkt_rcv_belated: u64,
    pub pkt_ack_sent: u64,
    pub pkt_ack_recv: u64,
    pub pkt_nak_sent: u64,
    pub pkt_nak_recv: u64,
}

/// One coherent view of a connection's counters and gauges.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub pkt_sent: u64,
    pub byte_sent: u64,
    pub pkt_recv: u64,
    pub byte_recv: u64,
    pub pkt_retransmitted: u64,
    pub byte_retransmitted: u64,
    pub pkt_snd_loss: u64,
    pub pkt_rcv_loss: u64,
    pub pkt_snd_drop: u64,
    pub byte_snd_drop: u64,
    pub pkt_rcv_drop: u64,
    pub byte_rcv_drop: u64,
    pub pkt_rcv_undecrypt: u64,
    pub byte_rcv_undecrypt: u64,
    pub pkt_rcv_belated: u64,
    pub pkt_ack_sent: u64,
    pub pkt_ack_recv: u64,
    pub pkt_nak_sent: u64,
    pub pkt_nak_recv: u64,

    // Gauges sampled at snapshot time.
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    pub bandwidth_pps: u32,
    pub flow_window: u32,
    pub congestion_window: u32,
    pub snd_buffer_pkts: u32,
    pub rcv_buffer_avail_pkts: u32,
}

impl Stats {
    /// Copies the counters into a snapshot; the caller fills the gauges.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pkt_sent: self.pkt_sent,
            byte_sent: self.byte_sent,
            pkt_recv: self.pkt_recv,
            byte_recv: self.byte_recv,
            pkt_retransmitted: self.pkt_retransmitted,
            byte_retransmitted: self.byte_retransmitted,
            pkt_snd_loss: self.pkt_snd_loss,
            pkt_rcv_loss: self.pkt_rcv_loss,
            pkt_snd_drop: self.pkt_snd_drop,
            byte_snd_drop: self.byte_snd_drop,
            pkt_rcv_drop: self.pkt_rcv_drop,
            byte_rcv_drop: self.byte_rcv_drop,
            pkt_rcv_undecrypt: self.pkt_rcv_undecrypt,
            byte_rcv_undecrypt: self.byte_rcv_undecrypt,
            pkt_rcv_belated: self.pkt_rcv_belated,
            pkt_ack_sent: self.pkt_ack_sent,
            pkt_ack_recv: self.pkt_ack_recv,
            pkt_nak_sent: self.pkt_nak_sent,
            pkt_nak_recv: self.pkt_nak_recv,
            ..Default::default()
        }
    }
}
