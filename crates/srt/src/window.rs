// src/window.rs
//! History windows feeding the link estimators: the ACK window matching
//! ACKACKs back to sent ACKs for RTT sampling, and the packet-time window
//! deriving arrival rate and link capacity from inter-arrival intervals.

use crate::seq::SeqNo;
use std::time::{Duration, Instant};

const ACK_WINDOW_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct AckRecord {
    ack_no: u32,
    data_seq: SeqNo,
    sent: Instant,
}

/// Circular record of `(ACK-seq, data-seq, send-time)` triples. An incoming
/// `ACKACK` is matched here to produce an RTT sample; entries older than the
/// matched one are discarded.
#[derive(Debug)]
pub struct AckWindow {
    records: Vec<Option<AckRecord>>,
    head: usize,
    tail: usize,
}

impl AckWindow {
    pub fn new() -> Self {
        Self {
            records: vec![None; ACK_WINDOW_SIZE],
            head: 0,
            tail: 0,
        }
    }

    pub fn store(&mut self, ack_no: u32, data_seq: SeqNo, now: Instant) {
        self.records[self.head] = Some(AckRecord {
            ack_no,
            data_seq,
            sent: now,
        });
        self.head = (self.head + 1) % self.records.len();
        // Overwrite the oldest entry when the ring is full.
        if self.head == self.tail {
            self.tail = (self.tail + 1) % self.records.len();
        }
    }

    /// Looks up `ack_no` and returns the acknowledged data sequence and the
    /// elapsed round-trip time. A miss has no side effects.
    pub fn acknowledge(&mut self, ack_no: u32, now: Instant) -> Option<(SeqNo, Duration)> {
        let mut pos = self.tail;
        while pos != self.head {
            if let Some(rec) = self.records[pos] {
                if rec.ack_no == ack_no {
                    self.tail = (pos + 1) % self.records.len();
                    return Some((rec.data_seq, now.saturating_duration_since(rec.sent)));
                }
            }
            pos = (pos + 1) % self.records.len();
        }
        None
    }
}

const TIME_WINDOW_SIZE: usize = 16;

/// Arrival-interval and probe-pair history for the receive-rate and
/// bandwidth estimates carried in extended ACKs.
///
/// Every 16th sequence (`seq & 0xF == 0`) marks the first packet of a probe
/// pair; the immediately following sequence is the second. Intervals from a
/// packet shorter than the full payload are scaled up to the time a full
/// payload would have taken.
#[derive(Debug)]
pub struct PktTimeWindow {
    max_payload: usize,
    pkt_intervals: [i64; TIME_WINDOW_SIZE],
    pkt_bytes: [usize; TIME_WINDOW_SIZE],
    pkt_idx: usize,
    probe_intervals: [i64; TIME_WINDOW_SIZE],
    probe_idx: usize,
    last_arrival: Option<Instant>,
    probe_start: Option<Instant>,
}

impl PktTimeWindow {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.max(1),
            // Seed values keep the estimators pessimistic until real
            // samples displace them.
            pkt_intervals: [1_000_000; TIME_WINDOW_SIZE],
            pkt_bytes: [0; TIME_WINDOW_SIZE],
            pkt_idx: 0,
            probe_intervals: [1000; TIME_WINDOW_SIZE],
            probe_idx: 0,
            last_arrival: None,
            probe_start: None,
        }
    }

    /// Records a data-packet arrival of `size` payload bytes.
    pub fn on_pkt_arrival(&mut self, now: Instant, size: usize) {
        if let Some(last) = self.last_arrival {
            let interval = now.saturating_duration_since(last).as_micros() as i64;
            self.pkt_intervals[self.pkt_idx] = interval;
            self.pkt_bytes[self.pkt_idx] = size + crate::packet::HDR_SIZE;
            self.pkt_idx = (self.pkt_idx + 1) % TIME_WINDOW_SIZE;
        }
        self.last_arrival = Some(now);
    }

    /// First packet of a probe pair arrived.
    pub fn probe1_arrival(&mut self, now: Instant) {
        self.probe_start = Some(now);
    }

    /// Second packet of a probe pair arrived; records the pair interval.
    pub fn probe2_arrival(&mut self, now: Instant, size: usize) {
        let Some(start) = self.probe_start.take() else {
            return;
        };
        let mut interval = now.saturating_duration_since(start).as_micros() as i64;
        // Scale a short packet's interval to full-payload equivalent time.
        if size > 0 && size < self.max_payload {
            interval = interval * self.max_payload as i64 / size as i64;
        }
        self.probe_intervals[self.probe_idx] = interval;
        self.probe_idx = (self.probe_idx + 1) % TIME_WINDOW_SIZE;
    }

    /// Median-filtered packet arrival speed. Returns `(packets/sec,
    /// bytes/sec)`; zero when fewer than half the window passes the filter.
    pub fn rcv_speed(&self) -> (u32, u32) {
        let mut sorted = self.pkt_intervals;
        sorted.sort_unstable();
        let median = sorted[TIME_WINDOW_SIZE / 2];
        let (lower, upper) = (median / 8, median * 8);

        let mut count = 0usize;
        let mut sum = 0i64;
        let mut bytes = 0usize;
        for i in 0..TIME_WINDOW_SIZE {
            let v = self.pkt_intervals[i];
            if v > lower && v < upper {
                count += 1;
                sum += v;
                bytes += self.pkt_bytes[i];
            }
        }
        if count <= TIME_WINDOW_SIZE / 2 || sum <= 0 {
            return (0, 0);
        }
        let pps = (1_000_000.0 * count as f64 / sum as f64) as u32;
        let bps = (1_000_000.0 * bytes as f64 / sum as f64) as u32;
        (pps, bps)
    }

    /// Median-filtered link-capacity estimate from probe pairs, in
    /// packets/sec.
    pub fn bandwidth(&self) -> u32 {
        let mut sorted = self.probe_intervals;
        sorted.sort_unstable();
        let median = sorted[TIME_WINDOW_SIZE / 2];
        let (lower, upper) = (median / 8, median * 8);

        let mut count = 1usize;
        let mut sum = median;
        for v in self.probe_intervals {
            if v > lower && v < upper {
                count += 1;
                sum += v;
            }
        }
        if sum <= 0 {
            return 0;
        }
        (1_000_000.0 * count as f64 / sum as f64) as u32
    }
}

/// True when `seq` opens a probe pair.
pub fn is_probe1(seq: SeqNo) -> bool {
    seq.raw() & 0xF == 0
}

/// True when `seq` closes a probe pair.
pub fn is_probe2(seq: SeqNo) -> bool {
    seq.raw() & 0xF == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ackack_matches_stored_ack() {
        let mut win = AckWindow::new();
        let t0 = Instant::now();
        win.store(1, SeqNo::new(100), t0);
        win.store(2, SeqNo::new(110), t0);

        let (seq, rtt) = win.acknowledge(2, t0 + Duration::from_millis(30)).unwrap();
        assert_eq!(seq, SeqNo::new(110));
        assert!(rtt >= Duration::from_millis(30));
    }

    #[test]
    fn unmatched_ackack_is_discarded_without_side_effects() {
        let mut win = AckWindow::new();
        let t0 = Instant::now();
        win.store(5, SeqNo::new(100), t0);
        assert!(win.acknowledge(99, t0).is_none());
        // The stored record must still be there.
        assert!(win.acknowledge(5, t0).is_some());
    }

    #[test]
    fn acknowledge_discards_older_entries() {
        let mut win = AckWindow::new();
        let t0 = Instant::now();
        for i in 1..=4u32 {
            win.store(i, SeqNo::new(100 + i), t0);
        }
        assert!(win.acknowledge(3, t0).is_some());
        // Entries 1 and 2 were implicitly dropped with the tail move.
        assert!(win.acknowledge(1, t0).is_none());
        assert!(win.acknowledge(2, t0).is_none());
        assert!(win.acknowledge(4, t0).is_some());
    }

    #[test]
    fn rcv_speed_converges_on_steady_arrivals() {
        let mut win = PktTimeWindow::new(1456);
        let mut now = Instant::now();
        for _ in 0..32 {
            win.on_pkt_arrival(now, 1456);
            now += Duration::from_micros(1000);
        }
        let (pps, bps) = win.rcv_speed();
        // 1 packet per millisecond.
        assert!((900..=1100).contains(&pps), "pps={}", pps);
        assert!(bps > pps, "bps={} pps={}", bps, pps);
    }

    #[test]
    fn rcv_speed_zero_before_enough_samples() {
        let win = PktTimeWindow::new(1456);
        assert_eq!(win.rcv_speed(), (0, 0));
    }

    #[test]
    fn probe_pairs_estimate_bandwidth() {
        let mut win = PktTimeWindow::new(1456);
        let mut now = Instant::now();
        for _ in 0..20 {
            win.probe1_arrival(now);
            win.probe2_arrival(now + Duration::from_micros(100), 1456);
            now += Duration::from_millis(10);
        }
        let bw = win.bandwidth();
        // 100 us between full packets ~ 10000 packets/sec.
        assert!((8000..=12000).contains(&bw), "bw={}", bw);
    }

    #[test]
    fn short_probe_packet_is_scaled() {
        let mut win = PktTimeWindow::new(1000);
        let mut now = Instant::now();
        for _ in 0..20 {
            win.probe1_arrival(now);
            // Half-size packet over 100 us counts as 200 us for a full one.
            win.probe2_arrival(now + Duration::from_micros(100), 500);
            now += Duration::from_millis(10);
        }
        let bw = win.bandwidth();
        assert!((4000..=6000).contains(&bw), "bw={}", bw);
    }

    #[test]
    fn probe_positions() {
        assert!(is_probe1(SeqNo::new(0x10)));
        assert!(is_probe2(SeqNo::new(0x11)));
        assert!(!is_probe1(SeqNo::new(0x11)));
        assert!(!is_probe2(SeqNo::new(0x12)));
    }
}
