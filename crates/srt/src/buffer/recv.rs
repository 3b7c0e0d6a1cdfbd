// src/buffer/recv.rs
use crate::packet::{Boundary, MsgFlags};
use crate::seq::{MsgNo, SeqNo};
use bytes::{Bytes, BytesMut};
use std::time::{Duration, Instant};
use tracing::trace;

/// Why an arrival could not be placed into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// Sequence precedes the skip-ack boundary.
    Belated,
    /// Offset beyond the buffer capacity; indicates an ACK-pipeline stall.
    Overrun,
    /// The slot is already occupied by an unacknowledged packet.
    Duplicate,
}

/// Scheduled-delivery clock: anchors the peer's timestamp space to local
/// time and answers "when may this packet be handed to the reader".
///
/// The anchor is computed when the first HSREQ is interpreted, as
/// `now - ctrl_ts`; each packet's deadline is then anchor + timestamp +
/// configured latency − measured drift.
#[derive(Debug)]
pub struct TsbPdClock {
    enabled: bool,
    latency: Duration,
    anchor: Option<Instant>,
    /// Last timestamp seen, for 32-bit wrap tracking.
    last_ts: u32,
    /// Absolute microseconds corresponding to `last_ts`.
    last_full_us: u64,
    drift_tracking: bool,
    drift_us: i64,
    drift_samples: u32,
}

impl TsbPdClock {
    pub fn new(enabled: bool, latency: Duration, drift_tracking: bool) -> Self {
        Self {
            enabled,
            latency,
            anchor: None,
            last_ts: 0,
            last_full_us: 0,
            drift_tracking,
            drift_us: 0,
            drift_samples: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }

    /// Anchors the peer clock: `ctrl_ts` is the peer's timestamp observed
    /// right now.
    pub fn set_anchor(&mut self, now: Instant, ctrl_ts: u32) {
        self.anchor = Some(
            now.checked_sub(Duration::from_micros(ctrl_ts as u64))
                .unwrap_or(now),
        );
        self.last_ts = ctrl_ts;
        self.last_full_us = ctrl_ts as u64;
        trace!("TsbPd anchor set, peer ts {}", ctrl_ts);
    }

    pub fn is_anchored(&self) -> bool {
        self.anchor.is_some()
    }

    /// Unwraps a 32-bit timestamp against the last one seen.
    fn full_us(&self, ts: u32) -> u64 {
        let delta = ts.wrapping_sub(self.last_ts) as i32 as i64;
        self.last_full_us.saturating_add_signed(delta)
    }

    /// Tracks the running timestamp so wraps stay unambiguous. Call for
    /// every arriving packet, in arrival order.
    pub fn note_ts(&mut self, ts: u32) {
        self.last_full_us = self.full_us(ts);
        self.last_ts = ts;
    }

    /// Absolute play-out deadline for a packet timestamp.
    pub fn play_time(&self, ts: u32) -> Option<Instant> {
        let anchor = self.anchor?;
        let base = anchor + Duration::from_micros(self.full_us(ts)) + self.latency;
        Some(if self.drift_us >= 0 {
            base - Duration::from_micros(self.drift_us as u64)
        } else {
            base + Duration::from_micros((-self.drift_us) as u64)
        })
    }

    /// Feeds an ACKACK control timestamp into the drift EWMA.
    pub fn on_ackack_ts(&mut self, ctrl_ts: u32, now: Instant) {
        if !self.drift_tracking {
            return;
        }
        let Some(anchor) = self.anchor else { return };
        let expected = anchor + Duration::from_micros(self.full_us(ctrl_ts));
        let sample = if now >= expected {
            now.saturating_duration_since(expected).as_micros() as i64
        } else {
            -(expected.saturating_duration_since(now).as_micros() as i64)
        };
        self.drift_samples += 1;
        if self.drift_samples == 1 {
            self.drift_us = sample;
        } else {
            self.drift_us = (self.drift_us * 7 + sample) / 8;
        }
    }

    #[cfg(test)]
    pub fn drift_us(&self) -> i64 {
        self.drift_us
    }
}

/// Stored arrival.
#[derive(Debug, Clone)]
struct Slot {
    payload: Bytes,
    flags: MsgFlags,
    ts: u32,
    /// Encryption flags were set and decryption failed; the payload stays
    /// in the buffer opaque and is delivered at its deadline, marked.
    undecryptable: bool,
}

#[derive(Debug, Clone)]
enum Cell {
    Empty,
    Filled(Slot),
    /// Skipped by too-late drop; consumed silently by the reader.
    Dropped,
}

impl Cell {
    fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }
}

/// Delivery metadata attached to a received message.
#[derive(Debug, Clone, Copy)]
pub struct MsgInfo {
    pub msgno: MsgNo,
    pub seq: SeqNo,
    pub in_order: bool,
    /// The payload (or part of it) could not be decrypted and is handed
    /// over as the opaque wire bytes.
    pub undecryptable: bool,
}

/// What the TsbPD scheduler should do next.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub seq: SeqNo,
    /// Deadline of the first stored packet; `None` without an anchor or in
    /// non-TsbPD mode (deliverable immediately).
    pub play_time: Option<Instant>,
    pub ready: bool,
    /// The packet is past the ACK boundary; hold delivery until acked.
    pub passack: bool,
    /// Present when empty slots precede the packet: the sequence to skip
    /// to and the number of slots to drop.
    pub skip_to: Option<(SeqNo, usize)>,
}

/// Ring of `flow-window` slots addressed relative to the skip-ack boundary.
///
/// Three positions move through it monotonically: the read head, the ACK
/// boundary (`RcvLastSkipAck`) and the furthest filled extent. The read
/// head never advances past an empty, undue slot unless a too-late drop
/// explicitly skipped it.
#[derive(Debug)]
pub struct RecvBuffer {
    cells: Vec<Cell>,
    size: usize,
    /// Logical (monotone) index of the read head.
    head: u64,
    /// Bytes already consumed from the head cell (stream partial reads).
    head_consumed: usize,
    /// Logical index of the ACK boundary.
    ack: u64,
    /// Sequence at the ACK boundary.
    ack_seq: SeqNo,
    /// Logical end: one past the furthest filled cell.
    end: u64,
}

impl RecvBuffer {
    pub fn new(size: usize, initial_seq: SeqNo) -> Self {
        Self {
            cells: vec![Cell::Empty; size],
            size,
            head: 0,
            head_consumed: 0,
            ack: 0,
            ack_seq: initial_seq,
            end: 0,
        }
    }

    fn cell(&self, logical: u64) -> &Cell {
        &self.cells[(logical % self.size as u64) as usize]
    }

    fn cell_mut(&mut self, logical: u64) -> &mut Cell {
        &mut self.cells[(logical % self.size as u64) as usize]
    }

    fn seq_at(&self, logical: u64) -> SeqNo {
        self.ack_seq.add((logical as i64 - self.ack as i64) as i32)
    }

    /// Sequence at the ACK boundary (`RcvLastSkipAck`).
    pub fn ack_seq(&self) -> SeqNo {
        self.ack_seq
    }

    /// Free slots, reported to the peer as receiver buffer space.
    pub fn available_slots(&self) -> usize {
        self.size - (self.ack - self.head) as usize
    }

    /// Places an arrival at its sequence-derived slot.
    pub fn insert(&mut self, seq: SeqNo, payload: Bytes, flags: MsgFlags, ts: u32) -> Result<(), InsertError> {
        let off = self.ack_seq.offset_to(seq);
        if off < 0 {
            return Err(InsertError::Belated);
        }
        let logical = self.ack + off as u64;
        if logical - self.head >= self.size as u64 {
            return Err(InsertError::Overrun);
        }
        if !self.cell(logical).is_empty() {
            return Err(InsertError::Duplicate);
        }
        *self.cell_mut(logical) = Cell::Filled(Slot {
            payload,
            flags,
            ts,
            undecryptable: false,
        });
        if logical + 1 > self.end {
            self.end = logical + 1;
        }
        Ok(())
    }

    /// Flags the packet at `seq` as undecryptable (flags stay set).
    pub fn mark_undecryptable(&mut self, seq: SeqNo) {
        let off = self.ack_seq.offset_to(seq);
        if off < 0 {
            return;
        }
        let logical = self.ack + off as u64;
        if let Cell::Filled(slot) = self.cell_mut(logical) {
            slot.undecryptable = true;
        }
    }

    /// Number of contiguous filled slots starting at the ACK boundary —
    /// how far the ACK may advance.
    pub fn contiguous_from_ack(&self) -> usize {
        let mut n = 0u64;
        while self.ack + n < self.end && !self.cell(self.ack + n).is_empty() {
            n += 1;
        }
        n as usize
    }

    /// Advances the ACK boundary over `n` delivered slots.
    pub fn ack_data(&mut self, n: usize) {
        debug_assert!(self.ack + n as u64 <= self.end);
        self.ack += n as u64;
        self.ack_seq = self.ack_seq.add(n as i32);
    }

    /// Unconditionally skips `n` slots at the ACK boundary (too-late drop).
    /// Empty cells in the span are marked dropped so the reader passes over
    /// them.
    pub fn skip(&mut self, n: usize) {
        for i in 0..n as u64 {
            let cell = self.cell_mut(self.ack + i);
            if cell.is_empty() {
                *cell = Cell::Dropped;
            }
        }
        self.ack += n as u64;
        self.ack_seq = self.ack_seq.add(n as i32);
        if self.end < self.ack {
            self.end = self.ack;
        }
    }

    /// Scheduler query: the first stored packet, its deadline, and whether
    /// a gap precedes it.
    pub fn next_readiness(&self, now: Instant, clock: &TsbPdClock) -> Option<Readiness> {
        let mut pos = self.head;
        while pos < self.end {
            match self.cell(pos) {
                Cell::Empty => pos += 1,
                Cell::Dropped => pos += 1,
                Cell::Filled(slot) => {
                    let play_time = if clock.enabled() {
                        clock.play_time(slot.ts)
                    } else {
                        None
                    };
                    let ready = match play_time {
                        Some(t) => t <= now,
                        None => true,
                    };
                    let passack = pos >= self.ack;
                    let gap = if pos > self.ack {
                        let skipped = (pos - self.ack) as usize;
                        let has_empty =
                            (self.ack..pos).any(|p| self.cell(p).is_empty());
                        if has_empty {
                            Some((self.seq_at(pos), skipped))
                        } else {
                            None
                        }
                    } else {
                        None
                    };
                    return Some(Readiness {
                        seq: self.seq_at(pos),
                        play_time,
                        ready,
                        passack,
                        skip_to: gap,
                    });
                }
            }
        }
        None
    }

    /// True when the reader would get data right now.
    pub fn is_readable(&self, now: Instant, clock: &TsbPdClock) -> bool {
        let mut pos = self.head;
        while pos < self.ack {
            match self.cell(pos) {
                Cell::Dropped => pos += 1,
                Cell::Empty => return false,
                Cell::Filled(slot) => {
                    if clock.enabled() {
                        return match clock.play_time(slot.ts) {
                            Some(t) => t <= now,
                            None => false,
                        };
                    }
                    return true;
                }
            }
        }
        false
    }

    fn cell_due(&self, pos: u64, now: Instant, clock: &TsbPdClock) -> bool {
        match self.cell(pos) {
            Cell::Filled(slot) => {
                if !clock.enabled() {
                    return true;
                }
                match clock.play_time(slot.ts) {
                    Some(t) => t <= now,
                    None => false,
                }
            }
            _ => false,
        }
    }

    /// Stream-mode read: concatenates bytes across consecutive due slots,
    /// possibly consuming a slot partially. Undecryptable slots are
    /// delivered like any other once due — opaque, but in sequence.
    pub fn read_stream(&mut self, dst: &mut [u8], now: Instant, clock: &TsbPdClock) -> usize {
        let mut copied = 0;
        while copied < dst.len() && self.head < self.ack {
            match self.cell(self.head).clone() {
                Cell::Dropped => {
                    self.head += 1;
                    self.head_consumed = 0;
                }
                Cell::Empty => break,
                Cell::Filled(slot) => {
                    if !self.cell_due(self.head, now, clock) {
                        break;
                    }
                    let rest = &slot.payload[self.head_consumed..];
                    let n = rest.len().min(dst.len() - copied);
                    dst[copied..copied + n].copy_from_slice(&rest[..n]);
                    copied += n;
                    self.head_consumed += n;
                    if self.head_consumed >= slot.payload.len() {
                        *self.cell_mut(self.head) = Cell::Empty;
                        self.head += 1;
                        self.head_consumed = 0;
                    }
                }
            }
        }
        copied
    }

    /// Message-mode read: returns one complete message reassembled across
    /// its FIRST..LAST blocks, never splitting a message between calls.
    /// A message whose payload could not be decrypted is still delivered
    /// at its deadline, opaque and flagged in [`MsgInfo`].
    pub fn read_msg(&mut self, now: Instant, clock: &TsbPdClock) -> Option<(Bytes, MsgInfo)> {
        // Pass over consumed leftovers first.
        while self.head < self.ack {
            match self.cell(self.head) {
                Cell::Dropped => {
                    self.head += 1;
                }
                _ => break,
            }
        }
        if self.head >= self.ack {
            return None;
        }
        let first = match self.cell(self.head) {
            Cell::Filled(slot) => slot.clone(),
            _ => return None,
        };
        if !self.cell_due(self.head, now, clock) {
            return None;
        }

        let mut info = MsgInfo {
            msgno: first.flags.msgno(),
            seq: self.seq_at(self.head),
            in_order: first.flags.in_order(),
            undecryptable: first.undecryptable,
        };

        match first.flags.boundary() {
            Boundary::Solo => {
                *self.cell_mut(self.head) = Cell::Empty;
                self.head += 1;
                Some((first.payload, info))
            }
            Boundary::First => {
                // The whole message must be present below the ACK boundary.
                let mut pos = self.head + 1;
                let mut last = None;
                while pos < self.ack {
                    match self.cell(pos) {
                        Cell::Filled(slot) if slot.flags.msgno() == info.msgno => {
                            if slot.flags.boundary() == Boundary::Last {
                                last = Some(pos);
                                break;
                            }
                            pos += 1;
                        }
                        _ => break,
                    }
                }
                let last = last?;
                let mut out = BytesMut::new();
                for p in self.head..=last {
                    if let Cell::Filled(slot) = self.cell(p) {
                        info.undecryptable |= slot.undecryptable;
                        out.extend_from_slice(&slot.payload);
                    }
                    *self.cell_mut(p) = Cell::Empty;
                }
                self.head = last + 1;
                Some((out.freeze(), info))
            }
            // A middle or last block at the head means its start was
            // dropped; consume the orphaned tail silently.
            Boundary::Middle | Boundary::Last => {
                let msgno = info.msgno;
                while self.head < self.ack {
                    match self.cell(self.head) {
                        Cell::Filled(slot) if slot.flags.msgno() == msgno => {
                            *self.cell_mut(self.head) = Cell::Empty;
                            self.head += 1;
                        }
                        _ => break,
                    }
                }
                self.read_msg(now, clock)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(msgno: u32, boundary: Boundary) -> MsgFlags {
        MsgFlags::new(MsgNo::new(msgno), boundary, true)
    }

    fn immediate_clock() -> TsbPdClock {
        TsbPdClock::new(false, Duration::ZERO, false)
    }

    #[test]
    fn insert_rejects_duplicate_belated_overrun() {
        let mut buf = RecvBuffer::new(8, SeqNo::new(100));
        assert!(buf.insert(SeqNo::new(101), Bytes::from_static(b"x"), flags(1, Boundary::Solo), 0).is_ok());
        assert_eq!(
            buf.insert(SeqNo::new(101), Bytes::from_static(b"y"), flags(1, Boundary::Solo), 0),
            Err(InsertError::Duplicate)
        );
        assert_eq!(
            buf.insert(SeqNo::new(99), Bytes::from_static(b"z"), flags(1, Boundary::Solo), 0),
            Err(InsertError::Belated)
        );
        assert_eq!(
            buf.insert(SeqNo::new(108), Bytes::from_static(b"w"), flags(1, Boundary::Solo), 0),
            Err(InsertError::Overrun)
        );
    }

    #[test]
    fn stream_read_concatenates_and_partial_reads() {
        let mut buf = RecvBuffer::new(8, SeqNo::new(0));
        buf.insert(SeqNo::new(0), Bytes::from_static(b"hello"), flags(1, Boundary::Solo), 0).unwrap();
        buf.insert(SeqNo::new(1), Bytes::from_static(b"world"), flags(2, Boundary::Solo), 0).unwrap();
        buf.ack_data(2);

        let clock = immediate_clock();
        let mut out = [0u8; 7];
        assert_eq!(buf.read_stream(&mut out, Instant::now(), &clock), 7);
        assert_eq!(&out, b"hellowo");
        let mut rest = [0u8; 8];
        assert_eq!(buf.read_stream(&mut rest, Instant::now(), &clock), 3);
        assert_eq!(&rest[..3], b"rld");
        assert_eq!(buf.read_stream(&mut rest, Instant::now(), &clock), 0);
    }

    #[test]
    fn message_read_reassembles_across_blocks() {
        let mut buf = RecvBuffer::new(8, SeqNo::new(0));
        buf.insert(SeqNo::new(0), Bytes::from_static(b"aa"), flags(1, Boundary::First), 0).unwrap();
        buf.insert(SeqNo::new(1), Bytes::from_static(b"bb"), flags(1, Boundary::Middle), 0).unwrap();
        buf.insert(SeqNo::new(2), Bytes::from_static(b"cc"), flags(1, Boundary::Last), 0).unwrap();
        buf.ack_data(3);

        let clock = immediate_clock();
        let (payload, info) = buf.read_msg(Instant::now(), &clock).unwrap();
        assert_eq!(payload, Bytes::from_static(b"aabbcc"));
        assert_eq!(info.msgno, MsgNo::new(1));
        assert_eq!(info.seq, SeqNo::new(0));
        assert!(buf.read_msg(Instant::now(), &clock).is_none());
    }

    #[test]
    fn message_read_waits_for_completion() {
        let mut buf = RecvBuffer::new(8, SeqNo::new(0));
        buf.insert(SeqNo::new(0), Bytes::from_static(b"aa"), flags(1, Boundary::First), 0).unwrap();
        buf.ack_data(1);
        let clock = immediate_clock();
        // LAST block not here yet: nothing may be returned.
        assert!(buf.read_msg(Instant::now(), &clock).is_none());

        buf.insert(SeqNo::new(1), Bytes::from_static(b"bb"), flags(1, Boundary::Last), 0).unwrap();
        buf.ack_data(1);
        let (payload, _) = buf.read_msg(Instant::now(), &clock).unwrap();
        assert_eq!(payload, Bytes::from_static(b"aabb"));
    }

    #[test]
    fn tsbpd_gates_delivery_until_deadline() {
        let now = Instant::now();
        let mut clock = TsbPdClock::new(true, Duration::from_millis(100), false);
        clock.set_anchor(now, 0);

        let mut buf = RecvBuffer::new(8, SeqNo::new(0));
        buf.insert(SeqNo::new(0), Bytes::from_static(b"x"), flags(1, Boundary::Solo), 1000).unwrap();
        buf.ack_data(1);

        assert!(!buf.is_readable(now, &clock));
        let r = buf.next_readiness(now, &clock).unwrap();
        assert!(!r.ready);
        let due = r.play_time.unwrap();
        assert!(buf.is_readable(due, &clock));
        assert!(buf.next_readiness(due, &clock).unwrap().ready);
    }

    #[test]
    fn readiness_reports_gap_and_passack() {
        let now = Instant::now();
        let clock = immediate_clock();
        let mut buf = RecvBuffer::new(8, SeqNo::new(10));
        // Sequence 10 and 11 missing; 12 arrived.
        buf.insert(SeqNo::new(12), Bytes::from_static(b"x"), flags(1, Boundary::Solo), 0).unwrap();

        let r = buf.next_readiness(now, &clock).unwrap();
        assert_eq!(r.seq, SeqNo::new(12));
        assert!(r.ready);
        assert!(r.passack);
        assert_eq!(r.skip_to, Some((SeqNo::new(12), 2)));
    }

    #[test]
    fn skip_drops_gap_and_advances_boundary() {
        let now = Instant::now();
        let clock = immediate_clock();
        let mut buf = RecvBuffer::new(8, SeqNo::new(10));
        buf.insert(SeqNo::new(12), Bytes::from_static(b"x"), flags(1, Boundary::Solo), 0).unwrap();

        buf.skip(2);
        assert_eq!(buf.ack_seq(), SeqNo::new(12));
        // Now ack over the ready packet and read it.
        buf.ack_data(1);
        let mut out = [0u8; 4];
        assert_eq!(buf.read_stream(&mut out, now, &clock), 1);
        assert_eq!(out[0], b'x');
    }

    #[test]
    fn undecryptable_payload_is_delivered_opaque() {
        let now = Instant::now();
        let clock = immediate_clock();
        let mut buf = RecvBuffer::new(8, SeqNo::new(0));
        buf.insert(SeqNo::new(0), Bytes::from_static(b"ciphertext"), flags(1, Boundary::Solo), 0).unwrap();
        buf.mark_undecryptable(SeqNo::new(0));
        buf.insert(SeqNo::new(1), Bytes::from_static(b"clear"), flags(2, Boundary::Solo), 0).unwrap();
        buf.ack_data(2);

        // The opaque payload stays in the buffer and is delivered in
        // sequence at its deadline, flagged for the caller.
        assert!(buf.is_readable(now, &clock));
        let (payload, info) = buf.read_msg(now, &clock).unwrap();
        assert_eq!(payload, Bytes::from_static(b"ciphertext"));
        assert_eq!(info.msgno, MsgNo::new(1));
        assert!(info.undecryptable);

        let (payload, info) = buf.read_msg(now, &clock).unwrap();
        assert_eq!(payload, Bytes::from_static(b"clear"));
        assert_eq!(info.msgno, MsgNo::new(2));
        assert!(!info.undecryptable);
    }

    #[test]
    fn undecryptable_block_flags_the_whole_message() {
        let now = Instant::now();
        let clock = immediate_clock();
        let mut buf = RecvBuffer::new(8, SeqNo::new(0));
        buf.insert(SeqNo::new(0), Bytes::from_static(b"aa"), flags(1, Boundary::First), 0).unwrap();
        buf.insert(SeqNo::new(1), Bytes::from_static(b"bb"), flags(1, Boundary::Last), 0).unwrap();
        buf.mark_undecryptable(SeqNo::new(1));
        buf.ack_data(2);

        let (payload, info) = buf.read_msg(now, &clock).unwrap();
        assert_eq!(payload, Bytes::from_static(b"aabb"));
        assert!(info.undecryptable);
    }

    #[test]
    fn clock_tracks_wrap() {
        let now = Instant::now();
        let mut clock = TsbPdClock::new(true, Duration::ZERO, false);
        clock.set_anchor(now, u32::MAX - 10);
        clock.note_ts(u32::MAX - 10);
        // A timestamp just past the wrap point is later, not 2^32 us earlier.
        let before = clock.play_time(u32::MAX - 10).unwrap();
        let after = clock.play_time(5).unwrap();
        assert!(after > before);
        assert_eq!(
            after.saturating_duration_since(before),
            Duration::from_micros(16)
        );
    }

    #[test]
    fn drift_converges_toward_sample() {
        let now = Instant::now();
        let mut clock = TsbPdClock::new(true, Duration::ZERO, true);
        clock.set_anchor(now, 0);
        for i in 1..=20u64 {
            // Peer timestamps consistently 1 ms behind local elapsed time.
            let local = now + Duration::from_micros(i * 10_000 + 1000);
            clock.on_ackack_ts((i * 10_000) as u32, local);
        }
        assert!((900..=1100).contains(&clock.drift_us()), "{}", clock.drift_us());
    }
}
