// src/buffer/send.rs
use crate::packet::{Boundary, LossRange, MsgFlags};
use crate::seq::{MsgNo, SeqNo};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-message controls passed alongside a `sendmsg` payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgCtrl {
    /// How long the message may wait in the send buffer before it is
    /// dropped instead of (re)transmitted. `None` keeps it forever.
    pub ttl: Option<Duration>,
    /// Deliver this message only in order relative to other messages.
    pub in_order: bool,
    /// Application-provided origin time; defaults to the enqueue instant.
    pub src_time: Option<Instant>,
}

/// One outgoing packet worth of payload.
#[derive(Debug)]
pub struct Block {
    pub payload: Bytes,
    pub seq: SeqNo,
    pub msgno: MsgNo,
    /// The message-number word frozen for the wire; boundary and order bits
    /// from enqueue, encryption-key bits stamped at first transmission so
    /// retransmissions reuse them verbatim.
    pub wire_flags: MsgFlags,
    pub origin: Instant,
    pub ttl: Option<Duration>,
    pub rexmit_count: u32,
    /// Already handed to the pacer at least once.
    pub sent: bool,
    /// Expired by TTL; kept until the ACK boundary passes but never
    /// retransmitted.
    pub dropped: bool,
}

impl Block {
    fn expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(self.origin) > ttl,
            None => false,
        }
    }
}

/// What `read_retransmission` found at the requested offset.
#[derive(Debug)]
pub enum RexmitRead {
    /// Retransmit this stored block verbatim.
    Packet {
        seq: SeqNo,
        flags: MsgFlags,
        payload: Bytes,
        origin: Instant,
    },
    /// The block's message expired; notify the peer and stop resending it.
    Dropped { msgno: MsgNo, range: LossRange },
    /// Nothing at that offset (already released).
    Gone,
}

/// Summary of a late-drop sweep at the head of the queue.
#[derive(Debug)]
pub struct LateDrop {
    pub range: LossRange,
    pub packets: usize,
    pub bytes: usize,
}

/// Ordered store of outgoing payloads. The front of the deque is always the
/// first not-yet-acknowledged sequence; offsets from the ACK boundary index
/// straight into it.
#[derive(Debug)]
pub struct SendBuffer {
    blocks: VecDeque<Block>,
    capacity: usize,
    payload_size: usize,
    next_msgno: MsgNo,
    next_seq: SeqNo,
    /// Index of the next block that has never been transmitted.
    cursor: usize,
    bytes: usize,
}

impl SendBuffer {
    pub fn new(capacity: usize, payload_size: usize, isn: SeqNo) -> Self {
        Self {
            blocks: VecDeque::new(),
            capacity,
            payload_size,
            next_msgno: MsgNo::FIRST,
            next_seq: isn,
            cursor: 0,
            bytes: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.blocks.len()
    }

    pub fn free_slots(&self) -> usize {
        self.capacity - self.blocks.len()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// True when every stored block has been transmitted at least once.
    pub fn all_sent(&self) -> bool {
        self.cursor >= self.blocks.len()
    }

    /// Sequence of the first unacknowledged block, when any.
    pub fn front_seq(&self) -> Option<SeqNo> {
        self.blocks.front().map(|b| b.seq)
    }

    /// Age of the oldest stored payload.
    pub fn head_age(&self, now: Instant) -> Option<Duration> {
        self.blocks
            .front()
            .map(|b| now.saturating_duration_since(b.origin))
    }

    /// Number of packets a payload of `len` bytes will occupy.
    pub fn blocks_for(&self, len: usize) -> usize {
        len.div_ceil(self.payload_size).max(1)
    }

    /// Appends one message, splitting payloads larger than the payload size
    /// into consecutive blocks carrying FIRST/MIDDLE/LAST boundaries.
    /// The caller must have checked `free_slots()`.
    pub fn enqueue(&mut self, payload: Bytes, ctrl: &MsgCtrl, now: Instant) -> MsgNo {
        let msgno = self.next_msgno;
        self.next_msgno = self.next_msgno.inc();
        let origin = ctrl.src_time.unwrap_or(now);

        let n = self.blocks_for(payload.len());
        for i in 0..n {
            let chunk = payload.slice(i * self.payload_size..payload.len().min((i + 1) * self.payload_size));
            let boundary = match (n, i) {
                (1, _) => Boundary::Solo,
                (_, 0) => Boundary::First,
                (_, i) if i == n - 1 => Boundary::Last,
                _ => Boundary::Middle,
            };
            self.push_block(chunk, msgno, boundary, ctrl.in_order, origin, ctrl.ttl);
        }
        msgno
    }

    /// Appends raw stream bytes, each block its own solo message. Returns
    /// the number of bytes accepted (bounded by free space).
    pub fn enqueue_stream(&mut self, data: &[u8], now: Instant) -> usize {
        let mut taken = 0;
        while taken < data.len() && self.free_slots() > 0 {
            let chunk = &data[taken..data.len().min(taken + self.payload_size)];
            let msgno = self.next_msgno;
            self.next_msgno = self.next_msgno.inc();
            self.push_block(
                Bytes::copy_from_slice(chunk),
                msgno,
                Boundary::Solo,
                true,
                now,
                None,
            );
            taken += chunk.len();
        }
        taken
    }

    fn push_block(
        &mut self,
        payload: Bytes,
        msgno: MsgNo,
        boundary: Boundary,
        in_order: bool,
        origin: Instant,
        ttl: Option<Duration>,
    ) {
        self.bytes += payload.len();
        self.blocks.push_back(Block {
            wire_flags: MsgFlags::new(msgno, boundary, in_order),
            payload,
            seq: self.next_seq,
            msgno,
            origin,
            ttl,
            rexmit_count: 0,
            sent: false,
            dropped: false,
        });
        self.next_seq = self.next_seq.inc();
    }

    /// Returns the next never-transmitted block and advances the cursor.
    /// The core stamps the encryption-key bits and encrypts the stored
    /// payload in place before building the wire packet.
    pub fn read_original(&mut self) -> Option<&mut Block> {
        while self.cursor < self.blocks.len() && self.blocks[self.cursor].dropped {
            self.cursor += 1;
        }
        if self.cursor >= self.blocks.len() {
            return None;
        }
        let idx = self.cursor;
        self.cursor += 1;
        let block = &mut self.blocks[idx];
        block.sent = true;
        Some(block)
    }

    /// Reads the stored block `offset` packets past the ACK boundary for
    /// retransmission, or reports that its message has expired.
    pub fn read_retransmission(&mut self, offset: usize, now: Instant) -> RexmitRead {
        let Some(block) = self.blocks.get(offset) else {
            return RexmitRead::Gone;
        };
        if !block.sent || block.dropped {
            return RexmitRead::Gone;
        }
        if block.expired(now) {
            let msgno = block.msgno;
            // The whole message goes: scan the contiguous run of blocks
            // sharing the message number.
            let mut lo = offset;
            while lo > 0 && self.blocks[lo - 1].msgno == msgno {
                lo -= 1;
            }
            let mut hi = offset;
            while hi + 1 < self.blocks.len() && self.blocks[hi + 1].msgno == msgno {
                hi += 1;
            }
            let range = LossRange {
                lo: self.blocks[lo].seq,
                hi: self.blocks[hi].seq,
            };
            for i in lo..=hi {
                self.blocks[i].dropped = true;
            }
            if self.cursor <= hi {
                self.cursor = hi + 1;
            }
            debug!("Message #{} expired, dropping {:?}", msgno.raw(), range);
            return RexmitRead::Dropped { msgno, range };
        }
        let block = &mut self.blocks[offset];
        block.rexmit_count += 1;
        let mut flags = block.wire_flags;
        flags.set_rexmit(true);
        RexmitRead::Packet {
            seq: block.seq,
            flags,
            payload: block.payload.clone(),
            origin: block.origin,
        }
    }

    /// Releases every block whose sequence precedes `seq`. Returns the
    /// released packet and byte counts.
    pub fn ack_to(&mut self, seq: SeqNo) -> (usize, usize) {
        let mut packets = 0;
        let mut bytes = 0;
        while let Some(front) = self.blocks.front() {
            if front.seq.cmp_seq(seq) >= 0 {
                break;
            }
            bytes += front.payload.len();
            packets += 1;
            self.blocks.pop_front();
        }
        self.cursor = self.cursor.saturating_sub(packets);
        self.bytes -= bytes;
        (packets, bytes)
    }

    /// Live-mode late drop: discards head blocks older than `now - threshold`
    /// and reports the dropped range so the caller can bump its ACK state
    /// and trim the sender loss list.
    pub fn drop_late(&mut self, now: Instant, threshold: Duration) -> Option<LateDrop> {
        let deadline = now.checked_sub(threshold)?;
        let first = self.blocks.front()?;
        if first.origin > deadline {
            return None;
        }
        let lo = first.seq;
        let mut hi = lo;
        let mut packets = 0;
        let mut bytes = 0;
        while let Some(front) = self.blocks.front() {
            if front.origin > deadline {
                break;
            }
            hi = front.seq;
            bytes += front.payload.len();
            packets += 1;
            self.blocks.pop_front();
        }
        self.cursor = self.cursor.saturating_sub(packets);
        self.bytes -= bytes;
        Some(LateDrop {
            range: LossRange { lo, hi },
            packets,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf() -> SendBuffer {
        SendBuffer::new(16, 10, SeqNo::new(1000))
    }

    #[test]
    fn enqueue_splits_with_boundaries() {
        let mut b = buf();
        b.enqueue(Bytes::from(vec![0u8; 25]), &MsgCtrl::default(), Instant::now());
        assert_eq!(b.used(), 3);

        let flags: Vec<Boundary> = (0..3)
            .map(|_| b.read_original().unwrap().wire_flags.boundary())
            .collect();
        assert_eq!(flags, vec![Boundary::First, Boundary::Middle, Boundary::Last]);

        let mut b = buf();
        b.enqueue(Bytes::from(vec![0u8; 9]), &MsgCtrl::default(), Instant::now());
        assert_eq!(
            b.read_original().unwrap().wire_flags.boundary(),
            Boundary::Solo
        );
    }

    #[test]
    fn sequences_are_consecutive() {
        let mut b = buf();
        b.enqueue(Bytes::from(vec![0u8; 25]), &MsgCtrl::default(), Instant::now());
        let seqs: Vec<u32> = (0..3).map(|_| b.read_original().unwrap().seq.raw()).collect();
        assert_eq!(seqs, vec![1000, 1001, 1002]);
        assert!(b.read_original().is_none());
        assert!(b.all_sent());
    }

    #[test]
    fn ack_releases_and_keeps_offsets_valid() {
        let mut b = buf();
        let now = Instant::now();
        b.enqueue_stream(&[0u8; 50], now);
        assert_eq!(b.used(), 5);
        while b.read_original().is_some() {}

        let (packets, bytes) = b.ack_to(SeqNo::new(1002));
        assert_eq!((packets, bytes), (2, 20));
        assert_eq!(b.front_seq(), Some(SeqNo::new(1002)));

        // Offset 0 now addresses seq 1002.
        match b.read_retransmission(0, now) {
            RexmitRead::Packet { seq, flags, .. } => {
                assert_eq!(seq, SeqNo::new(1002));
                assert!(flags.rexmit());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn retransmission_of_unsent_block_is_gone() {
        let mut b = buf();
        b.enqueue_stream(&[0u8; 10], Instant::now());
        assert!(matches!(
            b.read_retransmission(0, Instant::now()),
            RexmitRead::Gone
        ));
    }

    #[test]
    fn expired_message_reports_drop_range() {
        let mut b = buf();
        let start = Instant::now();
        let ctrl = MsgCtrl {
            ttl: Some(Duration::from_millis(5)),
            ..Default::default()
        };
        b.enqueue(Bytes::from(vec![0u8; 25]), &ctrl, start);
        while b.read_original().is_some() {}

        let later = start + Duration::from_millis(50);
        match b.read_retransmission(1, later) {
            RexmitRead::Dropped { msgno, range } => {
                assert_eq!(msgno, MsgNo::FIRST);
                assert_eq!(range.lo, SeqNo::new(1000));
                assert_eq!(range.hi, SeqNo::new(1002));
            }
            other => panic!("unexpected {:?}", other),
        }
        // Dropped blocks are never offered again.
        assert!(matches!(
            b.read_retransmission(1, later),
            RexmitRead::Gone
        ));
    }

    #[test]
    fn drop_late_sweeps_old_head() {
        let mut b = buf();
        let start = Instant::now();
        b.enqueue_stream(&[0u8; 30], start);
        while b.read_original().is_some() {}

        let now = start + Duration::from_millis(500);
        let drop = b.drop_late(now, Duration::from_millis(100)).unwrap();
        assert_eq!(drop.packets, 3);
        assert_eq!(drop.bytes, 30);
        assert_eq!(drop.range.lo, SeqNo::new(1000));
        assert_eq!(drop.range.hi, SeqNo::new(1002));
        assert!(b.is_empty());

        assert!(b.drop_late(now, Duration::from_millis(100)).is_none());
    }

    #[test]
    fn stream_enqueue_respects_capacity() {
        let mut b = SendBuffer::new(3, 10, SeqNo::ZERO);
        let taken = b.enqueue_stream(&[0u8; 100], Instant::now());
        assert_eq!(taken, 30);
        assert_eq!(b.free_slots(), 0);
    }
}
