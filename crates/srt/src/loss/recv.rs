// src/loss/recv.rs
use crate::packet::LossRange;
use crate::seq::SeqNo;

/// Ordered, disjoint set of sequence gaps discovered by the receiver.
/// `LOSSREPORT` pulls ranges in ascending order; an out-of-order arrival
/// revokes a single sequence, splitting its range when interior.
#[derive(Debug, Default)]
pub struct RcvLossList {
    ranges: Vec<LossRange>,
    count: usize,
}

impl RcvLossList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn first_seq(&self) -> Option<SeqNo> {
        self.ranges.first().map(|r| r.lo)
    }

    pub fn insert(&mut self, lo: SeqNo, hi: SeqNo) {
        if lo.cmp_seq(hi) > 0 {
            return;
        }
        let mut i = 0;
        while i < self.ranges.len() && self.ranges[i].hi.cmp_seq(lo.dec()) < 0 {
            i += 1;
        }
        let mut new_lo = lo;
        let mut new_hi = hi;
        let mut j = i;
        while j < self.ranges.len() && self.ranges[j].lo.cmp_seq(new_hi.inc()) <= 0 {
            if self.ranges[j].lo.cmp_seq(new_lo) < 0 {
                new_lo = self.ranges[j].lo;
            }
            if self.ranges[j].hi.cmp_seq(new_hi) > 0 {
                new_hi = self.ranges[j].hi;
            }
            self.count -= self.ranges[j].lo.seq_len(self.ranges[j].hi) as usize;
            j += 1;
        }
        self.ranges.drain(i..j);
        self.ranges.insert(i, LossRange { lo: new_lo, hi: new_hi });
        self.count += new_lo.seq_len(new_hi) as usize;
    }

    /// Revokes a single sequence (it arrived after all). Splits the range
    /// when the sequence is interior. Returns whether it was listed.
    pub fn remove(&mut self, seq: SeqNo) -> bool {
        for i in 0..self.ranges.len() {
            let r = self.ranges[i];
            if r.lo.cmp_seq(seq) > 0 {
                return false;
            }
            if r.hi.cmp_seq(seq) < 0 {
                continue;
            }
            self.count -= 1;
            if r.lo == r.hi {
                self.ranges.remove(i);
            } else if seq == r.lo {
                self.ranges[i].lo = r.lo.inc();
            } else if seq == r.hi {
                self.ranges[i].hi = r.hi.dec();
            } else {
                self.ranges[i].hi = seq.dec();
                self.ranges.insert(
                    i + 1,
                    LossRange {
                        lo: seq.inc(),
                        hi: r.hi,
                    },
                );
            }
            return true;
        }
        false
    }

    /// Discards every loss strictly preceding `seq` (too-late drop or skip).
    pub fn remove_up_to(&mut self, seq: SeqNo) {
        while let Some(first) = self.ranges.first_mut() {
            if first.hi.cmp_seq(seq) < 0 {
                self.count -= first.lo.seq_len(first.hi) as usize;
                self.ranges.remove(0);
            } else if first.lo.cmp_seq(seq) < 0 {
                self.count -= first.lo.offset_to(seq) as usize;
                first.lo = seq;
                break;
            } else {
                break;
            }
        }
    }

    /// Removes an entire range (peer asked to give the message up).
    pub fn remove_range(&mut self, lo: SeqNo, hi: SeqNo) {
        let mut i = 0;
        while i < self.ranges.len() {
            let r = self.ranges[i];
            if r.hi.cmp_seq(lo) < 0 {
                i += 1;
                continue;
            }
            if r.lo.cmp_seq(hi) > 0 {
                break;
            }
            self.count -= r.lo.seq_len(r.hi) as usize;
            self.ranges.remove(i);
            if r.lo.cmp_seq(lo) < 0 {
                self.ranges.insert(i, LossRange { lo: r.lo, hi: lo.dec() });
                self.count += r.lo.seq_len(lo.dec()) as usize;
                i += 1;
            }
            if r.hi.cmp_seq(hi) > 0 {
                self.ranges.insert(i, LossRange { lo: hi.inc(), hi: r.hi });
                self.count += hi.inc().seq_len(r.hi) as usize;
                i += 1;
            }
        }
    }

    /// All ranges in ascending order, for a periodic `LOSSREPORT`.
    pub fn report_ranges(&self) -> Vec<LossRange> {
        self.ranges.clone()
    }
}

/// A gap waiting out the reorder tolerance before being NAK'd.
#[derive(Debug, Clone, Copy)]
struct Belated {
    lo: SeqNo,
    hi: SeqNo,
    ttl: i32,
}

/// Secondary queue for the belated-loss feature: each record counts down
/// once per arriving data packet; an expired record is emitted as a
/// `LOSSREPORT` and erased. Arrivals inside a record follow the same
/// split/strip/delete semantics as the primary list.
#[derive(Debug, Default)]
pub struct BelatedQueue {
    entries: Vec<Belated>,
}

impl BelatedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, lo: SeqNo, hi: SeqNo, ttl: u32) {
        self.entries.push(Belated {
            lo,
            hi,
            ttl: ttl as i32,
        });
    }

    /// Called once per arriving data packet: decrements every TTL and
    /// returns the ranges whose tolerance ran out.
    pub fn tick(&mut self) -> Vec<LossRange> {
        let mut expired = Vec::new();
        self.entries.retain_mut(|e| {
            e.ttl -= 1;
            if e.ttl <= 0 {
                expired.push(LossRange { lo: e.lo, hi: e.hi });
                false
            } else {
                true
            }
        });
        expired
    }

    /// An out-of-order arrival covered part of a pending record.
    pub fn remove(&mut self, seq: SeqNo) {
        let mut i = 0;
        while i < self.entries.len() {
            let e = self.entries[i];
            if e.lo.cmp_seq(seq) <= 0 && e.hi.cmp_seq(seq) >= 0 {
                if e.lo == e.hi {
                    self.entries.remove(i);
                    return;
                } else if seq == e.lo {
                    self.entries[i].lo = e.lo.inc();
                } else if seq == e.hi {
                    self.entries[i].hi = e.hi.dec();
                } else {
                    self.entries[i].hi = seq.dec();
                    self.entries.insert(
                        i + 1,
                        Belated {
                            lo: seq.inc(),
                            hi: e.hi,
                            ttl: e.ttl,
                        },
                    );
                }
                return;
            }
            i += 1;
        }
    }

    /// Drops records fully covered by `[lo, hi]`, trimming the partials.
    pub fn remove_range(&mut self, lo: SeqNo, hi: SeqNo) {
        let mut add = Vec::new();
        self.entries.retain_mut(|e| {
            if e.hi.cmp_seq(lo) < 0 || e.lo.cmp_seq(hi) > 0 {
                return true;
            }
            if e.lo.cmp_seq(lo) < 0 {
                add.push(Belated { lo: e.lo, hi: lo.dec(), ttl: e.ttl });
            }
            if e.hi.cmp_seq(hi) > 0 {
                add.push(Belated { lo: hi.inc(), hi: e.hi, ttl: e.ttl });
            }
            false
        });
        self.entries.extend(add);
    }

    /// Drops every record strictly preceding `seq`.
    pub fn remove_up_to(&mut self, seq: SeqNo) {
        self.entries.retain_mut(|e| {
            if e.hi.cmp_seq(seq) < 0 {
                return false;
            }
            if e.lo.cmp_seq(seq) < 0 {
                e.lo = seq;
            }
            true
        });
    }
}

/// Number of consecutive in-order deliveries that lowers the tolerance.
const REORDER_DECREASE_AFTER: u32 = 50;

/// Adaptive reorder tolerance, active only when both peers advertise
/// retransmit-flag support. A confirmed-original packet arriving out of
/// order raises the tolerance toward the ceiling; long in-order streaks
/// lower it one step at a time, guarded against oscillation right after a
/// raise.
#[derive(Debug)]
pub struct ReorderTracker {
    tolerance: u32,
    max: u32,
    consecutive_in_order: u32,
    raise_guard: u32,
}

impl ReorderTracker {
    pub fn new(max: u32) -> Self {
        Self {
            tolerance: 0,
            max,
            consecutive_in_order: 0,
            raise_guard: 0,
        }
    }

    pub fn tolerance(&self) -> u32 {
        self.tolerance
    }

    /// A packet with the rexmit flag clear arrived `seqdiff` past a gap.
    pub fn on_original_out_of_order(&mut self, seqdiff: u32) {
        let target = seqdiff.min(self.max);
        if target > self.tolerance {
            self.tolerance = target;
            self.raise_guard = REORDER_DECREASE_AFTER;
        }
        self.consecutive_in_order = 0;
    }

    pub fn on_in_order(&mut self) {
        if self.raise_guard > 0 {
            self.raise_guard -= 1;
            return;
        }
        self.consecutive_in_order += 1;
        if self.consecutive_in_order >= REORDER_DECREASE_AFTER {
            self.consecutive_in_order = 0;
            if self.tolerance > 0 {
                self.tolerance -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(lo: u32, hi: u32) -> LossRange {
        LossRange {
            lo: SeqNo::new(lo),
            hi: SeqNo::new(hi),
        }
    }

    #[test]
    fn list_stays_sorted_and_disjoint() {
        let mut list = RcvLossList::new();
        list.insert(SeqNo::new(50), SeqNo::new(55));
        list.insert(SeqNo::new(10), SeqNo::new(12));
        list.insert(SeqNo::new(30), SeqNo::new(30));
        assert_eq!(list.report_ranges(), vec![r(10, 12), r(30, 30), r(50, 55)]);
        assert_eq!(list.len(), 3 + 1 + 6);
    }

    #[test]
    fn remove_interior_splits() {
        let mut list = RcvLossList::new();
        list.insert(SeqNo::new(10), SeqNo::new(20));
        assert!(list.remove(SeqNo::new(15)));
        assert_eq!(list.report_ranges(), vec![r(10, 14), r(16, 20)]);
        assert_eq!(list.len(), 10);

        assert!(list.remove(SeqNo::new(10)));
        assert!(list.remove(SeqNo::new(20)));
        assert_eq!(list.report_ranges(), vec![r(11, 14), r(16, 19)]);
        assert!(!list.remove(SeqNo::new(25)));
    }

    #[test]
    fn count_matches_missing_sequences() {
        // Invariant: sum of range lengths equals the number of missing
        // sequences in the tracked span.
        let mut list = RcvLossList::new();
        list.insert(SeqNo::new(3), SeqNo::new(4));
        list.insert(SeqNo::new(7), SeqNo::new(7));
        list.insert(SeqNo::new(9), SeqNo::new(11));
        let total: i32 = list
            .report_ranges()
            .iter()
            .map(|e| e.lo.seq_len(e.hi))
            .sum();
        assert_eq!(total as usize, list.len());
        assert_eq!(list.len(), 6);
    }

    #[test]
    fn remove_up_to_drops_prefix() {
        let mut list = RcvLossList::new();
        list.insert(SeqNo::new(10), SeqNo::new(20));
        list.insert(SeqNo::new(30), SeqNo::new(31));
        list.remove_up_to(SeqNo::new(18));
        assert_eq!(list.report_ranges(), vec![r(18, 20), r(30, 31)]);
        assert_eq!(list.first_seq(), Some(SeqNo::new(18)));
    }

    #[test]
    fn belated_ttl_counts_arrivals() {
        let mut q = BelatedQueue::new();
        q.insert(SeqNo::new(10), SeqNo::new(12), 3);
        assert!(q.tick().is_empty());
        assert!(q.tick().is_empty());
        let expired = q.tick();
        assert_eq!(expired, vec![r(10, 12)]);
        assert!(q.is_empty());
    }

    #[test]
    fn belated_arrival_splits_record() {
        let mut q = BelatedQueue::new();
        q.insert(SeqNo::new(10), SeqNo::new(14), 100);
        q.remove(SeqNo::new(12));
        q.remove(SeqNo::new(10));
        // Remaining: [11,11] and [13,14]; exhaust the TTLs.
        let mut seen = Vec::new();
        for _ in 0..100 {
            seen.extend(q.tick());
        }
        assert_eq!(seen, vec![r(11, 11), r(13, 14)]);
    }

    #[test]
    fn tolerance_raises_to_seqdiff_and_caps() {
        let mut t = ReorderTracker::new(5);
        t.on_original_out_of_order(3);
        assert_eq!(t.tolerance(), 3);
        t.on_original_out_of_order(100);
        assert_eq!(t.tolerance(), 5);
    }

    #[test]
    fn tolerance_decreases_after_fifty_in_order() {
        let mut t = ReorderTracker::new(10);
        t.on_original_out_of_order(2);
        // The raise guard absorbs the first 50 deliveries.
        for _ in 0..50 {
            t.on_in_order();
        }
        assert_eq!(t.tolerance(), 2);
        for _ in 0..50 {
            t.on_in_order();
        }
        assert_eq!(t.tolerance(), 1);
        for _ in 0..50 {
            t.on_in_order();
        }
        assert_eq!(t.tolerance(), 0);
    }
}
