// src/connection/receiver.rs
//! Receiver half of the core: incoming data classification, loss
//! detection, ACK/NAK emission, ACKACK and DROPREQ handling, and the user
//! read paths.

use super::{Core, SocketState};
use crate::buffer::recv::{InsertError, MsgInfo};
use crate::error::{AgainCause, Result, SrtError, UsageCause};
use crate::handshake::SRT_VERSION_RATE_BPS;
use crate::packet::{
    AckData, AckInfo, AckRates, Control, DataPacket, KeySpec, LossRange,
};
use crate::seq::{MsgNo, SeqNo};
use crate::window::{is_probe1, is_probe2};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Lite ACKs are self-clocked every this many packets between full ACKs.
const LITE_ACK_PKT_INTERVAL: u32 = 64;
/// Floor of the periodic NAK interval.
const MIN_NAK_PERIOD: Duration = Duration::from_millis(20);
/// NAK period divisor applied to `RTT + 4·RTTVar`.
const NAK_REPORT_ACCEL: u32 = 2;

impl Core {
    /// Incoming data packet.
    pub(crate) async fn process_data(self: &Arc<Self>, pkt: DataPacket, now: Instant) {
        if !self.is_connected() || self.is_closing() {
            return;
        }
        let link = self.link_copy();
        let payload_len = pkt.payload.len();

        let mut rcv = self.rcv.lock().await;

        // Rate and capacity estimators see every arrival.
        rcv.time_window.on_pkt_arrival(now, payload_len);
        if is_probe1(pkt.seq) {
            rcv.time_window.probe1_arrival(now);
        } else if is_probe2(pkt.seq) {
            rcv.time_window.probe2_arrival(now, payload_len);
        }

        let boundary_off = rcv.buf.ack_seq().offset_to(pkt.seq);
        if boundary_off < 0 {
            // Older than the skip-ack boundary: always classified belated.
            drop(rcv);
            let mut stats = self.stats.lock().unwrap();
            stats.pkt_rcv_belated += 1;
            return;
        }

        // Decrypt before storing; a failure retains the flags and leaves
        // the payload opaque in the slot.
        let mut flags = pkt.flags;
        let mut payload = pkt.payload;
        let mut undecryptable = false;
        if flags.key_spec() != KeySpec::Clear {
            let crypto = self.crypto.lock().unwrap();
            let mut work = payload.to_vec();
            match crypto.decrypt(flags.key_spec(), pkt.seq, &mut work) {
                Ok(()) => {
                    payload = Bytes::from(work);
                    flags.set_key_spec(KeySpec::Clear);
                }
                Err(_) => {
                    undecryptable = true;
                }
            }
        }

        rcv.clock.note_ts(pkt.timestamp);
        match rcv.buf.insert(pkt.seq, payload, flags, pkt.timestamp) {
            Ok(()) => {}
            Err(InsertError::Duplicate) => {
                trace!("[{}] Unacked duplicate {}", self.id, pkt.seq.raw());
                return;
            }
            Err(InsertError::Belated) => {
                drop(rcv);
                self.stats.lock().unwrap().pkt_rcv_belated += 1;
                return;
            }
            Err(InsertError::Overrun) => {
                // The ACK pipeline stalled; this is fatal by design.
                warn!("[{}] Receive buffer overrun at {}", self.id, pkt.seq.raw());
                drop(rcv);
                self.make_broken(SocketState::Broken);
                return;
            }
        }
        if undecryptable {
            rcv.buf.mark_undecryptable(pkt.seq);
            let mut stats = self.stats.lock().unwrap();
            stats.pkt_rcv_undecrypt += 1;
            stats.byte_rcv_undecrypt += payload_len as u64;
        }
        {
            let mut stats = self.stats.lock().unwrap();
            stats.pkt_recv += 1;
            stats.byte_recv += payload_len as u64;
        }

        // Gap and reorder bookkeeping.
        let expected = rcv.rcv_curr_seq.inc();
        let mut immediate_nak: Option<Vec<LossRange>> = None;
        let opts_loss_ttl = self.opts.lock().unwrap().loss_max_ttl;
        let loss_first;
        {
            let mut rl = self.rcv_loss.lock().await;
            if pkt.seq.cmp_seq(expected) > 0 {
                let lo = expected;
                let hi = pkt.seq.dec();
                rl.loss.insert(lo, hi);
                let lost = lo.seq_len(hi) as u64;
                self.stats.lock().unwrap().pkt_rcv_loss += lost;
                let use_ttl =
                    opts_loss_ttl > 0 && link.peer_rexmit_flag && rl.reorder.tolerance() > 0;
                if use_ttl {
                    let tolerance = rl.reorder.tolerance();
                    rl.belated.insert(lo, hi, tolerance);
                } else {
                    immediate_nak = Some(vec![LossRange { lo, hi }]);
                }
                rcv.rcv_curr_seq = pkt.seq;
            } else if pkt.seq.cmp_seq(expected) == 0 {
                rcv.rcv_curr_seq = pkt.seq;
                if link.peer_rexmit_flag {
                    rl.reorder.on_in_order();
                }
            } else {
                // Filling a hole.
                rl.loss.remove(pkt.seq);
                rl.belated.remove(pkt.seq);
                if link.peer_rexmit_flag && !pkt.flags.rexmit() {
                    let seqdiff = pkt.seq.offset_to(rcv.rcv_curr_seq) as u32;
                    rl.reorder.on_original_out_of_order(seqdiff);
                }
            }

            // Belated-loss TTLs count arrivals; expiry emits the report.
            let expired = rl.belated.tick();
            if !expired.is_empty() {
                match &mut immediate_nak {
                    Some(list) => list.extend(expired),
                    None => immediate_nak = Some(expired),
                }
            }
            loss_first = rl.loss.first_seq();
        }

        // Self-clocked lite ACK between full ACK intervals.
        rcv.pkts_since_ack += 1;
        let lite_due =
            rcv.pkts_since_ack >= LITE_ACK_PKT_INTERVAL * (rcv.lite_acks_sent + 1);
        let lite_target = if lite_due {
            rcv.lite_acks_sent += 1;
            Some(self.ack_target(&rcv, loss_first))
        } else {
            None
        };

        let tsbpd = rcv.clock.enabled();
        drop(rcv);

        if let Some(entries) = immediate_nak {
            self.stats.lock().unwrap().pkt_nak_sent += 1;
            self.send_ctrl(Control::Nak(entries)).await;
        }
        if let Some(target) = lite_target {
            self.send_ctrl(Control::Ack {
                ack_no: 0,
                data: AckData::Lite(target),
            })
            .await;
        }

        if tsbpd {
            // The scheduler re-evaluates its deadline.
            self.tsbpd_cv.notify_waiters();
        }
    }

    /// The ACK target: the first missing sequence, clamped to never fall
    /// behind the current boundary.
    fn ack_target(&self, rcv: &super::RcvCtx, loss_first: Option<SeqNo>) -> SeqNo {
        let target = loss_first.unwrap_or_else(|| rcv.rcv_curr_seq.inc());
        if target.cmp_seq(rcv.buf.ack_seq()) < 0 {
            rcv.buf.ack_seq()
        } else {
            target
        }
    }

    /// Receiver-side timer tick: full ACK on its interval, periodic NAK
    /// when reports are enabled.
    pub(crate) async fn rcv_timer_tick(self: &Arc<Self>, now: Instant) {
        let mut rcv = self.rcv.lock().await;
        if now >= rcv.next_ack_time {
            rcv.next_ack_time = now + crate::SYN_INTERVAL;
            self.send_full_ack(&mut rcv, now).await;
        }

        let opts_nak = self.opts.lock().unwrap().nak_report;
        if opts_nak && now >= rcv.next_nak_time {
            let (rtt_us, rtt_var_us) = {
                let ack = self.ack.lock().await;
                (ack.rtt_us, ack.rtt_var_us)
            };
            let ranges = {
                let rl = self.rcv_loss.lock().await;
                if rl.loss.is_empty() {
                    Vec::new()
                } else {
                    rl.loss.report_ranges()
                }
            };
            let period = Duration::from_micros(
                (rtt_us as u64 + 4 * rtt_var_us as u64) / NAK_REPORT_ACCEL as u64,
            )
            .max(MIN_NAK_PERIOD);
            rcv.next_nak_time = now + period;
            if !ranges.is_empty() {
                drop(rcv);
                self.stats.lock().unwrap().pkt_nak_sent += 1;
                self.send_ctrl(Control::Nak(ranges)).await;
            }
        }
    }

    async fn send_full_ack(self: &Arc<Self>, rcv: &mut super::RcvCtx, now: Instant) {
        let loss_first = {
            let rl = self.rcv_loss.lock().await;
            rl.loss.first_seq()
        };
        let target = self.ack_target(rcv, loss_first);

        let advance = rcv.buf.ack_seq().offset_to(target);
        if advance > 0 {
            rcv.buf.ack_data(advance as usize);
            rcv.rcv_last_ack = target;
            if rcv.clock.enabled() {
                // Pass-ack packets may have become deliverable.
                self.tsbpd_cv.notify_waiters();
            } else {
                self.rcv_data.notify_waiters();
            }
        } else if target == rcv.rcv_last_ackack {
            // Nothing new and the peer confirmed the last one already.
            return;
        }

        let (rtt_us, rtt_var_us) = {
            let ack = self.ack.lock().await;
            (ack.rtt_us, ack.rtt_var_us)
        };

        // Extended ACK with rate estimates at most once per SYN-or-RTT.
        let rates_due = now.saturating_duration_since(rcv.last_rates_time)
            >= crate::SYN_INTERVAL.max(Duration::from_micros(rtt_us as u64));
        let rates = if rates_due {
            rcv.last_rates_time = now;
            let (pps, bps) = rcv.time_window.rcv_speed();
            let peer_version = self.link_copy().peer_version;
            let rcv_rate = if peer_version >= SRT_VERSION_RATE_BPS {
                bps
            } else {
                pps
            };
            Some(AckRates {
                rcv_speed: pps,
                bandwidth: rcv.time_window.bandwidth(),
                rcv_rate,
            })
        } else {
            None
        };

        rcv.ack_no = rcv.ack_no.wrapping_add(1).max(1);
        let ack_no = rcv.ack_no;
        rcv.ack_window.store(ack_no, target, now);
        rcv.pkts_since_ack = 0;
        rcv.lite_acks_sent = 0;

        let info = AckInfo {
            last_ack: target,
            rtt_us,
            rtt_var_us,
            avail_buf_pkts: rcv.buf.available_slots() as u32,
            rates,
        };
        self.stats.lock().unwrap().pkt_ack_sent += 1;
        self.send_ctrl(Control::Ack {
            ack_no,
            data: AckData::Full(info),
        })
        .await;
    }

    /// ACKACK: close the RTT loop and feed the drift tracer.
    pub(crate) async fn handle_ackack(self: &Arc<Self>, ack_no: u32, ctrl_ts: u32, now: Instant) {
        if !self.is_connected() {
            return;
        }
        let mut rcv = self.rcv.lock().await;
        let Some((data_seq, rtt)) = rcv.ack_window.acknowledge(ack_no, now) else {
            return;
        };
        if data_seq.cmp_seq(rcv.rcv_last_ackack) > 0 {
            rcv.rcv_last_ackack = data_seq;
        }
        rcv.clock.on_ackack_ts(ctrl_ts, now);
        let rtt_us = rtt.as_micros() as u32;
        let mut ack = self.ack.lock().await;
        ack.rtt_var_us =
            ((3 * ack.rtt_var_us as u64 + ack.rtt_us.abs_diff(rtt_us) as u64) / 4) as u32;
        ack.rtt_us = ((7 * ack.rtt_us as u64 + rtt_us as u64) / 8) as u32;
    }

    /// Peer gave up on a message: drop its range from loss tracking and,
    /// when it spans the ACK boundary, skip over it.
    pub(crate) async fn handle_dropreq(self: &Arc<Self>, msgno: MsgNo, range: LossRange) {
        if !self.is_connected() {
            return;
        }
        debug!(
            "[{}] Drop request for msg {} range {}..{}",
            self.id,
            msgno.raw(),
            range.lo.raw(),
            range.hi.raw()
        );
        let mut rcv = self.rcv.lock().await;
        {
            let mut rl = self.rcv_loss.lock().await;
            rl.loss.remove_range(range.lo, range.hi);
            rl.belated.remove_range(range.lo, range.hi);
        }
        if rcv.rcv_curr_seq.cmp_seq(range.hi) < 0 {
            rcv.rcv_curr_seq = range.hi;
        }
        let boundary = rcv.buf.ack_seq();
        if range.lo.cmp_seq(boundary) <= 0 && boundary.cmp_seq(range.hi) <= 0 {
            let n = boundary.offset_to(range.hi.inc());
            if n > 0 {
                rcv.buf.skip(n as usize);
                rcv.rcv_last_ack = rcv.buf.ack_seq();
                let mut stats = self.stats.lock().unwrap();
                stats.pkt_rcv_drop += n as u64;
            }
        }
        if rcv.clock.enabled() {
            self.tsbpd_cv.notify_waiters();
        }
    }

    fn ensure_readable(&self) -> Result<()> {
        match self.state() {
            SocketState::Connected => Ok(()),
            SocketState::Broken | SocketState::Closing | SocketState::Closed => {
                Err(SrtError::conn_lost())
            }
            _ => Err(SrtError::no_conn()),
        }
    }

    /// Stream-mode receive.
    pub(crate) async fn api_recv_stream(self: &Arc<Self>, buf: &mut [u8]) -> Result<usize> {
        let opts = self.opts_copy();
        if opts.message_api {
            return Err(SrtError::NotSup(UsageCause::WrongMode));
        }
        let deadline = opts.rcv_timeout.map(|t| Instant::now() + t);
        loop {
            self.ensure_readable()?;
            {
                let mut rcv = self.rcv.lock().await;
                let rcv = &mut *rcv;
                let n = rcv.buf.read_stream(buf, Instant::now(), &rcv.clock);
                if n > 0 {
                    self.tsbpd_cv.notify_waiters();
                    return Ok(n);
                }
            }
            if !opts.rcv_syn {
                return Err(SrtError::Again(AgainCause::RdAvail));
            }
            self.wait_rcv_data(deadline).await?;
        }
    }

    /// Message-mode receive: one complete message per call.
    pub(crate) async fn api_recv_msg(self: &Arc<Self>) -> Result<(Bytes, MsgInfo)> {
        let opts = self.opts_copy();
        if !opts.message_api {
            return Err(SrtError::NotSup(UsageCause::WrongMode));
        }
        let deadline = opts.rcv_timeout.map(|t| Instant::now() + t);
        loop {
            self.ensure_readable()?;
            {
                let mut rcv = self.rcv.lock().await;
                let rcv = &mut *rcv;
                if let Some(msg) = rcv.buf.read_msg(Instant::now(), &rcv.clock) {
                    self.tsbpd_cv.notify_waiters();
                    return Ok(msg);
                }
            }
            if !opts.rcv_syn {
                return Err(SrtError::Again(AgainCause::RdAvail));
            }
            self.wait_rcv_data(deadline).await?;
        }
    }

    /// Bounded wait on the read condition. The wait quantum is one SYN
    /// interval so a signal racing the readiness check is never lost for
    /// longer than that.
    async fn wait_rcv_data(&self, deadline: Option<Instant>) -> Result<()> {
        if let Some(d) = deadline {
            if Instant::now() >= d {
                return Err(SrtError::Again(AgainCause::XmTimeout));
            }
        }
        let _ = timeout(crate::SYN_INTERVAL, self.rcv_data.notified()).await;
        if self.is_closing() {
            return Err(SrtError::conn_lost());
        }
        Ok(())
    }
}
