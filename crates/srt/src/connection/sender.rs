// src/connection/sender.rs
//! Sender half of the core: user send paths, the pacing callback that
//! hands packets to the multiplexer, incoming ACK/LOSSREPORT processing
//! and the sender-side timers.

use super::{Core, SocketState};
use crate::buffer::MsgCtrl;
use crate::buffer::send::RexmitRead;
use crate::error::{AgainCause, Result, SrtError, UsageCause};
use crate::options::Congestion;
use crate::packet::{AckData, Control, DataPacket, LossRange, Packet};
use crate::seq::MsgNo;
use crate::window::is_probe1;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Floor for the late-drop threshold when the peer's latency is tiny.
const SND_DROP_FLOOR: Duration = Duration::from_millis(120);
/// Keepalive cadence on an idle send direction.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(1);
/// Input-rate sampling period when `MAXBW == 0`.
const RATE_SAMPLE_PERIOD: Duration = Duration::from_millis(500);

impl Core {
    fn ensure_sendable(&self) -> Result<()> {
        match self.state() {
            SocketState::Connected => Ok(()),
            SocketState::Broken | SocketState::Closing | SocketState::Closed => {
                Err(SrtError::conn_lost())
            }
            _ => Err(SrtError::no_conn()),
        }
    }

    /// Message-mode send: the whole payload is admitted as one message or
    /// the call blocks/fails.
    pub(crate) async fn api_send_msg(self: &Arc<Self>, payload: Bytes, ctrl: MsgCtrl) -> Result<usize> {
        self.ensure_sendable()?;
        let opts = self.opts_copy();
        if !opts.message_api {
            return Err(SrtError::NotSup(UsageCause::WrongMode));
        }
        let len = payload.len();
        let mut payload = Some(payload);
        let deadline = opts.snd_timeout.map(|t| Instant::now() + t);
        loop {
            self.ensure_sendable()?;
            {
                let mut snd = self.snd.lock().await;
                let needed = snd.buf.blocks_for(len);
                if needed > snd.buf.capacity() {
                    return Err(SrtError::NotSup(UsageCause::MessageTooLarge));
                }
                if snd.buf.free_slots() >= needed {
                    let now = Instant::now();
                    if let Some(p) = payload.take() {
                        snd.buf.enqueue(p, &ctrl, now);
                    }
                    snd.rate_bytes += len as u64;
                    self.sample_input_rate(&mut snd, now);
                    drop(snd);
                    self.kick_sender(now);
                    return Ok(len);
                }
            }
            if !opts.snd_syn {
                return Err(SrtError::Again(AgainCause::WrAvail));
            }
            self.wait_snd_space(deadline).await?;
        }
    }

    /// Stream-mode send: admits as many bytes as fit, blocking for more
    /// space until everything is written.
    pub(crate) async fn api_send_stream(self: &Arc<Self>, data: &[u8]) -> Result<usize> {
        self.ensure_sendable()?;
        let opts = self.opts_copy();
        if opts.message_api {
            return Err(SrtError::NotSup(UsageCause::WrongMode));
        }
        let deadline = opts.snd_timeout.map(|t| Instant::now() + t);
        let mut written = 0;
        while written < data.len() {
            self.ensure_sendable()?;
            let taken = {
                let mut snd = self.snd.lock().await;
                let now = Instant::now();
                let taken = snd.buf.enqueue_stream(&data[written..], now);
                snd.rate_bytes += taken as u64;
                self.sample_input_rate(&mut snd, now);
                taken
            };
            if taken > 0 {
                written += taken;
                self.kick_sender(Instant::now());
                continue;
            }
            if !opts.snd_syn {
                if written > 0 {
                    return Ok(written);
                }
                return Err(SrtError::Again(AgainCause::WrAvail));
            }
            self.wait_snd_space(deadline).await?;
        }
        Ok(written)
    }

    /// Bounded wait on the write condition; the SYN-interval quantum keeps
    /// a racing space signal from being lost.
    async fn wait_snd_space(&self, deadline: Option<Instant>) -> Result<()> {
        if let Some(d) = deadline {
            if Instant::now() >= d {
                return Err(SrtError::Again(AgainCause::XmTimeout));
            }
        }
        let _ = timeout(crate::SYN_INTERVAL, self.snd_space.notified()).await;
        if self.is_closing() {
            return Err(SrtError::conn_lost());
        }
        Ok(())
    }

    fn kick_sender(&self, now: Instant) {
        if let Some(mux) = self.mux.get() {
            mux.schedule(self.id, now);
        }
    }

    /// Re-derives the inter-packet interval from the bandwidth options and
    /// the sampled input rate.
    pub(crate) fn sample_input_rate(&self, snd: &mut super::SndCtx, now: Instant) {
        let opts = self.opts_copy();
        let payload = self.link_copy().payload_size.max(1) as u64;

        let bytes_per_sec: i64 = if opts.max_bw > 0 {
            opts.max_bw
        } else if opts.max_bw < 0 {
            // Unlimited: packets leave back to back.
            self.pacing_interval_us.store(1, Ordering::Release);
            return;
        } else if opts.input_bw > 0 {
            opts.input_bw * (100 + opts.overhead_bw_pct as i64) / 100
        } else {
            let elapsed = now.saturating_duration_since(snd.rate_period_start);
            if elapsed < RATE_SAMPLE_PERIOD {
                return;
            }
            let sampled = (snd.rate_bytes as f64 / elapsed.as_secs_f64()) as i64;
            snd.rate_period_start = now;
            snd.rate_bytes = 0;
            sampled.max(opts.min_input_bw) * (100 + opts.overhead_bw_pct as i64) / 100
        };

        if bytes_per_sec <= 0 {
            self.pacing_interval_us.store(1, Ordering::Release);
            return;
        }
        let interval = payload.saturating_mul(1_000_000) / bytes_per_sec as u64;
        self.pacing_interval_us.store(interval.max(1), Ordering::Release);
    }

    /// Pacing callback: picks a retransmission if the loss list and windows
    /// permit, otherwise a fresh packet, and schedules the next send.
    pub(crate) async fn pack_data(
        self: &Arc<Self>,
        now: Instant,
    ) -> Option<(Bytes, SocketAddr, Option<Instant>)> {
        if !self.is_connected() || self.is_closing() {
            return None;
        }
        let link = self.link_copy();
        let remote = (*self.peer_addr.lock().unwrap())?;
        let mut snd = self.snd.lock().await;
        let mut ack = self.ack.lock().await;

        let mut out: Option<DataPacket> = None;
        let mut is_retx = false;
        let mut drop_notices: Vec<(MsgNo, LossRange)> = Vec::new();

        while out.is_none() {
            let Some(seq) = ack.loss.pop_lowest() else { break };
            let offset = ack.snd_last_data_ack.offset_to(seq);
            if offset < 0 {
                continue;
            }
            match snd.buf.read_retransmission(offset as usize, now) {
                RexmitRead::Packet {
                    seq,
                    mut flags,
                    payload,
                    origin,
                } => {
                    if !link.peer_rexmit_flag {
                        flags.set_rexmit(false);
                    }
                    out = Some(DataPacket {
                        seq,
                        flags,
                        timestamp: self.timestamp_of(origin),
                        dst: link.peer_id,
                        payload,
                    });
                    is_retx = true;
                }
                RexmitRead::Dropped { msgno, range } => {
                    ack.loss.remove_range(range.lo, range.hi);
                    if ack.snd_curr_seq.cmp_seq(range.hi) < 0 {
                        ack.snd_curr_seq = range.hi;
                    }
                    {
                        let mut stats = self.stats.lock().unwrap();
                        stats.pkt_snd_drop += range.lo.seq_len(range.hi) as u64;
                    }
                    drop_notices.push((msgno, range));
                }
                RexmitRead::Gone => {}
            }
        }

        if out.is_none() {
            // Fresh data, subject to the flow and congestion windows.
            let inflight = ack.snd_last_ack.offset_to(ack.snd_curr_seq) + 1;
            let window = (ack.flow_window as f64).min(ack.cwnd).max(1.0) as i32;
            if inflight < window {
                if let Some(block) = snd.buf.read_original() {
                    {
                        let mut crypto = self.crypto.lock().unwrap();
                        if crypto.snd_active() {
                            let mut clear = block.payload.to_vec();
                            let kk = crypto.encrypt(block.seq, &mut clear);
                            block.payload = Bytes::from(clear);
                            block.wire_flags.set_key_spec(kk);
                        }
                        crypto.on_data_sent();
                    }
                    ack.snd_curr_seq = block.seq;
                    out = Some(DataPacket {
                        seq: block.seq,
                        flags: block.wire_flags,
                        timestamp: self.timestamp_of(block.origin),
                        dst: link.peer_id,
                        payload: block.payload.clone(),
                    });
                }
            } else {
                trace!(
                    "[{}] Window limit: {} in flight, window {}",
                    self.id, inflight, window
                );
            }
        }

        let more_pending = !snd.buf.all_sent() || !ack.loss.is_empty();
        drop(ack);
        drop(snd);

        for (msgno, range) in drop_notices {
            self.send_ctrl(Control::DropReq { msgno, range }).await;
        }

        let pkt = out?;
        {
            let mut stats = self.stats.lock().unwrap();
            if is_retx {
                stats.pkt_retransmitted += 1;
                stats.byte_retransmitted += pkt.payload.len() as u64;
            }
            stats.pkt_sent += 1;
            stats.byte_sent += pkt.payload.len() as u64;
        }
        *self.last_snd_time.lock().unwrap() = now;

        // A probe-pair opener is followed back to back; otherwise pace.
        let next = if more_pending || is_probe1(pkt.seq) {
            let follow = !is_retx && is_probe1(pkt.seq);
            let interval = if follow {
                0
            } else {
                self.pacing_interval_us.load(Ordering::Acquire)
            };
            Some(now + Duration::from_micros(interval))
        } else {
            None
        };

        Some((Packet::Data(pkt).to_bytes(), remote, next))
    }

    /// Incoming ACK at the sender.
    pub(crate) async fn handle_ack(self: &Arc<Self>, ack_no: u32, data: AckData, now: Instant) {
        if !self.is_connected() {
            return;
        }
        let ack_seq = data.last_ack();
        let mut snd = self.snd.lock().await;
        let mut ack = self.ack.lock().await;

        if ack_seq.cmp_seq(ack.snd_curr_seq.inc()) > 0 {
            warn!(
                "[{}] ACK for {} beyond current sequence {}",
                self.id,
                ack_seq.raw(),
                ack.snd_curr_seq.raw()
            );
            drop(ack);
            drop(snd);
            self.make_broken(SocketState::Broken);
            return;
        }

        let advanced = ack_seq.cmp_seq(ack.snd_last_ack) > 0;
        if advanced {
            ack.snd_last_ack = ack_seq;
        }

        let mut released = 0;
        if let AckData::Full(info) = data {
            if ack_seq.cmp_seq(ack.snd_last_data_ack) > 0 {
                let (pkts, _bytes) = snd.buf.ack_to(ack_seq);
                released = pkts;
                ack.loss.remove_up_to(ack_seq);
                ack.snd_last_data_ack = ack_seq;
            }
            if ack_seq.cmp_seq(ack.snd_last_full_ack) > 0 {
                ack.snd_last_full_ack = ack_seq;
            }

            // A duplicate full ACK within the RTT carries nothing new and
            // is dropped without touching the estimators.
            if advanced || released > 0 {
                let rtt = info.rtt_us;
                ack.rtt_var_us =
                    ((3 * ack.rtt_var_us as u64 + ack.rtt_us.abs_diff(rtt) as u64) / 4) as u32;
                ack.rtt_us = ((7 * ack.rtt_us as u64 + rtt as u64) / 8) as u32;
                ack.flow_window = info.avail_buf_pkts;

                if let Some(rates) = info.rates {
                    if rates.rcv_speed > 0 {
                        ack.deliv_rate_pps = if ack.deliv_rate_pps == 0 {
                            rates.rcv_speed
                        } else {
                            ((7 * ack.deliv_rate_pps as u64 + rates.rcv_speed as u64) / 8) as u32
                        };
                    }
                    if rates.bandwidth > 0 {
                        ack.bandwidth_pps = if ack.bandwidth_pps == 0 {
                            rates.bandwidth
                        } else {
                            ((7 * ack.bandwidth_pps as u64 + rates.bandwidth as u64) / 8) as u32
                        };
                    }
                }
                self.update_cwnd(&mut ack, released);
            }
        }
        drop(ack);
        drop(snd);

        if matches!(data, AckData::Full(_)) && ack_no != 0 {
            self.send_ctrl(Control::AckAck { ack_no }).await;
        }
        if released > 0 {
            self.snd_space.notify_waiters();
        }
        self.stats.lock().unwrap().pkt_ack_recv += 1;
        self.kick_sender(now);
    }

    /// Congestion window: pinned to the flow window in live mode, grown
    /// per the historical file scheme otherwise.
    fn update_cwnd(&self, ack: &mut super::AckCtx, released: usize) {
        let opts = self.opts.lock().unwrap();
        match opts.congestion {
            Congestion::Live => {
                ack.cwnd = ack.flow_window as f64;
            }
            Congestion::File => {
                if ack.slow_start {
                    ack.cwnd += released as f64;
                    if ack.cwnd >= ack.flow_window as f64 {
                        ack.slow_start = false;
                    }
                } else {
                    let rate = ack.deliv_rate_pps as f64;
                    let rtt_s = ack.rtt_us as f64 / 1_000_000.0;
                    ack.cwnd = rate * (rtt_s + 0.01) + 16.0;
                }
                ack.cwnd = ack.cwnd.max(16.0);
            }
        }
    }

    /// Incoming LOSSREPORT at the sender.
    pub(crate) async fn handle_nak(self: &Arc<Self>, entries: Vec<LossRange>, now: Instant) {
        if !self.is_connected() {
            return;
        }
        let mut inserted = 0usize;
        {
            let mut ack = self.ack.lock().await;
            for e in &entries {
                if e.hi.cmp_seq(ack.snd_curr_seq) > 0 {
                    warn!(
                        "[{}] Loss report {}..{} beyond sent {}",
                        self.id,
                        e.lo.raw(),
                        e.hi.raw(),
                        ack.snd_curr_seq.raw()
                    );
                    drop(ack);
                    self.make_broken(SocketState::Broken);
                    return;
                }
                let lo = if e.lo.cmp_seq(ack.snd_last_ack) < 0 {
                    ack.snd_last_ack
                } else {
                    e.lo
                };
                if lo.cmp_seq(e.hi) <= 0 {
                    inserted += ack.loss.insert(lo, e.hi);
                }
            }
            if inserted > 0 && self.opts.lock().unwrap().congestion != Congestion::Live {
                ack.slow_start = false;
                ack.cwnd = (ack.cwnd * 0.875).max(16.0);
            }
        }
        if inserted > 0 {
            let mut stats = self.stats.lock().unwrap();
            stats.pkt_snd_loss += inserted as u64;
            stats.pkt_nak_recv += 1;
        }
        self.kick_sender(now);
    }

    /// Periodic per-connection evaluation driven by the multiplexer timer.
    pub(crate) async fn check_timers(self: &Arc<Self>, now: Instant) {
        if !self.is_connected() || self.is_closing() {
            return;
        }
        self.rcv_timer_tick(now).await;

        let opts = self.opts_copy();
        let link = self.link_copy();

        // Expiration: count unanswered intervals, fast-retransmit while the
        // peer stays silent, and break the connection when it exceeds both
        // the counter and the idle bound.
        let last_rsp = *self.last_rsp_time.lock().unwrap();
        let (rtt_us, rtt_var_us) = {
            let ack = self.ack.lock().await;
            (ack.rtt_us, ack.rtt_var_us)
        };
        let exp_count = self.exp_count.load(Ordering::Acquire);
        let exp_interval = Duration::from_micros(
            (exp_count as u64) * (rtt_us as u64 + 4 * rtt_var_us as u64),
        ) + crate::SYN_INTERVAL;
        let exp_interval = exp_interval.max(Duration::from_millis(100) * exp_count);
        let idle = now.saturating_duration_since(last_rsp);
        if idle > exp_interval {
            self.exp_count.fetch_add(1, Ordering::AcqRel);
            if exp_count + 1 > 16 && idle > opts.peer_idle_timeout {
                debug!("[{}] Peer idle for {:?}, breaking", self.id, idle);
                self.make_broken(SocketState::Broken);
                return;
            }
            {
                // With peer NAK reports the receiver re-asks for losses on
                // its own schedule; blind re-listing is only for silence.
                let snd = self.snd.lock().await;
                let mut ack = self.ack.lock().await;
                if !link.peer_nak_report && !snd.buf.is_empty() && ack.loss.is_empty() {
                    let lo = ack.snd_last_ack;
                    let hi = ack.snd_curr_seq;
                    if lo.cmp_seq(hi) <= 0 {
                        ack.loss.insert(lo, hi);
                        trace!(
                            "[{}] EXP: fast retransmit {}..{}",
                            self.id,
                            lo.raw(),
                            hi.raw()
                        );
                    }
                }
            }
            self.kick_sender(now);
        }

        // Keepalive on an idle send direction.
        {
            let snd = self.snd.lock().await;
            let empty = snd.buf.is_empty();
            drop(snd);
            if empty {
                let last_snd = *self.last_snd_time.lock().unwrap();
                if now.saturating_duration_since(last_snd) >= KEEPALIVE_PERIOD {
                    *self.last_snd_time.lock().unwrap() = now;
                    self.send_ctrl(Control::KeepAlive).await;
                }
            }
        }

        // Live-mode too-late send drop; only meaningful when the peer
        // schedules delivery of what we send.
        if opts.tlpktdrop && link.snd_tsbpd {
            if let Some(extra) = opts.snd_drop_delay {
                let threshold =
                    link.peer_tsbpd_delay.max(SND_DROP_FLOOR) + 2 * crate::SYN_INTERVAL + extra;
                let mut snd = self.snd.lock().await;
                let stale = snd
                    .buf
                    .head_age(now)
                    .map(|age| age > threshold)
                    .unwrap_or(false);
                if stale {
                    let mut ack = self.ack.lock().await;
                    if let Some(drop_info) = snd.buf.drop_late(now, threshold) {
                        let range = drop_info.range;
                        ack.loss.remove_range(range.lo, range.hi);
                        let bumped = range.hi.inc();
                        if bumped.cmp_seq(ack.snd_last_ack) > 0 {
                            ack.snd_last_ack = bumped;
                        }
                        if bumped.cmp_seq(ack.snd_last_data_ack) > 0 {
                            ack.snd_last_data_ack = bumped;
                        }
                        if ack.snd_curr_seq.cmp_seq(range.hi) < 0 {
                            ack.snd_curr_seq = range.hi;
                        }
                        {
                            let mut stats = self.stats.lock().unwrap();
                            stats.pkt_snd_drop += drop_info.packets as u64;
                            stats.byte_snd_drop += drop_info.bytes as u64;
                        }
                        debug!(
                            "[{}] Too-late drop of {} packets up to {}",
                            self.id,
                            drop_info.packets,
                            range.hi.raw()
                        );
                        drop(ack);
                        drop(snd);
                        self.send_ctrl(Control::DropReq {
                            msgno: MsgNo::new(0),
                            range,
                        })
                        .await;
                        self.snd_space.notify_waiters();
                    }
                }
            }
        }

        // Rekey announcements awaiting a matching KMRSP.
        let km = self.crypto.lock().unwrap().km_to_send(now);
        if let Some(data) = km {
            self.send_ctrl(Control::Ext {
                cmd: crate::packet::ExtCmd::KmReq,
                data,
            })
            .await;
        }
    }
}
