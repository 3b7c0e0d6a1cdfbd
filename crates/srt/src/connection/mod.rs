// src/connection/mod.rs
//! The per-connection transport core: state variables, lock layout and
//! packet dispatch. The sender and receiver halves live in sibling
//! modules; the handshake machines in `handshake_flow`.
//!
//! Lock acquisition order is `conn > snd > rcv > ack > rcv_loss`; the
//! crypto engine and the plain-state fields sit behind leaf std mutexes
//! that are never held across an await.

pub mod handshake_flow;
pub mod receiver;
pub mod sender;

use crate::buffer::{RecvBuffer, SendBuffer, TsbPdClock};
use crate::crypto::CryptoControl;
use crate::error::RejectReason;
use crate::handshake::{Handshake, HsRole};
use crate::loss::{BelatedQueue, RcvLossList, ReorderTracker, SndLossList};
use crate::mux::Multiplexer;
use crate::options::Options;
use crate::packet::{Control, ControlPacket, Packet, SocketId};
use crate::seq::SeqNo;
use crate::stats::Stats;
use crate::window::{AckWindow, PktTimeWindow};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

/// Lifecycle of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Init,
    Opened,
    Listening,
    Connecting,
    Connected,
    Broken,
    Closing,
    Closed,
}

/// Progress of the connection handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsPhase {
    Idle,
    /// Caller: INDUCTION sent, waiting for the cookie.
    Induction,
    /// Caller: CONCLUSION sent, waiting for HSRSP.
    Conclusion,
    Rendezvous(RdvState),
    Done,
}

/// Rendezvous sub-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdvState {
    Waving,
    Attention,
    Fine,
    Initiated,
}

/// Handshake context, under the connection lock.
pub(crate) struct ConnCtx {
    pub phase: HsPhase,
    pub role: Option<HsRole>,
    /// The request we currently (re)send.
    pub local_req: Option<Handshake>,
    /// Serialized response a listener-accepted socket replays on a
    /// duplicate CONCLUSION.
    pub stored_response: Option<Bytes>,
    pub cookie: i32,
    pub peer_cookie: i32,
    pub reject: Option<RejectReason>,
}

impl ConnCtx {
    fn new() -> Self {
        Self {
            phase: HsPhase::Idle,
            role: None,
            local_req: None,
            stored_response: None,
            cookie: 0,
            peer_cookie: 0,
            reject: None,
        }
    }
}

/// Sender context (send buffer and input-rate sampling).
pub(crate) struct SndCtx {
    pub buf: SendBuffer,
    pub rate_period_start: Instant,
    pub rate_bytes: u64,
}

/// Sender ACK-side state: loss list, boundaries, flow and congestion
/// windows, RTT estimate.
pub(crate) struct AckCtx {
    pub loss: SndLossList,
    pub snd_last_ack: SeqNo,
    pub snd_last_data_ack: SeqNo,
    /// Peer-acknowledged sequence, unaffected by artificial drop bumps.
    pub snd_last_full_ack: SeqNo,
    /// Highest sequence handed to the wire.
    pub snd_curr_seq: SeqNo,
    pub flow_window: u32,
    pub cwnd: f64,
    pub slow_start: bool,
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    /// Peer-reported delivery rate, smoothed.
    pub deliv_rate_pps: u32,
    /// Link capacity estimate, smoothed.
    pub bandwidth_pps: u32,
}

/// Receiver context.
pub(crate) struct RcvCtx {
    pub buf: RecvBuffer,
    pub clock: TsbPdClock,
    /// Highest sequence seen.
    pub rcv_curr_seq: SeqNo,
    /// Last sequence acknowledged to the peer.
    pub rcv_last_ack: SeqNo,
    /// Last ACK confirmed by an ACKACK.
    pub rcv_last_ackack: SeqNo,
    pub ack_window: AckWindow,
    pub time_window: PktTimeWindow,
    pub ack_no: u32,
    pub next_ack_time: Instant,
    pub next_nak_time: Instant,
    pub last_rates_time: Instant,
    pub pkts_since_ack: u32,
    pub lite_acks_sent: u32,
}

/// Receiver loss context.
pub(crate) struct RcvLossCtx {
    pub loss: RcvLossList,
    pub belated: BelatedQueue,
    pub reorder: ReorderTracker,
}

/// Negotiated link parameters, frozen once the handshake completes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LinkCfg {
    pub peer_id: SocketId,
    pub peer_isn: SeqNo,
    pub peer_version: u32,
    /// We send with scheduled delivery (peer buffers this long).
    pub snd_tsbpd: bool,
    pub peer_tsbpd_delay: Duration,
    /// We receive with scheduled delivery.
    pub rcv_tsbpd: bool,
    pub rcv_tsbpd_delay: Duration,
    pub peer_rexmit_flag: bool,
    pub peer_nak_report: bool,
    pub peer_tlpktdrop: bool,
    pub payload_size: usize,
    pub flow_window: u32,
}

impl Default for LinkCfg {
    fn default() -> Self {
        Self {
            peer_id: SocketId(0),
            peer_isn: SeqNo::ZERO,
            peer_version: 0,
            snd_tsbpd: false,
            peer_tsbpd_delay: Duration::ZERO,
            rcv_tsbpd: false,
            rcv_tsbpd_delay: Duration::ZERO,
            peer_rexmit_flag: false,
            peer_nak_report: false,
            peer_tlpktdrop: false,
            payload_size: 1456,
            flow_window: 25600,
        }
    }
}

/// The transport core of one connection.
pub struct Core {
    pub id: SocketId,
    pub(crate) opts: StdMutex<Options>,
    state: StdMutex<SocketState>,
    pub(crate) closing: AtomicBool,
    pub(crate) mux: OnceLock<Arc<Multiplexer>>,
    pub(crate) start_time: OnceLock<Instant>,
    pub(crate) link: StdMutex<LinkCfg>,
    pub(crate) peer_addr: StdMutex<Option<SocketAddr>>,
    pub(crate) isn: SeqNo,

    pub(crate) conn: Mutex<ConnCtx>,
    pub(crate) snd: Mutex<SndCtx>,
    pub(crate) rcv: Mutex<RcvCtx>,
    pub(crate) ack: Mutex<AckCtx>,
    pub(crate) rcv_loss: Mutex<RcvLossCtx>,
    pub(crate) crypto: StdMutex<CryptoControl>,
    pub(crate) stats: StdMutex<Stats>,

    pub(crate) snd_space: Notify,
    pub(crate) rcv_data: Notify,
    pub(crate) tsbpd_cv: Notify,
    pub(crate) conn_cv: Notify,
    pub(crate) accept_cv: Notify,

    /// Inter-packet pacing interval in microseconds.
    pub(crate) pacing_interval_us: AtomicU64,
    pub(crate) exp_count: AtomicU32,
    pub(crate) last_rsp_time: StdMutex<Instant>,
    pub(crate) last_snd_time: StdMutex<Instant>,

    // Listener-only machinery.
    pub(crate) backlog: AtomicU32,
    pub(crate) accept_queue: StdMutex<VecDeque<Arc<Core>>>,
    pub(crate) pre_accept: StdMutex<HashMap<(SocketAddr, u32), Arc<Core>>>,
    pub(crate) listen_cb: StdMutex<Option<crate::socket::ListenCallback>>,
    pub(crate) peer_error_cb: StdMutex<Option<Box<dyn Fn(u32) + Send + Sync>>>,
}

impl Core {
    pub(crate) fn new(opts: Options) -> Arc<Core> {
        let now = Instant::now();
        let isn = SeqNo::random();
        let payload = opts.payload_size as usize;
        let crypto = CryptoControl::new(
            opts.passphrase.clone(),
            opts.pb_key_len as usize,
            opts.km_refresh_rate,
            opts.km_preannounce,
        );
        Arc::new(Core {
            id: SocketId::random(),
            snd: Mutex::new(SndCtx {
                buf: SendBuffer::new(opts.sndbuf_pkts as usize, payload, isn),
                rate_period_start: now,
                rate_bytes: 0,
            }),
            rcv: Mutex::new(RcvCtx {
                buf: RecvBuffer::new(opts.fc as usize, SeqNo::ZERO),
                clock: TsbPdClock::new(opts.tsbpd, opts.rcv_latency, opts.drift_tracer),
                rcv_curr_seq: SeqNo::ZERO,
                rcv_last_ack: SeqNo::ZERO,
                rcv_last_ackack: SeqNo::ZERO,
                ack_window: AckWindow::new(),
                time_window: PktTimeWindow::new(payload),
                ack_no: 0,
                next_ack_time: now,
                next_nak_time: now,
                last_rates_time: now,
                pkts_since_ack: 0,
                lite_acks_sent: 0,
            }),
            ack: Mutex::new(AckCtx {
                loss: SndLossList::new(opts.fc as usize),
                snd_last_ack: isn,
                snd_last_data_ack: isn,
                snd_last_full_ack: isn,
                snd_curr_seq: isn.dec(),
                flow_window: opts.fc,
                cwnd: 16.0,
                slow_start: true,
                rtt_us: 100_000,
                rtt_var_us: 50_000,
                deliv_rate_pps: 0,
                bandwidth_pps: 0,
            }),
            rcv_loss: Mutex::new(RcvLossCtx {
                loss: RcvLossList::new(),
                belated: BelatedQueue::new(),
                reorder: ReorderTracker::new(opts.loss_max_ttl),
            }),
            conn: Mutex::new(ConnCtx::new()),
            crypto: StdMutex::new(crypto),
            stats: StdMutex::new(Stats::default()),
            opts: StdMutex::new(opts),
            state: StdMutex::new(SocketState::Init),
            closing: AtomicBool::new(false),
            mux: OnceLock::new(),
            start_time: OnceLock::new(),
            link: StdMutex::new(LinkCfg::default()),
            peer_addr: StdMutex::new(None),
            isn,
            snd_space: Notify::new(),
            rcv_data: Notify::new(),
            tsbpd_cv: Notify::new(),
            conn_cv: Notify::new(),
            accept_cv: Notify::new(),
            pacing_interval_us: AtomicU64::new(0),
            exp_count: AtomicU32::new(1),
            last_rsp_time: StdMutex::new(now),
            last_snd_time: StdMutex::new(now),
            backlog: AtomicU32::new(0),
            accept_queue: StdMutex::new(VecDeque::new()),
            pre_accept: StdMutex::new(HashMap::new()),
            listen_cb: StdMutex::new(None),
            peer_error_cb: StdMutex::new(None),
        })
    }

    pub fn state(&self) -> SocketState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, s: SocketState) {
        *self.state.lock().unwrap() = s;
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SocketState::Connected
    }

    pub(crate) fn opts_copy(&self) -> Options {
        self.opts.lock().unwrap().clone()
    }

    pub(crate) fn link_copy(&self) -> LinkCfg {
        *self.link.lock().unwrap()
    }

    /// Microseconds since connection start, wrapping in 32 bits.
    pub(crate) fn timestamp_now(&self) -> u32 {
        match self.start_time.get() {
            Some(start) => Instant::now().saturating_duration_since(*start).as_micros() as u32,
            None => 0,
        }
    }

    pub(crate) fn timestamp_of(&self, t: Instant) -> u32 {
        match self.start_time.get() {
            Some(start) => t.saturating_duration_since(*start).as_micros() as u32,
            None => 0,
        }
    }

    pub(crate) fn touch_rsp_time(&self) {
        *self.last_rsp_time.lock().unwrap() = Instant::now();
        self.exp_count.store(1, Ordering::Release);
    }

    /// Sends a control packet to the connected peer.
    pub(crate) async fn send_ctrl(&self, body: Control) {
        let peer_id = self.link.lock().unwrap().peer_id;
        let Some(remote) = *self.peer_addr.lock().unwrap() else {
            return;
        };
        self.send_ctrl_to(body, remote, peer_id).await;
    }

    pub(crate) async fn send_ctrl_to(&self, body: Control, remote: SocketAddr, dst: SocketId) {
        let Some(mux) = self.mux.get() else { return };
        let pkt = ControlPacket {
            timestamp: self.timestamp_now(),
            dst,
            body,
        };
        let bytes = Packet::Control(pkt).to_bytes();
        if let Err(e) = mux.send_to(&bytes, remote).await {
            trace!("[{}] Control send failed: {}", self.id, e);
        }
    }

    /// Entry point for every datagram dispatched to this socket.
    pub(crate) async fn process_packet(self: &Arc<Self>, pkt: Packet, addr: SocketAddr, now: Instant) {
        self.touch_rsp_time();
        match pkt {
            Packet::Data(data) => self.process_data(data, now).await,
            Packet::Control(ctrl) => self.process_ctrl(ctrl, addr, now).await,
        }
    }

    async fn process_ctrl(self: &Arc<Self>, pkt: ControlPacket, addr: SocketAddr, now: Instant) {
        let ctrl_ts = pkt.timestamp;
        match pkt.body {
            Control::Handshake(hs) => self.process_handshake(hs, addr, ctrl_ts, now).await,
            Control::KeepAlive => {}
            Control::Ack { ack_no, data } => self.handle_ack(ack_no, data, now).await,
            Control::AckAck { ack_no } => self.handle_ackack(ack_no, ctrl_ts, now).await,
            Control::Nak(entries) => self.handle_nak(entries, now).await,
            Control::CongestionWarning => {
                debug!("[{}] Congestion warning from peer", self.id);
            }
            Control::Shutdown => {
                debug!("[{}] Peer shut down", self.id);
                self.make_broken(SocketState::Broken);
            }
            Control::DropReq { msgno, range } => self.handle_dropreq(msgno, range).await,
            Control::PeerError(code) => {
                warn!("[{}] Peer signaled error {}", self.id, code);
                let cb = self.peer_error_cb.lock().unwrap();
                if let Some(cb) = cb.as_ref() {
                    cb(code);
                }
                self.make_broken(SocketState::Broken);
            }
            Control::Ext { cmd, data } => self.handle_ext(cmd, data).await,
        }
    }

    async fn handle_ext(self: &Arc<Self>, cmd: crate::packet::ExtCmd, data: Bytes) {
        use crate::packet::ExtCmd;
        match cmd {
            ExtCmd::KmReq => {
                // Rekey announcement; connections are bidirectional, so
                // the new key also replaces our send context.
                let rsp = {
                    let mut crypto = self.crypto.lock().unwrap();
                    crypto.process_kmreq(&data, true)
                };
                self.send_ctrl(Control::Ext {
                    cmd: ExtCmd::KmRsp,
                    data: rsp,
                })
                .await;
            }
            ExtCmd::KmRsp => {
                let mut crypto = self.crypto.lock().unwrap();
                crypto.process_kmrsp(&data);
            }
            other => {
                trace!("[{}] Ignoring extension {:?} outside handshake", self.id, other);
            }
        }
    }

    /// Breaks the connection: every waiter is released and observes the
    /// terminal state on wake.
    pub(crate) fn make_broken(&self, state: SocketState) {
        let prev = self.state();
        if matches!(prev, SocketState::Closed | SocketState::Closing) && state == SocketState::Broken
        {
            return;
        }
        self.set_state(state);
        self.closing.store(true, Ordering::Release);
        self.snd_space.notify_waiters();
        self.rcv_data.notify_waiters();
        self.tsbpd_cv.notify_waiters();
        self.conn_cv.notify_waiters();
        self.accept_cv.notify_waiters();
    }

    /// Graceful close: announce, break waiters, detach from the multiplexer.
    pub async fn close(self: &Arc<Self>) {
        let first = !self.closing.swap(true, Ordering::AcqRel);
        if first {
            if self.is_connected() {
                self.send_ctrl(Control::Shutdown).await;
            }
            self.set_state(SocketState::Closing);
            self.snd_space.notify_waiters();
            self.rcv_data.notify_waiters();
            self.tsbpd_cv.notify_waiters();
            self.conn_cv.notify_waiters();
            self.accept_cv.notify_waiters();
        }
        if let Some(mux) = self.mux.get() {
            mux.unregister(self.id).await;
        }
        if self.state() != SocketState::Closed {
            self.set_state(SocketState::Closed);
            debug!("[{}] Closed", self.id);
        }
    }

    /// Registers this socket on a multiplexer bound to `addr`.
    pub(crate) async fn bind(self: &Arc<Self>, addr: SocketAddr) -> crate::error::Result<()> {
        if self.state() != SocketState::Init {
            return Err(crate::error::SrtError::NotSup(
                crate::error::UsageCause::WrongState,
            ));
        }
        let opts = self.opts_copy();
        let mux = Multiplexer::bind(addr, &opts).await?;
        mux.register(Arc::downgrade(self), self.id);
        self.mux
            .set(mux)
            .map_err(|_| crate::error::SrtError::NotSup(crate::error::UsageCause::WrongState))?;
        self.set_state(SocketState::Opened);
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.mux.get().map(|m| m.local_addr())
    }

    /// One coherent statistics snapshot.
    pub fn stats_snapshot(&self) -> crate::stats::StatsSnapshot {
        let mut snap = self.stats.lock().unwrap().snapshot();
        if let Ok(ack) = self.ack.try_lock() {
            snap.rtt_us = ack.rtt_us;
            snap.rtt_var_us = ack.rtt_var_us;
            snap.bandwidth_pps = ack.bandwidth_pps;
            snap.flow_window = ack.flow_window;
            snap.congestion_window = ack.cwnd as u32;
        }
        if let Ok(snd) = self.snd.try_lock() {
            snap.snd_buffer_pkts = snd.buf.used() as u32;
        }
        if let Ok(rcv) = self.rcv.try_lock() {
            snap.rcv_buffer_avail_pkts = rcv.buf.available_slots() as u32;
        }
        snap
    }

    /// Weak self-reference helper for registration maps.
    pub(crate) fn downgrade(self: &Arc<Self>) -> Weak<Core> {
        Arc::downgrade(self)
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
