// src/connection/handshake_flow.rs
//! Connection establishment: the caller/listener (inductive) machine, the
//! symmetric rendezvous machine, extension interpretation and the hand-off
//! into a live connection.

use super::{Core, HsPhase, LinkCfg, RdvState, SocketState};
use crate::buffer::{RecvBuffer, SendBuffer, TsbPdClock};
use crate::error::{RejectReason, Result, SetupCause, SrtError};
use crate::handshake::{
    HS_MAGIC, HS_VERSION, HS_VERSION_LEGACY, Handshake, HsExt, HsReqExt, HsRole, RequestType,
    SRT_VERSION, SRT_VERSION_TLPKTDROP, bake_cookie, cookie_contest, ext_field, hs_flags,
};
use crate::options::Options;
use crate::packet::{Control, SocketId};
use crate::window::PktTimeWindow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Outcome of interpreting an HSREQ/HSRSP pair on either side.
#[derive(Debug, Clone, Copy)]
struct Negotiated {
    snd_tsbpd: bool,
    rcv_tsbpd: bool,
    /// Latency we apply when sending (the peer's receive buffer depth).
    snd_delay: Duration,
    /// Latency we apply on our receive direction.
    rcv_delay: Duration,
    peer_rexmit_flag: bool,
    peer_nak_report: bool,
    peer_tlpktdrop: bool,
    peer_version: u32,
}

fn hs_flags_from(opts: &Options) -> u32 {
    let mut f = hs_flags::REXMITFLG;
    if opts.tsbpd {
        f |= hs_flags::TSBPDSND | hs_flags::TSBPDRCV;
    }
    if opts.tlpktdrop {
        f |= hs_flags::TLPKTDROP;
    }
    if opts.nak_report {
        f |= hs_flags::NAKREPORT;
    }
    if !opts.message_api {
        f |= hs_flags::STREAM;
    }
    if opts.passphrase.is_some() {
        f |= hs_flags::HAICRYPT;
    }
    f
}

fn enc_field_from(opts: &Options) -> u16 {
    if opts.passphrase.is_some() {
        (if opts.pb_key_len == 0 { 16 } else { opts.pb_key_len } / 8) as u16
    } else {
        0
    }
}

/// Responder side: combine the peer's HSREQ with local options. Returns
/// the negotiated link parameters and the HSRSP to send back.
fn responder_negotiate(
    opts: &Options,
    req: &HsReqExt,
    min_version: u32,
) -> std::result::Result<(Negotiated, HsReqExt), RejectReason> {
    if req.srt_version < min_version {
        return Err(RejectReason::Version);
    }
    let peer_stream = req.has(hs_flags::STREAM);
    if peer_stream == opts.message_api {
        return Err(RejectReason::MessageApi);
    }

    let rcv_tsbpd = opts.tsbpd && req.has(hs_flags::TSBPDSND);
    let snd_tsbpd = opts.tsbpd && req.has(hs_flags::TSBPDRCV);
    let rcv_delay = if rcv_tsbpd {
        opts.rcv_latency
            .max(Duration::from_millis(req.snd_latency_ms as u64))
    } else {
        Duration::ZERO
    };
    let snd_delay = if snd_tsbpd {
        opts.peer_latency
            .max(Duration::from_millis(req.rcv_latency_ms as u64))
    } else {
        Duration::ZERO
    };

    let neg = Negotiated {
        snd_tsbpd,
        rcv_tsbpd,
        snd_delay,
        rcv_delay,
        peer_rexmit_flag: req.has(hs_flags::REXMITFLG),
        peer_nak_report: req.has(hs_flags::NAKREPORT),
        peer_tlpktdrop: req.has(hs_flags::TLPKTDROP),
        peer_version: req.srt_version,
    };

    let mut rsp_flags = hs_flags_from(opts);
    // Peers below the patch cutoff cannot handle the drop announcement.
    if req.srt_version < SRT_VERSION_TLPKTDROP {
        rsp_flags &= !hs_flags::TLPKTDROP;
    }
    let rsp = HsReqExt {
        srt_version: SRT_VERSION,
        flags: rsp_flags,
        snd_latency_ms: snd_delay.as_millis() as u16,
        rcv_latency_ms: rcv_delay.as_millis() as u16,
    };
    Ok((neg, rsp))
}

/// Initiator side: interpret the responder's HSRSP.
fn initiator_negotiate(
    opts: &Options,
    rsp: &HsReqExt,
    min_version: u32,
) -> std::result::Result<Negotiated, RejectReason> {
    if rsp.srt_version < min_version {
        return Err(RejectReason::Version);
    }
    let rcv_tsbpd = opts.tsbpd && rsp.has(hs_flags::TSBPDSND);
    let snd_tsbpd = opts.tsbpd && rsp.has(hs_flags::TSBPDRCV);
    Ok(Negotiated {
        snd_tsbpd,
        rcv_tsbpd,
        // The responder already folded both proposals into its answer.
        snd_delay: Duration::from_millis(rsp.rcv_latency_ms as u64),
        rcv_delay: Duration::from_millis(rsp.snd_latency_ms as u64),
        peer_rexmit_flag: rsp.has(hs_flags::REXMITFLG),
        peer_nak_report: rsp.has(hs_flags::NAKREPORT),
        peer_tlpktdrop: rsp.has(hs_flags::TLPKTDROP),
        peer_version: rsp.srt_version,
    })
}

fn map_reject(reason: RejectReason) -> SrtError {
    match reason {
        RejectReason::BadSecret | RejectReason::Unsecure => SrtError::Setup(SetupCause::Security),
        other => SrtError::Setup(SetupCause::Rejected(other)),
    }
}

impl Core {
    fn build_induction_req(&self, remote: &SocketAddr) -> Handshake {
        let opts = self.opts_copy();
        Handshake {
            // The legacy version probe: old listeners echo it verbatim.
            version: HS_VERSION_LEGACY,
            ext_field: 0,
            enc_field: 2,
            isn: self.isn,
            mss: opts.mss,
            flow_window: opts.fc,
            req_type: RequestType::Induction,
            id: self.id,
            cookie: 0,
            peer_ip: Handshake::encode_peer_ip(remote),
            ext: Vec::new(),
        }
    }

    fn build_conclusion_req(&self, remote: &SocketAddr, cookie: i32, with_hsreq: bool) -> Handshake {
        let opts = self.opts_copy();
        let mut ext = Vec::new();
        let mut ext_bits = 0u16;
        if with_hsreq {
            ext.push(HsExt::HsReq(HsReqExt {
                srt_version: SRT_VERSION,
                flags: hs_flags_from(&opts),
                snd_latency_ms: opts.peer_latency.as_millis() as u16,
                rcv_latency_ms: opts.rcv_latency.as_millis() as u16,
            }));
            ext_bits |= ext_field::HSREQ;
            let kmreq = self.crypto.lock().unwrap().kmreq_for_handshake();
            if let Some(km) = kmreq {
                ext.push(HsExt::KmReq(km));
                ext_bits |= ext_field::KMREQ;
            }
            if !opts.stream_id.is_empty() {
                ext.push(HsExt::Sid(opts.stream_id.clone()));
                ext_bits |= ext_field::CONFIG;
            }
        }
        Handshake {
            version: HS_VERSION,
            ext_field: ext_bits,
            enc_field: enc_field_from(&opts),
            isn: self.isn,
            mss: opts.mss,
            flow_window: opts.fc,
            req_type: RequestType::Conclusion,
            id: self.id,
            cookie,
            peer_ip: Handshake::encode_peer_ip(remote),
            ext,
        }
    }

    /// Blocking connect driver: (re)sends the current request every retry
    /// period until the machine reaches `Connected`, the peer rejects, or
    /// the connection TTL runs out.
    pub(crate) async fn connect(self: &Arc<Self>, remote: SocketAddr) -> Result<()> {
        let opts = self.opts_copy();
        match self.state() {
            SocketState::Opened => {}
            _ => {
                return Err(SrtError::NotSup(crate::error::UsageCause::WrongState));
            }
        }
        let rendezvous = opts.rendezvous;
        self.set_state(SocketState::Connecting);
        *self.peer_addr.lock().unwrap() = Some(remote);
        let start = Instant::now();
        let _ = self.start_time.set(start);

        if opts.passphrase.is_some() {
            // The initiator owns the send key; in rendezvous the winner
            // will use it, the loser clones from the peer's KMREQ.
            self.crypto.lock().unwrap().init_sender();
        }

        {
            let mut conn = self.conn.lock().await;
            if rendezvous {
                conn.cookie = bake_cookie(&remote, start, 0);
                conn.phase = HsPhase::Rendezvous(RdvState::Waving);
                let mut hs = self.build_conclusion_req(&remote, conn.cookie, false);
                hs.req_type = RequestType::WaveAHand;
                hs.ext_field = 0;
                conn.local_req = Some(hs);
            } else {
                conn.phase = HsPhase::Induction;
                conn.local_req = Some(self.build_induction_req(&remote));
            }
        }
        if rendezvous {
            if let Some(mux) = self.mux.get() {
                mux.set_rendezvous(self.downgrade());
            }
        }

        let ttl = if rendezvous {
            opts.conn_timeout * 10
        } else {
            opts.conn_timeout
        };
        let deadline = start + ttl;

        let result = loop {
            match self.state() {
                SocketState::Connected => break Ok(()),
                SocketState::Broken => {
                    let reject = self.conn.lock().await.reject;
                    break Err(match reject {
                        Some(r) => map_reject(r),
                        None => SrtError::Setup(SetupCause::Timeout),
                    });
                }
                _ => {}
            }
            if self.is_closing() {
                break Err(SrtError::conn_lost());
            }
            {
                let conn = self.conn.lock().await;
                if let Some(reason) = conn.reject {
                    drop(conn);
                    self.make_broken(SocketState::Broken);
                    break Err(map_reject(reason));
                }
                if let Some(req) = conn.local_req.clone() {
                    drop(conn);
                    self.send_ctrl_to(Control::Handshake(req), remote, SocketId::HANDSHAKE)
                        .await;
                }
            }
            let _ = timeout(crate::HS_RETRY_PERIOD, self.conn_cv.notified()).await;
            if Instant::now() > deadline && !self.is_connected() {
                self.make_broken(SocketState::Broken);
                break Err(SrtError::Setup(SetupCause::Timeout));
            }
        };

        match &result {
            Ok(()) => {
                // The dst-zero route stays alive so late handshake
                // retransmissions still reach this socket.
                info!("[{}] Connected to {}", self.id, remote);
            }
            Err(_) => {
                if let Some(mux) = self.mux.get() {
                    mux.clear_rendezvous();
                }
            }
        }
        result
    }

    /// Dispatch of an incoming handshake packet by socket role.
    pub(crate) async fn process_handshake(
        self: &Arc<Self>,
        hs: Handshake,
        addr: SocketAddr,
        ctrl_ts: u32,
        now: Instant,
    ) {
        match self.state() {
            SocketState::Listening => self.listener_process(hs, addr, ctrl_ts, now).await,
            SocketState::Connecting => {
                let rendezvous = self.opts.lock().unwrap().rendezvous;
                if rendezvous {
                    self.process_rendezvous(hs, addr, ctrl_ts, now).await;
                } else {
                    self.process_caller_response(hs, addr, ctrl_ts, now).await;
                }
            }
            SocketState::Connected => self.replay_handshake(hs, addr).await,
            _ => {}
        }
    }

    /// An established socket seeing another CONCLUSION re-sends its stored
    /// response (the peer lost ours); rendezvous peers answer AGREEMENT.
    async fn replay_handshake(self: &Arc<Self>, hs: Handshake, addr: SocketAddr) {
        if hs.req_type != RequestType::Conclusion {
            return;
        }
        let stored = self.conn.lock().await.stored_response.clone();
        if let Some(bytes) = stored {
            trace!("[{}] Replaying handshake response to {}", self.id, addr);
            if let Some(mux) = self.mux.get() {
                let _ = mux.send_to(&bytes, addr).await;
            }
        } else if self.opts.lock().unwrap().rendezvous {
            let mut agreement = self.build_conclusion_req(&addr, 0, false);
            agreement.req_type = RequestType::Agreement;
            self.send_ctrl_to(Control::Handshake(agreement), addr, hs.id)
                .await;
        }
    }

    // ------------------------------------------------------------------
    // Caller machine
    // ------------------------------------------------------------------

    async fn process_caller_response(
        self: &Arc<Self>,
        hs: Handshake,
        addr: SocketAddr,
        ctrl_ts: u32,
        now: Instant,
    ) {
        let mut conn = self.conn.lock().await;
        if let RequestType::Rejection(code) = hs.req_type {
            warn!("[{}] Handshake rejected by peer: {}", self.id, code);
            conn.reject = Some(RejectReason::from_code(code).unwrap_or(RejectReason::Peer));
            drop(conn);
            self.conn_cv.notify_waiters();
            return;
        }
        match conn.phase {
            HsPhase::Induction => {
                if hs.req_type != RequestType::Induction {
                    return;
                }
                if hs.version != HS_VERSION || hs.ext_field != HS_MAGIC {
                    debug!(
                        "[{}] Listener does not speak HSv5 (version {})",
                        self.id, hs.version
                    );
                    conn.reject = Some(RejectReason::Version);
                    drop(conn);
                    self.conn_cv.notify_waiters();
                    return;
                }
                conn.peer_cookie = hs.cookie;
                conn.local_req = Some(self.build_conclusion_req(&addr, hs.cookie, true));
                conn.phase = HsPhase::Conclusion;
                trace!("[{}] Induction done, sending conclusion", self.id);
            }
            HsPhase::Conclusion => {
                if hs.req_type != RequestType::Conclusion {
                    return;
                }
                let result = self.interpret_conclusion_rsp(&hs, ctrl_ts, now).await;
                match result {
                    Ok(()) => {
                        conn.phase = HsPhase::Done;
                        conn.local_req = None;
                    }
                    Err(reason) => {
                        conn.reject = Some(reason);
                    }
                }
            }
            _ => {}
        }
        drop(conn);
        self.conn_cv.notify_waiters();
    }

    /// Interprets the listener's CONCLUSION response (HSRSP + KMRSP) and
    /// brings the connection up.
    async fn interpret_conclusion_rsp(
        self: &Arc<Self>,
        hs: &Handshake,
        ctrl_ts: u32,
        now: Instant,
    ) -> std::result::Result<(), RejectReason> {
        if hs.version < HS_VERSION {
            return Err(RejectReason::Version);
        }
        let opts = self.opts_copy();
        let Some(rsp) = hs.find_hsrsp() else {
            warn!("[{}] Conclusion response without HSRSP", self.id);
            return Err(RejectReason::Rogue);
        };
        let neg = initiator_negotiate(&opts, rsp, opts.min_version)?;

        // Key material: the responder either echoed our KMREQ or reported
        // a failure state.
        let sent_kmreq = {
            let crypto = self.crypto.lock().unwrap();
            opts.passphrase.is_some() && crypto.kmreq_for_handshake().is_some()
        };
        if sent_kmreq {
            match hs.find_kmrsp() {
                Some(rsp_km) => {
                    let state = {
                        let mut crypto = self.crypto.lock().unwrap();
                        let state = crypto.process_kmrsp(rsp_km);
                        crypto.km_handshake_done();
                        state
                    };
                    if opts.enforced_encryption
                        && matches!(
                            state,
                            crate::crypto::KmState::BadSecret | crate::crypto::KmState::NoSecret
                        )
                    {
                        return Err(RejectReason::BadSecret);
                    }
                }
                None => {
                    if opts.enforced_encryption {
                        return Err(RejectReason::Unsecure);
                    }
                }
            }
        }

        let agreed_mss = hs.mss.min(opts.mss);
        self.setup_connection(hs, agreed_mss, neg, ctrl_ts, now).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Listener side
    // ------------------------------------------------------------------

    /// Handles a handshake arriving at a listening socket.
    pub(crate) async fn listener_process(
        self: &Arc<Self>,
        hs: Handshake,
        addr: SocketAddr,
        ctrl_ts: u32,
        now: Instant,
    ) {
        let start = *self.start_time.get_or_init(Instant::now);
        match hs.req_type {
            RequestType::Induction => {
                // Cookie challenge; no state is created yet.
                let opts = self.opts_copy();
                let cookie = bake_cookie(&addr, start, 0);
                let rsp = Handshake {
                    version: HS_VERSION,
                    ext_field: HS_MAGIC,
                    enc_field: enc_field_from(&opts),
                    isn: hs.isn,
                    mss: hs.mss.min(opts.mss),
                    flow_window: hs.flow_window,
                    req_type: RequestType::Induction,
                    id: self.id,
                    cookie,
                    peer_ip: Handshake::encode_peer_ip(&addr),
                    ext: Vec::new(),
                };
                trace!("[{}] Induction from {}, cookie {}", self.id, addr, cookie);
                self.send_ctrl_to(Control::Handshake(rsp), addr, hs.id).await;
            }
            RequestType::Conclusion => {
                // A repeated conclusion for an already-accepted peer only
                // needs the stored response replayed.
                let existing = self
                    .pre_accept
                    .lock()
                    .unwrap()
                    .get(&(addr, hs.id.0))
                    .cloned();
                if let Some(child) = existing {
                    child.replay_handshake(hs, addr).await;
                    return;
                }
                if let Err(reason) = self.accept_conclusion(&hs, addr, ctrl_ts, now).await {
                    debug!("[{}] Rejecting {}: {:?}", self.id, addr, reason);
                    let rej = Handshake {
                        version: HS_VERSION,
                        ext_field: 0,
                        enc_field: 0,
                        isn: hs.isn,
                        mss: hs.mss,
                        flow_window: hs.flow_window,
                        req_type: RequestType::Rejection(reason.code()),
                        id: self.id,
                        cookie: hs.cookie,
                        peer_ip: Handshake::encode_peer_ip(&addr),
                        ext: Vec::new(),
                    };
                    self.send_ctrl_to(Control::Handshake(rej), addr, hs.id).await;
                }
            }
            _ => {
                trace!(
                    "[{}] Ignoring {:?} at listener from {}",
                    self.id, hs.req_type, addr
                );
            }
        }
    }

    /// Validates a CONCLUSION and creates the accepted socket.
    async fn accept_conclusion(
        self: &Arc<Self>,
        hs: &Handshake,
        addr: SocketAddr,
        ctrl_ts: u32,
        now: Instant,
    ) -> std::result::Result<(), RejectReason> {
        let start = *self.start_time.get_or_init(Instant::now);
        let opts = self.opts_copy();

        // Cookie may roll over between the induction and the conclusion;
        // one retry against the previous minute is allowed.
        if hs.cookie != bake_cookie(&addr, start, 0) && hs.cookie != bake_cookie(&addr, start, -1)
        {
            return Err(RejectReason::RdvCookie);
        }
        if hs.version != HS_VERSION {
            return Err(RejectReason::Version);
        }
        if hs.mss > crate::options::DEFAULT_MSS || hs.mss < crate::options::MIN_MSS {
            return Err(RejectReason::Rogue);
        }
        let Some(req) = hs.find_hsreq() else {
            return Err(RejectReason::Rogue);
        };
        let backlog = self.backlog.load(std::sync::atomic::Ordering::Acquire) as usize;
        if backlog > 0 && self.accept_queue.lock().unwrap().len() >= backlog {
            return Err(RejectReason::Backlog);
        }
        let sid = hs.find_sid().unwrap_or("").to_string();
        // A stream identifier may occupy at most half the negotiated
        // payload, whatever the peer claims to have validated locally.
        let payload_cap = (hs.mss.min(opts.mss) as usize)
            .saturating_sub(crate::packet::UDP_HDR_SIZE + crate::packet::HDR_SIZE);
        if sid.len() > payload_cap / 2 {
            return Err(RejectReason::Rogue);
        }

        let child = Core::new(opts.inherit());
        let mux = self.mux.get().ok_or(RejectReason::Ipe)?.clone();
        let _ = child.mux.set(mux.clone());

        // The acceptance callback may tune the pre-accept socket (e.g.
        // passphrase, latency) or turn the caller away.
        let cb_result = {
            let cb = self.listen_cb.lock().unwrap();
            match cb.as_ref() {
                Some(cb) => cb(
                    &crate::socket::SrtSocket::from_core(child.clone()),
                    &sid,
                    addr,
                    hs.version,
                ),
                None => Ok(()),
            }
        };
        cb_result?;
        child.refresh_crypto_from_opts();

        let child_opts = child.opts_copy();
        let (neg, rsp) = responder_negotiate(&child_opts, req, child_opts.min_version)?;

        // Key material riding on the handshake.
        let mut kmrsp = None;
        match hs.find_kmreq() {
            Some(kmreq) => {
                let (rsp_bytes, state) = {
                    let mut crypto = child.crypto.lock().unwrap();
                    let rsp = crypto.process_kmreq(kmreq, true);
                    (rsp, crypto.rcv_state)
                };
                if child_opts.enforced_encryption
                    && matches!(
                        state,
                        crate::crypto::KmState::BadSecret | crate::crypto::KmState::NoSecret
                    )
                {
                    return Err(match state {
                        crate::crypto::KmState::NoSecret => RejectReason::Unsecure,
                        _ => RejectReason::BadSecret,
                    });
                }
                kmrsp = Some(rsp_bytes);
            }
            None => {
                if child_opts.passphrase.is_some() && child_opts.enforced_encryption {
                    return Err(RejectReason::Unsecure);
                }
            }
        }

        let agreed_mss = hs.mss.min(child_opts.mss);
        {
            let mut child_opts_guard = child.opts.lock().unwrap();
            child_opts_guard.mss = agreed_mss;
            child_opts_guard.stream_id = sid.clone();
        }
        *child.peer_addr.lock().unwrap() = Some(addr);
        let _ = child.start_time.set(now);
        mux.register(child.downgrade(), child.id);

        // The conclusion's timestamp anchors the peer clock.
        child.setup_connection(hs, agreed_mss, neg, ctrl_ts, now).await;

        // Build and remember the response for replays.
        let mut ext = vec![HsExt::HsRsp(rsp)];
        let mut ext_bits = ext_field::HSREQ;
        if let Some(km) = kmrsp {
            ext.push(HsExt::KmRsp(km));
            ext_bits |= ext_field::KMREQ;
        }
        let rsp_hs = Handshake {
            version: HS_VERSION,
            ext_field: ext_bits,
            enc_field: enc_field_from(&child_opts),
            isn: child.isn,
            mss: agreed_mss,
            flow_window: child_opts.fc,
            req_type: RequestType::Conclusion,
            id: child.id,
            cookie: hs.cookie,
            peer_ip: Handshake::encode_peer_ip(&addr),
            ext,
        };
        let pkt = crate::packet::Packet::Control(crate::packet::ControlPacket {
            timestamp: child.timestamp_now(),
            dst: hs.id,
            body: Control::Handshake(rsp_hs),
        });
        let bytes = pkt.to_bytes();
        child.conn.lock().await.stored_response = Some(bytes.clone());
        let _ = mux.send_to(&bytes, addr).await;

        self.pre_accept
            .lock()
            .unwrap()
            .insert((addr, hs.id.0), child.clone());
        self.accept_queue.lock().unwrap().push_back(child.clone());
        self.accept_cv.notify_waiters();
        info!("[{}] Accepted {} as {}", self.id, addr, child.id);
        Ok(())
    }

    /// Rebuilds the crypto engine after the listen callback may have
    /// changed passphrase or key length.
    pub(crate) fn refresh_crypto_from_opts(&self) {
        let opts = self.opts_copy();
        let mut crypto = self.crypto.lock().unwrap();
        *crypto = crate::crypto::CryptoControl::new(
            opts.passphrase.clone(),
            opts.pb_key_len as usize,
            opts.km_refresh_rate,
            opts.km_preannounce,
        );
    }

    // ------------------------------------------------------------------
    // Rendezvous machine
    // ------------------------------------------------------------------

    async fn process_rendezvous(
        self: &Arc<Self>,
        hs: Handshake,
        addr: SocketAddr,
        ctrl_ts: u32,
        now: Instant,
    ) {
        let mut conn = self.conn.lock().await;
        if let RequestType::Rejection(code) = hs.req_type {
            conn.reject = Some(RejectReason::from_code(code).unwrap_or(RejectReason::Peer));
            drop(conn);
            self.conn_cv.notify_waiters();
            return;
        }
        let HsPhase::Rendezvous(state) = conn.phase else {
            return;
        };

        if hs.cookie != 0 {
            conn.peer_cookie = hs.cookie;
        }
        if conn.role.is_none() && conn.peer_cookie != 0 {
            match cookie_contest(conn.cookie, conn.peer_cookie) {
                Some(role) => {
                    debug!("[{}] Cookie contest: {:?}", self.id, role);
                    conn.role = Some(role);
                }
                None => {
                    warn!("[{}] Cookie contest draw, cannot proceed", self.id);
                    conn.reject = Some(RejectReason::RdvCookie);
                    drop(conn);
                    self.conn_cv.notify_waiters();
                    return;
                }
            }
        }
        let Some(role) = conn.role else { return };

        match (state, hs.req_type) {
            (RdvState::Waving, RequestType::WaveAHand) => {
                conn.phase = HsPhase::Rendezvous(RdvState::Attention);
                conn.local_req =
                    Some(self.build_conclusion_req(&addr, conn.cookie, role == HsRole::Initiator));
            }
            (RdvState::Waving, RequestType::Conclusion) => {
                conn.phase = HsPhase::Rendezvous(RdvState::Fine);
                if role == HsRole::Responder && hs.find_hsreq().is_some() {
                    self.rdv_respond(&mut conn, &hs, addr, ctrl_ts, now).await;
                } else {
                    conn.local_req = Some(self.build_conclusion_req(
                        &addr,
                        conn.cookie,
                        role == HsRole::Initiator,
                    ));
                }
            }
            (RdvState::Attention, RequestType::WaveAHand) => {
                // Keep re-sending the conclusion.
            }
            (RdvState::Attention, RequestType::Conclusion) => match role {
                HsRole::Initiator => {
                    if hs.find_hsrsp().is_some() {
                        self.rdv_finish_initiator(&mut conn, &hs, addr, ctrl_ts, now).await;
                    }
                }
                HsRole::Responder => {
                    if hs.find_hsreq().is_some() {
                        self.rdv_respond(&mut conn, &hs, addr, ctrl_ts, now).await;
                    }
                }
            },
            (RdvState::Attention, RequestType::Agreement) => {
                // Only meaningful for an initiator that already negotiated.
            }
            (RdvState::Fine, RequestType::Conclusion) => match role {
                HsRole::Initiator => {
                    if hs.find_hsrsp().is_some() {
                        self.rdv_finish_initiator(&mut conn, &hs, addr, ctrl_ts, now).await;
                    }
                }
                HsRole::Responder => {
                    if hs.find_hsreq().is_some() {
                        self.rdv_respond(&mut conn, &hs, addr, ctrl_ts, now).await;
                    }
                }
            },
            (RdvState::Fine, RequestType::Agreement) => {
                // Responder path: negotiation happened in rdv_respond.
                conn.phase = HsPhase::Done;
                conn.local_req = None;
            }
            (RdvState::Initiated, RequestType::Conclusion) => {
                // Peer missed our response; the stored request re-sends.
            }
            (RdvState::Initiated, RequestType::Agreement) => {
                conn.phase = HsPhase::Done;
                conn.local_req = None;
            }
            _ => {
                trace!(
                    "[{}] Rendezvous: ignoring {:?} in {:?}",
                    self.id, hs.req_type, state
                );
            }
        }
        drop(conn);
        self.conn_cv.notify_waiters();
    }

    /// Responder: interpret HSREQ/KMREQ, answer with HSRSP/KMRSP, and come
    /// up; AGREEMENT (or first data) confirms the peer.
    async fn rdv_respond(
        self: &Arc<Self>,
        conn: &mut super::ConnCtx,
        hs: &Handshake,
        addr: SocketAddr,
        ctrl_ts: u32,
        now: Instant,
    ) {
        let opts = self.opts_copy();
        let Some(req) = hs.find_hsreq() else { return };
        if let Some(sid) = hs.find_sid() {
            // Same bound as on the listener path: half the payload.
            let payload_cap = (hs.mss.min(opts.mss) as usize)
                .saturating_sub(crate::packet::UDP_HDR_SIZE + crate::packet::HDR_SIZE);
            if sid.len() > payload_cap / 2 {
                conn.reject = Some(RejectReason::Rogue);
                return;
            }
        }
        let (neg, rsp) = match responder_negotiate(&opts, req, opts.min_version) {
            Ok(v) => v,
            Err(reason) => {
                conn.reject = Some(reason);
                return;
            }
        };
        let mut ext = Vec::new();
        let mut ext_bits = ext_field::HSREQ;
        ext.push(HsExt::HsRsp(rsp));
        if let Some(kmreq) = hs.find_kmreq() {
            let (rsp_bytes, state) = {
                let mut crypto = self.crypto.lock().unwrap();
                let r = crypto.process_kmreq(kmreq, true);
                (r, crypto.rcv_state)
            };
            if opts.enforced_encryption
                && matches!(
                    state,
                    crate::crypto::KmState::BadSecret | crate::crypto::KmState::NoSecret
                )
            {
                conn.reject = Some(match state {
                    crate::crypto::KmState::NoSecret => RejectReason::Unsecure,
                    _ => RejectReason::BadSecret,
                });
                return;
            }
            ext.push(HsExt::KmRsp(rsp_bytes));
            ext_bits |= ext_field::KMREQ;
        } else if opts.passphrase.is_some() && opts.enforced_encryption {
            conn.reject = Some(RejectReason::Unsecure);
            return;
        }

        let agreed_mss = hs.mss.min(opts.mss);
        self.setup_connection(hs, agreed_mss, neg, ctrl_ts, now).await;

        let mut rsp_hs = self.build_conclusion_req(&addr, conn.cookie, false);
        rsp_hs.ext = ext;
        rsp_hs.ext_field = ext_bits;
        // Remember the serialized response: once connected, a repeated
        // HSREQ conclusion from the peer is answered with exactly this.
        let pkt = crate::packet::Packet::Control(crate::packet::ControlPacket {
            timestamp: self.timestamp_now(),
            dst: hs.id,
            body: Control::Handshake(rsp_hs.clone()),
        });
        conn.stored_response = Some(pkt.to_bytes());
        conn.local_req = Some(rsp_hs);
        conn.phase = HsPhase::Rendezvous(RdvState::Initiated);
    }

    /// Initiator: interpret the responder's HSRSP, come up and agree.
    async fn rdv_finish_initiator(
        self: &Arc<Self>,
        conn: &mut super::ConnCtx,
        hs: &Handshake,
        addr: SocketAddr,
        ctrl_ts: u32,
        now: Instant,
    ) {
        match self.interpret_conclusion_rsp(hs, ctrl_ts, now).await {
            Ok(()) => {
                conn.phase = HsPhase::Done;
                let mut agreement = self.build_conclusion_req(&addr, conn.cookie, false);
                agreement.req_type = RequestType::Agreement;
                conn.local_req = None;
                self.send_ctrl_to(Control::Handshake(agreement), addr, hs.id)
                    .await;
            }
            Err(reason) => {
                conn.reject = Some(reason);
            }
        }
    }

    // ------------------------------------------------------------------
    // Hand-off into a live connection
    // ------------------------------------------------------------------

    /// Installs the negotiated parameters, rebuilds the data-path state at
    /// its final sizes and wakes the world.
    async fn setup_connection(
        self: &Arc<Self>,
        peer_hs: &Handshake,
        agreed_mss: u32,
        neg: Negotiated,
        ctrl_ts: u32,
        now: Instant,
    ) {
        let opts = self.opts_copy();
        let payload = (opts.payload_size as usize)
            .min(agreed_mss as usize - crate::packet::UDP_HDR_SIZE - crate::packet::HDR_SIZE);
        let flow_window = peer_hs.flow_window.min(opts.fc);

        let link = LinkCfg {
            peer_id: peer_hs.id,
            peer_isn: peer_hs.isn,
            peer_version: neg.peer_version,
            snd_tsbpd: neg.snd_tsbpd,
            peer_tsbpd_delay: neg.snd_delay,
            rcv_tsbpd: neg.rcv_tsbpd,
            rcv_tsbpd_delay: neg.rcv_delay,
            peer_rexmit_flag: neg.peer_rexmit_flag,
            peer_nak_report: neg.peer_nak_report,
            peer_tlpktdrop: neg.peer_tlpktdrop,
            payload_size: payload,
            flow_window,
        };
        *self.link.lock().unwrap() = link;
        {
            let mut o = self.opts.lock().unwrap();
            o.rcv_latency = neg.rcv_delay;
            o.peer_latency = neg.snd_delay;
            // Drop-on-deadline only works when both ends play along.
            o.tlpktdrop = o.tlpktdrop && neg.peer_tlpktdrop;
        }

        {
            let mut snd = self.snd.lock().await;
            snd.buf = SendBuffer::new(opts.sndbuf_pkts as usize, payload, self.isn);
            snd.rate_period_start = now;
            snd.rate_bytes = 0;
            self.sample_input_rate(&mut snd, now);
        }
        {
            let mut ack = self.ack.lock().await;
            ack.loss = crate::loss::SndLossList::new(flow_window as usize);
            ack.snd_last_ack = self.isn;
            ack.snd_last_data_ack = self.isn;
            ack.snd_last_full_ack = self.isn;
            ack.snd_curr_seq = self.isn.dec();
            ack.flow_window = flow_window;
            ack.cwnd = match opts.congestion {
                crate::options::Congestion::Live => flow_window as f64,
                crate::options::Congestion::File => 16.0,
            };
            ack.slow_start = opts.congestion == crate::options::Congestion::File;
        }
        {
            let mut rcv = self.rcv.lock().await;
            rcv.buf = RecvBuffer::new(flow_window as usize, peer_hs.isn);
            rcv.clock = TsbPdClock::new(neg.rcv_tsbpd, neg.rcv_delay, opts.drift_tracer);
            rcv.clock.set_anchor(now, ctrl_ts);
            rcv.rcv_curr_seq = peer_hs.isn.dec();
            rcv.rcv_last_ack = peer_hs.isn;
            rcv.rcv_last_ackack = peer_hs.isn;
            rcv.time_window = PktTimeWindow::new(payload);
            rcv.next_ack_time = now + crate::SYN_INTERVAL;
            rcv.next_nak_time = now + crate::SYN_INTERVAL;
        }

        self.set_state(SocketState::Connected);
        self.conn_cv.notify_waiters();

        if neg.rcv_tsbpd {
            tokio::spawn(crate::tsbpd::run(self.clone()));
        }
        debug!(
            "[{}] Link up: peer {} isn {} payload {} fw {} snd_delay {:?} rcv_delay {:?}",
            self.id,
            link.peer_id,
            link.peer_isn.raw(),
            payload,
            flow_window,
            neg.snd_delay,
            neg.rcv_delay
        );
    }
}
