// src/options.rs
//! Socket option storage: defaults, validation, restriction tiers and the
//! live/file convenience bundles.

use crate::error::{Result, SrtError, UsageCause};
use crate::handshake::MAX_SID_LENGTH;
use crate::packet::{HDR_SIZE, UDP_HDR_SIZE};
use std::time::Duration;

/// When an option may still be changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptBinding {
    /// Only before `bind`.
    PreBind,
    /// Anything affecting the handshake: before `connect`/`listen`.
    Pre,
    /// Mutable while connected.
    Post,
}

/// Framing and pacing bundle selected by `TRANSTYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransType {
    Live,
    File,
}

/// Congestion controller variant; live disables the window growth scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Congestion {
    Live,
    File,
}

/// One settable socket option with its value.
#[derive(Debug, Clone)]
pub enum SrtOpt {
    Mss(u32),
    Fc(u32),
    SndBuf(u32),
    RcvBuf(u32),
    UdpSndBuf(usize),
    UdpRcvBuf(usize),
    SndSyn(bool),
    RcvSyn(bool),
    SndTimeout(Option<Duration>),
    RcvTimeout(Option<Duration>),
    TsbPdMode(bool),
    RcvLatency(Duration),
    PeerLatency(Duration),
    /// Sets both latencies at once.
    Latency(Duration),
    TlPktDrop(bool),
    SndDropDelay(Option<Duration>),
    NakReport(bool),
    LossMaxTtl(u32),
    MaxBw(i64),
    InputBw(i64),
    MinInputBw(i64),
    OverheadBw(u32),
    Passphrase(String),
    PbKeyLen(u32),
    EnforcedEncryption(bool),
    ConnTimeout(Duration),
    StreamId(String),
    MinVersion(u32),
    MessageApi(bool),
    TransType(TransType),
    Rendezvous(bool),
    KmRefreshRate(u64),
    KmPreAnnounce(u64),
    PeerIdleTimeout(Duration),
    DriftTracer(bool),
    IpTtl(u32),
    IpTos(u32),
    BindToDevice(String),
    PayloadSize(u32),
}

impl SrtOpt {
    /// The restriction tier this option belongs to.
    pub fn binding(&self) -> OptBinding {
        use SrtOpt::*;
        match self {
            Mss(_) | SndBuf(_) | RcvBuf(_) | UdpSndBuf(_) | UdpRcvBuf(_) | IpTtl(_)
            | IpTos(_) | BindToDevice(_) => OptBinding::PreBind,
            Fc(_) | TsbPdMode(_) | RcvLatency(_) | PeerLatency(_) | Latency(_) | TlPktDrop(_)
            | Passphrase(_) | PbKeyLen(_) | EnforcedEncryption(_) | ConnTimeout(_)
            | StreamId(_) | MinVersion(_) | MessageApi(_) | TransType(_) | Rendezvous(_)
            | KmRefreshRate(_) | KmPreAnnounce(_) | NakReport(_) | PayloadSize(_) => {
                OptBinding::Pre
            }
            SndSyn(_) | RcvSyn(_) | SndTimeout(_) | RcvTimeout(_) | SndDropDelay(_)
            | LossMaxTtl(_) | MaxBw(_) | InputBw(_) | MinInputBw(_) | OverheadBw(_)
            | PeerIdleTimeout(_) | DriftTracer(_) => OptBinding::Post,
        }
    }
}

/// Per-socket option storage. Accepted sockets inherit the listener's
/// values, except the stream identifier.
#[derive(Debug, Clone)]
pub struct Options {
    pub mss: u32,
    pub fc: u32,
    pub sndbuf_pkts: u32,
    pub rcvbuf_pkts: u32,
    pub udp_snd_buf: usize,
    pub udp_rcv_buf: usize,
    pub snd_syn: bool,
    pub rcv_syn: bool,
    pub snd_timeout: Option<Duration>,
    pub rcv_timeout: Option<Duration>,
    pub tsbpd: bool,
    pub rcv_latency: Duration,
    pub peer_latency: Duration,
    pub tlpktdrop: bool,
    pub snd_drop_delay: Option<Duration>,
    pub nak_report: bool,
    pub loss_max_ttl: u32,
    pub max_bw: i64,
    pub input_bw: i64,
    pub min_input_bw: i64,
    pub overhead_bw_pct: u32,
    pub passphrase: Option<String>,
    pub pb_key_len: u32,
    pub enforced_encryption: bool,
    pub conn_timeout: Duration,
    pub stream_id: String,
    pub min_version: u32,
    pub message_api: bool,
    pub transtype: TransType,
    pub congestion: Congestion,
    pub rendezvous: bool,
    pub km_refresh_rate: u64,
    pub km_preannounce: u64,
    pub peer_idle_timeout: Duration,
    pub drift_tracer: bool,
    pub ip_ttl: Option<u32>,
    pub ip_tos: Option<u32>,
    pub bind_device: Option<String>,
    pub payload_size: u32,
}

pub const DEFAULT_MSS: u32 = 1500;
/// Lowest MSS that still fits the headers plus a minimal payload.
pub const MIN_MSS: u32 = 76;
pub const MIN_FC: u32 = 32;
pub const DEFAULT_RCV_LATENCY: Duration = Duration::from_millis(120);
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_KM_REFRESH_RATE: u64 = 1 << 24;
pub const DEFAULT_KM_PREANNOUNCE: u64 = 1 << 12;
pub const LIVE_DEF_PAYLOAD: u32 = 1316;

impl Default for Options {
    fn default() -> Self {
        Self {
            mss: DEFAULT_MSS,
            fc: 25600,
            sndbuf_pkts: 8192,
            rcvbuf_pkts: 8192,
            udp_snd_buf: 65536,
            udp_rcv_buf: 65536,
            snd_syn: true,
            rcv_syn: true,
            snd_timeout: None,
            rcv_timeout: None,
            tsbpd: true,
            rcv_latency: DEFAULT_RCV_LATENCY,
            peer_latency: Duration::ZERO,
            tlpktdrop: true,
            snd_drop_delay: Some(Duration::ZERO),
            nak_report: true,
            loss_max_ttl: 0,
            max_bw: -1,
            input_bw: 0,
            min_input_bw: 0,
            overhead_bw_pct: 25,
            passphrase: None,
            pb_key_len: 0,
            enforced_encryption: true,
            conn_timeout: DEFAULT_CONN_TIMEOUT,
            stream_id: String::new(),
            min_version: 0,
            message_api: true,
            transtype: TransType::Live,
            congestion: Congestion::Live,
            rendezvous: false,
            km_refresh_rate: DEFAULT_KM_REFRESH_RATE,
            km_preannounce: DEFAULT_KM_PREANNOUNCE,
            peer_idle_timeout: DEFAULT_PEER_IDLE_TIMEOUT,
            drift_tracer: true,
            ip_ttl: None,
            ip_tos: None,
            bind_device: None,
            payload_size: LIVE_DEF_PAYLOAD,
        }
    }
}

impl Options {
    /// Maximum data payload per packet under the configured MSS.
    pub fn payload_capacity(&self) -> usize {
        self.mss as usize - UDP_HDR_SIZE - HDR_SIZE
    }

    /// Copy handed to a socket accepted from a listener carrying these
    /// options. The stream identifier is deliberately not inherited.
    pub fn inherit(&self) -> Options {
        let mut opts = self.clone();
        opts.stream_id = String::new();
        opts
    }

    fn bad_param() -> SrtError {
        SrtError::NotSup(UsageCause::InvalidParam)
    }

    /// Validates and applies one option value. State checks happen in the
    /// socket layer; this only knows value constraints.
    pub fn apply(&mut self, opt: SrtOpt) -> Result<()> {
        match opt {
            SrtOpt::Mss(v) => {
                if !(MIN_MSS..=DEFAULT_MSS).contains(&v) {
                    return Err(Self::bad_param());
                }
                self.mss = v;
            }
            SrtOpt::Fc(v) => {
                if v < MIN_FC {
                    return Err(Self::bad_param());
                }
                self.fc = v;
            }
            SrtOpt::SndBuf(v) => {
                if v == 0 {
                    return Err(Self::bad_param());
                }
                self.sndbuf_pkts = v;
            }
            SrtOpt::RcvBuf(v) => {
                if v == 0 {
                    return Err(Self::bad_param());
                }
                self.rcvbuf_pkts = v;
            }
            SrtOpt::UdpSndBuf(v) => self.udp_snd_buf = v,
            SrtOpt::UdpRcvBuf(v) => self.udp_rcv_buf = v,
            SrtOpt::SndSyn(v) => self.snd_syn = v,
            SrtOpt::RcvSyn(v) => self.rcv_syn = v,
            SrtOpt::SndTimeout(v) => self.snd_timeout = v,
            SrtOpt::RcvTimeout(v) => self.rcv_timeout = v,
            SrtOpt::TsbPdMode(v) => self.tsbpd = v,
            SrtOpt::RcvLatency(v) => self.rcv_latency = v,
            SrtOpt::PeerLatency(v) => self.peer_latency = v,
            SrtOpt::Latency(v) => {
                self.rcv_latency = v;
                self.peer_latency = v;
            }
            SrtOpt::TlPktDrop(v) => self.tlpktdrop = v,
            SrtOpt::SndDropDelay(v) => self.snd_drop_delay = v,
            SrtOpt::NakReport(v) => self.nak_report = v,
            SrtOpt::LossMaxTtl(v) => self.loss_max_ttl = v,
            SrtOpt::MaxBw(v) => {
                if v < -1 {
                    return Err(Self::bad_param());
                }
                self.max_bw = v;
            }
            SrtOpt::InputBw(v) => {
                if v < 0 {
                    return Err(Self::bad_param());
                }
                self.input_bw = v;
            }
            SrtOpt::MinInputBw(v) => {
                if v < 0 {
                    return Err(Self::bad_param());
                }
                self.min_input_bw = v;
            }
            SrtOpt::OverheadBw(v) => {
                if !(5..=100).contains(&v) {
                    return Err(Self::bad_param());
                }
                self.overhead_bw_pct = v;
            }
            SrtOpt::Passphrase(v) => {
                if v.is_empty() {
                    self.passphrase = None;
                } else {
                    if !(10..=79).contains(&v.len()) {
                        return Err(Self::bad_param());
                    }
                    self.passphrase = Some(v);
                }
            }
            SrtOpt::PbKeyLen(v) => {
                if !matches!(v, 0 | 16 | 24 | 32) {
                    return Err(Self::bad_param());
                }
                self.pb_key_len = v;
            }
            SrtOpt::EnforcedEncryption(v) => self.enforced_encryption = v,
            SrtOpt::ConnTimeout(v) => self.conn_timeout = v,
            SrtOpt::StreamId(v) => {
                if v.len() > MAX_SID_LENGTH {
                    return Err(Self::bad_param());
                }
                self.stream_id = v;
            }
            SrtOpt::MinVersion(v) => self.min_version = v,
            SrtOpt::MessageApi(v) => self.message_api = v,
            SrtOpt::TransType(v) => self.apply_transtype(v),
            SrtOpt::Rendezvous(v) => self.rendezvous = v,
            SrtOpt::KmRefreshRate(v) => self.km_refresh_rate = v,
            SrtOpt::KmPreAnnounce(v) => {
                if v >= self.km_refresh_rate && self.km_refresh_rate > 0 {
                    return Err(Self::bad_param());
                }
                self.km_preannounce = v;
            }
            SrtOpt::PeerIdleTimeout(v) => self.peer_idle_timeout = v,
            SrtOpt::DriftTracer(v) => self.drift_tracer = v,
            SrtOpt::IpTtl(v) => {
                if !(1..=255).contains(&v) {
                    return Err(Self::bad_param());
                }
                self.ip_ttl = Some(v);
            }
            SrtOpt::IpTos(v) => self.ip_tos = Some(v),
            SrtOpt::BindToDevice(v) => self.bind_device = Some(v),
            SrtOpt::PayloadSize(v) => {
                if v as usize > self.payload_capacity() {
                    return Err(Self::bad_param());
                }
                self.payload_size = v;
            }
        }
        Ok(())
    }

    /// Convenience bundles mirroring the live and file profiles.
    fn apply_transtype(&mut self, t: TransType) {
        self.transtype = t;
        match t {
            TransType::Live => {
                self.tsbpd = true;
                self.rcv_latency = DEFAULT_RCV_LATENCY;
                self.peer_latency = Duration::ZERO;
                self.tlpktdrop = true;
                self.snd_drop_delay = Some(Duration::ZERO);
                self.message_api = true;
                self.nak_report = true;
                self.payload_size = LIVE_DEF_PAYLOAD;
                self.congestion = Congestion::Live;
            }
            TransType::File => {
                self.tsbpd = false;
                self.rcv_latency = Duration::ZERO;
                self.peer_latency = Duration::ZERO;
                self.tlpktdrop = false;
                self.snd_drop_delay = None;
                self.message_api = false;
                self.nak_report = true;
                self.payload_size = self.payload_capacity() as u32;
                self.congestion = Congestion::File;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_payload_is_1456() {
        let opts = Options::default();
        assert_eq!(opts.payload_capacity(), 1456);
    }

    #[test]
    fn passphrase_length_bounds() {
        let mut opts = Options::default();
        assert!(opts.apply(SrtOpt::Passphrase("123456789".into())).is_err());
        assert!(opts.apply(SrtOpt::Passphrase("1234567890".into())).is_ok());
        assert!(opts.apply(SrtOpt::Passphrase("x".repeat(79))).is_ok());
        assert!(opts.apply(SrtOpt::Passphrase("x".repeat(80))).is_err());
        // Empty clears.
        assert!(opts.apply(SrtOpt::Passphrase(String::new())).is_ok());
        assert!(opts.passphrase.is_none());
    }

    #[test]
    fn mss_bounds() {
        let mut opts = Options::default();
        assert!(opts.apply(SrtOpt::Mss(75)).is_err());
        assert!(opts.apply(SrtOpt::Mss(76)).is_ok());
        assert!(opts.apply(SrtOpt::Mss(1500)).is_ok());
        assert!(opts.apply(SrtOpt::Mss(1501)).is_err());
    }

    #[test]
    fn stream_id_bounds() {
        let mut opts = Options::default();
        assert!(opts.apply(SrtOpt::StreamId("s".repeat(MAX_SID_LENGTH))).is_ok());
        assert!(opts
            .apply(SrtOpt::StreamId("s".repeat(MAX_SID_LENGTH + 1)))
            .is_err());
    }

    #[test]
    fn pbkeylen_values() {
        let mut opts = Options::default();
        for v in [0u32, 16, 24, 32] {
            assert!(opts.apply(SrtOpt::PbKeyLen(v)).is_ok());
        }
        assert!(opts.apply(SrtOpt::PbKeyLen(8)).is_err());
        assert!(opts.apply(SrtOpt::PbKeyLen(48)).is_err());
    }

    #[test]
    fn fc_minimum() {
        let mut opts = Options::default();
        assert!(opts.apply(SrtOpt::Fc(31)).is_err());
        assert!(opts.apply(SrtOpt::Fc(32)).is_ok());
    }

    #[test]
    fn transtype_bundles() {
        let mut opts = Options::default();
        opts.apply(SrtOpt::TransType(TransType::File)).unwrap();
        assert!(!opts.tsbpd);
        assert!(!opts.tlpktdrop);
        assert!(!opts.message_api);
        assert_eq!(opts.congestion, Congestion::File);
        assert_eq!(opts.payload_size as usize, opts.payload_capacity());

        opts.apply(SrtOpt::TransType(TransType::Live)).unwrap();
        assert!(opts.tsbpd);
        assert_eq!(opts.payload_size, LIVE_DEF_PAYLOAD);
        assert_eq!(opts.rcv_latency, DEFAULT_RCV_LATENCY);
    }

    #[test]
    fn inherit_drops_stream_id() {
        let mut opts = Options::default();
        opts.apply(SrtOpt::StreamId("publisher/1".into())).unwrap();
        opts.apply(SrtOpt::RcvLatency(Duration::from_millis(140)))
            .unwrap();
        let child = opts.inherit();
        assert_eq!(child.stream_id, "");
        assert_eq!(child.rcv_latency, Duration::from_millis(140));
    }

    #[test]
    fn binding_tiers() {
        assert_eq!(SrtOpt::Mss(1500).binding(), OptBinding::PreBind);
        assert_eq!(SrtOpt::Passphrase(String::new()).binding(), OptBinding::Pre);
        assert_eq!(SrtOpt::MaxBw(0).binding(), OptBinding::Post);
    }
}
