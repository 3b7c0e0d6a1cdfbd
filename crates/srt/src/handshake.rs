// src/handshake.rs
//! Handshake payload codec: the fixed 48-byte block, the SRT extension
//! blocks attached to CONCLUSION packets, and the listener cookie.

use crate::packet::{CodecError, ExtCmd, SocketId};
use crate::seq::SeqNo;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;
use tracing::warn;

/// Handshake protocol version spoken by this implementation.
pub const HS_VERSION: u32 = 5;
/// Version number a caller puts into INDUCTION. Legacy listeners echo the
/// version verbatim, so probing with 5 would produce a false positive.
pub const HS_VERSION_LEGACY: u32 = 4;

/// Magic marker a v5 listener puts into the type field of its INDUCTION
/// response so the caller can recognize HSv5 support.
pub const HS_MAGIC: u16 = 0x4A17;

/// Current SRT library version advertised in HSREQ/HSRSP.
pub const SRT_VERSION: u32 = srt_version(1, 3, 4);
/// Peers from this version on report the delivery rate in bytes/sec.
pub const SRT_VERSION_RATE_BPS: u32 = srt_version(1, 0, 3);
/// Peers below this version cannot accept TLPKTDROP in the response.
pub const SRT_VERSION_TLPKTDROP: u32 = srt_version(1, 0, 5);

pub const fn srt_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 16) | (minor << 8) | patch
}

/// Capability flags of the HSREQ/HSRSP extension.
pub mod hs_flags {
    pub const TSBPDSND: u32 = 0x01;
    pub const TSBPDRCV: u32 = 0x02;
    pub const HAICRYPT: u32 = 0x04;
    pub const TLPKTDROP: u32 = 0x08;
    pub const NAKREPORT: u32 = 0x10;
    pub const REXMITFLG: u32 = 0x20;
    pub const STREAM: u32 = 0x40;
}

/// Extension-presence bits of the handshake type field (high half word).
pub mod ext_field {
    pub const HSREQ: u16 = 0x1;
    pub const KMREQ: u16 = 0x2;
    pub const CONFIG: u16 = 0x4;
}

/// Maximum stream-identifier length accepted or sent.
pub const MAX_SID_LENGTH: usize = 512;

/// Handshake request type, carried as a signed 32-bit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    WaveAHand,
    Induction,
    Conclusion,
    Agreement,
    /// Internal marker: processing finished, nothing to send.
    Done,
    /// Error response; codes 1000..1999.
    Rejection(i32),
}

impl RequestType {
    pub fn code(self) -> i32 {
        match self {
            RequestType::WaveAHand => 0,
            RequestType::Induction => 1,
            RequestType::Conclusion => -1,
            RequestType::Agreement => -2,
            RequestType::Done => -3,
            RequestType::Rejection(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, CodecError> {
        Ok(match code {
            0 => RequestType::WaveAHand,
            1 => RequestType::Induction,
            -1 => RequestType::Conclusion,
            -2 => RequestType::Agreement,
            -3 => RequestType::Done,
            1000..=1999 => RequestType::Rejection(code),
            other => {
                return Err(CodecError::InvalidData(format!(
                    "unknown handshake request type {}",
                    other
                )));
            }
        })
    }

    pub fn is_rejection(self) -> bool {
        matches!(self, RequestType::Rejection(_))
    }
}

/// HSREQ and HSRSP payload: version, capability flags and the packed
/// latency field (send latency in the high 16 bits, receive in the low).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsReqExt {
    pub srt_version: u32,
    pub flags: u32,
    pub snd_latency_ms: u16,
    pub rcv_latency_ms: u16,
}

impl HsReqExt {
    pub const WIRE_WORDS: u16 = 3;

    pub fn decode(reader: &mut Bytes) -> Result<Self, CodecError> {
        if reader.remaining() < 12 {
            return Err(CodecError::UnexpectedEof {
                needed: 12,
                remaining: reader.remaining(),
            });
        }
        let srt_version = reader.get_u32();
        let flags = reader.get_u32();
        let latency = reader.get_u32();
        Ok(Self {
            srt_version,
            flags,
            snd_latency_ms: (latency >> 16) as u16,
            rcv_latency_ms: (latency & 0xFFFF) as u16,
        })
    }

    pub fn encode(&self, writer: &mut BytesMut) {
        writer.put_u32(self.srt_version);
        writer.put_u32(self.flags);
        writer.put_u32(((self.snd_latency_ms as u32) << 16) | self.rcv_latency_ms as u32);
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

/// A parsed handshake extension block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HsExt {
    HsReq(HsReqExt),
    HsRsp(HsReqExt),
    KmReq(Bytes),
    KmRsp(Bytes),
    Sid(String),
}

impl HsExt {
    fn cmd(&self) -> ExtCmd {
        match self {
            HsExt::HsReq(_) => ExtCmd::HsReq,
            HsExt::HsRsp(_) => ExtCmd::HsRsp,
            HsExt::KmReq(_) => ExtCmd::KmReq,
            HsExt::KmRsp(_) => ExtCmd::KmRsp,
            HsExt::Sid(_) => ExtCmd::Sid,
        }
    }
}

/// The handshake payload: fixed 48-byte block plus extension blocks on
/// CONCLUSION packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
    /// High half of the type word: extension-presence bits, or [`HS_MAGIC`]
    /// in a listener's INDUCTION response.
    pub ext_field: u16,
    /// Low half of the type word: advertised encryption key length in
    /// 8-byte units (2/3/4), zero when no encryption is configured.
    pub enc_field: u16,
    pub isn: SeqNo,
    pub mss: u32,
    pub flow_window: u32,
    pub req_type: RequestType,
    pub id: SocketId,
    pub cookie: i32,
    pub peer_ip: [u8; 16],
    pub ext: Vec<HsExt>,
}

impl Handshake {
    pub const FIXED_SIZE: usize = 48;

    pub fn decode(reader: &mut Bytes) -> Result<Self, CodecError> {
        if reader.remaining() < Self::FIXED_SIZE {
            return Err(CodecError::UnexpectedEof {
                needed: Self::FIXED_SIZE,
                remaining: reader.remaining(),
            });
        }
        let version = reader.get_u32();
        let type_word = reader.get_u32();
        let isn = SeqNo::new(reader.get_u32());
        let mss = reader.get_u32();
        let flow_window = reader.get_u32();
        let req_type = RequestType::from_code(reader.get_i32())?;
        let id = SocketId(reader.get_u32());
        let cookie = reader.get_i32();
        let mut peer_ip = [0u8; 16];
        reader.copy_to_slice(&mut peer_ip);

        let ext = Self::decode_ext(reader)?;

        Ok(Self {
            version,
            ext_field: (type_word >> 16) as u16,
            enc_field: (type_word & 0xFFFF) as u16,
            isn,
            mss,
            flow_window,
            req_type,
            id,
            cookie,
            peer_ip,
            ext,
        })
    }

    /// Parses extension blocks: each a command/size word (command in the
    /// high 16 bits, size in 32-bit words in the low 16) followed by that
    /// many words. Stops cleanly at end of buffer; truncation is an error.
    fn decode_ext(reader: &mut Bytes) -> Result<Vec<HsExt>, CodecError> {
        let mut out = Vec::new();
        while reader.remaining() >= 4 {
            let word = reader.get_u32();
            let cmd = (word >> 16) as u16;
            let size = (word & 0xFFFF) as usize * 4;
            if reader.remaining() < size {
                return Err(CodecError::UnexpectedEof {
                    needed: size,
                    remaining: reader.remaining(),
                });
            }
            let mut block = reader.copy_to_bytes(size);
            match ExtCmd::from_code(cmd) {
                Some(ExtCmd::HsReq) => out.push(HsExt::HsReq(HsReqExt::decode(&mut block)?)),
                Some(ExtCmd::HsRsp) => out.push(HsExt::HsRsp(HsReqExt::decode(&mut block)?)),
                Some(ExtCmd::KmReq) => out.push(HsExt::KmReq(block)),
                Some(ExtCmd::KmRsp) => out.push(HsExt::KmRsp(block)),
                Some(ExtCmd::Sid) => {
                    // Raw UTF-8, zero-padded up to a 4-byte multiple. The
                    // copy is always NUL-terminated on our side.
                    let end = block.iter().position(|&b| b == 0).unwrap_or(block.len());
                    let sid = String::from_utf8_lossy(&block[..end]).into_owned();
                    out.push(HsExt::Sid(sid));
                }
                None => {
                    warn!("Skipping unknown handshake extension command {}", cmd);
                }
            }
        }
        Ok(out)
    }

    pub fn encode(&self, writer: &mut BytesMut) {
        writer.put_u32(self.version);
        writer.put_u32(((self.ext_field as u32) << 16) | self.enc_field as u32);
        writer.put_u32(self.isn.raw());
        writer.put_u32(self.mss);
        writer.put_u32(self.flow_window);
        writer.put_i32(self.req_type.code());
        writer.put_u32(self.id.0);
        writer.put_i32(self.cookie);
        writer.put_slice(&self.peer_ip);

        for ext in &self.ext {
            match ext {
                HsExt::HsReq(req) | HsExt::HsRsp(req) => {
                    writer.put_u32(((ext.cmd().code() as u32) << 16) | HsReqExt::WIRE_WORDS as u32);
                    req.encode(writer);
                }
                HsExt::KmReq(data) | HsExt::KmRsp(data) => {
                    debug_assert_eq!(data.len() % 4, 0);
                    writer.put_u32(((ext.cmd().code() as u32) << 16) | (data.len() / 4) as u32);
                    writer.put_slice(data);
                }
                HsExt::Sid(sid) => {
                    let padded = sid.len().div_ceil(4) * 4;
                    writer.put_u32(((ExtCmd::Sid.code() as u32) << 16) | (padded / 4) as u32);
                    writer.put_slice(sid.as_bytes());
                    writer.put_bytes(0, padded - sid.len());
                }
            }
        }
    }

    pub fn find_hsreq(&self) -> Option<&HsReqExt> {
        self.ext.iter().find_map(|e| match e {
            HsExt::HsReq(r) => Some(r),
            _ => None,
        })
    }

    pub fn find_hsrsp(&self) -> Option<&HsReqExt> {
        self.ext.iter().find_map(|e| match e {
            HsExt::HsRsp(r) => Some(r),
            _ => None,
        })
    }

    pub fn find_kmreq(&self) -> Option<&Bytes> {
        self.ext.iter().find_map(|e| match e {
            HsExt::KmReq(d) => Some(d),
            _ => None,
        })
    }

    pub fn find_kmrsp(&self) -> Option<&Bytes> {
        self.ext.iter().find_map(|e| match e {
            HsExt::KmRsp(d) => Some(d),
            _ => None,
        })
    }

    pub fn find_sid(&self) -> Option<&str> {
        self.ext.iter().find_map(|e| match e {
            HsExt::Sid(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// Encodes the peer address into the 16-byte echo field.
    pub fn encode_peer_ip(addr: &SocketAddr) -> [u8; 16] {
        let mut out = [0u8; 16];
        match addr.ip() {
            IpAddr::V4(ip) => out[..4].copy_from_slice(&ip.octets()),
            IpAddr::V6(ip) => out.copy_from_slice(&ip.octets()),
        }
        out
    }
}

fn cookie_distractor() -> u32 {
    static DISTRACTOR: OnceLock<u32> = OnceLock::new();
    *DISTRACTOR.get_or_init(rand::random::<u32>)
}

/// Bakes the listener cookie for a peer address: an MD5 digest over
/// `ip:port:minutes` plus a process-local distractor, so the cookie rolls
/// over every minute. `minute_offset` allows validating against the
/// previous minute on a first mismatch.
pub fn bake_cookie(peer: &SocketAddr, start: std::time::Instant, minute_offset: i64) -> i32 {
    let minutes = (start.elapsed().as_secs() / 60) as i64 + minute_offset;
    let text = format!(
        "{}:{}:{}",
        peer.ip(),
        peer.port(),
        minutes.wrapping_add(cookie_distractor() as i64)
    );
    let digest = Md5::digest(text.as_bytes());
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Outcome of the rendezvous cookie contest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsRole {
    Initiator,
    Responder,
}

/// Decides the rendezvous role from both cookies. Equal cookies cannot be
/// resolved and force the handshake to restart with fresh cookies.
pub fn cookie_contest(my: i32, peer: i32) -> Option<HsRole> {
    let better = (my as u32).wrapping_sub(peer as u32) as i32;
    match better {
        0 => None,
        b if b > 0 => Some(HsRole::Initiator),
        _ => Some(HsRole::Responder),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sample_hs(req_type: RequestType, ext: Vec<HsExt>) -> Handshake {
        Handshake {
            version: HS_VERSION,
            ext_field: ext_field::HSREQ | ext_field::CONFIG,
            enc_field: 2,
            isn: SeqNo::new(0x12345),
            mss: 1500,
            flow_window: 8192,
            req_type,
            id: SocketId(424242),
            cookie: -559038737,
            peer_ip: Handshake::encode_peer_ip(&"127.0.0.1:5200".parse().unwrap()),
            ext,
        }
    }

    #[test]
    fn fixed_block_round_trip_byte_exact() {
        let hs = sample_hs(RequestType::Induction, Vec::new());
        let mut writer = BytesMut::new();
        hs.encode(&mut writer);
        assert_eq!(writer.len(), Handshake::FIXED_SIZE);

        let first = writer.clone().freeze();
        let decoded = Handshake::decode(&mut first.clone()).unwrap();
        assert_eq!(decoded, hs);

        // Re-encoding must reproduce the same bytes.
        let mut writer2 = BytesMut::new();
        decoded.encode(&mut writer2);
        assert_eq!(writer.freeze(), writer2.freeze());
    }

    #[test]
    fn conclusion_with_extensions_round_trip() {
        let hsreq = HsReqExt {
            srt_version: SRT_VERSION,
            flags: hs_flags::TSBPDSND | hs_flags::TSBPDRCV | hs_flags::TLPKTDROP,
            snd_latency_ms: 0,
            rcv_latency_ms: 120,
        };
        let km = Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let hs = sample_hs(
            RequestType::Conclusion,
            vec![
                HsExt::HsReq(hsreq),
                HsExt::KmReq(km.clone()),
                HsExt::Sid("live/cam1".into()),
            ],
        );
        let mut writer = BytesMut::new();
        hs.encode(&mut writer);
        let encoded = writer.freeze();

        let decoded = Handshake::decode(&mut encoded.clone()).unwrap();
        assert_eq!(decoded.find_hsreq(), Some(&hsreq));
        assert_eq!(decoded.find_kmreq(), Some(&km));
        assert_eq!(decoded.find_sid(), Some("live/cam1"));

        let mut writer2 = BytesMut::new();
        decoded.encode(&mut writer2);
        assert_eq!(encoded, writer2.freeze());
    }

    #[test]
    fn sid_padding_is_stripped() {
        // "abc" pads to 4 bytes; the trailing NUL must not survive parsing.
        let hs = sample_hs(RequestType::Conclusion, vec![HsExt::Sid("abc".into())]);
        let mut writer = BytesMut::new();
        hs.encode(&mut writer);
        let decoded = Handshake::decode(&mut writer.freeze()).unwrap();
        assert_eq!(decoded.find_sid(), Some("abc"));
    }

    #[test]
    fn truncated_extension_is_an_error() {
        let hs = sample_hs(RequestType::Conclusion, Vec::new());
        let mut writer = BytesMut::new();
        hs.encode(&mut writer);
        // Claim a 3-word block but provide only one word.
        writer.put_u32(((ExtCmd::HsReq.code() as u32) << 16) | 3);
        writer.put_u32(0);
        assert!(matches!(
            Handshake::decode(&mut writer.freeze()),
            Err(CodecError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn request_type_codes() {
        assert_eq!(RequestType::from_code(0).unwrap(), RequestType::WaveAHand);
        assert_eq!(RequestType::from_code(-1).unwrap(), RequestType::Conclusion);
        assert_eq!(
            RequestType::from_code(1008).unwrap(),
            RequestType::Rejection(1008)
        );
        assert!(RequestType::from_code(42).is_err());
    }

    #[test]
    fn cookie_is_stable_within_a_minute_and_peer_specific() {
        let start = Instant::now();
        let a: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        assert_eq!(bake_cookie(&a, start, 0), bake_cookie(&a, start, 0));
        assert_ne!(bake_cookie(&a, start, 0), bake_cookie(&a, start, -1));
        assert_ne!(bake_cookie(&a, start, 0), bake_cookie(&b, start, 0));
    }

    #[test]
    fn cookie_contest_resolves_one_initiator() {
        assert_eq!(cookie_contest(5, 3), Some(HsRole::Initiator));
        assert_eq!(cookie_contest(3, 5), Some(HsRole::Responder));
        assert_eq!(cookie_contest(7, 7), None);
        // Wrapped distance keeps exactly one winner per pair.
        assert_eq!(cookie_contest(i32::MIN, i32::MAX), Some(HsRole::Initiator));
        assert_eq!(cookie_contest(i32::MAX, i32::MIN), Some(HsRole::Responder));
    }
}
