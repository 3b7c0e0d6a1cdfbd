// src/packet.rs
//! Wire codec for data and control packets.
//!
//! Every packet starts with the fixed 16-byte header (four 32-bit words in
//! network byte order). Bit 0 of the first word discriminates control (1)
//! from data (0); the remaining layout depends on that bit.

use crate::handshake::Handshake;
use crate::seq::{MsgNo, SeqNo};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the fixed packet header on the wire.
pub const HDR_SIZE: usize = 16;
/// IPv4 + UDP header overhead assumed when deriving payload size from MSS.
pub const UDP_HDR_SIZE: usize = 28;

const CONTROL_BIT: u32 = 0x8000_0000;

/// Errors raised while encoding or decoding wire structures.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unexpected end of packet: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("Invalid packet data: {0}")]
    InvalidData(String),
}

fn need(reader: &Bytes, n: usize) -> Result<(), CodecError> {
    if reader.remaining() < n {
        return Err(CodecError::UnexpectedEof {
            needed: n,
            remaining: reader.remaining(),
        });
    }
    Ok(())
}

/// Destination socket identifier carried in the fourth header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub u32);

impl SocketId {
    /// Target of connection-request packets before a socket id is known.
    pub const HANDSHAKE: SocketId = SocketId(0);

    pub fn random() -> Self {
        // Keep the top bit clear so ids stay printable as positive numbers.
        SocketId(rand::random::<u32>() & 0x7FFF_FFFF | 1)
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Position of a data packet within its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Middle = 0b00,
    Last = 0b01,
    First = 0b10,
    Solo = 0b11,
}

/// Which session key encrypted a data payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    Clear = 0b00,
    Even = 0b01,
    Odd = 0b10,
}

/// The message-number word of a data packet: `[FF:2][O:1][KK:2][R:1][msgno:26]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgFlags(u32);

impl MsgFlags {
    const BOUNDARY_SHIFT: u32 = 30;
    const ORDER_BIT: u32 = 1 << 29;
    const KEYSPEC_SHIFT: u32 = 27;
    const KEYSPEC_MASK: u32 = 0b11 << 27;
    const REXMIT_BIT: u32 = 1 << 26;
    const MSGNO_MASK: u32 = (1 << 26) - 1;

    pub fn new(msgno: MsgNo, boundary: Boundary, in_order: bool) -> Self {
        let mut w = msgno.raw() & Self::MSGNO_MASK;
        w |= (boundary as u32) << Self::BOUNDARY_SHIFT;
        if in_order {
            w |= Self::ORDER_BIT;
        }
        MsgFlags(w)
    }

    pub fn from_raw(raw: u32) -> Self {
        MsgFlags(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn msgno(self) -> MsgNo {
        MsgNo::new(self.0 & Self::MSGNO_MASK)
    }

    pub fn boundary(self) -> Boundary {
        match (self.0 >> Self::BOUNDARY_SHIFT) & 0b11 {
            0b00 => Boundary::Middle,
            0b01 => Boundary::Last,
            0b10 => Boundary::First,
            _ => Boundary::Solo,
        }
    }

    pub fn in_order(self) -> bool {
        self.0 & Self::ORDER_BIT != 0
    }

    pub fn key_spec(self) -> KeySpec {
        match (self.0 & Self::KEYSPEC_MASK) >> Self::KEYSPEC_SHIFT {
            0b01 => KeySpec::Even,
            0b10 => KeySpec::Odd,
            _ => KeySpec::Clear,
        }
    }

    /// Sets the encryption-key-spec bits. Must happen before the payload is
    /// encrypted and is preserved verbatim on retransmission.
    pub fn set_key_spec(&mut self, kk: KeySpec) {
        self.0 = (self.0 & !Self::KEYSPEC_MASK) | ((kk as u32) << Self::KEYSPEC_SHIFT);
    }

    pub fn rexmit(self) -> bool {
        self.0 & Self::REXMIT_BIT != 0
    }

    pub fn set_rexmit(&mut self, on: bool) {
        if on {
            self.0 |= Self::REXMIT_BIT;
        } else {
            self.0 &= !Self::REXMIT_BIT;
        }
    }
}

/// A data packet: sequence, message word, timestamp, destination and payload.
#[derive(Debug, Clone)]
pub struct DataPacket {
    pub seq: SeqNo,
    pub flags: MsgFlags,
    /// Microseconds since the sender's connection start, wrapping in 32 bits.
    pub timestamp: u32,
    pub dst: SocketId,
    pub payload: Bytes,
}

impl DataPacket {
    pub fn decode(reader: &mut Bytes) -> Result<Self, CodecError> {
        need(reader, HDR_SIZE)?;
        let w0 = reader.get_u32();
        if w0 & CONTROL_BIT != 0 {
            return Err(CodecError::InvalidData(
                "control bit set in data packet".into(),
            ));
        }
        let flags = MsgFlags::from_raw(reader.get_u32());
        let timestamp = reader.get_u32();
        let dst = SocketId(reader.get_u32());
        let payload = reader.copy_to_bytes(reader.remaining());
        Ok(Self {
            seq: SeqNo::new(w0),
            flags,
            timestamp,
            dst,
            payload,
        })
    }

    pub fn encode(&self, writer: &mut BytesMut) {
        writer.put_u32(self.seq.raw());
        writer.put_u32(self.flags.raw());
        writer.put_u32(self.timestamp);
        writer.put_u32(self.dst.0);
        writer.put_slice(&self.payload);
    }

    pub fn wire_size(&self) -> usize {
        HDR_SIZE + self.payload.len()
    }
}

/// A single entry of a `LOSSREPORT`: an inclusive sequence range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossRange {
    pub lo: SeqNo,
    pub hi: SeqNo,
}

impl LossRange {
    pub fn single(seq: SeqNo) -> Self {
        LossRange { lo: seq, hi: seq }
    }
}

/// Rate fields attached to an extended (once-per-RTT) full ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRates {
    /// Packet arrival speed in packets/sec.
    pub rcv_speed: u32,
    /// Estimated link capacity in packets/sec.
    pub bandwidth: u32,
    /// Byte delivery rate; bytes/sec from the version cutoff, packets/sec
    /// for older peers.
    pub rcv_rate: u32,
}

/// Payload of a full ACK. Lite ACKs carry only the acknowledged sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckInfo {
    pub last_ack: SeqNo,
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    pub avail_buf_pkts: u32,
    pub rates: Option<AckRates>,
}

/// Payload variants of an ACK control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckData {
    /// Four-byte ACK carrying only the last acknowledged sequence.
    Lite(SeqNo),
    Full(AckInfo),
}

impl AckData {
    pub fn last_ack(&self) -> SeqNo {
        match self {
            AckData::Lite(s) => *s,
            AckData::Full(info) => info.last_ack,
        }
    }
}

/// SRT-specific sub-commands carried in `EXT` control packets and in
/// handshake extension blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtCmd {
    HsReq,
    HsRsp,
    KmReq,
    KmRsp,
    Sid,
}

impl ExtCmd {
    pub fn code(self) -> u16 {
        match self {
            ExtCmd::HsReq => 1,
            ExtCmd::HsRsp => 2,
            ExtCmd::KmReq => 3,
            ExtCmd::KmRsp => 4,
            ExtCmd::Sid => 5,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => ExtCmd::HsReq,
            2 => ExtCmd::HsRsp,
            3 => ExtCmd::KmReq,
            4 => ExtCmd::KmRsp,
            5 => ExtCmd::Sid,
            _ => return None,
        })
    }
}

/// Body of a control packet, one variant per wire type.
#[derive(Debug, Clone)]
pub enum Control {
    Handshake(Handshake),
    KeepAlive,
    /// `ack_no` is the ACK sequence counter echoed back by `ACKACK`;
    /// zero for lite ACKs, which are never ACKACK'd.
    Ack {
        ack_no: u32,
        data: AckData,
    },
    Nak(Vec<LossRange>),
    CongestionWarning,
    Shutdown,
    AckAck {
        ack_no: u32,
    },
    /// Sender tells the receiver to give up on a message: `msgno` plus the
    /// inclusive sequence range it occupied.
    DropReq {
        msgno: MsgNo,
        range: LossRange,
    },
    PeerError(u32),
    /// SRT extension sub-protocol (KM exchange after the handshake).
    Ext {
        cmd: ExtCmd,
        data: Bytes,
    },
}

impl Control {
    fn type_code(&self) -> u16 {
        match self {
            Control::Handshake(_) => 0,
            Control::KeepAlive => 1,
            Control::Ack { .. } => 2,
            Control::Nak(_) => 3,
            Control::CongestionWarning => 4,
            Control::Shutdown => 5,
            Control::AckAck { .. } => 6,
            Control::DropReq { .. } => 7,
            Control::PeerError(_) => 8,
            Control::Ext { .. } => 0x7FFF,
        }
    }

    fn subtype(&self) -> u16 {
        match self {
            Control::Ext { cmd, .. } => cmd.code(),
            _ => 0,
        }
    }

    fn additional_info(&self) -> u32 {
        match self {
            Control::Ack { ack_no, .. } => *ack_no,
            Control::AckAck { ack_no } => *ack_no,
            Control::DropReq { msgno, .. } => msgno.raw(),
            Control::PeerError(code) => *code,
            _ => 0,
        }
    }
}

/// A control packet with its header context.
#[derive(Debug, Clone)]
pub struct ControlPacket {
    pub timestamp: u32,
    pub dst: SocketId,
    pub body: Control,
}

impl ControlPacket {
    pub fn decode(reader: &mut Bytes) -> Result<Self, CodecError> {
        need(reader, HDR_SIZE)?;
        let w0 = reader.get_u32();
        if w0 & CONTROL_BIT == 0 {
            return Err(CodecError::InvalidData(
                "data bit set in control packet".into(),
            ));
        }
        let type_code = ((w0 & !CONTROL_BIT) >> 16) as u16;
        let subtype = (w0 & 0xFFFF) as u16;
        let info = reader.get_u32();
        let timestamp = reader.get_u32();
        let dst = SocketId(reader.get_u32());

        let body = match type_code {
            0 => Control::Handshake(Handshake::decode(reader)?),
            1 => Control::KeepAlive,
            2 => {
                let data = match reader.remaining() {
                    0..=3 => {
                        return Err(CodecError::UnexpectedEof {
                            needed: 4,
                            remaining: reader.remaining(),
                        });
                    }
                    4..=15 => AckData::Lite(SeqNo::new(reader.get_u32())),
                    _ => {
                        let last_ack = SeqNo::new(reader.get_u32());
                        let rtt_us = reader.get_u32();
                        let rtt_var_us = reader.get_u32();
                        let avail_buf_pkts = reader.get_u32();
                        let rates = if reader.remaining() >= 12 {
                            Some(AckRates {
                                rcv_speed: reader.get_u32(),
                                bandwidth: reader.get_u32(),
                                rcv_rate: reader.get_u32(),
                            })
                        } else {
                            None
                        };
                        AckData::Full(AckInfo {
                            last_ack,
                            rtt_us,
                            rtt_var_us,
                            avail_buf_pkts,
                            rates,
                        })
                    }
                };
                Control::Ack { ack_no: info, data }
            }
            3 => {
                let mut entries = Vec::new();
                while reader.remaining() >= 4 {
                    let w = reader.get_u32();
                    if w & CONTROL_BIT != 0 {
                        need(reader, 4)?;
                        let hi = SeqNo::new(reader.get_u32());
                        let lo = SeqNo::new(w & !CONTROL_BIT);
                        if lo.cmp_seq(hi) > 0 {
                            return Err(CodecError::InvalidData(format!(
                                "loss range {} > {}",
                                lo.raw(),
                                hi.raw()
                            )));
                        }
                        entries.push(LossRange { lo, hi });
                    } else {
                        entries.push(LossRange::single(SeqNo::new(w)));
                    }
                }
                Control::Nak(entries)
            }
            4 => Control::CongestionWarning,
            5 => Control::Shutdown,
            6 => Control::AckAck { ack_no: info },
            7 => {
                need(reader, 8)?;
                let lo = SeqNo::new(reader.get_u32());
                let hi = SeqNo::new(reader.get_u32());
                Control::DropReq {
                    msgno: MsgNo::new(info),
                    range: LossRange { lo, hi },
                }
            }
            8 => Control::PeerError(info),
            0x7FFF => {
                let cmd = ExtCmd::from_code(subtype).ok_or_else(|| {
                    CodecError::InvalidData(format!("unknown extension sub-command {}", subtype))
                })?;
                Control::Ext {
                    cmd,
                    data: reader.copy_to_bytes(reader.remaining()),
                }
            }
            other => {
                return Err(CodecError::InvalidData(format!(
                    "unknown control type {:#x}",
                    other
                )));
            }
        };

        Ok(Self {
            timestamp,
            dst,
            body,
        })
    }

    pub fn encode(&self, writer: &mut BytesMut) {
        let w0 =
            CONTROL_BIT | ((self.body.type_code() as u32) << 16) | self.body.subtype() as u32;
        writer.put_u32(w0);
        writer.put_u32(self.body.additional_info());
        writer.put_u32(self.timestamp);
        writer.put_u32(self.dst.0);

        match &self.body {
            Control::Handshake(hs) => hs.encode(writer),
            Control::KeepAlive
            | Control::CongestionWarning
            | Control::Shutdown
            | Control::AckAck { .. }
            | Control::PeerError(_) => {}
            Control::Ack { data, .. } => match data {
                AckData::Lite(seq) => writer.put_u32(seq.raw()),
                AckData::Full(info) => {
                    writer.put_u32(info.last_ack.raw());
                    writer.put_u32(info.rtt_us);
                    writer.put_u32(info.rtt_var_us);
                    writer.put_u32(info.avail_buf_pkts);
                    if let Some(rates) = &info.rates {
                        writer.put_u32(rates.rcv_speed);
                        writer.put_u32(rates.bandwidth);
                        writer.put_u32(rates.rcv_rate);
                    }
                }
            },
            Control::Nak(entries) => {
                for e in entries {
                    if e.lo == e.hi {
                        writer.put_u32(e.lo.raw());
                    } else {
                        writer.put_u32(e.lo.raw() | CONTROL_BIT);
                        writer.put_u32(e.hi.raw());
                    }
                }
            }
            Control::DropReq { range, .. } => {
                writer.put_u32(range.lo.raw());
                writer.put_u32(range.hi.raw());
            }
            Control::Ext { data, .. } => writer.put_slice(data),
        }
    }
}

/// Any packet received from the wire.
#[derive(Debug, Clone)]
pub enum Packet {
    Data(DataPacket),
    Control(ControlPacket),
}

impl Packet {
    pub fn decode(mut reader: Bytes) -> Result<Self, CodecError> {
        need(&reader, HDR_SIZE)?;
        let first = reader.chunk()[0];
        if first & 0x80 != 0 {
            Ok(Packet::Control(ControlPacket::decode(&mut reader)?))
        } else {
            Ok(Packet::Data(DataPacket::decode(&mut reader)?))
        }
    }

    pub fn encode(&self, writer: &mut BytesMut) {
        match self {
            Packet::Data(p) => p.encode(writer),
            Packet::Control(p) => p.encode(writer),
        }
    }

    pub fn dst(&self) -> SocketId {
        match self {
            Packet::Data(p) => p.dst,
            Packet::Control(p) => p.dst,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut writer = BytesMut::new();
        self.encode(&mut writer);
        writer.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_flags_round_trip() {
        let mut flags = MsgFlags::new(MsgNo::new(12345), Boundary::First, true);
        flags.set_key_spec(KeySpec::Odd);
        flags.set_rexmit(true);
        assert_eq!(flags.msgno(), MsgNo::new(12345));
        assert_eq!(flags.boundary(), Boundary::First);
        assert!(flags.in_order());
        assert_eq!(flags.key_spec(), KeySpec::Odd);
        assert!(flags.rexmit());

        flags.set_key_spec(KeySpec::Clear);
        assert_eq!(flags.key_spec(), KeySpec::Clear);
        // Clearing the key spec must not disturb the rest of the word.
        assert_eq!(flags.msgno(), MsgNo::new(12345));
        assert!(flags.rexmit());
    }

    #[test]
    fn data_packet_round_trip() {
        let pkt = DataPacket {
            seq: SeqNo::new(0x7FFF_FFFF),
            flags: MsgFlags::new(MsgNo::new(7), Boundary::Solo, true),
            timestamp: 123_456,
            dst: SocketId(0x0BAD_CAFE),
            payload: Bytes::from_static(b"hello srt"),
        };
        let mut writer = BytesMut::new();
        pkt.encode(&mut writer);
        assert_eq!(writer.len(), HDR_SIZE + 9);
        // Top bit of word 0 must be clear for data.
        assert_eq!(writer[0] & 0x80, 0);

        let decoded = match Packet::decode(writer.freeze()).unwrap() {
            Packet::Data(d) => d,
            _ => panic!("expected data packet"),
        };
        assert_eq!(decoded.seq, pkt.seq);
        assert_eq!(decoded.flags, pkt.flags);
        assert_eq!(decoded.timestamp, pkt.timestamp);
        assert_eq!(decoded.dst, pkt.dst);
        assert_eq!(decoded.payload, pkt.payload);
    }

    fn round_trip_ctrl(body: Control) -> Control {
        let pkt = ControlPacket {
            timestamp: 42,
            dst: SocketId(99),
            body,
        };
        let mut writer = BytesMut::new();
        pkt.encode(&mut writer);
        assert_eq!(writer[0] & 0x80, 0x80);
        match Packet::decode(writer.freeze()).unwrap() {
            Packet::Control(c) => {
                assert_eq!(c.timestamp, 42);
                assert_eq!(c.dst, SocketId(99));
                c.body
            }
            _ => panic!("expected control packet"),
        }
    }

    #[test]
    fn ack_full_round_trip() {
        let body = Control::Ack {
            ack_no: 17,
            data: AckData::Full(AckInfo {
                last_ack: SeqNo::new(1000),
                rtt_us: 100_000,
                rtt_var_us: 50_000,
                avail_buf_pkts: 8192,
                rates: Some(AckRates {
                    rcv_speed: 1500,
                    bandwidth: 30_000,
                    rcv_rate: 2_000_000,
                }),
            }),
        };
        match round_trip_ctrl(body) {
            Control::Ack { ack_no, data } => {
                assert_eq!(ack_no, 17);
                match data {
                    AckData::Full(info) => {
                        assert_eq!(info.last_ack, SeqNo::new(1000));
                        assert_eq!(info.rates.unwrap().bandwidth, 30_000);
                    }
                    _ => panic!("expected full ack"),
                }
            }
            _ => panic!("expected ack"),
        }
    }

    #[test]
    fn ack_lite_round_trip() {
        let body = Control::Ack {
            ack_no: 0,
            data: AckData::Lite(SeqNo::new(555)),
        };
        match round_trip_ctrl(body) {
            Control::Ack { ack_no, data } => {
                assert_eq!(ack_no, 0);
                assert_eq!(data, AckData::Lite(SeqNo::new(555)));
            }
            _ => panic!("expected ack"),
        }
    }

    #[test]
    fn nak_round_trip_mixed_entries() {
        let body = Control::Nak(vec![
            LossRange::single(SeqNo::new(5)),
            LossRange {
                lo: SeqNo::new(10),
                hi: SeqNo::new(20),
            },
            LossRange::single(SeqNo::new(30)),
        ]);
        match round_trip_ctrl(body) {
            Control::Nak(entries) => {
                assert_eq!(entries.len(), 3);
                assert_eq!(entries[0], LossRange::single(SeqNo::new(5)));
                assert_eq!(
                    entries[1],
                    LossRange {
                        lo: SeqNo::new(10),
                        hi: SeqNo::new(20)
                    }
                );
            }
            _ => panic!("expected nak"),
        }
    }

    #[test]
    fn nak_rejects_inverted_range() {
        let mut writer = BytesMut::new();
        writer.put_u32(CONTROL_BIT | (3 << 16));
        writer.put_u32(0);
        writer.put_u32(0);
        writer.put_u32(1);
        writer.put_u32(20 | CONTROL_BIT);
        writer.put_u32(10);
        assert!(matches!(
            Packet::decode(writer.freeze()),
            Err(CodecError::InvalidData(_))
        ));
    }

    #[test]
    fn dropreq_round_trip() {
        let body = Control::DropReq {
            msgno: MsgNo::new(77),
            range: LossRange {
                lo: SeqNo::new(100),
                hi: SeqNo::new(110),
            },
        };
        match round_trip_ctrl(body) {
            Control::DropReq { msgno, range } => {
                assert_eq!(msgno, MsgNo::new(77));
                assert_eq!(range.lo, SeqNo::new(100));
                assert_eq!(range.hi, SeqNo::new(110));
            }
            _ => panic!("expected dropreq"),
        }
    }

    #[test]
    fn truncated_header_rejected() {
        let result = Packet::decode(Bytes::from_static(&[0x80, 0x00, 0x00]));
        assert!(matches!(result, Err(CodecError::UnexpectedEof { .. })));
    }
}
