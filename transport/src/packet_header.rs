use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::packet_id::PacketId;

/// The fixed-size header at the start of every packet (inside the encryption envelope).
///
/// ```ascii
///  0         1         2         6         10        12        20        28
/// +---------+---------+---------+---------+---------+---------+---------+------+
/// |version=1| type    | src_cid | dst_cid | strm_id | pkt_no  | offset  | len  |
/// | 1B      | 1B      | 4B      | 4B      | 2B      | 8B      | 8B      | 2B   |
/// +---------+---------+---------+---------+---------+---------+---------+------+
/// ```
///
/// All numbers are in network byte order. The header has the same length for all packet kinds:
///  the small overhead for control packets buys us offset-independent parsing and keeps the
///  buffer pool free of per-kind special cases.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub packet_kind: PacketKind,
    pub src_conn_id: u32,
    pub dst_conn_id: u32,
    pub stream_id: u16,
    pub packet_number: PacketId,
    pub offset: u64,
    pub payload_len: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketKind {
    /// regular stream data; `fin` marks the last packet of its stream
    Data { fin: bool },
    /// acknowledges previously received data packets, listing their packet numbers in the payload
    Ack,
    /// first packet of the three-way handshake, sent by the initiator
    Dial,
    /// the responder's reply to `Dial`
    DialConf,
    /// the initiator's final handshake packet - both sides are active afterwards
    Conf,
    /// unilateral abort - of a single stream if `stream_id` is set, of the whole connection otherwise
    Reset,
}

impl PacketKind {
    fn discriminator(&self) -> u8 {
        match self {
            PacketKind::Data { fin: false } => 0,
            PacketKind::Data { fin: true } => 1,
            PacketKind::Ack => 2,
            PacketKind::Dial => 3,
            PacketKind::DialConf => 4,
            PacketKind::Conf => 5,
            PacketKind::Reset => 6,
        }
    }
}

impl PacketHeader {
    pub const PROTOCOL_VERSION_1: u8 = 1;
    pub const SERIALIZED_LEN: usize = 30;

    pub fn new(
        packet_kind: PacketKind,
        src_conn_id: u32,
        dst_conn_id: u32,
        stream_id: u16,
        packet_number: PacketId,
        offset: u64,
        payload_len: u16,
    ) -> PacketHeader {
        PacketHeader {
            packet_kind,
            src_conn_id,
            dst_conn_id,
            stream_id,
            packet_number,
            offset,
            payload_len,
        }
    }

    /// convenience factory for control packets, which leave the stream / sequencing fields at zero
    pub fn for_control(packet_kind: PacketKind, src_conn_id: u32, dst_conn_id: u32) -> PacketHeader {
        PacketHeader::new(packet_kind, src_conn_id, dst_conn_id, 0, PacketId::ZERO, 0, 0)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u8(self.packet_kind.discriminator());
        buf.put_u32(self.src_conn_id);
        buf.put_u32(self.dst_conn_id);
        buf.put_u16(self.stream_id);
        buf.put_u64(self.packet_number.to_raw());
        buf.put_u64(self.offset);
        buf.put_u16(self.payload_len);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let version = buf.try_get_u8()?;
        if version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", version);
        }

        let packet_kind = match buf.try_get_u8()? {
            0 => PacketKind::Data { fin: false },
            1 => PacketKind::Data { fin: true },
            2 => PacketKind::Ack,
            3 => PacketKind::Dial,
            4 => PacketKind::DialConf,
            5 => PacketKind::Conf,
            6 => PacketKind::Reset,
            n => bail!("invalid packet kind {}", n),
        };

        let src_conn_id = buf.try_get_u32()?;
        let dst_conn_id = buf.try_get_u32()?;
        let stream_id = buf.try_get_u16()?;
        let packet_number = PacketId::from_raw(buf.try_get_u64()?);
        let offset = buf.try_get_u64()?;
        let payload_len = buf.try_get_u16()?;

        Ok(PacketHeader {
            packet_kind,
            src_conn_id,
            dst_conn_id,
            stream_id,
            packet_number,
            offset,
            payload_len,
        })
    }
}
