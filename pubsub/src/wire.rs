//! Wire formats of the pub/sub protocol. Every frame starts with a one-byte type:
//!
//! ```ascii
//! SUBSCRIBE:   0x00 ∥ channel(2)
//! UNSUBSCRIBE: 0x01 ∥ channel(2)
//! RESPONSE:    0x02 ∥ success(1) ∥ utf8_message
//! MESSAGE:     0x03 ∥ message_id(8) ∥ channel(2) ∥ attestation ∥ witness ∥ payload
//! HEARTBEAT:   0x04
//! ```
//!
//! All integers are big-endian. The attestation and witness sections are opaque here; their
//!  lengths are determined by the configured attester and witnesser.

use anyhow::bail;
use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::attestation::Attester;
use crate::witness::Witnesser;

pub const TYPE_SUBSCRIBE: u8 = 0x00;
pub const TYPE_UNSUBSCRIBE: u8 = 0x01;
pub const TYPE_RESPONSE: u8 = 0x02;
pub const TYPE_MESSAGE: u8 = 0x03;
pub const TYPE_HEARTBEAT: u8 = 0x04;

/// response strings matched (by prefix) on the receiving side; trailing bytes are opaque
pub const RESPONSE_SUBSCRIBED: &[u8] = b"SUBSCRIBED";
pub const RESPONSE_UNSUBSCRIBED: &[u8] = b"UNSUBSCRIBED";

/// The opaque per-message headers as carried between hops. A relay passes the incoming header
///  to its witnesser so the forwarded copy extends the existing trail.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MessageHeader {
    pub attestation: Vec<u8>,
    pub witness: Vec<u8>,
}

/// all frame types except MESSAGE, which needs the attester/witnesser for parsing
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ControlFrame {
    Subscribe { channel: u16 },
    Unsubscribe { channel: u16 },
    Response { success: bool, message: Vec<u8> },
    Heartbeat,
}

impl ControlFrame {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            ControlFrame::Subscribe { channel } => {
                buf.put_u8(TYPE_SUBSCRIBE);
                buf.put_u16(*channel);
            }
            ControlFrame::Unsubscribe { channel } => {
                buf.put_u8(TYPE_UNSUBSCRIBE);
                buf.put_u16(*channel);
            }
            ControlFrame::Response { success, message } => {
                buf.put_u8(TYPE_RESPONSE);
                buf.put_u8(u8::from(*success));
                buf.put_slice(message);
            }
            ControlFrame::Heartbeat => {
                buf.put_u8(TYPE_HEARTBEAT);
            }
        }
    }

    /// parse a full frame (including the type byte); MESSAGE frames are not control frames
    pub fn deser(frame: &[u8]) -> anyhow::Result<ControlFrame> {
        let Some((&frame_type, mut body)) = frame.split_first() else {
            bail!("empty frame");
        };

        match frame_type {
            TYPE_SUBSCRIBE => Ok(ControlFrame::Subscribe { channel: body.try_get_u16()? }),
            TYPE_UNSUBSCRIBE => Ok(ControlFrame::Unsubscribe { channel: body.try_get_u16()? }),
            TYPE_RESPONSE => {
                let success = body.try_get_u8()? != 0;
                Ok(ControlFrame::Response { success, message: body.to_vec() })
            }
            TYPE_HEARTBEAT => Ok(ControlFrame::Heartbeat),
            n => bail!("not a control frame type: {}", n),
        }
    }
}

/// a parsed MESSAGE frame, borrowing from the frame buffer
#[derive(Debug, Eq, PartialEq)]
pub struct MessageFrame<'a> {
    pub message_id: u64,
    pub channel: u16,
    pub attestation: &'a [u8],
    pub witness: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> MessageFrame<'a> {
    /// parse the body of a MESSAGE frame (everything after the type byte)
    pub fn parse(
        body: &'a [u8],
        attester: &dyn Attester,
        witnesser: &dyn Witnesser,
    ) -> anyhow::Result<MessageFrame<'a>> {
        let mut cursor = body;
        let message_id = cursor.try_get_u64()?;
        let channel = cursor.try_get_u16()?;

        let attestation_size = attester.parse_size(cursor)?;
        if cursor.len() < attestation_size {
            bail!("attestation extends past the frame");
        }
        let attestation = &cursor[..attestation_size];
        cursor = &cursor[attestation_size..];

        let witness_size = witnesser.parse_size(cursor)?;
        if cursor.len() < witness_size {
            bail!("witness extends past the frame");
        }
        let witness = &cursor[..witness_size];
        cursor = &cursor[witness_size..];

        Ok(MessageFrame {
            message_id,
            channel,
            attestation,
            witness,
            payload: cursor,
        })
    }

    /// the opaque headers as an owned value, for handing to relays and the delegate
    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            attestation: self.attestation.to_vec(),
            witness: self.witness.to_vec(),
        }
    }
}

/// assemble a full MESSAGE frame, running the attester and witnesser over the previous header
pub fn build_message(
    channel: u16,
    message_id: u64,
    payload: &[u8],
    prev_header: &MessageHeader,
    attester: &dyn Attester,
    witnesser: &dyn Witnesser,
) -> BytesMut {
    let header_size = 11
        + attester.attestation_size(message_id, channel, payload, prev_header)
        + witnesser.witness_size(prev_header);

    let mut frame = BytesMut::with_capacity(header_size + payload.len());
    frame.put_u8(TYPE_MESSAGE);
    frame.put_u64(message_id);
    frame.put_u16(channel);
    attester.attest(message_id, channel, payload, prev_header, &mut frame);
    witnesser.witness(prev_header, &mut frame);
    frame.put_slice(payload);
    frame
}
