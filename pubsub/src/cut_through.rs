//! Session state of the cut-through router: which ingress stream feeds which egress streams,
//!  plus parsing and rewriting of the in-flight MESSAGE header.
//!
//! A cut-through MESSAGE frame starts with `type(1) ∥ message_id(8) ∥ channel(2) ∥
//!  witness_length(2) ∥ witness_keys`; the router rewrites that prefix on the way through,
//!  appending this node's static public key to the witness trail. The attestation slot is
//!  empty on the cut-through path - large transfers rely on the witness chain alone.

use anyhow::bail;
use rustc_hash::FxHashMap;

use crate::peer::TransportId;
use crate::wire::TYPE_MESSAGE;
use crate::witness::PK_LEN;

/// fixed part of the transfer header: type + message id + channel + witness length
pub const TRANSFER_HEADER_FIXED_LEN: usize = 13;

#[derive(Debug, Eq, PartialEq)]
pub struct ParsedTransferHeader {
    pub message_id: u64,
    pub channel: u16,
    /// the raw key bytes of the witness trail, without their u16 length prefix
    pub witness_keys: Vec<u8>,
}

impl ParsedTransferHeader {
    pub fn header_len(&self) -> usize {
        TRANSFER_HEADER_FIXED_LEN + self.witness_keys.len()
    }

    pub fn witness_contains(&self, pk: &[u8; PK_LEN]) -> bool {
        self.witness_keys.chunks_exact(PK_LEN).any(|chunk| chunk == pk)
    }

    /// the header as forwarded downstream: same message, witness extended by `self_pk`
    pub fn rewrite_with_appended_key(&self, self_pk: &[u8; PK_LEN]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len() + PK_LEN);
        out.push(TYPE_MESSAGE);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.channel.to_be_bytes());
        out.extend_from_slice(&((self.witness_keys.len() + PK_LEN) as u16).to_be_bytes());
        out.extend_from_slice(&self.witness_keys);
        out.extend_from_slice(self_pk);
        out
    }
}

/// Parse the leading transfer header out of the first received chunk. The sender puts the
///  whole header into the first packet, so a chunk too short to hold it is a protocol error,
///  not a retry condition.
pub fn parse_transfer_header(chunk: &[u8]) -> anyhow::Result<ParsedTransferHeader> {
    if chunk.len() < TRANSFER_HEADER_FIXED_LEN {
        bail!("not enough header: {} bytes", chunk.len());
    }
    if chunk[0] != TYPE_MESSAGE {
        bail!("cut-through transfer of a non-MESSAGE frame (type {})", chunk[0]);
    }

    let message_id = u64::from_be_bytes(chunk[1..9].try_into().unwrap());
    let channel = u16::from_be_bytes([chunk[9], chunk[10]]);
    let witness_len = u16::from_be_bytes([chunk[11], chunk[12]]) as usize;

    if chunk.len() < TRANSFER_HEADER_FIXED_LEN + witness_len {
        bail!("not enough header: {} bytes, witness length {}", chunk.len(), witness_len);
    }

    Ok(ParsedTransferHeader {
        message_id,
        channel,
        witness_keys: chunk[TRANSFER_HEADER_FIXED_LEN..TRANSFER_HEADER_FIXED_LEN + witness_len].to_vec(),
    })
}


pub struct Session {
    pub subscribers: Vec<(TransportId, u16)>,
    pub total_len: u64,
    pub header_parsed: bool,
    /// header fields, valid once `header_parsed`
    pub message_id: u64,
    pub channel: u16,
    /// the witness trail as it arrived (without this node's key), wire form
    pub witness: Vec<u8>,
    /// The payload assembled for local delivery. Egress peers are fed without buffering; this
    ///  copy exists only so the local delegate sees the message too, exactly once.
    pub assembled: Vec<u8>,
}

/// All in-flight cut-through sessions, keyed by `(ingress transport, ingress stream)`.
#[derive(Default)]
pub struct CutThroughRouter {
    sessions: FxHashMap<(TransportId, u16), Session>,
}

impl CutThroughRouter {
    pub fn start(&mut self, ingress: TransportId, stream_id: u16, total_len: u64) {
        self.sessions.insert((ingress, stream_id), Session {
            subscribers: Vec::new(),
            total_len,
            header_parsed: false,
            message_id: 0,
            channel: 0,
            witness: Vec::new(),
            assembled: Vec::new(),
        });
    }

    pub fn get_mut(&mut self, ingress: TransportId, stream_id: u16) -> Option<&mut Session> {
        self.sessions.get_mut(&(ingress, stream_id))
    }

    pub fn remove(&mut self, ingress: TransportId, stream_id: u16) -> Option<Session> {
        self.sessions.remove(&(ingress, stream_id))
    }

    /// tear out all sessions fed by a transport (it closed); returns them for flushing
    pub fn drain_ingress(&mut self, ingress: TransportId) -> Vec<Session> {
        let keys: Vec<_> = self.sessions.keys()
            .filter(|(t, _)| *t == ingress)
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.sessions.remove(&key))
            .collect()
    }

    /// remove a transport from every session's subscriber list (it closed)
    pub fn remove_subscriber(&mut self, egress: TransportId) {
        for session in self.sessions.values_mut() {
            session.subscribers.retain(|(t, _)| *t != egress);
        }
    }

    /// remove one egress stream from every subscriber list (the remote skipped it)
    pub fn remove_subscriber_stream(&mut self, egress: TransportId, stream_id: u16) {
        for session in self.sessions.values_mut() {
            session.subscribers.retain(|entry| *entry != (egress, stream_id));
        }
    }
}
