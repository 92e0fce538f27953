//! End-to-end authentication of published messages. The attestation is an opaque,
//!  variable-length header between `(message_id, channel)` and the witness; relays carry it
//!  through unchanged so subscribers can verify the original publisher regardless of the path
//!  a message took.

use bytes::BytesMut;

use crate::wire::MessageHeader;

/// Pluggable attestation scheme. Implementations must be pure with respect to node state: they
///  are called synchronously inside message handling.
pub trait Attester: Send + Sync + 'static {
    /// size of the attestation header this attester would produce
    fn attestation_size(&self, message_id: u64, channel: u16, payload: &[u8], prev: &MessageHeader) -> usize;

    /// append the attestation header to `out`
    fn attest(&self, message_id: u64, channel: u16, payload: &[u8], prev: &MessageHeader, out: &mut BytesMut);

    /// Length of the attestation header at the start of `buf`, without consuming anything.
    ///  The caller advances its cursor explicitly.
    fn parse_size(&self, buf: &[u8]) -> anyhow::Result<usize>;

    fn verify(&self, message_id: u64, channel: u16, payload: &[u8], header: &[u8]) -> bool;
}

/// the default: no attestation bytes, everything verifies
pub struct EmptyAttester;

impl Attester for EmptyAttester {
    fn attestation_size(&self, _message_id: u64, _channel: u16, _payload: &[u8], _prev: &MessageHeader) -> usize {
        0
    }

    fn attest(&self, _message_id: u64, _channel: u16, _payload: &[u8], _prev: &MessageHeader, _out: &mut BytesMut) {
    }

    fn parse_size(&self, _buf: &[u8]) -> anyhow::Result<usize> {
        Ok(0)
    }

    fn verify(&self, _message_id: u64, _channel: u16, _payload: &[u8], _header: &[u8]) -> bool {
        true
    }
}
