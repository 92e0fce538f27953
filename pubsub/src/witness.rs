//! The witness header records the forwarding path of a message: every relay appends its own
//!  32-byte static public key before forwarding, and no node forwards a message to a peer
//!  whose key already appears in it. That prunes forwarding loops without any coordination.
//!
//! Wire form of the key-chain witness: `count_of_bytes (u16 BE) ∥ pk_1 ∥ ... ∥ pk_n`.

use bytes::{BufMut, BytesMut};

use crate::wire::MessageHeader;

pub const PK_LEN: usize = 32;

/// Pluggable witness scheme; must be pure with respect to node state.
pub trait Witnesser: Send + Sync + 'static {
    /// size of the witness header this witnesser would produce when forwarding a message that
    ///  arrived with the given header
    fn witness_size(&self, prev: &MessageHeader) -> usize;

    /// append the witness header to `out`
    fn witness(&self, prev: &MessageHeader, out: &mut BytesMut);

    /// Length of the witness header at the start of `buf`, without consuming anything. The
    ///  caller advances its cursor explicitly.
    fn parse_size(&self, buf: &[u8]) -> anyhow::Result<usize>;
}

/// no witness trail at all (and no loop avoidance - for leaf deployments that never relay)
pub struct EmptyWitnesser;

impl Witnesser for EmptyWitnesser {
    fn witness_size(&self, _prev: &MessageHeader) -> usize {
        0
    }

    fn witness(&self, _prev: &MessageHeader, _out: &mut BytesMut) {
    }

    fn parse_size(&self, _buf: &[u8]) -> anyhow::Result<usize> {
        Ok(0)
    }
}

/// the key-chain witness: the previous trail plus this node's own static public key
pub struct KeyChainWitnesser {
    self_pk: [u8; PK_LEN],
}

impl KeyChainWitnesser {
    pub fn new(self_pk: [u8; PK_LEN]) -> KeyChainWitnesser {
        KeyChainWitnesser { self_pk }
    }
}

impl Witnesser for KeyChainWitnesser {
    fn witness_size(&self, prev: &MessageHeader) -> usize {
        2 + prev_keys(&prev.witness).len() + PK_LEN
    }

    fn witness(&self, prev: &MessageHeader, out: &mut BytesMut) {
        let prev_keys = prev_keys(&prev.witness);
        out.put_u16((prev_keys.len() + PK_LEN) as u16);
        out.put_slice(prev_keys);
        out.put_slice(&self.self_pk);
    }

    fn parse_size(&self, buf: &[u8]) -> anyhow::Result<usize> {
        if buf.len() < 2 {
            anyhow::bail!("witness header is truncated");
        }
        let key_bytes = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < 2 + key_bytes {
            anyhow::bail!("witness header declares {} key bytes but only {} are present", key_bytes, buf.len() - 2);
        }
        Ok(2 + key_bytes)
    }
}

/// the raw key bytes of a wire-form witness header, tolerating an empty header
fn prev_keys(witness: &[u8]) -> &[u8] {
    if witness.len() < 2 {
        return &[];
    }
    let key_bytes = u16::from_be_bytes([witness[0], witness[1]]) as usize;
    &witness[2..std::cmp::min(2 + key_bytes, witness.len())]
}

/// does the (wire-form) witness header contain the given public key as any 32-byte entry?
pub fn witness_contains(witness: &[u8], pk: &[u8; PK_LEN]) -> bool {
    prev_keys(witness)
        .chunks_exact(PK_LEN)
        .any(|chunk| chunk == pk)
}
