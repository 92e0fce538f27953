//! Packet-level authenticated encryption. Every UDP datagram is sealed as a whole:
//!
//! ```ascii
//!  0: nonce (12 bytes, unencrypted)
//! 12: ciphertext of packet header + payload, followed by the 16-byte AES-GCM tag
//! ```
//!
//! This envelope adds 12 + 16 = 28 bytes to the packet. The nonce is a random per-endpoint
//!  fixed part plus a counter, so it is unique for every freshly sealed packet; retransmissions
//!  resend the stored ciphertext unchanged and do not consume a nonce.

use std::sync::atomic::{AtomicU64, Ordering};

use aead::{AeadInPlace, KeyInit, Nonce};
use aes_gcm::Aes256Gcm;
use bytes::BufMut;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::buffers::fixed_buffer::FixedBuf;

/// derive the public half of a node's x25519 static key, as exchanged in the handshake
pub fn derive_static_public_key(static_secret: &[u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(*static_secret);
    PublicKey::from(&secret).to_bytes()
}

pub trait PacketEncryption: Send + Sync + 'static {
    /// number of envelope bytes at the start of a packet, before the sealed region
    fn prefix_len(&self) -> usize;

    /// total number of bytes the envelope adds to a packet, i.e. prefix plus tag
    fn envelope_overhead(&self) -> usize;

    /// write a fresh envelope prefix into an empty buffer
    fn init_buffer(&self, buf: &mut FixedBuf);

    /// seal the buffer in place, leaving the prefix untouched
    fn seal(&self, buf: &mut FixedBuf);

    /// open a sealed buffer in place; the plaintext ends up at `prefix_len()..`
    fn open(&self, buf: &mut FixedBuf) -> aead::Result<()>;
}

pub struct NoEncryption;

impl PacketEncryption for NoEncryption {
    fn prefix_len(&self) -> usize {
        0
    }

    fn envelope_overhead(&self) -> usize {
        0
    }

    fn init_buffer(&self, _buf: &mut FixedBuf) {
        // nothing to be done
    }

    fn seal(&self, _buf: &mut FixedBuf) {
        // nothing to be done
    }

    fn open(&self, _buf: &mut FixedBuf) -> aead::Result<()> {
        // nothing to be done
        Ok(())
    }
}


pub struct Aes256GcmEncryption {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_counter: AtomicU64,
}

impl Aes256GcmEncryption {
    const NONCE_LEN: usize = 12;
    const TAG_LEN: usize = 16;

    pub fn new(key: &[u8]) -> Aes256GcmEncryption {
        let cipher = Aes256Gcm::new_from_slice(key)
            .expect("encryption key length should have been validated with the config");

        Aes256GcmEncryption {
            cipher,
            nonce_fixed: rand::thread_rng().next_u32(),
            nonce_counter: AtomicU64::new(0),
        }
    }

    fn nonce_of(buf: &FixedBuf) -> Nonce<Aes256Gcm> {
        *Nonce::<Aes256Gcm>::from_slice(&buf.as_ref()[..Self::NONCE_LEN])
    }
}

impl PacketEncryption for Aes256GcmEncryption {
    fn prefix_len(&self) -> usize {
        Self::NONCE_LEN
    }

    fn envelope_overhead(&self) -> usize {
        Self::NONCE_LEN + Self::TAG_LEN
    }

    fn init_buffer(&self, buf: &mut FixedBuf) {
        buf.put_u32(self.nonce_fixed);
        buf.put_u64(self.nonce_counter.fetch_add(1, Ordering::AcqRel));
    }

    fn seal(&self, buf: &mut FixedBuf) {
        let nonce = Self::nonce_of(buf);
        let mut sealed_region = buf.tail(Self::NONCE_LEN);
        self.cipher
            .encrypt_in_place(&nonce, b"", &mut sealed_region)
            .expect("buffer pool sizing should have left room for the tag");
    }

    fn open(&self, buf: &mut FixedBuf) -> aead::Result<()> {
        if buf.len() < Self::NONCE_LEN + Self::TAG_LEN {
            return Err(aead::Error);
        }
        let nonce = Self::nonce_of(buf);
        let mut sealed_region = buf.tail(Self::NONCE_LEN);
        self.cipher.decrypt_in_place(&nonce, b"", &mut sealed_region)
    }
}
