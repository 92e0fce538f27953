use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// Arena-style handle for a peer transport. The node keys all of its bookkeeping (slots,
///  cut-through sessions) on these ids rather than on the transport objects themselves, so
///  iteration stays valid while transports come and go.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TransportId(pub u32);

impl Display for TransportId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// What the node needs from a peering: framed sends, the cut-through surface, and identity.
///  Implemented by the stream-transport link; mocked in node tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    fn dst_addr(&self) -> SocketAddr;

    /// the peer's static public key, as exchanged during the transport handshake
    fn remote_static_pk(&self) -> [u8; 32];

    /// send one framed message, suspending on saturated windows
    async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()>;

    /// reserve an egress stream for a cut-through transfer; 0 means back-pressure forbids it
    async fn cut_through_send_start(&self, total_len: u64) -> u16;

    /// append transfer bytes; an error signals back-pressure overflow and the caller closes
    async fn cut_through_send_bytes(&self, stream_id: u16, chunk: &[u8]) -> anyhow::Result<()>;

    async fn cut_through_send_end(&self, stream_id: u16);

    /// abort a half-sent transfer so the remote can discard it
    async fn cut_through_send_flush(&self, stream_id: u16);

    /// tell the remote to stop sending a cut-through stream whose prefix was rejected
    async fn cut_through_send_skip(&self, stream_id: u16);

    /// asynchronous close; the node learns about completion through its closed-callback
    fn close(&self);
}

/// Dialing capability the node delegates to the transport layer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, addr: SocketAddr, remote_static_pk: [u8; 32]) -> anyhow::Result<()>;
}
