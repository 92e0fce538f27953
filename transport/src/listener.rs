use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::connection::Connection;

/// why a connection went away, as reported to [`TransportListener::on_closed`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    /// closed by this side's application code
    LocalClose,
    /// the remote sent a connection-level RESET
    PeerReset,
    /// a packet (or the handshake) exhausted its retransmission budget
    Timeout,
    /// no inbound traffic for twice the heartbeat interval
    Idle,
    /// the remote sent something that violates the protocol
    ProtocolViolation,
}

/// The upcall interface of an [`EndPoint`](crate::end_point::EndPoint): connection lifecycle
///  plus the per-stream byte flow. There is exactly one listener per endpoint; it is expected
///  to do its own demultiplexing by peer address.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportListener: Send + Sync + 'static {
    /// accept or reject an incoming dial before any state is allocated for it
    fn should_accept(&self, peer_addr: SocketAddr) -> bool;

    /// the handshake completed - the connection can send and receive streams from now on
    async fn on_established(&self, connection: Arc<Connection>);

    async fn on_closed(&self, peer_addr: SocketAddr, reason: CloseReason);

    /// ordered bytes of one stream, delivered gap-free in offset order
    async fn on_stream_bytes(&self, peer_addr: SocketAddr, stream_id: u16, chunk: Vec<u8>);

    /// the stream's final byte has been delivered
    async fn on_stream_end(&self, peer_addr: SocketAddr, stream_id: u16);

    /// the remote abandoned the stream; bytes delivered so far are all there will be
    async fn on_stream_reset(&self, peer_addr: SocketAddr, stream_id: u16);

    /// the remote rejected a stream this side was sending; its remaining bytes are discarded
    async fn on_stream_skipped(&self, peer_addr: SocketAddr, stream_id: u16);
}
