//! Glue between the stream transport and the node: frames outgoing messages with a length
//!  prefix, runs incoming stream bytes through the framing decoder, and switches a stream into
//!  cut-through delivery when a frame's declared length exceeds the configured threshold.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use transport::connection::Connection;
use transport::end_point::EndPoint;
use transport::listener::{CloseReason, TransportListener};

use crate::framing::{FrameSink, LengthFramer};
use crate::node::PubSubNode;
use crate::peer::{Dialer, PeerTransport};

fn put_length_prefix(buf: &mut BytesMut, prefix_len: u8, frame_len: u64) {
    let be = frame_len.to_be_bytes();
    buf.put_slice(&be[8 - prefix_len as usize..]);
}

/// One peering as the node sees it: framed sends and the cut-through surface, on top of a
///  transport connection.
pub struct StreamLink {
    connection: Arc<Connection>,
    remote_pk: [u8; 32],
    prefix_len: u8,
}

impl StreamLink {
    pub fn new(connection: Arc<Connection>, remote_pk: [u8; 32], prefix_len: u8) -> StreamLink {
        StreamLink { connection, remote_pk, prefix_len }
    }
}

#[async_trait]
impl PeerTransport for StreamLink {
    fn dst_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    fn remote_static_pk(&self) -> [u8; 32] {
        self.remote_pk
    }

    async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(self.prefix_len as usize + frame.len());
        put_length_prefix(&mut buf, self.prefix_len, frame.len() as u64);
        buf.put_slice(frame);
        self.connection.send_frame_bytes(&buf).await
    }

    async fn cut_through_send_start(&self, total_len: u64) -> u16 {
        // the stream carries the length prefix in addition to the frame itself
        let stream_id = self.connection.cut_through_send_start(total_len + self.prefix_len as u64).await;
        if stream_id == 0 {
            return 0;
        }

        let mut prefix = BytesMut::with_capacity(self.prefix_len as usize);
        put_length_prefix(&mut prefix, self.prefix_len, total_len);
        if self.connection.cut_through_send_bytes(stream_id, &prefix).await.is_err() {
            self.connection.cut_through_send_flush(stream_id).await;
            return 0;
        }
        stream_id
    }

    async fn cut_through_send_bytes(&self, stream_id: u16, chunk: &[u8]) -> anyhow::Result<()> {
        self.connection.cut_through_send_bytes(stream_id, chunk).await
    }

    async fn cut_through_send_end(&self, stream_id: u16) {
        self.connection.cut_through_send_end(stream_id).await
    }

    async fn cut_through_send_flush(&self, stream_id: u16) {
        self.connection.cut_through_send_flush(stream_id).await
    }

    async fn cut_through_send_skip(&self, stream_id: u16) {
        self.connection.cut_through_send_skip(stream_id).await
    }

    fn close(&self) {
        self.connection.request_close(CloseReason::LocalClose);
    }
}


enum RecvMode {
    /// between frames, or a small frame being assembled
    Assembling { frame: Vec<u8> },
    /// the current frame is being piped through the cut-through router
    CutThrough,
}

struct RecvStream {
    framer: LengthFramer,
    mode: RecvMode,
}

enum FrameEvent {
    Start(u64),
    Bytes(Vec<u8>),
    Complete,
}

/// collects the framing decoder's synchronous upcalls so they can be processed async
#[derive(Default)]
struct EventSink {
    events: Vec<FrameEvent>,
}

impl FrameSink for EventSink {
    fn on_frame_start(&mut self, frame_len: u64, _peer_addr: SocketAddr) {
        self.events.push(FrameEvent::Start(frame_len));
    }

    fn on_recv_bytes(&mut self, chunk: &[u8], _bytes_remaining: u64, _peer_addr: SocketAddr) {
        self.events.push(FrameEvent::Bytes(chunk.to_vec()));
    }

    fn on_recv_frame(&mut self, _peer_addr: SocketAddr) -> u64 {
        self.events.push(FrameEvent::Complete);
        0 // the next frame always starts with a fresh length prefix
    }
}


/// The endpoint's listener: tracks per-stream receive state and feeds the node.
pub struct LinkLayer {
    prefix_len: u8,
    node: OnceLock<Arc<PubSubNode>>,
    endpoint: OnceLock<Arc<EndPoint>>,
    recv_streams: Mutex<FxHashMap<(SocketAddr, u16), RecvStream>>,
}

impl LinkLayer {
    pub fn new(prefix_len: u8) -> Arc<LinkLayer> {
        assert!(matches!(prefix_len, 1 | 2 | 4 | 8));
        Arc::new(LinkLayer {
            prefix_len,
            node: OnceLock::new(),
            endpoint: OnceLock::new(),
            recv_streams: Mutex::new(FxHashMap::default()),
        })
    }

    /// wire in the node and endpoint (once, during composition)
    pub fn wire(&self, node: Arc<PubSubNode>, endpoint: Arc<EndPoint>) {
        let _ = self.node.set(node);
        let _ = self.endpoint.set(endpoint);
    }

    fn node(&self) -> &Arc<PubSubNode> {
        self.node.get().expect("link layer is not wired to a node")
    }

    async fn close_transport(&self, peer_addr: SocketAddr) {
        if let Some(endpoint) = self.endpoint.get() {
            if let Some(conn) = endpoint.get_connection(peer_addr).await {
                conn.request_close(CloseReason::ProtocolViolation);
            }
        }
    }
}

#[async_trait]
impl TransportListener for LinkLayer {
    fn should_accept(&self, peer_addr: SocketAddr) -> bool {
        match self.node.get() {
            Some(node) => node.should_accept(peer_addr),
            None => false,
        }
    }

    async fn on_established(&self, connection: Arc<Connection>) {
        let Some(remote_pk) = connection.remote_static_pk().await else {
            return;
        };
        let outbound = connection.is_dialer();
        let link = Arc::new(StreamLink::new(connection, remote_pk, self.prefix_len));
        self.node().on_transport_open(link, outbound).await;
    }

    async fn on_closed(&self, peer_addr: SocketAddr, reason: CloseReason) {
        debug!("transport to {:?} closed: {:?}", peer_addr, reason);
        self.recv_streams.lock().await.retain(|(addr, _), _| *addr != peer_addr);
        self.node().on_transport_closed(peer_addr).await;
    }

    async fn on_stream_bytes(&self, peer_addr: SocketAddr, stream_id: u16, chunk: Vec<u8>) {
        let mut streams = self.recv_streams.lock().await;
        let state = streams.entry((peer_addr, stream_id)).or_insert_with(|| RecvStream {
            framer: LengthFramer::new(self.prefix_len),
            mode: RecvMode::Assembling { frame: Vec::new() },
        });

        let mut sink = EventSink::default();
        state.framer.feed(&chunk, peer_addr, &mut sink);

        for event in sink.events {
            match event {
                FrameEvent::Start(frame_len) => {
                    if frame_len > self.node().cut_through_threshold() {
                        state.mode = RecvMode::CutThrough;
                        self.node().cut_through_recv_start(peer_addr, stream_id, frame_len).await;
                    }
                    else {
                        state.mode = RecvMode::Assembling { frame: Vec::with_capacity(frame_len as usize) };
                    }
                }
                FrameEvent::Bytes(bytes) => {
                    match &mut state.mode {
                        RecvMode::Assembling { frame } => frame.extend_from_slice(&bytes),
                        RecvMode::CutThrough => {
                            if let Err(e) = self.node().cut_through_recv_bytes(peer_addr, stream_id, &bytes).await {
                                warn!("cut-through transfer from {:?} is broken: {} - closing", peer_addr, e);
                                self.close_transport(peer_addr).await;
                                return;
                            }
                        }
                    }
                }
                FrameEvent::Complete => {
                    match std::mem::replace(&mut state.mode, RecvMode::Assembling { frame: Vec::new() }) {
                        RecvMode::Assembling { frame } => self.node().on_frame(peer_addr, &frame).await,
                        RecvMode::CutThrough => self.node().cut_through_recv_end(peer_addr, stream_id).await,
                    }
                }
            }
        }
    }

    async fn on_stream_end(&self, peer_addr: SocketAddr, stream_id: u16) {
        let state = self.recv_streams.lock().await.remove(&(peer_addr, stream_id));
        let Some(state) = state else {
            return;
        };

        // a stream ending mid-frame leaves the frame unfinishable
        if state.framer.bytes_remaining() > 0 {
            warn!("stream {} from {:?} ended mid-frame", stream_id, peer_addr);
            if matches!(state.mode, RecvMode::CutThrough) {
                self.node().cut_through_recv_flush(peer_addr, stream_id).await;
            }
        }
    }

    async fn on_stream_reset(&self, peer_addr: SocketAddr, stream_id: u16) {
        let state = self.recv_streams.lock().await.remove(&(peer_addr, stream_id));
        if let Some(state) = state {
            if matches!(state.mode, RecvMode::CutThrough) {
                self.node().cut_through_recv_flush(peer_addr, stream_id).await;
            }
        }
    }

    async fn on_stream_skipped(&self, peer_addr: SocketAddr, stream_id: u16) {
        self.node().cut_through_send_skipped(peer_addr, stream_id).await;
    }
}

#[async_trait]
impl Dialer for LinkLayer {
    async fn dial(&self, addr: SocketAddr, remote_static_pk: [u8; 32]) -> anyhow::Result<()> {
        let Some(endpoint) = self.endpoint.get() else {
            anyhow::bail!("link layer is not wired to an endpoint");
        };
        endpoint.dial(addr, remote_static_pk).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_length_prefix() {
        let mut buf = BytesMut::new();
        put_length_prefix(&mut buf, 8, 0x0102);
        assert_eq!(buf.as_ref(), &[0, 0, 0, 0, 0, 0, 1, 2]);

        let mut buf = BytesMut::new();
        put_length_prefix(&mut buf, 2, 300);
        assert_eq!(buf.as_ref(), &[1, 44]);

        let mut buf = BytesMut::new();
        put_length_prefix(&mut buf, 1, 7);
        assert_eq!(buf.as_ref(), &[7]);
    }
}
