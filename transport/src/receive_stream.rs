use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::listener::TransportListener;
use crate::safe_converter::SafeCast;

/// What the connection should do with a received data packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ReceiveDisposition {
    /// the packet is covered by the reassembly state (new or duplicate) - acknowledge it
    Ack,
    /// the packet does not fit into the receive window - drop silently, the sender will retry
    Drop,
    /// the packet contradicts earlier packets of its stream
    ProtocolViolation,
}

struct ReceiveStreamInner {
    /// the stream offset up to which bytes have been dispatched
    next_expected: u64,
    /// received but not yet dispatchable chunks, keyed by their stream offset
    pending: BTreeMap<u64, Vec<u8>>,
    pending_bytes: usize,
    /// the total stream length, learned from the FIN packet (which may arrive out of order)
    fin_offset: Option<u64>,
    finished: bool,
}

/// The receiving half of one stream: reassembles out-of-order packets into the contiguous byte
///  sequence, dispatching bytes upward in strict offset order. Senders packetize
///  deterministically, so a retransmitted packet always matches its original boundaries.
pub(crate) struct ReceiveStream {
    stream_id: u16,
    peer_addr: SocketAddr,
    config: Arc<TransportConfig>,
    listener: Arc<dyn TransportListener>,
    inner: RwLock<ReceiveStreamInner>,
}

impl ReceiveStream {
    pub fn new(
        config: Arc<TransportConfig>,
        listener: Arc<dyn TransportListener>,
        peer_addr: SocketAddr,
        stream_id: u16,
    ) -> ReceiveStream {
        ReceiveStream {
            stream_id,
            peer_addr,
            config,
            listener,
            inner: RwLock::new(ReceiveStreamInner {
                next_expected: 0,
                pending: BTreeMap::new(),
                pending_bytes: 0,
                fin_offset: None,
                finished: false,
            }),
        }
    }

    pub fn is_finished_sync(&self) -> bool {
        self.inner.try_read().map(|inner| inner.finished).unwrap_or(false)
    }

    pub async fn on_packet(&self, offset: u64, fin: bool, payload: &[u8]) -> ReceiveDisposition {
        let mut inner = self.inner.write().await;

        let Some(end_offset) = offset.checked_add(payload.len().safe_cast()) else {
            warn!("stream {} from {:?}: impossible offset {}", self.stream_id, self.peer_addr, offset);
            return ReceiveDisposition::ProtocolViolation;
        };

        if fin {
            match inner.fin_offset {
                None => inner.fin_offset = Some(end_offset),
                Some(prev) if prev == end_offset => {},
                Some(prev) => {
                    warn!("stream {} from {:?}: conflicting FIN offsets {} and {}",
                        self.stream_id, self.peer_addr, prev, end_offset);
                    return ReceiveDisposition::ProtocolViolation;
                }
            }
        }
        if let Some(fin_offset) = inner.fin_offset {
            if end_offset > fin_offset {
                warn!("stream {} from {:?}: data beyond the FIN offset {}", self.stream_id, self.peer_addr, fin_offset);
                return ReceiveDisposition::ProtocolViolation;
            }
        }

        if inner.finished || end_offset <= inner.next_expected || inner.pending.contains_key(&offset) {
            // a retransmission of something we already have - the earlier ACK was probably lost
            trace!("stream {} from {:?}: duplicate packet at offset {}", self.stream_id, self.peer_addr, offset);
            return ReceiveDisposition::Ack;
        }

        if offset >= inner.next_expected + self.config.receive_window_bytes.safe_cast()
            || inner.pending_bytes + payload.len() > self.config.receive_window_bytes
        {
            debug!("stream {} from {:?}: packet at offset {} outside the receive window - dropping",
                self.stream_id, self.peer_addr, offset);
            return ReceiveDisposition::Drop;
        }

        if !payload.is_empty() {
            inner.pending_bytes += payload.len();
            inner.pending.insert(offset, payload.to_vec());
        }

        self.dispatch(&mut inner).await;
        ReceiveDisposition::Ack
    }

    /// dispatch contiguous bytes upward, in offset order
    async fn dispatch(&self, inner: &mut ReceiveStreamInner) {
        while let Some(chunk) = inner.pending.remove(&inner.next_expected) {
            inner.pending_bytes -= chunk.len();
            inner.next_expected += chunk.len().safe_cast();
            self.listener.on_stream_bytes(self.peer_addr, self.stream_id, chunk).await;
        }

        if !inner.finished && inner.fin_offset == Some(inner.next_expected) && inner.pending.is_empty() {
            inner.finished = true;
            self.listener.on_stream_end(self.peer_addr, self.stream_id).await;
        }
    }

    /// Stop reassembling this stream because this side rejected it (skip). Packets still in
    ///  flight are acknowledged and discarded; no upcall fires since the rejection originated
    ///  above us.
    pub async fn mark_skipped(&self) {
        let mut inner = self.inner.write().await;
        inner.finished = true;
        inner.pending.clear();
        inner.pending_bytes = 0;
    }

    /// the remote abandoned the stream mid-transfer
    pub async fn on_reset(&self) {
        let mut inner = self.inner.write().await;
        if inner.finished {
            return;
        }
        inner.finished = true;
        inner.pending.clear();
        inner.pending_bytes = 0;

        self.listener.on_stream_reset(self.peer_addr, self.stream_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::MockTransportListener;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use rstest::rstest;

    const PEER: ([u8; 4], u16) = ([1, 2, 3, 4], 9);

    fn test_stream(listener: MockTransportListener, receive_window: usize) -> ReceiveStream {
        let mut config = TransportConfig::new(SocketAddr::from(([1, 2, 3, 4], 8)), None, [9; 32]);
        config.receive_window_bytes = receive_window;
        ReceiveStream::new(Arc::new(config), Arc::new(listener), SocketAddr::from(PEER), 5)
    }

    #[rstest]
    #[case::in_order(vec![(0, vec![1,2]), (2, vec![3,4])], vec![vec![1,2], vec![3,4]])]
    #[case::reordered(vec![(2, vec![3,4]), (0, vec![1,2])], vec![vec![1,2], vec![3,4]])]
    #[case::gap_then_fill(vec![(0, vec![1]), (3, vec![4,5]), (1, vec![2,3])], vec![vec![1], vec![2,3], vec![4,5]])]
    fn test_reassembly_dispatches_in_offset_order(
        #[case] packets: Vec<(u64, Vec<u8>)>,
        #[case] expected_chunks: Vec<Vec<u8>>,
    ) {
        let mut listener = MockTransportListener::new();
        let mut seq = Sequence::new();
        for chunk in expected_chunks {
            listener.expect_on_stream_bytes()
                .with(eq(SocketAddr::from(PEER)), eq(5u16), eq(chunk))
                .once()
                .in_sequence(&mut seq)
                .return_const(());
        }

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let stream = test_stream(listener, 1024);
            for (offset, payload) in packets {
                assert_eq!(stream.on_packet(offset, false, &payload).await, ReceiveDisposition::Ack);
            }
        });
    }

    #[rstest]
    #[case::already_dispatched(vec![(0, vec![1,2])], (0, vec![1,2]))]
    #[case::still_pending(vec![(5, vec![6,7])], (5, vec![6,7]))]
    fn test_duplicates_are_acked_but_not_redispatched(
        #[case] initial: Vec<(u64, Vec<u8>)>,
        #[case] duplicate: (u64, Vec<u8>),
    ) {
        let mut listener = MockTransportListener::new();
        listener.expect_on_stream_bytes()
            .times(0..=1)
            .return_const(());

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let stream = test_stream(listener, 1024);
            for (offset, payload) in initial {
                stream.on_packet(offset, false, &payload).await;
            }
            assert_eq!(stream.on_packet(duplicate.0, false, &duplicate.1).await, ReceiveDisposition::Ack);
        });
    }

    #[test]
    fn test_window_overflow_is_dropped_unacked() {
        let mut listener = MockTransportListener::new();
        listener.expect_on_stream_bytes()
            .return_const(());

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let stream = test_stream(listener, 8);

            // far beyond the window
            assert_eq!(stream.on_packet(100, false, &[1]).await, ReceiveDisposition::Drop);

            // fills the buffered-bytes budget
            assert_eq!(stream.on_packet(2, false, &[0; 6]).await, ReceiveDisposition::Ack);
            assert_eq!(stream.on_packet(1000, false, &[0; 4]).await, ReceiveDisposition::Drop);
        });
    }

    #[test]
    fn test_fin_completes_stream_once_contiguous() {
        let mut listener = MockTransportListener::new();
        let mut seq = Sequence::new();
        listener.expect_on_stream_bytes()
            .with(eq(SocketAddr::from(PEER)), eq(5u16), eq(vec![1u8, 2]))
            .once()
            .in_sequence(&mut seq)
            .return_const(());
        listener.expect_on_stream_bytes()
            .with(eq(SocketAddr::from(PEER)), eq(5u16), eq(vec![3u8]))
            .once()
            .in_sequence(&mut seq)
            .return_const(());
        listener.expect_on_stream_end()
            .with(eq(SocketAddr::from(PEER)), eq(5u16))
            .once()
            .in_sequence(&mut seq)
            .return_const(());

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let stream = test_stream(listener, 1024);

            // FIN arrives before the gap is filled
            assert_eq!(stream.on_packet(2, true, &[3]).await, ReceiveDisposition::Ack);
            assert!(!stream.is_finished_sync());

            assert_eq!(stream.on_packet(0, false, &[1, 2]).await, ReceiveDisposition::Ack);
            assert!(stream.is_finished_sync());
        });
    }

    #[test]
    fn test_empty_fin_packet() {
        let mut listener = MockTransportListener::new();
        listener.expect_on_stream_bytes()
            .once()
            .return_const(());
        listener.expect_on_stream_end()
            .once()
            .return_const(());

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let stream = test_stream(listener, 1024);
            stream.on_packet(0, false, &[1, 2, 3]).await;
            assert_eq!(stream.on_packet(3, true, &[]).await, ReceiveDisposition::Ack);
            assert!(stream.is_finished_sync());
        });
    }

    #[rstest]
    #[case::conflicting_fin(vec![(5, true, vec![1])], (9, true, vec![1]))]
    #[case::data_beyond_fin(vec![(0, true, vec![1,2])], (10, false, vec![3]))]
    #[case::offset_overflow(vec![], (u64::MAX, false, vec![1]))]
    fn test_protocol_violations(
        #[case] initial: Vec<(u64, bool, Vec<u8>)>,
        #[case] violation: (u64, bool, Vec<u8>),
    ) {
        let mut listener = MockTransportListener::new();
        listener.expect_on_stream_bytes()
            .return_const(());
        listener.expect_on_stream_end()
            .return_const(());

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let stream = test_stream(listener, 1024);
            for (offset, fin, payload) in initial {
                stream.on_packet(offset, fin, &payload).await;
            }
            assert_eq!(
                stream.on_packet(violation.0, violation.1, &violation.2).await,
                ReceiveDisposition::ProtocolViolation,
            );
        });
    }

    #[test]
    fn test_reset_fires_upcall_once() {
        let mut listener = MockTransportListener::new();
        listener.expect_on_stream_bytes()
            .return_const(());
        listener.expect_on_stream_reset()
            .with(eq(SocketAddr::from(PEER)), eq(5u16))
            .once()
            .return_const(());

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let stream = test_stream(listener, 1024);
            stream.on_packet(0, false, &[1]).await;
            stream.on_reset().await;
            stream.on_reset().await;
            assert!(stream.is_finished_sync());
        });
    }
}
