use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::bail;
use bytes::BufMut;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::buffers::buffer_pool::SendBufferPool;
use crate::buffers::fixed_buffer::FixedBuf;
use crate::config::TransportConfig;
use crate::congestion::CongestionGate;
use crate::listener::CloseReason;
use crate::packet_header::{PacketHeader, PacketKind};
use crate::packet_id::PacketId;
use crate::rto::RetransmitBackoff;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::send_pipeline::SendPipeline;

/// The per-connection environment a stream operates in. Streams are created only once a
///  connection is active, so the remote conn id is known.
pub(crate) struct StreamCtx {
    pub config: Arc<TransportConfig>,
    pub pipeline: Arc<SendPipeline>,
    pub pool: Arc<SendBufferPool>,
    pub gate: Arc<CongestionGate>,
    pub peer_addr: SocketAddr,
    pub local_conn_id: u32,
    pub remote_conn_id: u32,
    /// packet numbers are monotonic per connection, across all of its streams
    pub next_packet_number: AtomicU64,
    pub close_tx: mpsc::UnboundedSender<CloseReason>,
}

impl StreamCtx {
    fn next_packet_number(&self) -> PacketId {
        PacketId::from_raw(self.next_packet_number.fetch_add(1, Ordering::AcqRel))
    }

    fn max_payload_per_packet(&self) -> usize {
        self.config.max_payload_per_packet(self.pool.envelope_overhead())
    }
}

/// a packetized chunk waiting for window capacity (cut-through backlog)
struct QueuedPacket {
    packet_number: PacketId,
    buf: FixedBuf,
    payload_len: usize,
}

/// a transmitted packet retained (sealed) for retransmission until acknowledged
struct SentPacket {
    buf: FixedBuf,
    sent_at: Instant,
    payload_len: usize,
}

struct SendStreamInner {
    next_offset: u64,
    queued: VecDeque<QueuedPacket>,
    queued_bytes: usize,
    unacked: BTreeMap<PacketId, SentPacket>,
    backoff: RetransmitBackoff,
    /// total transfer length announced by a cut-through sender; `None` for ordinary streams
    declared_total: Option<u64>,
    fin_packetized: bool,
    closed: bool,
}

/// The sending half of one stream: packetizes outgoing bytes, enforces the send window and the
///  connection's congestion window, retains packets until they are acknowledged, and
///  retransmits on RTO expiry. Retransmission exhaustion escalates to a connection close.
pub struct SendStream {
    ctx: Arc<StreamCtx>,
    stream_id: u16,
    inner: Arc<RwLock<SendStreamInner>>,
    /// serializes producers so packets of one stream leave in offset order
    send_lock: Mutex<()>,
    window_notify: Arc<Notify>,
    retransmit_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SendStream {
    pub(crate) fn new(ctx: Arc<StreamCtx>, stream_id: u16, declared_total: Option<u64>) -> Arc<SendStream> {
        let inner = SendStreamInner {
            next_offset: 0,
            queued: VecDeque::new(),
            queued_bytes: 0,
            unacked: BTreeMap::new(),
            backoff: RetransmitBackoff::new(ctx.config.initial_rto, ctx.config.max_rto),
            declared_total,
            fin_packetized: false,
            closed: false,
        };

        let stream = Arc::new(SendStream {
            ctx,
            stream_id,
            inner: Arc::new(RwLock::new(inner)),
            send_lock: Mutex::new(()),
            window_notify: Arc::new(Notify::new()),
            retransmit_task: std::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(stream.clone().retransmit_loop());
        *stream.retransmit_task.lock().unwrap() = Some(handle);

        stream
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    fn build_packet(&self, packet_number: PacketId, offset: u64, payload: &[u8], fin: bool) -> FixedBuf {
        let mut buf = self.ctx.pool.get_from_pool();
        PacketHeader::new(
            PacketKind::Data { fin },
            self.ctx.local_conn_id,
            self.ctx.remote_conn_id,
            self.stream_id,
            packet_number,
            offset,
            payload.len().prechecked_cast(),
        ).ser(&mut buf);
        buf.put_slice(payload);
        buf
    }

    /// Send bytes reliably and in order, cooperatively yielding while the send window or the
    ///  connection's congestion window is saturated.
    pub async fn send(&self, mut data: &[u8]) -> anyhow::Result<()> {
        let _send_permit = self.send_lock.lock().await;
        let max_payload = self.ctx.max_payload_per_packet();

        while !data.is_empty() {
            self.wait_for_send_window().await?;
            self.ctx.gate.acquire().await;

            let slice_len = std::cmp::min(max_payload, data.len());
            let packet_number = self.ctx.next_packet_number();

            let mut inner = self.inner.write().await;
            if inner.closed {
                self.ctx.gate.release(1);
                bail!("stream {} is closed", self.stream_id);
            }

            let offset = inner.next_offset;
            inner.next_offset += slice_len.safe_cast();

            let mut buf = self.build_packet(packet_number, offset, &data[..slice_len], false);
            data = &data[slice_len..];

            trace!("sending packet {} on stream {} at offset {}", packet_number, self.stream_id, offset);
            self.ctx.pipeline.seal_and_send_packet(self.ctx.peer_addr, &mut buf).await;
            inner.unacked.insert(packet_number, SentPacket {
                buf,
                sent_at: Instant::now(),
                payload_len: slice_len,
            });
        }

        Ok(())
    }

    /// Queue bytes for a cut-through transfer. Never suspends: bytes beyond the window go into
    ///  a bounded backlog, and overflowing that backlog is an error the caller must react to by
    ///  closing the stream.
    pub async fn send_cut_through(&self, data: &[u8]) -> anyhow::Result<()> {
        let _send_permit = self.send_lock.lock().await;
        self.enqueue_packets(data, false).await?;
        self.drain_queue().await;
        Ok(())
    }

    /// finalize a cut-through transfer with an empty FIN packet
    pub async fn finish(&self) -> anyhow::Result<()> {
        let _send_permit = self.send_lock.lock().await;
        self.enqueue_packets(&[], true).await?;
        self.drain_queue().await;
        Ok(())
    }

    async fn enqueue_packets(&self, mut data: &[u8], fin: bool) -> anyhow::Result<()> {
        if data.is_empty() && !fin {
            return Ok(());
        }

        let max_payload = self.ctx.max_payload_per_packet();
        let mut inner = self.inner.write().await;

        if inner.closed {
            bail!("stream {} is closed", self.stream_id);
        }
        if inner.fin_packetized {
            bail!("stream {} is already finalized", self.stream_id);
        }
        if inner.queued_bytes + data.len() > self.ctx.config.max_send_backlog_bytes {
            bail!("backpressure: send backlog for stream {} is full", self.stream_id);
        }
        if let Some(declared) = inner.declared_total {
            if inner.next_offset + data.len().safe_cast() > declared {
                bail!("stream {} exceeds its declared cut-through length of {}", self.stream_id, declared);
            }
        }

        loop {
            let slice_len = std::cmp::min(max_payload, data.len());
            let is_last = slice_len == data.len();

            let packet_number = self.ctx.next_packet_number();
            let offset = inner.next_offset;
            inner.next_offset += slice_len.safe_cast();

            let buf = self.build_packet(packet_number, offset, &data[..slice_len], fin && is_last);
            data = &data[slice_len..];

            inner.queued.push_back(QueuedPacket { packet_number, buf, payload_len: slice_len });
            inner.queued_bytes += slice_len;

            if data.is_empty() {
                break;
            }
        }

        if fin {
            inner.fin_packetized = true;
        }
        Ok(())
    }

    /// transmit queued packets as far as the windows allow
    pub(crate) async fn drain_queue(&self) {
        loop {
            let mut inner = self.inner.write().await;
            if inner.closed || inner.queued.is_empty() {
                return;
            }
            if inner.unacked.len() >= self.ctx.config.send_window_size.safe_cast() {
                return;
            }
            if !self.ctx.gate.try_acquire() {
                return;
            }

            let packet = inner.queued.pop_front().unwrap();
            inner.queued_bytes -= packet.payload_len;

            let mut buf = packet.buf;
            trace!("sending queued packet {} on stream {}", packet.packet_number, self.stream_id);
            self.ctx.pipeline.seal_and_send_packet(self.ctx.peer_addr, &mut buf).await;
            inner.unacked.insert(packet.packet_number, SentPacket {
                buf,
                sent_at: Instant::now(),
                payload_len: packet.payload_len,
            });
        }
    }

    async fn wait_for_send_window(&self) -> anyhow::Result<()> {
        loop {
            let notified = self.window_notify.notified();
            {
                let inner = self.inner.read().await;
                if inner.closed {
                    bail!("stream {} is closed", self.stream_id);
                }
                if inner.unacked.len() < self.ctx.config.send_window_size.safe_cast() {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Process acknowledged packet numbers; returns true if this stream is finalized and fully
    ///  acknowledged, i.e. it can be dropped by the connection.
    pub async fn on_ack(&self, packet_ids: &[PacketId]) -> bool {
        let mut num_acked = 0u32;
        let complete;
        {
            let mut inner = self.inner.write().await;
            for packet_id in packet_ids {
                if let Some(acked) = inner.unacked.remove(packet_id) {
                    self.ctx.pool.return_to_pool(acked.buf);
                    num_acked += 1;
                }
            }
            if num_acked > 0 {
                inner.backoff.on_ack();
            }
            complete = inner.fin_packetized && inner.unacked.is_empty() && inner.queued.is_empty();
        }

        if num_acked > 0 {
            self.ctx.gate.on_ack(num_acked);
            self.window_notify.notify_waiters();
            self.drain_queue().await;
        }

        complete
    }

    /// Tear the stream down, releasing window capacity and all retained buffers. Used both for
    ///  local aborts (flush) and when the remote asks us to stop sending (skip).
    pub async fn close(&self) {
        let num_in_flight;
        {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return;
            }
            inner.closed = true;

            num_in_flight = inner.unacked.len();
            while let Some((_, sent)) = inner.unacked.pop_first() {
                self.ctx.pool.return_to_pool(sent.buf);
            }
            while let Some(queued) = inner.queued.pop_front() {
                self.ctx.pool.return_to_pool(queued.buf);
            }
            inner.queued_bytes = 0;
        }

        self.ctx.gate.release(num_in_flight.prechecked_cast());
        self.window_notify.notify_waiters();

        if let Some(handle) = self.retransmit_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Drives RTO-based retransmission: whenever the oldest unacknowledged packet's timeout
    ///  expires it is resent with doubled timeout, until the retry budget is exhausted and the
    ///  connection is closed with reason `Timeout`.
    async fn retransmit_loop(self: Arc<SendStream>) {
        loop {
            let deadline = {
                let inner = self.inner.read().await;
                if inner.closed {
                    return;
                }
                match inner.unacked.values().map(|sent| sent.sent_at).min() {
                    Some(oldest) => oldest + inner.backoff.current(),
                    None => Instant::now() + self.ctx.config.initial_rto,
                }
            };

            tokio::time::sleep_until(deadline).await;

            let mut inner = self.inner.write().await;
            if inner.closed {
                return;
            }

            let rto = inner.backoff.current();
            let expired = inner.unacked.iter()
                .min_by_key(|(_, sent)| sent.sent_at)
                .filter(|(_, sent)| sent.sent_at + rto <= Instant::now())
                .map(|(&packet_id, _)| packet_id);

            let Some(packet_id) = expired else {
                continue;
            };

            if inner.backoff.retries() >= self.ctx.config.max_retransmits {
                warn!("packet {} to {:?} exhausted its {} retransmissions - giving up on the connection",
                    packet_id, self.ctx.peer_addr, self.ctx.config.max_retransmits);
                let _ = self.ctx.close_tx.send(CloseReason::Timeout);
                return;
            }

            debug!("RTO expired for packet {} on stream {} to {:?} - retransmitting",
                packet_id, self.stream_id, self.ctx.peer_addr);
            inner.backoff.on_timeout();
            self.ctx.gate.on_loss();

            let sent = inner.unacked.get_mut(&packet_id).unwrap();
            sent.sent_at = Instant::now();
            self.ctx.pipeline.resend_packet(self.ctx.peer_addr, sent.buf.as_ref()).await;
        }
    }
}
