use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::bail;
use bytes::BufMut;
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::buffers::buffer_pool::SendBufferPool;
use crate::config::TransportConfig;
use crate::congestion::CongestionGate;
use crate::listener::{CloseReason, TransportListener};
use crate::packet_header::{PacketHeader, PacketKind};
use crate::packet_id::PacketId;
use crate::receive_stream::{ReceiveDisposition, ReceiveStream};
use crate::rto::RetransmitBackoff;
use crate::safe_converter::PrecheckedCast;
use crate::send_pipeline::SendPipeline;
use crate::send_stream::{SendStream, StreamCtx};

/// the stream carrying ordinary framed messages; cut-through transfers get their own streams
pub const FRAME_STREAM_ID: u16 = 0;

enum ConnState {
    /// we sent DIAL and are waiting for DIAL_CONF
    Dialing {
        remote_static_pk: [u8; 32],
        backoff: RetransmitBackoff,
        next_resend: Instant,
    },
    /// we answered an incoming DIAL with DIAL_CONF and are waiting for CONF
    AcceptPending {
        remote_conn_id: u32,
        remote_static_pk: [u8; 32],
        backoff: RetransmitBackoff,
        next_resend: Instant,
    },
    Active {
        remote_conn_id: u32,
        remote_static_pk: [u8; 32],
    },
    Closed {
        reason: CloseReason,
    },
}

/// A logical peering with one remote endpoint, multiplexing any number of independent streams
///  over the shared datagram channel. Created by `dial` or by accepting a remote dial; the
///  three-way DIAL / DIAL_CONF / CONF handshake brings it to the active state.
pub struct Connection {
    config: Arc<TransportConfig>,
    listener: Arc<dyn TransportListener>,
    pipeline: Arc<SendPipeline>,
    pool: Arc<SendBufferPool>,
    peer_addr: SocketAddr,
    local_conn_id: u32,
    is_dialer: bool,
    self_static_pk: [u8; 32],
    gate: Arc<CongestionGate>,
    state: RwLock<ConnState>,
    stream_ctx: OnceLock<Arc<StreamCtx>>,
    send_streams: RwLock<FxHashMap<u16, Arc<SendStream>>>,
    receive_streams: RwLock<FxHashMap<u16, Arc<ReceiveStream>>>,
    /// allocation counter for outgoing cut-through stream ids; the dialer uses odd ids, the
    ///  acceptor even ones, so concurrent allocations on both sides cannot collide
    next_cut_through_id: AtomicU32,
    pending_acks: Mutex<Vec<PacketId>>,
    last_recv: RwLock<Instant>,
    close_tx: mpsc::UnboundedSender<CloseReason>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    fn new(
        config: Arc<TransportConfig>,
        listener: Arc<dyn TransportListener>,
        pipeline: Arc<SendPipeline>,
        pool: Arc<SendBufferPool>,
        peer_addr: SocketAddr,
        local_conn_id: u32,
        is_dialer: bool,
        self_static_pk: [u8; 32],
        state: ConnState,
        close_tx: mpsc::UnboundedSender<CloseReason>,
    ) -> Arc<Connection> {
        Arc::new(Connection {
            gate: Arc::new(CongestionGate::new(config.send_window_size)),
            config,
            listener,
            pipeline,
            pool,
            peer_addr,
            local_conn_id,
            is_dialer,
            self_static_pk,
            state: RwLock::new(state),
            stream_ctx: OnceLock::new(),
            send_streams: RwLock::new(FxHashMap::default()),
            receive_streams: RwLock::new(FxHashMap::default()),
            next_cut_through_id: AtomicU32::new(if is_dialer { 1 } else { 2 }),
            pending_acks: Mutex::new(Vec::new()),
            last_recv: RwLock::new(Instant::now()),
            close_tx,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_dialing(
        config: Arc<TransportConfig>,
        listener: Arc<dyn TransportListener>,
        pipeline: Arc<SendPipeline>,
        pool: Arc<SendBufferPool>,
        peer_addr: SocketAddr,
        local_conn_id: u32,
        self_static_pk: [u8; 32],
        remote_static_pk: [u8; 32],
        close_tx: mpsc::UnboundedSender<CloseReason>,
    ) -> Arc<Connection> {
        let backoff = RetransmitBackoff::new(config.initial_rto, config.max_rto);
        let next_resend = Instant::now() + backoff.current();
        Self::new(
            config, listener, pipeline, pool, peer_addr, local_conn_id, true, self_static_pk,
            ConnState::Dialing { remote_static_pk, backoff, next_resend },
            close_tx,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_accepting(
        config: Arc<TransportConfig>,
        listener: Arc<dyn TransportListener>,
        pipeline: Arc<SendPipeline>,
        pool: Arc<SendBufferPool>,
        peer_addr: SocketAddr,
        local_conn_id: u32,
        self_static_pk: [u8; 32],
        remote_conn_id: u32,
        remote_static_pk: [u8; 32],
        close_tx: mpsc::UnboundedSender<CloseReason>,
    ) -> Arc<Connection> {
        let backoff = RetransmitBackoff::new(config.initial_rto, config.max_rto);
        let next_resend = Instant::now() + backoff.current();
        Self::new(
            config, listener, pipeline, pool, peer_addr, local_conn_id, false, self_static_pk,
            ConnState::AcceptPending { remote_conn_id, remote_static_pk, backoff, next_resend },
            close_tx,
        )
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_conn_id(&self) -> u32 {
        self.local_conn_id
    }

    /// true if this side initiated the connection
    pub fn is_dialer(&self) -> bool {
        self.is_dialer
    }

    pub async fn is_active(&self) -> bool {
        matches!(&*self.state.read().await, ConnState::Active { .. })
    }

    pub async fn remote_static_pk(&self) -> Option<[u8; 32]> {
        match &*self.state.read().await {
            ConnState::Dialing { remote_static_pk, .. } => Some(*remote_static_pk),
            ConnState::AcceptPending { remote_static_pk, .. } => Some(*remote_static_pk),
            ConnState::Active { remote_static_pk, .. } => Some(*remote_static_pk),
            ConnState::Closed { .. } => None,
        }
    }

    /// request an asynchronous close; the endpoint performs the actual teardown
    pub fn request_close(&self, reason: CloseReason) {
        let _ = self.close_tx.send(reason);
    }

    //---------------- handshake ----------------//

    pub(crate) async fn send_dial(&self) {
        let pk = self.self_static_pk;
        self.send_control(PacketKind::Dial, 0, &pk).await;
    }

    /// answer the DIAL that created this connection
    pub(crate) async fn start_accept(&self) {
        let remote_conn_id = match &*self.state.read().await {
            ConnState::AcceptPending { remote_conn_id, .. } => *remote_conn_id,
            _ => return,
        };
        self.send_dial_conf(remote_conn_id).await;
    }

    async fn send_dial_conf(&self, remote_conn_id: u32) {
        let pk = self.self_static_pk;
        self.send_control(PacketKind::DialConf, remote_conn_id, &pk).await;
    }

    async fn send_conf(&self, remote_conn_id: u32) {
        self.send_control(PacketKind::Conf, remote_conn_id, &[]).await;
    }

    async fn send_control(&self, kind: PacketKind, dst_conn_id: u32, payload: &[u8]) {
        let mut buf = self.pool.get_from_pool();
        PacketHeader::new(kind, self.local_conn_id, dst_conn_id, 0, PacketId::ZERO, 0, payload.len().prechecked_cast())
            .ser(&mut buf);
        buf.put_slice(payload);
        self.pipeline.seal_and_send_packet(self.peer_addr, &mut buf).await;
        self.pool.return_to_pool(buf);
    }

    async fn send_stream_reset(&self, stream_id: u16) {
        let remote_conn_id = match &*self.state.read().await {
            ConnState::Active { remote_conn_id, .. } => *remote_conn_id,
            _ => return,
        };

        let mut buf = self.pool.get_from_pool();
        PacketHeader::new(PacketKind::Reset, self.local_conn_id, remote_conn_id, stream_id, PacketId::ZERO, 0, 0)
            .ser(&mut buf);
        self.pipeline.seal_and_send_packet(self.peer_addr, &mut buf).await;
        self.pool.return_to_pool(buf);
    }

    /// Periodic maintenance of an unfinished handshake: resends the pending handshake packet
    ///  with exponential backoff. Returns true once the retry budget is exhausted.
    pub(crate) async fn handshake_tick(&self) -> bool {
        enum Resend { Dial, DialConf(u32) }

        let resend = {
            let mut state = self.state.write().await;
            let now = Instant::now();
            match &mut *state {
                ConnState::Dialing { backoff, next_resend, .. } => {
                    if *next_resend > now {
                        None
                    }
                    else if backoff.retries() >= self.config.max_retransmits {
                        return true;
                    }
                    else {
                        *next_resend = now + backoff.on_timeout();
                        Some(Resend::Dial)
                    }
                }
                ConnState::AcceptPending { remote_conn_id, backoff, next_resend, .. } => {
                    if *next_resend > now {
                        None
                    }
                    else if backoff.retries() >= self.config.max_retransmits {
                        return true;
                    }
                    else {
                        let remote_conn_id = *remote_conn_id;
                        *next_resend = now + backoff.on_timeout();
                        Some(Resend::DialConf(remote_conn_id))
                    }
                }
                _ => None,
            }
        };

        match resend {
            Some(Resend::Dial) => {
                debug!("resending DIAL to {:?}", self.peer_addr);
                self.send_dial().await;
            }
            Some(Resend::DialConf(remote_conn_id)) => {
                debug!("resending DIAL_CONF to {:?}", self.peer_addr);
                self.send_dial_conf(remote_conn_id).await;
            }
            None => {}
        }
        false
    }

    pub(crate) async fn is_idle_expired(&self) -> bool {
        self.last_recv.read().await.elapsed() > 2 * self.config.heartbeat_interval
    }

    async fn activate(self: &Arc<Self>, remote_conn_id: u32, remote_static_pk: [u8; 32]) {
        {
            let mut state = self.state.write().await;
            if matches!(&*state, ConnState::Active { .. } | ConnState::Closed { .. }) {
                return;
            }
            *state = ConnState::Active { remote_conn_id, remote_static_pk };
        }

        let _ = self.stream_ctx.set(Arc::new(StreamCtx {
            config: self.config.clone(),
            pipeline: self.pipeline.clone(),
            pool: self.pool.clone(),
            gate: self.gate.clone(),
            peer_addr: self.peer_addr,
            local_conn_id: self.local_conn_id,
            remote_conn_id,
            next_packet_number: AtomicU64::new(0),
            close_tx: self.close_tx.clone(),
        }));

        debug!("connection to {:?} is active (local conn id {}, remote conn id {})",
            self.peer_addr, self.local_conn_id, remote_conn_id);
        self.listener.on_established(self.clone()).await;
    }

    //---------------- packet ingress ----------------//

    pub(crate) async fn on_packet(self: &Arc<Self>, header: &PacketHeader, payload: &[u8]) {
        *self.last_recv.write().await = Instant::now();

        match header.packet_kind {
            PacketKind::Dial => {
                // a duplicate of the DIAL that created this connection - our DIAL_CONF was lost
                let remote_conn_id = match &*self.state.read().await {
                    ConnState::AcceptPending { remote_conn_id, .. } => Some(*remote_conn_id),
                    _ => None,
                };
                if let Some(remote_conn_id) = remote_conn_id {
                    self.send_dial_conf(remote_conn_id).await;
                }
            }
            PacketKind::DialConf => self.on_dial_conf(header, payload).await,
            PacketKind::Conf => {
                let pending = match &*self.state.read().await {
                    ConnState::AcceptPending { remote_conn_id, remote_static_pk, .. } =>
                        Some((*remote_conn_id, *remote_static_pk)),
                    _ => None,
                };
                if let Some((remote_conn_id, remote_static_pk)) = pending {
                    self.activate(remote_conn_id, remote_static_pk).await;
                }
            }
            PacketKind::Data { fin } => {
                if !self.ensure_active_for_traffic(header).await {
                    return;
                }
                self.on_data(header, fin, payload).await;
            }
            PacketKind::Ack => {
                if !self.ensure_active_for_traffic(header).await {
                    return;
                }
                self.on_ack(payload).await;
            }
            PacketKind::Reset => self.on_reset(header).await,
        }
    }

    async fn on_dial_conf(self: &Arc<Self>, header: &PacketHeader, payload: &[u8]) {
        let expected_pk = match &*self.state.read().await {
            ConnState::Dialing { remote_static_pk, .. } => Some(*remote_static_pk),
            ConnState::Active { remote_conn_id, .. } => {
                // our CONF was lost - repeat it
                let remote_conn_id = *remote_conn_id;
                self.send_conf(remote_conn_id).await;
                return;
            }
            _ => None,
        };
        let Some(expected_pk) = expected_pk else {
            return;
        };

        if payload.len() != 32 || payload != expected_pk.as_slice() {
            warn!("DIAL_CONF from {:?} carries an unexpected static key - closing", self.peer_addr);
            self.request_close(CloseReason::ProtocolViolation);
            return;
        }

        self.send_conf(header.src_conn_id).await;
        self.activate(header.src_conn_id, expected_pk).await;
    }

    /// Data and ACK packets are only valid on an active connection. For the acceptor they also
    ///  serve as an implicit CONF: the dialer only sends them once it considers the handshake
    ///  complete, so a lost CONF does not stall the connection.
    async fn ensure_active_for_traffic(self: &Arc<Self>, header: &PacketHeader) -> bool {
        let pending = {
            match &*self.state.read().await {
                ConnState::Active { remote_conn_id, .. } => {
                    if *remote_conn_id != header.src_conn_id {
                        warn!("packet from {:?} with inconsistent conn id {} (expected {})",
                            self.peer_addr, header.src_conn_id, remote_conn_id);
                        self.request_close(CloseReason::ProtocolViolation);
                        return false;
                    }
                    return true;
                }
                ConnState::AcceptPending { remote_conn_id, remote_static_pk, .. } =>
                    Some((*remote_conn_id, *remote_static_pk)),
                _ => None,
            }
        };

        match pending {
            Some((remote_conn_id, remote_static_pk)) => {
                self.activate(remote_conn_id, remote_static_pk).await;
                true
            }
            None => {
                debug!("dropping traffic packet from {:?} on inactive connection", self.peer_addr);
                false
            }
        }
    }

    async fn on_data(&self, header: &PacketHeader, fin: bool, payload: &[u8]) {
        if payload.len() != header.payload_len as usize {
            warn!("data packet from {:?} with inconsistent payload length", self.peer_addr);
            self.request_close(CloseReason::ProtocolViolation);
            return;
        }

        let stream = self.get_or_create_receive_stream(header.stream_id).await;
        match stream.on_packet(header.offset, fin, payload).await {
            ReceiveDisposition::Ack => {
                self.pending_acks.lock().unwrap().push(header.packet_number);
                self.flush_acks().await;
            }
            ReceiveDisposition::Drop => {}
            ReceiveDisposition::ProtocolViolation => {
                self.request_close(CloseReason::ProtocolViolation);
            }
        }
    }

    async fn get_or_create_receive_stream(&self, stream_id: u16) -> Arc<ReceiveStream> {
        {
            let streams = self.receive_streams.read().await;
            if let Some(stream) = streams.get(&stream_id) {
                return stream.clone();
            }
        }

        let mut streams = self.receive_streams.write().await;
        streams.entry(stream_id)
            .or_insert_with(|| {
                trace!("initializing receive stream {} for {:?}", stream_id, self.peer_addr);
                Arc::new(ReceiveStream::new(
                    self.config.clone(),
                    self.listener.clone(),
                    self.peer_addr,
                    stream_id,
                ))
            })
            .clone()
    }

    async fn flush_acks(&self) {
        let acked = {
            let mut pending = self.pending_acks.lock().unwrap();
            if pending.is_empty() {
                return;
            }
            std::mem::take(&mut *pending)
        };

        let remote_conn_id = match &*self.state.read().await {
            ConnState::Active { remote_conn_id, .. } => *remote_conn_id,
            _ => return,
        };

        let mut payload = Vec::new();
        payload.put_usize_varint(acked.len());
        for packet_id in &acked {
            payload.put_u64(packet_id.to_raw());
        }

        let mut buf = self.pool.get_from_pool();
        PacketHeader::new(
            PacketKind::Ack,
            self.local_conn_id,
            remote_conn_id,
            0,
            PacketId::ZERO,
            0,
            payload.len().prechecked_cast(),
        ).ser(&mut buf);
        buf.put_slice(&payload);

        trace!("acknowledging {:?} to {:?}", acked, self.peer_addr);
        self.pipeline.seal_and_send_packet(self.peer_addr, &mut buf).await;
        self.pool.return_to_pool(buf);
    }

    async fn on_ack(&self, mut payload: &[u8]) {
        let num_ids = match payload.try_get_usize_varint() {
            Ok(n) => n,
            Err(_) => {
                warn!("unparseable ACK from {:?}", self.peer_addr);
                self.request_close(CloseReason::ProtocolViolation);
                return;
            }
        };

        let mut acked = Vec::with_capacity(num_ids);
        for _ in 0..num_ids {
            match payload.try_get_u64() {
                Ok(raw) => acked.push(PacketId::from_raw(raw)),
                Err(_) => {
                    warn!("unparseable ACK from {:?}", self.peer_addr);
                    self.request_close(CloseReason::ProtocolViolation);
                    return;
                }
            }
        }

        let streams: Vec<(u16, Arc<SendStream>)> = self.send_streams.read().await
            .iter()
            .map(|(&id, stream)| (id, stream.clone()))
            .collect();

        for (stream_id, stream) in streams {
            let complete = stream.on_ack(&acked).await;
            if complete && stream_id != FRAME_STREAM_ID {
                trace!("cut-through stream {} to {:?} fully acknowledged - dropping", stream_id, self.peer_addr);
                self.send_streams.write().await.remove(&stream_id);
            }
        }
    }

    async fn on_reset(&self, header: &PacketHeader) {
        if header.stream_id == 0 {
            debug!("received connection RESET from {:?}", self.peer_addr);
            self.request_close(CloseReason::PeerReset);
            return;
        }

        // stream-scoped: either the remote abandoned a stream it was sending to us (flush), or
        //  it asks us to stop sending one of ours (skip)
        let receive_stream = self.receive_streams.read().await.get(&header.stream_id).cloned();
        if let Some(stream) = receive_stream {
            stream.on_reset().await;
            return;
        }

        let send_stream = self.send_streams.write().await.remove(&header.stream_id);
        if let Some(stream) = send_stream {
            debug!("remote skipped stream {} to {:?}", header.stream_id, self.peer_addr);
            stream.close().await;
            self.listener.on_stream_skipped(self.peer_addr, header.stream_id).await;
        }
    }

    //---------------- sending ----------------//

    fn active_stream_ctx(&self) -> anyhow::Result<Arc<StreamCtx>> {
        match self.stream_ctx.get() {
            Some(ctx) => Ok(ctx.clone()),
            None => bail!("connection to {:?} is not active", self.peer_addr),
        }
    }

    /// Send bytes on the ordinary frame stream, suspending while windows are saturated.
    pub async fn send_frame_bytes(&self, data: &[u8]) -> anyhow::Result<()> {
        let ctx = self.active_stream_ctx()?;

        let stream = {
            let mut streams = self.send_streams.write().await;
            streams.entry(FRAME_STREAM_ID)
                .or_insert_with(|| SendStream::new(ctx, FRAME_STREAM_ID, None))
                .clone()
        };
        stream.send(data).await
    }

    /// Reserve an egress stream for a cut-through transfer of `total_len` bytes. Returns 0 if
    ///  back-pressure (or the missing handshake) forbids another transfer.
    pub async fn cut_through_send_start(&self, total_len: u64) -> u16 {
        let Ok(ctx) = self.active_stream_ctx() else {
            return 0;
        };

        let mut streams = self.send_streams.write().await;
        let num_cut_through = streams.len().saturating_sub(usize::from(streams.contains_key(&FRAME_STREAM_ID)));
        if num_cut_through >= self.config.max_cut_through_streams {
            debug!("no cut-through capacity left for {:?}", self.peer_addr);
            return 0;
        }

        let stream_id = loop {
            let raw = self.next_cut_through_id.fetch_add(2, Ordering::AcqRel);
            let candidate = (raw % 0x1_0000) as u16;
            if candidate != FRAME_STREAM_ID && !streams.contains_key(&candidate) {
                break candidate;
            }
        };

        streams.insert(stream_id, SendStream::new(ctx, stream_id, Some(total_len)));
        trace!("reserved cut-through stream {} for {:?} ({} bytes)", stream_id, self.peer_addr, total_len);
        stream_id
    }

    pub async fn cut_through_send_bytes(&self, stream_id: u16, chunk: &[u8]) -> anyhow::Result<()> {
        let stream = self.send_streams.read().await.get(&stream_id).cloned();
        match stream {
            Some(stream) => stream.send_cut_through(chunk).await,
            None => bail!("no cut-through stream {} for {:?}", stream_id, self.peer_addr),
        }
    }

    pub async fn cut_through_send_end(&self, stream_id: u16) {
        let stream = self.send_streams.read().await.get(&stream_id).cloned();
        if let Some(stream) = stream {
            if let Err(e) = stream.finish().await {
                debug!("finalizing cut-through stream {} for {:?} failed: {}", stream_id, self.peer_addr, e);
            }
        }
    }

    /// abort a half-sent transfer, telling the remote to discard what it has
    pub async fn cut_through_send_flush(&self, stream_id: u16) {
        let stream = self.send_streams.write().await.remove(&stream_id);
        if let Some(stream) = stream {
            stream.close().await;
            self.send_stream_reset(stream_id).await;
        }
    }

    /// tell the remote to stop sending a cut-through stream whose prefix we rejected
    pub async fn cut_through_send_skip(&self, stream_id: u16) {
        let stream = self.receive_streams.read().await.get(&stream_id).cloned();
        if let Some(stream) = stream {
            stream.mark_skipped().await;
        }
        self.send_stream_reset(stream_id).await;
    }

    //---------------- teardown ----------------//

    /// Final teardown. Only the endpoint calls this (everything else funnels through
    ///  [`Connection::request_close`]); pending send buffers are released and the peer is
    ///  notified unless it initiated the close itself.
    pub(crate) async fn teardown(&self, reason: CloseReason) {
        let remote_conn_id = {
            let mut state = self.state.write().await;
            let remote_conn_id = match &*state {
                ConnState::Closed { .. } => return,
                ConnState::Active { remote_conn_id, .. } => *remote_conn_id,
                ConnState::AcceptPending { remote_conn_id, .. } => *remote_conn_id,
                ConnState::Dialing { .. } => 0,
            };
            *state = ConnState::Closed { reason };
            remote_conn_id
        };

        let send_streams: Vec<_> = self.send_streams.write().await.drain().collect();
        for (_, stream) in send_streams {
            stream.close().await;
        }
        self.receive_streams.write().await.clear();

        if reason != CloseReason::PeerReset {
            let mut buf = self.pool.get_from_pool();
            PacketHeader::new(PacketKind::Reset, self.local_conn_id, remote_conn_id, 0, PacketId::ZERO, 0, 0)
                .ser(&mut buf);
            self.pipeline.seal_and_send_packet(self.peer_addr, &mut buf).await;
            self.pool.return_to_pool(buf);
        }

        self.listener.on_closed(self.peer_addr, reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::NoEncryption;
    use crate::listener::MockTransportListener;
    use crate::send_pipeline::{MockSendSocket, SendPipeline};
    use tokio::runtime::Builder;

    fn test_setup(
        send_socket: MockSendSocket,
        listener: MockTransportListener,
    ) -> (Arc<TransportConfig>, Arc<dyn TransportListener>, Arc<SendPipeline>, Arc<SendBufferPool>) {
        let encryption = Arc::new(NoEncryption);
        (
            Arc::new(TransportConfig::new(SocketAddr::from(([1, 2, 3, 4], 8)), None, [9; 32])),
            Arc::new(listener),
            Arc::new(SendPipeline::new(Arc::new(send_socket), encryption.clone())),
            Arc::new(SendBufferPool::new(1472, 16, encryption)),
        )
    }

    fn dial_conf_packet(src_conn_id: u32, dst_conn_id: u32, pk: [u8; 32]) -> (PacketHeader, Vec<u8>) {
        (
            PacketHeader::new(PacketKind::DialConf, src_conn_id, dst_conn_id, 0, PacketId::ZERO, 0, 32),
            pk.to_vec(),
        )
    }

    #[test]
    fn test_dialer_handshake() {
        let peer_pk = [7u8; 32];

        let mut send_socket = MockSendSocket::new();
        send_socket.expect_local_addr()
            .return_const(SocketAddr::from(([1, 2, 3, 4], 8)));
        // DIAL carrying our pk, then CONF to the responder's conn id
        send_socket.expect_do_send_packet()
            .withf(|_, buf| buf[1] == 3 && buf[30..] == [9; 32])
            .once()
            .return_const(());
        send_socket.expect_do_send_packet()
            .withf(|_, buf| buf[1] == 5 && buf[6..10] == [0, 0, 0, 77])
            .once()
            .return_const(());

        let mut listener = MockTransportListener::new();
        listener.expect_on_established()
            .once()
            .return_const(());

        let (config, listener, pipeline, pool) = test_setup(send_socket, listener);
        let (close_tx, _close_rx) = mpsc::unbounded_channel();

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let conn = Connection::new_dialing(
                config, listener, pipeline, pool,
                SocketAddr::from(([1, 2, 3, 4], 9)), 42, [9; 32], peer_pk, close_tx,
            );
            conn.send_dial().await;
            assert!(!conn.is_active().await);

            let (header, payload) = dial_conf_packet(77, 42, peer_pk);
            conn.on_packet(&header, &payload).await;

            assert!(conn.is_active().await);
            assert_eq!(conn.remote_static_pk().await, Some(peer_pk));
        });
    }

    #[test]
    fn test_dial_conf_with_wrong_key_is_a_protocol_violation() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_local_addr()
            .return_const(SocketAddr::from(([1, 2, 3, 4], 8)));
        send_socket.expect_do_send_packet()
            .return_const(());

        let (config, listener, pipeline, pool) = test_setup(send_socket, MockTransportListener::new());
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let conn = Connection::new_dialing(
                config, listener, pipeline, pool,
                SocketAddr::from(([1, 2, 3, 4], 9)), 42, [9; 32], [7; 32], close_tx,
            );

            let (header, payload) = dial_conf_packet(77, 42, [8; 32]);
            conn.on_packet(&header, &payload).await;

            assert!(!conn.is_active().await);
            assert_eq!(close_rx.recv().await, Some(CloseReason::ProtocolViolation));
        });
    }

    #[test]
    fn test_acceptor_handshake_with_implicit_conf() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_local_addr()
            .return_const(SocketAddr::from(([1, 2, 3, 4], 8)));
        send_socket.expect_do_send_packet()
            .return_const(());

        let mut listener = MockTransportListener::new();
        listener.expect_on_established()
            .once()
            .return_const(());
        listener.expect_on_stream_bytes()
            .withf(|_, stream_id, chunk| *stream_id == 0 && chunk == &[1, 2, 3])
            .once()
            .return_const(());

        let (config, listener, pipeline, pool) = test_setup(send_socket, listener);
        let (close_tx, _close_rx) = mpsc::unbounded_channel();

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let conn = Connection::new_accepting(
                config, listener, pipeline, pool,
                SocketAddr::from(([1, 2, 3, 4], 9)), 42, [9; 32], 77, [7; 32], close_tx,
            );

            // the CONF was lost; data arrives directly
            let header = PacketHeader::new(PacketKind::Data { fin: false }, 77, 42, 0, PacketId::from_raw(0), 0, 3);
            conn.on_packet(&header, &[1, 2, 3]).await;

            assert!(conn.is_active().await);
        });
    }

    #[test]
    fn test_data_with_inconsistent_conn_id_closes() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_local_addr()
            .return_const(SocketAddr::from(([1, 2, 3, 4], 8)));
        send_socket.expect_do_send_packet()
            .return_const(());

        let mut listener = MockTransportListener::new();
        listener.expect_on_established()
            .return_const(());

        let (config, listener, pipeline, pool) = test_setup(send_socket, listener);
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let conn = Connection::new_dialing(
                config, listener, pipeline, pool,
                SocketAddr::from(([1, 2, 3, 4], 9)), 42, [9; 32], [7; 32], close_tx,
            );
            let (header, payload) = dial_conf_packet(77, 42, [7; 32]);
            conn.on_packet(&header, &payload).await;
            assert!(conn.is_active().await);

            let header = PacketHeader::new(PacketKind::Data { fin: false }, 1234, 42, 0, PacketId::ZERO, 0, 1);
            conn.on_packet(&header, &[1]).await;

            assert_eq!(close_rx.recv().await, Some(CloseReason::ProtocolViolation));
        });
    }

    #[test]
    fn test_data_is_acked() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_local_addr()
            .return_const(SocketAddr::from(([1, 2, 3, 4], 8)));
        // handshake CONF
        send_socket.expect_do_send_packet()
            .withf(|_, buf| buf[1] == 5)
            .return_const(());
        // the ACK for packet number 13: varint count 1, id 13
        send_socket.expect_do_send_packet()
            .withf(|_, buf| buf[1] == 2 && buf[30..] == [1, 0,0,0,0,0,0,0,13])
            .once()
            .return_const(());

        let mut listener = MockTransportListener::new();
        listener.expect_on_established()
            .return_const(());
        listener.expect_on_stream_bytes()
            .return_const(());

        let (config, listener, pipeline, pool) = test_setup(send_socket, listener);
        let (close_tx, _close_rx) = mpsc::unbounded_channel();

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let conn = Connection::new_dialing(
                config, listener, pipeline, pool,
                SocketAddr::from(([1, 2, 3, 4], 9)), 42, [9; 32], [7; 32], close_tx,
            );
            let (header, payload) = dial_conf_packet(77, 42, [7; 32]);
            conn.on_packet(&header, &payload).await;

            let header = PacketHeader::new(PacketKind::Data { fin: false }, 77, 42, 3, PacketId::from_raw(13), 0, 2);
            conn.on_packet(&header, &[5, 6]).await;
        });
    }

    #[test]
    fn test_connection_reset_requests_close() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_local_addr()
            .return_const(SocketAddr::from(([1, 2, 3, 4], 8)));
        send_socket.expect_do_send_packet()
            .return_const(());

        let (config, listener, pipeline, pool) = test_setup(send_socket, MockTransportListener::new());
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let conn = Connection::new_dialing(
                config, listener, pipeline, pool,
                SocketAddr::from(([1, 2, 3, 4], 9)), 42, [9; 32], [7; 32], close_tx,
            );

            let header = PacketHeader::new(PacketKind::Reset, 77, 42, 0, PacketId::ZERO, 0, 0);
            conn.on_packet(&header, &[]).await;

            assert_eq!(close_rx.recv().await, Some(CloseReason::PeerReset));
        });
    }

    #[test]
    fn test_cut_through_stream_id_allocation() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_local_addr()
            .return_const(SocketAddr::from(([1, 2, 3, 4], 8)));
        send_socket.expect_do_send_packet()
            .return_const(());

        let mut listener = MockTransportListener::new();
        listener.expect_on_established()
            .return_const(());

        let (config, listener, pipeline, pool) = test_setup(send_socket, listener);
        let (close_tx, _close_rx) = mpsc::unbounded_channel();

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let conn = Connection::new_dialing(
                config, listener, pipeline, pool,
                SocketAddr::from(([1, 2, 3, 4], 9)), 42, [9; 32], [7; 32], close_tx,
            );

            // not active yet -> no stream
            assert_eq!(conn.cut_through_send_start(1000).await, 0);

            let (header, payload) = dial_conf_packet(77, 42, [7; 32]);
            conn.on_packet(&header, &payload).await;

            // the dialer allocates odd stream ids
            assert_eq!(conn.cut_through_send_start(1000).await, 1);
            assert_eq!(conn.cut_through_send_start(1000).await, 3);

            assert!(conn.cut_through_send_bytes(1, &[1, 2]).await.is_ok());
            assert!(conn.cut_through_send_bytes(5, &[1, 2]).await.is_err());
        });
    }

    #[test]
    fn test_cut_through_capacity_limit() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_local_addr()
            .return_const(SocketAddr::from(([1, 2, 3, 4], 8)));
        send_socket.expect_do_send_packet()
            .return_const(());

        let mut listener = MockTransportListener::new();
        listener.expect_on_established()
            .return_const(());

        let encryption = Arc::new(NoEncryption);
        let mut config = TransportConfig::new(SocketAddr::from(([1, 2, 3, 4], 8)), None, [9; 32]);
        config.max_cut_through_streams = 2;

        let (close_tx, _close_rx) = mpsc::unbounded_channel();

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let conn = Connection::new_dialing(
                Arc::new(config),
                Arc::new(listener),
                Arc::new(SendPipeline::new(Arc::new(send_socket), encryption.clone())),
                Arc::new(SendBufferPool::new(1472, 16, encryption)),
                SocketAddr::from(([1, 2, 3, 4], 9)), 42, [9; 32], [7; 32], close_tx,
            );
            let (header, payload) = dial_conf_packet(77, 42, [7; 32]);
            conn.on_packet(&header, &payload).await;

            assert_ne!(conn.cut_through_send_start(1000).await, 0);
            assert_ne!(conn.cut_through_send_start(1000).await, 0);
            assert_eq!(conn.cut_through_send_start(1000).await, 0);
        });
    }
}
