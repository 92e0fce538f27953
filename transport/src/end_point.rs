use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::buffers::buffer_pool::SendBufferPool;
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::encryption::{derive_static_public_key, Aes256GcmEncryption, NoEncryption, PacketEncryption};
use crate::listener::{CloseReason, TransportListener};
use crate::packet_header::{PacketHeader, PacketKind};
use crate::packet_id::PacketId;
use crate::send_pipeline::SendPipeline;

/// EndPoint is the place where all other parts of the protocol come together: It listens on a
///  UdpSocket, opens and decrypts incoming packets, demultiplexes them to their connections by
///  conn id, and has the API for dialing peers.
pub struct EndPoint {
    config: Arc<TransportConfig>,
    listener: Arc<dyn TransportListener>,
    receive_socket: Arc<UdpSocket>,
    pipeline: Arc<SendPipeline>,
    pool: Arc<SendBufferPool>,
    encryption: Arc<dyn PacketEncryption>,
    self_static_pk: [u8; 32],
    connections: RwLock<FxHashMap<u32, Arc<Connection>>>,
    by_peer: RwLock<FxHashMap<SocketAddr, u32>>,
}

impl EndPoint {
    pub async fn new(
        listener: Arc<dyn TransportListener>,
        config: Arc<TransportConfig>,
    ) -> anyhow::Result<Arc<EndPoint>> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound receive socket to {:?}", receive_socket.local_addr()?);

        let encryption = Self::create_encryption(config.as_ref());
        let pool = Arc::new(SendBufferPool::new(
            config.payload_size_inside_udp,
            config.buffer_pool_size,
            encryption.clone(),
        ));

        Ok(Arc::new(EndPoint {
            self_static_pk: derive_static_public_key(&config.static_secret),
            pipeline: Arc::new(SendPipeline::new(Arc::new(receive_socket.clone()), encryption.clone())),
            config,
            listener,
            receive_socket,
            pool,
            encryption,
            connections: RwLock::new(FxHashMap::default()),
            by_peer: RwLock::new(FxHashMap::default()),
        }))
    }

    fn create_encryption(config: &TransportConfig) -> Arc<dyn PacketEncryption> {
        if let Some(key) = &config.encryption_key {
            info!("setting up AES encryption");
            Arc::new(Aes256GcmEncryption::new(key))
        }
        else {
            warn!("initializing without encryption - this is for debugging purposes and not recommended for production use");
            Arc::new(NoEncryption)
        }
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.receive_socket.local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }

    /// this node's static public key, as presented to remote peers during the handshake
    pub fn self_static_pk(&self) -> [u8; 32] {
        self.self_static_pk
    }

    pub async fn get_connection(&self, peer_addr: SocketAddr) -> Option<Arc<Connection>> {
        let conn_id = *self.by_peer.read().await.get(&peer_addr)?;
        self.connections.read().await.get(&conn_id).cloned()
    }

    /// Initiate a connection to a remote peer. Returns immediately with the connection in the
    ///  dialing state; [`TransportListener::on_established`] fires once the handshake completes.
    ///  Dialing an address that already has a connection returns that connection.
    pub async fn dial(
        self: &Arc<Self>,
        peer_addr: SocketAddr,
        remote_static_pk: [u8; 32],
    ) -> anyhow::Result<Arc<Connection>> {
        if let Some(existing) = self.get_connection(peer_addr).await {
            debug!("dial to {:?}: connection already exists", peer_addr);
            return Ok(existing);
        }

        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let local_conn_id = self.allocate_conn_id().await?;

        let conn = Connection::new_dialing(
            self.config.clone(),
            self.listener.clone(),
            self.pipeline.clone(),
            self.pool.clone(),
            peer_addr,
            local_conn_id,
            self.self_static_pk,
            remote_static_pk,
            close_tx,
        );

        self.register(conn.clone(), close_rx).await;

        debug!("dialing {:?} with local conn id {}", peer_addr, local_conn_id);
        conn.send_dial().await;
        Ok(conn)
    }

    async fn allocate_conn_id(&self) -> anyhow::Result<u32> {
        let connections = self.connections.read().await;
        for _ in 0..64 {
            let candidate = rand::random::<u32>();
            if candidate != 0 && !connections.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        bail!("could not allocate a connection id");
    }

    async fn register(self: &Arc<Self>, conn: Arc<Connection>, close_rx: mpsc::UnboundedReceiver<CloseReason>) {
        self.connections.write().await.insert(conn.local_conn_id(), conn.clone());
        self.by_peer.write().await.insert(conn.peer_addr(), conn.local_conn_id());

        tokio::spawn(self.clone().watchdog(conn, close_rx));
    }

    /// Per-connection housekeeping: performs requested closes, drives handshake retries, and
    ///  enforces the idle timeout.
    async fn watchdog(self: Arc<Self>, conn: Arc<Connection>, mut close_rx: mpsc::UnboundedReceiver<CloseReason>) {
        let mut ticks = tokio::time::interval(Duration::from_millis(500));
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            select! {
                reason = close_rx.recv() => {
                    self.do_close(&conn, reason.unwrap_or(CloseReason::LocalClose)).await;
                    return;
                }
                _ = ticks.tick() => {
                    if conn.handshake_tick().await {
                        debug!("handshake with {:?} timed out", conn.peer_addr());
                        self.do_close(&conn, CloseReason::Timeout).await;
                        return;
                    }
                    if conn.is_idle_expired().await {
                        debug!("connection to {:?} is idle", conn.peer_addr());
                        self.do_close(&conn, CloseReason::Idle).await;
                        return;
                    }
                }
            }
        }
    }

    async fn do_close(&self, conn: &Arc<Connection>, reason: CloseReason) {
        self.connections.write().await.remove(&conn.local_conn_id());

        let mut by_peer = self.by_peer.write().await;
        if by_peer.get(&conn.peer_addr()) == Some(&conn.local_conn_id()) {
            by_peer.remove(&conn.peer_addr());
        }
        drop(by_peer);

        conn.teardown(reason).await;
    }

    pub async fn recv_loop(self: &Arc<Self>) {
        info!("starting receive loop");

        let mut buf = self.pool.get_from_pool();
        loop {
            buf.maximize_len();
            let (num_read, from) = match self.receive_socket.recv_from(buf.as_mut()).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            buf.truncate(num_read);

            if self.encryption.open(&mut buf).is_err() {
                debug!("cryptographically invalid packet from {:?} - dropping", from);
                continue;
            }

            let mut parse_buf = &buf.as_ref()[self.encryption.prefix_len()..];
            let header = match PacketHeader::deser(&mut parse_buf) {
                Ok(header) => header,
                Err(_) => {
                    warn!("received packet with unparseable header from {:?} - dropping", from);
                    continue;
                }
            };

            self.dispatch_packet(from, &header, parse_buf).await;
        }
    }

    async fn dispatch_packet(self: &Arc<Self>, from: SocketAddr, header: &PacketHeader, payload: &[u8]) {
        if let PacketKind::Dial = header.packet_kind {
            self.handle_dial(from, header, payload).await;
            return;
        }

        let conn = self.connections.read().await.get(&header.dst_conn_id).cloned();
        match conn {
            Some(conn) => conn.on_packet(header, payload).await,
            None => {
                debug!("packet from {:?} for unknown conn id {} - resetting", from, header.dst_conn_id);
                if header.packet_kind != PacketKind::Reset {
                    self.send_bare_reset(from, header.src_conn_id).await;
                }
            }
        }
    }

    async fn handle_dial(self: &Arc<Self>, from: SocketAddr, header: &PacketHeader, payload: &[u8]) {
        if let Some(existing) = self.get_connection(from).await {
            // duplicate DIAL for an existing connection (e.g. a lost DIAL_CONF)
            existing.on_packet(header, payload).await;
            return;
        }

        if !self.listener.should_accept(from) {
            debug!("rejecting dial from {:?}", from);
            return;
        }

        let Ok(remote_static_pk) = <[u8; 32]>::try_from(payload) else {
            warn!("DIAL from {:?} without a static key - dropping", from);
            return;
        };

        let Ok(local_conn_id) = self.allocate_conn_id().await else {
            return;
        };
        let (close_tx, close_rx) = mpsc::unbounded_channel();

        let conn = Connection::new_accepting(
            self.config.clone(),
            self.listener.clone(),
            self.pipeline.clone(),
            self.pool.clone(),
            from,
            local_conn_id,
            self.self_static_pk,
            header.src_conn_id,
            remote_static_pk,
            close_tx,
        );

        debug!("accepting dial from {:?} with local conn id {}", from, local_conn_id);
        self.register(conn.clone(), close_rx).await;
        conn.start_accept().await;
    }

    /// tell a peer that still sends to a connection we no longer know about to go away
    async fn send_bare_reset(&self, to: SocketAddr, remote_conn_id: u32) {
        let mut buf = self.pool.get_from_pool();
        PacketHeader::new(PacketKind::Reset, 0, remote_conn_id, 0, PacketId::ZERO, 0, 0)
            .ser(&mut buf);
        self.pipeline.seal_and_send_packet(to, &mut buf).await;
        self.pool.return_to_pool(buf);
    }
}
