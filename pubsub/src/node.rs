use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace, warn};

use crate::attestation::Attester;
use crate::cut_through::{parse_transfer_header, CutThroughRouter};
use crate::dedup::DedupRing;
use crate::peer::{Dialer, PeerTransport, TransportId};
use crate::slots::{AdmitOutcome, Blacklist, PeerSlots, SlotKind, UnsolicitedOutcome};
use crate::wire::{
    build_message, ControlFrame, MessageFrame, MessageHeader,
    RESPONSE_SUBSCRIBED, RESPONSE_UNSUBSCRIBED,
    TYPE_HEARTBEAT, TYPE_MESSAGE, TYPE_RESPONSE, TYPE_SUBSCRIBE, TYPE_UNSUBSCRIBE,
};
use crate::witness::{witness_contains, Witnesser};

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub max_solicited: usize,
    pub max_unsolicited: usize,
    /// accept subscribes from peers we did not dial
    pub accept_unsolicited: bool,
    /// forward received messages to our own subscribers
    pub enable_relay: bool,
    /// payloads above this size travel via cut-through streams instead of buffered frames
    pub cut_through_threshold: u64,
    /// length prefix size of the message framing, in bytes (1, 2, 4 or 8)
    pub frame_prefix_len: u8,
    pub dedup_tick_interval: Duration,
    pub peer_select_interval: Duration,
    pub blacklist_interval: Duration,
}

impl NodeConfig {
    pub fn new(max_solicited: usize, max_unsolicited: usize) -> NodeConfig {
        NodeConfig {
            max_solicited,
            max_unsolicited,
            accept_unsolicited: false,
            enable_relay: false,
            cut_through_threshold: 50_000,
            frame_prefix_len: 8,
            dedup_tick_interval: Duration::from_secs(10),
            peer_select_interval: Duration::from_secs(60),
            blacklist_interval: Duration::from_secs(600),
        }
    }
}

/// The application-facing contract of a node.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PubSubDelegate: Send + Sync + 'static {
    /// the channels this node subscribes to
    fn channels(&self) -> Vec<u16>;

    fn should_accept(&self, addr: SocketAddr) -> bool;

    async fn on_subscribe(&self, channel: u16);

    async fn on_unsubscribe(&self, channel: u16);

    /// fires exactly once per unique message id within the dedup retention window
    async fn on_message(&self, channel: u16, message_id: u64, payload: Vec<u8>, header: MessageHeader);

    async fn on_close(&self, addr: SocketAddr);

    /// Periodic peer selection: given the current solicited and standby peers, return the
    ///  standby addresses to promote into freed-up solicited slots.
    async fn manage_subscriptions(
        &self,
        max_solicited: usize,
        solicited: Vec<SocketAddr>,
        standby: Vec<SocketAddr>,
    ) -> Vec<SocketAddr>;
}

struct NodeInner {
    slots: PeerSlots,
    blacklist: Blacklist,
    dedup: DedupRing,
    router: CutThroughRouter,
    transports: FxHashMap<TransportId, Arc<dyn PeerTransport>>,
    by_addr: FxHashMap<SocketAddr, TransportId>,
    next_transport_id: u32,
}

/// The pub/sub node: manages peer slots, deduplicates and relays messages, and routes
///  cut-through transfers. All mutable state lives behind one lock and is only touched from
///  the transport's upcalls and the node's own timers.
pub struct PubSubNode {
    config: NodeConfig,
    delegate: Arc<dyn PubSubDelegate>,
    attester: Arc<dyn Attester>,
    witnesser: Arc<dyn Witnesser>,
    self_pk: [u8; 32],
    dialer: OnceLock<Arc<dyn Dialer>>,
    inner: RwLock<NodeInner>,
    message_id_rng: Mutex<StdRng>,
}

impl PubSubNode {
    pub fn new(
        config: NodeConfig,
        delegate: Arc<dyn PubSubDelegate>,
        attester: Arc<dyn Attester>,
        witnesser: Arc<dyn Witnesser>,
        self_pk: [u8; 32],
    ) -> Arc<PubSubNode> {
        Arc::new(PubSubNode {
            inner: RwLock::new(NodeInner {
                slots: PeerSlots::new(config.max_solicited, config.max_unsolicited),
                blacklist: Blacklist::default(),
                dedup: DedupRing::new(),
                router: CutThroughRouter::default(),
                transports: FxHashMap::default(),
                by_addr: FxHashMap::default(),
                next_transport_id: 0,
            }),
            config,
            delegate,
            attester,
            witnesser,
            self_pk,
            dialer: OnceLock::new(),
            message_id_rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// wire in the transport layer's dialing capability (once, during composition)
    pub fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        let _ = self.dialer.set(dialer);
    }

    pub fn accept_unsolicited(&self) -> bool {
        self.config.accept_unsolicited
    }

    pub fn cut_through_threshold(&self) -> u64 {
        self.config.cut_through_threshold
    }

    pub fn should_accept(&self, addr: SocketAddr) -> bool {
        self.config.accept_unsolicited && self.delegate.should_accept(addr)
    }

    /// healthy as long as there is any solicited peer or at least a standby candidate
    pub async fn is_healthy(&self) -> bool {
        !self.inner.read().await.slots.is_empty()
    }

    //---------------- public operations ----------------//

    /// Subscribe to a publisher: dial if unknown, then occupy a solicited slot. Idempotent;
    ///  a no-op while the address is blacklisted.
    pub async fn subscribe(&self, addr: SocketAddr, remote_static_pk: [u8; 32]) {
        let existing = {
            let inner = self.inner.read().await;
            if inner.blacklist.contains(addr) {
                debug!("not subscribing to blacklisted address {:?}", addr);
                return;
            }
            inner.by_addr.get(&addr).copied()
        };

        match existing {
            Some(transport_id) => self.admit_solicited(transport_id).await,
            None => {
                let Some(dialer) = self.dialer.get() else {
                    warn!("no dialer wired in - cannot subscribe to {:?}", addr);
                    return;
                };
                debug!("subscribing to unknown peer {:?} - dialing", addr);
                if let Err(e) = dialer.dial(addr, remote_static_pk).await {
                    debug!("dialing {:?} failed: {}", addr, e);
                }
            }
        }
    }

    /// withdraw this node's subscriptions from a publisher; a no-op for unknown peers
    pub async fn unsubscribe(&self, addr: SocketAddr) {
        let Some(transport) = self.transport_by_addr(addr).await else {
            return;
        };

        for channel in self.delegate.channels() {
            debug!("sending unsubscribe on channel {} to {:?}", channel, addr);
            let mut frame = BytesMut::new();
            ControlFrame::Unsubscribe { channel }.ser(&mut frame);
            if let Err(e) = transport.send_frame(&frame).await {
                debug!("sending unsubscribe to {:?} failed: {}", addr, e);
            }
        }
    }

    /// publish a payload on a channel, fanning out to all solicited and unsolicited peers;
    ///  returns the assigned message id
    pub async fn publish(&self, channel: u16, payload: &[u8], excluded: Option<SocketAddr>) -> u64 {
        let message_id = self.message_id_rng.lock().unwrap().gen();
        self.publish_with(channel, message_id, payload, excluded, &MessageHeader::default()).await;
        message_id
    }

    async fn publish_with(
        &self,
        channel: u16,
        message_id: u64,
        payload: &[u8],
        excluded: Option<SocketAddr>,
        prev_header: &MessageHeader,
    ) {
        let frame = build_message(channel, message_id, payload, prev_header, self.attester.as_ref(), self.witnesser.as_ref());

        let targets: Vec<Arc<dyn PeerTransport>> = {
            let inner = self.inner.read().await;
            inner.slots.fanout()
                .filter_map(|id| inner.transports.get(&id).cloned())
                .collect()
        };

        for transport in targets {
            if excluded == Some(transport.dst_addr()) {
                continue;
            }
            if witness_contains(&prev_header.witness, &transport.remote_static_pk()) {
                trace!("message {} already witnessed by {:?} - pruning", message_id, transport.dst_addr());
                continue;
            }

            trace!("sending message {} on channel {} to {:?}", message_id, channel, transport.dst_addr());
            self.send_with_cut_through_check(&transport, &frame, payload.len() as u64).await;
        }
    }

    async fn send_with_cut_through_check(&self, transport: &Arc<dyn PeerTransport>, frame: &[u8], payload_len: u64) {
        if payload_len > self.config.cut_through_threshold {
            let stream_id = transport.cut_through_send_start(frame.len() as u64).await;
            if stream_id == 0 {
                error!("cut through send to {:?} failed", transport.dst_addr());
                transport.close();
                return;
            }
            if transport.cut_through_send_bytes(stream_id, frame).await.is_err() {
                error!("cut through send to {:?} failed", transport.dst_addr());
                transport.close();
                return;
            }
            transport.cut_through_send_end(stream_id).await;
        }
        else if let Err(e) = transport.send_frame(frame).await {
            debug!("sending message to {:?} failed: {}", transport.dst_addr(), e);
        }
    }

    //---------------- transport lifecycle upcalls ----------------//

    /// a transport reached the active state; `outbound` if this node dialed it
    pub async fn on_transport_open(&self, transport: Arc<dyn PeerTransport>, outbound: bool) -> TransportId {
        let addr = transport.dst_addr();
        let transport_id = {
            let mut inner = self.inner.write().await;
            let transport_id = TransportId(inner.next_transport_id);
            inner.next_transport_id += 1;
            inner.transports.insert(transport_id, transport);
            inner.by_addr.insert(addr, transport_id);
            transport_id
        };
        debug!("transport {} to {:?} is open (outbound: {})", transport_id, addr, outbound);

        if outbound {
            self.admit_solicited(transport_id).await;
        }
        transport_id
    }

    pub async fn on_transport_closed(&self, addr: SocketAddr) {
        let flush_targets = {
            let mut inner = self.inner.write().await;
            let Some(transport_id) = inner.by_addr.remove(&addr) else {
                return;
            };

            if let Some(kind) = inner.slots.remove(transport_id) {
                if matches!(kind, SlotKind::Solicited | SlotKind::Standby) {
                    debug!("lost {:?} peer {:?} - blacklisting", kind, addr);
                    inner.blacklist.insert(addr);
                }
            }

            let orphaned_sessions = inner.router.drain_ingress(transport_id);
            inner.router.remove_subscriber(transport_id);
            inner.transports.remove(&transport_id);

            orphaned_sessions.into_iter()
                .flat_map(|session| session.subscribers)
                .filter_map(|(sub_id, sub_stream)| {
                    inner.transports.get(&sub_id).cloned().map(|t| (t, sub_stream))
                })
                .collect::<Vec<_>>()
        };

        for (transport, stream_id) in flush_targets {
            transport.cut_through_send_flush(stream_id).await;
        }

        self.delegate.on_close(addr).await;

        // rebalance immediately instead of waiting for the next peer-selection tick
        self.apply_peer_selection().await;
    }

    async fn transport_by_addr(&self, addr: SocketAddr) -> Option<Arc<dyn PeerTransport>> {
        let inner = self.inner.read().await;
        let transport_id = inner.by_addr.get(&addr)?;
        inner.transports.get(transport_id).cloned()
    }

    async fn admit_solicited(&self, transport_id: TransportId) {
        let (outcome, transport) = {
            let mut inner = self.inner.write().await;
            let Some(transport) = inner.transports.get(&transport_id).cloned() else {
                debug!("cannot admit {}: transport is gone", transport_id);
                return;
            };
            (inner.slots.admit_solicited(transport_id), transport)
        };

        match outcome {
            AdmitOutcome::Solicited => {
                debug!("adding {:?} to the solicited peers", transport.dst_addr());
                self.send_subscribes_and_response(&transport).await;
            }
            AdmitOutcome::Standby => {
                debug!("solicited slots are full - parking {:?} in standby", transport.dst_addr());
            }
            AdmitOutcome::AlreadyPresent => {}
        }
    }

    async fn send_subscribes_and_response(&self, transport: &Arc<dyn PeerTransport>) {
        for channel in self.delegate.channels() {
            debug!("sending subscribe on channel {} to {:?}", channel, transport.dst_addr());
            let mut frame = BytesMut::new();
            ControlFrame::Subscribe { channel }.ser(&mut frame);
            if let Err(e) = transport.send_frame(&frame).await {
                debug!("sending subscribe to {:?} failed: {}", transport.dst_addr(), e);
                return;
            }
        }

        let mut frame = BytesMut::new();
        ControlFrame::Response { success: true, message: RESPONSE_SUBSCRIBED.to_vec() }.ser(&mut frame);
        let _ = transport.send_frame(&frame).await;
    }

    //---------------- incoming frames ----------------//

    pub async fn on_frame(&self, addr: SocketAddr, frame: &[u8]) {
        let Some(&frame_type) = frame.first() else {
            return;
        };

        match frame_type {
            TYPE_SUBSCRIBE => self.on_subscribe_frame(addr, frame).await,
            TYPE_UNSUBSCRIBE => self.on_unsubscribe_frame(addr, frame).await,
            TYPE_RESPONSE => self.on_response_frame(addr, frame).await,
            TYPE_MESSAGE => self.on_message_frame(addr, &frame[1..]).await,
            TYPE_HEARTBEAT => {} // traffic is all a heartbeat needs to be
            n => debug!("frame with unknown type {} from {:?} - ignoring", n, addr),
        }
    }

    async fn on_subscribe_frame(&self, addr: SocketAddr, frame: &[u8]) {
        let Ok(ControlFrame::Subscribe { channel }) = ControlFrame::deser(frame) else {
            warn!("malformed subscribe from {:?}", addr);
            return;
        };
        debug!("received subscribe on channel {} from {:?}", channel, addr);

        if !self.config.accept_unsolicited {
            return;
        }

        let Some(transport_id) = self.inner.read().await.by_addr.get(&addr).copied() else {
            return;
        };

        let was_blacklisted = self.inner.write().await.blacklist.remove(addr);
        if was_blacklisted {
            // the peer re-appeared after we lost it as solicited - restore it fully
            self.admit_solicited(transport_id).await;
            return;
        }

        let (outcome, transport) = {
            let mut inner = self.inner.write().await;
            let Some(transport) = inner.transports.get(&transport_id).cloned() else {
                return;
            };
            (inner.slots.admit_unsolicited(transport_id), transport)
        };

        match outcome {
            UnsolicitedOutcome::Admitted => {
                debug!("adding {:?} to the unsolicited peers", addr);
                let mut frame = BytesMut::new();
                ControlFrame::Response { success: true, message: RESPONSE_SUBSCRIBED.to_vec() }.ser(&mut frame);
                let _ = transport.send_frame(&frame).await;
            }
            UnsolicitedOutcome::AlreadyPresent => {}
            UnsolicitedOutcome::Full => {
                debug!("unsolicited slots are full - closing {:?}", addr);
                transport.close();
            }
        }
    }

    async fn on_unsubscribe_frame(&self, addr: SocketAddr, frame: &[u8]) {
        let Ok(ControlFrame::Unsubscribe { channel }) = ControlFrame::deser(frame) else {
            warn!("malformed unsubscribe from {:?}", addr);
            return;
        };
        debug!("received unsubscribe on channel {} from {:?}", channel, addr);

        let mut inner = self.inner.write().await;
        if let Some(&transport_id) = inner.by_addr.get(&addr) {
            inner.slots.remove_unsolicited(transport_id);
        }
    }

    async fn on_response_frame(&self, addr: SocketAddr, frame: &[u8]) {
        let Ok(ControlFrame::Response { success, message }) = ControlFrame::deser(frame) else {
            warn!("malformed response from {:?}", addr);
            return;
        };
        debug!("received {} response from {:?}", if success { "OK" } else { "ERROR" }, addr);

        let Some(&channel) = self.delegate.channels().first() else {
            return;
        };

        if message.starts_with(RESPONSE_UNSUBSCRIBED) {
            self.delegate.on_unsubscribe(channel).await;
        }
        else if message.starts_with(RESPONSE_SUBSCRIBED) {
            self.delegate.on_subscribe(channel).await;
        }
        else {
            debug!("response from {:?} with unknown body - dropping", addr);
        }
    }

    async fn on_message_frame(&self, addr: SocketAddr, body: &[u8]) {
        let parsed = match MessageFrame::parse(body, self.attester.as_ref(), self.witnesser.as_ref()) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("malformed message from {:?}: {} - closing", addr, e);
                if let Some(transport) = self.transport_by_addr(addr).await {
                    transport.close();
                }
                return;
            }
        };
        trace!("received message {} on channel {} from {:?}", parsed.message_id, parsed.channel, addr);

        if self.inner.read().await.dedup.contains(parsed.message_id) {
            trace!("message {} is a duplicate - dropping", parsed.message_id);
            return;
        }

        if !self.attester.verify(parsed.message_id, parsed.channel, parsed.payload, parsed.attestation) {
            error!("attestation verification failed for message {} from {:?}", parsed.message_id, addr);
            if let Some(transport) = self.transport_by_addr(addr).await {
                transport.close();
            }
            return;
        }

        self.inner.write().await.dedup.insert(parsed.message_id);

        let header = parsed.header();
        if self.config.enable_relay {
            self.publish_with(parsed.channel, parsed.message_id, parsed.payload, Some(addr), &header).await;
        }

        self.delegate.on_message(parsed.channel, parsed.message_id, parsed.payload.to_vec(), header).await;
    }

    //---------------- cut-through routing ----------------//

    pub async fn cut_through_recv_start(&self, addr: SocketAddr, stream_id: u16, total_len: u64) {
        let Some(transport_id) = self.inner.read().await.by_addr.get(&addr).copied() else {
            return;
        };
        info!("cut-through transfer of {} bytes starting from {:?} (stream {})", total_len, addr, stream_id);
        self.inner.write().await.router.start(transport_id, stream_id, total_len);
    }

    /// Feed transfer bytes through the router. An error means the ingress transport violated
    ///  the protocol and must be closed by the caller.
    pub async fn cut_through_recv_bytes(&self, addr: SocketAddr, stream_id: u16, chunk: &[u8]) -> anyhow::Result<()> {
        let Some(transport_id) = self.inner.read().await.by_addr.get(&addr).copied() else {
            return Ok(());
        };

        let session_state = {
            let mut inner = self.inner.write().await;
            inner.router.get_mut(transport_id, stream_id).map(|s| (s.header_parsed, s.total_len))
        };
        let Some((header_parsed, total_len)) = session_state else {
            // the session was skipped or flushed earlier; drain the remaining bytes
            return Ok(());
        };

        if !header_parsed {
            return self.route_transfer_header(addr, transport_id, stream_id, total_len, chunk).await;
        }

        let subscribers = {
            let mut inner = self.inner.write().await;
            match inner.router.get_mut(transport_id, stream_id) {
                Some(session) => {
                    session.assembled.extend_from_slice(chunk);
                    session.subscribers.clone()
                }
                None => return Ok(()),
            }
        };

        for (sub_id, sub_stream) in subscribers {
            let transport = self.inner.read().await.transports.get(&sub_id).cloned();
            if let Some(transport) = transport {
                if transport.cut_through_send_bytes(sub_stream, chunk).await.is_err() {
                    error!("cut through send to {:?} failed", transport.dst_addr());
                    transport.close();
                }
            }
        }
        Ok(())
    }

    /// First bytes of a transfer: parse the message header, deduplicate, pick the egress
    ///  peers not yet on the witness trail, and forward the rewritten header.
    async fn route_transfer_header(
        &self,
        addr: SocketAddr,
        transport_id: TransportId,
        stream_id: u16,
        total_len: u64,
        chunk: &[u8],
    ) -> anyhow::Result<()> {
        let parsed = parse_transfer_header(chunk)?;
        info!("cut-through message {} on channel {} from {:?}", parsed.message_id, parsed.channel, addr);

        let fresh = {
            let mut inner = self.inner.write().await;
            inner.dedup.insert(parsed.message_id)
        };
        if !fresh {
            trace!("cut-through message {} is a duplicate - skipping", parsed.message_id);
            let ingress = self.inner.read().await.transports.get(&transport_id).cloned();
            if let Some(ingress) = ingress {
                ingress.cut_through_send_skip(stream_id).await;
            }
            self.inner.write().await.router.remove(transport_id, stream_id);
            return Ok(());
        }

        let candidates: Vec<(TransportId, Arc<dyn PeerTransport>)> = {
            let inner = self.inner.read().await;
            inner.slots.fanout()
                .filter(|&id| id != transport_id)
                .filter_map(|id| inner.transports.get(&id).cloned().map(|t| (id, t)))
                .collect()
        };

        let mut subscribers = Vec::new();
        for (sub_id, transport) in candidates {
            if parsed.witness_contains(&transport.remote_static_pk()) {
                trace!("{:?} already witnessed message {} - pruning", transport.dst_addr(), parsed.message_id);
                continue;
            }

            // +32 reserves room for our own key on the trail
            let sub_stream = transport.cut_through_send_start(total_len + 32).await;
            if sub_stream == 0 {
                debug!("cannot cut through to {:?} - no capacity", transport.dst_addr());
                continue;
            }
            subscribers.push((sub_id, sub_stream, transport));
        }

        let new_header = parsed.rewrite_with_appended_key(&self.self_pk);
        let remainder = &chunk[parsed.header_len()..];

        {
            let mut inner = self.inner.write().await;
            if let Some(session) = inner.router.get_mut(transport_id, stream_id) {
                session.subscribers = subscribers.iter().map(|(id, stream, _)| (*id, *stream)).collect();
                session.header_parsed = true;
                session.message_id = parsed.message_id;
                session.channel = parsed.channel;
                session.witness = {
                    let mut wire_witness = Vec::with_capacity(2 + parsed.witness_keys.len());
                    wire_witness.extend_from_slice(&(parsed.witness_keys.len() as u16).to_be_bytes());
                    wire_witness.extend_from_slice(&parsed.witness_keys);
                    wire_witness
                };
                session.assembled.extend_from_slice(remainder);
            }
        }

        for (_, sub_stream, transport) in &subscribers {
            if transport.cut_through_send_bytes(*sub_stream, &new_header).await.is_err() {
                error!("cut through send to {:?} failed", transport.dst_addr());
                transport.close();
                continue;
            }
            if !remainder.is_empty() && transport.cut_through_send_bytes(*sub_stream, remainder).await.is_err() {
                error!("cut through send to {:?} failed", transport.dst_addr());
                transport.close();
            }
        }
        Ok(())
    }

    pub async fn cut_through_recv_end(&self, addr: SocketAddr, stream_id: u16) {
        let (session, subscribers) = {
            let mut inner = self.inner.write().await;
            let Some(&transport_id) = inner.by_addr.get(&addr) else {
                return;
            };
            let Some(session) = inner.router.remove(transport_id, stream_id) else {
                return;
            };
            let subscribers: Vec<_> = session.subscribers.iter()
                .filter_map(|(sub_id, sub_stream)| {
                    inner.transports.get(sub_id).cloned().map(|t| (t, *sub_stream))
                })
                .collect();
            (session, subscribers)
        };

        trace!("cut-through transfer from {:?} (stream {}) complete", addr, stream_id);
        for (transport, sub_stream) in subscribers {
            transport.cut_through_send_end(sub_stream).await;
        }

        // the local node is a subscriber too: deliver the assembled message exactly once
        if session.header_parsed {
            let header = MessageHeader {
                attestation: Vec::new(),
                witness: session.witness,
            };
            self.delegate.on_message(session.channel, session.message_id, session.assembled, header).await;
        }
    }

    pub async fn cut_through_recv_flush(&self, addr: SocketAddr, stream_id: u16) {
        debug!("cut-through transfer from {:?} (stream {}) was abandoned - flushing", addr, stream_id);
        for (transport, sub_stream) in self.remove_session(addr, stream_id).await {
            transport.cut_through_send_flush(sub_stream).await;
        }
    }

    /// an egress peer rejected one of our cut-through streams; stop feeding it
    pub async fn cut_through_send_skipped(&self, addr: SocketAddr, stream_id: u16) {
        let mut inner = self.inner.write().await;
        if let Some(&transport_id) = inner.by_addr.get(&addr) {
            debug!("{:?} skipped cut-through stream {}", addr, stream_id);
            inner.router.remove_subscriber_stream(transport_id, stream_id);
        }
    }

    async fn remove_session(&self, addr: SocketAddr, stream_id: u16) -> Vec<(Arc<dyn PeerTransport>, u16)> {
        let mut inner = self.inner.write().await;
        let Some(&transport_id) = inner.by_addr.get(&addr) else {
            return Vec::new();
        };
        let Some(session) = inner.router.remove(transport_id, stream_id) else {
            return Vec::new();
        };

        session.subscribers.into_iter()
            .filter_map(|(sub_id, sub_stream)| {
                inner.transports.get(&sub_id).cloned().map(|t| (t, sub_stream))
            })
            .collect()
    }

    //---------------- periodic tasks ----------------//

    /// drives the dedup ring, peer selection and blacklist expiry; run this on its own task
    pub async fn run(&self) {
        let mut dedup_ticks = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.dedup_tick_interval,
            self.config.dedup_tick_interval,
        );
        let mut peer_select_ticks = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.peer_select_interval,
            self.config.peer_select_interval,
        );
        let mut blacklist_ticks = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.blacklist_interval,
            self.config.blacklist_interval,
        );

        loop {
            select! {
                _ = dedup_ticks.tick() => self.dedup_tick().await,
                _ = peer_select_ticks.tick() => self.apply_peer_selection().await,
                _ = blacklist_ticks.tick() => self.blacklist_tick().await,
            }
        }
    }

    /// age out remembered message ids and heartbeat the solicited and standby peers
    pub async fn dedup_tick(&self) {
        let targets: Vec<Arc<dyn PeerTransport>> = {
            let mut inner = self.inner.write().await;
            inner.dedup.tick();
            inner.slots.heartbeat_targets()
                .filter_map(|id| inner.transports.get(&id).cloned())
                .collect()
        };

        let mut frame = BytesMut::new();
        ControlFrame::Heartbeat.ser(&mut frame);
        for transport in targets {
            if let Err(e) = transport.send_frame(&frame).await {
                debug!("sending heartbeat to {:?} failed: {}", transport.dst_addr(), e);
            }
        }
    }

    /// let the delegate rebalance solicited vs standby peers
    pub async fn apply_peer_selection(&self) {
        let (max_solicited, solicited, standby) = {
            let inner = self.inner.read().await;
            let addr_of = |ids: Vec<TransportId>| -> Vec<SocketAddr> {
                ids.into_iter()
                    .filter_map(|id| inner.transports.get(&id).map(|t| t.dst_addr()))
                    .collect()
            };
            (
                inner.slots.max_solicited(),
                addr_of(inner.slots.solicited_ids()),
                addr_of(inner.slots.standby_ids()),
            )
        };

        let promotions = self.delegate.manage_subscriptions(max_solicited, solicited, standby).await;

        for addr in promotions {
            let promoted = {
                let mut inner = self.inner.write().await;
                match inner.by_addr.get(&addr).copied() {
                    Some(transport_id) => inner.slots.promote(transport_id),
                    None => false,
                }
            };
            if promoted {
                debug!("promoting standby peer {:?} into a solicited slot", addr);
                if let Some(transport) = self.transport_by_addr(addr).await {
                    self.send_subscribes_and_response(&transport).await;
                }
            }
        }
    }

    pub async fn blacklist_tick(&self) {
        self.inner.write().await.blacklist.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::EmptyAttester;
    use crate::peer::{MockDialer, MockPeerTransport};
    use crate::witness::KeyChainWitnesser;
    use crate::wire::TYPE_SUBSCRIBE;
    use mockall::predicate::eq;

    const SELF_PK: [u8; 32] = [99; 32];

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 1000 + n as u16))
    }

    fn pk(n: u8) -> [u8; 32] {
        [n; 32]
    }

    type SentFrames = Arc<Mutex<Vec<Vec<u8>>>>;

    /// a peer transport that records every framed send
    fn recording_transport(peer_addr: SocketAddr, peer_pk: [u8; 32]) -> (MockPeerTransport, SentFrames) {
        let mut mock = MockPeerTransport::new();
        let sent: SentFrames = Arc::new(Mutex::new(Vec::new()));
        let sent_clone = sent.clone();

        mock.expect_dst_addr().return_const(peer_addr);
        mock.expect_remote_static_pk().return_const(peer_pk);
        mock.expect_send_frame().returning(move |frame| {
            sent_clone.lock().unwrap().push(frame.to_vec());
            Ok(())
        });
        (mock, sent)
    }

    fn passive_delegate(channels: Vec<u16>) -> MockPubSubDelegate {
        let mut delegate = MockPubSubDelegate::new();
        delegate.expect_channels().return_const(channels);
        delegate.expect_should_accept().return_const(true);
        delegate.expect_on_close().return_const(());
        delegate.expect_manage_subscriptions().returning(|_, _, _| vec![]);
        delegate
    }

    fn test_node(config: NodeConfig, delegate: MockPubSubDelegate) -> Arc<PubSubNode> {
        PubSubNode::new(
            config,
            Arc::new(delegate),
            Arc::new(EmptyAttester),
            Arc::new(KeyChainWitnesser::new(SELF_PK)),
            SELF_PK,
        )
    }

    fn incoming_message(channel: u16, message_id: u64, payload: &[u8], witness_pks: &[[u8; 32]]) -> Vec<u8> {
        let mut frame = vec![TYPE_MESSAGE];
        frame.extend_from_slice(&message_id.to_be_bytes());
        frame.extend_from_slice(&channel.to_be_bytes());
        frame.extend_from_slice(&((witness_pks.len() * 32) as u16).to_be_bytes());
        for witness_pk in witness_pks {
            frame.extend_from_slice(witness_pk);
        }
        frame.extend_from_slice(payload);
        frame
    }

    #[tokio::test]
    async fn test_subscribe_dials_unknown_peer() {
        let node = test_node(NodeConfig::new(2, 2), passive_delegate(vec![7]));

        let mut dialer = MockDialer::new();
        dialer.expect_dial()
            .with(eq(addr(1)), eq(pk(1)))
            .once()
            .returning(|_, _| Ok(()));
        node.set_dialer(Arc::new(dialer));

        node.subscribe(addr(1), pk(1)).await;
    }

    #[tokio::test]
    async fn test_subscribe_blacklisted_is_noop_until_tick() {
        let node = test_node(NodeConfig::new(2, 2), passive_delegate(vec![7]));
        node.inner.write().await.blacklist.insert(addr(1));

        let mut dialer = MockDialer::new();
        dialer.expect_dial()
            .once()
            .returning(|_, _| Ok(()));
        node.set_dialer(Arc::new(dialer));

        // suppressed while blacklisted, dialed after the blacklist tick wiped the entry
        node.subscribe(addr(1), pk(1)).await;
        node.blacklist_tick().await;
        node.subscribe(addr(1), pk(1)).await;
    }

    #[tokio::test]
    async fn test_outbound_transport_subscribes_its_channels() {
        let node = test_node(NodeConfig::new(2, 2), passive_delegate(vec![7, 8]));
        let (transport, sent) = recording_transport(addr(1), pk(1));

        node.on_transport_open(Arc::new(transport), true).await;

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], vec![TYPE_SUBSCRIBE, 0, 7]);
        assert_eq!(sent[1], vec![TYPE_SUBSCRIBE, 0, 8]);
        assert_eq!(sent[2][0], TYPE_RESPONSE);
        assert!(sent[2][2..].starts_with(RESPONSE_SUBSCRIBED));
    }

    #[tokio::test]
    async fn test_slot_cap_demotes_to_standby_and_promotion_refills() {
        let mut delegate = MockPubSubDelegate::new();
        delegate.expect_channels().return_const(vec![7u16]);
        delegate.expect_on_close().return_const(());
        // promote the first standby peer whenever a solicited slot frees up
        delegate.expect_manage_subscriptions()
            .returning(|_, _, standby| standby.iter().copied().take(1).collect());

        let node = test_node(NodeConfig::new(2, 8), delegate);

        let mut ids = Vec::new();
        for n in 1..=4 {
            let (transport, _) = recording_transport(addr(n), pk(n));
            ids.push(node.on_transport_open(Arc::new(transport), true).await);
        }

        {
            let inner = node.inner.read().await;
            assert_eq!(inner.slots.kind_of(ids[0]), Some(SlotKind::Solicited));
            assert_eq!(inner.slots.kind_of(ids[1]), Some(SlotKind::Solicited));
            assert_eq!(inner.slots.kind_of(ids[2]), Some(SlotKind::Standby));
            assert_eq!(inner.slots.kind_of(ids[3]), Some(SlotKind::Standby));
        }

        node.on_transport_closed(addr(2)).await;

        let inner = node.inner.read().await;
        assert!(inner.blacklist.contains(addr(2)));
        assert_eq!(inner.slots.num_solicited(), 2);
        assert_eq!(inner.slots.standby_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_fans_out_with_exclusion() {
        let node = test_node(NodeConfig::new(4, 4), passive_delegate(vec![7]));
        let (excluded, excluded_sent) = recording_transport(addr(1), pk(1));
        let (other, other_sent) = recording_transport(addr(2), pk(2));

        node.on_transport_open(Arc::new(excluded), true).await;
        node.on_transport_open(Arc::new(other), true).await;
        excluded_sent.lock().unwrap().clear();
        other_sent.lock().unwrap().clear();

        let message_id = node.publish(7, b"hello", Some(addr(1))).await;

        assert!(excluded_sent.lock().unwrap().is_empty());
        let other_sent = other_sent.lock().unwrap();
        assert_eq!(other_sent.len(), 1);

        let parsed = MessageFrame::parse(&other_sent[0][1..], &EmptyAttester, &KeyChainWitnesser::new(SELF_PK)).unwrap();
        assert_eq!(parsed.message_id, message_id);
        assert_eq!(parsed.channel, 7);
        assert_eq!(parsed.payload, b"hello");
        // a freshly published message already carries this node on the witness trail
        assert!(witness_contains(parsed.witness, &SELF_PK));
    }

    #[tokio::test]
    async fn test_incoming_message_is_delivered_exactly_once() {
        let mut delegate = passive_delegate(vec![7]);
        delegate.expect_on_message()
            .withf(|channel, message_id, payload, _| *channel == 7 && *message_id == 42 && payload.as_slice() == b"x")
            .once()
            .return_const(());

        let node = test_node(NodeConfig::new(2, 2), delegate);
        let (transport, _) = recording_transport(addr(1), pk(1));
        node.on_transport_open(Arc::new(transport), false).await;

        let frame = incoming_message(7, 42, b"x", &[]);
        node.on_frame(addr(1), &frame).await;
        node.on_frame(addr(1), &frame).await;
    }

    #[tokio::test]
    async fn test_dedup_expires_after_full_ring_revolution() {
        let mut delegate = passive_delegate(vec![7]);
        delegate.expect_on_message()
            .times(2)
            .return_const(());

        let node = test_node(NodeConfig::new(2, 2), delegate);
        let (transport, _) = recording_transport(addr(1), pk(1));
        node.on_transport_open(Arc::new(transport), false).await;

        let frame = incoming_message(7, 42, b"x", &[]);
        node.on_frame(addr(1), &frame).await;

        for _ in 0..256 {
            node.dedup_tick().await;
        }

        node.on_frame(addr(1), &frame).await;
    }

    #[tokio::test]
    async fn test_relay_extends_witness_and_prunes_witnessed_peers() {
        let mut delegate = passive_delegate(vec![7]);
        delegate.expect_on_message()
            .withf(|_, _, _, header| {
                // the delegate sees the witness as it arrived, without our own key
                witness_contains(&header.witness, &pk(3)) && !witness_contains(&header.witness, &SELF_PK)
            })
            .once()
            .return_const(());

        let mut config = NodeConfig::new(4, 4);
        config.enable_relay = true;
        let node = test_node(config, delegate);

        let (source, source_sent) = recording_transport(addr(1), pk(1));
        let (downstream, downstream_sent) = recording_transport(addr(2), pk(2));
        let (witnessed, witnessed_sent) = recording_transport(addr(3), pk(3));

        node.on_transport_open(Arc::new(source), true).await;
        node.on_transport_open(Arc::new(downstream), true).await;
        node.on_transport_open(Arc::new(witnessed), true).await;
        source_sent.lock().unwrap().clear();
        downstream_sent.lock().unwrap().clear();
        witnessed_sent.lock().unwrap().clear();

        // the message already carries peer 3's key on its trail
        node.on_frame(addr(1), &incoming_message(7, 42, b"x", &[pk(3)])).await;

        // the source is excluded, the witnessed peer is pruned, the rest gets the relay
        assert!(source_sent.lock().unwrap().is_empty());
        assert!(witnessed_sent.lock().unwrap().is_empty());

        let downstream_sent = downstream_sent.lock().unwrap();
        assert_eq!(downstream_sent.len(), 1);
        let parsed = MessageFrame::parse(&downstream_sent[0][1..], &EmptyAttester, &KeyChainWitnesser::new(SELF_PK)).unwrap();
        assert_eq!(parsed.message_id, 42);
        assert!(witness_contains(parsed.witness, &pk(3)));
        assert!(witness_contains(parsed.witness, &SELF_PK));
    }

    struct RejectingAttester;
    impl Attester for RejectingAttester {
        fn attestation_size(&self, _: u64, _: u16, _: &[u8], _: &MessageHeader) -> usize {
            0
        }
        fn attest(&self, _: u64, _: u16, _: &[u8], _: &MessageHeader, _: &mut BytesMut) {}
        fn parse_size(&self, _: &[u8]) -> anyhow::Result<usize> {
            Ok(0)
        }
        fn verify(&self, _: u64, _: u16, _: &[u8], _: &[u8]) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_failed_attestation_closes_the_transport() {
        let mut delegate = passive_delegate(vec![7]);
        delegate.expect_on_message().never();

        let node = PubSubNode::new(
            NodeConfig::new(2, 2),
            Arc::new(delegate),
            Arc::new(RejectingAttester),
            Arc::new(KeyChainWitnesser::new(SELF_PK)),
            SELF_PK,
        );

        let (mut transport, _) = recording_transport(addr(1), pk(1));
        transport.expect_close().once().return_const(());
        node.on_transport_open(Arc::new(transport), false).await;

        node.on_frame(addr(1), &incoming_message(7, 42, b"x", &[])).await;

        // the id must not be remembered: a retried delivery is not a duplicate
        assert!(!node.inner.read().await.dedup.contains(42));
    }

    #[tokio::test]
    async fn test_incoming_subscribe_admits_unsolicited() {
        let mut config = NodeConfig::new(2, 2);
        config.accept_unsolicited = true;
        let node = test_node(config, passive_delegate(vec![7]));

        let (transport, sent) = recording_transport(addr(1), pk(1));
        let transport_id = node.on_transport_open(Arc::new(transport), false).await;

        node.on_frame(addr(1), &[TYPE_SUBSCRIBE, 0, 7]).await;

        assert_eq!(node.inner.read().await.slots.kind_of(transport_id), Some(SlotKind::Unsolicited));
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], TYPE_RESPONSE);
        assert!(sent[0][2..].starts_with(RESPONSE_SUBSCRIBED));
    }

    #[tokio::test]
    async fn test_incoming_subscribe_without_capacity_closes() {
        let mut config = NodeConfig::new(2, 0);
        config.accept_unsolicited = true;
        let node = test_node(config, passive_delegate(vec![7]));

        let (mut transport, _) = recording_transport(addr(1), pk(1));
        transport.expect_close().once().return_const(());
        node.on_transport_open(Arc::new(transport), false).await;

        node.on_frame(addr(1), &[TYPE_SUBSCRIBE, 0, 7]).await;
    }

    #[tokio::test]
    async fn test_incoming_subscribe_from_blacklisted_peer_promotes() {
        let mut config = NodeConfig::new(2, 2);
        config.accept_unsolicited = true;
        let node = test_node(config, passive_delegate(vec![7]));

        let (transport, sent) = recording_transport(addr(1), pk(1));
        let transport_id = node.on_transport_open(Arc::new(transport), false).await;
        node.inner.write().await.blacklist.insert(addr(1));

        node.on_frame(addr(1), &[TYPE_SUBSCRIBE, 0, 7]).await;

        let inner = node.inner.read().await;
        assert_eq!(inner.slots.kind_of(transport_id), Some(SlotKind::Solicited));
        assert!(!inner.blacklist.contains(addr(1)));
        // a full (re)subscription: SUBSCRIBE frames plus the response
        assert_eq!(sent.lock().unwrap()[0], vec![TYPE_SUBSCRIBE, 0, 7]);
    }

    #[tokio::test]
    async fn test_responses_fire_delegate_callbacks() {
        let mut delegate = passive_delegate(vec![7]);
        delegate.expect_on_subscribe().with(eq(7u16)).once().return_const(());
        delegate.expect_on_unsubscribe().with(eq(7u16)).once().return_const(());

        let node = test_node(NodeConfig::new(2, 2), delegate);
        let (transport, _) = recording_transport(addr(1), pk(1));
        node.on_transport_open(Arc::new(transport), false).await;

        let mut subscribed = vec![TYPE_RESPONSE, 1];
        subscribed.extend_from_slice(RESPONSE_SUBSCRIBED);
        subscribed.extend_from_slice(b" trailing bytes are opaque");
        node.on_frame(addr(1), &subscribed).await;

        let mut unsubscribed = vec![TYPE_RESPONSE, 1];
        unsubscribed.extend_from_slice(RESPONSE_UNSUBSCRIBED);
        node.on_frame(addr(1), &unsubscribed).await;
    }

    #[tokio::test]
    async fn test_heartbeats_reach_solicited_and_standby_only() {
        let node = test_node(NodeConfig::new(1, 2), passive_delegate(vec![7]));

        let (solicited, solicited_sent) = recording_transport(addr(1), pk(1));
        let (standby, standby_sent) = recording_transport(addr(2), pk(2));
        let mut unsolicited = MockPeerTransport::new();
        unsolicited.expect_dst_addr().return_const(addr(3));
        unsolicited.expect_remote_static_pk().return_const(pk(3));
        unsolicited.expect_send_frame().never();

        node.on_transport_open(Arc::new(solicited), true).await;
        node.on_transport_open(Arc::new(standby), true).await;
        let unsolicited_id = node.on_transport_open(Arc::new(unsolicited), false).await;
        node.inner.write().await.slots.admit_unsolicited(unsolicited_id);

        solicited_sent.lock().unwrap().clear();
        standby_sent.lock().unwrap().clear();

        node.dedup_tick().await;

        assert_eq!(solicited_sent.lock().unwrap().as_slice(), &[vec![TYPE_HEARTBEAT]]);
        assert_eq!(standby_sent.lock().unwrap().as_slice(), &[vec![TYPE_HEARTBEAT]]);
    }

    #[tokio::test]
    async fn test_is_healthy() {
        let node = test_node(NodeConfig::new(2, 2), passive_delegate(vec![7]));
        assert!(!node.is_healthy().await);

        let (transport, _) = recording_transport(addr(1), pk(1));
        node.on_transport_open(Arc::new(transport), true).await;
        assert!(node.is_healthy().await);

        node.on_transport_closed(addr(1)).await;
        assert!(!node.is_healthy().await);
    }

    //---------------- cut-through routing ----------------//

    struct CutThroughRecorder {
        chunks: Arc<Mutex<Vec<Vec<u8>>>>,
        ended: Arc<Mutex<bool>>,
    }

    fn cut_through_transport(
        peer_addr: SocketAddr,
        peer_pk: [u8; 32],
        assigned_stream: u16,
    ) -> (MockPeerTransport, CutThroughRecorder) {
        let mut mock = MockPeerTransport::new();
        let recorder = CutThroughRecorder {
            chunks: Arc::new(Mutex::new(Vec::new())),
            ended: Arc::new(Mutex::new(false)),
        };

        mock.expect_dst_addr().return_const(peer_addr);
        mock.expect_remote_static_pk().return_const(peer_pk);
        mock.expect_cut_through_send_start().returning(move |_| assigned_stream);

        let chunks = recorder.chunks.clone();
        mock.expect_cut_through_send_bytes().returning(move |_, chunk| {
            chunks.lock().unwrap().push(chunk.to_vec());
            Ok(())
        });
        let ended = recorder.ended.clone();
        mock.expect_cut_through_send_end().returning(move |_| {
            *ended.lock().unwrap() = true;
        });

        (mock, recorder)
    }

    fn transfer_header(message_id: u64, channel: u16, witness_pks: &[[u8; 32]]) -> Vec<u8> {
        incoming_message(channel, message_id, &[], witness_pks)
    }

    #[tokio::test]
    async fn test_cut_through_fanout_rewrites_the_witness() {
        let mut delegate = passive_delegate(vec![7]);
        // the local delegate sees the assembled message once, with the witness as it arrived
        delegate.expect_on_message()
            .withf(|channel, message_id, payload, header| {
                *channel == 7 && *message_id == 42
                    && payload.as_slice() == b"body starts here and continues"
                    && witness_contains(&header.witness, &pk(1))
                    && !witness_contains(&header.witness, &SELF_PK)
            })
            .once()
            .return_const(());
        let node = test_node(NodeConfig::new(4, 4), delegate);

        let (ingress, _) = recording_transport(addr(1), pk(1));
        node.on_transport_open(Arc::new(ingress), true).await;

        let (egress, recorder) = cut_through_transport(addr(2), pk(2), 9);
        node.on_transport_open(Arc::new(egress), true).await;

        let mut first_chunk = transfer_header(42, 7, &[pk(1)]);
        first_chunk.extend_from_slice(b"body starts here");
        let total_len = (first_chunk.len() + 100) as u64;

        node.cut_through_recv_start(addr(1), 5, total_len).await;
        node.cut_through_recv_bytes(addr(1), 5, &first_chunk).await.unwrap();
        node.cut_through_recv_bytes(addr(1), 5, b" and continues").await.unwrap();
        node.cut_through_recv_end(addr(1), 5).await;

        let chunks = recorder.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 3);
        // the forwarded header carries the extended witness trail
        let forwarded = parse_transfer_header(&chunks[0]).unwrap();
        assert_eq!(forwarded.message_id, 42);
        assert_eq!(forwarded.channel, 7);
        assert!(forwarded.witness_contains(&pk(1)));
        assert!(forwarded.witness_contains(&SELF_PK));
        assert_eq!(chunks[1], b"body starts here");
        assert_eq!(chunks[2], b" and continues");
        assert!(*recorder.ended.lock().unwrap());
    }

    #[tokio::test]
    async fn test_cut_through_duplicate_is_skipped_at_the_ingress() {
        let node = test_node(NodeConfig::new(4, 4), passive_delegate(vec![7]));

        let (mut ingress, _) = recording_transport(addr(1), pk(1));
        ingress.expect_cut_through_send_skip().with(eq(5u16)).once().return_const(());
        node.on_transport_open(Arc::new(ingress), true).await;

        let (egress, recorder) = cut_through_transport(addr(2), pk(2), 9);
        node.on_transport_open(Arc::new(egress), true).await;

        node.inner.write().await.dedup.insert(42);

        node.cut_through_recv_start(addr(1), 5, 1000).await;
        node.cut_through_recv_bytes(addr(1), 5, &transfer_header(42, 7, &[])).await.unwrap();

        // the session is gone and later bytes are drained silently
        node.cut_through_recv_bytes(addr(1), 5, b"tail").await.unwrap();
        assert!(recorder.chunks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cut_through_prunes_witnessed_egress() {
        let node = test_node(NodeConfig::new(4, 4), passive_delegate(vec![7]));

        let (ingress, _) = recording_transport(addr(1), pk(1));
        node.on_transport_open(Arc::new(ingress), true).await;

        let mut witnessed = MockPeerTransport::new();
        witnessed.expect_dst_addr().return_const(addr(3));
        witnessed.expect_remote_static_pk().return_const(pk(3));
        witnessed.expect_cut_through_send_start().never();
        node.on_transport_open(Arc::new(witnessed), true).await;

        node.cut_through_recv_start(addr(1), 5, 1000).await;
        node.cut_through_recv_bytes(addr(1), 5, &transfer_header(42, 7, &[pk(3)])).await.unwrap();
    }

    #[tokio::test]
    async fn test_cut_through_header_must_arrive_complete() {
        let node = test_node(NodeConfig::new(4, 4), passive_delegate(vec![7]));
        let (ingress, _) = recording_transport(addr(1), pk(1));
        node.on_transport_open(Arc::new(ingress), true).await;

        // the witness length declares 32 key bytes that are not in the first chunk
        let mut truncated = transfer_header(42, 7, &[pk(9)]);
        truncated.truncate(20);

        node.cut_through_recv_start(addr(1), 5, 1000).await;
        assert!(node.cut_through_recv_bytes(addr(1), 5, &truncated).await.is_err());
    }

    #[tokio::test]
    async fn test_ingress_close_flushes_open_sessions() {
        let node = test_node(NodeConfig::new(4, 4), passive_delegate(vec![7]));

        let (ingress, _) = recording_transport(addr(1), pk(1));
        node.on_transport_open(Arc::new(ingress), true).await;

        let (mut egress, recorder) = cut_through_transport(addr(2), pk(2), 9);
        egress.expect_cut_through_send_flush().with(eq(9u16)).once().return_const(());
        node.on_transport_open(Arc::new(egress), true).await;

        node.cut_through_recv_start(addr(1), 5, 1000).await;
        node.cut_through_recv_bytes(addr(1), 5, &transfer_header(42, 7, &[])).await.unwrap();
        assert!(!recorder.chunks.lock().unwrap().is_empty());

        node.on_transport_closed(addr(1)).await;
    }

    #[tokio::test]
    async fn test_egress_skip_removes_the_subscriber() {
        let node = test_node(NodeConfig::new(4, 4), passive_delegate(vec![7]));

        let (ingress, _) = recording_transport(addr(1), pk(1));
        node.on_transport_open(Arc::new(ingress), true).await;

        let (egress, recorder) = cut_through_transport(addr(2), pk(2), 9);
        node.on_transport_open(Arc::new(egress), true).await;

        node.cut_through_recv_start(addr(1), 5, 1000).await;
        node.cut_through_recv_bytes(addr(1), 5, &transfer_header(42, 7, &[])).await.unwrap();

        node.cut_through_send_skipped(addr(2), 9).await;
        node.cut_through_recv_bytes(addr(1), 5, b"more").await.unwrap();

        // only the header was forwarded, nothing after the skip
        assert_eq!(recorder.chunks.lock().unwrap().len(), 1);
    }
}
