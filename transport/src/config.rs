use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::packet_header::PacketHeader;

/// Configuration shared by all connections of an [`EndPoint`](crate::end_point::EndPoint).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub self_addr: SocketAddr,

    /// This is the payload size inside UDP packets that the transport assumes. The transport
    ///  enforces non-fragmentation of packets, so this size (and the implied packet size) must be
    ///  supported by all network routes between nodes.
    ///
    /// With full Ethernet frames and no optional IP headers, this is `1500 - 20 - 8 = 1472`
    ///  for IPV4 and `1500 - 40 - 8 = 1452` for IPV6. Choosing this value too big causes packets
    ///  to be dropped; choosing it too small wastes bandwidth.
    pub payload_size_inside_udp: usize,

    /// The number of send buffers pooled at a given time - buffers in excess of this number are
    ///  discarded when they are returned.
    pub buffer_pool_size: usize,

    /// 32-byte key for packet-level AES-256-GCM. `None` disables encryption, which is meant for
    ///  debugging only.
    pub encryption_key: Option<Vec<u8>>,

    /// This node's x25519 static secret. The corresponding public key is exchanged during the
    ///  connection handshake and identifies the node to the layers above.
    pub static_secret: [u8; 32],

    /// per-stream cap on unacknowledged packets held for retransmission
    pub send_window_size: u32,

    /// per-stream cap on buffered out-of-order bytes; packets beyond it are dropped unacknowledged
    pub receive_window_bytes: usize,

    pub initial_rto: Duration,
    pub max_rto: Duration,
    /// retransmitting the same packet this many times without an ACK closes the connection
    pub max_retransmits: u32,

    /// Connections with no inbound traffic for twice this interval are closed as idle. The layer
    ///  above is expected to produce traffic (e.g. heartbeats) at this interval.
    pub heartbeat_interval: Duration,

    /// upper bound on concurrently open outgoing cut-through streams per connection
    pub max_cut_through_streams: usize,

    /// Cut-through sends do not block; instead they fail once this many bytes are queued behind
    ///  the congestion window. The caller is expected to close the affected stream.
    pub max_send_backlog_bytes: usize,
}

impl TransportConfig {
    pub fn new(self_addr: SocketAddr, encryption_key: Option<Vec<u8>>, static_secret: [u8; 32]) -> TransportConfig {
        TransportConfig {
            self_addr,
            payload_size_inside_udp: 1472,
            buffer_pool_size: 4096,
            encryption_key,
            static_secret,
            send_window_size: 1024,
            receive_window_bytes: 4 * 1024 * 1024,
            initial_rto: Duration::from_secs(1),
            max_rto: Duration::from_secs(64),
            max_retransmits: 10,
            heartbeat_interval: Duration::from_secs(10),
            max_cut_through_streams: 256,
            max_send_backlog_bytes: 16 * 1024 * 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.payload_size_inside_udp < 100 {
            bail!("payload size is too small");
        }
        if let Some(key) = &self.encryption_key {
            if key.len() != 32 {
                bail!("encryption key must be 32 bytes, was {}", key.len());
            }
        }
        if self.send_window_size < 2 {
            bail!("send window must hold at least two packets");
        }
        if self.max_retransmits == 0 {
            bail!("at least one retransmission attempt is required");
        }
        if self.initial_rto > self.max_rto {
            bail!("initial RTO exceeds the RTO cap");
        }

        Ok(())
    }

    /// number of stream payload bytes that fit into one packet after envelope and header
    pub fn max_payload_per_packet(&self, envelope_overhead: usize) -> usize {
        self.payload_size_inside_udp - envelope_overhead - PacketHeader::SERIALIZED_LEN
    }
}
