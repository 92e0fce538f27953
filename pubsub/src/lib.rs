//! A gossip pub/sub overlay on top of the reliable stream transport.
//!
//! Nodes subscribe to named 16-bit channels at each other; any node may publish on a channel,
//! and the overlay delivers the message at most once to every connected subscriber, optionally
//! transiting relays. The moving parts:
//!
//! * [`framing`]: one length-prefixed frame per logical message on top of the transport's
//!   byte streams
//! * [`node`]: slot management (solicited / standby / unsolicited peers), message
//!   deduplication, relay forwarding and the periodic timers
//! * [`witness`] / [`attestation`]: the pluggable per-message headers - the witness records
//!   the forwarding path so loops are pruned, the attestation authenticates the message
//!   end to end
//! * [`cut_through`] and the routing parts of [`node`]: large messages are piped from the
//!   ingress transport to all egress transports while still arriving, so relay latency does
//!   not grow with message size
//! * [`link`]: the adapter between the transport's streams and the node
//!
//! ## Composition
//!
//! ```ignore
//! let (node, endpoint) = pubsub::build(transport_config, node_config, delegate,
//!     Arc::new(EmptyAttester), Arc::new(KeyChainWitnesser::new(pk))).await?;
//! tokio::spawn({ let endpoint = endpoint.clone(); async move { endpoint.recv_loop().await } });
//! tokio::spawn({ let node = node.clone(); async move { node.run().await } });
//!
//! node.subscribe(publisher_addr, publisher_pk).await;
//! let message_id = node.publish(channel, payload, None).await;
//! ```

use std::sync::Arc;

use transport::end_point::EndPoint;

pub mod attestation;
pub mod cut_through;
pub mod dedup;
pub mod framing;
pub mod link;
pub mod node;
pub mod peer;
pub mod slots;
pub mod wire;
pub mod witness;

use attestation::Attester;
use link::LinkLayer;
use node::{NodeConfig, PubSubDelegate, PubSubNode};
use witness::Witnesser;

/// Wire up a node with its transport. The caller drives `endpoint.recv_loop()` and
///  `node.run()` on tasks of its own.
pub async fn build(
    transport_config: transport::config::TransportConfig,
    node_config: NodeConfig,
    delegate: Arc<dyn PubSubDelegate>,
    attester: Arc<dyn Attester>,
    witnesser: Arc<dyn Witnesser>,
) -> anyhow::Result<(Arc<PubSubNode>, Arc<EndPoint>)> {
    let link = LinkLayer::new(node_config.frame_prefix_len);
    let endpoint = EndPoint::new(link.clone(), Arc::new(transport_config)).await?;
    let node = PubSubNode::new(node_config, delegate, attester, witnesser, endpoint.self_static_pk());

    link.wire(node.clone(), endpoint.clone());
    node.set_dialer(link);

    Ok((node, endpoint))
}
