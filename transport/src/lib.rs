//! Reliable, ordered byte streams over an encrypted, lossy, unordered UDP substrate - the
//!  hop-by-hop transport underneath the pub/sub overlay.
//!
//! ## Design goals
//!
//! * The protocol is peer-to-peer: every node has one listening UDP socket that carries all of
//!   its connections, in both directions
//! * A *connection* is a logical peering with one remote endpoint, established by a three-way
//!   handshake and identified by a pair of 32-bit conn ids (one picked by each side). Several
//!   connections can share a UDP port pair.
//! * A connection multiplexes any number of independent *streams* - ordered byte sequences
//!   identified by a 16-bit stream id. Bytes within one stream arrive in order and gap-free;
//!   there is no ordering across streams.
//! * Payloads routinely exceed an MTU and arrive out of order: packets carry an explicit byte
//!   offset within their stream, and receivers reassemble in offset order
//! * Reliability is positive-ACK: every data packet carries a per-connection packet number,
//!   receivers acknowledge what they got, senders retransmit on RTO expiry with exponential
//!   backoff (initial 1s, capped at 64s) and give up on the connection after a bounded number
//!   of retries
//! * A NewReno-style congestion window per connection plus a receive window per stream; the
//!   ordinary send path suspends cooperatively while windows are saturated
//! * *Cut-through* transfers get a dedicated stream per transfer and a non-blocking send path
//!   with a bounded backlog, so a relay can begin forwarding a large message before its tail
//!   has arrived
//! * All packets are sealed as a whole with AES-256-GCM (see [`encryption`])
//!
//! ## Header
//!
//! Packet header (inside the encryption envelope) - all numbers in network byte order (BE):
//! ```ascii
//!  0         1         2         6         10        12        20        28
//! +---------+---------+---------+---------+---------+---------+---------+------+
//! |version=1| type    | src_cid | dst_cid | strm_id | pkt_no  | offset  | len  |
//! | 1B      | 1B      | 4B      | 4B      | 2B      | 8B      | 8B      | 2B   |
//! +---------+---------+---------+---------+---------+---------+---------+------+
//! ```
//!
//! `type` values:
//! ```ascii
//! 0  DATA       stream data at `offset`
//! 1  DATA+FIN   stream data, and the stream ends after this packet
//! 2  ACK        payload lists acknowledged packet numbers (varint count + u64 each)
//! 3  DIAL       handshake step 1, payload is the initiator's 32-byte static public key
//! 4  DIAL_CONF  handshake step 2, payload is the responder's 32-byte static public key
//! 5  CONF       handshake step 3, no payload
//! 6  RESET      abort: the whole connection if strm_id is 0, one stream otherwise
//! ```
//!
//! ## Handshake
//!
//! The initiator sends `DIAL(src_cid=X)`; the responder replies `DIAL_CONF(src_cid=Y,
//!  dst_cid=X)`; the initiator replies `CONF(dst_cid=Y)`. After `CONF` both sides are active.
//!  Handshake packets are resent with the regular RTO backoff; data from the initiator doubles
//!  as an implicit `CONF` so a lost final packet does not stall the connection. `RESET`
//!  unilaterally aborts at any point.
//!
//! The handshake packets carry the peers' x25519 static public keys. The layer above uses
//!  them to identify nodes (e.g. for loop avoidance); the transport itself only transports
//!  them.
//!
//! ## Stream-scoped RESET
//!
//! A RESET with a non-zero stream id aborts just that stream, in either role: sent by the
//!  stream's sender it means "I am abandoning this transfer, discard what you have" (flush);
//!  sent by the receiver it means "stop sending, I do not want the rest" (skip). The receiver
//!  of a stream-scoped RESET tells the roles apart by which side of the stream it holds.
//!
//! ## Failure semantics
//!
//! * RTO exhaustion on any packet closes the connection with reason `Timeout`
//! * protocol violations (bad version, inconsistent conn ids, impossible offsets) answer with
//!   `RESET` and close with reason `ProtocolViolation`
//! * a connection without inbound traffic for twice the heartbeat interval closes as `Idle`

pub mod buffers;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod encryption;
pub mod end_point;
pub mod listener;
pub mod packet_header;
pub mod packet_id;
pub mod rto;
pub mod safe_converter;
pub mod send_pipeline;
mod receive_stream;
mod send_stream;
