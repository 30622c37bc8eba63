//! Reliable delivery of byte payloads over a deliberately unreliable, simulated network, using
//!  a Go-Back-N sliding-window ARQ protocol.
//!
//! ## Layers
//!
//! ```ascii
//!   application                        application
//!       |  ^                               |  ^
//!   TransportLayer  (Go-Back-N)        TransportLayer
//!       |  ^                               |  ^
//!   NetworkLayer ---- drop / corrupt / delay ---> NetworkLayer
//!                <--------------------------------
//! ```
//!
//! The *network layer* hands each packet to the peer's network layer, unless it decides to drop
//!  it, corrupt its payload or deliver it after a fixed delay (at most one of these per packet).
//!  None of this is ever reported to the sender.
//!
//! The *transport layer* keeps up to `window_size` data packets in flight. ACKs are cumulative:
//!  an ACK for sequence number N moves the window base to N+1. There is a single retransmission
//!  timer per session which is restarted on every ACK progress; when it fires, all outstanding
//!  packets are sent again (go back N). Corrupted packets are detected by their SHA-256 digest
//!  and treated exactly like lost packets, so the timer is the only recovery path.
//!
//! The receiving side has no window of its own: every intact data packet is passed to the
//!  application and acknowledged with its own sequence number, duplicates and reordered packets
//!  included.
//!
//! ## Packet
//!
//! A packet is either a data frame (sequence number + payload) or an ACK frame (sequence number
//!  only), each with a digest computed at construction. See [packet::Packet::ser] for the wire
//!  layout used when a packet needs to leave the process.

pub mod config;
pub mod link;
pub mod network;
pub mod packet;
pub mod test_util;
pub mod transport;
pub mod util;
