//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): RTSP signaling, one thread per connection. Also
//!   carries interleaved RTP (RFC 2326 §10.12) for clients that ask for it.
//! - **UDP** ([`udp`]): one socket shared by all UDP sessions.
//! - **Delivery** ([`delivery`]): one thread per playing session, moving
//!   frames from the session's queue to its sink.

pub(crate) mod delivery;
pub mod tcp;
pub mod udp;

pub use udp::UdpTransport;
