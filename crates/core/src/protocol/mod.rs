//! RTSP protocol implementation (RFC 2326).
//!
//! Parsing requests, building responses, the per-connection method state
//! machine, and SDP generation.
//!
//! ```text
//! DESCRIBE rtsp://server/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! ## Supported methods
//!
//! | Method | RFC section | Valid in |
//! |--------|-------------|----------|
//! | OPTIONS | §10.1 | any state |
//! | DESCRIBE | §10.2 | Connected, Described |
//! | SETUP | §10.4 | Described |
//! | PLAY | §10.5 | SetUp |
//! | PAUSE | §10.6 | Playing |
//! | TEARDOWN | §10.7 | SetUp, Playing |
//! | GET_PARAMETER / SET_PARAMETER | §10.8, §10.9 | any state |
//!
//! A method sent out of order is answered `455` and the connection closed.

pub mod handler;
pub mod request;
pub mod response;
pub mod sdp;

pub use handler::{ConnectionState, MethodHandler, PeerLink, Reply};
pub use request::{Method, RtspRequest};
pub use response::RtspResponse;
