//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the body of DESCRIBE responses:
//!
//! ```text
//! v=0
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>
//! s=<session-name>
//! c=IN IP4 <addr>
//! t=0 0
//! a=tool:camcast
//! a=type:broadcast
//! a=range:npt=now-
//! a=sendonly
//! m=video 0 RTP/AVP 96
//! a=rtpmap:96 H264/90000
//! a=fmtp:96 packetization-mode=1;profile-level-id=...;sprop-parameter-sets=...
//! a=control:track1
//! ```

use std::net::IpAddr;

use crate::session::MediaDescription;

/// Origin and session fields of the SDP body.
#[derive(Debug, Clone)]
pub struct SdpOrigin<'a> {
    pub address: &'a str,
    pub session_id: &'a str,
    pub session_version: &'a str,
    pub username: &'a str,
    pub session_name: &'a str,
}

/// Generate an SDP session description for one mount's media.
pub fn generate_sdp(media: &MediaDescription, origin: &SdpOrigin<'_>) -> String {
    let family = match origin.address.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => "IP6",
        _ => "IP4",
    };

    let mut sdp: Vec<String> = vec![
        "v=0".to_string(),
        format!(
            "o={} {} {} IN {} {}",
            origin.username, origin.session_id, origin.session_version, family, origin.address
        ),
        format!("s={}", origin.session_name),
        format!("c=IN {} {}", family, origin.address),
        "t=0 0".to_string(),
        "a=tool:camcast".to_string(),
        "a=type:broadcast".to_string(),
        "a=range:npt=now-".to_string(),
        "a=sendonly".to_string(),
        format!("m=video 0 RTP/AVP {}", media.payload_type),
    ];
    sdp.extend(media.attributes.iter().cloned());

    tracing::trace!(mount = media.mount.path(), "SDP: {}", sdp.join(" | "));

    format!("{}\r\n", sdp.join("\r\n"))
}
