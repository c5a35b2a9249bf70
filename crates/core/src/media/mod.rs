//! RTP packetization of encoded media.
//!
//! The pipeline engine hands over H.264 access units; this module turns them
//! into RTP packets ([`rtp::RtpHeader`] + codec payload) and describes them
//! in SDP.
//!
//! | Codec | Module | RFC |
//! |-------|--------|-----|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |

pub mod h264;
pub mod rtp;

/// Codec-specific RTP packetizer.
///
/// Each payloader stage a descriptor can end with maps onto one
/// implementation of this trait (see
/// [`PayloadFormat::packetizer`](crate::pipeline::PayloadFormat::packetizer)).
pub trait Packetizer: Send {
    /// Packetize one encoded access unit (Annex B) into RTP packets.
    ///
    /// Each returned `Vec<u8>` is a complete RTP packet: 12-byte header
    /// (RFC 3550 §5.1) followed by the codec-specific payload.
    ///
    /// `timestamp_increment` advances the RTP timestamp after this frame,
    /// typically `clock_rate / fps` (3000 for 30 fps at 90 kHz).
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>>;

    /// Codec name for the SDP `a=rtpmap` attribute (e.g. `"H264"`).
    fn codec_name(&self) -> &'static str;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32;

    /// RTP payload type number (RFC 3551).
    fn payload_type(&self) -> u8;

    /// SDP media-level attribute lines, including the `a=` prefix.
    fn sdp_attributes(&self) -> Vec<String>;

    /// Sequence number of the next packet (for the `RTP-Info` header).
    fn next_sequence(&self) -> u16;

    /// RTP timestamp of the next frame (for the `RTP-Info` header).
    fn next_rtp_timestamp(&self) -> u32;
}
