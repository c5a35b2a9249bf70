use std::collections::VecDeque;
use std::io::{self, Read};

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::Packetizer;
use super::rtp::{RTP_HEADER_LEN, RtpHeader};

const DEFAULT_MTU: usize = 1400;

/// 90 kHz media clock for H.264 (RFC 6184 §8.1).
pub const H264_CLOCK_RATE: u32 = 90_000;

const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_FU_A: u8 = 28;

/// Frames H.264 access units into RTP per RFC 6184.
///
/// NAL units no larger than the MTU travel one per packet (single NAL unit
/// mode). Bigger ones are cut into FU-A fragments:
///
/// ```text
/// byte 0   indicator  F | NRI | 28
/// byte 1   header     S | E | R | nal type
/// byte 2.. slice of the NAL payload, at most MTU - 2 bytes
/// ```
///
/// SPS/PPS are captured from the bitstream as they pass; the fmtp line then
/// carries `profile-level-id` and `sprop-parameter-sets`.
///
/// ## Parameter set insertion
///
/// `config_interval` mirrors the `config-interval` property of the
/// payloader stage:
///
/// - `0`: never insert SPS/PPS.
/// - `-1`: insert before every IDR that does not already carry them.
/// - `n > 0`: insert before an IDR when at least `n` seconds of media clock
///   have passed since parameter sets were last sent.
///
/// Late joiners on a shared mount depend on this to decode from the next
/// keyframe.
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    mtu: usize,
    config_interval: i32,
    last_parameter_sets: Option<u32>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl H264Packetizer {
    /// Fixed payload type and SSRC, for deterministic output.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self::with_header(RtpHeader::new(pt, ssrc))
    }

    /// Create with random SSRC, sequence and timestamp origin (RFC 3550 §5.1).
    pub fn randomized(pt: u8) -> Self {
        Self::with_header(RtpHeader::randomized(pt))
    }

    fn with_header(header: RtpHeader) -> Self {
        Self {
            header,
            mtu: DEFAULT_MTU,
            config_interval: 0,
            last_parameter_sets: None,
            sps: None,
            pps: None,
        }
    }

    pub fn with_config_interval(mut self, config_interval: i32) -> Self {
        self.config_interval = config_interval;
        self
    }

    /// `profile-level-id` is the hex of SPS bytes 1..4 (profile, constraints, level).
    fn profile_level_id(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        if sps.len() < 4 {
            return None;
        }
        Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
    }

    fn sprop_parameter_sets(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        let pps = self.pps.as_deref()?;
        Some(format!(
            "{},{}",
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        ))
    }

    fn should_insert_parameter_sets(&self) -> bool {
        match self.config_interval {
            0 => false,
            i if i < 0 => true,
            secs => match self.last_parameter_sets {
                None => true,
                Some(last) => {
                    let elapsed = self.header.timestamp().wrapping_sub(last);
                    elapsed >= (secs as u32).saturating_mul(H264_CLOCK_RATE)
                }
            },
        }
    }

    /// One NAL unit in, one or more RTP packets out.
    fn packetize_nal(&mut self, nal_unit: &[u8], is_last_nal: bool) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();

        if nal_unit.is_empty() {
            return packets;
        }

        if nal_unit.len() <= self.mtu {
            let hdr = self.header.write(is_last_nal);
            let mut packet = Vec::with_capacity(RTP_HEADER_LEN + nal_unit.len());
            packet.extend_from_slice(&hdr);
            packet.extend_from_slice(nal_unit);
            packets.push(packet);
            return packets;
        }

        let nal_header = nal_unit[0];
        let nal_type = nal_header & 0x1f;
        let fu_indicator = (nal_header & 0x60) | NAL_FU_A;
        let max_fragment = self.mtu - 2;

        let mut chunks = nal_unit[1..].chunks(max_fragment).peekable();
        let mut first = true;
        while let Some(chunk) = chunks.next() {
            let last_fragment = chunks.peek().is_none();
            let start_bit = if first { 0x80 } else { 0x00 };
            let end_bit = if last_fragment { 0x40 } else { 0x00 };

            let hdr = self.header.write(is_last_nal && last_fragment);
            let mut packet = Vec::with_capacity(RTP_HEADER_LEN + 2 + chunk.len());
            packet.extend_from_slice(&hdr);
            packet.push(fu_indicator);
            packet.push(start_bit | end_bit | nal_type);
            packet.extend_from_slice(chunk);
            packets.push(packet);
            first = false;
        }

        tracing::trace!(
            nal_type,
            nal_size = nal_unit.len(),
            fragments = packets.len(),
            "NAL split into FU-A fragments"
        );

        packets
    }

    /// Split an Annex B byte stream on its start codes.
    ///
    /// Handles both 4-byte `00 00 00 01` and 3-byte `00 00 01` start codes,
    /// mixed within one buffer. Bytes before the first start code are
    /// ignored.
    pub fn extract_nal_units(data: &[u8]) -> Vec<Vec<u8>> {
        let mut nal_units = Vec::new();
        let Some((first, first_len)) = find_start_code(data, 0) else {
            return nal_units;
        };

        let mut start = first + first_len;
        while let Some((next, len)) = find_start_code(data, start) {
            if start < next {
                nal_units.push(data[start..next].to_vec());
            }
            start = next + len;
        }
        if start < data.len() {
            nal_units.push(data[start..].to_vec());
        }

        nal_units
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>> {
        let mut nal_units = Self::extract_nal_units(encoded_data);
        let mut has_parameter_sets = false;
        let mut has_idr = false;

        for nal in &nal_units {
            match nal[0] & 0x1f {
                NAL_SPS => {
                    has_parameter_sets = true;
                    if self.sps.as_deref() != Some(nal.as_slice()) {
                        tracing::debug!(bytes = nal.len(), "H.264 SPS captured");
                        self.sps = Some(nal.clone());
                    }
                }
                NAL_PPS => {
                    if self.pps.as_deref() != Some(nal.as_slice()) {
                        tracing::debug!(bytes = nal.len(), "H.264 PPS captured");
                        self.pps = Some(nal.clone());
                    }
                }
                NAL_IDR => has_idr = true,
                _ => {}
            }
        }

        if has_parameter_sets {
            self.last_parameter_sets = Some(self.header.timestamp());
        } else if has_idr
            && self.should_insert_parameter_sets()
            && let (Some(sps), Some(pps)) = (self.sps.clone(), self.pps.clone())
        {
            nal_units.insert(0, pps);
            nal_units.insert(0, sps);
            self.last_parameter_sets = Some(self.header.timestamp());
            tracing::trace!("SPS/PPS inserted before IDR");
        }

        let mut packets = Vec::new();
        let nal_count = nal_units.len();
        for (i, nal) in nal_units.iter().enumerate() {
            packets.append(&mut self.packetize_nal(nal, i + 1 == nal_count));
        }

        self.header.advance_timestamp(timestamp_increment);

        tracing::trace!(
            nal_count,
            rtp_packets = packets.len(),
            frame_bytes = encoded_data.len(),
            seq = self.header.sequence(),
            "frame packetized"
        );

        packets
    }

    fn codec_name(&self) -> &'static str {
        "H264"
    }

    fn clock_rate(&self) -> u32 {
        H264_CLOCK_RATE
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    /// `rtpmap` and `fmtp` lines (RFC 6184 §8.2.1). `sprop-parameter-sets` appears once SPS and PPS have been seen.
    ///
    /// `a=rtpmap` MUST precede the `a=fmtp` line that references its payload
    /// type; ffplay parses attributes in order.
    fn sdp_attributes(&self) -> Vec<String> {
        let mut fmtp = format!("a=fmtp:{} packetization-mode=1", self.header.pt);
        if let Some(pl) = self.profile_level_id() {
            fmtp.push_str(&format!(";profile-level-id={}", pl));
        }
        if let Some(sprop) = self.sprop_parameter_sets() {
            fmtp.push_str(&format!(";sprop-parameter-sets={}", sprop));
        }

        vec![
            format!(
                "a=rtpmap:{} {}/{}",
                self.payload_type(),
                self.codec_name(),
                self.clock_rate()
            ),
            fmtp,
            "a=control:track1".to_string(),
        ]
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    fn next_rtp_timestamp(&self) -> u32 {
        self.header.timestamp()
    }
}

/// Locate the next Annex B start code at or after `from`.
///
/// Returns the start code offset and its length (3 or 4).
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if data[i + 2] == 0 && data.get(i + 3) == Some(&1) {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

const READ_CHUNK: usize = 64 * 1024;

/// Splits an H.264 Annex B byte stream into access units.
///
/// Pipe output carries no frame boundaries, so they are recovered from the
/// NAL sequence (H.264 §7.4.1.2.3): a new access unit begins at an AUD,
/// SEI, SPS or PPS that follows a slice, or at a slice whose
/// `first_mb_in_slice` is zero. Each access unit is returned re-framed with
/// 4-byte start codes, ready for [`H264Packetizer`].
pub struct AccessUnitReader<R> {
    inner: R,
    chunk: Vec<u8>,
    buf: Vec<u8>,
    scan_from: usize,
    current: Vec<Vec<u8>>,
    current_has_slice: bool,
    ready: VecDeque<Vec<u8>>,
    eof: bool,
}

impl<R: Read> AccessUnitReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            chunk: vec![0; READ_CHUNK],
            buf: Vec::new(),
            scan_from: 0,
            current: Vec::new(),
            current_has_slice: false,
            ready: VecDeque::new(),
            eof: false,
        }
    }

    /// Block until the next complete access unit. `Ok(None)` at end of stream.
    pub fn next_access_unit(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(au) = self.ready.pop_front() {
                return Ok(Some(au));
            }
            if self.eof {
                return Ok(None);
            }

            let n = match self.inner.read(&mut self.chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            if n == 0 {
                self.eof = true;
                self.finish();
            } else {
                self.buf.extend_from_slice(&self.chunk[..n]);
                self.drain_complete_nals();
            }
        }
    }

    fn drain_complete_nals(&mut self) {
        let Some((first, first_len)) = find_start_code(&self.buf, 0) else {
            // A start code may straddle two reads.
            let keep = self.buf.len().min(3);
            self.buf.drain(..self.buf.len() - keep);
            self.scan_from = 0;
            return;
        };

        let mut last_code = first;
        let mut nal_start = first + first_len;
        let mut search = self.scan_from.max(nal_start);
        while let Some((next, len)) = find_start_code(&self.buf, search) {
            let nal = self.buf[nal_start..next].to_vec();
            self.push_nal(nal);
            last_code = next;
            nal_start = next + len;
            search = nal_start;
        }

        self.buf.drain(..last_code);
        let code_len = nal_start - last_code;
        self.scan_from = code_len.max(self.buf.len().saturating_sub(3));
    }

    fn finish(&mut self) {
        if let Some((start, len)) = find_start_code(&self.buf, 0) {
            let nal = self.buf[start + len..].to_vec();
            self.push_nal(nal);
        }
        self.buf.clear();
        self.flush_current();
    }

    fn push_nal(&mut self, nal: Vec<u8>) {
        let Some(&header) = nal.first() else {
            return;
        };
        let nal_type = header & 0x1f;
        let is_slice = (1..=5).contains(&nal_type);
        let begins_access_unit = if is_slice {
            nal.get(1).is_some_and(|b| b & 0x80 != 0)
        } else {
            matches!(nal_type, 6..=9 | 14..=18)
        };

        if self.current_has_slice && begins_access_unit {
            self.flush_current();
        }
        self.current_has_slice |= is_slice;
        self.current.push(nal);
    }

    fn flush_current(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let size = self.current.iter().map(|n| n.len() + 4).sum();
        let mut au = Vec::with_capacity(size);
        for nal in self.current.drain(..) {
            au.extend_from_slice(&[0, 0, 0, 1]);
            au.extend_from_slice(&nal);
        }
        self.current_has_slice = false;
        self.ready.push_back(au);
    }
}
