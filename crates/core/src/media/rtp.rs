/// RTP fixed header state (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// One header state belongs to one pipeline instance. Every session fed by
/// that instance sees the same SSRC, sequence space and media clock, which
/// is what keeps a shared mount on a single timeline.
///
/// Version is always 2. Padding, extension and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

/// Size of the fixed header written by [`RtpHeader::write`].
pub const RTP_HEADER_LEN: usize = 12;

impl RtpHeader {
    /// Header state with explicit SSRC, starting at sequence 0 and timestamp 0.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self {
            pt,
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Header state with random SSRC, initial sequence and initial timestamp.
    ///
    /// RFC 3550 §5.1 asks for random initial values so that a restarted
    /// stream cannot be confused with the previous one.
    pub fn randomized(pt: u8) -> Self {
        let header = Self {
            pt,
            ssrc: rand::random(),
            sequence: rand::random(),
            timestamp: rand::random(),
        };
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", header.ssrc),
            seq = header.sequence,
            "RTP header state created"
        );
        header
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Timestamp the next frame will carry.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Serialize a fixed header and advance the sequence number.
    ///
    /// `marker` flags the last packet of an access unit (RFC 6184 §5.1).
    pub fn write(&mut self, marker: bool) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = 2 << 6;
        header[1] = ((marker as u8) << 7) | (self.pt & 0x7f);
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    /// Advance the media clock by one frame duration in clock ticks.
    pub fn advance_timestamp(&mut self, increment: u32) {
        self.timestamp = self.timestamp.wrapping_add(increment);
    }
}

/// Read the sequence number of a serialized RTP packet.
pub fn packet_sequence(packet: &[u8]) -> Option<u16> {
    (packet.len() >= RTP_HEADER_LEN).then(|| u16::from_be_bytes([packet[2], packet[3]]))
}

/// Read the timestamp of a serialized RTP packet.
pub fn packet_timestamp(packet: &[u8]) -> Option<u32> {
    (packet.len() >= RTP_HEADER_LEN)
        .then(|| u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]))
}
