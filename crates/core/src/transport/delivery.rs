use std::time::Duration;

use crate::pipeline::fanout::Recv;
use crate::session::{Session, SessionState};

/// How long a delivery thread waits for a frame before re-checking the
/// session state.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Per-session delivery loop. Runs until the session ends or its client
/// transport breaks.
///
/// The session state lock is held across each frame's writes, so a
/// concurrent teardown waits for the write in flight and nothing is sent
/// after it.
pub(crate) fn run(session: &Session) {
    let mut sent: u64 = 0;
    let mut send_errors: u64 = 0;

    loop {
        let frame = match session.subscription().recv_timeout(POLL_INTERVAL) {
            Recv::Frame(frame) => frame,
            Recv::Timeout => {
                if session.state() == SessionState::TornDown {
                    break;
                }
                continue;
            }
            Recv::Closed => break,
        };

        let state = session.lock_state();
        match *state {
            SessionState::TornDown => break,
            SessionState::Negotiating | SessionState::Paused => continue,
            SessionState::Playing => {}
        }

        for packet in &frame.packets {
            if let Err(e) = session.sink().send(packet) {
                send_errors += 1;
                if session.sink().is_fatal(&e) {
                    session.transport_lost(state, &e);
                    tracing::debug!(session_id = session.id(), frames = sent, "delivery stopped");
                    return;
                }
                if send_errors.is_power_of_two() {
                    tracing::warn!(session_id = session.id(), error = %e, send_errors, "RTP send failed");
                }
            }
        }
        drop(state);

        sent += 1;
        tracing::trace!(session_id = session.id(), frame = frame.index, packets = frame.packets.len(), "frame delivered");
    }

    tracing::debug!(session_id = session.id(), frames = sent, "delivery finished");
}
