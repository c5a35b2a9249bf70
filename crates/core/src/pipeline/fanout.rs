//! Distribution of one pipeline's output to many sessions.
//!
//! Each subscriber owns a bounded FIFO. Publishing never blocks: when a
//! subscriber's queue is full its oldest frame is dropped and counted, so a
//! stalled client lags behind instead of holding up the producer or the
//! other clients. Frames are shared behind `Arc`, never copied.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// One packetized access unit.
#[derive(Debug)]
pub struct MediaFrame {
    /// 1-based position in the instance's output.
    pub index: u64,
    /// Complete RTP packets, in send order.
    pub packets: Vec<Vec<u8>>,
}

/// Outcome of [`Subscription::recv_timeout`].
#[derive(Debug)]
pub enum Recv {
    Frame(Arc<MediaFrame>),
    Timeout,
    Closed,
}

#[derive(Default)]
struct QueueState {
    frames: VecDeque<Arc<MediaFrame>>,
    closed: bool,
    dropped: u64,
}

struct FrameQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl FrameQueue {
    fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Publisher side, owned by a pipeline instance.
pub struct FrameBus {
    subscribers: Mutex<Vec<Arc<FrameQueue>>>,
    capacity: usize,
    closed: Mutex<bool>,
}

impl FrameBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            closed: Mutex::new(false),
        }
    }

    /// Attach a new subscriber. It sees every frame published from now on.
    ///
    /// Subscribing to a closed bus yields an already-closed subscription.
    pub fn subscribe(&self) -> Subscription {
        let queue = Arc::new(FrameQueue {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
        });

        let closed = self.closed.lock();
        if *closed {
            queue.state.lock().closed = true;
        } else {
            self.subscribers.lock().push(queue.clone());
        }
        drop(closed);

        Subscription { queue }
    }

    /// Queue a frame for every live subscriber. Returns how many received it.
    pub fn publish(&self, frame: Arc<MediaFrame>) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|q| !q.is_closed());

        for queue in subscribers.iter() {
            let mut state = queue.state.lock();
            if state.frames.len() == self.capacity {
                state.frames.pop_front();
                state.dropped += 1;
                if state.dropped.is_power_of_two() {
                    tracing::debug!(dropped = state.dropped, "slow subscriber lagging");
                }
            }
            state.frames.push_back(frame.clone());
            drop(state);
            queue.ready.notify_one();
        }

        subscribers.len()
    }

    /// Close every subscription and refuse new ones.
    pub fn close(&self) {
        *self.closed.lock() = true;
        for queue in self.subscribers.lock().drain(..) {
            queue.close();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|q| !q.is_closed())
            .count()
    }
}

/// Receiver side, owned by one session.
pub struct Subscription {
    queue: Arc<FrameQueue>,
}

impl Subscription {
    /// Next frame in publish order, waiting at most `timeout`.
    ///
    /// Frames queued before [`close`](Self::close) are discarded.
    pub fn recv_timeout(&self, timeout: Duration) -> Recv {
        let mut state = self.queue.state.lock();
        loop {
            if state.closed {
                return Recv::Closed;
            }
            if let Some(frame) = state.frames.pop_front() {
                return Recv::Frame(frame);
            }
            if self.queue.ready.wait_for(&mut state, timeout).timed_out() {
                return if state.closed {
                    Recv::Closed
                } else {
                    match state.frames.pop_front() {
                        Some(frame) => Recv::Frame(frame),
                        None => Recv::Timeout,
                    }
                };
            }
        }
    }

    /// Detach from the bus. Idempotent; wakes a blocked receiver.
    pub fn close(&self) {
        self.queue.close();
        self.queue.state.lock().frames.clear();
    }

    /// Frames discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.state.lock().dropped
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
