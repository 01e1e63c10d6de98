//! Push-buffer transport: latest-wins frame delivery over a watch channel
//!
//! Used when a consumer lives in the same process but cannot bind the shared
//! region. The producer replaces the pending frame on every publish, so a
//! slow consumer only ever sees the newest one.

use tokio::sync::watch;

use super::shared::ReceivedFrame;
use crate::model::Frame;

/// Producer side; cheap to clone
#[derive(Debug, Clone)]
pub struct PushFrameSender {
    tx: watch::Sender<Option<Frame>>,
}

impl PushFrameSender {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Replaces the pending frame. Never blocks.
    pub fn publish(&self, frame: Frame) {
        self.tx.send_replace(Some(frame));
    }

    /// Most recently published frame, if any
    pub fn latest(&self) -> Option<Frame> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> PushFrameReader {
        PushFrameReader {
            rx:       self.tx.subscribe(),
            last_seq: 0,
            dropped:  0,
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for PushFrameSender {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side of a [`PushFrameSender`]
#[derive(Debug)]
pub struct PushFrameReader {
    rx:       watch::Receiver<Option<Frame>>,
    last_seq: u64,
    dropped:  u64,
}

impl PushFrameReader {
    /// Returns the pending frame if it is newer than the last one taken
    pub fn poll(&mut self) -> Option<ReceivedFrame> {
        let frame = self.rx.borrow_and_update().clone()?;
        self.accept(frame)
    }

    /// Waits for the next frame newer than the last one taken
    ///
    /// Returns `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<ReceivedFrame> {
        loop {
            if let Some(received) = self.poll() {
                return Some(received);
            }
            self.rx.changed().await.ok()?;
        }
    }

    fn accept(&mut self, frame: Frame) -> Option<ReceivedFrame> {
        if frame.seq <= self.last_seq {
            return None;
        }
        let queue_depth = frame.seq - self.last_seq - 1;
        self.dropped += queue_depth;
        self.last_seq = frame.seq;
        Some(ReceivedFrame { frame, queue_depth })
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }
}
