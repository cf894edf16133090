use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_stream::stream;
use forge_protocol::{FrameStream, SeqId, StreamFrame, conflated_between};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Fans engine frames out to any number of observers.
///
/// Each observer holds a depth-1 slot: a newer frame overwrites one the
/// observer has not read yet, and `emit` never waits on anyone. Observers
/// detect conflation through gaps in `seq_id`.
#[derive(Debug)]
pub struct Broadcaster {
    sender: watch::Sender<Option<StreamFrame>>,
    observers: Arc<AtomicUsize>,
    emitted: AtomicU64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender,
            observers: Arc::new(AtomicUsize::new(0)),
            emitted: AtomicU64::new(0),
        }
    }

    /// Publish a frame. Stored even when nobody is watching.
    pub fn emit(&self, frame: StreamFrame) {
        trace!(seq_id = frame.seq_id, kind = ?frame.kind, "frame emitted");
        self.sender.send_replace(Some(frame));
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// New observer. It receives only frames emitted after this call.
    pub fn subscribe(&self) -> Observer {
        let mut receiver = self.sender.subscribe();
        receiver.mark_unchanged();
        let count = self.observers.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(observers = count, "observer connected");
        Observer {
            receiver,
            observers: self.observers.clone(),
            last_seq: None,
            missed: 0,
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.load(Ordering::SeqCst)
    }

    /// Most recent frame, if any was emitted.
    pub fn latest(&self) -> Option<StreamFrame> {
        self.sender.borrow().clone()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

/// One connected live-feed consumer.
#[derive(Debug)]
pub struct Observer {
    receiver: watch::Receiver<Option<StreamFrame>>,
    observers: Arc<AtomicUsize>,
    last_seq: Option<SeqId>,
    missed: u64,
}

impl Observer {
    /// Wait for the next frame. `None` once the broadcaster is gone.
    pub async fn next(&mut self) -> Option<StreamFrame> {
        loop {
            self.receiver.changed().await.ok()?;
            if let Some(frame) = self.take_current() {
                return Some(frame);
            }
        }
    }

    /// Non-blocking read of an unseen frame.
    pub fn try_next(&mut self) -> Option<StreamFrame> {
        match self.receiver.has_changed() {
            Ok(true) => self.take_current(),
            _ => None,
        }
    }

    fn take_current(&mut self) -> Option<StreamFrame> {
        let frame = self.receiver.borrow_and_update().clone()?;
        if self.last_seq.is_some_and(|last| frame.seq_id <= last) {
            return None;
        }
        if let Some(last) = self.last_seq {
            let gap = conflated_between(last, frame.seq_id);
            if gap > 0 {
                trace!(gap, seq_id = frame.seq_id, "frames conflated");
                self.missed += gap;
            }
        }
        self.last_seq = Some(frame.seq_id);
        Some(frame)
    }

    pub fn last_seq(&self) -> Option<SeqId> {
        self.last_seq
    }

    /// Frames skipped by conflation since this observer connected.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn into_stream(self) -> FrameStream {
        let mut observer = self;
        Box::pin(stream! {
            while let Some(frame) = observer.next().await {
                yield frame;
            }
        })
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        let remaining = self.observers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        debug!(observers = remaining, "observer disconnected");
    }
}
