//! Single-slot "latest image only" output queue for grab engines.
//!
//! The capture thread overwrites the slot; the consumer side takes whatever is
//! newest. Older frames that were never taken are dropped and counted.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::frame::OwnedFrame;

/// Result of waiting on the slot.
#[derive(Debug)]
pub enum Take {
    Frame(OwnedFrame),
    TimedOut,
    /// The engine was halted while (or before) waiting.
    Halted,
}

#[derive(Debug, Default)]
struct SlotState {
    frame: Option<OwnedFrame>,
    halted: bool,
    discarded: u64,
    delivered: u64,
}

#[derive(Debug, Default)]
pub struct LatestImageSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl LatestImageSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `frame`, replacing (and discarding) any frame not yet taken.
    /// Ignored while halted.
    pub fn put(&self, frame: OwnedFrame) {
        let mut state = self.lock();
        if state.halted {
            return;
        }
        if state.frame.replace(frame).is_some() {
            state.discarded += 1;
        }
        self.ready.notify_all();
    }

    /// Wait up to `timeout` for a frame.
    pub fn take(&self, timeout: Duration) -> Take {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.halted {
                return Take::Halted;
            }
            if let Some(frame) = state.frame.take() {
                state.delivered += 1;
                return Take::Frame(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return Take::TimedOut;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Drop any pending frame and wake waiters. Later `put`s are ignored until `reopen`.
    pub fn halt(&self) {
        let mut state = self.lock();
        state.halted = true;
        state.frame = None;
        self.ready.notify_all();
    }

    pub fn reopen(&self) {
        let mut state = self.lock();
        state.halted = false;
        state.frame = None;
    }

    pub fn is_halted(&self) -> bool {
        self.lock().halted
    }

    pub fn has_frame(&self) -> bool {
        self.lock().frame.is_some()
    }

    /// Frames overwritten before anyone took them.
    pub fn discarded(&self) -> u64 {
        self.lock().discarded
    }

    pub fn delivered(&self) -> u64 {
        self.lock().delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelEncoding;
    use std::sync::Arc;

    fn frame(sequence: u64) -> OwnedFrame {
        OwnedFrame::succeeded(PixelEncoding::Mono8, 1, 1, sequence, vec![sequence as u8])
    }

    #[test]
    fn only_the_newest_frame_is_kept() {
        let slot = LatestImageSlot::new();
        slot.put(frame(1));
        slot.put(frame(2));
        slot.put(frame(3));

        match slot.take(Duration::from_millis(10)) {
            Take::Frame(f) => assert_eq!(f.sequence, 3),
            other => panic!("expected frame, got {other:?}"),
        }
        assert_eq!(slot.discarded(), 2);
        assert!(matches!(
            slot.take(Duration::from_millis(10)),
            Take::TimedOut
        ));
    }

    #[test]
    fn waiting_take_wakes_on_put() {
        let slot = Arc::new(LatestImageSlot::new());
        let producer = slot.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.put(frame(9));
        });

        match slot.take(Duration::from_secs(5)) {
            Take::Frame(f) => assert_eq!(f.sequence, 9),
            other => panic!("expected frame, got {other:?}"),
        }
        handle.join().unwrap();
    }

    #[test]
    fn halt_wakes_waiters_and_rejects_puts() {
        let slot = Arc::new(LatestImageSlot::new());
        let halter = slot.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            halter.halt();
        });

        assert!(matches!(slot.take(Duration::from_secs(5)), Take::Halted));
        handle.join().unwrap();
        assert!(slot.is_halted());

        slot.put(frame(1));
        assert!(!slot.has_frame());

        slot.reopen();
        assert!(!slot.is_halted());
        slot.put(frame(2));
        assert!(slot.has_frame());
    }
}
