//! Completion event queue.
//!
//! Interrupt-context byte handlers enqueue a small tag (which stream
//! finished a line, or that the modem issued its deferred-send prompt)
//! and the cooperative event loop dispatches the tag to the matching
//! `process()` at task level. The queue is bounded; the sizing rule is
//! the worst case of an ISR delivering a full line per stream while a
//! handler is busy.

use std::collections::VecDeque;

use log::warn;

use crate::cmdbuf::Stream;

/// Queue depth, sized for a burst of completions from every stream.
pub const QUEUE_CAPACITY: usize = 40;

/// Bounded FIFO of stream-completion tags.
pub struct EventQueue {
    queue: VecDeque<Stream>,
    dropped: u32,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::with_capacity(QUEUE_CAPACITY),
            dropped: 0,
        }
    }

    /// Enqueue a completion. Full queues drop the event and count it;
    /// the watchdog recovers whatever state machine starves as a
    /// result.
    pub fn enqueue(&mut self, stream: Stream) {
        if self.queue.len() >= QUEUE_CAPACITY {
            self.dropped += 1;
            warn!("event queue full, dropped {:?} completion", stream);
            return;
        }
        self.queue.push_back(stream);
    }

    pub fn dequeue(&mut self) -> Option<Stream> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
