//! Batches consecutive inbound frames so the consuming renderer pays reflow
//! cost once per batch instead of once per frame.

use anyhow::Result;
use std::collections::VecDeque;
use std::time::Duration;

use crate::protocol::InboundEvent;

/// Delay between the first push into an empty queue and the flush.
pub const SLURP_FLUSH_DELAY: Duration = Duration::from_millis(1);

/// Result of one flush pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every buffered event was dispatched.
    Complete { dispatched: usize },
    /// Dispatch stopped at an event whose image is still loading; the tail
    /// (starting at that event) stays buffered for the next flush.
    Stalled { dispatched: usize, remaining: usize },
}

/// Ordered buffer of inbound events awaiting batched emission.
#[derive(Debug, Default)]
pub struct SlurpQueue {
    queue: VecDeque<InboundEvent>,
}

impl SlurpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one event. Returns true when the queue was empty, i.e. the
    /// caller should arm the flush timer.
    pub fn push(&mut self, event: InboundEvent) -> bool {
        let was_empty = self.queue.is_empty();
        self.queue.push_back(event);
        was_empty
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Dispatch buffered events in arrival order. A dispatch error is the
    /// caller's to log; it never aborts the rest of the batch. An incomplete
    /// event stops the pass and keeps itself plus everything after it.
    pub fn flush<F>(&mut self, mut dispatch: F) -> FlushOutcome
    where
        F: FnMut(&InboundEvent) -> Result<()>,
    {
        let mut dispatched = 0;
        while matches!(self.queue.front(), Some(event) if event.is_complete()) {
            if let Some(event) = self.queue.pop_front() {
                if let Err(e) = dispatch(&event) {
                    tracing::error!(
                        target = "driftwood::sync",
                        error = %e,
                        msg = %event.text_msg,
                        "error dispatching slurped event"
                    );
                }
                dispatched += 1;
            }
        }
        if self.queue.is_empty() {
            FlushOutcome::Complete { dispatched }
        } else {
            // Stop emitting; restart when the async image loads.
            FlushOutcome::Stalled {
                dispatched,
                remaining: self.queue.len(),
            }
        }
    }
}
