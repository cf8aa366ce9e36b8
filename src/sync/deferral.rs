//! Holds message classes that must not be applied before the document layer
//! exists, replaying them in original order once it does.

use anyhow::Result;
use std::mem;
use std::time::Duration;

/// How often the gating predicate is re-polled while messages are buffered.
pub const DEFERRAL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// The fixed, closed set of deferrable line prefixes.
pub const DEFERRED_PREFIXES: [&str; 6] = [
    "window:",
    "celladdress:",
    "cellviewcursor:",
    "statechanged:",
    "invalidatecursor:",
    "viewinfo:",
];

pub fn is_deferred_class(text_msg: &str) -> bool {
    DEFERRED_PREFIXES.iter().any(|p| text_msg.starts_with(p))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredMessage {
    pub text_msg: String,
}

/// Ordered buffer of deferred messages, keyed only by arrival order.
///
/// Order is preserved within the deferred classes across the whole deferral
/// episode. Non-deferred messages arriving during a drain are not specially
/// held, so global order across deferred and non-deferred classes is only
/// preserved when the drain finishes before the next batch is gated.
#[derive(Debug, Default)]
pub struct DeferralBuffer {
    pending: Vec<DeferredMessage>,
    draining: bool,
}

impl DeferralBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this message must be buffered instead of forwarded right now.
    /// Any already-buffered message forces deferral of the whole class, to
    /// avoid interleaving-induced reordering; so does a drain in progress.
    pub fn should_defer(&self, text_msg: &str, ready: bool) -> bool {
        is_deferred_class(text_msg) && (!ready || !self.pending.is_empty() || self.draining)
    }

    pub fn defer(&mut self, text_msg: impl Into<String>) {
        let text_msg = text_msg.into();
        tracing::debug!(target = "driftwood::sync", msg = %text_msg, "deferring message");
        self.pending.push(DeferredMessage { text_msg });
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Drop everything buffered. Used at disconnect: deferred state must not
    /// survive into the next connection.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Forward every captured message in original order once the gating
    /// predicate holds. The buffer is swapped out before iteration, so a
    /// message arriving mid-drain lands in the new list, not this one.
    /// Returns how many messages were forwarded.
    pub fn drain<F>(&mut self, ready: bool, mut forward: F) -> usize
    where
        F: FnMut(&str) -> Result<()>,
    {
        if !ready || self.draining || self.pending.is_empty() {
            return 0;
        }
        let captured = mem::take(&mut self.pending);
        self.draining = true;
        let mut forwarded = 0;
        for message in &captured {
            if let Err(e) = forward(&message.text_msg) {
                tracing::error!(
                    target = "driftwood::sync",
                    error = %e,
                    msg = %message.text_msg,
                    "error replaying deferred message"
                );
            }
            forwarded += 1;
        }
        self.draining = false;
        forwarded
    }
}
