//! FIFO correlation of untagged backend completions.
//!
//! Backend completions carry no request id. Each (owner, operation kind)
//! pair therefore keeps its own [`CallbackQueue`]: the continuation is
//! enqueued before the backend call is made, and the completion pops the
//! oldest pending continuation. This is only sound because the backend
//! finishes same-kind calls on one object strictly in issue order.
//!
//! Queues are touched only on the client context, so they need no locking.

use std::collections::VecDeque;

/// Ordered queue of pending continuations for one operation kind.
pub struct CallbackQueue<F> {
    kind: &'static str,
    pending: VecDeque<F>,
}

impl<F> CallbackQueue<F> {
    /// Create an empty queue labelled with its operation kind for logging.
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            pending: VecDeque::new(),
        }
    }

    /// Append a continuation at the tail.
    pub fn enqueue(&mut self, callback: F) {
        self.pending.push_back(callback);
        trace!("{}: enqueued continuation ({} pending)", self.kind, self.pending.len());
    }

    /// Remove and return the oldest continuation.
    ///
    /// `None` means the backend delivered a completion nobody asked for. That
    /// is a backend protocol violation: it is logged and the caller drops the
    /// completion.
    pub fn dequeue(&mut self) -> Option<F> {
        let callback = self.pending.pop_front();
        if callback.is_none() {
            error!(
                "{}: completion arrived with no pending request; discarding it",
                self.kind
            );
        }
        callback
    }

    /// Operation kind this queue serves.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<F> std::fmt::Debug for CallbackQueue<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("kind", &self.kind)
            .field("pending", &self.pending.len())
            .finish()
    }
}
