//! Manually driven futures for asynchronous one-sided operations.
//!
//! An [`AsyncOp`] starts eagerly: the operation is already posted when the
//! future is handed out. The holder drives it by calling [`AsyncOp::resume`]
//! with the owning compute thread; each call performs exactly one
//! non-blocking poll of the operation's lane and, once the completion word
//! drains, gathers the value and releases the staging and slot resources.
//!
//! There is no executor. A future abandoned while pending keeps its
//! resources until the thread's shutdown leak check catches it.

use crate::compute_thread::{ComputeThread, Lane};

/// What a not-yet-completed future is waiting on.
pub(crate) enum Pending {
    /// One posted operation, with its staging chunk when it owns one.
    Single {
        lane: Lane,
        target: u64,
        slot: usize,
        buf: Option<usize>,
    },
    /// A posted sequenced group, waiting on its signaled tail.
    Group {
        target: u64,
        lane_idx: u32,
        group: usize,
        slot: usize,
    },
}

enum Inner<T> {
    Pending {
        op: Pending,
        complete: fn(&mut ComputeThread, Pending) -> T,
    },
    Ready(T),
    Taken,
}

/// A move-only, single-consumer future for one operation or one sequenced
/// group.
pub struct AsyncOp<T> {
    inner: Inner<T>,
}

impl<T> AsyncOp<T> {
    pub(crate) fn pending(op: Pending, complete: fn(&mut ComputeThread, Pending) -> T) -> Self {
        Self {
            inner: Inner::Pending { op, complete },
        }
    }

    /// A future that was satisfied at issue time (local-store writes).
    pub(crate) fn completed(value: T) -> Self {
        Self {
            inner: Inner::Ready(value),
        }
    }

    /// Poll once. `ct` must be the thread that issued the operation.
    pub fn resume(&mut self, ct: &mut ComputeThread) {
        if let Inner::Pending { op, .. } = &self.inner {
            if !ct.poll_pending(op) {
                return;
            }
            let Inner::Pending { op, complete } = std::mem::replace(&mut self.inner, Inner::Taken)
            else {
                unreachable!();
            };
            self.inner = Inner::Ready(complete(ct, op));
        }
    }

    /// Whether the value is available.
    pub fn ready(&self) -> bool {
        matches!(self.inner, Inner::Ready(_))
    }

    /// Take the value. Panics unless [`Self::ready`] holds.
    pub fn value(self) -> T {
        match self.inner {
            Inner::Ready(value) => value,
            _ => panic!("async operation is not ready"),
        }
    }

    /// Drive to completion and take the value.
    pub fn wait(mut self, ct: &mut ComputeThread) -> T {
        while !self.ready() {
            self.resume(ct);
        }
        self.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_futures_are_immediately_ready() {
        let op = AsyncOp::completed(17u64);
        assert!(op.ready());
        assert_eq!(op.value(), 17);
    }

    #[test]
    #[should_panic(expected = "not ready")]
    fn taking_an_unready_value_panics() {
        let op: AsyncOp<u64> = AsyncOp {
            inner: Inner::Taken,
        };
        let _ = op.value();
    }
}
