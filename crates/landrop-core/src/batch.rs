use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(pub u64);

impl BatchId {
    pub fn next() -> Self {
        BatchId(NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

/// Coalesces items that arrive close together.
///
/// Every `offer` pushes the deadline out to `now + window`; once the deadline
/// passes, `take_if_due` hands back everything collected so far and the next
/// offer starts a fresh batch. Time is passed in so the rules can be tested
/// without sleeping.
#[derive(Debug)]
pub struct BatchCollector<T> {
    window: Duration,
    pending: Vec<T>,
    deadline: Option<Instant>,
}

impl<T> BatchCollector<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Vec::new(),
            deadline: None,
        }
    }

    pub fn offer(&mut self, item: T, now: Instant) {
        self.pending.push(item);
        self.deadline = Some(now + self.window);
    }

    /// Remove pending items matching `pred`, e.g. an older offer for the same
    /// file name.
    pub fn remove_where<F>(&mut self, pred: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.pending.len());
        for item in self.pending.drain(..) {
            if pred(&item) {
                removed.push(item);
            } else {
                kept.push(item);
            }
        }
        self.pending = kept;
        if self.pending.is_empty() {
            self.deadline = None;
        }
        removed
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn take_if_due(&mut self, now: Instant) -> Option<Vec<T>> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                Some(std::mem::take(&mut self.pending))
            }
            _ => None,
        }
    }
}
