// src/pipeline/tracker.rs

use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// The kinds of work the tracker counts. Only used for tracing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkKind {
    Discovery,
    File,
    Row,
    Validation,
    Header,
}

impl WorkKind {
    pub fn as_str(&self) -> &str {
        match self {
            WorkKind::Discovery => "discovery",
            WorkKind::File => "file",
            WorkKind::Row => "row",
            WorkKind::Validation => "validation",
            WorkKind::Header => "header",
        }
    }
}

/// Counts outstanding units of work and wakes waiters when none remain.
///
/// Every unit is a [`WorkGuard`]; dropping the guard completes the unit, so
/// a unit finishes exactly once even when its task bails out early.
#[derive(Clone)]
pub struct WorkTracker {
    pending: Arc<watch::Sender<usize>>,
}

impl Default for WorkTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0usize);
        Self {
            pending: Arc::new(tx),
        }
    }

    /// Register one unit of work.
    pub fn register(&self, kind: WorkKind) -> WorkGuard {
        self.pending.send_modify(|n| *n += 1);
        trace!(kind = kind.as_str(), pending = *self.pending.borrow(), "work registered");
        WorkGuard {
            pending: Arc::clone(&self.pending),
            kind,
        }
    }

    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Resolve once the count reaches zero.
    pub async fn wait_idle(&self) {
        let mut rx = self.pending.subscribe();
        // the sender lives in `self`, so the channel cannot close under us
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// One outstanding unit of work. Completes on drop.
#[must_use = "dropping the guard completes the work immediately"]
pub struct WorkGuard {
    pending: Arc<watch::Sender<usize>>,
    kind: WorkKind,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
        trace!(kind = self.kind.as_str(), "work completed");
    }
}
