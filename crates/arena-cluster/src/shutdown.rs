//! Top-down cancellation signal.
//!
//! A [`ShutdownTrigger`] owns a `watch::channel(false)`; every task that
//! must stop on request holds a [`ShutdownSignal`] and selects on
//! [`ShutdownSignal::wait`] alongside its normal work. Setting the value
//! to `true` is irreversible.
//!
//! Dropping every trigger counts as a shutdown: a task whose owner is
//! gone has nobody left to report to.
//!
//! [`supervise`] runs a task group on a child trigger: the first member
//! to fail stops its siblings.

use std::sync::Arc;

use arena_types::{ArenaError, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;

// ---------------------------------------------------------------------------
// ShutdownTrigger
// ---------------------------------------------------------------------------

/// Sending half of the cancellation signal. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    /// Creates a new, untriggered signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Creates a trigger that also fires when `parent` fires.
    ///
    /// Used for task groups: a failing member triggers the child to stop
    /// its siblings without cancelling the parent. Must be called from
    /// within a tokio runtime.
    pub fn child_of(parent: &ShutdownSignal) -> Self {
        let child = Self::new();
        let forward = child.clone();
        let own = child.signal();
        let parent = parent.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.wait() => forward.trigger(),
                _ = own.wait() => {}
            }
        });
        child
    }

    /// Returns a new signal subscribed to this trigger.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Fires the signal. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Returns `true` once [`trigger`](Self::trigger) has been called.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Receiving half of the cancellation signal.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Returns `true` if shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested (immediately if it
    /// already was).
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // Err means every trigger was dropped.
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

// ---------------------------------------------------------------------------
// Task groups
// ---------------------------------------------------------------------------

/// Waits for every task in `tasks`.
///
/// The first failure fires `group` so the siblings stop. The first real
/// error is returned over the `Cancelled` errors it causes; a group that
/// was only cancelled returns `Err(Cancelled)`.
pub async fn supervise(tasks: &mut JoinSet<Result<()>>, group: &ShutdownTrigger) -> Result<()> {
    let mut first: Option<ArenaError> = None;

    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.unwrap_or_else(|e| {
            Err(ArenaError::ClusterError {
                reason: format!("task aborted: {e}"),
            })
        });
        let Err(e) = outcome else { continue };

        if !group.is_triggered() {
            if !e.is_cancelled() {
                tracing::error!(%e, "task failed, stopping group");
            }
            group.trigger();
        }
        first = match first {
            Some(prev) if !prev.is_cancelled() || e.is_cancelled() => Some(prev),
            _ => Some(e),
        };
    }

    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
