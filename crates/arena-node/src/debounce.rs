//! Hit input debouncing.
//!
//! Hardware pushes raw edges through an [`EdgeSender`], which never
//! blocks and silently drops edges when the queue is full. The debounce
//! task accepts an edge only if at least one window passed since the
//! last *accepted* edge, and turns every accepted edge into one hit
//! request on the sensor's command queue.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use arena_cluster::ShutdownSignal;
use arena_types::{ArenaError, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::sensor::SensorCommand;

/// One raw edge from a hit input line.
#[derive(Clone, Copy, Debug)]
pub struct RawEdge {
    pub at: Instant,
}

/// Producer side of the raw edge queue, for the hardware callback.
#[derive(Clone, Debug)]
pub struct EdgeSender {
    tx: mpsc::Sender<RawEdge>,
}

impl EdgeSender {
    /// Queues an edge observed now.
    pub fn notify(&self) {
        self.notify_at(Instant::now());
    }

    /// Queues an edge observed at `at`. Overflow is dropped silently.
    pub fn notify_at(&self, at: Instant) {
        let _ = self.tx.try_send(RawEdge { at });
    }
}

/// Creates a raw edge queue with room for `capacity` edges.
pub fn edge_queue(capacity: usize) -> (EdgeSender, mpsc::Receiver<RawEdge>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EdgeSender { tx }, rx)
}

/// Per-sensor debounce window.
#[derive(Debug)]
pub struct HitDebouncer {
    window: Duration,
    last_accepted: Mutex<Option<Instant>>,
}

impl HitDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: Mutex::new(None),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns `true` and records `at` if the edge is outside the window
    /// of the last accepted edge. The first edge is always accepted.
    pub fn accept(&self, at: Instant) -> bool {
        let mut last = self
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = *last {
            if at.saturating_duration_since(prev) < self.window {
                return false;
            }
        }
        *last = Some(at);
        true
    }
}

/// Debounces `edges` into hit requests on `out` until shutdown.
///
/// Returns `Ok` when the edge queue closes and `Err(Cancelled)` on
/// shutdown. A full `out` queue drops the hit with a warning.
pub async fn run_debounce(
    sensor: String,
    debouncer: HitDebouncer,
    mut edges: mpsc::Receiver<RawEdge>,
    out: mpsc::Sender<SensorCommand>,
    shutdown: ShutdownSignal,
) -> Result<()> {
    tracing::debug!(%sensor, window_ms = debouncer.window().as_millis() as u64, "debounce started");
    loop {
        tokio::select! {
            _ = shutdown.wait() => return Err(ArenaError::Cancelled),
            edge = edges.recv() => {
                let Some(edge) = edge else { return Ok(()) };
                if !debouncer.accept(edge.at) {
                    tracing::trace!(%sensor, "ignoring bounced edge");
                    continue;
                }
                if out.try_send(SensorCommand::Hit { count: 1 }).is_err() {
                    tracing::warn!(%sensor, "sensor queue full, discarding hit");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use arena_cluster::ShutdownTrigger;

    const WINDOW: Duration = Duration::from_millis(100);

    #[test]
    fn edges_inside_window_collapse() {
        let debouncer = HitDebouncer::new(WINDOW);
        let t0 = Instant::now();
        assert!(debouncer.accept(t0));
        assert!(!debouncer.accept(t0 + Duration::from_millis(40)));
        assert!(!debouncer.accept(t0 + Duration::from_millis(99)));
    }

    #[test]
    fn edges_a_window_apart_both_count() {
        let debouncer = HitDebouncer::new(WINDOW);
        let t0 = Instant::now();
        assert!(debouncer.accept(t0));
        assert!(debouncer.accept(t0 + WINDOW));
        // Measured from the last accepted edge, not the last edge seen.
        assert!(!debouncer.accept(t0 + WINDOW + Duration::from_millis(50)));
        assert!(debouncer.accept(t0 + WINDOW * 2));
    }

    #[tokio::test]
    async fn task_emits_one_hit_per_window() -> Result<()> {
        let (edges, edge_rx) = edge_queue(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let trigger = ShutdownTrigger::new();
        let task = tokio::spawn(run_debounce(
            "s1".into(),
            HitDebouncer::new(WINDOW),
            edge_rx,
            out_tx,
            trigger.signal(),
        ));

        let t0 = Instant::now();
        edges.notify_at(t0);
        edges.notify_at(t0 + Duration::from_millis(10));
        edges.notify_at(t0 + Duration::from_millis(150));
        drop(edges);

        let result = task.await.map_err(|e| ArenaError::ChannelClosed {
            reason: e.to_string(),
        })?;
        assert!(result.is_ok());

        let mut hits = 0;
        while let Ok(command) = out_rx.try_recv() {
            assert!(matches!(command, SensorCommand::Hit { count: 1 }));
            hits += 1;
        }
        assert_eq!(hits, 2);
        Ok(())
    }

    #[test]
    fn full_edge_queue_drops_silently() {
        let (edges, mut rx) = edge_queue(1);
        edges.notify();
        edges.notify();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
