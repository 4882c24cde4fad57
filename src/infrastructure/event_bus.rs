//! Dual-channel event bus.
//!
//! Normal events ride a bounded channel with a drop-newest overflow policy;
//! producers are never back-pressured and a monotonic counter records every
//! dropped event. Exit signals ride a second, unbounded channel and are
//! never dropped. The dispatcher drains the exit channel ahead of anything
//! pending on the normal channel and runs handlers to completion one at a
//! time.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::domain::events::Event;

pub const DEFAULT_CAPACITY: usize = 10_000;

/// Shutdown drain budget for in-flight handlers.
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Handler invoked for every dispatched event. One event at a time; the
/// next event is not dequeued until the handler returns.
#[async_trait]
pub trait EventHandler: Send {
    async fn handle(&mut self, event: Event) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct EventBus {
    normal_tx: mpsc::Sender<Event>,
    exit_tx: mpsc::UnboundedSender<Event>,
    dropped: Arc<AtomicU64>,
}

pub struct EventReceivers {
    normal_rx: mpsc::Receiver<Event>,
    exit_rx: mpsc::UnboundedReceiver<Event>,
}

impl EventReceivers {
    /// Non-blocking read off the exit channel.
    pub fn try_recv_exit(&mut self) -> Option<Event> {
        self.exit_rx.try_recv().ok()
    }

    /// Non-blocking read off the normal channel.
    pub fn try_recv_normal(&mut self) -> Option<Event> {
        self.normal_rx.try_recv().ok()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> (Self, EventReceivers) {
        let (normal_tx, normal_rx) = mpsc::channel(capacity);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        (
            Self {
                normal_tx,
                exit_tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            EventReceivers { normal_rx, exit_rx },
        )
    }

    /// Publish onto the normal channel. When the channel is full the event
    /// is dropped (drop-newest) and accounted for; producers never block.
    pub fn publish(&self, event: Event) {
        debug_assert!(!event.is_exit_signal(), "exit signals use publish_exit");
        if let Err(err) = self.normal_tx.try_send(event) {
            match err {
                mpsc::error::TrySendError::Full(event) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        kind = event.kind(),
                        dropped_total = total,
                        "event bus full, dropping event"
                    );
                }
                mpsc::error::TrySendError::Closed(event) => {
                    debug!(kind = event.kind(), "event bus closed, discarding event");
                }
            }
        }
    }

    /// Publish onto the unbounded exit channel. Fails only when the
    /// dispatcher is gone; callers must treat a failure as "not published"
    /// and skip any state that assumes delivery.
    pub fn publish_exit(&self, event: Event) -> Result<(), String> {
        self.exit_tx
            .send(event)
            .map_err(|e| format!("exit channel closed: {}", e))
    }

    /// Monotonic count of events dropped by the overflow policy.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Cooperative single-threaded dispatch loop.
pub struct Dispatcher {
    receivers: EventReceivers,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(receivers: EventReceivers, shutdown: watch::Receiver<bool>) -> Self {
        Self { receivers, shutdown }
    }

    /// Run until shutdown. Exit signals are always drained before normal
    /// events; a failing handler is logged and the loop continues.
    pub async fn run<H: EventHandler>(mut self, handler: &mut H) {
        info!("event dispatcher started");
        loop {
            // Priority drain: everything queued on the exit channel goes
            // first.
            while let Ok(event) = self.receivers.exit_rx.try_recv() {
                Self::guarded(handler, event).await;
            }

            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }

                event = self.receivers.exit_rx.recv() => {
                    match event {
                        Some(event) => Self::guarded(handler, event).await,
                        None => break,
                    }
                }

                event = self.receivers.normal_rx.recv() => {
                    match event {
                        Some(event) => Self::guarded(handler, event).await,
                        None => break,
                    }
                }
            }
        }

        // Best-effort drain of whatever is already queued, then abandon.
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Ok(event) = self.receivers.exit_rx.try_recv() {
                Self::guarded(handler, event).await;
            }
            while let Ok(event) = self.receivers.normal_rx.try_recv() {
                Self::guarded(handler, event).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("dispatcher drain exceeded {:?}, abandoning remaining events", DRAIN_TIMEOUT);
        }
        info!("event dispatcher stopped");
    }

    async fn guarded<H: EventHandler>(handler: &mut H, event: Event) {
        let kind = event.kind();
        if let Err(e) = handler.handle(event).await {
            error!(kind, error = %e, "event handler failed");
        }
    }
}
