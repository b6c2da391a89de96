//! Endpoint watch loop with debounced reconciliation
//!
//! The loop is an explicit state machine:
//!
//! ```text
//! Connecting ──ok──▶ Watching ──error/end──▶ Backoff ──2s──▶ Connecting
//!      │                                        ▲
//!      └────────────────failed─────────────────┘
//! ```
//!
//! Every change notification goes through a [`DebounceGate`] so a burst of
//! events triggers one reconciliation pass per window. The loop only exits
//! when its cancellation token fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::kube_api::{ApiError, WatchNotice};
use crate::orchestrator::Orchestrator;
use crate::reconciler::Reconciler;

/// Minimum spacing between watch-triggered passes
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

/// Delay before reconnecting a failed watch
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Rate limiter admitting at most one trigger per window.
///
/// Holds the next allowed trigger time as milliseconds since creation. A
/// trigger is admitted only by the caller that advances it with a
/// compare-and-set, so concurrent callers race safely.
#[derive(Debug)]
pub struct DebounceGate {
    origin: Instant,
    window_ms: u64,
    next_allowed_ms: AtomicU64,
}

impl DebounceGate {
    pub fn new(window: Duration) -> Self {
        Self {
            origin: Instant::now(),
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            next_allowed_ms: AtomicU64::new(0),
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let now_ms = u64::try_from(now.saturating_duration_since(self.origin).as_millis())
            .unwrap_or(u64::MAX);
        let gate = self.next_allowed_ms.load(Ordering::Acquire);
        if now_ms < gate {
            return false;
        }
        self.next_allowed_ms
            .compare_exchange(
                gate,
                now_ms.saturating_add(self.window_ms),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for DebounceGate {
    fn default() -> Self {
        Self::new(DEBOUNCE_WINDOW)
    }
}

pub enum WatchState {
    Connecting,
    Watching(BoxStream<'static, Result<WatchNotice, ApiError>>),
    Backoff,
}

impl WatchState {
    pub fn name(&self) -> &'static str {
        match self {
            WatchState::Connecting => "connecting",
            WatchState::Watching(_) => "watching",
            WatchState::Backoff => "backoff",
        }
    }
}

pub struct WatchLoop {
    orchestrator: Orchestrator,
    reconciler: Arc<Reconciler>,
    gate: DebounceGate,
    backoff: Duration,
}

impl WatchLoop {
    pub fn new(orchestrator: Orchestrator, reconciler: Arc<Reconciler>) -> Self {
        Self {
            orchestrator,
            reconciler,
            gate: DebounceGate::default(),
            backoff: RECONNECT_BACKOFF,
        }
    }

    /// Run until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            selector = %self.reconciler.scope().label_selector(),
            "Endpoint watch enabled for discovery"
        );
        let mut state = WatchState::Connecting;
        loop {
            state = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Endpoint watch stopped");
                    return;
                }
                next = self.step(state) => next,
            };
            trace!(state = state.name(), "Watch state transition");
        }
    }

    async fn step(&self, state: WatchState) -> WatchState {
        match state {
            WatchState::Connecting => {
                match self
                    .orchestrator
                    .watch_discoverable_endpoints(self.reconciler.scope())
                {
                    Ok(stream) => {
                        debug!("Endpoint watch connected");
                        WatchState::Watching(stream)
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to open endpoint watch");
                        WatchState::Backoff
                    }
                }
            }
            WatchState::Watching(mut stream) => match stream.next().await {
                Some(Ok(notice)) => {
                    self.on_watch_event(&notice).await;
                    WatchState::Watching(stream)
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Endpoint watch failed, reconnecting");
                    WatchState::Backoff
                }
                None => {
                    debug!("Endpoint watch stream ended, reconnecting");
                    WatchState::Backoff
                }
            },
            WatchState::Backoff => {
                tokio::time::sleep(self.backoff).await;
                WatchState::Connecting
            }
        }
    }

    /// Handle one change notification. Returns whether a pass ran.
    pub async fn on_watch_event(&self, notice: &WatchNotice) -> bool {
        if !self.gate.try_acquire() {
            trace!(?notice, "Watch event debounced");
            return false;
        }
        debug!(?notice, "Watch event triggered reconciliation");
        self.reconciler.run_pass().await;
        true
    }
}
