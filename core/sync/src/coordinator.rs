//! Serializes concurrent sync triggers into single runs.
//!
//! UI foreground events, reconnects, timers, and user pulls can all
//! ask for a sync at once; the coordinator funnels them through one
//! run loop so at most one sync is in flight, merges requests that
//! arrive while one is pending, and spaces runs by a minimum interval.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Future;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use erpsync_common::{EntityType, Error, Result};

use crate::engine::SyncReport;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Minimum spacing between the start of consecutive runs.
    pub min_sync_interval: Duration,
    /// How long a caller waits for its run before giving up. The run
    /// itself continues; only the caller stops waiting.
    pub request_timeout: Duration,
    /// Background sync cadence, when enabled.
    pub periodic_interval: Option<Duration>,
    pub channel_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            min_sync_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            periodic_interval: None,
            channel_capacity: 64,
        }
    }
}

/// Observable coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Syncing,
}

struct SyncRequest {
    /// Requested types; empty means every enabled type.
    entity_types: Vec<EntityType>,
    force_full: bool,
    reply: Option<oneshot::Sender<Result<SyncReport>>>,
}

enum Command {
    Sync(SyncRequest),
    Shutdown,
}

/// Point-in-time snapshot of the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorStatus {
    pub state: CoordinatorState,
    /// Requests sitting in the channel, not yet merged into a run.
    pub queued: usize,
    pub last_run_started: Option<Instant>,
}

struct Shared {
    state: Mutex<CoordinatorState>,
    last_run_started: Mutex<Option<Instant>>,
}

/// Clonable front-end for requesting syncs.
#[derive(Clone)]
pub struct SyncCoordinator {
    tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    request_timeout: Duration,
}

impl SyncCoordinator {
    /// Build a coordinator and the handle that drives its run loop.
    pub fn new(config: CoordinatorConfig) -> (Self, CoordinatorHandle) {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let shared = Arc::new(Shared {
            state: Mutex::new(CoordinatorState::Idle),
            last_run_started: Mutex::new(None),
        });
        let coordinator = Self {
            tx,
            shared: shared.clone(),
            request_timeout: config.request_timeout,
        };
        let handle = CoordinatorHandle { rx, shared, config };
        (coordinator, handle)
    }

    /// Request a sync and wait for its report.
    ///
    /// Concurrent callers whose requests land in the same run all
    /// receive that run's report. Waiting is bounded by the configured
    /// request timeout; the run itself is never cancelled.
    pub async fn request_sync(
        &self,
        entity_types: Vec<EntityType>,
        force_full: bool,
    ) -> Result<SyncReport> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Sync(SyncRequest {
                entity_types,
                force_full,
                reply: Some(reply_tx),
            }))
            .await
            .map_err(|_| Error::SyncFailed("sync coordinator stopped".to_string()))?;

        match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::SyncFailed("sync coordinator stopped".to_string())),
            Err(_) => Err(Error::Timeout("sync request timed out".to_string())),
        }
    }

    /// Fire-and-forget sync request. Returns false if the coordinator
    /// is stopped or its queue is full.
    pub fn try_request(&self, entity_types: Vec<EntityType>, force_full: bool) -> bool {
        self.tx
            .try_send(Command::Sync(SyncRequest {
                entity_types,
                force_full,
                reply: None,
            }))
            .is_ok()
    }

    pub fn state(&self) -> CoordinatorState {
        self.shared
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(CoordinatorState::Idle)
    }

    pub fn is_syncing(&self) -> bool {
        self.state() == CoordinatorState::Syncing
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            state: self.state(),
            queued: self.tx.max_capacity() - self.tx.capacity(),
            last_run_started: self
                .shared
                .last_run_started
                .lock()
                .map(|g| *g)
                .unwrap_or(None),
        }
    }

    /// Ask the run loop to stop after the current run.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

/// Owns the receiving side of the request channel; consumed by `run`.
pub struct CoordinatorHandle {
    rx: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    config: CoordinatorConfig,
}

impl CoordinatorHandle {
    /// Drive the run loop until shutdown.
    ///
    /// `sync_fn` performs one sync over the given types (empty slice
    /// means all) and is never invoked concurrently with itself.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(Vec<EntityType>, bool) -> Fut,
        Fut: Future<Output = Result<SyncReport>>,
    {
        info!("sync coordinator started");
        let mut last_run: Option<Instant> = None;

        loop {
            let first = match self.next_command().await {
                Some(Command::Sync(req)) => req,
                Some(Command::Shutdown) | None => break,
            };
            let mut batch = vec![first];

            // Space runs out, then sweep up everything that queued in
            // the meantime so one run serves all of it.
            if let Some(last) = last_run {
                let since = last.elapsed();
                if since < self.config.min_sync_interval {
                    sleep(self.config.min_sync_interval - since).await;
                }
            }
            let mut shutdown_after = false;
            while let Ok(cmd) = self.rx.try_recv() {
                match cmd {
                    Command::Sync(req) => batch.push(req),
                    Command::Shutdown => {
                        shutdown_after = true;
                        break;
                    }
                }
            }

            let (entity_types, force_full, replies) = merge_requests(batch);
            debug!(
                merged = replies.len(),
                force_full, "starting coordinated sync run"
            );

            self.set_state(CoordinatorState::Syncing);
            last_run = Some(Instant::now());
            if let Ok(mut guard) = self.shared.last_run_started.lock() {
                *guard = last_run;
            }
            let outcome = sync_fn(entity_types, force_full).await;
            self.set_state(CoordinatorState::Idle);

            if let Err(e) = &outcome {
                warn!("coordinated sync run failed: {}", e);
            }
            for reply in replies {
                let message = match &outcome {
                    Ok(report) => Ok(report.clone()),
                    Err(e) => Err(Error::SyncFailed(e.to_string())),
                };
                // A caller that timed out has dropped its receiver.
                let _ = reply.send(message);
            }

            if shutdown_after {
                break;
            }
        }
        info!("sync coordinator stopped");
    }

    async fn next_command(&mut self) -> Option<Command> {
        match self.config.periodic_interval {
            Some(interval) => {
                tokio::select! {
                    cmd = self.rx.recv() => cmd,
                    _ = sleep(interval) => Some(Command::Sync(SyncRequest {
                        entity_types: Vec::new(),
                        force_full: false,
                        reply: None,
                    })),
                }
            }
            None => self.rx.recv().await,
        }
    }

    fn set_state(&self, state: CoordinatorState) {
        if let Ok(mut guard) = self.shared.state.lock() {
            *guard = state;
        }
    }
}

type Replies = Vec<oneshot::Sender<Result<SyncReport>>>;

/// Union the batch: any all-types request widens the run to all types,
/// any force-full request makes the run full.
fn merge_requests(batch: Vec<SyncRequest>) -> (Vec<EntityType>, bool, Replies) {
    let mut all_types = false;
    let mut types = BTreeSet::new();
    let mut force_full = false;
    let mut replies = Vec::new();
    for request in batch {
        if request.entity_types.is_empty() {
            all_types = true;
        } else {
            types.extend(request.entity_types);
        }
        force_full |= request.force_full;
        if let Some(reply) = request.reply {
            replies.push(reply);
        }
    }
    let entity_types = if all_types {
        Vec::new()
    } else {
        types.into_iter().collect()
    };
    (entity_types, force_full, replies)
}
