//! Client sync agent.
//!
//! A sync cycle flushes the pending queue through `push`, then pulls every
//! configured entity type from its cursor:
//!
//! ```text
//!   idle ──trigger──► syncing(0..100) ──► idle
//!                        │
//!                        ├─ push per entity group ─► dequeue confirmed items only
//!                        └─ pull per entity type  ─► merge ─► advance cursor
//! ```
//!
//! At most one cycle runs at a time. A trigger that arrives while a cycle
//! is in flight is dropped, not queued. The cycle works from a snapshot of
//! the queue, so updates appended meanwhile go out with the next cycle.

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{Interval, MissedTickBehavior};

use greencycle_core::{now_millis, ChangeType, EntityType};

use crate::api::SyncApi;
use crate::cursor::CursorBook;
use crate::error::ClientError;
use crate::local::{LocalRecord, LocalState};
use crate::queue::{group_by_entity, PendingQueue, PendingUpdate};
use crate::store::QueueStore;
use crate::transport::PushEvent;

/// Observable agent state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_syncing: bool,
    /// 0..=100 within the current cycle
    pub progress: u8,
    pub pending_count: usize,
    /// Completion time of the last successful cycle
    pub last_sync_time: Option<i64>,
    /// Error of the last cycle; cleared by the next successful one
    pub error: Option<String>,
    /// Server timestamp of the last `sync` push frame seen
    pub last_push_observed: Option<i64>,
    /// Oldest pull cursor; every configured entity type is current up to
    /// here. `None` until each type has been pulled once.
    pub synced_through: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Queued updates the server confirmed
    pub pushed: usize,
    /// Queued updates the server rejected (still queued)
    pub rejected: usize,
    /// Records received from catch-up pulls
    pub pulled: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another cycle was already in flight
    Skipped,
}

/// Sources that start a sync cycle inside [`SyncAgent::run`].
pub struct SyncTriggers {
    /// Queue check period; a cycle starts only when updates are pending
    pub poll_interval: Duration,
    /// Session token changes; a cycle starts when a token appears
    pub auth: Option<watch::Receiver<Option<String>>>,
    /// Push client events; a `sync` frame starts a cycle
    pub push_events: Option<mpsc::Receiver<PushEvent>>,
}

impl SyncTriggers {
    pub fn poll(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            auth: None,
            push_events: None,
        }
    }

    pub fn with_auth(mut self, auth: watch::Receiver<Option<String>>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_push_events(mut self, events: mpsc::Receiver<PushEvent>) -> Self {
        self.push_events = Some(events);
        self
    }
}

struct AgentState {
    queue: PendingQueue,
    cursors: CursorBook,
    local: LocalState,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncAgent {
    api: Arc<dyn SyncApi>,
    store: Arc<dyn QueueStore>,
    entity_types: Vec<EntityType>,
    /// Never held across an await
    state: Mutex<AgentState>,
    in_flight: AtomicBool,
    status: watch::Sender<SyncStatus>,
    manual: Notify,
}

impl SyncAgent {
    /// Restore the queue and cursors from `store` and build the agent.
    pub fn open(
        api: Arc<dyn SyncApi>,
        store: Arc<dyn QueueStore>,
        entity_types: Vec<EntityType>,
    ) -> Result<Self, ClientError> {
        let queue = PendingQueue::restore(store.load_pending()?);
        let cursors = CursorBook::restore(store.load_cursors()?);
        let mut local = LocalState::new();
        for update in queue.snapshot() {
            local.apply_optimistic(&update);
        }
        if !queue.is_empty() {
            log::info!("Restored {} pending update(s)", queue.len());
        }

        let (status, _) = watch::channel(SyncStatus {
            pending_count: queue.len(),
            ..SyncStatus::default()
        });
        Ok(Self {
            api,
            store,
            entity_types,
            state: Mutex::new(AgentState {
                queue,
                cursors,
                local,
            }),
            in_flight: AtomicBool::new(false),
            status,
            manual: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_status(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.status.send_modify(f);
    }

    /// Queue a local write. It is persisted before this returns.
    pub fn queue_update(
        &self,
        entity_type: EntityType,
        operation: ChangeType,
        id: Option<String>,
        data: Value,
    ) -> Result<PendingUpdate, ClientError> {
        let mut state = self.lock();
        let update = state.queue.push(entity_type, operation, id, data);
        if let Err(e) = self.store.put_pending(&update) {
            state.queue.pop_last(update.seq);
            log::error!("Failed to persist queued update: {e}");
            return Err(e.into());
        }
        state.local.apply_optimistic(&update);
        let pending = state.queue.len();
        drop(state);

        self.update_status(|s| s.pending_count = pending);
        Ok(update)
    }

    /// Run one sync cycle, or return [`SyncOutcome::Skipped`] if one is
    /// already in flight.
    pub async fn perform_sync(&self) -> Result<SyncOutcome, ClientError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Sync already in progress, request dropped");
            return Ok(SyncOutcome::Skipped);
        }
        let _in_flight = InFlight(&self.in_flight);

        log::info!("Sync cycle started");
        self.update_status(|s| {
            s.is_syncing = true;
            s.progress = 0;
        });

        let result = self.run_cycle().await;
        let (pending, synced_through) = {
            let state = self.lock();
            (state.queue.len(), state.cursors.oldest(&self.entity_types))
        };
        match &result {
            Ok(report) => {
                log::info!(
                    "Sync cycle finished: {} pushed, {} rejected, {} pulled",
                    report.pushed,
                    report.rejected,
                    report.pulled
                );
                self.update_status(|s| {
                    s.is_syncing = false;
                    s.progress = 100;
                    s.pending_count = pending;
                    s.error = None;
                    s.last_sync_time = Some(now_millis());
                    s.synced_through = synced_through;
                });
            }
            Err(e) => {
                log::warn!("Sync cycle failed: {e}");
                let message = e.to_string();
                self.update_status(|s| {
                    s.is_syncing = false;
                    s.pending_count = pending;
                    s.error = Some(message);
                });
            }
        }
        result.map(SyncOutcome::Completed)
    }

    async fn run_cycle(&self) -> Result<SyncReport, ClientError> {
        let groups = group_by_entity(self.lock().queue.snapshot());
        let total = groups.len() + self.entity_types.len();
        let mut done = 0;
        let mut report = SyncReport::default();

        for (entity_type, updates) in groups {
            let requests = updates.iter().map(PendingUpdate::to_request).collect();
            let response = self.api.push(entity_type, requests).await?;
            if response.results.len() != updates.len() {
                log::warn!(
                    "Push of {} {entity_type} update(s) returned {} result(s)",
                    updates.len(),
                    response.results.len()
                );
            }

            let mut confirmed = Vec::new();
            for (update, result) in updates.iter().zip(&response.results) {
                if result.success {
                    confirmed.push(update.seq);
                } else {
                    report.rejected += 1;
                    log::warn!(
                        "Server rejected {} {entity_type} update {:?}: {}",
                        update.operation,
                        update.id,
                        result.message
                    );
                }
            }

            self.store.remove_pending(&confirmed)?;
            let pending = {
                let mut state = self.lock();
                report.pushed += state.queue.remove(&confirmed);
                state.queue.len()
            };
            done += 1;
            self.report_progress(done, total, Some(pending));
        }

        for &entity_type in &self.entity_types {
            let since = self.lock().cursors.get(entity_type);
            let pulled = self.api.pull(entity_type, since).await?;
            report.pulled += pulled.data.len();

            let advance = {
                let mut state = self.lock();
                let stats = state.local.merge_pulled(entity_type, &pulled.data);
                log::debug!("Merged {entity_type}: {stats:?}");
                pulled.sync_timestamp > state.cursors.get(entity_type)
            };
            if advance {
                self.store.save_cursor(entity_type, pulled.sync_timestamp)?;
                self.lock().cursors.advance(entity_type, pulled.sync_timestamp);
            }
            done += 1;
            self.report_progress(done, total, None);
        }

        Ok(report)
    }

    fn report_progress(&self, done: usize, total: usize, pending: Option<usize>) {
        let progress = if total == 0 { 100 } else { (done * 100 / total).min(100) as u8 };
        self.update_status(|s| {
            s.progress = progress;
            if let Some(pending) = pending {
                s.pending_count = pending;
            }
        });
    }

    /// Ask [`run`](Self::run) for a cycle. Requests made while a cycle is
    /// running are dropped, like any other trigger.
    pub fn request_sync(&self) {
        self.manual.notify_one();
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn pending(&self) -> Vec<PendingUpdate> {
        self.lock().queue.snapshot()
    }

    pub fn cursor(&self, entity_type: EntityType) -> i64 {
        self.lock().cursors.get(entity_type)
    }

    pub fn local_record(&self, entity_type: EntityType, id: &str) -> Option<LocalRecord> {
        self.lock().local.get(entity_type, id).cloned()
    }

    pub fn local_count(&self, entity_type: EntityType) -> usize {
        self.lock().local.len(entity_type)
    }

    /// Drop every queued update. The only way queued updates are discarded.
    pub fn clear_pending(&self) -> Result<usize, ClientError> {
        let mut state = self.lock();
        self.store.clear_pending()?;
        let dropped = state.queue.len();
        state.queue.clear();
        drop(state);

        log::info!("Cleared {dropped} pending update(s)");
        self.update_status(|s| s.pending_count = 0);
        Ok(dropped)
    }

    /// Start cycles from `triggers` until `shutdown` flips to `true`.
    pub async fn run(&self, triggers: SyncTriggers, mut shutdown: watch::Receiver<bool>) {
        let SyncTriggers {
            poll_interval,
            mut auth,
            mut push_events,
        } = triggers;
        let mut poll = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        poll.tick().await;

        loop {
            let reason = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = poll.tick() => {
                    if self.pending_count() == 0 {
                        continue;
                    }
                    "poll"
                }
                _ = self.manual.notified() => "manual",
                signed_in = token_change(&mut auth) => match signed_in {
                    Some(true) => "auth",
                    Some(false) => continue,
                    None => {
                        auth = None;
                        continue;
                    }
                },
                event = next_push_event(&mut push_events) => match event {
                    Some(PushEvent::Sync { entity_type, timestamp, .. }) => {
                        log::debug!("Push nudge for {entity_type} at {timestamp}");
                        self.update_status(|s| s.last_push_observed = Some(timestamp));
                        "push"
                    }
                    Some(_) => continue,
                    None => {
                        push_events = None;
                        continue;
                    }
                },
            };

            log::debug!("Sync triggered by {reason}");
            match self.perform_sync().await {
                Ok(SyncOutcome::Skipped) => log::debug!("Sync trigger ({reason}) skipped"),
                Ok(SyncOutcome::Completed(_)) => {}
                Err(e) => log::warn!("Sync triggered by {reason} failed: {e}"),
            }
            self.drop_stale_triggers(&mut poll, &mut auth, &mut push_events);
        }
    }

    /// Forget triggers that fired while a cycle was running.
    fn drop_stale_triggers(
        &self,
        poll: &mut Interval,
        auth: &mut Option<watch::Receiver<Option<String>>>,
        push_events: &mut Option<mpsc::Receiver<PushEvent>>,
    ) {
        poll.reset();
        if self.manual.notified().now_or_never().is_some() {
            log::debug!("Manual sync request dropped: cycle was in flight");
        }
        if let Some(rx) = auth.as_mut() {
            rx.mark_unchanged();
        }
        if let Some(rx) = push_events.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(PushEvent::Sync { timestamp, .. }) => {
                        self.update_status(|s| s.last_push_observed = Some(timestamp));
                    }
                    Ok(_) => {}
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        *push_events = None;
                        break;
                    }
                }
            }
        }
    }
}

/// `Some(signed_in)` on the next token change, `None` once the session is
/// gone. Never resolves without a receiver.
async fn token_change(auth: &mut Option<watch::Receiver<Option<String>>>) -> Option<bool> {
    match auth {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().is_some()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

async fn next_push_event(events: &mut Option<mpsc::Receiver<PushEvent>>) -> Option<PushEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
