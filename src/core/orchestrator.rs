//! Monitor loop: poll, dedupe, transform, deliver, checkpoint.
//!
//! One `Orchestrator` drives one monitor. Each cycle visits the
//! configured sources in order and handles their new items oldest
//! first. Bookkeeping is persisted per item as soon as the item is
//! handled, so a crash loses at most the in-flight item. After a full
//! pass the epoch is rotated if it is due.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::Adapters;
use crate::domain::{
    CheckpointEvent, Content, DeadLetter, Delivery, Disposition, IdentityTracker, Item, Outcome,
    PollState, SetBounds, SourceRef, TrackingMode,
};

use super::checkpoint::CheckpointStore;
use super::clock::Clock;
use super::error::MonitorError;
use super::retry::{run_with_retry, StepKind, StepPolicies};
use super::shutdown::Shutdown;

/// Static settings for one monitor
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub name: String,
    pub sources: Vec<SourceRef>,
    pub tracking: TrackingMode,
    pub set_bounds: SetBounds,
    /// Pause between cycles
    pub interval: Duration,
    /// Rotate the checkpoint once an epoch is this old
    pub epoch_length: Duration,
    pub retry: StepPolicies,
    /// Failing cycles before an item is dead-lettered
    pub max_item_failures: Option<u32>,
}

impl MonitorSettings {
    pub fn new(name: impl Into<String>, sources: Vec<SourceRef>, tracking: TrackingMode) -> Self {
        Self {
            name: name.into(),
            sources,
            tracking,
            set_bounds: SetBounds::default(),
            interval: Duration::from_secs(60),
            epoch_length: match tracking {
                TrackingMode::Cursor => Duration::from_secs(6 * 3600),
                TrackingMode::Set => Duration::from_secs(3600),
            },
            retry: StepPolicies::default(),
            max_item_failures: Some(10),
        }
    }
}

/// What happened during one cycle
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Items returned by polls
    pub polled: usize,
    /// Items already handled earlier
    pub skipped: usize,
    pub delivered: usize,
    pub suppressed: usize,
    /// Items left unmarked for the next cycle
    pub failed: usize,
    /// Items dropped to the dead-letter log
    pub abandoned: usize,
    pub rotated: bool,
    pub cancelled: bool,
    pub failures: Vec<MonitorError>,
}

impl CycleReport {
    pub fn handled(&self) -> usize {
        self.delivered + self.suppressed + self.abandoned
    }
}

/// Drives one monitor's poll loop
pub struct Orchestrator {
    settings: MonitorSettings,
    adapters: Adapters,
    store: Arc<dyn CheckpointStore>,
    clock: Arc<dyn Clock>,
    state: PollState,
    /// A checkpoint write failed; next cycle end re-snapshots
    needs_snapshot: bool,
}

impl Orchestrator {
    /// Resume a monitor from its checkpoint, or start it fresh.
    ///
    /// A fresh start writes the initial snapshot before returning.
    pub async fn resume(
        settings: MonitorSettings,
        adapters: Adapters,
        store: Arc<dyn CheckpointStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let resumed = store
            .resume()
            .await
            .with_context(|| format!("Failed to resume monitor '{}'", settings.name))?;

        let state = match resumed {
            Some(mut state) => {
                if state.tracker.mode() != settings.tracking {
                    anyhow::bail!(
                        "Monitor '{}' was checkpointed with {:?} tracking but is configured for {:?}",
                        settings.name,
                        state.tracker.mode(),
                        settings.tracking
                    );
                }
                state.sources = settings.sources.clone();
                if let IdentityTracker::Set { bounds, .. } = &mut state.tracker {
                    *bounds = settings.set_bounds;
                }
                info!(
                    monitor = %settings.name,
                    epoch_start = %state.epoch_start,
                    tracked_sources = state.tracker.source_count(),
                    pending_failures = state.failures.entries().len(),
                    "Resumed monitor state"
                );
                state
            }
            None => {
                let state = PollState::new(
                    settings.name.clone(),
                    settings.sources.clone(),
                    IdentityTracker::for_mode(settings.tracking, settings.set_bounds),
                    clock.now(),
                );
                store
                    .rotate(&state)
                    .await
                    .with_context(|| format!("Failed to write initial checkpoint for '{}'", settings.name))?;
                info!(monitor = %settings.name, "Starting monitor with empty state");
                state
            }
        };

        Ok(Self {
            settings,
            adapters,
            store,
            clock,
            state,
            needs_snapshot: false,
        })
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Run cycles until shutdown
    #[instrument(skip(self, shutdown), fields(monitor = %self.settings.name))]
    pub async fn run(&mut self, shutdown: Shutdown) {
        info!(
            sources = self.settings.sources.len(),
            interval_secs = self.settings.interval.as_secs(),
            "Monitor started"
        );

        loop {
            let report = self.run_cycle(&shutdown).await;
            if report.cancelled || shutdown.is_triggered() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                _ = shutdown.triggered() => break,
            }
        }

        info!("Monitor stopped");
    }

    /// One full pass over all sources, then rotation if due
    pub async fn run_cycle(&mut self, shutdown: &Shutdown) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::default();

        for source in self.settings.sources.clone() {
            if shutdown.is_triggered() {
                report.cancelled = true;
                break;
            }
            self.visit_source(&source, shutdown, &mut report).await;
            if report.cancelled {
                break;
            }
        }

        if !report.cancelled {
            self.maybe_rotate(&mut report).await;
        }

        info!(
            monitor = %self.settings.name,
            polled = report.polled,
            delivered = report.delivered,
            suppressed = report.suppressed,
            failed = report.failed,
            abandoned = report.abandoned,
            rotated = report.rotated,
            duration_ms = started.elapsed().as_millis() as u64,
            "Cycle finished"
        );

        report
    }

    async fn visit_source(&mut self, source: &SourceRef, shutdown: &Shutdown, report: &mut CycleReport) {
        let poller = Arc::clone(&self.adapters.source);
        let hint = self.state.tracker.poll_hint(source).cloned();

        let polled = run_with_retry(&self.settings.retry.poll, StepKind::Poll, shutdown, |_| {
            let poller = Arc::clone(&poller);
            let hint = hint.clone();
            async move { poller.poll(source, hint.as_ref()).await }
        })
        .await;

        let mut items = match polled {
            Ok(items) => items,
            Err(e) => {
                let err = MonitorError::from_poll(source, e);
                if err.is_cancelled() {
                    report.cancelled = true;
                } else {
                    error!(monitor = %self.settings.name, %source, error = %err, "Poll failed, skipping source");
                    report.failures.push(err);
                }
                return;
            }
        };

        // Strictly increasing ids within a source
        items.sort_by(|a, b| a.id.cmp(&b.id));
        report.polled += items.len();
        self.forget_vanished_failures(source, &items);

        let mut fresh = 0usize;
        for item in items {
            if !self.state.tracker.is_new(source, &item.id) {
                report.skipped += 1;
                continue;
            }
            if shutdown.is_triggered() {
                report.cancelled = true;
                return;
            }
            fresh += 1;

            match self.process_item(&item, shutdown).await {
                Ok(disposition) => {
                    match disposition {
                        Disposition::Delivered => {
                            info!(monitor = %self.settings.name, %source, item_id = %item.id, "Delivered item")
                        }
                        _ => {
                            debug!(monitor = %self.settings.name, %source, item_id = %item.id, "Suppressed item")
                        }
                    }
                    self.mark_done(source, &item, disposition, report).await;
                }
                Err(err) if err.is_cancelled() => {
                    report.cancelled = true;
                    return;
                }
                Err(err) => {
                    error!(monitor = %self.settings.name, %source, item_id = %item.id, error = %err, "Item failed");
                    let reason = err.to_string();
                    report.failures.push(err);
                    if !self.record_failure(source, &item, &reason, report).await {
                        // Later items wait so the cursor cannot pass this one
                        break;
                    }
                }
            }
        }

        debug!(monitor = %self.settings.name, %source, new_items = fresh, "Source visited");
    }

    /// Failure counts only matter while the item can still come back.
    /// Entries for items the poll no longer returns, or that the tracker
    /// already treats as handled, are dropped; the next end of a pass
    /// writes a snapshot so replay does not bring them back.
    fn forget_vanished_failures(&mut self, source: &SourceRef, items: &[Item]) {
        let tracker = &self.state.tracker;
        let removed = self.state.failures.prune(source, |id| {
            tracker.is_new(source, id) && items.iter().any(|item| item.id == *id)
        });
        if removed > 0 {
            debug!(monitor = %self.settings.name, %source, removed, "Dropped failure records for vanished items");
            self.needs_snapshot = true;
        }
    }

    /// Transform and deliver one item
    async fn process_item(&self, item: &Item, shutdown: &Shutdown) -> Result<Disposition, MonitorError> {
        let transform = Arc::clone(&self.adapters.transform);
        let content = run_with_retry(
            &self.settings.retry.transform,
            StepKind::Transform,
            shutdown,
            |_| {
                let transform = Arc::clone(&transform);
                async move {
                    match transform.apply(item).await {
                        Outcome::Deliver(content) => Ok(Some(content)),
                        Outcome::Suppress => Ok(None),
                        Outcome::Fail(reason) => Err(anyhow::anyhow!(reason)),
                    }
                }
            },
        )
        .await
        .map_err(|e| MonitorError::from_transform(&item.source, &item.id, e))?;

        let Some(content) = content else {
            return Ok(Disposition::Suppressed);
        };

        self.deliver(item, &content, shutdown).await?;
        Ok(Disposition::Delivered)
    }

    async fn deliver(&self, item: &Item, content: &Content, shutdown: &Shutdown) -> Result<(), MonitorError> {
        let sink = Arc::clone(&self.adapters.sink);
        run_with_retry(&self.settings.retry.deliver, StepKind::Deliver, shutdown, |_| {
            let sink = Arc::clone(&sink);
            async move {
                match sink.deliver(content).await {
                    Delivery::Ack => Ok(()),
                    Delivery::Fail(reason) => Err(anyhow::anyhow!(reason)),
                }
            }
        })
        .await
        .map_err(|e| MonitorError::from_deliver(&item.source, &item.id, e))
    }

    async fn mark_done(
        &mut self,
        source: &SourceRef,
        item: &Item,
        disposition: Disposition,
        report: &mut CycleReport,
    ) {
        match disposition {
            Disposition::Delivered => report.delivered += 1,
            Disposition::Suppressed => report.suppressed += 1,
            Disposition::Abandoned => report.abandoned += 1,
        }

        let event = CheckpointEvent::item_done(
            self.settings.name.clone(),
            source,
            &item.id,
            disposition,
            self.clock.now(),
        );
        self.persist(event, report).await;
    }

    /// Count a failing cycle for `item`; dead-letter it once over budget.
    ///
    /// Returns true if the item was abandoned (the source may continue).
    async fn record_failure(
        &mut self,
        source: &SourceRef,
        item: &Item,
        reason: &str,
        report: &mut CycleReport,
    ) -> bool {
        report.failed += 1;

        let now = self.clock.now();
        let event = CheckpointEvent::item_failed(self.settings.name.clone(), source, &item.id, reason, now);
        self.persist(event, report).await;

        let count = self.state.failures.count(source, &item.id);
        let Some(max) = self.settings.max_item_failures else {
            return false;
        };
        if count < max {
            warn!(
                monitor = %self.settings.name,
                %source,
                item_id = %item.id,
                failures = count,
                max_failures = max,
                "Item left unmarked for next cycle"
            );
            return false;
        }

        let entry = DeadLetter::new(self.settings.name.clone(), item, count, reason, now);
        if let Err(e) = self.store.dead_letter(&entry).await {
            error!(monitor = %self.settings.name, %source, item_id = %item.id, error = %e, "Failed to write dead letter");
            report.failures.push(MonitorError::Persistence(e));
            return false;
        }

        error!(
            monitor = %self.settings.name,
            %source,
            item_id = %item.id,
            failures = count,
            "Item abandoned after repeated failures"
        );
        report.failed -= 1;
        self.mark_done(source, item, Disposition::Abandoned, report).await;
        true
    }

    /// Append an event and apply it to in-memory state.
    ///
    /// State is updated even if the append fails so the item is not
    /// redelivered by this process; the next cycle end writes a fresh
    /// snapshot to make the change durable.
    async fn persist(&mut self, event: CheckpointEvent, report: &mut CycleReport) {
        if let Err(e) = self.store.append(&event).await {
            error!(
                monitor = %self.settings.name,
                event = event.kind_name(),
                error = %e,
                "Failed to persist checkpoint event"
            );
            self.needs_snapshot = true;
            report.failures.push(MonitorError::Persistence(e));
        }
        self.state.apply_event(&event);
    }

    async fn maybe_rotate(&mut self, report: &mut CycleReport) {
        let now = self.clock.now();
        let due = self.state.rotation_due(now, self.settings.epoch_length);
        if !due && !self.needs_snapshot {
            return;
        }

        let next = if due {
            self.state.rotated(now)
        } else {
            self.state.clone()
        };

        match self.store.rotate(&next).await {
            Ok(()) => {
                if due {
                    info!(
                        monitor = %self.settings.name,
                        previous_epoch = %self.state.epoch_start,
                        epoch_start = %next.epoch_start,
                        "Rotated checkpoint"
                    );
                } else {
                    info!(monitor = %self.settings.name, "Rewrote checkpoint snapshot");
                }
                self.state = next;
                self.needs_snapshot = false;
                report.rotated = due;
            }
            Err(e) => {
                warn!(monitor = %self.settings.name, error = %e, "Checkpoint rotation failed, continuing un-rotated");
                report.failures.push(MonitorError::Persistence(e));
            }
        }
    }
}
