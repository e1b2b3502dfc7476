//! Scheduling events and the event waiter.
//!
//! Events carry exactly one timestamp — a monotonic `Instant` stamped at
//! emission. Callers capture their own `Instant` before submitting pods
//! and pass it as `since`; there is no wall-clock field to diverge from.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tracing::trace;

use crate::cluster::VirtualCluster;

/// How often the waiter re-reads the event log.
pub(crate) const POLL_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReason {
    Scheduled,
    FailedScheduling,
}

/// One scheduling event emitted by the embedded scheduler.
#[derive(Debug, Clone)]
pub struct Event {
    pub reason: EventReason,
    pub pod_name: String,
    pub message: String,
    pub timestamp: Instant,
}

/// Classification of a target pod set after waiting for events.
/// `scheduled` and `unscheduled` are disjoint.
#[derive(Debug, Clone, Default)]
pub struct SchedulingOutcome {
    pub scheduled: BTreeSet<String>,
    pub unscheduled: BTreeSet<String>,
}

/// Errors from [`VirtualCluster::wait_for_pod_scheduling`].
///
/// `Timeout` carries the partial classification gathered before the
/// deadline so callers can treat unconfirmed pods as unscheduled.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timeout waiting for pod scheduling events")]
    Timeout(SchedulingOutcome),

    #[error("cancelled while waiting for pod scheduling events")]
    Cancelled,
}

impl VirtualCluster {
    /// List all events whose timestamp is at or after `since`.
    pub async fn list_events_since(&self, since: Instant) -> Vec<Event> {
        let data = self.data().read().await;
        data.events
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect()
    }

    pub async fn delete_all_events(&self) {
        self.data().write().await.events.clear();
    }

    /// Poll scheduling events until every pod in `pod_names` is classified
    /// scheduled or unscheduled, the timeout elapses, or `cancel` fires.
    ///
    /// A `FailedScheduling` followed by a later `Scheduled` for the same
    /// pod upgrades it to scheduled.
    pub async fn wait_for_pod_scheduling(
        &self,
        pod_names: &[String],
        since: Instant,
        timeout: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<SchedulingOutcome, WaitError> {
        let mut outcome = SchedulingOutcome::default();
        let mut remaining: BTreeSet<String> = pod_names.iter().cloned().collect();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut tick = tokio::time::interval(POLL_TICK);
        let mut cancel_open = true;

        loop {
            tokio::select! {
                changed = cancel.changed(), if cancel_open => {
                    match changed {
                        Ok(()) if *cancel.borrow() => return Err(WaitError::Cancelled),
                        Ok(()) => {}
                        // Sender gone: cancellation can no longer fire.
                        Err(_) => cancel_open = false,
                    }
                }
                _ = &mut deadline => {
                    return Err(WaitError::Timeout(outcome));
                }
                _ = tick.tick() => {
                    let events = self.list_events_since(since).await;
                    for event in events {
                        if !pod_names.contains(&event.pod_name) {
                            continue;
                        }
                        match event.reason {
                            EventReason::FailedScheduling => {
                                if remaining.contains(&event.pod_name) {
                                    outcome.unscheduled.insert(event.pod_name);
                                }
                            }
                            EventReason::Scheduled => {
                                remaining.remove(&event.pod_name);
                                outcome.unscheduled.remove(&event.pod_name);
                                outcome.scheduled.insert(event.pod_name);
                            }
                        }
                    }
                    trace!(
                        total = pod_names.len(),
                        scheduled = outcome.scheduled.len(),
                        unscheduled = outcome.unscheduled.len(),
                        "pod scheduling events polled"
                    );
                    if outcome.scheduled.len() + outcome.unscheduled.len() == pod_names.len() {
                        return Ok(outcome);
                    }
                }
            }
        }
    }
}
