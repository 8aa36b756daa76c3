//! # Snapshot Scheduler
//!
//! One cron trigger per DataProfile, each running as its own tokio task. The map from
//! profile to trigger is shared by the reconcile path (register, reschedule,
//! deregister) and the trigger tasks themselves, so it lives behind a mutex.
//!
//! A trigger only carries the profile key. The callback re-reads the profile when it
//! fires, so spec edits made between fires are always picked up.
//!
//! Replacing or removing a trigger stops it between fires. A fire that already
//! started runs to completion so it always records its outcome on the profile.

use crate::controller::reconciler::validation::{parse_schedule, ScheduleError};
use crate::observability;
use crate::store::ObjectKey;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Invoked with the profile key and the scheduled fire time
pub type FireCallback =
    Arc<dyn Fn(ObjectKey, DateTime<Utc>) -> BoxFuture<'static, ()> + Send + Sync>;

/// What [`SnapshotScheduler::ensure`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    Rescheduled,
    Unchanged,
}

struct Trigger {
    expression: String,
    stop: CancellationToken,
}

impl Drop for Trigger {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

pub struct SnapshotScheduler {
    triggers: Mutex<HashMap<ObjectKey, Trigger>>,
    callback: FireCallback,
}

impl SnapshotScheduler {
    pub fn new(callback: FireCallback) -> Self {
        Self {
            triggers: Mutex::new(HashMap::new()),
            callback,
        }
    }

    fn triggers(&self) -> MutexGuard<'_, HashMap<ObjectKey, Trigger>> {
        self.triggers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make sure `key` has a trigger for `expression`.
    ///
    /// An existing trigger with a different expression is replaced. An invalid
    /// expression removes any existing trigger.
    pub fn ensure(&self, key: &ObjectKey, expression: &str) -> Result<Registration, ScheduleError> {
        let mut triggers = self.triggers();
        if triggers
            .get(key)
            .is_some_and(|trigger| trigger.expression == expression)
        {
            return Ok(Registration::Unchanged);
        }

        let schedule = match parse_schedule(expression) {
            Ok(schedule) => schedule,
            Err(e) => {
                if triggers.remove(key).is_some() {
                    observability::metrics::set_scheduled_triggers(triggers.len());
                }
                return Err(e);
            }
        };

        let stop = CancellationToken::new();
        tokio::spawn(run_trigger(
            key.clone(),
            schedule,
            Arc::clone(&self.callback),
            stop.clone(),
        ));
        let previous = triggers.insert(
            key.clone(),
            Trigger {
                expression: expression.to_string(),
                stop,
            },
        );
        observability::metrics::set_scheduled_triggers(triggers.len());

        Ok(match previous {
            Some(old) => {
                info!(
                    "⏰ Rescheduled DataProfile {}: '{}' → '{}'",
                    key, old.expression, expression
                );
                Registration::Rescheduled
            }
            None => {
                info!("⏰ Scheduled DataProfile {} with '{}'", key, expression);
                Registration::Registered
            }
        })
    }

    /// Stop and forget the trigger of `key`. Returns whether one existed.
    pub fn deregister(&self, key: &ObjectKey) -> bool {
        let mut triggers = self.triggers();
        let removed = triggers.remove(key);
        observability::metrics::set_scheduled_triggers(triggers.len());
        drop(triggers);
        match removed {
            Some(trigger) => {
                info!(
                    "Removed schedule '{}' of DataProfile {}",
                    trigger.expression, key
                );
                true
            }
            None => false,
        }
    }

    pub fn expression(&self, key: &ObjectKey) -> Option<String> {
        self.triggers().get(key).map(|t| t.expression.clone())
    }

    pub fn is_registered(&self, key: &ObjectKey) -> bool {
        self.triggers().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.triggers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers().is_empty()
    }
}

/// Sleep until each upcoming fire time and run the callback.
///
/// Fires run one after another, so a slow snapshot delays the next fire of the same
/// profile instead of overlapping it. `stop` is only observed between fires.
async fn run_trigger(
    key: ObjectKey,
    schedule: cron::Schedule,
    callback: FireCallback,
    stop: CancellationToken,
) {
    let mut after = Utc::now();
    loop {
        let Some(next) = schedule.after(&after).next() else {
            debug!("Schedule of DataProfile {} has no further fire times", key);
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            () = stop.cancelled() => {
                debug!("Trigger of DataProfile {} stopped", key);
                return;
            }
            () = tokio::time::sleep(wait) => {}
        }

        debug!("Trigger of DataProfile {} firing for {}", key, next);
        callback(key.clone(), next).await;
        if stop.is_cancelled() {
            debug!("Trigger of DataProfile {} stopped after its last fire", key);
            return;
        }
        // Fire times missed while the callback ran collapse into the next one
        after = next.max(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn recording_scheduler() -> (SnapshotScheduler, mpsc::UnboundedReceiver<(ObjectKey, DateTime<Utc>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: FireCallback = Arc::new(move |key, at| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send((key, at));
            })
        });
        (SnapshotScheduler::new(callback), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_fires_with_profile_key() {
        let (scheduler, mut rx) = recording_scheduler();
        let key = ObjectKey::new("default", "nightly");

        assert_eq!(
            scheduler.ensure(&key, "* * * * * *"),
            Ok(Registration::Registered)
        );

        let (first_key, first) = rx.recv().await.expect("first fire");
        let (_, second) = rx.recv().await.expect("second fire");
        assert_eq!(first_key, key);
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_same_expression_is_unchanged() {
        let (scheduler, _rx) = recording_scheduler();
        let key = ObjectKey::new("default", "nightly");

        scheduler.ensure(&key, "0 2 * * *").expect("valid schedule");
        assert_eq!(scheduler.ensure(&key, "0 2 * * *"), Ok(Registration::Unchanged));
        assert_eq!(
            scheduler.ensure(&key, "0 3 * * *"),
            Ok(Registration::Rescheduled)
        );
        assert_eq!(scheduler.expression(&key).as_deref(), Some("0 3 * * *"));
        assert_eq!(scheduler.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_expression_drops_existing_trigger() {
        let (scheduler, _rx) = recording_scheduler();
        let key = ObjectKey::new("default", "nightly");

        scheduler.ensure(&key, "0 2 * * *").expect("valid schedule");
        assert!(scheduler.ensure(&key, "not a cron").is_err());
        assert!(!scheduler.is_registered(&key));
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Started,
        Finished,
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_lets_a_running_fire_finish() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: FireCallback = Arc::new(move |_key, _at| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(Event::Started);
                tokio::time::sleep(Duration::from_secs(5)).await;
                let _ = tx.send(Event::Finished);
            })
        });
        let scheduler = SnapshotScheduler::new(callback);
        let key = ObjectKey::new("default", "nightly");

        scheduler.ensure(&key, "* * * * * *").expect("valid schedule");
        assert_eq!(rx.recv().await, Some(Event::Started));
        assert_eq!(
            scheduler.ensure(&key, "0 2 * * *"),
            Ok(Registration::Rescheduled)
        );

        assert_eq!(rx.recv().await, Some(Event::Finished));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregistered_trigger_stops_firing() {
        let (scheduler, mut rx) = recording_scheduler();
        let key = ObjectKey::new("default", "nightly");

        scheduler.ensure(&key, "* * * * * *").expect("valid schedule");
        rx.recv().await.expect("fires while registered");
        assert!(scheduler.deregister(&key));
        assert!(!scheduler.deregister(&key));

        // Let any fire that was already in flight drain
        tokio::task::yield_now().await;
        while rx.try_recv().is_ok() {}

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        assert!(scheduler.is_empty());
    }
}
