use crate::errors::{AppError, AppResult};
use crate::fire_time;
use crate::models::{ReconcileReport, ReminderSettings, Task, TaskFilter};
use crate::scheduler::Scheduler;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

/// How far back a pass still looks at deadlines, so timers armed right at the deadline are
/// not cancelled by the next pass before they fire.
const DEADLINE_LOOKBACK_MINUTES: i64 = 60;

/// Authoritative task list the poller re-syncs against.
pub trait TaskSource: Send + Sync {
    fn list_tasks(&self, filter: &TaskFilter) -> AppResult<Vec<Task>>;
}

pub fn poll_filter(settings: &ReminderSettings, now: DateTime<Utc>) -> TaskFilter {
    let grace = fire_time::grace_window(settings);
    TaskFilter {
        include_completed: false,
        due_after: Some(now - ChronoDuration::minutes(DEADLINE_LOOKBACK_MINUTES) - grace),
        due_before: Some(now + ChronoDuration::hours(i64::from(settings.lookahead_hours))),
        include_alarm_enabled: true,
    }
}

#[derive(Clone)]
pub struct BackgroundPoller {
    source: Arc<dyn TaskSource>,
    scheduler: Scheduler,
    online: Arc<AtomicBool>,
    kick: Arc<Notify>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl BackgroundPoller {
    pub fn new(source: Arc<dyn TaskSource>, scheduler: Scheduler) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            source,
            scheduler,
            online: Arc::new(AtomicBool::new(true)),
            kick: Arc::new(Notify::new()),
            shutdown: Arc::new(shutdown),
        }
    }

    /// One re-sync pass. A failed listing leaves every armed timer as it was.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> AppResult<ReconcileReport> {
        let filter = poll_filter(&self.scheduler.settings(), now);
        let mark = self.scheduler.mark().await;
        let tasks = self
            .source
            .list_tasks(&filter)
            .map_err(|error| AppError::StalePoll(error.to_string()))?;
        let report = self.scheduler.reconcile_listing(&tasks, now, mark).await;
        tracing::debug!(
            tasks = tasks.len(),
            armed = report.armed.len(),
            cancelled = report.cancelled.len(),
            missed = report.missed.len(),
            stale = report.stale,
            "reminder poll finished"
        );
        Ok(report)
    }

    /// Requests an immediate pass from the running loop.
    pub fn trigger(&self) {
        self.kick.notify_one();
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns true when this call brought the poller back online.
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        let reconnected = online && !was_online;
        if reconnected {
            tracing::info!("connectivity restored, re-syncing reminders");
            self.trigger();
        } else if !online && was_online {
            tracing::info!("connectivity lost, reminder polling paused");
        }
        reconnected
    }

    pub fn start(&self) -> JoinHandle<()> {
        self.shutdown.send_replace(false);
        let poller = self.clone();
        tokio::spawn(async move {
            poller.run_loop().await;
        })
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    async fn run_loop(self) {
        let period = Duration::from_secs(self.scheduler.settings().poll_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.kick.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow_and_update() {
                break;
            }
            if !self.is_online() {
                continue;
            }
            if let Err(error) = self.poll_once(Utc::now()).await {
                tracing::warn!(error = %error, "reminder poll failed, keeping current timers");
            }
        }
    }
}
