use crate::delivery::{self, ChannelRegistry};
use crate::errors::{AppError, AppResult};
use crate::fire_time;
use crate::models::{
    DeliveryOutcome, ReconcileReport, ReminderRule, ReminderSettings, RuleKey, RuleState, SchedulerEvent, Task,
    Trigger,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Upper bound on one sleep of the timer loop, so wall-clock jumps are noticed.
const MAX_IDLE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct ArmedTimer {
    fire_at: DateTime<Utc>,
    task: Arc<Task>,
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    state: RuleState,
    fire_at: DateTime<Utc>,
    task: Arc<Task>,
}

/// Newest version and last targeted mutation the book has seen for one task.
#[derive(Debug, Clone, Copy, Default)]
struct TaskMark {
    version: i64,
    touched: u64,
    retired: bool,
}

/// Position in the mutation sequence, taken before a task listing is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListingMark(u64);

/// Armed timers plus the terminal state of every rule seen since startup.
#[derive(Debug, Default)]
struct TimerBook {
    armed: BTreeMap<RuleKey, ArmedTimer>,
    ledger: HashMap<RuleKey, LedgerEntry>,
    tasks: HashMap<String, TaskMark>,
    seq: u64,
}

impl TimerBook {
    fn state_of(&self, key: &RuleKey) -> Option<RuleState> {
        if self.armed.contains_key(key) {
            return Some(RuleState::Armed);
        }
        self.ledger.get(key).map(|entry| entry.state)
    }

    fn cancel(&mut self, key: &RuleKey) -> bool {
        let Some(timer) = self.armed.remove(key) else {
            return false;
        };
        self.ledger.insert(
            key.clone(),
            LedgerEntry {
                state: RuleState::Cancelled,
                fire_at: timer.fire_at,
                task: timer.task,
            },
        );
        true
    }

    fn cancel_where(&mut self, predicate: impl Fn(&RuleKey, &ArmedTimer) -> bool) -> Vec<RuleKey> {
        let keys = self
            .armed
            .iter()
            .filter(|(key, timer)| predicate(key, timer))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        keys.into_iter().filter(|key| self.cancel(key)).collect()
    }

    /// Records a targeted mutation (`reconcile_task` or `cancel_all`) of one task.
    fn touch(&mut self, task_id: &str, retired: bool) {
        self.seq += 1;
        let seq = self.seq;
        let mark = self.tasks.entry(task_id.to_string()).or_default();
        mark.touched = seq;
        mark.retired = retired;
    }

    fn observe(&mut self, task: &Task) {
        let mark = self.tasks.entry(task.id.clone()).or_default();
        if task.version > mark.version {
            mark.version = task.version;
            mark.retired = false;
        }
    }

    /// A listed task is stale when it was mutated after the listing was taken, when a newer
    /// version was already applied, or when its timers were retired at this version.
    fn is_stale(&self, task: &Task, as_of: u64) -> bool {
        let Some(mark) = self.tasks.get(&task.id) else {
            return false;
        };
        mark.touched > as_of
            || task.version < mark.version
            || (mark.retired && task.version <= mark.version)
    }

    /// Diffs one task's derived rules against what is armed for it. Timers of the current
    /// version that are already due stay armed until the timer loop fires them.
    fn apply_task(
        &mut self,
        task: &Arc<Task>,
        derived: Vec<ReminderRule>,
        now: DateTime<Utc>,
        grace: ChronoDuration,
        report: &mut ReconcileReport,
    ) {
        let wanted = derived.iter().map(|rule| &rule.key).collect::<HashSet<_>>();
        let cancelled = self.cancel_where(|key, timer| {
            let current = key.version == task.version;
            key.task_id == task.id
                && !wanted.contains(key)
                && !(current && matches!(key.trigger, Trigger::Snooze { .. }))
                && !(current && timer.fire_at <= now)
        });
        report.cancelled.extend(cancelled);

        self.ledger
            .retain(|key, _| key.task_id != task.id || key.version >= task.version);

        for mut rule in derived {
            if self.state_of(&rule.key).is_some() {
                report.unchanged += 1;
                continue;
            }
            if rule.fire_at > now - grace {
                rule.state = RuleState::Armed;
                self.armed.insert(
                    rule.key.clone(),
                    ArmedTimer {
                        fire_at: rule.fire_at,
                        task: Arc::clone(task),
                    },
                );
                report.armed.push(rule);
            } else {
                rule.state = RuleState::Missed;
                self.ledger.insert(
                    rule.key.clone(),
                    LedgerEntry {
                        state: RuleState::Missed,
                        fire_at: rule.fire_at,
                        task: Arc::clone(task),
                    },
                );
                report.missed.push(rule);
            }
        }
    }

    /// Removes every due timer and records it as fired before anything is delivered.
    fn take_due(&mut self, now: DateTime<Utc>) -> Vec<(RuleKey, ArmedTimer)> {
        let due_keys = self
            .armed
            .iter()
            .filter(|(_, timer)| timer.fire_at <= now)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        let mut due = Vec::with_capacity(due_keys.len());
        for key in due_keys {
            if let Some(timer) = self.armed.remove(&key) {
                self.ledger.insert(
                    key.clone(),
                    LedgerEntry {
                        state: RuleState::Fired,
                        fire_at: timer.fire_at,
                        task: Arc::clone(&timer.task),
                    },
                );
                due.push((key, timer));
            }
        }
        due.sort_by(|left, right| left.1.fire_at.cmp(&right.1.fire_at));
        due
    }

    fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.armed.values().map(|timer| timer.fire_at).min()
    }

    fn prune_absent(&mut self, present: &HashSet<&str>, cutoff: DateTime<Utc>, as_of: u64) {
        self.ledger
            .retain(|key, entry| present.contains(key.task_id.as_str()) || entry.fire_at >= cutoff);
        let live = self
            .armed
            .keys()
            .chain(self.ledger.keys())
            .map(|key| key.task_id.clone())
            .collect::<HashSet<_>>();
        self.tasks
            .retain(|id, mark| present.contains(id.as_str()) || mark.touched > as_of || live.contains(id));
    }
}

/// Owns the armed reminder timers of this process.
#[derive(Clone)]
pub struct Scheduler {
    book: Arc<Mutex<TimerBook>>,
    channels: ChannelRegistry,
    settings: Arc<RwLock<ReminderSettings>>,
    events: Arc<RwLock<Option<mpsc::UnboundedSender<SchedulerEvent>>>>,
    wake: Arc<Notify>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Scheduler {
    pub fn new(settings: ReminderSettings, channels: ChannelRegistry) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            book: Arc::new(Mutex::new(TimerBook::default())),
            channels,
            settings: Arc::new(RwLock::new(settings)),
            events: Arc::new(RwLock::new(None)),
            wake: Arc::new(Notify::new()),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn settings(&self) -> ReminderSettings {
        match self.settings.read() {
            Ok(settings) => settings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update_settings(&self, settings: ReminderSettings) {
        let mut writer = match self.settings.write() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        *writer = settings;
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Replaces any previous subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SchedulerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut writer = match self.events.write() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        *writer = Some(tx);
        rx
    }

    fn emit(&self, event: SchedulerEvent) {
        let reader = match self.events.read() {
            Ok(reader) => reader,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(tx) = reader.as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Take this before reading a task listing that will be passed to `reconcile_listing`.
    pub async fn mark(&self) -> ListingMark {
        ListingMark(self.book.lock().await.seq)
    }

    /// Resynchronizes against a task list that is current as of this call. Timers of tasks
    /// missing from `tasks` are cancelled.
    pub async fn reconcile(&self, tasks: &[Task], now: DateTime<Utc>) -> ReconcileReport {
        self.reconcile_with(tasks, now, None).await
    }

    /// Like `reconcile`, for a listing read after `mark` was taken. Tasks created, edited or
    /// cancelled since the mark keep the state those mutations gave them.
    pub async fn reconcile_listing(
        &self,
        tasks: &[Task],
        now: DateTime<Utc>,
        mark: ListingMark,
    ) -> ReconcileReport {
        self.reconcile_with(tasks, now, Some(mark)).await
    }

    async fn reconcile_with(
        &self,
        tasks: &[Task],
        now: DateTime<Utc>,
        mark: Option<ListingMark>,
    ) -> ReconcileReport {
        let settings = self.settings();
        let grace = fire_time::grace_window(&settings);
        let retention = ChronoDuration::hours(i64::from(settings.ledger_retention_hours));
        let mut report = ReconcileReport::default();

        {
            let mut book = self.book.lock().await;
            let as_of = mark.map(|ListingMark(seq)| seq).unwrap_or(book.seq);
            let present = tasks.iter().map(|task| task.id.as_str()).collect::<HashSet<_>>();
            let fresh = book
                .tasks
                .iter()
                .filter(|(_, mark)| mark.touched > as_of)
                .map(|(id, _)| id.clone())
                .collect::<HashSet<_>>();
            let cancelled = book.cancel_where(|key, _| {
                !present.contains(key.task_id.as_str()) && !fresh.contains(&key.task_id)
            });
            report.cancelled.extend(cancelled);

            for task in tasks {
                if book.is_stale(task, as_of) {
                    tracing::debug!(task_id = %task.id, version = task.version, "skipping outdated task snapshot");
                    report.stale += 1;
                    continue;
                }
                book.observe(task);
                let task = Arc::new(task.clone());
                let derived = match fire_time::derive_rules(&task, now, &settings) {
                    Ok(derived) => derived,
                    Err(error) => {
                        tracing::warn!(task_id = %task.id, error = %error, "cannot schedule reminders for task");
                        report.errors.push((task.id.clone(), error.to_string()));
                        Vec::new()
                    }
                };
                book.apply_task(&task, derived, now, grace, &mut report);
            }

            book.prune_absent(&present, now - retention, as_of);
        }

        self.publish(&report);
        report
    }

    /// Reconciles a single task after it was created or edited. A version older than one
    /// already applied is ignored.
    pub async fn reconcile_task(&self, task: &Task, now: DateTime<Utc>) -> AppResult<ReconcileReport> {
        let settings = self.settings();
        let grace = fire_time::grace_window(&settings);
        let task = Arc::new(task.clone());
        let derived = fire_time::derive_rules(&task, now, &settings);
        let mut report = ReconcileReport::default();

        {
            let mut book = self.book.lock().await;
            let outdated = book
                .tasks
                .get(&task.id)
                .is_some_and(|mark| task.version < mark.version);
            if outdated {
                tracing::debug!(task_id = %task.id, version = task.version, "skipping outdated task version");
                report.stale += 1;
            } else {
                book.observe(&task);
                book.touch(&task.id, false);
                let rules = match &derived {
                    Ok(rules) => rules.clone(),
                    Err(_) => Vec::new(),
                };
                book.apply_task(&task, rules, now, grace, &mut report);
            }
        }

        self.publish(&report);
        derived.map(|_| report)
    }

    /// Cancels every armed timer of a task and retires its current version. Already fired
    /// reminders are left alone.
    pub async fn cancel_all(&self, task_id: &str) -> Vec<RuleKey> {
        let cancelled = {
            let mut book = self.book.lock().await;
            book.touch(task_id, true);
            book.cancel_where(|key, _| key.task_id == task_id)
        };
        if !cancelled.is_empty() {
            tracing::info!(task_id = %task_id, count = cancelled.len(), "cancelled reminders for task");
        }
        for key in &cancelled {
            self.emit(SchedulerEvent::Cancelled { key: key.clone() });
        }
        self.wake.notify_one();
        cancelled
    }

    /// Fires every timer due at `now`. Each timer leaves the armed set before delivery starts,
    /// so a timer can only ever be delivered once.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Vec<(RuleKey, DeliveryOutcome)> {
        let due = {
            let mut book = self.book.lock().await;
            book.take_due(now)
        };

        let mut outcomes = Vec::with_capacity(due.len());
        for (key, timer) in due {
            let notice = delivery::build_notice(&key, &timer.task, timer.fire_at);
            let outcome = self.channels.dispatch(&notice).await;
            match &outcome {
                DeliveryOutcome::Failed(reason) => {
                    tracing::warn!(rule = %key, reason = %reason, "reminder delivery failed");
                }
                DeliveryOutcome::Skipped(reason) => {
                    tracing::info!(rule = %key, outcome = outcome.as_str(), reason = %reason, "reminder fired");
                }
                DeliveryOutcome::Delivered => {
                    tracing::info!(rule = %key, outcome = outcome.as_str(), fire_at = %timer.fire_at, "reminder fired");
                }
            }
            self.emit(SchedulerEvent::Fired {
                key: key.clone(),
                outcome: outcome.clone(),
            });
            outcomes.push((key, outcome));
        }
        outcomes
    }

    /// Re-arms an already fired reminder `snoozeMinutes` from `now` on the same channel.
    pub async fn snooze(&self, key: &RuleKey, now: DateTime<Utc>) -> AppResult<ReminderRule> {
        let rule = {
            let mut book = self.book.lock().await;
            let task = match book.ledger.get(key) {
                Some(entry) if entry.state == RuleState::Fired => Arc::clone(&entry.task),
                Some(entry) => {
                    return Err(AppError::NotFound(format!(
                        "Reminder {} is {}, only fired reminders can be snoozed",
                        key,
                        entry.state.as_str()
                    )));
                }
                None if book.armed.contains_key(key) => {
                    return Err(AppError::NotFound(format!(
                        "Reminder {} is {}, only fired reminders can be snoozed",
                        key,
                        RuleState::Armed.as_str()
                    )));
                }
                None => {
                    return Err(AppError::NotFound(format!("No reminder {}", key)));
                }
            };
            let minutes = task
                .alarm
                .as_ref()
                .map(|alarm| alarm.snooze_minutes)
                .unwrap_or(5)
                .max(1);
            let previous = book
                .armed
                .keys()
                .chain(book.ledger.keys())
                .filter(|other| {
                    other.task_id == key.task_id
                        && other.version == key.version
                        && other.channel == key.channel
                        && matches!(other.trigger, Trigger::Snooze { .. })
                })
                .count();
            let seq = u32::try_from(previous + 1).unwrap_or(u32::MAX);
            let snooze_key = RuleKey {
                task_id: key.task_id.clone(),
                trigger: Trigger::Snooze { seq },
                channel: key.channel,
                version: key.version,
            };
            let fire_at = now + ChronoDuration::minutes(i64::from(minutes));
            book.armed.insert(snooze_key.clone(), ArmedTimer { fire_at, task });
            ReminderRule {
                key: snooze_key,
                fire_at,
                state: RuleState::Armed,
            }
        };

        tracing::info!(rule = %rule.key, fire_at = %rule.fire_at, "reminder snoozed");
        self.emit(SchedulerEvent::Snoozed {
            key: rule.key.clone(),
            fire_at: rule.fire_at,
        });
        self.wake.notify_one();
        Ok(rule)
    }

    pub async fn armed(&self) -> Vec<ReminderRule> {
        let book = self.book.lock().await;
        let mut rules = book
            .armed
            .iter()
            .map(|(key, timer)| ReminderRule {
                key: key.clone(),
                fire_at: timer.fire_at,
                state: RuleState::Armed,
            })
            .collect::<Vec<_>>();
        rules.sort_by(|left, right| left.fire_at.cmp(&right.fire_at).then_with(|| left.key.cmp(&right.key)));
        rules
    }

    pub async fn rule_state(&self, key: &RuleKey) -> Option<RuleState> {
        self.book.lock().await.state_of(key)
    }

    pub async fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.book.lock().await.next_fire_at()
    }

    fn publish(&self, report: &ReconcileReport) {
        for rule in &report.armed {
            tracing::info!(rule = %rule.key, fire_at = %rule.fire_at, "reminder armed");
            self.emit(SchedulerEvent::Armed {
                key: rule.key.clone(),
                fire_at: rule.fire_at,
            });
        }
        for key in &report.cancelled {
            tracing::info!(rule = %key, "reminder cancelled");
            self.emit(SchedulerEvent::Cancelled { key: key.clone() });
        }
        for rule in &report.missed {
            tracing::warn!(rule = %rule.key, fire_at = %rule.fire_at, "reminder missed");
            self.emit(SchedulerEvent::Missed {
                key: rule.key.clone(),
                fire_at: rule.fire_at,
            });
        }
        if !report.armed.is_empty() || !report.cancelled.is_empty() {
            self.wake.notify_one();
        }
    }

    pub fn start(&self) -> JoinHandle<()> {
        self.shutdown.send_replace(false);
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_loop().await;
        })
    }

    /// Stops the timer loop and drops every armed timer. They are re-derived on the next start.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let dropped = {
            let mut book = self.book.lock().await;
            std::mem::take(&mut book.armed).len()
        };
        tracing::info!(dropped, "reminder scheduler stopped");
    }

    async fn run_loop(self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            self.fire_due(Utc::now()).await;

            let delay = self
                .next_fire_at()
                .await
                .map(|at| {
                    (at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .min(MAX_IDLE)
                })
                .unwrap_or(MAX_IDLE);

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Scheduler;
    use crate::delivery::testing::RecordingChannel;
    use crate::delivery::{ChannelRegistry, NO_PERMISSION};
    use crate::errors::AppError;
    use crate::models::{
        AlarmConfig, Channel, DeliveryOutcome, PermissionState, RepeatInterval, ReminderOffset, ReminderSettings,
        RuleKey, RuleState, SchedulerEvent, Task, Trigger,
    };
    use crate::permission::PermissionGate;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::Arc;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).expect("timestamp").with_timezone(&Utc)
    }

    fn task(id: &str, deadline: &str, offsets: &[i64], version: i64) -> Task {
        let created = at("2024-05-01T00:00:00Z");
        Task {
            id: id.to_string(),
            title: format!("Task {}", id),
            description: None,
            deadline: Some(at(deadline)),
            completed: false,
            completed_at: None,
            alarm: Some(AlarmConfig {
                enabled: true,
                reminder_offsets: offsets
                    .iter()
                    .map(|minutes| ReminderOffset::new(*minutes, Channel::Browser))
                    .collect(),
                ..AlarmConfig::default()
            }),
            version,
            created_at: created,
            updated_at: created,
        }
    }

    fn key(task_id: &str, minutes: i64, version: i64) -> RuleKey {
        RuleKey {
            task_id: task_id.to_string(),
            trigger: Trigger::Offset { minutes },
            channel: Channel::Browser,
            version,
        }
    }

    fn scheduler_with(gate: PermissionState) -> (Scheduler, Arc<RecordingChannel>, PermissionGate) {
        let gate = PermissionGate::new(gate);
        let browser = Arc::new(RecordingChannel::new(Channel::Browser, true));
        let registry = ChannelRegistry::new(gate.clone()).with_channel(browser.clone());
        (Scheduler::new(ReminderSettings::default(), registry), browser, gate)
    }

    #[tokio::test]
    async fn arms_both_offsets_of_the_reference_task() {
        let (scheduler, _, _) = scheduler_with(PermissionState::Granted);
        let t1 = task("t1", "2024-06-01T10:00:00Z", &[30, 60], 1);

        let report = scheduler.reconcile(&[t1], at("2024-06-01T08:30:00Z")).await;
        assert_eq!(report.armed.len(), 2);
        assert!(report.missed.is_empty());

        let armed = scheduler.armed().await;
        assert_eq!(armed[0].fire_at, at("2024-06-01T09:00:00Z"));
        assert_eq!(armed[0].key, key("t1", 60, 1));
        assert_eq!(armed[1].fire_at, at("2024-06-01T09:30:00Z"));
        assert_eq!(scheduler.next_fire_at().await, Some(at("2024-06-01T09:00:00Z")));
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let (scheduler, _, _) = scheduler_with(PermissionState::Granted);
        let mut events = scheduler.subscribe();
        let t1 = task("t1", "2024-06-01T10:00:00Z", &[30, 60], 1);
        let now = at("2024-06-01T08:30:00Z");

        scheduler.reconcile(&[t1.clone()], now).await;
        let second = scheduler.reconcile(&[t1], now).await;
        assert!(second.armed.is_empty());
        assert!(second.cancelled.is_empty());
        assert_eq!(second.unchanged, 2);
        assert_eq!(scheduler.armed().await.len(), 2);

        let mut armed_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SchedulerEvent::Armed { .. }) {
                armed_events += 1;
            }
        }
        assert_eq!(armed_events, 2);
    }

    #[tokio::test]
    async fn each_rule_fires_at_most_once_across_reconciles() {
        let (scheduler, browser, _) = scheduler_with(PermissionState::Granted);
        let t1 = task("t1", "2024-06-01T10:00:00Z", &[30, 60], 1);

        scheduler.reconcile(&[t1.clone()], at("2024-06-01T08:30:00Z")).await;
        let fired = scheduler.fire_due(at("2024-06-01T09:00:00Z")).await;
        assert_eq!(fired, vec![(key("t1", 60, 1), DeliveryOutcome::Delivered)]);

        scheduler.reconcile(&[t1.clone()], at("2024-06-01T09:00:05Z")).await;
        assert!(scheduler.fire_due(at("2024-06-01T09:05:00Z")).await.is_empty());

        let fired = scheduler.fire_due(at("2024-06-01T09:30:00Z")).await;
        assert_eq!(fired.len(), 1);
        scheduler.reconcile(&[t1], at("2024-06-01T09:31:00Z")).await;
        assert!(scheduler.fire_due(at("2024-06-01T11:00:00Z")).await.is_empty());

        assert_eq!(browser.presented().len(), 2);
        assert_eq!(scheduler.rule_state(&key("t1", 60, 1)).await, Some(RuleState::Fired));
    }

    #[tokio::test]
    async fn edit_invalidates_previous_version() {
        let (scheduler, browser, _) = scheduler_with(PermissionState::Granted);
        let v1 = task("t1", "2024-06-01T10:00:00Z", &[30], 1);
        scheduler.reconcile(&[v1], at("2024-06-01T08:00:00Z")).await;

        let v2 = task("t1", "2024-06-01T12:00:00Z", &[30], 2);
        let report = scheduler.reconcile(&[v2], at("2024-06-01T08:10:00Z")).await;
        assert_eq!(report.cancelled, vec![key("t1", 30, 1)]);
        assert_eq!(report.armed.len(), 1);
        assert_eq!(report.armed[0].fire_at, at("2024-06-01T11:30:00Z"));

        assert!(scheduler.fire_due(at("2024-06-01T09:30:00Z")).await.is_empty());
        let fired = scheduler.fire_due(at("2024-06-01T11:30:00Z")).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0.version, 2);
        assert_eq!(browser.presented().len(), 1);
    }

    #[tokio::test]
    async fn past_rules_are_missed_and_never_presented() {
        let (scheduler, browser, _) = scheduler_with(PermissionState::Granted);
        let t1 = task("t1", "2024-06-01T10:00:00Z", &[30, 60], 1);

        let report = scheduler.reconcile(&[t1.clone()], at("2024-06-01T09:15:00Z")).await;
        assert_eq!(report.missed.len(), 1);
        assert_eq!(report.missed[0].key, key("t1", 60, 1));
        assert_eq!(report.armed.len(), 1);

        scheduler.fire_due(at("2024-06-01T09:30:00Z")).await;
        let presented = browser.presented();
        assert_eq!(presented.len(), 1);
        assert_eq!(presented[0].key, key("t1", 30, 1));
        assert_eq!(scheduler.rule_state(&key("t1", 60, 1)).await, Some(RuleState::Missed));

        let again = scheduler.reconcile(&[t1], at("2024-06-01T09:40:00Z")).await;
        assert!(again.missed.is_empty());
    }

    #[tokio::test]
    async fn rule_exactly_at_now_is_missed_without_grace() {
        let (scheduler, _, _) = scheduler_with(PermissionState::Granted);
        let t1 = task("t1", "2024-06-01T10:00:00Z", &[0], 1);
        let report = scheduler.reconcile(&[t1], at("2024-06-01T10:00:00Z")).await;
        assert_eq!(report.missed.len(), 1);
    }

    #[tokio::test]
    async fn grace_window_arms_slightly_late_rules() {
        let (scheduler, browser, _) = scheduler_with(PermissionState::Granted);
        scheduler.update_settings(ReminderSettings {
            missed_grace_secs: 120,
            ..ReminderSettings::default()
        });
        let t1 = task("t1", "2024-06-01T10:00:00Z", &[30], 1);
        let report = scheduler.reconcile(&[t1], at("2024-06-01T09:31:00Z")).await;
        assert_eq!(report.armed.len(), 1);
        assert_eq!(scheduler.fire_due(at("2024-06-01T09:31:00Z")).await.len(), 1);
        assert_eq!(browser.presented().len(), 1);
    }

    #[tokio::test]
    async fn deleted_task_never_fires() {
        let (scheduler, browser, _) = scheduler_with(PermissionState::Granted);
        let t1 = task("t1", "2024-06-01T10:00:00Z", &[30, 60], 1);
        scheduler.reconcile(&[t1], at("2024-06-01T08:30:00Z")).await;

        let cancelled = scheduler.cancel_all("t1").await;
        assert_eq!(cancelled.len(), 2);
        assert!(scheduler.fire_due(at("2024-06-01T09:00:00Z")).await.is_empty());
        assert!(scheduler.fire_due(at("2024-06-01T09:30:00Z")).await.is_empty());
        assert!(browser.presented().is_empty());
        assert_eq!(scheduler.rule_state(&key("t1", 30, 1)).await, Some(RuleState::Cancelled));

        assert!(scheduler.cancel_all("t1").await.is_empty());
    }

    #[tokio::test]
    async fn cancelling_after_fire_is_a_no_op() {
        let (scheduler, _, _) = scheduler_with(PermissionState::Granted);
        let t1 = task("t1", "2024-06-01T10:00:00Z", &[30], 1);
        scheduler.reconcile(&[t1], at("2024-06-01T08:30:00Z")).await;
        scheduler.fire_due(at("2024-06-01T09:30:00Z")).await;

        assert!(scheduler.cancel_all("t1").await.is_empty());
        assert_eq!(scheduler.rule_state(&key("t1", 30, 1)).await, Some(RuleState::Fired));
    }

    #[tokio::test]
    async fn tasks_missing_from_full_reconcile_are_cancelled() {
        let (scheduler, _, _) = scheduler_with(PermissionState::Granted);
        let t1 = task("t1", "2024-06-01T10:00:00Z", &[30], 1);
        let t2 = task("t2", "2024-06-01T11:00:00Z", &[30], 1);
        scheduler.reconcile(&[t1.clone(), t2], at("2024-06-01T08:00:00Z")).await;

        let report = scheduler.reconcile(&[t1], at("2024-06-01T08:01:00Z")).await;
        assert_eq!(report.cancelled, vec![key("t2", 30, 1)]);
        assert_eq!(scheduler.armed().await.len(), 1);
    }

    #[tokio::test]
    async fn outdated_listing_does_not_undo_an_edit() {
        let (scheduler, browser, _) = scheduler_with(PermissionState::Granted);
        let v1 = task("t1", "2024-06-01T10:00:00Z", &[30], 1);
        let v2 = task("t1", "2024-06-01T12:00:00Z", &[30], 2);
        scheduler.reconcile(&[v1.clone()], at("2024-06-01T08:00:00Z")).await;

        scheduler
            .reconcile_task(&v2, at("2024-06-01T08:05:00Z"))
            .await
            .expect("edit");
        let report = scheduler.reconcile(&[v1], at("2024-06-01T08:06:00Z")).await;
        assert_eq!(report.stale, 1);
        assert!(report.armed.is_empty());
        assert!(report.cancelled.is_empty());

        let report = scheduler.reconcile(&[v2], at("2024-06-01T08:07:00Z")).await;
        assert_eq!(report.unchanged, 1);
        assert_eq!(scheduler.rule_state(&key("t1", 30, 2)).await, Some(RuleState::Armed));

        assert!(scheduler.fire_due(at("2024-06-01T09:30:00Z")).await.is_empty());
        let fired = scheduler.fire_due(at("2024-06-01T11:30:00Z")).await;
        assert_eq!(fired, vec![(key("t1", 30, 2), DeliveryOutcome::Delivered)]);
        assert_eq!(browser.presented().len(), 1);
    }

    #[tokio::test]
    async fn listing_taken_before_a_mutation_keeps_that_mutation() {
        let (scheduler, _, _) = scheduler_with(PermissionState::Granted);
        let v1 = task("t1", "2024-06-01T10:00:00Z", &[30], 1);
        scheduler.reconcile(&[v1.clone()], at("2024-06-01T08:00:00Z")).await;

        let mark = scheduler.mark().await;
        let v2 = task("t1", "2024-06-01T12:00:00Z", &[30], 2);
        let t2 = task("t2", "2024-06-01T11:00:00Z", &[30], 1);
        scheduler
            .reconcile_task(&v2, at("2024-06-01T08:05:00Z"))
            .await
            .expect("edit");
        scheduler
            .reconcile_task(&t2, at("2024-06-01T08:05:00Z"))
            .await
            .expect("create");

        let report = scheduler
            .reconcile_listing(&[v1], at("2024-06-01T08:06:00Z"), mark)
            .await;
        assert_eq!(report.stale, 1);
        assert!(report.cancelled.is_empty());
        let armed = scheduler
            .armed()
            .await
            .into_iter()
            .map(|rule| rule.key)
            .collect::<Vec<_>>();
        assert_eq!(armed, vec![key("t2", 30, 1), key("t1", 30, 2)]);

        let fresh = scheduler.mark().await;
        let report = scheduler
            .reconcile_listing(&[v2], at("2024-06-01T08:07:00Z"), fresh)
            .await;
        assert_eq!(report.cancelled, vec![key("t2", 30, 1)]);
    }

    #[tokio::test]
    async fn deletion_during_a_listing_is_not_rearmed() {
        let (scheduler, browser, _) = scheduler_with(PermissionState::Granted);
        let t1 = task("t1", "2024-06-01T10:00:00Z", &[30], 1);
        scheduler.reconcile(&[t1.clone()], at("2024-06-01T08:00:00Z")).await;

        let mark = scheduler.mark().await;
        assert_eq!(scheduler.cancel_all("t1").await, vec![key("t1", 30, 1)]);

        let report = scheduler
            .reconcile_listing(&[t1.clone()], at("2024-06-01T08:06:00Z"), mark)
            .await;
        assert_eq!(report.stale, 1);
        assert!(report.armed.is_empty());

        let report = scheduler.reconcile(&[t1], at("2024-06-01T08:07:00Z")).await;
        assert_eq!(report.stale, 1);
        assert!(scheduler.armed().await.is_empty());
        assert!(scheduler.fire_due(at("2024-06-01T09:30:00Z")).await.is_empty());
        assert!(browser.presented().is_empty());
    }

    #[tokio::test]
    async fn reconcile_keeps_a_due_alarm_until_it_fires() {
        let (scheduler, browser, _) = scheduler_with(PermissionState::Granted);
        let mut daily = task("t1", "2024-06-10T10:00:00Z", &[], 1);
        daily.deadline = None;
        daily.alarm = Some(AlarmConfig {
            enabled: true,
            time: Some(at("2024-06-01T09:00:00Z")),
            repeat_interval: RepeatInterval::Daily,
            ..AlarmConfig::default()
        });
        let alarm = |occurrence: u32| RuleKey {
            task_id: "t1".to_string(),
            trigger: Trigger::Alarm { occurrence },
            channel: Channel::Browser,
            version: 1,
        };

        let report = scheduler.reconcile(&[daily.clone()], at("2024-06-01T08:00:00Z")).await;
        assert_eq!(report.armed.len(), 1);
        assert_eq!(report.armed[0].key, alarm(0));

        let report = scheduler.reconcile(&[daily], at("2024-06-01T09:00:02Z")).await;
        assert!(report.cancelled.is_empty());
        assert_eq!(report.armed.len(), 1);
        assert_eq!(report.armed[0].key, alarm(1));
        assert_eq!(report.armed[0].fire_at, at("2024-06-02T09:00:00Z"));
        assert_eq!(scheduler.rule_state(&alarm(0)).await, Some(RuleState::Armed));

        let fired = scheduler.fire_due(at("2024-06-01T09:00:03Z")).await;
        assert_eq!(fired, vec![(alarm(0), DeliveryOutcome::Delivered)]);
        assert_eq!(browser.presented().len(), 1);
        assert_eq!(scheduler.rule_state(&alarm(1)).await, Some(RuleState::Armed));
    }

    #[tokio::test]
    async fn permission_is_checked_when_the_timer_fires() {
        let (scheduler, browser, gate) = scheduler_with(PermissionState::Denied);
        let t0 = at("2024-06-01T10:00:00Z");
        let t1 = task("t1", "2024-06-01T10:00:10Z", &[0], 1);

        let report = scheduler.reconcile(&[t1], t0).await;
        assert_eq!(report.armed.len(), 1);

        gate.record(PermissionState::Granted);
        let fired = scheduler.fire_due(t0 + Duration::seconds(10)).await;
        assert_eq!(fired[0].1, DeliveryOutcome::Delivered);
        assert_eq!(browser.presented().len(), 1);
    }

    #[tokio::test]
    async fn denied_permission_skips_but_still_consumes_the_rule() {
        let (scheduler, browser, gate) = scheduler_with(PermissionState::Denied);
        let t1 = task("t1", "2024-06-01T10:00:00Z", &[30], 1);
        scheduler.reconcile(&[t1.clone()], at("2024-06-01T09:00:00Z")).await;

        let fired = scheduler.fire_due(at("2024-06-01T09:30:00Z")).await;
        assert_eq!(fired[0].1, DeliveryOutcome::Skipped(NO_PERMISSION.to_string()));

        gate.record(PermissionState::Granted);
        scheduler.reconcile(&[t1], at("2024-06-01T09:31:00Z")).await;
        assert!(scheduler.fire_due(at("2024-06-01T09:32:00Z")).await.is_empty());
        assert!(browser.presented().is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_does_not_block_other_rules() {
        let gate = PermissionGate::new(PermissionState::Granted);
        let mut failing = RecordingChannel::new(Channel::Voice, false);
        failing.outcome = DeliveryOutcome::Failed("no audio device".to_string());
        let browser = Arc::new(RecordingChannel::new(Channel::Browser, true));
        let registry = ChannelRegistry::new(gate)
            .with_channel(Arc::new(failing))
            .with_channel(browser.clone());
        let scheduler = Scheduler::new(ReminderSettings::default(), registry);

        let mut t1 = task("t1", "2024-06-01T10:00:00Z", &[], 1);
        if let Some(alarm) = t1.alarm.as_mut() {
            alarm.reminder_offsets = vec![
                ReminderOffset::new(30, Channel::Voice),
                ReminderOffset::new(30, Channel::Browser),
            ];
        }
        scheduler.reconcile(&[t1], at("2024-06-01T09:00:00Z")).await;
        let fired = scheduler.fire_due(at("2024-06-01T09:30:00Z")).await;
        assert_eq!(fired.len(), 2);
        assert!(fired
            .iter()
            .any(|(key, outcome)| key.channel == Channel::Voice && matches!(outcome, DeliveryOutcome::Failed(_))));
        assert_eq!(browser.presented().len(), 1);
        assert!(scheduler.fire_due(at("2024-06-01T09:45:00Z")).await.is_empty());
    }

    #[tokio::test]
    async fn invalid_task_reports_error_and_cancels_stale_timers() {
        let (scheduler, _, _) = scheduler_with(PermissionState::Granted);
        let good = task("t1", "2024-06-01T10:00:00Z", &[30], 1);
        scheduler.reconcile(&[good], at("2024-06-01T08:00:00Z")).await;

        let mut broken = task("t1", "2024-06-01T10:00:00Z", &[30], 2);
        broken.deadline = None;
        let error = scheduler
            .reconcile_task(&broken, at("2024-06-01T08:05:00Z"))
            .await
            .expect_err("missing deadline");
        assert!(matches!(error, AppError::InvalidSchedule(_)));
        assert!(scheduler.armed().await.is_empty());

        let report = scheduler.reconcile(&[broken], at("2024-06-01T08:06:00Z")).await;
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, "t1");
    }

    #[tokio::test]
    async fn snooze_rearms_a_fired_reminder() {
        let (scheduler, browser, _) = scheduler_with(PermissionState::Granted);
        let t1 = task("t1", "2024-06-01T10:00:00Z", &[30], 1);
        scheduler.reconcile(&[t1.clone()], at("2024-06-01T09:00:00Z")).await;

        let not_fired = scheduler.snooze(&key("t1", 30, 1), at("2024-06-01T09:10:00Z")).await;
        assert!(matches!(not_fired, Err(AppError::NotFound(message)) if message.contains("is armed")));

        scheduler.fire_due(at("2024-06-01T09:30:00Z")).await;
        let snoozed = scheduler
            .snooze(&key("t1", 30, 1), at("2024-06-01T09:30:30Z"))
            .await
            .expect("snooze");
        assert_eq!(snoozed.key.trigger, Trigger::Snooze { seq: 1 });
        assert_eq!(snoozed.fire_at, at("2024-06-01T09:35:30Z"));

        let report = scheduler.reconcile(&[t1], at("2024-06-01T09:31:00Z")).await;
        assert!(report.cancelled.is_empty());

        let fired = scheduler.fire_due(at("2024-06-01T09:35:30Z")).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(browser.presented().len(), 2);
        assert!(browser.presented()[1].body.starts_with("Snoozed reminder"));
    }

    #[tokio::test]
    async fn loop_delivers_due_timers_and_stops() {
        let (scheduler, browser, _) = scheduler_with(PermissionState::Granted);
        let soon = Utc::now() + Duration::milliseconds(150);
        let mut t1 = task("t1", "2024-06-01T10:00:00Z", &[], 1);
        t1.deadline = None;
        if let Some(alarm) = t1.alarm.as_mut() {
            alarm.time = Some(soon);
        }

        let handle = scheduler.start();
        scheduler.reconcile(&[t1], Utc::now()).await;
        tokio::time::sleep(std::time::Duration::from_millis(600)).await;
        assert_eq!(browser.presented().len(), 1);

        scheduler.stop().await;
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("loop exits")
            .expect("join");
    }
}
