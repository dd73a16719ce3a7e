use crate::db::Database;
use crate::delivery::{BrowserChannel, ChannelRegistry, CommandSpeaker, EmailChannel, Speaker, VoiceChannel};
use crate::errors::{AppError, AppResult};
use crate::fire_time;
use crate::models::{
    CreateTaskPayload, EmailOutboxRecord, NotificationRecord, PermissionState, ReminderRule, ReminderSettings,
    RuleKey, SchedulerEvent, Task, TaskFilter, UpdateTaskPayload,
};
use crate::permission::{PermissionGate, PermissionPrompt};
use crate::poller::BackgroundPoller;
use crate::scheduler::Scheduler;
use chrono::{Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

/// Task store, scheduler and poller wired together. Every task mutation goes through here so
/// the armed timers always follow the latest stored version.
pub struct ReminderService {
    db: Arc<Database>,
    scheduler: Scheduler,
    poller: BackgroundPoller,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ReminderService {
    pub fn new(app_data_dir: PathBuf) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(&app_data_dir.join("reminders.sqlite"))?);
        let speaker = Arc::new(CommandSpeaker::from_settings(&db.get_settings()?));
        Self::assemble(db, speaker)
    }

    pub fn with_speaker(app_data_dir: PathBuf, speaker: Arc<dyn Speaker>) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(&app_data_dir.join("reminders.sqlite"))?);
        Self::assemble(db, speaker)
    }

    fn assemble(db: Arc<Database>, speaker: Arc<dyn Speaker>) -> AppResult<Arc<Self>> {
        let settings = db.get_settings()?;
        let gate = PermissionGate::new(db.get_permission_state()?);
        let channels = ChannelRegistry::new(gate)
            .with_channel(Arc::new(BrowserChannel::new(db.clone())))
            .with_channel(Arc::new(EmailChannel::new(db.clone())))
            .with_channel(Arc::new(VoiceChannel::new(speaker)));
        let scheduler = Scheduler::new(settings, channels);
        let poller = BackgroundPoller::new(db.clone(), scheduler.clone());

        Ok(Arc::new(Self {
            db,
            scheduler,
            poller,
            handles: Mutex::new(Vec::new()),
        }))
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn poller(&self) -> &BackgroundPoller {
        &self.poller
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SchedulerEvent> {
        self.scheduler.subscribe()
    }

    /// Starts the timer loop and the background poller. The poller's first tick re-derives
    /// every timer from the store.
    pub fn start(&self) {
        let scheduler = self.scheduler.start();
        let poller = self.poller.start();
        match self.handles.lock() {
            Ok(mut handles) => handles.extend([scheduler, poller]),
            Err(poisoned) => poisoned.into_inner().extend([scheduler, poller]),
        }
        tracing::info!(store = %self.db.path().display(), "reminder service started");
    }

    pub async fn shutdown(&self) {
        self.poller.stop();
        self.scheduler.stop().await;
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if timeout(Duration::from_secs(5), handle).await.is_err() {
                tracing::warn!("background task did not stop in time");
            }
        }
    }

    pub async fn create_task(&self, payload: CreateTaskPayload) -> AppResult<Task> {
        validate_title(&payload.title)?;
        fire_time::validate_alarm(payload.deadline, payload.alarm.as_ref())?;

        let task = self.db.insert_task(&payload)?;
        tracing::info!(task_id = %task.id, "task created");
        self.scheduler.reconcile_task(&task, Utc::now()).await?;
        self.poller.trigger();
        Ok(task)
    }

    pub async fn update_task(&self, task_id: &str, payload: UpdateTaskPayload) -> AppResult<Task> {
        let current = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;
        if let Some(title) = &payload.title {
            validate_title(title)?;
        }
        let deadline = if payload.clear_deadline {
            None
        } else {
            payload.deadline.or(current.deadline)
        };
        let alarm = payload.alarm.as_ref().or(current.alarm.as_ref());
        fire_time::validate_alarm(deadline, alarm)?;

        let task = self.db.update_task(task_id, &payload)?;
        tracing::info!(task_id = %task.id, version = task.version, "task updated");
        self.scheduler.reconcile_task(&task, Utc::now()).await?;
        self.poller.trigger();
        Ok(task)
    }

    pub async fn set_completed(&self, task_id: &str, completed: bool) -> AppResult<Task> {
        let task = self.db.set_task_completed(task_id, completed)?;
        if task.completed {
            self.scheduler.cancel_all(&task.id).await;
        } else {
            self.scheduler.reconcile_task(&task, Utc::now()).await?;
        }
        self.poller.trigger();
        Ok(task)
    }

    pub async fn toggle_completion(&self, task_id: &str) -> AppResult<Task> {
        let current = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;
        self.set_completed(task_id, !current.completed).await
    }

    pub async fn delete_task(&self, task_id: &str) -> AppResult<bool> {
        let deleted = self.db.delete_task(task_id)?;
        self.scheduler.cancel_all(task_id).await;
        if deleted {
            tracing::info!(task_id = %task_id, "task deleted");
            self.poller.trigger();
        }
        Ok(deleted)
    }

    pub fn get_task(&self, task_id: &str) -> AppResult<Option<Task>> {
        self.db.get_task(task_id)
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> AppResult<Vec<Task>> {
        self.db.list_tasks(filter)
    }

    /// Incomplete tasks due between now and the configured lookahead.
    pub fn upcoming_deadlines(&self) -> AppResult<Vec<Task>> {
        let now = Utc::now();
        let lookahead = i64::from(self.scheduler.settings().lookahead_hours);
        self.db.list_tasks(&TaskFilter {
            include_completed: false,
            due_after: Some(now),
            due_before: Some(now + ChronoDuration::hours(lookahead)),
            include_alarm_enabled: false,
        })
    }

    pub fn permission_state(&self) -> PermissionState {
        self.scheduler.channels().gate().state()
    }

    pub fn record_permission(&self, state: PermissionState) -> AppResult<PermissionState> {
        self.scheduler.channels().gate().record(state);
        self.db.set_permission_state(state)?;
        Ok(state)
    }

    pub async fn request_permission(&self, prompt: &dyn PermissionPrompt) -> AppResult<PermissionState> {
        let state = self.scheduler.channels().gate().request(prompt).await?;
        self.db.set_permission_state(state)?;
        Ok(state)
    }

    pub fn set_online(&self, online: bool) -> bool {
        self.poller.set_online(online)
    }

    pub async fn snooze(&self, key: &RuleKey) -> AppResult<ReminderRule> {
        self.scheduler.snooze(key, Utc::now()).await
    }

    pub fn get_settings(&self) -> AppResult<ReminderSettings> {
        self.db.get_settings()
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<ReminderSettings> {
        let settings = self.db.update_settings(update)?;
        self.scheduler.update_settings(settings.clone());
        self.poller.trigger();
        Ok(settings)
    }

    pub fn list_notifications(&self, task_id: Option<&str>) -> AppResult<Vec<NotificationRecord>> {
        self.db.list_notifications(task_id)
    }

    pub fn list_email_outbox(&self) -> AppResult<Vec<EmailOutboxRecord>> {
        self.db.list_email_outbox()
    }
}

fn validate_title(title: &str) -> AppResult<()> {
    if title.trim().is_empty() {
        return Err(AppError::InvalidInput("Task title is required".to_string()));
    }
    Ok(())
}
