use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    #[default]
    Browser,
    Email,
    Voice,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::Email => "email",
            Self::Voice => "voice",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepeatInterval {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
}

impl RepeatInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderOffset {
    pub minutes_before: i64,
    #[serde(default)]
    pub channel: Channel,
}

impl ReminderOffset {
    pub fn new(minutes_before: i64, channel: Channel) -> Self {
        Self {
            minutes_before,
            channel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmConfig {
    pub enabled: bool,
    /// Absolute alarm time, independent of the deadline.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub voice_enabled: bool,
    #[serde(default = "default_snooze_minutes")]
    pub snooze_minutes: u32,
    #[serde(default)]
    pub repeat_interval: RepeatInterval,
    /// Empty means "use the configured default offsets".
    #[serde(default)]
    pub reminder_offsets: Vec<ReminderOffset>,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            time: None,
            voice_enabled: false,
            snooze_minutes: default_snooze_minutes(),
            repeat_interval: RepeatInterval::None,
            reminder_offsets: Vec::new(),
        }
    }
}

fn default_snooze_minutes() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub alarm: Option<AlarmConfig>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskPayload {
    pub title: String,
    pub description: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub alarm: Option<AlarmConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskPayload {
    pub title: Option<String>,
    pub description: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clear_deadline: bool,
    pub alarm: Option<AlarmConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFilter {
    #[serde(default)]
    pub include_completed: bool,
    pub due_after: Option<DateTime<Utc>>,
    pub due_before: Option<DateTime<Utc>>,
    /// Also match tasks with an enabled alarm regardless of the deadline window.
    #[serde(default)]
    pub include_alarm_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Trigger {
    Offset { minutes: i64 },
    Alarm { occurrence: u32 },
    Snooze { seq: u32 },
}

impl Trigger {
    pub fn offset_minutes(self) -> Option<i64> {
        match self {
            Self::Offset { minutes } => Some(minutes),
            _ => None,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offset { minutes } => write!(f, "offset:{}", minutes),
            Self::Alarm { occurrence } => write!(f, "alarm:{}", occurrence),
            Self::Snooze { seq } => write!(f, "snooze:{}", seq),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleKey {
    pub task_id: String,
    pub trigger: Trigger,
    pub channel: Channel,
    pub version: i64,
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@v{}",
            self.task_id,
            self.trigger,
            self.channel.as_str(),
            self.version
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleState {
    Pending,
    Armed,
    Fired,
    Cancelled,
    Missed,
}

impl RuleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Armed => "armed",
            Self::Fired => "fired",
            Self::Cancelled => "cancelled",
            Self::Missed => "missed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderRule {
    pub key: RuleKey,
    pub fire_at: DateTime<Utc>,
    pub state: RuleState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "kebab-case")]
pub enum DeliveryOutcome {
    Delivered,
    Skipped(String),
    Failed(String),
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Skipped(_) => "skipped",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionState {
    #[default]
    Unknown,
    Granted,
    Denied,
}

impl PermissionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Granted => "granted",
            Self::Denied => "denied",
        }
    }
}

/// Everything a delivery channel needs to present one fired reminder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderNotice {
    pub key: RuleKey,
    pub title: String,
    pub body: String,
    pub deadline: Option<DateTime<Utc>>,
    pub fire_at: DateTime<Utc>,
}

/// Payload handed to the external email/push sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub task_id: String,
    pub offset_minutes: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOptions {
    pub tag: String,
    pub renotify: bool,
    pub require_interaction: bool,
    pub actions: Vec<NotificationAction>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub task_id: String,
    pub rule_key: String,
    pub title: String,
    pub body: String,
    pub options: NotificationOptions,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailOutboxRecord {
    pub id: String,
    pub payload: NotificationPayload,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub armed: Vec<ReminderRule>,
    pub cancelled: Vec<RuleKey>,
    pub missed: Vec<ReminderRule>,
    pub unchanged: usize,
    /// Listed tasks skipped because a newer version or a cancellation was already applied.
    pub stale: usize,
    /// Task id and error message for tasks whose alarm config could not be scheduled.
    pub errors: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SchedulerEvent {
    Armed { key: RuleKey, fire_at: DateTime<Utc> },
    Cancelled { key: RuleKey },
    Missed { key: RuleKey, fire_at: DateTime<Utc> },
    Fired { key: RuleKey, outcome: DeliveryOutcome },
    Snoozed { key: RuleKey, fire_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReminderSettings {
    pub poll_interval_secs: u64,
    pub lookahead_hours: u32,
    pub missed_grace_secs: u64,
    pub ledger_retention_hours: u32,
    pub default_offsets: Vec<ReminderOffset>,
    pub speech_program: String,
    pub speech_args: Vec<String>,
    pub speech_timeout_secs: u64,
}

impl Default for ReminderSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            lookahead_hours: 24 * 7,
            missed_grace_secs: 0,
            ledger_retention_hours: 24,
            default_offsets: vec![
                ReminderOffset::new(30, Channel::Browser),
                ReminderOffset::new(60, Channel::Browser),
                ReminderOffset::new(24 * 60, Channel::Browser),
            ],
            speech_program: if cfg!(target_os = "macos") {
                "say".to_string()
            } else {
                "espeak".to_string()
            },
            speech_args: Vec::new(),
            speech_timeout_secs: 15,
        }
    }
}
