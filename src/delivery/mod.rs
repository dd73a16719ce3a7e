pub mod browser;
pub mod email;
pub mod voice;

use crate::models::{Channel, DeliveryOutcome, ReminderNotice, RuleKey, Task, Trigger};
use crate::permission::PermissionGate;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub use browser::{BrowserChannel, NotificationSurface};
pub use email::{EmailChannel, EmailSender};
pub use voice::{CommandSpeaker, Speaker, VoiceChannel};

pub const NO_PERMISSION: &str = "no-permission";
pub const CHANNEL_UNAVAILABLE: &str = "channel-unavailable";

pub type DeliveryFuture<'a> = Pin<Box<dyn Future<Output = DeliveryOutcome> + Send + 'a>>;

pub trait DeliveryChannel: Send + Sync {
    fn channel(&self) -> Channel;
    fn requires_permission(&self) -> bool {
        false
    }
    fn present<'a>(&'a self, notice: &'a ReminderNotice) -> DeliveryFuture<'a>;
}

/// Routes a fired reminder to the implementation registered for its channel.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: HashMap<Channel, Arc<dyn DeliveryChannel>>,
    gate: PermissionGate,
}

impl ChannelRegistry {
    pub fn new(gate: PermissionGate) -> Self {
        Self {
            channels: HashMap::new(),
            gate,
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn DeliveryChannel>) -> Self {
        self.register(channel);
        self
    }

    pub fn register(&mut self, channel: Arc<dyn DeliveryChannel>) {
        self.channels.insert(channel.channel(), channel);
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    /// The gate is read here, at fire time, never when the timer was armed.
    pub async fn dispatch(&self, notice: &ReminderNotice) -> DeliveryOutcome {
        let Some(channel) = self.channels.get(&notice.key.channel) else {
            return DeliveryOutcome::Skipped(CHANNEL_UNAVAILABLE.to_string());
        };
        if channel.requires_permission() && !self.gate.is_granted() {
            return DeliveryOutcome::Skipped(NO_PERMISSION.to_string());
        }
        channel.present(notice).await
    }
}

pub fn describe_offset(minutes: i64) -> String {
    let plural = |count: i64, unit: &str| {
        if count == 1 {
            format!("1 {} remaining", unit)
        } else {
            format!("{} {}s remaining", count, unit)
        }
    };
    if minutes <= 0 {
        "due now".to_string()
    } else if minutes % (24 * 60) == 0 {
        plural(minutes / (24 * 60), "day")
    } else if minutes % 60 == 0 {
        plural(minutes / 60, "hour")
    } else {
        plural(minutes, "minute")
    }
}

fn describe_deadline(deadline: DateTime<Utc>) -> String {
    format!("Deadline: {}", deadline.format("%Y-%m-%d %H:%M UTC"))
}

pub fn build_notice(key: &RuleKey, task: &Task, fire_at: DateTime<Utc>) -> ReminderNotice {
    let body = match key.trigger {
        Trigger::Offset { minutes } => match task.deadline {
            Some(deadline) => format!("{}. {}", capitalize(&describe_offset(minutes)), describe_deadline(deadline)),
            None => capitalize(&describe_offset(minutes)),
        },
        Trigger::Alarm { .. } => format!("Time for task: {}", task.title),
        Trigger::Snooze { .. } => match task.deadline {
            Some(deadline) => format!("Snoozed reminder. {}", describe_deadline(deadline)),
            None => "Snoozed reminder".to_string(),
        },
    };
    ReminderNotice {
        key: key.clone(),
        title: task.title.clone(),
        body,
        deadline: task.deadline,
        fire_at,
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
