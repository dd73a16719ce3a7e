use super::{DeliveryChannel, DeliveryFuture};
use crate::errors::AppResult;
use crate::models::{Channel, DeliveryOutcome, NotificationAction, NotificationOptions, ReminderNotice};
use std::sync::Arc;

/// Platform notification presenter (`present(title, body, options)`).
pub trait NotificationSurface: Send + Sync {
    fn show(&self, notice: &ReminderNotice, options: &NotificationOptions) -> AppResult<()>;
}

pub struct BrowserChannel {
    surface: Arc<dyn NotificationSurface>,
}

impl BrowserChannel {
    pub fn new(surface: Arc<dyn NotificationSurface>) -> Self {
        Self { surface }
    }
}

impl DeliveryChannel for BrowserChannel {
    fn channel(&self) -> Channel {
        Channel::Browser
    }

    fn requires_permission(&self) -> bool {
        true
    }

    fn present<'a>(&'a self, notice: &'a ReminderNotice) -> DeliveryFuture<'a> {
        Box::pin(async move {
            let options = notification_options(notice);
            match self.surface.show(notice, &options) {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(error) => DeliveryOutcome::Failed(error.to_string()),
            }
        })
    }
}

pub fn notification_options(notice: &ReminderNotice) -> NotificationOptions {
    let task_id = notice.key.task_id.clone();
    NotificationOptions {
        tag: task_id.clone(),
        renotify: true,
        require_interaction: true,
        actions: vec![
            NotificationAction {
                action: "view".to_string(),
                title: "View Task".to_string(),
            },
            NotificationAction {
                action: "snooze".to_string(),
                title: "Snooze".to_string(),
            },
        ],
        data: serde_json::json!({
            "taskId": task_id,
            "url": format!("/tasks/{}", notice.key.task_id),
            "ruleKey": notice.key,
        }),
    }
}
