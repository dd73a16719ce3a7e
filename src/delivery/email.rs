use super::{DeliveryChannel, DeliveryFuture};
use crate::errors::AppResult;
use crate::models::{Channel, DeliveryOutcome, NotificationPayload, ReminderNotice};
use std::sync::Arc;

/// Hand-off point to an external email/push sender. Delivery confirmation is not tracked.
pub trait EmailSender: Send + Sync {
    fn send(&self, payload: &NotificationPayload) -> AppResult<()>;
}

pub struct EmailChannel {
    sender: Arc<dyn EmailSender>,
}

impl EmailChannel {
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self { sender }
    }
}

impl DeliveryChannel for EmailChannel {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn present<'a>(&'a self, notice: &'a ReminderNotice) -> DeliveryFuture<'a> {
        Box::pin(async move {
            match self.sender.send(&payload_for(notice)) {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(error) => DeliveryOutcome::Failed(error.to_string()),
            }
        })
    }
}

pub fn payload_for(notice: &ReminderNotice) -> NotificationPayload {
    NotificationPayload {
        title: notice.title.clone(),
        body: notice.body.clone(),
        task_id: notice.key.task_id.clone(),
        offset_minutes: notice.key.trigger.offset_minutes(),
    }
}
