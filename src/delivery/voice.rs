use super::{describe_offset, DeliveryChannel, DeliveryFuture};
use crate::errors::{AppError, AppResult};
use crate::models::{Channel, DeliveryOutcome, ReminderNotice, ReminderSettings, Trigger};
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::time::Duration;

pub type SpeakFuture<'a> = Pin<Box<dyn Future<Output = AppResult<()>> + Send + 'a>>;

/// Speech output (`speak(text)`).
pub trait Speaker: Send + Sync {
    fn speak<'a>(&'a self, text: &'a str) -> SpeakFuture<'a>;
}

/// Speaks through a local text-to-speech program such as `say` or `espeak`.
#[derive(Debug, Clone)]
pub struct CommandSpeaker {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSpeaker {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_settings(settings: &ReminderSettings) -> Self {
        Self::new(
            settings.speech_program.clone(),
            settings.speech_args.clone(),
            Duration::from_secs(settings.speech_timeout_secs.max(1)),
        )
    }
}

impl Speaker for CommandSpeaker {
    fn speak<'a>(&'a self, text: &'a str) -> SpeakFuture<'a> {
        Box::pin(async move {
            let mut command = Command::new(&self.program);
            command
                .args(&self.args)
                .arg(text)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let child = command.spawn().map_err(|error| {
                if error.kind() == std::io::ErrorKind::NotFound {
                    AppError::Delivery(format!("speech output unavailable: '{}' not found", self.program))
                } else {
                    AppError::Delivery(format!("failed to start '{}': {}", self.program, error))
                }
            })?;

            let output = tokio::time::timeout(self.timeout, child.wait_with_output())
                .await
                .map_err(|_| {
                    AppError::Delivery(format!(
                        "'{}' did not finish within {}s",
                        self.program,
                        self.timeout.as_secs()
                    ))
                })??;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(AppError::Delivery(format!(
                    "'{}' exited with {}: {}",
                    self.program,
                    output.status,
                    stderr.trim()
                )));
            }
            Ok(())
        })
    }
}

pub struct VoiceChannel {
    speaker: Arc<dyn Speaker>,
}

impl VoiceChannel {
    pub fn new(speaker: Arc<dyn Speaker>) -> Self {
        Self { speaker }
    }
}

impl DeliveryChannel for VoiceChannel {
    fn channel(&self) -> Channel {
        Channel::Voice
    }

    fn present<'a>(&'a self, notice: &'a ReminderNotice) -> DeliveryFuture<'a> {
        Box::pin(async move {
            let phrase = spoken_phrase(notice);
            match self.speaker.speak(&phrase).await {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(error) => DeliveryOutcome::Failed(error.to_string()),
            }
        })
    }
}

pub fn spoken_phrase(notice: &ReminderNotice) -> String {
    match notice.key.trigger {
        Trigger::Alarm { .. } => format!("Time for task: {}", notice.title),
        Trigger::Offset { minutes } => format!("Reminder: {}, {}", notice.title, describe_offset(minutes)),
        Trigger::Snooze { .. } => format!("Reminder: {}", notice.title),
    }
}

#[cfg(test)]
mod tests {
    use super::{spoken_phrase, CommandSpeaker, Speaker, VoiceChannel};
    use crate::delivery::DeliveryChannel;
    use crate::errors::AppError;
    use crate::models::{Channel, DeliveryOutcome, ReminderNotice, RuleKey, Trigger};
    use chrono::Utc;
    use std::sync::Arc;
    use tokio::time::Duration;

    fn notice(trigger: Trigger) -> ReminderNotice {
        ReminderNotice {
            key: RuleKey {
                task_id: "t1".to_string(),
                trigger,
                channel: Channel::Voice,
                version: 1,
            },
            title: "Call the dentist".to_string(),
            body: String::new(),
            deadline: None,
            fire_at: Utc::now(),
        }
    }

    #[test]
    fn phrases_contain_the_task_title() {
        assert_eq!(
            spoken_phrase(&notice(Trigger::Alarm { occurrence: 0 })),
            "Time for task: Call the dentist"
        );
        assert_eq!(
            spoken_phrase(&notice(Trigger::Offset { minutes: 60 })),
            "Reminder: Call the dentist, 1 hour remaining"
        );
    }

    #[tokio::test]
    async fn missing_speech_program_is_a_delivery_failure() {
        let speaker = CommandSpeaker::new(
            "definitely-not-a-speech-synthesizer",
            Vec::new(),
            Duration::from_secs(1),
        );
        let error = speaker.speak("hello").await.expect_err("missing program");
        assert!(matches!(error, AppError::Delivery(_)));

        let channel = VoiceChannel::new(Arc::new(speaker));
        assert!(!channel.requires_permission());
        let outcome = channel.present(&notice(Trigger::Alarm { occurrence: 0 })).await;
        assert!(matches!(outcome, DeliveryOutcome::Failed(reason) if reason.contains("not found")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_speaker_reports_success_and_non_zero_exit() {
        let ok = CommandSpeaker::new("true", Vec::new(), Duration::from_secs(5));
        ok.speak("ignored").await.expect("true exits zero");

        let failing = CommandSpeaker::new("false", Vec::new(), Duration::from_secs(5));
        assert!(failing.speak("ignored").await.is_err());
    }
}
