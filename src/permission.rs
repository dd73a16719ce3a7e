use crate::errors::AppResult;
use crate::models::PermissionState;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

pub type PromptFuture<'a> = Pin<Box<dyn Future<Output = AppResult<PermissionState>> + Send + 'a>>;

/// External consent prompt (the platform's `requestPermission`).
pub trait PermissionPrompt: Send + Sync {
    fn request(&self) -> PromptFuture<'_>;
}

/// Process-wide notification capability flag.
#[derive(Debug, Clone, Default)]
pub struct PermissionGate {
    state: Arc<RwLock<PermissionState>>,
}

impl PermissionGate {
    pub fn new(initial: PermissionState) -> Self {
        Self {
            state: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn state(&self) -> PermissionState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn is_granted(&self) -> bool {
        self.state() == PermissionState::Granted
    }

    /// Records the result of a consent prompt and returns the previous state.
    pub fn record(&self, result: PermissionState) -> PermissionState {
        let previous = {
            let mut state = match self.state.write() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *state, result)
        };
        if previous != result {
            tracing::info!(
                from = previous.as_str(),
                to = result.as_str(),
                "notification permission changed"
            );
        }
        previous
    }

    /// Runs the prompt and records its answer. A prompt that cannot run leaves the gate untouched.
    pub async fn request(&self, prompt: &dyn PermissionPrompt) -> AppResult<PermissionState> {
        let result = prompt.request().await?;
        self.record(result);
        Ok(result)
    }
}
