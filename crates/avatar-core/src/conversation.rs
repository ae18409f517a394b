//! Conversation service: one user turn against a remote assistant thread.

use std::sync::Arc;

use crate::assistant::AssistantClient;
use crate::error::{AvatarError, AvatarResult};
use crate::poller::RunPoller;
use crate::reply::with_reply_format;

/// Binds an assistant client to the run poller.
#[derive(Clone)]
pub struct Conversation {
    client: Arc<dyn AssistantClient>,
    poller: RunPoller,
    reply_format_directive: bool,
}

impl Conversation {
    pub fn new(client: Arc<dyn AssistantClient>, poller: RunPoller) -> Self {
        Self {
            client,
            poller,
            reply_format_directive: false,
        }
    }

    /// Append the reply-format directive to instructions of newly created assistants.
    pub fn with_reply_format_directive(mut self, enabled: bool) -> Self {
        self.reply_format_directive = enabled;
        self
    }

    /// Create an assistant. Empty instructions are rejected without contacting the upstream.
    pub async fn create_assistant(&self, instructions: &str) -> AvatarResult<String> {
        if instructions.trim().is_empty() {
            return Err(AvatarError::ClientInput("instructions".to_string()));
        }
        let instructions = if self.reply_format_directive {
            with_reply_format(instructions)
        } else {
            instructions.to_string()
        };
        self.client.create_assistant(&instructions).await
    }

    pub async fn start_thread(&self) -> AvatarResult<String> {
        let thread_id = self.client.create_thread().await?;
        tracing::info!(thread_id = %thread_id, "conversation thread started");
        Ok(thread_id)
    }

    /// Post `message`, run the assistant, wait for completion and return the raw reply text.
    ///
    /// A run left behind by a timeout, an upstream error while polling, or a dropped
    /// future (client disconnect) is cancelled in the background.
    pub async fn ask(&self, thread_id: &str, assistant_id: &str, message: &str) -> AvatarResult<String> {
        tracing::info!(thread_id, chars = message.chars().count(), "user message received");
        self.client.post_user_message(thread_id, message).await?;
        let run_id = self.client.start_run(thread_id, assistant_id).await?;

        let run = ActiveRun::new(Arc::clone(&self.client), thread_id, &run_id);
        match self.poller.wait(self.client.as_ref(), thread_id, &run_id).await {
            Ok(()) => run.settle(),
            Err(e @ AvatarError::RunFailed { .. }) => {
                run.settle();
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        let reply = self.client.latest_message(thread_id).await?;
        tracing::info!(thread_id, run_id = %run_id, "run completed");
        Ok(reply)
    }
}

/// A started run that has not reached a terminal state. Cancelled upstream on drop unless settled.
struct ActiveRun {
    client: Arc<dyn AssistantClient>,
    thread_id: String,
    run_id: String,
    armed: bool,
}

impl ActiveRun {
    fn new(client: Arc<dyn AssistantClient>, thread_id: &str, run_id: &str) -> Self {
        Self {
            client,
            thread_id: thread_id.to_string(),
            run_id: run_id.to_string(),
            armed: true,
        }
    }

    /// The run ended on its own; nothing to cancel.
    fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(run_id = %self.run_id, "no runtime to cancel abandoned run");
            return;
        };
        let client = Arc::clone(&self.client);
        let thread_id = std::mem::take(&mut self.thread_id);
        let run_id = std::mem::take(&mut self.run_id);
        handle.spawn(async move {
            match client.cancel_run(&thread_id, &run_id).await {
                Ok(()) => tracing::info!(thread_id = %thread_id, run_id = %run_id, "abandoned run cancelled"),
                Err(e) => tracing::warn!(
                    thread_id = %thread_id,
                    run_id = %run_id,
                    error = %e,
                    "could not cancel abandoned run"
                ),
            }
        });
    }
}
