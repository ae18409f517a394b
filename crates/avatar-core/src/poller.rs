//! Run-completion poller.
//!
//! A run starts `Pending`; each tick asks the upstream for its status and moves to
//! `Done` on `completed` or `Failed` on any status that can no longer reach it.
//! Ticks are a fixed interval apart and the whole wait is bounded by a deadline.
//! Dropping the future returned by [`RunPoller::wait`] cancels the wait.

use std::time::Duration;

use crate::assistant::{AssistantClient, RunStatus};
use crate::config::PollSettings;
use crate::error::{AvatarError, AvatarResult};

/// Poller state derived from one status observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Done,
    Failed(RunStatus),
}

impl RunState {
    pub fn from_status(status: &RunStatus) -> Self {
        match status {
            RunStatus::Completed => RunState::Done,
            // Nothing submits tool outputs, so requires_action never progresses.
            RunStatus::Failed
            | RunStatus::Cancelled
            | RunStatus::Expired
            | RunStatus::Incomplete
            | RunStatus::RequiresAction => RunState::Failed(status.clone()),
            RunStatus::Queued | RunStatus::InProgress | RunStatus::Cancelling | RunStatus::Other(_) => {
                RunState::Pending
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Pending)
    }
}

/// Drives a run to a terminal state.
#[derive(Debug, Clone, Copy)]
pub struct RunPoller {
    interval: Duration,
    deadline: Duration,
}

impl RunPoller {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }

    pub fn from_settings(settings: &PollSettings) -> Self {
        Self::new(settings.interval, settings.deadline)
    }

    /// Wait until the run completes. `RunFailed` on a failed terminal status,
    /// `RunTimedOut` once the deadline passes; upstream errors end the wait immediately.
    pub async fn wait(
        &self,
        client: &dyn AssistantClient,
        thread_id: &str,
        run_id: &str,
    ) -> AvatarResult<()> {
        match tokio::time::timeout(self.deadline, self.drive(client, thread_id, run_id)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(run_id, after = ?self.deadline, "run did not reach a terminal state");
                Err(AvatarError::RunTimedOut {
                    run_id: run_id.to_string(),
                    after: self.deadline,
                })
            }
        }
    }

    async fn drive(&self, client: &dyn AssistantClient, thread_id: &str, run_id: &str) -> AvatarResult<()> {
        let mut ticks: u32 = 0;
        loop {
            let status = client.run_status(thread_id, run_id).await?;
            ticks += 1;
            tracing::debug!(run_id, tick = ticks, status = %status, "run status");
            match RunState::from_status(&status) {
                RunState::Done => return Ok(()),
                RunState::Failed(status) => {
                    return Err(AvatarError::RunFailed {
                        run_id: run_id.to_string(),
                        status: status.to_string(),
                    })
                }
                RunState::Pending => tokio::time::sleep(self.interval).await,
            }
        }
    }
}

impl Default for RunPoller {
    fn default() -> Self {
        Self::from_settings(&PollSettings::default())
    }
}
