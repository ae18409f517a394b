//! Wiring: configuration → clients → conversation + talk pipeline.
//! Missing credentials do not stop the gateway; calls that need them fail with a config error.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use avatar_core::{
    AssistantClient, AvatarConfig, AvatarError, AvatarResult, Conversation, ElevenLabsTts, OpenAiAssistants,
    RunPoller, RunStatus, SpeechSynthesizer, TalkPipeline,
};

use crate::handlers::AppState;

/// Stands in for a client whose credentials are not configured.
struct Unconfigured {
    reason: String,
}

impl Unconfigured {
    fn from_error(e: AvatarError) -> Self {
        let reason = match e {
            AvatarError::Config(reason) => reason,
            other => other.to_string(),
        };
        Self { reason }
    }

    fn fail<T>(&self) -> AvatarResult<T> {
        Err(AvatarError::Config(self.reason.clone()))
    }
}

#[async_trait]
impl AssistantClient for Unconfigured {
    async fn create_assistant(&self, _instructions: &str) -> AvatarResult<String> {
        self.fail()
    }
    async fn create_thread(&self) -> AvatarResult<String> {
        self.fail()
    }
    async fn post_user_message(&self, _thread_id: &str, _text: &str) -> AvatarResult<()> {
        self.fail()
    }
    async fn start_run(&self, _thread_id: &str, _assistant_id: &str) -> AvatarResult<String> {
        self.fail()
    }
    async fn run_status(&self, _thread_id: &str, _run_id: &str) -> AvatarResult<RunStatus> {
        self.fail()
    }
    async fn cancel_run(&self, _thread_id: &str, _run_id: &str) -> AvatarResult<()> {
        self.fail()
    }
    async fn latest_message(&self, _thread_id: &str) -> AvatarResult<String> {
        self.fail()
    }
}

#[async_trait]
impl SpeechSynthesizer for Unconfigured {
    async fn synthesize_to_file(&self, _text: &str, _dest: &Path) -> AvatarResult<()> {
        self.fail()
    }
}

/// Build the shared handler state from configuration.
pub fn build_state(config: &AvatarConfig) -> AppState {
    let assistant: Arc<dyn AssistantClient> = match OpenAiAssistants::from_settings(&config.assistant) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::warn!("Assistant client unavailable: {}", e);
            Arc::new(Unconfigured::from_error(e))
        }
    };
    let speech: Arc<dyn SpeechSynthesizer> = match ElevenLabsTts::from_settings(&config.speech) {
        Ok(tts) => Arc::new(tts),
        Err(e) => {
            tracing::warn!("Speech synthesis unavailable: {}", e);
            Arc::new(Unconfigured::from_error(e))
        }
    };

    let conversation = Conversation::new(assistant, RunPoller::from_settings(&config.poll))
        .with_reply_format_directive(config.assistant.reply_format_directive);
    let talk = TalkPipeline::with_subprocesses(speech, &config.tools);
    AppState::new(conversation, Arc::new(talk))
}
