//! Assistant client: OpenAI Assistants API (assistants, threads, messages, runs).
//! Holds no conversation state; ids are owned by the caller and the upstream.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::AssistantSettings;
use crate::error::{AvatarError, AvatarResult};

const SERVICE: &str = "assistant";

/// Lifecycle status of a run as reported by the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    Other(String),
}

impl RunStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "queued" => RunStatus::Queued,
            "in_progress" => RunStatus::InProgress,
            "requires_action" => RunStatus::RequiresAction,
            "cancelling" => RunStatus::Cancelling,
            "cancelled" => RunStatus::Cancelled,
            "failed" => RunStatus::Failed,
            "completed" => RunStatus::Completed,
            "incomplete" => RunStatus::Incomplete,
            "expired" => RunStatus::Expired,
            other => RunStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
            RunStatus::Completed => "completed",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Expired => "expired",
            RunStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote conversational assistant. Implement for the hosted API or for tests.
#[async_trait]
pub trait AssistantClient: Send + Sync {
    async fn create_assistant(&self, instructions: &str) -> AvatarResult<String>;
    async fn create_thread(&self) -> AvatarResult<String>;
    async fn post_user_message(&self, thread_id: &str, text: &str) -> AvatarResult<()>;
    async fn start_run(&self, thread_id: &str, assistant_id: &str) -> AvatarResult<String>;
    async fn run_status(&self, thread_id: &str, run_id: &str) -> AvatarResult<RunStatus>;
    /// Ask the upstream to stop a run; the thread rejects new messages while one is active.
    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> AvatarResult<()>;
    /// Text of the most recent assistant-authored message on the thread.
    async fn latest_message(&self, thread_id: &str) -> AvatarResult<String>;
}

#[derive(Serialize)]
struct CreateAssistantRequest<'a> {
    model: &'a str,
    instructions: &'a str,
}

#[derive(Serialize)]
struct CreateMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct CreateRunRequest<'a> {
    assistant_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct IdObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    status: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessage {
    role: String,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: String,
    text: Option<TextContent>,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    value: String,
}

/// Production client for the OpenAI Assistants API (v2 beta header).
#[derive(Debug, Clone)]
pub struct OpenAiAssistants {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiAssistants {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> AvatarResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AvatarError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    /// Build from settings; fails with `Config` when no API key is configured.
    pub fn from_settings(settings: &AssistantSettings) -> AvatarResult<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| AvatarError::Config("OPENAI_API_KEY is not set".to_string()))?;
        Self::new(&settings.base_url, api_key, &settings.model)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    /// Send and decode JSON; non-2xx or undecodable bodies become `RemoteService`.
    async fn send_json<T: serde::de::DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> AvatarResult<T> {
        let res = req
            .send()
            .await
            .map_err(|e| AvatarError::remote(SERVICE, None, e.to_string()))?;
        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| AvatarError::remote(SERVICE, Some(status.as_u16()), e.to_string()))?;
        if !status.is_success() {
            return Err(AvatarError::remote(SERVICE, Some(status.as_u16()), text));
        }
        serde_json::from_str(&text).map_err(|e| {
            AvatarError::remote(SERVICE, Some(status.as_u16()), format!("malformed payload: {}", e))
        })
    }
}

#[async_trait]
impl AssistantClient for OpenAiAssistants {
    async fn create_assistant(&self, instructions: &str) -> AvatarResult<String> {
        if instructions.trim().is_empty() {
            return Err(AvatarError::ClientInput("instructions".to_string()));
        }
        let body = CreateAssistantRequest {
            model: &self.model,
            instructions,
        };
        let created: IdObject = self
            .send_json(self.request(reqwest::Method::POST, "assistants").json(&body))
            .await?;
        tracing::info!(assistant_id = %created.id, model = %self.model, "assistant created");
        Ok(created.id)
    }

    async fn create_thread(&self) -> AvatarResult<String> {
        let created: IdObject = self
            .send_json(
                self.request(reqwest::Method::POST, "threads")
                    .json(&serde_json::json!({})),
            )
            .await?;
        Ok(created.id)
    }

    async fn post_user_message(&self, thread_id: &str, text: &str) -> AvatarResult<()> {
        let body = CreateMessageRequest {
            role: "user",
            content: text,
        };
        let _: IdObject = self
            .send_json(
                self.request(reqwest::Method::POST, &format!("threads/{}/messages", thread_id))
                    .json(&body),
            )
            .await?;
        Ok(())
    }

    async fn start_run(&self, thread_id: &str, assistant_id: &str) -> AvatarResult<String> {
        let body = CreateRunRequest { assistant_id };
        let run: IdObject = self
            .send_json(
                self.request(reqwest::Method::POST, &format!("threads/{}/runs", thread_id))
                    .json(&body),
            )
            .await?;
        Ok(run.id)
    }

    async fn run_status(&self, thread_id: &str, run_id: &str) -> AvatarResult<RunStatus> {
        let run: RunObject = self
            .send_json(self.request(
                reqwest::Method::GET,
                &format!("threads/{}/runs/{}", thread_id, run_id),
            ))
            .await?;
        Ok(RunStatus::parse(&run.status))
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> AvatarResult<()> {
        let run: RunObject = self
            .send_json(self.request(
                reqwest::Method::POST,
                &format!("threads/{}/runs/{}/cancel", thread_id, run_id),
            ))
            .await?;
        tracing::info!(thread_id, run_id, status = %run.status, "run cancel requested");
        Ok(())
    }

    async fn latest_message(&self, thread_id: &str) -> AvatarResult<String> {
        let list: MessageList = self
            .send_json(
                self.request(reqwest::Method::GET, &format!("threads/{}/messages", thread_id))
                    .query(&[("order", "desc"), ("limit", "20")]),
            )
            .await?;
        first_assistant_text(list)
            .ok_or_else(|| AvatarError::remote(SERVICE, None, "no assistant reply on thread"))
    }
}

fn first_assistant_text(list: MessageList) -> Option<String> {
    list.data
        .into_iter()
        .filter(|m| m.role == "assistant")
        .find_map(|m| {
            m.content
                .into_iter()
                .find(|c| c.kind == "text")
                .and_then(|c| c.text)
                .map(|t| t.value)
        })
}
