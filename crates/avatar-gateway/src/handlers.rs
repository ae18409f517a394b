//! HTTP surface: assistant setup (JSON) and conversational turns (single-event SSE).
//!
//! `/chat` and `/talk` do their work inside the response stream and emit exactly
//! one `data:` frame, either the result or a line starting with `Error: `. This is
//! a one-shot contract, not incremental progress. A client that disconnects drops
//! the stream, which cancels the pending run wait or tool invocation and asks the
//! upstream to cancel the run.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::{
        sse::{Event, Sse},
        Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use avatar_core::{AvatarError, AvatarResult, Conversation, ReplyMessage, TalkPipeline};

#[derive(Clone)]
pub struct AppState {
    conversation: Conversation,
    talk: Arc<TalkPipeline>,
}

impl AppState {
    pub fn new(conversation: Conversation, talk: Arc<TalkPipeline>) -> Self {
        Self { conversation, talk }
    }
}

#[derive(Deserialize)]
struct CreateAssistantRequest {
    #[serde(default)]
    instructions: Option<String>,
}

#[derive(Deserialize)]
struct StartRequest {
    #[serde(default)]
    assistant_id: Option<String>,
}

#[derive(Deserialize)]
struct TurnRequest {
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    assistant_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl TurnRequest {
    /// (thread_id, assistant_id, message); a missing message is sent as empty text.
    fn parts(&self) -> AvatarResult<(&str, &str, &str)> {
        let thread_id = required(self.thread_id.as_deref(), "thread_id")?;
        let assistant_id = required(self.assistant_id.as_deref(), "assistant_id")?;
        Ok((thread_id, assistant_id, self.message.as_deref().unwrap_or("")))
    }
}

fn required<'a>(value: Option<&'a str>, field: &str) -> AvatarResult<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AvatarError::ClientInput(field.to_string())),
    }
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(e: AvatarError) -> ApiError {
    let status = match &e {
        AvatarError::ClientInput(_) => StatusCode::BAD_REQUEST,
        AvatarError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
        AvatarError::RemoteService { .. } | AvatarError::RunFailed { .. } | AvatarError::RunTimedOut { .. } => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if e.is_client_error() {
        tracing::info!("Rejected request: {}", e);
    } else {
        tracing::error!("Request failed: {}", e);
    }
    (status, Json(json!({ "error": e.to_string() })))
}

/// SSE data may not carry bare carriage returns; newlines are split into data lines by axum.
fn sse_text(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\r', "\n")
}

fn error_event(e: &AvatarError) -> Event {
    if e.is_client_error() {
        tracing::info!("Rejected turn: {}", e);
    } else {
        tracing::error!("Turn failed: {}", e);
    }
    Event::default().data(sse_text(&format!("Error: {}", e)))
}

fn single_event<F>(work: F) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>
where
    F: std::future::Future<Output = Event> + Send + 'static,
{
    let stream = async_stream::stream! {
        yield Ok(work.await);
    };
    Sse::new(stream)
}

/// CORS for the avatar front ends.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

pub fn build_app(state: AppState, origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/createAssistant", post(create_assistant))
        .route("/start", post(start_conversation))
        .route("/chat", post(chat))
        .route("/talk", post(talk))
        .with_state(state)
        .layer(cors_layer(origins))
        .layer(axum::middleware::from_fn(log_requests))
}

async fn log_requests(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let peer = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    tracing::info!(method = %request.method(), path = %request.uri().path(), peer = %peer, "request");
    next.run(request).await
}

async fn health() -> &'static str {
    "OK"
}

/// POST /createAssistant {instructions} → {assistant_id}
async fn create_assistant(
    State(state): State<AppState>,
    Json(body): Json<CreateAssistantRequest>,
) -> Result<Json<Value>, ApiError> {
    let instructions = required(body.instructions.as_deref(), "instructions").map_err(api_error)?;
    let assistant_id = state
        .conversation
        .create_assistant(instructions)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "assistant_id": assistant_id })))
}

/// POST /start {assistant_id} → {thread_id}
async fn start_conversation(
    State(state): State<AppState>,
    Json(body): Json<StartRequest>,
) -> Result<Json<Value>, ApiError> {
    let assistant_id = required(body.assistant_id.as_deref(), "assistant_id").map_err(api_error)?;
    let thread_id = state.conversation.start_thread().await.map_err(api_error)?;
    tracing::info!(assistant_id, thread_id = %thread_id, "conversation started");
    Ok(Json(json!({ "thread_id": thread_id })))
}

/// POST /chat {thread_id, assistant_id, message} → one SSE frame with the reply text.
async fn chat(
    State(state): State<AppState>,
    Json(body): Json<TurnRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    single_event(async move {
        match chat_turn(&state, &body).await {
            Ok(reply) => Event::default().data(sse_text(&reply)),
            Err(e) => error_event(&e),
        }
    })
}

async fn chat_turn(state: &AppState, body: &TurnRequest) -> AvatarResult<String> {
    let (thread_id, assistant_id, message) = body.parts()?;
    state.conversation.ask(thread_id, assistant_id, message).await
}

/// POST /talk {thread_id, assistant_id, message} → one SSE frame with voiced, lip-synced messages.
async fn talk(
    State(state): State<AppState>,
    Json(body): Json<TurnRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    single_event(async move {
        match talk_turn(&state, &body).await {
            Ok(messages) => match Event::default().json_data(&messages) {
                Ok(event) => event,
                Err(e) => error_event(&AvatarError::InvalidResponseFormat(e.to_string())),
            },
            Err(e) => error_event(&e),
        }
    })
}

async fn talk_turn(state: &AppState, body: &TurnRequest) -> AvatarResult<Vec<ReplyMessage>> {
    let (thread_id, assistant_id, message) = body.parts()?;
    let raw = state.conversation.ask(thread_id, assistant_id, message).await?;
    state.talk.run(&raw).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use avatar_core::{
        AssistantClient, CommandRunner, ExternalToolError, RunPoller, RunStatus, SpeechSynthesizer, ToolCommand,
        ToolSettings,
    };
    use axum::http::header;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    struct FakeAssistant {
        reply: String,
        final_status: RunStatus,
        /// Returned by create_assistant instead of an id.
        create_error: Option<fn() -> AvatarError>,
        remote_calls: AtomicUsize,
        posted: Mutex<Vec<String>>,
    }

    impl FakeAssistant {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                final_status: RunStatus::Completed,
                create_error: None,
                remote_calls: AtomicUsize::new(0),
                posted: Mutex::new(Vec::new()),
            })
        }

        fn failing_run() -> Arc<Self> {
            Arc::new(Self {
                reply: String::new(),
                final_status: RunStatus::Failed,
                create_error: None,
                remote_calls: AtomicUsize::new(0),
                posted: Mutex::new(Vec::new()),
            })
        }

        fn rejecting_creates(error: fn() -> AvatarError) -> Arc<Self> {
            Arc::new(Self {
                reply: String::new(),
                final_status: RunStatus::Completed,
                create_error: Some(error),
                remote_calls: AtomicUsize::new(0),
                posted: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.remote_calls.load(Ordering::SeqCst)
        }

        fn hit(&self) {
            self.remote_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AssistantClient for FakeAssistant {
        async fn create_assistant(&self, _instructions: &str) -> AvatarResult<String> {
            self.hit();
            match self.create_error {
                Some(error) => Err(error()),
                None => Ok("asst_test".into()),
            }
        }
        async fn create_thread(&self) -> AvatarResult<String> {
            self.hit();
            Ok("thread_test".into())
        }
        async fn post_user_message(&self, _thread_id: &str, text: &str) -> AvatarResult<()> {
            self.hit();
            self.posted.lock().unwrap().push(text.to_string());
            Ok(())
        }
        async fn start_run(&self, _thread_id: &str, _assistant_id: &str) -> AvatarResult<String> {
            self.hit();
            Ok("run_test".into())
        }
        async fn run_status(&self, _thread_id: &str, _run_id: &str) -> AvatarResult<RunStatus> {
            self.hit();
            Ok(self.final_status.clone())
        }
        async fn cancel_run(&self, _thread_id: &str, _run_id: &str) -> AvatarResult<()> {
            self.hit();
            Ok(())
        }
        async fn latest_message(&self, _thread_id: &str) -> AvatarResult<String> {
            self.hit();
            Ok(self.reply.clone())
        }
    }

    struct FakeSpeech;

    #[async_trait]
    impl SpeechSynthesizer for FakeSpeech {
        async fn synthesize_to_file(&self, text: &str, dest: &Path) -> AvatarResult<()> {
            tokio::fs::write(dest, format!("mp3:{}", text)).await?;
            Ok(())
        }
    }

    /// Speech backend whose credentials were never configured.
    struct NoVoice;

    #[async_trait]
    impl SpeechSynthesizer for NoVoice {
        async fn synthesize_to_file(&self, _text: &str, _dest: &Path) -> AvatarResult<()> {
            Err(AvatarError::Config("ELEVEN_LABS_VOICE_ID is not set".into()))
        }
    }

    struct FakeTools;

    #[async_trait]
    impl CommandRunner for FakeTools {
        async fn run(&self, command: &ToolCommand) -> Result<String, ExternalToolError> {
            let args: Vec<PathBuf> = command.args.iter().map(PathBuf::from).collect();
            if command.display_name() == "ffmpeg" {
                std::fs::copy(&args[2], &args[3]).unwrap();
            } else {
                std::fs::write(&args[3], r#"{"mouthCues":[{"start":0.0,"end":0.4,"value":"A"}]}"#).unwrap();
            }
            Ok(String::new())
        }
    }

    const ORIGINS: &[&str] = &["http://localhost:3000"];

    fn app(assistant: Arc<FakeAssistant>, artifacts: &Path) -> Router {
        app_with_speech(assistant, Arc::new(FakeSpeech), artifacts)
    }

    fn app_with_speech(assistant: Arc<FakeAssistant>, speech: Arc<dyn SpeechSynthesizer>, artifacts: &Path) -> Router {
        let conversation = Conversation::new(assistant, RunPoller::new(Duration::from_millis(5), Duration::from_secs(2)));
        let settings = ToolSettings {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            rhubarb_path: PathBuf::from("rhubarb"),
            timeout: Duration::from_secs(5),
            artifact_root: artifacts.to_path_buf(),
            keep_artifacts: false,
        };
        let talk = TalkPipeline::new(speech, Arc::new(FakeTools), &settings);
        let origins: Vec<String> = ORIGINS.iter().map(|s| s.to_string()).collect();
        build_app(AppState::new(conversation, Arc::new(talk)), &origins)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(res: Response) -> String {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Data payloads of each SSE event in the body.
    fn sse_events(body: &str) -> Vec<String> {
        body.split("\n\n")
            .filter(|block| !block.trim().is_empty())
            .map(|block| {
                block
                    .lines()
                    .filter_map(|l| l.strip_prefix("data: ").or_else(|| l.strip_prefix("data:")))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .collect()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let res = app(FakeAssistant::replying(""), dir.path())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_string(res).await, "OK");
    }

    #[tokio::test]
    async fn create_assistant_requires_instructions() {
        let dir = tempfile::tempdir().unwrap();
        let assistant = FakeAssistant::replying("");
        for body in [json!({}), json!({"instructions": ""}), json!({"instructions": "   "})] {
            let res = app(assistant.clone(), dir.path())
                .oneshot(post_json("/createAssistant", body))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::BAD_REQUEST);
            let json: Value = serde_json::from_str(&body_string(res).await).unwrap();
            assert_eq!(json["error"], "Missing instructions");
        }
        assert_eq!(assistant.calls(), 0);
    }

    #[tokio::test]
    async fn create_assistant_returns_id() {
        let dir = tempfile::tempdir().unwrap();
        let res = app(FakeAssistant::replying(""), dir.path())
            .oneshot(post_json("/createAssistant", json!({"instructions": "You are Ava."})))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let json: Value = serde_json::from_str(&body_string(res).await).unwrap();
        assert_eq!(json["assistant_id"], "asst_test");
    }

    #[tokio::test]
    async fn upstream_failures_map_to_gateway_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let cases: [(fn() -> AvatarError, StatusCode); 2] = [
            (
                || AvatarError::Config("OPENAI_API_KEY is not set".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                || AvatarError::RemoteService {
                    service: "assistant",
                    status: Some(401),
                    message: "bad key".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (error, expected) in cases {
            let res = app(FakeAssistant::rejecting_creates(error), dir.path())
                .oneshot(post_json("/createAssistant", json!({"instructions": "You are Ava."})))
                .await
                .unwrap();
            assert_eq!(res.status(), expected);
            let json: Value = serde_json::from_str(&body_string(res).await).unwrap();
            assert_eq!(json["error"], error().to_string());
        }
    }

    #[test]
    fn error_statuses() {
        let status = |e: AvatarError| api_error(e).0;
        assert_eq!(status(AvatarError::ClientInput("thread_id".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(AvatarError::Config("x".into())), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(AvatarError::RunFailed {
                run_id: "run_1".into(),
                status: "expired".into(),
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(AvatarError::RunTimedOut {
                run_id: "run_1".into(),
                after: Duration::from_secs(120),
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(AvatarError::InvalidResponseFormat("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn start_requires_assistant_id() {
        let dir = tempfile::tempdir().unwrap();
        let assistant = FakeAssistant::replying("");
        let res = app(assistant.clone(), dir.path())
            .oneshot(post_json("/start", json!({})))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(assistant.calls(), 0);

        let res = app(assistant, dir.path())
            .oneshot(post_json("/start", json!({"assistant_id": "asst_test"})))
            .await
            .unwrap();
        let json: Value = serde_json::from_str(&body_string(res).await).unwrap();
        assert_eq!(json["thread_id"], "thread_test");
    }

    #[tokio::test]
    async fn chat_streams_single_reply_event() {
        let dir = tempfile::tempdir().unwrap();
        let assistant = FakeAssistant::replying("Hello!\nNice to meet you.");
        let res = app(assistant.clone(), dir.path())
            .oneshot(post_json(
                "/chat",
                json!({"thread_id": "thread_test", "assistant_id": "asst_test", "message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "text/event-stream");
        let events = sse_events(&body_string(res).await);
        assert_eq!(events, ["Hello!\nNice to meet you."]);
        assert_eq!(assistant.posted.lock().unwrap().as_slice(), ["hi"]);
    }

    #[tokio::test]
    async fn chat_without_thread_streams_error() {
        let dir = tempfile::tempdir().unwrap();
        let assistant = FakeAssistant::replying("unused");
        let res = app(assistant.clone(), dir.path())
            .oneshot(post_json("/chat", json!({"assistant_id": "asst_test", "message": "hi"})))
            .await
            .unwrap();
        let events = sse_events(&body_string(res).await);
        assert_eq!(events, ["Error: Missing thread_id"]);
        assert_eq!(assistant.calls(), 0);
    }

    #[tokio::test]
    async fn failed_run_streams_error() {
        let dir = tempfile::tempdir().unwrap();
        let res = app(FakeAssistant::failing_run(), dir.path())
            .oneshot(post_json(
                "/chat",
                json!({"thread_id": "thread_test", "assistant_id": "asst_test", "message": "hi"}),
            ))
            .await
            .unwrap();
        let events = sse_events(&body_string(res).await);
        assert_eq!(events.len(), 1);
        assert!(events[0].starts_with("Error: Run run_test ended with status failed"));
    }

    #[tokio::test]
    async fn talk_streams_enriched_messages() {
        let dir = tempfile::tempdir().unwrap();
        let reply = "```json\n[{\"text\":\"Hi!\",\"facialExpression\":\"smile\",\"animation\":\"Greeting\"},{\"text\":\"Bye!\"}]\n```";
        let res = app(FakeAssistant::replying(reply), dir.path())
            .oneshot(post_json(
                "/talk",
                json!({"thread_id": "thread_test", "assistant_id": "asst_test", "message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(res.headers()[header::CONTENT_TYPE], "text/event-stream");
        let events = sse_events(&body_string(res).await);
        assert_eq!(events.len(), 1);
        let messages: Value = serde_json::from_str(&events[0]).unwrap();
        let messages = messages.as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["text"], "Hi!");
        assert_eq!(messages[0]["facialExpression"], "smile");
        assert_eq!(messages[1]["animation"], "Idle");
        for m in messages {
            assert!(!m["audio"].as_str().unwrap().is_empty());
            assert_eq!(m["lipsync"]["mouthCues"][0]["value"], "A");
        }
    }

    #[tokio::test]
    async fn talk_without_voice_credentials_streams_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let res = app_with_speech(
            FakeAssistant::replying(r#"[{"text":"Hi!"},{"text":"Bye!"}]"#),
            Arc::new(NoVoice),
            dir.path(),
        )
        .oneshot(post_json(
            "/talk",
            json!({"thread_id": "thread_test", "assistant_id": "asst_test", "message": "hi"}),
        ))
        .await
        .unwrap();
        let events = sse_events(&body_string(res).await);
        assert_eq!(events, ["Error: Configuration error: ELEVEN_LABS_VOICE_ID is not set"]);
    }

    #[tokio::test]
    async fn talk_with_unparseable_reply_streams_error() {
        let dir = tempfile::tempdir().unwrap();
        let res = app(FakeAssistant::replying("Just plain words."), dir.path())
            .oneshot(post_json(
                "/talk",
                json!({"thread_id": "thread_test", "assistant_id": "asst_test", "message": "hi"}),
            ))
            .await
            .unwrap();
        let events = sse_events(&body_string(res).await);
        assert_eq!(events.len(), 1);
        assert!(events[0].starts_with("Error: Invalid response format"));
    }

    #[tokio::test]
    async fn cors_allows_configured_origin_only() {
        let dir = tempfile::tempdir().unwrap();
        let preflight = |origin: &str| {
            Request::builder()
                .method("OPTIONS")
                .uri("/talk")
                .header(header::ORIGIN, origin)
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap()
        };
        let res = app(FakeAssistant::replying(""), dir.path())
            .oneshot(preflight("http://localhost:3000"))
            .await
            .unwrap();
        assert_eq!(
            res.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );

        let res = app(FakeAssistant::replying(""), dir.path())
            .oneshot(preflight("http://evil.example"))
            .await
            .unwrap();
        assert!(res.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[test]
    fn carriage_returns_are_normalized() {
        assert_eq!(sse_text("a\r\nb\rc"), "a\nb\nc");
    }
}
