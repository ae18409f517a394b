//! Talk pipeline: assistant reply → speech → transcode → lip-sync → base64 payload.
//!
//! Every request gets its own artifact directory under the configured root, so
//! concurrent requests never touch each other's files. Inside it, files are named
//! by the message's position in the batch (`message_<i>.{mp3,wav,json}`).
//! Messages are processed sequentially; a message whose synthesis or tooling fails
//! is logged and dropped, the rest of the batch continues. A missing credential is
//! not a per-message failure and aborts the batch with `Config`.

use base64::Engine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::config::ToolSettings;
use crate::error::{AvatarError, AvatarResult};
use crate::reply::{parse_reply, ReplyMessage};
use crate::speech::SpeechSynthesizer;
use crate::tools::{CommandRunner, SubprocessRunner, ToolCommand};

/// Paths of one message's artifacts inside a request directory.
#[derive(Debug, Clone)]
pub struct MessageArtifacts {
    pub mp3: PathBuf,
    pub wav: PathBuf,
    pub json: PathBuf,
}

impl MessageArtifacts {
    pub fn at(dir: &Path, index: usize) -> Self {
        let stem = format!("message_{}", index);
        Self {
            mp3: dir.join(format!("{}.mp3", stem)),
            wav: dir.join(format!("{}.wav", stem)),
            json: dir.join(format!("{}.json", stem)),
        }
    }
}

/// Request-scoped artifact directory; removed on drop unless kept.
pub struct RequestDir {
    request_id: String,
    dir: TempDir,
}

impl RequestDir {
    pub fn create(root: &Path, keep: bool) -> AvatarResult<Self> {
        std::fs::create_dir_all(root)?;
        let request_id = uuid::Uuid::new_v4().simple().to_string();
        let dir = tempfile::Builder::new()
            .prefix(&format!("talk-{}-", request_id))
            .keep(keep)
            .tempdir_in(root)?;
        Ok(Self { request_id, dir })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Removing the directory is blocking filesystem work; keep it off the async workers.
async fn remove_dir(dir: RequestDir) {
    if let Err(e) = tokio::task::spawn_blocking(move || drop(dir)).await {
        tracing::warn!(error = %e, "artifact cleanup task failed");
    }
}

/// Turns an assistant reply into lip-synced, voiced messages.
pub struct TalkPipeline {
    speech: Arc<dyn SpeechSynthesizer>,
    runner: Arc<dyn CommandRunner>,
    ffmpeg: PathBuf,
    rhubarb: PathBuf,
    artifact_root: PathBuf,
    keep_artifacts: bool,
}

impl TalkPipeline {
    pub fn new(
        speech: Arc<dyn SpeechSynthesizer>,
        runner: Arc<dyn CommandRunner>,
        settings: &ToolSettings,
    ) -> Self {
        Self {
            speech,
            runner,
            ffmpeg: settings.ffmpeg_path.clone(),
            rhubarb: settings.rhubarb_path.clone(),
            artifact_root: settings.artifact_root.clone(),
            keep_artifacts: settings.keep_artifacts,
        }
    }

    /// Pipeline running the real tools as subprocesses.
    pub fn with_subprocesses(speech: Arc<dyn SpeechSynthesizer>, settings: &ToolSettings) -> Self {
        Self::new(speech, Arc::new(SubprocessRunner::new(settings.timeout)), settings)
    }

    /// Parse the raw reply and enrich every message that makes it through all stages.
    /// An unparseable reply aborts the whole batch with `InvalidResponseFormat`.
    pub async fn run(&self, raw_reply: &str) -> AvatarResult<Vec<ReplyMessage>> {
        let messages = parse_reply(raw_reply)?;
        self.enrich_all(messages).await
    }

    /// A `Config` error aborts the batch; any other per-message failure drops that message.
    pub async fn enrich_all(&self, messages: Vec<ReplyMessage>) -> AvatarResult<Vec<ReplyMessage>> {
        let root = self.artifact_root.clone();
        let keep = self.keep_artifacts;
        let dir = tokio::task::spawn_blocking(move || RequestDir::create(&root, keep))
            .await
            .map_err(|e| AvatarError::Io(std::io::Error::other(e)))??;
        let total = messages.len();
        tracing::info!(request_id = dir.request_id(), messages = total, "talk pipeline started");

        let mut enriched = Vec::with_capacity(total);
        for (index, message) in messages.into_iter().enumerate() {
            let artifacts = MessageArtifacts::at(dir.path(), index);
            match self.enrich(message, &artifacts).await {
                Ok(message) => enriched.push(message),
                Err(e @ AvatarError::Config(_)) => {
                    tracing::error!(request_id = dir.request_id(), error = %e, "talk pipeline not configured");
                    remove_dir(dir).await;
                    return Err(e);
                }
                Err(e) => tracing::warn!(
                    request_id = dir.request_id(),
                    index,
                    error = %e,
                    "message dropped from talk batch"
                ),
            }
        }

        tracing::info!(
            request_id = dir.request_id(),
            delivered = enriched.len(),
            dropped = total - enriched.len(),
            "talk pipeline finished"
        );
        remove_dir(dir).await;
        Ok(enriched)
    }

    async fn enrich(&self, mut message: ReplyMessage, artifacts: &MessageArtifacts) -> AvatarResult<ReplyMessage> {
        self.speech
            .synthesize_to_file(&message.text, &artifacts.mp3)
            .await?;
        self.runner
            .run(&ToolCommand::transcode(&self.ffmpeg, &artifacts.mp3, &artifacts.wav))
            .await?;
        self.runner
            .run(&ToolCommand::lipsync(&self.rhubarb, &artifacts.wav, &artifacts.json))
            .await?;

        let lipsync_raw = tokio::fs::read(&artifacts.json).await?;
        let lipsync: serde_json::Value = serde_json::from_slice(&lipsync_raw)
            .map_err(|e| AvatarError::InvalidResponseFormat(format!("lip-sync output: {}", e)))?;
        let audio = tokio::fs::read(&artifacts.mp3).await?;

        message.audio = Some(base64::engine::general_purpose::STANDARD.encode(audio));
        message.lipsync = Some(lipsync);
        Ok(message)
    }
}
