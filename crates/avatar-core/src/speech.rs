//! Speech synthesis: text to an mp3 file on disk.
//!
//! `ElevenLabsTts` streams the voice API response straight into the destination file,
//! so long utterances never sit fully in memory.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::config::SpeechSettings;
use crate::error::{AvatarError, AvatarResult};

const SERVICE: &str = "speech";

/// Backend that writes synthesized speech for `text` to `dest`.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize_to_file(&self, text: &str, dest: &Path) -> AvatarResult<()>;
}

#[derive(Debug, Clone, Copy, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    voice_settings: VoiceSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_id: Option<&'a str>,
}

/// Production TTS backend: ElevenLabs text-to-speech for one configured voice.
#[derive(Debug, Clone)]
pub struct ElevenLabsTts {
    base_url: String,
    api_key: String,
    voice_id: String,
    model_id: Option<String>,
    voice_settings: VoiceSettings,
    client: reqwest::Client,
}

impl ElevenLabsTts {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        voice_id: impl Into<String>,
    ) -> AvatarResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AvatarError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            voice_id: voice_id.into(),
            model_id: None,
            voice_settings: VoiceSettings {
                stability: 0.5,
                similarity_boost: 0.5,
            },
            client,
        })
    }

    /// Build from settings; API key and voice id are both required.
    pub fn from_settings(settings: &SpeechSettings) -> AvatarResult<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| AvatarError::Config("ELEVEN_LABS_API_KEY is not set".to_string()))?;
        let voice_id = settings
            .voice_id
            .clone()
            .ok_or_else(|| AvatarError::Config("ELEVEN_LABS_VOICE_ID is not set".to_string()))?;
        let mut tts = Self::new(&settings.base_url, api_key, voice_id)?
            .with_voice_settings(settings.stability, settings.similarity_boost);
        tts.model_id = settings.model_id.clone();
        Ok(tts)
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_voice_settings(mut self, stability: f32, similarity_boost: f32) -> Self {
        self.voice_settings = VoiceSettings {
            stability,
            similarity_boost,
        };
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsTts {
    async fn synthesize_to_file(&self, text: &str, dest: &Path) -> AvatarResult<()> {
        let url = format!("{}/text-to-speech/{}", self.base_url, self.voice_id);
        let body = SpeechRequest {
            text,
            voice_settings: self.voice_settings,
            model_id: self.model_id.as_deref(),
        };
        let res = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header(reqwest::header::ACCEPT, "audio/mpeg")
            .json(&body)
            .send()
            .await
            .map_err(|e| AvatarError::remote(SERVICE, None, e.to_string()))?;
        let status = res.status();
        if status != reqwest::StatusCode::OK {
            let body = res.text().await.unwrap_or_default();
            return Err(AvatarError::remote(SERVICE, Some(status.as_u16()), body));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = res.bytes_stream();
        let mut written: usize = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AvatarError::remote(SERVICE, Some(200), e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len();
        }
        file.flush().await?;
        if written == 0 {
            return Err(AvatarError::remote(SERVICE, Some(200), "empty audio stream"));
        }
        tracing::debug!(dest = %dest.display(), bytes = written, "speech synthesized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_shape() {
        let body = SpeechRequest {
            text: "Hello",
            voice_settings: VoiceSettings {
                stability: 0.5,
                similarity_boost: 0.75,
            },
            model_id: None,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["text"], "Hello");
        assert_eq!(v["voice_settings"]["similarity_boost"], 0.75);
        assert!(v.get("model_id").is_none());
    }

    #[test]
    fn settings_require_voice_id() {
        let settings = SpeechSettings {
            api_key: Some("xi".into()),
            voice_id: None,
            base_url: "https://api.elevenlabs.io/v1".into(),
            model_id: None,
            stability: 0.5,
            similarity_boost: 0.5,
        };
        assert!(matches!(
            ElevenLabsTts::from_settings(&settings),
            Err(AvatarError::Config(_))
        ));
    }
}
