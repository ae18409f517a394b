//! Gateway configuration loaded from the environment (`.env` is loaded by the binary first).
//!
//! One `AvatarConfig` is built at startup and handed to each component; nothing reads
//! the environment after that.

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_ASSISTANT_MODEL: &str = "gpt-4-1106-preview";
const DEFAULT_ELEVEN_LABS_BASE_URL: &str = "https://api.elevenlabs.io/v1";
const DEFAULT_ELEVEN_LABS_MODEL: &str = "eleven_multilingual_v2";
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,https://reality-plus-web.vercel.app";

/// Hosted assistant API settings.
#[derive(Debug, Clone)]
pub struct AssistantSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// Append the reply-format directive to instructions on `createAssistant`.
    pub reply_format_directive: bool,
}

/// Hosted speech API settings.
#[derive(Debug, Clone)]
pub struct SpeechSettings {
    pub api_key: Option<String>,
    pub voice_id: Option<String>,
    pub base_url: String,
    /// `None` omits `model_id` from the request body.
    pub model_id: Option<String>,
    pub stability: f32,
    pub similarity_boost: f32,
}

/// External tools and the artifact directory they work in.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub ffmpeg_path: PathBuf,
    pub rhubarb_path: PathBuf,
    pub timeout: Duration,
    pub artifact_root: PathBuf,
    pub keep_artifacts: bool,
}

/// Run polling cadence and overall deadline.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub deadline: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            deadline: Duration::from_secs(120),
        }
    }
}

/// Complete gateway configuration.
///
/// | Env | Default |
/// |-----|---------|
/// | OPENAI_API_KEY | required for assistant calls |
/// | OPENAI_BASE_URL | https://api.openai.com/v1 |
/// | OPENAI_ASSISTANT_MODEL | gpt-4-1106-preview |
/// | ELEVEN_LABS_API_KEY, ELEVEN_LABS_VOICE_ID | required for /talk |
/// | ELEVEN_LABS_BASE_URL | https://api.elevenlabs.io/v1 |
/// | ELEVEN_LABS_MODEL_ID | eleven_multilingual_v2 |
/// | ELEVEN_LABS_STABILITY, ELEVEN_LABS_SIMILARITY_BOOST | 0.5, 0.5 |
/// | FFMPEG_PATH, RHUBARB_PATH | ffmpeg, ./bin/rhubarb |
/// | AVATAR_ARTIFACT_DIR | ./audios |
/// | AVATAR_KEEP_ARTIFACTS | false |
/// | AVATAR_TOOL_TIMEOUT_SECS | 60 |
/// | AVATAR_RUN_POLL_INTERVAL_MS | 1000 |
/// | AVATAR_RUN_DEADLINE_SECS | 120 |
/// | AVATAR_REPLY_FORMAT_DIRECTIVE | true |
/// | AVATAR_BIND_ADDR | 0.0.0.0:5000 |
/// | AVATAR_ALLOWED_ORIGINS | http://localhost:3000,https://reality-plus-web.vercel.app |
/// | AVATAR_LOG_DIR | unset (stdout only) |
#[derive(Debug, Clone)]
pub struct AvatarConfig {
    pub assistant: AssistantSettings,
    pub speech: SpeechSettings,
    pub tools: ToolSettings,
    pub poll: PollSettings,
    pub bind_addr: String,
    pub allowed_origins: Vec<String>,
    pub log_dir: Option<PathBuf>,
}

impl AvatarConfig {
    /// Load from environment. Unset or invalid values fall back to the defaults above.
    pub fn from_env() -> Self {
        let model_id = match std::env::var("ELEVEN_LABS_MODEL_ID") {
            Ok(v) if v.trim().is_empty() => None,
            Ok(v) => Some(v.trim().to_string()),
            Err(_) => Some(DEFAULT_ELEVEN_LABS_MODEL.to_string()),
        };
        Self {
            assistant: AssistantSettings {
                api_key: env_opt_string("OPENAI_API_KEY"),
                base_url: env_string("OPENAI_BASE_URL", DEFAULT_OPENAI_BASE_URL),
                model: env_string("OPENAI_ASSISTANT_MODEL", DEFAULT_ASSISTANT_MODEL),
                reply_format_directive: env_bool("AVATAR_REPLY_FORMAT_DIRECTIVE", true),
            },
            speech: SpeechSettings {
                api_key: env_opt_string("ELEVEN_LABS_API_KEY"),
                voice_id: env_opt_string("ELEVEN_LABS_VOICE_ID"),
                base_url: env_string("ELEVEN_LABS_BASE_URL", DEFAULT_ELEVEN_LABS_BASE_URL),
                model_id,
                stability: env_unit_f32("ELEVEN_LABS_STABILITY", 0.5),
                similarity_boost: env_unit_f32("ELEVEN_LABS_SIMILARITY_BOOST", 0.5),
            },
            tools: ToolSettings {
                ffmpeg_path: PathBuf::from(env_string("FFMPEG_PATH", "ffmpeg")),
                rhubarb_path: PathBuf::from(env_string("RHUBARB_PATH", "./bin/rhubarb")),
                timeout: Duration::from_secs(env_u64("AVATAR_TOOL_TIMEOUT_SECS", 60).max(1)),
                artifact_root: PathBuf::from(env_string("AVATAR_ARTIFACT_DIR", "./audios")),
                keep_artifacts: env_bool("AVATAR_KEEP_ARTIFACTS", false),
            },
            poll: PollSettings {
                interval: Duration::from_millis(env_u64("AVATAR_RUN_POLL_INTERVAL_MS", 1000).max(10)),
                deadline: Duration::from_secs(env_u64("AVATAR_RUN_DEADLINE_SECS", 120).max(1)),
            },
            bind_addr: env_string("AVATAR_BIND_ADDR", "0.0.0.0:5000"),
            allowed_origins: parse_origins(&env_string("AVATAR_ALLOWED_ORIGINS", DEFAULT_ALLOWED_ORIGINS)),
            log_dir: env_opt_string("AVATAR_LOG_DIR").map(PathBuf::from),
        }
    }

    /// Required keys that are unset. The server still starts; calls needing them fail.
    pub fn missing_keys(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.assistant.api_key.is_none() {
            missing.push("OPENAI_API_KEY");
        }
        if self.speech.api_key.is_none() {
            missing.push("ELEVEN_LABS_API_KEY");
        }
        if self.speech.voice_id.is_none() {
            missing.push("ELEVEN_LABS_VOICE_ID");
        }
        missing
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_unit_f32(name: &str, default: f32) -> f32 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse::<f32>().unwrap_or(default).clamp(0.0, 1.0),
        Err(_) => default,
    }
}

fn env_string(name: &str, default: &str) -> String {
    env_opt_string(name).unwrap_or_else(|| default.to_string())
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
