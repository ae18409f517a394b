//! Avatar core: drives hosted-assistant runs and turns replies into voiced,
//! lip-synced messages for a talking-avatar front end.
//!
//! ```text
//! user message ─► Conversation ─► AssistantClient (thread / run)
//!                      │               ▲
//!                      └─► RunPoller ──┘   (Pending → Done | Failed)
//!
//! raw reply ─► TalkPipeline ─► SpeechSynthesizer ─► ffmpeg ─► rhubarb ─► base64 + cues
//! ```

pub mod assistant;
pub mod config;
pub mod conversation;
pub mod error;
pub mod pipeline;
pub mod poller;
pub mod reply;
pub mod speech;
pub mod tools;

pub use assistant::{AssistantClient, OpenAiAssistants, RunStatus};
pub use config::{AssistantSettings, AvatarConfig, PollSettings, SpeechSettings, ToolSettings};
pub use conversation::Conversation;
pub use error::{AvatarError, AvatarResult, ExternalToolError};
pub use pipeline::{MessageArtifacts, RequestDir, TalkPipeline};
pub use poller::{RunPoller, RunState};
pub use reply::{parse_reply, strip_code_fence, with_reply_format, Animation, FacialExpression, ReplyMessage};
pub use speech::{ElevenLabsTts, SpeechSynthesizer};
pub use tools::{CommandRunner, SubprocessRunner, ToolCommand};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
