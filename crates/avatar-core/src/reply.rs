//! Reply messages produced by the assistant for the avatar front end.
//!
//! The assistant is instructed to answer with a JSON array of at most three
//! messages; models frequently wrap that array in a markdown code fence, so the
//! fence is stripped before parsing.

use serde::{Deserialize, Serialize};

use crate::error::{AvatarError, AvatarResult};

/// Appended to assistant instructions so replies come back as parseable message arrays.
pub const REPLY_FORMAT_DIRECTIVE: &str = "You will always reply with a JSON array of messages. With a maximum of 3 messages.\n\
Each message has a text, facialExpression, and animation property.\n\
The different facial expressions are: smile, sad, angry, funnyFace, and default.\n\
The different animations are: Talking, Greeting and Idle.\n\
Reply with the JSON array only, without markdown or any other text.";

/// Facial expression for the avatar while a message is spoken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FacialExpression {
    Smile,
    Sad,
    Angry,
    FunnyFace,
    #[default]
    #[serde(other)]
    Default,
}

/// Body animation for the avatar while a message is spoken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Animation {
    Talking,
    Greeting,
    #[default]
    #[serde(other)]
    Idle,
}

/// One utterance of the avatar. `audio` and `lipsync` are attached by the talk pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMessage {
    pub text: String,
    #[serde(default)]
    pub facial_expression: FacialExpression,
    #[serde(default)]
    pub animation: Animation,
    /// Base64 of the synthesized mp3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    /// Mouth-cue timing JSON from the lip-sync extractor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lipsync: Option<serde_json::Value>,
}

impl ReplyMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            facial_expression: FacialExpression::default(),
            animation: Animation::default(),
            audio: None,
            lipsync: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReplyPayload {
    List(Vec<ReplyMessage>),
    Wrapped { messages: Vec<ReplyMessage> },
}

/// Build the instructions sent on assistant creation.
pub fn with_reply_format(instructions: &str) -> String {
    format!("{}\n\n{}", instructions.trim_end(), REPLY_FORMAT_DIRECTIVE)
}

/// Remove a surrounding markdown code fence (```json ... ``` or ``` ... ```), if any.
pub fn strip_code_fence(raw: &str) -> &str {
    let t = raw.trim();
    let Some(rest) = t.strip_prefix("```") else {
        return t;
    };
    // Drop the info string (e.g. "json") on the opening fence line.
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Parse the assistant's raw reply into messages. Accepts a bare array or `{"messages": [...]}`.
pub fn parse_reply(raw: &str) -> AvatarResult<Vec<ReplyMessage>> {
    let body = strip_code_fence(raw);
    let payload: ReplyPayload = serde_json::from_str(body).map_err(|e| {
        let preview: String = body.chars().take(120).collect();
        AvatarError::InvalidResponseFormat(format!("{} (reply began: {:?})", e, preview))
    })?;
    Ok(match payload {
        ReplyPayload::List(messages) => messages,
        ReplyPayload::Wrapped { messages } => messages,
    })
}
