//! Nested persona dispatch behind `discourse.getPersona(..).respondTo`
//!
//! A persona reply may itself run tools, so implementations typically build
//! a fresh [`crate::sandbox::ToolRunner`] per tool with
//! `nesting_depth(request.nesting_depth)`, letting the depth cap hold across
//! persona-to-persona chains.

use super::ActingIdentity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Where the nested persona should reply, derived from the session context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyTarget {
    /// Reply to a topic post
    Post { post_id: i64 },

    /// Reply to a chat message
    Chat {
        message_id: i64,
        channel_id: i64,
        context_post_ids: Vec<i64>,
    },
}

impl ReplyTarget {
    /// Derive the reply target from a context map.
    ///
    /// `post_id` wins; otherwise both `message_id` and `channel_id` are required.
    pub fn from_context(context: &Map<String, Value>) -> Option<Self> {
        let int = |key: &str| context.get(key).and_then(as_id);

        if let Some(post_id) = int("post_id") {
            return Some(ReplyTarget::Post { post_id });
        }

        match (int("message_id"), int("channel_id")) {
            (Some(message_id), Some(channel_id)) => Some(ReplyTarget::Chat {
                message_id,
                channel_id,
                context_post_ids: context
                    .get("context_post_ids")
                    .and_then(Value::as_array)
                    .map(|ids| ids.iter().filter_map(as_id).collect())
                    .unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

fn as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// A request to have another persona respond in the same conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaRequest {
    pub persona: String,
    pub instructions: Option<String>,
    pub whisper: bool,
    pub target: ReplyTarget,

    /// Context of the calling session, passed on unchanged
    pub context: Map<String, Value>,

    /// Identity of the calling session's bot
    pub bot: ActingIdentity,

    /// Depth the nested sessions run at (caller depth + 1)
    pub nesting_depth: u32,
}

/// Structured result of a nested dispatch; never an exception
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    PostReply { post_id: i64, post_number: i64 },
    ChatReply { message_id: i64 },
    Failed { reason: String },
}

impl DispatchOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        DispatchOutcome::Failed {
            reason: reason.into(),
        }
    }

    /// Guest-facing shape: `{success: true, ...}` or `{error: reason}`
    pub fn to_guest_value(&self) -> Value {
        match self {
            DispatchOutcome::PostReply {
                post_id,
                post_number,
            } => json!({ "success": true, "post_id": post_id, "post_number": post_number }),
            DispatchOutcome::ChatReply { message_id } => {
                json!({ "success": true, "message_id": message_id })
            }
            DispatchOutcome::Failed { reason } => json!({ "error": reason }),
        }
    }
}

/// Runs another persona against the calling session's conversation
#[async_trait]
pub trait PersonaDispatcher: Send + Sync {
    /// Implementations report lookup failures (`"Persona not found"`,
    /// `"Post not found"`, ...) as [`DispatchOutcome::Failed`].
    async fn respond_to(&self, request: PersonaRequest) -> DispatchOutcome;
}
