//! Language model contract used by `llm.generate` and `llm.truncate`

use super::ActingIdentity;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Message type in a structured prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    System,
    User,
    Model,
    Tool,
    ToolCall,
}

impl MessageType {
    /// Parse the guest-facing name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "system" => Some(MessageType::System),
            "user" => Some(MessageType::User),
            "model" => Some(MessageType::Model),
            "tool" => Some(MessageType::Tool),
            "tool_call" => Some(MessageType::ToolCall),
            _ => None,
        }
    }
}

/// A message in a structured prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Prompt handed to the language model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    /// A bare user prompt
    Text(String),

    /// A conversation
    Messages {
        messages: Vec<PromptMessage>,
    },
}

impl Prompt {
    /// Flatten the prompt into plain text, one message per line
    pub fn to_text(&self) -> String {
        match self {
            Prompt::Text(text) => text.clone(),
            Prompt::Messages { messages } => messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Tokenizer used for truncation
pub trait Tokenizer: Send + Sync {
    /// Truncate `text` to at most `max_length` tokens
    fn truncate(&self, text: &str, max_length: usize) -> String;
}

/// Treats whitespace-separated words as tokens
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn truncate(&self, text: &str, max_length: usize) -> String {
        text.split_whitespace()
            .take(max_length)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Language model handle bound to a session
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a completion on behalf of `identity`.
    ///
    /// `feature_name` tags the call for upstream cost accounting.
    async fn generate(
        &self,
        prompt: &Prompt,
        identity: &ActingIdentity,
        feature_name: &str,
    ) -> Result<String>;

    /// Tokenizer matching this model
    fn tokenizer(&self) -> &dyn Tokenizer;
}
