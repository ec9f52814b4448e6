//! Host collaborator contracts
//!
//! The sandbox never talks to storage, providers or the network directly.
//! Every capability delegates to one of the traits in this module, and the
//! embedding application supplies the implementations.

mod data;
mod dispatch;
mod http;
mod index;
mod llm;
mod upload;

pub use data::{HostData, UserRef};
pub use dispatch::{DispatchOutcome, PersonaDispatcher, PersonaRequest, ReplyTarget};
pub use http::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use index::{Fragment, FragmentIndex};
pub use llm::{LanguageModel, MessageType, Prompt, PromptMessage, Tokenizer, WhitespaceTokenizer};
pub use upload::{UploadFile, UploadRecord, UploadStore};

use serde::{Deserialize, Serialize};

/// The user or bot an invocation is attributed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActingIdentity {
    /// Host user id
    pub id: i64,

    /// Host username
    pub username: String,
}

impl ActingIdentity {
    /// Create a new identity
    pub fn new(id: i64, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
        }
    }
}

impl std::fmt::Display for ActingIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.username, self.id)
    }
}
