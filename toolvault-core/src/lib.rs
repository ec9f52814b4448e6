//! # Toolvault - Sandboxed Tool Scripts for Agents
//!
//! Toolvault runs operator-authored JavaScript tools on behalf of an agent
//! with:
//! - An embedded interpreter with hard memory and stack ceilings
//! - A guest-only computation budget enforced by a watchdog
//! - A fixed, policy-gated capability bridge to host services
//! - Per-session HTTP quotas
//! - Cycle-terminating marshalling of host records
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use toolvault_core::prelude::*;
//!
//! # async fn run(llm: Arc<dyn LanguageModel>) -> Result<()> {
//! let tool = ToolDefinition::new("1", "fetch_status", r#"
//!     function invoke(params) {
//!         return http.get(params.url).status;
//!     }
//! "#);
//!
//! let result = ToolRunner::builder(tool, llm, ActingIdentity::new(-1, "system"))
//!     .parameters(serde_json::json!({"url": "https://example.com"}))
//!     .http(Arc::new(ReqwestTransport::new(std::time::Duration::from_secs(30))?))
//!     .build()
//!     .invoke()
//!     .await;
//!
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **tools**: tool definitions (script, schema, readable uploads)
//! - **sandbox**: sessions, capability bridge, watchdog, quotas, adapter
//! - **host**: collaborator contracts the embedding application implements
//! - **config**: figment-loaded [`config::SandboxConfig`]

pub mod config;
pub mod error;
pub mod host;
pub mod sandbox;
pub mod tools;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::SandboxConfig;
    pub use crate::error::{Result, ToolvaultError};
    pub use crate::host::{
        ActingIdentity, DispatchOutcome, Fragment, FragmentIndex, HostData, HttpMethod,
        HttpRequest, HttpResponse, HttpTransport, LanguageModel, MessageType, PersonaDispatcher,
        PersonaRequest, Prompt, PromptMessage, ReplyTarget, ReqwestTransport, Tokenizer,
        UploadFile, UploadRecord, UploadStore, UserRef, WhitespaceTokenizer,
    };
    pub use crate::sandbox::{
        Capability, CapabilityPolicy, CapabilitySet, Collaborators, ExecutionProvenance,
        ExecutionResult, HostValue, Outcome, Reduce, SandboxError, ToolRunner, ToolRunnerBuilder,
    };
    pub use crate::tools::{ToolDefinition, ToolSchema, ToolScope};
}
