//! Sandboxed execution of tool scripts
//!
//! This module runs operator-authored JavaScript tools inside an embedded
//! interpreter with hard resource ceilings. Key features:
//! - Fixed capability bridge (`http`, `llm`, `index`, `upload`, `chain`,
//!   `discourse`) gated by a [`CapabilityPolicy`]
//! - Guest-only computation budget enforced by a watchdog thread
//! - Per-session HTTP quota
//! - Depth-bounded, cycle-terminating marshalling of host values
//! - Exactly one [`ExecutionResult`] per session, with provenance
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use toolvault_core::host::{ActingIdentity, LanguageModel};
//! use toolvault_core::sandbox::ToolRunner;
//! use toolvault_core::tools::ToolDefinition;
//!
//! # async fn run(llm: Arc<dyn LanguageModel>) {
//! let tool = ToolDefinition::new("1", "add_one", "function invoke(p) { return p.x + 1; }");
//!
//! let result = ToolRunner::builder(tool, llm, ActingIdentity::new(-1, "system"))
//!     .parameters(serde_json::json!({"x": 41}))
//!     .build()
//!     .invoke()
//!     .await;
//!
//! assert_eq!(result.value(), Some(&serde_json::json!(42)));
//! # }
//! ```

mod adapter;
mod bridge;
mod capability;
mod interpreter;
mod prelude;
mod quota;
mod result;
mod runner;
mod watchdog;

pub use adapter::{DepthExceeded, HostValue, Reduce, SerializationAdapter};
pub use bridge::Collaborators;
pub use capability::{Capability, CapabilityPolicy, CapabilitySet};
pub use quota::QuotaTracker;
pub use result::{ExecutionProvenance, ExecutionResult, Outcome, SandboxError};
pub use runner::{ToolRunner, ToolRunnerBuilder};
pub use watchdog::{CallGuard, CallMarker, Watchdog};

#[cfg(test)]
mod tests;
