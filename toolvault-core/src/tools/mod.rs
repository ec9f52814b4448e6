//! Tool definitions run by the sandbox
//!
//! A tool is an operator-authored script plus the metadata the host needs
//! to run it: a stable id, a parameter schema and the uploads the script is
//! allowed to search.

mod tool;

pub use tool::{ToolDefinition, ToolSchema, ToolScope};
