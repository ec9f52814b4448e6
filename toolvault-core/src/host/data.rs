//! Host data lookups behind `discourse.search/getPost/getUser`

use super::ActingIdentity;
use crate::error::Result;
use crate::sandbox::HostValue;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// How the guest referred to a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserRef {
    Id(i64),
    Username(String),
}

impl UserRef {
    /// Integers and numeric strings are ids, anything else a username
    pub fn from_guest(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(UserRef::Id),
            Value::String(s) => match s.parse::<i64>() {
                Ok(id) if id.to_string() == *s => Some(UserRef::Id(id)),
                _ => Some(UserRef::Username(s.clone())),
            },
            _ => None,
        }
    }
}

/// Read access to host records.
///
/// Results are [`HostValue`]s; the bridge runs them through the
/// serialization adapter before they reach the guest.
#[async_trait]
pub trait HostData: Send + Sync {
    /// Full-text search. `include_private` mirrors the guest's `with_private`.
    async fn search(&self, params: Map<String, Value>, include_private: bool) -> Result<HostValue>;

    /// Serialized post, `None` when it does not exist
    async fn get_post(&self, post_id: i64) -> Result<Option<HostValue>>;

    /// Serialized user, `None` when it does not exist
    async fn get_user(&self, user: UserRef) -> Result<Option<HostValue>>;

    /// Author of a post, used to attribute `llm.generate` when the session
    /// runs on behalf of that post. `None` when the post does not exist.
    async fn post_author(&self, post_id: i64) -> Result<Option<ActingIdentity>>;
}
