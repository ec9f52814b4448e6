//! Upload persistence contract behind `upload.create`

use super::ActingIdentity;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Decoded file content ready to persist
#[derive(Debug, Clone, PartialEq)]
pub struct UploadFile {
    /// Base name only; path components are stripped before this is built
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// What the guest gets back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: i64,
    pub url: String,
    pub short_url: String,
}

#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Persist `file` for `owner`; `private` marks it as belonging to a private message
    async fn create(
        &self,
        file: UploadFile,
        private: bool,
        owner: &ActingIdentity,
    ) -> Result<UploadRecord>;
}
