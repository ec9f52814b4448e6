//! Capability catalogue and permission policy for the bridge
//!
//! Every host function exposed to guest scripts corresponds to exactly one
//! [`Capability`]. The session consults a [`CapabilityPolicy`] before any
//! bridge function touches a host collaborator.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Host functions a guest script can reach through the prelude
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// `http.get`
    HttpGet,

    /// `http.post`
    HttpPost,

    /// `http.put`
    HttpPut,

    /// `http.patch`
    HttpPatch,

    /// `http.delete`
    HttpDelete,

    /// `llm.truncate`
    LlmTruncate,

    /// `llm.generate`
    LlmGenerate,

    /// `index.search`
    IndexSearch,

    /// `upload.create`
    UploadCreate,

    /// `chain.setCustomRaw`
    ChainSetCustomRaw,

    /// `discourse.search`
    DiscourseSearch,

    /// `discourse.getPost`
    DiscourseGetPost,

    /// `discourse.getUser`
    DiscourseGetUser,

    /// `discourse.getPersona(..).respondTo`
    DiscourseRespondToPersona,
}

impl Capability {
    /// Get all defined capabilities
    pub fn all() -> &'static [Capability] {
        &[
            Capability::HttpGet,
            Capability::HttpPost,
            Capability::HttpPut,
            Capability::HttpPatch,
            Capability::HttpDelete,
            Capability::LlmTruncate,
            Capability::LlmGenerate,
            Capability::IndexSearch,
            Capability::UploadCreate,
            Capability::ChainSetCustomRaw,
            Capability::DiscourseSearch,
            Capability::DiscourseGetPost,
            Capability::DiscourseGetUser,
            Capability::DiscourseRespondToPersona,
        ]
    }

    /// Capabilities with side effects outside the session
    pub fn privileged() -> &'static [Capability] {
        &[
            Capability::HttpPost,
            Capability::HttpPut,
            Capability::HttpPatch,
            Capability::HttpDelete,
            Capability::UploadCreate,
            Capability::DiscourseRespondToPersona,
        ]
    }

    /// Check if this capability is privileged
    pub fn is_privileged(&self) -> bool {
        Self::privileged().contains(self)
    }

    /// Whether the call may block on a host collaborator.
    ///
    /// The bridge marks blocking calls so the watchdog leaves them out of
    /// the computation budget.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Capability::LlmTruncate | Capability::ChainSetCustomRaw)
    }

    /// Name of the global function the prelude calls through
    pub fn global_name(&self) -> &'static str {
        match self {
            Capability::HttpGet => "_http_get",
            Capability::HttpPost => "_http_post",
            Capability::HttpPut => "_http_put",
            Capability::HttpPatch => "_http_patch",
            Capability::HttpDelete => "_http_delete",
            Capability::LlmTruncate => "_llm_truncate",
            Capability::LlmGenerate => "_llm_generate",
            Capability::IndexSearch => "_index_search",
            Capability::UploadCreate => "_upload_create",
            Capability::ChainSetCustomRaw => "_chain_set_custom_raw",
            Capability::DiscourseSearch => "_discourse_search",
            Capability::DiscourseGetPost => "_discourse_get_post",
            Capability::DiscourseGetUser => "_discourse_get_user",
            Capability::DiscourseRespondToPersona => "_discourse_respond_to_persona",
        }
    }

    /// Get the string name of this capability
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::HttpGet => "http_get",
            Capability::HttpPost => "http_post",
            Capability::HttpPut => "http_put",
            Capability::HttpPatch => "http_patch",
            Capability::HttpDelete => "http_delete",
            Capability::LlmTruncate => "llm_truncate",
            Capability::LlmGenerate => "llm_generate",
            Capability::IndexSearch => "index_search",
            Capability::UploadCreate => "upload_create",
            Capability::ChainSetCustomRaw => "chain_set_custom_raw",
            Capability::DiscourseSearch => "discourse_search",
            Capability::DiscourseGetPost => "discourse_get_post",
            Capability::DiscourseGetUser => "discourse_get_user",
            Capability::DiscourseRespondToPersona => "discourse_respond_to_persona",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A set of capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    capabilities: HashSet<Capability>,
}

impl CapabilitySet {
    /// Create an empty capability set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a capability set with all capabilities
    pub fn all() -> Self {
        Self {
            capabilities: Capability::all().iter().copied().collect(),
        }
    }

    /// Add a capability
    pub fn add(&mut self, cap: Capability) -> &mut Self {
        self.capabilities.insert(cap);
        self
    }

    /// Remove a capability
    pub fn remove(&mut self, cap: Capability) -> &mut Self {
        self.capabilities.remove(&cap);
        self
    }

    /// Check if capability is present
    pub fn contains(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }
}

/// Policy that controls which bridge functions a session may call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityPolicy {
    /// Explicitly allowed capabilities
    allowed: CapabilitySet,

    /// Explicitly denied capabilities (takes precedence over allowed)
    denied: CapabilitySet,

    /// Allow capabilities not explicitly mentioned
    default_allow: bool,
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl CapabilityPolicy {
    /// Deny every bridge function
    pub fn deny_all() -> Self {
        Self {
            allowed: CapabilitySet::new(),
            denied: CapabilitySet::new(),
            default_allow: false,
        }
    }

    /// Allow the full catalogue
    pub fn allow_all() -> Self {
        Self {
            allowed: CapabilitySet::all(),
            denied: CapabilitySet::new(),
            default_allow: true,
        }
    }

    /// Allow only capabilities without external side effects
    pub fn read_only() -> Self {
        let mut policy = Self::deny_all();
        for cap in Capability::all() {
            if !cap.is_privileged() {
                policy.allowed.add(*cap);
            }
        }
        policy
    }

    /// Allow a specific capability
    pub fn allow(mut self, cap: Capability) -> Self {
        self.allowed.add(cap);
        self.denied.remove(cap);
        self
    }

    /// Deny a specific capability
    pub fn deny(mut self, cap: Capability) -> Self {
        self.denied.add(cap);
        self.allowed.remove(cap);
        self
    }

    /// Check if a capability is allowed by this policy
    pub fn is_allowed(&self, cap: Capability) -> bool {
        if self.denied.contains(cap) {
            return false;
        }

        if self.allowed.contains(cap) {
            return true;
        }

        self.default_allow
    }
}
