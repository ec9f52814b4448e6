//! Capability bridge: the host side of every guest-callable function
//!
//! Each bridge global receives its arguments as a JSON array and answers
//! with a JSON envelope. Policy, quota and argument checks happen here,
//! before any host collaborator is touched. Capabilities that can block
//! (see [`Capability::is_blocking`]) run inside the session's
//! [`CallMarker`] so the watchdog discounts them.

use super::adapter::{DepthExceeded, HostValue, SerializationAdapter};
use super::capability::Capability;
use super::quota::QuotaTracker;
use super::result::SandboxError;
use super::watchdog::CallMarker;
use crate::config::SandboxConfig;
use crate::host::{
    ActingIdentity, DispatchOutcome, FragmentIndex, HostData, HttpMethod, HttpRequest,
    HttpTransport, LanguageModel, MessageType, PersonaDispatcher, PersonaRequest, Prompt,
    PromptMessage, ReplyTarget, UploadFile, UploadStore, UserRef,
};
use crate::tools::ToolDefinition;
use base64::Engine;
use serde_json::{Map, Value, json};
use std::cell::{OnceCell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

static NULL: Value = Value::Null;

/// Host collaborators a session may delegate to.
///
/// Missing collaborators make the matching capabilities fail with a
/// `CapabilityError`; the language model is always required and lives on
/// the session itself.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub http: Option<Arc<dyn HttpTransport>>,
    pub index: Option<Arc<dyn FragmentIndex>>,
    pub uploads: Option<Arc<dyn UploadStore>>,
    pub host_data: Option<Arc<dyn HostData>>,
    pub dispatcher: Option<Arc<dyn PersonaDispatcher>>,
}

/// Session-scoped state behind the bridge globals
pub(crate) struct Bridge {
    tool: Arc<ToolDefinition>,
    bot: ActingIdentity,
    context: Map<String, Value>,
    llm: Arc<dyn LanguageModel>,
    collaborators: Collaborators,
    config: SandboxConfig,
    nesting_depth: u32,
    handle: tokio::runtime::Handle,
    quota: QuotaTracker,
    calls: CallMarker,
    adapter: SerializationAdapter,
    custom_raw: RefCell<Option<Value>>,
    last_error: RefCell<Option<SandboxError>>,
    llm_identity: OnceCell<ActingIdentity>,
}

impl Bridge {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tool: Arc<ToolDefinition>,
        bot: ActingIdentity,
        context: Map<String, Value>,
        llm: Arc<dyn LanguageModel>,
        collaborators: Collaborators,
        config: SandboxConfig,
        nesting_depth: u32,
        handle: tokio::runtime::Handle,
    ) -> Self {
        Self {
            quota: QuotaTracker::new(config.max_http_requests),
            adapter: SerializationAdapter::new(config.marshal_stack_depth),
            calls: CallMarker::new(),
            custom_raw: RefCell::new(None),
            last_error: RefCell::new(None),
            llm_identity: OnceCell::new(),
            tool,
            bot,
            context,
            llm,
            collaborators,
            config,
            nesting_depth,
            handle,
        }
    }

    pub(crate) fn calls(&self) -> &CallMarker {
        &self.calls
    }

    pub(crate) fn adapter(&self) -> &SerializationAdapter {
        &self.adapter
    }

    pub(crate) fn http_requests(&self) -> u32 {
        self.quota.http_requests()
    }

    pub(crate) fn take_custom_raw(&self) -> Option<Value> {
        self.custom_raw.borrow_mut().take()
    }

    /// Map an uncaught guest exception message back to the bridge failure
    /// that raised it, if any; otherwise it is the guest's own error.
    pub(crate) fn classify(&self, message: String) -> SandboxError {
        match self.last_error.borrow().as_ref() {
            Some(error) if error.to_string() == message => error.clone(),
            _ => SandboxError::ScriptError { message },
        }
    }

    /// Entry point of every bridge global: JSON args in, JSON envelope out
    pub(crate) fn call(&self, capability: Capability, raw_args: &str) -> String {
        let outcome = serde_json::from_str::<Vec<Value>>(raw_args)
            .map_err(|e| SandboxError::invalid(format!("malformed arguments: {e}")))
            .and_then(|args| self.dispatch(capability, &args));

        let envelope = match outcome {
            Ok(value) => json!({ "ok": value }),
            Err(error) => {
                tracing::debug!(
                    capability = capability.as_str(),
                    kind = error.kind(),
                    error = %error,
                    "capability call failed"
                );
                let message = error.to_string();
                *self.last_error.borrow_mut() = Some(error);
                json!({ "error": message })
            }
        };
        envelope.to_string()
    }

    fn dispatch(&self, capability: Capability, args: &[Value]) -> Result<Value, SandboxError> {
        if !self.config.policy.is_allowed(capability) {
            return Err(SandboxError::capability(
                capability,
                "capability is not permitted for this tool",
            ));
        }

        for arg in args {
            self.adapter
                .check(arg)
                .map_err(|e| SandboxError::invalid(e.to_string()))?;
        }

        tracing::debug!(
            tool = %self.tool.name,
            capability = capability.as_str(),
            "capability call"
        );

        let _guard = capability.is_blocking().then(|| self.calls.enter());

        match capability {
            Capability::HttpGet => self.http(capability, HttpMethod::Get, args),
            Capability::HttpPost => self.http(capability, HttpMethod::Post, args),
            Capability::HttpPut => self.http(capability, HttpMethod::Put, args),
            Capability::HttpPatch => self.http(capability, HttpMethod::Patch, args),
            Capability::HttpDelete => self.http(capability, HttpMethod::Delete, args),
            Capability::LlmTruncate => self.llm_truncate(args),
            Capability::LlmGenerate => self.llm_generate(capability, args),
            Capability::IndexSearch => self.index_search(capability, args),
            Capability::UploadCreate => self.upload_create(capability, args),
            Capability::ChainSetCustomRaw => {
                *self.custom_raw.borrow_mut() = Some(arg(args, 0).clone());
                Ok(Value::Null)
            }
            Capability::DiscourseSearch => self.discourse_search(capability, args),
            Capability::DiscourseGetPost => self.discourse_get_post(capability, args),
            Capability::DiscourseGetUser => self.discourse_get_user(capability, args),
            Capability::DiscourseRespondToPersona => self.respond_to_persona(args),
        }
    }

    /// Run a host future on the caller's runtime. Only reachable from
    /// blocking capabilities, so the watchdog is already paused.
    fn blocking<F: Future>(&self, future: F) -> F::Output {
        debug_assert!(self.calls.is_active());
        self.handle.block_on(future)
    }

    fn http(
        &self,
        capability: Capability,
        method: HttpMethod,
        args: &[Value],
    ) -> Result<Value, SandboxError> {
        let made = self.quota.record_http_request().inspect_err(|_| {
            tracing::warn!(
                tool = %self.tool.name,
                limit = self.quota.max_http_requests(),
                "tool made too many HTTP requests"
            );
        })?;

        let url = arg(args, 0)
            .as_str()
            .ok_or_else(|| SandboxError::invalid("url must be a string"))?
            .to_string();
        let options = arg(args, 1);

        let headers = options
            .get("headers")
            .and_then(Value::as_object)
            .map(|headers| {
                headers
                    .iter()
                    .map(|(name, value)| (name.clone(), plain_string(value)))
                    .collect::<BTreeMap<_, _>>()
            })
            .unwrap_or_default();

        let body = match method {
            HttpMethod::Get => None,
            _ => options
                .get("body")
                .filter(|body| !body.is_null())
                .map(plain_string),
        };

        let transport = self
            .collaborators
            .http
            .as_ref()
            .ok_or_else(|| unavailable(capability))?;

        tracing::debug!(%method, %url, request = made, "sending guest HTTP request");

        let response = self
            .blocking(transport.send(HttpRequest {
                method,
                url,
                headers,
                body,
            }))
            .map_err(|e| SandboxError::capability(capability, e.to_string()))?;

        Ok(json!({ "status": response.status, "body": response.body }))
    }

    fn llm_truncate(&self, args: &[Value]) -> Result<Value, SandboxError> {
        let text = arg(args, 0)
            .as_str()
            .ok_or_else(|| SandboxError::invalid("text must be a string"))?;
        let length = arg(args, 1)
            .as_f64()
            .ok_or_else(|| SandboxError::invalid("length must be a number"))?;

        let max_length = if length > 0.0 { length as usize } else { 0 };
        Ok(Value::String(self.llm.tokenizer().truncate(text, max_length)))
    }

    fn llm_generate(&self, capability: Capability, args: &[Value]) -> Result<Value, SandboxError> {
        let prompt = parse_prompt(arg(args, 0))?;
        let identity = self.llm_identity.get_or_init(|| self.resolve_llm_identity());
        let feature_name = format!("custom_tool_{}", self.tool.name);

        let text = self
            .blocking(self.llm.generate(&prompt, identity, &feature_name))
            .map_err(|e| SandboxError::capability(capability, e.to_string()))?;

        Ok(Value::String(text))
    }

    /// `context.llm_user` when the orchestrator supplied one, else the
    /// author of `context.post_id`, else the bot
    fn resolve_llm_identity(&self) -> ActingIdentity {
        if let Some(user) = self
            .context
            .get("llm_user")
            .and_then(|user| serde_json::from_value(user.clone()).ok())
        {
            return user;
        }

        let post_id = self.context.get("post_id").and_then(as_id);
        let author = match (post_id, self.collaborators.host_data.as_ref()) {
            (Some(post_id), Some(host)) => self
                .blocking(host.post_author(post_id))
                .unwrap_or_else(|e| {
                    tracing::warn!(post_id, error = %e, "could not look up post author");
                    None
                }),
            _ => None,
        };

        author.unwrap_or_else(|| self.bot.clone())
    }

    fn index_search(&self, capability: Capability, args: &[Value]) -> Result<Value, SandboxError> {
        let empty = Ok(Value::Array(Vec::new()));

        let Some(query) = arg(args, 0).as_str() else {
            return empty;
        };
        let options = arg(args, 1);

        let limit = coerce_limit(options.get("limit"), self.config.default_search_limit);
        if limit < 1 {
            return empty;
        }
        let limit = (limit as usize).min(self.config.max_fragments);

        let readable = &self.tool.scope.readable_uploads;
        let allowed: Vec<&String> = match filenames(options.get("filenames")) {
            Some(requested) => readable
                .iter()
                .filter(|name| requested.contains(name))
                .collect(),
            None => readable.iter().collect(),
        };
        if allowed.is_empty() {
            return empty;
        }

        let index = self
            .collaborators
            .index
            .as_ref()
            .ok_or_else(|| unavailable(capability))?;
        let tool_id = self.tool.id.clone();

        let fragments = self
            .blocking(async {
                let vector = index.embed(query).await?;
                index.similarity_search(&tool_id, &vector, limit, 0).await
            })
            .map_err(|e| SandboxError::capability(capability, e.to_string()))?;

        Ok(Value::Array(
            fragments
                .into_iter()
                .filter(|fragment| allowed.contains(&&fragment.filename))
                .take(limit)
                .map(|fragment| json!({ "fragment": fragment.fragment, "metadata": fragment.metadata }))
                .collect(),
        ))
    }

    fn upload_create(&self, capability: Capability, args: &[Value]) -> Result<Value, SandboxError> {
        let filename = arg(args, 0)
            .as_str()
            .ok_or_else(|| SandboxError::invalid("filename must be a string"))?;
        let filename = sanitize_filename(filename)
            .ok_or_else(|| SandboxError::invalid("filename has no usable base name"))?;

        let content = arg(args, 1)
            .as_str()
            .ok_or_else(|| SandboxError::invalid("content must be a base64 string"))?;
        let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(compact)
            .map_err(|e| SandboxError::invalid(format!("content is not valid base64: {e}")))?;

        let private = self
            .context
            .get("private_message")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let uploads = self
            .collaborators
            .uploads
            .as_ref()
            .ok_or_else(|| unavailable(capability))?;

        let record = self
            .blocking(uploads.create(UploadFile { filename, bytes }, private, &self.bot))
            .map_err(|e| SandboxError::capability(capability, e.to_string()))?;

        Ok(json!({ "id": record.id, "url": record.url, "short_url": record.short_url }))
    }

    fn discourse_search(&self, capability: Capability, args: &[Value]) -> Result<Value, SandboxError> {
        let mut params = match arg(args, 0) {
            Value::Object(params) => params.clone(),
            Value::Null => Map::new(),
            _ => return Err(SandboxError::invalid("search params must be an object")),
        };
        let include_private = params
            .remove("with_private")
            .map(|flag| truthy(&flag))
            .unwrap_or(false);

        let host = self.host_data(capability)?;
        let results = self
            .blocking(host.search(params, include_private))
            .map_err(|e| SandboxError::capability(capability, e.to_string()))?;

        self.to_guest(capability, results)
    }

    fn discourse_get_post(&self, capability: Capability, args: &[Value]) -> Result<Value, SandboxError> {
        let post_id = as_id(arg(args, 0))
            .ok_or_else(|| SandboxError::invalid("post id must be an integer"))?;

        let host = self.host_data(capability)?;
        let post = self
            .blocking(host.get_post(post_id))
            .map_err(|e| SandboxError::capability(capability, e.to_string()))?;

        match post {
            Some(post) => self.to_guest(capability, post),
            None => Ok(Value::Null),
        }
    }

    fn discourse_get_user(&self, capability: Capability, args: &[Value]) -> Result<Value, SandboxError> {
        let user = UserRef::from_guest(arg(args, 0))
            .ok_or_else(|| SandboxError::invalid("user must be an id or a username"))?;

        let host = self.host_data(capability)?;
        let user = self
            .blocking(host.get_user(user))
            .map_err(|e| SandboxError::capability(capability, e.to_string()))?;

        match user {
            Some(user) => self.to_guest(capability, user),
            None => Ok(Value::Null),
        }
    }

    /// Failures here are structured `{error}` values, never thrown
    fn respond_to_persona(&self, args: &[Value]) -> Result<Value, SandboxError> {
        let failed = |reason: &str| Ok(DispatchOutcome::failed(reason).to_guest_value());

        let Some(persona) = arg(args, 0).as_str() else {
            return failed("Persona name must be a string");
        };
        if self.nesting_depth >= self.config.max_nesting_depth {
            tracing::warn!(
                tool = %self.tool.name,
                persona,
                depth = self.nesting_depth,
                "refusing nested persona dispatch"
            );
            return failed("Maximum persona nesting depth reached");
        }
        let Some(target) = ReplyTarget::from_context(&self.context) else {
            return failed("No valid context for response");
        };
        let Some(dispatcher) = self.collaborators.dispatcher.as_ref() else {
            return failed("Persona dispatch is not available");
        };

        let params = arg(args, 1);
        let request = PersonaRequest {
            persona: persona.to_string(),
            instructions: params
                .get("instructions")
                .and_then(Value::as_str)
                .map(str::to_string),
            whisper: params.get("whisper").map(truthy).unwrap_or(false),
            target,
            context: self.context.clone(),
            bot: self.bot.clone(),
            nesting_depth: self.nesting_depth + 1,
        };

        let outcome = self.blocking(dispatcher.respond_to(request));
        Ok(outcome.to_guest_value())
    }

    fn host_data(&self, capability: Capability) -> Result<&Arc<dyn HostData>, SandboxError> {
        self.collaborators
            .host_data
            .as_ref()
            .ok_or_else(|| unavailable(capability))
    }

    fn to_guest(&self, capability: Capability, value: HostValue) -> Result<Value, SandboxError> {
        self.adapter
            .to_sandbox(value)
            .map_err(|e: DepthExceeded| SandboxError::capability(capability, e.to_string()))
    }
}

fn arg(args: &[Value], index: usize) -> &Value {
    args.get(index).unwrap_or(&NULL)
}

fn unavailable(capability: Capability) -> SandboxError {
    SandboxError::capability(capability, "no host collaborator configured")
}

/// Strings as-is, everything else as JSON text
fn plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Integer coercion for `index.search` limits.
///
/// Numbers are truncated, strings contribute their leading integer, and
/// anything else is 0. A missing limit falls back to `default`.
fn coerce_limit(value: Option<&Value>, default: i64) -> i64 {
    match value {
        None | Some(Value::Null) => default,
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => leading_integer(s),
        Some(_) => 0,
    }
}

fn leading_integer(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let digits: String = digits.chars().take_while(|c| c.is_ascii_digit()).collect();
    let magnitude = digits.parse::<i64>().unwrap_or(if digits.is_empty() { 0 } else { i64::MAX });
    if negative { -magnitude } else { magnitude }
}

fn filenames(value: Option<&Value>) -> Option<Vec<String>> {
    match value? {
        Value::String(name) => Some(vec![name.clone()]),
        Value::Array(names) => Some(
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

/// Reduce a guest-supplied filename to its base name
pub(crate) fn sanitize_filename(filename: &str) -> Option<String> {
    let base = filename
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        None
    } else {
        Some(base.to_string())
    }
}

/// A string, or `{messages: [{type, content, id?, name?}]}`
pub(crate) fn parse_prompt(value: &Value) -> Result<Prompt, SandboxError> {
    match value {
        Value::String(text) => Ok(Prompt::Text(text.clone())),
        Value::Object(map) => {
            let messages = map
                .get("messages")
                .and_then(Value::as_array)
                .filter(|messages| !messages.is_empty())
                .ok_or_else(|| SandboxError::invalid("Prompt must have messages"))?;

            messages
                .iter()
                .map(parse_message)
                .collect::<Result<Vec<_>, _>>()
                .map(|messages| Prompt::Messages { messages })
        }
        _ => Err(SandboxError::invalid("Prompt must be a string or an object")),
    }
}

fn parse_message(value: &Value) -> Result<PromptMessage, SandboxError> {
    let message = value
        .as_object()
        .ok_or_else(|| SandboxError::invalid("Prompt messages must be objects"))?;

    let kind = message
        .get("type")
        .and_then(Value::as_str)
        .and_then(MessageType::parse)
        .ok_or_else(|| {
            SandboxError::invalid("Message type must be one of system, user, model, tool, tool_call")
        })?;

    let content = match message.get("content") {
        Some(Value::Null) | None => {
            return Err(SandboxError::invalid("Message content is required"));
        }
        Some(content) => plain_string(content),
    };

    let optional = |key: &str| message.get(key).and_then(Value::as_str).map(str::to_string);

    Ok(PromptMessage {
        kind,
        content,
        id: optional("id"),
        name: optional("name"),
    })
}
