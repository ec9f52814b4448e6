//! Sandbox session: one bounded execution of one tool
//!
//! A [`ToolRunner`] is built per invocation and consumed by
//! [`ToolRunner::invoke`]. It owns the interpreter, the bridge state and the
//! watchdogs for the lifetime of the call and always produces exactly one
//! [`ExecutionResult`].

use super::bridge::{Bridge, Collaborators};
use super::interpreter::Interpreter;
use super::prelude::{details_expression, framework_script, invoke_expression};
use super::result::{ExecutionProvenance, ExecutionResult, Outcome, SandboxError};
use super::watchdog::Watchdog;
use crate::config::SandboxConfig;
use crate::host::{
    ActingIdentity, FragmentIndex, HostData, HttpTransport, LanguageModel, PersonaDispatcher,
    UploadStore,
};
use crate::tools::ToolDefinition;
use chrono::{DateTime, Utc};
use rquickjs::FromJs;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

/// A single, non-reusable tool invocation
pub struct ToolRunner {
    tool: Arc<ToolDefinition>,
    parameters: Value,
    llm: Arc<dyn LanguageModel>,
    bot: ActingIdentity,
    context: Map<String, Value>,
    collaborators: Collaborators,
    config: SandboxConfig,
    nesting_depth: u32,
}

impl ToolRunner {
    /// Start building a session for `tool`, attributed to `bot`
    pub fn builder(
        tool: impl Into<Arc<ToolDefinition>>,
        llm: Arc<dyn LanguageModel>,
        bot: ActingIdentity,
    ) -> ToolRunnerBuilder {
        ToolRunnerBuilder {
            tool: tool.into(),
            parameters: Value::Object(Map::new()),
            llm,
            bot,
            context: Map::new(),
            collaborators: Collaborators::default(),
            config: SandboxConfig::default(),
            timeout: None,
            nesting_depth: 0,
        }
    }

    pub fn tool(&self) -> &ToolDefinition {
        &self.tool
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run the session on a blocking thread of the current tokio runtime.
    ///
    /// Capability calls block that thread on the caller's runtime, so host
    /// collaborators may be ordinary async code.
    pub async fn invoke(self) -> ExecutionResult {
        let handle = Handle::current();
        let session = Session::begin(&self);
        let fallback = session.clone();

        match tokio::task::spawn_blocking(move || self.run(handle, session)).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    session_id = %fallback.id,
                    tool = %fallback.tool_name,
                    error = %e,
                    "sandbox session aborted"
                );
                ExecutionResult {
                    outcome: Outcome::Error {
                        error: SandboxError::script(format!("sandbox session aborted: {e}")),
                    },
                    custom_raw: None,
                    details: None,
                    provenance: fallback.provenance(0),
                }
            }
        }
    }

    /// Run the session on the current thread.
    ///
    /// Must not be called from within an async task: capability calls use
    /// `handle` to block on host futures.
    pub fn invoke_blocking(self, handle: Handle) -> ExecutionResult {
        let session = Session::begin(&self);
        self.run(handle, session)
    }

    fn run(self, handle: Handle, session: Session) -> ExecutionResult {
        tracing::info!(
            session_id = %session.id,
            tool = %self.tool.name,
            acting = %self.bot,
            depth = self.nesting_depth,
            "starting tool session"
        );

        let ToolRunner {
            tool,
            parameters,
            llm,
            bot,
            context,
            collaborators,
            config,
            nesting_depth,
        } = self;

        let scripts = Scripts::prepare(&context, &parameters);
        let bridge = Rc::new(Bridge::new(
            Arc::clone(&tool),
            bot,
            context,
            llm,
            collaborators,
            config.clone(),
            nesting_depth,
            handle,
        ));

        let (outcome, details) = match scripts
            .and_then(|scripts| execute(&tool, &parameters, &config, &bridge, &scripts))
        {
            Ok((value, details)) => (Outcome::Success { value }, details),
            Err(error) => (Outcome::Error { error }, None),
        };

        let result = ExecutionResult {
            outcome,
            custom_raw: bridge.take_custom_raw(),
            details,
            provenance: session.provenance(bridge.http_requests()),
        };

        match &result.outcome {
            Outcome::Success { .. } => tracing::info!(
                session_id = %session.id,
                tool = %tool.name,
                duration_ms = result.provenance.duration.as_millis() as u64,
                http_requests = result.provenance.http_requests,
                "tool session finished"
            ),
            Outcome::Error { error } => tracing::warn!(
                session_id = %session.id,
                tool = %tool.name,
                kind = error.kind(),
                error = %error,
                "tool session failed"
            ),
        }

        result
    }
}

/// Builder for [`ToolRunner`]
pub struct ToolRunnerBuilder {
    tool: Arc<ToolDefinition>,
    parameters: Value,
    llm: Arc<dyn LanguageModel>,
    bot: ActingIdentity,
    context: Map<String, Value>,
    collaborators: Collaborators,
    config: SandboxConfig,
    timeout: Option<Duration>,
    nesting_depth: u32,
}

impl ToolRunnerBuilder {
    /// Parameters passed to the guest `invoke`
    pub fn parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Ambient context exposed to the guest as `context`
    pub fn context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Override the configured computation budget
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn http(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.collaborators.http = Some(transport);
        self
    }

    pub fn index(mut self, index: Arc<dyn FragmentIndex>) -> Self {
        self.collaborators.index = Some(index);
        self
    }

    pub fn uploads(mut self, uploads: Arc<dyn UploadStore>) -> Self {
        self.collaborators.uploads = Some(uploads);
        self
    }

    pub fn host_data(mut self, host_data: Arc<dyn HostData>) -> Self {
        self.collaborators.host_data = Some(host_data);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn PersonaDispatcher>) -> Self {
        self.collaborators.dispatcher = Some(dispatcher);
        self
    }

    /// Replace all collaborators at once, e.g. when a dispatcher starts a
    /// nested session with its parent's wiring
    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn config(mut self, config: SandboxConfig) -> Self {
        self.config = config;
        self
    }

    /// Persona nesting depth of the session being built
    pub fn nesting_depth(mut self, depth: u32) -> Self {
        self.nesting_depth = depth;
        self
    }

    /// Finish the session. The configuration is validated when the session
    /// runs; an invalid one yields `InvalidParameters`.
    pub fn build(self) -> ToolRunner {
        let mut config = self.config;
        if let Some(timeout) = self.timeout {
            config.timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        }

        ToolRunner {
            tool: self.tool,
            parameters: self.parameters,
            llm: self.llm,
            bot: self.bot,
            context: self.context,
            collaborators: self.collaborators,
            config,
            nesting_depth: self.nesting_depth,
        }
    }
}

/// Provenance captured when the session starts
#[derive(Debug, Clone)]
struct Session {
    id: String,
    tool_name: String,
    parameters_hash: String,
    started_at: DateTime<Utc>,
    started: Instant,
    acting_identity: ActingIdentity,
    nesting_depth: u32,
}

impl Session {
    fn begin(runner: &ToolRunner) -> Self {
        let params_json = serde_json::to_string(&runner.parameters).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(params_json.as_bytes());
        let params_hash = format!("{:x}", hasher.finalize());

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool_name: runner.tool.name.clone(),
            parameters_hash: params_hash[..16].to_string(),
            started_at: Utc::now(),
            started: Instant::now(),
            acting_identity: runner.bot.clone(),
            nesting_depth: runner.nesting_depth,
        }
    }

    fn provenance(&self, http_requests: u32) -> ExecutionProvenance {
        ExecutionProvenance {
            session_id: self.id.clone(),
            tool_name: self.tool_name.clone(),
            parameters_hash: self.parameters_hash.clone(),
            started_at: self.started_at,
            duration: self.started.elapsed(),
            http_requests,
            acting_identity: self.acting_identity.clone(),
            nesting_depth: self.nesting_depth,
        }
    }
}

/// Host-generated sources evaluated around the tool script
struct Scripts {
    prelude: String,
    invoke: String,
}

impl Scripts {
    fn prepare(context: &Map<String, Value>, parameters: &Value) -> Result<Self, SandboxError> {
        let prelude = framework_script(context)
            .map_err(|e| SandboxError::invalid(format!("context is not serializable: {e}")))?;
        let invoke = invoke_expression(parameters)
            .map_err(|e| SandboxError::invalid(format!("parameters are not serializable: {e}")))?;
        Ok(Self { prelude, invoke })
    }
}

fn execute(
    tool: &ToolDefinition,
    parameters: &Value,
    config: &SandboxConfig,
    bridge: &Rc<Bridge>,
    scripts: &Scripts,
) -> Result<(Value, Option<String>), SandboxError> {
    config
        .validate()
        .map_err(|e| SandboxError::invalid(e.to_string()))?;

    bridge
        .adapter()
        .check(parameters)
        .map_err(|e| SandboxError::invalid(format!("parameters {e}")))?;

    let missing = tool.missing_parameters(parameters);
    if !missing.is_empty() {
        return Err(SandboxError::invalid(format!(
            "missing required parameters: {}",
            missing.join(", ")
        )));
    }

    let interrupt = Arc::new(AtomicBool::new(false));
    let interpreter = Interpreter::new(config, Arc::clone(&interrupt))
        .map_err(|e| SandboxError::script(format!("failed to start interpreter: {e}")))?;
    interpreter
        .register(bridge)
        .map_err(|e| SandboxError::script(format!("failed to register capabilities: {e}")))?;
    interpreter
        .eval::<()>(&scripts.prelude)
        .map_err(|message| SandboxError::script(format!("failed to load framework: {message}")))?;

    let supervisor = Supervisor {
        config,
        bridge,
        interrupt: &interrupt,
    };

    supervisor.eval::<()>(&interpreter, &tool.script)?;

    let marshalled = supervisor.eval::<String>(&interpreter, &scripts.invoke)?;
    let value: Value = serde_json::from_str(&marshalled)
        .map_err(|e| SandboxError::script(format!("invoke returned an unreadable value: {e}")))?;
    bridge
        .adapter()
        .check(&value)
        .map_err(|e| SandboxError::script(format!("invoke result {e}")))?;

    let details = match supervisor.eval::<String>(&interpreter, details_expression()) {
        Ok(details) => Some(details),
        Err(error) => {
            tracing::warn!(tool = %tool.name, error = %error, "details() failed");
            None
        }
    };

    Ok((value, details))
}

/// Runs evaluations under a fresh watchdog each
struct Supervisor<'a> {
    config: &'a SandboxConfig,
    bridge: &'a Bridge,
    interrupt: &'a Arc<AtomicBool>,
}

impl Supervisor<'_> {
    fn eval<T>(&self, interpreter: &Interpreter, source: &str) -> Result<T, SandboxError>
    where
        T: for<'js> FromJs<'js>,
    {
        let watchdog = Watchdog::start(
            self.config.timeout(),
            self.config.watchdog_tick,
            self.bridge.calls().clone(),
            Arc::clone(self.interrupt),
        )
        .map_err(|e| SandboxError::script(format!("failed to start watchdog: {e}")))?;

        let result = interpreter.eval::<T>(source);
        let fired = watchdog.finish();

        settle(result, fired, self.interrupt, self.config.timeout_ms, |message| {
            self.bridge.classify(message)
        })
    }
}

/// Decide what a supervised evaluation produced.
///
/// A value that completed in the same tick the watchdog fired is kept, and
/// the interrupt is lowered so the next phase starts clean. A failure after
/// the watchdog fired is the interrupt unwinding the guest.
fn settle<T>(
    result: Result<T, String>,
    fired: bool,
    interrupt: &AtomicBool,
    timeout_ms: u64,
    classify: impl FnOnce(String) -> SandboxError,
) -> Result<T, SandboxError> {
    match result {
        Ok(value) => {
            if fired {
                interrupt.store(false, Ordering::SeqCst);
            }
            Ok(value)
        }
        Err(_) if fired => Err(SandboxError::TimeoutExceeded { timeout_ms }),
        Err(message) => Err(classify(message)),
    }
}
