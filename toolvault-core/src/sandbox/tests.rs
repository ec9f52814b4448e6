//! Session tests for the sandbox module

use super::*;
use crate::config::SandboxConfig;
use crate::error::{Result, ToolvaultError};
use crate::host::{
    ActingIdentity, DispatchOutcome, Fragment, FragmentIndex, HostData, HttpRequest, HttpResponse,
    HttpTransport, LanguageModel, PersonaDispatcher, PersonaRequest, Prompt, ReplyTarget,
    Tokenizer, UploadFile, UploadRecord, UploadStore, UserRef, WhitespaceTokenizer,
};
use crate::tools::{ToolDefinition, ToolSchema};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Echoes the feature tag, identity and prompt text back
#[derive(Default)]
struct EchoModel {
    tokenizer: WhitespaceTokenizer,
}

#[async_trait]
impl LanguageModel for EchoModel {
    async fn generate(
        &self,
        prompt: &Prompt,
        identity: &ActingIdentity,
        feature_name: &str,
    ) -> Result<String> {
        Ok(format!("{feature_name}|{}|{}", identity.username, prompt.to_text()))
    }

    fn tokenizer(&self) -> &dyn Tokenizer {
        &self.tokenizer
    }
}

/// Records every request; optionally slow
#[derive(Default)]
struct RecordingTransport {
    requests: Mutex<Vec<HttpRequest>>,
    delay: Option<Duration>,
}

impl RecordingTransport {
    fn slow(delay: Duration) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            delay: Some(delay),
        }
    }

    fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for RecordingTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let body = format!("{} {}", request.method, request.url);
        self.requests.lock().unwrap().push(request);
        Ok(HttpResponse { status: 200, body })
    }
}

struct FailingTransport;

#[async_trait]
impl HttpTransport for FailingTransport {
    async fn send(&self, _request: HttpRequest) -> Result<HttpResponse> {
        Err(ToolvaultError::Host("connection refused".to_string()))
    }
}

/// Returns its fragments in order and remembers the requested limit
struct StaticIndex {
    fragments: Vec<Fragment>,
    limits: Mutex<Vec<usize>>,
}

impl StaticIndex {
    fn new(fragments: Vec<Fragment>) -> Self {
        Self {
            fragments,
            limits: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl FragmentIndex for StaticIndex {
    async fn embed(&self, query: &str) -> Result<Vec<f32>> {
        Ok(vec![query.len() as f32])
    }

    async fn similarity_search(
        &self,
        _tool_id: &str,
        _query_vector: &[f32],
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Fragment>> {
        self.limits.lock().unwrap().push(limit);
        Ok(self.fragments.iter().skip(offset).take(limit).cloned().collect())
    }
}

fn fragment(id: i64, filename: &str, text: &str) -> Fragment {
    Fragment {
        id,
        filename: filename.to_string(),
        fragment: text.to_string(),
        metadata: Some(format!("chunk {id}")),
    }
}

#[derive(Default)]
struct MemoryUploads {
    files: Mutex<Vec<(UploadFile, bool, ActingIdentity)>>,
}

#[async_trait]
impl UploadStore for MemoryUploads {
    async fn create(
        &self,
        file: UploadFile,
        private: bool,
        owner: &ActingIdentity,
    ) -> Result<UploadRecord> {
        let mut files = self.files.lock().unwrap();
        let id = files.len() as i64 + 1;
        let record = UploadRecord {
            id,
            url: format!("/uploads/{}", file.filename),
            short_url: format!("upload://{id}"),
        };
        files.push((file, private, owner.clone()));
        Ok(record)
    }
}

#[derive(Debug)]
struct Author;

impl Reduce for Author {
    fn reduce(self: Arc<Self>) -> HostValue {
        HostValue::Record(self)
    }

    fn describe(&self) -> String {
        "author record".to_string()
    }
}

#[derive(Debug)]
struct PostRecord {
    id: i64,
}

impl Reduce for PostRecord {
    fn reduce(self: Arc<Self>) -> HostValue {
        let mut map = BTreeMap::new();
        map.insert("id".to_string(), HostValue::Number(self.id.into()));
        map.insert("raw".to_string(), HostValue::String("hello".to_string()));
        map.insert("author".to_string(), HostValue::record(Author));
        HostValue::Map(map)
    }

    fn describe(&self) -> String {
        format!("post {}", self.id)
    }
}

#[derive(Default)]
struct FakeHostData {
    searches: Mutex<Vec<(Map<String, Value>, bool)>>,
    users: Mutex<Vec<UserRef>>,
    author_lookups: Mutex<Vec<i64>>,
}

#[async_trait]
impl HostData for FakeHostData {
    async fn search(&self, params: Map<String, Value>, include_private: bool) -> Result<HostValue> {
        self.searches.lock().unwrap().push((params, include_private));
        Ok(HostValue::Array(vec![HostValue::record(PostRecord { id: 1 })]))
    }

    async fn get_post(&self, post_id: i64) -> Result<Option<HostValue>> {
        Ok((post_id == 1).then(|| HostValue::record(PostRecord { id: 1 })))
    }

    async fn get_user(&self, user: UserRef) -> Result<Option<HostValue>> {
        self.users.lock().unwrap().push(user.clone());
        Ok(match user {
            UserRef::Id(42) => Some(json!({"id": 42, "username": "sam"}).into()),
            _ => None,
        })
    }

    async fn post_author(&self, post_id: i64) -> Result<Option<ActingIdentity>> {
        self.author_lookups.lock().unwrap().push(post_id);
        Ok((post_id == 9).then(|| ActingIdentity::new(7, "alice")))
    }
}

#[derive(Default)]
struct RecordingDispatcher {
    requests: Mutex<Vec<PersonaRequest>>,
}

#[async_trait]
impl PersonaDispatcher for RecordingDispatcher {
    async fn respond_to(&self, request: PersonaRequest) -> DispatchOutcome {
        let outcome = if request.persona == "missing" {
            DispatchOutcome::failed("Persona not found")
        } else {
            DispatchOutcome::PostReply {
                post_id: 100,
                post_number: 2,
            }
        };
        self.requests.lock().unwrap().push(request);
        outcome
    }
}

/// Runs a nested session for the target persona
struct NestedDispatcher;

#[async_trait]
impl PersonaDispatcher for NestedDispatcher {
    async fn respond_to(&self, request: PersonaRequest) -> DispatchOutcome {
        let nested = tool("function invoke(p) { return 7; }");
        let result = ToolRunner::builder(nested, Arc::new(EchoModel::default()), request.bot)
            .context(request.context)
            .nesting_depth(request.nesting_depth)
            .build()
            .invoke()
            .await;

        match result.value().and_then(Value::as_i64) {
            Some(message_id) => DispatchOutcome::ChatReply { message_id },
            None => DispatchOutcome::failed("nested session failed"),
        }
    }
}

fn bot() -> ActingIdentity {
    ActingIdentity::new(-1, "system")
}

fn tool(script: &str) -> ToolDefinition {
    ToolDefinition::new("tool-1", "test_tool", script)
}

fn runner(script: &str) -> ToolRunnerBuilder {
    ToolRunner::builder(tool(script), Arc::new(EchoModel::default()), bot())
}

fn context(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn expect_error(result: &ExecutionResult) -> &SandboxError {
    result
        .error()
        .unwrap_or_else(|| panic!("expected an error, got {:?}", result.outcome))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capability_free_script_returns_value() {
    let result = runner("function invoke(p) { return p.x + 1; }")
        .parameters(json!({"x": 41}))
        .build()
        .invoke()
        .await;

    assert!(result.is_success(), "{:?}", result.outcome);
    assert_eq!(result.value(), Some(&json!(42)));
    assert_eq!(result.details.as_deref(), Some(""));
    assert_eq!(result.custom_raw, None);
    assert_eq!(result.provenance.tool_name, "test_tool");
    assert_eq!(result.provenance.parameters_hash.len(), 16);
    assert_eq!(result.provenance.http_requests, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_structured_values_round_trip() {
    let result = runner("function invoke(p) { return { echoed: p, n: [1, 2.5, null] }; }")
        .parameters(json!({"name": "sam", "tags": ["a", "b"]}))
        .build()
        .invoke()
        .await;

    assert_eq!(
        result.value(),
        Some(&json!({"echoed": {"name": "sam", "tags": ["a", "b"]}, "n": [1, 2.5, null]}))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_undefined_return_is_null() {
    let result = runner("function invoke(p) {}").build().invoke().await;
    assert_eq!(result.value(), Some(&Value::Null));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_context_is_visible_and_frozen() {
    let result = runner(
        r#"function invoke(p) {
            "use strict";
            try { context.post_id = 1; } catch (e) { return ["frozen", context.post_id]; }
            return "mutable";
        }"#,
    )
    .context(context(json!({"post_id": 12})))
    .build()
    .invoke()
    .await;

    assert_eq!(result.value(), Some(&json!(["frozen", 12])));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_busy_loop_times_out() {
    let started = Instant::now();
    let result = runner("function invoke(p) { while (true) {} }")
        .timeout(Duration::from_millis(50))
        .build()
        .invoke()
        .await;

    assert_eq!(
        expect_error(&result),
        &SandboxError::TimeoutExceeded { timeout_ms: 50 }
    );
    assert!(result.value().is_none());
    assert!(result.details.is_none());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_cannot_be_caught_by_guest() {
    let result = runner(
        r#"function invoke(p) {
            try { while (true) {} } catch (e) { return "caught"; }
        }"#,
    )
    .timeout(Duration::from_millis(50))
    .build()
    .invoke()
    .await;

    assert_eq!(expect_error(&result).kind(), "timeout_exceeded");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_top_level_loop_times_out() {
    let result = runner("while (true) {} function invoke(p) { return 1; }")
        .timeout(Duration::from_millis(50))
        .build()
        .invoke()
        .await;

    assert_eq!(expect_error(&result).kind(), "timeout_exceeded");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_time_in_capability_calls_is_not_counted() {
    let transport = Arc::new(RecordingTransport::slow(Duration::from_millis(40)));
    let result = runner(
        r#"function invoke(p) {
            let statuses = [];
            for (let i = 0; i < 5; i++) {
                statuses.push(http.get("https://example.com/" + i).status);
            }
            return statuses;
        }"#,
    )
    .timeout(Duration::from_millis(100))
    .http(transport.clone())
    .build()
    .invoke()
    .await;

    assert!(result.is_success(), "{:?}", result.outcome);
    assert_eq!(result.value(), Some(&json!([200, 200, 200, 200, 200])));
    assert_eq!(transport.requests().len(), 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_busy_work_between_calls_still_times_out() {
    let transport = Arc::new(RecordingTransport::slow(Duration::from_millis(5)));
    let started = Instant::now();
    let result = runner(
        r#"function invoke(p) {
            while (true) {
                http.get("https://example.com");
                let s = 0;
                for (let i = 0; i < 200000; i++) { s += i; }
            }
        }"#,
    )
    .config(SandboxConfig::default().with_max_http_requests(1_000_000))
    .timeout(Duration::from_millis(100))
    .http(transport.clone())
    .build()
    .invoke()
    .await;

    assert_eq!(
        expect_error(&result),
        &SandboxError::TimeoutExceeded { timeout_ms: 100 }
    );
    assert!(!transport.requests().is_empty());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_config_is_rejected_on_invoke() {
    let mut config = SandboxConfig::default().with_timeout_ms(50);
    config.watchdog_tick = Duration::ZERO;

    let started = Instant::now();
    let result = runner("function invoke(p) { while (true) {} }")
        .config(config)
        .build()
        .invoke()
        .await;

    let error = expect_error(&result);
    assert_eq!(error.kind(), "invalid_parameters");
    assert!(error.to_string().contains("watchdog_tick"));
    assert!(started.elapsed() < Duration::from_secs(2));

    let mut config = SandboxConfig::default();
    config.max_stack_size = 0;
    let result = runner("function invoke(p) { return 1; }")
        .config(config)
        .build()
        .invoke()
        .await;

    assert!(expect_error(&result).to_string().contains("max_stack_size"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_quota_exceeded_on_crossing_call() {
    let transport = Arc::new(RecordingTransport::default());
    let result = runner(
        r#"function invoke(p) {
            for (let i = 0; i < 21; i++) { http.get("https://example.com/" + i); }
            return "unreachable";
        }"#,
    )
    .http(transport.clone())
    .build()
    .invoke()
    .await;

    assert_eq!(
        expect_error(&result),
        &SandboxError::QuotaExceeded { limit: 20 }
    );
    assert_eq!(transport.requests().len(), 20);
    assert_eq!(result.provenance.http_requests, 21);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_caught_quota_error_keeps_failing() {
    let transport = Arc::new(RecordingTransport::default());
    let result = runner(
        r#"function invoke(p) {
            let refused = 0;
            for (let i = 0; i < 5; i++) {
                try { http.get("https://example.com"); } catch (e) { refused++; }
            }
            return refused;
        }"#,
    )
    .config(SandboxConfig::default().with_max_http_requests(2))
    .http(transport.clone())
    .build()
    .invoke()
    .await;

    assert_eq!(result.value(), Some(&json!(3)));
    assert_eq!(transport.requests().len(), 2);
    assert_eq!(result.provenance.http_requests, 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_request_shape() {
    let transport = Arc::new(RecordingTransport::default());
    let result = runner(
        r#"function invoke(p) {
            http.get("https://example.com/a", { headers: { Accept: "text/plain" }, body: "ignored" });
            const r = http.post("https://example.com/b", { headers: { "X-Count": 3 }, body: { a: 1 } });
            return r.body;
        }"#,
    )
    .http(transport.clone())
    .build()
    .invoke()
    .await;

    assert_eq!(result.value(), Some(&json!("POST https://example.com/b")));

    let requests = transport.requests();
    assert_eq!(requests[0].headers.get("Accept").map(String::as_str), Some("text/plain"));
    assert_eq!(requests[0].body, None);
    assert_eq!(requests[1].headers.get("X-Count").map(String::as_str), Some("3"));
    assert_eq!(requests[1].body.as_deref(), Some(r#"{"a":1}"#));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_write_methods() {
    let transport = Arc::new(RecordingTransport::default());
    let result = runner(
        r#"function invoke(p) {
            return [
                http.put("https://example.com/1", { body: "full" }).body,
                http.patch("https://example.com/1", { body: { done: true } }).body,
                http.delete("https://example.com/1", { headers: { "X-Reason": "stale" }, body: "why" }).body,
            ];
        }"#,
    )
    .http(transport.clone())
    .build()
    .invoke()
    .await;

    assert_eq!(
        result.value(),
        Some(&json!([
            "PUT https://example.com/1",
            "PATCH https://example.com/1",
            "DELETE https://example.com/1"
        ]))
    );

    let requests = transport.requests();
    assert_eq!(requests[0].body.as_deref(), Some("full"));
    assert_eq!(requests[1].body.as_deref(), Some(r#"{"done":true}"#));
    assert_eq!(requests[2].body.as_deref(), Some("why"));
    assert_eq!(requests[2].headers.get("X-Reason").map(String::as_str), Some("stale"));
    assert_eq!(result.provenance.http_requests, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transport_failure_is_capability_error() {
    let result = runner(r#"function invoke(p) { return http.get("https://example.com"); }"#)
        .http(Arc::new(FailingTransport))
        .build()
        .invoke()
        .await;

    let error = expect_error(&result);
    assert_eq!(error.kind(), "capability_error");
    assert!(error.to_string().contains("connection refused"));
    assert!(error.is_retryable());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_guest_can_handle_capability_errors() {
    let result = runner(
        r#"function invoke(p) {
            try { http.get("https://example.com"); } catch (e) { return "handled: " + e.message; }
        }"#,
    )
    .http(Arc::new(FailingTransport))
    .build()
    .invoke()
    .await;

    let value = result.value().and_then(Value::as_str).unwrap_or_default();
    assert!(value.starts_with("handled: http_get failed"), "{value}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_policy_denial() {
    let transport = Arc::new(RecordingTransport::default());
    let result = runner(r#"function invoke(p) { return http.get("https://example.com"); }"#)
        .config(
            SandboxConfig::default()
                .with_policy(CapabilityPolicy::allow_all().deny(Capability::HttpGet)),
        )
        .http(transport.clone())
        .build()
        .invoke()
        .await;

    assert_eq!(expect_error(&result).kind(), "capability_error");
    assert!(transport.requests().is_empty());
    assert_eq!(result.provenance.http_requests, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_guest_throw_is_script_error() {
    let result = runner(r#"function invoke(p) { throw new Error("boom"); }"#)
        .build()
        .invoke()
        .await;

    assert_eq!(expect_error(&result), &SandboxError::script("boom"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_syntax_error_and_missing_invoke() {
    let result = runner("function invoke(p) { return ; ) }").build().invoke().await;
    assert_eq!(expect_error(&result).kind(), "script_error");

    let result = runner("const x = 1;").build().invoke().await;
    assert_eq!(expect_error(&result).kind(), "script_error");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deep_parameters_are_invalid() {
    let mut nested = json!(1);
    for _ in 0..25 {
        nested = json!({ "inner": nested });
    }

    let result = runner("function invoke(p) { return 1; }")
        .parameters(nested)
        .build()
        .invoke()
        .await;

    assert_eq!(expect_error(&result).kind(), "invalid_parameters");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_required_parameters() {
    let definition = tool("function invoke(p) { return p.city; }").with_schema(ToolSchema::new(
        json!({"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]}),
    ));

    let result = ToolRunner::builder(definition, Arc::new(EchoModel::default()), bot())
        .build()
        .invoke()
        .await;

    assert_eq!(expect_error(&result).kind(), "invalid_parameters");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_runaway_allocation_is_contained() {
    let result = runner(
        r#"function invoke(p) {
            let chunks = [];
            while (true) { chunks.push("x".repeat(100000)); }
        }"#,
    )
    .config(SandboxConfig::default().with_max_memory(2_000_000))
    .build()
    .invoke()
    .await;

    assert!(result.is_error());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_custom_raw_and_details() {
    let result = runner(
        r#"
        let lookups = 0;
        function invoke(p) {
            lookups = 3;
            chain.setCustomRaw({ raw: "payload", n: 1 });
            return "done";
        }
        function details() { return "looked up " + lookups + " things"; }
        "#,
    )
    .build()
    .invoke()
    .await;

    assert_eq!(result.value(), Some(&json!("done")));
    assert_eq!(result.custom_raw, Some(json!({"raw": "payload", "n": 1})));
    assert_eq!(result.details.as_deref(), Some("looked up 3 things"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failing_details_keeps_value() {
    let result = runner(
        r#"
        function invoke(p) { return 1; }
        function details() { throw new Error("no details"); }
        "#,
    )
    .build()
    .invoke()
    .await;

    assert_eq!(result.value(), Some(&json!(1)));
    assert_eq!(result.details, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_llm_truncate_and_generate() {
    let result = runner(
        r#"function invoke(p) {
            return [
                llm.truncate("one two three four", 2),
                llm.generate("hello"),
                llm.generate({ messages: [
                    { type: "system", content: "be brief" },
                    { type: "user", content: "hi", id: "sam" }
                ] }),
            ];
        }"#,
    )
    .build()
    .invoke()
    .await;

    assert_eq!(
        result.value(),
        Some(&json!([
            "one two",
            "custom_tool_test_tool|system|hello",
            "custom_tool_test_tool|system|be brief\nhi"
        ]))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_llm_generate_uses_context_user() {
    let result = runner(r#"function invoke(p) { return llm.generate("hi"); }"#)
        .context(context(json!({"llm_user": {"id": 5, "username": "sam"}})))
        .build()
        .invoke()
        .await;

    assert_eq!(result.value(), Some(&json!("custom_tool_test_tool|sam|hi")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_llm_generate_attributed_to_post_author() {
    let host = Arc::new(FakeHostData::default());
    let result = runner(r#"function invoke(p) { return [llm.generate("a"), llm.generate("b")]; }"#)
        .context(context(json!({"post_id": 9})))
        .host_data(host.clone())
        .build()
        .invoke()
        .await;

    assert_eq!(
        result.value(),
        Some(&json!(["custom_tool_test_tool|alice|a", "custom_tool_test_tool|alice|b"]))
    );
    assert_eq!(*host.author_lookups.lock().unwrap(), vec![9]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_llm_identity_precedence() {
    let host = Arc::new(FakeHostData::default());
    let result = runner(r#"function invoke(p) { return llm.generate("hi"); }"#)
        .context(context(json!({"post_id": 9, "llm_user": {"id": 5, "username": "sam"}})))
        .host_data(host.clone())
        .build()
        .invoke()
        .await;

    assert_eq!(result.value(), Some(&json!("custom_tool_test_tool|sam|hi")));
    assert!(host.author_lookups.lock().unwrap().is_empty());

    let result = runner(r#"function invoke(p) { return llm.generate("hi"); }"#)
        .context(context(json!({"post_id": 404})))
        .host_data(host.clone())
        .build()
        .invoke()
        .await;

    assert_eq!(result.value(), Some(&json!("custom_tool_test_tool|system|hi")));
    assert_eq!(*host.author_lookups.lock().unwrap(), vec![404]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_prompt_is_invalid_parameters() {
    let result = runner(r#"function invoke(p) { return llm.generate({ text: "hi" }); }"#)
        .build()
        .invoke()
        .await;

    assert_eq!(
        expect_error(&result),
        &SandboxError::invalid("Prompt must have messages")
    );
}

fn indexed_runner(script: &str, index: Arc<StaticIndex>) -> ToolRunnerBuilder {
    let definition = tool(script).with_readable_upload("notes.md");
    ToolRunner::builder(definition, Arc::new(EchoModel::default()), bot()).index(index)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_index_search_scoped_to_readable_uploads() {
    let index = Arc::new(StaticIndex::new(vec![
        fragment(1, "notes.md", "first"),
        fragment(2, "secret.md", "hidden"),
        fragment(3, "notes.md", "second"),
    ]));

    let result = indexed_runner(r#"function invoke(p) { return index.search("q"); }"#, index.clone())
        .build()
        .invoke()
        .await;

    assert_eq!(
        result.value(),
        Some(&json!([
            {"fragment": "first", "metadata": "chunk 1"},
            {"fragment": "second", "metadata": "chunk 3"}
        ]))
    );
    assert_eq!(*index.limits.lock().unwrap(), vec![10]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_index_search_limits() {
    let index = Arc::new(StaticIndex::new(vec![fragment(1, "notes.md", "first")]));

    let result = indexed_runner(
        r#"function invoke(p) {
            return [
                index.search("q", { limit: -5 }),
                index.search("q", { limit: "junk" }),
                index.search("q", { limit: 10000 }),
                index.search("q", { limit: "3" }),
                index.search("q", { filenames: ["secret.md"] }),
                index.search(),
            ];
        }"#,
        index.clone(),
    )
    .build()
    .invoke()
    .await;

    let first = json!([{"fragment": "first", "metadata": "chunk 1"}]);
    assert_eq!(
        result.value(),
        Some(&json!([[], [], first, first, [], []]))
    );
    assert_eq!(*index.limits.lock().unwrap(), vec![200, 3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_index_search_without_readable_uploads() {
    let index = Arc::new(StaticIndex::new(vec![fragment(1, "notes.md", "first")]));
    let result = runner(r#"function invoke(p) { return index.search("q"); }"#)
        .index(index.clone())
        .build()
        .invoke()
        .await;

    assert_eq!(result.value(), Some(&json!([])));
    assert!(index.limits.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upload_create_strips_path() {
    let uploads = Arc::new(MemoryUploads::default());
    let result = runner(
        r#"function invoke(p) { return upload.create("../../etc/passwd", "aGVs\nbG8="); }"#,
    )
    .context(context(json!({"private_message": true})))
    .uploads(uploads.clone())
    .build()
    .invoke()
    .await;

    assert_eq!(
        result.value(),
        Some(&json!({"id": 1, "url": "/uploads/passwd", "short_url": "upload://1"}))
    );

    let files = uploads.files.lock().unwrap();
    let (file, private, owner) = &files[0];
    assert_eq!(file.filename, "passwd");
    assert_eq!(file.bytes, b"hello");
    assert!(*private);
    assert_eq!(owner, &bot());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upload_create_rejects_bad_input() {
    let uploads = Arc::new(MemoryUploads::default());

    let result = runner(r#"function invoke(p) { return upload.create("a.txt", "!!!not base64"); }"#)
        .uploads(uploads.clone())
        .build()
        .invoke()
        .await;
    assert_eq!(expect_error(&result).kind(), "invalid_parameters");

    let result = runner(r#"function invoke(p) { return upload.create("../", "aGVsbG8="); }"#)
        .uploads(uploads.clone())
        .build()
        .invoke()
        .await;
    assert_eq!(expect_error(&result).kind(), "invalid_parameters");

    assert!(uploads.files.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_discourse_records_pass_through_adapter() {
    let host = Arc::new(FakeHostData::default());
    let result = runner(
        r#"function invoke(p) {
            return {
                post: discourse.getPost(1),
                missing: discourse.getPost(2),
                user: discourse.getUser("42"),
                nobody: discourse.getUser("ghost"),
                found: discourse.search({ q: "hello", with_private: true }),
            };
        }"#,
    )
    .host_data(host.clone())
    .build()
    .invoke()
    .await;

    let post = json!({"id": 1, "raw": "hello", "author": "author record"});
    assert_eq!(
        result.value(),
        Some(&json!({
            "post": post,
            "missing": null,
            "user": {"id": 42, "username": "sam"},
            "nobody": null,
            "found": [post],
        }))
    );

    assert_eq!(
        *host.users.lock().unwrap(),
        vec![UserRef::Id(42), UserRef::Username("ghost".into())]
    );
    let searches = host.searches.lock().unwrap();
    assert_eq!(searches[0].0, context(json!({"q": "hello"})));
    assert!(searches[0].1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_respond_to_dispatches_with_post_target() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let result = runner(
        r#"function invoke(p) {
            return [
                discourse.getPersona("helper").respondTo({ instructions: "summarize", whisper: true }),
                discourse.getPersona("missing").respondTo({}),
            ];
        }"#,
    )
    .context(context(json!({"post_id": 9})))
    .dispatcher(dispatcher.clone())
    .nesting_depth(1)
    .build()
    .invoke()
    .await;

    assert_eq!(
        result.value(),
        Some(&json!([
            {"success": true, "post_id": 100, "post_number": 2},
            {"error": "Persona not found"}
        ]))
    );

    let requests = dispatcher.requests.lock().unwrap();
    assert_eq!(requests[0].target, ReplyTarget::Post { post_id: 9 });
    assert_eq!(requests[0].instructions.as_deref(), Some("summarize"));
    assert!(requests[0].whisper);
    assert_eq!(requests[0].nesting_depth, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_respond_to_structured_failures() {
    let dispatcher = Arc::new(RecordingDispatcher::default());

    let result = runner(r#"function invoke(p) { return discourse.getPersona("helper").respondTo({}); }"#)
        .dispatcher(dispatcher.clone())
        .build()
        .invoke()
        .await;
    assert_eq!(result.value(), Some(&json!({"error": "No valid context for response"})));

    let result = runner(r#"function invoke(p) { return discourse.getPersona("helper").respondTo({}); }"#)
        .context(context(json!({"post_id": 9})))
        .dispatcher(dispatcher.clone())
        .nesting_depth(3)
        .build()
        .invoke()
        .await;
    assert_eq!(
        result.value(),
        Some(&json!({"error": "Maximum persona nesting depth reached"}))
    );

    assert!(dispatcher.requests.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_nested_session_runs_inside_capability_call() {
    let result = runner(r#"function invoke(p) { return discourse.getPersona("helper").respondTo({}); }"#)
        .context(context(json!({"message_id": 5, "channel_id": 6})))
        .dispatcher(Arc::new(NestedDispatcher))
        .build()
        .invoke()
        .await;

    assert_eq!(result.value(), Some(&json!({"success": true, "message_id": 7})));
}

#[test]
fn test_invoke_blocking_outside_async() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let result = runner("function invoke(p) { return llm.generate(\"x\"); }")
        .build()
        .invoke_blocking(runtime.handle().clone());

    assert_eq!(result.value(), Some(&json!("custom_tool_test_tool|system|x")));
}
