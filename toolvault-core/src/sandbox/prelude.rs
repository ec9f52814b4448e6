//! Framework prelude evaluated before every tool script
//!
//! The prelude defines the guest-visible namespaces as thin call-throughs to
//! the bridge globals. Arguments cross the boundary as a JSON array and come
//! back as a JSON envelope, either `{"ok": value}` or `{"error": message}`;
//! the latter is rethrown as a guest `Error`.

use serde_json::{Map, Value};

const NAMESPACES: &str = r#"
const __hostCall = function(fn, args) {
  const envelope = JSON.parse(fn(JSON.stringify(args)));
  if (envelope.error !== undefined) {
    throw new Error(envelope.error);
  }
  return envelope.ok;
};

const __marshal = function(value) {
  const json = JSON.stringify(value);
  return json === undefined ? "null" : json;
};

const http = Object.freeze({
  get: function(url, options) { return __hostCall(_http_get, [url, options]); },
  post: function(url, options) { return __hostCall(_http_post, [url, options]); },
  put: function(url, options) { return __hostCall(_http_put, [url, options]); },
  patch: function(url, options) { return __hostCall(_http_patch, [url, options]); },
  delete: function(url, options) { return __hostCall(_http_delete, [url, options]); },
});

const llm = Object.freeze({
  truncate: function(text, length) { return __hostCall(_llm_truncate, [text, length]); },
  generate: function(prompt) { return __hostCall(_llm_generate, [prompt]); },
});

const index = Object.freeze({
  search: function(query, options) { return __hostCall(_index_search, [query, options]); },
});

const upload = Object.freeze({
  create: function(filename, base64) { return __hostCall(_upload_create, [filename, base64]); },
});

const chain = Object.freeze({
  setCustomRaw: function(raw) { return __hostCall(_chain_set_custom_raw, [raw]); },
});

const discourse = Object.freeze({
  search: function(params) { return __hostCall(_discourse_search, [params]); },
  getPost: function(id) { return __hostCall(_discourse_get_post, [id]); },
  getUser: function(idOrUsername) { return __hostCall(_discourse_get_user, [idOrUsername]); },
  getPersona: function(name) {
    return Object.freeze({
      respondTo: function(params) {
        return __hostCall(_discourse_respond_to_persona, [name, params]);
      },
    });
  },
});

function details() { return ""; }
"#;

/// Build the prelude for a session with the given ambient context
pub fn framework_script(context: &Map<String, Value>) -> serde_json::Result<String> {
    let context_json = serde_json::to_string(context)?;
    Ok(format!(
        "{NAMESPACES}\nconst context = Object.freeze({context_json});\n"
    ))
}

/// Expression evaluating the guest entry point with marshalled parameters
pub fn invoke_expression(parameters: &Value) -> serde_json::Result<String> {
    Ok(format!("__marshal(invoke({}))", serde_json::to_string(parameters)?))
}

/// Expression evaluating the guest `details()` hook
pub fn details_expression() -> &'static str {
    "String(details())"
}
