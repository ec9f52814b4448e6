//! Serialization adapter between host values and sandbox-safe values
//!
//! Host collaborators hand back [`HostValue`]s, which may contain domain
//! records that know how to reduce themselves to plain structure. The
//! adapter walks sequences element-wise and maps value-wise, reduces
//! records and recurses into the result. A record whose reduction is the
//! very same instance is returned as-is, which stops self-referential
//! reductions. The walk is also depth-bounded, so a chain of records that
//! keep producing fresh records terminates as well.

use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A host object that can reduce itself to plain structure
pub trait Reduce: fmt::Debug + Send + Sync {
    /// Reduce to plain structure. Returning `HostValue::Record(self)` means
    /// the object is already as plain as it gets.
    fn reduce(self: Arc<Self>) -> HostValue;

    /// Guest-visible rendering used when the record could not be reduced.
    /// Must not leak host internals such as addresses.
    fn describe(&self) -> String;
}

/// Structured value produced on the host side of the boundary
#[derive(Debug, Clone)]
pub enum HostValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<HostValue>),
    Map(BTreeMap<String, HostValue>),
    Record(Arc<dyn Reduce>),
}

impl HostValue {
    /// Wrap a domain record
    pub fn record(record: impl Reduce + 'static) -> Self {
        HostValue::Record(Arc::new(record))
    }
}

impl From<Value> for HostValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => HostValue::Null,
            Value::Bool(b) => HostValue::Bool(b),
            Value::Number(n) => HostValue::Number(n),
            Value::String(s) => HostValue::String(s),
            Value::Array(items) => HostValue::Array(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                HostValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// A value nested deeper than the marshal depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("value nested deeper than {max_depth} levels")]
pub struct DepthExceeded {
    pub max_depth: usize,
}

/// Converts host values into sandbox-safe JSON
#[derive(Debug, Clone, Copy)]
pub struct SerializationAdapter {
    max_depth: usize,
}

impl SerializationAdapter {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Recursively reduce records, keeping identity-reducing ones as-is
    pub fn normalize(&self, value: HostValue) -> Result<HostValue, DepthExceeded> {
        self.walk(value, 0)
    }

    /// Normalize and render as JSON for the guest
    pub fn to_sandbox(&self, value: HostValue) -> Result<Value, DepthExceeded> {
        Ok(into_json(self.normalize(value)?))
    }

    /// Reject guest-originated JSON nested deeper than the marshal depth
    pub fn check(&self, value: &Value) -> Result<(), DepthExceeded> {
        self.check_at(value, 0)
    }

    fn walk(&self, value: HostValue, depth: usize) -> Result<HostValue, DepthExceeded> {
        match value {
            HostValue::Array(items) => {
                self.enter(depth)?;
                items
                    .into_iter()
                    .map(|item| self.walk(item, depth + 1))
                    .collect::<Result<Vec<_>, _>>()
                    .map(HostValue::Array)
            }
            HostValue::Map(map) => {
                self.enter(depth)?;
                map.into_iter()
                    .map(|(key, item)| Ok((key, self.walk(item, depth + 1)?)))
                    .collect::<Result<BTreeMap<_, _>, _>>()
                    .map(HostValue::Map)
            }
            HostValue::Record(record) => {
                self.enter(depth)?;
                let reduced = Arc::clone(&record).reduce();
                if let HostValue::Record(ref same) = reduced {
                    if same_instance(same, &record) {
                        return Ok(reduced);
                    }
                }
                self.walk(reduced, depth + 1)
            }
            primitive => Ok(primitive),
        }
    }

    fn check_at(&self, value: &Value, depth: usize) -> Result<(), DepthExceeded> {
        match value {
            Value::Array(items) => {
                self.enter(depth)?;
                items.iter().try_for_each(|item| self.check_at(item, depth + 1))
            }
            Value::Object(map) => {
                self.enter(depth)?;
                map.values().try_for_each(|item| self.check_at(item, depth + 1))
            }
            _ => Ok(()),
        }
    }

    fn enter(&self, depth: usize) -> Result<(), DepthExceeded> {
        if depth >= self.max_depth {
            Err(DepthExceeded {
                max_depth: self.max_depth,
            })
        } else {
            Ok(())
        }
    }
}

fn same_instance(a: &Arc<dyn Reduce>, b: &Arc<dyn Reduce>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn into_json(value: HostValue) -> Value {
    match value {
        HostValue::Null => Value::Null,
        HostValue::Bool(b) => Value::Bool(b),
        HostValue::Number(n) => Value::Number(n),
        HostValue::String(s) => Value::String(s),
        HostValue::Array(items) => Value::Array(items.into_iter().map(into_json).collect()),
        HostValue::Map(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, into_json(v)))
                .collect::<Map<_, _>>(),
        ),
        HostValue::Record(record) => Value::String(record.describe()),
    }
}
