//! Transport seam: the primitives a management backend must provide.
//!
//! Everything above this module talks to [`Session`](crate::Session) and
//! [`Resource`](crate::Resource); backends only deal in opaque [`Handle`]s.

use crate::error::{Result, WmiError};
use crate::path::ObjectPath;
use crate::query::Query;
use crate::value::Value;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Opaque backend-owned reference to a management object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Text encoding requested when serializing an instance for a method call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextFormat {
    /// CIM DTD 2.0 (the format the virtualization service accepts)
    #[default]
    CimDtd20,
    /// WMI DTD 2.0
    WmiDtd20,
}

impl TextFormat {
    /// Numeric format code used on the wire.
    pub fn code(&self) -> u32 {
        match self {
            TextFormat::CimDtd20 => 1,
            TextFormat::WmiDtd20 => 2,
        }
    }
}

/// Named in-parameters for a method invocation, in call order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodArgs {
    params: Vec<(String, Value)>,
}

impl MethodArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Out-parameters returned by a method invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutParams {
    values: HashMap<String, Value>,
}

impl OutParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an out-parameter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Fetch an out-parameter that must be present.
    pub fn get(&self, name: &str) -> Result<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| WmiError::MissingOutParam(name.to_string()))
    }

    /// Fetch an out-parameter that may be absent or null.
    pub fn get_opt(&self, name: &str) -> Option<&Value> {
        self.values.get(name).filter(|v| !v.is_null())
    }

    /// The method's `ReturnValue`.
    pub fn return_value(&self) -> Result<u32> {
        self.get("ReturnValue")?.as_u32()
    }
}

/// A live connection to a management namespace.
///
/// Implementations own handle allocation. A handle obtained from one backend
/// is never valid on another.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run a query, returning matches in the order the service produced them.
    async fn query(&self, query: &Query) -> Result<Vec<Handle>>;

    /// Fetch the object an object path names.
    async fn get_object(&self, path: &ObjectPath) -> Result<Handle>;

    /// Fetch a class definition.
    async fn get_class(&self, class: &str) -> Result<Handle>;

    /// Create an unsaved instance from a class definition.
    async fn spawn_instance(&self, class: Handle) -> Result<Handle>;

    async fn get_property(&self, handle: Handle, name: &str) -> Result<Value>;

    /// Write to the local copy behind `handle`. Saved objects only change
    /// once a method such as `ModifyResourceSettings` applies the copy.
    async fn set_property(&self, handle: Handle, name: &str, value: Value) -> Result<()>;

    /// Objects of `result_class` associated with `handle`.
    async fn associators(&self, handle: Handle, result_class: &str) -> Result<Vec<Handle>>;

    async fn invoke(&self, handle: Handle, method: &str, args: MethodArgs) -> Result<OutParams>;

    /// Serialize an instance to embedded-instance text.
    async fn object_text(&self, handle: Handle, format: TextFormat) -> Result<String>;

    /// Object path of a saved instance.
    async fn object_path(&self, handle: Handle) -> Result<ObjectPath>;

    /// Release the underlying connection. Must be idempotent.
    fn close(&self);
}

/// Opens backends.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, namespace: &str) -> Result<Arc<dyn Backend>>;
}
