//! In-memory management namespace.
//!
//! [`MemoryBackend`] implements [`Backend`] and [`Connector`] over a plain
//! object store. It is what the test suites run against, and it is useful
//! for exercising orchestration code on hosts without a virtualization
//! service.
//!
//! Methods are emulated by registering handlers with
//! [`MemoryBackend::on_method`]. A handler receives the whole [`Namespace`]
//! mutably, so it can create instances, associations, and jobs the way the
//! real service would.
//!
//! Every query, fetch, or associator walk hands out fresh handles. Writes
//! through a handle to a saved instance only change that handle's local
//! copy, as with the real service: the stored object changes when a method
//! handler commits the new values through the [`Namespace`] API.
//!
//! ```
//! use halyard_wmi::memory::MemoryBackend;
//! use halyard_wmi::{Query, Session, Value};
//!
//! # tokio_test::block_on(async {
//! let backend = MemoryBackend::new();
//! backend.insert("Msvm_ComputerSystem", ("Name", "VM-1"), [("ElementName", Value::from("web"))]);
//!
//! let session = Session::open(&backend, ".", r"root\virtualization\v2").await.unwrap();
//! let systems = session.query(&Query::select("Msvm_ComputerSystem")).await.unwrap();
//! let name = systems.item_at_index(0).unwrap().get("ElementName").await.unwrap();
//! assert_eq!(name.as_str().unwrap(), "web");
//! # });
//! ```

use crate::backend::{Backend, Connector, Handle, MethodArgs, OutParams, TextFormat};
use crate::error::{Result, WmiError};
use crate::path::{KeyValue, ObjectPath};
use crate::query::Query;
use crate::value::Value;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Server name stamped on paths of objects the backend creates.
pub const MEMORY_SERVER: &str = "MEMORY";

/// Namespace stamped on paths of objects the backend creates.
pub const MEMORY_NAMESPACE: &str = r"root\virtualization\v2";

/// Class of the job objects created by [`Namespace::add_job`].
pub const JOB_CLASS: &str = "Msvm_ConcreteJob";

/// Embedded-instance text produced by [`Backend::object_text`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceText {
    pub class: String,
    pub properties: Vec<(String, Value)>,
}

impl InstanceText {
    /// Parse text previously produced by the backend.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

/// A method call as seen by a handler.
#[derive(Debug, Clone)]
pub struct MethodCall {
    /// Path of the target object, if it is saved
    pub target: Option<ObjectPath>,
    /// Class of the target object
    pub class: String,
    pub method: String,
    pub args: MethodArgs,
}

type MethodHandler = dyn Fn(&mut Namespace, &MethodCall) -> Result<OutParams> + Send + Sync;

fn lookup<'a>(properties: &'a [(String, Value)], name: &str) -> Option<&'a Value> {
    properties
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

fn assign(properties: &mut Vec<(String, Value)>, name: &str, value: Value) {
    match properties
        .iter_mut()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
    {
        Some((_, slot)) => *slot = value,
        None => properties.push((name.to_string(), value)),
    }
}

#[derive(Debug)]
struct Object {
    class: String,
    is_class: bool,
    path: Option<ObjectPath>,
    properties: Vec<(String, Value)>,
    scripted: HashMap<String, VecDeque<Value>>,
}

impl Object {
    fn property(&self, name: &str) -> Option<&Value> {
        lookup(&self.properties, name)
    }

    fn set(&mut self, name: &str, value: Value) {
        assign(&mut self.properties, name, value);
    }

    fn is_saved_instance(&self) -> bool {
        !self.is_class && self.path.is_some()
    }

    fn matches(&self, query: &Query) -> bool {
        self.is_saved_instance()
            && self.class.eq_ignore_ascii_case(query.class())
            && query.filters().iter().all(|f| {
                match (self.property(&f.field), &f.value) {
                    (Some(Value::String(a)), Value::String(b)) => a.eq_ignore_ascii_case(b),
                    (Some(a), b) => a == b,
                    (None, _) => false,
                }
            })
    }
}

/// One handed-out handle: the object it refers to plus uncommitted writes.
#[derive(Debug)]
struct View {
    object: u64,
    pending: Vec<(String, Value)>,
}

/// Mutable contents of a [`MemoryBackend`].
#[derive(Default)]
pub struct Namespace {
    objects: HashMap<u64, Object>,
    views: HashMap<u64, View>,
    order: Vec<u64>,
    classes: HashMap<String, u64>,
    associations: Vec<(u64, u64)>,
    methods: HashMap<String, Arc<MethodHandler>>,
    invocations: Vec<MethodCall>,
    reads: HashMap<(u64, String), usize>,
    next_object: u64,
    next_handle: u64,
    query_failure: Option<String>,
    refuse_connections: bool,
    connects: usize,
    closes: usize,
}

impl Namespace {
    fn allocate(&mut self, object: Object) -> u64 {
        self.next_object += 1;
        let id = self.next_object;
        self.objects.insert(id, object);
        self.order.push(id);
        id
    }

    fn open(&mut self, object: u64) -> Handle {
        self.next_handle += 1;
        self.views.insert(
            self.next_handle,
            View {
                object,
                pending: Vec::new(),
            },
        );
        Handle::new(self.next_handle)
    }

    fn view(&self, handle: Handle) -> Result<&View> {
        self.views
            .get(&handle.raw())
            .ok_or(WmiError::StaleHandle(handle.raw()))
    }

    /// Id of the live object behind `handle`.
    fn object_id(&self, handle: Handle) -> Result<u64> {
        let id = self.view(handle)?.object;
        if self.objects.contains_key(&id) {
            Ok(id)
        } else {
            Err(WmiError::StaleHandle(handle.raw()))
        }
    }

    fn object(&self, handle: Handle) -> Result<&Object> {
        let id = self.object_id(handle)?;
        Ok(&self.objects[&id])
    }

    fn find(&self, path: &ObjectPath) -> Option<u64> {
        self.order.iter().copied().find(|id| {
            self.objects[id]
                .path
                .as_ref()
                .is_some_and(|p| p.same_object(path))
        })
    }

    fn find_or_err(&self, path: &ObjectPath) -> Result<u64> {
        self.find(path)
            .ok_or_else(|| WmiError::ObjectNotFound(path.to_string()))
    }

    /// Register a class whose spawned instances start with `defaults`.
    pub fn define_class<I, K>(&mut self, class: &str, defaults: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let object = Object {
            class: class.to_string(),
            is_class: true,
            path: Some(ObjectPath::new(class).with_namespace(MEMORY_SERVER, MEMORY_NAMESPACE)),
            properties: defaults.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            scripted: HashMap::new(),
        };
        let id = self.allocate(object);
        self.classes.insert(class.to_ascii_lowercase(), id);
    }

    /// Store a saved instance keyed by `key` and return its path.
    pub fn insert<I, K>(&mut self, class: &str, key: (&str, &str), properties: I) -> ObjectPath
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let path = ObjectPath::new(class)
            .with_namespace(MEMORY_SERVER, MEMORY_NAMESPACE)
            .with_key(key.0, key.1);
        let mut object = Object {
            class: class.to_string(),
            is_class: false,
            path: Some(path.clone()),
            properties: Vec::new(),
            scripted: HashMap::new(),
        };
        object.set(key.0, Value::from(key.1));
        for (name, value) in properties {
            let name: String = name.into();
            object.set(&name, value);
        }
        self.allocate(object);
        path
    }

    /// Store a singleton instance (`Class=@`) and return its path.
    pub fn insert_singleton<I, K>(&mut self, class: &str, properties: I) -> ObjectPath
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let path = ObjectPath::new(class)
            .with_namespace(MEMORY_SERVER, MEMORY_NAMESPACE)
            .singleton();
        let object = Object {
            class: class.to_string(),
            is_class: false,
            path: Some(path.clone()),
            properties: properties.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            scripted: HashMap::new(),
        };
        self.allocate(object);
        path
    }

    /// Remove a saved instance and its associations.
    pub fn remove(&mut self, path: &ObjectPath) -> Result<()> {
        let id = self.find_or_err(path)?;
        self.objects.remove(&id);
        self.order.retain(|o| *o != id);
        self.associations.retain(|(a, b)| *a != id && *b != id);
        Ok(())
    }

    /// Associate two saved instances (the relation is symmetric).
    pub fn associate(&mut self, a: &ObjectPath, b: &ObjectPath) -> Result<()> {
        let a = self.find_or_err(a)?;
        let b = self.find_or_err(b)?;
        self.associations.push((a, b));
        Ok(())
    }

    /// Paths of instances of `class` associated with `path`.
    pub fn associated(&self, path: &ObjectPath, class: &str) -> Vec<ObjectPath> {
        let Some(id) = self.find(path) else {
            return Vec::new();
        };
        self.associated_ids(id, class)
            .into_iter()
            .filter_map(|other| self.objects[&other].path.clone())
            .collect()
    }

    fn associated_ids(&self, id: u64, class: &str) -> Vec<u64> {
        self.associations
            .iter()
            .filter_map(|&(a, b)| match (a == id, b == id) {
                (true, _) => Some(b),
                (_, true) => Some(a),
                _ => None,
            })
            .filter(|other| {
                self.objects
                    .get(other)
                    .is_some_and(|o| o.class.eq_ignore_ascii_case(class))
            })
            .collect()
    }

    /// Paths of saved instances of `class`, in insertion order.
    pub fn instances(&self, class: &str) -> Vec<ObjectPath> {
        self.order
            .iter()
            .filter_map(|id| {
                let o = &self.objects[id];
                (!o.is_class && o.class.eq_ignore_ascii_case(class))
                    .then(|| o.path.clone())
                    .flatten()
            })
            .collect()
    }

    pub fn property(&self, path: &ObjectPath, name: &str) -> Option<Value> {
        let id = self.find(path)?;
        self.objects[&id].property(name).cloned()
    }

    pub fn set_property(&mut self, path: &ObjectPath, name: &str, value: impl Into<Value>) -> Result<()> {
        let id = self.find_or_err(path)?;
        if let Some(o) = self.objects.get_mut(&id) {
            o.set(name, value.into());
        }
        Ok(())
    }

    /// Make successive reads of `name` return `values` in turn. The last
    /// value sticks once the script runs out.
    pub fn script_property(&mut self, path: &ObjectPath, name: &str, values: Vec<Value>) -> Result<()> {
        let id = self.find_or_err(path)?;
        if let Some(o) = self.objects.get_mut(&id) {
            if let Some(last) = values.last() {
                o.set(name, last.clone());
            }
            o.scripted
                .insert(name.to_ascii_lowercase(), values.into_iter().collect());
        }
        Ok(())
    }

    /// Create a job whose `JobState` reads walk through `states`.
    pub fn add_job(&mut self, states: impl IntoIterator<Item = u16>) -> ObjectPath {
        let id = uuid::Uuid::new_v4().to_string();
        let path = self.insert(
            JOB_CLASS,
            ("InstanceID", id.as_str()),
            [("ErrorCode", Value::UInt16(0)), ("ErrorDescription", Value::Null)],
        );
        let states = states.into_iter().map(Value::UInt16).collect();
        // The path was just inserted, so scripting cannot miss.
        let _ = self.script_property(&path, "JobState", states);
        path
    }

    /// Number of times `name` was read on the object at `path`.
    pub fn reads(&self, path: &ObjectPath, name: &str) -> usize {
        self.find(path)
            .and_then(|id| self.reads.get(&(id, name.to_ascii_lowercase())))
            .copied()
            .unwrap_or(0)
    }

    /// Calls made to `method`, oldest first.
    pub fn invocations(&self, method: &str) -> Vec<MethodCall> {
        self.invocations
            .iter()
            .filter(|c| c.method.eq_ignore_ascii_case(method))
            .cloned()
            .collect()
    }
}

/// Shared handle to an in-memory namespace.
///
/// Clones share state, so a test can keep one clone for setup and
/// inspection while a session owns another.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<Namespace>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Namespace> {
        // A panicking handler poisons the lock; the store itself stays usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` with mutable access to the namespace.
    pub fn with_namespace<R>(&self, f: impl FnOnce(&mut Namespace) -> R) -> R {
        f(&mut *self.lock())
    }

    /// Register a class whose spawned instances start with `defaults`.
    pub fn define_class<I, K>(&self, class: &str, defaults: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.lock().define_class(class, defaults)
    }

    /// Store a saved instance keyed by `key` and return its path.
    pub fn insert<I, K>(&self, class: &str, key: (&str, &str), properties: I) -> ObjectPath
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.lock().insert(class, key, properties)
    }

    /// Associate two saved instances.
    pub fn associate(&self, a: &ObjectPath, b: &ObjectPath) -> Result<()> {
        self.lock().associate(a, b)
    }

    /// Emulate `method` on every object that receives it.
    pub fn on_method<F>(&self, method: &str, handler: F)
    where
        F: Fn(&mut Namespace, &MethodCall) -> Result<OutParams> + Send + Sync + 'static,
    {
        self.lock()
            .methods
            .insert(method.to_ascii_lowercase(), Arc::new(handler));
    }

    pub fn property(&self, path: &ObjectPath, name: &str) -> Option<Value> {
        self.lock().property(path, name)
    }

    /// Number of times `name` was read on the object at `path`.
    pub fn reads(&self, path: &ObjectPath, name: &str) -> usize {
        self.lock().reads(path, name)
    }

    /// Calls made to `method`, oldest first.
    pub fn invocations(&self, method: &str) -> Vec<MethodCall> {
        self.lock().invocations(method)
    }

    /// Make every query fail with `message` (or stop failing with `None`).
    pub fn fail_queries(&self, message: Option<&str>) {
        self.lock().query_failure = message.map(str::to_string);
    }

    /// Make [`Connector::connect`] fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Number of successful connects.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Number of times [`Backend::close`] was called.
    pub fn closes(&self) -> usize {
        self.lock().closes
    }
}

#[async_trait]
impl Connector for MemoryBackend {
    async fn connect(&self, host: &str, namespace: &str) -> Result<Arc<dyn Backend>> {
        let mut ns = self.lock();
        if ns.refuse_connections {
            return Err(WmiError::Connection {
                host: host.to_string(),
                namespace: namespace.to_string(),
                message: "connection refused".into(),
            });
        }
        ns.connects += 1;
        drop(ns);
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn query(&self, query: &Query) -> Result<Vec<Handle>> {
        let mut ns = self.lock();
        if let Some(message) = &ns.query_failure {
            return Err(WmiError::Query {
                query: query.to_string(),
                message: message.clone(),
            });
        }
        let ids: Vec<u64> = ns
            .order
            .iter()
            .copied()
            .filter(|id| ns.objects[id].matches(query))
            .collect();
        Ok(ids.into_iter().map(|id| ns.open(id)).collect())
    }

    async fn get_object(&self, path: &ObjectPath) -> Result<Handle> {
        if path.is_class() {
            return self.get_class(path.class()).await;
        }
        let mut ns = self.lock();
        let id = ns.find_or_err(path)?;
        Ok(ns.open(id))
    }

    async fn get_class(&self, class: &str) -> Result<Handle> {
        let mut ns = self.lock();
        let id = *ns
            .classes
            .get(&class.to_ascii_lowercase())
            .ok_or_else(|| WmiError::ClassNotFound(class.to_string()))?;
        Ok(ns.open(id))
    }

    async fn spawn_instance(&self, class: Handle) -> Result<Handle> {
        let mut ns = self.lock();
        let template = ns.object(class)?;
        if !template.is_class {
            return Err(WmiError::Invoke {
                method: "SpawnInstance_".into(),
                message: format!("{} is not a class", template.class),
            });
        }
        let object = Object {
            class: template.class.clone(),
            is_class: false,
            path: None,
            properties: template.properties.clone(),
            scripted: HashMap::new(),
        };
        let id = ns.allocate(object);
        Ok(ns.open(id))
    }

    async fn get_property(&self, handle: Handle, name: &str) -> Result<Value> {
        let mut ns = self.lock();
        let id = ns.object_id(handle)?;
        *ns.reads
            .entry((id, name.to_ascii_lowercase()))
            .or_default() += 1;

        if let Some(value) = lookup(&ns.view(handle)?.pending, name) {
            return Ok(value.clone());
        }
        let object = ns
            .objects
            .get_mut(&id)
            .ok_or(WmiError::StaleHandle(handle.raw()))?;
        if name.eq_ignore_ascii_case("__PATH") {
            return object
                .path
                .as_ref()
                .map(|p| Value::String(p.to_string()))
                .ok_or_else(|| WmiError::PropertyNotFound(name.to_string()));
        }
        if name.eq_ignore_ascii_case("__CLASS") {
            return Ok(Value::String(object.class.clone()));
        }

        if let Some(script) = object.scripted.get_mut(&name.to_ascii_lowercase()) {
            let next = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            };
            if let Some(value) = next {
                object.set(name, value.clone());
                return Ok(value);
            }
        }

        object
            .property(name)
            .cloned()
            .ok_or_else(|| WmiError::PropertyNotFound(name.to_string()))
    }

    async fn set_property(&self, handle: Handle, name: &str, value: Value) -> Result<()> {
        let mut ns = self.lock();
        let id = ns.object_id(handle)?;
        let stale = WmiError::StaleHandle(handle.raw());
        if ns.objects[&id].is_saved_instance() {
            let view = ns.views.get_mut(&handle.raw()).ok_or(stale)?;
            assign(&mut view.pending, name, value);
        } else {
            // Spawned instances and classes have no stored copy to keep apart.
            let object = ns.objects.get_mut(&id).ok_or(stale)?;
            object.scripted.remove(&name.to_ascii_lowercase());
            object.set(name, value);
        }
        Ok(())
    }

    async fn associators(&self, handle: Handle, result_class: &str) -> Result<Vec<Handle>> {
        let mut ns = self.lock();
        let id = ns.object_id(handle)?;
        let ids = ns.associated_ids(id, result_class);
        Ok(ids.into_iter().map(|other| ns.open(other)).collect())
    }

    async fn invoke(&self, handle: Handle, method: &str, args: MethodArgs) -> Result<OutParams> {
        let mut ns = self.lock();
        let object = ns.object(handle)?;
        let call = MethodCall {
            target: object.path.clone(),
            class: object.class.clone(),
            method: method.to_string(),
            args,
        };
        ns.invocations.push(call.clone());

        let handler = ns
            .methods
            .get(&method.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| WmiError::Invoke {
                method: method.to_string(),
                message: format!("method not supported by {}", call.class),
            })?;
        handler(&mut *ns, &call)
    }

    async fn object_text(&self, handle: Handle, _format: TextFormat) -> Result<String> {
        let ns = self.lock();
        let object = ns.object(handle)?;
        let mut properties = object.properties.clone();
        for (name, value) in &ns.view(handle)?.pending {
            assign(&mut properties, name, value.clone());
        }
        let text = InstanceText {
            class: object.class.clone(),
            properties,
        };
        Ok(serde_json::to_string(&text)?)
    }

    async fn object_path(&self, handle: Handle) -> Result<ObjectPath> {
        let ns = self.lock();
        let object = ns.object(handle)?;
        object
            .path
            .clone()
            .ok_or_else(|| WmiError::ObjectNotFound(format!("unsaved {} instance", object.class)))
    }

    fn close(&self) {
        self.lock().closes += 1;
    }
}

/// Convenience for handlers: key value of `name` in `path` as a string.
pub fn key_string(path: &ObjectPath, name: &str) -> Option<String> {
    match path.key(name)? {
        KeyValue::String(s) => Some(s.clone()),
        KeyValue::Integer(i) => Some(i.to_string()),
    }
}
