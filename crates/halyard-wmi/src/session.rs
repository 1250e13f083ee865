//! Sessions, resources, and result sets.
//!
//! A [`Session`] wraps one backend connection with an explicit lifecycle
//! (open → use → close). Every [`Resource`] carries a clone of the session it
//! came from, so once the session is closed all of its resources fail with
//! [`WmiError::SessionClosed`] instead of reaching the transport.

use crate::backend::{Backend, Connector, Handle, MethodArgs, OutParams, TextFormat};
use crate::error::{Result, WmiError};
use crate::path::ObjectPath;
use crate::query::Query;
use crate::value::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct SessionInner {
    backend: Arc<dyn Backend>,
    host: String,
    namespace: String,
    closed: AtomicBool,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(host = %self.host, namespace = %self.namespace, "Closing session on drop");
            self.backend.close();
        }
    }
}

/// One logical connection to a management namespace.
///
/// Cloning is cheap and shares the connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.inner.host)
            .field("namespace", &self.inner.namespace)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Connect to `namespace` on `host`.
    pub async fn open(connector: &dyn Connector, host: &str, namespace: &str) -> Result<Self> {
        tracing::debug!(%host, %namespace, "Opening session");
        let backend = connector.connect(host, namespace).await?;
        Ok(Self::from_backend(backend, host, namespace))
    }

    /// Wrap an already-connected backend.
    pub fn from_backend(backend: Arc<dyn Backend>, host: &str, namespace: &str) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                backend,
                host: host.to_string(),
                namespace: namespace.to_string(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Release the connection. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.backend.close();
        tracing::debug!(host = %self.inner.host, namespace = %self.inner.namespace, "Session closed");
        true
    }

    fn backend(&self) -> Result<&dyn Backend> {
        if self.is_closed() {
            return Err(WmiError::SessionClosed);
        }
        Ok(self.inner.backend.as_ref())
    }

    fn resource(&self, handle: Handle) -> Resource {
        Resource {
            session: self.clone(),
            handle,
        }
    }

    fn result_set(&self, handles: Vec<Handle>) -> ResultSet {
        ResultSet {
            items: handles.into_iter().map(|h| self.resource(h)).collect(),
        }
    }

    /// Run a query.
    pub async fn query(&self, query: &Query) -> Result<ResultSet> {
        tracing::trace!(%query, "Running query");
        let handles = self.backend()?.query(query).await?;
        Ok(self.result_set(handles))
    }

    /// Fetch the object named by `path`.
    pub async fn get_object(&self, path: &ObjectPath) -> Result<Resource> {
        let handle = self.backend()?.get_object(path).await?;
        Ok(self.resource(handle))
    }

    /// Fetch a class definition, usable as a template for
    /// [`Resource::spawn_instance`].
    pub async fn get_class(&self, class: &str) -> Result<Resource> {
        let handle = self.backend()?.get_class(class).await?;
        Ok(self.resource(handle))
    }
}

/// Reference to a management object reachable through a session.
///
/// Not a value: every read goes back to the service.
#[derive(Debug, Clone)]
pub struct Resource {
    session: Session,
    handle: Handle,
}

impl Resource {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Read a property.
    pub async fn get(&self, name: &str) -> Result<Value> {
        self.session
            .backend()?
            .get_property(self.handle, name)
            .await
    }

    /// Write a property.
    pub async fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.session
            .backend()?
            .set_property(self.handle, name, value.into())
            .await
    }

    /// Walk to associated objects of `result_class`.
    pub async fn associators(&self, result_class: &str) -> Result<ResultSet> {
        let handles = self
            .session
            .backend()?
            .associators(self.handle, result_class)
            .await?;
        Ok(self.session.result_set(handles))
    }

    /// Invoke a method on this object.
    pub async fn invoke(&self, method: &str, args: MethodArgs) -> Result<OutParams> {
        tracing::trace!(%method, params = args.len(), "Invoking method");
        self.session
            .backend()?
            .invoke(self.handle, method, args)
            .await
    }

    /// Serialize to embedded-instance text.
    pub async fn serialize_text(&self, format: TextFormat) -> Result<String> {
        self.session
            .backend()?
            .object_text(self.handle, format)
            .await
    }

    /// Object path of this (saved) instance.
    pub async fn path(&self) -> Result<ObjectPath> {
        self.session.backend()?.object_path(self.handle).await
    }

    /// Spawn an unsaved instance, treating this resource as a class template.
    pub async fn spawn_instance(&self) -> Result<Resource> {
        let handle = self
            .session
            .backend()?
            .spawn_instance(self.handle)
            .await?;
        Ok(self.session.resource(handle))
    }
}

/// Ordered results of a query or associator walk.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    items: Vec<Resource>,
}

impl ResultSet {
    pub fn elements(&self) -> &[Resource] {
        &self.items
    }

    pub fn into_elements(self) -> Vec<Resource> {
        self.items
    }

    pub fn item_at_index(&self, index: usize) -> Result<&Resource> {
        self.items.get(index).ok_or(WmiError::IndexOutOfRange {
            index,
            len: self.items.len(),
        })
    }

    pub fn first(&self) -> Option<&Resource> {
        self.items.first()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Resource> {
        self.items.iter()
    }
}

impl IntoIterator for ResultSet {
    type Item = Resource;
    type IntoIter = std::vec::IntoIter<Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a Resource;
    type IntoIter = std::slice::Iter<'a, Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
