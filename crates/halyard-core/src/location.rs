//! Resolution of creation-result locators.

use crate::error::Result;
use halyard_wmi::{ObjectPath, Resource, Session};

/// Resolve an object path string returned by a method into a resource.
///
/// Fails with [`Error::MalformedLocator`](crate::Error::MalformedLocator)
/// when the string is not an object path, and with
/// [`Error::NotFound`](crate::Error::NotFound) when the service has no such
/// object. The job that produced the locator must already be complete.
pub async fn resolve_location(session: &Session, locator: &str) -> Result<Resource> {
    let path = ObjectPath::parse(locator)?;
    tracing::trace!(class = path.class(), "Resolving location");
    Ok(session.get_object(&path).await?)
}
