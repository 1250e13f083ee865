//! # halyard-wmi
//!
//! Capability-typed client for the Hyper-V management namespace
//! (`root\virtualization\v2`).
//!
//! The transport itself sits behind the [`Backend`] and [`Connector`]
//! traits. On top of that this crate provides:
//!
//! - **Sessions**: one connection with an explicit open → use → close
//!   lifecycle ([`Session`])
//! - **Resources**: handles to remote objects whose every read goes back to
//!   the service ([`Resource`], [`ResultSet`])
//! - **Typed values**: failable accessors instead of unchecked casts
//!   ([`Value`])
//! - **Queries**: conjunctive equality filters rendered as WQL ([`Query`])
//! - **Object paths**: parsing and rendering of locator strings
//!   ([`ObjectPath`])
//! - **In-memory backend**: a scriptable namespace for tests
//!   ([`memory::MemoryBackend`])

mod backend;
mod error;
pub mod memory;
mod path;
mod query;
mod session;
mod value;

pub use backend::{Backend, Connector, Handle, MethodArgs, OutParams, TextFormat};
pub use error::{Result, WmiError};
pub use path::{KeyValue, ObjectPath};
pub use query::{Filter, Query};
pub use session::{Resource, ResultSet, Session};
pub use value::Value;
