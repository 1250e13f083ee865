//! # halyard-core
//!
//! Virtual machine orchestration over the Hyper-V management service.
//!
//! Every mutating call on the service is asynchronous: it returns a job that
//! has to be polled to a terminal state before its result can be trusted.
//! Every object it hands back is a reference that has to be resolved
//! through further queries before it is usable. This crate wraps both
//! disciplines behind a small API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      halyard-core                        │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │    Manager      │────▶│  resolver                │    │
//! │  │  - create_vm()  │     │  settings data ─assoc─▶  │    │
//! │  │  - get_vm()     │     │  computer system         │    │
//! │  │  - list_vms()   │     └──────────────────────────┘    │
//! │  └─────────────────┘                                     │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ VirtualMachine  │────▶│  JobTracker              │    │
//! │  │  - set_memory() │     │  poll with backoff until │    │
//! │  │  - attach_...() │     │  a terminal JobState     │    │
//! │  └─────────────────┘     └──────────────────────────┘    │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                     halyard-wmi                          │
//! │      Session · Resource · Query · ObjectPath · Value     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use halyard_core::{CreateVmRequest, Generation, Manager, ManagerConfig};
//!
//! # async fn example(connector: &dyn halyard_wmi::Connector) -> halyard_core::Result<()> {
//! let manager = Manager::connect(connector, ManagerConfig::from_env()).await?;
//!
//! let vm = manager
//!     .create_vm(
//!         CreateVmRequest::new("build-agent")
//!             .memory_mb(4096)
//!             .cpus(4)
//!             .note("owner: ci")
//!             .generation(Generation::Two),
//!     )
//!     .await?;
//! println!("created {} ({})", vm.name().await?, vm.id().await?);
//!
//! vm.attach_disks(&[r"D:\disks\build-agent.vhdx"]).await?;
//! vm.start().await?;
//!
//! manager.release();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
mod error;
mod job;
mod location;
mod machine;
mod manager;
mod request;
pub mod resolver;

pub use config::{ManagerConfig, ManagerConfigBuilder, PollConfig};
pub use error::{Error, JobFailure, Result, ResultExt};
pub use job::{JobState, JobTracker};
pub use location::resolve_location;
pub use machine::{BootDevice, VirtualMachine, VmState};
pub use manager::Manager;
pub use request::{CreateVmRequest, Generation};
