//! Top-level entry point: one session, many machines.

use crate::config::ManagerConfig;
use crate::constants::{MANAGEMENT_SERVICE, VIRTUAL_SYSTEM_SETTING_DATA};
use crate::error::{Error, Result, ResultExt};
use crate::job::JobTracker;
use crate::location::resolve_location;
use crate::machine::VirtualMachine;
use crate::request::CreateVmRequest;
use crate::resolver;
use halyard_wmi::{Connector, MethodArgs, Query, Resource, Session, TextFormat};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

struct ManagerInner {
    session: Session,
    service: Resource,
    jobs: JobTracker,
    config: ManagerConfig,
}

/// Creates, lists, and looks up virtual machines over one session.
///
/// Cloning is cheap; clones share the session. Machines returned by a
/// manager keep a clone of it, and stop working once it is
/// [released](Manager::release).
///
/// Mutating calls are sequential per call (invoke, then await the job).
/// Issuing several from different tasks at once is not coordinated here.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("session", &self.inner.session)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Connect to the management service described by `config`.
    pub async fn connect(connector: &dyn Connector, config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(host = %config.host, namespace = %config.namespace, "Connecting to management service");

        let session = Session::open(connector, &config.host, &config.namespace)
            .await
            .context("opening session")?;

        let services = session
            .query(&Query::select(MANAGEMENT_SERVICE))
            .await
            .context("querying management service")?;
        let service = services
            .into_elements()
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("no {MANAGEMENT_SERVICE} on {}", config.host)))?;

        let jobs = JobTracker::new(session.clone(), config.poll).with_deadline(config.job_timeout);
        Ok(Self {
            inner: Arc::new(ManagerInner {
                session,
                service,
                jobs,
                config,
            }),
        })
    }

    /// Connect, run `f`, and release the session whether or not `f`
    /// succeeded.
    pub async fn scoped<F, Fut, T>(connector: &dyn Connector, config: ManagerConfig, f: F) -> Result<T>
    where
        F: FnOnce(Manager) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let manager = Self::connect(connector, config).await?;
        let result = f(manager.clone()).await;
        manager.release();
        result
    }

    /// Close the session. Every machine derived from this manager fails with
    /// [`Error::SessionClosed`] afterwards.
    ///
    /// Returns `false` if the session was already released.
    pub fn release(&self) -> bool {
        let released = self.inner.session.close();
        if released {
            tracing::info!(host = %self.inner.config.host, "Manager released");
        }
        released
    }

    pub fn is_released(&self) -> bool {
        self.inner.session.is_closed()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub(crate) fn service(&self) -> &Resource {
        &self.inner.service
    }

    pub(crate) fn jobs(&self) -> &JobTracker {
        &self.inner.jobs
    }

    /// Every realized virtual machine, in the order the service lists them.
    pub async fn list_vms(&self) -> Result<Vec<VirtualMachine>> {
        resolver::resolve_all(self).await
    }

    /// The virtual machine with system identifier `id`.
    pub async fn get_vm(&self, id: &str) -> Result<VirtualMachine> {
        resolver::resolve_by_id(self, id).await
    }

    /// Define a new virtual machine and configure its memory and processors.
    ///
    /// The processor count is checked against the host before anything is
    /// sent. Any failure once `DefineSystem` has been accepted, including a
    /// define job that outlives the configured timeout, is
    /// [`Error::PartiallyCreated`]: the machine may exist and is not rolled
    /// back.
    pub async fn create_vm(&self, request: CreateVmRequest) -> Result<VirtualMachine> {
        request.validate()?;
        let available = self.inner.config.available_processors();
        if request.cpus as usize > available {
            return Err(Error::ExceedsHostCapacity {
                resource: "processors",
                requested: request.cpus as usize,
                available,
            });
        }

        let start = Instant::now();
        tracing::info!(
            name = %request.name,
            memory_mb = request.memory_mb,
            cpus = request.cpus,
            generation = %request.generation,
            "Creating virtual machine"
        );

        let template = self
            .session()
            .get_class(VIRTUAL_SYSTEM_SETTING_DATA)
            .await
            .map_err(|e| Error::template_unavailable(VIRTUAL_SYSTEM_SETTING_DATA, e))?;
        let settings = template
            .spawn_instance()
            .await
            .map_err(|e| Error::template_unavailable(VIRTUAL_SYSTEM_SETTING_DATA, e))?;

        settings
            .set("ElementName", request.name.as_str())
            .await
            .context("setting ElementName")?;
        settings
            .set("VirtualSystemSubType", request.generation.sub_type())
            .await
            .context("setting VirtualSystemSubType")?;
        if let Some(notes) = request.joined_notes() {
            settings
                .set("Notes", vec![notes])
                .await
                .context("setting Notes")?;
        }

        let text = settings
            .serialize_text(TextFormat::CimDtd20)
            .await
            .context("serializing system settings")?;
        tracing::trace!(settings = %text, "Defining system");

        let out = self
            .service()
            .invoke("DefineSystem", MethodArgs::new().with("SystemSettings", text))
            .await
            .context("invoking DefineSystem")?;
        if let Err(err) = self.jobs().complete(&out).await.context("awaiting DefineSystem") {
            // A timed-out job keeps running remotely and may still define the machine.
            let pending = match err.root() {
                Error::JobTimeout { job, .. } => Some(format!("defined by job {job}")),
                _ => None,
            };
            return Err(match pending {
                Some(job) => {
                    tracing::error!(job = %job, "DefineSystem timed out, VM may appear later");
                    Error::partially_created(job, err)
                }
                None => err,
            });
        }

        let locator = out
            .get("ResultingSystem")
            .and_then(|v| v.as_str())
            .context("reading ResultingSystem")
            .map_err(|err| Error::partially_created("returned by DefineSystem", err))?;
        let (vm_id, vm) = self
            .fetch_defined(locator)
            .await
            .map_err(|err| {
                tracing::error!(locator = %locator, error = %err, "Defined system could not be fetched");
                Error::partially_created(format!("at {locator}"), err)
            })?;
        tracing::debug!(vm_id = %vm_id, "System defined");

        if let Err(err) = vm.configure(&request).await {
            tracing::error!(vm_id = %vm_id, error = %err, "Configuration failed after definition, VM left in place");
            return Err(Error::partially_created(vm_id, err));
        }

        tracing::info!(
            vm_id = %vm_id,
            name = %request.name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Virtual machine created"
        );
        Ok(vm)
    }

    /// Follow the locator `DefineSystem` returned to the new machine.
    async fn fetch_defined(&self, locator: &str) -> Result<(String, VirtualMachine)> {
        let system = resolve_location(self.session(), locator)
            .await
            .context("resolving created system")?;

        // The computer system's `Name` holds the new system identifier.
        let vm_id = system
            .get("Name")
            .await
            .and_then(|v| v.as_str().map(str::to_string))
            .context("reading new system identifier")?;
        let vm = self.get_vm(&vm_id).await.context("fetching created VM")?;
        Ok((vm_id, vm))
    }
}
