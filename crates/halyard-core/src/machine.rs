//! The virtual machine entity and its operations.
//!
//! Every mutator follows the same protocol: fetch the settings object to
//! change, update it locally, serialize it, hand the text to a management
//! service method, and await the job that method starts.

use crate::constants::{
    MEMORY_SETTING_DATA, PROCESSOR_SETTING_DATA, RESOURCE_ALLOCATION_SETTING_DATA,
    RESOURCE_TYPE_DISK_DRIVE, RESOURCE_TYPE_LOGICAL_DISK, SCSI_CONTROLLER_SLOTS,
    STORAGE_ALLOCATION_SETTING_DATA, SUBTYPE_DISK_DRIVE, SUBTYPE_SCSI_CONTROLLER,
    SUBTYPE_VIRTUAL_HARD_DISK,
};
use crate::error::{Error, Result, ResultExt};
use crate::manager::Manager;
use crate::request::{CreateVmRequest, Generation};
use halyard_wmi::{MethodArgs, Resource, TextFormat, Value};
use std::collections::BTreeSet;
use std::fmt;

/// `EnabledState` of a computer system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmState {
    Running,
    Off,
    ShuttingDown,
    Reboot,
    Paused,
    Saved,
    Other(u16),
}

impl VmState {
    pub fn code(&self) -> u16 {
        match self {
            VmState::Running => 2,
            VmState::Off => 3,
            VmState::ShuttingDown => 4,
            VmState::Reboot => 10,
            VmState::Paused => 32768,
            VmState::Saved => 32769,
            VmState::Other(code) => *code,
        }
    }
}

impl From<u16> for VmState {
    fn from(code: u16) -> Self {
        match code {
            2 => VmState::Running,
            3 => VmState::Off,
            4 => VmState::ShuttingDown,
            10 => VmState::Reboot,
            32768 => VmState::Paused,
            32769 => VmState::Saved,
            other => VmState::Other(other),
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Running => write!(f, "Running"),
            VmState::Off => write!(f, "Off"),
            VmState::ShuttingDown => write!(f, "ShuttingDown"),
            VmState::Reboot => write!(f, "Reboot"),
            VmState::Paused => write!(f, "Paused"),
            VmState::Saved => write!(f, "Saved"),
            VmState::Other(code) => write!(f, "Other({code})"),
        }
    }
}

/// BIOS boot device class (generation 1 machines).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootDevice {
    Floppy,
    CdRom,
    HardDrive,
    Network,
}

impl BootDevice {
    pub fn code(&self) -> u16 {
        match self {
            BootDevice::Floppy => 0,
            BootDevice::CdRom => 1,
            BootDevice::HardDrive => 2,
            BootDevice::Network => 3,
        }
    }
}

/// A resolved virtual machine: its realized settings data paired with its
/// computer system.
///
/// This is a view, not a snapshot. Every accessor goes back to the service,
/// and every call fails with [`Error::SessionClosed`] once the owning
/// [`Manager`] is released.
#[derive(Debug, Clone)]
pub struct VirtualMachine {
    manager: Manager,
    settings: Resource,
    system: Resource,
}

impl VirtualMachine {
    pub(crate) fn new(manager: Manager, settings: Resource, system: Resource) -> Self {
        Self {
            manager,
            settings,
            system,
        }
    }

    /// The realized `Msvm_VirtualSystemSettingData`.
    pub fn settings(&self) -> &Resource {
        &self.settings
    }

    /// The `Msvm_ComputerSystem`.
    pub fn system(&self) -> &Resource {
        &self.system
    }

    /// Display name (`ElementName` of the computer system).
    pub async fn name(&self) -> Result<String> {
        self.system
            .get("ElementName")
            .await
            .and_then(|v| v.as_str().map(str::to_string))
            .context("getting ElementName")
    }

    /// System identifier (`VirtualSystemIdentifier` of the settings data).
    pub async fn id(&self) -> Result<String> {
        self.settings
            .get("VirtualSystemIdentifier")
            .await
            .and_then(|v| v.as_str().map(str::to_string))
            .context("getting VirtualSystemIdentifier")
    }

    /// Notes split back into lines. Empty when none were set.
    pub async fn notes(&self) -> Result<Vec<String>> {
        let value = self.settings.get("Notes").await.context("getting Notes")?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        let blocks = value.as_string_array().context("getting Notes")?;
        Ok(blocks
            .iter()
            .filter(|block| !block.is_empty())
            .flat_map(|block| block.split('\n').map(str::to_string))
            .collect())
    }

    pub async fn generation(&self) -> Result<Generation> {
        let sub_type = self
            .settings
            .get("VirtualSystemSubType")
            .await
            .and_then(|v| v.as_str().map(str::to_string))
            .context("getting VirtualSystemSubType")?;
        Generation::from_sub_type(&sub_type).ok_or_else(|| {
            Error::InconsistentResource(format!("unknown VirtualSystemSubType {sub_type:?}"))
        })
    }

    pub async fn state(&self) -> Result<VmState> {
        self.system
            .get("EnabledState")
            .await
            .and_then(|v| v.as_u16())
            .map(VmState::from)
            .context("getting EnabledState")
    }

    /// Set startup memory. Reservation and limit follow the same value, so
    /// the allocation is static.
    pub async fn set_memory(&self, memory_mb: u64) -> Result<()> {
        if memory_mb == 0 {
            return Err(Error::InvalidRequest("memory_mb must be > 0".into()));
        }
        tracing::debug!(vm = %self.system.handle(), memory_mb, "Setting memory");

        let memory = self.component(MEMORY_SETTING_DATA).await?;
        for field in ["VirtualQuantity", "Reservation", "Limit"] {
            memory
                .set(field, memory_mb)
                .await
                .with_context(|| format!("setting {field}"))?;
        }
        self.modify_resource_settings(&[memory])
            .await
            .context("setting memory")
    }

    /// Set the virtual processor count.
    ///
    /// Rejected with [`Error::ExceedsHostCapacity`] when it is more than the
    /// host's logical processors. That check is local only; the service may
    /// enforce a lower limit of its own.
    pub async fn set_num_cpus(&self, cpus: u32) -> Result<()> {
        self.modify_processors(Some(cpus), None).await
    }

    /// Toggle processor compatibility mode.
    pub async fn set_processor_features_limited(&self, limited: bool) -> Result<()> {
        self.modify_processors(None, Some(limited)).await
    }

    /// Apply the sizing of a creation request.
    pub(crate) async fn configure(&self, request: &CreateVmRequest) -> Result<()> {
        self.set_memory(request.memory_mb)
            .await
            .context("setting memory limit")?;
        self.modify_processors(Some(request.cpus), Some(request.limit_cpu_features))
            .await
            .context("setting CPU limit")
    }

    async fn modify_processors(&self, cpus: Option<u32>, limited: Option<bool>) -> Result<()> {
        if let Some(cpus) = cpus {
            if cpus == 0 {
                return Err(Error::InvalidRequest("cpus must be > 0".into()));
            }
            let available = self.manager.config().available_processors();
            if cpus as usize > available {
                return Err(Error::ExceedsHostCapacity {
                    resource: "processors",
                    requested: cpus as usize,
                    available,
                });
            }
        }
        tracing::debug!(vm = %self.system.handle(), ?cpus, ?limited, "Setting processors");

        let processor = self.component(PROCESSOR_SETTING_DATA).await?;
        if let Some(cpus) = cpus {
            processor
                .set("VirtualQuantity", u64::from(cpus))
                .await
                .context("setting VirtualQuantity")?;
        }
        if let Some(limited) = limited {
            processor
                .set("LimitProcessorFeatures", limited)
                .await
                .context("setting LimitProcessorFeatures")?;
        }
        self.modify_resource_settings(&[processor])
            .await
            .context("setting processors")
    }

    /// Set the BIOS boot order.
    ///
    /// Only generation 1 machines boot by device class. Generation 2
    /// firmware orders concrete boot entries, which this call cannot express,
    /// so it fails with [`Error::NotImplemented`].
    pub async fn set_boot_order(&self, order: &[BootDevice]) -> Result<()> {
        if order.is_empty() {
            return Err(Error::InvalidRequest("boot order is empty".into()));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = order.iter().find(|d| !seen.insert(d.code())) {
            return Err(Error::InvalidRequest(format!("{dup:?} appears twice in boot order")));
        }

        let generation = self.generation().await?;
        if generation != Generation::One {
            return Err(Error::NotImplemented(format!(
                "boot order by device class on generation {generation} machines"
            )));
        }

        let codes: Vec<u16> = order.iter().map(BootDevice::code).collect();
        tracing::debug!(vm = %self.system.handle(), ?order, "Setting boot order");
        self.settings
            .set("BootOrder", codes)
            .await
            .context("setting BootOrder")?;
        self.modify_system_settings().await.context("setting boot order")
    }

    /// Attach existing virtual hard disk files, one per free slot on the
    /// first SCSI controller.
    ///
    /// Fails with [`Error::NotFound`] when the machine has no SCSI
    /// controller, and with [`Error::ExceedsHostCapacity`] before any change
    /// when there are fewer free slots than disks.
    pub async fn attach_disks(&self, disks: &[&str]) -> Result<()> {
        if disks.is_empty() {
            return Ok(());
        }
        if let Some(bad) = disks.iter().find(|d| d.trim().is_empty()) {
            return Err(Error::InvalidRequest(format!("invalid disk path {bad:?}")));
        }

        let devices = self
            .settings
            .associators(RESOURCE_ALLOCATION_SETTING_DATA)
            .await
            .context("listing devices")?;

        let mut controller = None;
        for device in &devices {
            if sub_type(device).await?.as_deref() == Some(SUBTYPE_SCSI_CONTROLLER) {
                controller = Some(device.clone());
                break;
            }
        }
        let controller = controller
            .ok_or_else(|| Error::NotFound("virtual machine has no SCSI controller".into()))?;
        let controller_path = controller
            .path()
            .await
            .context("getting controller path")?
            .to_string();

        let mut used = BTreeSet::new();
        for device in &devices {
            if sub_type(device).await?.as_deref() != Some(SUBTYPE_DISK_DRIVE) {
                continue;
            }
            let parent = device.get("Parent").await.context("getting Parent")?;
            if parent.is_null() || parent.as_str().context("reading Parent")? != controller_path {
                continue;
            }
            let address = device
                .get("AddressOnParent")
                .await
                .context("getting AddressOnParent")?;
            if address.is_null() {
                continue;
            }
            let address = address.as_str().context("reading AddressOnParent")?;
            if let Ok(slot) = address.parse::<u32>() {
                used.insert(slot);
            }
        }

        let free: Vec<u32> = (0..SCSI_CONTROLLER_SLOTS)
            .filter(|slot| !used.contains(slot))
            .collect();
        if disks.len() > free.len() {
            return Err(Error::ExceedsHostCapacity {
                resource: "SCSI controller slots",
                requested: disks.len(),
                available: free.len(),
            });
        }

        let controller_path = controller_path.as_str();
        for (disk, slot) in disks.iter().zip(free) {
            tracing::debug!(vm = %self.system.handle(), disk = %disk, slot, "Attaching disk");
            let drive = self
                .add_resource(RESOURCE_ALLOCATION_SETTING_DATA, |drive| async move {
                    drive.set("ResourceType", RESOURCE_TYPE_DISK_DRIVE).await?;
                    drive.set("ResourceSubType", SUBTYPE_DISK_DRIVE).await?;
                    drive.set("Parent", controller_path).await?;
                    drive.set("AddressOnParent", slot.to_string()).await
                })
                .await
                .with_context(|| format!("adding drive for {disk}"))?;

            self.add_resource(STORAGE_ALLOCATION_SETTING_DATA, |image| async move {
                image.set("ResourceType", RESOURCE_TYPE_LOGICAL_DISK).await?;
                image.set("ResourceSubType", SUBTYPE_VIRTUAL_HARD_DISK).await?;
                image.set("Parent", drive.as_str()).await?;
                image.set("HostResource", vec![disk.to_string()]).await
            })
            .await
            .with_context(|| format!("adding virtual hard disk {disk}"))?;
        }
        Ok(())
    }

    /// Ask the service to move the machine to `state`.
    pub async fn request_state(&self, state: VmState) -> Result<()> {
        tracing::debug!(vm = %self.system.handle(), %state, "Requesting state change");
        let out = self
            .system
            .invoke(
                "RequestStateChange",
                MethodArgs::new().with("RequestedState", state.code()),
            )
            .await
            .context("invoking RequestStateChange")?;
        self.manager
            .jobs()
            .complete(&out)
            .await
            .with_context(|| format!("changing state to {state}"))
    }

    pub async fn start(&self) -> Result<()> {
        self.request_state(VmState::Running).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.request_state(VmState::Off).await
    }

    /// First settings component of `class` associated with this machine.
    async fn component(&self, class: &str) -> Result<Resource> {
        self.settings
            .associators(class)
            .await
            .with_context(|| format!("listing {class}"))?
            .into_elements()
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::InconsistentResource(format!("virtual machine has no {class}"))
            })
    }

    async fn modify_resource_settings(&self, resources: &[Resource]) -> Result<()> {
        let mut texts = Vec::with_capacity(resources.len());
        for resource in resources {
            texts.push(
                resource
                    .serialize_text(TextFormat::CimDtd20)
                    .await
                    .context("serializing resource settings")?,
            );
        }
        let out = self
            .manager
            .service()
            .invoke(
                "ModifyResourceSettings",
                MethodArgs::new().with("ResourceSettings", texts),
            )
            .await
            .context("invoking ModifyResourceSettings")?;
        self.manager.jobs().complete(&out).await
    }

    async fn modify_system_settings(&self) -> Result<()> {
        let text = self
            .settings
            .serialize_text(TextFormat::CimDtd20)
            .await
            .context("serializing system settings")?;
        let out = self
            .manager
            .service()
            .invoke(
                "ModifySystemSettings",
                MethodArgs::new().with("SystemSettings", text),
            )
            .await
            .context("invoking ModifySystemSettings")?;
        self.manager.jobs().complete(&out).await
    }

    /// Spawn a `class` instance, let `populate` fill it in, add it to this
    /// machine, and return the path of the added resource.
    async fn add_resource<F, Fut>(&self, class: &str, populate: F) -> Result<String>
    where
        F: FnOnce(Resource) -> Fut,
        Fut: std::future::Future<Output = halyard_wmi::Result<()>>,
    {
        let template = self
            .manager
            .session()
            .get_class(class)
            .await
            .map_err(|e| Error::template_unavailable(class, e))?;
        let instance = template
            .spawn_instance()
            .await
            .map_err(|e| Error::template_unavailable(class, e))?;
        populate(instance.clone())
            .await
            .with_context(|| format!("populating {class}"))?;
        let text = instance
            .serialize_text(TextFormat::CimDtd20)
            .await
            .context("serializing resource settings")?;

        let configuration = self
            .settings
            .path()
            .await
            .context("getting settings path")?;
        let out = self
            .manager
            .service()
            .invoke(
                "AddResourceSettings",
                MethodArgs::new()
                    .with("AffectedConfiguration", configuration.to_string())
                    .with("ResourceSettings", vec![text]),
            )
            .await
            .context("invoking AddResourceSettings")?;
        self.manager.jobs().complete(&out).await?;

        let added = out
            .get("ResultingResourceSettings")
            .and_then(|v| v.as_string_array())
            .context("reading ResultingResourceSettings")?;
        added.first().cloned().ok_or_else(|| {
            Error::InconsistentResource("AddResourceSettings returned no resource".into())
        })
    }
}

/// `ResourceSubType` of a device, `None` when unset.
async fn sub_type(device: &Resource) -> Result<Option<String>> {
    let value = device
        .get("ResourceSubType")
        .await
        .context("getting ResourceSubType")?;
    if value.is_null() {
        return Ok(None);
    }
    value
        .as_str()
        .map(|s| Some(s.to_string()))
        .context("reading ResourceSubType")
}

impl From<BootDevice> for Value {
    fn from(device: BootDevice) -> Self {
        Value::UInt16(device.code())
    }
}
