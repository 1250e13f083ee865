//! Class names, subtype markers, and status codes of the Hyper-V
//! virtualization namespace.

pub const VIRTUAL_SYSTEM_SETTING_DATA: &str = "Msvm_VirtualSystemSettingData";
pub const COMPUTER_SYSTEM: &str = "Msvm_ComputerSystem";
pub const MANAGEMENT_SERVICE: &str = "Msvm_VirtualSystemManagementService";
pub const MEMORY_SETTING_DATA: &str = "Msvm_MemorySettingData";
pub const PROCESSOR_SETTING_DATA: &str = "Msvm_ProcessorSettingData";
pub const RESOURCE_ALLOCATION_SETTING_DATA: &str = "Msvm_ResourceAllocationSettingData";
pub const STORAGE_ALLOCATION_SETTING_DATA: &str = "Msvm_StorageAllocationSettingData";

/// `VirtualSystemType` of settings data that describes a realized machine
/// (as opposed to snapshots and planned systems).
pub const SYSTEM_TYPE_REALIZED: &str = "Microsoft:Hyper-V:System:Realized";

pub const SUBTYPE_SCSI_CONTROLLER: &str = "Microsoft:Hyper-V:Synthetic SCSI Controller";
pub const SUBTYPE_DISK_DRIVE: &str = "Microsoft:Hyper-V:Synthetic Disk Drive";
pub const SUBTYPE_VIRTUAL_HARD_DISK: &str = "Microsoft:Hyper-V:Virtual Hard Disk";

/// CIM `ResourceType` of a disk drive.
pub const RESOURCE_TYPE_DISK_DRIVE: u16 = 17;
/// CIM `ResourceType` of a logical disk (a virtual hard disk file).
pub const RESOURCE_TYPE_LOGICAL_DISK: u16 = 31;

/// Method return code: finished synchronously.
pub const RETURN_COMPLETED: u32 = 0;
/// Method return code: a job was started and must be awaited.
pub const RETURN_JOB_STARTED: u32 = 4096;

/// Addressable slots on one synthetic SCSI controller.
pub const SCSI_CONTROLLER_SLOTS: u32 = 64;
