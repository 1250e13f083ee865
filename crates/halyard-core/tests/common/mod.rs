//! A fake Hyper-V host on top of the in-memory backend.
//!
//! Emulates just enough of `Msvm_VirtualSystemManagementService` for the
//! manager and machine operations: `DefineSystem`, `ModifyResourceSettings`,
//! `ModifySystemSettings`, `AddResourceSettings`, and the computer system's
//! `RequestStateChange`. Every method answers with a started job.

#![allow(dead_code)]

use halyard_core::constants::*;
use halyard_core::{Generation, Manager, ManagerConfig};
use halyard_wmi::memory::{InstanceText, MemoryBackend, Namespace, JOB_CLASS};
use halyard_wmi::{MethodArgs, ObjectPath, OutParams, Value, WmiError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Paths of one seeded machine.
#[derive(Debug, Clone)]
pub struct FakeVm {
    pub id: String,
    pub settings: ObjectPath,
    pub system: ObjectPath,
    pub memory: ObjectPath,
    pub processor: ObjectPath,
    pub controller: ObjectPath,
}

#[derive(Default)]
struct Behavior {
    next_ids: VecDeque<String>,
    minted: u64,
    define_polls: usize,
    define_failure: Option<String>,
    lose_defined_system: bool,
    modify_failure: Option<(String, String)>,
    added: u64,
}

#[derive(Clone)]
pub struct FakeHost {
    pub backend: MemoryBackend,
    behavior: Arc<Mutex<Behavior>>,
}

fn lock(behavior: &Mutex<Behavior>) -> MutexGuard<'_, Behavior> {
    behavior.lock().unwrap_or_else(|e| e.into_inner())
}

fn invalid(method: &str, message: &str) -> WmiError {
    WmiError::Invoke {
        method: method.to_string(),
        message: message.to_string(),
    }
}

fn text_arg<'a>(method: &str, args: &'a MethodArgs, name: &str) -> halyard_wmi::Result<&'a str> {
    args.get(name)
        .ok_or_else(|| invalid(method, &format!("missing {name}")))?
        .as_str()
}

fn started(ns: &mut Namespace, running_polls: usize) -> (ObjectPath, OutParams) {
    let mut states = vec![4u16; running_polls];
    states.push(7);
    let job = ns.add_job(states);
    let out = OutParams::new()
        .with("ReturnValue", 4096u32)
        .with("Job", job.to_string());
    (job, out)
}

fn failed(ns: &mut Namespace, description: &str) -> OutParams {
    let job = ns.add_job([4, 10]);
    let _ = ns.set_property(&job, "ErrorDescription", description);
    let _ = ns.set_property(&job, "ErrorCode", Value::UInt16(32768));
    OutParams::new()
        .with("ReturnValue", 4096u32)
        .with("Job", job.to_string())
}

/// Find the saved instance an embedded-instance text describes.
fn find_instance(ns: &Namespace, text: &InstanceText) -> Option<ObjectPath> {
    let id = text.property("InstanceID")?.clone();
    ns.instances(&text.class)
        .into_iter()
        .find(|path| ns.property(path, "InstanceID").as_ref() == Some(&id))
}

fn seed(
    ns: &mut Namespace,
    id: &str,
    name: &str,
    generation: Generation,
    notes: Value,
) -> FakeVm {
    let prefix = format!("Microsoft:{id}");
    let settings = ns.insert(
        VIRTUAL_SYSTEM_SETTING_DATA,
        ("InstanceID", prefix.as_str()),
        [
            ("VirtualSystemIdentifier", Value::from(id)),
            ("VirtualSystemType", Value::from(SYSTEM_TYPE_REALIZED)),
            ("ElementName", Value::from(name)),
            ("VirtualSystemSubType", Value::from(generation.sub_type())),
            ("Notes", notes),
            ("BootOrder", Value::UInt16Array(vec![1, 2, 3, 0])),
        ],
    );
    let system = ns.insert(
        COMPUTER_SYSTEM,
        ("Name", id),
        [
            ("CreationClassName", Value::from(COMPUTER_SYSTEM)),
            ("ElementName", Value::from(name)),
            ("EnabledState", Value::UInt16(3)),
        ],
    );
    let memory_id = format!("{prefix}\\4764334D-E001-4176-82EE-5594EC9B530E");
    let memory = ns.insert(
        MEMORY_SETTING_DATA,
        ("InstanceID", memory_id.as_str()),
        [
            ("VirtualQuantity", Value::UInt64(512)),
            ("Reservation", Value::UInt64(512)),
            ("Limit", Value::UInt64(1_048_576)),
        ],
    );
    let processor_id = format!("{prefix}\\B637F346-6A0E-4DEC-AF52-BD70CB80A21D\\0");
    let processor = ns.insert(
        PROCESSOR_SETTING_DATA,
        ("InstanceID", processor_id.as_str()),
        [
            ("VirtualQuantity", Value::UInt64(1)),
            ("LimitProcessorFeatures", Value::Bool(false)),
        ],
    );
    let controller_id = format!("{prefix}\\D422512D-2BF2-4752-809D-7B82B5FCB1B4\\0");
    let controller = ns.insert(
        RESOURCE_ALLOCATION_SETTING_DATA,
        ("InstanceID", controller_id.as_str()),
        [
            ("ResourceType", Value::UInt16(6)),
            ("ResourceSubType", Value::from(SUBTYPE_SCSI_CONTROLLER)),
        ],
    );
    for path in [&system, &memory, &processor, &controller] {
        let _ = ns.associate(&settings, path);
    }

    FakeVm {
        id: id.to_string(),
        settings,
        system,
        memory,
        processor,
        controller,
    }
}

impl FakeHost {
    pub fn new() -> Self {
        let host = Self {
            backend: MemoryBackend::new(),
            behavior: Arc::default(),
        };
        host.install();
        host
    }

    fn install(&self) {
        let backend = &self.backend;
        backend.with_namespace(|ns| {
            ns.insert_singleton(
                MANAGEMENT_SERVICE,
                [("ElementName", Value::from("Hyper-V Virtual System Management Service"))],
            );
        });
        backend.define_class(
            VIRTUAL_SYSTEM_SETTING_DATA,
            [
                ("InstanceID", Value::Null),
                ("ElementName", Value::Null),
                ("VirtualSystemSubType", Value::Null),
                ("Notes", Value::Null),
            ],
        );
        for class in [RESOURCE_ALLOCATION_SETTING_DATA, STORAGE_ALLOCATION_SETTING_DATA] {
            backend.define_class(
                class,
                [
                    ("InstanceID", Value::Null),
                    ("ResourceType", Value::Null),
                    ("ResourceSubType", Value::Null),
                    ("Parent", Value::Null),
                    ("AddressOnParent", Value::Null),
                    ("HostResource", Value::Null),
                ],
            );
        }

        let behavior = self.behavior.clone();
        backend.on_method("DefineSystem", move |ns, call| {
            let text = text_arg("DefineSystem", &call.args, "SystemSettings")?;
            let settings = InstanceText::parse(text)?;
            let mut behavior = lock(&behavior);

            if let Some(description) = behavior.define_failure.clone() {
                return Ok(failed(ns, &description));
            }

            behavior.minted += 1;
            let minted = behavior.minted;
            let id = behavior
                .next_ids
                .pop_front()
                .unwrap_or_else(|| format!("VM-{minted}"));
            let name = settings
                .property("ElementName")
                .and_then(|v| v.as_str().ok())
                .unwrap_or_default()
                .to_string();
            let generation = settings
                .property("VirtualSystemSubType")
                .and_then(|v| v.as_str().ok())
                .and_then(Generation::from_sub_type)
                .ok_or_else(|| invalid("DefineSystem", "bad VirtualSystemSubType"))?;
            let notes = settings.property("Notes").cloned().unwrap_or(Value::Null);

            let vm = seed(ns, &id, &name, generation, notes);
            if behavior.lose_defined_system {
                ns.remove(&vm.system)?;
            }
            let (_, out) = started(ns, behavior.define_polls);
            Ok(out.with("ResultingSystem", vm.system.to_string()))
        });

        let behavior = self.behavior.clone();
        backend.on_method("ModifyResourceSettings", move |ns, call| {
            let texts = call
                .args
                .get("ResourceSettings")
                .ok_or_else(|| invalid("ModifyResourceSettings", "missing ResourceSettings"))?
                .as_string_array()?
                .to_vec();
            let behavior = lock(&behavior);
            for text in &texts {
                let resource = InstanceText::parse(text)?;
                if let Some((class, description)) = &behavior.modify_failure {
                    if class.eq_ignore_ascii_case(&resource.class) {
                        return Ok(failed(ns, description));
                    }
                }
                let path = find_instance(ns, &resource)
                    .ok_or_else(|| invalid("ModifyResourceSettings", "unknown resource"))?;
                for (name, value) in resource.properties {
                    ns.set_property(&path, &name, value)?;
                }
            }
            Ok(started(ns, 1).1)
        });

        backend.on_method("ModifySystemSettings", |ns, call| {
            let text = text_arg("ModifySystemSettings", &call.args, "SystemSettings")?;
            let settings = InstanceText::parse(text)?;
            let path = find_instance(ns, &settings)
                .ok_or_else(|| invalid("ModifySystemSettings", "unknown system"))?;
            for (name, value) in settings.properties {
                ns.set_property(&path, &name, value)?;
            }
            Ok(started(ns, 1).1)
        });

        let behavior = self.behavior.clone();
        backend.on_method("AddResourceSettings", move |ns, call| {
            let configuration = ObjectPath::parse(text_arg(
                "AddResourceSettings",
                &call.args,
                "AffectedConfiguration",
            )?)?;
            let texts = call
                .args
                .get("ResourceSettings")
                .ok_or_else(|| invalid("AddResourceSettings", "missing ResourceSettings"))?
                .as_string_array()?
                .to_vec();

            let mut added = Vec::new();
            for text in &texts {
                let resource = InstanceText::parse(text)?;
                let mut behavior = lock(&behavior);
                behavior.added += 1;
                let instance_id = format!("Microsoft:added\\{}", behavior.added);
                let properties: Vec<(String, Value)> = resource
                    .properties
                    .into_iter()
                    .filter(|(name, _)| !name.eq_ignore_ascii_case("InstanceID"))
                    .collect();
                let path = ns.insert(&resource.class, ("InstanceID", instance_id.as_str()), properties);
                ns.associate(&configuration, &path)?;
                added.push(path.to_string());
            }
            let (_, out) = started(ns, 1);
            Ok(out.with("ResultingResourceSettings", added))
        });

        backend.on_method("RequestStateChange", |ns, call| {
            let state = call
                .args
                .get("RequestedState")
                .ok_or_else(|| invalid("RequestStateChange", "missing RequestedState"))?
                .as_u16()?;
            let target = call
                .target
                .clone()
                .ok_or_else(|| invalid("RequestStateChange", "unsaved target"))?;
            ns.set_property(&target, "EnabledState", Value::UInt16(state))?;
            Ok(started(ns, 2).1)
        });
    }

    /// Identifiers handed out by the next `DefineSystem` calls.
    pub fn next_ids<I: IntoIterator<Item = &'static str>>(&self, ids: I) -> &Self {
        lock(&self.behavior)
            .next_ids
            .extend(ids.into_iter().map(str::to_string));
        self
    }

    /// `DefineSystem` jobs report running this many times before completing.
    pub fn define_polls(&self, polls: usize) -> &Self {
        lock(&self.behavior).define_polls = polls;
        self
    }

    /// Make `DefineSystem` jobs fail with `description`.
    pub fn fail_define(&self, description: &str) -> &Self {
        lock(&self.behavior).define_failure = Some(description.to_string());
        self
    }

    /// Keep the settings of newly defined machines but drop their computer
    /// system, so the returned `ResultingSystem` no longer resolves.
    pub fn lose_defined_system(&self) -> &Self {
        lock(&self.behavior).lose_defined_system = true;
        self
    }

    /// Make `ModifyResourceSettings` jobs on `class` fail with `description`.
    pub fn fail_modify(&self, class: &str, description: &str) -> &Self {
        lock(&self.behavior).modify_failure = Some((class.to_string(), description.to_string()));
        self
    }

    /// Seed an existing machine.
    pub fn add_vm(&self, id: &str, name: &str, generation: Generation) -> FakeVm {
        self.backend
            .with_namespace(|ns| seed(ns, id, name, generation, Value::Null))
    }

    /// Seed realized settings data with no computer system behind it.
    pub fn add_orphan_settings(&self, id: &str) -> ObjectPath {
        let instance_id = format!("Microsoft:{id}");
        self.backend.insert(
            VIRTUAL_SYSTEM_SETTING_DATA,
            ("InstanceID", instance_id.as_str()),
            [
                ("VirtualSystemIdentifier", Value::from(id)),
                ("VirtualSystemType", Value::from(SYSTEM_TYPE_REALIZED)),
            ],
        )
    }

    /// Every job the host has created, oldest first.
    pub fn jobs(&self) -> Vec<ObjectPath> {
        self.backend.with_namespace(|ns| ns.instances(JOB_CLASS))
    }

    /// Parsed embedded-instance texts passed as `param` to every call of
    /// `method`, flattened, oldest first.
    pub fn sent(&self, method: &str, param: &str) -> Vec<InstanceText> {
        self.backend
            .invocations(method)
            .iter()
            .filter_map(|call| call.args.get(param).cloned())
            .flat_map(|value| match value {
                Value::String(text) => vec![text],
                Value::StringArray(texts) => texts,
                _ => Vec::new(),
            })
            .filter_map(|text| InstanceText::parse(&text).ok())
            .collect()
    }

    pub fn config(&self) -> ManagerConfig {
        ManagerConfig::builder()
            .host_processors(8)
            .build()
            .unwrap()
    }

    pub async fn manager(&self) -> Manager {
        Manager::connect(&self.backend, self.config()).await.unwrap()
    }

    pub async fn manager_with_timeout(&self, timeout: Duration) -> Manager {
        let config = ManagerConfig::builder()
            .host_processors(8)
            .job_timeout(timeout)
            .build()
            .unwrap();
        Manager::connect(&self.backend, config).await.unwrap()
    }
}
