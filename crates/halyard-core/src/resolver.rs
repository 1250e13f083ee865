//! Entity resolution: settings data → realized computer system.
//!
//! A virtual machine is addressed through two objects. Its realized
//! `Msvm_VirtualSystemSettingData` is found by query, then the associated
//! `Msvm_ComputerSystem` is reached by an associator walk. Both walks take
//! the first element they see. Duplicate identifiers and settings data with
//! several systems are unsupported; the latter is logged rather than
//! resolved.

use crate::constants::{COMPUTER_SYSTEM, SYSTEM_TYPE_REALIZED, VIRTUAL_SYSTEM_SETTING_DATA};
use crate::error::{Error, Result, ResultExt};
use crate::machine::VirtualMachine;
use crate::manager::Manager;
use halyard_wmi::{Filter, Query, Resource};

fn settings_query(filters: &[Filter]) -> Query {
    filters.iter().cloned().fold(
        Query::select(VIRTUAL_SYSTEM_SETTING_DATA).and_eq("VirtualSystemType", SYSTEM_TYPE_REALIZED),
        Query::and,
    )
}

/// Resolve the virtual machine whose `VirtualSystemIdentifier` is `id`.
pub async fn resolve_by_id(manager: &Manager, id: &str) -> Result<VirtualMachine> {
    resolve_by_filter(manager, &[Filter::equals("VirtualSystemIdentifier", id)])
        .await
        .with_context(|| format!("resolving VM {id}"))
}

/// Resolve the first realized virtual machine matching `filters`.
///
/// Zero matches is [`Error::NotFound`]; a match without a computer system is
/// [`Error::InconsistentResource`].
pub async fn resolve_by_filter(manager: &Manager, filters: &[Filter]) -> Result<VirtualMachine> {
    let query = settings_query(filters);
    let results = manager
        .session()
        .query(&query)
        .await
        .context("querying settings data")?;

    let settings = results
        .into_elements()
        .into_iter()
        .next()
        .ok_or_else(|| Error::NotFound(format!("no virtual machine matches {query}")))?;
    pair(manager, settings).await
}

/// Resolve every realized virtual machine, in query order.
pub async fn resolve_all(manager: &Manager) -> Result<Vec<VirtualMachine>> {
    resolve_all_by_filter(manager, &[]).await
}

/// Resolve every realized virtual machine matching `filters`, in query order.
pub async fn resolve_all_by_filter(
    manager: &Manager,
    filters: &[Filter],
) -> Result<Vec<VirtualMachine>> {
    let results = manager
        .session()
        .query(&settings_query(filters))
        .await
        .context("querying settings data")?;

    let mut machines = Vec::with_capacity(results.len());
    for settings in results {
        machines.push(pair(manager, settings).await?);
    }
    tracing::debug!(count = machines.len(), "Resolved virtual machines");
    Ok(machines)
}

async fn pair(manager: &Manager, settings: Resource) -> Result<VirtualMachine> {
    let systems = settings
        .associators(COMPUTER_SYSTEM)
        .await
        .context("walking to computer system")?;

    if systems.len() > 1 {
        tracing::warn!(
            settings = %settings.handle(),
            count = systems.len(),
            "Settings data has several computer systems, using the first"
        );
    }

    let Some(system) = systems.into_elements().into_iter().next() else {
        let id = settings
            .get("VirtualSystemIdentifier")
            .await
            .ok()
            .and_then(|v| v.as_str().ok().map(str::to_string))
            .unwrap_or_else(|| settings.handle().to_string());
        return Err(Error::InconsistentResource(format!(
            "realized settings data {id} has no associated {COMPUTER_SYSTEM}"
        )));
    };

    Ok(VirtualMachine::new(manager.clone(), settings, system))
}
