//! Check-then-create helpers for host groups and initiators.

use tracing::{debug, info};

use crate::array::{ArrayClient, ArrayError, HostGroup, Initiator};

/// Returns the host group called `name`, creating it when missing.
///
/// A concurrent creator winning the race is not an error: the group is
/// fetched again.
///
/// # Errors
///
/// Returns the array error when lookup or creation fails for another reason.
pub async fn ensure_host_group<A>(array: &A, name: &str) -> Result<HostGroup, ArrayError>
where
    A: ArrayClient + ?Sized,
{
    if let Some(group) = array.host_group(name).await? {
        return Ok(group);
    }

    match array.create_host_group(name).await {
        Ok(group) => {
            info!(group = name, "created host group");
            Ok(group)
        }
        Err(ArrayError::NameInUse { .. }) => {
            debug!(group = name, "host group appeared concurrently");
            array
                .host_group(name)
                .await?
                .ok_or_else(|| ArrayError::not_found("host group", name))
        }
        Err(err) => Err(err),
    }
}

/// Registers `initiator` with `group` unless it is already present.
///
/// # Errors
///
/// Returns the array error when registration fails.
pub async fn ensure_initiator_registered<A>(
    array: &A,
    group: &HostGroup,
    initiator: &Initiator,
) -> Result<(), ArrayError>
where
    A: ArrayClient + ?Sized,
{
    if group.has_initiator(&initiator.id) {
        debug!(group = %group.name, initiator = %initiator.id, "initiator already registered");
        return Ok(());
    }

    match array.register_initiator(group, initiator).await {
        Ok(()) => {
            info!(
                group = %group.name,
                initiator = %initiator.id,
                transport = %initiator.transport,
                "registered initiator"
            );
            Ok(())
        }
        Err(ArrayError::NameInUse { .. }) => {
            debug!(group = %group.name, initiator = %initiator.id, "initiator registered concurrently");
            Ok(())
        }
        Err(err) => Err(err),
    }
}
