// Primary-integration and default-booking-calendar selection.
//
// Deterministic choices with no user interaction on first connect: a
// freshly discovered integration gets a default calendar, and deleting
// or deactivating the primary integration promotes a successor instead
// of leaving scheduling defaults dangling.

use log::debug;

use crate::error::SyncResult;
use crate::models::{CalendarIntegration, Provider};
use crate::store::{IntegrationStore, ProfileStore};

/// Resolve which calendar inside the integration receives newly booked
/// events, in order: provider-flagged primary, then user-selected, then
/// the first discovered calendar, then a provider fallback literal.
pub fn resolve_default_calendar(integration: &CalendarIntegration) -> Option<String> {
    if let Some(entry) = integration.calendar_list.iter().find(|c| c.primary) {
        return Some(entry.id.clone());
    }
    if let Some(entry) = integration.calendar_list.iter().find(|c| c.selected) {
        return Some(entry.id.clone());
    }
    if let Some(entry) = integration.calendar_list.first() {
        return Some(entry.id.clone());
    }
    // Nothing discovered yet: the OAuth providers accept well-known
    // aliases for the account's main calendar.
    match integration.provider().ok()? {
        Provider::Google => Some("primary".to_string()),
        Provider::Outlook => Some("default".to_string()),
        _ => None,
    }
}

/// Assign a default booking calendar if none is set. At most one
/// integration per user may claim a given calendar id; a conflict keeps
/// the existing assignment rather than surfacing an error.
pub async fn assign_default_calendar(
    store: &dyn IntegrationStore,
    integration: &mut CalendarIntegration,
) -> SyncResult<()> {
    if integration.default_booking_calendar_id.is_some() {
        return Ok(());
    }
    let calendar_id = match resolve_default_calendar(integration) {
        Some(calendar_id) => calendar_id,
        None => return Ok(()),
    };

    let siblings = store.list_for_user(integration.user_id).await?;
    let conflict = siblings.iter().any(|other| {
        other.id != integration.id
            && other.default_booking_calendar_id.as_deref() == Some(calendar_id.as_str())
    });
    if conflict {
        debug!(
            "Calendar '{}' already the booking default of another integration for user {}; keeping things as they are",
            calendar_id, integration.user_id
        );
        return Ok(());
    }

    integration.default_booking_calendar_id = Some(calendar_id);
    if integration.id.is_some() {
        store.update(integration).await?;
    }
    Ok(())
}

/// Promote a successor when the primary integration is deleted or
/// deactivated: the oldest-created active integration wins. With no
/// active integration left, primary is cleared rather than left
/// dangling. Returns the new primary, if any.
pub async fn handle_primary_removal(
    integrations: &dyn IntegrationStore,
    profiles: &dyn ProfileStore,
    user_id: i64,
    removed_id: i64,
) -> SyncResult<Option<i64>> {
    let primary = profiles.primary_integration(user_id).await?;
    if primary != Some(removed_id) {
        return Ok(primary);
    }

    let remaining = integrations.list_for_user(user_id).await?;
    let successor = remaining
        .iter()
        .filter(|i| i.is_active && i.id != Some(removed_id))
        .min_by_key(|i| (i.created_at, i.id))
        .and_then(|i| i.id);

    profiles.set_primary_integration(user_id, successor).await?;
    Ok(successor)
}

/// A reactivated integration is promoted when the user has no primary,
/// or the recorded primary is itself inactive or gone.
pub async fn handle_reactivation(
    integrations: &dyn IntegrationStore,
    profiles: &dyn ProfileStore,
    user_id: i64,
    integration_id: i64,
) -> SyncResult<Option<i64>> {
    let promote = match profiles.primary_integration(user_id).await? {
        None => true,
        Some(primary_id) => match integrations.get(primary_id).await {
            Ok(primary) => !primary.is_active,
            Err(_) => true,
        },
    };

    if promote {
        profiles
            .set_primary_integration(user_id, Some(integration_id))
            .await?;
        Ok(Some(integration_id))
    } else {
        profiles.primary_integration(user_id).await
    }
}
