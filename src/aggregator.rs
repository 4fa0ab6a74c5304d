// Multi-calendar fetch aggregator.
//
// One deduplicated event list across the integration's selected
// calendars. Fetches run concurrently under a semaphore so a user with
// dozens of calendars cannot monopolize the connection pool, and each
// fetch carries its own timeout. Individual failures are logged,
// reported to the health monitor and excluded; the aggregate never
// fails, it degrades to whatever subset (possibly empty) succeeded.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::SyncError;
use crate::health::{health_monitor, HealthMonitor, Outcome};
use crate::models::{CalendarEvent, CalendarIntegration};
use crate::providers::{adapter_for, ProviderAdapter};
use crate::selection::resolve_default_calendar;
use crate::token::TokenService;
use crate::utils::logging::log_fetch_failure;

/// Upper bound on concurrent fetches per aggregate call.
pub const MAX_CONCURRENT_FETCHES: usize = 4;

/// Per-calendar fetch timeout; a hung provider costs one slot for this
/// long and nothing more.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Availability entry point: make the integration's credentials usable,
/// then fan out across its selected calendars.
///
/// Credential problems degrade the same way fetch failures do: the
/// request gets an empty list, the failure lands on the health monitor,
/// and no other integration is affected.
pub async fn fetch_availability(
    tokens: &TokenService,
    monitor: &HealthMonitor,
    integration: CalendarIntegration,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<CalendarEvent> {
    let provider = integration.provider();
    let integration_id = integration.id.unwrap_or_default();

    let usable = match tokens.ensure_valid(integration).await {
        Ok(usable) => usable,
        Err(SyncError::RefreshInProgress) => {
            // Another worker is finishing the refresh; this request
            // degrades and the next one reads the rotated tokens.
            debug!(
                "Refresh in progress for integration {}; returning empty availability",
                integration_id
            );
            return Vec::new();
        }
        Err(e) => {
            warn!("Credentials unusable for integration {}: {}", integration_id, e);
            if let Ok(provider) = provider {
                monitor.record_error(provider, integration_id, &e).await;
            }
            return Vec::new();
        }
    };

    let adapter = match usable.provider().and_then(|p| tokens.registry().get(p)) {
        Ok(adapter) => adapter,
        Err(e) => {
            warn!("Cannot fetch events: {}", e);
            return Vec::new();
        }
    };
    fetch_with_adapter(adapter, monitor, &usable, start, end, FETCH_TIMEOUT).await
}

/// Fetch and merge events across the integration's selected calendars,
/// using the default adapter registry and the global health monitor.
pub async fn fetch_selected_events(
    integration: &CalendarIntegration,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<CalendarEvent> {
    let adapter = match integration.provider().and_then(adapter_for) {
        Ok(adapter) => adapter,
        Err(e) => {
            warn!("Cannot fetch events: {}", e);
            return Vec::new();
        }
    };
    fetch_with_adapter(adapter, health_monitor(), integration, start, end, FETCH_TIMEOUT).await
}

/// The injectable core of the aggregator.
pub async fn fetch_with_adapter(
    adapter: Arc<dyn ProviderAdapter>,
    monitor: &HealthMonitor,
    integration: &CalendarIntegration,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    fetch_timeout: Duration,
) -> Vec<CalendarEvent> {
    let provider = match integration.provider() {
        Ok(provider) => provider,
        Err(e) => {
            warn!("Cannot fetch events: {}", e);
            return Vec::new();
        }
    };
    let integration_id = integration.id.unwrap_or_default();

    let mut calendar_ids: Vec<String> = integration
        .selected_calendars()
        .iter()
        .map(|c| c.id.clone())
        .collect();
    if calendar_ids.is_empty() {
        // Nothing explicitly selected: fall back to the single primary
        // calendar fetch.
        calendar_ids = vec![resolve_default_calendar(integration).unwrap_or_default()];
        debug!(
            "No calendars selected on {}/{}; falling back to '{}'",
            provider.as_str(),
            integration_id,
            calendar_ids[0]
        );
    }
    let attempted = calendar_ids.len();

    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_FETCHES));
    let mut fetches: JoinSet<(String, Result<Vec<CalendarEvent>, SyncError>)> = JoinSet::new();

    for calendar_id in calendar_ids {
        let adapter = adapter.clone();
        let integration = integration.clone();
        let semaphore = semaphore.clone();
        fetches.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return (
                        calendar_id,
                        Err(SyncError::transient("fetch semaphore closed")),
                    )
                }
            };

            let result = tokio::time::timeout(
                fetch_timeout,
                adapter.list_events(&integration, &calendar_id, start, end),
            )
            .await;

            let outcome = match result {
                Ok(Ok(events)) => Ok(events),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(SyncError::transient(format!(
                    "fetch of calendar '{}' timed out after {:?}",
                    calendar_id, fetch_timeout
                ))),
            };
            (calendar_id, outcome)
        });
    }

    let mut merged: Vec<CalendarEvent> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut failures = 0usize;

    while let Some(joined) = fetches.join_next().await {
        match joined {
            Ok((_, Ok(events))) => {
                monitor
                    .record(provider, integration_id, Outcome::Success)
                    .await;
                // First-seen wins; order across calendars is not
                // guaranteed, callers sort post-merge when they care.
                for event in events {
                    if seen.insert(event.id.clone()) {
                        merged.push(event);
                    }
                }
            }
            Ok((calendar_id, Err(error))) => {
                failures += 1;
                log_fetch_failure(provider.as_str(), &calendar_id, &error);
                monitor.record_error(provider, integration_id, &error).await;
            }
            Err(join_error) => {
                failures += 1;
                warn!("Calendar fetch task died: {}", join_error);
                monitor
                    .record(provider, integration_id, Outcome::HardError)
                    .await;
            }
        }
    }

    if failures == attempted && attempted > 0 {
        // Empty, not an error: availability computation degrades
        // gracefully instead of blocking bookings entirely.
        info!(
            "All {} calendar fetches failed for {}/{}; returning empty set",
            attempted,
            provider.as_str(),
            integration_id
        );
    }

    merged
}
