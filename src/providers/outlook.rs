// Microsoft Outlook adapter (Graph API).
//
// Graph assigns opaque event ids, so idempotent creation goes through
// `transactionId` instead of a client-supplied id: replaying the same
// booking yields the original event rather than a duplicate.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::error::{SyncError, SyncResult};
use crate::http_config::HttpConfig;
use crate::models::{CalendarEntry, CalendarEvent, CalendarIntegration, Provider};

use super::{
    provider_event_id, refresh_via_token_endpoint, ConnectionStatus, ProviderAdapter, TokenRefresh,
};

const API_BASE: &str = "https://graph.microsoft.com/v1.0";

pub struct OutlookAdapter {
    http: HttpConfig,
}

impl OutlookAdapter {
    pub fn new() -> Self {
        Self {
            http: HttpConfig::calendar_api(),
        }
    }

    fn access_token<'a>(&self, integration: &'a CalendarIntegration) -> SyncResult<&'a str> {
        integration
            .access_token
            .as_deref()
            .ok_or_else(|| SyncError::configuration("integration has no access token"))
    }

    fn event_body(&self, event: &CalendarEvent, transaction_id: Option<&str>) -> serde_json::Value {
        let attendees: Vec<serde_json::Value> = event
            .attendees
            .iter()
            .map(|email| {
                json!({
                    "emailAddress": { "address": email },
                    "type": "required",
                })
            })
            .collect();

        let mut body = json!({
            "subject": event.summary,
            "body": {
                "contentType": "text",
                "content": event.description.clone().unwrap_or_default(),
            },
            "start": {
                "dateTime": event.start.format("%Y-%m-%dT%H:%M:%S").to_string(),
                "timeZone": "UTC",
            },
            "end": {
                "dateTime": event.end.format("%Y-%m-%dT%H:%M:%S").to_string(),
                "timeZone": "UTC",
            },
            "isAllDay": event.all_day,
            "attendees": attendees,
        });

        if let Some(ref location) = event.location {
            body["location"] = json!({ "displayName": location });
        }
        if let Some(transaction_id) = transaction_id {
            body["transactionId"] = json!(transaction_id);
        }
        body
    }
}

impl Default for OutlookAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphDateTime {
    date_time: String,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAttendee {
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphLocation {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphEvent {
    id: String,
    subject: Option<String>,
    body_preview: Option<String>,
    location: Option<GraphLocation>,
    start: Option<GraphDateTime>,
    end: Option<GraphDateTime>,
    is_all_day: Option<bool>,
    is_cancelled: Option<bool>,
    attendees: Option<Vec<GraphAttendee>>,
}

#[derive(Debug, Deserialize)]
struct GraphEventsPage {
    #[serde(default)]
    value: Vec<GraphEvent>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphCalendar {
    id: String,
    name: Option<String>,
    is_default_calendar: Option<bool>,
    hex_color: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphCalendarsPage {
    #[serde(default)]
    value: Vec<GraphCalendar>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Graph returns naive datetimes in the timezone requested via the
/// `Prefer` header; we always request UTC.
fn parse_graph_time(time: Option<&GraphDateTime>) -> Option<DateTime<Utc>> {
    let raw = &time?.date_time;
    // Fractional seconds vary (".0000000"); cut them off.
    let trimmed = raw.split('.').next().unwrap_or(raw);
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn convert_event(graph_event: GraphEvent, calendar_id: &str) -> Option<CalendarEvent> {
    if graph_event.is_cancelled.unwrap_or(false) {
        return None;
    }

    let start = parse_graph_time(graph_event.start.as_ref())?;
    let end = parse_graph_time(graph_event.end.as_ref())
        .unwrap_or(start + chrono::Duration::hours(1));

    Some(CalendarEvent {
        id: graph_event.id,
        calendar_id: calendar_id.to_string(),
        summary: graph_event
            .subject
            .unwrap_or_else(|| "Untitled Event".to_string()),
        description: graph_event.body_preview,
        location: graph_event.location.and_then(|l| l.display_name),
        start,
        end,
        all_day: graph_event.is_all_day.unwrap_or(false),
        attendees: graph_event
            .attendees
            .unwrap_or_default()
            .into_iter()
            .filter_map(|a| a.email_address.and_then(|e| e.address))
            .collect(),
    })
}

#[async_trait]
impl ProviderAdapter for OutlookAdapter {
    async fn list_events(
        &self,
        integration: &CalendarIntegration,
        calendar_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SyncResult<Vec<CalendarEvent>> {
        let token = self.access_token(integration)?;
        let client = self.http.build_client()?;

        let mut events = Vec::new();
        let mut next_url = Some(format!(
            "{}/me/calendars/{}/calendarView?startDateTime={}&endDateTime={}&$top=100",
            API_BASE,
            calendar_id,
            start.to_rfc3339_opts(SecondsFormat::Secs, true),
            end.to_rfc3339_opts(SecondsFormat::Secs, true),
        ));

        while let Some(url) = next_url.take() {
            let response = client
                .get(&url)
                .bearer_auth(token)
                .header("Prefer", "outlook.timezone=\"UTC\"")
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SyncError::from_status(status, &body));
            }

            let page: GraphEventsPage = response
                .json()
                .await
                .map_err(|e| SyncError::transient(format!("malformed calendarView response: {}", e)))?;

            events.extend(
                page.value
                    .into_iter()
                    .filter_map(|e| convert_event(e, calendar_id)),
            );
            next_url = page.next_link;
        }

        Ok(events)
    }

    async fn create_event(
        &self,
        integration: &CalendarIntegration,
        event: &CalendarEvent,
    ) -> SyncResult<String> {
        let token = self.access_token(integration)?;
        let transaction_id = provider_event_id(Provider::Outlook, &event.id);
        let client = self.http.build_client()?;
        let url = format!("{}/me/calendars/{}/events", API_BASE, event.calendar_id);

        let response = client
            .post(&url)
            .bearer_auth(token)
            .json(&self.event_body(event, Some(&transaction_id)))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status, &body));
        }

        let created: GraphEvent = response
            .json()
            .await
            .map_err(|e| SyncError::transient(format!("malformed create response: {}", e)))?;
        Ok(created.id)
    }

    async fn update_event(
        &self,
        integration: &CalendarIntegration,
        event: &CalendarEvent,
    ) -> SyncResult<()> {
        let token = self.access_token(integration)?;
        let client = self.http.build_client()?;
        let url = format!(
            "{}/me/calendars/{}/events/{}",
            API_BASE, event.calendar_id, event.id
        );

        let response = client
            .patch(&url)
            .bearer_auth(token)
            .json(&self.event_body(event, None))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status, &body));
        }
        Ok(())
    }

    async fn delete_event(
        &self,
        integration: &CalendarIntegration,
        calendar_id: &str,
        event_id: &str,
    ) -> SyncResult<()> {
        let token = self.access_token(integration)?;
        let client = self.http.build_client()?;
        let url = format!(
            "{}/me/calendars/{}/events/{}",
            API_BASE, calendar_id, event_id
        );

        let response = client.delete(&url).bearer_auth(token).send().await?;

        let status = response.status();
        if status.as_u16() == 410 {
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status, &body));
        }
        Ok(())
    }

    async fn discover_calendars(
        &self,
        integration: &CalendarIntegration,
    ) -> SyncResult<Vec<CalendarEntry>> {
        let token = self.access_token(integration)?;
        let client = self.http.build_client()?;

        let mut entries = Vec::new();
        let mut next_url = Some(format!("{}/me/calendars?$top=50", API_BASE));

        while let Some(url) = next_url.take() {
            let response = client.get(&url).bearer_auth(token).send().await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SyncError::from_status(status, &body));
            }

            let page: GraphCalendarsPage = response
                .json()
                .await
                .map_err(|e| SyncError::transient(format!("malformed calendars response: {}", e)))?;

            entries.extend(page.value.into_iter().map(|calendar| CalendarEntry {
                name: calendar.name.unwrap_or_else(|| calendar.id.clone()),
                primary: calendar.is_default_calendar.unwrap_or(false),
                selected: false,
                color: calendar.hex_color,
                id: calendar.id,
            }));
            next_url = page.next_link;
        }

        Ok(entries)
    }

    async fn refresh_token(&self, integration: &CalendarIntegration) -> SyncResult<TokenRefresh> {
        refresh_via_token_endpoint(Provider::Outlook, integration).await
    }

    async fn test_connection(
        &self,
        integration: &CalendarIntegration,
    ) -> SyncResult<ConnectionStatus> {
        let token = self.access_token(integration)?;
        let client = HttpConfig::discovery().build_client()?;
        let url = format!("{}/me/calendars?$top=1", API_BASE);

        let response = client.get(&url).bearer_auth(token).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status, &body));
        }

        Ok(ConnectionStatus {
            ok: true,
            message: "Outlook calendar reachable".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_graph_time_with_fractional_seconds() {
        let time = GraphDateTime {
            date_time: "2025-06-02T09:00:00.0000000".to_string(),
        };
        assert_eq!(
            parse_graph_time(Some(&time)),
            Some(Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_events_page_deserialization() {
        let json = r#"{
            "value": [
                {
                    "id": "AAMkAD1",
                    "subject": "Planning",
                    "bodyPreview": "Quarterly planning",
                    "isAllDay": false,
                    "start": { "dateTime": "2025-06-02T09:00:00.0000000", "timeZone": "UTC" },
                    "end": { "dateTime": "2025-06-02T10:00:00.0000000", "timeZone": "UTC" },
                    "attendees": [
                        { "emailAddress": { "address": "carol@example.com", "name": "Carol" } }
                    ]
                },
                {
                    "id": "AAMkAD2",
                    "subject": "Ghost",
                    "isCancelled": true,
                    "start": { "dateTime": "2025-06-02T11:00:00.0000000", "timeZone": "UTC" },
                    "end": { "dateTime": "2025-06-02T12:00:00.0000000", "timeZone": "UTC" }
                }
            ],
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/me/calendars/x/calendarView?$skip=100"
        }"#;
        let page: GraphEventsPage = serde_json::from_str(json).unwrap();
        assert!(page.next_link.is_some());

        let events: Vec<CalendarEvent> = page
            .value
            .into_iter()
            .filter_map(|e| convert_event(e, "cal1"))
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].summary, "Planning");
        assert_eq!(events[0].attendees, vec!["carol@example.com".to_string()]);
    }

    #[test]
    fn test_event_body_includes_transaction_id() {
        let adapter = OutlookAdapter::new();
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 2, 9, 30, 0).unwrap();
        let event = CalendarEvent::new("booking-7", "cal1", "Call", start, end);

        let with_txn = adapter.event_body(&event, Some("booking7"));
        assert_eq!(with_txn["transactionId"], "booking7");
        assert_eq!(with_txn["start"]["dateTime"], "2025-06-02T09:00:00");
        assert_eq!(with_txn["start"]["timeZone"], "UTC");

        let without_txn = adapter.event_body(&event, None);
        assert!(without_txn.get("transactionId").is_none());
    }

    #[test]
    fn test_calendars_page_default_flag() {
        let json = r##"{
            "value": [
                { "id": "cal1", "name": "Calendar", "isDefaultCalendar": true },
                { "id": "cal2", "name": "Side project", "hexColor": "#aa3322" }
            ]
        }"##;
        let page: GraphCalendarsPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.value[0].is_default_calendar, Some(true));
        assert_eq!(page.value[1].hex_color.as_deref(), Some("#aa3322"));
    }
}
