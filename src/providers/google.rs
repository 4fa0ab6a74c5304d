// Google Calendar adapter (Calendar API v3).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::error::{SyncError, SyncResult};
use crate::http_config::HttpConfig;
use crate::models::{CalendarEntry, CalendarEvent, CalendarIntegration, Provider};

use super::{
    provider_event_id, refresh_via_token_endpoint, ConnectionStatus, ProviderAdapter, TokenRefresh,
};

const API_BASE: &str = "https://www.googleapis.com/calendar/v3";

pub struct GoogleAdapter {
    http: HttpConfig,
}

impl GoogleAdapter {
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

    fn event_body(&self, event: &CalendarEvent, event_id: &str) -> serde_json::Value {
        let (start, end) = if event.all_day {
            (
                json!({ "date": event.start.format("%Y-%m-%d").to_string() }),
                json!({ "date": event.end.format("%Y-%m-%d").to_string() }),
            )
        } else {
            (
                json!({
                    "dateTime": event.start.to_rfc3339_opts(SecondsFormat::Secs, true),
                    "timeZone": "UTC",
                }),
                json!({
                    "dateTime": event.end.to_rfc3339_opts(SecondsFormat::Secs, true),
                    "timeZone": "UTC",
                }),
            )
        };

        let attendees: Vec<serde_json::Value> = event
            .attendees
            .iter()
            .map(|email| json!({ "email": email }))
            .collect();

        json!({
            "id": event_id,
            "summary": event.summary,
            "description": event.description,
            "location": event.location,
            "start": start,
            "end": end,
            "attendees": attendees,
        })
    }
}

impl Default for GoogleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_path_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEventTime {
    date_time: Option<DateTime<Utc>>,
    date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct GoogleAttendee {
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleEvent {
    id: String,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    status: Option<String>,
    start: Option<GoogleEventTime>,
    end: Option<GoogleEventTime>,
    attendees: Option<Vec<GoogleAttendee>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEventsPage {
    #[serde(default)]
    items: Vec<GoogleEvent>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleCalendarListEntry {
    id: String,
    summary: Option<String>,
    primary: Option<bool>,
    selected: Option<bool>,
    background_color: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleCalendarListPage {
    #[serde(default)]
    items: Vec<GoogleCalendarListEntry>,
    next_page_token: Option<String>,
}

fn convert_event(google_event: GoogleEvent, calendar_id: &str) -> Option<CalendarEvent> {
    if google_event.status.as_deref() == Some("cancelled") {
        return None;
    }

    let (start, all_day) = resolve_time(google_event.start.as_ref())?;
    let (end, _) = resolve_time(google_event.end.as_ref())
        .unwrap_or((start + chrono::Duration::hours(1), all_day));

    Some(CalendarEvent {
        id: google_event.id,
        calendar_id: calendar_id.to_string(),
        summary: google_event
            .summary
            .unwrap_or_else(|| "Untitled Event".to_string()),
        description: google_event.description,
        location: google_event.location,
        start,
        end,
        all_day,
        attendees: google_event
            .attendees
            .unwrap_or_default()
            .into_iter()
            .filter_map(|a| a.email)
            .collect(),
    })
}

fn resolve_time(time: Option<&GoogleEventTime>) -> Option<(DateTime<Utc>, bool)> {
    let time = time?;
    if let Some(date_time) = time.date_time {
        return Some((date_time, false));
    }
    let date = time.date?;
    let midnight = Utc
        .with_ymd_and_hms(
            chrono::Datelike::year(&date),
            chrono::Datelike::month(&date),
            chrono::Datelike::day(&date),
            0,
            0,
            0,
        )
        .single()?;
    Some((midnight, true))
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    async fn list_events(
        &self,
        integration: &CalendarIntegration,
        calendar_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SyncResult<Vec<CalendarEvent>> {
        let token = self.access_token(integration)?;
        let client = self.http.build_client()?;
        let url = format!(
            "{}/calendars/{}/events",
            API_BASE,
            encode_path_segment(calendar_id)
        );

        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("singleEvents".to_string(), "true".to_string()),
                (
                    "timeMin".to_string(),
                    start.to_rfc3339_opts(SecondsFormat::Secs, true),
                ),
                (
                    "timeMax".to_string(),
                    end.to_rfc3339_opts(SecondsFormat::Secs, true),
                ),
                ("maxResults".to_string(), "250".to_string()),
            ];
            if let Some(ref token) = page_token {
                query.push(("pageToken".to_string(), token.clone()));
            }

            let response = client
                .get(&url)
                .query(&query)
                .bearer_auth(token)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SyncError::from_status(status, &body));
            }

            let page: GoogleEventsPage = response
                .json()
                .await
                .map_err(|e| SyncError::transient(format!("malformed events response: {}", e)))?;

            events.extend(
                page.items
                    .into_iter()
                    .filter_map(|e| convert_event(e, calendar_id)),
            );

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(events)
    }

    async fn create_event(
        &self,
        integration: &CalendarIntegration,
        event: &CalendarEvent,
    ) -> SyncResult<String> {
        let token = self.access_token(integration)?;
        let event_id = provider_event_id(Provider::Google, &event.id);
        let client = self.http.build_client()?;
        let url = format!(
            "{}/calendars/{}/events",
            API_BASE,
            encode_path_segment(&event.calendar_id)
        );

        let response = client
            .post(&url)
            .bearer_auth(token)
            .json(&self.event_body(event, &event_id))
            .send()
            .await?;

        let status = response.status();
        // 409 means this id already exists: the create has happened
        // before, which is exactly what the deterministic id is for.
        if status.as_u16() == 409 {
            return Ok(event_id);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status, &body));
        }

        let created: GoogleEvent = response
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
        let event_id = provider_event_id(Provider::Google, &event.id);
        let client = self.http.build_client()?;
        let url = format!(
            "{}/calendars/{}/events/{}",
            API_BASE,
            encode_path_segment(&event.calendar_id),
            event_id
        );

        let response = client
            .put(&url)
            .bearer_auth(token)
            .json(&self.event_body(event, &event_id))
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
        let event_id = provider_event_id(Provider::Google, event_id);
        let client = self.http.build_client()?;
        let url = format!(
            "{}/calendars/{}/events/{}",
            API_BASE,
            encode_path_segment(calendar_id),
            event_id
        );

        let response = client.delete(&url).bearer_auth(token).send().await?;

        let status = response.status();
        // Gone: someone already deleted it, which is the outcome we want.
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
        let url = format!("{}/users/me/calendarList", API_BASE);

        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query: Vec<(String, String)> = Vec::new();
            if let Some(ref token) = page_token {
                query.push(("pageToken".to_string(), token.clone()));
            }

            let response = client
                .get(&url)
                .query(&query)
                .bearer_auth(token)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SyncError::from_status(status, &body));
            }

            let page: GoogleCalendarListPage = response.json().await.map_err(|e| {
                SyncError::transient(format!("malformed calendarList response: {}", e))
            })?;

            entries.extend(page.items.into_iter().map(|item| CalendarEntry {
                name: item.summary.unwrap_or_else(|| item.id.clone()),
                primary: item.primary.unwrap_or(false),
                selected: item.selected.unwrap_or(false),
                color: item.background_color,
                id: item.id,
            }));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(entries)
    }

    async fn refresh_token(&self, integration: &CalendarIntegration) -> SyncResult<TokenRefresh> {
        refresh_via_token_endpoint(Provider::Google, integration).await
    }

    async fn test_connection(
        &self,
        integration: &CalendarIntegration,
    ) -> SyncResult<ConnectionStatus> {
        let token = self.access_token(integration)?;
        let client = HttpConfig::discovery().build_client()?;
        let url = format!("{}/users/me/calendarList", API_BASE);

        let response = client
            .get(&url)
            .query(&[("maxResults", "1")])
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status, &body));
        }

        Ok(ConnectionStatus {
            ok: true,
            message: "Google Calendar reachable".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_json() -> &'static str {
        r#"{
            "items": [
                {
                    "id": "evt1",
                    "summary": "Standup",
                    "start": { "dateTime": "2025-06-02T09:00:00Z" },
                    "end": { "dateTime": "2025-06-02T09:15:00Z" },
                    "attendees": [ { "email": "bob@example.com" } ]
                },
                {
                    "id": "evt2",
                    "status": "cancelled",
                    "start": { "dateTime": "2025-06-02T10:00:00Z" },
                    "end": { "dateTime": "2025-06-02T11:00:00Z" }
                },
                {
                    "id": "evt3",
                    "summary": "Offsite",
                    "start": { "date": "2025-06-03" },
                    "end": { "date": "2025-06-04" }
                }
            ],
            "nextPageToken": null
        }"#
    }

    #[test]
    fn test_page_deserialization_and_conversion() {
        let page: GoogleEventsPage = serde_json::from_str(page_json()).unwrap();
        let events: Vec<CalendarEvent> = page
            .items
            .into_iter()
            .filter_map(|e| convert_event(e, "primary"))
            .collect();

        // cancelled event dropped
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, "evt1");
        assert_eq!(events[0].attendees, vec!["bob@example.com".to_string()]);
        assert!(!events[0].all_day);
        assert!(events[1].all_day);
        assert_eq!(
            events[1].start,
            Utc.with_ymd_and_hms(2025, 6, 3, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_event_body_timed() {
        let adapter = GoogleAdapter::new();
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 2, 9, 30, 0).unwrap();
        let event = CalendarEvent::new("booking-1", "primary", "Call", start, end);

        let body = adapter.event_body(&event, "booking1");
        assert_eq!(body["id"], "booking1");
        assert_eq!(body["start"]["dateTime"], "2025-06-02T09:00:00Z");
        assert_eq!(body["start"]["timeZone"], "UTC");
    }

    #[test]
    fn test_event_body_all_day() {
        let adapter = GoogleAdapter::new();
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 3, 0, 0, 0).unwrap();
        let mut event = CalendarEvent::new("booking-1", "primary", "Offsite", start, end);
        event.all_day = true;

        let body = adapter.event_body(&event, "booking1");
        assert_eq!(body["start"]["date"], "2025-06-02");
        assert_eq!(body["end"]["date"], "2025-06-03");
    }

    #[test]
    fn test_calendar_list_mapping() {
        let json = r##"{
            "items": [
                { "id": "primary-cal", "summary": "Alice", "primary": true, "backgroundColor": "#9fe1e7" },
                { "id": "team-cal", "summary": "Team", "selected": true }
            ]
        }"##;
        let page: GoogleCalendarListPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].primary, Some(true));
        assert_eq!(page.items[1].selected, Some(true));
    }
}
