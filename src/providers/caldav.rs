// CalDAV-family adapter.
//
// One implementation covers the whole family; the server dialect only
// changes URL construction (via ServerProfile) and capability flags.
// Auth is HTTP Basic per integration, discovery is PROPFIND, listing is
// a REPORT calendar-query, and event bodies are RFC 5545 documents.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};

use crate::caldav::{
    build_calendar_url, build_discovery_url, build_event_url, detect_from_headers,
    detect_from_url, ics, xml, ServerType,
};
use crate::error::{SyncError, SyncResult};
use crate::http_config::HttpConfig;
use crate::models::{CalendarEntry, CalendarEvent, CalendarIntegration};

use super::{provider_event_id, ConnectionStatus, ProviderAdapter, TokenRefresh};

// reqwest ships no constants for the WebDAV verbs.
fn dav_method(name: &'static str) -> Method {
    Method::from_bytes(name.as_bytes()).expect("valid WebDAV method token")
}

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav" xmlns:x1="http://apple.com/ns/ical/">
  <d:prop>
    <d:resourcetype/>
    <d:displayname/>
    <c:calendar-home-set/>
    <x1:calendar-color/>
  </d:prop>
</d:propfind>"#;

pub struct CaldavAdapter {
    server_type: Option<ServerType>,
    http: HttpConfig,
}

struct CaldavTarget<'a> {
    server_type: ServerType,
    base_url: &'a str,
    username: &'a str,
    password: &'a str,
}

impl CaldavAdapter {
    /// Adapter for the plain `caldav` provider; the dialect is detected
    /// from the base URL on every call.
    pub fn generic() -> Self {
        Self {
            server_type: None,
            http: HttpConfig::calendar_api(),
        }
    }

    /// Adapter pinned to a known server dialect.
    pub fn for_server(server_type: ServerType) -> Self {
        Self {
            server_type: Some(server_type),
            http: HttpConfig::calendar_api(),
        }
    }

    fn target<'a>(&self, integration: &'a CalendarIntegration) -> SyncResult<CaldavTarget<'a>> {
        let base_url = integration
            .base_url
            .as_deref()
            .ok_or_else(|| SyncError::configuration("CalDAV integration has no base URL"))?;
        let username = integration
            .username
            .as_deref()
            .ok_or_else(|| SyncError::configuration("CalDAV integration has no username"))?;
        let password = integration
            .password
            .as_deref()
            .ok_or_else(|| SyncError::configuration("CalDAV integration has no password"))?;
        Ok(CaldavTarget {
            server_type: self.server_type.unwrap_or_else(|| detect_from_url(base_url)),
            base_url,
            username,
            password,
        })
    }

    fn report_body(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:getetag/>
    <c:calendar-data/>
  </d:prop>
  <c:filter>
    <c:comp-filter name="VCALENDAR">
      <c:comp-filter name="VEVENT">
        <c:time-range start="{}" end="{}"/>
      </c:comp-filter>
    </c:comp-filter>
  </c:filter>
</c:calendar-query>"#,
            ics::format_utc(&start),
            ics::format_utc(&end)
        )
    }
}

fn check_dav_status(status: StatusCode, body: &str) -> SyncResult<()> {
    // PROPFIND and REPORT answer 207 Multi-Status, which is inside the
    // 2xx success range.
    if status.is_success() {
        return Ok(());
    }
    Err(SyncError::from_status(status, body))
}

#[async_trait]
impl ProviderAdapter for CaldavAdapter {
    async fn list_events(
        &self,
        integration: &CalendarIntegration,
        calendar_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SyncResult<Vec<CalendarEvent>> {
        let target = self.target(integration)?;
        let profile = target.server_type.profile();
        let url = build_calendar_url(target.base_url, profile, target.username, calendar_id);
        let client = self.http.build_client()?;

        let response = client
            .request(dav_method("REPORT"), &url)
            .basic_auth(target.username, Some(target.password))
            .header("Depth", "1")
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(Self::report_body(start, end))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        check_dav_status(status, &body)?;

        let mut events = Vec::new();
        for (href, calendar_data) in xml::parse_report_events(&body)? {
            match ics::parse_events(&calendar_data, calendar_id) {
                Ok(parsed) => events.extend(parsed),
                Err(e) => {
                    log::warn!("Skipping unparseable event at {}: {}", href, e);
                }
            }
        }

        // Servers are not uniformly strict about the time-range filter
        // (Radicale in particular), so re-filter for overlap.
        events.retain(|event| event.start < end && event.end > start);
        Ok(events)
    }

    async fn create_event(
        &self,
        integration: &CalendarIntegration,
        event: &CalendarEvent,
    ) -> SyncResult<String> {
        let target = self.target(integration)?;
        let profile = target.server_type.profile();
        let uid = provider_event_id(integration.provider()?, &event.id);
        let url = build_event_url(
            target.base_url,
            profile,
            target.username,
            &event.calendar_id,
            &uid,
        );

        let mut document_event = event.clone();
        document_event.id = uid.clone();
        let document = ics::build_event_ics(&document_event);

        let client = self.http.build_client()?;
        let response = client
            .put(&url)
            .basic_auth(target.username, Some(target.password))
            .header("Content-Type", "text/calendar; charset=utf-8")
            .header("If-None-Match", "*")
            .body(document)
            .send()
            .await?;

        let status = response.status();
        // Precondition failed: the resource already exists, so this
        // create already happened. Same id, same event.
        if status.as_u16() == 412 {
            return Ok(uid);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status, &body));
        }
        Ok(uid)
    }

    async fn update_event(
        &self,
        integration: &CalendarIntegration,
        event: &CalendarEvent,
    ) -> SyncResult<()> {
        let target = self.target(integration)?;
        let profile = target.server_type.profile();
        let uid = provider_event_id(integration.provider()?, &event.id);
        let url = build_event_url(
            target.base_url,
            profile,
            target.username,
            &event.calendar_id,
            &uid,
        );

        let mut document_event = event.clone();
        document_event.id = uid;
        let document = ics::build_event_ics(&document_event);

        let client = self.http.build_client()?;
        let response = client
            .put(&url)
            .basic_auth(target.username, Some(target.password))
            .header("Content-Type", "text/calendar; charset=utf-8")
            .body(document)
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
        let target = self.target(integration)?;
        let profile = target.server_type.profile();
        let uid = provider_event_id(integration.provider()?, event_id);
        let url = build_event_url(target.base_url, profile, target.username, calendar_id, &uid);

        let client = self.http.build_client()?;
        let response = client
            .delete(&url)
            .basic_auth(target.username, Some(target.password))
            .send()
            .await?;

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
        let target = self.target(integration)?;
        let profile = target.server_type.profile();
        let url = build_discovery_url(target.base_url, profile, target.username);
        let client = HttpConfig::discovery().build_client()?;

        let response = client
            .request(dav_method("PROPFIND"), &url)
            .basic_auth(target.username, Some(target.password))
            .header("Depth", "1")
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(PROPFIND_BODY)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        check_dav_status(status, &body)?;

        let collections = xml::parse_calendar_collections(&body)?;
        Ok(collections
            .into_iter()
            .map(|collection| CalendarEntry {
                name: collection.name(),
                primary: false,
                selected: false,
                color: if profile.supports_calendar_color {
                    collection.color
                } else {
                    None
                },
                id: collection.href,
            })
            .collect())
    }

    async fn refresh_token(&self, _integration: &CalendarIntegration) -> SyncResult<TokenRefresh> {
        Err(SyncError::configuration(
            "CalDAV integrations authenticate with Basic credentials; there is no token to refresh",
        ))
    }

    async fn test_connection(
        &self,
        integration: &CalendarIntegration,
    ) -> SyncResult<ConnectionStatus> {
        let target = self.target(integration)?;
        let profile = target.server_type.profile();
        let url = build_discovery_url(target.base_url, profile, target.username);
        let client = HttpConfig::discovery().build_client()?;

        let response = client
            .request(dav_method("PROPFIND"), &url)
            .basic_auth(target.username, Some(target.password))
            .header("Depth", "0")
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(PROPFIND_BODY)
            .send()
            .await?;

        let status = response.status();
        // A probe can sharpen the dialect guess: response headers are a
        // stronger signal than the URL shape.
        let refined = detect_from_headers(response.headers()).unwrap_or(target.server_type);
        let body = response.text().await.unwrap_or_default();
        check_dav_status(status, &body)?;

        Ok(ConnectionStatus {
            ok: true,
            message: format!("CalDAV server reachable ({})", refined.as_str()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provider;
    use chrono::TimeZone;

    fn caldav_integration() -> CalendarIntegration {
        CalendarIntegration::new_caldav(
            1,
            Provider::Caldav,
            "https://dav.example.com".to_string(),
            "alice".to_string(),
            "hunter2".to_string(),
        )
    }

    #[test]
    fn test_target_requires_credentials() {
        let adapter = CaldavAdapter::generic();
        let mut integration = caldav_integration();
        integration.password = None;
        assert!(matches!(
            adapter.target(&integration),
            Err(SyncError::Configuration(_))
        ));
    }

    #[test]
    fn test_generic_adapter_detects_from_url() {
        let adapter = CaldavAdapter::generic();
        let mut integration = caldav_integration();
        integration.base_url = Some("https://cal.example.com:5232".to_string());
        let target = adapter.target(&integration).unwrap();
        assert_eq!(target.server_type, ServerType::Radicale);
    }

    #[test]
    fn test_pinned_adapter_keeps_server_type() {
        let adapter = CaldavAdapter::for_server(ServerType::Nextcloud);
        let integration = caldav_integration();
        let target = adapter.target(&integration).unwrap();
        assert_eq!(target.server_type, ServerType::Nextcloud);
    }

    #[test]
    fn test_report_body_uses_utc_basic_format() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 8, 0, 0, 0).unwrap();
        let body = CaldavAdapter::report_body(start, end);
        assert!(body.contains(r#"start="20250601T000000Z""#));
        assert!(body.contains(r#"end="20250608T000000Z""#));
        assert!(body.contains(r#"comp-filter name="VEVENT""#));
    }

    #[test]
    fn test_check_dav_status() {
        assert!(check_dav_status(StatusCode::from_u16(207).unwrap(), "").is_ok());
        assert!(check_dav_status(StatusCode::OK, "").is_ok());
        assert!(matches!(
            check_dav_status(StatusCode::UNAUTHORIZED, "denied"),
            Err(SyncError::Permanent(_))
        ));
    }
}
