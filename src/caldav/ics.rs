// RFC 5545 document building and parsing.
//
// Outbound event bodies are built line-by-line so the escaping and the
// UTC basic format stay under our control; inbound bodies go through
// the icalendar crate with timezone-aware datetime conversion.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use icalendar::{Calendar as IcsCalendar, Component, Event as IcsEvent, EventLike};

use crate::error::{SyncError, SyncResult};
use crate::models::CalendarEvent;

const PRODID: &str = "-//calbridge//calendar-sync//EN";

/// Escape TEXT values per RFC 5545 §3.3.11: backslash, semicolon,
/// comma, newline. Backslash must go first.
pub fn escape_text(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(';', "\\;")
        .replace(',', "\\,")
        .replace('\n', "\\n")
        .replace('\r', "")
}

/// UTC basic format: `YYYYMMDDTHHMMSSZ`.
pub fn format_utc(instant: &DateTime<Utc>) -> String {
    instant.format("%Y%m%dT%H%M%SZ").to_string()
}

fn format_date(instant: &DateTime<Utc>) -> String {
    instant.format("%Y%m%d").to_string()
}

/// Build a complete VCALENDAR/VEVENT document for PUT to a CalDAV
/// collection. Exactly one DTSTART/DTEND pair; `VALUE=DATE` form for
/// all-day events.
pub fn build_event_ics(event: &CalendarEvent) -> String {
    let mut lines: Vec<String> = vec![
        "BEGIN:VCALENDAR".to_string(),
        "VERSION:2.0".to_string(),
        format!("PRODID:{}", PRODID),
        "CALSCALE:GREGORIAN".to_string(),
        "BEGIN:VEVENT".to_string(),
        format!("UID:{}", event.id),
        format!("DTSTAMP:{}", format_utc(&Utc::now())),
    ];

    if event.all_day {
        lines.push(format!("DTSTART;VALUE=DATE:{}", format_date(&event.start)));
        lines.push(format!("DTEND;VALUE=DATE:{}", format_date(&event.end)));
    } else {
        lines.push(format!("DTSTART:{}", format_utc(&event.start)));
        lines.push(format!("DTEND:{}", format_utc(&event.end)));
    }

    lines.push(format!("SUMMARY:{}", escape_text(&event.summary)));

    if let Some(ref description) = event.description {
        lines.push(format!("DESCRIPTION:{}", escape_text(description)));
    }
    if let Some(ref location) = event.location {
        lines.push(format!("LOCATION:{}", escape_text(location)));
    }
    for attendee in &event.attendees {
        lines.push(format!(
            "ATTENDEE;PARTSTAT=NEEDS-ACTION:mailto:{}",
            attendee
        ));
    }

    lines.push("END:VEVENT".to_string());
    lines.push("END:VCALENDAR".to_string());

    let mut document = lines.join("\r\n");
    document.push_str("\r\n");
    document
}

/// Parse every VEVENT in an iCalendar document into the uniform shape.
pub fn parse_events(ics_data: &str, calendar_id: &str) -> SyncResult<Vec<CalendarEvent>> {
    let calendar = IcsCalendar::from_str(ics_data)
        .map_err(|e| SyncError::transient(format!("failed to parse iCalendar data: {}", e)))?;

    let mut events = Vec::new();
    for component in calendar.components {
        if let Some(ics_event) = component.as_event() {
            match convert_ics_event(ics_event, calendar_id) {
                Ok(event) => events.push(event),
                Err(e) => {
                    log::warn!("Skipping unparseable VEVENT in '{}': {}", calendar_id, e);
                }
            }
        }
    }

    Ok(events)
}

fn convert_ics_event(ics_event: &IcsEvent, calendar_id: &str) -> Result<CalendarEvent> {
    let summary = ics_event
        .get_summary()
        .unwrap_or("Untitled Event")
        .to_string();

    let all_day = matches!(
        ics_event.get_start(),
        Some(icalendar::DatePerhapsTime::Date(_))
    );

    let start = ics_event
        .get_start()
        .as_ref()
        .and_then(parse_ical_datetime)
        .ok_or_else(|| anyhow!("event missing DTSTART"))?;

    let end = ics_event
        .get_end()
        .as_ref()
        .and_then(parse_ical_datetime)
        .unwrap_or_else(|| start + chrono::Duration::hours(1));

    // A UID is required by the RFC but some feeds omit it; fall back to
    // a stable hash so dedup still works across fetches.
    let id = ics_event.get_uid().map(|uid| uid.to_string()).unwrap_or_else(|| {
        let mut hasher = DefaultHasher::new();
        format!("{}{}", summary, start.timestamp()).hash(&mut hasher);
        format!("caldav-{:x}", hasher.finish())
    });

    let attendees = ics_event
        .multi_properties()
        .iter()
        .filter(|p| p.key() == "ATTENDEE")
        .map(|p| p.value().trim_start_matches("mailto:").to_string())
        .collect();

    Ok(CalendarEvent {
        id,
        calendar_id: calendar_id.to_string(),
        summary,
        description: ics_event.get_description().map(|s| s.to_string()),
        location: ics_event.get_location().map(|s| s.to_string()),
        start,
        end,
        all_day,
        attendees,
    })
}

/// Convert an iCalendar datetime to UTC, honoring TZID where present.
pub fn parse_ical_datetime(dt: &icalendar::DatePerhapsTime) -> Option<DateTime<Utc>> {
    match dt {
        icalendar::DatePerhapsTime::DateTime(dt) => match dt {
            icalendar::CalendarDateTime::Utc(dt) => Some(*dt),

            // Floating time (no timezone specified): interpret as UTC.
            // The aggregate merge compares instants, so a stable reading
            // matters more than guessing the server's locale.
            icalendar::CalendarDateTime::Floating(naive_dt) => Some(Utc.from_utc_datetime(naive_dt)),

            icalendar::CalendarDateTime::WithTimezone { date_time, tzid } => {
                if let Ok(tz) = chrono_tz::Tz::from_str(tzid) {
                    tz.from_local_datetime(date_time)
                        .single()
                        .map(|zoned| zoned.with_timezone(&Utc))
                } else {
                    log::warn!("Unrecognized timezone '{}', treating as UTC", tzid);
                    Some(Utc.from_utc_datetime(date_time))
                }
            }
        },
        icalendar::DatePerhapsTime::Date(date) => {
            Utc.with_ymd_and_hms(date.year(), date.month(), date.day(), 0, 0, 0)
                .single()
        }
    }
}
