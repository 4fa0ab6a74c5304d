// file: src/models/event.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The uniform event shape every adapter translates to and from.
///
/// `id` is the provider-native identifier. For events created by us it
/// is the normalized form of the internal UUID (see `providers::ids`),
/// so the same booking always maps to the same external event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub calendar_id: String,
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub all_day: bool,
    pub attendees: Vec<String>,
}

impl CalendarEvent {
    pub fn new(
        id: impl Into<String>,
        calendar_id: impl Into<String>,
        summary: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            calendar_id: calendar_id.into(),
            summary: summary.into(),
            description: None,
            location: None,
            start,
            end,
            all_day: false,
            attendees: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_defaults() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let event = CalendarEvent::new("abc", "primary", "Standup", start, end);
        assert!(!event.all_day);
        assert!(event.attendees.is_empty());
        assert_eq!(event.calendar_id, "primary");
    }
}
