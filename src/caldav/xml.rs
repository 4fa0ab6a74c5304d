// WebDAV multistatus parsing.
//
// A streaming parser over the PROPFIND/REPORT responses. Matching is on
// local element names so `<d:response>`, `<D:response>` and namespaced
// variants from different servers all parse the same way.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{SyncError, SyncResult};

/// One collection entry from a PROPFIND discovery response.
#[derive(Debug, Clone, PartialEq)]
pub struct DavCollection {
    pub href: String,
    pub display_name: Option<String>,
    pub is_calendar: bool,
    pub color: Option<String>,
}

impl DavCollection {
    /// Display name with fallback to the last path segment, the same
    /// rule servers apply when a collection was never named.
    pub fn name(&self) -> String {
        match &self.display_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => path_derived_name(&self.href),
        }
    }
}

fn path_derived_name(href: &str) -> String {
    href.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(href)
        .to_string()
}

#[derive(Default)]
struct ResponseState {
    href: String,
    display_name: Option<String>,
    is_calendar: bool,
    color: Option<String>,
    calendar_data: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    None,
    Href,
    DisplayName,
    ResourceType,
    Color,
    CalendarData,
}

/// Parse the calendar collections out of a PROPFIND multistatus body.
/// Non-calendar resources (the home collection itself, address books,
/// subscriptions) are filtered out by their `resourcetype`.
pub fn parse_calendar_collections(xml: &str) -> SyncResult<Vec<DavCollection>> {
    let responses = parse_responses(xml)?;
    Ok(responses
        .into_iter()
        .filter(|r| r.is_calendar)
        .map(|r| DavCollection {
            href: r.href,
            display_name: r.display_name,
            is_calendar: true,
            color: r.color,
        })
        .collect())
}

/// Parse `(href, calendar-data)` pairs out of a REPORT calendar-query
/// multistatus body. Entries without inline calendar data are skipped.
pub fn parse_report_events(xml: &str) -> SyncResult<Vec<(String, String)>> {
    let responses = parse_responses(xml)?;
    Ok(responses
        .into_iter()
        .filter_map(|r| r.calendar_data.map(|data| (r.href, data)))
        .collect())
}

fn parse_responses(xml: &str) -> SyncResult<Vec<ResponseState>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut responses = Vec::new();
    let mut current = ResponseState::default();
    let mut field = Field::None;
    let mut in_resourcetype = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| SyncError::transient(format!("malformed multistatus XML: {}", e)))?;
        match event {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"response" => current = ResponseState::default(),
                b"href" => field = Field::Href,
                b"displayname" => field = Field::DisplayName,
                b"resourcetype" => {
                    in_resourcetype = true;
                    field = Field::ResourceType;
                }
                b"calendar-color" => field = Field::Color,
                b"calendar-data" => field = Field::CalendarData,
                b"calendar" if in_resourcetype => current.is_calendar = true,
                _ => {}
            },
            // Empty elements carry no text and produce no End event, so
            // they must not change the text-field tracking.
            Event::Empty(ref e) => {
                if in_resourcetype && e.local_name().as_ref() == b"calendar" {
                    current.is_calendar = true;
                }
            }
            Event::Text(ref t) => {
                let text = t
                    .unescape()
                    .map_err(|e| SyncError::transient(format!("malformed multistatus XML: {}", e)))?;
                append_field(&mut current, field, &text);
            }
            Event::CData(t) => {
                let text = String::from_utf8_lossy(&t.into_inner()).to_string();
                append_field(&mut current, field, &text);
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"response" => {
                    responses.push(std::mem::take(&mut current));
                }
                b"resourcetype" => {
                    in_resourcetype = false;
                    field = Field::None;
                }
                b"href" | b"displayname" | b"calendar-color" | b"calendar-data" => {
                    field = Field::None;
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(responses)
}

fn append_field(current: &mut ResponseState, field: Field, text: &str) {
    match field {
        Field::Href => current.href.push_str(text),
        Field::DisplayName => {
            current
                .display_name
                .get_or_insert_with(String::new)
                .push_str(text);
        }
        Field::Color => {
            current.color.get_or_insert_with(String::new).push_str(text);
        }
        Field::CalendarData => {
            current
                .calendar_data
                .get_or_insert_with(String::new)
                .push_str(text);
        }
        Field::ResourceType | Field::None => {}
    }
}
