// CalDAV wire-format support: server detection with per-server URL
// templates, multistatus XML parsing, and RFC 5545 document handling.

pub mod detect;
pub mod ics;
pub mod xml;

pub use detect::{
    build_calendar_url, build_discovery_url, build_event_url, detect_from_headers,
    detect_from_url, ServerProfile, ServerType,
};
