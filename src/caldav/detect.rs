// CalDAV server detection and URL construction.
//
// Classifies an arbitrary CalDAV base URL (and, when available, probe
// response headers) into a server profile without asking the user what
// they are running. Pure functions of their inputs; all the table-driven
// tests live at the bottom.

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Radicale,
    Nextcloud,
    Owncloud,
    Baikal,
    Sabredav,
    Generic,
}

impl ServerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerType::Radicale => "radicale",
            ServerType::Nextcloud => "nextcloud",
            ServerType::Owncloud => "owncloud",
            ServerType::Baikal => "baikal",
            ServerType::Sabredav => "sabredav",
            ServerType::Generic => "generic",
        }
    }

    pub fn profile(&self) -> &'static ServerProfile {
        match self {
            ServerType::Radicale => &RADICALE,
            ServerType::Nextcloud => &NEXTCLOUD,
            ServerType::Owncloud => &OWNCLOUD,
            ServerType::Baikal => &BAIKAL,
            ServerType::Sabredav => &SABREDAV,
            ServerType::Generic => &GENERIC,
        }
    }
}

/// Static per-server-type URL templates and capability flags.
///
/// Templates use `{username}`, `{calendar}` and `{uid}` placeholders;
/// the builders below substitute them and normalize slashes.
#[derive(Debug)]
pub struct ServerProfile {
    pub server_type: ServerType,
    pub discovery_path: &'static str,
    pub calendar_path: &'static str,
    pub event_path: &'static str,
    pub supports_oauth: bool,
    pub supports_calendar_color: bool,
    pub requires_calendar_suffix: bool,
}

static RADICALE: ServerProfile = ServerProfile {
    server_type: ServerType::Radicale,
    discovery_path: "/{username}/",
    calendar_path: "/{username}/{calendar}/",
    event_path: "/{username}/{calendar}/{uid}.ics",
    supports_oauth: false,
    supports_calendar_color: true,
    requires_calendar_suffix: false,
};

static NEXTCLOUD: ServerProfile = ServerProfile {
    server_type: ServerType::Nextcloud,
    discovery_path: "/remote.php/dav/calendars/{username}/",
    calendar_path: "/remote.php/dav/calendars/{username}/{calendar}/",
    event_path: "/remote.php/dav/calendars/{username}/{calendar}/{uid}.ics",
    supports_oauth: true,
    supports_calendar_color: true,
    requires_calendar_suffix: false,
};

static OWNCLOUD: ServerProfile = ServerProfile {
    server_type: ServerType::Owncloud,
    discovery_path: "/remote.php/dav/calendars/{username}/",
    calendar_path: "/remote.php/dav/calendars/{username}/{calendar}/",
    event_path: "/remote.php/dav/calendars/{username}/{calendar}/{uid}.ics",
    supports_oauth: false,
    supports_calendar_color: true,
    requires_calendar_suffix: false,
};

static BAIKAL: ServerProfile = ServerProfile {
    server_type: ServerType::Baikal,
    discovery_path: "/cal.php/calendars/{username}/",
    calendar_path: "/cal.php/calendars/{username}/{calendar}/",
    event_path: "/cal.php/calendars/{username}/{calendar}/{uid}.ics",
    supports_oauth: false,
    supports_calendar_color: false,
    requires_calendar_suffix: true,
};

static SABREDAV: ServerProfile = ServerProfile {
    server_type: ServerType::Sabredav,
    discovery_path: "/server.php/calendars/{username}/",
    calendar_path: "/server.php/calendars/{username}/{calendar}/",
    event_path: "/server.php/calendars/{username}/{calendar}/{uid}.ics",
    supports_oauth: false,
    supports_calendar_color: false,
    requires_calendar_suffix: true,
};

static GENERIC: ServerProfile = ServerProfile {
    server_type: ServerType::Generic,
    discovery_path: "/",
    calendar_path: "/{calendar}/",
    event_path: "/{calendar}/{uid}.ics",
    supports_oauth: false,
    supports_calendar_color: false,
    requires_calendar_suffix: false,
};

const HOST_TOKENS: [(&str, ServerType); 5] = [
    ("radicale", ServerType::Radicale),
    ("nextcloud", ServerType::Nextcloud),
    ("owncloud", ServerType::Owncloud),
    ("baikal", ServerType::Baikal),
    ("sabre", ServerType::Sabredav),
];

/// Classify a base URL by heuristics, most specific first: hostname
/// token, then Radicale's default port, then well-known path markers.
pub fn detect_from_url(raw: &str) -> ServerType {
    let parsed = match Url::parse(raw) {
        Ok(url) => url,
        Err(_) => return ServerType::Generic,
    };

    let host = parsed.host_str().unwrap_or("").to_lowercase();
    for (token, server_type) in HOST_TOKENS {
        if host.contains(token) {
            return server_type;
        }
    }

    if parsed.port() == Some(5232) {
        return ServerType::Radicale;
    }

    let path = parsed.path().to_lowercase();
    if path.contains("/remote.php/dav") || path.contains("/remote.php/webdav") {
        return ServerType::Nextcloud;
    }
    if path.contains("/cal.php") {
        return ServerType::Baikal;
    }
    if path.contains("/server.php") {
        return ServerType::Sabredav;
    }

    ServerType::Generic
}

/// Classify from probe response headers. Returns `None` when nothing
/// matches; callers fall back to `detect_from_url` or ask the user.
pub fn detect_from_headers(headers: &HeaderMap) -> Option<ServerType> {
    if let Some(server) = header_str(headers, "server") {
        let server = server.to_lowercase();
        for (token, server_type) in HOST_TOKENS {
            if server.contains(token) {
                return Some(server_type);
            }
        }
    }

    if let Some(powered_by) = header_str(headers, "x-powered-by") {
        if powered_by.to_lowercase().contains("nextcloud") {
            return Some(ServerType::Nextcloud);
        }
    }

    // A DAV header advertising calendar-access with no vendor signal is
    // still a usable CalDAV endpoint.
    if let Some(dav) = header_str(headers, "dav") {
        if dav.to_lowercase().contains("calendar-access") {
            return Some(ServerType::Generic);
        }
    }

    None
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

pub fn build_discovery_url(base_url: &str, profile: &ServerProfile, username: &str) -> String {
    let path = profile
        .discovery_path
        .replace("{username}", username.trim_matches('/'));
    join_base(base_url, &path)
}

pub fn build_calendar_url(
    base_url: &str,
    profile: &ServerProfile,
    username: &str,
    calendar: &str,
) -> String {
    // Discovery hrefs come back as absolute server paths; respect them
    // instead of re-templating.
    if calendar.starts_with('/') {
        return join_origin(base_url, calendar);
    }
    let calendar = effective_calendar(profile, calendar);
    let path = profile
        .calendar_path
        .replace("{username}", username.trim_matches('/'))
        .replace("{calendar}", calendar.trim_matches('/'));
    join_base(base_url, &path)
}

pub fn build_event_url(
    base_url: &str,
    profile: &ServerProfile,
    username: &str,
    calendar: &str,
    uid: &str,
) -> String {
    // Never double the .ics suffix when the uid already carries one.
    let uid_ics = if uid.ends_with(".ics") {
        uid.to_string()
    } else {
        format!("{}.ics", uid)
    };

    if calendar.starts_with('/') {
        let collection = join_origin(base_url, calendar);
        return format!("{}/{}", collection.trim_end_matches('/'), uid_ics);
    }

    let calendar = effective_calendar(profile, calendar);
    let path = profile
        .event_path
        .replace("{username}", username.trim_matches('/'))
        .replace("{calendar}", calendar.trim_matches('/'))
        .replace("{uid}.ics", &uid_ics);
    join_base(base_url, &path)
}

fn effective_calendar<'a>(profile: &ServerProfile, calendar: &'a str) -> &'a str {
    // Baikal and plain SabreDAV address the initial calendar as a
    // literal "default" collection.
    if calendar.is_empty() && profile.requires_calendar_suffix {
        "default"
    } else {
        calendar
    }
}

fn join_base(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn join_origin(base_url: &str, absolute_path: &str) -> String {
    let origin = match Url::parse(base_url) {
        Ok(url) => {
            let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or(""));
            if let Some(port) = url.port() {
                origin.push_str(&format!(":{}", port));
            }
            origin
        }
        Err(_) => base_url.trim_end_matches('/').to_string(),
    };
    format!("{}/{}", origin, absolute_path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn test_detect_from_url_hostname_tokens() {
        let cases = [
            ("https://radicale.example.com/dav/", ServerType::Radicale),
            ("https://nextcloud.example.com/", ServerType::Nextcloud),
            ("https://owncloud.corp.net/", ServerType::Owncloud),
            ("https://baikal.home.lan/", ServerType::Baikal),
            ("https://sabre.example.org/", ServerType::Sabredav),
        ];
        for (url, expected) in cases {
            assert_eq!(detect_from_url(url), expected, "url: {}", url);
        }
    }

    #[test]
    fn test_detect_from_url_radicale_port() {
        assert_eq!(
            detect_from_url("https://cal.example.com:5232"),
            ServerType::Radicale
        );
    }

    #[test]
    fn test_detect_from_url_path_markers() {
        assert_eq!(
            detect_from_url("https://x.com/remote.php/dav"),
            ServerType::Nextcloud
        );
        assert_eq!(
            detect_from_url("https://x.com/remote.php/webdav/cal"),
            ServerType::Nextcloud
        );
        assert_eq!(
            detect_from_url("https://x.com/dav/cal.php/calendars"),
            ServerType::Baikal
        );
        assert_eq!(
            detect_from_url("https://x.com/server.php/calendars"),
            ServerType::Sabredav
        );
    }

    #[test]
    fn test_detect_from_url_hostname_beats_path() {
        // Hostname token is the more specific signal.
        assert_eq!(
            detect_from_url("https://baikal.example.com/remote.php/dav"),
            ServerType::Baikal
        );
    }

    #[test]
    fn test_detect_from_url_unmatched_is_generic() {
        assert_eq!(
            detect_from_url("https://dav.example.com/calendars/"),
            ServerType::Generic
        );
        assert_eq!(detect_from_url("not a url"), ServerType::Generic);
    }

    #[test]
    fn test_detect_from_headers_server_token() {
        let mut headers = HeaderMap::new();
        headers.insert("server", HeaderValue::from_static("Radicale/3.1.8"));
        assert_eq!(detect_from_headers(&headers), Some(ServerType::Radicale));
    }

    #[test]
    fn test_detect_from_headers_powered_by_nextcloud() {
        let mut headers = HeaderMap::new();
        headers.insert("x-powered-by", HeaderValue::from_static("Nextcloud"));
        assert_eq!(detect_from_headers(&headers), Some(ServerType::Nextcloud));
    }

    #[test]
    fn test_detect_from_headers_dav_only_is_generic() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "dav",
            HeaderValue::from_static("1, 3, calendar-access, calendar-schedule"),
        );
        assert_eq!(detect_from_headers(&headers), Some(ServerType::Generic));
    }

    #[test]
    fn test_detect_from_headers_no_signal() {
        let mut headers = HeaderMap::new();
        headers.insert("server", HeaderValue::from_static("nginx/1.25"));
        assert_eq!(detect_from_headers(&headers), None);
    }

    #[test]
    fn test_build_discovery_url() {
        let profile = ServerType::Nextcloud.profile();
        assert_eq!(
            build_discovery_url("https://cloud.example.com/", profile, "alice"),
            "https://cloud.example.com/remote.php/dav/calendars/alice/"
        );
    }

    #[test]
    fn test_build_event_url_appends_ics_once() {
        let profile = ServerType::Radicale.profile();
        let with_suffix =
            build_event_url("https://cal.example.com:5232", profile, "alice", "work", "abc.ics");
        let without_suffix =
            build_event_url("https://cal.example.com:5232", profile, "alice", "work", "abc");
        assert_eq!(with_suffix, without_suffix);
        assert!(with_suffix.ends_with("/alice/work/abc.ics"));
        assert!(!with_suffix.contains(".ics.ics"));
    }

    #[test]
    fn test_build_calendar_url_with_absolute_href() {
        let profile = ServerType::Generic.profile();
        assert_eq!(
            build_calendar_url(
                "https://dav.example.com/principal/",
                profile,
                "alice",
                "/calendars/alice/work/"
            ),
            "https://dav.example.com/calendars/alice/work/"
        );
    }

    #[test]
    fn test_baikal_default_calendar_suffix() {
        let profile = ServerType::Baikal.profile();
        let url = build_calendar_url("https://baikal.example.com", profile, "alice", "");
        assert_eq!(
            url,
            "https://baikal.example.com/cal.php/calendars/alice/default/"
        );
    }

    #[test]
    fn test_profiles_capability_flags() {
        assert!(ServerType::Nextcloud.profile().supports_oauth);
        assert!(!ServerType::Radicale.profile().supports_oauth);
        assert!(ServerType::Owncloud.profile().supports_calendar_color);
        assert!(ServerType::Baikal.profile().requires_calendar_suffix);
    }
}
