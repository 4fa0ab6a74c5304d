// file: src/models/integration.rs
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Outlook,
    Caldav,
    Nextcloud,
    Owncloud,
    Radicale,
    Baikal,
    Sabredav,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Outlook => "outlook",
            Provider::Caldav => "caldav",
            Provider::Nextcloud => "nextcloud",
            Provider::Owncloud => "owncloud",
            Provider::Radicale => "radicale",
            Provider::Baikal => "baikal",
            Provider::Sabredav => "sabredav",
        }
    }

    pub fn from_str(s: &str) -> Result<Provider, SyncError> {
        match s {
            "google" => Ok(Provider::Google),
            "outlook" => Ok(Provider::Outlook),
            "caldav" => Ok(Provider::Caldav),
            "nextcloud" => Ok(Provider::Nextcloud),
            "owncloud" => Ok(Provider::Owncloud),
            "radicale" => Ok(Provider::Radicale),
            "baikal" => Ok(Provider::Baikal),
            "sabredav" => Ok(Provider::Sabredav),
            other => Err(SyncError::configuration(format!(
                "unknown provider: {}",
                other
            ))),
        }
    }

    /// OAuth/REST providers hold rotating tokens; the CalDAV family
    /// authenticates with static HTTP Basic credentials.
    pub fn is_oauth(&self) -> bool {
        matches!(self, Provider::Google | Provider::Outlook)
    }

    pub fn is_caldav(&self) -> bool {
        !self.is_oauth()
    }

    pub fn all() -> [Provider; 8] {
        [
            Provider::Google,
            Provider::Outlook,
            Provider::Caldav,
            Provider::Nextcloud,
            Provider::Owncloud,
            Provider::Radicale,
            Provider::Baikal,
            Provider::Sabredav,
        ]
    }
}

/// One calendar within an integration, as returned by discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEntry {
    /// Provider id for OAuth providers, collection path for CalDAV.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub selected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl CalendarEntry {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            primary: false,
            selected: false,
            color: None,
        }
    }
}

/// A stored connection between a user and one calendar provider
/// account/server.
#[derive(Clone, Serialize, Deserialize)]
pub struct CalendarIntegration {
    pub id: Option<i64>,
    pub user_id: i64,
    pub provider: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub oauth_scope: Option<String>,
    // CalDAV-family credentials
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub calendar_list: Vec<CalendarEntry>,
    pub default_booking_calendar_id: Option<String>,
    pub is_active: bool,
    pub sync_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CalendarIntegration {
    pub fn new_oauth(
        user_id: i64,
        provider: Provider,
        access_token: String,
        refresh_token: Option<String>,
        expires_in_secs: i64,
        oauth_scope: Option<String>,
    ) -> Self {
        Self {
            id: None,
            user_id,
            provider: provider.as_str().to_string(),
            access_token: Some(access_token),
            refresh_token,
            token_expires_at: Some(Utc::now() + Duration::seconds(expires_in_secs)),
            oauth_scope,
            base_url: None,
            username: None,
            password: None,
            calendar_list: Vec::new(),
            default_booking_calendar_id: None,
            is_active: true,
            sync_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn new_caldav(
        user_id: i64,
        provider: Provider,
        base_url: String,
        username: String,
        password: String,
    ) -> Self {
        Self {
            id: None,
            user_id,
            provider: provider.as_str().to_string(),
            access_token: None,
            refresh_token: None,
            token_expires_at: None,
            oauth_scope: None,
            base_url: Some(base_url),
            username: Some(username),
            password: Some(password),
            calendar_list: Vec::new(),
            default_booking_calendar_id: None,
            is_active: true,
            sync_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn provider(&self) -> Result<Provider, SyncError> {
        Provider::from_str(&self.provider)
    }

    /// True when the access token expires within `buffer_secs` (or the
    /// expiry was never recorded, which forces a refresh to find out).
    pub fn token_expires_within(&self, buffer_secs: i64) -> bool {
        match self.token_expires_at {
            Some(expires_at) => expires_at <= Utc::now() + Duration::seconds(buffer_secs),
            None => true,
        }
    }

    pub fn selected_calendars(&self) -> Vec<&CalendarEntry> {
        self.calendar_list.iter().filter(|c| c.selected).collect()
    }
}

// Tokens and passwords must never reach logs in plaintext, so Debug
// redacts them instead of relying on call-site discipline.
impl std::fmt::Debug for CalendarIntegration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalendarIntegration")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("access_token", &self.access_token.as_deref().map(redact))
            .field("refresh_token", &self.refresh_token.as_deref().map(redact))
            .field("token_expires_at", &self.token_expires_at)
            .field("oauth_scope", &self.oauth_scope)
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_deref().map(redact))
            .field("calendar_list", &self.calendar_list)
            .field(
                "default_booking_calendar_id",
                &self.default_booking_calendar_id,
            )
            .field("is_active", &self.is_active)
            .field("sync_error", &self.sync_error)
            .field("created_at", &self.created_at)
            .finish()
    }
}

pub(crate) fn redact(secret: &str) -> String {
    if secret.len() <= 4 {
        return "****".to_string();
    }
    format!("{}****", &secret[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_round_trip() {
        for provider in Provider::all() {
            assert_eq!(Provider::from_str(provider.as_str()).unwrap(), provider);
        }
    }

    #[test]
    fn test_provider_from_str_unknown() {
        assert!(Provider::from_str("fastmail").is_err());
    }

    #[test]
    fn test_provider_families() {
        assert!(Provider::Google.is_oauth());
        assert!(Provider::Outlook.is_oauth());
        assert!(Provider::Radicale.is_caldav());
        assert!(!Provider::Nextcloud.is_oauth());
    }

    #[test]
    fn test_token_expires_within() {
        let mut integration = CalendarIntegration::new_oauth(
            1,
            Provider::Google,
            "token".to_string(),
            Some("refresh".to_string()),
            3600,
            None,
        );
        assert!(!integration.token_expires_within(300));
        assert!(integration.token_expires_within(4000));

        integration.token_expires_at = None;
        assert!(integration.token_expires_within(300));
    }

    #[test]
    fn test_selected_calendars() {
        let mut integration = CalendarIntegration::new_caldav(
            1,
            Provider::Nextcloud,
            "https://cloud.example.com".to_string(),
            "alice".to_string(),
            "hunter2".to_string(),
        );
        integration.calendar_list = vec![
            CalendarEntry {
                selected: true,
                ..CalendarEntry::new("work", "Work")
            },
            CalendarEntry::new("home", "Home"),
        ];
        let selected = integration.selected_calendars();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "work");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let integration = CalendarIntegration::new_oauth(
            1,
            Provider::Google,
            "ya29.super-secret-access-token".to_string(),
            Some("1//refresh-secret".to_string()),
            3600,
            None,
        );
        let dump = format!("{:?}", integration);
        assert!(!dump.contains("super-secret"));
        assert!(!dump.contains("refresh-secret"));
        assert!(dump.contains("ya29****"));
    }

    #[test]
    fn test_calendar_entry_json_round_trip() {
        let entry = CalendarEntry {
            primary: true,
            selected: true,
            color: Some("#0082c9".to_string()),
            ..CalendarEntry::new("personal", "Personal")
        };
        let json = serde_json::to_string(&entry).unwrap();
        let parsed: CalendarEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }
}
