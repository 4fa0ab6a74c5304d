// Provider-legal event identifiers.
//
// Internal booking UUIDs are transformed deterministically so the same
// booking always addresses the same external event, which is what makes
// create/update/delete idempotent against every provider.

use crate::models::Provider;

/// Maximum identifier length accepted by the provider's API.
fn max_id_len(provider: Provider) -> usize {
    match provider {
        // Google event ids: 5-1024 chars of base32hex
        Provider::Google => 1024,
        // Graph keeps ids opaque; transactionId is capped at 255
        Provider::Outlook => 255,
        // CalDAV UIDs become path segments; stay under common limits
        _ => 255,
    }
}

/// Normalize an internal id into the provider's legal alphabet:
/// lowercase, hyphens stripped, truncated. Idempotent by construction.
pub fn provider_event_id(provider: Provider, internal_id: &str) -> String {
    let normalized: String = internal_id
        .to_lowercase()
        .chars()
        .filter(|c| *c != '-')
        .collect();
    normalized.chars().take(max_id_len(provider)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_normalization_strips_hyphens_and_lowercases() {
        let id = provider_event_id(Provider::Google, "A1B2C3D4-E5F6-7890-ABCD-EF1234567890");
        assert_eq!(id, "a1b2c3d4e5f67890abcdef1234567890");
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let uuid = Uuid::new_v4().to_string();
        let once = provider_event_id(Provider::Outlook, &uuid);
        let twice = provider_event_id(Provider::Outlook, &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_same_uuid_same_id() {
        let uuid = Uuid::new_v4().to_string();
        assert_eq!(
            provider_event_id(Provider::Google, &uuid),
            provider_event_id(Provider::Google, &uuid)
        );
    }

    #[test]
    fn test_truncation() {
        let long = "x".repeat(2000);
        assert_eq!(provider_event_id(Provider::Google, &long).len(), 1024);
        assert_eq!(provider_event_id(Provider::Radicale, &long).len(), 255);
    }

    #[test]
    fn test_google_alphabet_from_uuid() {
        // UUID hex is a subset of base32hex, so normalized UUIDs are
        // legal Google event ids as-is.
        let id = provider_event_id(Provider::Google, &Uuid::new_v4().to_string());
        assert!(id.chars().all(|c| matches!(c, 'a'..='v' | '0'..='9')));
    }
}
