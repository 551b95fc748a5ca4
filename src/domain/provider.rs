//! Provider identities and the per-request provider snapshot.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};

/// Stable identifier of an insurance provider (e.g. "anadolu", "allianz").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(pub String);

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(id: &str) -> Self {
        ProviderId(id.to_string())
    }
}

impl From<String> for ProviderId {
    fn from(id: String) -> Self {
        ProviderId(id)
    }
}

impl std::ops::Deref for ProviderId {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Where and how to reach a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Quote endpoint URL
    pub url: String,

    /// Sent as `Authorization: Bearer ...` when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Per-call timeout for this provider; falls back to the engine default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            timeout_ms: None,
        }
    }
}

/// A registered quote provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub name: String,
    pub endpoint: EndpointConfig,
    pub enabled: bool,
}

impl Provider {
    /// An enabled provider.
    pub fn new(id: impl Into<ProviderId>, name: impl Into<String>, endpoint: EndpointConfig) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            endpoint,
            enabled: true,
        }
    }

    /// This provider with its api key removed.
    pub fn without_credentials(&self) -> Provider {
        let mut provider = self.clone();
        provider.endpoint.api_key = None;
        provider
    }

    /// Fill a missing api key from the registry entry with the same id.
    ///
    /// Providers read back from a persisted snapshot carry no key; this puts
    /// the current one back before they are called again.
    pub fn with_credentials_from(mut self, registered: &[Provider]) -> Provider {
        if self.endpoint.api_key.is_none()
            && let Some(current) = registered.iter().find(|p| p.id == self.id)
        {
            self.endpoint.api_key = current.endpoint.api_key.clone();
        }
        self
    }
}

/// The fixed set of providers a request fans out to.
///
/// Captured once when fan-out starts and never recomputed, so registry changes
/// made while a request is running cannot move its completion target.
///
/// Serializes as a plain list with api keys stripped, so persisting a job never
/// writes credentials next to it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ProviderSnapshot {
    providers: Arc<[Provider]>,
}

impl Default for ProviderSnapshot {
    fn default() -> Self {
        Self {
            providers: Vec::new().into(),
        }
    }
}

impl Serialize for ProviderSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.providers.iter().map(Provider::without_credentials))
    }
}

impl ProviderSnapshot {
    /// Build a snapshot from the registry's ordered listing.
    ///
    /// Duplicate ids keep their first occurrence; disabled entries are dropped.
    pub fn capture(providers: Vec<Provider>) -> Self {
        let mut seen = HashSet::new();
        let providers: Vec<Provider> = providers
            .into_iter()
            .filter(|p| p.enabled && seen.insert(p.id.clone()))
            .collect();
        Self {
            providers: providers.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Provider> {
        self.providers.iter()
    }

    pub fn contains(&self, id: &ProviderId) -> bool {
        self.providers.iter().any(|p| &p.id == id)
    }

    pub fn ids(&self) -> Vec<ProviderId> {
        self.providers.iter().map(|p| p.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: &str) -> Provider {
        Provider::new(id, id.to_uppercase(), EndpointConfig::new(format!("https://{id}.test/quote")))
    }

    #[test]
    fn test_capture_keeps_registry_order_and_drops_duplicates() {
        let mut disabled = provider("sompo");
        disabled.enabled = false;

        let snapshot = ProviderSnapshot::capture(vec![
            provider("axa"),
            provider("allianz"),
            disabled,
            provider("axa"),
            provider("mapfre"),
        ]);

        assert_eq!(
            snapshot.ids(),
            vec![
                ProviderId::from("axa"),
                ProviderId::from("allianz"),
                ProviderId::from("mapfre")
            ]
        );
        assert!(!snapshot.contains(&ProviderId::from("sompo")));
    }

    #[test]
    fn test_snapshot_serializes_as_plain_list() {
        let snapshot = ProviderSnapshot::capture(vec![provider("axa"), provider("allianz")]);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.is_array());

        let back: ProviderSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_snapshot_never_serializes_api_keys() {
        let mut keyed = provider("axa");
        keyed.endpoint.api_key = Some("sk-live-axa".to_string());
        let snapshot = ProviderSnapshot::capture(vec![keyed.clone(), provider("allianz")]);

        let text = serde_json::to_string(&snapshot).unwrap();
        assert!(!text.contains("sk-live-axa"));
        assert!(!text.contains("api_key"));

        let stored: ProviderSnapshot = serde_json::from_str(&text).unwrap();
        let restored: Vec<Provider> = stored
            .iter()
            .cloned()
            .map(|p| p.with_credentials_from(std::slice::from_ref(&keyed)))
            .collect();
        assert_eq!(restored[0], keyed);
        assert_eq!(restored[1].endpoint.api_key, None);
    }
}
