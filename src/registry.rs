//! Provider registry: the source of truth for which providers exist and are enabled.
//!
//! The engine only ever reads the registry, once per request, to capture the
//! request's [`ProviderSnapshot`](crate::domain::provider::ProviderSnapshot).
//! Administrative changes made afterwards do not affect requests already running.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::provider::{Provider, ProviderId};
use crate::error::{BroadsideError, Result};

/// Read access to the set of enabled providers.
#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    /// Enabled providers, in registration order.
    async fn list_enabled_providers(&self) -> Result<Vec<Provider>>;
}

#[async_trait]
impl<T: ProviderRegistry + ?Sized> ProviderRegistry for Arc<T> {
    async fn list_enabled_providers(&self) -> Result<Vec<Provider>> {
        (**self).list_enabled_providers().await
    }
}

/// Registry held in process memory.
///
/// Cloning shares the underlying list, so an admin handle and the engine can
/// hold the same registry.
#[derive(Clone, Default)]
pub struct InMemoryProviderRegistry {
    providers: Arc<RwLock<Vec<Provider>>>,
    failing_reads: Arc<AtomicUsize>,
}

impl InMemoryProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from providers in registration order.
    pub fn with_providers(providers: impl IntoIterator<Item = Provider>) -> Self {
        let registry = Self::new();
        for provider in providers {
            registry.register(provider);
        }
        registry
    }

    /// Add a provider, or replace the one with the same id in place.
    pub fn register(&self, provider: Provider) {
        let mut providers = self.providers.write();
        match providers.iter_mut().find(|p| p.id == provider.id) {
            Some(existing) => *existing = provider,
            None => providers.push(provider),
        }
    }

    /// Enable or disable a provider for future requests.
    pub fn set_enabled(&self, id: &ProviderId, enabled: bool) -> Result<()> {
        let mut providers = self.providers.write();
        let provider = providers
            .iter_mut()
            .find(|p| &p.id == id)
            .ok_or_else(|| BroadsideError::ProviderNotRegistered(id.clone()))?;
        provider.enabled = enabled;
        tracing::info!(provider_id = %id, enabled, "Provider availability changed");
        Ok(())
    }

    /// Every registered provider, enabled or not.
    pub fn list_all(&self) -> Vec<Provider> {
        self.providers.read().clone()
    }

    /// Make the next `n` reads fail with a storage error.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderRegistry for InMemoryProviderRegistry {
    async fn list_enabled_providers(&self) -> Result<Vec<Provider>> {
        if self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BroadsideError::Storage(anyhow::anyhow!(
                "provider registry unavailable"
            )));
        }

        Ok(self
            .providers
            .read()
            .iter()
            .filter(|p| p.enabled)
            .cloned()
            .collect())
    }
}
