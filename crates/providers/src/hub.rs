//! Process-wide LM client registry.
//!
//! Providers are created lazily, keyed by backend URL, and reused across
//! turns and sessions. A user with a backend override gets a client for
//! that URL; everyone else shares the default. Lifetime is the lifetime of
//! the process; `shutdown` drops all clients explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use cq_domain::error::Result;

use crate::ollama::OllamaProvider;
use crate::traits::LmProvider;

pub struct LmHub {
    default_url: String,
    providers: RwLock<HashMap<String, Arc<dyn LmProvider>>>,
}

impl LmHub {
    pub fn new(default_url: impl Into<String>) -> Self {
        Self {
            default_url: default_url.into(),
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the provider for a user, honouring a per-user URL override.
    pub fn for_user(&self, override_url: Option<&str>) -> Result<Arc<dyn LmProvider>> {
        let url = override_url.unwrap_or(&self.default_url);

        if let Some(provider) = self.providers.read().get(url) {
            return Ok(provider.clone());
        }

        let provider: Arc<dyn LmProvider> = Arc::new(OllamaProvider::new(url)?);
        let mut providers = self.providers.write();
        // A racing caller may have inserted first; keep the existing one.
        let entry = providers.entry(url.to_string()).or_insert(provider).clone();
        Ok(entry)
    }

    /// Install a pre-built provider under a URL key (custom backends,
    /// scripted providers in tests). Replaces any cached client.
    pub fn register(&self, url: impl Into<String>, provider: Arc<dyn LmProvider>) {
        self.providers.write().insert(url.into(), provider);
    }

    /// Drop all cached clients.
    pub fn shutdown(&self) {
        self.providers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_provider_is_shared() {
        let hub = LmHub::new("http://localhost:11434");
        let a = hub.for_user(None).unwrap();
        let b = hub.for_user(None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn override_url_gets_its_own_client() {
        let hub = LmHub::new("http://localhost:11434");
        hub.for_user(None).unwrap();
        hub.for_user(Some("http://10.0.0.5:11434")).unwrap();
        assert_eq!(hub.providers.read().len(), 2);
    }

    #[test]
    fn registered_provider_is_returned_for_its_url() {
        let hub = LmHub::new("http://localhost:11434");
        let custom: Arc<dyn LmProvider> =
            Arc::new(OllamaProvider::new("http://custom:11434").unwrap());
        hub.register("custom://backend", custom.clone());
        let resolved = hub.for_user(Some("custom://backend")).unwrap();
        assert!(Arc::ptr_eq(&resolved, &custom));
    }

    #[test]
    fn shutdown_clears_clients() {
        let hub = LmHub::new("http://localhost:11434");
        hub.for_user(None).unwrap();
        hub.shutdown();
        assert!(hub.providers.read().is_empty());
    }
}
