use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use ctxforge_core::config::{AppConfig, ProviderConfig};
use ctxforge_core::error::Result;
use ctxforge_core::traits::ChatProvider;
use ctxforge_core::types::{ChatCompletion, ChatRequest};

use crate::create_client;
use crate::mock::MockChatProvider;

/// Routes each request to the client registered under `request.provider`.
///
/// In mock mode every request goes to one [`MockChatProvider`].
pub struct ProviderRouter {
    clients: HashMap<String, Arc<dyn ChatProvider>>,
    mock: Option<Arc<dyn ChatProvider>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            mock: None,
        }
    }

    /// Every call answered by the mock provider.
    pub fn mock(seed: Option<u64>) -> Self {
        Self {
            clients: HashMap::new(),
            mock: Some(Arc::new(MockChatProvider::new(seed))),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        if config.engine.mock_mode {
            return Ok(Self::mock(config.engine.mock_seed));
        }

        let mut router = Self::new();
        for (name, provider) in &config.providers {
            match create_client(name, provider) {
                Ok(client) => {
                    debug!(provider = %name, "Registered chat provider");
                    router.clients.insert(name.clone(), client);
                }
                Err(e) => warn!(provider = %name, error = %e, "Skipping provider"),
            }
        }
        Ok(router)
    }

    pub fn with_provider(mut self, name: impl Into<String>, client: Arc<dyn ChatProvider>) -> Self {
        self.clients.insert(name.into(), client);
        self
    }

    pub fn is_mock(&self) -> bool {
        self.mock.is_some()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.clients.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    /// Registered client, or one built from defaults for a known provider name.
    fn resolve(&self, name: &str) -> Result<Arc<dyn ChatProvider>> {
        if let Some(mock) = &self.mock {
            return Ok(mock.clone());
        }
        if let Some(client) = self.clients.get(name) {
            return Ok(client.clone());
        }
        create_client(name, &ProviderConfig::default())
    }
}

impl Default for ProviderRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatProvider for ProviderRouter {
    fn complete(&self, request: ChatRequest) -> BoxFuture<'_, Result<ChatCompletion>> {
        Box::pin(async move {
            let client = self.resolve(&request.provider)?;
            client.complete(request).await
        })
    }
}
