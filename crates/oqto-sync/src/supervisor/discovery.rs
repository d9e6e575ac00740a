//! Where the servers are.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::DiscoveryError;

/// One reachable server and the directory it serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerEndpoint {
    #[serde(alias = "url", rename = "baseUrl")]
    pub base_url: String,
    pub directory: String,
}

impl ServerEndpoint {
    pub fn new(base_url: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            directory: directory.into(),
        }
    }

    /// Reject endpoints that cannot be connected to.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        let url = self.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(DiscoveryError::InvalidEndpoint {
                url: self.base_url.clone(),
                reason: "expected an http:// or https:// URL".to_string(),
            });
        }
        Ok(())
    }
}

/// Source of truth for which connections should exist.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<ServerEndpoint>, DiscoveryError>;
}

/// A fixed list, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    endpoints: RwLock<Vec<ServerEndpoint>>,
}

impl StaticDiscovery {
    pub fn new(endpoints: Vec<ServerEndpoint>) -> Self {
        Self {
            endpoints: RwLock::new(endpoints),
        }
    }

    /// Swap the list. Takes effect at the next discovery pass.
    pub async fn replace(&self, endpoints: Vec<ServerEndpoint>) {
        *self.endpoints.write().await = endpoints;
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<ServerEndpoint>, DiscoveryError> {
        let endpoints = self.endpoints.read().await.clone();
        for endpoint in &endpoints {
            endpoint.validate()?;
        }
        Ok(endpoints)
    }
}
