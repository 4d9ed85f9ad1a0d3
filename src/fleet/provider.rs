use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{Fleet, Node};
use crate::error::{FleetError, Result};
use crate::retry::{retry, RetryPolicy};

pub const MAX_FLEET_SIZE: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateFleetRequest {
    pub name: String,
    pub count: usize,
    pub region: String,
    pub image: String,
    pub size: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ssh_user: String,
    /// Public key in authorized_keys form, installed on every node.
    #[serde(default)]
    pub ssh_key: String,
    /// Opaque bootstrap script handed to the provider as-is.
    #[serde(default)]
    pub user_data: String,
}

impl CreateFleetRequest {
    pub fn new(name: impl Into<String>, count: usize) -> Self {
        Self {
            name: name.into(),
            count,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FleetError::Config("fleet name is required".to_string()));
        }
        if self.count == 0 || self.count > MAX_FLEET_SIZE {
            return Err(FleetError::Config(format!(
                "fleet count must be between 1 and {}, got {}",
                MAX_FLEET_SIZE, self.count
            )));
        }
        Ok(())
    }
}

/// Capability to manage fleets on some backend.
///
/// Calls may be slow, rate limited and eventually consistent: a node returned by
/// `create_fleet` is not guaranteed to show up in an immediate `list_nodes`.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn create_fleet(&self, req: &CreateFleetRequest) -> Result<Fleet>;

    async fn list_nodes(&self, fleet: &str) -> Result<Vec<Node>>;

    async fn delete_fleet(&self, fleet: &str) -> Result<()>;
}

/// Providers by name. Filled once at startup.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        tracing::debug!(provider = %name, "Registered provider");
        self.providers.insert(name, provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::ProviderNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Wraps a provider so transient failures (rate limits, 5xx, dropped
/// connections) are retried with exponential backoff and jitter.
pub struct RetryingProvider<P> {
    inner: P,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<P: Provider> RetryingProvider<P> {
    pub fn new(inner: P, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            inner,
            policy,
            cancel,
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: Provider> Provider for RetryingProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn create_fleet(&self, req: &CreateFleetRequest) -> Result<Fleet> {
        req.validate()?;
        retry(&self.policy, &self.cancel, "create_fleet", || {
            self.inner.create_fleet(req)
        })
        .await
    }

    async fn list_nodes(&self, fleet: &str) -> Result<Vec<Node>> {
        retry(&self.policy, &self.cancel, "list_nodes", || {
            self.inner.list_nodes(fleet)
        })
        .await
    }

    async fn delete_fleet(&self, fleet: &str) -> Result<()> {
        retry(&self.policy, &self.cancel, "delete_fleet", || {
            self.inner.delete_fleet(fleet)
        })
        .await
    }
}
