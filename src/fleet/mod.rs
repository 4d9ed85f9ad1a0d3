//! Fleets and the providers that create, list and delete them.

mod localssh;
mod provider;

pub use localssh::{LocalHost, LocalSshProvider};
pub use provider::{CreateFleetRequest, Provider, ProviderRegistry, RetryingProvider, MAX_FLEET_SIZE};

use std::fmt;

use serde::{Deserialize, Serialize};

/// One remote machine. Immutable once returned by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    /// IP address or hostname.
    pub address: String,
    pub ssh_user: String,
    pub ssh_port: u16,
}

impl Node {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            address: address.into(),
            ssh_user: "gx".to_string(),
            ssh_port: 22,
        }
    }

    pub fn with_ssh(mut self, user: impl Into<String>, port: u16) -> Self {
        self.ssh_user = user.into();
        self.ssh_port = port;
        self
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// A named, ordered set of nodes. Never persisted; re-resolve with
/// [`Provider::list_nodes`] before each use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fleet {
    pub name: String,
    pub nodes: Vec<Node>,
}

impl Fleet {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
