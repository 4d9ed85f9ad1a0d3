use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{CreateFleetRequest, Fleet, Node, Provider};
use crate::error::Result;

/// A pre-existing host reachable over SSH.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalHost {
    pub name: String,
    pub address: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_user() -> String {
    "gx".to_string()
}

fn default_port() -> u16 {
    22
}

/// Attaches hosts that already exist instead of provisioning new ones.
///
/// Creating a fleet lists the configured hosts; deleting one is a no-op.
#[derive(Debug, Clone, Default)]
pub struct LocalSshProvider {
    hosts: Vec<LocalHost>,
}

impl LocalSshProvider {
    pub fn new(hosts: Vec<LocalHost>) -> Self {
        Self { hosts }
    }
}

#[async_trait]
impl Provider for LocalSshProvider {
    fn name(&self) -> &str {
        "localssh"
    }

    async fn create_fleet(&self, req: &CreateFleetRequest) -> Result<Fleet> {
        let nodes = self.list_nodes(&req.name).await?;
        tracing::info!(fleet = %req.name, nodes = nodes.len(), "Attached existing hosts");
        Ok(Fleet::new(req.name.clone(), nodes))
    }

    async fn list_nodes(&self, _fleet: &str) -> Result<Vec<Node>> {
        Ok(self
            .hosts
            .iter()
            .map(|h| Node {
                id: format!("local-{}", h.name),
                name: h.name.clone(),
                address: h.address.clone(),
                ssh_user: h.user.clone(),
                ssh_port: h.port,
            })
            .collect())
    }

    async fn delete_fleet(&self, fleet: &str) -> Result<()> {
        tracing::debug!(fleet, "Nothing to delete for attached hosts");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attaches_configured_hosts() {
        let provider = LocalSshProvider::new(vec![
            LocalHost {
                name: "a".to_string(),
                address: "10.0.0.1".to_string(),
                user: "ops".to_string(),
                port: 2222,
            },
            LocalHost {
                name: "b".to_string(),
                address: "10.0.0.2".to_string(),
                user: default_user(),
                port: default_port(),
            },
        ]);

        let fleet = provider
            .create_fleet(&CreateFleetRequest::new("burst", 2))
            .await
            .unwrap();
        assert_eq!(fleet.name, "burst");
        assert_eq!(fleet.len(), 2);
        assert_eq!(fleet.nodes[0].id, "local-a");
        assert_eq!(fleet.nodes[0].ssh_port, 2222);
        assert_eq!(fleet.nodes[1].ssh_user, "gx");

        provider.delete_fleet("burst").await.unwrap();
    }

    #[test]
    fn hosts_parse_from_yaml_with_defaults() {
        let hosts: Vec<LocalHost> =
            serde_yaml::from_str("- name: a\n  address: 10.0.0.1\n").unwrap();
        assert_eq!(hosts[0].user, "gx");
        assert_eq!(hosts[0].port, 22);
    }
}
