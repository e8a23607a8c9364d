//! Seams onto the container runtime and the swarm orchestrator.
//!
//! The drivers only talk to these traits. [`crate::docker::DockerClient`]
//! implements all of them against the local engine.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Container states that count as "using" a volume.
pub const ACTIVE_CONTAINER_STATES: [&str; 3] = ["running", "paused", "restarting"];

/// Summary entry of a container listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
    #[serde(rename = "State", default)]
    pub state: String,
}

/// One mount of an inspected container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerMount {
    pub name: String,
    pub source: String,
    pub destination: String,
    pub driver: String,
}

/// Running containers and the volumes they use.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Containers whose state is one of [`ACTIVE_CONTAINER_STATES`].
    async fn active_containers(&self) -> Result<Vec<ContainerSummary>>;

    async fn container_mounts(&self, id: &str) -> Result<Vec<ContainerMount>>;
}

/// Another manager as seen from this node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmPeer {
    #[serde(rename = "NodeID", default)]
    pub node_id: String,
    /// `host:port` of the manager's swarm endpoint.
    #[serde(rename = "Addr", default)]
    pub addr: String,
}

impl SwarmPeer {
    /// Host part of the address.
    pub fn host(&self) -> &str {
        match self.addr.rsplit_once(':') {
            Some((host, _)) => host,
            None => &self.addr,
        }
    }
}

/// This node's view of the swarm.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwarmInfo {
    pub node_id: String,
    pub node_addr: String,
    pub is_manager: bool,
    pub managers: Vec<SwarmPeer>,
}

/// Role of this node in the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Leader,
    Manager,
    Worker,
}

impl NodeRole {
    pub fn is_manager(&self) -> bool {
        !matches!(self, NodeRole::Worker)
    }
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Fails unless the local node is an active swarm member.
    async fn swarm_info(&self) -> Result<SwarmInfo>;

    async fn is_leader(&self, node_id: &str) -> Result<bool>;

    /// Address of the current leader's swarm endpoint.
    async fn leader_addr(&self) -> Result<String>;

    async fn node_role(&self) -> Result<(SwarmInfo, NodeRole)> {
        let info = self.swarm_info().await?;
        let role = if !info.is_manager {
            NodeRole::Worker
        } else if self.is_leader(&info.node_id).await? {
            NodeRole::Leader
        } else {
            NodeRole::Manager
        };
        Ok((info, role))
    }
}

/// Volume management by driver name, used for the backing volumes of file
/// volumes.
#[async_trait]
pub trait VolumeRuntime: Send + Sync {
    async fn volume_create(
        &self,
        driver: &str,
        name: &str,
        options: &HashMap<String, String>,
    ) -> Result<()>;

    async fn volume_remove(&self, name: &str) -> Result<()>;

    async fn volume_inspect(&self, name: &str) -> Result<()>;
}

/// Definition of a replicated service with one published TCP port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    /// `(volume name, container path)` pairs.
    pub volume_mounts: Vec<(String, String)>,
    pub replicas: u64,
    pub target_port: u16,
}

/// What the orchestrator reports about a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStatus {
    pub id: String,
    pub name: String,
    /// Port published for the first endpoint port, 0 while unassigned.
    pub published_port: u16,
}

#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Creates a service and returns its id.
    async fn service_create(&self, spec: &ServiceSpec) -> Result<String>;

    /// Services whose name starts with `name_prefix`.
    async fn service_list(&self, name_prefix: &str) -> Result<Vec<ServiceStatus>>;

    /// Current state of every task of the service (`running`, `pending`...).
    async fn task_states(&self, service_id: &str) -> Result<Vec<String>>;

    async fn service_remove(&self, service_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VdvsError;

    struct FixedSwarm {
        manager: bool,
        leader: bool,
    }

    #[async_trait]
    impl Orchestrator for FixedSwarm {
        async fn swarm_info(&self) -> Result<SwarmInfo> {
            Ok(SwarmInfo {
                node_id: "n1".into(),
                node_addr: "10.0.0.1".into(),
                is_manager: self.manager,
                managers: vec![],
            })
        }

        async fn is_leader(&self, _node_id: &str) -> Result<bool> {
            if !self.manager {
                return Err(VdvsError::Internal("not a manager".into()));
            }
            Ok(self.leader)
        }

        async fn leader_addr(&self) -> Result<String> {
            Ok("10.0.0.1:2377".into())
        }
    }

    #[tokio::test]
    async fn test_node_role() {
        let roles = [
            (false, false, NodeRole::Worker),
            (true, false, NodeRole::Manager),
            (true, true, NodeRole::Leader),
        ];
        for (manager, leader, expected) in roles {
            let (_, role) = FixedSwarm { manager, leader }.node_role().await.unwrap();
            assert_eq!(role, expected);
        }
        assert!(NodeRole::Leader.is_manager());
        assert!(!NodeRole::Worker.is_manager());
    }

    #[test]
    fn test_peer_host() {
        let peer = SwarmPeer {
            node_id: "x".into(),
            addr: "10.1.2.3:2377".into(),
        };
        assert_eq!(peer.host(), "10.1.2.3");
    }

    #[test]
    fn test_mount_wire_names() {
        let m: ContainerMount = serde_json::from_str(
            r#"{"Name":"vol1","Source":"/mnt/vmdk/vol1@ds","Destination":"/data","Driver":"vsphere","RW":true}"#,
        )
        .unwrap();
        assert_eq!(m.name, "vol1");
        assert_eq!(m.source, "/mnt/vmdk/vol1@ds");
    }
}
