/// Dedicated servers API data models
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task status as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    Pending,
    Running,
    InProgress,
    Completed,
    Success,
    Failed,
    Cancelled,
    Unknown(String),
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Unknown(other) => other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl From<String> for TaskStatus {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "in_progress" => TaskStatus::InProgress,
            "completed" => TaskStatus::Completed,
            "success" => TaskStatus::Success,
            "failed" => TaskStatus::Failed,
            "cancelled" | "canceled" => TaskStatus::Cancelled,
            _ => TaskStatus::Unknown(value),
        }
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server lifecycle status, covering both API generations
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ServerStatus {
    Ordering,
    Provisioning,
    Installing,
    Active,
    Starting,
    Stopping,
    Stopped,
    Rebooting,
    Maintenance,
    Error,
    Cancelled,
    Unknown(String),
}

impl ServerStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ServerStatus::Ordering => "ordering",
            ServerStatus::Provisioning => "provisioning",
            ServerStatus::Installing => "installing",
            ServerStatus::Active => "active",
            ServerStatus::Starting => "starting",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Rebooting => "rebooting",
            ServerStatus::Maintenance => "maintenance",
            ServerStatus::Error => "error",
            ServerStatus::Cancelled => "cancelled",
            ServerStatus::Unknown(other) => other,
        }
    }
}

impl From<String> for ServerStatus {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "ordering" => ServerStatus::Ordering,
            "provisioning" => ServerStatus::Provisioning,
            "installing" => ServerStatus::Installing,
            "active" => ServerStatus::Active,
            "starting" => ServerStatus::Starting,
            "stopping" => ServerStatus::Stopping,
            "stopped" => ServerStatus::Stopped,
            "rebooting" => ServerStatus::Rebooting,
            "maintenance" => ServerStatus::Maintenance,
            "error" => ServerStatus::Error,
            "cancelled" | "canceled" => ServerStatus::Cancelled,
            _ => ServerStatus::Unknown(value),
        }
    }
}

impl From<ServerStatus> for String {
    fn from(status: ServerStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Power state of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerStatus {
    On,
    Off,
    #[serde(other)]
    Unknown,
}

/// Asynchronous operation tracked by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "uuid")]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Success)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// Dedicated server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    #[serde(rename = "uuid")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub status: ServerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_status: Option<PowerStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_plan_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemorySpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage: Vec<StorageSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<ServerNetwork>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<ServerOs>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_services: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Server {
    /// A server with the given identity and status and no other details
    pub fn new(id: impl Into<String>, name: impl Into<String>, status: ServerStatus) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status,
            power_status: None,
            service_uuid: None,
            location_uuid: None,
            project_uuid: None,
            price_plan_uuid: None,
            cpu: None,
            memory: None,
            storage: Vec::new(),
            networks: Vec::new(),
            os: None,
            additional_services: Vec::new(),
            tags: BTreeMap::new(),
            created_at: None,
            updated_at: None,
            activated_at: None,
            service: None,
            location: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ServerStatus::Active
    }

    pub fn is_powered_on(&self) -> bool {
        self.power_status == Some(PowerStatus::On)
    }

    /// Every address assigned to the server, in network order
    pub fn ip_addresses(&self) -> Vec<IpAddress> {
        let mut addresses = Vec::new();
        for network in &self.networks {
            for ip in &network.ipv4 {
                addresses.push(IpAddress {
                    address: ip.clone(),
                    network_type: network.network_type,
                    version: IpVersion::V4,
                });
            }
            for ip in &network.ipv6 {
                addresses.push(IpAddress {
                    address: ip.clone(),
                    network_type: network.network_type,
                    version: IpVersion::V6,
                });
            }
        }
        addresses
    }
}

/// Network type of a server attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    #[default]
    Public,
    Private,
}

impl FromStr for NetworkType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(NetworkType::Public),
            "private" => Ok(NetworkType::Private),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown network type '{}', expected public or private",
                other
            ))),
        }
    }
}

/// Network attachment of a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServerNetwork {
    #[serde(rename = "type", default)]
    pub network_type: NetworkType,
    /// Mbps
    #[serde(default)]
    pub bandwidth: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv6: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    V4,
    V6,
}

/// A single address of a server, flattened from its networks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    pub address: String,
    #[serde(rename = "type")]
    pub network_type: NetworkType,
    pub version: IpVersion,
}

/// Operating system assignment of a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServerOs {
    #[serde(rename = "template_uuid", default)]
    pub template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
}

/// Datacenter location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Location {
    #[serde(rename = "uuid")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub available: bool,
}

/// Catalog entry (server configuration, colocation, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Service {
    #[serde(rename = "uuid")]
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub service_type: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemorySpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage: Vec<StorageSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub price_plans: Vec<PricePlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CpuSpec {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub threads: u32,
    #[serde(default)]
    pub frequency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MemorySpec {
    /// GB
    #[serde(default)]
    pub size: u32,
    #[serde(rename = "type", default)]
    pub memory_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecc: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StorageSpec {
    /// hdd, ssd, nvme
    #[serde(rename = "type", default)]
    pub storage_type: String,
    /// GB
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NetworkSpec {
    /// Mbps
    #[serde(default)]
    pub bandwidth: u32,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub ipv4: bool,
    #[serde(default)]
    pub ipv6: bool,
}

/// Pricing plan offered for a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PricePlan {
    #[serde(rename = "uuid")]
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub plan_type: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub period: String,
    #[serde(default)]
    pub setup_fee: f64,
    #[serde(default)]
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Installable operating system image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OsTemplate {
    #[serde(rename = "uuid")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(rename = "type", default)]
    pub os_type: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// GB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_disk_size: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing_keeps_unknown_values() {
        let status: ServerStatus = serde_json::from_str("\"provisioning\"").unwrap();
        assert_eq!(status, ServerStatus::Provisioning);

        let status: ServerStatus = serde_json::from_str("\"migrating\"").unwrap();
        assert_eq!(status, ServerStatus::Unknown("migrating".to_string()));
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"migrating\"");

        let status: TaskStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(status, TaskStatus::InProgress);
        assert!(!status.is_terminal());
    }

    #[test]
    fn test_server_round_trip() {
        let body = r#"{
            "uuid": "0b8f5b3e-5a5c-4c8e-9d5e-2f1c1e0d9a11",
            "name": "db-1",
            "status": "active",
            "power_status": "on",
            "service_uuid": "svc-1",
            "location_uuid": "loc-1",
            "networks": [
                {"type": "public", "bandwidth": 1000, "ipv4": ["203.0.113.10"], "ipv6": ["2001:db8::10"]}
            ],
            "os": {"template_uuid": "os-1", "name": "Debian", "version": "12"},
            "tags": {"env": "prod", "team": "storage"},
            "created_at": "2024-05-01T10:00:00Z"
        }"#;

        let server: Server = serde_json::from_str(body).unwrap();
        assert!(server.is_active());
        assert!(server.is_powered_on());
        assert_eq!(server.tags.get("env").map(String::as_str), Some("prod"));

        let encoded = serde_json::to_string(&server).unwrap();
        let decoded: Server = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, server);
    }

    #[test]
    fn test_ip_addresses_flatten_networks() {
        let mut server = Server::new("s-1", "web", ServerStatus::Active);
        server.networks = vec![
            ServerNetwork {
                network_type: NetworkType::Public,
                ipv4: vec!["203.0.113.5".to_string()],
                ..Default::default()
            },
            ServerNetwork {
                network_type: NetworkType::Private,
                ipv4: vec!["10.0.0.5".to_string()],
                ipv6: vec!["fd00::5".to_string()],
                ..Default::default()
            },
        ];

        let addresses = server.ip_addresses();
        assert_eq!(addresses.len(), 3);
        assert_eq!(addresses[1].network_type, NetworkType::Private);
        assert_eq!(addresses[2].version, IpVersion::V6);
    }

    #[test]
    fn test_task_completion_flags() {
        let task: Task = serde_json::from_str(
            r#"{"uuid": "t-1", "status": "failed", "progress": 60, "error": "disk check failed"}"#,
        )
        .unwrap();
        assert!(task.is_failed());
        assert!(!task.is_completed());
        assert_eq!(task.error.as_deref(), Some("disk check failed"));
    }
}
