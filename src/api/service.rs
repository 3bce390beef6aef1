/// Resource service abstraction over both API generations
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::models::{Location, OsTemplate, PricePlan, Server, Service, Task};
use crate::error::{Error, Result};
use crate::partitions::PartitionsConfig;

/// API generation a client talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiGeneration {
    /// UUID-keyed primary API
    #[default]
    V2,
    /// Integer-keyed legacy API
    Legacy,
}

impl ApiGeneration {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiGeneration::V2 => "v2",
            ApiGeneration::Legacy => "legacy",
        }
    }
}

impl fmt::Display for ApiGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiGeneration {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "v2" => Ok(ApiGeneration::V2),
            "legacy" | "v1" => Ok(ApiGeneration::Legacy),
            other => Err(Error::InvalidConfig(format!(
                "unknown API generation '{}', expected v2 or legacy",
                other
            ))),
        }
    }
}

/// Server identifier tagged with the generation that issued it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerRef {
    pub generation: ApiGeneration,
    pub id: String,
}

impl ServerRef {
    pub fn new(generation: ApiGeneration, id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_id(generation, &id)?;
        Ok(Self { generation, id })
    }

    /// Parse `legacy:42`, `v2:<uuid>`, or a bare id in `default_generation`
    pub fn parse(value: &str, default_generation: ApiGeneration) -> Result<Self> {
        let value = value.trim();
        match value.split_once(':') {
            Some((prefix, id)) => Self::new(prefix.parse()?, id),
            None => Self::new(default_generation, value),
        }
    }
}

impl fmt::Display for ServerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.generation, self.id)
    }
}

/// Ids end up in URL paths, so they are checked before use
pub fn validate_id(generation: ApiGeneration, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidId("identifier is empty".to_string()));
    }
    match generation {
        ApiGeneration::Legacy => {
            id.parse::<u64>()
                .map_err(|_| Error::InvalidId(format!("legacy id '{}' is not an integer", id)))?;
        }
        ApiGeneration::V2 => {
            if !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(Error::InvalidId(format!("malformed id '{}'", id)));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFilter {
    pub service_type: Option<String>,
    pub category: Option<String>,
    pub location_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsTemplateFilter {
    pub location_id: Option<String>,
    pub service_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerFilter {
    pub status: Option<String>,
    pub location_id: Option<String>,
}

/// Everything needed to order a server
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerDraft {
    pub name: String,
    pub location_id: String,
    pub service_id: Option<String>,
    pub price_plan_id: Option<String>,
    pub os_template_id: Option<String>,
    pub ssh_keys: Vec<String>,
    pub user_data: Option<String>,
    pub password: Option<String>,
    pub private_network: bool,
    pub additional_services: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub comment: Option<String>,
    pub partitions: Option<PartitionsConfig>,
}

/// Mutable server fields; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerUpdate {
    pub name: Option<String>,
    pub tags: Option<BTreeMap<String, String>>,
}

impl ServerUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.tags.is_none()
    }
}

/// Result of a create call
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedServer {
    pub server: Server,
    /// Provisioning task, when the backend reports one
    pub task_id: Option<String>,
}

/// Power and lifecycle actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerAction {
    On,
    Off,
    Reboot,
    PowerCycle,
    Reinstall {
        os_template_id: String,
        ssh_keys: Vec<String>,
    },
}

impl PowerAction {
    pub fn name(&self) -> &'static str {
        match self {
            PowerAction::On => "on",
            PowerAction::Off => "off",
            PowerAction::Reboot => "reboot",
            PowerAction::PowerCycle => "power_cycle",
            PowerAction::Reinstall { .. } => "reinstall",
        }
    }

    /// Parse the simple actions accepted by the power resource
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "on" | "start" => Ok(PowerAction::On),
            "off" | "stop" => Ok(PowerAction::Off),
            "reboot" | "restart" => Ok(PowerAction::Reboot),
            "power_cycle" | "power-cycle" => Ok(PowerAction::PowerCycle),
            other => Err(Error::InvalidConfig(format!(
                "unknown power action '{}', expected on, off, reboot or power_cycle",
                other
            ))),
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The narrow capability the waiters poll through
#[async_trait]
pub trait ServerBackend: Send + Sync {
    async fn get_server(&self, cancel: &CancellationToken, id: &str) -> Result<Server>;

    async fn get_task(&self, cancel: &CancellationToken, id: &str) -> Result<Task>;
}

/// Typed operations over every entity the provider manages
#[async_trait]
pub trait ResourceService: ServerBackend {
    fn generation(&self) -> ApiGeneration;

    async fn list_locations(&self, cancel: &CancellationToken) -> Result<Vec<Location>>;

    async fn get_location(&self, cancel: &CancellationToken, id: &str) -> Result<Location>;

    async fn list_services(
        &self,
        cancel: &CancellationToken,
        filter: &ServiceFilter,
    ) -> Result<Vec<Service>>;

    async fn get_service(&self, cancel: &CancellationToken, id: &str) -> Result<Service>;

    async fn list_price_plans(
        &self,
        cancel: &CancellationToken,
        service_id: Option<&str>,
    ) -> Result<Vec<PricePlan>>;

    async fn list_os_templates(
        &self,
        cancel: &CancellationToken,
        filter: &OsTemplateFilter,
    ) -> Result<Vec<OsTemplate>>;

    async fn get_os_template(&self, cancel: &CancellationToken, id: &str) -> Result<OsTemplate>;

    async fn list_servers(
        &self,
        cancel: &CancellationToken,
        filter: &ServerFilter,
    ) -> Result<Vec<Server>>;

    async fn create_server(
        &self,
        cancel: &CancellationToken,
        draft: &ServerDraft,
    ) -> Result<CreatedServer>;

    async fn update_server(
        &self,
        cancel: &CancellationToken,
        id: &str,
        update: &ServerUpdate,
    ) -> Result<Server>;

    async fn delete_server(&self, cancel: &CancellationToken, id: &str) -> Result<()>;

    async fn power_action(
        &self,
        cancel: &CancellationToken,
        id: &str,
        action: &PowerAction,
    ) -> Result<Task>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_ref_parsing() {
        let r = ServerRef::parse("legacy:42", ApiGeneration::V2).unwrap();
        assert_eq!(r.generation, ApiGeneration::Legacy);
        assert_eq!(r.id, "42");
        assert_eq!(r.to_string(), "legacy:42");

        let r = ServerRef::parse("v2:0b8f5b3e-5a5c-4c8e-9d5e-2f1c1e0d9a11", ApiGeneration::Legacy)
            .unwrap();
        assert_eq!(r.generation, ApiGeneration::V2);

        let r = ServerRef::parse("17", ApiGeneration::Legacy).unwrap();
        assert_eq!(r, ServerRef::new(ApiGeneration::Legacy, "17").unwrap());
    }

    #[test]
    fn test_server_ref_rejects_bad_ids() {
        assert!(ServerRef::parse("legacy:abc", ApiGeneration::V2).is_err());
        assert!(ServerRef::parse("v3:42", ApiGeneration::V2).is_err());
        assert!(ServerRef::parse("", ApiGeneration::V2).is_err());
        assert!(ServerRef::parse("v2:../tasks", ApiGeneration::V2).is_err());
    }

    #[test]
    fn test_bare_id_is_not_sniffed() {
        // A short numeric id still belongs to the configured generation
        let r = ServerRef::parse("42", ApiGeneration::V2).unwrap();
        assert_eq!(r.generation, ApiGeneration::V2);
    }

    #[test]
    fn test_power_action_parsing() {
        assert_eq!(PowerAction::parse("start").unwrap(), PowerAction::On);
        assert_eq!(PowerAction::parse("REBOOT").unwrap(), PowerAction::Reboot);
        assert_eq!(PowerAction::parse("power-cycle").unwrap().name(), "power_cycle");
        assert!(PowerAction::parse("hibernate").is_err());
    }
}
