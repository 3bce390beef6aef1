/// Legacy (integer-keyed) dedicated servers API client
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::decode::{decode, expect_success};
use super::models::{
    CpuSpec, Location, MemorySpec, NetworkType, OsTemplate, PricePlan, Server, ServerNetwork,
    ServerOs, ServerStatus, Service, StorageSpec, Task, TaskStatus,
};
use super::service::{
    validate_id, ApiGeneration, CreatedServer, OsTemplateFilter, PowerAction, ResourceService,
    ServerBackend, ServerDraft, ServerFilter, ServerUpdate, ServiceFilter,
};
use super::transport::{ApiRequest, Transport};
use crate::error::{Error, Result};

pub const DEFAULT_ENDPOINT: &str = "https://api.selectel.ru/servers/v2";

/// `{"data": ...}` envelope used by server, task and configuration endpoints
#[derive(Deserialize)]
struct Data<T> {
    data: T,
}

/// `{"result": [...]}` envelope used by catalog endpoints
#[derive(Deserialize)]
struct ResultList<T> {
    #[serde(default = "Vec::new")]
    result: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct LegacyServer {
    id: u64,
    #[serde(default)]
    name: String,
    status: String,
    #[serde(default)]
    cpu: Option<LegacyCpu>,
    #[serde(default)]
    ram: Option<LegacyRam>,
    #[serde(default)]
    storage: Vec<LegacyStorage>,
    #[serde(default)]
    network: Option<LegacyNetwork>,
    #[serde(default)]
    location: Option<LegacyLocation>,
    #[serde(default)]
    os: Option<LegacyOs>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyCpu {
    #[serde(default)]
    model: String,
    #[serde(default)]
    cores: u32,
    #[serde(default)]
    threads: u32,
    #[serde(default)]
    frequency: String,
    #[serde(default)]
    cache: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyRam {
    /// e.g. "64GB"
    #[serde(default)]
    size: String,
    #[serde(rename = "type", default)]
    ram_type: String,
    #[serde(default)]
    ecc: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct LegacyStorage {
    #[serde(rename = "type", default)]
    storage_type: String,
    /// e.g. "1TB", "480GB"
    #[serde(default)]
    size: String,
    #[serde(default)]
    count: u32,
    #[serde(default)]
    raid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyNetwork {
    #[serde(default)]
    primary_ip: Option<String>,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    additional_ips: Vec<String>,
    #[serde(default)]
    public_network: Option<LegacyNetworkConfig>,
    #[serde(default)]
    private_network: Option<LegacyNetworkConfig>,
    /// e.g. "1Gbps"
    #[serde(default)]
    bandwidth: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyNetworkConfig {
    ip: String,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    netmask: Option<String>,
    #[serde(default)]
    vlan: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LegacyLocation {
    #[serde(default)]
    uuid: Option<String>,
    name: String,
    #[serde(default)]
    location_id: u64,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    visibility: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyOs {
    id: u64,
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    architecture: String,
    #[serde(rename = "type", default)]
    os_type: String,
    #[serde(default)]
    distribution: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyService {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    name: String,
    #[serde(rename = "type", default)]
    service_type: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyPrice {
    amount: f64,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    period: String,
}

#[derive(Debug, Deserialize)]
struct LegacyConfiguration {
    id: u64,
    name: String,
    #[serde(default)]
    price: Option<LegacyPrice>,
    #[serde(default)]
    available: bool,
}

#[derive(Debug, Deserialize)]
struct LegacyTask {
    id: u64,
    status: String,
    #[serde(default)]
    progress: u32,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct LegacyNetworkCreate {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    private_network: bool,
}

#[derive(Serialize)]
struct LegacyCreateRequest<'a> {
    name: &'a str,
    location_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    config_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    os_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network_config: Option<LegacyNetworkCreate>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_keys: Vec<String>,
}

#[derive(Serialize)]
struct LegacyUpdateRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<Vec<String>>,
}

#[derive(Serialize)]
struct LegacyActionParams {
    os_id: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_keys: Vec<String>,
}

#[derive(Serialize)]
struct LegacyActionRequest {
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<LegacyActionParams>,
}

/// Parse "64GB" / "1TB" / "480" into GB
fn parse_gigabytes(value: &str) -> u32 {
    let value = value.trim().to_ascii_uppercase();
    let (number, multiplier) = if let Some(n) = value.strip_suffix("TB") {
        (n, 1000.0)
    } else if let Some(n) = value.strip_suffix("GB") {
        (n, 1.0)
    } else {
        (value.as_str(), 1.0)
    };
    number
        .trim()
        .parse::<f64>()
        .map(|n| (n * multiplier).round() as u32)
        .unwrap_or(0)
}

/// Parse "1Gbps" / "100Mbps" into Mbps
fn parse_bandwidth(value: &str) -> u32 {
    let value = value.trim().to_ascii_lowercase();
    if let Some(n) = value.strip_suffix("gbps") {
        n.trim()
            .parse::<u32>()
            .ok()
            .and_then(|n| n.checked_mul(1000))
            .unwrap_or(0)
    } else if let Some(n) = value.strip_suffix("mbps") {
        n.trim().parse::<u32>().unwrap_or(0)
    } else {
        value.parse::<u32>().unwrap_or(0)
    }
}

/// Legacy tags are plain labels; a `key=value` label with a non-empty value
/// becomes a pair, any other label is a key with an empty value. `k=` stays
/// the key `k=`, so writing the map back reproduces the labels.
fn tags_to_map(tags: Vec<String>) -> BTreeMap<String, String> {
    tags.into_iter()
        .map(|tag| match tag.split_once('=') {
            Some((key, value)) if !value.is_empty() => (key.to_string(), value.to_string()),
            _ => (tag, String::new()),
        })
        .collect()
}

fn tags_from_map(tags: &BTreeMap<String, String>) -> Vec<String> {
    tags.iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.clone()
            } else {
                format!("{}={}", key, value)
            }
        })
        .collect()
}

fn map_location(location: LegacyLocation) -> Location {
    let code = location.name.chars().take(3).collect();
    Location {
        id: location.location_id.to_string(),
        code,
        available: location.visibility.as_deref() != Some("hidden"),
        description: location.description.or(location.uuid),
        name: location.name,
        ..Default::default()
    }
}

fn map_os(os: LegacyOs) -> OsTemplate {
    OsTemplate {
        id: os.id.to_string(),
        name: os.name,
        version: os.version,
        architecture: os.architecture,
        os_type: os.os_type,
        family: os.distribution.unwrap_or_default(),
        available: true,
        ..Default::default()
    }
}

fn map_server(server: LegacyServer) -> Server {
    let mut networks = Vec::new();
    if let Some(network) = server.network {
        let bandwidth = network.bandwidth.as_deref().map(parse_bandwidth).unwrap_or(0);
        let public = match network.public_network {
            Some(config) => ServerNetwork {
                network_type: NetworkType::Public,
                bandwidth,
                ipv4: std::iter::once(config.ip)
                    .chain(network.additional_ips)
                    .collect(),
                subnet: config.netmask,
                vlan_id: config.vlan,
                gateway: config.gateway.or(network.gateway),
                ..Default::default()
            },
            None => ServerNetwork {
                network_type: NetworkType::Public,
                bandwidth,
                ipv4: network
                    .primary_ip
                    .into_iter()
                    .chain(network.additional_ips)
                    .collect(),
                gateway: network.gateway,
                ..Default::default()
            },
        };
        networks.push(public);
        if let Some(config) = network.private_network {
            networks.push(ServerNetwork {
                network_type: NetworkType::Private,
                ipv4: vec![config.ip],
                subnet: config.netmask,
                vlan_id: config.vlan,
                gateway: config.gateway,
                ..Default::default()
            });
        }
    }

    let status = ServerStatus::from(server.status);
    let mut unified = Server::new(server.id.to_string(), server.name, status);
    unified.location_uuid = server.location.as_ref().map(|l| l.location_id.to_string());
    unified.cpu = server.cpu.map(|cpu| CpuSpec {
        model: cpu.model,
        cores: cpu.cores,
        threads: cpu.threads,
        frequency: cpu.frequency,
        cache: cpu.cache,
        architecture: None,
    });
    unified.memory = server.ram.map(|ram| MemorySpec {
        size: parse_gigabytes(&ram.size),
        memory_type: ram.ram_type,
        ecc: ram.ecc,
        ..Default::default()
    });
    unified.storage = server
        .storage
        .into_iter()
        .map(|disk| StorageSpec {
            storage_type: disk.storage_type.to_ascii_lowercase(),
            size: parse_gigabytes(&disk.size),
            count: disk.count,
            interface: None,
            raid: disk.raid,
        })
        .collect();
    unified.networks = networks;
    unified.os = server.os.map(|os| ServerOs {
        template_id: os.id.to_string(),
        name: Some(os.name),
        version: Some(os.version),
        architecture: Some(os.architecture),
        ssh_keys: Vec::new(),
    });
    unified.tags = tags_to_map(server.tags);
    unified.created_at = server.created_at;
    unified.updated_at = server.updated_at;
    unified.location = server.location.map(map_location);
    unified
}

fn map_task(task: LegacyTask) -> Task {
    Task {
        id: task.id.to_string(),
        task_type: None,
        status: TaskStatus::from(task.status),
        progress: task.progress,
        message: task.message,
        error: task.error,
        created_at: task.created_at,
        updated_at: None,
        completed_at: task.completed_at,
    }
}

fn map_configuration(config: LegacyConfiguration) -> PricePlan {
    let (price, currency, period) = match config.price {
        Some(p) => (p.amount, p.currency, p.period),
        None => (0.0, String::new(), String::new()),
    };
    PricePlan {
        id: config.id.to_string(),
        name: config.name,
        plan_type: "configuration".to_string(),
        price,
        currency,
        period,
        available: config.available,
        ..Default::default()
    }
}

fn parse_legacy_id(what: &str, id: &str) -> Result<u64> {
    id.parse()
        .map_err(|_| Error::InvalidId(format!("{} '{}' is not a legacy integer id", what, id)))
}

/// Client for the integer-keyed legacy API
#[derive(Clone)]
pub struct LegacyClient {
    transport: Transport,
}

impl LegacyClient {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        request: ApiRequest,
    ) -> Result<T> {
        let response = self.transport.execute(cancel, &request).await?;
        decode(response).await
    }

    async fn fetch_data<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        request: ApiRequest,
    ) -> Result<T> {
        let envelope: Data<T> = self.fetch(cancel, request).await?;
        Ok(envelope.data)
    }

    async fn fetch_result<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        request: ApiRequest,
    ) -> Result<Vec<T>> {
        let envelope: ResultList<T> = self.fetch(cancel, request).await?;
        Ok(envelope.result)
    }

    async fn configurations(&self, cancel: &CancellationToken) -> Result<Vec<LegacyConfiguration>> {
        self.fetch_data(cancel, ApiRequest::get("configuration")).await
    }

    async fn action(
        &self,
        cancel: &CancellationToken,
        id: &str,
        body: &LegacyActionRequest,
    ) -> Result<Task> {
        validate_id(ApiGeneration::Legacy, id)?;
        info!("Server {} action: {}", id, body.action);
        let request = ApiRequest::post(format!("server/{}/action", id)).json(body)?;
        let task: LegacyTask = self.fetch_data(cancel, request).await?;
        Ok(map_task(task))
    }
}

#[async_trait]
impl ServerBackend for LegacyClient {
    async fn get_server(&self, cancel: &CancellationToken, id: &str) -> Result<Server> {
        validate_id(ApiGeneration::Legacy, id)?;
        let server: LegacyServer = self
            .fetch_data(cancel, ApiRequest::get(format!("server/{}", id)))
            .await?;
        Ok(map_server(server))
    }

    async fn get_task(&self, cancel: &CancellationToken, id: &str) -> Result<Task> {
        validate_id(ApiGeneration::Legacy, id)?;
        let task: LegacyTask = self
            .fetch_data(cancel, ApiRequest::get(format!("task/{}", id)))
            .await?;
        Ok(map_task(task))
    }
}

#[async_trait]
impl ResourceService for LegacyClient {
    fn generation(&self) -> ApiGeneration {
        ApiGeneration::Legacy
    }

    async fn list_locations(&self, cancel: &CancellationToken) -> Result<Vec<Location>> {
        let locations: Vec<LegacyLocation> =
            self.fetch_result(cancel, ApiRequest::get("location")).await?;
        Ok(locations.into_iter().map(map_location).collect())
    }

    /// No single-location endpoint; looked up in the list
    async fn get_location(&self, cancel: &CancellationToken, id: &str) -> Result<Location> {
        validate_id(ApiGeneration::Legacy, id)?;
        self.list_locations(cancel)
            .await?
            .into_iter()
            .find(|location| location.id == id)
            .ok_or_else(|| Error::NotFound {
                what: format!("location {}", id),
            })
    }

    async fn list_services(
        &self,
        cancel: &CancellationToken,
        filter: &ServiceFilter,
    ) -> Result<Vec<Service>> {
        if filter.location_id.is_some() || filter.category.is_some() {
            debug!("Legacy service listing only filters by type");
        }
        let services: Vec<LegacyService> =
            self.fetch_result(cancel, ApiRequest::get("service")).await?;
        Ok(services
            .into_iter()
            .filter(|s| {
                filter
                    .service_type
                    .as_deref()
                    .map_or(true, |t| s.service_type.eq_ignore_ascii_case(t))
            })
            .map(|s| Service {
                id: s.uuid.or(s.id).unwrap_or_default(),
                name: s.name,
                service_type: s.service_type,
                available: s.state.as_deref().map_or(true, |state| state == "active"),
                description: s.description,
                ..Default::default()
            })
            .collect())
    }

    /// Service ids may be UUIDs or integers here, so only emptiness is checked
    async fn get_service(&self, cancel: &CancellationToken, id: &str) -> Result<Service> {
        if id.is_empty() {
            return Err(Error::InvalidId("identifier is empty".to_string()));
        }
        self.list_services(cancel, &ServiceFilter::default())
            .await?
            .into_iter()
            .find(|service| service.id == id)
            .ok_or_else(|| Error::NotFound {
                what: format!("service {}", id),
            })
    }

    /// Legacy price plans are the hardware configurations, which are not
    /// linked to services.
    async fn list_price_plans(
        &self,
        cancel: &CancellationToken,
        service_id: Option<&str>,
    ) -> Result<Vec<PricePlan>> {
        if let Some(service_id) = service_id {
            debug!("Legacy configurations are not scoped to service {}", service_id);
        }
        let configurations = self.configurations(cancel).await?;
        Ok(configurations.into_iter().map(map_configuration).collect())
    }

    async fn list_os_templates(
        &self,
        cancel: &CancellationToken,
        filter: &OsTemplateFilter,
    ) -> Result<Vec<OsTemplate>> {
        let systems: Vec<LegacyOs> = match (&filter.location_id, &filter.service_id) {
            (Some(location), Some(service)) => {
                let request = ApiRequest::get("boot/template/os/new")
                    .query("location_uuid", location.as_str())
                    .query("service_uuid", service.as_str());
                self.fetch_data(cancel, request).await?
            }
            _ => self.fetch_result(cancel, ApiRequest::get("os")).await?,
        };
        Ok(systems.into_iter().map(map_os).collect())
    }

    async fn get_os_template(&self, cancel: &CancellationToken, id: &str) -> Result<OsTemplate> {
        validate_id(ApiGeneration::Legacy, id)?;
        self.list_os_templates(cancel, &OsTemplateFilter::default())
            .await?
            .into_iter()
            .find(|os| os.id == id)
            .ok_or_else(|| Error::NotFound {
                what: format!("OS template {}", id),
            })
    }

    async fn list_servers(
        &self,
        cancel: &CancellationToken,
        filter: &ServerFilter,
    ) -> Result<Vec<Server>> {
        let request = ApiRequest::get("server")
            .query_opt("status", filter.status.as_deref())
            .query_opt("location", filter.location_id.as_deref());
        let servers: Vec<LegacyServer> = self.fetch_data(cancel, request).await?;
        Ok(servers.into_iter().map(map_server).collect())
    }

    async fn create_server(
        &self,
        cancel: &CancellationToken,
        draft: &ServerDraft,
    ) -> Result<CreatedServer> {
        info!("Creating server: {}", draft.name);
        if draft.partitions.is_some() {
            warn!("Legacy API does not accept a partition layout, ignoring it");
        }
        let body = LegacyCreateRequest {
            name: &draft.name,
            location_id: parse_legacy_id("location", &draft.location_id)?,
            config_id: draft
                .price_plan_id
                .as_deref()
                .map(|id| parse_legacy_id("configuration", id))
                .transpose()?,
            os_id: draft
                .os_template_id
                .as_deref()
                .map(|id| parse_legacy_id("OS", id))
                .transpose()?,
            comment: draft.comment.as_deref(),
            tags: tags_from_map(&draft.tags),
            network_config: draft.private_network.then_some(LegacyNetworkCreate {
                private_network: true,
            }),
            ssh_keys: draft.ssh_keys.clone(),
        };
        let request = ApiRequest::post("server").json(&body)?;
        let server: LegacyServer = self.fetch_data(cancel, request).await?;
        Ok(CreatedServer {
            server: map_server(server),
            task_id: None,
        })
    }

    async fn update_server(
        &self,
        cancel: &CancellationToken,
        id: &str,
        update: &ServerUpdate,
    ) -> Result<Server> {
        validate_id(ApiGeneration::Legacy, id)?;
        let body = LegacyUpdateRequest {
            name: update.name.as_deref(),
            tags: update.tags.as_ref().map(tags_from_map),
        };
        let request = ApiRequest::patch(format!("server/{}", id)).json(&body)?;
        let server: LegacyServer = self.fetch_data(cancel, request).await?;
        Ok(map_server(server))
    }

    async fn delete_server(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        validate_id(ApiGeneration::Legacy, id)?;
        info!("Deleting server: {}", id);
        let response = self
            .transport
            .execute(cancel, &ApiRequest::delete(format!("server/{}", id)))
            .await?;
        expect_success(response).await
    }

    async fn power_action(
        &self,
        cancel: &CancellationToken,
        id: &str,
        action: &PowerAction,
    ) -> Result<Task> {
        let body = match action {
            PowerAction::On => LegacyActionRequest {
                action: "start",
                params: None,
            },
            PowerAction::Off => LegacyActionRequest {
                action: "stop",
                params: None,
            },
            PowerAction::Reboot => LegacyActionRequest {
                action: "restart",
                params: None,
            },
            PowerAction::PowerCycle => LegacyActionRequest {
                action: "power_cycle",
                params: None,
            },
            PowerAction::Reinstall {
                os_template_id,
                ssh_keys,
            } => LegacyActionRequest {
                action: "reinstall",
                params: Some(LegacyActionParams {
                    os_id: parse_legacy_id("OS", os_template_id)?,
                    ssh_keys: ssh_keys.clone(),
                }),
            },
        };
        self.action(cancel, id, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::tests::test_config;
    use crate::api::transport::AuthScheme;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> LegacyClient {
        LegacyClient::new(Transport::new(test_config(&server.uri(), AuthScheme::AuthToken)).unwrap())
    }

    fn legacy_server_body() -> serde_json::Value {
        json!({
            "id": 42,
            "name": "storage-1",
            "status": "installing",
            "ram": {"size": "64GB", "type": "DDR4", "ecc": true},
            "storage": [{"type": "SSD", "size": "1TB", "count": 2, "raid": "RAID1"}],
            "network": {
                "public_network": {"ip": "203.0.113.42", "gateway": "203.0.113.1", "netmask": "255.255.255.0"},
                "additional_ips": ["203.0.113.43"],
                "private_network": {"ip": "10.0.0.42", "gateway": "10.0.0.1", "netmask": "255.255.255.0", "vlan": 120},
                "bandwidth": "1Gbps"
            },
            "location": {"name": "SPB-4", "location_id": 7, "description": "Saint Petersburg"},
            "os": {"id": 15, "name": "Ubuntu", "version": "22.04", "architecture": "x86_64", "type": "linux"},
            "tags": ["prod", "team=storage"]
        })
    }

    #[test]
    fn test_size_parsing() {
        assert_eq!(parse_gigabytes("64GB"), 64);
        assert_eq!(parse_gigabytes("1TB"), 1000);
        assert_eq!(parse_gigabytes("1.92TB"), 1920);
        assert_eq!(parse_gigabytes("garbage"), 0);
        assert_eq!(parse_bandwidth("1Gbps"), 1000);
        assert_eq!(parse_bandwidth("100Mbps"), 100);
        assert_eq!(parse_bandwidth("5000000Gbps"), 0);
        assert_eq!(parse_bandwidth("4294967Gbps"), 4_294_967_000);
    }

    #[test]
    fn test_tags_map_both_ways() {
        let map = tags_to_map(vec!["prod".to_string(), "team=storage".to_string()]);
        assert_eq!(map.get("prod").map(String::as_str), Some(""));
        assert_eq!(map.get("team").map(String::as_str), Some("storage"));
        assert_eq!(tags_from_map(&map), vec!["prod", "team=storage"]);
    }

    #[test]
    fn test_tags_keep_empty_assignments() {
        let labels = vec!["backup=".to_string(), "backup".to_string(), "a=b=c".to_string()];
        let map = tags_to_map(labels);
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("a").map(String::as_str), Some("b=c"));

        let mut written = tags_from_map(&map);
        written.sort();
        assert_eq!(written, vec!["a=b=c", "backup", "backup="]);
    }

    #[tokio::test]
    async fn test_get_server_maps_to_unified_model() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/server/42"))
            .and(header("x-auth-token", "test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": legacy_server_body()
            })))
            .mount(&server)
            .await;

        let unified = client(&server)
            .await
            .get_server(&CancellationToken::new(), "42")
            .await
            .unwrap();

        assert_eq!(unified.id, "42");
        assert_eq!(unified.status, ServerStatus::Installing);
        assert_eq!(unified.memory.as_ref().map(|m| m.size), Some(64));
        assert_eq!(unified.storage[0].size, 1000);
        assert_eq!(unified.networks.len(), 2);
        assert_eq!(unified.networks[0].ipv4, vec!["203.0.113.42", "203.0.113.43"]);
        assert_eq!(unified.networks[0].bandwidth, 1000);
        assert_eq!(unified.networks[1].vlan_id, Some(120));
        assert_eq!(unified.location_uuid.as_deref(), Some("7"));
        assert_eq!(unified.os.as_ref().map(|os| os.template_id.as_str()), Some("15"));
        assert_eq!(unified.tags.len(), 2);
    }

    #[tokio::test]
    async fn test_reinstall_sends_params() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/server/42/action"))
            .and(body_json(json!({
                "action": "reinstall",
                "params": {"os_id": 15, "ssh_keys": ["ssh-ed25519 AAAA"]}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"id": 901, "status": "pending", "progress": 0}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let action = PowerAction::Reinstall {
            os_template_id: "15".to_string(),
            ssh_keys: vec!["ssh-ed25519 AAAA".to_string()],
        };
        let task = client(&server)
            .await
            .power_action(&CancellationToken::new(), "42", &action)
            .await
            .unwrap();
        assert_eq!(task.id, "901");
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_catalog_result_envelopes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/location"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [{"uuid": "a1", "name": "MSK-1", "location_id": 3, "description": "Moscow"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/os"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [
                    {"id": 15, "name": "Ubuntu", "version": "22.04", "architecture": "x86_64", "type": "linux"},
                    {"id": 16, "name": "Debian", "version": "12", "architecture": "x86_64", "type": "linux"}
                ]
            })))
            .mount(&server)
            .await;

        let api = client(&server).await;
        let cancel = CancellationToken::new();

        let locations = api.list_locations(&cancel).await.unwrap();
        assert_eq!(locations[0].id, "3");
        assert_eq!(locations[0].code, "MSK");

        let os = api.get_os_template(&cancel, "16").await.unwrap();
        assert_eq!(os.name, "Debian");

        let missing = api.get_os_template(&cancel, "99").await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn test_get_location_and_service_search_lists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/location"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [
                    {"name": "MSK-1", "location_id": 3},
                    {"name": "SPB-4", "location_id": 7}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/service"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [
                    {"uuid": "c0ffee00-1111-4222-8333-444455556666", "name": "EL10-SSD", "type": "dedicated"}
                ]
            })))
            .mount(&server)
            .await;

        let api = client(&server).await;
        let cancel = CancellationToken::new();

        assert_eq!(api.get_location(&cancel, "7").await.unwrap().name, "SPB-4");
        assert!(api.get_location(&cancel, "9").await.unwrap_err().is_not_found());
        assert!(matches!(
            api.get_location(&cancel, "spb").await.unwrap_err(),
            Error::InvalidId(_)
        ));

        let service = api
            .get_service(&cancel, "c0ffee00-1111-4222-8333-444455556666")
            .await
            .unwrap();
        assert_eq!(service.name, "EL10-SSD");
        assert!(api.get_service(&cancel, "missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_requires_integer_ids() {
        let server = MockServer::start().await;
        let draft = ServerDraft {
            name: "storage-2".to_string(),
            location_id: "spb".to_string(),
            ..Default::default()
        };
        let err = client(&server)
            .await
            .create_server(&CancellationToken::new(), &draft)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidId(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
