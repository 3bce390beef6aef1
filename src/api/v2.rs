/// Primary (v2) dedicated servers API client
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::decode::{decode, expect_success};
use super::models::{Location, OsTemplate, PricePlan, Server, Service, Task};
use super::service::{
    validate_id, ApiGeneration, CreatedServer, OsTemplateFilter, PowerAction, ResourceService,
    ServerBackend, ServerDraft, ServerFilter, ServerUpdate, ServiceFilter,
};
use super::transport::{ApiRequest, Transport};
use crate::error::{Error, Result};
use crate::partitions::PartitionsConfig;

pub const DEFAULT_ENDPOINT: &str = "https://api.selectel.ru/dedicated/v2";

#[derive(Deserialize)]
struct LocationList {
    locations: Vec<Location>,
}

#[derive(Deserialize)]
struct ServiceList {
    services: Vec<Service>,
}

#[derive(Deserialize)]
struct PricePlanList {
    price_plans: Vec<PricePlan>,
}

#[derive(Deserialize)]
struct TemplateList {
    templates: Vec<OsTemplate>,
}

#[derive(Deserialize)]
struct ServerList {
    servers: Vec<Server>,
}

#[derive(Serialize)]
struct OsRequest<'a> {
    template_uuid: &'a str,
    #[serde(skip_serializing_if = "is_empty_slice")]
    ssh_keys: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<&'a str>,
}

#[derive(Serialize)]
struct NetworkRequest {
    #[serde(rename = "type")]
    network_type: &'static str,
}

#[derive(Serialize)]
struct CreateServerRequest<'a> {
    name: &'a str,
    location_uuid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_uuid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    price_plan_uuid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    os: Option<OsRequest<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    networks: Vec<NetworkRequest>,
    #[serde(skip_serializing_if = "is_empty_slice")]
    additional_services: &'a [String],
    #[serde(skip_serializing_if = "is_empty_map")]
    tags: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    partitions_config: Option<&'a PartitionsConfig>,
}

impl<'a> CreateServerRequest<'a> {
    fn from_draft(draft: &'a ServerDraft) -> Self {
        let os = draft.os_template_id.as_deref().map(|template_uuid| OsRequest {
            template_uuid,
            ssh_keys: &draft.ssh_keys,
            password: draft.password.as_deref(),
            user_data: draft.user_data.as_deref(),
        });
        let mut networks = vec![NetworkRequest {
            network_type: "public",
        }];
        if draft.private_network {
            networks.push(NetworkRequest {
                network_type: "private",
            });
        }

        Self {
            name: &draft.name,
            location_uuid: &draft.location_id,
            service_uuid: draft.service_id.as_deref(),
            price_plan_uuid: draft.price_plan_id.as_deref(),
            os,
            networks,
            additional_services: &draft.additional_services,
            tags: &draft.tags,
            partitions_config: draft.partitions.as_ref(),
        }
    }
}

fn is_empty_slice(value: &&[String]) -> bool {
    value.is_empty()
}

fn is_empty_map(value: &&BTreeMap<String, String>) -> bool {
    value.is_empty()
}

/// Create responses are the server plus the provisioning task, if any
#[derive(Deserialize)]
struct CreateServerResponse {
    #[serde(flatten)]
    server: Server,
    #[serde(default)]
    task_uuid: Option<String>,
}

#[derive(Serialize)]
struct UpdateServerRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<&'a BTreeMap<String, String>>,
}

/// Client for the UUID-keyed API
#[derive(Clone)]
pub struct V2Client {
    transport: Transport,
}

impl V2Client {
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

    fn check_id(id: &str) -> Result<()> {
        validate_id(ApiGeneration::V2, id)
    }
}

#[async_trait]
impl ServerBackend for V2Client {
    async fn get_server(&self, cancel: &CancellationToken, id: &str) -> Result<Server> {
        Self::check_id(id)?;
        self.fetch(cancel, ApiRequest::get(format!("servers/{}", id))).await
    }

    async fn get_task(&self, cancel: &CancellationToken, id: &str) -> Result<Task> {
        Self::check_id(id)?;
        self.fetch(cancel, ApiRequest::get(format!("tasks/{}", id))).await
    }
}

#[async_trait]
impl ResourceService for V2Client {
    fn generation(&self) -> ApiGeneration {
        ApiGeneration::V2
    }

    async fn list_locations(&self, cancel: &CancellationToken) -> Result<Vec<Location>> {
        let list: LocationList = self.fetch(cancel, ApiRequest::get("location")).await?;
        Ok(list.locations)
    }

    async fn get_location(&self, cancel: &CancellationToken, id: &str) -> Result<Location> {
        Self::check_id(id)?;
        self.fetch(cancel, ApiRequest::get(format!("location/{}", id))).await
    }

    async fn list_services(
        &self,
        cancel: &CancellationToken,
        filter: &ServiceFilter,
    ) -> Result<Vec<Service>> {
        let request = ApiRequest::get("service")
            .query_opt("type", filter.service_type.as_deref())
            .query_opt("category", filter.category.as_deref())
            .query_opt("location_uuid", filter.location_id.as_deref());
        let list: ServiceList = self.fetch(cancel, request).await?;
        Ok(list.services)
    }

    async fn get_service(&self, cancel: &CancellationToken, id: &str) -> Result<Service> {
        Self::check_id(id)?;
        self.fetch(cancel, ApiRequest::get(format!("service/{}", id))).await
    }

    async fn list_price_plans(
        &self,
        cancel: &CancellationToken,
        service_id: Option<&str>,
    ) -> Result<Vec<PricePlan>> {
        let request = ApiRequest::get("plan").query_opt("service_uuid", service_id);
        let list: PricePlanList = self.fetch(cancel, request).await?;
        Ok(list.price_plans)
    }

    async fn list_os_templates(
        &self,
        cancel: &CancellationToken,
        filter: &OsTemplateFilter,
    ) -> Result<Vec<OsTemplate>> {
        let request = ApiRequest::get("boot/template/os/new")
            .query_opt("location_uuid", filter.location_id.as_deref())
            .query_opt("service_uuid", filter.service_id.as_deref());
        let list: TemplateList = self.fetch(cancel, request).await?;
        Ok(list.templates)
    }

    async fn get_os_template(&self, cancel: &CancellationToken, id: &str) -> Result<OsTemplate> {
        Self::check_id(id)?;
        self.fetch(cancel, ApiRequest::get(format!("boot/template/os/new/{}", id)))
            .await
    }

    async fn list_servers(
        &self,
        cancel: &CancellationToken,
        filter: &ServerFilter,
    ) -> Result<Vec<Server>> {
        let request = ApiRequest::get("servers")
            .query_opt("status", filter.status.as_deref())
            .query_opt("location_uuid", filter.location_id.as_deref());
        let list: ServerList = self.fetch(cancel, request).await?;
        Ok(list.servers)
    }

    async fn create_server(
        &self,
        cancel: &CancellationToken,
        draft: &ServerDraft,
    ) -> Result<CreatedServer> {
        info!("Creating server: {}", draft.name);
        let request = ApiRequest::post("servers").json(&CreateServerRequest::from_draft(draft))?;
        let created: CreateServerResponse = self.fetch(cancel, request).await?;
        debug!(
            server = %created.server.id,
            task = created.task_uuid.as_deref().unwrap_or("none"),
            "Server ordered"
        );
        Ok(CreatedServer {
            server: created.server,
            task_id: created.task_uuid,
        })
    }

    async fn update_server(
        &self,
        cancel: &CancellationToken,
        id: &str,
        update: &ServerUpdate,
    ) -> Result<Server> {
        Self::check_id(id)?;
        let body = UpdateServerRequest {
            name: update.name.as_deref(),
            tags: update.tags.as_ref(),
        };
        let request = ApiRequest::patch(format!("servers/{}", id)).json(&body)?;
        self.fetch(cancel, request).await
    }

    async fn delete_server(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        Self::check_id(id)?;
        info!("Deleting server: {}", id);
        let response = self
            .transport
            .execute(cancel, &ApiRequest::delete(format!("servers/{}", id)))
            .await?;
        expect_success(response).await
    }

    async fn power_action(
        &self,
        cancel: &CancellationToken,
        id: &str,
        action: &PowerAction,
    ) -> Result<Task> {
        Self::check_id(id)?;
        let verb = match action {
            PowerAction::On => "on",
            PowerAction::Off => "off",
            PowerAction::Reboot => "reboot",
            PowerAction::PowerCycle | PowerAction::Reinstall { .. } => {
                return Err(Error::Unsupported(format!(
                    "{} is not available on the v2 API",
                    action
                )))
            }
        };
        info!("Power {} for server {}", verb, id);
        self.fetch(cancel, ApiRequest::post(format!("servers/{}/power/{}", id, verb)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::{ServerStatus, TaskStatus};
    use crate::api::transport::tests::test_config;
    use crate::api::transport::AuthScheme;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SERVER_ID: &str = "0b8f5b3e-5a5c-4c8e-9d5e-2f1c1e0d9a11";

    async fn client(server: &MockServer) -> V2Client {
        V2Client::new(Transport::new(test_config(&server.uri(), AuthScheme::Bearer)).unwrap())
    }

    #[tokio::test]
    async fn test_list_endpoints_unwrap_envelopes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/location"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "locations": [{"uuid": "loc-1", "name": "SPB-4", "available": true}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/plan"))
            .and(query_param("service_uuid", "svc-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "price_plans": [{"uuid": "plan-1", "name": "monthly", "price": 120.5}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/service"))
            .and(query_param("location_uuid", "loc-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "services": [{"uuid": "svc-1", "name": "EL-01", "type": "server"}]
            })))
            .mount(&server)
            .await;

        let api = client(&server).await;
        let cancel = CancellationToken::new();

        let locations = api.list_locations(&cancel).await.unwrap();
        assert_eq!(locations[0].name, "SPB-4");

        let plans = api.list_price_plans(&cancel, Some("svc-1")).await.unwrap();
        assert_eq!(plans[0].id, "plan-1");

        let filter = ServiceFilter {
            location_id: Some("loc-1".to_string()),
            ..Default::default()
        };
        let services = api.list_services(&cancel, &filter).await.unwrap();
        assert_eq!(services[0].service_type, "server");
    }

    #[tokio::test]
    async fn test_create_reports_task() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers"))
            .and(body_partial_json(json!({
                "name": "db-1",
                "location_uuid": "loc-1",
                "os": {"template_uuid": "os-1", "ssh_keys": ["ssh-ed25519 AAAA"]}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "uuid": SERVER_ID,
                "name": "db-1",
                "status": "provisioning",
                "task_uuid": "t-1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let draft = ServerDraft {
            name: "db-1".to_string(),
            location_id: "loc-1".to_string(),
            os_template_id: Some("os-1".to_string()),
            ssh_keys: vec!["ssh-ed25519 AAAA".to_string()],
            ..Default::default()
        };
        let created = client(&server)
            .await
            .create_server(&CancellationToken::new(), &draft)
            .await
            .unwrap();

        assert_eq!(created.server.id, SERVER_ID);
        assert_eq!(created.server.status, ServerStatus::Provisioning);
        assert_eq!(created.task_id.as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn test_power_action_returns_task() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/servers/{}/power/off", SERVER_ID)))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "uuid": "t-9", "status": "pending", "progress": 0
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server).await;
        let task = api
            .power_action(&CancellationToken::new(), SERVER_ID, &PowerAction::Off)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let err = api
            .power_action(&CancellationToken::new(), SERVER_ID, &PowerAction::PowerCycle)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_get_server_retries_unavailable_then_decodes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/servers/{}", SERVER_ID)))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/servers/{}", SERVER_ID)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uuid": SERVER_ID,
                "name": "db-1",
                "status": "active",
                "power_status": "on",
                "location_uuid": "loc-1",
                "memory": {"size": 64, "type": "DDR4"},
                "networks": [
                    {"type": "public", "bandwidth": 1000, "ipv4": ["203.0.113.10"]},
                    {"type": "private", "ipv4": ["10.0.0.10"], "vlan_id": 120}
                ],
                "os": {"template_uuid": "os-1", "name": "Ubuntu", "version": "22.04"},
                "tags": {"env": "prod"}
            })))
            .mount(&server)
            .await;

        let found = client(&server)
            .await
            .get_server(&CancellationToken::new(), SERVER_ID)
            .await
            .unwrap();

        assert_eq!(server.received_requests().await.unwrap().len(), 3);
        assert_eq!(found.id, SERVER_ID);
        assert_eq!(found.name, "db-1");
        assert!(found.is_active());
        assert!(found.is_powered_on());
        assert_eq!(found.memory.as_ref().map(|m| m.size), Some(64));
        assert_eq!(found.os.as_ref().map(|os| os.template_id.as_str()), Some("os-1"));
        let addresses: Vec<_> = found.ip_addresses().into_iter().map(|ip| ip.address).collect();
        assert_eq!(addresses, vec!["203.0.113.10", "10.0.0.10"]);
        assert_eq!(found.tags.get("env").map(String::as_str), Some("prod"));
    }

    #[tokio::test]
    async fn test_get_location_and_service_by_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/location/loc-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uuid": "loc-1", "name": "Saint Petersburg", "code": "SPB-4", "available": true
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/service/svc-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uuid": "svc-1", "name": "EL10-SSD", "type": "dedicated"
            })))
            .mount(&server)
            .await;

        let api = client(&server).await;
        let cancel = CancellationToken::new();
        let location = api.get_location(&cancel, "loc-1").await.unwrap();
        assert_eq!(location.code, "SPB-4");
        let service = api.get_service(&cancel, "svc-1").await.unwrap();
        assert_eq!(service.service_type, "dedicated");

        let missing = api.get_service(&cancel, "svc-9").await.unwrap_err();
        assert!(missing.is_not_found());
        assert!(matches!(
            api.get_location(&cancel, "../servers").await.unwrap_err(),
            Error::InvalidId(_)
        ));
    }

    #[tokio::test]
    async fn test_get_server_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/servers/{}", SERVER_ID)))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "code": 404, "message": "server not found"
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .get_server(&CancellationToken::new(), SERVER_ID)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_sends_only_changed_fields() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path(format!("/servers/{}", SERVER_ID)))
            .and(wiremock::matchers::body_json(json!({"name": "db-2"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uuid": SERVER_ID, "name": "db-2", "status": "active"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let update = ServerUpdate {
            name: Some("db-2".to_string()),
            tags: None,
        };
        let updated = client(&server)
            .await
            .update_server(&CancellationToken::new(), SERVER_ID, &update)
            .await
            .unwrap();
        assert_eq!(updated.name, "db-2");
    }
}
