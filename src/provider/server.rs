/// Server resource: create, read, update, delete and import
use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::Provider;
use crate::api::models::{IpAddress, PowerStatus, Server, ServerStatus};
use crate::api::{ServerBackend, ServerDraft, ServerFilter, ServerRef, ServerUpdate};
use crate::error::Error;
use crate::partitions::DiskLayout;
use crate::waiter::{
    wait_for_server_active, wait_for_server_deletion, wait_for_task_completion, OperationBudget,
};

const PASSWORD_NAMESPACE: Uuid = Uuid::from_u128(0x3a9e_71c4_0d52_4b8f_a617_2c4e_95f0_b83d);

/// Declared server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub location_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    /// Only sent with the order, never persisted in state
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_network: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_services: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_layout: Option<DiskLayout>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default = "default_wait_for_active")]
    pub wait_for_active: bool,
}

fn default_wait_for_active() -> bool {
    true
}

impl ServerConfig {
    /// Translate into an order, building the partition layout
    fn to_draft(&self) -> Result<ServerDraft> {
        if self.name.trim().is_empty() {
            anyhow::bail!("server name cannot be empty");
        }
        if self.location_id.trim().is_empty() {
            anyhow::bail!("server location_id cannot be empty");
        }
        let partitions = self
            .disk_layout
            .as_ref()
            .map(DiskLayout::build)
            .transpose()
            .context("Invalid disk layout")?;

        Ok(ServerDraft {
            name: self.name.clone(),
            location_id: self.location_id.clone(),
            service_id: self.service_id.clone(),
            price_plan_id: self.price_plan_id.clone(),
            os_template_id: self.os_template_id.clone(),
            ssh_keys: self.ssh_keys.clone(),
            user_data: self.user_data.clone(),
            password: self.password.clone(),
            private_network: self.private_network,
            additional_services: self.additional_services.clone(),
            tags: self.tags.clone(),
            comment: self.comment.clone(),
            partitions,
        })
    }
}

/// Settings that only travel with the order. The API cannot change them on
/// an existing server, so any later difference means a new server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderSettings {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    /// Salted digest of the password, never the password itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_digest: Option<Uuid>,
    #[serde(default)]
    pub private_network: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_services: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_layout: Option<DiskLayout>,
}

impl OrderSettings {
    pub fn from_config(reference: &ServerRef, config: &ServerConfig) -> Self {
        Self {
            ssh_keys: config.ssh_keys.clone(),
            user_data: config.user_data.clone(),
            password_digest: password_digest(reference, config.password.as_deref()),
            private_network: config.private_network,
            additional_services: config.additional_services.clone(),
            comment: config.comment.clone(),
            disk_layout: config.disk_layout.clone(),
        }
    }

    /// Names of the settings `desired` would change
    fn changed_by(&self, reference: &ServerRef, desired: &ServerConfig) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.ssh_keys != desired.ssh_keys {
            fields.push("ssh_keys");
        }
        if self.user_data != desired.user_data {
            fields.push("user_data");
        }
        if self.password_digest != password_digest(reference, desired.password.as_deref()) {
            fields.push("password");
        }
        if self.private_network != desired.private_network {
            fields.push("private_network");
        }
        if self.additional_services != desired.additional_services {
            fields.push("additional_services");
        }
        if self.comment != desired.comment {
            fields.push("comment");
        }
        if self.disk_layout != desired.disk_layout {
            fields.push("disk_layout");
        }
        fields
    }
}

fn password_digest(reference: &ServerRef, password: Option<&str>) -> Option<Uuid> {
    let salt = Uuid::new_v5(&PASSWORD_NAMESPACE, reference.to_string().as_bytes());
    password.map(|password| Uuid::new_v5(&salt, password.as_bytes()))
}

/// Observed server state, derived from the last successful read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerState {
    pub reference: ServerRef,
    pub name: String,
    pub status: ServerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_status: Option<PowerStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_template_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Known only for servers created through this provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderSettings>,
}

impl ServerState {
    pub fn from_server(reference: ServerRef, project_id: Option<&str>, server: &Server) -> Self {
        Self {
            reference,
            name: server.name.clone(),
            status: server.status.clone(),
            power_status: server.power_status,
            location_id: server.location_uuid.clone(),
            service_id: server.service_uuid.clone(),
            price_plan_id: server.price_plan_uuid.clone(),
            os_template_id: server.os.as_ref().map(|os| os.template_id.clone()),
            tags: server.tags.clone(),
            ip_addresses: server.ip_addresses(),
            project_id: project_id.map(str::to_string),
            created_at: server.created_at,
            updated_at: server.updated_at,
            order: None,
        }
    }

    pub fn with_order(mut self, order: Option<OrderSettings>) -> Self {
        self.order = order;
        self
    }
}

/// The server was ordered but did not reach its final state. The caller
/// must record `server` so the next run can adopt or destroy it.
#[derive(Debug, Error)]
#[error("server {server} was created but did not become ready")]
pub struct IncompleteCreate {
    pub server: ServerRef,
    #[source]
    pub cause: Error,
}

/// Server lifecycle handlers
pub struct ServerResource {
    provider: Provider,
}

impl ServerResource {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }

    /// Order a server and wait for it to become ready
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        config: &ServerConfig,
    ) -> Result<ServerState> {
        let draft = config.to_draft()?;
        let project = config.project_id.as_deref();
        let client = self.provider.client(project)?;

        let created = client
            .create_server(cancel, &draft)
            .await
            .with_context(|| format!("Failed to create server {}", config.name))?;
        let reference = ServerRef::new(client.generation(), created.server.id.clone())
            .context("Backend returned an unusable server id")?;
        info!("Server {} ordered as {}", config.name, reference);

        let server = self
            .settle_created(cancel, client.as_ref(), &reference, created.task_id.as_deref(), config)
            .await
            .map_err(|cause| IncompleteCreate {
                server: reference.clone(),
                cause,
            })?;

        info!("✓ Server {} is ready", reference);
        let order = OrderSettings::from_config(&reference, config);
        Ok(ServerState::from_server(reference, project, &server).with_order(Some(order)))
    }

    /// Task and active waits share the create budget
    async fn settle_created<B: ServerBackend + ?Sized>(
        &self,
        cancel: &CancellationToken,
        client: &B,
        reference: &ServerRef,
        task_id: Option<&str>,
        config: &ServerConfig,
    ) -> crate::Result<Server> {
        let budget = OperationBudget::start(
            format!("create of server {}", reference),
            self.provider.timeouts().create,
        );
        if let Some(task_id) = task_id {
            info!("Waiting for task {}...", task_id);
            let timings = budget.stage(self.provider.task_timings(budget.total()))?;
            wait_for_task_completion(client, cancel, task_id, timings).await?;
        }
        if config.wait_for_active {
            info!("Waiting for server {} to become active...", reference);
            let timings = budget.stage(self.provider.server_timings(budget.total()))?;
            wait_for_server_active(client, cancel, &reference.id, timings).await?;
        }
        client.get_server(cancel, &reference.id).await
    }

    /// Refresh state; `None` means the server is gone and the state should be dropped
    pub async fn read(
        &self,
        cancel: &CancellationToken,
        reference: &ServerRef,
        project: Option<&str>,
    ) -> Result<Option<ServerState>> {
        let client = self.provider.client_for(reference, project)?;
        match client.get_server(cancel, &reference.id).await {
            Ok(server) => Ok(Some(ServerState::from_server(reference.clone(), project, &server))),
            Err(e) if e.is_not_found() => {
                warn!("Server {} no longer exists", reference);
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read server {}", reference)),
        }
    }

    /// Re-read a tracked server, keeping what is known about its order
    pub async fn refresh(
        &self,
        cancel: &CancellationToken,
        state: &ServerState,
    ) -> Result<Option<ServerState>> {
        let refreshed = self
            .read(cancel, &state.reference, state.project_id.as_deref())
            .await?;
        Ok(refreshed.map(|fresh| fresh.with_order(state.order.clone())))
    }

    /// Apply name and tag changes. Other differences, order settings
    /// included, require a replacement.
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        state: &ServerState,
        desired: &ServerConfig,
    ) -> Result<ServerState> {
        let replaced = replacement_fields(state, desired);
        if !replaced.is_empty() {
            anyhow::bail!(
                "changing {} of server {} requires replacing the server",
                replaced.join(", "),
                state.reference
            );
        }

        let update = ServerUpdate {
            name: (desired.name != state.name).then(|| desired.name.clone()),
            tags: (desired.tags != state.tags).then(|| desired.tags.clone()),
        };
        let project = state.project_id.as_deref();
        let client = self.provider.client_for(&state.reference, project)?;
        let reference = &state.reference;

        let work = async {
            if !update.is_empty() {
                info!("Updating server {}", reference);
                client.update_server(cancel, &reference.id, &update).await?;
            }
            client.get_server(cancel, &reference.id).await
        };
        let server = match tokio::time::timeout(self.provider.timeouts().update, work).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                what: format!("update of server {}", reference),
                timeout: self.provider.timeouts().update,
                last_status: Some(state.status.to_string()),
            }),
        }
        .with_context(|| format!("Failed to update server {}", reference))?;

        Ok(ServerState::from_server(reference.clone(), project, &server)
            .with_order(state.order.clone()))
    }

    /// Delete and wait until the server is gone. Deleting a missing server succeeds.
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        reference: &ServerRef,
        project: Option<&str>,
    ) -> Result<()> {
        let client = self.provider.client_for(reference, project)?;
        match client.delete_server(cancel, &reference.id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                info!("Server {} already deleted", reference);
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to delete server {}", reference))
            }
        }

        let timings = self.provider.server_timings(self.provider.timeouts().delete);
        wait_for_server_deletion(client.as_ref(), cancel, &reference.id, timings)
            .await
            .map_err(Error::from)
            .with_context(|| format!("Failed to delete server {}", reference))?;
        info!("✓ Server {} deleted", reference);
        Ok(())
    }

    /// Adopt an existing server from a reference string
    pub async fn import(
        &self,
        cancel: &CancellationToken,
        value: &str,
        project: Option<&str>,
    ) -> Result<ServerState> {
        let reference = ServerRef::parse(value, self.provider.generation())
            .with_context(|| format!("Invalid server reference '{}'", value))?;
        self.read(cancel, &reference, project)
            .await?
            .ok_or_else(|| anyhow::anyhow!("server {} not found", reference))
    }

    pub async fn list(
        &self,
        cancel: &CancellationToken,
        filter: &ServerFilter,
        project: Option<&str>,
    ) -> Result<Vec<ServerState>> {
        let client = self.provider.client(project)?;
        let servers = client
            .list_servers(cancel, filter)
            .await
            .context("Failed to list servers")?;
        servers
            .iter()
            .map(|server| {
                let reference = ServerRef::new(client.generation(), server.id.clone())?;
                Ok(ServerState::from_server(reference, project, server))
            })
            .collect()
    }
}

/// Declared fields that differ from state and cannot be changed in place
fn replacement_fields(state: &ServerState, desired: &ServerConfig) -> Vec<&'static str> {
    let differs = |declared: Option<&str>, observed: Option<&str>| match declared {
        Some(declared) => observed.is_some_and(|observed| observed != declared),
        None => false,
    };

    let mut fields = Vec::new();
    if differs(Some(desired.location_id.as_str()), state.location_id.as_deref()) {
        fields.push("location_id");
    }
    if differs(desired.service_id.as_deref(), state.service_id.as_deref()) {
        fields.push("service_id");
    }
    if differs(desired.price_plan_id.as_deref(), state.price_plan_id.as_deref()) {
        fields.push("price_plan_id");
    }
    if differs(desired.os_template_id.as_deref(), state.os_template_id.as_deref()) {
        fields.push("os_template_id");
    }
    if desired.project_id != state.project_id {
        fields.push("project_id");
    }
    if let Some(order) = &state.order {
        fields.extend(order.changed_by(&state.reference, desired));
    }
    fields
}
