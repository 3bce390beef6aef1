/// Power resource: apply a power action and wait for its outcome
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::Provider;
use crate::api::models::{PowerStatus, ServerStatus};
use crate::api::{PowerAction, ServerRef};
use crate::waiter::wait_for_power_action;

/// Outcome of the last applied power action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerState {
    pub server: ServerRef,
    pub action: String,
    pub task_id: String,
    pub status: ServerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_status: Option<PowerStatus>,
    pub applied_at: DateTime<Utc>,
}

pub struct PowerResource {
    provider: Provider,
}

impl PowerResource {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }

    /// Run `action` against the server, then wait for its task and the
    /// status the action implies
    pub async fn apply(
        &self,
        cancel: &CancellationToken,
        reference: &ServerRef,
        action: PowerAction,
        project: Option<&str>,
    ) -> Result<PowerState> {
        let client = self.provider.client_for(reference, project)?;
        let task = client
            .power_action(cancel, &reference.id, &action)
            .await
            .with_context(|| format!("Failed to apply {} to server {}", action, reference))?;

        info!("Waiting for {} of server {}...", action, reference);
        let budget = self.provider.timeouts().power;
        let server = wait_for_power_action(
            client.as_ref(),
            cancel,
            &reference.id,
            &task.id,
            &action,
            self.provider.task_timings(budget),
            self.provider.server_timings(budget),
        )
        .await
        .with_context(|| format!("Failed to complete {} of server {}", action, reference))?;

        info!("✓ {} of server {} complete", action, reference);
        Ok(PowerState {
            server: reference.clone(),
            action: action.name().to_string(),
            task_id: task.id,
            status: server.status,
            power_status: server.power_status,
            applied_at: Utc::now(),
        })
    }
}
