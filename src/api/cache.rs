/// Per-project cache of API clients
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::service::{ApiGeneration, ResourceService};
use super::transport::TransportConfig;
use super::connect;
use crate::error::Result;

/// Everything needed to build a client for any project
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub generation: ApiGeneration,
    /// Template transport; its project id is the default scope
    pub transport: TransportConfig,
}

/// Clients keyed by project scope, built on first use
pub struct ClientCache {
    settings: ClientSettings,
    clients: Mutex<HashMap<String, Arc<dyn ResourceService>>>,
}

impl ClientCache {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn generation(&self) -> ApiGeneration {
        self.settings.generation
    }

    /// Look up or build the client for `project`. The lock is held while
    /// building, so concurrent callers share one client per project.
    pub fn for_project(&self, project: Option<&str>) -> Result<Arc<dyn ResourceService>> {
        let project = project
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .or_else(|| self.settings.transport.project_id.clone());
        let key = project.clone().unwrap_or_default();

        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(&key) {
            return Ok(Arc::clone(client));
        }

        debug!(project = %key, generation = %self.settings.generation, "Creating API client");
        let mut transport = self.settings.transport.clone();
        transport.project_id = project;
        let client = connect(self.settings.generation, transport)?;
        clients.insert(key, Arc::clone(&client));
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
