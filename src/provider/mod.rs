/// Reconciliation handlers orchestrating the resource service and waiters
pub mod catalog;
pub mod power;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::api::{ApiGeneration, ClientCache, ResourceService, ServerRef};
use crate::waiter::WaitTimings;

pub use catalog::Catalog;
pub use power::{PowerResource, PowerState};
pub use server::{IncompleteCreate, OrderSettings, ServerConfig, ServerResource, ServerState};

/// Budgets of the resource operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceTimeouts {
    pub create: Duration,
    pub update: Duration,
    pub delete: Duration,
    pub power: Duration,
}

impl Default for ResourceTimeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(60 * 60),
            update: Duration::from_secs(30 * 60),
            delete: Duration::from_secs(30 * 60),
            power: Duration::from_secs(30 * 60),
        }
    }
}

/// Shared context of every handler
#[derive(Clone)]
pub struct Provider {
    cache: Arc<ClientCache>,
    timeouts: ResourceTimeouts,
    server_timings: WaitTimings,
    task_timings: WaitTimings,
}

impl Provider {
    pub fn new(cache: Arc<ClientCache>, timeouts: ResourceTimeouts) -> Self {
        Self {
            cache,
            timeouts,
            server_timings: WaitTimings::server_defaults(),
            task_timings: WaitTimings::task_defaults(),
        }
    }

    /// Override the poll cadence of server and task waits
    pub fn with_wait_timings(mut self, server: WaitTimings, task: WaitTimings) -> Self {
        self.server_timings = server;
        self.task_timings = task;
        self
    }

    pub fn generation(&self) -> ApiGeneration {
        self.cache.generation()
    }

    pub fn timeouts(&self) -> &ResourceTimeouts {
        &self.timeouts
    }

    pub fn servers(&self) -> ServerResource {
        ServerResource::new(self.clone())
    }

    pub fn power(&self) -> PowerResource {
        PowerResource::new(self.clone())
    }

    pub fn catalog(&self, project: Option<&str>) -> Result<Catalog> {
        Ok(Catalog::new(self.client(project)?))
    }

    pub(crate) fn client(&self, project: Option<&str>) -> Result<Arc<dyn ResourceService>> {
        Ok(self.cache.for_project(project)?)
    }

    /// Client able to serve `reference`; a reference from the other API
    /// generation cannot be served by this provider
    pub(crate) fn client_for(
        &self,
        reference: &ServerRef,
        project: Option<&str>,
    ) -> Result<Arc<dyn ResourceService>> {
        if reference.generation != self.generation() {
            anyhow::bail!(
                "server {} belongs to the {} API but the provider is configured for {}",
                reference,
                reference.generation,
                self.generation()
            );
        }
        self.client(project)
    }

    pub(crate) fn server_timings(&self, budget: Duration) -> WaitTimings {
        self.server_timings.with_timeout(budget)
    }

    pub(crate) fn task_timings(&self, budget: Duration) -> WaitTimings {
        self.task_timings.with_timeout(budget)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::transport::tests::test_config;
    use crate::api::{auth_scheme, ClientSettings};

    pub(crate) fn fast_timings() -> WaitTimings {
        WaitTimings {
            timeout: Duration::from_secs(30),
            delay: Duration::ZERO,
            min_timeout: Duration::from_millis(10),
            poll_interval: Some(Duration::from_millis(10)),
        }
    }

    pub(crate) fn provider(endpoint: &str, generation: ApiGeneration) -> Provider {
        let cache = ClientCache::new(ClientSettings {
            generation,
            transport: test_config(endpoint, auth_scheme(generation)),
        });
        Provider::new(Arc::new(cache), ResourceTimeouts::default())
            .with_wait_timings(fast_timings(), fast_timings())
    }

    #[test]
    fn test_rejects_reference_from_other_generation() {
        let provider = provider("https://api.example.com/dedicated/v2", ApiGeneration::V2);
        let legacy = ServerRef::new(ApiGeneration::Legacy, "42").unwrap();
        let err = provider.client_for(&legacy, None).err().unwrap();
        assert!(err.to_string().contains("legacy"));

        let v2 = ServerRef::new(ApiGeneration::V2, "s-1").unwrap();
        assert!(provider.client_for(&v2, None).is_ok());
    }

    #[test]
    fn test_timings_take_operation_budget() {
        let provider = provider("https://api.example.com/dedicated/v2", ApiGeneration::V2);
        let timings = provider.server_timings(provider.timeouts().delete);
        assert_eq!(timings.timeout, Duration::from_secs(30 * 60));
        assert_eq!(timings.poll_interval, Some(Duration::from_millis(10)));
    }
}
