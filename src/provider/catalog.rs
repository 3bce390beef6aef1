/// Catalog lookups backing the data sources
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::models::{Location, OsTemplate, PricePlan, Service};
use crate::api::{OsTemplateFilter, ResourceService, ServiceFilter};

/// Read-only view over the catalog of one project
pub struct Catalog {
    client: Arc<dyn ResourceService>,
}

impl Catalog {
    pub fn new(client: Arc<dyn ResourceService>) -> Self {
        Self { client }
    }

    pub async fn locations(
        &self,
        cancel: &CancellationToken,
        only_available: bool,
    ) -> Result<Vec<Location>> {
        let mut locations = self
            .client
            .list_locations(cancel)
            .await
            .context("Failed to list locations")?;
        if only_available {
            locations.retain(|l| l.available);
        }
        Ok(locations)
    }

    pub async fn location(&self, cancel: &CancellationToken, id: &str) -> Result<Location> {
        self.client
            .get_location(cancel, id)
            .await
            .with_context(|| format!("Failed to read location {}", id))
    }

    /// Find a location by name or code, ignoring case
    pub async fn find_location(&self, cancel: &CancellationToken, name: &str) -> Result<Location> {
        self.locations(cancel, false)
            .await?
            .into_iter()
            .find(|l| l.name.eq_ignore_ascii_case(name) || l.code.eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow::anyhow!("location '{}' not found", name))
    }

    pub async fn services(
        &self,
        cancel: &CancellationToken,
        filter: &ServiceFilter,
    ) -> Result<Vec<Service>> {
        self.client
            .list_services(cancel, filter)
            .await
            .context("Failed to list services")
    }

    pub async fn service(&self, cancel: &CancellationToken, id: &str) -> Result<Service> {
        self.client
            .get_service(cancel, id)
            .await
            .with_context(|| format!("Failed to read service {}", id))
    }

    pub async fn find_service(
        &self,
        cancel: &CancellationToken,
        filter: &ServiceFilter,
        name: &str,
    ) -> Result<Service> {
        self.services(cancel, filter)
            .await?
            .into_iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow::anyhow!("service '{}' not found", name))
    }

    pub async fn price_plans(
        &self,
        cancel: &CancellationToken,
        service_id: Option<&str>,
    ) -> Result<Vec<PricePlan>> {
        self.client
            .list_price_plans(cancel, service_id)
            .await
            .context("Failed to list price plans")
    }

    /// Services matching `filter`, each with its price plans
    pub async fn services_with_plans(
        &self,
        cancel: &CancellationToken,
        filter: &ServiceFilter,
    ) -> Result<Vec<(Service, Vec<PricePlan>)>> {
        let services = self.services(cancel, filter).await?;
        debug!("Fetching price plans for {} services", services.len());
        let plans = try_join_all(
            services
                .iter()
                .map(|service| self.price_plans(cancel, Some(&service.id))),
        )
        .await?;
        Ok(services.into_iter().zip(plans).collect())
    }

    pub async fn os_templates(
        &self,
        cancel: &CancellationToken,
        filter: &OsTemplateFilter,
    ) -> Result<Vec<OsTemplate>> {
        self.client
            .list_os_templates(cancel, filter)
            .await
            .context("Failed to list OS templates")
    }

    /// Find an OS template by name and, optionally, version
    pub async fn find_os_template(
        &self,
        cancel: &CancellationToken,
        filter: &OsTemplateFilter,
        name: &str,
        version: Option<&str>,
    ) -> Result<OsTemplate> {
        self.os_templates(cancel, filter)
            .await?
            .into_iter()
            .find(|t| t.name.eq_ignore_ascii_case(name) && version.map_or(true, |v| t.version == v))
            .ok_or_else(|| match version {
                Some(v) => anyhow::anyhow!("OS template '{} {}' not found", name, v),
                None => anyhow::anyhow!("OS template '{}' not found", name),
            })
    }

    pub async fn os_template(&self, cancel: &CancellationToken, id: &str) -> Result<OsTemplate> {
        self.client
            .get_os_template(cancel, id)
            .await
            .with_context(|| format!("Failed to read OS template {}", id))
    }
}
