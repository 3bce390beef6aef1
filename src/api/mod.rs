/// Dedicated servers API: transport, decoding, models and the two backends
pub mod cache;
pub mod decode;
pub mod legacy;
pub mod models;
pub mod service;
pub mod transport;
pub mod v2;

use std::sync::Arc;

pub use cache::{ClientCache, ClientSettings};
pub use service::{
    ApiGeneration, CreatedServer, OsTemplateFilter, PowerAction, ResourceService, ServerBackend,
    ServerDraft, ServerFilter, ServerRef, ServerUpdate, ServiceFilter,
};
pub use transport::{AuthScheme, RetryConfig, Transport, TransportConfig};

use crate::error::Result;

/// Default endpoint of an API generation
pub fn default_endpoint(generation: ApiGeneration) -> &'static str {
    match generation {
        ApiGeneration::V2 => v2::DEFAULT_ENDPOINT,
        ApiGeneration::Legacy => legacy::DEFAULT_ENDPOINT,
    }
}

/// Auth scheme an API generation expects
pub fn auth_scheme(generation: ApiGeneration) -> AuthScheme {
    match generation {
        ApiGeneration::V2 => AuthScheme::Bearer,
        ApiGeneration::Legacy => AuthScheme::AuthToken,
    }
}

/// Build the service implementation for a generation
pub fn connect(
    generation: ApiGeneration,
    config: TransportConfig,
) -> Result<Arc<dyn ResourceService>> {
    let transport = Transport::new(config)?;
    Ok(match generation {
        ApiGeneration::V2 => Arc::new(v2::V2Client::new(transport)),
        ApiGeneration::Legacy => Arc::new(legacy::LegacyClient::new(transport)),
    })
}
