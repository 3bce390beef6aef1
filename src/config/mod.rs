/// Configuration management for the dedicated servers provider
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::api::{
    auth_scheme, default_endpoint, ApiGeneration, ClientSettings, RetryConfig, TransportConfig,
};
use crate::provider::ResourceTimeouts;

pub const TOKEN_ENV: &str = "SELECTEL_TOKEN";
pub const PROJECT_ENV: &str = "SELECTEL_PROJECT_ID";
pub const ENDPOINT_ENV: &str = "SELECTEL_ENDPOINT";
pub const GENERATION_ENV: &str = "SELECTEL_API_GENERATION";

/// Provider configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// API token (can also be set via SELECTEL_TOKEN env var)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Project scope sent as X-Project-ID (SELECTEL_PROJECT_ID)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    /// API endpoint; defaults to the generation's public endpoint (SELECTEL_ENDPOINT)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// v2 or legacy (SELECTEL_API_GENERATION)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_generation: Option<ApiGeneration>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

/// Transport retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff: f64,
}

/// Resource operation timeouts, in minutes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_create_minutes")]
    pub create_mins: u64,
    #[serde(default = "default_change_minutes")]
    pub update_mins: u64,
    #[serde(default = "default_change_minutes")]
    pub delete_mins: u64,
    #[serde(default = "default_change_minutes")]
    pub power_mins: u64,
}

fn default_user_agent() -> String {
    format!("baremetal/{}", env!("CARGO_PKG_VERSION"))
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_backoff() -> f64 {
    2.0
}

fn default_create_minutes() -> u64 {
    60
}

fn default_change_minutes() -> u64 {
    30
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_retry_delay(),
            backoff: default_backoff(),
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            create_mins: default_create_minutes(),
            update_mins: default_change_minutes(),
            delete_mins: default_change_minutes(),
            power_mins: default_change_minutes(),
        }
    }
}

impl ProviderConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ProviderConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load from a file when one exists, then fill gaps from the environment
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            Self {
                user_agent: default_user_agent(),
                request_timeout_secs: default_request_timeout(),
                ..Default::default()
            }
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Fill values missing from the file using `lookup`
    pub fn apply_env_with<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if self.token.is_none() {
            self.token = lookup(TOKEN_ENV);
        }
        if self.project_id.is_none() {
            self.project_id = lookup(PROJECT_ENV);
        }
        if self.endpoint.is_none() {
            self.endpoint = lookup(ENDPOINT_ENV);
        }
        if self.api_generation.is_none() {
            if let Some(generation) = lookup(GENERATION_ENV) {
                self.api_generation = Some(generation.parse()?);
            }
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.get_token()?;

        let endpoint = self.endpoint();
        let url = url::Url::parse(endpoint)
            .map_err(|e| anyhow::anyhow!("Invalid endpoint URL '{}': {}", endpoint, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Endpoint must use http or https: {}", endpoint);
        }

        self.retry_config()?;

        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be positive");
        }
        let t = &self.timeouts;
        if [t.create_mins, t.update_mins, t.delete_mins, t.power_mins].contains(&0) {
            anyhow::bail!("resource timeouts must be positive");
        }

        Ok(())
    }

    /// Get the API token from config or environment
    pub fn get_token(&self) -> anyhow::Result<String> {
        self.token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow::anyhow!(
                "API token not found. Set {} environment variable or specify in config",
                TOKEN_ENV
            ))
    }

    pub fn generation(&self) -> ApiGeneration {
        self.api_generation.unwrap_or_default()
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint
            .as_deref()
            .unwrap_or_else(|| default_endpoint(self.generation()))
    }

    pub fn retry_config(&self) -> anyhow::Result<RetryConfig> {
        Ok(RetryConfig::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.delay_ms),
            self.retry.backoff,
        )?)
    }

    pub fn resource_timeouts(&self) -> ResourceTimeouts {
        let minutes = |m: u64| Duration::from_secs(m * 60);
        ResourceTimeouts {
            create: minutes(self.timeouts.create_mins),
            update: minutes(self.timeouts.update_mins),
            delete: minutes(self.timeouts.delete_mins),
            power: minutes(self.timeouts.power_mins),
        }
    }

    /// Settings for the client cache
    pub fn client_settings(&self) -> anyhow::Result<ClientSettings> {
        let generation = self.generation();
        Ok(ClientSettings {
            generation,
            transport: TransportConfig {
                endpoint: self.endpoint().to_string(),
                token: self.get_token()?,
                auth: auth_scheme(generation),
                project_id: self.project_id.clone(),
                user_agent: self.user_agent.clone(),
                timeout: Duration::from_secs(self.request_timeout_secs),
                retry: self.retry_config()?,
            },
        })
    }

    /// Generate an example configuration file
    pub fn example() -> Self {
        Self {
            token: None,
            project_id: Some("00000000-0000-0000-0000-000000000000".to_string()),
            endpoint: None,
            api_generation: Some(ApiGeneration::V2),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout(),
            retry: RetrySettings::default(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_validation() {
        let mut config = ProviderConfig::example();
        assert!(config.validate().is_err());

        config.token = Some("secret".to_string());
        assert!(config.validate().is_ok());

        config.retry.backoff = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_fills_missing_values_only() {
        let mut config = ProviderConfig::example();
        config.endpoint = Some("https://file.example.com/v2".to_string());
        config
            .apply_env_with(env(&[
                (TOKEN_ENV, "env-token"),
                (ENDPOINT_ENV, "https://env.example.com/v2"),
                (PROJECT_ENV, "env-project"),
            ]))
            .unwrap();

        assert_eq!(config.get_token().unwrap(), "env-token");
        assert_eq!(config.endpoint(), "https://file.example.com/v2");
        // the example already names a project
        assert_ne!(config.project_id.as_deref(), Some("env-project"));
    }

    #[test]
    fn test_generation_selects_endpoint_and_auth() {
        let mut config = ProviderConfig {
            token: Some("secret".to_string()),
            ..ProviderConfig::example()
        };
        config.api_generation = None;
        config
            .apply_env_with(env(&[(GENERATION_ENV, "legacy")]))
            .unwrap();

        let settings = config.client_settings().unwrap();
        assert_eq!(settings.generation, ApiGeneration::Legacy);
        assert_eq!(settings.transport.endpoint, "https://api.selectel.ru/servers/v2");
        assert_eq!(settings.transport.auth, crate::api::AuthScheme::AuthToken);

        let mut bad = ProviderConfig::example();
        bad.api_generation = None;
        assert!(bad.apply_env_with(env(&[(GENERATION_ENV, "v9")])).is_err());
    }

    #[test]
    fn test_yaml_defaults() {
        let config: ProviderConfig = serde_yaml::from_str("token: abc\n").unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.generation(), ApiGeneration::V2);
        assert_eq!(config.endpoint(), "https://api.selectel.ru/dedicated/v2");

        let timeouts = config.resource_timeouts();
        assert_eq!(timeouts.create, Duration::from_secs(3600));
        assert_eq!(timeouts.delete, Duration::from_secs(1800));
    }

    #[test]
    fn test_example_round_trips_through_yaml() {
        let yaml = serde_yaml::to_string(&ProviderConfig::example()).unwrap();
        let parsed: ProviderConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.project_id, ProviderConfig::example().project_id);
        assert!(parsed.token.is_none());
    }
}
