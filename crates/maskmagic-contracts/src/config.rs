use std::env;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Hard per-file ceiling enforced by the image-edit service.
pub const SERVICE_MAX_BYTES: u64 = 4 * 1024 * 1024;
/// Local safety margin (3.9 MiB) applied while preparing the canvas.
pub const LOCAL_MAX_BYTES: u64 = 4_089_446;

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080/generateImage";
pub const DEFAULT_MODEL: &str = "dall-e-2";
pub const DEFAULT_RESPONSE_FORMAT: &str = "url";
pub const DEFAULT_CANVAS_SIZE: u32 = 1024;
pub const DEFAULT_FALLBACK_CANVAS_SIZE: u32 = 512;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_UPSTREAM_API_BASE: &str = "https://api.openai.com/v1";

/// How requests to an endpoint are authenticated.
///
/// Upstream API keys never appear here: the generation backend holds them. A
/// bearer token is only for backends that gate access to themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthStrategy {
    #[default]
    None,
    Bearer {
        token: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
    #[serde(default)]
    pub auth: AuthStrategy,
}

impl Endpoint {
    pub fn anonymous(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: AuthStrategy::None,
        }
    }

    pub fn bearer(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: AuthStrategy::Bearer {
                token: token.into(),
            },
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::anonymous(DEFAULT_ENDPOINT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub endpoint: Endpoint,
    pub model: String,
    pub canvas_size: u32,
    pub fallback_canvas_size: u32,
    pub response_format: String,
    pub local_max_bytes: u64,
    pub service_max_bytes: u64,
    pub request_timeout_secs: u64,
    /// Smallest side any resolution reduction may produce.
    pub min_resolution: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            model: DEFAULT_MODEL.to_string(),
            canvas_size: DEFAULT_CANVAS_SIZE,
            fallback_canvas_size: DEFAULT_FALLBACK_CANVAS_SIZE,
            response_format: DEFAULT_RESPONSE_FORMAT.to_string(),
            local_max_bytes: LOCAL_MAX_BYTES,
            service_max_bytes: SERVICE_MAX_BYTES,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            min_resolution: DEFAULT_FALLBACK_CANVAS_SIZE,
        }
    }
}

impl ServiceConfig {
    /// Defaults overridden by `MASKMAGIC_ENDPOINT`, `MASKMAGIC_ENDPOINT_TOKEN`
    /// and `MASKMAGIC_MODEL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Reads a JSON config file; absent fields keep their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config JSON in {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Some(url) = non_empty_env("MASKMAGIC_ENDPOINT") {
            self.endpoint.url = url.trim_end_matches('/').to_string();
        }
        if let Some(token) = non_empty_env("MASKMAGIC_ENDPOINT_TOKEN") {
            self.endpoint.auth = AuthStrategy::Bearer { token };
        }
        if let Some(model) = non_empty_env("MASKMAGIC_MODEL") {
            self.model = model;
        }
    }

    pub fn size_label(&self) -> String {
        format!("{0}x{0}", self.canvas_size)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoint.url.trim().is_empty() {
            bail!("endpoint url must not be empty");
        }
        if self.model.trim().is_empty() {
            bail!("model must not be empty");
        }
        if self.canvas_size == 0 || self.fallback_canvas_size == 0 {
            bail!("canvas sizes must be positive");
        }
        if self.fallback_canvas_size > self.canvas_size {
            bail!(
                "fallback canvas {} exceeds canvas {}",
                self.fallback_canvas_size,
                self.canvas_size
            );
        }
        if self.local_max_bytes > self.service_max_bytes {
            bail!(
                "local ceiling {} exceeds service ceiling {}",
                self.local_max_bytes,
                self.service_max_bytes
            );
        }
        if self.request_timeout_secs == 0 {
            bail!("request timeout must be positive");
        }
        Ok(())
    }
}

/// Server-side settings for the backend relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub api_base: String,
    pub api_key: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_UPSTREAM_API_BASE.to_string(),
            api_key: None,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: non_empty_env("OPENAI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_UPSTREAM_API_BASE.to_string()),
            api_key: non_empty_env("OPENAI_API_KEY"),
        }
    }

    pub fn edits_url(&self) -> String {
        format!("{}/images/edits", self.api_base)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
