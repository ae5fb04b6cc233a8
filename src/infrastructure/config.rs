// Configuration - config/session.toml layered with TESTBENCH__ environment overrides
use crate::application::gateway::RetryPolicy;
use crate::application::session_controller::SessionSettings;
use crate::domain::metric::{MetricCatalog, MetricDefinition};
use crate::domain::range::OutOfRangePolicy;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub session: SessionConfig,
    pub server: ServerConfig,
    /// Replaces the built-in metric catalog when present
    pub metrics: Option<Vec<MetricDefinition>>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub live_url: String,
    pub request_timeout_secs: Option<u64>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            live_url: "ws://localhost:8080/ws/measure".to_string(),
            request_timeout_secs: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub tick_interval_ms: u64,
    pub warmup_minutes: u64,
    pub required_product_status: i32,
    pub out_of_range_policy: OutOfRangePolicy,
    pub auto_stop_minutes: Option<u32>,
    pub notice_capacity: usize,
    pub device_list_retry: RetryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            warmup_minutes: 20,
            required_product_status: 20,
            out_of_range_policy: OutOfRangePolicy::Sticky,
            auto_stop_minutes: None,
            notice_capacity: 50,
            device_list_retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3030".to_string(),
        }
    }
}

impl AppConfig {
    pub fn catalog(&self) -> Arc<MetricCatalog> {
        match &self.metrics {
            Some(definitions) if !definitions.is_empty() => {
                Arc::new(MetricCatalog::new(definitions.clone()))
            }
            _ => Arc::new(MetricCatalog::builtin()),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        let session = &self.session;
        SessionSettings {
            tick_interval: Duration::from_millis(session.tick_interval_ms.max(1)),
            warmup_seconds: session.warmup_minutes * 60,
            required_product_status: session.required_product_status,
            out_of_range_policy: session.out_of_range_policy,
            auto_stop_minutes: session.auto_stop_minutes,
            notice_capacity: session.notice_capacity,
            catalog_retry: RetryPolicy {
                attempts: session.device_list_retry.attempts,
                delay: Duration::from_millis(session.device_list_retry.delay_ms),
            },
        }
    }
}

/// Load `<path>.toml` if it exists, then apply `TESTBENCH__SECTION__KEY` overrides
pub fn load_config(path: &str) -> anyhow::Result<AppConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(
            config::Environment::with_prefix("TESTBENCH")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}
