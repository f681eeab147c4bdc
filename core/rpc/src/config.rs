// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;
use std::time::Duration;

use duration_str::deserialize_option_duration;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use crate::context::CallFlags;
use crate::error::ConfigError;

/// Top-level configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RpcConfiguration {
    #[serde(default)]
    pub tracing: TracingConfiguration,

    #[serde(default)]
    pub binding: BindingConfiguration,

    #[serde(default)]
    pub client: ClientConfiguration,
}

impl RpcConfiguration {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn with_tracing(self, tracing: TracingConfiguration) -> Self {
        RpcConfiguration { tracing, ..self }
    }

    pub fn with_binding(self, binding: BindingConfiguration) -> Self {
        RpcConfiguration { binding, ..self }
    }

    pub fn with_client(self, client: ClientConfiguration) -> Self {
        RpcConfiguration { client, ..self }
    }
}

/// Logging installed by [`TracingConfiguration::setup_tracing_subscriber`]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TracingConfiguration {
    /// `trace`, `debug`, `info`, `warn` or `error`; anything else means `info`
    log_level: String,

    display_thread_names: bool,

    display_thread_ids: bool,

    /// Extra directives on top of the level, e.g. `codefirst_rpc::reshape=trace`
    filter: String,
}

impl Default for TracingConfiguration {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            display_thread_names: true,
            display_thread_ids: false,
            filter: String::new(),
        }
    }
}

fn resolve_level(level: &str) -> Level {
    level.parse().unwrap_or(Level::INFO)
}

impl TracingConfiguration {
    pub fn with_log_level(mut self, log_level: impl Into<String>) -> Self {
        self.log_level = log_level.into();
        self
    }

    pub fn with_display_thread_names(mut self, display: bool) -> Self {
        self.display_thread_names = display;
        self
    }

    pub fn with_display_thread_ids(mut self, display: bool) -> Self {
        self.display_thread_ids = display;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn display_thread_names(&self) -> bool {
        self.display_thread_names
    }

    pub fn display_thread_ids(&self) -> bool {
        self.display_thread_ids
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    fn env_filter(&self) -> EnvFilter {
        let level = LevelFilter::from_level(resolve_level(&self.log_level));
        EnvFilter::builder()
            .with_default_directive(level.into())
            .parse_lossy(&self.filter)
    }

    /// Install a stdout fmt subscriber. Keeps whatever global subscriber is
    /// already installed.
    pub fn setup_tracing_subscriber(&self) {
        let installed = tracing_subscriber::fmt()
            .with_env_filter(self.env_filter())
            .with_thread_names(self.display_thread_names)
            .with_thread_ids(self.display_thread_ids)
            .try_init();
        if installed.is_err() {
            tracing::debug!("tracing subscriber already installed");
        }
    }
}

/// Server binding behaviour
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct BindingConfiguration {
    /// Map unstructured service failures to well-known codes, for contracts and
    /// methods that do not choose themselves
    #[serde(default)]
    pub simplified_faults: bool,
}

impl BindingConfiguration {
    pub fn with_simplified_faults(self, simplified_faults: bool) -> Self {
        BindingConfiguration { simplified_faults }
    }
}

/// Defaults applied to client calls whose context leaves them unset
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ClientConfiguration {
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    #[serde(skip_serializing)]
    timeout: Option<Duration>,

    #[serde(default)]
    capture_metadata: bool,

    #[serde(default)]
    ignore_stream_termination: bool,
}

impl ClientConfiguration {
    pub fn with_timeout(self, timeout: Option<Duration>) -> Self {
        ClientConfiguration { timeout, ..self }
    }

    pub fn with_capture_metadata(self, capture_metadata: bool) -> Self {
        ClientConfiguration {
            capture_metadata,
            ..self
        }
    }

    pub fn with_ignore_stream_termination(self, ignore_stream_termination: bool) -> Self {
        ClientConfiguration {
            ignore_stream_termination,
            ..self
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn flags(&self) -> CallFlags {
        CallFlags {
            capture_metadata: self.capture_metadata,
            ignore_stream_termination: self.ignore_stream_termination,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration() {
        let config = RpcConfiguration::default();
        assert_eq!(config.tracing.log_level(), "info");
        assert!(config.tracing.display_thread_names());
        assert!(!config.tracing.display_thread_ids());
        assert!(!config.binding.simplified_faults);
        assert_eq!(config.client.timeout(), None);
        assert_eq!(config.client.flags(), CallFlags::default());
    }

    #[test]
    fn test_resolve_level() {
        assert_eq!(resolve_level("trace"), Level::TRACE);
        assert_eq!(resolve_level("DEBUG"), Level::DEBUG);
        assert_eq!(resolve_level("warn"), Level::WARN);
        assert_eq!(resolve_level("error"), Level::ERROR);
        assert_eq!(resolve_level("invalid"), Level::INFO);
    }

    #[test]
    fn test_yaml() {
        let yaml = r#"
tracing:
  log_level: debug
  filter: "codefirst_rpc=trace"
binding:
  simplified_faults: true
client:
  timeout: 5s
  ignore_stream_termination: true
"#;
        let config = RpcConfiguration::from_yaml(yaml).unwrap();
        assert_eq!(config.tracing.log_level(), "debug");
        assert_eq!(config.tracing.filter(), "codefirst_rpc=trace");
        assert!(config.binding.simplified_faults);
        assert_eq!(config.client.timeout(), Some(Duration::from_secs(5)));
        assert!(config.client.flags().ignore_stream_termination);
        assert!(!config.client.flags().capture_metadata);
    }

    #[test]
    fn test_invalid_yaml() {
        let err = RpcConfiguration::from_yaml("client:\n  timeout: forever\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = RpcConfiguration::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_builders() {
        let tracing = TracingConfiguration::default()
            .with_log_level("warn")
            .with_display_thread_ids(true)
            .with_filter("codefirst_rpc::dispatch=debug");
        assert_eq!(tracing.log_level(), "warn");
        assert!(tracing.display_thread_ids());
        assert_eq!(tracing.filter(), "codefirst_rpc::dispatch=debug");

        let config = RpcConfiguration::default()
            .with_binding(BindingConfiguration::default().with_simplified_faults(true))
            .with_client(
                ClientConfiguration::default()
                    .with_timeout(Some(Duration::from_millis(250)))
                    .with_capture_metadata(true),
            );
        assert!(config.binding.simplified_faults);
        assert_eq!(config.client.timeout(), Some(Duration::from_millis(250)));
        assert!(config.client.flags().capture_metadata);
    }

    #[test]
    fn test_setup_tracing_subscriber() {
        let tracing = TracingConfiguration::default()
            .with_log_level("debug")
            .with_filter("codefirst_rpc::reshape=trace");
        let filter = tracing.env_filter().to_string().to_lowercase();
        assert!(filter.contains("codefirst_rpc::reshape=trace"));
        assert!(filter.contains("debug"));

        tracing.setup_tracing_subscriber();
        // a second install keeps the first subscriber
        tracing.setup_tracing_subscriber();
        tracing::info!("tracing configured");
    }
}
