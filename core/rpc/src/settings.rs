// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;

use crate::config::{ClientConfiguration, RpcConfiguration};
use crate::diagnostics::{DiagnosticSink, TracingDiagnostics};
use crate::marshaller::MarshallerRegistry;
use crate::naming::{DefaultNaming, NamingPolicy};

/// Collaborators shared by server hosts and client factories
#[derive(Clone)]
pub struct Settings {
    marshallers: Arc<MarshallerRegistry>,
    naming: Arc<dyn NamingPolicy>,
    diagnostics: Arc<dyn DiagnosticSink>,
    simplified_faults: bool,
    client: ClientConfiguration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            marshallers: MarshallerRegistry::global(),
            naming: Arc::new(DefaultNaming),
            diagnostics: Arc::new(TracingDiagnostics),
            simplified_faults: false,
            client: ClientConfiguration::default(),
        }
    }
}

impl Settings {
    pub fn from_config(config: &RpcConfiguration) -> Self {
        Self::default()
            .with_simplified_faults(config.binding.simplified_faults)
            .with_client(config.client.clone())
    }

    pub fn with_marshallers(self, marshallers: Arc<MarshallerRegistry>) -> Self {
        Settings {
            marshallers,
            ..self
        }
    }

    pub fn with_naming(self, naming: Arc<dyn NamingPolicy>) -> Self {
        Settings { naming, ..self }
    }

    pub fn with_diagnostics(self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Settings {
            diagnostics,
            ..self
        }
    }

    /// Default for contracts and methods that do not choose
    pub fn with_simplified_faults(self, simplified_faults: bool) -> Self {
        Settings {
            simplified_faults,
            ..self
        }
    }

    pub fn with_client(self, client: ClientConfiguration) -> Self {
        Settings { client, ..self }
    }

    pub fn marshallers(&self) -> &Arc<MarshallerRegistry> {
        &self.marshallers
    }

    pub fn naming(&self) -> &dyn NamingPolicy {
        self.naming.as_ref()
    }

    pub fn diagnostics(&self) -> &dyn DiagnosticSink {
        self.diagnostics.as_ref()
    }

    pub fn simplified_faults(&self) -> bool {
        self.simplified_faults
    }

    pub fn client(&self) -> &ClientConfiguration {
        &self.client
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("simplified_faults", &self.simplified_faults)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TracingConfiguration;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(!settings.simplified_faults());
        assert_eq!(settings.client(), &ClientConfiguration::default());
        assert!(Arc::ptr_eq(settings.marshallers(), &MarshallerRegistry::global()));
    }

    #[test]
    fn test_from_yaml_config() {
        let yaml = r#"
binding:
  simplified_faults: true
client:
  timeout: 2s
  capture_metadata: true
"#;
        let config = RpcConfiguration::from_yaml(yaml).unwrap();
        let settings = Settings::from_config(&config);

        assert!(settings.simplified_faults());
        assert_eq!(settings.client().timeout(), Some(Duration::from_secs(2)));
        let flags = settings.client().flags();
        assert!(flags.capture_metadata);
        assert!(!flags.ignore_stream_termination);

        // tracing settings do not leak into call settings
        let quiet = config.with_tracing(TracingConfiguration::default().with_log_level("error"));
        assert_eq!(Settings::from_config(&quiet).client(), settings.client());
    }
}
