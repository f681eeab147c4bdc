// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Non-fatal problem reporting for contract scanning and binding

use parking_lot::Mutex;

/// Receives problems that must not abort binding
pub trait DiagnosticSink: Send + Sync {
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards diagnostics to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn warn(&self, message: &str) {
        tracing::warn!(%message, "binding diagnostic");
    }

    fn error(&self, message: &str) {
        tracing::error!(%message, "binding diagnostic");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// Keeps every diagnostic in memory
#[derive(Debug, Default)]
pub struct CollectingDiagnostics {
    entries: Mutex<Vec<(Severity, String)>>,
}

impl CollectingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(Severity, String)> {
        self.entries.lock().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.with_severity(Severity::Warning)
    }

    pub fn errors(&self) -> Vec<String> {
        self.with_severity(Severity::Error)
    }

    fn with_severity(&self, severity: Severity) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(s, _)| *s == severity)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl DiagnosticSink for CollectingDiagnostics {
    fn warn(&self, message: &str) {
        self.entries
            .lock()
            .push((Severity::Warning, message.to_string()));
    }

    fn error(&self, message: &str) {
        self.entries
            .lock()
            .push((Severity::Error, message.to_string()));
    }
}
