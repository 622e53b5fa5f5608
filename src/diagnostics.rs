//! Diagnostic reporting for audit runs.
//!
//! Console messages, page errors, and navigation failures are rendered as
//! structured records with optional external sinks so embedders and tests can
//! capture output, while a sensible default console printer covers the CLI.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Verbosity;

/// Convenience alias for external diagnostic callbacks.
pub type DiagnosticCallback = Arc<dyn Fn(&AuditRecord) + Send + Sync + 'static>;

/// Reporter configuration shared across an audit run.
#[derive(Clone)]
pub struct ReporterConfig {
    pub verbose: Verbosity,
    pub external: Option<DiagnosticCallback>,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            verbose: Verbosity::Medium,
            external: None,
        }
    }
}

impl ReporterConfig {
    pub fn new(verbose: Verbosity) -> Self {
        Self {
            verbose,
            ..Default::default()
        }
    }

    pub fn should_report(&self, level: LogLevel) -> bool {
        level == LogLevel::Error || level.as_u8() <= verbosity_to_u8(self.verbose)
    }
}

/// Severity of a diagnostic record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error = 0,
    Info = 1,
    Debug = 2,
}

impl LogLevel {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

fn verbosity_to_u8(verbose: Verbosity) -> u8 {
    match verbose {
        Verbosity::Minimal => 0,
        Verbosity::Medium => 1,
        Verbosity::Detailed => 2,
    }
}

/// Severity reported by the browser for a console message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleSeverity {
    Log,
    Debug,
    Info,
    Warning,
    Error,
    Other(String),
}

impl ConsoleSeverity {
    /// Map a DevTools `Runtime.consoleAPICalled` type string.
    pub fn from_cdp(kind: &str) -> Self {
        match kind {
            "log" => ConsoleSeverity::Log,
            "debug" => ConsoleSeverity::Debug,
            "info" => ConsoleSeverity::Info,
            "warning" => ConsoleSeverity::Warning,
            "error" => ConsoleSeverity::Error,
            other => ConsoleSeverity::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            ConsoleSeverity::Log => "log",
            ConsoleSeverity::Debug => "debug",
            ConsoleSeverity::Info => "info",
            ConsoleSeverity::Warning => "warning",
            ConsoleSeverity::Error => "error",
            ConsoleSeverity::Other(kind) => kind,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConsoleSeverity::Error)
    }
}

impl fmt::Display for ConsoleSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Structured diagnostic entry shared with external callbacks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
    /// Target the record is attributed to, when it concerns a single page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auxiliary: Option<Value>,
}

impl AuditRecord {
    pub fn new(
        message: impl Into<String>,
        level: LogLevel,
        target: Option<String>,
        auxiliary: Option<Value>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            level,
            target,
            auxiliary,
        }
    }
}

/// Default console printer used when no external sink is configured.
pub fn default_report_handler(record: &AuditRecord) {
    let timestamp = record
        .timestamp
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    if let Some(target) = &record.target {
        println!(
            "[{}] {:<5} [{}] {}",
            timestamp,
            record.level.label(),
            target,
            record.message
        );
    } else {
        println!(
            "[{}] {:<5} {}",
            timestamp,
            record.level.label(),
            record.message
        );
    }
    if let Some(aux) = &record.auxiliary {
        if !aux.is_null() {
            println!("    {}", aux);
        }
    }
}

/// Reporter that renders audit diagnostics, either through the default
/// console printer or an external sink.
pub struct AuditReporter {
    config: ReporterConfig,
    default_handler: DiagnosticCallback,
}

impl fmt::Debug for AuditReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditReporter")
            .field("verbosity", &self.config.verbose)
            .field("external", &self.config.external.is_some())
            .finish()
    }
}

impl AuditReporter {
    pub fn with_config(config: ReporterConfig) -> Self {
        Self {
            config,
            default_handler: Arc::new(default_report_handler),
        }
    }

    pub fn new(verbose: Verbosity) -> Self {
        Self::with_config(ReporterConfig::new(verbose))
    }

    pub fn config(&self) -> &ReporterConfig {
        &self.config
    }

    pub fn set_external(&mut self, sink: Option<DiagnosticCallback>) {
        self.config.external = sink;
    }

    pub fn report(
        &self,
        message: impl Into<String>,
        level: LogLevel,
        target: Option<&str>,
        auxiliary: Option<Value>,
    ) {
        if !self.config.should_report(level) {
            return;
        }

        let record = AuditRecord::new(message, level, target.map(|t| t.to_string()), auxiliary);

        if let Some(callback) = &self.config.external {
            callback(&record);
        } else {
            (self.default_handler)(&record);
        }
    }

    pub fn error(&self, message: impl Into<String>, target: Option<&str>, auxiliary: Option<Value>) {
        self.report(message, LogLevel::Error, target, auxiliary);
    }

    pub fn info(&self, message: impl Into<String>, target: Option<&str>, auxiliary: Option<Value>) {
        self.report(message, LogLevel::Info, target, auxiliary);
    }

    pub fn debug(&self, message: impl Into<String>, target: Option<&str>, auxiliary: Option<Value>) {
        self.report(message, LogLevel::Debug, target, auxiliary);
    }

    /// Per-target banner line, emitted in diagnose mode before a page is
    /// visited.
    pub fn banner(&self, target: &str) {
        self.info(format!("--- Diagnosing {target} ---"), None, None);
    }

    /// Console message observed on a page. Error-severity messages are always
    /// reported; the rest follow the configured verbosity.
    pub fn console_message(&self, target: &str, severity: &ConsoleSeverity, text: &str) {
        let level = if severity.is_error() {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        self.report(
            format!("Console {severity}: {text}"),
            level,
            Some(target),
            None,
        );
    }

    /// Uncaught script error observed on a page.
    pub fn page_error(&self, target: &str, description: &str) {
        self.error(format!("Page error: {description}"), Some(target), None);
    }

    /// Contained per-target failure; the batch continues.
    pub fn target_failure(&self, target: &str, cause: &str, auxiliary: Option<Value>) {
        self.error(format!("Failed to load: {cause}"), Some(target), auxiliary);
    }

    /// Screenshot written for a target.
    pub fn captured(&self, target: &str, path: &std::path::Path) {
        self.info(
            format!("Screenshot saved to {}", path.display()),
            Some(target),
            None,
        );
    }
}
