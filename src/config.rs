//! Strongly-typed run configuration for the page auditor.
//!
//! Configuration values can be constructed from defaults, loaded from
//! environment variables (with optional `.env` support), or merged with
//! explicit overrides so the CLI can layer flags on top of the environment.

use std::env;
use std::fmt;
use std::num::ParseIntError;
use std::path::PathBuf;

use dotenvy::dotenv;
use serde::de::{Deserialize, Deserializer, Error as DeError};
use serde::ser::{Serialize, Serializer};
use serde::{Deserialize as DeriveDeserialize, Serialize as DeriveSerialize};
use thiserror::Error;

use crate::browser::Viewport;
use crate::diagnostics::DiagnosticCallback;

/// Quiet window (milliseconds of zero in-flight requests) that declares the
/// network idle.
pub const DEFAULT_QUIET_WINDOW_MS: u64 = 500;

/// Hard deadline for reaching a quiet window after navigation.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Verbosity level for diagnostic output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Minimal,
    Medium,
    Detailed,
}

impl Verbosity {
    fn as_u8(self) -> u8 {
        match self {
            Verbosity::Minimal => 0,
            Verbosity::Medium => 1,
            Verbosity::Detailed => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Verbosity::Minimal),
            1 => Some(Verbosity::Medium),
            2 => Some(Verbosity::Detailed),
            _ => None,
        }
    }
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Medium
    }
}

impl Serialize for Verbosity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Verbosity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        Verbosity::from_u8(value).ok_or_else(|| {
            DeError::custom(format!(
                "invalid verbosity value {value}; expected 0, 1, or 2"
            ))
        })
    }
}

/// Configuration values for an audit run.
#[derive(DeriveSerialize, DeriveDeserialize, Clone)]
#[serde(default)]
pub struct AuditConfig {
    /// Directory screenshots are written to; created if missing.
    pub output_dir: PathBuf,
    /// Prefix prepended to every screenshot file name.
    pub screenshot_prefix: String,
    /// Whether screenshots capture the full scrollable page.
    pub full_page: bool,
    pub viewport: Viewport,
    pub headless: bool,
    /// Explicit Chromium binary; autodetected when unset.
    pub chrome_executable: Option<PathBuf>,
    /// Attach to an already-running browser over CDP instead of launching.
    pub cdp_url: Option<String>,
    pub user_data_dir: Option<PathBuf>,
    /// Extra command-line arguments passed to the launched browser.
    pub browser_args: Vec<String>,
    pub quiet_window_ms: u64,
    pub idle_timeout_ms: u64,
    /// Print a per-target banner line before each page is visited.
    pub banner: bool,
    pub verbose: Verbosity,
    #[serde(skip_serializing, skip_deserializing)]
    pub sink: Option<DiagnosticCallback>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            output_dir: PathBuf::from("."),
            screenshot_prefix: String::new(),
            full_page: true,
            viewport: Viewport::default(),
            headless: true,
            chrome_executable: None,
            cdp_url: None,
            user_data_dir: None,
            browser_args: Vec::new(),
            quiet_window_ms: DEFAULT_QUIET_WINDOW_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            banner: false,
            verbose: Verbosity::default(),
            sink: None,
        }
    }
}

impl AuditConfig {
    /// Construct a configuration by reading relevant environment variables,
    /// after loading a `.env` file if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv();
        let mut config = AuditConfig::default();

        if let Some(value) = env_var("AUDITOR_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(value);
        }

        if let Some(value) = env_var("AUDITOR_SCREENSHOT_PREFIX") {
            config.screenshot_prefix = value;
        }

        if let Some(value) = env_var("AUDITOR_FULL_PAGE") {
            config.full_page = parse_bool("AUDITOR_FULL_PAGE", &value)?;
        }

        if let Some(value) = env_var("AUDITOR_VIEWPORT") {
            config.viewport = parse_viewport("AUDITOR_VIEWPORT", &value)?;
        }

        if let Some(value) = env_var("AUDITOR_HEADLESS") {
            config.headless = parse_bool("AUDITOR_HEADLESS", &value)?;
        }

        if let Some(value) = env_var("AUDITOR_CHROME_BIN") {
            config.chrome_executable = Some(PathBuf::from(value));
        }

        if let Some(value) = env_var("AUDITOR_CDP_URL") {
            config.cdp_url = Some(value);
        }

        if let Some(value) = env_var("AUDITOR_USER_DATA_DIR") {
            config.user_data_dir = Some(PathBuf::from(value));
        }

        if let Some(value) = env_var("AUDITOR_BROWSER_ARGS") {
            config.browser_args = value.split_whitespace().map(str::to_string).collect();
        }

        if let Some(value) = env_var("AUDITOR_QUIET_WINDOW_MS") {
            config.quiet_window_ms = parse_u64("AUDITOR_QUIET_WINDOW_MS", &value)?;
        }

        if let Some(value) = env_var("AUDITOR_IDLE_TIMEOUT_MS") {
            config.idle_timeout_ms = parse_u64("AUDITOR_IDLE_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = env_var("AUDITOR_VERBOSE") {
            let parsed = parse_u8("AUDITOR_VERBOSE", &value)?;
            config.verbose = Verbosity::from_u8(parsed)
                .ok_or_else(|| ConfigError::invalid_enum("AUDITOR_VERBOSE", parsed.to_string()))?;
        }

        Ok(config)
    }

    /// Create a new configuration with explicit field overrides applied.
    pub fn with_overrides(&self, overrides: AuditConfigOverrides) -> AuditConfig {
        let mut next = self.clone();

        if let Some(value) = overrides.output_dir {
            next.output_dir = value;
        }
        if let Some(value) = overrides.screenshot_prefix {
            next.screenshot_prefix = value;
        }
        if let Some(value) = overrides.full_page {
            next.full_page = value;
        }
        if let Some(value) = overrides.viewport {
            next.viewport = value;
        }
        if let Some(value) = overrides.headless {
            next.headless = value;
        }
        if let Some(value) = overrides.chrome_executable {
            next.chrome_executable = value;
        }
        if let Some(value) = overrides.cdp_url {
            next.cdp_url = value;
        }
        if let Some(value) = overrides.user_data_dir {
            next.user_data_dir = value;
        }
        if let Some(value) = overrides.browser_args {
            next.browser_args = value;
        }
        if let Some(value) = overrides.quiet_window_ms {
            next.quiet_window_ms = value;
        }
        if let Some(value) = overrides.idle_timeout_ms {
            next.idle_timeout_ms = value;
        }
        if let Some(value) = overrides.banner {
            next.banner = value;
        }
        if let Some(value) = overrides.verbose {
            next.verbose = value;
        }
        if let Some(value) = overrides.sink {
            next.sink = value;
        }

        next
    }
}

/// Field-level overrides for [`AuditConfig::with_overrides`].
#[derive(Default, Clone)]
pub struct AuditConfigOverrides {
    pub output_dir: Option<PathBuf>,
    pub screenshot_prefix: Option<String>,
    pub full_page: Option<bool>,
    pub viewport: Option<Viewport>,
    pub headless: Option<bool>,
    pub chrome_executable: Option<Option<PathBuf>>,
    pub cdp_url: Option<Option<String>>,
    pub user_data_dir: Option<Option<PathBuf>>,
    pub browser_args: Option<Vec<String>>,
    pub quiet_window_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub banner: Option<bool>,
    pub verbose: Option<Verbosity>,
    pub sink: Option<Option<DiagnosticCallback>>,
}

impl fmt::Debug for AuditConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditConfig")
            .field("output_dir", &self.output_dir)
            .field("screenshot_prefix", &self.screenshot_prefix)
            .field("full_page", &self.full_page)
            .field("viewport", &self.viewport)
            .field("headless", &self.headless)
            .field("chrome_executable", &self.chrome_executable)
            .field("cdp_url", &self.cdp_url)
            .field("user_data_dir", &self.user_data_dir)
            .field("browser_args", &self.browser_args)
            .field("quiet_window_ms", &self.quiet_window_ms)
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .field("banner", &self.banner)
            .field("verbose", &self.verbose)
            .field("sink_present", &self.sink.is_some())
            .finish()
    }
}

impl fmt::Debug for AuditConfigOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditConfigOverrides")
            .field("output_dir", &self.output_dir)
            .field("screenshot_prefix", &self.screenshot_prefix)
            .field("full_page", &self.full_page)
            .field("viewport", &self.viewport)
            .field("headless", &self.headless)
            .field("chrome_executable", &self.chrome_executable)
            .field("cdp_url", &self.cdp_url)
            .field("user_data_dir", &self.user_data_dir)
            .field("browser_args", &self.browser_args)
            .field("quiet_window_ms", &self.quiet_window_ms)
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .field("banner", &self.banner)
            .field("verbose", &self.verbose)
            .field("sink", &self.sink.as_ref().map(|inner| inner.is_some()))
            .finish()
    }
}

/// Errors that can arise while constructing an [`AuditConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {field}")]
    InvalidEnumVariant { field: &'static str, value: String },
    #[error("invalid boolean '{value}' for {field}")]
    InvalidBool { field: &'static str, value: String },
    #[error("invalid number '{value}' for {field}: {source}")]
    InvalidNumber {
        field: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("invalid viewport '{value}' for {field}; expected WIDTHxHEIGHT")]
    InvalidViewport { field: &'static str, value: String },
}

impl ConfigError {
    fn invalid_enum(field: &'static str, value: String) -> Self {
        ConfigError::InvalidEnumVariant { field, value }
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            field,
            value: value.to_string(),
        }),
    }
}

fn parse_u8(field: &'static str, value: &str) -> Result<u8, ConfigError> {
    value
        .trim()
        .parse::<u8>()
        .map_err(|source| ConfigError::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|source| ConfigError::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })
}

fn parse_viewport(field: &'static str, value: &str) -> Result<Viewport, ConfigError> {
    let invalid = || ConfigError::InvalidViewport {
        field,
        value: value.to_string(),
    };
    let (width, height) = value.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
    let width = width.trim().parse::<u32>().map_err(|_| invalid())?;
    let height = height.trim().parse::<u32>().map_err(|_| invalid())?;
    Ok(Viewport { width, height })
}
