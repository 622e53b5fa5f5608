//! Headless Chromium page auditor.
//!
//! For a configured list of static pages, the auditor opens each page in an
//! isolated tab, forwards its console messages and uncaught script errors to
//! a diagnostic reporter, waits for the network to go idle, and captures a
//! full-page PNG screenshot under a deterministic file name. A single page's
//! navigation failure is reported and contained; the rest of the batch still
//! runs.
//!
//! The audit loop depends only on the [`browser::BrowserRuntime`] trait;
//! [`runtime::ChromiumoxideRuntime`] is the production implementation over
//! the Chrome DevTools Protocol.
//!
//! # Example
//!
//! ```rust,no_run
//! use page_auditor::{
//!     AddressBase, AuditConfig, ChromiumoxideRuntime, PageAuditor, Target,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = AuditConfig::from_env()?;
//! let base = AddressBase::HttpOrigin("http://localhost:8080".to_string());
//! let targets = Target::resolve_all(
//!     &["index.html".to_string(), "about.html".to_string()],
//!     &base,
//!     &config.screenshot_prefix,
//! )?;
//!
//! let auditor = PageAuditor::new(ChromiumoxideRuntime::new(), config);
//! let summary = auditor.run(&targets).await?;
//! println!("{} captured, {} failed", summary.captured(), summary.failed());
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod browser;
pub mod config;
pub mod diagnostics;
pub mod runtime;
pub mod target;

// Audit loop
pub use audit::{AuditError, AuditSummary, PageAuditor, TargetOutcome};

// Runtime seam and the chromiumoxide implementation
pub use browser::{
    BrowserRuntime, LaunchOptions, LaunchPlan, LaunchStrategy, NavigationStatus, PageEvent, PageId,
    PageObserver, PageWatch, RuntimeError, SettleOptions, Viewport,
};
pub use runtime::ChromiumoxideRuntime;

// Configuration
pub use config::{AuditConfig, AuditConfigOverrides, ConfigError, Verbosity};

// Diagnostics
pub use diagnostics::{
    AuditRecord, AuditReporter, ConsoleSeverity, DiagnosticCallback, LogLevel, ReporterConfig,
};

// Targets
pub use target::{AddressBase, Target, TargetError};
