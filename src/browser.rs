//! Browser launch primitives and the runtime capability seam.
//!
//! This module transforms the run configuration into a strongly-typed launch
//! plan and defines the [`BrowserRuntime`] trait the audit loop drives, so the
//! loop can be exercised against scripted runtimes in tests.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::AuditConfig;
use crate::diagnostics::ConsoleSeverity;

/// Viewport dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Viewport {
            width: 1280,
            height: 800,
        }
    }
}

/// Options applied to the browser instance at launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub headless: bool,
    pub viewport: Viewport,
    /// Extra command-line arguments for the browser process.
    pub args: Vec<String>,
}

/// How the runtime obtains its browser instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchStrategy {
    /// Attach to an already-running browser over CDP.
    AttachCdp { url: String },
    /// Launch a Chromium instance owned by this process.
    Launch {
        chrome_executable: Option<PathBuf>,
        user_data_dir: Option<PathBuf>,
    },
}

/// Normalised execution plan derived from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub strategy: LaunchStrategy,
    pub options: LaunchOptions,
}

impl LaunchPlan {
    pub fn from_config(config: &AuditConfig) -> Self {
        let strategy = if let Some(url) = &config.cdp_url {
            LaunchStrategy::AttachCdp { url: url.clone() }
        } else {
            LaunchStrategy::Launch {
                chrome_executable: config.chrome_executable.clone(),
                user_data_dir: config.user_data_dir.clone(),
            }
        };
        LaunchPlan {
            strategy,
            options: LaunchOptions {
                headless: config.headless,
                viewport: config.viewport,
                args: config.browser_args.clone(),
            },
        }
    }
}

/// Network quiescence parameters for the post-navigation wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleOptions {
    /// Span with zero in-flight requests that declares the network idle.
    pub quiet_window: Duration,
    /// Hard deadline for reaching a quiet window.
    pub timeout: Duration,
}

impl SettleOptions {
    pub fn from_config(config: &AuditConfig) -> Self {
        SettleOptions {
            quiet_window: Duration::from_millis(config.quiet_window_ms),
            timeout: Duration::from_millis(config.idle_timeout_ms),
        }
    }
}

/// Opaque identifier for a page owned by a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageId(String);

impl PageId {
    pub fn new(id: impl Into<String>) -> Self {
        PageId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event surfaced by an observed page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    /// A console API call on the page.
    Console {
        severity: ConsoleSeverity,
        text: String,
    },
    /// An uncaught script error on the page.
    PageError { message: String },
}

/// Callback invoked for every event on an observed page.
pub type PageObserver = Arc<dyn Fn(PageEvent) + Send + Sync + 'static>;

/// Subscription guard for a page's event forwarding; dropping it stops the
/// forwarding tasks.
pub struct PageWatch {
    tasks: Vec<JoinHandle<()>>,
}

impl PageWatch {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    /// A watch with nothing to tear down, for runtimes that deliver events
    /// synchronously.
    pub fn detached() -> Self {
        Self { tasks: Vec::new() }
    }
}

impl Drop for PageWatch {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl fmt::Debug for PageWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageWatch")
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

/// Outcome of a successful navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationStatus {
    /// HTTP status of the main document response; `None` for schemes without
    /// one, such as `file://`.
    pub http_status: Option<u16>,
}

impl NavigationStatus {
    pub fn is_http_error(&self) -> bool {
        self.http_status.is_some_and(|status| status >= 400)
    }
}

/// Capability seam between the audit loop and an actual browser.
#[async_trait]
pub trait BrowserRuntime: Send + Sync {
    /// Acquire a browser instance according to the plan.
    async fn launch(&self, plan: &LaunchPlan) -> Result<(), RuntimeError>;

    /// Release the browser instance and any remaining pages.
    async fn shutdown(&self) -> Result<(), RuntimeError>;

    /// Open a fresh, isolated page.
    async fn new_page(&self) -> Result<PageId, RuntimeError>;

    /// Subscribe the observer to the page's console messages and uncaught
    /// script errors. Must be called before navigation so no event is missed.
    async fn observe_page(
        &self,
        page: &PageId,
        observer: PageObserver,
    ) -> Result<PageWatch, RuntimeError>;

    /// Navigate the page and report the main document response status.
    async fn goto(&self, page: &PageId, url: &str) -> Result<NavigationStatus, RuntimeError>;

    /// Wait until no tracked requests are in flight for the configured quiet
    /// window, or fail once the timeout elapses.
    async fn wait_for_network_idle(
        &self,
        page: &PageId,
        settle: SettleOptions,
    ) -> Result<(), RuntimeError>;

    /// Capture a PNG screenshot of the page.
    async fn capture_screenshot(
        &self,
        page: &PageId,
        full_page: bool,
    ) -> Result<Vec<u8>, RuntimeError>;

    /// Close the page and discard its state.
    async fn close_page(&self, page: &PageId) -> Result<(), RuntimeError>;
}

#[async_trait]
impl<R: BrowserRuntime> BrowserRuntime for Arc<R> {
    async fn launch(&self, plan: &LaunchPlan) -> Result<(), RuntimeError> {
        (**self).launch(plan).await
    }

    async fn shutdown(&self) -> Result<(), RuntimeError> {
        (**self).shutdown().await
    }

    async fn new_page(&self) -> Result<PageId, RuntimeError> {
        (**self).new_page().await
    }

    async fn observe_page(
        &self,
        page: &PageId,
        observer: PageObserver,
    ) -> Result<PageWatch, RuntimeError> {
        (**self).observe_page(page, observer).await
    }

    async fn goto(&self, page: &PageId, url: &str) -> Result<NavigationStatus, RuntimeError> {
        (**self).goto(page, url).await
    }

    async fn wait_for_network_idle(
        &self,
        page: &PageId,
        settle: SettleOptions,
    ) -> Result<(), RuntimeError> {
        (**self).wait_for_network_idle(page, settle).await
    }

    async fn capture_screenshot(
        &self,
        page: &PageId,
        full_page: bool,
    ) -> Result<Vec<u8>, RuntimeError> {
        (**self).capture_screenshot(page, full_page).await
    }

    async fn close_page(&self, page: &PageId) -> Result<(), RuntimeError> {
        (**self).close_page(page).await
    }
}

/// Errors surfaced by a browser runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("browser runtime error: {0}")]
    Message(String),
    #[error("browser runtime not initialized")]
    NotInitialized,
    #[error("unknown page {0}")]
    PageNotFound(PageId),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("main document returned HTTP {0}")]
    HttpStatus(u16),
    #[error("network did not go idle within {timeout_ms} ms ({} requests in flight)", inflight.len())]
    NetworkIdleTimeout {
        timeout_ms: u64,
        /// URLs of the requests still outstanding when the deadline hit.
        inflight: Vec<String>,
    },
    #[error("screenshot capture failed: {0}")]
    Screenshot(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_prefers_cdp_attachment_when_configured() {
        let config = AuditConfig {
            cdp_url: Some("http://127.0.0.1:9222".to_string()),
            chrome_executable: Some(PathBuf::from("/usr/bin/chromium")),
            ..AuditConfig::default()
        };
        let plan = LaunchPlan::from_config(&config);
        assert_eq!(
            plan.strategy,
            LaunchStrategy::AttachCdp {
                url: "http://127.0.0.1:9222".to_string()
            }
        );
    }

    #[test]
    fn plan_carries_launch_options_from_config() {
        let config = AuditConfig {
            headless: false,
            viewport: Viewport {
                width: 1024,
                height: 768,
            },
            browser_args: vec!["--no-sandbox".to_string()],
            user_data_dir: Some(PathBuf::from("/tmp/profile")),
            ..AuditConfig::default()
        };
        let plan = LaunchPlan::from_config(&config);
        match plan.strategy {
            LaunchStrategy::Launch {
                chrome_executable,
                user_data_dir,
            } => {
                assert!(chrome_executable.is_none());
                assert_eq!(user_data_dir, Some(PathBuf::from("/tmp/profile")));
            }
            LaunchStrategy::AttachCdp { .. } => panic!("expected launch strategy"),
        }
        assert!(!plan.options.headless);
        assert_eq!(plan.options.viewport.width, 1024);
        assert_eq!(plan.options.args, vec!["--no-sandbox".to_string()]);
    }

    #[test]
    fn settle_options_convert_milliseconds() {
        let config = AuditConfig {
            quiet_window_ms: 250,
            idle_timeout_ms: 5_000,
            ..AuditConfig::default()
        };
        let settle = SettleOptions::from_config(&config);
        assert_eq!(settle.quiet_window, Duration::from_millis(250));
        assert_eq!(settle.timeout, Duration::from_millis(5_000));
    }

    #[test]
    fn http_error_statuses_are_detected() {
        assert!(!NavigationStatus { http_status: None }.is_http_error());
        assert!(
            !NavigationStatus {
                http_status: Some(200)
            }
            .is_http_error()
        );
        assert!(
            NavigationStatus {
                http_status: Some(404)
            }
            .is_http_error()
        );
        assert!(
            NavigationStatus {
                http_status: Some(500)
            }
            .is_http_error()
        );
    }

    #[test]
    fn idle_timeout_error_reports_outstanding_request_count() {
        let err = RuntimeError::NetworkIdleTimeout {
            timeout_ms: 30_000,
            inflight: vec![
                "http://localhost:8080/slow.js".to_string(),
                "http://localhost:8080/slow.css".to_string(),
            ],
        };
        assert_eq!(
            err.to_string(),
            "network did not go idle within 30000 ms (2 requests in flight)"
        );
    }
}
