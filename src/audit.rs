//! The page audit loop.
//!
//! [`PageAuditor`] visits a configured list of targets one at a time: open a
//! fresh page, subscribe to its console and error events, navigate, wait for
//! the network to go idle, capture a full-page screenshot, close the page.
//! A single target's navigation failure is reported and contained; the
//! browser instance is released exactly once when the run ends.

use std::path::PathBuf;
use std::sync::Arc;

use log::warn;
use thiserror::Error;

use crate::browser::{
    BrowserRuntime, LaunchPlan, PageEvent, PageId, PageObserver, RuntimeError, SettleOptions,
};
use crate::config::AuditConfig;
use crate::diagnostics::{AuditReporter, ReporterConfig};
use crate::target::{Target, TargetError};

/// Outcome recorded for a single target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    /// Screenshot written to the given path.
    Captured(PathBuf),
    /// Contained failure; the cause as reported to the user.
    Failed(String),
}

impl TargetOutcome {
    pub fn is_captured(&self) -> bool {
        matches!(self, TargetOutcome::Captured(_))
    }
}

/// Per-target results of a completed run, in configured order.
#[derive(Debug, Default)]
pub struct AuditSummary {
    pub outcomes: Vec<(String, TargetOutcome)>,
}

impl AuditSummary {
    pub fn captured(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_captured())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.captured()
    }

    pub fn outcome_for(&self, target: &str) -> Option<&TargetOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == target)
            .map(|(_, outcome)| outcome)
    }
}

/// Fatal errors: anything outside the per-target containment boundary.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to resolve targets: {0}")]
    Target(#[from] TargetError),
    #[error("failed to launch browser: {0}")]
    Launch(#[source] RuntimeError),
    #[error("page lifecycle failure for {target}: {source}")]
    Page {
        target: String,
        #[source]
        source: RuntimeError,
    },
    #[error("failed to create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to shut down browser: {0}")]
    Shutdown(#[source] RuntimeError),
}

/// Sequential page auditor over any [`BrowserRuntime`].
pub struct PageAuditor<R: BrowserRuntime> {
    runtime: R,
    config: AuditConfig,
    reporter: Arc<AuditReporter>,
}

impl<R: BrowserRuntime> PageAuditor<R> {
    pub fn new(runtime: R, config: AuditConfig) -> Self {
        let mut reporter_config = ReporterConfig::new(config.verbose);
        reporter_config.external = config.sink.clone();
        let reporter = Arc::new(AuditReporter::with_config(reporter_config));
        Self {
            runtime,
            config,
            reporter,
        }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Visit every target in order and return the per-target outcomes.
    ///
    /// The browser is launched once up front and shut down exactly once at
    /// the end, also when the visit loop fails partway through.
    pub async fn run(&self, targets: &[Target]) -> Result<AuditSummary, AuditError> {
        let plan = LaunchPlan::from_config(&self.config);
        self.runtime
            .launch(&plan)
            .await
            .map_err(AuditError::Launch)?;

        let result = self.visit_all(targets).await;
        let shutdown = self.runtime.shutdown().await;

        match result {
            Ok(summary) => {
                shutdown.map_err(AuditError::Shutdown)?;
                Ok(summary)
            }
            // The visit error is the primary failure; a shutdown error on
            // top of it must not mask it, only be logged.
            Err(err) => {
                if let Err(shutdown_err) = shutdown {
                    warn!("browser shutdown also failed: {shutdown_err}");
                }
                Err(err)
            }
        }
    }

    async fn visit_all(&self, targets: &[Target]) -> Result<AuditSummary, AuditError> {
        tokio::fs::create_dir_all(&self.config.output_dir)
            .await
            .map_err(|source| AuditError::OutputDir {
                path: self.config.output_dir.clone(),
                source,
            })?;

        let mut summary = AuditSummary::default();
        for target in targets {
            if self.config.banner {
                self.reporter.banner(&target.name);
            }
            let outcome = self.visit(target).await?;
            summary.outcomes.push((target.name.clone(), outcome));
        }
        Ok(summary)
    }

    /// Audit one target. Navigation, idle-wait, capture, and write failures
    /// are contained here; page open/observe/close failures propagate.
    async fn visit(&self, target: &Target) -> Result<TargetOutcome, AuditError> {
        let page = self
            .runtime
            .new_page()
            .await
            .map_err(|source| self.page_error(target, source))?;

        let watch = self
            .runtime
            .observe_page(&page, self.observer_for(target))
            .await
            .map_err(|source| self.page_error(target, source))?;

        let outcome = match self.navigate_and_capture(&page, target).await {
            Ok(path) => {
                self.reporter.captured(&target.name, &path);
                TargetOutcome::Captured(path)
            }
            Err(cause) => {
                self.reporter.target_failure(&target.name, &cause, None);
                TargetOutcome::Failed(cause)
            }
        };

        drop(watch);
        self.runtime
            .close_page(&page)
            .await
            .map_err(|source| self.page_error(target, source))?;

        Ok(outcome)
    }

    /// The contained portion of a visit. Any error here is rendered to the
    /// failure cause printed for the target.
    async fn navigate_and_capture(
        &self,
        page: &PageId,
        target: &Target,
    ) -> Result<PathBuf, String> {
        let status = self
            .runtime
            .goto(page, &target.url)
            .await
            .map_err(|err| err.to_string())?;

        if let Some(code) = status.http_status.filter(|_| status.is_http_error()) {
            return Err(RuntimeError::HttpStatus(code).to_string());
        }

        self.runtime
            .wait_for_network_idle(page, SettleOptions::from_config(&self.config))
            .await
            .map_err(|err| err.to_string())?;

        let bytes = self
            .runtime
            .capture_screenshot(page, self.config.full_page)
            .await
            .map_err(|err| err.to_string())?;

        let path = self.config.output_dir.join(&target.artifact);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|err| format!("failed to write {}: {err}", path.display()))?;

        Ok(path)
    }

    fn observer_for(&self, target: &Target) -> PageObserver {
        let reporter = Arc::clone(&self.reporter);
        let name = target.name.clone();
        Arc::new(move |event| match event {
            PageEvent::Console { severity, text } => {
                reporter.console_message(&name, &severity, &text);
            }
            PageEvent::PageError { message } => {
                reporter.page_error(&name, &message);
            }
        })
    }

    fn page_error(&self, target: &Target, source: RuntimeError) -> AuditError {
        AuditError::Page {
            target: target.name.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_outcomes() {
        let summary = AuditSummary {
            outcomes: vec![
                (
                    "index.html".to_string(),
                    TargetOutcome::Captured(PathBuf::from("index.png")),
                ),
                (
                    "about.html".to_string(),
                    TargetOutcome::Failed("net::ERR_FILE_NOT_FOUND".to_string()),
                ),
            ],
        };

        assert_eq!(summary.captured(), 1);
        assert_eq!(summary.failed(), 1);
        assert!(
            summary
                .outcome_for("index.html")
                .is_some_and(TargetOutcome::is_captured)
        );
        assert_eq!(
            summary.outcome_for("about.html"),
            Some(&TargetOutcome::Failed("net::ERR_FILE_NOT_FOUND".to_string()))
        );
        assert!(summary.outcome_for("missing.html").is_none());
    }
}
