//! Full audit-loop tests against a scripted browser runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use page_auditor::audit::{AuditError, PageAuditor, TargetOutcome};
use page_auditor::browser::{
    BrowserRuntime, LaunchPlan, NavigationStatus, PageEvent, PageId, PageObserver, PageWatch,
    RuntimeError, SettleOptions,
};
use page_auditor::config::AuditConfig;
use page_auditor::diagnostics::{AuditRecord, ConsoleSeverity, DiagnosticCallback, LogLevel};
use page_auditor::target::{AddressBase, Target};

/// What the scripted runtime should do when a given URL is visited.
#[derive(Default, Clone)]
struct ScriptedVisit {
    /// Events delivered to the page observer during navigation.
    events: Vec<PageEvent>,
    /// Error returned from `goto`, if any.
    goto_error: Option<String>,
    /// HTTP status reported for the main document.
    http_status: Option<u16>,
    /// Whether the network-idle wait times out.
    idle_timeout: bool,
}

#[derive(Default)]
struct MockState {
    launches: u32,
    shutdowns: u32,
    next_page: u32,
    observers: HashMap<PageId, PageObserver>,
    open_pages: Vec<PageId>,
    closed_pages: Vec<PageId>,
    visited_urls: Vec<String>,
}

#[derive(Default)]
struct MockRuntime {
    script: HashMap<String, ScriptedVisit>,
    fail_launch: bool,
    fail_new_page: bool,
    fail_shutdown: bool,
    state: Mutex<MockState>,
}

impl MockRuntime {
    fn with_script(script: &[(&str, ScriptedVisit)]) -> Arc<Self> {
        Arc::new(MockRuntime {
            script: script
                .iter()
                .map(|(url, visit)| (url.to_string(), visit.clone()))
                .collect(),
            ..MockRuntime::default()
        })
    }
}

#[async_trait]
impl BrowserRuntime for MockRuntime {
    async fn launch(&self, _plan: &LaunchPlan) -> Result<(), RuntimeError> {
        if self.fail_launch {
            return Err(RuntimeError::Message("no usable chromium".to_string()));
        }
        self.state.lock().unwrap().launches += 1;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.state.lock().unwrap().shutdowns += 1;
        if self.fail_shutdown {
            return Err(RuntimeError::Message("browser refused to close".to_string()));
        }
        Ok(())
    }

    async fn new_page(&self) -> Result<PageId, RuntimeError> {
        if self.fail_new_page {
            return Err(RuntimeError::Message("target creation failed".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        let id = PageId::new(format!("page-{}", state.next_page));
        state.next_page += 1;
        state.open_pages.push(id.clone());
        Ok(id)
    }

    async fn observe_page(
        &self,
        page: &PageId,
        observer: PageObserver,
    ) -> Result<PageWatch, RuntimeError> {
        self.state
            .lock()
            .unwrap()
            .observers
            .insert(page.clone(), observer);
        Ok(PageWatch::detached())
    }

    async fn goto(&self, page: &PageId, url: &str) -> Result<NavigationStatus, RuntimeError> {
        let visit = self.script.get(url).cloned().unwrap_or_default();
        let observer = {
            let mut state = self.state.lock().unwrap();
            state.visited_urls.push(url.to_string());
            state.observers.get(page).cloned()
        };

        if let Some(observer) = observer {
            for event in &visit.events {
                observer(event.clone());
            }
        }

        if let Some(cause) = visit.goto_error {
            return Err(RuntimeError::Navigation(cause));
        }
        Ok(NavigationStatus {
            http_status: visit.http_status,
        })
    }

    async fn wait_for_network_idle(
        &self,
        _page: &PageId,
        settle: SettleOptions,
    ) -> Result<(), RuntimeError> {
        let timed_out = {
            let state = self.state.lock().unwrap();
            state
                .visited_urls
                .last()
                .and_then(|url| self.script.get(url))
                .is_some_and(|visit| visit.idle_timeout)
        };
        if timed_out {
            return Err(RuntimeError::NetworkIdleTimeout {
                timeout_ms: settle.timeout.as_millis() as u64,
                inflight: vec!["http://localhost:8080/slow.js".to_string()],
            });
        }
        Ok(())
    }

    async fn capture_screenshot(
        &self,
        page: &PageId,
        _full_page: bool,
    ) -> Result<Vec<u8>, RuntimeError> {
        Ok(format!("png:{page}").into_bytes())
    }

    async fn close_page(&self, page: &PageId) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.observers.remove(page);
        state.closed_pages.push(page.clone());
        Ok(())
    }
}

fn capturing_config(output_dir: &std::path::Path) -> (AuditConfig, Arc<Mutex<Vec<AuditRecord>>>) {
    let records = Arc::new(Mutex::new(Vec::new()));
    let capture = Arc::clone(&records);
    let sink: DiagnosticCallback = Arc::new(move |record: &AuditRecord| {
        capture.lock().unwrap().push(record.clone());
    });

    let config = AuditConfig {
        output_dir: output_dir.to_path_buf(),
        sink: Some(sink),
        ..AuditConfig::default()
    };
    (config, records)
}

fn local_targets(root: &std::path::Path, names: &[&str], prefix: &str) -> Vec<Target> {
    let base = AddressBase::LocalDir(root.to_path_buf());
    let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
    Target::resolve_all(&names, &base, prefix).expect("targets resolve")
}

#[tokio::test]
async fn successful_run_writes_one_screenshot_per_target() {
    let out = tempfile::tempdir().expect("tempdir");
    let (config, records) = capturing_config(out.path());
    let targets = local_targets(out.path(), &["index.html", "about.html"], "debug_");

    let runtime = MockRuntime::with_script(&[]);
    let auditor = PageAuditor::new(Arc::clone(&runtime), config);
    let summary = auditor.run(&targets).await.expect("run succeeds");

    assert_eq!(summary.captured(), 2);
    assert_eq!(summary.failed(), 0);
    assert!(out.path().join("debug_index.png").is_file());
    assert!(out.path().join("debug_about.png").is_file());

    let records = records.lock().unwrap();
    let errors: Vec<_> = records
        .iter()
        .filter(|record| record.level == LogLevel::Error)
        .collect();
    assert!(errors.is_empty(), "no error lines expected: {errors:?}");
    let confirmations: Vec<_> = records
        .iter()
        .filter(|record| record.message.starts_with("Screenshot saved to"))
        .collect();
    assert_eq!(confirmations.len(), 2);

    let state = runtime.state.lock().unwrap();
    assert_eq!(state.launches, 1);
    assert_eq!(state.shutdowns, 1);
    assert_eq!(state.open_pages, state.closed_pages);
}

#[tokio::test]
async fn failing_target_is_reported_and_does_not_stop_the_batch() {
    let out = tempfile::tempdir().expect("tempdir");
    let (config, records) = capturing_config(out.path());
    let targets = local_targets(out.path(), &["about.html", "index.html"], "debug_");

    let runtime = MockRuntime::with_script(&[(
        targets[0].url.as_str(),
        ScriptedVisit {
            goto_error: Some("net::ERR_FILE_NOT_FOUND".to_string()),
            ..ScriptedVisit::default()
        },
    )]);
    let auditor = PageAuditor::new(Arc::clone(&runtime), config);
    let summary = auditor.run(&targets).await.expect("run succeeds");

    assert_eq!(summary.captured(), 1);
    assert_eq!(summary.failed(), 1);
    assert!(!out.path().join("debug_about.png").exists());
    assert!(out.path().join("debug_index.png").is_file());
    assert!(matches!(
        summary.outcome_for("about.html"),
        Some(TargetOutcome::Failed(cause)) if cause.contains("net::ERR_FILE_NOT_FOUND")
    ));

    let records = records.lock().unwrap();
    let failures: Vec<_> = records
        .iter()
        .filter(|record| record.level == LogLevel::Error)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].target.as_deref(), Some("about.html"));

    // the failure did not short-circuit shutdown or the second visit
    let state = runtime.state.lock().unwrap();
    assert_eq!(state.visited_urls.len(), 2);
    assert_eq!(state.shutdowns, 1);
}

#[tokio::test]
async fn diagnostics_are_attributed_to_the_right_target() {
    let out = tempfile::tempdir().expect("tempdir");
    let (config, records) = capturing_config(out.path());
    let targets = local_targets(out.path(), &["index.html", "about.html"], "");

    let runtime = MockRuntime::with_script(&[
        (
            targets[0].url.as_str(),
            ScriptedVisit {
                events: vec![PageEvent::Console {
                    severity: ConsoleSeverity::Error,
                    text: "Three.js is not loaded.".to_string(),
                }],
                ..ScriptedVisit::default()
            },
        ),
        (
            targets[1].url.as_str(),
            ScriptedVisit {
                events: vec![PageEvent::PageError {
                    message: "ReferenceError: THREE is not defined".to_string(),
                }],
                ..ScriptedVisit::default()
            },
        ),
    ]);
    let auditor = PageAuditor::new(Arc::clone(&runtime), config);
    auditor.run(&targets).await.expect("run succeeds");

    let records = records.lock().unwrap();
    let console: Vec<_> = records
        .iter()
        .filter(|record| record.message.starts_with("Console error:"))
        .collect();
    assert_eq!(console.len(), 1);
    assert_eq!(console[0].target.as_deref(), Some("index.html"));

    let page_errors: Vec<_> = records
        .iter()
        .filter(|record| record.message.starts_with("Page error:"))
        .collect();
    assert_eq!(page_errors.len(), 1);
    assert_eq!(page_errors[0].target.as_deref(), Some("about.html"));
}

#[tokio::test]
async fn http_error_status_is_a_contained_failure() {
    let out = tempfile::tempdir().expect("tempdir");
    let (config, _records) = capturing_config(out.path());
    let base = AddressBase::HttpOrigin("http://localhost:8080".to_string());
    let names = vec!["index.html".to_string(), "about.html".to_string()];
    let targets = Target::resolve_all(&names, &base, "").expect("targets");

    let runtime = MockRuntime::with_script(&[
        (
            "http://localhost:8080/index.html",
            ScriptedVisit {
                http_status: Some(200),
                ..ScriptedVisit::default()
            },
        ),
        (
            "http://localhost:8080/about.html",
            ScriptedVisit {
                http_status: Some(404),
                ..ScriptedVisit::default()
            },
        ),
    ]);
    let auditor = PageAuditor::new(Arc::clone(&runtime), config);
    let summary = auditor.run(&targets).await.expect("run succeeds");

    assert!(out.path().join("index.png").is_file());
    assert!(!out.path().join("about.png").exists());
    assert!(matches!(
        summary.outcome_for("about.html"),
        Some(TargetOutcome::Failed(cause)) if cause.contains("404")
    ));
}

#[tokio::test]
async fn idle_timeout_is_a_contained_failure() {
    let out = tempfile::tempdir().expect("tempdir");
    let (config, records) = capturing_config(out.path());
    let targets = local_targets(out.path(), &["index.html"], "");

    let runtime = MockRuntime::with_script(&[(
        targets[0].url.as_str(),
        ScriptedVisit {
            idle_timeout: true,
            ..ScriptedVisit::default()
        },
    )]);
    let auditor = PageAuditor::new(Arc::clone(&runtime), config);
    let summary = auditor.run(&targets).await.expect("run succeeds");

    assert_eq!(summary.failed(), 1);
    assert!(!out.path().join("index.png").exists());

    let records = records.lock().unwrap();
    assert!(
        records
            .iter()
            .any(|record| record.level == LogLevel::Error
                && record.message.contains("did not go idle"))
    );

    // the page is still closed and the browser still shut down
    let state = runtime.state.lock().unwrap();
    assert_eq!(state.closed_pages.len(), 1);
    assert_eq!(state.shutdowns, 1);
}

#[tokio::test]
async fn launch_failure_is_fatal() {
    let out = tempfile::tempdir().expect("tempdir");
    let (config, _records) = capturing_config(out.path());
    let targets = local_targets(out.path(), &["index.html"], "");

    let runtime = Arc::new(MockRuntime {
        fail_launch: true,
        ..MockRuntime::default()
    });
    let auditor = PageAuditor::new(Arc::clone(&runtime), config);

    let err = auditor.run(&targets).await.expect_err("launch must fail");
    assert!(matches!(err, AuditError::Launch(_)));
    assert_eq!(runtime.state.lock().unwrap().shutdowns, 0);
}

#[tokio::test]
async fn page_open_failure_is_fatal_but_still_shuts_down() {
    let out = tempfile::tempdir().expect("tempdir");
    let (config, _records) = capturing_config(out.path());
    let targets = local_targets(out.path(), &["index.html"], "");

    let runtime = Arc::new(MockRuntime {
        fail_new_page: true,
        ..MockRuntime::default()
    });
    let auditor = PageAuditor::new(Arc::clone(&runtime), config);

    let err = auditor.run(&targets).await.expect_err("open must fail");
    assert!(matches!(err, AuditError::Page { ref target, .. } if target == "index.html"));
    assert_eq!(runtime.state.lock().unwrap().shutdowns, 1);
}

#[tokio::test]
async fn banner_lines_are_printed_only_when_enabled() {
    let out = tempfile::tempdir().expect("tempdir");
    let targets = local_targets(out.path(), &["index.html"], "debug_");

    // banner off (the default, verify-mode behavior)
    let (config, records) = capturing_config(out.path());
    let runtime = MockRuntime::with_script(&[]);
    let auditor = PageAuditor::new(Arc::clone(&runtime), config);
    auditor.run(&targets).await.expect("run succeeds");
    assert!(
        !records
            .lock()
            .unwrap()
            .iter()
            .any(|record| record.message.starts_with("---")),
        "no banner lines expected by default"
    );

    // banner on (diagnose-mode behavior)
    let (mut config, records) = capturing_config(out.path());
    config.banner = true;
    let runtime = MockRuntime::with_script(&[]);
    let auditor = PageAuditor::new(Arc::clone(&runtime), config);
    auditor.run(&targets).await.expect("run succeeds");
    let records = records.lock().unwrap();
    assert_eq!(
        records[0].message, "--- Diagnosing index.html ---",
        "banner precedes the first visit"
    );
}

#[tokio::test]
async fn visit_failure_is_not_masked_by_a_failing_shutdown() {
    let out = tempfile::tempdir().expect("tempdir");
    let (config, _records) = capturing_config(out.path());
    let targets = local_targets(out.path(), &["index.html"], "");

    let runtime = Arc::new(MockRuntime {
        fail_new_page: true,
        fail_shutdown: true,
        ..MockRuntime::default()
    });
    let auditor = PageAuditor::new(Arc::clone(&runtime), config);

    let err = auditor.run(&targets).await.expect_err("run must fail");
    assert!(
        matches!(err, AuditError::Page { ref target, .. } if target == "index.html"),
        "the visit error is the primary failure, not shutdown: {err}"
    );
    assert_eq!(runtime.state.lock().unwrap().shutdowns, 1);
}

#[tokio::test]
async fn shutdown_failure_after_a_clean_run_is_fatal() {
    let out = tempfile::tempdir().expect("tempdir");
    let (config, _records) = capturing_config(out.path());
    let targets = local_targets(out.path(), &["index.html"], "");

    let runtime = Arc::new(MockRuntime {
        fail_shutdown: true,
        ..MockRuntime::default()
    });
    let auditor = PageAuditor::new(Arc::clone(&runtime), config);

    let err = auditor.run(&targets).await.expect_err("shutdown must fail");
    assert!(matches!(err, AuditError::Shutdown(_)));
    // the screenshot was still written before shutdown
    assert!(out.path().join("index.png").is_file());
}

#[tokio::test]
async fn rerun_overwrites_previous_screenshots() {
    let out = tempfile::tempdir().expect("tempdir");
    let targets = local_targets(out.path(), &["index.html"], "debug_");

    for _ in 0..2 {
        let (config, _records) = capturing_config(out.path());
        let runtime = MockRuntime::with_script(&[]);
        let auditor = PageAuditor::new(Arc::clone(&runtime), config);
        auditor.run(&targets).await.expect("run succeeds");
    }

    let entries: Vec<_> = std::fs::read_dir(out.path())
        .expect("read output dir")
        .map(|entry| entry.expect("dir entry").file_name())
        .collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("debug_index.png")]);
}
