//! Chromiumoxide-based browser runtime.
//!
//! Provides the implementation of [`BrowserRuntime`](crate::browser::BrowserRuntime)
//! backed by the `chromiumoxide` crate: launching or attaching to Chromium,
//! forwarding console and exception events to page observers, navigation with
//! main-document status capture, the network-idle wait, and screenshots.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::IntoEventKind;
use chromiumoxide::cdp::browser_protocol::network::{
    self, EventLoadingFailed, EventLoadingFinished, EventRequestServedFromCache,
    EventRequestWillBeSent, EventResponseReceived, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page as page_domain;
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, EventFrameStoppedLoading,
};
use chromiumoxide::cdp::js_protocol::runtime::{
    self as runtime_domain, ConsoleApiCalledType, EventConsoleApiCalled, EventExceptionThrown,
    ExceptionDetails, RemoteObject,
};
use chromiumoxide::listeners::EventStream;
use chromiumoxide::page::{Page as ChromiumPage, ScreenshotParams};
use futures_util::StreamExt;
use log::{debug, warn};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Sleep};

use crate::browser::{
    BrowserRuntime, LaunchPlan, LaunchStrategy, NavigationStatus, PageEvent, PageId, PageObserver,
    PageWatch, RuntimeError, SettleOptions,
};
use crate::diagnostics::ConsoleSeverity;

/// Grace period for the main-document response to arrive after `goto`
/// resolves; normally it has long been delivered by then.
const RESPONSE_STATUS_GRACE: Duration = Duration::from_millis(1_000);

pub struct ChromiumoxideRuntime {
    state: Arc<Mutex<Option<RuntimeState>>>,
}

struct RuntimeState {
    browser: Browser,
    handler: JoinHandle<()>,
    pages: HashMap<PageId, ChromiumPage>,
    /// Whether this runtime spawned the browser process (as opposed to
    /// attaching over CDP); only spawned browsers are closed on shutdown.
    owns_process: bool,
}

impl ChromiumoxideRuntime {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(None)),
        }
    }

    async fn page(&self, page_id: &PageId) -> Result<ChromiumPage, RuntimeError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(RuntimeError::NotInitialized)?;
        state
            .pages
            .get(page_id)
            .cloned()
            .ok_or_else(|| RuntimeError::PageNotFound(page_id.clone()))
    }
}

impl Default for ChromiumoxideRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserRuntime for ChromiumoxideRuntime {
    async fn launch(&self, plan: &LaunchPlan) -> Result<(), RuntimeError> {
        if self.state.lock().await.is_some() {
            return Ok(());
        }

        let (browser, handler, owns_process) = match &plan.strategy {
            LaunchStrategy::AttachCdp { url } => {
                let (browser, handler) = Browser::connect(url)
                    .await
                    .map_err(map_chromiumoxide_error)?;
                (browser, handler, false)
            }
            LaunchStrategy::Launch { .. } => {
                let config = build_config(plan)?;
                let (browser, handler) = Browser::launch(config)
                    .await
                    .map_err(map_chromiumoxide_error)?;
                (browser, handler, true)
            }
        };

        let handler = spawn_handler(handler);
        let mut guard = self.state.lock().await;
        *guard = Some(RuntimeState {
            browser,
            handler,
            pages: HashMap::new(),
            owns_process,
        });

        Ok(())
    }

    async fn shutdown(&self) -> Result<(), RuntimeError> {
        let state = {
            let mut guard = self.state.lock().await;
            guard.take()
        };

        let Some(mut state) = state else {
            return Ok(());
        };

        // The handler task must keep pumping messages while the close
        // command round-trips, so it is aborted afterwards.
        let result = if state.owns_process {
            state
                .browser
                .close()
                .await
                .map(|_| ())
                .map_err(map_chromiumoxide_error)
        } else {
            Ok(())
        };
        state.handler.abort();
        state.pages.clear();

        result
    }

    async fn new_page(&self) -> Result<PageId, RuntimeError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(RuntimeError::NotInitialized)?;

        let page = state
            .browser
            .new_page("about:blank")
            .await
            .map_err(map_chromiumoxide_error)?;
        let page_id = PageId::new(page.target_id().as_ref().to_string());
        state.pages.insert(page_id.clone(), page);

        Ok(page_id)
    }

    async fn observe_page(
        &self,
        page_id: &PageId,
        observer: PageObserver,
    ) -> Result<PageWatch, RuntimeError> {
        let page = self.page(page_id).await?;

        // Console and exception events only flow while the Runtime domain is
        // enabled on the target.
        if let Err(err) = page.execute(runtime_domain::EnableParams::default()).await {
            debug!("failed to enable Runtime domain on {page_id}: {err}");
        }

        let tasks = vec![
            spawn_observer_listener(
                page.event_listener::<EventConsoleApiCalled>()
                    .await
                    .map_err(map_chromiumoxide_error)?,
                Arc::clone(&observer),
                |event| PageEvent::Console {
                    severity: console_severity(&event.r#type),
                    text: render_console_args(&event.args),
                },
            ),
            spawn_observer_listener(
                page.event_listener::<EventExceptionThrown>()
                    .await
                    .map_err(map_chromiumoxide_error)?,
                observer,
                |event| PageEvent::PageError {
                    message: describe_exception(&event.exception_details),
                },
            ),
        ];

        Ok(PageWatch::new(tasks))
    }

    async fn goto(&self, page_id: &PageId, url: &str) -> Result<NavigationStatus, RuntimeError> {
        let page = self.page(page_id).await?;

        // Subscribe before navigating so the main-document response is not
        // missed. On a fresh page the first document response belongs to
        // this navigation.
        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(map_chromiumoxide_error)?;
        let (status_tx, status_rx) = oneshot::channel();
        let status_listener = tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                if matches!(event.r#type, ResourceType::Document) {
                    let _ = status_tx.send(event.response.status);
                    break;
                }
            }
        });

        if let Err(err) = page.goto(url).await {
            status_listener.abort();
            return Err(RuntimeError::Navigation(err.to_string()));
        }

        let http_status = match time::timeout(RESPONSE_STATUS_GRACE, status_rx).await {
            // Schemes without HTTP semantics (file://) report status 0.
            Ok(Ok(status)) => u16::try_from(status).ok().filter(|status| *status != 0),
            _ => None,
        };
        status_listener.abort();

        Ok(NavigationStatus { http_status })
    }

    async fn wait_for_network_idle(
        &self,
        page_id: &PageId,
        settle: SettleOptions,
    ) -> Result<(), RuntimeError> {
        let page = self.page(page_id).await?;

        for result in [
            page.execute(network::EnableParams::default())
                .await
                .map(|_| ()),
            page.execute(page_domain::EnableParams::default())
                .await
                .map(|_| ()),
        ] {
            if let Err(err) = result {
                debug!("failed to enable a CDP domain before idle wait on {page_id}: {err}");
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener_handles: Vec<JoinHandle<()>> = Vec::new();

        listener_handles.push(spawn_settle_listener(
            page.event_listener::<EventRequestWillBeSent>()
                .await
                .map_err(map_chromiumoxide_error)?,
            tx.clone(),
            SettleEvent::RequestWillBeSent,
        ));
        listener_handles.push(spawn_settle_listener(
            page.event_listener::<EventLoadingFinished>()
                .await
                .map_err(map_chromiumoxide_error)?,
            tx.clone(),
            SettleEvent::LoadingFinished,
        ));
        listener_handles.push(spawn_settle_listener(
            page.event_listener::<EventLoadingFailed>()
                .await
                .map_err(map_chromiumoxide_error)?,
            tx.clone(),
            SettleEvent::LoadingFailed,
        ));
        listener_handles.push(spawn_settle_listener(
            page.event_listener::<EventRequestServedFromCache>()
                .await
                .map_err(map_chromiumoxide_error)?,
            tx.clone(),
            SettleEvent::RequestServedFromCache,
        ));
        listener_handles.push(spawn_settle_listener(
            page.event_listener::<EventResponseReceived>()
                .await
                .map_err(map_chromiumoxide_error)?,
            tx.clone(),
            SettleEvent::ResponseReceived,
        ));
        listener_handles.push(spawn_settle_listener(
            page.event_listener::<EventFrameStoppedLoading>()
                .await
                .map_err(map_chromiumoxide_error)?,
            tx.clone(),
            SettleEvent::FrameStopped,
        ));
        drop(tx);

        let mut inflight: HashSet<String> = HashSet::new();
        let mut urls: HashMap<String, String> = HashMap::new();
        let mut doc_by_frame: HashMap<String, String> = HashMap::new();

        let mut quiet_timer: Option<Pin<Box<Sleep>>> = None;
        start_quiet_timer(&mut quiet_timer, settle.quiet_window);
        let mut deadline = Box::pin(time::sleep(settle.timeout));

        let result = loop {
            tokio::select! {
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            handle_settle_event(
                                event,
                                &mut inflight,
                                &mut urls,
                                &mut doc_by_frame,
                                &mut quiet_timer,
                                settle.quiet_window,
                            );
                        }
                        None => break Ok(()),
                    }
                }
                _ = async {
                    if let Some(timer) = quiet_timer.as_mut() {
                        timer.as_mut().await;
                    }
                }, if quiet_timer.is_some() => {
                    break Ok(());
                }
                _ = &mut deadline => {
                    let mut pending: Vec<String> = inflight
                        .iter()
                        .map(|id| urls.get(id).cloned().unwrap_or_else(|| id.clone()))
                        .collect();
                    pending.sort();
                    break Err(RuntimeError::NetworkIdleTimeout {
                        timeout_ms: settle.timeout.as_millis() as u64,
                        inflight: pending,
                    });
                }
            }
        };

        for handle in listener_handles {
            handle.abort();
        }

        result
    }

    async fn capture_screenshot(
        &self,
        page_id: &PageId,
        full_page: bool,
    ) -> Result<Vec<u8>, RuntimeError> {
        let page = self.page(page_id).await?;
        page.screenshot(
            ScreenshotParams::builder()
                .format(CaptureScreenshotFormat::Png)
                .full_page(full_page)
                .build(),
        )
        .await
        .map_err(|err| RuntimeError::Screenshot(err.to_string()))
    }

    async fn close_page(&self, page_id: &PageId) -> Result<(), RuntimeError> {
        let page = {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().ok_or(RuntimeError::NotInitialized)?;
            state
                .pages
                .remove(page_id)
                .ok_or_else(|| RuntimeError::PageNotFound(page_id.clone()))?
        };

        page.close().await.map_err(map_chromiumoxide_error)
    }
}

fn build_config(plan: &LaunchPlan) -> Result<BrowserConfig, RuntimeError> {
    let options = &plan.options;

    let viewport = chromiumoxide::handler::viewport::Viewport {
        width: options.viewport.width,
        height: options.viewport.height,
        device_scale_factor: None,
        emulating_mobile: false,
        is_landscape: options.viewport.width >= options.viewport.height,
        has_touch: false,
    };

    let mut builder = BrowserConfig::builder();

    if let LaunchStrategy::Launch {
        chrome_executable,
        user_data_dir,
    } = &plan.strategy
    {
        if let Some(path) = chrome_executable {
            builder = builder.chrome_executable(path);
        }
        if let Some(dir) = user_data_dir {
            builder = builder.user_data_dir(dir);
        }
    }

    let builder = builder.viewport(viewport).args(options.args.clone());

    let builder = if options.headless {
        builder
    } else {
        builder.with_head()
    };

    builder.build().map_err(RuntimeError::Message)
}

fn map_chromiumoxide_error<E: std::fmt::Display>(err: E) -> RuntimeError {
    RuntimeError::Message(err.to_string())
}

fn spawn_handler(mut handler: chromiumoxide::handler::Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(result) = handler.next().await {
            if let Err(err) = result {
                warn!("chromiumoxide handler error: {err}");
            }
        }
    })
}

fn spawn_observer_listener<T, F>(
    mut stream: EventStream<T>,
    observer: PageObserver,
    map: F,
) -> JoinHandle<()>
where
    T: IntoEventKind + Unpin + Send + 'static,
    F: Fn(&T) -> PageEvent + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            observer(map(&event));
        }
    })
}

fn console_severity(kind: &ConsoleApiCalledType) -> ConsoleSeverity {
    match kind {
        ConsoleApiCalledType::Log => ConsoleSeverity::Log,
        ConsoleApiCalledType::Debug => ConsoleSeverity::Debug,
        ConsoleApiCalledType::Info => ConsoleSeverity::Info,
        ConsoleApiCalledType::Warning => ConsoleSeverity::Warning,
        ConsoleApiCalledType::Error => ConsoleSeverity::Error,
        other => ConsoleSeverity::Other(format!("{other:?}").to_ascii_lowercase()),
    }
}

fn render_console_args(args: &[RemoteObject]) -> String {
    let rendered: Vec<String> = args.iter().map(render_remote_object).collect();
    rendered.join(" ")
}

fn render_remote_object(arg: &RemoteObject) -> String {
    if let Some(value) = &arg.value {
        match value {
            JsonValue::String(text) => text.clone(),
            other => other.to_string(),
        }
    } else if let Some(description) = &arg.description {
        description.clone()
    } else {
        "undefined".to_string()
    }
}

fn describe_exception(details: &ExceptionDetails) -> String {
    details
        .exception
        .as_ref()
        .and_then(|exception| exception.description.clone())
        .unwrap_or_else(|| details.text.clone())
}

enum SettleEvent {
    RequestWillBeSent(EventRequestWillBeSent),
    LoadingFinished(EventLoadingFinished),
    LoadingFailed(EventLoadingFailed),
    RequestServedFromCache(EventRequestServedFromCache),
    ResponseReceived(EventResponseReceived),
    FrameStopped(EventFrameStoppedLoading),
}

fn spawn_settle_listener<T, F>(
    mut stream: EventStream<T>,
    tx: mpsc::UnboundedSender<SettleEvent>,
    map: F,
) -> JoinHandle<()>
where
    T: IntoEventKind + Clone + Unpin + Send + 'static,
    F: Fn(T) -> SettleEvent + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            let owned = (*event).clone();
            if tx.send(map(owned)).is_err() {
                break;
            }
        }
    })
}

fn handle_settle_event(
    event: SettleEvent,
    inflight: &mut HashSet<String>,
    urls: &mut HashMap<String, String>,
    doc_by_frame: &mut HashMap<String, String>,
    quiet_timer: &mut Option<Pin<Box<Sleep>>>,
    quiet_window: Duration,
) {
    match event {
        SettleEvent::RequestWillBeSent(ev) => {
            // Long-lived streams never finish; they must not hold the page
            // out of idle.
            if matches!(
                ev.r#type.as_ref(),
                Some(ResourceType::WebSocket | ResourceType::EventSource)
            ) {
                return;
            }

            let request_id = ev.request_id.as_ref().to_string();
            inflight.insert(request_id.clone());
            urls.insert(request_id.clone(), ev.request.url.clone());

            if matches!(ev.r#type.as_ref(), Some(ResourceType::Document)) {
                if let Some(frame_id) = ev.frame_id.as_ref() {
                    doc_by_frame.insert(frame_id.as_ref().to_string(), request_id.clone());
                }
            }

            clear_quiet_timer(quiet_timer);
        }
        SettleEvent::LoadingFinished(ev) => {
            finish_request(
                ev.request_id.as_ref(),
                inflight,
                urls,
                doc_by_frame,
                quiet_timer,
                quiet_window,
            );
        }
        SettleEvent::LoadingFailed(ev) => {
            finish_request(
                ev.request_id.as_ref(),
                inflight,
                urls,
                doc_by_frame,
                quiet_timer,
                quiet_window,
            );
        }
        SettleEvent::RequestServedFromCache(ev) => {
            finish_request(
                ev.request_id.as_ref(),
                inflight,
                urls,
                doc_by_frame,
                quiet_timer,
                quiet_window,
            );
        }
        SettleEvent::ResponseReceived(ev) => {
            if ev.response.url.starts_with("data:") {
                finish_request(
                    ev.request_id.as_ref(),
                    inflight,
                    urls,
                    doc_by_frame,
                    quiet_timer,
                    quiet_window,
                );
            }
        }
        SettleEvent::FrameStopped(ev) => {
            let frame_id = ev.frame_id.as_ref().to_string();
            if let Some(request_id) = doc_by_frame.remove(&frame_id) {
                finish_request(
                    &request_id,
                    inflight,
                    urls,
                    doc_by_frame,
                    quiet_timer,
                    quiet_window,
                );
            }
        }
    }

    if inflight.is_empty() {
        start_quiet_timer(quiet_timer, quiet_window);
    }
}

fn finish_request(
    request_id: &str,
    inflight: &mut HashSet<String>,
    urls: &mut HashMap<String, String>,
    doc_by_frame: &mut HashMap<String, String>,
    quiet_timer: &mut Option<Pin<Box<Sleep>>>,
    quiet_window: Duration,
) {
    let was_inflight = inflight.remove(request_id);
    urls.remove(request_id);
    doc_by_frame.retain(|_, rid| rid != request_id);

    if was_inflight {
        clear_quiet_timer(quiet_timer);
    }

    if inflight.is_empty() {
        start_quiet_timer(quiet_timer, quiet_window);
    }
}

fn start_quiet_timer(timer: &mut Option<Pin<Box<Sleep>>>, quiet_window: Duration) {
    if timer.is_none() {
        timer.replace(Box::pin(time::sleep(quiet_window)));
    }
}

fn clear_quiet_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    if timer.is_some() {
        timer.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_require_initialisation() {
        let runtime = ChromiumoxideRuntime::new();

        assert!(matches!(
            runtime.new_page().await,
            Err(RuntimeError::NotInitialized)
        ));
        assert!(matches!(
            runtime.goto(&PageId::new("page-1"), "http://localhost").await,
            Err(RuntimeError::NotInitialized)
        ));
        assert!(matches!(
            runtime.close_page(&PageId::new("page-1")).await,
            Err(RuntimeError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn shutdown_without_launch_is_a_no_op() {
        let runtime = ChromiumoxideRuntime::new();
        runtime.shutdown().await.expect("shutdown");
        runtime.shutdown().await.expect("second shutdown");
    }

    #[test]
    fn console_severity_maps_known_and_unknown_kinds() {
        assert_eq!(
            console_severity(&ConsoleApiCalledType::Error),
            ConsoleSeverity::Error
        );
        assert_eq!(
            console_severity(&ConsoleApiCalledType::Warning),
            ConsoleSeverity::Warning
        );
        assert_eq!(
            console_severity(&ConsoleApiCalledType::Dir),
            ConsoleSeverity::Other("dir".to_string())
        );
    }

    #[tokio::test]
    async fn quiet_timer_starts_once_and_clears() {
        let mut timer: Option<Pin<Box<Sleep>>> = None;
        let window = Duration::from_millis(500);

        start_quiet_timer(&mut timer, window);
        assert!(timer.is_some());
        start_quiet_timer(&mut timer, window);
        assert!(timer.is_some());

        clear_quiet_timer(&mut timer);
        assert!(timer.is_none());
    }
}
