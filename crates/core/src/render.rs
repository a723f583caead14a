//! Render sandbox: markup → PNG through a headless Chromium driven over CDP.
//!
//! Each call launches a dedicated browser process with its profile inside
//! the job's scratch directory, loads the markup into a single page, waits
//! for network quiescence and captures one screenshot. The process is owned
//! by a [`BrowserSession`] guard and is shut down on every exit path: an
//! orderly close on return, kill-on-drop when the future is abandoned.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RenderConfig;
use crate::error::RenderError;

/// Flags that keep the browser launchable inside restricted containers.
pub const CONTAINER_LAUNCH_FLAGS: [&str; 6] = [
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--no-zygote",
    "--single-process",
];

const PROFILE_DIR_NAME: &str = "browser-profile";
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
        }
    }
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render `markup` and write one viewport-sized PNG to `image_path`.
    async fn render_to_image(
        &self,
        markup: &str,
        image_path: &Path,
        viewport: Viewport,
    ) -> Result<(), RenderError>;
}

/// Set of in-flight request ids observed on the page.
///
/// Start and settle notifications arrive on separate CDP subscriptions, so a
/// request's settle can be seen before its start. Settled ids are remembered
/// and a late start for one of them is dropped.
#[derive(Debug, Default)]
pub struct InflightRequests {
    pending: HashSet<String>,
    settled: HashSet<String>,
}

impl InflightRequests {
    /// Redirects re-announce the same id; the set keeps one entry.
    pub fn begin(&mut self, request_id: String) {
        if !self.settled.contains(&request_id) {
            self.pending.insert(request_id);
        }
    }

    pub fn finish(&mut self, request_id: String) {
        self.pending.remove(&request_id);
        self.settled.insert(request_id);
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Started(String),
    Settled(String),
}

/// Resolve once no request has been in flight for `idle_window`.
///
/// Every event restarts the quiet period. Unbounded on its own; callers wrap
/// it in the render timeout.
pub async fn wait_for_network_idle<S>(events: S, idle_window: Duration) -> Result<(), RenderError>
where
    S: Stream<Item = NetworkEvent>,
{
    tokio::pin!(events);
    let mut inflight = InflightRequests::default();
    let mut stream_open = true;

    loop {
        let quiet = tokio::time::sleep(idle_window);
        tokio::select! {
            event = events.next(), if stream_open => match event {
                Some(NetworkEvent::Started(id)) => inflight.begin(id),
                Some(NetworkEvent::Settled(id)) => inflight.finish(id),
                None => {
                    if !inflight.is_idle() {
                        return Err(RenderError::render(format!(
                            "page event stream closed with {} request(s) in flight",
                            inflight.len()
                        )));
                    }
                    stream_open = false;
                }
            },
            _ = quiet, if inflight.is_idle() => return Ok(()),
        }
    }
}

/// Run one step of a render against the shared render `deadline`.
///
/// `budget` is the full render timeout and is reported in the error.
async fn within_deadline<T, F>(
    deadline: tokio::time::Instant,
    budget: Duration,
    step: F,
) -> Result<T, RenderError>
where
    F: Future<Output = Result<T, RenderError>>,
{
    match tokio::time::timeout_at(deadline, step).await {
        Ok(result) => result,
        Err(_) => Err(RenderError::RenderTimeout(budget)),
    }
}

/// Browser flags for one launch: the configured flags plus the window size
/// matching the viewport.
pub fn launch_args(config: &RenderConfig, viewport: Viewport) -> Vec<String> {
    let mut args = config.launch_flags.clone();
    args.push(format!("--window-size={},{}", viewport.width, viewport.height));
    if !args.iter().any(|arg| arg == "--hide-scrollbars") {
        args.push("--hide-scrollbars".to_string());
    }
    args
}

#[derive(Debug, Clone)]
pub struct ChromiumRenderer {
    config: RenderConfig,
    executable: Option<PathBuf>,
}

impl ChromiumRenderer {
    pub fn new(config: RenderConfig) -> Self {
        let executable = crate::runtime::resolve_browser_executable(config.executable.as_deref());
        Self { config, executable }
    }

    fn browser_config(
        &self,
        viewport: Viewport,
        profile_dir: &Path,
    ) -> Result<BrowserConfig, RenderError> {
        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile_dir)
            .launch_timeout(self.config.timeout())
            .request_timeout(self.config.timeout())
            .args(launch_args(&self.config, viewport));

        if let Some(executable) = &self.executable {
            builder = builder.chrome_executable(executable);
        }

        builder
            .build()
            .map_err(|e| RenderError::resource(format!("invalid browser configuration: {e}")))
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn render_to_image(
        &self,
        markup: &str,
        image_path: &Path,
        viewport: Viewport,
    ) -> Result<(), RenderError> {
        let profile_dir = image_path
            .parent()
            .map(|dir| dir.join(PROFILE_DIR_NAME))
            .ok_or_else(|| RenderError::resource("image path has no parent directory"))?;

        let browser_config = self.browser_config(viewport, &profile_dir)?;
        let budget = self.config.timeout();
        let deadline = tokio::time::Instant::now() + budget;
        let started = Instant::now();

        let launch = BrowserSession::<Browser>::launch(browser_config);
        let mut session = within_deadline(deadline, budget, launch).await?;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Browser launched"
        );

        let result = within_deadline(
            deadline,
            budget,
            session.capture(markup, image_path, viewport, &self.config),
        )
        .await;
        let teardown = session.shutdown().await;
        debug!(?teardown, "Browser shut down");

        if result.is_ok() {
            info!(
                path = %image_path.display(),
                width = viewport.width,
                height = viewport.height,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Markup rendered"
            );
        }
        result
    }
}

/// Process-level control over a launched browser.
#[async_trait]
trait BrowserProcess: Send {
    async fn close(&mut self) -> Result<(), String>;
    async fn kill(&mut self) -> Result<(), String>;
    async fn wait(&mut self) -> Result<(), String>;
}

#[async_trait]
impl BrowserProcess for Browser {
    async fn close(&mut self) -> Result<(), String> {
        Browser::close(self)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn kill(&mut self) -> Result<(), String> {
        match Browser::kill(self).await {
            Some(Err(e)) => Err(e.to_string()),
            _ => Ok(()),
        }
    }

    async fn wait(&mut self) -> Result<(), String> {
        Browser::wait(self)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// How a session's process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Closed,
    Killed,
    AlreadyReleased,
}

/// Owns one browser process and the task driving its CDP connection.
struct BrowserSession<P: BrowserProcess = Browser> {
    process: Option<P>,
    handler: JoinHandle<()>,
    grace: Duration,
}

impl BrowserSession<Browser> {
    async fn launch(config: BrowserConfig) -> Result<Self, RenderError> {
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| RenderError::resource(format!("failed to launch browser: {e}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(error) = event {
                    debug!(target: "chromiumoxide", error = %error, "CDP handler stopped");
                    break;
                }
            }
        });

        Ok(Self::new(browser, handler, CLOSE_GRACE))
    }

    fn browser(&self) -> Result<&Browser, RenderError> {
        self.process
            .as_ref()
            .ok_or_else(|| RenderError::render("browser already shut down"))
    }

    async fn capture(
        &self,
        markup: &str,
        image_path: &Path,
        viewport: Viewport,
        config: &RenderConfig,
    ) -> Result<(), RenderError> {
        let page = self
            .browser()?
            .new_page("about:blank")
            .await
            .map_err(|e| RenderError::render(format!("failed to open page: {e}")))?;

        page.execute(SetDeviceMetricsOverrideParams::new(
            i64::from(viewport.width),
            i64::from(viewport.height),
            viewport.device_scale_factor,
            false,
        ))
        .await
        .map_err(|e| RenderError::render(format!("failed to set viewport: {e}")))?;

        let events = network_events(&page).await?;
        page.set_content(markup)
            .await
            .map_err(|e| RenderError::render(format!("failed to load markup: {e}")))?;
        wait_for_network_idle(events, config.idle_window()).await?;

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(config.full_page)
            .build();
        page.save_screenshot(params, image_path)
            .await
            .map_err(|e| RenderError::render(format!("failed to capture screenshot: {e}")))?;

        Ok(())
    }
}

impl<P: BrowserProcess> BrowserSession<P> {
    fn new(process: P, handler: JoinHandle<()>, grace: Duration) -> Self {
        Self {
            process: Some(process),
            handler,
            grace,
        }
    }

    /// Orderly close with a kill fallback. Never fails.
    async fn shutdown(&mut self) -> Teardown {
        let Some(mut process) = self.process.take() else {
            self.handler.abort();
            return Teardown::AlreadyReleased;
        };

        let teardown = match tokio::time::timeout(self.grace, process.close()).await {
            Ok(Ok(())) => Teardown::Closed,
            Ok(Err(error)) => {
                warn!(error = %error, "Browser close failed; killing process");
                kill_process(&mut process).await;
                Teardown::Killed
            }
            Err(_) => {
                warn!("Browser close timed out; killing process");
                kill_process(&mut process).await;
                Teardown::Killed
            }
        };

        if let Ok(Err(error)) = tokio::time::timeout(self.grace, process.wait()).await {
            warn!(error = %error, "Failed to reap browser process");
        }
        self.handler.abort();
        teardown
    }
}

impl<P: BrowserProcess> Drop for BrowserSession<P> {
    fn drop(&mut self) {
        if self.process.take().is_some() {
            // Dropping the browser handle kills its child process.
            warn!("Browser session abandoned mid-render; process killed");
        }
        self.handler.abort();
    }
}

async fn kill_process<P: BrowserProcess>(process: &mut P) {
    if let Err(error) = process.kill().await {
        warn!(error = %error, "Failed to kill browser process");
    }
}

async fn network_events(
    page: &Page,
) -> Result<impl Stream<Item = NetworkEvent> + Send, RenderError> {
    let listen_error = |e: chromiumoxide::error::CdpError| {
        RenderError::render(format!("failed to subscribe to network events: {e}"))
    };

    let started = page
        .event_listener::<EventRequestWillBeSent>()
        .await
        .map_err(listen_error)?
        .map(|event| NetworkEvent::Started(event.request_id.inner().clone()));
    let finished = page
        .event_listener::<EventLoadingFinished>()
        .await
        .map_err(listen_error)?
        .map(|event| NetworkEvent::Settled(event.request_id.inner().clone()));
    let failed = page
        .event_listener::<EventLoadingFailed>()
        .await
        .map_err(listen_error)?
        .map(|event| NetworkEvent::Settled(event.request_id.inner().clone()));

    Ok(merge_network_events(started, finished, failed))
}

/// Interleave the three subscriptions. Ordering across them is not preserved.
fn merge_network_events<A, B, C>(
    started: A,
    finished: B,
    failed: C,
) -> impl Stream<Item = NetworkEvent> + Send
where
    A: Stream<Item = NetworkEvent> + Send,
    B: Stream<Item = NetworkEvent> + Send,
    C: Stream<Item = NetworkEvent> + Send,
{
    futures::stream::select(started, futures::stream::select(finished, failed))
}
