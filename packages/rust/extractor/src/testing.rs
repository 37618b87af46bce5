//! Scripted in-memory rendering engine for tests.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use questiontree_shared::{Device, QuestionTreeError, Result};

use crate::browser::{
    BrowserLauncher, Capture, ElementHandle, ElementInfo, LaunchOptions, LoadState, PageSession,
    Viewport,
};
use crate::dom::SharedDom;
use crate::query::PageRequest;

#[derive(Default)]
struct Counters {
    launched: AtomicUsize,
    closed: AtomicUsize,
    clicks: AtomicUsize,
    scoped_queries: AtomicUsize,
}

/// Serves fixed HTML through [`SharedDom`], with knobs for failure paths.
///
/// Heights come from `data-height` attributes. Screenshots return
/// `png:<target>` bytes unless disabled.
pub(crate) struct ScriptedLauncher {
    html: String,
    fail_launch: bool,
    fail_close: bool,
    fail_goto: bool,
    fail_clicks: bool,
    hang_idle: bool,
    screenshots: bool,
    synchronous: bool,
    fail_scoped_query_on: Option<usize>,
    reveal_delay: usize,
    last_options: Mutex<Option<LaunchOptions>>,
    counters: Arc<Counters>,
}

impl ScriptedLauncher {
    pub fn new(html: &str) -> Self {
        Self {
            html: html.to_string(),
            fail_launch: false,
            fail_close: false,
            fail_goto: false,
            fail_clicks: false,
            hang_idle: false,
            screenshots: true,
            synchronous: true,
            fail_scoped_query_on: None,
            reveal_delay: 0,
            last_options: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn fail_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    pub fn fail_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn fail_goto(mut self) -> Self {
        self.fail_goto = true;
        self
    }

    pub fn fail_clicks(mut self) -> Self {
        self.fail_clicks = true;
        self
    }

    pub fn hang_network_idle(mut self) -> Self {
        self.hang_idle = true;
        self
    }

    pub fn without_screenshots(mut self) -> Self {
        self.screenshots = false;
        self
    }

    /// Make callers poll for injected content, like a scripted page.
    pub fn asynchronous(mut self) -> Self {
        self.synchronous = false;
        self
    }

    /// The `n`th (1-based) scoped `query_all` fails with a page error.
    pub fn fail_scoped_query_on(mut self, n: usize) -> Self {
        self.fail_scoped_query_on = Some(n);
        self
    }

    /// A click's effect shows up only on the `n`th `query_all` after it.
    pub fn reveal_after(mut self, n: usize) -> Self {
        self.reveal_delay = n;
        self
    }

    pub fn launched(&self) -> usize {
        self.counters.launched.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn clicks(&self) -> usize {
        self.counters.clicks.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<LaunchOptions> {
        self.last_options.lock().unwrap().clone()
    }

    /// Launch a desktop session and load the scripted page.
    pub async fn open_page(&self) -> Box<dyn PageSession> {
        let mut page = self
            .launch(&LaunchOptions {
                user_agent: "scripted".into(),
                locale: "en-US".into(),
                viewport: Viewport {
                    width: 1366,
                    height: 900,
                },
                is_mobile: false,
                proxy: None,
            })
            .await
            .unwrap();
        page.goto(&PageRequest {
            url: "https://www.google.com/search?q=test".into(),
            headers: Vec::new(),
            device: Device::Desktop,
        })
        .await
        .unwrap();
        page
    }
}

#[async_trait]
impl BrowserLauncher for ScriptedLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn PageSession>> {
        if self.fail_launch {
            return Err(QuestionTreeError::SessionAcquisition("browser binary missing".into()));
        }
        self.counters.launched.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().unwrap() = Some(options.clone());

        Ok(Box::new(ScriptedSession {
            dom: SharedDom::default(),
            html: self.html.clone(),
            fail_close: self.fail_close,
            fail_goto: self.fail_goto,
            fail_clicks: self.fail_clicks,
            hang_idle: self.hang_idle,
            screenshots: self.screenshots,
            synchronous: self.synchronous,
            fail_scoped_query_on: self.fail_scoped_query_on,
            reveal_delay: self.reveal_delay,
            pending_reveals: Vec::new(),
            counters: self.counters.clone(),
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct ScriptedSession {
    dom: SharedDom,
    html: String,
    fail_close: bool,
    fail_goto: bool,
    fail_clicks: bool,
    hang_idle: bool,
    screenshots: bool,
    synchronous: bool,
    fail_scoped_query_on: Option<usize>,
    reveal_delay: usize,
    /// Clicked controls with the number of queries left before they reveal.
    pending_reveals: Vec<(ElementHandle, usize)>,
    counters: Arc<Counters>,
}

impl ScriptedSession {
    async fn apply_due_reveals(&mut self) -> Result<()> {
        let mut due = Vec::new();
        self.pending_reveals.retain_mut(|(element, remaining)| {
            *remaining -= 1;
            if *remaining == 0 {
                due.push(element.clone());
                false
            } else {
                true
            }
        });
        for element in due {
            self.dom.click(&element).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PageSession for ScriptedSession {
    async fn goto(&mut self, request: &PageRequest) -> Result<()> {
        if self.fail_goto {
            return Err(QuestionTreeError::Navigation(format!("{}: connection reset", request.url)));
        }
        self.dom = SharedDom::load(self.html.clone()).await?;
        self.pending_reveals.clear();
        Ok(())
    }

    async fn wait_for_load(&mut self, state: LoadState) -> Result<()> {
        if self.hang_idle && state == LoadState::NetworkIdle {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn query_all(
        &mut self,
        scope: Option<&ElementHandle>,
        selector: &str,
    ) -> Result<Vec<ElementHandle>> {
        self.apply_due_reveals().await?;
        if scope.is_some() {
            let n = self.counters.scoped_queries.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_scoped_query_on == Some(n) {
                return Err(QuestionTreeError::Page("execution context was destroyed".into()));
            }
        }
        self.dom.query_all(scope, selector).await
    }

    async fn inner_text(&mut self, element: &ElementHandle) -> Result<String> {
        self.dom.inner_text(element).await
    }

    async fn attribute(&mut self, element: &ElementHandle, name: &str) -> Result<Option<String>> {
        self.dom.attribute(element, name).await
    }

    async fn describe(&mut self, element: &ElementHandle) -> Result<ElementInfo> {
        let mut info = self.dom.describe(element).await?;
        info.height = self
            .dom
            .attribute(element, "data-height")
            .await?
            .and_then(|h| h.parse().ok());
        Ok(info)
    }

    async fn parent(&mut self, element: &ElementHandle) -> Result<Option<ElementHandle>> {
        self.dom.parent(element).await
    }

    async fn outer_html(&mut self, element: &ElementHandle) -> Result<String> {
        self.dom.outer_html(element).await
    }

    async fn click(&mut self, element: &ElementHandle, _delay: Duration) -> Result<()> {
        if self.fail_clicks {
            return Err(QuestionTreeError::Page("element is not clickable".into()));
        }
        self.counters.clicks.fetch_add(1, Ordering::SeqCst);
        if self.reveal_delay > 0 {
            self.pending_reveals.push((element.clone(), self.reveal_delay));
            return Ok(());
        }
        self.dom.click(element).await.map(|_| ())
    }

    async fn screenshot(&mut self, capture: Capture<'_>) -> Result<Vec<u8>> {
        if !self.screenshots {
            return Err(QuestionTreeError::Unsupported("screenshots".into()));
        }
        Ok(match capture {
            Capture::FullPage => b"png:page".to_vec(),
            Capture::Element(el) => format!("png:{}", el.0).into_bytes(),
        })
    }

    async fn page_url(&mut self) -> Result<String> {
        Ok("https://www.google.com/search?q=test".into())
    }

    async fn close(&mut self) -> Result<()> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(QuestionTreeError::Page("browser already gone".into()));
        }
        Ok(())
    }

    fn renders_synchronously(&self) -> bool {
        self.synchronous
    }
}
