//! Static HTTP rendering engine.
//!
//! Fetches server-rendered HTML with `reqwest` and serves queries from a
//! [`SharedDom`]. No scripts run, so expansion only reveals content that was
//! already in the markup; element heights are unknown and screenshots are
//! unsupported (they surface as missing evidence).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use questiontree_shared::{QuestionTreeError, Result};

use crate::browser::{
    BrowserLauncher, Capture, ElementHandle, ElementInfo, LaunchOptions, LoadState, PageSession,
};
use crate::dom::SharedDom;
use crate::query::PageRequest;

/// Default per-request timeout for the underlying HTTP client.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Launches [`HttpSession`]s, one `reqwest` client per session.
#[derive(Debug, Clone)]
pub struct HttpLauncher {
    request_timeout: Duration,
}

impl HttpLauncher {
    pub fn new() -> Self {
        Self {
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    /// Cap every request, typically at the configured navigation timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for HttpLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserLauncher for HttpLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn PageSession>> {
        let mut builder = Client::builder()
            .user_agent(options.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(self.request_timeout);

        if let Some(proxy) = &options.proxy {
            let mut p = reqwest::Proxy::all(proxy.server.as_str()).map_err(|e| {
                QuestionTreeError::SessionAcquisition(format!("proxy {}: {e}", proxy.server))
            })?;
            if let Some(user) = &proxy.username {
                p = p.basic_auth(user, proxy.password.as_deref().unwrap_or(""));
            }
            builder = builder.proxy(p);
        }

        let client = builder.build().map_err(|e| {
            QuestionTreeError::SessionAcquisition(format!("failed to build HTTP client: {e}"))
        })?;

        Ok(Box::new(HttpSession {
            client,
            dom: SharedDom::default(),
            url: None,
        }))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// One static session: the last fetched document plus revealed regions.
pub struct HttpSession {
    client: Client,
    dom: SharedDom,
    url: Option<String>,
}

#[async_trait]
impl PageSession for HttpSession {
    async fn goto(&mut self, request: &PageRequest) -> Result<()> {
        debug!(url = %request.url, "fetching page");

        let mut req = self.client.get(&request.url);
        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let response = req
            .send()
            .await
            .map_err(|e| QuestionTreeError::Navigation(format!("{}: {e}", request.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(QuestionTreeError::Navigation(format!(
                "{}: HTTP {status}",
                request.url
            )));
        }

        let final_url = response.url().to_string();
        let body = response.text().await.map_err(|e| {
            QuestionTreeError::Navigation(format!("{}: body read failed: {e}", request.url))
        })?;

        self.dom = SharedDom::load(body).await?;
        self.url = Some(final_url);
        Ok(())
    }

    async fn wait_for_load(&mut self, _state: LoadState) -> Result<()> {
        // The document is complete once the body has been read.
        Ok(())
    }

    async fn query_all(
        &mut self,
        scope: Option<&ElementHandle>,
        selector: &str,
    ) -> Result<Vec<ElementHandle>> {
        self.dom.query_all(scope, selector).await
    }

    async fn inner_text(&mut self, element: &ElementHandle) -> Result<String> {
        self.dom.inner_text(element).await
    }

    async fn attribute(&mut self, element: &ElementHandle, name: &str) -> Result<Option<String>> {
        self.dom.attribute(element, name).await
    }

    async fn describe(&mut self, element: &ElementHandle) -> Result<ElementInfo> {
        self.dom.describe(element).await
    }

    async fn parent(&mut self, element: &ElementHandle) -> Result<Option<ElementHandle>> {
        self.dom.parent(element).await
    }

    async fn outer_html(&mut self, element: &ElementHandle) -> Result<String> {
        self.dom.outer_html(element).await
    }

    async fn click(&mut self, element: &ElementHandle, _delay: Duration) -> Result<()> {
        self.dom.click(element).await.map(|_| ())
    }

    async fn screenshot(&mut self, _capture: Capture<'_>) -> Result<Vec<u8>> {
        Err(QuestionTreeError::Unsupported("screenshots".into()))
    }

    async fn page_url(&mut self) -> Result<String> {
        self.url
            .clone()
            .ok_or_else(|| QuestionTreeError::Page("no page loaded".into()))
    }

    async fn close(&mut self) -> Result<()> {
        self.dom = SharedDom::default();
        self.url = None;
        Ok(())
    }

    fn renders_synchronously(&self) -> bool {
        true
    }
}
