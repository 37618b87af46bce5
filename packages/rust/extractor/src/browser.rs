//! Page-automation interface consumed by the extraction engine.
//!
//! Any rendering engine that can launch an isolated session, navigate, query
//! the rendered document, click, and capture screenshots can drive the
//! engine by implementing [`BrowserLauncher`] and [`PageSession`].

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use questiontree_shared::{QuestionTreeError, Result};

use crate::query::PageRequest;

// ---------------------------------------------------------------------------
// Handles and descriptors
// ---------------------------------------------------------------------------

/// Opaque reference to an element in the rendered document.
///
/// Handles are only meaningful to the session that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle(pub String);

/// Layout and identity facts about one element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElementInfo {
    /// Lowercase tag name.
    pub tag: String,
    /// ARIA role, if any.
    pub role: Option<String>,
    /// Rendered height in CSS pixels, when the engine lays pages out.
    pub height: Option<f64>,
    /// 1-based index among siblings with the same tag.
    pub nth_of_type: usize,
}

/// Screenshot target.
#[derive(Debug, Clone, Copy)]
pub enum Capture<'a> {
    FullPage,
    Element(&'a ElementHandle),
}

/// Load milestones a session can wait for after navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// No network activity for a short quiet period.
    NetworkIdle,
}

/// Browser viewport in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// An outbound proxy endpoint parsed from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    /// `scheme://host:port` without credentials.
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyEndpoint {
    /// Parse `scheme://[user:pass@]host:port`.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|e| QuestionTreeError::config(format!("invalid proxy '{raw}': {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| QuestionTreeError::config(format!("proxy '{raw}' has no host")))?;

        let server = match url.port() {
            Some(port) => format!("{}://{host}:{port}", url.scheme()),
            None => format!("{}://{host}", url.scheme()),
        };
        let username = Some(url.username().to_string()).filter(|u| !u.is_empty());
        let password = url.password().map(String::from);

        Ok(Self {
            server,
            username,
            password,
        })
    }

    /// Host part of the endpoint, used as the egress identifier.
    pub fn host(&self) -> Option<String> {
        Url::parse(&self.server)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
    }
}

/// Everything a launcher needs to open one isolated session.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub user_agent: String,
    /// Locale tag such as `en-US`.
    pub locale: String,
    pub viewport: Viewport,
    pub is_mobile: bool,
    pub proxy: Option<ProxyEndpoint>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Launches isolated rendering sessions (browser instance + context).
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn PageSession>>;

    /// Human-readable engine name for tracing.
    fn name(&self) -> &str;
}

/// One live rendering session.
///
/// Callers bound every method with their own timeout; implementations are not
/// required to enforce one.
#[async_trait]
pub trait PageSession: Send {
    /// Navigate to the composed request.
    async fn goto(&mut self, request: &PageRequest) -> Result<()>;

    /// Wait until the page reaches `state`.
    async fn wait_for_load(&mut self, state: LoadState) -> Result<()>;

    /// Visible elements matching `selector`, in document order. With a scope,
    /// only descendants of that element are considered.
    async fn query_all(
        &mut self,
        scope: Option<&ElementHandle>,
        selector: &str,
    ) -> Result<Vec<ElementHandle>>;

    async fn inner_text(&mut self, element: &ElementHandle) -> Result<String>;

    async fn attribute(&mut self, element: &ElementHandle, name: &str) -> Result<Option<String>>;

    async fn describe(&mut self, element: &ElementHandle) -> Result<ElementInfo>;

    async fn parent(&mut self, element: &ElementHandle) -> Result<Option<ElementHandle>>;

    async fn outer_html(&mut self, element: &ElementHandle) -> Result<String>;

    async fn click(&mut self, element: &ElementHandle, delay: Duration) -> Result<()>;

    /// PNG bytes of the page or of one element.
    async fn screenshot(&mut self, capture: Capture<'_>) -> Result<Vec<u8>>;

    /// URL of the currently loaded document.
    async fn page_url(&mut self) -> Result<String>;

    async fn close(&mut self) -> Result<()>;

    /// True when a click's effects are visible as soon as `click` returns,
    /// so callers can skip polling for injected content.
    fn renders_synchronously(&self) -> bool {
        false
    }
}
