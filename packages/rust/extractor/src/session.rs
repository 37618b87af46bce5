//! Rendering session acquisition and guaranteed release.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use questiontree_shared::{Device, EngineConfig, QuestionTreeError, Result};

use crate::browser::{BrowserLauncher, LaunchOptions, PageSession, ProxyEndpoint, Viewport};

/// Upper bound on how long closing a session may take.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_5 like Mac OS X) \
    AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Mobile/15E148 Safari/604.1";

const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Mobile viewport is deliberately tall so more of the page renders unscrolled.
const MOBILE_VIEWPORT: Viewport = Viewport {
    width: 390,
    height: 1800,
};

const DESKTOP_VIEWPORT: Viewport = Viewport {
    width: 1366,
    height: 900,
};

// ---------------------------------------------------------------------------
// Proxy selection
// ---------------------------------------------------------------------------

/// Strategy for picking an outbound proxy from the configured pool.
pub trait ProxySelector: Send + Sync {
    fn select<'a>(&self, pool: &'a [ProxyEndpoint]) -> Option<&'a ProxyEndpoint>;
}

/// Uniformly random choice. An empty pool means a direct connection.
#[derive(Debug, Default)]
pub struct RandomProxySelector;

impl ProxySelector for RandomProxySelector {
    fn select<'a>(&self, pool: &'a [ProxyEndpoint]) -> Option<&'a ProxyEndpoint> {
        pool.choose(&mut rand::thread_rng())
    }
}

/// Always the proxy at `index` (modulo pool size).
#[derive(Debug, Default)]
pub struct FixedProxySelector(pub usize);

impl ProxySelector for FixedProxySelector {
    fn select<'a>(&self, pool: &'a [ProxyEndpoint]) -> Option<&'a ProxyEndpoint> {
        if pool.is_empty() {
            None
        } else {
            pool.get(self.0 % pool.len())
        }
    }
}

// ---------------------------------------------------------------------------
// Session manager
// ---------------------------------------------------------------------------

/// An acquired session owned by exactly one run.
pub struct Session {
    pub page: Box<dyn PageSession>,
    /// Egress identifier (proxy host) or `None` for a direct connection.
    pub egress: Option<String>,
}

impl Session {
    /// Close the session. Failures are logged and swallowed.
    pub async fn release(mut self) {
        match tokio::time::timeout(CLOSE_TIMEOUT, self.page.close()).await {
            Ok(Ok(())) => debug!("session closed"),
            Ok(Err(e)) => warn!(error = %e, "failed to close session"),
            Err(_) => warn!("timed out closing session"),
        }
    }
}

/// Owns a session for the length of one run and releases it even when the run
/// never finishes: a panic or a dropped run future closes it in the background.
pub struct SessionGuard {
    session: Option<Session>,
}

impl SessionGuard {
    pub fn new(session: Session) -> Self {
        Self {
            session: Some(session),
        }
    }

    pub fn page(&mut self) -> Result<&mut dyn PageSession> {
        match self.session.as_mut() {
            Some(session) => Ok(session.page.as_mut()),
            None => Err(QuestionTreeError::Page("session already released".into())),
        }
    }

    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            session.release().await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!("run abandoned, releasing session in the background");
                runtime.spawn(session.release());
            }
            Err(_) => warn!("run abandoned outside a runtime, session left open"),
        }
    }
}

/// Launches per-run sessions with device- and locale-appropriate settings.
pub struct SessionManager {
    launcher: Arc<dyn BrowserLauncher>,
    proxies: Vec<ProxyEndpoint>,
    selector: Box<dyn ProxySelector>,
}

impl SessionManager {
    /// Create a manager with random proxy selection over the configured pool.
    pub fn new(launcher: Arc<dyn BrowserLauncher>, config: &EngineConfig) -> Result<Self> {
        let proxies = config
            .proxy_pool
            .iter()
            .map(|raw| ProxyEndpoint::parse(raw))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            launcher,
            proxies,
            selector: Box::new(RandomProxySelector),
        })
    }

    /// Replace the proxy selection strategy.
    pub fn with_selector(mut self, selector: impl ProxySelector + 'static) -> Self {
        self.selector = Box::new(selector);
        self
    }

    /// Options a session for `device` and `locale` would be launched with.
    pub fn launch_options(&self, device: Device, locale: &str) -> LaunchOptions {
        let (user_agent, viewport) = match device {
            Device::Mobile => (MOBILE_USER_AGENT, MOBILE_VIEWPORT),
            Device::Desktop => (DESKTOP_USER_AGENT, DESKTOP_VIEWPORT),
        };
        LaunchOptions {
            user_agent: user_agent.to_string(),
            locale: locale.to_string(),
            viewport,
            is_mobile: device == Device::Mobile,
            proxy: self.selector.select(&self.proxies).cloned(),
        }
    }

    /// Launch a fresh isolated session.
    pub async fn acquire(&self, device: Device, locale: &str) -> Result<Session> {
        let options = self.launch_options(device, locale);
        let egress = options.proxy.as_ref().and_then(ProxyEndpoint::host);

        debug!(
            engine = self.launcher.name(),
            %device,
            locale,
            proxy = egress.as_deref().unwrap_or("direct"),
            "launching session"
        );

        let page = self.launcher.launch(&options).await.map_err(|e| match e {
            QuestionTreeError::SessionAcquisition(_) => e,
            other => QuestionTreeError::SessionAcquisition(other.to_string()),
        })?;

        Ok(Session { page, egress })
    }
}
