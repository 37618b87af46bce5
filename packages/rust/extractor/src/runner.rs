//! Single extraction run: one session, one page, one question tree.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument};

use questiontree_shared::{
    EngineConfig, ExtractionParams, MAX_ENGINE_DEPTH, QuestionTreeError, Result, RunResult,
    StopReason, fold_for_match,
};

use crate::browser::{BrowserLauncher, ElementHandle, LoadState, PageSession};
use crate::budget::{CancelFlag, RunContext};
use crate::drift::drift_fingerprint;
use crate::evidence::EvidenceCapturer;
use crate::locator::locate_container;
use crate::query::{PageRequest, compose};
use crate::session::{SessionGuard, SessionManager};
use crate::walker::{WalkConfig, walk};

/// Consent button labels, tried in order. Compared after diacritic folding.
const CONSENT_LABELS: &[&str] = &[
    "Accept all",
    "I agree",
    "Alle akzeptieren",
    "Tout accepter",
    "Aceptar todo",
    "Accetta tutto",
    "Aceitar tudo",
    "Alles accepteren",
    "Zaakceptuj wszystko",
];

const CONSENT_SELECTOR: &str = "button, [role='button'], input[type='submit']";

const CONSENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a dismissed overlay so the page can re-render.
const CONSENT_SETTLE: Duration = Duration::from_millis(500);

/// Executes single runs against fresh sessions.
pub struct RunExecutor {
    sessions: SessionManager,
    config: EngineConfig,
}

impl RunExecutor {
    /// Create an executor with random proxy selection over the configured pool.
    pub fn new(launcher: Arc<dyn BrowserLauncher>, config: EngineConfig) -> Result<Self> {
        let sessions = SessionManager::new(launcher, &config)?;
        Ok(Self { sessions, config })
    }

    /// Create an executor around a preconfigured session manager.
    pub fn with_sessions(sessions: SessionManager, config: EngineConfig) -> Self {
        Self { sessions, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn run_single(&self, params: &ExtractionParams) -> Result<RunResult> {
        self.run_single_with(params, CancelFlag::default()).await
    }

    /// Run once, abortable through `cancel`.
    ///
    /// The session is released on every path, including a panic or the
    /// returned future being dropped. Cancellation before the walk starts
    /// surfaces as [`QuestionTreeError::Cancelled`]; during the walk it returns
    /// the partial result with [`StopReason::Cancelled`].
    #[instrument(skip_all, fields(keyword = %params.keyword, device = %params.device, depth = params.depth))]
    pub async fn run_single_with(
        &self,
        params: &ExtractionParams,
        cancel: CancelFlag,
    ) -> Result<RunResult> {
        let started = Instant::now();
        let request = compose(params, &self.config.search_base_url)?;
        let ctx = RunContext::new(self.config.max_runtime(), cancel);

        let session = self.sessions.acquire(params.device, &params.locale()).await?;
        let egress = session.egress.clone();
        let mut guard = SessionGuard::new(session);
        let outcome = match guard.page() {
            Ok(page) => self.drive(page, &request, params, &ctx).await,
            Err(e) => Err(e),
        };
        guard.release().await;

        let mut result = outcome?;
        result.egress = egress;
        result.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            items = result.items.len(),
            stop_reason = ?result.stop_reason,
            drift = %result.drift_hash,
            elapsed_ms = result.elapsed_ms,
            "run complete"
        );
        Ok(result)
    }

    async fn drive(
        &self,
        page: &mut dyn PageSession,
        request: &PageRequest,
        params: &ExtractionParams,
        ctx: &RunContext,
    ) -> Result<RunResult> {
        match ctx
            .bound("navigation", self.config.navigation_timeout(), page.goto(request))
            .await
        {
            Ok(()) => {}
            Err(QuestionTreeError::Timeout { .. }) if !ctx.deadline.expired() => {
                debug!("navigation timed out, continuing with rendered state");
            }
            Err(e) => return Err(e),
        }

        match ctx
            .bound(
                "network idle",
                self.config.network_idle_timeout(),
                page.wait_for_load(LoadState::NetworkIdle),
            )
            .await
        {
            Ok(()) => {}
            Err(QuestionTreeError::Cancelled) => return Err(QuestionTreeError::Cancelled),
            Err(e) => debug!(error = %e, "network idle wait skipped"),
        }

        dismiss_consent(page, ctx).await;
        ctx.check_cancelled()?;

        let drift_hash = drift_fingerprint(page, ctx).await;

        let located = match locate_container(page, ctx).await {
            Ok(located) => located,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                debug!(error = %e, "locator failed");
                None
            }
        };

        let mut evidence = EvidenceCapturer::new(ctx.cancel.clone());
        let (items, stop_reason) = match located {
            Some(located) => {
                evidence.capture_container(page, &located.container).await;
                let depth = params.depth.min(MAX_ENGINE_DEPTH);
                let config = WalkConfig::from_engine(&self.config, depth);
                let outcome = walk(page, &located.container, &config, ctx, &mut evidence).await?;
                (outcome.items, outcome.stop_reason)
            }
            None if ctx.deadline.expired() => {
                info!("time budget spent before a question container was found");
                (Vec::new(), StopReason::TimeBudget)
            }
            None => {
                info!("no question container found");
                (Vec::new(), StopReason::NoContainer)
            }
        };
        evidence.capture_full_page(page).await;

        Ok(RunResult {
            items,
            evidence: evidence.finish(),
            drift_hash,
            egress: None,
            stop_reason,
            elapsed_ms: 0,
        })
    }
}

/// Click the first consent button matching a known label. Never fails.
async fn dismiss_consent(page: &mut dyn PageSession, ctx: &RunContext) -> bool {
    let candidates = match ctx
        .bound("consent scan", CONSENT_TIMEOUT, consent_candidates(page))
        .await
    {
        Ok(candidates) => candidates,
        Err(e) => {
            debug!(error = %e, "consent scan failed");
            return false;
        }
    };

    for label in CONSENT_LABELS {
        let wanted = fold_for_match(label);
        for (button, text) in &candidates {
            if *text != wanted {
                continue;
            }
            match ctx
                .bound("consent click", CONSENT_TIMEOUT, page.click(button, Duration::ZERO))
                .await
            {
                Ok(()) => {
                    debug!(label, "consent overlay dismissed");
                    let _ = ctx.sleep(CONSENT_SETTLE).await;
                    return true;
                }
                Err(e) => debug!(label, error = %e, "consent click failed"),
            }
        }
    }
    false
}

/// Clickable elements with their folded labels.
async fn consent_candidates(page: &mut dyn PageSession) -> Result<Vec<(ElementHandle, String)>> {
    let buttons = page.query_all(None, CONSENT_SELECTOR).await?;
    let mut candidates = Vec::with_capacity(buttons.len());
    for button in buttons {
        let mut text = page.inner_text(&button).await?;
        if text.trim().is_empty() {
            text = page.attribute(&button, "value").await?.unwrap_or_default();
        }
        candidates.push((button, fold_for_match(&text)));
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::FixedProxySelector;
    use crate::testing::ScriptedLauncher;
    use questiontree_shared::Device;

    const SERP: &str = r#"<body>
        <a href="https://www.rust-lang.org/">Rust</a>
        <a href="https://doc.rust-lang.org/book/">Book</a>
        <div id="paa" data-height="600">
            <div aria-expanded="false" aria-controls="c1">What is Rust?</div>
            <div id="c1" hidden><div aria-expanded="false">Is Rust safe?</div></div>
            <div aria-expanded="false">How to learn Rust?</div>
            <div aria-expanded="false">Why Rust?</div>
        </div>
    </body>"#;

    const NO_TREE: &str = r#"<body><a href="https://example.org/">x</a><p>Nothing</p></body>"#;

    fn params(depth: u8) -> ExtractionParams {
        ExtractionParams::new("rust", "us", "en", Device::Mobile)
            .unwrap()
            .with_depth(depth)
    }

    fn config() -> EngineConfig {
        EngineConfig {
            child_poll_interval_ms: 10,
            child_poll_timeout_ms: 50,
            network_idle_timeout_ms: 50,
            ..EngineConfig::default()
        }
    }

    fn executor(launcher: &Arc<ScriptedLauncher>) -> RunExecutor {
        RunExecutor::new(launcher.clone(), config()).unwrap()
    }

    #[tokio::test]
    async fn extracts_top_level_questions() {
        let launcher = Arc::new(ScriptedLauncher::new(SERP));
        let result = executor(&launcher).run_single(&params(0)).await.unwrap();

        let texts: Vec<_> = result.items.iter().map(|i| i.raw.as_str()).collect();
        assert_eq!(texts, vec!["What is Rust?", "How to learn Rust?", "Why Rust?"]);
        assert!(result.container_found());
        assert_eq!(result.stop_reason, StopReason::QueueExhausted);
        assert_ne!(result.drift_hash, crate::drift::NO_HASH);
        assert!(result.evidence.container_html.is_some());
        assert_eq!(result.evidence.crops.len(), 1);
        assert!(result.evidence.full_page.is_some());
        assert!(result.egress.is_none());
        assert_eq!(launcher.closed(), 1);
    }

    #[tokio::test]
    async fn expands_to_requested_depth() {
        let launcher = Arc::new(ScriptedLauncher::new(SERP));
        let result = executor(&launcher).run_single(&params(1)).await.unwrap();

        assert_eq!(result.items.len(), 4);
        let child = &result.items[3];
        assert_eq!(child.normalized, "is rust safe?");
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent.as_deref(), Some("what is rust?"));
        // Container crop plus one per expansion.
        assert_eq!(result.evidence.crops.len(), 4);
    }

    #[tokio::test]
    async fn missing_container_yields_full_page_evidence_only() {
        let launcher = Arc::new(ScriptedLauncher::new(NO_TREE));
        let result = executor(&launcher).run_single(&params(2)).await.unwrap();

        assert!(result.items.is_empty());
        assert!(!result.container_found());
        assert_eq!(result.stop_reason, StopReason::NoContainer);
        assert!(result.evidence.full_page.is_some());
        assert!(result.evidence.container_html.is_none());
        assert!(result.evidence.crops.is_empty());
        assert_eq!(launcher.closed(), 1);
    }

    #[tokio::test]
    async fn navigation_failure_propagates_and_releases_session() {
        let launcher = Arc::new(ScriptedLauncher::new(SERP).fail_goto());
        let err = executor(&launcher).run_single(&params(0)).await.unwrap_err();
        assert!(matches!(err, QuestionTreeError::Navigation(_)));
        assert_eq!(launcher.launched(), 1);
        assert_eq!(launcher.closed(), 1);
    }

    #[tokio::test]
    async fn launch_failure_is_fatal() {
        let launcher = Arc::new(ScriptedLauncher::new(SERP).fail_launch());
        let err = executor(&launcher).run_single(&params(0)).await.unwrap_err();
        assert!(matches!(err, QuestionTreeError::SessionAcquisition(_)));
        assert_eq!(launcher.closed(), 0);
    }

    #[tokio::test]
    async fn network_idle_timeout_is_not_fatal() {
        let launcher = Arc::new(ScriptedLauncher::new(SERP).hang_network_idle());
        let result = executor(&launcher).run_single(&params(0)).await.unwrap();
        assert_eq!(result.items.len(), 3);
    }

    #[tokio::test]
    async fn close_failure_does_not_fail_run() {
        let launcher = Arc::new(ScriptedLauncher::new(SERP).fail_close());
        let result = executor(&launcher).run_single(&params(0)).await.unwrap();
        assert_eq!(result.items.len(), 3);
        assert_eq!(launcher.closed(), 1);
    }

    #[tokio::test]
    async fn consent_overlay_is_dismissed_once() {
        let html = r#"<body>
            <form><button>Reject all</button><button>Tout accepter</button><button>Accept all</button></form>
            <p>Nothing else</p>
        </body>"#;
        let launcher = Arc::new(ScriptedLauncher::new(html));
        let result = executor(&launcher).run_single(&params(0)).await.unwrap();
        assert!(result.items.is_empty());
        assert_eq!(launcher.clicks(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_releases_session() {
        let launcher = Arc::new(ScriptedLauncher::new(SERP));
        let (handle, flag) = CancelFlag::pair();
        handle.cancel();
        let err = executor(&launcher)
            .run_single_with(&params(0), flag)
            .await
            .unwrap_err();
        assert!(matches!(err, QuestionTreeError::Cancelled));
        assert_eq!(launcher.closed(), 1);
    }

    #[tokio::test]
    async fn egress_is_the_selected_proxy_host() {
        let launcher = Arc::new(ScriptedLauncher::new(SERP));
        let config = EngineConfig {
            proxy_pool: vec!["http://gw-7.proxy.example:8000".into()],
            ..config()
        };
        let sessions = SessionManager::new(launcher.clone(), &config)
            .unwrap()
            .with_selector(FixedProxySelector(0));
        let executor = RunExecutor::with_sessions(sessions, config);

        let result = executor.run_single(&params(0)).await.unwrap();
        assert_eq!(result.egress.as_deref(), Some("gw-7.proxy.example"));
        let options = launcher.last_options().unwrap();
        assert!(options.is_mobile);
        assert_eq!(options.locale, "en-US");
    }

    #[tokio::test]
    async fn transient_page_error_keeps_collected_items() {
        // The second container-scoped query re-locates "What is Rust?" for its click.
        let launcher = Arc::new(ScriptedLauncher::new(SERP).fail_scoped_query_on(2));
        let result = executor(&launcher).run_single(&params(1)).await.unwrap();

        let texts: Vec<_> = result.items.iter().map(|i| i.raw.as_str()).collect();
        assert_eq!(texts, vec!["What is Rust?", "How to learn Rust?", "Why Rust?"]);
        assert_eq!(result.stop_reason, StopReason::QueueExhausted);
        assert!(result.evidence.container_html.is_some());
        assert_eq!(launcher.closed(), 1);
    }

    #[tokio::test]
    async fn spent_budget_before_locating_is_not_a_missing_container() {
        let launcher = Arc::new(ScriptedLauncher::new(SERP).hang_network_idle());
        let config = EngineConfig {
            max_runtime_ms: 300,
            network_idle_timeout_ms: 4000,
            ..config()
        };
        let executor = RunExecutor::new(launcher.clone(), config).unwrap();
        let result = executor.run_single(&params(1)).await.unwrap();

        assert!(result.items.is_empty());
        assert_eq!(result.stop_reason, StopReason::TimeBudget);
        assert!(result.evidence.full_page.is_some());
        assert_eq!(launcher.closed(), 1);
    }

    #[tokio::test]
    async fn depth_beyond_engine_limit_is_clamped() {
        let html = r#"<body><div id="paa">
            <div aria-expanded="false" aria-controls="l1">Level zero?</div>
            <div aria-expanded="false">Sibling one?</div>
            <div aria-expanded="false">Sibling two?</div>
            <div id="l1" hidden>
                <div aria-expanded="false" aria-controls="l2">Level one?</div>
                <div id="l2" hidden>
                    <div aria-expanded="false" aria-controls="l3">Level two?</div>
                    <div id="l3" hidden>
                        <div aria-expanded="false" aria-controls="l4">Level three?</div>
                        <div id="l4" hidden>
                            <div aria-expanded="false">Level four?</div>
                        </div>
                    </div>
                </div>
            </div>
        </div></body>"#;
        let launcher = Arc::new(ScriptedLauncher::new(html));
        let params = ExtractionParams {
            depth: 9,
            ..params(0)
        };
        let result = executor(&launcher).run_single(&params).await.unwrap();

        let deepest = result.items.iter().map(|i| i.depth).max().unwrap();
        assert_eq!(deepest, MAX_ENGINE_DEPTH);
        assert_eq!(result.items.len(), 6);
        assert!(result.items.iter().all(|i| i.normalized != "level four?"));
    }

    #[tokio::test]
    async fn dropped_run_still_releases_session() {
        let launcher = Arc::new(ScriptedLauncher::new(SERP).hang_network_idle());
        let config = EngineConfig {
            network_idle_timeout_ms: 10_000,
            ..config()
        };
        let executor = RunExecutor::new(launcher.clone(), config).unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), executor.run_single(&params(0))).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(launcher.launched(), 1);
        assert_eq!(launcher.closed(), 1);
    }
}
