//! Best-effort evidence collection for one run.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use questiontree_shared::{Evidence, Result};

use crate::browser::{Capture, ElementHandle, PageSession};
use crate::budget::CancelFlag;

/// Per-capture bound. Captures run even after the run deadline so a timed-out
/// run still reports what the page looked like; cancellation abandons them.
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accumulates evidence for a run. Every capture failure is logged at debug
/// and leaves the corresponding field empty.
#[derive(Debug, Default)]
pub struct EvidenceCapturer {
    evidence: Evidence,
    cancel: CancelFlag,
}

impl EvidenceCapturer {
    pub fn new(cancel: CancelFlag) -> Self {
        Self {
            evidence: Evidence::default(),
            cancel,
        }
    }

    /// Container markup plus an initial crop of the container.
    pub async fn capture_container(&mut self, page: &mut dyn PageSession, container: &ElementHandle) {
        if let Some(html) = capture(&self.cancel, "container markup", page.outer_html(container)).await {
            self.evidence.container_html = Some(html);
        }
        self.push_crop(page, container).await;
    }

    /// Crop appended after a successful expansion.
    pub async fn capture_expansion(&mut self, page: &mut dyn PageSession, container: &ElementHandle) {
        self.push_crop(page, container).await;
    }

    pub async fn capture_full_page(&mut self, page: &mut dyn PageSession) {
        if let Some(png) = capture(&self.cancel, "full page", page.screenshot(Capture::FullPage)).await
        {
            self.evidence.full_page = Some(png);
        }
    }

    pub fn crop_count(&self) -> usize {
        self.evidence.crops.len()
    }

    pub fn finish(self) -> Evidence {
        self.evidence
    }

    async fn push_crop(&mut self, page: &mut dyn PageSession, container: &ElementHandle) {
        let shot = page.screenshot(Capture::Element(container));
        if let Some(png) = capture(&self.cancel, "container crop", shot).await {
            self.evidence.crops.push(png);
        }
    }
}

/// Await one capture, bounded by [`CAPTURE_TIMEOUT`] and abandoned on cancel.
async fn capture<T>(cancel: &CancelFlag, what: &str, fut: impl Future<Output = Result<T>>) -> Option<T> {
    let mut cancel = cancel.clone();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(what, "capture abandoned, run cancelled");
            None
        }
        res = tokio::time::timeout(CAPTURE_TIMEOUT, fut) => match res {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                debug!(error = %e, what, "capture skipped");
                None
            }
            Err(_) => {
                debug!(what, "capture timed out");
                None
            }
        },
    }
}
