//! Breadth-first expansion of the question tree inside a located container.
//!
//! The walk is an explicit state machine. Each queue entry rescans the
//! container's visible controls and records unseen questions at the entry's
//! depth and parent. Newly recorded questions shallower than the requested
//! depth are clicked; the walker then waits for injected children and
//! enqueues a child entry one level deeper.
//!
//! Depth counts completed expansions: 0 records the top level only.
//!
//! Controls revealed by a specific click are claimed by that click's child
//! entry, so an earlier entry's rescan does not attribute them to the wrong
//! parent. Controls nobody claimed go to whichever entry sees them first.
//!
//! Page-level failures only degrade the walk: a failed scan records nothing
//! for that entry and a failed expansion leaves a leaf. Cancellation and an
//! exhausted run deadline end the walk with a partial outcome; any other
//! fatal error is returned.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument};

use questiontree_shared::{
    EngineConfig, QuestionItem, QuestionTreeError, Result, StopReason, normalize,
};

use crate::browser::{ElementHandle, PageSession};
use crate::budget::{ChildPoll, RunContext};
use crate::evidence::EvidenceCapturer;
use crate::locator::ACCORDION_SELECTOR;

/// Bound on a single query/read against the page.
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

const CLICK_TIMEOUT: Duration = Duration::from_secs(3);

/// Longest structural path recorded for a control.
const MAX_PATH_SEGMENTS: usize = 64;

/// Walk limits for one run.
#[derive(Debug, Clone)]
pub struct WalkConfig {
    /// Completed expansions allowed below the top level.
    pub max_depth: u8,
    /// Run-wide cap on recorded questions.
    pub max_nodes: usize,
    pub child_poll: ChildPoll,
    /// Delay the engine inserts between pointer down and up.
    pub click_delay: Duration,
}

impl WalkConfig {
    pub fn from_engine(config: &EngineConfig, max_depth: u8) -> Self {
        Self {
            max_depth,
            max_nodes: config.max_nodes,
            child_poll: ChildPoll {
                interval: config.child_poll_interval(),
                timeout: config.child_poll_timeout(),
            },
            click_delay: Duration::from_millis(60),
        }
    }
}

/// What a walk produced and why it stopped.
#[derive(Debug, Clone)]
pub struct WalkOutcome {
    pub items: Vec<QuestionItem>,
    /// Successful expansion clicks.
    pub expansions: usize,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    id: usize,
    depth: u8,
    parent: Option<String>,
}

#[derive(Debug)]
enum WalkState {
    Init,
    ExpandLevel,
    PerNode(QueueEntry),
    /// Indices into the recorded items still waiting for an expansion attempt.
    MaybeExpand(VecDeque<usize>),
    WaitForChildren {
        pending: VecDeque<usize>,
        item: usize,
        before: usize,
    },
    EnqueueChild {
        pending: VecDeque<usize>,
        item: usize,
        appeared: bool,
    },
    Done(StopReason),
}

/// Walk the tree under `container`. Evidence crops are pushed into `evidence`
/// after every successful expansion.
#[instrument(skip_all, fields(max_depth = config.max_depth, max_nodes = config.max_nodes))]
pub async fn walk(
    page: &mut dyn PageSession,
    container: &ElementHandle,
    config: &WalkConfig,
    ctx: &RunContext,
    evidence: &mut EvidenceCapturer,
) -> Result<WalkOutcome> {
    let mut walker = Walker {
        page,
        container,
        config,
        ctx,
        evidence,
        items: Vec::new(),
        seen: HashSet::new(),
        claimed: HashMap::new(),
        queue: VecDeque::new(),
        next_entry: 0,
        expansions: 0,
    };
    let stop_reason = walker.run().await?;

    debug!(
        items = walker.items.len(),
        expansions = walker.expansions,
        ?stop_reason,
        "walk finished"
    );

    Ok(WalkOutcome {
        items: walker.items,
        expansions: walker.expansions,
        stop_reason,
    })
}

struct Walker<'a> {
    page: &'a mut dyn PageSession,
    container: &'a ElementHandle,
    config: &'a WalkConfig,
    ctx: &'a RunContext,
    evidence: &'a mut EvidenceCapturer,
    items: Vec<QuestionItem>,
    seen: HashSet<String>,
    /// Unrecorded normalized text -> id of the pending entry whose click revealed it.
    claimed: HashMap<String, usize>,
    queue: VecDeque<QueueEntry>,
    next_entry: usize,
    expansions: usize,
}

enum Recorded {
    Items(Vec<usize>),
    BudgetReached,
}

impl Walker<'_> {
    async fn run(&mut self) -> Result<StopReason> {
        let mut state = WalkState::Init;

        loop {
            state = match state {
                WalkState::Init => {
                    let root = self.entry(0, None);
                    self.queue.push_back(root);
                    WalkState::ExpandLevel
                }

                WalkState::ExpandLevel => {
                    if self.ctx.cancel.is_cancelled() {
                        WalkState::Done(StopReason::Cancelled)
                    } else if self.ctx.deadline.expired() {
                        WalkState::Done(StopReason::TimeBudget)
                    } else {
                        match self.queue.pop_front() {
                            Some(entry) => WalkState::PerNode(entry),
                            None => WalkState::Done(StopReason::QueueExhausted),
                        }
                    }
                }

                WalkState::PerNode(entry) => {
                    let outcome = self.record_visible(&entry).await;
                    self.claimed.retain(|_, owner| *owner != entry.id);
                    match outcome {
                        Ok(Recorded::Items(recorded)) => WalkState::MaybeExpand(recorded.into()),
                        Ok(Recorded::BudgetReached) => WalkState::Done(StopReason::NodeBudget),
                        Err(e) => WalkState::Done(self.stop_for(e)?),
                    }
                }

                WalkState::MaybeExpand(mut pending) => match pending.pop_front() {
                    None => WalkState::ExpandLevel,
                    Some(item) => match self.expand(item).await {
                        Ok(Some(before)) => WalkState::WaitForChildren {
                            pending,
                            item,
                            before,
                        },
                        Ok(None) => WalkState::MaybeExpand(pending),
                        Err(e) => WalkState::Done(self.stop_for(e)?),
                    },
                },

                WalkState::WaitForChildren {
                    pending,
                    item,
                    before,
                } => match self.wait_for_children(before).await {
                    Ok(appeared) => {
                        self.expansions += 1;
                        self.evidence
                            .capture_expansion(&mut *self.page, self.container)
                            .await;
                        WalkState::EnqueueChild {
                            pending,
                            item,
                            appeared,
                        }
                    }
                    Err(e) => WalkState::Done(self.stop_for(e)?),
                },

                WalkState::EnqueueChild {
                    pending,
                    item,
                    appeared,
                } => {
                    let depth = self.items[item].depth + 1;
                    let parent = self.items[item].normalized.clone();
                    let child = self.entry(depth, Some(parent));
                    let claimed = if appeared {
                        match self.claim_revealed(child.id).await {
                            Ok(()) => Ok(()),
                            Err(e) => self.absorb(e, "claiming revealed controls"),
                        }
                    } else {
                        Ok(())
                    };
                    self.queue.push_back(child);
                    match claimed {
                        Ok(()) => WalkState::MaybeExpand(pending),
                        Err(e) => WalkState::Done(self.stop_for(e)?),
                    }
                }

                WalkState::Done(reason) => return Ok(reason),
            };
        }
    }

    fn entry(&mut self, depth: u8, parent: Option<String>) -> QueueEntry {
        let id = self.next_entry;
        self.next_entry += 1;
        QueueEntry { id, depth, parent }
    }

    /// Record every unseen visible control at the entry's depth and parent.
    async fn record_visible(&mut self, entry: &QueueEntry) -> Result<Recorded> {
        let controls = match self.controls().await {
            Ok(controls) => controls,
            Err(e) => {
                self.absorb(e, "scanning controls")?;
                return Ok(Recorded::Items(Vec::new()));
            }
        };
        let mut recorded = Vec::new();

        for (order, control) in controls.iter().enumerate() {
            let raw = match self.read_text(control).await {
                Ok(raw) => raw,
                Err(e) => {
                    self.absorb(e, "reading control text")?;
                    continue;
                }
            };
            let normalized = normalize(&raw);
            if normalized.is_empty() || self.seen.contains(&normalized) {
                continue;
            }
            if self.claimed.get(&normalized).is_some_and(|owner| *owner != entry.id) {
                continue;
            }
            if self.items.len() >= self.config.max_nodes {
                return Ok(Recorded::BudgetReached);
            }

            let path = self.structural_path(control).await?;
            self.seen.insert(normalized.clone());
            self.items.push(QuestionItem {
                raw,
                normalized,
                depth: entry.depth,
                parent: entry.parent.clone(),
                path,
                order,
            });
            if entry.depth < self.config.max_depth {
                recorded.push(self.items.len() - 1);
            }
        }

        if self.items.len() >= self.config.max_nodes {
            return Ok(Recorded::BudgetReached);
        }
        Ok(Recorded::Items(recorded))
    }

    /// Re-locate the item's control by text and click it. Returns the control
    /// count before the click, or `None` when the node must be treated as a leaf.
    async fn expand(&mut self, item: usize) -> Result<Option<usize>> {
        let ctx = self.ctx;
        let target = self.items[item].normalized.clone();
        let controls = match self.controls().await {
            Ok(controls) => controls,
            Err(e) => {
                self.absorb(e, "re-locating control")?;
                return Ok(None);
            }
        };

        let mut handle = None;
        for control in &controls {
            match self.read_text(control).await {
                Ok(text) if normalize(&text) == target => {
                    handle = Some(control.clone());
                    break;
                }
                Ok(_) => {}
                Err(e) => self.absorb(e, "reading control text")?,
            }
        }

        let Some(handle) = handle else {
            debug!(question = %target, "control no longer present, treating as leaf");
            return Ok(None);
        };

        let delay = self.config.click_delay;
        match ctx
            .bound("expand click", CLICK_TIMEOUT, self.page.click(&handle, delay))
            .await
        {
            Ok(()) => Ok(Some(controls.len())),
            Err(e) => {
                self.absorb(e, "expansion click")?;
                Ok(None)
            }
        }
    }

    /// Poll the control count until it exceeds `before` or the poll times out.
    async fn wait_for_children(&mut self, before: usize) -> Result<bool> {
        if self.page.renders_synchronously() {
            return self.control_count_exceeds(before).await;
        }

        let poll = self.config.child_poll;
        let started = Instant::now();
        loop {
            if self.control_count_exceeds(before).await? {
                return Ok(true);
            }
            let waited = started.elapsed();
            if waited >= poll.timeout {
                return Ok(false);
            }
            self.ctx.sleep(poll.interval.min(poll.timeout - waited)).await?;
        }
    }

    async fn control_count_exceeds(&mut self, before: usize) -> Result<bool> {
        match self.controls().await {
            Ok(controls) => Ok(controls.len() > before),
            Err(e) => {
                self.absorb(e, "counting controls")?;
                Ok(false)
            }
        }
    }

    /// Claim every visible control that is neither recorded nor claimed yet.
    async fn claim_revealed(&mut self, owner: usize) -> Result<()> {
        let controls = self.controls().await?;
        for control in &controls {
            let normalized = normalize(&self.read_text(control).await?);
            if normalized.is_empty() || self.seen.contains(&normalized) {
                continue;
            }
            self.claimed.entry(normalized).or_insert(owner);
        }
        Ok(())
    }

    /// `tag:nth` segments from the container down to `control`.
    async fn structural_path(&mut self, control: &ElementHandle) -> Result<String> {
        let ctx = self.ctx;
        let mut segments = Vec::new();
        let mut current = Some(control.clone());

        while let Some(element) = current {
            if &element == self.container || segments.len() == MAX_PATH_SEGMENTS {
                break;
            }
            let info = match ctx
                .bound("describe", STEP_TIMEOUT, self.page.describe(&element))
                .await
            {
                Ok(info) => info,
                Err(e) => {
                    self.absorb(e, "building structural path")?;
                    break;
                }
            };
            segments.push(format!("{}:{}", info.tag, info.nth_of_type));
            current = match ctx
                .bound("parent", STEP_TIMEOUT, self.page.parent(&element))
                .await
            {
                Ok(parent) => parent,
                Err(e) => {
                    self.absorb(e, "building structural path")?;
                    None
                }
            };
        }

        segments.reverse();
        Ok(segments.join("/"))
    }

    async fn controls(&mut self) -> Result<Vec<ElementHandle>> {
        let ctx = self.ctx;
        ctx.bound(
            "query controls",
            STEP_TIMEOUT,
            self.page.query_all(Some(self.container), ACCORDION_SELECTOR),
        )
        .await
    }

    async fn read_text(&mut self, control: &ElementHandle) -> Result<String> {
        let ctx = self.ctx;
        ctx.bound("read control", STEP_TIMEOUT, self.page.inner_text(control))
            .await
    }

    /// Swallow a recoverable failure; pass through those that end the walk.
    fn absorb(&self, err: QuestionTreeError, what: &str) -> Result<()> {
        if err.is_fatal() || self.deadline_spent(&err) {
            return Err(err);
        }
        debug!(error = %err, "{what} failed, continuing");
        Ok(())
    }

    fn deadline_spent(&self, err: &QuestionTreeError) -> bool {
        matches!(err, QuestionTreeError::Timeout { .. }) && self.ctx.deadline.expired()
    }

    /// Map a walk-ending error to its stop reason; anything else propagates.
    fn stop_for(&self, err: QuestionTreeError) -> Result<StopReason> {
        match err {
            QuestionTreeError::Cancelled => Ok(StopReason::Cancelled),
            err if self.deadline_spent(&err) => Ok(StopReason::TimeBudget),
            other => Err(other),
        }
    }
}
