//! Question-tree extraction engine.
//!
//! This crate provides:
//! - [`browser`]: the page-automation interface ([`BrowserLauncher`], [`PageSession`])
//! - [`HttpLauncher`]: a static, server-rendered implementation of that interface
//! - [`SessionManager`]: per-run session acquisition with proxy selection
//! - [`locator`] / [`walker`]: container location and breadth-first tree expansion
//! - [`RunExecutor`]: one complete extraction run with guaranteed session release

pub mod browser;
pub mod budget;
pub mod dom;
pub mod drift;
pub mod evidence;
pub mod http;
pub mod locator;
pub mod query;
pub mod runner;
pub mod session;
pub mod walker;

#[cfg(test)]
mod testing;

pub use browser::{
    BrowserLauncher, Capture, ElementHandle, ElementInfo, LaunchOptions, LoadState, PageSession,
    ProxyEndpoint, Viewport,
};
pub use budget::{CancelFlag, CancelHandle, ChildPoll, Deadline, RunContext};
pub use drift::{NO_HASH, drift_fingerprint};
pub use evidence::EvidenceCapturer;
pub use http::HttpLauncher;
pub use locator::{LocateStrategy, Located, locate_container};
pub use query::{PageRequest, compose};
pub use runner::RunExecutor;
pub use session::{
    FixedProxySelector, ProxySelector, RandomProxySelector, Session, SessionGuard, SessionManager,
};
pub use walker::{WalkConfig, WalkOutcome, walk};
