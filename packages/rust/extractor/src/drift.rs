//! Drift fingerprint: a short digest of the outbound links a page rendered.
//!
//! Two runs with equal fingerprints almost certainly saw the same organic
//! results. The value is an audit signal only and never affects extraction.

use std::collections::HashSet;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use questiontree_shared::Result;

use crate::browser::PageSession;
use crate::budget::RunContext;

/// Sentinel returned when no fingerprint could be computed.
pub const NO_HASH: &str = "nohash";

/// Number of distinct outbound links folded into the digest.
const LINK_LIMIT: usize = 10;

/// Hex length of the fingerprint.
const FINGERPRINT_LEN: usize = 16;

/// Upper bound on the whole link scan.
const SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Fingerprint the current page. Never fails: errors yield [`NO_HASH`].
pub async fn drift_fingerprint(page: &mut dyn PageSession, ctx: &RunContext) -> String {
    let scan = ctx
        .bound("drift scan", SCAN_TIMEOUT, collect_links(page))
        .await;

    match scan {
        Ok((page_url, hrefs)) => {
            let links = outbound_links(&page_url, &hrefs);
            if links.is_empty() {
                debug!("no outbound links to fingerprint");
                NO_HASH.to_string()
            } else {
                fingerprint(&links)
            }
        }
        Err(e) => {
            debug!(error = %e, "drift fingerprint unavailable");
            NO_HASH.to_string()
        }
    }
}

async fn collect_links(page: &mut dyn PageSession) -> Result<(String, Vec<String>)> {
    let page_url = page.page_url().await?;
    let anchors = page.query_all(None, "a[href]").await?;
    let mut hrefs = Vec::with_capacity(anchors.len());
    for anchor in &anchors {
        if let Some(href) = page.attribute(anchor, "href").await? {
            hrefs.push(href);
        }
    }
    Ok((page_url, hrefs))
}

/// First distinct outbound targets in document order.
pub(crate) fn outbound_links(page_url: &str, hrefs: &[String]) -> Vec<String> {
    let Ok(base) = Url::parse(page_url) else {
        return Vec::new();
    };
    let own = base.host_str().map(strip_www).unwrap_or_default().to_string();

    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for href in hrefs {
        let Ok(mut target) = base.join(href) else {
            continue;
        };
        // Unwrap search-engine redirect links (`/url?q=<target>`).
        if target.path() == "/url" {
            if let Some(inner) = target
                .query_pairs()
                .find(|(k, _)| k == "q" || k == "url")
                .and_then(|(_, v)| Url::parse(&v).ok())
            {
                target = inner;
            }
        }

        if target.scheme() != "http" && target.scheme() != "https" {
            continue;
        }
        let Some(host) = target.host_str().map(strip_www) else {
            continue;
        };
        if !own.is_empty() && (host == own || host.ends_with(&format!(".{own}"))) {
            continue;
        }

        target.set_fragment(None);
        let key = target.to_string();
        if seen.insert(key.clone()) {
            links.push(key);
            if links.len() == LINK_LIMIT {
                break;
            }
        }
    }

    links
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

pub(crate) fn fingerprint(links: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(links.join("\n").as_bytes());
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(FINGERPRINT_LEN);
    hex
}
