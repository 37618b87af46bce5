//! Question-tree container location.
//!
//! Primary strategy scores block elements by how many accordion controls they
//! contain. When nothing scores high enough, a multilingual heading search is
//! tried. Not finding a container is a normal outcome, not an error.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use questiontree_shared::{Result, fold_for_match};

use crate::browser::{ElementHandle, PageSession};
use crate::budget::RunContext;

/// Expandable controls inside a question tree.
pub const ACCORDION_SELECTOR: &str = "[aria-expanded], details > summary";

const BLOCK_SELECTOR: &str = "div, section, article, aside, main";

const HEADING_SELECTOR: &str = "h1, h2, h3, h4, h5, h6, [role='heading']";

/// Blocks shorter than this (when the engine knows heights) are skipped.
const MIN_HEIGHT_PX: f64 = 120.0;

/// Minimum accordion controls a candidate must contain.
const MIN_CONTROLS: usize = 3;

const LANDMARK_BONUS: usize = 2;

const LANDMARK_ROLES: &[&str] = &["region", "complementary", "main", "search", "navigation"];

/// Ancestor walk limit per control.
const MAX_ANCESTORS: usize = 64;

const LOCATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Section headings, in priority order, compared after diacritic folding.
pub const HEADING_PHRASES: &[&str] = &[
    "people also ask",
    "related questions",
    "autres questions posees",
    "andere fragen auch",
    "otras preguntas de los usuarios",
    "preguntas relacionadas",
    "altre domande",
    "as pessoas tambem perguntam",
    "mensen vragen ook",
    "inne pytania",
    "andra fragar ocksa",
    "другие вопросы",
    "その他の質問",
    "insanlar bunlari da soruyor",
];

/// Which strategy produced a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocateStrategy {
    Structural { score: usize },
    Heading { phrase: &'static str },
}

/// A located question-tree container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub container: ElementHandle,
    pub strategy: LocateStrategy,
}

/// Locate the question-tree container, or `None` when the page has none.
pub async fn locate_container(
    page: &mut dyn PageSession,
    ctx: &RunContext,
) -> Result<Option<Located>> {
    if let Some(found) = ctx
        .bound("structural locate", LOCATE_TIMEOUT, structural_candidate(page))
        .await?
    {
        debug!(?found.strategy, "container located structurally");
        return Ok(Some(found));
    }

    let found = ctx
        .bound("heading locate", LOCATE_TIMEOUT, heading_candidate(page))
        .await?;
    match &found {
        Some(f) => debug!(?f.strategy, "container located by heading"),
        None => debug!("no question container on page"),
    }
    Ok(found)
}

/// Highest-scoring block; ties go to the first in document order.
///
/// Scores are accumulated by walking up from every control, which visits
/// exactly the blocks that could reach the minimum.
async fn structural_candidate(page: &mut dyn PageSession) -> Result<Option<Located>> {
    let controls = page.query_all(None, ACCORDION_SELECTOR).await?;
    if controls.len() < MIN_CONTROLS {
        return Ok(None);
    }

    let mut counts: HashMap<ElementHandle, usize> = HashMap::new();
    for control in &controls {
        let mut current = page.parent(control).await?;
        let mut steps = 0;
        while let Some(ancestor) = current {
            if steps == MAX_ANCESTORS {
                break;
            }
            *counts.entry(ancestor.clone()).or_default() += 1;
            current = page.parent(&ancestor).await?;
            steps += 1;
        }
    }

    let blocks = page.query_all(None, BLOCK_SELECTOR).await?;
    let mut best: Option<(ElementHandle, usize)> = None;

    for block in blocks {
        let count = counts.get(&block).copied().unwrap_or(0);
        if count < MIN_CONTROLS {
            continue;
        }

        let info = page.describe(&block).await?;
        if info.height.is_some_and(|h| h < MIN_HEIGHT_PX) {
            continue;
        }

        let landmark = info
            .role
            .as_deref()
            .is_some_and(|r| LANDMARK_ROLES.contains(&r.to_ascii_lowercase().as_str()));
        let score = count + if landmark { LANDMARK_BONUS } else { 0 };

        if best.as_ref().is_none_or(|(_, s)| score > *s) {
            best = Some((block, score));
        }
    }

    Ok(best.map(|(container, score)| Located {
        container,
        strategy: LocateStrategy::Structural { score },
    }))
}

/// Parent of the first heading matching a known phrase, phrases in priority order.
async fn heading_candidate(page: &mut dyn PageSession) -> Result<Option<Located>> {
    let headings = page.query_all(None, HEADING_SELECTOR).await?;
    let mut texts = Vec::with_capacity(headings.len());
    for heading in &headings {
        texts.push(fold_for_match(&page.inner_text(heading).await?));
    }

    for phrase in HEADING_PHRASES {
        let needle = fold_for_match(phrase);
        for (heading, text) in headings.iter().zip(&texts) {
            if !text.contains(&needle) {
                continue;
            }
            if let Some(container) = page.parent(heading).await? {
                return Ok(Some(Located {
                    container,
                    strategy: LocateStrategy::Heading { phrase },
                }));
            }
        }
    }

    Ok(None)
}
