//! Static document model over server-rendered HTML.
//!
//! Backs the HTTP rendering engine. Elements are addressed by their index in
//! document order. Hidden regions (`hidden`, `display:none`, closed
//! `<details>`) are invisible until a click on a control that owns them
//! (`aria-controls`, or the `<summary>` of a `<details>`) reveals them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use ego_tree::NodeId;
use scraper::{ElementRef, Html, Selector};

use questiontree_shared::{QuestionTreeError, Result};

use crate::browser::{ElementHandle, ElementInfo};

/// Parsed page plus the set of regions revealed by clicks.
///
/// The document is parsed once; handles index into the element list built
/// at parse time.
#[derive(Debug, Clone)]
pub struct StaticDom {
    doc: Html,
    /// Element node ids in document order.
    elements: Vec<NodeId>,
    index_of: HashMap<NodeId, usize>,
    revealed: HashSet<usize>,
}

impl Default for StaticDom {
    fn default() -> Self {
        Self::new("")
    }
}

impl StaticDom {
    pub fn new(html: impl AsRef<str>) -> Self {
        let doc = Html::parse_document(html.as_ref());
        let elements: Vec<NodeId> = doc
            .tree
            .root()
            .descendants()
            .filter_map(ElementRef::wrap)
            .map(|el| el.id())
            .collect();
        let index_of = elements.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        Self {
            doc,
            elements,
            index_of,
            revealed: HashSet::new(),
        }
    }

    /// Visible elements matching `selector` in document order.
    pub fn query_all(&self, scope: Option<&ElementHandle>, selector: &str) -> Result<Vec<ElementHandle>> {
        let selector = parse_selector(selector)?;

        let matches: Vec<ElementRef<'_>> = match scope {
            Some(scope) => {
                let root = self.element(handle_index(scope)?)?;
                root.select(&selector).filter(|el| el.id() != root.id()).collect()
            }
            None => self
                .elements()
                .filter(|el| selector.matches(el))
                .collect(),
        };

        Ok(matches
            .into_iter()
            .filter(|el| self.is_visible(*el))
            .filter_map(|el| self.handle_of(el))
            .collect())
    }

    pub fn inner_text(&self, element: &ElementHandle) -> Result<String> {
        let el = self.resolve(element)?;
        let text: String = el.text().collect::<Vec<_>>().join(" ");
        Ok(text.split_whitespace().collect::<Vec<_>>().join(" "))
    }

    pub fn attribute(&self, element: &ElementHandle, name: &str) -> Result<Option<String>> {
        Ok(self.resolve(element)?.value().attr(name).map(String::from))
    }

    pub fn describe(&self, element: &ElementHandle) -> Result<ElementInfo> {
        let el = self.resolve(element)?;
        let tag = el.value().name().to_string();
        let nth_of_type = el
            .prev_siblings()
            .filter_map(ElementRef::wrap)
            .filter(|sib| sib.value().name() == tag)
            .count()
            + 1;
        Ok(ElementInfo {
            role: el.value().attr("role").map(String::from),
            height: None,
            nth_of_type,
            tag,
        })
    }

    pub fn parent(&self, element: &ElementHandle) -> Result<Option<ElementHandle>> {
        Ok(self
            .resolve(element)?
            .parent()
            .and_then(ElementRef::wrap)
            .and_then(|p| self.handle_of(p)))
    }

    pub fn outer_html(&self, element: &ElementHandle) -> Result<String> {
        Ok(self.resolve(element)?.html())
    }

    /// Reveal whatever region `element` controls. Returns whether anything
    /// new became visible.
    pub fn click(&mut self, element: &ElementHandle) -> Result<bool> {
        let el = self.resolve(element)?;
        let mut targets = Vec::new();

        if let Some(ids) = el.value().attr("aria-controls") {
            let wanted: HashSet<&str> = ids.split_whitespace().collect();
            targets.extend(
                self.elements()
                    .filter(|candidate| candidate.value().id().is_some_and(|id| wanted.contains(id)))
                    .filter_map(|candidate| self.index_of.get(&candidate.id()).copied()),
            );
        }

        if el.value().name() == "summary" {
            if let Some(details) = el
                .parent()
                .and_then(ElementRef::wrap)
                .filter(|p| p.value().name() == "details")
            {
                targets.extend(self.index_of.get(&details.id()).copied());
            }
        }

        let mut changed = false;
        for t in targets {
            changed |= self.revealed.insert(t);
        }
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn elements(&self) -> impl Iterator<Item = ElementRef<'_>> {
        self.elements
            .iter()
            .filter_map(|id| self.doc.tree.get(*id))
            .filter_map(ElementRef::wrap)
    }

    fn element(&self, index: usize) -> Result<ElementRef<'_>> {
        self.elements
            .get(index)
            .and_then(|id| self.doc.tree.get(*id))
            .and_then(ElementRef::wrap)
            .ok_or_else(|| stale(index))
    }

    fn resolve(&self, element: &ElementHandle) -> Result<ElementRef<'_>> {
        self.element(handle_index(element)?)
    }

    fn handle_of(&self, el: ElementRef<'_>) -> Option<ElementHandle> {
        self.index_of.get(&el.id()).map(|i| handle(*i))
    }

    fn is_visible(&self, el: ElementRef<'_>) -> bool {
        let mut child_of_details_summary = false;
        let chain = std::iter::once(el).chain(el.ancestors().filter_map(ElementRef::wrap));

        for node in chain {
            let revealed = self
                .index_of
                .get(&node.id())
                .is_some_and(|i| self.revealed.contains(i));

            if node.value().name() == "summary" {
                child_of_details_summary = true;
                continue;
            }

            if node.value().name() == "details" {
                let open = node.value().attr("open").is_some() || revealed;
                if !open && !child_of_details_summary {
                    return false;
                }
                child_of_details_summary = false;
                continue;
            }
            child_of_details_summary = false;

            if revealed {
                continue;
            }
            if node.value().attr("hidden").is_some() {
                return false;
            }
            if node
                .value()
                .attr("style")
                .is_some_and(|s| s.replace(' ', "").contains("display:none"))
            {
                return false;
            }
        }
        true
    }
}

/// A [`StaticDom`] shared with the blocking pool.
///
/// Parsing and every query run in `spawn_blocking`, so a large document never
/// stalls the runtime and the caller's timeouts fire on schedule.
#[derive(Debug, Clone, Default)]
pub struct SharedDom(Arc<Mutex<StaticDom>>);

impl SharedDom {
    pub async fn load(html: String) -> Result<Self> {
        let dom = blocking(move || Ok(StaticDom::new(html))).await?;
        Ok(Self(Arc::new(Mutex::new(dom))))
    }

    pub async fn query_all(
        &self,
        scope: Option<&ElementHandle>,
        selector: &str,
    ) -> Result<Vec<ElementHandle>> {
        let scope = scope.cloned();
        let selector = selector.to_string();
        self.with(move |dom| dom.query_all(scope.as_ref(), &selector)).await
    }

    pub async fn inner_text(&self, element: &ElementHandle) -> Result<String> {
        let element = element.clone();
        self.with(move |dom| dom.inner_text(&element)).await
    }

    pub async fn attribute(&self, element: &ElementHandle, name: &str) -> Result<Option<String>> {
        let element = element.clone();
        let name = name.to_string();
        self.with(move |dom| dom.attribute(&element, &name)).await
    }

    pub async fn describe(&self, element: &ElementHandle) -> Result<ElementInfo> {
        let element = element.clone();
        self.with(move |dom| dom.describe(&element)).await
    }

    pub async fn parent(&self, element: &ElementHandle) -> Result<Option<ElementHandle>> {
        let element = element.clone();
        self.with(move |dom| dom.parent(&element)).await
    }

    pub async fn outer_html(&self, element: &ElementHandle) -> Result<String> {
        let element = element.clone();
        self.with(move |dom| dom.outer_html(&element)).await
    }

    pub async fn click(&self, element: &ElementHandle) -> Result<bool> {
        let element = element.clone();
        self.with(move |dom| dom.click(&element)).await
    }

    async fn with<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StaticDom) -> Result<T> + Send + 'static,
    {
        let dom = Arc::clone(&self.0);
        blocking(move || {
            let mut dom = dom
                .lock()
                .map_err(|_| QuestionTreeError::Page("document lock poisoned".into()))?;
            f(&mut dom)
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| QuestionTreeError::Page(format!("document task failed: {e}")))?
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector)
        .map_err(|e| QuestionTreeError::Page(format!("invalid selector '{selector}': {e:?}")))
}

fn handle(index: usize) -> ElementHandle {
    ElementHandle(format!("e{index}"))
}

fn handle_index(handle: &ElementHandle) -> Result<usize> {
    handle
        .0
        .strip_prefix('e')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| QuestionTreeError::Page(format!("foreign element handle '{}'", handle.0)))
}

fn stale(index: usize) -> QuestionTreeError {
    QuestionTreeError::Page(format!("element e{index} no longer exists"))
}
