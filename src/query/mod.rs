//! Query and update seams
//!
//! The full path-expression compiler lives outside the core; engines only
//! need three capabilities from it: a row matcher (does this element satisfy
//! the query), a row update (mutate an element in place, report how much
//! changed), and a shard-property selector (extract the sharding value from
//! a row). Simple concrete implementations are provided for callers and
//! tests that do not go through the compiler.

use std::sync::Arc;

use xmltree::{Element, XMLNode};

use crate::Result;

// ============================================================================
// Row Matcher / Query
// ============================================================================

/// Decides whether a row element satisfies a query.
pub trait RowMatcher: Send + Sync {
    fn matches(&self, row: &Element) -> bool;
}

/// A compiled query as consumed by the engines: a shareable row matcher.
#[derive(Clone)]
pub struct Query {
    matcher: Arc<dyn RowMatcher>,
}

impl Query {
    pub fn new(matcher: Arc<dyn RowMatcher>) -> Self {
        Self { matcher }
    }

    /// A query matching every row.
    pub fn all() -> Self {
        Self::new(Arc::new(MatchAll))
    }

    /// Matches rows whose child element `child` has text content `value`.
    pub fn child_text_eq(child: &str, value: &str) -> Self {
        Self::new(Arc::new(ChildTextEq {
            child: child.to_string(),
            value: value.to_string(),
        }))
    }

    pub fn matches(&self, row: &Element) -> bool {
        self.matcher.matches(row)
    }
}

struct MatchAll;

impl RowMatcher for MatchAll {
    fn matches(&self, _row: &Element) -> bool {
        true
    }
}

struct ChildTextEq {
    child: String,
    value: String,
}

impl RowMatcher for ChildTextEq {
    fn matches(&self, row: &Element) -> bool {
        row.get_child(self.child.as_str())
            .and_then(|c| c.get_text())
            .map(|t| t == self.value.as_str())
            .unwrap_or(false)
    }
}

// ============================================================================
// Row Update
// ============================================================================

/// Mutates a row element in place, returning the number of modifications.
/// An engine installs a new version only when the count is non-zero.
pub trait RowUpdate: Send + Sync {
    fn apply(&self, row: &mut Element) -> Result<usize>;
}

/// Sets the text content of a child element, creating the child if absent.
/// Reports no change when the text already matches.
pub struct SetChildText {
    child: String,
    value: String,
}

impl SetChildText {
    pub fn new(child: &str, value: &str) -> Self {
        Self {
            child: child.to_string(),
            value: value.to_string(),
        }
    }
}

impl RowUpdate for SetChildText {
    fn apply(&self, row: &mut Element) -> Result<usize> {
        if let Some(child) = row.get_mut_child(self.child.as_str()) {
            let current = child.get_text().map(|t| t.into_owned());
            if current.as_deref() == Some(self.value.as_str()) {
                return Ok(0);
            }
            child
                .children
                .retain(|node| !matches!(node, XMLNode::Text(_) | XMLNode::CData(_)));
            child.children.push(XMLNode::Text(self.value.clone()));
            return Ok(1);
        }

        let mut child = Element::new(&self.child);
        child.children.push(XMLNode::Text(self.value.clone()));
        row.children.push(XMLNode::Element(child));
        Ok(1)
    }
}

// ============================================================================
// Shard Property Selector
// ============================================================================

/// Extracts the sharding value from a row element. The expression string is
/// carried so routing failures can cite what was evaluated.
pub trait PropertySelector: Send + Sync {
    fn expression(&self) -> &str;
    fn select(&self, row: &Element) -> Option<String>;
}

/// Selects the text of a named child element.
pub struct ChildTextSelector {
    child: String,
    expression: String,
}

impl ChildTextSelector {
    pub fn new(child: &str) -> Self {
        Self {
            child: child.to_string(),
            expression: child.to_string(),
        }
    }
}

impl PropertySelector for ChildTextSelector {
    fn expression(&self) -> &str {
        &self.expression
    }

    fn select(&self, row: &Element) -> Option<String> {
        row.get_child(self.child.as_str())
            .and_then(|c| c.get_text())
            .map(|t| t.into_owned())
    }
}

// ============================================================================
// Tests
// ============================================================================
