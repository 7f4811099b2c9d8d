//! Search request controls.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Breadth of a search relative to its base DN.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchScope {
    /// The base entry only.
    Object,
    /// Immediate children of the base entry.
    #[default]
    OneLevel,
    /// The base entry and all its descendants.
    SubTree,
}

impl SearchScope {
    /// Canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Object => "OBJECT",
            Self::OneLevel => "ONE_LEVEL",
            Self::SubTree => "SUB_TREE",
        }
    }
}

impl fmt::Display for SearchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchScope {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "OBJECT" => Ok(Self::Object),
            "ONE_LEVEL" => Ok(Self::OneLevel),
            "SUB_TREE" => Ok(Self::SubTree),
            other => Err(Error::invalid_input(format!("unknown search scope `{other}`"))),
        }
    }
}

/// Server-side ordering of search results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Attribute to order by.
    pub attribute: String,
    /// Optional matching rule OID used for ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_rule: Option<String>,
    /// Descending order when true.
    #[serde(default)]
    pub reverse: bool,
}

impl SortKey {
    /// Ascending order on `attribute`.
    #[must_use]
    pub fn ascending(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            ordering_rule: None,
            reverse: false,
        }
    }

    /// Descending order on `attribute`.
    #[must_use]
    pub fn descending(attribute: impl Into<String>) -> Self {
        Self {
            reverse: true,
            ..Self::ascending(attribute)
        }
    }
}

/// Immutable configuration of a search request.
///
/// Built with [`SearchControls::builder`]; zero limits mean unbounded and a page size of zero
/// disables paging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchControls {
    scope: SearchScope,
    attributes: Option<Vec<String>>,
    time_limit: Duration,
    max_results: u32,
    return_object: bool,
    page_size: u32,
    sort_key: Option<SortKey>,
}

impl SearchControls {
    /// Starts building a set of controls.
    #[must_use]
    pub fn builder() -> SearchControlsBuilder {
        SearchControlsBuilder::default()
    }

    /// Search scope.
    #[must_use]
    pub const fn scope(&self) -> SearchScope {
        self.scope
    }

    /// Attributes to return; `None` returns every user attribute.
    #[must_use]
    pub fn attributes(&self) -> Option<&[String]> {
        self.attributes.as_deref()
    }

    /// Server time limit; zero is unbounded.
    #[must_use]
    pub const fn time_limit(&self) -> Duration {
        self.time_limit
    }

    /// Maximum number of entries; zero is unbounded.
    #[must_use]
    pub const fn max_results(&self) -> u32 {
        self.max_results
    }

    /// Whether the caller asked for entry objects to be returned.
    #[must_use]
    pub const fn return_object(&self) -> bool {
        self.return_object
    }

    /// Page size; zero disables paging.
    #[must_use]
    pub const fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Requested ordering.
    #[must_use]
    pub fn sort_key(&self) -> Option<&SortKey> {
        self.sort_key.as_ref()
    }

    /// Returns true when results should be fetched page by page.
    #[must_use]
    pub const fn is_paging_enabled(&self) -> bool {
        self.page_size > 0
    }

    /// Returns a copy with blank and duplicate attribute names removed. An attribute list
    /// that ends up empty means "all attributes".
    #[must_use]
    pub fn normalized(&self) -> Self {
        let attributes = self.attributes.as_ref().and_then(|names| {
            let mut kept: Vec<String> = Vec::with_capacity(names.len());
            for name in names.iter().map(|name| name.trim()) {
                if !name.is_empty() && !kept.iter().any(|seen| seen.eq_ignore_ascii_case(name)) {
                    kept.push(name.to_string());
                }
            }
            (!kept.is_empty()).then_some(kept)
        });
        Self {
            attributes,
            ..self.clone()
        }
    }
}

/// Builder for [`SearchControls`].
#[derive(Debug, Clone, Default)]
pub struct SearchControlsBuilder {
    controls: SearchControls,
}

impl SearchControlsBuilder {
    /// Sets the scope.
    #[must_use]
    pub const fn scope(mut self, scope: SearchScope) -> Self {
        self.controls.scope = scope;
        self
    }

    /// Restricts the returned attributes.
    #[must_use]
    pub fn attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.controls.attributes = Some(attributes.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the server time limit.
    #[must_use]
    pub const fn time_limit(mut self, limit: Duration) -> Self {
        self.controls.time_limit = limit;
        self
    }

    /// Sets the maximum number of entries.
    #[must_use]
    pub const fn max_results(mut self, max: u32) -> Self {
        self.controls.max_results = max;
        self
    }

    /// Sets the return-object flag.
    #[must_use]
    pub const fn return_object(mut self, return_object: bool) -> Self {
        self.controls.return_object = return_object;
        self
    }

    /// Sets the page size. Zero or negative disables paging.
    #[must_use]
    pub fn page_size(mut self, size: i32) -> Self {
        self.controls.page_size = u32::try_from(size).unwrap_or(0);
        self
    }

    /// Requests server-side ordering.
    #[must_use]
    pub fn sort_key(mut self, key: SortKey) -> Self {
        self.controls.sort_key = Some(key);
        self
    }

    /// Finishes the controls.
    #[must_use]
    pub fn build(self) -> SearchControls {
        self.controls
    }
}
