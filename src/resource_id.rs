//! Hierarchical resource identifiers
//!
//! A `ResourceId` is an opaque path-like identifier for an addressable
//! resource in the repository. Identity is by content; the `/`-separated
//! structure is only interpreted to navigate to a parent.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for a repository resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identifier of the containing resource, if any
    pub fn parent(&self) -> Option<ResourceId> {
        self.0
            .rfind('/')
            .map(|idx| ResourceId(self.0[..idx].to_string()))
    }

    /// True when the identifier has no parent segment
    pub fn is_root(&self) -> bool {
        !self.0.contains('/')
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
