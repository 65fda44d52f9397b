//! Push notification payload structures

use serde::Deserialize;

use crate::error::DispatchError;

/// Header naming the event type of a delivery (`push`, `ping`, ...)
pub const EVENT_HEADER: &str = "x-github-event";

/// The subset of a push event the dispatcher consults.
#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub commits: Vec<Commit>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Commit {
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
}

impl Notification {
    /// Decodes the exact bytes that were signed.
    pub fn from_slice(body: &[u8]) -> Result<Self, DispatchError> {
        serde_json::from_slice(body).map_err(|e| DispatchError::MalformedPayload(e.to_string()))
    }

    /// Only the first commit of a push is consulted.
    pub fn head_commit(&self) -> Option<&Commit> {
        self.commits.first()
    }
}

impl Commit {
    /// Modified, then added, then removed paths, each list in its own order.
    pub fn changed_paths(&self) -> impl Iterator<Item = &str> {
        self.modified
            .iter()
            .chain(&self.added)
            .chain(&self.removed)
            .map(String::as_str)
    }
}
