//! Known projects and the shared subset that fans out to all of them

use serde::Deserialize;
use std::collections::HashSet;

use crate::error::{DispatchError, Result};

/// The fixed set of buildable projects plus the "shared" identifiers whose
/// modification affects every project.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProjectCatalog {
    pub includes: Vec<String>,
    pub common: Vec<String>,
}

impl Default for ProjectCatalog {
    fn default() -> Self {
        Self {
            includes: vec![
                "project1".to_string(),
                "project2".to_string(),
                "project3".to_string(),
            ],
            common: vec!["common".to_string()],
        }
    }
}

impl ProjectCatalog {
    pub fn new<I, C, S>(includes: I, common: C) -> Self
    where
        I: IntoIterator<Item = S>,
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            includes: includes.into_iter().map(Into::into).collect(),
            common: common.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of known projects, used as the early-stop bound during resolution.
    pub fn len(&self) -> usize {
        self.includes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty()
    }

    pub fn contains(&self, project: &str) -> bool {
        self.includes.iter().any(|p| p == project)
    }

    pub fn is_shared(&self, segment: &str) -> bool {
        self.common.iter().any(|c| c == segment)
    }

    /// Rejects duplicate or empty project names and names listed as both a
    /// project and a shared identifier. Resolution relies on `len()` being
    /// the number of distinct projects.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for project in &self.includes {
            if project.is_empty() || project.contains('/') {
                return Err(DispatchError::ConfigError(format!(
                    "invalid project name '{}' in catalog.includes",
                    project
                )));
            }
            if !seen.insert(project.as_str()) {
                return Err(DispatchError::ConfigError(format!(
                    "project '{}' is listed more than once in catalog.includes",
                    project
                )));
            }
        }
        if let Some(both) = self.common.iter().find(|c| seen.contains(c.as_str())) {
            return Err(DispatchError::ConfigError(format!(
                "'{}' is listed in both catalog.includes and catalog.common",
                both
            )));
        }
        Ok(())
    }
}
