//! Maps changed file paths to the projects that need rebuilding

use std::collections::HashSet;

use crate::catalog::ProjectCatalog;

/// Ordered, de-duplicated set of project identifiers.
///
/// Iteration order is first-insertion order, which for a resolved set is the
/// order in which each project was first seen among the changed paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AffectedProjectSet {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl AffectedProjectSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every project of the catalog, in catalog order.
    pub fn full(catalog: &ProjectCatalog) -> Self {
        let mut set = Self::new();
        for project in &catalog.includes {
            set.insert(project);
        }
        set
    }

    /// Appends `project` unless already present. Returns true if it was added.
    pub fn insert(&mut self, project: &str) -> bool {
        if self.seen.contains(project) {
            return false;
        }
        self.seen.insert(project.to_string());
        self.order.push(project.to_string());
        true
    }

    pub fn contains(&self, project: &str) -> bool {
        self.seen.contains(project)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.order
    }
}

/// Top-level directory of a project-relative path.
///
/// Root-level files (no `/`) and paths with an empty leading segment yield None.
pub fn top_segment(path: &str) -> Option<&str> {
    path.split_once('/')
        .map(|(segment, _)| segment)
        .filter(|segment| !segment.is_empty())
}

/// Resolves changed paths to the affected projects.
///
/// A path under a shared directory short-circuits to the whole catalog and
/// stops consuming `changed_paths`. Resolution also stops once every catalog
/// slot is filled. Segments unknown to the catalog are kept and count
/// towards that bound; use [`resolve_known`] to set them aside instead.
pub fn resolve<I, S>(changed_paths: I, catalog: &ProjectCatalog) -> AffectedProjectSet
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    resolve_with(changed_paths, catalog, true).projects
}

/// Outcome of [`resolve_known`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Catalog projects, in first-detection order.
    pub projects: AffectedProjectSet,
    /// Segments outside the catalog seen before resolution stopped.
    pub unknown: AffectedProjectSet,
}

/// Like [`resolve`], but only catalog projects are resolved. Unknown
/// segments are collected separately and never count towards the early stop,
/// so a later project or shared path is still seen.
pub fn resolve_known<I, S>(changed_paths: I, catalog: &ProjectCatalog) -> Resolution
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    resolve_with(changed_paths, catalog, false)
}

fn resolve_with<I, S>(changed_paths: I, catalog: &ProjectCatalog, passthrough: bool) -> Resolution
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut resolution = Resolution::default();

    for path in changed_paths {
        let Some(segment) = top_segment(path.as_ref()) else {
            continue;
        };

        if catalog.is_shared(segment) {
            resolution.projects = AffectedProjectSet::full(catalog);
            break;
        }

        if !passthrough && !catalog.contains(segment) {
            resolution.unknown.insert(segment);
            continue;
        }

        let projects = &mut resolution.projects;
        if projects.insert(segment) && projects.len() == catalog.len() {
            break;
        }
    }

    resolution
}
