use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::traits::ProjectRegistry;

/// Project registry backed by a fixed id -> root table, usually the
/// `[projects]` section of the configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    roots: BTreeMap<String, PathBuf>,
}

impl StaticRegistry {
    pub fn new(roots: BTreeMap<String, PathBuf>) -> Self {
        Self { roots }
    }

    #[must_use]
    pub fn with_project(mut self, id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.roots.insert(id.into(), root.into());
        self
    }
}

impl ProjectRegistry for StaticRegistry {
    fn root_of(&self, project_id: &str) -> Result<PathBuf> {
        self.roots
            .get(project_id)
            .cloned()
            .ok_or_else(|| Error::UnknownProject(project_id.to_string()))
    }

    fn projects(&self) -> Vec<String> {
        self.roots.keys().cloned().collect()
    }
}
