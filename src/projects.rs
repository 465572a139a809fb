//! Registry of project repositories (`projects.json`, global only).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DevxError, Result};
use crate::naming::{normalize_dns, MAX_LABEL_LEN};
use crate::paths::{path_is_within, write_atomic_text_file, StateFile, StorageLocator};
use crate::worktree::Git;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_branch: String,
    #[serde(default)]
    pub auto_pull: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectRegistry {
    #[serde(default)]
    pub projects: BTreeMap<String, Project>,
}

pub fn validate_alias(alias: &str) -> Result<()> {
    if alias.is_empty() || alias.len() > MAX_LABEL_LEN || normalize_dns(alias) != alias {
        return Err(DevxError::Validation(format!(
            "invalid project alias '{alias}': use at most {MAX_LABEL_LEN} lowercase letters, digits and single dashes (e.g. '{}')",
            normalize_dns(alias)
        )));
    }
    Ok(())
}

pub fn project_not_found(alias: &str) -> DevxError {
    DevxError::NotFound(format!(
        "project '{alias}' not found; register it with `devx project add <path> --alias {alias}`"
    ))
}

pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn open(locator: &StorageLocator) -> Self {
        Self::at(locator.global(StateFile::Projects))
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<ProjectRegistry> {
        if !self.path.exists() {
            return Ok(ProjectRegistry::default());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(ProjectRegistry::default());
        }
        serde_json::from_str(&content).map_err(|err| DevxError::StoreCorruption {
            path: self.path.clone(),
            message: err.to_string(),
        })
    }

    fn save(&self, registry: &ProjectRegistry) -> Result<()> {
        let body = serde_json::to_string_pretty(registry)?;
        write_atomic_text_file(&self.path, &format!("{body}\n"), None)
    }

    pub fn list(&self) -> Result<Vec<(String, Project)>> {
        Ok(self.load()?.projects.into_iter().collect())
    }

    pub fn get(&self, alias: &str) -> Result<Project> {
        self.load()?
            .projects
            .remove(alias)
            .ok_or_else(|| project_not_found(alias))
    }

    pub fn add(&self, git: &Git<'_>, alias: &str, mut project: Project) -> Result<Project> {
        validate_alias(alias)?;
        if !project.path.is_dir() {
            return Err(DevxError::Validation(format!(
                "project path {} does not exist",
                project.path.display()
            )));
        }
        project.path = fs::canonicalize(&project.path)?;
        if !git.is_repository_root(&project.path) {
            return Err(DevxError::Validation(format!(
                "{} is not the root of a git repository",
                project.path.display()
            )));
        }
        if project.name.trim().is_empty() {
            project.name = alias.to_string();
        }
        let mut registry = self.load()?;
        if registry.projects.contains_key(alias) {
            return Err(DevxError::Validation(format!(
                "project '{alias}' already exists"
            )));
        }
        registry.projects.insert(alias.to_string(), project.clone());
        self.save(&registry)?;
        Ok(project)
    }

    pub fn remove(&self, alias: &str) -> Result<Project> {
        let mut registry = self.load()?;
        let project = registry
            .projects
            .remove(alias)
            .ok_or_else(|| project_not_found(alias))?;
        self.save(&registry)?;
        Ok(project)
    }

    /// Innermost registered project containing `cwd`.
    pub fn find_containing(&self, cwd: &Path) -> Result<Option<(String, Project)>> {
        Ok(self
            .load()?
            .projects
            .into_iter()
            .filter(|(_, project)| path_is_within(cwd, &project.path))
            .max_by_key(|(_, project)| project.path.components().count()))
    }
}
