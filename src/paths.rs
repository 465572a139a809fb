//! Storage discovery and atomic file writes.

use crate::error::Result;
use dirs::home_dir;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const PROJECT_DIR_NAME: &str = ".devx";
pub const CONFIG_DIR_ENV: &str = "DEVX_CONFIG_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFile {
    Config,
    Sessions,
    LayoutTemplate,
    Projects,
    CaddyConfig,
}

impl StateFile {
    pub fn file_name(self) -> &'static str {
        match self {
            StateFile::Config => "config.yaml",
            StateFile::Sessions => "sessions.json",
            StateFile::LayoutTemplate => "session.yaml.tmpl",
            StateFile::Projects => "projects.json",
            StateFile::CaddyConfig => "caddy-config.json",
        }
    }

    /// Files that only ever live in the global directory.
    fn global_only(self) -> bool {
        matches!(self, StateFile::Projects | StateFile::CaddyConfig)
    }
}

pub fn default_global_dir() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_DIR_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("devx");
    base
}

/// Resolves named state files, preferring the nearest `.devx/` directory
/// above the working directory over the global directory.
#[derive(Debug, Clone)]
pub struct StorageLocator {
    project_dir: Option<PathBuf>,
    global_dir: PathBuf,
}

impl StorageLocator {
    pub fn discover(cwd: &Path, global_dir: PathBuf) -> Self {
        let project_dir = cwd
            .ancestors()
            .map(|dir| dir.join(PROJECT_DIR_NAME))
            .find(|candidate| candidate.is_dir() && *candidate != global_dir);
        Self {
            project_dir,
            global_dir,
        }
    }

    pub fn project_dir(&self) -> Option<&Path> {
        self.project_dir.as_deref()
    }

    pub fn global_dir(&self) -> &Path {
        &self.global_dir
    }

    pub fn resolve(&self, file: StateFile) -> PathBuf {
        match (&self.project_dir, file.global_only()) {
            (Some(dir), false) => dir.join(file.file_name()),
            _ => self.global(file),
        }
    }

    pub fn global(&self, file: StateFile) -> PathBuf {
        self.global_dir.join(file.file_name())
    }

    /// First existing candidate, project level before global.
    pub fn existing(&self, file: StateFile) -> Option<PathBuf> {
        let mut candidates = Vec::new();
        if let (Some(dir), false) = (&self.project_dir, file.global_only()) {
            candidates.push(dir.join(file.file_name()));
        }
        candidates.push(self.global(file));
        candidates.into_iter().find(|path| path.is_file())
    }
}

pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Writes through a sibling temp file, flushes it and renames over the
/// target so readers see either the old or the new bytes.
pub fn write_atomic_text_file(path: &Path, content: &str, mode: Option<u32>) -> Result<()> {
    use std::io::Write;

    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "devx".to_string()),
        pid,
        ts
    ));

    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// True when `path` equals `root` or sits below it, after canonicalising
/// both where possible.
pub fn path_is_within(path: &Path, root: &Path) -> bool {
    let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    path.starts_with(root)
}

/// Lexically normalises a path that must stay below some root. Absolute
/// paths and paths whose `..` components climb above the root are rejected.
pub fn normalize_relative_path(raw: &str) -> std::result::Result<PathBuf, String> {
    use std::path::Component;

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("path is empty".to_string());
    }
    let path = Path::new(trimmed);
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(format!("'{trimmed}' escapes the project root"));
                }
                out.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("'{trimmed}' must be relative to the project root"));
            }
        }
    }
    if depth == 0 {
        return Err(format!("'{trimmed}' refers to the project root itself"));
    }
    Ok(out)
}

pub fn display_path_with_home(path: &Path, home: Option<&Path>) -> String {
    if let Some(home) = home {
        if path == home {
            return "~".to_string();
        }
        if let Ok(stripped) = path.strip_prefix(home) {
            return format!("~/{}", stripped.display());
        }
    }
    path.display().to_string()
}
