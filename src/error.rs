use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DevxError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    WorktreeConflict(String),
    #[error("{0}")]
    BranchInUse(String),
    #[error("port exhaustion: {0}")]
    PortExhaustion(String),
    #[error("corrupt state file {}: {message}", path.display())]
    StoreCorruption { path: PathBuf, message: String },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    ExternalUnavailable(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("process error: {message}")]
    Process {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}

impl DevxError {
    /// Stable machine-readable kind, emitted in `--json` error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            DevxError::Validation(_) => "validation",
            DevxError::WorktreeConflict(_) => "worktree_conflict",
            DevxError::BranchInUse(_) => "branch_in_use",
            DevxError::PortExhaustion(_) => "port_exhaustion",
            DevxError::StoreCorruption { .. } => "store_corruption",
            DevxError::NotFound(_) => "not_found",
            DevxError::ExternalUnavailable(_) => "external_unavailable",
            DevxError::Config(_) => "config",
            DevxError::Process { .. } => "subprocess_failure",
            DevxError::Io(_) => "io",
            DevxError::Prompt(_) => "prompt",
            DevxError::Yaml(_) => "yaml",
            DevxError::Json(_) => "json",
            DevxError::Http(_) => "http",
            DevxError::Template(_) => "template",
        }
    }

    pub fn process_details(&self) -> Option<&ProcessErrorDetails> {
        match self {
            DevxError::Process { details, .. } => Some(details),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DevxError>;
