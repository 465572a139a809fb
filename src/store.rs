//! Durable session metadata (`sessions.json`).
//!
//! Every mutation is load, apply, save: the file is the only shared state
//! and each save replaces it atomically. Fields this version does not know
//! about are carried through untouched.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Clock;
use crate::error::{DevxError, Result};
use crate::paths::{write_atomic_text_file, StateFile, StorageLocator};

pub const STORE_VERSION: u32 = 1;

fn is_zero(value: &u32) -> bool {
    *value == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn default_version() -> u32 {
    STORE_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_alias: Option<String>,
    pub project_path: PathBuf,
    pub branch: String,
    pub path: PathBuf,
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    /// service -> hostname
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub editor_pid: u32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub attention_flag: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub attention_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attention_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attached: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SessionRecord {
    pub fn new(
        name: &str,
        project_alias: Option<String>,
        project_path: PathBuf,
        path: PathBuf,
        ports: BTreeMap<String, u16>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.to_string(),
            project_alias,
            project_path,
            branch: name.to_string(),
            path,
            ports,
            routes: BTreeMap::new(),
            editor_pid: 0,
            attention_flag: false,
            attention_reason: String::new(),
            attention_time: None,
            last_attached: None,
            created_at: now,
            updated_at: now,
            extra: BTreeMap::new(),
        }
    }

    pub fn set_attention(&mut self, reason: &str, at: DateTime<Utc>) {
        self.attention_flag = true;
        self.attention_reason = reason.to_string();
        self.attention_time = Some(at);
    }

    pub fn clear_attention(&mut self) {
        self.attention_flag = false;
        self.attention_reason.clear();
        self.attention_time = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionRecord>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for SessionDocument {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            sessions: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

pub fn session_not_found(name: &str) -> DevxError {
    DevxError::NotFound(format!("session '{name}' not found"))
}

pub struct SessionStore<'a> {
    path: PathBuf,
    clock: &'a dyn Clock,
}

impl<'a> SessionStore<'a> {
    pub fn open(locator: &StorageLocator, clock: &'a dyn Clock) -> Self {
        Self::at(locator.resolve(StateFile::Sessions), clock)
    }

    pub fn at(path: PathBuf, clock: &'a dyn Clock) -> Self {
        Self { path, clock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<SessionDocument> {
        if !self.path.exists() {
            return Ok(SessionDocument::default());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(SessionDocument::default());
        }
        let doc: SessionDocument =
            serde_json::from_str(&content).map_err(|err| DevxError::StoreCorruption {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        if doc.version > STORE_VERSION {
            return Err(DevxError::StoreCorruption {
                path: self.path.clone(),
                message: format!(
                    "store version {} is newer than this devx understands ({STORE_VERSION})",
                    doc.version
                ),
            });
        }
        Ok(doc)
    }

    pub fn save(&self, doc: &SessionDocument) -> Result<()> {
        let body = serde_json::to_string_pretty(doc)?;
        write_atomic_text_file(&self.path, &format!("{body}\n"), Some(0o600))?;
        tracing::debug!(path = %self.path.display(), sessions = doc.sessions.len(), "saved session store");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.load()?.sessions.into_values().collect())
    }

    pub fn find(&self, name: &str) -> Result<Option<SessionRecord>> {
        Ok(self.load()?.sessions.remove(name))
    }

    pub fn get(&self, name: &str) -> Result<SessionRecord> {
        self.find(name)?.ok_or_else(|| session_not_found(name))
    }

    pub fn add(&self, record: SessionRecord) -> Result<()> {
        let mut doc = self.load()?;
        if doc.sessions.contains_key(&record.name) {
            return Err(DevxError::Validation(format!(
                "session '{}' already exists",
                record.name
            )));
        }
        doc.sessions.insert(record.name.clone(), record);
        self.save(&doc)
    }

    pub fn remove(&self, name: &str) -> Result<SessionRecord> {
        let mut doc = self.load()?;
        let record = doc
            .sessions
            .remove(name)
            .ok_or_else(|| session_not_found(name))?;
        self.save(&doc)?;
        Ok(record)
    }

    /// Applies `mutate` and advances `updated_at`.
    pub fn update<F>(&self, name: &str, mutate: F) -> Result<SessionRecord>
    where
        F: FnOnce(&mut SessionRecord, DateTime<Utc>),
    {
        let mut doc = self.load()?;
        let now = self.clock.now();
        let record = doc
            .sessions
            .get_mut(name)
            .ok_or_else(|| session_not_found(name))?;
        mutate(record, now);
        record.updated_at = now.max(record.created_at).max(record.updated_at);
        let updated = record.clone();
        self.save(&doc)?;
        Ok(updated)
    }

    /// Marks an attach: stamps `last_attached` and clears attention.
    pub fn record_attach(&self, name: &str) -> Result<SessionRecord> {
        self.update(name, |record, now| {
            record.last_attached = Some(now);
            record.clear_attention();
        })
    }

    pub fn set_attention(&self, name: &str, reason: &str) -> Result<SessionRecord> {
        self.update(name, |record, now| record.set_attention(reason, now))
    }

    pub fn clear_attention(&self, name: &str) -> Result<SessionRecord> {
        self.update(name, |record, _| record.clear_attention())
    }
}
