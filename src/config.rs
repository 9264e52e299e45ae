//! Durable key-value configuration store over a JSON file.
//!
//! Keys use dotted-path addressing (`"CalibrationData.Theta"`,
//! `"Models.LongDetails.ConfidenceThreshold"`). The store is shared between
//! the orchestration loop and command callers, so all access goes through an
//! internal mutex; `save()` rewrites the whole file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub struct ConfigStore {
    path: PathBuf,
    root: Mutex<Value>,
}

impl ConfigStore {
    /// Open a configuration file, starting from an empty document when the
    /// file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let root = if path.is_file() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            warn!(path = %path.display(), "config file not found, starting empty");
            Value::Object(Map::new())
        };
        Ok(Self {
            path,
            root: Mutex::new(root),
        })
    }

    /// Raw value lookup by dotted path.
    pub fn get(&self, key: &str) -> Option<Value> {
        let root = self.root.lock();
        let mut node = &*root;
        for part in key.split('.') {
            node = node.as_object()?.get(part)?;
        }
        Some(node.clone())
    }

    /// Typed lookup falling back to `default` when the key is absent or has
    /// the wrong shape.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Some(value) => serde_json::from_value(value).unwrap_or(default),
            None => default,
        }
    }

    /// Typed lookup of a whole section; an error when the section is missing
    /// or does not deserialize.
    pub fn section<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .get(key)
            .with_context(|| format!("config section `{key}` is missing"))?;
        serde_json::from_value(value).with_context(|| format!("config section `{key}` is invalid"))
    }

    /// Set a value by dotted path, creating intermediate objects as needed.
    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value).context("serializing config value")?;
        let mut root = self.root.lock();
        let mut node = &mut *root;
        let mut parts = key.split('.').peekable();
        while let Some(part) = parts.next() {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let map = node.as_object_mut().expect("just ensured object");
            if parts.peek().is_none() {
                map.insert(part.to_string(), value);
                debug!(key, "config value set");
                return Ok(());
            }
            node = map.entry(part.to_string()).or_insert(Value::Object(Map::new()));
        }
        Ok(())
    }

    /// Remove a key if present.
    pub fn remove(&self, key: &str) {
        let mut root = self.root.lock();
        let mut node = &mut *root;
        let mut parts = key.split('.').peekable();
        while let Some(part) = parts.next() {
            let Some(map) = node.as_object_mut() else {
                return;
            };
            if parts.peek().is_none() {
                map.remove(part);
                return;
            }
            match map.get_mut(part) {
                Some(next) => node = next,
                None => return,
            }
        }
    }

    /// Persist the current document to disk.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating config directory {}", parent.display()))?;
            }
        }
        let text = {
            let root = self.root.lock();
            serde_json::to_string_pretty(&*root).context("serializing config document")?
        };
        std::fs::write(&self.path, text)
            .with_context(|| format!("writing config file {}", self.path.display()))?;
        debug!(path = %self.path.display(), "config saved");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
