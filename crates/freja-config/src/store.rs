// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::Value;
use tracing::debug;

/// One opaque JSON config file.
///
/// The UI owns the shape of these files; the core reads and rewrites them
/// whole. A missing file reads as an empty object. Writes go through a
/// temp file + rename so a crash mid-write never leaves a torn file.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Conventional store under `config_dir` with a `.json` suffix.
    pub fn named(config_dir: &Path, name: &str) -> Self {
        Self::new(config_dir.join(format!("{name}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current value. Missing file → `{}`.
    pub fn read(&self) -> anyhow::Result<Value> {
        if !self.path.is_file() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        if text.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }

    /// Replace the whole value atomically.
    pub fn write(&self, value: &Value) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(value)?;
        std::fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        debug!(path = %self.path.display(), "config store written");
        Ok(())
    }

    /// Read-modify-write. `f` receives the current value and mutates it.
    pub fn update(&self, f: impl FnOnce(&mut Value)) -> anyhow::Result<Value> {
        let mut value = self.read()?;
        f(&mut value);
        self.write(&value)?;
        Ok(value)
    }

    /// Shallow-merge `patch` object keys into the stored object.
    pub fn merge(&self, patch: &Value) -> anyhow::Result<Value> {
        self.update(|current| {
            if let (Value::Object(dst), Value::Object(src)) = (current, patch) {
                for (k, v) in src {
                    dst.insert(k.clone(), v.clone());
                }
            }
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_in(dir: &tempfile::TempDir) -> JsonStore {
        JsonStore::named(dir.path(), "mcp")
    }

    #[test]
    fn missing_file_reads_as_empty_object() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        assert_eq!(store.read().unwrap(), json!({}));
    }

    #[test]
    fn write_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        let value = json!({"servers": {"fs": {"command": "npx"}}});
        store.write(&value).unwrap();
        assert_eq!(store.read().unwrap(), value);
    }

    #[test]
    fn write_creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonStore::new(tmp.path().join("nested/deeper/model.json"));
        store.write(&json!({"a": 1})).unwrap();
        assert_eq!(store.read().unwrap(), json!({"a": 1}));
    }

    #[test]
    fn update_applies_mutation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        store.write(&json!({"count": 1})).unwrap();
        let after = store
            .update(|v| {
                v["count"] = json!(2);
            })
            .unwrap();
        assert_eq!(after["count"], 2);
        assert_eq!(store.read().unwrap()["count"], 2);
    }

    #[test]
    fn merge_overwrites_and_preserves() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        store.write(&json!({"a": 1, "b": 2})).unwrap();
        let after = store.merge(&json!({"b": 9, "c": 3})).unwrap();
        assert_eq!(after, json!({"a": 1, "b": 9, "c": 3}));
    }

    #[test]
    fn empty_file_reads_as_empty_object() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        std::fs::write(store.path(), "").unwrap();
        assert_eq!(store.read().unwrap(), json!({}));
    }

    #[test]
    fn no_tmp_file_left_behind_after_write() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        store.write(&json!({"x": true})).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
