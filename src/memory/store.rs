//! Run memory store - JSON-file backed key/value records consumed by
//! the `memory.*` intents

use crate::core::MemoryLimits;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

const MEMORY_DIR: &str = ".intentflow";
const MEMORY_FILE: &str = "run-memory.json";

/// What a memory record captured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    FullRun,
    RunSegment,
    Variables,
    #[default]
    Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: String,
    pub session_id: String,
    pub key: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub scope: MemoryScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Unix epoch milliseconds
    pub created_at: i64,
    pub data: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryDb {
    version: u32,
    records: Vec<MemoryRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct SaveMemoryInput {
    pub session_id: String,
    pub key: Option<String>,
    pub tags: Vec<String>,
    pub scope: MemoryScope,
    pub run_id: Option<String>,
    pub step_id: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, Default)]
pub struct QueryMemoryInput {
    pub session_id: Option<String>,
    pub key: Option<String>,
    pub tag: Option<String>,
    pub run_id: Option<String>,
    pub limit: Option<usize>,
    /// Defaults to newest-first
    pub newest_first: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ClearMemoryInput {
    pub session_id: Option<String>,
    pub key: Option<String>,
    pub tag: Option<String>,
    pub run_id: Option<String>,
    pub keep_last: usize,
}

/// File-backed memory store. One instance per engine, serialized by a
/// mutex so concurrent intents cannot interleave read-modify-write.
pub struct RunMemoryStore {
    path: PathBuf,
    limits: MemoryLimits,
    lock: Mutex<()>,
}

impl RunMemoryStore {
    pub fn new(root: impl AsRef<Path>, limits: MemoryLimits) -> Self {
        Self {
            path: root.as_ref().join(MEMORY_DIR).join(MEMORY_FILE),
            limits,
            lock: Mutex::new(()),
        }
    }

    pub fn save(&self, input: SaveMemoryInput) -> Result<String> {
        let _guard = self.lock.lock().expect("memory store poisoned");
        let mut db = self.read_db();
        let id = format!("mem_{}", Uuid::new_v4().simple());
        db.records.push(MemoryRecord {
            id: id.clone(),
            session_id: non_empty_or(&input.session_id, "default"),
            key: non_empty_or(input.key.as_deref().unwrap_or(""), "entry"),
            tags: input
                .tags
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            scope: input.scope,
            run_id: input.run_id.filter(|v| !v.trim().is_empty()),
            step_id: input.step_id.filter(|v| !v.trim().is_empty()),
            created_at: Utc::now().timestamp_millis(),
            data: self.trim_data(input.data),
        });
        self.write_db(db)?;
        Ok(id)
    }

    pub fn query(&self, input: &QueryMemoryInput) -> Vec<MemoryRecord> {
        let _guard = self.lock.lock().expect("memory store poisoned");
        let db = self.read_db();
        let mut records: Vec<MemoryRecord> = db
            .records
            .into_iter()
            .filter(|r| matches_filters(
                r,
                input.session_id.as_deref(),
                input.key.as_deref(),
                input.tag.as_deref(),
                input.run_id.as_deref(),
            ))
            .collect();

        let newest_first = input.newest_first.unwrap_or(true);
        records.sort_by_key(|r| r.created_at);
        if newest_first {
            records.reverse();
        }
        records.truncate(input.limit.unwrap_or(20).max(1));
        records
    }

    pub fn clear(&self, input: &ClearMemoryInput) -> Result<(usize, usize)> {
        let _guard = self.lock.lock().expect("memory store poisoned");
        let db = self.read_db();

        let mut matching: Vec<&MemoryRecord> = db
            .records
            .iter()
            .filter(|r| matches_filters(
                r,
                input.session_id.as_deref(),
                input.key.as_deref(),
                input.tag.as_deref(),
                input.run_id.as_deref(),
            ))
            .collect();
        matching.sort_by_key(|r| r.created_at);

        let keep: std::collections::HashSet<String> = if input.keep_last > 0 {
            matching
                .iter()
                .rev()
                .take(input.keep_last)
                .map(|r| r.id.clone())
                .collect()
        } else {
            Default::default()
        };

        let before = db.records.len();
        let next: Vec<MemoryRecord> = db
            .records
            .into_iter()
            .filter(|r| {
                keep.contains(&r.id)
                    || !matches_filters(
                        r,
                        input.session_id.as_deref(),
                        input.key.as_deref(),
                        input.tag.as_deref(),
                        input.run_id.as_deref(),
                    )
            })
            .collect();
        let removed = before - next.len();
        let remaining = next.len();
        self.write_db(MemoryDb {
            version: 2,
            records: next,
        })?;
        Ok((removed, remaining))
    }

    fn read_db(&self) -> MemoryDb {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return MemoryDb {
                version: 2,
                records: Vec::new(),
            };
        };
        match serde_json::from_str::<MemoryDb>(&content) {
            Ok(db) => MemoryDb {
                version: 2,
                records: self.compact(db.records),
            },
            Err(_) => MemoryDb {
                version: 2,
                records: Vec::new(),
            },
        }
    }

    fn write_db(&self, db: MemoryDb) -> Result<()> {
        let db = MemoryDb {
            version: 2,
            records: self.compact(db.records),
        };
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create memory dir: {}", dir.display()))?;
        }
        let content = serde_json::to_string_pretty(&db)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write memory file: {}", self.path.display()))?;
        Ok(())
    }

    /// Drop expired records and cap each session at the configured
    /// maximum, keeping the newest.
    fn compact(&self, records: Vec<MemoryRecord>) -> Vec<MemoryRecord> {
        let cutoff =
            Utc::now().timestamp_millis() - i64::from(self.limits.ttl_days) * 24 * 60 * 60 * 1000;
        let mut sorted: Vec<MemoryRecord> = records
            .into_iter()
            .filter(|r| r.created_at >= cutoff)
            .collect();
        sorted.sort_by_key(|r| r.created_at);

        let mut per_session: HashMap<String, Vec<MemoryRecord>> = HashMap::new();
        for record in sorted {
            let bucket = per_session.entry(record.session_id.clone()).or_default();
            bucket.push(record);
            if bucket.len() > self.limits.max_records_per_session {
                bucket.remove(0);
            }
        }

        let mut compacted: Vec<MemoryRecord> = per_session.into_values().flatten().collect();
        compacted.sort_by_key(|r| r.created_at);
        compacted
    }

    fn trim_data(&self, data: Value) -> Value {
        let raw = data.to_string();
        if raw.len() <= self.limits.max_payload_chars {
            return data;
        }
        serde_json::json!({
            "__truncated": true,
            "__originalSize": raw.len(),
            "preview": raw.chars().take(self.limits.max_payload_chars).collect::<String>(),
        })
    }
}

fn matches_filters(
    record: &MemoryRecord,
    session_id: Option<&str>,
    key: Option<&str>,
    tag: Option<&str>,
    run_id: Option<&str>,
) -> bool {
    if let Some(s) = session_id.filter(|s| !s.is_empty()) {
        if record.session_id != s {
            return false;
        }
    }
    if let Some(k) = key.filter(|k| !k.is_empty()) {
        if record.key != k {
            return false;
        }
    }
    if let Some(t) = tag.filter(|t| !t.is_empty()) {
        if !record.tags.iter().any(|rt| rt == t) {
            return false;
        }
    }
    if let Some(r) = run_id.filter(|r| !r.is_empty()) {
        if record.run_id.as_deref() != Some(r) {
            return false;
        }
    }
    true
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}
