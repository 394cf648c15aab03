use std::path::{Path, PathBuf};

use chrono::Datelike;
use serde::{Deserialize, Serialize};

const AUDIT_MAX_FILES: usize = 10;
const AUDIT_MAX_SIZE_BYTES: u64 = 5 * 1024 * 1024;

/// One line of `audit/YYYY-MM.jsonl`. Never carries secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultAuditEvent {
    pub ts_ms: i64,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl VaultAuditEvent {
    pub fn now(kind: &str) -> Self {
        Self {
            ts_ms: chrono::Utc::now().timestamp_millis(),
            kind: kind.to_string(),
            account_id: None,
            actor: None,
            note: None,
        }
    }

    pub fn account(mut self, account_id: &str) -> Self {
        self.account_id = Some(account_id.to_string());
        self
    }

    pub fn actor(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

pub fn append_audit_event(audit_dir: &Path, event: &VaultAuditEvent) -> Result<(), String> {
    use std::io::Write;

    let ts = chrono::Utc::now();
    let path = audit_dir.join(format!("{}-{:02}.jsonl", ts.year(), ts.month()));
    std::fs::create_dir_all(audit_dir).map_err(|e| e.to_string())?;
    let line = serde_json::to_string(event).map_err(|e| e.to_string())? + "\n";
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| e.to_string())?;
    f.write_all(line.as_bytes()).map_err(|e| e.to_string())?;
    #[cfg(unix)]
    {
        let _ = crate::paths::set_mode(&path, 0o600);
    }
    rotate_by_size(&path, AUDIT_MAX_FILES, AUDIT_MAX_SIZE_BYTES);
    Ok(())
}

/// Shift `path` to `path.1` (and older files up by one) once it reaches `max_size_bytes`.
/// The oldest file beyond `max_files` is dropped. Best effort.
fn rotate_by_size(path: &Path, max_files: usize, max_size_bytes: u64) {
    let big_enough = std::fs::metadata(path)
        .map(|m| m.len() >= max_size_bytes)
        .unwrap_or(false);
    if max_files == 0 || !big_enough {
        return;
    }
    let rotated = |idx: usize| PathBuf::from(format!("{}.{}", path.to_string_lossy(), idx));
    let _ = std::fs::remove_file(rotated(max_files));
    for idx in (1..max_files).rev() {
        let from = rotated(idx);
        if from.exists() {
            let _ = std::fs::rename(&from, rotated(idx + 1));
        }
    }
    let _ = std::fs::rename(path, rotated(1));
}

pub fn read_audit_events(audit_dir: &Path, limit: usize) -> Result<Vec<VaultAuditEvent>, String> {
    read_audit_events_before(audit_dir, limit, None)
}

// Sort key for "2026-02.jsonl.3": (month prefix, rotation index). Index 0 is the live file.
fn audit_file_key(path: &Path) -> (String, u32) {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_string();
    match name.split_once(".jsonl") {
        Some((prefix, rest)) => (
            prefix.to_string(),
            rest.strip_prefix('.')
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(0),
        ),
        None => (name, 0),
    }
}

/// Newest first, optionally only events strictly older than `before_ts_ms`.
pub fn read_audit_events_before(
    audit_dir: &Path,
    limit: usize,
    before_ts_ms: Option<i64>,
) -> Result<Vec<VaultAuditEvent>, String> {
    if !audit_dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(audit_dir)
        .map_err(|e| e.to_string())?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort_by(|a, b| {
        let (ap, ai) = audit_file_key(a);
        let (bp, bi) = audit_file_key(b);
        bp.cmp(&ap).then_with(|| ai.cmp(&bi))
    });

    let mut out = Vec::new();
    for path in files {
        let raw = std::fs::read_to_string(&path).unwrap_or_default();
        for line in raw.lines().rev().filter(|l| !l.trim().is_empty()) {
            let Ok(evt) = serde_json::from_str::<VaultAuditEvent>(line) else {
                continue;
            };
            if before_ts_ms.is_some_and(|before| evt.ts_ms >= before) {
                continue;
            }
            out.push(evt);
            if out.len() >= limit {
                return Ok(out);
            }
        }
    }
    Ok(out)
}
