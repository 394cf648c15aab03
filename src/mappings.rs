use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::accounts::AccountId;
use crate::pattern::{compile, CompiledPattern};

/// A user-authored rule binding a domain pattern to one account.
///
/// `account_name` is a display cache; the management layer keeps it in step with the account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub id: String,
    pub pattern: String,
    pub account_id: AccountId,
    pub account_name: String,
}

impl Mapping {
    pub fn new(pattern: &str, account_id: AccountId, account_name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pattern: pattern.to_string(),
            account_id,
            account_name: account_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MappingStoreData {
    version: u32,
    #[serde(default)]
    mappings: Vec<Mapping>,
}

impl Default for MappingStoreData {
    fn default() -> Self {
        Self {
            version: 1,
            mappings: Vec::new(),
        }
    }
}

/// The live mapping set plus a lazily filled cache of compiled matchers keyed by pattern text.
///
/// Order is insertion order and is what `match_origin` reports; nothing here ranks patterns by
/// specificity.
#[derive(Debug, Clone, Default)]
pub struct MappingIndex {
    path: Option<PathBuf>,
    data: MappingStoreData,
    compiled: HashMap<String, Arc<CompiledPattern>>,
}

impl MappingIndex {
    pub fn open_under(root_dir: &Path) -> Result<Self, String> {
        Self::load(&root_dir.join("mappings.json"))
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let data = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
            serde_json::from_str::<MappingStoreData>(&raw).map_err(|e| e.to_string())?
        } else {
            MappingStoreData::default()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            data,
            compiled: HashMap::new(),
        })
    }

    /// Index over a list held elsewhere (the agent's cached copy). `save` is a no-op.
    pub fn in_memory(mappings: Vec<Mapping>) -> Self {
        Self {
            path: None,
            data: MappingStoreData {
                version: 1,
                mappings,
            },
            compiled: HashMap::new(),
        }
    }

    pub fn save(&self) -> Result<(), String> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            #[cfg(unix)]
            {
                crate::paths::set_mode(parent, 0o700)?;
            }
        }
        let raw = serde_json::to_string_pretty(&self.data).map_err(|e| e.to_string())?;
        std::fs::write(path, raw).map_err(|e| e.to_string())?;
        #[cfg(unix)]
        {
            crate::paths::set_mode(path, 0o600)?;
        }
        Ok(())
    }

    pub fn load_all(&self) -> Vec<Mapping> {
        self.data.mappings.clone()
    }

    pub fn len(&self) -> usize {
        self.data.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.mappings.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Mapping> {
        self.data.mappings.iter().find(|m| m.id == id)
    }

    /// Every mapping whose pattern matches `origin`, in insertion order.
    ///
    /// A pattern that fails to compile is logged and skipped; it never hides other matches.
    pub fn match_origin(&mut self, origin: &str) -> Vec<Mapping> {
        let mut out = Vec::new();
        for idx in 0..self.data.mappings.len() {
            let pattern = self.data.mappings[idx].pattern.clone();
            let Some(matcher) = self.matcher_for(&pattern) else {
                continue;
            };
            if matcher.matches(origin) {
                out.push(self.data.mappings[idx].clone());
            }
        }
        debug!(origin, matches = out.len(), "matched origin against mappings");
        out
    }

    fn matcher_for(&mut self, pattern: &str) -> Option<Arc<CompiledPattern>> {
        if let Some(hit) = self.compiled.get(pattern) {
            return Some(Arc::clone(hit));
        }
        match compile(pattern) {
            Ok(compiled) => {
                let compiled = Arc::new(compiled);
                self.compiled
                    .insert(pattern.to_string(), Arc::clone(&compiled));
                Some(compiled)
            }
            Err(err) => {
                warn!(pattern, error = %err, "skipping mapping with invalid pattern");
                None
            }
        }
    }

    /// Replace the mapping with the same id in place, or append it.
    pub fn upsert(&mut self, mapping: Mapping) {
        let replaced = match self
            .data
            .mappings
            .iter()
            .position(|m| m.id == mapping.id)
        {
            Some(idx) => Some(std::mem::replace(&mut self.data.mappings[idx], mapping)),
            None => {
                self.data.mappings.push(mapping);
                None
            }
        };
        if let Some(old) = replaced {
            self.release_pattern(&old.pattern);
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let Some(idx) = self.data.mappings.iter().position(|m| m.id == id) else {
            return false;
        };
        let removed = self.data.mappings.remove(idx);
        self.release_pattern(&removed.pattern);
        true
    }

    pub fn remove_by_account(&mut self, account_id: &AccountId) -> usize {
        let (gone, kept): (Vec<Mapping>, Vec<Mapping>) = std::mem::take(&mut self.data.mappings)
            .into_iter()
            .partition(|m| &m.account_id == account_id);
        self.data.mappings = kept;
        for m in &gone {
            self.release_pattern(&m.pattern);
        }
        gone.len()
    }

    /// Keep the denormalized display name in step after an account rename.
    pub fn refresh_account_name(&mut self, account_id: &AccountId, name: &str) -> usize {
        let mut touched = 0;
        for m in self
            .data
            .mappings
            .iter_mut()
            .filter(|m| &m.account_id == account_id)
        {
            if m.account_name != name {
                m.account_name = name.to_string();
                touched += 1;
            }
        }
        touched
    }

    /// True when some mapping already uses this pattern, ignoring case.
    pub fn has_pattern(&self, pattern: &str) -> bool {
        let wanted = pattern.trim().to_lowercase();
        self.data
            .mappings
            .iter()
            .any(|m| m.pattern.trim().to_lowercase() == wanted)
    }

    /// Pattern texts that currently have a compiled matcher cached.
    pub fn cached_patterns(&self) -> Vec<String> {
        let mut out: Vec<String> = self.compiled.keys().cloned().collect();
        out.sort();
        out
    }

    // Drop a cached matcher once no remaining mapping uses its text.
    fn release_pattern(&mut self, pattern: &str) {
        if self.data.mappings.iter().any(|m| m.pattern == pattern) {
            return;
        }
        self.compiled.remove(pattern);
    }
}
