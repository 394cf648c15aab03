use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::client::{BridgeClient, BridgeClientError};
use crate::accounts::AccountId;
use crate::arbiter::CandidateAccount;
use crate::mappings::{Mapping, MappingIndex};
use crate::service::Credentials;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    version: u32,
    fetched_at_ms: i64,
    #[serde(default)]
    mappings: Vec<Mapping>,
}

/// Last mapping list the agent fetched, kept on disk so it survives restarts and outages.
/// Holds no secrets.
#[derive(Debug, Clone)]
pub struct MappingCache {
    path: PathBuf,
}

impl MappingCache {
    pub fn discover() -> Self {
        Self::at(crate::paths::agent_dir().join("mappings-cache.json"))
    }

    pub fn under(root: &Path) -> Self {
        Self::at(root.join("agent").join("mappings-cache.json"))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached list, or `None` when absent or unreadable.
    pub fn load(&self) -> Option<Vec<Mapping>> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<CacheFile>(&raw) {
            Ok(file) => Some(file.mappings),
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "ignoring unreadable mapping cache"
                );
                None
            }
        }
    }

    pub fn store(&self, mappings: &[Mapping]) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            #[cfg(unix)]
            {
                crate::paths::set_mode(parent, 0o700)?;
            }
        }
        let file = CacheFile {
            version: 1,
            fetched_at_ms: chrono::Utc::now().timestamp_millis(),
            mappings: mappings.to_vec(),
        };
        let raw = serde_json::to_string_pretty(&file).map_err(|e| e.to_string())?;
        std::fs::write(&self.path, raw).map_err(|e| e.to_string())?;
        #[cfg(unix)]
        {
            crate::paths::set_mode(&self.path, 0o600)?;
        }
        Ok(())
    }

    pub fn clear(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// What the filling agent holds: a bridge client plus the cached mapping list.
pub struct AgentSession {
    client: BridgeClient,
    cache: MappingCache,
    memory: Mutex<Option<Vec<Mapping>>>,
}

impl AgentSession {
    pub fn new(client: BridgeClient, cache: MappingCache) -> Self {
        Self {
            client,
            cache,
            memory: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &BridgeClient {
        &self.client
    }

    fn remember(&self, mappings: &[Mapping]) {
        if let Ok(mut memory) = self.memory.lock() {
            *memory = Some(mappings.to_vec());
        }
        if let Err(err) = self.cache.store(mappings) {
            warn!(error = %err, "failed to persist mapping cache");
        }
    }

    fn cached(&self) -> Option<Vec<Mapping>> {
        if let Some(hit) = self.memory.lock().ok().and_then(|m| m.clone()) {
            return Some(hit);
        }
        let from_disk = self.cache.load()?;
        if let Ok(mut memory) = self.memory.lock() {
            *memory = Some(from_disk.clone());
        }
        Some(from_disk)
    }

    /// Mapping list for local matching.
    ///
    /// Without `force_refresh` a cached list is returned as is, stale or not. A forced refresh
    /// always asks the service and reports its failure.
    pub async fn mappings(&self, force_refresh: bool) -> Result<Vec<Mapping>, BridgeClientError> {
        if !force_refresh {
            if let Some(cached) = self.cached() {
                debug!(count = cached.len(), "serving cached mappings");
                return Ok(cached);
            }
        }
        let fresh = self.client.get_all_mappings().await?;
        self.remember(&fresh);
        Ok(fresh)
    }

    /// Accounts whose mappings match `origin`, matched locally against the cached list.
    pub async fn candidates_for(
        &self,
        origin: &str,
    ) -> Result<Vec<CandidateAccount>, BridgeClientError> {
        let mappings = self.mappings(false).await?;
        let mut index = MappingIndex::in_memory(mappings);
        Ok(index
            .match_origin(origin.trim())
            .iter()
            .map(CandidateAccount::from)
            .collect())
    }

    pub async fn credentials(
        &self,
        account_id: &AccountId,
    ) -> Result<Credentials, BridgeClientError> {
        self.client.get_credentials(account_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;

    fn offline_session(root: &Path) -> AgentSession {
        let client = BridgeClient::new(root.join("no-daemon.sock"), BridgeConfig::default());
        AgentSession::new(client, MappingCache::under(root))
    }

    #[test]
    fn cache_roundtrip_and_unreadable_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MappingCache::under(dir.path());
        assert!(cache.load().is_none());

        let m = Mapping::new("*.contoso.com", AccountId::generate(), "Work");
        cache.store(std::slice::from_ref(&m)).unwrap();
        assert_eq!(cache.load().unwrap(), vec![m]);

        std::fs::write(cache.path(), "{oops").unwrap();
        assert!(cache.load().is_none());
        cache.clear();
        assert!(!cache.path().exists());
    }

    #[tokio::test]
    async fn cached_mappings_serve_local_matching_while_offline() {
        let dir = tempfile::tempdir().unwrap();
        let a = AccountId::generate();
        let b = AccountId::generate();
        MappingCache::under(dir.path())
            .store(&[
                Mapping::new("*.contoso.com", a.clone(), "Personal"),
                Mapping::new("login.contoso.com", b.clone(), "Work"),
            ])
            .unwrap();

        let session = offline_session(dir.path());
        let candidates = session.candidates_for("login.contoso.com").await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].account_id, a);
        assert_eq!(candidates[1].display_name, "Work");

        let err = session.mappings(true).await.unwrap_err();
        assert_eq!(err, BridgeClientError::ConnectionLost);
        assert_eq!(session.mappings(false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn no_cache_and_no_daemon_reports_connection_lost() {
        let dir = tempfile::tempdir().unwrap();
        let session = offline_session(dir.path());
        assert_eq!(
            session.candidates_for("x.example.com").await.unwrap_err(),
            BridgeClientError::ConnectionLost
        );
    }
}
