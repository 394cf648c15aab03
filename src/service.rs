//! The privileged side: mapping index, arbiter, account list and vault behind one handle.
//!
//! Every store has its own lock and none is held while a presence check waits on the user.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::accounts::{Account, AccountId, AccountStore, AuthMethod};
use crate::arbiter::{Arbiter, Arbitration, CandidateAccount};
use crate::error::{ErrorCode, FillError, FillResult};
use crate::mappings::{Mapping, MappingIndex};
use crate::presence::{PresenceCheck, PresenceGate};
use crate::vault::{CredentialVault, Secret, VaultError, VaultPaths, VaultStatus};

impl From<VaultError> for FillError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::NotFound => {
                Self::new(ErrorCode::NotFound, "no credentials stored for this account")
            }
            VaultError::Corrupt(_) => {
                Self::new(ErrorCode::NotFound, "stored credentials are unreadable")
            }
            VaultError::PresenceDenied(msg) => Self::new(ErrorCode::PresenceDenied, msg),
            VaultError::InvalidSecret(msg) => Self::new(ErrorCode::InvalidRequest, msg),
            other => Self::unexpected(other.to_string()),
        }
    }
}

/// What a successful credentials request hands back. Wiped on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub username: String,
    pub password: String,
    #[zeroize(skip)]
    pub auth_method: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_detail: Option<String>,
}

impl From<&Secret> for Credentials {
    fn from(s: &Secret) -> Self {
        Self {
            username: s.username.clone(),
            password: s.password.clone(),
            auth_method: s.auth_method,
            method_detail: s.method_detail.clone(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("auth_method", &self.auth_method)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    NotFound,
    Resolved {
        account_id: AccountId,
        credentials: Credentials,
    },
    AmbiguousNeedsSelection {
        selection_id: String,
        candidates: Vec<CandidateAccount>,
    },
}

/// Outcome as it crosses the bridge: which account, never its secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OutcomeSummary {
    NotFound,
    Resolved {
        #[serde(rename = "accountId")]
        account_id: AccountId,
        #[serde(rename = "displayName")]
        display_name: String,
    },
    NeedsSelection {
        #[serde(rename = "selectionId")]
        selection_id: String,
        candidates: Vec<CandidateAccount>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSummary {
    pub account_id: AccountId,
    pub mappings_removed: usize,
    pub account_removed: bool,
}

fn guard<'a, T>(lock: &'a Mutex<T>, what: &str) -> FillResult<MutexGuard<'a, T>> {
    lock.lock()
        .map_err(|_| FillError::unexpected(format!("{} lock poisoned", what)))
}

pub struct Service {
    root: PathBuf,
    mappings: Mutex<MappingIndex>,
    arbiter: Mutex<Arbiter>,
    accounts: Mutex<AccountStore>,
    vault: Arc<CredentialVault>,
}

impl Service {
    /// Open (and on first use initialize) all state under `root`.
    pub fn open(
        root: &Path,
        presence: Arc<dyn PresenceCheck>,
        selection_ttl: Duration,
    ) -> Result<Self, String> {
        let gate = Arc::new(PresenceGate::new(presence));
        let vault = CredentialVault::new(VaultPaths::under(root), gate);
        vault.load().map_err(|e| e.to_string())?;
        Ok(Self {
            root: root.to_path_buf(),
            mappings: Mutex::new(MappingIndex::open_under(root)?),
            arbiter: Mutex::new(Arbiter::new(selection_ttl)),
            accounts: Mutex::new(AccountStore::open_under(root)?),
            vault: Arc::new(vault),
        })
    }

    /// State under the configured root, presence from `AUTOFILL_PRESENCE_COMMAND`.
    pub fn discover(selection_ttl: Duration) -> Result<Self, String> {
        Self::open(
            &crate::paths::autofill_root_dir(),
            crate::presence::check_from_env(),
            selection_ttl,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    pub fn vault_status(&self) -> VaultStatus {
        self.vault.status()
    }

    // Request (2): the full mapping list, insertion order.
    pub fn get_all_mappings(&self) -> FillResult<Vec<Mapping>> {
        Ok(guard(&self.mappings, "mapping index")?.load_all())
    }

    /// Request (1): credentials for exactly one account, behind a presence check.
    pub fn get_credentials(&self, account_id: &AccountId) -> FillResult<Credentials> {
        if !self.vault.exists(account_id) {
            debug!(account_id = %account_id, "no readable vault record; skipping presence check");
            return Err(FillError::new(
                ErrorCode::NotFound,
                "no credentials stored for this account",
            ));
        }
        let name = self.display_name(account_id);
        let token = self
            .vault
            .gate()
            .request(&format!("Accessing credentials for {}", name))?;
        let secret = self.vault.fetch(account_id, token)?;
        info!(account_id = %account_id, "credentials released");
        Ok(Credentials::from(&secret))
    }

    fn arbitrate(&self, origin: &str) -> FillResult<(Arbitration, Vec<Mapping>)> {
        let origin = origin.trim();
        if origin.is_empty() {
            return Err(FillError::new(ErrorCode::InvalidRequest, "origin required"));
        }
        let matches = guard(&self.mappings, "mapping index")?.match_origin(origin);
        let arbitration = guard(&self.arbiter, "arbiter")?.arbitrate(origin, matches.clone());
        Ok((arbitration, matches))
    }

    pub fn resolve(&self, origin: &str) -> FillResult<ResolutionOutcome> {
        match self.arbitrate(origin)?.0 {
            Arbitration::NotFound => Ok(ResolutionOutcome::NotFound),
            Arbitration::Resolved(account_id) => {
                let credentials = self.get_credentials(&account_id)?;
                Ok(ResolutionOutcome::Resolved {
                    account_id,
                    credentials,
                })
            }
            Arbitration::NeedsSelection {
                selection_id,
                candidates,
            } => Ok(ResolutionOutcome::AmbiguousNeedsSelection {
                selection_id,
                candidates,
            }),
        }
    }

    pub fn resolve_summary(&self, origin: &str) -> FillResult<OutcomeSummary> {
        let (arbitration, matches) = self.arbitrate(origin)?;
        Ok(match arbitration {
            Arbitration::NotFound => OutcomeSummary::NotFound,
            Arbitration::Resolved(account_id) => OutcomeSummary::Resolved {
                display_name: matches
                    .first()
                    .map(|m| m.account_name.clone())
                    .unwrap_or_else(|| self.display_name(&account_id)),
                account_id,
            },
            Arbitration::NeedsSelection {
                selection_id,
                candidates,
            } => OutcomeSummary::NeedsSelection {
                selection_id,
                candidates,
            },
        })
    }

    /// Pick an account for a pending selection and fetch its credentials.
    ///
    /// The selection is consumed only once the credentials are in hand, so a denied or
    /// cancelled presence check can be retried with the same selection id.
    pub fn select(
        &self,
        selection_id: &str,
        account_id: &AccountId,
    ) -> FillResult<ResolutionOutcome> {
        let checked = guard(&self.arbiter, "arbiter")?.check(selection_id, account_id)?;
        let credentials = self.get_credentials(&checked)?;
        let chosen = guard(&self.arbiter, "arbiter")?.select(selection_id, &checked)?;
        Ok(ResolutionOutcome::Resolved {
            account_id: chosen,
            credentials,
        })
    }

    pub fn select_summary(
        &self,
        selection_id: &str,
        account_id: &AccountId,
    ) -> FillResult<OutcomeSummary> {
        let chosen = guard(&self.arbiter, "arbiter")?.select(selection_id, account_id)?;
        Ok(OutcomeSummary::Resolved {
            display_name: self.display_name(&chosen),
            account_id: chosen,
        })
    }

    pub fn purge_expired_selections(&self) -> usize {
        self.arbiter
            .lock()
            .map(|mut a| a.purge_expired())
            .unwrap_or(0)
    }

    fn display_name(&self, account_id: &AccountId) -> String {
        if let Some(account) = self
            .accounts
            .lock()
            .ok()
            .and_then(|a| a.get(account_id).cloned())
        {
            return account.name;
        }
        self.mappings
            .lock()
            .ok()
            .and_then(|m| {
                m.load_all()
                    .into_iter()
                    .find(|m| &m.account_id == account_id)
                    .map(|m| m.account_name)
            })
            .unwrap_or_else(|| account_id.to_string())
    }

    // Management surface.

    pub fn list_accounts(&self) -> FillResult<Vec<Account>> {
        Ok(guard(&self.accounts, "account store")?.list().to_vec())
    }

    pub fn add_account(
        &self,
        name: &str,
        username: &str,
        auth_method: AuthMethod,
    ) -> FillResult<Account> {
        let mut accounts = guard(&self.accounts, "account store")?;
        let account = accounts
            .add(name, username, auth_method)
            .map_err(|e| FillError::new(ErrorCode::InvalidRequest, e))?;
        accounts.save().map_err(FillError::unexpected)?;
        info!(account_id = %account.id, "account added");
        Ok(account)
    }

    pub fn rename_account(&self, account_id: &AccountId, name: &str) -> FillResult<Account> {
        let account = {
            let mut accounts = guard(&self.accounts, "account store")?;
            if accounts.get(account_id).is_none() {
                return Err(FillError::new(ErrorCode::NotFound, "account not found"));
            }
            let account = accounts
                .update(account_id, Some(name), None)
                .map_err(|e| FillError::new(ErrorCode::InvalidRequest, e))?;
            accounts.save().map_err(FillError::unexpected)?;
            account
        };
        let mut mappings = guard(&self.mappings, "mapping index")?;
        if mappings.refresh_account_name(account_id, &account.name) > 0 {
            mappings.save().map_err(FillError::unexpected)?;
        }
        Ok(account)
    }

    /// Remove the account's mappings, then its secret, then the account itself.
    ///
    /// Each step commits on its own; a failure part way leaves the earlier steps applied.
    pub fn delete_account(&self, account_id: &AccountId) -> FillResult<DeleteSummary> {
        let mappings_removed = {
            let mut mappings = guard(&self.mappings, "mapping index")?;
            let removed = mappings.remove_by_account(account_id);
            mappings.save().map_err(FillError::unexpected)?;
            removed
        };
        self.vault.delete(account_id)?;
        let account_removed = {
            let mut accounts = guard(&self.accounts, "account store")?;
            let removed = accounts.remove(account_id);
            accounts.save().map_err(FillError::unexpected)?;
            removed
        };
        info!(account_id = %account_id, mappings_removed, "account deleted");
        Ok(DeleteSummary {
            account_id: account_id.clone(),
            mappings_removed,
            account_removed,
        })
    }

    pub fn save_secret(
        &self,
        account_id: &AccountId,
        password: &str,
        method_detail: Option<String>,
    ) -> FillResult<()> {
        let account = guard(&self.accounts, "account store")?
            .get(account_id)
            .cloned()
            .ok_or_else(|| FillError::new(ErrorCode::NotFound, "account not found"))?;
        let secret = Secret::new(
            account.username,
            password,
            account.auth_method,
            method_detail,
        );
        self.vault.save(account_id, &secret)?;
        Ok(())
    }

    pub fn secret_exists(&self, account_id: &AccountId) -> bool {
        self.vault.exists(account_id)
    }

    pub fn delete_secret(&self, account_id: &AccountId) -> FillResult<()> {
        Ok(self.vault.delete(account_id)?)
    }

    /// Add a mapping for an existing account.
    ///
    /// The pattern must compile, and a pattern equal (ignoring case) to an existing one is
    /// refused unless `allow_duplicate` is set.
    pub fn add_mapping(
        &self,
        pattern: &str,
        account_id: &AccountId,
        allow_duplicate: bool,
    ) -> FillResult<Mapping> {
        let pattern = pattern.trim();
        crate::pattern::compile(pattern)?;
        let account = guard(&self.accounts, "account store")?
            .get(account_id)
            .cloned()
            .ok_or_else(|| FillError::new(ErrorCode::NotFound, "account not found"))?;

        let mut mappings = guard(&self.mappings, "mapping index")?;
        if !allow_duplicate && mappings.has_pattern(pattern) {
            return Err(FillError::new(
                ErrorCode::InvalidRequest,
                format!("a mapping for '{}' already exists", pattern),
            ));
        }
        if crate::pattern::is_wildcard_only(pattern) {
            warn!(pattern, "mapping matches every origin");
        }
        let mapping = Mapping::new(pattern, account.id, &account.name);
        mappings.upsert(mapping.clone());
        mappings.save().map_err(FillError::unexpected)?;
        Ok(mapping)
    }

    pub fn remove_mapping(&self, mapping_id: &str) -> FillResult<bool> {
        let mut mappings = guard(&self.mappings, "mapping index")?;
        let removed = mappings.remove(mapping_id);
        if removed {
            mappings.save().map_err(FillError::unexpected)?;
        }
        Ok(removed)
    }

    pub fn match_origin(&self, origin: &str) -> FillResult<Vec<Mapping>> {
        Ok(guard(&self.mappings, "mapping index")?.match_origin(origin.trim()))
    }
}
