//! Decides what a set of matching mappings means for one fill attempt.
//!
//! Zero matches resolve to nothing, exactly one resolves to its account, and two or more
//! park the candidate set under a fresh selection id until the user picks one.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::accounts::AccountId;
use crate::error::{ErrorCode, FillError};
use crate::mappings::Mapping;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ArbiterError {
    #[error("invalid selection: {0}")]
    InvalidSelection(String),
}

impl From<ArbiterError> for FillError {
    fn from(err: ArbiterError) -> Self {
        match err {
            ArbiterError::InvalidSelection(msg) => Self::new(ErrorCode::InvalidSelection, msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateAccount {
    pub account_id: AccountId,
    pub display_name: String,
}

impl From<&Mapping> for CandidateAccount {
    fn from(m: &Mapping) -> Self {
        Self {
            account_id: m.account_id.clone(),
            display_name: m.account_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arbitration {
    NotFound,
    Resolved(AccountId),
    NeedsSelection {
        selection_id: String,
        candidates: Vec<CandidateAccount>,
    },
}

#[derive(Debug, Clone)]
struct PendingSelection {
    origin: String,
    candidates: Vec<CandidateAccount>,
    created_at: Instant,
}

#[derive(Debug)]
pub struct Arbiter {
    ttl: Duration,
    pending: HashMap<String, PendingSelection>,
}

impl Arbiter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: HashMap::new(),
        }
    }

    pub fn arbitrate(&mut self, origin: &str, matches: Vec<Mapping>) -> Arbitration {
        self.purge_expired();
        match matches.len() {
            0 => {
                info!(origin, "no mapping for origin");
                Arbitration::NotFound
            }
            1 => {
                let account_id = matches[0].account_id.clone();
                info!(origin, account_id = %account_id, "origin resolved to a single account");
                Arbitration::Resolved(account_id)
            }
            n => {
                let candidates: Vec<CandidateAccount> =
                    matches.iter().map(CandidateAccount::from).collect();
                let selection_id = Uuid::new_v4().to_string();
                self.pending.insert(
                    selection_id.clone(),
                    PendingSelection {
                        origin: origin.to_string(),
                        candidates: candidates.clone(),
                        created_at: Instant::now(),
                    },
                );
                info!(origin, candidates = n, "origin needs an account selection");
                Arbitration::NeedsSelection {
                    selection_id,
                    candidates,
                }
            }
        }
    }

    /// Check the user's pick against the candidate set captured for `selection_id`.
    ///
    /// Leaves the selection open either way; `select` is what consumes it.
    pub fn check(
        &mut self,
        selection_id: &str,
        account_id: &AccountId,
    ) -> Result<AccountId, ArbiterError> {
        self.purge_expired();
        let Some(pending) = self.pending.get(selection_id) else {
            return Err(ArbiterError::InvalidSelection(
                "selection expired or unknown".to_string(),
            ));
        };
        if !pending.candidates.iter().any(|c| &c.account_id == account_id) {
            return Err(ArbiterError::InvalidSelection(format!(
                "account '{}' was not offered for this selection",
                account_id
            )));
        }
        Ok(account_id.clone())
    }

    /// Confirm the user's pick. A pick outside the set leaves the selection open; a valid pick
    /// consumes it.
    pub fn select(
        &mut self,
        selection_id: &str,
        account_id: &AccountId,
    ) -> Result<AccountId, ArbiterError> {
        let chosen = self.check(selection_id, account_id)?;
        if let Some(pending) = self.pending.remove(selection_id) {
            info!(origin = %pending.origin, account_id = %chosen, "account selection confirmed");
        }
        Ok(chosen)
    }

    pub fn purge_expired(&mut self) -> usize {
        let ttl = self.ttl;
        let before = self.pending.len();
        self.pending.retain(|_, p| p.created_at.elapsed() < ttl);
        let purged = before - self.pending.len();
        if purged > 0 {
            debug!(purged, "expired pending selections");
        }
        purged
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
