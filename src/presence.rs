//! User-presence checks and the single-use tokens that prove one happened.
//!
//! The platform check itself (biometric prompt, passcode, external helper) sits behind
//! [`PresenceCheck`]. [`PresenceGate`] turns an approved check into a [`PresenceToken`] that the
//! vault redeems exactly once before it decrypts anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::{debug, warn};

use crate::vault::VaultError;

pub const PRESENCE_TOKEN_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceVerdict {
    Approved,
    Denied(String),
}

pub trait PresenceCheck: Send + Sync {
    fn check(&self, reason: &str) -> PresenceVerdict;
}

/// Proof of one approved presence check. Only [`PresenceGate::request`] can mint one.
pub struct PresenceToken {
    nonce: [u8; 32],
    issued_at: Instant,
}

impl std::fmt::Debug for PresenceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceToken")
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

pub struct PresenceGate {
    check: Arc<dyn PresenceCheck>,
    ttl: Duration,
    ledger: Mutex<HashMap<[u8; 32], Instant>>,
}

impl PresenceGate {
    pub fn new(check: Arc<dyn PresenceCheck>) -> Self {
        Self::with_ttl(check, PRESENCE_TOKEN_TTL)
    }

    pub fn with_ttl(check: Arc<dyn PresenceCheck>, ttl: Duration) -> Self {
        Self {
            check,
            ttl,
            ledger: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(check_from_env())
    }

    /// Run the presence check and mint a token on approval.
    ///
    /// The check may block on the user; callers must not hold any store lock here.
    pub fn request(&self, reason: &str) -> Result<PresenceToken, VaultError> {
        match self.check.check(reason) {
            PresenceVerdict::Approved => {}
            PresenceVerdict::Denied(why) => {
                warn!(reason, denial = %why, "presence check denied");
                return Err(VaultError::PresenceDenied(why));
            }
        }

        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        let issued_at = Instant::now();

        let mut ledger = self
            .ledger
            .lock()
            .map_err(|_| VaultError::Other("presence ledger poisoned".to_string()))?;
        let ttl = self.ttl;
        ledger.retain(|_, at| at.elapsed() < ttl);
        ledger.insert(nonce, issued_at);
        debug!(reason, "presence approved");
        Ok(PresenceToken { nonce, issued_at })
    }

    /// Consume `token`. True only for an unused token from this gate that is still fresh.
    pub fn redeem(&self, token: &PresenceToken) -> bool {
        let Ok(mut ledger) = self.ledger.lock() else {
            return false;
        };
        match ledger.remove(&token.nonce) {
            Some(issued_at) => issued_at.elapsed() < self.ttl,
            None => false,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.ledger.lock().map(|l| l.len()).unwrap_or(0)
    }
}

/// Delegates the check to an external program; exit status 0 approves.
///
/// The reason string is passed as the final argument.
#[derive(Debug, Clone)]
pub struct CommandPresence {
    program: String,
    args: Vec<String>,
}

impl CommandPresence {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a command line on whitespace. No shell quoting is interpreted.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

impl PresenceCheck for CommandPresence {
    fn check(&self, reason: &str) -> PresenceVerdict {
        let status = std::process::Command::new(&self.program)
            .args(&self.args)
            .arg(reason)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => PresenceVerdict::Approved,
            Ok(s) => PresenceVerdict::Denied(format!("presence check failed ({})", s)),
            Err(e) => PresenceVerdict::Denied(format!(
                "presence helper '{}' could not run: {}",
                self.program, e
            )),
        }
    }
}

/// Used when no presence mechanism is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl PresenceCheck for DenyAll {
    fn check(&self, _reason: &str) -> PresenceVerdict {
        PresenceVerdict::Denied("no presence check configured".to_string())
    }
}

/// Fixed verdict, with a count of how often it was asked.
#[derive(Debug, Default)]
pub struct StaticPresence {
    approve: bool,
    checks: AtomicUsize,
}

impl StaticPresence {
    pub fn approving() -> Self {
        Self {
            approve: true,
            checks: AtomicUsize::new(0),
        }
    }

    pub fn denying() -> Self {
        Self {
            approve: false,
            checks: AtomicUsize::new(0),
        }
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl PresenceCheck for StaticPresence {
    fn check(&self, _reason: &str) -> PresenceVerdict {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.approve {
            PresenceVerdict::Approved
        } else {
            PresenceVerdict::Denied("user cancelled".to_string())
        }
    }
}

pub fn check_from_env() -> Arc<dyn PresenceCheck> {
    match crate::config::env_trimmed("AUTOFILL_PRESENCE_COMMAND")
        .as_deref()
        .and_then(CommandPresence::parse)
    {
        Some(cmd) => Arc::new(cmd),
        None => Arc::new(DenyAll),
    }
}
