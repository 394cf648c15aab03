mod audit;
mod crypto;
mod paths;
mod store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::accounts::AccountId;
use crate::presence::{PresenceGate, PresenceToken};
use crate::vault::crypto::{open, parse_key_32, random_device_id, random_key_32, seal, sha256_hex};

pub use audit::{append_audit_event, read_audit_events, read_audit_events_before, VaultAuditEvent};
pub use paths::VaultPaths;
pub use store::{record_aad, Secret, SecretCiphertext, SecretMeta, SecretRecord, WrappedDek};

pub const DEFAULT_KEYCHAIN_SERVICE: &str = "autofill-vault";
pub const DEFAULT_KEYCHAIN_ACCOUNT: &str = "kek";
pub const DEFAULT_KEY_ENV_VAR: &str = "AUTOFILL_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultProviderType {
    Keychain,
    Env,
    File,
}

/// Where the key-encryption key lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VaultProviderConfig {
    Keychain { service: String, account: String },
    Env { env_var: String },
    File { path: String },
}

impl VaultProviderConfig {
    pub fn provider_type(&self) -> VaultProviderType {
        match self {
            VaultProviderConfig::Keychain { .. } => VaultProviderType::Keychain,
            VaultProviderConfig::Env { .. } => VaultProviderType::Env,
            VaultProviderConfig::File { .. } => VaultProviderType::File,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    pub version: u32,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    /// Bound into every record's AAD; records do not decrypt under another installation.
    pub device_id: String,
    pub provider: VaultProviderConfig,
    /// sha256 of the KEK bytes.
    pub kek_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultStatus {
    pub enabled: bool,
    pub provider_type: Option<VaultProviderType>,
    pub kek_id: Option<String>,
    pub device_id: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum VaultError {
    #[error("vault not enabled")]
    NotEnabled,
    #[error("no credentials stored for this account")]
    NotFound,
    #[error("presence check denied: {0}")]
    PresenceDenied(String),
    #[error("stored credentials are unreadable: {0}")]
    Corrupt(String),
    #[error("invalid secret: {0}")]
    InvalidSecret(String),
    #[error("vault provider misconfigured: {0}")]
    Provider(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

/// Encrypted per-account credential storage.
///
/// Reads require a [`PresenceToken`] minted by the same [`PresenceGate`] the vault was built
/// with. All file access is serialized through `io_lock`; presence checks never run under it.
pub struct CredentialVault {
    paths: VaultPaths,
    gate: Arc<PresenceGate>,
    cfg: Mutex<Option<VaultConfig>>,
    io_lock: Mutex<()>,
    audit_enabled: AtomicBool,
}

struct VaultInitLock {
    path: std::path::PathBuf,
}

impl Drop for VaultInitLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

impl CredentialVault {
    pub fn discover(gate: Arc<PresenceGate>) -> Self {
        Self::new(VaultPaths::discover(), gate)
    }

    pub fn new(paths: VaultPaths, gate: Arc<PresenceGate>) -> Self {
        Self {
            paths,
            gate,
            cfg: Mutex::new(None),
            io_lock: Mutex::new(()),
            audit_enabled: AtomicBool::new(!vault_disk_logs_disabled()),
        }
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    pub fn gate(&self) -> &Arc<PresenceGate> {
        &self.gate
    }

    pub fn set_audit_enabled(&self, enabled: bool) {
        self.audit_enabled.store(enabled, Ordering::Relaxed);
    }

    fn maybe_audit(&self, event: VaultAuditEvent) {
        if !self.audit_enabled.load(Ordering::Relaxed) {
            return;
        }
        if let Err(err) = append_audit_event(&self.paths.audit_dir(), &event) {
            warn!(error = %err, kind = %event.kind, "failed to append vault audit event");
        }
    }

    fn audit_account(&self, kind: &str, account_id: &AccountId, note: Option<&str>) {
        let mut event = VaultAuditEvent::now(kind)
            .account(account_id.as_str())
            .actor("service");
        if let Some(note) = note {
            event = event.note(note);
        }
        self.maybe_audit(event);
    }

    fn lock_io(&self) -> Result<MutexGuard<'_, ()>, VaultError> {
        self.io_lock
            .lock()
            .map_err(|_| VaultError::Other("vault io lock poisoned".to_string()))
    }

    fn set_config(&self, cfg: Option<VaultConfig>) -> Result<(), VaultError> {
        let mut slot = self
            .cfg
            .lock()
            .map_err(|_| VaultError::Other("vault config lock poisoned".to_string()))?;
        *slot = cfg;
        Ok(())
    }

    fn config(&self) -> Result<VaultConfig, VaultError> {
        self.cfg
            .lock()
            .map_err(|_| VaultError::Other("vault config lock poisoned".to_string()))?
            .clone()
            .ok_or(VaultError::NotEnabled)
    }

    // Cross-process guard for first-run initialization: a lock directory next to vault.json.
    fn acquire_init_lock(&self) -> Result<Option<VaultInitLock>, VaultError> {
        if self.paths.config_path().exists() {
            return Ok(None);
        }
        std::fs::create_dir_all(self.paths.root_dir())?;

        let lock_path = self.paths.root_dir().join(".init-lock");
        let start = std::time::Instant::now();
        loop {
            match std::fs::create_dir(&lock_path) {
                Ok(()) => return Ok(Some(VaultInitLock { path: lock_path })),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.paths.config_path().exists() {
                        return Ok(None);
                    }
                    let stale = std::fs::metadata(&lock_path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|t| t.elapsed().ok())
                        .is_some_and(|age| age > Duration::from_secs(30));
                    if stale {
                        let _ = std::fs::remove_dir_all(&lock_path);
                    } else {
                        std::thread::sleep(Duration::from_millis(25));
                    }
                    if start.elapsed() > Duration::from_secs(3) {
                        if self.paths.config_path().exists() {
                            return Ok(None);
                        }
                        return Err(VaultError::Other(
                            "vault init lock held too long".to_string(),
                        ));
                    }
                }
                Err(err) => return Err(VaultError::Io(err)),
            }
        }
    }

    /// Read `vault.json`, initializing a default provider on first use.
    pub fn load(&self) -> Result<(), VaultError> {
        let path = self.paths.config_path();
        if !path.exists() {
            return self.ensure_default_initialized();
        }
        let raw = std::fs::read_to_string(&path)?;
        let cfg: VaultConfig = serde_json::from_str(&raw)?;
        self.set_config(Some(cfg))
    }

    pub fn status(&self) -> VaultStatus {
        let cfg = self.cfg.lock().ok().and_then(|c| c.clone());
        VaultStatus {
            enabled: cfg.is_some(),
            provider_type: cfg.as_ref().map(|c| c.provider.provider_type()),
            kek_id: cfg.as_ref().map(|c| c.kek_id.clone()),
            device_id: cfg.map(|c| c.device_id),
        }
    }

    pub fn init(&self, provider: VaultProviderConfig) -> Result<VaultStatus, VaultError> {
        let _lock = self.acquire_init_lock()?;
        if self.paths.config_path().exists() {
            self.load()?;
            return Ok(self.status());
        }
        self.init_unlocked(provider)
    }

    fn init_unlocked(&self, provider: VaultProviderConfig) -> Result<VaultStatus, VaultError> {
        self.paths.ensure_dirs()?;

        let kek = match &provider {
            VaultProviderConfig::Keychain { service, account } => {
                let kek = Zeroizing::new(random_key_32());
                store_kek_keychain(service, account, &kek)?;
                // Headless hosts can accept the write and still fail the read.
                let loaded = load_kek_keychain(service, account).map_err(VaultError::Provider)?;
                if *loaded != *kek {
                    return Err(VaultError::Provider(
                        "keychain verification failed".to_string(),
                    ));
                }
                kek
            }
            VaultProviderConfig::Env { env_var } => {
                load_kek_from_env(env_var).map_err(VaultError::Provider)?
            }
            VaultProviderConfig::File { path } => match load_kek_from_file(path) {
                Ok(kek) => kek,
                Err(_) => {
                    let kek = Zeroizing::new(random_key_32());
                    store_kek_file(path, &kek).map_err(VaultError::Provider)?;
                    kek
                }
            },
        };

        let now = chrono::Utc::now().timestamp_millis();
        let cfg = VaultConfig {
            version: 1,
            created_at_ms: now,
            updated_at_ms: now,
            device_id: random_device_id(),
            provider,
            kek_id: sha256_hex(kek.as_slice()),
        };
        self.write_config(&cfg)?;
        let provider_type = cfg.provider.provider_type();
        self.set_config(Some(cfg))?;
        info!(provider = ?provider_type, "vault initialized");
        self.maybe_audit(
            VaultAuditEvent::now("vault.init")
                .actor("operator")
                .note(format!("{:?}", provider_type).to_lowercase()),
        );
        Ok(self.status())
    }

    fn ensure_default_initialized(&self) -> Result<(), VaultError> {
        let _lock = self.acquire_init_lock()?;
        if self.paths.config_path().exists() {
            return self.load();
        }

        // The OS keychain is only the default for the real home vault, never for overridden
        // (test or sandbox) roots.
        let canonical_home = crate::paths::root_dir_override().is_none()
            && self.paths.root_dir == VaultPaths::discover().root_dir;
        let file_provider = VaultProviderConfig::File {
            path: self.paths.default_key_path().display().to_string(),
        };

        if cfg!(target_os = "macos") && canonical_home {
            let keychain = VaultProviderConfig::Keychain {
                service: DEFAULT_KEYCHAIN_SERVICE.to_string(),
                account: DEFAULT_KEYCHAIN_ACCOUNT.to_string(),
            };
            if let Err(err) = self.init_unlocked(keychain) {
                warn!(error = %err, "keychain unavailable, falling back to key file");
                self.init_unlocked(file_provider)?;
            }
        } else {
            self.init_unlocked(file_provider)?;
        }
        Ok(())
    }

    /// Encrypt and store `secret` for `account_id`, replacing any previous record.
    pub fn save(&self, account_id: &AccountId, secret: &Secret) -> Result<(), VaultError> {
        secret.validate().map_err(VaultError::InvalidSecret)?;
        let cfg = self.config()?;
        let kek = self.get_kek(&cfg)?;

        let aad = record_aad(&cfg.device_id, account_id);
        let plaintext = Zeroizing::new(serde_json::to_vec(secret)?);
        let dek = Zeroizing::new(random_key_32());
        let dek_wrapped =
            seal(&kek, dek.as_slice(), aad.as_bytes()).map_err(VaultError::Provider)?;
        let value = seal(&dek, &plaintext, aad.as_bytes()).map_err(VaultError::Provider)?;

        let _io = self.lock_io()?;
        let now = chrono::Utc::now().timestamp_millis();
        let created_at_ms = self
            .read_record(account_id)
            .map(|r| r.created_at_ms)
            .unwrap_or(now);
        let record = SecretRecord {
            version: store::RECORD_VERSION,
            account_id: account_id.clone(),
            created_at_ms,
            updated_at_ms: now,
            ciphertext: store::SecretCiphertext {
                alg: store::ENVELOPE_ALG.to_string(),
                dek_wrapped: store::WrappedDek {
                    kek_id: cfg.kek_id.clone(),
                    blob: dek_wrapped,
                },
                value,
            },
        };
        self.write_record(&record)?;
        drop(_io);

        self.audit_account("secret.save", account_id, None);
        Ok(())
    }

    /// Decrypt the stored secret. `token` is consumed whether or not the read succeeds.
    pub fn fetch(
        &self,
        account_id: &AccountId,
        token: PresenceToken,
    ) -> Result<Secret, VaultError> {
        if !self.gate.redeem(&token) {
            let why = "presence token invalid, reused or expired";
            self.audit_account("secret.fetch.denied", account_id, Some(why));
            return Err(VaultError::PresenceDenied(why.to_string()));
        }
        let cfg = self.config()?;

        let record = {
            let _io = self.lock_io()?;
            self.read_record(account_id)
        };
        let secret = record.and_then(|record| {
            let kek = self.get_kek(&cfg)?;
            open_record(&kek, &cfg.device_id, &record).map_err(VaultError::Corrupt)
        });

        match &secret {
            Ok(_) => self.audit_account("secret.fetch", account_id, None),
            Err(VaultError::Corrupt(reason)) => {
                warn!(account_id = %account_id, reason = %reason, "stored credentials unreadable");
                self.audit_account("secret.fetch.corrupt", account_id, Some(reason.as_str()));
            }
            Err(_) => {}
        }
        secret
    }

    /// True when a parseable record exists. Does not decrypt and needs no presence.
    pub fn exists(&self, account_id: &AccountId) -> bool {
        match self.lock_io() {
            Ok(_io) => self.read_record(account_id).is_ok(),
            Err(_) => false,
        }
    }

    /// Remove the record. Deleting an absent record succeeds.
    pub fn delete(&self, account_id: &AccountId) -> Result<(), VaultError> {
        let _io = self.lock_io()?;
        let removed = match std::fs::remove_file(self.paths.secret_path(account_id)) {
            Ok(()) => true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => return Err(VaultError::Io(err)),
        };
        drop(_io);
        self.audit_account(
            "secret.delete",
            account_id,
            (!removed).then_some("already absent"),
        );
        Ok(())
    }

    /// Headers of every readable record, oldest first.
    pub fn list_account_ids(&self) -> Result<Vec<SecretMeta>, VaultError> {
        let _io = self.lock_io()?;
        let dir = self.paths.secrets_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<SecretRecord>(&raw).ok());
            match parsed {
                Some(rec) => out.push(SecretMeta::from(&rec)),
                None => warn!(path = %path.display(), "skipping unreadable vault record"),
            }
        }
        out.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.account_id.cmp(&b.account_id))
        });
        Ok(out)
    }

    fn get_kek(&self, cfg: &VaultConfig) -> Result<Zeroizing<[u8; 32]>, VaultError> {
        match &cfg.provider {
            VaultProviderConfig::Keychain { service, account } => {
                load_kek_keychain(service, account)
            }
            VaultProviderConfig::Env { env_var } => load_kek_from_env(env_var),
            VaultProviderConfig::File { path } => load_kek_from_file(path),
        }
        .map_err(VaultError::Provider)
    }

    fn write_config(&self, cfg: &VaultConfig) -> Result<(), VaultError> {
        let raw = serde_json::to_string_pretty(cfg)?;
        std::fs::create_dir_all(self.paths.root_dir())?;
        std::fs::write(self.paths.config_path(), raw)?;
        #[cfg(unix)]
        {
            crate::paths::set_mode(&self.paths.config_path(), 0o600)
                .map_err(VaultError::Other)?;
        }
        Ok(())
    }

    fn read_record(&self, account_id: &AccountId) -> Result<SecretRecord, VaultError> {
        let path = self.paths.secret_path(account_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::NotFound)
            }
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                return Err(VaultError::Corrupt("record is not valid utf-8".to_string()))
            }
            Err(err) => return Err(VaultError::Io(err)),
        };
        let record: SecretRecord = serde_json::from_str(&raw)
            .map_err(|e| VaultError::Corrupt(format!("record does not parse: {}", e)))?;
        if &record.account_id != account_id {
            return Err(VaultError::Corrupt(
                "record belongs to a different account".to_string(),
            ));
        }
        Ok(record)
    }

    fn write_record(&self, rec: &SecretRecord) -> Result<(), VaultError> {
        let dir = self.paths.secrets_dir();
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            crate::paths::set_mode(&dir, 0o700).map_err(VaultError::Other)?;
        }
        let path = self.paths.secret_path(&rec.account_id);
        std::fs::write(&path, serde_json::to_string_pretty(rec)?)?;
        #[cfg(unix)]
        {
            crate::paths::set_mode(&path, 0o600).map_err(VaultError::Other)?;
        }
        Ok(())
    }
}

fn open_record(kek: &[u8; 32], device_id: &str, record: &SecretRecord) -> Result<Secret, String> {
    if record.ciphertext.alg != store::ENVELOPE_ALG {
        return Err(format!("unsupported envelope '{}'", record.ciphertext.alg));
    }
    let aad = record_aad(device_id, &record.account_id);
    let dek_bytes = open(kek, &record.ciphertext.dek_wrapped.blob, aad.as_bytes())?;
    if dek_bytes.len() != 32 {
        return Err("wrapped data key has the wrong length".to_string());
    }
    let mut dek = Zeroizing::new([0u8; 32]);
    dek.copy_from_slice(&dek_bytes);
    let plaintext = open(&dek, &record.ciphertext.value, aad.as_bytes())?;
    serde_json::from_slice::<Secret>(&plaintext)
        .map_err(|_| "decrypted payload is not a credential record".to_string())
}

fn vault_disk_logs_disabled() -> bool {
    crate::config::env_flag_enabled("AUTOFILL_DISABLE_DISK_LOGS")
}

fn load_kek_from_env(env_var: &str) -> Result<Zeroizing<[u8; 32]>, String> {
    let raw = Zeroizing::new(
        std::env::var(env_var).map_err(|_| format!("missing env var {}", env_var))?,
    );
    parse_key_32(&raw).map(Zeroizing::new)
}

fn load_kek_from_file(path: &str) -> Result<Zeroizing<[u8; 32]>, String> {
    let raw = Zeroizing::new(
        std::fs::read_to_string(path).map_err(|e| format!("failed to read key file: {}", e))?,
    );
    parse_key_32(&raw).map(Zeroizing::new)
}

fn store_kek_file(path: &str, kek: &[u8; 32]) -> Result<(), String> {
    use std::io::Write;
    let p = std::path::PathBuf::from(path);
    if let Some(parent) = p.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    let b64 = Zeroizing::new(base64::engine::general_purpose::STANDARD.encode(kek));
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&p)
        .map_err(|e| e.to_string())?;
    f.write_all(b64.as_bytes()).map_err(|e| e.to_string())?;
    #[cfg(unix)]
    {
        crate::paths::set_mode(&p, 0o600)?;
    }
    Ok(())
}

fn store_kek_keychain(service: &str, account: &str, kek: &[u8; 32]) -> Result<(), VaultError> {
    let entry =
        keyring::Entry::new(service, account).map_err(|e| VaultError::Provider(e.to_string()))?;
    let b64 = Zeroizing::new(base64::engine::general_purpose::STANDARD.encode(kek));
    entry
        .set_password(&b64)
        .map_err(|e| VaultError::Provider(e.to_string()))
}

fn load_kek_keychain(service: &str, account: &str) -> Result<Zeroizing<[u8; 32]>, String> {
    let entry = keyring::Entry::new(service, account).map_err(|e| e.to_string())?;
    let b64 = Zeroizing::new(entry.get_password().map_err(|e| e.to_string())?);
    parse_key_32(&b64).map(Zeroizing::new)
}
