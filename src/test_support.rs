use std::ffi::{OsStr, OsString};
use std::sync::{Mutex, MutexGuard};

/// Serializes tests that touch process-wide env vars (`AUTOFILL_DIR`, `AUTOFILLD_SOCKET`, ...).
static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Take `ENV_LOCK`, surviving a previous test that panicked while holding it.
pub fn lock_env() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sets or removes an env var for the life of the guard, restoring the old value on drop.
///
/// Hold `lock_env()` while one of these is alive.
pub struct ScopedEnvVar {
    key: String,
    old: Option<OsString>,
}

impl ScopedEnvVar {
    pub fn set(key: &str, value: impl AsRef<OsStr>) -> Self {
        let old = std::env::var_os(key);
        std::env::set_var(key, value);
        Self {
            key: key.to_string(),
            old,
        }
    }

    pub fn remove(key: &str) -> Self {
        let old = std::env::var_os(key);
        std::env::remove_var(key);
        Self {
            key: key.to_string(),
            old,
        }
    }
}

impl Drop for ScopedEnvVar {
    fn drop(&mut self) {
        match &self.old {
            Some(v) => std::env::set_var(&self.key, v),
            None => std::env::remove_var(&self.key),
        }
    }
}
