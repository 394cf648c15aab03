use std::path::{Path, PathBuf};

use crate::accounts::AccountId;

#[derive(Debug, Clone)]
pub struct VaultPaths {
    pub root_dir: PathBuf,
}

impl VaultPaths {
    /// `<autofill root>/vault`, honouring `AUTOFILL_DIR`.
    pub fn discover() -> Self {
        Self::under(&crate::paths::autofill_root_dir())
    }

    pub fn under(autofill_root: &Path) -> Self {
        Self {
            root_dir: autofill_root.join("vault"),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.root_dir.join("vault.json")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.root_dir.join("secrets")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.root_dir.join("audit")
    }

    pub fn default_key_path(&self) -> PathBuf {
        self.root_dir.join("kek.key")
    }

    pub fn secret_path(&self, account_id: &AccountId) -> PathBuf {
        self.secrets_dir().join(format!("{}.json", account_id))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root_dir)?;
        std::fs::create_dir_all(self.secrets_dir())?;
        std::fs::create_dir_all(self.audit_dir())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for dir in [self.root_dir.clone(), self.secrets_dir()] {
                let _ = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700));
            }
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.config_path().exists()
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }
}
