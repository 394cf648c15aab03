use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque account identifier. Always a UUID, so it is safe to use as a file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let id = Uuid::parse_str(trimmed)
            .map_err(|_| format!("invalid account id '{}' (expected a UUID)", trimmed))?;
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AccountId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AccountId> for String {
    fn from(id: AccountId) -> Self {
        id.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Static password plus a one-time-code seed.
    #[default]
    Otp,
}

impl AuthMethod {
    pub fn requires_detail(self) -> bool {
        match self {
            Self::Otp => true,
        }
    }

    pub fn detail_prompt(self) -> &'static str {
        match self {
            Self::Otp => "OTP secret key",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Otp => "otp",
        }
    }
}

/// Non-sensitive account data. The password and method detail live only in the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub username: String,
    #[serde(default)]
    pub auth_method: AuthMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountStoreData {
    version: u32,
    #[serde(default)]
    accounts: Vec<Account>,
}

impl Default for AccountStoreData {
    fn default() -> Self {
        Self {
            version: 1,
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccountStore {
    path: PathBuf,
    data: AccountStoreData,
}

impl AccountStore {
    pub fn open_under(root_dir: &Path) -> Result<Self, String> {
        Self::load(&root_dir.join("accounts.json"))
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                data: AccountStoreData::default(),
            });
        }
        let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let data: AccountStoreData = serde_json::from_str(&raw).map_err(|e| e.to_string())?;
        Ok(Self {
            path: path.to_path_buf(),
            data,
        })
    }

    pub fn save(&self) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            #[cfg(unix)]
            {
                crate::paths::set_mode(parent, 0o700)?;
            }
        }
        let raw = serde_json::to_string_pretty(&self.data).map_err(|e| e.to_string())?;
        std::fs::write(&self.path, raw).map_err(|e| e.to_string())?;
        #[cfg(unix)]
        {
            crate::paths::set_mode(&self.path, 0o600)?;
        }
        Ok(())
    }

    pub fn list(&self) -> &[Account] {
        &self.data.accounts
    }

    pub fn get(&self, id: &AccountId) -> Option<&Account> {
        self.data.accounts.iter().find(|a| &a.id == id)
    }

    pub fn add(
        &mut self,
        name: &str,
        username: &str,
        auth_method: AuthMethod,
    ) -> Result<Account, String> {
        let name = name.trim();
        if name.is_empty() {
            return Err("account name required".to_string());
        }
        let account = Account {
            id: AccountId::generate(),
            name: name.to_string(),
            username: username.trim().to_string(),
            auth_method,
        };
        self.data.accounts.push(account.clone());
        Ok(account)
    }

    pub fn update(
        &mut self,
        id: &AccountId,
        name: Option<&str>,
        username: Option<&str>,
    ) -> Result<Account, String> {
        let account = self
            .data
            .accounts
            .iter_mut()
            .find(|a| &a.id == id)
            .ok_or_else(|| format!("account '{}' not found", id))?;
        if let Some(name) = name {
            let name = name.trim();
            if name.is_empty() {
                return Err("account name required".to_string());
            }
            account.name = name.to_string();
        }
        if let Some(username) = username {
            account.username = username.trim().to_string();
        }
        Ok(account.clone())
    }

    pub fn remove(&mut self, id: &AccountId) -> bool {
        let before = self.data.accounts.len();
        self.data.accounts.retain(|a| &a.id != id);
        before != self.data.accounts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_id_rejects_non_uuid_and_normalizes_case() {
        assert!(AccountId::parse("../../etc/passwd").is_err());
        assert!(AccountId::parse("").is_err());
        let id = AccountId::parse(" 6F9619FF-8B86-D011-B42D-00C04FC964FF ").unwrap();
        assert_eq!(id.as_str(), "6f9619ff-8b86-d011-b42d-00c04fc964ff");

        let bad: Result<AccountId, _> = serde_json::from_str("\"acct1\"");
        assert!(bad.is_err());
    }

    #[test]
    fn auth_method_wire_value_and_detail_requirement() {
        assert_eq!(serde_json::to_string(&AuthMethod::Otp).unwrap(), "\"otp\"");
        assert!(AuthMethod::Otp.requires_detail());
        assert_eq!(AuthMethod::Otp.detail_prompt(), "OTP secret key");
    }

    #[test]
    fn account_store_roundtrip_update_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = AccountStore::open_under(dir.path()).unwrap();
        assert!(store.add("  ", "alice", AuthMethod::Otp).is_err());

        let work = store.add(" Work ", "alice@contoso.com", AuthMethod::Otp).unwrap();
        let personal = store.add("Personal", "alice@outlook.com", AuthMethod::Otp).unwrap();
        assert_eq!(work.name, "Work");
        store.save().unwrap();

        let mut loaded = AccountStore::open_under(dir.path()).unwrap();
        assert_eq!(loaded.list().len(), 2);
        assert_eq!(loaded.get(&personal.id).unwrap().username, "alice@outlook.com");

        let renamed = loaded.update(&work.id, Some("Work Azure"), None).unwrap();
        assert_eq!(renamed.name, "Work Azure");
        assert_eq!(renamed.username, "alice@contoso.com");
        assert!(loaded.update(&AccountId::generate(), Some("x"), None).is_err());

        assert!(loaded.remove(&work.id));
        assert!(!loaded.remove(&work.id));
        assert_eq!(loaded.list().len(), 1);
    }
}
