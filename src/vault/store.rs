use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::crypto::AeadBlob;
use crate::accounts::{AccountId, AuthMethod};

pub const RECORD_VERSION: u32 = 1;
pub const ENVELOPE_ALG: &str = "xchacha20poly1305+envelope";

/// AAD for one account's record on one vault installation.
pub fn record_aad(device_id: &str, account_id: &AccountId) -> String {
    format!("autofill:secret:v1:{}:{}", device_id, account_id)
}

/// The sensitive half of an account. Password and detail are wiped on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub username: String,
    pub password: String,
    #[zeroize(skip)]
    #[serde(default)]
    pub auth_method: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_detail: Option<String>,
}

impl Secret {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        auth_method: AuthMethod,
        method_detail: Option<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            auth_method,
            method_detail,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.password.is_empty() {
            return Err("password cannot be empty".to_string());
        }
        if self.auth_method.requires_detail()
            && self
                .method_detail
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            return Err(format!(
                "{} is required for {} accounts",
                self.auth_method.detail_prompt(),
                self.auth_method.as_str()
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("auth_method", &self.auth_method)
            .field(
                "method_detail",
                &self.method_detail.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedDek {
    pub kek_id: String,
    #[serde(flatten)]
    pub blob: AeadBlob,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretCiphertext {
    pub alg: String,
    pub dek_wrapped: WrappedDek,
    pub value: AeadBlob,
}

/// On-disk form of `secrets/<account_id>.json`. Only the header is readable without the KEK.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRecord {
    pub version: u32,
    pub account_id: AccountId,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub ciphertext: SecretCiphertext,
}

/// What listing and `exists` report; never carries ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretMeta {
    pub account_id: AccountId,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl From<&SecretRecord> for SecretMeta {
    fn from(r: &SecretRecord) -> Self {
        Self {
            account_id: r.account_id.clone(),
            created_at_ms: r.created_at_ms,
            updated_at_ms: r.updated_at_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_validation_requires_password_and_otp_seed() {
        let ok = Secret::new("alice", "pw", AuthMethod::Otp, Some("JBSWY3DPEHPK3PXP".into()));
        assert!(ok.validate().is_ok());

        let no_pw = Secret::new("alice", "", AuthMethod::Otp, Some("seed".into()));
        assert_eq!(no_pw.validate().unwrap_err(), "password cannot be empty");

        let no_seed = Secret::new("alice", "pw", AuthMethod::Otp, Some("  ".into()));
        assert!(no_seed.validate().unwrap_err().contains("OTP secret key"));
    }

    #[test]
    fn debug_redacts_sensitive_fields() {
        let s = Secret::new("alice", "hunter2", AuthMethod::Otp, Some("SEED".into()));
        let rendered = format!("{:?}", s);
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("SEED"));
    }

    #[test]
    fn aad_binds_device_and_account() {
        let id = AccountId::generate();
        let a = record_aad("dev-a", &id);
        assert_eq!(a, format!("autofill:secret:v1:dev-a:{}", id));
        assert_ne!(a, record_aad("dev-b", &id));
    }
}
