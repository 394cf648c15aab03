use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use zeroize::Zeroizing;

pub const AEAD_ALG: &str = "xchacha20poly1305";
const NONCE_LEN: usize = 24;

pub fn random_key_32() -> [u8; 32] {
    let mut out = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// Random identifier for one vault installation; bound into every record's AAD.
pub fn random_device_id() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AeadBlob {
    pub alg: String,
    pub nonce_b64: String,
    pub ciphertext_b64: String,
}

pub fn seal(key_32: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<AeadBlob, String> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key_32));
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| "encrypt failed".to_string())?;
    let b64 = base64::engine::general_purpose::STANDARD;
    Ok(AeadBlob {
        alg: AEAD_ALG.to_string(),
        nonce_b64: b64.encode(nonce),
        ciphertext_b64: b64.encode(ciphertext),
    })
}

/// Decrypt a blob. The plaintext is wiped when the returned buffer drops.
pub fn open(key_32: &[u8; 32], blob: &AeadBlob, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, String> {
    if blob.alg != AEAD_ALG {
        return Err(format!("unsupported aead alg '{}'", blob.alg));
    }
    let b64 = base64::engine::general_purpose::STANDARD;
    let nonce = b64
        .decode(blob.nonce_b64.as_bytes())
        .map_err(|_| "invalid nonce encoding".to_string())?;
    if nonce.len() != NONCE_LEN {
        return Err("invalid nonce length".to_string());
    }
    let ciphertext = b64
        .decode(blob.ciphertext_b64.as_bytes())
        .map_err(|_| "invalid ciphertext encoding".to_string())?;

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key_32));
    cipher
        .decrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: &ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| "decrypt failed".to_string())
}

/// Parse a 32-byte key written as base64 or 64 hex characters.
pub fn parse_key_32(raw: &str) -> Result<[u8; 32], String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("missing vault key".to_string());
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(trimmed.as_bytes())
        .ok()
        .filter(|d| d.len() == 32)
        .or_else(|| {
            (trimmed.len() == 64)
                .then(|| hex::decode(trimmed).ok())
                .flatten()
        });
    match decoded {
        Some(bytes) if bytes.len() == 32 => {
            let mut out = [0u8; 32];
            out.copy_from_slice(&bytes);
            Ok(out)
        }
        _ => Err("invalid vault key (expected base64 or 64-char hex for 32 bytes)".to_string()),
    }
}
