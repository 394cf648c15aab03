//! Wire protocol between the unprivileged filling agent and the privileged service.
//!
//! One long-lived unix-socket session carries newline-delimited JSON frames. Every client frame
//! carries an `id` and replies echo it, so replies may arrive in any order.

pub mod cache;
pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::accounts::AccountId;
use crate::error::{FillError, FillResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BridgeRequest {
    /// Must open every session.
    Hello {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    /// The only request whose reply carries secret material.
    GetCredentials {
        #[serde(rename = "accountId")]
        account_id: AccountId,
    },
    GetAllMappings,
    ResolveOrigin {
        origin: String,
    },
    SelectAccount {
        #[serde(rename = "selectionId")]
        selection_id: String,
        #[serde(rename = "accountId")]
        account_id: AccountId,
    },
}

impl BridgeRequest {
    pub fn op(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::GetCredentials { .. } => "get_credentials",
            Self::GetAllMappings => "get_all_mappings",
            Self::ResolveOrigin { .. } => "resolve_origin",
            Self::SelectAccount { .. } => "select_account",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    pub request: BridgeRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeReply {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FillError>,
}

impl BridgeReply {
    pub fn ok(id: u64, value: Value) -> Self {
        Self {
            id,
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn err(id: u64, error: FillError) -> Self {
        Self {
            id,
            ok: false,
            value: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> FillResult<Value> {
        if self.ok {
            return Ok(self.value.unwrap_or(Value::Null));
        }
        Err(self
            .error
            .unwrap_or_else(|| FillError::unexpected("error reply without detail")))
    }
}

// Borrowing twin of `BridgeReply` so a reply can be encoded straight from typed values.
#[derive(Serialize)]
struct OutgoingReply<'a, T: Serialize> {
    id: u64,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a FillError>,
}

/// Encode one reply line, newline included. The buffer is wiped when dropped.
pub fn encode_reply<T: Serialize>(id: u64, result: &FillResult<T>) -> Zeroizing<Vec<u8>> {
    let frame = match result {
        Ok(value) => OutgoingReply {
            id,
            ok: true,
            value: Some(value),
            error: None,
        },
        Err(error) => OutgoingReply {
            id,
            ok: false,
            value: None,
            error: Some(error),
        },
    };
    let mut raw = match serde_json::to_vec(&frame) {
        Ok(raw) => raw,
        Err(_) => format!(
            r#"{{"id":{},"ok":false,"error":{{"error":"unexpected","message":"reply encoding failed"}}}}"#,
            id
        )
        .into_bytes(),
    };
    raw.push(b'\n');
    Zeroizing::new(raw)
}

pub fn encode_frame(frame: &ClientFrame) -> Result<Vec<u8>, String> {
    let mut raw = serde_json::to_vec(frame).map_err(|e| e.to_string())?;
    raw.push(b'\n');
    Ok(raw)
}

/// Parse one client line. A line with a readable `id` but a bad request still yields that id,
/// so the error can be correlated.
pub fn parse_client_frame(line: &str) -> Result<ClientFrame, (u64, FillError)> {
    let raw: Value = serde_json::from_str(line).map_err(|e| {
        (
            0,
            FillError::new(
                crate::error::ErrorCode::InvalidRequest,
                format!("invalid frame JSON: {}", e),
            ),
        )
    })?;
    let id = raw.get("id").and_then(Value::as_u64).unwrap_or(0);
    serde_json::from_value::<ClientFrame>(raw).map_err(|e| {
        (
            id,
            FillError::new(
                crate::error::ErrorCode::InvalidRequest,
                format!("invalid request: {}", e),
            ),
        )
    })
}
