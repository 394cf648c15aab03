use serde::{Deserialize, Serialize};

/// Machine-readable failure classes shared by the privileged service and the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidPattern,
    NotFound,
    AmbiguousSelection,
    InvalidSelection,
    PresenceDenied,
    Corrupt,
    ConnectionLost,
    InvalidRequest,
    UnauthorizedClient,
    Unexpected,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidPattern => "invalid_pattern",
            Self::NotFound => "not_found",
            Self::AmbiguousSelection => "ambiguous_selection",
            Self::InvalidSelection => "invalid_selection",
            Self::PresenceDenied => "presence_denied",
            Self::Corrupt => "corrupt",
            Self::ConnectionLost => "connection_lost",
            Self::InvalidRequest => "invalid_request",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::Unexpected => "unexpected",
        }
    }

    /// Banner text the filling agent shows for this class of failure.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::PresenceDenied => {
                "Touch ID/passcode check failed or was cancelled. Please try again."
            }
            Self::NotFound => {
                "No credentials found for this site. Add an account mapping in the app."
            }
            Self::AmbiguousSelection => "Multiple accounts match this site. Please select one.",
            Self::InvalidSelection => {
                "That account selection is no longer valid. Please try again."
            }
            Self::ConnectionLost => {
                "Connection to the autofill app was lost. Please fill this login manually."
            }
            _ => "An unexpected error occurred. Please try again.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillError {
    pub error: ErrorCode,
    pub message: String,
}

impl FillError {
    pub fn new(error: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
        }
    }

    pub fn unexpected(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unexpected, detail)
    }
}

impl std::fmt::Display for FillError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error.as_str(), self.message)
    }
}

impl std::error::Error for FillError {}

pub type FillResult<T> = Result<T, FillError>;
