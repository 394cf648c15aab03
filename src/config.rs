use std::path::PathBuf;
use std::time::Duration;

/// Well-known identifier the bridge is discovered by. The socket file is named after it.
pub const SERVICE_NAME: &str = "dev.autofill.bridge";

/// The single client identity the daemon accepts unless `AUTOFILL_ALLOWED_CLIENTS` extends it.
pub const DEFAULT_CLIENT_ID: &str = "dev.autofill.agent";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(1000);
const DEFAULT_SELECTION_TTL: Duration = Duration::from_secs(120);

pub(crate) fn env_trimmed(name: &str) -> Option<String> {
    let raw = std::env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn env_flag_enabled(name: &str) -> bool {
    env_trimmed(name)
        .map(|v| {
            let v = v.to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}

fn env_u64(name: &str) -> Option<u64> {
    env_trimmed(name).and_then(|v| v.parse::<u64>().ok())
}

/// Accepts "600", "0600" and "0o600".
pub(crate) fn parse_octal_mode(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    u32::from_str_radix(trimmed.trim_start_matches("0o"), 8).ok()
}

/// Install the stderr log subscriber. `AUTOFILL_LOG` takes `EnvFilter` directives.
pub fn init_logging(default_directive: &str) {
    let filter = env_trimmed("AUTOFILL_LOG")
        .and_then(|raw| tracing_subscriber::EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub fn socket_mode_from_env() -> Option<u32> {
    env_trimmed("AUTOFILLD_SOCKET_MODE").and_then(|v| parse_octal_mode(&v))
}

pub fn socket_path_from_env() -> Option<PathBuf> {
    env_trimmed("AUTOFILLD_SOCKET").map(PathBuf::from)
}

pub fn default_socket_path() -> PathBuf {
    crate::paths::run_dir().join(format!("{}.sock", SERVICE_NAME))
}

pub fn resolve_socket_path(explicit: Option<&str>) -> PathBuf {
    explicit
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(socket_path_from_env)
        .unwrap_or_else(default_socket_path)
}

/// Tunables shared by both ends of the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub client_id: String,
    pub allowed_clients: Vec<String>,
    pub request_timeout: Duration,
    pub settle_delay: Duration,
    pub selection_ttl: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            allowed_clients: vec![DEFAULT_CLIENT_ID.to_string()],
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            selection_ttl: DEFAULT_SELECTION_TTL,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(id) = env_trimmed("AUTOFILL_CLIENT_ID") {
            cfg.client_id = id;
        }
        if let Some(raw) = env_trimmed("AUTOFILL_ALLOWED_CLIENTS") {
            let allowed: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
            if !allowed.is_empty() {
                cfg.allowed_clients = allowed;
            }
        }
        if let Some(ms) = env_u64("AUTOFILL_REQUEST_TIMEOUT_MS") {
            cfg.request_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = env_u64("AUTOFILL_SETTLE_DELAY_MS") {
            cfg.settle_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("AUTOFILL_SELECTION_TTL_SECS") {
            cfg.selection_ttl = Duration::from_secs(secs.max(1));
        }
        cfg
    }

    pub fn is_client_allowed(&self, client_id: &str) -> bool {
        let client_id = client_id.trim();
        self.allowed_clients.iter().any(|c| c == client_id)
    }
}
