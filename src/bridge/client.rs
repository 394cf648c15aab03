use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{encode_frame, BridgeReply, BridgeRequest, ClientFrame};
use crate::accounts::AccountId;
use crate::config::BridgeConfig;
use crate::error::{ErrorCode, FillError};
use crate::mappings::Mapping;
use crate::service::{Credentials, OutcomeSummary};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BridgeClientError {
    #[error("connection to the autofill service was lost")]
    ConnectionLost,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("{0}")]
    Remote(FillError),
}

impl BridgeClientError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ConnectionLost => ErrorCode::ConnectionLost,
            Self::Timeout(_) | Self::Protocol(_) => ErrorCode::Unexpected,
            Self::Remote(err) => err.error,
        }
    }
}

impl From<BridgeClientError> for FillError {
    fn from(err: BridgeClientError) -> Self {
        match err {
            BridgeClientError::Remote(inner) => inner,
            other => FillError::new(other.code(), other.to_string()),
        }
    }
}

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<BridgeReply>>>>;

// One live connection. Dead once the reader sees EOF or an error; never revived.
struct Session {
    writer: Mutex<OwnedWriteHalf>,
    pending: Pending,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl Session {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn register(&self, id: u64) -> Result<oneshot::Receiver<BridgeReply>, BridgeClientError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| BridgeClientError::Protocol("pending map poisoned".to_string()))?;
        if !self.is_alive() {
            return Err(BridgeClientError::ConnectionLost);
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);
        Ok(rx)
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    async fn call(
        &self,
        id: u64,
        request: BridgeRequest,
        timeout: Duration,
    ) -> Result<Value, BridgeClientError> {
        let rx = self.register(id)?;
        let raw = encode_frame(&ClientFrame { id, request }).map_err(BridgeClientError::Protocol)?;
        let written = {
            let mut writer = self.writer.lock().await;
            writer.write_all(&raw).await
        };
        if let Err(err) = written {
            debug!(error = %err, "bridge write failed");
            self.forget(id);
            self.alive.store(false, Ordering::SeqCst);
            return Err(BridgeClientError::ConnectionLost);
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.forget(id);
                Err(BridgeClientError::Timeout(timeout))
            }
            // Sender dropped: the reader drained the pending map on disconnect.
            Ok(Err(_)) => Err(BridgeClientError::ConnectionLost),
            Ok(Ok(reply)) => reply.into_result().map_err(BridgeClientError::Remote),
        }
    }
}

async fn read_replies(read_half: OwnedReadHalf, pending: Pending, alive: Arc<AtomicBool>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let reply = match serde_json::from_str::<BridgeReply>(&line) {
                    Ok(reply) => reply,
                    Err(err) => {
                        warn!(error = %err, "unparseable bridge reply");
                        continue;
                    }
                };
                let waiter = pending.lock().ok().and_then(|mut p| p.remove(&reply.id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!(id = reply.id, "reply for a request nobody awaits"),
                }
            }
            Ok(None) => {
                info!("bridge closed the session");
                break;
            }
            Err(err) => {
                warn!(error = %err, "bridge session read failed");
                break;
            }
        }
    }
    match pending.lock() {
        Ok(mut p) => {
            alive.store(false, Ordering::SeqCst);
            p.clear();
        }
        Err(_) => alive.store(false, Ordering::SeqCst),
    }
}

/// Agent-side handle on the bridge.
///
/// Connects lazily. When a request finds the session gone it waits `settle_delay` and makes one
/// reconnection attempt; if that fails the request fails with `ConnectionLost`.
pub struct BridgeClient {
    socket_path: PathBuf,
    config: BridgeConfig,
    session: Mutex<Option<Arc<Session>>>,
    next_id: AtomicU64,
    connected_once: AtomicBool,
}

impl BridgeClient {
    pub fn new(socket_path: impl Into<PathBuf>, config: BridgeConfig) -> Self {
        Self {
            socket_path: socket_path.into(),
            config,
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
            connected_once: AtomicBool::new(false),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.is_alive())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn session(&self) -> Result<Arc<Session>, BridgeClientError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.is_alive() {
                return Ok(session.clone());
            }
        }
        let had_session = slot.take().is_some() || self.connected_once.load(Ordering::SeqCst);
        if had_session {
            info!(
                delay_ms = self.config.settle_delay.as_millis() as u64,
                "bridge session lost, reconnecting once"
            );
            tokio::time::sleep(self.config.settle_delay).await;
        }
        match self.connect().await {
            Ok(session) => {
                let session = Arc::new(session);
                *slot = Some(session.clone());
                self.connected_once.store(true, Ordering::SeqCst);
                Ok(session)
            }
            Err(err) => {
                warn!(error = %err, socket = %self.socket_path.display(), "bridge connect failed");
                Err(err)
            }
        }
    }

    async fn connect(&self) -> Result<Session, BridgeClientError> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            debug!(error = %e, "bridge socket unreachable");
            BridgeClientError::ConnectionLost
        })?;
        let (read_half, write_half) = stream.into_split();
        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_replies(read_half, pending.clone(), alive.clone()));
        let session = Session {
            writer: Mutex::new(write_half),
            pending,
            alive,
            reader,
        };

        let hello = BridgeRequest::Hello {
            client_id: self.config.client_id.clone(),
        };
        session
            .call(self.next_id(), hello, self.config.request_timeout)
            .await?;
        info!(client_id = %self.config.client_id, "bridge session established");
        Ok(session)
    }

    pub async fn request(&self, request: BridgeRequest) -> Result<Value, BridgeClientError> {
        let session = self.session().await?;
        session
            .call(self.next_id(), request, self.config.request_timeout)
            .await
    }

    async fn request_typed<T: DeserializeOwned>(
        &self,
        request: BridgeRequest,
    ) -> Result<T, BridgeClientError> {
        let op = request.op();
        let value = self.request(request).await?;
        serde_json::from_value(value)
            .map_err(|e| BridgeClientError::Protocol(format!("bad {} reply: {}", op, e)))
    }

    pub async fn get_credentials(
        &self,
        account_id: &AccountId,
    ) -> Result<Credentials, BridgeClientError> {
        self.request_typed(BridgeRequest::GetCredentials {
            account_id: account_id.clone(),
        })
        .await
    }

    pub async fn get_all_mappings(&self) -> Result<Vec<Mapping>, BridgeClientError> {
        self.request_typed(BridgeRequest::GetAllMappings).await
    }

    pub async fn resolve_origin(&self, origin: &str) -> Result<OutcomeSummary, BridgeClientError> {
        self.request_typed(BridgeRequest::ResolveOrigin {
            origin: origin.to_string(),
        })
        .await
    }

    pub async fn select_account(
        &self,
        selection_id: &str,
        account_id: &AccountId,
    ) -> Result<OutcomeSummary, BridgeClientError> {
        self.request_typed(BridgeRequest::SelectAccount {
            selection_id: selection_id.to_string(),
            account_id: account_id.clone(),
        })
        .await
    }
}
