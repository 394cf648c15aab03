use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{encode_reply, parse_client_frame, BridgeRequest};
use crate::config::{socket_mode_from_env, BridgeConfig, SERVICE_NAME};
use crate::error::{ErrorCode, FillError, FillResult};
use crate::service::Service;

const PURGE_INTERVAL: Duration = Duration::from_secs(15);

/// Bind the bridge socket: parent dir 0700, stale socket removed, socket mode applied.
pub fn bind(socket_path: &Path) -> Result<UnixListener, String> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = socket_path.parent() {
        let existed = parent.exists();
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        // Never chmod a directory the user pointed us at (e.g. /tmp).
        if !existed || parent == crate::paths::run_dir() {
            let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
        }
    }
    if socket_path.exists() {
        std::fs::remove_file(socket_path).map_err(|e| e.to_string())?;
    }
    let listener = UnixListener::bind(socket_path).map_err(|e| e.to_string())?;
    let mode = socket_mode_from_env().unwrap_or(0o600);
    let _ = std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(mode));
    Ok(listener)
}

pub async fn serve<F>(
    socket_path: &Path,
    service: Arc<Service>,
    config: BridgeConfig,
    shutdown: F,
) -> Result<(), String>
where
    F: Future<Output = ()>,
{
    let listener = bind(socket_path)?;
    info!(socket = %socket_path.display(), "bridge listening");
    serve_listener(listener, service, config, shutdown).await;
    let _ = std::fs::remove_file(socket_path);
    info!("bridge stopped");
    Ok(())
}

/// Accept sessions until `shutdown` resolves.
pub async fn serve_listener<F>(
    listener: UnixListener,
    service: Arc<Service>,
    config: BridgeConfig,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    let purge_service = service.clone();
    let purge = tokio::spawn(async move {
        let mut tick = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tick.tick().await;
            let svc = purge_service.clone();
            let _ = tokio::task::spawn_blocking(move || svc.purge_expired_selections()).await;
        }
    });

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(handle_session(stream, service.clone(), config.clone()));
                }
                Err(err) => warn!(error = %err, "bridge accept failed"),
            },
        }
    }
    purge.abort();
}

async fn handle_session(stream: UnixStream, service: Arc<Service>, config: BridgeConfig) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Zeroizing<Vec<u8>>>();

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(err) = write_half.write_all(&line).await {
                debug!(error = %err, "bridge client went away mid-reply");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut lines = BufReader::new(read_half).lines();
    let mut client: Option<String> = None;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "bridge session read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame = match parse_client_frame(&line) {
            Ok(frame) => frame,
            Err((id, err)) => {
                let _ = tx.send(encode_reply::<()>(id, &Err(err)));
                continue;
            }
        };

        if client.is_none() {
            let BridgeRequest::Hello { client_id } = frame.request else {
                let err = FillError::new(ErrorCode::UnauthorizedClient, "hello required first");
                let _ = tx.send(encode_reply::<()>(frame.id, &Err(err)));
                break;
            };
            if !config.is_client_allowed(&client_id) {
                warn!(client_id = %client_id, "refusing unknown bridge client");
                let err = FillError::new(
                    ErrorCode::UnauthorizedClient,
                    format!("client '{}' is not allowed", client_id.trim()),
                );
                let _ = tx.send(encode_reply::<()>(frame.id, &Err(err)));
                break;
            }
            info!(client_id = %client_id, "bridge client connected");
            let _ = tx.send(encode_reply(frame.id, &Ok(hello_value())));
            client = Some(client_id);
            continue;
        }

        let service = service.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let id = frame.id;
            let op = frame.request.op();
            debug!(id, op, "bridge request");
            let line = tokio::task::spawn_blocking(move || dispatch(&service, id, frame.request))
                .await
                .unwrap_or_else(|err| {
                    encode_reply::<()>(id, &Err(FillError::unexpected(err.to_string())))
                });
            let _ = tx.send(line);
        });
    }

    if let Some(client_id) = client {
        info!(client_id = %client_id, "bridge client disconnected");
    }
    drop(tx);
    let _ = writer.await;
}

fn hello_value() -> serde_json::Value {
    json!({ "service": SERVICE_NAME, "version": env!("CARGO_PKG_VERSION") })
}

fn dispatch(service: &Service, id: u64, request: BridgeRequest) -> Zeroizing<Vec<u8>> {
    fn reply<T: serde::Serialize>(id: u64, result: FillResult<T>) -> Zeroizing<Vec<u8>> {
        encode_reply(id, &result)
    }

    match request {
        BridgeRequest::Hello { .. } => reply(id, Ok(hello_value())),
        BridgeRequest::GetCredentials { account_id } => {
            reply(id, service.get_credentials(&account_id))
        }
        BridgeRequest::GetAllMappings => reply(id, service.get_all_mappings()),
        BridgeRequest::ResolveOrigin { origin } => reply(id, service.resolve_summary(&origin)),
        BridgeRequest::SelectAccount {
            selection_id,
            account_id,
        } => reply(id, service.select_summary(&selection_id, &account_id)),
    }
}
