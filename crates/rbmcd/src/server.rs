//! The daemon's published-object socket.
//!
//! One connection per client, newline-delimited JSON. A `Subscribe`
//! request turns the connection into a one-way signal stream fed from the
//! interface's broadcast channel; everything else is request/response.

use anyhow::{Context, Result};
use rbmc_common::bus::MAX_FRAME_SIZE;
use rbmc_common::ipc::{IpcError, Method, Request, Response, ResponseData};
use rbmc_common::paths;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::interface::RedundancyInterface;
use crate::manager::Manager;
use crate::redundancy::blocked;
use crate::shutdown::Shutdown;

pub async fn serve(
    manager: Arc<Manager>,
    interface: Arc<RedundancyInterface>,
    shutdown: Shutdown,
) -> Result<()> {
    let socket_path = Path::new(paths::RBMCD_SOCKET);

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    // A socket left behind by a previous run would make bind fail.
    let _ = std::fs::remove_file(socket_path);

    let listener =
        UnixListener::bind(socket_path).context("binding the redundancy object socket")?;
    info!(socket = %socket_path.display(), "Listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let manager = Arc::clone(&manager);
                        let interface = Arc::clone(&interface);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, manager, interface).await {
                                debug!(error = %e, "Client connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown.wait() => {
                info!("Shutting down the object socket");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    manager: Arc<Manager>,
    interface: Arc<RedundancyInterface>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }
        if n > MAX_FRAME_SIZE {
            warn!("Oversized request frame, dropping connection");
            return Ok(());
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Unparseable request");
                continue;
            }
        };

        if matches!(request.method, Method::Subscribe) {
            // The connection now belongs to the signal stream.
            return stream_signals(write_half, interface).await;
        }

        let result = dispatch(&manager, &interface, request.method).await;

        let response = Response {
            id: request.id,
            result,
        };
        let frame = serde_json::to_string(&response)? + "\n";
        write_half.write_all(frame.as_bytes()).await?;
    }
}

async fn dispatch(
    manager: &Arc<Manager>,
    interface: &Arc<RedundancyInterface>,
    method: Method,
) -> Result<ResponseData, IpcError> {
    match method {
        Method::GetProperties => Ok(ResponseData::Properties(interface.property_map())),

        Method::SetDisableRedundancyOverride { disable } => {
            if disable == interface.disable_redundancy_override() {
                return Ok(ResponseData::Ok);
            }

            info!(disable, "Request to change DisableRedundancyOverride");
            manager.disable_red_prop_changed(disable)?;
            interface.set_disable_redundancy_override(disable);
            Ok(ResponseData::Ok)
        }

        Method::StartFailover { force } => {
            let reason = manager.failover_blocked_reason(force).await?;
            let allowed = reason == blocked::Reason::None;
            if !allowed {
                info!(
                    reason = blocked::description(reason),
                    "Failover request blocked"
                );
            }
            Ok(ResponseData::FailoverResult {
                allowed,
                reason: (!allowed).then(|| blocked::description(reason).to_string()),
            })
        }

        Method::Subscribe => unreachable!("handled by the connection loop"),

        Method::SetDisableSync { .. } | Method::StartFullSync => Err(
            IpcError::InvalidRequest("not a redundancy object method".to_string()),
        ),
    }
}

async fn stream_signals(
    mut write_half: tokio::net::unix::OwnedWriteHalf,
    interface: Arc<RedundancyInterface>,
) -> Result<()> {
    use tokio::sync::broadcast::error::RecvError;

    let mut signals = interface.subscribe();

    loop {
        match signals.recv().await {
            Ok(signal) => {
                let frame = serde_json::to_string(&signal)? + "\n";
                if write_half.write_all(frame.as_bytes()).await.is_err() {
                    return Ok(());
                }
            }
            Err(RecvError::Lagged(missed)) => {
                // A stalled reader skips pulses; the next property change
                // still reaches it.
                debug!(missed, "Subscriber lagged behind the signal stream");
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}
