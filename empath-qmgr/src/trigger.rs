//! Trigger / control surface (C10).
//!
//! Accepts the one-byte trigger alphabet (`D`/`I`/`A`/`F`/`W`) over a Unix
//! domain socket, coalescing a whole buffer's worth of bytes per read the
//! way `qmgr_trigger_event` does, and a companion read-only introspection
//! query framed the way `empath-control`'s `ControlServer` frames its own
//! request/response protocol (4-byte-BE length prefix + `bincode` body).

use std::{path::Path, sync::Arc, time::Duration};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use empath_common::Signal;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    sync::broadcast,
};
use tracing::{debug, error, info, trace, warn};

use crate::scanner::ScanFlags;
use crate::service::{DestinationSnapshot, EngineQueryService};

/// A trigger request, decoded from one byte of the incoming buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    ScanIncoming,
    ScanDeferred,
    ScanAll,
    FlushDead,
}

/// Parses one trigger byte. `W` (wakeup) is treated as `I`. Unknown bytes
/// yield `None` and are silently ignored.
#[must_use]
pub fn parse_trigger(byte: u8) -> Option<Trigger> {
    match byte {
        b'D' => Some(Trigger::ScanDeferred),
        b'I' | b'W' => Some(Trigger::ScanIncoming),
        b'A' => Some(Trigger::ScanAll),
        b'F' => Some(Trigger::FlushDead),
        _ => None,
    }
}

/// Coalesces one buffer's worth of trigger bytes: duplicates collapse,
/// and `SCAN_ALL`/`FLUSH_DEAD` are surfaced ahead of the scan-start
/// triggers regardless of byte order within the buffer.
#[must_use]
pub fn coalesce(buffer: &[u8]) -> Vec<Trigger> {
    let mut seen = [false; 4];
    let mut out = Vec::new();
    for &byte in buffer {
        if let Some(trigger) = parse_trigger(byte) {
            let idx = trigger as usize;
            if !seen[idx] {
                seen[idx] = true;
                out.push(trigger);
            }
        }
    }
    out.sort_by_key(|t| match t {
        Trigger::ScanAll | Trigger::FlushDead => 0,
        Trigger::ScanIncoming | Trigger::ScanDeferred => 1,
    });
    out
}

/// Read-only introspection request/response, carried over the same
/// socket as a length-prefixed `bincode` frame whenever the first byte of
/// a read is `\0` (none of the trigger bytes collide with it).
#[derive(Debug, Serialize, Deserialize)]
pub enum IntrospectRequest {
    QueueDepth,
    JobStackDepth { transport: String },
    Destinations { transport: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum IntrospectResponse {
    QueueDepth(usize),
    JobStackDepth(usize),
    Destinations(Vec<DestinationSnapshot>),
    Error(String),
}

pub struct TriggerServer {
    socket_path: String,
    engine: Arc<dyn EngineQueryService>,
}

impl TriggerServer {
    #[must_use]
    pub fn new(socket_path: impl Into<String>, engine: Arc<dyn EngineQueryService>) -> Self {
        Self { socket_path: socket_path.into(), engine }
    }

    /// Runs until a shutdown signal arrives, mirroring
    /// `empath-control::ControlServer::serve`'s stale-socket handling,
    /// permission hardening, and `tokio::select!` shape.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be bound.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> std::io::Result<()> {
        let socket_path = Path::new(&self.socket_path);
        if socket_path.exists() {
            if UnixStream::connect(socket_path).await.is_ok() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!("trigger socket already in use: {}", self.socket_path),
                ));
            }
            info!("removing stale trigger socket: {}", self.socket_path);
            tokio::fs::remove_file(socket_path).await?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            let metadata = tokio::fs::metadata(&self.socket_path).await?;
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            tokio::fs::set_permissions(&self.socket_path, perms).await?;
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let engine = Arc::clone(&self.engine);
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, engine).await {
                                    error!("error handling trigger connection: {e}");
                                }
                            });
                        }
                        Err(e) => error!("error accepting trigger connection: {e}"),
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            info!("trigger server shutting down");
                            break;
                        }
                        Err(e) => {
                            error!("trigger server shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        if socket_path.exists() {
            debug!("removing trigger socket: {}", self.socket_path);
            let _ = tokio::fs::remove_file(socket_path).await;
        }

        Ok(())
    }

    async fn handle_connection(mut stream: UnixStream, engine: Arc<dyn EngineQueryService>) -> std::io::Result<()> {
        let timeout = Duration::from_secs(30);
        let mut buf = [0u8; 4096];
        let n = tokio::time::timeout(timeout, stream.read(&mut buf)).await??;
        if n == 0 {
            return Ok(());
        }

        if buf[0] == 0 {
            Self::handle_introspection(&mut stream, &buf[1..n], engine.as_ref()).await?;
            return Ok(());
        }

        let triggers = coalesce(&buf[..n]);
        trace!("coalesced {} trigger(s) from buffer", triggers.len());
        for trigger in triggers {
            engine.handle_trigger(trigger);
        }
        Ok(())
    }

    async fn handle_introspection(
        stream: &mut UnixStream,
        request_bytes: &[u8],
        engine: &dyn EngineQueryService,
    ) -> std::io::Result<()> {
        let Ok((request, _)) =
            bincode::serde::decode_from_slice::<IntrospectRequest, _>(request_bytes, bincode::config::legacy())
        else {
            warn!("malformed introspection request");
            return Ok(());
        };

        let response = match request {
            IntrospectRequest::QueueDepth => IntrospectResponse::QueueDepth(engine.active_count()),
            IntrospectRequest::JobStackDepth { transport } => {
                IntrospectResponse::JobStackDepth(engine.job_stack_depth(&transport))
            }
            IntrospectRequest::Destinations { transport } => {
                IntrospectResponse::Destinations(engine.destinations(&transport))
            }
        };

        let bytes = bincode::serde::encode_to_vec(&response, bincode::config::legacy())
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let len = u32::try_from(bytes.len()).map_err(std::io::Error::other)?;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&bytes).await?;
        stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_bytes_are_ignored() {
        assert_eq!(parse_trigger(b'x'), None);
    }

    #[test]
    fn wakeup_is_treated_as_incoming_scan() {
        assert_eq!(parse_trigger(b'W'), Some(Trigger::ScanIncoming));
    }

    #[test]
    fn coalescing_drops_duplicates_and_orders_modifiers_first() {
        let triggers = coalesce(b"IIDAF?");
        assert_eq!(
            triggers,
            vec![Trigger::ScanAll, Trigger::FlushDead, Trigger::ScanIncoming, Trigger::ScanDeferred]
        );
    }
}
