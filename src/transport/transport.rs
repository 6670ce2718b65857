use super::{Connection, ServerSet, TransportEvent, TransportSender};
use crate::{transport::ws::WsConnection, Error, Result};
use rsip::SipMessage;
use std::sync::{Arc, Mutex};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Closed by the user; recovery will not run again.
    Closed,
}

struct WsTransportInner {
    servers: Mutex<ServerSet>,
    current: Mutex<Option<Connection>>,
    current_server: Mutex<Option<String>>,
    status: Mutex<TransportStatus>,
    events: TransportSender,
    cancel_token: CancellationToken,
    /// Frames submitted while a connect is in flight. Once a socket
    /// drops, retransmission belongs to the transaction layer, so the
    /// queue only survives across a single connect.
    pending: Mutex<Vec<SipMessage>>,
}

/// Owner of the one active WebSocket and the recovery policy over
/// the configured server set.
#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<WsTransportInner>,
}

impl WsTransport {
    pub fn new(servers: ServerSet, events: TransportSender, cancel_token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(WsTransportInner {
                servers: Mutex::new(servers),
                current: Mutex::new(None),
                current_server: Mutex::new(None),
                status: Mutex::new(TransportStatus::Disconnected),
                events,
                cancel_token,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn status(&self) -> TransportStatus {
        *self.inner.status.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == TransportStatus::Connected
    }

    pub fn current_server(&self) -> Option<String> {
        self.inner.current_server.lock().unwrap().clone()
    }

    /// Launch the connect/recovery loop in the background.
    pub fn spawn(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            this.recovery_loop().await;
        });
    }

    pub async fn send(&self, msg: SipMessage) -> Result<()> {
        let connection = {
            let status = *self.inner.status.lock().unwrap();
            match status {
                TransportStatus::Connected => self.inner.current.lock().unwrap().clone(),
                TransportStatus::Connecting => {
                    self.inner.pending.lock().unwrap().push(msg);
                    return Ok(());
                }
                _ => None,
            }
        };
        match connection {
            Some(connection) => connection.send(msg).await,
            None => Err(Error::Transport("transport is not connected".to_string())),
        }
    }

    /// Close the socket and stop recovery. Used by `UA.stop()`.
    pub async fn shutdown(&self) {
        *self.inner.status.lock().unwrap() = TransportStatus::Closed;
        self.inner.cancel_token.cancel();
        let current = self.inner.current.lock().unwrap().take();
        if let Some(connection) = current {
            connection.close().await;
        }
    }

    /// Drive a single established connection until it closes. The
    /// recovery loop calls this for real sockets; tests call it
    /// directly with a channel connection.
    pub async fn serve_connection(&self, connection: Connection, server: Option<String>) {
        {
            let mut current = self.inner.current.lock().unwrap();
            current.replace(connection.clone());
            *self.inner.current_server.lock().unwrap() = server;
            *self.inner.status.lock().unwrap() = TransportStatus::Connected;
            self.inner.servers.lock().unwrap().on_connect();
        }
        self.inner.events.send(TransportEvent::Connected).ok();

        let queued: Vec<SipMessage> = self.inner.pending.lock().unwrap().drain(..).collect();
        for msg in queued {
            if let Err(e) = connection.send(msg).await {
                warn!("failed to flush queued frame: {}", e);
            }
        }

        let reason = select! {
            _ = self.inner.cancel_token.cancelled() => None,
            reason = connection.serve_loop(self.inner.events.clone()) => reason,
        };

        let user_closed = {
            let mut status = self.inner.status.lock().unwrap();
            let user_closed = *status == TransportStatus::Closed;
            if !user_closed {
                *status = TransportStatus::Disconnected;
            }
            self.inner.current.lock().unwrap().take();
            user_closed
        };
        info!("connection finished, reason: {:?}", reason);
        self.inner
            .events
            .send(TransportEvent::Closed(if user_closed { None } else { reason }))
            .ok();
    }

    async fn recovery_loop(&self) {
        loop {
            if self.inner.cancel_token.is_cancelled()
                || self.status() == TransportStatus::Closed
            {
                break;
            }

            let picked = self.inner.servers.lock().unwrap().pick();
            let ws_uri = match picked {
                Some(ws_uri) => ws_uri,
                None => {
                    let wait = {
                        let mut servers = self.inner.servers.lock().unwrap();
                        servers.reset_pool();
                        servers.next_retry()
                    };
                    info!("every server failed, retrying in {:?}", wait);
                    select! {
                        _ = self.inner.cancel_token.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    continue;
                }
            };

            *self.inner.status.lock().unwrap() = TransportStatus::Connecting;
            info!("connecting to {}", ws_uri);
            match WsConnection::connect(&ws_uri).await {
                Ok(connection) => {
                    self.serve_connection(connection.into(), Some(ws_uri)).await;
                    if self.status() == TransportStatus::Closed {
                        break;
                    }
                }
                Err(e) => {
                    warn!("connect to {} failed: {}", ws_uri, e);
                    {
                        let mut status = self.inner.status.lock().unwrap();
                        if *status == TransportStatus::Connecting {
                            *status = TransportStatus::Disconnected;
                        }
                    }
                    self.inner.servers.lock().unwrap().mark_error(&ws_uri);
                    self.inner.pending.lock().unwrap().clear();
                    self.inner
                        .events
                        .send(TransportEvent::Error(e.to_string()))
                        .ok();
                }
            }
        }
    }
}
