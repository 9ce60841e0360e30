use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use tailcast_resolver::LogPathResolver;
use tailcast_tail::{FileTailTracker, TailSubscription, render_lines};
use tailcast_types::{ClientMessage, ConnectionId, ServerMessage};

use crate::config::ServerConfig;
use crate::query::{Rejection, parse_selector};
use crate::registry::{ConnectionInfo, ConnectionRegistry, Subscription};

type Socket = WebSocketStream<TcpStream>;

/// How long a rejected peer gets to acknowledge the close frame
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Accepts subscribers and pushes their log stream to them.
///
/// Cloning yields another handle to the same registry and shutdown signal.
#[derive(Clone)]
pub struct Broadcaster {
    tracker: FileTailTracker,
    resolver: Arc<dyn LogPathResolver>,
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Broadcaster {
    pub fn new(
        tracker: FileTailTracker,
        resolver: Arc<dyn LogPathResolver>,
        config: ServerConfig,
    ) -> Self {
        Self {
            tracker,
            resolver,
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn tracker(&self) -> &FileTailTracker {
        &self.tracker
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.snapshot()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Bind a listener for `serve`
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .context("Failed to bind streaming listener")
    }

    /// Accept connections until `shutdown_all` is called.
    ///
    /// The listener is dropped when this returns.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        tracing::info!(%addr, endpoint = %self.config.endpoint, "Stream endpoint ready");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let this = self.clone();
                            self.tasks.spawn(async move {
                                this.handle_connection(stream, peer).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        tracing::info!(%addr, "Stream endpoint closed");
        Ok(())
    }

    /// Stop every watch, close every connection and release the acceptor
    pub fn shutdown_all(&self) {
        self.shutdown.cancel();

        let drained = self.registry.drain();
        let count = drained.len();
        for (id, subscription) in drained {
            self.tracker
                .stop_watch(&subscription.path, subscription.subscriber);
            subscription.cancel.cancel();
            tracing::debug!(connection = %id, "Connection closed by shutdown");
        }
        tracing::info!(connections = count, "All connections closed");
    }

    /// Wait for connection tasks to finish after `shutdown_all`.
    ///
    /// Returns false if some were still writing their close frame when
    /// `grace` ran out.
    pub async fn wait_closed(&self, grace: Duration) -> bool {
        self.tasks.close();
        let finished = tokio::time::timeout(grace, self.tasks.wait()).await.is_ok();
        if !finished {
            tracing::warn!(pending = self.tasks.len(), "Connections still open after grace period");
        }
        finished
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let endpoint = self.config.endpoint.as_str();
        let mut requested: Option<Uri> = None;

        let handshake = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                if request.uri().path() != endpoint {
                    let mut not_found = ErrorResponse::new(Some("not found".to_string()));
                    *not_found.status_mut() = StatusCode::NOT_FOUND;
                    return Err(not_found);
                }
                requested = Some(request.uri().clone());
                Ok(response)
            },
        )
        .await;

        let mut ws = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "WebSocket handshake failed");
                return;
            }
        };
        let Some(uri) = requested else {
            return;
        };
        tracing::debug!(%peer, %uri, "New WebSocket connection");

        let selector = match parse_selector(uri.query()) {
            Ok(selector) => selector,
            Err(rejection) => {
                reject(ws, rejection).await;
                return;
            }
        };

        let path = match self.resolver.resolve(&selector).await {
            Ok(path) => path,
            Err(e) if e.is_not_found() => {
                tracing::warn!(%selector, error = %e, "Unknown process requested");
                reject(ws, Rejection::ProcessNotFound).await;
                return;
            }
            Err(e) => {
                tracing::error!(%selector, error = %e, "Failed to resolve process");
                reject(ws, Rejection::ResolveFailed).await;
                return;
            }
        };

        let id = ConnectionId::generate(&selector);
        let cancel = self.shutdown.child_token();
        let mut tail = match self.tracker.begin_watch(&path) {
            Ok(tail) => tail,
            Err(e) => {
                tracing::error!(%selector, path = %path.display(), error = %e, "Failed to watch log file");
                reject(ws, Rejection::WatchFailed).await;
                return;
            }
        };
        self.registry.insert(
            id.clone(),
            Subscription {
                selector: selector.clone(),
                path: tail.path().to_path_buf(),
                subscriber: tail.id(),
                connected_at: Utc::now(),
                cancel: cancel.clone(),
            },
        );
        tracing::info!(connection = %id, path = %path.display(), "Subscriber connected");

        match send(&mut ws, &ServerMessage::connected(&selector)).await {
            Ok(()) => self.stream(&mut ws, &mut tail, &id, &cancel).await,
            Err(e) => tracing::warn!(connection = %id, error = %e, "Failed to acknowledge subscriber"),
        }

        self.release(&id);
        drop(tail);
    }

    /// Pump log chunks out and control messages in until the connection ends
    async fn stream(
        &self,
        ws: &mut Socket,
        tail: &mut TailSubscription,
        id: &ConnectionId,
        cancel: &CancellationToken,
    ) {
        let mut heartbeat = self.config.heartbeat_interval.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let frame = CloseFrame {
                        code: CloseCode::Away,
                        reason: "server shutting down".into(),
                    };
                    if let Err(e) = ws.close(Some(frame)).await {
                        tracing::debug!(connection = %id, error = %e, "Close on shutdown failed");
                    }
                    break;
                }

                chunk = tail.recv() => {
                    let Some(chunk) = chunk else {
                        tracing::debug!(connection = %id, "Tail closed");
                        break;
                    };
                    let message = ServerMessage::Log { data: render_lines(&chunk.lines) };
                    if let Err(e) = send(ws, &message).await {
                        tracing::warn!(connection = %id, error = %e, "Failed to send log chunk");
                        break;
                    }
                }

                incoming = ws.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = Self::on_text(ws, id, &text).await {
                                tracing::warn!(connection = %id, error = %e, "Failed to reply");
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::debug!(connection = %id, ?frame, "Client closed connection");
                            let _ = ws.close(None).await;
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(connection = %id, error = %e, "WebSocket error");
                            break;
                        }
                        None => break,
                    }
                }

                _ = tick(heartbeat.as_mut()) => {
                    if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                        tracing::warn!(connection = %id, error = %e, "Heartbeat failed");
                        break;
                    }
                }
            }
        }
    }

    async fn on_text(ws: &mut Socket, id: &ConnectionId, text: &str) -> Result<(), WsError> {
        match ClientMessage::parse(text) {
            Ok(ClientMessage::Ping) => send(ws, &ServerMessage::Pong).await,
            Ok(ClientMessage::Unknown) => {
                tracing::debug!(connection = %id, "Ignoring unrecognised message");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(connection = %id, error = %e, "Malformed client message");
                Ok(())
            }
        }
    }

    /// Tear down a connection's subscription if nobody has yet
    fn release(&self, id: &ConnectionId) {
        if let Some(subscription) = self.registry.remove(id) {
            self.tracker
                .stop_watch(&subscription.path, subscription.subscriber);
            tracing::info!(connection = %id, selector = %subscription.selector, "Subscriber disconnected");
        }
    }
}

async fn send(ws: &mut Socket, message: &ServerMessage) -> Result<(), WsError> {
    ws.send(Message::Text(message.to_json())).await
}

async fn reject(mut ws: Socket, rejection: Rejection) {
    tracing::warn!(reason = rejection.reason(), "Rejecting subscription");
    let frame = CloseFrame {
        code: rejection.close_code(),
        reason: rejection.reason().into(),
    };
    if ws.close(Some(frame)).await.is_err() {
        return;
    }
    // Let the peer complete the closing handshake.
    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}

async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
