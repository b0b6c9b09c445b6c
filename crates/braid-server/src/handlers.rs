//! Websocket and HTTP handlers for the braid server.
//!
//! Each accepted websocket gets a [`SocketHandle`] registered with the
//! engine. A writer task drains the handle's queue into the websocket while
//! the read loop feeds binary frames to the engine.

use crate::config::Config;
use crate::metrics::{self, SocketMetricsGuard};
use crate::server::Server;
use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use braid_protocol::SocketId;
use braid_transport::{FrameReceiver, OutboundFrame, SocketHandle};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Build the router serving websockets at `path` and `/health`.
pub fn router(server: Server, path: &str) -> Router {
    Router::new()
        .route(path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(server)
}

/// Serve `server` on `listener` until `shutdown` resolves, then close it.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn serve(
    listener: TcpListener,
    server: Server,
    path: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(server.clone(), path);
    let closing = server.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        closing.close().await;
    })
    .await?;
    Ok(())
}

/// Run the braid server until ctrl-c.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let server = Server::new(config.server_config());
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!(peer = %server.id(), "Braid server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    for peer in &config.peer.connect {
        server.connect_in_background(peer.address.clone(), peer.credentials.clone());
    }

    serve(
        listener,
        server,
        &config.transport.websocket_path,
        shutdown_signal(),
    )
    .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Health check handler.
async fn health_handler(State(server): State<Server>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "peer_id": server.id().0,
        "peers": server.connected_peers().len(),
        "sockets": server.socket_count(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(server): State<Server>,
) -> impl IntoResponse {
    // Multipart containers may exceed the payload limit by their envelope.
    let max_frame = server.config().limits.max_payload + 1024;
    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| handle_websocket(socket, remote, server))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, remote: SocketAddr, server: Server) {
    let _metrics_guard = SocketMetricsGuard::new();

    let socket_id = SocketId::generate();
    let (handle, frames) =
        SocketHandle::channel(socket_id, Some(remote.ip()), server.config().limits);
    debug!(socket = %socket_id, remote = %remote, "WebSocket connected");

    let (sender, mut receiver) = socket.split();
    let mut writer = tokio::spawn(write_frames(sender, frames));
    server.add_socket(handle.clone());

    loop {
        tokio::select! {
            _ = &mut writer => {
                debug!(socket = %socket_id, "Writer finished");
                break;
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        server.handle_socket_frame(socket_id, Bytes::from(data));
                    }
                    Some(Ok(Message::Text(_))) => {
                        warn!(socket = %socket_id, "Ignoring text frame");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(socket = %socket_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(socket = %socket_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(socket = %socket_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    server.remove_socket(socket_id);
    handle.close(braid_transport::codes::ABNORMAL, "Connection ended");
    writer.abort();
    debug!(socket = %socket_id, "WebSocket disconnected");
}

/// Drain queued frames into the websocket until a close frame or an error.
async fn write_frames(mut sender: SplitSink<WebSocket, Message>, mut frames: FrameReceiver) {
    while let Some(frame) = frames.recv().await {
        let message = match &frame {
            OutboundFrame::Binary(data) => Message::Binary(data.to_vec()),
            OutboundFrame::Ping => Message::Ping(Vec::new()),
            OutboundFrame::Close { code, reason } => {
                if !frame.is_terminal_only() {
                    let close = CloseFrame {
                        code: *code,
                        reason: reason.clone().into(),
                    };
                    let _ = sender.send(Message::Close(Some(close))).await;
                }
                let _ = sender.close().await;
                return;
            }
        };
        let result = sender.send(message).await;
        frames.sent(&frame);
        if result.is_err() {
            return;
        }
    }
}
