use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::relay::{Connection, RelayState};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct AppState {
    relay: RelayState,
    metrics: Option<PrometheusHandle>,
    shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn relay(&self) -> &RelayState {
        &self.relay
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then close every live WebSocket.
pub async fn serve<F>(
    listener: TcpListener,
    relay: RelayState,
    metrics: Option<PrometheusHandle>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState {
        relay,
        metrics,
        shutdown: shutdown_rx,
    });
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            shutdown_tx.send_replace(true);
        })
        .await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "clients": state.relay.client_count() }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let mut conn = Connection::new(outbound_tx);
    let connection_id = conn.id();
    let mut shutdown = state.shutdown.clone();

    counter!("callbox_relay_connections_total", 1);
    info!(connection_id = %connection_id, "websocket connected");

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => {
                info!(connection_id = %connection_id, "relay shutting down, closing websocket");
                break;
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    state.relay.handle_text(&mut conn, &text);
                    gauge!("callbox_relay_clients_registered", state.relay.client_count() as f64);
                }
                Some(Ok(Message::Binary(data))) => {
                    state.relay.handle_binary(&mut conn, data);
                    gauge!("callbox_relay_clients_registered", state.relay.client_count() as f64);
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(
                        connection_id = %connection_id,
                        client_id = ?conn.client_id(),
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "client closed websocket"
                    );
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    warn!(connection_id = %connection_id, error = %err, "error receiving message");
                    break;
                }
                None => break,
            }
        }
    }

    state.relay.disconnect(&conn);
    drop(conn);
    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        abort.abort();
    }
    gauge!("callbox_relay_clients_registered", state.relay.client_count() as f64);
    info!(connection_id = %connection_id, "websocket closed");
}
