//! WebSocket endpoint for snapshot subscribers

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::broadcast::HubHandle;
use crate::errors::TelemetryError;

pub fn router(hub: HubHandle) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(hub)
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<HubHandle>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: HubHandle) {
    let (id, mut frames) = match hub.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            error!("Rejecting WebSocket client: {}", e);
            return;
        }
    };
    info!(%id, "WebSocket connected");

    let (mut sink, mut stream) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                debug!(%id, "WebSocket sink closed");
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%id, "WebSocket receive error: {}", e);
                break;
            }
        }
    }

    hub.unsubscribe(id).await;
    send_task.abort();
    info!(%id, "WebSocket disconnected");
}

/// Serve the router until cancelled
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    cancel: CancellationToken,
) -> Result<(), TelemetryError> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "Broadcast server listening");
    serve_on(listener, router, cancel).await
}

pub async fn serve_on(
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
) -> Result<(), TelemetryError> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
