use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::time;
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::relay::Relay;

#[derive(Clone)]
pub struct AppState {
    relay: Relay<Message>,
    ping_interval: Duration,
}

pub fn router(config: &RelayConfig, relay: Relay<Message>) -> Router {
    let state = AppState {
        relay,
        ping_interval: config.ping_interval,
    };
    Router::new()
        .route(&config.path, get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut rx) = state.relay.join();
    info!(connection = %handle, peers = state.relay.len(), "participant connected");

    // Forward relayed frames to this socket, interleaved with keep-alive pings.
    let ping_every = state.ping_interval;
    let send_task = tokio::spawn(async move {
        let mut ping_interval = time::interval_at(time::Instant::now() + ping_every, ping_every);
        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    if sender.send(msg).await.is_err() { break; }
                }
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() { break; }
                }
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(_) | Message::Binary(_) => {
                let delivered = state.relay.send(&handle, msg);
                debug!(connection = %handle, delivered, "relayed frame");
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.relay.leave(&handle);
    send_task.abort();
    info!(connection = %handle, peers = state.relay.len(), "participant disconnected");
}
