//! A participant's connection to the relay.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::relay::Relay;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to reach relay at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
}

/// Text in, text out. Dropping the link leaves the relay.
pub struct RelayLink {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<String>,
    pump: Option<JoinHandle<()>>,
    on_leave: Option<Box<dyn FnOnce() + Send>>,
}

impl RelayLink {
    pub(crate) fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
        pump: JoinHandle<()>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            pump: Some(pump),
            on_leave: None,
        }
    }

    /// Fire-and-forget; returns false once the link is gone.
    pub fn send(&self, text: String) -> bool {
        self.outbound.send(text).is_ok()
    }

    /// `None` once the relay connection is lost.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    pub fn leave(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(on_leave) = self.on_leave.take() {
            on_leave();
        }
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.leave();
    }
}

#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self) -> Result<RelayLink, LinkError>;
}

/// Connects to a relay server over WebSocket.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.relay_url.clone())
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RelayConnector for WsConnector {
    async fn connect(&self) -> Result<RelayLink, LinkError> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|source| LinkError::Connect {
                url: self.url.clone(),
                source,
            })?;
        info!(url = %self.url, "connected to relay");

        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = out_rx.recv() => match outbound {
                        Some(text) => {
                            if sink.send(Message::Text(text.into())).await.is_err() { break; }
                        }
                        None => break,
                    },
                    inbound = stream.next() => match inbound {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(text.as_str().to_owned()).is_err() { break; }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(%err, "relay socket error");
                            break;
                        }
                    },
                }
            }
            let _ = sink.close().await;
            debug!("relay socket closed");
        });

        Ok(RelayLink::new(out_tx, in_rx, pump))
    }
}

/// Joins an in-process relay; handy when both participants share a runtime.
pub struct LocalConnector {
    relay: Relay<String>,
}

impl LocalConnector {
    pub fn new(relay: Relay<String>) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl RelayConnector for LocalConnector {
    async fn connect(&self) -> Result<RelayLink, LinkError> {
        let relay = self.relay.clone();
        let (handle, mut relay_rx) = relay.join();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let pump_relay = relay.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = out_rx.recv() => match outbound {
                        Some(text) => { pump_relay.send(&handle, text); }
                        None => break,
                    },
                    inbound = relay_rx.recv() => match inbound {
                        Some(text) => {
                            if in_tx.send(text).is_err() { break; }
                        }
                        None => break,
                    },
                }
            }
            pump_relay.leave(&handle);
        });

        let mut link = RelayLink::new(out_tx, in_rx, pump);
        link.on_leave = Some(Box::new(move || {
            relay.leave(&handle);
        }));
        Ok(link)
    }
}
