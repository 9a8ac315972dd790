//! Call lifecycle: `idle -> calling -> in-progress -> idle`.
//!
//! Each call attempt gets its own relay link, connection and
//! [`NegotiationEngine`], all owned by one task. Every way a call can end,
//! including a failure halfway through setup, goes through
//! [`CallResources::teardown`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::{CapabilityError, CapabilityEvents, ConnectionFactory};
use crate::engine::{EndReason, EngineEvent, NegotiationEngine, Notice};
use crate::link::{LinkError, RelayConnector, RelayLink};
use crate::protocol::{ParticipantId, SignalingEnvelope};

pub const CHANNEL_LABEL: &str = "messages";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    Calling,
    InProgress,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call is already active")]
    AlreadyActive,
    #[error("no call in progress")]
    NotInProgress,
    #[error("media acquisition failed: {0}")]
    Media(String),
    #[error(transparent)]
    Relay(#[from] LinkError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

/// Local capture devices. Outside the negotiation core; only its lifetime matters here.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn LocalMedia>, CallError>;
}

pub trait LocalMedia: Send {
    fn stop(&mut self);
}

#[derive(Default)]
struct CallResources {
    media: Option<Box<dyn LocalMedia>>,
    link: Option<RelayLink>,
    engine: Option<NegotiationEngine>,
}

impl CallResources {
    /// Safe to run on partially built calls and safe to run twice.
    async fn teardown(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.close().await;
        }
        if let Some(mut media) = self.media.take() {
            media.stop();
        }
        if let Some(mut link) = self.link.take() {
            link.leave();
        }
    }
}

struct ActiveCall {
    local_id: ParticipantId,
    cancel: CancellationToken,
    outgoing: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

pub struct SessionController {
    connector: Arc<dyn RelayConnector>,
    factory: Arc<dyn ConnectionFactory>,
    media: Arc<dyn MediaDevices>,
    status: Arc<watch::Sender<CallStatus>>,
    messages: broadcast::Sender<Bytes>,
    active: Option<ActiveCall>,
}

impl SessionController {
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        factory: Arc<dyn ConnectionFactory>,
        media: Arc<dyn MediaDevices>,
    ) -> Self {
        let (status, _) = watch::channel(CallStatus::Idle);
        let (messages, _) = broadcast::channel(64);
        Self {
            connector,
            factory,
            media,
            status: Arc::new(status),
            messages,
            active: None,
        }
    }

    pub fn status(&self) -> watch::Receiver<CallStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<Bytes> {
        self.messages.subscribe()
    }

    /// `None` once the call has ended, even before the next `start_call`.
    pub fn local_id(&self) -> Option<&ParticipantId> {
        self.active
            .as_ref()
            .filter(|call| !call.task.is_finished())
            .map(|call| &call.local_id)
    }

    pub async fn start_call(&mut self) -> Result<ParticipantId, CallError> {
        if let Some(call) = self.active.take_if(|call| call.task.is_finished()) {
            let _ = call.task.await;
        }
        if self.active.is_some() {
            return Err(CallError::AlreadyActive);
        }

        let local_id = ParticipantId::random();
        self.status.send_replace(CallStatus::Calling);
        info!(local = %local_id, "starting call");

        let mut resources = CallResources::default();
        let events = match self.prepare(&local_id, &mut resources).await {
            Ok(events) => events,
            Err(err) => {
                warn!(local = %local_id, %err, "call setup failed");
                resources.teardown().await;
                self.status.send_replace(CallStatus::Idle);
                return Err(err);
            }
        };

        let cancel = CancellationToken::new();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_call(
            resources,
            events,
            outgoing_rx,
            cancel.clone(),
            self.status.clone(),
            self.messages.clone(),
        ));
        self.active = Some(ActiveCall {
            local_id: local_id.clone(),
            cancel,
            outgoing,
            task,
        });
        Ok(local_id)
    }

    async fn prepare(
        &self,
        local_id: &ParticipantId,
        resources: &mut CallResources,
    ) -> Result<CapabilityEvents, CallError> {
        resources.media = Some(self.media.acquire().await?);
        resources.link = Some(self.connector.connect().await?);
        let (connection, events) = self.factory.create()?;
        resources.engine = Some(NegotiationEngine::new(local_id.clone(), connection.clone()));
        // Opening the channel is what makes the connection ask for negotiation.
        connection.open_data_channel(CHANNEL_LABEL).await?;
        Ok(events)
    }

    /// No-op when no call is active.
    pub async fn end_call(&mut self) {
        if let Some(call) = self.active.take() {
            call.cancel.cancel();
            if let Err(err) = call.task.await {
                warn!(%err, "call task did not finish cleanly");
            }
        }
        self.status.send_replace(CallStatus::Idle);
    }

    pub fn send_application_message(&self, payload: Bytes) -> Result<(), CallError> {
        if *self.status.borrow() != CallStatus::InProgress {
            return Err(CallError::NotInProgress);
        }
        let call = self.active.as_ref().ok_or(CallError::NotInProgress)?;
        call.outgoing
            .send(payload)
            .map_err(|_| CallError::NotInProgress)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(call) = &self.active {
            call.cancel.cancel();
        }
    }
}

async fn run_call(
    mut resources: CallResources,
    mut events: CapabilityEvents,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
    status: Arc<watch::Sender<CallStatus>>,
    messages: broadcast::Sender<Bytes>,
) {
    let reason = match (resources.engine.as_mut(), resources.link.as_mut()) {
        (Some(engine), Some(link)) => {
            drive(engine, link, &mut events, &mut outgoing, &cancel, &status, &messages).await
        }
        _ => EndReason::Hangup,
    };
    info!(?reason, "call ended");
    resources.teardown().await;
    status.send_replace(CallStatus::Idle);
}

async fn drive(
    engine: &mut NegotiationEngine,
    link: &mut RelayLink,
    events: &mut CapabilityEvents,
    outgoing: &mut mpsc::UnboundedReceiver<Bytes>,
    cancel: &CancellationToken,
    status: &watch::Sender<CallStatus>,
    messages: &broadcast::Sender<Bytes>,
) -> EndReason {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return EndReason::Hangup,
            Some(event) = events.recv() => EngineEvent::Capability(event),
            inbound = link.recv() => match inbound {
                Some(text) => match SignalingEnvelope::decode(&text) {
                    Ok(envelope) => EngineEvent::Envelope(envelope),
                    Err(err) => {
                        warn!(%err, "dropping undecodable relay message");
                        continue;
                    }
                },
                None => return EndReason::RelayLost,
            },
            Some(payload) = outgoing.recv() => {
                if let Err(err) = engine.send_application_data(payload).await {
                    warn!(%err, "failed to send application message");
                }
                continue;
            }
        };

        // Hangup never waits on a suspended connection call.
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => return EndReason::Hangup,
            step = engine.handle(event) => step,
        };

        for envelope in step.outbound {
            match envelope.encode() {
                Ok(text) => {
                    if !link.send(text) {
                        return EndReason::RelayLost;
                    }
                }
                Err(err) => warn!(%err, "failed to encode envelope"),
            }
        }
        for notice in step.notices {
            match notice {
                Notice::ChannelOpened(label) => {
                    debug!(%label, "call in progress");
                    status.send_replace(CallStatus::InProgress);
                }
                Notice::Message(payload) => {
                    let _ = messages.send(payload);
                }
                Notice::Ended(reason) => return reason,
            }
        }
    }
}
