//! Perfect-negotiation state machine.
//!
//! One [`NegotiationEngine`] lives for exactly one call. It is fed discrete
//! events, one at a time, from two independent sources: the connection's own
//! callbacks and envelopes arriving over the relay. Each call to
//! [`NegotiationEngine::handle`] runs to completion and returns the envelopes
//! to publish plus anything the session needs to know about.
//!
//! Collisions are resolved without a coordinator. Both sides derive a
//! [`Role`] from their two ids; on simultaneous offers the polite side rolls
//! back its own and accepts the remote one, the impolite side drops the
//! remote offer and keeps its own.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::capability::{
    CapabilityError, CapabilityEvent, ConnectionPhase, PeerConnection, SignalingPhase,
};
use crate::protocol::{
    DescriptionKind, ParticipantId, PathCandidate, SessionDescription, SignalingEnvelope,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Polite,
    Impolite,
}

impl Role {
    /// The side whose id sorts after the other's is polite.
    pub fn between(local: &ParticipantId, remote: &ParticipantId) -> Self {
        if local > remote {
            Role::Polite
        } else {
            Role::Impolite
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NegotiationState {
    pub making_offer: bool,
    pub ignore_offer: bool,
    pub signaling_phase: SignalingPhase,
    pub connection_phase: ConnectionPhase,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Capability(CapabilityEvent),
    Envelope(SignalingEnvelope),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Hangup,
    Disconnected,
    ConnectionClosed,
    RelayLost,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    ChannelOpened(String),
    Message(Bytes),
    Ended(EndReason),
}

/// Outcome of a single transition.
#[derive(Debug, Default)]
pub struct Step {
    pub outbound: Vec<SignalingEnvelope>,
    pub notices: Vec<Notice>,
}

pub struct NegotiationEngine {
    local_id: ParticipantId,
    remote: Option<(ParticipantId, Role)>,
    state: NegotiationState,
    renegotiate_when_stable: bool,
    // Last offer applied locally; re-sent while it is still pending.
    local_offer: Option<SessionDescription>,
    // Released on teardown; every later event becomes a no-op.
    connection: Option<Arc<dyn PeerConnection>>,
}

impl NegotiationEngine {
    pub fn new(local_id: ParticipantId, connection: Arc<dyn PeerConnection>) -> Self {
        Self {
            local_id,
            remote: None,
            state: NegotiationState::default(),
            renegotiate_when_stable: false,
            local_offer: None,
            connection: Some(connection),
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.remote.as_ref().map(|(_, role)| *role)
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_none()
    }

    pub async fn handle(&mut self, event: EngineEvent) -> Step {
        let mut step = Step::default();
        let Some(connection) = self.connection.clone() else {
            trace!(?event, "engine torn down, dropping event");
            return step;
        };
        let connection = connection.as_ref();

        match event {
            EngineEvent::Capability(event) => self.on_capability(connection, event, &mut step).await,
            EngineEvent::Envelope(envelope) => self.on_envelope(connection, envelope, &mut step).await,
        }

        let ended = step
            .notices
            .iter()
            .any(|notice| matches!(notice, Notice::Ended(_)));
        self.sync_phase(connection);
        if self.renegotiate_when_stable && !ended && !self.offer_in_flight() {
            self.renegotiate_when_stable = false;
            debug!(local = %self.local_id, "running deferred renegotiation");
            self.make_offer(connection, &mut step).await;
        }
        step
    }

    pub async fn send_application_data(&self, payload: Bytes) -> Result<(), CapabilityError> {
        match &self.connection {
            Some(connection) => connection.send_data(payload).await,
            None => Err(CapabilityError::Closed),
        }
    }

    /// Idempotent: the connection is closed at most once.
    pub async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
            self.state = NegotiationState {
                connection_phase: ConnectionPhase::Closed,
                ..NegotiationState::default()
            };
            self.renegotiate_when_stable = false;
            self.local_offer = None;
            info!(local = %self.local_id, "negotiation engine closed");
        }
    }

    fn offer_in_flight(&self) -> bool {
        self.state.making_offer || self.state.signaling_phase == SignalingPhase::HaveLocalOffer
    }

    fn sync_phase(&mut self, connection: &dyn PeerConnection) {
        self.state.signaling_phase = connection.signaling_phase();
    }

    fn role_for(&mut self, remote: &ParticipantId) -> Role {
        if let Some((known, role)) = &self.remote {
            if known == remote {
                return *role;
            }
            warn!(%known, %remote, "remote participant changed mid-call");
        }
        let role = Role::between(&self.local_id, remote);
        info!(local = %self.local_id, %remote, ?role, "negotiation role assigned");
        self.remote = Some((remote.clone(), role));
        role
    }

    fn envelope(&self, description: SessionDescription) -> SignalingEnvelope {
        SignalingEnvelope::Description {
            sender: self.local_id.clone(),
            description,
        }
    }

    async fn on_capability(
        &mut self,
        connection: &dyn PeerConnection,
        event: CapabilityEvent,
        step: &mut Step,
    ) {
        match event {
            CapabilityEvent::NegotiationNeeded => {
                self.sync_phase(connection);
                if self.offer_in_flight() {
                    debug!(local = %self.local_id, "offer already in flight, deferring renegotiation");
                    self.renegotiate_when_stable = true;
                    return;
                }
                self.make_offer(connection, step).await;
            }
            CapabilityEvent::CandidateDiscovered(Some(candidate)) => {
                step.outbound.push(SignalingEnvelope::Candidate {
                    sender: self.local_id.clone(),
                    candidate,
                });
            }
            CapabilityEvent::CandidateDiscovered(None) => {
                trace!(local = %self.local_id, "end of local candidates");
            }
            CapabilityEvent::ConnectivityChanged(phase) => {
                self.on_connectivity(connection, phase, step).await;
            }
            CapabilityEvent::RemoteChannelOpened(label) => {
                info!(local = %self.local_id, %label, "remote channel opened");
                step.notices.push(Notice::ChannelOpened(label));
            }
            CapabilityEvent::ChannelMessage(payload) => {
                step.notices.push(Notice::Message(payload));
            }
        }
    }

    async fn on_connectivity(
        &mut self,
        connection: &dyn PeerConnection,
        phase: ConnectionPhase,
        step: &mut Step,
    ) {
        self.state.connection_phase = phase;
        match phase {
            ConnectionPhase::Failed => {
                info!(local = %self.local_id, "path failed, restarting discovery");
                if let Err(err) = connection.restart_path_discovery().await {
                    warn!(local = %self.local_id, %err, "path discovery restart failed");
                }
            }
            ConnectionPhase::Disconnected => {
                info!(local = %self.local_id, "path disconnected, ending call");
                step.notices.push(Notice::Ended(EndReason::Disconnected));
            }
            ConnectionPhase::Closed => {
                step.notices.push(Notice::Ended(EndReason::ConnectionClosed));
            }
            ConnectionPhase::Connected => {
                info!(local = %self.local_id, "path connected");
            }
            ConnectionPhase::New | ConnectionPhase::Checking => {}
        }
    }

    async fn make_offer(&mut self, connection: &dyn PeerConnection, step: &mut Step) {
        self.state.making_offer = true;
        let result = Self::create_and_apply_offer(connection).await;
        self.state.making_offer = false;
        self.sync_phase(connection);

        match result {
            Ok(offer) => {
                debug!(local = %self.local_id, "sending offer");
                self.local_offer = Some(offer.clone());
                step.outbound.push(self.envelope(offer));
            }
            Err(err) => warn!(local = %self.local_id, %err, "offer attempt failed"),
        }
    }

    async fn create_and_apply_offer(
        connection: &dyn PeerConnection,
    ) -> Result<SessionDescription, CapabilityError> {
        // A remote offer we never answered is dropped in favour of our own.
        if connection.signaling_phase() == SignalingPhase::HaveRemoteOffer {
            connection
                .set_local_description(SessionDescription::rollback())
                .await?;
        }
        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    async fn on_envelope(
        &mut self,
        connection: &dyn PeerConnection,
        envelope: SignalingEnvelope,
        step: &mut Step,
    ) {
        if envelope.sender() == &self.local_id {
            trace!("ignoring our own envelope");
            return;
        }
        let role = self.role_for(envelope.sender());

        match envelope {
            SignalingEnvelope::Description { description, .. } => {
                self.on_description(connection, role, description, step).await;
            }
            SignalingEnvelope::Candidate { candidate, .. } => {
                self.on_candidate(connection, candidate).await;
            }
        }
    }

    async fn on_description(
        &mut self,
        connection: &dyn PeerConnection,
        role: Role,
        description: SessionDescription,
        step: &mut Step,
    ) {
        let kind = description.kind;
        if kind == DescriptionKind::Rollback {
            debug!(local = %self.local_id, "ignoring remote rollback");
            return;
        }

        self.sync_phase(connection);
        let offer_collision = kind == DescriptionKind::Offer
            && (self.state.making_offer || self.state.signaling_phase != SignalingPhase::Stable);

        self.state.ignore_offer = role == Role::Impolite && offer_collision;
        if self.state.ignore_offer {
            info!(local = %self.local_id, "ignoring colliding remote offer");
            if self.state.making_offer {
                return;
            }
            // Our pending offer may never have reached the other side.
            let pending = match self.state.signaling_phase {
                SignalingPhase::HaveLocalOffer => self.local_offer.clone(),
                _ => None,
            };
            match pending {
                Some(offer) => {
                    debug!(local = %self.local_id, "re-sending pending offer");
                    step.outbound.push(self.envelope(offer));
                }
                None => self.make_offer(connection, step).await,
            }
            return;
        }

        let applied = async {
            if offer_collision {
                debug!(local = %self.local_id, "offer collision, rolling back local offer");
                connection
                    .set_local_description(SessionDescription::rollback())
                    .await?;
            }
            connection.set_remote_description(description).await
        }
        .await;
        self.sync_phase(connection);
        if let Err(err) = applied {
            warn!(local = %self.local_id, ?kind, %err, "dropping remote description");
            return;
        }

        if kind == DescriptionKind::Offer {
            let answered = async {
                let answer = connection.create_answer().await?;
                connection.set_local_description(answer.clone()).await?;
                Ok::<_, CapabilityError>(answer)
            }
            .await;
            self.sync_phase(connection);
            match answered {
                Ok(answer) => {
                    debug!(local = %self.local_id, "sending answer");
                    step.outbound.push(self.envelope(answer));
                }
                Err(err) => warn!(local = %self.local_id, %err, "failed to answer remote offer"),
            }
        }
    }

    async fn on_candidate(&mut self, connection: &dyn PeerConnection, candidate: PathCandidate) {
        if let Err(err) = connection.add_path_candidate(candidate).await {
            if self.state.ignore_offer {
                debug!(local = %self.local_id, %err, "dropping candidate for ignored offer");
            } else {
                warn!(local = %self.local_id, %err, "failed to apply remote candidate");
            }
        }
    }
}
