//! Scriptable in-memory connection used by the engine and session tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use super::{
    CapabilityError, CapabilityEvent, CapabilityEvents, ConnectionFactory, ConnectionPhase,
    PeerConnection, SignalingPhase,
};
use crate::protocol::{DescriptionKind, PathCandidate, SessionDescription};

#[derive(Default)]
struct FakeState {
    phase: SignalingPhase,
    pending_local: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    current_local: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    offers_created: u32,
    offer_attempts: u32,
    offer_gate: Option<Arc<Notify>>,
    fail_offers: u32,
    fail_answers: u32,
    candidates: Vec<PathCandidate>,
    restarts: u32,
    channels: Vec<String>,
    announced: bool,
    sent: Vec<Bytes>,
    close_calls: u32,
}

pub(crate) struct FakeConnection {
    label: String,
    state: Mutex<FakeState>,
    events: mpsc::UnboundedSender<CapabilityEvent>,
}

impl FakeConnection {
    pub(crate) fn new(label: &str) -> (Arc<Self>, CapabilityEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(FakeState::default()),
            events,
        });
        (connection, rx)
    }

    pub(crate) fn emit(&self, event: CapabilityEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn fail_next_offers(&self, count: u32) {
        self.state.lock().fail_offers = count;
    }

    /// `create_offer` suspends until `gate` is notified.
    pub(crate) fn hold_offers(&self, gate: Arc<Notify>) {
        self.state.lock().offer_gate = Some(gate);
    }

    pub(crate) fn offer_attempts(&self) -> u32 {
        self.state.lock().offer_attempts
    }

    /// The connection gives up its pending local offer on its own.
    pub(crate) fn drop_pending_offer(&self) {
        let mut state = self.state.lock();
        if state.phase == SignalingPhase::HaveLocalOffer {
            state.phase = SignalingPhase::Stable;
            state.pending_local = None;
        }
    }

    pub(crate) fn fail_next_answers(&self, count: u32) {
        self.state.lock().fail_answers = count;
    }

    /// Negotiated (local, remote) pair once the phase returned to stable.
    pub(crate) fn negotiated(&self) -> (Option<SessionDescription>, Option<SessionDescription>) {
        let state = self.state.lock();
        (state.current_local.clone(), state.current_remote.clone())
    }

    pub(crate) fn applied_candidates(&self) -> usize {
        self.state.lock().candidates.len()
    }

    pub(crate) fn restarts(&self) -> u32 {
        self.state.lock().restarts
    }

    pub(crate) fn close_calls(&self) -> u32 {
        self.state.lock().close_calls
    }

    pub(crate) fn sent(&self) -> Vec<Bytes> {
        self.state.lock().sent.clone()
    }

    fn invalid(operation: &'static str, phase: SignalingPhase) -> CapabilityError {
        CapabilityError::InvalidState { operation, phase }
    }

    // Once a round completes, report the path up and every channel open.
    fn settle(&self, state: &mut FakeState) {
        if state.announced || state.channels.is_empty() {
            return;
        }
        state.announced = true;
        self.emit(CapabilityEvent::ConnectivityChanged(ConnectionPhase::Connected));
        for label in &state.channels {
            self.emit(CapabilityEvent::RemoteChannelOpened(label.clone()));
        }
    }

    fn check_open(state: &FakeState) -> Result<(), CapabilityError> {
        if state.close_calls > 0 {
            Err(CapabilityError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    fn signaling_phase(&self) -> SignalingPhase {
        self.state.lock().phase
    }

    async fn create_offer(&self) -> Result<SessionDescription, CapabilityError> {
        let gate = {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            state.offer_attempts += 1;
            state.offer_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.fail_offers > 0 {
            state.fail_offers -= 1;
            return Err(CapabilityError::Other("scripted offer failure".into()));
        }
        state.offers_created += 1;
        Ok(SessionDescription::offer(format!(
            "{}-offer-{}",
            self.label, state.offers_created
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CapabilityError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.fail_answers > 0 {
            state.fail_answers -= 1;
            return Err(CapabilityError::Other("scripted answer failure".into()));
        }
        match (&state.phase, &state.pending_remote) {
            (SignalingPhase::HaveRemoteOffer, Some(offer)) => Ok(SessionDescription::answer(
                format!("{}-answer-to-{}", self.label, offer.sdp),
            )),
            _ => Err(Self::invalid("create_answer", state.phase)),
        }
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        match (description.kind, state.phase) {
            (DescriptionKind::Offer, SignalingPhase::Stable | SignalingPhase::HaveLocalOffer) => {
                state.phase = SignalingPhase::HaveLocalOffer;
                state.pending_local = Some(description);
            }
            (DescriptionKind::Answer, SignalingPhase::HaveRemoteOffer) => {
                state.phase = SignalingPhase::Stable;
                state.current_local = Some(description);
                state.current_remote = state.pending_remote.take();
                self.settle(&mut state);
            }
            (DescriptionKind::Rollback, SignalingPhase::HaveLocalOffer) => {
                state.phase = SignalingPhase::Stable;
                state.pending_local = None;
            }
            (DescriptionKind::Rollback, SignalingPhase::HaveRemoteOffer) => {
                state.phase = SignalingPhase::Stable;
                state.pending_remote = None;
            }
            (_, phase) => return Err(Self::invalid("set_local_description", phase)),
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        match (description.kind, state.phase) {
            (DescriptionKind::Offer, SignalingPhase::Stable | SignalingPhase::HaveRemoteOffer) => {
                state.phase = SignalingPhase::HaveRemoteOffer;
                state.pending_remote = Some(description);
            }
            (DescriptionKind::Answer, SignalingPhase::HaveLocalOffer) => {
                state.phase = SignalingPhase::Stable;
                state.current_local = state.pending_local.take();
                state.current_remote = Some(description);
                self.settle(&mut state);
            }
            (_, phase) => return Err(Self::invalid("set_remote_description", phase)),
        }
        Ok(())
    }

    async fn add_path_candidate(&self, candidate: PathCandidate) -> Result<(), CapabilityError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if candidate.0.get("candidate").and_then(|c| c.as_str()).is_none() {
            return Err(CapabilityError::InvalidCandidate("missing candidate line".into()));
        }
        if state.current_remote.is_none() && state.pending_remote.is_none() {
            return Err(CapabilityError::InvalidCandidate(
                "no remote description".into(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn restart_path_discovery(&self) -> Result<(), CapabilityError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.restarts += 1;
        self.emit(CapabilityEvent::NegotiationNeeded);
        Ok(())
    }

    async fn open_data_channel(&self, label: &str) -> Result<(), CapabilityError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.channels.push(label.to_string());
        self.emit(CapabilityEvent::NegotiationNeeded);
        Ok(())
    }

    async fn send_data(&self, payload: Bytes) -> Result<(), CapabilityError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.sent.push(payload);
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().close_calls += 1;
    }
}

#[derive(Default)]
pub(crate) struct FakeFactory {
    fail: bool,
    offer_gate: Option<Arc<Notify>>,
    created: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeFactory {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub(crate) fn holding_offers(gate: Arc<Notify>) -> Self {
        Self {
            offer_gate: Some(gate),
            ..Self::default()
        }
    }

    pub(crate) fn created(&self) -> Vec<Arc<FakeConnection>> {
        self.created.lock().clone()
    }
}

impl ConnectionFactory for FakeFactory {
    fn create(&self) -> Result<(Arc<dyn PeerConnection>, CapabilityEvents), CapabilityError> {
        if self.fail {
            return Err(CapabilityError::Other("scripted construction failure".into()));
        }
        let mut created = self.created.lock();
        let (connection, events) = FakeConnection::new(&format!("conn{}", created.len()));
        if let Some(gate) = &self.offer_gate {
            connection.hold_offers(gate.clone());
        }
        created.push(connection.clone());
        Ok((connection, events))
    }
}
