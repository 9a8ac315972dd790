//! Boundary to the underlying point-to-point connection (media/data transport
//! and path discovery). The negotiation engine only sequences calls on it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{PathCandidate, SessionDescription};

#[cfg(test)]
pub(crate) mod fake;

/// Description-exchange phase as reported by the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalingPhase {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// Path-connectivity phase as reported by the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityEvent {
    NegotiationNeeded,
    /// `None` marks end-of-candidates.
    CandidateDiscovered(Option<PathCandidate>),
    ConnectivityChanged(ConnectionPhase),
    RemoteChannelOpened(String),
    ChannelMessage(Bytes),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("invalid path candidate: {0}")]
    InvalidCandidate(String),
    #[error("{operation} is not valid in phase {phase:?}")]
    InvalidState {
        operation: &'static str,
        phase: SignalingPhase,
    },
    #[error("connection is closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

pub type CapabilityEvents = mpsc::UnboundedReceiver<CapabilityEvent>;

#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_phase(&self) -> SignalingPhase;

    async fn create_offer(&self) -> Result<SessionDescription, CapabilityError>;

    async fn create_answer(&self) -> Result<SessionDescription, CapabilityError>;

    /// Accepts offers, answers and [`SessionDescription::rollback`].
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError>;

    async fn add_path_candidate(&self, candidate: PathCandidate) -> Result<(), CapabilityError>;

    /// Expected to surface a fresh `NegotiationNeeded`.
    async fn restart_path_discovery(&self) -> Result<(), CapabilityError>;

    async fn open_data_channel(&self, label: &str) -> Result<(), CapabilityError>;

    async fn send_data(&self, payload: Bytes) -> Result<(), CapabilityError>;

    async fn close(&self);
}

pub trait ConnectionFactory: Send + Sync {
    fn create(&self) -> Result<(Arc<dyn PeerConnection>, CapabilityEvents), CapabilityError>;
}
