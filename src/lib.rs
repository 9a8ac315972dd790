//! Two-party connection negotiation over a dumb fan-out relay.
//!
//! [`relay`] and [`server`] make up the always-on broker; [`engine`] and
//! [`session`] run inside each participant.

pub mod capability;
pub mod config;
pub mod engine;
pub mod link;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
