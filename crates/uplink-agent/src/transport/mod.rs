//! Relay transports. The supervisor drives any [`RelayDial`]; production
//! uses the WebSocket transport, tests a scripted in-memory relay.

use async_trait::async_trait;
use std::time::Duration;
use uplink_core::{Envelope, UplinkResult};

pub mod websocket;

#[cfg(test)]
pub mod memory;

/// One established link to the relay.
#[async_trait]
pub trait RelayLink: Send {
    async fn send(&mut self, envelope: &Envelope) -> UplinkResult<()>;
    /// Next inbound envelope; errors mean the link is gone.
    async fn recv(&mut self) -> UplinkResult<Envelope>;
    async fn close(&mut self);
}

/// Dials new links. The supervisor calls this on every reconnect attempt.
#[async_trait]
pub trait RelayDial: Send {
    type Link: RelayLink;

    async fn dial(&mut self, url: &str, timeout: Duration) -> UplinkResult<Self::Link>;
}
