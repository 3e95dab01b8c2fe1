//! Scripted in-memory relay for supervisor tests: each dial consumes the
//! next script entry, a spawned task plays the relay side.

use super::{RelayDial, RelayLink};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uplink_core::{Envelope, UplinkError, UplinkResult};

/// Relay behavior for one dial attempt.
#[derive(Debug, Clone)]
pub enum RelayScript {
    /// Dial fails outright.
    Refuse,
    /// Accept, answer the apikey with this reply, keep the link open and
    /// answer every probe.
    Reply(Envelope),
    /// Accept and answer the handshake, but never answer probes.
    ReplyNoPong(Envelope),
    /// Accept the dial and never answer anything.
    Silent,
}

#[derive(Default)]
pub struct RelayLogs {
    /// `(when, url)` per dial attempt.
    pub dials: Vec<(tokio::time::Instant, String)>,
    /// Every envelope the relay received, across all links.
    pub received: Vec<Envelope>,
    /// Sender into the agent for each accepted link, newest last.
    pub links: Vec<UnboundedSender<Envelope>>,
}

pub struct ScriptedRelay {
    scripts: Vec<RelayScript>,
    next: usize,
    pub logs: Arc<Mutex<RelayLogs>>,
}

impl ScriptedRelay {
    pub fn new(scripts: Vec<RelayScript>) -> Self {
        Self {
            scripts,
            next: 0,
            logs: Arc::new(Mutex::new(RelayLogs::default())),
        }
    }
}

pub struct MemoryLink {
    to_relay: UnboundedSender<Envelope>,
    from_relay: UnboundedReceiver<Envelope>,
}

#[async_trait]
impl RelayLink for MemoryLink {
    async fn send(&mut self, envelope: &Envelope) -> UplinkResult<()> {
        self.to_relay
            .send(envelope.clone())
            .map_err(|_| UplinkError::Transport("link closed".into()))
    }

    async fn recv(&mut self) -> UplinkResult<Envelope> {
        self.from_relay
            .recv()
            .await
            .ok_or_else(|| UplinkError::Transport("link closed".into()))
    }

    async fn close(&mut self) {
        self.from_relay.close();
    }
}

#[async_trait]
impl RelayDial for ScriptedRelay {
    type Link = MemoryLink;

    async fn dial(&mut self, url: &str, _timeout: Duration) -> UplinkResult<MemoryLink> {
        let script = self
            .scripts
            .get(self.next)
            .cloned()
            .unwrap_or(RelayScript::Refuse);
        self.next += 1;
        self.logs
            .lock()
            .unwrap()
            .dials
            .push((tokio::time::Instant::now(), url.to_string()));

        let (reply, pong) = match script {
            RelayScript::Refuse => {
                return Err(UplinkError::Transport("connection refused".into()))
            }
            RelayScript::Reply(reply) => (Some(reply), true),
            RelayScript::ReplyNoPong(reply) => (Some(reply), false),
            RelayScript::Silent => (None, false),
        };

        let (to_agent, from_relay) = unbounded_channel();
        let (to_relay, mut agent_out) = unbounded_channel::<Envelope>();
        self.logs.lock().unwrap().links.push(to_agent.clone());

        let logs = self.logs.clone();
        tokio::spawn(async move {
            let mut reply = reply;
            while let Some(envelope) = agent_out.recv().await {
                logs.lock().unwrap().received.push(envelope.clone());
                match envelope {
                    Envelope::Apikey { .. } => {
                        if let Some(reply) = reply.take() {
                            let _ = to_agent.send(reply);
                        }
                    }
                    Envelope::Pingg if pong => {
                        let _ = to_agent.send(Envelope::Pongg);
                    }
                    _ => {}
                }
            }
        });

        Ok(MemoryLink {
            to_relay,
            from_relay,
        })
    }
}
