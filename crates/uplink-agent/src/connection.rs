//! Connection supervisor: owns the engine, the link and every timer of the
//! relay lifecycle, driven by one select loop.
//!
//! The agent always dials out. On an established link the relay may answer
//! the handshake with instructions: wait (suspend reconnecting), redirect
//! (switch endpoint, optionally persisted) or stop (disable the instance
//! and exit). Liveness is probed with application-level ping frames; a
//! missed answer drops the link exactly once and re-arms the reconnect
//! cadence. Of all failure modes only stop is fatal.

use crate::config::AgentConfig;
use crate::engine::{DispatchOutcome, Engine, EngineOptions};
use crate::session::RelayStrategy;
use crate::store::{CallOptions, Store, StoreEvent};
use crate::transport::{RelayDial, RelayLink};
use serde_json::{json, Value};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};
use uplink_core::{ControlCommand, Envelope, UplinkError, UplinkResult};

/// Debounce before a persistent redirect is written to the stored config.
const REDIRECT_DEBOUNCE: Duration = Duration::from_secs(3);
/// Wait instruction without an explicit delay.
const DEFAULT_WAIT_SECS: u64 = 60;
/// Deferral before backend HTTP sessions are refreshed after activity.
const SESSION_REFRESH_DELAY: Duration = Duration::from_secs(60);

/// Relay link lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    /// Relay asked to hold off; reconnecting is suspended.
    Waiting,
    /// Persistent redirect pending its debounce.
    Redirecting,
    Terminating,
}

/// Why the supervisor returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The relay ordered a stop; the instance config was disabled.
    Stopped { reason: Option<String> },
    /// Local shutdown request.
    Shutdown,
}

/// Handle to request a clean shutdown from outside the supervisor task.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: UnboundedSender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

enum Tick {
    Shutdown,
    Reconnect,
    WaitElapsed,
    Heartbeat,
    HeartbeatDeadline,
    RedirectElapsed,
    RefreshElapsed,
    Outgoing(Envelope),
    Inbound(UplinkResult<Envelope>),
    StoreEvent(StoreEvent),
    Idle,
}

pub struct Supervisor<S: Store, D: RelayDial> {
    config: AgentConfig,
    dialer: D,
    engine: Engine<S>,
    endpoint: String,
    uuid: String,
    state: LinkState,
    link: Option<D::Link>,
    outbox_rx: UnboundedReceiver<Envelope>,
    store_events: Option<UnboundedReceiver<StoreEvent>>,
    shutdown_rx: Option<UnboundedReceiver<()>>,
    reconnect: Option<Interval>,
    heartbeat: Option<Interval>,
    heartbeat_deadline: Option<Pin<Box<Sleep>>>,
    wait: Option<Pin<Box<Sleep>>>,
    redirect: Option<(Pin<Box<Sleep>>, String)>,
    refresh: Option<Pin<Box<Sleep>>>,
}

async fn tick_interval(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn elapse(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(s) => s.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn elapse_redirect(timer: &mut Option<(Pin<Box<Sleep>>, String)>) {
    match timer {
        Some((s, _)) => s.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn link_recv<L: RelayLink>(link: &mut Option<L>) -> UplinkResult<Envelope> {
    match link {
        Some(l) => l.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_opt<T>(rx: &mut Option<UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(r) => match r.recv().await {
            Some(v) => Some(v),
            None => {
                *rx = None;
                None
            }
        },
        None => std::future::pending().await,
    }
}

impl<S: Store, D: RelayDial> Supervisor<S, D> {
    pub fn new(
        config: AgentConfig,
        store: S,
        dialer: D,
        store_events: UnboundedReceiver<StoreEvent>,
    ) -> (Self, ShutdownHandle) {
        let (outbox_tx, outbox_rx) = unbounded_channel();
        let (shutdown_tx, shutdown_rx) = unbounded_channel();
        let engine = Engine::new(
            store,
            Box::new(RelayStrategy),
            EngineOptions::from_config(&config),
            outbox_tx,
        );
        let endpoint = config.endpoint();
        let supervisor = Self {
            config,
            dialer,
            engine,
            endpoint,
            uuid: String::new(),
            state: LinkState::Disconnected,
            link: None,
            outbox_rx,
            store_events: Some(store_events),
            shutdown_rx: Some(shutdown_rx),
            reconnect: None,
            heartbeat: None,
            heartbeat_deadline: None,
            wait: None,
            redirect: None,
            refresh: None,
        };
        (supervisor, ShutdownHandle { tx: shutdown_tx })
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Run until the relay orders a stop or a shutdown is requested.
    pub async fn run(mut self) -> UplinkResult<Termination> {
        self.prepare().await?;
        self.arm_reconnect(true);
        loop {
            let tick = self.next_tick().await;
            if let Some(termination) = self.handle_tick(tick).await? {
                return Ok(termination);
            }
        }
    }

    /// Resolve the installation uuid announced in the handshake.
    async fn prepare(&mut self) -> UplinkResult<()> {
        if let Some(uuid) = &self.config.relay.uuid {
            self.uuid = uuid.clone();
            return Ok(());
        }
        let opts = CallOptions::for_user(&self.config.session.default_user);
        let uuid = self
            .engine
            .store()
            .get_object("system.meta.uuid", &opts)
            .await?
            .and_then(|obj| {
                obj.pointer("/native/uuid")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .ok_or_else(|| UplinkError::Other("no installation uuid available".into()))?;
        self.uuid = uuid;
        Ok(())
    }

    async fn next_tick(&mut self) -> Tick {
        let Supervisor {
            shutdown_rx,
            store_events,
            outbox_rx,
            link,
            reconnect,
            heartbeat,
            heartbeat_deadline,
            wait,
            redirect,
            refresh,
            ..
        } = self;

        tokio::select! {
            maybe = recv_opt(shutdown_rx) => match maybe {
                Some(()) => Tick::Shutdown,
                None => Tick::Idle,
            },
            _ = tick_interval(reconnect) => Tick::Reconnect,
            _ = elapse(wait) => Tick::WaitElapsed,
            _ = tick_interval(heartbeat) => Tick::Heartbeat,
            _ = elapse(heartbeat_deadline) => Tick::HeartbeatDeadline,
            _ = elapse_redirect(redirect) => Tick::RedirectElapsed,
            _ = elapse(refresh) => Tick::RefreshElapsed,
            maybe = outbox_rx.recv() => match maybe {
                Some(envelope) => Tick::Outgoing(envelope),
                None => Tick::Idle,
            },
            result = link_recv(link) => Tick::Inbound(result),
            maybe = recv_opt(store_events) => match maybe {
                Some(event) => Tick::StoreEvent(event),
                None => Tick::Idle,
            },
        }
    }

    async fn handle_tick(&mut self, tick: Tick) -> UplinkResult<Option<Termination>> {
        match tick {
            Tick::Shutdown => {
                info!("shutdown requested");
                self.state = LinkState::Terminating;
                self.drop_link().await;
                Ok(Some(Termination::Shutdown))
            }
            Tick::Reconnect => self.try_connect().await,
            Tick::WaitElapsed => {
                self.wait = None;
                self.state = LinkState::Disconnected;
                self.arm_reconnect(true);
                Ok(None)
            }
            Tick::Heartbeat => {
                self.send_ping().await;
                Ok(None)
            }
            Tick::HeartbeatDeadline => {
                self.heartbeat_deadline = None;
                warn!("ping timeout");
                self.handle_disconnect("ping timeout").await;
                Ok(None)
            }
            Tick::RedirectElapsed => {
                self.finish_redirect().await;
                Ok(None)
            }
            Tick::RefreshElapsed => {
                self.refresh = None;
                if self.engine.refresh_sessions().await {
                    self.handle_disconnect("backend session lost").await;
                }
                Ok(None)
            }
            Tick::Outgoing(envelope) => {
                self.send_envelope(envelope).await;
                Ok(None)
            }
            Tick::Inbound(Ok(envelope)) => self.handle_frame(envelope).await,
            Tick::Inbound(Err(e)) => {
                debug!(error = %e, "link receive failed");
                self.handle_disconnect("link error").await;
                Ok(None)
            }
            Tick::StoreEvent(event) => {
                self.engine.fan_out(&event);
                Ok(None)
            }
            Tick::Idle => Ok(None),
        }
    }

    async fn try_connect(&mut self) -> UplinkResult<Option<Termination>> {
        if self.state != LinkState::Disconnected {
            return Ok(None);
        }
        self.state = LinkState::Connecting;
        info!(endpoint = %self.endpoint, "connecting to relay");

        let link = match self
            .dialer
            .dial(&self.endpoint, self.config.connection_timeout())
            .await
        {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, "dial failed");
                self.state = LinkState::Disconnected;
                return Ok(None);
            }
        };
        self.link = Some(link);
        self.state = LinkState::Authenticating;

        let hello = Envelope::Apikey {
            apikey: self.config.relay.apikey.clone(),
            version: self.engine.opts.version.clone(),
            uuid: self.uuid.clone(),
        };
        let timeout = self.config.connection_timeout();
        let reply = {
            let Some(link) = self.link.as_mut() else {
                return Ok(None);
            };
            match link.send(&hello).await {
                Ok(()) => match tokio::time::timeout(timeout, link.recv()).await {
                    Ok(result) => result,
                    Err(_) => Err(UplinkError::Timeout),
                },
                Err(e) => Err(e),
            }
        };

        match reply {
            Ok(Envelope::HandshakeReply {
                error,
                valid_till,
                instruction,
            }) => {
                self.process_handshake(error, valid_till, instruction)
                    .await
            }
            Ok(other) => {
                warn!(envelope = ?other, "unexpected handshake answer");
                self.drop_link().await;
                self.state = LinkState::Disconnected;
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "handshake failed");
                self.drop_link().await;
                self.state = LinkState::Disconnected;
                Ok(None)
            }
        }
    }

    async fn process_handshake(
        &mut self,
        error: Option<String>,
        valid_till: Option<i64>,
        instruction: Option<ControlCommand>,
    ) -> UplinkResult<Option<Termination>> {
        if let Some(valid_till) = valid_till {
            self.record_valid_till(valid_till).await;
        }

        match instruction {
            Some(ControlCommand::Wait { delay_seconds }) => {
                self.enter_wait(delay_seconds.unwrap_or(DEFAULT_WAIT_SECS))
                    .await;
                Ok(None)
            }
            Some(ControlCommand::Redirect {
                url,
                not_save,
                reason,
            }) => {
                self.enter_redirect(url, not_save, reason).await;
                Ok(None)
            }
            Some(ControlCommand::Stop { reason }) => self.enter_stop(reason).await.map(Some),
            Some(ControlCommand::Log { message }) => {
                info!(relay = %message, "relay message during handshake");
                self.finish_connect().await?;
                Ok(None)
            }
            None => match error {
                Some(error) if error.contains("buy remote access") => {
                    // subscription ran out, retrying cannot help
                    self.enter_stop(Some(error)).await.map(Some)
                }
                Some(error) => {
                    warn!(error = %error, "relay rejected the handshake");
                    self.drop_link().await;
                    self.state = LinkState::Disconnected;
                    Ok(None)
                }
                None => {
                    self.finish_connect().await?;
                    Ok(None)
                }
            },
        }
    }

    async fn finish_connect(&mut self) -> UplinkResult<()> {
        self.state = LinkState::Connected;
        self.reconnect = None;
        self.engine.start_link().await?;
        self.set_connection_state(true).await;
        self.arm_heartbeat();
        info!("relay link established");
        Ok(())
    }

    async fn handle_frame(&mut self, envelope: Envelope) -> UplinkResult<Option<Termination>> {
        match envelope {
            Envelope::Pongg => {
                self.heartbeat_deadline = None;
                Ok(None)
            }
            Envelope::Pingg => {
                self.send_envelope(Envelope::Pongg).await;
                Ok(None)
            }
            Envelope::CloudCommand { command } => self.handle_control(command).await,
            envelope => {
                let outcome = self.engine.handle_envelope(envelope).await;
                if self.engine.refresh_requested && self.refresh.is_none() {
                    self.refresh = Some(Box::pin(sleep(SESSION_REFRESH_DELAY)));
                }
                if outcome == DispatchOutcome::Expired {
                    self.handle_disconnect("session expired").await;
                }
                Ok(None)
            }
        }
    }

    async fn handle_control(
        &mut self,
        command: ControlCommand,
    ) -> UplinkResult<Option<Termination>> {
        match command {
            ControlCommand::Wait { delay_seconds } => {
                self.enter_wait(delay_seconds.unwrap_or(DEFAULT_WAIT_SECS))
                    .await;
                Ok(None)
            }
            ControlCommand::Redirect {
                url,
                not_save,
                reason,
            } => {
                self.enter_redirect(url, not_save, reason).await;
                Ok(None)
            }
            ControlCommand::Stop { reason } => self.enter_stop(reason).await.map(Some),
            ControlCommand::Log { message } => {
                info!(relay = %message, "relay message");
                Ok(None)
            }
        }
    }

    async fn send_ping(&mut self) {
        if self.state != LinkState::Connected {
            return;
        }
        // a probe is already in flight; its deadline decides
        if self.heartbeat_deadline.is_some() {
            return;
        }
        self.send_envelope(Envelope::Pingg).await;
        if self.state == LinkState::Connected {
            self.heartbeat_deadline = Some(Box::pin(sleep(self.config.ping_timeout())));
        }
    }

    async fn send_envelope(&mut self, envelope: Envelope) {
        let Some(link) = self.link.as_mut() else {
            debug!("dropping frame while disconnected");
            return;
        };
        if let Err(e) = link.send(&envelope).await {
            warn!(error = %e, "send failed");
            self.handle_disconnect("send failed").await;
        }
    }

    /// Drop the link exactly once and re-arm the reconnect cadence. Calls
    /// while already disconnected, waiting or redirecting are no-ops.
    async fn handle_disconnect(&mut self, reason: &str) {
        match self.state {
            LinkState::Connecting | LinkState::Authenticating | LinkState::Connected => {}
            _ => return,
        }
        warn!(reason, "relay link lost");
        self.drop_link().await;
        self.state = LinkState::Disconnected;
        self.arm_reconnect(false);
    }

    /// Close the link and tear down the session tree with all of its
    /// subscriptions and timers.
    async fn drop_link(&mut self) {
        self.heartbeat = None;
        self.heartbeat_deadline = None;
        self.refresh = None;
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        let had_session = self.engine.hub.is_active();
        self.engine.reset_link().await;
        if had_session {
            self.set_connection_state(false).await;
        }
    }

    /// Replace any pending reconnect cadence with a fresh one.
    fn arm_reconnect(&mut self, immediate: bool) {
        if matches!(self.state, LinkState::Waiting | LinkState::Terminating) {
            return;
        }
        let period = self.config.reconnect_interval();
        let start = if immediate {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let mut interval = interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.reconnect = Some(interval);
    }

    fn arm_heartbeat(&mut self) {
        let period = self.config.ping_interval();
        self.heartbeat = Some(interval_at(Instant::now() + period, period));
    }

    async fn enter_wait(&mut self, seconds: u64) {
        info!(seconds, "relay asked to suspend reconnecting");
        self.drop_link().await;
        self.reconnect = None;
        self.state = LinkState::Waiting;
        self.wait = Some(Box::pin(sleep(Duration::from_secs(seconds))));
    }

    async fn enter_redirect(&mut self, url: String, not_save: bool, reason: Option<String>) {
        info!(url = %url, persistent = !not_save, reason = ?reason, "relay redirect");
        self.drop_link().await;
        self.reconnect = None;
        if not_save {
            // for this run only
            self.endpoint = url;
            self.state = LinkState::Disconnected;
            self.arm_reconnect(true);
        } else {
            self.state = LinkState::Redirecting;
            // replacing the timer debounces redirect storms
            self.redirect = Some((Box::pin(sleep(REDIRECT_DEBOUNCE)), url));
        }
    }

    async fn finish_redirect(&mut self) {
        let Some((_, url)) = self.redirect.take() else {
            return;
        };
        let instance = self.config.session.instance.clone();
        let opts = CallOptions::for_user(&self.config.session.default_user);
        match self.engine.store().get_object(&instance, &opts).await {
            Ok(Some(mut object)) => {
                set_in_object(&mut object, "native", "cloudUrl", json!(url.clone()));
                match self.engine.store().set_object(&instance, object, &opts).await {
                    Ok(()) => info!(url = %url, "redirect persisted"),
                    Err(e) => warn!(error = %e, "failed to persist redirect url"),
                }
            }
            Ok(None) => warn!(instance = %instance, "instance object missing, redirect not persisted"),
            Err(e) => warn!(error = %e, "failed to load instance object"),
        }
        self.endpoint = url;
        self.state = LinkState::Disconnected;
        self.arm_reconnect(true);
    }

    async fn enter_stop(&mut self, reason: Option<String>) -> UplinkResult<Termination> {
        warn!(reason = ?reason, "relay ordered stop, disabling instance");
        self.state = LinkState::Terminating;
        self.drop_link().await;
        self.reconnect = None;
        self.wait = None;
        self.redirect = None;

        let instance = self.config.session.instance.clone();
        let opts = CallOptions::for_user(&self.config.session.default_user);
        match self.engine.store().get_object(&instance, &opts).await {
            Ok(Some(mut object)) => {
                set_in_object(&mut object, "common", "enabled", json!(false));
                if let Err(e) = self.engine.store().set_object(&instance, object, &opts).await {
                    warn!(error = %e, "failed to disable instance");
                }
            }
            Ok(None) => warn!(instance = %instance, "instance object missing"),
            Err(e) => warn!(error = %e, "failed to load instance object"),
        }
        Ok(Termination::Stopped { reason })
    }

    async fn record_valid_till(&mut self, valid_till: i64) {
        let id = format!("{}.info.remoteTill", self.config.namespace());
        let opts = CallOptions::for_user(&self.config.session.default_user);
        let state = json!({"val": valid_till, "ack": true});
        if let Err(e) = self.engine.store().set_state(&id, state, &opts).await {
            warn!(error = %e, "failed to record subscription end");
        }
    }

    async fn set_connection_state(&mut self, connected: bool) {
        let id = format!("{}.info.connection", self.config.namespace());
        let opts = CallOptions::for_user(&self.config.session.default_user);
        let state = json!({"val": connected, "ack": true});
        if let Err(e) = self.engine.store().set_state(&id, state, &opts).await {
            warn!(error = %e, "failed to update connection state");
        }
    }
}

/// Set `object[section][field] = value` without assuming the section
/// already exists.
fn set_in_object(object: &mut Value, section: &str, field: &str, value: Value) {
    if let Some(map) = object
        .get_mut(section)
        .and_then(Value::as_object_mut)
    {
        map.insert(field.to_string(), value);
    } else if let Some(map) = object.as_object_mut() {
        map.insert(section.to_string(), json!({ field: value }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::memory::{RelayLogs, RelayScript, ScriptedRelay};
    use std::sync::{Arc, Mutex};
    use tokio::task::JoinHandle;

    fn accepted() -> Envelope {
        Envelope::HandshakeReply {
            error: None,
            valid_till: None,
            instruction: None,
        }
    }

    fn reply_with(instruction: ControlCommand) -> Envelope {
        Envelope::HandshakeReply {
            error: None,
            valid_till: None,
            instruction: Some(instruction),
        }
    }

    fn config() -> AgentConfig {
        let mut config: AgentConfig =
            toml::from_str("[relay]\napikey = \"test-key\"\n").unwrap();
        config.normalize().unwrap();
        config
    }

    struct Harness {
        task: JoinHandle<UplinkResult<Termination>>,
        store: MemoryStore,
        logs: Arc<Mutex<RelayLogs>>,
        shutdown: ShutdownHandle,
    }

    async fn start(scripts: Vec<RelayScript>) -> Harness {
        let (events_tx, events_rx) = unbounded_channel();
        let store = MemoryStore::with_events(events_tx);
        store
            .seed_object(
                "system.meta.uuid",
                serde_json::json!({"native": {"uuid": "uuid-1"}}),
            )
            .await;
        store
            .seed_object(
                "system.adapter.uplink.0",
                serde_json::json!({"common": {"enabled": true}, "native": {}}),
            )
            .await;

        let relay = ScriptedRelay::new(scripts);
        let logs = relay.logs.clone();
        let (supervisor, shutdown) = Supervisor::new(config(), store.clone(), relay, events_rx);
        let task = tokio::spawn(supervisor.run());
        Harness {
            task,
            store,
            logs,
            shutdown,
        }
    }

    async fn wait_until(logs: &Arc<Mutex<RelayLogs>>, f: impl Fn(&RelayLogs) -> bool) {
        for _ in 0..10_000 {
            if f(&logs.lock().unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_instruction_defers_reconnect() {
        let harness = start(vec![
            RelayScript::Reply(reply_with(ControlCommand::Wait {
                delay_seconds: Some(5),
            })),
            RelayScript::Reply(accepted()),
        ])
        .await;

        wait_until(&harness.logs, |l| l.dials.len() >= 2).await;
        let dials = harness.logs.lock().unwrap().dials.clone();
        let gap = dials[1].0 - dials[0].0;
        // no attempt before the wait elapsed, exactly one at/after
        assert!(gap >= Duration::from_secs(5), "gap was {gap:?}");
        assert!(gap < Duration::from_secs(6), "gap was {gap:?}");

        harness.shutdown.shutdown();
        assert_eq!(harness.task.await.unwrap().unwrap(), Termination::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn missed_pong_drops_link_once_and_reconnects_later() {
        let harness = start(vec![
            RelayScript::ReplyNoPong(accepted()),
            RelayScript::Refuse,
        ])
        .await;

        wait_until(&harness.logs, |l| l.dials.len() >= 2).await;
        let logs = harness.logs.lock().unwrap();
        // connect at ~0, ping at 30s, deadline 5s later, reconnect period 60s
        let gap = logs.dials[1].0 - logs.dials[0].0;
        assert!(gap >= Duration::from_secs(95), "gap was {gap:?}");
        // exactly one probe went out; the outstanding deadline blocks more
        let pings = logs
            .received
            .iter()
            .filter(|e| matches!(e, Envelope::Pingg))
            .count();
        assert_eq!(pings, 1);
        drop(logs);

        // the teardown happened exactly once
        let connection = harness
            .store
            .get_state("uplink.0.info.connection", &CallOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connection["val"], serde_json::json!(false));

        harness.shutdown.shutdown();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_instruction_disables_instance_and_terminates() {
        let harness = start(vec![RelayScript::Reply(reply_with(ControlCommand::Stop {
            reason: Some("expired".into()),
        }))])
        .await;

        let termination = harness.task.await.unwrap().unwrap();
        assert_eq!(
            termination,
            Termination::Stopped {
                reason: Some("expired".into())
            }
        );

        let object = harness
            .store
            .get_object("system.adapter.uplink.0", &CallOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(object.pointer("/common/enabled"), Some(&serde_json::json!(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn quota_error_is_fatal() {
        let harness = start(vec![RelayScript::Reply(Envelope::HandshakeReply {
            error: Some("Please buy remote access to use the service".into()),
            valid_till: None,
            instruction: None,
        })])
        .await;

        match harness.task.await.unwrap().unwrap() {
            Termination::Stopped { reason } => {
                assert!(reason.unwrap().contains("buy remote access"));
            }
            other => panic!("unexpected termination: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_redirect_is_debounced_and_saved() {
        let harness = start(vec![
            RelayScript::Reply(reply_with(ControlCommand::Redirect {
                url: "wss://relay2.uplink.cloud:10555".into(),
                not_save: false,
                reason: None,
            })),
            RelayScript::Reply(accepted()),
        ])
        .await;

        wait_until(&harness.logs, |l| l.dials.len() >= 2).await;
        let dials = harness.logs.lock().unwrap().dials.clone();
        assert_eq!(dials[1].1, "wss://relay2.uplink.cloud:10555");
        let gap = dials[1].0 - dials[0].0;
        assert!(gap >= Duration::from_secs(3), "gap was {gap:?}");

        let object = harness
            .store
            .get_object("system.adapter.uplink.0", &CallOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            object.pointer("/native/cloudUrl"),
            Some(&serde_json::json!("wss://relay2.uplink.cloud:10555"))
        );

        harness.shutdown.shutdown();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_redirect_switches_without_saving() {
        let harness = start(vec![
            RelayScript::Reply(reply_with(ControlCommand::Redirect {
                url: "wss://relay3.uplink.cloud:10555".into(),
                not_save: true,
                reason: None,
            })),
            RelayScript::Reply(accepted()),
        ])
        .await;

        wait_until(&harness.logs, |l| l.dials.len() >= 2).await;
        let dials = harness.logs.lock().unwrap().dials.clone();
        assert_eq!(dials[1].1, "wss://relay3.uplink.cloud:10555");

        let object = harness
            .store
            .get_object("system.adapter.uplink.0", &CallOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(object.pointer("/native/cloudUrl"), None);

        harness.shutdown.shutdown();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn valid_till_is_recorded_as_state() {
        let harness = start(vec![RelayScript::Reply(Envelope::HandshakeReply {
            error: None,
            valid_till: Some(1_700_000_000),
            instruction: None,
        })])
        .await;
        wait_until(&harness.logs, |l| !l.links.is_empty()).await;

        let mut recorded = None;
        for _ in 0..1_000 {
            if let Some(state) = harness
                .store
                .get_state("uplink.0.info.remoteTill", &CallOptions::default())
                .await
                .unwrap()
            {
                recorded = Some(state);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let state = recorded.expect("remoteTill state never written");
        assert_eq!(state["val"], serde_json::json!(1_700_000_000i64));

        harness.shutdown.shutdown();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_event_reaches_the_remote_session() {
        let harness = start(vec![RelayScript::Reply(accepted())]).await;
        wait_until(&harness.logs, |l| !l.links.is_empty()).await;

        // remote user subscribes through the relay
        let to_agent = harness.logs.lock().unwrap().links[0].clone();
        to_agent
            .send(Envelope::Mc {
                remote_id: "r1".into(),
                command: "subscribe".into(),
                args: vec![serde_json::json!("hm.0.*")],
                ack: Some(1),
            })
            .unwrap();
        wait_until(&harness.logs, |l| {
            l.received
                .iter()
                .any(|e| matches!(e, Envelope::Ack { id: 1, .. }))
        })
        .await;

        // a matching store change fans out to that session
        harness
            .store
            .set_state(
                "hm.0.light",
                serde_json::json!({"val": true}),
                &CallOptions::default(),
            )
            .await
            .unwrap();

        wait_until(&harness.logs, |l| {
            l.received.iter().any(|e| {
                matches!(
                    e,
                    Envelope::StateChange { remote_id: Some(rid), id, .. }
                        if rid == "r1" && id == "hm.0.light"
                )
            })
        })
        .await;

        harness.shutdown.shutdown();
        harness.task.await.unwrap().unwrap();
    }
}
