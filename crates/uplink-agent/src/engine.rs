//! Command engine: owns the store handle, the session tree and the
//! subscription registry, dispatches multiplexed commands and fans store
//! events out to the sessions that subscribed to them.
//!
//! The engine is driven single-threaded by the connection supervisor, so
//! none of its state needs locking.

use crate::acl::{merge_acls, Operation, Resource, WhitelistEntry};
use crate::commands::CommandTable;
use crate::config::AgentConfig;
use crate::session::{Session, SessionHub, SessionKey, SessionStrategy, TouchOutcome};
use crate::store::{Store, StoreEvent};
use crate::subscriptions::{self, SubscriptionKind, SubscriptionRegistry};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use uplink_core::{Envelope, PermissionErrorInfo, UplinkResult, ERROR_PERMISSION};

/// Completion handle for one multiplexed command. Answers travel back as
/// [`Envelope::Ack`] with the node-style payload convention: element zero
/// is the error or null, the results follow.
pub struct Completion {
    id: u64,
    outbox: UnboundedSender<Envelope>,
}

impl Completion {
    pub fn new(id: u64, outbox: UnboundedSender<Envelope>) -> Self {
        Self { id, outbox }
    }

    pub fn ok(self, results: Vec<Value>) {
        let mut payload = vec![Value::Null];
        payload.extend(results);
        self.send(payload);
    }

    pub fn error(self, message: impl Into<String>) {
        self.send(vec![json!(message.into())]);
    }

    fn send(self, payload: Vec<Value>) {
        let _ = self.outbox.send(Envelope::Ack {
            id: self.id,
            payload,
        });
    }
}

/// Reserved command marker for the secondary dashboard tunnel, which is
/// bridged outside this crate.
pub const TUNNEL_COMMAND: &str = "ll";

/// Receiver for frames addressed to the reserved tunnel marker.
pub trait TunnelBridge: Send + Sync {
    fn handle(&mut self, remote_id: &str, args: Vec<Value>);
}

/// Outcome of one dispatched envelope, as far as the supervisor cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// The backing session expired; the link must drop and reconnect.
    Expired,
}

/// Engine knobs lifted out of [`AgentConfig`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub default_user: String,
    pub ttl: std::time::Duration,
    pub whitelist: HashMap<String, WhitelistEntry>,
    pub allowed_services: Vec<String>,
    pub version: String,
}

impl EngineOptions {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            default_user: config.session.default_user.clone(),
            ttl: config.session_ttl(),
            whitelist: config.access.whitelist.clone(),
            allowed_services: config.access.allowed_services.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

pub struct Engine<S: Store> {
    pub(crate) store: S,
    pub(crate) hub: SessionHub,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) opts: EngineOptions,
    table: CommandTable<S>,
    outbox: UnboundedSender<Envelope>,
    strategy: Box<dyn SessionStrategy>,
    tunnel: Option<Box<dyn TunnelBridge>>,
    /// Set when a touch wants the deferred backend-session refresh armed.
    pub(crate) refresh_requested: bool,
}

impl<S: Store> Engine<S> {
    pub fn new(
        store: S,
        strategy: Box<dyn SessionStrategy>,
        opts: EngineOptions,
        outbox: UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            store,
            hub: SessionHub::new(),
            registry: SubscriptionRegistry::new(),
            opts,
            table: CommandTable::new(),
            outbox,
            strategy,
            tunnel: None,
            refresh_requested: false,
        }
    }

    /// Attach the handler for frames carrying the reserved tunnel marker.
    pub fn set_tunnel_bridge(&mut self, bridge: Box<dyn TunnelBridge>) {
        self.tunnel = Some(bridge);
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn table(&self) -> &CommandTable<S> {
        &self.table
    }

    /// Open the link-level session after a successful handshake: resolve
    /// the configured user's grants, patch them with the whitelist entry
    /// for the client address, and replay any surviving subscriptions.
    pub async fn start_link(&mut self) -> UplinkResult<()> {
        let acl = self
            .store
            .calculate_permissions(&self.opts.default_user)
            .await?;
        let address = self.strategy.client_address();
        let acl = merge_acls(acl, address.as_deref(), &self.opts.whitelist);
        debug!(user = %acl.user, "link session opened");
        self.hub.start(Session::new_real(acl));
        Ok(())
    }

    /// Tear the whole session tree down, releasing every subscription.
    /// Safe to call more than once; only the first call does work.
    pub async fn reset_link(&mut self) {
        let Some(mut real) = self.hub.end() else {
            return;
        };
        let Engine {
            store, registry, ..
        } = self;
        for (_, mut child) in real.children.drain() {
            if let Err(e) = registry.unsubscribe_session(store, &mut child).await {
                warn!(session = %child.id, error = %e, "subscription teardown failed");
            }
        }
        if let Err(e) = registry.unsubscribe_session(store, &mut real).await {
            warn!(error = %e, "subscription teardown failed");
        }
        // release any keys the session walk left behind
        for kind in SubscriptionKind::ALL {
            if let Err(e) = registry.clear_kind(store, kind).await {
                warn!(kind = kind.as_str(), error = %e, "subscription reset failed");
            }
        }
        self.refresh_requested = false;
    }

    /// Handle one session-level envelope from the relay.
    pub async fn handle_envelope(&mut self, envelope: Envelope) -> DispatchOutcome {
        match envelope {
            Envelope::Mc {
                remote_id,
                command,
                args,
                ack,
            } => self.dispatch(&remote_id, &command, args, ack).await,
            Envelope::CloudConnect { remote_id } => {
                debug!(remote_id = %remote_id, "remote user attached");
                self.hub.ensure_child(&remote_id);
                DispatchOutcome::Handled
            }
            Envelope::CloudDisconnect { remote_id, reason } => {
                debug!(remote_id = ?remote_id, reason = ?reason, "remote user detached");
                self.remove_children(remote_id.as_deref()).await;
                DispatchOutcome::Handled
            }
            Envelope::CloudVersion { version } => {
                debug!(relay_version = %version, "relay announced version");
                if let Some(real) = self.hub.real_mut() {
                    real.protocol_version = Some(version);
                }
                DispatchOutcome::Handled
            }
            other => {
                debug!(envelope = ?other, "unexpected envelope");
                DispatchOutcome::Handled
            }
        }
    }

    /// Dispatch one multiplexed command onto its virtual session.
    pub async fn dispatch(
        &mut self,
        remote_id: &str,
        command: &str,
        args: Vec<Value>,
        ack: Option<u64>,
    ) -> DispatchOutcome {
        let done = ack.map(|id| Completion::new(id, self.outbox.clone()));

        if !self.hub.is_active() {
            warn!(command, "command before link session, dropping");
            if let Some(done) = done {
                done.error("not connected");
            }
            return DispatchOutcome::Handled;
        }

        let ttl = self.opts.ttl;
        let strategy = &self.strategy;
        if let Some(real) = self.hub.real_mut() {
            match strategy.touch(real, ttl) {
                TouchOutcome::Expired => {
                    let _ = self
                        .outbox
                        .send(Envelope::Reauthenticate { remote_id: None });
                    if let Some(done) = done {
                        done.error("session expired");
                    }
                    return DispatchOutcome::Expired;
                }
                TouchOutcome::Fresh { refresh_due } => {
                    if refresh_due {
                        self.refresh_requested = true;
                    }
                }
            }
        }

        self.hub.ensure_child(remote_id);

        if command == TUNNEL_COMMAND {
            match self.tunnel.as_mut() {
                Some(bridge) => {
                    bridge.handle(remote_id, args);
                    if let Some(done) = done {
                        done.ok(vec![]);
                    }
                }
                None => {
                    debug!(remote_id, "tunnel frame without a bridge attached");
                    if let Some(done) = done {
                        done.error("tunnel not available");
                    }
                }
            }
            return DispatchOutcome::Handled;
        }

        self.run_command(SessionKey::Child(remote_id.to_string()), command, args, done)
            .await;
        DispatchOutcome::Handled
    }

    /// Permission-check and run one command against one session.
    pub async fn run_command(
        &mut self,
        key: SessionKey,
        command: &str,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let Some((permission, handler)) = self.table.lookup(command) else {
            warn!(command, "unknown command");
            if let Some(done) = done {
                done.error(format!("unknown command: {command}"));
            }
            return;
        };

        if let Some((resource, operation)) = permission {
            let allowed = self
                .hub
                .session(&key)
                .map(|s| s.acl.allows(resource, operation))
                .unwrap_or(false);
            if !allowed {
                self.deny(&key, command, Some((resource, operation)), args.first(), done);
                return;
            }
        }

        handler(self, key, args, done).await;
    }

    /// Report a failed capability check: through the completion when one
    /// exists, as a push notification otherwise.
    pub(crate) fn deny(
        &self,
        key: &SessionKey,
        command: &str,
        permission: Option<(Resource, Operation)>,
        arg: Option<&Value>,
        done: Option<Completion>,
    ) {
        let user = self
            .hub
            .session(key)
            .map(|s| s.acl.user.clone())
            .unwrap_or_default();
        warn!(command, user = %user, "permission denied");

        if let Some(done) = done {
            done.error(ERROR_PERMISSION);
            return;
        }
        let remote_id = match key {
            SessionKey::Real => None,
            SessionKey::Child(rid) => Some(rid.clone()),
        };
        let _ = self.outbox.send(Envelope::PermissionError {
            remote_id,
            info: PermissionErrorInfo {
                command: command.to_string(),
                resource: permission.map(|(r, _)| r.as_str().to_string()),
                operation: permission.map(|(_, o)| o.as_str().to_string()),
                arg: arg.cloned(),
            },
        });
    }

    /// Drop one virtual session, or all of them when the relay signals a
    /// blanket disconnect.
    pub async fn remove_children(&mut self, remote_id: Option<&str>) {
        let Engine {
            store,
            hub,
            registry,
            ..
        } = self;
        match remote_id {
            Some(rid) => {
                if let Some(mut child) = hub.remove_child(rid) {
                    debug!(
                        session = rid,
                        states = ?child.sub_patterns(SubscriptionKind::State),
                        "tearing down virtual session"
                    );
                    if let Err(e) = registry.unsubscribe_session(store, &mut child).await {
                        warn!(session = rid, error = %e, "subscription teardown failed");
                    }
                }
            }
            None => {
                for mut child in hub.take_children() {
                    if let Err(e) = registry.unsubscribe_session(store, &mut child).await {
                        warn!(session = %child.id, error = %e, "subscription teardown failed");
                    }
                }
            }
        }
    }

    /// Fan one store event out to every session whose patterns match.
    /// Each session receives at most one copy, addressed by remote id.
    pub fn fan_out(&self, event: &StoreEvent) {
        let Some(real) = self.hub.real() else {
            return;
        };
        let sessions = std::iter::once((None, real)).chain(
            real.children
                .iter()
                .map(|(rid, child)| (Some(rid.clone()), child)),
        );

        for (remote_id, session) in sessions {
            let envelope = match event {
                StoreEvent::State { id, state } => {
                    if !subscriptions::wants(session, SubscriptionKind::State, id) {
                        continue;
                    }
                    Envelope::StateChange {
                        remote_id,
                        id: id.clone(),
                        state: state.clone(),
                    }
                }
                StoreEvent::Object { id, object } => {
                    if !subscriptions::wants(session, SubscriptionKind::Object, id) {
                        continue;
                    }
                    Envelope::ObjectChange {
                        remote_id,
                        id: id.clone(),
                        object: object.clone(),
                    }
                }
                StoreEvent::File { id, file, size } => {
                    if !subscriptions::wants_file(session, id, file) {
                        continue;
                    }
                    Envelope::FileChange {
                        remote_id,
                        id: id.clone(),
                        file: file.clone(),
                        size: *size,
                    }
                }
                StoreEvent::Log { message } => {
                    if !subscriptions::wants_log(session) {
                        continue;
                    }
                    Envelope::Log {
                        remote_id,
                        message: message.clone(),
                    }
                }
            };
            let _ = self.outbox.send(envelope);
        }
    }

    /// Deferred backend-session refresh: re-arm the TTL of every backend
    /// HTTP session with recent activity. Returns true when a backend
    /// session vanished and the link must reauthenticate.
    pub async fn refresh_sessions(&mut self) -> bool {
        self.refresh_requested = false;
        let ttl = self.opts.ttl.as_secs();
        let Engine {
            store,
            hub,
            outbox,
            ..
        } = self;
        let Some(real) = hub.real_mut() else {
            return false;
        };

        let mut lost = false;
        let Session {
            http_session_id,
            refresh_armed,
            children,
            ..
        } = real;

        let mut targets: Vec<(Option<String>, &mut Option<String>, &mut bool)> =
            vec![(None, http_session_id, refresh_armed)];
        targets.extend(children.iter_mut().map(|(rid, child)| {
            (
                Some(rid.clone()),
                &mut child.http_session_id,
                &mut child.refresh_armed,
            )
        }));

        for (remote_id, sid, armed) in targets {
            if !*armed {
                continue;
            }
            let Some(sid) = sid.as_deref() else {
                *armed = false;
                continue;
            };
            match store.get_session(sid).await {
                Ok(Some(data)) => {
                    if let Err(e) = store.set_session(sid, ttl, data).await {
                        warn!(error = %e, "session refresh failed");
                    }
                    *armed = false;
                }
                Ok(None) => {
                    let _ = outbox.send(Envelope::Reauthenticate { remote_id });
                    lost = true;
                }
                Err(e) => warn!(error = %e, "session lookup failed"),
            }
        }
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{Acl, Grants};
    use crate::session::RelayStrategy;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn options() -> EngineOptions {
        EngineOptions {
            default_user: "system.user.admin".into(),
            ttl: std::time::Duration::from_secs(3600),
            whitelist: HashMap::new(),
            allowed_services: vec!["*".into()],
            version: "0.1.0".into(),
        }
    }

    async fn engine() -> (Engine<MemoryStore>, UnboundedReceiver<Envelope>) {
        let (tx, rx) = unbounded_channel();
        let mut engine = Engine::new(
            MemoryStore::new(),
            Box::new(RelayStrategy),
            options(),
            tx,
        );
        engine.start_link().await.unwrap();
        (engine, rx)
    }

    fn ack_payload(rx: &mut UnboundedReceiver<Envelope>) -> Vec<Value> {
        match rx.try_recv().expect("expected an ack") {
            Envelope::Ack { payload, .. } => payload,
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn engine_is_send_and_sync() {
        fn assert_bounds<T: Send + Sync>() {}
        assert_bounds::<Engine<MemoryStore>>();
    }

    #[tokio::test]
    async fn dispatch_creates_virtual_session_lazily() {
        let (mut engine, mut rx) = engine().await;
        engine
            .dispatch("abc", "getVersion", vec![], Some(1))
            .await;

        assert!(engine.hub.real().unwrap().children.contains_key("abc"));
        let payload = ack_payload(&mut rx);
        assert_eq!(payload[0], Value::Null);
    }

    #[tokio::test]
    async fn unknown_command_answers_with_error() {
        let (mut engine, mut rx) = engine().await;
        engine.dispatch("abc", "frobnicate", vec![], Some(7)).await;

        let payload = ack_payload(&mut rx);
        assert_eq!(payload[0], json!("unknown command: frobnicate"));
    }

    #[tokio::test]
    async fn denied_command_answers_with_permission_token() {
        let (mut engine, mut rx) = engine().await;
        // demote the link session to a user without state write
        let acl = Acl {
            user: "system.user.guest".into(),
            state: Grants {
                read: true,
                ..Grants::default()
            },
            ..Acl::default()
        };
        engine.hub.real_mut().unwrap().acl = acl;

        engine
            .dispatch(
                "abc",
                "setState",
                vec![json!("hm.0.light"), json!({"val": true})],
                Some(3),
            )
            .await;

        let payload = ack_payload(&mut rx);
        assert_eq!(payload, vec![json!(ERROR_PERMISSION)]);
    }

    #[tokio::test]
    async fn denied_command_without_ack_pushes_notification() {
        let (mut engine, mut rx) = engine().await;
        engine.hub.real_mut().unwrap().acl = Acl {
            user: "system.user.guest".into(),
            ..Acl::default()
        };

        engine
            .dispatch("abc", "setState", vec![json!("hm.0.light")], None)
            .await;

        match rx.try_recv().unwrap() {
            Envelope::PermissionError { remote_id, info } => {
                assert_eq!(remote_id, Some("abc".into()));
                assert_eq!(info.command, "setState");
                assert_eq!(info.resource, Some("state".into()));
                assert_eq!(info.operation, Some("write".into()));
            }
            other => panic!("expected permission error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn blanket_disconnect_tears_down_all_children() {
        let (mut engine, _rx) = engine().await;
        engine.dispatch("abc", "subscribe", vec![json!("a.*")], None).await;
        engine.dispatch("def", "subscribe", vec![json!("a.*")], None).await;
        assert_eq!(engine.registry.refcount(SubscriptionKind::State, "a.*"), 2);

        engine
            .handle_envelope(Envelope::CloudDisconnect {
                remote_id: None,
                reason: None,
            })
            .await;

        assert!(engine.hub.real().unwrap().children.is_empty());
        assert_eq!(engine.registry.refcount(SubscriptionKind::State, "a.*"), 0);
        assert_eq!(engine.store.hook_calls().await.len(), 2);
    }

    #[tokio::test]
    async fn single_disconnect_leaves_siblings() {
        let (mut engine, _rx) = engine().await;
        engine.dispatch("abc", "subscribe", vec![json!("a.*")], None).await;
        engine.dispatch("def", "subscribe", vec![json!("b.*")], None).await;

        engine
            .handle_envelope(Envelope::CloudDisconnect {
                remote_id: Some("abc".into()),
                reason: None,
            })
            .await;

        let real = engine.hub.real().unwrap();
        assert!(!real.children.contains_key("abc"));
        assert!(real.children.contains_key("def"));
        assert_eq!(engine.registry.refcount(SubscriptionKind::State, "a.*"), 0);
        assert_eq!(engine.registry.refcount(SubscriptionKind::State, "b.*"), 1);
    }

    #[tokio::test]
    async fn fan_out_addresses_matching_sessions_once() {
        let (mut engine, mut rx) = engine().await;
        engine.dispatch("abc", "subscribe", vec![json!("a.b.*")], None).await;
        // overlapping second pattern on the same session
        engine.dispatch("abc", "subscribe", vec![json!("a.*")], None).await;
        engine.dispatch("def", "subscribe", vec![json!("z.*")], None).await;

        engine.fan_out(&StoreEvent::State {
            id: "a.b.c".into(),
            state: Some(json!({"val": 1})),
        });

        match rx.try_recv().unwrap() {
            Envelope::StateChange { remote_id, id, .. } => {
                assert_eq!(remote_id, Some("abc".into()));
                assert_eq!(id, "a.b.c");
            }
            other => panic!("unexpected: {other:?}"),
        }
        // exactly one delivery: "def" does not match, "abc" not duplicated
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn tunnel_frames_route_to_the_bridge() {
        use std::sync::{Arc, Mutex};

        struct Recorder(Arc<Mutex<Vec<(String, Vec<Value>)>>>);
        impl TunnelBridge for Recorder {
            fn handle(&mut self, remote_id: &str, args: Vec<Value>) {
                self.0.lock().unwrap().push((remote_id.to_string(), args));
            }
        }

        let (mut engine, mut rx) = engine().await;

        // without a bridge the frame is refused
        engine.dispatch("abc", TUNNEL_COMMAND, vec![], Some(1)).await;
        assert_eq!(ack_payload(&mut rx), vec![json!("tunnel not available")]);

        let frames = Arc::new(Mutex::new(Vec::new()));
        engine.set_tunnel_bridge(Box::new(Recorder(frames.clone())));
        engine
            .dispatch("abc", TUNNEL_COMMAND, vec![json!("payload")], Some(2))
            .await;

        assert_eq!(
            frames.lock().unwrap().as_slice(),
            &[("abc".to_string(), vec![json!("payload")])]
        );
        assert_eq!(ack_payload(&mut rx), vec![Value::Null]);
    }

    #[tokio::test]
    async fn reset_link_is_idempotent() {
        let (mut engine, _rx) = engine().await;
        engine.dispatch("abc", "subscribe", vec![json!("a.*")], None).await;

        engine.reset_link().await;
        engine.reset_link().await;

        assert!(!engine.hub.is_active());
        assert_eq!(engine.registry.refcount(SubscriptionKind::State, "a.*"), 0);
        // one subscribe, one unsubscribe, nothing more
        assert_eq!(engine.store.hook_calls().await.len(), 2);
    }
}
