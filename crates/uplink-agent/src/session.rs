//! Sessions: one real session per relay link, plus virtual child sessions
//! for the remote end-users the relay multiplexes onto it.
//!
//! A virtual session is created lazily on the first envelope carrying an
//! unknown remote id, inherits the parent's ACL, and keeps its own
//! subscription lists so tearing one down cannot disturb its siblings.

use crate::acl::Acl;
use crate::subscriptions::{Subscription, SubscriptionKind};
use rand::RngCore;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Addresses one session inside the [`SessionHub`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    /// The real session behind the physical link.
    Real,
    /// A virtual session, addressed by its remote id.
    Child(String),
}

pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// One session: identity, grants, subscriptions and liveness bookkeeping.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub acl: Acl,
    /// Id of the owning real session, `None` for the real session itself.
    pub parent: Option<String>,
    /// Virtual sessions keyed by remote id. Only populated on the real
    /// session.
    pub children: HashMap<String, Session>,
    subs: HashMap<SubscriptionKind, Vec<Subscription>>,
    pub last_activity: Instant,
    /// Set while a deferred backend-session refresh is pending.
    pub refresh_armed: bool,
    /// Backend HTTP session to keep alive, if one backs this session.
    pub http_session_id: Option<String>,
    pub name: Option<String>,
    pub protocol_version: Option<String>,
}

impl Session {
    pub fn new_real(acl: Acl) -> Self {
        Self {
            id: generate_session_id(),
            acl,
            parent: None,
            children: HashMap::new(),
            subs: HashMap::new(),
            last_activity: Instant::now(),
            refresh_armed: false,
            http_session_id: None,
            name: None,
            protocol_version: None,
        }
    }

    /// Create a virtual session inheriting the parent's grants.
    pub fn new_child(remote_id: &str, parent: &Session) -> Self {
        Self {
            id: remote_id.to_string(),
            acl: parent.acl.clone(),
            parent: Some(parent.id.clone()),
            children: HashMap::new(),
            subs: HashMap::new(),
            last_activity: Instant::now(),
            refresh_armed: false,
            http_session_id: None,
            name: None,
            protocol_version: None,
        }
    }

    pub fn subs(&self, kind: SubscriptionKind) -> &[Subscription] {
        self.subs.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn holds(&self, kind: SubscriptionKind, key: &str) -> bool {
        self.subs(kind).iter().any(|s| s.key == key)
    }

    pub fn add_sub(&mut self, kind: SubscriptionKind, sub: Subscription) {
        self.subs.entry(kind).or_default().push(sub);
    }

    /// Remove one subscription entry; returns whether it was present.
    pub fn remove_sub(&mut self, kind: SubscriptionKind, key: &str) -> bool {
        let Some(list) = self.subs.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.key != key);
        before != list.len()
    }

    pub fn take_subs(&mut self, kind: SubscriptionKind) -> Vec<Subscription> {
        self.subs.remove(&kind).unwrap_or_default()
    }

    /// Pattern texts held for one kind, for diagnostics.
    pub fn sub_patterns(&self, kind: SubscriptionKind) -> Vec<&str> {
        self.subs(kind).iter().map(|s| s.key.as_str()).collect()
    }
}

/// Outcome of a session touch on activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    Fresh {
        /// The backend session should be refreshed once the deferral window
        /// elapses.
        refresh_due: bool,
    },
    Expired,
}

/// Transport-specific session behavior, composed into the engine instead of
/// specializing the session type per transport.
pub trait SessionStrategy: Send + Sync {
    /// Client address used for whitelist lookup, if one is known.
    fn client_address(&self) -> Option<String>;

    /// Record activity on the session and decide whether it is still live.
    fn touch(&self, session: &mut Session, ttl: Duration) -> TouchOutcome;
}

/// Sessions reached through the cloud relay: no per-client address, no
/// backend HTTP session, never expire on their own.
#[derive(Debug, Default)]
pub struct RelayStrategy;

impl SessionStrategy for RelayStrategy {
    fn client_address(&self) -> Option<String> {
        None
    }

    fn touch(&self, session: &mut Session, _ttl: Duration) -> TouchOutcome {
        session.last_activity = Instant::now();
        TouchOutcome::Fresh { refresh_due: false }
    }
}

/// Directly attached clients: a peer address for whitelist patching and a
/// backend HTTP session with a TTL that must be refreshed on activity.
#[derive(Debug, Default)]
pub struct DirectStrategy {
    pub peer: Option<String>,
}

impl SessionStrategy for DirectStrategy {
    fn client_address(&self) -> Option<String> {
        self.peer.clone()
    }

    fn touch(&self, session: &mut Session, ttl: Duration) -> TouchOutcome {
        if session.http_session_id.is_none() {
            session.last_activity = Instant::now();
            return TouchOutcome::Fresh { refresh_due: false };
        }
        if session.last_activity.elapsed() > ttl {
            return TouchOutcome::Expired;
        }
        session.last_activity = Instant::now();
        let refresh_due = !session.refresh_armed;
        session.refresh_armed = true;
        TouchOutcome::Fresh { refresh_due }
    }
}

/// Owner of the session tree for one link.
#[derive(Debug, Default)]
pub struct SessionHub {
    real: Option<Session>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, session: Session) {
        self.real = Some(session);
    }

    /// Tear down the link's session tree, returning it for cleanup.
    pub fn end(&mut self) -> Option<Session> {
        self.real.take()
    }

    pub fn is_active(&self) -> bool {
        self.real.is_some()
    }

    pub fn real(&self) -> Option<&Session> {
        self.real.as_ref()
    }

    pub fn real_mut(&mut self) -> Option<&mut Session> {
        self.real.as_mut()
    }

    pub fn session(&self, key: &SessionKey) -> Option<&Session> {
        match key {
            SessionKey::Real => self.real.as_ref(),
            SessionKey::Child(rid) => self.real.as_ref().and_then(|r| r.children.get(rid)),
        }
    }

    pub fn session_mut(&mut self, key: &SessionKey) -> Option<&mut Session> {
        match key {
            SessionKey::Real => self.real.as_mut(),
            SessionKey::Child(rid) => self.real.as_mut().and_then(|r| r.children.get_mut(rid)),
        }
    }

    /// Get or lazily create the virtual session for a remote id. Returns
    /// `None` only when no link session exists.
    pub fn ensure_child(&mut self, remote_id: &str) -> Option<&mut Session> {
        let real = self.real.as_mut()?;
        if !real.children.contains_key(remote_id) {
            let child = Session::new_child(remote_id, real);
            real.children.insert(remote_id.to_string(), child);
        }
        real.children.get_mut(remote_id)
    }

    pub fn remove_child(&mut self, remote_id: &str) -> Option<Session> {
        self.real.as_mut()?.children.remove(remote_id)
    }

    pub fn take_children(&mut self) -> Vec<Session> {
        match self.real.as_mut() {
            Some(real) => real.children.drain().map(|(_, s)| s).collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_inherits_parent_acl() {
        let mut hub = SessionHub::new();
        hub.start(Session::new_real(Acl::admin()));

        let child = hub.ensure_child("abc").unwrap();
        assert!(child.acl.is_admin());
        assert_eq!(child.id, "abc");
        assert!(child.parent.is_some());
    }

    #[test]
    fn ensure_child_is_idempotent() {
        let mut hub = SessionHub::new();
        hub.start(Session::new_real(Acl::admin()));
        hub.ensure_child("abc");
        hub.ensure_child("abc");
        assert_eq!(hub.real().unwrap().children.len(), 1);
    }

    #[test]
    fn removing_one_child_leaves_siblings() {
        let mut hub = SessionHub::new();
        hub.start(Session::new_real(Acl::admin()));
        hub.ensure_child("abc");
        hub.ensure_child("def");

        assert!(hub.remove_child("abc").is_some());
        assert!(hub.session(&SessionKey::Child("def".into())).is_some());
        assert!(hub.session(&SessionKey::Child("abc".into())).is_none());
    }

    #[test]
    fn direct_touch_expires_after_ttl() {
        let strategy = DirectStrategy { peer: None };
        let mut session = Session::new_real(Acl::admin());
        session.http_session_id = Some("sid".into());
        session.last_activity = Instant::now() - Duration::from_secs(10);

        assert_eq!(
            strategy.touch(&mut session, Duration::from_secs(5)),
            TouchOutcome::Expired
        );
    }

    #[test]
    fn direct_touch_arms_refresh_once() {
        let strategy = DirectStrategy { peer: None };
        let mut session = Session::new_real(Acl::admin());
        session.http_session_id = Some("sid".into());

        let first = strategy.touch(&mut session, Duration::from_secs(3600));
        let second = strategy.touch(&mut session, Duration::from_secs(3600));
        assert_eq!(first, TouchOutcome::Fresh { refresh_due: true });
        assert_eq!(second, TouchOutcome::Fresh { refresh_due: false });
    }

    #[test]
    fn relay_touch_never_expires() {
        let strategy = RelayStrategy;
        let mut session = Session::new_real(Acl::admin());
        session.last_activity = Instant::now() - Duration::from_secs(100_000);
        assert_eq!(
            strategy.touch(&mut session, Duration::from_secs(1)),
            TouchOutcome::Fresh { refresh_due: false }
        );
    }
}
