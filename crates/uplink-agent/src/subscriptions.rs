//! Refcounted change subscriptions.
//!
//! Sessions hold per-kind lists of compiled patterns; the registry keeps a
//! global refcount per `(kind, key)` and drives the backend hooks only on
//! the edges: subscribe on 0→1, unsubscribe on 1→0. File subscriptions use
//! a composite `object####pattern` key; log forwarding uses the single
//! pseudo-pattern [`LOG_KEY`] guarded by a latch so the backend toggle fires
//! at most once in each direction.

use crate::session::Session;
use crate::store::Store;
use std::collections::HashMap;
use tracing::warn;
use uplink_core::{file_key, Matcher, UplinkResult, FILE_KEY_SEP};

/// Pseudo-pattern under which log subscriptions are refcounted.
pub const LOG_KEY: &str = "dummy";

/// Kind of change feed a subscription belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    State,
    Object,
    File,
    Log,
}

impl SubscriptionKind {
    pub const ALL: [SubscriptionKind; 4] = [
        SubscriptionKind::State,
        SubscriptionKind::Object,
        SubscriptionKind::File,
        SubscriptionKind::Log,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionKind::State => "stateChange",
            SubscriptionKind::Object => "objectChange",
            SubscriptionKind::File => "fileChange",
            SubscriptionKind::Log => "log",
        }
    }
}

/// One pattern held by one session.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub key: String,
    pub matcher: Matcher,
}

/// Global subscription refcounts for one agent.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    counts: HashMap<(SubscriptionKind, String), usize>,
    log_enabled: bool,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refcount(&self, kind: SubscriptionKind, key: &str) -> usize {
        self.counts
            .get(&(kind, key.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Subscribe a session to a state/object pattern or to the log feed.
    /// Invalid patterns are logged and ignored.
    pub async fn subscribe<S: Store>(
        &mut self,
        store: &S,
        session: &mut Session,
        kind: SubscriptionKind,
        pattern: &str,
    ) -> UplinkResult<()> {
        self.add(store, session, kind, pattern.to_string()).await
    }

    /// Subscribe a session to file changes below an object id.
    pub async fn subscribe_file<S: Store>(
        &mut self,
        store: &S,
        session: &mut Session,
        object_id: &str,
        pattern: &str,
    ) -> UplinkResult<()> {
        self.add(
            store,
            session,
            SubscriptionKind::File,
            file_key(object_id, pattern),
        )
        .await
    }

    async fn add<S: Store>(
        &mut self,
        store: &S,
        session: &mut Session,
        kind: SubscriptionKind,
        key: String,
    ) -> UplinkResult<()> {
        if session.holds(kind, &key) {
            return Ok(());
        }
        let matcher = match Matcher::compile(&key) {
            Ok(m) => m,
            Err(e) => {
                warn!(pattern = %key, kind = kind.as_str(), error = %e, "rejecting subscription");
                return Ok(());
            }
        };

        session.add_sub(
            kind,
            Subscription {
                key: key.clone(),
                matcher,
            },
        );

        let count = self.counts.entry((kind, key.clone())).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.hook_up(store, kind, &key).await?;
        }
        Ok(())
    }

    /// Drop one pattern from one session.
    pub async fn unsubscribe<S: Store>(
        &mut self,
        store: &S,
        session: &mut Session,
        kind: SubscriptionKind,
        pattern: &str,
    ) -> UplinkResult<()> {
        let key = pattern.to_string();
        if session.remove_sub(kind, &key) {
            self.release(store, kind, &key).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe_file<S: Store>(
        &mut self,
        store: &S,
        session: &mut Session,
        object_id: &str,
        pattern: &str,
    ) -> UplinkResult<()> {
        self.unsubscribe(
            store,
            session,
            SubscriptionKind::File,
            &file_key(object_id, pattern),
        )
        .await
    }

    /// Drop every pattern of one kind held by the session.
    pub async fn unsubscribe_kind<S: Store>(
        &mut self,
        store: &S,
        session: &mut Session,
        kind: SubscriptionKind,
    ) -> UplinkResult<()> {
        for sub in session.take_subs(kind) {
            self.release(store, kind, &sub.key).await?;
        }
        Ok(())
    }

    /// Drop everything the session holds. Used on session teardown.
    pub async fn unsubscribe_session<S: Store>(
        &mut self,
        store: &S,
        session: &mut Session,
    ) -> UplinkResult<()> {
        for kind in SubscriptionKind::ALL {
            self.unsubscribe_kind(store, session, kind).await?;
        }
        Ok(())
    }

    /// Administrative reset of one kind: release every key regardless of
    /// which sessions hold it.
    pub async fn clear_kind<S: Store>(
        &mut self,
        store: &S,
        kind: SubscriptionKind,
    ) -> UplinkResult<()> {
        let keys: Vec<String> = self
            .counts
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, key)| key.clone())
            .collect();
        for key in keys {
            self.counts.remove(&(kind, key.clone()));
            self.hook_down(store, kind, &key).await?;
        }
        Ok(())
    }

    /// Re-count a session's existing patterns into a fresh registry,
    /// replaying backend hooks for keys nobody else holds yet.
    pub async fn resubscribe_session<S: Store>(
        &mut self,
        store: &S,
        session: &Session,
    ) -> UplinkResult<()> {
        for kind in SubscriptionKind::ALL {
            for sub in session.subs(kind) {
                let count = self.counts.entry((kind, sub.key.clone())).or_insert(0);
                *count += 1;
                if *count == 1 {
                    self.hook_up(store, kind, &sub.key).await?;
                }
            }
        }
        Ok(())
    }

    async fn release<S: Store>(
        &mut self,
        store: &S,
        kind: SubscriptionKind,
        key: &str,
    ) -> UplinkResult<()> {
        let Some(count) = self.counts.get_mut(&(kind, key.to_string())) else {
            return Ok(());
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&(kind, key.to_string()));
            self.hook_down(store, kind, key).await?;
        }
        Ok(())
    }

    async fn hook_up<S: Store>(
        &mut self,
        store: &S,
        kind: SubscriptionKind,
        key: &str,
    ) -> UplinkResult<()> {
        match kind {
            SubscriptionKind::State => store.subscribe_states(key).await,
            SubscriptionKind::Object => store.subscribe_objects(key).await,
            SubscriptionKind::File => {
                let (object_id, pattern) = split_file_key(key);
                store.subscribe_files(object_id, pattern).await
            }
            SubscriptionKind::Log => {
                if !self.log_enabled {
                    self.log_enabled = true;
                    store.require_log(true).await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn hook_down<S: Store>(
        &mut self,
        store: &S,
        kind: SubscriptionKind,
        key: &str,
    ) -> UplinkResult<()> {
        match kind {
            SubscriptionKind::State => store.unsubscribe_states(key).await,
            SubscriptionKind::Object => store.unsubscribe_objects(key).await,
            SubscriptionKind::File => {
                let (object_id, pattern) = split_file_key(key);
                store.unsubscribe_files(object_id, pattern).await
            }
            SubscriptionKind::Log => {
                let any_left = self
                    .counts
                    .keys()
                    .any(|(k, _)| *k == SubscriptionKind::Log);
                if self.log_enabled && !any_left {
                    self.log_enabled = false;
                    store.require_log(false).await
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn split_file_key(key: &str) -> (&str, &str) {
    match key.split_once(FILE_KEY_SEP) {
        Some((object_id, pattern)) => (object_id, pattern),
        None => (key, "*"),
    }
}

/// Whether a session should receive a state/object/log event for `id`.
/// Delivery is at most once per session, however many patterns match.
pub fn wants(session: &Session, kind: SubscriptionKind, id: &str) -> bool {
    session.subs(kind).iter().any(|s| s.matcher.matches(id))
}

/// Whether a session should receive a file change for `file` below
/// `object_id`.
pub fn wants_file(session: &Session, object_id: &str, file: &str) -> bool {
    let id = file_key(object_id, file);
    session
        .subs(SubscriptionKind::File)
        .iter()
        .any(|s| s.matcher.matches(&id))
}

/// Whether a session subscribed to the log feed. Log events have no id to
/// match, only the pseudo-pattern.
pub fn wants_log(session: &Session) -> bool {
    !session.subs(SubscriptionKind::Log).is_empty()
}
