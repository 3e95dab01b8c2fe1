//! Backend store abstraction.
//!
//! The agent multiplexes remote commands onto whatever automation backend
//! hosts it. [`Store`] is that seam: objects, states, files, users and the
//! subscription hooks the registry drives on refcount edges. Change events
//! flow back through a [`StoreEvent`] channel into the supervisor, which
//! fans them out to matching sessions.
//!
//! [`MemoryStore`] is a self-contained implementation used by the CLI
//! loopback mode and throughout the tests.

use crate::acl::{Acl, USER_ADMIN};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use uplink_core::{UplinkError, UplinkResult};

/// Effective-user context passed down with every store call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub user: String,
}

impl CallOptions {
    pub fn for_user(user: &str) -> Self {
        Self {
            user: user.to_string(),
        }
    }
}

/// A change event emitted by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    State { id: String, state: Option<Value> },
    Object { id: String, object: Option<Value> },
    File { id: String, file: String, size: Option<u64> },
    Log { message: Value },
}

/// A directory listing entry returned by [`Store::read_dir`].
pub type DirEntry = Value;

/// Backend operations the command layer drives.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_object(&self, id: &str, opts: &CallOptions) -> UplinkResult<Option<Value>>;
    async fn set_object(&self, id: &str, object: Value, opts: &CallOptions) -> UplinkResult<()>;
    async fn del_object(&self, id: &str, opts: &CallOptions) -> UplinkResult<()>;
    /// All objects matching a glob pattern, optionally filtered by type,
    /// as an id-to-object map.
    async fn get_objects(
        &self,
        pattern: &str,
        kind: Option<&str>,
        opts: &CallOptions,
    ) -> UplinkResult<Value>;
    async fn get_object_view(
        &self,
        design: &str,
        view: &str,
        params: Value,
        opts: &CallOptions,
    ) -> UplinkResult<Value>;

    async fn get_state(&self, id: &str, opts: &CallOptions) -> UplinkResult<Option<Value>>;
    async fn get_states(&self, pattern: &str, opts: &CallOptions) -> UplinkResult<Value>;
    async fn set_state(&self, id: &str, state: Value, opts: &CallOptions) -> UplinkResult<()>;
    async fn del_state(&self, id: &str, opts: &CallOptions) -> UplinkResult<()>;
    /// Time-series rows for one state id from the history backend.
    async fn get_history(
        &self,
        id: &str,
        options: Value,
        opts: &CallOptions,
    ) -> UplinkResult<Value>;

    async fn subscribe_states(&self, pattern: &str) -> UplinkResult<()>;
    async fn unsubscribe_states(&self, pattern: &str) -> UplinkResult<()>;
    async fn subscribe_objects(&self, pattern: &str) -> UplinkResult<()>;
    async fn unsubscribe_objects(&self, pattern: &str) -> UplinkResult<()>;
    async fn subscribe_files(&self, object_id: &str, pattern: &str) -> UplinkResult<()>;
    async fn unsubscribe_files(&self, object_id: &str, pattern: &str) -> UplinkResult<()>;
    /// Toggle backend log forwarding.
    async fn require_log(&self, enabled: bool) -> UplinkResult<()>;

    async fn read_file(
        &self,
        adapter: &str,
        path: &str,
        opts: &CallOptions,
    ) -> UplinkResult<(Vec<u8>, Option<String>)>;
    async fn write_file(
        &self,
        adapter: &str,
        path: &str,
        data: Vec<u8>,
        opts: &CallOptions,
    ) -> UplinkResult<()>;
    async fn delete_file(&self, adapter: &str, path: &str, opts: &CallOptions) -> UplinkResult<()>;
    async fn rename_file(
        &self,
        adapter: &str,
        from: &str,
        to: &str,
        opts: &CallOptions,
    ) -> UplinkResult<()>;
    async fn mkdir(&self, adapter: &str, path: &str, opts: &CallOptions) -> UplinkResult<()>;
    async fn read_dir(
        &self,
        adapter: &str,
        path: &str,
        opts: &CallOptions,
    ) -> UplinkResult<Vec<DirEntry>>;

    async fn set_password(&self, user: &str, password: &str, opts: &CallOptions)
        -> UplinkResult<()>;
    /// Resolve the full grants of a user.
    async fn calculate_permissions(&self, user: &str) -> UplinkResult<Acl>;

    /// Deliver a message to an adapter instance, returning its reply if the
    /// target answers.
    async fn send_to(&self, target: &str, command: &str, data: Value)
        -> UplinkResult<Option<Value>>;
    async fn send_to_host(&self, host: &str, command: &str, data: Value) -> UplinkResult<()>;

    async fn get_session(&self, sid: &str) -> UplinkResult<Option<Value>>;
    async fn set_session(&self, sid: &str, ttl_secs: u64, data: Value) -> UplinkResult<()>;
    async fn del_session(&self, sid: &str) -> UplinkResult<()>;
}

#[derive(Default)]
struct MemoryInner {
    objects: HashMap<String, Value>,
    states: HashMap<String, Value>,
    files: HashMap<(String, String), Vec<u8>>,
    sessions: HashMap<String, Value>,
    roles: HashMap<String, Acl>,
    /// One line per subscription hook invocation, e.g.
    /// `subscribe_states:hm.0.*`. Tests assert on this.
    calls: Vec<String>,
}

/// In-memory [`Store`] for the CLI loopback mode and tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
    events: Option<UnboundedSender<StoreEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an event channel; `set_state` and object/file writes emit
    /// change events into it.
    pub fn with_events(events: UnboundedSender<StoreEvent>) -> Self {
        Self {
            inner: Arc::default(),
            events: Some(events),
        }
    }

    pub async fn seed_object(&self, id: &str, object: Value) {
        self.inner.lock().await.objects.insert(id.to_string(), object);
    }

    pub async fn seed_state(&self, id: &str, state: Value) {
        self.inner.lock().await.states.insert(id.to_string(), state);
    }

    /// Register the ACL returned by `calculate_permissions` for a user.
    pub async fn set_role(&self, user: &str, acl: Acl) {
        self.inner.lock().await.roles.insert(user.to_string(), acl);
    }

    /// Subscription hook invocations so far, in order.
    pub async fn hook_calls(&self) -> Vec<String> {
        self.inner.lock().await.calls.clone()
    }

    fn emit(&self, event: StoreEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    async fn record(&self, call: String) {
        self.inner.lock().await.calls.push(call);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_object(&self, id: &str, _opts: &CallOptions) -> UplinkResult<Option<Value>> {
        Ok(self.inner.lock().await.objects.get(id).cloned())
    }

    async fn set_object(&self, id: &str, object: Value, _opts: &CallOptions) -> UplinkResult<()> {
        self.inner
            .lock()
            .await
            .objects
            .insert(id.to_string(), object.clone());
        self.emit(StoreEvent::Object {
            id: id.to_string(),
            object: Some(object),
        });
        Ok(())
    }

    async fn del_object(&self, id: &str, _opts: &CallOptions) -> UplinkResult<()> {
        if self.inner.lock().await.objects.remove(id).is_none() {
            return Err(UplinkError::Store(format!("object {id} not found")));
        }
        self.emit(StoreEvent::Object {
            id: id.to_string(),
            object: None,
        });
        Ok(())
    }

    async fn get_objects(
        &self,
        pattern: &str,
        kind: Option<&str>,
        _opts: &CallOptions,
    ) -> UplinkResult<Value> {
        let matcher = uplink_core::Matcher::compile(pattern)?;
        let inner = self.inner.lock().await;
        let mut out = serde_json::Map::new();
        for (id, obj) in &inner.objects {
            if !matcher.matches(id) {
                continue;
            }
            if let Some(kind) = kind {
                if obj.get("type").and_then(Value::as_str) != Some(kind) {
                    continue;
                }
            }
            out.insert(id.clone(), obj.clone());
        }
        Ok(Value::Object(out))
    }

    async fn get_object_view(
        &self,
        design: &str,
        view: &str,
        params: Value,
        opts: &CallOptions,
    ) -> UplinkResult<Value> {
        if design != "system" {
            return Err(UplinkError::Store(format!("unknown design {design}")));
        }
        let start = params
            .get("startkey")
            .and_then(Value::as_str)
            .unwrap_or("");
        let pattern = format!("{}*", start.trim_end_matches('*'));
        let objects = self.get_objects(&pattern, Some(view), opts).await?;
        let rows: Vec<Value> = objects
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(id, obj)| json!({"id": id, "value": obj}))
                    .collect()
            })
            .unwrap_or_default();
        Ok(json!({ "rows": rows }))
    }

    async fn get_state(&self, id: &str, _opts: &CallOptions) -> UplinkResult<Option<Value>> {
        Ok(self.inner.lock().await.states.get(id).cloned())
    }

    async fn get_states(&self, pattern: &str, _opts: &CallOptions) -> UplinkResult<Value> {
        let matcher = uplink_core::Matcher::compile(pattern)?;
        let inner = self.inner.lock().await;
        let mut out = serde_json::Map::new();
        for (id, state) in &inner.states {
            if matcher.matches(id) {
                out.insert(id.clone(), state.clone());
            }
        }
        Ok(Value::Object(out))
    }

    async fn set_state(&self, id: &str, state: Value, _opts: &CallOptions) -> UplinkResult<()> {
        self.inner
            .lock()
            .await
            .states
            .insert(id.to_string(), state.clone());
        self.emit(StoreEvent::State {
            id: id.to_string(),
            state: Some(state),
        });
        Ok(())
    }

    async fn del_state(&self, id: &str, _opts: &CallOptions) -> UplinkResult<()> {
        self.inner.lock().await.states.remove(id);
        self.emit(StoreEvent::State {
            id: id.to_string(),
            state: None,
        });
        Ok(())
    }

    async fn get_history(
        &self,
        id: &str,
        _options: Value,
        _opts: &CallOptions,
    ) -> UplinkResult<Value> {
        self.record(format!("get_history:{id}")).await;
        Ok(json!([]))
    }

    async fn subscribe_states(&self, pattern: &str) -> UplinkResult<()> {
        self.record(format!("subscribe_states:{pattern}")).await;
        Ok(())
    }

    async fn unsubscribe_states(&self, pattern: &str) -> UplinkResult<()> {
        self.record(format!("unsubscribe_states:{pattern}")).await;
        Ok(())
    }

    async fn subscribe_objects(&self, pattern: &str) -> UplinkResult<()> {
        self.record(format!("subscribe_objects:{pattern}")).await;
        Ok(())
    }

    async fn unsubscribe_objects(&self, pattern: &str) -> UplinkResult<()> {
        self.record(format!("unsubscribe_objects:{pattern}")).await;
        Ok(())
    }

    async fn subscribe_files(&self, object_id: &str, pattern: &str) -> UplinkResult<()> {
        self.record(format!("subscribe_files:{object_id}:{pattern}"))
            .await;
        Ok(())
    }

    async fn unsubscribe_files(&self, object_id: &str, pattern: &str) -> UplinkResult<()> {
        self.record(format!("unsubscribe_files:{object_id}:{pattern}"))
            .await;
        Ok(())
    }

    async fn require_log(&self, enabled: bool) -> UplinkResult<()> {
        self.record(format!("require_log:{enabled}")).await;
        Ok(())
    }

    async fn read_file(
        &self,
        adapter: &str,
        path: &str,
        _opts: &CallOptions,
    ) -> UplinkResult<(Vec<u8>, Option<String>)> {
        let inner = self.inner.lock().await;
        let data = inner
            .files
            .get(&(adapter.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| UplinkError::Store(format!("file {adapter}/{path} not found")))?;
        let mime = path.rsplit('.').next().map(|ext| match ext {
            "json" => "application/json".to_string(),
            "html" => "text/html".to_string(),
            _ => "application/octet-stream".to_string(),
        });
        Ok((data, mime))
    }

    async fn write_file(
        &self,
        adapter: &str,
        path: &str,
        data: Vec<u8>,
        _opts: &CallOptions,
    ) -> UplinkResult<()> {
        let size = data.len() as u64;
        self.inner
            .lock()
            .await
            .files
            .insert((adapter.to_string(), path.to_string()), data);
        self.emit(StoreEvent::File {
            id: adapter.to_string(),
            file: path.to_string(),
            size: Some(size),
        });
        Ok(())
    }

    async fn delete_file(&self, adapter: &str, path: &str, _opts: &CallOptions) -> UplinkResult<()> {
        let removed = self
            .inner
            .lock()
            .await
            .files
            .remove(&(adapter.to_string(), path.to_string()));
        if removed.is_none() {
            return Err(UplinkError::Store(format!("file {adapter}/{path} not found")));
        }
        self.emit(StoreEvent::File {
            id: adapter.to_string(),
            file: path.to_string(),
            size: None,
        });
        Ok(())
    }

    async fn rename_file(
        &self,
        adapter: &str,
        from: &str,
        to: &str,
        _opts: &CallOptions,
    ) -> UplinkResult<()> {
        let mut inner = self.inner.lock().await;
        let data = inner
            .files
            .remove(&(adapter.to_string(), from.to_string()))
            .ok_or_else(|| UplinkError::Store(format!("file {adapter}/{from} not found")))?;
        inner.files.insert((adapter.to_string(), to.to_string()), data);
        Ok(())
    }

    async fn mkdir(&self, _adapter: &str, _path: &str, _opts: &CallOptions) -> UplinkResult<()> {
        // Directories are implicit in the flat file map.
        Ok(())
    }

    async fn read_dir(
        &self,
        adapter: &str,
        path: &str,
        _opts: &CallOptions,
    ) -> UplinkResult<Vec<DirEntry>> {
        let prefix = if path.is_empty() || path == "/" {
            String::new()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };
        let inner = self.inner.lock().await;
        let mut entries = Vec::new();
        for ((a, p), data) in &inner.files {
            if a == adapter && p.starts_with(&prefix) {
                entries.push(json!({
                    "file": p[prefix.len()..],
                    "stats": {"size": data.len()},
                    "isDir": false,
                }));
            }
        }
        Ok(entries)
    }

    async fn set_password(
        &self,
        user: &str,
        password: &str,
        _opts: &CallOptions,
    ) -> UplinkResult<()> {
        let mut inner = self.inner.lock().await;
        let id = if user.starts_with("system.user.") {
            user.to_string()
        } else {
            format!("system.user.{user}")
        };
        let Some(obj) = inner.objects.get_mut(&id) else {
            return Err(UplinkError::Store(format!("user {id} not found")));
        };
        if let Some(common) = obj.get_mut("common") {
            common["password"] = json!(password);
        }
        Ok(())
    }

    async fn calculate_permissions(&self, user: &str) -> UplinkResult<Acl> {
        let inner = self.inner.lock().await;
        if let Some(acl) = inner.roles.get(user) {
            return Ok(acl.clone());
        }
        if user == USER_ADMIN {
            return Ok(Acl::admin());
        }
        Ok(Acl {
            user: user.to_string(),
            ..Acl::default()
        })
    }

    async fn send_to(
        &self,
        target: &str,
        command: &str,
        _data: Value,
    ) -> UplinkResult<Option<Value>> {
        self.record(format!("send_to:{target}:{command}")).await;
        Ok(None)
    }

    async fn send_to_host(&self, host: &str, command: &str, _data: Value) -> UplinkResult<()> {
        self.record(format!("send_to_host:{host}:{command}")).await;
        Ok(())
    }

    async fn get_session(&self, sid: &str) -> UplinkResult<Option<Value>> {
        Ok(self.inner.lock().await.sessions.get(sid).cloned())
    }

    async fn set_session(&self, sid: &str, _ttl_secs: u64, data: Value) -> UplinkResult<()> {
        self.inner
            .lock()
            .await
            .sessions
            .insert(sid.to_string(), data);
        Ok(())
    }

    async fn del_session(&self, sid: &str) -> UplinkResult<()> {
        self.inner.lock().await.sessions.remove(sid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn objects_round_trip_and_filter() {
        let store = MemoryStore::new();
        let opts = CallOptions::for_user(USER_ADMIN);
        store
            .set_object("hm.0.light", json!({"type": "state"}), &opts)
            .await
            .unwrap();
        store
            .set_object("hm.0", json!({"type": "device"}), &opts)
            .await
            .unwrap();

        let all = store.get_objects("hm.0*", None, &opts).await.unwrap();
        assert_eq!(all.as_object().unwrap().len(), 2);
        let states = store
            .get_objects("hm.0*", Some("state"), &opts)
            .await
            .unwrap();
        assert_eq!(states.as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn set_state_emits_event() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let store = MemoryStore::with_events(tx);
        store
            .set_state("hm.0.light", json!({"val": true}), &CallOptions::default())
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            StoreEvent::State { id, state } => {
                assert_eq!(id, "hm.0.light");
                assert_eq!(state, Some(json!({"val": true})));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn hook_calls_are_recorded_in_order() {
        let store = MemoryStore::new();
        store.subscribe_states("hm.*").await.unwrap();
        store.unsubscribe_states("hm.*").await.unwrap();
        assert_eq!(
            store.hook_calls().await,
            vec!["subscribe_states:hm.*", "unsubscribe_states:hm.*"]
        );
    }
}
