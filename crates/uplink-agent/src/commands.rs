//! The multiplexed command surface and its capability table.
//!
//! Every command the relay may invoke is one entry in [`CommandTable`]:
//! the required capability (resource class and operation) and the handler.
//! The table is the single source of truth, so `listPermissions` renders it
//! directly. Handlers answer through the node-style completion: first
//! payload element is the error or null.

use crate::acl::{check_object_access, Operation, Resource, ACCESS_READ, ACCESS_WRITE};
use crate::engine::{Completion, Engine};
use crate::session::SessionKey;
use crate::store::{CallOptions, Store};
use crate::subscriptions::{SubscriptionKind, LOG_KEY};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::warn;
use uplink_core::ERROR_PERMISSION;

pub type Permission = Option<(Resource, Operation)>;

pub type Handler<S> = for<'a> fn(
    &'a mut Engine<S>,
    SessionKey,
    Vec<Value>,
    Option<Completion>,
) -> BoxFuture<'a, ()>;

pub struct CommandDef<S: Store> {
    pub permission: Permission,
    pub handler: Handler<S>,
}

pub struct CommandTable<S: Store> {
    map: HashMap<&'static str, CommandDef<S>>,
}

const fn p(resource: Resource, operation: Operation) -> Permission {
    Some((resource, operation))
}

impl<S: Store> CommandTable<S> {
    pub fn lookup(&self, name: &str) -> Option<(Permission, Handler<S>)> {
        self.map.get(name).map(|d| (d.permission, d.handler))
    }

    /// Render the capability table for `listPermissions`.
    pub fn permissions_listing(&self) -> Value {
        let mut out = Map::new();
        for (name, def) in &self.map {
            let (resource, operation) = match def.permission {
                Some((r, o)) => (r.as_str(), o.as_str()),
                None => ("", ""),
            };
            out.insert(
                name.to_string(),
                json!({"type": resource, "operation": operation}),
            );
        }
        Value::Object(out)
    }

    pub fn new() -> Self {
        let mut map: HashMap<&'static str, CommandDef<S>> = HashMap::new();
        let mut cmd = |name: &'static str, permission: Permission, handler: Handler<S>| {
            map.insert(name, CommandDef { permission, handler });
        };

        // meta
        cmd("authenticate", None, |e, k, a, d| {
            Box::pin(e.cmd_authenticate(k, a, d))
        });
        cmd("name", None, |e, k, a, d| Box::pin(e.cmd_name(k, a, d)));
        cmd("getVersion", None, |e, k, a, d| {
            Box::pin(e.cmd_get_version(k, a, d))
        });
        cmd("authEnabled", None, |e, k, a, d| {
            Box::pin(e.cmd_auth_enabled(k, a, d))
        });
        cmd("listPermissions", None, |e, k, a, d| {
            Box::pin(e.cmd_list_permissions(k, a, d))
        });
        cmd("getUserPermissions", Some((Resource::Object, Operation::Read)), |e, k, a, d| {
            Box::pin(e.cmd_get_user_permissions(k, a, d))
        });
        cmd("logout", None, |e, k, a, d| Box::pin(e.cmd_logout(k, a, d)));

        // objects
        cmd("getObject", p(Resource::Object, Operation::Read), |e, k, a, d| {
            Box::pin(e.cmd_get_object(k, a, d))
        });
        cmd("getObjects", p(Resource::Object, Operation::List), |e, k, a, d| {
            Box::pin(e.cmd_get_objects(k, a, d))
        });
        cmd("getObjectView", p(Resource::Object, Operation::List), |e, k, a, d| {
            Box::pin(e.cmd_get_object_view(k, a, d))
        });
        cmd("setObject", p(Resource::Object, Operation::Write), |e, k, a, d| {
            Box::pin(e.cmd_set_object(k, a, d))
        });
        cmd("delObject", p(Resource::Object, Operation::Delete), |e, k, a, d| {
            Box::pin(e.cmd_del_object(k, a, d))
        });
        cmd("extendObject", p(Resource::Object, Operation::Write), |e, k, a, d| {
            Box::pin(e.cmd_extend_object(k, a, d))
        });
        cmd("getHostByIp", p(Resource::Object, Operation::List), |e, k, a, d| {
            Box::pin(e.cmd_get_host_by_ip(k, a, d))
        });
        cmd("subscribeObjects", p(Resource::Object, Operation::Read), |e, k, a, d| {
            Box::pin(e.cmd_subscribe_objects(k, a, d))
        });
        cmd("unsubscribeObjects", p(Resource::Object, Operation::Read), |e, k, a, d| {
            Box::pin(e.cmd_unsubscribe_objects(k, a, d))
        });

        // states
        cmd("getState", p(Resource::State, Operation::Read), |e, k, a, d| {
            Box::pin(e.cmd_get_state(k, a, d))
        });
        cmd("getStates", p(Resource::State, Operation::List), |e, k, a, d| {
            Box::pin(e.cmd_get_states(k, a, d))
        });
        cmd("setState", p(Resource::State, Operation::Write), |e, k, a, d| {
            Box::pin(e.cmd_set_state(k, a, d))
        });
        cmd("delState", p(Resource::State, Operation::Delete), |e, k, a, d| {
            Box::pin(e.cmd_del_state(k, a, d))
        });
        cmd("createState", p(Resource::State, Operation::Create), |e, k, a, d| {
            Box::pin(e.cmd_create_state(k, a, d))
        });
        cmd("subscribe", p(Resource::State, Operation::Read), |e, k, a, d| {
            Box::pin(e.cmd_subscribe_states(k, a, d))
        });
        cmd("subscribeStates", p(Resource::State, Operation::Read), |e, k, a, d| {
            Box::pin(e.cmd_subscribe_states(k, a, d))
        });
        cmd("unsubscribe", p(Resource::State, Operation::Read), |e, k, a, d| {
            Box::pin(e.cmd_unsubscribe_states(k, a, d))
        });
        cmd("unsubscribeStates", p(Resource::State, Operation::Read), |e, k, a, d| {
            Box::pin(e.cmd_unsubscribe_states(k, a, d))
        });
        cmd("getHistory", p(Resource::State, Operation::Read), |e, k, a, d| {
            Box::pin(e.cmd_get_history(k, a, d))
        });
        cmd("requireLog", p(Resource::Object, Operation::Write), |e, k, a, d| {
            Box::pin(e.cmd_require_log(k, a, d))
        });

        // files
        cmd("readFile", p(Resource::File, Operation::Read), |e, k, a, d| {
            Box::pin(e.cmd_read_file(k, a, d))
        });
        cmd("readFile64", p(Resource::File, Operation::Read), |e, k, a, d| {
            Box::pin(e.cmd_read_file64(k, a, d))
        });
        cmd("writeFile", p(Resource::File, Operation::Write), |e, k, a, d| {
            Box::pin(e.cmd_write_file(k, a, d))
        });
        cmd("writeFile64", p(Resource::File, Operation::Write), |e, k, a, d| {
            Box::pin(e.cmd_write_file64(k, a, d))
        });
        cmd("unlink", p(Resource::File, Operation::Delete), |e, k, a, d| {
            Box::pin(e.cmd_delete_file(k, a, d))
        });
        cmd("deleteFile", p(Resource::File, Operation::Delete), |e, k, a, d| {
            Box::pin(e.cmd_delete_file(k, a, d))
        });
        cmd("rename", p(Resource::File, Operation::Write), |e, k, a, d| {
            Box::pin(e.cmd_rename_file(k, a, d))
        });
        cmd("mkdir", p(Resource::File, Operation::Write), |e, k, a, d| {
            Box::pin(e.cmd_mkdir(k, a, d))
        });
        cmd("readDir", p(Resource::File, Operation::List), |e, k, a, d| {
            Box::pin(e.cmd_read_dir(k, a, d))
        });
        cmd("subscribeFiles", p(Resource::File, Operation::Read), |e, k, a, d| {
            Box::pin(e.cmd_subscribe_files(k, a, d))
        });
        cmd("unsubscribeFiles", p(Resource::File, Operation::Read), |e, k, a, d| {
            Box::pin(e.cmd_unsubscribe_files(k, a, d))
        });

        // users and groups
        cmd("addUser", p(Resource::Users, Operation::Create), |e, k, a, d| {
            Box::pin(e.cmd_add_user(k, a, d))
        });
        cmd("delUser", p(Resource::Users, Operation::Delete), |e, k, a, d| {
            Box::pin(e.cmd_del_user(k, a, d))
        });
        cmd("addGroup", p(Resource::Users, Operation::Create), |e, k, a, d| {
            Box::pin(e.cmd_add_group(k, a, d))
        });
        cmd("delGroup", p(Resource::Users, Operation::Delete), |e, k, a, d| {
            Box::pin(e.cmd_del_group(k, a, d))
        });
        cmd("changePassword", None, |e, k, a, d| {
            Box::pin(e.cmd_change_password(k, a, d))
        });

        // messaging
        cmd("sendTo", p(Resource::Other, Operation::SendTo), |e, k, a, d| {
            Box::pin(e.cmd_send_to(k, a, d))
        });
        cmd("sendToHost", p(Resource::Other, Operation::SendTo), |e, k, a, d| {
            Box::pin(e.cmd_send_to_host(k, a, d))
        });
        cmd("cmdExec", p(Resource::Other, Operation::Execute), |e, k, a, d| {
            Box::pin(e.cmd_cmd_exec(k, a, d))
        });

        Self { map }
    }
}

impl<S: Store> Default for CommandTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn arg_str(args: &[Value], i: usize) -> Option<String> {
    args.get(i).and_then(Value::as_str).map(str::to_string)
}

fn arg_bool(args: &[Value], i: usize) -> Option<bool> {
    args.get(i).and_then(Value::as_bool)
}

/// A pattern argument may be a single string or an array of strings.
fn arg_patterns(args: &[Value], i: usize) -> Vec<String> {
    match args.get(i) {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn respond<E: std::fmt::Display>(done: Option<Completion>, result: Result<Vec<Value>, E>) {
    let Some(done) = done else { return };
    match result {
        Ok(results) => done.ok(results),
        Err(e) => done.error(e.to_string()),
    }
}

fn fail(done: Option<Completion>, message: &str) {
    if let Some(done) = done {
        done.error(message);
    }
}

fn full_user_id(user: &str) -> String {
    if user.starts_with("system.user.") {
        user.to_string()
    } else {
        format!("system.user.{}", user.to_lowercase())
    }
}

fn valid_principal_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || "-_@+$. ".contains(c))
}

/// Recursive merge: object fields are merged per key, everything else is
/// replaced by the patch value.
fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (k, v) in patch {
                merge_json(base.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// A host object answers for an address when its hostname matches or any
/// of its network interfaces carries it.
fn host_matches_ip(host: &Value, ip: &str) -> bool {
    if host.pointer("/common/hostname").and_then(Value::as_str) == Some(ip) {
        return true;
    }
    host.pointer("/native/hardware/networkInterfaces")
        .and_then(Value::as_object)
        .is_some_and(|ifaces| {
            ifaces.values().any(|addrs| {
                addrs.as_array().is_some_and(|list| {
                    list.iter()
                        .any(|entry| entry.get("address").and_then(Value::as_str) == Some(ip))
                })
            })
        })
}

impl<S: Store> Engine<S> {
    fn call_options(&self, key: &SessionKey) -> CallOptions {
        let user = self
            .hub
            .session(key)
            .map(|s| s.acl.user.clone())
            .unwrap_or_else(|| self.opts.default_user.clone());
        CallOptions::for_user(&user)
    }

    // --- meta ---

    pub(crate) async fn cmd_authenticate(
        &mut self,
        key: SessionKey,
        _args: Vec<Value>,
        done: Option<Completion>,
    ) {
        // Identity was fixed at link start; just confirm it.
        let known = self.hub.session(&key).is_some();
        respond::<&str>(done, Ok(vec![json!(known)]));
    }

    pub(crate) async fn cmd_name(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        if let Some(session) = self.hub.session_mut(&key) {
            if session.name.is_none() {
                session.name = arg_str(&args, 0);
            }
        }
        respond::<&str>(done, Ok(vec![]));
    }

    pub(crate) async fn cmd_get_version(
        &mut self,
        _key: SessionKey,
        _args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let version = self.opts.version.clone();
        respond::<&str>(done, Ok(vec![json!(version), json!("uplink")]));
    }

    pub(crate) async fn cmd_auth_enabled(
        &mut self,
        key: SessionKey,
        _args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let user = self.call_options(&key).user;
        let short = user.strip_prefix("system.user.").unwrap_or(&user).to_string();
        respond::<&str>(done, Ok(vec![json!(false), json!(short)]));
    }

    pub(crate) async fn cmd_list_permissions(
        &mut self,
        _key: SessionKey,
        _args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let listing = self.table().permissions_listing();
        respond::<&str>(done, Ok(vec![listing]));
    }

    pub(crate) async fn cmd_get_user_permissions(
        &mut self,
        key: SessionKey,
        _args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let acl = self.hub.session(&key).map(|s| s.acl.clone());
        match acl.map(serde_json::to_value) {
            Some(Ok(value)) => respond::<&str>(done, Ok(vec![value])),
            _ => fail(done, "no session"),
        }
    }

    pub(crate) async fn cmd_logout(
        &mut self,
        key: SessionKey,
        _args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let sid = self
            .hub
            .session(&key)
            .and_then(|s| s.http_session_id.clone());
        if let Some(sid) = sid {
            respond(done, self.store.del_session(&sid).await.map(|_| vec![]));
        } else {
            respond::<&str>(done, Ok(vec![]));
        }
    }

    // --- objects ---

    pub(crate) async fn cmd_get_object(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let Some(id) = arg_str(&args, 0) else {
            return fail(done, "invalid id");
        };
        let opts = self.call_options(&key);
        match self.store.get_object(&id, &opts).await {
            Ok(Some(obj)) => {
                let allowed = self
                    .hub
                    .session(&key)
                    .map(|s| check_object_access(&obj, &s.acl, ACCESS_READ))
                    .unwrap_or(false);
                if allowed {
                    respond::<&str>(done, Ok(vec![obj]));
                } else {
                    fail(done, ERROR_PERMISSION);
                }
            }
            Ok(None) => respond::<&str>(done, Ok(vec![Value::Null])),
            Err(e) => respond(done, Err::<Vec<Value>, _>(e)),
        }
    }

    pub(crate) async fn cmd_get_objects(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let pattern = arg_str(&args, 0).unwrap_or_else(|| "*".to_string());
        let opts = self.call_options(&key);
        let result = self.store.get_objects(&pattern, None, &opts).await;
        respond(done, result.map(|objs| vec![objs]));
    }

    pub(crate) async fn cmd_get_object_view(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let (Some(design), Some(view)) = (arg_str(&args, 0), arg_str(&args, 1)) else {
            return fail(done, "invalid arguments");
        };
        let params = args.get(2).cloned().unwrap_or(Value::Null);
        let opts = self.call_options(&key);
        let result = self.store.get_object_view(&design, &view, params, &opts).await;
        respond(done, result.map(|rows| vec![rows]));
    }

    pub(crate) async fn cmd_set_object(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let Some(id) = arg_str(&args, 0) else {
            return fail(done, "invalid id");
        };
        let Some(object) = args.get(1).cloned() else {
            return fail(done, "invalid object");
        };
        if !self.can_touch_object(&key, &id).await {
            return fail(done, ERROR_PERMISSION);
        }
        let opts = self.call_options(&key);
        let result = self.store.set_object(&id, object, &opts).await;
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_del_object(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let Some(id) = arg_str(&args, 0) else {
            return fail(done, "invalid id");
        };
        if !self.can_touch_object(&key, &id).await {
            return fail(done, ERROR_PERMISSION);
        }
        let opts = self.call_options(&key);
        let result = self.store.del_object(&id, &opts).await;
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_extend_object(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let Some(id) = arg_str(&args, 0) else {
            return fail(done, "invalid id");
        };
        let Some(patch) = args.get(1).cloned() else {
            return fail(done, "invalid object");
        };
        if !self.can_touch_object(&key, &id).await {
            return fail(done, ERROR_PERMISSION);
        }
        let opts = self.call_options(&key);
        let mut object = match self.store.get_object(&id, &opts).await {
            Ok(existing) => existing.unwrap_or_else(|| json!({})),
            Err(e) => return fail(done, &e.to_string()),
        };
        merge_json(&mut object, &patch);
        let result = self.store.set_object(&id, object, &opts).await;
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_get_host_by_ip(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let Some(ip) = arg_str(&args, 0) else {
            return fail(done, "invalid arguments");
        };
        let opts = self.call_options(&key);
        match self
            .store
            .get_object_view("system", "host", json!({}), &opts)
            .await
        {
            Ok(view) => {
                let hit = view
                    .get("rows")
                    .and_then(Value::as_array)
                    .and_then(|rows| {
                        rows.iter()
                            .filter_map(|row| row.get("value"))
                            .find(|host| host_matches_ip(host, &ip))
                    })
                    .cloned();
                respond::<&str>(done, Ok(vec![json!(ip), hit.unwrap_or(Value::Null)]));
            }
            Err(e) => fail(done, &e.to_string()),
        }
    }

    /// Per-object write check against the existing object, if any.
    async fn can_touch_object(&self, key: &SessionKey, id: &str) -> bool {
        let Some(session) = self.hub.session(key) else {
            return false;
        };
        if session.acl.is_admin() {
            return true;
        }
        let opts = CallOptions::for_user(&session.acl.user);
        match self.store.get_object(id, &opts).await {
            Ok(Some(existing)) => check_object_access(&existing, &session.acl, ACCESS_WRITE),
            Ok(None) => true,
            Err(_) => false,
        }
    }

    pub(crate) async fn cmd_subscribe_objects(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        self.do_subscribe(key, args, done, SubscriptionKind::Object)
            .await;
    }

    pub(crate) async fn cmd_unsubscribe_objects(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        self.do_unsubscribe(key, args, done, SubscriptionKind::Object)
            .await;
    }

    // --- states ---

    pub(crate) async fn cmd_get_state(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let Some(id) = arg_str(&args, 0) else {
            return fail(done, "invalid id");
        };
        let opts = self.call_options(&key);
        let result = self.store.get_state(&id, &opts).await;
        respond(done, result.map(|state| vec![state.unwrap_or(Value::Null)]));
    }

    pub(crate) async fn cmd_get_states(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let pattern = arg_str(&args, 0).unwrap_or_else(|| "*".to_string());
        let opts = self.call_options(&key);
        let result = self.store.get_states(&pattern, &opts).await;
        respond(done, result.map(|states| vec![states]));
    }

    pub(crate) async fn cmd_set_state(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let Some(id) = arg_str(&args, 0) else {
            return fail(done, "invalid id");
        };
        let Some(state) = args.get(1).cloned() else {
            return fail(done, "invalid state");
        };
        // scalar values arrive bare; wrap them the way the store expects
        let state = if state.is_object() {
            state
        } else {
            json!({ "val": state })
        };
        let opts = self.call_options(&key);
        let result = self.store.set_state(&id, state, &opts).await;
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_del_state(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let Some(id) = arg_str(&args, 0) else {
            return fail(done, "invalid id");
        };
        let opts = self.call_options(&key);
        let result = self.store.del_state(&id, &opts).await;
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_create_state(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let Some(id) = arg_str(&args, 0) else {
            return fail(done, "invalid id");
        };
        let common = args.get(1).cloned().unwrap_or_else(|| json!({}));
        let value = args.get(2).cloned();
        let opts = self.call_options(&key);

        let object = json!({"type": "state", "common": common, "native": {}});
        if let Err(e) = self.store.set_object(&id, object, &opts).await {
            return fail(done, &e.to_string());
        }
        if let Some(value) = value {
            let state = if value.is_object() {
                value
            } else {
                json!({ "val": value })
            };
            if let Err(e) = self.store.set_state(&id, state, &opts).await {
                return fail(done, &e.to_string());
            }
        }
        respond::<&str>(done, Ok(vec![]));
    }

    pub(crate) async fn cmd_subscribe_states(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        self.do_subscribe(key, args, done, SubscriptionKind::State)
            .await;
    }

    pub(crate) async fn cmd_unsubscribe_states(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        self.do_unsubscribe(key, args, done, SubscriptionKind::State)
            .await;
    }

    async fn do_subscribe(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
        kind: SubscriptionKind,
    ) {
        let patterns = arg_patterns(&args, 0);
        if patterns.is_empty() {
            return fail(done, "invalid pattern");
        }
        let Engine {
            store,
            hub,
            registry,
            ..
        } = self;
        let Some(session) = hub.session_mut(&key) else {
            return fail(done, "no session");
        };
        for pattern in &patterns {
            if let Err(e) = registry.subscribe(store, session, kind, pattern).await {
                return fail(done, &e.to_string());
            }
        }
        respond::<&str>(done, Ok(vec![]));
    }

    async fn do_unsubscribe(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
        kind: SubscriptionKind,
    ) {
        let patterns = arg_patterns(&args, 0);
        let Engine {
            store,
            hub,
            registry,
            ..
        } = self;
        let Some(session) = hub.session_mut(&key) else {
            return fail(done, "no session");
        };
        let result = if patterns.is_empty() {
            // no pattern: drop everything of this kind
            registry.unsubscribe_kind(store, session, kind).await
        } else {
            let mut result = Ok(());
            for pattern in &patterns {
                result = registry.unsubscribe(store, session, kind, pattern).await;
                if result.is_err() {
                    break;
                }
            }
            result
        };
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_require_log(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let enabled = arg_bool(&args, 0).unwrap_or(false);
        let Engine {
            store,
            hub,
            registry,
            ..
        } = self;
        let Some(session) = hub.session_mut(&key) else {
            return fail(done, "no session");
        };
        let result = if enabled {
            registry
                .subscribe(store, session, SubscriptionKind::Log, LOG_KEY)
                .await
        } else {
            registry
                .unsubscribe(store, session, SubscriptionKind::Log, LOG_KEY)
                .await
        };
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_get_history(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let Some(id) = arg_str(&args, 0) else {
            return fail(done, "invalid id");
        };
        let options = args.get(1).cloned().unwrap_or(Value::Null);
        let opts = self.call_options(&key);
        let result = self.store.get_history(&id, options, &opts).await;
        respond(done, result.map(|rows| vec![rows]));
    }

    // --- files ---

    pub(crate) async fn cmd_read_file(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let (Some(adapter), Some(path)) = (arg_str(&args, 0), arg_str(&args, 1)) else {
            return fail(done, "invalid arguments");
        };
        let opts = self.call_options(&key);
        match self.store.read_file(&adapter, &path, &opts).await {
            Ok((data, mime)) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                respond::<&str>(done, Ok(vec![json!(text), json!(mime)]));
            }
            Err(e) => fail(done, &e.to_string()),
        }
    }

    pub(crate) async fn cmd_read_file64(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let (Some(adapter), Some(path)) = (arg_str(&args, 0), arg_str(&args, 1)) else {
            return fail(done, "invalid arguments");
        };
        let opts = self.call_options(&key);
        match self.store.read_file(&adapter, &path, &opts).await {
            Ok((data, mime)) => {
                respond::<&str>(done, Ok(vec![json!(BASE64.encode(data)), json!(mime)]));
            }
            Err(e) => fail(done, &e.to_string()),
        }
    }

    pub(crate) async fn cmd_write_file(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        warn!("writeFile carries raw text, clients should use writeFile64");
        let (Some(adapter), Some(path), Some(data)) =
            (arg_str(&args, 0), arg_str(&args, 1), arg_str(&args, 2))
        else {
            return fail(done, "invalid arguments");
        };
        let opts = self.call_options(&key);
        let result = self
            .store
            .write_file(&adapter, &path, data.into_bytes(), &opts)
            .await;
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_write_file64(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let (Some(adapter), Some(path), Some(data)) =
            (arg_str(&args, 0), arg_str(&args, 1), arg_str(&args, 2))
        else {
            return fail(done, "invalid arguments");
        };
        let Ok(bytes) = BASE64.decode(data.as_bytes()) else {
            return fail(done, "invalid base64");
        };
        let opts = self.call_options(&key);
        let result = self.store.write_file(&adapter, &path, bytes, &opts).await;
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_delete_file(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let (Some(adapter), Some(path)) = (arg_str(&args, 0), arg_str(&args, 1)) else {
            return fail(done, "invalid arguments");
        };
        let opts = self.call_options(&key);
        let result = self.store.delete_file(&adapter, &path, &opts).await;
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_rename_file(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let (Some(adapter), Some(from), Some(to)) =
            (arg_str(&args, 0), arg_str(&args, 1), arg_str(&args, 2))
        else {
            return fail(done, "invalid arguments");
        };
        let opts = self.call_options(&key);
        let result = self.store.rename_file(&adapter, &from, &to, &opts).await;
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_mkdir(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let (Some(adapter), Some(path)) = (arg_str(&args, 0), arg_str(&args, 1)) else {
            return fail(done, "invalid arguments");
        };
        let opts = self.call_options(&key);
        let result = self.store.mkdir(&adapter, &path, &opts).await;
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_read_dir(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let (Some(adapter), Some(path)) = (arg_str(&args, 0), arg_str(&args, 1)) else {
            return fail(done, "invalid arguments");
        };
        let opts = self.call_options(&key);
        let result = self.store.read_dir(&adapter, &path, &opts).await;
        respond(done, result.map(|entries| vec![json!(entries)]));
    }

    pub(crate) async fn cmd_subscribe_files(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let Some(object_id) = arg_str(&args, 0) else {
            return fail(done, "invalid id");
        };
        let patterns = arg_patterns(&args, 1);
        if patterns.is_empty() {
            return fail(done, "invalid pattern");
        }
        let Engine {
            store,
            hub,
            registry,
            ..
        } = self;
        let Some(session) = hub.session_mut(&key) else {
            return fail(done, "no session");
        };
        for pattern in &patterns {
            if let Err(e) = registry
                .subscribe_file(store, session, &object_id, pattern)
                .await
            {
                return fail(done, &e.to_string());
            }
        }
        respond::<&str>(done, Ok(vec![]));
    }

    pub(crate) async fn cmd_unsubscribe_files(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let Some(object_id) = arg_str(&args, 0) else {
            return fail(done, "invalid id");
        };
        let patterns = arg_patterns(&args, 1);
        let Engine {
            store,
            hub,
            registry,
            ..
        } = self;
        let Some(session) = hub.session_mut(&key) else {
            return fail(done, "no session");
        };
        for pattern in &patterns {
            if let Err(e) = registry
                .unsubscribe_file(store, session, &object_id, pattern)
                .await
            {
                return fail(done, &e.to_string());
            }
        }
        respond::<&str>(done, Ok(vec![]));
    }

    // --- users and groups ---

    pub(crate) async fn cmd_add_user(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let (Some(user), Some(password)) = (arg_str(&args, 0), arg_str(&args, 1)) else {
            return fail(done, "invalid arguments");
        };
        if !valid_principal_name(&user) {
            return fail(done, "invalid user name");
        }
        let id = full_user_id(&user);
        let opts = self.call_options(&key);
        match self.store.get_object(&id, &opts).await {
            Ok(Some(_)) => return fail(done, "user already exists"),
            Ok(None) => {}
            Err(e) => return fail(done, &e.to_string()),
        }
        let object = json!({
            "type": "user",
            "common": {"name": user, "enabled": true},
            "native": {},
        });
        if let Err(e) = self.store.set_object(&id, object, &opts).await {
            return fail(done, &e.to_string());
        }
        let result = self.store.set_password(&id, &password, &opts).await;
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_del_user(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let Some(user) = arg_str(&args, 0) else {
            return fail(done, "invalid arguments");
        };
        let id = full_user_id(&user);
        let opts = self.call_options(&key);
        match self.store.get_object(&id, &opts).await {
            Ok(Some(obj)) => {
                let protected = obj
                    .pointer("/common/dontDelete")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if protected {
                    return fail(done, "user is protected");
                }
            }
            Ok(None) => return fail(done, "user does not exist"),
            Err(e) => return fail(done, &e.to_string()),
        }
        let result = self.store.del_object(&id, &opts).await;
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_add_group(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let Some(group) = arg_str(&args, 0) else {
            return fail(done, "invalid arguments");
        };
        if !valid_principal_name(&group) {
            return fail(done, "invalid group name");
        }
        let desc = args.get(1).cloned().unwrap_or(Value::Null);
        let id = format!("system.group.{}", group.to_lowercase());
        let opts = self.call_options(&key);
        match self.store.get_object(&id, &opts).await {
            Ok(Some(_)) => return fail(done, "group already exists"),
            Ok(None) => {}
            Err(e) => return fail(done, &e.to_string()),
        }
        let object = json!({
            "type": "group",
            "common": {"name": group, "desc": desc, "members": []},
            "native": {},
        });
        let result = self.store.set_object(&id, object, &opts).await;
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_del_group(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let Some(group) = arg_str(&args, 0) else {
            return fail(done, "invalid arguments");
        };
        let id = format!("system.group.{}", group.to_lowercase());
        let opts = self.call_options(&key);
        match self.store.get_object(&id, &opts).await {
            Ok(Some(obj)) => {
                let protected = obj
                    .pointer("/common/dontDelete")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if protected {
                    return fail(done, "group is protected");
                }
            }
            Ok(None) => return fail(done, "group does not exist"),
            Err(e) => return fail(done, &e.to_string()),
        }
        let result = self.store.del_object(&id, &opts).await;
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_change_password(
        &mut self,
        key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let (Some(user), Some(password)) = (arg_str(&args, 0), arg_str(&args, 1)) else {
            return fail(done, "invalid arguments");
        };
        let id = full_user_id(&user);
        // users may change their own password, user managers anyone's
        let own = self
            .hub
            .session(&key)
            .map(|s| s.acl.user == id)
            .unwrap_or(false);
        let can_manage = self
            .hub
            .session(&key)
            .map(|s| s.acl.allows(Resource::Users, Operation::Write))
            .unwrap_or(false);
        if !own && !can_manage {
            self.deny(
                &key,
                "changePassword",
                Some((Resource::Users, Operation::Write)),
                args.first(),
                done,
            );
            return;
        }
        let opts = self.call_options(&key);
        let result = self.store.set_password(&id, &password, &opts).await;
        respond(done, result.map(|_| vec![]));
    }

    // --- messaging ---

    fn service_allowed(&self, target: &str) -> bool {
        let allowed = &self.opts.allowed_services;
        if allowed.iter().any(|s| s == "*") {
            return true;
        }
        let base = target.split('.').next().unwrap_or(target);
        allowed.iter().any(|s| s == base)
    }

    pub(crate) async fn cmd_send_to(
        &mut self,
        _key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let (Some(target), Some(command)) = (arg_str(&args, 0), arg_str(&args, 1)) else {
            return fail(done, "invalid arguments");
        };
        if !self.service_allowed(&target) {
            warn!(target = %target, "sendTo target not in allowed services");
            return fail(done, "not allowed");
        }
        let message = args.get(2).cloned().unwrap_or(Value::Null);
        match self.store.send_to(&target, &command, message).await {
            Ok(reply) => respond::<&str>(done, Ok(vec![reply.unwrap_or(Value::Null)])),
            Err(e) => fail(done, &e.to_string()),
        }
    }

    pub(crate) async fn cmd_send_to_host(
        &mut self,
        _key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let (Some(host), Some(command)) = (arg_str(&args, 0), arg_str(&args, 1)) else {
            return fail(done, "invalid arguments");
        };
        let message = args.get(2).cloned().unwrap_or(Value::Null);
        let result = self.store.send_to_host(&host, &command, message).await;
        respond(done, result.map(|_| vec![]));
    }

    pub(crate) async fn cmd_cmd_exec(
        &mut self,
        _key: SessionKey,
        args: Vec<Value>,
        done: Option<Completion>,
    ) {
        let (Some(host), Some(exec_id), Some(command)) =
            (arg_str(&args, 0), arg_str(&args, 1), arg_str(&args, 2))
        else {
            return fail(done, "invalid arguments");
        };
        let result = self
            .store
            .send_to_host(&host, "cmdExec", json!({"data": command, "id": exec_id}))
            .await;
        respond(done, result.map(|_| vec![]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{Acl, Grants};
    use crate::engine::EngineOptions;
    use crate::session::RelayStrategy;
    use crate::store::MemoryStore;
    use uplink_core::Envelope;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    async fn engine_with(
        allowed_services: Vec<String>,
    ) -> (Engine<MemoryStore>, UnboundedReceiver<Envelope>) {
        let (tx, rx) = unbounded_channel();
        let opts = EngineOptions {
            default_user: "system.user.admin".into(),
            ttl: std::time::Duration::from_secs(3600),
            whitelist: HashMap::new(),
            allowed_services,
            version: "0.1.0".into(),
        };
        let mut engine = Engine::new(MemoryStore::new(), Box::new(RelayStrategy), opts, tx);
        engine.start_link().await.unwrap();
        (engine, rx)
    }

    async fn engine() -> (Engine<MemoryStore>, UnboundedReceiver<Envelope>) {
        engine_with(vec!["*".into()]).await
    }

    fn ack(rx: &mut UnboundedReceiver<Envelope>) -> Vec<Value> {
        match rx.try_recv().expect("expected an ack") {
            Envelope::Ack { payload, .. } => payload,
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn state_set_then_get_round_trips() {
        let (mut engine, mut rx) = engine().await;
        engine
            .dispatch("abc", "setState", vec![json!("hm.0.light"), json!(true)], Some(1))
            .await;
        assert_eq!(ack(&mut rx)[0], Value::Null);

        engine
            .dispatch("abc", "getState", vec![json!("hm.0.light")], Some(2))
            .await;
        let payload = ack(&mut rx);
        assert_eq!(payload[0], Value::Null);
        // bare values are wrapped on the way in
        assert_eq!(payload[1], json!({"val": true}));
    }

    #[tokio::test]
    async fn get_object_honors_per_object_bits() {
        let (mut engine, mut rx) = engine().await;
        engine
            .store()
            .seed_object(
                "secret.0.config",
                json!({
                    "type": "state",
                    "acl": {"object": 0, "owner": "system.user.other", "ownerGroup": "system.group.x"}
                }),
            )
            .await;
        engine.hub.real_mut().unwrap().acl = Acl {
            user: "system.user.guest".into(),
            object: Grants {
                read: true,
                ..Grants::default()
            },
            ..Acl::default()
        };

        engine
            .dispatch("abc", "getObject", vec![json!("secret.0.config")], Some(1))
            .await;
        assert_eq!(ack(&mut rx), vec![json!(ERROR_PERMISSION)]);
    }

    #[tokio::test]
    async fn send_to_respects_allowed_services() {
        let (mut engine, mut rx) = engine_with(vec!["text2command".into()]).await;

        engine
            .dispatch(
                "abc",
                "sendTo",
                vec![json!("text2command.0"), json!("send"), json!({"text": "on"})],
                Some(1),
            )
            .await;
        assert_eq!(ack(&mut rx)[0], Value::Null);

        engine
            .dispatch(
                "abc",
                "sendTo",
                vec![json!("sql.0"), json!("query"), json!("select 1")],
                Some(2),
            )
            .await;
        assert_eq!(ack(&mut rx), vec![json!("not allowed")]);
    }

    #[tokio::test]
    async fn add_then_delete_user() {
        let (mut engine, mut rx) = engine().await;
        engine
            .dispatch("abc", "addUser", vec![json!("Carol"), json!("pw")], Some(1))
            .await;
        assert_eq!(ack(&mut rx)[0], Value::Null);

        let stored = engine
            .store()
            .get_object("system.user.carol", &CallOptions::default())
            .await
            .unwrap();
        assert!(stored.is_some());

        // second add of the same name fails
        engine
            .dispatch("abc", "addUser", vec![json!("carol"), json!("pw")], Some(2))
            .await;
        assert_eq!(ack(&mut rx), vec![json!("user already exists")]);

        engine
            .dispatch("abc", "delUser", vec![json!("carol")], Some(3))
            .await;
        assert_eq!(ack(&mut rx)[0], Value::Null);
    }

    #[tokio::test]
    async fn protected_user_cannot_be_deleted() {
        let (mut engine, mut rx) = engine().await;
        engine
            .store()
            .seed_object(
                "system.user.admin",
                json!({"type": "user", "common": {"dontDelete": true}}),
            )
            .await;

        engine
            .dispatch("abc", "delUser", vec![json!("admin")], Some(1))
            .await;
        assert_eq!(ack(&mut rx), vec![json!("user is protected")]);
    }

    #[tokio::test]
    async fn change_password_self_allowed_other_denied() {
        let (mut engine, mut rx) = engine().await;
        engine
            .store()
            .seed_object("system.user.guest", json!({"type": "user", "common": {}}))
            .await;
        engine.hub.real_mut().unwrap().acl = Acl {
            user: "system.user.guest".into(),
            ..Acl::default()
        };

        engine
            .dispatch(
                "abc",
                "changePassword",
                vec![json!("guest"), json!("new")],
                Some(1),
            )
            .await;
        assert_eq!(ack(&mut rx)[0], Value::Null);

        engine
            .dispatch(
                "abc",
                "changePassword",
                vec![json!("admin"), json!("new")],
                Some(2),
            )
            .await;
        assert_eq!(ack(&mut rx), vec![json!(ERROR_PERMISSION)]);
    }

    #[tokio::test]
    async fn change_password_with_user_manager_grant() {
        let (mut engine, mut rx) = engine().await;
        engine
            .store()
            .seed_object("system.user.guest", json!({"type": "user", "common": {}}))
            .await;
        // not an admin, but holds the users.write capability
        engine.hub.real_mut().unwrap().acl = Acl {
            user: "system.user.operator".into(),
            users: Grants {
                write: true,
                ..Grants::default()
            },
            ..Acl::default()
        };

        engine
            .dispatch(
                "abc",
                "changePassword",
                vec![json!("guest"), json!("new")],
                Some(1),
            )
            .await;
        assert_eq!(ack(&mut rx)[0], Value::Null);
    }

    #[tokio::test]
    async fn host_commands_follow_the_capability_table() {
        let (mut engine, mut rx) = engine().await;
        engine.hub.real_mut().unwrap().acl = Acl {
            user: "system.user.operator".into(),
            other: Grants {
                sendto: true,
                execute: true,
                ..Grants::default()
            },
            ..Acl::default()
        };

        engine
            .dispatch(
                "abc",
                "sendToHost",
                vec![json!("system.host.pi"), json!("getRepository"), json!({})],
                Some(1),
            )
            .await;
        assert_eq!(ack(&mut rx)[0], Value::Null);

        engine
            .dispatch(
                "abc",
                "cmdExec",
                vec![json!("system.host.pi"), json!("55"), json!("ls")],
                Some(2),
            )
            .await;
        assert_eq!(ack(&mut rx)[0], Value::Null);

        assert_eq!(
            engine.store().hook_calls().await,
            vec![
                "send_to_host:system.host.pi:getRepository",
                "send_to_host:system.host.pi:cmdExec",
            ]
        );
    }

    #[tokio::test]
    async fn extend_object_merges_into_existing() {
        let (mut engine, mut rx) = engine().await;
        engine
            .store()
            .seed_object(
                "hm.0.light",
                json!({"type": "state", "common": {"name": "light", "role": "switch"}, "native": {}}),
            )
            .await;

        engine
            .dispatch(
                "abc",
                "extendObject",
                vec![json!("hm.0.light"), json!({"common": {"name": "lamp"}})],
                Some(1),
            )
            .await;
        assert_eq!(ack(&mut rx)[0], Value::Null);

        let stored = engine
            .store()
            .get_object("hm.0.light", &CallOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.pointer("/common/name"), Some(&json!("lamp")));
        // untouched sibling fields survive the merge
        assert_eq!(stored.pointer("/common/role"), Some(&json!("switch")));
    }

    #[tokio::test]
    async fn get_host_by_ip_matches_interface_address() {
        let (mut engine, mut rx) = engine().await;
        engine
            .store()
            .seed_object(
                "system.host.pi",
                json!({
                    "type": "host",
                    "common": {"hostname": "pi"},
                    "native": {"hardware": {"networkInterfaces": {
                        "eth0": [{"address": "192.168.1.5"}]
                    }}},
                }),
            )
            .await;

        engine
            .dispatch("abc", "getHostByIp", vec![json!("192.168.1.5")], Some(1))
            .await;
        let payload = ack(&mut rx);
        assert_eq!(payload[0], Value::Null);
        assert_eq!(payload[1], json!("192.168.1.5"));
        assert_eq!(payload[2].pointer("/common/hostname"), Some(&json!("pi")));

        // unknown address answers with null
        engine
            .dispatch("abc", "getHostByIp", vec![json!("10.0.0.9")], Some(2))
            .await;
        let payload = ack(&mut rx);
        assert_eq!(payload[1], json!("10.0.0.9"));
        assert_eq!(payload[2], Value::Null);
    }

    #[tokio::test]
    async fn get_history_queries_backend() {
        let (mut engine, mut rx) = engine().await;
        engine
            .dispatch(
                "abc",
                "getHistory",
                vec![json!("hm.0.temp"), json!({"start": 0})],
                Some(1),
            )
            .await;
        let payload = ack(&mut rx);
        assert_eq!(payload[0], Value::Null);
        assert_eq!(payload[1], json!([]));
        assert_eq!(
            engine.store().hook_calls().await,
            vec!["get_history:hm.0.temp"]
        );
    }

    #[tokio::test]
    async fn write_then_read_file64_round_trips() {
        let (mut engine, mut rx) = engine().await;
        let encoded = BASE64.encode(b"hello");
        engine
            .dispatch(
                "abc",
                "writeFile64",
                vec![json!("vis.0"), json!("main/views.json"), json!(encoded)],
                Some(1),
            )
            .await;
        assert_eq!(ack(&mut rx)[0], Value::Null);

        engine
            .dispatch(
                "abc",
                "readFile64",
                vec![json!("vis.0"), json!("main/views.json")],
                Some(2),
            )
            .await;
        let payload = ack(&mut rx);
        assert_eq!(payload[1], json!(BASE64.encode(b"hello")));
        assert_eq!(payload[2], json!("application/json"));
    }

    #[tokio::test]
    async fn require_log_drives_backend_latch() {
        let (mut engine, mut rx) = engine().await;
        engine
            .dispatch("abc", "requireLog", vec![json!(true)], Some(1))
            .await;
        assert_eq!(ack(&mut rx)[0], Value::Null);
        engine
            .dispatch("abc", "requireLog", vec![json!(false)], Some(2))
            .await;
        assert_eq!(ack(&mut rx)[0], Value::Null);

        assert_eq!(
            engine.store().hook_calls().await,
            vec!["require_log:true", "require_log:false"]
        );
    }

    #[tokio::test]
    async fn list_permissions_reflects_table() {
        let (mut engine, mut rx) = engine().await;
        engine
            .dispatch("abc", "listPermissions", vec![], Some(1))
            .await;
        let payload = ack(&mut rx);
        let listing = payload[1].as_object().unwrap();
        assert_eq!(
            listing["setState"],
            json!({"type": "state", "operation": "write"})
        );
        assert_eq!(listing["authenticate"], json!({"type": "", "operation": ""}));
    }

    #[tokio::test]
    async fn get_version_names_the_agent() {
        let (mut engine, mut rx) = engine().await;
        engine.dispatch("abc", "getVersion", vec![], Some(1)).await;
        let payload = ack(&mut rx);
        assert_eq!(payload[2], json!("uplink"));
    }
}
