//! Access control: effective user grants, address whitelist patching and
//! object-level permission bits.
//!
//! A session carries one [`Acl`] computed once at link start: the configured
//! default user's grants, patched by the whitelist entry matching the client
//! address. Command dispatch consults [`Acl::allows`] before running a
//! handler; object reads and writes additionally test the per-object
//! owner/group/other bits via [`check_object_access`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const USER_ADMIN: &str = "system.user.admin";
pub const GROUP_ADMIN: &str = "system.group.administrator";

/// Sentinel user in a whitelist entry meaning "keep the authenticated user".
pub const WHITELIST_KEEP_USER: &str = "auth";

/// Read bit in an object's `acl.object` permission word.
pub const ACCESS_READ: u32 = 0x4;
/// Write bit in an object's `acl.object` permission word.
pub const ACCESS_WRITE: u32 = 0x2;

/// Resource class a command operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Object,
    State,
    File,
    Users,
    Other,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Object => "object",
            Resource::State => "state",
            Resource::File => "file",
            Resource::Users => "users",
            Resource::Other => "other",
        }
    }
}

/// Operation class within a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
    Create,
    Delete,
    List,
    Execute,
    SendTo,
    Http,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Create => "create",
            Operation::Delete => "delete",
            Operation::List => "list",
            Operation::Execute => "execute",
            Operation::SendTo => "sendto",
            Operation::Http => "http",
        }
    }
}

/// Per-resource operation flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Grants {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub delete: bool,
    pub list: bool,
    pub execute: bool,
    pub sendto: bool,
    pub http: bool,
}

impl Grants {
    pub fn all() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            delete: true,
            list: true,
            execute: true,
            sendto: true,
            http: true,
        }
    }

    pub fn get(&self, op: Operation) -> bool {
        match op {
            Operation::Read => self.read,
            Operation::Write => self.write,
            Operation::Create => self.create,
            Operation::Delete => self.delete,
            Operation::List => self.list,
            Operation::Execute => self.execute,
            Operation::SendTo => self.sendto,
            Operation::Http => self.http,
        }
    }
}

/// Effective permissions of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Acl {
    pub user: String,
    pub groups: Vec<String>,
    pub object: Grants,
    pub state: Grants,
    pub file: Grants,
    pub users: Grants,
    pub other: Grants,
}

impl Default for Acl {
    fn default() -> Self {
        Self {
            user: String::new(),
            groups: Vec::new(),
            object: Grants::default(),
            state: Grants::default(),
            file: Grants::default(),
            users: Grants::default(),
            other: Grants::default(),
        }
    }
}

impl Acl {
    /// Full grants for the built-in admin user.
    pub fn admin() -> Self {
        Self {
            user: USER_ADMIN.to_string(),
            groups: vec![GROUP_ADMIN.to_string()],
            object: Grants::all(),
            state: Grants::all(),
            file: Grants::all(),
            users: Grants::all(),
            other: Grants::all(),
        }
    }

    /// The admin user and any member of the administrator group bypass all
    /// checks, including per-object bits.
    pub fn is_admin(&self) -> bool {
        self.user == USER_ADMIN || self.groups.iter().any(|g| g == GROUP_ADMIN)
    }

    fn section(&self, resource: Resource) -> &Grants {
        match resource {
            Resource::Object => &self.object,
            Resource::State => &self.state,
            Resource::File => &self.file,
            Resource::Users => &self.users,
            Resource::Other => &self.other,
        }
    }

    /// Test whether this ACL grants the operation on the resource class.
    pub fn allows(&self, resource: Resource, op: Operation) -> bool {
        self.is_admin() || self.section(resource).get(op)
    }
}

/// Per-resource flag overrides in a whitelist entry. A flag left out keeps
/// the session's own value; a flag set to `false` revokes it; `true` alone
/// cannot grant what the user does not already have (flags are ANDed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrantsPatch {
    pub read: Option<bool>,
    pub write: Option<bool>,
    pub create: Option<bool>,
    pub delete: Option<bool>,
    pub list: Option<bool>,
}

impl GrantsPatch {
    fn apply(&self, grants: &mut Grants) {
        if let Some(v) = self.read {
            grants.read &= v;
        }
        if let Some(v) = self.write {
            grants.write &= v;
        }
        if let Some(v) = self.create {
            grants.create &= v;
        }
        if let Some(v) = self.delete {
            grants.delete &= v;
        }
        if let Some(v) = self.list {
            grants.list &= v;
        }
    }
}

/// One whitelist entry, keyed in the config by an exact address or a
/// wildcard pattern like `192.168.1.*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhitelistEntry {
    /// Short user name to run as, or `"auth"` to keep the session user.
    pub user: String,
    pub object: GrantsPatch,
    pub state: GrantsPatch,
    pub file: GrantsPatch,
}

impl Default for WhitelistEntry {
    fn default() -> Self {
        Self {
            user: WHITELIST_KEEP_USER.to_string(),
            object: GrantsPatch::default(),
            state: GrantsPatch::default(),
            file: GrantsPatch::default(),
        }
    }
}

/// Find the whitelist entry for a client address: exact match first, then
/// the wildcard entry with the longest matching dotted prefix, then the
/// `"default"` entry if present.
pub fn whitelist_entry_for<'a>(
    address: &str,
    whitelist: &'a HashMap<String, WhitelistEntry>,
) -> Option<&'a WhitelistEntry> {
    if let Some(entry) = whitelist.get(address) {
        return Some(entry);
    }

    let addr_parts: Vec<&str> = address.split('.').collect();
    let mut best: Option<(usize, &WhitelistEntry)> = None;

    for (key, entry) in whitelist {
        if !key.contains('*') {
            continue;
        }
        let parts: Vec<&str> = key.split('.').collect();
        if parts.len() != addr_parts.len() {
            continue;
        }
        let Some(star) = parts.iter().position(|p| *p == "*") else {
            continue;
        };
        if parts[..star] != addr_parts[..star] {
            continue;
        }
        if best.map_or(true, |(len, _)| star > len) {
            best = Some((star, entry));
        }
    }

    best.map(|(_, entry)| entry)
        .or_else(|| whitelist.get("default"))
}

/// Patch a session ACL with the whitelist entry for the client address.
/// Flags are ANDed where the entry specifies them; a non-`"auth"` entry
/// user replaces the session identity.
pub fn merge_acls(
    mut acl: Acl,
    address: Option<&str>,
    whitelist: &HashMap<String, WhitelistEntry>,
) -> Acl {
    let Some(address) = address else { return acl };
    let Some(entry) = whitelist_entry_for(address, whitelist) else {
        return acl;
    };

    entry.object.apply(&mut acl.object);
    entry.state.apply(&mut acl.state);
    entry.file.apply(&mut acl.file);

    if entry.user != WHITELIST_KEEP_USER {
        acl.user = if entry.user.starts_with("system.user.") {
            entry.user.clone()
        } else {
            format!("system.user.{}", entry.user)
        };
    }

    acl
}

/// Test per-object permission bits (`flag` is [`ACCESS_READ`] or
/// [`ACCESS_WRITE`]): owner bits shifted by 8, group bits by 4, other bits
/// unshifted. Objects without an ACL are open.
pub fn check_object_access(object: &Value, acl: &Acl, flag: u32) -> bool {
    if acl.is_admin() {
        return true;
    }

    let Some(obj_acl) = object.get("acl") else {
        return true;
    };
    let Some(perms) = obj_acl.get("object").and_then(Value::as_u64) else {
        return true;
    };
    let perms = perms as u32;

    let owner = obj_acl.get("owner").and_then(Value::as_str).unwrap_or("");
    if owner == acl.user {
        return perms & (flag << 8) != 0;
    }

    let owner_group = obj_acl
        .get("ownerGroup")
        .and_then(Value::as_str)
        .unwrap_or("");
    if acl.groups.iter().any(|g| g == owner_group) {
        return perms & (flag << 4) != 0;
    }

    perms & flag != 0
}
