//! Control messages exchanged over the relay link.
//!
//! Every frame on the persistent connection is one [`Envelope`]. The agent
//! dials out, sends [`Envelope::Apikey`] and waits for the
//! [`Envelope::HandshakeReply`]; afterwards the relay multiplexes remote
//! end-user commands through [`Envelope::Mc`] and the agent answers through
//! [`Envelope::Ack`] and pushes change events.
//!
//! The liveness probe uses the names `pingg`/`pongg` so it cannot collide
//! with transport-level keep-alive frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision announced during the handshake.
pub const PROTOCOL_VERSION: &str = "1";

/// A control frame on the relay link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    /// Client→relay handshake: identify this agent.
    Apikey {
        apikey: String,
        version: String,
        uuid: String,
    },

    /// Relay→client handshake outcome: an error string, an instruction, a
    /// `valid_till` timestamp — or none of them, which means "accepted".
    #[serde(rename_all = "camelCase")]
    HandshakeReply {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        valid_till: Option<i64>,
        #[serde(default)]
        instruction: Option<ControlCommand>,
    },

    /// Liveness probe.
    Pingg,
    /// Liveness acknowledgment.
    Pongg,

    /// Multiplexed command envelope: one remote end-user session invoking
    /// one command. `ack` is the completion correlation id, if the caller
    /// wants an answer.
    #[serde(rename_all = "camelCase")]
    Mc {
        remote_id: String,
        command: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        ack: Option<u64>,
    },

    /// Completion answer to an [`Envelope::Mc`]. By convention the first
    /// payload element is the error (or null), followed by the results.
    Ack {
        id: u64,
        #[serde(default)]
        payload: Vec<Value>,
    },

    /// A remote end-user attached to the relay.
    #[serde(rename_all = "camelCase")]
    CloudConnect { remote_id: String },

    /// A remote end-user detached. Without a `remote_id` the relay signals
    /// that it stopped multiplexing entirely: every virtual session dies.
    #[serde(rename_all = "camelCase")]
    CloudDisconnect {
        #[serde(default)]
        remote_id: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },

    /// Relay announces its protocol revision.
    CloudVersion { version: String },

    /// Inline control instruction on an established link.
    CloudCommand { command: ControlCommand },

    /// State change event, addressed to one session (`None` = real session).
    #[serde(rename_all = "camelCase")]
    StateChange {
        #[serde(default)]
        remote_id: Option<String>,
        id: String,
        #[serde(default)]
        state: Option<Value>,
    },

    /// Object change event.
    #[serde(rename_all = "camelCase")]
    ObjectChange {
        #[serde(default)]
        remote_id: Option<String>,
        id: String,
        #[serde(default)]
        object: Option<Value>,
    },

    /// File change event.
    #[serde(rename_all = "camelCase")]
    FileChange {
        #[serde(default)]
        remote_id: Option<String>,
        id: String,
        file: String,
        #[serde(default)]
        size: Option<u64>,
    },

    /// Forwarded log message.
    #[serde(rename_all = "camelCase")]
    Log {
        #[serde(default)]
        remote_id: Option<String>,
        message: Value,
    },

    /// The session behind this id must authenticate again.
    #[serde(rename_all = "camelCase")]
    Reauthenticate {
        #[serde(default)]
        remote_id: Option<String>,
    },

    /// A capability check failed and no completion was available to carry
    /// the error.
    #[serde(rename_all = "camelCase")]
    PermissionError {
        #[serde(default)]
        remote_id: Option<String>,
        info: PermissionErrorInfo,
    },
}

/// Remote control instruction, either inside the handshake reply or as an
/// inline [`Envelope::CloudCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum ControlCommand {
    /// Suspend reconnecting for the given number of seconds, then retry.
    #[serde(rename_all = "camelCase")]
    Wait {
        #[serde(default)]
        delay_seconds: Option<u64>,
    },

    /// Connect to a different relay endpoint. With `not_save` the switch
    /// lasts for the current run only; otherwise it is written into the
    /// stored configuration.
    #[serde(rename_all = "camelCase")]
    Redirect {
        url: String,
        #[serde(default)]
        not_save: bool,
        #[serde(default)]
        reason: Option<String>,
    },

    /// Administrative kill-switch: disable this agent and exit.
    Stop {
        #[serde(default)]
        reason: Option<String>,
    },

    /// Log a message from the relay.
    Log { message: String },
}

/// Details carried by a permission-error notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionErrorInfo {
    pub command: String,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub arg: Option<Value>,
}

/// Error token delivered through completions when a capability check fails.
pub const ERROR_PERMISSION: &str = "permissionError";
