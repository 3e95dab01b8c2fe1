//! uplink-core: shared protocol library for the uplink relay agent.
//!
//! Provides the CBOR envelope types exchanged over the relay link, the
//! length-prefixed framing codec, glob pattern compilation for change
//! subscriptions, and the common error taxonomy.

pub mod codec;
pub mod error;
pub mod messages;
pub mod pattern;

// Re-export commonly used items at crate root.
pub use codec::{decode_payload, encode_frame, FrameDecoder};
pub use error::{UplinkError, UplinkResult};
pub use messages::{ControlCommand, Envelope, PermissionErrorInfo, ERROR_PERMISSION, PROTOCOL_VERSION};
pub use pattern::{file_key, Matcher, FILE_KEY_SEP};
