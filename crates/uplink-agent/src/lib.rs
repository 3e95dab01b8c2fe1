//! uplink-agent: the agent side of the uplink cloud relay.
//!
//! The agent dials out to a relay over one persistent connection, proves
//! its identity with an app key, and multiplexes many remote end-user
//! sessions onto that link: permission-checked commands against a local
//! automation [`store::Store`], refcounted change subscriptions, and a
//! supervisor that owns the whole connection lifecycle including the
//! relay's wait/redirect/stop instructions.

pub mod acl;
pub mod commands;
pub mod config;
pub mod connection;
pub mod engine;
pub mod session;
pub mod store;
pub mod subscriptions;
pub mod transport;

pub use acl::{Acl, WhitelistEntry};
pub use config::AgentConfig;
pub use connection::{LinkState, ShutdownHandle, Supervisor, Termination};
pub use engine::{Completion, DispatchOutcome, Engine, EngineOptions, TunnelBridge};
pub use session::{DirectStrategy, RelayStrategy, Session, SessionHub, SessionKey};
pub use store::{CallOptions, MemoryStore, Store, StoreEvent};
pub use subscriptions::{SubscriptionKind, SubscriptionRegistry};
pub use transport::websocket::WsDialer;
pub use transport::{RelayDial, RelayLink};
