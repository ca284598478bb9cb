//! Client-side sync engine for a real-time group messaging session.
//!
//! [`SyncEngine`] mirrors the channels, members and messages visible to one
//! identity, applies local edits optimistically, reconciles them with server
//! replies and events, and fans the resulting [`ClientEvent`]s out to
//! observers.

pub mod access;
mod channel;
pub mod config;
mod coordinator;
mod correlator;
mod dispatcher;
mod engine;
pub mod error;
mod events;
pub mod loopback;
mod members;
mod messages;
mod registry;
pub mod transport;
mod typing;
mod worker;

pub use access::{AccessEvent, AccessManager, StaticAccessManager};
pub use channel::{ChannelOptions, ChannelSnapshot};
pub use config::{load_settings, load_settings_from, Settings};
pub use dispatcher::{ClientObserver, ObserverHandle};
pub use engine::{SessionState, SyncEngine, VERSION};
pub use error::{CommandResult, SyncError};
pub use events::{ClientEvent, EventKind};
pub use loopback::LoopbackTransport;
pub use members::Member;
pub use messages::Message;
pub use transport::{MissingTransport, Transport};

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
