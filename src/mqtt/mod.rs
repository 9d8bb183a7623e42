//! # MQTT Session Layer
//!
//! Owns the one connection to the home automation broker and everything the
//! rest of the client needs from it: presence, topic subscriptions with
//! handler routing, publishing and recovery from a dropped link.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs     - broker and timing parameters
//! ├── message.rs    - inbound messages, outbound payloads, topic names
//! ├── registry.rs   - topic to handler map, retained topics
//! ├── transport.rs  - Transport trait, rumqttc adapter, shared link flags
//! ├── session.rs    - SessionManager: connect, subscribe, publish, watchdog
//! └── reconnect.rs  - reconnect state machine with exponential backoff
//! ```
//!
//! ## Threading
//!
//! The rumqttc event loop runs on its own task. It never calls back into the
//! session: it flips atomics on [`transport::LinkState`] and queues inbound
//! messages. The control loop drains that queue once per tick and is the only
//! place the registry is touched.
//!
//! ## Topics
//!
//! All topics live below one namespace (`miniplayer` by default):
//!
//! - `<ns>/connection/<id>`: `connected` or `disconnected`, the latter also
//!   registered as last will
//! - `<ns>/window`: remote window switch
//! - `<ns>/<domain>/active/<id>`: `true` while a window for `domain` shows
//! - `<ns>/<domain>/response` and `<ns>/<domain>/action`: state and commands

pub mod config;
pub mod message;
#[cfg(test)]
pub mod mock;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod transport;
