//! WebSocket gateway for the Parley agent engine.
//!
//! Each connection identifies its caller once, then streams chat turns:
//! engine events are forwarded as `chat.event` frames while the turn runs,
//! and the turn's result arrives as the response to its request.

pub mod connection;
pub mod events;
pub mod hot_reload;
pub mod methods;
pub mod server;
pub mod state;

pub use hot_reload::{ConfigChange, ConfigWatcher, announce_changes};
pub use server::{router, start_gateway};
pub use state::GatewayState;
