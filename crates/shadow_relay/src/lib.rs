#![forbid(unsafe_code)]

//! Ephemeral group messaging relay: channel authorization, live subscription
//! sets and real-time fan-out of short-lived messages over QUIC.

pub mod config;
pub mod quic;
pub mod server;
pub mod util;

pub use server::connection::{ConnectionSettings, handle_connection};
pub use server::gate::{AuthorizationGate, GateConfig};
pub use server::listener::serve;
pub use server::registry::{ConnectionId, SubscriptionRegistry};
pub use server::router::{BroadcastRouter, DeliveryReport};
pub use server::state::RelayContext;
