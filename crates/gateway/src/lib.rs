//! The WebSocket gateway and federation mesh.
//!
//! A client socket is authenticated locally (session token) or via a
//! single-use cross-node token, discovers which of the user's guilds live on
//! remote nodes, tunnels to each of those over compressed WebSockets, and
//! multiplexes everything back to the client under one heartbeat protocol.

pub mod codec;
pub mod connection;
pub mod cross_node_client;
pub mod discovery;
pub mod heartbeat;
pub mod outbound;
pub mod server;
pub mod state;

pub use {server::router, state::GatewayState};
