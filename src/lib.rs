//! Coordination server for a public-transport ticketing network: framed
//! binary protocol over TLS, SQLite-backed reservations and purchases, UDP
//! multicast discovery, and asynchronous fan-out to authenticated clients.

pub mod config;
pub mod logging;
pub mod maintenance;
pub mod multicast;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod store;
pub mod transport;
pub mod wire;
