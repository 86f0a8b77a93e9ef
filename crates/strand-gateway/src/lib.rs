//! WebSocket push transport for the sync engine.

mod connection;
pub mod transport;

pub use transport::WsTransport;
