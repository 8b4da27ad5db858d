//! Inbound transports.

pub mod websocket;

pub use websocket::WebSocketConnection;
