//! Relay engine: session lifecycle, byte copy, and mid-session expiry.
//!
//! A session relays until the first terminal event from any of its three
//! units (client → backend copy, backend → client copy, expiry watcher) or
//! a server shutdown. All of them share one [`teardown::Teardown`].

pub mod copy;
pub mod engine;
pub mod session;
pub mod teardown;
pub mod watcher;

pub use engine::{run_session, turn_away, RelayContext, TcpDialer};
pub use session::SessionRegistry;
