//! Upgrade authentication: parameter extraction and token/target checks.

pub mod authenticator;
pub mod params;

pub use authenticator::{Authenticator, Rejection};
pub use params::UpgradeParams;
