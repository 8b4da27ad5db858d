//! WebSocket close codes surfaced to console clients.
//!
//! Values in the 4000-4999 private range are stable and part of the client
//! contract. Standard codes are used for ordinary teardown.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Peer or backend ended the session normally.
    Normal,
    /// Server is shutting down.
    GoingAway,
    /// Mid-session failure on either socket.
    InternalError,
    MissingParameters,
    InvalidOrExpiredToken,
    UnknownTarget,
    BackendUnavailable,
    /// Token expired or was revoked while relaying.
    TokenExpired,
    StoreUnavailable,
}

impl CloseReason {
    pub const fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::InternalError => 1011,
            Self::MissingParameters => 4000,
            Self::InvalidOrExpiredToken => 4001,
            Self::UnknownTarget => 4002,
            Self::BackendUnavailable => 4003,
            Self::TokenExpired => 4004,
            Self::StoreUnavailable => 4005,
        }
    }

    /// Machine-readable reason string, also sent as the close frame reason.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::GoingAway => "going_away",
            Self::InternalError => "internal_error",
            Self::MissingParameters => "missing_parameters",
            Self::InvalidOrExpiredToken => "invalid_or_expired_token",
            Self::UnknownTarget => "unknown_target",
            Self::BackendUnavailable => "backend_unavailable",
            Self::TokenExpired => "token_expired",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn codes_and_names_are_distinct() {
        let all = [
            CloseReason::Normal,
            CloseReason::GoingAway,
            CloseReason::InternalError,
            CloseReason::MissingParameters,
            CloseReason::InvalidOrExpiredToken,
            CloseReason::UnknownTarget,
            CloseReason::BackendUnavailable,
            CloseReason::TokenExpired,
            CloseReason::StoreUnavailable,
        ];
        let codes: HashSet<u16> = all.iter().map(|r| r.code()).collect();
        assert_eq!(codes.len(), all.len());
        let names: HashSet<&str> = all.iter().map(|r| r.as_str()).collect();
        assert_eq!(names.len(), all.len());
    }

    #[test]
    fn rejection_codes_are_private_range() {
        assert_eq!(CloseReason::InvalidOrExpiredToken.code(), 4001);
        assert_eq!(CloseReason::UnknownTarget.code(), 4002);
        assert_eq!(CloseReason::BackendUnavailable.code(), 4003);
        assert_eq!(CloseReason::TokenExpired.to_string(), "token_expired");
    }
}
