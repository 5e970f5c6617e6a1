//! Classification of authentication failures
//!
//! Every failure observed by the subsystem is funneled through [`classify`]
//! exactly once, so that downstream logic branches on an [`AuthErrorKind`]
//! rather than re-inspecting raw error text. Each kind carries a fixed
//! default [`RecoveryAction`]; that mapping lives here and nowhere else.

use std::error::Error;
use std::fmt;

/// The closed taxonomy of authentication failures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthErrorKind {
    /// The token's expiry has passed
    TokenExpired,
    /// The token's payload could not be base64-decoded
    TokenDecodeError,
    /// The token's payload decoded but is not a usable claims object
    TokenMalformed,
    /// The token does not have the expected shape
    TokenInvalid,
    /// An attempt to obtain a replacement token was rejected
    RefreshFailed,
    /// The failure looks like a transport problem rather than a credential
    /// problem
    NetworkError,
    /// Anything that did not match a more specific rule
    ValidationError,
}

/// What the subsystem should do about a classified failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecoveryAction {
    /// Obtain a replacement token
    Refresh,
    /// Purge persisted credentials and start over
    ClearSession,
    /// Purge credentials and terminate the session entirely
    Logout,
    /// Wait out a transient condition; no corrective action is available
    None,
}

// Rule order resolves overlapping phrases: "expired" beats "invalid",
// decode phrases beat "malformed".
const EXPIRY_PHRASES: &[&str] = &["expired", "exp claim"];
const DECODE_PHRASES: &[&str] = &["decode", "base64", "invalid character", "atob"];
const MALFORMED_PHRASES: &[&str] = &["malformed", "must have 3 parts"];
const INVALID_PHRASES: &[&str] = &["invalid token", "token format"];
const REFRESH_PHRASES: &[&str] = &["refresh", "401", "unauthorized"];
const NETWORK_PHRASES: &[&str] = &["network", "fetch", "connection", "timeout"];

/// Classifies a failure by its message
///
/// Matching is case-insensitive substring matching over an ordered rule
/// list; the first matching rule wins. The same message always classifies
/// to the same kind.
pub fn classify(message: &str) -> AuthErrorKind {
    let haystack = message.to_ascii_lowercase();
    let matches = |phrases: &[&str]| phrases.iter().any(|p| haystack.contains(p));

    if matches(EXPIRY_PHRASES) {
        AuthErrorKind::TokenExpired
    } else if matches(DECODE_PHRASES) {
        AuthErrorKind::TokenDecodeError
    } else if matches(MALFORMED_PHRASES) {
        AuthErrorKind::TokenMalformed
    } else if matches(INVALID_PHRASES) {
        AuthErrorKind::TokenInvalid
    } else if matches(REFRESH_PHRASES) {
        AuthErrorKind::RefreshFailed
    } else if matches(NETWORK_PHRASES) {
        AuthErrorKind::NetworkError
    } else {
        AuthErrorKind::ValidationError
    }
}

/// Classifies an error, walking its source chain
///
/// Each error in the chain is classified in turn; the first kind more
/// specific than [`AuthErrorKind::ValidationError`] wins. This lets a
/// wrapped cause ("connection refused" inside a context error) still
/// classify as what it is.
pub fn classify_error(error: &(dyn Error + 'static)) -> AuthErrorKind {
    let mut current: Option<&(dyn Error + 'static)> = Some(error);
    while let Some(err) = current {
        let kind = classify(&err.to_string());
        if kind != AuthErrorKind::ValidationError {
            return kind;
        }
        current = err.source();
    }
    AuthErrorKind::ValidationError
}

impl AuthErrorKind {
    /// The default recovery action for this kind of failure
    ///
    /// This table is the single source of truth consulted by the recovery
    /// state machine.
    pub fn default_action(self) -> RecoveryAction {
        match self {
            AuthErrorKind::TokenExpired => RecoveryAction::Refresh,
            AuthErrorKind::TokenInvalid
            | AuthErrorKind::TokenMalformed
            | AuthErrorKind::TokenDecodeError
            | AuthErrorKind::ValidationError => RecoveryAction::ClearSession,
            AuthErrorKind::RefreshFailed => RecoveryAction::Logout,
            AuthErrorKind::NetworkError => RecoveryAction::None,
        }
    }

    /// Whether this kind is safe to recover from without user involvement
    ///
    /// `RefreshFailed` is excluded even though its default action is
    /// `Logout`: logging a user out unattended is a surprise we refuse to
    /// spring on them.
    pub fn is_auto_recoverable(self) -> bool {
        matches!(
            self,
            AuthErrorKind::TokenExpired | AuthErrorKind::NetworkError
        )
    }

    /// A human-readable status line for the boundary to present
    pub fn user_message(self) -> &'static str {
        match self {
            AuthErrorKind::TokenExpired => "Your session expired; renewing it now.",
            AuthErrorKind::NetworkError => "Connection problem; retrying.",
            AuthErrorKind::RefreshFailed => "Your session could not be renewed; please log in again.",
            AuthErrorKind::TokenInvalid
            | AuthErrorKind::TokenMalformed
            | AuthErrorKind::TokenDecodeError
            | AuthErrorKind::ValidationError => "Your session is no longer valid; please log in again.",
        }
    }

    /// A stable lowercase name for use in log fields
    pub fn as_str(self) -> &'static str {
        match self {
            AuthErrorKind::TokenExpired => "token_expired",
            AuthErrorKind::TokenDecodeError => "token_decode_error",
            AuthErrorKind::TokenMalformed => "token_malformed",
            AuthErrorKind::TokenInvalid => "token_invalid",
            AuthErrorKind::RefreshFailed => "refresh_failed",
            AuthErrorKind::NetworkError => "network_error",
            AuthErrorKind::ValidationError => "validation_error",
        }
    }
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
