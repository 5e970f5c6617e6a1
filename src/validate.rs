//! Structural validation and claims decoding for bearer tokens
//!
//! No signature verification happens here. The token is split into its three
//! dot-separated segments, the payload segment is base64url-decoded and parsed
//! as JSON claims, and the `exp` claim is checked against a clock. Failures are
//! always reported in the returned [`ValidationResult`] so callers can branch
//! without any error handling machinery.

use aliri_base64::Base64Url;
use aliri_clock::{Clock, System, UnixTime};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt;

/// The decoded payload of a bearer token
///
/// Only the claims relevant to lifecycle management are modeled directly.
/// Everything else the authority put in the payload is retained in `extra`
/// for callers that want to inspect it.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Claims {
    #[serde(default, deserialize_with = "lenient_epoch_seconds")]
    exp: Option<u64>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

/// Deserializes an epoch-seconds claim, tolerating non-numeric junk
///
/// A token with a string or otherwise unusable `exp` still decodes; the claim
/// is simply treated as absent.
fn lenient_epoch_seconds<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64))))
}

impl Claims {
    /// The subject (user) identifier, if present
    pub fn subject(&self) -> Option<&str> {
        self.sub.as_deref()
    }

    /// The expiration time, if the token carries a usable `exp` claim
    pub fn expiration_time(&self) -> Option<UnixTime> {
        self.exp.map(UnixTime)
    }

    /// Looks up an arbitrary claim by name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }

    /// Whether the token is expired according to the system clock
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(System.now())
    }

    /// Whether the token is expired as of the provided time
    ///
    /// A token whose `exp` equals `now` is already expired. A token with no
    /// `exp` claim never expires; this matches how the rest of the subsystem
    /// has always treated such tokens and is intentionally permissive.
    pub fn is_expired_at(&self, now: UnixTime) -> bool {
        match self.exp {
            Some(exp) => UnixTime(exp) <= now,
            None => false,
        }
    }
}

/// The ways a token can fail validation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvalidityKind {
    /// The string does not have the expected three-segment shape
    InvalidFormat,
    /// The payload segment is not valid base64url data
    DecodeError,
    /// The payload decoded but is not a usable claims object
    Malformed,
    /// The claims are intact but the token's expiry has passed
    Expired,
}

impl InvalidityKind {
    /// A stable lowercase name for use in log fields
    pub fn as_str(self) -> &'static str {
        match self {
            InvalidityKind::InvalidFormat => "invalid_format",
            InvalidityKind::DecodeError => "decode_error",
            InvalidityKind::Malformed => "malformed",
            InvalidityKind::Expired => "expired",
        }
    }
}

impl fmt::Display for InvalidityKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of decoding and validating a token
#[derive(Clone, Debug)]
pub enum ValidationResult {
    /// The token decoded and has not expired
    Valid(Claims),
    /// The token is unusable
    Invalid {
        /// What made the token unusable
        kind: InvalidityKind,
        /// A human-readable description of the failure
        message: String,
        /// The decoded claims, available when the token was structurally
        /// sound but expired
        claims: Option<Claims>,
    },
}

impl ValidationResult {
    /// Whether the token validated successfully
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid(_))
    }

    /// The decoded claims, if decoding got far enough to produce them
    pub fn claims(&self) -> Option<&Claims> {
        match self {
            ValidationResult::Valid(claims) => Some(claims),
            ValidationResult::Invalid { claims, .. } => claims.as_ref(),
        }
    }
}

/// Checks that a token splits into exactly three non-empty segments
pub fn validate_format(token: &str) -> bool {
    let mut segments = token.split('.');
    matches!(
        (segments.next(), segments.next(), segments.next(), segments.next()),
        (Some(h), Some(p), Some(s), None) if !h.is_empty() && !p.is_empty() && !s.is_empty()
    )
}

/// Decodes and validates a token against the system clock
pub fn decode(token: &str) -> ValidationResult {
    decode_with_clock(token, &System)
}

/// Decodes and validates a token against the provided clock
///
/// Validation proceeds in stages and stops at the first failure: segment
/// shape, base64url decode of the payload, claims parse, then expiry. An
/// expired token still carries its claims in the result so callers can
/// inspect who the token belonged to.
pub fn decode_with_clock<C: Clock>(token: &str, clock: &C) -> ValidationResult {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(h), Some(p), Some(s), None) if !h.is_empty() && !p.is_empty() && !s.is_empty() => p,
        _ => {
            return ValidationResult::Invalid {
                kind: InvalidityKind::InvalidFormat,
                message: "token must have 3 parts".to_owned(),
                claims: None,
            }
        }
    };

    let raw = match Base64Url::from_encoded(payload) {
        Ok(raw) => raw,
        Err(err) => {
            return ValidationResult::Invalid {
                kind: InvalidityKind::DecodeError,
                message: format!("unable to decode token payload: {}", err),
                claims: None,
            }
        }
    };

    let claims: Claims = match serde_json::from_slice(raw.as_slice()) {
        Ok(claims) => claims,
        Err(err) => {
            return ValidationResult::Invalid {
                kind: InvalidityKind::Malformed,
                message: format!("malformed token claims: {}", err),
                claims: None,
            }
        }
    };

    if claims.is_expired_at(clock.now()) {
        return ValidationResult::Invalid {
            kind: InvalidityKind::Expired,
            message: "token has expired".to_owned(),
            claims: Some(claims),
        };
    }

    ValidationResult::Valid(claims)
}
