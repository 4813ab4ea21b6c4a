//! Caller-visible failure representation.
//!
//! - **`FetchErrorKind`**: the closed set of outcomes a value request can fail with
//! - **`FetchError`**    : one struct gluing the kind to an optional message and key
//!
//! Only `Remote`, `Cancelled`, `QueueOverflow` and `InvalidInput` are meant to
//! reach the host. The remaining kinds describe conditions the engine handles
//! itself by falling back to a direct fetch.

use std::{error::Error, fmt};

/// All recognised failure kinds.
///
/// `Display` renders the stable wire code used in logs and host-facing
/// error cells (`#REMOTE!`, `#TIMEOUT!`, ...).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    /// Status still requested/running. Continue waiting or fall back.
    TransientWait,
    /// The remote service reported a failure.
    Remote,
    /// A bounded wait expired.
    Timeout,
    /// The manifest says a slice is complete but the value is not cached.
    Inconsistency,
    /// The preload write queue tripped its kill-switch.
    QueueOverflow,
    /// The request was dropped by a reset or a cleared lock.
    Cancelled,
    /// Caller input could not be normalized.
    InvalidInput,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TransientWait => "#BUSY!",
            Self::Remote => "#REMOTE!",
            Self::Timeout => "#TIMEOUT!",
            Self::Inconsistency => "#STALE!",
            Self::QueueOverflow => "#OVERFLOW!",
            Self::Cancelled => "#CANCELLED!",
            Self::InvalidInput => "#VALUE!",
        })
    }
}

impl FetchErrorKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "#BUSY!" => Some(Self::TransientWait),
            "#REMOTE!" => Some(Self::Remote),
            "#TIMEOUT!" => Some(Self::Timeout),
            "#STALE!" => Some(Self::Inconsistency),
            "#OVERFLOW!" => Some(Self::QueueOverflow),
            "#CANCELLED!" => Some(Self::Cancelled),
            "#VALUE!" => Some(Self::InvalidInput),
            _ => None,
        }
    }

    /// Kinds the engine recovers from by issuing a direct, unbatched fetch.
    pub fn falls_back_to_direct_fetch(self) -> bool {
        matches!(self, Self::TransientWait | Self::Timeout | Self::Inconsistency)
    }
}

/// The single error struct value requests resolve with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: Option<String>,
    /// Canonical key of the request the error belongs to, when known.
    pub key: Option<String>,
}

impl From<FetchErrorKind> for FetchError {
    fn from(kind: FetchErrorKind) -> Self {
        Self {
            kind,
            message: None,
            key: None,
        }
    }
}

impl FetchError {
    pub fn new(kind: FetchErrorKind) -> Self {
        kind.into()
    }

    /// Attach a human-readable explanation.
    pub fn with_message<S: Into<String>>(mut self, msg: S) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Attach the canonical request key.
    pub fn with_key<S: Into<String>>(mut self, key: S) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn remote<S: Into<String>>(msg: S) -> Self {
        Self::new(FetchErrorKind::Remote).with_message(msg)
    }

    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::new(FetchErrorKind::Cancelled).with_message(msg)
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::new(FetchErrorKind::Timeout).with_message(msg)
    }

    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::new(FetchErrorKind::InvalidInput).with_message(msg)
    }

    pub fn overflow<S: Into<String>>(msg: S) -> Self {
        Self::new(FetchErrorKind::QueueOverflow).with_message(msg)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FetchErrorKind::Cancelled
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ref msg) = self.message {
            write!(f, ": {msg}")?;
        }
        if let Some(ref key) = self.key {
            write!(f, " [{key}]")?;
        }
        Ok(())
    }
}

impl Error for FetchError {}

impl From<FetchError> for String {
    fn from(error: FetchError) -> Self {
        format!("{error}")
    }
}

impl PartialEq<str> for FetchErrorKind {
    fn eq(&self, other: &str) -> bool {
        format!("{self}") == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_message_and_key() {
        let err = FetchError::remote("row limit exceeded").with_key("balance:4000@2025-01");
        assert_eq!(
            err.to_string(),
            "#REMOTE!: row limit exceeded [balance:4000@2025-01]"
        );
    }

    #[test]
    fn codes_parse_back() {
        for kind in [
            FetchErrorKind::TransientWait,
            FetchErrorKind::Remote,
            FetchErrorKind::Timeout,
            FetchErrorKind::Inconsistency,
            FetchErrorKind::QueueOverflow,
            FetchErrorKind::Cancelled,
            FetchErrorKind::InvalidInput,
        ] {
            assert_eq!(FetchErrorKind::parse(&kind.to_string()), Some(kind));
        }
        assert_eq!(FetchErrorKind::parse("#NOPE!"), None);
    }

    #[test]
    fn only_wait_timeout_and_inconsistency_fall_back() {
        assert!(FetchErrorKind::Timeout.falls_back_to_direct_fetch());
        assert!(FetchErrorKind::Inconsistency.falls_back_to_direct_fetch());
        assert!(FetchErrorKind::TransientWait.falls_back_to_direct_fetch());
        assert!(!FetchErrorKind::Remote.falls_back_to_direct_fetch());
        assert!(!FetchErrorKind::Cancelled.falls_back_to_direct_fetch());
    }
}
