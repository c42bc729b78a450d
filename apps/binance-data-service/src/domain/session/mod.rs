//! Session Lifecycle
//!
//! Every `GetSocketData` stream is a session that moves strictly forward:
//!
//! ```text
//! Open ──► Streaming ──► Draining ──► Closed
//!   └──────────────────────┘
//! ```
//!
//! A session that fails before its receive loop starts goes straight to
//! `Draining`.

use std::fmt;

/// Unique identifier for a downstream session.
pub type SessionId = u64;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// Stream accepted, loops not started.
    Open,
    /// Receive loop running.
    Streaming,
    /// Stop signalled; loops are exiting.
    Draining,
    /// Subscriptions released and both loops gone.
    Closed,
}

impl SessionState {
    /// Whether `next` is a legal forward transition from `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Streaming | Self::Draining)
                | (Self::Streaming, Self::Draining)
                | (Self::Draining, Self::Closed)
        )
    }

    /// State label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Streaming => "streaming",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }

    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Streaming => 1,
            Self::Draining => 2,
            Self::Closed => 3,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Streaming,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
