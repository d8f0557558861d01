/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Core types for session recovery and replay.
//!
//! This module provides the identifiers shared by every IronLink crate:
//! - [`SeqNum`]: Sequence number wrapper
//! - [`SessionIdentity`]: Stable identity of a logical session across reconnects
//! - [`ConnectionId`]: Identity of one TCP connection carrying a session
//! - [`StreamId`], [`RecordingId`]: Logical channel and durable recording of a stream
//! - [`Direction`]: Inbound or outbound traffic

use serde::{Deserialize, Serialize};
use std::fmt;

/// Message sequence number.
///
/// Sequence numbers are unsigned 64-bit integers that identify messages
/// within one direction of a session. They start at 1 and increment for each
/// message sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct SeqNum(u64);

impl SeqNum {
    /// The first sequence number of a fresh session.
    pub const FIRST: Self = Self(1);

    /// Creates a new sequence number.
    ///
    /// # Arguments
    /// * `value` - The sequence number value (should be >= 1 for valid messages)
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw sequence number value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the previous sequence number, saturating at zero.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Checks if this sequence number is valid (>= 1).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 1
    }
}

impl Default for SeqNum {
    fn default() -> Self {
        Self::FIRST
    }
}

impl From<u64> for SeqNum {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SeqNum> for u64 {
    fn from(seq: SeqNum) -> Self {
        seq.0
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one logical session.
///
/// Stable for the lifetime of the trading relationship: a new connection that
/// resumes the same identity continues its sequence number series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct SessionIdentity(u64);

impl SessionIdentity {
    /// Creates a session identity from its uuid.
    #[inline]
    #[must_use]
    pub const fn new(uuid: u64) -> Self {
        Self(uuid)
    }

    /// Returns the session uuid.
    #[inline]
    #[must_use]
    pub const fn uuid(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{:016x}", self.0)
    }
}

/// Identity of a single transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Logical channel of an ordered message stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Stream carrying messages received from counterparties.
    pub const INBOUND: Self = Self(1);
    /// Stream carrying messages sent to counterparties.
    pub const OUTBOUND: Self = Self(2);
    /// Stream carrying replayed and gap-filled messages.
    pub const REPLAY: Self = Self(3);
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Identity of the durable recording backing a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct RecordingId(pub u64);

impl fmt::Display for RecordingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "recording-{}", self.0)
    }
}

/// Direction of traffic relative to this gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Received from the counterparty.
    Inbound,
    /// Sent to the counterparty.
    Outbound,
}

impl Direction {
    /// Returns the wire code used by persisted index records.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Inbound => 0,
            Self::Outbound => 1,
        }
    }

    /// Parses a persisted direction code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Inbound),
            1 => Some(Self::Outbound),
            _ => None,
        }
    }

    /// Returns the default stream for this direction.
    #[must_use]
    pub const fn stream_id(self) -> StreamId {
        match self {
            Self::Inbound => StreamId::INBOUND,
            Self::Outbound => StreamId::OUTBOUND,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("inbound"),
            Self::Outbound => f.write_str("outbound"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_num() {
        let seq = SeqNum::new(42);
        assert_eq!(seq.value(), 42);
        assert_eq!(seq.next().value(), 43);
        assert_eq!(seq.prev().value(), 41);
        assert!(seq.is_valid());
        assert!(!SeqNum::new(0).is_valid());
        assert_eq!(SeqNum::new(0).prev().value(), 0);
    }

    #[test]
    fn test_seq_num_default() {
        assert_eq!(SeqNum::default(), SeqNum::FIRST);
    }

    #[test]
    fn test_session_identity_display() {
        let id = SessionIdentity::new(0xABCD);
        assert_eq!(id.uuid(), 0xABCD);
        assert_eq!(id.to_string(), "session-000000000000abcd");
    }

    #[test]
    fn test_direction_code_roundtrip() {
        for direction in [Direction::Inbound, Direction::Outbound] {
            assert_eq!(Direction::from_code(direction.code()), Some(direction));
        }
        assert_eq!(Direction::from_code(7), None);
        assert_eq!(Direction::Outbound.stream_id(), StreamId::OUTBOUND);
    }
}
