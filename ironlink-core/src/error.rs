/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Error types for the IronLink session recovery subsystem.
//!
//! This module provides a unified error hierarchy using `thiserror` for typed,
//! domain-specific errors across sessions, indices, replay and transport.

use crate::types::{RecordingId, SessionIdentity};
use thiserror::Error;

/// Result type alias using [`IronLinkError`] as the error type.
pub type Result<T> = std::result::Result<T, IronLinkError>;

/// Top-level error type for all IronLink operations.
#[derive(Debug, Error)]
pub enum IronLinkError {
    /// Error in session layer operations.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Error in durable index or message log operations.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error while serving a replay.
    #[error("replay error: {0}")]
    Replay(#[from] ReplayError),

    /// Error from the message stream transport.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// I/O error from underlying storage.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors in session layer operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session is not in a state that can send application traffic.
    #[error("session not connected: current state {state}")]
    NotConnected {
        /// Current session state.
        state: String,
    },

    /// The transport has no space for the message; retry later.
    #[error("back pressured: transport has no space for the message")]
    BackPressured,

    /// A claim is already outstanding and must be committed or dropped first.
    #[error("a claimed message has not been committed yet")]
    ClaimOutstanding,

    /// The counterparty or the caller broke the session protocol.
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// Description of the violation.
        reason: String,
    },

    /// Negotiate or establish was retried up to its bound without a reply.
    #[error("{stage} retries exhausted after {attempts} attempts")]
    RetryExhausted {
        /// Handshake stage that was retried.
        stage: String,
        /// Number of attempts sent.
        attempts: u32,
    },

    /// Negotiate was rejected by the counterparty.
    #[error("negotiate rejected: {reason} (error codes {error_codes})")]
    NegotiateRejected {
        /// Reason for rejection.
        reason: String,
        /// Counterparty error codes.
        error_codes: u32,
    },

    /// Establish was rejected by the counterparty.
    #[error("establish rejected: {reason} (error codes {error_codes})")]
    EstablishRejected {
        /// Reason for rejection.
        reason: String,
        /// Counterparty error codes.
        error_codes: u32,
    },

    /// No traffic was received for two keepalive intervals.
    #[error("keepalive timeout after {elapsed_ms} milliseconds")]
    KeepaliveTimeout {
        /// Elapsed time in milliseconds since last message.
        elapsed_ms: u64,
    },

    /// A retransmission requested by the counterparty could not be served.
    #[error("retransmission failed for range {begin}..={end}")]
    RetransmitFailed {
        /// First sequence number of the failed range.
        begin: u64,
        /// Last sequence number of the failed range.
        end: u64,
    },

    /// Session configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SessionError {
    /// Returns true if the caller may retry the same operation later.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::BackPressured)
    }

    /// Returns true if the error ends the session.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation { .. }
                | Self::RetryExhausted { .. }
                | Self::NegotiateRejected { .. }
                | Self::EstablishRejected { .. }
                | Self::KeepaliveTimeout { .. }
                | Self::RetransmitFailed { .. }
        )
    }
}

/// Errors in durable index and message log operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A durable write was rejected or failed; nothing past it is acknowledged.
    #[error("durability failure in {index}: {reason}")]
    DurabilityFailure {
        /// Name of the index or log that failed.
        index: String,
        /// Reason for failure.
        reason: String,
    },

    /// Persisted data could not be decoded.
    #[error("store corrupted: {reason}")]
    Corrupted {
        /// Description of the corruption.
        reason: String,
    },

    /// The requested recording does not exist.
    #[error("recording not found: {recording_id}")]
    RecordingNotFound {
        /// The missing recording.
        recording_id: RecordingId,
    },

    /// The requested byte range lies outside the recording.
    #[error("range not available in {recording_id}: position {position}, length {length}")]
    RangeNotAvailable {
        /// The recording that was read.
        recording_id: RecordingId,
        /// Requested start position.
        position: u64,
        /// Requested length in bytes.
        length: u32,
    },

    /// I/O error in persistent store.
    #[error("store i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Errors raised while reading messages back for a replay.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// No index entry exists for a requested sequence number.
    #[error("index gap for {session} at seq {seq_no}")]
    IndexGap {
        /// Session whose index has the gap.
        session: SessionIdentity,
        /// Sequence number with no entry.
        seq_no: u64,
    },

    /// The indexed bytes could not be read from the message log.
    #[error("{0}")]
    Store(#[from] StoreError),
}

/// Errors from the message stream transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The publication window is full.
    #[error("back pressured: publication window is full")]
    BackPressured,

    /// The stream has been closed.
    #[error("stream closed")]
    Closed,

    /// Message exceeds the maximum fragment size.
    #[error("message too large: {size} bytes exceeds maximum {max_size}")]
    MessageTooLarge {
        /// Actual message size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max_size: usize,
    },
}

impl From<StreamError> for SessionError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::BackPressured => Self::BackPressured,
            other => Self::NotConnected {
                state: other.to_string(),
            },
        }
    }
}
