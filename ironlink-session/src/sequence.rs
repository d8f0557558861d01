/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Sequence number management.
//!
//! This module provides atomic sequence number management for sessions.
//! The owning session is the only writer; other threads may read the
//! counters at any time.

use ironlink_core::types::SeqNum;
use std::sync::atomic::{AtomicU64, Ordering};

/// Manages the next sent and next received sequence numbers of a session.
///
/// Uses atomic operations for thread-safe reads without locks.
#[derive(Debug)]
pub struct SequenceManager {
    /// Next outgoing sequence number.
    next_sent_seq_no: AtomicU64,
    /// Next expected incoming sequence number.
    next_recv_seq_no: AtomicU64,
}

impl SequenceManager {
    /// Creates a new sequence manager with sequence numbers starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::with_initial(SeqNum::FIRST, SeqNum::FIRST)
    }

    /// Creates a new sequence manager with specified starting values.
    ///
    /// # Arguments
    /// * `next_sent` - Next sequence number to send
    /// * `next_recv` - Next sequence number expected from the counterparty
    #[must_use]
    pub fn with_initial(next_sent: SeqNum, next_recv: SeqNum) -> Self {
        Self {
            next_sent_seq_no: AtomicU64::new(next_sent.value()),
            next_recv_seq_no: AtomicU64::new(next_recv.value()),
        }
    }

    /// Returns the next sent sequence number without incrementing.
    #[inline]
    #[must_use]
    pub fn next_sent_seq_no(&self) -> SeqNum {
        SeqNum::new(self.next_sent_seq_no.load(Ordering::SeqCst))
    }

    /// Returns the next expected received sequence number.
    #[inline]
    #[must_use]
    pub fn next_recv_seq_no(&self) -> SeqNum {
        SeqNum::new(self.next_recv_seq_no.load(Ordering::SeqCst))
    }

    /// Allocates and returns the next sent sequence number.
    #[inline]
    pub fn allocate_sent_seq_no(&self) -> SeqNum {
        SeqNum::new(self.next_sent_seq_no.fetch_add(1, Ordering::SeqCst))
    }

    /// Records that `seq_no` was received; the next expected is `seq_no + 1`.
    #[inline]
    pub fn on_received(&self, seq_no: SeqNum) {
        self.next_recv_seq_no
            .store(seq_no.next().value(), Ordering::SeqCst);
    }

    /// Sets the next sent sequence number.
    ///
    /// Returns true if the new value is lower than the old one, meaning the
    /// sent series was reset.
    #[inline]
    pub fn set_next_sent_seq_no(&self, seq_no: SeqNum) -> bool {
        let previous = self.next_sent_seq_no.swap(seq_no.value(), Ordering::SeqCst);
        seq_no.value() < previous
    }

    /// Sets the next expected received sequence number.
    #[inline]
    pub fn set_next_recv_seq_no(&self, seq_no: SeqNum) {
        self.next_recv_seq_no.store(seq_no.value(), Ordering::SeqCst);
    }

    /// Validates an incoming sequence number against the expected one.
    #[must_use]
    pub fn validate_incoming(&self, received: SeqNum) -> SequenceResult {
        let expected = self.next_recv_seq_no.load(Ordering::SeqCst);
        let received = received.value();

        if received == expected {
            SequenceResult::Ok
        } else if received < expected {
            SequenceResult::TooLow { expected, received }
        } else {
            SequenceResult::Gap { expected, received }
        }
    }
}

impl Default for SequenceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of sequence number validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceResult {
    /// Sequence number is as expected.
    Ok,
    /// Sequence number is lower than expected (possible duplicate).
    TooLow {
        /// Expected sequence number.
        expected: u64,
        /// Received sequence number.
        received: u64,
    },
    /// Sequence number is higher than expected (gap detected).
    Gap {
        /// Expected sequence number.
        expected: u64,
        /// Received sequence number.
        received: u64,
    },
}

impl SequenceResult {
    /// Returns true if the sequence is valid.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Returns true if there's a gap.
    #[must_use]
    pub const fn is_gap(&self) -> bool {
        matches!(self, Self::Gap { .. })
    }

    /// Returns true if the sequence is too low.
    #[must_use]
    pub const fn is_too_low(&self) -> bool {
        matches!(self, Self::TooLow { .. })
    }
}
