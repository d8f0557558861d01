/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Completion positions of consuming agents.

use ironlink_core::types::StreamId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// How far an agent has durably processed one stream.
///
/// Written by the owning agent only; read by anyone. The position never
/// moves backwards.
#[derive(Debug)]
pub struct CompletionPosition {
    stream_id: StreamId,
    position: AtomicU64,
    completed: AtomicBool,
}

impl CompletionPosition {
    /// Creates a position at the start of the stream.
    #[must_use]
    pub const fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            position: AtomicU64::new(0),
            completed: AtomicBool::new(false),
        }
    }

    /// Returns the stream this position belongs to.
    #[must_use]
    pub const fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Returns the durable position.
    #[inline]
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Moves the position forward to `position`.
    ///
    /// Returns true if it moved.
    pub fn advance(&self, position: u64) -> bool {
        self.position.fetch_max(position, Ordering::AcqRel) < position
    }

    /// Marks the stream as fully processed on graceful shutdown.
    pub fn complete(&self) {
        self.completed.store(true, Ordering::Release);
    }

    /// Returns true once the owning agent shut down gracefully.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}
