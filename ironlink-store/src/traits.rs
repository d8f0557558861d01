/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Storage boundary traits.
//!
//! This module defines the abstract interfaces between the recovery core and
//! durable storage: positional reads from the message log, and indices fed
//! by the indexer agents.

use bytes::Bytes;
use ironlink_core::error::StoreError;
use ironlink_core::message::Fragment;
use ironlink_core::types::RecordingId;

/// Read access to the durable, append-only message log.
///
/// Implementations hold the recorded bytes of each stream and serve
/// positional reads for replays.
pub trait MessageLog: Send + Sync {
    /// Reads `length` bytes starting at `position` of a recording.
    ///
    /// # Arguments
    /// * `recording_id` - The recording to read from
    /// * `position` - Byte position of the first byte
    /// * `length` - Number of bytes to read
    ///
    /// # Errors
    /// Returns `StoreError` if the recording or range does not exist.
    fn read(&self, recording_id: RecordingId, position: u64, length: u32)
    -> Result<Bytes, StoreError>;
}

/// Progress of a durable write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Every staged change is on disk.
    Durable,
    /// A write is still running; poll again later.
    InProgress,
}

impl SyncStatus {
    /// Returns true if nothing is left to write.
    #[must_use]
    pub const fn is_durable(self) -> bool {
        matches!(self, Self::Durable)
    }
}

/// A durable index fed with every fragment of one stream.
///
/// Updates must be idempotent under redelivery of the same stream position;
/// an index is expected to skip anything at or below the last position it
/// accepted in the current recording.
pub trait Index: Send {
    /// Returns the index name used in logs and errors.
    fn name(&self) -> &str;

    /// Applies one fragment. Changes may stay staged until [`sync`](Self::sync).
    ///
    /// # Errors
    /// Returns `StoreError` if the fragment cannot be staged.
    fn on_fragment(&mut self, fragment: &Fragment) -> Result<(), StoreError>;

    /// Starts making staged changes durable and reports progress.
    ///
    /// Never blocks: the caller polls until [`SyncStatus::Durable`].
    ///
    /// # Errors
    /// Returns `StoreError::DurabilityFailure` if the write or fsync failed.
    fn sync(&mut self) -> Result<SyncStatus, StoreError>;

    /// Blocks until every staged change is durable.
    ///
    /// # Errors
    /// Returns `StoreError::DurabilityFailure` if the write or fsync failed.
    fn flush(&mut self) -> Result<(), StoreError> {
        while !self.sync()?.is_durable() {
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Returns the last position this index accepted in the current
    /// recording, if any.
    fn last_position(&self) -> Option<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironlink_core::message::{FragmentHeader, TemplateId};
    use ironlink_core::types::{SeqNum, SessionIdentity, StreamId};

    struct CountingIndex {
        count: usize,
        last: Option<u64>,
    }

    impl Index for CountingIndex {
        fn name(&self) -> &str {
            "counting"
        }

        fn on_fragment(&mut self, fragment: &Fragment) -> Result<(), StoreError> {
            if self.last.is_some_and(|last| fragment.header.position <= last) {
                return Ok(());
            }
            self.count += 1;
            self.last = Some(fragment.header.position);
            Ok(())
        }

        fn sync(&mut self) -> Result<SyncStatus, StoreError> {
            Ok(SyncStatus::Durable)
        }

        fn last_position(&self) -> Option<u64> {
            self.last
        }
    }

    #[test]
    fn test_index_skips_redelivered_positions() {
        let mut index = CountingIndex {
            count: 0,
            last: None,
        };
        let mut header = FragmentHeader::new(
            StreamId::OUTBOUND,
            SessionIdentity::new(1),
            SeqNum::new(1),
            TemplateId(514),
        );
        header.position = 32;
        let fragment = Fragment::new(header, &b"a"[..]);

        index.on_fragment(&fragment).unwrap();
        index.on_fragment(&fragment).unwrap();
        index.flush().unwrap();

        assert_eq!(index.count, 1);
        assert_eq!(index.last_position(), Some(32));
        assert_eq!(index.name(), "counting");
    }
}
