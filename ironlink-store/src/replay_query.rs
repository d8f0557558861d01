/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 3/2/26
******************************************************************************/

//! Read path for replays.
//!
//! [`ReplayQuery::query`] returns a lazy [`ReplayCursor`] that resolves one
//! sequence number at a time: index lookup first, then a positional read from
//! the [`MessageLog`]. Missing entries surface as
//! [`ReplayError::IndexGap`] rather than being skipped silently.

use crate::replay_index::{ReplayIndex, ReplayIndexEntry};
use crate::traits::MessageLog;
use bytes::Bytes;
use ironlink_core::error::ReplayError;
use ironlink_core::types::{SeqNum, SessionIdentity};
use std::sync::Arc;

/// One message read back for a replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedMessage {
    /// Sequence number of the message.
    pub seq_no: SeqNum,
    /// Index entry the message was located through.
    pub entry: ReplayIndexEntry,
    /// Original message bytes.
    pub bytes: Bytes,
}

/// Query over a replay index and its message log.
#[derive(Clone)]
pub struct ReplayQuery {
    index: Arc<ReplayIndex>,
    log: Arc<dyn MessageLog>,
}

impl std::fmt::Debug for ReplayQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayQuery")
            .field("stream_id", &self.index.stream_id())
            .finish_non_exhaustive()
    }
}

impl ReplayQuery {
    /// Creates a query over `index`, reading bytes from `log`.
    #[must_use]
    pub fn new(index: Arc<ReplayIndex>, log: Arc<dyn MessageLog>) -> Self {
        Self { index, log }
    }

    /// Returns the underlying index.
    #[must_use]
    pub fn index(&self) -> &Arc<ReplayIndex> {
        &self.index
    }

    /// Returns a cursor over `[from_seq_no, to_seq_no]` of a session.
    ///
    /// The cursor is lazy and finite. Calling `query` again with the same
    /// range yields the same results as long as the index was not reset.
    #[must_use]
    pub fn query(
        &self,
        session: SessionIdentity,
        from_seq_no: SeqNum,
        to_seq_no: SeqNum,
    ) -> ReplayCursor {
        ReplayCursor {
            query: self.clone(),
            session,
            next_seq_no: from_seq_no,
            to_seq_no,
        }
    }
}

/// Lazy iterator over a replay range.
///
/// Yields `Ok` for each indexed message and `Err(IndexGap)` for each
/// sequence number without an entry, then moves on to the next one.
#[derive(Debug)]
pub struct ReplayCursor {
    query: ReplayQuery,
    session: SessionIdentity,
    next_seq_no: SeqNum,
    to_seq_no: SeqNum,
}

impl ReplayCursor {
    /// Returns the next sequence number the cursor will resolve.
    #[must_use]
    pub const fn next_seq_no(&self) -> SeqNum {
        self.next_seq_no
    }

    /// Returns the last sequence number of the range.
    #[must_use]
    pub const fn to_seq_no(&self) -> SeqNum {
        self.to_seq_no
    }

    /// Returns the number of sequence numbers left to resolve.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        (self.to_seq_no.value() + 1).saturating_sub(self.next_seq_no.value())
    }
}

impl Iterator for ReplayCursor {
    type Item = Result<ReplayedMessage, ReplayError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_seq_no > self.to_seq_no {
            return None;
        }
        let seq_no = self.next_seq_no;
        self.next_seq_no = seq_no.next();

        let Some(entry) = self.query.index.lookup(self.session, seq_no) else {
            return Some(Err(ReplayError::IndexGap {
                session: self.session,
                seq_no: seq_no.value(),
            }));
        };

        Some(
            self.query
                .log
                .read(entry.recording_id, entry.position, entry.length)
                .map(|bytes| ReplayedMessage {
                    seq_no,
                    entry,
                    bytes,
                })
                .map_err(ReplayError::from),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.remaining()).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLog;
    use ironlink_core::error::StoreError;
    use ironlink_core::types::{RecordingId, StreamId};

    const SESSION: SessionIdentity = SessionIdentity::new(3);
    const RECORDING: RecordingId = RecordingId(1);

    fn setup(seqs: &[u64]) -> (ReplayQuery, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::new());
        let index = Arc::new(ReplayIndex::new(StreamId::OUTBOUND));
        for &seq in seqs {
            let body = format!("msg-{seq}");
            let position = log.append(RECORDING, body.as_bytes());
            index.on_message(
                SESSION,
                SeqNum::new(seq),
                StreamId::OUTBOUND,
                RECORDING,
                position,
                body.len() as u32,
            );
        }
        (ReplayQuery::new(index, log.clone()), log)
    }

    #[test]
    fn test_query_returns_original_bytes_in_order() {
        let (query, _log) = setup(&[10, 11, 12, 13, 14, 15]);

        let messages: Vec<_> = query
            .query(SESSION, SeqNum::new(10), SeqNum::new(15))
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(messages.len(), 6);
        for (offset, message) in messages.iter().enumerate() {
            let seq = 10 + offset as u64;
            assert_eq!(message.seq_no, SeqNum::new(seq));
            assert_eq!(message.bytes, Bytes::from(format!("msg-{seq}")));
        }
    }

    #[test]
    fn test_single_message_round_trip() {
        let (query, _log) = setup(&[1, 2, 3]);
        for seq in 1..=3u64 {
            let mut cursor = query.query(SESSION, SeqNum::new(seq), SeqNum::new(seq));
            let message = cursor.next().unwrap().unwrap();
            assert_eq!(message.bytes, Bytes::from(format!("msg-{seq}")));
            assert!(cursor.next().is_none());
        }
    }

    #[test]
    fn test_query_is_restartable() {
        let (query, _log) = setup(&[1, 2, 3]);
        let first: Vec<_> = query.query(SESSION, SeqNum::new(1), SeqNum::new(3)).collect();
        let second: Vec<_> = query.query(SESSION, SeqNum::new(1), SeqNum::new(3)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_entry_is_an_index_gap() {
        let (query, _log) = setup(&[1, 2, 4]);
        let results: Vec<_> = query.query(SESSION, SeqNum::new(1), SeqNum::new(4)).collect();

        assert_eq!(results.len(), 4);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert_eq!(
            results[2],
            Err(ReplayError::IndexGap {
                session: SESSION,
                seq_no: 3
            })
        );
        assert_eq!(results[3].as_ref().unwrap().seq_no, SeqNum::new(4));
    }

    #[test]
    fn test_truncated_log_surfaces_store_error() {
        let log = Arc::new(MemoryLog::new());
        let index = Arc::new(ReplayIndex::new(StreamId::OUTBOUND));
        index.on_message(SESSION, SeqNum::new(1), StreamId::OUTBOUND, RECORDING, 0, 64);
        let query = ReplayQuery::new(index, log);

        let result = query.query(SESSION, SeqNum::new(1), SeqNum::new(1)).next().unwrap();
        assert_eq!(
            result,
            Err(ReplayError::Store(StoreError::RecordingNotFound {
                recording_id: RECORDING
            }))
        );
    }

    #[test]
    fn test_cursor_bookkeeping() {
        let (query, _log) = setup(&[1, 2, 3]);
        let mut cursor = query.query(SESSION, SeqNum::new(2), SeqNum::new(3));
        assert_eq!(cursor.remaining(), 2);
        assert_eq!(cursor.size_hint(), (2, Some(2)));
        cursor.next();
        assert_eq!(cursor.next_seq_no(), SeqNum::new(3));
        assert_eq!(cursor.to_seq_no(), SeqNum::new(3));

        let empty = query.query(SESSION, SeqNum::new(5), SeqNum::new(4));
        assert_eq!(empty.remaining(), 0);
        assert_eq!(empty.count(), 0);
    }
}
