/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 3/2/26
******************************************************************************/

//! Durable replay index.
//!
//! Maps `(session, seq_no)` to where the message lives in the recording of
//! its stream. Entries are written once and never mutated. A sequence reset
//! opens a new generation (`sequence_index`); entries of older generations
//! stay in the file for audit but are no longer reachable by lookups.

use crate::record::{FixedRecord, RecordLog};
use crate::traits::{Index, SyncStatus};
use bytes::{Buf, BufMut, BytesMut};
use ironlink_core::error::StoreError;
use ironlink_core::message::Fragment;
use ironlink_core::types::{RecordingId, SeqNum, SessionIdentity, StreamId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Location of one indexed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayIndexEntry {
    /// Session the message belongs to.
    pub session: SessionIdentity,
    /// Sequence number of the message.
    pub seq_no: SeqNum,
    /// Sequence reset generation the entry belongs to.
    pub sequence_index: u32,
    /// Stream the message was published on.
    pub stream_id: StreamId,
    /// Recording holding the message bytes.
    pub recording_id: RecordingId,
    /// Byte position of the message in the recording.
    pub position: u64,
    /// Length of the message in bytes.
    pub length: u32,
}

impl FixedRecord for ReplayIndexEntry {
    const ENCODED_LEN: usize = 8 + 8 + 4 + 4 + 8 + 8 + 4;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.session.uuid());
        buf.put_u64_le(self.seq_no.value());
        buf.put_u32_le(self.sequence_index);
        buf.put_u32_le(self.stream_id.0);
        buf.put_u64_le(self.recording_id.0);
        buf.put_u64_le(self.position);
        buf.put_u32_le(self.length);
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        Some(Self {
            session: SessionIdentity::new(buf.get_u64_le()),
            seq_no: SeqNum::new(buf.get_u64_le()),
            sequence_index: buf.get_u32_le(),
            stream_id: StreamId(buf.get_u32_le()),
            recording_id: RecordingId(buf.get_u64_le()),
            position: buf.get_u64_le(),
            length: buf.get_u32_le(),
        })
    }
}

/// Result of offering a message to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// A new entry was created.
    Indexed(ReplayIndexEntry),
    /// The position or sequence number was already indexed.
    Duplicate,
    /// The message belongs to another stream.
    ForeignStream,
}

#[derive(Debug, Default)]
struct SessionEntries {
    sequence_index: u32,
    entries: BTreeMap<SeqNum, ReplayIndexEntry>,
}

impl SessionEntries {
    fn last_seq_no(&self) -> Option<SeqNum> {
        self.entries.keys().next_back().copied()
    }
}

#[derive(Debug, Default)]
struct IndexState {
    sessions: HashMap<SessionIdentity, SessionEntries>,
    last_position: Option<(RecordingId, u64)>,
}

/// Shared in-memory view of the replay index of one stream.
#[derive(Debug)]
pub struct ReplayIndex {
    stream_id: StreamId,
    state: RwLock<IndexState>,
}

impl ReplayIndex {
    /// Creates an empty index for a stream.
    #[must_use]
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Returns the stream this index covers.
    #[must_use]
    pub const fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Indexes one message, preserving arrival order.
    ///
    /// A position at or below the last indexed one of the same recording, or
    /// a sequence number at or below the session's last one in the current
    /// generation, is a duplicate and leaves the index untouched.
    pub fn on_message(
        &self,
        session: SessionIdentity,
        seq_no: SeqNum,
        stream_id: StreamId,
        recording_id: RecordingId,
        position: u64,
        length: u32,
    ) -> IndexOutcome {
        if stream_id != self.stream_id {
            warn!(%stream_id, expected = %self.stream_id, "message offered to foreign replay index");
            return IndexOutcome::ForeignStream;
        }

        let mut state = self.state.write();
        if state
            .last_position
            .is_some_and(|(last_recording, last)| last_recording == recording_id && position <= last)
        {
            return IndexOutcome::Duplicate;
        }

        let entries = state.sessions.entry(session).or_default();
        if entries.last_seq_no().is_some_and(|last| seq_no <= last) {
            debug!(%session, %seq_no, "skipping non-increasing seq no");
            return IndexOutcome::Duplicate;
        }

        let entry = ReplayIndexEntry {
            session,
            seq_no,
            sequence_index: entries.sequence_index,
            stream_id,
            recording_id,
            position,
            length,
        };
        entries.entries.insert(seq_no, entry);
        state.last_position = Some((recording_id, position));
        IndexOutcome::Indexed(entry)
    }

    /// Opens a new generation for a session after a sequence reset.
    ///
    /// Returns the new sequence index.
    pub fn start_sequence_reset(&self, session: SessionIdentity) -> u32 {
        let mut state = self.state.write();
        let entries = state.sessions.entry(session).or_default();
        entries.sequence_index += 1;
        let superseded = std::mem::take(&mut entries.entries).len();
        debug!(%session, sequence_index = entries.sequence_index, superseded, "sequence reset");
        entries.sequence_index
    }

    /// Returns the live entry for a sequence number.
    #[must_use]
    pub fn lookup(&self, session: SessionIdentity, seq_no: SeqNum) -> Option<ReplayIndexEntry> {
        self.state
            .read()
            .sessions
            .get(&session)
            .and_then(|entries| entries.entries.get(&seq_no).copied())
    }

    /// Returns the highest indexed sequence number of a session.
    #[must_use]
    pub fn last_seq_no(&self, session: SessionIdentity) -> Option<SeqNum> {
        self.state
            .read()
            .sessions
            .get(&session)
            .and_then(SessionEntries::last_seq_no)
    }

    /// Returns the current generation of a session.
    #[must_use]
    pub fn sequence_index(&self, session: SessionIdentity) -> u32 {
        self.state
            .read()
            .sessions
            .get(&session)
            .map_or(0, |entries| entries.sequence_index)
    }

    /// Returns the number of live entries of a session.
    #[must_use]
    pub fn entry_count(&self, session: SessionIdentity) -> usize {
        self.state
            .read()
            .sessions
            .get(&session)
            .map_or(0, |entries| entries.entries.len())
    }

    /// Returns the recording and position of the last indexed message.
    #[must_use]
    pub fn last_position(&self) -> Option<(RecordingId, u64)> {
        self.state.read().last_position
    }

    fn restore(&self, entry: ReplayIndexEntry) {
        let mut state = self.state.write();
        // Entries are restored in file order, which is arrival order.
        state.last_position = Some((entry.recording_id, entry.position));
        let entries = state.sessions.entry(entry.session).or_default();
        if entry.sequence_index > entries.sequence_index {
            entries.sequence_index = entry.sequence_index;
            entries.entries.clear();
        }
        if entry.sequence_index == entries.sequence_index {
            entries.entries.insert(entry.seq_no, entry);
        }
    }
}

/// Durable writer for the replay index of one stream.
#[derive(Debug)]
pub struct ReplayIndexWriter {
    name: String,
    recording_id: RecordingId,
    index: Arc<ReplayIndex>,
    log: RecordLog<ReplayIndexEntry>,
    last_position: Option<u64>,
}

impl ReplayIndexWriter {
    /// Opens the index file of `index`'s stream under `dir`, replaying it
    /// into `index`.
    ///
    /// Positions recovered from an earlier recording do not hold back
    /// messages of `recording_id`.
    ///
    /// # Errors
    /// Returns `StoreError` if the file cannot be opened.
    pub fn open(
        dir: impl AsRef<Path>,
        recording_id: RecordingId,
        index: Arc<ReplayIndex>,
    ) -> Result<Self, StoreError> {
        let stream_id = index.stream_id();
        let path = dir.as_ref().join(format!("replay-index-{}.log", stream_id.0));
        let (log, entries) = RecordLog::<ReplayIndexEntry>::open(path)?;

        let count = entries.len();
        for entry in entries {
            index.restore(entry);
        }
        debug!(%stream_id, entries = count, "recovered replay index");

        let last_position = index
            .last_position()
            .filter(|(last_recording, _)| *last_recording == recording_id)
            .map(|(_, position)| position);
        Ok(Self {
            name: format!("replay-index-{}", stream_id.0),
            recording_id,
            index,
            log,
            last_position,
        })
    }

    /// Returns the shared index this writer feeds.
    #[must_use]
    pub fn index(&self) -> &Arc<ReplayIndex> {
        &self.index
    }
}

impl Index for ReplayIndexWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_fragment(&mut self, fragment: &Fragment) -> Result<(), StoreError> {
        let header = &fragment.header;
        if self.last_position.is_some_and(|last| header.position <= last) {
            return Ok(());
        }
        self.last_position = Some(header.position);

        if header.template_id.is_session_level() {
            return Ok(());
        }

        let length = u32::try_from(fragment.len()).map_err(|_| StoreError::Corrupted {
            reason: format!("fragment of {} bytes exceeds index entry length", fragment.len()),
        })?;

        if header.flags.sequence_reset {
            self.index.start_sequence_reset(header.session);
        }

        match self.index.on_message(
            header.session,
            header.seq_no,
            header.stream_id,
            self.recording_id,
            header.position,
            length,
        ) {
            IndexOutcome::Indexed(entry) => self.log.append(&entry),
            IndexOutcome::Duplicate | IndexOutcome::ForeignStream => {}
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<SyncStatus, StoreError> {
        self.log.poll_sync(&self.name)
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.log.flush(&self.name)
    }

    fn last_position(&self) -> Option<u64> {
        self.last_position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironlink_core::message::{FragmentFlags, FragmentHeader, TemplateId};

    const SESSION: SessionIdentity = SessionIdentity::new(9);
    const RECORDING: RecordingId = RecordingId(4);

    fn fragment(seq: u64, position: u64) -> Fragment {
        let mut header = FragmentHeader::new(
            StreamId::OUTBOUND,
            SESSION,
            SeqNum::new(seq),
            TemplateId(514),
        );
        header.position = position;
        Fragment::new(header, vec![0u8; 10])
    }

    #[test]
    fn test_on_message_orders_entries() {
        let index = ReplayIndex::new(StreamId::OUTBOUND);
        for (seq, position) in [(1, 32), (2, 74), (3, 116)] {
            let outcome = index.on_message(
                SESSION,
                SeqNum::new(seq),
                StreamId::OUTBOUND,
                RECORDING,
                position,
                10,
            );
            assert!(matches!(outcome, IndexOutcome::Indexed(_)));
        }

        assert_eq!(index.last_seq_no(SESSION), Some(SeqNum::new(3)));
        assert_eq!(index.entry_count(SESSION), 3);
        let entry = index.lookup(SESSION, SeqNum::new(2)).unwrap();
        assert_eq!(entry.position, 74);
        assert_eq!(entry.length, 10);
        assert_eq!(entry.recording_id, RECORDING);
    }

    #[test]
    fn test_duplicates_are_skipped() {
        let index = ReplayIndex::new(StreamId::OUTBOUND);
        let offer = |seq, position| {
            index.on_message(SESSION, SeqNum::new(seq), StreamId::OUTBOUND, RECORDING, position, 10)
        };

        assert!(matches!(offer(5, 100), IndexOutcome::Indexed(_)));
        assert_eq!(offer(6, 100), IndexOutcome::Duplicate);
        assert_eq!(offer(5, 200), IndexOutcome::Duplicate);
        assert_eq!(offer(4, 300), IndexOutcome::Duplicate);
        assert_eq!(index.entry_count(SESSION), 1);
    }

    #[test]
    fn test_foreign_stream_is_rejected() {
        let index = ReplayIndex::new(StreamId::OUTBOUND);
        let outcome = index.on_message(
            SESSION,
            SeqNum::new(1),
            StreamId::INBOUND,
            RECORDING,
            32,
            10,
        );
        assert_eq!(outcome, IndexOutcome::ForeignStream);
    }

    #[test]
    fn test_sequence_reset_supersedes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(ReplayIndex::new(StreamId::OUTBOUND));
        let mut writer = ReplayIndexWriter::open(dir.path(), RECORDING, Arc::clone(&index)).unwrap();

        writer.on_fragment(&fragment(1, 32)).unwrap();
        writer.on_fragment(&fragment(2, 74)).unwrap();
        let mut reset = fragment(1, 116);
        reset.header.flags = FragmentFlags::SEQUENCE_RESET;
        writer.on_fragment(&reset).unwrap();
        writer.flush().unwrap();

        assert_eq!(index.sequence_index(SESSION), 1);
        assert_eq!(index.lookup(SESSION, SeqNum::new(1)).unwrap().position, 116);
        assert!(index.lookup(SESSION, SeqNum::new(2)).is_none());

        // All three entries remain on disk.
        let len = std::fs::metadata(dir.path().join("replay-index-2.log")).unwrap().len();
        assert_eq!(len, 3 * (ReplayIndexEntry::ENCODED_LEN as u64 + 4));
    }

    #[test]
    fn test_writer_recovers_current_generation() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = Arc::new(ReplayIndex::new(StreamId::OUTBOUND));
            let mut writer = ReplayIndexWriter::open(dir.path(), RECORDING, index).unwrap();
            writer.on_fragment(&fragment(1, 32)).unwrap();
            writer.on_fragment(&fragment(2, 74)).unwrap();
            let mut reset = fragment(1, 116);
            reset.header.flags = FragmentFlags::SEQUENCE_RESET;
            writer.on_fragment(&reset).unwrap();
            writer.on_fragment(&fragment(2, 158)).unwrap();
            writer.flush().unwrap();
        }

        let index = Arc::new(ReplayIndex::new(StreamId::OUTBOUND));
        let mut writer = ReplayIndexWriter::open(dir.path(), RECORDING, Arc::clone(&index)).unwrap();
        assert_eq!(index.sequence_index(SESSION), 1);
        assert_eq!(index.entry_count(SESSION), 2);
        assert_eq!(index.lookup(SESSION, SeqNum::new(2)).unwrap().position, 158);
        assert_eq!(writer.last_position(), Some(158));

        // Redelivery after restart does not create new entries.
        writer.on_fragment(&fragment(2, 158)).unwrap();
        assert_eq!(index.entry_count(SESSION), 2);
    }

    #[test]
    fn test_redelivered_reset_does_not_bump_generation() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(ReplayIndex::new(StreamId::OUTBOUND));
        let mut writer = ReplayIndexWriter::open(dir.path(), RECORDING, Arc::clone(&index)).unwrap();

        let mut reset = fragment(1, 32);
        reset.header.flags = FragmentFlags::SEQUENCE_RESET;
        writer.on_fragment(&reset).unwrap();
        writer.on_fragment(&reset).unwrap();

        assert_eq!(index.sequence_index(SESSION), 1);
        assert_eq!(index.entry_count(SESSION), 1);
    }

    #[test]
    fn test_new_recording_is_not_a_duplicate() {
        let index = ReplayIndex::new(StreamId::OUTBOUND);
        let next = RecordingId(5);
        let offer = |seq, recording_id, position| {
            index.on_message(SESSION, SeqNum::new(seq), StreamId::OUTBOUND, recording_id, position, 10)
        };

        assert!(matches!(offer(20, RECORDING, 1_280), IndexOutcome::Indexed(_)));
        assert!(matches!(offer(21, next, 32), IndexOutcome::Indexed(_)));
        assert_eq!(offer(22, next, 32), IndexOutcome::Duplicate);
        assert_eq!(index.last_position(), Some((next, 32)));
        assert_eq!(index.lookup(SESSION, SeqNum::new(21)).unwrap().recording_id, next);
    }

    #[test]
    fn test_writer_indexes_new_recording_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = Arc::new(ReplayIndex::new(StreamId::OUTBOUND));
            let mut writer = ReplayIndexWriter::open(dir.path(), RECORDING, index).unwrap();
            for seq in 1..=20u64 {
                writer.on_fragment(&fragment(seq, seq * 42)).unwrap();
            }
            writer.flush().unwrap();
        }

        let next = RecordingId(5);
        let index = Arc::new(ReplayIndex::new(StreamId::OUTBOUND));
        let mut writer = ReplayIndexWriter::open(dir.path(), next, Arc::clone(&index)).unwrap();
        assert_eq!(writer.last_position(), None);

        writer.on_fragment(&fragment(21, 32)).unwrap();
        writer.flush().unwrap();

        let entry = index.lookup(SESSION, SeqNum::new(21)).unwrap();
        assert_eq!((entry.recording_id, entry.position), (next, 32));
        assert_eq!(index.lookup(SESSION, SeqNum::new(20)).unwrap().recording_id, RECORDING);
    }
}
