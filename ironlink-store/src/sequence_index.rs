/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 3/2/26
******************************************************************************/

//! Durable sequence number index.
//!
//! Maps each [`SessionIdentity`] to the last sequence number sent and
//! received, so a restarted gateway can resume a session where it left off.
//!
//! The in-memory side is an arena of immutable [`SequenceNumberRecord`]s
//! behind `Arc`s: an update builds a new record and swaps the pointer, so a
//! concurrent reader always holds a complete prior record. The durable side
//! is one [`RecordLog`] per direction, written by a
//! [`SequenceNumberIndexWriter`].

use crate::record::{FixedRecord, RecordLog};
use crate::traits::{Index, SyncStatus};
use bytes::{Buf, BufMut, BytesMut};
use ironlink_core::error::StoreError;
use ironlink_core::message::Fragment;
use ironlink_core::types::{Direction, RecordingId, SeqNum, SessionIdentity};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// File name of the sent sequence number index.
pub const SENT_INDEX_FILE: &str = "sent-sequence-numbers.idx";
/// File name of the received sequence number index.
pub const RECEIVED_INDEX_FILE: &str = "received-sequence-numbers.idx";

/// Number of appended records after which a writer compacts its file.
pub const DEFAULT_COMPACT_THRESHOLD: usize = 4096;

/// Last known sequence numbers of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceNumberRecord {
    /// Session the record belongs to.
    pub session: SessionIdentity,
    /// Last sequence number sent, zero if none.
    pub last_sent_seq_no: SeqNum,
    /// Last sequence number received, zero if none.
    pub last_received_seq_no: SeqNum,
    /// Most recent source position applied in either direction.
    pub updated_at_position: u64,
    /// Recording and position last applied from the outbound stream.
    pub sent_position: Option<(RecordingId, u64)>,
    /// Recording and position last applied from the inbound stream.
    pub received_position: Option<(RecordingId, u64)>,
}

impl SequenceNumberRecord {
    fn empty(session: SessionIdentity) -> Self {
        Self {
            session,
            last_sent_seq_no: SeqNum::new(0),
            last_received_seq_no: SeqNum::new(0),
            updated_at_position: 0,
            sent_position: None,
            received_position: None,
        }
    }

    /// Returns the next sequence number to send when resuming.
    #[must_use]
    pub const fn next_sent_seq_no(&self) -> SeqNum {
        self.last_sent_seq_no.next()
    }

    /// Returns the next sequence number to expect when resuming.
    #[must_use]
    pub const fn next_received_seq_no(&self) -> SeqNum {
        self.last_received_seq_no.next()
    }

    /// Returns the recording and position last applied for a direction.
    #[must_use]
    pub const fn position(&self, direction: Direction) -> Option<(RecordingId, u64)> {
        match direction {
            Direction::Inbound => self.received_position,
            Direction::Outbound => self.sent_position,
        }
    }

    fn set_position(&mut self, source: SourcePosition) {
        let applied = Some((source.recording_id, source.position));
        match source.direction {
            Direction::Inbound => self.received_position = applied,
            Direction::Outbound => self.sent_position = applied,
        }
        self.updated_at_position = source.position;
    }
}

/// Stream position an update was derived from.
///
/// Positions only order updates within one recording. A new recording of
/// the same stream starts its positions again from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePosition {
    /// Direction of the stream.
    pub direction: Direction,
    /// Recording the position belongs to.
    pub recording_id: RecordingId,
    /// Position within that recording.
    pub position: u64,
}

impl SourcePosition {
    /// Creates a source position.
    #[must_use]
    pub const fn new(direction: Direction, recording_id: RecordingId, position: u64) -> Self {
        Self {
            direction,
            recording_id,
            position,
        }
    }
}

/// Result of applying an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update was applied and a new record published.
    Applied,
    /// The position was not newer than the last applied one; nothing changed.
    Stale,
}

impl UpdateOutcome {
    /// Returns true if the update changed the index.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Shared in-memory view of the sequence number index.
///
/// Written by the indexer agents, read by session resumption and replays.
#[derive(Debug, Default)]
pub struct SequenceNumberIndex {
    records: RwLock<HashMap<SessionIdentity, Arc<SequenceNumberRecord>>>,
}

impl SequenceNumberIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current record of a session.
    #[must_use]
    pub fn lookup(&self, session: SessionIdentity) -> Option<Arc<SequenceNumberRecord>> {
        self.records.read().get(&session).cloned()
    }

    /// Returns the last sequence number sent on a session, if any was indexed.
    #[must_use]
    pub fn last_sent_seq_no(&self, session: SessionIdentity) -> Option<SeqNum> {
        self.lookup(session)
            .map(|record| record.last_sent_seq_no)
            .filter(|seq| seq.is_valid())
    }

    /// Returns the number of sessions with a record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if no session has a record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Applies a monotonic update.
    ///
    /// Sequence numbers only move forward: a value lower than the stored one
    /// is ignored. An update whose position is not newer than the last one
    /// applied for the same session, direction and recording is reported as
    /// [`UpdateOutcome::Stale`], which makes redelivery a no-op.
    ///
    /// # Arguments
    /// * `session` - The session to update
    /// * `sent_seq_no` - New last sent sequence number, if any
    /// * `received_seq_no` - New last received sequence number, if any
    /// * `source` - Stream position the update was derived from
    pub fn update(
        &self,
        session: SessionIdentity,
        sent_seq_no: Option<SeqNum>,
        received_seq_no: Option<SeqNum>,
        source: SourcePosition,
    ) -> UpdateOutcome {
        self.replace(session, source, |record| {
            if let Some(sent) = sent_seq_no {
                if sent < record.last_sent_seq_no {
                    debug!(%session, %sent, last = %record.last_sent_seq_no, "ignoring lower sent seq no");
                }
                record.last_sent_seq_no = record.last_sent_seq_no.max(sent);
            }
            if let Some(received) = received_seq_no {
                if received < record.last_received_seq_no {
                    debug!(%session, %received, last = %record.last_received_seq_no, "ignoring lower received seq no");
                }
                record.last_received_seq_no = record.last_received_seq_no.max(received);
            }
        })
    }

    /// Applies a protocol-level sequence reset.
    ///
    /// This is the only operation that may lower a sequence number.
    pub fn reset(
        &self,
        session: SessionIdentity,
        direction: Direction,
        seq_no: SeqNum,
        source: SourcePosition,
    ) -> UpdateOutcome {
        self.replace(session, source, |record| match direction {
            Direction::Inbound => record.last_received_seq_no = seq_no,
            Direction::Outbound => record.last_sent_seq_no = seq_no,
        })
    }

    /// Returns a copy of every record.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SequenceNumberRecord> {
        self.records
            .read()
            .values()
            .map(|record| **record)
            .collect()
    }

    fn replace<F>(&self, session: SessionIdentity, source: SourcePosition, apply: F) -> UpdateOutcome
    where
        F: FnOnce(&mut SequenceNumberRecord),
    {
        let mut records = self.records.write();
        let current = records.get(&session);

        if let Some((recording_id, last)) = current.and_then(|record| record.position(source.direction))
            && recording_id == source.recording_id
            && source.position <= last
        {
            warn!(
                %session,
                direction = %source.direction,
                %recording_id,
                position = source.position,
                last,
                "rejecting stale sequence number update"
            );
            return UpdateOutcome::Stale;
        }

        let mut next = current.map_or_else(|| SequenceNumberRecord::empty(session), |record| **record);
        apply(&mut next);
        next.set_position(source);
        records.insert(session, Arc::new(next));
        UpdateOutcome::Applied
    }
}

/// Persisted form of one applied update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SequenceEntry {
    session: SessionIdentity,
    seq_no: SeqNum,
    recording_id: RecordingId,
    position: u64,
    reset: bool,
}

impl FixedRecord for SequenceEntry {
    const ENCODED_LEN: usize = 8 + 8 + 8 + 8 + 1;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.session.uuid());
        buf.put_u64_le(self.seq_no.value());
        buf.put_u64_le(self.recording_id.0);
        buf.put_u64_le(self.position);
        buf.put_u8(u8::from(self.reset));
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        let session = SessionIdentity::new(buf.get_u64_le());
        let seq_no = SeqNum::new(buf.get_u64_le());
        let recording_id = RecordingId(buf.get_u64_le());
        let position = buf.get_u64_le();
        let reset = match buf.get_u8() {
            0 => false,
            1 => true,
            _ => return None,
        };
        Some(Self {
            session,
            seq_no,
            recording_id,
            position,
            reset,
        })
    }
}

/// Durable writer for one direction of the sequence number index.
///
/// Owned by that direction's indexer agent; it is the only writer of its file.
/// Every applied update appends one record; once
/// [`compact_threshold`](Self::with_compact_threshold) records accumulated
/// since the last compaction, the next sync rewrites the file with one record
/// per session.
#[derive(Debug)]
pub struct SequenceNumberIndexWriter {
    name: String,
    direction: Direction,
    recording_id: RecordingId,
    index: Arc<SequenceNumberIndex>,
    log: RecordLog<SequenceEntry>,
    last_position: Option<u64>,
    appended: usize,
    compacted: usize,
    compact_threshold: usize,
}

impl SequenceNumberIndexWriter {
    /// Opens the index file for `direction` under `dir`, replaying it into
    /// the shared `index`.
    ///
    /// # Arguments
    /// * `dir` - Directory holding the index files
    /// * `direction` - Direction of the stream this writer indexes
    /// * `recording_id` - Recording of the stream being indexed
    /// * `index` - Shared in-memory index
    ///
    /// # Errors
    /// Returns `StoreError` if the file cannot be opened.
    pub fn open(
        dir: impl AsRef<Path>,
        direction: Direction,
        recording_id: RecordingId,
        index: Arc<SequenceNumberIndex>,
    ) -> Result<Self, StoreError> {
        let file_name = match direction {
            Direction::Inbound => RECEIVED_INDEX_FILE,
            Direction::Outbound => SENT_INDEX_FILE,
        };
        let (log, entries) = RecordLog::open(dir.as_ref().join(file_name))?;

        let mut last_position = None;
        for entry in &entries {
            apply_entry(&index, direction, entry);
            if entry.recording_id == recording_id {
                last_position = last_position.max(Some(entry.position));
            }
        }

        debug!(%direction, %recording_id, entries = entries.len(), "recovered sequence number index");

        Ok(Self {
            name: format!("{direction}-sequence-numbers"),
            direction,
            recording_id,
            index,
            log,
            last_position,
            appended: entries.len(),
            compacted: 0,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        })
    }

    /// Sets the number of appended records that triggers a compaction.
    #[must_use]
    pub fn with_compact_threshold(mut self, threshold: usize) -> Self {
        self.compact_threshold = threshold.max(1);
        self
    }

    /// Returns the shared index this writer feeds.
    #[must_use]
    pub fn index(&self) -> &Arc<SequenceNumberIndex> {
        &self.index
    }

    /// Returns the number of records in the file since it was last compacted.
    #[must_use]
    pub fn appended(&self) -> usize {
        self.appended
    }

    /// Rewrites the file with one record per session and waits for it.
    ///
    /// The rewrite goes through a temporary file and an atomic rename, so a
    /// crash leaves either the old or the compacted file.
    ///
    /// # Errors
    /// Returns `StoreError` if staged records cannot be synced or the rewrite
    /// cannot be handed to the writer.
    pub fn compact(&mut self) -> Result<(), StoreError> {
        self.log.flush(&self.name)?;
        self.start_compaction()?;
        self.log.flush(&self.name)
    }

    fn start_compaction(&mut self) -> Result<(), StoreError> {
        let mut entries: Vec<SequenceEntry> = self
            .index
            .snapshot()
            .into_iter()
            .filter_map(|record| {
                record
                    .position(self.direction)
                    .map(|(recording_id, position)| SequenceEntry {
                        session: record.session,
                        seq_no: match self.direction {
                            Direction::Inbound => record.last_received_seq_no,
                            Direction::Outbound => record.last_sent_seq_no,
                        },
                        recording_id,
                        position,
                        reset: false,
                    })
            })
            .collect();
        entries.sort_by_key(|entry| (entry.recording_id, entry.position));
        self.log.start_rewrite(&entries, &self.name)?;
        debug!(
            file = %self.log.path().display(),
            appended = self.appended,
            sessions = entries.len(),
            "compacting sequence number index"
        );
        self.appended = entries.len();
        self.compacted = entries.len();
        Ok(())
    }
}

fn apply_entry(index: &SequenceNumberIndex, direction: Direction, entry: &SequenceEntry) {
    let source = SourcePosition::new(direction, entry.recording_id, entry.position);
    if entry.reset {
        index.reset(entry.session, direction, entry.seq_no, source);
    } else {
        match direction {
            Direction::Inbound => index.update(entry.session, None, Some(entry.seq_no), source),
            Direction::Outbound => index.update(entry.session, Some(entry.seq_no), None, source),
        };
    }
}

impl Index for SequenceNumberIndexWriter {
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

        let entry = SequenceEntry {
            session: header.session,
            seq_no: header.seq_no,
            recording_id: self.recording_id,
            position: header.position,
            reset: header.flags.sequence_reset,
        };
        let source = SourcePosition::new(self.direction, self.recording_id, header.position);
        let outcome = if entry.reset {
            self.index.reset(entry.session, self.direction, entry.seq_no, source)
        } else {
            match self.direction {
                Direction::Inbound => self.index.update(entry.session, None, Some(entry.seq_no), source),
                Direction::Outbound => self.index.update(entry.session, Some(entry.seq_no), None, source),
            }
        };

        if outcome.is_applied() {
            let record = self.index.lookup(entry.session);
            let effective = record.map_or(entry.seq_no, |record| match self.direction {
                Direction::Inbound => record.last_received_seq_no,
                Direction::Outbound => record.last_sent_seq_no,
            });
            self.log.append(&SequenceEntry {
                seq_no: effective,
                ..entry
            });
            self.appended += 1;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<SyncStatus, StoreError> {
        let status = self.log.poll_sync(&self.name)?;
        if status.is_durable() && self.appended - self.compacted >= self.compact_threshold {
            self.start_compaction()?;
            return Ok(SyncStatus::InProgress);
        }
        Ok(status)
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
    use ironlink_core::types::StreamId;
    use std::fs::OpenOptions;
    use std::io::Write;

    const SESSION: SessionIdentity = SessionIdentity::new(42);
    const RECORDING: RecordingId = RecordingId(7);
    const NEXT_RECORDING: RecordingId = RecordingId(8);

    fn fragment(direction: Direction, seq: u64, position: u64) -> Fragment {
        let mut header =
            FragmentHeader::new(direction.stream_id(), SESSION, SeqNum::new(seq), TemplateId(514));
        header.position = position;
        Fragment::new(header, &b"body"[..])
    }

    fn out(position: u64) -> SourcePosition {
        SourcePosition::new(Direction::Outbound, RECORDING, position)
    }

    fn open_writer(
        dir: &Path,
        direction: Direction,
        recording_id: RecordingId,
        index: &Arc<SequenceNumberIndex>,
    ) -> SequenceNumberIndexWriter {
        SequenceNumberIndexWriter::open(dir, direction, recording_id, Arc::clone(index)).unwrap()
    }

    #[test]
    fn test_update_is_monotonic() {
        let index = SequenceNumberIndex::new();

        assert!(index.update(SESSION, Some(SeqNum::new(5)), None, out(10)).is_applied());
        assert!(index.update(SESSION, Some(SeqNum::new(3)), None, out(20)).is_applied());

        let record = index.lookup(SESSION).unwrap();
        assert_eq!(record.last_sent_seq_no, SeqNum::new(5));
        assert_eq!(record.sent_position, Some((RECORDING, 20)));
        assert_eq!(record.updated_at_position, 20);
    }

    #[test]
    fn test_stale_position_is_a_no_op() {
        let index = SequenceNumberIndex::new();

        index.update(SESSION, Some(SeqNum::new(1)), None, out(100));
        let before = index.lookup(SESSION).unwrap();

        assert_eq!(
            index.update(SESSION, Some(SeqNum::new(9)), None, out(100)),
            UpdateOutcome::Stale
        );
        assert_eq!(
            index.update(SESSION, Some(SeqNum::new(9)), None, out(50)),
            UpdateOutcome::Stale
        );
        assert_eq!(*index.lookup(SESSION).unwrap(), *before);
    }

    #[test]
    fn test_new_recording_restarts_positions() {
        let index = SequenceNumberIndex::new();
        index.update(SESSION, Some(SeqNum::new(20)), None, out(1_280));

        let outcome = index.update(
            SESSION,
            Some(SeqNum::new(21)),
            None,
            SourcePosition::new(Direction::Outbound, NEXT_RECORDING, 32),
        );

        assert!(outcome.is_applied());
        let record = index.lookup(SESSION).unwrap();
        assert_eq!(record.last_sent_seq_no, SeqNum::new(21));
        assert_eq!(record.sent_position, Some((NEXT_RECORDING, 32)));
    }

    #[test]
    fn test_directions_track_positions_independently() {
        let index = SequenceNumberIndex::new();

        index.update(SESSION, Some(SeqNum::new(50)), None, out(1_000));
        let outcome = index.update(
            SESSION,
            None,
            Some(SeqNum::new(48)),
            SourcePosition::new(Direction::Inbound, RecordingId(3), 64),
        );
        assert!(outcome.is_applied());

        let record = index.lookup(SESSION).unwrap();
        assert_eq!(record.next_sent_seq_no(), SeqNum::new(51));
        assert_eq!(record.next_received_seq_no(), SeqNum::new(49));
    }

    #[test]
    fn test_reset_lowers_sequence_number() {
        let index = SequenceNumberIndex::new();

        index.update(SESSION, Some(SeqNum::new(80)), None, out(10));
        index.reset(SESSION, Direction::Outbound, SeqNum::new(1), out(20));

        assert_eq!(index.last_sent_seq_no(SESSION), Some(SeqNum::new(1)));
    }

    #[test]
    fn test_readers_keep_prior_record() {
        let index = SequenceNumberIndex::new();

        index.update(SESSION, Some(SeqNum::new(1)), None, out(10));
        let held = index.lookup(SESSION).unwrap();
        index.update(SESSION, Some(SeqNum::new(2)), None, out(20));

        assert_eq!(held.last_sent_seq_no, SeqNum::new(1));
        assert_eq!(index.lookup(SESSION).unwrap().last_sent_seq_no, SeqNum::new(2));
    }

    #[test]
    fn test_writer_persists_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = Arc::new(SequenceNumberIndex::new());
            let mut sent = open_writer(dir.path(), Direction::Outbound, RECORDING, &index);
            let mut received = open_writer(dir.path(), Direction::Inbound, RECORDING, &index);

            for (seq, position) in [(49, 32), (50, 96)] {
                sent.on_fragment(&fragment(Direction::Outbound, seq, position)).unwrap();
            }
            received.on_fragment(&fragment(Direction::Inbound, 48, 32)).unwrap();
            sent.flush().unwrap();
            received.flush().unwrap();
        }

        let index = Arc::new(SequenceNumberIndex::new());
        let sent = open_writer(dir.path(), Direction::Outbound, RECORDING, &index);
        let _received = open_writer(dir.path(), Direction::Inbound, RECORDING, &index);

        let record = index.lookup(SESSION).unwrap();
        assert_eq!(record.last_sent_seq_no, SeqNum::new(50));
        assert_eq!(record.last_received_seq_no, SeqNum::new(48));
        assert_eq!(sent.last_position(), Some(96));
    }

    #[test]
    fn test_writer_accepts_new_recording_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = Arc::new(SequenceNumberIndex::new());
            let mut writer = open_writer(dir.path(), Direction::Outbound, RECORDING, &index);
            for seq in 1..=20u64 {
                writer.on_fragment(&fragment(Direction::Outbound, seq, seq * 64)).unwrap();
            }
            writer.flush().unwrap();
        }

        let index = Arc::new(SequenceNumberIndex::new());
        let mut writer = open_writer(dir.path(), Direction::Outbound, NEXT_RECORDING, &index);
        assert_eq!(writer.last_position(), None);

        for (seq, position) in [(21, 32), (22, 96)] {
            writer.on_fragment(&fragment(Direction::Outbound, seq, position)).unwrap();
        }
        writer.flush().unwrap();
        drop(writer);
        assert_eq!(index.last_sent_seq_no(SESSION), Some(SeqNum::new(22)));

        // A second crash resumes from the new traffic, not the old record.
        let index = Arc::new(SequenceNumberIndex::new());
        let writer = open_writer(dir.path(), Direction::Outbound, NEXT_RECORDING, &index);
        assert_eq!(index.last_sent_seq_no(SESSION), Some(SeqNum::new(22)));
        assert_eq!(writer.last_position(), Some(96));
    }

    #[test]
    fn test_writer_ignores_redelivered_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(SequenceNumberIndex::new());
        let mut writer = open_writer(dir.path(), Direction::Outbound, RECORDING, &index);

        let first = fragment(Direction::Outbound, 1, 32);
        writer.on_fragment(&first).unwrap();
        writer.on_fragment(&first).unwrap();
        writer.flush().unwrap();

        let len = std::fs::metadata(dir.path().join(SENT_INDEX_FILE)).unwrap().len();
        assert_eq!(len, (SequenceEntry::ENCODED_LEN + 4) as u64);
        assert_eq!(writer.appended(), 1);
    }

    #[test]
    fn test_torn_write_keeps_last_full_record() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = Arc::new(SequenceNumberIndex::new());
            let mut writer = open_writer(dir.path(), Direction::Outbound, RECORDING, &index);
            writer.on_fragment(&fragment(Direction::Outbound, 7, 32)).unwrap();
            writer.flush().unwrap();
        }

        // Simulate a crash part way through writing the next record.
        let path = dir.path().join(SENT_INDEX_FILE);
        let next = SequenceEntry {
            session: SESSION,
            seq_no: SeqNum::new(8),
            recording_id: RECORDING,
            position: 96,
            reset: false,
        };
        let mut torn = BytesMut::new();
        next.encode(&mut torn);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&torn[..11]).unwrap();
        drop(file);

        let index = Arc::new(SequenceNumberIndex::new());
        let _writer = open_writer(dir.path(), Direction::Outbound, RECORDING, &index);
        assert_eq!(index.last_sent_seq_no(SESSION), Some(SeqNum::new(7)));
    }

    #[test]
    fn test_reset_fragment_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = Arc::new(SequenceNumberIndex::new());
            let mut writer = open_writer(dir.path(), Direction::Outbound, RECORDING, &index);
            writer.on_fragment(&fragment(Direction::Outbound, 30, 32)).unwrap();
            let mut reset = fragment(Direction::Outbound, 1, 96);
            reset.header.flags = FragmentFlags::SEQUENCE_RESET;
            writer.on_fragment(&reset).unwrap();
            writer.flush().unwrap();
        }

        let index = Arc::new(SequenceNumberIndex::new());
        let _writer = open_writer(dir.path(), Direction::Outbound, RECORDING, &index);
        assert_eq!(index.last_sent_seq_no(SESSION), Some(SeqNum::new(1)));
    }

    #[test]
    fn test_compact_keeps_latest_values() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = Arc::new(SequenceNumberIndex::new());
            let mut writer = open_writer(dir.path(), Direction::Outbound, RECORDING, &index);
            for seq in 1..=20u64 {
                writer.on_fragment(&fragment(Direction::Outbound, seq, seq * 64)).unwrap();
            }
            writer.compact().unwrap();
            assert_eq!(writer.appended(), 1);
        }

        let path = dir.path().join(SENT_INDEX_FILE);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), (SequenceEntry::ENCODED_LEN + 4) as u64);

        let index = Arc::new(SequenceNumberIndex::new());
        let writer = open_writer(dir.path(), Direction::Outbound, RECORDING, &index);
        assert_eq!(index.last_sent_seq_no(SESSION), Some(SeqNum::new(20)));
        assert_eq!(writer.last_position(), Some(20 * 64));
    }

    #[test]
    fn test_sync_compacts_past_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(SequenceNumberIndex::new());
        let mut writer =
            open_writer(dir.path(), Direction::Outbound, RECORDING, &index).with_compact_threshold(8);

        for seq in 1..=10u64 {
            writer.on_fragment(&fragment(Direction::Outbound, seq, seq * 64)).unwrap();
        }
        let mut polls = 0;
        while !writer.sync().unwrap().is_durable() {
            polls += 1;
            assert!(polls < 1_000, "sync never completed");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        assert_eq!(writer.appended(), 1);
        let path = dir.path().join(SENT_INDEX_FILE);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), (SequenceEntry::ENCODED_LEN + 4) as u64);

        // Below the threshold again: appends accumulate without a rewrite.
        writer.on_fragment(&fragment(Direction::Outbound, 11, 11 * 64)).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.appended(), 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * (SequenceEntry::ENCODED_LEN + 4) as u64);
    }

    #[test]
    fn test_session_level_fragments_do_not_move_seq_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(SequenceNumberIndex::new());
        let mut writer = open_writer(dir.path(), Direction::Outbound, RECORDING, &index);

        let mut keepalive = fragment(Direction::Outbound, 0, 32);
        keepalive.header.template_id = TemplateId::SEQUENCE;
        keepalive.header.stream_id = StreamId::OUTBOUND;
        writer.on_fragment(&keepalive).unwrap();

        assert!(index.lookup(SESSION).is_none());
        assert_eq!(writer.last_position(), Some(32));
    }
}
