/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Append-only files of fixed-size, checksummed records.
//!
//! Every record is written as `payload ++ crc32(payload)`. Appends are staged
//! in memory and handed to a writer thread by [`RecordLog::poll_sync`], which
//! the owner calls again until the write is reported durable; the caller never
//! blocks on the file. On open the file is scanned front to back and cut at the
//! first short or corrupt frame, so a write torn by a crash never surfaces as a
//! mixed record: readers see either the previous state or the fully written one.

use crate::traits::SyncStatus;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use ironlink_core::error::StoreError;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Size of the trailing checksum in bytes.
const CRC_LEN: usize = 4;

/// A record with a fixed encoded size.
pub(crate) trait FixedRecord: Sized {
    /// Encoded payload size, excluding the checksum.
    const ENCODED_LEN: usize;

    /// Appends exactly [`Self::ENCODED_LEN`] bytes to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Decodes a payload of exactly [`Self::ENCODED_LEN`] bytes.
    fn decode(buf: &mut &[u8]) -> Option<Self>;
}

enum WriteCommand {
    /// Write `bytes` at `offset` and fsync.
    Append { bytes: Bytes, offset: u64 },
    /// Replace the whole file with `bytes`.
    Rewrite { bytes: Bytes },
}

enum WriteOutcome {
    Appended(Result<(), String>),
    Rewritten(Result<(), String>),
}

/// The write currently owned by the writer thread.
#[derive(Debug)]
enum InFlight {
    Append(Bytes),
    Rewrite { len: u64, records: usize },
}

/// An append-only file of [`FixedRecord`]s.
#[derive(Debug)]
pub(crate) struct RecordLog<R> {
    path: PathBuf,
    /// Bytes known to be on disk and fsynced.
    durable_len: u64,
    /// Encoded frames waiting for the next sync.
    pending: BytesMut,
    in_flight: Option<InFlight>,
    commands: Option<Sender<WriteCommand>>,
    outcomes: Receiver<WriteOutcome>,
    writer: Option<JoinHandle<()>>,
    _record: PhantomData<fn() -> R>,
}

impl<R: FixedRecord> RecordLog<R> {
    const FRAME_LEN: usize = R::ENCODED_LEN + CRC_LEN;

    /// Opens or creates the file at `path` and returns every intact record.
    ///
    /// A torn or corrupt tail is truncated away before the file is reused.
    pub(crate) fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<R>), StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::with_capacity(bytes.len() / Self::FRAME_LEN);
        let mut valid_len = 0usize;
        for frame in bytes.chunks(Self::FRAME_LEN) {
            match Self::decode_frame(frame) {
                Some(record) => {
                    records.push(record);
                    valid_len += Self::FRAME_LEN;
                }
                None => break,
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if valid_len < bytes.len() {
            warn!(
                path = %path.display(),
                discarded = bytes.len() - valid_len,
                "truncating torn records"
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len as u64))?;

        let (commands, command_rx) = crossbeam_channel::unbounded();
        let (outcome_tx, outcomes) = crossbeam_channel::unbounded();
        let writer_path = path.clone();
        let thread_name = path
            .file_name()
            .map_or_else(|| "ironlink-sync".to_string(), |name| format!("sync-{}", name.to_string_lossy()));
        let writer = thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_writer(&writer_path, Some(file), &command_rx, &outcome_tx))?;

        debug!(path = %path.display(), records = records.len(), "opened record log");

        Ok((
            Self {
                path,
                durable_len: valid_len as u64,
                pending: BytesMut::new(),
                in_flight: None,
                commands: Some(commands),
                outcomes,
                writer: Some(writer),
                _record: PhantomData,
            },
            records,
        ))
    }

    /// Stages a record for the next sync.
    pub(crate) fn append(&mut self, record: &R) {
        let start = self.pending.len();
        encode_frame(record, &mut self.pending);
        debug_assert_eq!(self.pending.len() - start, Self::FRAME_LEN);
    }

    /// Advances the durable write without blocking.
    ///
    /// Collects the outcome of the write in flight, if it finished, then hands
    /// any staged records to the writer thread. Returns
    /// [`SyncStatus::Durable`] once nothing is staged or in flight.
    ///
    /// On failure the file is cut back to its last durable length and the
    /// records of the failed write are staged again, so the next call retries
    /// them.
    pub(crate) fn poll_sync(&mut self, index_name: &str) -> Result<SyncStatus, StoreError> {
        if self.in_flight.is_some() {
            let outcome = match self.outcomes.try_recv() {
                Ok(outcome) => outcome,
                Err(TryRecvError::Empty) => return Ok(SyncStatus::InProgress),
                Err(TryRecvError::Disconnected) => return Err(writer_gone(index_name)),
            };
            self.complete(outcome, index_name)?;
        }
        self.start_append(index_name)
    }

    /// Blocks until every staged record is durable.
    ///
    /// For shutdown, compaction and tests; agents use [`poll_sync`](Self::poll_sync).
    pub(crate) fn flush(&mut self, index_name: &str) -> Result<(), StoreError> {
        loop {
            if self.in_flight.is_some() {
                let outcome = self
                    .outcomes
                    .recv()
                    .map_err(|_| writer_gone(index_name))?;
                self.complete(outcome, index_name)?;
            }
            if self.start_append(index_name)?.is_durable() {
                return Ok(());
            }
        }
    }

    /// Hands an atomic replacement of the file contents to the writer thread.
    ///
    /// The writer writes a temporary file, fsyncs it, renames it over the log
    /// and fsyncs the parent directory. Completion is reported by the next
    /// [`poll_sync`](Self::poll_sync) or [`flush`](Self::flush). Must only be
    /// called while nothing is staged or in flight.
    pub(crate) fn start_rewrite<'a, I>(&mut self, records: I, index_name: &str) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = &'a R>,
        R: 'a,
    {
        if self.in_flight.is_some() || !self.pending.is_empty() {
            return Err(StoreError::DurabilityFailure {
                index: index_name.to_string(),
                reason: "rewrite requested with writes outstanding".to_string(),
            });
        }

        let mut buf = BytesMut::new();
        let mut count = 0usize;
        for record in records {
            encode_frame(record, &mut buf);
            count += 1;
        }
        let bytes = buf.freeze();
        let len = bytes.len() as u64;
        self.send(WriteCommand::Rewrite { bytes }, index_name)?;
        self.in_flight = Some(InFlight::Rewrite {
            len,
            records: count,
        });
        Ok(())
    }

    /// Returns the file path.
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn start_append(&mut self, index_name: &str) -> Result<SyncStatus, StoreError> {
        if self.in_flight.is_some() {
            return Ok(SyncStatus::InProgress);
        }
        if self.pending.is_empty() {
            return Ok(SyncStatus::Durable);
        }
        let bytes = self.pending.split().freeze();
        let command = WriteCommand::Append {
            bytes: bytes.clone(),
            offset: self.durable_len,
        };
        if let Err(err) = self.send(command, index_name) {
            self.restage(&bytes);
            return Err(err);
        }
        self.in_flight = Some(InFlight::Append(bytes));
        Ok(SyncStatus::InProgress)
    }

    fn complete(&mut self, outcome: WriteOutcome, index_name: &str) -> Result<(), StoreError> {
        match (self.in_flight.take(), outcome) {
            (Some(InFlight::Append(bytes)), WriteOutcome::Appended(result)) => match result {
                Ok(()) => {
                    self.durable_len += bytes.len() as u64;
                    Ok(())
                }
                Err(reason) => {
                    self.restage(&bytes);
                    Err(StoreError::DurabilityFailure {
                        index: index_name.to_string(),
                        reason,
                    })
                }
            },
            (Some(InFlight::Rewrite { len, records }), WriteOutcome::Rewritten(result)) => {
                match result {
                    Ok(()) => {
                        self.durable_len = len;
                        debug!(path = %self.path.display(), records, "rewrote record log");
                    }
                    Err(reason) => {
                        warn!(path = %self.path.display(), %reason, "rewrite failed, keeping previous file");
                    }
                }
                Ok(())
            }
            _ => Err(StoreError::Corrupted {
                reason: format!("{index_name}: writer outcome does not match the write in flight"),
            }),
        }
    }

    fn restage(&mut self, bytes: &[u8]) {
        let mut restored = BytesMut::with_capacity(bytes.len() + self.pending.len());
        restored.extend_from_slice(bytes);
        restored.extend_from_slice(&self.pending);
        self.pending = restored;
    }

    fn send(&self, command: WriteCommand, index_name: &str) -> Result<(), StoreError> {
        self.commands
            .as_ref()
            .ok_or_else(|| writer_gone(index_name))?
            .send(command)
            .map_err(|_| writer_gone(index_name))
    }

    fn decode_frame(frame: &[u8]) -> Option<R> {
        if frame.len() != Self::FRAME_LEN {
            return None;
        }
        let (payload, mut crc) = frame.split_at(R::ENCODED_LEN);
        if crc32fast::hash(payload) != crc.get_u32_le() {
            return None;
        }
        let mut payload = payload;
        R::decode(&mut payload)
    }
}

impl<R> Drop for RecordLog<R> {
    fn drop(&mut self) {
        // Closing the command channel stops the writer after its current write.
        drop(self.commands.take());
        if let Some(writer) = self.writer.take()
            && writer.join().is_err()
        {
            warn!(path = %self.path.display(), "record log writer panicked");
        }
    }
}

fn encode_frame<R: FixedRecord>(record: &R, buf: &mut BytesMut) {
    let start = buf.len();
    record.encode(buf);
    let crc = crc32fast::hash(&buf[start..]);
    buf.put_u32_le(crc);
}

fn writer_gone(index_name: &str) -> StoreError {
    StoreError::DurabilityFailure {
        index: index_name.to_string(),
        reason: "record log writer stopped".to_string(),
    }
}

fn run_writer(
    path: &Path,
    mut file: Option<File>,
    commands: &Receiver<WriteCommand>,
    outcomes: &Sender<WriteOutcome>,
) {
    while let Ok(command) = commands.recv() {
        let outcome = match command {
            WriteCommand::Append { bytes, offset } => {
                WriteOutcome::Appended(append_at(path, &mut file, &bytes, offset))
            }
            WriteCommand::Rewrite { bytes } => WriteOutcome::Rewritten(rewrite(path, &mut file, &bytes)),
        };
        if outcomes.send(outcome).is_err() {
            break;
        }
    }
}

fn append_at(path: &Path, file: &mut Option<File>, bytes: &[u8], offset: u64) -> Result<(), String> {
    if file.is_none() {
        *file = Some(
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|err| err.to_string())?,
        );
    }
    let Some(handle) = file.as_mut() else {
        return Err("record log file is not open".to_string());
    };

    let result = handle
        .seek(SeekFrom::Start(offset))
        .and_then(|_| handle.write_all(bytes))
        .and_then(|()| handle.sync_data());

    if let Err(err) = result {
        if let Err(truncate_err) = handle.set_len(offset) {
            warn!(path = %path.display(), error = %truncate_err, "failed to cut back record log");
        }
        if let Err(seek_err) = handle.seek(SeekFrom::Start(offset)) {
            warn!(path = %path.display(), error = %seek_err, "failed to seek record log back");
        }
        return Err(err.to_string());
    }
    Ok(())
}

fn rewrite(path: &Path, file: &mut Option<File>, bytes: &[u8]) -> Result<(), String> {
    let temp_path = temp_file_path(path);
    let written = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&temp_path)
        .and_then(|mut temp| {
            temp.write_all(bytes)?;
            temp.sync_all()
        });
    if let Err(err) = written {
        if let Err(remove_err) = fs::remove_file(&temp_path) {
            debug!(path = %temp_path.display(), error = %remove_err, "no temporary file to remove");
        }
        return Err(err.to_string());
    }
    fs::rename(&temp_path, path).map_err(|err| err.to_string())?;

    // The old handle now points at the replaced file.
    *file = None;
    if let Err(err) = sync_parent_dir(path.parent()) {
        warn!(path = %path.display(), error = %err, "failed to sync directory after rewrite");
    }
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(reopened) => *file = Some(reopened),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "reopen after rewrite failed, retrying on next append");
        }
    }
    Ok(())
}

fn temp_file_path(path: &Path) -> PathBuf {
    match path.extension().and_then(|extension| extension.to_str()) {
        Some(extension) => path.with_extension(format!("{extension}.tmp")),
        None => path.with_extension("tmp"),
    }
}

fn sync_parent_dir(parent: Option<&Path>) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(parent) = parent {
            File::open(parent)?.sync_all()?;
        }
    }

    #[cfg(not(unix))]
    {
        let _ = parent;
    }

    Ok(())
}
