/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! In-memory message log implementation.
//!
//! This module provides a simple in-memory message log suitable for
//! testing and applications that don't require persistence.

use crate::traits::MessageLog;
use bytes::{Bytes, BytesMut};
use ironlink_core::error::StoreError;
use ironlink_core::types::RecordingId;
use parking_lot::RwLock;
use std::collections::HashMap;

/// In-memory message log.
///
/// Each recording is a growable byte buffer; positions are byte offsets.
/// Not persistent - all data is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryLog {
    recordings: RwLock<HashMap<RecordingId, BytesMut>>,
}

impl MemoryLog {
    /// Creates a new empty memory log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes to a recording and returns their start position.
    pub fn append(&self, recording_id: RecordingId, bytes: &[u8]) -> u64 {
        let mut recordings = self.recordings.write();
        let recording = recordings.entry(recording_id).or_default();
        let position = recording.len() as u64;
        recording.extend_from_slice(bytes);
        position
    }

    /// Returns the length of a recording in bytes.
    #[must_use]
    pub fn recording_len(&self, recording_id: RecordingId) -> u64 {
        self.recordings
            .read()
            .get(&recording_id)
            .map_or(0, |recording| recording.len() as u64)
    }
}

impl MessageLog for MemoryLog {
    fn read(
        &self,
        recording_id: RecordingId,
        position: u64,
        length: u32,
    ) -> Result<Bytes, StoreError> {
        let recordings = self.recordings.read();
        let recording = recordings
            .get(&recording_id)
            .ok_or(StoreError::RecordingNotFound { recording_id })?;

        let start = usize::try_from(position).ok();
        let end = start.and_then(|start| start.checked_add(length as usize));
        match (start, end) {
            (Some(start), Some(end)) if end <= recording.len() => {
                Ok(Bytes::copy_from_slice(&recording[start..end]))
            }
            _ => Err(StoreError::RangeNotAvailable {
                recording_id,
                position,
                length,
            }),
        }
    }
}
