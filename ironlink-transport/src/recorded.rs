/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! In-memory recorded stream.
//!
//! A [`RecordedStream`] is both a live stream and its recording: every
//! committed fragment is framed into one contiguous byte log, which is what
//! replays later read through [`MessageLog`]. Publishers are held back by a
//! window measured from the slowest subscriber's committed position.
//!
//! Positions start at zero in every stream, so each stream is a new recording
//! with its own [`RecordingId`]. Ids are taken from the wall clock and kept
//! strictly increasing within the process, which keeps them distinct across
//! restarts.

use crate::traits::{BufferClaim, Publication, ReservationSink, Subscription};
use bytes::{BufMut, Bytes, BytesMut};
use ironlink_core::error::{StoreError, StreamError};
use ironlink_core::message::{Fragment, FragmentHeader};
use ironlink_core::types::{RecordingId, StreamId};
use ironlink_store::traits::MessageLog;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Bytes of framing written ahead of every fragment body.
pub const FRAME_HEADER_LEN: usize = 32;

static LAST_RECORDING_ID: AtomicU64 = AtomicU64::new(0);

/// Allocates a recording id greater than any allocated before by this process.
fn next_recording_id() -> RecordingId {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));
    let next = |last: u64| now.max(last.saturating_add(1));
    let previous = LAST_RECORDING_ID
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(next(last)))
        .unwrap_or_else(|last| last);
    RecordingId(next(previous))
}

#[derive(Default)]
struct StreamState {
    recording: BytesMut,
    fragments: Vec<Fragment>,
    reserved: usize,
    subscribers: HashMap<u64, u64>,
    next_subscriber: u64,
    closed: bool,
}

impl StreamState {
    fn end(&self) -> u64 {
        self.recording.len() as u64
    }

    fn low_water_mark(&self) -> u64 {
        self.subscribers
            .values()
            .copied()
            .min()
            .unwrap_or_else(|| self.end())
    }

    fn in_flight(&self) -> usize {
        let unconsumed = self.end().saturating_sub(self.low_water_mark());
        usize::try_from(unconsumed)
            .unwrap_or(usize::MAX)
            .saturating_add(self.reserved)
    }
}

struct Shared {
    stream_id: StreamId,
    recording_id: RecordingId,
    window: usize,
    state: Mutex<StreamState>,
}

impl Shared {
    fn max_message_size(&self) -> usize {
        self.window.saturating_sub(FRAME_HEADER_LEN)
    }
}

impl ReservationSink for Shared {
    fn release(&self, length: usize) {
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(length);
    }
}

/// In-memory stream that records everything published to it.
#[derive(Clone)]
pub struct RecordedStream {
    shared: Arc<Shared>,
}

impl RecordedStream {
    /// Creates a stream whose publishers may run `window` bytes ahead of the
    /// slowest subscriber, recorded under a newly allocated recording id.
    #[must_use]
    pub fn new(stream_id: StreamId, window: usize) -> Self {
        Self::with_recording_id(stream_id, next_recording_id(), window)
    }

    /// Creates a stream recorded under `recording_id`.
    ///
    /// The caller must not reuse an id whose indexed positions are still on
    /// disk: positions of this stream start again from zero.
    #[must_use]
    pub fn with_recording_id(stream_id: StreamId, recording_id: RecordingId, window: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                stream_id,
                recording_id,
                window,
                state: Mutex::new(StreamState::default()),
            }),
        }
    }

    /// Returns the recording id replays use to read this stream.
    #[must_use]
    pub fn recording_id(&self) -> RecordingId {
        self.shared.recording_id
    }

    /// Returns the largest body a single fragment may carry.
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.shared.max_message_size()
    }

    /// Registers a subscriber that starts at the beginning of the recording.
    #[must_use]
    pub fn subscribe(&self) -> StreamSubscription {
        let mut state = self.shared.state.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.insert(id, 0);
        StreamSubscription {
            shared: Arc::clone(&self.shared),
            id,
            next_index: 0,
            committed_index: 0,
            committed_position: 0,
        }
    }

    /// Closes the stream; further claims fail with `StreamError::Closed`.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        debug!(stream = self.shared.stream_id.0, "stream closed");
    }

    /// Returns the number of fragments published so far.
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.shared.state.lock().fragments.len()
    }

    /// Returns a copy of every fragment published so far.
    #[must_use]
    pub fn fragments(&self) -> Vec<Fragment> {
        self.shared.state.lock().fragments.clone()
    }
}

impl std::fmt::Debug for RecordedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("RecordedStream")
            .field("stream_id", &self.shared.stream_id)
            .field("position", &state.end())
            .field("fragments", &state.fragments.len())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

fn encode_frame_header(buf: &mut BytesMut, header: &FragmentHeader, length: usize) {
    let flags = u8::from(header.flags.possible_retransmission)
        | (u8::from(header.flags.sequence_reset) << 1);
    buf.put_u32_le(header.stream_id.0);
    buf.put_u64_le(header.session.uuid());
    buf.put_u64_le(header.seq_no.value());
    buf.put_u16_le(header.template_id.0);
    buf.put_u8(flags);
    buf.put_u8(0);
    buf.put_u32_le(u32::try_from(length).unwrap_or(u32::MAX));
    buf.put_u32_le(0);
}

impl Publication for RecordedStream {
    fn stream_id(&self) -> StreamId {
        self.shared.stream_id
    }

    fn position(&self) -> u64 {
        self.shared.state.lock().end()
    }

    fn try_claim(
        &self,
        mut header: FragmentHeader,
        length: usize,
    ) -> Result<BufferClaim, StreamError> {
        let max_size = self.shared.max_message_size();
        if length > max_size {
            return Err(StreamError::MessageTooLarge {
                size: length,
                max_size,
            });
        }

        let frame_len = FRAME_HEADER_LEN + length;
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(StreamError::Closed);
            }
            if state.in_flight().saturating_add(frame_len) > self.shared.window {
                return Err(StreamError::BackPressured);
            }
            state.reserved += frame_len;
        }

        header.stream_id = self.shared.stream_id;
        let sink: Arc<dyn ReservationSink> = self.shared.clone();
        Ok(BufferClaim::new(header, length, frame_len, sink))
    }

    fn commit(&self, claim: BufferClaim) -> Result<u64, StreamError> {
        let capacity = claim.capacity();
        let (mut header, body, reserved) = claim.into_parts();

        let mut state = self.shared.state.lock();
        state.reserved = state.reserved.saturating_sub(reserved);
        if body.len() > capacity {
            return Err(StreamError::MessageTooLarge {
                size: body.len(),
                max_size: capacity,
            });
        }
        if state.closed {
            return Err(StreamError::Closed);
        }

        header.position = state.end() + FRAME_HEADER_LEN as u64;
        encode_frame_header(&mut state.recording, &header, body.len());
        state.recording.extend_from_slice(&body);
        state.fragments.push(Fragment { header, body });
        Ok(header.position)
    }
}

impl MessageLog for RecordedStream {
    fn read(
        &self,
        recording_id: RecordingId,
        position: u64,
        length: u32,
    ) -> Result<Bytes, StoreError> {
        if recording_id != self.shared.recording_id {
            return Err(StoreError::RecordingNotFound { recording_id });
        }

        let state = self.shared.state.lock();
        let start = usize::try_from(position).ok();
        let end = start.and_then(|start| start.checked_add(length as usize));
        match (start, end) {
            (Some(start), Some(end)) if end <= state.recording.len() => {
                Ok(Bytes::copy_from_slice(&state.recording[start..end]))
            }
            _ => Err(StoreError::RangeNotAvailable {
                recording_id,
                position,
                length,
            }),
        }
    }
}

/// Subscriber handle of a [`RecordedStream`].
///
/// Deregisters itself on drop so it no longer holds back publishers.
pub struct StreamSubscription {
    shared: Arc<Shared>,
    id: u64,
    next_index: usize,
    committed_index: usize,
    committed_position: u64,
}

impl std::fmt::Debug for StreamSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSubscription")
            .field("stream_id", &self.shared.stream_id)
            .field("next_index", &self.next_index)
            .field("committed_position", &self.committed_position)
            .finish()
    }
}

impl Subscription for StreamSubscription {
    fn stream_id(&self) -> StreamId {
        self.shared.stream_id
    }

    fn poll(&mut self, limit: usize) -> Vec<Fragment> {
        let state = self.shared.state.lock();
        let start = self.next_index.min(state.fragments.len());
        let end = start.saturating_add(limit).min(state.fragments.len());
        self.next_index = end;
        state.fragments[start..end].to_vec()
    }

    fn commit(&mut self) {
        if self.next_index == self.committed_index {
            return;
        }
        let mut state = self.shared.state.lock();
        if let Some(last) = state.fragments.get(self.next_index - 1) {
            self.committed_position = last.header.position + last.len() as u64;
        }
        self.committed_index = self.next_index;
        state.subscribers.insert(self.id, self.committed_position);
    }

    fn rewind(&mut self) {
        self.next_index = self.committed_index;
    }

    fn committed_position(&self) -> u64 {
        self.committed_position
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.shared.state.lock().subscribers.remove(&self.id);
    }
}
