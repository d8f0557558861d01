/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Transport boundary traits.
//!
//! Streams are ordered and at-least-once. Every fragment is addressed by its
//! stream id and the byte position of its body within the stream, and a
//! subscriber may be handed the same position again after a rewind.

use bytes::{BufMut, Bytes, BytesMut};
use ironlink_core::error::StreamError;
use ironlink_core::message::{Fragment, FragmentHeader};
use ironlink_core::types::StreamId;
use std::sync::Arc;

/// Receives reserved publication space back when a claim is abandoned.
pub trait ReservationSink: Send + Sync {
    /// Returns `length` reserved bytes to the publication window.
    fn release(&self, length: usize);
}

/// Space reserved in a publication for one outbound fragment.
///
/// The body is written through [`put_slice`](Self::put_slice) or
/// [`buffer_mut`](Self::buffer_mut) and published with
/// [`Publication::commit`]. Dropping the claim without committing it gives
/// the reserved space back.
#[must_use = "an uncommitted claim releases its reservation when dropped"]
pub struct BufferClaim {
    header: FragmentHeader,
    body: BytesMut,
    capacity: usize,
    reserved: usize,
    sink: Option<Arc<dyn ReservationSink>>,
}

impl BufferClaim {
    /// Creates a claim holding `reserved` bytes of window space.
    ///
    /// # Arguments
    /// * `header` - Header the fragment will be published with
    /// * `capacity` - Maximum body length
    /// * `reserved` - Window bytes held by this claim, framing included
    /// * `sink` - Where the reservation is returned on drop
    pub fn new(
        header: FragmentHeader,
        capacity: usize,
        reserved: usize,
        sink: Arc<dyn ReservationSink>,
    ) -> Self {
        Self {
            header,
            body: BytesMut::with_capacity(capacity),
            capacity,
            reserved,
            sink: Some(sink),
        }
    }

    /// Returns the header of the claimed fragment.
    #[must_use]
    pub const fn header(&self) -> &FragmentHeader {
        &self.header
    }

    /// Returns a mutable reference to the header.
    pub fn header_mut(&mut self) -> &mut FragmentHeader {
        &mut self.header
    }

    /// Returns the maximum body length of this claim.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of body bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Returns true if no body bytes were written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Appends bytes to the body.
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.body.put_slice(bytes);
    }

    /// Returns the body buffer for in-place encoding.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    /// Splits the claim into header, body and reserved length.
    ///
    /// The reservation is not released; the publication takes ownership of
    /// it when it appends the body.
    pub fn into_parts(mut self) -> (FragmentHeader, Bytes, usize) {
        self.sink = None;
        let body = std::mem::take(&mut self.body).freeze();
        (self.header, body, self.reserved)
    }
}

impl Drop for BufferClaim {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.release(self.reserved);
        }
    }
}

impl std::fmt::Debug for BufferClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferClaim")
            .field("header", &self.header)
            .field("len", &self.body.len())
            .field("capacity", &self.capacity)
            .field("reserved", &self.reserved)
            .finish()
    }
}

/// Publishing side of a stream.
pub trait Publication: Send + Sync {
    /// Returns the stream this publication writes to.
    fn stream_id(&self) -> StreamId;

    /// Returns the position one past the last published byte.
    fn position(&self) -> u64;

    /// Reserves space for a fragment with a body of at most `length` bytes.
    ///
    /// # Errors
    /// Returns `StreamError::BackPressured` when the window is full,
    /// `StreamError::MessageTooLarge` for oversized bodies and
    /// `StreamError::Closed` once the stream is closed.
    fn try_claim(&self, header: FragmentHeader, length: usize)
    -> Result<BufferClaim, StreamError>;

    /// Publishes a claim and returns the position of its body.
    ///
    /// # Errors
    /// Returns `StreamError` if the body outgrew the claim or the stream was
    /// closed meanwhile.
    fn commit(&self, claim: BufferClaim) -> Result<u64, StreamError>;

    /// Abandons a claim and releases its reservation.
    fn abort(&self, claim: BufferClaim) {
        drop(claim);
    }

    /// Claims, fills and commits a fragment in one step.
    ///
    /// # Errors
    /// Returns the error of [`try_claim`](Self::try_claim) or
    /// [`commit`](Self::commit).
    fn offer(&self, header: FragmentHeader, body: &[u8]) -> Result<u64, StreamError> {
        let mut claim = self.try_claim(header, body.len())?;
        claim.put_slice(body);
        self.commit(claim)
    }
}

/// Consuming side of a stream.
///
/// Polling moves a read cursor; only [`commit`](Self::commit) moves the
/// committed position that holds back publishers.
pub trait Subscription: Send {
    /// Returns the stream this subscription reads from.
    fn stream_id(&self) -> StreamId;

    /// Returns up to `limit` fragments after the read cursor.
    fn poll(&mut self, limit: usize) -> Vec<Fragment>;

    /// Marks everything polled so far as consumed.
    fn commit(&mut self);

    /// Moves the read cursor back to the committed position.
    fn rewind(&mut self);

    /// Returns the position one past the last committed fragment.
    fn committed_position(&self) -> u64;
}
