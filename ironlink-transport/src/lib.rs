/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # IronLink Transport
//!
//! Transport boundary for the IronLink session recovery engine.
//!
//! This crate provides:
//! - **Publication / Subscription traits**: Ordered, at-least-once streams
//!   keyed by stream id and byte position
//! - **BufferClaim**: Reserved publication space, released when dropped
//! - **RecordedStream**: In-memory stream with a bounded publication window
//!   that doubles as the recording replays read from

pub mod recorded;
pub mod traits;

pub use recorded::{FRAME_HEADER_LEN, RecordedStream, StreamSubscription};
pub use traits::{BufferClaim, Publication, ReservationSink, Subscription};
