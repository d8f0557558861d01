/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # IronLink Store
//!
//! Durable indices and replay reads for the IronLink session recovery engine.
//!
//! This crate provides:
//! - **MessageLog / Index traits**: Boundaries to the recorded streams and to
//!   the indexer agents
//! - **SequenceNumberIndex**: Last sent and received sequence numbers per
//!   session, persisted per direction
//! - **ReplayIndex**: `(session, seq_no)` to recorded position, with sequence
//!   reset generations
//! - **ReplayQuery**: Lazy range reads used to serve retransmissions
//! - **MemoryLog**: In-memory message log for tests and simple setups

pub mod memory;
mod record;
pub mod replay_index;
pub mod replay_query;
pub mod sequence_index;
pub mod traits;

pub use memory::MemoryLog;
pub use replay_index::{IndexOutcome, ReplayIndex, ReplayIndexEntry, ReplayIndexWriter};
pub use replay_query::{ReplayCursor, ReplayQuery, ReplayedMessage};
pub use sequence_index::{
    DEFAULT_COMPACT_THRESHOLD, SequenceNumberIndex, SequenceNumberIndexWriter,
    SequenceNumberRecord, SourcePosition, UpdateOutcome,
};
pub use traits::{Index, MessageLog, SyncStatus};
