/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # IronLink Core
//!
//! Core types and error definitions for the IronLink session recovery and
//! replay subsystem.
//!
//! This crate provides the building blocks used across all IronLink crates:
//! - **Error types**: Unified error handling with `thiserror`
//! - **Identity types**: `SessionIdentity`, `ConnectionId`, `StreamId`, `RecordingId`
//! - **Sequence numbers**: `SeqNum` and `Direction`
//! - **Message model**: `Fragment`, `FragmentHeader` and the `ProtocolEvent` enum

pub mod error;
pub mod message;
pub mod types;

pub use error::{IronLinkError, ReplayError, Result, SessionError, StoreError, StreamError};
pub use message::{
    DisconnectReason, Fragment, FragmentFlags, FragmentHeader, ProtocolEvent, ReasonText,
    ReplayRequest, TemplateId, reason_text,
};
pub use types::{ConnectionId, Direction, RecordingId, SeqNum, SessionIdentity, StreamId};
