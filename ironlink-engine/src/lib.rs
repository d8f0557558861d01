/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # IronLink Engine
//!
//! Indexing and replay agents for the IronLink session recovery engine.
//!
//! This crate provides:
//! - **Indexer**: Durably indexes each direction's stream
//! - **Replayer**: Serves resend requests from the outbound archive
//! - **Gap filler**: Answers resend requests when nothing is archived
//! - **Agent runner**: Duty-cycle agents on tokio tasks
//! - **Builder API**: Fluent configuration for engine setup

pub mod agent;
pub mod builder;
pub mod completion;
pub mod config;
pub mod encoder;
pub mod engine;
pub mod error_handler;
pub mod gap_filler;
pub mod indexer;
pub mod replayer;

pub use agent::{Agent, AgentHandle, AgentRunner, CompositeAgent, IdleStrategy};
pub use builder::EngineBuilder;
pub use completion::CompletionPosition;
pub use config::{EngineConfig, IndexGapPolicy};
pub use encoder::{ReplayEncoder, SbeReplayEncoder};
pub use engine::{Engine, EngineStreams};
pub use error_handler::{ErrorHandler, LoggingErrorHandler};
pub use gap_filler::GapFiller;
pub use indexer::Indexer;
pub use replayer::{ReplayOutcome, Replayer};
