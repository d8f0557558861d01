/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # IronLink Session
//!
//! iLink3-style session layer for the IronLink recovery engine.
//!
//! This crate provides:
//! - **State machine**: Handshake, retries, retransmission and termination
//! - **Sequence management**: Atomic sequence number handling
//! - **Keepalive handling**: Sequence keepalives and lapse detection
//! - **Parsing**: Mapping of decoded fields to protocol events
//! - **Configuration**: Session configuration options

pub mod config;
pub mod handler;
pub mod keepalive;
pub mod parser;
pub mod proxy;
pub mod sequence;
pub mod session;
pub mod state;

pub use config::{SessionConfig, SessionRole};
pub use handler::SessionHandler;
pub use keepalive::KeepaliveManager;
pub use parser::{DecodedFields, SessionParser};
pub use proxy::SessionProxy;
pub use sequence::{SequenceManager, SequenceResult};
pub use session::{
    Session, SessionClaim, TERMINATE_KEEPALIVE_TIMEOUT, TERMINATE_NORMAL,
    TERMINATE_PROTOCOL_VIOLATION, TERMINATE_RETRANSMIT_FAILURE,
};
pub use state::SessionState;
