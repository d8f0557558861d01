/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Outbound session-level messages.
//!
//! A [`SessionProxy`] encodes and sends the handshake, keepalive and
//! termination messages of a session. Encoding lives outside this crate;
//! the session only decides what to send and when.

use ironlink_core::error::SessionError;
use ironlink_core::types::{SeqNum, SessionIdentity};

/// Sends session-level protocol messages to the counterparty.
///
/// Every method may return `SessionError::BackPressured`, in which case the
/// session retries the same message on its next poll.
pub trait SessionProxy: Send {
    /// Sends Negotiate.
    fn send_negotiate(&mut self, session: SessionIdentity) -> Result<(), SessionError>;

    /// Answers a counterparty Negotiate.
    fn send_negotiation_response(&mut self, session: SessionIdentity) -> Result<(), SessionError>;

    /// Sends Establish with our next sequence number.
    fn send_establish(
        &mut self,
        session: SessionIdentity,
        next_seq_no: SeqNum,
        keepalive_interval_ms: u64,
    ) -> Result<(), SessionError>;

    /// Answers a counterparty Establish.
    fn send_establishment_ack(
        &mut self,
        session: SessionIdentity,
        next_seq_no: SeqNum,
        previous_seq_no: SeqNum,
        keepalive_interval_ms: u64,
    ) -> Result<(), SessionError>;

    /// Sends Sequence, optionally flagging that the counterparty went quiet.
    fn send_sequence(
        &mut self,
        session: SessionIdentity,
        next_seq_no: SeqNum,
        keepalive_lapsed: bool,
    ) -> Result<(), SessionError>;

    /// Asks the counterparty to resend `[begin_seq_no, end_seq_no]`.
    fn send_retransmit_request(
        &mut self,
        session: SessionIdentity,
        begin_seq_no: SeqNum,
        end_seq_no: SeqNum,
    ) -> Result<(), SessionError>;

    /// Sends Terminate.
    fn send_terminate(
        &mut self,
        session: SessionIdentity,
        reason: &str,
        error_codes: u32,
    ) -> Result<(), SessionError>;
}
