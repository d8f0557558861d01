/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Session callbacks.
//!
//! A [`SessionHandler`] receives everything a session hands back to its
//! owner: delivered messages, replay requests to forward to the replayer,
//! state changes and terminal outcomes.

use crate::state::SessionState;
use ironlink_core::error::SessionError;
use ironlink_core::message::{DisconnectReason, ReplayRequest};
use ironlink_core::types::{SeqNum, SessionIdentity};

/// Callbacks invoked by a session on its owner's thread.
pub trait SessionHandler: Send {
    /// Called for every business message accepted in sequence.
    fn on_business_message(
        &mut self,
        session: SessionIdentity,
        seq_no: SeqNum,
        possible_retransmission: bool,
    ) {
        let _ = (session, seq_no, possible_retransmission);
    }

    /// Called when the counterparty asked for a retransmission.
    ///
    /// The owner forwards the request to the replayer and later reports the
    /// outcome through `Session::on_replay_complete` or
    /// `Session::on_replay_failed`.
    fn on_replay_request(&mut self, request: ReplayRequest);

    /// Called after every state transition.
    fn on_state_change(&mut self, session: SessionIdentity, from: SessionState, to: SessionState) {
        let _ = (session, from, to);
    }

    /// Called once when the session fails for good.
    fn on_terminal(&mut self, session: SessionIdentity, error: &SessionError);

    /// Called once when the session reaches `UNBOUND`.
    fn on_disconnect(&mut self, session: SessionIdentity, reason: DisconnectReason) {
        let _ = (session, reason);
    }
}
