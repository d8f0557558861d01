/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Session states and their legal transitions.
//!
//! States are driven by runtime protocol events, so they are a plain enum
//! and every transition is checked against [`SessionState::can_transition_to`].

use std::fmt;

/// State of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// TCP connection established, negotiate not sent.
    Connected,
    /// Negotiate sent, no reply yet.
    SentNegotiate,
    /// Negotiate timed out, a new attempt is due.
    RetryNegotiate,
    /// Negotiate rejected or retries exhausted.
    NegotiateRejected,
    /// Negotiate accepted, establish not sent.
    Negotiated,
    /// Establish sent, no reply yet.
    SentEstablish,
    /// Establish timed out, a new attempt is due.
    RetryEstablish,
    /// Establish rejected or retries exhausted.
    EstablishRejected,
    /// Messages can be exchanged.
    Established,
    /// A replay of our messages is in progress.
    Retransmitting,
    /// Our keepalive lapsed; waiting for any inbound traffic.
    AwaitingKeepalive,
    /// A replay failed and Terminate was sent.
    ResendTerminate,
    /// The counterparty acknowledged the replay-failure Terminate.
    ResendTerminateAck,
    /// Terminate is pending.
    Unbinding,
    /// Terminate sent, waiting for the acknowledgement.
    SentTerminate,
    /// Session is over.
    Unbound,
}

impl SessionState {
    /// Returns true for states no transition leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Unbound | Self::NegotiateRejected | Self::EstablishRejected
        )
    }

    /// Returns true while application messages may be sent.
    #[must_use]
    pub const fn is_established(self) -> bool {
        matches!(
            self,
            Self::Established | Self::Retransmitting | Self::AwaitingKeepalive
        )
    }

    /// Returns true once the session is shutting down or over.
    #[must_use]
    pub const fn is_terminating(self) -> bool {
        matches!(
            self,
            Self::Unbinding
                | Self::SentTerminate
                | Self::ResendTerminate
                | Self::ResendTerminateAck
        ) || self.is_terminal()
    }

    /// Returns true if moving from `self` to `next` is legal.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        // Transport loss may end any live session.
        if matches!(next, Unbound) {
            return true;
        }
        match self {
            Connected => matches!(next, SentNegotiate | Negotiated | Unbinding),
            SentNegotiate => matches!(
                next,
                Negotiated | NegotiateRejected | RetryNegotiate | Unbinding
            ),
            RetryNegotiate => matches!(next, SentNegotiate | NegotiateRejected | Unbinding),
            Negotiated => matches!(next, SentEstablish | Established | Unbinding),
            SentEstablish => matches!(
                next,
                Established | EstablishRejected | RetryEstablish | Unbinding
            ),
            RetryEstablish => matches!(next, SentEstablish | EstablishRejected | Unbinding),
            Established => matches!(
                next,
                Retransmitting | AwaitingKeepalive | ResendTerminate | Unbinding
            ),
            Retransmitting => matches!(next, Established | ResendTerminate | Unbinding),
            AwaitingKeepalive => matches!(next, Established | Unbinding),
            ResendTerminate => matches!(next, ResendTerminateAck),
            Unbinding => matches!(next, SentTerminate),
            ResendTerminateAck | SentTerminate => false,
            Unbound | NegotiateRejected | EstablishRejected => false,
        }
    }

    /// Returns the state name used in logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "CONNECTED",
            Self::SentNegotiate => "SENT_NEGOTIATE",
            Self::RetryNegotiate => "RETRY_NEGOTIATE",
            Self::NegotiateRejected => "NEGOTIATE_REJECTED",
            Self::Negotiated => "NEGOTIATED",
            Self::SentEstablish => "SENT_ESTABLISH",
            Self::RetryEstablish => "RETRY_ESTABLISH",
            Self::EstablishRejected => "ESTABLISH_REJECTED",
            Self::Established => "ESTABLISHED",
            Self::Retransmitting => "RETRANSMITTING",
            Self::AwaitingKeepalive => "AWAITING_KEEPALIVE",
            Self::ResendTerminate => "RESEND_TERMINATE",
            Self::ResendTerminateAck => "RESEND_TERMINATE_ACK",
            Self::Unbinding => "UNBINDING",
            Self::SentTerminate => "SENT_TERMINATE",
            Self::Unbound => "UNBOUND",
        }
    }

    /// Every state, in declaration order.
    pub const ALL: [Self; 16] = [
        Self::Connected,
        Self::SentNegotiate,
        Self::RetryNegotiate,
        Self::NegotiateRejected,
        Self::Negotiated,
        Self::SentEstablish,
        Self::RetryEstablish,
        Self::EstablishRejected,
        Self::Established,
        Self::Retransmitting,
        Self::AwaitingKeepalive,
        Self::ResendTerminate,
        Self::ResendTerminateAck,
        Self::Unbinding,
        Self::SentTerminate,
        Self::Unbound,
    ];
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
