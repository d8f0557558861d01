/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Message model shared by sessions, indices and agents.
//!
//! This module provides:
//! - [`TemplateId`]: Identifier of an encoded message template
//! - [`FragmentHeader`] and [`Fragment`]: Unit of traffic on a message stream
//! - [`ProtocolEvent`]: Closed set of decoded session protocol events
//! - [`ReplayRequest`]: Range of sent messages a counterparty asked for again
//! - [`ReasonText`], [`DisconnectReason`]: Termination details

use crate::types::{SeqNum, SessionIdentity, StreamId};
use arrayvec::ArrayString;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a terminate or reject reason, in bytes.
pub const REASON_MAX_LEN: usize = 48;

/// Fixed-capacity reason text carried by Terminate and reject messages.
pub type ReasonText = ArrayString<REASON_MAX_LEN>;

/// Builds a [`ReasonText`], truncating on a character boundary if needed.
#[must_use]
pub fn reason_text(text: &str) -> ReasonText {
    let mut out = ReasonText::new();
    for ch in text.chars() {
        if out.try_push(ch).is_err() {
            break;
        }
    }
    out
}

/// Identifier of a message template on the wire.
///
/// Session-level template ids follow the iLink3 numbering; everything else is
/// treated as a business message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct TemplateId(pub u16);

impl TemplateId {
    /// Negotiate request.
    pub const NEGOTIATE: Self = Self(500);
    /// Negotiation response.
    pub const NEGOTIATION_RESPONSE: Self = Self(501);
    /// Negotiation reject.
    pub const NEGOTIATION_REJECT: Self = Self(502);
    /// Establish request.
    pub const ESTABLISH: Self = Self(503);
    /// Establishment acknowledgement.
    pub const ESTABLISHMENT_ACK: Self = Self(504);
    /// Establishment reject.
    pub const ESTABLISHMENT_REJECT: Self = Self(505);
    /// Sequence (keepalive carrying the next sequence number).
    pub const SEQUENCE: Self = Self(506);
    /// Terminate.
    pub const TERMINATE: Self = Self(507);
    /// Retransmit request.
    pub const RETRANSMIT_REQUEST: Self = Self(508);
    /// Retransmission header preceding replayed messages.
    pub const RETRANSMISSION: Self = Self(509);
    /// Retransmit reject.
    pub const RETRANSMIT_REJECT: Self = Self(510);
    /// Business reject.
    pub const BUSINESS_REJECT: Self = Self(521);
    /// Not applied: the counterparty missed a range of our messages.
    pub const NOT_APPLIED: Self = Self(513);
    /// Synthetic gap fill produced during replay.
    pub const GAP_FILL: Self = Self(499);

    /// Returns the raw template id.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u16 {
        self.0
    }

    /// Returns true for session-level templates that do not carry a
    /// business sequence number.
    #[must_use]
    pub const fn is_session_level(self) -> bool {
        matches!(self.0, 499..=513)
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "template-{}", self.0)
    }
}

/// Flags carried alongside each fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FragmentFlags {
    /// The fragment is a retransmission of an earlier message.
    pub possible_retransmission: bool,
    /// The fragment starts a new sequence number series for its session.
    pub sequence_reset: bool,
}

impl FragmentFlags {
    /// Flags for a replayed message.
    pub const RETRANSMISSION: Self = Self {
        possible_retransmission: true,
        sequence_reset: false,
    };

    /// Flags for the first message after a sequence reset.
    pub const SEQUENCE_RESET: Self = Self {
        possible_retransmission: false,
        sequence_reset: true,
    };
}

/// Metadata of one message on a stream, as decoded by the framer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentHeader {
    /// Stream the fragment was published on.
    pub stream_id: StreamId,
    /// Byte position of the fragment within the stream's recording.
    ///
    /// Assigned by the publication; zero until published.
    pub position: u64,
    /// Session the message belongs to.
    pub session: SessionIdentity,
    /// Sequence number of the message within its session and direction.
    pub seq_no: SeqNum,
    /// Template of the encoded message.
    pub template_id: TemplateId,
    /// Retransmission and reset flags.
    pub flags: FragmentFlags,
}

impl FragmentHeader {
    /// Creates a header for a message that has not been published yet.
    #[must_use]
    pub const fn new(
        stream_id: StreamId,
        session: SessionIdentity,
        seq_no: SeqNum,
        template_id: TemplateId,
    ) -> Self {
        Self {
            stream_id,
            position: 0,
            session,
            seq_no,
            template_id,
            flags: FragmentFlags {
                possible_retransmission: false,
                sequence_reset: false,
            },
        }
    }

    /// Sets the fragment flags.
    #[must_use]
    pub const fn with_flags(mut self, flags: FragmentFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// One message on a stream: header plus encoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Fragment metadata.
    pub header: FragmentHeader,
    /// Encoded message bytes.
    pub body: Bytes,
}

impl Fragment {
    /// Creates a new fragment.
    #[must_use]
    pub fn new(header: FragmentHeader, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    /// Returns the length of the encoded body.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Returns true if the body is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Decoded session protocol event delivered by the external parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// The counterparty asks to negotiate (acceptor side).
    Negotiate {
        /// Session uuid proposed by the counterparty.
        uuid: u64,
    },
    /// Our negotiate was accepted (initiator side).
    NegotiationResponse {
        /// Session uuid echoed by the counterparty.
        uuid: u64,
    },
    /// Our negotiate was rejected.
    NegotiationReject {
        /// Rejection reason.
        reason: ReasonText,
        /// Counterparty error codes.
        error_codes: u32,
    },
    /// The counterparty asks to establish (acceptor side).
    Establish {
        /// Next sequence number the counterparty will send.
        next_seq_no: SeqNum,
        /// Keepalive interval requested by the counterparty, in milliseconds.
        keepalive_interval_ms: u64,
    },
    /// Our establish was accepted (initiator side).
    EstablishmentAck {
        /// Next sequence number the counterparty will send.
        next_seq_no: SeqNum,
        /// Last of our sequence numbers the counterparty received.
        previous_seq_no: SeqNum,
        /// Keepalive interval granted by the counterparty, in milliseconds.
        keepalive_interval_ms: u64,
    },
    /// Our establish was rejected.
    EstablishmentReject {
        /// Rejection reason.
        reason: ReasonText,
        /// Counterparty error codes.
        error_codes: u32,
    },
    /// Keepalive carrying the counterparty's next sequence number.
    Sequence {
        /// Next sequence number the counterparty will send.
        next_seq_no: SeqNum,
        /// The counterparty noticed our keepalive lapsed.
        keepalive_lapsed: bool,
    },
    /// The counterparty asks us to resend `[begin_seq_no, end_seq_no]`.
    ///
    /// An `end_seq_no` of zero means "up to the latest sent message".
    ResendRequest {
        /// First sequence number to resend.
        begin_seq_no: SeqNum,
        /// Last sequence number to resend, or zero for infinity.
        end_seq_no: SeqNum,
    },
    /// The counterparty terminates the session, or acknowledges our terminate.
    Terminate {
        /// Termination reason.
        reason: ReasonText,
        /// Counterparty error codes.
        error_codes: u32,
    },
    /// Any business message.
    BusinessMessage {
        /// Sequence number of the message.
        seq_no: SeqNum,
        /// The message is a retransmission.
        possible_retransmission: bool,
    },
    /// A reject of one of our messages.
    Reject {
        /// Sequence number of the reject itself.
        seq_no: SeqNum,
        /// Sequence number of the rejected message.
        ref_seq_no: SeqNum,
    },
    /// A template the parser does not understand.
    Unrecognized {
        /// Template id of the message.
        template_id: TemplateId,
    },
}

impl ProtocolEvent {
    /// Returns a short name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Negotiate { .. } => "Negotiate",
            Self::NegotiationResponse { .. } => "NegotiationResponse",
            Self::NegotiationReject { .. } => "NegotiationReject",
            Self::Establish { .. } => "Establish",
            Self::EstablishmentAck { .. } => "EstablishmentAck",
            Self::EstablishmentReject { .. } => "EstablishmentReject",
            Self::Sequence { .. } => "Sequence",
            Self::ResendRequest { .. } => "ResendRequest",
            Self::Terminate { .. } => "Terminate",
            Self::BusinessMessage { .. } => "BusinessMessage",
            Self::Reject { .. } => "Reject",
            Self::Unrecognized { .. } => "Unrecognized",
        }
    }
}

/// Request to retransmit a range of our sent messages to a counterparty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplayRequest {
    /// Session whose sent messages are replayed.
    pub session: SessionIdentity,
    /// First sequence number to replay.
    pub begin_seq_no: SeqNum,
    /// Last sequence number to replay, or zero for "up to the latest sent".
    pub end_seq_no: SeqNum,
}

impl ReplayRequest {
    /// Creates a replay request.
    #[must_use]
    pub const fn new(session: SessionIdentity, begin_seq_no: SeqNum, end_seq_no: SeqNum) -> Self {
        Self {
            session,
            begin_seq_no,
            end_seq_no,
        }
    }

    /// Returns true if the range extends to the latest sent message.
    #[must_use]
    pub const fn is_open_ended(&self) -> bool {
        self.end_seq_no.value() == 0
    }
}

/// Reason a connection was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The owning application asked for it.
    ApplicationDisconnect,
    /// The counterparty terminated the session.
    RemoteDisconnect,
    /// The session broke the protocol.
    ProtocolViolation,
    /// No traffic within the keepalive bounds.
    KeepaliveTimeout,
    /// Handshake retries were exhausted.
    HandshakeTimeout,
    /// A retransmission could not be served.
    RetransmitFailure,
    /// The engine is shutting down.
    EngineShutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ApplicationDisconnect => "application disconnect",
            Self::RemoteDisconnect => "remote disconnect",
            Self::ProtocolViolation => "protocol violation",
            Self::KeepaliveTimeout => "keepalive timeout",
            Self::HandshakeTimeout => "handshake timeout",
            Self::RetransmitFailure => "retransmit failure",
            Self::EngineShutdown => "engine shutdown",
        };
        f.write_str(s)
    }
}
