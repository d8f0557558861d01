/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Mapping from decoded message fields to protocol events.
//!
//! Wire decoding happens upstream; the framer hands over the template id and
//! the session-relevant fields it found. [`SessionParser`] turns those into a
//! [`ProtocolEvent`] and routes it to a [`Session`].

use crate::handler::SessionHandler;
use crate::proxy::SessionProxy;
use crate::session::Session;
use ironlink_core::error::SessionError;
use ironlink_core::message::{ProtocolEvent, ReasonText, TemplateId};
use ironlink_core::types::SeqNum;
use std::time::Instant;

/// Session-relevant fields decoded from one inbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodedFields {
    /// Session uuid.
    pub uuid: Option<u64>,
    /// Sequence number of the message itself.
    pub seq_no: Option<SeqNum>,
    /// Next sequence number announced by the counterparty.
    pub next_seq_no: Option<SeqNum>,
    /// Last of our sequence numbers the counterparty received.
    pub previous_seq_no: Option<SeqNum>,
    /// First sequence number of a requested range.
    pub from_seq_no: Option<SeqNum>,
    /// Last sequence number of a requested range; zero or absent means open.
    pub end_seq_no: Option<SeqNum>,
    /// Sequence number a reject refers to.
    pub ref_seq_no: Option<SeqNum>,
    /// Keepalive interval in milliseconds.
    pub keepalive_interval_ms: Option<u64>,
    /// Keepalive lapsed indicator.
    pub keepalive_lapsed: bool,
    /// Possible retransmission indicator.
    pub possible_retransmission: bool,
    /// Reject or terminate reason.
    pub reason: ReasonText,
    /// Counterparty error codes.
    pub error_codes: u32,
}

impl DecodedFields {
    /// Creates an empty field set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the session uuid.
    #[must_use]
    pub const fn with_uuid(mut self, uuid: u64) -> Self {
        self.uuid = Some(uuid);
        self
    }

    /// Sets the message sequence number.
    #[must_use]
    pub const fn with_seq_no(mut self, seq_no: SeqNum) -> Self {
        self.seq_no = Some(seq_no);
        self
    }

    /// Sets the announced next sequence number.
    #[must_use]
    pub const fn with_next_seq_no(mut self, seq_no: SeqNum) -> Self {
        self.next_seq_no = Some(seq_no);
        self
    }

    /// Sets the previous sequence number.
    #[must_use]
    pub const fn with_previous_seq_no(mut self, seq_no: SeqNum) -> Self {
        self.previous_seq_no = Some(seq_no);
        self
    }

    /// Sets a requested range.
    #[must_use]
    pub const fn with_range(mut self, from: SeqNum, end: SeqNum) -> Self {
        self.from_seq_no = Some(from);
        self.end_seq_no = Some(end);
        self
    }

    /// Sets the referenced sequence number.
    #[must_use]
    pub const fn with_ref_seq_no(mut self, seq_no: SeqNum) -> Self {
        self.ref_seq_no = Some(seq_no);
        self
    }

    /// Sets the keepalive interval.
    #[must_use]
    pub const fn with_keepalive_interval_ms(mut self, interval_ms: u64) -> Self {
        self.keepalive_interval_ms = Some(interval_ms);
        self
    }

    /// Sets the keepalive lapsed indicator.
    #[must_use]
    pub const fn with_keepalive_lapsed(mut self, lapsed: bool) -> Self {
        self.keepalive_lapsed = lapsed;
        self
    }

    /// Sets the possible retransmission indicator.
    #[must_use]
    pub const fn with_possible_retransmission(mut self, flag: bool) -> Self {
        self.possible_retransmission = flag;
        self
    }

    /// Sets the reason and error codes.
    #[must_use]
    pub const fn with_reason(mut self, reason: ReasonText, error_codes: u32) -> Self {
        self.reason = reason;
        self.error_codes = error_codes;
        self
    }
}

fn required<T>(value: Option<T>, template_id: TemplateId, field: &str) -> Result<T, SessionError> {
    value.ok_or_else(|| SessionError::ProtocolViolation {
        reason: format!("{template_id} missing {field}"),
    })
}

/// Turns decoded fields into protocol events.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionParser;

impl SessionParser {
    /// Creates a parser.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Maps one decoded message to a protocol event.
    ///
    /// Non session-level templates are business messages. Session-level
    /// templates the state machine does not act on are reported as
    /// [`ProtocolEvent::Unrecognized`].
    ///
    /// # Errors
    /// Returns `SessionError::ProtocolViolation` if a field the template
    /// requires is missing.
    pub fn parse(
        &self,
        template_id: TemplateId,
        fields: &DecodedFields,
    ) -> Result<ProtocolEvent, SessionError> {
        let event = match template_id {
            TemplateId::NEGOTIATE => ProtocolEvent::Negotiate {
                uuid: required(fields.uuid, template_id, "uuid")?,
            },
            TemplateId::NEGOTIATION_RESPONSE => ProtocolEvent::NegotiationResponse {
                uuid: required(fields.uuid, template_id, "uuid")?,
            },
            TemplateId::NEGOTIATION_REJECT => ProtocolEvent::NegotiationReject {
                reason: fields.reason,
                error_codes: fields.error_codes,
            },
            TemplateId::ESTABLISH => ProtocolEvent::Establish {
                next_seq_no: required(fields.next_seq_no, template_id, "next_seq_no")?,
                keepalive_interval_ms: required(
                    fields.keepalive_interval_ms,
                    template_id,
                    "keepalive_interval_ms",
                )?,
            },
            TemplateId::ESTABLISHMENT_ACK => ProtocolEvent::EstablishmentAck {
                next_seq_no: required(fields.next_seq_no, template_id, "next_seq_no")?,
                previous_seq_no: required(fields.previous_seq_no, template_id, "previous_seq_no")?,
                keepalive_interval_ms: fields.keepalive_interval_ms.unwrap_or(0),
            },
            TemplateId::ESTABLISHMENT_REJECT => ProtocolEvent::EstablishmentReject {
                reason: fields.reason,
                error_codes: fields.error_codes,
            },
            TemplateId::SEQUENCE => ProtocolEvent::Sequence {
                next_seq_no: required(fields.next_seq_no, template_id, "next_seq_no")?,
                keepalive_lapsed: fields.keepalive_lapsed,
            },
            TemplateId::RETRANSMIT_REQUEST | TemplateId::NOT_APPLIED => {
                ProtocolEvent::ResendRequest {
                    begin_seq_no: required(fields.from_seq_no, template_id, "from_seq_no")?,
                    end_seq_no: fields.end_seq_no.unwrap_or(SeqNum::new(0)),
                }
            }
            TemplateId::TERMINATE => ProtocolEvent::Terminate {
                reason: fields.reason,
                error_codes: fields.error_codes,
            },
            TemplateId::BUSINESS_REJECT => ProtocolEvent::Reject {
                seq_no: required(fields.seq_no, template_id, "seq_no")?,
                ref_seq_no: required(fields.ref_seq_no, template_id, "ref_seq_no")?,
            },
            other if other.is_session_level() => ProtocolEvent::Unrecognized { template_id },
            _ => ProtocolEvent::BusinessMessage {
                seq_no: required(fields.seq_no, template_id, "seq_no")?,
                possible_retransmission: fields.possible_retransmission,
            },
        };
        Ok(event)
    }

    /// Parses one message and hands the event to `session`.
    ///
    /// A message that cannot be parsed is a protocol violation and ends the
    /// session.
    ///
    /// # Errors
    /// Returns the parse error or the error of [`Session::on_event`].
    pub fn on_message<P: SessionProxy, H: SessionHandler>(
        &self,
        session: &mut Session<P, H>,
        template_id: TemplateId,
        fields: &DecodedFields,
        now: Instant,
    ) -> Result<(), SessionError> {
        match self.parse(template_id, fields) {
            Ok(event) => session.on_event(event, now),
            Err(err) => {
                session.on_protocol_violation(&err.to_string());
                Err(err)
            }
        }
    }
}
