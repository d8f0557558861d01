/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Session state machine.
//!
//! A [`Session`] owns the protocol state of one connection of a logical
//! session: handshake and retry policy, sequence numbering in both
//! directions, keepalive, retransmission bookkeeping and termination.
//!
//! The session never blocks and never spawns. The owning event loop feeds it
//! decoded events through [`Session::on_event`], drives its timers through
//! [`Session::poll`] and forwards replay outcomes from the replayer.
//! Session-level messages leave through a [`SessionProxy`]; application
//! messages are claimed and committed on the outbound [`Publication`].

use crate::config::{SessionConfig, SessionRole};
use crate::handler::SessionHandler;
use crate::keepalive::KeepaliveManager;
use crate::proxy::SessionProxy;
use crate::sequence::{SequenceManager, SequenceResult};
use crate::state::SessionState;
use bytes::{BufMut, BytesMut};
use ironlink_core::error::{SessionError, StreamError};
use ironlink_core::message::{
    DisconnectReason, Fragment, FragmentFlags, FragmentHeader, ProtocolEvent, ReasonText,
    ReplayRequest, TemplateId, reason_text,
};
use ironlink_core::types::{ConnectionId, SeqNum, SessionIdentity, StreamId};
use ironlink_store::sequence_index::SequenceNumberRecord;
use ironlink_transport::traits::{BufferClaim, Publication};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Terminate error code for an orderly shutdown.
pub const TERMINATE_NORMAL: u32 = 0;
/// Terminate error code for a protocol violation.
pub const TERMINATE_PROTOCOL_VIOLATION: u32 = 1;
/// Terminate error code for a keepalive timeout.
pub const TERMINATE_KEEPALIVE_TIMEOUT: u32 = 2;
/// Terminate error code for a replay that could not be served.
pub const TERMINATE_RETRANSMIT_FAILURE: u32 = 3;

/// Session-level message waiting to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlMessage {
    Negotiate,
    NegotiationResponse,
    Establish,
    EstablishmentAck,
    Sequence { keepalive_lapsed: bool },
    RetransmitRequest { begin: SeqNum, end: SeqNum },
    Terminate { reason: ReasonText, error_codes: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeStage {
    Negotiate,
    Establish,
}

impl HandshakeStage {
    const fn name(self) -> &'static str {
        match self {
            Self::Negotiate => "negotiate",
            Self::Establish => "establish",
        }
    }
}

/// Clears the outstanding-claim flag when the claim goes away.
#[derive(Debug)]
struct ClaimGuard(Arc<AtomicBool>);

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
enum ClaimBuffer {
    Direct(BufferClaim),
    Held {
        header: FragmentHeader,
        body: BytesMut,
        capacity: usize,
    },
}

/// Space claimed for one outbound application message.
///
/// Stamped with the sequence number it will be sent with. Commit it with
/// [`Session::commit`]; dropping it instead releases the space and leaves
/// the sequence number unused.
#[derive(Debug)]
#[must_use = "a claim must be committed or it is released on drop"]
pub struct SessionClaim {
    seq_no: SeqNum,
    buffer: ClaimBuffer,
    _guard: ClaimGuard,
}

impl SessionClaim {
    /// Returns the sequence number this message will carry.
    #[must_use]
    pub const fn seq_no(&self) -> SeqNum {
        self.seq_no
    }

    /// Returns the template of the claimed message.
    #[must_use]
    pub fn template_id(&self) -> TemplateId {
        match &self.buffer {
            ClaimBuffer::Direct(claim) => claim.header().template_id,
            ClaimBuffer::Held { header, .. } => header.template_id,
        }
    }

    /// Returns true if the message will be held back until a replay ends.
    #[must_use]
    pub const fn is_held(&self) -> bool {
        matches!(self.buffer, ClaimBuffer::Held { .. })
    }

    /// Appends encoded bytes to the message body.
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buffer_mut().put_slice(bytes);
    }

    /// Returns the body buffer for in-place encoding.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        match &mut self.buffer {
            ClaimBuffer::Direct(claim) => claim.buffer_mut(),
            ClaimBuffer::Held { body, .. } => body,
        }
    }
}

/// One live connection of a logical session.
pub struct Session<P, H> {
    config: SessionConfig,
    connection_id: ConnectionId,
    state: SessionState,
    sequence: SequenceManager,
    retransmit_fill_seq_no: Option<SeqNum>,
    keepalive: KeepaliveManager,
    clock: Instant,
    handshake_attempts: u32,
    handshake_deadline: Option<Instant>,
    terminate_deadline: Option<Instant>,
    claim_outstanding: Arc<AtomicBool>,
    pending_sent_reset: bool,
    hold_queue: VecDeque<Fragment>,
    deferred: VecDeque<ControlMessage>,
    current_replay: Option<ReplayRequest>,
    pending_replays: VecDeque<ReplayRequest>,
    disconnect_reason: Option<DisconnectReason>,
    terminal_error: Option<SessionError>,
    publication: Arc<dyn Publication>,
    proxy: P,
    handler: H,
}

impl<P, H> std::fmt::Debug for Session<P, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.config.identity)
            .field("connection_id", &self.connection_id)
            .field("state", &self.state)
            .field("next_sent_seq_no", &self.sequence.next_sent_seq_no())
            .field("next_recv_seq_no", &self.sequence.next_recv_seq_no())
            .field("retransmit_fill_seq_no", &self.retransmit_fill_seq_no)
            .finish_non_exhaustive()
    }
}

impl<P: SessionProxy, H: SessionHandler> Session<P, H> {
    /// Creates a session for a freshly connected transport.
    ///
    /// # Arguments
    /// * `config` - Session configuration
    /// * `connection_id` - Id of the underlying connection
    /// * `publication` - Outbound stream application messages are committed to
    /// * `proxy` - Sender of session-level messages
    /// * `handler` - Owner callbacks
    /// * `now` - Current time
    ///
    /// # Errors
    /// Returns `SessionError::Configuration` if the configuration is invalid.
    pub fn new(
        config: SessionConfig,
        connection_id: ConnectionId,
        publication: Arc<dyn Publication>,
        proxy: P,
        handler: H,
        now: Instant,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let keepalive = KeepaliveManager::new(config.keepalive_interval, now);
        Ok(Self {
            config,
            connection_id,
            state: SessionState::Connected,
            sequence: SequenceManager::new(),
            retransmit_fill_seq_no: None,
            keepalive,
            clock: now,
            handshake_attempts: 0,
            handshake_deadline: None,
            terminate_deadline: None,
            claim_outstanding: Arc::new(AtomicBool::new(false)),
            pending_sent_reset: false,
            hold_queue: VecDeque::new(),
            deferred: VecDeque::new(),
            current_replay: None,
            pending_replays: VecDeque::new(),
            disconnect_reason: None,
            terminal_error: None,
            publication,
            proxy,
            handler,
        })
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// Returns the logical session identity.
    #[must_use]
    pub const fn identity(&self) -> SessionIdentity {
        self.config.identity
    }

    /// Returns the id of the current connection.
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Returns the handshake role.
    #[must_use]
    pub const fn role(&self) -> SessionRole {
        self.config.role
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the sequence number the next claimed message will carry.
    #[must_use]
    pub fn next_sent_seq_no(&self) -> SeqNum {
        self.sequence.next_sent_seq_no()
    }

    /// Returns the next sequence number expected from the counterparty.
    #[must_use]
    pub fn next_recv_seq_no(&self) -> SeqNum {
        self.sequence.next_recv_seq_no()
    }

    /// Returns the highest sequence number whose retransmission we are
    /// still waiting for, or `None` if no retransmission is awaited.
    #[must_use]
    pub const fn retransmit_fill_seq_no(&self) -> Option<SeqNum> {
        self.retransmit_fill_seq_no
    }

    /// Returns the number of committed messages held back by a replay.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.hold_queue.len()
    }

    /// Returns the replay currently being served, if any.
    #[must_use]
    pub const fn current_replay(&self) -> Option<ReplayRequest> {
        self.current_replay
    }

    /// Returns the error that ended the session, if any.
    #[must_use]
    pub const fn terminal_error(&self) -> Option<&SessionError> {
        self.terminal_error.as_ref()
    }

    /// Returns the session proxy.
    #[must_use]
    pub const fn proxy(&self) -> &P {
        &self.proxy
    }

    /// Returns the session proxy mutably.
    pub fn proxy_mut(&mut self) -> &mut P {
        &mut self.proxy
    }

    /// Returns the session handler.
    #[must_use]
    pub const fn handler(&self) -> &H {
        &self.handler
    }

    /// Returns the session handler mutably.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    // ---------------------------------------------------------------------
    // Sequence number seeding
    // ---------------------------------------------------------------------

    /// Sets the next sent sequence number.
    ///
    /// Lowering the value resets the sent series; the next committed message
    /// carries the sequence reset flag.
    ///
    /// # Errors
    /// Returns `SessionError::ProtocolViolation` while established; the
    /// session then starts unbinding.
    pub fn set_next_sent_seq_no(&mut self, seq_no: SeqNum) -> Result<(), SessionError> {
        self.ensure_not_established("next_sent_seq_no")?;
        if self.sequence.set_next_sent_seq_no(seq_no) {
            self.pending_sent_reset = true;
        }
        Ok(())
    }

    /// Sets the next expected received sequence number.
    ///
    /// # Errors
    /// Returns `SessionError::ProtocolViolation` while established; the
    /// session then starts unbinding.
    pub fn set_next_recv_seq_no(&mut self, seq_no: SeqNum) -> Result<(), SessionError> {
        self.ensure_not_established("next_recv_seq_no")?;
        self.sequence.set_next_recv_seq_no(seq_no);
        Ok(())
    }

    /// Continues the sequence series of a persisted session.
    ///
    /// # Errors
    /// Returns `SessionError::Configuration` if the record belongs to
    /// another session, or `SessionError::ProtocolViolation` while
    /// established.
    pub fn resume(&mut self, record: &SequenceNumberRecord) -> Result<(), SessionError> {
        if record.session != self.identity() {
            return Err(SessionError::Configuration(format!(
                "sequence record of {} cannot resume {}",
                record.session,
                self.identity()
            )));
        }
        self.set_next_sent_seq_no(record.next_sent_seq_no())?;
        self.set_next_recv_seq_no(record.next_received_seq_no())?;
        info!(
            session = %self.identity(),
            next_sent = %self.sequence.next_sent_seq_no(),
            next_recv = %self.sequence.next_recv_seq_no(),
            "session resumed from sequence index"
        );
        Ok(())
    }

    fn ensure_not_established(&mut self, field: &str) -> Result<(), SessionError> {
        if self.state.is_established() {
            let reason = format!("cannot set {field} while {}", self.state);
            self.on_protocol_violation(&reason);
            return Err(SessionError::ProtocolViolation { reason });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Outbound application messages
    // ---------------------------------------------------------------------

    /// Claims space for one outbound application message.
    ///
    /// # Errors
    /// Returns `SessionError::NotConnected` unless established,
    /// `SessionError::ClaimOutstanding` if a previous claim is still alive
    /// and `SessionError::BackPressured` when the transport or the hold
    /// queue is full.
    pub fn claim_message(
        &mut self,
        template_id: TemplateId,
        length: usize,
    ) -> Result<SessionClaim, SessionError> {
        if !self.state.is_established() {
            return Err(SessionError::NotConnected {
                state: self.state.to_string(),
            });
        }
        if self.claim_outstanding.load(Ordering::Acquire) {
            return Err(SessionError::ClaimOutstanding);
        }

        let seq_no = self.sequence.next_sent_seq_no();
        let mut header =
            FragmentHeader::new(StreamId::OUTBOUND, self.identity(), seq_no, template_id);
        if self.pending_sent_reset {
            header = header.with_flags(FragmentFlags::SEQUENCE_RESET);
        }

        let buffer = if self.is_holding() {
            if self.hold_queue.len() >= self.config.hold_queue_capacity {
                return Err(SessionError::BackPressured);
            }
            ClaimBuffer::Held {
                header,
                body: BytesMut::with_capacity(length),
                capacity: length,
            }
        } else {
            ClaimBuffer::Direct(self.publication.try_claim(header, length)?)
        };

        self.claim_outstanding.store(true, Ordering::Release);
        Ok(SessionClaim {
            seq_no,
            buffer,
            _guard: ClaimGuard(Arc::clone(&self.claim_outstanding)),
        })
    }

    /// Publishes a claimed message and advances the next sent sequence number.
    ///
    /// While a replay is running the message is held back and published, in
    /// order, once the replay completes. This includes a claim taken before
    /// the replay started.
    ///
    /// # Errors
    /// Returns `SessionError::NotConnected` if the session stopped being
    /// established since the claim was made, or the transport error.
    pub fn commit(&mut self, claim: SessionClaim) -> Result<SeqNum, SessionError> {
        if !self.state.is_established() {
            return Err(SessionError::NotConnected {
                state: self.state.to_string(),
            });
        }

        let SessionClaim { seq_no, buffer, .. } = claim;
        match buffer {
            ClaimBuffer::Direct(claim) if self.is_holding() => {
                self.hold_claim(seq_no, claim)?;
            }
            ClaimBuffer::Direct(claim) => {
                self.publication.commit(claim)?;
            }
            ClaimBuffer::Held {
                header,
                body,
                capacity,
            } => {
                if body.len() > capacity {
                    return Err(StreamError::MessageTooLarge {
                        size: body.len(),
                        max_size: capacity,
                    }
                    .into());
                }
                self.hold_queue.push_back(Fragment::new(header, body.freeze()));
                debug!(
                    session = %self.identity(),
                    seq_no = %seq_no,
                    held = self.hold_queue.len(),
                    "message held until replay completes"
                );
            }
        }

        self.sequence.allocate_sent_seq_no();
        self.pending_sent_reset = false;
        self.keepalive.on_message_sent(self.clock);
        Ok(seq_no)
    }

    /// Moves a transport claim into the hold queue and releases its
    /// reservation.
    fn hold_claim(&mut self, seq_no: SeqNum, mut claim: BufferClaim) -> Result<(), SessionError> {
        if claim.len() > claim.capacity() {
            return Err(StreamError::MessageTooLarge {
                size: claim.len(),
                max_size: claim.capacity(),
            }
            .into());
        }
        if self.hold_queue.len() >= self.config.hold_queue_capacity {
            return Err(SessionError::BackPressured);
        }
        let header = *claim.header();
        let body = claim.buffer_mut().split().freeze();
        self.publication.abort(claim);
        self.hold_queue.push_back(Fragment::new(header, body));
        debug!(
            session = %self.identity(),
            seq_no = %seq_no,
            held = self.hold_queue.len(),
            "claim held until replay completes"
        );
        Ok(())
    }

    fn is_holding(&self) -> bool {
        self.state == SessionState::Retransmitting || !self.hold_queue.is_empty()
    }

    fn flush_held(&mut self) -> usize {
        if self.state == SessionState::Retransmitting {
            return 0;
        }
        let mut published = 0;
        while let Some(fragment) = self.hold_queue.front() {
            match self.publication.offer(fragment.header, &fragment.body) {
                Ok(_) => {
                    self.hold_queue.pop_front();
                    published += 1;
                }
                Err(StreamError::BackPressured) => break,
                Err(err) => {
                    warn!(session = %self.identity(), error = %err, "held message not published");
                    break;
                }
            }
        }
        published
    }

    // ---------------------------------------------------------------------
    // Termination
    // ---------------------------------------------------------------------

    /// Starts an orderly disconnect.
    ///
    /// Does nothing once the session is already terminating.
    ///
    /// # Errors
    /// Returns the proxy error if Terminate could not be handed over.
    pub fn request_disconnect(&mut self, reason: DisconnectReason) -> Result<(), SessionError> {
        if self.state.is_terminating() {
            return Ok(());
        }
        self.disconnect_reason = Some(reason);
        self.start_terminate(reason_text(&reason.to_string()), TERMINATE_NORMAL)
    }

    /// Sends Terminate with the given reason and moves to `SENT_TERMINATE`.
    ///
    /// A second call is a no-op.
    ///
    /// # Errors
    /// Returns the proxy error if Terminate could not be handed over.
    pub fn terminate(&mut self, reason: &str, error_codes: u32) -> Result<(), SessionError> {
        if self.state.is_terminating() {
            return Ok(());
        }
        self.disconnect_reason
            .get_or_insert(DisconnectReason::ApplicationDisconnect);
        self.start_terminate(reason_text(reason), error_codes)
    }

    /// Handles loss of the transport.
    pub fn on_disconnect(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.disconnect_reason
            .get_or_insert(DisconnectReason::RemoteDisconnect);
        self.unbind();
    }

    /// Ends the session after the caller detected a protocol violation.
    pub fn on_protocol_violation(&mut self, reason: &str) {
        warn!(session = %self.identity(), state = %self.state, reason, "protocol violation");
        if self.state.is_terminating() {
            return;
        }
        self.disconnect_reason = Some(DisconnectReason::ProtocolViolation);
        if let Err(err) = self.start_terminate(reason_text(reason), TERMINATE_PROTOCOL_VIOLATION) {
            warn!(session = %self.identity(), error = %err, "terminate after violation failed");
            self.unbind();
        }
    }

    fn start_terminate(&mut self, reason: ReasonText, error_codes: u32) -> Result<(), SessionError> {
        self.transition(SessionState::Unbinding);
        self.terminate_deadline = Some(self.clock + self.config.terminate_timeout);
        self.deferred
            .retain(|message| matches!(message, ControlMessage::Terminate { .. }));
        self.send_control(ControlMessage::Terminate {
            reason,
            error_codes,
        })
    }

    fn unbind(&mut self) {
        self.deferred.clear();
        self.pending_replays.clear();
        self.current_replay = None;
        self.transition(SessionState::Unbound);

        self.flush_held();
        if !self.hold_queue.is_empty() {
            warn!(
                session = %self.identity(),
                held = self.hold_queue.len(),
                "held messages still unpublished at unbind"
            );
        }

        let reason = self
            .disconnect_reason
            .unwrap_or(DisconnectReason::RemoteDisconnect);
        info!(session = %self.identity(), reason = %reason, "session unbound");
        self.handler.on_disconnect(self.config.identity, reason);
    }

    fn fail(&mut self, error: SessionError) {
        if self.terminal_error.is_some() {
            return;
        }
        warn!(session = %self.identity(), error = %error, "session failed");
        self.handler.on_terminal(self.config.identity, &error);
        self.terminal_error = Some(error);
    }

    fn transition(&mut self, next: SessionState) {
        let from = self.state;
        if from == next {
            return;
        }
        if !from.can_transition_to(next) {
            warn!(session = %self.identity(), from = %from, to = %next, "illegal transition ignored");
            return;
        }
        debug!(session = %self.identity(), from = %from, to = %next, "session transition");
        self.state = next;
        self.handler.on_state_change(self.config.identity, from, next);
    }

    // ---------------------------------------------------------------------
    // Session-level sends
    // ---------------------------------------------------------------------

    fn send_control(&mut self, message: ControlMessage) -> Result<(), SessionError> {
        if !self.deferred.is_empty() {
            self.deferred.push_back(message);
            return Ok(());
        }
        match self.dispatch(message) {
            Ok(()) => {
                self.on_control_sent(message);
                Ok(())
            }
            Err(SessionError::BackPressured) => {
                debug!(session = %self.identity(), ?message, "session message deferred");
                self.deferred.push_back(message);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn flush_deferred(&mut self) -> Result<usize, SessionError> {
        let mut sent = 0;
        while let Some(&message) = self.deferred.front() {
            match self.dispatch(message) {
                Ok(()) => {
                    self.deferred.pop_front();
                    self.on_control_sent(message);
                    sent += 1;
                }
                Err(SessionError::BackPressured) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(sent)
    }

    fn dispatch(&mut self, message: ControlMessage) -> Result<(), SessionError> {
        let session = self.config.identity;
        let next_sent = self.sequence.next_sent_seq_no();
        let keepalive_ms = u64::try_from(self.keepalive.interval().as_millis()).unwrap_or(u64::MAX);
        match message {
            ControlMessage::Negotiate => self.proxy.send_negotiate(session),
            ControlMessage::NegotiationResponse => self.proxy.send_negotiation_response(session),
            ControlMessage::Establish => self.proxy.send_establish(session, next_sent, keepalive_ms),
            ControlMessage::EstablishmentAck => {
                self.proxy
                    .send_establishment_ack(session, next_sent, next_sent.prev(), keepalive_ms)
            }
            ControlMessage::Sequence { keepalive_lapsed } => {
                self.proxy.send_sequence(session, next_sent, keepalive_lapsed)
            }
            ControlMessage::RetransmitRequest { begin, end } => {
                self.proxy.send_retransmit_request(session, begin, end)
            }
            ControlMessage::Terminate {
                reason,
                error_codes,
            } => self.proxy.send_terminate(session, reason.as_str(), error_codes),
        }
    }

    fn on_control_sent(&mut self, message: ControlMessage) {
        self.keepalive.on_message_sent(self.clock);
        match message {
            ControlMessage::Negotiate => {
                self.handshake_attempts += 1;
                self.handshake_deadline = Some(self.clock + self.config.retry_backoff);
                self.transition(SessionState::SentNegotiate);
            }
            ControlMessage::Establish => {
                self.handshake_attempts += 1;
                self.handshake_deadline = Some(self.clock + self.config.retry_backoff);
                self.transition(SessionState::SentEstablish);
            }
            ControlMessage::Terminate { .. } => {
                self.terminate_deadline = Some(self.clock + self.config.terminate_timeout);
                if self.state == SessionState::Unbinding {
                    self.transition(SessionState::SentTerminate);
                }
            }
            _ => {}
        }
    }

    fn is_deferred(&self, message: ControlMessage) -> bool {
        self.deferred.contains(&message)
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    /// Advances timers and flushes deferred sends.
    ///
    /// Returns the amount of work done, zero when idle.
    ///
    /// # Errors
    /// Returns a proxy error other than back pressure.
    pub fn poll(&mut self, now: Instant) -> Result<usize, SessionError> {
        self.clock = now;
        let mut work = self.flush_deferred()?;
        work += self.flush_held();

        match self.state {
            SessionState::Connected => {
                if self.config.role.is_initiator() && !self.is_deferred(ControlMessage::Negotiate) {
                    self.send_control(ControlMessage::Negotiate)?;
                    work += 1;
                }
            }
            SessionState::Negotiated => {
                if self.config.role.is_initiator() && !self.is_deferred(ControlMessage::Establish) {
                    self.send_control(ControlMessage::Establish)?;
                    work += 1;
                }
            }
            SessionState::SentNegotiate | SessionState::RetryNegotiate => {
                work += self.poll_handshake(now, HandshakeStage::Negotiate)?;
            }
            SessionState::SentEstablish | SessionState::RetryEstablish => {
                work += self.poll_handshake(now, HandshakeStage::Establish)?;
            }
            SessionState::Established
            | SessionState::Retransmitting
            | SessionState::AwaitingKeepalive => {
                work += self.poll_keepalive(now)?;
            }
            SessionState::Unbinding
            | SessionState::SentTerminate
            | SessionState::ResendTerminate
            | SessionState::ResendTerminateAck => {
                if self.terminate_deadline.is_some_and(|deadline| now >= deadline) {
                    warn!(session = %self.identity(), state = %self.state, "terminate acknowledgement timed out");
                    self.unbind();
                    work += 1;
                }
            }
            SessionState::NegotiateRejected
            | SessionState::EstablishRejected
            | SessionState::Unbound => {}
        }
        Ok(work)
    }

    fn poll_handshake(&mut self, now: Instant, stage: HandshakeStage) -> Result<usize, SessionError> {
        let (sent, retry, rejected, message) = match stage {
            HandshakeStage::Negotiate => (
                SessionState::SentNegotiate,
                SessionState::RetryNegotiate,
                SessionState::NegotiateRejected,
                ControlMessage::Negotiate,
            ),
            HandshakeStage::Establish => (
                SessionState::SentEstablish,
                SessionState::RetryEstablish,
                SessionState::EstablishRejected,
                ControlMessage::Establish,
            ),
        };

        if self.state == sent {
            if !self.handshake_deadline.is_some_and(|deadline| now >= deadline) {
                return Ok(0);
            }
            if self.handshake_attempts >= self.config.max_handshake_attempts {
                warn!(
                    session = %self.identity(),
                    stage = stage.name(),
                    attempts = self.handshake_attempts,
                    "handshake retries exhausted"
                );
                self.deferred.clear();
                self.transition(rejected);
                self.fail(SessionError::RetryExhausted {
                    stage: stage.name().to_string(),
                    attempts: self.handshake_attempts,
                });
                return Ok(1);
            }
            debug!(
                session = %self.identity(),
                stage = stage.name(),
                attempt = self.handshake_attempts + 1,
                "retrying handshake"
            );
            self.transition(retry);
        }

        if self.state == retry && !self.is_deferred(message) {
            self.send_control(message)?;
            return Ok(1);
        }
        Ok(0)
    }

    fn poll_keepalive(&mut self, now: Instant) -> Result<usize, SessionError> {
        let mut work = 0;
        if self.keepalive.is_lapsed(now) {
            let quiet = self.keepalive.time_since_last_received(now);
            if self.keepalive.on_lapse(now) >= 2 {
                let elapsed = quiet + self.keepalive.interval();
                self.fail(SessionError::KeepaliveTimeout {
                    elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                });
                self.disconnect_reason = Some(DisconnectReason::KeepaliveTimeout);
                self.start_terminate(reason_text("keepalive timeout"), TERMINATE_KEEPALIVE_TIMEOUT)?;
                return Ok(1);
            }
            warn!(session = %self.identity(), quiet_ms = quiet.as_millis() as u64, "keepalive lapsed");
            self.send_control(ControlMessage::Sequence {
                keepalive_lapsed: true,
            })?;
            if self.state == SessionState::Established {
                self.transition(SessionState::AwaitingKeepalive);
            }
            work += 1;
        }
        if self.keepalive.should_send_keepalive(now) && self.deferred.is_empty() {
            self.send_control(ControlMessage::Sequence {
                keepalive_lapsed: false,
            })?;
            work += 1;
        }
        Ok(work)
    }

    // ---------------------------------------------------------------------
    // Replays of our messages
    // ---------------------------------------------------------------------

    /// Ends the current replay and releases held messages.
    pub fn on_replay_complete(&mut self) {
        if self.state != SessionState::Retransmitting {
            warn!(session = %self.identity(), state = %self.state, "replay completion ignored");
            return;
        }
        debug!(session = %self.identity(), replay = ?self.current_replay, "replay complete");
        self.current_replay = None;
        self.transition(SessionState::Established);
        self.flush_held();
        if let Some(next) = self.pending_replays.pop_front() {
            self.start_replay(next);
        }
    }

    /// Fails the current replay and terminates the session.
    ///
    /// # Errors
    /// Returns the proxy error if Terminate could not be handed over.
    pub fn on_replay_failed(&mut self, begin: SeqNum, end: SeqNum) -> Result<(), SessionError> {
        if self.state != SessionState::Retransmitting {
            warn!(session = %self.identity(), state = %self.state, "replay failure ignored");
            return Ok(());
        }
        self.fail(SessionError::RetransmitFailed {
            begin: begin.value(),
            end: end.value(),
        });
        self.disconnect_reason = Some(DisconnectReason::RetransmitFailure);
        self.current_replay = None;
        self.pending_replays.clear();
        self.transition(SessionState::ResendTerminate);
        self.terminate_deadline = Some(self.clock + self.config.terminate_timeout);
        self.send_control(ControlMessage::Terminate {
            reason: reason_text("retransmit failed"),
            error_codes: TERMINATE_RETRANSMIT_FAILURE,
        })
    }

    fn start_replay(&mut self, request: ReplayRequest) {
        info!(
            session = %self.identity(),
            begin = %request.begin_seq_no,
            end = %request.end_seq_no,
            "replay requested"
        );
        self.current_replay = Some(request);
        self.transition(SessionState::Retransmitting);
        self.handler.on_replay_request(request);
    }

    // ---------------------------------------------------------------------
    // Inbound events
    // ---------------------------------------------------------------------

    /// Consumes one decoded protocol event.
    ///
    /// # Errors
    /// Returns `SessionError::ProtocolViolation` if the event breaks the
    /// protocol; the session then starts unbinding. Other errors come from
    /// the proxy.
    pub fn on_event(&mut self, event: ProtocolEvent, now: Instant) -> Result<(), SessionError> {
        self.clock = now;
        if self.state.is_terminal() {
            debug!(session = %self.identity(), event = event.name(), "event after session end ignored");
            return Ok(());
        }

        self.keepalive.on_message_received(now);
        if self.state == SessionState::AwaitingKeepalive {
            self.transition(SessionState::Established);
        }

        let result = self.apply_event(event);
        if let Err(SessionError::ProtocolViolation { reason }) = &result {
            let reason = reason.clone();
            self.on_protocol_violation(&reason);
        }
        result
    }

    fn apply_event(&mut self, event: ProtocolEvent) -> Result<(), SessionError> {
        let name = event.name();
        match event {
            ProtocolEvent::Negotiate { uuid } => {
                if self.config.role.is_initiator() || self.state != SessionState::Connected {
                    return self.unexpected(name);
                }
                self.check_uuid(uuid)?;
                self.transition(SessionState::Negotiated);
                self.send_control(ControlMessage::NegotiationResponse)
            }
            ProtocolEvent::NegotiationResponse { uuid } => {
                if !self.awaiting(HandshakeStage::Negotiate) {
                    return self.unexpected(name);
                }
                self.check_uuid(uuid)?;
                self.deferred.retain(|m| *m != ControlMessage::Negotiate);
                self.handshake_attempts = 0;
                self.handshake_deadline = None;
                self.transition(SessionState::Negotiated);
                self.send_control(ControlMessage::Establish)
            }
            ProtocolEvent::NegotiationReject {
                reason,
                error_codes,
            } => {
                if !self.awaiting(HandshakeStage::Negotiate) {
                    return self.unexpected(name);
                }
                self.deferred.clear();
                self.transition(SessionState::NegotiateRejected);
                self.fail(SessionError::NegotiateRejected {
                    reason: reason.to_string(),
                    error_codes,
                });
                Ok(())
            }
            ProtocolEvent::Establish {
                next_seq_no,
                keepalive_interval_ms,
            } => {
                if self.config.role.is_initiator() || self.state != SessionState::Negotiated {
                    return self.unexpected(name);
                }
                self.apply_keepalive_interval(keepalive_interval_ms);
                self.transition(SessionState::Established);
                self.send_control(ControlMessage::EstablishmentAck)?;
                self.check_counterparty_next(next_seq_no)
            }
            ProtocolEvent::EstablishmentAck {
                next_seq_no,
                previous_seq_no,
                keepalive_interval_ms,
            } => {
                if !self.awaiting(HandshakeStage::Establish) {
                    return self.unexpected(name);
                }
                self.deferred.retain(|m| *m != ControlMessage::Establish);
                self.handshake_attempts = 0;
                self.handshake_deadline = None;
                self.apply_keepalive_interval(keepalive_interval_ms);
                debug!(
                    session = %self.identity(),
                    previous_seq_no = %previous_seq_no,
                    "establishment acknowledged"
                );
                self.transition(SessionState::Established);
                self.check_counterparty_next(next_seq_no)
            }
            ProtocolEvent::EstablishmentReject {
                reason,
                error_codes,
            } => {
                if !self.awaiting(HandshakeStage::Establish) {
                    return self.unexpected(name);
                }
                self.deferred.clear();
                self.transition(SessionState::EstablishRejected);
                self.fail(SessionError::EstablishRejected {
                    reason: reason.to_string(),
                    error_codes,
                });
                Ok(())
            }
            ProtocolEvent::Sequence {
                next_seq_no,
                keepalive_lapsed,
            } => {
                if !self.state.is_established() {
                    return self.unexpected(name);
                }
                if keepalive_lapsed {
                    self.send_control(ControlMessage::Sequence {
                        keepalive_lapsed: false,
                    })?;
                }
                self.check_counterparty_next(next_seq_no)
            }
            ProtocolEvent::ResendRequest {
                begin_seq_no,
                end_seq_no,
            } => {
                if !self.state.is_established() {
                    return self.unexpected(name);
                }
                self.on_resend_request(begin_seq_no, end_seq_no)
            }
            ProtocolEvent::Terminate {
                reason,
                error_codes,
            } => {
                self.on_terminate(&reason, error_codes);
                Ok(())
            }
            ProtocolEvent::BusinessMessage {
                seq_no,
                possible_retransmission,
            } => {
                if !self.state.is_established() {
                    return self.unexpected(name);
                }
                self.accept_sequenced(seq_no, possible_retransmission)?;
                self.handler
                    .on_business_message(self.config.identity, seq_no, possible_retransmission);
                Ok(())
            }
            ProtocolEvent::Reject { seq_no, ref_seq_no } => {
                if !self.state.is_established() {
                    return self.unexpected(name);
                }
                debug!(session = %self.identity(), seq_no = %seq_no, ref_seq_no = %ref_seq_no, "reject received");
                self.accept_sequenced(seq_no, false)
            }
            ProtocolEvent::Unrecognized { template_id } => {
                debug!(session = %self.identity(), template = %template_id, "unrecognized template ignored");
                Ok(())
            }
        }
    }

    fn unexpected(&self, event: &str) -> Result<(), SessionError> {
        Err(SessionError::ProtocolViolation {
            reason: format!("unexpected {event} in {}", self.state),
        })
    }

    fn awaiting(&self, stage: HandshakeStage) -> bool {
        self.config.role.is_initiator()
            && match stage {
                HandshakeStage::Negotiate => matches!(
                    self.state,
                    SessionState::SentNegotiate | SessionState::RetryNegotiate
                ),
                HandshakeStage::Establish => matches!(
                    self.state,
                    SessionState::SentEstablish | SessionState::RetryEstablish
                ),
            }
    }

    fn check_uuid(&self, uuid: u64) -> Result<(), SessionError> {
        if uuid != self.identity().uuid() {
            return Err(SessionError::ProtocolViolation {
                reason: format!("uuid {uuid:#x} does not match {}", self.identity()),
            });
        }
        Ok(())
    }

    fn apply_keepalive_interval(&mut self, interval_ms: u64) {
        if interval_ms > 0 {
            self.keepalive.set_interval(Duration::from_millis(interval_ms));
        }
    }

    /// Checks the counterparty's announced next sequence number.
    fn check_counterparty_next(&mut self, next_seq_no: SeqNum) -> Result<(), SessionError> {
        match self.sequence.validate_incoming(next_seq_no) {
            SequenceResult::Ok => Ok(()),
            SequenceResult::Gap { expected, .. } => {
                self.request_retransmit(SeqNum::new(expected), next_seq_no.prev())?;
                self.sequence.set_next_recv_seq_no(next_seq_no);
                Ok(())
            }
            SequenceResult::TooLow { expected, received } => Err(SessionError::ProtocolViolation {
                reason: format!("next seq no {received} below expected {expected}"),
            }),
        }
    }

    fn accept_sequenced(
        &mut self,
        seq_no: SeqNum,
        possible_retransmission: bool,
    ) -> Result<(), SessionError> {
        match self.sequence.validate_incoming(seq_no) {
            SequenceResult::Ok => self.sequence.on_received(seq_no),
            SequenceResult::Gap { expected, .. } => {
                self.request_retransmit(SeqNum::new(expected), seq_no.prev())?;
                self.sequence.on_received(seq_no);
            }
            SequenceResult::TooLow { expected, received } => {
                if !possible_retransmission {
                    return Err(SessionError::ProtocolViolation {
                        reason: format!("seq no {received} below expected {expected}"),
                    });
                }
            }
        }

        if possible_retransmission
            && let Some(fill) = self.retransmit_fill_seq_no
            && seq_no >= fill
        {
            debug!(session = %self.identity(), fill = %fill, "retransmission received");
            self.retransmit_fill_seq_no = None;
        }
        Ok(())
    }

    fn request_retransmit(&mut self, begin: SeqNum, end: SeqNum) -> Result<(), SessionError> {
        warn!(session = %self.identity(), begin = %begin, end = %end, "inbound gap, requesting retransmit");
        let fill = self.retransmit_fill_seq_no.map_or(end, |fill| fill.max(end));
        self.retransmit_fill_seq_no = Some(fill);
        self.send_control(ControlMessage::RetransmitRequest { begin, end })
    }

    fn on_resend_request(&mut self, begin: SeqNum, end: SeqNum) -> Result<(), SessionError> {
        let last_sent = self.sequence.next_sent_seq_no().prev();
        let open_ended = end.value() == 0;
        if !begin.is_valid() || begin > last_sent || (!open_ended && end < begin) {
            return Err(SessionError::ProtocolViolation {
                reason: format!("invalid resend range {begin}..={end}, last sent {last_sent}"),
            });
        }

        let end = if open_ended { end } else { end.min(last_sent) };
        let request = ReplayRequest::new(self.identity(), begin, end);
        if self.state == SessionState::Retransmitting {
            debug!(session = %self.identity(), "replay queued behind the current one");
            self.pending_replays.push_back(request);
            return Ok(());
        }
        self.start_replay(request);
        Ok(())
    }

    fn on_terminate(&mut self, reason: &str, error_codes: u32) {
        match self.state {
            SessionState::SentTerminate | SessionState::Unbinding => self.unbind(),
            SessionState::ResendTerminate => {
                self.transition(SessionState::ResendTerminateAck);
                self.unbind();
            }
            _ => {
                info!(session = %self.identity(), reason, error_codes, "counterparty terminated");
                self.disconnect_reason = Some(DisconnectReason::RemoteDisconnect);
                if let Err(err) = self.start_terminate(reason_text(reason), TERMINATE_NORMAL) {
                    warn!(session = %self.identity(), error = %err, "terminate echo failed");
                }
                self.unbind();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironlink_core::types::RecordingId;
    use ironlink_transport::{FRAME_HEADER_LEN, RecordedStream, Subscription};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Sent {
        Negotiate,
        NegotiationResponse,
        Establish(u64),
        EstablishmentAck(u64, u64),
        Sequence(u64, bool),
        RetransmitRequest(u64, u64),
        Terminate(String, u32),
    }

    #[derive(Default)]
    struct TestProxy {
        sent: Vec<Sent>,
        back_pressured: bool,
    }

    impl TestProxy {
        fn send(&mut self, message: Sent) -> Result<(), SessionError> {
            if self.back_pressured {
                return Err(SessionError::BackPressured);
            }
            self.sent.push(message);
            Ok(())
        }

        fn count(&self, wanted: fn(&Sent) -> bool) -> usize {
            self.sent.iter().filter(|m| wanted(m)).count()
        }
    }

    impl SessionProxy for TestProxy {
        fn send_negotiate(&mut self, _: SessionIdentity) -> Result<(), SessionError> {
            self.send(Sent::Negotiate)
        }

        fn send_negotiation_response(&mut self, _: SessionIdentity) -> Result<(), SessionError> {
            self.send(Sent::NegotiationResponse)
        }

        fn send_establish(
            &mut self,
            _: SessionIdentity,
            next_seq_no: SeqNum,
            _: u64,
        ) -> Result<(), SessionError> {
            self.send(Sent::Establish(next_seq_no.value()))
        }

        fn send_establishment_ack(
            &mut self,
            _: SessionIdentity,
            next_seq_no: SeqNum,
            previous_seq_no: SeqNum,
            _: u64,
        ) -> Result<(), SessionError> {
            self.send(Sent::EstablishmentAck(
                next_seq_no.value(),
                previous_seq_no.value(),
            ))
        }

        fn send_sequence(
            &mut self,
            _: SessionIdentity,
            next_seq_no: SeqNum,
            keepalive_lapsed: bool,
        ) -> Result<(), SessionError> {
            self.send(Sent::Sequence(next_seq_no.value(), keepalive_lapsed))
        }

        fn send_retransmit_request(
            &mut self,
            _: SessionIdentity,
            begin: SeqNum,
            end: SeqNum,
        ) -> Result<(), SessionError> {
            self.send(Sent::RetransmitRequest(begin.value(), end.value()))
        }

        fn send_terminate(
            &mut self,
            _: SessionIdentity,
            reason: &str,
            error_codes: u32,
        ) -> Result<(), SessionError> {
            self.send(Sent::Terminate(reason.to_string(), error_codes))
        }
    }

    #[derive(Default)]
    struct TestHandler {
        transitions: Vec<(SessionState, SessionState)>,
        replays: Vec<ReplayRequest>,
        messages: Vec<(u64, bool)>,
        terminal: Vec<SessionError>,
        disconnects: Vec<DisconnectReason>,
    }

    impl SessionHandler for TestHandler {
        fn on_business_message(
            &mut self,
            _: SessionIdentity,
            seq_no: SeqNum,
            possible_retransmission: bool,
        ) {
            self.messages.push((seq_no.value(), possible_retransmission));
        }

        fn on_replay_request(&mut self, request: ReplayRequest) {
            self.replays.push(request);
        }

        fn on_state_change(&mut self, _: SessionIdentity, from: SessionState, to: SessionState) {
            self.transitions.push((from, to));
        }

        fn on_terminal(&mut self, _: SessionIdentity, error: &SessionError) {
            self.terminal.push(error.clone());
        }

        fn on_disconnect(&mut self, _: SessionIdentity, reason: DisconnectReason) {
            self.disconnects.push(reason);
        }
    }

    const IDENTITY: SessionIdentity = SessionIdentity::new(0xC0FFEE);
    const ORDER: TemplateId = TemplateId(514);

    type TestSession = Session<TestProxy, TestHandler>;

    fn session_with(role: SessionRole, stream: &RecordedStream, now: Instant) -> TestSession {
        let config = SessionConfig::new(IDENTITY, role).with_hold_queue_capacity(2);
        Session::new(
            config,
            ConnectionId(1),
            Arc::new(stream.clone()),
            TestProxy::default(),
            TestHandler::default(),
            now,
        )
        .unwrap()
    }

    fn established(stream: &RecordedStream, now: Instant) -> TestSession {
        let mut session = session_with(SessionRole::Initiator, stream, now);
        session.poll(now).unwrap();
        session
            .on_event(ProtocolEvent::NegotiationResponse { uuid: IDENTITY.uuid() }, now)
            .unwrap();
        session
            .on_event(
                ProtocolEvent::EstablishmentAck {
                    next_seq_no: SeqNum::new(1),
                    previous_seq_no: SeqNum::new(0),
                    keepalive_interval_ms: 0,
                },
                now,
            )
            .unwrap();
        assert_eq!(session.state(), SessionState::Established);
        session
    }

    fn send(session: &mut TestSession, body: &[u8]) -> Result<SeqNum, SessionError> {
        let mut claim = session.claim_message(ORDER, body.len())?;
        claim.put_slice(body);
        session.commit(claim)
    }

    fn assert_transitions_legal(session: &TestSession) {
        for (from, to) in &session.handler().transitions {
            assert!(from.can_transition_to(*to), "{from} -> {to}");
        }
    }

    #[test]
    fn test_initiator_handshake() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let session = established(&stream, now);

        assert_eq!(
            session.proxy().sent,
            vec![Sent::Negotiate, Sent::Establish(1)]
        );
        assert_eq!(
            session.handler().transitions,
            vec![
                (SessionState::Connected, SessionState::SentNegotiate),
                (SessionState::SentNegotiate, SessionState::Negotiated),
                (SessionState::Negotiated, SessionState::SentEstablish),
                (SessionState::SentEstablish, SessionState::Established),
            ]
        );
    }

    #[test]
    fn test_acceptor_handshake() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = session_with(SessionRole::Acceptor, &stream, now);

        assert_eq!(session.poll(now).unwrap(), 0);
        session
            .on_event(ProtocolEvent::Negotiate { uuid: IDENTITY.uuid() }, now)
            .unwrap();
        assert_eq!(session.state(), SessionState::Negotiated);
        session
            .on_event(
                ProtocolEvent::Establish {
                    next_seq_no: SeqNum::new(1),
                    keepalive_interval_ms: 10_000,
                },
                now,
            )
            .unwrap();

        assert_eq!(session.state(), SessionState::Established);
        assert_eq!(
            session.proxy().sent,
            vec![Sent::NegotiationResponse, Sent::EstablishmentAck(1, 0)]
        );
        assert_transitions_legal(&session);
    }

    #[test]
    fn test_claim_and_commit_advance_sequence() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let mut subscription = stream.subscribe();
        let now = Instant::now();
        let mut session = established(&stream, now);

        assert_eq!(send(&mut session, b"order-1").unwrap(), SeqNum::new(1));
        assert_eq!(send(&mut session, b"order-2").unwrap(), SeqNum::new(2));
        assert_eq!(session.next_sent_seq_no(), SeqNum::new(3));

        let published = subscription.poll(10);
        assert_eq!(published.len(), 2);
        assert_eq!(published[1].header.seq_no, SeqNum::new(2));
        assert_eq!(published[1].header.session, IDENTITY);
    }

    #[test]
    fn test_claim_requires_established_session() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let mut session = session_with(SessionRole::Initiator, &stream, Instant::now());
        assert!(matches!(
            session.claim_message(ORDER, 8),
            Err(SessionError::NotConnected { .. })
        ));
    }

    #[test]
    fn test_single_outstanding_claim() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let mut session = established(&stream, Instant::now());

        let claim = session.claim_message(ORDER, 8).unwrap();
        assert_eq!(
            session.claim_message(ORDER, 8).unwrap_err(),
            SessionError::ClaimOutstanding
        );
        drop(claim);

        assert!(session.claim_message(ORDER, 8).is_ok());
        assert_eq!(session.next_sent_seq_no(), SeqNum::new(1));
    }

    #[test]
    fn test_back_pressure_drops_nothing() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 96);
        let mut subscription = stream.subscribe();
        let mut session = established(&stream, Instant::now());

        send(&mut session, &[1u8; 40]).unwrap();
        assert_eq!(send(&mut session, &[2u8; 40]), Err(SessionError::BackPressured));
        assert_eq!(session.next_sent_seq_no(), SeqNum::new(2));

        subscription.poll(10);
        subscription.commit();
        assert_eq!(send(&mut session, &[2u8; 40]).unwrap(), SeqNum::new(2));
    }

    #[test]
    fn test_resend_request_holds_new_messages() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = established(&stream, now);
        for _ in 0..5 {
            send(&mut session, b"m").unwrap();
        }

        session
            .on_event(
                ProtocolEvent::ResendRequest {
                    begin_seq_no: SeqNum::new(2),
                    end_seq_no: SeqNum::new(4),
                },
                now,
            )
            .unwrap();
        assert_eq!(session.state(), SessionState::Retransmitting);
        assert_eq!(
            session.handler().replays,
            vec![ReplayRequest::new(IDENTITY, SeqNum::new(2), SeqNum::new(4))]
        );

        assert_eq!(send(&mut session, b"new").unwrap(), SeqNum::new(6));
        assert_eq!(session.held_count(), 1);
        assert_eq!(stream.fragment_count(), 5);

        session.on_replay_complete();
        assert_eq!(session.state(), SessionState::Established);
        assert_eq!(session.held_count(), 0);
        let fragments = stream.fragments();
        assert_eq!(fragments.len(), 6);
        assert_eq!(fragments[5].header.seq_no, SeqNum::new(6));
    }

    #[test]
    fn test_claim_committed_after_resend_is_held() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = established(&stream, now);
        for _ in 0..3 {
            send(&mut session, b"m").unwrap();
        }

        let mut claim = session.claim_message(ORDER, 3).unwrap();
        claim.put_slice(b"new");
        session
            .on_event(
                ProtocolEvent::ResendRequest {
                    begin_seq_no: SeqNum::new(1),
                    end_seq_no: SeqNum::new(3),
                },
                now,
            )
            .unwrap();
        assert_eq!(session.state(), SessionState::Retransmitting);

        assert_eq!(session.commit(claim).unwrap(), SeqNum::new(4));
        assert_eq!(session.held_count(), 1);
        assert_eq!(stream.fragment_count(), 3);

        session.on_replay_complete();
        assert_eq!(session.held_count(), 0);
        let fragments = stream.fragments();
        assert_eq!(fragments.len(), 4);
        assert_eq!(fragments[3].header.seq_no, SeqNum::new(4));
        assert_eq!(&fragments[3].body[..], b"new");

        // the held claim gave its reservation back
        let full = vec![0u8; 4096 - FRAME_HEADER_LEN];
        assert_eq!(send(&mut session, &full).unwrap(), SeqNum::new(5));
    }

    #[test]
    fn test_full_hold_queue_back_pressures() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = established(&stream, now);
        send(&mut session, b"m").unwrap();
        session
            .on_event(
                ProtocolEvent::ResendRequest {
                    begin_seq_no: SeqNum::new(1),
                    end_seq_no: SeqNum::new(0),
                },
                now,
            )
            .unwrap();

        send(&mut session, b"a").unwrap();
        send(&mut session, b"b").unwrap();
        assert_eq!(send(&mut session, b"c"), Err(SessionError::BackPressured));
        assert_eq!(session.next_sent_seq_no(), SeqNum::new(4));
    }

    #[test]
    fn test_open_ended_resend_request_is_forwarded() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = established(&stream, now);
        send(&mut session, b"m").unwrap();

        session
            .on_event(
                ProtocolEvent::ResendRequest {
                    begin_seq_no: SeqNum::new(1),
                    end_seq_no: SeqNum::new(0),
                },
                now,
            )
            .unwrap();
        assert!(session.handler().replays[0].is_open_ended());
    }

    #[test]
    fn test_resend_request_beyond_last_sent_is_violation() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = established(&stream, now);

        let result = session.on_event(
            ProtocolEvent::ResendRequest {
                begin_seq_no: SeqNum::new(3),
                end_seq_no: SeqNum::new(4),
            },
            now,
        );
        assert!(matches!(result, Err(SessionError::ProtocolViolation { .. })));
        assert_eq!(session.state(), SessionState::SentTerminate);
    }

    #[test]
    fn test_queued_resend_request_starts_after_completion() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = established(&stream, now);
        for _ in 0..3 {
            send(&mut session, b"m").unwrap();
        }
        for begin in [1, 3] {
            session
                .on_event(
                    ProtocolEvent::ResendRequest {
                        begin_seq_no: SeqNum::new(begin),
                        end_seq_no: SeqNum::new(3),
                    },
                    now,
                )
                .unwrap();
        }
        assert_eq!(session.handler().replays.len(), 1);

        session.on_replay_complete();
        assert_eq!(session.state(), SessionState::Retransmitting);
        assert_eq!(session.handler().replays.len(), 2);
        assert_eq!(session.current_replay().unwrap().begin_seq_no, SeqNum::new(3));
    }

    #[test]
    fn test_replay_failure_terminates() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = established(&stream, now);
        send(&mut session, b"m").unwrap();
        session
            .on_event(
                ProtocolEvent::ResendRequest {
                    begin_seq_no: SeqNum::new(1),
                    end_seq_no: SeqNum::new(1),
                },
                now,
            )
            .unwrap();

        session
            .on_replay_failed(SeqNum::new(1), SeqNum::new(1))
            .unwrap();
        assert_eq!(session.state(), SessionState::ResendTerminate);
        assert_eq!(
            session.handler().terminal,
            vec![SessionError::RetransmitFailed { begin: 1, end: 1 }]
        );

        session
            .on_event(
                ProtocolEvent::Terminate {
                    reason: reason_text("ack"),
                    error_codes: 0,
                },
                now,
            )
            .unwrap();
        assert_eq!(session.state(), SessionState::Unbound);
        assert_eq!(
            session.handler().disconnects,
            vec![DisconnectReason::RetransmitFailure]
        );
        assert_transitions_legal(&session);
    }

    #[test]
    fn test_inbound_gap_requests_retransmit() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = established(&stream, now);

        session
            .on_event(
                ProtocolEvent::BusinessMessage {
                    seq_no: SeqNum::new(1),
                    possible_retransmission: false,
                },
                now,
            )
            .unwrap();
        session
            .on_event(
                ProtocolEvent::BusinessMessage {
                    seq_no: SeqNum::new(5),
                    possible_retransmission: false,
                },
                now,
            )
            .unwrap();

        assert_eq!(session.next_recv_seq_no(), SeqNum::new(6));
        assert_eq!(session.retransmit_fill_seq_no(), Some(SeqNum::new(4)));
        assert!(session.proxy().sent.contains(&Sent::RetransmitRequest(2, 4)));

        for seq in 2..=4 {
            session
                .on_event(
                    ProtocolEvent::BusinessMessage {
                        seq_no: SeqNum::new(seq),
                        possible_retransmission: true,
                    },
                    now,
                )
                .unwrap();
        }
        assert_eq!(session.retransmit_fill_seq_no(), None);
        assert_eq!(session.next_recv_seq_no(), SeqNum::new(6));
        assert_eq!(session.handler().messages.len(), 5);
    }

    #[test]
    fn test_low_sequence_without_retransmission_flag_is_violation() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = established(&stream, now);
        for seq in [1, 2] {
            session
                .on_event(
                    ProtocolEvent::BusinessMessage {
                        seq_no: SeqNum::new(seq),
                        possible_retransmission: false,
                    },
                    now,
                )
                .unwrap();
        }

        let result = session.on_event(
            ProtocolEvent::BusinessMessage {
                seq_no: SeqNum::new(1),
                possible_retransmission: false,
            },
            now,
        );
        assert!(matches!(result, Err(SessionError::ProtocolViolation { .. })));
        assert!(session.state().is_terminating());
        assert!(
            session
                .proxy()
                .sent
                .iter()
                .any(|m| matches!(m, Sent::Terminate(_, TERMINATE_PROTOCOL_VIOLATION)))
        );
    }

    #[test]
    fn test_reject_only_updates_sequence() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = established(&stream, now);

        session
            .on_event(
                ProtocolEvent::Reject {
                    seq_no: SeqNum::new(1),
                    ref_seq_no: SeqNum::new(1),
                },
                now,
            )
            .unwrap();
        assert_eq!(session.next_recv_seq_no(), SeqNum::new(2));
        assert_eq!(session.state(), SessionState::Established);
        assert!(session.handler().replays.is_empty());
        assert!(session.handler().messages.is_empty());
    }

    #[test]
    fn test_establishment_ack_gap_requests_retransmit() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = session_with(SessionRole::Initiator, &stream, now);
        session.set_next_recv_seq_no(SeqNum::new(49)).unwrap();
        session.poll(now).unwrap();
        session
            .on_event(ProtocolEvent::NegotiationResponse { uuid: IDENTITY.uuid() }, now)
            .unwrap();
        session
            .on_event(
                ProtocolEvent::EstablishmentAck {
                    next_seq_no: SeqNum::new(55),
                    previous_seq_no: SeqNum::new(0),
                    keepalive_interval_ms: 0,
                },
                now,
            )
            .unwrap();

        assert_eq!(session.next_recv_seq_no(), SeqNum::new(55));
        assert_eq!(session.retransmit_fill_seq_no(), Some(SeqNum::new(54)));
        assert!(session.proxy().sent.contains(&Sent::RetransmitRequest(49, 54)));
    }

    #[test]
    fn test_resume_seeds_sequence_numbers() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = session_with(SessionRole::Initiator, &stream, now);
        let record = SequenceNumberRecord {
            session: IDENTITY,
            last_sent_seq_no: SeqNum::new(50),
            last_received_seq_no: SeqNum::new(48),
            updated_at_position: 4096,
            sent_position: Some((RecordingId(3), 4096)),
            received_position: Some((RecordingId(2), 2048)),
        };

        session.resume(&record).unwrap();
        assert_eq!(session.next_sent_seq_no(), SeqNum::new(51));
        assert_eq!(session.next_recv_seq_no(), SeqNum::new(49));

        session.poll(now).unwrap();
        session
            .on_event(ProtocolEvent::NegotiationResponse { uuid: IDENTITY.uuid() }, now)
            .unwrap();
        assert_eq!(session.proxy().sent.last(), Some(&Sent::Establish(51)));
    }

    #[test]
    fn test_resume_rejects_foreign_record() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let mut session = session_with(SessionRole::Initiator, &stream, Instant::now());
        let record = SequenceNumberRecord {
            session: SessionIdentity::new(1),
            last_sent_seq_no: SeqNum::new(1),
            last_received_seq_no: SeqNum::new(1),
            updated_at_position: 0,
            sent_position: None,
            received_position: None,
        };
        assert!(matches!(
            session.resume(&record),
            Err(SessionError::Configuration(_))
        ));
    }

    #[test]
    fn test_setters_rejected_while_established() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let mut session = established(&stream, Instant::now());

        let result = session.set_next_sent_seq_no(SeqNum::new(100));
        assert!(matches!(result, Err(SessionError::ProtocolViolation { .. })));
        assert_eq!(session.next_sent_seq_no(), SeqNum::new(1));
        assert_eq!(session.state(), SessionState::SentTerminate);
    }

    #[test]
    fn test_lowered_next_sent_flags_sequence_reset() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = session_with(SessionRole::Initiator, &stream, now);
        session.set_next_sent_seq_no(SeqNum::new(10)).unwrap();
        session.set_next_sent_seq_no(SeqNum::new(1)).unwrap();
        session.poll(now).unwrap();
        session
            .on_event(ProtocolEvent::NegotiationResponse { uuid: IDENTITY.uuid() }, now)
            .unwrap();
        session
            .on_event(
                ProtocolEvent::EstablishmentAck {
                    next_seq_no: SeqNum::new(1),
                    previous_seq_no: SeqNum::new(0),
                    keepalive_interval_ms: 0,
                },
                now,
            )
            .unwrap();

        send(&mut session, b"first").unwrap();
        send(&mut session, b"second").unwrap();
        let fragments = stream.fragments();
        assert!(fragments[0].header.flags.sequence_reset);
        assert!(!fragments[1].header.flags.sequence_reset);
    }

    #[test]
    fn test_negotiate_retry_exhaustion() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let start = Instant::now();
        let mut session = session_with(SessionRole::Initiator, &stream, start);
        let backoff = Duration::from_millis(200);

        let mut now = start;
        for _ in 0..10 {
            session.poll(now).unwrap();
            now += backoff;
        }

        assert_eq!(session.proxy().count(|m| *m == Sent::Negotiate), 3);
        assert_eq!(session.state(), SessionState::NegotiateRejected);
        assert_eq!(
            session.handler().terminal,
            vec![SessionError::RetryExhausted {
                stage: "negotiate".to_string(),
                attempts: 3
            }]
        );
        assert!(
            session
                .handler()
                .transitions
                .contains(&(SessionState::SentNegotiate, SessionState::RetryNegotiate))
        );
        assert_transitions_legal(&session);
    }

    #[test]
    fn test_establish_retry_then_success() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let start = Instant::now();
        let mut session = session_with(SessionRole::Initiator, &stream, start);
        session.poll(start).unwrap();
        session
            .on_event(ProtocolEvent::NegotiationResponse { uuid: IDENTITY.uuid() }, start)
            .unwrap();

        let later = start + Duration::from_millis(200);
        session.poll(later).unwrap();
        assert_eq!(session.state(), SessionState::SentEstablish);
        assert_eq!(session.proxy().count(|m| matches!(m, Sent::Establish(_))), 2);

        session
            .on_event(
                ProtocolEvent::EstablishmentAck {
                    next_seq_no: SeqNum::new(1),
                    previous_seq_no: SeqNum::new(0),
                    keepalive_interval_ms: 0,
                },
                later,
            )
            .unwrap();
        assert_eq!(session.state(), SessionState::Established);
        assert!(session.handler().terminal.is_empty());
    }

    #[test]
    fn test_negotiation_reject_is_terminal() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = session_with(SessionRole::Initiator, &stream, now);
        session.poll(now).unwrap();
        session
            .on_event(
                ProtocolEvent::NegotiationReject {
                    reason: reason_text("bad credentials"),
                    error_codes: 7,
                },
                now,
            )
            .unwrap();

        assert_eq!(session.state(), SessionState::NegotiateRejected);
        assert!(matches!(
            session.handler().terminal[0],
            SessionError::NegotiateRejected { error_codes: 7, .. }
        ));
        assert_eq!(session.poll(now + Duration::from_secs(10)).unwrap(), 0);
        assert_eq!(session.proxy().count(|m| *m == Sent::Negotiate), 1);
    }

    #[test]
    fn test_keepalive_lapse_then_timeout() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let start = Instant::now();
        let mut session = established(&stream, start);
        let interval = Duration::from_secs(30);

        session.poll(start + interval).unwrap();
        assert_eq!(session.state(), SessionState::AwaitingKeepalive);
        assert!(session.proxy().sent.contains(&Sent::Sequence(1, true)));

        session.poll(start + interval * 2).unwrap();
        assert_eq!(session.state(), SessionState::SentTerminate);
        assert!(matches!(
            session.handler().terminal[0],
            SessionError::KeepaliveTimeout { .. }
        ));

        session.poll(start + interval * 2 + Duration::from_secs(5)).unwrap();
        assert_eq!(session.state(), SessionState::Unbound);
        assert_eq!(
            session.handler().disconnects,
            vec![DisconnectReason::KeepaliveTimeout]
        );
        assert_transitions_legal(&session);
    }

    #[test]
    fn test_inbound_traffic_clears_awaiting_keepalive() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let start = Instant::now();
        let mut session = established(&stream, start);
        let interval = Duration::from_secs(30);

        session.poll(start + interval).unwrap();
        assert_eq!(session.state(), SessionState::AwaitingKeepalive);

        session
            .on_event(
                ProtocolEvent::Sequence {
                    next_seq_no: SeqNum::new(1),
                    keepalive_lapsed: false,
                },
                start + interval + Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(session.state(), SessionState::Established);
    }

    #[test]
    fn test_idle_sender_sends_sequence() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let start = Instant::now();
        let mut session = established(&stream, start);
        let half = Duration::from_secs(15);

        session
            .on_event(
                ProtocolEvent::Sequence {
                    next_seq_no: SeqNum::new(1),
                    keepalive_lapsed: false,
                },
                start + half,
            )
            .unwrap();
        session.poll(start + half * 2).unwrap();

        assert_eq!(session.state(), SessionState::Established);
        assert!(session.proxy().sent.contains(&Sent::Sequence(1, false)));
    }

    #[test]
    fn test_request_disconnect_is_idempotent() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = established(&stream, now);

        session
            .request_disconnect(DisconnectReason::ApplicationDisconnect)
            .unwrap();
        session
            .request_disconnect(DisconnectReason::ApplicationDisconnect)
            .unwrap();
        session.terminate("again", 0).unwrap();

        assert_eq!(session.state(), SessionState::SentTerminate);
        assert_eq!(
            session.proxy().count(|m| matches!(m, Sent::Terminate(..))),
            1
        );

        session
            .on_event(
                ProtocolEvent::Terminate {
                    reason: reason_text("bye"),
                    error_codes: 0,
                },
                now,
            )
            .unwrap();
        assert_eq!(session.state(), SessionState::Unbound);
        assert_eq!(
            session.handler().disconnects,
            vec![DisconnectReason::ApplicationDisconnect]
        );
    }

    #[test]
    fn test_deferred_terminate_flushed_on_poll() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = established(&stream, now);

        session.proxy_mut().back_pressured = true;
        session.terminate("shutdown", 0).unwrap();
        assert_eq!(session.state(), SessionState::Unbinding);

        session.proxy_mut().back_pressured = false;
        session.poll(now).unwrap();
        assert_eq!(session.state(), SessionState::SentTerminate);
    }

    #[test]
    fn test_remote_terminate_is_echoed() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = established(&stream, now);

        session
            .on_event(
                ProtocolEvent::Terminate {
                    reason: reason_text("end of day"),
                    error_codes: 0,
                },
                now,
            )
            .unwrap();

        assert_eq!(session.state(), SessionState::Unbound);
        assert_eq!(
            session.proxy().sent.last(),
            Some(&Sent::Terminate("end of day".to_string(), TERMINATE_NORMAL))
        );
        assert_eq!(
            session.handler().disconnects,
            vec![DisconnectReason::RemoteDisconnect]
        );
        assert_transitions_legal(&session);
    }

    #[test]
    fn test_disconnect_publishes_held_messages() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = established(&stream, now);
        send(&mut session, b"m").unwrap();
        session
            .on_event(
                ProtocolEvent::ResendRequest {
                    begin_seq_no: SeqNum::new(1),
                    end_seq_no: SeqNum::new(1),
                },
                now,
            )
            .unwrap();
        send(&mut session, b"held").unwrap();

        session.on_disconnect();
        assert_eq!(session.state(), SessionState::Unbound);
        assert_eq!(session.held_count(), 0);
        assert_eq!(stream.fragment_count(), 2);

        session.on_disconnect();
        assert_eq!(session.handler().disconnects.len(), 1);
    }

    #[test]
    fn test_events_after_unbind_are_ignored() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = established(&stream, now);
        session.on_disconnect();

        session
            .on_event(
                ProtocolEvent::BusinessMessage {
                    seq_no: SeqNum::new(1),
                    possible_retransmission: false,
                },
                now,
            )
            .unwrap();
        assert!(session.handler().messages.is_empty());
    }

    #[test]
    fn test_unexpected_handshake_message_is_violation() {
        let stream = RecordedStream::new(StreamId::OUTBOUND, 4096);
        let now = Instant::now();
        let mut session = established(&stream, now);

        let result = session.on_event(ProtocolEvent::Negotiate { uuid: IDENTITY.uuid() }, now);
        assert!(matches!(result, Err(SessionError::ProtocolViolation { .. })));
        assert_transitions_legal(&session);
    }
}
