//! Common utilities shared across examples.

#![allow(dead_code)]

use std::env;
use std::path::PathBuf;

use bytes::{BufMut, BytesMut};
use crossbeam_channel::Sender;
use tracing::{info, warn};

use ironlink_core::error::SessionError;
use ironlink_core::message::{ReplayRequest, TemplateId};
use ironlink_core::types::{SeqNum, SessionIdentity};
use ironlink_engine::SbeReplayEncoder;
use ironlink_session::{SessionHandler, SessionProxy, SessionState};

/// Default session uuid.
pub const DEFAULT_SESSION: u64 = 0x1_0000_0001;

/// NewOrderSingle template id.
pub const NEW_ORDER: TemplateId = TemplateId(514);

/// Mass quote template id; gap filled on replay.
pub const MASS_QUOTE: TemplateId = TemplateId(517);

/// Example configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ExampleConfig {
    /// Directory holding the index files.
    pub log_dir: PathBuf,
    /// Session uuid.
    pub session: SessionIdentity,
    /// Number of business messages to send.
    pub messages: u64,
}

impl ExampleConfig {
    /// Creates a configuration whose index directory is unique to `name`
    /// unless `IRONLINK_LOG_DIR` is set.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            log_dir: env::var("IRONLINK_LOG_DIR").map_or_else(
                |_| env::temp_dir().join(format!("ironlink-{name}-{}", std::process::id())),
                PathBuf::from,
            ),
            session: SessionIdentity::new(
                env::var("IRONLINK_SESSION")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_SESSION),
            ),
            messages: env::var("IRONLINK_MESSAGES")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or(20),
        }
    }
}

/// Initializes logging for examples.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .try_init();
}

/// Encodes a small SBE business message.
pub fn encode_message(template_id: TemplateId, seq_no: u64) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(16);
    SbeReplayEncoder::default().encode_header(template_id, 8, &mut buf);
    buf.put_u64_le(seq_no);
    buf.to_vec()
}

/// Proxy that logs every session-level message instead of encoding it.
#[derive(Debug, Default)]
pub struct LoggingProxy;

impl SessionProxy for LoggingProxy {
    fn send_negotiate(&mut self, session: SessionIdentity) -> Result<(), SessionError> {
        info!(%session, "-> Negotiate");
        Ok(())
    }

    fn send_negotiation_response(&mut self, session: SessionIdentity) -> Result<(), SessionError> {
        info!(%session, "-> NegotiationResponse");
        Ok(())
    }

    fn send_establish(
        &mut self,
        session: SessionIdentity,
        next_seq_no: SeqNum,
        keepalive_interval_ms: u64,
    ) -> Result<(), SessionError> {
        info!(%session, %next_seq_no, keepalive_interval_ms, "-> Establish");
        Ok(())
    }

    fn send_establishment_ack(
        &mut self,
        session: SessionIdentity,
        next_seq_no: SeqNum,
        previous_seq_no: SeqNum,
        _keepalive_interval_ms: u64,
    ) -> Result<(), SessionError> {
        info!(%session, %next_seq_no, %previous_seq_no, "-> EstablishmentAck");
        Ok(())
    }

    fn send_sequence(
        &mut self,
        session: SessionIdentity,
        next_seq_no: SeqNum,
        keepalive_lapsed: bool,
    ) -> Result<(), SessionError> {
        info!(%session, %next_seq_no, keepalive_lapsed, "-> Sequence");
        Ok(())
    }

    fn send_retransmit_request(
        &mut self,
        session: SessionIdentity,
        begin_seq_no: SeqNum,
        end_seq_no: SeqNum,
    ) -> Result<(), SessionError> {
        info!(%session, %begin_seq_no, %end_seq_no, "-> RetransmitRequest");
        Ok(())
    }

    fn send_terminate(
        &mut self,
        session: SessionIdentity,
        reason: &str,
        error_codes: u32,
    ) -> Result<(), SessionError> {
        info!(%session, reason, error_codes, "-> Terminate");
        Ok(())
    }
}

/// Handler forwarding resend requests to the engine.
#[derive(Debug)]
pub struct ForwardingHandler {
    requests: Sender<ReplayRequest>,
}

impl ForwardingHandler {
    /// Creates a handler sending requests to `requests`.
    #[must_use]
    pub fn new(requests: Sender<ReplayRequest>) -> Self {
        Self { requests }
    }
}

impl SessionHandler for ForwardingHandler {
    fn on_replay_request(&mut self, request: ReplayRequest) {
        if self.requests.send(request).is_err() {
            warn!(?request, "engine gone, replay request dropped");
        }
    }

    fn on_state_change(&mut self, session: SessionIdentity, from: SessionState, to: SessionState) {
        info!(%session, %from, %to, "state change");
    }

    fn on_terminal(&mut self, session: SessionIdentity, error: &SessionError) {
        warn!(%session, %error, "session failed");
    }
}
