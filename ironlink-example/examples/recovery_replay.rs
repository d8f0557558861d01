//! Session Recovery Replay Example
//!
//! This example walks one initiator session through a retransmission:
//! - The session establishes and sends a mix of orders and mass quotes
//! - The engine indexes every outbound message on a background task
//! - The counterparty asks for a resend of part of that range
//! - Orders are replayed with their original bytes, quotes become a gap fill
//! - The session returns to `ESTABLISHED` once the replay completes
//!
//! Run with `cargo run --example recovery_replay`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use tracing::info;

use ironlink_core::message::ProtocolEvent;
use ironlink_core::types::{ConnectionId, Direction, SeqNum, StreamId};
use ironlink_engine::{
    Engine, EngineBuilder, EngineStreams, ReplayEncoder, ReplayOutcome, SbeReplayEncoder,
};
use ironlink_session::{Session, SessionConfig, SessionRole, SessionState};
use ironlink_transport::{Publication, RecordedStream};

mod common;
use common::{
    ExampleConfig, ForwardingHandler, LoggingProxy, MASS_QUOTE, NEW_ORDER, encode_message,
    init_logging,
};

const STREAM_WINDOW: usize = 1 << 20;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cfg = ExampleConfig::new("replay");
    info!(log_dir = %cfg.log_dir.display(), session = %cfg.session, "starting recovery replay example");

    let inbound = RecordedStream::new(StreamId::INBOUND, STREAM_WINDOW);
    let outbound = RecordedStream::new(StreamId::OUTBOUND, STREAM_WINDOW);
    let replay = RecordedStream::new(StreamId::REPLAY, STREAM_WINDOW);

    let mut engine = EngineBuilder::new(&cfg.log_dir)
        .with_gap_fill_template(MASS_QUOTE)
        .build(EngineStreams::recorded(&inbound, &outbound, &replay))?;
    let handle = engine.start().context("engine agents already started")?;

    let now = Instant::now();
    let mut session = Session::new(
        SessionConfig::new(cfg.session, SessionRole::Initiator),
        ConnectionId(1),
        Arc::new(outbound.clone()),
        LoggingProxy,
        ForwardingHandler::new(engine.replay_requests()),
        now,
    )?;

    session.poll(now)?;
    session.on_event(
        ProtocolEvent::NegotiationResponse {
            uuid: cfg.session.uuid(),
        },
        now,
    )?;
    session.on_event(
        ProtocolEvent::EstablishmentAck {
            next_seq_no: SeqNum::FIRST,
            previous_seq_no: SeqNum::new(0),
            keepalive_interval_ms: 0,
        },
        now,
    )?;

    // Every third message is a quote.
    for n in 1..=cfg.messages {
        let template = if n % 3 == 0 { MASS_QUOTE } else { NEW_ORDER };
        let body = encode_message(template, n);
        let mut claim = session.claim_message(template, body.len())?;
        claim.put_slice(&body);
        let seq_no = session.commit(claim)?;
        info!(%seq_no, %template, "sent");
    }

    let completion = Arc::clone(engine.completion(Direction::Outbound));
    while completion.position() < outbound.position() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    info!(position = completion.position(), "outbound stream indexed");

    let begin = SeqNum::new(cfg.messages / 2);
    session.on_event(
        ProtocolEvent::ResendRequest {
            begin_seq_no: begin,
            end_seq_no: SeqNum::new(0),
        },
        now,
    )?;

    let outcome = wait_for_outcome(&engine).await?;
    outcome.apply(&mut session)?;

    let encoder = SbeReplayEncoder::default();
    for fragment in replay.fragments() {
        match encoder.decode_gap_fill(&fragment.body) {
            Some((_, gap_begin, new_seq_no)) => {
                info!(%gap_begin, %new_seq_no, "<- gap fill")
            }
            None => info!(
                seq_no = %fragment.header.seq_no,
                template = ?encoder.template_id(&fragment.body),
                "<- replayed"
            ),
        }
    }

    if session.state() != SessionState::Established {
        bail!("session ended in {}", session.state());
    }
    info!(next_seq_no = %session.next_sent_seq_no(), "session back to established");

    let agent = handle.shutdown().await?;
    info!(agent = ?agent, "engine stopped");
    Ok(())
}

async fn wait_for_outcome(engine: &Engine) -> anyhow::Result<ReplayOutcome> {
    for _ in 0..1_000 {
        if let Some(outcome) = engine.poll_outcomes().into_iter().next() {
            return Ok(outcome);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    bail!("no replay outcome within one second")
}
