//! Restart and Resume Example
//!
//! This example shows sequence numbers surviving an engine restart:
//! - A first engine indexes a batch of outbound and inbound messages
//! - The engine shuts down gracefully
//! - A second engine recovers its indices from the same directory
//! - A new session resumes from the recovered sequence numbers
//!
//! Run twice with the same `IRONLINK_LOG_DIR` to resume across processes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::info;

use ironlink_core::message::FragmentHeader;
use ironlink_core::types::{ConnectionId, Direction, SeqNum, StreamId};
use ironlink_engine::{Engine, EngineBuilder, EngineStreams};
use ironlink_session::{Session, SessionConfig, SessionRole};
use ironlink_transport::{Publication, RecordedStream};

mod common;
use common::{ExampleConfig, ForwardingHandler, LoggingProxy, NEW_ORDER, encode_message, init_logging};

const STREAM_WINDOW: usize = 1 << 20;

struct Streams {
    inbound: RecordedStream,
    outbound: RecordedStream,
    replay: RecordedStream,
}

impl Streams {
    fn new() -> Self {
        Self {
            inbound: RecordedStream::new(StreamId::INBOUND, STREAM_WINDOW),
            outbound: RecordedStream::new(StreamId::OUTBOUND, STREAM_WINDOW),
            replay: RecordedStream::new(StreamId::REPLAY, STREAM_WINDOW),
        }
    }

    fn open(&self, cfg: &ExampleConfig) -> anyhow::Result<Engine> {
        let engine = EngineBuilder::new(&cfg.log_dir).build(EngineStreams::recorded(
            &self.inbound,
            &self.outbound,
            &self.replay,
        ))?;
        Ok(engine)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cfg = ExampleConfig::new("restart");
    info!(log_dir = %cfg.log_dir.display(), session = %cfg.session, "starting restart example");

    {
        let streams = Streams::new();
        let mut engine = streams.open(&cfg)?;
        let recovered = engine.sequence_numbers().last_sent_seq_no(cfg.session);
        if let Some(last_sent) = recovered {
            info!(%last_sent, "indices already hold this session, skipping the first run");
        } else {
            let handle = engine.start().context("engine agents already started")?;
            for n in 1..=cfg.messages {
                let seq_no = SeqNum::new(n);
                let body = encode_message(NEW_ORDER, n);
                streams.outbound.offer(
                    FragmentHeader::new(StreamId::OUTBOUND, cfg.session, seq_no, NEW_ORDER),
                    &body,
                )?;
                streams.inbound.offer(
                    FragmentHeader::new(StreamId::INBOUND, cfg.session, seq_no, NEW_ORDER),
                    &body,
                )?;
            }

            for direction in [Direction::Inbound, Direction::Outbound] {
                let stream = match direction {
                    Direction::Inbound => &streams.inbound,
                    Direction::Outbound => &streams.outbound,
                };
                while engine.completion(direction).position() < stream.position() {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
            handle.shutdown().await?;
            info!(messages = cfg.messages, "first run indexed and stopped");
        }
    }

    let streams = Streams::new();
    let engine = streams.open(&cfg)?;
    for record in engine.sequence_numbers().snapshot() {
        info!(
            session = %record.session,
            last_sent = %record.last_sent_seq_no,
            last_received = %record.last_received_seq_no,
            "recovered sequence numbers"
        );
    }

    let mut session = Session::new(
        SessionConfig::new(cfg.session, SessionRole::Initiator),
        ConnectionId(2),
        Arc::new(streams.outbound.clone()),
        LoggingProxy,
        ForwardingHandler::new(engine.replay_requests()),
        Instant::now(),
    )?;
    if engine.resume(&mut session)? {
        info!(
            next_sent = %session.next_sent_seq_no(),
            next_recv = %session.next_recv_seq_no(),
            "session resumed"
        );
    } else {
        info!("nothing to resume, starting from the first sequence number");
    }
    Ok(())
}
