/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! The recovery engine.
//!
//! An [`Engine`] owns the durable indices of both directions and the agents
//! that maintain and serve them:
//!
//! - one [`Indexer`] per direction, feeding the shared sequence number index
//!   and, when that direction is archived, its replay index;
//! - a [`Replayer`] when outbound messages are archived, a [`GapFiller`]
//!   otherwise.
//!
//! Sessions live on the owner's side. They resume from
//! [`Engine::resume`], forward resend requests through
//! [`Engine::request_replay`] and learn how they ended from
//! [`Engine::poll_outcomes`].

use crate::agent::{AgentHandle, AgentRunner, CompositeAgent};
use crate::completion::CompletionPosition;
use crate::config::EngineConfig;
use crate::encoder::ReplayEncoder;
use crate::error_handler::ErrorHandler;
use crate::gap_filler::GapFiller;
use crate::indexer::Indexer;
use crate::replayer::{ReplayOutcome, Replayer};
use crossbeam_channel::{Receiver, Sender, unbounded};
use ironlink_core::error::{IronLinkError, SessionError, StoreError, StreamError};
use ironlink_core::message::ReplayRequest;
use ironlink_core::types::{Direction, RecordingId, StreamId};
use ironlink_session::{Session, SessionHandler, SessionProxy};
use ironlink_store::replay_index::{ReplayIndex, ReplayIndexWriter};
use ironlink_store::replay_query::ReplayQuery;
use ironlink_store::sequence_index::{SequenceNumberIndex, SequenceNumberIndexWriter};
use ironlink_store::traits::MessageLog;
use ironlink_transport::recorded::RecordedStream;
use ironlink_transport::traits::{Publication, Subscription};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// The streams an engine consumes and publishes to.
pub struct EngineStreams {
    /// Messages received from counterparties.
    pub inbound: Box<dyn Subscription>,
    /// Messages sent to counterparties.
    pub outbound: Box<dyn Subscription>,
    /// Recording of the inbound stream.
    pub inbound_recording: RecordingId,
    /// Recording of the outbound stream.
    pub outbound_recording: RecordingId,
    /// Reads archived outbound messages back for replays.
    pub outbound_log: Arc<dyn MessageLog>,
    /// Where replayed messages and gap fills are published.
    pub replay: Arc<dyn Publication>,
}

impl EngineStreams {
    /// Wires an engine to in-memory recorded streams.
    #[must_use]
    pub fn recorded(
        inbound: &RecordedStream,
        outbound: &RecordedStream,
        replay: &RecordedStream,
    ) -> Self {
        Self {
            inbound: Box::new(inbound.subscribe()),
            outbound: Box::new(outbound.subscribe()),
            inbound_recording: inbound.recording_id(),
            outbound_recording: outbound.recording_id(),
            outbound_log: Arc::new(outbound.clone()),
            replay: Arc::new(replay.clone()),
        }
    }
}

impl std::fmt::Debug for EngineStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineStreams")
            .field("inbound", &self.inbound.stream_id())
            .field("outbound", &self.outbound.stream_id())
            .field("replay", &self.replay.stream_id())
            .finish_non_exhaustive()
    }
}

/// Durable indices plus the agents serving them.
pub struct Engine {
    config: EngineConfig,
    sequence_numbers: Arc<SequenceNumberIndex>,
    inbound_replay: Option<Arc<ReplayIndex>>,
    outbound_replay: Option<Arc<ReplayIndex>>,
    inbound_completion: Arc<CompletionPosition>,
    outbound_completion: Arc<CompletionPosition>,
    replay_requests: Sender<ReplayRequest>,
    replay_outcomes: Receiver<ReplayOutcome>,
    agent: Option<CompositeAgent>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl Engine {
    /// Opens every index under the configured directory and creates the
    /// agents. Index files left by a previous run are recovered first.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or an index file
    /// cannot be opened.
    pub fn open(
        config: EngineConfig,
        streams: EngineStreams,
        encoder: Arc<dyn ReplayEncoder>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Result<Self, IronLinkError> {
        config.validate()?;
        let dir = config.log_dir();
        std::fs::create_dir_all(dir).map_err(StoreError::from)?;

        let sequence_numbers = Arc::new(SequenceNumberIndex::new());

        let (inbound_indexer, inbound_replay) = open_indexer(
            &config,
            dir,
            Direction::Inbound,
            streams.inbound,
            streams.inbound_recording,
            &sequence_numbers,
            &error_handler,
        )?;
        let (outbound_indexer, outbound_replay) = open_indexer(
            &config,
            dir,
            Direction::Outbound,
            streams.outbound,
            streams.outbound_recording,
            &sequence_numbers,
            &error_handler,
        )?;

        let inbound_completion = Arc::clone(inbound_indexer.completion());
        let outbound_completion = Arc::clone(outbound_indexer.completion());

        let (replay_requests, request_rx) = unbounded();
        let (outcome_tx, replay_outcomes) = unbounded();

        let mut agent = CompositeAgent::new("ironlink-engine")
            .with_agent(inbound_indexer)
            .with_agent(outbound_indexer);

        match &outbound_replay {
            Some(index) => agent.push(
                Replayer::new(
                    "replayer",
                    request_rx,
                    outcome_tx,
                    streams.replay,
                    ReplayQuery::new(Arc::clone(index), streams.outbound_log),
                    Arc::clone(&sequence_numbers),
                    encoder,
                    Arc::clone(&error_handler),
                )
                .with_gap_fill_templates(config.gap_fill_templates().clone())
                .with_index_gap_policy(config.index_gap_policy())
                .with_batch_size(config.replay_batch_size()),
            ),
            None => agent.push(GapFiller::new(
                "gap-filler",
                request_rx,
                outcome_tx,
                streams.replay,
                Arc::clone(&sequence_numbers),
                encoder,
                config.replay_batch_size(),
            )),
        }

        info!(
            log_dir = %dir.display(),
            sessions = sequence_numbers.len(),
            archive_inbound = config.is_archiving(Direction::Inbound),
            archive_outbound = config.is_archiving(Direction::Outbound),
            "engine opened"
        );

        Ok(Self {
            config,
            sequence_numbers,
            inbound_replay,
            outbound_replay,
            inbound_completion,
            outbound_completion,
            replay_requests,
            replay_outcomes,
            agent: Some(agent),
            error_handler,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the shared sequence number index.
    #[must_use]
    pub fn sequence_numbers(&self) -> &Arc<SequenceNumberIndex> {
        &self.sequence_numbers
    }

    /// Returns the replay index of a direction, if it is archived.
    #[must_use]
    pub fn replay_index(&self, direction: Direction) -> Option<&Arc<ReplayIndex>> {
        match direction {
            Direction::Inbound => self.inbound_replay.as_ref(),
            Direction::Outbound => self.outbound_replay.as_ref(),
        }
    }

    /// Returns how far a direction has been durably indexed.
    #[must_use]
    pub fn completion(&self, direction: Direction) -> &Arc<CompletionPosition> {
        match direction {
            Direction::Inbound => &self.inbound_completion,
            Direction::Outbound => &self.outbound_completion,
        }
    }

    /// Returns a sender session handlers can forward resend requests to.
    #[must_use]
    pub fn replay_requests(&self) -> Sender<ReplayRequest> {
        self.replay_requests.clone()
    }

    /// Queues a resend request for the replay agent.
    ///
    /// # Errors
    /// Returns `StreamError::Closed` once the agent is gone.
    pub fn request_replay(&self, request: ReplayRequest) -> Result<(), IronLinkError> {
        self.replay_requests
            .send(request)
            .map_err(|_| IronLinkError::from(StreamError::Closed))
    }

    /// Returns every replay outcome produced since the last call.
    #[must_use]
    pub fn poll_outcomes(&self) -> Vec<ReplayOutcome> {
        self.replay_outcomes.try_iter().collect()
    }

    /// Restores a session's sequence numbers from the index.
    ///
    /// Returns false when the index knows nothing about the session, in
    /// which case it starts from the first sequence number.
    ///
    /// # Errors
    /// Returns the session's error if it refuses the record.
    pub fn resume<P: SessionProxy, H: SessionHandler>(
        &self,
        session: &mut Session<P, H>,
    ) -> Result<bool, SessionError> {
        let Some(record) = self.sequence_numbers.lookup(session.identity()) else {
            return Ok(false);
        };
        session.resume(&record)?;
        Ok(true)
    }

    /// Takes the engine's agents to run them on a caller-owned loop.
    ///
    /// Returns `None` if they were already taken or started.
    pub fn take_agent(&mut self) -> Option<CompositeAgent> {
        self.agent.take()
    }

    /// Starts the engine's agents on a tokio task.
    ///
    /// Returns `None` if they were already taken or started.
    pub fn start(&mut self) -> Option<AgentHandle<CompositeAgent>> {
        let agent = self.agent.take()?;
        Some(AgentRunner::spawn(
            agent,
            self.config.idle_strategy(),
            Arc::clone(&self.error_handler),
        ))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("sessions", &self.sequence_numbers.len())
            .field("inbound_completion", &self.inbound_completion)
            .field("outbound_completion", &self.outbound_completion)
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

fn open_indexer(
    config: &EngineConfig,
    dir: &Path,
    direction: Direction,
    subscription: Box<dyn Subscription>,
    recording_id: RecordingId,
    sequence_numbers: &Arc<SequenceNumberIndex>,
    error_handler: &Arc<dyn ErrorHandler>,
) -> Result<(Indexer, Option<Arc<ReplayIndex>>), IronLinkError> {
    let stream_id: StreamId = direction.stream_id();
    let mut indexer = Indexer::new(
        format!("indexer-{direction}"),
        subscription,
        config.fragment_limit(),
        Arc::clone(error_handler),
    )
    .with_index(
        SequenceNumberIndexWriter::open(dir, direction, recording_id, Arc::clone(sequence_numbers))?
            .with_compact_threshold(config.compact_threshold()),
    );

    let mut replay_index = None;
    if config.is_archiving(direction) {
        let index = Arc::new(ReplayIndex::new(stream_id));
        indexer = indexer.with_index(ReplayIndexWriter::open(
            dir,
            recording_id,
            Arc::clone(&index),
        )?);
        replay_index = Some(index);
    }
    Ok((indexer, replay_index))
}
