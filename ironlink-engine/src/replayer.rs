/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Replayer agent.
//!
//! Serves resend requests from the outbound replay index. Requests are
//! handled one at a time in arrival order; within a request, messages are
//! published in sequence number order, each flagged as a possible
//! retransmission. Runs of sequence numbers that must not be replayed
//! (configured templates, or index gaps under [`IndexGapPolicy::GapFill`])
//! collapse into a single gap fill.

use crate::agent::Agent;
use crate::config::IndexGapPolicy;
use crate::encoder::ReplayEncoder;
use crate::error_handler::ErrorHandler;
use crate::gap_filler::{gap_fill_fragment, resolve_end, send_outcome};
use crossbeam_channel::{Receiver, Sender};
use ironlink_core::error::{IronLinkError, ReplayError, SessionError, StreamError};
use ironlink_core::message::{Fragment, FragmentFlags, FragmentHeader, ReplayRequest, TemplateId};
use ironlink_core::types::{SeqNum, StreamId};
use ironlink_session::{Session, SessionHandler, SessionProxy};
use ironlink_store::replay_query::{ReplayCursor, ReplayQuery};
use ironlink_store::sequence_index::SequenceNumberIndex;
use ironlink_transport::traits::Publication;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Template id used for recorded messages whose header cannot be read.
const UNKNOWN_TEMPLATE: TemplateId = TemplateId(0);

/// Result of one replay request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Every sequence number in the range was replayed or gap filled.
    Completed {
        /// The request served.
        request: ReplayRequest,
        /// Messages replayed with their original bytes.
        replayed: u64,
        /// Gap fills published.
        gap_filled: u64,
    },
    /// The replay stopped early.
    Failed {
        /// The request that failed.
        request: ReplayRequest,
        /// What went wrong.
        reason: String,
    },
}

impl ReplayOutcome {
    /// Returns the request this outcome answers.
    #[must_use]
    pub const fn request(&self) -> ReplayRequest {
        match self {
            Self::Completed { request, .. } | Self::Failed { request, .. } => *request,
        }
    }

    /// Returns true for a completed replay.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Reports this outcome to the session that asked for it.
    ///
    /// Outcomes for another session are ignored.
    ///
    /// # Errors
    /// Returns the session's error when a failed replay terminates it.
    pub fn apply<P: SessionProxy, H: SessionHandler>(
        &self,
        session: &mut Session<P, H>,
    ) -> Result<(), SessionError> {
        let request = self.request();
        if request.session != session.identity() {
            debug!(outcome = ?self, session = %session.identity(), "outcome for another session");
            return Ok(());
        }
        match self {
            Self::Completed { .. } => {
                session.on_replay_complete();
                Ok(())
            }
            Self::Failed { .. } => {
                session.on_replay_failed(request.begin_seq_no, request.end_seq_no)
            }
        }
    }
}

struct ReplayJob {
    request: ReplayRequest,
    cursor: ReplayCursor,
    fill: Option<(SeqNum, SeqNum)>,
    outbox: VecDeque<Fragment>,
    replayed: u64,
    gap_filled: u64,
}

impl ReplayJob {
    fn extend_fill(&mut self, seq_no: SeqNum) {
        self.fill = match self.fill {
            Some((begin, _)) => Some((begin, seq_no)),
            None => Some((seq_no, seq_no)),
        };
    }
}

enum Step {
    Progress,
    Blocked,
    Finished(ReplayOutcome),
}

/// Replays archived outbound messages onto the replay stream.
pub struct Replayer {
    name: String,
    requests: Receiver<ReplayRequest>,
    outcomes: Sender<ReplayOutcome>,
    publication: Arc<dyn Publication>,
    query: ReplayQuery,
    sequence_numbers: Arc<SequenceNumberIndex>,
    encoder: Arc<dyn ReplayEncoder>,
    gap_fill_templates: HashSet<TemplateId>,
    index_gap_policy: IndexGapPolicy,
    batch_size: usize,
    error_handler: Arc<dyn ErrorHandler>,
    jobs: VecDeque<ReplayJob>,
}

impl Replayer {
    /// Creates a replayer reading through `query`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        requests: Receiver<ReplayRequest>,
        outcomes: Sender<ReplayOutcome>,
        publication: Arc<dyn Publication>,
        query: ReplayQuery,
        sequence_numbers: Arc<SequenceNumberIndex>,
        encoder: Arc<dyn ReplayEncoder>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            requests,
            outcomes,
            publication,
            query,
            sequence_numbers,
            encoder,
            gap_fill_templates: HashSet::new(),
            index_gap_policy: IndexGapPolicy::default(),
            batch_size: 32,
            error_handler,
            jobs: VecDeque::new(),
        }
    }

    /// Sets the templates gap filled instead of replayed.
    #[must_use]
    pub fn with_gap_fill_templates(mut self, templates: HashSet<TemplateId>) -> Self {
        self.gap_fill_templates = templates;
        self
    }

    /// Sets the index gap policy.
    #[must_use]
    pub fn with_index_gap_policy(mut self, policy: IndexGapPolicy) -> Self {
        self.index_gap_policy = policy;
        self
    }

    /// Sets the number of steps per duty cycle.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Returns the number of requests accepted but not finished.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.jobs.len()
    }

    fn accept(&mut self, request: ReplayRequest) {
        match resolve_end(&request, &self.sequence_numbers) {
            Some(end) => {
                debug!(agent = %self.name, ?request, %end, "replay accepted");
                self.jobs.push_back(ReplayJob {
                    request,
                    cursor: self.query.query(request.session, request.begin_seq_no, end),
                    fill: None,
                    outbox: VecDeque::new(),
                    replayed: 0,
                    gap_filled: 0,
                });
            }
            None => {
                debug!(agent = %self.name, ?request, "empty replay range");
                send_outcome(
                    &self.outcomes,
                    &self.name,
                    ReplayOutcome::Completed {
                        request,
                        replayed: 0,
                        gap_filled: 0,
                    },
                );
            }
        }
    }

    fn flush_fill(&self, job: &mut ReplayJob) {
        if let Some((begin, end)) = job.fill.take() {
            job.outbox.push_back(gap_fill_fragment(
                self.encoder.as_ref(),
                job.request.session,
                begin,
                end,
            ));
        }
    }

    fn step(&self, job: &mut ReplayJob) -> Step {
        if let Some(fragment) = job.outbox.front() {
            return match self.publication.offer(fragment.header, &fragment.body) {
                Ok(_) => {
                    if fragment.header.template_id == TemplateId::GAP_FILL {
                        job.gap_filled += 1;
                    } else {
                        job.replayed += 1;
                    }
                    job.outbox.pop_front();
                    Step::Progress
                }
                Err(StreamError::BackPressured) => Step::Blocked,
                Err(err) => {
                    self.error_handler
                        .on_error(&self.name, &IronLinkError::from(err.clone()));
                    Step::Finished(ReplayOutcome::Failed {
                        request: job.request,
                        reason: err.to_string(),
                    })
                }
            };
        }

        match job.cursor.next() {
            None if job.fill.is_some() => {
                self.flush_fill(job);
                Step::Progress
            }
            None => Step::Finished(ReplayOutcome::Completed {
                request: job.request,
                replayed: job.replayed,
                gap_filled: job.gap_filled,
            }),
            Some(Ok(message)) => {
                let template_id = self.encoder.template_id(&message.bytes);
                if template_id.is_some_and(|id| self.gap_fill_templates.contains(&id)) {
                    job.extend_fill(message.seq_no);
                } else {
                    self.flush_fill(job);
                    let header = FragmentHeader::new(
                        StreamId::REPLAY,
                        job.request.session,
                        message.seq_no,
                        template_id.unwrap_or(UNKNOWN_TEMPLATE),
                    )
                    .with_flags(FragmentFlags::RETRANSMISSION);
                    job.outbox.push_back(Fragment::new(header, message.bytes));
                }
                Step::Progress
            }
            Some(Err(err @ ReplayError::IndexGap { seq_no, .. })) => {
                self.error_handler
                    .on_error(&self.name, &IronLinkError::from(err.clone()));
                match self.index_gap_policy {
                    IndexGapPolicy::GapFill => {
                        warn!(agent = %self.name, session = %job.request.session, seq_no, "gap filling missing index entry");
                        job.extend_fill(SeqNum::new(seq_no));
                        Step::Progress
                    }
                    IndexGapPolicy::Abort => Step::Finished(ReplayOutcome::Failed {
                        request: job.request,
                        reason: err.to_string(),
                    }),
                }
            }
            Some(Err(err)) => {
                self.error_handler
                    .on_error(&self.name, &IronLinkError::from(err.clone()));
                Step::Finished(ReplayOutcome::Failed {
                    request: job.request,
                    reason: err.to_string(),
                })
            }
        }
    }
}

impl std::fmt::Debug for Replayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replayer")
            .field("name", &self.name)
            .field("pending", &self.jobs.len())
            .field("index_gap_policy", &self.index_gap_policy)
            .finish_non_exhaustive()
    }
}

impl Agent for Replayer {
    fn role_name(&self) -> &str {
        &self.name
    }

    fn do_work(&mut self) -> Result<usize, IronLinkError> {
        let incoming: Vec<ReplayRequest> = self.requests.try_iter().collect();
        for request in incoming {
            self.accept(request);
        }

        let mut work = 0;
        while work < self.batch_size {
            let Some(mut job) = self.jobs.pop_front() else {
                break;
            };
            match self.step(&mut job) {
                Step::Progress => {
                    work += 1;
                    self.jobs.push_front(job);
                }
                Step::Blocked => {
                    self.jobs.push_front(job);
                    break;
                }
                Step::Finished(outcome) => {
                    work += 1;
                    match &outcome {
                        ReplayOutcome::Completed {
                            request,
                            replayed,
                            gap_filled,
                        } => info!(
                            agent = %self.name,
                            session = %request.session,
                            begin = %request.begin_seq_no,
                            replayed,
                            gap_filled,
                            "replay complete"
                        ),
                        ReplayOutcome::Failed { request, reason } => warn!(
                            agent = %self.name,
                            session = %request.session,
                            begin = %request.begin_seq_no,
                            %reason,
                            "replay failed"
                        ),
                    }
                    send_outcome(&self.outcomes, &self.name, outcome);
                }
            }
        }
        Ok(work)
    }
}
