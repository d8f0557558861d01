/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Gap filler agent.
//!
//! Runs in place of the [`Replayer`](crate::replayer::Replayer) when outbound
//! messages are not archived: every resend request is answered with a single
//! gap fill covering the whole range.

use crate::agent::Agent;
use crate::encoder::ReplayEncoder;
use crate::replayer::ReplayOutcome;
use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender};
use ironlink_core::error::{IronLinkError, StreamError};
use ironlink_core::message::{Fragment, FragmentFlags, FragmentHeader, ReplayRequest, TemplateId};
use ironlink_core::types::{SeqNum, SessionIdentity, StreamId};
use ironlink_store::sequence_index::SequenceNumberIndex;
use ironlink_transport::traits::Publication;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Resolves the last sequence number a request covers.
///
/// Open-ended requests run to the last sent sequence number known to the
/// sequence number index; `None` means there is nothing to send.
pub(crate) fn resolve_end(
    request: &ReplayRequest,
    sequence_numbers: &SequenceNumberIndex,
) -> Option<SeqNum> {
    let end = if request.is_open_ended() {
        sequence_numbers.last_sent_seq_no(request.session)?
    } else {
        request.end_seq_no
    };
    (request.begin_seq_no.is_valid() && end >= request.begin_seq_no).then_some(end)
}

/// Builds a replay stream gap fill covering `[begin, end]`.
pub(crate) fn gap_fill_fragment(
    encoder: &dyn ReplayEncoder,
    session: SessionIdentity,
    begin: SeqNum,
    end: SeqNum,
) -> Fragment {
    let mut body = BytesMut::with_capacity(encoder.gap_fill_length());
    encoder.encode_gap_fill(session, begin, end.next(), &mut body);
    let header = FragmentHeader::new(StreamId::REPLAY, session, begin, TemplateId::GAP_FILL)
        .with_flags(FragmentFlags::RETRANSMISSION);
    Fragment::new(header, body.freeze())
}

/// Hands an outcome back to the session side.
pub(crate) fn send_outcome(outcomes: &Sender<ReplayOutcome>, agent: &str, outcome: ReplayOutcome) {
    if outcomes.send(outcome).is_err() {
        warn!(agent, "replay outcome dropped, no receiver");
    }
}

/// Answers resend requests with gap fills only.
pub struct GapFiller {
    name: String,
    requests: Receiver<ReplayRequest>,
    outcomes: Sender<ReplayOutcome>,
    publication: Arc<dyn Publication>,
    sequence_numbers: Arc<SequenceNumberIndex>,
    encoder: Arc<dyn ReplayEncoder>,
    pending: VecDeque<ReplayRequest>,
    batch_size: usize,
}

impl GapFiller {
    /// Creates a gap filler publishing onto the replay stream.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        requests: Receiver<ReplayRequest>,
        outcomes: Sender<ReplayOutcome>,
        publication: Arc<dyn Publication>,
        sequence_numbers: Arc<SequenceNumberIndex>,
        encoder: Arc<dyn ReplayEncoder>,
        batch_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            requests,
            outcomes,
            publication,
            sequence_numbers,
            encoder,
            pending: VecDeque::new(),
            batch_size,
        }
    }

    /// Returns the number of requests accepted but not yet answered.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for GapFiller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GapFiller")
            .field("name", &self.name)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Agent for GapFiller {
    fn role_name(&self) -> &str {
        &self.name
    }

    fn do_work(&mut self) -> Result<usize, IronLinkError> {
        self.pending.extend(self.requests.try_iter());

        let mut work = 0;
        while work < self.batch_size {
            let Some(request) = self.pending.front().copied() else {
                break;
            };

            let Some(end) = resolve_end(&request, &self.sequence_numbers) else {
                debug!(agent = %self.name, ?request, "nothing to gap fill");
                self.pending.pop_front();
                send_outcome(
                    &self.outcomes,
                    &self.name,
                    ReplayOutcome::Completed {
                        request,
                        replayed: 0,
                        gap_filled: 0,
                    },
                );
                work += 1;
                continue;
            };

            let fragment =
                gap_fill_fragment(self.encoder.as_ref(), request.session, request.begin_seq_no, end);
            match self.publication.offer(fragment.header, &fragment.body) {
                Ok(position) => {
                    info!(
                        agent = %self.name,
                        session = %request.session,
                        begin = %request.begin_seq_no,
                        end = %end,
                        position,
                        "gap filled resend request"
                    );
                    self.pending.pop_front();
                    send_outcome(
                        &self.outcomes,
                        &self.name,
                        ReplayOutcome::Completed {
                            request,
                            replayed: 0,
                            gap_filled: 1,
                        },
                    );
                    work += 1;
                }
                Err(StreamError::BackPressured) => break,
                Err(err) => {
                    self.pending.pop_front();
                    send_outcome(
                        &self.outcomes,
                        &self.name,
                        ReplayOutcome::Failed {
                            request,
                            reason: err.to_string(),
                        },
                    );
                    return Err(err.into());
                }
            }
        }
        Ok(work)
    }
}
