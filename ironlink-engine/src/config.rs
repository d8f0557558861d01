/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Engine configuration.
//!
//! This module provides a builder-style configuration for the indexing and
//! replay agents.

use crate::agent::IdleStrategy;
use ironlink_core::error::SessionError;
use ironlink_core::message::TemplateId;
use ironlink_core::types::Direction;
use ironlink_store::sequence_index::DEFAULT_COMPACT_THRESHOLD;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What the replayer does when a requested sequence number has no index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexGapPolicy {
    /// Cover the missing range with a gap fill and report the gap.
    #[default]
    GapFill,
    /// Fail the replay; the session terminates.
    Abort,
}

/// Configuration of the recovery engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the durable index files.
    log_dir: PathBuf,
    /// Keep a replay index of inbound messages.
    archive_inbound: bool,
    /// Keep a replay index of outbound messages; without it replays become gap fills.
    archive_outbound: bool,
    /// Templates replayed as gap fills instead of their original bytes.
    gap_fill_templates: HashSet<TemplateId>,
    /// Reaction to missing index entries during replay.
    index_gap_policy: IndexGapPolicy,
    /// Fragments an indexer consumes per duty cycle.
    fragment_limit: usize,
    /// Messages a replayer handles per duty cycle.
    replay_batch_size: usize,
    /// Sequence number records appended before an index file is compacted.
    compact_threshold: usize,
    /// Shortest idle sleep of the agent runner.
    idle_min: Duration,
    /// Longest idle sleep of the agent runner.
    idle_max: Duration,
}

impl EngineConfig {
    /// Creates a configuration storing its indices under `log_dir`.
    #[must_use]
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        let idle = IdleStrategy::default();
        Self {
            log_dir: log_dir.into(),
            archive_inbound: true,
            archive_outbound: true,
            gap_fill_templates: HashSet::new(),
            index_gap_policy: IndexGapPolicy::default(),
            fragment_limit: 64,
            replay_batch_size: 32,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            idle_min: idle.min,
            idle_max: idle.max,
        }
    }

    /// Enables or disables archiving of one direction.
    #[must_use]
    pub const fn with_archiving(mut self, direction: Direction, enabled: bool) -> Self {
        match direction {
            Direction::Inbound => self.archive_inbound = enabled,
            Direction::Outbound => self.archive_outbound = enabled,
        }
        self
    }

    /// Adds a template that is gap filled instead of replayed.
    #[must_use]
    pub fn with_gap_fill_template(mut self, template_id: TemplateId) -> Self {
        self.gap_fill_templates.insert(template_id);
        self
    }

    /// Sets the index gap policy.
    #[must_use]
    pub const fn with_index_gap_policy(mut self, policy: IndexGapPolicy) -> Self {
        self.index_gap_policy = policy;
        self
    }

    /// Sets the indexer fragment limit.
    #[must_use]
    pub const fn with_fragment_limit(mut self, limit: usize) -> Self {
        self.fragment_limit = limit;
        self
    }

    /// Sets the replay batch size.
    #[must_use]
    pub const fn with_replay_batch_size(mut self, size: usize) -> Self {
        self.replay_batch_size = size;
        self
    }

    /// Sets how many sequence number records accumulate before compaction.
    #[must_use]
    pub const fn with_compact_threshold(mut self, threshold: usize) -> Self {
        self.compact_threshold = threshold;
        self
    }

    /// Sets the idle sleep bounds of the agent runner.
    #[must_use]
    pub fn with_idle_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.idle_min = min;
        self.idle_max = max;
        self
    }

    /// Returns the index directory.
    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Returns whether `direction` is archived.
    #[must_use]
    pub const fn is_archiving(&self, direction: Direction) -> bool {
        match direction {
            Direction::Inbound => self.archive_inbound,
            Direction::Outbound => self.archive_outbound,
        }
    }

    /// Returns the templates replayed as gap fills.
    #[must_use]
    pub fn gap_fill_templates(&self) -> &HashSet<TemplateId> {
        &self.gap_fill_templates
    }

    /// Returns the index gap policy.
    #[must_use]
    pub const fn index_gap_policy(&self) -> IndexGapPolicy {
        self.index_gap_policy
    }

    /// Returns the indexer fragment limit.
    #[must_use]
    pub const fn fragment_limit(&self) -> usize {
        self.fragment_limit
    }

    /// Returns the replay batch size.
    #[must_use]
    pub const fn replay_batch_size(&self) -> usize {
        self.replay_batch_size
    }

    /// Returns the sequence number index compaction threshold.
    #[must_use]
    pub const fn compact_threshold(&self) -> usize {
        self.compact_threshold
    }

    /// Returns the idle strategy for the agent runner.
    #[must_use]
    pub const fn idle_strategy(&self) -> IdleStrategy {
        IdleStrategy::new(self.idle_min, self.idle_max)
    }

    /// Checks the configuration for values the agents cannot run with.
    ///
    /// # Errors
    /// Returns `SessionError::Configuration` describing the first bad value.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.fragment_limit == 0 {
            return Err(SessionError::Configuration(
                "fragment_limit must be at least 1".to_string(),
            ));
        }
        if self.replay_batch_size == 0 {
            return Err(SessionError::Configuration(
                "replay_batch_size must be at least 1".to_string(),
            ));
        }
        if self.compact_threshold == 0 {
            return Err(SessionError::Configuration(
                "compact_threshold must be at least 1".to_string(),
            ));
        }
        if self.idle_min > self.idle_max {
            return Err(SessionError::Configuration(
                "idle_min must not exceed idle_max".to_string(),
            ));
        }
        Ok(())
    }
}
