/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Engine builder for fluent configuration.
//!
//! This module provides a builder API that wires the indexers and the
//! replay agent of an [`Engine`] around a set of [`EngineStreams`].

use crate::config::{EngineConfig, IndexGapPolicy};
use crate::encoder::{ReplayEncoder, SbeReplayEncoder};
use crate::engine::{Engine, EngineStreams};
use crate::error_handler::{ErrorHandler, LoggingErrorHandler};
use ironlink_core::error::IronLinkError;
use ironlink_core::message::TemplateId;
use ironlink_core::types::Direction;
use std::path::PathBuf;
use std::sync::Arc;

/// Builder for configuring a recovery engine.
pub struct EngineBuilder {
    /// Engine configuration.
    config: EngineConfig,
    /// Codec hooks for replays.
    encoder: Arc<dyn ReplayEncoder>,
    /// Receiver of agent errors.
    error_handler: Arc<dyn ErrorHandler>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Creates a builder storing indices under `log_dir`.
    #[must_use]
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self::from_config(EngineConfig::new(log_dir))
    }

    /// Creates a builder from an existing configuration.
    #[must_use]
    pub fn from_config(config: EngineConfig) -> Self {
        Self {
            config,
            encoder: Arc::new(SbeReplayEncoder::default()),
            error_handler: Arc::new(LoggingErrorHandler),
        }
    }

    /// Enables or disables archiving of one direction.
    #[must_use]
    pub fn with_archiving(mut self, direction: Direction, enabled: bool) -> Self {
        self.config = self.config.with_archiving(direction, enabled);
        self
    }

    /// Adds a template that is gap filled instead of replayed.
    #[must_use]
    pub fn with_gap_fill_template(mut self, template_id: TemplateId) -> Self {
        self.config = self.config.with_gap_fill_template(template_id);
        self
    }

    /// Sets the index gap policy.
    #[must_use]
    pub fn with_index_gap_policy(mut self, policy: IndexGapPolicy) -> Self {
        self.config = self.config.with_index_gap_policy(policy);
        self
    }

    /// Sets the replay codec hooks.
    #[must_use]
    pub fn with_encoder(mut self, encoder: impl ReplayEncoder + 'static) -> Self {
        self.encoder = Arc::new(encoder);
        self
    }

    /// Sets the error handler shared by every agent.
    #[must_use]
    pub fn with_error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Returns the configuration built so far.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Opens the indices and creates the engine.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or an index file
    /// cannot be opened.
    pub fn build(self, streams: EngineStreams) -> Result<Engine, IronLinkError> {
        Engine::open(self.config, streams, self.encoder, self.error_handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_engine_builder_default() {
        let builder = EngineBuilder::new("/tmp/ironlink");
        assert_eq!(builder.config().log_dir(), Path::new("/tmp/ironlink"));
        assert!(builder.config().is_archiving(Direction::Outbound));
        assert_eq!(builder.config().index_gap_policy(), IndexGapPolicy::GapFill);
    }

    #[test]
    fn test_engine_builder_settings() {
        let builder = EngineBuilder::new("/tmp/ironlink")
            .with_archiving(Direction::Inbound, false)
            .with_gap_fill_template(TemplateId(520))
            .with_index_gap_policy(IndexGapPolicy::Abort);

        assert!(!builder.config().is_archiving(Direction::Inbound));
        assert!(builder.config().gap_fill_templates().contains(&TemplateId(520)));
        assert_eq!(builder.config().index_gap_policy(), IndexGapPolicy::Abort);
    }
}
