/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Indexer agent.
//!
//! One indexer consumes one direction's stream and feeds every fragment to
//! its indices. Each index writes on its own thread; the indexer polls them
//! and does not take the next batch until the current one is durable. The
//! subscription is committed, and the completion position advanced, only
//! after every index reported the batch durable; until then publishers stay
//! held back by the transport window.

use crate::agent::Agent;
use crate::completion::CompletionPosition;
use crate::error_handler::ErrorHandler;
use ironlink_core::error::{IronLinkError, StoreError};
use ironlink_store::traits::Index;
use ironlink_transport::traits::Subscription;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Feeds a stream into durable indices.
pub struct Indexer {
    name: String,
    subscription: Box<dyn Subscription>,
    indices: Vec<Box<dyn Index>>,
    completion: Arc<CompletionPosition>,
    fragment_limit: usize,
    error_handler: Arc<dyn ErrorHandler>,
    /// Fragments of the batch waiting for its durable write.
    unsynced: usize,
}

impl Indexer {
    /// Creates an indexer with no indices.
    ///
    /// # Arguments
    /// * `name` - Agent name
    /// * `subscription` - Stream to consume
    /// * `fragment_limit` - Fragments consumed per duty cycle
    /// * `error_handler` - Receives durability failures
    pub fn new(
        name: impl Into<String>,
        subscription: Box<dyn Subscription>,
        fragment_limit: usize,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        let completion = Arc::new(CompletionPosition::new(subscription.stream_id()));
        Self {
            name: name.into(),
            subscription,
            indices: Vec::new(),
            completion,
            fragment_limit,
            error_handler,
            unsynced: 0,
        }
    }

    /// Adds an index.
    #[must_use]
    pub fn with_index(mut self, index: impl Index + 'static) -> Self {
        self.indices.push(Box::new(index));
        self
    }

    /// Returns the completion position of this indexer.
    #[must_use]
    pub fn completion(&self) -> &Arc<CompletionPosition> {
        &self.completion
    }

    /// Returns the names of the configured indices.
    #[must_use]
    pub fn index_names(&self) -> Vec<&str> {
        self.indices.iter().map(|index| index.name()).collect()
    }

    /// Returns the number of fragments whose durable write is still running.
    #[must_use]
    pub const fn unsynced(&self) -> usize {
        self.unsynced
    }

    fn on_failure(&mut self, err: StoreError) {
        error!(agent = %self.name, error = %err, "indexing failed, rewinding");
        self.unsynced = 0;
        self.subscription.rewind();
        self.error_handler
            .on_error(&self.name, &IronLinkError::from(err));
    }

    fn stage_batch(&mut self) -> Result<usize, StoreError> {
        let fragments = self.subscription.poll(self.fragment_limit);
        for fragment in &fragments {
            for index in &mut self.indices {
                index.on_fragment(fragment)?;
            }
        }
        Ok(fragments.len())
    }

    /// Polls every index; true once all of them are durable.
    fn poll_durable(&mut self) -> Result<bool, StoreError> {
        let mut durable = true;
        for index in &mut self.indices {
            durable &= index.sync()?.is_durable();
        }
        Ok(durable)
    }

    fn acknowledge(&mut self) -> usize {
        let count = std::mem::take(&mut self.unsynced);
        self.subscription.commit();
        let position = self.subscription.committed_position();
        self.completion.advance(position);
        debug!(agent = %self.name, count, position, "indexed fragments");
        count
    }

    fn step(&mut self) -> Result<usize, StoreError> {
        if self.unsynced == 0 {
            self.unsynced = self.stage_batch()?;
            if self.unsynced == 0 {
                return Ok(0);
            }
        }
        if self.poll_durable()? {
            Ok(self.acknowledge())
        } else {
            Ok(0)
        }
    }
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("name", &self.name)
            .field("indices", &self.index_names())
            .field("completion", &self.completion)
            .field("unsynced", &self.unsynced)
            .finish_non_exhaustive()
    }
}

impl Agent for Indexer {
    fn role_name(&self) -> &str {
        &self.name
    }

    fn do_work(&mut self) -> Result<usize, IronLinkError> {
        match self.step() {
            Ok(count) => Ok(count),
            Err(err) => {
                self.on_failure(err);
                Ok(0)
            }
        }
    }

    /// Waits for the batch in flight so a graceful stop acknowledges it.
    fn on_close(&mut self) {
        if self.unsynced > 0 {
            let flushed = self.indices.iter_mut().try_for_each(|index| index.flush());
            match flushed {
                Ok(()) => {
                    self.acknowledge();
                }
                Err(err) => {
                    warn!(agent = %self.name, error = %err, "final flush failed");
                    self.on_failure(err);
                }
            }
        }
        self.completion.complete();
    }
}
