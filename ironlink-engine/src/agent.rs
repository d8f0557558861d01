/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Duty-cycle agents and their runner.
//!
//! An [`Agent`] does a bounded amount of non-blocking work per call to
//! [`Agent::do_work`] and reports how much it did. The [`AgentRunner`] calls
//! it in a loop on a tokio task, backing off while it is idle, until the
//! handle asks it to stop.

use crate::error_handler::ErrorHandler;
use ironlink_core::error::IronLinkError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info};

/// A unit of work that is polled repeatedly.
pub trait Agent: Send {
    /// Returns the agent name used in logs and error reports.
    fn role_name(&self) -> &str;

    /// Performs one duty cycle.
    ///
    /// Returns the amount of work done; zero means idle.
    ///
    /// # Errors
    /// Returns an error the runner hands to its [`ErrorHandler`].
    fn do_work(&mut self) -> Result<usize, IronLinkError>;

    /// Called once when the runner stops.
    fn on_close(&mut self) {}
}

impl<A: Agent + ?Sized> Agent for Box<A> {
    fn role_name(&self) -> &str {
        (**self).role_name()
    }

    fn do_work(&mut self) -> Result<usize, IronLinkError> {
        (**self).do_work()
    }

    fn on_close(&mut self) {
        (**self).on_close();
    }
}

/// Several agents run as one, in registration order.
pub struct CompositeAgent {
    name: String,
    agents: Vec<Box<dyn Agent>>,
}

impl CompositeAgent {
    /// Creates an empty composite.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agents: Vec::new(),
        }
    }

    /// Adds an agent.
    #[must_use]
    pub fn with_agent(mut self, agent: impl Agent + 'static) -> Self {
        self.push(agent);
        self
    }

    /// Adds an agent.
    pub fn push(&mut self, agent: impl Agent + 'static) {
        self.agents.push(Box::new(agent));
    }

    /// Returns the number of agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Returns true if no agent was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for CompositeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.agents.iter().map(|agent| agent.role_name()).collect();
        f.debug_struct("CompositeAgent")
            .field("name", &self.name)
            .field("agents", &names)
            .finish()
    }
}

impl Agent for CompositeAgent {
    fn role_name(&self) -> &str {
        &self.name
    }

    /// Runs every agent once; the first error is returned after all ran.
    fn do_work(&mut self) -> Result<usize, IronLinkError> {
        let mut work = 0;
        let mut first_error = None;
        for agent in &mut self.agents {
            match agent.do_work() {
                Ok(done) => work += done,
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(work),
        }
    }

    fn on_close(&mut self) {
        for agent in &mut self.agents {
            agent.on_close();
        }
    }
}

/// Exponential backoff between idle duty cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleStrategy {
    /// First sleep after work stops.
    pub min: Duration,
    /// Longest sleep.
    pub max: Duration,
}

impl IdleStrategy {
    /// Creates a strategy sleeping between `min` and `max`.
    #[must_use]
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// Returns the sleep following one of `previous`.
    #[must_use]
    pub fn next(&self, previous: Duration) -> Duration {
        if previous.is_zero() {
            self.min
        } else {
            previous.saturating_mul(2).clamp(self.min, self.max)
        }
    }
}

impl Default for IdleStrategy {
    fn default() -> Self {
        Self::new(Duration::from_micros(100), Duration::from_millis(10))
    }
}

/// Spawns agents onto tokio tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentRunner;

impl AgentRunner {
    /// Starts `agent` on a new task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<A: Agent + 'static>(
        agent: A,
        idle: IdleStrategy,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> AgentHandle<A> {
        let (shutdown, signal) = watch::channel(false);
        let name = agent.role_name().to_string();
        info!(agent = %name, "agent started");
        let task = tokio::spawn(run(agent, idle, error_handler, signal));
        AgentHandle {
            name,
            shutdown,
            task,
        }
    }
}

async fn run<A: Agent>(
    mut agent: A,
    idle: IdleStrategy,
    error_handler: Arc<dyn ErrorHandler>,
    mut signal: watch::Receiver<bool>,
) -> A {
    let mut sleep = Duration::ZERO;
    while !*signal.borrow() {
        let work = match agent.do_work() {
            Ok(work) => work,
            Err(err) => {
                error_handler.on_error(agent.role_name(), &err);
                0
            }
        };

        if work > 0 {
            sleep = Duration::ZERO;
            tokio::task::yield_now().await;
            continue;
        }

        sleep = idle.next(sleep);
        tokio::select! {
            () = tokio::time::sleep(sleep) => {}
            changed = signal.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    agent.on_close();
    debug!(agent = agent.role_name(), "agent stopped");
    agent
}

/// Handle to a running agent.
#[derive(Debug)]
pub struct AgentHandle<A> {
    name: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<A>,
}

impl<A> AgentHandle<A> {
    /// Returns the agent name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true once the agent task finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the agent after its current duty cycle and returns it.
    ///
    /// # Errors
    /// Returns `JoinError` if the agent task panicked.
    pub async fn shutdown(self) -> Result<A, JoinError> {
        let _ = self.shutdown.send(true);
        let agent = self.task.await?;
        info!(agent = %self.name, "agent shut down");
        Ok(agent)
    }
}
