/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Error reporting for agents.
//!
//! Agents never stop on a recoverable error; they hand it to an
//! [`ErrorHandler`] and carry on with the next duty cycle.

use ironlink_core::error::IronLinkError;
use tracing::error;

/// Receives errors raised inside agent duty cycles.
pub trait ErrorHandler: Send + Sync {
    /// Called once per error.
    ///
    /// # Arguments
    /// * `agent` - Name of the agent that raised the error
    /// * `error` - The error
    fn on_error(&self, agent: &str, error: &IronLinkError);
}

/// Default handler that logs every error.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn on_error(&self, agent: &str, error: &IronLinkError) {
        error!(agent, error = %error, "agent error");
    }
}
