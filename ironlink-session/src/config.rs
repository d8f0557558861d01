/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Session configuration.
//!
//! This module provides configuration options for iLink3-style sessions.

use ironlink_core::error::SessionError;
use ironlink_core::types::SessionIdentity;
use std::time::Duration;

/// Which side of the handshake a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Sends Negotiate and Establish and runs the retry policy.
    Initiator,
    /// Answers the counterparty's Negotiate and Establish.
    Acceptor,
}

impl SessionRole {
    /// Returns true for the initiating side.
    #[must_use]
    pub const fn is_initiator(self) -> bool {
        matches!(self, Self::Initiator)
    }
}

/// Configuration for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Logical session identity (the session uuid).
    pub identity: SessionIdentity,
    /// Handshake role.
    pub role: SessionRole,
    /// Number of Negotiate or Establish messages sent before giving up.
    pub max_handshake_attempts: u32,
    /// Time to wait for a handshake reply before retrying.
    pub retry_backoff: Duration,
    /// Keepalive interval.
    pub keepalive_interval: Duration,
    /// Time to wait for a Terminate acknowledgement.
    pub terminate_timeout: Duration,
    /// Messages committed during a retransmission that may be held back.
    pub hold_queue_capacity: usize,
}

impl SessionConfig {
    /// Creates a new session configuration with default timings.
    ///
    /// # Arguments
    /// * `identity` - The session identity
    /// * `role` - Whether this side initiates the handshake
    #[must_use]
    pub fn new(identity: SessionIdentity, role: SessionRole) -> Self {
        Self {
            identity,
            role,
            max_handshake_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            keepalive_interval: Duration::from_secs(30),
            terminate_timeout: Duration::from_secs(5),
            hold_queue_capacity: 1024,
        }
    }

    /// Sets the handshake attempt bound.
    #[must_use]
    pub const fn with_max_handshake_attempts(mut self, attempts: u32) -> Self {
        self.max_handshake_attempts = attempts;
        self
    }

    /// Sets the handshake retry backoff.
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Sets the keepalive interval.
    #[must_use]
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Sets the terminate acknowledgement timeout.
    #[must_use]
    pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    /// Sets the hold queue capacity.
    #[must_use]
    pub const fn with_hold_queue_capacity(mut self, capacity: usize) -> Self {
        self.hold_queue_capacity = capacity;
        self
    }

    /// Returns the keepalive interval in milliseconds.
    #[must_use]
    pub fn keepalive_interval_ms(&self) -> u64 {
        u64::try_from(self.keepalive_interval.as_millis()).unwrap_or(u64::MAX)
    }

    /// Checks the configuration for values a session cannot run with.
    ///
    /// # Errors
    /// Returns `SessionError::Configuration` describing the first bad value.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.max_handshake_attempts == 0 {
            return Err(SessionError::Configuration(
                "max_handshake_attempts must be at least 1".to_string(),
            ));
        }
        if self.keepalive_interval.is_zero() {
            return Err(SessionError::Configuration(
                "keepalive_interval must be positive".to_string(),
            ));
        }
        if self.hold_queue_capacity == 0 {
            return Err(SessionError::Configuration(
                "hold_queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_new() {
        let config = SessionConfig::new(SessionIdentity::new(42), SessionRole::Initiator);

        assert_eq!(config.identity, SessionIdentity::new(42));
        assert!(config.role.is_initiator());
        assert_eq!(config.max_handshake_attempts, 3);
        assert_eq!(config.retry_backoff, Duration::from_millis(200));
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.terminate_timeout, Duration::from_secs(5));
        assert_eq!(config.hold_queue_capacity, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_config_builders() {
        let config = SessionConfig::new(SessionIdentity::new(1), SessionRole::Acceptor)
            .with_max_handshake_attempts(5)
            .with_retry_backoff(Duration::from_millis(50))
            .with_keepalive_interval(Duration::from_secs(10))
            .with_terminate_timeout(Duration::from_secs(1))
            .with_hold_queue_capacity(8);

        assert!(!config.role.is_initiator());
        assert_eq!(config.max_handshake_attempts, 5);
        assert_eq!(config.keepalive_interval_ms(), 10_000);
        assert_eq!(config.hold_queue_capacity, 8);
    }

    #[test]
    fn test_session_config_validation() {
        let base = SessionConfig::new(SessionIdentity::new(1), SessionRole::Initiator);
        assert!(matches!(
            base.clone().with_max_handshake_attempts(0).validate(),
            Err(SessionError::Configuration(_))
        ));
        assert!(
            base.clone()
                .with_keepalive_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(base.with_hold_queue_capacity(0).validate().is_err());
    }
}
