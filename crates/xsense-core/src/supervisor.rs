//! Bounded-retry attachment to an upstream peer.
//!
//! Devices and the Konfigurator both depend on exactly one Bridge. The
//! supervisor is a pure state machine: the owning role feeds it activation
//! and timer events together with whether a healthy peer is attached, and
//! applies the returned timer command.

use std::time::Duration;

use crate::config::retry;

/// Connection state of an instance towards its upstream peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Waiting for the next timed attempt; carries the failed attempt count.
    Retrying(u32),
    Connected,
    /// Attempts exhausted; only a manual activation retries again.
    Failed,
}

/// What the owner must do with its retry timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    Arm(Duration),
    Disarm,
    Keep,
}

/// Outcome of feeding one event to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: ConnectionState,
    pub timer: TimerCommand,
}

/// Connection supervisor.
#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    state: ConnectionState,
    attempts: u32,
    max_attempts: u32,
    interval: Duration,
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSupervisor {
    /// Create a supervisor with the default cap and interval.
    pub fn new() -> Self {
        Self::with_limits(retry::MAX_ATTEMPTS, retry::INTERVAL)
    }

    pub fn with_limits(max_attempts: u32, interval: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Rehydrate a persisted attempt counter.
    pub fn restore(&mut self, attempts: u32) {
        self.attempts = attempts.min(self.max_attempts);
        self.state = if self.attempts >= self.max_attempts {
            ConnectionState::Failed
        } else {
            ConnectionState::Disconnected
        };
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Handle activation (creation or applied configuration).
    pub fn activate(&mut self, attached: bool) -> Transition {
        if attached {
            return self.connected();
        }
        if self.attempts >= self.max_attempts {
            self.attempts = 0;
        }
        self.state = ConnectionState::Retrying(self.attempts);
        Transition {
            state: self.state,
            timer: TimerCommand::Arm(self.interval),
        }
    }

    /// Handle one retry timer tick.
    pub fn tick(&mut self, attached: bool) -> Transition {
        if attached {
            return self.connected();
        }
        if self.state == ConnectionState::Failed {
            return Transition {
                state: self.state,
                timer: TimerCommand::Disarm,
            };
        }

        self.attempts = (self.attempts + 1).min(self.max_attempts);
        if self.attempts >= self.max_attempts {
            self.state = ConnectionState::Failed;
            Transition {
                state: self.state,
                timer: TimerCommand::Disarm,
            }
        } else {
            self.state = ConnectionState::Retrying(self.attempts);
            Transition {
                state: self.state,
                timer: TimerCommand::Keep,
            }
        }
    }

    fn connected(&mut self) -> Transition {
        self.attempts = 0;
        self.state = ConnectionState::Connected;
        Transition {
            state: self.state,
            timer: TimerCommand::Disarm,
        }
    }
}

/// Pick the only healthy candidate; zero or several yield `None`.
pub fn select_peer<T, I>(candidates: I) -> Option<T>
where
    I: IntoIterator<Item = (T, bool)>,
{
    let mut healthy = candidates.into_iter().filter(|(_, ok)| *ok).map(|(c, _)| c);
    let first = healthy.next()?;
    if healthy.next().is_some() {
        return None;
    }
    Some(first)
}
