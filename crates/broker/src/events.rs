//! Connection lifecycle events emitted by the
//! [`BrokerConnector`](crate::connector::BrokerConnector).
//!
//! Subscribe with [`BrokerConnector::subscribe`](crate::connector::BrokerConnector::subscribe).

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BrokerEvent {
    /// A connection and its channel are set up. `generation` counts
    /// sessions since start.
    Connected { generation: u64 },

    /// The session was lost without `stop()` being called.
    Disconnected { generation: u64, reason: String },

    /// A connection attempt failed. `attempt` counts consecutive failures.
    ConnectAttemptFailed { attempt: u32, error: String },

    /// Waiting `delay_ms` before the next attempt.
    Reconnecting { attempt: u32, delay_ms: u64 },

    /// Reconnection is disabled for good.
    Stopped { reason: StopReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// `stop()` was called.
    Requested,
    /// The consecutive attempt ceiling was reached.
    AttemptsExhausted,
}
