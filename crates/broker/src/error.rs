use ocrd_core::error::CoreError;

use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Consecutive connection attempts reached the configured ceiling.
    #[error("Gave up connecting to the broker after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },

    #[error("Broker connector is stopped")]
    Stopped,

    #[error("No open broker channel")]
    NotConnected,

    #[error("Message serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Timed out waiting for the broker")]
    Timeout,

    /// The broker nacked a publish.
    #[error("Broker rejected the message")]
    Rejected,
}

impl From<BrokerError> for CoreError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::AttemptsExhausted { .. } => CoreError::BrokerConnection(err.to_string()),
            BrokerError::Serialize(e) => CoreError::Internal(e.to_string()),
            other => CoreError::JobDispatch(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn exhausted_maps_to_broker_connection() {
        let err: CoreError = BrokerError::AttemptsExhausted { attempts: 3 }.into();
        assert_matches!(err, CoreError::BrokerConnection(msg) if msg.contains("3 attempts"));
    }

    #[test]
    fn transport_failure_maps_to_dispatch() {
        let err: CoreError = BrokerError::from(TransportError::ChannelClosed).into();
        assert_matches!(err, CoreError::JobDispatch(_));
    }
}
