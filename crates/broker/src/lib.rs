pub mod amqp;
pub mod config;
pub mod connector;
pub mod consumer;
pub mod error;
pub mod events;
pub mod memory;
pub mod messages;
pub mod publisher;
pub mod reconnect;
pub mod transport;

pub use config::BrokerConfig;
pub use connector::{BrokerConnector, ConnectionState, HookId, Session, SessionHook};
pub use consumer::{Consumer, Delivery, DeliveryHandler};
pub use error::BrokerError;
pub use events::BrokerEvent;
pub use publisher::{PublishStats, Publisher};
