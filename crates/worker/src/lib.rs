//! Broker worker: consumes processing messages, runs the requested OCR-D
//! processor and reports the outcome on the result queue.

pub mod config;
pub mod handler;
pub mod processor;

pub use config::WorkerConfig;
pub use handler::ProcessingHandler;
pub use processor::{ProcessorError, ProcessorRunner};
