pub mod config;
pub mod error;
pub mod execution;
pub mod job;
pub mod packaging;
pub mod resource;
pub mod resource_store;
pub mod types;
