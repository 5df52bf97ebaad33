//! Meshcast Core Library
//!
//! Shared functionality for meshcast components:
//! - In-process topic/detail broker for component decoupling
//! - In-memory relational store of channels, clients, and connections
//! - Internal event messages and the client wire protocol
//! - Configuration and common error types

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod message;
pub mod tracing_init;
pub mod wire;

pub use config::Config;
pub use error::{Error, Result};
