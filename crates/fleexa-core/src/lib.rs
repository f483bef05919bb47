//! Core types shared across Fleexa crates.
//!
//! This crate holds the engine configuration, the common error type and the
//! event bus on which routing outcomes are published.

pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use event::{ChannelKind, EventMetadata, RoutingEvent};
pub use eventbus::{EventBus, SharedEventBus, Subscription};
