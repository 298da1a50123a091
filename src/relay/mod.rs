//! Relay core
//!
//! Everything between the transports: the upstream link state machine, the
//! consumer registry, routing and filtering, and the dead-letter buffer.
//!
//! # Upstream to consumers
//! ```text
//! upstream frame ──► Event::parse ──► lifecycle? ──► bot id + heartbeat
//!                                 ├─► echo known? ──► that consumer only
//!                                 └─► group allowed? ──► every consumer
//! ```
//!
//! # Consumers to upstream
//! ```text
//! consumer frame ──► Command::parse ──► group allowed? ──► register echo
//!                                                     └──► dead-letter gate ──► link
//! ```

pub mod auth;
pub mod config;
pub mod correlation;
pub mod dead_letter;
pub mod engine;
pub mod heartbeat;
pub mod link;
pub mod registry;
pub mod sender;

pub use auth::AuthFilter;
pub use config::RelayConfig;
pub use correlation::CorrelationRouter;
pub use dead_letter::{DeadLetterBuffer, Drain, Forward};
pub use engine::RelayEngine;
pub use heartbeat::HeartbeatMonitor;
pub use link::{LinkId, LinkManager, LinkState, UpstreamLink};
pub use registry::{Consumer, ConsumerId, ConsumerRegistry};
pub use sender::{BoundedSender, SendError};
