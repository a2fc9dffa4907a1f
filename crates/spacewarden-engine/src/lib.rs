//! # spacewarden-engine
//!
//! The core of the bot: the reconciliation engine that turns membership
//! events and periodic triggers into invite intents, the dispatcher that
//! drains the invite queue against the homeserver, and the command gateway
//! that wires parsing, authorization, and store mutation together.
//!
//! The homeserver itself is an external collaborator behind the
//! [`Homeserver`] trait; everything here is testable against a mock.

pub mod client;
pub mod dispatch;
pub mod events;
pub mod gateway;
pub mod reconcile;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{ClientError, Homeserver};
pub use dispatch::{DispatcherConfig, InviteDispatcher};
pub use events::ChatEvent;
pub use gateway::{CommandGateway, GatewayConfig};
pub use reconcile::{Engine, EngineConfig};
