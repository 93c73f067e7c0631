//! Deployment webhook relay.
//!
//! This crate provides:
//! - HMAC-SHA256 signature verification for inbound provider events
//! - Event classification and dispatch (ping / workflow completion / other)
//! - The container redeployment state machine with rollback
//! - Real-time status fan-out to WebSocket observers
//! - HTTP status, analytics, and alert administration endpoints
//! - An append-only action log for the deployment audit trail

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod actions;
pub mod broadcast;
pub mod config;
pub mod deploy;
pub mod error;
pub mod server;
pub mod tasks;
pub mod webhooks;
pub mod ws;

pub use actions::{ActionLog, FileActionLog, NoopActionLog};
pub use broadcast::{Broadcaster, NotificationMessage};
pub use config::Config;
pub use deploy::{ComposeOrchestrator, ContainerOrchestrator, DeployState, Orchestrator};
pub use error::RelayError;
pub use server::{build_router, AppState};
pub use webhooks::{verify_signature, WebhookHeaders};
