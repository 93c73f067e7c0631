//! Active/standby failover controller for the deploy relay.
//!
//! An independent service that probes both relay instances, decides which
//! one should receive provider webhooks, and repoints the webhook endpoint
//! through the provider's API when the active instance changes.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod controller;
pub mod health;
pub mod registry;
pub mod server;

pub use controller::{
    ActiveInstance, Controller, ControllerConfig, ControllerStatus, FailoverEvent, ManualOutcome,
    TransitionDirection,
};
pub use health::{HealthProbe, InstanceStatus, ProbeResult, ServerHealthRecord};
pub use registry::{GitHubWebhookRegistry, WebhookEndpointRegistry};
pub use server::admin_router;
