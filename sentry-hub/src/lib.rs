//! # sentry-hub
//!
//! Client side of the Sentry wearable: turns fragmented radio notifications
//! into readings, keeps the link alive across drops, detects crashes locally
//! and escalates them to the confirmation service under a cooldown.
//!
//! Start with [`pipeline::SentryPipeline`]; the stages underneath are usable
//! on their own.

pub mod audit;
pub mod config;
pub mod connection;
pub mod detector;
pub mod distribution;
pub mod error;
pub mod escalation;
pub mod handlers;
pub mod lifecycle;
pub mod monitor;
pub mod persistence;
pub mod pipeline;
pub mod radio;
pub mod reassembly;
pub mod transport;

pub use error::HubError;
pub use pipeline::{PipelineConfig, SentryPipeline};
