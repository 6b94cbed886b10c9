//! Homelink Core - shared configuration and protocol types
//!
//! This crate holds the pieces shared between the pairing subsystem and the
//! realtime server: service configuration and the JSON wire frames exchanged
//! over the realtime channel.

pub mod config;
pub mod protocol;

pub use config::Config;
pub use protocol::{EntityUpdate, Frame, ServiceCall};
