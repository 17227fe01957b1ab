//! Data model, error taxonomy, platform configuration, and wire messages
//! shared by every component of the RADICAL-Pilot agent.

pub mod config;
pub mod error;
pub mod message;
pub mod model;

pub use error::{Error, Result};
