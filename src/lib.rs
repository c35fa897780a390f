//! ISTA Meter Sync Library
//!
//! This library logs in to an ISTA online account, pulls the account profile and
//! meter list on each refresh cycle, and projects the meters into a stable set of
//! logical sensors for a host platform.

pub mod config;
pub mod fetchers;
pub mod ista_api;
pub mod models;
pub mod sensors;
pub mod token;
pub mod update_coordinator;

// Re-export commonly used types for easier access
pub use config::{CountryTable, Credentials, Settings};
pub use ista_api::IstaAPI;
pub use sensors::{EntityProjection, LogicalSensor, SensorState, SensorValue};
pub use token::{TokenError, TokenResult, TokenSuccess};
pub use update_coordinator::{RefreshError, RefreshSnapshot, Stage, UpdateCoordinator};
