//! pulse-discovery: what runs where
//!
//! Docker containers from the fleet snapshot are classified by an LLM
//! [`Analyzer`]; confident results become [`DiscoveredApp`]s and
//! infrastructure notes on their host. Only Docker containers are analyzed.

pub mod analysis;
pub mod sanitize;
pub mod service;

pub use analysis::{parse_response, DiscoveryResult};
pub use sanitize::ContainerInfo;
pub use service::{Analyzer, DiscoveredApp, DiscoveryConfig, DiscoveryService, DiscoveryStatus};
