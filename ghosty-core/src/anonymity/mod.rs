//! Anonymity network: system service, circuit rotation and control channel

pub mod control;
pub mod manager;

pub use control::ControlConnection;
pub use manager::{AnonymityManager, AnonymityResult, AnonymityStatus, ServiceStatus};
