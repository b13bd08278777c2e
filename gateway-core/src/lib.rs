//! Core domain types, error taxonomy, and scheduling config shared by every
//! `gateway-*` crate.

pub mod error;
pub mod scheduling;
pub mod types;

pub use error::{ErrorEnvelope, ErrorKind, FailureDisposition, GatewayError};
pub use scheduling::{ConnectionPoolIsolation, GatewaySchedulingConfig};
pub use types::*;
