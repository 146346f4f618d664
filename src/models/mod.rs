//! Domain models for gatekeeper
//!
//! This module contains the records exchanged between the services and
//! their storage collaborators.

pub mod audit;
pub mod credential;
pub mod second_factor;
pub mod session;

// Re-export commonly used types
pub use audit::{ActionLog, AuditEvent, BlockRecord, LoginLog};
pub use credential::{Credential, Principal, Role};
pub use second_factor::{
    SecondFactorEnrollment, SecondFactorProfile, SecondFactorState, SecondFactorStatus,
};
pub use session::Session;
