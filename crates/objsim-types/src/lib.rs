//! Shared types for the objsim workspace.
//!
//! Both the orchestrator and the worker runtime depend on this crate, so the
//! types that cross the process boundary live here.
//!
//! ## Modules
//!
//! - [`names`] - canonical test identifiers and member-name helpers
//! - [`snapshot`] - captured object state and the distance metric over it
//! - [`protocol`] - worker requests and the tagged reply messages

pub mod names;
pub mod protocol;
pub mod snapshot;

pub use names::{split_member_name, NameError, TestId};
pub use protocol::{
    CaptureRequest, CaptureTarget, DiscoveryRequest, DomainKind, ProtocolError, WorkerExitCode,
    WorkerMessage, WorkerRequest,
};
pub use snapshot::{ExitSnapshot, FieldWhitelist, Snapshot, StateDistance, StructuralDistance};
