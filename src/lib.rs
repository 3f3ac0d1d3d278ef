//! objsim: patch prioritization by object-state similarity
//!
//! Given candidate patches for a Java program (replacement class files plus
//! the methods they change), objsim runs the covering tests against the
//! original and the patched program, captures the object state observed at
//! every exit of the patched methods, and ranks the patches by how their
//! captured state moves away from the original:
//!
//! - failing tests should change (a fix must do something different there)
//! - passing tests should not (a fix must not break what already works)
//!
//! Tests execute in short-lived worker processes. See [`session`] for the
//! orchestrator side of that channel, [`worker`] for the worker side, and
//! [`pipeline`] for one complete evaluation run.

#![allow(clippy::result_large_err)]

pub mod class_file;
pub mod config;
pub mod distance;
pub mod errors;
pub mod index_domain;
pub mod input;
pub mod logging;
pub mod paths;
pub mod patcher;
pub mod pipeline;
pub mod profiler;
pub mod ranking;
pub mod report;
pub mod session;
pub mod worker;

pub use objsim_types as types;
