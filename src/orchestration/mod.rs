//! Task orchestration.
//!
//! [`fabric::Fabric`] owns the agents and runs tasks. The
//! [`coordinator::Coordinator`] strategy drives each task through
//! delegation, the [`pending`] collection barrier, synthesis and critique.
//! [`routing`] picks specialists and [`cancel`] stops abandoned work.

pub mod cancel;
pub mod coordinator;
pub mod fabric;
pub mod pending;
pub mod routing;
