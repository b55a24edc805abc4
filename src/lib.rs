//! Orchestration core for a multi-agent build pipeline.
//!
//! The crate drives a fixed, ordered sequence of phases, routes work units to
//! the agents responsible for each phase over a uniform transport contract,
//! coordinates their artifacts into the inputs of the next phase, and
//! surfaces failures, retries, and human-approval gates.

pub mod bus;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod decision;
pub mod errors;
pub mod exec;
pub mod plan;
pub mod report;
pub mod schema;
pub mod store;
pub mod tracker;
pub mod workflow;
