//! Plan/act task coordination with human takeover.
//!
//! An [`orchestrator::Orchestrator`] asks a planner for the next directive,
//! applies it to an environment, and hands control to a human through an
//! [`portal::InterventionPortal`] when the planner or an operator asks for it.
//! [`runner::TaskRunner`] supervises one orchestrator per task and
//! [`executor::ExecutorService`] keeps the registry the host talks to.

pub mod cli;
pub mod config;
pub mod control;
pub mod display;
pub mod environment;
pub mod executor;
pub mod factory;
pub mod instrument;
pub mod log;
pub mod model;
pub mod notes;
pub mod notify;
pub mod orchestrator;
pub mod paths;
pub mod planner;
pub mod portal;
pub mod prompt;
pub mod runner;

#[cfg(test)]
mod testing;
