//! Stacks contract deployment orchestrator.
//!
//! Discovers Clarity contracts, orders them by dependency and category,
//! and deploys them in dependency-safe batches as community funding unlocks
//! successive phases.

pub mod api;
pub mod chain;
pub mod compiler;
pub mod config;
pub mod contract;
pub mod db;
pub mod errors;
pub mod events;
pub mod funding;
pub mod monitor;
pub mod orchestrator;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod signer;
pub mod submitter;

#[cfg(test)]
pub(crate) mod test_support;
