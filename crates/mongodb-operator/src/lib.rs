//! Keeps MongoDB deployments managed by Ops Manager in the desired state.
//!
//! The desired topology (standalones, replica sets and sharded clusters) is merged into the
//! project's deployment document without disturbing the fields Ops Manager, its UI or the
//! agents own. Authentication changes are rolled out step by step, waiting for the agents in
//! between.

pub mod authentication;
pub mod cli;
pub mod logging;
pub mod om;
pub mod reconcile;
