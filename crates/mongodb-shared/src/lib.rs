//! This crate contains various shared helpers and utilities used across other crates in this
//! workspace. Nothing in here knows about MongoDB deployments.

pub mod document;
pub mod merge;
pub mod retry;
