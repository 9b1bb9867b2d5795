//! The Ops Manager side: the documents of a project, how they are merged and how they are
//! read and written.

pub mod agent_config;
pub mod api;
pub mod automation_config;
pub mod backup;
pub mod client;
pub mod deployment;
pub mod lock;
pub mod mock;
pub mod process;
pub mod replica_set;
pub mod sharded_cluster;
