//! CLI commands

pub mod orphans;
pub mod run;
pub mod wait_nodes;
