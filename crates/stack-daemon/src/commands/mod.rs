//! CLI commands

pub mod client;
pub mod inspect;
pub mod metrics;
pub mod operations;
pub mod status;
pub mod validate;
pub mod watch;
